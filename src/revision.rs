use std::fmt;
use std::num::NonZeroUsize;

/// A logical clock identifying the commit epoch of the most recent input
/// change. Revisions are totally ordered and strictly monotonic: the
/// runtime's current revision never decreases, and neither does any cell's
/// `changed_at`/`verified_at`.
///
/// We store `1 + generation` internally (as a `NonZeroUsize`) so that
/// `Option<Revision>` is no larger than `Revision` itself.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Revision(NonZeroUsize);

impl Revision {
    /// The revision a fresh `Runtime` starts at.
    pub(crate) fn start() -> Self {
        Self(NonZeroUsize::new(1).unwrap())
    }

    /// The next revision after this one.
    pub(crate) fn next(self) -> Self {
        Self(NonZeroUsize::new(self.0.get() + 1).unwrap())
    }
}

impl fmt::Debug for Revision {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "R{}", self.0.get() - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_then_next_is_strictly_increasing() {
        let r0 = Revision::start();
        let r1 = r0.next();
        let r2 = r1.next();
        assert!(r0 < r1);
        assert!(r1 < r2);
    }
}
