#![warn(rust_2018_idioms)]
#![warn(missing_docs)]

//! A pull-based incremental recomputation engine.
//!
//! Inputs ([`Signal`]) are set by the host application; derived values
//! ([`Memo`], [`MemoMap`]) are computed from them and from each other.
//! Reads are lazy: a `Memo` only recomputes when something it actually
//! depends on has changed since it was last verified, and a value that
//! recomputes to something equal to what it already held (*backdating*)
//! stops that change from propagating any further downstream. See
//! [`Runtime`] for the revision clock and cell store this all sits on top
//! of, and [`Runtime::batch`] for grouping several `Signal` writes into
//! one atomic commit.

mod cell;
mod cycle;
mod durability;
mod memo;
mod memo_map;
mod revision;
mod runtime;
mod signal;
mod tracked_cell;
mod verifier;

pub use crate::cell::{CellId, CellInfo, CellKind};
pub use crate::cycle::CycleError;
pub use crate::durability::Durability;
pub use crate::memo::Memo;
pub use crate::memo_map::MemoMap;
pub use crate::revision::Revision;
pub use crate::runtime::{Runtime, RuntimeId};
pub use crate::signal::Signal;
pub use crate::tracked_cell::{TrackedCell, TrackedStruct};

/// A host type that embeds a [`Runtime`]. Implementing this is the only
/// requirement this crate places on an application's "database" type;
/// everything else (what cells exist, what they compute) is ordinary
/// application code built on `Signal`/`Memo`/`MemoMap`.
pub trait Database {
    /// The runtime this database embeds.
    fn runtime(&self) -> &Runtime;
}

/// Convenience constructor: `Signal::new(db.runtime().clone(), ..)`.
pub fn create_signal<T: PartialEq + Clone + 'static>(
    db: &dyn Database,
    value: T,
    durability: Durability,
    label: Option<String>,
) -> Signal<T> {
    Signal::new(db.runtime().clone(), value, durability, label)
}

/// Convenience constructor: `Memo::new(db.runtime().clone(), ..)`.
pub fn create_memo<T: PartialEq + Clone + 'static>(
    db: &dyn Database,
    compute: impl Fn() -> T + 'static,
    label: Option<String>,
) -> Memo<T> {
    Memo::new(db.runtime().clone(), compute, label)
}

/// Convenience constructor: `MemoMap::new(db.runtime().clone(), ..)`.
pub fn create_memo_map<K, V>(
    db: &dyn Database,
    compute: impl Fn(K) -> V + 'static,
    label: Option<String>,
) -> MemoMap<K, V>
where
    K: Eq + std::hash::Hash + Clone + 'static,
    V: PartialEq + Clone + 'static,
{
    MemoMap::new(db.runtime().clone(), compute, label)
}

/// Convenience wrapper: `db.runtime().batch(body)`.
pub fn batch(db: &dyn Database, body: impl FnOnce()) {
    db.runtime().batch(body);
}

/// Convenience wrapper: `db.runtime().batch_result(body)`.
pub fn batch_result<E>(db: &dyn Database, body: impl FnOnce() -> Result<(), E>) -> Result<(), E> {
    db.runtime().batch_result(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestDatabase {
        rt: Runtime,
    }

    impl Database for TestDatabase {
        fn runtime(&self) -> &Runtime {
            &self.rt
        }
    }

    #[test]
    fn convenience_constructors_delegate_to_the_runtime() {
        let db = TestDatabase { rt: Runtime::new() };

        let counter = create_signal(&db, 1, Durability::Low, Some("counter".into()));
        let doubled_counter = counter.clone();
        let doubled = create_memo(&db, move || doubled_counter.get() * 2, Some("doubled".into()));
        assert_eq!(doubled.get(), 2);

        counter.set(5);
        assert_eq!(doubled.get(), 10);

        let base_for_map = counter.clone();
        let map = create_memo_map(&db, move |k: i64| base_for_map.get() + k, None);
        assert_eq!(map.get(1), 6);

        let committed = std::rc::Rc::new(std::cell::Cell::new(0));
        let committed_clone = committed.clone();
        db.runtime().set_on_change(move || committed_clone.set(committed_clone.get() + 1));

        batch(&db, || {
            counter.set(7);
        });
        assert_eq!(committed.get(), 1);
    }
}
