use std::cell::RefCell;
use std::rc::Rc;

use crate::cell::{CellId, CellKind, CommitPending};
use crate::cycle::CycleError;
use crate::durability::Durability;
use crate::runtime::Runtime;

struct SignalInner<T> {
    value: T,
    pending_value: Option<T>,
    pending_unconditional: bool,
}

/// An input cell: a value supplied by the host application, read by
/// Memos and compared for equality on every write.
pub struct Signal<T> {
    rt: Runtime,
    id: CellId,
    durability: Durability,
    inner: Rc<RefCell<SignalInner<T>>>,
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Signal {
            rt: self.rt.clone(),
            id: self.id,
            durability: self.durability,
            inner: self.inner.clone(),
        }
    }
}

impl<T: PartialEq + Clone + 'static> Signal<T> {
    /// Allocates a new input cell holding `value`, with the given
    /// durability classification and optional diagnostic label.
    pub fn new(rt: Runtime, value: T, durability: Durability, label: Option<String>) -> Self {
        let id = rt.allocate_cell(CellKind::Input, durability, label);
        log::debug!("Signal::new {:?} durability={:?}", id, durability);
        Signal {
            rt,
            id,
            durability,
            inner: Rc::new(RefCell::new(SignalInner {
                value,
                pending_value: None,
                pending_unconditional: false,
            })),
        }
    }

    /// This signal's opaque cell identifier.
    pub fn id(&self) -> CellId {
        self.id
    }

    /// The durability classification this signal was created with.
    pub fn durability(&self) -> Durability {
        self.durability
    }

    /// Reads the currently committed value. Inside a batch this observes
    /// the pre-batch value, never an uncommitted pending write.
    pub fn get(&self) -> T {
        let value = self.inner.borrow().value.clone();
        self.rt.record_dependency(self.id);
        value
    }

    /// As [`Signal::get`], but `Result`-wrapped for API symmetry with
    /// [`crate::Memo::get_result`]. A `Signal` read can never fail: this
    /// always returns `Ok`.
    pub fn get_result(&self) -> Result<T, CycleError> {
        Ok(self.get())
    }

    /// Writes `v`. Outside a batch, commits immediately (bumping the
    /// revision) iff `v` differs from the current value under `PartialEq`.
    /// Inside a batch, records `v` as this cell's pending write; the
    /// actual commit (and its own equality check against the pre-batch
    /// value) happens when the outermost batch completes.
    pub fn set(&self, v: T) {
        self.write(v, false);
    }

    /// As [`Signal::set`], but always records a change regardless of
    /// equality with the current value.
    pub fn set_unconditional(&self, v: T) {
        self.write(v, true);
    }

    fn write(&self, v: T, unconditional: bool) {
        if !self.rt.is_batching() {
            self.commit_direct(v, unconditional);
            return;
        }

        let (prior_pending, prior_unconditional) = {
            let inner = self.inner.borrow();
            (inner.pending_value.clone(), inner.pending_unconditional)
        };
        {
            let mut inner = self.inner.borrow_mut();
            inner.pending_value = Some(v);
            inner.pending_unconditional = unconditional || inner.pending_unconditional;
        }
        self.install_commit_closure();

        let inner_for_undo = self.inner.clone();
        self.rt.batch_register_write(self.id, move || {
            let inner_for_undo = inner_for_undo.clone();
            let prior_pending = prior_pending.clone();
            let restore: Box<dyn FnMut()> = Box::new(move || {
                let mut s = inner_for_undo.borrow_mut();
                s.pending_value = prior_pending.clone();
                s.pending_unconditional = prior_unconditional;
            });
            restore
        });
    }

    fn commit_direct(&self, v: T, unconditional: bool) {
        let changed = {
            let mut inner = self.inner.borrow_mut();
            let changed = unconditional || inner.value != v;
            if changed {
                inner.value = v;
            }
            changed
        };
        if changed {
            self.rt.advance_revision(self.durability);
            self.rt.mark_input_changed(self.id);
            self.rt.fire_cell_on_change(self.id);
            self.rt.schedule_global_on_change();
        }
    }

    /// Installs (or refreshes) this cell's type-erased `commit_pending`
    /// closure. Called on every batched write since the runtime clears
    /// `commit_pending` after each commit.
    fn install_commit_closure(&self) {
        let inner = self.inner.clone();
        let commit: CommitPending = Box::new(move || {
            let mut s = inner.borrow_mut();
            match s.pending_value.take() {
                None => false,
                Some(new_value) => {
                    let changed = s.pending_unconditional || s.value != new_value;
                    s.value = new_value;
                    s.pending_unconditional = false;
                    changed
                }
            }
        });
        self.rt.set_commit_pending(self.id, commit);
    }

    /// Registers a per-cell observer, fired once whenever this signal's
    /// value actually commits a change.
    pub fn on_change(&self, f: impl FnMut() + 'static) {
        self.rt.set_on_change_for(self.id, Some(Box::new(f)));
    }

    /// Removes this signal's per-cell observer, if any.
    pub fn clear_on_change(&self) {
        self.rt.set_on_change_for(self.id, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_value_write_is_a_no_op() {
        let rt = Runtime::new();
        let sig = Signal::new(rt.clone(), 4, Durability::Low, None);
        let before = rt.current_revision();
        sig.set(4);
        assert_eq!(rt.current_revision(), before);
        sig.set(5);
        assert!(rt.current_revision() > before);
    }

    #[test]
    fn set_unconditional_always_bumps() {
        let rt = Runtime::new();
        let sig = Signal::new(rt.clone(), 4, Durability::Low, None);
        let before = rt.current_revision();
        sig.set_unconditional(4);
        assert!(rt.current_revision() > before);
    }

    #[test]
    fn batch_revert_yields_zero_bumps() {
        let rt = Runtime::new();
        let sig = Signal::new(rt.clone(), 0, Durability::Low, None);
        let before = rt.current_revision();

        let fired = Rc::new(RefCell::new(0));
        let fired_clone = fired.clone();
        sig.on_change(move || *fired_clone.borrow_mut() += 1);

        rt.batch(|| {
            sig.set(5);
            sig.set(0);
        });

        assert_eq!(rt.current_revision(), before);
        assert_eq!(*fired.borrow(), 0);
        assert_eq!(sig.get(), 0);
    }

    #[test]
    fn batch_rollback_restores_pending_state() {
        let rt = Runtime::new();
        let sig = Signal::new(rt.clone(), 1, Durability::Low, None);

        let result: Result<(), &'static str> = rt.batch_result(|| {
            sig.set(2);
            Err("boom")
        });
        assert!(result.is_err());
        assert_eq!(sig.get(), 1);

        // A subsequent, independent batch still commits normally.
        rt.batch(|| sig.set(3));
        assert_eq!(sig.get(), 3);
    }

    #[test]
    fn get_result_always_succeeds() {
        let rt = Runtime::new();
        let sig = Signal::new(rt, 7, Durability::Low, None);
        assert_eq!(sig.get_result(), Ok(7));
    }

    #[test]
    fn outer_rollback_after_nested_batch_clears_pending_value() {
        let rt = Runtime::new();
        let sig = Signal::new(rt.clone(), 1, Durability::Low, None);

        let result: Result<(), &'static str> = rt.batch_result(|| {
            // Only the outermost batch ever actually commits, so this
            // inner batch just pops its own rollback frame; the outer
            // frame must still have captured its own undo for `sig`.
            rt.batch(|| sig.set(2));
            sig.set(99);
            Err("boom")
        });

        assert!(result.is_err());
        assert_eq!(sig.get(), 1, "outer rollback must restore the pre-batch value");

        // A subsequent, independent batch must start from a clean pending
        // state rather than replaying the rolled-back write.
        rt.batch(|| sig.set(5));
        assert_eq!(sig.get(), 5);
    }
}
