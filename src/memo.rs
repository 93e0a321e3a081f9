use std::cell::RefCell;
use std::rc::Rc;

use crate::cell::{CellId, CellKind, RecomputeAndCheck};
use crate::cycle::CycleError;
use crate::durability::Durability;
use crate::revision::Revision;
use crate::runtime::Runtime;
use crate::verifier;

struct MemoInner<T> {
    compute: Box<dyn Fn() -> T>,
    cache: RefCell<Option<T>>,
}

/// A derived cell: its value is produced by a compute closure over other
/// cells, cached, and only recomputed when the verifier concludes a
/// dependency has actually changed.
pub struct Memo<T> {
    rt: Runtime,
    id: CellId,
    inner: Rc<MemoInner<T>>,
}

impl<T> Clone for Memo<T> {
    fn clone(&self) -> Self {
        Memo {
            rt: self.rt.clone(),
            id: self.id,
            inner: self.inner.clone(),
        }
    }
}

impl<T: PartialEq + Clone + 'static> Memo<T> {
    /// Builds a new, uncomputed Memo. The compute closure is not invoked
    /// until the first `get`/`get_result` call.
    pub fn new(rt: Runtime, compute: impl Fn() -> T + 'static, label: Option<String>) -> Self {
        let id = rt.allocate_cell(CellKind::Derived, Durability::High, label);
        let inner = Rc::new(MemoInner {
            compute: Box::new(compute),
            cache: RefCell::new(None),
        });
        let memo = Memo { rt, id, inner };
        memo.install_recompute_closure();
        memo
    }

    fn install_recompute_closure(&self) {
        let rt = self.rt.clone();
        let id = self.id;
        let inner = self.inner.clone();
        let closure: RecomputeAndCheck = Box::new(move || force_recompute(&rt, id, &inner));
        self.rt.set_recompute_and_check(id, closure);
    }

    /// This memo's opaque cell identifier.
    pub fn id(&self) -> CellId {
        self.id
    }

    /// The minimum durability across this memo's dependencies as of its
    /// most recent computation (`High` if it has none yet).
    pub fn durability(&self) -> Durability {
        self.rt.durability_of(self.id)
    }

    /// The revision at which this memo's cached value last actually
    /// changed (as opposed to being backdated).
    pub fn changed_at(&self) -> Revision {
        self.rt.changed_at(self.id)
    }

    /// The revision as of which this memo was last confirmed up to date,
    /// whether by recomputing or by the verifier finding nothing changed.
    pub fn verified_at(&self) -> Revision {
        self.rt.verified_at(self.id)
    }

    /// The cells this memo read on its most recent computation, in the
    /// order each was first read.
    pub fn dependencies(&self) -> Vec<CellId> {
        self.rt.dependencies_of(self.id)
    }

    /// Whether this memo has already been verified as of the current
    /// revision, i.e. a read right now would not need to walk its
    /// dependencies at all.
    pub fn is_up_to_date(&self) -> bool {
        self.rt.verified_at(self.id) == self.rt.current_revision()
    }

    /// Reads the memo's value, aborting the process with a formatted
    /// cycle path if this read discovers a self-dependency. Use
    /// [`Memo::get_result`] to handle cycles instead.
    pub fn get(&self) -> T {
        match self.get_result() {
            Ok(value) => value,
            Err(err) => panic!("cycle detected: {}", err.format_path(&self.rt)),
        }
    }

    /// Implements the read protocol: first-time computation, the
    /// "already verified this revision" fast path, or a call into the
    /// verifier — then returns the (possibly just
    /// refreshed) cached value. A dependency edge is recorded on the
    /// enclosing tracking frame only after a successful read, so a
    /// cycle never accretes a spurious self-loop.
    pub fn get_result(&self) -> Result<T, CycleError> {
        let current = self.rt.current_revision();

        if self.inner.cache.borrow().is_none() {
            force_recompute(&self.rt, self.id, &self.inner)?;
        } else if self.rt.verified_at(self.id) != current {
            verifier::maybe_changed_after(&self.rt, self.id, self.rt.verified_at(self.id))?;
        }

        let value = self
            .inner
            .cache
            .borrow()
            .clone()
            .expect("memo cache populated after recompute/verify");
        self.rt.record_dependency(self.id);
        Ok(value)
    }

    /// Registers a per-cell observer, fired once whenever this memo
    /// recomputes to a value that actually differs from what it held.
    pub fn on_change(&self, f: impl FnMut() + 'static) {
        self.rt.set_on_change_for(self.id, Some(Box::new(f)));
    }

    /// Removes this memo's per-cell observer, if any.
    pub fn clear_on_change(&self) {
        self.rt.set_on_change_for(self.id, None);
    }
}

/// The recompute procedure, shared by first-read and by the verifier's
/// "any dependency changed" path. Generic over `T` and
/// monomorphized once per Memo's value type; the type-erased
/// `recompute_and_check` closure stored on `CellMeta` simply calls this
/// with its captured `Rc<MemoInner<T>>`.
pub(crate) fn force_recompute<T: PartialEq + Clone + 'static>(
    rt: &Runtime,
    id: CellId,
    inner: &Rc<MemoInner<T>>,
) -> Result<bool, CycleError> {
    if rt.is_in_progress(id) {
        let stack = rt.tracking_stack_ids();
        return Err(CycleError::from_tracking_stack(&stack, id));
    }
    rt.set_in_progress(id, true);

    let previous = inner.cache.borrow().clone();

    rt.push_tracking(id);
    let new_value = (inner.compute)();
    let deps = rt.pop_tracking();

    let durability = deps
        .iter()
        .map(|dep| rt.durability_of(*dep))
        .min()
        .unwrap_or(Durability::High);
    rt.set_durability(id, durability);
    rt.set_dependencies(id, deps);

    let current = rt.current_revision();
    let unchanged = matches!(&previous, Some(p) if *p == new_value);
    *inner.cache.borrow_mut() = Some(new_value);

    if unchanged {
        log::trace!("memo {:?}: backdated, changed_at preserved", id);
        rt.set_verified_at(id, current);
    } else {
        rt.set_changed_at(id, current);
        rt.set_verified_at(id, current);
    }

    rt.set_in_progress(id, false);

    if !unchanged {
        rt.fire_cell_on_change(id);
        rt.schedule_global_on_change();
    }

    Ok(!unchanged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::Signal;

    #[test]
    fn backdating_stops_downstream_recompute() {
        let rt = Runtime::new();
        let input = Signal::new(rt.clone(), 4, Durability::Low, None);

        let is_even_input = input.clone();
        let is_even = Memo::new(rt.clone(), move || is_even_input.get() % 2 == 0, Some("is_even".into()));

        let label_calls = Rc::new(RefCell::new(0));
        let label_calls_clone = label_calls.clone();
        let is_even_for_label = is_even.clone();
        let label = Memo::new(
            rt.clone(),
            move || {
                *label_calls_clone.borrow_mut() += 1;
                if is_even_for_label.get() {
                    "even".to_string()
                } else {
                    "odd".to_string()
                }
            },
            Some("label".into()),
        );

        assert_eq!(label.get(), "even");
        assert_eq!(*label_calls.borrow(), 1);

        input.set(6);
        assert_eq!(label.get(), "even");
        assert_eq!(*label_calls.borrow(), 1, "label must not recompute: is_even backdated");
    }

    #[test]
    fn durability_shortcut_skips_dependency_walk() {
        let rt = Runtime::new();
        let config = Signal::new(rt.clone(), 100, Durability::High, Some("config".into()));
        let user = Signal::new(rt.clone(), 1, Durability::Low, Some("user".into()));

        let calls = Rc::new(RefCell::new(0));
        let calls_clone = calls.clone();
        let config_for_memo = config.clone();
        let cfg2 = Memo::new(
            rt.clone(),
            move || {
                *calls_clone.borrow_mut() += 1;
                config_for_memo.get() * 2
            },
            Some("cfg2".into()),
        );

        assert_eq!(cfg2.get(), 200);
        assert_eq!(*calls.borrow(), 1);

        user.set(2);
        assert_eq!(cfg2.get(), 200);
        assert_eq!(
            *calls.borrow(),
            1,
            "durability shortcut must skip the dependency walk entirely"
        );
    }

    #[test]
    fn derived_durability_is_min_of_dependencies() {
        let rt = Runtime::new();
        let low = Signal::new(rt.clone(), 1, Durability::Low, None);
        let high = Signal::new(rt.clone(), 2, Durability::High, None);

        let low_for_memo = low.clone();
        let high_for_memo = high.clone();
        let sum = Memo::new(rt.clone(), move || low_for_memo.get() + high_for_memo.get(), None);

        sum.get();
        assert_eq!(sum.durability(), Durability::Low);
    }

    #[test]
    fn cycle_is_reported_and_does_not_poison_future_reads() {
        let rt = Runtime::new();
        let cell: Rc<RefCell<Option<Memo<i64>>>> = Rc::new(RefCell::new(None));
        let cell_for_compute = cell.clone();
        let m = Memo::new(
            rt.clone(),
            move || match cell_for_compute.borrow().as_ref().unwrap().get_result() {
                Ok(v) => v,
                Err(_) => 0,
            },
            Some("self_referential".into()),
        );
        *cell.borrow_mut() = Some(m.clone());

        assert_eq!(m.get(), 0);

        let downstream_input = m.clone();
        let downstream = Memo::new(rt.clone(), move || downstream_input.get() + 1, None);
        assert_eq!(downstream.get(), 1);
    }
}
