use std::cell::RefCell;
use std::fmt;
use std::hash::BuildHasherDefault;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexSet;
use rustc_hash::FxHasher;

use crate::cell::{CellId, CellInfo, CellKind, CellMeta, CommitPending, OnChange, RecomputeAndCheck};
use crate::cycle::CycleError;
use crate::durability::Durability;
use crate::revision::Revision;

pub(crate) type FxIndexSet<K> = IndexSet<K, BuildHasherDefault<FxHasher>>;

/// Unique identifier for a [`Runtime`]. `CellId`s carry the `RuntimeId` of
/// the runtime that minted them, so that a `CellId` from one runtime can
/// never be silently accepted by another.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct RuntimeId(u64);

impl fmt::Debug for RuntimeId {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "RuntimeId({})", self.0)
    }
}

impl RuntimeId {
    fn fresh() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        RuntimeId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// A tracking frame, pushed while a `Memo`'s compute closure (or the
/// verifier's own recompute-and-check path) is running. Collects the
/// cells that computation reads, in the order they were first read, with
/// O(1) deduplication.
struct ActiveQuery {
    cell_id: CellId,
    dependencies: FxIndexSet<CellId>,
}

/// Per-open-batch rollback state: a snapshot of the runtime's pending-write
/// bookkeeping taken when the frame was entered, plus one "undo" closure
/// per signal whose pending value was touched for the first time within
/// this frame.
struct BatchFrame {
    pending_before: FxIndexSet<CellId>,
    captured: rustc_hash::FxHashSet<CellId>,
    undo: Vec<Box<dyn FnMut()>>,
}

struct RuntimeInner {
    runtime_id: RuntimeId,
    current_revision: Revision,
    cells: Vec<Option<CellMeta>>,
    tracking_stack: Vec<ActiveQuery>,
    durability_last_changed: [Revision; Durability::LEN],
    batch_depth: usize,
    batch_pending_signals: FxIndexSet<CellId>,
    batch_rollback_stack: Vec<BatchFrame>,
    on_change: Option<OnChange>,
    on_change_fired_at: Option<Revision>,
}

/// Owns the revision clock, the cell metadata store, the tracking stack,
/// the per-durability "last changed" clocks, and batch state.
///
/// `Runtime` is a cheap-to-clone handle (an `Rc<RefCell<..>>`): `Signal`,
/// `Memo`, and `MemoMap` each hold a clone so that they can read and
/// mutate shared state without the host application threading a `&mut
/// Runtime` through every call. This engine is explicitly single-threaded:
/// `Runtime` is neither `Send` nor `Sync`.
#[derive(Clone)]
pub struct Runtime(Rc<RefCell<RuntimeInner>>);

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.0.borrow();
        fmt.debug_struct("Runtime")
            .field("id", &inner.runtime_id)
            .field("current_revision", &inner.current_revision)
            .field("cells", &inner.cells.len())
            .finish()
    }
}

impl Runtime {
    /// Creates a fresh runtime with an empty cell store, starting at the
    /// first revision.
    pub fn new() -> Self {
        let inner = RuntimeInner {
            runtime_id: RuntimeId::fresh(),
            current_revision: Revision::start(),
            cells: Vec::new(),
            tracking_stack: Vec::new(),
            durability_last_changed: [Revision::start(); Durability::LEN],
            batch_depth: 0,
            batch_pending_signals: FxIndexSet::default(),
            batch_rollback_stack: Vec::new(),
            on_change: None,
            on_change_fired_at: None,
        };
        log::debug!("Runtime::new -> {:?}", inner.runtime_id);
        Runtime(Rc::new(RefCell::new(inner)))
    }

    /// Registers a global observer, fired at most once per revision that
    /// actually commits at least one changed value.
    pub fn set_on_change(&self, f: impl FnMut() + 'static) {
        self.0.borrow_mut().on_change = Some(Box::new(f));
    }

    /// Removes the global observer, if any.
    pub fn clear_on_change(&self) {
        self.0.borrow_mut().on_change = None;
    }

    /// A read-only snapshot of a cell's metadata, for debugging.
    pub fn cell_info(&self, id: CellId) -> Option<CellInfo> {
        let inner = self.0.borrow();
        if id.runtime_id != inner.runtime_id {
            return None;
        }
        inner
            .cells
            .get(id.index as usize)
            .and_then(|slot| slot.as_ref())
            .map(CellInfo::from)
    }

    /// Runs `body` with Signal writes deferred to a single atomic commit
    /// at the end. Rollback is only promised for the `Result`-returning
    /// [`Runtime::batch_result`] variant: a panic unwinding through `body`
    /// here is not caught, and this frame's writes are simply left
    /// uncommitted — the runtime has no way to know a panicking body left
    /// its own external state consistent enough to roll back into.
    pub fn batch(&self, body: impl FnOnce()) {
        self.begin_batch();
        body();
        self.end_batch_commit();
    }

    /// As [`Runtime::batch`], but `body` returns a `Result`: an `Err` rolls
    /// back this frame's writes and is propagated as `Err` rather than by
    /// unwinding.
    pub fn batch_result<E>(&self, body: impl FnOnce() -> Result<(), E>) -> Result<(), E> {
        self.begin_batch();
        match body() {
            Ok(()) => {
                self.end_batch_commit();
                Ok(())
            }
            Err(e) => {
                self.end_batch_rollback();
                Err(e)
            }
        }
    }

    fn begin_batch(&self) {
        let mut inner = self.0.borrow_mut();
        inner.batch_depth += 1;
        let frame = BatchFrame {
            pending_before: inner.batch_pending_signals.clone(),
            captured: Default::default(),
            undo: Vec::new(),
        };
        inner.batch_rollback_stack.push(frame);
        log::debug!("batch: enter, depth={}", inner.batch_depth);
    }

    fn end_batch_rollback(&self) {
        let mut frame = {
            let mut inner = self.0.borrow_mut();
            inner
                .batch_rollback_stack
                .pop()
                .expect("batch rollback frame missing")
        };
        for undo in frame.undo.iter_mut() {
            undo();
        }
        let mut inner = self.0.borrow_mut();
        inner.batch_pending_signals = frame.pending_before;
        inner.batch_depth = inner
            .batch_depth
            .checked_sub(1)
            .expect("unbalanced batch nesting");
        log::debug!("batch: rolled back, depth={}", inner.batch_depth);
    }

    fn end_batch_commit(&self) {
        let depth_after = {
            let mut inner = self.0.borrow_mut();
            inner
                .batch_rollback_stack
                .pop()
                .expect("batch rollback frame missing");
            inner.batch_depth = inner
                .batch_depth
                .checked_sub(1)
                .expect("unbalanced batch nesting");
            inner.batch_depth
        };
        if depth_after == 0 {
            self.commit_outermost_batch();
        }
    }

    /// Two-phase commit: invoke every pending signal's `commit_pending`
    /// closure (phase 1), then — only if at least one value actually
    /// changed — advance the revision and fire callbacks (phase 2). A
    /// batch whose writes all reverted to their pre-batch values commits
    /// nothing at all. The revision's durability is the max over only the
    /// cells that actually changed, never over every cell merely written
    /// during the batch.
    fn commit_outermost_batch(&self) {
        let pending: Vec<CellId> = {
            let inner = self.0.borrow();
            inner.batch_pending_signals.iter().copied().collect()
        };

        let mut changed_cells = Vec::new();
        let mut max_durability = Durability::Low;
        for id in &pending {
            let changed = self.invoke_commit_pending(*id);
            {
                let mut inner = self.0.borrow_mut();
                let meta = inner.cell_meta_mut(*id);
                meta.commit_pending = None;
            }
            if changed {
                let durability = self.durability_of(*id);
                if durability > max_durability {
                    max_durability = durability;
                }
                changed_cells.push(*id);
            }
        }

        self.0.borrow_mut().batch_pending_signals.clear();

        if changed_cells.is_empty() {
            log::debug!("batch: commit with no net change, reverted");
            return;
        }

        self.advance_revision(max_durability);
        for id in &changed_cells {
            self.mark_input_changed(*id);
            self.fire_cell_on_change(*id);
        }
        self.schedule_global_on_change();
        log::debug!(
            "batch: committed {} changed cell(s) at {:?}",
            changed_cells.len(),
            self.current_revision()
        );
    }

    /// Records a pending write for `id` (called by `Signal::set`/
    /// `set_unconditional` while a batch is open). Adds `id` to the
    /// pending list if new, and — for every currently open frame that
    /// hasn't already seen a write to `id` — captures an undo action via
    /// `capture_undo` so that frame, even an outer one enclosing an inner
    /// batch that has since committed, can still restore this signal's
    /// pre-frame pending value if it itself is later rolled back.
    pub(crate) fn batch_register_write(&self, id: CellId, capture_undo: impl Fn() -> Box<dyn FnMut()>) {
        let mut inner = self.0.borrow_mut();
        inner.batch_pending_signals.insert(id);
        for frame in inner.batch_rollback_stack.iter_mut() {
            if frame.captured.insert(id) {
                frame.undo.push(capture_undo());
            }
        }
    }

    pub(crate) fn is_batching(&self) -> bool {
        self.0.borrow().batch_depth > 0
    }

    /// Appends `id` to the top tracking frame (de-duplicated), recording
    /// that the in-progress computation read this cell. No-op if no
    /// tracking frame is active (a top-level read outside any `Memo`
    /// compute closure).
    pub(crate) fn record_dependency(&self, id: CellId) {
        let mut inner = self.0.borrow_mut();
        if let Some(frame) = inner.tracking_stack.last_mut() {
            frame.dependencies.insert(id);
        }
    }

    pub(crate) fn push_tracking(&self, cell: CellId) {
        self.0.borrow_mut().tracking_stack.push(ActiveQuery {
            cell_id: cell,
            dependencies: FxIndexSet::default(),
        });
    }

    /// Pops the top tracking frame and returns its recorded dependencies,
    /// in the order each was first read.
    pub(crate) fn pop_tracking(&self) -> Vec<CellId> {
        let frame = self
            .0
            .borrow_mut()
            .tracking_stack
            .pop()
            .expect("tracking stack underflow");
        frame.dependencies.into_iter().collect()
    }

    /// The `CellId`s currently on the tracking stack, outermost first,
    /// used to build a `CycleError` path when a `Memo` discovers it has
    /// been re-entered during its own recompute.
    pub(crate) fn tracking_stack_ids(&self) -> Vec<CellId> {
        self.0
            .borrow()
            .tracking_stack
            .iter()
            .map(|frame| frame.cell_id)
            .collect()
    }

    pub(crate) fn current_revision(&self) -> Revision {
        self.0.borrow().current_revision
    }

    pub(crate) fn last_changed_revision(&self, d: Durability) -> Revision {
        self.0.borrow().durability_last_changed[d.index()]
    }

    /// Bumps `current_revision` and, for every durability level `L <=
    /// durability`, advances `durability_last_changed[L]` to match it.
    /// Returns the new revision.
    pub(crate) fn advance_revision(&self, durability: Durability) -> Revision {
        let mut inner = self.0.borrow_mut();
        let next = inner.current_revision.next();
        inner.current_revision = next;
        for l in 0..=durability.index() {
            inner.durability_last_changed[l] = next;
        }
        next
    }

    /// Sets both `changed_at` and `verified_at` to the current revision on
    /// an input cell that just committed a change.
    pub(crate) fn mark_input_changed(&self, id: CellId) {
        let mut inner = self.0.borrow_mut();
        let now = inner.current_revision;
        let meta = inner.cell_meta_mut(id);
        meta.changed_at = now;
        meta.verified_at = now;
    }

    pub(crate) fn allocate_cell(
        &self,
        kind: CellKind,
        durability: Durability,
        label: Option<String>,
    ) -> CellId {
        let mut inner = self.0.borrow_mut();
        let index = inner.cells.len() as u32;
        let id = CellId {
            runtime_id: inner.runtime_id,
            index,
        };
        let meta = match kind {
            CellKind::Input => {
                let now = inner.current_revision;
                CellMeta::new_input(id, durability, label, now)
            }
            CellKind::Derived => CellMeta::new_derived(id, label),
        };
        inner.cells.push(Some(meta));
        id
    }

    pub(crate) fn durability_of(&self, id: CellId) -> Durability {
        self.0.borrow().cell_meta(id).durability
    }

    pub(crate) fn set_durability(&self, id: CellId, durability: Durability) {
        self.0.borrow_mut().cell_meta_mut(id).durability = durability;
    }

    pub(crate) fn changed_at(&self, id: CellId) -> Revision {
        self.0.borrow().cell_meta(id).changed_at
    }

    pub(crate) fn verified_at(&self, id: CellId) -> Revision {
        self.0.borrow().cell_meta(id).verified_at
    }

    pub(crate) fn set_verified_at(&self, id: CellId, revision: Revision) {
        self.0.borrow_mut().cell_meta_mut(id).verified_at = revision;
    }

    pub(crate) fn set_changed_at(&self, id: CellId, revision: Revision) {
        self.0.borrow_mut().cell_meta_mut(id).changed_at = revision;
    }

    pub(crate) fn kind_of(&self, id: CellId) -> CellKind {
        self.0.borrow().cell_meta(id).kind
    }

    pub(crate) fn dependencies_of(&self, id: CellId) -> Vec<CellId> {
        self.0.borrow().cell_meta(id).dependencies.clone()
    }

    pub(crate) fn set_dependencies(&self, id: CellId, deps: Vec<CellId>) {
        self.0.borrow_mut().cell_meta_mut(id).dependencies = deps;
    }

    pub(crate) fn is_in_progress(&self, id: CellId) -> bool {
        self.0.borrow().cell_meta(id).in_progress
    }

    pub(crate) fn set_in_progress(&self, id: CellId, value: bool) {
        self.0.borrow_mut().cell_meta_mut(id).in_progress = value;
    }

    pub(crate) fn cell_label_or_debug(&self, id: CellId) -> String {
        let inner = self.0.borrow();
        if id.runtime_id != inner.runtime_id {
            return format!("{:?}", id);
        }
        match inner.cells.get(id.index as usize).and_then(|s| s.as_ref()) {
            Some(meta) => meta.label_or_cell(),
            None => format!("{:?}", id),
        }
    }

    pub(crate) fn set_recompute_and_check(&self, id: CellId, closure: RecomputeAndCheck) {
        self.0.borrow_mut().cell_meta_mut(id).recompute_and_check = Some(closure);
    }

    pub(crate) fn set_commit_pending(&self, id: CellId, closure: CommitPending) {
        self.0.borrow_mut().cell_meta_mut(id).commit_pending = Some(closure);
    }

    pub(crate) fn set_on_change_for(&self, id: CellId, closure: Option<OnChange>) {
        self.0.borrow_mut().cell_meta_mut(id).on_change = closure;
    }

    /// Invokes `id`'s `recompute_and_check` closure. The closure is
    /// temporarily removed from the cell's metadata before being called
    /// (and restored afterward), since the closure itself re-enters the
    /// runtime (pushing a tracking frame, reading other cells, writing
    /// this cell's own revisions) and would otherwise try to borrow the
    /// runtime's cell store while it is already borrowed.
    pub(crate) fn invoke_recompute(&self, id: CellId) -> Result<bool, CycleError> {
        let mut closure = {
            let mut inner = self.0.borrow_mut();
            inner
                .cell_meta_mut(id)
                .recompute_and_check
                .take()
                .unwrap_or_else(|| panic!("{:?} has no recompute closure: not a Memo", id))
        };
        let result = closure();
        let mut inner = self.0.borrow_mut();
        inner.cell_meta_mut(id).recompute_and_check = Some(closure);
        result
    }

    /// Invokes `id`'s `commit_pending` closure using the same
    /// take-call-restore discipline as [`Runtime::invoke_recompute`].
    pub(crate) fn invoke_commit_pending(&self, id: CellId) -> bool {
        let mut closure = {
            let mut inner = self.0.borrow_mut();
            inner
                .cell_meta_mut(id)
                .commit_pending
                .take()
                .unwrap_or_else(|| panic!("{:?} has no commit_pending closure: not a pending input", id))
        };
        let result = closure();
        let mut inner = self.0.borrow_mut();
        inner.cell_meta_mut(id).commit_pending = Some(closure);
        result
    }

    pub(crate) fn fire_cell_on_change(&self, id: CellId) {
        let taken = {
            let mut inner = self.0.borrow_mut();
            inner.cell_meta_mut(id).on_change.take()
        };
        if let Some(mut cb) = taken {
            cb();
            self.0.borrow_mut().cell_meta_mut(id).on_change = Some(cb);
        }
    }

    /// Fires the global observer at most once per revision: a revision in
    /// which several Memos each independently detect a change during
    /// verification still only triggers the observer once.
    pub(crate) fn schedule_global_on_change(&self) {
        let current = self.current_revision();
        let already_fired = self.0.borrow().on_change_fired_at == Some(current);
        if already_fired {
            return;
        }
        let taken = self.0.borrow_mut().on_change.take();
        match taken {
            Some(mut cb) => {
                cb();
                let mut inner = self.0.borrow_mut();
                inner.on_change = Some(cb);
                inner.on_change_fired_at = Some(current);
            }
            None => {
                self.0.borrow_mut().on_change_fired_at = Some(current);
            }
        }
    }

    /// Fatal if `id` belongs to another `Runtime`.
    pub(crate) fn assert_owns(&self, id: CellId) {
        let inner = self.0.borrow();
        assert_eq!(
            id.runtime_id, inner.runtime_id,
            "CellId {:?} belongs to a different Runtime",
            id
        );
    }
}

impl RuntimeInner {
    fn cell_meta(&self, id: CellId) -> &CellMeta {
        assert_eq!(id.runtime_id, self.runtime_id, "foreign CellId {:?}", id);
        self.cells
            .get(id.index as usize)
            .and_then(|slot| slot.as_ref())
            .unwrap_or_else(|| panic!("missing cell metadata for {:?}", id))
    }

    fn cell_meta_mut(&mut self, id: CellId) -> &mut CellMeta {
        assert_eq!(id.runtime_id, self.runtime_id, "foreign CellId {:?}", id);
        self.cells
            .get_mut(id.index as usize)
            .and_then(|slot| slot.as_mut())
            .unwrap_or_else(|| panic!("missing cell metadata for {:?}", id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::durability::Durability;
    use crate::signal::Signal;

    #[test]
    fn distinct_runtimes_have_distinct_ids() {
        let a = Runtime::new();
        let b = Runtime::new();
        let sig_a = Signal::new(a.clone(), 1, Durability::Low, None);
        let sig_b = Signal::new(b.clone(), 1, Durability::Low, None);
        assert_ne!(sig_a.id().runtime_id, sig_b.id().runtime_id);
    }

    #[test]
    #[should_panic(expected = "different Runtime")]
    fn foreign_cell_id_is_fatal() {
        let a = Runtime::new();
        let b = Runtime::new();
        let sig_a = Signal::new(a, 1, Durability::Low, None);
        b.assert_owns(sig_a.id());
    }

    #[test]
    fn advance_revision_respects_durability_monotonicity() {
        let rt = Runtime::new();
        let r1 = rt.advance_revision(Durability::Low);
        assert_eq!(rt.last_changed_revision(Durability::Low), r1);
        assert_ne!(rt.last_changed_revision(Durability::High), r1);

        let r2 = rt.advance_revision(Durability::High);
        assert_eq!(rt.last_changed_revision(Durability::Low), r2);
        assert_eq!(rt.last_changed_revision(Durability::Medium), r2);
        assert_eq!(rt.last_changed_revision(Durability::High), r2);
    }
}
