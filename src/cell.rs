use std::fmt;

use crate::cycle::CycleError;
use crate::durability::Durability;
use crate::revision::Revision;
use crate::runtime::RuntimeId;

/// Opaque identifier for a cell known to some [`crate::Runtime`].
///
/// A `CellId` carries the id of the runtime that minted it
/// (`runtime_id`) as well as a dense index into that runtime's cell
/// store. Passing a `CellId` to a `Runtime` other than the one that
/// issued it is a programmer error and is fatal.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct CellId {
    pub(crate) runtime_id: RuntimeId,
    pub(crate) index: u32,
}

impl fmt::Debug for CellId {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "Cell[{}]", self.index)
    }
}

/// Whether a cell's value is supplied externally or computed from others.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CellKind {
    /// A `Signal`: value set externally via `set`/`set_unconditional`.
    Input,
    /// A `Memo`: value produced by a compute closure that may read other
    /// cells.
    Derived,
}

/// Type-erased closures a `CellMeta` holds so that the `Runtime`'s cell
/// store can be homogeneous across arbitrary value types `T`.
///
/// Only `Derived` cells carry `recompute_and_check`; only `Input` cells
/// with a pending batched write carry `commit_pending`. Both are `None`
/// otherwise: the typed payload (value, compute closure) stays on the
/// user-facing `Signal`/`Memo` wrapper, which captures these closures over
/// its own shared state.
pub(crate) type RecomputeAndCheck = Box<dyn FnMut() -> Result<bool, CycleError>>;
pub(crate) type CommitPending = Box<dyn FnMut() -> bool>;
pub(crate) type OnChange = Box<dyn FnMut()>;

/// Per-cell bookkeeping record. Stored, one per cell, in `Runtime`'s dense
/// cell store.
pub(crate) struct CellMeta {
    pub(crate) id: CellId,
    pub(crate) kind: CellKind,
    pub(crate) changed_at: Revision,
    pub(crate) verified_at: Revision,
    pub(crate) durability: Durability,
    pub(crate) dependencies: Vec<CellId>,
    pub(crate) in_progress: bool,
    pub(crate) recompute_and_check: Option<RecomputeAndCheck>,
    pub(crate) commit_pending: Option<CommitPending>,
    pub(crate) on_change: Option<OnChange>,
    pub(crate) label: Option<String>,
}

impl CellMeta {
    pub(crate) fn new_input(id: CellId, durability: Durability, label: Option<String>, revision: Revision) -> Self {
        CellMeta {
            id,
            kind: CellKind::Input,
            changed_at: revision,
            verified_at: revision,
            durability,
            dependencies: Vec::new(),
            in_progress: false,
            recompute_and_check: None,
            commit_pending: None,
            on_change: None,
            label,
        }
    }

    pub(crate) fn new_derived(id: CellId, label: Option<String>) -> Self {
        CellMeta {
            id,
            kind: CellKind::Derived,
            // Sentinel: a memo with no computed value yet has never
            // "changed" or been "verified". `Revision::start()` plays this
            // role: the very first successful compute always bumps both
            // fields to the (strictly later) current revision.
            changed_at: Revision::start(),
            verified_at: Revision::start(),
            durability: Durability::High,
            dependencies: Vec::new(),
            in_progress: false,
            recompute_and_check: None,
            commit_pending: None,
            on_change: None,
            label,
        }
    }

    pub(crate) fn label_or_cell(&self) -> String {
        match &self.label {
            Some(label) => label.clone(),
            None => format!("{:?}", self.id),
        }
    }
}

/// Read-only snapshot of a cell's metadata, returned by
/// [`crate::Runtime::cell_info`] for debugging/diagnostics.
#[derive(Debug, Clone)]
pub struct CellInfo {
    /// The diagnostic label this cell was created with, if any.
    pub label: Option<String>,
    /// This cell's opaque identifier.
    pub id: CellId,
    /// The revision at which this cell's value last actually changed.
    pub changed_at: Revision,
    /// The revision as of which this cell was last confirmed up to date.
    pub verified_at: Revision,
    /// This cell's current durability classification.
    pub durability: Durability,
    /// The cells this cell depends on, empty for an `Input` cell.
    pub dependencies: Vec<CellId>,
}

impl From<&CellMeta> for CellInfo {
    fn from(meta: &CellMeta) -> Self {
        CellInfo {
            label: meta.label.clone(),
            id: meta.id,
            changed_at: meta.changed_at,
            verified_at: meta.verified_at,
            durability: meta.durability,
            dependencies: meta.dependencies.clone(),
        }
    }
}
