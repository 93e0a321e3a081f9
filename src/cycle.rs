use std::fmt;

use smallvec::SmallVec;

use crate::cell::CellId;
use crate::runtime::Runtime;

/// Most cycles in practice involve a handful of cells; inline storage
/// avoids a heap allocation for the common case while still spilling over
/// for a pathological cycle discovered deep in a long dependency chain.
type CyclePath = SmallVec<[CellId; 8]>;

/// Maximum path length rendered in full by [`CycleError::format_path`]
/// before the middle is elided, keeping diagnostic strings bounded
/// regardless of graph depth (a cycle through a long chain of cells must
/// not render in full).
const MAX_RENDERED_PATH: usize = 20;

/// A `Memo` transitively depends on itself, discovered either while it was
/// being recomputed (`force_recompute`) or while the verifier was walking
/// its dependency tree (`maybe_changed_after`).
///
/// `path()` is ordered from the outermost active computation down to (and
/// including) `cell()`, the closing node that re-entered an already
/// in-progress cell. Critically, when a `Memo::get_result` call fails with
/// a `CycleError`, the engine records no dependency edge for that read:
/// a memo that catches its own cycle and falls back to a sentinel value
/// must not accrete a spurious self-loop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CycleError {
    path: CyclePath,
}

impl CycleError {
    /// Builds a `CycleError` from an in-progress tracking stack (used by
    /// `Memo::force_recompute` when it discovers it has been re-entered)
    /// plus the id of the cell that closed the cycle.
    pub(crate) fn from_tracking_stack(stack: &[CellId], closing: CellId) -> Self {
        let start = stack
            .iter()
            .position(|id| *id == closing)
            .unwrap_or(0);
        let mut path: CyclePath = stack[start..].iter().copied().collect();
        path.push(closing);
        CycleError { path }
    }

    /// Builds a `CycleError` from the verifier's explicit frame stack (used
    /// by [`crate::verifier::maybe_changed_after`] when it discovers a
    /// frame for an already in-progress cell).
    pub(crate) fn from_verification_path(path: &[CellId], closing: CellId) -> Self {
        let start = path.iter().position(|id| *id == closing).unwrap_or(0);
        let mut path: CyclePath = path[start..].iter().copied().collect();
        path.push(closing);
        CycleError { path }
    }

    /// The closing `CellId`: the cell that was re-entered while already
    /// in progress.
    pub fn cell(&self) -> CellId {
        *self.path.last().expect("cycle path is never empty")
    }

    /// The ordered path from the outermost active computation to the
    /// closing cell.
    pub fn path(&self) -> &[CellId] {
        &self.path
    }

    /// Renders the cycle as `label_or_cell → label_or_cell → ...`, using
    /// each cell's `label` (if any) in place of `Cell[index]`. Paths longer
    /// than [`MAX_RENDERED_PATH`] are truncated in the middle.
    pub fn format_path(&self, rt: &Runtime) -> String {
        let names: Vec<String> = self
            .path
            .iter()
            .map(|id| rt.cell_label_or_debug(*id))
            .collect();

        if names.len() <= MAX_RENDERED_PATH {
            return names.join(" → ");
        }

        let head = MAX_RENDERED_PATH / 2;
        let tail = MAX_RENDERED_PATH - head;
        let mut rendered: Vec<String> = names[..head].to_vec();
        rendered.push(format!("… ({} more) …", names.len() - head - tail));
        rendered.extend_from_slice(&names[names.len() - tail..]);
        rendered.join(" → ")
    }
}

impl fmt::Display for CycleError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "cycle detected: ")?;
        let rendered: Vec<String> = self.path.iter().map(|id| format!("{:?}", id)).collect();
        write!(fmt, "{}", rendered.join(" → "))
    }
}

impl std::error::Error for CycleError {}
