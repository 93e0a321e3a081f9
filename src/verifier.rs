//! Iterative `maybe_changed_after`: the verifier that decides whether a
//! cell has changed since some past revision without necessarily walking
//! its whole dependency tree, and without recursing (so a dependency
//! chain hundreds of cells deep cannot overflow the call stack).

use crate::cell::{CellId, CellKind};
use crate::cycle::CycleError;
use crate::durability::Durability;
use crate::revision::Revision;
use crate::runtime::Runtime;

/// One derived cell under verification. `dep_index` is the next entry of
/// `deps` still to be inspected; `any_dep_changed` accumulates whether any
/// dependency inspected so far has changed.
struct Frame {
    cell_id: CellId,
    deps: Vec<CellId>,
    dep_index: usize,
    any_dep_changed: bool,
}

enum Entry {
    /// Resolved without pushing a frame (already verified this revision,
    /// or the durability shortcut applied).
    Resolved(bool),
    /// The cell was already `in_progress`: a cycle.
    Cycle(CycleError),
    /// A genuine frame to push and walk dependency-by-dependency.
    Pushed(Frame),
}

/// Entry point: `Ok(true)` means `cell.changed_at > after` was established,
/// `Ok(false)` means it was not.
pub(crate) fn maybe_changed_after(
    rt: &Runtime,
    root: CellId,
    after: Revision,
) -> Result<bool, CycleError> {
    if rt.kind_of(root) == CellKind::Input {
        return Ok(rt.changed_at(root) > after);
    }

    let mut stack: Vec<Frame> = Vec::new();

    let mut pending: Option<bool> = match enter_frame(rt, root, after, &stack) {
        Entry::Resolved(result) => Some(result),
        Entry::Cycle(err) => return Err(err),
        Entry::Pushed(frame) => {
            stack.push(frame);
            None
        }
    };

    loop {
        if let Some(result) = pending.take() {
            match stack.last_mut() {
                None => return Ok(result),
                Some(parent) => {
                    if result {
                        parent.any_dep_changed = true;
                        parent.dep_index = parent.deps.len();
                    } else {
                        parent.dep_index += 1;
                    }
                }
            }
        }

        let top = stack.last().expect("verifier stack empty with no pending result");
        if top.dep_index >= top.deps.len() {
            let finished = stack.pop().unwrap();
            log::trace!(
                "verifier: resolving {:?} any_dep_changed={}",
                finished.cell_id,
                finished.any_dep_changed
            );
            match resolve_frame(rt, finished) {
                Ok(result) => pending = Some(result),
                Err(err) => {
                    clear_in_progress(rt, &stack);
                    return Err(err);
                }
            }
            continue;
        }

        let dep = top.deps[top.dep_index];
        match rt.kind_of(dep) {
            CellKind::Input => {
                let changed = rt.changed_at(dep) > after;
                let top = stack.last_mut().unwrap();
                if changed {
                    top.any_dep_changed = true;
                    top.dep_index = top.deps.len();
                } else {
                    top.dep_index += 1;
                }
            }
            CellKind::Derived => match enter_frame(rt, dep, after, &stack) {
                Entry::Resolved(result) => {
                    let top = stack.last_mut().unwrap();
                    if result {
                        top.any_dep_changed = true;
                        top.dep_index = top.deps.len();
                    } else {
                        top.dep_index += 1;
                    }
                }
                Entry::Cycle(err) => {
                    clear_in_progress(rt, &stack);
                    return Err(err);
                }
                Entry::Pushed(frame) => stack.push(frame),
            },
        }
    }
}

fn enter_frame(rt: &Runtime, cell_id: CellId, after: Revision, stack: &[Frame]) -> Entry {
    let current = rt.current_revision();

    if rt.verified_at(cell_id) == current {
        return Entry::Resolved(rt.changed_at(cell_id) > after);
    }

    let durability: Durability = rt.durability_of(cell_id);
    if rt.last_changed_revision(durability) <= after {
        rt.set_verified_at(cell_id, current);
        log::trace!("verifier: durability shortcut on {:?}", cell_id);
        return Entry::Resolved(false);
    }

    if rt.is_in_progress(cell_id) {
        let mut path: Vec<CellId> = stack.iter().map(|f| f.cell_id).collect();
        path.push(cell_id);
        return Entry::Cycle(CycleError::from_verification_path(&path, cell_id));
    }

    rt.set_in_progress(cell_id, true);
    let deps = rt.dependencies_of(cell_id);
    Entry::Pushed(Frame {
        cell_id,
        deps,
        dep_index: 0,
        any_dep_changed: false,
    })
}

/// Resolves a frame whose dependencies have all been inspected (or
/// short-circuited): recompute if anything changed, otherwise mark
/// verified without touching the stored value.
fn resolve_frame(rt: &Runtime, frame: Frame) -> Result<bool, CycleError> {
    if frame.any_dep_changed {
        // Hand control to `force_recompute`, which manages `in_progress`
        // itself; clear it here so the closure's own check does not
        // mistake this cell for already being on its own call path.
        rt.set_in_progress(frame.cell_id, false);
        rt.invoke_recompute(frame.cell_id)
    } else {
        rt.set_verified_at(frame.cell_id, rt.current_revision());
        rt.set_in_progress(frame.cell_id, false);
        Ok(false)
    }
}

fn clear_in_progress(rt: &Runtime, stack: &[Frame]) {
    for frame in stack {
        rt.set_in_progress(frame.cell_id, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::durability::Durability;
    use crate::memo::Memo;
    use crate::signal::Signal;

    #[test]
    fn deep_chain_verifies_without_recursion() {
        let rt = Runtime::new();
        let input = Signal::new(rt.clone(), 1i64, Durability::Low, Some("input".into()));

        let mut memos: Vec<Memo<i64>> = Vec::new();
        {
            let first_input = input.clone();
            memos.push(Memo::new(rt.clone(), move || first_input.get(), None));
        }
        for i in 1..250 {
            let prev = memos[i - 1].clone();
            memos.push(Memo::new(rt.clone(), move || prev.get() + 1, None));
        }

        assert_eq!(memos[249].get(), 250);

        input.set(10);
        assert_eq!(memos[249].get(), 259);
    }

    #[test]
    fn green_path_does_not_recompute() {
        let rt = Runtime::new();
        let input = Signal::new(rt.clone(), 4i64, Durability::Low, None);

        let calls = std::rc::Rc::new(std::cell::Cell::new(0));
        let calls_clone = calls.clone();
        let doubled_input = input.clone();
        let doubled = Memo::new(
            rt.clone(),
            move || {
                calls_clone.set(calls_clone.get() + 1);
                doubled_input.get() * 2
            },
            None,
        );

        assert_eq!(doubled.get(), 8);
        assert_eq!(doubled.get(), 8);
        assert_eq!(calls.get(), 1);
    }
}
