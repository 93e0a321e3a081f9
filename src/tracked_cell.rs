use crate::cell::CellId;
use crate::signal::Signal;

/// A field within a "tracked struct": an ordinary [`Signal`], so that a
/// Memo reading one field does not depend on its sibling fields.
/// `TrackedCell<T>` is a plain alias, not a distinct type: there is
/// nothing about field-granular dependency tracking that a `Signal`
/// doesn't already provide on its own.
pub type TrackedCell<T> = Signal<T>;

/// Implemented by user-defined "tracked structs" — records whose fields
/// are each a [`TrackedCell`] — so that diagnostics and future root
/// marking can enumerate a struct's cells without the engine needing to
/// know its field layout. Deriving this is the only engine-specific
/// obligation a tracked struct takes on; each field remains an ordinary
/// `Signal` otherwise.
pub trait TrackedStruct {
    /// Every cell this struct exposes, in field declaration order.
    fn tracked_cells(&self) -> Vec<CellId>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::durability::Durability;
    use crate::memo::Memo;
    use crate::runtime::Runtime;

    struct Point {
        x: TrackedCell<i64>,
        y: TrackedCell<i64>,
    }

    impl TrackedStruct for Point {
        fn tracked_cells(&self) -> Vec<CellId> {
            vec![self.x.id(), self.y.id()]
        }
    }

    #[test]
    fn unrelated_field_updates_do_not_invalidate_memos_on_other_fields() {
        let rt = Runtime::new();
        let point = Point {
            x: Signal::new(rt.clone(), 1, Durability::Low, Some("x".into())),
            y: Signal::new(rt.clone(), 2, Durability::Low, Some("y".into())),
        };
        assert_eq!(point.tracked_cells().len(), 2);

        let calls = std::rc::Rc::new(std::cell::RefCell::new(0));
        let calls_clone = calls.clone();
        let x_for_memo = point.x.clone();
        let doubled_x = Memo::new(
            rt.clone(),
            move || {
                *calls_clone.borrow_mut() += 1;
                x_for_memo.get() * 2
            },
            None,
        );

        assert_eq!(doubled_x.get(), 2);
        point.y.set(99);
        assert_eq!(doubled_x.get(), 2);
        assert_eq!(*calls.borrow(), 1, "doubled_x never read y, so y's write must not trigger recompute");
    }
}
