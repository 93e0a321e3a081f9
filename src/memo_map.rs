use std::cell::RefCell;
use std::hash::Hash;
use std::rc::Rc;

use rustc_hash::FxHashMap;

use crate::cycle::CycleError;
use crate::memo::Memo;
use crate::runtime::Runtime;

struct MemoMapInner<K, V> {
    compute: Box<dyn Fn(K) -> V>,
    label: Option<String>,
    entries: RefCell<FxHashMap<K, Memo<V>>>,
}

/// Keyed memoization: a lazily populated table of per-key `Memo<V>`
/// instances, one created on first access to each key.
/// Entries are never evicted; a `MemoMap` lives as long as the handle
/// does.
pub struct MemoMap<K, V> {
    rt: Runtime,
    inner: Rc<MemoMapInner<K, V>>,
}

impl<K, V> Clone for MemoMap<K, V> {
    fn clone(&self) -> Self {
        MemoMap {
            rt: self.rt.clone(),
            inner: self.inner.clone(),
        }
    }
}

impl<K, V> MemoMap<K, V>
where
    K: Eq + Hash + Clone + 'static,
    V: PartialEq + Clone + 'static,
{
    /// Builds an empty keyed memoization table; no per-key `Memo` exists
    /// until its key is first accessed via `get`/`get_result`.
    pub fn new(rt: Runtime, compute: impl Fn(K) -> V + 'static, label: Option<String>) -> Self {
        MemoMap {
            rt,
            inner: Rc::new(MemoMapInner {
                compute: Box::new(compute),
                label,
                entries: RefCell::new(FxHashMap::default()),
            }),
        }
    }

    fn memo_for(&self, key: K) -> Memo<V> {
        if let Some(memo) = self.inner.entries.borrow().get(&key) {
            return memo.clone();
        }
        let key_for_compute = key.clone();
        let per_key_label = self
            .inner
            .label
            .as_ref()
            .map(|base| format!("{}[key]", base));
        let inner_for_compute = self.inner.clone();
        let memo = Memo::new(
            self.rt.clone(),
            move || (inner_for_compute.compute)(key_for_compute.clone()),
            per_key_label,
        );
        self.inner.entries.borrow_mut().insert(key, memo.clone());
        memo
    }

    /// Returns `key`'s value, creating its Memo on first access.
    pub fn get(&self, key: K) -> V {
        self.memo_for(key).get()
    }

    /// As [`MemoMap::get`], but reports a cycle instead of panicking.
    pub fn get_result(&self, key: K) -> Result<V, CycleError> {
        self.memo_for(key).get_result()
    }

    /// Whether a `Memo` has already been created for `key`.
    pub fn contains(&self, key: &K) -> bool {
        self.inner.entries.borrow().contains_key(key)
    }

    /// The number of keys a `Memo` has been created for so far.
    pub fn length(&self) -> usize {
        self.inner.entries.borrow().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::durability::Durability;
    use crate::signal::Signal;

    #[test]
    fn keyed_memoization_tracks_independent_entries() {
        let rt = Runtime::new();
        let base = Signal::new(rt.clone(), 10, Durability::Low, Some("base".into()));

        let base_for_compute = base.clone();
        let f = MemoMap::new(rt.clone(), move |k: i64| base_for_compute.get() + k, Some("f".into()));

        assert_eq!(f.get(1), 11);
        assert_eq!(f.get(1), 11);
        assert_eq!(f.get(2), 12);
        assert_eq!(f.length(), 2);

        base.set(20);
        assert_eq!(f.get(1), 21);
        assert_eq!(f.length(), 2);
        assert!(f.contains(&1));
        assert!(!f.contains(&3));
    }
}
