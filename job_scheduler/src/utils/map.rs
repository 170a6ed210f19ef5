use std::ops::{Index, IndexMut};

mod base {
    use std::ops::{Index, IndexMut};

    pub struct SimpleMap<V> {
        inner: Vec<Option<V>>,
    }

    impl<V> SimpleMap<V> {
        pub fn with_capacity(capacity: usize) -> Self {
            Self {
                inner: Vec::with_capacity(capacity),
            }
        }

        pub fn contains_key(&self, key: usize) -> bool {
            self.inner.get(key).map(Option::is_some).unwrap_or(false)
        }

        pub fn insert(&mut self, k: usize, v: V) -> Option<V> {
            if self.inner.len() <= k {
                self.inner.resize_with(k + 1, || None);
            }
            self.inner[k].replace(v)
        }

        pub fn remove(&mut self, k: usize) -> Option<V> {
            let space = self.inner.get_mut(k);
            space.and_then(|space| space.take())
        }

        pub fn get(&self, key: usize) -> Option<&V> {
            self.inner.get(key).and_then(|v| v.as_ref())
        }

        pub fn get_mut(&mut self, key: usize) -> Option<&mut V> {
            self.inner.get_mut(key).and_then(|v| v.as_mut())
        }

        pub fn clear(&mut self) {
            self.inner.clear();
        }

        pub fn values_mut(&mut self) -> impl Iterator<Item = &mut V> {
            self.inner.iter_mut().filter_map(Option::as_mut)
        }

        pub fn capacity(&self) -> usize {
            self.inner.capacity()
        }
    }

    impl<V> Index<usize> for SimpleMap<V> {
        type Output = V;

        fn index(&self, index: usize) -> &Self::Output {
            self.get(index).expect("no entry found for key")
        }
    }

    impl<V> IndexMut<usize> for SimpleMap<V> {
        fn index_mut(&mut self, index: usize) -> &mut Self::Output {
            self.get_mut(index).expect("no entry found for key")
        }
    }
}

/// A fixed-slot, linear-scan map keyed by small `usize` positions.
///
/// Kept from the teacher's `utils::map::SimpleMap`: used here to track
/// per-job in-flight run handles, where the key space (run slot, 0..
/// `max_instances`) is small and dense enough that a `Vec<Option<V>>` beats
/// a real hash map.
pub struct SimpleMap<V> {
    base: base::SimpleMap<V>,
}

impl<V> SimpleMap<V> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            base: base::SimpleMap::with_capacity(capacity),
        }
    }

    pub fn get(&self, key: usize) -> Option<&V> {
        self.base.get(key)
    }

    pub fn get_mut(&mut self, key: usize) -> Option<&mut V> {
        self.base.get_mut(key)
    }

    pub fn contains_key(&self, key: usize) -> bool {
        self.base.contains_key(key)
    }

    pub fn insert(&mut self, k: usize, v: V) -> Option<V> {
        self.base.insert(k, v)
    }

    pub fn remove(&mut self, k: usize) -> Option<V> {
        self.base.remove(k)
    }

    pub fn clear(&mut self) {
        self.base.clear();
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut V> {
        self.base.values_mut()
    }

    pub fn capacity(&self) -> usize {
        self.base.capacity()
    }
}

impl<V> Index<usize> for SimpleMap<V> {
    type Output = V;

    fn index(&self, index: usize) -> &Self::Output {
        self.base.index(index)
    }
}

impl<V> IndexMut<usize> for SimpleMap<V> {
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        self.base.index_mut(index)
    }
}

#[cfg(test)]
mod tests {
    use super::SimpleMap;

    #[test]
    fn insert_then_get_round_trips() {
        let mut map: SimpleMap<u32> = SimpleMap::with_capacity(2);
        map.insert(3, 42);
        assert_eq!(map.get(3), Some(&42));
        assert!(!map.contains_key(0));
    }

    #[test]
    fn remove_frees_the_slot() {
        let mut map: SimpleMap<u32> = SimpleMap::with_capacity(2);
        map.insert(0, 1);
        assert_eq!(map.remove(0), Some(1));
        assert!(!map.contains_key(0));
    }
}
