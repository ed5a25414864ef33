//! Transactional hash map.
//!
//! Entries live in a table of buckets, each bucket its own [`TRef`], so
//! transactions on keys in different buckets only share the size counter.
//! The bucket table itself sits behind one more [`TRef`]; growing it is an
//! ordinary write to that reference and commits atomically with the rest
//! of the transaction.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::value::Value;

use super::journal::Journal;
use super::tref::TRef;
use super::{Stm, TxResult};

const INITIAL_BUCKETS: usize = 16;

type Bucket<K, V> = TRef<Vec<(K, V)>>;
type Table<K, V> = Arc<Vec<Bucket<K, V>>>;

/// A hash map usable inside transactions.
pub struct TMap<K, V> {
    buckets: TRef<Table<K, V>>,
    size: TRef<usize>,
}

impl<K, V> Clone for TMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            buckets: self.buckets.clone(),
            size: self.size.clone(),
        }
    }
}

impl<K, V> fmt::Debug for TMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TMap")
            .field("buckets", &self.buckets)
            .field("size", &self.size)
            .finish()
    }
}

fn bucket_of<K: Hash>(key: &K, buckets: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % buckets as u64) as usize
}

fn table_with<K: Value, V: Value>(entries: Vec<Vec<(K, V)>>) -> Table<K, V> {
    Arc::new(entries.into_iter().map(TRef::new).collect())
}

impl<K: Value + Eq + Hash, V: Value> TMap<K, V> {
    /// An empty map, created outside any transaction.
    pub fn new() -> Self {
        Self {
            buckets: TRef::new(table_with(vec![Vec::new(); INITIAL_BUCKETS])),
            size: TRef::new(0),
        }
    }

    /// Create an empty map as part of a transaction.
    pub fn empty() -> Stm<TMap<K, V>> {
        Stm::from_fn(|_| TxResult::Done(TMap::new()))
    }

    /// Create a map holding `entries` as part of a transaction. Later
    /// duplicates win.
    pub fn from_iter(entries: impl IntoIterator<Item = (K, V)>) -> Stm<TMap<K, V>> {
        let entries: Vec<(K, V)> = entries.into_iter().collect();
        Stm::from_fn(move |journal| {
            let map = TMap::new();
            for (key, value) in entries.iter().cloned() {
                map.insert(journal, key, value);
            }
            TxResult::Done(map)
        })
    }

    fn locate(&self, journal: &mut Journal, key: &K) -> Bucket<K, V> {
        let table = self.buckets.read(journal);
        table[bucket_of(key, table.len())].clone()
    }

    fn lookup(&self, journal: &mut Journal, key: &K) -> Option<V> {
        self.locate(journal, key)
            .read(journal)
            .into_iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    fn insert(&self, journal: &mut Journal, key: K, value: V) {
        let bucket = self.locate(journal, &key);
        let mut entries = bucket.read(journal);
        match entries.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => {
                slot.1 = value;
                bucket.write(journal, entries);
            }
            None => {
                entries.push((key, value));
                bucket.write(journal, entries);
                let size = self.size.read(journal) + 1;
                self.size.write(journal, size);
                self.grow_if_loaded(journal, size);
            }
        }
    }

    fn delete(&self, journal: &mut Journal, key: &K) -> Option<V> {
        let bucket = self.locate(journal, key);
        let mut entries = bucket.read(journal);
        let position = entries.iter().position(|(k, _)| k == key)?;
        let (_, removed) = entries.swap_remove(position);
        bucket.write(journal, entries);
        let size = self.size.read(journal) - 1;
        self.size.write(journal, size);
        Some(removed)
    }

    fn grow_if_loaded(&self, journal: &mut Journal, size: usize) {
        let table = self.buckets.read(journal);
        if size * 4 <= table.len() * 3 {
            return;
        }
        let capacity = table.len() * 2;
        let mut entries: Vec<Vec<(K, V)>> = vec![Vec::new(); capacity];
        for bucket in table.iter() {
            for (key, value) in bucket.read(journal) {
                entries[bucket_of(&key, capacity)].push((key, value));
            }
        }
        tracing::trace!(from = table.len(), to = capacity, size, "growing transactional map");
        self.buckets.write(journal, table_with(entries));
    }

    fn entries(&self, journal: &mut Journal) -> Vec<(K, V)> {
        let table = self.buckets.read(journal);
        table.iter().flat_map(|bucket| bucket.read(journal)).collect()
    }

    /// Insert or replace the value under `key`.
    pub fn put(&self, key: K, value: V) -> Stm<()> {
        let this = self.clone();
        Stm::from_fn(move |journal| {
            this.insert(journal, key.clone(), value.clone());
            TxResult::Done(())
        })
    }

    /// The value under `key`.
    pub fn get(&self, key: K) -> Stm<Option<V>> {
        let this = self.clone();
        Stm::from_fn(move |journal| TxResult::Done(this.lookup(journal, &key)))
    }

    /// Remove `key`, returning its value.
    pub fn remove(&self, key: K) -> Stm<Option<V>> {
        let this = self.clone();
        Stm::from_fn(move |journal| TxResult::Done(this.delete(journal, &key)))
    }

    /// Whether `key` is present.
    pub fn contains_key(&self, key: K) -> Stm<bool> {
        self.get(key).map(|v| v.is_some())
    }

    /// Number of entries.
    pub fn size(&self) -> Stm<usize> {
        self.size.get()
    }

    /// Number of buckets in the table.
    pub fn bucket_count(&self) -> Stm<usize> {
        self.buckets.get().map(|table| table.len())
    }

    /// All keys, in no particular order.
    pub fn keys(&self) -> Stm<Vec<K>> {
        self.to_vec().map(|entries| entries.into_iter().map(|(k, _)| k).collect())
    }

    /// All values, in no particular order.
    pub fn values(&self) -> Stm<Vec<V>> {
        self.to_vec().map(|entries| entries.into_iter().map(|(_, v)| v).collect())
    }

    /// All entries, in no particular order.
    pub fn to_vec(&self) -> Stm<Vec<(K, V)>> {
        let this = self.clone();
        Stm::from_fn(move |journal| TxResult::Done(this.entries(journal)))
    }

    /// Replace the entry under `key` with `f` of the current one. `None`
    /// removes it. Returns the new value.
    pub fn update_with(
        &self,
        key: K,
        f: impl Fn(Option<V>) -> Option<V> + Send + Sync + 'static,
    ) -> Stm<Option<V>> {
        let this = self.clone();
        Stm::from_fn(move |journal| {
            let next = f(this.lookup(journal, &key));
            match &next {
                Some(value) => this.insert(journal, key.clone(), value.clone()),
                None => {
                    this.delete(journal, &key);
                }
            }
            TxResult::Done(next)
        })
    }
}

impl<K: Value + Eq + Hash, V: Value> Default for TMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::runtime::Runtime;

    fn runtime() -> Runtime {
        Runtime::new(RuntimeConfig::builder().num_workers(2).build_unchecked())
    }

    #[test]
    fn test_put_get_remove() {
        let rt = runtime();
        let map = TMap::<String, i32>::new();
        let tx = map
            .put("a".into(), 1)
            .zip_right(map.put("b".into(), 2))
            .zip_right(map.put("a".into(), 3))
            .zip_right(map.get("a".into()))
            .zip(map.remove("b".into()))
            .zip(map.contains_key("b".into()))
            .zip(map.size());
        assert_eq!(
            rt.run_blocking(tx.commit()).value(),
            Some(&(((Some(3), Some(2)), false), 1))
        );
    }

    #[test]
    fn test_grows_past_load_factor() {
        let rt = runtime();
        let tx = TMap::from_iter((0..100).map(|n| (n, n * n))).flat_map(|map| {
            map.bucket_count()
                .zip(map.size())
                .zip(map.get(42))
                .zip(map.keys())
        });
        let exit = rt.run_blocking(tx.commit());
        let (((buckets, size), found), mut keys) = exit.value().cloned().unwrap_or_default();
        assert_eq!(buckets, 256);
        assert_eq!(size, 100);
        assert_eq!(found, Some(1764));
        keys.sort_unstable();
        assert_eq!(keys, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_update_with() {
        let rt = runtime();
        let map = TMap::<&str, u32>::new();
        let bump = map.update_with("hits", |v| Some(v.unwrap_or(0) + 1));
        let tx = bump
            .clone()
            .zip_right(bump)
            .zip_right(map.update_with("gone", |_| None))
            .zip(map.get("hits"))
            .zip(map.size());
        assert_eq!(rt.run_blocking(tx.commit()).value(), Some(&((None, Some(2)), 1)));
    }

    #[test]
    fn test_failed_transaction_leaves_map_unchanged() {
        let rt = runtime();
        let map = TMap::<u8, u8>::new();
        let tx = map.put(1, 1).widen().zip_right(Stm::<(), &str>::fail("stop"));
        assert!(rt.run_blocking(tx.commit()).is_failure());
        assert_eq!(rt.run_blocking(map.size().commit()).value(), Some(&0));
    }
}
