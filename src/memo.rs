//! Keyed exactly-once memoization.
//!
//! [`KeyedMemoizer`] maps each key to a shared [`MemoCell`]. Cells are installed
//! lazily under the table's write lock, so every caller of a key ends up on the same
//! cell, and the cell's own state machine picks the single caller that runs the
//! factory. Everyone else parks on the cell and receives a clone of the outcome.
//!
//! Cells are never removed while the memoizer is shared; [`KeyedMemoizer::clear`]
//! takes `&mut self`.

use core::convert::Infallible;
use core::fmt;
#[cfg(any(feature = "async-tokio", feature = "async-tokio-mt"))]
use core::future::Future;
use core::hash::Hash;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::cell::MemoCell;
use crate::collector::ParallelCollector;
use crate::error::Error;

/// A table of memo cells, one per key, each computed at most once.
///
/// Values are handed out by clone; wrap expensive values in an [`Arc`].
///
/// A factory must not wait on its own key. It may request other keys of the same
/// memoizer as long as the requests do not form a cycle.
pub struct KeyedMemoizer<K, V, E = Infallible> {
   cells: RwLock<HashMap<K, Arc<MemoCell<V, E>>>>,
   collector: ParallelCollector,
}

impl<K, V, E> KeyedMemoizer<K, V, E> {
   /// Creates an empty memoizer that materializes on rayon's global pool.
   #[must_use]
   pub fn new() -> Self {
      Self::with_collector(ParallelCollector::default())
   }

   /// Creates an empty memoizer that materializes through `collector`.
   #[must_use]
   pub fn with_collector(collector: ParallelCollector) -> Self {
      Self {
         cells: RwLock::new(HashMap::new()),
         collector,
      }
   }

   /// The collector used by [`KeyedMemoizer::materialize`].
   pub fn collector(&self) -> &ParallelCollector {
      &self.collector
   }

   /// Number of keys that have been requested.
   pub fn len(&self) -> usize {
      self.cells.read().len()
   }

   pub fn is_empty(&self) -> bool {
      self.cells.read().is_empty()
   }

   /// Forgets every key. The next request for a key runs its factory again.
   pub fn clear(&mut self) {
      self.cells.get_mut().clear();
   }
}

impl<K: Eq + Hash + Clone, V, E> KeyedMemoizer<K, V, E> {
   /// Returns the cell for `key`, installing an empty one on first request.
   fn cell(&self, key: &K) -> Arc<MemoCell<V, E>> {
      if let Some(cell) = self.cells.read().get(key) {
         return Arc::clone(cell);
      }
      let mut cells = self.cells.write();
      Arc::clone(cells.entry(key.clone()).or_default())
   }

   /// Seeds `key` with `value` so its factory never runs.
   ///
   /// Fails with `Err(value)` if the key already has an outcome or is being computed.
   pub fn try_insert(&self, key: K, value: V) -> Result<(), V> {
      self.cell(&key).try_set(value).map(|_| ())
   }

   /// Returns `true` if `key` has been requested.
   pub fn contains_key(&self, key: &K) -> bool {
      self.cells.read().contains_key(key)
   }
}

impl<K: Eq + Hash + Clone, V: Clone, E> KeyedMemoizer<K, V, E> {
   /// Returns the outcome for `key` if its computation has finished.
   ///
   /// Never blocks and never runs a factory.
   pub fn get(&self, key: &K) -> Option<Result<V, Error<E>>> {
      let cell = self.cells.read().get(key).cloned()?;
      cell.get().map(|outcome| outcome.cloned())
   }

   /// Returns the value for `key`, running `factory` if nobody has yet.
   ///
   /// Blocks while another thread computes the same key. Fails only if an earlier
   /// fallible computation of this key failed or was abandoned.
   pub fn get_or_compute<F>(&self, key: K, factory: F) -> Result<V, Error<E>>
   where
      F: FnOnce(&K) -> V,
   {
      self.get_or_try_compute(key, |key| Ok(factory(key)))
   }

   /// Returns the value for `key`, running the fallible `factory` if nobody has yet.
   ///
   /// - The caller that runs a failing factory gets [`Error::WorkerFailure`].
   /// - Every other caller of that key, concurrent or later, gets
   ///   [`Error::AlreadyFailed`] with the same `Arc`'d error.
   ///
   /// A failed key is never retried.
   pub fn get_or_try_compute<F>(&self, key: K, factory: F) -> Result<V, Error<E>>
   where
      F: FnOnce(&K) -> Result<V, E>,
   {
      let cell = self.cell(&key);
      cell.get_or_try_init(|| factory(&key)).cloned()
   }

   /// Async form of [`KeyedMemoizer::get_or_try_compute`].
   ///
   /// Dropping the future while it runs the factory abandons the key; its waiters
   /// and later callers get [`Error::Abandoned`].
   #[cfg(any(feature = "async-tokio", feature = "async-tokio-mt"))]
   pub async fn get_or_try_compute_async<F, Fut>(&self, key: K, factory: F) -> Result<V, Error<E>>
   where
      F: FnOnce(&K) -> Fut,
      Fut: Future<Output = Result<V, E>>,
   {
      let cell = self.cell(&key);
      cell.get_or_try_init_async(|| factory(&key)).await.cloned()
   }

   /// Copies every successfully computed entry.
   ///
   /// Keys that are still running, failed, or were abandoned are left out.
   pub fn snapshot(&self) -> HashMap<K, V> {
      self
         .cells
         .read()
         .iter()
         .filter_map(|(key, cell)| match cell.get() {
            Some(Ok(value)) => Some((key.clone(), value.clone())),
            _ => None,
         })
         .collect()
   }
}

impl<K, V, E> KeyedMemoizer<K, V, E>
where
   K: Eq + Hash + Clone + Send + Sync,
   V: Clone + Send + Sync,
   E: Send + Sync,
{
   /// Forces every key through the memoizer on the collector's pool and returns a
   /// map from each key to its value.
   ///
   /// Keys computed by an earlier call are not recomputed. Duplicate keys appear once.
   /// If any key fails, the whole call fails with that key's error and no map is
   /// returned; the other keys still keep their computed values.
   pub fn materialize<I, F>(&self, keys: I, factory: F) -> Result<HashMap<K, V>, Error<E>>
   where
      I: IntoIterator<Item = K>,
      F: Fn(&K) -> Result<V, E> + Sync + Send,
   {
      let entries = self.collector.dispatch(keys, |key: K| {
         let value = self.get_or_try_compute(key.clone(), &factory)?;
         Ok::<_, Error<E>>((key, value))
      })?;
      let map: HashMap<K, V> = entries.into_iter().collect();
      tracing::debug!(entries = map.len(), "materialized memo table");
      Ok(map)
   }

   /// Like [`KeyedMemoizer::materialize`], but reports each key's outcome instead of
   /// failing as a whole.
   pub fn materialize_outcomes<I, F>(&self, keys: I, factory: F) -> HashMap<K, Result<V, Error<E>>>
   where
      I: IntoIterator<Item = K>,
      F: Fn(&K) -> Result<V, E> + Sync + Send,
   {
      self
         .collector
         .collect(keys, |key: K| {
            let outcome = self.get_or_try_compute(key.clone(), &factory);
            (key, outcome)
         })
         .into_iter()
         .collect()
   }
}

impl<K, V, E> Default for KeyedMemoizer<K, V, E> {
   fn default() -> Self {
      Self::new()
   }
}

impl<K, V, E> fmt::Debug for KeyedMemoizer<K, V, E> {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("KeyedMemoizer")
         .field("keys", &self.len())
         .field("collector", &self.collector)
         .finish()
   }
}
