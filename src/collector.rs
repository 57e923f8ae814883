//! Fork-join collection over a worker pool.
//!
//! [`ParallelCollector`] runs a per-item function over a finite input and returns the
//! results once every worker has joined. Items are buffered into a `Vec` before they
//! are handed to rayon, so slow iterators are drained up front and no mutex sits
//! between the workers and the input.

use std::convert::Infallible;
use std::sync::Arc;

use rayon::iter::{IntoParallelIterator, ParallelIterator};

use crate::error::{BuildError, Error};

/// How a batch is spread over threads.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Dispatch {
   /// Run on a rayon pool.
   #[default]
   Parallel,
   /// Run every item on the calling thread, in input order.
   Sequential,
}

/// Configuration for a [`ParallelCollector`].
#[derive(Clone, Debug, Default)]
pub struct CollectorConfig {
   /// Size of a dedicated pool. `None` uses rayon's global pool, which is sized to
   /// the available parallelism.
   pub workers: Option<usize>,
   /// Parallel or inline dispatch.
   pub dispatch: Dispatch,
   /// Name prefix for the threads of a dedicated pool.
   pub thread_name: Option<String>,
}

impl CollectorConfig {
   /// Uses a dedicated pool of `workers` threads.
   #[must_use]
   pub fn with_workers(mut self, workers: usize) -> Self {
      self.workers = Some(workers);
      self
   }

   /// Selects parallel or sequential dispatch.
   #[must_use]
   pub fn with_dispatch(mut self, dispatch: Dispatch) -> Self {
      self.dispatch = dispatch;
      self
   }

   /// Names the threads of a dedicated pool `{prefix}-{index}`.
   #[must_use]
   pub fn with_thread_name(mut self, prefix: impl Into<String>) -> Self {
      self.thread_name = Some(prefix.into());
      self
   }
}

/// Runs a worker function over every item of a batch and gathers the results.
///
/// The returned `Vec` is a bag: callers must not rely on its order. Cloning a
/// collector shares its pool.
#[derive(Clone, Debug, Default)]
pub struct ParallelCollector {
   pool: Option<Arc<rayon::ThreadPool>>,
   dispatch: Dispatch,
}

impl ParallelCollector {
   /// Builds a collector from `config`.
   ///
   /// Fails with [`BuildError::InvalidInput`] if `config.workers` is zero.
   pub fn new(config: CollectorConfig) -> Result<Self, BuildError> {
      let pool = match (config.dispatch, config.workers) {
         (_, Some(0)) => return Err(BuildError::InvalidInput("worker count must be non-zero")),
         (Dispatch::Parallel, Some(workers)) => {
            let mut builder = rayon::ThreadPoolBuilder::new().num_threads(workers);
            if let Some(prefix) = config.thread_name {
               builder = builder.thread_name(move |index| format!("{prefix}-{index}"));
            }
            Some(Arc::new(builder.build()?))
         }
         _ => None,
      };
      Ok(Self {
         pool,
         dispatch: config.dispatch,
      })
   }

   /// Builds a collector with a dedicated pool of `workers` threads.
   pub fn with_workers(workers: usize) -> Result<Self, BuildError> {
      Self::new(CollectorConfig::default().with_workers(workers))
   }

   /// A collector that runs every batch on the calling thread.
   #[must_use]
   pub fn sequential() -> Self {
      Self {
         pool: None,
         dispatch: Dispatch::Sequential,
      }
   }

   /// Number of threads a batch may use.
   pub fn workers(&self) -> usize {
      match (&self.pool, self.dispatch) {
         (_, Dispatch::Sequential) => 1,
         (Some(pool), Dispatch::Parallel) => pool.current_num_threads(),
         (None, Dispatch::Parallel) => rayon::current_num_threads(),
      }
   }

   /// Runs `worker` for every item and returns one result per item.
   ///
   /// Blocks until every invocation has returned. A panicking worker resumes its
   /// panic on the caller once the batch has joined.
   pub fn collect<I, R, F>(&self, items: I, worker: F) -> Vec<R>
   where
      I: IntoIterator,
      I::Item: Send,
      R: Send,
      F: Fn(I::Item) -> R + Sync + Send,
   {
      match self.dispatch(items, |item| Ok::<_, Infallible>(worker(item))) {
         Ok(results) => results,
         Err(never) => match never {},
      }
   }

   /// Runs the fallible `worker` for every item.
   ///
   /// On success the bag holds one result per item. If any invocation fails, the
   /// batch fails with [`Error::WorkerFailure`] carrying one of the errors once the
   /// in-flight invocations have settled; items not yet started are skipped.
   pub fn try_collect<I, R, E, F>(&self, items: I, worker: F) -> Result<Vec<R>, Error<E>>
   where
      I: IntoIterator,
      I::Item: Send,
      R: Send,
      E: Send,
      F: Fn(I::Item) -> Result<R, E> + Sync + Send,
   {
      self
         .dispatch(items, worker)
         .map_err(|e| Error::WorkerFailure(Arc::new(e)))
   }

   /// Runs the fallible `worker` for every item, even after a failure.
   ///
   /// Fails with [`Error::Aggregate`] holding every error if any invocation failed.
   pub fn try_collect_all<I, R, E, F>(&self, items: I, worker: F) -> Result<Vec<R>, Error<E>>
   where
      I: IntoIterator,
      I::Item: Send,
      R: Send,
      E: Send + Sync,
      F: Fn(I::Item) -> Result<R, E> + Sync + Send,
   {
      let (values, errors): (Vec<_>, Vec<_>) = self
         .collect(items, worker)
         .into_iter()
         .partition(Result::is_ok);
      if errors.is_empty() {
         Ok(values.into_iter().filter_map(Result::ok).collect())
      } else {
         let errors: Vec<Arc<E>> = errors
            .into_iter()
            .filter_map(Result::err)
            .map(Arc::new)
            .collect();
         tracing::debug!(failures = errors.len(), "batch failed");
         Err(Error::Aggregate(errors))
      }
   }

   /// Fallible dispatch that hands the worker's own error back unchanged.
   pub(crate) fn dispatch<I, R, X, F>(&self, items: I, worker: F) -> Result<Vec<R>, X>
   where
      I: IntoIterator,
      I::Item: Send,
      R: Send,
      X: Send,
      F: Fn(I::Item) -> Result<R, X> + Sync + Send,
   {
      let items: Vec<I::Item> = items.into_iter().collect();
      tracing::debug!(items = items.len(), workers = self.workers(), "dispatching batch");
      match self.dispatch {
         Dispatch::Sequential => items.into_iter().map(worker).collect(),
         Dispatch::Parallel => self.install(|| items.into_par_iter().map(worker).collect()),
      }
   }

   fn install<OP, R>(&self, op: OP) -> R
   where
      OP: FnOnce() -> R + Send,
      R: Send,
   {
      match &self.pool {
         Some(pool) => pool.install(op),
         None => op(),
      }
   }
}
