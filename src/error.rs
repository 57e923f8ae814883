use std::sync::Arc;

use thiserror::Error;

/// Failure of a memoized computation or a collected batch.
///
/// The worker's own error is shared through an [`Arc`] so that every caller of a
/// failed key observes the very same error value.
#[derive(Debug, Error)]
pub enum Error<E> {
   /// The computation run on behalf of this call returned an error.
   #[error("worker failed: {0}")]
   WorkerFailure(Arc<E>),
   /// The key's only execution already failed, in this thread or another.
   #[error("computation already failed: {0}")]
   AlreadyFailed(Arc<E>),
   /// The executing thread panicked or its future was dropped before publishing.
   #[error("computation was abandoned before publishing a result")]
   Abandoned,
   /// Every failure of a batch run with `try_collect_all`.
   #[error("{} workers failed", .0.len())]
   Aggregate(Vec<Arc<E>>),
}

impl<E> Error<E> {
   /// Returns the underlying worker error for single-failure variants.
   pub fn worker_error(&self) -> Option<&Arc<E>> {
      match self {
         Self::WorkerFailure(e) | Self::AlreadyFailed(e) => Some(e),
         Self::Abandoned | Self::Aggregate(_) => None,
      }
   }
}

impl<E> Clone for Error<E> {
   fn clone(&self) -> Self {
      match self {
         Self::WorkerFailure(e) => Self::WorkerFailure(Arc::clone(e)),
         Self::AlreadyFailed(e) => Self::AlreadyFailed(Arc::clone(e)),
         Self::Abandoned => Self::Abandoned,
         Self::Aggregate(errors) => Self::Aggregate(errors.clone()),
      }
   }
}

impl<E: PartialEq> PartialEq for Error<E> {
   fn eq(&self, other: &Self) -> bool {
      match (self, other) {
         (Self::WorkerFailure(a), Self::WorkerFailure(b))
         | (Self::AlreadyFailed(a), Self::AlreadyFailed(b)) => a == b,
         (Self::Abandoned, Self::Abandoned) => true,
         (Self::Aggregate(a), Self::Aggregate(b)) => a == b,
         _ => false,
      }
   }
}

/// Failure to build a [`ParallelCollector`](crate::ParallelCollector).
#[derive(Debug, Error)]
pub enum BuildError {
   /// The configuration cannot describe a working pool.
   #[error("invalid input: {0}")]
   InvalidInput(&'static str),
   /// rayon could not spawn the pool.
   #[error("failed to build worker pool: {0}")]
   ThreadPool(#[from] rayon::ThreadPoolBuildError),
}
