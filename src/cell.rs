//! Single-key memo cell.
//!
//! This module provides [`MemoCell<T, E>`], a thread-safe cell whose initializer runs
//! at most once. Unlike a plain once cell, a failed initializer is final: the error is
//! stored in the cell and handed to every later caller instead of letting the next
//! caller try again.
//!
//! Reads of a terminal cell are a single `Acquire` load. Callers that arrive while the
//! initializer is running park on the cell's state byte until it is published.

use core::cell::UnsafeCell;
#[cfg(any(feature = "async-tokio", feature = "async-tokio-mt"))]
use core::future::Future;
use core::{fmt, mem};
use std::sync::Arc;

use crate::error::Error;
use crate::state::{CellGuard, CellLock, Claim, Settled};

/// A thread-safe cell that runs its initializer at most once and remembers the outcome.
///
/// The outcome is either a value of type `T` or an error of type `E`. Both are
/// terminal. If the initializing thread panics, or an async initializer is dropped
/// mid-flight, the cell becomes abandoned and every caller gets [`Error::Abandoned`].
pub struct MemoCell<T, E> {
   slot: UnsafeCell<mem::MaybeUninit<Result<T, Arc<E>>>>,
   lock: CellLock,
}

impl<T, E> MemoCell<T, E> {
   /// Creates a new, empty cell.
   #[inline]
   #[must_use]
   pub const fn new() -> Self {
      Self {
         lock: CellLock::new(),
         slot: UnsafeCell::new(mem::MaybeUninit::uninit()),
      }
   }

   /// Creates a cell that already holds `value`.
   #[inline]
   #[must_use]
   pub const fn with_value(value: T) -> Self {
      Self {
         lock: CellLock::ready(),
         slot: UnsafeCell::new(mem::MaybeUninit::new(Ok(value))),
      }
   }

   /// Creates a cell that already failed with `error`.
   #[inline]
   #[must_use]
   pub fn with_error(error: E) -> Self {
      Self {
         lock: CellLock::failed(),
         slot: UnsafeCell::new(mem::MaybeUninit::new(Err(Arc::new(error)))),
      }
   }

   /// Returns `true` once the cell holds a value, an error, or was abandoned.
   ///
   /// This method never blocks.
   #[inline]
   pub fn is_settled(&self) -> bool {
      self.lock.settled().is_some()
   }

   /// Returns `true` while an initializer is running.
   #[inline]
   pub fn is_in_progress(&self) -> bool {
      self.lock.is_locked()
   }

   /// Returns the outcome if the cell is terminal, `None` otherwise.
   ///
   /// Errors are reported as [`Error::AlreadyFailed`]. This method never blocks.
   #[inline]
   pub fn get(&self) -> Option<Result<&T, Error<E>>> {
      // SAFETY: `settled` returned a terminal state with Acquire ordering.
      self.lock.settled().map(|settled| unsafe { self.observe(settled) })
   }

   /// Attempts to store `value` without blocking.
   ///
   /// - If the cell is empty and unclaimed, stores `value` and returns `Ok(&value)`.
   /// - If the cell is terminal or an initializer is running, returns `Err(value)`.
   #[inline]
   pub fn try_set(&self, value: T) -> Result<&T, T> {
      let Some(Claim::Won(guard)) = self.lock.try_claim() else {
         return Err(value);
      };
      // SAFETY: We hold the guard, so we have exclusive access to the slot.
      unsafe { (*self.slot.get()).write(Ok(value)) };
      guard.ready();
      // SAFETY: We published READY ourselves.
      match unsafe { self.observe(Settled::Ready) } {
         Ok(value) => Ok(value),
         Err(_) => unreachable!("cell published as ready"),
      }
   }

   /// Gets the value, running `f` if the cell is empty. Blocks while another thread runs it.
   ///
   /// Returns an error only if a previous fallible initializer failed or was abandoned.
   #[inline]
   pub fn get_or_init<F>(&self, f: F) -> Result<&T, Error<E>>
   where
      F: FnOnce() -> T,
   {
      self.get_or_try_init(|| Ok(f()))
   }

   /// Gets the value, running the fallible `f` if the cell is empty. Blocks if needed.
   ///
   /// - If this call runs `f` and it fails, returns [`Error::WorkerFailure`] and the
   ///   cell keeps the error.
   /// - If the cell failed earlier, returns [`Error::AlreadyFailed`] with the same error.
   ///
   /// If multiple threads call this concurrently, only one `f()` execution happens.
   pub fn get_or_try_init<F>(&self, f: F) -> Result<&T, Error<E>>
   where
      F: FnOnce() -> Result<T, E>,
   {
      if let Some(outcome) = self.get() {
         return outcome;
      }
      self.initialize(f)
   }

   /// Async form of [`MemoCell::get_or_try_init`].
   ///
   /// Dropping the returned future while it runs `f` abandons the cell.
   #[cfg(any(feature = "async-tokio", feature = "async-tokio-mt"))]
   pub async fn get_or_try_init_async<F, Fut>(&self, f: F) -> Result<&T, Error<E>>
   where
      F: FnOnce() -> Fut,
      Fut: Future<Output = Result<T, E>>,
   {
      if let Some(outcome) = self.get() {
         return outcome;
      }
      match self.lock.claim_async().await {
         Claim::Won(guard) => {
            let result = f().await;
            // SAFETY: We hold the guard.
            unsafe { self.publish(guard, result) }
         }
         // SAFETY: The claim reported a terminal state.
         Claim::Settled(settled) => unsafe { self.observe(settled) },
      }
   }

   /// Cold path for `get_or_try_init`. Claims the cell and runs the initializer.
   #[cold]
   fn initialize<F>(&self, f: F) -> Result<&T, Error<E>>
   where
      F: FnOnce() -> Result<T, E>,
   {
      match self.lock.claim() {
         Claim::Won(guard) => {
            tracing::trace!("won memo cell, running initializer");
            // A panic in `f` drops the guard, abandoning the cell and waking waiters.
            let result = f();
            // SAFETY: We hold the guard.
            unsafe { self.publish(guard, result) }
         }
         // SAFETY: The claim reported a terminal state.
         Claim::Settled(settled) => unsafe { self.observe(settled) },
      }
   }

   /// Writes `result` to the slot and publishes it.
   ///
   /// # Safety
   ///
   /// `guard` must be the guard of this cell's lock.
   unsafe fn publish(&self, guard: CellGuard<'_>, result: Result<T, E>) -> Result<&T, Error<E>> {
      match result {
         Ok(value) => {
            // SAFETY: The guard gives exclusive access to the slot until it is published.
            unsafe { (*self.slot.get()).write(Ok(value)) };
            guard.ready();
            // SAFETY: We published READY ourselves.
            unsafe { self.observe(Settled::Ready) }
         }
         Err(error) => {
            let error = Arc::new(error);
            // SAFETY: As above.
            unsafe { (*self.slot.get()).write(Err(Arc::clone(&error))) };
            guard.fail();
            tracing::debug!("memoized computation failed");
            Err(Error::WorkerFailure(error))
         }
      }
   }

   /// Reads a terminal outcome.
   ///
   /// # Safety
   ///
   /// `settled` must have been observed on this cell with Acquire ordering.
   unsafe fn observe(&self, settled: Settled) -> Result<&T, Error<E>> {
      if settled == Settled::Abandoned {
         return Err(Error::Abandoned);
      }
      // SAFETY: READY and FAILED are only published after the slot was written, and
      // the slot is never written again.
      match unsafe { (*self.slot.get()).assume_init_ref() } {
         Ok(value) => Ok(value),
         Err(error) => Err(Error::AlreadyFailed(Arc::clone(error))),
      }
   }
}

// SAFETY:
// Sharing `&MemoCell` hands out `&T` and clones of `Arc<E>` to many threads, and the
// value or error may be produced on one thread and dropped on another.
unsafe impl<T: Send + Sync, E: Send + Sync> Sync for MemoCell<T, E> {}
// SAFETY: Moving the cell moves its `T` or `Arc<E>`.
unsafe impl<T: Send, E: Send + Sync> Send for MemoCell<T, E> {}

impl<T, E> Default for MemoCell<T, E> {
   #[inline]
   fn default() -> Self {
      Self::new()
   }
}

impl<T: fmt::Debug, E: fmt::Debug> fmt::Debug for MemoCell<T, E> {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      let mut d = f.debug_tuple("MemoCell");
      match self.get() {
         Some(Ok(v)) => d.field(v),
         Some(Err(Error::Abandoned)) => d.field(&format_args!("<abandoned>")),
         Some(Err(e)) => d.field(&e),
         None if self.is_in_progress() => d.field(&format_args!("<in progress>")),
         None => d.field(&format_args!("<empty>")),
      };
      d.finish()
   }
}

impl<T> From<T> for MemoCell<T, core::convert::Infallible> {
   #[inline]
   fn from(value: T) -> Self {
      Self::with_value(value)
   }
}

impl<T, E> Drop for MemoCell<T, E> {
   #[inline]
   fn drop(&mut self) {
      if matches!(self.lock.settled(), Some(Settled::Ready | Settled::Failed)) {
         // SAFETY: The slot was written and we have exclusive access.
         unsafe { self.slot.get_mut().assume_init_drop() };
      }
   }
}
