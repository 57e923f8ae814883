//! Internal synchronization state for memo cells.
//!
//! This module provides the low-level state machine used by [`MemoCell`](crate::MemoCell).
//! It is built from atomic operations and futex-based waiting via `parking_lot_core`.
//!
//! The state is packed into a single `AtomicU8` with the following layout:
//! - Bit 0: LOCKED - A winner is running the initializer
//! - Bit 1: WAITING - At least one thread is parked on the cell
//! - Bit 2: READY - A value was published
//! - Bit 3: FAILED - An error was published
//! - Bit 4: ABANDONED - The winner went away without publishing
//!
//! Transitions are monotonic: `0 -> LOCKED[|WAITING] -> {READY, FAILED, ABANDONED}`.
//! Once one of the terminal bits is set the byte never changes again, so there is
//! no epoch counter and no way back to the empty state while the cell is shared.

use core::mem;
use core::sync::atomic::{AtomicU8, Ordering};

use parking_lot_core::{DEFAULT_PARK_TOKEN, DEFAULT_UNPARK_TOKEN};

/// Terminal state observed on a cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Settled {
   /// The slot holds a value.
   Ready,
   /// The slot holds an error.
   Failed,
   /// The slot is empty and will stay empty.
   Abandoned,
}

/// Result of trying to claim a cell.
pub(crate) enum Claim<'a> {
   /// The caller owns the initializer and must publish through the guard.
   Won(CellGuard<'a>),
   /// The cell already reached a terminal state.
   Settled(Settled),
}

/// Atomic state for a single memo cell.
#[repr(transparent)]
pub(crate) struct CellLock(AtomicU8);

impl CellLock {
   const LOCKED: u8 = 1;
   const WAITING: u8 = 2;
   const READY: u8 = 4;
   const FAILED: u8 = 8;
   const ABANDONED: u8 = 16;
   const TERMINAL: u8 = Self::READY | Self::FAILED | Self::ABANDONED;

   /// Creates the state of an empty cell.
   #[inline]
   pub(crate) const fn new() -> Self {
      Self(AtomicU8::new(0))
   }

   /// Creates the state of a cell that already holds a value.
   #[inline]
   pub(crate) const fn ready() -> Self {
      Self(AtomicU8::new(Self::READY))
   }

   /// Creates the state of a cell that already holds an error.
   #[inline]
   pub(crate) const fn failed() -> Self {
      Self(AtomicU8::new(Self::FAILED))
   }

   #[inline(always)]
   const fn decode(state: u8) -> Option<Settled> {
      if state & Self::READY != 0 {
         Some(Settled::Ready)
      } else if state & Self::FAILED != 0 {
         Some(Settled::Failed)
      } else if state & Self::ABANDONED != 0 {
         Some(Settled::Abandoned)
      } else {
         None
      }
   }

   /// Returns the terminal state, if any.
   ///
   /// Uses `Acquire` so that a `Some` result makes the published slot visible.
   #[inline]
   pub(crate) fn settled(&self) -> Option<Settled> {
      Self::decode(self.0.load(Ordering::Acquire))
   }

   /// Returns `true` while a winner holds the cell.
   #[inline]
   pub(crate) fn is_locked(&self) -> bool {
      let state = self.0.load(Ordering::Relaxed);
      state & Self::LOCKED != 0 && state & Self::TERMINAL == 0
   }

   /// Wakes every thread parked on this cell.
   #[inline]
   fn notify_all(&self) {
      // SAFETY: `park` and `unpark_all` are keyed by the same address, the atomic byte.
      unsafe {
         parking_lot_core::unpark_all(self.0.as_ptr() as usize, DEFAULT_UNPARK_TOKEN);
      }
   }

   /// Parks the current thread while the state still equals `expected_state`.
   #[inline]
   fn wait(&self, expected_state: u8) {
      // SAFETY: See `notify_all`.
      unsafe {
         // The validate closure runs under the bucket lock, so a publish that lands
         // between our load and the sleep is never missed.
         let _ = parking_lot_core::park(
            self.0.as_ptr() as usize,
            || self.0.load(Ordering::Acquire) == expected_state,
            || {},
            |_, _| {},
            DEFAULT_PARK_TOKEN,
            None,
         );
      }
   }

   /// Swaps in a terminal bit and wakes waiters if any registered.
   #[inline]
   fn publish(&self, terminal: u8) {
      // Release pairs with the Acquire in `settled`, ordering the slot write first.
      let prev_state = self.0.swap(terminal, Ordering::Release);
      debug_assert!(prev_state & Self::LOCKED != 0, "publish without holding the cell");
      debug_assert!(prev_state & Self::TERMINAL == 0, "cell published twice");
      if prev_state & Self::WAITING != 0 {
         self.notify_all();
      }
   }

   /// One attempt at claiming the cell.
   ///
   /// Returns:
   ///   - `Ok(claim)`: the cell was claimed or is already terminal.
   ///   - `Err(state)`: another thread holds the cell. Unless `nowait` is set, `state`
   ///     carries the WAITING flag, so it is safe to park on it.
   #[inline]
   fn claim_step(&self, nowait: bool) -> Result<Claim<'_>, u8> {
      loop {
         let current_state = self.0.load(Ordering::Acquire);
         if let Some(settled) = Self::decode(current_state) {
            return Ok(Claim::Settled(settled));
         }

         if current_state & Self::LOCKED == 0 {
            match self.0.compare_exchange_weak(
               current_state,
               current_state | Self::LOCKED,
               Ordering::Acquire,
               Ordering::Relaxed,
            ) {
               Ok(_) => return Ok(Claim::Won(CellGuard::new(self))),
               Err(_) => {
                  std::hint::spin_loop();
                  continue;
               }
            }
         }

         if !nowait && current_state & Self::WAITING == 0 {
            let new_state = current_state | Self::WAITING;
            match self.0.compare_exchange_weak(
               current_state,
               new_state,
               Ordering::Relaxed,
               Ordering::Relaxed,
            ) {
               Ok(_) => return Err(new_state),
               Err(_) => {
                  std::hint::spin_loop();
                  continue;
               }
            }
         }
         return Err(current_state);
      }
   }

   /// Claims the cell, parking until it is terminal if another thread holds it.
   pub(crate) fn claim(&self) -> Claim<'_> {
      let mut state = match self.claim_step(false) {
         Ok(claim) => return claim,
         Err(state) => state,
      };
      tracing::trace!("cell in progress, parking");
      loop {
         self.wait(state);
         match self.claim_step(false) {
            Ok(claim) => return claim,
            Err(new_state) => state = new_state,
         }
      }
   }

   /// Claims the cell without blocking.
   ///
   /// Returns `None` while another thread holds the cell.
   #[inline]
   pub(crate) fn try_claim(&self) -> Option<Claim<'_>> {
      self.claim_step(true).ok()
   }

   /// Claims the cell from async code.
   ///
   /// Spins with `yield_now` first. On a multi-thread runtime it then parks inside
   /// `block_in_place`; otherwise it keeps yielding so the winner can make progress.
   #[cfg(any(feature = "async-tokio", feature = "async-tokio-mt"))]
   pub(crate) async fn claim_async(&self) -> Claim<'_> {
      loop {
         for _ in 0..16 {
            match self.claim_step(false) {
               Ok(claim) => return claim,
               Err(state) => {
                  for _ in 0..32 {
                     tokio::task::yield_now().await;
                     if self.0.load(Ordering::Relaxed) != state {
                        break;
                     }
                  }
               }
            }
         }

         #[cfg(feature = "async-tokio-mt")]
         {
            if can_block_in_place() {
               return match self.claim_step(false) {
                  Ok(claim) => claim,
                  Err(state) => tokio::task::block_in_place(|| {
                     self.wait(state);
                     self.claim()
                  }),
               };
            }
         }
      }
   }
}

/// `block_in_place` panics outside the multi-thread scheduler.
#[cfg(feature = "async-tokio-mt")]
fn can_block_in_place() -> bool {
   tokio::runtime::Handle::try_current()
      .map(|handle| handle.runtime_flavor() == tokio::runtime::RuntimeFlavor::MultiThread)
      .unwrap_or(false)
}

/// RAII guard held by the winner of a cell.
///
/// Must be consumed by [`CellGuard::ready`] or [`CellGuard::fail`]. Dropping it
/// (panic or cancelled future) moves the cell to ABANDONED and wakes every waiter.
pub(crate) struct CellGuard<'a> {
   state: &'a CellLock,
}

impl<'a> CellGuard<'a> {
   #[inline(always)]
   const fn new(state: &'a CellLock) -> Self {
      Self { state }
   }

   /// Publishes a value written to the slot.
   #[inline]
   pub(crate) fn ready(self) {
      self.state.publish(CellLock::READY);
      mem::forget(self);
   }

   /// Publishes an error written to the slot.
   #[inline]
   pub(crate) fn fail(self) {
      self.state.publish(CellLock::FAILED);
      mem::forget(self);
   }
}

impl Drop for CellGuard<'_> {
   #[inline]
   fn drop(&mut self) {
      tracing::debug!("memoized computation abandoned before publishing");
      self.state.publish(CellLock::ABANDONED);
   }
}
