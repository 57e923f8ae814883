//! Exactly-once keyed memoization and fork-join collection.
//!
//! This crate provides the pieces needed to fill shared collections from many threads
//! while running each expensive per-key computation only once:
//!
//! - [`ParallelCollector`]: runs a worker over every item of a batch on a rayon pool
//!   and returns the results once every worker has joined.
//! - [`KeyedMemoizer<K, V, E>`]: a table of memo cells where the factory for a key runs
//!   exactly once, no matter how many threads ask for it at the same time.
//! - [`MemoCell<T, E>`]: the single-key cell underneath, usable on its own.
//!
//! Cells use atomic operations with `parking_lot`'s futex-based parking. Once a cell
//! holds a value or an error, reads need no locking. A failed computation is final:
//! the caller that ran it gets [`Error::WorkerFailure`] and everyone else gets
//! [`Error::AlreadyFailed`] with the same error.
//!
//! # Examples
//!
//! ## Materializing a key range
//!
//! ```rust
//! use keyed_once::{KeyedMemoizer, ParallelCollector};
//!
//! let memo: KeyedMemoizer<u32, String> =
//!    KeyedMemoizer::with_collector(ParallelCollector::with_workers(16).unwrap());
//!
//! let map = memo.materialize(0..100, |k| Ok(k.to_string())).unwrap();
//! assert_eq!(map.len(), 100);
//! assert_eq!(map[&42], "42");
//! ```
//!
//! ## Collecting a batch
//!
//! ```rust
//! use keyed_once::ParallelCollector;
//!
//! let collector = ParallelCollector::default();
//! let mut squares = collector.collect(1..=4, |x: u64| x * x);
//! squares.sort_unstable();
//! assert_eq!(squares, vec![1, 4, 9, 16]);
//! ```

/// Single-key memo cell.
mod cell;

/// Fork-join collection over a worker pool.
mod collector;

mod error;

/// Keyed memo table.
mod memo;

/// Internal synchronization state management.
mod state;

pub use cell::MemoCell;
pub use collector::{CollectorConfig, Dispatch, ParallelCollector};
pub use error::{BuildError, Error};
pub use memo::KeyedMemoizer;
