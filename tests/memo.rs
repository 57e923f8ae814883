use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use keyed_once::{CollectorConfig, Dispatch, Error, KeyedMemoizer, ParallelCollector};

fn memo_with_workers<V, E>(workers: usize) -> KeyedMemoizer<u32, V, E> {
   KeyedMemoizer::with_collector(ParallelCollector::with_workers(workers).unwrap())
}

#[test]
fn test_get_or_compute_runs_once() {
   let memo: KeyedMemoizer<&str, usize> = KeyedMemoizer::new();
   let counter = AtomicUsize::new(0);
   let compute = |key: &&str| {
      counter.fetch_add(1, Ordering::SeqCst);
      key.len()
   };
   assert_eq!(memo.get_or_compute("hello", compute), Ok(5));
   assert_eq!(memo.get_or_compute("hello", compute), Ok(5));
   assert_eq!(memo.get_or_compute("hi", compute), Ok(2));
   assert_eq!(counter.load(Ordering::SeqCst), 2);
   assert_eq!(memo.len(), 2);
   assert!(memo.contains_key(&"hello"));
   assert!(!memo.contains_key(&"absent"));
}

#[test]
fn test_concurrent_requests_share_one_execution() {
   let memo: Arc<KeyedMemoizer<u32, Arc<String>>> = Arc::new(KeyedMemoizer::new());
   let counter = Arc::new(AtomicUsize::new(0));
   let barrier = Arc::new(Barrier::new(16));

   let threads: Vec<_> = (0..16)
      .map(|_| {
         let memo = Arc::clone(&memo);
         let counter = Arc::clone(&counter);
         let barrier = Arc::clone(&barrier);
         thread::spawn(move || {
            barrier.wait();
            memo
               .get_or_compute(7, |k| {
                  counter.fetch_add(1, Ordering::SeqCst);
                  thread::sleep(Duration::from_millis(20));
                  Arc::new(format!("value-{k}"))
               })
               .unwrap()
         })
      })
      .collect();

   let values: Vec<Arc<String>> = threads.into_iter().map(|h| h.join().unwrap()).collect();
   assert_eq!(counter.load(Ordering::SeqCst), 1);
   // Every caller holds the very same allocation
   for value in &values {
      assert!(Arc::ptr_eq(value, &values[0]));
   }
   assert_eq!(*values[0], "value-7");
}

#[test]
fn test_materialize_range() {
   let memo = memo_with_workers::<String, std::convert::Infallible>(16);
   let counter = AtomicUsize::new(0);
   let map = memo
      .materialize(0..100, |k| {
         counter.fetch_add(1, Ordering::SeqCst);
         Ok(k.to_string())
      })
      .unwrap();

   assert_eq!(map.len(), 100);
   for k in 0..100u32 {
      assert_eq!(map[&k], k.to_string());
   }
   assert_eq!(counter.load(Ordering::SeqCst), 100);
}

#[test]
fn test_materialize_twice_does_not_recompute() {
   let memo = memo_with_workers::<u64, &str>(8);
   let counter = AtomicUsize::new(0);
   let factory = |k: &u32| {
      counter.fetch_add(1, Ordering::SeqCst);
      Ok(u64::from(*k) * 3)
   };

   let first = memo.materialize(0..50, factory).unwrap();
   let second = memo.materialize(0..50, factory).unwrap();
   assert_eq!(first, second);
   assert_eq!(counter.load(Ordering::SeqCst), 50);

   // Widening the range only computes the new keys
   let wider = memo.materialize(0..60, factory).unwrap();
   assert_eq!(wider.len(), 60);
   assert_eq!(counter.load(Ordering::SeqCst), 60);
}

#[test]
fn test_materialize_with_duplicate_keys() {
   let memo = memo_with_workers::<u32, &str>(4);
   let counter = AtomicUsize::new(0);
   let keys = (0..20).chain(0..20).chain(5..10);
   let map = memo
      .materialize(keys, |k| {
         counter.fetch_add(1, Ordering::SeqCst);
         Ok(k + 1)
      })
      .unwrap();
   assert_eq!(map.len(), 20);
   assert_eq!(counter.load(Ordering::SeqCst), 20);
}

#[test]
fn test_materialize_contended_keys() {
   // Many workers hammer a small key set; each key still runs once.
   let memo = memo_with_workers::<u32, &str>(16);
   let calls: Vec<AtomicUsize> = (0..8).map(|_| AtomicUsize::new(0)).collect();
   let keys: Vec<u32> = (0..400).map(|i| i % 8).collect();
   let map = memo
      .materialize(keys, |k| {
         calls[*k as usize].fetch_add(1, Ordering::SeqCst);
         thread::sleep(Duration::from_millis(fastrand::u64(1..5)));
         Ok(k * 10)
      })
      .unwrap();
   assert_eq!(map.len(), 8);
   for (k, count) in calls.iter().enumerate() {
      assert_eq!(count.load(Ordering::SeqCst), 1, "key {k} ran more than once");
   }
}

#[test]
fn test_failure_reaches_triggering_and_waiting_callers() {
   let memo: Arc<KeyedMemoizer<u32, u32, String>> = Arc::new(KeyedMemoizer::new());
   let started = Arc::new(Barrier::new(2));
   let counter = Arc::new(AtomicUsize::new(0));

   let trigger = {
      let memo = Arc::clone(&memo);
      let started = Arc::clone(&started);
      let counter = Arc::clone(&counter);
      thread::spawn(move || {
         memo.get_or_try_compute(1, |k| {
            counter.fetch_add(1, Ordering::SeqCst);
            started.wait();
            thread::sleep(Duration::from_millis(30));
            Err(format!("key {k} is cursed"))
         })
      })
   };

   started.wait();
   let waited = memo.get_or_try_compute(1, |_| {
      counter.fetch_add(1, Ordering::SeqCst);
      Ok(0)
   });
   let triggered = trigger.join().unwrap();

   let trigger_err = match triggered {
      Err(Error::WorkerFailure(e)) => e,
      other => panic!("expected WorkerFailure, got {other:?}"),
   };
   match waited {
      Err(Error::AlreadyFailed(e)) => assert!(Arc::ptr_eq(&e, &trigger_err)),
      other => panic!("expected AlreadyFailed, got {other:?}"),
   }
   assert_eq!(*trigger_err, "key 1 is cursed");
   assert_eq!(counter.load(Ordering::SeqCst), 1);

   // Unrelated keys are unaffected
   assert_eq!(memo.get_or_try_compute(2, |k| Ok(k * 2)), Ok(4));
   // The failed key stays failed
   assert!(matches!(memo.get(&1), Some(Err(Error::AlreadyFailed(_)))));
}

#[test]
fn test_materialize_fails_but_keeps_other_keys() {
   let memo = memo_with_workers::<u32, String>(4);
   let result = memo.materialize(0..20, |k| {
      if *k == 13 {
         Err(String::from("unlucky"))
      } else {
         Ok(k * k)
      }
   });
   assert!(matches!(result, Err(Error::WorkerFailure(_))));

   // Whatever did complete is still there, and 13 is terminally failed
   let snapshot = memo.snapshot();
   assert!(!snapshot.contains_key(&13));
   for (k, v) in &snapshot {
      assert_eq!(*v, k * k);
   }
   let again = memo.materialize(0..20, |k| Ok(k * k));
   match again {
      Err(Error::AlreadyFailed(e)) => assert_eq!(*e, "unlucky"),
      other => panic!("expected AlreadyFailed, got {other:?}"),
   }
}

#[test]
fn test_materialize_outcomes_reports_every_key() {
   let memo = memo_with_workers::<u32, String>(4);
   let outcomes = memo.materialize_outcomes(0..10, |k| {
      if k % 3 == 0 {
         Err(format!("no multiples of three: {k}"))
      } else {
         Ok(*k)
      }
   });
   assert_eq!(outcomes.len(), 10);
   for (k, outcome) in &outcomes {
      if k % 3 == 0 {
         assert!(matches!(outcome, Err(Error::WorkerFailure(_))));
      } else {
         assert_eq!(outcome, &Ok(*k));
      }
   }
}

#[test]
fn test_get_does_not_compute() {
   let memo: KeyedMemoizer<u32, u32> = KeyedMemoizer::new();
   assert_eq!(memo.get(&3), None);
   assert!(memo.is_empty());
   memo.get_or_compute(3, |k| k + 1).unwrap();
   assert_eq!(memo.get(&3), Some(Ok(4)));
}

#[test]
fn test_sequential_dispatch_matches_parallel() {
   let sequential: KeyedMemoizer<u32, u32> = KeyedMemoizer::with_collector(
      ParallelCollector::new(CollectorConfig::default().with_dispatch(Dispatch::Sequential))
         .unwrap(),
   );
   let parallel = memo_with_workers::<u32, std::convert::Infallible>(8);
   let a = sequential.materialize(0..64, |k| Ok(k ^ 0x55)).unwrap();
   let b = parallel.materialize(0..64, |k| Ok(k ^ 0x55)).unwrap();
   assert_eq!(a, b);
}

#[test]
fn test_try_insert_seeds_key() {
   let memo: KeyedMemoizer<u32, u32> = KeyedMemoizer::new();
   assert_eq!(memo.try_insert(5, 500), Ok(()));
   assert_eq!(memo.try_insert(5, 1), Err(1));
   let value = memo.get_or_compute(5, |_| panic!("seeded key must not be computed"));
   assert_eq!(value, Ok(500));
   let map = memo.materialize(4..6, |k| Ok(*k)).unwrap();
   assert_eq!(map[&4], 4);
   assert_eq!(map[&5], 500);
}

#[test]
fn test_clear_forgets_keys() {
   let mut memo: KeyedMemoizer<u32, u32> = KeyedMemoizer::new();
   let counter = AtomicUsize::new(0);
   let factory = |k: &u32| {
      counter.fetch_add(1, Ordering::SeqCst);
      *k
   };
   memo.get_or_compute(1, factory).unwrap();
   memo.clear();
   assert!(memo.is_empty());
   memo.get_or_compute(1, factory).unwrap();
   assert_eq!(counter.load(Ordering::SeqCst), 2);
}

#[test]
fn test_snapshot_matches_materialized_map() {
   let memo = memo_with_workers::<String, std::convert::Infallible>(4);
   let map = memo.materialize(0..30, |k| Ok(format!("#{k}"))).unwrap();
   let snapshot: HashMap<u32, String> = memo.snapshot();
   assert_eq!(map, snapshot);
}

#[test]
fn test_panicking_factory_abandons_key() {
   let memo: Arc<KeyedMemoizer<u32, u32>> = Arc::new(KeyedMemoizer::new());
   let handle = {
      let memo = Arc::clone(&memo);
      thread::spawn(move || {
         let _ = memo.get_or_compute(9, |_| panic!("factory panicked"));
      })
   };
   assert!(handle.join().is_err());
   assert_eq!(memo.get_or_compute(9, |k| *k), Err(Error::Abandoned));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_async_requests_share_one_execution() {
   let memo: Arc<KeyedMemoizer<u32, String>> = Arc::new(KeyedMemoizer::new());
   let counter = Arc::new(AtomicUsize::new(0));

   let tasks: Vec<_> = (0..12)
      .map(|i| {
         let memo = Arc::clone(&memo);
         let counter = Arc::clone(&counter);
         tokio::spawn(async move {
            memo
               .get_or_try_compute_async(i % 3, |k| {
                  let k = *k;
                  async move {
                     counter.fetch_add(1, Ordering::SeqCst);
                     tokio::time::sleep(Duration::from_millis(10)).await;
                     Ok(format!("async-{k}"))
                  }
               })
               .await
         })
      })
      .collect();

   for (i, task) in tasks.into_iter().enumerate() {
      assert_eq!(task.await.unwrap(), Ok(format!("async-{}", i % 3)));
   }
   assert_eq!(counter.load(Ordering::SeqCst), 3);
}
