use std::sync::atomic::{AtomicUsize, Ordering};

use keyed_once::{KeyedMemoizer, ParallelCollector};

static CALLS: AtomicUsize = AtomicUsize::new(0);

fn expensive_label(key: &u32) -> String {
   CALLS.fetch_add(1, Ordering::Relaxed);
   std::thread::sleep(std::time::Duration::from_millis(2));
   key.to_string()
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
   tracing_subscriber::fmt()
      .with_max_level(tracing::Level::DEBUG)
      .init();

   let collector = ParallelCollector::with_workers(16)?;

   // Fill a list from many workers; order is not preserved
   let items: Vec<String> = (0..20).map(|i| format!("item {i}")).collect();
   let list = collector.collect(items, |item| item);
   println!("collected {} items", list.len());

   // Fill a dictionary where each key's value is computed exactly once
   let memo: KeyedMemoizer<u32, String> = KeyedMemoizer::with_collector(collector);
   let map = memo.materialize(0..100, |k| Ok(expensive_label(k)))?;
   let again = memo.materialize(0..100, |k| Ok(expensive_label(k)))?;
   assert_eq!(map, again);

   println!(
      "materialized {} entries with {} factory calls",
      map.len(),
      CALLS.load(Ordering::Relaxed)
   );
   assert_eq!(CALLS.load(Ordering::Relaxed), 100);
   Ok(())
}
