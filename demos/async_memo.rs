use std::sync::Arc;

use keyed_once::KeyedMemoizer;
use tokio::time::{sleep, Duration};

async fn fetch_profile(user: u64) -> Result<String, String> {
   println!("fetching profile {user}...");
   sleep(Duration::from_millis(50)).await;
   if user == 13 {
      Err(format!("profile {user} not found"))
   } else {
      Ok(format!("profile of user {user}"))
   }
}

#[tokio::main]
async fn main() {
   let profiles: Arc<KeyedMemoizer<u64, String, String>> = Arc::new(KeyedMemoizer::new());

   let tasks: Vec<_> = [1, 2, 1, 13, 2, 13, 1]
      .into_iter()
      .map(|user| {
         let profiles = Arc::clone(&profiles);
         tokio::spawn(async move {
            let outcome = profiles
               .get_or_try_compute_async(user, |user| fetch_profile(*user))
               .await;
            (user, outcome)
         })
      })
      .collect();

   for task in tasks {
      match task.await.unwrap() {
         (user, Ok(profile)) => println!("user {user}: {profile}"),
         (user, Err(e)) => println!("user {user} failed: {e}"),
      }
   }
   // Each distinct user was fetched once
   assert_eq!(profiles.len(), 3);
}
