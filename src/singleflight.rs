//! Suppresses duplicate concurrent calls for the same key.
//!
//! If many callers miss the cache for the same key at the same time, only the first one (the
//! **leader**) actually performs the work. All others wait for the leader and then receive a
//! clone of its result. This keeps a cold cache from overwhelming the data source behind it
//! (a "cache stampede").
//!
//! The registry of in-flight calls is protected by a mutex which is only held to register or
//! remove a call, never while the work itself runs. Waiting is implemented via a
//! [watch](tokio::sync::watch) channel which acts as one-shot broadcast. Each waiter owns its own
//! receiver, therefore a result which has been published can still be observed after the call
//! has been removed from the registry.
//!
//! # Examples
//! ```
//! # use jwcache::singleflight::Group;
//! # use std::sync::atomic::{AtomicUsize, Ordering};
//! # #[tokio::main]
//! # async fn main() {
//! let flights = Group::new();
//! let calls = AtomicUsize::new(0);
//!
//! let (a, b) = tokio::join!(
//!     flights.work("key", || async {
//!         calls.fetch_add(1, Ordering::SeqCst);
//!         tokio::task::yield_now().await;
//!         42
//!     }),
//!     flights.work("key", || async {
//!         calls.fetch_add(1, Ordering::SeqCst);
//!         42
//!     }),
//! );
//!
//! assert_eq!((a, b), (42, 42));
//! assert_eq!(calls.load(Ordering::SeqCst), 1);
//! # }
//! ```
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;

/// Keeps track of all calls which are currently in flight.
pub struct Group<T> {
    calls: Mutex<HashMap<String, watch::Receiver<Option<T>>>>,
}

/// Determines the role of a caller for a given key.
enum Role<T> {
    Leader(watch::Sender<Option<T>>),
    Waiter(watch::Receiver<Option<T>>),
}

/// Removes the call of the leader from the registry once the leader is done or has been dropped.
struct Flight<'a, T> {
    group: &'a Group<T>,
    key: &'a str,
}

impl<T> Drop for Flight<'_, T> {
    fn drop(&mut self) {
        let _ = self.group.lock().remove(self.key);
    }
}

impl<T> Group<T> {
    /// Returns the number of calls currently in flight.
    pub fn in_flight(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, watch::Receiver<Option<T>>>> {
        // The registry is never left in an inconsistent state, so a poisoned lock can be reused.
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Clone> Default for Group<T> {
    fn default() -> Self {
        Group::new()
    }
}

impl<T: Clone> Group<T> {
    /// Creates a new and empty group.
    pub fn new() -> Self {
        Group {
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Executes and returns the result of the given work, making sure that only one execution is
    /// in flight for the given key at any time.
    ///
    /// If a call for the key is already in flight, this waits for it and returns a clone of its
    /// result without running **work** at all. Errors are passed through just like any other
    /// result, there are no retries.
    ///
    /// If a leader is dropped before it completes (e.g. because its task was cancelled), the
    /// waiting callers are released and race for leadership again, so that one of them runs its
    /// own work.
    pub async fn work<F, Fut>(&self, key: &str, work: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        loop {
            match self.join(key) {
                Role::Leader(sender) => {
                    let _flight = Flight { group: self, key };
                    let result = work().await;
                    let _ = sender.send_replace(Some(result.clone()));

                    return result;
                }
                Role::Waiter(mut receiver) => {
                    if let Ok(result) = receiver.wait_for(|result| result.is_some()).await {
                        if let Some(result) = result.as_ref() {
                            return result.clone();
                        }
                    }

                    // The leader vanished without publishing a result...
                    log::debug!("In-flight call for '{}' was abandoned, retrying...", key);
                }
            }
        }
    }

    /// Either registers a new call for the given key or joins the one in flight.
    fn join(&self, key: &str) -> Role<T> {
        let mut calls = self.lock();
        if let Some(receiver) = calls.get(key) {
            return Role::Waiter(receiver.clone());
        }

        let (sender, receiver) = watch::channel(None);
        let _ = calls.insert(key.to_owned(), receiver);

        Role::Leader(sender)
    }
}

#[cfg(test)]
mod tests {
    use crate::singleflight::Group;
    use crate::testing::test_async;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn concurrent_calls_are_collapsed() {
        test_async(async {
            let flights = Arc::new(Group::new());
            let calls = Arc::new(AtomicUsize::new(0));

            let mut tasks = Vec::new();
            for _ in 0..10 {
                let flights = flights.clone();
                let calls = calls.clone();
                tasks.push(tokio::spawn(async move {
                    flights
                        .work("key", || async {
                            let _ = calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok::<_, String>("value".to_owned())
                        })
                        .await
                }));
            }

            for result in futures::future::join_all(tasks).await {
                assert_eq!(result.unwrap(), Ok("value".to_owned()));
            }

            assert_eq!(calls.load(Ordering::SeqCst), 1);
            assert_eq!(flights.in_flight(), 0);
        });
    }

    #[test]
    fn errors_are_shared_with_all_waiters() {
        test_async(async {
            let flights: Group<Result<String, String>> = Group::new();
            let calls = AtomicUsize::new(0);

            let (a, b, c) = tokio::join!(
                flights.work("key", || async {
                    let _ = calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Err("boom".to_owned())
                }),
                flights.work("key", || async {
                    let _ = calls.fetch_add(1, Ordering::SeqCst);
                    Ok("unexpected".to_owned())
                }),
                flights.work("key", || async {
                    let _ = calls.fetch_add(1, Ordering::SeqCst);
                    Ok("unexpected".to_owned())
                }),
            );

            assert_eq!(a, Err("boom".to_owned()));
            assert_eq!(b, Err("boom".to_owned()));
            assert_eq!(c, Err("boom".to_owned()));
            assert_eq!(calls.load(Ordering::SeqCst), 1);
        });
    }

    #[test]
    fn distinct_keys_do_not_block_each_other() {
        test_async(async {
            let flights = Group::new();
            let calls = AtomicUsize::new(0);

            let (a, b) = tokio::join!(
                flights.work("a", || async {
                    let _ = calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    1
                }),
                flights.work("b", || async {
                    let _ = calls.fetch_add(1, Ordering::SeqCst);
                    2
                }),
            );

            assert_eq!((a, b), (1, 2));
            assert_eq!(calls.load(Ordering::SeqCst), 2);
        });
    }

    #[test]
    fn completed_calls_are_not_replayed() {
        test_async(async {
            let flights = Group::new();

            assert_eq!(flights.work("key", || async { 1 }).await, 1);
            assert_eq!(flights.in_flight(), 0);

            // Once a call is done, the next one for the same key runs its own work...
            assert_eq!(flights.work("key", || async { 2 }).await, 2);
        });
    }

    #[test]
    fn cancelled_calls_are_removed() {
        test_async(async {
            let flights: Arc<Group<String>> = Arc::new(Group::new());

            let leader = {
                let flights = flights.clone();
                tokio::spawn(async move {
                    flights
                        .work("key", || async {
                            tokio::time::sleep(Duration::from_secs(3600)).await;
                            "leader".to_owned()
                        })
                        .await
                })
            };
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert_eq!(flights.in_flight(), 1);

            leader.abort();
            assert!(leader.await.is_err());
            assert_eq!(flights.in_flight(), 0);

            // The key can be used again right away...
            assert_eq!(flights.work("key", || async { "next".to_owned() }).await, "next");
        });
    }

    #[test]
    fn waiters_take_over_if_the_leader_is_cancelled() {
        test_async(async {
            let flights = Arc::new(Group::new());

            // Start a leader which will never complete on its own...
            let leader = {
                let flights = flights.clone();
                tokio::spawn(async move {
                    flights
                        .work("key", || async {
                            tokio::time::sleep(Duration::from_secs(3600)).await;
                            "leader"
                        })
                        .await
                })
            };
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert_eq!(flights.in_flight(), 1);

            let waiter = {
                let flights = flights.clone();
                tokio::spawn(async move { flights.work("key", || async { "waiter" }).await })
            };
            tokio::time::sleep(Duration::from_millis(10)).await;

            // Cancelling the leader releases the waiter which then runs its own work...
            leader.abort();
            assert_eq!(waiter.await.unwrap(), "waiter");
            assert_eq!(flights.in_flight(), 0);
        });
    }
}
