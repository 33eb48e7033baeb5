use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use tokio::sync::Notify;

/// Keyed single-flight registry.
///
/// [`Singleflight::run`] coalesces concurrent callers onto one execution and
/// hands every caller a clone of its output. [`Singleflight::try_claim`] is the
/// non-waiting form used by periodic ticks: a claim fails while another holder
/// of the same key is alive.
pub(crate) struct Singleflight<T> {
    flights: Mutex<HashMap<String, Arc<Flight<T>>>>,
}

struct Flight<T> {
    notify: Notify,
    result: OnceLock<T>,
}

impl<T> Flight<T> {
    fn new() -> Self {
        Self {
            notify: Notify::new(),
            result: OnceLock::new(),
        }
    }
}

enum Role<T> {
    Leader(Arc<Flight<T>>),
    Follower(Arc<Flight<T>>),
}

impl<T> Default for Singleflight<T> {
    fn default() -> Self {
        Self {
            flights: Mutex::new(HashMap::new()),
        }
    }
}

impl<T: Clone> Singleflight<T> {
    fn join(&self, key: &str) -> Role<T> {
        let mut map = self.flights.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = map.get(key) {
            Role::Follower(Arc::clone(existing))
        } else {
            let flight = Arc::new(Flight::new());
            map.insert(key.to_string(), Arc::clone(&flight));
            Role::Leader(flight)
        }
    }

    fn release(&self, key: &str, flight: &Arc<Flight<T>>) {
        let mut map = self.flights.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = map.get(key) {
            if Arc::ptr_eq(existing, flight) {
                map.remove(key);
            }
        }
        drop(map);
        flight.notify.notify_waiters();
    }

    pub(crate) fn in_flight(&self, key: &str) -> bool {
        self.flights
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    /// Run `work` unless a call for `key` is already in flight, in which case
    /// wait for it and return its output.
    ///
    /// A follower whose leader was cancelled before producing a value runs
    /// `work` itself.
    pub(crate) async fn run<F, Fut>(&self, key: &str, work: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        match self.join(key) {
            Role::Leader(flight) => {
                let cleanup = LeaderCleanup {
                    singleflight: self,
                    key,
                    flight: Arc::clone(&flight),
                };
                let out = work().await;
                let _ = flight.result.set(out.clone());
                drop(cleanup);
                out
            }
            Role::Follower(flight) => {
                let notified = flight.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if let Some(out) = flight.result.get() {
                    return out.clone();
                }
                notified.await;
                match flight.result.get() {
                    Some(out) => out.clone(),
                    None => work().await,
                }
            }
        }
    }

    /// Claim `key` without waiting. The claim is held until the guard drops.
    pub(crate) fn try_claim(self: &Arc<Self>, key: &str) -> Option<ClaimGuard<T>> {
        match self.join(key) {
            Role::Leader(flight) => Some(ClaimGuard {
                singleflight: Arc::clone(self),
                key: key.to_string(),
                flight,
            }),
            Role::Follower(_) => None,
        }
    }
}

struct LeaderCleanup<'a, T: Clone> {
    singleflight: &'a Singleflight<T>,
    key: &'a str,
    flight: Arc<Flight<T>>,
}

impl<T: Clone> Drop for LeaderCleanup<'_, T> {
    fn drop(&mut self) {
        self.singleflight.release(self.key, &self.flight);
    }
}

pub(crate) struct ClaimGuard<T: Clone> {
    singleflight: Arc<Singleflight<T>>,
    key: String,
    flight: Arc<Flight<T>>,
}

impl<T: Clone> Drop for ClaimGuard<T> {
    fn drop(&mut self) {
        self.singleflight.release(&self.key, &self.flight);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn concurrent_callers_share_one_execution() {
        let sf: Singleflight<u32> = Singleflight::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        let leader_calls = calls.clone();
        let leader = sf.run("k", move || async move {
            leader_calls.fetch_add(1, Ordering::SeqCst);
            let _ = rx.await;
            7
        });
        let follower_calls = calls.clone();
        let follower = sf.run("k", move || async move {
            follower_calls.fetch_add(1, Ordering::SeqCst);
            9
        });
        let release = async {
            tokio::task::yield_now().await;
            let _ = tx.send(());
        };

        let (a, b, ()) = tokio::join!(leader, follower, release);
        assert_eq!((a, b), (7, 7));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!sf.in_flight("k"));
    }

    #[tokio::test]
    async fn sequential_calls_each_run() {
        let sf: Singleflight<u32> = Singleflight::default();
        assert_eq!(sf.run("k", || async { 1 }).await, 1);
        assert_eq!(sf.run("k", || async { 2 }).await, 2);
    }

    #[test]
    fn claim_is_exclusive_until_dropped() {
        let sf: Arc<Singleflight<()>> = Arc::new(Singleflight::default());
        let first = sf.try_claim("tick").expect("first claim");
        assert!(sf.try_claim("tick").is_none());
        assert!(sf.try_claim("other").is_some());
        drop(first);
        assert!(sf.try_claim("tick").is_some());
    }
}
