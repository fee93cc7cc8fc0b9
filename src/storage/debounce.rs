//! Per-key trailing-edge debouncer
//!
//! Coalesces bursts of triggers into one job per key: each trigger replaces
//! the pending job and restarts the window, so only the last job of a burst
//! runs, `window` after the burst ends. `flush` runs a pending job
//! immediately and `cancel` drops it; both are needed by document teardown,
//! which must never lose the final write.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

type Job = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

struct Entry {
    job: Job,
    generation: u64,
    timer: JoinHandle<()>,
}

/// Trailing-edge debouncer over keys of type `K`.
pub struct Debouncer<K> {
    window: Duration,
    entries: Arc<Mutex<HashMap<K, Entry>>>,
    generation: Arc<Mutex<u64>>,
}

impl<K> Debouncer<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    /// Create a debouncer with the given coalescing window
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: Arc::new(Mutex::new(HashMap::new())),
            generation: Arc::new(Mutex::new(0)),
        }
    }

    /// Schedule `job` for `key`, replacing any pending job and restarting
    /// the window.
    pub fn trigger<F, Fut>(&self, key: K, job: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let generation = {
            let mut counter = self.generation.lock();
            *counter += 1;
            *counter
        };

        let mut entries = self.entries.lock();
        if let Some(old) = entries.remove(&key) {
            old.timer.abort();
        }

        let timer = tokio::spawn({
            let entries = self.entries.clone();
            let key = key.clone();
            let window = self.window;
            async move {
                tokio::time::sleep(window).await;
                // Only fire if this timer's entry is still the latest
                let job = {
                    let mut entries = entries.lock();
                    match entries.get(&key) {
                        Some(entry) if entry.generation == generation => {
                            entries.remove(&key).map(|e| e.job)
                        }
                        _ => None,
                    }
                };
                if let Some(job) = job {
                    job().await;
                }
            }
        });

        entries.insert(
            key,
            Entry {
                job: Box::new(move || Box::pin(job())),
                generation,
                timer,
            },
        );
    }

    /// Run the pending job for `key` now, if any.
    pub async fn flush(&self, key: &K) {
        let job = {
            let mut entries = self.entries.lock();
            entries.remove(key).map(|entry| {
                entry.timer.abort();
                entry.job
            })
        };
        if let Some(job) = job {
            job().await;
        }
    }

    /// Drop the pending job for `key` without running it.
    pub fn cancel(&self, key: &K) {
        if let Some(entry) = self.entries.lock().remove(key) {
            entry.timer.abort();
        }
    }

    /// Drop every pending job.
    pub fn cancel_all(&self) {
        for (_, entry) in self.entries.lock().drain() {
            entry.timer.abort();
        }
    }

    /// Whether a job is pending for `key`
    pub fn is_pending(&self, key: &K) -> bool {
        self.entries.lock().contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_single_trigger_fires_after_window() {
        let debouncer = Debouncer::new(Duration::from_millis(500));
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        debouncer.trigger("doc", move || async move {
            c.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(499)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!debouncer.is_pending(&"doc"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_coalesces_to_last_job() {
        let debouncer = Debouncer::new(Duration::from_millis(500));
        let last = Arc::new(AtomicUsize::new(0));

        for i in 1..=5 {
            let l = last.clone();
            debouncer.trigger("doc", move || async move {
                l.store(i, Ordering::SeqCst);
            });
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(last.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_independent() {
        let debouncer = Debouncer::new(Duration::from_millis(500));
        let count = Arc::new(AtomicUsize::new(0));

        for key in ["a", "b", "c"] {
            let c = count.clone();
            debouncer.trigger(key, move || async move {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_runs_immediately() {
        let debouncer = Debouncer::new(Duration::from_millis(500));
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        debouncer.trigger("doc", move || async move {
            c.fetch_add(1, Ordering::SeqCst);
        });

        debouncer.flush(&"doc").await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // Window passing afterwards must not fire again
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_drops_job() {
        let debouncer = Debouncer::new(Duration::from_millis(500));
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        debouncer.trigger("doc", move || async move {
            c.fetch_add(1, Ordering::SeqCst);
        });
        debouncer.cancel(&"doc");

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_without_pending_is_noop() {
        let debouncer: Debouncer<&str> = Debouncer::new(Duration::from_millis(500));
        debouncer.flush(&"doc").await;
    }
}
