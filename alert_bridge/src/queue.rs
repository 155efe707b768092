//! Deduplicating, rate-limited trigger queue.
//!
//! A key is in at most one of three places: waiting out a delay, queued,
//! or being processed. Adding a key that is already queued is a no-op;
//! adding one that is being processed marks it dirty so it is queued again
//! once the worker calls [`TriggerQueue::done`]. Failed keys are re-added
//! with exponential backoff until [`TriggerQueue::forget`] resets them.
//!
//! Delayed adds may come from threads outside the runtime (watch callbacks
//! fire wherever the watcher delivers them). Their timers run on the
//! runtime the queue was created in, or the one its worker runs on.

use log::debug;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Notify;

struct QueueState<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    waiting: HashSet<K>,
    failures: HashMap<K, u32>,
    shutting_down: bool,
}

pub struct TriggerQueue<K> {
    state: Mutex<QueueState<K>>,
    notify: Notify,
    runtime: Mutex<Option<Handle>>,
    backoff_min: Duration,
    backoff_max: Duration,
}

impl<K> TriggerQueue<K>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    pub fn new(backoff_min: Duration, backoff_max: Duration) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                waiting: HashSet::new(),
                failures: HashMap::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
            runtime: Mutex::new(Handle::try_current().ok()),
            backoff_min,
            backoff_max: backoff_max.max(backoff_min),
        })
    }

    /// Queues `key` unless it is already pending.
    pub fn add(&self, key: K) {
        let mut state = self.state.lock();
        if state.shutting_down || !state.dirty.insert(key.clone()) {
            return;
        }
        if state.processing.contains(&key) {
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.notify.notify_one();
    }

    /// Queues `key` after `delay`. Further calls while it waits are absorbed.
    pub fn add_after(self: &Arc<Self>, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        {
            let mut state = self.state.lock();
            if state.shutting_down || !state.waiting.insert(key.clone()) {
                return;
            }
        }
        let runtime = Handle::try_current()
            .ok()
            .or_else(|| self.runtime.lock().clone());
        let Some(runtime) = runtime else {
            debug!("No runtime for a delayed add; queueing immediately");
            self.state.lock().waiting.remove(&key);
            self.add(key);
            return;
        };
        let queue = Arc::clone(self);
        runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            queue.state.lock().waiting.remove(&key);
            queue.add(key);
        });
    }

    /// Queues `key` after its next backoff delay and returns that delay.
    pub fn add_rate_limited(self: &Arc<Self>, key: K) -> Duration {
        let failures = {
            let mut state = self.state.lock();
            let count = state.failures.entry(key.clone()).or_insert(0);
            *count = count.saturating_add(1);
            *count
        };
        let delay = self.backoff(failures);
        self.add_after(key, delay);
        delay
    }

    /// Clears the failure history of `key`.
    pub fn forget(&self, key: &K) {
        self.state.lock().failures.remove(key);
    }

    pub fn failures(&self, key: &K) -> u32 {
        self.state.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Waits for the next key. Returns None once the queue is shut down.
    pub async fn get(&self) -> Option<K> {
        {
            let mut runtime = self.runtime.lock();
            if runtime.is_none() {
                *runtime = Some(Handle::current());
            }
        }
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Marks `key` finished; requeues it if it was added meanwhile.
    pub fn done(&self, key: &K) {
        let mut state = self.state.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    pub fn shut_down(&self) {
        self.state.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state.lock().shutting_down
    }

    /// Keys queued and not yet handed out.
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `backoff_min * 2^(failures-1)` with up to 10% jitter, capped at `backoff_max`.
    fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        let base = self
            .backoff_min
            .saturating_mul(1u32 << exponent)
            .min(self.backoff_max);
        let jitter_ms = (base.as_millis() / 10) as u64;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        } else {
            Duration::ZERO
        };
        (base + jitter).min(self.backoff_max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> Arc<TriggerQueue<&'static str>> {
        TriggerQueue::new(Duration::from_millis(10), Duration::from_millis(100))
    }

    #[tokio::test]
    async fn test_duplicate_adds_coalesce() {
        let q = queue();
        q.add("sync");
        q.add("sync");
        q.add("other");
        assert_eq!(q.len(), 2);
        assert_eq!(q.get().await, Some("sync"));
        assert_eq!(q.get().await, Some("other"));
    }

    #[tokio::test]
    async fn test_add_while_processing_requeues_on_done() {
        let q = queue();
        q.add("sync");
        let key = q.get().await.unwrap();
        q.add("sync");
        assert!(q.is_empty());
        q.done(&key);
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await, Some("sync"));
        q.done(&"sync");
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_add_after_delivers_once() {
        let q = queue();
        q.add_after("sync", Duration::from_millis(20));
        q.add_after("sync", Duration::from_millis(20));
        assert!(q.is_empty());
        let key = tokio::time::timeout(Duration::from_secs(1), q.get())
            .await
            .unwrap();
        assert_eq!(key, Some("sync"));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_delayed_add_from_a_plain_thread() {
        let q = queue();
        let producer = {
            let q = Arc::clone(&q);
            std::thread::spawn(move || q.add_after("sync", Duration::from_millis(10)))
        };
        producer.join().unwrap();
        let key = tokio::time::timeout(Duration::from_secs(1), q.get())
            .await
            .unwrap();
        assert_eq!(key, Some("sync"));
    }

    #[test]
    fn test_delayed_add_without_any_runtime_queues_now() {
        let q: Arc<TriggerQueue<&'static str>> =
            TriggerQueue::new(Duration::from_millis(10), Duration::from_millis(100));
        q.add_after("sync", Duration::from_millis(10));
        assert_eq!(q.len(), 1);
    }

    #[tokio::test]
    async fn test_backoff_grows_and_is_bounded() {
        let q = queue();
        let first = q.add_rate_limited("sync");
        let second = q.add_rate_limited("sync");
        let third = q.add_rate_limited("sync");
        assert!(first >= Duration::from_millis(10) && first <= Duration::from_millis(11));
        assert!(second >= Duration::from_millis(20) && second <= Duration::from_millis(22));
        assert!(third >= Duration::from_millis(40));
        for _ in 0..10 {
            assert!(q.add_rate_limited("sync") <= Duration::from_millis(100));
        }
        assert_eq!(q.failures(&"sync"), 13);
        q.forget(&"sync");
        assert_eq!(q.failures(&"sync"), 0);
    }

    #[tokio::test]
    async fn test_shutdown_releases_waiters() {
        let q = queue();
        let waiter = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.get().await })
        };
        tokio::task::yield_now().await;
        q.shut_down();
        assert_eq!(waiter.await.unwrap(), None);
        q.add("sync");
        assert!(q.is_empty());
    }
}
