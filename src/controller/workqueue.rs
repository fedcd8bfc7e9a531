//! Rate-limited, deduplicating work queue
//!
//! Semantics follow the classic controller work queue:
//! - a key added while already pending collapses into the pending entry;
//! - a key handed out by [`WorkQueue::get`] is in flight until [`WorkQueue::done`], and
//!   no other getter sees it in the meantime;
//! - a key re-added while in flight is delivered again exactly once after `done`.
//!
//! Retries back off exponentially per key (`base * 2^failures`, capped) until
//! [`WorkQueue::forget`] resets the counter.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Display;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::metrics;
use crate::error::{Error, Result};

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

/// Per-key exponential backoff
#[derive(Clone, Copy, Debug)]
pub struct RateLimiter {
    pub base: Duration,
    pub max: Duration,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self {
            base: DEFAULT_BASE_DELAY,
            max: DEFAULT_MAX_DELAY,
        }
    }
}

impl RateLimiter {
    /// Delay before retry number `failures` (zero-based)
    pub fn backoff(&self, failures: u32) -> Duration {
        let factor = 2u32.checked_pow(failures).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.max, |d| d.min(self.max))
    }
}

struct State<T> {
    queue: VecDeque<T>,
    dirty: HashSet<T>,
    processing: HashSet<T>,
    failures: HashMap<T, u32>,
    shutting_down: bool,
}

pub struct WorkQueue<T> {
    name: String,
    limiter: RateLimiter,
    state: Mutex<State<T>>,
    ready: Notify,
    idle: Notify,
}

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash + Display + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, limiter: RateLimiter) -> Self {
        Self {
            name: name.into(),
            limiter,
            state: Mutex::new(State {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                failures: HashMap::new(),
                shutting_down: false,
            }),
            ready: Notify::new(),
            idle: Notify::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Enqueue `item` unless it is already pending
    pub fn add(&self, item: T) {
        let mut state = self.lock();
        if state.shutting_down || state.dirty.contains(&item) {
            return;
        }
        state.dirty.insert(item.clone());
        if state.processing.contains(&item) {
            // redelivered by done()
            return;
        }
        state.queue.push_back(item);
        metrics::set_queue_depth(&self.name, state.queue.len());
        drop(state);
        self.ready.notify_one();
    }

    /// Wait for the next key. Returns `None` once the queue is shut down and empty.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    metrics::set_queue_depth(&self.name, state.queue.len());
                    return Some(item);
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Release an in-flight key, redelivering it if it was re-added meanwhile
    pub fn done(&self, item: &T) {
        let mut state = self.lock();
        state.processing.remove(item);
        let requeue = state.dirty.contains(item);
        if requeue {
            state.queue.push_back(item.clone());
            metrics::set_queue_depth(&self.name, state.queue.len());
        }
        let idle = state.processing.is_empty();
        drop(state);

        if requeue {
            self.ready.notify_one();
        }
        if idle {
            self.idle.notify_waiters();
        }
    }

    /// Enqueue `item` once `delay` has elapsed
    pub fn add_after(self: &Arc<Self>, item: T, delay: Duration) {
        if delay.is_zero() {
            self.add(item);
            return;
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(item);
        });
    }

    /// Enqueue `item` after its current backoff and bump its failure count
    pub fn add_rate_limited(self: &Arc<Self>, item: T) {
        let delay = {
            let mut state = self.lock();
            let failures = state.failures.entry(item.clone()).or_insert(0);
            let delay = self.limiter.backoff(*failures);
            *failures = failures.saturating_add(1);
            delay
        };
        metrics::inc_queue_retries(&self.name);
        debug!(queue = %self.name, key = %item, ?delay, "Requeueing with backoff");
        self.add_after(item, delay);
    }

    /// Reset the backoff of `item`
    pub fn forget(&self, item: &T) {
        self.lock().failures.remove(item);
    }

    pub fn num_requeues(&self, item: &T) -> u32 {
        self.lock().failures.get(item).copied().unwrap_or(0)
    }

    /// Keys waiting to be handed out
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_backoff(&self) -> Duration {
        self.limiter.max
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Stop accepting keys and wake blocked getters
    pub fn shut_down(&self) {
        self.lock().shutting_down = true;
        self.ready.notify_waiters();
    }

    /// Shut down, then wait until every in-flight key is done
    pub async fn shut_down_with_drain(&self) {
        self.shut_down();
        loop {
            let idle = self.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();
            if self.lock().processing.is_empty() {
                return;
            }
            idle.await;
        }
    }
}

/// Work performed for each key pulled off a queue
#[async_trait]
pub trait Process<T>: Send + Sync {
    fn name(&self) -> &str;

    async fn process(&self, item: &T) -> Result<()>;

    /// Called when `item` keeps failing after the requeue cap
    async fn retries_exhausted(&self, item: &T, err: &Error);
}

/// Pull keys from `queue` with `workers` concurrent tasks until `shutdown` fires.
///
/// Success forgets the key's backoff. Failure requeues with backoff while the key
/// has been retried fewer than `max_requeues` times; past that, the processor's
/// `retries_exhausted` hook runs and the key is retried at the backoff ceiling.
pub async fn run_workers<T, P>(
    queue: Arc<WorkQueue<T>>,
    processor: Arc<P>,
    workers: usize,
    max_requeues: u32,
    shutdown: CancellationToken,
) where
    T: Clone + Eq + Hash + Display + Send + Sync + 'static,
    P: Process<T> + 'static,
{
    let drain = {
        let queue = Arc::clone(&queue);
        tokio::spawn(async move {
            shutdown.cancelled().await;
            info!(queue = %queue.name(), "Shutting down work queue");
            queue.shut_down_with_drain().await;
        })
    };

    let mut set = JoinSet::new();
    for _ in 0..workers.max(1) {
        let queue = Arc::clone(&queue);
        let processor = Arc::clone(&processor);
        set.spawn(async move {
            while let Some(item) = queue.get().await {
                handle(&queue, processor.as_ref(), &item, max_requeues).await;
                queue.done(&item);
            }
        });
    }

    while let Some(res) = set.join_next().await {
        if let Err(e) = res {
            error!(queue = %queue.name(), "Worker task failed: {}", e);
        }
    }
    if let Err(e) = drain.await {
        error!(queue = %queue.name(), "Drain task failed: {}", e);
    }
    info!(queue = %queue.name(), "Workers stopped");
}

async fn handle<T, P>(queue: &Arc<WorkQueue<T>>, processor: &P, item: &T, max_requeues: u32)
where
    T: Clone + Eq + Hash + Display + Send + Sync + 'static,
    P: Process<T>,
{
    let started = Instant::now();
    let res = processor.process(item).await;
    metrics::observe_reconcile_duration_seconds(processor.name(), started.elapsed().as_secs_f64());

    let err = match res {
        Ok(()) => {
            queue.forget(item);
            return;
        }
        Err(err) => err,
    };
    metrics::inc_reconcile_error(processor.name(), err.kind());

    if queue.num_requeues(item) < max_requeues {
        warn!(key = %item, retriable = err.is_retriable(), "Failed to process: {}", err);
        queue.add_rate_limited(item.clone());
    } else {
        error!(key = %item, "Giving up on fast retries: {}", err);
        metrics::inc_retries_exhausted(queue.name());
        processor.retries_exhausted(item, &err).await;
        queue.add_after(item.clone(), queue.max_backoff());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn queue() -> Arc<WorkQueue<String>> {
        Arc::new(WorkQueue::new("test", RateLimiter::default()))
    }

    #[tokio::test]
    async fn pending_duplicates_coalesce() {
        let q = queue();
        q.add("demo/a".to_string());
        q.add("demo/a".to_string());
        q.add("demo/b".to_string());
        assert_eq!(q.len(), 2);

        assert_eq!(q.get().await.as_deref(), Some("demo/a"));
        assert_eq!(q.get().await.as_deref(), Some("demo/b"));
        assert!(q.is_empty());
    }

    proptest::proptest! {
        #[test]
        fn adds_deliver_each_key_once_in_first_seen_order(
            keys in proptest::collection::vec(0u8..8, 0..64)
        ) {
            let q = queue();
            let mut expected = Vec::new();
            for k in &keys {
                let key = format!("demo/{k}");
                if !expected.contains(&key) {
                    expected.push(key.clone());
                }
                q.add(key);
            }
            proptest::prop_assert_eq!(q.len(), expected.len());

            let delivered: Vec<String> = tokio_test::block_on(async {
                let mut out = Vec::new();
                while !q.is_empty() {
                    if let Some(key) = q.get().await {
                        out.push(key);
                    }
                }
                out
            });
            proptest::prop_assert_eq!(delivered, expected);
        }
    }

    #[tokio::test]
    async fn in_flight_key_is_redelivered_once() {
        let q = queue();
        q.add("demo/a".to_string());
        let item = q.get().await.unwrap();

        q.add(item.clone());
        q.add(item.clone());
        assert_eq!(q.len(), 0, "in-flight key must not be handed out again");

        q.done(&item);
        assert_eq!(q.len(), 1);
        let again = q.get().await.unwrap();
        q.done(&again);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn blocked_getter_wakes_on_add() {
        let q = queue();
        let getter = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.get().await })
        };
        tokio::task::yield_now().await;
        q.add("demo/a".to_string());
        assert_eq!(getter.await.unwrap().as_deref(), Some("demo/a"));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let limiter = RateLimiter {
            base: Duration::from_millis(5),
            max: Duration::from_millis(30),
        };
        assert_eq!(limiter.backoff(0), Duration::from_millis(5));
        assert_eq!(limiter.backoff(1), Duration::from_millis(10));
        assert_eq!(limiter.backoff(2), Duration::from_millis(20));
        assert_eq!(limiter.backoff(3), Duration::from_millis(30));
        assert_eq!(limiter.backoff(64), Duration::from_millis(30));
    }

    #[tokio::test]
    async fn forget_resets_requeue_count() {
        let q = queue();
        let key = "demo/a".to_string();
        q.add_rate_limited(key.clone());
        q.add_rate_limited(key.clone());
        assert_eq!(q.num_requeues(&key), 2);
        q.forget(&key);
        assert_eq!(q.num_requeues(&key), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_key_arrives_after_backoff() {
        let q = queue();
        q.add_rate_limited("demo/a".to_string());
        assert!(q.is_empty());
        tokio::time::sleep(Duration::from_millis(6)).await;
        assert_eq!(q.len(), 1);
    }

    #[tokio::test]
    async fn shutdown_releases_getters() {
        let q = queue();
        let getter = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.get().await })
        };
        tokio::task::yield_now().await;
        q.shut_down();
        assert_eq!(getter.await.unwrap(), None);

        q.add("demo/a".to_string());
        assert!(q.is_empty(), "no intake after shutdown");
    }

    #[tokio::test]
    async fn drain_waits_for_in_flight_keys() {
        let q = queue();
        q.add("demo/a".to_string());
        let item = q.get().await.unwrap();

        let drained = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.shut_down_with_drain().await })
        };
        tokio::task::yield_now().await;
        assert!(!drained.is_finished());

        q.done(&item);
        drained.await.unwrap();
    }

    struct Flaky {
        calls: AtomicUsize,
        fail_first: usize,
        exhausted: AtomicUsize,
    }

    #[async_trait]
    impl Process<String> for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn process(&self, _item: &String) -> Result<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err(Error::ValidationError("not yet".to_string()))
            } else {
                Ok(())
            }
        }

        async fn retries_exhausted(&self, _item: &String, _err: &Error) {
            self.exhausted.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn workers_retry_until_success() {
        let q = queue();
        let processor = Arc::new(Flaky {
            calls: AtomicUsize::new(0),
            fail_first: 3,
            exhausted: AtomicUsize::new(0),
        });
        let shutdown = CancellationToken::new();
        let runner = tokio::spawn(run_workers(
            Arc::clone(&q),
            Arc::clone(&processor),
            2,
            5,
            shutdown.clone(),
        ));

        q.add("demo/a".to_string());
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(processor.calls.load(Ordering::SeqCst), 4);
        assert_eq!(q.num_requeues(&"demo/a".to_string()), 0);
        assert_eq!(processor.exhausted.load(Ordering::SeqCst), 0);

        shutdown.cancel();
        runner.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_call_the_hook() {
        let q = queue();
        let processor = Arc::new(Flaky {
            calls: AtomicUsize::new(0),
            fail_first: usize::MAX,
            exhausted: AtomicUsize::new(0),
        });
        let shutdown = CancellationToken::new();
        let runner = tokio::spawn(run_workers(
            Arc::clone(&q),
            Arc::clone(&processor),
            1,
            2,
            shutdown.clone(),
        ));

        q.add("demo/a".to_string());
        tokio::time::sleep(Duration::from_secs(1)).await;

        // first attempt plus two backoff retries
        assert_eq!(processor.calls.load(Ordering::SeqCst), 3);
        assert_eq!(processor.exhausted.load(Ordering::SeqCst), 1);

        shutdown.cancel();
        runner.await.unwrap();
    }
}
