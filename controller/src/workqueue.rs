use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const PROCESSING_METRICS_PERIOD: Duration = Duration::from_secs(10);

/// Decides how long a key has to wait before it is retried.
pub trait RateLimiter: Send + Sync {
    fn when(&self, key: &str) -> Duration;
    fn forget(&self, key: &str);
    fn num_requeues(&self, key: &str) -> u32;
}

/// Per-key exponential backoff: `base * 2^failures`, capped at `max`.
pub struct ItemExponentialFailureRateLimiter {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<String, u32>>,
}

impl ItemExponentialFailureRateLimiter {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }
}

impl RateLimiter for ItemExponentialFailureRateLimiter {
    fn when(&self, key: &str) -> Duration {
        let mut failures = self.failures.lock().unwrap();
        let count = failures.entry(key.to_string()).or_insert(0);
        let exponent = (*count).min(31);
        *count += 1;
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max)
    }

    fn forget(&self, key: &str) {
        self.failures.lock().unwrap().remove(key);
    }

    fn num_requeues(&self, key: &str) -> u32 {
        self.failures.lock().unwrap().get(key).copied().unwrap_or(0)
    }
}

/// Token bucket shared by all keys, with a cap on the returned delay since
/// a bucket on its own is limitless.
pub struct BucketRateLimiter {
    qps: f64,
    burst: f64,
    max_timeout: Duration,
    state: Mutex<Bucket>,
}

struct Bucket {
    tokens: f64,
    last: Instant,
}

impl BucketRateLimiter {
    pub fn new(qps: f64, burst: f64, max_timeout: Duration) -> Self {
        Self {
            qps,
            burst,
            max_timeout,
            state: Mutex::new(Bucket {
                tokens: burst,
                last: Instant::now(),
            }),
        }
    }
}

impl RateLimiter for BucketRateLimiter {
    fn when(&self, _key: &str) -> Duration {
        let now = Instant::now();
        let mut bucket = self.state.lock().unwrap();
        let elapsed = (now - bucket.last).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.qps).min(self.burst);
        bucket.last = now;
        bucket.tokens -= 1.0;
        if bucket.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-bucket.tokens / self.qps).min(self.max_timeout)
        }
    }

    fn forget(&self, _key: &str) {}

    fn num_requeues(&self, _key: &str) -> u32 {
        0
    }
}

/// Composes limiters, returning the worst delay of the set.
pub struct MaxOfRateLimiter {
    limiters: Vec<Arc<dyn RateLimiter>>,
}

impl MaxOfRateLimiter {
    pub fn new(limiters: Vec<Arc<dyn RateLimiter>>) -> Self {
        Self { limiters }
    }
}

impl RateLimiter for MaxOfRateLimiter {
    fn when(&self, key: &str) -> Duration {
        self.limiters
            .iter()
            .map(|limiter| limiter.when(key))
            .max()
            .unwrap_or(Duration::ZERO)
    }

    fn forget(&self, key: &str) {
        for limiter in &self.limiters {
            limiter.forget(key);
        }
    }

    fn num_requeues(&self, key: &str) -> u32 {
        self.limiters
            .iter()
            .map(|limiter| limiter.num_requeues(key))
            .max()
            .unwrap_or(0)
    }
}

/// Per-key exponential backoff composed with a global token bucket.
pub fn default_rate_limiter() -> Arc<dyn RateLimiter> {
    Arc::new(MaxOfRateLimiter::new(vec![
        Arc::new(ItemExponentialFailureRateLimiter::new(
            Duration::from_millis(5),
            Duration::from_secs(1000),
        )),
        Arc::new(BucketRateLimiter::new(10.0, 100.0, Duration::from_secs(10))),
    ]))
}

/// Deduplicating FIFO of keys with rate-limited delayed re-adds.
///
/// A key is never handed to two callers at once: while a key is being
/// processed, re-adds only mark it dirty and it re-enters the queue when
/// [`WorkQueue::done`] is called. [`WorkQueue::get`] returns `None` once the
/// queue has been shut down and drained.
pub struct WorkQueue {
    name: String,
    rate_limiter: Arc<dyn RateLimiter>,
    inner: Mutex<Inner>,
    notify: Notify,
    waiting: Mutex<HashMap<String, Instant>>,
    waiting_notify: Notify,
    shutdown: CancellationToken,
}

#[derive(Default)]
struct Inner {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashMap<String, Instant>,
    added_at: HashMap<String, Instant>,
    shutting_down: bool,
}

impl WorkQueue {
    pub fn new(name: impl ToString) -> Arc<Self> {
        Self::with_rate_limiter(name, default_rate_limiter())
    }

    pub fn with_rate_limiter(name: impl ToString, rate_limiter: Arc<dyn RateLimiter>) -> Arc<Self> {
        let queue = Arc::new(Self {
            name: name.to_string(),
            rate_limiter,
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            waiting: Mutex::new(HashMap::new()),
            waiting_notify: Notify::new(),
            shutdown: CancellationToken::new(),
        });
        tokio::spawn(Arc::clone(&queue).wait_loop());
        queue
    }

    /// Enqueues a key immediately. While the key is queued or being
    /// processed, further adds are no-ops beyond marking it dirty.
    pub fn add(&self, key: &str) {
        let mut inner = self.inner.lock().unwrap();
        if inner.shutting_down || inner.dirty.contains(key) {
            return;
        }
        inner.dirty.insert(key.to_string());
        if inner.processing.contains_key(key) {
            return;
        }
        inner.added_at.entry(key.to_string()).or_insert_with(Instant::now);
        inner.queue.push_back(key.to_string());
        lariat_metrics::inc_queue_adds(&self.name);
        lariat_metrics::set_queue_depth(&self.name, inner.queue.len() as i64);
        drop(inner);
        self.notify.notify_one();
    }

    /// Enqueues a key after a delay. Delays for the same key coalesce to the
    /// earliest deadline.
    pub fn add_after(&self, key: &str, delay: Duration) {
        if self.inner.lock().unwrap().shutting_down {
            return;
        }
        if delay.is_zero() {
            return self.add(key);
        }
        let ready_at = Instant::now() + delay;
        {
            let mut waiting = self.waiting.lock().unwrap();
            let entry = waiting.entry(key.to_string()).or_insert(ready_at);
            if ready_at < *entry {
                *entry = ready_at;
            }
        }
        self.waiting_notify.notify_one();
    }

    /// Enqueues a key after the delay chosen by the queue's rate limiter.
    pub fn add_rate_limited(&self, key: &str) {
        lariat_metrics::inc_queue_retries(&self.name);
        self.add_after(key, self.rate_limiter.when(key));
    }

    /// Blocks until a key is available and marks it as being processed.
    /// Returns `None` only when the queue is shut down and drained.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(key) = inner.queue.pop_front() {
                    inner.dirty.remove(&key);
                    inner.processing.insert(key.clone(), Instant::now());
                    if let Some(added) = inner.added_at.remove(&key) {
                        lariat_metrics::observe_queue_duration(&self.name, added.elapsed());
                    }
                    lariat_metrics::set_queue_depth(&self.name, inner.queue.len() as i64);
                    return Some(key);
                }
                if inner.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Releases a key's processing slot; if it was marked dirty while held,
    /// it re-enters the queue.
    pub fn done(&self, key: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(started) = inner.processing.remove(key) {
            lariat_metrics::observe_work_duration(&self.name, started.elapsed());
        }
        if inner.dirty.contains(key) {
            inner.added_at.entry(key.to_string()).or_insert_with(Instant::now);
            inner.queue.push_back(key.to_string());
            lariat_metrics::set_queue_depth(&self.name, inner.queue.len() as i64);
            drop(inner);
            self.notify.notify_one();
        }
    }

    /// Resets the key's rate limiter state.
    pub fn forget(&self, key: &str) {
        self.rate_limiter.forget(key);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rejects further adds and lets the queue drain. Delayed keys that have
    /// not come due yet are discarded.
    pub fn shut_down(&self) {
        self.inner.lock().unwrap().shutting_down = true;
        self.waiting.lock().unwrap().clear();
        self.shutdown.cancel();
        self.notify.notify_waiters();
    }

    async fn wait_loop(self: Arc<Self>) {
        let mut metrics_tick = tokio::time::interval_at(
            tokio::time::Instant::now() + PROCESSING_METRICS_PERIOD,
            PROCESSING_METRICS_PERIOD,
        );
        loop {
            let next = self.waiting.lock().unwrap().values().min().copied();
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = self.waiting_notify.notified() => {}
                _ = metrics_tick.tick() => self.update_processing_metrics(),
                _ = sleep_until_or_never(next) => {
                    let now = Instant::now();
                    let due: Vec<String> = {
                        let mut waiting = self.waiting.lock().unwrap();
                        let due: Vec<String> = waiting
                            .iter()
                            .filter(|(_, ready_at)| **ready_at <= now)
                            .map(|(key, _)| key.clone())
                            .collect();
                        for key in &due {
                            waiting.remove(key);
                        }
                        due
                    };
                    for key in due {
                        self.add(&key);
                    }
                }
            }
        }
    }

    fn update_processing_metrics(&self) {
        if !lariat_metrics::enabled() {
            return;
        }
        let now = Instant::now();
        let inner = self.inner.lock().unwrap();
        let mut total = 0.0f64;
        let mut longest = 0.0f64;
        for started in inner.processing.values() {
            let seconds = (now - *started).as_secs_f64();
            total += seconds;
            longest = longest.max(seconds);
        }
        lariat_metrics::set_unfinished_work(&self.name, total);
        lariat_metrics::set_longest_running_processor(&self.name, longest);
    }
}

async fn sleep_until_or_never(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_dedupes_pending_keys() {
        let queue = WorkQueue::new("test");
        queue.add("a");
        queue.add("a");
        queue.add("b");
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.get().await.as_deref(), Some("a"));
        assert_eq!(queue.get().await.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn dirty_key_redispatches_once_after_done() {
        let queue = WorkQueue::new("test");
        queue.add("a");
        let key = queue.get().await.unwrap();
        // re-adds while the key is held coalesce into a single redispatch
        queue.add("a");
        queue.add("a");
        assert!(queue.is_empty());
        queue.done(&key);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await.as_deref(), Some("a"));
        queue.done("a");
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn shutdown_drains_then_returns_none() {
        let queue = WorkQueue::new("test");
        queue.add("a");
        queue.add("b");
        queue.shut_down();
        queue.add("c");
        assert_eq!(queue.get().await.as_deref(), Some("a"));
        assert_eq!(queue.get().await.as_deref(), Some("b"));
        assert_eq!(queue.get().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn add_after_coalesces_to_earliest_deadline() {
        let queue = WorkQueue::new("test");
        let begin = Instant::now();
        queue.add_after("a", Duration::from_millis(100));
        queue.add_after("a", Duration::from_millis(50));
        let key = queue.get().await.unwrap();
        assert_eq!(key, "a");
        let waited = Instant::now() - begin;
        assert!(waited >= Duration::from_millis(50));
        assert!(waited < Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limiter_backoff_and_forget() {
        let limiter = ItemExponentialFailureRateLimiter::new(
            Duration::from_millis(5),
            Duration::from_secs(1000),
        );
        assert_eq!(limiter.when("a"), Duration::from_millis(5));
        assert_eq!(limiter.when("a"), Duration::from_millis(10));
        assert_eq!(limiter.when("a"), Duration::from_millis(20));
        assert_eq!(limiter.num_requeues("a"), 3);
        assert_eq!(limiter.when("b"), Duration::from_millis(5));
        limiter.forget("a");
        assert_eq!(limiter.when("a"), Duration::from_millis(5));
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_limits_after_burst() {
        let bucket = BucketRateLimiter::new(10.0, 2.0, Duration::from_secs(10));
        assert_eq!(bucket.when("a"), Duration::ZERO);
        assert_eq!(bucket.when("a"), Duration::ZERO);
        let delay = bucket.when("a");
        assert!(delay > Duration::ZERO);
        assert!(delay <= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn max_of_takes_the_worst_delay() {
        let limiter = MaxOfRateLimiter::new(vec![
            Arc::new(ItemExponentialFailureRateLimiter::new(
                Duration::from_millis(1),
                Duration::from_secs(1),
            )),
            Arc::new(ItemExponentialFailureRateLimiter::new(
                Duration::from_millis(8),
                Duration::from_secs(1),
            )),
        ]);
        assert_eq!(limiter.when("a"), Duration::from_millis(8));
    }
}
