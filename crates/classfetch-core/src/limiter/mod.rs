//! Token-bucket rate limiter with priority waiters and 429 backoff.
//!
//! One bucket per identity (a default identity when none is given). Tokens
//! refill continuously, consumption is exactly one per granted request, and
//! a server-side throttling signal opens a backoff window during which
//! nothing is granted. Bucket state is persisted after every mutation so a
//! restart resumes with the same budget; the waiter queue is process-local,
//! so fairness holds per process, not across processes.

mod backoff;
mod bucket;


use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::sync::{oneshot, Mutex};

use crate::store::{keys, unix_millis, SessionStore};

pub use bucket::BucketState;

pub const DEFAULT_IDENTITY: &str = "default";

/// Tuning knobs for every bucket managed by one limiter.
#[derive(Debug, Clone, Copy)]
pub struct LimiterConfig {
    /// Bucket capacity; tokens never exceed this.
    pub max_tokens: f64,
    /// Continuous refill rate in tokens per second.
    pub refill_rate: f64,
    /// First backoff window when a 429 carries no usable hint.
    pub initial_backoff: Duration,
    /// Ceiling on any backoff window.
    pub max_backoff: Duration,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            max_tokens: 10.0,
            refill_rate: 1.0,
            initial_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(300),
        }
    }
}

struct Waiter {
    identity: String,
    priority: u8,
    seq: u64,
    tx: oneshot::Sender<()>,
}

#[derive(Default)]
struct Inner {
    buckets: HashMap<String, BucketState>,
    waiters: Vec<Waiter>,
    /// Re-entrancy guard: only one drain task runs at a time.
    draining: bool,
    next_seq: u64,
}

impl Inner {
    /// Index of the waiter to grant next: lowest priority number wins,
    /// ties broken FIFO by arrival.
    fn front(&self) -> Option<usize> {
        self.waiters
            .iter()
            .enumerate()
            .min_by_key(|(_, w)| (w.priority, w.seq))
            .map(|(i, _)| i)
    }
}

struct Shared {
    store: SessionStore,
    cfg: LimiterConfig,
    inner: Mutex<Inner>,
}

/// Process-wide throttle against the remote API. Cheap to clone; every
/// clone shares one bucket map and waiter queue.
#[derive(Clone)]
pub struct RateLimiter {
    shared: Arc<Shared>,
}

impl RateLimiter {
    pub fn new(store: SessionStore, cfg: LimiterConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                cfg,
                inner: Mutex::new(Inner::default()),
            }),
        }
    }

    /// Wait for permission to make one request.
    ///
    /// Grants immediately when no backoff window is open, at least one full
    /// token is available, and nobody is already queued. Otherwise the
    /// caller joins the priority queue and suspends until the drain task
    /// grants it a token; each waiter resumes at its own grant, not when
    /// the whole queue empties.
    pub async fn acquire(&self, identity: Option<&str>, priority: u8) -> Result<()> {
        let identity = identity.unwrap_or(DEFAULT_IDENTITY).to_string();

        let (rx, run_drain) = {
            let mut inner = self.shared.inner.lock().await;
            self.load_bucket(&mut inner, &identity).await?;
            let now = unix_millis();

            let bucket = inner.buckets.get_mut(&identity).expect("bucket loaded");
            bucket.refill(now, &self.shared.cfg);
            let in_backoff = bucket.backoff_until_ms.is_some_and(|t| t > now);
            let has_token = bucket.tokens >= 1.0;

            if !in_backoff && has_token && inner.waiters.is_empty() {
                let bucket = inner.buckets.get_mut(&identity).expect("bucket loaded");
                bucket.tokens -= 1.0;
                let snapshot = bucket.clone();
                self.persist(&identity, &snapshot).await?;
                return Ok(());
            }

            let (tx, rx) = oneshot::channel();
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.waiters.push(Waiter {
                identity: identity.clone(),
                priority,
                seq,
                tx,
            });
            let run_drain = !inner.draining;
            if run_drain {
                inner.draining = true;
            }
            (rx, run_drain)
        };

        if run_drain {
            let drainer = self.clone();
            tokio::spawn(async move {
                if let Err(err) = drainer.drain().await {
                    tracing::error!(error = %err, "rate limiter drain failed");
                }
            });
        }
        rx.await
            .map_err(|_| anyhow!("rate limiter drain gave up before granting"))
    }

    /// Drain entry point. A store failure mid-drain must not wedge the
    /// limiter: on error the draining flag is reset and every waiter is
    /// woken with an error so callers can retry.
    async fn drain(&self) -> Result<()> {
        let result = self.drain_queue().await;
        if result.is_err() {
            let mut inner = self.shared.inner.lock().await;
            inner.draining = false;
            // Dropping the senders fails every pending acquire.
            inner.waiters.clear();
        }
        result
    }

    /// Drain the waiter queue: wait out any open backoff window, wait out
    /// any token shortfall, then grant the highest-priority waiter. Runs
    /// until the queue is empty; the `draining` flag guarantees a single
    /// task per process.
    async fn drain_queue(&self) -> Result<()> {
        loop {
            let sleep_for = {
                let mut inner = self.shared.inner.lock().await;
                let Some(idx) = inner.front() else {
                    inner.draining = false;
                    return Ok(());
                };
                let identity = inner.waiters[idx].identity.clone();
                self.load_bucket(&mut inner, &identity).await?;

                let now = unix_millis();
                let bucket = inner.buckets.get_mut(&identity).expect("bucket loaded");
                bucket.refill(now, &self.shared.cfg);

                if let Some(until) = bucket.backoff_until_ms.filter(|t| *t > now) {
                    Duration::from_millis((until - now) as u64)
                } else if bucket.tokens < 1.0 {
                    let shortfall = 1.0 - bucket.tokens;
                    let secs = shortfall / self.shared.cfg.refill_rate.max(f64::EPSILON);
                    Duration::from_millis((secs * 1000.0).ceil() as u64)
                } else {
                    bucket.tokens -= 1.0;
                    let snapshot = bucket.clone();
                    self.persist(&identity, &snapshot).await?;
                    let waiter = inner.waiters.remove(idx);
                    // The receiver may have been dropped (caller aborted);
                    // the token is already spent either way.
                    let _ = waiter.tx.send(());
                    continue;
                }
            };
            tokio::time::sleep(sleep_for).await;
        }
    }

    /// React to a server-side throttling signal. The hint is the raw
    /// `Retry-After` value if the server sent one; without a usable hint
    /// the window doubles from the previous one, jittered and capped.
    pub async fn report_429(&self, identity: Option<&str>, hint: Option<&str>) -> Result<()> {
        let identity = identity.unwrap_or(DEFAULT_IDENTITY).to_string();
        let mut inner = self.shared.inner.lock().await;
        self.load_bucket(&mut inner, &identity).await?;

        let now = unix_millis();
        let bucket = inner.buckets.get_mut(&identity).expect("bucket loaded");
        let prev = bucket.last_backoff_ms.map(|ms| Duration::from_millis(ms as u64));
        let delay = backoff::backoff_delay(hint, prev, &self.shared.cfg, now);
        bucket.backoff_until_ms = Some(now + delay.as_millis() as i64);
        bucket.last_backoff_ms = Some(delay.as_millis() as i64);
        tracing::warn!(
            identity = %identity,
            delay_ms = delay.as_millis() as u64,
            "throttled by server, backing off"
        );
        let snapshot = bucket.clone();
        self.persist(&identity, &snapshot).await?;
        Ok(())
    }

    /// Close any open backoff window. Called after an observed success.
    pub async fn clear_backoff(&self, identity: Option<&str>) -> Result<()> {
        let identity = identity.unwrap_or(DEFAULT_IDENTITY).to_string();
        let mut inner = self.shared.inner.lock().await;
        self.load_bucket(&mut inner, &identity).await?;
        let bucket = inner.buckets.get_mut(&identity).expect("bucket loaded");
        if bucket.backoff_until_ms.is_some() || bucket.last_backoff_ms.is_some() {
            bucket.backoff_until_ms = None;
            bucket.last_backoff_ms = None;
            let snapshot = bucket.clone();
            self.persist(&identity, &snapshot).await?;
        }
        Ok(())
    }

    /// Current token count for an identity (test/diagnostic view).
    pub async fn tokens(&self, identity: Option<&str>) -> Result<f64> {
        let identity = identity.unwrap_or(DEFAULT_IDENTITY).to_string();
        let mut inner = self.shared.inner.lock().await;
        self.load_bucket(&mut inner, &identity).await?;
        let bucket = inner.buckets.get_mut(&identity).expect("bucket loaded");
        bucket.refill(unix_millis(), &self.shared.cfg);
        Ok(bucket.tokens)
    }

    /// Pull the bucket into the in-memory cache, reading the persisted
    /// snapshot on first touch so a restart resumes with the same budget.
    async fn load_bucket(&self, inner: &mut Inner, identity: &str) -> Result<()> {
        if inner.buckets.contains_key(identity) {
            return Ok(());
        }
        let persisted: Option<BucketState> =
            self.shared.store.get_json(&keys::bucket(identity)).await?;
        let state =
            persisted.unwrap_or_else(|| BucketState::full(&self.shared.cfg, unix_millis()));
        inner.buckets.insert(identity.to_string(), state);
        Ok(())
    }

    async fn persist(&self, identity: &str, state: &BucketState) -> Result<()> {
        self.shared
            .store
            .set_json(&keys::bucket(identity), state)
            .await?;
        Ok(())
    }
}
