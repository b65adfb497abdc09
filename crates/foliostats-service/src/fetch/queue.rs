//! An ordered queue for outbound requests.
//!
//! The upstream APIs are rate limited, so all requests go through a
//! [`RequestQueue`] that admits them first-come first-served and never runs
//! more than a configured number at the same time. Failed attempts are
//! retried with exponentially growing, jittered delays, and a retrying
//! request is re-queued in front of everything else so it does not lose its
//! turn. Its concurrency slot stays occupied while it waits out the backoff,
//! which keeps a degraded upstream from being hammered by the rest of the
//! queue.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Deserialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, oneshot};

use crate::metric;

use super::FetchError;

/// Scheduling and retry behavior of a [`RequestQueue`].
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum number of requests executing at the same time.
    pub max_concurrent: usize,
    /// Base delay before the first retry.
    #[serde(with = "humantime_serde")]
    pub initial_retry_delay: Duration,
    /// Upper bound on a single retry delay, jitter included.
    #[serde(with = "humantime_serde")]
    pub max_retry_delay: Duration,
    /// How many times a request is retried before giving up.
    pub max_retries: u32,
    /// Factor the retry delay grows by with every further attempt.
    pub backoff_factor: f64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            max_concurrent: 3,
            initial_retry_delay: Duration::from_secs(60),
            max_retry_delay: Duration::from_secs(120),
            max_retries: 5,
            backoff_factor: 2.5,
        }
    }
}

impl QueueConfig {
    /// The delay to sleep before the retry following `retries` earlier ones.
    ///
    /// Grows exponentially with the number of retries and carries up to a
    /// second of random jitter so that requests failing together do not
    /// retry in lockstep.
    fn retry_delay(&self, retries: u32) -> Duration {
        let jitter = Duration::from_millis(rand::random_range(0..1000));
        self.retry_delay_with_jitter(retries, jitter)
    }

    fn retry_delay_with_jitter(&self, retries: u32, jitter: Duration) -> Duration {
        let millis =
            self.initial_retry_delay.as_millis() as f64 * self.backoff_factor.powi(retries as i32);
        let delay = Duration::from_millis(millis as u64) + jitter;
        delay.min(self.max_retry_delay)
    }
}

type WorkFn<T> = Box<dyn FnMut() -> BoxFuture<'static, Result<T, FetchError>> + Send>;

/// Where an entry is inserted into the pending queue.
#[derive(Clone, Copy, Debug)]
enum Placement {
    /// In front of all pending entries. Used when a request is re-queued
    /// for a retry. Newer submissions wait behind retries by design.
    Head,
    /// Behind all pending entries. Used for fresh submissions.
    Tail,
}

struct QueuedRequest<T> {
    work: WorkFn<T>,
    /// Retries performed so far.
    retries: u32,
    outcome: oneshot::Sender<Result<T, FetchError>>,
}

/// A queue executing outbound requests with bounded concurrency.
///
/// Cloning the queue is cheap and clones share the same pending list,
/// concurrency slots, and configuration.
pub struct RequestQueue<T> {
    inner: Arc<QueueInner<T>>,
}

impl<T> Clone for RequestQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct QueueInner<T> {
    config: QueueConfig,
    pending: Mutex<VecDeque<QueuedRequest<T>>>,
    slots: Arc<Semaphore>,
    /// Whether a driver task is currently alive.
    driving: AtomicBool,
}

impl<T: Send + 'static> RequestQueue<T> {
    pub fn new(config: QueueConfig) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_concurrent));
        Self {
            inner: Arc::new(QueueInner {
                config,
                pending: Mutex::new(VecDeque::new()),
                slots,
                driving: AtomicBool::new(false),
            }),
        }
    }

    /// Submits a request to the queue.
    ///
    /// `work` produces one future per attempt and is invoked again for every
    /// retry. Enqueueing happens synchronously, so of two consecutive
    /// `submit` calls the first is guaranteed the earlier queue position.
    /// The returned future resolves once the request has succeeded, failed
    /// terminally, or exhausted its retries.
    pub fn submit<F, Fut>(&self, mut work: F) -> impl Future<Output = Result<T, FetchError>>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let request = QueuedRequest {
            work: Box::new(move || work().boxed()),
            retries: 0,
            outcome: tx,
        };

        metric!(counter("fetch.queue.submitted") += 1);
        self.inner.insert(request, Placement::Tail);

        async move {
            match rx.await {
                Ok(outcome) => outcome,
                Err(_) => Err(FetchError::Network(
                    "request queue dropped before completion".into(),
                )),
            }
        }
    }
}

impl<T: Send + 'static> QueueInner<T> {
    fn insert(self: &Arc<Self>, request: QueuedRequest<T>, placement: Placement) {
        {
            let mut pending = self.pending.lock().unwrap();
            match placement {
                Placement::Head => pending.push_front(request),
                Placement::Tail => pending.push_back(request),
            }
            metric!(gauge("fetch.queue.pending") = pending.len() as u64);
        }
        self.ensure_driving();
    }

    /// Spawns the driver task unless one is already alive.
    fn ensure_driving(self: &Arc<Self>) {
        if self
            .driving
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let inner = Arc::clone(self);
            tokio::spawn(async move { inner.drive().await });
        }
    }

    /// Admits pending requests as concurrency slots free up.
    ///
    /// The driver terminates once the queue runs empty and is restarted by
    /// the next insertion. Clearing `driving` before re-checking the queue
    /// makes sure an insertion racing with termination is never left
    /// undriven: either this driver picks it up again, or the inserter has
    /// already spawned a fresh one.
    async fn drive(self: Arc<Self>) {
        loop {
            let Ok(permit) = Arc::clone(&self.slots).acquire_owned().await else {
                break;
            };

            let next = {
                let mut pending = self.pending.lock().unwrap();
                let next = pending.pop_front();
                metric!(gauge("fetch.queue.pending") = pending.len() as u64);
                next
            };

            match next {
                Some(request) => {
                    metric!(counter("fetch.queue.admitted") += 1);
                    self.execute(request, permit);
                }
                None => {
                    drop(permit);
                    self.driving.store(false, Ordering::Release);
                    let raced = !self.pending.lock().unwrap().is_empty();
                    if !raced
                        || self
                            .driving
                            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                            .is_err()
                    {
                        break;
                    }
                }
            }
        }
    }

    /// Runs one attempt of `request` on its own task.
    ///
    /// The slot permit is held until the attempt resolves. For a retry that
    /// includes the backoff sleep, so a waiting request still counts against
    /// `max_concurrent`.
    fn execute(self: &Arc<Self>, mut request: QueuedRequest<T>, permit: OwnedSemaphorePermit) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let _slot = permit;

            match (request.work)().await {
                Ok(value) => {
                    request.outcome.send(Ok(value)).ok();
                }
                Err(e) if e.is_retryable() && request.retries < inner.config.max_retries => {
                    let delay = inner.config.retry_delay(request.retries);
                    request.retries += 1;

                    // The `&dyn Error` is not `Sync` and must not live
                    // across the backoff sleep.
                    {
                        let error: &dyn std::error::Error = &e;
                        tracing::warn!(
                            error,
                            retries = request.retries,
                            delay = ?delay,
                            "request failed, retrying"
                        );
                    }
                    metric!(counter("fetch.queue.retry") += 1);

                    tokio::time::sleep(delay).await;
                    inner.insert(request, Placement::Head);
                }
                Err(e) => {
                    let outcome = if e.is_retryable() {
                        metric!(counter("fetch.queue.exhausted") += 1);
                        FetchError::RetryExhausted {
                            attempts: request.retries + 1,
                            source: Box::new(e),
                        }
                    } else {
                        e
                    };
                    request.outcome.send(Err(outcome)).ok();
                }
            }
        });
    }
}
