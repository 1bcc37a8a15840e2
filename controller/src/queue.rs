//! A deduplicating work queue of object keys.
//!
//! Keys are processed level-triggered: a sync function always re-reads the
//! current cache state, so a key only needs to be processed once no matter how
//! many times it was enqueued while waiting. A key is never processed by two
//! workers at the same time.

use futures::prelude::*;
use parking_lot::Mutex;
use std::{
    any::Any,
    collections::{HashMap, HashSet, VecDeque},
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::{sync::Notify, task::JoinSet, time};
use tokio_util::sync::CancellationToken;

/// Controls how failed keys are retried.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Backoff {
    pub base: time::Duration,
    pub max: time::Duration,
    /// The number of retries after which a failing key is forgotten.
    pub retries: u32,
}

#[derive(Clone)]
pub struct Queue {
    inner: Arc<Inner>,
}

struct Inner {
    name: &'static str,
    backoff: Backoff,
    state: Mutex<State>,
    notify: Notify,
    shutting_down: AtomicBool,
}

#[derive(Debug, Default)]
struct State {
    pending: VecDeque<String>,
    queued: HashSet<String>,
    active: HashSet<String>,
    /// Keys enqueued while they were being processed.
    dirty: HashSet<String>,
    failures: HashMap<String, u32>,
}

// === impl Backoff ===

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: time::Duration::from_millis(100),
            max: time::Duration::from_secs(30),
            retries: 5,
        }
    }
}

impl Backoff {
    /// Returns the delay before the given (1-based) retry attempt.
    fn delay(&self, attempt: u32) -> time::Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.base.saturating_mul(factor).min(self.max)
    }
}

// === impl Queue ===

impl Queue {
    pub fn new(name: &'static str) -> Self {
        Self::with_backoff(name, Backoff::default())
    }

    pub fn with_backoff(name: &'static str, backoff: Backoff) -> Self {
        Self {
            inner: Arc::new(Inner {
                name,
                backoff,
                state: Mutex::new(State::default()),
                notify: Notify::new(),
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    /// Adds `key` to the queue, returning true if it was not already waiting.
    ///
    /// A key that is currently being processed is held back until its sync
    /// completes and is then queued once.
    pub fn enqueue(&self, key: impl Into<String>) -> bool {
        if self.is_shutting_down() {
            return false;
        }

        let key = key.into();
        let mut state = self.inner.state.lock();
        if state.queued.contains(&key) {
            tracing::trace!(queue = %self.inner.name, %key, "already queued");
            return false;
        }
        if state.active.contains(&key) {
            tracing::trace!(queue = %self.inner.name, %key, "in flight; deferring");
            return state.dirty.insert(key);
        }

        tracing::trace!(queue = %self.inner.name, %key, "queued");
        state.queued.insert(key.clone());
        state.pending.push_back(key);
        drop(state);
        self.inner.notify.notify_one();
        true
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::Acquire)
    }

    /// The number of keys waiting to be processed.
    pub fn len(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Indicates whether `key` is waiting to be processed.
    pub fn contains(&self, key: &str) -> bool {
        self.inner.state.lock().queued.contains(key)
    }

    /// Removes and returns every waiting key.
    #[cfg(test)]
    pub(crate) fn drain(&self) -> Vec<String> {
        let mut state = self.inner.state.lock();
        state.queued.clear();
        state.pending.drain(..).collect()
    }

    /// Drains the queue with `workers` concurrent loops until `shutdown` fires.
    ///
    /// Idle workers wake when a key is enqueued or every `period`; a zero
    /// `period` disables polling. This future completes only after every
    /// in-flight sync has returned.
    ///
    /// A sync that panics is treated as a failed sync and retried.
    pub async fn run<F, Fut>(
        self,
        workers: usize,
        period: time::Duration,
        sync: F,
        shutdown: CancellationToken,
    ) where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let sync = Arc::new(sync);
        let mut tasks = JoinSet::new();
        for _ in 0..workers.max(1) {
            tasks.spawn(self.clone().work(period, sync.clone(), shutdown.clone()));
        }
        tracing::debug!(queue = %self.inner.name, workers, "started");

        let cancelled = shutdown.cancelled();
        tokio::pin!(cancelled);
        loop {
            tokio::select! {
                _ = &mut cancelled, if !self.is_shutting_down() => self.shut_down(),
                res = tasks.join_next() => match res {
                    Some(Ok(())) => {}
                    Some(Err(error)) => tracing::error!(queue = %self.inner.name, %error, "worker failed"),
                    None => break,
                },
            }
        }

        tracing::debug!(queue = %self.inner.name, remaining = self.len(), "stopped");
    }

    async fn work<F, Fut>(self, period: time::Duration, sync: Arc<F>, shutdown: CancellationToken)
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        while !self.is_shutting_down() && !shutdown.is_cancelled() {
            let key = match self.pop() {
                Some(key) => key,
                None => {
                    tokio::select! {
                        _ = self.inner.notify.notified() => {}
                        _ = time::sleep(period), if !period.is_zero() => {}
                        _ = shutdown.cancelled() => {}
                    }
                    continue;
                }
            };

            // Panics raised while building the sync future are caught too.
            let res = AssertUnwindSafe(async { (sync)(key.clone()).await })
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    Err(anyhow::anyhow!("sync panicked: {}", panic_message(&*panic)))
                });
            self.finish(key, res);
        }
    }

    fn pop(&self) -> Option<String> {
        let mut state = self.inner.state.lock();
        let key = state.pending.pop_front()?;
        state.queued.remove(&key);
        state.active.insert(key.clone());
        Some(key)
    }

    fn finish(&self, key: String, res: anyhow::Result<()>) {
        let mut state = self.inner.state.lock();
        state.active.remove(&key);

        match res {
            Ok(()) => {
                state.failures.remove(&key);
            }
            Err(error) => {
                let attempt = {
                    let failures = state.failures.entry(key.clone()).or_default();
                    *failures += 1;
                    *failures
                };
                if attempt > self.inner.backoff.retries {
                    state.failures.remove(&key);
                    tracing::warn!(
                        queue = %self.inner.name,
                        %key,
                        %error,
                        retries = self.inner.backoff.retries,
                        "dropping key after exhausting retries"
                    );
                } else {
                    let delay = self.inner.backoff.delay(attempt);
                    tracing::info!(queue = %self.inner.name, %key, %error, ?delay, attempt, "sync failed; retrying");
                    // A retry supersedes any change observed while in flight.
                    state.dirty.remove(&key);
                    drop(state);
                    self.enqueue_after(key, delay);
                    return;
                }
            }
        }

        let requeue = state.dirty.remove(&key);
        drop(state);
        if requeue {
            self.enqueue(key);
        }
    }

    fn enqueue_after(&self, key: String, delay: time::Duration) {
        let queue = self.clone();
        tokio::spawn(async move {
            time::sleep(delay).await;
            queue.enqueue(key);
        });
    }

    fn shut_down(&self) {
        tracing::debug!(queue = %self.inner.name, "shutting down");
        self.inner.shutting_down.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&'static str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown")
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.inner.name)
            .field("len", &self.len())
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}
