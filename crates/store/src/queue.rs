//! The serialized write queue.
//!
//! `enqueue` pushes a job onto an unbounded FIFO synchronously, at call
//! time, and hands back a future for the job's result. One spawned worker
//! drains the FIFO, running each job to completion (retries included)
//! before starting the next, so no two writes from this process ever hit
//! the store concurrently and results settle in enqueue order.
//!
//! A job that fails or panics settles only its own future; the worker
//! moves on to the next job regardless.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use flowbot_config::{BackoffKind, WriteQueueConfig};
use flowbot_core::error::StoreError;
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Why a queued write did not produce a value.
#[derive(Debug, Clone, thiserror::Error)]
pub enum WriteError {
    #[error("Write task '{label}' failed after {attempts} attempts: {last_error}")]
    Exhausted {
        label: String,
        attempts: u32,
        #[source]
        last_error: StoreError,
    },

    #[error("Write queue is closed")]
    QueueClosed,

    #[error("Write task '{label}' panicked")]
    Panicked { label: String },
}

impl WriteError {
    /// The store error behind an exhausted task, if any.
    pub fn store_error(&self) -> Option<&StoreError> {
        match self {
            Self::Exhausted { last_error, .. } => Some(last_error),
            _ => None,
        }
    }
}

/// Bounded retry for one write task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, first one included (at least 1)
    pub max_attempts: u32,
    /// Wait after the first failure
    pub delay: Duration,
    pub backoff: BackoffKind,
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
            backoff: BackoffKind::Fixed,
        }
    }

    pub fn exponential(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
            backoff: BackoffKind::Exponential,
        }
    }

    /// A single attempt, no retries.
    pub fn once() -> Self {
        Self::fixed(1, Duration::ZERO)
    }

    /// Wait before the attempt following failed attempt number `failed` (1-based).
    pub fn delay_for(&self, failed: u32) -> Duration {
        match self.backoff {
            BackoffKind::Fixed => self.delay,
            BackoffKind::Exponential => {
                let factor = 2u32.saturating_pow(failed.saturating_sub(1));
                self.delay.saturating_mul(factor)
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&WriteQueueConfig::default())
    }
}

impl From<&WriteQueueConfig> for RetryPolicy {
    fn from(config: &WriteQueueConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            delay: Duration::from_millis(config.delay_ms),
            backoff: config.backoff,
        }
    }
}

struct Job {
    label: String,
    run: BoxFuture<'static, ()>,
}

/// Handle to the write queue. Cloning shares the same FIFO and worker.
///
/// The worker exits once every handle has been dropped and the FIFO is
/// drained.
#[derive(Clone)]
pub struct WriteQueue {
    sender: mpsc::UnboundedSender<Job>,
    pending: Arc<AtomicUsize>,
    policy: RetryPolicy,
}

impl WriteQueue {
    /// Start the queue's worker on the current tokio runtime.
    ///
    /// Must be called from within a runtime.
    pub fn new(policy: RetryPolicy) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        tokio::spawn(drain(receiver, Arc::clone(&pending)));
        info!(
            max_attempts = policy.max_attempts,
            delay_ms = policy.delay.as_millis() as u64,
            backoff = ?policy.backoff,
            "Write queue started"
        );
        Self {
            sender,
            pending,
            policy,
        }
    }

    pub fn from_config(config: &WriteQueueConfig) -> Self {
        Self::new(RetryPolicy::from(config))
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Jobs queued or running.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Queue a write under the default policy.
    ///
    /// The job is in the FIFO when this returns; awaiting the future only
    /// observes its result, and dropping the future does not cancel it.
    /// `task` is called once per attempt.
    pub fn enqueue<T, F, Fut>(
        &self,
        label: impl Into<String>,
        task: F,
    ) -> impl Future<Output = Result<T, WriteError>> + Send + 'static
    where
        T: Send + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, StoreError>> + Send + 'static,
    {
        self.enqueue_with_policy(label, self.policy.clone(), task)
    }

    /// Queue a write with its own retry policy.
    pub fn enqueue_with_policy<T, F, Fut>(
        &self,
        label: impl Into<String>,
        policy: RetryPolicy,
        task: F,
    ) -> impl Future<Output = Result<T, WriteError>> + Send + 'static
    where
        T: Send + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, StoreError>> + Send + 'static,
    {
        let label = label.into();
        let (result_tx, result_rx) = oneshot::channel();

        let job_label = label.clone();
        let run = async move {
            let result = run_with_retry(&job_label, &policy, task).await;
            // The enqueuer may have stopped listening
            let _ = result_tx.send(result);
        }
        .boxed();

        self.pending.fetch_add(1, Ordering::SeqCst);
        let accepted = self
            .sender
            .send(Job {
                label: label.clone(),
                run,
            })
            .is_ok();
        if accepted {
            debug!(label = %label, pending = self.pending(), "Write task queued");
        } else {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            error!(label = %label, "Write queue closed, task rejected");
        }

        async move {
            if !accepted {
                return Err(WriteError::QueueClosed);
            }
            result_rx.await.unwrap_or(Err(WriteError::QueueClosed))
        }
    }
}

async fn drain(mut receiver: mpsc::UnboundedReceiver<Job>, pending: Arc<AtomicUsize>) {
    while let Some(job) = receiver.recv().await {
        debug!(label = %job.label, "Write task started");
        if AssertUnwindSafe(job.run).catch_unwind().await.is_err() {
            error!(label = %job.label, "Write job panicked outside its task");
        }
        pending.fetch_sub(1, Ordering::SeqCst);
    }
    debug!("Write queue worker stopped");
}

async fn run_with_retry<T, F, Fut>(
    label: &str,
    policy: &RetryPolicy,
    mut task: F,
) -> Result<T, WriteError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let future = match std::panic::catch_unwind(AssertUnwindSafe(&mut task)) {
            Ok(future) => future,
            Err(_) => return Err(panicked(label, attempt)),
        };

        match AssertUnwindSafe(future).catch_unwind().await {
            Ok(Ok(value)) => {
                if attempt > 1 {
                    info!(label, attempt, "Write task succeeded after retry");
                } else {
                    debug!(label, "Write task succeeded");
                }
                return Ok(value);
            }
            Ok(Err(e)) if attempt < max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    label,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Write task failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Ok(Err(e)) => {
                error!(label, attempt, error = %e, "Write task failed, retries exhausted");
                return Err(WriteError::Exhausted {
                    label: label.to_string(),
                    attempts: attempt,
                    last_error: e,
                });
            }
            Err(_) => return Err(panicked(label, attempt)),
        }
    }
}

fn panicked(label: &str, attempt: u32) -> WriteError {
    error!(label, attempt, "Write task panicked");
    WriteError::Panicked {
        label: label.to_string(),
    }
}
