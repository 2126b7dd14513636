//! Processing executor: runs message tasks off the polling task

use crate::consumer::error::{ConsumerError, ConsumerResult};
use std::any::Any;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Why a submitted task produced no value
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// The task panicked
    #[error("task panicked: {0}")]
    Panicked(String),

    /// The executor was shut down before the task finished
    #[error("task cancelled")]
    Cancelled,
}

/// Spawns processing tasks onto the Tokio runtime.
///
/// Tasks are cheap green threads, so thousands of them may sit in retry
/// backoff or DLQ calls at once. `max_concurrency` bounds how many run their
/// body simultaneously. [`shutdown_now`](Self::shutdown_now) cancels everything
/// still outstanding; graceful draining is left to the shutdown coordinator.
#[derive(Debug, Clone)]
pub struct ProcessingExecutor {
    runtime: Handle,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
    max_concurrency: usize,
}

impl ProcessingExecutor {
    /// Create an executor bound to the current Tokio runtime
    pub fn new(max_concurrency: usize) -> ConsumerResult<Self> {
        if max_concurrency == 0 {
            return Err(ConsumerError::ConfigError(
                "max_concurrent_tasks must be greater than 0".to_string(),
            ));
        }
        let runtime = Handle::try_current().map_err(|e| {
            ConsumerError::ConfigError(format!("processing executor needs a Tokio runtime: {}", e))
        })?;

        Ok(Self {
            runtime,
            permits: Arc::new(Semaphore::new(max_concurrency)),
            cancel: CancellationToken::new(),
            max_concurrency,
        })
    }

    /// Run `task` in the background. Returns immediately.
    pub fn submit<F>(&self, task: F) -> TaskHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.submit_after(std::future::ready(()), move |()| task)
    }

    /// Run `task` once `gate` resolves, passing it the gate's output.
    ///
    /// The concurrency permit is taken only after the gate opens, so tasks
    /// queued behind a partition turn never hold a slot while they wait.
    pub fn submit_after<G, T, Fut>(&self, gate: G, task: T) -> TaskHandle<Fut::Output>
    where
        G: Future + Send + 'static,
        G::Output: Send + 'static,
        T: FnOnce(G::Output) -> Fut + Send + 'static,
        Fut: Future + Send + 'static,
        Fut::Output: Send + 'static,
    {
        let permits = self.permits.clone();
        let cancel = self.cancel.clone();

        let inner = self.runtime.spawn(async move {
            let run = async move {
                let opened = gate.await;
                let _permit = permits.acquire_owned().await.ok()?;
                Some(task(opened).await)
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                output = run => output,
            }
        });

        TaskHandle { inner }
    }

    /// Invoke `callback` with the task's outcome once it finishes.
    ///
    /// The callback runs even for cancelled tasks, so bookkeeping tied to it
    /// always happens.
    pub fn on_complete<T, F, Fut>(&self, handle: TaskHandle<T>, callback: F) -> JoinHandle<()>
    where
        T: Send + 'static,
        F: FnOnce(Result<T, TaskError>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.runtime.spawn(async move { callback(handle.await).await })
    }

    /// Cancel every outstanding task. Idempotent.
    pub fn shutdown_now(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        self.permits.close();
        info!("Processing executor shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Tasks currently running their body
    pub fn active_tasks(&self) -> usize {
        self.max_concurrency
            .saturating_sub(self.permits.available_permits())
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }
}

/// Handle to a submitted task; resolves to its output or a [`TaskError`]
#[derive(Debug)]
pub struct TaskHandle<T> {
    inner: JoinHandle<Option<T>>,
}

impl<T> TaskHandle<T> {
    pub fn is_finished(&self) -> bool {
        self.inner.is_finished()
    }

    /// Abort this task only
    pub fn abort(&self) {
        self.inner.abort();
    }
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T, TaskError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(Some(output))) => Poll::Ready(Ok(output)),
            Poll::Ready(Ok(None)) => Poll::Ready(Err(TaskError::Cancelled)),
            Poll::Ready(Err(e)) if e.is_panic() => {
                let message = panic_message(e.into_panic());
                debug!("Processing task panicked: {}", message);
                Poll::Ready(Err(TaskError::Panicked(message)))
            }
            Poll::Ready(Err(_)) => Poll::Ready(Err(TaskError::Cancelled)),
        }
    }
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
