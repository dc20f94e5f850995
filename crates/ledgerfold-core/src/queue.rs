//! Strictly sequential job queue.
//!
//! Jobs run one at a time in submission order on a worker task spawned onto
//! the current tokio runtime. A fail-fast queue cancels itself on the first
//! failed job: queued and future jobs are rejected with
//! [`EngineError::QueueClosed`] without running. A persistent queue keeps
//! going, and each failure only reaches the caller of the failing job.

use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};

use crate::error::{EngineError, HandlerError};

type Job = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), EngineError>> + Send>;

fn panicked() -> EngineError {
    EngineError::Handler(HandlerError::new("job panicked"))
}

/// Observable state of a queue.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueStatus {
    /// Jobs waiting to start.
    pub pending: usize,
    /// A job is currently running.
    pub busy: bool,
    /// First failure seen by a fail-fast queue.
    pub fault: Option<EngineError>,
}

impl QueueStatus {
    /// No pending jobs and nothing running.
    pub fn is_drained(&self) -> bool {
        self.pending == 0 && !self.busy
    }
}

struct QueueState {
    backlog: VecDeque<Job>,
    busy: bool,
    cancelled: bool,
}

struct Shared {
    persist: bool,
    state: Mutex<QueueState>,
    status: watch::Sender<QueueStatus>,
}

impl Shared {
    fn publish(&self, state: &QueueState) {
        self.status.send_modify(|status| {
            status.pending = state.backlog.len();
            status.busy = state.busy;
        });
    }

    fn fault(&self, error: EngineError) {
        self.status.send_modify(|status| {
            if status.fault.is_none() {
                status.fault = Some(error);
            }
        });
    }
}

/// Runs asynchronous jobs one at a time, preserving submission order.
#[derive(Clone)]
pub struct SequentialQueue {
    shared: Arc<Shared>,
}

impl Default for SequentialQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl SequentialQueue {
    /// A fail-fast queue.
    pub fn new() -> Self {
        Self::with_persist(false)
    }

    /// A queue that keeps running jobs after a failure.
    pub fn persistent() -> Self {
        Self::with_persist(true)
    }

    fn with_persist(persist: bool) -> Self {
        let (status, _) = watch::channel(QueueStatus::default());
        Self {
            shared: Arc::new(Shared {
                persist,
                state: Mutex::new(QueueState {
                    backlog: VecDeque::new(),
                    busy: false,
                    cancelled: false,
                }),
                status,
            }),
        }
    }

    pub fn is_persistent(&self) -> bool {
        self.shared.persist
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.state.lock().cancelled
    }

    pub fn status(&self) -> QueueStatus {
        self.shared.status.borrow().clone()
    }

    /// Enqueue `job` and return a future resolving to its result.
    ///
    /// The job is enqueued immediately, before the returned future is polled.
    /// Must be called from within a tokio runtime.
    pub fn submit<T, F, Fut>(
        &self,
        job: F,
    ) -> impl Future<Output = Result<T, EngineError>> + Send + 'static
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, EngineError>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let accepted = self.enqueue(Box::new(move || {
            async move {
                let result = AssertUnwindSafe(async move { job().await })
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| Err(panicked()));
                let outcome = match &result {
                    Ok(_) => Ok(()),
                    Err(e) => Err(e.clone()),
                };
                let _ = tx.send(result);
                outcome
            }
            .boxed()
        }));

        async move {
            if !accepted {
                return Err(EngineError::QueueClosed);
            }
            // A dropped sender means the job was discarded by a cancelled queue.
            rx.await.unwrap_or(Err(EngineError::QueueClosed))
        }
    }

    /// Enqueue `job` without observing its result. Returns `false` if the
    /// queue is cancelled and the job was dropped.
    pub fn push<F, Fut>(&self, job: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), EngineError>> + Send + 'static,
    {
        self.enqueue(Box::new(move || job().boxed()))
    }

    /// Resolve once no job is pending or running; fail with the queue's fault
    /// if one has been recorded.
    pub async fn wait_for_drain(&self) -> Result<(), EngineError> {
        let mut rx = self.shared.status.subscribe();
        loop {
            {
                let status = rx.borrow_and_update();
                if let Some(fault) = &status.fault {
                    return Err(fault.clone());
                }
                if status.is_drained() {
                    return Ok(());
                }
            }
            if rx.changed().await.is_err() {
                return Ok(());
            }
        }
    }

    /// Resolve with the first failure once one is recorded. Never resolves on
    /// a persistent queue.
    pub async fn faulted(&self) -> EngineError {
        let mut rx = self.shared.status.subscribe();
        loop {
            let fault = rx.borrow_and_update().fault.clone();
            if let Some(fault) = fault {
                return fault;
            }
            if rx.changed().await.is_err() {
                return futures::future::pending().await;
            }
        }
    }

    fn enqueue(&self, job: Job) -> bool {
        let mut state = self.shared.state.lock();
        if state.cancelled {
            return false;
        }
        state.backlog.push_back(job);

        if !state.busy {
            state.busy = true;
            tokio::spawn(drain(self.shared.clone()));
        }
        self.shared.publish(&state);
        true
    }
}

async fn drain(shared: Arc<Shared>) {
    loop {
        let job = {
            let mut state = shared.state.lock();
            if state.cancelled {
                // Dropping the jobs rejects their callers.
                state.backlog.clear();
            }
            match state.backlog.pop_front() {
                Some(job) => {
                    shared.publish(&state);
                    job
                }
                None => {
                    state.busy = false;
                    shared.publish(&state);
                    return;
                }
            }
        };

        let outcome = AssertUnwindSafe(job())
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(panicked()));

        if let Err(e) = outcome {
            if !shared.persist {
                let mut state = shared.state.lock();
                if !state.cancelled {
                    tracing::debug!(error = %e, "queue cancelled after failed job");
                    state.cancelled = true;
                    shared.fault(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::sleep;

    fn failure(message: &str) -> EngineError {
        EngineError::Handler(HandlerError::new(message))
    }

    #[tokio::test]
    async fn test_resolve() {
        let queue = SequentialQueue::new();
        let value = queue.submit(|| async { Ok("value") }).await.unwrap();
        assert_eq!(value, "value");
    }

    #[tokio::test]
    async fn test_reject() {
        let queue = SequentialQueue::new();
        let result: Result<(), _> = queue.submit(|| async { Err(failure("test")) }).await;
        assert_eq!(result, Err(failure("test")));
    }

    #[tokio::test]
    async fn test_slow_first_job_still_finishes_first() {
        let queue = SequentialQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = {
            let order = order.clone();
            queue.submit(move || async move {
                sleep(Duration::from_millis(10)).await;
                order.lock().push(1);
                Ok(())
            })
        };
        let second = {
            let order = order.clone();
            queue.submit(move || async move {
                order.lock().push(2);
                Ok(())
            })
        };

        let (a, b) = futures::join!(first, second);
        a.unwrap();
        b.unwrap();
        assert_eq!(*order.lock(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_fail_fast_stops_later_jobs() {
        let queue = SequentialQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let ok = {
            let order = order.clone();
            queue.submit(move || async move {
                sleep(Duration::from_millis(1)).await;
                order.lock().push(1);
                Ok(())
            })
        };
        let throws = queue.submit(|| async { Err::<(), _>(failure("boom")) });
        let ok2 = {
            let order = order.clone();
            queue.submit(move || async move {
                order.lock().push(2);
                Ok(())
            })
        };

        let (a, b, c) = futures::join!(ok, throws, ok2);
        assert!(a.is_ok());
        assert_eq!(b, Err(failure("boom")));
        assert_eq!(c, Err(EngineError::QueueClosed));
        assert_eq!(*order.lock(), vec![1]);
        assert!(queue.is_cancelled());

        let late: Result<(), _> = queue.submit(|| async { Ok(()) }).await;
        assert_eq!(late, Err(EngineError::QueueClosed));
    }

    #[tokio::test]
    async fn test_persistent_continues_after_failure() {
        let queue = SequentialQueue::persistent();
        let order = Arc::new(Mutex::new(Vec::new()));

        let ok = {
            let order = order.clone();
            queue.submit(move || async move {
                order.lock().push(1);
                Ok(())
            })
        };
        let throws = queue.submit(|| async { Err::<(), _>(failure("boom")) });
        let ok2 = {
            let order = order.clone();
            queue.submit(move || async move {
                order.lock().push(2);
                Ok(())
            })
        };

        let (a, b, c) = futures::join!(ok, throws, ok2);
        assert!(a.is_ok());
        assert!(b.is_err());
        assert!(c.is_ok());
        assert_eq!(*order.lock(), vec![1, 2]);
        assert!(queue.is_persistent());
        assert!(!queue.is_cancelled());
        assert!(queue.status().fault.is_none());
    }

    #[tokio::test]
    async fn test_wait_for_drain_resolves_repeatedly() {
        let queue = SequentialQueue::new();
        queue.wait_for_drain().await.unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        for id in [1, 2] {
            let order = order.clone();
            queue.push(move || async move {
                sleep(Duration::from_millis(1)).await;
                order.lock().push(id);
                Ok(())
            });
        }
        queue.wait_for_drain().await.unwrap();
        assert_eq!(*order.lock(), vec![1, 2]);

        for id in [4, 5] {
            let order = order.clone();
            queue.push(move || async move {
                order.lock().push(id);
                Ok(())
            });
        }
        queue.wait_for_drain().await.unwrap();
        assert_eq!(*order.lock(), vec![1, 2, 4, 5]);
        assert!(queue.status().is_drained());
    }

    #[tokio::test]
    async fn test_wait_for_drain_reports_fault() {
        let queue = SequentialQueue::new();
        let ok = queue.submit(|| async { Ok(1) });
        let throws = queue.submit(|| async {
            sleep(Duration::from_millis(1)).await;
            Err::<(), _>(failure("test"))
        });

        let (a, b, drained) = futures::join!(ok, throws, queue.wait_for_drain());
        assert_eq!(a, Ok(1));
        assert!(b.is_err());
        assert_eq!(drained, Err(failure("test")));
        assert_eq!(queue.faulted().await, failure("test"));
        assert!(!queue.push(|| async { Ok(()) }));
    }

    async fn explode() -> Result<(), EngineError> {
        panic!("boom")
    }

    #[tokio::test]
    async fn test_panicking_job_fails_as_handler_error() {
        let queue = SequentialQueue::new();
        assert!(!queue.is_persistent());

        let result = queue.submit(explode).await;
        assert_eq!(result, Err(failure("job panicked")));
        assert_eq!(queue.faulted().await, failure("job panicked"));

        let late: Result<(), _> = queue.submit(|| async { Ok(()) }).await;
        assert_eq!(late, Err(EngineError::QueueClosed));
    }

    #[tokio::test]
    async fn test_panicking_pushed_job_faults_queue() {
        let queue = SequentialQueue::new();
        queue.push(explode);
        assert_eq!(queue.wait_for_drain().await, Err(failure("job panicked")));
    }
}
