//! Single-worker FIFO for every operation that mutates the trunk repository.
//!
//! Jobs run one at a time in submission order. A job that fails or panics is
//! logged and the worker moves on to the next one.

use std::future::Future;
use std::panic::AssertUnwindSafe;

use anyhow::{Result, anyhow};
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

type Job = BoxFuture<'static, Result<()>>;

enum Message {
    Job { label: String, job: Job },
    Drain(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct CommitQueue {
    tx: mpsc::UnboundedSender<Message>,
}

impl CommitQueue {
    /// Spawn the worker on the current tokio runtime.
    pub fn start() -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_worker(rx));
        (Self { tx }, worker)
    }

    /// Queue `job` without waiting for it.
    pub fn enqueue<F>(&self, label: impl Into<String>, job: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let label = label.into();
        tracing::debug!(job = %label, "commit job queued");
        if self
            .tx
            .send(Message::Job {
                label: label.clone(),
                job: job.boxed(),
            })
            .is_err()
        {
            tracing::error!(job = %label, "commit queue closed; job dropped");
        }
    }

    /// Queue `job` and resolve with its result once it has run.
    pub async fn enqueue_and_wait<T, F>(&self, label: impl Into<String>, job: F) -> Result<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let label = label.into();
        let (done_tx, done_rx) = oneshot::channel();
        let wrapped = async move {
            let result = job.await;
            // The waiter may have been dropped; nothing to report then.
            let _ = done_tx.send(result);
            Ok::<(), anyhow::Error>(())
        };
        self.tx
            .send(Message::Job {
                label: label.clone(),
                job: wrapped.boxed(),
            })
            .map_err(|_| anyhow!("commit queue closed; job '{}' not run", label))?;
        done_rx
            .await
            .map_err(|_| anyhow!("commit job '{}' panicked", label))?
    }

    /// Resolve once every job queued before this call has executed.
    pub async fn drain(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Message::Drain(tx)).is_err() {
            return;
        }
        let _ = rx.await;
    }
}

async fn run_worker(mut rx: mpsc::UnboundedReceiver<Message>) {
    while let Some(message) = rx.recv().await {
        match message {
            Message::Job { label, job } => match AssertUnwindSafe(job).catch_unwind().await {
                Ok(Ok(())) => tracing::debug!(job = %label, "commit job finished"),
                Ok(Err(e)) => tracing::error!(job = %label, error = %e, "commit job failed"),
                Err(_) => tracing::error!(job = %label, "commit job panicked"),
            },
            Message::Drain(done) => {
                let _ = done.send(());
            }
        }
    }
    tracing::debug!("commit queue worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Mutex;

    #[tokio::test]
    async fn test_jobs_run_in_submission_order() {
        let (queue, _worker) = CommitQueue::start();
        let log = Arc::new(Mutex::new(Vec::new()));

        for (name, delay) in [("A", 30), ("B", 0), ("C", 10)] {
            let log = Arc::clone(&log);
            queue.enqueue(name, async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                log.lock().await.push(name);
                Ok(())
            });
        }
        queue.drain().await;
        assert_eq!(*log.lock().await, vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn test_concurrent_enqueues_keep_order() {
        let (queue, _worker) = CommitQueue::start();
        let log = Arc::new(Mutex::new(Vec::new()));

        let a = {
            let log = Arc::clone(&log);
            queue.enqueue_and_wait("A", async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                log.lock().await.push("A");
                Ok(())
            })
        };
        let b = {
            let log = Arc::clone(&log);
            queue.enqueue_and_wait("B", async move {
                log.lock().await.push("B");
                Ok(())
            })
        };
        let (ra, rb) = tokio::join!(a, b);
        ra.unwrap();
        rb.unwrap();
        assert_eq!(*log.lock().await, vec!["A", "B"]);
    }

    #[tokio::test]
    async fn test_enqueue_and_wait_returns_job_result() {
        let (queue, _worker) = CommitQueue::start();
        let value = queue.enqueue_and_wait("answer", async { Ok(42) }).await.unwrap();
        assert_eq!(value, 42);

        let err = queue
            .enqueue_and_wait::<(), _>("bad", async { Err(anyhow!("merge failed")) })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("merge failed"));
    }

    fn explode() -> Result<()> {
        panic!("job exploded")
    }

    #[tokio::test]
    async fn test_failing_and_panicking_jobs_do_not_halt_queue() {
        let (queue, _worker) = CommitQueue::start();
        let ran = Arc::new(Mutex::new(false));

        queue.enqueue("fails", async { Err(anyhow!("boom")) });
        queue.enqueue("panics", async { explode() });
        let panicked = queue
            .enqueue_and_wait::<(), _>("panics-too", async { explode() })
            .await;
        assert!(panicked.is_err());

        let flag = Arc::clone(&ran);
        queue.enqueue("after", async move {
            *flag.lock().await = true;
            Ok(())
        });
        queue.drain().await;
        assert!(*ran.lock().await);
    }

    #[tokio::test]
    async fn test_drain_on_empty_queue_resolves() {
        let (queue, _worker) = CommitQueue::start();
        tokio::time::timeout(Duration::from_secs(1), queue.drain())
            .await
            .unwrap();
    }
}
