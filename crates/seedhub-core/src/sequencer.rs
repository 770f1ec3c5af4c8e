//! Per-instance request sequencer
//!
//! Most native client protocols are not safe for concurrent in-flight
//! requests over a single session, so every call against one backend
//! instance is funneled through a FIFO worker task. Each instance owns
//! its own sequencer; operations against different instances run in
//! parallel.

use crate::error::SeedhubError;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

type Job = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Serializes operations against one backend instance.
///
/// Operation N+1 starts only after operation N has settled. A failed
/// operation resolves its own caller with the error and never poisons
/// the chain for subsequent operations.
pub struct RequestSequencer {
    tx: mpsc::UnboundedSender<Job>,
    pending: Arc<AtomicUsize>,
}

impl RequestSequencer {
    pub fn new(instance_id: &str) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let pending = Arc::new(AtomicUsize::new(0));

        let worker_pending = pending.clone();
        let worker_id = instance_id.to_string();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job().await;
                worker_pending.fetch_sub(1, Ordering::AcqRel);
            }
            debug!("Sequencer for instance {} shut down", worker_id);
        });

        Self { tx, pending }
    }

    /// Number of operations submitted but not yet settled
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Submit an operation. Submission order is execution order; the
    /// returned receiver resolves once the operation settles.
    pub fn enqueue<T, F>(&self, operation: F) -> oneshot::Receiver<Result<T, SeedhubError>>
    where
        F: Future<Output = Result<T, SeedhubError>> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();

        self.pending.fetch_add(1, Ordering::AcqRel);
        let job: Job = Box::new(move || {
            Box::pin(async move {
                let result = operation.await;
                // Caller may have gone away; the chain continues regardless
                let _ = reply_tx.send(result);
            })
        });

        if self.tx.send(job).is_err() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            // Receiver resolves with RecvError since reply_tx was dropped
        }

        reply_rx
    }

    /// Submit an operation and wait for its result
    pub async fn run<T, F>(&self, operation: F) -> Result<T, SeedhubError>
    where
        F: Future<Output = Result<T, SeedhubError>> + Send + 'static,
        T: Send + 'static,
    {
        match self.enqueue(operation).await {
            Ok(result) => result,
            Err(_) => Err(SeedhubError::Request(
                "Sequencer shut down before operation completed".to_string(),
            )),
        }
    }
}
