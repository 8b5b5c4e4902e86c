//! Bounded worker pool for chunk transfers
//!
//! A fixed number of workers pull jobs from a bounded queue. The first job to
//! fail cancels the pool: the producer stops queueing, idle workers exit, and
//! that first error is returned. Work already finished is not rolled back.

use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::TransferError;

/// Concurrent chunk transfers per file
pub const MAX_TRANSFER_THREADS: usize = 3;

/// Run `handler` over `jobs` on `workers` concurrent tasks
///
/// Producing a job may itself fail, which cancels the pool like a failed
/// job. Cancelling `cancel` from outside stops the pool with
/// [`TransferError::Cancelled`].
pub async fn run_jobs<J, I, F, Fut>(
    workers: usize,
    cancel: &CancellationToken,
    jobs: I,
    handler: F,
) -> Result<(), TransferError>
where
    I: IntoIterator<Item = Result<J, TransferError>>,
    J: Send + 'static,
    F: Fn(J) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), TransferError>> + Send + 'static,
{
    let workers = workers.max(1);
    let token = cancel.child_token();
    let first_error: Arc<Mutex<Option<TransferError>>> = Arc::new(Mutex::new(None));
    let handler = Arc::new(handler);

    let (tx, rx) = mpsc::channel::<J>(workers);
    let rx = Arc::new(tokio::sync::Mutex::new(rx));

    let mut handles = Vec::with_capacity(workers);
    for worker in 0..workers {
        let rx = rx.clone();
        let token = token.clone();
        let handler = handler.clone();
        let first_error = first_error.clone();

        handles.push(tokio::spawn(async move {
            loop {
                let job = tokio::select! {
                    _ = token.cancelled() => break,
                    job = async { rx.lock().await.recv().await } => match job {
                        Some(job) => job,
                        None => break,
                    },
                };

                if let Err(e) = handler(job).await {
                    debug!(worker = worker, error = %e, "Worker failed, cancelling pool");
                    record_error(&first_error, e);
                    token.cancel();
                    break;
                }
            }
        }));
    }
    drop(rx);

    for job in jobs {
        let job = match job {
            Ok(job) => job,
            Err(e) => {
                record_error(&first_error, e);
                token.cancel();
                break;
            }
        };
        tokio::select! {
            _ = token.cancelled() => break,
            sent = tx.send(job) => if sent.is_err() { break },
        }
    }
    drop(tx);

    for handle in handles {
        if let Err(e) = handle.await {
            record_error(&first_error, e.into());
            token.cancel();
        }
    }

    let error = first_error.lock().unwrap_or_else(|e| e.into_inner()).take();
    match error {
        Some(e) => Err(e),
        None if cancel.is_cancelled() => Err(TransferError::Cancelled),
        None => Ok(()),
    }
}

fn record_error(slot: &Mutex<Option<TransferError>>, error: TransferError) {
    let mut slot = slot.lock().unwrap_or_else(|e| e.into_inner());
    if slot.is_none() {
        *slot = Some(error);
    }
}
