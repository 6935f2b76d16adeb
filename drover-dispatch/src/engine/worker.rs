//! The per-worker claim loop

use std::{sync::Arc, time::Duration};

use drover_common::tracing::{debug, error, warn};
use tokio::sync::{Semaphore, watch};

use crate::engine::{DispatchEngine, dispatch};

/// Run one worker until the stop signal fires
///
/// The worker claims a batch, dispatches it with bounded intra-batch
/// concurrency, and sleeps between empty polls. A claimed batch is always
/// finished, even if the stop signal fires mid-batch; the engine's grace
/// timeout bounds how long that can take.
pub(crate) async fn run(
    engine: Arc<DispatchEngine>,
    worker_id: String,
    mut stop: watch::Receiver<bool>,
) {
    let Ok(runtime) = engine.runtime().cloned() else {
        error!(worker = %worker_id, "worker started before engine init");
        return;
    };

    let poll = Duration::from_secs(engine.poll_interval_secs);
    let lease = Duration::from_secs(engine.lease_secs);
    debug!(worker = %worker_id, "worker starting");

    while !*stop.borrow() {
        if engine.maintenance() {
            idle(poll, &mut stop).await;
            continue;
        }

        let batch = runtime
            .store
            .claim_batch(&worker_id, engine.batch_size, lease)
            .await;

        match batch {
            Ok(batch) if batch.is_empty() => {
                idle(poll, &mut stop).await;
            }
            Ok(batch) => {
                debug!(worker = %worker_id, claimed = batch.len(), "claimed batch");

                let semaphore = Arc::new(Semaphore::new(engine.intra_batch_concurrency));
                let mut tasks = tokio::task::JoinSet::new();

                for message in batch {
                    let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                        break; // semaphore closed, engine is tearing down
                    };
                    let engine = Arc::clone(&engine);
                    tasks.spawn(async move {
                        let _permit = permit;
                        dispatch::dispatch_message(&engine, message).await;
                    });
                }

                while tasks.join_next().await.is_some() {}
            }
            Err(e) if e.is_retriable() => {
                warn!(worker = %worker_id, error = %e, "transient store error claiming batch");
                idle(poll, &mut stop).await;
            }
            Err(e) => {
                error!(worker = %worker_id, error = %e, "store error claiming batch");
                idle(poll, &mut stop).await;
            }
        }
    }

    debug!(worker = %worker_id, "worker stopped");
}

/// Sleep for the poll interval, waking early on the stop signal
async fn idle(poll: Duration, stop: &mut watch::Receiver<bool>) {
    tokio::select! {
        () = tokio::time::sleep(poll) => {}
        _ = stop.changed() => {}
    }
}
