//! Bounded background dispatcher for pipeline work.
//!
//! API handlers enqueue work and return immediately; a dispatch loop pulls
//! items off a bounded channel and runs each in its own task, with a
//! semaphore capping concurrent pipelines. Independent pipelines run in
//! parallel; steps within one run stay sequential inside the executor.

use std::sync::Arc;

use anyhow::{Result, bail};
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::executor::PipelineExecutor;

/// One unit of background work.
#[derive(Debug, Clone)]
pub enum Work {
    /// Start the pipeline for a freshly queued task.
    ExecuteTask { task_id: Uuid, tenant_id: Uuid },
    /// Continue an existing run (fork, resume).
    DriveRun { run_id: Uuid },
}

/// Handle for enqueuing background work.
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::Sender<Work>,
}

impl Dispatcher {
    /// Spawn the dispatch loop. `max_concurrent` caps simultaneously
    /// executing pipelines; `queue_depth` bounds the backlog.
    pub fn spawn(
        executor: PipelineExecutor,
        max_concurrent: usize,
        queue_depth: usize,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel::<Work>(queue_depth);
        let semaphore = Arc::new(Semaphore::new(max_concurrent.max(1)));

        tokio::spawn(async move {
            loop {
                let work = tokio::select! {
                    _ = cancel.cancelled() => break,
                    work = rx.recv() => match work {
                        Some(work) => work,
                        None => break,
                    },
                };

                let permit = match semaphore.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };

                let executor = executor.clone();
                tokio::spawn(async move {
                    run_work(&executor, work).await;
                    drop(permit);
                });
            }
            tracing::info!("pipeline dispatcher stopped");
        });

        Self { tx }
    }

    /// Enqueue work without blocking. Fails when the backlog is full or
    /// the dispatcher has shut down.
    pub fn enqueue(&self, work: Work) -> Result<()> {
        match self.tx.try_send(work) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => bail!("dispatcher backlog is full"),
            Err(mpsc::error::TrySendError::Closed(_)) => bail!("dispatcher is shut down"),
        }
    }
}

async fn run_work(executor: &PipelineExecutor, work: Work) {
    match work {
        Work::ExecuteTask { task_id, tenant_id } => {
            tracing::info!(task_id = %task_id, "dispatching pipeline execution");
            if let Err(e) = executor.execute(task_id, tenant_id).await {
                tracing::error!(task_id = %task_id, error = %e, "pipeline execution failed");
            }
        }
        Work::DriveRun { run_id } => {
            tracing::info!(run_id = %run_id, "dispatching run continuation");
            if let Err(e) = executor.drive(run_id).await {
                tracing::error!(run_id = %run_id, error = %e, "run continuation failed");
            }
        }
    }
}
