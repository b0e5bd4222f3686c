//! Task management utilities for consistent background task handling
//!
//! Every long-running loop (firehose consumer, shard workers, cursor
//! checkpointer, Ozone poller, policy reloader) is started through these
//! helpers so start/stop is logged the same way and a failing task takes the
//! whole process down instead of silently stalling ingestion.

use std::future::Future;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{error, info};

/// Spawn a background task with cancellation support
///
/// The task receives a clone of the application token. If the task returns
/// an error the application token is cancelled, which triggers shutdown.
pub fn spawn_cancellable_task<F, Fut>(
    tracker: &TaskTracker,
    app_token: CancellationToken,
    task_name: &'static str,
    task_builder: F,
) where
    F: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    info!(task = task_name, "Starting background task");

    let task_token = app_token.clone();
    let cancel_token = app_token.clone();

    tracker.spawn(async move {
        tokio::select! {
            result = task_builder(cancel_token.clone()) => {
                match result {
                    Ok(()) => {
                        info!(task = task_name, "Background task completed successfully");
                    }
                    Err(e) => {
                        error!(task = task_name, error = ?e, "Background task failed unexpectedly");
                        task_token.cancel();
                    }
                }
            }
            () = task_token.cancelled() => {
                info!(task = task_name, "Background task shutting down gracefully");
            }
        }
    });
}

/// Spawn a task that must run to completion even after cancellation.
///
/// Used for work that drains on shutdown (shard workers, the final cursor
/// flush); the task itself is responsible for observing the token.
pub fn spawn_draining_task<F, Fut>(
    tracker: &TaskTracker,
    app_token: CancellationToken,
    task_name: &'static str,
    task_builder: F,
) where
    F: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    info!(task = task_name, "Starting draining task");

    let task_token = app_token.clone();

    tracker.spawn(async move {
        match task_builder(task_token.clone()).await {
            Ok(()) => {
                info!(task = task_name, "Draining task completed");
            }
            Err(e) => {
                error!(task = task_name, error = ?e, "Draining task failed unexpectedly");
                task_token.cancel();
            }
        }
    });
}
