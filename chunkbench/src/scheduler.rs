//! Bounded concurrent execution of read tasks.
//!
//! [`run_bounded`] spawns every task up front; each task must take a permit from a
//! counting admission gate before it starts, so a finishing task admits the next
//! waiting one immediately. Without a limit there is no gate at all.
//!
//! [`run_whole`] is the separate path for a single whole-array read.

use std::{
    future::Future,
    num::NonZeroUsize,
    sync::{Arc, OnceLock},
    time::{Duration, Instant},
};

use futures::future::BoxFuture;
use tokio::{sync::Semaphore, task::JoinSet};
use tracing::debug;

use crate::store::ReadError;

/// One region read, boxed so heterogeneous tasks can share a list.
pub type ReadTask<T> = BoxFuture<'static, Result<T, ReadError>>;

/// The outputs of a fully successful run, in completion order.
#[derive(Debug)]
pub struct Completed<T> {
    /// From the first admission to the last task reaching a terminal state.
    pub elapsed: Duration,
    pub outputs: Vec<T>,
}

fn join_error(e: tokio::task::JoinError) -> ReadError {
    ReadError::Task(e.to_string())
}

/// Run all `tasks` with at most `limit` of them in flight at any instant.
///
/// `None` admits every task at once. If any task fails, the remaining tasks are still
/// driven to completion and the first failure (in completion order) is returned.
///
/// Must be called from within a tokio runtime.
pub async fn run_bounded<T, F, I>(tasks: I, limit: Option<NonZeroUsize>) -> Result<Completed<T>, ReadError>
where
    I: IntoIterator<Item = F>,
    F: Future<Output = Result<T, ReadError>> + Send + 'static,
    T: Send + 'static,
{
    let gate = limit.map(|limit| Arc::new(Semaphore::new(limit.get())));
    let first_admission = Arc::new(OnceLock::<Instant>::new());

    let mut set = JoinSet::new();
    for task in tasks {
        let gate = gate.clone();
        let first_admission = Arc::clone(&first_admission);
        set.spawn(async move {
            let _permit = match gate {
                Some(gate) => Some(
                    gate.acquire_owned()
                        .await
                        .expect("admission gate is never closed"),
                ),
                None => None,
            };
            first_admission.get_or_init(Instant::now);
            task.await
        });
    }
    let spawned = set.len();

    let mut outputs = Vec::with_capacity(spawned);
    let mut first_error = None;
    while let Some(res) = set.join_next().await {
        match res.map_err(join_error).and_then(|r| r) {
            Ok(output) => outputs.push(output),
            Err(e) => {
                debug!(error = %e, "read task failed, draining remaining tasks");
                first_error.get_or_insert(e);
            }
        }
    }
    let finished = Instant::now();

    if let Some(e) = first_error {
        return Err(e);
    }
    let elapsed = first_admission
        .get()
        .map(|start| finished.duration_since(*start))
        .unwrap_or_default();
    debug!(spawned, ?limit, ?elapsed, "all read tasks finished");
    Ok(Completed { elapsed, outputs })
}

/// Run a single whole-array read task and time it.
pub async fn run_whole<T, F>(task: F) -> Result<(Duration, T), ReadError>
where
    F: Future<Output = Result<T, ReadError>> + Send + 'static,
    T: Send + 'static,
{
    let start = Instant::now();
    let output = tokio::spawn(task).await.map_err(join_error)?;
    let elapsed = start.elapsed();
    Ok((elapsed, output?))
}

#[cfg(test)]
mod tests;
