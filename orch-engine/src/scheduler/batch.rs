//! Concurrent execution of one phase's worth of items

use futures::{stream::FuturesUnordered, Future, StreamExt};
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Context provided to each item in a batch
#[derive(Debug, Clone, Copy)]
pub struct TaskContext {
    /// Phase number (1-based)
    pub phase: usize,
    /// Item number (1-based)
    pub task_number: usize,
    /// Total number of items in this batch
    pub total_tasks: usize,
}

/// Run every item concurrently and wait for all of them to settle.
///
/// `max_concurrency` caps how many items run at once; `None` starts them all.
/// Nothing short-circuits: a failing item (encoded in `R`) does not cancel its
/// siblings. Results come back in input order.
pub async fn execute_batch<T, F, Fut, R>(
    phase: usize,
    items: Vec<T>,
    max_concurrency: Option<usize>,
    task_executor: F,
) -> Vec<R>
where
    F: Fn(T, TaskContext) -> Fut,
    Fut: Future<Output = R>,
{
    let total = items.len();
    let sem = max_concurrency.map(|n| Arc::new(Semaphore::new(n.max(1))));
    let executor = &task_executor;
    let mut tasks = FuturesUnordered::new();

    for (idx, item) in items.into_iter().enumerate() {
        let sem = sem.clone();
        let ctx = TaskContext {
            phase,
            task_number: idx + 1,
            total_tasks: total,
        };

        tasks.push(async move {
            // Semaphore is owned here and never closed, so acquire only fails
            // if that changes; run unthrottled rather than drop the item.
            let _permit = match &sem {
                Some(sem) => sem.clone().acquire_owned().await.ok(),
                None => None,
            };
            (idx, executor(item, ctx).await)
        });
    }

    let mut results = Vec::with_capacity(total);
    while let Some(result) = tasks.next().await {
        results.push(result);
    }

    results.sort_by_key(|(idx, _)| *idx);
    results.into_iter().map(|(_, r)| r).collect()
}
