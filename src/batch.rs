//! Bounded-concurrency batch executor (spec.md 4.6 / 5).
//!
//! A semaphore folds the "how many are running" counter and the "who's
//! waiting" queue into one atomic unit, so the executor itself carries no
//! scheduling state beyond the permit pool.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::error::DispatchError;

/// Outcome of a single batch item, order-preserving against the input.
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub index: usize,
    pub success: bool,
    pub body: Option<Value>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub duration: Duration,
    pub tokens_estimate: u64,
}

/// Run `items` through `op` with at most `max_concurrency` in flight at
/// once. All items run to completion regardless of individual failures
/// (all-settled semantics); results are returned in input order.
pub async fn run_batch<T, F, Fut>(
    items: Vec<T>,
    max_concurrency: usize,
    op: F,
) -> (Vec<BatchOutcome>, BatchSummary)
where
    T: Send + 'static,
    F: Fn(usize, T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, DispatchError>> + Send + 'static,
{
    let started = Instant::now();
    let semaphore = Arc::new(Semaphore::new(max_concurrency.max(1)));
    let op = Arc::new(op);

    let mut set = JoinSet::new();
    for (index, input) in items.into_iter().enumerate() {
        let semaphore = semaphore.clone();
        let op = op.clone();
        set.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .expect("semaphore is never closed");
            match op(index, input).await {
                Ok(body) => BatchOutcome {
                    index,
                    success: true,
                    body: Some(body),
                    error: None,
                },
                Err(err) => BatchOutcome {
                    index,
                    success: false,
                    body: None,
                    error: Some(err.to_string()),
                },
            }
        });
    }

    let mut outcomes: Vec<BatchOutcome> = Vec::new();
    while let Some(joined) = set.join_next().await {
        outcomes.push(joined.unwrap_or_else(|err| BatchOutcome {
            index: usize::MAX,
            success: false,
            body: None,
            error: Some(format!("batch item task panicked: {err}")),
        }));
    }

    outcomes.sort_by_key(|outcome| outcome.index);

    let total = outcomes.len();
    let succeeded = outcomes.iter().filter(|o| o.success).count();
    let summary = BatchSummary {
        total,
        succeeded,
        failed: total - succeeded,
        duration: started.elapsed(),
        // Token estimates live inside each item's own `body`, whose shape
        // this generic executor doesn't know; callers that carry a
        // tokensEstimate per item (the dispatcher does) recompute this.
        tokens_estimate: 0,
    };

    (outcomes, summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn preserves_input_order_with_mixed_outcomes() {
        let items = vec![0u32, 1, 2, 3];
        let (outcomes, summary) = run_batch(items, 10, |index, value| async move {
            if value % 2 == 0 {
                Ok(serde_json::json!({ "value": value }))
            } else {
                Err(DispatchError::Internal(format!("odd at {index}")))
            }
        })
        .await;

        let indices: Vec<usize> = outcomes.iter().map(|o| o.index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
        assert_eq!(summary.total, 4);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.failed, 2);
        assert!(outcomes[0].success);
        assert!(!outcomes[1].success);
    }

    #[tokio::test]
    async fn enforces_concurrency_cap() {
        let concurrent = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let items = vec![(); 20];

        let concurrent_clone = concurrent.clone();
        let max_seen_clone = max_seen.clone();
        let (_, summary) = run_batch(items, 5, move |_, _| {
            let concurrent = concurrent_clone.clone();
            let max_seen = max_seen_clone.clone();
            async move {
                let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                concurrent.fetch_sub(1, Ordering::SeqCst);
                Ok(serde_json::json!(null))
            }
        })
        .await;

        assert!(max_seen.load(Ordering::SeqCst) <= 5);
        assert_eq!(summary.total, 20);
        assert_eq!(summary.succeeded, 20);
    }
}
