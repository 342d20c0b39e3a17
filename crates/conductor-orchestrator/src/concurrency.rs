//! Concurrency harness (C7, §4.5): bounded fan-out with fail-fast sibling
//! cancellation and input-order result collection.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// A unit of fan-out work: given its child cancellation signal, produces `T`.
pub type HarnessTask<T> =
    Box<dyn FnOnce(CancellationToken) -> Pin<Box<dyn Future<Output = T> + Send>> + Send>;

#[derive(Debug, Clone)]
pub struct HarnessItem<T> {
    pub index: usize,
    pub output: T,
}

#[derive(Debug, Clone)]
pub struct HarnessOutcome<T> {
    /// Only started tasks, in input order by index (§4.5).
    pub results: Vec<HarnessItem<T>>,
    /// The lowest index among failures, if any (§4.5 invariant).
    pub first_failure_index: Option<usize>,
    /// True iff the parent signal (not fail-fast) caused cancellation.
    pub aborted: bool,
}

/// Launches at most `max_concurrency` tasks at a time. Each task's child
/// signal fires when either the parent signal fires or any sibling result
/// satisfies `is_failed`. Once a child signal has fired, no new tasks are
/// launched; already-started tasks are left to observe their own
/// cancellation and wind down.
pub async fn run_bounded<T, I>(
    tasks: Vec<HarnessTask<T>>,
    max_concurrency: usize,
    parent_signal: CancellationToken,
    is_failed: I,
) -> HarnessOutcome<T>
where
    T: Send + 'static,
    I: Fn(&T) -> bool,
{
    let max_concurrency = max_concurrency.max(1);
    let fail_fast_signal = CancellationToken::new();

    let mut pending: VecDeque<(usize, HarnessTask<T>)> =
        tasks.into_iter().enumerate().collect();
    let mut join_set: JoinSet<(usize, T)> = JoinSet::new();
    let mut collected: Vec<HarnessItem<T>> = Vec::new();
    let mut first_failure_index: Option<usize> = None;

    loop {
        let launching_blocked = parent_signal.is_cancelled() || fail_fast_signal.is_cancelled();
        while !launching_blocked && join_set.len() < max_concurrency {
            let Some((index, task)) = pending.pop_front() else {
                break;
            };
            let child_token = CancellationToken::new();
            let task_token = child_token.clone();
            let parent_watch = parent_signal.clone();
            let fail_fast_watch = fail_fast_signal.clone();
            join_set.spawn(async move {
                let fut = task(task_token);
                tokio::pin!(fut);
                loop {
                    tokio::select! {
                        output = &mut fut => return (index, output),
                        _ = parent_watch.cancelled(), if !child_token.is_cancelled() => {
                            child_token.cancel();
                        }
                        _ = fail_fast_watch.cancelled(), if !child_token.is_cancelled() => {
                            child_token.cancel();
                        }
                    }
                }
            });
        }

        if join_set.is_empty() {
            break;
        }

        if let Some(joined) = join_set.join_next().await {
            if let Ok((index, output)) = joined {
                if is_failed(&output) {
                    fail_fast_signal.cancel();
                    first_failure_index =
                        Some(first_failure_index.map_or(index, |existing| existing.min(index)));
                }
                collected.push(HarnessItem { index, output });
            }
        }
    }

    collected.sort_by_key(|item| item.index);
    HarnessOutcome {
        results: collected,
        first_failure_index,
        aborted: parent_signal.is_cancelled(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn task_of(index: usize, ok: bool, started: Arc<AtomicUsize>) -> HarnessTask<Result<usize, usize>> {
        Box::new(move |_child: CancellationToken| {
            started.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                if ok {
                    Ok(index)
                } else {
                    Err(index)
                }
            })
        })
    }

    #[tokio::test]
    async fn results_are_returned_in_input_order() {
        let started = Arc::new(AtomicUsize::new(0));
        let tasks = vec![
            task_of(0, true, started.clone()),
            task_of(1, true, started.clone()),
            task_of(2, true, started.clone()),
        ];
        let outcome = run_bounded(tasks, 8, CancellationToken::new(), |r: &Result<usize, usize>| r.is_err()).await;
        let indices: Vec<usize> = outcome.results.iter().map(|item| item.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(outcome.first_failure_index, None);
        assert!(!outcome.aborted);
    }

    #[tokio::test]
    async fn fail_fast_records_lowest_failure_index() {
        let started = Arc::new(AtomicUsize::new(0));
        let tasks = vec![
            task_of(0, false, started.clone()),
            task_of(1, false, started.clone()),
            task_of(2, true, started.clone()),
        ];
        let outcome = run_bounded(tasks, 8, CancellationToken::new(), |r: &Result<usize, usize>| r.is_err()).await;
        assert_eq!(outcome.first_failure_index, Some(0));
        assert!(outcome.results.len() <= 3);
    }

    #[tokio::test]
    async fn parent_cancellation_is_reported_as_aborted() {
        let parent = CancellationToken::new();
        parent.cancel();
        let started = Arc::new(AtomicUsize::new(0));
        let tasks = vec![task_of(0, true, started.clone())];
        let outcome = run_bounded(tasks, 8, parent, |r: &Result<usize, usize>| r.is_err()).await;
        assert!(outcome.aborted);
        assert!(outcome.results.is_empty());
    }

    #[tokio::test]
    async fn respects_max_concurrency_bound() {
        let max_seen = Arc::new(AtomicUsize::new(0));
        let current = Arc::new(AtomicUsize::new(0));
        let tasks: Vec<HarnessTask<Result<usize, usize>>> = (0..6usize)
            .map(|index| {
                let max_seen = max_seen.clone();
                let current = current.clone();
                Box::new(move |_child: CancellationToken| {
                    let max_seen = max_seen.clone();
                    let current = current.clone();
                    Box::pin(async move {
                        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                        current.fetch_sub(1, Ordering::SeqCst);
                        Ok(index)
                    }) as Pin<Box<dyn Future<Output = Result<usize, usize>> + Send>>
                }) as HarnessTask<Result<usize, usize>>
            })
            .collect();
        run_bounded(tasks, 2, CancellationToken::new(), |r: &Result<usize, usize>| r.is_err()).await;
        assert!(max_seen.load(Ordering::SeqCst) <= 2);
    }
}
