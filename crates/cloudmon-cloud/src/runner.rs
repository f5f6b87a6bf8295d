use futures::future::join_all;
use std::future::Future;
use tokio::sync::Semaphore;

/// Map `items` through `task` with at most `concurrency` tasks in flight.
///
/// `results[i]` always corresponds to `items[i]`, whatever order the tasks
/// finish in. A `concurrency` of zero is treated as one.
pub async fn map_with_concurrency<T, R, F, Fut>(
    items: Vec<T>,
    concurrency: usize,
    task: F,
) -> Vec<R>
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = R>,
{
    let semaphore = Semaphore::new(concurrency.max(1));
    let semaphore = &semaphore;
    let task = &task;

    join_all(items.into_iter().map(|item| async move {
        // The semaphore is never closed, so acquire cannot fail.
        let _permit = semaphore.acquire().await.ok();
        task(item).await
    }))
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn should_keep_input_order_when_later_items_finish_first() {
        let delays = vec![("a", 30u64), ("b", 5), ("c", 10)];
        let results = map_with_concurrency(delays, 2, |(name, ms)| async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            format!("result-{name}")
        })
        .await;

        assert_eq!(results, vec!["result-a", "result-b", "result-c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn should_never_exceed_concurrency_limit() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let results = map_with_concurrency((0..20).collect(), 3, |i: u64| {
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10 + (i % 4))).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                i * 2
            }
        })
        .await;

        assert_eq!(results, (0..20).map(|i| i * 2).collect::<Vec<_>>());
        assert_eq!(peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn should_return_empty_for_empty_input() {
        let results: Vec<u8> = map_with_concurrency(Vec::<u8>::new(), 4, |x| async move { x }).await;
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn should_treat_zero_concurrency_as_one() {
        let results = map_with_concurrency(vec![1, 2, 3], 0, |x| async move { x + 1 }).await;
        assert_eq!(results, vec![2, 3, 4]);
    }
}
