use std::future::Future;
use std::time::Duration;

use futures::future::join_all;
use tokio::time::sleep;
use tracing::debug;

pub const DEFAULT_CHUNK_SIZE: usize = 20;
pub const DEFAULT_INTER_CHUNK_DELAY: Duration = Duration::from_millis(1_500);

/// Splits work into fixed-size chunks: items inside a chunk run concurrently,
/// chunks run one after another with a pause in between.
#[derive(Debug, Clone, Copy)]
pub struct BatchScheduler {
    chunk_size: usize,
    inter_chunk_delay: Duration,
}

impl BatchScheduler {
    pub fn new(chunk_size: usize, inter_chunk_delay: Duration) -> Self {
        assert!(chunk_size > 0, "Chunk size must be positive");
        assert!(
            inter_chunk_delay <= Duration::from_secs(60),
            "Inter-chunk delay exceeds one minute"
        );
        Self {
            chunk_size,
            inter_chunk_delay,
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Runs `work` once per item. Results keep input order. `work` must turn
    /// its own failures into a value so one item cannot cancel its siblings.
    pub async fn run_chunked<T, R, F, Fut>(&self, items: &[T], work: F) -> Vec<R>
    where
        F: Fn(&T) -> Fut,
        Fut: Future<Output = R>,
    {
        self.run_chunked_with(items, |chunk| join_all(chunk.iter().map(&work)))
            .await
    }

    /// Runs `work` once per chunk. Each call must return one result per item
    /// of the chunk it was given.
    pub async fn run_chunked_with<T, R, F, Fut>(&self, items: &[T], work: F) -> Vec<R>
    where
        F: Fn(&[T]) -> Fut,
        Fut: Future<Output = Vec<R>>,
    {
        let mut results = Vec::with_capacity(items.len());
        let total_chunks = items.len().div_ceil(self.chunk_size);
        for (index, chunk) in items.chunks(self.chunk_size).enumerate() {
            if index > 0 && !self.inter_chunk_delay.is_zero() {
                sleep(self.inter_chunk_delay).await;
            }
            debug!(
                "Running chunk {}/{} with {} items",
                index + 1,
                total_chunks,
                chunk.len()
            );
            let chunk_results = work(chunk).await;
            assert_eq!(
                chunk_results.len(),
                chunk.len(),
                "Chunk work must yield one result per item"
            );
            results.extend(chunk_results);
        }
        results
    }
}

impl Default for BatchScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE, DEFAULT_INTER_CHUNK_DELAY)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::time::Instant;

    use super::*;

    #[tokio::test]
    async fn results_keep_input_order() {
        let scheduler = BatchScheduler::new(3, Duration::ZERO);
        let items: Vec<u64> = (0..10).collect();
        let results = scheduler
            .run_chunked(&items, |value| {
                let value = *value;
                async move {
                    // Later items finish first inside a chunk.
                    sleep(Duration::from_millis(10 - value)).await;
                    value * 2
                }
            })
            .await;
        assert_eq!(results, (0..10).map(|v| v * 2).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn failures_stay_isolated() {
        let scheduler = BatchScheduler::new(4, Duration::ZERO);
        let items = vec![1, 2, 3, 4, 5];
        let results: Vec<Result<i32, String>> = scheduler
            .run_chunked(&items, |value| {
                let value = *value;
                async move {
                    if value == 2 {
                        Err("provider down".to_string())
                    } else {
                        Ok(value)
                    }
                }
            })
            .await;
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 4);
        assert!(results[1].is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn delay_only_between_chunks() {
        let scheduler = BatchScheduler::new(2, Duration::from_secs(2));
        let items: Vec<u32> = (0..5).collect();
        let started = Instant::now();
        let chunks_seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&chunks_seen);
        let results = scheduler
            .run_chunked_with(&items, |chunk| {
                counter.fetch_add(1, Ordering::SeqCst);
                let owned = chunk.to_vec();
                async move { owned }
            })
            .await;
        assert_eq!(results, items);
        assert_eq!(chunks_seen.load(Ordering::SeqCst), 3);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(4));
        assert!(elapsed < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn empty_input_runs_nothing() {
        let scheduler = BatchScheduler::default();
        let items: Vec<u8> = Vec::new();
        let results = scheduler
            .run_chunked(&items, |v| {
                let v = *v;
                async move { v }
            })
            .await;
        assert!(results.is_empty());
    }
}
