use std::ops::Range;

use anyhow::{Context, Result};
use rayon::prelude::*;
use rayon::ThreadPool;

/// Number of records (or SAM lines) held in memory per batch.
pub const BATCH_SIZE: usize = 1 << 18;

/// Resolves a requested thread count; 0 means every available core.
pub fn effective_threads(requested: usize) -> usize {
    if requested == 0 {
        num_cpus::get()
    } else {
        requested
    }
}

pub fn build_pool(threads: usize) -> Result<ThreadPool> {
    let threads = effective_threads(threads);
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build()
        .with_context(|| format!("failed to start {} worker threads", threads))
}

/// Splits `0..len` into `workers` contiguous ranges. Worker `k` gets
/// `len*k/w .. len*(k+1)/w`; trailing ranges may be empty.
pub fn partition(len: usize, workers: usize) -> Vec<Range<usize>> {
    let workers = workers.max(1);
    (0..workers)
        .map(|k| len * k / workers..len * (k + 1) / workers)
        .collect()
}

/// Runs `work` over the partitions of a batch of `len` items on `pool`
/// and returns the per-worker results in partition order. All workers
/// have finished when this returns.
pub fn run_partitioned<T, F>(pool: &ThreadPool, len: usize, work: F) -> Vec<T>
where
    T: Send,
    F: Fn(Range<usize>) -> T + Sync,
{
    let ranges = partition(len, pool.current_num_threads());
    pool.install(|| ranges.into_par_iter().map(&work).collect())
}

/// Like [`run_partitioned`], but hands each worker its own mutable slice
/// of `items` together with the slice's offset in the batch.
pub fn run_chunks<T, R, F>(pool: &ThreadPool, items: &mut [T], work: F) -> Vec<R>
where
    T: Send,
    R: Send,
    F: Fn(usize, &mut [T]) -> R + Sync,
{
    let mut chunks = Vec::with_capacity(pool.current_num_threads());
    let mut rest = items;
    for range in partition(rest.len(), pool.current_num_threads()) {
        let (chunk, tail) = std::mem::take(&mut rest).split_at_mut(range.len());
        chunks.push((range.start, chunk));
        rest = tail;
    }
    pool.install(|| {
        chunks
            .into_par_iter()
            .map(|(offset, chunk)| work(offset, chunk))
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_covers_everything_once() {
        for (len, workers) in [(10, 3), (0, 4), (3, 8), (1 << 18, 7)] {
            let ranges = partition(len, workers);
            assert_eq!(ranges.len(), workers);
            assert_eq!(ranges[0].start, 0);
            assert_eq!(ranges[workers - 1].end, len);
            for pair in ranges.windows(2) {
                assert_eq!(pair[0].end, pair[1].start);
            }
        }
    }

    #[test]
    fn test_partition_bounds() {
        assert_eq!(partition(10, 3), vec![0..3, 3..6, 6..10]);
        assert_eq!(partition(5, 0), vec![0..5]);
    }

    #[test]
    fn test_results_in_partition_order() {
        let pool = build_pool(4).unwrap();
        let items: Vec<u64> = (0..1000).collect();
        let sums = run_partitioned(&pool, items.len(), |range| {
            (range.start, items[range].iter().sum::<u64>())
        });
        assert_eq!(sums.len(), 4);
        assert!(sums.windows(2).all(|w| w[0].0 <= w[1].0));
        assert_eq!(sums.iter().map(|(_, s)| s).sum::<u64>(), 999 * 1000 / 2);
    }

    #[test]
    fn test_chunks_are_disjoint_and_ordered() {
        let pool = build_pool(3).unwrap();
        let mut items = vec![0usize; 10];
        let offsets = run_chunks(&pool, &mut items, |offset, chunk| {
            for (i, item) in chunk.iter_mut().enumerate() {
                *item = offset + i;
            }
            offset
        });
        assert_eq!(offsets, vec![0, 3, 6]);
        assert_eq!(items, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_zero_threads_means_all_cores() {
        assert_eq!(effective_threads(0), num_cpus::get());
        assert_eq!(effective_threads(3), 3);
    }
}
