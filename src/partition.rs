//! Worker Partitioner
//!
//! Splits the metric universe into contiguous slices, one per worker. Each
//! worker gets `ceil(T / N)` items; the last one takes whatever is left.
//! Workers whose slice would be empty are not spawned, so the number of
//! slices is at most `min(N, T)`.

use std::ops::Range;

/// Items per worker for `total` items across `workers` workers.
pub fn chunk_size(total: usize, workers: usize) -> usize {
    total.div_ceil(workers.max(1))
}

/// Index range owned by worker `index` (1-based, `1..=workers`).
///
/// Always a valid (possibly empty) range inside `0..total`.
pub fn assigned_range(index: usize, total: usize, workers: usize) -> Range<usize> {
    let workers = workers.max(1);
    let per = chunk_size(total, workers);
    let start = index.saturating_sub(1).saturating_mul(per).min(total);
    let end = if index >= workers {
        total
    } else {
        index.saturating_mul(per).min(total)
    };
    start..end.max(start)
}

/// Non-empty ranges for every worker that should actually run, in worker order.
pub fn partition(total: usize, workers: usize) -> Vec<Range<usize>> {
    let workers = workers.max(1);
    (1..=workers.min(total))
        .map(|i| assigned_range(i, total, workers))
        .filter(|r| !r.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_exact_cover(total: usize, workers: usize) {
        let ranges = partition(total, workers);
        assert!(ranges.len() <= workers.min(total), "T={} N={}", total, workers);

        let mut next = 0;
        for r in &ranges {
            assert_eq!(r.start, next, "gap or overlap at T={} N={}", total, workers);
            assert!(r.end > r.start);
            next = r.end;
        }
        assert_eq!(next, total, "T={} N={}", total, workers);
    }

    #[test]
    fn test_three_items_two_workers() {
        let universe = ["ns.a", "ns.b", "ns.c"];
        let ranges = partition(universe.len(), 2);

        assert_eq!(ranges, vec![0..2, 2..3]);
        assert_eq!(&universe[ranges[0].clone()], &["ns.a", "ns.b"]);
        assert_eq!(&universe[ranges[1].clone()], &["ns.c"]);
    }

    #[test]
    fn test_empty_universe_spawns_nothing() {
        assert!(partition(0, 4).is_empty());
    }

    #[test]
    fn test_more_workers_than_items() {
        assert_eq!(partition(3, 8), vec![0..1, 1..2, 2..3]);
    }

    #[test]
    fn test_last_worker_may_be_idle() {
        // ceil(5/4) = 2 -> 0..2, 2..4, 4..5, and nothing left for worker 4
        assert_eq!(partition(5, 4), vec![0..2, 2..4, 4..5]);
        assert!(assigned_range(4, 5, 4).is_empty());
    }

    #[test]
    fn test_last_worker_takes_remainder() {
        assert_eq!(partition(10, 4), vec![0..3, 3..6, 6..9, 9..10]);
    }

    #[test]
    fn test_deterministic() {
        assert_eq!(partition(1234, 7), partition(1234, 7));
    }

    #[test]
    fn test_exact_cover_small_grid() {
        for total in 0..40 {
            for workers in 1..12 {
                assert_exact_cover(total, workers);
            }
        }
    }

    #[test]
    fn test_exact_cover_random() {
        for _ in 0..500 {
            assert_exact_cover(fastrand::usize(0..100_000), fastrand::usize(1..256));
        }
    }
}
