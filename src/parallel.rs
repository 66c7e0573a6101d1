//! Optional data parallelism over index ranges.
//!
//! With the `parallel` feature a dedicated rayon pool of the requested size runs the work;
//! without it, or for a single thread, work runs inline on the caller.

#[cfg(feature = "parallel")]
use rayon::prelude::*;
#[cfg(feature = "parallel")]
use tracing::warn;

#[derive(Debug, Default)]
pub(crate) struct WorkerPool {
    #[cfg(feature = "parallel")]
    pool: Option<rayon::ThreadPool>,
}

impl WorkerPool {
    pub(crate) fn new(num_threads: usize) -> Self {
        #[cfg(feature = "parallel")]
        {
            let pool = if num_threads > 1 {
                rayon::ThreadPoolBuilder::new()
                    .num_threads(num_threads)
                    .build()
                    .map_err(|e| warn!("Falling back to a single thread: {}", e))
                    .ok()
            } else {
                None
            };
            Self { pool }
        }
        #[cfg(not(feature = "parallel"))]
        {
            let _ = num_threads;
            Self {}
        }
    }

    pub(crate) fn num_threads(&self) -> usize {
        #[cfg(feature = "parallel")]
        if let Some(pool) = &self.pool {
            return pool.current_num_threads();
        }
        1
    }

    /// `f(i)` for every `i` in `0..n`, collected in index order.
    pub(crate) fn map_indices<R, F>(&self, n: usize, f: F) -> Vec<R>
    where
        R: Send,
        F: Fn(usize) -> R + Sync + Send,
    {
        #[cfg(feature = "parallel")]
        if let Some(pool) = &self.pool {
            return pool.install(|| (0..n).into_par_iter().map(&f).collect());
        }
        (0..n).map(f).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_results_keep_index_order() {
        for threads in [1, 3] {
            let pool = WorkerPool::new(threads);
            let squares = pool.map_indices(50, |i| i * i);
            assert_eq!(squares, (0..50).map(|i| i * i).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_single_thread_runs_inline() {
        assert_eq!(WorkerPool::new(1).num_threads(), 1);
        assert_eq!(WorkerPool::new(0).num_threads(), 1);
    }

    #[cfg(feature = "parallel")]
    #[test]
    fn test_pool_uses_requested_threads() {
        assert_eq!(WorkerPool::new(3).num_threads(), 3);
    }
}
