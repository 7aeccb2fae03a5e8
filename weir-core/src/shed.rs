//! Staged shedding of streaming connections.
//!
//! Destroying every streaming connection at the same instant produces a
//! reconnect stampede against whatever the clients fail over to. The
//! shedder spreads the destruction over a bounded window instead: at most
//! [`MAX_BATCHES`] batches, one per tick of `window / MAX_BATCHES`, with
//! the first batch fired immediately.

use std::{sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::conn::{ConnControl, ConnKey};

/// Upper bound on the number of destroy batches in one shed run.
const MAX_BATCHES: usize = 16;

/// Partition of a set of connections over a shed window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ShedPlan {
    sizes: Vec<usize>,
    tick: Duration,
}

impl ShedPlan {
    /// Plan the staged destruction of `n` connections over `window`.
    ///
    /// Returns `None` when there is nothing to shed or no window to spread
    /// it over; with a zero window the caller destroys the whole set
    /// immediately instead of scheduling anything.
    pub(crate) fn new(n: usize, window: Duration) -> Option<Self> {
        if n == 0 || window.is_zero() {
            return None;
        }
        Some(Self {
            sizes: batch_sizes(n),
            tick: window / MAX_BATCHES as u32,
        })
    }

    #[cfg(test)]
    pub(crate) fn tick(&self) -> Duration {
        self.tick
    }

    #[cfg(test)]
    pub(crate) fn sizes(&self) -> &[usize] {
        &self.sizes
    }
}

/// Batch sizes for `n` connections: every batch takes `n / MAX_BATCHES`
/// (at least one), the final batch takes whatever remains. With `n` below
/// [`MAX_BATCHES`] the run simply completes early.
fn batch_sizes(n: usize) -> Vec<usize> {
    if n <= MAX_BATCHES {
        return vec![1; n];
    }
    let per = n / MAX_BATCHES;
    let mut sizes = vec![per; MAX_BATCHES - 1];
    sizes.push(n - per * (MAX_BATCHES - 1));
    sizes
}

/// Destroy the planned keys batch by batch.
///
/// `lookup` resolves a key to its live handle at destruction time; a key
/// whose connection already closed naturally resolves to `None` and is
/// skipped. The run aborts at the next batch boundary once `cancel` fires.
pub(crate) async fn run<L>(
    keys: Vec<ConnKey>,
    plan: ShedPlan,
    cancel: CancellationToken,
    mut lookup: L,
) where
    L: FnMut(ConnKey) -> Option<Arc<dyn ConnControl>>,
{
    let mut rest = keys.as_slice();
    for (batch_nr, &size) in plan.sizes.iter().enumerate() {
        if batch_nr > 0 {
            tokio::select! {
                _ = cancel.cancelled() => {
                    trace!(remaining = rest.len(), "shed run cancelled");
                    return;
                }
                _ = tokio::time::sleep(plan.tick) => {}
            }
        }

        let (batch, tail) = rest.split_at(size.min(rest.len()));
        rest = tail;

        let mut destroyed = 0usize;
        for &key in batch {
            if let Some(conn) = lookup(key) {
                conn.destroy();
                destroyed += 1;
            }
        }
        debug!(
            batch = batch_nr,
            planned = batch.len(),
            destroyed,
            "shed batch done"
        );

        if rest.is_empty() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::ExchangeState;

    struct NoopConn;

    impl ConnControl for NoopConn {
        fn exchange_state(&self) -> ExchangeState {
            ExchangeState::None
        }

        fn mark_last(&self) {}

        fn destroy(&self) {}
    }

    fn keys(n: u16) -> Vec<ConnKey> {
        (0..n)
            .map(|i| ConnKey::new(([127, 0, 0, 1], 9000 + i).into()))
            .collect()
    }

    #[test]
    fn small_sets_get_one_per_batch() {
        assert_eq!(vec![1; 5], batch_sizes(5));
        assert_eq!(vec![1; 16], batch_sizes(16));
    }

    #[test]
    fn large_sets_put_the_remainder_in_the_final_batch() {
        let sizes = batch_sizes(100);
        assert_eq!(16, sizes.len());
        assert_eq!(vec![6; 15], sizes[..15].to_vec());
        assert_eq!(10, sizes[15]);

        let sizes = batch_sizes(17);
        assert_eq!(16, sizes.len());
        assert_eq!(2, sizes[15]);
    }

    #[test]
    fn batch_sizes_preserve_the_total() {
        for n in [1, 2, 15, 16, 17, 31, 64, 1000] {
            let sizes = batch_sizes(n);
            assert!(sizes.len() <= MAX_BATCHES, "n = {n}");
            assert_eq!(n, sizes.iter().sum::<usize>(), "n = {n}");
        }
    }

    #[test]
    fn plan_is_skipped_without_work_or_window() {
        assert!(ShedPlan::new(0, Duration::from_secs(4)).is_none());
        assert!(ShedPlan::new(12, Duration::ZERO).is_none());

        let plan = ShedPlan::new(32, Duration::from_secs(16)).unwrap();
        assert_eq!(Duration::from_secs(1), plan.tick());
        assert_eq!(16, plan.sizes().len());
    }

    #[tokio::test(start_paused = true)]
    async fn run_spreads_batches_over_the_window() {
        let keys = keys(16);
        let window = Duration::from_secs(16);
        let plan = ShedPlan::new(keys.len(), window).unwrap();

        let start = tokio::time::Instant::now();
        let mut destroyed_at = Vec::new();
        run(keys, plan, CancellationToken::new(), |_key| {
            destroyed_at.push(start.elapsed());
            Some(Arc::new(NoopConn) as Arc<dyn ConnControl>)
        })
        .await;

        assert_eq!(16, destroyed_at.len());
        assert_eq!(Duration::ZERO, destroyed_at[0], "first batch is immediate");
        let last = *destroyed_at.last().unwrap();
        assert!(last >= window * 15 / 16, "last batch fired at {last:?}");
        assert!(last <= window, "last batch fired at {last:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn run_completes_early_for_small_sets() {
        let keys = keys(4);
        let window = Duration::from_secs(16);
        let plan = ShedPlan::new(keys.len(), window).unwrap();

        let start = tokio::time::Instant::now();
        let mut count = 0usize;
        run(keys, plan, CancellationToken::new(), |_key| {
            count += 1;
            Some(Arc::new(NoopConn) as Arc<dyn ConnControl>)
        })
        .await;

        assert_eq!(4, count);
        assert_eq!(window * 3 / 16, start.elapsed());
    }

    #[tokio::test(start_paused = true)]
    async fn run_skips_keys_that_closed_naturally() {
        let keys = keys(3);
        let gone = keys[1];
        let plan = ShedPlan::new(keys.len(), Duration::from_secs(8)).unwrap();

        let mut destroyed = Vec::new();
        run(keys, plan, CancellationToken::new(), |key| {
            if key == gone {
                None
            } else {
                destroyed.push(key);
                Some(Arc::new(NoopConn) as Arc<dyn ConnControl>)
            }
        })
        .await;

        assert_eq!(2, destroyed.len());
        assert!(!destroyed.contains(&gone));
    }

    #[tokio::test(start_paused = true)]
    async fn run_aborts_on_cancellation() {
        let keys = keys(20);
        let plan = ShedPlan::new(keys.len(), Duration::from_secs(16)).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut count = 0usize;
        run(keys, plan, cancel, |_key| {
            count += 1;
            Some(Arc::new(NoopConn) as Arc<dyn ConnControl>)
        })
        .await;

        // the immediate batch still goes out; every later one is cancelled
        assert_eq!(1, count);
    }
}
