use std::mem;

use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

use crate::config::BatchConfig;

/// Coalesces bursts of outbound items into one delivery
///
/// Items are buffered with [`Batcher::add`]; [`Batcher::drained`] resolves
/// on the first interval tick that finds the buffer non-empty and hands
/// back everything buffered so far. Dropping the batcher cancels its
/// interval and discards whatever was not drained.
pub struct Batcher<T> {
    buffer: Vec<T>,
    interval: Interval,
    max_size: Option<usize>,
}

impl<T> Batcher<T> {
    pub fn new(config: &BatchConfig) -> Self {
        let period = config.interval.max(std::time::Duration::from_millis(1));
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            buffer: Vec::new(),
            interval,
            max_size: config.max_size,
        }
    }

    /// Add an item to the buffer
    #[inline]
    pub fn add(&mut self, item: T) {
        self.buffer.push(item);
    }

    /// Add several items to the buffer
    pub fn extend(&mut self, items: impl IntoIterator<Item = T>) {
        self.buffer.extend(items);
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn buffered(&self) -> &[T] {
        &self.buffer
    }

    /// Wait for the next drain.
    ///
    /// Cancel safe: nothing is taken from the buffer unless the future
    /// completes.
    pub async fn drained(&mut self) -> Vec<T> {
        loop {
            if self.is_full() {
                return self.take();
            }
            self.interval.tick().await;
            if !self.buffer.is_empty() {
                return self.take();
            }
        }
    }

    fn is_full(&self) -> bool {
        matches!(self.max_size, Some(max) if self.buffer.len() >= max)
    }

    fn take(&mut self) -> Vec<T> {
        mem::take(&mut self.buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config(interval_ms: u64, max_size: Option<usize>) -> BatchConfig {
        BatchConfig {
            interval: Duration::from_millis(interval_ms),
            max_size,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn coalesces_adds_within_one_window() {
        let mut batcher = Batcher::new(&config(200, None));
        let start = Instant::now();
        batcher.add("x");
        batcher.add("y");

        assert_eq!(batcher.drained().await, vec!["x", "y"]);
        assert_eq!(start.elapsed(), Duration::from_millis(200));
        assert!(batcher.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn empty_ticks_do_not_drain() {
        let mut batcher: Batcher<&str> = Batcher::new(&config(200, None));
        let waited = tokio::time::timeout(Duration::from_millis(1000), batcher.drained()).await;
        assert!(waited.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn items_added_after_a_drain_go_to_the_next_batch() {
        let mut batcher = Batcher::new(&config(100, None));
        batcher.extend(["a", "b"]);
        assert_eq!(batcher.drained().await, vec!["a", "b"]);

        batcher.add("c");
        let start = Instant::now();
        assert_eq!(batcher.drained().await, vec!["c"]);
        assert_eq!(start.elapsed(), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn full_buffer_drains_immediately() {
        let mut batcher = Batcher::new(&config(200, Some(2)));
        batcher.extend([1, 2, 3]);
        let start = Instant::now();
        assert_eq!(batcher.drained().await, vec![1, 2, 3]);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }
}
