//! Bucketed expiry wheel.
//!
//! Buckets are keyed by tick number rather than by wall-clock deadline, so renewing an item's
//! deadline is a constant-time remove-from-old-bucket/insert-into-new-bucket pair instead of a
//! heap re-sift. The cost is up to one tick length of jitter on every expiration.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// A coarse-grained timer wheel over items of type `T`.
///
/// `T` is expected to be a cheap-to-clone handle (an `Arc<dyn Cnxn>`, in the factory) since the
/// same value is stored in both the wheel's bucket and the item's own "which bucket am I in"
/// lookup.
#[derive(Debug)]
pub struct ExpiryWheel<T> {
    tick_ms: u64,
    epoch: Instant,
    inner: Mutex<Inner<T>>,
}

#[derive(Debug)]
struct Inner<T> {
    buckets: BTreeMap<u64, Vec<T>>,
    deadlines: HashMap<T, u64>,
}

impl<T> ExpiryWheel<T>
where
    T: Eq + Hash + Clone,
{
    /// Creates a wheel with tick length `tick_ms`. This is normally `sessionlessCnxnTimeout`.
    pub fn new(tick_ms: u64) -> Self {
        assert!(tick_ms > 0, "expiry wheel tick length must be positive");
        Self {
            tick_ms,
            epoch: Instant::now(),
            inner: Mutex::new(Inner {
                buckets: BTreeMap::new(),
                deadlines: HashMap::new(),
            }),
        }
    }

    fn now_tick(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64 / self.tick_ms
    }

    /// Rounds `now + timeout_ms` up to the next tick boundary and (re)inserts `item` there,
    /// removing it from whatever bucket it previously occupied.
    pub fn update(&self, item: &T, timeout_ms: u64) {
        let target_ms = self.epoch.elapsed().as_millis() as u64 + timeout_ms;
        let ceil_tick = (target_ms + self.tick_ms - 1) / self.tick_ms;
        let tick = ceil_tick.max(self.now_tick() + 1);

        let mut inner = self.inner.lock().expect("expiry wheel mutex poisoned");
        if let Some(old_tick) = inner.deadlines.get(item).copied() {
            if let Some(bucket) = inner.buckets.get_mut(&old_tick) {
                bucket.retain(|i| i != item);
                if bucket.is_empty() {
                    inner.buckets.remove(&old_tick);
                }
            }
        }
        inner.buckets.entry(tick).or_default().push(item.clone());
        inner.deadlines.insert(item.clone(), tick);
    }

    /// Removes `item` from the wheel entirely. A no-op if it isn't present.
    pub fn remove(&self, item: &T) {
        let mut inner = self.inner.lock().expect("expiry wheel mutex poisoned");
        if let Some(tick) = inner.deadlines.remove(item) {
            if let Some(bucket) = inner.buckets.get_mut(&tick) {
                bucket.retain(|i| i != item);
                if bucket.is_empty() {
                    inner.buckets.remove(&tick);
                }
            }
        }
    }

    /// How long until the earliest bucket's deadline, or zero if it has already passed (ready to
    /// be drained with [`Self::poll`]).
    pub fn wait_time(&self) -> Duration {
        let inner = self.inner.lock().expect("expiry wheel mutex poisoned");
        match inner.buckets.keys().next() {
            None => Duration::from_millis(self.tick_ms),
            Some(&earliest) => {
                let now = self.now_tick();
                if earliest <= now {
                    Duration::ZERO
                } else {
                    Duration::from_millis((earliest - now) * self.tick_ms)
                }
            }
        }
    }

    /// If the earliest bucket's deadline has passed, detaches and returns every item in it.
    /// Otherwise returns an empty vector.
    pub fn poll(&self) -> Vec<T> {
        let now = self.now_tick();
        let mut inner = self.inner.lock().expect("expiry wheel mutex poisoned");

        let due: Vec<u64> = inner
            .buckets
            .range(..=now)
            .map(|(&tick, _)| tick)
            .collect();

        let mut drained = Vec::new();
        for tick in due {
            if let Some(items) = inner.buckets.remove(&tick) {
                for item in &items {
                    inner.deadlines.remove(item);
                }
                drained.extend(items);
            }
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn update_then_poll_after_tick_returns_item() {
        let wheel = ExpiryWheel::new(20);
        wheel.update(&1u64, 10);
        assert!(wheel.poll().is_empty());
        sleep(Duration::from_millis(45));
        assert_eq!(wheel.poll(), vec![1u64]);
    }

    #[test]
    fn renewal_moves_item_to_a_later_bucket() {
        let wheel = ExpiryWheel::new(20);
        wheel.update(&1u64, 10);
        sleep(Duration::from_millis(25));
        // renew before the first bucket would have fired
        wheel.update(&1u64, 200);
        assert!(wheel.poll().is_empty());
    }

    #[test]
    fn remove_takes_item_out_of_its_bucket() {
        let wheel = ExpiryWheel::new(10);
        wheel.update(&7u64, 5);
        wheel.remove(&7u64);
        sleep(Duration::from_millis(30));
        assert!(wheel.poll().is_empty());
    }

    #[test]
    fn wait_time_is_zero_once_due() {
        let wheel = ExpiryWheel::new(10);
        wheel.update(&1u64, 5);
        sleep(Duration::from_millis(30));
        assert_eq!(wheel.wait_time(), Duration::ZERO);
    }

    #[test]
    fn distinct_items_drain_together_in_the_same_bucket() {
        let wheel = ExpiryWheel::new(50);
        wheel.update(&1u64, 5);
        wheel.update(&2u64, 5);
        wheel.update(&3u64, 5);
        sleep(Duration::from_millis(80));
        let mut drained = wheel.poll();
        drained.sort_unstable();
        assert_eq!(drained, vec![1, 2, 3]);
    }
}
