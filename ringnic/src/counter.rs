//! Sharded per-device counters.
//!
//! A [`CounterGroup`] packs up to 16 counters into one cache line per shard.
//! Each channel poller writes to its own shard, so the hot receive and
//! transmit paths of different channels never contend on a counter. Groups
//! are owned by a device rather than being process statics, so two adapters
//! in one process keep separate books.
//!
//! [`Counter`] names one slot of a group and implements [`metriken::Metric`]
//! so an embedder can register it with its exposition layer.

use std::cell::Cell;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

const CACHE_LINE: usize = 128;
pub(crate) const SLOTS: usize = CACHE_LINE / 8;
const NUM_SHARDS: usize = 64;

thread_local! {
    /// Shard for the current thread, set by `set_thread_shard()`.
    static SHARD_ID: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Set the shard used by the current thread.
///
/// Channel pollers call this with their channel index.
pub fn set_thread_shard(id: usize) {
    SHARD_ID.set(Some(id % NUM_SHARDS));
}

#[repr(C, align(128))]
struct Shard {
    slots: [AtomicU64; SLOTS],
}

/// Sharded storage for up to 16 counters.
pub struct CounterGroup {
    shards: Box<[Shard]>,
}

impl CounterGroup {
    pub fn new() -> Self {
        let shards = (0..NUM_SHARDS)
            .map(|_| Shard {
                slots: std::array::from_fn(|_| AtomicU64::new(0)),
            })
            .collect();
        Self { shards }
    }

    #[inline]
    fn add(&self, slot: usize, value: u64) {
        debug_assert!(slot < SLOTS, "slot index out of bounds");
        self.shards[shard_index()].slots[slot].fetch_add(value, Ordering::Relaxed);
    }

    fn value(&self, slot: usize) -> u64 {
        debug_assert!(slot < SLOTS, "slot index out of bounds");
        self.shards
            .iter()
            .map(|s| s.slots[slot].load(Ordering::Relaxed))
            .sum()
    }
}

impl Default for CounterGroup {
    fn default() -> Self {
        Self::new()
    }
}

/// One slot of a shared [`CounterGroup`].
#[derive(Clone)]
pub struct Counter {
    group: Arc<CounterGroup>,
    slot: usize,
}

impl Counter {
    /// # Panics
    ///
    /// Debug builds panic if `slot >= 16`.
    pub fn new(group: &Arc<CounterGroup>, slot: usize) -> Self {
        debug_assert!(slot < SLOTS, "slot index out of bounds");
        Self {
            group: Arc::clone(group),
            slot,
        }
    }

    #[inline]
    pub fn increment(&self) {
        self.group.add(self.slot, 1);
    }

    #[inline]
    pub fn add(&self, value: u64) {
        if value != 0 {
            self.group.add(self.slot, value);
        }
    }

    /// Current value, summed across all shards.
    pub fn value(&self) -> u64 {
        self.group.value(self.slot)
    }
}

impl std::fmt::Debug for Counter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Counter")
            .field("slot", &self.slot)
            .field("value", &self.value())
            .finish()
    }
}

impl metriken::Metric for Counter {
    fn as_any(&self) -> Option<&dyn std::any::Any> {
        Some(self)
    }

    fn value(&self) -> Option<metriken::Value<'_>> {
        Some(metriken::Value::Counter(Counter::value(self)))
    }
}

/// Shard index for the current thread. Threads that never called
/// `set_thread_shard()` hash the address of a thread-local instead.
#[inline]
fn shard_index() -> usize {
    SHARD_ID.get().unwrap_or_else(|| {
        thread_local! {
            static ID: u8 = const { 0 };
        }
        ID.with(|x| x as *const u8 as usize) % NUM_SHARDS
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_counter() {
        let group = Arc::new(CounterGroup::new());
        let counter = Counter::new(&group, 0);

        assert_eq!(counter.value(), 0);
        counter.increment();
        assert_eq!(counter.value(), 1);
        counter.add(10);
        assert_eq!(counter.value(), 11);
    }

    #[test]
    fn groups_are_independent() {
        let a = Counter::new(&Arc::new(CounterGroup::new()), 0);
        let b = Counter::new(&Arc::new(CounterGroup::new()), 0);

        a.add(3);
        b.increment();

        assert_eq!(a.value(), 3);
        assert_eq!(b.value(), 1);
    }

    #[test]
    fn sharded_across_threads() {
        use std::thread;

        let group = Arc::new(CounterGroup::new());
        let counter = Counter::new(&group, 2);
        let iterations = 1000;

        let handles: Vec<_> = (0..4)
            .map(|shard| {
                let c = counter.clone();
                thread::spawn(move || {
                    set_thread_shard(shard);
                    for _ in 0..iterations {
                        c.increment();
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(counter.value(), iterations * 4);
    }

    #[test]
    fn metriken_trait() {
        use metriken::Metric;

        let group = Arc::new(CounterGroup::new());
        let counter = Counter::new(&group, 3);
        counter.add(42);

        let value = Metric::value(&counter);
        assert!(matches!(value, Some(metriken::Value::Counter(42))));
    }
}
