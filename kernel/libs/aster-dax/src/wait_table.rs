// SPDX-License-Identifier: MPL-2.0

use spin::Once;

use crate::{
    config::DEFAULT_WAIT_TABLE_BITS,
    entry::DaxEntry,
    mapping::MappingId,
    prelude::*,
    util::hash_long,
    wait::{WaitQueue, Waiter},
};

/// The identity of one entry for waiting purposes.
///
/// The index of a PMD entry is aligned down to the PMD boundary, so waiters
/// and wakers that reach the entry through different base pages meet at the
/// same key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct EntryKey {
    mapping: MappingId,
    entry_start: u64,
}

impl EntryKey {
    pub(crate) fn new(mapping: MappingId, index: u64, entry: &DaxEntry) -> Self {
        let entry_start = if entry.is_pmd() {
            align_down(index, PG_PMD_NR)
        } else {
            index
        };
        Self {
            mapping,
            entry_start,
        }
    }
}

/// A fixed-size hash table of wait queues shared by many mappings.
///
/// Unrelated entries may hash to the same bucket; wake-ups only reach the
/// waiters whose [`EntryKey`] matches.
pub struct WaitTable {
    bits: u32,
    queues: Box<[WaitQueue<EntryKey>]>,
}

static GLOBAL_WAIT_TABLE: Once<Arc<WaitTable>> = Once::new();

impl WaitTable {
    /// Creates a table of `1 << bits` buckets.
    ///
    /// # Panics
    ///
    /// Panics if `bits` is not in `1..=20`.
    pub fn new(bits: u32) -> Self {
        assert!((1..=20).contains(&bits), "unreasonable wait table size");
        let queues = (0..1usize << bits).map(|_| WaitQueue::new()).collect();
        Self { bits, queues }
    }

    /// Returns the process-wide table used by mappings that are not given one.
    pub fn global() -> Arc<WaitTable> {
        GLOBAL_WAIT_TABLE
            .call_once(|| Arc::new(WaitTable::new(DEFAULT_WAIT_TABLE_BITS)))
            .clone()
    }

    /// Returns the number of buckets.
    pub fn nr_buckets(&self) -> usize {
        self.queues.len()
    }

    fn queue_for(&self, key: &EntryKey) -> &WaitQueue<EntryKey> {
        let hash = hash_long(key.mapping.as_u64() ^ key.entry_start, self.bits);
        &self.queues[hash]
    }

    /// Registers a waiter for the entry and returns it.
    ///
    /// The caller must hold the structural lock of the mapping while calling
    /// this, and release it before waiting on the returned [`Waiter`].
    pub(crate) fn prepare_wait(
        &self,
        mapping: MappingId,
        index: u64,
        entry: &DaxEntry,
        exclusive: bool,
    ) -> Waiter {
        let key = EntryKey::new(mapping, index, entry);
        let (waiter, waker) = Waiter::new_pair();
        self.queue_for(&key).enqueue(key, waker, exclusive);
        waiter
    }

    /// Wakes the waiters of the entry; see [`WaitQueue::wake`].
    pub(crate) fn wake(&self, mapping: MappingId, index: u64, entry: &DaxEntry, wake_all: bool) -> usize {
        let key = EntryKey::new(mapping, index, entry);
        self.queue_for(&key).wake(&key, wake_all)
    }
}

impl Debug for WaitTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitTable")
            .field("nr_buckets", &self.nr_buckets())
            .finish()
    }
}
