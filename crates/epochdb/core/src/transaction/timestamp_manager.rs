// Dotlanth
// Copyright (C) 2025 Synerthink

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Timestamp authority
//!
//! Issues transaction timestamps from a single atomic counter and tracks the
//! start timestamps of running transactions. The lowest registered start
//! timestamp (or the current time when nothing is registered) is the
//! watermark that bounds reclamation.
//!
//! The active set is split into shards, each behind its own narrow latch. A
//! check-out issues its timestamp while holding its shard latch, and a
//! watermark scan reads the clock before visiting the shards, so a scan can
//! never miss a transaction whose start timestamp is below the clock value it
//! read.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use epochdb_common::Timestamp;
use parking_lot::Mutex;

/// Default number of active-set shards
pub const DEFAULT_ACTIVE_SET_SHARDS: usize = 16;

/// A start timestamp registered in the active set
///
/// Handed back to [`TimestampManager::check_in_timestamp`] exactly once.
#[derive(Debug, PartialEq, Eq)]
pub struct ActiveTimestamp {
    timestamp: Timestamp,
    shard: usize,
}

impl ActiveTimestamp {
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }
}

/// Issues timestamps and tracks the oldest running transaction
pub struct TimestampManager {
    /// Next transaction timestamp to hand out
    time: AtomicU64,
    /// Counter for read-only transaction ids
    read_only_counter: AtomicU64,
    /// Multiset of registered start timestamps, sharded
    shards: Box<[Mutex<BTreeMap<u64, usize>>]>,
    next_shard: AtomicUsize,
    /// Highest watermark computed so far
    cached_oldest: AtomicU64,
}

impl TimestampManager {
    /// Create a timestamp manager whose first issued timestamp is 1
    pub fn new(shards: usize) -> Self {
        let shards = (0..shards.max(1)).map(|_| Mutex::new(BTreeMap::new())).collect::<Vec<_>>();
        Self {
            time: AtomicU64::new(1),
            read_only_counter: AtomicU64::new(0),
            shards: shards.into_boxed_slice(),
            next_shard: AtomicUsize::new(0),
            cached_oldest: AtomicU64::new(Timestamp::INITIAL.raw()),
        }
    }

    /// Issue a fresh transaction timestamp, strictly greater than every earlier one
    pub fn issue_timestamp(&self) -> Timestamp {
        let value = self.time.fetch_add(1, Ordering::SeqCst);
        debug_assert!(value <= Timestamp::MAX_REAL, "transaction timestamp space exhausted");
        Timestamp::new(value)
    }

    /// Issue a read-only transaction id without touching the transaction counter
    pub fn issue_read_only_id(&self) -> Timestamp {
        Timestamp::read_only(self.read_only_counter.fetch_add(1, Ordering::Relaxed))
    }

    /// The next timestamp that will be issued
    pub fn current_time(&self) -> Timestamp {
        Timestamp::new(self.time.load(Ordering::SeqCst))
    }

    /// The most recently issued timestamp
    pub fn last_issued(&self) -> Timestamp {
        self.current_time().prev()
    }

    /// Issue a start timestamp and register it as active
    pub fn check_out_timestamp(&self) -> ActiveTimestamp {
        self.register(|| self.issue_timestamp())
    }

    /// Register the current time as the snapshot of a read-only transaction.
    /// Does not consume a timestamp.
    pub fn check_out_snapshot(&self) -> ActiveTimestamp {
        self.register(|| self.current_time())
    }

    fn register(&self, timestamp: impl FnOnce() -> Timestamp) -> ActiveTimestamp {
        let shard = self.next_shard.fetch_add(1, Ordering::Relaxed) % self.shards.len();
        let mut set = self.shards[shard].lock();
        let timestamp = timestamp();
        *set.entry(timestamp.raw()).or_insert(0) += 1;
        ActiveTimestamp { timestamp, shard }
    }

    /// Remove a registration from the active set
    pub fn check_in_timestamp(&self, active: ActiveTimestamp) {
        let mut set = self.shards[active.shard].lock();
        match set.get_mut(&active.timestamp.raw()) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                set.remove(&active.timestamp.raw());
            }
            None => debug_assert!(false, "timestamp {} checked in twice", active.timestamp),
        }
    }

    /// Compute the watermark: the oldest registered start timestamp, or the
    /// current time when nothing is registered. Never lower than a value
    /// returned earlier.
    pub fn oldest_active_timestamp(&self) -> Timestamp {
        let mut oldest = self.time.load(Ordering::SeqCst);
        for shard in self.shards.iter() {
            if let Some((&timestamp, _)) = shard.lock().first_key_value() {
                oldest = oldest.min(timestamp);
            }
        }
        let previous = self.cached_oldest.fetch_max(oldest, Ordering::SeqCst);
        Timestamp::new(oldest.max(previous))
    }

    /// The last watermark computed, without scanning
    pub fn cached_oldest_active_timestamp(&self) -> Timestamp {
        Timestamp::new(self.cached_oldest.load(Ordering::SeqCst))
    }

    /// Number of registrations in the active set
    pub fn active_count(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().values().sum::<usize>()).sum()
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }
}

impl Default for TimestampManager {
    fn default() -> Self {
        Self::new(DEFAULT_ACTIVE_SET_SHARDS)
    }
}
