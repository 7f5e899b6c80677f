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

//! Deferred action queue
//!
//! Cleanup that must wait until no running transaction can observe the
//! objects it touches is registered here together with a tag timestamp. An
//! action tagged `T` runs only once the watermark is strictly greater than
//! `T`, meaning every transaction that started at or before `T` has finished.
//!
//! Producers enqueue through a lock-free channel from any thread. A single
//! consumer (the garbage collector) drains the channel into a backlog ordered
//! by tag, FIFO within a tag, and runs the ready prefix outside of any latch so
//! that actions may register further actions.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crossbeam_channel::{Receiver, Sender};
use epochdb_common::Timestamp;
use parking_lot::Mutex;
use tracing::trace;

use crate::transaction::timestamp_manager::TimestampManager;

/// A cleanup callback. It receives the watermark it runs under.
pub type DeferredAction = Box<dyn FnOnce(Timestamp) + Send + 'static>;

/// Queue of actions waiting for the watermark to pass their tag
pub struct DeferredActionManager {
    timestamp_manager: Arc<TimestampManager>,
    sender: Sender<(Timestamp, DeferredAction)>,
    receiver: Receiver<(Timestamp, DeferredAction)>,
    backlog: Mutex<BTreeMap<Timestamp, VecDeque<DeferredAction>>>,
    pending: AtomicUsize,
    processed_total: AtomicU64,
}

impl DeferredActionManager {
    pub fn new(timestamp_manager: Arc<TimestampManager>) -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        Self {
            timestamp_manager,
            sender,
            receiver,
            backlog: Mutex::new(BTreeMap::new()),
            pending: AtomicUsize::new(0),
            processed_total: AtomicU64::new(0),
        }
    }

    /// Enqueue `action` to run once the watermark passes `tag`. Never runs it inline.
    pub fn register_deferred_action<F>(&self, tag: Timestamp, action: F)
    where
        F: FnOnce(Timestamp) + Send + 'static,
    {
        self.pending.fetch_add(1, Ordering::SeqCst);
        trace!(%tag, "deferred action registered");
        // The receiver lives as long as self, so the channel is never disconnected here.
        if self.sender.send((tag, Box::new(action))).is_err() {
            unreachable!("deferred action channel disconnected");
        }
    }

    /// Enqueue `action` to run once every transaction running now has finished.
    /// Returns the tag it was registered with.
    pub fn register_deferred_action_now<F>(&self, action: F) -> Timestamp
    where
        F: FnOnce(Timestamp) + Send + 'static,
    {
        let tag = self.timestamp_manager.last_issued();
        self.register_deferred_action(tag, action);
        tag
    }

    /// Run every queued action whose tag is below `watermark`, in tag order
    /// and registration order within a tag. Returns the number executed.
    ///
    /// Must only be called from one consumer at a time.
    pub fn process(&self, watermark: Timestamp) -> usize {
        let ready = {
            let mut backlog = self.backlog.lock();
            for (tag, action) in self.receiver.try_iter() {
                backlog.entry(tag).or_default().push_back(action);
            }
            let not_ready = backlog.split_off(&watermark);
            std::mem::replace(&mut *backlog, not_ready)
        };

        let mut executed = 0;
        for (_, actions) in ready {
            for action in actions {
                action(watermark);
                executed += 1;
            }
        }

        if executed > 0 {
            self.pending.fetch_sub(executed, Ordering::SeqCst);
            self.processed_total.fetch_add(executed as u64, Ordering::Relaxed);
            trace!(executed, %watermark, "deferred actions processed");
        }
        executed
    }

    /// Process with the current watermark
    pub fn process_ready(&self) -> usize {
        let watermark = self.timestamp_manager.oldest_active_timestamp();
        self.process(watermark)
    }

    /// Number of registered actions that have not run yet
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Number of actions executed since creation
    pub fn processed_total(&self) -> u64 {
        self.processed_total.load(Ordering::Relaxed)
    }

    pub fn timestamp_manager(&self) -> &Arc<TimestampManager> {
        &self.timestamp_manager
    }
}
