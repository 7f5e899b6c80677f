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

// Garbage collector
// Each pass computes the watermark, runs the deferred actions it unblocks and
// frees finished transaction contexts the watermark has passed.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use epochdb_common::Timestamp;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::transaction::context::TransactionContext;
use crate::transaction::deferred_action::DeferredActionManager;
use crate::transaction::manager::TransactionManager;
use crate::transaction::timestamp_manager::TimestampManager;

/// Outcome of one or more collection passes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GcPassStats {
    /// Watermark the (last) pass ran under
    pub watermark: Timestamp,
    pub actions_processed: usize,
    pub txns_deallocated: usize,
    /// Finished contexts the watermark has not passed yet
    pub txns_retained: usize,
}

impl GcPassStats {
    fn made_progress(&self) -> bool {
        self.actions_processed > 0 || self.txns_deallocated > 0
    }

    pub(crate) fn accumulate(&mut self, pass: GcPassStats) {
        self.watermark = pass.watermark;
        self.actions_processed += pass.actions_processed;
        self.txns_deallocated += pass.txns_deallocated;
        self.txns_retained = pass.txns_retained;
    }
}

/// Running totals over every pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GcTotals {
    pub passes: u64,
    pub actions_processed: u64,
    pub txns_deallocated: u64,
}

struct GcState {
    last_watermark: Timestamp,
    totals: GcTotals,
}

const DRAIN_BACKOFF: Duration = Duration::from_millis(1);

/// Reclaims deferred work and finished transactions behind the watermark
pub struct GarbageCollector {
    timestamp_manager: Arc<TimestampManager>,
    deferred_actions: Arc<DeferredActionManager>,
    txn_manager: Arc<TransactionManager>,
    /// Held for the duration of a pass; passes never overlap
    state: Mutex<GcState>,
}

impl GarbageCollector {
    pub fn new(txn_manager: Arc<TransactionManager>) -> Self {
        Self {
            timestamp_manager: txn_manager.timestamp_manager().clone(),
            deferred_actions: txn_manager.deferred_actions().clone(),
            txn_manager,
            state: Mutex::new(GcState {
                last_watermark: Timestamp::INITIAL,
                totals: GcTotals::default(),
            }),
        }
    }

    /// Run a single collection pass
    ///
    /// Steps:
    /// 1. Compute the watermark.
    /// 2. Run every deferred action tagged below it.
    /// 3. Free finished contexts whose finish timestamp it has passed; requeue the rest.
    pub fn perform_gc(&self) -> GcPassStats {
        let mut state = self.state.lock();

        let watermark = self.timestamp_manager.oldest_active_timestamp();
        debug_assert!(watermark >= state.last_watermark, "watermark moved backwards: {} < {}", watermark, state.last_watermark);
        state.last_watermark = watermark;

        let actions_processed = self.deferred_actions.process(watermark);

        let (reclaimable, retained): (Vec<_>, Vec<_>) = self.txn_manager.take_finished().into_iter().partition(|ctx| is_reclaimable(ctx, watermark));
        let txns_deallocated = reclaimable.len();
        let txns_retained = retained.len();
        drop(reclaimable);
        self.txn_manager.requeue_finished(retained);

        state.totals.passes += 1;
        state.totals.actions_processed += actions_processed as u64;
        state.totals.txns_deallocated += txns_deallocated as u64;

        let stats = GcPassStats {
            watermark,
            actions_processed,
            txns_deallocated,
            txns_retained,
        };
        if stats.made_progress() {
            debug!(%watermark, actions_processed, txns_deallocated, txns_retained, "gc pass");
        }
        stats
    }

    /// Run passes until one makes no progress. Returns the accumulated counts.
    ///
    /// Stops early while a running transaction holds the watermark back; see
    /// [`GarbageCollector::drain`] for the blocking variant.
    pub fn fully_perform_gc(&self) -> GcPassStats {
        let mut total = GcPassStats::default();
        loop {
            let pass = self.perform_gc();
            total.accumulate(pass);
            if !pass.made_progress() {
                break;
            }
        }
        total
    }

    /// Run passes until no transaction is running and nothing remains to
    /// process. Sleeps briefly between passes that make no progress.
    ///
    /// Blocks for as long as any transaction stays open.
    pub fn drain(&self) -> GcPassStats {
        let mut total = GcPassStats::default();
        loop {
            let pass = self.perform_gc();
            total.accumulate(pass);
            if !self.has_outstanding_work() {
                break;
            }
            if !pass.made_progress() {
                thread::sleep(DRAIN_BACKOFF);
            }
        }
        debug!(watermark = %total.watermark, actions = total.actions_processed, txns = total.txns_deallocated, "gc drained");
        total
    }

    fn has_outstanding_work(&self) -> bool {
        self.timestamp_manager.active_count() > 0 || self.deferred_actions.pending_count() > 0 || self.txn_manager.finished_count() > 0
    }

    pub fn totals(&self) -> GcTotals {
        self.state.lock().totals.clone()
    }

    pub fn last_watermark(&self) -> Timestamp {
        self.state.lock().last_watermark
    }
}

/// A finished context can go once the watermark has passed its finish timestamp.
/// Read-only transactions never install versions, so reaching it is enough.
fn is_reclaimable(ctx: &TransactionContext, watermark: Timestamp) -> bool {
    match ctx.finish_timestamp() {
        Some(finish) if ctx.is_read_only() => finish <= watermark,
        Some(finish) => finish < watermark,
        None => false,
    }
}
