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

// Transaction manager
// Begins, commits and aborts transactions. Finished contexts are parked on a
// list that the garbage collector drains once the watermark has passed them.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use epochdb_common::Timestamp;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::storage::record_buffer::RecordBufferSegmentPool;
use crate::transaction::context::{TransactionContext, reclaim_undo};
use crate::transaction::deferred_action::DeferredActionManager;
use crate::transaction::lib::{TransactionError, TransactionState, TxnResult};
use crate::transaction::timestamp_manager::TimestampManager;

/// Transaction counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransactionStats {
    pub begun: u64,
    pub read_only_begun: u64,
    pub committed: u64,
    pub aborted: u64,
    /// Transactions that finished after a write-write conflict
    pub conflicts: u64,
}

#[derive(Debug, Default)]
struct Counters {
    begun: AtomicU64,
    read_only_begun: AtomicU64,
    committed: AtomicU64,
    aborted: AtomicU64,
    conflicts: AtomicU64,
}

/// Coordinates transaction lifecycles
pub struct TransactionManager {
    timestamp_manager: Arc<TimestampManager>,
    deferred_actions: Arc<DeferredActionManager>,
    pool: Arc<RecordBufferSegmentPool>,
    /// Committed and aborted contexts not yet reclaimed
    finished: Mutex<Vec<TransactionContext>>,
    counters: Counters,
}

impl TransactionManager {
    pub fn new(timestamp_manager: Arc<TimestampManager>, deferred_actions: Arc<DeferredActionManager>, pool: Arc<RecordBufferSegmentPool>) -> Self {
        Self {
            timestamp_manager,
            deferred_actions,
            pool,
            finished: Mutex::new(Vec::new()),
            counters: Counters::default(),
        }
    }

    pub fn timestamp_manager(&self) -> &Arc<TimestampManager> {
        &self.timestamp_manager
    }

    pub fn deferred_actions(&self) -> &Arc<DeferredActionManager> {
        &self.deferred_actions
    }

    pub fn buffer_pool(&self) -> &Arc<RecordBufferSegmentPool> {
        &self.pool
    }

    /// Begin a read-write transaction with a freshly issued start timestamp
    pub fn begin_transaction(&self) -> TransactionContext {
        let active = self.timestamp_manager.check_out_timestamp();
        let txn_id = active.timestamp().uncommitted();
        self.counters.begun.fetch_add(1, Ordering::Relaxed);
        TransactionContext::new(active, txn_id, false, self.pool.clone(), self.deferred_actions.clone())
    }

    /// Begin a read-only transaction reading at the current time.
    /// Its id comes from the read-only counter and no timestamp is consumed.
    pub fn begin_read_only(&self) -> TransactionContext {
        let active = self.timestamp_manager.check_out_snapshot();
        let txn_id = self.timestamp_manager.issue_read_only_id();
        self.counters.begun.fetch_add(1, Ordering::Relaxed);
        self.counters.read_only_begun.fetch_add(1, Ordering::Relaxed);
        TransactionContext::new(active, txn_id, true, self.pool.clone(), self.deferred_actions.clone())
    }

    /// Commit a transaction
    ///
    /// Steps:
    /// 1. A transaction flagged `must_abort` is aborted instead and `MustAbort` returned.
    /// 2. Without writes, finish at the start timestamp and return it.
    /// 3. Otherwise move to Committing, issue and publish the commit timestamp, move to Committed.
    /// 4. Stamp every installed version with the commit timestamp.
    /// 5. Check in the start timestamp.
    /// 6. Defer pruning of the touched chains and the undo buffer release until the
    ///    watermark passes the commit timestamp.
    /// 7. Park the context on the finished list.
    pub fn commit(&self, mut ctx: TransactionContext) -> TxnResult<Timestamp> {
        if ctx.must_abort() {
            let txn_id = ctx.txn_id();
            self.abort(ctx)?;
            return Err(TransactionError::MustAbort(txn_id));
        }
        if ctx.state() != TransactionState::Active {
            return Err(TransactionError::InvalidState(format!("cannot commit in state {:?}", ctx.state())));
        }

        if ctx.write_count() == 0 {
            let start = ctx.start_timestamp();
            let moved = ctx.status().commit_read_only();
            debug_assert!(moved);
            // A buffer reserved by a write that failed holds no records
            drop(ctx.take_undo());
            ctx.set_finish(start);
            self.check_in(&mut ctx);
            self.counters.committed.fetch_add(1, Ordering::Relaxed);
            debug!(txn = %ctx.txn_id(), %start, "read-only commit");
            self.finished.lock().push(ctx);
            return Ok(start);
        }

        let status = ctx.status().clone();
        let moved = status.begin_commit();
        debug_assert!(moved);
        let commit = self.timestamp_manager.issue_timestamp();
        status.publish_commit(commit);

        let writes = ctx.write_count();
        let undo = ctx.take_undo();
        if let Some(undo) = &undo {
            for record in undo.iter() {
                record.version().stamp(commit);
            }
        }
        ctx.set_finish(commit);
        self.check_in(&mut ctx);

        self.deferred_actions.register_deferred_action(commit, move |watermark| reclaim_undo(undo, watermark));
        self.counters.committed.fetch_add(1, Ordering::Relaxed);
        debug!(txn = %ctx.txn_id(), %commit, writes, "transaction committed");
        self.finished.lock().push(ctx);
        Ok(commit)
    }

    /// Abort a transaction
    ///
    /// Steps:
    /// 1. Unlink every installed version, newest first.
    /// 2. Move to Aborted and take a finish timestamp.
    /// 3. Check in the start timestamp.
    /// 4. Defer the undo buffer release until the watermark passes the finish timestamp.
    /// 5. Park the context on the finished list.
    pub fn abort(&self, mut ctx: TransactionContext) -> TxnResult<Timestamp> {
        if ctx.state() != TransactionState::Active {
            return Err(TransactionError::InvalidState(format!("cannot abort in state {:?}", ctx.state())));
        }

        let undo = ctx.roll_back();

        let finish = if ctx.is_read_only() {
            ctx.start_timestamp()
        } else {
            self.timestamp_manager.issue_timestamp()
        };
        ctx.set_finish(finish);
        self.check_in(&mut ctx);

        if let Some(undo) = undo {
            self.deferred_actions.register_deferred_action(finish, move |watermark| reclaim_undo(Some(undo), watermark));
        }
        self.counters.aborted.fetch_add(1, Ordering::Relaxed);
        if ctx.must_abort() {
            self.counters.conflicts.fetch_add(1, Ordering::Relaxed);
        }
        debug!(txn = %ctx.txn_id(), %finish, "transaction aborted");
        self.finished.lock().push(ctx);
        Ok(finish)
    }

    fn check_in(&self, ctx: &mut TransactionContext) {
        if let Some(active) = ctx.take_active() {
            self.timestamp_manager.check_in_timestamp(active);
        }
    }

    /// Take every finished context
    pub fn take_finished(&self) -> Vec<TransactionContext> {
        std::mem::take(&mut *self.finished.lock())
    }

    /// Return contexts the collector could not reclaim yet
    pub fn requeue_finished(&self, contexts: Vec<TransactionContext>) {
        if !contexts.is_empty() {
            self.finished.lock().extend(contexts);
        }
    }

    pub fn finished_count(&self) -> usize {
        self.finished.lock().len()
    }

    /// Number of running transactions
    pub fn active_count(&self) -> usize {
        self.timestamp_manager.active_count()
    }

    pub fn stats(&self) -> TransactionStats {
        TransactionStats {
            begun: self.counters.begun.load(Ordering::Relaxed),
            read_only_begun: self.counters.read_only_begun.load(Ordering::Relaxed),
            committed: self.counters.committed.load(Ordering::Relaxed),
            aborted: self.counters.aborted.load(Ordering::Relaxed),
            conflicts: self.counters.conflicts.load(Ordering::Relaxed),
        }
    }
}
