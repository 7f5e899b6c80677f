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

// Transaction context
// A context is owned by the thread running the transaction until it is handed
// to the manager on commit or abort. The small `TxnStatus` it shares with every
// version it writes outlives it, so readers can resolve a version's commit
// state without reaching back into the context.
// A context dropped while still running rolls itself back.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use epochdb_common::Timestamp;
use tracing::warn;

use crate::transaction::deferred_action::DeferredActionManager;

use crate::storage::data_table::{DataTable, RecordId};
use crate::storage::record_buffer::{RecordBufferSegmentPool, UndoBuffer};
use crate::storage::version_chain::{Version, VersionChain, is_visible};
use crate::transaction::lib::{TransactionError, TransactionState, TxnResult};
use crate::transaction::timestamp_manager::ActiveTimestamp;

const UNSET: u64 = u64::MAX;

/// Commit state of a transaction, shared with the versions it writes
pub struct TxnStatus {
    txn_id: Timestamp,
    start: Timestamp,
    state: AtomicU8,
    commit: AtomicU64,
}

impl TxnStatus {
    pub(crate) fn new(txn_id: Timestamp, start: Timestamp) -> Self {
        Self {
            txn_id,
            start,
            state: AtomicU8::new(TransactionState::Active as u8),
            commit: AtomicU64::new(UNSET),
        }
    }

    /// The uncommitted marker (or read-only id) identifying the transaction
    pub fn txn_id(&self) -> Timestamp {
        self.txn_id
    }

    pub fn start_timestamp(&self) -> Timestamp {
        self.start
    }

    pub fn state(&self) -> TransactionState {
        TransactionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// The published commit timestamp, if any
    pub fn commit_timestamp(&self) -> Option<Timestamp> {
        match self.commit.load(Ordering::SeqCst) {
            UNSET => None,
            value => Some(Timestamp::new(value)),
        }
    }

    /// Commit timestamp of a committed writer, `None` for one that is active or aborted.
    ///
    /// A writer caught between `Committing` and publishing its timestamp is
    /// waited out; that window spans a single counter increment.
    pub fn resolve_commit(&self) -> Option<Timestamp> {
        loop {
            match self.state() {
                TransactionState::Active | TransactionState::Aborted => return None,
                TransactionState::Committed => return self.commit_timestamp(),
                TransactionState::Committing => {
                    if let Some(commit) = self.commit_timestamp() {
                        return Some(commit);
                    }
                    std::hint::spin_loop();
                }
            }
        }
    }

    fn transition(&self, from: TransactionState, to: TransactionState) -> bool {
        self.state.compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst).is_ok()
    }

    pub(crate) fn begin_commit(&self) -> bool {
        self.transition(TransactionState::Active, TransactionState::Committing)
    }

    pub(crate) fn publish_commit(&self, commit: Timestamp) {
        self.commit.store(commit.raw(), Ordering::SeqCst);
        let moved = self.transition(TransactionState::Committing, TransactionState::Committed);
        debug_assert!(moved, "commit published outside of Committing");
    }

    /// Commit path for transactions without writes; no commit timestamp is consumed
    pub(crate) fn commit_read_only(&self) -> bool {
        if !self.transition(TransactionState::Active, TransactionState::Committing) {
            return false;
        }
        self.publish_commit(self.start);
        true
    }

    pub(crate) fn mark_aborted(&self) -> bool {
        self.transition(TransactionState::Active, TransactionState::Aborted)
    }
}

impl fmt::Debug for TxnStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxnStatus")
            .field("txn_id", &self.txn_id)
            .field("start", &self.start)
            .field("state", &self.state())
            .field("commit", &self.commit_timestamp())
            .finish()
    }
}

/// Kind of change an undo record reverts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UndoKind {
    Insert,
    Update,
    Delete,
}

/// One version installed by a transaction
pub struct UndoRecord {
    table: Arc<DataTable>,
    record: RecordId,
    kind: UndoKind,
    chain: Arc<VersionChain>,
    version: Arc<Version>,
}

impl UndoRecord {
    pub(crate) fn new(table: Arc<DataTable>, record: RecordId, kind: UndoKind, chain: Arc<VersionChain>, version: Arc<Version>) -> Self {
        Self { table, record, kind, chain, version }
    }

    pub fn table(&self) -> &Arc<DataTable> {
        &self.table
    }

    pub fn record(&self) -> RecordId {
        self.record
    }

    pub fn kind(&self) -> UndoKind {
        self.kind
    }

    pub fn chain(&self) -> &Arc<VersionChain> {
        &self.chain
    }

    pub fn version(&self) -> &Arc<Version> {
        &self.version
    }
}

impl fmt::Debug for UndoRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UndoRecord")
            .field("table", &self.table.id())
            .field("record", &self.record)
            .field("kind", &self.kind)
            .finish()
    }
}

/// A running (or finished) transaction
pub struct TransactionContext {
    status: Arc<TxnStatus>,
    /// Active-set registration, present until the transaction is checked in
    active: Option<ActiveTimestamp>,
    read_only: bool,
    pool: Arc<RecordBufferSegmentPool>,
    deferred_actions: Arc<DeferredActionManager>,
    /// Allocated on the first write
    undo: Option<UndoBuffer>,
    finish: Option<Timestamp>,
    must_abort: bool,
    started_at: Instant,
}

impl TransactionContext {
    pub(crate) fn new(
        active: ActiveTimestamp,
        txn_id: Timestamp,
        read_only: bool,
        pool: Arc<RecordBufferSegmentPool>,
        deferred_actions: Arc<DeferredActionManager>,
    ) -> Self {
        let status = Arc::new(TxnStatus::new(txn_id, active.timestamp()));
        Self {
            status,
            active: Some(active),
            read_only,
            pool,
            deferred_actions,
            undo: None,
            finish: None,
            must_abort: false,
            started_at: Instant::now(),
        }
    }

    pub fn txn_id(&self) -> Timestamp {
        self.status.txn_id()
    }

    pub fn start_timestamp(&self) -> Timestamp {
        self.status.start_timestamp()
    }

    /// Commit or abort timestamp; `None` while the transaction runs
    pub fn finish_timestamp(&self) -> Option<Timestamp> {
        self.finish
    }

    pub fn state(&self) -> TransactionState {
        self.status.state()
    }

    pub fn is_active(&self) -> bool {
        self.state() == TransactionState::Active
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Set after a write conflict; the transaction can only abort
    pub fn must_abort(&self) -> bool {
        self.must_abort
    }

    /// Number of versions this transaction installed
    pub fn write_count(&self) -> usize {
        self.undo.as_ref().map_or(0, UndoBuffer::len)
    }

    pub fn duration(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn status(&self) -> &Arc<TxnStatus> {
        &self.status
    }

    /// Whether `version` belongs to this transaction's snapshot
    pub fn can_see(&self, version: &Version) -> bool {
        is_visible(version, self)
    }

    pub(crate) fn check_writable(&self) -> TxnResult<()> {
        if self.read_only {
            return Err(TransactionError::ReadOnly(self.txn_id()));
        }
        if self.must_abort {
            return Err(TransactionError::MustAbort(self.txn_id()));
        }
        if !self.is_active() {
            return Err(TransactionError::InvalidState(format!("cannot write in state {:?}", self.state())));
        }
        Ok(())
    }

    pub(crate) fn reserve_undo(&mut self) -> TxnResult<()> {
        let pool = &self.pool;
        self.undo.get_or_insert_with(|| UndoBuffer::new(pool.clone())).reserve()?;
        Ok(())
    }

    pub(crate) fn push_undo(&mut self, record: UndoRecord) {
        match self.undo.as_mut() {
            Some(undo) => undo.push(record),
            None => unreachable!("undo record pushed before reserve"),
        }
    }

    pub(crate) fn set_must_abort(&mut self) {
        self.must_abort = true;
    }

    pub(crate) fn take_undo(&mut self) -> Option<UndoBuffer> {
        self.undo.take()
    }

    /// Unlink every installed version, newest first, and move to Aborted.
    /// Returns the undo buffer, which still owns the unlinked versions.
    pub(crate) fn roll_back(&mut self) -> Option<UndoBuffer> {
        let undo = self.undo.take();
        if let Some(undo) = &undo {
            for record in undo.iter().rev() {
                record.chain().unlink(record.version());
            }
        }
        let moved = self.status.mark_aborted();
        debug_assert!(moved, "rolled back a transaction that was not active");
        undo
    }

    pub(crate) fn take_active(&mut self) -> Option<ActiveTimestamp> {
        self.active.take()
    }

    pub(crate) fn set_finish(&mut self, finish: Timestamp) {
        debug_assert!(self.finish.is_none(), "transaction finished twice");
        self.finish = Some(finish);
    }
}

impl fmt::Debug for TransactionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionContext")
            .field("txn_id", &self.txn_id())
            .field("start", &self.start_timestamp())
            .field("state", &self.state())
            .field("finish", &self.finish)
            .field("read_only", &self.read_only)
            .field("writes", &self.write_count())
            .finish()
    }
}

/// Prune every chain the buffer touched, then return its segments to the pool
pub(crate) fn reclaim_undo(undo: Option<UndoBuffer>, watermark: Timestamp) {
    let Some(undo) = undo else {
        return;
    };
    for record in undo.iter() {
        record.table().prune_record(record.record(), watermark);
    }
}

impl Drop for TransactionContext {
    fn drop(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        let timestamp_manager = self.deferred_actions.timestamp_manager().clone();
        if self.is_active() {
            let writes = self.write_count();
            let undo = self.roll_back();
            let finish = if self.read_only {
                self.start_timestamp()
            } else {
                timestamp_manager.issue_timestamp()
            };
            self.finish = Some(finish);
            if let Some(undo) = undo {
                self.deferred_actions.register_deferred_action(finish, move |watermark| reclaim_undo(Some(undo), watermark));
            }
            warn!(txn = %self.txn_id(), %finish, writes, "transaction context dropped without commit or abort, rolled back");
        }
        timestamp_manager.check_in_timestamp(active);
    }
}
