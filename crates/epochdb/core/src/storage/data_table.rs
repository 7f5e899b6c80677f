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

// Versioned tables
// A table maps record ids to version chains. Writes go through the caller's
// transaction context, which records every installed version for commit
// stamping, abort rollback and later pruning.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use epochdb_common::Timestamp;
use parking_lot::RwLock;
use tracing::warn;

use crate::storage::version_chain::{InstallError, Version, VersionChain};
use crate::transaction::context::{TransactionContext, UndoKind, UndoRecord};
use crate::transaction::lib::{TransactionError, TxnResult};

/// Record identifier, unique within a table
pub type RecordId = u64;

/// Table identifier, unique within an engine
pub type TableId = u32;

/// A table of versioned records
#[derive(Debug)]
pub struct DataTable {
    id: TableId,
    name: String,
    next_record: AtomicU64,
    records: RwLock<HashMap<RecordId, Arc<VersionChain>>>,
}

impl DataTable {
    pub fn new(id: TableId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            next_record: AtomicU64::new(0),
            records: RwLock::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> TableId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn chain(&self, record: RecordId) -> Option<Arc<VersionChain>> {
        self.records.read().get(&record).cloned()
    }

    /// Insert a new record, visible to other transactions once `ctx` commits
    pub fn insert(self: &Arc<Self>, ctx: &mut TransactionContext, payload: Vec<u8>) -> TxnResult<RecordId> {
        ctx.check_writable()?;
        ctx.reserve_undo()?;

        let record = self.next_record.fetch_add(1, Ordering::Relaxed);
        let chain = Arc::new(VersionChain::new());
        let version = Arc::new(Version::new(ctx.status().clone(), Some(payload)));
        if chain.install(ctx, version.clone(), false).is_err() {
            unreachable!("install into a fresh chain cannot fail");
        }
        self.records.write().insert(record, chain.clone());

        ctx.push_undo(UndoRecord::new(self.clone(), record, UndoKind::Insert, chain, version));
        Ok(record)
    }

    /// Replace the payload of a record visible to `ctx`
    pub fn update(self: &Arc<Self>, ctx: &mut TransactionContext, record: RecordId, payload: Vec<u8>) -> TxnResult<()> {
        self.write_version(ctx, record, Some(payload), UndoKind::Update)
    }

    /// Delete a record visible to `ctx`
    pub fn delete(self: &Arc<Self>, ctx: &mut TransactionContext, record: RecordId) -> TxnResult<()> {
        self.write_version(ctx, record, None, UndoKind::Delete)
    }

    fn write_version(self: &Arc<Self>, ctx: &mut TransactionContext, record: RecordId, payload: Option<Vec<u8>>, kind: UndoKind) -> TxnResult<()> {
        ctx.check_writable()?;
        let chain = self.chain(record).ok_or(TransactionError::RecordNotFound(record))?;
        ctx.reserve_undo()?;

        let version = Arc::new(Version::new(ctx.status().clone(), payload));
        match chain.install(ctx, version.clone(), true) {
            Ok(()) => {}
            Err(InstallError::Conflict) => {
                ctx.set_must_abort();
                warn!(txn = %ctx.txn_id(), table = self.id, record, "write-write conflict");
                return Err(TransactionError::Conflict { record });
            }
            Err(InstallError::NotFound) => return Err(TransactionError::RecordNotFound(record)),
        }

        ctx.push_undo(UndoRecord::new(self.clone(), record, kind, chain, version));
        Ok(())
    }

    /// Payload of `record` as seen by `ctx`
    pub fn select(&self, ctx: &TransactionContext, record: RecordId) -> Option<Vec<u8>> {
        let version = self.chain(record)?.visible_version(ctx)?;
        version.payload().map(<[u8]>::to_vec)
    }

    /// Every record visible to `ctx`, ordered by id
    pub fn scan(&self, ctx: &TransactionContext) -> Vec<(RecordId, Vec<u8>)> {
        let chains: Vec<_> = self.records.read().iter().map(|(id, chain)| (*id, chain.clone())).collect();
        let mut rows: Vec<_> = chains
            .into_iter()
            .filter_map(|(id, chain)| {
                let version = chain.visible_version(ctx)?;
                version.payload().map(|payload| (id, payload.to_vec()))
            })
            .collect();
        rows.sort_unstable_by_key(|(id, _)| *id);
        rows
    }

    /// Total versions held across all chains
    pub fn version_count(&self) -> usize {
        self.records.read().values().map(|chain| chain.len()).sum()
    }

    /// Number of chains, including ones holding only deletes or uncommitted inserts
    pub fn record_count(&self) -> usize {
        self.records.read().len()
    }

    /// Prune the chain of `record` against `watermark`, dropping the chain
    /// itself once nothing in it can be read. Returns the number of versions removed.
    pub fn prune_record(&self, record: RecordId, watermark: Timestamp) -> usize {
        let Some(chain) = self.chain(record) else {
            return 0;
        };
        let mut pruned = chain.prune(watermark);
        if chain.is_reclaimable(watermark) {
            let mut records = self.records.write();
            if records.get(&record).is_some_and(|current| Arc::ptr_eq(current, &chain) && current.is_reclaimable(watermark)) {
                pruned += chain.len();
                records.remove(&record);
            }
        }
        pruned
    }
}
