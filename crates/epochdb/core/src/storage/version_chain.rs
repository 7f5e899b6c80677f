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

// Version chains
// Each record keeps its versions newest first behind a per-record latch, so
// writers on different records never contend.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use epochdb_common::Timestamp;
use parking_lot::RwLock;

use crate::transaction::context::{TransactionContext, TxnStatus};

/// One version of a record
#[derive(Debug)]
pub struct Version {
    /// Writer's uncommitted marker until commit, then the commit timestamp
    ts: AtomicU64,
    status: Arc<TxnStatus>,
    /// `None` marks a delete
    payload: Option<Vec<u8>>,
}

impl Version {
    pub(crate) fn new(status: Arc<TxnStatus>, payload: Option<Vec<u8>>) -> Self {
        Self {
            ts: AtomicU64::new(status.txn_id().raw()),
            status,
            payload,
        }
    }

    pub fn timestamp(&self) -> Timestamp {
        Timestamp::new(self.ts.load(Ordering::Acquire))
    }

    pub(crate) fn stamp(&self, commit: Timestamp) {
        debug_assert!(!commit.is_tagged());
        self.ts.store(commit.raw(), Ordering::Release);
    }

    pub fn payload(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }

    pub fn is_tombstone(&self) -> bool {
        self.payload.is_none()
    }

    pub fn status(&self) -> &Arc<TxnStatus> {
        &self.status
    }

    /// Commit timestamp of the writer, `None` while it is uncommitted or after it aborted.
    /// Waits out a writer that is publishing its commit timestamp.
    pub fn commit_timestamp(&self) -> Option<Timestamp> {
        let ts = self.timestamp();
        if !ts.is_tagged() {
            return Some(ts);
        }
        self.status.resolve_commit()
    }
}

/// Whether `version` is part of the snapshot read by `ctx`
///
/// A version is visible if the reader wrote it, or if its writer committed
/// before the reader started.
pub fn is_visible(version: &Version, ctx: &TransactionContext) -> bool {
    if version.timestamp() == ctx.txn_id() {
        return true;
    }
    version.commit_timestamp().is_some_and(|commit| commit < ctx.start_timestamp())
}

/// Why a version could not be installed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InstallError {
    /// The head belongs to a writer the installer cannot see
    Conflict,
    /// No live version is visible to the installer
    NotFound,
}

/// Versions of one record, newest first
#[derive(Debug, Default)]
pub struct VersionChain {
    versions: RwLock<VecDeque<Arc<Version>>>,
}

impl VersionChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `version` at the head on behalf of `ctx`.
    ///
    /// Steps:
    /// 1. Reject if the head was written by another transaction that is uncommitted
    ///    or committed at or after `ctx` started.
    /// 2. With `require_live`, reject unless `ctx` sees a version that is not a delete.
    /// 3. Push the version at the head.
    pub(crate) fn install(&self, ctx: &TransactionContext, version: Arc<Version>, require_live: bool) -> Result<(), InstallError> {
        let mut versions = self.versions.write();
        if let Some(head) = versions.front()
            && head.timestamp() != ctx.txn_id()
            && !head.commit_timestamp().is_some_and(|commit| commit < ctx.start_timestamp())
        {
            return Err(InstallError::Conflict);
        }
        if require_live && !versions.iter().find(|v| is_visible(v, ctx)).is_some_and(|v| !v.is_tombstone()) {
            return Err(InstallError::NotFound);
        }
        versions.push_front(version);
        Ok(())
    }

    /// Remove `version` from the chain. Returns false if it was not linked.
    pub fn unlink(&self, version: &Arc<Version>) -> bool {
        let mut versions = self.versions.write();
        match versions.iter().position(|v| Arc::ptr_eq(v, version)) {
            Some(index) => {
                versions.remove(index);
                true
            }
            None => false,
        }
    }

    /// Newest version visible to `ctx`, deletes included
    pub fn visible_version(&self, ctx: &TransactionContext) -> Option<Arc<Version>> {
        self.versions.read().iter().find(|v| is_visible(v, ctx)).cloned()
    }

    /// Drop every version older than the newest one committed before `watermark`.
    /// Returns the number of versions removed.
    pub fn prune(&self, watermark: Timestamp) -> usize {
        let mut versions = self.versions.write();
        let keep = versions.iter().position(|v| {
            let ts = v.timestamp();
            !ts.is_tagged() && ts < watermark
        });
        match keep {
            Some(index) => {
                let before = versions.len();
                versions.truncate(index + 1);
                before - versions.len()
            }
            None => 0,
        }
    }

    /// True when nothing any current or future reader could see remains:
    /// the chain is empty or holds only a delete committed before `watermark`.
    pub fn is_reclaimable(&self, watermark: Timestamp) -> bool {
        let versions = self.versions.read();
        match versions.len() {
            0 => true,
            1 => {
                let ts = versions[0].timestamp();
                versions[0].is_tombstone() && !ts.is_tagged() && ts < watermark
            }
            _ => false,
        }
    }

    pub fn head(&self) -> Option<Arc<Version>> {
        self.versions.read().front().cloned()
    }

    pub fn len(&self) -> usize {
        self.versions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::record_buffer::RecordBufferSegmentPool;
    use crate::transaction::deferred_action::DeferredActionManager;
    use crate::transaction::lib::TransactionState;
    use crate::transaction::timestamp_manager::TimestampManager;

    fn begin(ts: &Arc<TimestampManager>) -> TransactionContext {
        let active = ts.check_out_timestamp();
        let txn_id = active.timestamp().uncommitted();
        let pool = Arc::new(RecordBufferSegmentPool::new(8, 8, 4));
        TransactionContext::new(active, txn_id, false, pool, Arc::new(DeferredActionManager::new(ts.clone())))
    }

    fn finish(ts: &TimestampManager, mut ctx: TransactionContext) -> Timestamp {
        let commit = ts.issue_timestamp();
        ctx.status().begin_commit();
        ctx.status().publish_commit(commit);
        ts.check_in_timestamp(ctx.take_active().unwrap());
        commit
    }

    fn committed_version(ts: &Arc<TimestampManager>, payload: &[u8]) -> Arc<Version> {
        let ctx = begin(ts);
        let version = Arc::new(Version::new(ctx.status().clone(), Some(payload.to_vec())));
        let commit = finish(ts, ctx);
        version.stamp(commit);
        version
    }

    #[test]
    fn test_own_write_visible_to_writer_only() {
        let ts = Arc::new(TimestampManager::default());
        let mut writer = begin(&ts);
        let mut reader = begin(&ts);
        let version = Version::new(writer.status().clone(), Some(b"v".to_vec()));

        assert!(is_visible(&version, &writer));
        assert!(!is_visible(&version, &reader));

        ts.check_in_timestamp(writer.take_active().unwrap());
        ts.check_in_timestamp(reader.take_active().unwrap());
    }

    #[test]
    fn test_committed_before_start_is_visible() {
        let ts = Arc::new(TimestampManager::default());
        let version = committed_version(&ts, b"v");
        let mut reader = begin(&ts);
        assert!(is_visible(&version, &reader));
        ts.check_in_timestamp(reader.take_active().unwrap());
    }

    #[test]
    fn test_committed_after_start_is_invisible() {
        let ts = Arc::new(TimestampManager::default());
        let mut reader = begin(&ts);
        let version = committed_version(&ts, b"v");
        assert!(!is_visible(&version, &reader));
        ts.check_in_timestamp(reader.take_active().unwrap());
    }

    #[test]
    fn test_published_but_unstamped_commit_resolves() {
        let ts = Arc::new(TimestampManager::default());
        let writer = begin(&ts);
        let version = Version::new(writer.status().clone(), Some(b"v".to_vec()));
        finish(&ts, writer);

        let mut reader = begin(&ts);
        assert!(version.timestamp().is_tagged());
        assert!(is_visible(&version, &reader));
        ts.check_in_timestamp(reader.take_active().unwrap());
    }

    #[test]
    fn test_install_detects_conflict() {
        let ts = Arc::new(TimestampManager::default());
        let chain = VersionChain::new();
        chain.versions.write().push_front(committed_version(&ts, b"base"));

        let mut first = begin(&ts);
        let mut second = begin(&ts);
        let v1 = Arc::new(Version::new(first.status().clone(), Some(b"a".to_vec())));
        let v2 = Arc::new(Version::new(second.status().clone(), Some(b"b".to_vec())));

        assert_eq!(chain.install(&first, v1.clone(), true), Ok(()));
        assert_eq!(chain.install(&second, v2, true), Err(InstallError::Conflict));
        // Writing the same record twice is not a conflict
        let again = Arc::new(Version::new(first.status().clone(), Some(b"c".to_vec())));
        assert_eq!(chain.install(&first, again, true), Ok(()));
        assert_eq!(chain.len(), 3);

        ts.check_in_timestamp(first.take_active().unwrap());
        ts.check_in_timestamp(second.take_active().unwrap());
    }

    #[test]
    fn test_install_requires_live_version() {
        let ts = Arc::new(TimestampManager::default());
        let chain = VersionChain::new();
        let mut ctx = begin(&ts);
        let version = Arc::new(Version::new(ctx.status().clone(), None));
        assert_eq!(chain.install(&ctx, version, true), Err(InstallError::NotFound));
        assert!(chain.is_empty());
        ts.check_in_timestamp(ctx.take_active().unwrap());
    }

    #[test]
    fn test_unlink_removes_exact_version() {
        let ts = Arc::new(TimestampManager::default());
        let chain = VersionChain::new();
        let old = committed_version(&ts, b"old");
        let new = committed_version(&ts, b"new");
        chain.versions.write().push_front(old.clone());
        chain.versions.write().push_front(new.clone());

        assert!(chain.unlink(&new));
        assert!(!chain.unlink(&new));
        assert!(Arc::ptr_eq(&chain.head().unwrap(), &old));
    }

    #[test]
    fn test_prune_keeps_newest_committed_below_watermark() {
        let ts = Arc::new(TimestampManager::default());
        let chain = VersionChain::new();
        for payload in [b"a", b"b", b"c"] {
            chain.versions.write().push_front(committed_version(&ts, payload));
        }
        let watermark = ts.current_time();

        assert_eq!(chain.prune(watermark), 2);
        assert_eq!(chain.len(), 1);
        assert_eq!(chain.head().unwrap().payload(), Some(&b"c"[..]));
        assert_eq!(chain.prune(watermark), 0);
    }

    #[test]
    fn test_prune_respects_watermark() {
        let ts = Arc::new(TimestampManager::default());
        let chain = VersionChain::new();
        chain.versions.write().push_front(committed_version(&ts, b"a"));
        let watermark = ts.current_time();
        chain.versions.write().push_front(committed_version(&ts, b"b"));

        assert_eq!(chain.prune(watermark), 0);
        assert_eq!(chain.len(), 2);
    }

    #[test]
    fn test_tombstone_chain_is_reclaimable() {
        let ts = Arc::new(TimestampManager::default());
        let chain = VersionChain::new();
        assert!(chain.is_reclaimable(ts.current_time()));

        let ctx = begin(&ts);
        let tombstone = Arc::new(Version::new(ctx.status().clone(), None));
        chain.versions.write().push_front(tombstone.clone());
        assert!(!chain.is_reclaimable(ts.current_time()));

        let commit = finish(&ts, ctx);
        tombstone.stamp(commit);
        assert!(chain.is_reclaimable(ts.current_time()));
    }

    fn publish_later(status: Arc<TxnStatus>, commit: Timestamp) -> std::thread::JoinHandle<()> {
        std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            status.publish_commit(commit);
        })
    }

    #[test]
    fn test_reader_waits_out_committing_writer() {
        let ts = Arc::new(TimestampManager::default());
        let mut early = begin(&ts);
        let mut writer = begin(&ts);
        let version = Version::new(writer.status().clone(), Some(b"w".to_vec()));

        let status = writer.status().clone();
        assert!(status.begin_commit());
        let commit = ts.issue_timestamp();
        let mut late = begin(&ts);
        assert!(early.start_timestamp() < commit && commit < late.start_timestamp());
        assert_eq!(status.state(), TransactionState::Committing);
        assert_eq!(status.commit_timestamp(), None);

        let publisher = publish_later(status.clone(), commit);
        assert!(is_visible(&version, &late));
        assert_eq!(status.commit_timestamp(), Some(commit));
        assert!(!is_visible(&version, &early));
        assert_eq!(version.commit_timestamp(), Some(commit));
        publisher.join().unwrap();

        for ctx in [&mut early, &mut writer, &mut late] {
            ts.check_in_timestamp(ctx.take_active().unwrap());
        }
    }

    #[test]
    fn test_install_waits_out_committing_writer() {
        let ts = Arc::new(TimestampManager::default());
        let chain = VersionChain::new();
        let mut early = begin(&ts);
        let mut writer = begin(&ts);
        chain.versions.write().push_front(Arc::new(Version::new(writer.status().clone(), Some(b"w".to_vec()))));

        let status = writer.status().clone();
        assert!(status.begin_commit());
        let commit = ts.issue_timestamp();
        let mut late = begin(&ts);

        let publisher = publish_later(status.clone(), commit);
        let next = Arc::new(Version::new(late.status().clone(), Some(b"l".to_vec())));
        assert_eq!(chain.install(&late, next.clone(), true), Ok(()));
        publisher.join().unwrap();
        assert_eq!(status.state(), TransactionState::Committed);

        // The writer committed after the early transaction started
        assert!(chain.unlink(&next));
        let stale = Arc::new(Version::new(early.status().clone(), Some(b"e".to_vec())));
        assert_eq!(chain.install(&early, stale, true), Err(InstallError::Conflict));
        assert_eq!(chain.len(), 1);

        for ctx in [&mut early, &mut writer, &mut late] {
            ts.check_in_timestamp(ctx.take_active().unwrap());
        }
    }
}

