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

// Engine
// Wires the buffer pool, timestamp authority, deferred action queue,
// transaction manager and garbage collector together from one configuration.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use epochdb_common::{ConfigError, EngineConfig, Timestamp};
use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use crate::gc::{GarbageCollector, GarbageCollectorThread, GcPassStats};
use crate::storage::data_table::{DataTable, TableId};
use crate::storage::record_buffer::RecordBufferSegmentPool;
use crate::transaction::{DeferredActionManager, TimestampManager, TransactionContext, TransactionManager, TxnResult};

/// Errors raised while opening an engine
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to start gc driver: {0}")]
    Io(#[from] io::Error),
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// The transactional core
pub struct Engine {
    config: EngineConfig,
    pool: Arc<RecordBufferSegmentPool>,
    timestamp_manager: Arc<TimestampManager>,
    deferred_actions: Arc<DeferredActionManager>,
    txn_manager: Arc<TransactionManager>,
    gc: Arc<GarbageCollector>,
    gc_thread: Mutex<Option<GarbageCollectorThread>>,
    tables: RwLock<Vec<Arc<DataTable>>>,
    next_table: AtomicU32,
    shut_down: AtomicBool,
}

impl Engine {
    /// Open an engine
    ///
    /// Steps:
    /// 1. Validate the configuration.
    /// 2. Build the pool, timestamp manager, deferred action queue, transaction manager and collector.
    /// 3. Start the gc driver thread unless collection is disabled.
    pub fn open(config: EngineConfig) -> EngineResult<Self> {
        config.validate()?;

        let buffer = &config.buffer_pool;
        let pool = Arc::new(RecordBufferSegmentPool::new(buffer.size_limit, buffer.reuse_limit, buffer.segment_capacity));
        let timestamp_manager = Arc::new(TimestampManager::new(config.active_set_shards));
        let deferred_actions = Arc::new(DeferredActionManager::new(timestamp_manager.clone()));
        let txn_manager = Arc::new(TransactionManager::new(timestamp_manager.clone(), deferred_actions.clone(), pool.clone()));
        let gc = Arc::new(GarbageCollector::new(txn_manager.clone()));

        let gc_thread = if config.gc.enabled {
            Some(GarbageCollectorThread::start(gc.clone(), config.gc.interval())?)
        } else {
            None
        };

        info!(gc_enabled = config.gc.enabled, shards = config.active_set_shards, "engine opened");
        Ok(Self {
            config,
            pool,
            timestamp_manager,
            deferred_actions,
            txn_manager,
            gc,
            gc_thread: Mutex::new(gc_thread),
            tables: RwLock::new(Vec::new()),
            next_table: AtomicU32::new(0),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn buffer_pool(&self) -> &Arc<RecordBufferSegmentPool> {
        &self.pool
    }

    pub fn timestamp_manager(&self) -> &Arc<TimestampManager> {
        &self.timestamp_manager
    }

    pub fn deferred_actions(&self) -> &Arc<DeferredActionManager> {
        &self.deferred_actions
    }

    pub fn transaction_manager(&self) -> &Arc<TransactionManager> {
        &self.txn_manager
    }

    pub fn garbage_collector(&self) -> &Arc<GarbageCollector> {
        &self.gc
    }

    /// Whether the background collector is running
    pub fn gc_running(&self) -> bool {
        self.gc_thread.lock().as_ref().is_some_and(GarbageCollectorThread::is_running)
    }

    pub fn begin_transaction(&self) -> TransactionContext {
        self.txn_manager.begin_transaction()
    }

    pub fn begin_read_only(&self) -> TransactionContext {
        self.txn_manager.begin_read_only()
    }

    pub fn commit(&self, ctx: TransactionContext) -> TxnResult<Timestamp> {
        self.txn_manager.commit(ctx)
    }

    pub fn abort(&self, ctx: TransactionContext) -> TxnResult<Timestamp> {
        self.txn_manager.abort(ctx)
    }

    /// Create an empty table
    pub fn create_table(&self, name: impl Into<String>) -> Arc<DataTable> {
        let id: TableId = self.next_table.fetch_add(1, Ordering::Relaxed);
        let table = Arc::new(DataTable::new(id, name));
        self.tables.write().push(table.clone());
        table
    }

    pub fn table(&self, id: TableId) -> Option<Arc<DataTable>> {
        self.tables.read().iter().find(|table| table.id() == id).cloned()
    }

    pub fn tables(&self) -> Vec<Arc<DataTable>> {
        self.tables.read().clone()
    }

    /// Run one collection pass on the calling thread
    pub fn perform_gc(&self) -> GcPassStats {
        self.gc.perform_gc()
    }

    /// Collect until nothing more can be reclaimed
    pub fn fully_perform_gc(&self) -> GcPassStats {
        self.gc.fully_perform_gc()
    }

    pub fn pause_gc(&self) {
        if let Some(thread) = self.gc_thread.lock().as_ref() {
            thread.pause();
        }
    }

    pub fn resume_gc(&self) {
        if let Some(thread) = self.gc_thread.lock().as_ref() {
            thread.resume();
        }
    }

    /// Stop the collector thread, then drain until no transaction is running
    /// and no deferred action or finished context remains. Later calls do nothing.
    pub fn shutdown(&self) -> GcPassStats {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return GcPassStats::default();
        }

        let mut stats = match self.gc_thread.lock().take() {
            Some(mut thread) => thread.stop(),
            None => GcPassStats::default(),
        };

        let active = self.txn_manager.active_count();
        if active > 0 {
            warn!(active, "engine shutting down, waiting for running transactions");
        }
        stats.accumulate(self.gc.drain());
        info!(
            actions = stats.actions_processed,
            txns = stats.txns_deallocated,
            pending = self.deferred_actions.pending_count(),
            "engine shut down"
        );
        stats
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::transaction::TransactionError;

    #[test]
    fn test_open_rejects_invalid_config() {
        let mut config = EngineConfig::default();
        config.active_set_shards = 0;
        assert!(matches!(Engine::open(config), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_gc_disabled_starts_no_thread() {
        let engine = Engine::open(EngineConfig::default().with_gc_disabled()).unwrap();
        assert!(!engine.gc_running());

        let table = engine.create_table("t");
        let mut txn = engine.begin_transaction();
        table.insert(&mut txn, b"a".to_vec()).unwrap();
        engine.commit(txn).unwrap();

        // Nothing reclaims without an explicit pass
        assert_eq!(engine.transaction_manager().finished_count(), 1);
        engine.fully_perform_gc();
        assert_eq!(engine.transaction_manager().finished_count(), 0);
    }

    #[test]
    fn test_gc_enabled_starts_thread() {
        let engine = Engine::open(EngineConfig::default()).unwrap();
        assert!(engine.gc_running());
        engine.shutdown();
        assert!(!engine.gc_running());
    }

    #[test]
    fn test_shutdown_drains_once() {
        let engine = Engine::open(EngineConfig::default().with_gc_disabled()).unwrap();
        engine.commit(engine.begin_transaction()).unwrap();

        let first = engine.shutdown();
        assert_eq!(first.txns_deallocated, 1);
        assert_eq!(engine.shutdown(), GcPassStats::default());
    }

    #[test]
    fn test_tables_are_registered() {
        let engine = Engine::open(EngineConfig::default().with_gc_disabled()).unwrap();
        let a = engine.create_table("a");
        let b = engine.create_table("b");
        assert_ne!(a.id(), b.id());
        assert_eq!(engine.table(b.id()).unwrap().name(), "b");
        assert_eq!(engine.tables().len(), 2);
    }

    #[test]
    fn test_exhausted_pool_rejects_writes_without_installing() {
        let engine = Engine::open(EngineConfig::default().with_gc_disabled()).unwrap();
        let table = engine.create_table("t");
        let mut setup = engine.begin_transaction();
        let id = table.insert(&mut setup, b"seed".to_vec()).unwrap();
        engine.commit(setup).unwrap();
        engine.fully_perform_gc();
        let baseline = engine.buffer_pool().allocated();

        engine.buffer_pool().set_size_limit(0);
        let mut txn = engine.begin_transaction();
        assert!(matches!(table.insert(&mut txn, b"new".to_vec()), Err(TransactionError::ResourceExhausted(_))));
        assert!(matches!(table.update(&mut txn, id, b"x".to_vec()), Err(TransactionError::ResourceExhausted(_))));
        assert_eq!(txn.write_count(), 0);
        assert_eq!(table.record_count(), 1);
        assert_eq!(table.version_count(), 1);

        engine.abort(txn).unwrap();
        engine.fully_perform_gc();
        assert_eq!(engine.buffer_pool().allocated(), baseline);
        assert_eq!(engine.buffer_pool().get_stats().exhausted_count, 2);

        engine.buffer_pool().set_size_limit(engine.config().buffer_pool.size_limit);
        let mut retry = engine.begin_transaction();
        table.update(&mut retry, id, b"x".to_vec()).unwrap();
        engine.commit(retry).unwrap();
    }

    #[test]
    fn test_exhaustion_mid_transaction_rolls_back_on_abort() {
        let mut config = EngineConfig::default().with_gc_disabled();
        config.buffer_pool.size_limit = 1;
        config.buffer_pool.reuse_limit = 1;
        config.buffer_pool.segment_capacity = 2;
        let engine = Engine::open(config).unwrap();
        let table = engine.create_table("t");

        let mut setup = engine.begin_transaction();
        let id = table.insert(&mut setup, b"seed".to_vec()).unwrap();
        engine.commit(setup).unwrap();
        engine.fully_perform_gc();
        assert_eq!(engine.buffer_pool().allocated(), 0);

        let mut txn = engine.begin_transaction();
        table.update(&mut txn, id, b"a".to_vec()).unwrap();
        table.insert(&mut txn, b"b".to_vec()).unwrap();
        assert!(matches!(table.insert(&mut txn, b"c".to_vec()), Err(TransactionError::ResourceExhausted(_))));
        assert_eq!(txn.write_count(), 2);
        assert_eq!(table.record_count(), 2);
        assert_eq!(table.version_count(), 3);

        engine.abort(txn).unwrap();
        assert_eq!(table.version_count(), 1);
        engine.fully_perform_gc();
        assert_eq!(table.record_count(), 1);
        assert_eq!(engine.buffer_pool().allocated(), 0);

        let reader = engine.begin_read_only();
        assert_eq!(table.select(&reader, id), Some(b"seed".to_vec()));
        engine.commit(reader).unwrap();
    }

    #[test]
    fn test_shutdown_waits_for_running_transaction() {
        let engine = Arc::new(Engine::open(EngineConfig::default().with_gc_disabled()).unwrap());
        let table = engine.create_table("t");
        let barrier = Arc::new(Barrier::new(2));

        let writer = {
            let engine = engine.clone();
            let table = table.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let mut txn = engine.begin_transaction();
                table.insert(&mut txn, b"late".to_vec()).unwrap();
                barrier.wait();
                thread::sleep(Duration::from_millis(30));
                engine.commit(txn).unwrap()
            })
        };

        barrier.wait();
        let stats = engine.shutdown();
        let commit = writer.join().unwrap();

        assert!(stats.watermark > commit);
        assert_eq!(stats.actions_processed, 1);
        assert_eq!(engine.transaction_manager().active_count(), 0);
        assert_eq!(engine.deferred_actions().pending_count(), 0);
        assert_eq!(engine.transaction_manager().finished_count(), 0);
        assert_eq!(engine.buffer_pool().allocated(), 0);
    }
}

