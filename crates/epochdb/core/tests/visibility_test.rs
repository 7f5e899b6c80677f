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

// Visibility scenarios over the public engine API

use std::sync::Arc;

use epochdb_core::{DataTable, Engine, EngineConfig, RecordId, Timestamp, TransactionError, TxnResult};

fn engine() -> Engine {
    Engine::open(EngineConfig::default().with_gc_disabled()).unwrap()
}

fn seed(engine: &Engine, table: &Arc<DataTable>, payload: &[u8]) -> RecordId {
    let mut txn = engine.begin_transaction();
    let id = table.insert(&mut txn, payload.to_vec()).unwrap();
    engine.commit(txn).unwrap();
    id
}

#[test]
fn test_uncommitted_write_invisible_until_commit() {
    let engine = engine();
    let table = engine.create_table("r");
    let r = seed(&engine, &table, b"R0");

    let mut a = engine.begin_transaction();
    table.update(&mut a, r, b"R1".to_vec()).unwrap();

    let b = engine.begin_transaction();
    assert!(b.start_timestamp() > a.start_timestamp());
    assert_eq!(table.select(&b, r), Some(b"R0".to_vec()));

    let a_commit = engine.commit(a).unwrap();
    assert!(a_commit > b.start_timestamp());
    // B keeps its snapshot after A commits
    assert_eq!(table.select(&b, r), Some(b"R0".to_vec()));

    let c = engine.begin_transaction();
    assert!(c.start_timestamp() > a_commit);
    assert_eq!(table.select(&c, r), Some(b"R1".to_vec()));

    engine.commit(b).unwrap();
    engine.commit(c).unwrap();
}

#[test]
fn test_aborted_write_never_visible_and_buffers_return() {
    let engine = engine();
    let table = engine.create_table("r");
    let r = seed(&engine, &table, b"R0");
    engine.fully_perform_gc();
    let baseline = engine.buffer_pool().allocated();

    let mut a = engine.begin_transaction();
    table.update(&mut a, r, b"R1".to_vec()).unwrap();
    assert!(engine.buffer_pool().allocated() > baseline);
    engine.abort(a).unwrap();

    let d = engine.begin_transaction();
    assert_eq!(table.select(&d, r), Some(b"R0".to_vec()));
    engine.commit(d).unwrap();

    engine.fully_perform_gc();
    assert_eq!(engine.buffer_pool().allocated(), baseline);
    assert_eq!(engine.transaction_manager().finished_count(), 0);
}

#[test]
fn test_snapshot_ignores_later_commits() {
    let engine = engine();
    let table = engine.create_table("r");
    let r = seed(&engine, &table, b"v0");

    let reader = engine.begin_read_only();
    for i in 1..=5u8 {
        let mut writer = engine.begin_transaction();
        table.update(&mut writer, r, vec![b'v', b'0' + i]).unwrap();
        let commit = engine.commit(writer).unwrap();
        assert!(commit >= reader.start_timestamp());
        assert_eq!(table.select(&reader, r), Some(b"v0".to_vec()));
    }

    let inserted = {
        let mut writer = engine.begin_transaction();
        let id = table.insert(&mut writer, b"new".to_vec()).unwrap();
        engine.commit(writer).unwrap();
        id
    };
    assert_eq!(table.select(&reader, inserted), None);
    assert_eq!(table.scan(&reader).len(), 1);
    engine.commit(reader).unwrap();

    let late = engine.begin_read_only();
    assert_eq!(table.select(&late, r), Some(b"v5".to_vec()));
    assert_eq!(table.scan(&late).len(), 2);
    engine.commit(late).unwrap();
}

#[test]
fn test_own_writes_visible_inside_transaction() {
    let engine = engine();
    let table = engine.create_table("r");
    let r = seed(&engine, &table, b"a");

    let mut txn = engine.begin_transaction();
    table.update(&mut txn, r, b"b".to_vec()).unwrap();
    assert_eq!(table.select(&txn, r), Some(b"b".to_vec()));
    table.update(&mut txn, r, b"c".to_vec()).unwrap();
    assert_eq!(table.select(&txn, r), Some(b"c".to_vec()));
    table.delete(&mut txn, r).unwrap();
    assert_eq!(table.select(&txn, r), None);
    engine.abort(txn).unwrap();

    let reader = engine.begin_transaction();
    assert_eq!(table.select(&reader, r), Some(b"a".to_vec()));
    engine.commit(reader).unwrap();
}

#[test]
fn test_write_conflict_reported_at_write_time() {
    let engine = engine();
    let table = engine.create_table("r");
    let r = seed(&engine, &table, b"0");

    let mut first = engine.begin_transaction();
    let mut second = engine.begin_transaction();
    table.update(&mut first, r, b"1".to_vec()).unwrap();

    let err = table.update(&mut second, r, b"2".to_vec()).unwrap_err();
    assert!(matches!(err, TransactionError::Conflict { record } if record == r));
    // The conflict is not retried; the loser can only abort
    assert!(matches!(engine.commit(second), Err(TransactionError::MustAbort(_))));
    engine.commit(first).unwrap();

    let reader = engine.begin_transaction();
    assert_eq!(table.select(&reader, r), Some(b"1".to_vec()));
    engine.commit(reader).unwrap();
    assert_eq!(engine.transaction_manager().stats().conflicts, 1);
}

#[test]
fn test_deleted_record_reclaimed_after_drain() {
    let engine = engine();
    let table = engine.create_table("r");
    let r = seed(&engine, &table, b"x");

    let mut deleter = engine.begin_transaction();
    table.delete(&mut deleter, r).unwrap();
    engine.commit(deleter).unwrap();

    engine.fully_perform_gc();
    assert_eq!(table.record_count(), 0);
    assert_eq!(table.version_count(), 0);
}

#[test]
fn test_old_versions_pruned_once_readers_leave() {
    let engine = engine();
    let table = engine.create_table("r");
    let r = seed(&engine, &table, b"0");

    let pinned = engine.begin_transaction();
    for i in 1..=3u8 {
        let mut writer = engine.begin_transaction();
        table.update(&mut writer, r, vec![i]).unwrap();
        engine.commit(writer).unwrap();
    }
    engine.fully_perform_gc();
    assert_eq!(table.version_count(), 4);
    assert_eq!(table.select(&pinned, r), Some(b"0".to_vec()));

    engine.commit(pinned).unwrap();
    engine.fully_perform_gc();
    assert_eq!(table.version_count(), 1);
}

fn update_then_fail(engine: &Engine, table: &Arc<DataTable>, r: RecordId) -> TxnResult<Timestamp> {
    let mut txn = engine.begin_transaction();
    table.update(&mut txn, r, b"half".to_vec())?;
    table.update(&mut txn, r + 1000, b"missing".to_vec())?;
    engine.commit(txn)
}

#[test]
fn test_context_dropped_by_error_path_is_rolled_back() {
    let engine = engine();
    let table = engine.create_table("r");
    let r = seed(&engine, &table, b"R0");
    engine.fully_perform_gc();
    let watermark_before = engine.timestamp_manager().oldest_active_timestamp();

    assert!(matches!(update_then_fail(&engine, &table, r), Err(TransactionError::RecordNotFound(_))));
    assert_eq!(engine.transaction_manager().active_count(), 0);
    assert_eq!(table.version_count(), 1);

    let mut later = engine.begin_transaction();
    table.update(&mut later, r, b"R1".to_vec()).unwrap();
    engine.commit(later).unwrap();
    assert!(engine.timestamp_manager().oldest_active_timestamp() > watermark_before);

    engine.fully_perform_gc();
    assert_eq!(engine.transaction_manager().finished_count(), 0);
    assert_eq!(engine.deferred_actions().pending_count(), 0);
    assert_eq!(engine.buffer_pool().allocated(), 0);
    assert_eq!(table.version_count(), 1);
}

