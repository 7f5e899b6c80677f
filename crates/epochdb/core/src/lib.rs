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

//! Multi-version transactional core
//!
//! Timestamp-ordered transactions over versioned records, with epoch-based
//! reclamation: cleanup work is deferred until every transaction that could
//! still observe the old state has finished.

pub mod engine;
pub mod gc;
pub mod storage;
pub mod transaction;

pub use engine::{Engine, EngineError, EngineResult};
pub use epochdb_common::{EngineConfig, Timestamp};
pub use gc::{GarbageCollector, GarbageCollectorThread, GcPassStats};
pub use storage::{DataTable, RecordId, is_visible};
pub use transaction::{TransactionContext, TransactionError, TransactionManager, TxnResult};
