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

/// Versioned storage
///
/// Version chains, tables of versioned records, and the pooled segments
/// transactions record their writes in.
pub mod data_table; // Tables of versioned records
pub mod record_buffer; // Undo segment pooling
pub mod version_chain; // Per-record version lists

pub use data_table::{DataTable, RecordId, TableId};
pub use record_buffer::{PoolError, PoolStats, RecordBufferSegment, RecordBufferSegmentPool, UndoBuffer};
pub use version_chain::{Version, VersionChain, is_visible};
