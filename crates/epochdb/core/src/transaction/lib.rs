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

// Common types for the transaction layer

use epochdb_common::Timestamp;

use crate::storage::data_table::RecordId;
use crate::storage::record_buffer::PoolError;

/// Error types surfaced by transactional operations
#[derive(Debug, thiserror::Error)]
pub enum TransactionError {
    /// Another transaction versioned the record first; the caller must abort
    #[error("Write-write conflict on record {record}")]
    Conflict { record: RecordId },

    #[error("Transaction {0} must abort after a failed write")]
    MustAbort(Timestamp),

    #[error("Transaction {0} is read-only")]
    ReadOnly(Timestamp),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(#[from] PoolError),

    #[error("Record {0} not found")]
    RecordNotFound(RecordId),

    #[error("Invalid transaction state: {0}")]
    InvalidState(String),
}

/// Result type for transactional operations
pub type TxnResult<T> = std::result::Result<T, TransactionError>;

/// Transaction state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransactionState {
    /// Transaction is running and may read and write
    Active = 0,
    /// Commit timestamp is being assigned and published
    Committing = 1,
    /// Commit timestamp is published
    Committed = 2,
    /// Writes have been unlinked
    Aborted = 3,
}

impl TransactionState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => TransactionState::Active,
            1 => TransactionState::Committing,
            2 => TransactionState::Committed,
            3 => TransactionState::Aborted,
            other => unreachable!("invalid transaction state {other}"),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TransactionState::Committed | TransactionState::Aborted)
    }
}
