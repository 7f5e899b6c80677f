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

/// Transaction layer
///
/// This module provides timestamp ordering and transaction lifecycles:
/// - Timestamp issuance and the active-transaction watermark
/// - Deferred actions that run once the watermark passes their tag
/// - Transaction contexts and their shared commit status
/// - Begin, commit and abort
pub mod context; // Per-transaction state
pub mod deferred_action; // Epoch-deferred cleanup
pub mod lib; // Errors and lifecycle states
pub mod manager; // Transaction lifecycles
pub mod timestamp_manager; // Timestamp authority

// Re-export main components for easier access
pub use context::{TransactionContext, TxnStatus, UndoKind, UndoRecord};
pub use deferred_action::{DeferredAction, DeferredActionManager};
pub use lib::{TransactionError, TransactionState, TxnResult};
pub use manager::{TransactionManager, TransactionStats};
pub use timestamp_manager::{ActiveTimestamp, DEFAULT_ACTIVE_SET_SHARDS, TimestampManager};
