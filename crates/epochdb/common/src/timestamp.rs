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

//! Logical timestamps
//!
//! A [`Timestamp`] is a 64-bit value drawn from a monotonically increasing
//! counter. The top bit tags values that are not real points in time:
//! uncommitted markers (a writer's start timestamp with the tag set) and
//! read-only transaction ids (drawn from their own counter, with both the tag
//! and the read-only bit set). Because the tag is the highest bit, every
//! tagged value compares greater than every real timestamp.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Logical timestamp issued by the timestamp manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Set on every value that is not a real point in time
    pub const TAG_BIT: u64 = 1 << 63;
    /// Set together with the tag on read-only transaction ids
    pub const READ_ONLY_BIT: u64 = 1 << 62;
    /// Largest value a real timestamp may take
    pub const MAX_REAL: u64 = Self::READ_ONLY_BIT - 1;

    /// The first timestamp, used for data that predates every transaction
    pub const INITIAL: Timestamp = Timestamp(0);

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Whether this value carries the tag bit
    pub const fn is_tagged(self) -> bool {
        self.0 & Self::TAG_BIT != 0
    }

    /// Whether this value is a read-only transaction id
    pub const fn is_read_only_id(self) -> bool {
        self.is_tagged() && self.0 & Self::READ_ONLY_BIT != 0
    }

    /// The uncommitted marker a writer with this start timestamp stamps on its versions
    pub const fn uncommitted(self) -> Self {
        Self(self.0 | Self::TAG_BIT)
    }

    /// A read-only transaction id built from a value of the read-only counter
    pub const fn read_only(counter: u64) -> Self {
        Self((counter & Self::MAX_REAL) | Self::TAG_BIT | Self::READ_ONLY_BIT)
    }

    /// Strips both tag bits
    pub const fn untagged(self) -> Self {
        Self(self.0 & Self::MAX_REAL)
    }

    /// The immediately preceding timestamp, saturating at [`Timestamp::INITIAL`]
    pub const fn prev(self) -> Self {
        Self(self.0.saturating_sub(1))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_read_only_id() {
            write!(f, "ro:{}", self.untagged().0)
        } else if self.is_tagged() {
            write!(f, "~{}", self.untagged().0)
        } else {
            write!(f, "{}", self.0)
        }
    }
}
