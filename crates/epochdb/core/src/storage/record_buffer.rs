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

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::warn;

use crate::transaction::context::UndoRecord;

/// Errors that can occur during record buffer pool operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("record buffer pool exhausted ({limit} segments checked out)")]
    Exhausted { limit: usize },
}

/// Statistics about record buffer pool usage
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub allocated_segments: usize, // Segments currently checked out
    pub cached_segments: usize,    // Released segments held for reuse
    pub peak_allocated: usize,     // Maximum number of segments checked out at once
    pub allocation_count: u64,     // Total number of successful allocations
    pub reuse_count: u64,          // Allocations served from the reuse queue
    pub release_count: u64,        // Total number of releases
    pub exhausted_count: u64,      // Allocations refused because of the size limit
}

/// A fixed-capacity block of undo records
///
/// Segments are handed out by [`RecordBufferSegmentPool::allocate`] and must be
/// given back through [`RecordBufferSegmentPool::release`].
#[derive(Debug)]
pub struct RecordBufferSegment {
    records: Vec<UndoRecord>,
    capacity: usize,
}

impl RecordBufferSegment {
    fn new(capacity: usize) -> Self {
        Self {
            records: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn has_room(&self) -> bool {
        self.records.len() < self.capacity
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn records(&self) -> &[UndoRecord] {
        &self.records
    }

    fn push(&mut self, record: UndoRecord) {
        debug_assert!(self.has_room(), "push into a full segment");
        self.records.push(record);
    }
}

struct PoolInner {
    reuse_queue: VecDeque<RecordBufferSegment>,
    stats: PoolStats,
}

/// Pool of record buffer segments shared by every transaction
///
/// `size_limit` bounds the number of segments checked out at once; `reuse_limit`
/// bounds how many released segments are cached instead of being dropped.
pub struct RecordBufferSegmentPool {
    inner: Mutex<PoolInner>,
    size_limit: AtomicUsize,
    reuse_limit: AtomicUsize,
    segment_capacity: usize,
}

impl RecordBufferSegmentPool {
    pub fn new(size_limit: usize, reuse_limit: usize, segment_capacity: usize) -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                reuse_queue: VecDeque::new(),
                stats: PoolStats::default(),
            }),
            size_limit: AtomicUsize::new(size_limit),
            reuse_limit: AtomicUsize::new(reuse_limit),
            segment_capacity: segment_capacity.max(1),
        }
    }

    pub fn size_limit(&self) -> usize {
        self.size_limit.load(Ordering::Relaxed)
    }

    pub fn reuse_limit(&self) -> usize {
        self.reuse_limit.load(Ordering::Relaxed)
    }

    pub fn segment_capacity(&self) -> usize {
        self.segment_capacity
    }

    /// Changes the checkout limit. Segments already out are unaffected.
    pub fn set_size_limit(&self, size_limit: usize) {
        self.size_limit.store(size_limit, Ordering::Relaxed);
    }

    /// Changes the reuse limit, dropping cached segments above the new bound
    pub fn set_reuse_limit(&self, reuse_limit: usize) {
        self.reuse_limit.store(reuse_limit, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        inner.reuse_queue.truncate(reuse_limit);
        inner.stats.cached_segments = inner.reuse_queue.len();
    }

    /// Checks out a segment, reusing a cached one when available
    ///
    /// # Errors
    /// * `PoolError::Exhausted` - If `size_limit` segments are already checked out
    pub fn allocate(&self) -> Result<RecordBufferSegment, PoolError> {
        let limit = self.size_limit();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        if inner.stats.allocated_segments >= limit {
            inner.stats.exhausted_count += 1;
            drop(guard);
            warn!(limit, "record buffer pool exhausted");
            return Err(PoolError::Exhausted { limit });
        }

        let segment = match inner.reuse_queue.pop_front() {
            Some(segment) => {
                inner.stats.reuse_count += 1;
                segment
            }
            None => RecordBufferSegment::new(self.segment_capacity),
        };

        let stats = &mut inner.stats;
        stats.allocated_segments += 1;
        stats.allocation_count += 1;
        stats.peak_allocated = stats.peak_allocated.max(stats.allocated_segments);
        stats.cached_segments = inner.reuse_queue.len();

        Ok(segment)
    }

    /// Returns a segment to the pool
    ///
    /// The segment's records are dropped before the pool latch is taken.
    pub fn release(&self, mut segment: RecordBufferSegment) {
        segment.records.clear();
        let reuse_limit = self.reuse_limit();

        let mut inner = self.inner.lock();
        debug_assert!(inner.stats.allocated_segments > 0, "release without a matching allocate");
        inner.stats.allocated_segments = inner.stats.allocated_segments.saturating_sub(1);
        inner.stats.release_count += 1;

        if inner.reuse_queue.len() < reuse_limit {
            inner.reuse_queue.push_back(segment);
        }
        inner.stats.cached_segments = inner.reuse_queue.len();
    }

    /// Number of segments currently checked out
    pub fn allocated(&self) -> usize {
        self.inner.lock().stats.allocated_segments
    }

    pub fn get_stats(&self) -> PoolStats {
        self.inner.lock().stats.clone()
    }
}

/// The undo records of one transaction, held in pooled segments
///
/// Every segment goes back to the pool exactly once, when the buffer is dropped.
pub struct UndoBuffer {
    pool: Arc<RecordBufferSegmentPool>,
    segments: Vec<RecordBufferSegment>,
}

impl UndoBuffer {
    pub fn new(pool: Arc<RecordBufferSegmentPool>) -> Self {
        Self { pool, segments: Vec::new() }
    }

    /// Makes sure the next [`UndoBuffer::push`] has room, checking out a segment if needed
    pub fn reserve(&mut self) -> Result<(), PoolError> {
        if self.segments.last().is_some_and(RecordBufferSegment::has_room) {
            return Ok(());
        }
        let segment = self.pool.allocate()?;
        self.segments.push(segment);
        Ok(())
    }

    /// Appends a record. Must follow a successful [`UndoBuffer::reserve`].
    pub fn push(&mut self, record: UndoRecord) {
        match self.segments.last_mut() {
            Some(segment) if segment.has_room() => segment.push(record),
            _ => unreachable!("undo record pushed without a reserved slot"),
        }
    }

    /// Records in the order they were appended
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &UndoRecord> {
        self.segments.iter().flat_map(|segment| segment.records().iter())
    }

    pub fn len(&self) -> usize {
        self.segments.iter().map(RecordBufferSegment::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.iter().all(RecordBufferSegment::is_empty)
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }
}

impl Drop for UndoBuffer {
    fn drop(&mut self) {
        for segment in self.segments.drain(..) {
            self.pool.release(segment);
        }
    }
}

impl std::fmt::Debug for UndoBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UndoBuffer").field("segments", &self.segments.len()).field("records", &self.len()).finish()
    }
}
