//! Write batching for the flush pipeline.
//!
//! Local edits are buffered keyed by cell and flushed to the durable
//! store on a fixed delay, independent of how fast the pointer moves.
//! Rapid strokes can enqueue many writes per flush cycle; the map-by-key
//! buffer collapses them so only the final intent per cell is ever sent.
//!
//! The core is poll-driven: callers hand it explicit `Instant`s and drain
//! batches when the deadline passes. The async driver lives in
//! [`crate::engine::SyncRuntime`].

use std::collections::HashMap;
use std::time::{Duration, Instant};

use mural_grid::Cell;
use tracing::debug;

use crate::cell::{CellColor, Version};

/// Batcher configuration.
#[derive(Debug, Clone, Copy)]
pub struct BatcherConfig {
    /// Delay between the first buffered write and the flush.
    pub flush_delay: Duration,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            flush_delay: Duration::from_millis(120),
        }
    }
}

impl BatcherConfig {
    /// Set the flush delay.
    #[must_use]
    pub const fn with_flush_delay(mut self, delay: Duration) -> Self {
        self.flush_delay = delay;
        self
    }
}

/// A locally issued write awaiting durable confirmation.
///
/// Created on the user action, superseded in place if the cell is written
/// again before the flush, removed when its batch is drained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingWrite {
    /// Target cell.
    pub cell: Cell,
    /// New color, or the erased marker for an erase intent.
    pub color: CellColor,
    /// Version assigned at write time; also used for self-echo matching.
    pub version: Version,
    /// Whether a charge was debited for this write.
    pub charge_spent: bool,
}

/// A drained batch, partitioned the way the store consumes it.
#[derive(Debug, Default)]
pub struct FlushBatch {
    /// Paints, sent as one batched upsert.
    pub paints: Vec<PendingWrite>,
    /// Erases, sent as individual owner-scoped deletes.
    pub erases: Vec<PendingWrite>,
}

impl FlushBatch {
    /// Total writes in the batch.
    pub fn len(&self) -> usize {
        self.paints.len() + self.erases.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.paints.is_empty() && self.erases.is_empty()
    }
}

/// Buffer of pending writes with a single armed flush deadline.
#[derive(Debug)]
pub struct WriteBatcher {
    config: BatcherConfig,
    pending: HashMap<Cell, PendingWrite>,
    deadline: Option<Instant>,
}

impl WriteBatcher {
    /// Create an empty batcher.
    #[must_use]
    pub fn new(config: BatcherConfig) -> Self {
        Self {
            config,
            pending: HashMap::new(),
            deadline: None,
        }
    }

    /// Buffer a write, superseding any earlier write to the same cell.
    ///
    /// The flush deadline is armed only on the empty-to-non-empty
    /// transition; further enqueues never push it back.
    pub fn enqueue(&mut self, write: PendingWrite, now: Instant) {
        if self.pending.is_empty() {
            self.deadline = Some(now + self.config.flush_delay);
        }
        self.pending.insert(write.cell, write);
    }

    /// Drain the buffer if the flush deadline has passed.
    ///
    /// Returns `None` while the buffer is empty or the delay has not yet
    /// elapsed. Draining disarms the deadline; the next enqueue re-arms.
    pub fn poll_flush(&mut self, now: Instant) -> Option<FlushBatch> {
        let deadline = self.deadline?;
        if now < deadline {
            return None;
        }
        self.deadline = None;

        let mut batch = FlushBatch::default();
        for (_, write) in self.pending.drain() {
            if write.color.is_erased() {
                batch.erases.push(write);
            } else {
                batch.paints.push(write);
            }
        }
        debug!(
            paints = batch.paints.len(),
            erases = batch.erases.len(),
            "Drained flush batch"
        );
        Some(batch)
    }

    /// Version of the still-pending write for a cell, if any.
    ///
    /// Used for self-echo suppression: a remote event matching a pending
    /// write's version is the session's own edit reflected back.
    pub fn pending_version(&self, cell: &Cell) -> Option<Version> {
        self.pending.get(cell).map(|w| w.version)
    }

    /// Number of buffered writes.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// When the next flush is due, if one is armed.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadline
    }
}
