//! Local cell cache.
//!
//! The session-owned, optimistic view of the grid. Local writes land here
//! immediately (read-your-own-write needs no network round trip); remote
//! updates merge in under last-writer-wins. The cache never removes a
//! cell for an erase - the tombstone stays so it can lose to newer paint.

use std::collections::HashMap;

use mural_grid::Cell;
use tracing::trace;

use crate::cell::CellRecord;

/// Callback invoked once per visible cell change.
pub type ChangeCallback = Box<dyn FnMut(Cell, &CellRecord) + Send>;

/// In-memory cell state for one session.
#[derive(Default)]
pub struct CellCache {
    cells: HashMap<Cell, CellRecord>,
    on_change: Option<ChangeCallback>,
}

impl std::fmt::Debug for CellCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CellCache")
            .field("cells", &self.cells.len())
            .field("has_callback", &self.on_change.is_some())
            .finish()
    }
}

impl CellCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the render callback.
    pub fn on_cell_changed(&mut self, callback: ChangeCallback) {
        self.on_change = Some(callback);
    }

    /// Apply a local paint or erase unconditionally.
    ///
    /// Fires exactly one change notification for the cell.
    pub fn apply_local(&mut self, cell: Cell, record: CellRecord) {
        self.cells.insert(cell, record);
        self.notify(cell);
    }

    /// Merge a remote update under last-writer-wins.
    ///
    /// A strictly older version is dropped silently (expected, not an
    /// error). An equal version from the same owner is a replay of a
    /// write already present: state is unchanged and no notification
    /// fires, which makes remote application idempotent. An equal
    /// version from a different owner (two writers in the same
    /// millisecond with the same sequence) breaks the tie by owner id,
    /// so every cache converges to the same winner regardless of which
    /// update it saw first. Returns whether the update was applied.
    pub fn apply_remote(&mut self, cell: Cell, record: CellRecord) -> bool {
        match self.cells.get(&cell) {
            Some(current) if record.version < current.version => {
                trace!(
                    %cell,
                    incoming = ?record.version,
                    current = ?current.version,
                    "Dropped stale remote update"
                );
                false
            }
            Some(current)
                if record.version == current.version && record.owner.id <= current.owner.id =>
            {
                trace!(%cell, version = ?record.version, "Dropped replayed or tied remote update");
                false
            }
            _ => {
                self.cells.insert(cell, record);
                self.notify(cell);
                true
            }
        }
    }

    /// Replace a cell's record outright, bypassing the version compare.
    ///
    /// Rolls back an optimistic write the store refused: the rejected
    /// local value carries a newer version than the authoritative row,
    /// so the normal merge would keep it. Notifies only when the stored
    /// record actually differs.
    pub fn revert(&mut self, cell: Cell, record: CellRecord) {
        if self.cells.get(&cell) == Some(&record) {
            return;
        }
        self.cells.insert(cell, record);
        self.notify(cell);
    }

    /// Get a cell's current record.
    pub fn get(&self, cell: &Cell) -> Option<&CellRecord> {
        self.cells.get(cell)
    }

    /// Number of cells ever written (tombstones included).
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Iterate all records.
    pub fn iter(&self) -> impl Iterator<Item = (&Cell, &CellRecord)> {
        self.cells.iter()
    }

    fn notify(&mut self, cell: Cell) {
        if let Some(callback) = self.on_change.as_mut() {
            if let Some(record) = self.cells.get(&cell) {
                callback(cell, record);
            }
        }
    }
}
