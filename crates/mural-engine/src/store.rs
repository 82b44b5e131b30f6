//! Store and change-bus seams.
//!
//! The durable store and the realtime bus are external collaborators.
//! The engine only issues batched upserts, owner-scoped deletes, and
//! recency-ordered queries against [`GridStore`], and consumes tagged
//! events from [`ChangeBus`]. The in-memory implementations here back the
//! tests and the simulator; a production deployment substitutes its own.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use mural_grid::Cell;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;

use crate::cell::{CellRow, Version};

/// Errors surfaced by a store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store refused the write (constraint or ownership violation).
    #[error("store rejected write: {0}")]
    Rejected(String),

    /// The store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Inclusive rectangular query bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bounds {
    pub min: Cell,
    pub max: Cell,
}

impl Bounds {
    /// Create bounds covering both corners regardless of argument order.
    #[must_use]
    pub fn new(a: Cell, b: Cell) -> Self {
        Self {
            min: Cell::new(a.x.min(b.x), a.y.min(b.y)),
            max: Cell::new(a.x.max(b.x), a.y.max(b.y)),
        }
    }

    /// Whether a cell falls inside these bounds.
    #[must_use]
    pub fn contains(&self, cell: Cell) -> bool {
        cell.x >= self.min.x && cell.x <= self.max.x && cell.y >= self.min.y && cell.y <= self.max.y
    }
}

/// Durable cell storage keyed uniquely by `(x, y)`.
///
/// Calls are blocking, in the manner of an embedded KV store; async
/// drivers invoke them from their own task.
pub trait GridStore: Send + Sync {
    /// Upsert a batch of rows, keyed by coordinate.
    ///
    /// A row with `color = None` records an erasure as a value rather
    /// than removing the row; both shapes must round-trip through
    /// `query`.
    fn upsert(&self, rows: Vec<CellRow>) -> StoreResult<()>;

    /// Erase a cell's row only if `owner_id` owns it.
    ///
    /// On success the row is replaced by a tombstone stamped with
    /// `version`, so the erase carries its own write version on the bus
    /// and remains queryable for later resyncs. Returns whether an owned
    /// row existed. A delete of someone else's cell is a no-op, not an
    /// error.
    fn delete(&self, cell: Cell, owner_id: &str, version: Version) -> StoreResult<bool>;

    /// Query rows, most recent first. `None` bounds returns everything.
    fn query(&self, bounds: Option<Bounds>) -> StoreResult<Vec<CellRow>>;
}

/// Events delivered on the realtime change bus.
///
/// At-most-once per event, no ordering across cells, no replay across a
/// disconnect window.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChangeEvent {
    /// A row was inserted or updated.
    Upsert { row: CellRow },
    /// A row was deleted.
    Delete { row: CellRow },
    /// Application-level broadcast, opaque to the engine.
    Broadcast { payload: serde_json::Value },
}

/// Realtime change bus: fan-out subscription plus publish.
pub trait ChangeBus: Send + Sync {
    /// Subscribe to all future events.
    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent>;

    /// Publish an event to all subscribers. Returns the receiver count.
    fn publish(&self, event: ChangeEvent) -> usize;
}

/// In-memory broadcast bus.
#[derive(Debug, Clone)]
pub struct MemoryBus {
    tx: broadcast::Sender<ChangeEvent>,
}

impl MemoryBus {
    /// Create a bus with the given subscriber buffer depth.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl ChangeBus for MemoryBus {
    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.tx.subscribe()
    }

    fn publish(&self, event: ChangeEvent) -> usize {
        // A send error just means no subscribers are connected.
        self.tx.send(event).unwrap_or(0)
    }
}

/// In-memory store enforcing key uniqueness and owner-scoped deletes.
///
/// When constructed with a bus, every applied change is published as the
/// corresponding [`ChangeEvent`], mirroring how the production store
/// feeds the realtime channel.
pub struct MemoryStore {
    rows: Mutex<HashMap<Cell, CellRow>>,
    bus: Option<Arc<MemoryBus>>,
    unavailable: AtomicBool,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("rows", &self.rows.lock().map(|r| r.len()).unwrap_or(0))
            .field("has_bus", &self.bus.is_some())
            .finish()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create a store with no attached bus.
    #[must_use]
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
            bus: None,
            unavailable: AtomicBool::new(false),
        }
    }

    /// Create a store that publishes applied changes to `bus`.
    #[must_use]
    pub fn with_bus(bus: Arc<MemoryBus>) -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
            bus: Some(bus),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Toggle simulated unavailability (tests of flush failure).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of stored rows.
    pub fn len(&self) -> usize {
        self.rows.lock().map(|r| r.len()).unwrap_or(0)
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("simulated outage".into()))
        } else {
            Ok(())
        }
    }

    fn publish(&self, event: ChangeEvent) {
        if let Some(bus) = &self.bus {
            bus.publish(event);
        }
    }
}

impl GridStore for MemoryStore {
    fn upsert(&self, rows: Vec<CellRow>) -> StoreResult<()> {
        self.check_available()?;
        let mut map = self
            .rows
            .lock()
            .map_err(|_| StoreError::Rejected("store poisoned".into()))?;
        let count = rows.len();
        let mut events = Vec::with_capacity(count);
        for row in rows {
            // Intra-batch duplicates resolve to the batch's last value.
            map.insert(row.cell(), row.clone());
            events.push(ChangeEvent::Upsert { row });
        }
        drop(map);
        for event in events {
            self.publish(event);
        }
        debug!(count, "Upserted batch");
        Ok(())
    }

    fn delete(&self, cell: Cell, owner_id: &str, version: Version) -> StoreResult<bool> {
        self.check_available()?;
        let mut map = self
            .rows
            .lock()
            .map_err(|_| StoreError::Rejected("store poisoned".into()))?;
        let Some(row) = map.get_mut(&cell) else {
            return Ok(false);
        };
        if row.owner_id != owner_id {
            return Ok(false);
        }
        // The erase is itself a versioned write: the tombstone replaces
        // the row, keeping the paint's old version off the bus and out
        // of later queries.
        row.color = None;
        row.ts = version.timestamp_ms;
        row.seq = version.seq;
        let tombstone = row.clone();
        drop(map);
        self.publish(ChangeEvent::Delete { row: tombstone });
        Ok(true)
    }

    fn query(&self, bounds: Option<Bounds>) -> StoreResult<Vec<CellRow>> {
        self.check_available()?;
        let map = self
            .rows
            .lock()
            .map_err(|_| StoreError::Rejected("store poisoned".into()))?;
        let mut rows: Vec<CellRow> = map
            .values()
            .filter(|row| bounds.is_none_or(|b| b.contains(row.cell())))
            .cloned()
            .collect();
        rows.sort_by(|a, b| (b.ts, b.seq).cmp(&(a.ts, a.seq)));
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::{CellColor, CellRecord, Owner, Version};

    fn row(x: u32, y: u32, owner: &str, ts: u64) -> CellRow {
        CellRow::from_record(
            Cell::new(x, y),
            &CellRecord::new(
                CellColor::Rgb(1, 2, 3),
                Owner::new(owner, owner),
                Version::new(ts, 0),
            ),
        )
    }

    #[test]
    fn upsert_enforces_key_uniqueness() {
        let store = MemoryStore::new();

        store.upsert(vec![row(1, 1, "u1", 100)]).unwrap();
        store.upsert(vec![row(1, 1, "u2", 200)]).unwrap();

        let rows = store.query(None).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].owner_id, "u2");
    }

    #[test]
    fn intra_batch_duplicates_keep_last() {
        let store = MemoryStore::new();

        store
            .upsert(vec![row(1, 1, "u1", 100), row(1, 1, "u1", 150)])
            .unwrap();

        let rows = store.query(None).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].ts, 150);
    }

    #[test]
    fn delete_is_owner_scoped() {
        let store = MemoryStore::new();
        store.upsert(vec![row(1, 1, "u1", 100)]).unwrap();

        // Someone else's delete is a silent no-op.
        assert!(!store.delete(Cell::new(1, 1), "u2", Version::new(200, 0)).unwrap());
        assert_eq!(store.query(None).unwrap()[0].color.as_deref(), Some("#010203"));

        assert!(store.delete(Cell::new(1, 1), "u1", Version::new(200, 0)).unwrap());

        // Deleting a missing row is also a no-op.
        assert!(!store.delete(Cell::new(9, 9), "u1", Version::new(300, 0)).unwrap());
    }

    #[test]
    fn delete_leaves_a_queryable_tombstone_at_the_erase_version() {
        let store = MemoryStore::new();
        store.upsert(vec![row(1, 1, "u1", 100)]).unwrap();

        assert!(store.delete(Cell::new(1, 1), "u1", Version::new(250, 3)).unwrap());

        // The tombstone row survives so a later resync can serve it,
        // and it carries the erase's own version, not the paint's.
        let rows = store.query(None).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].color, None);
        assert_eq!(rows[0].version(), Version::new(250, 3));
    }

    #[test]
    fn query_orders_by_recency_and_respects_bounds() {
        let store = MemoryStore::new();
        store
            .upsert(vec![
                row(0, 0, "u1", 100),
                row(5, 5, "u1", 300),
                row(9, 9, "u1", 200),
            ])
            .unwrap();

        let all = store.query(None).unwrap();
        let stamps: Vec<u64> = all.iter().map(|r| r.ts).collect();
        assert_eq!(stamps, vec![300, 200, 100]);

        let bounded = store
            .query(Some(Bounds::new(Cell::new(4, 4), Cell::new(9, 9))))
            .unwrap();
        assert_eq!(bounded.len(), 2);
    }

    #[test]
    fn unavailable_store_errors() {
        let store = MemoryStore::new();
        store.set_unavailable(true);

        assert!(store.upsert(vec![row(1, 1, "u1", 100)]).is_err());
        assert!(store.query(None).is_err());

        store.set_unavailable(false);
        assert!(store.upsert(vec![row(1, 1, "u1", 100)]).is_ok());
    }

    #[tokio::test]
    async fn store_changes_reach_the_bus() {
        let bus = Arc::new(MemoryBus::default());
        let store = MemoryStore::with_bus(Arc::clone(&bus));
        let mut rx = bus.subscribe();

        store.upsert(vec![row(1, 1, "u1", 100)]).unwrap();
        store.delete(Cell::new(1, 1), "u1", Version::new(200, 0)).unwrap();

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, ChangeEvent::Upsert { .. }));
        match rx.recv().await.unwrap() {
            ChangeEvent::Delete { row } => {
                assert_eq!(row.owner_id, "u1");
                // The event is stamped with the erase version so peers
                // holding the paint apply it under last-writer-wins.
                assert_eq!(row.version(), Version::new(200, 0));
            }
            other => panic!("expected delete event, got {other:?}"),
        }
    }

    #[test]
    fn event_serialization_is_tagged() {
        let event = ChangeEvent::Delete {
            row: row(1, 2, "u1", 100),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"delete\""));

        let parsed: ChangeEvent = serde_json::from_str(&json).unwrap();
        assert!(matches!(parsed, ChangeEvent::Delete { .. }));
    }
}
