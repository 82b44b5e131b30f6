//! Mural Engine
//!
//! Collaborative grid synchronization for a shared painting canvas. Many
//! sessions paint cells of one effectively unbounded grid; each runs an
//! engine that applies its own writes optimistically, batches them to a
//! slower durable store, and merges everyone else's edits from a
//! realtime change bus under last-writer-wins.
//!
//! # Data flow
//!
//! ```text
//! pointer sample
//!   -> Addressing (mural-grid)       world -> cell
//!   -> ChargeLedger                  admission
//!   -> line_cells (mural-grid)       stroke -> cell sequence
//!   -> CellCache                     apply + render callback
//!   -> WriteBatcher                  buffer, collapse by key
//!   -> GridStore                     batched upsert / scoped delete
//!
//! ChangeBus -> Reconciler -> CellCache (apply + render)
//! ```
//!
//! # Ordering hazards
//!
//! Flush confirmations and remote events for the same cell can resume in
//! either order; the version-based merge in [`cache::CellCache`] is
//! commutative and idempotent, so arrival order never changes the
//! converged state. Rapid strokes outpacing the flush cycle collapse in
//! the batcher's map-by-key buffer, so only the final intent per cell is
//! ever sent.
//!
//! No failure in this crate ends a session: denied paints return
//! `false`, failed flushes are logged and dropped, stale updates lose
//! silently, and a lost bus reconnects with backoff plus a full viewport
//! resync.

pub mod batcher;
pub mod cache;
pub mod cell;
pub mod charge;
pub mod engine;
pub mod error;
pub mod reconcile;
pub mod store;

pub use batcher::{BatcherConfig, FlushBatch, PendingWrite, WriteBatcher};
pub use cache::CellCache;
pub use cell::{CellColor, CellRecord, CellRow, Owner, Version};
pub use charge::{ChargeLedger, ChargePolicy};
pub use engine::{Engine, EngineConfig, FlushReport, SyncRuntime};
pub use error::{Error, Result};
pub use reconcile::{LinkState, Reconciler, ReconnectBackoff};
pub use store::{Bounds, ChangeBus, ChangeEvent, GridStore, MemoryBus, MemoryStore, StoreError};
