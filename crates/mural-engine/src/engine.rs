//! Session engine: the single owner of all mutable sync state.
//!
//! One [`Engine`] is constructed per user session and handed to the
//! presentation layer by reference - there are no process-wide
//! singletons. It owns the local cell cache, the charge ledger, the
//! write batcher, and the reconciler, and talks to the store and bus
//! only through their traits.
//!
//! The engine itself is synchronous and poll-driven; [`SyncRuntime`] is
//! the async driver that ticks the flush deadline and pumps bus events,
//! all mutation funneling through one task.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use mural_grid::{line_cells, Addressing, Cell};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, trace, warn};

use crate::batcher::{BatcherConfig, PendingWrite, WriteBatcher};
use crate::cache::{CellCache, ChangeCallback};
use crate::cell::{CellColor, CellRecord, CellRow, Owner, Version};
use crate::charge::{ChargeLedger, ChargePolicy};
use crate::error::Result;
use crate::reconcile::{normalize, LinkState, Reconciler, ReconnectBackoff};
use crate::store::{Bounds, ChangeBus, ChangeEvent, GridStore};

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// World-to-cell projection.
    pub addressing: Addressing,
    /// Admission policy for authenticated sessions.
    pub charge_policy: ChargePolicy,
    /// Charges to restore from a previous session, if any.
    pub initial_charges: Option<u32>,
    /// Write batching parameters.
    pub batcher: BatcherConfig,
    /// Reconnect backoff for the realtime link.
    pub backoff: ReconnectBackoff,
    /// Viewport to resync on (re)connect; `None` resyncs everything.
    pub viewport: Option<Bounds>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            addressing: Addressing::default(),
            charge_policy: ChargePolicy::default(),
            initial_charges: None,
            batcher: BatcherConfig::default(),
            backoff: ReconnectBackoff::default(),
            viewport: None,
        }
    }
}

impl EngineConfig {
    /// Set the admission policy.
    #[must_use]
    pub fn with_charge_policy(mut self, policy: ChargePolicy) -> Self {
        self.charge_policy = policy;
        self
    }

    /// Restore a remaining-charge balance from a previous session.
    #[must_use]
    pub fn with_initial_charges(mut self, charges: u32) -> Self {
        self.initial_charges = Some(charges);
        self
    }

    /// Set the flush delay.
    #[must_use]
    pub fn with_flush_delay(mut self, delay: Duration) -> Self {
        self.batcher = self.batcher.with_flush_delay(delay);
        self
    }

    /// Set the resync viewport.
    #[must_use]
    pub fn with_viewport(mut self, viewport: Bounds) -> Self {
        self.viewport = Some(viewport);
        self
    }

    /// Set the world-to-cell projection.
    #[must_use]
    pub fn with_addressing(mut self, addressing: Addressing) -> Self {
        self.addressing = addressing;
        self
    }
}

/// What a flush cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Rows sent in the batched upsert.
    pub painted: usize,
    /// Owner-confirmed deletes.
    pub erased: usize,
    /// Charges returned for confirmed erases.
    pub refunded: u32,
    /// Whether any store call failed (batch dropped, no retry).
    pub failed: bool,
}

/// The collaborative grid synchronization engine for one session.
pub struct Engine {
    session: Owner,
    addressing: Addressing,
    viewport: Option<Bounds>,
    cache: CellCache,
    ledger: ChargeLedger,
    batcher: WriteBatcher,
    reconciler: Reconciler,
    store: Arc<dyn GridStore>,
    bus: Arc<dyn ChangeBus>,
    seq: u64,
    last_ts: u64,
    last_sample: Option<Cell>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("session", &self.session.id)
            .field("cache", &self.cache)
            .field("pending", &self.batcher.len())
            .field("link", &self.reconciler.state())
            .finish()
    }
}

impl Engine {
    /// Create an engine for one session.
    ///
    /// Anonymous sessions get the explicit unlimited charge mode; every
    /// other session gets the configured metered policy.
    pub fn new(
        config: EngineConfig,
        session: Owner,
        store: Arc<dyn GridStore>,
        bus: Arc<dyn ChangeBus>,
    ) -> Self {
        let policy = if session.is_anonymous() {
            ChargePolicy::Unlimited
        } else {
            config.charge_policy
        };
        let now = Instant::now();
        let ledger = match config.initial_charges {
            Some(charges) => ChargeLedger::with_charges(policy, charges, now),
            None => ChargeLedger::new(policy, now),
        };
        Self {
            session,
            addressing: config.addressing,
            viewport: config.viewport,
            cache: CellCache::new(),
            ledger,
            batcher: WriteBatcher::new(config.batcher),
            reconciler: Reconciler::new(config.backoff),
            store,
            bus,
            seq: 0,
            last_ts: 0,
            last_sample: None,
        }
    }

    /// The session identity this engine writes as.
    pub fn session(&self) -> &Owner {
        &self.session
    }

    /// The world-to-cell projection for this session.
    pub fn addressing(&self) -> Addressing {
        self.addressing
    }

    /// Register the render callback, fired once per visible cell change.
    pub fn on_cell_changed(&mut self, callback: ChangeCallback) {
        self.cache.on_cell_changed(callback);
    }

    /// Remaining charges after lazy regeneration.
    pub fn charges_remaining(&mut self) -> u32 {
        self.ledger.remaining(Instant::now())
    }

    /// Current cell record, tombstones included.
    pub fn cell(&self, cell: &Cell) -> Option<&CellRecord> {
        self.cache.get(cell)
    }

    /// Current realtime link state.
    pub fn link_state(&self) -> LinkState {
        self.reconciler.state()
    }

    /// Number of cells the cache holds, tombstones included.
    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    /// Paint a cell.
    ///
    /// Returns `false` when admission is denied (no charges); a denied
    /// paint has no effect and is not an error.
    pub fn paint(&mut self, cell: Cell, color: CellColor) -> bool {
        if color.is_erased() {
            return self.erase(cell);
        }
        self.write_local(cell, color)
    }

    /// Erase a cell (write the tombstone).
    ///
    /// Only the session's own paint can be erased; an erase of a cell
    /// someone else owns, or of a cell with no known paint, is denied
    /// before any optimistic state or charge is touched. Costs a charge
    /// like a paint; the charge comes back only once the store confirms
    /// the erased row existed and was this session's own.
    pub fn erase(&mut self, cell: Cell) -> bool {
        let owned = self
            .cache
            .get(&cell)
            .is_some_and(|record| record.owner.id == self.session.id);
        if !owned {
            trace!(%cell, "Erase denied: not this session's paint");
            return false;
        }
        self.write_local(cell, CellColor::Erased)
    }

    /// Continue a stroke to the next pointer sample.
    ///
    /// Rasterizes the line from the previous sample and paints each
    /// intermediate cell, one admission check per cell. Returns how many
    /// cells were painted. The first sample of a stroke paints only
    /// itself.
    pub fn stroke_to(&mut self, cell: Cell, color: CellColor) -> usize {
        let painted = match self.last_sample {
            None => usize::from(self.paint(cell, color)),
            Some(previous) => line_cells(previous, cell)
                .into_iter()
                .skip(1) // previous sample is already painted
                .filter(|&step| self.paint(step, color))
                .count(),
        };
        self.last_sample = Some(cell);
        painted
    }

    /// Finish the current stroke.
    pub fn end_stroke(&mut self) {
        self.last_sample = None;
    }

    /// Publish an application-level broadcast to the bus.
    pub fn broadcast(&self, payload: serde_json::Value) {
        self.bus.publish(ChangeEvent::Broadcast { payload });
    }

    /// Subscribe to the realtime bus (used by the runtime driver).
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.bus.subscribe()
    }

    /// Handle one realtime event.
    ///
    /// Normalizes it to a cell merge, suppresses self-echo against
    /// still-pending local writes, and applies it under last-writer-wins.
    /// Returns whether the cache changed.
    pub fn handle_remote_event(&mut self, event: &ChangeEvent) -> bool {
        let Some((cell, record)) = normalize(event) else {
            return false;
        };
        if record.owner.id == self.session.id
            && self.batcher.pending_version(&cell) == Some(record.version)
        {
            trace!(%cell, "Suppressed self-echo");
            return false;
        }
        self.cache.apply_remote(cell, record)
    }

    /// Run one flush cycle if the batch deadline has passed.
    ///
    /// A failed store call is logged and the affected entries are
    /// dropped, not re-enqueued: the next local edit of the same cell
    /// resends it naturally. Painting never fails from here.
    pub fn poll_flush(&mut self, now: Instant) -> FlushReport {
        let mut report = FlushReport::default();
        let Some(batch) = self.batcher.poll_flush(now) else {
            return report;
        };

        if !batch.paints.is_empty() {
            let rows = batch
                .paints
                .iter()
                .map(|write| {
                    CellRow::from_record(
                        write.cell,
                        &CellRecord::new(write.color, self.session.clone(), write.version),
                    )
                })
                .collect();
            match self.store.upsert(rows) {
                Ok(()) => report.painted = batch.paints.len(),
                Err(e) => {
                    warn!(error = %e, count = batch.paints.len(), "Flush upsert failed, dropping batch");
                    report.failed = true;
                }
            }
        }

        for write in &batch.erases {
            match self.store.delete(write.cell, &self.session.id, write.version) {
                Ok(true) => {
                    report.erased += 1;
                    if write.charge_spent {
                        self.ledger.refund();
                        report.refunded += 1;
                    }
                }
                // Not ours (or already gone): silent no-op, no refund.
                // The optimistic tombstone is rolled back to the stored
                // row, since its newer version would otherwise win every
                // later merge against the authoritative state.
                Ok(false) => {
                    debug!(cell = %write.cell, "Erase did not match an owned row");
                    self.revert_rejected_erase(write.cell, write.version);
                }
                Err(e) => {
                    warn!(error = %e, cell = %write.cell, "Flush delete failed, dropping");
                    report.failed = true;
                }
            }
        }
        report
    }

    /// Re-request the viewport's full state from the store.
    ///
    /// Required on every transition into `Connected`: events missed while
    /// disconnected are not replayed by the bus. Returns the number of
    /// cells the resync actually changed.
    pub fn resync(&mut self) -> Result<usize> {
        let rows = self.store.query(self.viewport)?;
        let mut applied = 0;
        for row in rows {
            let Some(record) = row.to_record() else {
                warn!(x = row.x, y = row.y, "Skipping stored row with malformed color");
                continue;
            };
            if self.cache.apply_remote(row.cell(), record) {
                applied += 1;
            }
        }
        debug!(applied, "Viewport resync complete");
        Ok(applied)
    }

    /// Mark the link connected and run the mandatory resync.
    pub fn handle_connected(&mut self) -> Result<usize> {
        self.reconciler.on_connected();
        self.resync()
    }

    /// Mark the link lost; returns the backoff before reconnecting.
    pub fn handle_disconnected(&mut self) -> Duration {
        self.reconciler.on_disconnected()
    }

    /// Mark a reconnect attempt in progress.
    pub fn handle_reconnecting(&mut self) {
        self.reconciler.on_reconnecting();
    }

    /// Roll back a rejected erase to whatever the store holds.
    ///
    /// Skipped when the cell no longer shows the rejected tombstone
    /// (the user has written it again since), or when the store has no
    /// row at all (a paint that collapsed into its own erase before ever
    /// flushing; the tombstone is then indistinguishable from empty).
    fn revert_rejected_erase(&mut self, cell: Cell, version: Version) {
        let still_ours = self
            .cache
            .get(&cell)
            .is_some_and(|r| r.version == version && r.owner.id == self.session.id);
        if !still_ours {
            return;
        }
        match self.store.query(Some(Bounds::new(cell, cell))) {
            Ok(rows) => {
                if let Some(record) = rows.first().and_then(|row| row.to_record()) {
                    self.cache.revert(cell, record);
                }
            }
            Err(e) => debug!(error = %e, %cell, "Rollback query failed, keeping local tombstone"),
        }
    }

    fn write_local(&mut self, cell: Cell, color: CellColor) -> bool {
        let now = Instant::now();
        let spent = match self.ledger.policy() {
            // Explicit unlimited mode: admission always passes, nothing
            // is debited, so nothing is ever refunded either.
            ChargePolicy::Unlimited => false,
            ChargePolicy::Metered { .. } => {
                if !self.ledger.try_consume(now) {
                    trace!(%cell, "Paint denied: no charges");
                    return false;
                }
                true
            }
        };

        let version = self.next_version();
        let record = CellRecord::new(color, self.session.clone(), version);
        self.cache.apply_local(cell, record);
        self.batcher.enqueue(
            PendingWrite {
                cell,
                color,
                version,
                charge_spent: spent,
            },
            now,
        );
        true
    }

    /// Next write version: wall-clock milliseconds, held monotonic
    /// against clock steps, with the per-writer sequence tiebreak.
    fn next_version(&mut self) -> Version {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(self.last_ts);
        self.last_ts = wall.max(self.last_ts);
        self.seq += 1;
        Version::new(self.last_ts, self.seq)
    }
}

/// Async driver for one engine.
///
/// Runs the flush timer and the bus subscription in a single task;
/// presentation-layer calls share the engine through the mutex, so all
/// mutation is serialized onto one logical thread. Dropping the task
/// tears down the timer and subscription; buffered-but-unflushed writes
/// are lost by design.
pub struct SyncRuntime {
    engine: Arc<tokio::sync::Mutex<Engine>>,
    flush_tick: Duration,
}

impl SyncRuntime {
    /// Create a runtime around a shared engine.
    #[must_use]
    pub fn new(engine: Arc<tokio::sync::Mutex<Engine>>) -> Self {
        Self {
            engine,
            flush_tick: Duration::from_millis(25),
        }
    }

    /// Set how often the flush deadline is polled.
    #[must_use]
    pub fn with_flush_tick(mut self, tick: Duration) -> Self {
        self.flush_tick = tick;
        self
    }

    /// Drive the engine until the task is dropped.
    ///
    /// Connect, resync, then pump flush ticks and bus events. A lagged
    /// subscription resyncs in place; a closed bus backs off and
    /// reconnects. No failure here ends the session.
    pub async fn run(self) {
        loop {
            let mut rx = {
                let engine = self.engine.lock().await;
                engine.subscribe()
            };

            match self.engine.lock().await.handle_connected() {
                Ok(applied) => info!(applied, "Connected and resynced"),
                Err(e) => {
                    warn!(error = %e, "Resync failed");
                    self.back_off().await;
                    continue;
                }
            }

            let mut ticker = tokio::time::interval(self.flush_tick);
            let closed = loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = self.engine.lock().await.poll_flush(Instant::now());
                        if report.failed {
                            warn!(?report, "Flush cycle had failures");
                        }
                    }
                    event = rx.recv() => match event {
                        Ok(event) => {
                            self.engine.lock().await.handle_remote_event(&event);
                        }
                        Err(RecvError::Lagged(missed)) => {
                            warn!(missed, "Bus subscription lagged, resyncing");
                            break false;
                        }
                        Err(RecvError::Closed) => break true,
                    }
                }
            };

            if closed {
                self.back_off().await;
            }
            // Loop re-subscribes and resyncs either way.
        }
    }

    async fn back_off(&self) {
        let delay = self.engine.lock().await.handle_disconnected();
        tokio::time::sleep(delay).await;
        self.engine.lock().await.handle_reconnecting();
    }
}
