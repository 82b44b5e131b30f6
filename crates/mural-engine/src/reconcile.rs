//! Reconciliation of realtime events with local state.
//!
//! All bus traffic funnels through one dispatch point that normalizes
//! inserts, updates, and deletes into the same cache-merge path, so every
//! event kind shares a single conflict-resolution rule. The link state
//! machine tracks connectivity: events missed while disconnected are not
//! replayed by the bus, so every transition into `Connected` demands a
//! full viewport resync from the store before incremental events can be
//! trusted again.

use std::time::Duration;

use mural_grid::Cell;
use tracing::{info, trace, warn};

use crate::cell::CellRecord;
use crate::store::ChangeEvent;

/// Connectivity of the realtime link.
///
/// `Connecting -> Connected -> (Disconnected -> Connecting)*`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Subscribing to the bus (initial state and every reconnect).
    Connecting,
    /// Incremental events are trusted.
    Connected,
    /// The bus is gone; waiting out the backoff.
    Disconnected,
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Disconnected => write!(f, "Disconnected"),
        }
    }
}

/// Bounded exponential reconnect backoff.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectBackoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl ReconnectBackoff {
    /// Create a backoff doubling from `base` up to `max`.
    #[must_use]
    pub const fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempt: 0,
        }
    }

    /// Delay before the next reconnect attempt.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self
            .base
            .saturating_mul(1u32 << self.attempt.min(16))
            .min(self.max);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Reset after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(250), Duration::from_secs(30))
    }
}

/// Link state machine for one session.
#[derive(Debug)]
pub struct Reconciler {
    state: LinkState,
    backoff: ReconnectBackoff,
}

impl Reconciler {
    /// Create a reconciler in the `Connecting` state.
    #[must_use]
    pub fn new(backoff: ReconnectBackoff) -> Self {
        Self {
            state: LinkState::Connecting,
            backoff,
        }
    }

    /// Current link state.
    #[must_use]
    pub const fn state(&self) -> LinkState {
        self.state
    }

    /// Enter `Connected`.
    ///
    /// Always returns `true`: every arrival in `Connected`, first connect
    /// and reconnect alike, requires a full viewport resync before the
    /// incremental stream is trusted.
    pub fn on_connected(&mut self) -> bool {
        if self.state != LinkState::Connected {
            info!(from = %self.state, "Realtime link connected, resync required");
        }
        self.state = LinkState::Connected;
        self.backoff.reset();
        true
    }

    /// Enter `Disconnected`; returns the delay before reconnecting.
    pub fn on_disconnected(&mut self) -> Duration {
        let delay = self.backoff.next_delay();
        warn!(delay = ?delay, "Realtime link lost, backing off");
        self.state = LinkState::Disconnected;
        delay
    }

    /// Begin a reconnect attempt.
    pub fn on_reconnecting(&mut self) {
        self.state = LinkState::Connecting;
    }
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new(ReconnectBackoff::default())
    }
}

/// Normalize a bus event into a cell merge, if it carries one.
///
/// Insert/update and delete share one conflict-resolution path: a delete
/// becomes a tombstone record at the event's version, so it can lose a
/// last-writer-wins race exactly like any other value. Broadcasts carry
/// no cell. Malformed rows are logged and dropped.
pub fn normalize(event: &ChangeEvent) -> Option<(Cell, CellRecord)> {
    match event {
        ChangeEvent::Upsert { row } => match row.to_record() {
            Some(record) => Some((row.cell(), record)),
            None => {
                warn!(x = row.x, y = row.y, "Dropping upsert with malformed color");
                None
            }
        },
        ChangeEvent::Delete { row } => Some((row.cell(), row.to_tombstone())),
        ChangeEvent::Broadcast { .. } => {
            trace!("Ignoring broadcast event");
            None
        }
    }
}
