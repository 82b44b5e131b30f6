//! Per-user charge accounting.
//!
//! Every paint or erase consumes one charge. Charges regenerate lazily:
//! nothing runs on a timer, the ledger computes how many whole
//! regeneration intervals elapsed whenever it is touched.

use std::time::{Duration, Instant};

use tracing::trace;

/// Admission policy for a session's writes.
///
/// Unlimited is an explicit mode for unauthenticated sessions, not a
/// fallthrough for a missing ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargePolicy {
    /// Consumable pool of `capacity` charges, one regained per interval.
    Metered {
        capacity: u32,
        regen_interval: Duration,
    },
    /// No accounting at all.
    Unlimited,
}

impl ChargePolicy {
    /// Default metered policy: 30 charges, one back every 10 seconds.
    #[must_use]
    pub const fn default_metered() -> Self {
        Self::Metered {
            capacity: 30,
            regen_interval: Duration::from_secs(10),
        }
    }
}

impl Default for ChargePolicy {
    fn default() -> Self {
        Self::default_metered()
    }
}

/// Regenerating charge counter for one user.
///
/// Invariant: `0 <= charges <= capacity` at every observable point.
#[derive(Debug, Clone)]
pub struct ChargeLedger {
    policy: ChargePolicy,
    charges: u32,
    last_refill: Instant,
}

impl ChargeLedger {
    /// Create a ledger starting at full capacity.
    #[must_use]
    pub fn new(policy: ChargePolicy, now: Instant) -> Self {
        let charges = match policy {
            ChargePolicy::Metered { capacity, .. } => capacity,
            ChargePolicy::Unlimited => 0,
        };
        Self {
            policy,
            charges,
            last_refill: now,
        }
    }

    /// Create a ledger with an explicit starting balance (clamped to
    /// capacity).
    #[must_use]
    pub fn with_charges(policy: ChargePolicy, charges: u32, now: Instant) -> Self {
        let mut ledger = Self::new(policy, now);
        if let ChargePolicy::Metered { capacity, .. } = policy {
            ledger.charges = charges.min(capacity);
        }
        ledger
    }

    /// Lazily regenerate charges up to `now`.
    ///
    /// `last_refill` advances by whole intervals only, so the fractional
    /// remainder of a partially elapsed interval is never lost.
    pub fn tick(&mut self, now: Instant) {
        let ChargePolicy::Metered {
            capacity,
            regen_interval,
        } = self.policy
        else {
            return;
        };
        if regen_interval.is_zero() {
            self.charges = capacity;
            self.last_refill = now;
            return;
        }

        let elapsed = now.saturating_duration_since(self.last_refill);
        let gained = (elapsed.as_nanos() / regen_interval.as_nanos()) as u64;
        if gained == 0 {
            return;
        }

        self.charges = self
            .charges
            .saturating_add(gained.min(u64::from(u32::MAX)) as u32)
            .min(capacity);

        let advance = regen_interval
            .as_nanos()
            .saturating_mul(u128::from(gained))
            .min(u128::from(u64::MAX)) as u64;
        self.last_refill += Duration::from_nanos(advance);
        trace!(gained, charges = self.charges, "Regenerated charges");
    }

    /// Try to consume one charge.
    ///
    /// Returns `false` with no side effect when the pool is empty.
    pub fn try_consume(&mut self, now: Instant) -> bool {
        if matches!(self.policy, ChargePolicy::Unlimited) {
            return true;
        }
        self.tick(now);
        if self.charges == 0 {
            return false;
        }
        self.charges -= 1;
        true
    }

    /// Return one charge, capped at capacity.
    ///
    /// Used when the store confirms an owned erase.
    pub fn refund(&mut self) {
        if let ChargePolicy::Metered { capacity, .. } = self.policy {
            self.charges = (self.charges + 1).min(capacity);
        }
    }

    /// Current balance after lazy regeneration.
    ///
    /// Unlimited sessions report `u32::MAX`.
    pub fn remaining(&mut self, now: Instant) -> u32 {
        match self.policy {
            ChargePolicy::Unlimited => u32::MAX,
            ChargePolicy::Metered { .. } => {
                self.tick(now);
                self.charges
            }
        }
    }

    /// The admission policy.
    #[must_use]
    pub const fn policy(&self) -> ChargePolicy {
        self.policy
    }
}
