// =============================================================================
// Exit Deduplication Gate — at most one exit initiation per position
// =============================================================================
//
// Every exit source (price ticks, reconciliation, manual/external requests)
// must claim the position here before submitting an order. The first claim
// wins; later claims see the holder's lock and back off. Locks expire after
// a fixed TTL so a stuck submission cannot block a position forever.
//
// The lock table has its own mutex, independent of the position cache and
// the order tracker.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use crate::types::{ExitType, TriggerSource};

/// A granted exit claim.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExitLock {
    pub position_id: String,
    pub trigger_source: TriggerSource,
    pub exit_type: ExitType,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ExitLock {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Result of a claim attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// Caller owns the exit and should submit the order.
    Granted(ExitLock),
    /// Somebody else is already handling this position.
    AlreadyHeld(ExitLock),
}

impl ClaimOutcome {
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted(_))
    }

    pub fn lock(&self) -> &ExitLock {
        match self {
            Self::Granted(lock) | Self::AlreadyHeld(lock) => lock,
        }
    }
}

/// Gate counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GateStats {
    pub granted: u64,
    pub denied: u64,
    pub expired: u64,
    pub active: usize,
}

/// Process-wide (per engine) exit lock table.
pub struct ExitGate {
    locks: Mutex<HashMap<String, ExitLock>>,
    ttl: Duration,
    granted: AtomicU64,
    denied: AtomicU64,
    expired: AtomicU64,
}

impl ExitGate {
    pub fn new(ttl: Duration) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            ttl,
            granted: AtomicU64::new(0),
            denied: AtomicU64::new(0),
            expired: AtomicU64::new(0),
        }
    }

    /// Try to claim the exit of `position_id`. Check and insert are atomic.
    pub fn claim(
        &self,
        position_id: &str,
        trigger_source: TriggerSource,
        exit_type: ExitType,
    ) -> ClaimOutcome {
        self.claim_at(position_id, trigger_source, exit_type, Utc::now())
    }

    pub fn claim_at(
        &self,
        position_id: &str,
        trigger_source: TriggerSource,
        exit_type: ExitType,
        now: DateTime<Utc>,
    ) -> ClaimOutcome {
        let mut locks = self.locks.lock();

        if let Some(existing) = locks.get(position_id) {
            if !existing.is_expired(now) {
                let held = existing.clone();
                drop(locks);
                self.denied.fetch_add(1, Ordering::Relaxed);
                debug!(
                    id = position_id,
                    source = %trigger_source,
                    held_by = %held.trigger_source,
                    held_type = %held.exit_type,
                    acquired_at = %held.acquired_at,
                    "exit already being handled"
                );
                return ClaimOutcome::AlreadyHeld(held);
            }
            self.expired.fetch_add(1, Ordering::Relaxed);
            info!(
                id = position_id,
                held_by = %existing.trigger_source,
                "exit lock expired — granting fresh claim"
            );
        }

        let lock = ExitLock {
            position_id: position_id.to_string(),
            trigger_source,
            exit_type,
            acquired_at: now,
            expires_at: now + self.ttl,
        };
        locks.insert(position_id.to_string(), lock.clone());
        drop(locks);

        self.granted.fetch_add(1, Ordering::Relaxed);
        info!(
            id = position_id,
            source = %trigger_source,
            exit_type = %exit_type,
            "exit claim granted"
        );
        ClaimOutcome::Granted(lock)
    }

    /// Drop the lock for a position (closed, or its exit failed).
    pub fn release(&self, position_id: &str) -> Option<ExitLock> {
        let released = self.locks.lock().remove(position_id);
        if released.is_some() {
            debug!(id = position_id, "exit lock released");
        }
        released
    }

    /// Current non-expired lock, if any.
    pub fn holder_at(&self, position_id: &str, now: DateTime<Utc>) -> Option<ExitLock> {
        self.locks
            .lock()
            .get(position_id)
            .filter(|l| !l.is_expired(now))
            .cloned()
    }

    /// Remove expired locks. Returns how many were removed.
    pub fn purge_expired_at(&self, now: DateTime<Utc>) -> usize {
        let mut locks = self.locks.lock();
        let before = locks.len();
        locks.retain(|_, l| !l.is_expired(now));
        let purged = before - locks.len();
        drop(locks);

        if purged > 0 {
            self.expired.fetch_add(purged as u64, Ordering::Relaxed);
            debug!(purged, "expired exit locks purged");
        }
        purged
    }

    pub fn stats(&self) -> GateStats {
        GateStats {
            granted: self.granted.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            active: self.locks.lock().len(),
        }
    }
}

impl std::fmt::Debug for ExitGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExitGate")
            .field("ttl_secs", &self.ttl.num_seconds())
            .field("stats", &self.stats())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
