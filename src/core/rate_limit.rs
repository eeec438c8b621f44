//! Per-source rate-limit guard
//!
//! A guard is either OPEN (requests allowed) or COOLING (requests refused
//! until a reset instant). A rejection from the remote service trips the
//! guard; the first check made after the reset instant reopens it.
//!
//! The guard is consulted before every remote request a source makes, and is
//! shared by every caller of that source.

use crate::core::error::{Result, TsukiyoError};
use serde::Serialize;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Default cooldown after the remote service answers 429
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);

/// Source of wall-clock time in epoch milliseconds
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

/// Clock backed by the system time
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self { now: AtomicI64::new(start_ms) }
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }

    pub fn set(&self, now_ms: i64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Snapshot of a guard's state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitState {
    pub limited: bool,
    pub reset_at_epoch_ms: i64,
}

/// Cooldown guard for one source
pub struct RateLimitGuard {
    source_id: String,
    cooldown: Duration,
    clock: Arc<dyn Clock>,
    state: Mutex<RateLimitState>,
}

impl std::fmt::Debug for RateLimitGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitGuard")
            .field("source_id", &self.source_id)
            .field("cooldown", &self.cooldown)
            .field("state", &self.snapshot())
            .finish()
    }
}

impl RateLimitGuard {
    /// Create an open guard using the system clock
    pub fn new(source_id: impl Into<String>, cooldown: Duration) -> Self {
        Self::with_clock(source_id, cooldown, Arc::new(SystemClock))
    }

    pub fn with_clock(source_id: impl Into<String>, cooldown: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            source_id: source_id.into(),
            cooldown,
            clock,
            state: Mutex::new(RateLimitState { limited: false, reset_at_epoch_ms: 0 }),
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    fn lock(&self) -> MutexGuard<'_, RateLimitState> {
        // State is two plain fields; a poisoned lock still holds a usable value.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Whether the source is currently cooling down. Never changes state.
    pub fn is_rate_limited(&self) -> bool {
        let state = self.lock();
        state.limited && self.clock.now_ms() < state.reset_at_epoch_ms
    }

    /// Gate a remote request.
    ///
    /// Reopens the guard once the reset instant has passed, otherwise fails
    /// with [`TsukiyoError::RateLimited`].
    pub fn check(&self) -> Result<()> {
        let mut state = self.lock();
        if !state.limited {
            return Ok(());
        }

        let now = self.clock.now_ms();
        if now >= state.reset_at_epoch_ms {
            state.limited = false;
            tracing::debug!(source = %self.source_id, "Rate limit cooldown elapsed");
            return Ok(());
        }

        Err(TsukiyoError::RateLimited {
            source_id: self.source_id.clone(),
            retry_after_ms: (state.reset_at_epoch_ms - now) as u64,
        })
    }

    /// Record a rejection from the remote service.
    ///
    /// A trip while already cooling never moves the reset instant earlier.
    pub fn trip(&self) {
        let mut state = self.lock();
        let reset_at = self.clock.now_ms() + self.cooldown.as_millis() as i64;
        let already_cooling = state.limited;
        state.limited = true;
        state.reset_at_epoch_ms = state.reset_at_epoch_ms.max(reset_at);

        tracing::warn!(
            source = %self.source_id,
            reset_at_epoch_ms = state.reset_at_epoch_ms,
            already_cooling,
            "Source rate limited by remote service"
        );
    }

    /// Feed a response status into the guard. Returns true if it tripped.
    pub fn record_status(&self, status: u16) -> bool {
        if status == 429 {
            self.trip();
            true
        } else {
            false
        }
    }

    /// Time left until the guard reopens
    pub fn remaining(&self) -> Duration {
        let state = self.lock();
        if !state.limited {
            return Duration::ZERO;
        }
        let left = state.reset_at_epoch_ms - self.clock.now_ms();
        Duration::from_millis(left.max(0) as u64)
    }

    pub fn snapshot(&self) -> RateLimitState {
        *self.lock()
    }

    /// The error a caller sees while this guard is cooling
    pub fn rate_limited_error(&self) -> TsukiyoError {
        TsukiyoError::RateLimited {
            source_id: self.source_id.clone(),
            retry_after_ms: self.remaining().as_millis() as u64,
        }
    }
}
