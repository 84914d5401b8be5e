//! The one-shot timer seam and the fixed delays the core arms against it.
//!
//! The source this crate generalizes arms kernel `EX_TIMER`/DPC objects
//! directly; here that becomes a single [`Platform::arm_timer`] call keyed
//! by a [`TimerId`] so the embedding host can route expiry back into
//! [`crate::controller::Controller::on_timer`] however its own scheduler works.

use core::time::Duration;

/// Identifies which pending wait a timer expiry should resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerId {
    /// Per-channel NAK rearm or post-start-split resume, carrying the channel number.
    ChannelResume(u8),
    /// Root-hub 50 ms reset-pulse timer.
    RootHubResetPulse,
    /// Root-hub re-poll after reset de-assertion, before declaring the port stable.
    RootHubResetSafeComplete,
    /// Root-hub 10 ms change-bit poll, bounded by [`crate::config::RESET_CHANGE_TIMEOUT_MS`].
    RootHubChangePoll,
}

/// Delay used to resume a TRSM parked in `CheckFreePort` once the TT pair it
/// wants becomes free.
pub const TT_RESUME_DELAY: Duration = Duration::from_micros(50);

/// Duration the root hub asserts `PRTRST` for.
pub const ROOT_HUB_RESET_PULSE: Duration = Duration::from_millis(50);

/// Poll interval used while waiting for a change bit after reset de-assertion.
pub const ROOT_HUB_CHANGE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Computes the NAK-rearm delay for an interrupt endpoint's `bInterval`.
pub fn periodic_nak_delay(b_interval_ms: u8) -> Duration {
    Duration::from_millis(b_interval_ms as u64)
}
