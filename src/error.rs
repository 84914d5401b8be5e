//! Typed error and URB-completion status codes.
//!
//! The teacher's crate returns `&'static str` for its handful of
//! initialization failure paths; this crate has enough distinct caller-
//! visible outcomes (channel exhaustion, address exhaustion, stalls,
//! transaction errors) that a closed enum pulls its weight instead.

use core::fmt;

/// Errors returned by the allocator, dispatcher and controller-level API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HcdError {
    /// No free hardware channel was available to start a transfer.
    ChannelsExhausted,
    /// The 127-address space is fully allocated; a new device cannot be
    /// assigned an address until one is freed.
    AddressesExhausted,
    /// The endpoint type requested is not one this driver schedules
    /// (e.g. isochronous, out of scope per this driver's design).
    InvalidEndpointType,
    /// The operation targets a port with no device attached.
    NotConnected,
    /// `GRSTCTL.csftrst` did not self-clear within the poll budget.
    ResetTimedOut,
}

impl fmt::Display for HcdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            HcdError::ChannelsExhausted => "no free hardware channel",
            HcdError::AddressesExhausted => "no free USB address",
            HcdError::InvalidEndpointType => "unsupported endpoint type",
            HcdError::NotConnected => "port has no attached device",
            HcdError::ResetTimedOut => "core soft reset did not complete",
        };
        f.write_str(msg)
    }
}

/// Final disposition of a completed (or abandoned) URB, handed back to the
/// endpoint's caller once the CHSM reaches a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrbStatus {
    /// All stages of the transfer completed and were acknowledged.
    Success,
    /// The device returned STALL on some stage of the transfer.
    Stall,
    /// Three consecutive transaction errors (CRC/timeout/bit-stuff) occurred
    /// on the same transaction without an intervening ACK.
    XactError,
    /// Some resource the request needed to even start could not be
    /// obtained — e.g. the 127-address space was exhausted before
    /// SET_ADDRESS could claim one.
    InsufficientResources,
    /// The transfer was abandoned: device disconnect or a channel halt with
    /// no recognized completion cause.
    Unsuccessful,
    /// The URB was dequeued by `EndpointQueue::abort()` before a channel
    /// ever ran it.
    Aborted,
}

impl fmt::Display for UrbStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            UrbStatus::Success => "success",
            UrbStatus::Stall => "stall",
            UrbStatus::XactError => "transaction error",
            UrbStatus::InsufficientResources => "insufficient resources",
            UrbStatus::Unsuccessful => "unsuccessful",
            UrbStatus::Aborted => "aborted",
        };
        f.write_str(msg)
    }
}
