//! The Channel Dispatcher: minimal-work ISR, full-decode DPC.
//!
//! This crate has no kernel DPC primitive to borrow, so the ISR/DPC split
//! of spec.md §4.6 is two methods the embedding host calls from whatever
//! context corresponds to each: [`Controller::on_interrupt`] for true
//! interrupt context, [`Controller::drive_channel`] for the deferred-work
//! hop (Design Note §9's "equivalent work cell per channel").

use crate::regs::{self, bits};
use crate::Platform;

/// What `on_interrupt` found, for the caller to queue as deferred work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PendingWork {
    /// `HAINT` bits that need draining via `drive_channel`.
    pub channel_mask: u32,
    pub port_change: bool,
}

/// Reads `GINTSTS` and, for a channel-halt interrupt, masks `HAINTMSK` so
/// the edge latches are suppressed while the deferred work drains —
/// exactly the minimal work spec.md §4.6 allows at interrupt level.
pub fn isr<P: Platform>(platform: &P) -> PendingWork {
    let base = platform.mmio_base();
    unsafe {
        let core_regs = regs::core_global_regs(base);
        regs::mmio_fence(platform);
        let gintsts = (*core_regs).gintsts.read();

        let mut work = PendingWork::default();

        if gintsts & bits::GINTSTS_HCINTR != 0 {
            let host_regs = regs::host_global_regs(base);
            let haint = (*host_regs).haint.read();
            (*host_regs).haintmsk.write(!haint & 0xFFFF);
            work.channel_mask = haint;
        }
        if gintsts & bits::GINTSTS_PRTINT != 0 {
            work.port_change = true;
        }
        regs::mmio_fence(platform);
        work
    }
}

/// Re-reads `GINTSTS`/`HAINT` from deferred-work context, returning the set
/// of channels whose halt the caller must drain this round.
pub fn dpc_channel_mask<P: Platform>(platform: &P) -> u32 {
    let base = platform.mmio_base();
    unsafe {
        let host_regs = regs::host_global_regs(base);
        regs::mmio_fence(platform);
        let haint = (*host_regs).haint.read();
        regs::mmio_fence(platform);
        haint & 0xFFFF
    }
}

/// Scans `[0, NUM_CHANNELS)` for the lowest-indexed channel whose TRSM is
/// parked in `CheckFreePort` wanting `(hub, port)` — the fairness rule of
/// spec.md §4.3 (scan stops at first match, lowest index wins).
pub fn find_tt_waiter(hub: i8, port: i8, pending_tt: impl Fn(u8) -> Option<(i8, i8)>, channels: u8) -> Option<u8> {
    for ch in 0..channels {
        if pending_tt(ch) == Some((hub, port)) {
            return Some(ch);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn waiter_scan_returns_lowest_index() {
        let wants = |ch: u8| -> Option<(i8, i8)> {
            match ch {
                2 => Some((1, 1)),
                5 => Some((1, 1)),
                _ => None,
            }
        };
        assert_eq!(find_tt_waiter(1, 1, wants, 8), Some(2));
    }

    #[test]
    fn waiter_scan_returns_none_without_a_match() {
        let wants = |_ch: u8| -> Option<(i8, i8)> { None };
        assert_eq!(find_tt_waiter(1, 1, wants, 8), None);
    }
}
