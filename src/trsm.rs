//! The Channel Transfer State Machine: the per-channel, register-level
//! protocol engine that programs one hardware channel and interprets its
//! halt interrupt.
//!
//! States are a flat tagged enum driven by [`Trsm::step`] rather than
//! dynamic dispatch, per the "flat value types" design note: the driver
//! loop transitions until it reaches a park state (`TransferWaiting`,
//! `CheckFreePort` with no free pair, or `Done`) and returns.

use crate::device::{Speed, TtRef};
use crate::error::UrbStatus;
use crate::regs::{self, bits, ChannelRegs};
use crate::timer::{periodic_nak_delay, TimerId};
use crate::tt::TtTable;
use crate::Platform;

/// Token type for the next packet(s) on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pid {
    Setup,
    Data0,
    Data1,
    MData,
}

impl Pid {
    fn hctsiz_bits(self) -> u32 {
        match self {
            Pid::Data0 => bits::HCTSIZ_PID_DATA0,
            Pid::Data1 => bits::HCTSIZ_PID_DATA1,
            Pid::MData => bits::HCTSIZ_PID_MDATA,
            Pid::Setup => bits::HCTSIZ_PID_SETUP,
        }
    }

    /// Decodes the PID the hardware wrote back to `HCTSIZ.pid` after a
    /// successful packet (the hardware, not software, advances the toggle).
    fn from_hctsiz_bits(raw: u32) -> Self {
        match raw & bits::HCTSIZ_PID_MASK {
            bits::HCTSIZ_PID_DATA0 => Pid::Data0,
            bits::HCTSIZ_PID_DATA1 => Pid::Data1,
            bits::HCTSIZ_PID_SETUP => Pid::Setup,
            _ => Pid::MData,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    Control,
    Bulk,
    Interrupt,
}

impl EndpointKind {
    fn hcchar_bits(self) -> u32 {
        match self {
            EndpointKind::Control => bits::HCCHAR_EPTYPE_CTRL,
            EndpointKind::Bulk => bits::HCCHAR_EPTYPE_BULK,
            EndpointKind::Interrupt => bits::HCCHAR_EPTYPE_INTR,
        }
    }
}

/// The phase a channel's protocol engine is currently in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrsmPhase {
    Init,
    CheckFreePort,
    Transferring,
    TransferWaiting,
    Done,
}

/// What the driver loop should do after a `step()` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrsmOutcome {
    /// Still running; re-enter on the next event (halt interrupt or timer).
    Parked,
    /// Terminal: `Done` reached cleanly.
    Complete { bytes_done: usize, short: bool },
    Stall,
    XactError,
}

/// Static parameters a TRSM is invoked with; these never change across a
/// run from `Init` to `Done`.
#[derive(Clone, Copy)]
pub struct TrsmRequest {
    pub channel: u8,
    pub device_address: u8,
    pub endpoint_number: u8,
    pub direction: Direction,
    pub kind: EndpointKind,
    pub mps: u16,
    pub speed: Speed,
    pub tt: Option<TtRef>,
    /// The endpoint's `bInterval`, in ms; keys the periodic NAK-rearm delay.
    /// Meaningless (and unused) for control/bulk endpoints.
    pub b_interval: u8,
}

/// Per-channel protocol state, persisting across the park points described
/// in the data model (§3 TRSM state).
pub struct Trsm {
    pub phase: TrsmPhase,
    req: TrsmRequest,
    pid: Pid,
    buffer: *mut u8,
    length: usize,
    done: usize,
    max_xfer_len: usize,
    num_packets: u32,
    xfer_len: usize,
    do_split: bool,
    complete_split: bool,
    start_split_frame: u16,
}

unsafe impl Send for Trsm {}

impl Trsm {
    /// Begins a new run in `Init`. `buffer`/`length` describe the caller's
    /// transfer buffer (already offset/shortened by the CHSM if this run
    /// follows a control-endpoint NAK restart).
    pub fn new(req: TrsmRequest, pid: Pid, buffer: *mut u8, length: usize) -> Self {
        Self {
            phase: TrsmPhase::Init,
            req,
            pid,
            buffer,
            length,
            done: 0,
            max_xfer_len: 0,
            num_packets: 0,
            xfer_len: 0,
            do_split: false,
            complete_split: false,
            start_split_frame: 0,
        }
    }

    pub fn bytes_done(&self) -> usize {
        self.done
    }

    /// The PID last observed in `HCTSIZ.pid` at a channel halt; the
    /// hardware advances this, not software. Used by the CHSM to latch the
    /// interrupt/bulk data-toggle on clean completion (spec invariant 5).
    pub fn last_pid(&self) -> Pid {
        self.pid
    }

    /// The `(hub, port)` pair this TRSM wants, when parked in
    /// `CheckFreePort` waiting for it to become free. Used by the
    /// dispatcher's release scan (spec.md §4.3).
    pub fn pending_tt(&self) -> Option<(i8, i8)> {
        if self.phase == TrsmPhase::CheckFreePort {
            self.req.tt.map(|tt_ref| (tt_ref.hub, tt_ref.port))
        } else {
            None
        }
    }

    /// Advances the state machine. `halted` is true when invoked because
    /// the channel's `CHHLTD` interrupt fired; it is ignored outside
    /// `TransferWaiting`. Returns once a park or terminal state is reached.
    pub fn step<P: Platform>(
        &mut self,
        platform: &P,
        regs: *mut ChannelRegs,
        tt: &mut TtTable,
        halted: bool,
    ) -> TrsmOutcome {
        loop {
            match self.phase {
                TrsmPhase::Init => self.enter_init(regs, platform),
                TrsmPhase::CheckFreePort => {
                    if !self.try_claim_port(tt) {
                        return TrsmOutcome::Parked;
                    }
                    self.program_split(regs, platform);
                    self.phase = TrsmPhase::Transferring;
                }
                TrsmPhase::Transferring => {
                    self.issue_transfer(regs, platform);
                    self.phase = TrsmPhase::TransferWaiting;
                    return TrsmOutcome::Parked;
                }
                TrsmPhase::TransferWaiting => {
                    if !halted {
                        return TrsmOutcome::Parked;
                    }
                    match self.decode_halt(platform, regs, tt) {
                        Some(outcome) => return outcome,
                        None => continue,
                    }
                }
                TrsmPhase::Done => {
                    return TrsmOutcome::Complete {
                        bytes_done: self.done,
                        short: false,
                    }
                }
            }
        }
    }

    fn enter_init<P: Platform>(&mut self, regs: *mut ChannelRegs, platform: &P) {
        let mps = self.req.mps.max(1) as usize;
        self.max_xfer_len = (511 * mps).min(65536);
        self.num_packets = (self.max_xfer_len / mps) as u32;
        self.max_xfer_len = self.num_packets as usize * mps;

        let low_speed = self.req.speed == Speed::Low;
        let mut hcchar = (self.req.mps as u32) & bits::HCCHAR_MPS_MASK;
        hcchar |= (self.req.endpoint_number as u32) << bits::HCCHAR_EPNUM_SHIFT;
        if self.req.direction == Direction::In {
            hcchar |= bits::HCCHAR_EPDIR_IN;
        }
        if low_speed {
            hcchar |= bits::HCCHAR_LSPDDEV;
        }
        hcchar |= self.req.kind.hcchar_bits();
        hcchar |= (self.req.device_address as u32) << bits::HCCHAR_DEVADDR_SHIFT;

        unsafe {
            regs::mmio_fence(platform);
            (*regs).hcchar.write(hcchar);
            (*regs).hcsplt.write(0);
            regs::mmio_fence(platform);
        }

        let needs_split = matches!(self.req.speed, Speed::Low | Speed::Full) && self.req.tt.is_some();
        if needs_split {
            self.do_split = true;
            self.num_packets = 1;
            self.max_xfer_len = mps;
            self.phase = TrsmPhase::CheckFreePort;
        } else {
            self.do_split = false;
            self.phase = TrsmPhase::Transferring;
        }
    }

    fn try_claim_port(&self, tt: &mut TtTable) -> bool {
        let tt_ref = self.req.tt.expect("CheckFreePort only reached when tt is Some");
        tt.try_claim(self.req.channel, tt_ref.hub, tt_ref.port)
    }

    fn program_split<P: Platform>(&mut self, regs: *mut ChannelRegs, platform: &P) {
        let tt_ref = self.req.tt.expect("split path requires a TT reference");
        let hcsplt = bits::HCSPLT_SPLTENA
            | ((tt_ref.hub as u32 & 0x7F) << bits::HCSPLT_HUBADDR_SHIFT)
            | (tt_ref.port as u32 & bits::HCSPLT_PRTADDR_MASK);
        unsafe {
            regs::mmio_fence(platform);
            (*regs).hcsplt.write(hcsplt);
            regs::mmio_fence(platform);
        }
        self.complete_split = false;
    }

    fn issue_transfer<P: Platform>(&mut self, regs: *mut ChannelRegs, platform: &P) {
        let remaining = self.length - self.done;
        self.xfer_len = remaining.min(self.max_xfer_len);
        let mps = self.req.mps.max(1) as usize;
        self.num_packets = if self.xfer_len == 0 {
            1
        } else if self.max_xfer_len > mps {
            ((self.xfer_len + mps - 1) / mps) as u32
        } else {
            1
        };

        let mut hcsplt = unsafe { (*regs).hcsplt.read() };
        if self.do_split {
            if self.complete_split {
                hcsplt |= bits::HCSPLT_COMPSPLT;
            } else {
                hcsplt &= !bits::HCSPLT_COMPSPLT;
            }
        }

        let hctsiz = (self.xfer_len as u32 & bits::HCTSIZ_XFERSIZE_MASK)
            | ((self.num_packets << bits::HCTSIZ_PKTCNT_SHIFT) & bits::HCTSIZ_PKTCNT_MASK)
            | self.pid.hctsiz_bits();

        let bounce_phys;
        unsafe {
            regs::mmio_fence(platform);
            (*regs).hcsplt.write(hcsplt);
            (*regs).hctsiz.write(hctsiz);

            let (bounce_virt, phys) = platform.alloc_bounce_buffer(self.req.channel);
            bounce_phys = phys;
            if self.req.direction == Direction::Out && self.xfer_len > 0 {
                core::ptr::copy_nonoverlapping(
                    self.buffer.add(self.done),
                    bounce_virt,
                    self.xfer_len,
                );
            }
            (*regs).hcdma.write(bounce_phys);

            (*regs).hcint.write(bits::HCINT_ALL);
            (*regs).hcintmsk.write(bits::HCINT_CHHLTD);

            let mut hcchar = (*regs).hcchar.read();
            hcchar &= !(bits::HCCHAR_MULTCNT_MASK | bits::HCCHAR_CHEN | bits::HCCHAR_CHDIS | bits::HCCHAR_ODDFRM);
            hcchar |= 1u32 << bits::HCCHAR_MULTCNT_SHIFT;
            hcchar |= bits::HCCHAR_CHEN;
            if self.req.kind == EndpointKind::Interrupt {
                let hfnum = regs::host_global_regs(platform.mmio_base());
                let frnum = (*hfnum).hfnum.read();
                if frnum & 1 == 0 {
                    hcchar |= bits::HCCHAR_ODDFRM;
                }
            }
            (*regs).hcchar.write(hcchar);
            regs::mmio_fence(platform);
        }
    }

    /// Reads and acknowledges `HCINT`, then decides the next phase per the
    /// decode table. Returns `Some` with a terminal/parked outcome, or
    /// `None` to keep looping within `step()` (e.g. another `Transferring`
    /// chunk needs issuing immediately).
    fn decode_halt<P: Platform>(
        &mut self,
        platform: &P,
        regs: *mut ChannelRegs,
        tt: &mut TtTable,
    ) -> Option<TrsmOutcome> {
        let (hcint, residue, pid_seen) = unsafe {
            regs::mmio_fence(platform);
            let hcint = (*regs).hcint.read();
            (*regs).hcint.write(bits::HCINT_ALL);
            let residue = (*regs).hctsiz.read() & bits::HCTSIZ_XFERSIZE_MASK;
            regs::mmio_fence(platform);
            (hcint, residue as usize, Pid::from_hctsiz_bits((*regs).hctsiz.read()))
        };
        self.pid = pid_seen;

        if hcint & bits::HCINT_XFERCOMP != 0 && (!self.do_split || self.complete_split) {
            let delivered = self.xfer_len.saturating_sub(residue);
            if self.req.direction == Direction::In && delivered > 0 {
                unsafe {
                    let (bounce_virt, _) = platform.alloc_bounce_buffer(self.req.channel);
                    core::ptr::copy_nonoverlapping(bounce_virt, self.buffer.add(self.done), delivered);
                }
            }
            self.done += delivered;
            let short = delivered < self.xfer_len;
            if short || self.done >= self.length {
                self.release_tt(tt);
                self.phase = TrsmPhase::Done;
                return Some(TrsmOutcome::Complete {
                    bytes_done: self.done,
                    short,
                });
            }
            self.phase = TrsmPhase::Transferring;
            return None;
        }

        if hcint & bits::HCINT_ACK != 0 && self.do_split && !self.complete_split {
            unsafe {
                let hfnum = regs::host_global_regs(platform.mmio_base());
                self.start_split_frame = (*hfnum).hfnum.read() as u16;
            }
            self.complete_split = true;
            self.phase = TrsmPhase::Transferring;
            return None;
        }

        if hcint & bits::HCINT_NYET != 0 && self.complete_split {
            let now = unsafe {
                let hfnum = regs::host_global_regs(platform.mmio_base());
                (*hfnum).hfnum.read() as u16
            };
            let elapsed = now.wrapping_sub(self.start_split_frame) & 0x3FFF;
            if elapsed > 4 {
                self.release_tt(tt);
                self.phase = TrsmPhase::Init;
                return None;
            }
            self.phase = TrsmPhase::Transferring;
            return None;
        }

        if hcint & (bits::HCINT_NAK | bits::HCINT_FRMOVRUN) != 0 {
            if self.req.kind == EndpointKind::Control {
                // Known quirk (documented, not redesigned): restarting from
                // `Init` aliases the buffer forward and shortens `Length`,
                // losing the original transfer parameters on repeated failure.
                self.buffer = unsafe { self.buffer.add(self.done) };
                self.length -= self.done;
                self.done = 0;
                self.release_tt(tt);
                self.phase = TrsmPhase::Init;
                return None;
            }
            self.release_tt(tt);
            platform.arm_timer(
                TimerId::ChannelResume(self.req.channel),
                periodic_nak_delay(self.req.b_interval),
            );
            // Parks in `Transferring`, not `TransferWaiting`: the next
            // `step()` (driven by the resume timer, not a halt) must
            // re-issue the transaction rather than decode a halt that
            // hasn't happened yet.
            self.phase = TrsmPhase::Transferring;
            return Some(TrsmOutcome::Parked);
        }

        if hcint & bits::HCINT_STALL != 0 {
            self.release_tt(tt);
            self.phase = TrsmPhase::Done;
            return Some(TrsmOutcome::Stall);
        }

        self.release_tt(tt);
        self.phase = TrsmPhase::Done;
        Some(TrsmOutcome::XactError)
    }

    /// Clears this channel's TT reservation, if it held one. The controller
    /// re-scans for a parked waiter on the freed pair after every CHSM step,
    /// so this doesn't need to notify anyone itself.
    fn release_tt(&mut self, tt: &mut TtTable) {
        tt.release(self.req.channel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(direction: Direction, kind: EndpointKind, mps: u16) -> TrsmRequest {
        TrsmRequest {
            channel: 0,
            device_address: 7,
            endpoint_number: 0,
            direction,
            kind,
            mps,
            speed: Speed::High,
            tt: None,
            b_interval: 0,
        }
    }

    #[test]
    fn init_chunking_math_caps_at_511_packets() {
        let mut trsm = Trsm::new(request(Direction::In, EndpointKind::Bulk, 512), Pid::Data1, core::ptr::null_mut(), 0);
        trsm.enter_init_test(512);
        assert_eq!(trsm.max_xfer_len, 511 * 512);
        assert_eq!(trsm.num_packets, 511);
    }

    impl Trsm {
        fn enter_init_test(&mut self, mps: usize) {
            self.max_xfer_len = (511 * mps).min(65536);
            self.num_packets = (self.max_xfer_len / mps) as u32;
            self.max_xfer_len = self.num_packets as usize * mps;
        }
    }

    #[test]
    fn bulk_in_4096_bytes_is_a_single_chunk_of_eight_packets() {
        let req = request(Direction::In, EndpointKind::Bulk, 512);
        let mut trsm = Trsm::new(req, Pid::Data1, core::ptr::null_mut(), 4096);
        trsm.max_xfer_len = 512 * 8;
        let remaining = trsm.length - trsm.done;
        trsm.xfer_len = remaining.min(trsm.max_xfer_len);
        assert_eq!(trsm.xfer_len, 4096);
        let packets = ((trsm.xfer_len + 511) / 512) as u32;
        assert_eq!(packets, 8);
    }
}
