//! The URB Transfer State Machine: breaks one queued URB into the TRSM
//! invocations appropriate to its endpoint type and tracks the per-endpoint
//! data toggle.

use crate::channel::ChannelPool;
use crate::device::{Endpoint, Toggle, UsbDevice, Urb};
use crate::error::{HcdError, UrbStatus};
use crate::regs;
use crate::trsm::{Direction, EndpointKind, Pid, Trsm, TrsmOutcome, TrsmRequest};
use crate::tt::TtTable;
use crate::Platform;

/// CHSM phase, per spec.md §3: one slot per endpoint, exactly one channel
/// reserved from entry to a `*Setup`/`*Data` phase until return to `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChsmPhase {
    Idle,
    ControlSetup,
    ControlSetupWait,
    ControlData,
    ControlDataWait,
    ControlStatus,
    ControlStatusWait,
    AddressSetup,
    AddressSetupWait,
    AddressStatus,
    AddressStatusWait,
    InterruptOrBulkData,
    InterruptOrBulkDataWait,
}

/// Outcome of [`Chsm::drive`]: either still running, or the URB (if any was
/// owned by this run) reached a terminal status.
pub enum ChsmEvent {
    Running,
    Finished { urb: Option<Urb>, status: UrbStatus },
}

/// Per-endpoint URB orchestration state.
pub struct Chsm {
    pub phase: ChsmPhase,
    channel: Option<u8>,
    trsm: Option<Trsm>,
    urb: Option<Urb>,
    target_address: Option<u8>,
    status_scratch: [u8; 8],
}

impl Chsm {
    pub fn new() -> Self {
        Self {
            phase: ChsmPhase::Idle,
            channel: None,
            trsm: None,
            urb: None,
            target_address: None,
            status_scratch: [0; 8],
        }
    }

    pub fn is_idle(&self) -> bool {
        self.phase == ChsmPhase::Idle
    }

    /// The hardware channel this run currently holds, if any. Used by the
    /// controller to find which endpoint's CHSM owns a channel flagged in
    /// `HAINT` without a separate owner-index table.
    pub fn channel(&self) -> Option<u8> {
        self.channel
    }

    /// The `(hub, port)` pair this run's TRSM wants while parked in
    /// `CheckFreePort`, if any.
    pub fn pending_tt(&self) -> Option<(i8, i8)> {
        self.trsm.as_ref().and_then(|t| t.pending_tt())
    }

    /// Begins a control transfer: SETUP, optional DATA, STATUS.
    pub fn start_control(&mut self, urb: Urb) {
        self.urb = Some(urb);
        self.phase = ChsmPhase::ControlSetup;
    }

    /// Begins a single-phase interrupt or bulk transfer.
    pub fn start_interrupt_or_bulk(&mut self, urb: Urb) {
        self.urb = Some(urb);
        self.phase = ChsmPhase::InterruptOrBulkData;
    }

    /// Begins device-address enumeration: a synthesized SET_ADDRESS SETUP
    /// followed by a zero-length STATUS, no data phase.
    pub fn start_set_address(&mut self, new_address: u8) {
        self.target_address = Some(new_address);
        self.urb = Some(Urb {
            buffer: core::ptr::null_mut(),
            length: 0,
            direction_in: false,
            setup: Some([0x00, 0x05, new_address, 0x00, 0x00, 0x00, 0x00, 0x00]),
            status: None,
        });
        self.phase = ChsmPhase::AddressSetup;
    }

    /// Synthesizes the SET_ADDRESS urb that would otherwise have run and
    /// immediately completes it with `status`, without ever touching a
    /// channel or the TT table. Used when the address allocator has
    /// nothing to hand this request, so the same completion pipeline every
    /// other terminal status goes through still produces a `Finished` event
    /// instead of the caller short-circuiting on a raw `HcdError`.
    pub fn fail_set_address(&mut self, status: UrbStatus) -> ChsmEvent {
        let urb = Urb {
            buffer: core::ptr::null_mut(),
            length: 0,
            direction_in: false,
            setup: Some([0x00, 0x05, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]),
            status: Some(status),
        };
        self.phase = ChsmPhase::Idle;
        ChsmEvent::Finished { urb: Some(urb), status }
    }

    /// Advances the state machine by one dispatcher event. Callers must only
    /// invoke this for an endpoint whose channel is actually in the current
    /// halt mask (or to kick off a freshly queued URB from `Idle`); the wait
    /// phases below assume every re-entry corresponds to a real `CHHLTD`.
    pub fn drive<P: Platform>(
        &mut self,
        platform: &P,
        endpoint: &mut Endpoint,
        device: &mut UsbDevice,
        channels: &ChannelPool,
        tt: &mut TtTable,
    ) -> ChsmEvent {
        loop {
            match self.phase {
                ChsmPhase::Idle => return ChsmEvent::Running,

                ChsmPhase::ControlSetup | ChsmPhase::AddressSetup => {
                    // Points into the setup bytes stored inside `self.urb`,
                    // which outlives the whole Setup phase (cleared only in
                    // `finish`), so this stays valid across re-entries.
                    let setup_ptr = self
                        .urb
                        .as_mut()
                        .and_then(|u| u.setup.as_mut())
                        .map(|s| s.as_mut_ptr())
                        .unwrap_or(core::ptr::null_mut());
                    match self.begin_phase(
                        platform,
                        device,
                        endpoint,
                        channels,
                        Pid::Setup,
                        Direction::Out,
                        setup_ptr,
                        8,
                    ) {
                        Ok(()) => {
                            self.phase = if self.phase == ChsmPhase::ControlSetup {
                                ChsmPhase::ControlSetupWait
                            } else {
                                ChsmPhase::AddressSetupWait
                            };
                        }
                        Err(status) => return self.finish(channels, tt, status),
                    }
                }

                ChsmPhase::ControlSetupWait => {
                    match self.poll_trsm(platform, tt) {
                        None => return ChsmEvent::Running,
                        Some(TrsmOutcome::Complete { .. }) => {
                            self.release_channel(channels, tt);
                            let has_data = self.urb.as_ref().map(|u| u.length > 0).unwrap_or(false);
                            self.phase = if has_data {
                                ChsmPhase::ControlData
                            } else {
                                ChsmPhase::ControlStatus
                            };
                        }
                        Some(other) => return self.finish(channels, tt, outcome_status(other)),
                    }
                }

                ChsmPhase::AddressSetupWait => match self.poll_trsm(platform, tt) {
                    None => return ChsmEvent::Running,
                    Some(TrsmOutcome::Complete { .. }) => {
                        self.release_channel(channels, tt);
                        self.phase = ChsmPhase::AddressStatus;
                    }
                    Some(other) => return self.finish(channels, tt, outcome_status(other)),
                },

                ChsmPhase::ControlData => {
                    let (buf, len, dir_in) = {
                        let urb = self.urb.as_ref().expect("ControlData requires an urb");
                        (urb.buffer, urb.length, urb.direction_in)
                    };
                    let direction = if dir_in { Direction::In } else { Direction::Out };
                    match self.begin_phase(platform, device, endpoint, channels, Pid::Data1, direction, buf, len) {
                        Ok(()) => self.phase = ChsmPhase::ControlDataWait,
                        Err(status) => return self.finish(channels, tt, status),
                    }
                }

                ChsmPhase::ControlDataWait => match self.poll_trsm(platform, tt) {
                    None => return ChsmEvent::Running,
                    Some(TrsmOutcome::Complete { .. }) => {
                        self.release_channel(channels, tt);
                        self.phase = ChsmPhase::ControlStatus;
                    }
                    Some(other) => return self.finish(channels, tt, outcome_status(other)),
                },

                ChsmPhase::ControlStatus => {
                    let data_in = self.urb.as_ref().map(|u| u.direction_in).unwrap_or(true);
                    let has_data = self.urb.as_ref().map(|u| u.length > 0).unwrap_or(false);
                    // Status direction is opposite of the data stage, or IN for
                    // a zero-data control transfer.
                    let direction = if !has_data || !data_in { Direction::In } else { Direction::Out };
                    let scratch_ptr = self.status_scratch.as_mut_ptr();
                    match self.begin_phase(platform, device, endpoint, channels, Pid::Data1, direction, scratch_ptr, 0) {
                        Ok(()) => self.phase = ChsmPhase::ControlStatusWait,
                        Err(status) => return self.finish(channels, tt, status),
                    }
                }

                ChsmPhase::ControlStatusWait => match self.poll_trsm(platform, tt) {
                    None => return ChsmEvent::Running,
                    Some(TrsmOutcome::Complete { .. }) => {
                        self.release_channel(channels, tt);
                        return self.finish(channels, tt, UrbStatus::Success);
                    }
                    Some(other) => return self.finish(channels, tt, outcome_status(other)),
                },

                ChsmPhase::AddressStatus => {
                    let scratch_ptr = self.status_scratch.as_mut_ptr();
                    match self.begin_phase(platform, device, endpoint, channels, Pid::Data1, Direction::In, scratch_ptr, 0) {
                        Ok(()) => self.phase = ChsmPhase::AddressStatusWait,
                        Err(status) => return self.finish(channels, tt, status),
                    }
                }

                ChsmPhase::AddressStatusWait => match self.poll_trsm(platform, tt) {
                    None => return ChsmEvent::Running,
                    Some(TrsmOutcome::Complete { .. }) => {
                        self.release_channel(channels, tt);
                        if let Some(addr) = self.target_address.take() {
                            device.address = addr;
                        }
                        return self.finish(channels, tt, UrbStatus::Success);
                    }
                    Some(other) => return self.finish(channels, tt, outcome_status(other)),
                },

                ChsmPhase::InterruptOrBulkData => {
                    let (buf, len, dir_in) = {
                        let urb = self.urb.as_ref().expect("InterruptOrBulkData requires an urb");
                        (urb.buffer, urb.length, urb.direction_in)
                    };
                    let direction = if dir_in { Direction::In } else { Direction::Out };
                    let pid = match endpoint.toggle(dir_in) {
                        Toggle::Data0 => Pid::Data0,
                        Toggle::Data1 => Pid::Data1,
                    };
                    match self.begin_phase(platform, device, endpoint, channels, pid, direction, buf, len) {
                        Ok(()) => self.phase = ChsmPhase::InterruptOrBulkDataWait,
                        Err(status) => return self.finish(channels, tt, status),
                    }
                }

                ChsmPhase::InterruptOrBulkDataWait => match self.poll_trsm(platform, tt) {
                    None => return ChsmEvent::Running,
                    Some(TrsmOutcome::Complete { .. }) => {
                        let dir_in = self.urb.as_ref().map(|u| u.direction_in).unwrap_or(true);
                        let new_toggle = match self.trsm.as_ref().map(|t| t.last_pid()) {
                            Some(Pid::Data0) => Toggle::Data0,
                            Some(Pid::Data1) => Toggle::Data1,
                            _ => endpoint.toggle(dir_in).flip(),
                        };
                        endpoint.set_toggle(dir_in, new_toggle);
                        self.release_channel(channels, tt);
                        return self.finish(channels, tt, UrbStatus::Success);
                    }
                    Some(other) => return self.finish(channels, tt, outcome_status(other)),
                },
            }
        }
    }

    fn begin_phase<P: Platform>(
        &mut self,
        _platform: &P,
        device: &UsbDevice,
        endpoint: &Endpoint,
        channels: &ChannelPool,
        pid: Pid,
        direction: Direction,
        buffer: *mut u8,
        length: usize,
    ) -> Result<(), UrbStatus> {
        let channel = match channels.allocate() {
            Ok(ch) => ch,
            Err(HcdError::ChannelsExhausted) => return Err(UrbStatus::Unsuccessful),
            Err(_) => return Err(UrbStatus::Unsuccessful),
        };
        let req = TrsmRequest {
            channel,
            device_address: device.address,
            endpoint_number: endpoint.descriptor.number,
            direction,
            kind: to_endpoint_kind(endpoint),
            mps: endpoint.descriptor.max_packet_size,
            speed: device.speed,
            tt: device.tt,
            b_interval: endpoint.descriptor.b_interval,
        };
        self.channel = Some(channel);
        self.trsm = Some(Trsm::new(req, pid, buffer, length));
        Ok(())
    }

    fn poll_trsm<P: Platform>(&mut self, platform: &P, tt: &mut TtTable) -> Option<TrsmOutcome> {
        let channel = self.channel?;
        let base = platform.mmio_base();
        let regs = unsafe { regs::channel_regs(base, channel) };
        let halted = true; // the dispatcher only re-enters CHSM on a channel event
        let trsm = self.trsm.as_mut()?;
        match trsm.step(platform, regs, tt, halted) {
            TrsmOutcome::Parked => None,
            other => Some(other),
        }
    }

    fn release_channel(&mut self, channels: &ChannelPool, tt: &mut TtTable) {
        if let Some(ch) = self.channel.take() {
            tt.release(ch);
            channels.release(ch);
        }
        self.trsm = None;
    }

    fn finish(&mut self, channels: &ChannelPool, tt: &mut TtTable, status: UrbStatus) -> ChsmEvent {
        self.release_channel(channels, tt);
        self.phase = ChsmPhase::Idle;
        let mut urb = self.urb.take();
        if let Some(u) = urb.as_mut() {
            u.status = Some(status);
        }
        ChsmEvent::Finished { urb, status }
    }
}

impl Default for Chsm {
    fn default() -> Self {
        Self::new()
    }
}

fn to_endpoint_kind(endpoint: &Endpoint) -> EndpointKind {
    match endpoint.descriptor.ep_type {
        crate::device::EndpointType::Control => EndpointKind::Control,
        crate::device::EndpointType::Bulk => EndpointKind::Bulk,
        crate::device::EndpointType::Interrupt => EndpointKind::Interrupt,
    }
}

fn outcome_status(outcome: TrsmOutcome) -> UrbStatus {
    match outcome {
        TrsmOutcome::Stall => UrbStatus::Stall,
        TrsmOutcome::XactError => UrbStatus::XactError,
        TrsmOutcome::Complete { .. } | TrsmOutcome::Parked => UrbStatus::Success,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Speed, TtRef};
    use crate::regs::bits;
    use crate::timer::TimerId;
    use crate::tt::TtTable;
    use alloc::boxed::Box;
    use alloc::vec::Vec;
    use core::time::Duration;

    /// Backs the register window and one bounce buffer per channel with heap
    /// memory, the same approach as `roothub`'s and `channel`'s fakes, so
    /// `Chsm::drive` can be exercised exactly as it runs against real MMIO.
    struct FakePlatform {
        regs: Box<[u8; 0x600]>,
        bounce: Vec<Box<[u8; 8192]>>,
    }

    impl FakePlatform {
        fn new() -> Self {
            let mut bounce = Vec::new();
            for _ in 0..crate::config::NUM_CHANNELS {
                bounce.push(Box::new([0u8; 8192]));
            }
            Self {
                regs: Box::new([0u8; 0x600]),
                bounce,
            }
        }
    }

    impl Platform for FakePlatform {
        fn mmio_base(&self) -> *mut u8 {
            self.regs.as_ptr() as *mut u8
        }
        fn data_sync_barrier(&self) {}
        fn alloc_bounce_buffer(&self, channel: u8) -> (*mut u8, u32) {
            (self.bounce[channel as usize].as_ptr() as *mut u8, channel as u32 * 0x1000)
        }
        fn arm_timer(&self, _id: TimerId, _delay: Duration) {}
    }

    fn pid_hctsiz_bits(pid: Pid) -> u32 {
        match pid {
            Pid::Data0 => bits::HCTSIZ_PID_DATA0,
            Pid::Data1 => bits::HCTSIZ_PID_DATA1,
            Pid::MData => bits::HCTSIZ_PID_MDATA,
            Pid::Setup => bits::HCTSIZ_PID_SETUP,
        }
    }

    /// Simulates a clean `XFERCOMP` with `residue` bytes left undelivered,
    /// preserving whatever PID the driver last programmed into `HCTSIZ` (the
    /// no-toggle-error happy path).
    fn complete_channel(platform: &FakePlatform, channel: u8, residue: u32) {
        unsafe {
            let regs = regs::channel_regs(platform.mmio_base(), channel);
            let pid_bits = (*regs).hctsiz.read() & bits::HCTSIZ_PID_MASK;
            (*regs).hctsiz.write((residue & bits::HCTSIZ_XFERSIZE_MASK) | pid_bits);
            (*regs).hcint.write(bits::HCINT_XFERCOMP);
        }
    }

    /// Like [`complete_channel`], but overrides the PID the hardware reports,
    /// for asserting on the resulting data-toggle commit.
    fn finish_with_pid(platform: &FakePlatform, channel: u8, residue: u32, pid: Pid) {
        unsafe {
            let regs = regs::channel_regs(platform.mmio_base(), channel);
            (*regs).hctsiz.write((residue & bits::HCTSIZ_XFERSIZE_MASK) | pid_hctsiz_bits(pid));
            (*regs).hcint.write(bits::HCINT_XFERCOMP);
        }
    }

    fn ack_split(platform: &FakePlatform, channel: u8) {
        unsafe {
            let regs = regs::channel_regs(platform.mmio_base(), channel);
            (*regs).hcint.write(bits::HCINT_ACK);
        }
    }

    fn stall_channel(platform: &FakePlatform, channel: u8) {
        unsafe {
            let regs = regs::channel_regs(platform.mmio_base(), channel);
            (*regs).hcint.write(bits::HCINT_STALL);
        }
    }

    fn fill_bounce(platform: &FakePlatform, channel: u8, pattern: u8, len: usize) {
        unsafe {
            let ptr = platform.bounce[channel as usize].as_ptr() as *mut u8;
            for i in 0..len {
                *ptr.add(i) = pattern;
            }
        }
    }

    #[test]
    fn enumeration_assigns_device_address_via_set_address() {
        let platform = FakePlatform::new();
        let channels = ChannelPool::new(&platform);
        let mut tt = TtTable::new();
        let mut device = UsbDevice::new(Speed::High, None);
        let mut endpoint = Endpoint::new(0, 0, true, UsbDevice::initial_control_mps(Speed::High), 0).unwrap();
        let mut chsm = Chsm::new();

        chsm.start_set_address(5);
        assert!(matches!(
            chsm.drive(&platform, &mut endpoint, &mut device, &channels, &mut tt),
            ChsmEvent::Running
        ));

        let channel = chsm.channel().expect("setup stage holds a channel");
        complete_channel(&platform, channel, 0);
        assert!(matches!(
            chsm.drive(&platform, &mut endpoint, &mut device, &channels, &mut tt),
            ChsmEvent::Running
        ));

        let channel = chsm.channel().expect("status stage holds a channel");
        complete_channel(&platform, channel, 0);
        match chsm.drive(&platform, &mut endpoint, &mut device, &channels, &mut tt) {
            ChsmEvent::Finished { status, .. } => assert_eq!(status, UrbStatus::Success),
            ChsmEvent::Running => panic!("expected the status stage to finish"),
        }
        assert_eq!(device.address, 5);
    }

    #[test]
    fn get_descriptor_control_transfer_completes_and_copies_data() {
        let platform = FakePlatform::new();
        let channels = ChannelPool::new(&platform);
        let mut tt = TtTable::new();
        let mut device = UsbDevice::new(Speed::High, None);
        device.address = 7;
        let mut endpoint = Endpoint::new(0, 0, true, 64, 0).unwrap();
        let mut chsm = Chsm::new();

        let mut data_buf = alloc::vec![0u8; 18];
        chsm.start_control(Urb {
            buffer: data_buf.as_mut_ptr(),
            length: 18,
            direction_in: true,
            setup: Some([0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00]),
            status: None,
        });

        // SETUP stage.
        assert!(matches!(
            chsm.drive(&platform, &mut endpoint, &mut device, &channels, &mut tt),
            ChsmEvent::Running
        ));
        complete_channel(&platform, chsm.channel().unwrap(), 0);

        // DATA (IN) stage.
        assert!(matches!(
            chsm.drive(&platform, &mut endpoint, &mut device, &channels, &mut tt),
            ChsmEvent::Running
        ));
        let data_channel = chsm.channel().expect("data stage holds a channel");
        fill_bounce(&platform, data_channel, 0xAB, 18);
        complete_channel(&platform, data_channel, 0);

        // STATUS (OUT) stage.
        assert!(matches!(
            chsm.drive(&platform, &mut endpoint, &mut device, &channels, &mut tt),
            ChsmEvent::Running
        ));
        complete_channel(&platform, chsm.channel().unwrap(), 0);

        match chsm.drive(&platform, &mut endpoint, &mut device, &channels, &mut tt) {
            ChsmEvent::Finished { status, .. } => assert_eq!(status, UrbStatus::Success),
            ChsmEvent::Running => panic!("expected the status stage to finish"),
        }
        assert!(data_buf.iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn bulk_in_4096_bytes_completes_in_one_chunk_and_commits_toggle() {
        let platform = FakePlatform::new();
        let channels = ChannelPool::new(&platform);
        let mut tt = TtTable::new();
        let mut device = UsbDevice::new(Speed::High, None);
        let mut endpoint = Endpoint::new(2, 1, true, 512, 0).unwrap();
        let mut chsm = Chsm::new();

        let mut data_buf = alloc::vec![0u8; 4096];
        chsm.start_interrupt_or_bulk(Urb {
            buffer: data_buf.as_mut_ptr(),
            length: 4096,
            direction_in: true,
            setup: None,
            status: None,
        });

        assert!(matches!(
            chsm.drive(&platform, &mut endpoint, &mut device, &channels, &mut tt),
            ChsmEvent::Running
        ));
        let channel = chsm.channel().expect("bulk transfer holds a channel");
        fill_bounce(&platform, channel, 0x5A, 4096);
        finish_with_pid(&platform, channel, 0, Pid::Data1);

        match chsm.drive(&platform, &mut endpoint, &mut device, &channels, &mut tt) {
            ChsmEvent::Finished { status, .. } => assert_eq!(status, UrbStatus::Success),
            ChsmEvent::Running => panic!("expected the bulk transfer to finish in one chunk"),
        }
        assert!(data_buf.iter().all(|&b| b == 0x5A));
        assert_eq!(endpoint.toggle(true), Toggle::Data1);
        assert!(!tt.holds_reservation(channel));
        assert!(!channels.is_allocated(channel));
    }

    #[test]
    fn low_speed_interrupt_in_behind_a_tt_uses_a_split_transaction() {
        let platform = FakePlatform::new();
        let channels = ChannelPool::new(&platform);
        let mut tt = TtTable::new();
        let mut device = UsbDevice::new(Speed::Low, Some(TtRef { hub: 3, port: 2 }));
        let mut endpoint = Endpoint::new(3, 1, true, 8, 8).unwrap();
        let mut chsm = Chsm::new();

        let mut data_buf = alloc::vec![0u8; 1];
        chsm.start_interrupt_or_bulk(Urb {
            buffer: data_buf.as_mut_ptr(),
            length: 1,
            direction_in: true,
            setup: None,
            status: None,
        });

        // Start-split is issued; no free-port contention so the TT claim
        // succeeds immediately and the channel parks waiting on the hub's ACK.
        assert!(matches!(
            chsm.drive(&platform, &mut endpoint, &mut device, &channels, &mut tt),
            ChsmEvent::Running
        ));
        let channel = chsm.channel().expect("split transfer holds a channel");
        assert!(tt.holds_reservation(channel));

        // Hub ACKs the start-split; the driver immediately issues complete-split.
        ack_split(&platform, channel);
        assert!(matches!(
            chsm.drive(&platform, &mut endpoint, &mut device, &channels, &mut tt),
            ChsmEvent::Running
        ));

        // Complete-split reports the single byte delivered.
        complete_channel(&platform, channel, 0);
        match chsm.drive(&platform, &mut endpoint, &mut device, &channels, &mut tt) {
            ChsmEvent::Finished { status, .. } => assert_eq!(status, UrbStatus::Success),
            ChsmEvent::Running => panic!("expected the split transfer to finish"),
        }
        assert!(!tt.holds_reservation(channel));
    }

    #[test]
    fn second_endpoint_behind_same_tt_parks_until_the_first_releases_it() {
        let platform = FakePlatform::new();
        let channels = ChannelPool::new(&platform);
        let mut tt = TtTable::new();
        let tt_ref = TtRef { hub: 4, port: 1 };

        let mut device_a = UsbDevice::new(Speed::Full, Some(tt_ref));
        let mut endpoint_a = Endpoint::new(3, 1, true, 8, 8).unwrap();
        let mut chsm_a = Chsm::new();
        let mut buf_a = alloc::vec![0u8; 1];
        chsm_a.start_interrupt_or_bulk(Urb {
            buffer: buf_a.as_mut_ptr(),
            length: 1,
            direction_in: true,
            setup: None,
            status: None,
        });

        let mut device_b = UsbDevice::new(Speed::Full, Some(tt_ref));
        let mut endpoint_b = Endpoint::new(3, 1, true, 8, 8).unwrap();
        let mut chsm_b = Chsm::new();
        let mut buf_b = alloc::vec![0u8; 1];
        chsm_b.start_interrupt_or_bulk(Urb {
            buffer: buf_b.as_mut_ptr(),
            length: 1,
            direction_in: true,
            setup: None,
            status: None,
        });

        // `a` claims the (hub, port) pair first.
        assert!(matches!(
            chsm_a.drive(&platform, &mut endpoint_a, &mut device_a, &channels, &mut tt),
            ChsmEvent::Running
        ));
        let channel_a = chsm_a.channel().unwrap();
        assert!(tt.holds_reservation(channel_a));

        // `b` holds its own channel but parks wanting the same pair.
        assert!(matches!(
            chsm_b.drive(&platform, &mut endpoint_b, &mut device_b, &channels, &mut tt),
            ChsmEvent::Running
        ));
        assert_eq!(chsm_b.pending_tt(), Some((4, 1)));

        // `a` finishes and releases the pair.
        ack_split(&platform, channel_a);
        assert!(matches!(
            chsm_a.drive(&platform, &mut endpoint_a, &mut device_a, &channels, &mut tt),
            ChsmEvent::Running
        ));
        complete_channel(&platform, channel_a, 0);
        match chsm_a.drive(&platform, &mut endpoint_a, &mut device_a, &channels, &mut tt) {
            ChsmEvent::Finished { status, .. } => assert_eq!(status, UrbStatus::Success),
            ChsmEvent::Running => panic!("expected `a` to finish"),
        }
        assert!(!tt.holds_reservation(channel_a));

        // `b` can now claim the pair on its next drive.
        assert!(matches!(
            chsm_b.drive(&platform, &mut endpoint_b, &mut device_b, &channels, &mut tt),
            ChsmEvent::Running
        ));
        assert_eq!(chsm_b.pending_tt(), None);
    }

    #[test]
    fn fail_set_address_completes_without_touching_a_channel() {
        let channels = ChannelPool::new(&FakePlatform::new());
        let mut chsm = Chsm::new();
        match chsm.fail_set_address(UrbStatus::InsufficientResources) {
            ChsmEvent::Finished { urb, status } => {
                assert_eq!(status, UrbStatus::InsufficientResources);
                assert_eq!(urb.unwrap().status, Some(UrbStatus::InsufficientResources));
            }
            ChsmEvent::Running => panic!("fail_set_address must complete immediately"),
        }
        assert!(chsm.is_idle());
        assert_eq!(chsm.channel(), None);
        assert!(!channels.is_allocated(0));
    }

    #[test]
    fn stall_during_control_data_stage_reports_stall_and_goes_idle() {
        let platform = FakePlatform::new();
        let channels = ChannelPool::new(&platform);
        let mut tt = TtTable::new();
        let mut device = UsbDevice::new(Speed::High, None);
        device.address = 9;
        let mut endpoint = Endpoint::new(0, 0, true, 64, 0).unwrap();
        let mut chsm = Chsm::new();

        let mut data_buf = alloc::vec![0u8; 18];
        chsm.start_control(Urb {
            buffer: data_buf.as_mut_ptr(),
            length: 18,
            direction_in: true,
            setup: Some([0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00]),
            status: None,
        });

        assert!(matches!(
            chsm.drive(&platform, &mut endpoint, &mut device, &channels, &mut tt),
            ChsmEvent::Running
        ));
        complete_channel(&platform, chsm.channel().unwrap(), 0);

        assert!(matches!(
            chsm.drive(&platform, &mut endpoint, &mut device, &channels, &mut tt),
            ChsmEvent::Running
        ));
        let data_channel = chsm.channel().expect("data stage holds a channel");
        stall_channel(&platform, data_channel);

        match chsm.drive(&platform, &mut endpoint, &mut device, &channels, &mut tt) {
            ChsmEvent::Finished { status, .. } => assert_eq!(status, UrbStatus::Stall),
            ChsmEvent::Running => panic!("expected the data stage to stall"),
        }
        assert!(chsm.is_idle());
        assert!(!tt.holds_reservation(data_channel));
        assert!(!channels.is_allocated(data_channel));
    }
}
