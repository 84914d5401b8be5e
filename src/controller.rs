//! The crate's single entry struct: owns the channel pool, TT table,
//! address space, and every attached device's CHSM slots, and re-enters
//! them from the ISR/DPC/timer entry points documented in spec.md §5.

use alloc::vec::Vec;
use spin::Mutex;

use crate::channel::ChannelPool;
use crate::chsm::{Chsm, ChsmEvent};
use crate::config::{ControllerConfig, NUM_CHANNELS};
use crate::device::{AddressBitmap, Endpoint, Speed, TtRef, UsbDevice, Urb};
use crate::dispatcher::{self, PendingWork};
use crate::error::{HcdError, UrbStatus};
use crate::regs::{self, bits};
use crate::roothub::{PortFeature, PortInfo, PortStatus, RootHub, RootHubInfo};
use crate::timer::{TimerId, TT_RESUME_DELAY};
use crate::tt::TtTable;
use crate::Platform;

/// One attached device's endpoints and their CHSM run state, held apart
/// from `UsbDevice` itself so the CHSM driver loop can borrow an endpoint
/// and the owning device independently (see [`crate::device::UsbDevice`]).
pub struct DeviceSlot {
    device: UsbDevice,
    default_endpoint: Endpoint,
    default_chsm: Chsm,
    /// Guards the default endpoint's CHSM against concurrent re-entry (a DPC
    /// and a timer firing for the same channel on different cores).
    default_reentry: Mutex<()>,
    endpoints: Vec<Endpoint>,
    chsms: Vec<Chsm>,
    reentry: Vec<Mutex<()>>,
}

impl DeviceSlot {
    fn new(speed: Speed, tt: Option<TtRef>) -> Self {
        let mps = UsbDevice::initial_control_mps(speed);
        Self {
            device: UsbDevice::new(speed, tt),
            default_endpoint: Endpoint::new(0, 0, true, mps, 0)
                .expect("control endpoint type is always valid"),
            default_chsm: Chsm::new(),
            default_reentry: Mutex::new(()),
            endpoints: Vec::new(),
            chsms: Vec::new(),
            reentry: Vec::new(),
        }
    }

    /// Adds a non-default endpoint (learned from an interface descriptor
    /// during enumeration) and its CHSM slot, returning its index.
    pub fn add_endpoint(&mut self, endpoint: Endpoint) -> usize {
        self.endpoints.push(endpoint);
        self.chsms.push(Chsm::new());
        self.reentry.push(Mutex::new(()));
        self.endpoints.len() - 1
    }

    pub fn device(&self) -> &UsbDevice {
        &self.device
    }

    pub fn default_endpoint(&self) -> &Endpoint {
        &self.default_endpoint
    }

    pub fn default_endpoint_mut(&mut self) -> &mut Endpoint {
        &mut self.default_endpoint
    }

    pub fn endpoint(&self, index: usize) -> Option<&Endpoint> {
        self.endpoints.get(index)
    }
}

/// A stable reference to an attached device's slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceHandle(usize);

/// Top-level host-controller state, generic over the embedding platform.
pub struct Controller<P: Platform> {
    platform: P,
    config: ControllerConfig,
    channels: ChannelPool,
    tt: Mutex<TtTable>,
    addresses: AddressBitmap,
    root_hub: Mutex<RootHub>,
    devices: Mutex<Vec<Option<DeviceSlot>>>,
}

impl<P: Platform> Controller<P> {
    /// Brings the core out of reset, programs host mode with DMA, and
    /// unmasks the two top-level interrupts this driver handles
    /// (`HCINTR`, `PRTINT`), per spec.md §6's `Controller_Reset`.
    pub fn new(platform: P, config: ControllerConfig) -> Result<Self, HcdError> {
        RootHub::reset_controller(&platform)?;
        unsafe {
            let core_regs = regs::core_global_regs(platform.mmio_base());
            regs::mmio_fence(&platform);
            let mut gusbcfg = (*core_regs).gusbcfg.read();
            gusbcfg &= !bits::GUSBCFG_FORCE_DEV;
            gusbcfg |= bits::GUSBCFG_FORCE_HOST;
            (*core_regs).gusbcfg.write(gusbcfg);
            (*core_regs).gahbcfg.write(bits::GAHBCFG_DMA_EN | bits::GAHBCFG_GLBL_INTR_EN);
            (*core_regs).gintmsk.write(bits::GINTSTS_HCINTR | bits::GINTSTS_PRTINT);
            regs::mmio_fence(&platform);
        }
        let channels = ChannelPool::new(&platform);
        log::info!("dwc_otg_hcd: core reset complete, host mode with DMA enabled");
        Ok(Self {
            platform,
            config,
            channels,
            tt: Mutex::new(TtTable::new()),
            addresses: AddressBitmap::new(),
            root_hub: Mutex::new(RootHub::new(config)),
            devices: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> ControllerConfig {
        self.config
    }

    pub fn root_hub_info(&self) -> RootHubInfo {
        self.root_hub.lock().get_info()
    }

    pub fn root_hub_port_info(&self) -> PortInfo {
        self.root_hub.lock().get_port_info()
    }

    pub fn port_status(&self) -> PortStatus {
        self.root_hub.lock().get_port_status(&self.platform)
    }

    pub fn set_port_feature(&self, feature: PortFeature) {
        self.root_hub.lock().set_port_feature(&self.platform, feature);
    }

    pub fn clear_port_feature(&self, feature: PortFeature) {
        self.root_hub.lock().clear_port_feature(&self.platform, feature);
    }

    pub fn frame_number(&self) -> u16 {
        self.root_hub.lock().get_frame_number(&self.platform)
    }

    /// Registers a newly connected device at address 0, reusing the lowest
    /// free slot left by a prior `detach_device`.
    pub fn attach_device(&self, speed: Speed, tt: Option<TtRef>) -> DeviceHandle {
        let mut devices = self.devices.lock();
        let slot = DeviceSlot::new(speed, tt);
        for (idx, existing) in devices.iter_mut().enumerate() {
            if existing.is_none() {
                *existing = Some(slot);
                return DeviceHandle(idx);
            }
        }
        devices.push(Some(slot));
        DeviceHandle(devices.len() - 1)
    }

    /// Tears down a device's slot and releases its USB address. Any URB
    /// already dispatched to a channel keeps running to its terminal TRSM
    /// state through that channel's own CHSM, per spec.md §5 "Cancellation";
    /// draining undispatched queue entries first is the caller's
    /// responsibility via `EndpointQueue::abort()`.
    pub fn detach_device(&self, handle: DeviceHandle) {
        let mut devices = self.devices.lock();
        if let Some(slot) = devices.get_mut(handle.0).and_then(|s| s.take()) {
            self.addresses.release(slot.device.address);
        }
    }

    /// Runs `f` against an attached device's addressing state and default
    /// endpoint.
    pub fn with_device<R>(&self, handle: DeviceHandle, f: impl FnOnce(&UsbDevice, &Endpoint) -> R) -> Option<R> {
        let devices = self.devices.lock();
        let slot = devices.get(handle.0)?.as_ref()?;
        Some(f(&slot.device, &slot.default_endpoint))
    }

    /// Runs `f` against an attached device's default control endpoint,
    /// mutably. The enumeration flow uses this to call
    /// [`Endpoint::update_max_packet_size`] once `GET_DESCRIPTOR` returns
    /// the device descriptor's real `bMaxPacketSize0`, replacing the
    /// conservative guess `DeviceSlot::new` started with.
    pub fn with_default_endpoint_mut<R>(&self, handle: DeviceHandle, f: impl FnOnce(&mut Endpoint) -> R) -> Option<R> {
        let mut devices = self.devices.lock();
        let slot = devices.get_mut(handle.0)?.as_mut()?;
        Some(f(slot.default_endpoint_mut()))
    }

    /// Updates the default endpoint's max packet size once it has been
    /// learned from the device descriptor, per spec.md §3.
    pub fn set_default_max_packet_size(&self, handle: DeviceHandle, mps: u16) -> Option<()> {
        self.with_default_endpoint_mut(handle, |ep| ep.update_max_packet_size(mps))
    }

    /// Adds a non-default endpoint to an already-attached device, learned
    /// from an interface descriptor during enumeration.
    pub fn add_endpoint(&self, handle: DeviceHandle, endpoint: Endpoint) -> Result<usize, HcdError> {
        let mut devices = self.devices.lock();
        let slot = devices
            .get_mut(handle.0)
            .and_then(|s| s.as_mut())
            .ok_or(HcdError::NotConnected)?;
        Ok(slot.add_endpoint(endpoint))
    }

    /// Claims a free USB address and starts the SET_ADDRESS sequence on the
    /// device's default control endpoint. If the address space is
    /// exhausted, the SET_ADDRESS urb is completed with
    /// `UrbStatus::InsufficientResources` through the same pipeline as any
    /// other terminal status, rather than failing the call itself.
    pub fn start_set_address(&self, handle: DeviceHandle) -> Result<(), HcdError> {
        let mut devices = self.devices.lock();
        let slot = devices
            .get_mut(handle.0)
            .and_then(|s| s.as_mut())
            .ok_or(HcdError::NotConnected)?;
        match self.addresses.allocate() {
            Ok(addr) => {
                slot.default_chsm.start_set_address(addr);
                drop(devices);
                self.pump_endpoint(handle, None);
            }
            Err(_) => {
                if let ChsmEvent::Finished { status, .. } =
                    slot.default_chsm.fail_set_address(UrbStatus::InsufficientResources)
                {
                    log::debug!("dwc_otg_hcd: urb finished with status {}", status);
                }
            }
        }
        Ok(())
    }

    /// Queues a control-transfer URB on the device's default endpoint,
    /// starting it immediately if the endpoint is idle.
    pub fn submit_control(&self, handle: DeviceHandle, urb: Urb) -> Result<(), HcdError> {
        {
            let mut devices = self.devices.lock();
            let slot = devices
                .get_mut(handle.0)
                .and_then(|s| s.as_mut())
                .ok_or(HcdError::NotConnected)?;
            if slot.default_chsm.is_idle() {
                slot.default_chsm.start_control(urb);
            } else {
                slot.default_endpoint.queue.push(urb);
            }
        }
        self.pump_endpoint(handle, None);
        Ok(())
    }

    /// Queues a bulk/interrupt-transfer URB on `handle`'s endpoint
    /// `ep_index`, starting it immediately if the endpoint is idle.
    pub fn submit_transfer(&self, handle: DeviceHandle, ep_index: usize, urb: Urb) -> Result<(), HcdError> {
        {
            let mut devices = self.devices.lock();
            let slot = devices
                .get_mut(handle.0)
                .and_then(|s| s.as_mut())
                .ok_or(HcdError::NotConnected)?;
            let chsm = slot.chsms.get_mut(ep_index).ok_or(HcdError::NotConnected)?;
            if chsm.is_idle() {
                chsm.start_interrupt_or_bulk(urb);
            } else {
                slot.endpoints
                    .get_mut(ep_index)
                    .ok_or(HcdError::NotConnected)?
                    .queue
                    .push(urb);
            }
        }
        self.pump_endpoint(handle, Some(ep_index));
        Ok(())
    }

    /// Minimal-work interrupt-context entry point (spec.md §4.6): reads
    /// `GINTSTS`, masks the halted channels' bits in `HAINTMSK`, and hands
    /// back what the caller should queue onto its deferred-work mechanism.
    pub fn on_interrupt(&self) -> PendingWork {
        dispatcher::isr(&self.platform)
    }

    /// Deferred-work entry point: drains every channel flagged in
    /// `work.channel_mask`, then re-polls the root hub's change bits if a
    /// port interrupt was also pending.
    pub fn on_deferred_work(&self, work: PendingWork) {
        let mut mask = work.channel_mask;
        while mask != 0 {
            let channel = mask.trailing_zeros() as u8;
            mask &= !(1 << channel);
            self.drive_channel(channel);
        }
        if work.port_change {
            self.root_hub.lock().on_reset_poll(&self.platform);
        }
    }

    /// Timer-expiry entry point; routes by [`TimerId`] to the root hub or
    /// back into the channel that armed the timer.
    pub fn on_timer(&self, id: TimerId) {
        match id {
            TimerId::RootHubResetPulse => {
                self.root_hub.lock().on_reset_pulse_expired(&self.platform);
            }
            TimerId::RootHubResetSafeComplete | TimerId::RootHubChangePoll => {
                self.root_hub.lock().on_reset_poll(&self.platform);
            }
            TimerId::ChannelResume(channel) => self.drive_channel(channel),
        }
    }

    /// Finds which device/endpoint's CHSM currently holds `channel` by a
    /// linear scan (at most `NUM_CHANNELS` slots, cheaper than a duplicated
    /// owner-index table) and re-enters it.
    fn drive_channel(&self, channel: u8) {
        let target = {
            let devices = self.devices.lock();
            let mut found = None;
            for (dev_idx, slot) in devices.iter().enumerate() {
                let Some(slot) = slot else { continue };
                if slot.default_chsm.channel() == Some(channel) {
                    found = Some((dev_idx, None));
                    break;
                }
                if let Some(ep_idx) = slot.chsms.iter().position(|c| c.channel() == Some(channel)) {
                    found = Some((dev_idx, Some(ep_idx)));
                    break;
                }
            }
            found
        };
        if let Some((dev_idx, ep_idx)) = target {
            self.pump_endpoint(DeviceHandle(dev_idx), ep_idx);
        }
    }

    /// Drives one endpoint's CHSM a step, then re-scans for a TT waiter
    /// that can now claim the pair this step may have released.
    fn pump_endpoint(&self, handle: DeviceHandle, ep_index: Option<usize>) {
        {
            let mut devices = self.devices.lock();
            let Some(slot) = devices.get_mut(handle.0).and_then(|s| s.as_mut()) else {
                return;
            };
            self.run_chsm(slot, ep_index);
        }
        self.wake_tt_waiters();
    }

    /// Runs `Chsm::drive` steps for the default endpoint (`ep_index = None`)
    /// or a numbered endpoint, and once a run finishes, starts the next
    /// queued URB (if any) immediately rather than waiting for an unrelated
    /// interrupt to re-enter this endpoint. Handing a finished URB's status
    /// to a completion callback is the embedding host's concern, out of this
    /// core's scope per spec.md §1; this just logs it.
    fn run_chsm(&self, slot: &mut DeviceSlot, ep_index: Option<usize>) {
        let mut tt = self.tt.lock();
        loop {
            let event = match ep_index {
                None => {
                    let _guard = slot.default_reentry.lock();
                    slot.default_chsm.drive(
                        &self.platform,
                        &mut slot.default_endpoint,
                        &mut slot.device,
                        &self.channels,
                        &mut tt,
                    )
                }
                Some(idx) => {
                    let Some(_guard) = slot.reentry.get(idx).map(|m| m.lock()) else {
                        return;
                    };
                    let endpoint = match slot.endpoints.get_mut(idx) {
                        Some(e) => e,
                        None => return,
                    };
                    let chsm = match slot.chsms.get_mut(idx) {
                        Some(c) => c,
                        None => return,
                    };
                    chsm.drive(&self.platform, endpoint, &mut slot.device, &self.channels, &mut tt)
                }
            };
            match event {
                ChsmEvent::Running => return,
                ChsmEvent::Finished { status, .. } => {
                    log::debug!("dwc_otg_hcd: urb finished with status {}", status);
                    let next = match ep_index {
                        None => slot.default_endpoint.queue.pop(),
                        Some(idx) => slot.endpoints.get_mut(idx).and_then(|e| e.queue.pop()),
                    };
                    let Some(urb) = next else { return };
                    match ep_index {
                        None => slot.default_chsm.start_control(urb),
                        Some(idx) => {
                            if let Some(chsm) = slot.chsms.get_mut(idx) {
                                chsm.start_interrupt_or_bulk(urb);
                            } else {
                                return;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Scans every channel's owning TRSM for a pending `(hub, port)` want
    /// and arms the lowest-indexed waiter's resume timer if that pair is
    /// currently unclaimed, per spec.md §4.3's fairness rule.
    fn wake_tt_waiters(&self) {
        let devices = self.devices.lock();
        let tt = self.tt.lock();
        let pending_tt = |ch: u8| -> Option<(i8, i8)> {
            for slot in devices.iter().flatten() {
                if slot.default_chsm.channel() == Some(ch) {
                    return slot.default_chsm.pending_tt();
                }
                for chsm in &slot.chsms {
                    if chsm.channel() == Some(ch) {
                        return chsm.pending_tt();
                    }
                }
            }
            None
        };
        for ch in 0..NUM_CHANNELS as u8 {
            let Some((hub, port)) = pending_tt(ch) else {
                continue;
            };
            if tt.holds_reservation(ch) {
                continue;
            }
            if dispatcher::find_tt_waiter(hub, port, pending_tt, NUM_CHANNELS as u8) == Some(ch) {
                self.platform.arm_timer(TimerId::ChannelResume(ch), TT_RESUME_DELAY);
            }
        }
    }
}
