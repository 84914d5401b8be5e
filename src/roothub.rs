//! The single downstream root-hub port: HPRT0 decode, USB 2.0 hub-class
//! status/feature translation, and the two-timer reset sequence.
//!
//! This core exposes exactly one port, so there is no hub descriptor tree to
//! walk; `RootHub` just mediates between `HPRT0`'s bitfield and the
//! connect/enable/reset/suspend vocabulary a USB hub driver expects.

use crate::config::{ControllerConfig, RESET_CHANGE_TIMEOUT_MS};
use crate::error::HcdError;
use crate::regs::{self, bits};
use crate::timer::{TimerId, ROOT_HUB_CHANGE_POLL_INTERVAL, ROOT_HUB_RESET_PULSE};
use crate::Platform;

/// Hub-class port feature selectors this driver implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortFeature {
    Enable,
    Suspend,
    Reset,
    Power,
    CConnection,
    CEnable,
    COverCurrent,
    CReset,
}

/// Controller family reported by `RootHub_GetInfo`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerType {
    SoftXhci,
}

/// Static facts about this host controller, reported once at attach time.
#[derive(Debug, Clone, Copy)]
pub struct RootHubInfo {
    pub controller_type: ControllerType,
    pub num_ports: u8,
    pub high_speed_capable: bool,
    /// Number of SuperSpeed (USB 3.x) ports. Always 0 on this core.
    pub ports30: u8,
    /// U1 exit latency, in microseconds.
    pub u1_exit_latency_us: u32,
    /// U2 exit latency, in microseconds.
    pub u2_exit_latency_us: u32,
}

/// One root-hub port's topology facts, reported by `RootHub_Get20PortInfo`.
/// This core exposes exactly one port, so there is exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortInfo {
    pub port: u8,
    pub removable: bool,
    /// Whether an integrated (on-die) hub sits behind this port.
    pub integrated_hub: bool,
    /// Maximum hub nesting depth this core schedules split transactions
    /// for, per spec.md's topology bound.
    pub hub_depth: u8,
}

/// A snapshot of `HPRT0`, decoded into hub-class status and change bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PortStatus {
    pub connected: bool,
    pub enabled: bool,
    pub suspended: bool,
    pub over_current: bool,
    pub reset: bool,
    pub powered: bool,
    pub high_speed: bool,
    pub low_speed: bool,
    pub c_connected: bool,
    pub c_enabled: bool,
    pub c_over_current: bool,
    pub c_reset: bool,
}

/// Root-hub state machine: one port, one reset sequence in flight at a time.
pub struct RootHub {
    config: ControllerConfig,
    /// Latched by the reset-pulse/poll sequence; cleared by `C_PORT_RESET`.
    reset_change: bool,
    reset_poll_elapsed_ms: u32,
}

impl RootHub {
    pub fn new(config: ControllerConfig) -> Self {
        Self {
            config,
            reset_change: false,
            reset_poll_elapsed_ms: 0,
        }
    }

    pub fn get_info(&self) -> RootHubInfo {
        RootHubInfo {
            controller_type: ControllerType::SoftXhci,
            num_ports: 1,
            high_speed_capable: self.config.high_speed_capable,
            ports30: 0,
            u1_exit_latency_us: 10_000,
            u2_exit_latency_us: 10_000,
        }
    }

    /// Topology facts for the one downstream port this core exposes.
    pub fn get_port_info(&self) -> PortInfo {
        PortInfo {
            port: 1,
            removable: false,
            integrated_hub: false,
            hub_depth: 4,
        }
    }

    pub fn get_frame_number<P: Platform>(&self, platform: &P) -> u16 {
        unsafe {
            let host_regs = regs::host_global_regs(platform.mmio_base());
            regs::mmio_fence(platform);
            ((*host_regs).hfnum.read() & bits::HFNUM_FRNUM_MASK) as u16
        }
    }

    pub fn get_port_status<P: Platform>(&self, platform: &P) -> PortStatus {
        let raw = self.read_hprt(platform);
        let speed = (raw & bits::HPRT_PRTSPD_MASK) >> bits::HPRT_PRTSPD_SHIFT;
        PortStatus {
            connected: raw & bits::HPRT_PRTCONNSTS != 0,
            enabled: raw & bits::HPRT_PRTENA != 0,
            suspended: raw & bits::HPRT_PRTSUSP != 0,
            over_current: raw & bits::HPRT_PRTOVRCURRACT != 0,
            reset: raw & bits::HPRT_PRTRST != 0,
            powered: raw & bits::HPRT_PRTPWR != 0,
            high_speed: speed == 0,
            low_speed: speed == 2,
            c_connected: raw & bits::HPRT_PRTCONNDET != 0,
            c_enabled: raw & bits::HPRT_PRTENCHNG != 0,
            c_over_current: raw & bits::HPRT_PRTOVRCURRCHNG != 0,
            c_reset: self.reset_change,
        }
    }

    pub fn set_port_feature<P: Platform>(&mut self, platform: &P, feature: PortFeature) {
        match feature {
            PortFeature::Reset => self.start_reset(platform),
            PortFeature::Suspend => self.write_hprt_bit(platform, bits::HPRT_PRTSUSP, true),
            PortFeature::Power => self.write_hprt_bit(platform, bits::HPRT_PRTPWR, true),
            PortFeature::Enable | PortFeature::CConnection | PortFeature::CEnable | PortFeature::COverCurrent | PortFeature::CReset => {
                log::warn!("SET_PORT_FEATURE({:?}) is not settable by software", feature);
            }
        }
    }

    pub fn clear_port_feature<P: Platform>(&mut self, platform: &P, feature: PortFeature) {
        match feature {
            PortFeature::Enable => self.write_hprt_bit(platform, bits::HPRT_PRTENA, true),
            PortFeature::Suspend => self.write_hprt_bit(platform, bits::HPRT_PRTSUSP, false),
            PortFeature::Power => self.write_hprt_bit(platform, bits::HPRT_PRTPWR, false),
            PortFeature::CConnection => self.ack_hprt_w1c(platform, bits::HPRT_PRTCONNDET),
            PortFeature::CEnable => self.ack_hprt_w1c(platform, bits::HPRT_PRTENCHNG),
            PortFeature::COverCurrent => self.ack_hprt_w1c(platform, bits::HPRT_PRTOVRCURRCHNG),
            PortFeature::CReset => self.reset_change = false,
            PortFeature::Reset => {
                log::warn!("CLEAR_PORT_FEATURE(PORT_RESET) is not a hub-class request");
            }
        }
    }

    /// Begins the two-timer reset sequence: assert `PRTRST`, arm
    /// `RootHubResetPulse` for [`ROOT_HUB_RESET_PULSE`], and let
    /// `on_reset_pulse_expired` de-assert it and start polling for the
    /// change bits that mean the port came back up.
    fn start_reset<P: Platform>(&mut self, platform: &P) {
        self.reset_change = false;
        self.reset_poll_elapsed_ms = 0;
        self.write_hprt_bit(platform, bits::HPRT_PRTRST, true);
        platform.arm_timer(TimerId::RootHubResetPulse, ROOT_HUB_RESET_PULSE);
    }

    /// Called once `TimerId::RootHubResetPulse` fires. De-asserts `PRTRST`
    /// and starts the bounded poll for `C_PORT_ENABLE`/`C_PORT_CONNECTION`.
    pub fn on_reset_pulse_expired<P: Platform>(&mut self, platform: &P) {
        self.write_hprt_bit(platform, bits::HPRT_PRTRST, false);
        platform.arm_timer(TimerId::RootHubResetSafeComplete, ROOT_HUB_CHANGE_POLL_INTERVAL);
    }

    /// Called for both `TimerId::RootHubResetSafeComplete` and subsequent
    /// `TimerId::RootHubChangePoll` ticks. Returns `true` once the reset
    /// sequence has concluded (a change bit latched, or the bound in
    /// [`RESET_CHANGE_TIMEOUT_MS`] was hit), `false` if it re-armed itself.
    pub fn on_reset_poll<P: Platform>(&mut self, platform: &P) -> bool {
        let status = self.get_port_status(platform);
        if status.c_connected || status.c_enabled || status.c_over_current {
            self.reset_change = true;
            return true;
        }
        if self.reset_poll_elapsed_ms >= RESET_CHANGE_TIMEOUT_MS {
            log::warn!("root hub port reset did not settle within {} ms", RESET_CHANGE_TIMEOUT_MS);
            self.reset_change = true;
            return true;
        }
        self.reset_poll_elapsed_ms += ROOT_HUB_CHANGE_POLL_INTERVAL.as_millis() as u32;
        platform.arm_timer(TimerId::RootHubChangePoll, ROOT_HUB_CHANGE_POLL_INTERVAL);
        false
    }

    /// Polls `GRSTCTL.ahbidle` then `GRSTCTL.csftrst` to bring the core out
    /// of reset, per this controller's soft-reset sequence.
    pub fn reset_controller<P: Platform>(platform: &P) -> Result<(), HcdError> {
        use crate::config::CORE_RESET_POLL_ATTEMPTS;
        unsafe {
            let core_regs = regs::core_global_regs(platform.mmio_base());
            let mut idle = false;
            for _ in 0..CORE_RESET_POLL_ATTEMPTS {
                regs::mmio_fence(platform);
                if (*core_regs).grstctl.read() & bits::GRSTCTL_AHBIDLE != 0 {
                    idle = true;
                    break;
                }
            }
            if !idle {
                log::warn!("AHB did not go idle before core soft reset");
            }
            (*core_regs).grstctl.write(bits::GRSTCTL_CSFTRST);
            regs::mmio_fence(platform);
            for _ in 0..CORE_RESET_POLL_ATTEMPTS {
                regs::mmio_fence(platform);
                if (*core_regs).grstctl.read() & bits::GRSTCTL_CSFTRST == 0 {
                    return Ok(());
                }
            }
        }
        Err(HcdError::ResetTimedOut)
    }

    fn read_hprt<P: Platform>(&self, platform: &P) -> u32 {
        unsafe {
            let port_regs = regs::host_port_regs(platform.mmio_base());
            regs::mmio_fence(platform);
            (*port_regs).hprt.read()
        }
    }

    /// Sets or clears a non-W1C `HPRT0` bit, masking the write-1-to-clear
    /// bits to zero so the read-modify-write doesn't accidentally acknowledge
    /// a pending change.
    fn write_hprt_bit<P: Platform>(&self, platform: &P, bit: u32, set: bool) {
        unsafe {
            let port_regs = regs::host_port_regs(platform.mmio_base());
            regs::mmio_fence(platform);
            let cur = (*port_regs).hprt.read();
            let mut new = cur & !bits::HPRT_W1C_MASK;
            if set {
                new |= bit;
            } else {
                new &= !bit;
            }
            (*port_regs).hprt.write(new);
            regs::mmio_fence(platform);
        }
    }

    /// Acknowledges one W1C change bit by writing it back as 1 while masking
    /// every other W1C bit to zero.
    fn ack_hprt_w1c<P: Platform>(&self, platform: &P, bit: u32) {
        unsafe {
            let port_regs = regs::host_port_regs(platform.mmio_base());
            regs::mmio_fence(platform);
            let cur = (*port_regs).hprt.read();
            let new = (cur & !bits::HPRT_W1C_MASK) | bit;
            (*port_regs).hprt.write(new);
            regs::mmio_fence(platform);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;
    use core::time::Duration;

    /// Backs `HostPortRegs` with a heap buffer so `host_port_regs` can be
    /// dereferenced exactly as it would be against real MMIO.
    struct FakePlatform {
        regs: Box<[u8; 0x500]>,
    }

    impl FakePlatform {
        fn new() -> Self {
            Self {
                regs: Box::new([0u8; 0x500]),
            }
        }
    }

    impl Platform for FakePlatform {
        fn mmio_base(&self) -> *mut u8 {
            self.regs.as_ptr() as *mut u8
        }
        fn data_sync_barrier(&self) {}
        fn alloc_bounce_buffer(&self, _channel: u8) -> (*mut u8, u32) {
            (core::ptr::null_mut(), 0)
        }
        fn arm_timer(&self, _id: TimerId, _delay: Duration) {}
    }

    fn write_hprt(platform: &FakePlatform, value: u32) {
        unsafe {
            let port_regs = regs::host_port_regs(platform.mmio_base());
            (*port_regs).hprt.write(value);
        }
    }

    #[test]
    fn get_info_reports_a_usb2_only_controller() {
        let hub = RootHub::new(ControllerConfig::default());
        let info = hub.get_info();
        assert_eq!(info.controller_type, ControllerType::SoftXhci);
        assert_eq!(info.ports30, 0);
        assert_eq!(info.u1_exit_latency_us, 10_000);
        assert_eq!(info.u2_exit_latency_us, 10_000);
    }

    #[test]
    fn get_port_info_reports_a_fixed_non_removable_port() {
        let hub = RootHub::new(ControllerConfig::default());
        let info = hub.get_port_info();
        assert_eq!(info.port, 1);
        assert!(!info.removable);
        assert!(!info.integrated_hub);
        assert_eq!(info.hub_depth, 4);
    }

    #[test]
    fn reset_poll_bounds_at_timeout() {
        let platform = FakePlatform::new();
        let mut hub = RootHub::new(ControllerConfig::default());
        write_hprt(&platform, bits::HPRT_PRTCONNSTS);
        for _ in 0..(RESET_CHANGE_TIMEOUT_MS / 10) {
            assert!(!hub.on_reset_poll(&*platform));
        }
        assert!(hub.on_reset_poll(&*platform));
        assert!(hub.get_port_status(&*platform).c_reset);
    }

    #[test]
    fn reset_poll_stops_early_on_change_bit() {
        let platform = FakePlatform::new();
        let mut hub = RootHub::new(ControllerConfig::default());
        write_hprt(&platform, bits::HPRT_PRTCONNSTS | bits::HPRT_PRTENCHNG);
        assert!(hub.on_reset_poll(&*platform));
    }

    #[test]
    fn clear_c_reset_feature_resets_latch() {
        let platform = FakePlatform::new();
        let mut hub = RootHub::new(ControllerConfig::default());
        write_hprt(&platform, bits::HPRT_PRTENCHNG);
        assert!(hub.on_reset_poll(&*platform));
        hub.clear_port_feature(&*platform, PortFeature::CReset);
        assert!(!hub.get_port_status(&*platform).c_reset);
    }

    #[test]
    fn ack_w1c_bit_writes_only_the_target_change_bit() {
        // HPRT0's W1C bits clear on a 1-write and are left alone by a 0-write
        // in hardware, so the value this driver writes back must carry the
        // target bit set and every other W1C bit clear, while non-W1C state
        // (here PRTCONNSTS) passes through untouched.
        let platform = FakePlatform::new();
        let hub = RootHub::new(ControllerConfig::default());
        write_hprt(&platform, bits::HPRT_PRTCONNSTS | bits::HPRT_PRTCONNDET | bits::HPRT_PRTOVRCURRCHNG);
        hub.ack_hprt_w1c(&*platform, bits::HPRT_PRTCONNDET);
        let written = hub.read_hprt(&*platform);
        assert_eq!(written & bits::HPRT_PRTCONNDET, bits::HPRT_PRTCONNDET);
        assert_eq!(written & bits::HPRT_PRTOVRCURRCHNG, 0);
        assert_eq!(written & bits::HPRT_PRTCONNSTS, bits::HPRT_PRTCONNSTS);
    }
}
