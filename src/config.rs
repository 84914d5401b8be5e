//! Compile-time tunables for the host-controller core.

/// Number of hardware host channels this controller implements.
pub const NUM_CHANNELS: usize = crate::regs::NUM_CHANNELS;

/// Size in bytes of each channel's DMA bounce buffer.
///
/// Sized for a full-speed isochronous/bulk transfer's worth of data in one
/// shot (the largest single URB this driver will stage without chunking
/// across multiple channel programmings).
pub const BOUNCE_BUFFER_SIZE: usize = 64 * 1024;

/// Highest valid USB device address (address 0 is the default/unaddressed state).
pub const MAX_USB_ADDRESS: u8 = 127;

/// Upper bound, in host frames, that a root-hub port reset is allowed to
/// assert PRTRST before `PORT_RESET`/`C_PORT_RESET` handling gives up and
/// reports the port as not-enabled. See DESIGN.md Open Question 1.
pub const RESET_CHANGE_TIMEOUT_MS: u32 = 200;

/// Number of times to poll for core-reset completion before giving up.
pub const CORE_RESET_POLL_ATTEMPTS: u32 = 1000;

/// Static, board-level configuration for a controller instance.
///
/// Everything here is fixed for the lifetime of a [`crate::controller::Controller`]
/// and is supplied by the platform integration, not discovered from hardware.
#[derive(Debug, Clone, Copy)]
pub struct ControllerConfig {
    /// Whether the downstream port is wired for high-speed operation.
    ///
    /// Low-power/FS-only boards leave this `false` so [`crate::roothub`]
    /// never reports `PORT_HIGH_SPEED`.
    pub high_speed_capable: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            high_speed_capable: true,
        }
    }
}
