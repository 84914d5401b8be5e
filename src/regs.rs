//! Register layouts and bit definitions for the DWC OTG host-controller core.
//!
//! The registers are split into the same logical blocks the hardware uses
//! (core globals, host globals, the single root-hub port register, one block
//! per hardware channel, and the power/clock-gating register), each exposed
//! as a `#[repr(C)]` struct of [`Volatile`]/[`ReadOnly`] fields so that field
//! access compiles down to a single MMIO load or store. Offsets are bit-exact
//! requirements of the DWC OTG programmer's model; the `const _: () =
//! assert!(...)` checks below catch layout drift at compile time.

use volatile::{ReadOnly, Volatile};
use zerocopy::FromBytes;

/// Byte offset of the core global register block from the controller's MMIO base.
pub const CORE_GLOBAL_REGS_OFFSET: usize = 0x000;
/// Byte offset of the host global register block.
pub const HOST_GLOBAL_REGS_OFFSET: usize = 0x400;
/// Byte offset of the single downstream port's HPRT0 register.
pub const HOST_PORT_REGS_OFFSET: usize = 0x440;
/// Byte offset of the first hardware channel's register block.
pub const CHANNEL_REGS_BASE_OFFSET: usize = 0x500;
/// Byte stride between successive channels' register blocks.
pub const CHANNEL_REGS_STRIDE: usize = 0x20;
/// Byte offset of the power and clock-gating control register.
pub const PCGCCTL_OFFSET: usize = 0xE00;

/// Number of hardware host channels implemented by this controller.
pub const NUM_CHANNELS: usize = 8;

/// The layout of the core global registers (GOTGCTL .. HPTXFSIZ).
#[derive(FromBytes)]
#[repr(C)]
pub struct CoreGlobalRegs {
    /// OTG control and status.
    pub gotgctl: Volatile<u32>, // 0x000
    /// OTG interrupt.
    pub gotgint: Volatile<u32>, // 0x004
    /// AHB configuration (global interrupt enable, DMA enable).
    pub gahbcfg: Volatile<u32>, // 0x008
    /// USB configuration (PHY select, force host/device).
    pub gusbcfg: Volatile<u32>, // 0x00C
    /// Reset control.
    pub grstctl: Volatile<u32>, // 0x010
    /// Interrupt status (core level, W1C).
    pub gintsts: Volatile<u32>, // 0x014
    /// Interrupt mask (core level).
    pub gintmsk: Volatile<u32>, // 0x018
    /// Receive status read (peek, does not pop).
    pub grxstsr: ReadOnly<u32>, // 0x01C
    /// Receive status pop.
    pub grxstsp: ReadOnly<u32>, // 0x020
    /// Receive FIFO size.
    pub grxfsiz: Volatile<u32>, // 0x024
    /// Non-periodic transmit FIFO size.
    pub gnptxfsiz: Volatile<u32>, // 0x028
    /// Non-periodic transmit FIFO/queue status.
    pub gnptxsts: ReadOnly<u32>, // 0x02C
    _padding0: [u8; 0x10], // 0x030 - 0x03F
    /// Synopsys identification register; used to sanity-check the MMIO mapping.
    pub gsnpsid: ReadOnly<u32>, // 0x040
    pub ghwcfg1: ReadOnly<u32>, // 0x044
    pub ghwcfg2: ReadOnly<u32>, // 0x048
    pub ghwcfg3: ReadOnly<u32>, // 0x04C
    pub ghwcfg4: ReadOnly<u32>, // 0x050
    _padding1: [u8; 0xAC], // 0x054 - 0x0FF
    /// Host periodic transmit FIFO size.
    pub hptxfsiz: Volatile<u32>, // 0x100
    _padding2: [u8; 0x2FC], // 0x104 - 0x3FF
}

const _: () = assert!(core::mem::size_of::<CoreGlobalRegs>() == 0x400);

/// The layout of the host-mode global registers (HCFG .. HAINTMSK).
#[derive(FromBytes)]
#[repr(C)]
pub struct HostGlobalRegs {
    /// Host configuration (PHY clock select for full/low-speed).
    pub hcfg: Volatile<u32>, // 0x400
    /// Host frame interval.
    pub hfir: Volatile<u32>, // 0x404
    /// Host frame number; low bit alternates each (micro)frame.
    pub hfnum: ReadOnly<u32>, // 0x408
    _padding0: [u8; 4], // 0x40C
    /// Host periodic transmit FIFO/queue status.
    pub hptxsts: ReadOnly<u32>, // 0x410
    /// Host all-channels interrupt (one bit per channel, set on CHHLTD).
    pub haint: ReadOnly<u32>, // 0x414
    /// Host all-channels interrupt mask.
    pub haintmsk: Volatile<u32>, // 0x418
    _padding1: [u8; 0x40 - 0x1C], // 0x41C - 0x43F
}

const _: () =
    assert!(core::mem::size_of::<HostGlobalRegs>() == HOST_PORT_REGS_OFFSET - HOST_GLOBAL_REGS_OFFSET);

/// The layout of the single downstream port's register block.
#[derive(FromBytes)]
#[repr(C)]
pub struct HostPortRegs {
    /// HPRT0: connect/enable/suspend/reset/power/speed bits, with W1C change bits.
    pub hprt: Volatile<u32>, // 0x440
    _padding: [u8; CHANNEL_REGS_BASE_OFFSET - HOST_PORT_REGS_OFFSET - 4],
}

const _: () =
    assert!(core::mem::size_of::<HostPortRegs>() == CHANNEL_REGS_BASE_OFFSET - HOST_PORT_REGS_OFFSET);

/// The layout of one hardware channel's register block.
#[derive(FromBytes)]
#[repr(C)]
pub struct ChannelRegs {
    /// Channel characteristics: device address, endpoint, type, speed, mps, chen/chdis.
    pub hcchar: Volatile<u32>, // +0x00
    /// Split control: spltena, compsplt, hub/port address.
    pub hcsplt: Volatile<u32>, // +0x04
    /// Channel interrupt (W1C).
    pub hcint: Volatile<u32>, // +0x08
    /// Channel interrupt mask.
    pub hcintmsk: Volatile<u32>, // +0x0C
    /// Transfer size: xfersize, pktcnt, pid.
    pub hctsiz: Volatile<u32>, // +0x10
    /// DMA address (bounce-buffer physical address).
    pub hcdma: Volatile<u32>, // +0x14
    _padding: [u8; 0x08],
}

const _: () = assert!(core::mem::size_of::<ChannelRegs>() == CHANNEL_REGS_STRIDE);

/// # Safety
/// `base` must point at a valid DWC OTG MMIO window at least `0x400` bytes long.
pub unsafe fn core_global_regs(base: *mut u8) -> *mut CoreGlobalRegs {
    base.add(CORE_GLOBAL_REGS_OFFSET) as *mut CoreGlobalRegs
}

/// # Safety
/// `base` must point at a valid DWC OTG MMIO window at least `0x440` bytes long.
pub unsafe fn host_global_regs(base: *mut u8) -> *mut HostGlobalRegs {
    base.add(HOST_GLOBAL_REGS_OFFSET) as *mut HostGlobalRegs
}

/// # Safety
/// `base` must point at a valid DWC OTG MMIO window at least `0x500` bytes long.
pub unsafe fn host_port_regs(base: *mut u8) -> *mut HostPortRegs {
    base.add(HOST_PORT_REGS_OFFSET) as *mut HostPortRegs
}

/// # Safety
/// `base` must point at a valid DWC OTG MMIO window, and `channel` must be `< NUM_CHANNELS`.
pub unsafe fn channel_regs(base: *mut u8, channel: u8) -> *mut ChannelRegs {
    base.add(CHANNEL_REGS_BASE_OFFSET + channel as usize * CHANNEL_REGS_STRIDE) as *mut ChannelRegs
}

/// # Safety
/// `base` must point at a valid DWC OTG MMIO window at least `0xE04` bytes long.
pub unsafe fn pcgcctl(base: *mut u8) -> *mut Volatile<u32> {
    base.add(PCGCCTL_OFFSET) as *mut Volatile<u32>
}

/// Compiler fence plus the platform's data-synchronization barrier, bracketing
/// a logical register access per spec's MMIO-ordering requirement.
pub fn mmio_fence<P: crate::Platform + ?Sized>(platform: &P) {
    core::sync::atomic::compiler_fence(core::sync::atomic::Ordering::SeqCst);
    platform.data_sync_barrier();
}

pub mod bits {
    //! Register field masks and shifts, named after the programmer's-model
    //! field names rather than their meaning, matching how the rest of this
    //! driver refers to them.

    // GAHBCFG
    pub const GAHBCFG_GLBL_INTR_EN: u32 = 1 << 0;
    pub const GAHBCFG_DMA_EN: u32 = 1 << 5;

    // GUSBCFG
    pub const GUSBCFG_PHYSEL: u32 = 1 << 6;
    pub const GUSBCFG_FORCE_HOST: u32 = 1 << 29;
    pub const GUSBCFG_FORCE_DEV: u32 = 1 << 30;

    // GRSTCTL
    pub const GRSTCTL_CSFTRST: u32 = 1 << 0;
    pub const GRSTCTL_RXFFLSH: u32 = 1 << 4;
    pub const GRSTCTL_TXFFLSH: u32 = 1 << 5;
    pub const GRSTCTL_TXFNUM_ALL: u32 = 0x10 << 6;
    pub const GRSTCTL_AHBIDLE: u32 = 1 << 31;

    // GINTSTS / GINTMSK
    pub const GINTSTS_CURMODE_HOST: u32 = 1 << 0;
    pub const GINTSTS_SOF: u32 = 1 << 3;
    pub const GINTSTS_RXFLVL: u32 = 1 << 4;
    pub const GINTSTS_PRTINT: u32 = 1 << 24;
    pub const GINTSTS_HCINTR: u32 = 1 << 25;

    // HCCHAR
    pub const HCCHAR_MPS_MASK: u32 = 0x7FF;
    pub const HCCHAR_EPNUM_SHIFT: u32 = 11;
    pub const HCCHAR_EPDIR_IN: u32 = 1 << 15;
    pub const HCCHAR_LSPDDEV: u32 = 1 << 17;
    pub const HCCHAR_EPTYPE_SHIFT: u32 = 18;
    pub const HCCHAR_EPTYPE_CTRL: u32 = 0 << 18;
    pub const HCCHAR_EPTYPE_ISOC: u32 = 1 << 18;
    pub const HCCHAR_EPTYPE_BULK: u32 = 2 << 18;
    pub const HCCHAR_EPTYPE_INTR: u32 = 3 << 18;
    pub const HCCHAR_MULTCNT_SHIFT: u32 = 20;
    pub const HCCHAR_MULTCNT_MASK: u32 = 0x3 << 20;
    pub const HCCHAR_DEVADDR_SHIFT: u32 = 22;
    pub const HCCHAR_ODDFRM: u32 = 1 << 29;
    pub const HCCHAR_CHDIS: u32 = 1 << 30;
    pub const HCCHAR_CHEN: u32 = 1 << 31;

    // HCSPLT
    pub const HCSPLT_PRTADDR_MASK: u32 = 0x7F;
    pub const HCSPLT_HUBADDR_SHIFT: u32 = 7;
    pub const HCSPLT_HUBADDR_MASK: u32 = 0x7F << 7;
    pub const HCSPLT_COMPSPLT: u32 = 1 << 16;
    pub const HCSPLT_SPLTENA: u32 = 1 << 31;

    // HCTSIZ
    pub const HCTSIZ_XFERSIZE_MASK: u32 = 0x7FFFF;
    pub const HCTSIZ_PKTCNT_SHIFT: u32 = 19;
    pub const HCTSIZ_PKTCNT_MASK: u32 = 0x3FF << 19;
    pub const HCTSIZ_PID_SHIFT: u32 = 29;
    pub const HCTSIZ_PID_MASK: u32 = 0x3 << 29;
    pub const HCTSIZ_PID_DATA0: u32 = 0 << 29;
    pub const HCTSIZ_PID_DATA1: u32 = 2 << 29;
    pub const HCTSIZ_PID_MDATA: u32 = 1 << 29;
    pub const HCTSIZ_PID_SETUP: u32 = 3 << 29;

    // HCINT / HCINTMSK
    pub const HCINT_XFERCOMP: u32 = 1 << 0;
    pub const HCINT_CHHLTD: u32 = 1 << 1;
    pub const HCINT_AHBERR: u32 = 1 << 2;
    pub const HCINT_STALL: u32 = 1 << 3;
    pub const HCINT_NAK: u32 = 1 << 4;
    pub const HCINT_ACK: u32 = 1 << 5;
    pub const HCINT_NYET: u32 = 1 << 6;
    pub const HCINT_XACTERR: u32 = 1 << 7;
    pub const HCINT_BBLERR: u32 = 1 << 8;
    pub const HCINT_FRMOVRUN: u32 = 1 << 9;
    pub const HCINT_DATATGLERR: u32 = 1 << 10;
    pub const HCINT_ALL: u32 = 0x3FFF;

    // HPRT0
    pub const HPRT_PRTCONNSTS: u32 = 1 << 0;
    pub const HPRT_PRTCONNDET: u32 = 1 << 1;
    pub const HPRT_PRTENA: u32 = 1 << 2;
    pub const HPRT_PRTENCHNG: u32 = 1 << 3;
    pub const HPRT_PRTOVRCURRACT: u32 = 1 << 4;
    pub const HPRT_PRTOVRCURRCHNG: u32 = 1 << 5;
    pub const HPRT_PRTRES: u32 = 1 << 6;
    pub const HPRT_PRTSUSP: u32 = 1 << 7;
    pub const HPRT_PRTRST: u32 = 1 << 8;
    pub const HPRT_PRTPWR: u32 = 1 << 12;
    pub const HPRT_PRTSPD_SHIFT: u32 = 17;
    pub const HPRT_PRTSPD_MASK: u32 = 0x3 << 17;
    /// Write-1-to-clear bits; must be masked out when modifying any other HPRT0 bit.
    pub const HPRT_W1C_MASK: u32 =
        HPRT_PRTCONNDET | HPRT_PRTENA | HPRT_PRTENCHNG | HPRT_PRTOVRCURRCHNG;

    /// Expected top nibble of GSNPSID for a DWC OTG core.
    pub const GSNPSID_ID_MASK: u32 = 0xFFFF_F000;
    pub const GSNPSID_ID_VALUE: u32 = 0x4F54_2000;

    // HFNUM
    pub const HFNUM_FRNUM_MASK: u32 = 0x3FFF;
}
