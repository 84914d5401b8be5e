#![no_std]
#![allow(clippy::type_complexity)]

extern crate alloc;

mod channel;
mod chsm;
mod config;
mod controller;
mod device;
mod dispatcher;
mod error;
mod regs;
mod roothub;
mod timer;
mod trsm;
mod tt;

pub use config::ControllerConfig;
pub use controller::{Controller, DeviceHandle, DeviceSlot};
pub use device::{Endpoint, EndpointDescriptor, EndpointType, Speed, Toggle, TtRef, Urb};
pub use dispatcher::PendingWork;
pub use error::{HcdError, UrbStatus};
pub use roothub::{ControllerType, PortFeature, PortInfo, PortStatus, RootHubInfo};
pub use timer::TimerId;

use core::time::Duration;

/// The seam between this core and its embedding host: everything here is
/// out of scope for the Transfer/URB state machines themselves (MMIO
/// mapping, cache/barrier semantics, DMA-capable memory, and a scheduler
/// to route timer expiry back in), per spec.md §6.
///
/// Implementations must be safe to call from both interrupt and deferred-
/// work context; none of the methods block.
pub trait Platform {
    /// Base address of the controller's MMIO register window.
    ///
    /// # Safety
    /// The returned pointer must remain valid for the controller's entire
    /// lifetime and point at a real DWC OTG register window.
    fn mmio_base(&self) -> *mut u8;

    /// Platform-supplied data-synchronization barrier, run alongside a
    /// compiler fence by [`regs::mmio_fence`] around every logical register
    /// access. A no-op on platforms where MMIO already orders through the
    /// page-table attributes (e.g. x86's uncacheable mappings).
    fn data_sync_barrier(&self);

    /// Returns a channel's DMA staging buffer: a CPU-accessible pointer and
    /// the physical address to program into `HCDMA`. Called once per
    /// channel at [`channel::ChannelPool::new`] and then again on every
    /// transaction to locate the same buffer.
    fn alloc_bounce_buffer(&self, channel: u8) -> (*mut u8, u32);

    /// Arms a one-shot timer that must call back into
    /// [`Controller::on_timer`] with `id` after `delay`, from deferred-work
    /// context. Re-arming the same `id` before it fires replaces the
    /// pending expiry.
    fn arm_timer(&self, id: TimerId, delay: Duration);
}
