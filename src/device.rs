//! USB device/endpoint data model and the 127-address allocator.

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::config::MAX_USB_ADDRESS;
use crate::error::{HcdError, UrbStatus};

/// Device signaling speed, as reported by `HPRT0.prtspd`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speed {
    Low,
    Full,
    High,
}

/// Reference to the transaction translator a low/full-speed device sits
/// behind when attached through a high-speed hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtRef {
    pub hub: i8,
    pub port: i8,
}

/// 127-bit USB address space (address 0 is the unaddressed default state).
///
/// Backed by four `AtomicU32`s rather than a single lock so allocation can
/// run from the same DPC context as everything else in this crate.
pub struct AddressBitmap {
    words: [AtomicU32; 4],
}

impl AddressBitmap {
    pub fn new() -> Self {
        // Bit 0 is permanently reserved for the default/unaddressed state.
        let words = [
            AtomicU32::new(1),
            AtomicU32::new(0),
            AtomicU32::new(0),
            AtomicU32::new(0),
        ];
        Self { words }
    }

    /// Returns the lowest clear bit at or above 1.
    pub fn allocate(&self) -> Result<u8, HcdError> {
        for (w, word) in self.words.iter().enumerate() {
            loop {
                let cur = word.load(Ordering::Acquire);
                if cur == u32::MAX {
                    break;
                }
                let bit = cur.trailing_ones();
                let addr = w as u32 * 32 + bit;
                if addr > MAX_USB_ADDRESS as u32 {
                    break;
                }
                let new = cur | (1 << bit);
                match word.compare_exchange_weak(cur, new, Ordering::AcqRel, Ordering::Acquire) {
                    Ok(_) => return Ok(addr as u8),
                    Err(_) => continue,
                }
            }
        }
        Err(HcdError::AddressesExhausted)
    }

    pub fn release(&self, addr: u8) {
        if addr == 0 {
            return;
        }
        let w = (addr / 32) as usize;
        let bit = addr % 32;
        self.words[w].fetch_and(!(1 << bit), Ordering::AcqRel);
    }

    pub fn bit0_reserved(&self) -> bool {
        self.words[0].load(Ordering::Acquire) & 1 != 0
    }
}

impl Default for AddressBitmap {
    fn default() -> Self {
        Self::new()
    }
}

/// The three endpoint types this driver schedules. Isochronous is rejected
/// at [`Endpoint::new`] rather than represented here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EndpointType {
    Control = 0,
    Bulk = 2,
    Interrupt = 3,
}

impl EndpointType {
    /// Decodes a USB endpoint descriptor's `bmAttributes` transfer-type
    /// field (0=control, 1=isochronous, 2=bulk, 3=interrupt).
    pub fn from_descriptor_code(code: u8) -> Result<Self, HcdError> {
        match code {
            0 => Ok(EndpointType::Control),
            2 => Ok(EndpointType::Bulk),
            3 => Ok(EndpointType::Interrupt),
            _ => Err(HcdError::InvalidEndpointType),
        }
    }
}

/// Data-toggle state, latched per endpoint direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Toggle {
    Data0,
    Data1,
}

impl Toggle {
    pub fn flip(self) -> Self {
        match self {
            Toggle::Data0 => Toggle::Data1,
            Toggle::Data1 => Toggle::Data0,
        }
    }
}

/// A copy of the fields of a USB endpoint descriptor this driver needs.
#[derive(Debug, Clone, Copy)]
pub struct EndpointDescriptor {
    pub number: u8,
    pub direction_in: bool,
    pub ep_type: EndpointType,
    pub max_packet_size: u16,
    /// Polling interval in (micro)frames, straight off the endpoint
    /// descriptor. Unused by control/bulk endpoints; zero for those.
    pub b_interval: u8,
}

/// A single queued transfer request.
pub struct Urb {
    pub buffer: *mut u8,
    pub length: usize,
    pub direction_in: bool,
    /// Present only for control transfers; the 8-byte SETUP packet.
    pub setup: Option<[u8; 8]>,
    /// Filled in once the CHSM reaches a terminal state.
    pub status: Option<UrbStatus>,
}

unsafe impl Send for Urb {}

/// A per-endpoint sequential-dispatch queue; at most one URB is in flight.
pub struct EndpointQueue {
    pending: VecDeque<Urb>,
}

impl EndpointQueue {
    pub fn new() -> Self {
        Self {
            pending: VecDeque::new(),
        }
    }

    pub fn push(&mut self, urb: Urb) {
        self.pending.push_back(urb);
    }

    pub fn pop(&mut self) -> Option<Urb> {
        self.pending.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drains every URB that has not yet been dequeued to a channel,
    /// reporting each as unsuccessful. An URB already handed to a channel
    /// (tracked by the owning CHSM, not this queue) runs to its terminal
    /// TRSM state instead of being touched here.
    pub fn abort(&mut self) -> Vec<Urb> {
        let mut drained: Vec<Urb> = self.pending.drain(..).collect();
        for urb in drained.iter_mut() {
            urb.status = Some(UrbStatus::Aborted);
        }
        drained
    }
}

impl Default for EndpointQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// An endpoint on an attached device.
///
/// The re-entry lock guarding this endpoint's CHSM against a concurrent DPC
/// on another core draining the same `HAINT` bit twice lives alongside it in
/// [`crate::controller::DeviceSlot`] rather than as a field here: a live
/// `MutexGuard` borrowed from a field of this struct would conflict with the
/// `&mut Endpoint` the CHSM driver loop needs for the very call the guard is
/// meant to bracket.
pub struct Endpoint {
    pub descriptor: EndpointDescriptor,
    pub in_toggle: Toggle,
    pub out_toggle: Toggle,
    pub queue: EndpointQueue,
}

impl Endpoint {
    pub fn new(
        descriptor_code: u8,
        number: u8,
        direction_in: bool,
        mps: u16,
        b_interval: u8,
    ) -> Result<Self, HcdError> {
        let ep_type = EndpointType::from_descriptor_code(descriptor_code)?;
        Ok(Self {
            descriptor: EndpointDescriptor {
                number,
                direction_in,
                ep_type,
                max_packet_size: mps,
                b_interval,
            },
            in_toggle: Toggle::Data0,
            out_toggle: Toggle::Data0,
            queue: EndpointQueue::new(),
        })
    }

    /// Updates the default endpoint's max packet size once the real value
    /// is learned from the device descriptor (it starts at a conservative
    /// guess before enumeration completes).
    pub fn update_max_packet_size(&mut self, mps: u16) {
        self.descriptor.max_packet_size = mps;
    }

    pub fn toggle(&self, direction_in: bool) -> Toggle {
        if direction_in {
            self.in_toggle
        } else {
            self.out_toggle
        }
    }

    pub fn set_toggle(&mut self, direction_in: bool, value: Toggle) {
        if direction_in {
            self.in_toggle = value;
        } else {
            self.out_toggle = value;
        }
    }
}

/// An attached USB device's addressing and topology state.
///
/// Its endpoints (including the default control endpoint) live alongside
/// it in [`crate::controller::DeviceSlot`] rather than nested inside this
/// struct: the CHSM driver loop needs `&mut Endpoint` and `&mut UsbDevice`
/// simultaneously, which an endpoint embedded in the device it describes
/// would make unborrowable.
pub struct UsbDevice {
    pub address: u8,
    pub speed: Speed,
    pub tt: Option<TtRef>,
}

impl UsbDevice {
    pub fn new(speed: Speed, tt: Option<TtRef>) -> Self {
        Self {
            address: 0,
            speed,
            tt,
        }
    }

    /// The default control endpoint's initial max packet size, a
    /// conservative guess used until enumeration reads the real value from
    /// the device descriptor.
    pub fn initial_control_mps(speed: Speed) -> u16 {
        match speed {
            Speed::Low => 8,
            Speed::Full | Speed::High => 64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bit_zero_is_always_reserved() {
        let bitmap = AddressBitmap::new();
        assert!(bitmap.bit0_reserved());
        let a = bitmap.allocate().unwrap();
        assert_ne!(a, 0);
        assert!(bitmap.bit0_reserved());
    }

    #[test]
    fn released_address_is_reusable() {
        let bitmap = AddressBitmap::new();
        let a = bitmap.allocate().unwrap();
        bitmap.release(a);
        let b = bitmap.allocate().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn isochronous_endpoint_type_is_rejected() {
        assert_eq!(
            EndpointType::from_descriptor_code(1),
            Err(HcdError::InvalidEndpointType)
        );
    }

    #[test]
    fn abort_marks_undispatched_urbs_unsuccessful() {
        let mut queue = EndpointQueue::new();
        queue.push(Urb {
            buffer: core::ptr::null_mut(),
            length: 0,
            direction_in: true,
            setup: None,
            status: None,
        });
        let drained = queue.abort();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].status, Some(UrbStatus::Aborted));
        assert!(queue.is_empty());
    }
}
