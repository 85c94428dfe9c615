//! A device-side USB CDC-ACM (virtual serial port) core
//!
//! `cdc-acm-device` describes a CDC-ACM function with a compile-time
//! descriptor table, tracks the USB session, and pumps data through one bulk
//! OUT and one bulk IN endpoint. It handles zero-length packet termination,
//! and gates transmission on the host's DTR signal.
//!
//! The core doesn't drive USB hardware. It talks to your USB device stack
//! through the [`UsbStack`] trait, and your stack reports bus events and
//! transfer completions back to [`CdcAcm`]. Board bring-up (interrupts,
//! pull-up, clocks) is expressed through [`platform::Platform`].
//!
//! # Example
//!
//! ```no_run
//! use cdc_acm_device::{
//!     descriptor::{DescriptorTable, DeviceConfig},
//!     session::Event,
//!     wait, CdcAcm, InterfaceKind, TransferMemory, UsbStack, BUFFER_SIZE,
//! };
//! use core::ptr::NonNull;
//! use usb_device::endpoint::{EndpointAddress, EndpointType};
//!
//! struct MyStack;
//! # impl UsbStack for MyStack {
//! #     fn register_descriptor_table(&mut self, _: &'static [u8]) -> usb_device::Result<()> { Ok(()) }
//! #     fn register_interface(&mut self, kind: InterfaceKind) -> usb_device::Result<u8> { Ok(kind as u8) }
//! #     fn register_endpoint(&mut self, _: EndpointAddress, _: EndpointType) -> usb_device::Result<()> { Ok(()) }
//! #     fn initialize(&mut self) -> usb_device::Result<()> { Ok(()) }
//! #     unsafe fn start_read(&mut self, _: EndpointAddress, _: NonNull<u8>, _: usize) -> usb_device::Result<()> { Ok(()) }
//! #     unsafe fn start_write(&mut self, _: EndpointAddress, _: NonNull<u8>, _: usize) -> usb_device::Result<()> { Ok(()) }
//! # }
//!
//! static DESCRIPTORS: DescriptorTable = DescriptorTable::new(&DeviceConfig::REFERENCE);
//! static RX: TransferMemory<BUFFER_SIZE> = TransferMemory::new();
//! static TX: TransferMemory<BUFFER_SIZE> = TransferMemory::new();
//! static ACM: CdcAcm<MyStack> = CdcAcm::new();
//!
//! ACM.init(MyStack, &DESCRIPTORS, &RX, &TX).unwrap();
//!
//! // From the USB interrupt handler:
//! ACM.handle(Event::Configured).unwrap();
//!
//! // From the application:
//! match ACM.send(wait::Never, wait::wait_for_interrupt) {
//!     Ok(()) => {}
//!     Err(_err) => { /* DTR not asserted, or the bus reset... */ }
//! }
//! ```

#![no_std]

#[cfg(feature = "defmt-03")]
extern crate defmt_03 as defmt;

#[macro_use]
mod log;

mod acm;
mod buffer;
mod fifo;

pub mod class;
pub mod descriptor;
pub mod endpoint;
pub mod platform;
pub mod session;
pub mod wait;

pub use acm::{CdcAcm, ControlOutcome};
pub use buffer::{Buffer, TransferMemory, BUFFER_SIZE};

use core::{fmt, ptr::NonNull};
use usb_device::{
    endpoint::{EndpointAddress, EndpointType},
    UsbError,
};

/// Bulk OUT endpoint address (host to device).
pub const BULK_OUT_ENDPOINT: u8 = 0x02;
/// Bulk IN endpoint address (device to host).
pub const BULK_IN_ENDPOINT: u8 = 0x81;
/// Interrupt IN endpoint address for notifications.
///
/// Only described; the core never moves data on it.
pub const NOTIFY_ENDPOINT: u8 = 0x83;

/// The two interfaces of the CDC-ACM function.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
#[repr(u8)]
pub enum InterfaceKind {
    /// Control and notifications
    Communications = descriptor::COMM_INTERFACE,
    /// Bulk data
    Data = descriptor::DATA_INTERFACE,
}

/// The USB device stack that runs the protocol engine.
///
/// The stack owns the controller: it answers standard requests from the
/// registered descriptor table, moves packets for started transfers, and
/// reports events and completions to [`CdcAcm`]. Bus events go to
/// [`CdcAcm::handle`], class requests to [`CdcAcm::control_request`], and
/// transfer completions to [`CdcAcm::on_transfer_complete`].
///
/// Report completions after `start_read` or `start_write` returns, never from
/// inside them; [`CdcAcm`] refuses those calls with
/// [`UsbError::InvalidState`]. Report a completion for every started write,
/// including writes abandoned by a bus reset. Until then, the transmit buffer
/// stays claimed.
pub trait UsbStack {
    /// Register the descriptors that answer GET_DESCRIPTOR.
    fn register_descriptor_table(&mut self, table: &'static [u8]) -> usb_device::Result<()>;

    /// Register an interface, returning its interface number.
    ///
    /// Interfaces are registered in descriptor order.
    fn register_interface(&mut self, kind: InterfaceKind) -> usb_device::Result<u8>;

    /// Register a data endpoint.
    fn register_endpoint(
        &mut self,
        address: EndpointAddress,
        ep_type: EndpointType,
    ) -> usb_device::Result<()>;

    /// Start the stack, after all registrations.
    fn initialize(&mut self) -> usb_device::Result<()>;

    /// Receive up to `max_len` bytes into `buffer`.
    ///
    /// # Safety
    ///
    /// The stack may write `max_len` bytes through `buffer` until it reports
    /// the transfer complete. The caller ensures the memory stays valid, and
    /// isn't otherwise accessed, for that long.
    unsafe fn start_read(
        &mut self,
        address: EndpointAddress,
        buffer: NonNull<u8>,
        max_len: usize,
    ) -> usb_device::Result<()>;

    /// Send `len` bytes from `buffer`. A `len` of zero sends a zero-length
    /// packet.
    ///
    /// # Safety
    ///
    /// The stack may read `len` bytes through `buffer` until it reports the
    /// transfer complete. The caller ensures the memory stays valid, and isn't
    /// modified, for that long.
    unsafe fn start_write(
        &mut self,
        address: EndpointAddress,
        buffer: NonNull<u8>,
        len: usize,
    ) -> usb_device::Result<()>;
}

/// Failure to initialize the CDC-ACM core.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum InitError {
    /// The descriptor table is malformed.
    Descriptor(descriptor::DescriptorError),
    /// An endpoint was registered twice.
    DuplicateEndpoint,
    /// An endpoint address can't serve its handler.
    InvalidEndpoint,
    /// The stack numbered an interface differently than the descriptors.
    InterfaceMismatch { expected: u8, actual: u8 },
    /// Transfer memory was already taken.
    MemoryInUse,
    /// [`CdcAcm::init`] already succeeded.
    AlreadyInitialized,
    /// The stack refused a registration.
    Stack(UsbError),
    /// Board bring-up failed.
    Platform(platform::PlatformError),
}

impl From<descriptor::DescriptorError> for InitError {
    fn from(err: descriptor::DescriptorError) -> Self {
        InitError::Descriptor(err)
    }
}

impl From<UsbError> for InitError {
    fn from(err: UsbError) -> Self {
        InitError::Stack(err)
    }
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitError::Descriptor(err) => write!(f, "invalid descriptors: {err}"),
            InitError::DuplicateEndpoint => f.write_str("endpoint registered twice"),
            InitError::InvalidEndpoint => f.write_str("invalid endpoint address"),
            InitError::InterfaceMismatch { expected, actual } => {
                write!(f, "interface {actual} registered, expected {expected}")
            }
            InitError::MemoryInUse => f.write_str("transfer memory already taken"),
            InitError::AlreadyInitialized => f.write_str("already initialized"),
            InitError::Stack(err) => write!(f, "USB stack error: {err:?}"),
            InitError::Platform(err) => write!(f, "bring-up failed: {err}"),
        }
    }
}

/// Failure to transmit.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum SendError {
    /// The host hasn't asserted DTR. Nothing was submitted.
    NotReady,
    /// A transmission is outstanding. Nothing was submitted.
    Busy,
    /// The deadline expired before the transmission finished.
    ///
    /// The transmission stays outstanding; poll it with
    /// [`CdcAcm::poll_send`].
    Timeout,
    /// A bus reset or disconnect abandoned the transmission.
    Aborted,
    /// [`CdcAcm::init`] hasn't succeeded.
    Uninitialized,
    /// The stack refused the write.
    Stack(UsbError),
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::NotReady => f.write_str("DTR not asserted"),
            SendError::Busy => f.write_str("transmission in progress"),
            SendError::Timeout => f.write_str("transmission timed out"),
            SendError::Aborted => f.write_str("transmission aborted"),
            SendError::Uninitialized => f.write_str("not initialized"),
            SendError::Stack(err) => write!(f, "USB stack error: {err:?}"),
        }
    }
}
