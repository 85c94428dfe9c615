//! Low-level bring-up
//!
//! The USB peripheral needs its interrupts routed, the D+ pull-up enabled,
//! and a 48MHz clock before the stack is initialized. Those details belong
//! to your board; describe them with a [`Platform`] implementation, then
//! call [`bring_up`] once at start-up.
//!
//! ```
//! use cdc_acm_device::platform::{self, ClockSource, Platform, PlatformError};
//!
//! struct Board;
//!
//! impl Platform for Board {
//!     fn configure_interrupts(&mut self) {
//!         // Unmask the USB and USB wakeup interrupts...
//!     }
//!     fn enable_bus_pullup(&mut self) {
//!         // Set the D+ pull-up...
//!     }
//!     fn configure_clock_source(&mut self, source: ClockSource) -> Result<(), PlatformError> {
//!         match source {
//!             ClockSource::Pll => Ok(()),
//!             ClockSource::Crystalless => Err(PlatformError::Unsupported(source)),
//!         }
//!     }
//! }
//!
//! platform::bring_up(&mut Board, ClockSource::Pll).unwrap();
//! ```

use core::fmt;

use crate::InitError;

/// Where the USB peripheral gets its clock.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum ClockSource {
    /// Derived from the system PLL, which runs from an external crystal.
    Pll,
    /// An internal oscillator, trimmed against the host's start-of-frame
    /// packets.
    ///
    /// Each stage of the oscillator needs [`CRYSTALLESS_SETTLE_CYCLES`] to
    /// settle before the next is enabled; see [`settle`].
    Crystalless,
}

/// Delay between enabling stages of the crystal-less oscillator.
pub const CRYSTALLESS_SETTLE_CYCLES: u32 = 0x4000;

/// Bring-up failure reported by a [`Platform`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum PlatformError {
    /// The clock didn't become ready.
    ClockNotReady(ClockSource),
    /// The part can't clock USB from this source.
    Unsupported(ClockSource),
}

impl fmt::Display for PlatformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlatformError::ClockNotReady(source) => write!(f, "{source:?} clock not ready"),
            PlatformError::Unsupported(source) => write!(f, "{source:?} clock unsupported"),
        }
    }
}

/// Board-specific USB peripheral setup.
///
/// [`bring_up`] calls each method once, in declaration order.
pub trait Platform {
    /// Route and unmask the USB interrupts, including the wakeup interrupt.
    fn configure_interrupts(&mut self);
    /// Enable the D+ pull-up, signalling a full speed device to the host.
    fn enable_bus_pullup(&mut self);
    /// Start the USB clock from `source`, and enable the peripheral clock.
    fn configure_clock_source(&mut self, source: ClockSource) -> Result<(), PlatformError>;
}

/// Prepare the USB peripheral, clocking it from `source`.
///
/// Call this once, before initializing the stack.
pub fn bring_up<P: Platform + ?Sized>(
    platform: &mut P,
    source: ClockSource,
) -> Result<(), InitError> {
    debug!("BRING UP {:?}", source);
    platform.configure_interrupts();
    platform.enable_bus_pullup();
    platform
        .configure_clock_source(source)
        .map_err(InitError::Platform)
}

/// Busy-wait for at least `cycles` core clock cycles.
pub fn settle(cycles: u32) {
    cortex_m::asm::delay(cycles);
}
