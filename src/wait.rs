//! Deadlines and idle strategies for blocking sends
//!
//! A blocking send alternates between checking the transmitter (inside a
//! short critical section) and idling (outside of it). The idle strategy is
//! any `FnMut()`; [`wait_for_interrupt`] sleeps the core until the next USB
//! interrupt. The deadline decides when to stop waiting.

/// Decides when a blocking operation gives up.
pub trait Deadline {
    /// Returns `true` once the deadline passed.
    ///
    /// Called once per wait iteration.
    fn expired(&mut self) -> bool;
}

/// Wait forever.
#[derive(Clone, Copy, Debug, Default)]
pub struct Never;

impl Deadline for Never {
    fn expired(&mut self) -> bool {
        false
    }
}

/// Give up after a number of wait iterations.
#[derive(Clone, Copy, Debug)]
pub struct SpinBudget(pub u32);

impl Deadline for SpinBudget {
    fn expired(&mut self) -> bool {
        match self.0.checked_sub(1) {
            Some(remaining) => {
                self.0 = remaining;
                false
            }
            None => true,
        }
    }
}

/// Give up when a predicate says so.
///
/// Use this to adapt a hardware timer.
///
/// ```
/// use cdc_acm_device::wait::{Deadline, Expires};
///
/// let mut now = 0u32;
/// let mut deadline = Expires(move || {
///     now += 100;
///     now >= 300
/// });
/// assert!(!deadline.expired());
/// assert!(!deadline.expired());
/// assert!(deadline.expired());
/// ```
pub struct Expires<F>(pub F);

impl<F: FnMut() -> bool> Deadline for Expires<F> {
    fn expired(&mut self) -> bool {
        (self.0)()
    }
}

impl<D: Deadline + ?Sized> Deadline for &mut D {
    fn expired(&mut self) -> bool {
        (**self).expired()
    }
}

/// Idle until the next interrupt.
///
/// Pair this with interrupt-driven stack callbacks, so that the completion
/// interrupt wakes the sender.
pub fn wait_for_interrupt() {
    cortex_m::asm::wfi();
}
