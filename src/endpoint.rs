//! Endpoint bindings
//!
//! Pairs the bulk endpoint addresses with the handler that runs when the
//! stack reports a completed transfer.

use usb_device::{endpoint::EndpointAddress, UsbDirection};

/// Eight endpoints, two directions
const MAX_ENDPOINTS: usize = 8 * 2;

/// Produces an index into the handler table
fn index(addr: EndpointAddress) -> usize {
    (addr.index() * 2) + (UsbDirection::In == addr.direction()) as usize
}

/// Completion handler of a bulk endpoint.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum Handler {
    /// Copy out the received data, then re-arm the read.
    BulkOut,
    /// Finish the transmission, or follow it with a zero-length packet.
    BulkIn,
}

impl Handler {
    /// The direction of the endpoints that this handler serves.
    pub fn direction(self) -> UsbDirection {
        match self {
            Handler::BulkOut => UsbDirection::Out,
            Handler::BulkIn => UsbDirection::In,
        }
    }
}

/// An endpoint address and its completion handler.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct EndpointBinding {
    pub address: EndpointAddress,
    pub handler: Handler,
}

/// Why a binding was refused.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BindError {
    /// The address is already bound.
    Duplicate,
    /// The address can't be served by the handler.
    Invalid,
}

/// The set of bound endpoints.
///
/// Each address binds at most once. Bindings are made during initialization,
/// and never released.
pub struct Bindings {
    handlers: [Option<Handler>; MAX_ENDPOINTS],
}

impl Bindings {
    pub const fn new() -> Self {
        Self {
            handlers: [None; MAX_ENDPOINTS],
        }
    }

    /// Bind the endpoint, returning an error if it's already bound, or if the
    /// address direction doesn't match the handler.
    pub fn bind(&mut self, binding: EndpointBinding) -> Result<(), BindError> {
        let EndpointBinding { address, handler } = binding;
        if address.direction() != handler.direction() || address.index() == 0 {
            return Err(BindError::Invalid);
        }
        let slot = self
            .handlers
            .get_mut(index(address))
            .ok_or(BindError::Invalid)?;
        if slot.is_some() {
            return Err(BindError::Duplicate);
        }
        *slot = Some(handler);
        Ok(())
    }

    /// Returns the handler bound to `address`.
    pub fn handler(&self, address: EndpointAddress) -> Option<Handler> {
        self.handlers.get(index(address)).copied().flatten()
    }
}

impl Default for Bindings {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::{BindError, Bindings, EndpointBinding, Handler};
    use usb_device::endpoint::EndpointAddress;

    fn binding(address: u8, handler: Handler) -> EndpointBinding {
        EndpointBinding {
            address: EndpointAddress::from(address),
            handler,
        }
    }

    #[test]
    fn bind_and_lookup() {
        let mut bindings = Bindings::new();
        bindings.bind(binding(0x02, Handler::BulkOut)).unwrap();
        bindings.bind(binding(0x81, Handler::BulkIn)).unwrap();

        assert_eq!(
            bindings.handler(EndpointAddress::from(0x02)),
            Some(Handler::BulkOut)
        );
        assert_eq!(
            bindings.handler(EndpointAddress::from(0x81)),
            Some(Handler::BulkIn)
        );
        assert_eq!(bindings.handler(EndpointAddress::from(0x82)), None);
        assert_eq!(bindings.handler(EndpointAddress::from(0x83)), None);
        assert_eq!(bindings.handler(EndpointAddress::from(0x01)), None);
    }

    #[test]
    fn duplicates_rejected() {
        let mut bindings = Bindings::new();
        bindings.bind(binding(0x02, Handler::BulkOut)).unwrap();
        for _ in 0..10 {
            assert_eq!(
                bindings.bind(binding(0x02, Handler::BulkOut)),
                Err(BindError::Duplicate)
            );
        }
    }

    #[test]
    fn direction_must_match() {
        let mut bindings = Bindings::new();
        assert_eq!(
            bindings.bind(binding(0x81, Handler::BulkOut)),
            Err(BindError::Invalid)
        );
        assert_eq!(
            bindings.bind(binding(0x02, Handler::BulkIn)),
            Err(BindError::Invalid)
        );
        // Control endpoints belong to the stack.
        assert_eq!(
            bindings.bind(binding(0x80, Handler::BulkIn)),
            Err(BindError::Invalid)
        );
        // Beyond the handler table
        assert_eq!(
            bindings.bind(binding(0x88, Handler::BulkIn)),
            Err(BindError::Invalid)
        );
        for address in [0x81, 0x02, 0x80, 0x88] {
            assert_eq!(bindings.handler(EndpointAddress::from(address)), None);
        }
    }
}
