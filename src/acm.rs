//! The CDC-ACM driver object
//!
//! [`CdcAcm`] owns the USB stack, the session, the endpoint bindings, and the
//! transfer buffers. It's designed to live in a `static`, shared between the
//! USB interrupt handler and the application. Every method runs in a short
//! critical section; blocking sends idle *outside* of the critical section,
//! so that completion interrupts make progress.

use core::{cell::RefCell, task::Poll};

use critical_section::Mutex;
use usb_device::{
    control::Request,
    endpoint::{EndpointAddress, EndpointType},
    UsbError,
};

use crate::{
    buffer::{Buffer, TransferMemory, BUFFER_SIZE},
    class::{ClassRequest, ControlLineState, LineCoding},
    descriptor::{DescriptorTable, COMM_INTERFACE, DATA_INTERFACE},
    endpoint::{BindError, Bindings, EndpointBinding, Handler},
    fifo::Fifo,
    session::{Command, Commands, Event, Session, State},
    wait::Deadline,
    InitError, InterfaceKind, SendError, UsbStack, BULK_IN_ENDPOINT, BULK_OUT_ENDPOINT,
};

/// How the stack should finish a class control request.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ControlOutcome {
    /// Complete the status stage.
    Accepted,
    /// Send these bytes in the data stage.
    Reply([u8; LineCoding::SIZE]),
    /// Stall the request.
    Rejected,
}

/// Why a call couldn't reach the driver.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Unavailable {
    Uninitialized,
    /// The driver is already in use further up the call stack, for instance
    /// by a stack that reports a completion from inside `start_write`.
    Reentrant,
}

impl From<Unavailable> for UsbError {
    fn from(_: Unavailable) -> Self {
        UsbError::InvalidState
    }
}

impl From<Unavailable> for SendError {
    fn from(err: Unavailable) -> Self {
        match err {
            Unavailable::Uninitialized => SendError::Uninitialized,
            Unavailable::Reentrant => SendError::Stack(UsbError::InvalidState),
        }
    }
}

/// Initialized driver state.
struct Driver<S, const FIFO: usize> {
    stack: S,
    session: Session,
    bindings: Bindings,
    rx: Buffer,
    tx: Buffer,
    fifo: Fifo<FIFO>,
}

/// A CDC-ACM function.
///
/// `FIFO` sizes the receive FIFO, which holds OUT data until the application
/// [`read`](CdcAcm::read)s it.
pub struct CdcAcm<S, const FIFO: usize = BUFFER_SIZE> {
    driver: Mutex<RefCell<Option<Driver<S, FIFO>>>>,
}

impl<S: UsbStack, const FIFO: usize> CdcAcm<S, FIFO> {
    /// Create an uninitialized CDC-ACM function.
    pub const fn new() -> Self {
        Self {
            driver: Mutex::new(RefCell::new(None)),
        }
    }

    /// Interrupt-safe, immutable access to the driver
    ///
    /// `None` before initialization, or while the driver is mutably borrowed
    /// further up the call stack.
    fn with_driver<R>(&self, func: impl FnOnce(&Driver<S, FIFO>) -> R) -> Option<R> {
        critical_section::with(|cs| {
            let driver = self.driver.borrow(cs).try_borrow().ok()?;
            driver.as_ref().map(func)
        })
    }

    /// Interrupt-safe, mutable access to the driver
    fn with_driver_mut<R>(
        &self,
        func: impl FnOnce(&mut Driver<S, FIFO>) -> R,
    ) -> Result<R, Unavailable> {
        critical_section::with(|cs| {
            let Ok(mut driver) = self.driver.borrow(cs).try_borrow_mut() else {
                warn!("Reentrant call refused");
                return Err(Unavailable::Reentrant);
            };
            driver.as_mut().map(func).ok_or(Unavailable::Uninitialized)
        })
    }

    /// Register the function with `stack`, then start the stack.
    ///
    /// Validates the descriptors, then registers the descriptor table, both
    /// interfaces, and the bulk endpoints, in that order. Once the stack is
    /// initialized, takes the transfer memory and fills the transmit buffer
    /// with the test payload. On error, the transfer memory is left as it was
    /// found, so a later `init` may use it.
    pub fn init(
        &self,
        mut stack: S,
        descriptors: &'static DescriptorTable,
        rx_memory: &'static TransferMemory<BUFFER_SIZE>,
        tx_memory: &'static TransferMemory<BUFFER_SIZE>,
    ) -> Result<(), InitError> {
        if self.with_driver(|_| ()).is_some() {
            return Err(InitError::AlreadyInitialized);
        }
        descriptors.validate()?;

        stack.register_descriptor_table(descriptors.as_bytes())?;
        for (kind, expected) in [
            (InterfaceKind::Communications, COMM_INTERFACE),
            (InterfaceKind::Data, DATA_INTERFACE),
        ] {
            let actual = stack.register_interface(kind)?;
            if actual != expected {
                return Err(InitError::InterfaceMismatch { expected, actual });
            }
        }

        let mut bindings = Bindings::new();
        for (address, handler) in [
            (BULK_OUT_ENDPOINT, Handler::BulkOut),
            (BULK_IN_ENDPOINT, Handler::BulkIn),
        ] {
            let address = EndpointAddress::from(address);
            bindings
                .bind(EndpointBinding { address, handler })
                .map_err(|err| match err {
                    BindError::Duplicate => InitError::DuplicateEndpoint,
                    BindError::Invalid => InitError::InvalidEndpoint,
                })?;
            stack.register_endpoint(address, EndpointType::Bulk)?;
        }
        stack.initialize()?;

        let rx = rx_memory.take().ok_or(InitError::MemoryInUse)?;
        let Some(mut tx) = tx_memory.take() else {
            rx_memory.release(rx);
            return Err(InitError::MemoryInUse);
        };
        tx.fill_test_pattern();

        let driver = Driver {
            stack,
            session: Session::new(descriptors.speed()),
            bindings,
            rx,
            tx,
            fifo: Fifo::new(),
        };
        critical_section::with(|cs| match self.driver.borrow(cs).try_borrow_mut() {
            Ok(mut slot) if slot.is_none() => {
                *slot = Some(driver);
                debug!("INITIALIZED");
                Ok(())
            }
            _ => {
                rx_memory.release(driver.rx);
                tx_memory.release(driver.tx);
                Err(InitError::AlreadyInitialized)
            }
        })
    }

    /// Access the USB stack.
    ///
    /// Returns `None` before initialization, or when called from inside the
    /// stack.
    pub fn with_stack<R>(&self, func: impl FnOnce(&mut S) -> R) -> Option<R> {
        self.with_driver_mut(|driver| func(&mut driver.stack)).ok()
    }

    /// Handle a bus or session event reported by the stack.
    ///
    /// Returns [`UsbError::InvalidState`] before initialization, or when
    /// called from inside a [`UsbStack`] method.
    pub fn handle(&self, event: Event) -> Result<(), UsbError> {
        self.with_driver_mut(|driver| driver.dispatch(event))?
    }

    /// Handle the completion of a transfer on a bound endpoint.
    ///
    /// `bytes` is the number of bytes actually transferred. Returns
    /// [`UsbError::InvalidState`] before initialization, or when called from
    /// inside a [`UsbStack`] method; the completion is not recorded.
    pub fn on_transfer_complete(
        &self,
        address: EndpointAddress,
        bytes: usize,
    ) -> Result<(), UsbError> {
        self.with_driver_mut(|driver| match driver.bindings.handler(address) {
            Some(Handler::BulkOut) => driver.dispatch(Event::OutComplete { bytes }),
            Some(Handler::BulkIn) => driver.dispatch(Event::InComplete { bytes }),
            None => {
                warn!("Completion on unbound endpoint {:?}", address);
                Err(UsbError::InvalidEndpoint)
            }
        })?
    }

    /// Handle a class-specific control request.
    ///
    /// `data` is the data stage of host-to-device requests.
    pub fn control_request(&self, req: &Request, data: &[u8]) -> ControlOutcome {
        let Some(request) = ClassRequest::decode(req, data) else {
            warn!("Rejected control request {}", req.request);
            return ControlOutcome::Rejected;
        };
        self.with_driver_mut(|driver| {
            let events = match request {
                ClassRequest::GetLineCoding => {
                    return ControlOutcome::Reply(driver.session.line_coding().to_bytes())
                }
                ClassRequest::SetLineCoding(line_coding) => {
                    [Some(Event::SetLineCoding(line_coding)), None]
                }
                ClassRequest::SetControlLineState(state) => [
                    Some(Event::SetDtr {
                        interface: COMM_INTERFACE,
                        asserted: state.contains(ControlLineState::DTR),
                    }),
                    Some(Event::SetRts {
                        interface: COMM_INTERFACE,
                        asserted: state.contains(ControlLineState::RTS),
                    }),
                ],
                ClassRequest::SendBreak(duration) => [Some(Event::SendBreak(duration)), None],
            };
            let accepted = events
                .into_iter()
                .flatten()
                .all(|event| driver.dispatch(event).is_ok());
            if accepted {
                ControlOutcome::Accepted
            } else {
                ControlOutcome::Rejected
            }
        })
        .unwrap_or(ControlOutcome::Rejected)
    }

    /// Submit the whole transmit buffer, without waiting for completion.
    pub fn try_send(&self) -> Result<(), SendError> {
        self.submit(None).map(|_| ())
    }

    /// Check on the outstanding transmission.
    ///
    /// Ready once the transfer and its ZLP (if any) completed, or once the
    /// transmission was aborted. After an abort, the transmitter stays busy
    /// until the stack returns the abandoned transfer.
    pub fn poll_send(&self) -> Poll<Result<(), SendError>> {
        self.with_driver_mut(|driver| driver.session.poll_transmit())
            .unwrap_or_else(|err| Poll::Ready(Err(err.into())))
    }

    /// Transmit the whole transmit buffer, then wait for completion.
    ///
    /// Returns [`SendError::NotReady`] without submitting anything if the
    /// host hasn't asserted DTR. Between checks, calls `idle`; gives up with
    /// [`SendError::Timeout`] once `deadline` expires.
    pub fn send<D: Deadline, I: FnMut()>(&self, deadline: D, idle: I) -> Result<(), SendError> {
        self.try_send()?;
        self.wait(deadline, idle)
    }

    /// Copy `data` into the transmit buffer, transmit it, then wait for
    /// completion.
    ///
    /// Transmits at most [`BUFFER_SIZE`] bytes, and returns the number of
    /// bytes transmitted. Gating, waiting, and errors are the same as
    /// [`send`](Self::send). The transmit buffer is untouched if the write
    /// isn't submitted.
    pub fn write<D: Deadline, I: FnMut()>(
        &self,
        data: &[u8],
        deadline: D,
        idle: I,
    ) -> Result<usize, SendError> {
        let len = self.submit(Some(data))?;
        self.wait(deadline, idle)?;
        Ok(len)
    }

    fn submit(&self, data: Option<&[u8]>) -> Result<usize, SendError> {
        self.with_driver_mut(|driver| {
            let len = data.map_or(driver.tx.len(), |data| data.len().min(driver.tx.len()));
            let command = driver.session.begin_send(len)?;
            if let Some(data) = data {
                driver.tx.volatile_write(&data[..len]);
            }
            driver
                .execute(Commands::from(command))
                .map_err(SendError::Stack)?;
            Ok(len)
        })?
    }

    fn wait<D: Deadline, I: FnMut()>(&self, mut deadline: D, mut idle: I) -> Result<(), SendError> {
        loop {
            if let Poll::Ready(result) = self.poll_send() {
                return result;
            }
            if deadline.expired() {
                debug!("SEND TIMEOUT");
                return Err(SendError::Timeout);
            }
            idle();
        }
    }

    /// Move received bytes into `buf`, returning the number of bytes moved.
    pub fn read(&self, buf: &mut [u8]) -> usize {
        self.with_driver_mut(|driver| driver.fifo.pop(buf))
            .unwrap_or(0)
    }

    /// Number of received bytes waiting to be read.
    pub fn available(&self) -> usize {
        self.with_driver(|driver| driver.fifo.len()).unwrap_or(0)
    }

    /// Total received bytes dropped because the receive FIFO was full.
    pub fn dropped(&self) -> usize {
        self.with_driver(|driver| driver.fifo.dropped())
            .unwrap_or(0)
    }

    /// Returns `true` if the host asserted DTR.
    pub fn dtr(&self) -> bool {
        self.with_driver(|driver| driver.session.dtr())
            .unwrap_or(false)
    }

    /// Returns `true` if the host asserted RTS.
    pub fn rts(&self) -> bool {
        self.with_driver(|driver| driver.session.rts())
            .unwrap_or(false)
    }

    pub fn line_coding(&self) -> LineCoding {
        self.with_driver(|driver| driver.session.line_coding())
            .unwrap_or(LineCoding::DEFAULT)
    }

    /// The session state, or `None` before initialization.
    pub fn state(&self) -> Option<State> {
        self.with_driver(|driver| driver.session.state())
    }

    /// Returns `true` while a transmission is outstanding.
    pub fn is_transmitting(&self) -> bool {
        self.with_driver(|driver| driver.session.is_transmitting())
            .unwrap_or(false)
    }
}

impl<S: UsbStack, const FIFO: usize> Default for CdcAcm<S, FIFO> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: UsbStack, const FIFO: usize> Driver<S, FIFO> {
    fn dispatch(&mut self, event: Event) -> Result<(), UsbError> {
        let commands = self.session.update(event);
        self.execute(commands)
    }

    fn execute(&mut self, commands: Commands) -> Result<(), UsbError> {
        for command in commands.iter() {
            match command {
                Command::Receive { bytes } => self.receive(bytes),
                Command::StartRead { endpoint, len } => {
                    let len = len.min(self.rx.len());
                    // Safety: the receive buffer is 'static, and only read
                    // after the stack reports the transfer complete.
                    unsafe { self.stack.start_read(endpoint, self.rx.as_ptr(), len) }?;
                }
                Command::StartWrite { endpoint, len } => {
                    let len = len.min(self.tx.len());
                    // Safety: the transmit buffer is 'static, and only written
                    // while the session isn't transmitting.
                    let result = unsafe { self.stack.start_write(endpoint, self.tx.as_ptr(), len) };
                    if let Err(err) = result {
                        warn!("Write refused {:?}", err);
                        self.session.cancel_send();
                        return Err(err);
                    }
                }
            }
        }
        Ok(())
    }

    /// Copy received bytes out of the receive buffer, and into the FIFO.
    fn receive(&mut self, bytes: usize) {
        let bytes = bytes.min(self.rx.len());
        let mut chunk = [0; 64];
        let mut offset = 0;
        while offset < bytes {
            let len = (bytes - offset).min(chunk.len());
            self.rx.volatile_read_at(offset, &mut chunk[..len]);
            if self.fifo.push(&chunk[..len]) < len {
                warn!("Receive FIFO full, {} dropped", self.fifo.dropped());
            }
            offset += len;
        }
    }
}
