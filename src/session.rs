//! Session state machine and bulk transfer pump
//!
//! [`Session::update`] is a pure function of the session state and an
//! [`Event`]. It never touches the USB stack; instead, it returns the
//! [`Commands`] that the caller executes against the stack. That keeps the
//! whole CDC-ACM protocol testable without hardware.

use core::task::Poll;

use usb_device::{device::UsbDeviceState, endpoint::EndpointAddress};

use crate::{
    buffer::BUFFER_SIZE, class::LineCoding, descriptor::Speed, descriptor::COMM_INTERFACE,
    SendError, BULK_IN_ENDPOINT, BULK_OUT_ENDPOINT,
};

/// USB connection lifecycle.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum State {
    Reset,
    Connected,
    Disconnected,
    Suspended,
    Resumed,
    Configured,
}

bitflags::bitflags! {
    /// Orthogonal session flags.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct Flags : u8 {
        /// The host enabled remote wakeup.
        const REMOTE_WAKEUP = 1 << 0;
        /// Data terminal ready, controlled by the host.
        const DTR = 1 << 1;
        /// Request to send, controlled by the host.
        const RTS = 1 << 2;
    }
}

/// An input to the session.
///
/// Bus events come from the USB stack. The line state events come from the
/// class request path. Completion events carry the number of bytes moved.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Event {
    Reset,
    Connected,
    Disconnected,
    Suspend,
    Resume,
    Configured,
    SetRemoteWakeup,
    ClearRemoteWakeup,
    SetDtr { interface: u8, asserted: bool },
    SetRts { interface: u8, asserted: bool },
    SetLineCoding(LineCoding),
    /// Break duration, in milliseconds
    SendBreak(u16),
    /// A bulk OUT transfer completed.
    OutComplete { bytes: usize },
    /// A bulk IN transfer completed.
    InComplete { bytes: usize },
}

/// A side effect requested by the session.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Command {
    /// Move `bytes` out of the receive buffer before it's re-armed.
    Receive { bytes: usize },
    /// Arm a read of up to `len` bytes into the receive buffer.
    StartRead { endpoint: EndpointAddress, len: usize },
    /// Write `len` bytes from the transmit buffer. Zero is a ZLP.
    StartWrite { endpoint: EndpointAddress, len: usize },
}

/// The commands produced by one update, in execution order.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct Commands {
    slots: [Option<Command>; 2],
}

impl Commands {
    const fn none() -> Self {
        Self { slots: [None; 2] }
    }

    fn one(command: Command) -> Self {
        Self {
            slots: [Some(command), None],
        }
    }

    fn two(first: Command, second: Command) -> Self {
        Self {
            slots: [Some(first), Some(second)],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.slots[0].is_none()
    }

    pub fn iter(&self) -> impl Iterator<Item = Command> + '_ {
        self.slots.iter().flatten().copied()
    }
}

impl From<Command> for Commands {
    fn from(command: Command) -> Self {
        Commands::one(command)
    }
}

/// Progress of the transmit buffer.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Transmit {
    Idle,
    /// The data transfer is with the stack.
    Data,
    /// The terminating ZLP is with the stack.
    ZeroLength,
    /// The transfer was abandoned by a bus reset or disconnect. The buffer
    /// stays claimed while `in_flight`, until the stack reports the
    /// completion. Cleared once the sender observed it and the stack is done.
    Aborted { in_flight: bool, reported: bool },
}

/// CDC-ACM session state.
#[derive(Debug)]
pub struct Session {
    state: State,
    flags: Flags,
    line_coding: LineCoding,
    transmit: Transmit,
    max_packet_size: usize,
}

impl Session {
    pub const fn new(speed: Speed) -> Self {
        Self {
            state: State::Reset,
            flags: Flags::empty(),
            line_coding: LineCoding::DEFAULT,
            transmit: Transmit::Idle,
            max_packet_size: speed.bulk_max_packet_size() as usize,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn flags(&self) -> Flags {
        self.flags
    }

    pub fn dtr(&self) -> bool {
        self.flags.contains(Flags::DTR)
    }

    pub fn rts(&self) -> bool {
        self.flags.contains(Flags::RTS)
    }

    pub fn remote_wakeup(&self) -> bool {
        self.flags.contains(Flags::REMOTE_WAKEUP)
    }

    pub fn line_coding(&self) -> LineCoding {
        self.line_coding
    }

    /// Returns `true` from the moment a write is submitted until the stack
    /// reports the end of the transfer, including the ZLP.
    ///
    /// An aborted transfer counts until the stack reports its completion.
    pub fn is_transmitting(&self) -> bool {
        matches!(
            self.transmit,
            Transmit::Data | Transmit::ZeroLength | Transmit::Aborted { in_flight: true, .. }
        )
    }

    /// The session state, in `usb-device` terms.
    ///
    /// For stacks that report [`UsbDeviceState`] to their own users.
    pub fn device_state(&self) -> UsbDeviceState {
        match self.state {
            State::Reset | State::Disconnected => UsbDeviceState::Default,
            State::Connected | State::Resumed => UsbDeviceState::Addressed,
            State::Configured => UsbDeviceState::Configured,
            State::Suspended => UsbDeviceState::Suspend,
        }
    }

    /// Advance the session, returning the commands to run against the stack.
    pub fn update(&mut self, event: Event) -> Commands {
        match event {
            Event::Reset => {
                debug!("RESET");
                self.state = State::Reset;
                self.abort_transmit();
                Commands::none()
            }
            Event::Connected => {
                debug!("CONNECTED");
                self.state = State::Connected;
                Commands::none()
            }
            Event::Disconnected => {
                debug!("DISCONNECTED");
                self.state = State::Disconnected;
                self.abort_transmit();
                Commands::none()
            }
            Event::Suspend => {
                debug!("SUSPEND");
                self.state = State::Suspended;
                Commands::none()
            }
            Event::Resume => {
                debug!("RESUME");
                self.state = State::Resumed;
                Commands::none()
            }
            Event::Configured => {
                debug!("CONFIGURED");
                self.state = State::Configured;
                Commands::one(self.arm_read())
            }
            Event::SetRemoteWakeup => {
                debug!("REMOTE_WAKEUP SET");
                self.flags.insert(Flags::REMOTE_WAKEUP);
                Commands::none()
            }
            Event::ClearRemoteWakeup => {
                debug!("REMOTE_WAKEUP CLEAR");
                self.flags.remove(Flags::REMOTE_WAKEUP);
                Commands::none()
            }
            Event::SetDtr {
                interface,
                asserted,
            } => {
                if interface == COMM_INTERFACE {
                    debug!("DTR {}", asserted);
                    self.flags.set(Flags::DTR, asserted);
                } else {
                    warn!("DTR for unknown interface {}", interface);
                }
                Commands::none()
            }
            Event::SetRts {
                interface,
                asserted,
            } => {
                if interface == COMM_INTERFACE {
                    debug!("RTS {}", asserted);
                    self.flags.set(Flags::RTS, asserted);
                } else {
                    warn!("RTS for unknown interface {}", interface);
                }
                Commands::none()
            }
            Event::SetLineCoding(line_coding) => {
                debug!("LINE CODING {}", line_coding.data_rate);
                self.line_coding = line_coding;
                Commands::none()
            }
            Event::SendBreak(_duration) => {
                debug!("BREAK {}", _duration);
                Commands::none()
            }
            Event::OutComplete { bytes } => {
                trace!("OUT COMPLETE {}", bytes);
                Commands::two(Command::Receive { bytes }, self.arm_read())
            }
            Event::InComplete { bytes } => {
                trace!("IN COMPLETE {}", bytes);
                self.in_complete(bytes)
            }
        }
    }

    fn arm_read(&self) -> Command {
        Command::StartRead {
            endpoint: EndpointAddress::from(BULK_OUT_ENDPOINT),
            len: BUFFER_SIZE,
        }
    }

    fn in_complete(&mut self, bytes: usize) -> Commands {
        match self.transmit {
            Transmit::Data if bytes != 0 && bytes % self.max_packet_size == 0 => {
                trace!("ZLP");
                self.transmit = Transmit::ZeroLength;
                Commands::one(Command::StartWrite {
                    endpoint: EndpointAddress::from(BULK_IN_ENDPOINT),
                    len: 0,
                })
            }
            Transmit::Data | Transmit::ZeroLength => {
                self.transmit = Transmit::Idle;
                Commands::none()
            }
            // The abandoned transfer is back. No ZLP.
            Transmit::Aborted {
                in_flight: true,
                reported,
            } => {
                debug!("Aborted transfer returned {}", bytes);
                self.transmit = if reported {
                    Transmit::Idle
                } else {
                    Transmit::Aborted {
                        in_flight: false,
                        reported,
                    }
                };
                Commands::none()
            }
            Transmit::Idle | Transmit::Aborted { in_flight: false, .. } => {
                warn!("Unexpected IN completion {}", bytes);
                Commands::none()
            }
        }
    }

    fn abort_transmit(&mut self) {
        if matches!(self.transmit, Transmit::Data | Transmit::ZeroLength) {
            warn!("Transmit aborted");
            self.transmit = Transmit::Aborted {
                in_flight: true,
                reported: false,
            };
        }
    }

    /// Claim the transmit buffer for a write of `len` bytes.
    ///
    /// Returns the write to submit. Fails without side effects if DTR isn't
    /// asserted, or if a transmission is outstanding. An aborted transfer is
    /// outstanding until the stack reports its completion.
    pub fn begin_send(&mut self, len: usize) -> Result<Command, SendError> {
        if !self.dtr() {
            return Err(SendError::NotReady);
        }
        if self.is_transmitting() {
            return Err(SendError::Busy);
        }
        self.transmit = Transmit::Data;
        trace!("SEND {}", len);
        Ok(Command::StartWrite {
            endpoint: EndpointAddress::from(BULK_IN_ENDPOINT),
            len,
        })
    }

    /// Release the transmit buffer after the stack refused the write.
    pub fn cancel_send(&mut self) {
        self.transmit = Transmit::Idle;
    }

    /// Check on the outstanding transmission.
    ///
    /// `Ready(Ok(()))` once the transfer, and any ZLP, completed. An abort is
    /// reported once. After that, the transmitter stays busy until the stack
    /// returns the abandoned transfer.
    pub fn poll_transmit(&mut self) -> Poll<Result<(), SendError>> {
        match self.transmit {
            Transmit::Idle => Poll::Ready(Ok(())),
            Transmit::Aborted {
                in_flight,
                reported: false,
            } => {
                self.transmit = if in_flight {
                    Transmit::Aborted {
                        in_flight,
                        reported: true,
                    }
                } else {
                    Transmit::Idle
                };
                Poll::Ready(Err(SendError::Aborted))
            }
            Transmit::Data | Transmit::ZeroLength | Transmit::Aborted { .. } => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    extern crate std;
    use std::vec::Vec;

    fn out_ep() -> EndpointAddress {
        EndpointAddress::from(BULK_OUT_ENDPOINT)
    }

    fn in_ep() -> EndpointAddress {
        EndpointAddress::from(BULK_IN_ENDPOINT)
    }

    fn collect(commands: Commands) -> Vec<Command> {
        commands.iter().collect()
    }

    fn configured(speed: Speed) -> Session {
        let mut session = Session::new(speed);
        session.update(Event::Reset);
        session.update(Event::Connected);
        session.update(Event::Configured);
        session
    }

    fn dtr(session: &mut Session, asserted: bool) {
        session.update(Event::SetDtr {
            interface: COMM_INTERFACE,
            asserted,
        });
    }

    #[test]
    fn configure_arms_one_read() {
        let mut session = Session::new(Speed::Full);
        assert!(session.update(Event::Reset).is_empty());
        assert!(session.update(Event::Connected).is_empty());
        assert_eq!(
            collect(session.update(Event::Configured)),
            [Command::StartRead {
                endpoint: out_ep(),
                len: 2048
            }]
        );
        assert_eq!(session.state(), State::Configured);
        assert_eq!(session.device_state(), UsbDeviceState::Configured);
    }

    #[test]
    fn out_complete_always_rearms() {
        let mut session = configured(Speed::Full);
        for bytes in [0, 1, 63, 64, 2048] {
            assert_eq!(
                collect(session.update(Event::OutComplete { bytes })),
                [
                    Command::Receive { bytes },
                    Command::StartRead {
                        endpoint: out_ep(),
                        len: 2048
                    }
                ]
            );
        }
    }

    #[test]
    fn lifecycle_events_have_no_side_effects() {
        let mut session = configured(Speed::Full);
        for event in [
            Event::Suspend,
            Event::Resume,
            Event::SetRemoteWakeup,
            Event::ClearRemoteWakeup,
            Event::SendBreak(10),
            Event::Disconnected,
            Event::Connected,
        ] {
            assert!(session.update(event).is_empty(), "{event:?}");
        }
        assert_eq!(session.state(), State::Connected);
    }

    #[test]
    fn suspend_resume_states() {
        let mut session = configured(Speed::Full);
        session.update(Event::Suspend);
        assert_eq!(session.state(), State::Suspended);
        assert_eq!(session.device_state(), UsbDeviceState::Suspend);
        session.update(Event::Resume);
        assert_eq!(session.state(), State::Resumed);
    }

    #[test]
    fn flags() {
        let mut session = Session::new(Speed::Full);
        session.update(Event::SetRemoteWakeup);
        assert!(session.remote_wakeup());
        session.update(Event::ClearRemoteWakeup);
        assert!(!session.remote_wakeup());

        dtr(&mut session, true);
        session.update(Event::SetRts {
            interface: COMM_INTERFACE,
            asserted: true,
        });
        assert_eq!(session.flags(), Flags::DTR | Flags::RTS);
        dtr(&mut session, false);
        assert!(!session.dtr());
        assert!(session.rts());
    }

    #[test]
    fn dtr_for_other_interface_ignored() {
        let mut session = Session::new(Speed::Full);
        session.update(Event::SetDtr {
            interface: 1,
            asserted: true,
        });
        assert!(!session.dtr());
    }

    #[test]
    fn line_coding() {
        let mut session = Session::new(Speed::Full);
        assert_eq!(session.line_coding(), LineCoding::DEFAULT);
        let coding = LineCoding {
            data_rate: 9600,
            ..LineCoding::DEFAULT
        };
        assert!(session.update(Event::SetLineCoding(coding)).is_empty());
        assert_eq!(session.line_coding(), coding);
    }

    #[test]
    fn send_requires_dtr() {
        let mut session = configured(Speed::Full);
        assert_eq!(session.begin_send(2048), Err(SendError::NotReady));
        assert!(!session.is_transmitting());
    }

    #[test]
    fn full_packet_ends_with_zlp() {
        let mut session = configured(Speed::Full);
        dtr(&mut session, true);

        assert_eq!(
            session.begin_send(2048),
            Ok(Command::StartWrite {
                endpoint: in_ep(),
                len: 2048
            })
        );
        assert!(session.is_transmitting());
        assert_eq!(session.poll_transmit(), Poll::Pending);

        assert_eq!(
            collect(session.update(Event::InComplete { bytes: 2048 })),
            [Command::StartWrite {
                endpoint: in_ep(),
                len: 0
            }]
        );
        assert!(session.is_transmitting());

        assert!(session.update(Event::InComplete { bytes: 0 }).is_empty());
        assert!(!session.is_transmitting());
        assert_eq!(session.poll_transmit(), Poll::Ready(Ok(())));
    }

    #[test]
    fn short_packet_needs_no_zlp() {
        let mut session = configured(Speed::Full);
        dtr(&mut session, true);
        session.begin_send(100).unwrap();
        assert!(session.update(Event::InComplete { bytes: 100 }).is_empty());
        assert!(!session.is_transmitting());
    }

    #[test]
    fn zlp_rule_follows_speed() {
        let mut session = configured(Speed::High);
        dtr(&mut session, true);

        // A multiple of 64, but not of 512
        session.begin_send(576).unwrap();
        assert!(session.update(Event::InComplete { bytes: 576 }).is_empty());

        session.begin_send(1024).unwrap();
        assert_eq!(
            collect(session.update(Event::InComplete { bytes: 1024 })),
            [Command::StartWrite {
                endpoint: in_ep(),
                len: 0
            }]
        );
    }

    #[test]
    fn busy_rejects_second_send() {
        let mut session = configured(Speed::Full);
        dtr(&mut session, true);
        session.begin_send(2048).unwrap();
        assert_eq!(session.begin_send(2048), Err(SendError::Busy));

        // Still busy during the ZLP
        session.update(Event::InComplete { bytes: 2048 });
        assert_eq!(session.begin_send(2048), Err(SendError::Busy));
    }

    #[test]
    fn reset_aborts_transmit() {
        let mut session = configured(Speed::Full);
        dtr(&mut session, true);
        session.begin_send(2048).unwrap();

        session.update(Event::Reset);
        assert_eq!(session.poll_transmit(), Poll::Ready(Err(SendError::Aborted)));

        // The stack still holds the buffer.
        assert!(session.is_transmitting());
        assert_eq!(session.poll_transmit(), Poll::Pending);
        assert_eq!(session.begin_send(2048), Err(SendError::Busy));

        // The late completion doesn't produce a ZLP, and frees the buffer.
        assert!(session.update(Event::InComplete { bytes: 2048 }).is_empty());
        assert!(!session.is_transmitting());
        assert_eq!(session.poll_transmit(), Poll::Ready(Ok(())));
        assert!(session.begin_send(2048).is_ok());
    }

    #[test]
    fn aborted_transfer_returns_before_sender_looks() {
        let mut session = configured(Speed::Full);
        dtr(&mut session, true);
        session.begin_send(64).unwrap();

        session.update(Event::Reset);
        assert!(session.update(Event::InComplete { bytes: 64 }).is_empty());
        assert!(!session.is_transmitting());

        assert_eq!(session.poll_transmit(), Poll::Ready(Err(SendError::Aborted)));
        assert_eq!(session.poll_transmit(), Poll::Ready(Ok(())));
    }

    #[test]
    fn reset_during_zlp_holds_buffer() {
        let mut session = configured(Speed::Full);
        dtr(&mut session, true);
        session.begin_send(64).unwrap();
        session.update(Event::InComplete { bytes: 64 });

        session.update(Event::Disconnected);
        assert_eq!(session.begin_send(64), Err(SendError::Busy));
        assert!(session.update(Event::InComplete { bytes: 0 }).is_empty());
        assert_eq!(session.poll_transmit(), Poll::Ready(Err(SendError::Aborted)));
        assert!(session.begin_send(64).is_ok());
    }

    #[test]
    fn every_configuration_arms_a_read() {
        let mut session = configured(Speed::Full);
        session.update(Event::Reset);
        session.update(Event::Connected);
        assert_eq!(
            collect(session.update(Event::Configured)),
            [Command::StartRead {
                endpoint: out_ep(),
                len: 2048
            }]
        );
        // SET_CONFIGURATION again, without a reset
        assert_eq!(
            collect(session.update(Event::Configured)),
            [Command::StartRead {
                endpoint: out_ep(),
                len: 2048
            }]
        );
    }

    #[test]
    fn disconnect_aborts_transmit() {
        let mut session = configured(Speed::Full);
        dtr(&mut session, true);
        session.begin_send(64).unwrap();
        session.update(Event::Disconnected);
        assert_eq!(session.poll_transmit(), Poll::Ready(Err(SendError::Aborted)));
    }

    #[test]
    fn cancel_send_releases_buffer() {
        let mut session = configured(Speed::Full);
        dtr(&mut session, true);
        session.begin_send(2048).unwrap();
        session.cancel_send();
        assert!(!session.is_transmitting());
        assert!(session.begin_send(2048).is_ok());
    }
}
