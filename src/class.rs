//! CDC-ACM class requests
//!
//! The host configures the virtual serial port with class-specific control
//! requests sent to the communications interface.

use usb_device::{
    control::{Recipient, Request, RequestType},
    UsbDirection,
};

use crate::descriptor::COMM_INTERFACE;

pub const SET_LINE_CODING: u8 = 0x20;
pub const GET_LINE_CODING: u8 = 0x21;
pub const SET_CONTROL_LINE_STATE: u8 = 0x22;
pub const SEND_BREAK: u8 = 0x23;

bitflags::bitflags! {
    /// `wValue` of SET_CONTROL_LINE_STATE.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct ControlLineState : u16 {
        /// Data terminal ready
        const DTR = 1 << 0;
        /// Request to send (carrier control)
        const RTS = 1 << 1;
    }
}

/// Number of stop bits.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
#[repr(u8)]
pub enum StopBits {
    One = 0,
    OnePointFive = 1,
    Two = 2,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
#[repr(u8)]
pub enum Parity {
    None = 0,
    Odd = 1,
    Even = 2,
    Mark = 3,
    Space = 4,
}

/// Serial settings requested by the host.
///
/// The device moves bytes at USB speed; the line coding is bookkeeping for
/// applications that bridge to a real UART.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct LineCoding {
    /// Bits per second
    pub data_rate: u32,
    pub stop_bits: StopBits,
    pub parity: Parity,
    /// 5, 6, 7, 8 or 16
    pub data_bits: u8,
}

impl LineCoding {
    /// Size of the line coding structure on the wire.
    pub const SIZE: usize = 7;

    /// 2Mbit/s, 8N1
    pub const DEFAULT: Self = Self {
        data_rate: 2_000_000,
        stop_bits: StopBits::One,
        parity: Parity::None,
        data_bits: 8,
    };

    /// Parse the structure sent with SET_LINE_CODING.
    ///
    /// Returns `None` if `bytes` is short, or holds an unknown setting.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let bytes: &[u8; Self::SIZE] = bytes.get(..Self::SIZE)?.try_into().ok()?;
        let stop_bits = match bytes[4] {
            0 => StopBits::One,
            1 => StopBits::OnePointFive,
            2 => StopBits::Two,
            _ => return None,
        };
        let parity = match bytes[5] {
            0 => Parity::None,
            1 => Parity::Odd,
            2 => Parity::Even,
            3 => Parity::Mark,
            4 => Parity::Space,
            _ => return None,
        };
        let data_bits = match bytes[6] {
            bits @ (5..=8 | 16) => bits,
            _ => return None,
        };
        Some(Self {
            data_rate: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            stop_bits,
            parity,
            data_bits,
        })
    }

    /// The reply to GET_LINE_CODING.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let [r0, r1, r2, r3] = self.data_rate.to_le_bytes();
        [
            r0,
            r1,
            r2,
            r3,
            self.stop_bits as u8,
            self.parity as u8,
            self.data_bits,
        ]
    }
}

impl Default for LineCoding {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// A decoded CDC-ACM class request.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ClassRequest {
    SetLineCoding(LineCoding),
    GetLineCoding,
    SetControlLineState(ControlLineState),
    /// Break duration in milliseconds; `0xFFFF` holds the break until the
    /// next SEND_BREAK.
    SendBreak(u16),
}

impl ClassRequest {
    /// Decode a control request, and its data stage for host-to-device
    /// requests.
    ///
    /// Returns `None` for anything that isn't a CDC-ACM request to the
    /// communications interface, or that carries malformed data.
    pub fn decode(req: &Request, data: &[u8]) -> Option<Self> {
        if req.request_type != RequestType::Class
            || req.recipient != Recipient::Interface
            || (req.index & 0xFF) as u8 != COMM_INTERFACE
        {
            return None;
        }
        match (req.direction, req.request) {
            (UsbDirection::Out, SET_LINE_CODING) => {
                LineCoding::from_bytes(data).map(ClassRequest::SetLineCoding)
            }
            (UsbDirection::In, GET_LINE_CODING) => Some(ClassRequest::GetLineCoding),
            (UsbDirection::Out, SET_CONTROL_LINE_STATE) => Some(ClassRequest::SetControlLineState(
                ControlLineState::from_bits_truncate(req.value),
            )),
            (UsbDirection::Out, SEND_BREAK) => Some(ClassRequest::SendBreak(req.value)),
            _ => None,
        }
    }
}
