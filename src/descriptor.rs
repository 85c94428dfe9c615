//! USB descriptor table
//!
//! The table is one immutable byte sequence: the device descriptor, the
//! configuration descriptor and everything it encloses (interface
//! association, the CDC communications and data interfaces, functional
//! descriptors, endpoints), the language ID string, the manufacturer,
//! product and serial number strings, and (high speed only) the device
//! qualifier. A zero byte terminates the table for stacks that scan it.
//!
//! Build the table in a `const` context. An invalid [`DeviceConfig`] is then
//! a compile-time error, not a runtime condition.
//!
//! ```
//! use cdc_acm_device::descriptor::{DescriptorTable, DeviceConfig, Speed};
//!
//! static DESCRIPTORS: DescriptorTable =
//!     DescriptorTable::new(&DeviceConfig::REFERENCE.with_speed(Speed::High));
//!
//! assert_eq!(DESCRIPTORS.bulk_max_packet_size(), 512);
//! assert!(DESCRIPTORS.validate().is_ok());
//! ```

use core::fmt;
use usb_device::descriptor::descriptor_type::{CONFIGURATION, DEVICE, ENDPOINT, INTERFACE, STRING};

/// Descriptor type of the device qualifier.
pub const DEVICE_QUALIFIER: u8 = 0x06;
/// Descriptor type of the interface association descriptor (IAD).
pub const INTERFACE_ASSOCIATION: u8 = 0x0B;

const CS_INTERFACE: u8 = 0x24;
const CDC_TYPE_HEADER: u8 = 0x00;
const CDC_TYPE_CALL_MANAGEMENT: u8 = 0x01;
const CDC_TYPE_ACM: u8 = 0x02;
const CDC_TYPE_UNION: u8 = 0x06;

/// CDC 1.10
const BCD_CDC: u16 = 0x0110;
/// USB 2.0
const BCD_USB: u16 = 0x0200;

const USB_CLASS_MISC: u8 = 0xEF;
const MISC_SUBCLASS_COMMON: u8 = 0x02;
const MISC_PROTOCOL_IAD: u8 = 0x01;

const USB_CLASS_CDC: u8 = 0x02;
const CDC_SUBCLASS_ACM: u8 = 0x02;
const CDC_PROTOCOL_AT: u8 = 0x01;
const USB_CLASS_CDC_DATA: u8 = 0x0A;

/// Line coding and serial state requests (bit 1), and SEND_BREAK (bit 2).
const ACM_CAPABILITIES: u8 = 0x06;

const CONTROL_MAX_PACKET_SIZE: u8 = 64;
const NOTIFY_MAX_PACKET_SIZE: u16 = 8;
const NOTIFY_INTERVAL: u8 = 0x0A;

const BULK: u8 = 0x02;
const INTERRUPT: u8 = 0x03;

const ATTRIBUTES_RESERVED: u8 = 0x80;
const ATTRIBUTES_REMOTE_WAKEUP: u8 = 0x20;

/// Interface number of the CDC communications (control) interface.
pub const COMM_INTERFACE: u8 = 0;
/// Interface number of the CDC data interface.
pub const DATA_INTERFACE: u8 = 1;

/// Maximum size of a descriptor table, in bytes.
pub const TABLE_CAPACITY: usize = 256;

/// The longest string, in UTF-16 code units, that fits a string descriptor.
pub const MAX_STRING_LEN: usize = (u8::MAX as usize - 2) / 2;

/// Index of the manufacturer string.
pub const MANUFACTURER_STRING: u8 = 1;
/// Index of the product string.
pub const PRODUCT_STRING: u8 = 2;
/// Index of the serial number string.
pub const SERIAL_NUMBER_STRING: u8 = 3;

/// USB full / high speed setting.
///
/// The speed selects the bulk endpoint max packet size, and decides if the
/// table carries a device qualifier.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum Speed {
    /// Full speed only.
    ///
    /// Bulk endpoints move 64 byte packets. There's no device qualifier.
    #[default]
    Full,
    /// High speed.
    ///
    /// Bulk endpoints move 512 byte packets. The table describes the
    /// alternate speed with a device qualifier.
    High,
}

impl Speed {
    /// Returns the max packet size of the bulk endpoints at this speed.
    pub const fn bulk_max_packet_size(self) -> u16 {
        match self {
            Speed::Full => 64,
            Speed::High => 512,
        }
    }
}

/// Identity and build-time settings of the device.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct DeviceConfig {
    pub speed: Speed,
    pub vendor_id: u16,
    pub product_id: u16,
    /// `bcdDevice`
    pub device_release: u16,
    /// Bus power draw, up to 500mA.
    pub max_power_ma: u16,
    /// Advertise remote wakeup support.
    pub remote_wakeup: bool,
    pub language_id: u16,
    pub manufacturer: &'static str,
    pub product: &'static str,
    pub serial_number: &'static str,
}

impl DeviceConfig {
    /// The reference configuration.
    ///
    /// A full speed, bus powered (100mA) device, with the wildcard
    /// VID / PID, and English (United States) strings.
    pub const REFERENCE: Self = Self {
        speed: Speed::Full,
        vendor_id: 0xFFFF,
        product_id: 0xFFFF,
        device_release: 0x0100,
        max_power_ma: 100,
        remote_wakeup: false,
        language_id: 0x0409,
        manufacturer: "CDC-ACM",
        product: "CDC-ACM Serial Port",
        serial_number: "2022123456",
    };

    /// Returns this configuration, running at `speed`.
    pub const fn with_speed(mut self, speed: Speed) -> Self {
        self.speed = speed;
        self
    }
}

/// Invalid descriptor configuration, or malformed descriptor bytes.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum DescriptorError {
    /// The descriptors don't fit in [`TABLE_CAPACITY`] bytes.
    TableOverflow,
    /// A string is longer than [`MAX_STRING_LEN`] code units.
    StringTooLong,
    /// Bus power above 500mA.
    PowerOutOfRange,
    /// A descriptor is missing, truncated, or out of order.
    Malformed,
    /// `wTotalLength` doesn't match the bytes in the configuration.
    TotalLengthMismatch,
    /// A bulk endpoint doesn't use the max packet size of the speed.
    PacketSizeMismatch,
    /// The device qualifier presence doesn't match the speed.
    QualifierMismatch,
}

impl DescriptorError {
    pub const fn as_str(&self) -> &'static str {
        match self {
            DescriptorError::TableOverflow => "descriptor table overflow",
            DescriptorError::StringTooLong => "string descriptor too long",
            DescriptorError::PowerOutOfRange => "max power exceeds 500mA",
            DescriptorError::Malformed => "malformed descriptor",
            DescriptorError::TotalLengthMismatch => "wTotalLength mismatch",
            DescriptorError::PacketSizeMismatch => "bulk max packet size mismatch",
            DescriptorError::QualifierMismatch => "device qualifier mismatch",
        }
    }
}

impl fmt::Display for DescriptorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The device's descriptors, serialized.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct DescriptorTable {
    bytes: [u8; TABLE_CAPACITY],
    len: usize,
    speed: Speed,
}

impl DescriptorTable {
    /// Build the descriptor table for `config`.
    ///
    /// # Panics
    ///
    /// Panics if the configuration is invalid. In a `const` or `static`
    /// initializer, that's a compile-time error. Use [`try_new`](Self::try_new)
    /// to handle the error yourself.
    pub const fn new(config: &DeviceConfig) -> Self {
        match Self::try_new(config) {
            Ok(table) => table,
            Err(err) => panic!("{}", err.as_str()),
        }
    }

    /// Build the descriptor table for `config`, or describe why it's invalid.
    pub const fn try_new(config: &DeviceConfig) -> Result<Self, DescriptorError> {
        let strings = [config.manufacturer, config.product, config.serial_number];
        let mut idx = 0;
        while idx < strings.len() {
            if utf16_len(strings[idx]) > MAX_STRING_LEN {
                return Err(DescriptorError::StringTooLong);
            }
            idx += 1;
        }
        if config.max_power_ma > 500 {
            return Err(DescriptorError::PowerOutOfRange);
        }

        let mps = config.speed.bulk_max_packet_size();
        let attributes = if config.remote_wakeup {
            ATTRIBUTES_RESERVED | ATTRIBUTES_REMOTE_WAKEUP
        } else {
            ATTRIBUTES_RESERVED
        };

        let w = Writer::new()
            // Device
            .u8(18)
            .u8(DEVICE)
            .u16(BCD_USB)
            .u8(USB_CLASS_MISC)
            .u8(MISC_SUBCLASS_COMMON)
            .u8(MISC_PROTOCOL_IAD)
            .u8(CONTROL_MAX_PACKET_SIZE)
            .u16(config.vendor_id)
            .u16(config.product_id)
            .u16(config.device_release)
            .u8(MANUFACTURER_STRING)
            .u8(PRODUCT_STRING)
            .u8(SERIAL_NUMBER_STRING)
            .u8(1);

        let config_start = w.len;
        let w = w
            // Configuration; wTotalLength is patched below
            .u8(9)
            .u8(CONFIGURATION)
            .u16(0)
            .u8(2)
            .u8(1)
            .u8(0)
            .u8(attributes)
            .u8((config.max_power_ma / 2) as u8)
            // Interface association
            .u8(8)
            .u8(INTERFACE_ASSOCIATION)
            .u8(COMM_INTERFACE)
            .u8(2)
            .u8(USB_CLASS_CDC)
            .u8(CDC_SUBCLASS_ACM)
            .u8(CDC_PROTOCOL_AT)
            .u8(0)
            // Communications interface
            .u8(9)
            .u8(INTERFACE)
            .u8(COMM_INTERFACE)
            .u8(0)
            .u8(1)
            .u8(USB_CLASS_CDC)
            .u8(CDC_SUBCLASS_ACM)
            .u8(CDC_PROTOCOL_AT)
            .u8(PRODUCT_STRING)
            // Header functional
            .u8(5)
            .u8(CS_INTERFACE)
            .u8(CDC_TYPE_HEADER)
            .u16(BCD_CDC)
            // Call management functional
            .u8(5)
            .u8(CS_INTERFACE)
            .u8(CDC_TYPE_CALL_MANAGEMENT)
            .u8(0)
            .u8(DATA_INTERFACE)
            // ACM functional
            .u8(4)
            .u8(CS_INTERFACE)
            .u8(CDC_TYPE_ACM)
            .u8(ACM_CAPABILITIES)
            // Union functional
            .u8(5)
            .u8(CS_INTERFACE)
            .u8(CDC_TYPE_UNION)
            .u8(COMM_INTERFACE)
            .u8(DATA_INTERFACE)
            // Notification endpoint
            .u8(7)
            .u8(ENDPOINT)
            .u8(crate::NOTIFY_ENDPOINT)
            .u8(INTERRUPT)
            .u16(NOTIFY_MAX_PACKET_SIZE)
            .u8(NOTIFY_INTERVAL)
            // Data interface
            .u8(9)
            .u8(INTERFACE)
            .u8(DATA_INTERFACE)
            .u8(0)
            .u8(2)
            .u8(USB_CLASS_CDC_DATA)
            .u8(0)
            .u8(0)
            .u8(0)
            // Bulk OUT
            .u8(7)
            .u8(ENDPOINT)
            .u8(crate::BULK_OUT_ENDPOINT)
            .u8(BULK)
            .u16(mps)
            .u8(0)
            // Bulk IN
            .u8(7)
            .u8(ENDPOINT)
            .u8(crate::BULK_IN_ENDPOINT)
            .u8(BULK)
            .u16(mps)
            .u8(0);

        let total = w.len - config_start;
        let w = w
            .patch_u16(config_start + 2, total as u16)
            // Language IDs
            .u8(4)
            .u8(STRING)
            .u16(config.language_id)
            .string(config.manufacturer)
            .string(config.product)
            .string(config.serial_number);

        let w = match config.speed {
            Speed::High => w
                .u8(10)
                .u8(DEVICE_QUALIFIER)
                .u16(BCD_USB)
                .u8(USB_CLASS_MISC)
                .u8(MISC_SUBCLASS_COMMON)
                .u8(MISC_PROTOCOL_IAD)
                .u8(CONTROL_MAX_PACKET_SIZE)
                .u8(1)
                .u8(0),
            Speed::Full => w,
        };
        let w = w.u8(0);

        if w.overflow {
            return Err(DescriptorError::TableOverflow);
        }
        Ok(DescriptorTable {
            bytes: w.bytes,
            len: w.len,
            speed: config.speed,
        })
    }

    /// The table bytes, as registered with the USB stack.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    pub fn speed(&self) -> Speed {
        self.speed
    }

    /// Returns the max packet size of the bulk endpoints.
    pub fn bulk_max_packet_size(&self) -> u16 {
        self.speed.bulk_max_packet_size()
    }

    /// Iterate over every descriptor in the table, in order.
    ///
    /// Stops at the terminator, or at the first truncated descriptor.
    pub fn iter(&self) -> Descriptors<'_> {
        Descriptors {
            bytes: self.as_bytes(),
            offset: 0,
        }
    }

    /// Returns the descriptor that answers a `GET_DESCRIPTOR` request.
    ///
    /// A configuration descriptor comes with all of its subordinate
    /// descriptors (`wTotalLength` bytes). String index 0 is the language
    /// ID list.
    pub fn descriptor(&self, kind: u8, index: u8) -> Option<&[u8]> {
        match kind {
            DEVICE | DEVICE_QUALIFIER if index == 0 => self
                .iter()
                .find(|(_, desc)| desc[1] == kind)
                .map(|(_, desc)| desc),
            CONFIGURATION if index == 0 => {
                let (offset, desc) = self.iter().find(|(_, desc)| desc[1] == CONFIGURATION)?;
                let total = u16::from_le_bytes([desc[2], desc[3]]) as usize;
                self.as_bytes().get(offset..offset + total)
            }
            STRING => self
                .iter()
                .filter(|(_, desc)| desc[1] == STRING)
                .nth(index as usize)
                .map(|(_, desc)| desc),
            _ => None,
        }
    }

    /// Check the table against the layout invariants
    ///
    /// - a device descriptor, then a configuration descriptor whose
    ///   `wTotalLength` covers everything up to the first string,
    /// - bulk endpoints that use the speed's max packet size,
    /// - the language ID string, then the three strings,
    /// - a device qualifier if, and only if, running at high speed,
    /// - the terminator.
    pub fn validate(&self) -> Result<(), DescriptorError> {
        let mut descriptors = self.iter();

        let (_, device) = descriptors.next().ok_or(DescriptorError::Malformed)?;
        if device[1] != DEVICE || device.len() != 18 {
            return Err(DescriptorError::Malformed);
        }

        let (_, config) = descriptors.next().ok_or(DescriptorError::Malformed)?;
        if config[1] != CONFIGURATION || config.len() != 9 {
            return Err(DescriptorError::Malformed);
        }
        let total = u16::from_le_bytes([config[2], config[3]]) as usize;
        let mps = self.bulk_max_packet_size();

        let mut measured = config.len();
        let mut interfaces = 0;
        let mut endpoints = 0;
        let mut boundary = None;
        for (_, desc) in descriptors.by_ref() {
            if desc[1] == STRING {
                boundary = Some(desc);
                break;
            }
            measured += desc.len();
            match desc[1] {
                INTERFACE => interfaces += 1,
                ENDPOINT if desc.len() == 7 => {
                    endpoints += 1;
                    if desc[3] & 0x03 == BULK && u16::from_le_bytes([desc[4], desc[5]]) != mps {
                        return Err(DescriptorError::PacketSizeMismatch);
                    }
                }
                ENDPOINT => return Err(DescriptorError::Malformed),
                _ => {}
            }
        }
        if measured != total {
            return Err(DescriptorError::TotalLengthMismatch);
        }
        if interfaces != config[4] || endpoints != 3 {
            return Err(DescriptorError::Malformed);
        }

        // Language IDs, then the strings it describes
        match boundary {
            Some(langid) if langid.len() >= 4 && langid.len() % 2 == 0 => {}
            _ => return Err(DescriptorError::Malformed),
        }
        let mut strings = 0;
        let mut qualifiers = 0;
        for (_, desc) in descriptors.by_ref() {
            match desc[1] {
                STRING if qualifiers == 0 && desc.len() % 2 == 0 => strings += 1,
                DEVICE_QUALIFIER if desc.len() == 10 => qualifiers += 1,
                _ => return Err(DescriptorError::Malformed),
            }
        }
        if strings != 3 {
            return Err(DescriptorError::Malformed);
        }
        match (self.speed, qualifiers) {
            (Speed::Full, 0) | (Speed::High, 1) => {}
            _ => return Err(DescriptorError::QualifierMismatch),
        }

        // The walk must end right on the terminator.
        if descriptors.offset + 1 != self.len || self.bytes[descriptors.offset] != 0 {
            return Err(DescriptorError::Malformed);
        }
        Ok(())
    }
}

/// Iterator over the descriptors of a [`DescriptorTable`].
///
/// Yields each descriptor's offset in the table, and its bytes.
pub struct Descriptors<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Iterator for Descriptors<'a> {
    type Item = (usize, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let rest = self.bytes.get(self.offset..)?;
        let len = *rest.first()? as usize;
        if len < 2 || len > rest.len() {
            return None;
        }
        let offset = self.offset;
        self.offset += len;
        Some((offset, &rest[..len]))
    }
}

/// Serializes descriptors in a `const` context.
///
/// Overflowing the table is latched, then checked once at the end.
struct Writer {
    bytes: [u8; TABLE_CAPACITY],
    len: usize,
    overflow: bool,
}

impl Writer {
    const fn new() -> Self {
        Self {
            bytes: [0; TABLE_CAPACITY],
            len: 0,
            overflow: false,
        }
    }

    const fn u8(mut self, value: u8) -> Self {
        if self.len < TABLE_CAPACITY {
            self.bytes[self.len] = value;
            self.len += 1;
        } else {
            self.overflow = true;
        }
        self
    }

    const fn u16(self, value: u16) -> Self {
        let [lo, hi] = value.to_le_bytes();
        self.u8(lo).u8(hi)
    }

    const fn patch_u16(mut self, at: usize, value: u16) -> Self {
        if at + 1 < self.len {
            let [lo, hi] = value.to_le_bytes();
            self.bytes[at] = lo;
            self.bytes[at + 1] = hi;
        }
        self
    }

    /// Append a UTF-16LE string descriptor.
    ///
    /// Caller checks that `text` isn't longer than `MAX_STRING_LEN`.
    const fn string(self, text: &str) -> Self {
        let units = utf16_len(text);
        let mut w = self.u8((2 + 2 * units) as u8).u8(STRING);
        let bytes = text.as_bytes();
        let mut at = 0;
        while at < bytes.len() {
            let (scalar, width) = decode_utf8(bytes, at);
            if scalar >= 0x1_0000 {
                let scalar = scalar - 0x1_0000;
                w = w
                    .u16(0xD800 | (scalar >> 10) as u16)
                    .u16(0xDC00 | (scalar & 0x3FF) as u16);
            } else {
                w = w.u16(scalar as u16);
            }
            at += width;
        }
        w
    }
}

/// Decode the scalar value starting at `bytes[at]`, returning it and its
/// encoded width.
///
/// `bytes` must be valid UTF-8.
const fn decode_utf8(bytes: &[u8], at: usize) -> (u32, usize) {
    let lead = bytes[at] as u32;
    if lead < 0x80 {
        (lead, 1)
    } else if lead < 0xE0 {
        let scalar = (lead & 0x1F) << 6 | (bytes[at + 1] as u32 & 0x3F);
        (scalar, 2)
    } else if lead < 0xF0 {
        let scalar = (lead & 0x0F) << 12
            | (bytes[at + 1] as u32 & 0x3F) << 6
            | (bytes[at + 2] as u32 & 0x3F);
        (scalar, 3)
    } else {
        let scalar = (lead & 0x07) << 18
            | (bytes[at + 1] as u32 & 0x3F) << 12
            | (bytes[at + 2] as u32 & 0x3F) << 6
            | (bytes[at + 3] as u32 & 0x3F);
        (scalar, 4)
    }
}

/// Number of UTF-16 code units needed to encode `text`.
const fn utf16_len(text: &str) -> usize {
    let bytes = text.as_bytes();
    let mut units = 0;
    let mut at = 0;
    while at < bytes.len() {
        let (scalar, width) = decode_utf8(bytes, at);
        units += if scalar >= 0x1_0000 { 2 } else { 1 };
        at += width;
    }
    units
}
