//! BACnet Encoding and Decoding Utilities
//!
//! This module provides functionality for encoding and decoding BACnet
//! application data according to ASHRAE Standard 135 clause 20. Every data
//! element is a tag-length-value (TLV) triple:
//!
//! - **Tag**: identifies the data type and class (application or context)
//! - **Length**: length of the value for variable-length types
//! - **Value**: the data content
//!
//! # Application Tags
//!
//! | Tag | Type |
//! |-----|------|
//! | 0 | Null |
//! | 1 | Boolean |
//! | 2 | Unsigned Integer |
//! | 3 | Signed Integer |
//! | 4 | Real (32-bit IEEE 754) |
//! | 5 | Double (64-bit IEEE 754) |
//! | 6 | Octet String |
//! | 7 | Character String |
//! | 8 | Bit String |
//! | 9 | Enumerated |
//! | 10 | Date |
//! | 11 | Time |
//! | 12 | Object Identifier |
//!
//! Integers are big-endian in the minimum number of octets; the unsigned
//! decoder rejects encodings that are not minimal. Context-tagged variants
//! carry the same value forms with the class bit set and the tag number
//! assigned by the enclosing production.
//!
//! # Examples
//!
//! ```
//! use bacnet_core::encoding::{encode_application_unsigned, decode_application_unsigned};
//!
//! let mut buffer = Vec::new();
//! encode_application_unsigned(&mut buffer, 42).unwrap();
//! let (value, consumed) = decode_application_unsigned(&buffer).unwrap();
//! assert_eq!(value, 42);
//! assert_eq!(consumed, 2);
//! ```
//!
//! Every encoder returns the number of octets it appended, so a caller can
//! measure an encoding without keeping the bytes by encoding into a scratch
//! buffer and discarding it. Every decoder reports the octets consumed or a
//! structured failure.

#[cfg(feature = "std")]
use std::error::Error;

#[cfg(not(feature = "std"))]
use core::fmt;

#[cfg(feature = "std")]
use std::fmt;

#[cfg(not(feature = "std"))]
use alloc::{string::String, vec::Vec};

/// Result type for encoding operations
#[cfg(feature = "std")]
pub type Result<T> = std::result::Result<T, EncodingError>;

#[cfg(not(feature = "std"))]
pub type Result<T> = core::result::Result<T, EncodingError>;

/// Errors that can occur during encoding/decoding operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    /// Buffer overflow during encoding
    BufferOverflow,
    /// Unexpected end of data during decoding
    InsufficientData,
    /// Tag number or class does not match what the caller expected
    TagMismatch,
    /// Invalid length value
    InvalidLength,
    /// Unsigned value encoded in more octets than necessary
    NonMinimalEncoding,
    /// Value out of valid range
    ValueOutOfRange,
    /// Invalid encoding format
    InvalidFormat(String),
}

impl fmt::Display for EncodingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodingError::BufferOverflow => write!(f, "Buffer overflow during encoding"),
            EncodingError::InsufficientData => write!(f, "Unexpected end of data"),
            EncodingError::TagMismatch => write!(f, "Tag mismatch"),
            EncodingError::InvalidLength => write!(f, "Invalid length value"),
            EncodingError::NonMinimalEncoding => write!(f, "Non-minimal integer encoding"),
            EncodingError::ValueOutOfRange => write!(f, "Value out of valid range"),
            EncodingError::InvalidFormat(msg) => write!(f, "Invalid format: {}", msg),
        }
    }
}

#[cfg(feature = "std")]
impl Error for EncodingError {}

/// BACnet application tag numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ApplicationTag {
    Null = 0,
    Boolean = 1,
    UnsignedInt = 2,
    SignedInt = 3,
    Real = 4,
    Double = 5,
    OctetString = 6,
    CharacterString = 7,
    BitString = 8,
    Enumerated = 9,
    Date = 10,
    Time = 11,
    ObjectIdentifier = 12,
    Reserved13 = 13,
    Reserved14 = 14,
    Reserved15 = 15,
}

impl TryFrom<u8> for ApplicationTag {
    type Error = EncodingError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Null),
            1 => Ok(Self::Boolean),
            2 => Ok(Self::UnsignedInt),
            3 => Ok(Self::SignedInt),
            4 => Ok(Self::Real),
            5 => Ok(Self::Double),
            6 => Ok(Self::OctetString),
            7 => Ok(Self::CharacterString),
            8 => Ok(Self::BitString),
            9 => Ok(Self::Enumerated),
            10 => Ok(Self::Date),
            11 => Ok(Self::Time),
            12 => Ok(Self::ObjectIdentifier),
            13 => Ok(Self::Reserved13),
            14 => Ok(Self::Reserved14),
            15 => Ok(Self::Reserved15),
            _ => Err(EncodingError::TagMismatch),
        }
    }
}

/// BACnet object types used by the core services.
///
/// The full object model lives above this crate; the codec only needs the
/// type numbers that ride inside object identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ObjectType {
    AnalogInput = 0,
    AnalogOutput = 1,
    AnalogValue = 2,
    BinaryInput = 3,
    BinaryOutput = 4,
    BinaryValue = 5,
    Calendar = 6,
    Command = 7,
    Device = 8,
    EventEnrollment = 9,
    File = 10,
    Group = 11,
    Loop = 12,
    MultiStateInput = 13,
    MultiStateOutput = 14,
    NotificationClass = 15,
    Program = 16,
    Schedule = 17,
    MultiStateValue = 19,
    TrendLog = 20,
}

impl ObjectType {
    /// Convert from the raw object-type number
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(Self::AnalogInput),
            1 => Some(Self::AnalogOutput),
            2 => Some(Self::AnalogValue),
            3 => Some(Self::BinaryInput),
            4 => Some(Self::BinaryOutput),
            5 => Some(Self::BinaryValue),
            6 => Some(Self::Calendar),
            7 => Some(Self::Command),
            8 => Some(Self::Device),
            9 => Some(Self::EventEnrollment),
            10 => Some(Self::File),
            11 => Some(Self::Group),
            12 => Some(Self::Loop),
            13 => Some(Self::MultiStateInput),
            14 => Some(Self::MultiStateOutput),
            15 => Some(Self::NotificationClass),
            16 => Some(Self::Program),
            17 => Some(Self::Schedule),
            19 => Some(Self::MultiStateValue),
            20 => Some(Self::TrendLog),
            _ => None,
        }
    }
}

/// A BACnet object identifier: 10-bit type and 22-bit instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ObjectIdentifier {
    pub object_type: u16,
    pub instance: u32,
}

impl ObjectIdentifier {
    /// Create a new object identifier
    pub fn new(object_type: ObjectType, instance: u32) -> Self {
        Self {
            object_type: object_type as u16,
            instance,
        }
    }

    /// Create from a raw type number
    pub fn from_raw(object_type: u16, instance: u32) -> Self {
        Self {
            object_type,
            instance,
        }
    }

    /// Instance numbers are limited to 22 bits
    pub fn is_valid(&self) -> bool {
        self.object_type <= 0x3FF && self.instance <= 0x3FFFFF
    }

    /// Pack into the 32-bit wire form
    pub fn to_u32(&self) -> u32 {
        ((self.object_type as u32) << 22) | (self.instance & 0x3FFFFF)
    }

    /// Unpack from the 32-bit wire form
    pub fn from_u32(value: u32) -> Self {
        Self {
            object_type: (value >> 22) as u16,
            instance: value & 0x3FFFFF,
        }
    }
}

/// A BACnet Date. Fields are the raw encoded octets: `year` is the year
/// minus 1900, `month` 1..12 (13 odd, 14 even), `day` 1..31 (32 last),
/// `weekday` 1..7 with Monday = 1. 255 in any field is a wildcard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Date {
    pub year: u8,
    pub month: u8,
    pub day: u8,
    pub weekday: u8,
}

impl Date {
    /// Create from a full calendar year
    pub fn new(year: u16, month: u8, day: u8, weekday: u8) -> Self {
        let year = if year == 0xFF {
            0xFF
        } else {
            (year.saturating_sub(1900)).min(254) as u8
        };
        Self {
            year,
            month,
            day,
            weekday,
        }
    }

    /// Full calendar year, or `None` for the wildcard
    pub fn calendar_year(&self) -> Option<u16> {
        if self.year == 0xFF {
            None
        } else {
            Some(self.year as u16 + 1900)
        }
    }
}

/// A BACnet Time. 255 in any field is a wildcard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Time {
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub hundredths: u8,
}

impl Time {
    pub fn new(hour: u8, minute: u8, second: u8, hundredths: u8) -> Self {
        Self {
            hour,
            minute,
            second,
            hundredths,
        }
    }
}

/// A BACnet character string: 1-octet character-set code plus raw content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacterString {
    /// Character set code; 0 is ANSI X3.4 / UTF-8
    pub encoding: u8,
    pub content: Vec<u8>,
}

/// ANSI X3.4 / UTF-8 character set code
pub const CHARACTER_SET_ANSI: u8 = 0;

impl CharacterString {
    /// Create an ANSI/UTF-8 string
    pub fn ansi(text: &str) -> Self {
        Self {
            encoding: CHARACTER_SET_ANSI,
            content: text.as_bytes().to_vec(),
        }
    }

    /// View the content as UTF-8 when the character set allows it
    pub fn as_str(&self) -> Option<&str> {
        if self.encoding == CHARACTER_SET_ANSI {
            core::str::from_utf8(&self.content).ok()
        } else {
            None
        }
    }
}

/// A BACnet bit string: leading unused-bit count plus packed bits.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BitString {
    pub unused_bits: u8,
    pub data: Vec<u8>,
}

impl BitString {
    /// Build from individual bits, most significant first
    pub fn from_bits(bits: &[bool]) -> Self {
        let mut data = Vec::new();
        for chunk in bits.chunks(8) {
            let mut octet = 0u8;
            for (i, bit) in chunk.iter().enumerate() {
                if *bit {
                    octet |= 0x80 >> i;
                }
            }
            data.push(octet);
        }
        let unused_bits = if bits.is_empty() {
            0
        } else {
            (8 - (bits.len() % 8)) % 8
        } as u8;
        Self { unused_bits, data }
    }

    /// Number of significant bits
    pub fn bit_len(&self) -> usize {
        self.data.len() * 8 - self.unused_bits as usize
    }

    /// Read bit `index`, most significant first
    pub fn bit(&self, index: usize) -> bool {
        if index >= self.bit_len() {
            return false;
        }
        self.data[index / 8] & (0x80 >> (index % 8)) != 0
    }
}

// -------------------------------------------------------------------------
// Tag encoding
// -------------------------------------------------------------------------

const EXTENDED_TAG_NUMBER: u8 = 0x0F;
const EXTENDED_LENGTH: usize = 5;
const OPENING_TAG_LENGTH: u8 = 6;
const CLOSING_TAG_LENGTH: u8 = 7;
const CONTEXT_CLASS_BIT: u8 = 0x08;

fn encode_tag(buffer: &mut Vec<u8>, tag_number: u8, context: bool, length: usize) -> Result<usize> {
    let start = buffer.len();
    let class_bit = if context { CONTEXT_CLASS_BIT } else { 0 };

    let first = if tag_number < EXTENDED_TAG_NUMBER {
        (tag_number << 4) | class_bit
    } else {
        (EXTENDED_TAG_NUMBER << 4) | class_bit
    };

    if length < EXTENDED_LENGTH {
        buffer.push(first | length as u8);
    } else {
        buffer.push(first | EXTENDED_LENGTH as u8);
    }

    if tag_number >= EXTENDED_TAG_NUMBER {
        buffer.push(tag_number);
    }

    if length >= EXTENDED_LENGTH {
        if length < 254 {
            buffer.push(length as u8);
        } else if length < 65536 {
            buffer.push(254);
            buffer.extend_from_slice(&(length as u16).to_be_bytes());
        } else {
            buffer.push(255);
            buffer.extend_from_slice(&(length as u32).to_be_bytes());
        }
    }

    Ok(buffer.len() - start)
}

/// Encode a BACnet application tag
pub fn encode_application_tag(
    buffer: &mut Vec<u8>,
    tag: ApplicationTag,
    length: usize,
) -> Result<usize> {
    encode_tag(buffer, tag as u8, false, length)
}

/// Encode a context-specific tag
pub fn encode_context_tag(buffer: &mut Vec<u8>, tag_number: u8, length: usize) -> Result<usize> {
    encode_tag(buffer, tag_number, true, length)
}

/// Encode an opening tag for a constructed value
pub fn encode_opening_tag(buffer: &mut Vec<u8>, tag_number: u8) -> Result<usize> {
    let start = buffer.len();
    if tag_number < EXTENDED_TAG_NUMBER {
        buffer.push((tag_number << 4) | CONTEXT_CLASS_BIT | OPENING_TAG_LENGTH);
    } else {
        buffer.push((EXTENDED_TAG_NUMBER << 4) | CONTEXT_CLASS_BIT | OPENING_TAG_LENGTH);
        buffer.push(tag_number);
    }
    Ok(buffer.len() - start)
}

/// Encode a closing tag for a constructed value
pub fn encode_closing_tag(buffer: &mut Vec<u8>, tag_number: u8) -> Result<usize> {
    let start = buffer.len();
    if tag_number < EXTENDED_TAG_NUMBER {
        buffer.push((tag_number << 4) | CONTEXT_CLASS_BIT | CLOSING_TAG_LENGTH);
    } else {
        buffer.push((EXTENDED_TAG_NUMBER << 4) | CONTEXT_CLASS_BIT | CLOSING_TAG_LENGTH);
        buffer.push(tag_number);
    }
    Ok(buffer.len() - start)
}

/// A decoded tag: number, class, value length and octets consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tag {
    pub number: u8,
    pub context: bool,
    pub opening: bool,
    pub closing: bool,
    pub length: usize,
    pub consumed: usize,
}

/// Decode a tag octet (with any extended tag number and length)
pub fn decode_tag(data: &[u8]) -> Result<Tag> {
    if data.is_empty() {
        return Err(EncodingError::InsufficientData);
    }

    let first = data[0];
    let context = first & CONTEXT_CLASS_BIT != 0;
    let mut number = first >> 4;
    let mut consumed = 1;

    if number == EXTENDED_TAG_NUMBER && context {
        if data.len() < 2 {
            return Err(EncodingError::InsufficientData);
        }
        number = data[1];
        consumed += 1;
    }

    let lvt = first & 0x07;
    let mut opening = false;
    let mut closing = false;
    let mut length = lvt as usize;

    if context && lvt == OPENING_TAG_LENGTH {
        opening = true;
        length = 0;
    } else if context && lvt == CLOSING_TAG_LENGTH {
        closing = true;
        length = 0;
    } else if lvt as usize == EXTENDED_LENGTH {
        if data.len() < consumed + 1 {
            return Err(EncodingError::InsufficientData);
        }
        let len_byte = data[consumed];
        consumed += 1;
        if len_byte < 254 {
            length = len_byte as usize;
        } else if len_byte == 254 {
            if data.len() < consumed + 2 {
                return Err(EncodingError::InsufficientData);
            }
            length = u16::from_be_bytes([data[consumed], data[consumed + 1]]) as usize;
            consumed += 2;
        } else {
            if data.len() < consumed + 4 {
                return Err(EncodingError::InsufficientData);
            }
            length = u32::from_be_bytes([
                data[consumed],
                data[consumed + 1],
                data[consumed + 2],
                data[consumed + 3],
            ]) as usize;
            consumed += 4;
        }
    }

    Ok(Tag {
        number,
        context,
        opening,
        closing,
        length,
        consumed,
    })
}

/// Decode an application tag, rejecting context-class octets
pub fn decode_application_tag(data: &[u8]) -> Result<(ApplicationTag, usize, usize)> {
    let tag = decode_tag(data)?;
    if tag.context {
        return Err(EncodingError::TagMismatch);
    }
    Ok((
        ApplicationTag::try_from(tag.number)?,
        tag.length,
        tag.consumed,
    ))
}

/// Peek at the application tag of the next element
pub fn get_application_tag(data: &[u8]) -> Result<ApplicationTag> {
    let (tag, _, _) = decode_application_tag(data)?;
    Ok(tag)
}

// -------------------------------------------------------------------------
// Value encoding helpers
// -------------------------------------------------------------------------

fn unsigned_content(value: u32) -> Vec<u8> {
    if value <= 0xFF {
        let mut v = Vec::new();
        v.push(value as u8);
        v
    } else if value <= 0xFFFF {
        (value as u16).to_be_bytes().to_vec()
    } else if value <= 0xFFFFFF {
        value.to_be_bytes()[1..].to_vec()
    } else {
        value.to_be_bytes().to_vec()
    }
}

fn decode_unsigned_content(data: &[u8], length: usize) -> Result<u32> {
    let value = match length {
        1 => data[0] as u32,
        2 => u16::from_be_bytes([data[0], data[1]]) as u32,
        3 => u32::from_be_bytes([0, data[0], data[1], data[2]]),
        4 => u32::from_be_bytes([data[0], data[1], data[2], data[3]]),
        _ => return Err(EncodingError::InvalidLength),
    };
    // enforce minimal-octet encoding
    if length > 1 && unsigned_content(value).len() != length {
        return Err(EncodingError::NonMinimalEncoding);
    }
    Ok(value)
}

fn signed_content(value: i32) -> Vec<u8> {
    if (-128..=127).contains(&value) {
        let mut v = Vec::new();
        v.push(value as u8);
        v
    } else if (-32768..=32767).contains(&value) {
        (value as i16).to_be_bytes().to_vec()
    } else if (-8388608..=8388607).contains(&value) {
        value.to_be_bytes()[1..].to_vec()
    } else {
        value.to_be_bytes().to_vec()
    }
}

fn decode_signed_content(data: &[u8], length: usize) -> Result<i32> {
    let value = match length {
        1 => data[0] as i8 as i32,
        2 => i16::from_be_bytes([data[0], data[1]]) as i32,
        3 => {
            let sign_extend = if data[0] & 0x80 != 0 { 0xFF } else { 0x00 };
            i32::from_be_bytes([sign_extend, data[0], data[1], data[2]])
        }
        4 => i32::from_be_bytes([data[0], data[1], data[2], data[3]]),
        _ => return Err(EncodingError::InvalidLength),
    };
    Ok(value)
}

fn expect_value(data: &[u8], consumed: usize, length: usize) -> Result<&[u8]> {
    if data.len() < consumed + length {
        return Err(EncodingError::InsufficientData);
    }
    Ok(&data[consumed..consumed + length])
}

// -------------------------------------------------------------------------
// Application-tagged values
// -------------------------------------------------------------------------

/// Encode a BACnet Null
pub fn encode_application_null(buffer: &mut Vec<u8>) -> Result<usize> {
    encode_application_tag(buffer, ApplicationTag::Null, 0)
}

/// Decode a BACnet Null
pub fn decode_application_null(data: &[u8]) -> Result<usize> {
    let (tag, length, consumed) = decode_application_tag(data)?;
    if tag != ApplicationTag::Null {
        return Err(EncodingError::TagMismatch);
    }
    if length != 0 {
        return Err(EncodingError::InvalidLength);
    }
    Ok(consumed)
}

/// Encode a BACnet boolean value (the value rides in the length field)
pub fn encode_application_boolean(buffer: &mut Vec<u8>, value: bool) -> Result<usize> {
    encode_application_tag(buffer, ApplicationTag::Boolean, usize::from(value))
}

/// Decode a BACnet boolean value
pub fn decode_application_boolean(data: &[u8]) -> Result<(bool, usize)> {
    let (tag, length, consumed) = decode_application_tag(data)?;
    if tag != ApplicationTag::Boolean {
        return Err(EncodingError::TagMismatch);
    }
    let value = match length {
        0 => false,
        1 => true,
        _ => return Err(EncodingError::InvalidLength),
    };
    Ok((value, consumed))
}

/// Encode a BACnet unsigned integer
pub fn encode_application_unsigned(buffer: &mut Vec<u8>, value: u32) -> Result<usize> {
    let content = unsigned_content(value);
    let mut len = encode_application_tag(buffer, ApplicationTag::UnsignedInt, content.len())?;
    buffer.extend_from_slice(&content);
    len += content.len();
    Ok(len)
}

/// Decode a BACnet unsigned integer
pub fn decode_application_unsigned(data: &[u8]) -> Result<(u32, usize)> {
    let (tag, length, consumed) = decode_application_tag(data)?;
    if tag != ApplicationTag::UnsignedInt {
        return Err(EncodingError::TagMismatch);
    }
    let content = expect_value(data, consumed, length)?;
    Ok((decode_unsigned_content(content, length)?, consumed + length))
}

/// Encode a BACnet signed integer
pub fn encode_application_signed(buffer: &mut Vec<u8>, value: i32) -> Result<usize> {
    let content = signed_content(value);
    let mut len = encode_application_tag(buffer, ApplicationTag::SignedInt, content.len())?;
    buffer.extend_from_slice(&content);
    len += content.len();
    Ok(len)
}

/// Decode a BACnet signed integer
pub fn decode_application_signed(data: &[u8]) -> Result<(i32, usize)> {
    let (tag, length, consumed) = decode_application_tag(data)?;
    if tag != ApplicationTag::SignedInt {
        return Err(EncodingError::TagMismatch);
    }
    let content = expect_value(data, consumed, length)?;
    Ok((decode_signed_content(content, length)?, consumed + length))
}

/// Encode a BACnet real (IEEE 754 single, network byte order)
pub fn encode_application_real(buffer: &mut Vec<u8>, value: f32) -> Result<usize> {
    let mut len = encode_application_tag(buffer, ApplicationTag::Real, 4)?;
    buffer.extend_from_slice(&value.to_be_bytes());
    len += 4;
    Ok(len)
}

/// Decode a BACnet real
pub fn decode_application_real(data: &[u8]) -> Result<(f32, usize)> {
    let (tag, length, consumed) = decode_application_tag(data)?;
    if tag != ApplicationTag::Real {
        return Err(EncodingError::TagMismatch);
    }
    if length != 4 {
        return Err(EncodingError::InvalidLength);
    }
    let content = expect_value(data, consumed, 4)?;
    let value = f32::from_be_bytes([content[0], content[1], content[2], content[3]]);
    Ok((value, consumed + 4))
}

/// Encode a BACnet double (IEEE 754 double, network byte order)
pub fn encode_application_double(buffer: &mut Vec<u8>, value: f64) -> Result<usize> {
    let mut len = encode_application_tag(buffer, ApplicationTag::Double, 8)?;
    buffer.extend_from_slice(&value.to_be_bytes());
    len += 8;
    Ok(len)
}

/// Decode a BACnet double
pub fn decode_application_double(data: &[u8]) -> Result<(f64, usize)> {
    let (tag, length, consumed) = decode_application_tag(data)?;
    if tag != ApplicationTag::Double {
        return Err(EncodingError::TagMismatch);
    }
    if length != 8 {
        return Err(EncodingError::InvalidLength);
    }
    let content = expect_value(data, consumed, 8)?;
    let mut octets = [0u8; 8];
    octets.copy_from_slice(content);
    Ok((f64::from_be_bytes(octets), consumed + 8))
}

/// Encode a BACnet octet string
pub fn encode_application_octet_string(buffer: &mut Vec<u8>, value: &[u8]) -> Result<usize> {
    let mut len = encode_application_tag(buffer, ApplicationTag::OctetString, value.len())?;
    buffer.extend_from_slice(value);
    len += value.len();
    Ok(len)
}

/// Decode a BACnet octet string
pub fn decode_application_octet_string(data: &[u8]) -> Result<(Vec<u8>, usize)> {
    let (tag, length, consumed) = decode_application_tag(data)?;
    if tag != ApplicationTag::OctetString {
        return Err(EncodingError::TagMismatch);
    }
    let content = expect_value(data, consumed, length)?;
    Ok((content.to_vec(), consumed + length))
}

/// Encode a BACnet character string
pub fn encode_application_character_string(
    buffer: &mut Vec<u8>,
    value: &CharacterString,
) -> Result<usize> {
    let mut len = encode_application_tag(
        buffer,
        ApplicationTag::CharacterString,
        value.content.len() + 1,
    )?;
    buffer.push(value.encoding);
    buffer.extend_from_slice(&value.content);
    len += value.content.len() + 1;
    Ok(len)
}

/// Decode a BACnet character string
pub fn decode_application_character_string(data: &[u8]) -> Result<(CharacterString, usize)> {
    let (tag, length, consumed) = decode_application_tag(data)?;
    if tag != ApplicationTag::CharacterString {
        return Err(EncodingError::TagMismatch);
    }
    if length == 0 {
        return Err(EncodingError::InvalidLength);
    }
    let content = expect_value(data, consumed, length)?;
    Ok((
        CharacterString {
            encoding: content[0],
            content: content[1..].to_vec(),
        },
        consumed + length,
    ))
}

/// Encode a BACnet bit string
pub fn encode_application_bit_string(buffer: &mut Vec<u8>, value: &BitString) -> Result<usize> {
    if value.unused_bits > 7 {
        return Err(EncodingError::ValueOutOfRange);
    }
    let mut len =
        encode_application_tag(buffer, ApplicationTag::BitString, value.data.len() + 1)?;
    buffer.push(value.unused_bits);
    buffer.extend_from_slice(&value.data);
    len += value.data.len() + 1;
    Ok(len)
}

/// Decode a BACnet bit string
pub fn decode_application_bit_string(data: &[u8]) -> Result<(BitString, usize)> {
    let (tag, length, consumed) = decode_application_tag(data)?;
    if tag != ApplicationTag::BitString {
        return Err(EncodingError::TagMismatch);
    }
    if length == 0 {
        return Err(EncodingError::InvalidLength);
    }
    let content = expect_value(data, consumed, length)?;
    if content[0] > 7 {
        return Err(EncodingError::ValueOutOfRange);
    }
    Ok((
        BitString {
            unused_bits: content[0],
            data: content[1..].to_vec(),
        },
        consumed + length,
    ))
}

/// Encode a BACnet enumerated value
pub fn encode_application_enumerated(buffer: &mut Vec<u8>, value: u32) -> Result<usize> {
    let content = unsigned_content(value);
    let mut len = encode_application_tag(buffer, ApplicationTag::Enumerated, content.len())?;
    buffer.extend_from_slice(&content);
    len += content.len();
    Ok(len)
}

/// Decode a BACnet enumerated value
pub fn decode_application_enumerated(data: &[u8]) -> Result<(u32, usize)> {
    let (tag, length, consumed) = decode_application_tag(data)?;
    if tag != ApplicationTag::Enumerated {
        return Err(EncodingError::TagMismatch);
    }
    let content = expect_value(data, consumed, length)?;
    Ok((decode_unsigned_content(content, length)?, consumed + length))
}

/// Encode a BACnet Date
pub fn encode_application_date(buffer: &mut Vec<u8>, value: &Date) -> Result<usize> {
    let mut len = encode_application_tag(buffer, ApplicationTag::Date, 4)?;
    buffer.extend_from_slice(&[value.year, value.month, value.day, value.weekday]);
    len += 4;
    Ok(len)
}

/// Decode a BACnet Date
pub fn decode_application_date(data: &[u8]) -> Result<(Date, usize)> {
    let (tag, length, consumed) = decode_application_tag(data)?;
    if tag != ApplicationTag::Date {
        return Err(EncodingError::TagMismatch);
    }
    if length != 4 {
        return Err(EncodingError::InvalidLength);
    }
    let content = expect_value(data, consumed, 4)?;
    Ok((
        Date {
            year: content[0],
            month: content[1],
            day: content[2],
            weekday: content[3],
        },
        consumed + 4,
    ))
}

/// Encode a BACnet Time
pub fn encode_application_time(buffer: &mut Vec<u8>, value: &Time) -> Result<usize> {
    let mut len = encode_application_tag(buffer, ApplicationTag::Time, 4)?;
    buffer.extend_from_slice(&[value.hour, value.minute, value.second, value.hundredths]);
    len += 4;
    Ok(len)
}

/// Decode a BACnet Time
pub fn decode_application_time(data: &[u8]) -> Result<(Time, usize)> {
    let (tag, length, consumed) = decode_application_tag(data)?;
    if tag != ApplicationTag::Time {
        return Err(EncodingError::TagMismatch);
    }
    if length != 4 {
        return Err(EncodingError::InvalidLength);
    }
    let content = expect_value(data, consumed, 4)?;
    Ok((
        Time {
            hour: content[0],
            minute: content[1],
            second: content[2],
            hundredths: content[3],
        },
        consumed + 4,
    ))
}

/// Encode a BACnet object identifier
pub fn encode_application_object_id(
    buffer: &mut Vec<u8>,
    object_id: &ObjectIdentifier,
) -> Result<usize> {
    if !object_id.is_valid() {
        return Err(EncodingError::ValueOutOfRange);
    }
    let mut len = encode_application_tag(buffer, ApplicationTag::ObjectIdentifier, 4)?;
    buffer.extend_from_slice(&object_id.to_u32().to_be_bytes());
    len += 4;
    Ok(len)
}

/// Decode a BACnet object identifier
pub fn decode_application_object_id(data: &[u8]) -> Result<(ObjectIdentifier, usize)> {
    let (tag, length, consumed) = decode_application_tag(data)?;
    if tag != ApplicationTag::ObjectIdentifier {
        return Err(EncodingError::TagMismatch);
    }
    if length != 4 {
        return Err(EncodingError::InvalidLength);
    }
    let content = expect_value(data, consumed, 4)?;
    let raw = u32::from_be_bytes([content[0], content[1], content[2], content[3]]);
    Ok((ObjectIdentifier::from_u32(raw), consumed + 4))
}

// -------------------------------------------------------------------------
// Context-tagged values
// -------------------------------------------------------------------------

/// Encode a context-tagged unsigned integer
pub fn encode_context_unsigned(buffer: &mut Vec<u8>, tag_number: u8, value: u32) -> Result<usize> {
    let content = unsigned_content(value);
    let mut len = encode_context_tag(buffer, tag_number, content.len())?;
    buffer.extend_from_slice(&content);
    len += content.len();
    Ok(len)
}

/// Decode a context-tagged unsigned integer, checking the tag number
pub fn decode_context_unsigned(data: &[u8], tag_number: u8) -> Result<(u32, usize)> {
    let tag = decode_tag(data)?;
    if !tag.context || tag.number != tag_number || tag.opening || tag.closing {
        return Err(EncodingError::TagMismatch);
    }
    let content = expect_value(data, tag.consumed, tag.length)?;
    Ok((
        decode_unsigned_content(content, tag.length)?,
        tag.consumed + tag.length,
    ))
}

/// Encode a context-tagged enumerated value
pub fn encode_context_enumerated(
    buffer: &mut Vec<u8>,
    tag_number: u8,
    value: u32,
) -> Result<usize> {
    encode_context_unsigned(buffer, tag_number, value)
}

/// Decode a context-tagged enumerated value
pub fn decode_context_enumerated(data: &[u8], tag_number: u8) -> Result<(u32, usize)> {
    decode_context_unsigned(data, tag_number)
}

/// Encode a context-tagged object identifier
pub fn encode_context_object_id(
    buffer: &mut Vec<u8>,
    tag_number: u8,
    object_id: &ObjectIdentifier,
) -> Result<usize> {
    if !object_id.is_valid() {
        return Err(EncodingError::ValueOutOfRange);
    }
    let mut len = encode_context_tag(buffer, tag_number, 4)?;
    buffer.extend_from_slice(&object_id.to_u32().to_be_bytes());
    len += 4;
    Ok(len)
}

/// Decode a context-tagged object identifier
pub fn decode_context_object_id(data: &[u8], tag_number: u8) -> Result<(ObjectIdentifier, usize)> {
    let tag = decode_tag(data)?;
    if !tag.context || tag.number != tag_number || tag.opening || tag.closing {
        return Err(EncodingError::TagMismatch);
    }
    if tag.length != 4 {
        return Err(EncodingError::InvalidLength);
    }
    let content = expect_value(data, tag.consumed, 4)?;
    let raw = u32::from_be_bytes([content[0], content[1], content[2], content[3]]);
    Ok((ObjectIdentifier::from_u32(raw), tag.consumed + 4))
}

/// Encode a context-tagged octet string
pub fn encode_context_octet_string(
    buffer: &mut Vec<u8>,
    tag_number: u8,
    value: &[u8],
) -> Result<usize> {
    let mut len = encode_context_tag(buffer, tag_number, value.len())?;
    buffer.extend_from_slice(value);
    len += value.len();
    Ok(len)
}

/// Decode a context-tagged octet string
pub fn decode_context_octet_string(data: &[u8], tag_number: u8) -> Result<(Vec<u8>, usize)> {
    let tag = decode_tag(data)?;
    if !tag.context || tag.number != tag_number || tag.opening || tag.closing {
        return Err(EncodingError::TagMismatch);
    }
    let content = expect_value(data, tag.consumed, tag.length)?;
    Ok((content.to_vec(), tag.consumed + tag.length))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_unsigned_round_trip() {
        for value in [0u32, 1, 42, 0xFF, 0x100, 0xFFFF, 0x10000, 0xFFFFFF, 0x1000000, u32::MAX] {
            let mut buffer = Vec::new();
            let written = encode_application_unsigned(&mut buffer, value).unwrap();
            assert_eq!(written, buffer.len());
            let (decoded, consumed) = decode_application_unsigned(&buffer).unwrap();
            assert_eq!(decoded, value);
            assert_eq!(consumed, buffer.len());
        }
    }

    #[test]
    fn test_unsigned_known_encoding() {
        let mut buffer = Vec::new();
        encode_application_unsigned(&mut buffer, 42).unwrap();
        assert_eq!(buffer, vec![0x21, 0x2A]);
    }

    #[test]
    fn test_unsigned_rejects_non_minimal() {
        // 42 padded to two octets
        let data = [0x22, 0x00, 0x2A];
        assert_eq!(
            decode_application_unsigned(&data),
            Err(EncodingError::NonMinimalEncoding)
        );
    }

    #[test]
    fn test_signed_round_trip() {
        for value in [0i32, -1, 127, -128, 128, -129, 32767, -32768, 8388607, -8388608, i32::MAX, i32::MIN] {
            let mut buffer = Vec::new();
            encode_application_signed(&mut buffer, value).unwrap();
            let (decoded, consumed) = decode_application_signed(&buffer).unwrap();
            assert_eq!(decoded, value);
            assert_eq!(consumed, buffer.len());
        }
    }

    #[test]
    fn test_real_round_trip() {
        let mut buffer = Vec::new();
        encode_application_real(&mut buffer, 23.5).unwrap();
        let (decoded, consumed) = decode_application_real(&buffer).unwrap();
        assert_eq!(decoded, 23.5);
        assert_eq!(consumed, 5);
    }

    #[test]
    fn test_double_round_trip() {
        let mut buffer = Vec::new();
        encode_application_double(&mut buffer, -1234.5678).unwrap();
        let (decoded, _) = decode_application_double(&buffer).unwrap();
        assert_eq!(decoded, -1234.5678);
    }

    #[test]
    fn test_boolean_in_length_field() {
        let mut buffer = Vec::new();
        encode_application_boolean(&mut buffer, true).unwrap();
        assert_eq!(buffer, vec![0x11]);
        buffer.clear();
        encode_application_boolean(&mut buffer, false).unwrap();
        assert_eq!(buffer, vec![0x10]);
    }

    #[test]
    fn test_octet_string_round_trip() {
        let mut buffer = Vec::new();
        let value = vec![0xDE, 0xAD, 0xBE, 0xEF];
        encode_application_octet_string(&mut buffer, &value).unwrap();
        let (decoded, consumed) = decode_application_octet_string(&buffer).unwrap();
        assert_eq!(decoded, value);
        assert_eq!(consumed, buffer.len());
    }

    #[test]
    fn test_character_string_round_trip() {
        let mut buffer = Vec::new();
        let value = CharacterString::ansi("BACnet rocks");
        encode_application_character_string(&mut buffer, &value).unwrap();
        let (decoded, _) = decode_application_character_string(&buffer).unwrap();
        assert_eq!(decoded.as_str(), Some("BACnet rocks"));
    }

    #[test]
    fn test_bit_string_round_trip() {
        let bits = [true, false, true, true, false, false, true, false, true, true];
        let value = BitString::from_bits(&bits);
        assert_eq!(value.unused_bits, 6);
        assert_eq!(value.bit_len(), 10);

        let mut buffer = Vec::new();
        encode_application_bit_string(&mut buffer, &value).unwrap();
        let (decoded, _) = decode_application_bit_string(&buffer).unwrap();
        assert_eq!(decoded, value);
        for (i, bit) in bits.iter().enumerate() {
            assert_eq!(decoded.bit(i), *bit);
        }
    }

    #[test]
    fn test_date_time_round_trip() {
        let date = Date::new(2024, 3, 15, 5);
        assert_eq!(date.calendar_year(), Some(2024));
        let time = Time::new(13, 45, 30, 50);

        let mut buffer = Vec::new();
        encode_application_date(&mut buffer, &date).unwrap();
        encode_application_time(&mut buffer, &time).unwrap();

        let (decoded_date, consumed) = decode_application_date(&buffer).unwrap();
        let (decoded_time, _) = decode_application_time(&buffer[consumed..]).unwrap();
        assert_eq!(decoded_date, date);
        assert_eq!(decoded_time, time);
    }

    #[test]
    fn test_object_id_round_trip() {
        let object_id = ObjectIdentifier::new(ObjectType::AnalogInput, 0);
        let mut buffer = Vec::new();
        encode_application_object_id(&mut buffer, &object_id).unwrap();
        let (decoded, consumed) = decode_application_object_id(&buffer).unwrap();
        assert_eq!(decoded, object_id);
        assert_eq!(consumed, 5);

        let invalid = ObjectIdentifier::from_raw(0x400, 0);
        let mut buffer = Vec::new();
        assert!(encode_application_object_id(&mut buffer, &invalid).is_err());
    }

    #[test]
    fn test_context_unsigned() {
        let mut buffer = Vec::new();
        encode_context_unsigned(&mut buffer, 3, 1000).unwrap();
        let (value, consumed) = decode_context_unsigned(&buffer, 3).unwrap();
        assert_eq!(value, 1000);
        assert_eq!(consumed, buffer.len());

        // wrong tag number
        assert_eq!(
            decode_context_unsigned(&buffer, 2),
            Err(EncodingError::TagMismatch)
        );
        // application decoder must refuse context octets
        assert!(decode_application_unsigned(&buffer).is_err());
    }

    #[test]
    fn test_opening_closing_tags() {
        let mut buffer = Vec::new();
        encode_opening_tag(&mut buffer, 3).unwrap();
        encode_application_unsigned(&mut buffer, 7).unwrap();
        encode_closing_tag(&mut buffer, 3).unwrap();

        let open = decode_tag(&buffer).unwrap();
        assert!(open.opening && open.context);
        assert_eq!(open.number, 3);
        let close = decode_tag(&buffer[buffer.len() - 1..]).unwrap();
        assert!(close.closing && close.context);
    }

    #[test]
    fn test_extended_length() {
        let value = vec![0xAB; 300];
        let mut buffer = Vec::new();
        encode_application_octet_string(&mut buffer, &value).unwrap();
        let (decoded, consumed) = decode_application_octet_string(&buffer).unwrap();
        assert_eq!(decoded, value);
        assert_eq!(consumed, buffer.len());
    }

    #[test]
    fn test_truncated_input() {
        let data = [0x21]; // unsigned tag, value octet missing
        assert_eq!(
            decode_application_unsigned(&data),
            Err(EncodingError::InsufficientData)
        );
        assert!(decode_tag(&[]).is_err());
    }

    proptest! {
        #[test]
        fn prop_unsigned_round_trip(value: u32) {
            let mut buffer = Vec::new();
            encode_application_unsigned(&mut buffer, value).unwrap();
            let (decoded, consumed) = decode_application_unsigned(&buffer).unwrap();
            prop_assert_eq!(decoded, value);
            prop_assert_eq!(consumed, buffer.len());
        }

        #[test]
        fn prop_signed_round_trip(value: i32) {
            let mut buffer = Vec::new();
            encode_application_signed(&mut buffer, value).unwrap();
            let (decoded, _) = decode_application_signed(&buffer).unwrap();
            prop_assert_eq!(decoded, value);
        }

        #[test]
        fn prop_real_round_trip(value: f32) {
            let mut buffer = Vec::new();
            encode_application_real(&mut buffer, value).unwrap();
            let (decoded, _) = decode_application_real(&buffer).unwrap();
            if value.is_nan() {
                prop_assert!(decoded.is_nan());
            } else {
                prop_assert_eq!(decoded, value);
            }
        }

        #[test]
        fn prop_octet_string_round_trip(value: Vec<u8>) {
            let mut buffer = Vec::new();
            encode_application_octet_string(&mut buffer, &value).unwrap();
            let (decoded, consumed) = decode_application_octet_string(&buffer).unwrap();
            prop_assert_eq!(decoded, value);
            prop_assert_eq!(consumed, buffer.len());
        }

        #[test]
        fn prop_decoder_never_panics(data: Vec<u8>) {
            let _ = decode_tag(&data);
            let _ = decode_application_unsigned(&data);
            let _ = decode_application_signed(&data);
            let _ = decode_application_real(&data);
            let _ = decode_application_octet_string(&data);
            let _ = decode_application_bit_string(&data);
            let _ = decode_application_object_id(&data);
        }
    }
}
