//! BACnet Application Layer Module
//!
//! This module builds and parses the APDU fixed headers defined by ASHRAE
//! 135 clause 20.1: the PDU type octet with its segmentation bits, the
//! invoke id, sequence number and window size for segmented transfers, and
//! the max-segments / max-APDU acceptance encodings.
//!
//! # APDU Types
//!
//! - Confirmed Request PDU
//! - Unconfirmed Request PDU
//! - SimpleACK PDU
//! - ComplexACK PDU
//! - SegmentACK PDU
//! - Error PDU
//! - Reject PDU
//! - Abort PDU
//!
//! Encoding and decoding are pure and mutually inverse; the transaction
//! state machine re-encodes the same [`ApduFixedHeader`] for every segment
//! it sends, flipping only the sequence number and the more-follows bit.
//!
//! # Example
//!
//! ```
//! use bacnet_core::app::{Apdu, MaxSegments, MaxApduSize};
//!
//! let apdu = Apdu::UnconfirmedRequest {
//!     service_choice: 8, // Who-Is
//!     service_data: vec![],
//! };
//! let encoded = apdu.encode();
//! assert_eq!(encoded, vec![0x10, 0x08]);
//! ```

#[cfg(feature = "std")]
use std::error::Error;

#[cfg(feature = "std")]
use std::fmt;

#[cfg(not(feature = "std"))]
use core::fmt;

#[cfg(not(feature = "std"))]
use alloc::{string::String, vec::Vec};

/// Result type for application layer operations
#[cfg(feature = "std")]
pub type Result<T> = std::result::Result<T, ApplicationError>;

#[cfg(not(feature = "std"))]
pub type Result<T> = core::result::Result<T, ApplicationError>;

/// Errors that can occur in application layer operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplicationError {
    /// Invalid APDU format
    InvalidApdu(String),
    /// Unsupported APDU type
    UnsupportedApduType,
    /// Maximum APDU length exceeded
    MaxApduLengthExceeded,
}

impl fmt::Display for ApplicationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApplicationError::InvalidApdu(msg) => write!(f, "Invalid APDU: {}", msg),
            ApplicationError::UnsupportedApduType => write!(f, "Unsupported APDU type"),
            ApplicationError::MaxApduLengthExceeded => write!(f, "Maximum APDU length exceeded"),
        }
    }
}

#[cfg(feature = "std")]
impl Error for ApplicationError {}

/// APDU types (high nibble of the first octet)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PduType {
    ConfirmedRequest = 0,
    UnconfirmedRequest = 1,
    SimpleAck = 2,
    ComplexAck = 3,
    SegmentAck = 4,
    Error = 5,
    Reject = 6,
    Abort = 7,
}

impl PduType {
    /// Extract the PDU type from the first APDU octet
    pub fn from_octet(octet: u8) -> Option<Self> {
        match octet >> 4 {
            0 => Some(Self::ConfirmedRequest),
            1 => Some(Self::UnconfirmedRequest),
            2 => Some(Self::SimpleAck),
            3 => Some(Self::ComplexAck),
            4 => Some(Self::SegmentAck),
            5 => Some(Self::Error),
            6 => Some(Self::Reject),
            7 => Some(Self::Abort),
            _ => None,
        }
    }
}

/// Maximum segments the sender will accept in a response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum MaxSegments {
    #[default]
    Unspecified = 0,
    Two = 1,
    Four = 2,
    Eight = 3,
    Sixteen = 4,
    ThirtyTwo = 5,
    SixtyFour = 6,
    GreaterThan64 = 7,
}

impl MaxSegments {
    /// Decode from the upper nibble of the max-response octet
    pub fn from_nibble(nibble: u8) -> Self {
        match nibble & 0x07 {
            1 => Self::Two,
            2 => Self::Four,
            3 => Self::Eight,
            4 => Self::Sixteen,
            5 => Self::ThirtyTwo,
            6 => Self::SixtyFour,
            7 => Self::GreaterThan64,
            _ => Self::Unspecified,
        }
    }

    /// The segment count this encoding stands for, or `None` for
    /// unspecified / more-than-64
    pub fn count(&self) -> Option<u32> {
        match self {
            Self::Unspecified => None,
            Self::Two => Some(2),
            Self::Four => Some(4),
            Self::Eight => Some(8),
            Self::Sixteen => Some(16),
            Self::ThirtyTwo => Some(32),
            Self::SixtyFour => Some(64),
            Self::GreaterThan64 => None,
        }
    }

    /// Smallest encoding that covers `count` segments
    pub fn for_count(count: u32) -> Self {
        match count {
            0 => Self::Unspecified,
            1..=2 => Self::Two,
            3..=4 => Self::Four,
            5..=8 => Self::Eight,
            9..=16 => Self::Sixteen,
            17..=32 => Self::ThirtyTwo,
            33..=64 => Self::SixtyFour,
            _ => Self::GreaterThan64,
        }
    }
}

/// Maximum APDU size the sender will accept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum MaxApduSize {
    Up50 = 0,
    Up128 = 1,
    Up206 = 2,
    Up480 = 3,
    Up1024 = 4,
    #[default]
    Up1476 = 5,
}

impl MaxApduSize {
    /// Decode from the lower nibble of the max-response octet
    pub fn from_nibble(nibble: u8) -> Option<Self> {
        match nibble & 0x0F {
            0 => Some(Self::Up50),
            1 => Some(Self::Up128),
            2 => Some(Self::Up206),
            3 => Some(Self::Up480),
            4 => Some(Self::Up1024),
            5 => Some(Self::Up1476),
            _ => None,
        }
    }

    /// Get the actual size in bytes
    pub fn size(&self) -> usize {
        match self {
            MaxApduSize::Up50 => 50,
            MaxApduSize::Up128 => 128,
            MaxApduSize::Up206 => 206,
            MaxApduSize::Up480 => 480,
            MaxApduSize::Up1024 => 1024,
            MaxApduSize::Up1476 => 1476,
        }
    }

    /// Largest encoding that fits within `bytes`
    pub fn for_size(bytes: usize) -> Self {
        if bytes >= 1476 {
            Self::Up1476
        } else if bytes >= 1024 {
            Self::Up1024
        } else if bytes >= 480 {
            Self::Up480
        } else if bytes >= 206 {
            Self::Up206
        } else if bytes >= 128 {
            Self::Up128
        } else {
            Self::Up50
        }
    }
}

/// Reasons carried by a Reject PDU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RejectReason {
    Other = 0,
    BufferOverflow = 1,
    InconsistentParameters = 2,
    InvalidParameterDataType = 3,
    InvalidTag = 4,
    MissingRequiredParameter = 5,
    ParameterOutOfRange = 6,
    TooManyArguments = 7,
    UndefinedEnumeration = 8,
    UnrecognizedService = 9,
}

/// Reasons carried by an Abort PDU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AbortReason {
    Other = 0,
    BufferOverflow = 1,
    InvalidApduInThisState = 2,
    PreemptedByHigherPriorityTask = 3,
    SegmentationNotSupported = 4,
    SecurityError = 5,
    InsufficientSecurity = 6,
    WindowSizeOutOfRange = 7,
    ApplicationExceededReplyTime = 8,
    OutOfResources = 9,
    TsmTimeout = 10,
    ApduTooLong = 11,
}

/// Application Protocol Data Unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Apdu {
    /// Confirmed service request
    ConfirmedRequest {
        segmented: bool,
        more_follows: bool,
        segmented_response_accepted: bool,
        max_segments: MaxSegments,
        max_response_size: MaxApduSize,
        invoke_id: u8,
        sequence_number: Option<u8>,
        proposed_window_size: Option<u8>,
        service_choice: u8,
        service_data: Vec<u8>,
    },

    /// Unconfirmed service request
    UnconfirmedRequest {
        service_choice: u8,
        service_data: Vec<u8>,
    },

    /// Simple acknowledgment
    SimpleAck { invoke_id: u8, service_choice: u8 },

    /// Complex acknowledgment
    ComplexAck {
        segmented: bool,
        more_follows: bool,
        invoke_id: u8,
        sequence_number: Option<u8>,
        proposed_window_size: Option<u8>,
        service_choice: u8,
        service_data: Vec<u8>,
    },

    /// Segment acknowledgment
    SegmentAck {
        negative: bool,
        server: bool,
        invoke_id: u8,
        sequence_number: u8,
        actual_window_size: u8,
    },

    /// Error PDU; the error class and code ride in the service data
    Error {
        invoke_id: u8,
        service_choice: u8,
        service_data: Vec<u8>,
    },

    /// Reject PDU
    Reject { invoke_id: u8, reject_reason: u8 },

    /// Abort PDU
    Abort {
        server: bool,
        invoke_id: u8,
        abort_reason: u8,
    },
}

impl Apdu {
    /// The PDU type of this APDU
    pub fn pdu_type(&self) -> PduType {
        match self {
            Apdu::ConfirmedRequest { .. } => PduType::ConfirmedRequest,
            Apdu::UnconfirmedRequest { .. } => PduType::UnconfirmedRequest,
            Apdu::SimpleAck { .. } => PduType::SimpleAck,
            Apdu::ComplexAck { .. } => PduType::ComplexAck,
            Apdu::SegmentAck { .. } => PduType::SegmentAck,
            Apdu::Error { .. } => PduType::Error,
            Apdu::Reject { .. } => PduType::Reject,
            Apdu::Abort { .. } => PduType::Abort,
        }
    }

    /// Encode APDU to bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::new();

        match self {
            Apdu::ConfirmedRequest {
                segmented,
                more_follows,
                segmented_response_accepted,
                max_segments,
                max_response_size,
                invoke_id,
                sequence_number,
                proposed_window_size,
                service_choice,
                service_data,
            } => {
                let mut first = (PduType::ConfirmedRequest as u8) << 4;
                if *segmented {
                    first |= 0x08;
                }
                if *more_follows {
                    first |= 0x04;
                }
                if *segmented_response_accepted {
                    first |= 0x02;
                }
                buffer.push(first);
                buffer.push(((*max_segments as u8) << 4) | (*max_response_size as u8));
                buffer.push(*invoke_id);
                if *segmented {
                    buffer.push(sequence_number.unwrap_or(0));
                    buffer.push(proposed_window_size.unwrap_or(1));
                }
                buffer.push(*service_choice);
                buffer.extend_from_slice(service_data);
            }

            Apdu::UnconfirmedRequest {
                service_choice,
                service_data,
            } => {
                buffer.push((PduType::UnconfirmedRequest as u8) << 4);
                buffer.push(*service_choice);
                buffer.extend_from_slice(service_data);
            }

            Apdu::SimpleAck {
                invoke_id,
                service_choice,
            } => {
                buffer.push((PduType::SimpleAck as u8) << 4);
                buffer.push(*invoke_id);
                buffer.push(*service_choice);
            }

            Apdu::ComplexAck {
                segmented,
                more_follows,
                invoke_id,
                sequence_number,
                proposed_window_size,
                service_choice,
                service_data,
            } => {
                let mut first = (PduType::ComplexAck as u8) << 4;
                if *segmented {
                    first |= 0x08;
                }
                if *more_follows {
                    first |= 0x04;
                }
                buffer.push(first);
                buffer.push(*invoke_id);
                if *segmented {
                    buffer.push(sequence_number.unwrap_or(0));
                    buffer.push(proposed_window_size.unwrap_or(1));
                }
                buffer.push(*service_choice);
                buffer.extend_from_slice(service_data);
            }

            Apdu::SegmentAck {
                negative,
                server,
                invoke_id,
                sequence_number,
                actual_window_size,
            } => {
                let mut first = (PduType::SegmentAck as u8) << 4;
                if *negative {
                    first |= 0x02;
                }
                if *server {
                    first |= 0x01;
                }
                buffer.push(first);
                buffer.push(*invoke_id);
                buffer.push(*sequence_number);
                buffer.push(*actual_window_size);
            }

            Apdu::Error {
                invoke_id,
                service_choice,
                service_data,
            } => {
                buffer.push((PduType::Error as u8) << 4);
                buffer.push(*invoke_id);
                buffer.push(*service_choice);
                buffer.extend_from_slice(service_data);
            }

            Apdu::Reject {
                invoke_id,
                reject_reason,
            } => {
                buffer.push((PduType::Reject as u8) << 4);
                buffer.push(*invoke_id);
                buffer.push(*reject_reason);
            }

            Apdu::Abort {
                server,
                invoke_id,
                abort_reason,
            } => {
                let mut first = (PduType::Abort as u8) << 4;
                if *server {
                    first |= 0x01;
                }
                buffer.push(first);
                buffer.push(*invoke_id);
                buffer.push(*abort_reason);
            }
        }

        buffer
    }

    /// Decode an APDU from bytes
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Err(ApplicationError::InvalidApdu("empty APDU".into()));
        }

        let first = data[0];
        let pdu_type = PduType::from_octet(first).ok_or(ApplicationError::UnsupportedApduType)?;

        match pdu_type {
            PduType::ConfirmedRequest => {
                let segmented = first & 0x08 != 0;
                let more_follows = first & 0x04 != 0;
                let segmented_response_accepted = first & 0x02 != 0;
                let fixed = if segmented { 6 } else { 4 };
                if data.len() < fixed {
                    return Err(ApplicationError::InvalidApdu(
                        "confirmed request header truncated".into(),
                    ));
                }
                let max_segments = MaxSegments::from_nibble(data[1] >> 4);
                let max_response_size = MaxApduSize::from_nibble(data[1])
                    .ok_or_else(|| ApplicationError::InvalidApdu("reserved max-APDU".into()))?;
                let invoke_id = data[2];
                let (sequence_number, proposed_window_size, choice_at) = if segmented {
                    (Some(data[3]), Some(data[4]), 5)
                } else {
                    (None, None, 3)
                };
                Ok(Apdu::ConfirmedRequest {
                    segmented,
                    more_follows,
                    segmented_response_accepted,
                    max_segments,
                    max_response_size,
                    invoke_id,
                    sequence_number,
                    proposed_window_size,
                    service_choice: data[choice_at],
                    service_data: data[choice_at + 1..].to_vec(),
                })
            }

            PduType::UnconfirmedRequest => {
                if data.len() < 2 {
                    return Err(ApplicationError::InvalidApdu(
                        "unconfirmed request truncated".into(),
                    ));
                }
                Ok(Apdu::UnconfirmedRequest {
                    service_choice: data[1],
                    service_data: data[2..].to_vec(),
                })
            }

            PduType::SimpleAck => {
                if data.len() < 3 {
                    return Err(ApplicationError::InvalidApdu("simple ack truncated".into()));
                }
                Ok(Apdu::SimpleAck {
                    invoke_id: data[1],
                    service_choice: data[2],
                })
            }

            PduType::ComplexAck => {
                let segmented = first & 0x08 != 0;
                let more_follows = first & 0x04 != 0;
                let fixed = if segmented { 5 } else { 3 };
                if data.len() < fixed {
                    return Err(ApplicationError::InvalidApdu(
                        "complex ack header truncated".into(),
                    ));
                }
                let invoke_id = data[1];
                let (sequence_number, proposed_window_size, choice_at) = if segmented {
                    (Some(data[2]), Some(data[3]), 4)
                } else {
                    (None, None, 2)
                };
                Ok(Apdu::ComplexAck {
                    segmented,
                    more_follows,
                    invoke_id,
                    sequence_number,
                    proposed_window_size,
                    service_choice: data[choice_at],
                    service_data: data[choice_at + 1..].to_vec(),
                })
            }

            PduType::SegmentAck => {
                if data.len() < 4 {
                    return Err(ApplicationError::InvalidApdu("segment ack truncated".into()));
                }
                Ok(Apdu::SegmentAck {
                    negative: first & 0x02 != 0,
                    server: first & 0x01 != 0,
                    invoke_id: data[1],
                    sequence_number: data[2],
                    actual_window_size: data[3],
                })
            }

            PduType::Error => {
                if data.len() < 3 {
                    return Err(ApplicationError::InvalidApdu("error PDU truncated".into()));
                }
                Ok(Apdu::Error {
                    invoke_id: data[1],
                    service_choice: data[2],
                    service_data: data[3..].to_vec(),
                })
            }

            PduType::Reject => {
                if data.len() < 3 {
                    return Err(ApplicationError::InvalidApdu("reject PDU truncated".into()));
                }
                Ok(Apdu::Reject {
                    invoke_id: data[1],
                    reject_reason: data[2],
                })
            }

            PduType::Abort => {
                if data.len() < 3 {
                    return Err(ApplicationError::InvalidApdu("abort PDU truncated".into()));
                }
                Ok(Apdu::Abort {
                    server: first & 0x01 != 0,
                    invoke_id: data[1],
                    abort_reason: data[2],
                })
            }
        }
    }
}

/// The fixed header the transaction layer keeps per slot and re-encodes for
/// every (re)transmission. Only confirmed requests and complex acks can be
/// segmented, so only those two carry one of these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApduFixedHeader {
    pub pdu_type: PduType,
    pub segmented: bool,
    pub more_follows: bool,
    pub segmented_response_accepted: bool,
    pub max_segments: MaxSegments,
    pub max_response_size: MaxApduSize,
    pub invoke_id: u8,
    pub sequence_number: u8,
    pub proposed_window_size: u8,
    pub service_choice: u8,
}

impl ApduFixedHeader {
    /// Header for an outbound confirmed request
    pub fn confirmed_request(
        invoke_id: u8,
        service_choice: u8,
        max_segments: MaxSegments,
        max_response_size: MaxApduSize,
        segmented_response_accepted: bool,
    ) -> Self {
        Self {
            pdu_type: PduType::ConfirmedRequest,
            segmented: false,
            more_follows: false,
            segmented_response_accepted,
            max_segments,
            max_response_size,
            invoke_id,
            sequence_number: 0,
            proposed_window_size: 1,
            service_choice,
        }
    }

    /// Header for an outbound complex ack
    pub fn complex_ack(invoke_id: u8, service_choice: u8) -> Self {
        Self {
            pdu_type: PduType::ComplexAck,
            segmented: false,
            more_follows: false,
            segmented_response_accepted: false,
            max_segments: MaxSegments::Unspecified,
            max_response_size: MaxApduSize::Up1476,
            invoke_id,
            sequence_number: 0,
            proposed_window_size: 1,
            service_choice,
        }
    }

    /// Size of the encoded header, with or without the segmentation octets
    pub fn size(&self, segmented: bool) -> usize {
        match self.pdu_type {
            PduType::ConfirmedRequest => {
                if segmented {
                    6
                } else {
                    4
                }
            }
            PduType::ComplexAck => {
                if segmented {
                    5
                } else {
                    3
                }
            }
            _ => 3,
        }
    }

    /// Encode into `buffer`, returning the octets written
    pub fn encode(&self, buffer: &mut Vec<u8>) -> Result<usize> {
        let start = buffer.len();
        match self.pdu_type {
            PduType::ConfirmedRequest => {
                let mut first = (PduType::ConfirmedRequest as u8) << 4;
                if self.segmented {
                    first |= 0x08;
                }
                if self.more_follows {
                    first |= 0x04;
                }
                if self.segmented_response_accepted {
                    first |= 0x02;
                }
                buffer.push(first);
                buffer.push(((self.max_segments as u8) << 4) | (self.max_response_size as u8));
                buffer.push(self.invoke_id);
                if self.segmented {
                    buffer.push(self.sequence_number);
                    buffer.push(self.proposed_window_size);
                }
                buffer.push(self.service_choice);
            }
            PduType::ComplexAck => {
                let mut first = (PduType::ComplexAck as u8) << 4;
                if self.segmented {
                    first |= 0x08;
                }
                if self.more_follows {
                    first |= 0x04;
                }
                buffer.push(first);
                buffer.push(self.invoke_id);
                if self.segmented {
                    buffer.push(self.sequence_number);
                    buffer.push(self.proposed_window_size);
                }
                buffer.push(self.service_choice);
            }
            _ => return Err(ApplicationError::UnsupportedApduType),
        }
        Ok(buffer.len() - start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confirmed_request_round_trip() {
        let apdu = Apdu::ConfirmedRequest {
            segmented: false,
            more_follows: false,
            segmented_response_accepted: true,
            max_segments: MaxSegments::Unspecified,
            max_response_size: MaxApduSize::Up1476,
            invoke_id: 1,
            sequence_number: None,
            proposed_window_size: None,
            service_choice: 12,
            service_data: vec![0x0C, 0x00, 0x00, 0x00, 0x00],
        };
        let encoded = apdu.encode();
        assert_eq!(encoded[0], 0x02);
        assert_eq!(encoded[1], 0x05);
        assert_eq!(encoded[2], 1);
        assert_eq!(Apdu::decode(&encoded).unwrap(), apdu);
    }

    #[test]
    fn test_segmented_confirmed_request_round_trip() {
        let apdu = Apdu::ConfirmedRequest {
            segmented: true,
            more_follows: true,
            segmented_response_accepted: true,
            max_segments: MaxSegments::SixtyFour,
            max_response_size: MaxApduSize::Up480,
            invoke_id: 99,
            sequence_number: Some(3),
            proposed_window_size: Some(32),
            service_choice: 16,
            service_data: vec![0xAA; 16],
        };
        let encoded = apdu.encode();
        assert_eq!(encoded[0] & 0x0E, 0x0C | 0x02);
        assert_eq!(encoded[3], 3);
        assert_eq!(encoded[4], 32);
        assert_eq!(Apdu::decode(&encoded).unwrap(), apdu);
    }

    #[test]
    fn test_complex_ack_round_trip() {
        let apdu = Apdu::ComplexAck {
            segmented: false,
            more_follows: false,
            invoke_id: 7,
            sequence_number: None,
            proposed_window_size: None,
            service_choice: 12,
            service_data: vec![0x44, 0x41, 0xBC, 0x00, 0x00],
        };
        let encoded = apdu.encode();
        assert_eq!(encoded[0], 0x30);
        assert_eq!(Apdu::decode(&encoded).unwrap(), apdu);
    }

    #[test]
    fn test_segment_ack_round_trip() {
        let apdu = Apdu::SegmentAck {
            negative: true,
            server: false,
            invoke_id: 5,
            sequence_number: 0,
            actual_window_size: 4,
        };
        let encoded = apdu.encode();
        assert_eq!(encoded, vec![0x42, 5, 0, 4]);
        assert_eq!(Apdu::decode(&encoded).unwrap(), apdu);
    }

    #[test]
    fn test_abort_reject_round_trip() {
        let abort = Apdu::Abort {
            server: true,
            invoke_id: 9,
            abort_reason: 4,
        };
        let encoded = abort.encode();
        assert_eq!(encoded, vec![0x71, 9, 4]);
        assert_eq!(Apdu::decode(&encoded).unwrap(), abort);

        let reject = Apdu::Reject {
            invoke_id: 9,
            reject_reason: 9,
        };
        let encoded = reject.encode();
        assert_eq!(encoded, vec![0x60, 9, 9]);
        assert_eq!(Apdu::decode(&encoded).unwrap(), reject);
    }

    #[test]
    fn test_max_segments_encoding() {
        assert_eq!(MaxSegments::for_count(5), MaxSegments::Eight);
        assert_eq!(MaxSegments::for_count(64), MaxSegments::SixtyFour);
        assert_eq!(MaxSegments::for_count(65), MaxSegments::GreaterThan64);
        assert_eq!(MaxSegments::ThirtyTwo.count(), Some(32));
        assert_eq!(MaxSegments::from_nibble(5), MaxSegments::ThirtyTwo);
    }

    #[test]
    fn test_max_apdu_size_encoding() {
        assert_eq!(MaxApduSize::for_size(480), MaxApduSize::Up480);
        assert_eq!(MaxApduSize::for_size(500), MaxApduSize::Up480);
        assert_eq!(MaxApduSize::for_size(1476), MaxApduSize::Up1476);
        assert_eq!(MaxApduSize::for_size(40), MaxApduSize::Up50);
        assert_eq!(MaxApduSize::from_nibble(3), Some(MaxApduSize::Up480));
        assert_eq!(MaxApduSize::from_nibble(9), None);
    }

    #[test]
    fn test_fixed_header_sizes() {
        let confirmed = ApduFixedHeader::confirmed_request(
            1,
            12,
            MaxSegments::Unspecified,
            MaxApduSize::Up1476,
            true,
        );
        assert_eq!(confirmed.size(false), 4);
        assert_eq!(confirmed.size(true), 6);

        let ack = ApduFixedHeader::complex_ack(1, 12);
        assert_eq!(ack.size(false), 3);
        assert_eq!(ack.size(true), 5);
    }

    #[test]
    fn test_fixed_header_matches_apdu_encoding() {
        let mut header = ApduFixedHeader::confirmed_request(
            42,
            15,
            MaxSegments::ThirtyTwo,
            MaxApduSize::Up480,
            true,
        );
        header.segmented = true;
        header.more_follows = true;
        header.sequence_number = 2;
        header.proposed_window_size = 16;

        let mut buffer = Vec::new();
        header.encode(&mut buffer).unwrap();

        let apdu = Apdu::ConfirmedRequest {
            segmented: true,
            more_follows: true,
            segmented_response_accepted: true,
            max_segments: MaxSegments::ThirtyTwo,
            max_response_size: MaxApduSize::Up480,
            invoke_id: 42,
            sequence_number: Some(2),
            proposed_window_size: Some(16),
            service_choice: 15,
            service_data: vec![],
        };
        assert_eq!(buffer, apdu.encode());
    }

    #[test]
    fn test_truncated_apdu() {
        assert!(Apdu::decode(&[]).is_err());
        assert!(Apdu::decode(&[0x00, 0x05]).is_err());
        assert!(Apdu::decode(&[0x08, 0x05, 0x01, 0x00]).is_err());
        assert!(Apdu::decode(&[0x40, 0x01]).is_err());
    }
}
