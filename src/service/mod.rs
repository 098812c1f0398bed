//! BACnet Service Layer Module
//!
//! The service layer routes decoded APDUs to the host's registered
//! handlers. One handler slot exists per confirmed service choice and per
//! unconfirmed service choice; acks, errors, rejects and aborts are routed
//! back to the transaction that originated the request via its invoke id.
//! An inbound confirmed request with no registered handler is answered
//! with Reject(unrecognized-service).
//!
//! The per-service codecs here are the ones the core itself needs: Who-Is
//! and I-Am for address binding, time synchronization, and the error
//! class/code pair carried by Error PDUs. All other service bodies pass
//! through as opaque bytes to the registered handlers.
//!
//! # Example
//!
//! ```
//! use bacnet_core::service::WhoIsRequest;
//!
//! let mut buffer = Vec::new();
//! WhoIsRequest::for_device(123).encode(&mut buffer).unwrap();
//! let decoded = WhoIsRequest::decode(&buffer).unwrap();
//! assert!(decoded.matches(123));
//! assert!(!decoded.matches(124));
//! ```

#[cfg(feature = "std")]
use std::error::Error;

#[cfg(feature = "std")]
use std::fmt;

#[cfg(not(feature = "std"))]
use core::fmt;

#[cfg(not(feature = "std"))]
use alloc::{boxed::Box, string::String, vec::Vec};

use crate::app::{Apdu, RejectReason};
use crate::encoding::{
    decode_application_date, decode_application_enumerated, decode_application_object_id,
    decode_application_time, decode_application_unsigned, decode_context_unsigned,
    encode_application_date, encode_application_enumerated, encode_application_object_id,
    encode_application_time, encode_application_unsigned, encode_context_unsigned, Date,
    EncodingError, ObjectIdentifier, ObjectType, Time,
};
use crate::network::{BacnetAddress, MessagePriority, Npdu};
use crate::session::SessionCore;
use crate::transaction::{ComplexAckInfo, ConfirmedRequestInfo, Reassembly};

/// Result type for service operations
#[cfg(feature = "std")]
pub type Result<T> = std::result::Result<T, ServiceError>;

#[cfg(not(feature = "std"))]
pub type Result<T> = core::result::Result<T, ServiceError>;

/// Errors that can occur in service operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    /// Service body failed to decode
    InvalidFormat(String),
    /// Underlying encoding error
    Encoding(EncodingError),
    /// Service choice out of range
    UnknownService(u8),
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceError::InvalidFormat(msg) => write!(f, "Invalid service format: {}", msg),
            ServiceError::Encoding(e) => write!(f, "Encoding error: {}", e),
            ServiceError::UnknownService(choice) => write!(f, "Unknown service choice: {}", choice),
        }
    }
}

#[cfg(feature = "std")]
impl Error for ServiceError {}

impl From<EncodingError> for ServiceError {
    fn from(error: EncodingError) -> Self {
        ServiceError::Encoding(error)
    }
}

/// Number of confirmed service choices
pub const MAX_CONFIRMED_SERVICES: usize = 30;

/// Handler table size for unconfirmed services
pub const MAX_UNCONFIRMED_SERVICES: usize = 16;

/// Confirmed service choices
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConfirmedServiceChoice {
    AcknowledgeAlarm = 0,
    ConfirmedCovNotification = 1,
    ConfirmedEventNotification = 2,
    GetAlarmSummary = 3,
    GetEnrollmentSummary = 4,
    SubscribeCov = 5,
    AtomicReadFile = 6,
    AtomicWriteFile = 7,
    AddListElement = 8,
    RemoveListElement = 9,
    CreateObject = 10,
    DeleteObject = 11,
    ReadProperty = 12,
    ReadPropertyConditional = 13,
    ReadPropertyMultiple = 14,
    WriteProperty = 15,
    WritePropertyMultiple = 16,
    DeviceCommunicationControl = 17,
    ConfirmedPrivateTransfer = 18,
    ConfirmedTextMessage = 19,
    ReinitializeDevice = 20,
    VtOpen = 21,
    VtClose = 22,
    VtData = 23,
    Authenticate = 24,
    RequestKey = 25,
    ReadRange = 26,
    LifeSafetyOperation = 27,
    SubscribeCovProperty = 28,
    GetEventInformation = 29,
}

/// Unconfirmed service choices
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UnconfirmedServiceChoice {
    IAm = 0,
    IHave = 1,
    UnconfirmedCovNotification = 2,
    UnconfirmedEventNotification = 3,
    UnconfirmedPrivateTransfer = 4,
    UnconfirmedTextMessage = 5,
    TimeSynchronization = 6,
    WhoHas = 7,
    WhoIs = 8,
    UtcTimeSynchronization = 9,
    WriteGroup = 10,
}

// -------------------------------------------------------------------------
// Handler registry
// -------------------------------------------------------------------------

/// Handler for an inbound confirmed request (reassembled if it arrived
/// segmented). Replies are composed through the transaction layer.
pub type ConfirmedServiceHandler =
    Box<dyn FnMut(&mut SessionCore, &ConfirmedRequestInfo, &[u8], &BacnetAddress)>;

/// Handler for an inbound unconfirmed request
pub type UnconfirmedServiceHandler = Box<dyn FnMut(&mut SessionCore, &[u8], &BacnetAddress)>;

/// Handler for a SimpleACK answering one of our requests
pub type SimpleAckHandler = Box<dyn FnMut(&mut SessionCore, u8, &BacnetAddress)>;

/// Handler for a ComplexACK body answering one of our requests
pub type ConfirmedAckHandler = Box<dyn FnMut(&mut SessionCore, u8, &[u8], &BacnetAddress)>;

/// Handler for an Error PDU: invoke id, error class, error code
pub type ErrorServiceHandler = Box<dyn FnMut(&mut SessionCore, u8, u32, u32, &BacnetAddress)>;

/// Handler for a Reject PDU: invoke id, reason
pub type RejectServiceHandler = Box<dyn FnMut(&mut SessionCore, u8, u8, &BacnetAddress)>;

/// Handler for an Abort PDU: invoke id, reason
pub type AbortServiceHandler = Box<dyn FnMut(&mut SessionCore, u8, u8, &BacnetAddress)>;

/// One handler slot per service code plus the reply handlers
pub struct ServiceRegistry {
    confirmed: Vec<Option<ConfirmedServiceHandler>>,
    unconfirmed: Vec<Option<UnconfirmedServiceHandler>>,
    simple_ack: Vec<Option<SimpleAckHandler>>,
    confirmed_ack: Vec<Option<ConfirmedAckHandler>>,
    error: Vec<Option<ErrorServiceHandler>>,
    reject: Option<RejectServiceHandler>,
    abort: Option<AbortServiceHandler>,
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceRegistry {
    pub fn new() -> Self {
        let mut confirmed = Vec::new();
        confirmed.resize_with(MAX_CONFIRMED_SERVICES, || None);
        let mut unconfirmed = Vec::new();
        unconfirmed.resize_with(MAX_UNCONFIRMED_SERVICES, || None);
        let mut simple_ack = Vec::new();
        simple_ack.resize_with(MAX_CONFIRMED_SERVICES, || None);
        let mut confirmed_ack = Vec::new();
        confirmed_ack.resize_with(MAX_CONFIRMED_SERVICES, || None);
        let mut error = Vec::new();
        error.resize_with(MAX_CONFIRMED_SERVICES, || None);
        Self {
            confirmed,
            unconfirmed,
            simple_ack,
            confirmed_ack,
            error,
            reject: None,
            abort: None,
        }
    }

    pub fn register_confirmed(
        &mut self,
        choice: ConfirmedServiceChoice,
        handler: ConfirmedServiceHandler,
    ) {
        self.confirmed[choice as usize] = Some(handler);
    }

    pub fn register_unconfirmed(
        &mut self,
        choice: UnconfirmedServiceChoice,
        handler: UnconfirmedServiceHandler,
    ) {
        self.unconfirmed[choice as usize] = Some(handler);
    }

    pub fn register_simple_ack(&mut self, choice: ConfirmedServiceChoice, handler: SimpleAckHandler) {
        self.simple_ack[choice as usize] = Some(handler);
    }

    pub fn register_confirmed_ack(
        &mut self,
        choice: ConfirmedServiceChoice,
        handler: ConfirmedAckHandler,
    ) {
        self.confirmed_ack[choice as usize] = Some(handler);
    }

    pub fn register_error(&mut self, choice: ConfirmedServiceChoice, handler: ErrorServiceHandler) {
        self.error[choice as usize] = Some(handler);
    }

    pub fn register_reject(&mut self, handler: RejectServiceHandler) {
        self.reject = Some(handler);
    }

    pub fn register_abort(&mut self, handler: AbortServiceHandler) {
        self.abort = Some(handler);
    }
}

/// Send a Reject PDU
pub fn send_reject(
    link: &mut dyn crate::datalink::DataLink,
    dest: &BacnetAddress,
    invoke_id: u8,
    reason: RejectReason,
) {
    let npdu = Npdu::application(false, MessagePriority::Normal).route_to(dest);
    let mut pdu = npdu.encode();
    pdu.extend_from_slice(
        &Apdu::Reject {
            invoke_id,
            reject_reason: reason as u8,
        }
        .encode(),
    );
    let _ = link.send_pdu(dest, false, &pdu);
}

/// Route one inbound APDU to its handler.
///
/// Confirmed requests go to the registered handler (or draw a Reject);
/// replies are validated against the transaction table, delivered to the
/// matching ack/error handler, and their invoke ids released.
pub fn dispatch_apdu(
    registry: &mut ServiceRegistry,
    core: &mut SessionCore,
    src: &BacnetAddress,
    apdu_bytes: &[u8],
) {
    let apdu = match Apdu::decode(apdu_bytes) {
        Ok(apdu) => apdu,
        Err(error) => {
            log::debug!("service: dropping undecodable APDU: {}", error);
            return;
        }
    };

    match &apdu {
        Apdu::ConfirmedRequest {
            segmented,
            service_data,
            ..
        } => {
            let info = ConfirmedRequestInfo::from_apdu(&apdu).expect("confirmed request");
            if *segmented {
                let (internal, reassembly) = core.tsm.segmented_request_received(
                    core.datalink.as_mut(),
                    src,
                    &info,
                    service_data,
                );
                if let Reassembly::Complete(body) = reassembly {
                    invoke_confirmed(registry, core, &info, &body, src);
                    // unless the handler's reply took the slot over for a
                    // segmented response, the server transaction is done
                    if core.tsm.state_of(internal)
                        == Some(crate::transaction::TsmState::SegmentedRequestServer)
                    {
                        core.tsm.free_invoke_id(internal, None, true);
                    }
                }
            } else {
                invoke_confirmed(registry, core, &info, service_data, src);
            }
        }

        Apdu::UnconfirmedRequest {
            service_choice,
            service_data,
        } => {
            if let Some(handler) = registry
                .unconfirmed
                .get_mut(*service_choice as usize)
                .and_then(Option::as_mut)
            {
                handler(core, service_data, src);
            }
        }

        Apdu::SimpleAck {
            invoke_id,
            service_choice,
        } => {
            if core
                .tsm
                .confirmation_acceptable(core.datalink.as_mut(), *invoke_id, src)
            {
                if let Some(handler) = registry
                    .simple_ack
                    .get_mut(*service_choice as usize)
                    .and_then(Option::as_mut)
                {
                    handler(core, *invoke_id, src);
                }
                core.tsm.free_invoke_id(*invoke_id, Some(src), true);
            }
        }

        Apdu::ComplexAck {
            segmented,
            invoke_id,
            service_choice,
            service_data,
            sequence_number,
            proposed_window_size,
            more_follows,
        } => {
            if *segmented {
                let info = ComplexAckInfo {
                    invoke_id: *invoke_id,
                    service_choice: *service_choice,
                    sequence_number: sequence_number.unwrap_or(0),
                    proposed_window_size: proposed_window_size.unwrap_or(1),
                    more_follows: *more_follows,
                };
                let reassembly = core.tsm.segmented_complexack_received(
                    core.datalink.as_mut(),
                    src,
                    &info,
                    service_data,
                );
                if let Reassembly::Complete(body) = reassembly {
                    invoke_confirmed_ack(registry, core, *service_choice, *invoke_id, &body, src);
                    core.tsm.free_invoke_id(*invoke_id, Some(src), true);
                }
            } else if core
                .tsm
                .confirmation_acceptable(core.datalink.as_mut(), *invoke_id, src)
            {
                invoke_confirmed_ack(registry, core, *service_choice, *invoke_id, service_data, src);
                core.tsm.free_invoke_id(*invoke_id, Some(src), true);
            }
        }

        Apdu::SegmentAck {
            negative,
            server,
            invoke_id,
            sequence_number,
            actual_window_size,
        } => {
            core.tsm.segment_ack_received(
                core.datalink.as_mut(),
                *invoke_id,
                *sequence_number,
                *actual_window_size,
                *negative,
                *server,
                src,
            );
        }

        Apdu::Error {
            invoke_id,
            service_choice,
            service_data,
        } => {
            let (class, code) = decode_error(service_data).unwrap_or((0, 0));
            log::debug!(
                "service: error for invoke {}: class {} code {}",
                invoke_id,
                class,
                code
            );
            core.tsm
                .error_received(core.datalink.as_mut(), *invoke_id, src);
            if let Some(handler) = registry
                .error
                .get_mut(*service_choice as usize)
                .and_then(Option::as_mut)
            {
                handler(core, *invoke_id, class, code, src);
            }
            core.tsm.free_invoke_id(*invoke_id, Some(src), true);
        }

        Apdu::Reject {
            invoke_id,
            reject_reason,
        } => {
            core.tsm
                .reject_received(core.datalink.as_mut(), *invoke_id, src);
            if let Some(handler) = registry.reject.as_mut() {
                handler(core, *invoke_id, *reject_reason, src);
            }
            core.tsm.free_invoke_id(*invoke_id, Some(src), true);
        }

        Apdu::Abort {
            invoke_id,
            abort_reason,
            ..
        } => {
            core.tsm
                .abort_received(core.datalink.as_mut(), *invoke_id, src);
            if let Some(handler) = registry.abort.as_mut() {
                handler(core, *invoke_id, *abort_reason, src);
            }
            core.tsm.free_invoke_id(*invoke_id, Some(src), true);
        }
    }
}

fn invoke_confirmed(
    registry: &mut ServiceRegistry,
    core: &mut SessionCore,
    info: &ConfirmedRequestInfo,
    body: &[u8],
    src: &BacnetAddress,
) {
    let slot = info.service_choice as usize;
    match registry.confirmed.get_mut(slot).and_then(Option::as_mut) {
        Some(handler) => handler(core, info, body, src),
        None => {
            log::debug!(
                "service: no handler for confirmed service {}, rejecting",
                info.service_choice
            );
            send_reject(
                core.datalink.as_mut(),
                src,
                info.invoke_id,
                RejectReason::UnrecognizedService,
            );
        }
    }
}

fn invoke_confirmed_ack(
    registry: &mut ServiceRegistry,
    core: &mut SessionCore,
    service_choice: u8,
    invoke_id: u8,
    body: &[u8],
    src: &BacnetAddress,
) {
    match registry
        .confirmed_ack
        .get_mut(service_choice as usize)
        .and_then(Option::as_mut)
    {
        Some(handler) => handler(core, invoke_id, body, src),
        None => {
            // an out-of-range or unregistered choice is unmatched, never
            // routed to another service's handler
            log::debug!(
                "service: no ack handler for service {}, invoke {}",
                service_choice,
                invoke_id
            );
        }
    }
}

// -------------------------------------------------------------------------
// Error class/code pair
// -------------------------------------------------------------------------

/// Encode the (error-class, error-code) pair of an Error PDU body
pub fn encode_error(buffer: &mut Vec<u8>, class: u32, code: u32) -> Result<usize> {
    let mut len = encode_application_enumerated(buffer, class)?;
    len += encode_application_enumerated(buffer, code)?;
    Ok(len)
}

/// Decode the (error-class, error-code) pair of an Error PDU body
pub fn decode_error(data: &[u8]) -> Result<(u32, u32)> {
    let (class, consumed) = decode_application_enumerated(data)?;
    let (code, _) = decode_application_enumerated(&data[consumed..])?;
    Ok((class, code))
}

// -------------------------------------------------------------------------
// Who-Is / I-Am
// -------------------------------------------------------------------------

/// Who-Is request: unbounded, or a device instance range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WhoIsRequest {
    pub device_instance_low: Option<u32>,
    pub device_instance_high: Option<u32>,
}

impl WhoIsRequest {
    /// Who-Is for all devices
    pub fn new() -> Self {
        Self::default()
    }

    /// Who-Is for a single device
    pub fn for_device(device_instance: u32) -> Self {
        Self {
            device_instance_low: Some(device_instance),
            device_instance_high: Some(device_instance),
        }
    }

    /// Who-Is for an instance range
    pub fn for_range(low: u32, high: u32) -> Self {
        Self {
            device_instance_low: Some(low),
            device_instance_high: Some(high),
        }
    }

    pub fn encode(&self, buffer: &mut Vec<u8>) -> Result<usize> {
        let mut len = 0;
        if let (Some(low), Some(high)) = (self.device_instance_low, self.device_instance_high) {
            len += encode_context_unsigned(buffer, 0, low)?;
            len += encode_context_unsigned(buffer, 1, high)?;
        }
        Ok(len)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Ok(Self::new());
        }
        let (low, consumed) = decode_context_unsigned(data, 0)?;
        let (high, _) = decode_context_unsigned(&data[consumed..], 1)?;
        Ok(Self {
            device_instance_low: Some(low),
            device_instance_high: Some(high),
        })
    }

    /// Does this Who-Is address the given device?
    pub fn matches(&self, device_instance: u32) -> bool {
        match (self.device_instance_low, self.device_instance_high) {
            (Some(low), Some(high)) => (low..=high).contains(&device_instance),
            _ => true,
        }
    }
}

/// I-Am announcement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IAmRequest {
    pub device_identifier: ObjectIdentifier,
    pub max_apdu_length_accepted: u32,
    pub segmentation_supported: u32,
    pub vendor_identifier: u32,
}

impl IAmRequest {
    pub fn new(
        device_instance: u32,
        max_apdu_length_accepted: u32,
        segmentation_supported: u32,
        vendor_identifier: u32,
    ) -> Self {
        Self {
            device_identifier: ObjectIdentifier::new(ObjectType::Device, device_instance),
            max_apdu_length_accepted,
            segmentation_supported,
            vendor_identifier,
        }
    }

    pub fn encode(&self, buffer: &mut Vec<u8>) -> Result<usize> {
        let mut len = encode_application_object_id(buffer, &self.device_identifier)?;
        len += encode_application_unsigned(buffer, self.max_apdu_length_accepted)?;
        len += encode_application_enumerated(buffer, self.segmentation_supported)?;
        len += encode_application_unsigned(buffer, self.vendor_identifier)?;
        Ok(len)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let (device_identifier, mut consumed) = decode_application_object_id(data)?;
        let (max_apdu, used) = decode_application_unsigned(&data[consumed..])?;
        consumed += used;
        let (segmentation, used) = decode_application_enumerated(&data[consumed..])?;
        consumed += used;
        let (vendor, _) = decode_application_unsigned(&data[consumed..])?;
        Ok(Self {
            device_identifier,
            max_apdu_length_accepted: max_apdu,
            segmentation_supported: segmentation,
            vendor_identifier: vendor,
        })
    }
}

// -------------------------------------------------------------------------
// Time synchronization
// -------------------------------------------------------------------------

/// Time-Synchronization request (local or UTC form; the service choice
/// distinguishes them on the wire)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSynchronizationRequest {
    pub date: Date,
    pub time: Time,
}

impl TimeSynchronizationRequest {
    pub fn new(date: Date, time: Time) -> Self {
        Self { date, time }
    }

    /// Build from the host clock
    #[cfg(feature = "std")]
    pub fn from_local_clock() -> Self {
        use chrono::{Datelike, Local, Timelike};
        let now = Local::now();
        let weekday = now.weekday().number_from_monday() as u8;
        Self {
            date: Date::new(now.year() as u16, now.month() as u8, now.day() as u8, weekday),
            time: Time::new(
                now.hour() as u8,
                now.minute() as u8,
                now.second() as u8,
                (now.nanosecond() / 10_000_000) as u8,
            ),
        }
    }

    /// Build from the host clock in UTC
    #[cfg(feature = "std")]
    pub fn from_utc_clock() -> Self {
        use chrono::{Datelike, Timelike, Utc};
        let now = Utc::now();
        let weekday = now.weekday().number_from_monday() as u8;
        Self {
            date: Date::new(now.year() as u16, now.month() as u8, now.day() as u8, weekday),
            time: Time::new(
                now.hour() as u8,
                now.minute() as u8,
                now.second() as u8,
                (now.nanosecond() / 10_000_000) as u8,
            ),
        }
    }

    pub fn encode(&self, buffer: &mut Vec<u8>) -> Result<usize> {
        let mut len = encode_application_date(buffer, &self.date)?;
        len += encode_application_time(buffer, &self.time)?;
        Ok(len)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let (date, consumed) = decode_application_date(data)?;
        let (time, _) = decode_application_time(&data[consumed..])?;
        Ok(Self { date, time })
    }
}

// -------------------------------------------------------------------------
// Who-Has / I-Have
// -------------------------------------------------------------------------

/// The object a Who-Has asks for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WhoHasObject {
    Identifier(ObjectIdentifier),
    Name(Vec<u8>),
}

/// Who-Has request: an optional device range plus the object searched for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WhoHasRequest {
    pub device_instance_low: Option<u32>,
    pub device_instance_high: Option<u32>,
    pub object: WhoHasObject,
}

impl WhoHasRequest {
    pub fn for_object(object_identifier: ObjectIdentifier) -> Self {
        Self {
            device_instance_low: None,
            device_instance_high: None,
            object: WhoHasObject::Identifier(object_identifier),
        }
    }

    pub fn for_name(name: &str) -> Self {
        Self {
            device_instance_low: None,
            device_instance_high: None,
            object: WhoHasObject::Name(name.as_bytes().to_vec()),
        }
    }

    pub fn encode(&self, buffer: &mut Vec<u8>) -> Result<usize> {
        let mut len = 0;
        if let (Some(low), Some(high)) = (self.device_instance_low, self.device_instance_high) {
            len += encode_context_unsigned(buffer, 0, low)?;
            len += encode_context_unsigned(buffer, 1, high)?;
        }
        match &self.object {
            WhoHasObject::Identifier(object_identifier) => {
                len += crate::encoding::encode_context_object_id(buffer, 2, object_identifier)?;
            }
            WhoHasObject::Name(name) => {
                // a context-tagged character string: charset octet plus text
                len += crate::encoding::encode_context_tag(buffer, 3, name.len() + 1)?;
                buffer.push(crate::encoding::CHARACTER_SET_ANSI);
                buffer.extend_from_slice(name);
                len += name.len() + 1;
            }
        }
        Ok(len)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut consumed = 0;
        let (low, high) = match decode_context_unsigned(data, 0) {
            Ok((low, used)) => {
                consumed += used;
                let (high, used) = decode_context_unsigned(&data[consumed..], 1)?;
                consumed += used;
                (Some(low), Some(high))
            }
            Err(_) => (None, None),
        };

        let tag = crate::encoding::decode_tag(&data[consumed..])?;
        let object = if tag.context && tag.number == 2 {
            let (object_identifier, _) =
                crate::encoding::decode_context_object_id(&data[consumed..], 2)?;
            WhoHasObject::Identifier(object_identifier)
        } else if tag.context && tag.number == 3 {
            let start = consumed + tag.consumed;
            if data.len() < start + tag.length || tag.length == 0 {
                return Err(ServiceError::InvalidFormat("object name truncated".into()));
            }
            WhoHasObject::Name(data[start + 1..start + tag.length].to_vec())
        } else {
            return Err(ServiceError::InvalidFormat("expected object id or name".into()));
        };

        Ok(Self {
            device_instance_low: low,
            device_instance_high: high,
            object,
        })
    }

    /// Does this Who-Has address the given device?
    pub fn matches_device(&self, device_instance: u32) -> bool {
        match (self.device_instance_low, self.device_instance_high) {
            (Some(low), Some(high)) => (low..=high).contains(&device_instance),
            _ => true,
        }
    }
}

/// I-Have announcement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IHaveRequest {
    pub device_identifier: ObjectIdentifier,
    pub object_identifier: ObjectIdentifier,
    pub object_name: Vec<u8>,
}

impl IHaveRequest {
    pub fn encode(&self, buffer: &mut Vec<u8>) -> Result<usize> {
        let mut len = encode_application_object_id(buffer, &self.device_identifier)?;
        len += encode_application_object_id(buffer, &self.object_identifier)?;
        let name = crate::encoding::CharacterString {
            encoding: crate::encoding::CHARACTER_SET_ANSI,
            content: self.object_name.clone(),
        };
        len += crate::encoding::encode_application_character_string(buffer, &name)?;
        Ok(len)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let (device_identifier, mut consumed) = decode_application_object_id(data)?;
        let (object_identifier, used) = decode_application_object_id(&data[consumed..])?;
        consumed += used;
        let (name, _) =
            crate::encoding::decode_application_character_string(&data[consumed..])?;
        Ok(Self {
            device_identifier,
            object_identifier,
            object_name: name.content,
        })
    }
}

// -------------------------------------------------------------------------
// Change-of-value notifications and subscriptions
// -------------------------------------------------------------------------

/// COV notification body (confirmed and unconfirmed forms share it)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CovNotification {
    pub subscriber_process_identifier: u32,
    pub initiating_device_identifier: ObjectIdentifier,
    pub monitored_object_identifier: ObjectIdentifier,
    pub time_remaining_seconds: u32,
    /// List of property values as opaque bytes inside context 4
    pub values: Vec<u8>,
}

impl CovNotification {
    pub fn encode(&self, buffer: &mut Vec<u8>) -> Result<usize> {
        let mut len = encode_context_unsigned(buffer, 0, self.subscriber_process_identifier)?;
        len += crate::encoding::encode_context_object_id(
            buffer,
            1,
            &self.initiating_device_identifier,
        )?;
        len += crate::encoding::encode_context_object_id(
            buffer,
            2,
            &self.monitored_object_identifier,
        )?;
        len += encode_context_unsigned(buffer, 3, self.time_remaining_seconds)?;
        len += crate::encoding::encode_opening_tag(buffer, 4)?;
        buffer.extend_from_slice(&self.values);
        len += self.values.len();
        len += crate::encoding::encode_closing_tag(buffer, 4)?;
        Ok(len)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let (process, mut consumed) = decode_context_unsigned(data, 0)?;
        let (device, used) = crate::encoding::decode_context_object_id(&data[consumed..], 1)?;
        consumed += used;
        let (object, used) = crate::encoding::decode_context_object_id(&data[consumed..], 2)?;
        consumed += used;
        let (remaining, used) = decode_context_unsigned(&data[consumed..], 3)?;
        consumed += used;

        let opening = crate::encoding::decode_tag(&data[consumed..])?;
        if !opening.opening || opening.number != 4 {
            return Err(ServiceError::InvalidFormat("expected opening tag 4".into()));
        }
        consumed += opening.consumed;
        // the list runs to the trailing closing tag
        if data.len() <= consumed {
            return Err(ServiceError::InvalidFormat("expected closing tag 4".into()));
        }
        let end = data.len() - 1;

        Ok(Self {
            subscriber_process_identifier: process,
            initiating_device_identifier: device,
            monitored_object_identifier: object,
            time_remaining_seconds: remaining,
            values: data[consumed..end].to_vec(),
        })
    }
}

/// One active COV subscription held by the server side
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CovSubscription {
    pub recipient: BacnetAddress,
    pub subscriber_process_identifier: u32,
    pub monitored_object_identifier: ObjectIdentifier,
    pub issue_confirmed_notifications: bool,
    /// 0 means indefinite
    pub lifetime_seconds: u32,
    pub remaining_seconds: u32,
}

impl CovSubscription {
    pub fn is_expired(&self) -> bool {
        self.lifetime_seconds != 0 && self.remaining_seconds == 0
    }
}

/// Server-side COV subscription bookkeeping: fixed capacity, keyed by
/// (recipient, process id, monitored object)
#[derive(Debug, Default)]
pub struct CovSubscriptionManager {
    subscriptions: Vec<CovSubscription>,
    capacity: usize,
}

impl CovSubscriptionManager {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscriptions: Vec::new(),
            capacity,
        }
    }

    fn position(
        &self,
        recipient: &BacnetAddress,
        process: u32,
        object: &ObjectIdentifier,
    ) -> Option<usize> {
        self.subscriptions.iter().position(|s| {
            s.recipient.matches(recipient)
                && s.subscriber_process_identifier == process
                && s.monitored_object_identifier == *object
        })
    }

    /// Install or refresh a subscription; false when the table is full
    pub fn subscribe(
        &mut self,
        recipient: &BacnetAddress,
        request: &SubscribeCovRequest,
    ) -> bool {
        let lifetime = request.lifetime_seconds.unwrap_or(0);
        let subscription = CovSubscription {
            recipient: recipient.clone(),
            subscriber_process_identifier: request.subscriber_process_identifier,
            monitored_object_identifier: request.monitored_object_identifier,
            issue_confirmed_notifications: request
                .issue_confirmed_notifications
                .unwrap_or(false),
            lifetime_seconds: lifetime,
            remaining_seconds: lifetime,
        };
        match self.position(
            recipient,
            request.subscriber_process_identifier,
            &request.monitored_object_identifier,
        ) {
            Some(index) => {
                self.subscriptions[index] = subscription;
                true
            }
            None if self.subscriptions.len() < self.capacity => {
                self.subscriptions.push(subscription);
                true
            }
            None => false,
        }
    }

    /// Cancel a subscription; false if it did not exist
    pub fn cancel(
        &mut self,
        recipient: &BacnetAddress,
        process: u32,
        object: &ObjectIdentifier,
    ) -> bool {
        match self.position(recipient, process, object) {
            Some(index) => {
                self.subscriptions.remove(index);
                true
            }
            None => false,
        }
    }

    /// The live subscriptions watching `object`
    pub fn subscriptions_for<'a>(
        &'a self,
        object: &ObjectIdentifier,
    ) -> impl Iterator<Item = &'a CovSubscription> + 'a {
        let object = *object;
        self.subscriptions
            .iter()
            .filter(move |s| s.monitored_object_identifier == object && !s.is_expired())
    }

    /// Age every finite subscription and drop the expired ones
    pub fn timer_seconds(&mut self, seconds: u32) {
        for s in self.subscriptions.iter_mut() {
            if s.lifetime_seconds != 0 {
                s.remaining_seconds = s.remaining_seconds.saturating_sub(seconds);
            }
        }
        self.subscriptions.retain(|s| !s.is_expired());
    }

    pub fn active_count(&self) -> usize {
        self.subscriptions.len()
    }
}

// -------------------------------------------------------------------------
// Device communication control
// -------------------------------------------------------------------------

/// DeviceCommunicationControl enable/disable argument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum CommunicationControl {
    #[default]
    Enable = 0,
    Disable = 1,
    DisableInitiation = 2,
}

impl CommunicationControl {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Enable),
            1 => Some(Self::Disable),
            2 => Some(Self::DisableInitiation),
            _ => None,
        }
    }
}

/// DeviceCommunicationControl request body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCommunicationControlRequest {
    /// Optional duration in minutes; absent means indefinite
    pub time_duration_minutes: Option<u16>,
    pub state: CommunicationControl,
    /// Optional password, up to 20 characters
    pub password: Option<Vec<u8>>,
}

impl DeviceCommunicationControlRequest {
    pub fn new(state: CommunicationControl, time_duration_minutes: Option<u16>) -> Self {
        Self {
            time_duration_minutes,
            state,
            password: None,
        }
    }

    pub fn with_password(mut self, password: &str) -> Self {
        self.password = Some(password.as_bytes().to_vec());
        self
    }

    pub fn encode(&self, buffer: &mut Vec<u8>) -> Result<usize> {
        let mut len = 0;
        if let Some(minutes) = self.time_duration_minutes {
            len += encode_context_unsigned(buffer, 0, minutes as u32)?;
        }
        len += encode_context_unsigned(buffer, 1, self.state as u32)?;
        if let Some(password) = &self.password {
            len += crate::encoding::encode_context_tag(buffer, 2, password.len() + 1)?;
            buffer.push(crate::encoding::CHARACTER_SET_ANSI);
            buffer.extend_from_slice(password);
            len += password.len() + 1;
        }
        Ok(len)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut consumed = 0;
        let time_duration_minutes = match decode_context_unsigned(data, 0) {
            Ok((minutes, used)) => {
                consumed += used;
                Some(minutes as u16)
            }
            Err(_) => None,
        };
        let (state, used) = decode_context_unsigned(&data[consumed..], 1)?;
        consumed += used;
        let state = CommunicationControl::from_u8(state as u8)
            .ok_or_else(|| ServiceError::InvalidFormat("bad enable/disable".into()))?;
        let password = match crate::encoding::decode_tag(&data[consumed..]) {
            Ok(tag) if tag.context && tag.number == 2 && tag.length > 0 => {
                let start = consumed + tag.consumed;
                if data.len() < start + tag.length {
                    return Err(ServiceError::InvalidFormat("password truncated".into()));
                }
                Some(data[start + 1..start + tag.length].to_vec())
            }
            _ => None,
        };
        Ok(Self {
            time_duration_minutes,
            state,
            password,
        })
    }
}

// -------------------------------------------------------------------------
// Property service codecs used by the client API
// -------------------------------------------------------------------------

/// Well-known property identifiers used by the client wrappers
pub mod property {
    pub const OBJECT_IDENTIFIER: u32 = 75;
    pub const OBJECT_NAME: u32 = 77;
    pub const OBJECT_TYPE: u32 = 79;
    pub const PRESENT_VALUE: u32 = 85;
    pub const STATUS_FLAGS: u32 = 111;
    pub const UNITS: u32 = 117;
    pub const VENDOR_IDENTIFIER: u32 = 120;
    pub const DEVICE_ADDRESS_BINDING: u32 = 30;
}

/// ReadProperty request body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadPropertyRequest {
    pub object_identifier: ObjectIdentifier,
    pub property_identifier: u32,
    pub array_index: Option<u32>,
}

impl ReadPropertyRequest {
    pub fn new(object_identifier: ObjectIdentifier, property_identifier: u32) -> Self {
        Self {
            object_identifier,
            property_identifier,
            array_index: None,
        }
    }

    pub fn with_array_index(mut self, array_index: u32) -> Self {
        self.array_index = Some(array_index);
        self
    }

    pub fn encode(&self, buffer: &mut Vec<u8>) -> Result<usize> {
        let mut len =
            crate::encoding::encode_context_object_id(buffer, 0, &self.object_identifier)?;
        len += encode_context_unsigned(buffer, 1, self.property_identifier)?;
        if let Some(index) = self.array_index {
            len += encode_context_unsigned(buffer, 2, index)?;
        }
        Ok(len)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let (object_identifier, mut consumed) =
            crate::encoding::decode_context_object_id(data, 0)?;
        let (property_identifier, used) = decode_context_unsigned(&data[consumed..], 1)?;
        consumed += used;
        let array_index = match decode_context_unsigned(&data[consumed..], 2) {
            Ok((index, _)) => Some(index),
            Err(_) => None,
        };
        Ok(Self {
            object_identifier,
            property_identifier,
            array_index,
        })
    }
}

/// ReadProperty acknowledgment body: the addressed property plus its value
/// as opaque application-tagged bytes inside context 3
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadPropertyAck {
    pub object_identifier: ObjectIdentifier,
    pub property_identifier: u32,
    pub array_index: Option<u32>,
    pub value: Vec<u8>,
}

impl ReadPropertyAck {
    pub fn new(request: &ReadPropertyRequest, value: Vec<u8>) -> Self {
        Self {
            object_identifier: request.object_identifier,
            property_identifier: request.property_identifier,
            array_index: request.array_index,
            value,
        }
    }

    pub fn encode(&self, buffer: &mut Vec<u8>) -> Result<usize> {
        let mut len =
            crate::encoding::encode_context_object_id(buffer, 0, &self.object_identifier)?;
        len += encode_context_unsigned(buffer, 1, self.property_identifier)?;
        if let Some(index) = self.array_index {
            len += encode_context_unsigned(buffer, 2, index)?;
        }
        len += crate::encoding::encode_opening_tag(buffer, 3)?;
        buffer.extend_from_slice(&self.value);
        len += self.value.len();
        len += crate::encoding::encode_closing_tag(buffer, 3)?;
        Ok(len)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let (object_identifier, mut consumed) =
            crate::encoding::decode_context_object_id(data, 0)?;
        let (property_identifier, used) = decode_context_unsigned(&data[consumed..], 1)?;
        consumed += used;
        let array_index = match decode_context_unsigned(&data[consumed..], 2) {
            Ok((index, used)) => {
                consumed += used;
                Some(index)
            }
            Err(_) => None,
        };

        let opening = crate::encoding::decode_tag(&data[consumed..])?;
        if !opening.opening || opening.number != 3 {
            return Err(ServiceError::InvalidFormat("expected opening tag 3".into()));
        }
        consumed += opening.consumed;

        // walk the value TLVs to the matching closing tag
        let mut end = consumed;
        let mut depth = 0u32;
        loop {
            if end >= data.len() {
                return Err(ServiceError::InvalidFormat("expected closing tag 3".into()));
            }
            let tag = crate::encoding::decode_tag(&data[end..])?;
            if tag.closing && tag.number == 3 && depth == 0 {
                break;
            }
            if tag.opening {
                depth += 1;
                end += tag.consumed;
            } else if tag.closing {
                depth = depth.saturating_sub(1);
                end += tag.consumed;
            } else {
                // a boolean application tag carries its value in the
                // length field with no content octets
                let content = if !tag.context && tag.number == 1 {
                    0
                } else {
                    tag.length
                };
                end += tag.consumed + content;
            }
        }

        Ok(Self {
            object_identifier,
            property_identifier,
            array_index,
            value: data[consumed..end].to_vec(),
        })
    }
}

/// WriteProperty request body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WritePropertyRequest {
    pub object_identifier: ObjectIdentifier,
    pub property_identifier: u32,
    pub array_index: Option<u32>,
    /// Application-tagged value bytes
    pub value: Vec<u8>,
    /// Command priority 1..16
    pub priority: Option<u8>,
}

impl WritePropertyRequest {
    pub fn new(
        object_identifier: ObjectIdentifier,
        property_identifier: u32,
        value: Vec<u8>,
    ) -> Self {
        Self {
            object_identifier,
            property_identifier,
            array_index: None,
            value,
            priority: None,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn encode(&self, buffer: &mut Vec<u8>) -> Result<usize> {
        let mut len =
            crate::encoding::encode_context_object_id(buffer, 0, &self.object_identifier)?;
        len += encode_context_unsigned(buffer, 1, self.property_identifier)?;
        if let Some(index) = self.array_index {
            len += encode_context_unsigned(buffer, 2, index)?;
        }
        len += crate::encoding::encode_opening_tag(buffer, 3)?;
        buffer.extend_from_slice(&self.value);
        len += self.value.len();
        len += crate::encoding::encode_closing_tag(buffer, 3)?;
        if let Some(priority) = self.priority {
            len += encode_context_unsigned(buffer, 4, priority as u32)?;
        }
        Ok(len)
    }
}

/// SubscribeCOV request body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeCovRequest {
    pub subscriber_process_identifier: u32,
    pub monitored_object_identifier: ObjectIdentifier,
    /// Absent on cancellation
    pub issue_confirmed_notifications: Option<bool>,
    /// Absent on cancellation; 0 means indefinite
    pub lifetime_seconds: Option<u32>,
}

impl SubscribeCovRequest {
    pub fn new(
        subscriber_process_identifier: u32,
        monitored_object_identifier: ObjectIdentifier,
        issue_confirmed_notifications: bool,
        lifetime_seconds: u32,
    ) -> Self {
        Self {
            subscriber_process_identifier,
            monitored_object_identifier,
            issue_confirmed_notifications: Some(issue_confirmed_notifications),
            lifetime_seconds: Some(lifetime_seconds),
        }
    }

    /// A cancellation leaves both optional parameters out
    pub fn cancellation(
        subscriber_process_identifier: u32,
        monitored_object_identifier: ObjectIdentifier,
    ) -> Self {
        Self {
            subscriber_process_identifier,
            monitored_object_identifier,
            issue_confirmed_notifications: None,
            lifetime_seconds: None,
        }
    }

    pub fn encode(&self, buffer: &mut Vec<u8>) -> Result<usize> {
        let mut len = encode_context_unsigned(buffer, 0, self.subscriber_process_identifier)?;
        len += crate::encoding::encode_context_object_id(
            buffer,
            1,
            &self.monitored_object_identifier,
        )?;
        if let Some(confirmed) = self.issue_confirmed_notifications {
            len += encode_context_unsigned(buffer, 2, u32::from(confirmed))?;
        }
        if let Some(lifetime) = self.lifetime_seconds {
            len += encode_context_unsigned(buffer, 3, lifetime)?;
        }
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_who_is_all_devices_is_empty() {
        let request = WhoIsRequest::new();
        let mut buffer = Vec::new();
        request.encode(&mut buffer).unwrap();
        assert!(buffer.is_empty());

        let decoded = WhoIsRequest::decode(&buffer).unwrap();
        assert!(decoded.matches(0));
        assert!(decoded.matches(4194302));
    }

    #[test]
    fn test_who_is_range_round_trip() {
        let request = WhoIsRequest::for_range(100, 200);
        let mut buffer = Vec::new();
        request.encode(&mut buffer).unwrap();

        let decoded = WhoIsRequest::decode(&buffer).unwrap();
        assert_eq!(decoded, request);
        assert!(!decoded.matches(99));
        assert!(decoded.matches(100));
        assert!(decoded.matches(200));
        assert!(!decoded.matches(201));
    }

    #[test]
    fn test_who_is_single_device() {
        // Seed scenario: Who-Is(123,123)
        let request = WhoIsRequest::for_device(123);
        let mut buffer = Vec::new();
        request.encode(&mut buffer).unwrap();
        // context 0 + 123, context 1 + 123
        assert_eq!(buffer, vec![0x09, 123, 0x19, 123]);
    }

    #[test]
    fn test_i_am_round_trip() {
        let request = IAmRequest::new(123, 480, 3, 260);
        let mut buffer = Vec::new();
        request.encode(&mut buffer).unwrap();

        let decoded = IAmRequest::decode(&buffer).unwrap();
        assert_eq!(decoded, request);
        assert_eq!(decoded.device_identifier.instance, 123);
        assert_eq!(decoded.max_apdu_length_accepted, 480);
    }

    #[test]
    fn test_error_pair_round_trip() {
        let mut buffer = Vec::new();
        encode_error(&mut buffer, 2, 32).unwrap();
        assert_eq!(decode_error(&buffer).unwrap(), (2, 32));
    }

    #[test]
    fn test_time_synchronization_round_trip() {
        let request = TimeSynchronizationRequest::new(
            Date::new(2024, 6, 1, 6),
            Time::new(12, 30, 15, 0),
        );
        let mut buffer = Vec::new();
        request.encode(&mut buffer).unwrap();
        assert_eq!(buffer.len(), 10);

        let decoded = TimeSynchronizationRequest::decode(&buffer).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_who_has_round_trip() {
        let by_id = WhoHasRequest::for_object(ObjectIdentifier::new(ObjectType::AnalogInput, 5));
        let mut buffer = Vec::new();
        by_id.encode(&mut buffer).unwrap();
        assert_eq!(WhoHasRequest::decode(&buffer).unwrap(), by_id);

        let mut by_name = WhoHasRequest::for_name("OAT Sensor");
        by_name.device_instance_low = Some(1);
        by_name.device_instance_high = Some(999);
        let mut buffer = Vec::new();
        by_name.encode(&mut buffer).unwrap();
        let decoded = WhoHasRequest::decode(&buffer).unwrap();
        assert_eq!(decoded, by_name);
        assert!(decoded.matches_device(500));
        assert!(!decoded.matches_device(1000));
    }

    #[test]
    fn test_i_have_round_trip() {
        let announce = IHaveRequest {
            device_identifier: ObjectIdentifier::new(ObjectType::Device, 77),
            object_identifier: ObjectIdentifier::new(ObjectType::AnalogInput, 5),
            object_name: b"OAT Sensor".to_vec(),
        };
        let mut buffer = Vec::new();
        announce.encode(&mut buffer).unwrap();
        assert_eq!(IHaveRequest::decode(&buffer).unwrap(), announce);
    }

    #[test]
    fn test_cov_notification_round_trip() {
        let mut values = Vec::new();
        encode_context_unsigned(&mut values, 0, property::PRESENT_VALUE).unwrap();
        let notification = CovNotification {
            subscriber_process_identifier: 18,
            initiating_device_identifier: ObjectIdentifier::new(ObjectType::Device, 4),
            monitored_object_identifier: ObjectIdentifier::new(ObjectType::AnalogInput, 10),
            time_remaining_seconds: 120,
            values,
        };
        let mut buffer = Vec::new();
        notification.encode(&mut buffer).unwrap();
        assert_eq!(CovNotification::decode(&buffer).unwrap(), notification);
    }

    #[test]
    fn test_cov_subscription_lifecycle() {
        let recipient = crate::network::BacnetAddress::local(vec![10, 0, 0, 9, 0xBA, 0xC0]);
        let object = ObjectIdentifier::new(ObjectType::AnalogInput, 0);
        let mut manager = CovSubscriptionManager::new(4);

        let request = SubscribeCovRequest::new(1, object, false, 60);
        assert!(manager.subscribe(&recipient, &request));
        assert_eq!(manager.active_count(), 1);
        assert_eq!(manager.subscriptions_for(&object).count(), 1);

        // refresh replaces rather than duplicates
        assert!(manager.subscribe(&recipient, &request));
        assert_eq!(manager.active_count(), 1);

        // finite subscriptions expire
        manager.timer_seconds(60);
        assert_eq!(manager.active_count(), 0);

        // an indefinite subscription survives
        let forever = SubscribeCovRequest::new(2, object, true, 0);
        assert!(manager.subscribe(&recipient, &forever));
        manager.timer_seconds(1_000_000);
        assert_eq!(manager.active_count(), 1);
        assert!(manager.cancel(&recipient, 2, &object));
        assert_eq!(manager.active_count(), 0);
    }

    #[test]
    fn test_cov_subscription_capacity() {
        let recipient = crate::network::BacnetAddress::local(vec![1]);
        let mut manager = CovSubscriptionManager::new(1);
        let a = SubscribeCovRequest::new(1, ObjectIdentifier::new(ObjectType::AnalogInput, 0), false, 60);
        let b = SubscribeCovRequest::new(2, ObjectIdentifier::new(ObjectType::AnalogInput, 1), false, 60);
        assert!(manager.subscribe(&recipient, &a));
        assert!(!manager.subscribe(&recipient, &b));
    }

    #[test]
    fn test_device_communication_control_round_trip() {
        let request =
            DeviceCommunicationControlRequest::new(CommunicationControl::Disable, Some(5))
                .with_password("secret");
        let mut buffer = Vec::new();
        request.encode(&mut buffer).unwrap();
        assert_eq!(
            DeviceCommunicationControlRequest::decode(&buffer).unwrap(),
            request
        );

        // indefinite enable with no password
        let bare = DeviceCommunicationControlRequest::new(CommunicationControl::Enable, None);
        let mut buffer = Vec::new();
        bare.encode(&mut buffer).unwrap();
        assert_eq!(
            DeviceCommunicationControlRequest::decode(&buffer).unwrap(),
            bare
        );
    }

    #[test]
    fn test_read_property_request_round_trip() {
        let request = ReadPropertyRequest::new(
            ObjectIdentifier::new(ObjectType::AnalogInput, 0),
            property::PRESENT_VALUE,
        );
        let mut buffer = Vec::new();
        request.encode(&mut buffer).unwrap();
        assert_eq!(ReadPropertyRequest::decode(&buffer).unwrap(), request);

        let indexed = request.with_array_index(4);
        let mut buffer = Vec::new();
        indexed.encode(&mut buffer).unwrap();
        assert_eq!(ReadPropertyRequest::decode(&buffer).unwrap(), indexed);
    }

    #[test]
    fn test_read_property_ack_round_trip() {
        let request = ReadPropertyRequest::new(
            ObjectIdentifier::new(ObjectType::AnalogInput, 0),
            property::PRESENT_VALUE,
        );
        let mut value = Vec::new();
        crate::encoding::encode_application_real(&mut value, 23.5).unwrap();
        let ack = ReadPropertyAck::new(&request, value.clone());

        let mut buffer = Vec::new();
        ack.encode(&mut buffer).unwrap();
        let decoded = ReadPropertyAck::decode(&buffer).unwrap();
        assert_eq!(decoded, ack);
        let (real, _) = crate::encoding::decode_application_real(&decoded.value).unwrap();
        assert_eq!(real, 23.5);
    }

    #[test]
    fn test_registry_slots() {
        let mut registry = ServiceRegistry::new();
        registry.register_confirmed(
            ConfirmedServiceChoice::ReadProperty,
            Box::new(|_, _, _, _| {}),
        );
        assert!(registry.confirmed[ConfirmedServiceChoice::ReadProperty as usize].is_some());
        assert!(registry.confirmed[ConfirmedServiceChoice::WriteProperty as usize].is_none());

        registry.register_unconfirmed(UnconfirmedServiceChoice::WhoIs, Box::new(|_, _, _| {}));
        assert!(registry.unconfirmed[UnconfirmedServiceChoice::WhoIs as usize].is_some());
    }
}
