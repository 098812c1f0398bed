//! BACnet Client API
//!
//! Thin wrappers for originating confirmed services. The generic entry
//! point is [`Session::send_confirmed_request`]; `read_property`,
//! `write_property` and `subscribe_cov` encode their bodies and delegate
//! to it.
//!
//! A request to a device that is not yet bound reserves an address-cache
//! slot, broadcasts a Who-Is for the device, and returns
//! [`ClientError::BindPending`]; the caller retries after the I-Am has
//! been processed. Completion is observed through the invoke-id
//! predicates: [`Session::invoke_id_free`] once the reply arrived and was
//! dispatched, [`Session::invoke_id_failed`] when every retry timed out.
//!
//! # Example
//!
//! ```no_run
//! use bacnet_core::client::ClientError;
//! use bacnet_core::encoding::{ObjectIdentifier, ObjectType};
//! use bacnet_core::service::property;
//! # use bacnet_core::session::{Session, SessionConfig};
//! # fn example(session: &mut Session) {
//! let object = ObjectIdentifier::new(ObjectType::AnalogInput, 0);
//! match session.read_property(123, object, property::PRESENT_VALUE) {
//!     Ok(invoke_id) => println!("request sent, invoke id {}", invoke_id),
//!     Err(ClientError::BindPending(_)) => println!("Who-Is sent, retry shortly"),
//!     Err(e) => println!("failed: {}", e),
//! }
//! # }
//! ```

#[cfg(feature = "std")]
use std::error::Error;

#[cfg(feature = "std")]
use std::fmt;

#[cfg(not(feature = "std"))]
use core::fmt;

#[cfg(not(feature = "std"))]
use alloc::vec::Vec;

use crate::app::{ApduFixedHeader, MaxApduSize, MaxSegments};
use crate::encoding::ObjectIdentifier;
use crate::network::{BacnetAddress, MessagePriority, Npdu};
use crate::service::{
    ConfirmedServiceChoice, DeviceCommunicationControlRequest, ReadPropertyRequest, ServiceError,
    SubscribeCovRequest, TimeSynchronizationRequest, UnconfirmedServiceChoice, WhoIsRequest,
    WritePropertyRequest,
};
use crate::session::Session;
use crate::transaction::TransactionError;

/// Result type for client operations
#[cfg(feature = "std")]
pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(not(feature = "std"))]
pub type Result<T> = core::result::Result<T, ClientError>;

/// Errors surfaced by the client API
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// The device is not bound yet; a Who-Is went out and the request
    /// should be retried once the I-Am has arrived
    BindPending(u32),
    /// Communication is disabled by DeviceCommunicationControl
    CommunicationDisabled,
    /// The transaction layer refused the request
    Transaction(TransactionError),
    /// The service body failed to encode
    Service(ServiceError),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::BindPending(device) => {
                write!(f, "Device {} not bound yet, Who-Is sent", device)
            }
            ClientError::CommunicationDisabled => {
                write!(f, "Communication disabled by device communication control")
            }
            ClientError::Transaction(e) => write!(f, "Transaction error: {}", e),
            ClientError::Service(e) => write!(f, "Service error: {}", e),
        }
    }
}

#[cfg(feature = "std")]
impl Error for ClientError {}

impl From<TransactionError> for ClientError {
    fn from(error: TransactionError) -> Self {
        ClientError::Transaction(error)
    }
}

impl From<ServiceError> for ClientError {
    fn from(error: ServiceError) -> Self {
        ClientError::Service(error)
    }
}

impl Session {
    /// Broadcast a Who-Is
    pub fn who_is(&mut self, request: &WhoIsRequest) -> Result<()> {
        let mut body = Vec::new();
        request.encode(&mut body)?;
        self.core
            .send_unconfirmed(UnconfirmedServiceChoice::WhoIs, &body, None);
        Ok(())
    }

    /// Broadcast a Time-Synchronization (local or UTC form)
    #[cfg(feature = "std")]
    pub fn send_time_synchronization(&mut self, utc: bool) -> Result<()> {
        let request = if utc {
            TimeSynchronizationRequest::from_utc_clock()
        } else {
            TimeSynchronizationRequest::from_local_clock()
        };
        let mut body = Vec::new();
        request.encode(&mut body)?;
        let choice = if utc {
            UnconfirmedServiceChoice::UtcTimeSynchronization
        } else {
            UnconfirmedServiceChoice::TimeSynchronization
        };
        self.core.send_unconfirmed(choice, &body, None);
        Ok(())
    }

    /// Originate a confirmed request to a bound address.
    ///
    /// `invoker` is called with the fresh invoke id before the request can
    /// possibly be answered, letting the caller attach its own context to
    /// the id without racing the reply.
    pub fn send_confirmed_request(
        &mut self,
        destination: &BacnetAddress,
        service: ConfirmedServiceChoice,
        body: &[u8],
        invoker: Option<&mut dyn FnMut(u8)>,
    ) -> Result<u8> {
        if !self.core.initiation_enabled() {
            return Err(ClientError::CommunicationDisabled);
        }
        let invoke_id = self.core.tsm.next_free_invoke_id()?;
        if let Some(invoker) = invoker {
            invoker(invoke_id);
        }

        let header = ApduFixedHeader::confirmed_request(
            invoke_id,
            service as u8,
            MaxSegments::for_count(self.core.config.tsm.max_segments_accepted),
            MaxApduSize::for_size(self.core.config.tsm.max_apdu),
            true,
        );
        let npdu = Npdu::application(true, MessagePriority::Normal).route_to(destination);

        self.core.tsm.set_confirmed_transaction(
            self.core.datalink.as_mut(),
            Some(&self.core.addresses),
            invoke_id,
            destination,
            npdu,
            header,
            body,
        )?;
        Ok(invoke_id)
    }

    /// Resolve a device binding or start one: on a miss a Who-Is leaves,
    /// the cache holds a bind-request slot, and the caller sees
    /// [`ClientError::BindPending`].
    fn bind_or_who_is(&mut self, device_id: u32) -> Result<BacnetAddress> {
        match self.core.addresses.bind_request(device_id) {
            Some((address, _max_apdu)) => Ok(address),
            None => {
                self.who_is(&WhoIsRequest::for_device(device_id))?;
                Err(ClientError::BindPending(device_id))
            }
        }
    }

    /// ReadProperty from a device
    pub fn read_property(
        &mut self,
        device_id: u32,
        object: ObjectIdentifier,
        property_identifier: u32,
    ) -> Result<u8> {
        let address = self.bind_or_who_is(device_id)?;
        let mut body = Vec::new();
        ReadPropertyRequest::new(object, property_identifier).encode(&mut body)?;
        self.send_confirmed_request(&address, ConfirmedServiceChoice::ReadProperty, &body, None)
    }

    /// WriteProperty to a device
    pub fn write_property(&mut self, device_id: u32, request: &WritePropertyRequest) -> Result<u8> {
        let address = self.bind_or_who_is(device_id)?;
        let mut body = Vec::new();
        request.encode(&mut body)?;
        self.send_confirmed_request(&address, ConfirmedServiceChoice::WriteProperty, &body, None)
    }

    /// SubscribeCOV on a device. `invoker` receives the invoke id before
    /// any notification can race the subscription bookkeeping.
    pub fn subscribe_cov(
        &mut self,
        device_id: u32,
        request: &SubscribeCovRequest,
        invoker: Option<&mut dyn FnMut(u8)>,
    ) -> Result<u8> {
        let address = self.bind_or_who_is(device_id)?;
        let mut body = Vec::new();
        request.encode(&mut body)?;
        self.send_confirmed_request(&address, ConfirmedServiceChoice::SubscribeCov, &body, invoker)
    }

    /// Ask a device to disable or re-enable its communications
    pub fn device_communication_control(
        &mut self,
        device_id: u32,
        request: &DeviceCommunicationControlRequest,
    ) -> Result<u8> {
        let address = self.bind_or_who_is(device_id)?;
        let mut body = Vec::new();
        request.encode(&mut body)?;
        self.send_confirmed_request(
            &address,
            ConfirmedServiceChoice::DeviceCommunicationControl,
            &body,
            None,
        )
    }

    /// Has this invoke id been released (reply processed)?
    pub fn invoke_id_free(&self, invoke_id: u8) -> bool {
        self.core.tsm.invoke_id_free(invoke_id)
    }

    /// Did this request fail to confirm?
    pub fn invoke_id_failed(&self, invoke_id: u8) -> bool {
        self.core.tsm.invoke_id_failed(invoke_id)
    }

    /// Explicitly release an invoke id
    pub fn free_invoke_id(&mut self, invoke_id: u8, peer: Option<&BacnetAddress>) {
        self.core.tsm.free_invoke_id(invoke_id, peer, true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Segmentation;
    use crate::app::Apdu;
    use crate::datalink::{DataLink, DataLinkError, DataLinkType};
    use crate::encoding::{decode_application_real, encode_application_real, ObjectType};
    use crate::service::{IAmRequest, ReadPropertyAck};
    use crate::session::SessionConfig;
    use core::time::Duration;
    use std::cell::RefCell;
    use std::rc::Rc;

    type SentLog = Rc<RefCell<Vec<(BacnetAddress, bool, Vec<u8>)>>>;

    struct TestLink {
        sent: SentLog,
    }

    impl DataLink for TestLink {
        fn send_pdu(
            &mut self,
            dest: &BacnetAddress,
            expecting_reply: bool,
            pdu: &[u8],
        ) -> crate::datalink::Result<usize> {
            self.sent
                .borrow_mut()
                .push((dest.clone(), expecting_reply, pdu.to_vec()));
            Ok(pdu.len())
        }

        fn receive(
            &mut self,
            _timeout: Duration,
        ) -> crate::datalink::Result<(BacnetAddress, Vec<u8>)> {
            Err(DataLinkError::Timeout)
        }

        fn broadcast_address(&self) -> BacnetAddress {
            BacnetAddress::local(vec![0xFF])
        }

        fn my_address(&self) -> BacnetAddress {
            BacnetAddress::local(vec![10, 0, 0, 2, 0xBA, 0xC0])
        }

        fn max_apdu(&self) -> usize {
            1476
        }

        fn link_type(&self) -> DataLinkType {
            DataLinkType::BacnetIp
        }
    }

    fn test_session() -> (Session, SentLog) {
        let sent: SentLog = Rc::new(RefCell::new(Vec::new()));
        let link = TestLink { sent: sent.clone() };
        let config = SessionConfig {
            device_id: 999,
            ..Default::default()
        };
        (Session::new(config, Box::new(link)), sent)
    }

    fn apdus_in(log: &SentLog) -> Vec<Apdu> {
        log.borrow()
            .iter()
            .map(|(_, _, pdu)| {
                let (_, offset) = Npdu::decode(pdu).unwrap();
                Apdu::decode(&pdu[offset..]).unwrap()
            })
            .collect()
    }

    fn peer(last: u8) -> BacnetAddress {
        BacnetAddress::local(vec![10, 0, 0, last, 0xBA, 0xC0])
    }

    #[test]
    fn test_bind_and_read_property_end_to_end() {
        // Seed scenario 1: empty cache, read-property from device 123.
        let (mut session, log) = test_session();
        let object = ObjectIdentifier::new(ObjectType::AnalogInput, 0);

        // first call misses the cache: Who-Is(123,123) goes out
        let result =
            session.read_property(123, object, crate::service::property::PRESENT_VALUE);
        assert_eq!(result, Err(ClientError::BindPending(123)));
        let apdus = apdus_in(&log);
        assert_eq!(apdus.len(), 1);
        match &apdus[0] {
            Apdu::UnconfirmedRequest {
                service_choice,
                service_data,
            } => {
                assert_eq!(*service_choice, UnconfirmedServiceChoice::WhoIs as u8);
                let who_is = WhoIsRequest::decode(service_data).unwrap();
                assert_eq!(who_is.device_instance_low, Some(123));
                assert_eq!(who_is.device_instance_high, Some(123));
            }
            other => panic!("expected Who-Is, got {:?}", other),
        }
        log.borrow_mut().clear();

        // the I-Am arrives from 10.0.0.1:47808 and completes the binding
        let mut body = Vec::new();
        IAmRequest::new(123, 480, Segmentation::None as u32, 260)
            .encode(&mut body)
            .unwrap();
        let mut pdu = Npdu::application(false, MessagePriority::Normal).encode();
        pdu.extend_from_slice(
            &Apdu::UnconfirmedRequest {
                service_choice: UnconfirmedServiceChoice::IAm as u8,
                service_data: body,
            }
            .encode(),
        );
        session.handle_pdu(&peer(1), &pdu);

        // the retry goes out as a confirmed ReadProperty, invoke id 1
        let received = Rc::new(RefCell::new(None));
        let received_in_handler = received.clone();
        session.registry_mut().register_confirmed_ack(
            ConfirmedServiceChoice::ReadProperty,
            Box::new(move |_core, _invoke_id, body, _src| {
                let ack = ReadPropertyAck::decode(body).unwrap();
                let (value, _) = decode_application_real(&ack.value).unwrap();
                *received_in_handler.borrow_mut() = Some(value);
            }),
        );

        let invoke_id = session
            .read_property(123, object, crate::service::property::PRESENT_VALUE)
            .unwrap();
        assert_eq!(invoke_id, 1);
        let apdus = apdus_in(&log);
        assert_eq!(apdus.len(), 1);
        match &apdus[0] {
            Apdu::ConfirmedRequest {
                invoke_id,
                service_choice,
                service_data,
                ..
            } => {
                assert_eq!(*invoke_id, 1);
                assert_eq!(*service_choice, ConfirmedServiceChoice::ReadProperty as u8);
                let request = ReadPropertyRequest::decode(service_data).unwrap();
                assert_eq!(request.object_identifier, object);
            }
            other => panic!("expected ReadProperty request, got {:?}", other),
        }
        assert!(!session.invoke_id_free(invoke_id));

        // the complex ack comes back carrying REAL 23.5
        let mut value = Vec::new();
        encode_application_real(&mut value, 23.5).unwrap();
        let request = ReadPropertyRequest::new(object, crate::service::property::PRESENT_VALUE);
        let mut ack_body = Vec::new();
        ReadPropertyAck::new(&request, value)
            .encode(&mut ack_body)
            .unwrap();
        let mut pdu = Npdu::application(false, MessagePriority::Normal).encode();
        pdu.extend_from_slice(
            &Apdu::ComplexAck {
                segmented: false,
                more_follows: false,
                invoke_id,
                sequence_number: None,
                proposed_window_size: None,
                service_choice: ConfirmedServiceChoice::ReadProperty as u8,
                service_data: ack_body,
            }
            .encode(),
        );
        session.handle_pdu(&peer(1), &pdu);

        assert_eq!(*received.borrow(), Some(23.5));
        assert!(session.invoke_id_free(invoke_id));
    }

    #[test]
    fn test_invoker_sees_invoke_id_before_send() {
        let (mut session, log) = test_session();
        session.core.addresses.add_binding(
            55,
            1476,
            Segmentation::None,
            0,
            &peer(5),
        );

        let observed = Rc::new(RefCell::new(None));
        let observed_in_invoker = observed.clone();
        let request = SubscribeCovRequest::new(
            1,
            ObjectIdentifier::new(ObjectType::AnalogInput, 0),
            false,
            300,
        );
        let mut invoker = |invoke_id: u8| {
            // the invoke id is visible before anything was transmitted
            assert!(log.borrow().is_empty());
            *observed_in_invoker.borrow_mut() = Some(invoke_id);
        };
        let invoke_id = session
            .subscribe_cov(55, &request, Some(&mut invoker))
            .unwrap();
        assert_eq!(*observed.borrow(), Some(invoke_id));
        assert_eq!(apdus_in(&log).len(), 1);
    }

    #[test]
    fn test_write_property_round_trip_on_wire() {
        let (mut session, log) = test_session();
        session.core.addresses.add_binding(
            77,
            1476,
            Segmentation::None,
            0,
            &peer(7),
        );

        let mut value = Vec::new();
        encode_application_real(&mut value, 72.5).unwrap();
        let request = WritePropertyRequest::new(
            ObjectIdentifier::new(ObjectType::AnalogValue, 3),
            crate::service::property::PRESENT_VALUE,
            value,
        )
        .with_priority(8);
        let invoke_id = session.write_property(77, &request).unwrap();

        let apdus = apdus_in(&log);
        match &apdus[0] {
            Apdu::ConfirmedRequest {
                service_choice,
                invoke_id: wire_invoke,
                ..
            } => {
                assert_eq!(*service_choice, ConfirmedServiceChoice::WriteProperty as u8);
                assert_eq!(*wire_invoke, invoke_id);
            }
            other => panic!("expected WriteProperty request, got {:?}", other),
        }

        // the simple ack releases the invoke id
        let mut pdu = Npdu::application(false, MessagePriority::Normal).encode();
        pdu.extend_from_slice(
            &Apdu::SimpleAck {
                invoke_id,
                service_choice: ConfirmedServiceChoice::WriteProperty as u8,
            }
            .encode(),
        );
        session.handle_pdu(&peer(7), &pdu);
        assert!(session.invoke_id_free(invoke_id));
    }
}
