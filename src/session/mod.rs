//! BACnet Session Module
//!
//! One [`Session`] is one BACnet node: its configuration, its transaction
//! table, its address cache, its router table and its datalink, owned
//! together so a single process can host several independent nodes. All
//! operations take the session explicitly; there is no global state.
//!
//! The session is driven by three inputs:
//!
//! - [`Session::receive`] pulls one PDU off the datalink and routes it;
//! - [`Session::tick`] advances every timer (TSM retries, address-cache
//!   TTLs, datalink maintenance);
//! - the client API in [`crate::client`] originates confirmed requests.
//!
//! # Example
//!
//! ```no_run
//! use bacnet_core::session::{Session, SessionConfig};
//! use bacnet_core::datalink::bip::BacnetIpDataLink;
//! use core::time::Duration;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let link = BacnetIpDataLink::new("0.0.0.0:47808")?;
//! let config = SessionConfig {
//!     device_id: 1234,
//!     ..Default::default()
//! };
//! let mut session = Session::new(config, Box::new(link));
//! loop {
//!     let _ = session.receive(Duration::from_millis(100));
//!     session.tick(100);
//! }
//! # }
//! ```

#[cfg(not(feature = "std"))]
use alloc::{boxed::Box, vec::Vec};

use core::time::Duration;

use crate::address::{AddressCache, Segmentation};
use crate::app::{Apdu, ApduFixedHeader};
use crate::datalink::DataLink;
use crate::network::router::{self, RouterTable};
use crate::network::{BacnetAddress, MessagePriority, Npdu};
use crate::service::{
    dispatch_apdu, CommunicationControl, ConfirmedServiceChoice, IAmRequest, ServiceRegistry,
    UnconfirmedServiceChoice, WhoIsRequest,
};
use crate::transaction::{ConfirmedRequestInfo, TransactionManager, TransactionError, TsmConfig};

/// Per-session configuration, covering every tunable of the core
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SessionConfig {
    /// Our device instance number
    pub device_id: u32,
    /// Our vendor identifier, announced in I-Am
    pub vendor_id: u16,
    /// Local network number, if known or assigned
    pub local_network: Option<u16>,
    /// Address cache capacity
    pub max_address_cache: usize,
    /// Transaction state machine tuning
    pub tsm: TsmConfig,
    /// Answer Who-Is with I-Am
    pub announce: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            device_id: 0,
            vendor_id: 260,
            local_network: None,
            max_address_cache: 128,
            tsm: TsmConfig::default(),
            announce: true,
        }
    }
}

/// The mutable state handlers operate on: everything in the session except
/// the handler registry itself.
pub struct SessionCore {
    pub config: SessionConfig,
    pub tsm: TransactionManager,
    pub addresses: AddressCache,
    pub router_table: RouterTable,
    pub local_network: Option<u16>,
    pub datalink: Box<dyn DataLink>,
    milliseconds_accumulated: u32,
    /// DeviceCommunicationControl state
    dcc_state: CommunicationControl,
    /// Seconds until communication re-enables; `None` when indefinite or
    /// already enabled
    dcc_remaining_seconds: Option<u32>,
}

impl SessionCore {
    /// Apply a DeviceCommunicationControl decision
    pub fn set_communication_control(
        &mut self,
        state: CommunicationControl,
        duration_minutes: Option<u16>,
    ) {
        self.dcc_state = state;
        self.dcc_remaining_seconds = match state {
            CommunicationControl::Enable => None,
            _ => duration_minutes.map(|minutes| minutes as u32 * 60),
        };
        log::debug!("session: communication control {:?}", state);
    }

    /// The current DeviceCommunicationControl state
    pub fn communication_state(&self) -> CommunicationControl {
        self.dcc_state
    }

    /// May we initiate messages right now?
    pub fn initiation_enabled(&self) -> bool {
        self.dcc_state == CommunicationControl::Enable
    }

    fn dcc_timer_seconds(&mut self, seconds: u32) {
        if let Some(remaining) = self.dcc_remaining_seconds {
            let remaining = remaining.saturating_sub(seconds);
            if remaining == 0 {
                self.dcc_state = CommunicationControl::Enable;
                self.dcc_remaining_seconds = None;
                log::debug!("session: communication re-enabled");
            } else {
                self.dcc_remaining_seconds = Some(remaining);
            }
        }
    }

    /// Answer a confirmed request with a SimpleACK
    pub fn send_simple_ack(&mut self, dest: &BacnetAddress, invoke_id: u8, service_choice: u8) {
        let npdu = Npdu::application(false, MessagePriority::Normal).route_to(dest);
        let mut pdu = npdu.encode();
        pdu.extend_from_slice(
            &Apdu::SimpleAck {
                invoke_id,
                service_choice,
            }
            .encode(),
        );
        let _ = self.datalink.send_pdu(dest, false, &pdu);
    }

    /// Answer a confirmed request with an Error PDU
    pub fn send_error(
        &mut self,
        dest: &BacnetAddress,
        invoke_id: u8,
        service_choice: u8,
        error_class: u32,
        error_code: u32,
    ) {
        let mut body = Vec::new();
        if crate::service::encode_error(&mut body, error_class, error_code).is_err() {
            return;
        }
        let npdu = Npdu::application(false, MessagePriority::Normal).route_to(dest);
        let mut pdu = npdu.encode();
        pdu.extend_from_slice(
            &Apdu::Error {
                invoke_id,
                service_choice,
                service_data: body,
            }
            .encode(),
        );
        let _ = self.datalink.send_pdu(dest, false, &pdu);
    }

    /// Answer a confirmed request with a ComplexACK, segmenting as the
    /// request's parameters allow
    pub fn send_complex_ack(
        &mut self,
        dest: &BacnetAddress,
        reply_to: &ConfirmedRequestInfo,
        body: &[u8],
    ) -> core::result::Result<(), TransactionError> {
        let header = ApduFixedHeader::complex_ack(reply_to.invoke_id, reply_to.service_choice);
        let npdu = Npdu::application(false, MessagePriority::Normal).route_to(dest);
        self.tsm.set_complexack_transaction(
            self.datalink.as_mut(),
            dest,
            npdu,
            header,
            reply_to,
            body,
        )
    }

    /// Broadcast an I-Am for this device
    pub fn send_i_am(&mut self) {
        let i_am = IAmRequest::new(
            self.config.device_id,
            self.datalink.max_apdu() as u32,
            Segmentation::Both as u32,
            self.config.vendor_id as u32,
        );
        let mut body = Vec::new();
        if i_am.encode(&mut body).is_err() {
            return;
        }
        self.send_unconfirmed(UnconfirmedServiceChoice::IAm, &body, None);
    }

    /// Send an unconfirmed request; `dest` of `None` means local broadcast
    pub fn send_unconfirmed(
        &mut self,
        choice: UnconfirmedServiceChoice,
        body: &[u8],
        dest: Option<&BacnetAddress>,
    ) {
        if !self.initiation_enabled() {
            log::trace!("session: initiation disabled, dropping unconfirmed send");
            return;
        }
        let broadcast = self.datalink.broadcast_address();
        let dest = dest.unwrap_or(&broadcast);
        let npdu = Npdu::application(false, Default::default()).route_to(dest);
        let mut pdu = npdu.encode();
        pdu.extend_from_slice(
            &crate::app::Apdu::UnconfirmedRequest {
                service_choice: choice as u8,
                service_data: body.to_vec(),
            }
            .encode(),
        );
        let _ = self.datalink.send_pdu(dest, false, &pdu);
    }
}

/// One BACnet node
pub struct Session {
    pub core: SessionCore,
    registry: ServiceRegistry,
}

impl Session {
    /// Build a session over a datalink. The default registry answers
    /// Who-Is with I-Am (when `announce` is set) and binds the address
    /// cache from received I-Ams.
    pub fn new(config: SessionConfig, datalink: Box<dyn DataLink>) -> Self {
        let mut addresses = AddressCache::new(config.max_address_cache);
        if config.device_id != 0 {
            addresses.set_own_device_id(config.device_id);
        }
        let local_network = config.local_network;
        let tsm = TransactionManager::new(config.tsm.clone());

        let mut registry = ServiceRegistry::new();

        // received I-Ams feed the address cache
        registry.register_unconfirmed(
            UnconfirmedServiceChoice::IAm,
            Box::new(|core: &mut SessionCore, body: &[u8], src: &BacnetAddress| {
                if let Ok(i_am) = IAmRequest::decode(body) {
                    let segmentation = Segmentation::from_u8(i_am.segmentation_supported as u8)
                        .unwrap_or(Segmentation::None);
                    log::debug!(
                        "session: I-Am device {} (max-APDU {})",
                        i_am.device_identifier.instance,
                        i_am.max_apdu_length_accepted
                    );
                    core.addresses.observe_i_am(
                        i_am.device_identifier.instance,
                        i_am.max_apdu_length_accepted as usize,
                        segmentation,
                        src,
                    );
                }
            }),
        );

        // Who-Is in our range draws an I-Am
        registry.register_unconfirmed(
            UnconfirmedServiceChoice::WhoIs,
            Box::new(|core: &mut SessionCore, body: &[u8], _src: &BacnetAddress| {
                if !core.config.announce || core.config.device_id == 0 {
                    return;
                }
                if let Ok(who_is) = WhoIsRequest::decode(body) {
                    if who_is.matches(core.config.device_id) {
                        core.send_i_am();
                    }
                }
            }),
        );

        Self {
            core: SessionCore {
                config,
                tsm,
                addresses,
                router_table: RouterTable::new(),
                local_network,
                datalink,
                milliseconds_accumulated: 0,
                dcc_state: CommunicationControl::Enable,
                dcc_remaining_seconds: None,
            },
            registry,
        }
    }

    /// The handler registry, for wiring up application services
    pub fn registry_mut(&mut self) -> &mut ServiceRegistry {
        &mut self.registry
    }

    /// Receive and route one PDU. Returns true if something was handled.
    pub fn receive(&mut self, timeout: Duration) -> bool {
        match self.core.datalink.receive(timeout) {
            Ok((src, pdu)) => {
                self.handle_pdu(&src, &pdu);
                true
            }
            Err(_) => false,
        }
    }

    /// Route one NPDU received from the datalink
    pub fn handle_pdu(&mut self, src: &BacnetAddress, pdu: &[u8]) {
        let (npdu, apdu_offset) = match Npdu::decode(pdu) {
            Ok(decoded) => decoded,
            Err(error) => {
                log::debug!("session: dropping PDU: {}", error);
                return;
            }
        };
        let body = &pdu[apdu_offset..];

        // combine the datalink source with any routed source block
        let source = match &npdu.source {
            Some(routed) => BacnetAddress {
                network: routed.network,
                mac: src.mac.clone(),
                remote: routed.remote.clone(),
            },
            None => src.clone(),
        };

        if npdu.network_message {
            router::handle_network_message(
                &mut self.core.router_table,
                self.core.datalink.as_mut(),
                &mut self.core.local_network,
                &source,
                &npdu,
                body,
            );
            return;
        }

        // not a router: only local and global traffic reaches the APDU layer
        if let Some(dest) = &npdu.destination {
            if !dest.is_global_broadcast()
                && dest.network != 0
                && Some(dest.network) != self.core.local_network
            {
                log::trace!(
                    "session: dropping PDU for network {} (not a router)",
                    dest.network
                );
                return;
            }
        }

        // with communication disabled, only DeviceCommunicationControl and
        // ReinitializeDevice may still reach the application
        if self.core.dcc_state == CommunicationControl::Disable && !dcc_exempt(body) {
            log::trace!("session: communication disabled, dropping APDU");
            return;
        }

        dispatch_apdu(&mut self.registry, &mut self.core, &source, body);
    }

    /// Advance every timer in the session by `milliseconds`
    pub fn tick(&mut self, milliseconds: u32) {
        self.core
            .tsm
            .timer_milliseconds(self.core.datalink.as_mut(), milliseconds);
        self.core.datalink.tick(milliseconds);

        self.core.milliseconds_accumulated += milliseconds;
        let seconds = self.core.milliseconds_accumulated / 1000;
        if seconds > 0 {
            self.core.milliseconds_accumulated %= 1000;
            self.core.addresses.timer_seconds(seconds);
            self.core.dcc_timer_seconds(seconds);
        }
    }
}

/// True for the confirmed requests that bypass a communication disable:
/// DeviceCommunicationControl itself and ReinitializeDevice.
fn dcc_exempt(apdu: &[u8]) -> bool {
    if apdu.is_empty() || apdu[0] >> 4 != 0 {
        return false;
    }
    let segmented = apdu[0] & 0x08 != 0;
    let choice_at = if segmented { 5 } else { 3 };
    match apdu.get(choice_at) {
        Some(&choice) => {
            choice == ConfirmedServiceChoice::DeviceCommunicationControl as u8
                || choice == ConfirmedServiceChoice::ReinitializeDevice as u8
        }
        None => false,
    }
}
