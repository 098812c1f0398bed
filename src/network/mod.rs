//! BACnet Network Layer Module
//!
//! This module implements the NPDU header codec and the network-layer types
//! shared by every datalink: the BACnet address record, message priority,
//! and the network-layer message numbers. Routing itself (Who-Is-Router,
//! I-Am-Router, the DNET table) lives in [`router`].
//!
//! # Network Layer Protocol Data Unit (NPDU)
//!
//! The NPDU header carries:
//! - Protocol version (always 1)
//! - A control octet: network-message flag, destination/source specifier
//!   presence, data-expecting-reply, 2-bit priority
//! - Optional DNET/DLEN/DADR destination block
//! - Optional SNET/SLEN/SADR source block
//! - Hop count (present whenever a destination block is present)
//! - Message type octet (present for network-layer messages)
//!
//! # Example
//!
//! ```
//! use bacnet_core::network::{Npdu, MessagePriority};
//!
//! let npdu = Npdu::application(true, MessagePriority::Normal);
//! let encoded = npdu.encode();
//! let (decoded, apdu_offset) = Npdu::decode(&encoded).unwrap();
//! assert_eq!(apdu_offset, encoded.len());
//! assert!(decoded.expecting_reply);
//! ```

pub mod router;

#[cfg(feature = "std")]
use std::error::Error;

#[cfg(feature = "std")]
use std::fmt;

#[cfg(not(feature = "std"))]
use core::fmt;

#[cfg(not(feature = "std"))]
use alloc::{string::String, vec::Vec};

/// Result type for network operations
#[cfg(feature = "std")]
pub type Result<T> = std::result::Result<T, NetworkError>;

#[cfg(not(feature = "std"))]
pub type Result<T> = core::result::Result<T, NetworkError>;

/// Errors that can occur in network operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// Truncated or structurally invalid NPDU
    Malformed(String),
    /// Protocol version other than 1
    UnsupportedVersion(u8),
    /// Routing error
    RoutingError(String),
    /// Destination network is unreachable
    NetworkUnreachable(u16),
    /// Invalid network address
    InvalidAddress,
}

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkError::Malformed(msg) => write!(f, "Malformed NPDU: {}", msg),
            NetworkError::UnsupportedVersion(v) => write!(f, "Unsupported NPDU version: {}", v),
            NetworkError::RoutingError(msg) => write!(f, "Routing error: {}", msg),
            NetworkError::NetworkUnreachable(net) => write!(f, "Network {} unreachable", net),
            NetworkError::InvalidAddress => write!(f, "Invalid network address"),
        }
    }
}

#[cfg(feature = "std")]
impl Error for NetworkError {}

/// Network number meaning "the directly attached network".
pub const LOCAL_NETWORK: u16 = 0;

/// Network number meaning "all networks" (global broadcast).
pub const BROADCAST_NETWORK: u16 = 0xFFFF;

/// Longest MAC a BACnet datalink can carry (Ethernet/B-IP use 6, plus port).
pub const MAX_MAC_LEN: usize = 7;

/// A BACnet address: a network number, the MAC on the directly attached
/// link, and the remote station address when the destination lies behind a
/// router. This is the uniform destination record carried at the NPDU
/// boundary.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BacnetAddress {
    /// Network number: 0 = local, 0xFFFF = global broadcast
    pub network: u16,
    /// MAC address on the directly attached link (1-7 octets; empty for
    /// a local broadcast)
    pub mac: Vec<u8>,
    /// Remote station address (SADR/DADR) when routed; empty otherwise
    pub remote: Vec<u8>,
}

impl BacnetAddress {
    /// An address on the local network
    pub fn local(mac: Vec<u8>) -> Self {
        Self {
            network: LOCAL_NETWORK,
            mac,
            remote: Vec::new(),
        }
    }

    /// A station behind a router: the MAC is filled in by the routing layer
    pub fn remote_station(network: u16, remote: Vec<u8>) -> Self {
        Self {
            network,
            mac: Vec::new(),
            remote,
        }
    }

    /// The global broadcast address
    pub fn global_broadcast() -> Self {
        Self {
            network: BROADCAST_NETWORK,
            mac: Vec::new(),
            remote: Vec::new(),
        }
    }

    /// Local broadcast on the attached link
    pub fn local_broadcast() -> Self {
        Self::default()
    }

    pub fn is_global_broadcast(&self) -> bool {
        self.network == BROADCAST_NETWORK
    }

    pub fn is_local(&self) -> bool {
        self.network == LOCAL_NETWORK
    }

    /// Full match on network, MAC and remote address
    pub fn matches(&self, other: &BacnetAddress) -> bool {
        self.network == other.network && self.mac == other.mac && self.remote == other.remote
    }
}

/// Network priority carried in the low two bits of the control octet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum MessagePriority {
    #[default]
    Normal = 0,
    Urgent = 1,
    CriticalEquipment = 2,
    LifeSafety = 3,
}

impl MessagePriority {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            1 => Self::Urgent,
            2 => Self::CriticalEquipment,
            3 => Self::LifeSafety,
            _ => Self::Normal,
        }
    }
}

/// Network layer message types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NetworkMessageType {
    WhoIsRouterToNetwork = 0x00,
    IAmRouterToNetwork = 0x01,
    ICouldBeRouterToNetwork = 0x02,
    RejectMessageToNetwork = 0x03,
    RouterBusyToNetwork = 0x04,
    RouterAvailableToNetwork = 0x05,
    InitializeRoutingTable = 0x06,
    InitializeRoutingTableAck = 0x07,
    EstablishConnectionToNetwork = 0x08,
    DisconnectConnectionToNetwork = 0x09,
    WhatIsNetworkNumber = 0x12,
    NetworkNumberIs = 0x13,
}

impl NetworkMessageType {
    /// Convert from the raw message type octet
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::WhoIsRouterToNetwork),
            0x01 => Some(Self::IAmRouterToNetwork),
            0x02 => Some(Self::ICouldBeRouterToNetwork),
            0x03 => Some(Self::RejectMessageToNetwork),
            0x04 => Some(Self::RouterBusyToNetwork),
            0x05 => Some(Self::RouterAvailableToNetwork),
            0x06 => Some(Self::InitializeRoutingTable),
            0x07 => Some(Self::InitializeRoutingTableAck),
            0x08 => Some(Self::EstablishConnectionToNetwork),
            0x09 => Some(Self::DisconnectConnectionToNetwork),
            0x12 => Some(Self::WhatIsNetworkNumber),
            0x13 => Some(Self::NetworkNumberIs),
            _ => None,
        }
    }
}

/// Default hop count written into routed NPDUs
pub const DEFAULT_HOP_COUNT: u8 = 255;

/// Decoded NPDU metadata. Doubles as the template the transaction layer
/// keeps for retransmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Npdu {
    /// Protocol version (always 1)
    pub version: u8,
    /// Network priority
    pub priority: MessagePriority,
    /// Data-expecting-reply bit
    pub expecting_reply: bool,
    /// Network-layer-message flag
    pub network_message: bool,
    /// Message type octet, present for network-layer messages
    pub message_type: Option<u8>,
    /// Destination block (DNET/DADR); the MAC field is not carried here
    pub destination: Option<BacnetAddress>,
    /// Source block (SNET/SADR)
    pub source: Option<BacnetAddress>,
    /// Hop count, present whenever a destination block is present
    pub hop_count: Option<u8>,
}

impl Default for Npdu {
    fn default() -> Self {
        Self {
            version: crate::BACNET_PROTOCOL_VERSION,
            priority: MessagePriority::Normal,
            expecting_reply: false,
            network_message: false,
            message_type: None,
            destination: None,
            source: None,
            hop_count: None,
        }
    }
}

impl Npdu {
    /// Metadata for an application PDU
    pub fn application(expecting_reply: bool, priority: MessagePriority) -> Self {
        Self {
            expecting_reply,
            priority,
            ..Default::default()
        }
    }

    /// Metadata for a network-layer message
    pub fn network(message_type: NetworkMessageType, expecting_reply: bool) -> Self {
        Self {
            expecting_reply,
            network_message: true,
            message_type: Some(message_type as u8),
            ..Default::default()
        }
    }

    /// Metadata for a globally broadcast application PDU
    pub fn global_broadcast() -> Self {
        Self {
            destination: Some(BacnetAddress::global_broadcast()),
            hop_count: Some(DEFAULT_HOP_COUNT),
            ..Default::default()
        }
    }

    /// Attach a destination block when the target is remote or a broadcast.
    ///
    /// A local unicast (network 0) carries no destination block; everything
    /// else gets DNET/DADR plus the default hop count.
    pub fn route_to(mut self, dest: &BacnetAddress) -> Self {
        if dest.network != LOCAL_NETWORK {
            self.destination = Some(BacnetAddress::remote_station(
                dest.network,
                dest.remote.clone(),
            ));
            self.hop_count = Some(DEFAULT_HOP_COUNT);
        }
        self
    }

    pub fn is_network_message(&self) -> bool {
        self.network_message
    }

    /// Encode the NPDU header
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::new();

        buffer.push(self.version);

        let mut control = self.priority as u8;
        if self.network_message {
            control |= 0x80;
        }
        if self.destination.is_some() {
            control |= 0x20;
        }
        if self.source.is_some() {
            control |= 0x08;
        }
        if self.expecting_reply {
            control |= 0x04;
        }
        buffer.push(control);

        if let Some(ref dest) = self.destination {
            buffer.extend_from_slice(&dest.network.to_be_bytes());
            buffer.push(dest.remote.len() as u8);
            buffer.extend_from_slice(&dest.remote);
        }

        if let Some(ref src) = self.source {
            buffer.extend_from_slice(&src.network.to_be_bytes());
            buffer.push(src.remote.len() as u8);
            buffer.extend_from_slice(&src.remote);
        }

        if self.destination.is_some() {
            buffer.push(self.hop_count.unwrap_or(DEFAULT_HOP_COUNT));
        }

        if self.network_message {
            buffer.push(self.message_type.unwrap_or(0));
        }

        buffer
    }

    /// Decode an NPDU header.
    ///
    /// Returns the metadata and the offset of the APDU (or network-message
    /// body) relative to the start of the NPDU.
    pub fn decode(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < 2 {
            return Err(NetworkError::Malformed("NPDU shorter than two octets".into()));
        }

        let version = data[0];
        if version != crate::BACNET_PROTOCOL_VERSION {
            return Err(NetworkError::UnsupportedVersion(version));
        }

        let control = data[1];
        let network_message = control & 0x80 != 0;
        let destination_present = control & 0x20 != 0;
        let source_present = control & 0x08 != 0;
        let expecting_reply = control & 0x04 != 0;
        let priority = MessagePriority::from_bits(control);

        let mut pos = 2;

        let destination = if destination_present {
            let (addr, used) = Self::decode_address_block(&data[pos..])?;
            pos += used;
            Some(addr)
        } else {
            None
        };

        let source = if source_present {
            let (addr, used) = Self::decode_address_block(&data[pos..])?;
            pos += used;
            Some(addr)
        } else {
            None
        };

        let hop_count = if destination_present {
            if pos >= data.len() {
                return Err(NetworkError::Malformed("hop count missing".into()));
            }
            let hops = data[pos];
            pos += 1;
            Some(hops)
        } else {
            None
        };

        let message_type = if network_message {
            if pos >= data.len() {
                return Err(NetworkError::Malformed("message type missing".into()));
            }
            let mt = data[pos];
            pos += 1;
            Some(mt)
        } else {
            None
        };

        Ok((
            Self {
                version,
                priority,
                expecting_reply,
                network_message,
                message_type,
                destination,
                source,
                hop_count,
            },
            pos,
        ))
    }

    fn decode_address_block(data: &[u8]) -> Result<(BacnetAddress, usize)> {
        if data.len() < 3 {
            return Err(NetworkError::Malformed("address block truncated".into()));
        }
        let network = u16::from_be_bytes([data[0], data[1]]);
        let len = data[2] as usize;
        if len > MAX_MAC_LEN {
            return Err(NetworkError::Malformed("address longer than 7 octets".into()));
        }
        if data.len() < 3 + len {
            return Err(NetworkError::Malformed("address octets truncated".into()));
        }
        Ok((
            BacnetAddress::remote_station(network, data[3..3 + len].to_vec()),
            3 + len,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_application_npdu() {
        let npdu = Npdu::application(true, MessagePriority::Normal);
        let encoded = npdu.encode();
        assert_eq!(encoded, vec![0x01, 0x04]);

        let (decoded, offset) = Npdu::decode(&encoded).unwrap();
        assert_eq!(offset, 2);
        assert!(decoded.expecting_reply);
        assert!(!decoded.network_message);
        assert!(decoded.destination.is_none());
    }

    #[test]
    fn test_global_broadcast_npdu() {
        let npdu = Npdu::global_broadcast();
        let encoded = npdu.encode();
        // version, control(dest present), DNET=FFFF, DLEN=0, hop count
        assert_eq!(encoded, vec![0x01, 0x20, 0xFF, 0xFF, 0x00, 0xFF]);

        let (decoded, offset) = Npdu::decode(&encoded).unwrap();
        assert_eq!(offset, 6);
        let dest = decoded.destination.unwrap();
        assert!(dest.is_global_broadcast());
        assert!(dest.remote.is_empty());
        assert_eq!(decoded.hop_count, Some(255));
    }

    #[test]
    fn test_routed_npdu_round_trip() {
        let mut npdu = Npdu::application(true, MessagePriority::Urgent);
        npdu = npdu.route_to(&BacnetAddress::remote_station(26001, vec![0x19]));
        npdu.source = Some(BacnetAddress::remote_station(100, vec![0x01, 0x02]));

        let encoded = npdu.encode();
        let (decoded, offset) = Npdu::decode(&encoded).unwrap();
        assert_eq!(offset, encoded.len());
        assert_eq!(decoded.priority, MessagePriority::Urgent);
        assert_eq!(decoded.destination.as_ref().unwrap().network, 26001);
        assert_eq!(decoded.destination.as_ref().unwrap().remote, vec![0x19]);
        assert_eq!(decoded.source.as_ref().unwrap().network, 100);
        assert_eq!(decoded.hop_count, Some(255));
    }

    #[test]
    fn test_network_message_type_octet() {
        let npdu = Npdu::network(NetworkMessageType::WhoIsRouterToNetwork, false);
        let encoded = npdu.encode();
        assert_eq!(encoded[1] & 0x80, 0x80);
        assert_eq!(*encoded.last().unwrap(), 0x00);

        let (decoded, offset) = Npdu::decode(&encoded).unwrap();
        assert!(decoded.network_message);
        assert_eq!(decoded.message_type, Some(0x00));
        assert_eq!(offset, encoded.len());
    }

    #[test]
    fn test_version_check() {
        let data = [0x02, 0x00];
        assert_eq!(
            Npdu::decode(&data),
            Err(NetworkError::UnsupportedVersion(2))
        );
    }

    #[test]
    fn test_truncation() {
        assert!(matches!(
            Npdu::decode(&[0x01]),
            Err(NetworkError::Malformed(_))
        ));
        // destination present but missing
        assert!(matches!(
            Npdu::decode(&[0x01, 0x20, 0xFF]),
            Err(NetworkError::Malformed(_))
        ));
        // hop count missing
        assert!(matches!(
            Npdu::decode(&[0x01, 0x20, 0xFF, 0xFF, 0x00]),
            Err(NetworkError::Malformed(_))
        ));
    }

    #[test]
    fn test_address_matching() {
        let a = BacnetAddress::local(vec![10, 0, 0, 1, 0xBA, 0xC0]);
        let b = BacnetAddress::local(vec![10, 0, 0, 1, 0xBA, 0xC0]);
        let c = BacnetAddress::local(vec![10, 0, 0, 2, 0xBA, 0xC0]);
        assert!(a.matches(&b));
        assert!(!a.matches(&c));
        assert!(BacnetAddress::global_broadcast().is_global_broadcast());
    }
}
