//! BACnet Virtual Link Control (BVLC) and BBMD Module
//!
//! BACnet/IP rides on UDP, which routed IP networks will not broadcast
//! across. Annex J solves this with the BVLC overlay: every BACnet/IP
//! packet starts with a four-octet BVLC header, and a Broadcast Management
//! Device (BBMD) on each subnet re-distributes broadcasts to its peer BBMDs
//! (via the Broadcast Distribution Table) and to registered foreign devices
//! (via the Foreign Device Table).
//!
//! # BVLC header
//!
//! ```text
//! type (1 = 0x81) | function (1) | length (2 BE, includes the header)
//! ```
//!
//! # Byte order
//!
//! The BDT and FDT store IP addresses and ports in **host byte order**;
//! conversion to network byte order happens only in the codec functions
//! that read and write the wire. This mirrors the long-standing behavior
//! of BACnet/IP stacks and keeps table arithmetic (mask inversion) in host
//! order.
//!
//! # Example
//!
//! ```
//! use bacnet_core::transport::{BvlcFunction, BvlcHeader};
//!
//! let header = BvlcHeader::new(BvlcFunction::OriginalUnicastNpdu, 10);
//! let encoded = header.encode();
//! assert_eq!(encoded, [0x81, 0x0A, 0x00, 0x0E]);
//! let decoded = BvlcHeader::decode(&encoded).unwrap();
//! assert_eq!(decoded.function, BvlcFunction::OriginalUnicastNpdu);
//! ```

#[cfg(feature = "std")]
use std::error::Error;

#[cfg(feature = "std")]
use std::fmt;

#[cfg(not(feature = "std"))]
use core::fmt;

#[cfg(not(feature = "std"))]
use alloc::{string::String, vec::Vec};

#[cfg(feature = "std")]
use std::net::{Ipv4Addr, SocketAddrV4};

use crate::network::BacnetAddress;

/// Result type for transport operations
#[cfg(feature = "std")]
pub type Result<T> = std::result::Result<T, TransportError>;

#[cfg(not(feature = "std"))]
pub type Result<T> = core::result::Result<T, TransportError>;

/// Errors that can occur in transport operations
#[derive(Debug)]
pub enum TransportError {
    /// I/O error
    #[cfg(feature = "std")]
    IoError(std::io::Error),
    /// Invalid BVLC format
    InvalidBvlc(String),
    /// Foreign device registration failed
    RegistrationFailed,
    /// Invalid transport configuration
    InvalidConfiguration(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            #[cfg(feature = "std")]
            TransportError::IoError(e) => write!(f, "I/O error: {}", e),
            TransportError::InvalidBvlc(msg) => write!(f, "Invalid BVLC: {}", msg),
            TransportError::RegistrationFailed => write!(f, "Foreign device registration failed"),
            TransportError::InvalidConfiguration(msg) => {
                write!(f, "Invalid configuration: {}", msg)
            }
        }
    }
}

#[cfg(feature = "std")]
impl Error for TransportError {}

#[cfg(feature = "std")]
impl From<std::io::Error> for TransportError {
    fn from(error: std::io::Error) -> Self {
        TransportError::IoError(error)
    }
}

/// The BVLC type octet for BACnet/IP
pub const BVLL_TYPE_BACNET_IP: u8 = 0x81;

/// BVLC header size
pub const BVLC_HEADER_SIZE: usize = 4;

/// Default BACnet/IP UDP port
pub const BACNET_IP_PORT: u16 = 0xBAC0;

/// Grace period added to every foreign-device TTL (seconds)
pub const FD_GRACE_SECONDS: u16 = 30;

/// BVLC function codes for BACnet/IP
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BvlcFunction {
    /// Result of an operation
    Result = 0x00,
    /// Write broadcast distribution table
    WriteBroadcastDistributionTable = 0x01,
    /// Read broadcast distribution table
    ReadBroadcastDistributionTable = 0x02,
    /// Acknowledge read BDT
    ReadBroadcastDistributionTableAck = 0x03,
    /// Forwarded NPDU
    ForwardedNpdu = 0x04,
    /// Register as foreign device
    RegisterForeignDevice = 0x05,
    /// Read foreign device table
    ReadForeignDeviceTable = 0x06,
    /// Acknowledge read FDT
    ReadForeignDeviceTableAck = 0x07,
    /// Delete foreign device table entry
    DeleteForeignDeviceTableEntry = 0x08,
    /// Distribute broadcast to remote network
    DistributeBroadcastToNetwork = 0x09,
    /// Pass NPDU to remote device
    OriginalUnicastNpdu = 0x0A,
    /// Broadcast NPDU to local network
    OriginalBroadcastNpdu = 0x0B,
}

impl BvlcFunction {
    /// Convert from the raw function octet
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Result),
            0x01 => Some(Self::WriteBroadcastDistributionTable),
            0x02 => Some(Self::ReadBroadcastDistributionTable),
            0x03 => Some(Self::ReadBroadcastDistributionTableAck),
            0x04 => Some(Self::ForwardedNpdu),
            0x05 => Some(Self::RegisterForeignDevice),
            0x06 => Some(Self::ReadForeignDeviceTable),
            0x07 => Some(Self::ReadForeignDeviceTableAck),
            0x08 => Some(Self::DeleteForeignDeviceTableEntry),
            0x09 => Some(Self::DistributeBroadcastToNetwork),
            0x0A => Some(Self::OriginalUnicastNpdu),
            0x0B => Some(Self::OriginalBroadcastNpdu),
            _ => None,
        }
    }
}

/// BVLC result codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum BvlcResultCode {
    SuccessfulCompletion = 0x0000,
    WriteBroadcastDistributionTableNak = 0x0010,
    ReadBroadcastDistributionTableNak = 0x0020,
    RegisterForeignDeviceNak = 0x0030,
    ReadForeignDeviceTableNak = 0x0040,
    DeleteForeignDeviceTableEntryNak = 0x0050,
    DistributeBroadcastToNetworkNak = 0x0060,
}

impl BvlcResultCode {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0000 => Some(Self::SuccessfulCompletion),
            0x0010 => Some(Self::WriteBroadcastDistributionTableNak),
            0x0020 => Some(Self::ReadBroadcastDistributionTableNak),
            0x0030 => Some(Self::RegisterForeignDeviceNak),
            0x0040 => Some(Self::ReadForeignDeviceTableNak),
            0x0050 => Some(Self::DeleteForeignDeviceTableEntryNak),
            0x0060 => Some(Self::DistributeBroadcastToNetworkNak),
            _ => None,
        }
    }
}

/// BVLC header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BvlcHeader {
    /// Function code
    pub function: BvlcFunction,
    /// Total length including the header
    pub length: u16,
}

impl BvlcHeader {
    /// Create a header for a message whose payload is `payload_len` octets
    pub fn new(function: BvlcFunction, payload_len: usize) -> Self {
        Self {
            function,
            length: (BVLC_HEADER_SIZE + payload_len) as u16,
        }
    }

    /// Encode to the four wire octets
    pub fn encode(&self) -> [u8; 4] {
        [
            BVLL_TYPE_BACNET_IP,
            self.function as u8,
            (self.length >> 8) as u8,
            (self.length & 0xFF) as u8,
        ]
    }

    /// Decode from wire octets
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < BVLC_HEADER_SIZE {
            return Err(TransportError::InvalidBvlc("header too short".into()));
        }
        if data[0] != BVLL_TYPE_BACNET_IP {
            return Err(TransportError::InvalidBvlc("not a BACnet/IP packet".into()));
        }
        let function = BvlcFunction::from_u8(data[1])
            .ok_or_else(|| TransportError::InvalidBvlc("unknown function".into()))?;
        let length = u16::from_be_bytes([data[2], data[3]]);
        Ok(Self { function, length })
    }
}

/// Build a complete BVLC message from a function and payload
pub fn encode_bvlc(function: BvlcFunction, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(BVLC_HEADER_SIZE + payload.len());
    out.extend_from_slice(&BvlcHeader::new(function, payload.len()).encode());
    out.extend_from_slice(payload);
    out
}

/// Convert a B/IP endpoint into the 6-octet wire form (host order in,
/// network order out)
#[cfg(feature = "std")]
pub fn encode_bip_address(out: &mut Vec<u8>, address: Ipv4Addr, port: u16) {
    out.extend_from_slice(&address.octets());
    out.extend_from_slice(&port.to_be_bytes());
}

/// Read a 6-octet B/IP endpoint from the wire
#[cfg(feature = "std")]
pub fn decode_bip_address(data: &[u8]) -> Result<(Ipv4Addr, u16)> {
    if data.len() < 6 {
        return Err(TransportError::InvalidBvlc("B/IP address truncated".into()));
    }
    let address = Ipv4Addr::new(data[0], data[1], data[2], data[3]);
    let port = u16::from_be_bytes([data[4], data[5]]);
    Ok((address, port))
}

/// A B/IP endpoint as a BACnet address (6-octet MAC)
#[cfg(feature = "std")]
pub fn socket_to_bacnet_address(endpoint: SocketAddrV4) -> BacnetAddress {
    let mut mac = Vec::with_capacity(6);
    mac.extend_from_slice(&endpoint.ip().octets());
    mac.extend_from_slice(&endpoint.port().to_be_bytes());
    BacnetAddress::local(mac)
}

/// Recover the B/IP endpoint from a BACnet address
#[cfg(feature = "std")]
pub fn bacnet_address_to_socket(address: &BacnetAddress) -> Option<SocketAddrV4> {
    if address.mac.len() != 6 {
        return None;
    }
    let ip = Ipv4Addr::new(address.mac[0], address.mac[1], address.mac[2], address.mac[3]);
    let port = u16::from_be_bytes([address.mac[4], address.mac[5]]);
    Some(SocketAddrV4::new(ip, port))
}

/// One Broadcast Distribution Table entry.
/// All fields are kept in host byte order.
#[cfg(feature = "std")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BdtEntry {
    /// Peer BBMD IP address (host order)
    pub address: Ipv4Addr,
    /// Peer BBMD UDP port (host order)
    pub port: u16,
    /// Broadcast distribution mask (host order); all-ones means the peer
    /// receives forwarded NPDUs by unicast
    pub mask: Ipv4Addr,
}

#[cfg(feature = "std")]
impl BdtEntry {
    /// The address Forwarded-NPDUs are sent to: the mask inverted and ORed
    /// with the BBMD address (J.4.3.2)
    pub fn forward_address(&self) -> SocketAddrV4 {
        let address = u32::from(self.address);
        let mask = u32::from(self.mask);
        SocketAddrV4::new(Ipv4Addr::from(!mask | address), self.port)
    }

    /// Does this peer receive forwarded NPDUs by unicast?
    pub fn is_unicast(&self) -> bool {
        u32::from(self.mask) == 0xFFFF_FFFF
    }
}

/// One Foreign Device Table entry.
/// Address and port are kept in host byte order.
#[cfg(feature = "std")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FdtEntry {
    pub address: Ipv4Addr,
    pub port: u16,
    /// TTL requested at registration (seconds)
    pub time_to_live: u16,
    /// TTL plus the 30-second grace period, counted down by the
    /// maintenance timer
    pub seconds_remaining: u16,
}

/// BVLC topology configuration
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BvlcConfig {
    /// Act as a BBMD (forward broadcasts per the BDT/FDT)
    pub bbmd_enabled: bool,
    /// Broadcast distribution table capacity
    pub max_bdt_entries: usize,
    /// Foreign device table capacity
    pub max_fd_entries: usize,
}

impl Default for BvlcConfig {
    fn default() -> Self {
        Self {
            bbmd_enabled: true,
            max_bdt_entries: 16,
            max_fd_entries: 32,
        }
    }
}

/// What a received BVLC packet yields for the upper layers
#[cfg(feature = "std")]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BvlcDisposition {
    /// Consumed entirely inside the BVLC layer
    Consumed,
    /// Deliver this NPDU up-stack as coming from the given source
    Npdu {
        source: BacnetAddress,
        npdu: Vec<u8>,
    },
}

/// Handler invoked when a BVLC-Result arrives
#[cfg(feature = "std")]
pub type BvlcResultHandler = Box<dyn FnMut(SocketAddrV4, BvlcResultCode) + Send>;

/// The BVLC engine: parses inbound BVLC packets, maintains the BDT and
/// FDT, queues the forwards they require, and tracks our own foreign
/// device registration.
///
/// The engine never touches a socket. Inbound packets enter through
/// [`Bbmd::process`]; every transmission it decides on is queued and
/// drained by the owner via [`Bbmd::take_outbound`].
#[cfg(feature = "std")]
pub struct Bbmd {
    /// Our unicast endpoint (host order)
    local: SocketAddrV4,
    /// Our subnet broadcast endpoint (host order)
    broadcast: SocketAddrV4,
    config: BvlcConfig,
    bdt: Vec<BdtEntry>,
    fdt: Vec<FdtEntry>,
    outbound: Vec<(SocketAddrV4, Vec<u8>)>,
    /// Remote BBMD we registered with as a foreign device
    remote_bbmd: Option<(SocketAddrV4, u16)>,
    result_handler: Option<BvlcResultHandler>,
    last_result: Option<BvlcResultCode>,
}

#[cfg(feature = "std")]
impl Bbmd {
    /// Create a BVLC engine for a node at `local` whose subnet broadcast
    /// address is `broadcast`
    pub fn new(local: SocketAddrV4, broadcast: SocketAddrV4, config: BvlcConfig) -> Self {
        Self {
            local,
            broadcast,
            config,
            bdt: Vec::new(),
            fdt: Vec::new(),
            outbound: Vec::new(),
            remote_bbmd: None,
            result_handler: None,
            last_result: None,
        }
    }

    /// Install the BVLC-Result callback
    pub fn set_result_handler(&mut self, handler: BvlcResultHandler) {
        self.result_handler = Some(handler);
    }

    /// The most recent BVLC-Result received
    pub fn last_result(&self) -> Option<BvlcResultCode> {
        self.last_result
    }

    /// The broadcast distribution table
    pub fn bdt(&self) -> &[BdtEntry] {
        &self.bdt
    }

    /// The foreign device table
    pub fn fdt(&self) -> &[FdtEntry] {
        &self.fdt
    }

    /// Replace the BDT wholesale (local configuration path)
    pub fn set_bdt(&mut self, entries: Vec<BdtEntry>) -> Result<()> {
        if entries.len() > self.config.max_bdt_entries {
            return Err(TransportError::InvalidConfiguration(
                "BDT exceeds configured capacity".into(),
            ));
        }
        self.bdt = entries;
        Ok(())
    }

    /// Drain the transmissions queued by processing and timers
    pub fn take_outbound(&mut self) -> Vec<(SocketAddrV4, Vec<u8>)> {
        core::mem::take(&mut self.outbound)
    }

    fn queue(&mut self, dest: SocketAddrV4, packet: Vec<u8>) {
        self.outbound.push((dest, packet));
    }

    fn queue_result(&mut self, dest: SocketAddrV4, code: BvlcResultCode) {
        let payload = (code as u16).to_be_bytes();
        self.queue(dest, encode_bvlc(BvlcFunction::Result, &payload));
    }

    fn forwarded_npdu_packet(origin: SocketAddrV4, npdu: &[u8]) -> Vec<u8> {
        let mut payload = Vec::with_capacity(6 + npdu.len());
        encode_bip_address(&mut payload, *origin.ip(), origin.port());
        payload.extend_from_slice(npdu);
        encode_bvlc(BvlcFunction::ForwardedNpdu, &payload)
    }

    /// Send a Forwarded-NPDU to every BDT peer except ourselves
    fn bdt_forward(&mut self, origin: SocketAddrV4, npdu: &[u8]) {
        let packet = Self::forwarded_npdu_packet(origin, npdu);
        let targets: Vec<SocketAddrV4> = self
            .bdt
            .iter()
            .map(BdtEntry::forward_address)
            .filter(|dest| *dest != self.local && *dest != self.broadcast)
            .collect();
        for dest in targets {
            log::trace!("bvlc: forwarding NPDU to BDT peer {}", dest);
            self.queue(dest, packet.clone());
        }
    }

    /// Send a Forwarded-NPDU to every live foreign device except ourselves
    /// and the originator
    fn fdt_forward(&mut self, origin: SocketAddrV4, npdu: &[u8]) {
        let packet = Self::forwarded_npdu_packet(origin, npdu);
        let targets: Vec<SocketAddrV4> = self
            .fdt
            .iter()
            .filter(|e| e.seconds_remaining > 0)
            .map(|e| SocketAddrV4::new(e.address, e.port))
            .filter(|dest| *dest != self.local && *dest != origin)
            .collect();
        for dest in targets {
            log::trace!("bvlc: forwarding NPDU to foreign device {}", dest);
            self.queue(dest, packet.clone());
        }
    }

    fn register_foreign_device(&mut self, endpoint: SocketAddrV4, ttl: u16) -> bool {
        for entry in self.fdt.iter_mut() {
            if entry.address == *endpoint.ip() && entry.port == endpoint.port() {
                entry.time_to_live = ttl;
                entry.seconds_remaining = ttl.saturating_add(FD_GRACE_SECONDS);
                return true;
            }
        }
        if self.fdt.len() < self.config.max_fd_entries {
            self.fdt.push(FdtEntry {
                address: *endpoint.ip(),
                port: endpoint.port(),
                time_to_live: ttl,
                seconds_remaining: ttl.saturating_add(FD_GRACE_SECONDS),
            });
            return true;
        }
        false
    }

    fn delete_foreign_device(&mut self, endpoint: (Ipv4Addr, u16)) -> bool {
        let before = self.fdt.len();
        self.fdt
            .retain(|e| !(e.address == endpoint.0 && e.port == endpoint.1));
        before != self.fdt.len()
    }

    fn bdt_member_mask_is_unicast(&self, src: SocketAddrV4) -> bool {
        self.bdt
            .iter()
            .any(|e| e.address == *src.ip() && e.port == src.port() && e.is_unicast())
    }

    /// Encode our BDT into a Read-BDT-Ack payload
    fn encode_bdt_ack(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(self.bdt.len() * 10);
        for entry in &self.bdt {
            encode_bip_address(&mut payload, entry.address, entry.port);
            payload.extend_from_slice(&entry.mask.octets());
        }
        encode_bvlc(BvlcFunction::ReadBroadcastDistributionTableAck, &payload)
    }

    /// Encode our FDT into a Read-FDT-Ack payload
    fn encode_fdt_ack(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(self.fdt.len() * 10);
        for entry in &self.fdt {
            encode_bip_address(&mut payload, entry.address, entry.port);
            payload.extend_from_slice(&entry.time_to_live.to_be_bytes());
            payload.extend_from_slice(&entry.seconds_remaining.to_be_bytes());
        }
        encode_bvlc(BvlcFunction::ReadForeignDeviceTableAck, &payload)
    }

    fn write_bdt(&mut self, payload: &[u8]) -> bool {
        if payload.len() % 10 != 0 || payload.len() / 10 > self.config.max_bdt_entries {
            return false;
        }
        let mut bdt = Vec::with_capacity(payload.len() / 10);
        for chunk in payload.chunks_exact(10) {
            let (address, port) = match decode_bip_address(chunk) {
                Ok(v) => v,
                Err(_) => return false,
            };
            let mask = Ipv4Addr::new(chunk[6], chunk[7], chunk[8], chunk[9]);
            bdt.push(BdtEntry {
                address,
                port,
                mask,
            });
        }
        self.bdt = bdt;
        true
    }

    /// Process one received BACnet/IP packet.
    ///
    /// Queues whatever forwards and replies the packet requires and
    /// reports whether an NPDU should be delivered up-stack.
    pub fn process(&mut self, src: SocketAddrV4, packet: &[u8]) -> Result<BvlcDisposition> {
        let header = BvlcHeader::decode(packet)?;
        if (header.length as usize) != packet.len() {
            return Err(TransportError::InvalidBvlc("length field mismatch".into()));
        }
        let payload = &packet[BVLC_HEADER_SIZE..];

        match header.function {
            BvlcFunction::Result => {
                if payload.len() < 2 {
                    return Err(TransportError::InvalidBvlc("result truncated".into()));
                }
                let raw = u16::from_be_bytes([payload[0], payload[1]]);
                let code = BvlcResultCode::from_u16(raw)
                    .ok_or_else(|| TransportError::InvalidBvlc("unknown result code".into()))?;
                self.last_result = Some(code);
                if let Some(handler) = self.result_handler.as_mut() {
                    handler(src, code);
                }
                Ok(BvlcDisposition::Consumed)
            }

            BvlcFunction::OriginalUnicastNpdu => {
                if src == self.local {
                    return Ok(BvlcDisposition::Consumed);
                }
                Ok(BvlcDisposition::Npdu {
                    source: socket_to_bacnet_address(src),
                    npdu: payload.to_vec(),
                })
            }

            BvlcFunction::OriginalBroadcastNpdu => {
                if src == self.local {
                    return Ok(BvlcDisposition::Consumed);
                }
                if self.config.bbmd_enabled {
                    self.bdt_forward(src, payload);
                    self.fdt_forward(src, payload);
                }
                Ok(BvlcDisposition::Npdu {
                    source: socket_to_bacnet_address(src),
                    npdu: payload.to_vec(),
                })
            }

            BvlcFunction::ForwardedNpdu => {
                let (origin_ip, origin_port) = decode_bip_address(payload)?;
                let origin = SocketAddrV4::new(origin_ip, origin_port);
                let npdu = &payload[6..];

                // never re-distribute our own traffic
                if origin == self.local {
                    return Ok(BvlcDisposition::Consumed);
                }

                if self.config.bbmd_enabled {
                    // arrived by unicast from a peer whose mask is all
                    // ones: the rest of our subnet has not seen it yet
                    if self.bdt_member_mask_is_unicast(src) {
                        let packet = Self::forwarded_npdu_packet(origin, npdu);
                        let broadcast = self.broadcast;
                        self.queue(broadcast, packet);
                    }
                    self.fdt_forward(origin, npdu);
                }

                Ok(BvlcDisposition::Npdu {
                    source: socket_to_bacnet_address(origin),
                    npdu: npdu.to_vec(),
                })
            }

            BvlcFunction::DistributeBroadcastToNetwork => {
                if !self.config.bbmd_enabled {
                    self.queue_result(src, BvlcResultCode::DistributeBroadcastToNetworkNak);
                    return Ok(BvlcDisposition::Consumed);
                }
                // local broadcast, then both tables, never back to the
                // originator
                let packet = Self::forwarded_npdu_packet(src, payload);
                let broadcast = self.broadcast;
                self.queue(broadcast, packet);
                self.bdt_forward(src, payload);
                self.fdt_forward(src, payload);
                Ok(BvlcDisposition::Npdu {
                    source: socket_to_bacnet_address(src),
                    npdu: payload.to_vec(),
                })
            }

            BvlcFunction::RegisterForeignDevice => {
                if payload.len() < 2 {
                    return Err(TransportError::InvalidBvlc("registration truncated".into()));
                }
                let ttl = u16::from_be_bytes([payload[0], payload[1]]);
                if self.config.bbmd_enabled && self.register_foreign_device(src, ttl) {
                    log::debug!("bvlc: registered foreign device {} (ttl {}s)", src, ttl);
                    self.queue_result(src, BvlcResultCode::SuccessfulCompletion);
                } else {
                    self.queue_result(src, BvlcResultCode::RegisterForeignDeviceNak);
                }
                Ok(BvlcDisposition::Consumed)
            }

            BvlcFunction::DeleteForeignDeviceTableEntry => {
                let endpoint = decode_bip_address(payload)?;
                if self.delete_foreign_device(endpoint) {
                    self.queue_result(src, BvlcResultCode::SuccessfulCompletion);
                } else {
                    self.queue_result(src, BvlcResultCode::DeleteForeignDeviceTableEntryNak);
                }
                Ok(BvlcDisposition::Consumed)
            }

            BvlcFunction::WriteBroadcastDistributionTable => {
                if self.config.bbmd_enabled && self.write_bdt(payload) {
                    self.queue_result(src, BvlcResultCode::SuccessfulCompletion);
                } else {
                    self.queue_result(src, BvlcResultCode::WriteBroadcastDistributionTableNak);
                }
                Ok(BvlcDisposition::Consumed)
            }

            BvlcFunction::ReadBroadcastDistributionTable => {
                let ack = self.encode_bdt_ack();
                self.queue(src, ack);
                Ok(BvlcDisposition::Consumed)
            }

            BvlcFunction::ReadForeignDeviceTable => {
                let ack = self.encode_fdt_ack();
                self.queue(src, ack);
                Ok(BvlcDisposition::Consumed)
            }

            BvlcFunction::ReadBroadcastDistributionTableAck
            | BvlcFunction::ReadForeignDeviceTableAck => {
                // client-side table reads are surfaced to the owner
                Ok(BvlcDisposition::Consumed)
            }
        }
    }

    /// Queue an Original-Unicast-NPDU to a peer
    pub fn send_unicast(&mut self, dest: SocketAddrV4, npdu: &[u8]) {
        let packet = encode_bvlc(BvlcFunction::OriginalUnicastNpdu, npdu);
        self.queue(dest, packet);
    }

    /// Queue a broadcast. A node registered as a foreign device asks its
    /// BBMD to distribute; everyone else uses the subnet broadcast, and a
    /// BBMD additionally feeds its own tables.
    pub fn send_broadcast(&mut self, npdu: &[u8]) {
        if let Some((bbmd, _)) = self.remote_bbmd {
            let packet = encode_bvlc(BvlcFunction::DistributeBroadcastToNetwork, npdu);
            self.queue(bbmd, packet);
            return;
        }
        let packet = encode_bvlc(BvlcFunction::OriginalBroadcastNpdu, npdu);
        let broadcast = self.broadcast;
        self.queue(broadcast, packet);
        if self.config.bbmd_enabled {
            let local = self.local;
            self.bdt_forward(local, npdu);
            self.fdt_forward(local, npdu);
        }
    }

    /// Register with a remote BBMD as a foreign device
    pub fn register_with_bbmd(&mut self, bbmd: SocketAddrV4, ttl: u16) {
        self.remote_bbmd = Some((bbmd, ttl));
        let packet = encode_bvlc(BvlcFunction::RegisterForeignDevice, &ttl.to_be_bytes());
        self.queue(bbmd, packet);
    }

    /// One-second maintenance tick: age the FDT and drop expired entries
    pub fn maintenance_timer(&mut self, seconds: u16) {
        for entry in self.fdt.iter_mut() {
            entry.seconds_remaining = entry.seconds_remaining.saturating_sub(seconds);
        }
        let before = self.fdt.len();
        self.fdt.retain(|e| e.seconds_remaining > 0);
        if self.fdt.len() != before {
            log::debug!(
                "bvlc: expired {} foreign device registration(s)",
                before - self.fdt.len()
            );
        }
    }
}
