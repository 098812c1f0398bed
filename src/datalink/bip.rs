//! BACnet/IP Data Link Implementation (Annex J)
//!
//! UDP on port 47808 with BVLC framing. The socket work lives here; every
//! BVLC decision (forwarding, foreign device registration, result replies)
//! is delegated to the [`Bbmd`] engine in [`crate::transport`], whose
//! queued transmissions are flushed onto the socket after every operation.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::time::{Duration as StdDuration, Instant};

use core::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};

use crate::datalink::{DataLink, DataLinkError, DataLinkType, Result};
use crate::network::BacnetAddress;
use crate::transport::{
    bacnet_address_to_socket, socket_to_bacnet_address, Bbmd, BvlcConfig, BvlcDisposition,
    BACNET_IP_PORT,
};

/// Receive buffer size; covers the largest BVLC packet
const RECEIVE_BUFFER_SIZE: usize = 1500;

/// A BACnet/IP node: UDP socket plus the BVLC/BBMD engine
pub struct BacnetIpDataLink {
    socket: UdpSocket,
    bbmd: Bbmd,
    local: SocketAddrV4,
    broadcast: SocketAddrV4,
    buffer: Vec<u8>,
    maintenance_accumulator: u32,
}

impl BacnetIpDataLink {
    /// Bind to `address` (e.g. `"0.0.0.0:47808"`) with the default BVLC
    /// configuration and the limited broadcast address
    pub fn new(address: &str) -> Result<Self> {
        let bind: SocketAddrV4 = address
            .parse()
            .map_err(|_| DataLinkError::AddressError("invalid bind address".into()))?;
        Self::with_config(
            bind,
            SocketAddrV4::new(Ipv4Addr::BROADCAST, bind.port()),
            BvlcConfig::default(),
        )
    }

    /// Bind with an explicit subnet broadcast address and BVLC topology
    pub fn with_config(
        bind: SocketAddrV4,
        broadcast: SocketAddrV4,
        config: BvlcConfig,
    ) -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_broadcast(true)?;
        socket.bind(&SocketAddr::V4(bind).into())?;
        let socket: UdpSocket = socket.into();

        let local = match socket.local_addr()? {
            SocketAddr::V4(v4) => v4,
            SocketAddr::V6(_) => {
                return Err(DataLinkError::AddressError("IPv6 socket".into()));
            }
        };

        Ok(Self {
            socket,
            bbmd: Bbmd::new(local, broadcast, config),
            local,
            broadcast,
            buffer: vec![0u8; RECEIVE_BUFFER_SIZE],
            maintenance_accumulator: 0,
        })
    }

    /// The BVLC engine, for BDT configuration and table inspection
    pub fn bbmd_mut(&mut self) -> &mut Bbmd {
        &mut self.bbmd
    }

    /// Register with a remote BBMD as a foreign device
    pub fn register_foreign_device(&mut self, bbmd: SocketAddrV4, ttl: u16) -> Result<()> {
        self.bbmd.register_with_bbmd(bbmd, ttl);
        self.flush()
    }

    /// Transmit everything the BVLC engine has queued
    fn flush(&mut self) -> Result<()> {
        for (dest, packet) in self.bbmd.take_outbound() {
            self.socket.send_to(&packet, SocketAddr::V4(dest))?;
        }
        Ok(())
    }
}

impl DataLink for BacnetIpDataLink {
    fn send_pdu(
        &mut self,
        dest: &BacnetAddress,
        _expecting_reply: bool,
        pdu: &[u8],
    ) -> Result<usize> {
        let broadcast_mac = socket_to_bacnet_address(self.broadcast).mac;
        if dest.mac.is_empty() || dest.mac == broadcast_mac {
            self.bbmd.send_broadcast(pdu);
        } else {
            let endpoint = bacnet_address_to_socket(dest)
                .ok_or_else(|| DataLinkError::AddressError("not a B/IP address".into()))?;
            self.bbmd.send_unicast(endpoint, pdu);
        }
        self.flush()?;
        Ok(pdu.len())
    }

    fn receive(&mut self, timeout: Duration) -> Result<(BacnetAddress, Vec<u8>)> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(DataLinkError::Timeout);
            }
            self.socket
                .set_read_timeout(Some(StdDuration::from_millis(
                    remaining.as_millis().max(1) as u64,
                )))?;

            let (length, src) = match self.socket.recv_from(&mut self.buffer) {
                Ok(received) => received,
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    return Err(DataLinkError::Timeout);
                }
                Err(e) => return Err(e.into()),
            };
            let src = match src {
                SocketAddr::V4(v4) => v4,
                SocketAddr::V6(_) => continue,
            };

            let packet = self.buffer[..length].to_vec();
            let disposition = match self.bbmd.process(src, &packet) {
                Ok(disposition) => disposition,
                Err(error) => {
                    log::debug!("bip: dropping packet from {}: {}", src, error);
                    continue;
                }
            };
            self.flush()?;

            if let BvlcDisposition::Npdu { source, npdu } = disposition {
                return Ok((source, npdu));
            }
            // consumed by the BVLC layer; keep waiting
        }
    }

    fn broadcast_address(&self) -> BacnetAddress {
        socket_to_bacnet_address(self.broadcast)
    }

    fn my_address(&self) -> BacnetAddress {
        socket_to_bacnet_address(self.local)
    }

    fn max_apdu(&self) -> usize {
        crate::BACNET_MAX_APDU
    }

    fn link_type(&self) -> DataLinkType {
        DataLinkType::BacnetIp
    }

    fn tick(&mut self, milliseconds: u32) {
        self.maintenance_accumulator += milliseconds;
        let seconds = self.maintenance_accumulator / 1000;
        if seconds > 0 {
            self.maintenance_accumulator %= 1000;
            self.bbmd.maintenance_timer(seconds as u16);
            let _ = self.flush();
        }
    }

    fn cleanup(&mut self) {
        // dropping the socket closes it; nothing else to release
    }
}

/// Discover a usable IPv4 broadcast address for the first non-loopback
/// interface
#[cfg(feature = "native-net")]
pub fn discover_broadcast_address(port: u16) -> Option<SocketAddrV4> {
    for interface in if_addrs::get_if_addrs().ok()? {
        if interface.is_loopback() {
            continue;
        }
        if let if_addrs::IfAddr::V4(v4) = interface.addr {
            if let Some(broadcast) = v4.broadcast {
                return Some(SocketAddrV4::new(broadcast, port));
            }
        }
    }
    None
}

/// The default BACnet/IP port as a bind string
pub fn default_bind_address() -> String {
    format!("0.0.0.0:{}", BACNET_IP_PORT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_and_addresses() {
        // an ephemeral port keeps the test independent of 47808
        let link = BacnetIpDataLink::new("127.0.0.1:0").unwrap();
        let my_address = link.my_address();
        assert_eq!(my_address.mac.len(), 6);
        assert_eq!(&my_address.mac[..4], &[127, 0, 0, 1]);

        let broadcast = link.broadcast_address();
        assert_eq!(&broadcast.mac[..4], &[255, 255, 255, 255]);
        assert_eq!(link.link_type(), DataLinkType::BacnetIp);
    }

    #[test]
    fn test_unicast_loopback_round_trip() {
        let mut a = BacnetIpDataLink::new("127.0.0.1:0").unwrap();
        let mut b = BacnetIpDataLink::new("127.0.0.1:0").unwrap();

        let npdu = vec![0x01, 0x00, 0x10, 0x08];
        a.send_pdu(&b.my_address(), false, &npdu).unwrap();

        let (source, received) = b.receive(Duration::from_millis(500)).unwrap();
        assert_eq!(received, npdu);
        assert_eq!(source, a.my_address());
    }

    #[test]
    fn test_receive_timeout() {
        let mut link = BacnetIpDataLink::new("127.0.0.1:0").unwrap();
        let result = link.receive(Duration::from_millis(20));
        assert!(matches!(result, Err(DataLinkError::Timeout)));
    }

    #[test]
    fn test_invalid_bind_address() {
        assert!(BacnetIpDataLink::new("not-an-address").is_err());
    }
}
