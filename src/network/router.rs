//! Network-layer message handling and router discovery.
//!
//! This node is not itself a router: it consumes network-layer messages to
//! learn the topology (which router reaches which DNET, what the local
//! network number is) and answers the queries a non-routing node is
//! expected to answer. Frames addressed to a remote DNET are dropped by
//! the NPDU handler; see [`crate::session`].
//!
//! The router table is filled by I-Am-Router-To-Network announcements,
//! solicited with [`send_who_is_router_to_network`] (seed of the
//! Who-Is-Router discovery flow) or overheard on the segment.

#[cfg(not(feature = "std"))]
use alloc::vec::Vec;

use crate::datalink::DataLink;
use crate::network::{BacnetAddress, NetworkMessageType, Npdu};

/// One learned route: the DNET and the router's MAC on our segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterEntry {
    pub network: u16,
    pub next_hop: BacnetAddress,
}

/// DNET to next-hop table learned from I-Am-Router-To-Network
#[derive(Debug, Default)]
pub struct RouterTable {
    entries: Vec<RouterEntry>,
}

impl RouterTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `next_hop` routes to each network in `networks`.
    /// A newer announcement for a DNET replaces the older one.
    pub fn update(&mut self, next_hop: &BacnetAddress, networks: &[u16]) {
        for &network in networks {
            if let Some(entry) = self.entries.iter_mut().find(|e| e.network == network) {
                entry.next_hop = next_hop.clone();
            } else {
                self.entries.push(RouterEntry {
                    network,
                    next_hop: next_hop.clone(),
                });
            }
        }
    }

    /// The router that reaches `network`, if known
    pub fn lookup(&self, network: u16) -> Option<&BacnetAddress> {
        self.entries
            .iter()
            .find(|e| e.network == network)
            .map(|e| &e.next_hop)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn send_network_message(
    link: &mut dyn DataLink,
    dest: &BacnetAddress,
    message_type: NetworkMessageType,
    body: &[u8],
) {
    let npdu = Npdu::network(message_type, false);
    let mut pdu = npdu.encode();
    pdu.extend_from_slice(body);
    let _ = link.send_pdu(dest, false, &pdu);
}

/// Broadcast Who-Is-Router-To-Network, for one DNET or (with `None`) for
/// every router on the segment
pub fn send_who_is_router_to_network(link: &mut dyn DataLink, network: Option<u16>) {
    let broadcast = link.broadcast_address();
    let body = match network {
        Some(network) => network.to_be_bytes().to_vec(),
        None => Vec::new(),
    };
    send_network_message(
        link,
        &broadcast,
        NetworkMessageType::WhoIsRouterToNetwork,
        &body,
    );
}

/// Broadcast Network-Number-Is for the local network.
/// `configured` distinguishes an assigned number from a learned one.
pub fn send_network_number_is(link: &mut dyn DataLink, network: u16, configured: bool) {
    let broadcast = link.broadcast_address();
    let mut body = network.to_be_bytes().to_vec();
    body.push(u8::from(configured));
    send_network_message(link, &broadcast, NetworkMessageType::NetworkNumberIs, &body);
}

/// Broadcast What-Is-Network-Number
pub fn send_what_is_network_number(link: &mut dyn DataLink) {
    let broadcast = link.broadcast_address();
    send_network_message(
        link,
        &broadcast,
        NetworkMessageType::WhatIsNetworkNumber,
        &[],
    );
}

/// Process one network-layer message addressed to (or broadcast past) this
/// node. `local_network` is both read (to answer What-Is-Network-Number)
/// and written (when Network-Number-Is teaches us the number).
pub fn handle_network_message(
    table: &mut RouterTable,
    link: &mut dyn DataLink,
    local_network: &mut Option<u16>,
    src: &BacnetAddress,
    npdu: &Npdu,
    body: &[u8],
) {
    let message_type = match npdu.message_type.and_then(NetworkMessageType::from_u8) {
        Some(message_type) => message_type,
        None => {
            log::debug!("router: ignoring proprietary network message");
            return;
        }
    };

    match message_type {
        NetworkMessageType::IAmRouterToNetwork => {
            let mut networks = Vec::new();
            for chunk in body.chunks_exact(2) {
                networks.push(u16::from_be_bytes([chunk[0], chunk[1]]));
            }
            log::debug!("router: {} network(s) via {:?}", networks.len(), src.mac);
            table.update(src, &networks);
        }

        NetworkMessageType::WhoIsRouterToNetwork => {
            // only routers answer; we just note the question
            log::trace!("router: Who-Is-Router-To-Network overheard");
        }

        NetworkMessageType::NetworkNumberIs => {
            if body.len() >= 2 && npdu.source.is_none() {
                // only directly attached announcements teach us our number
                let network = u16::from_be_bytes([body[0], body[1]]);
                *local_network = Some(network);
                log::debug!("router: local network number is {}", network);
            }
        }

        NetworkMessageType::WhatIsNetworkNumber => {
            if let Some(network) = *local_network {
                send_network_number_is(link, network, false);
            }
        }

        NetworkMessageType::InitializeRoutingTable => {
            // not a router: acknowledge with an empty table
            if body.first().copied().unwrap_or(0) == 0 {
                send_network_message(
                    link,
                    src,
                    NetworkMessageType::InitializeRoutingTableAck,
                    &[0],
                );
            }
        }

        NetworkMessageType::InitializeRoutingTableAck => {
            log::trace!("router: routing table ack ({} bytes)", body.len());
        }

        NetworkMessageType::RejectMessageToNetwork => {
            if body.len() >= 3 {
                let reason = body[0];
                let network = u16::from_be_bytes([body[1], body[2]]);
                log::debug!(
                    "router: message to network {} rejected, reason {}",
                    network,
                    reason
                );
            }
        }

        _ => {
            log::trace!("router: ignoring network message {:?}", message_type);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datalink::{DataLinkError, DataLinkType};
    use core::time::Duration;

    struct TestLink {
        sent: Vec<(BacnetAddress, Vec<u8>)>,
    }

    impl TestLink {
        fn new() -> Self {
            Self { sent: Vec::new() }
        }
    }

    impl DataLink for TestLink {
        fn send_pdu(
            &mut self,
            dest: &BacnetAddress,
            _expecting_reply: bool,
            pdu: &[u8],
        ) -> crate::datalink::Result<usize> {
            self.sent.push((dest.clone(), pdu.to_vec()));
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
            BacnetAddress::local(vec![0x05])
        }

        fn max_apdu(&self) -> usize {
            1476
        }

        fn link_type(&self) -> DataLinkType {
            DataLinkType::BacnetIp
        }
    }

    #[test]
    fn test_who_is_router_discovery_populates_table() {
        // Seed scenario: broadcast Who-Is-Router-To-Network with no DNET,
        // collect I-Am-Router-To-Network answers into the router table.
        let mut link = TestLink::new();
        let mut table = RouterTable::new();
        let mut local_network = None;

        send_who_is_router_to_network(&mut link, None);
        let (dest, pdu) = &link.sent[0];
        assert_eq!(dest.mac, vec![0xFF]);
        let (npdu, offset) = Npdu::decode(pdu).unwrap();
        assert!(npdu.network_message);
        assert_eq!(
            npdu.message_type,
            Some(NetworkMessageType::WhoIsRouterToNetwork as u8)
        );
        assert_eq!(offset, pdu.len());

        // router at MAC 0x0A answers for DNETs 200 and 300
        let router = BacnetAddress::local(vec![0x0A]);
        let reply_npdu = Npdu::network(NetworkMessageType::IAmRouterToNetwork, false);
        let mut body = Vec::new();
        body.extend_from_slice(&200u16.to_be_bytes());
        body.extend_from_slice(&300u16.to_be_bytes());
        handle_network_message(
            &mut table,
            &mut link,
            &mut local_network,
            &router,
            &reply_npdu,
            &body,
        );

        assert_eq!(table.len(), 2);
        assert_eq!(table.lookup(200), Some(&router));
        assert_eq!(table.lookup(300), Some(&router));
        assert_eq!(table.lookup(400), None);

        // a second router takes over DNET 300
        let other = BacnetAddress::local(vec![0x0B]);
        handle_network_message(
            &mut table,
            &mut link,
            &mut local_network,
            &other,
            &reply_npdu,
            &300u16.to_be_bytes(),
        );
        assert_eq!(table.len(), 2);
        assert_eq!(table.lookup(300), Some(&other));
    }

    #[test]
    fn test_network_number_learning_and_answering() {
        let mut link = TestLink::new();
        let mut table = RouterTable::new();
        let mut local_network = None;

        // What-Is-Network-Number while we do not know: silence
        let query = Npdu::network(NetworkMessageType::WhatIsNetworkNumber, false);
        let peer = BacnetAddress::local(vec![0x09]);
        handle_network_message(&mut table, &mut link, &mut local_network, &peer, &query, &[]);
        assert!(link.sent.is_empty());

        // Network-Number-Is teaches us the number
        let announce = Npdu::network(NetworkMessageType::NetworkNumberIs, false);
        let mut body = 42u16.to_be_bytes().to_vec();
        body.push(0);
        handle_network_message(
            &mut table,
            &mut link,
            &mut local_network,
            &peer,
            &announce,
            &body,
        );
        assert_eq!(local_network, Some(42));

        // now the query draws an answer
        handle_network_message(&mut table, &mut link, &mut local_network, &peer, &query, &[]);
        assert_eq!(link.sent.len(), 1);
        let (_, pdu) = &link.sent[0];
        let (npdu, offset) = Npdu::decode(pdu).unwrap();
        assert_eq!(
            npdu.message_type,
            Some(NetworkMessageType::NetworkNumberIs as u8)
        );
        assert_eq!(&pdu[offset..offset + 2], &42u16.to_be_bytes());
    }

    #[test]
    fn test_routed_announcement_does_not_teach_local_number() {
        let mut link = TestLink::new();
        let mut table = RouterTable::new();
        let mut local_network = None;

        let mut announce = Npdu::network(NetworkMessageType::NetworkNumberIs, false);
        announce.source = Some(BacnetAddress::remote_station(7, vec![0x01]));
        let peer = BacnetAddress::local(vec![0x09]);
        let mut body = 42u16.to_be_bytes().to_vec();
        body.push(0);
        handle_network_message(
            &mut table,
            &mut link,
            &mut local_network,
            &peer,
            &announce,
            &body,
        );
        assert_eq!(local_network, None);
    }

    #[test]
    fn test_initialize_routing_table_query_gets_empty_ack() {
        let mut link = TestLink::new();
        let mut table = RouterTable::new();
        let mut local_network = Some(1);
        let peer = BacnetAddress::local(vec![0x09]);

        let query = Npdu::network(NetworkMessageType::InitializeRoutingTable, false);
        handle_network_message(&mut table, &mut link, &mut local_network, &peer, &query, &[0]);
        assert_eq!(link.sent.len(), 1);
        let (dest, pdu) = &link.sent[0];
        assert_eq!(dest, &peer);
        let (npdu, offset) = Npdu::decode(pdu).unwrap();
        assert_eq!(
            npdu.message_type,
            Some(NetworkMessageType::InitializeRoutingTableAck as u8)
        );
        assert_eq!(pdu[offset], 0);
    }
}
