//! BACnet Transaction State Machine Module
//!
//! Every confirmed request in flight is tracked by a transaction slot: the
//! invoke id, the peer address, the NPDU and APDU header templates, the
//! owned outbound blob, the inbound reassembly blob, the retry budgets and
//! the two timers. The state machine implements clause 5.4: unsegmented
//! confirmed requests, windowed segmented transmission in both directions,
//! and segmented reassembly with duplicate and out-of-order handling.
//!
//! # States
//!
//! - `Idle` — slot free, or (with a nonzero invoke id) a failed
//!   transaction awaiting collection via [`TransactionManager::invoke_id_failed`]
//! - `Allocated` — invoke id reserved, transaction not yet described
//! - `AwaitConfirmation` — unsegmented request sent, or all segments
//!   acknowledged, waiting for the peer's reply
//! - `SegmentedRequestClient` — sending a segmented request
//! - `SegmentedRequestServer` — reassembling a peer's segmented request
//! - `SegmentedResponseServer` — sending a segmented complex ack
//! - `SegmentedConfirmation` — reassembling a segmented complex ack
//!
//! # Peer indirection
//!
//! Inbound confirmed requests are tracked under a fresh internal invoke id
//! allocated from the same table, keyed by (peer address, peer invoke id),
//! so two peers that both use invoke id 5 never collide.
//!
//! Nothing here reads a clock: the host calls
//! [`TransactionManager::timer_milliseconds`] and all timeouts derive from
//! it.

#[cfg(feature = "std")]
use std::error::Error;

#[cfg(feature = "std")]
use std::fmt;

#[cfg(not(feature = "std"))]
use core::fmt;

#[cfg(not(feature = "std"))]
use alloc::vec::Vec;

use crate::address::AddressCache;
use crate::app::{AbortReason, Apdu, ApduFixedHeader, MaxSegments};
use crate::datalink::DataLink;
use crate::network::{BacnetAddress, MessagePriority, Npdu};

/// Result type for transaction operations
#[cfg(feature = "std")]
pub type Result<T> = std::result::Result<T, TransactionError>;

#[cfg(not(feature = "std"))]
pub type Result<T> = core::result::Result<T, TransactionError>;

/// Errors that can occur in transaction operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    /// No free transaction slot
    TableFull,
    /// Invoke id 0 or not currently allocated
    InvalidInvokeId,
    /// Encoded body exceeds what the peer can accept
    PayloadExceedsPeerCapacity,
    /// The datalink refused the PDU
    SendFailed,
    /// Header encoding failed
    Encoding,
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionError::TableFull => write!(f, "Transaction table full"),
            TransactionError::InvalidInvokeId => write!(f, "Invalid invoke id"),
            TransactionError::PayloadExceedsPeerCapacity => {
                write!(f, "Payload exceeds peer capacity")
            }
            TransactionError::SendFailed => write!(f, "Datalink send failed"),
            TransactionError::Encoding => write!(f, "Header encoding failed"),
        }
    }
}

#[cfg(feature = "std")]
impl Error for TransactionError {}

/// Transaction slot states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TsmState {
    #[default]
    Idle,
    Allocated,
    AwaitConfirmation,
    SegmentedRequestClient,
    SegmentedRequestServer,
    SegmentedResponseServer,
    SegmentedConfirmation,
}

/// Transaction state machine configuration
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TsmConfig {
    /// Slot count; also the invoke-id space (at most 255)
    pub max_transactions: usize,
    /// Peer indirection table size
    pub max_peers: usize,
    /// Confirmed-request timeout (milliseconds)
    pub apdu_timeout_ms: u32,
    /// Per-window segment timeout (milliseconds); the receiving side waits
    /// four times this
    pub apdu_segment_timeout_ms: u32,
    /// Retry budget for requests and windows
    pub apdu_retries: u8,
    /// Most segments we will reassemble
    pub max_segments_accepted: u32,
    /// Window size proposed when we send segmented
    pub proposed_window_size: u8,
    /// Largest APDU we emit
    pub max_apdu: usize,
}

impl Default for TsmConfig {
    fn default() -> Self {
        Self {
            max_transactions: 255,
            max_peers: 64,
            apdu_timeout_ms: 3000,
            apdu_segment_timeout_ms: 3000,
            apdu_retries: 3,
            max_segments_accepted: 64,
            proposed_window_size: 32,
            max_apdu: crate::BACNET_MAX_APDU,
        }
    }
}

/// Service metadata of an inbound confirmed request, handed to handlers
/// and used to size the reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfirmedRequestInfo {
    pub invoke_id: u8,
    pub service_choice: u8,
    pub max_response: usize,
    pub segmented_response_accepted: bool,
    pub max_segments: MaxSegments,
    pub segmented: bool,
    pub more_follows: bool,
    pub sequence_number: u8,
    pub proposed_window_size: u8,
}

impl ConfirmedRequestInfo {
    /// Extract the metadata from a decoded confirmed-request APDU
    pub fn from_apdu(apdu: &Apdu) -> Option<Self> {
        match apdu {
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
                ..
            } => Some(Self {
                invoke_id: *invoke_id,
                service_choice: *service_choice,
                max_response: max_response_size.size(),
                segmented_response_accepted: *segmented_response_accepted,
                max_segments: *max_segments,
                segmented: *segmented,
                more_follows: *more_follows,
                sequence_number: sequence_number.unwrap_or(0),
                proposed_window_size: proposed_window_size.unwrap_or(1),
            }),
            _ => None,
        }
    }
}

/// Metadata of an inbound segmented complex ack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComplexAckInfo {
    pub invoke_id: u8,
    pub service_choice: u8,
    pub sequence_number: u8,
    pub proposed_window_size: u8,
    pub more_follows: bool,
}

#[derive(Debug, Default)]
struct TransactionSlot {
    /// 0 = free
    invoke_id: u8,
    state: TsmState,
    dest: BacnetAddress,
    npdu: Npdu,
    header: Option<ApduFixedHeader>,
    /// Outbound service body, owned for the slot's lifetime
    request: Vec<u8>,
    /// Inbound reassembly blob
    reassembly: Vec<u8>,
    retry_count: u8,
    segment_retry_count: u8,
    sent_all_segments: bool,
    last_sequence_number: u8,
    /// Absolute (not modulo 256) number of the first unacknowledged segment
    initial_sequence_number: u32,
    actual_window_size: u8,
    proposed_window_size: u8,
    duplicate_count: u8,
    request_timer: u32,
    segment_timer: u32,
    received_segments: u32,
    /// Largest single APDU the peer accepts
    apdu_maximum_length: u32,
    /// Largest total body the peer can reassemble
    max_transmittable: u32,
}

impl TransactionSlot {
    fn clear_blobs(&mut self) {
        self.request = Vec::new();
        self.reassembly = Vec::new();
    }
}

#[derive(Debug, Clone, Default)]
struct PeerSlot {
    /// 0 = free
    internal_invoke_id: u8,
    peer_invoke_id: u8,
    peer_address: BacnetAddress,
}

/// Send an Abort PDU for `invoke_id` to `dest`
pub fn send_abort(
    link: &mut dyn DataLink,
    dest: &BacnetAddress,
    invoke_id: u8,
    reason: AbortReason,
    server: bool,
) {
    let npdu = Npdu::application(false, MessagePriority::Normal).route_to(dest);
    let mut pdu = npdu.encode();
    pdu.extend_from_slice(
        &Apdu::Abort {
            server,
            invoke_id,
            abort_reason: reason as u8,
        }
        .encode(),
    );
    let _ = link.send_pdu(dest, false, &pdu);
}

/// Send a Segment-Ack PDU
pub fn send_segment_ack(
    link: &mut dyn DataLink,
    dest: &BacnetAddress,
    negative: bool,
    server: bool,
    invoke_id: u8,
    sequence_number: u8,
    actual_window_size: u8,
) {
    let npdu = Npdu::application(false, MessagePriority::Normal).route_to(dest);
    let mut pdu = npdu.encode();
    pdu.extend_from_slice(
        &Apdu::SegmentAck {
            negative,
            server,
            invoke_id,
            sequence_number,
            actual_window_size,
        }
        .encode(),
    );
    let _ = link.send_pdu(dest, false, &pdu);
}

/// What became of a delivered reassembly
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reassembly {
    /// More segments expected
    Incomplete,
    /// The message is complete
    Complete(Vec<u8>),
    /// The transaction died (abort sent or state error)
    Failed,
}

/// The transaction state machine: a fixed table of slots plus the peer
/// indirection table.
pub struct TransactionManager {
    config: TsmConfig,
    current_invoke_id: u8,
    slots: Vec<TransactionSlot>,
    peers: Vec<PeerSlot>,
}

impl TransactionManager {
    pub fn new(config: TsmConfig) -> Self {
        let max = config.max_transactions.clamp(1, 255);
        let mut slots = Vec::with_capacity(max);
        slots.resize_with(max, TransactionSlot::default);
        let mut peers = Vec::with_capacity(config.max_peers);
        peers.resize_with(config.max_peers, PeerSlot::default);
        Self {
            config: TsmConfig {
                max_transactions: max,
                ..config
            },
            current_invoke_id: 0,
            slots,
            peers,
        }
    }

    pub fn config(&self) -> &TsmConfig {
        &self.config
    }

    /// Number of free slots
    pub fn idle_count(&self) -> usize {
        self.slots.iter().filter(|s| s.invoke_id == 0).count()
    }

    /// Slot index for an active invoke id.
    /// A transaction is active when `slots[id - 1].invoke_id == id`.
    fn find_index(&self, invoke_id: u8) -> Option<usize> {
        if invoke_id == 0 {
            return None;
        }
        let index = (self.slots.len() + invoke_id as usize - 1) % self.slots.len();
        if self.slots[index].invoke_id == invoke_id {
            Some(index)
        } else {
            None
        }
    }

    fn allocate_first_free(&mut self, hint: u8) -> Option<usize> {
        let n = self.slots.len();
        let start = (hint as usize).saturating_sub(1);
        for offset in 0..n {
            let index = (start + offset) % n;
            if self.slots[index].invoke_id == 0 {
                let slot = &mut self.slots[index];
                *slot = TransactionSlot {
                    invoke_id: (index + 1) as u8,
                    state: TsmState::Allocated,
                    ..TransactionSlot::default()
                };
                return Some(index);
            }
        }
        None
    }

    /// Allocate the next free invoke id, reserving its slot.
    ///
    /// Candidates advance by one per call, modulo the table size with 0
    /// skipped. Fails when every slot is taken; a blocking embedding can
    /// wait and retry.
    pub fn next_free_invoke_id(&mut self) -> Result<u8> {
        for _ in 0..self.slots.len() {
            self.current_invoke_id =
                (self.current_invoke_id % self.slots.len() as u8).wrapping_add(1);
            if let Some(index) = self.allocate_first_free(self.current_invoke_id) {
                let slot = &mut self.slots[index];
                slot.state = TsmState::Idle;
                slot.request_timer = self.config.apdu_timeout_ms;
                log::trace!("tsm: allocated invoke id {}", slot.invoke_id);
                return Ok(slot.invoke_id);
            }
        }
        Err(TransactionError::TableFull)
    }

    // ---------------------------------------------------------------------
    // Peer indirection
    // ---------------------------------------------------------------------

    /// Map (peer address, peer invoke id) to our internal invoke id,
    /// optionally creating the mapping and its slot.
    fn peer_internal_id(
        &mut self,
        src: &BacnetAddress,
        peer_invoke_id: u8,
        create: bool,
    ) -> Option<u8> {
        let mut free_index = None;
        for (index, peer) in self.peers.iter().enumerate() {
            if peer.internal_invoke_id != 0 {
                if peer.peer_invoke_id == peer_invoke_id && peer.peer_address.matches(src) {
                    return Some(peer.internal_invoke_id);
                }
            } else if free_index.is_none() {
                free_index = Some(index);
            }
        }

        if !create {
            return None;
        }
        let free_index = free_index?;
        let internal = self.next_free_invoke_id().ok()?;
        let slot_index = self.find_index(internal)?;
        self.slots[slot_index].dest = src.clone();
        self.peers[free_index] = PeerSlot {
            internal_invoke_id: internal,
            peer_invoke_id,
            peer_address: src.clone(),
        };
        Some(internal)
    }

    fn clear_peer(&mut self, internal_invoke_id: u8) {
        for peer in self.peers.iter_mut() {
            if peer.internal_invoke_id == internal_invoke_id {
                peer.internal_invoke_id = 0;
            }
        }
    }

    /// The peer invoke id our internal transaction answers, if any
    fn peer_invoke_for(&self, internal_invoke_id: u8) -> Option<u8> {
        self.peers
            .iter()
            .find(|p| p.internal_invoke_id == internal_invoke_id)
            .map(|p| p.peer_invoke_id)
    }

    // ---------------------------------------------------------------------
    // Capability arithmetic
    // ---------------------------------------------------------------------

    /// Compute what we may send to `dest`: the per-APDU maximum and the
    /// total transmittable length. Replying to a confirmed request uses the
    /// request's own parameters; originating a request uses the address
    /// cache, falling back to local defaults for unbound peers.
    pub fn transmittable_length(
        &self,
        addresses: Option<&AddressCache>,
        dest: &BacnetAddress,
        reply_to: Option<&ConfirmedRequestInfo>,
    ) -> (u32, u32) {
        let local_max = self.config.max_apdu as u32;
        let local_segments = self.config.max_segments_accepted;

        if let Some(info) = reply_to {
            let apdu_max = (info.max_response as u32).min(local_max);
            if !info.segmented_response_accepted {
                return (apdu_max, apdu_max);
            }
            let segments = info
                .max_segments
                .count()
                .unwrap_or(local_segments)
                .min(local_segments);
            return (apdu_max, apdu_max * segments.max(1));
        }

        if let Some(addresses) = addresses {
            if let Some(device_id) = addresses.get_device_id(dest) {
                if let Some(binding) = addresses.get_by_device(device_id) {
                    let apdu_max = (binding.max_apdu as u32).min(local_max);
                    if binding.segmentation.can_receive() {
                        let segments = if binding.max_segments == 0 {
                            local_segments
                        } else {
                            binding.max_segments.min(local_segments)
                        };
                        return (apdu_max, apdu_max * segments.max(1));
                    }
                    return (apdu_max, apdu_max);
                }
            }
        }

        (local_max, local_max * local_segments)
    }

    // ---------------------------------------------------------------------
    // Segmentation arithmetic
    // ---------------------------------------------------------------------

    fn segment_count(slot: &TransactionSlot) -> u32 {
        let header = match &slot.header {
            Some(header) => header,
            None => return 1,
        };
        let unsegmented_header = header.size(false) as u32;
        let body = slot.request.len() as u32;
        if unsegmented_header + body <= slot.apdu_maximum_length {
            return 1;
        }
        let segment_header = header.size(true) as u32;
        let per_segment = slot.apdu_maximum_length.saturating_sub(segment_header).max(1);
        ((body - 1) / per_segment) + 1
    }

    fn segment_payload(slot: &TransactionSlot, segment_number: u32) -> &[u8] {
        let header = slot.header.as_ref().expect("segmenting slot has header");
        let segmented = Self::segment_count(slot) > 1;
        let per_segment = slot
            .apdu_maximum_length
            .saturating_sub(header.size(segmented) as u32)
            .max(1) as usize;
        let start = (segment_number as usize) * per_segment;
        let end = (start + per_segment).min(slot.request.len());
        &slot.request[start.min(slot.request.len())..end]
    }

    /// In-window test: `(seq - initial) mod 256 < actual window size`
    fn in_window(slot: &TransactionSlot, sequence_number: u8) -> bool {
        sequence_number.wrapping_sub(slot.initial_sequence_number as u8)
            < slot.actual_window_size
    }

    /// Duplicate test: `(seq - initial) mod 256 <= (last - initial) mod 256`
    fn duplicate_in_window(slot: &TransactionSlot, sequence_number: u8) -> bool {
        let initial = slot.initial_sequence_number as u8;
        sequence_number.wrapping_sub(initial)
            <= slot.last_sequence_number.wrapping_sub(initial)
    }

    fn send_segment(
        slot: &mut TransactionSlot,
        link: &mut dyn DataLink,
        segment_number: u32,
    ) -> Result<usize> {
        let total = Self::segment_count(slot);
        if segment_number >= total {
            return Err(TransactionError::InvalidInvokeId);
        }
        let segmented = total > 1;
        {
            let header = slot.header.as_mut().ok_or(TransactionError::Encoding)?;
            header.segmented = segmented;
            if segmented {
                header.more_follows = segment_number < total - 1;
                header.sequence_number = segment_number as u8;
            } else {
                header.more_follows = false;
            }
        }

        let mut pdu = slot.npdu.encode();
        slot.header
            .as_ref()
            .expect("checked above")
            .encode(&mut pdu)
            .map_err(|_| TransactionError::Encoding)?;
        let payload = Self::segment_payload(slot, segment_number).to_vec();
        pdu.extend_from_slice(&payload);

        link.send_pdu(&slot.dest, slot.npdu.expecting_reply, &pdu)
            .map_err(|_| TransactionError::SendFailed)
    }

    /// Transmit up to a window of segments starting at `sequence_number`
    fn fill_window(slot: &mut TransactionSlot, link: &mut dyn DataLink, sequence_number: u32) {
        let total = Self::segment_count(slot);
        let mut sent = 0;
        while sent < slot.actual_window_size as u32 && sequence_number + sent < total {
            let _ = Self::send_segment(slot, link, sequence_number + sent);
            sent += 1;
        }
        if sequence_number + sent >= total {
            slot.sent_all_segments = true;
        }
    }

    // ---------------------------------------------------------------------
    // Originating transactions
    // ---------------------------------------------------------------------

    /// Describe and transmit a confirmed request under an allocated invoke
    /// id. Chooses unsegmented or segmented transmission from the body
    /// length and the peer's capabilities.
    pub fn set_confirmed_transaction(
        &mut self,
        link: &mut dyn DataLink,
        addresses: Option<&AddressCache>,
        invoke_id: u8,
        dest: &BacnetAddress,
        npdu: Npdu,
        header: ApduFixedHeader,
        body: &[u8],
    ) -> Result<()> {
        let index = self
            .find_index(invoke_id)
            .ok_or(TransactionError::InvalidInvokeId)?;
        let (apdu_max, total_max) = self.transmittable_length(addresses, dest, None);

        let slot = &mut self.slots[index];
        slot.apdu_maximum_length = apdu_max;
        slot.max_transmittable = total_max;
        slot.request = body.to_vec();
        slot.npdu = npdu;
        slot.header = Some(header);
        slot.dest = dest.clone();
        slot.retry_count = self.config.apdu_retries;
        slot.actual_window_size = 1;
        slot.proposed_window_size = self.config.proposed_window_size;
        slot.initial_sequence_number = 0;
        slot.sent_all_segments = false;

        let segments = Self::segment_count(slot);
        let outcome = if segments == 1 {
            slot.state = TsmState::AwaitConfirmation;
            slot.request_timer = self.config.apdu_timeout_ms;
            Self::send_segment(slot, link, 0).map(|_| ())
        } else {
            let segment_header = slot
                .header
                .as_ref()
                .expect("just set")
                .size(true) as u32;
            if body.len() as u32 + segments * segment_header > slot.max_transmittable {
                Err(TransactionError::PayloadExceedsPeerCapacity)
            } else {
                let header = slot.header.as_mut().expect("just set");
                header.proposed_window_size = slot.proposed_window_size;
                slot.state = TsmState::SegmentedRequestClient;
                slot.segment_retry_count = self.config.apdu_retries;
                slot.request_timer = 0;
                slot.segment_timer = self.config.apdu_segment_timeout_ms;
                log::debug!(
                    "tsm: invoke {} segmented request, {} segments",
                    invoke_id,
                    segments
                );
                Self::send_segment(slot, link, 0).map(|_| ())
            }
        };

        if let Err(error) = outcome {
            // fail fast: do not leave the caller waiting on a timeout
            self.free_invoke_id(invoke_id, Some(dest), true);
            return Err(error);
        }
        Ok(())
    }

    /// Transmit a complex ack answering the peer's confirmed request.
    /// Unsegmented acks release the transaction immediately; segmented acks
    /// enter `SegmentedResponseServer`.
    pub fn set_complexack_transaction(
        &mut self,
        link: &mut dyn DataLink,
        dest: &BacnetAddress,
        npdu: Npdu,
        header: ApduFixedHeader,
        reply_to: &ConfirmedRequestInfo,
        body: &[u8],
    ) -> Result<()> {
        let internal = match self.peer_internal_id(dest, reply_to.invoke_id, true) {
            Some(internal) => internal,
            None => {
                send_abort(
                    link,
                    dest,
                    reply_to.invoke_id,
                    AbortReason::PreemptedByHigherPriorityTask,
                    true,
                );
                return Err(TransactionError::TableFull);
            }
        };
        let index = match self.find_index(internal) {
            Some(index) => index,
            None => {
                send_abort(link, dest, reply_to.invoke_id, AbortReason::Other, true);
                return Err(TransactionError::InvalidInvokeId);
            }
        };
        let (apdu_max, total_max) = self.transmittable_length(None, dest, Some(reply_to));

        let slot = &mut self.slots[index];
        slot.apdu_maximum_length = apdu_max;
        slot.max_transmittable = total_max;
        slot.request = body.to_vec();
        slot.npdu = npdu;
        slot.header = Some(header);
        slot.dest = dest.clone();
        slot.retry_count = self.config.apdu_retries;
        slot.actual_window_size = 1;
        slot.proposed_window_size = self.config.proposed_window_size;
        slot.initial_sequence_number = 0;
        slot.sent_all_segments = false;

        let segments = Self::segment_count(slot);
        if segments == 1 {
            let sent = Self::send_segment(slot, link, 0);
            self.free_invoke_id(internal, Some(dest), true);
            return sent.map(|_| ()).map_err(|_| TransactionError::SendFailed);
        }

        let segment_header = slot.header.as_ref().expect("just set").size(true) as u32;
        if body.len() as u32 + segments * segment_header > slot.max_transmittable {
            self.free_invoke_id(internal, Some(dest), true);
            return Err(TransactionError::PayloadExceedsPeerCapacity);
        }
        let header = slot.header.as_mut().expect("just set");
        header.proposed_window_size = slot.proposed_window_size;
        slot.state = TsmState::SegmentedResponseServer;
        slot.segment_retry_count = self.config.apdu_retries;
        slot.request_timer = 0;
        slot.segment_timer = self.config.apdu_segment_timeout_ms;
        let outcome = Self::send_segment(slot, link, 0);
        if outcome.is_err() {
            self.free_invoke_id(internal, Some(dest), true);
            return Err(TransactionError::SendFailed);
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Inbound PDUs
    // ---------------------------------------------------------------------

    /// A Segment-Ack arrived. `server` is the ack's server bit: true means
    /// the ack came from the serving peer (we are the client).
    pub fn segment_ack_received(
        &mut self,
        link: &mut dyn DataLink,
        invoke_id: u8,
        sequence_number: u8,
        actual_window_size: u8,
        _negative: bool,
        server: bool,
        src: &BacnetAddress,
    ) {
        let internal = if server {
            if invoke_id == 0 {
                return;
            }
            invoke_id
        } else {
            match self.peer_internal_id(src, invoke_id, false) {
                Some(internal) => internal,
                None => return,
            }
        };
        let index = match self.find_index(internal) {
            Some(index) => index,
            None => return,
        };

        let expected_state = if server {
            TsmState::SegmentedRequestClient
        } else {
            TsmState::SegmentedResponseServer
        };
        if self.slots[index].state != expected_state {
            return;
        }

        if !Self::in_window(&self.slots[index], sequence_number) {
            // duplicate ack: restart the timer, nothing else
            self.slots[index].segment_timer = self.config.apdu_segment_timeout_ms;
            return;
        }

        let slot = &mut self.slots[index];
        let window = sequence_number.wrapping_sub(slot.initial_sequence_number as u8) as u32;
        let acknowledged = slot.initial_sequence_number + window;
        let remaining = acknowledged + 1 < Self::segment_count(slot);

        if remaining {
            slot.initial_sequence_number = acknowledged + 1;
            slot.actual_window_size = actual_window_size;
            slot.segment_retry_count = self.config.apdu_retries;
            slot.segment_timer = self.config.apdu_segment_timeout_ms;
            let base = slot.initial_sequence_number;
            Self::fill_window(slot, link, base);
            slot.segment_timer = self.config.apdu_segment_timeout_ms;
        } else {
            slot.segment_timer = 0;
            slot.sent_all_segments = true;
            if slot.state == TsmState::SegmentedResponseServer {
                // final ack for our response: the transaction is over
                self.free_invoke_id(internal, None, true);
            } else {
                // final ack for our request: now wait for the reply proper
                slot.request_timer = self.config.apdu_timeout_ms;
                slot.state = TsmState::AwaitConfirmation;
            }
        }
    }

    /// May an unsegmented SimpleAck/ComplexAck for `invoke_id` be accepted?
    /// Sends the required Abort and reports false otherwise.
    pub fn confirmation_acceptable(
        &mut self,
        link: &mut dyn DataLink,
        invoke_id: u8,
        src: &BacnetAddress,
    ) -> bool {
        let acceptable = self.find_index(invoke_id).is_some_and(|index| {
            let slot = &self.slots[index];
            slot.state == TsmState::AwaitConfirmation
                || (slot.state == TsmState::SegmentedRequestClient && slot.sent_all_segments)
        });
        if !acceptable {
            send_abort(link, src, invoke_id, AbortReason::InvalidApduInThisState, false);
        }
        acceptable
    }

    /// Shared reassembly for both directions. `server` selects the ack
    /// server bit and the freeing discipline on failure.
    #[allow(clippy::too_many_arguments)]
    fn reassemble(
        &mut self,
        link: &mut dyn DataLink,
        index: usize,
        src: &BacnetAddress,
        peer_invoke_id: u8,
        sequence_number: u8,
        more_follows: bool,
        payload: &[u8],
        server: bool,
    ) -> Reassembly {
        let timeout = self.config.apdu_segment_timeout_ms * 4;
        let max_segments = self.config.max_segments_accepted;
        let slot = &mut self.slots[index];

        slot.request_timer = 0;
        slot.segment_timer = timeout;

        if sequence_number != slot.last_sequence_number.wrapping_add(1) {
            if Self::duplicate_in_window(slot, sequence_number) {
                // tolerate up to a window of duplicates silently
                slot.duplicate_count += 1;
                if slot.duplicate_count > slot.actual_window_size {
                    slot.duplicate_count = 0;
                    send_segment_ack(
                        link,
                        src,
                        true,
                        server,
                        peer_invoke_id,
                        slot.last_sequence_number,
                        slot.actual_window_size,
                    );
                }
            } else {
                // a gap: point the sender back at the last good segment
                send_segment_ack(
                    link,
                    src,
                    true,
                    server,
                    peer_invoke_id,
                    slot.last_sequence_number,
                    slot.actual_window_size,
                );
            }
            return Reassembly::Incomplete;
        }

        slot.received_segments += 1;
        if slot.received_segments > max_segments {
            slot.clear_blobs();
            slot.state = TsmState::Idle;
            let internal = slot.invoke_id;
            send_abort(link, src, peer_invoke_id, AbortReason::BufferOverflow, server);
            if server {
                self.free_invoke_id(internal, None, true);
                self.clear_peer(internal);
            }
            return Reassembly::Failed;
        }

        slot.last_sequence_number = sequence_number;
        slot.duplicate_count = 0;
        slot.reassembly.extend_from_slice(payload);

        let mut ack_needed = false;
        let window_end = (slot.initial_sequence_number as u8)
            .wrapping_add(slot.actual_window_size);
        if sequence_number == window_end {
            ack_needed = true;
            slot.initial_sequence_number = sequence_number as u32;
        }

        let mut complete = None;
        if !more_follows {
            complete = Some(core::mem::take(&mut slot.reassembly));
            ack_needed = true;
        }

        if ack_needed {
            send_segment_ack(
                link,
                src,
                false,
                server,
                peer_invoke_id,
                slot.last_sequence_number,
                slot.actual_window_size,
            );
        }

        match complete {
            Some(data) => Reassembly::Complete(data),
            None => Reassembly::Incomplete,
        }
    }

    fn begin_reassembly(
        &mut self,
        link: &mut dyn DataLink,
        index: usize,
        src: &BacnetAddress,
        peer_invoke_id: u8,
        sequence_number: u8,
        proposed_window_size: u8,
        payload: &[u8],
        server: bool,
    ) -> Reassembly {
        let timeout = self.config.apdu_segment_timeout_ms * 4;
        {
            let slot = &mut self.slots[index];
            slot.state = if server {
                TsmState::SegmentedRequestServer
            } else {
                TsmState::SegmentedConfirmation
            };
            // the proposed window is accepted as offered
            slot.actual_window_size = proposed_window_size;
            slot.proposed_window_size = proposed_window_size;
            slot.initial_sequence_number = 0;
            slot.last_sequence_number = 0;
            slot.retry_count = 0;
            slot.segment_retry_count = 0;
            slot.duplicate_count = 0;
            slot.received_segments = 1;
            slot.request_timer = 0;
            slot.segment_timer = timeout;
            slot.reassembly.clear();
        }

        if sequence_number != 0 {
            // the first segment of a transfer must be segment zero
            send_abort(
                link,
                src,
                peer_invoke_id,
                AbortReason::InvalidApduInThisState,
                server,
            );
            let slot = &mut self.slots[index];
            slot.clear_blobs();
            slot.state = TsmState::Idle;
            if server {
                let internal = slot.invoke_id;
                self.free_invoke_id(internal, None, true);
                self.clear_peer(internal);
            }
            return Reassembly::Failed;
        }

        let slot = &mut self.slots[index];
        slot.reassembly.extend_from_slice(payload);
        send_segment_ack(
            link,
            src,
            false,
            server,
            peer_invoke_id,
            slot.last_sequence_number,
            slot.actual_window_size,
        );
        Reassembly::Incomplete
    }

    /// A segment of a confirmed request arrived (we are the server).
    /// On completion, the internal invoke id and the reassembled body are
    /// returned; the transaction stays alive for the reply.
    pub fn segmented_request_received(
        &mut self,
        link: &mut dyn DataLink,
        src: &BacnetAddress,
        info: &ConfirmedRequestInfo,
        payload: &[u8],
    ) -> (u8, Reassembly) {
        let internal = match self.peer_internal_id(src, info.invoke_id, true) {
            Some(internal) => internal,
            None => {
                send_abort(
                    link,
                    src,
                    info.invoke_id,
                    AbortReason::PreemptedByHigherPriorityTask,
                    true,
                );
                return (0, Reassembly::Failed);
            }
        };
        let index = match self.find_index(internal) {
            Some(index) => index,
            None => {
                send_abort(link, src, info.invoke_id, AbortReason::Other, true);
                return (0, Reassembly::Failed);
            }
        };

        let result = match self.slots[index].state {
            // a fresh slot never lingers in Idle
            TsmState::Idle | TsmState::Allocated => self.begin_reassembly(
                link,
                index,
                src,
                info.invoke_id,
                info.sequence_number,
                info.proposed_window_size,
                payload,
                true,
            ),
            TsmState::SegmentedRequestServer => self.reassemble(
                link,
                index,
                src,
                info.invoke_id,
                info.sequence_number,
                info.more_follows,
                payload,
                true,
            ),
            _ => {
                send_abort(
                    link,
                    src,
                    info.invoke_id,
                    AbortReason::InvalidApduInThisState,
                    true,
                );
                Reassembly::Failed
            }
        };
        (internal, result)
    }

    /// A segment of a complex ack arrived (we are the client)
    pub fn segmented_complexack_received(
        &mut self,
        link: &mut dyn DataLink,
        src: &BacnetAddress,
        info: &ComplexAckInfo,
        payload: &[u8],
    ) -> Reassembly {
        if info.invoke_id == 0 {
            return Reassembly::Failed;
        }
        let index = match self.find_index(info.invoke_id) {
            Some(index) => index,
            None => return Reassembly::Failed,
        };

        match self.slots[index].state {
            // first segment of the reply to an unsegmented request
            TsmState::AwaitConfirmation => self.begin_reassembly(
                link,
                index,
                src,
                info.invoke_id,
                info.sequence_number,
                info.proposed_window_size,
                payload,
                false,
            ),
            // continuation segments
            TsmState::SegmentedConfirmation => self.reassemble(
                link,
                index,
                src,
                info.invoke_id,
                info.sequence_number,
                info.more_follows,
                payload,
                false,
            ),
            // reply racing the tail of our segmented request
            TsmState::SegmentedRequestClient => {
                if self.slots[index].sent_all_segments {
                    self.begin_reassembly(
                        link,
                        index,
                        src,
                        info.invoke_id,
                        info.sequence_number,
                        info.proposed_window_size,
                        payload,
                        false,
                    )
                } else {
                    send_abort(
                        link,
                        src,
                        info.invoke_id,
                        AbortReason::InvalidApduInThisState,
                        false,
                    );
                    Reassembly::Failed
                }
            }
            _ => {
                send_abort(
                    link,
                    src,
                    info.invoke_id,
                    AbortReason::InvalidApduInThisState,
                    false,
                );
                Reassembly::Failed
            }
        }
    }

    /// An Error PDU arrived for one of our invoke ids
    pub fn error_received(&mut self, link: &mut dyn DataLink, invoke_id: u8, src: &BacnetAddress) {
        self.abort_mid_request(link, invoke_id, src);
    }

    /// A Reject PDU arrived for one of our invoke ids
    pub fn reject_received(&mut self, link: &mut dyn DataLink, invoke_id: u8, src: &BacnetAddress) {
        self.abort_mid_request(link, invoke_id, src);
    }

    /// An Abort PDU arrived for one of our invoke ids
    pub fn abort_received(&mut self, link: &mut dyn DataLink, invoke_id: u8, src: &BacnetAddress) {
        self.abort_mid_request(link, invoke_id, src);
    }

    /// Clause 5.4.4.3: a peer that kills a segmented request we are still
    /// transmitting gets an explicit client Abort back, for observability.
    fn abort_mid_request(&mut self, link: &mut dyn DataLink, invoke_id: u8, src: &BacnetAddress) {
        if let Some(index) = self.find_index(invoke_id) {
            let slot = &self.slots[index];
            if slot.state == TsmState::SegmentedRequestClient && !slot.sent_all_segments {
                send_abort(link, src, invoke_id, AbortReason::InvalidApduInThisState, false);
            }
        }
    }

    // ---------------------------------------------------------------------
    // Timers
    // ---------------------------------------------------------------------

    /// Advance every active transaction by `milliseconds`
    pub fn timer_milliseconds(&mut self, link: &mut dyn DataLink, milliseconds: u32) {
        for index in 0..self.slots.len() {
            match self.slots[index].state {
                TsmState::AwaitConfirmation => {
                    let slot = &mut self.slots[index];
                    slot.request_timer = slot.request_timer.saturating_sub(milliseconds);
                    if slot.request_timer == 0 {
                        slot.retry_count = slot.retry_count.saturating_sub(1);
                        slot.request_timer = self.config.apdu_timeout_ms;
                        if slot.retry_count > 0 {
                            if Self::segment_count(slot) > 1 {
                                // start the segmented transmission over
                                slot.state = TsmState::SegmentedRequestClient;
                                slot.segment_retry_count = self.config.apdu_retries;
                                slot.request_timer = 0;
                                slot.segment_timer = self.config.apdu_segment_timeout_ms;
                                slot.initial_sequence_number = 0;
                                slot.actual_window_size = 1;
                                slot.sent_all_segments = false;
                            }
                            let _ = Self::send_segment(slot, link, 0);
                        } else {
                            // invoke id kept: Idle plus a nonzero id marks
                            // a failed transaction for the caller
                            log::debug!(
                                "tsm: invoke {} timed out awaiting confirmation",
                                slot.invoke_id
                            );
                            slot.state = TsmState::Idle;
                        }
                    }
                }

                TsmState::SegmentedConfirmation => {
                    let slot = &mut self.slots[index];
                    slot.segment_timer = slot.segment_timer.saturating_sub(milliseconds);
                    if slot.segment_timer == 0 {
                        slot.state = TsmState::Idle;
                        slot.clear_blobs();
                    }
                }

                TsmState::SegmentedRequestClient => {
                    let slot = &mut self.slots[index];
                    slot.segment_timer = slot.segment_timer.saturating_sub(milliseconds);
                    if slot.segment_timer == 0 {
                        slot.segment_retry_count = slot.segment_retry_count.saturating_sub(1);
                        slot.segment_timer = self.config.apdu_segment_timeout_ms;
                        if slot.segment_retry_count > 0 {
                            let base = slot.initial_sequence_number;
                            Self::fill_window(slot, link, base);
                        } else {
                            slot.state = TsmState::Idle;
                        }
                    }
                }

                TsmState::SegmentedResponseServer => {
                    let slot = &mut self.slots[index];
                    slot.segment_timer = slot.segment_timer.saturating_sub(milliseconds);
                    if slot.segment_timer == 0 {
                        slot.segment_retry_count = slot.segment_retry_count.saturating_sub(1);
                        slot.segment_timer = self.config.apdu_segment_timeout_ms;
                        if slot.segment_retry_count > 0 {
                            let base = slot.initial_sequence_number;
                            Self::fill_window(slot, link, base);
                        } else {
                            let internal = slot.invoke_id;
                            self.free_invoke_id(internal, None, true);
                        }
                    }
                }

                TsmState::SegmentedRequestServer => {
                    let slot = &mut self.slots[index];
                    slot.segment_timer = slot.segment_timer.saturating_sub(milliseconds);
                    if slot.segment_timer == 0 {
                        // the sender went away: release everything
                        let internal = slot.invoke_id;
                        self.clear_peer(internal);
                        let slot = &mut self.slots[index];
                        slot.clear_blobs();
                        slot.invoke_id = 0;
                        slot.state = TsmState::Idle;
                    }
                }

                _ => {}
            }
        }
    }

    // ---------------------------------------------------------------------
    // Lifecycle queries
    // ---------------------------------------------------------------------

    /// Release an invoke id. With a peer address given, the release only
    /// happens if the slot's destination matches (guards against injected
    /// PDUs freeing foreign transactions).
    pub fn free_invoke_id(
        &mut self,
        invoke_id: u8,
        peer: Option<&BacnetAddress>,
        cleanup: bool,
    ) {
        if let Some(index) = self.find_index(invoke_id) {
            let matches = peer
                .map(|peer| peer.matches(&self.slots[index].dest))
                .unwrap_or(true);
            if matches {
                self.clear_peer(invoke_id);
                let slot = &mut self.slots[index];
                slot.state = TsmState::Idle;
                slot.invoke_id = 0;
                if cleanup {
                    slot.clear_blobs();
                }
                log::trace!("tsm: freed invoke id {}", invoke_id);
            } else {
                log::debug!(
                    "tsm: not freeing invoke id {}: peer address mismatch",
                    invoke_id
                );
            }
        }
    }

    /// Has this invoke id been released?
    pub fn invoke_id_free(&self, invoke_id: u8) -> bool {
        self.find_index(invoke_id).is_none()
    }

    /// Did this transaction fail to confirm? (Idle with its invoke id
    /// still set.)
    pub fn invoke_id_failed(&self, invoke_id: u8) -> bool {
        self.find_index(invoke_id)
            .map(|index| self.slots[index].state == TsmState::Idle)
            .unwrap_or(false)
    }

    /// Milliseconds left on the governing timer of this transaction
    pub fn invoke_id_timing(&self, invoke_id: u8) -> u32 {
        self.find_index(invoke_id)
            .map(|index| {
                let slot = &self.slots[index];
                match slot.state {
                    TsmState::AwaitConfirmation => slot.request_timer,
                    TsmState::SegmentedRequestClient
                    | TsmState::SegmentedResponseServer
                    | TsmState::SegmentedRequestServer
                    | TsmState::SegmentedConfirmation => slot.segment_timer,
                    _ => 0,
                }
            })
            .unwrap_or(0)
    }

    /// The state of an invoke id, if active (primarily for diagnostics)
    pub fn state_of(&self, invoke_id: u8) -> Option<TsmState> {
        self.find_index(invoke_id).map(|index| self.slots[index].state)
    }

    /// The peer invoke id behind one of our internal server transactions
    pub fn peer_invoke_id(&self, internal_invoke_id: u8) -> Option<u8> {
        self.peer_invoke_for(internal_invoke_id)
    }
}
