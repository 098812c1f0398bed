//! BACnet MS/TP (Master-Slave/Token-Passing) Data Link Implementation
//!
//! MS/TP (ASHRAE 135 clause 9) provides multi-drop, half-duplex
//! communication over EIA-485. Bus access is controlled by a token passed
//! between master nodes; a master holding the token may transmit a bounded
//! number of information frames and must then pass the token on.
//!
//! The implementation has three layers:
//!
//! - [`Frame`]: the frame codec with the Annex G CRC-8 header CRC and
//!   CRC-16 data CRC;
//! - the byte-driven receive state machine
//!   (idle / preamble / header / header-crc / data / data-crc / skip-data),
//!   advanced one octet at a time from the [`MstpDriver`];
//! - the master-node state machine (token passing, poll-for-master
//!   discovery, reply handling) in [`MstpPort`].
//!
//! # Frame Format
//!
//! ```text
//! 55 FF | frame type (1) | dest (1) | source (1) | length (2 BE) |
//! header CRC (1) | [ data (length) | data CRC (2, LSB first) ]
//! ```
//!
//! A frame with a corrupted header or data CRC raises the
//! received-invalid-frame flag and returns the receiver to idle without
//! disturbing any previously accepted frame.

#[cfg(feature = "std")]
use std::collections::VecDeque;

#[cfg(not(feature = "std"))]
use alloc::{collections::VecDeque, vec::Vec};

use core::time::Duration;

use crate::datalink::{DataLink, DataLinkError, DataLinkType, MstpDriver, Result};
use crate::network::{BacnetAddress, Npdu};
use crate::app::PduType;
use crate::util::{crc_calc_data, crc_calc_header, crc16_mstp, crc8_mstp_header, CRC16_GOOD, CRC8_GOOD};

/// MS/TP frame preamble bytes
pub const MSTP_PREAMBLE_55: u8 = 0x55;
pub const MSTP_PREAMBLE_FF: u8 = 0xFF;

/// Broadcast station address
pub const MSTP_BROADCAST: u8 = 255;

/// Maximum NPDU length carried in one MS/TP frame
pub const MSTP_MAX_DATA_LENGTH: usize = 501;

/// Frame size up to and including the header CRC
pub const MSTP_HEADER_SIZE: usize = 8;

/// Largest complete frame on the wire
pub const MSTP_MAX_FRAME_SIZE: usize = MSTP_HEADER_SIZE + MSTP_MAX_DATA_LENGTH + 2;

/// Lost-token silence threshold, clause 9.5.3 (milliseconds)
pub const T_NO_TOKEN: u32 = 500;

/// Wait for a passed token to be used before retrying (milliseconds)
pub const T_USAGE_TIMEOUT: u32 = 50;

/// Wait for the reply to a data-expecting-reply frame (milliseconds)
pub const T_REPLY_TIMEOUT: u32 = 295;

/// How long we may hold the bus before answering or postponing
pub const T_REPLY_DELAY: u32 = 250;

/// Give up on a partially received frame after this much silence
pub const T_FRAME_ABORT: u32 = 95;

/// Slot width used to stagger lost-token recovery per station
pub const T_SLOT: u32 = 10;

/// Token usages between poll-for-master scans
pub const N_POLL: u32 = 50;

/// Token pass retries before hunting for a new successor
pub const N_RETRY_TOKEN: u8 = 1;

/// MS/TP frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Token = 0,
    PollForMaster = 1,
    ReplyToPollForMaster = 2,
    TestRequest = 3,
    TestResponse = 4,
    DataExpectingReply = 5,
    DataNotExpectingReply = 6,
    ReplyPostponed = 7,
}

impl FrameType {
    /// Convert from the raw frame type octet
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Token),
            1 => Some(Self::PollForMaster),
            2 => Some(Self::ReplyToPollForMaster),
            3 => Some(Self::TestRequest),
            4 => Some(Self::TestResponse),
            5 => Some(Self::DataExpectingReply),
            6 => Some(Self::DataNotExpectingReply),
            7 => Some(Self::ReplyPostponed),
            _ => None,
        }
    }
}

/// A complete MS/TP frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub destination: u8,
    pub source: u8,
    pub data: Vec<u8>,
}

impl Frame {
    /// Create a new frame; fails if the data exceeds one frame
    pub fn new(frame_type: FrameType, destination: u8, source: u8, data: Vec<u8>) -> Result<Self> {
        if data.len() > MSTP_MAX_DATA_LENGTH {
            return Err(DataLinkError::FrameTooLarge);
        }
        Ok(Self {
            frame_type,
            destination,
            source,
            data,
        })
    }

    /// Create a token frame
    pub fn token(destination: u8, source: u8) -> Self {
        Self {
            frame_type: FrameType::Token,
            destination,
            source,
            data: Vec::new(),
        }
    }

    /// Create a poll-for-master frame
    pub fn poll_for_master(destination: u8, source: u8) -> Self {
        Self {
            frame_type: FrameType::PollForMaster,
            destination,
            source,
            data: Vec::new(),
        }
    }

    /// Encode to wire octets, computing both CRCs
    pub fn encode(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(MSTP_HEADER_SIZE + self.data.len() + 2);
        frame.push(MSTP_PREAMBLE_55);
        frame.push(MSTP_PREAMBLE_FF);

        let length = self.data.len() as u16;
        let header = [
            self.frame_type as u8,
            self.destination,
            self.source,
            (length >> 8) as u8,
            (length & 0xFF) as u8,
        ];
        frame.extend_from_slice(&header);
        frame.push(crc8_mstp_header(&header));

        if !self.data.is_empty() {
            frame.extend_from_slice(&self.data);
            let crc = crc16_mstp(&self.data);
            // data CRC is transmitted LSB first
            frame.push((crc & 0xFF) as u8);
            frame.push((crc >> 8) as u8);
        }

        frame
    }

    /// Decode a complete frame, verifying both CRCs
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < MSTP_HEADER_SIZE {
            return Err(DataLinkError::InvalidFrame);
        }
        if data[0] != MSTP_PREAMBLE_55 || data[1] != MSTP_PREAMBLE_FF {
            return Err(DataLinkError::InvalidFrame);
        }

        let frame_type = FrameType::from_u8(data[2]).ok_or(DataLinkError::InvalidFrame)?;
        let destination = data[3];
        let source = data[4];
        let length = ((data[5] as u16) << 8) | (data[6] as u16);

        if crc8_mstp_header(&data[2..7]) != data[7] {
            return Err(DataLinkError::CrcError);
        }

        if length as usize > MSTP_MAX_DATA_LENGTH {
            return Err(DataLinkError::InvalidFrame);
        }
        let expected = MSTP_HEADER_SIZE + length as usize + if length > 0 { 2 } else { 0 };
        if data.len() != expected {
            return Err(DataLinkError::InvalidFrame);
        }

        let frame_data = if length > 0 {
            let payload = &data[MSTP_HEADER_SIZE..MSTP_HEADER_SIZE + length as usize];
            let crc_low = data[MSTP_HEADER_SIZE + length as usize];
            let crc_high = data[MSTP_HEADER_SIZE + length as usize + 1];
            let wire_crc = ((crc_high as u16) << 8) | crc_low as u16;
            if crc16_mstp(payload) != wire_crc {
                return Err(DataLinkError::CrcError);
            }
            payload.to_vec()
        } else {
            Vec::new()
        };

        Ok(Self {
            frame_type,
            destination,
            source,
            data: frame_data,
        })
    }
}

/// Receive state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveState {
    Idle,
    Preamble,
    Header,
    HeaderCrc,
    Data,
    DataCrc,
    SkipData,
}

/// Master node state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterState {
    Initialize,
    Idle,
    UseToken,
    WaitForReply,
    DoneWithToken,
    PassToken,
    NoToken,
    PollForMaster,
    AnswerDataRequest,
}

/// MS/TP node configuration
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MstpConfig {
    /// This station address (0-127 for a master)
    pub this_station: u8,
    /// Highest master address polled for on this bus
    pub max_master: u8,
    /// Information frames we may send per token
    pub max_info_frames: u8,
}

impl Default for MstpConfig {
    fn default() -> Self {
        Self {
            this_station: 1,
            max_master: 127,
            max_info_frames: 1,
        }
    }
}

/// An NPDU queued for transmission when we hold the token
#[derive(Debug, Clone)]
struct QueuedPdu {
    destination: u8,
    expecting_reply: bool,
    pdu: Vec<u8>,
}

/// An MS/TP master node: receive FSM registers, master FSM registers, and
/// the send/receive queues, over a pluggable byte driver.
pub struct MstpPort<D: MstpDriver> {
    driver: D,
    config: MstpConfig,

    // receive FSM registers
    receive_state: ReceiveState,
    header_crc_register: u8,
    data_crc_register: u16,
    frame_type_octet: u8,
    frame_destination: u8,
    frame_source: u8,
    frame_data_length: u16,
    index: usize,
    input_buffer: Vec<u8>,
    received_valid_frame: bool,
    received_invalid_frame: bool,

    // master FSM registers
    master_state: MasterState,
    next_station: u8,
    poll_station: u8,
    token_count: u32,
    frame_count: u8,
    retry_count: u8,
    sole_master: bool,
    reply_source: u8,

    // stored data-expecting-reply request while answering
    der_request: Vec<u8>,
    der_source: u8,

    send_queue: VecDeque<QueuedPdu>,
    receive_queue: VecDeque<(BacnetAddress, Vec<u8>)>,
}

impl<D: MstpDriver> MstpPort<D> {
    /// Create a master node over the given byte driver
    pub fn new(driver: D, config: MstpConfig) -> Self {
        Self {
            driver,
            config,
            receive_state: ReceiveState::Idle,
            header_crc_register: 0xFF,
            data_crc_register: 0xFFFF,
            frame_type_octet: 0,
            frame_destination: 0,
            frame_source: 0,
            frame_data_length: 0,
            index: 0,
            input_buffer: Vec::with_capacity(MSTP_MAX_DATA_LENGTH),
            received_valid_frame: false,
            received_invalid_frame: false,
            master_state: MasterState::Initialize,
            next_station: 0,
            poll_station: 0,
            token_count: 0,
            frame_count: 0,
            retry_count: 0,
            sole_master: false,
            reply_source: 0,
            der_request: Vec::new(),
            der_source: 0,
            send_queue: VecDeque::new(),
            receive_queue: VecDeque::new(),
        }
    }

    /// The current receive FSM state
    pub fn receive_state(&self) -> ReceiveState {
        self.receive_state
    }

    /// The current master FSM state
    pub fn master_state(&self) -> MasterState {
        self.master_state
    }

    /// The station we pass the token to
    pub fn next_station(&self) -> u8 {
        self.next_station
    }

    /// Are we the only master on the bus?
    pub fn sole_master(&self) -> bool {
        self.sole_master
    }

    /// Access to the underlying driver
    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    /// One full poll cycle: drain available bytes through the receive FSM,
    /// then run the master FSM until it settles.
    pub fn poll(&mut self) {
        while self.receive_fsm() {}
        while self.master_fsm() {}
    }

    fn next_address(&self, address: u8) -> u8 {
        (address + 1) % (self.config.max_master + 1)
    }

    fn send_frame(&mut self, frame_type: FrameType, destination: u8, data: &[u8]) {
        let frame = Frame {
            frame_type,
            destination,
            source: self.config.this_station,
            data: data.to_vec(),
        };
        let bytes = frame.encode();
        self.driver.send(&bytes);
        self.driver.silence_reset();
    }

    // ---------------------------------------------------------------------
    // Receive state machine
    // ---------------------------------------------------------------------

    /// Advance the receive FSM by at most one received octet.
    /// Returns true if an octet was consumed.
    pub fn receive_fsm(&mut self) -> bool {
        // give up on a partial frame after too much line silence
        if self.receive_state != ReceiveState::Idle
            && self.driver.silence_milliseconds() >= T_FRAME_ABORT
        {
            self.received_invalid_frame = true;
            self.receive_state = ReceiveState::Idle;
        }

        let octet = match self.driver.read() {
            Some(octet) => octet,
            None => return false,
        };
        self.driver.silence_reset();

        match self.receive_state {
            ReceiveState::Idle => {
                if octet == MSTP_PREAMBLE_55 {
                    self.receive_state = ReceiveState::Preamble;
                }
            }

            ReceiveState::Preamble => {
                if octet == MSTP_PREAMBLE_FF {
                    self.index = 0;
                    self.header_crc_register = 0xFF;
                    self.receive_state = ReceiveState::Header;
                } else if octet != MSTP_PREAMBLE_55 {
                    self.receive_state = ReceiveState::Idle;
                }
            }

            ReceiveState::Header => {
                self.header_crc_register = crc_calc_header(octet, self.header_crc_register);
                match self.index {
                    0 => self.frame_type_octet = octet,
                    1 => self.frame_destination = octet,
                    2 => self.frame_source = octet,
                    3 => self.frame_data_length = (octet as u16) << 8,
                    4 => self.frame_data_length |= octet as u16,
                    _ => {}
                }
                self.index += 1;
                if self.index == 5 {
                    self.receive_state = ReceiveState::HeaderCrc;
                }
            }

            ReceiveState::HeaderCrc => {
                self.header_crc_register = crc_calc_header(octet, self.header_crc_register);
                if self.header_crc_register != CRC8_GOOD {
                    self.received_invalid_frame = true;
                    self.receive_state = ReceiveState::Idle;
                } else if self.frame_data_length == 0 {
                    self.received_valid_frame = true;
                    self.input_buffer.clear();
                    self.receive_state = ReceiveState::Idle;
                } else if self.frame_data_length as usize > MSTP_MAX_DATA_LENGTH {
                    self.index = 0;
                    self.receive_state = ReceiveState::SkipData;
                } else {
                    self.index = 0;
                    self.data_crc_register = 0xFFFF;
                    self.input_buffer.clear();
                    self.receive_state = ReceiveState::Data;
                }
            }

            ReceiveState::Data => {
                self.data_crc_register = crc_calc_data(octet, self.data_crc_register);
                self.input_buffer.push(octet);
                self.index += 1;
                if self.index == self.frame_data_length as usize {
                    self.index = 0;
                    self.receive_state = ReceiveState::DataCrc;
                }
            }

            ReceiveState::DataCrc => {
                self.data_crc_register = crc_calc_data(octet, self.data_crc_register);
                self.index += 1;
                if self.index == 2 {
                    if self.data_crc_register == CRC16_GOOD {
                        self.received_valid_frame = true;
                    } else {
                        self.received_invalid_frame = true;
                    }
                    self.receive_state = ReceiveState::Idle;
                }
            }

            ReceiveState::SkipData => {
                self.index += 1;
                if self.index == self.frame_data_length as usize + 2 {
                    self.received_invalid_frame = true;
                    self.receive_state = ReceiveState::Idle;
                }
            }
        }

        true
    }

    // ---------------------------------------------------------------------
    // Master node state machine
    // ---------------------------------------------------------------------

    /// Advance the master FSM. Returns true if a state transition happened.
    pub fn master_fsm(&mut self) -> bool {
        match self.master_state {
            MasterState::Initialize => {
                self.next_station = self.next_address(self.config.this_station);
                self.poll_station = self.next_station;
                self.token_count = 0;
                self.frame_count = 0;
                self.sole_master = false;
                self.master_state = MasterState::Idle;
                true
            }
            MasterState::Idle => self.master_idle(),
            MasterState::UseToken => self.master_use_token(),
            MasterState::WaitForReply => self.master_wait_for_reply(),
            MasterState::DoneWithToken => self.master_done_with_token(),
            MasterState::PassToken => self.master_pass_token(),
            MasterState::NoToken => self.master_no_token(),
            MasterState::PollForMaster => self.master_poll_for_master(),
            MasterState::AnswerDataRequest => self.master_answer_data_request(),
        }
    }

    fn frame_for_us(&self) -> bool {
        self.frame_destination == self.config.this_station
            || self.frame_destination == MSTP_BROADCAST
    }

    fn deliver_frame(&mut self) {
        let source = BacnetAddress::local({
            let mut mac = Vec::new();
            mac.push(self.frame_source);
            mac
        });
        self.receive_queue
            .push_back((source, core::mem::take(&mut self.input_buffer)));
    }

    fn master_idle(&mut self) -> bool {
        if self.received_invalid_frame {
            self.received_invalid_frame = false;
            return false;
        }

        if self.received_valid_frame {
            self.received_valid_frame = false;
            let frame_type = FrameType::from_u8(self.frame_type_octet);
            if !self.frame_for_us() {
                return false;
            }
            match frame_type {
                Some(FrameType::Token) => {
                    if self.frame_destination != MSTP_BROADCAST {
                        self.frame_count = 0;
                        self.sole_master = false;
                        self.master_state = MasterState::UseToken;
                        log::trace!("mstp[{}]: token received", self.config.this_station);
                        return true;
                    }
                }
                Some(FrameType::PollForMaster) => {
                    if self.frame_destination != MSTP_BROADCAST {
                        let source = self.frame_source;
                        self.send_frame(FrameType::ReplyToPollForMaster, source, &[]);
                    }
                }
                Some(FrameType::TestRequest) => {
                    if self.frame_destination != MSTP_BROADCAST {
                        let source = self.frame_source;
                        let data = core::mem::take(&mut self.input_buffer);
                        self.send_frame(FrameType::TestResponse, source, &data);
                    }
                }
                Some(FrameType::DataExpectingReply) => {
                    if self.frame_destination == MSTP_BROADCAST {
                        // a broadcast cannot be answered
                        self.deliver_frame();
                    } else {
                        self.der_source = self.frame_source;
                        self.der_request = self.input_buffer.clone();
                        self.deliver_frame();
                        self.master_state = MasterState::AnswerDataRequest;
                        return true;
                    }
                }
                Some(FrameType::DataNotExpectingReply) => {
                    self.deliver_frame();
                }
                _ => {}
            }
            return false;
        }

        // lost token detection
        if self.driver.silence_milliseconds() >= T_NO_TOKEN {
            self.master_state = MasterState::NoToken;
            return true;
        }

        false
    }

    fn master_use_token(&mut self) -> bool {
        if self.send_queue.is_empty() || self.frame_count >= self.config.max_info_frames {
            self.master_state = MasterState::DoneWithToken;
            return true;
        }

        let pdu = self.send_queue.pop_front().expect("queue checked non-empty");
        let frame_type = if pdu.expecting_reply && pdu.destination != MSTP_BROADCAST {
            FrameType::DataExpectingReply
        } else {
            FrameType::DataNotExpectingReply
        };
        self.send_frame(frame_type, pdu.destination, &pdu.pdu);
        self.frame_count += 1;

        if frame_type == FrameType::DataExpectingReply {
            self.reply_source = pdu.destination;
            self.master_state = MasterState::WaitForReply;
            return true;
        }
        false
    }

    fn master_wait_for_reply(&mut self) -> bool {
        if self.received_valid_frame {
            self.received_valid_frame = false;
            let frame_type = FrameType::from_u8(self.frame_type_octet);
            if self.frame_destination == self.config.this_station
                && self.frame_source == self.reply_source
            {
                match frame_type {
                    Some(FrameType::DataNotExpectingReply) | Some(FrameType::TestResponse) => {
                        self.deliver_frame();
                    }
                    Some(FrameType::ReplyPostponed) => {}
                    _ => {}
                }
            }
            self.master_state = MasterState::DoneWithToken;
            return true;
        }
        if self.received_invalid_frame {
            self.received_invalid_frame = false;
            self.master_state = MasterState::DoneWithToken;
            return true;
        }
        if self.driver.silence_milliseconds() >= T_REPLY_TIMEOUT {
            // the reply never came; the transaction layer will retry
            self.master_state = MasterState::DoneWithToken;
            return true;
        }
        false
    }

    fn master_done_with_token(&mut self) -> bool {
        self.token_count += 1;

        if self.sole_master && self.next_station == self.config.this_station {
            if !self.send_queue.is_empty() {
                self.frame_count = 0;
                self.master_state = MasterState::UseToken;
                return true;
            }
            // probe for new masters once in a while
            if self.token_count >= N_POLL || self.driver.silence_milliseconds() >= T_NO_TOKEN {
                self.token_count = 0;
                self.poll_station = self.next_address(self.config.this_station);
                let poll = self.poll_station;
                self.send_frame(FrameType::PollForMaster, poll, &[]);
                self.master_state = MasterState::PollForMaster;
                return true;
            }
            return false;
        }

        if self.token_count >= N_POLL {
            // periodic scan for masters that joined between us and our
            // successor
            self.token_count = 0;
            self.poll_station = self.next_address(self.config.this_station);
            if self.poll_station != self.next_station {
                let poll = self.poll_station;
                self.send_frame(FrameType::PollForMaster, poll, &[]);
                self.master_state = MasterState::PollForMaster;
                return true;
            }
        }

        self.retry_count = 0;
        let next = self.next_station;
        self.send_frame(FrameType::Token, next, &[]);
        self.master_state = MasterState::PassToken;
        true
    }

    fn master_pass_token(&mut self) -> bool {
        // evidence the successor took the token: any bus activity
        if self.received_valid_frame
            || self.received_invalid_frame
            || self.receive_state != ReceiveState::Idle
        {
            self.master_state = MasterState::Idle;
            return true;
        }

        if self.driver.silence_milliseconds() >= T_USAGE_TIMEOUT {
            if self.retry_count < N_RETRY_TOKEN {
                self.retry_count += 1;
                let next = self.next_station;
                self.send_frame(FrameType::Token, next, &[]);
                return false;
            }
            // the successor is gone; hunt for a new one starting just
            // past the dead station
            self.poll_station = self.next_address(self.next_station);
            let poll = self.poll_station;
            log::debug!(
                "mstp[{}]: token pass to {} failed, polling {}",
                self.config.this_station,
                self.next_station,
                poll
            );
            self.send_frame(FrameType::PollForMaster, poll, &[]);
            self.master_state = MasterState::PollForMaster;
            return true;
        }
        false
    }

    fn master_no_token(&mut self) -> bool {
        if self.received_valid_frame || self.receive_state != ReceiveState::Idle {
            // someone else recovered first
            self.master_state = MasterState::Idle;
            return true;
        }
        let my_slot = T_NO_TOKEN + T_SLOT * self.config.this_station as u32;
        if self.driver.silence_milliseconds() >= my_slot {
            self.poll_station = self.next_address(self.config.this_station);
            let poll = self.poll_station;
            log::debug!(
                "mstp[{}]: no token for {} ms, polling for master {}",
                self.config.this_station,
                my_slot,
                poll
            );
            self.send_frame(FrameType::PollForMaster, poll, &[]);
            self.master_state = MasterState::PollForMaster;
            return true;
        }
        false
    }

    fn master_poll_for_master(&mut self) -> bool {
        if self.received_valid_frame {
            self.received_valid_frame = false;
            if FrameType::from_u8(self.frame_type_octet) == Some(FrameType::ReplyToPollForMaster)
                && self.frame_destination == self.config.this_station
            {
                // found our successor
                self.next_station = self.frame_source;
                self.sole_master = false;
                self.token_count = 0;
                self.retry_count = 0;
                let next = self.next_station;
                log::debug!(
                    "mstp[{}]: successor is {}",
                    self.config.this_station,
                    next
                );
                self.send_frame(FrameType::Token, next, &[]);
                self.master_state = MasterState::PassToken;
                return true;
            }
            // unexpected frame: the bus is alive, go listen
            self.master_state = MasterState::Idle;
            return true;
        }

        if self.driver.silence_milliseconds() >= T_USAGE_TIMEOUT {
            let next_poll = self.next_address(self.poll_station);
            if next_poll == self.config.this_station {
                // wrapped the whole address space without an answer
                self.sole_master = true;
                self.next_station = self.config.this_station;
                self.frame_count = 0;
                log::debug!("mstp[{}]: sole master", self.config.this_station);
                self.master_state = MasterState::UseToken;
                return true;
            }
            self.poll_station = next_poll;
            self.send_frame(FrameType::PollForMaster, next_poll, &[]);
            return false;
        }
        false
    }

    fn master_answer_data_request(&mut self) -> bool {
        // look at the queue head without removing it; a non-matching head
        // stays queued for our next token
        let matched = self
            .send_queue
            .front()
            .map(|pkt| {
                pkt.destination == self.der_source
                    && compare_data_expecting_reply(&self.der_request, &pkt.pdu)
            })
            .unwrap_or(false);

        if matched {
            let pkt = self.send_queue.pop_front().expect("head matched");
            self.send_frame(FrameType::DataNotExpectingReply, pkt.destination, &pkt.pdu);
            self.der_request.clear();
            self.master_state = MasterState::Idle;
            return true;
        }

        if self.driver.silence_milliseconds() >= T_REPLY_DELAY {
            let source = self.der_source;
            self.send_frame(FrameType::ReplyPostponed, source, &[]);
            self.der_request.clear();
            self.master_state = MasterState::Idle;
            return true;
        }
        false
    }
}

/// Decide whether `reply` answers the data-expecting-reply `request`.
///
/// Both arguments are complete NPDUs. The reply matches iff neither is a
/// network message, the request is a confirmed request, the invoke ids
/// agree, the service choices agree (for acks and errors; Reject and Abort
/// match on invoke id alone), and the routed source of the request equals
/// the routed destination of the reply.
pub fn compare_data_expecting_reply(request: &[u8], reply: &[u8]) -> bool {
    let (request_npdu, request_offset) = match Npdu::decode(request) {
        Ok(v) => v,
        Err(_) => return false,
    };
    if request_npdu.network_message {
        return false;
    }
    let request_apdu = &request[request_offset..];
    if request_apdu.len() < 4 {
        return false;
    }
    if PduType::from_octet(request_apdu[0]) != Some(PduType::ConfirmedRequest) {
        return false;
    }
    let request_invoke = request_apdu[2];
    let request_segmented = request_apdu[0] & 0x08 != 0;
    let request_choice_at = if request_segmented { 5 } else { 3 };
    let request_choice = match request_apdu.get(request_choice_at) {
        Some(choice) => *choice,
        None => return false,
    };

    let (reply_npdu, reply_offset) = match Npdu::decode(reply) {
        Ok(v) => v,
        Err(_) => return false,
    };
    if reply_npdu.network_message {
        return false;
    }
    let reply_apdu = &reply[reply_offset..];
    if reply_apdu.len() < 2 {
        return false;
    }

    let (reply_invoke, reply_choice) = match PduType::from_octet(reply_apdu[0]) {
        Some(PduType::SimpleAck) | Some(PduType::Error) => {
            if reply_apdu.len() < 3 {
                return false;
            }
            (reply_apdu[1], Some(reply_apdu[2]))
        }
        Some(PduType::ComplexAck) => {
            let segmented = reply_apdu[0] & 0x08 != 0;
            let choice_at = if segmented { 4 } else { 2 };
            match reply_apdu.get(choice_at) {
                Some(choice) => (reply_apdu[1], Some(*choice)),
                None => return false,
            }
        }
        Some(PduType::Reject) | Some(PduType::Abort) => (reply_apdu[1], None),
        _ => return false,
    };

    if request_invoke != reply_invoke {
        return false;
    }
    if let Some(choice) = reply_choice {
        if choice != request_choice {
            return false;
        }
    }
    if request_npdu.version != reply_npdu.version {
        return false;
    }
    // a routed request must be answered towards the same routed source
    match (&request_npdu.source, &reply_npdu.destination) {
        (None, None) => true,
        (Some(src), Some(dst)) => src.network == dst.network && src.remote == dst.remote,
        _ => false,
    }
}

impl<D: MstpDriver> DataLink for MstpPort<D> {
    fn send_pdu(
        &mut self,
        dest: &BacnetAddress,
        expecting_reply: bool,
        pdu: &[u8],
    ) -> Result<usize> {
        if pdu.len() > MSTP_MAX_DATA_LENGTH {
            return Err(DataLinkError::FrameTooLarge);
        }
        let destination = if dest.mac.is_empty() {
            MSTP_BROADCAST
        } else {
            dest.mac[0]
        };
        self.send_queue.push_back(QueuedPdu {
            destination,
            expecting_reply,
            pdu: pdu.to_vec(),
        });
        Ok(pdu.len())
    }

    fn receive(&mut self, timeout: Duration) -> Result<(BacnetAddress, Vec<u8>)> {
        #[cfg(feature = "std")]
        {
            let deadline = std::time::Instant::now() + timeout;
            loop {
                self.poll();
                if let Some(entry) = self.receive_queue.pop_front() {
                    return Ok(entry);
                }
                if std::time::Instant::now() >= deadline {
                    return Err(DataLinkError::Timeout);
                }
                std::thread::sleep(core::time::Duration::from_millis(1));
            }
        }
        #[cfg(not(feature = "std"))]
        {
            let _ = timeout;
            self.poll();
            self.receive_queue
                .pop_front()
                .ok_or(DataLinkError::Timeout)
        }
    }

    fn broadcast_address(&self) -> BacnetAddress {
        let mut mac = Vec::new();
        mac.push(MSTP_BROADCAST);
        BacnetAddress::local(mac)
    }

    fn my_address(&self) -> BacnetAddress {
        let mut mac = Vec::new();
        mac.push(self.config.this_station);
        BacnetAddress::local(mac)
    }

    fn max_apdu(&self) -> usize {
        480
    }

    fn link_type(&self) -> DataLinkType {
        DataLinkType::MsTP
    }

    fn tick(&mut self, _milliseconds: u32) {
        self.poll();
    }
}

/// Check if address is a master node
pub fn is_master_node(address: u8) -> bool {
    address <= 127
}

/// Check if address is a slave node
pub fn is_slave_node(address: u8) -> bool {
    (128..=254).contains(&address)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::MessagePriority;

    /// Loopback driver with an injectable receive stream and a
    /// test-controlled silence clock.
    struct TestDriver {
        rx: VecDeque<u8>,
        tx: Vec<u8>,
        silence: u32,
    }

    impl TestDriver {
        fn new() -> Self {
            Self {
                rx: VecDeque::new(),
                tx: Vec::new(),
                silence: 0,
            }
        }

        fn inject_frame(&mut self, frame: &Frame) {
            for byte in frame.encode() {
                self.rx.push_back(byte);
            }
        }

        fn sent_frames(&self) -> Vec<Frame> {
            let mut frames = Vec::new();
            let mut rest = &self.tx[..];
            while rest.len() >= MSTP_HEADER_SIZE {
                let length = ((rest[5] as usize) << 8) | rest[6] as usize;
                let total = MSTP_HEADER_SIZE + length + if length > 0 { 2 } else { 0 };
                frames.push(Frame::decode(&rest[..total]).unwrap());
                rest = &rest[total..];
            }
            frames
        }

        fn clear_sent(&mut self) {
            self.tx.clear();
        }
    }

    impl MstpDriver for TestDriver {
        fn send(&mut self, data: &[u8]) -> usize {
            self.tx.extend_from_slice(data);
            data.len()
        }

        fn read(&mut self) -> Option<u8> {
            self.rx.pop_front()
        }

        fn transmitting(&self) -> bool {
            false
        }

        fn baud_rate(&self) -> u32 {
            38400
        }

        fn set_baud_rate(&mut self, _baud: u32) -> bool {
            false
        }

        fn silence_milliseconds(&self) -> u32 {
            self.silence
        }

        fn silence_reset(&mut self) {
            self.silence = 0;
        }
    }

    fn test_port(this_station: u8, max_master: u8) -> MstpPort<TestDriver> {
        let config = MstpConfig {
            this_station,
            max_master,
            max_info_frames: 1,
        };
        let mut port = MstpPort::new(TestDriver::new(), config);
        assert!(port.master_fsm()); // Initialize -> Idle
        port
    }

    #[test]
    fn test_frame_round_trip() {
        let token = Frame::token(5, 3);
        let decoded = Frame::decode(&token.encode()).unwrap();
        assert_eq!(decoded, token);

        let data = Frame::new(FrameType::DataNotExpectingReply, 10, 20, vec![1, 2, 3, 4]).unwrap();
        let decoded = Frame::decode(&data.encode()).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn test_frame_header_crc_detects_corruption() {
        let token = Frame::token(5, 3);
        let mut bytes = token.encode();
        bytes[3] ^= 0x01; // flip a destination bit
        assert!(matches!(Frame::decode(&bytes), Err(DataLinkError::CrcError)));
    }

    #[test]
    fn test_frame_data_crc_detects_corruption() {
        let data = Frame::new(FrameType::DataNotExpectingReply, 10, 20, vec![1, 2, 3]).unwrap();
        let mut bytes = data.encode();
        let last = bytes.len() - 3;
        bytes[last] ^= 0xFF;
        assert!(matches!(Frame::decode(&bytes), Err(DataLinkError::CrcError)));
    }

    #[test]
    fn test_oversize_frame_rejected() {
        assert!(Frame::new(
            FrameType::DataNotExpectingReply,
            1,
            2,
            vec![0; MSTP_MAX_DATA_LENGTH + 1]
        )
        .is_err());
    }

    #[test]
    fn test_receive_fsm_accepts_valid_frame() {
        let mut port = test_port(5, 20);
        let frame = Frame::new(FrameType::DataNotExpectingReply, 5, 9, vec![0xAA, 0xBB]).unwrap();
        port.driver_mut().inject_frame(&frame);

        while port.receive_fsm() {}
        assert!(port.received_valid_frame);
        assert_eq!(port.frame_source, 9);
        assert_eq!(port.frame_destination, 5);
        assert_eq!(port.input_buffer, vec![0xAA, 0xBB]);
        assert_eq!(port.receive_state(), ReceiveState::Idle);
    }

    #[test]
    fn test_receive_fsm_bad_header_crc_recovers() {
        let mut port = test_port(5, 20);

        let good = Frame::token(5, 3);
        let mut corrupted = good.encode();
        corrupted[7] ^= 0xFF; // wreck the header CRC
        for byte in corrupted {
            port.driver_mut().rx.push_back(byte);
        }
        while port.receive_fsm() {}
        assert!(port.received_invalid_frame);
        assert!(!port.received_valid_frame);
        assert_eq!(port.receive_state(), ReceiveState::Idle);

        // the next good frame is still accepted
        port.received_invalid_frame = false;
        port.driver_mut().inject_frame(&good);
        while port.receive_fsm() {}
        assert!(port.received_valid_frame);
    }

    #[test]
    fn test_receive_fsm_bad_data_crc() {
        let mut port = test_port(5, 20);
        let frame = Frame::new(FrameType::DataNotExpectingReply, 5, 9, vec![1, 2, 3]).unwrap();
        let mut bytes = frame.encode();
        let len = bytes.len();
        bytes[len - 1] ^= 0x55;
        for byte in bytes {
            port.driver_mut().rx.push_back(byte);
        }
        while port.receive_fsm() {}
        assert!(port.received_invalid_frame);
        assert!(!port.received_valid_frame);
    }

    #[test]
    fn test_token_receipt_and_pass() {
        // Seed scenario: master 5, max_master 20, next station 7, no info
        // frames pending. Receiving the token produces Token(5 -> 7).
        let mut port = test_port(5, 20);
        port.next_station = 7;

        port.driver_mut().inject_frame(&Frame::token(5, 3));
        port.poll();

        let sent = port.driver_mut().sent_frames();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].frame_type, FrameType::Token);
        assert_eq!(sent[0].destination, 7);
        assert_eq!(sent[0].source, 5);
        assert_eq!(port.master_state(), MasterState::PassToken);
    }

    #[test]
    fn test_token_pass_failure_walks_poll_for_master() {
        let mut port = test_port(5, 20);
        port.next_station = 7;
        port.driver_mut().inject_frame(&Frame::token(5, 3));
        port.poll();
        port.driver_mut().clear_sent();

        // station 7 never speaks: first a token retry
        port.driver_mut().silence = T_USAGE_TIMEOUT;
        port.master_fsm();
        let sent = port.driver_mut().sent_frames();
        assert_eq!(sent.last().unwrap().frame_type, FrameType::Token);
        assert_eq!(sent.last().unwrap().destination, 7);
        port.driver_mut().clear_sent();

        // still silent: poll for a new master just past the dead station
        port.driver_mut().silence = T_USAGE_TIMEOUT;
        port.master_fsm();
        assert_eq!(port.master_state(), MasterState::PollForMaster);
        let sent = port.driver_mut().sent_frames();
        assert_eq!(sent.last().unwrap().frame_type, FrameType::PollForMaster);
        assert_eq!(sent.last().unwrap().destination, 8);
        port.driver_mut().clear_sent();

        // walk 9, 10, ... until someone answers
        port.driver_mut().silence = T_USAGE_TIMEOUT;
        port.master_fsm();
        let sent = port.driver_mut().sent_frames();
        assert_eq!(sent.last().unwrap().destination, 9);
        port.driver_mut().clear_sent();

        // station 10 answers the next poll
        port.driver_mut().silence = T_USAGE_TIMEOUT;
        port.master_fsm(); // polls 10
        port.driver_mut().clear_sent();
        port.driver_mut()
            .inject_frame(&Frame::new(FrameType::ReplyToPollForMaster, 5, 10, vec![]).unwrap());
        while port.receive_fsm() {}
        port.master_fsm();
        assert_eq!(port.next_station(), 10);
        let sent = port.driver_mut().sent_frames();
        assert_eq!(sent.last().unwrap().frame_type, FrameType::Token);
        assert_eq!(sent.last().unwrap().destination, 10);
    }

    #[test]
    fn test_poll_for_master_wraps_to_sole_master() {
        let mut port = test_port(2, 3);
        port.driver_mut().silence = T_NO_TOKEN + T_SLOT * 2;
        port.master_fsm(); // Idle -> NoToken
        port.master_fsm(); // NoToken -> PollForMaster, polls 3
        assert_eq!(port.master_state(), MasterState::PollForMaster);

        // nobody answers 3, 0, 1; wrapping back to us declares sole master
        for _ in 0..3 {
            port.driver_mut().silence = T_USAGE_TIMEOUT;
            port.master_fsm();
        }
        assert!(port.sole_master());
        assert_eq!(port.master_state(), MasterState::UseToken);
    }

    #[test]
    fn test_poll_for_master_replies() {
        // another master polls us; we answer with Reply-To-Poll-For-Master
        let mut port = test_port(7, 20);
        port.driver_mut()
            .inject_frame(&Frame::poll_for_master(7, 5));
        port.poll();
        let sent = port.driver_mut().sent_frames();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].frame_type, FrameType::ReplyToPollForMaster);
        assert_eq!(sent[0].destination, 5);
    }

    fn make_request_npdu(invoke_id: u8, choice: u8) -> Vec<u8> {
        let npdu = Npdu::application(true, MessagePriority::Normal);
        let mut pdu = npdu.encode();
        pdu.extend_from_slice(&[0x02, 0x05, invoke_id, choice]);
        pdu
    }

    fn make_simple_ack_npdu(invoke_id: u8, choice: u8) -> Vec<u8> {
        let npdu = Npdu::application(false, MessagePriority::Normal);
        let mut pdu = npdu.encode();
        pdu.extend_from_slice(&[0x20, invoke_id, choice]);
        pdu
    }

    #[test]
    fn test_reply_matching() {
        let request = make_request_npdu(33, 15);
        assert!(compare_data_expecting_reply(
            &request,
            &make_simple_ack_npdu(33, 15)
        ));
        // invoke id mismatch
        assert!(!compare_data_expecting_reply(
            &request,
            &make_simple_ack_npdu(34, 15)
        ));
        // service choice mismatch
        assert!(!compare_data_expecting_reply(
            &request,
            &make_simple_ack_npdu(33, 12)
        ));

        // abort matches on invoke id alone
        let npdu = Npdu::application(false, MessagePriority::Normal);
        let mut abort = npdu.encode();
        abort.extend_from_slice(&[0x71, 33, 4]);
        assert!(compare_data_expecting_reply(&request, &abort));
    }

    #[test]
    fn test_answer_data_request_sends_matching_reply() {
        let mut port = test_port(8, 20);
        let request = make_request_npdu(7, 12);

        let der = Frame::new(FrameType::DataExpectingReply, 8, 3, request).unwrap();
        port.driver_mut().inject_frame(&der);
        port.poll();
        assert_eq!(port.master_state(), MasterState::AnswerDataRequest);
        // the request was also delivered up-stack
        assert_eq!(port.receive_queue.len(), 1);

        // queue the matching reply
        let reply = make_simple_ack_npdu(7, 12);
        port.send_pdu(&BacnetAddress::local(vec![3]), false, &reply)
            .unwrap();
        port.master_fsm();

        let sent = port.driver_mut().sent_frames();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].frame_type, FrameType::DataNotExpectingReply);
        assert_eq!(sent[0].destination, 3);
        assert_eq!(port.master_state(), MasterState::Idle);
    }

    #[test]
    fn test_answer_data_request_requeues_non_matching_head() {
        let mut port = test_port(8, 20);
        let request = make_request_npdu(7, 12);
        let der = Frame::new(FrameType::DataExpectingReply, 8, 3, request).unwrap();
        port.driver_mut().inject_frame(&der);
        port.poll();

        // a non-matching PDU sits at the queue head
        let unrelated = make_simple_ack_npdu(99, 1);
        port.send_pdu(&BacnetAddress::local(vec![3]), false, &unrelated)
            .unwrap();
        port.master_fsm();
        // nothing sent, head still queued
        assert!(port.driver_mut().sent_frames().is_empty());
        assert_eq!(port.send_queue.len(), 1);

        // reply window expires: reply postponed, head survives
        port.driver_mut().silence = T_REPLY_DELAY;
        port.master_fsm();
        let sent = port.driver_mut().sent_frames();
        assert_eq!(sent.last().unwrap().frame_type, FrameType::ReplyPostponed);
        assert_eq!(port.send_queue.len(), 1);
        assert_eq!(port.master_state(), MasterState::Idle);
    }

    #[test]
    fn test_use_token_sends_queued_frame() {
        let mut port = test_port(5, 20);
        port.next_station = 7;
        let pdu = make_request_npdu(1, 12);
        port.send_pdu(&BacnetAddress::local(vec![9]), true, &pdu).unwrap();

        port.driver_mut().inject_frame(&Frame::token(5, 3));
        port.poll();

        let sent = port.driver_mut().sent_frames();
        assert_eq!(sent[0].frame_type, FrameType::DataExpectingReply);
        assert_eq!(sent[0].destination, 9);
        assert_eq!(port.master_state(), MasterState::WaitForReply);
    }

    #[test]
    fn test_station_roles() {
        assert!(is_master_node(0));
        assert!(is_master_node(127));
        assert!(!is_master_node(128));
        assert!(is_slave_node(128));
        assert!(is_slave_node(254));
        assert!(!is_slave_node(255));
    }
}
