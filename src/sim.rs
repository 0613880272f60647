//! In-process histogramming board.
//!
//! [`SimulatedBoard`] implements [`Transport`] by decoding each request,
//! executing it against a register file, and encoding the reply the way the
//! firmware does, including packet-id tracking. Clones share one board, so a
//! test can hand one clone to the client and keep another to inject faults
//! and inspect the transaction log.
//!
//! Histogram memory is not stored. Every word of it is a function of the
//! selected link and its address, see [`histogram_word`].

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use log::trace;

use crate::command::STATUS_PACKET_WORDS;
use crate::error::{FitError, Result};
use crate::header::{
    bytes_to_words, words_to_bytes, PacketHeader, PacketType, TransactionHeader, TransactionType,
    INFO_SUCCESS,
};
use crate::histogram::HISTOGRAM_WORDS;
use crate::register::RegisterMap;
use crate::transport::{Transport, MAX_PACKET_SIZE};

/// Info code the board returns when a read times out on its internal bus.
pub const INFO_READ_TIMEOUT: u8 = 0x6;

/// Reply buffers advertised in status replies.
const BUFFERS: u32 = 4;

/// One-shot misbehaviour applied to the next control packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// The packet is lost before it reaches the board.
    Timeout,
    /// The board executes the packet but the reply is lost.
    DropReply,
    /// The reply's packet header is garbage.
    CorruptHeader,
    /// The reply claims to answer a write.
    WrongType,
    /// The reply carries the wrong packet id.
    WrongPacketId,
}

/// What the board received, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogEntry {
    /// A status packet.
    Status,
    /// A control packet, whether or not it was answered.
    Transaction {
        /// Transaction type.
        type_id: TransactionType,
        /// Register address.
        address: u32,
        /// Word count field.
        words: u8,
    },
}

/// Deterministic content of histogram word `address` while `link` is selected.
///
/// Returns `None` outside histogram memory.
pub fn histogram_word(map: &RegisterMap, link: u32, address: u32) -> Option<u32> {
    let offset = address.checked_sub(map.hist_base)? as usize;
    if offset >= HISTOGRAM_WORDS {
        return None;
    }
    Some((link << 24) | offset as u32)
}

/// Mutable state of the simulated board.
#[derive(Debug)]
pub struct BoardState {
    map: RegisterMap,
    registers: HashMap<u32, u32>,
    expected_packet_id: u16,
    powered: bool,
    faults: VecDeque<Fault>,
    targeted: Vec<(u32, Fault)>,
    triggers: Vec<(u32, Arc<AtomicBool>)>,
    memory_limit: Option<u32>,
    resetting_polls: u32,
    log: Vec<LogEntry>,
}

impl BoardState {
    fn new(map: RegisterMap) -> Self {
        let mut registers = HashMap::new();
        registers.insert(map.board_status, map.pll_locked.mask());
        registers.insert(map.trigger_link, map.link_ok.mask());
        registers.insert(map.link_mask, map.link_field.place(0b11));
        Self {
            map,
            registers,
            expected_packet_id: 1,
            powered: true,
            faults: VecDeque::new(),
            targeted: Vec::new(),
            triggers: Vec::new(),
            memory_limit: None,
            resetting_polls: 0,
            log: Vec::new(),
        }
    }

    /// Register map the board implements.
    pub fn map(&self) -> &RegisterMap {
        &self.map
    }

    /// Packet id the board will accept next.
    pub fn expected_packet_id(&self) -> u16 {
        self.expected_packet_id
    }

    /// Overrides the packet id the board will accept next.
    pub fn set_expected_packet_id(&mut self, id: u16) {
        self.expected_packet_id = id;
    }

    /// Powers the board on or off. An unpowered board never answers.
    pub fn set_powered(&mut self, powered: bool) {
        self.powered = powered;
    }

    /// Queues a fault for the next control packet.
    pub fn inject(&mut self, fault: Fault) {
        self.faults.push_back(fault);
    }

    /// Queues a fault for the next control packet addressed to `address`.
    /// It takes precedence over faults queued with [`inject`](Self::inject).
    pub fn inject_at(&mut self, address: u32, fault: Fault) {
        self.targeted.push((address, fault));
    }

    /// Raises `flag` once, when the next control packet addressed to
    /// `address` arrives.
    pub fn raise_on(&mut self, address: u32, flag: Arc<AtomicBool>) {
        self.triggers.push((address, flag));
    }

    /// Makes histogram reads at or after `address` fail.
    pub fn truncate_memory_at(&mut self, address: u32) {
        self.memory_limit = Some(address);
    }

    /// Removes the memory limit set by [`truncate_memory_at`](Self::truncate_memory_at).
    pub fn restore_memory(&mut self) {
        self.memory_limit = None;
    }

    /// Current value of a register.
    pub fn register(&self, address: u32) -> u32 {
        self.registers.get(&address).copied().unwrap_or(0)
    }

    /// Sets a register directly, bypassing the bus.
    pub fn set_register(&mut self, address: u32, value: u32) {
        self.registers.insert(address, value);
    }

    /// Link currently selected for readout.
    pub fn selected_link(&self) -> u32 {
        self.map
            .channel_field
            .get(self.register(self.map.channel_select))
    }

    /// Everything received so far.
    pub fn log(&self) -> &[LogEntry] {
        &self.log
    }

    /// Forgets the log.
    pub fn clear_log(&mut self) {
        self.log.clear();
    }

    /// Number of control packets received.
    pub fn transaction_count(&self) -> usize {
        self.log
            .iter()
            .filter(|e| matches!(e, LogEntry::Transaction { .. }))
            .count()
    }

    fn advance_packet_id(&mut self) {
        if self.expected_packet_id != 0 {
            self.expected_packet_id = match self.expected_packet_id.wrapping_add(1) {
                0 => 1,
                id => id,
            };
        }
    }

    fn read_word(&mut self, address: u32) -> Option<u32> {
        if let Some(word) = histogram_word(&self.map, self.selected_link(), address) {
            return match self.memory_limit {
                Some(limit) if address >= limit => None,
                _ => Some(word),
            };
        }
        let mut value = self.register(address);
        if address == self.map.board_status && self.resetting_polls > 0 {
            value |= self.map.resetting.mask();
            self.resetting_polls -= 1;
        }
        Some(value)
    }

    fn write_word(&mut self, address: u32, value: u32) {
        if address == self.map.reset && value & self.map.reset_mask != 0 {
            trace!("sim: reset");
            self.resetting_polls = 1;
            self.registers.insert(self.map.hist_control, 0);
            self.registers.insert(self.map.channel_select, 0);
            return;
        }
        self.registers.insert(address, value);
    }

    fn status_reply(&mut self) -> Vec<u32> {
        self.log.push(LogEntry::Status);
        let mut words = vec![0u32; STATUS_PACKET_WORDS];
        words[0] = PacketHeader::status().to_word();
        words[1] = MAX_PACKET_SIZE as u32;
        words[2] = BUFFERS;
        words[3] = PacketHeader::control(self.expected_packet_id).to_word();
        words
    }

    /// Executes one control packet; `None` means no reply is sent.
    fn control_reply(&mut self, words: &[u32], header: PacketHeader) -> Result<Option<Vec<u32>>> {
        if words.len() < 3 {
            return Err(FitError::invalid_response("control request too short"));
        }
        let request = TransactionHeader::from_word(words[1])?;
        let address = words[2];
        let body = &words[3..];
        self.log.push(LogEntry::Transaction {
            type_id: request.type_id,
            address,
            words: request.words,
        });

        if let Some(i) = self.triggers.iter().position(|(a, _)| *a == address) {
            let (_, flag) = self.triggers.swap_remove(i);
            flag.store(true, Ordering::SeqCst);
        }
        let fault = match self.targeted.iter().position(|(a, _)| *a == address) {
            Some(i) => Some(self.targeted.remove(i).1),
            None => self.faults.pop_front(),
        };
        if fault == Some(Fault::Timeout) {
            return Ok(None);
        }
        if header.packet_id != 0 && header.packet_id != self.expected_packet_id {
            trace!(
                "sim: dropped packet {} (expected {})",
                header.packet_id,
                self.expected_packet_id
            );
            return Ok(None);
        }
        self.advance_packet_id();

        let mut info_code = INFO_SUCCESS;
        let mut data = Vec::new();
        match request.type_id {
            TransactionType::Read => {
                for i in 0..u32::from(request.words) {
                    match self.read_word(address.wrapping_add(i)) {
                        Some(word) => data.push(word),
                        None => {
                            info_code = INFO_READ_TIMEOUT;
                            break;
                        }
                    }
                }
            }
            TransactionType::NonIncrementingRead => {
                for _ in 0..request.words {
                    match self.read_word(address) {
                        Some(word) => data.push(word),
                        None => {
                            info_code = INFO_READ_TIMEOUT;
                            break;
                        }
                    }
                }
            }
            TransactionType::Write => {
                for (i, &value) in body.iter().enumerate() {
                    self.write_word(address.wrapping_add(i as u32), value);
                }
            }
            TransactionType::NonIncrementingWrite => {
                for &value in body {
                    self.write_word(address, value);
                }
            }
            TransactionType::ReadModifyWriteBits => {
                let (and, or) = match body {
                    [and, or, ..] => (*and, *or),
                    _ => return Err(FitError::invalid_response("RMW request without terms")),
                };
                let previous = self.register(address);
                self.write_word(address, (previous & and) | or);
                data.push(previous);
            }
        }

        let mut reply_header = PacketHeader::control(header.packet_id).to_word();
        let mut reply_transaction = TransactionHeader {
            transaction_id: request.transaction_id,
            words: request.words,
            type_id: request.type_id,
            info_code,
        };
        match fault {
            Some(Fault::DropReply) => return Ok(None),
            Some(Fault::CorruptHeader) => reply_header = 0xDEAD_BEEF,
            Some(Fault::WrongType) => {
                reply_transaction.type_id = TransactionType::Write;
                data.clear();
            }
            Some(Fault::WrongPacketId) => {
                reply_header =
                    PacketHeader::control(header.packet_id.wrapping_add(7)).to_word();
            }
            _ => {}
        }

        let mut reply = Vec::with_capacity(2 + data.len());
        reply.push(reply_header);
        reply.push(reply_transaction.to_word());
        reply.extend(data);
        Ok(Some(reply))
    }

    fn handle(&mut self, request: &[u8]) -> Result<Option<Vec<u32>>> {
        let words = bytes_to_words(request)?;
        let header = match words.first() {
            Some(&word) => PacketHeader::from_word(word)?,
            None => return Ok(None),
        };
        match header.packet_type {
            PacketType::Status => Ok(Some(self.status_reply())),
            PacketType::Control => self.control_reply(&words, header),
            PacketType::Resend => Ok(None),
        }
    }
}

/// Shared handle to a simulated board.
#[derive(Debug, Clone)]
pub struct SimulatedBoard {
    state: Arc<Mutex<BoardState>>,
}

impl Default for SimulatedBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedBoard {
    /// Creates a powered board with the default register map.
    pub fn new() -> Self {
        Self::with_map(RegisterMap::default())
    }

    /// Creates a powered board implementing `map`.
    pub fn with_map(map: RegisterMap) -> Self {
        Self {
            state: Arc::new(Mutex::new(BoardState::new(map))),
        }
    }

    /// Runs `f` with exclusive access to the board.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut BoardState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }
}

impl Transport for SimulatedBoard {
    fn send_receive(&mut self, request: &[u8]) -> Result<Vec<u8>> {
        self.with_state(|state| {
            if !state.powered {
                return Err(FitError::Timeout);
            }
            match state.handle(request)? {
                Some(words) => Ok(words_to_bytes(&words)),
                None => Err(FitError::Timeout),
            }
        })
    }

    fn retarget(&mut self, _addr: SocketAddr) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{ControlPacket, StatusRequest, Transaction};
    use crate::response::{ControlReply, StatusReply};

    fn exchange(board: &mut SimulatedBoard, packet: &ControlPacket) -> Result<ControlReply> {
        let bytes = board.send_receive(&packet.to_bytes())?;
        ControlReply::from_bytes(&bytes)
    }

    #[test]
    fn test_status_reports_expected_id() {
        let mut board = SimulatedBoard::new();
        board.with_state(|s| s.set_expected_packet_id(42));
        let bytes = board.send_receive(&StatusRequest.to_bytes()).unwrap();
        let status = StatusReply::from_bytes(&bytes).unwrap();
        assert_eq!(status.next_packet_id, 42);
        assert_eq!(board.with_state(|s| s.log().to_vec()), vec![LogEntry::Status]);
    }

    #[test]
    fn test_out_of_sequence_packet_dropped() {
        let mut board = SimulatedBoard::new();
        let packet = ControlPacket::new(5, 0, Transaction::read(0, 1).unwrap());
        assert!(matches!(
            exchange(&mut board, &packet).unwrap_err(),
            FitError::Timeout
        ));
        assert_eq!(board.with_state(|s| s.expected_packet_id()), 1);
    }

    #[test]
    fn test_write_then_read() {
        let mut board = SimulatedBoard::new();
        let write = ControlPacket::new(1, 0, Transaction::write(0x40, &[9, 8]).unwrap());
        exchange(&mut board, &write).unwrap();
        let read = ControlPacket::new(2, 1, Transaction::read(0x40, 2).unwrap());
        let reply = exchange(&mut board, &read).unwrap();
        assert_eq!(reply.check(&read).unwrap(), &[9, 8]);
    }

    #[test]
    fn test_reset_visible_once() {
        let mut board = SimulatedBoard::new();
        let map = RegisterMap::default();
        let reset = ControlPacket::new(1, 0, Transaction::write(map.reset, &[map.reset_mask]).unwrap());
        exchange(&mut board, &reset).unwrap();

        let read = ControlPacket::new(2, 1, Transaction::read(map.board_status, 1).unwrap());
        let first = exchange(&mut board, &read).unwrap();
        assert!(map.resetting.is_set(first.data[0]));
        let read = ControlPacket::new(3, 2, Transaction::read(map.board_status, 1).unwrap());
        let second = exchange(&mut board, &read).unwrap();
        assert!(!map.resetting.is_set(second.data[0]));
    }

    #[test]
    fn test_memory_truncation() {
        let mut board = SimulatedBoard::new();
        let base = RegisterMap::default().hist_base;
        board.with_state(|s| s.truncate_memory_at(base + 3));
        let read = ControlPacket::new(1, 0, Transaction::read(base, 10).unwrap());
        let reply = exchange(&mut board, &read).unwrap();
        assert_eq!(reply.transaction.info_code, INFO_READ_TIMEOUT);
        assert_eq!(reply.data, vec![0, 1, 2]);
    }

    #[test]
    fn test_histogram_word_follows_link() {
        let map = RegisterMap::default();
        assert_eq!(histogram_word(&map, 0, map.hist_base + 5), Some(5));
        assert_eq!(histogram_word(&map, 3, map.hist_base), Some(3 << 24));
        assert_eq!(histogram_word(&map, 0, map.hist_base - 1), None);
        assert_eq!(
            histogram_word(&map, 0, map.hist_base + HISTOGRAM_WORDS as u32),
            None
        );
    }

    #[test]
    fn test_rmw_returns_previous() {
        let mut board = SimulatedBoard::new();
        board.with_state(|s| s.set_register(0x50, 0xF0));
        let rmw = ControlPacket::new(1, 0, Transaction::set_bits(0x50, 0x1, true));
        let reply = exchange(&mut board, &rmw).unwrap();
        assert_eq!(reply.check(&rmw).unwrap(), &[0xF0]);
        assert_eq!(board.with_state(|s| s.register(0x50)), 0xF1);
    }

    #[test]
    fn test_targeted_fault_waits_for_address() {
        let mut board = SimulatedBoard::new();
        let flag = Arc::new(AtomicBool::new(false));
        board.with_state(|s| {
            s.inject_at(0x60, Fault::Timeout);
            s.raise_on(0x60, Arc::clone(&flag));
        });

        let other = ControlPacket::new(1, 0, Transaction::read(0x50, 1).unwrap());
        assert!(exchange(&mut board, &other).is_ok());
        assert!(!flag.load(Ordering::SeqCst));

        let target = ControlPacket::new(2, 1, Transaction::read(0x60, 1).unwrap());
        assert!(matches!(exchange(&mut board, &target), Err(FitError::Timeout)));
        assert!(flag.load(Ordering::SeqCst));

        // Both are one-shot
        flag.store(false, Ordering::SeqCst);
        assert!(exchange(&mut board, &target).is_ok());
        assert!(!flag.load(Ordering::SeqCst));
    }
}
