//! IPbus transaction requests and their serialization.
//!
//! A [`Transaction`] describes one register operation. [`ControlPacket`]
//! frames a single transaction behind a packet header, ready for the
//! transport. [`StatusRequest`] is the fixed 16-word status query used to
//! learn the next packet id the target expects.
//!
//! # Example
//!
//! ```
//! use fit_ipbus::{ControlPacket, Transaction};
//!
//! let txn = Transaction::read(0x1000, 4).unwrap();
//! let packet = ControlPacket::new(7, 1, txn);
//! let bytes = packet.to_bytes();
//! assert_eq!(bytes.len(), 3 * 4); // packet header + transaction header + address
//! ```

use crate::error::{FitError, Result};
use crate::header::{words_to_bytes, PacketHeader, TransactionHeader, TransactionType};

/// Maximum number of data words carried by one transaction.
pub const MAX_WORDS_PER_TRANSACTION: usize = 255;

/// Length in words of a status packet, request and reply alike.
pub const STATUS_PACKET_WORDS: usize = 16;

/// One register operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transaction {
    /// Read `count` consecutive registers starting at `address`.
    Read {
        /// First register address.
        address: u32,
        /// Number of words (1-255).
        count: u8,
    },
    /// Read one register `count` times.
    NonIncrementingRead {
        /// Register address.
        address: u32,
        /// Number of words (1-255).
        count: u8,
    },
    /// Write consecutive registers starting at `address`.
    Write {
        /// First register address.
        address: u32,
        /// Words to write (1-255).
        data: Vec<u32>,
    },
    /// `register = (register & and) | or`, replying with the previous value.
    ReadModifyWriteBits {
        /// Register address.
        address: u32,
        /// AND term.
        and: u32,
        /// OR term.
        or: u32,
    },
}

fn check_count(count: usize) -> Result<u8> {
    if count == 0 {
        return Err(FitError::invalid_parameter(
            "count",
            "must be greater than 0",
        ));
    }
    if count > MAX_WORDS_PER_TRANSACTION {
        return Err(FitError::invalid_parameter(
            "count",
            format!("must not exceed {}", MAX_WORDS_PER_TRANSACTION),
        ));
    }
    Ok(count as u8)
}

impl Transaction {
    /// Creates an incrementing read.
    ///
    /// # Errors
    ///
    /// Returns an error if `count` is 0 or exceeds [`MAX_WORDS_PER_TRANSACTION`].
    pub fn read(address: u32, count: usize) -> Result<Self> {
        Ok(Transaction::Read {
            address,
            count: check_count(count)?,
        })
    }

    /// Creates a non-incrementing read.
    ///
    /// # Errors
    ///
    /// Returns an error if `count` is 0 or exceeds [`MAX_WORDS_PER_TRANSACTION`].
    pub fn non_incrementing_read(address: u32, count: usize) -> Result<Self> {
        Ok(Transaction::NonIncrementingRead {
            address,
            count: check_count(count)?,
        })
    }

    /// Creates an incrementing write.
    ///
    /// # Errors
    ///
    /// Returns an error if `data` is empty or longer than [`MAX_WORDS_PER_TRANSACTION`].
    pub fn write(address: u32, data: &[u32]) -> Result<Self> {
        check_count(data.len())?;
        Ok(Transaction::Write {
            address,
            data: data.to_vec(),
        })
    }

    /// Creates a read-modify-write that sets or clears the bits of `mask`.
    ///
    /// # Example
    ///
    /// ```
    /// use fit_ipbus::Transaction;
    ///
    /// let on = Transaction::set_bits(0x0E, 0b10, true);
    /// assert_eq!(on, Transaction::ReadModifyWriteBits { address: 0x0E, and: !0b10, or: 0b10 });
    /// ```
    pub fn set_bits(address: u32, mask: u32, state: bool) -> Self {
        Transaction::ReadModifyWriteBits {
            address,
            and: !mask,
            or: if state { mask } else { 0 },
        }
    }

    /// Creates a read-modify-write that replaces the bits of `mask` with `value`.
    pub fn set_field(address: u32, mask: u32, value: u32) -> Self {
        Transaction::ReadModifyWriteBits {
            address,
            and: !mask,
            or: value & mask,
        }
    }

    /// Register address targeted by this transaction.
    pub fn address(&self) -> u32 {
        match self {
            Transaction::Read { address, .. }
            | Transaction::NonIncrementingRead { address, .. }
            | Transaction::Write { address, .. }
            | Transaction::ReadModifyWriteBits { address, .. } => *address,
        }
    }

    /// Transaction type id.
    pub fn type_id(&self) -> TransactionType {
        match self {
            Transaction::Read { .. } => TransactionType::Read,
            Transaction::NonIncrementingRead { .. } => TransactionType::NonIncrementingRead,
            Transaction::Write { .. } => TransactionType::Write,
            Transaction::ReadModifyWriteBits { .. } => TransactionType::ReadModifyWriteBits,
        }
    }

    /// Value of the header's word count field.
    pub fn words(&self) -> u8 {
        match self {
            Transaction::Read { count, .. } | Transaction::NonIncrementingRead { count, .. } => {
                *count
            }
            Transaction::Write { data, .. } => data.len() as u8,
            Transaction::ReadModifyWriteBits { .. } => 1,
        }
    }

    /// Number of data words a successful reply carries.
    pub fn reply_words(&self) -> usize {
        self.type_id().reply_words(self.words())
    }

    /// Appends the request words (header, address, body) to `out`.
    pub(crate) fn encode(&self, transaction_id: u16, out: &mut Vec<u32>) {
        out.push(TransactionHeader::request(transaction_id, self.words(), self.type_id()).to_word());
        out.push(self.address());
        match self {
            Transaction::Read { .. } | Transaction::NonIncrementingRead { .. } => {}
            Transaction::Write { data, .. } => out.extend_from_slice(data),
            Transaction::ReadModifyWriteBits { and, or, .. } => {
                out.push(*and);
                out.push(*or);
            }
        }
    }
}

/// A control packet carrying one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlPacket {
    /// Packet header.
    pub header: PacketHeader,
    /// Transaction id used for the carried transaction.
    pub transaction_id: u16,
    /// The transaction.
    pub transaction: Transaction,
}

impl ControlPacket {
    /// Creates a packet.
    pub fn new(packet_id: u16, transaction_id: u16, transaction: Transaction) -> Self {
        Self {
            header: PacketHeader::control(packet_id),
            transaction_id: transaction_id & 0xFFF,
            transaction,
        }
    }

    /// Serializes to request words.
    pub fn to_words(&self) -> Vec<u32> {
        let mut words = Vec::with_capacity(4 + self.transaction.words() as usize);
        words.push(self.header.to_word());
        self.transaction.encode(self.transaction_id, &mut words);
        words
    }

    /// Serializes to datagram bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        words_to_bytes(&self.to_words())
    }
}

/// Status packet request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusRequest;

impl StatusRequest {
    /// Serializes to datagram bytes: the status header followed by 15 zero words.
    pub fn to_bytes(self) -> Vec<u8> {
        let mut words = vec![0u32; STATUS_PACKET_WORDS];
        words[0] = PacketHeader::status().to_word();
        words_to_bytes(&words)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_count_limits() {
        assert!(Transaction::read(0, 0).is_err());
        assert!(Transaction::read(0, 256).is_err());
        assert!(Transaction::read(0, 255).is_ok());
        assert!(Transaction::write(0, &[]).is_err());
    }

    #[test]
    fn test_read_packet_bytes() {
        let packet = ControlPacket::new(1, 0, Transaction::read(0x0000_1000, 4).unwrap());
        assert_eq!(
            hex::encode(packet.to_bytes()),
            "200001f0\
             2000040f\
             00001000"
        );
    }

    #[test]
    fn test_write_packet_words() {
        let packet = ControlPacket::new(2, 3, Transaction::write(0x20, &[5, 6]).unwrap());
        assert_eq!(
            packet.to_words(),
            vec![0x2000_02F0, 0x2003_021F, 0x20, 5, 6]
        );
    }

    #[test]
    fn test_rmw_packet_words() {
        let packet = ControlPacket::new(2, 1, Transaction::set_bits(0x0E, 0x1, true));
        assert_eq!(
            packet.to_words(),
            vec![0x2000_02F0, 0x2001_014F, 0x0E, 0xFFFF_FFFE, 0x1]
        );
    }

    #[test]
    fn test_set_field() {
        let txn = Transaction::set_field(0x01, 0xFFF0, 0x1234_5670);
        assert_eq!(
            txn,
            Transaction::ReadModifyWriteBits {
                address: 0x01,
                and: 0xFFFF_000F,
                or: 0x5670,
            }
        );
    }

    #[test]
    fn test_reply_words() {
        assert_eq!(Transaction::read(0, 9).unwrap().reply_words(), 9);
        assert_eq!(Transaction::write(0, &[1, 2]).unwrap().reply_words(), 0);
        assert_eq!(Transaction::set_bits(0, 1, false).reply_words(), 1);
    }

    #[test]
    fn test_status_request() {
        let bytes = StatusRequest.to_bytes();
        assert_eq!(bytes.len(), 64);
        assert_eq!(&bytes[..4], &[0x20, 0x00, 0x00, 0xF1]);
        assert!(bytes[4..].iter().all(|&b| b == 0));
    }
}
