//! IPbus packet and transaction headers.
//!
//! Every word on the wire is a 32-bit big-endian value.
//!
//! # Packet header
//!
//! | Bits | Field | Description |
//! |------|-------|-------------|
//! | 31..28 | Version | Protocol version (always 2) |
//! | 27..24 | RSV | Reserved (always 0) |
//! | 23..8 | Packet ID | Reliability counter, 0 for status packets |
//! | 7..4 | BOQ | Byte-order qualifier (always 0xF) |
//! | 3..0 | Type | 0 = control, 1 = status, 2 = resend request |
//!
//! # Transaction header
//!
//! | Bits | Field | Description |
//! |------|-------|-------------|
//! | 31..28 | Version | Protocol version (always 2) |
//! | 27..16 | Transaction ID | Matches replies to requests |
//! | 15..8 | Words | Number of data words in the body |
//! | 7..4 | Type ID | Read, write, read-modify-write... |
//! | 3..0 | Info code | 0xF in requests, 0 on success, other = bus error |
//!
//! # Example
//!
//! ```
//! use fit_ipbus::{PacketHeader, PacketType};
//!
//! let header = PacketHeader::control(0x0102);
//! assert_eq!(header.to_word(), 0x2001_02F0);
//! assert_eq!(PacketHeader::from_word(0x2001_02F0).unwrap(), header);
//! assert_eq!(header.packet_type, PacketType::Control);
//! ```

use crate::error::{FitError, Result};

/// IPbus protocol version carried in every header.
pub const PROTOCOL_VERSION: u8 = 2;

/// Byte-order qualifier of a correctly ordered packet header.
pub const BYTE_ORDER_QUALIFIER: u8 = 0xF;

/// Info code carried by every request transaction.
pub const INFO_REQUEST: u8 = 0xF;

/// Info code of a successful reply.
pub const INFO_SUCCESS: u8 = 0x0;

/// Kind of IPbus packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    /// Packet carrying transactions.
    Control,
    /// Target status query.
    Status,
    /// Request to resend the last reply.
    Resend,
}

impl PacketType {
    pub(crate) fn code(self) -> u8 {
        match self {
            PacketType::Control => 0x0,
            PacketType::Status => 0x1,
            PacketType::Resend => 0x2,
        }
    }

    pub(crate) fn from_code(code: u8) -> Result<Self> {
        match code {
            0x0 => Ok(PacketType::Control),
            0x1 => Ok(PacketType::Status),
            0x2 => Ok(PacketType::Resend),
            other => Err(FitError::invalid_response(format!(
                "unknown packet type 0x{:X}",
                other
            ))),
        }
    }
}

/// IPbus packet header (one word).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Packet id.
    pub packet_id: u16,
    /// Packet type.
    pub packet_type: PacketType,
}

impl PacketHeader {
    /// Creates a control packet header with the given id.
    pub fn control(packet_id: u16) -> Self {
        Self {
            packet_id,
            packet_type: PacketType::Control,
        }
    }

    /// Creates a status packet header (id is always 0).
    pub fn status() -> Self {
        Self {
            packet_id: 0,
            packet_type: PacketType::Status,
        }
    }

    /// Serializes the header to a word.
    pub fn to_word(self) -> u32 {
        (u32::from(PROTOCOL_VERSION) << 28)
            | (u32::from(self.packet_id) << 8)
            | (u32::from(BYTE_ORDER_QUALIFIER) << 4)
            | u32::from(self.packet_type.code())
    }

    /// Parses a header word.
    ///
    /// # Errors
    ///
    /// Returns `FitError::InvalidResponse` on a wrong version, byte order or
    /// packet type.
    pub fn from_word(word: u32) -> Result<Self> {
        let version = (word >> 28) as u8;
        if version != PROTOCOL_VERSION {
            return Err(FitError::invalid_response(format!(
                "packet header 0x{:08X}: unsupported protocol version {}",
                word, version
            )));
        }
        let boq = ((word >> 4) & 0xF) as u8;
        if boq != BYTE_ORDER_QUALIFIER {
            return Err(FitError::invalid_response(format!(
                "packet header 0x{:08X}: wrong byte-order qualifier 0x{:X}",
                word, boq
            )));
        }
        Ok(Self {
            packet_id: ((word >> 8) & 0xFFFF) as u16,
            packet_type: PacketType::from_code((word & 0xF) as u8)?,
        })
    }
}

/// Transaction type id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionType {
    /// Read consecutive registers.
    Read,
    /// Write consecutive registers.
    Write,
    /// Read one register repeatedly (FIFO port).
    NonIncrementingRead,
    /// Write one register repeatedly (FIFO port).
    NonIncrementingWrite,
    /// Atomic `(value & and) | or`, returns the previous value.
    ReadModifyWriteBits,
}

impl TransactionType {
    /// Returns the 4-bit type id.
    pub fn code(self) -> u8 {
        match self {
            TransactionType::Read => 0x0,
            TransactionType::Write => 0x1,
            TransactionType::NonIncrementingRead => 0x2,
            TransactionType::NonIncrementingWrite => 0x3,
            TransactionType::ReadModifyWriteBits => 0x4,
        }
    }

    /// Parses a 4-bit type id.
    ///
    /// # Errors
    ///
    /// Returns `FitError::InvalidResponse` for ids this crate does not speak.
    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            0x0 => Ok(TransactionType::Read),
            0x1 => Ok(TransactionType::Write),
            0x2 => Ok(TransactionType::NonIncrementingRead),
            0x3 => Ok(TransactionType::NonIncrementingWrite),
            0x4 => Ok(TransactionType::ReadModifyWriteBits),
            other => Err(FitError::invalid_response(format!(
                "unknown transaction type 0x{:X}",
                other
            ))),
        }
    }

    /// Number of data words following the header in a successful reply.
    pub(crate) fn reply_words(self, words: u8) -> usize {
        match self {
            TransactionType::Read | TransactionType::NonIncrementingRead => usize::from(words),
            TransactionType::Write | TransactionType::NonIncrementingWrite => 0,
            TransactionType::ReadModifyWriteBits => 1,
        }
    }
}

impl std::fmt::Display for TransactionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionType::Read => write!(f, "read"),
            TransactionType::Write => write!(f, "write"),
            TransactionType::NonIncrementingRead => write!(f, "non-incrementing read"),
            TransactionType::NonIncrementingWrite => write!(f, "non-incrementing write"),
            TransactionType::ReadModifyWriteBits => write!(f, "RMW bits"),
        }
    }
}

/// IPbus transaction header (one word).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionHeader {
    /// Transaction id (12 bits).
    pub transaction_id: u16,
    /// Word count field.
    pub words: u8,
    /// Type of transaction.
    pub type_id: TransactionType,
    /// Info code.
    pub info_code: u8,
}

impl TransactionHeader {
    /// Creates a request header.
    ///
    /// # Example
    ///
    /// ```
    /// use fit_ipbus::{TransactionHeader, TransactionType};
    ///
    /// let header = TransactionHeader::request(0x005, 4, TransactionType::Read);
    /// assert_eq!(header.to_word(), 0x2005_040F);
    /// ```
    pub fn request(transaction_id: u16, words: u8, type_id: TransactionType) -> Self {
        Self {
            transaction_id: transaction_id & 0xFFF,
            words,
            type_id,
            info_code: INFO_REQUEST,
        }
    }

    /// Serializes the header to a word.
    pub fn to_word(self) -> u32 {
        (u32::from(PROTOCOL_VERSION) << 28)
            | (u32::from(self.transaction_id & 0xFFF) << 16)
            | (u32::from(self.words) << 8)
            | (u32::from(self.type_id.code()) << 4)
            | u32::from(self.info_code & 0xF)
    }

    /// Parses a header word.
    ///
    /// # Errors
    ///
    /// Returns `FitError::InvalidResponse` on a wrong version or unknown type.
    pub fn from_word(word: u32) -> Result<Self> {
        let version = (word >> 28) as u8;
        if version != PROTOCOL_VERSION {
            return Err(FitError::invalid_response(format!(
                "transaction header 0x{:08X}: unsupported protocol version {}",
                word, version
            )));
        }
        Ok(Self {
            transaction_id: ((word >> 16) & 0xFFF) as u16,
            words: ((word >> 8) & 0xFF) as u8,
            type_id: TransactionType::from_code(((word >> 4) & 0xF) as u8)?,
            info_code: (word & 0xF) as u8,
        })
    }

    /// Returns whether the info code reports success.
    pub fn is_success(self) -> bool {
        self.info_code == INFO_SUCCESS
    }
}

/// Converts big-endian bytes to words.
///
/// # Errors
///
/// Returns `FitError::InvalidResponse` if the length is not a multiple of 4.
pub(crate) fn bytes_to_words(data: &[u8]) -> Result<Vec<u32>> {
    if data.len() % 4 != 0 {
        return Err(FitError::invalid_response(format!(
            "datagram length {} is not a whole number of words",
            data.len()
        )));
    }
    Ok(data
        .chunks_exact(4)
        .map(|chunk| u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

/// Converts words to big-endian bytes.
pub(crate) fn words_to_bytes(words: &[u32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(words.len() * 4);
    for word in words {
        bytes.extend_from_slice(&word.to_be_bytes());
    }
    bytes
}
