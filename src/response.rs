//! IPbus reply parsing and validation.
//!
//! A control reply consists of:
//!
//! | Component | Size | Description |
//! |-----------|------|-------------|
//! | Packet header | 1 word | Echoes the request's packet id |
//! | Transaction header | 1 word | Echoes id and type, carries the info code |
//! | Data | Variable | Read data, previous value for RMW, nothing for writes |
//!
//! Parsing ([`ControlReply::from_bytes`]) checks framing only. Matching a reply
//! against the request that produced it ([`ControlReply::check`]) is where
//! failures get their category: wrong ids or word counts are bus errors, a
//! reply for a different kind of transaction is a logic error.
//!
//! # Example
//!
//! ```
//! use fit_ipbus::{ControlPacket, ControlReply, Transaction};
//!
//! let request = ControlPacket::new(1, 0, Transaction::read(0x10, 2).unwrap());
//! let bytes = [
//!     0x20, 0x00, 0x01, 0xF0, // packet header
//!     0x20, 0x00, 0x02, 0x00, // read reply, 2 words, success
//!     0x00, 0x00, 0x12, 0x34,
//!     0x00, 0x00, 0x56, 0x78,
//! ];
//! let reply = ControlReply::from_bytes(&bytes).unwrap();
//! assert_eq!(reply.check(&request).unwrap(), &[0x1234, 0x5678]);
//! ```

use crate::command::{ControlPacket, STATUS_PACKET_WORDS};
use crate::error::{FitError, Result};
use crate::header::{bytes_to_words, PacketHeader, PacketType, TransactionHeader};

/// Minimum control reply size: packet header + transaction header.
pub const MIN_REPLY_WORDS: usize = 2;

/// Parsed control packet reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlReply {
    /// Packet header.
    pub header: PacketHeader,
    /// Transaction header.
    pub transaction: TransactionHeader,
    /// Reply body.
    pub data: Vec<u32>,
}

impl ControlReply {
    /// Parses a control reply from datagram bytes.
    ///
    /// # Errors
    ///
    /// Returns a bus-category error if the datagram is too short, a header is
    /// malformed, the packet is not a control packet, or the body length does
    /// not agree with the transaction header.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let words = bytes_to_words(data)?;
        if words.len() < MIN_REPLY_WORDS {
            return Err(FitError::invalid_response(format!(
                "reply too short: expected at least {} words, got {}",
                MIN_REPLY_WORDS,
                words.len()
            )));
        }

        let header = PacketHeader::from_word(words[0])?;
        if header.packet_type != PacketType::Control {
            return Err(FitError::invalid_response(format!(
                "expected control packet, got {:?}",
                header.packet_type
            )));
        }
        let transaction = TransactionHeader::from_word(words[1])?;
        let body = words[MIN_REPLY_WORDS..].to_vec();

        let declared = if transaction.is_success() {
            transaction.type_id.reply_words(transaction.words)
        } else {
            // Failed reads carry only the words actually read
            body.len().min(transaction.type_id.reply_words(transaction.words))
        };
        if body.len() != declared {
            return Err(FitError::word_count_mismatch(declared, body.len()));
        }

        Ok(Self {
            header,
            transaction,
            data: body,
        })
    }

    /// Matches the reply against its request and returns the data words.
    ///
    /// # Errors
    ///
    /// - `PacketIdMismatch` / `TransactionIdMismatch` if ids differ (bus)
    /// - `DeviceError` if the info code is not success (bus)
    /// - `WordCountMismatch` if fewer or more words came back than requested (bus)
    /// - `UnexpectedTransaction` if the reply is for another transaction type (logic)
    pub fn check(&self, request: &ControlPacket) -> Result<&[u32]> {
        self.check_header(request)?;
        if !self.transaction.is_success() {
            return Err(FitError::DeviceError {
                info_code: self.transaction.info_code,
                address: request.transaction.address(),
            });
        }
        let expected_words = request.transaction.reply_words();
        if self.data.len() != expected_words {
            return Err(FitError::word_count_mismatch(
                expected_words,
                self.data.len(),
            ));
        }
        Ok(&self.data)
    }

    /// Matches packet id, transaction id and type against the request,
    /// ignoring the info code and body.
    ///
    /// # Errors
    ///
    /// Same as [`check`](Self::check) minus the device error and word count checks.
    pub fn check_header(&self, request: &ControlPacket) -> Result<()> {
        if self.header.packet_id != request.header.packet_id {
            return Err(FitError::packet_id_mismatch(
                request.header.packet_id,
                self.header.packet_id,
            ));
        }
        if self.transaction.transaction_id != request.transaction_id {
            return Err(FitError::TransactionIdMismatch {
                expected: request.transaction_id,
                received: self.transaction.transaction_id,
            });
        }
        let expected_type = request.transaction.type_id();
        if self.transaction.type_id != expected_type {
            return Err(FitError::UnexpectedTransaction {
                expected: expected_type.code(),
                received: self.transaction.type_id.code(),
            });
        }
        Ok(())
    }
}

/// Parsed status packet reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusReply {
    /// Maximum transmission unit of the target in bytes.
    pub mtu: u32,
    /// Number of reply buffers of the target.
    pub buffers: u32,
    /// Packet id the target expects next.
    pub next_packet_id: u16,
}

impl StatusReply {
    /// Parses a status reply.
    ///
    /// # Errors
    ///
    /// Returns a bus-category error if the reply is not exactly 16 words or
    /// its headers are malformed.
    ///
    /// # Example
    ///
    /// ```
    /// use fit_ipbus::StatusReply;
    ///
    /// let mut words = [0u32; 16];
    /// words[0] = 0x2000_00F1;
    /// words[1] = 1500;
    /// words[2] = 2;
    /// words[3] = 0x2000_2AF0;
    /// let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_be_bytes()).collect();
    /// let reply = StatusReply::from_bytes(&bytes).unwrap();
    /// assert_eq!(reply.next_packet_id, 0x2A);
    /// ```
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let words = bytes_to_words(data)?;
        if words.len() != STATUS_PACKET_WORDS {
            return Err(FitError::word_count_mismatch(
                STATUS_PACKET_WORDS,
                words.len(),
            ));
        }
        let header = PacketHeader::from_word(words[0])?;
        if header.packet_type != PacketType::Status {
            return Err(FitError::invalid_response(format!(
                "expected status packet, got {:?}",
                header.packet_type
            )));
        }
        let next = PacketHeader::from_word(words[3])?;
        Ok(Self {
            mtu: words[1],
            buffers: words[2],
            next_packet_id: next.packet_id,
        })
    }
}
