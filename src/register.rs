//! Register map of the histogramming board.
//!
//! Addresses and bit layouts are data, not code: a [`RegisterMap`] names every
//! register the model touches and can be loaded from the `[registers]` table
//! of the settings file. [`RegisterMap::default`] is the compiled-in map.
//!
//! | Register | Default | Fields |
//! |----------|---------|--------|
//! | `board_status` | 0x00 | `pll_locked` [3:0], `sync_error` [4], `resetting` [5] |
//! | `hist_control` | 0x01 | `hist_on` [0], `filter_on` [1], `bcid` [15:4] |
//! | `trigger_link` | 0x02 | `link_ok` [0] |
//! | `cur_address` | 0x03 | memory read pointer |
//! | `channel_select` | 0x04 | selected link [4:0] |
//! | `reset` | 0x05 | write `reset_mask` to reset |
//! | `link_mask` | 0x06 | present links [19:0] |
//! | `hist_base` | 0x1_0000 | first histogram word of channel 1 |
//!
//! The four status registers are read together by a single transaction, so
//! they must lie within [`MAX_WORDS_PER_TRANSACTION`] words of each other.

use serde::{Deserialize, Serialize};

use crate::command::MAX_WORDS_PER_TRANSACTION;
use crate::error::ConfigError;
use crate::histogram::CHANNEL_WORDS;
use crate::utils;

/// A bit field inside a 32-bit register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitField {
    /// Position of the least significant bit.
    pub shift: u8,
    /// Number of bits.
    pub width: u8,
}

impl BitField {
    /// Creates a field.
    pub const fn new(shift: u8, width: u8) -> Self {
        Self { shift, width }
    }

    /// Creates a one-bit field.
    pub const fn bit(shift: u8) -> Self {
        Self { shift, width: 1 }
    }

    /// Largest value the field can hold.
    ///
    /// ```
    /// use fit_ipbus::BitField;
    ///
    /// assert_eq!(BitField::new(4, 12).max_value(), 4095);
    /// ```
    pub fn max_value(self) -> u32 {
        utils::field_mask(self.width)
    }

    /// Mask of the field in register position.
    pub fn mask(self) -> u32 {
        self.max_value() << self.shift
    }

    /// Extracts the field from a register word.
    pub fn get(self, word: u32) -> u32 {
        utils::extract_field(word, self.shift, self.width)
    }

    /// Extracts a one-bit field as a flag.
    pub fn is_set(self, word: u32) -> bool {
        self.get(word) != 0
    }

    /// Returns `value` moved into register position.
    pub fn place(self, value: u32) -> u32 {
        (value & self.max_value()) << self.shift
    }

    fn fits(self) -> bool {
        self.width > 0 && u32::from(self.shift) + u32::from(self.width) <= 32
    }
}

/// Register addresses and bit layouts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegisterMap {
    /// Board status register.
    pub board_status: u32,
    /// Per-PLL lock flags in `board_status`.
    pub pll_locked: BitField,
    /// Synchronization error flag in `board_status`.
    pub sync_error: BitField,
    /// Board-is-resetting flag in `board_status`.
    pub resetting: BitField,

    /// Histogram control register.
    pub hist_control: u32,
    /// Histogramming enable bit in `hist_control`.
    pub hist_on: BitField,
    /// Filter enable bit in `hist_control`.
    pub filter_on: BitField,
    /// Beam-crossing-ID field in `hist_control`.
    pub bcid: BitField,

    /// Trigger link status register.
    pub trigger_link: u32,
    /// Link OK flag in `trigger_link`.
    pub link_ok: BitField,

    /// Histogram memory read pointer.
    pub cur_address: u32,

    /// Register selecting the link whose memory is mapped for readout.
    pub channel_select: u32,
    /// Link index field in `channel_select`.
    pub channel_field: BitField,

    /// Reset command register.
    pub reset: u32,
    /// Value written to `reset` to start a reset.
    pub reset_mask: u32,

    /// Present-links register.
    pub link_mask: u32,
    /// Link presence bits in `link_mask`.
    pub link_field: BitField,

    /// Address of the first histogram word of channel 1.
    pub hist_base: u32,
    /// Distance between the first words of consecutive channels.
    pub hist_stride: u32,
}

impl Default for RegisterMap {
    fn default() -> Self {
        Self {
            board_status: 0x00,
            pll_locked: BitField::new(0, 4),
            sync_error: BitField::bit(4),
            resetting: BitField::bit(5),
            hist_control: 0x01,
            hist_on: BitField::bit(0),
            filter_on: BitField::bit(1),
            bcid: BitField::new(4, 12),
            trigger_link: 0x02,
            link_ok: BitField::bit(0),
            cur_address: 0x03,
            channel_select: 0x04,
            channel_field: BitField::new(0, 5),
            reset: 0x05,
            reset_mask: 0x1,
            link_mask: 0x06,
            link_field: BitField::new(0, 20),
            hist_base: 0x0001_0000,
            hist_stride: CHANNEL_WORDS as u32,
        }
    }
}

impl RegisterMap {
    /// First address and length of the block covering all status registers.
    pub fn status_block(&self) -> (u32, usize) {
        let regs = [
            self.board_status,
            self.hist_control,
            self.trigger_link,
            self.cur_address,
        ];
        let first = regs.iter().copied().min().unwrap_or(self.board_status);
        let last = regs.iter().copied().max().unwrap_or(self.board_status);
        (first, (last - first) as usize + 1)
    }

    /// Address of the first histogram word of `channel` (0-based).
    pub fn channel_base(&self, channel: usize) -> u32 {
        self.hist_base
            .wrapping_add((channel as u32).wrapping_mul(self.hist_stride))
    }

    /// Checks that the map is usable.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Validation` if a bit field does not fit in 32 bits,
    /// the status registers span more than one transaction, or channel
    /// windows overlap.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fields = [
            ("pll_locked", self.pll_locked),
            ("sync_error", self.sync_error),
            ("resetting", self.resetting),
            ("hist_on", self.hist_on),
            ("filter_on", self.filter_on),
            ("bcid", self.bcid),
            ("link_ok", self.link_ok),
            ("channel_field", self.channel_field),
            ("link_field", self.link_field),
        ];
        for (name, field) in fields {
            if !field.fits() {
                return Err(ConfigError::Validation {
                    field: format!("registers.{name}"),
                    reason: format!(
                        "shift {} + width {} does not fit a 32-bit register",
                        field.shift, field.width
                    ),
                });
            }
        }

        let (_, span) = self.status_block();
        if span > MAX_WORDS_PER_TRANSACTION {
            return Err(ConfigError::Validation {
                field: "registers".into(),
                reason: format!(
                    "status registers span {} words, more than one transaction",
                    span
                ),
            });
        }

        if (self.hist_stride as usize) < CHANNEL_WORDS {
            return Err(ConfigError::Validation {
                field: "registers.hist_stride".into(),
                reason: format!("must be at least {}", CHANNEL_WORDS),
            });
        }
        Ok(())
    }
}
