//! Decoded board status.
//!
//! One status poll reads the register block described by
//! [`RegisterMap::status_block`] and decodes it into a [`StatusSnapshot`].

use crate::register::RegisterMap;

/// Board-level status flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BoardStatus {
    /// Per-PLL lock flags.
    pub pll_locked: u32,
    /// Synchronization error.
    pub sync_error: bool,
    /// Board is in the middle of a reset; commands are not effective.
    pub resetting: bool,
}

impl BoardStatus {
    /// Returns whether the lowest `pll_count` PLLs are all locked and
    /// there is no synchronization error.
    pub fn clock_ok(&self, pll_count: u8) -> bool {
        self.pll_locked == crate::utils::field_mask(pll_count) && !self.sync_error
    }
}

/// Histogramming control state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HistStatus {
    /// Histogramming enabled.
    pub hist_on: bool,
    /// Filter enabled.
    pub filter_on: bool,
    /// Beam-crossing-ID selection.
    pub bcid: u32,
}

/// Trigger link status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TriggerLinkStatus {
    /// Trigger link is up.
    pub link_ok: bool,
}

/// Consistent view of everything one status poll reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusSnapshot {
    /// Board flags.
    pub board: BoardStatus,
    /// Histogram control.
    pub hist: HistStatus,
    /// Trigger link.
    pub trigger: TriggerLinkStatus,
    /// Histogram memory read pointer.
    pub cur_address: u32,
    /// The last poll after this snapshot was taken failed.
    pub stale: bool,
}

impl StatusSnapshot {
    /// Decodes the status block read from `block_start`.
    ///
    /// Returns `None` if `block` does not cover every status register.
    ///
    /// # Example
    ///
    /// ```
    /// use fit_ipbus::{RegisterMap, StatusSnapshot};
    ///
    /// let map = RegisterMap::default();
    /// let block = [0b1_1111, 0x0453, 0x1, 0x80];
    /// let status = StatusSnapshot::decode(&map, 0, &block).unwrap();
    /// assert_eq!(status.board.pll_locked, 0b1111);
    /// assert!(status.board.sync_error);
    /// assert!(status.hist.hist_on && status.hist.filter_on);
    /// assert_eq!(status.hist.bcid, 0x45);
    /// assert!(status.trigger.link_ok);
    /// assert_eq!(status.cur_address, 0x80);
    /// ```
    pub fn decode(map: &RegisterMap, block_start: u32, block: &[u32]) -> Option<Self> {
        let word = |address: u32| -> Option<u32> {
            let offset = address.checked_sub(block_start)? as usize;
            block.get(offset).copied()
        };

        let board = word(map.board_status)?;
        let hist = word(map.hist_control)?;
        let trigger = word(map.trigger_link)?;
        let cur_address = word(map.cur_address)?;

        Some(Self {
            board: decode_board(map, board),
            hist: decode_hist(map, hist),
            trigger: TriggerLinkStatus {
                link_ok: map.link_ok.is_set(trigger),
            },
            cur_address,
            stale: false,
        })
    }
}

/// Decodes the board status register.
pub fn decode_board(map: &RegisterMap, word: u32) -> BoardStatus {
    BoardStatus {
        pll_locked: map.pll_locked.get(word),
        sync_error: map.sync_error.is_set(word),
        resetting: map.resetting.is_set(word),
    }
}

/// Decodes the histogram control register.
pub fn decode_hist(map: &RegisterMap, word: u32) -> HistStatus {
    HistStatus {
        hist_on: map.hist_on.is_set(word),
        filter_on: map.filter_on.is_set(word),
        bcid: map.bcid.get(word),
    }
}
