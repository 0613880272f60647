//! Domain model of one FIT histogramming board.
//!
//! [`FitElectronics`] owns a [`Target`], the [`RegisterMap`] and everything
//! cached from the board: the last [`StatusSnapshot`], the link mask, the
//! channel selection and the [`HistogramData`] buffer. Every operation is a
//! short sequence of bus transactions; failures are reported through the
//! target's [`Notifier`] and leave the cache as it was.
//!
//! # Example
//!
//! ```
//! use fit_ipbus::sim::SimulatedBoard;
//! use fit_ipbus::{FitElectronics, Notifier, RegisterMap, Target, TargetAddress, TargetConfig};
//!
//! let board = SimulatedBoard::new();
//! let target = Target::new(board, TargetConfig::new(TargetAddress::default()), Notifier::new());
//! let mut fit = FitElectronics::new(target, RegisterMap::default());
//!
//! fit.reconnect()?;
//! fit.switch_hist(true)?;
//! fit.set_bcid(0x123)?;
//! assert_eq!(fit.read_histograms(), fit_ipbus::HISTOGRAM_WORDS);
//! # Ok::<(), fit_ipbus::FitError>(())
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};

use crate::address::TargetAddress;
use crate::client::{ConnectionState, Target};
use crate::command::MAX_WORDS_PER_TRANSACTION;
use crate::error::{FitError, Result};
use crate::histogram::{HistogramData, CHANNELS, CHANNEL_WORDS, HISTOGRAM_WORDS};
use crate::notify::{Event, Notifier};
use crate::register::{BitField, RegisterMap};
use crate::status::{decode_hist, StatusSnapshot};
use crate::transport::Transport;
use crate::utils::{self, LINK_COUNT};

/// How bulk histogram reads are split and retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadPolicy {
    /// Words per block read, 1..=255.
    pub block_words: usize,
    /// Extra attempts for a block that came back short or not at all.
    pub block_retries: u32,
}

impl Default for ReadPolicy {
    fn default() -> Self {
        Self {
            block_words: MAX_WORDS_PER_TRANSACTION,
            block_retries: 2,
        }
    }
}

impl ReadPolicy {
    fn block_words(&self) -> usize {
        self.block_words.clamp(1, MAX_WORDS_PER_TRANSACTION)
    }
}

/// Cached view of one board plus the operations that change it.
pub struct FitElectronics<T: Transport> {
    target: Target<T>,
    map: RegisterMap,
    policy: ReadPolicy,
    status: StatusSnapshot,
    link_mask: Option<u32>,
    cur_pm: u8,
    synced_pm: Option<u8>,
    histograms: Arc<HistogramData>,
    abandon: Arc<AtomicBool>,
}

impl<T: Transport> FitElectronics<T> {
    /// Creates a model over `target` using `map`.
    pub fn new(target: Target<T>, map: RegisterMap) -> Self {
        Self {
            target,
            map,
            policy: ReadPolicy::default(),
            status: StatusSnapshot::default(),
            link_mask: None,
            cur_pm: 0,
            synced_pm: None,
            histograms: Arc::new(HistogramData::default()),
            abandon: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Replaces the bulk read policy.
    pub fn with_read_policy(mut self, policy: ReadPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Drops everything cached, reconnects and polls.
    ///
    /// # Errors
    ///
    /// Returns the first failure; it has already been reported.
    pub fn reconnect(&mut self) -> Result<()> {
        self.status = StatusSnapshot::default();
        self.link_mask = None;
        self.synced_pm = None;
        self.target.connect(self.target.address())?;
        self.poll_status().map(|_| ())
    }

    /// Validates `address`, switches to it and reconnects.
    ///
    /// # Errors
    ///
    /// Returns a logic error for an invalid address, without touching the
    /// current connection.
    pub fn change_target(&mut self, address: &str) -> Result<()> {
        let address = match TargetAddress::parse(address) {
            Ok(address) => address,
            Err(e) => return Err(self.fail(e)),
        };
        if address != self.target.address() {
            info!("target changed to {}", address);
        }
        self.status = StatusSnapshot::default();
        self.link_mask = None;
        self.synced_pm = None;
        self.target.connect(address)?;
        self.poll_status().map(|_| ())
    }

    /// Reads and decodes the status block.
    ///
    /// On success the snapshot replaces the cached one and
    /// [`Event::StatusReady`] is raised; on the first success after
    /// connecting or losing the board, [`Event::Online`] comes first and the
    /// link mask is fetched. On failure the cached snapshot is marked stale.
    ///
    /// # Errors
    ///
    /// Returns the failure; it has already been reported.
    pub fn poll_status(&mut self) -> Result<StatusSnapshot> {
        let (start, len) = self.map.status_block();
        let block = match self.target.read(start, len) {
            Ok(block) => block,
            Err(e) => {
                self.status.stale = true;
                return Err(e);
            }
        };
        let snapshot = match StatusSnapshot::decode(&self.map, start, &block) {
            Some(snapshot) => snapshot,
            None => {
                self.status.stale = true;
                return Err(self.fail(FitError::word_count_mismatch(len, block.len())));
            }
        };
        debug!(
            "status: pll=0x{:X} sync_error={} resetting={} hist_on={} filter_on={} bcid={}",
            snapshot.board.pll_locked,
            snapshot.board.sync_error,
            snapshot.board.resetting,
            snapshot.hist.hist_on,
            snapshot.hist.filter_on,
            snapshot.hist.bcid
        );
        self.status = snapshot;

        let previous = self.target.mark_online();
        if previous != ConnectionState::Online {
            self.target.notifier().emit(Event::Online);
        }
        if previous != ConnectionState::Online || self.link_mask.is_none() {
            if let Err(e) = self.fetch_link_mask() {
                // A bus error leaves the board online and the mask is
                // fetched again on the next poll
                if self.target.state() != ConnectionState::Online {
                    self.status.stale = true;
                    return Err(e);
                }
            }
        }
        self.target.notifier().emit(Event::StatusReady(snapshot));
        Ok(snapshot)
    }

    fn fetch_link_mask(&mut self) -> Result<()> {
        let word = self.target.read_register(self.map.link_mask)?;
        let mask = self.map.link_field.get(word);
        info!("links present: {}", utils::present_links(mask).join(" "));
        self.link_mask = Some(mask);
        self.target.notifier().emit(Event::LinkMaskReady(mask));
        Ok(())
    }

    /// Selects link `index` (0..20) for readout and syncs it to the board.
    ///
    /// # Errors
    ///
    /// Returns a logic error without any transaction if `index` is out of
    /// range, otherwise see [`sync`](Self::sync).
    pub fn select_channel(&mut self, index: u8) -> Result<()> {
        if index >= LINK_COUNT {
            return Err(self.fail(FitError::invalid_parameter(
                "channel",
                format!("{} is not a link index (0..{})", index, LINK_COUNT),
            )));
        }
        self.cur_pm = index;
        self.sync()
    }

    /// Writes the selected link to the channel-select register.
    ///
    /// # Errors
    ///
    /// Returns the failure; it has already been reported.
    pub fn sync(&mut self) -> Result<()> {
        let field = self.map.channel_field;
        self.target.set_field(
            self.map.channel_select,
            field.mask(),
            field.place(u32::from(self.cur_pm)),
        )?;
        debug!(
            "channel {} synced",
            utils::link_name(self.cur_pm).unwrap_or_default()
        );
        self.synced_pm = Some(self.cur_pm);
        Ok(())
    }

    /// Turns histogramming on or off.
    ///
    /// # Errors
    ///
    /// Returns the failure; it has already been reported.
    pub fn switch_hist(&mut self, enable: bool) -> Result<()> {
        self.switch_bit(self.map.hist_on, enable)
    }

    /// Turns the filter on or off.
    ///
    /// # Errors
    ///
    /// Returns the failure; it has already been reported.
    pub fn switch_filter(&mut self, enable: bool) -> Result<()> {
        self.switch_bit(self.map.filter_on, enable)
    }

    fn switch_bit(&mut self, bit: BitField, enable: bool) -> Result<()> {
        let mask = bit.mask();
        let previous = self.target.set_bits(self.map.hist_control, mask, enable)?;
        let current = if enable {
            previous | mask
        } else {
            previous & !mask
        };
        self.status.hist = decode_hist(&self.map, current);
        Ok(())
    }

    /// Sets the beam-crossing-ID selection.
    ///
    /// # Errors
    ///
    /// Returns a logic error without any transaction if `value` does not fit
    /// the register field, otherwise the reported bus failure.
    pub fn set_bcid(&mut self, value: u32) -> Result<()> {
        let field = self.map.bcid;
        if value > field.max_value() {
            return Err(self.fail(FitError::invalid_parameter(
                "bcid",
                format!("{} exceeds maximum {}", value, field.max_value()),
            )));
        }
        let previous =
            self.target
                .set_field(self.map.hist_control, field.mask(), field.place(value))?;
        let current = (previous & !field.mask()) | field.place(value);
        self.status.hist = decode_hist(&self.map, current);
        Ok(())
    }

    /// Issues a reset. The board reports `resetting` on the next poll and
    /// forgets the channel selection.
    ///
    /// # Errors
    ///
    /// Returns the failure; it has already been reported.
    pub fn reset(&mut self) -> Result<()> {
        self.target
            .write_register(self.map.reset, self.map.reset_mask)?;
        info!("{}: reset issued", self.target.address());
        self.synced_pm = None;
        Ok(())
    }

    /// Reads the histogram memory of all channels of the selected link.
    ///
    /// Returns the number of words received. The buffer is replaced only if
    /// that equals [`HISTOGRAM_WORDS`]; a short count leaves the previous
    /// buffer untouched and raises no notification. Raising the
    /// [`abandon_handle`](Self::abandon_handle) while the read runs stops it
    /// before the next block; raising it earlier has no effect.
    pub fn read_histograms(&mut self) -> usize {
        self.abandon.store(false, Ordering::SeqCst);
        if self.synced_pm != Some(self.cur_pm) && self.sync().is_err() {
            return 0;
        }

        let block_words = self.policy.block_words();
        let mut words = Vec::with_capacity(HISTOGRAM_WORDS);

        'channels: for channel in 0..CHANNELS {
            let base = self.map.channel_base(channel);
            let mut offset = 0;
            while offset < CHANNEL_WORDS {
                if self.abandon.swap(false, Ordering::SeqCst) {
                    info!("histogram read abandoned after {} words", words.len());
                    break 'channels;
                }
                let count = block_words.min(CHANNEL_WORDS - offset);
                let address = base.wrapping_add(offset as u32);
                let block = self.read_block_with_retries(address, count);
                let complete = block.len() == count;
                words.extend(block);
                if !complete {
                    break 'channels;
                }
                offset += count;
            }
        }

        let count = words.len();
        if count != HISTOGRAM_WORDS {
            warn!(
                "histogram read incomplete: {} of {} words",
                count, HISTOGRAM_WORDS
            );
            return count;
        }
        match HistogramData::from_words(&words) {
            Some(data) => {
                self.histograms = Arc::new(data);
                info!("histograms read: {} words", count);
                count
            }
            None => 0,
        }
    }

    /// Reads one block, keeping the longest answer over all attempts.
    fn read_block_with_retries(&mut self, address: u32, count: usize) -> Vec<u32> {
        let mut best = Vec::new();
        for attempt in 0..=self.policy.block_retries {
            match self.target.read_block(address, count) {
                Ok(block) if block.len() == count => return block,
                Ok(block) => {
                    debug!(
                        "block {} attempt {}: {} of {} words",
                        utils::format_hex(address),
                        attempt + 1,
                        block.len(),
                        count
                    );
                    if block.len() > best.len() {
                        best = block;
                    }
                }
                Err(e) => debug!(
                    "block {} attempt {}: {}",
                    utils::format_hex(address),
                    attempt + 1,
                    e
                ),
            }
        }
        warn!(
            "block {}: gave up after {} attempts",
            utils::format_hex(address),
            self.policy.block_retries + 1
        );
        best
    }

    fn fail(&self, err: FitError) -> FitError {
        self.target.reject(&err);
        err
    }

    /// Last decoded status.
    pub fn status(&self) -> &StatusSnapshot {
        &self.status
    }

    /// Present links, if fetched since the last reconnect.
    pub fn link_mask(&self) -> Option<u32> {
        self.link_mask
    }

    /// Link selected for readout.
    pub fn current_channel(&self) -> u8 {
        self.cur_pm
    }

    /// Link the board last acknowledged, if any.
    pub fn synced_channel(&self) -> Option<u8> {
        self.synced_pm
    }

    /// Last complete histogram readout.
    pub fn histograms(&self) -> Arc<HistogramData> {
        Arc::clone(&self.histograms)
    }

    /// Flag that abandons the bulk read in progress after its current block.
    /// Each read clears it when it starts.
    pub fn abandon_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.abandon)
    }

    /// Connection state.
    pub fn state(&self) -> ConnectionState {
        self.target.state()
    }

    /// Whether the last exchange with the board succeeded.
    pub fn is_online(&self) -> bool {
        self.target.is_online()
    }

    /// Register map in use.
    pub fn map(&self) -> &RegisterMap {
        &self.map
    }

    /// Bulk read policy in use.
    pub fn read_policy(&self) -> ReadPolicy {
        self.policy
    }

    /// Notification fan-out.
    pub fn notifier(&self) -> &Notifier {
        self.target.notifier()
    }

    /// Bus client.
    pub fn target(&self) -> &Target<T> {
        &self.target
    }

    /// Bus client, mutably.
    pub fn target_mut(&mut self) -> &mut Target<T> {
        &mut self.target
    }
}

impl<T: Transport> std::fmt::Debug for FitElectronics<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FitElectronics")
            .field("target", &self.target)
            .field("status", &self.status)
            .field("link_mask", &self.link_mask)
            .field("cur_pm", &self.cur_pm)
            .field("synced_pm", &self.synced_pm)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::Receiver;

    use super::*;
    use crate::client::TargetConfig;
    use crate::error::ErrorKind;
    use crate::header::TransactionType;
    use crate::sim::{histogram_word, Fault, LogEntry, SimulatedBoard};

    fn model(board: &SimulatedBoard) -> (FitElectronics<SimulatedBoard>, Receiver<Event>) {
        let notifier = Notifier::new();
        let events = notifier.subscribe();
        let target = Target::new(
            board.clone(),
            TargetConfig::new(TargetAddress::default()),
            notifier,
        );
        (FitElectronics::new(target, RegisterMap::default()), events)
    }

    fn errors(events: &Receiver<Event>) -> Vec<ErrorKind> {
        events.try_iter().filter_map(|e| e.error_kind()).collect()
    }

    #[test]
    fn test_reconnect_goes_online() {
        let board = SimulatedBoard::new();
        let (mut fit, events) = model(&board);
        assert_eq!(fit.state(), ConnectionState::Disconnected);

        fit.reconnect().unwrap();
        assert_eq!(fit.state(), ConnectionState::Online);
        assert_eq!(fit.link_mask(), Some(0b11));

        let received: Vec<Event> = events.try_iter().collect();
        assert_eq!(received[0], Event::Online);
        assert_eq!(received[1], Event::LinkMaskReady(0b11));
        assert!(matches!(received[2], Event::StatusReady(_)));
        assert_eq!(received.len(), 3);
    }

    #[test]
    fn test_reconnect_idempotent() {
        let board = SimulatedBoard::new();
        let (mut once, _) = model(&board);
        once.reconnect().unwrap();

        let (mut twice, _) = model(&board);
        twice.reconnect().unwrap();
        twice.reconnect().unwrap();

        assert_eq!(once.state(), twice.state());
        assert_eq!(once.status(), twice.status());
        assert_eq!(once.link_mask(), twice.link_mask());
    }

    #[test]
    fn test_reconnect_unreachable() {
        let board = SimulatedBoard::new();
        board.with_state(|s| s.set_powered(false));
        let (mut fit, events) = model(&board);

        assert!(fit.reconnect().is_err());
        assert!(fit.reconnect().is_err());
        assert_eq!(fit.state(), ConnectionState::Unreachable);
        assert_eq!(fit.link_mask(), None);

        // Each attempt passes through Connecting, so each one is a transition
        let received: Vec<Event> = events.try_iter().collect();
        let unreachable = received
            .iter()
            .filter(|e| **e == Event::Unreachable)
            .count();
        assert_eq!(unreachable, 2);
        assert!(!received.contains(&Event::Online));
    }

    #[test]
    fn test_change_target_rejects_invalid() {
        let board = SimulatedBoard::new();
        let (mut fit, events) = model(&board);
        fit.reconnect().unwrap();
        events.try_iter().count();

        for bad in ["", "256.1.1.1", "1.2.3", "1.2.3.4.5"] {
            let err = fit.change_target(bad).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Logic);
        }
        assert_eq!(errors(&events), vec![ErrorKind::Logic; 4]);
        assert_eq!(fit.target().address(), TargetAddress::default());
        assert_eq!(fit.state(), ConnectionState::Online);
    }

    #[test]
    fn test_change_target_reconnects() {
        let board = SimulatedBoard::new();
        let (mut fit, _) = model(&board);
        fit.change_target("10.0.0.7").unwrap();
        assert_eq!(fit.target().address().to_string(), "10.0.0.7");
        assert_eq!(fit.state(), ConnectionState::Online);
    }

    #[test]
    fn test_switch_hist_round_trip() {
        let board = SimulatedBoard::new();
        let (mut fit, _) = model(&board);
        fit.reconnect().unwrap();

        fit.switch_hist(true).unwrap();
        assert!(fit.status().hist.hist_on);
        assert!(fit.poll_status().unwrap().hist.hist_on);

        fit.switch_hist(false).unwrap();
        assert!(!fit.status().hist.hist_on);
        assert!(!fit.poll_status().unwrap().hist.hist_on);
    }

    #[test]
    fn test_switch_filter_keeps_other_bits() {
        let board = SimulatedBoard::new();
        let (mut fit, _) = model(&board);
        fit.reconnect().unwrap();
        fit.switch_hist(true).unwrap();
        fit.set_bcid(0x7FF).unwrap();

        fit.switch_filter(true).unwrap();
        let status = fit.poll_status().unwrap();
        assert!(status.hist.hist_on);
        assert!(status.hist.filter_on);
        assert_eq!(status.hist.bcid, 0x7FF);
    }

    #[test]
    fn test_switch_failure_leaves_cache() {
        let board = SimulatedBoard::new();
        let (mut fit, _) = model(&board);
        fit.reconnect().unwrap();
        board.with_state(|s| s.inject(Fault::Timeout));

        assert!(fit.switch_hist(true).is_err());
        assert!(!fit.status().hist.hist_on);
    }

    #[test]
    fn test_bcid_out_of_range_sends_nothing() {
        let board = SimulatedBoard::new();
        let (mut fit, events) = model(&board);
        fit.reconnect().unwrap();
        events.try_iter().count();
        let before = board.with_state(|s| s.transaction_count());

        let err = fit.set_bcid(4096).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Logic);
        assert_eq!(board.with_state(|s| s.transaction_count()), before);
        assert_eq!(errors(&events), vec![ErrorKind::Logic]);
    }

    #[test]
    fn test_bcid_applied() {
        let board = SimulatedBoard::new();
        let (mut fit, _) = model(&board);
        fit.reconnect().unwrap();
        fit.set_bcid(4095).unwrap();
        assert_eq!(fit.status().hist.bcid, 4095);
        assert_eq!(fit.poll_status().unwrap().hist.bcid, 4095);
    }

    #[test]
    fn test_timeout_marks_unreachable_and_stale() {
        let board = SimulatedBoard::new();
        let (mut fit, events) = model(&board);
        fit.reconnect().unwrap();
        events.try_iter().count();

        board.with_state(|s| s.inject(Fault::Timeout));
        assert!(fit.poll_status().is_err());
        assert_eq!(fit.state(), ConnectionState::Unreachable);
        assert!(fit.status().stale);

        let received: Vec<Event> = events.try_iter().collect();
        assert_eq!(
            received.iter().filter_map(|e| e.error_kind()).collect::<Vec<_>>(),
            vec![ErrorKind::Network]
        );
        assert!(received.contains(&Event::Unreachable));

        // Recovers on the next poll
        let status = fit.poll_status().unwrap();
        assert!(!status.stale);
        assert_eq!(fit.state(), ConnectionState::Online);
        let received: Vec<Event> = events.try_iter().collect();
        assert_eq!(received[0], Event::Online);
    }

    #[test]
    fn test_corrupted_header_keeps_state() {
        let board = SimulatedBoard::new();
        let (mut fit, events) = model(&board);
        fit.reconnect().unwrap();
        events.try_iter().count();

        board.with_state(|s| s.inject(Fault::CorruptHeader));
        assert!(fit.poll_status().is_err());
        assert_eq!(fit.state(), ConnectionState::Online);
        assert_eq!(errors(&events), vec![ErrorKind::Bus]);
    }

    #[test]
    fn test_reset_reported_once() {
        let board = SimulatedBoard::new();
        let (mut fit, _) = model(&board);
        fit.reconnect().unwrap();
        fit.select_channel(3).unwrap();
        fit.switch_hist(true).unwrap();

        fit.reset().unwrap();
        assert_eq!(fit.synced_channel(), None);
        let status = fit.poll_status().unwrap();
        assert!(status.board.resetting);
        assert!(!status.hist.hist_on);
        assert!(!fit.poll_status().unwrap().board.resetting);
    }

    #[test]
    fn test_select_channel_range() {
        let board = SimulatedBoard::new();
        let (mut fit, events) = model(&board);
        fit.reconnect().unwrap();
        events.try_iter().count();

        fit.select_channel(19).unwrap();
        assert_eq!(fit.synced_channel(), Some(19));
        assert_eq!(board.with_state(|s| s.selected_link()), 19);

        assert!(fit.select_channel(20).is_err());
        assert_eq!(fit.current_channel(), 19);
        assert_eq!(errors(&events), vec![ErrorKind::Logic]);
    }

    #[test]
    fn test_full_read() {
        let board = SimulatedBoard::new();
        let (mut fit, _) = model(&board);
        fit.reconnect().unwrap();
        fit.select_channel(2).unwrap();

        assert_eq!(fit.read_histograms(), HISTOGRAM_WORDS);
        let data = fit.histograms();
        let map = RegisterMap::default();
        assert_eq!(data.channels.len(), CHANNELS);
        for (ch, hist) in data.channels.iter().enumerate() {
            assert_eq!(hist.n_adc0.len(), 256);
            assert_eq!(hist.n_adc1.len(), 256);
            assert_eq!(hist.time.len(), 4096);
            assert_eq!(hist.p_adc0.len(), 4096);
            assert_eq!(hist.p_adc1.len(), 4096);
            let base = map.channel_base(ch);
            assert_eq!(Some(hist.n_adc0[0]), histogram_word(&map, 2, base));
            assert_eq!(
                Some(hist.p_adc1[4095]),
                histogram_word(&map, 2, base + CHANNEL_WORDS as u32 - 1)
            );
        }
    }

    #[test]
    fn test_read_syncs_selection_first() {
        let board = SimulatedBoard::new();
        let (mut fit, _) = model(&board);
        fit.reconnect().unwrap();
        board.with_state(|s| s.clear_log());

        fit.read_histograms();
        let log = board.with_state(|s| s.log().to_vec());
        let first = log
            .iter()
            .find(|e| matches!(e, LogEntry::Transaction { .. }))
            .copied();
        assert_eq!(
            first,
            Some(LogEntry::Transaction {
                type_id: TransactionType::ReadModifyWriteBits,
                address: RegisterMap::default().channel_select,
                words: 1,
            })
        );
        assert_eq!(fit.synced_channel(), Some(0));
    }

    #[test]
    fn test_truncated_read_keeps_buffer() {
        let board = SimulatedBoard::new();
        let (mut fit, events) = model(&board);
        fit.reconnect().unwrap();
        assert_eq!(fit.read_histograms(), HISTOGRAM_WORDS);
        let before = fit.histograms();

        fit.select_channel(5).unwrap();
        events.try_iter().count();
        let k = 3 * CHANNEL_WORDS + 1000;
        let limit = RegisterMap::default().hist_base + k as u32;
        board.with_state(|s| s.truncate_memory_at(limit));

        assert_eq!(fit.read_histograms(), k);
        assert_eq!(*fit.histograms(), *before);
        assert!(errors(&events).is_empty());
        assert_eq!(fit.state(), ConnectionState::Online);
    }

    #[test]
    fn test_read_retries_lost_block() {
        let board = SimulatedBoard::new();
        let (mut fit, _) = model(&board);
        fit.reconnect().unwrap();
        fit.sync().unwrap();

        board.with_state(|s| s.inject(Fault::Timeout));
        assert_eq!(fit.read_histograms(), HISTOGRAM_WORDS);
    }

    #[test]
    fn test_abandon_mid_read() {
        let board = SimulatedBoard::new();
        let (mut fit, events) = model(&board);
        fit.reconnect().unwrap();
        fit.sync().unwrap();
        events.try_iter().count();
        let before = fit.histograms();

        let map = RegisterMap::default();
        board.with_state(|s| s.raise_on(map.channel_base(5), fit.abandon_handle()));
        let count = fit.read_histograms();
        assert_eq!(count, 5 * CHANNEL_WORDS + MAX_WORDS_PER_TRANSACTION);
        assert_eq!(*fit.histograms(), *before);
        assert!(errors(&events).is_empty());

        let reads_after = board.with_state(|s| {
            s.log()
                .iter()
                .filter(|e| matches!(e, LogEntry::Transaction { address, .. }
                    if *address > map.channel_base(5)))
                .count()
        });
        assert_eq!(reads_after, 0);
    }

    #[test]
    fn test_abandon_on_last_block_completes() {
        let board = SimulatedBoard::new();
        let (mut fit, _) = model(&board);
        fit.reconnect().unwrap();
        fit.sync().unwrap();

        let map = RegisterMap::default();
        let last = CHANNEL_WORDS - CHANNEL_WORDS % MAX_WORDS_PER_TRANSACTION;
        let address = map.channel_base(CHANNELS - 1) + last as u32;
        board.with_state(|s| s.raise_on(address, fit.abandon_handle()));

        assert_eq!(fit.read_histograms(), HISTOGRAM_WORDS);
        let data = fit.histograms();
        assert_ne!(*data, HistogramData::default());
        assert_eq!(
            Some(data.channels[CHANNELS - 1].p_adc1[4095]),
            histogram_word(&map, 0, address + (CHANNEL_WORDS - last) as u32 - 1)
        );
    }

    #[test]
    fn test_abandon_while_idle_ignored() {
        let board = SimulatedBoard::new();
        let (mut fit, _) = model(&board);
        fit.reconnect().unwrap();
        assert_eq!(fit.read_histograms(), HISTOGRAM_WORDS);

        fit.abandon_handle().store(true, Ordering::SeqCst);
        assert_eq!(fit.read_histograms(), HISTOGRAM_WORDS);
    }

    #[test]
    fn test_link_mask_timeout_fails_poll() {
        let board = SimulatedBoard::new();
        let map = RegisterMap::default();
        board.with_state(|s| s.inject_at(map.link_mask, Fault::Timeout));
        let (mut fit, events) = model(&board);

        assert!(fit.reconnect().is_err());
        assert_eq!(fit.state(), ConnectionState::Unreachable);
        assert!(fit.status().stale);
        assert_eq!(fit.link_mask(), None);
        let received: Vec<Event> = events.try_iter().collect();
        assert_eq!(received[0], Event::Online);
        assert_eq!(received[1].error_kind(), Some(ErrorKind::Network));
        assert_eq!(received[2], Event::Unreachable);
        assert_eq!(received.len(), 3);

        fit.poll_status().unwrap();
        assert_eq!(fit.state(), ConnectionState::Online);
        let received: Vec<Event> = events.try_iter().collect();
        assert_eq!(received[0], Event::Online);
        assert_eq!(received[1], Event::LinkMaskReady(0b11));
        assert!(matches!(received[2], Event::StatusReady(_)));
    }

    #[test]
    fn test_link_mask_bus_error_keeps_online() {
        let board = SimulatedBoard::new();
        let map = RegisterMap::default();
        board.with_state(|s| s.inject_at(map.link_mask, Fault::CorruptHeader));
        let (mut fit, events) = model(&board);

        fit.reconnect().unwrap();
        assert_eq!(fit.state(), ConnectionState::Online);
        assert_eq!(fit.link_mask(), None);
        let received: Vec<Event> = events.try_iter().collect();
        assert_eq!(received[1].error_kind(), Some(ErrorKind::Bus));
        assert!(matches!(received[2], Event::StatusReady(_)));

        fit.poll_status().unwrap();
        assert_eq!(fit.link_mask(), Some(0b11));
    }

    #[test]
    fn test_small_blocks() {
        let board = SimulatedBoard::new();
        let (fit, _) = model(&board);
        let mut fit = fit.with_read_policy(ReadPolicy {
            block_words: 100,
            block_retries: 0,
        });
        fit.reconnect().unwrap();
        fit.sync().unwrap();
        board.with_state(|s| s.clear_log());

        assert_eq!(fit.read_histograms(), HISTOGRAM_WORDS);
        let reads = board.with_state(|s| s.transaction_count());
        assert_eq!(reads, CHANNELS * CHANNEL_WORDS.div_ceil(100));
    }
}
