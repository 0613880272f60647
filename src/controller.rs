//! Worker thread that owns the electronics model.
//!
//! All bus traffic for one board goes through a single [`Controller`]
//! thread: commands, periodic status polls and bulk histogram reads are
//! taken from one queue and run one at a time, so a poll never lands in the
//! middle of a command and nothing touches the board during a bulk read.
//! Observers learn about results through [`Event`]s.
//!
//! # Example
//!
//! ```
//! use fit_ipbus::sim::SimulatedBoard;
//! use fit_ipbus::{
//!     Controller, FitElectronics, Notifier, PollPolicy, RegisterMap, Target, TargetAddress,
//!     TargetConfig,
//! };
//!
//! let target = Target::new(
//!     SimulatedBoard::new(),
//!     TargetConfig::new(TargetAddress::default()),
//!     Notifier::new(),
//! );
//! let fit = FitElectronics::new(target, RegisterMap::default());
//! let controller = Controller::spawn(fit, PollPolicy::default())?;
//!
//! controller.reconnect();
//! let readout = controller.read_histograms().unwrap();
//! assert!(readout.is_complete());
//! controller.shutdown();
//! # Ok::<(), fit_ipbus::FitError>(())
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info};

use crate::address::TargetAddress;
use crate::client::ConnectionState;
use crate::electronics::FitElectronics;
use crate::error::Result;
use crate::histogram::{HistogramData, HISTOGRAM_WORDS};
use crate::notify::{Event, Notifier};
use crate::transport::Transport;

/// When to poll the board.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollPolicy {
    /// Interval between polls while the board answers.
    pub interval: Duration,
    /// Interval before the first retry once the board stopped answering.
    pub retry_interval: Duration,
    /// Factor applied to the retry interval after each failed retry; 1.0 keeps it fixed.
    pub retry_backoff: f64,
    /// Upper bound of the retry interval.
    pub max_retry_interval: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            retry_interval: Duration::from_secs(1),
            retry_backoff: 1.0,
            max_retry_interval: Duration::from_secs(10),
        }
    }
}

impl PollPolicy {
    /// Delay before retry number `failures` (0-based).
    ///
    /// ```
    /// use fit_ipbus::PollPolicy;
    /// use std::time::Duration;
    ///
    /// let policy = PollPolicy { retry_backoff: 2.0, ..PollPolicy::default() };
    /// assert_eq!(policy.retry_delay(0), Duration::from_secs(1));
    /// assert_eq!(policy.retry_delay(2), Duration::from_secs(4));
    /// assert_eq!(policy.retry_delay(10), Duration::from_secs(10));
    /// ```
    pub fn retry_delay(&self, failures: u32) -> Duration {
        let factor = self.retry_backoff.max(1.0).powi(failures.min(64) as i32);
        let nanos = self.retry_interval.as_nanos() as f64 * factor;
        let cap = self.max_retry_interval.max(self.retry_interval);
        if !nanos.is_finite() || nanos >= cap.as_nanos() as f64 {
            cap
        } else {
            Duration::from_nanos(nanos as u64)
        }
    }
}

/// Result of a bulk histogram read.
#[derive(Debug, Clone)]
pub struct HistogramReadout {
    /// Words received.
    pub words: usize,
    /// Histogram buffer after the read; the previous one if the read was short.
    pub data: Arc<HistogramData>,
}

impl HistogramReadout {
    /// Whether the read delivered every word.
    pub fn is_complete(&self) -> bool {
        self.words == HISTOGRAM_WORDS
    }
}

/// Work items for the controller thread.
#[derive(Debug)]
pub enum Request {
    /// Reconnect to the current address.
    Reconnect,
    /// Validate an address, switch to it and reconnect.
    ChangeTarget(String),
    /// Select a link (0..20) for readout.
    SelectChannel(u8),
    /// Switch histogramming.
    SetHistogramming(bool),
    /// Switch the filter.
    SetFilter(bool),
    /// Set the beam-crossing-ID selection.
    SetBcid(u32),
    /// Reset the board.
    Reset,
    /// Poll status now.
    Poll,
    /// Read all histograms and send the outcome back.
    ReadHistograms(Sender<HistogramReadout>),
    /// Stop the thread.
    Shutdown,
}

/// Handle to the controller thread.
pub struct Controller {
    requests: Sender<Request>,
    notifier: Notifier,
    abandon: Arc<AtomicBool>,
    address: Arc<Mutex<TargetAddress>>,
    worker: Option<JoinHandle<()>>,
}

impl Controller {
    /// Moves `model` onto a new thread and starts serving requests.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn spawn<T>(model: FitElectronics<T>, policy: PollPolicy) -> Result<Self>
    where
        T: Transport + Send + 'static,
    {
        let (requests, queue) = channel();
        let notifier = model.notifier().clone();
        let abandon = model.abandon_handle();
        let address = Arc::new(Mutex::new(model.target().address()));
        let shared = Arc::clone(&address);
        let worker = thread::Builder::new()
            .name("fit-controller".into())
            .spawn(move || run(model, queue, policy, &shared))?;
        Ok(Self {
            requests,
            notifier,
            abandon,
            address,
            worker: Some(worker),
        })
    }

    /// Registers a new event listener.
    pub fn subscribe(&self) -> Receiver<Event> {
        self.notifier.subscribe()
    }

    /// Queues a request. Returns `false` if the thread has stopped.
    pub fn send(&self, request: Request) -> bool {
        self.requests.send(request).is_ok()
    }

    /// Queues a reconnect.
    pub fn reconnect(&self) -> bool {
        self.send(Request::Reconnect)
    }

    /// Queues a target change.
    pub fn change_target(&self, address: &str) -> bool {
        self.send(Request::ChangeTarget(address.to_string()))
    }

    /// Queues a channel selection.
    pub fn select_channel(&self, index: u8) -> bool {
        self.send(Request::SelectChannel(index))
    }

    /// Queues a histogramming switch.
    pub fn set_histogramming(&self, enable: bool) -> bool {
        self.send(Request::SetHistogramming(enable))
    }

    /// Queues a filter switch.
    pub fn set_filter(&self, enable: bool) -> bool {
        self.send(Request::SetFilter(enable))
    }

    /// Queues a BCID change.
    pub fn set_bcid(&self, value: u32) -> bool {
        self.send(Request::SetBcid(value))
    }

    /// Queues a reset.
    pub fn reset(&self) -> bool {
        self.send(Request::Reset)
    }

    /// Queues an immediate status poll.
    pub fn poll(&self) -> bool {
        self.send(Request::Poll)
    }

    /// Reads all histograms, blocking until the read has run.
    ///
    /// Returns `None` if the thread has stopped.
    pub fn read_histograms(&self) -> Option<HistogramReadout> {
        let (reply, readout) = channel();
        if !self.send(Request::ReadHistograms(reply)) {
            return None;
        }
        readout.recv().ok()
    }

    /// Address of the board, as of the last request the thread finished.
    ///
    /// An address passed to [`change_target`](Self::change_target) shows up
    /// here once it has been accepted, whether or not the board answers.
    pub fn address(&self) -> TargetAddress {
        *self.address.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Abandons the bulk read in progress after its current block. Does
    /// nothing if no read is running.
    pub fn abandon_read(&self) {
        self.abandon.store(true, Ordering::SeqCst);
    }

    /// Stops the thread after the requests already queued.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let _ = self.requests.send(Request::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("running", &self.worker.is_some())
            .finish()
    }
}

fn run<T: Transport>(
    mut model: FitElectronics<T>,
    queue: Receiver<Request>,
    policy: PollPolicy,
    address: &Mutex<TargetAddress>,
) {
    debug!("controller started");
    let mut failures = 0u32;
    let mut next_poll = Instant::now() + policy.interval;

    loop {
        let wait = next_poll.saturating_duration_since(Instant::now());
        let polled = match queue.recv_timeout(wait) {
            Ok(Request::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Ok(request @ Request::ChangeTarget(_)) => {
                let polled = handle(&mut model, request);
                let mut current = address.lock().unwrap_or_else(PoisonError::into_inner);
                *current = model.target().address();
                polled
            }
            Ok(request) => handle(&mut model, request),
            Err(RecvTimeoutError::Timeout) => {
                if model.state() != ConnectionState::Disconnected {
                    let _ = model.poll_status();
                }
                true
            }
        };
        if !polled {
            continue;
        }

        let delay = if model.state() == ConnectionState::Unreachable {
            let delay = policy.retry_delay(failures);
            failures = failures.saturating_add(1);
            delay
        } else {
            failures = 0;
            policy.interval
        };
        next_poll = Instant::now() + delay;
    }
    info!("controller stopped");
}

/// Runs one request; returns whether it polled the board.
fn handle<T: Transport>(model: &mut FitElectronics<T>, request: Request) -> bool {
    let outcome = match request {
        Request::Reconnect => {
            let _ = model.reconnect();
            return true;
        }
        Request::ChangeTarget(address) => {
            let _ = model.change_target(&address);
            return true;
        }
        Request::Poll => {
            let _ = model.poll_status();
            return true;
        }
        Request::ReadHistograms(reply) => {
            let words = model.read_histograms();
            let _ = reply.send(HistogramReadout {
                words,
                data: model.histograms(),
            });
            return false;
        }
        Request::SelectChannel(index) => model.select_channel(index),
        Request::SetHistogramming(enable) => model.switch_hist(enable),
        Request::SetFilter(enable) => model.switch_filter(enable),
        Request::SetBcid(value) => model.set_bcid(value),
        Request::Reset => model.reset(),
        Request::Shutdown => return false,
    };
    if let Err(e) = outcome {
        debug!("request failed: {}", e);
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::TargetAddress;
    use crate::client::{Target, TargetConfig};
    use crate::error::ErrorKind;
    use crate::header::TransactionType;
    use crate::register::RegisterMap;
    use crate::sim::{LogEntry, SimulatedBoard};

    fn fast() -> PollPolicy {
        PollPolicy {
            interval: Duration::from_millis(2),
            retry_interval: Duration::from_millis(2),
            retry_backoff: 1.0,
            max_retry_interval: Duration::from_millis(20),
        }
    }

    fn model(board: &SimulatedBoard) -> FitElectronics<SimulatedBoard> {
        let target = Target::new(
            board.clone(),
            TargetConfig::new(TargetAddress::default()),
            Notifier::new(),
        );
        FitElectronics::new(target, RegisterMap::default())
    }

    fn controller(board: &SimulatedBoard, policy: PollPolicy) -> Controller {
        Controller::spawn(model(board), policy).unwrap()
    }

    fn wait_for(events: &Receiver<Event>, wanted: impl Fn(&Event) -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while let Some(left) = deadline.checked_duration_since(Instant::now()) {
            match events.recv_timeout(left) {
                Ok(event) if wanted(&event) => return true,
                Ok(_) => {}
                Err(_) => return false,
            }
        }
        false
    }

    fn is_status_read(entry: &LogEntry) -> bool {
        let (start, len) = RegisterMap::default().status_block();
        *entry
            == LogEntry::Transaction {
                type_id: TransactionType::Read,
                address: start,
                words: len as u8,
            }
    }

    fn is_histogram_read(entry: &LogEntry) -> bool {
        matches!(
            entry,
            LogEntry::Transaction { type_id: TransactionType::Read, address, .. }
                if *address >= RegisterMap::default().hist_base
        )
    }

    #[test]
    fn test_retry_delay_fixed() {
        let policy = PollPolicy::default();
        for failures in [0, 1, 5, 1000] {
            assert_eq!(policy.retry_delay(failures), Duration::from_secs(1));
        }
    }

    #[test]
    fn test_retry_delay_backoff_capped() {
        let policy = PollPolicy {
            retry_interval: Duration::from_millis(100),
            retry_backoff: 3.0,
            max_retry_interval: Duration::from_millis(500),
            ..PollPolicy::default()
        };
        assert_eq!(policy.retry_delay(0), Duration::from_millis(100));
        assert_eq!(policy.retry_delay(1), Duration::from_millis(300));
        assert_eq!(policy.retry_delay(2), Duration::from_millis(500));
        assert_eq!(policy.retry_delay(u32::MAX), Duration::from_millis(500));
    }

    #[test]
    fn test_readout_complete() {
        let readout = HistogramReadout {
            words: HISTOGRAM_WORDS - 1,
            data: Arc::new(HistogramData::default()),
        };
        assert!(!readout.is_complete());
    }

    #[test]
    fn test_no_poll_inside_bulk_read() {
        let board = SimulatedBoard::new();
        let controller = controller(&board, fast());
        let events = controller.subscribe();
        controller.reconnect();
        assert!(wait_for(&events, |e| *e == Event::Online));

        let readout = controller.read_histograms().unwrap();
        assert!(readout.is_complete());
        // Wait for a poll that started after the read
        events.try_iter().count();
        assert!(wait_for(&events, |e| matches!(e, Event::StatusReady(_))));
        controller.shutdown();

        let log = board.with_state(|s| s.log().to_vec());
        let first = log.iter().position(is_histogram_read).unwrap();
        let last = log.iter().rposition(is_histogram_read).unwrap();
        assert!(log[first..=last].iter().all(|e| !is_status_read(e)));
        assert!(log[last..].iter().any(is_status_read));
    }

    #[test]
    fn test_commands_applied_in_order() {
        let board = SimulatedBoard::new();
        let controller = controller(&board, fast());
        let events = controller.subscribe();
        controller.reconnect();
        for bcid in 0..50 {
            controller.set_bcid(bcid);
        }
        controller.set_histogramming(true);
        controller.poll();

        assert!(wait_for(&events, |e| matches!(
            e,
            Event::StatusReady(s) if s.hist.hist_on && s.hist.bcid == 49
        )));
    }

    #[test]
    fn test_polls_never_split_requests() {
        let board = SimulatedBoard::new();
        let controller = controller(&board, fast());
        for round in 0..10 {
            controller.reconnect();
            for bcid in 0..5 {
                controller.set_bcid(round * 5 + bcid);
            }
            thread::sleep(Duration::from_millis(3));
        }
        controller.shutdown();

        let map = RegisterMap::default();
        let link_mask_read = LogEntry::Transaction {
            type_id: TransactionType::Read,
            address: map.link_mask,
            words: 1,
        };
        let bcid_write = LogEntry::Transaction {
            type_id: TransactionType::ReadModifyWriteBits,
            address: map.hist_control,
            words: 1,
        };

        // Every entry belongs to exactly one request: a reconnect is a
        // resync, a status read and a link-mask read in a row
        let log = board.with_state(|s| s.log().to_vec());
        let (mut reconnects, mut writes, mut i) = (0, 0, 0);
        while i < log.len() {
            if log[i] == LogEntry::Status {
                assert!(log.get(i + 1).is_some_and(is_status_read), "split at {}", i);
                assert_eq!(log.get(i + 2), Some(&link_mask_read), "split at {}", i);
                reconnects += 1;
                i += 3;
            } else {
                assert!(is_status_read(&log[i]) || log[i] == bcid_write, "{:?}", log[i]);
                if log[i] == bcid_write {
                    writes += 1;
                }
                i += 1;
            }
        }
        assert_eq!(reconnects, 10);
        assert_eq!(writes, 50);
        assert_eq!(board.with_state(|s| map.bcid.get(s.register(map.hist_control))), 49);
    }

    #[test]
    fn test_unreachable_then_recovers() {
        let board = SimulatedBoard::new();
        board.with_state(|s| s.set_powered(false));
        let controller = controller(&board, fast());
        let events = controller.subscribe();
        controller.reconnect();

        assert!(wait_for(&events, |e| *e == Event::Unreachable));
        // Polling keeps trying while unreachable
        assert!(wait_for(&events, |e| e.error_kind() == Some(ErrorKind::Network)));

        board.with_state(|s| s.set_powered(true));
        assert!(wait_for(&events, |e| *e == Event::Online));
        assert!(wait_for(&events, |e| matches!(e, Event::LinkMaskReady(0b11))));
    }

    #[test]
    fn test_invalid_target_reported() {
        let board = SimulatedBoard::new();
        let controller = controller(&board, fast());
        let events = controller.subscribe();
        controller.change_target("1.2.3");
        assert!(wait_for(&events, |e| e.error_kind() == Some(ErrorKind::Logic)));
    }

    #[test]
    fn test_no_polling_before_connect() {
        let board = SimulatedBoard::new();
        let controller = controller(&board, fast());
        thread::sleep(Duration::from_millis(20));
        controller.shutdown();
        assert!(board.with_state(|s| s.log().is_empty()));
    }

    #[test]
    fn test_abandon_read_in_flight() {
        let board = SimulatedBoard::new();
        let model = model(&board);
        let map = RegisterMap::default();
        board.with_state(|s| s.raise_on(map.channel_base(1), model.abandon_handle()));
        let controller = Controller::spawn(model, PollPolicy::default()).unwrap();
        controller.reconnect();

        let readout = controller.read_histograms().unwrap();
        assert!(!readout.is_complete());
        assert_eq!(*readout.data, HistogramData::default());
    }

    #[test]
    fn test_abandon_while_idle_ignored() {
        let board = SimulatedBoard::new();
        let controller = controller(&board, PollPolicy::default());
        controller.reconnect();
        controller.abandon_read();

        let readout = controller.read_histograms().unwrap();
        assert!(readout.is_complete());
        assert_ne!(*readout.data, HistogramData::default());
    }

    #[test]
    fn test_address_follows_change_target() {
        let board = SimulatedBoard::new();
        let controller = controller(&board, PollPolicy::default());
        assert_eq!(controller.address(), TargetAddress::default());

        controller.change_target("1.2.3");
        controller.change_target("10.0.0.7");
        controller.change_target("256.0.0.1");
        // A blocking request returns only after the earlier ones ran
        controller.read_histograms().unwrap();
        assert_eq!(controller.address().to_string(), "10.0.0.7");
    }
}
