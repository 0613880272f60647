//! Notifications raised by the bus client and the electronics model.
//!
//! Any number of listeners may [`subscribe`](Notifier::subscribe); each gets
//! its own channel and sees events in the order they were raised. Listeners
//! whose receiver was dropped are forgotten on the next delivery.

use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::{ErrorKind, FitError};
use crate::status::StatusSnapshot;

/// Something observers may want to react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Target did not answer.
    NetworkError(String),
    /// Malformed or mismatched reply.
    BusError(String),
    /// Semantically invalid reply or rejected request.
    LogicError(String),
    /// Status poll succeeded after the target was connecting or unreachable.
    Online,
    /// Target stopped answering.
    Unreachable,
    /// A status poll completed; carries the new snapshot.
    StatusReady(StatusSnapshot),
    /// Present links, bit `i` for link `i` (A0..A9, C0..C9).
    LinkMaskReady(u32),
}

impl Event {
    /// Builds the error notification matching the category of `err`.
    pub fn from_error(err: &FitError) -> Self {
        let message = err.to_string();
        match err.kind() {
            ErrorKind::Network => Event::NetworkError(message),
            ErrorKind::Bus => Event::BusError(message),
            ErrorKind::Logic => Event::LogicError(message),
        }
    }

    /// Category of an error notification, `None` for other events.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            Event::NetworkError(_) => Some(ErrorKind::Network),
            Event::BusError(_) => Some(ErrorKind::Bus),
            Event::LogicError(_) => Some(ErrorKind::Logic),
            _ => None,
        }
    }
}

/// Fan-out point for [`Event`]s.
#[derive(Debug, Clone, Default)]
pub struct Notifier {
    listeners: Arc<Mutex<Vec<Sender<Event>>>>,
}

impl Notifier {
    /// Creates a notifier without listeners.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new listener.
    pub fn subscribe(&self) -> Receiver<Event> {
        let (tx, rx) = channel();
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Delivers `event` to every live listener.
    pub fn emit(&self, event: Event) {
        let mut listeners = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        listeners.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Delivers the error notification for `err`.
    pub fn error(&self, err: &FitError) {
        self.emit(Event::from_error(err));
    }

    /// Number of live listeners as of the last delivery.
    pub fn listener_count(&self) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
