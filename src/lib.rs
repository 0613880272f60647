//! # FIT IPbus Library
//!
//! A Rust library for talking to FIT front-end electronics histogramming
//! boards over IPbus 2.0 (UDP).
//!
//! The crate is layered, leaves first:
//!
//! - **Transport** ([`Transport`], [`UdpTransport`]): one datagram out, one
//!   datagram back or a timeout. No retries.
//! - **Bus client** ([`Target`]): typed register transactions, packet-id
//!   bookkeeping, connection state, and one notification per failure.
//! - **Electronics model** ([`FitElectronics`]): the board's register
//!   semantics, cached status, commands and the bulk histogram read.
//! - **Histogram buffer** ([`HistogramData`]): the decoded memory dump,
//!   replaced only by complete reads.
//! - **Notifications** ([`Notifier`], [`Event`]): any number of listeners,
//!   FIFO per listener.
//! - **Controller** ([`Controller`]): a worker thread that owns the model
//!   and serializes commands, polls and bulk reads.
//!
//! ## Quick Start
//!
//! ```no_run
//! use fit_ipbus::{Controller, FitElectronics, Notifier, Settings, Target};
//!
//! fn main() -> fit_ipbus::Result<()> {
//!     let settings = Settings::load_or_default(fit_ipbus::DEFAULT_SETTINGS_FILE);
//!     let target = Target::udp(settings.target_config(), Notifier::new())?;
//!     let fit = FitElectronics::new(target, settings.registers.clone())
//!         .with_read_policy(settings.read_policy());
//!
//!     let controller = Controller::spawn(fit, settings.poll_policy())?;
//!     let events = controller.subscribe();
//!     controller.reconnect();
//!     controller.select_channel(0);
//!
//!     if let Some(readout) = controller.read_histograms() {
//!         if readout.is_complete() {
//!             fit_ipbus::export::save_table(&readout.data, "Histograms.csv")?;
//!         }
//!     }
//!     for event in events.try_iter() {
//!         println!("{:?}", event);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Error Handling
//!
//! Every failure is a [`FitError`] of one [`ErrorKind`]:
//!
//! | Kind | Examples | Effect |
//! |------|----------|--------|
//! | `Network` | timeout, unreachable host | state becomes `Unreachable` |
//! | `Bus` | bad header, id or word count mismatch, device info code | state unchanged |
//! | `Logic` | reply for another transaction type, out-of-range BCID, bad address | state unchanged |
//!
//! Each failure raises exactly one error [`Event`] and is also returned to
//! the caller. Short histogram reads are not errors: they are reported by
//! the word count [`FitElectronics::read_histograms`] returns.
//!
//! ## Testing Without Hardware
//!
//! [`sim::SimulatedBoard`] implements [`Transport`] and the device side of
//! the protocol, with fault injection and a transaction log.

#![warn(clippy::all)]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

mod address;
mod client;
mod command;
pub mod config;
mod controller;
mod electronics;
mod error;
pub mod export;
mod header;
mod histogram;
mod notify;
mod register;
mod response;
pub mod sim;
mod status;
mod transport;
pub mod utils;

// Public re-exports
pub use address::{is_valid_address, TargetAddress, DEFAULT_TARGET_ADDRESS};
pub use client::{ConnectionState, Target, TargetConfig};
pub use command::{
    ControlPacket, StatusRequest, Transaction, MAX_WORDS_PER_TRANSACTION, STATUS_PACKET_WORDS,
};
pub use config::{Settings, DEFAULT_SETTINGS_FILE};
pub use controller::{Controller, HistogramReadout, PollPolicy, Request};
pub use electronics::{FitElectronics, ReadPolicy};
pub use error::{ConfigError, ErrorKind, FitError, Result};
pub use header::{PacketHeader, PacketType, TransactionHeader, TransactionType};
pub use histogram::{
    ChannelHistogram, HistogramData, CHANNELS, CHANNEL_WORDS, HISTOGRAM_WORDS, MAIN_BINS,
    NEGATIVE_BINS,
};
pub use notify::{Event, Notifier};
pub use register::{BitField, RegisterMap};
pub use response::{ControlReply, StatusReply};
pub use status::{BoardStatus, HistStatus, StatusSnapshot, TriggerLinkStatus};
pub use transport::{Transport, UdpTransport, DEFAULT_IPBUS_PORT, DEFAULT_TIMEOUT, MAX_PACKET_SIZE};
