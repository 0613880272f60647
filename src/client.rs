//! IPbus target client.
//!
//! [`Target`] issues typed register transactions over a [`Transport`],
//! keeps the packet-id counter in step with the device, and turns every
//! failure into exactly one notification of the right category.
//!
//! # Overview
//!
//! - [`Target::connect`] re-targets the transport, moves to
//!   [`ConnectionState::Connecting`] and sends a status packet to learn the
//!   packet id the device expects.
//! - [`Target::transact`] performs one transaction. A timeout raises a
//!   network notification and moves the target to
//!   [`ConnectionState::Unreachable`]; bus and logic failures raise their own
//!   notification and leave the state alone. Nothing is retried here.
//! - [`Target::read_block`] is the quiet variant used by bulk transfers.
//!
//! # Example
//!
//! ```no_run
//! use fit_ipbus::{Notifier, Target, TargetAddress, TargetConfig};
//!
//! let config = TargetConfig::new("172.20.75.180".parse::<TargetAddress>()?);
//! let mut target = Target::udp(config, Notifier::new())?;
//! target.connect(target.address())?;
//!
//! let status = target.read_register(0x00)?;
//! target.write_register(0x04, 3)?;
//! # Ok::<(), fit_ipbus::FitError>(())
//! ```

use std::net::SocketAddr;
use std::time::Duration;

use log::{debug, info, trace, warn};

use crate::address::TargetAddress;
use crate::command::{ControlPacket, StatusRequest, Transaction};
use crate::error::{ErrorKind, FitError, Result};
use crate::notify::{Event, Notifier};
use crate::response::{ControlReply, StatusReply};
use crate::transport::{Transport, UdpTransport, DEFAULT_IPBUS_PORT, DEFAULT_TIMEOUT};

/// Connection state of a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Never connected.
    Disconnected,
    /// Connection requested, no successful status poll yet.
    Connecting,
    /// The last status poll succeeded.
    Online,
    /// The last attempt timed out.
    Unreachable,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Online => write!(f, "online"),
            ConnectionState::Unreachable => write!(f, "no response"),
        }
    }
}

/// Configuration for a target connection.
#[derive(Debug, Clone)]
pub struct TargetConfig {
    /// Board address.
    pub address: TargetAddress,
    /// UDP port.
    pub port: u16,
    /// Timeout of one request/reply exchange.
    pub timeout: Duration,
}

impl TargetConfig {
    /// Creates a configuration with the default port and timeout.
    ///
    /// # Example
    ///
    /// ```
    /// use fit_ipbus::{TargetAddress, TargetConfig};
    /// use std::time::Duration;
    ///
    /// let config = TargetConfig::new(TargetAddress::default())
    ///     .with_port(50002)
    ///     .with_timeout(Duration::from_millis(200));
    /// assert_eq!(config.socket_addr().port(), 50002);
    /// ```
    pub fn new(address: TargetAddress) -> Self {
        Self {
            address,
            port: DEFAULT_IPBUS_PORT,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Sets a custom UDP port (default is 50001).
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets a custom timeout (default is 500 ms).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Socket address of the target.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::from((self.address.ip(), self.port))
    }
}

/// Register-level client of one IPbus target.
pub struct Target<T: Transport> {
    transport: T,
    config: TargetConfig,
    notifier: Notifier,
    state: ConnectionState,
    last_ok: bool,
    next_packet_id: u16,
    next_transaction_id: u16,
    needs_resync: bool,
}

impl Target<UdpTransport> {
    /// Creates a UDP client for the configured target.
    ///
    /// # Errors
    ///
    /// Returns an error if the UDP socket cannot be created.
    pub fn udp(config: TargetConfig, notifier: Notifier) -> Result<Self> {
        let transport = UdpTransport::new(config.socket_addr(), config.timeout)?;
        Ok(Self::new(transport, config, notifier))
    }
}

impl<T: Transport> Target<T> {
    /// Creates a client over an existing transport.
    pub fn new(transport: T, config: TargetConfig, notifier: Notifier) -> Self {
        Self {
            transport,
            config,
            notifier,
            state: ConnectionState::Disconnected,
            last_ok: false,
            next_packet_id: 1,
            next_transaction_id: 0,
            needs_resync: true,
        }
    }

    /// Points the client at `address` and performs the status handshake.
    ///
    /// # Errors
    ///
    /// Returns the failure after reporting it; a network failure leaves the
    /// target [`ConnectionState::Unreachable`].
    pub fn connect(&mut self, address: TargetAddress) -> Result<()> {
        self.config.address = address;
        self.state = ConnectionState::Connecting;
        self.needs_resync = true;
        info!("{}: connecting", self.config.socket_addr());

        let result = self
            .transport
            .retarget(self.config.socket_addr())
            .and_then(|()| self.resync());
        match result {
            Ok(()) => {
                self.last_ok = true;
                Ok(())
            }
            Err(e) => {
                self.report(&e);
                Err(e)
            }
        }
    }

    /// Performs one transaction, reporting any failure.
    ///
    /// # Errors
    ///
    /// Returns the failure after raising its notification.
    pub fn transact(&mut self, transaction: Transaction) -> Result<Vec<u32>> {
        match self.exchange(transaction) {
            Ok((request, reply)) => {
                self.last_ok = true;
                let data = reply.check(&request).map(<[u32]>::to_vec);
                if let Err(e) = &data {
                    self.report(e);
                }
                data
            }
            Err(e) => {
                self.report(&e);
                Err(e)
            }
        }
    }

    /// Reads up to `count` words from consecutive registers without raising
    /// notifications or changing the connection state.
    ///
    /// If the device reports a bus error part way, the words it did deliver
    /// are returned and the result is shorter than `count`.
    ///
    /// # Errors
    ///
    /// Returns the failure if nothing usable came back.
    pub fn read_block(&mut self, address: u32, count: usize) -> Result<Vec<u32>> {
        let transaction = Transaction::read(address, count)?;
        let (request, reply) = match self.exchange(transaction) {
            Ok(exchanged) => exchanged,
            Err(e) => {
                self.last_ok = false;
                return Err(e);
            }
        };
        self.last_ok = true;
        if !reply.transaction.is_success() {
            reply.check_header(&request)?;
            debug!(
                "block at 0x{:08X}: device stopped after {} of {} words (info 0x{:X})",
                address,
                reply.data.len(),
                count,
                reply.transaction.info_code
            );
            return Ok(reply.data);
        }
        reply.check(&request).map(<[u32]>::to_vec)
    }

    /// Reads `count` consecutive registers.
    ///
    /// # Errors
    ///
    /// See [`transact`](Self::transact).
    pub fn read(&mut self, address: u32, count: usize) -> Result<Vec<u32>> {
        let transaction = self.checked(Transaction::read(address, count))?;
        self.transact(transaction)
    }

    /// Reads one register.
    ///
    /// # Errors
    ///
    /// See [`transact`](Self::transact).
    pub fn read_register(&mut self, address: u32) -> Result<u32> {
        let words = self.read(address, 1)?;
        Ok(words[0])
    }

    /// Writes one register.
    ///
    /// # Errors
    ///
    /// See [`transact`](Self::transact).
    pub fn write_register(&mut self, address: u32, value: u32) -> Result<()> {
        let transaction = self.checked(Transaction::write(address, &[value]))?;
        self.transact(transaction).map(|_| ())
    }

    /// Replaces the bits of `mask` with `value` and returns the register
    /// value from before the change.
    ///
    /// # Errors
    ///
    /// See [`transact`](Self::transact).
    pub fn set_field(&mut self, address: u32, mask: u32, value: u32) -> Result<u32> {
        let words = self.transact(Transaction::set_field(address, mask, value))?;
        Ok(words[0])
    }

    /// Sets or clears the bits of `mask` and returns the register value from
    /// before the change.
    ///
    /// # Errors
    ///
    /// See [`transact`](Self::transact).
    pub fn set_bits(&mut self, address: u32, mask: u32, state: bool) -> Result<u32> {
        let words = self.transact(Transaction::set_bits(address, mask, state))?;
        Ok(words[0])
    }

    /// Marks the target online and returns the previous state.
    pub fn mark_online(&mut self) -> ConnectionState {
        let previous = self.state;
        self.state = ConnectionState::Online;
        if previous != ConnectionState::Online {
            info!("{}: online", self.config.address);
        }
        previous
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether the most recent exchange succeeded.
    pub fn is_online(&self) -> bool {
        self.last_ok
    }

    /// Current target address.
    pub fn address(&self) -> TargetAddress {
        self.config.address
    }

    /// Connection configuration.
    pub fn config(&self) -> &TargetConfig {
        &self.config
    }

    /// Notification fan-out shared with the electronics model.
    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// Underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Underlying transport, mutably.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Raises the notification for `err` and applies its state effect.
    pub(crate) fn report(&mut self, err: &FitError) {
        self.last_ok = false;
        warn!("{}: {}", self.config.address, err);
        self.notifier.error(err);
        if err.kind() == ErrorKind::Network && self.state != ConnectionState::Unreachable {
            self.state = ConnectionState::Unreachable;
            info!("{}: no response", self.config.address);
            self.notifier.emit(Event::Unreachable);
        }
    }

    /// Raises the notification for a request refused before reaching the bus.
    pub(crate) fn reject(&self, err: &FitError) {
        warn!("{}: {}", self.config.address, err);
        self.notifier.error(err);
    }

    fn checked(&self, transaction: Result<Transaction>) -> Result<Transaction> {
        transaction.map_err(|e| {
            self.reject(&e);
            e
        })
    }

    /// Sends one transaction and parses the reply without judging its content.
    fn exchange(&mut self, transaction: Transaction) -> Result<(ControlPacket, ControlReply)> {
        if self.needs_resync {
            self.resync()?;
        }

        let packet = ControlPacket::new(self.next_packet_id, self.next_transaction_id, transaction);
        trace!(
            "packet {}: {} at 0x{:08X}, {} words",
            packet.header.packet_id,
            packet.transaction.type_id(),
            packet.transaction.address(),
            packet.transaction.words()
        );

        let bytes = match self.transport.send_receive(&packet.to_bytes()) {
            Ok(bytes) => bytes,
            Err(e) => {
                // The device may or may not have seen the packet
                self.needs_resync = true;
                return Err(e);
            }
        };
        self.advance_ids();

        match ControlReply::from_bytes(&bytes) {
            Ok(reply) => {
                if reply.header.packet_id != packet.header.packet_id {
                    self.needs_resync = true;
                    self.transport.drain_pending();
                }
                Ok((packet, reply))
            }
            Err(e) => {
                self.needs_resync = true;
                Err(e)
            }
        }
    }

    /// Learns the next expected packet id from a status packet.
    fn resync(&mut self) -> Result<()> {
        self.transport.drain_pending();
        let bytes = self.transport.send_receive(&StatusRequest.to_bytes())?;
        let status = StatusReply::from_bytes(&bytes)?;
        debug!(
            "{}: status mtu={} buffers={} next packet id={}",
            self.config.address, status.mtu, status.buffers, status.next_packet_id
        );
        self.next_packet_id = status.next_packet_id;
        self.needs_resync = false;
        Ok(())
    }

    fn advance_ids(&mut self) {
        // Packet id 0 disables reliability tracking on the device
        if self.next_packet_id != 0 {
            self.next_packet_id = match self.next_packet_id.wrapping_add(1) {
                0 => 1,
                id => id,
            };
        }
        self.next_transaction_id = (self.next_transaction_id + 1) & 0xFFF;
    }
}

impl<T: Transport> std::fmt::Debug for Target<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Target")
            .field("address", &self.config.socket_addr())
            .field("state", &self.state)
            .field("next_packet_id", &self.next_packet_id)
            .finish()
    }
}
