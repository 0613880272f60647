//! Datagram transport for IPbus communication.
//!
//! The transport layer only knows about sockets and bytes. It sends one
//! request and waits for one reply, giving up with [`FitError::Timeout`]
//! after the configured timeout. It never retries: retry policy belongs to
//! the callers of [`Target`](crate::Target).
//!
//! [`Transport`] is the seam between the protocol and the network, so the
//! same client can run against [`UdpTransport`] or an in-process
//! [`SimulatedBoard`](crate::sim::SimulatedBoard).
//!
//! # Constants
//!
//! - [`DEFAULT_IPBUS_PORT`] - Default IPbus UDP port (50001)
//! - [`DEFAULT_TIMEOUT`] - Default timeout (500 ms)
//! - [`MAX_PACKET_SIZE`] - Largest datagram accepted (1500 bytes)

use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use log::trace;

use crate::error::{FitError, Result};

/// Default IPbus UDP port.
pub const DEFAULT_IPBUS_PORT: u16 = 50001;

/// Default timeout for one request/reply exchange.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(500);

/// Maximum datagram size accepted from the target.
pub const MAX_PACKET_SIZE: usize = 1500;

/// One-in-flight request/reply exchange with a single target.
pub trait Transport {
    /// Sends a request and blocks until the reply arrives or the timeout expires.
    ///
    /// # Errors
    ///
    /// Returns `FitError::Timeout` if no reply arrives in time and
    /// `FitError::Io` for other socket failures.
    fn send_receive(&mut self, request: &[u8]) -> Result<Vec<u8>>;

    /// Points the transport at a new target address.
    ///
    /// # Errors
    ///
    /// Returns `FitError::Io` if the socket cannot be re-targeted.
    fn retarget(&mut self, addr: SocketAddr) -> Result<()>;

    /// Discards replies that arrived after their request timed out.
    fn drain_pending(&mut self) {}
}

/// UDP transport for IPbus communication.
///
/// Handles synchronous UDP communication with a configurable timeout.
pub struct UdpTransport {
    socket: UdpSocket,
    remote_addr: SocketAddr,
    timeout: Duration,
}

impl UdpTransport {
    /// Creates a new UDP transport connected to the given target.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the socket cannot be created or configured.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use fit_ipbus::UdpTransport;
    /// use std::time::Duration;
    ///
    /// let transport = UdpTransport::new(
    ///     "172.20.75.180:50001".parse().unwrap(),
    ///     Duration::from_millis(500),
    /// ).unwrap();
    /// ```
    pub fn new(target_addr: SocketAddr, timeout: Duration) -> Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect(target_addr)?;
        socket.set_read_timeout(Some(timeout))?;
        socket.set_write_timeout(Some(timeout))?;

        Ok(Self {
            socket,
            remote_addr: target_addr,
            timeout,
        })
    }

    /// Returns the remote target address.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Returns the configured timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Transport for UdpTransport {
    fn send_receive(&mut self, request: &[u8]) -> Result<Vec<u8>> {
        self.socket.send(request)?;

        let mut buffer = vec![0u8; MAX_PACKET_SIZE];
        match self.socket.recv(&mut buffer) {
            Ok(size) => {
                buffer.truncate(size);
                Ok(buffer)
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Err(FitError::Timeout),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Err(FitError::Timeout),
            // ICMP port unreachable surfaces as a refused connection on a connected socket
            Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => Err(FitError::Timeout),
            Err(e) => Err(FitError::Io(e)),
        }
    }

    fn retarget(&mut self, addr: SocketAddr) -> Result<()> {
        self.socket.connect(addr)?;
        self.remote_addr = addr;
        self.drain_pending();
        Ok(())
    }

    fn drain_pending(&mut self) {
        if self.socket.set_nonblocking(true).is_err() {
            return;
        }
        let mut buffer = [0u8; MAX_PACKET_SIZE];
        let mut drained = 0usize;
        while self.socket.recv(&mut buffer).is_ok() {
            drained += 1;
        }
        if drained > 0 {
            trace!("dropped {} stale datagrams from {}", drained, self.remote_addr);
        }
        let _ = self.socket.set_nonblocking(false);
    }
}

impl std::fmt::Debug for UdpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpTransport")
            .field("remote_addr", &self.remote_addr)
            .field("local_addr", &self.socket.local_addr().ok())
            .field("timeout", &self.timeout)
            .finish()
    }
}
