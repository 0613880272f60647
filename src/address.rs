//! Target address validation.
//!
//! The board is addressed by a dotted-quad IPv4 string. Only addresses of
//! the strict form accepted by [`is_valid_address`] are used: no leading
//! zeros, first and last octets in 1-255, middle octets in 0-255.
//!
//! ```
//! use fit_ipbus::TargetAddress;
//!
//! let addr: TargetAddress = "172.20.75.180".parse().unwrap();
//! assert_eq!(addr.to_string(), "172.20.75.180");
//! assert!("256.1.1.1".parse::<TargetAddress>().is_err());
//! ```

use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{FitError, Result};

/// Address used when nothing valid was configured.
pub const DEFAULT_TARGET_ADDRESS: &str = "172.20.75.180";

static VALID_ADDRESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^([1-9][0-9]?|1[0-9][0-9]|2[0-4][0-9]|25[0-5])\.(([1-9]?[0-9]|1[0-9][0-9]|2[0-4][0-9]|25[0-5])\.){2}([1-9][0-9]?|1[0-9][0-9]|2[0-4][0-9]|25[0-5])$",
    )
    .expect("Invalid target address regex")
});

/// Returns whether `text` is an acceptable target address.
///
/// # Example
///
/// ```
/// use fit_ipbus::is_valid_address;
///
/// assert!(is_valid_address("192.168.0.1"));
/// assert!(!is_valid_address("1.2.3"));
/// assert!(!is_valid_address("01.2.3.4"));
/// ```
pub fn is_valid_address(text: &str) -> bool {
    VALID_ADDRESS.is_match(text)
}

/// A validated target IPv4 address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetAddress(Ipv4Addr);

impl TargetAddress {
    /// Parses and validates an address.
    ///
    /// # Errors
    ///
    /// Returns `FitError::InvalidAddress` if `text` fails the dotted-quad grammar.
    pub fn parse(text: &str) -> Result<Self> {
        if !is_valid_address(text) {
            return Err(FitError::invalid_address(text));
        }
        text.parse::<Ipv4Addr>()
            .map(TargetAddress)
            .map_err(|_| FitError::invalid_address(text))
    }

    /// Returns the IPv4 address.
    pub fn ip(self) -> Ipv4Addr {
        self.0
    }
}

impl Default for TargetAddress {
    fn default() -> Self {
        TargetAddress(Ipv4Addr::new(172, 20, 75, 180))
    }
}

impl FromStr for TargetAddress {
    type Err = FitError;

    fn from_str(s: &str) -> Result<Self> {
        TargetAddress::parse(s)
    }
}

impl std::fmt::Display for TargetAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<TargetAddress> for Ipv4Addr {
    fn from(addr: TargetAddress) -> Self {
        addr.0
    }
}
