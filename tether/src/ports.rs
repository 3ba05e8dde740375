//! Port-range policy and ephemeral port allocation.
//!
//! Operators may constrain every port the engine hands out (response
//! listener aside) to a `lower..upper` range. A range of `0..0` disables
//! enforcement and lets the OS pick.

use std::{
    fmt,
    net::{Ipv4Addr, TcpListener},
    str::FromStr,
};

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_with::{DeserializeFromStr, SerializeDisplay};
use snafu::{ResultExt, Snafu, ensure};
use tether_base::consts::defaults;

/// An inclusive TCP port range of the form `lower..upper`.
///
/// Ports 0-1023 are reserved for well-known services, so enforced ranges
/// must lie within 1024..=65535.
#[derive(Clone, Copy, Debug, DeserializeFromStr, Eq, PartialEq, SerializeDisplay)]
pub struct PortRange {
    lower: u16,
    upper: u16,
}

impl PortRange {
    /// The unconstrained range, `0..0`.
    pub const UNCONSTRAINED: Self = Self { lower: 0, upper: 0 };

    #[must_use]
    pub const fn lower(&self) -> u16 { self.lower }

    #[must_use]
    pub const fn upper(&self) -> u16 { self.upper }

    /// `true` when the range disables enforcement entirely. Only `0..0`
    /// qualifies; equal non-zero bounds are a (degenerate) enforced range.
    #[must_use]
    pub const fn is_unconstrained(&self) -> bool { self.lower == 0 && self.upper == 0 }

    #[must_use]
    pub fn contains(&self, port: u16) -> bool {
        self.is_unconstrained() || (self.lower..=self.upper).contains(&port)
    }

    /// Validates the range against the configured minimum size.
    ///
    /// Performed at configuration-load time so a misconfigured range fails
    /// the kernel launch before any backend resource is created.
    pub fn validate(&self, min_range_size: u32) -> Result<(), Error> {
        if self.is_unconstrained() {
            return Ok(());
        }
        // Inclusive size: 40000..40000 is a range of exactly one port.
        let size = u32::from(self.upper - self.lower) + 1;
        ensure!(
            size >= min_range_size,
            PortRangeTooSmallSnafu { range: *self, min_range_size }
        );
        for port in [self.lower, self.upper] {
            ensure!(port >= 1024, PortOutOfBoundsSnafu { range: *self, port });
        }
        Ok(())
    }

    fn candidate(&self) -> u16 {
        if self.is_unconstrained() {
            0
        } else {
            rand::thread_rng().gen_range(self.lower..=self.upper)
        }
    }
}

impl Default for PortRange {
    fn default() -> Self { Self::UNCONSTRAINED }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.lower, self.upper)
    }
}

impl FromStr for PortRange {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let Some((lower, upper)) = input.split_once("..") else {
            return InvalidRangeFormatSnafu { input }.fail();
        };
        let lower = lower.trim().parse::<u16>().context(InvalidPortSnafu { value: lower })?;
        let upper = upper.trim().parse::<u16>().context(InvalidPortSnafu { value: upper })?;
        ensure!(upper >= lower, InvalidRangeOrderSnafu { input });
        Ok(Self { lower, upper })
    }
}

/// Returns `count` distinct free TCP ports adhering to `range`.
///
/// Each candidate is probed with a bind-and-release; sockets are held until
/// all ports are gathered so a port cannot be returned twice.
pub fn allocate(count: usize, range: PortRange) -> Result<Vec<u16>, Error> {
    allocate_with_retries(count, range, defaults::MAX_PORT_RANGE_RETRIES)
}

pub fn allocate_with_retries(
    count: usize,
    range: PortRange,
    max_retries: u32,
) -> Result<Vec<u16>, Error> {
    let mut sockets = Vec::with_capacity(count);
    let mut ports = Vec::with_capacity(count);
    for _ in 0..count {
        let socket = probe(range, max_retries)?;
        let port = socket
            .local_addr()
            .map_err(|_| Error::AllocationExhausted { range, retries: max_retries })?
            .port();
        ports.push(port);
        sockets.push(socket);
    }
    drop(sockets);
    Ok(ports)
}

fn probe(range: PortRange, max_retries: u32) -> Result<TcpListener, Error> {
    let mut retries = 0;
    loop {
        match TcpListener::bind((Ipv4Addr::UNSPECIFIED, range.candidate())) {
            Ok(socket) => return Ok(socket),
            Err(_) => {
                retries += 1;
                ensure!(
                    retries <= max_retries,
                    AllocationExhaustedSnafu { range, retries: max_retries }
                );
            }
        }
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("Invalid port range: expected 'LOWER..UPPER', got '{input}'"))]
    InvalidRangeFormat { input: String },

    #[snafu(display("Invalid port range '{input}': upper bound precedes lower bound"))]
    InvalidRangeOrder { input: String },

    #[snafu(display("Invalid port value '{value}', error: {source}"))]
    InvalidPort { value: String, source: std::num::ParseIntError },

    #[snafu(display(
        "Port range validation failed for range '{range}'. Range size must be at least \
         {min_range_size} as specified by env GP_MIN_PORT_RANGE_SIZE"
    ))]
    PortRangeTooSmall { range: PortRange, min_range_size: u32 },

    #[snafu(display(
        "Invalid port range '{range}' specified. Range for valid port numbers is (1024, 65535), \
         got {port}"
    ))]
    PortOutOfBounds { range: PortRange, port: u16 },

    #[snafu(display("Failed to locate port within range {range} after {retries} retries"))]
    AllocationExhausted { range: PortRange, retries: u32 },
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn parses_range() {
        let range: PortRange = "40000..41000".parse().unwrap();
        assert_eq!(range.lower(), 40000);
        assert_eq!(range.upper(), 41000);
        assert!(!range.is_unconstrained());
    }

    #[test]
    fn parses_unconstrained() {
        let range: PortRange = "0..0".parse().unwrap();
        assert!(range.is_unconstrained());
        assert_eq!(range, PortRange::UNCONSTRAINED);
    }

    #[test]
    fn rejects_malformed_range() {
        assert!(matches!(
            "40000".parse::<PortRange>().unwrap_err(),
            Error::InvalidRangeFormat { .. }
        ));
        assert!(matches!(
            "40000..39999".parse::<PortRange>().unwrap_err(),
            Error::InvalidRangeOrder { .. }
        ));
        assert!(matches!(
            "low..high".parse::<PortRange>().unwrap_err(),
            Error::InvalidPort { .. }
        ));
    }

    #[test]
    fn small_range_fails_validation() {
        let range: PortRange = "40000..40000".parse().unwrap();
        assert!(!range.is_unconstrained());
        let err = range.validate(1000).unwrap_err();
        assert!(matches!(err, Error::PortRangeTooSmall { .. }));

        let range: PortRange = "40000..40100".parse().unwrap();
        let err = range.validate(1000).unwrap_err();
        assert!(matches!(err, Error::PortRangeTooSmall { .. }));
    }

    #[test]
    fn privileged_bounds_fail_validation() {
        let range: PortRange = "80..2080".parse().unwrap();
        let err = range.validate(1000).unwrap_err();
        assert!(matches!(err, Error::PortOutOfBounds { .. }));
    }

    #[test]
    fn allocates_distinct_ephemeral_ports() {
        let ports = allocate(5, PortRange::UNCONSTRAINED).unwrap();
        let unique: HashSet<u16> = ports.iter().copied().collect();
        assert_eq!(unique.len(), 5);
    }

    #[test]
    fn allocated_ports_stay_in_range() {
        let range: PortRange = "30000..40000".parse().unwrap();
        let ports = allocate(6, range).unwrap();
        assert_eq!(ports.len(), 6);
        for port in &ports {
            assert!(range.contains(*port), "port {port} outside {range}");
        }
        let unique: HashSet<u16> = ports.iter().copied().collect();
        assert_eq!(unique.len(), 6);
    }
}
