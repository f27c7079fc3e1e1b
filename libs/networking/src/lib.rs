//! Networking utilities for node port inventory.
//!
//! A node exposes one or more disjoint inclusive port ranges. The port
//! allocator in the control plane walks them starting at a per-node rolling
//! cursor, so repeated allocations sweep forward instead of always retrying
//! the lowest (most recently freed) ports.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Networking errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// Range bounds are reversed or include port 0.
    #[error("invalid port range: {0}")]
    InvalidPortRange(String),

    /// Two configured ranges share at least one port.
    #[error("port ranges {first} and {second} overlap")]
    OverlappingRanges { first: PortRange, second: PortRange },
}

// ============================================================================
// Port ranges
// ============================================================================

/// Inclusive `[start, end]` range of host ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawPortRange")]
pub struct PortRange {
    start: u16,
    end: u16,
}

#[derive(Deserialize)]
struct RawPortRange {
    start: u16,
    end: u16,
}

impl TryFrom<RawPortRange> for PortRange {
    type Error = NetworkError;

    fn try_from(raw: RawPortRange) -> Result<Self, Self::Error> {
        PortRange::new(raw.start, raw.end)
    }
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Result<Self, NetworkError> {
        if start == 0 {
            return Err(NetworkError::InvalidPortRange(format!(
                "{start}-{end}: port 0 is not allocatable"
            )));
        }
        if start > end {
            return Err(NetworkError::InvalidPortRange(format!(
                "{start}-{end}: start is greater than end"
            )));
        }
        Ok(Self { start, end })
    }

    /// A range holding exactly one port.
    pub fn single(port: u16) -> Result<Self, NetworkError> {
        Self::new(port, port)
    }

    pub fn start(&self) -> u16 {
        self.start
    }

    pub fn end(&self) -> u16 {
        self.end
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }

    pub fn len(&self) -> usize {
        usize::from(self.end - self.start) + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    fn overlaps(&self, other: &PortRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

impl FromStr for PortRange {
    type Err = NetworkError;

    /// Accepts `"8000-8100"` or a single port `"8080"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |p: &str| {
            p.trim()
                .parse::<u16>()
                .map_err(|_| NetworkError::InvalidPortRange(format!("{s}: not a port number")))
        };
        match s.split_once('-') {
            Some((start, end)) => Self::new(parse(start)?, parse(end)?),
            None => Self::single(parse(s)?),
        }
    }
}

/// A node's full set of allowed ports: sorted, disjoint ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<PortRange>", into = "Vec<PortRange>")]
pub struct PortRanges {
    ranges: Vec<PortRange>,
}

impl TryFrom<Vec<PortRange>> for PortRanges {
    type Error = NetworkError;

    fn try_from(ranges: Vec<PortRange>) -> Result<Self, Self::Error> {
        Self::new(ranges)
    }
}

impl From<PortRanges> for Vec<PortRange> {
    fn from(ranges: PortRanges) -> Self {
        ranges.ranges
    }
}

impl PortRanges {
    /// Sorts the ranges and rejects any overlap.
    pub fn new(mut ranges: Vec<PortRange>) -> Result<Self, NetworkError> {
        ranges.sort();
        for pair in ranges.windows(2) {
            if pair[0].overlaps(&pair[1]) {
                return Err(NetworkError::OverlappingRanges {
                    first: pair[0],
                    second: pair[1],
                });
            }
        }
        Ok(Self { ranges })
    }

    /// Parses a comma separated list such as `"8000-8099,9000"`.
    pub fn parse_list(s: &str) -> Result<Self, NetworkError> {
        let ranges = s
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(str::parse)
            .collect::<Result<Vec<PortRange>, _>>()?;
        Self::new(ranges)
    }

    pub fn ranges(&self) -> &[PortRange] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Total number of ports across all ranges.
    pub fn len(&self) -> usize {
        self.ranges.iter().map(PortRange::len).sum()
    }

    pub fn contains(&self, port: u16) -> bool {
        self.ranges.iter().any(|r| r.contains(port))
    }

    pub fn min(&self) -> Option<u16> {
        self.ranges.first().map(PortRange::start)
    }

    pub fn max(&self) -> Option<u16> {
        self.ranges.last().map(PortRange::end)
    }

    /// Every allowed port once: `[cursor..=max]` followed by `[min..cursor)`.
    ///
    /// A missing cursor, or one outside `[min, max]`, starts at `min`.
    pub fn candidates(&self, cursor: Option<u16>) -> impl Iterator<Item = u16> + '_ {
        let start = match (cursor, self.min(), self.max()) {
            (Some(c), Some(min), Some(max)) if (min..=max).contains(&c) => c,
            (_, Some(min), _) => min,
            _ => 0,
        };
        let ranges = &self.ranges;
        let ports = move || ranges.iter().flat_map(|r| r.start..=r.end);
        ports()
            .filter(move |p| *p >= start)
            .chain(ports().filter(move |p| *p < start))
    }

    /// Cursor to persist after `port` was taken: `port + 1`, wrapping to `min`.
    pub fn next_cursor(&self, port: u16) -> u16 {
        match (self.min(), self.max()) {
            (Some(min), Some(max)) if port < max => (port + 1).max(min),
            (Some(min), _) => min,
            _ => port.wrapping_add(1),
        }
    }
}
