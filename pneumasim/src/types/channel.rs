//! Channel addressing.
//!
//! A simulator has up to [`CHANNEL_COUNT`] valves numbered from 1. Some
//! commands also accept the [`ALL_CHANNELS`] sentinel, which drives every
//! valve at once.

use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

/// Number of independently addressable valves.
pub const CHANNEL_COUNT: u8 = 12;

/// Wire value addressing every valve at once.
pub const ALL_CHANNELS: u8 = 255;

/// Rejected channel arguments.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("channel {0} is outside 1..={max}", max = CHANNEL_COUNT)]
    OutOfRange(u8),
    #[error("channel set is empty")]
    Empty,
    #[error("channel set has {0} entries, at most {max} allowed", max = CHANNEL_COUNT)]
    TooMany(usize),
}

/// Target of a single-target command: one valve or all of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelTarget {
    Single(u8),
    All,
}

impl ChannelTarget {
    /// Parse a raw channel number, accepting the all-channels sentinel.
    pub fn from_raw(raw: u8) -> Result<Self, ChannelError> {
        match raw {
            ALL_CHANNELS => Ok(Self::All),
            1..=CHANNEL_COUNT => Ok(Self::Single(raw)),
            other => Err(ChannelError::OutOfRange(other)),
        }
    }

    /// Value sent to the device.
    pub fn raw(self) -> u8 {
        match self {
            Self::Single(channel) => channel,
            Self::All => ALL_CHANNELS,
        }
    }

    pub fn is_all(self) -> bool {
        matches!(self, Self::All)
    }
}

impl fmt::Display for ChannelTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single(channel) => write!(f, "{}", channel),
            Self::All => write!(f, "all"),
        }
    }
}

/// Explicit, deduplicated set of valves for batched commands.
///
/// Never contains the all-channels sentinel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelSet(BTreeSet<u8>);

impl ChannelSet {
    /// Build a set from caller-supplied channel numbers.
    ///
    /// More than [`CHANNEL_COUNT`] entries is rejected even if some of them
    /// are duplicates; callers are expected to pass a set.
    pub fn new(channels: &[u8]) -> Result<Self, ChannelError> {
        if channels.is_empty() {
            return Err(ChannelError::Empty);
        }
        if channels.len() > usize::from(CHANNEL_COUNT) {
            return Err(ChannelError::TooMany(channels.len()));
        }
        let mut set = BTreeSet::new();
        for &channel in channels {
            if !(1..=CHANNEL_COUNT).contains(&channel) {
                return Err(ChannelError::OutOfRange(channel));
            }
            set.insert(channel);
        }
        Ok(Self(set))
    }

    /// Every valve on the device.
    pub fn all() -> Self {
        Self((1..=CHANNEL_COUNT).collect())
    }

    /// Number of distinct channels.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = u8> + '_ {
        self.0.iter().copied()
    }

    pub fn contains(&self, channel: u8) -> bool {
        self.0.contains(&channel)
    }
}

impl fmt::Display for ChannelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(u8::to_string).collect();
        write!(f, "[{}]", parts.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(1 => Ok(ChannelTarget::Single(1)); "lowest valve")]
    #[test_case(12 => Ok(ChannelTarget::Single(12)); "highest valve")]
    #[test_case(255 => Ok(ChannelTarget::All); "all sentinel")]
    #[test_case(0 => Err(ChannelError::OutOfRange(0)); "zero")]
    #[test_case(13 => Err(ChannelError::OutOfRange(13)); "past last valve")]
    fn test_target_from_raw(raw: u8) -> Result<ChannelTarget, ChannelError> {
        ChannelTarget::from_raw(raw)
    }

    #[test]
    fn test_set_deduplicates() {
        let set = ChannelSet::new(&[3, 1, 3, 2]).unwrap();
        assert_eq!(set.len(), 3);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(set.to_string(), "[1,2,3]");
    }

    #[test]
    fn test_set_rejects_bad_input() {
        assert_eq!(ChannelSet::new(&[]), Err(ChannelError::Empty));
        assert_eq!(ChannelSet::new(&[1; 13]), Err(ChannelError::TooMany(13)));
        assert_eq!(ChannelSet::new(&[1, 255]), Err(ChannelError::OutOfRange(255)));
    }

    #[test]
    fn test_all_covers_every_valve() {
        let all = ChannelSet::all();
        assert_eq!(all.len(), usize::from(CHANNEL_COUNT));
        assert!(all.contains(1) && all.contains(12));
    }
}
