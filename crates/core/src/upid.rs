//! Unique process identity.
//!
//! A UPID names one process instance for its whole lifetime: the agent short id
//! (ASID) of the node it runs on, the OS pid, and the process start time. The
//! start time disambiguates reused pids on the same node.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// `(asid, pid, start_ts)` packed into 128 bits as
/// `asid << 96 | pid << 64 | start_ts`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Upid {
    asid: u32,
    pid: u32,
    start_ts: u64,
}

impl Upid {
    pub const fn new(asid: u32, pid: u32, start_ts: u64) -> Self {
        Self { asid, pid, start_ts }
    }

    pub const fn asid(&self) -> u32 { self.asid }
    pub const fn pid(&self) -> u32 { self.pid }
    pub const fn start_ts(&self) -> u64 { self.start_ts }

    pub const fn value(&self) -> u128 {
        ((self.asid as u128) << 96) | ((self.pid as u128) << 64) | self.start_ts as u128
    }

    /// Every 128-bit value decodes to some UPID.
    pub const fn from_value(v: u128) -> Self {
        Self {
            asid: (v >> 96) as u32,
            pid: (v >> 64) as u32,
            start_ts: v as u64,
        }
    }

    /// Upper half: `asid << 32 | pid`.
    pub const fn high(&self) -> u64 { (self.value() >> 64) as u64 }
    /// Lower half: the start timestamp.
    pub const fn low(&self) -> u64 { self.start_ts }

    pub const fn from_parts(high: u64, low: u64) -> Self {
        Self::from_value(((high as u128) << 64) | low as u128)
    }
}

impl From<u128> for Upid {
    fn from(v: u128) -> Self { Self::from_value(v) }
}

impl From<Upid> for u128 {
    fn from(u: Upid) -> Self { u.value() }
}

impl fmt::Display for Upid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.asid, self.pid, self.start_ts)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid upid {0:?}: expected asid:pid:start_ts or a 128-bit integer")]
pub struct ParseUpidError(pub String);

/// Accepts the display form `asid:pid:start_ts` or the packed decimal value.
impl FromStr for Upid {
    type Err = ParseUpidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let err = || ParseUpidError(s.to_string());
        let mut parts = s.split(':');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(v), None, None, None) => v.parse::<u128>().map(Upid::from_value).map_err(|_| err()),
            (Some(a), Some(p), Some(t), None) => Ok(Upid::new(
                a.parse().map_err(|_| err())?,
                p.parse().map_err(|_| err())?,
                t.parse().map_err(|_| err())?,
            )),
            _ => Err(err()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn halves_match_known_layout() {
        let u = Upid::new(123, 567, 89101);
        assert_eq!(u.high(), 528280977975);
        assert_eq!(u.low(), 89101);
        assert_eq!(Upid::from_parts(528280977975, 89101), u);
    }

    #[test]
    fn round_trip_extremes() {
        for &(asid, pid, ts) in &[
            (0u32, 0u32, 0u64),
            (u32::MAX, u32::MAX, u64::MAX),
            (u32::MAX, 0, 1),
            (1, u32::MAX, u64::MAX - 1),
            (0x8000_0000, 0x7fff_ffff, 0x8000_0000_0000_0000),
        ] {
            let u = Upid::new(asid, pid, ts);
            let back = Upid::from_value(u.value());
            assert_eq!((back.asid(), back.pid(), back.start_ts()), (asid, pid, ts));
        }
    }

    #[test]
    fn display_is_colon_separated() {
        assert_eq!(Upid::new(255, 123, 11111).to_string(), "255:123:11111");
    }

    #[test]
    fn parses_both_forms() {
        let u = Upid::new(255, 123, 11111);
        assert_eq!(u.to_string().parse::<Upid>(), Ok(u));
        assert_eq!(u.value().to_string().parse::<Upid>(), Ok(u));
        assert!("1:2".parse::<Upid>().is_err());
        assert!("1:2:x".parse::<Upid>().is_err());
        assert!("".parse::<Upid>().is_err());
    }
}
