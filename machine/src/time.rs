//! Virtual time.
//!
//! All scheduling inside a session is expressed in emulated (virtual) time,
//! never host wall-clock time. Values are nanoseconds since session start.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign, Sub};

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// A point in, or span of, virtual time with nanosecond resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct VirtualTime(u64);

impl VirtualTime {
    pub const ZERO: VirtualTime = VirtualTime(0);
    /// Sentinel for "never expires".
    pub const NEVER: VirtualTime = VirtualTime(u64::MAX);

    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    pub const fn from_micros(micros: u64) -> Self {
        Self(micros.saturating_mul(1_000))
    }

    pub const fn from_millis(millis: u64) -> Self {
        Self(millis.saturating_mul(1_000_000))
    }

    pub const fn from_secs(secs: u64) -> Self {
        Self(secs.saturating_mul(NANOS_PER_SEC))
    }

    /// Period of one cycle of a clock running at `hz`.
    ///
    /// A zero frequency yields [`VirtualTime::NEVER`].
    pub const fn from_hz(hz: u64) -> Self {
        if hz == 0 {
            Self::NEVER
        } else {
            Self(NANOS_PER_SEC / hz)
        }
    }

    #[inline]
    pub const fn as_nanos(self) -> u64 {
        self.0
    }

    pub fn as_secs_f64(self) -> f64 {
        self.0 as f64 / NANOS_PER_SEC as f64
    }

    #[inline]
    pub const fn is_never(self) -> bool {
        self.0 == u64::MAX
    }

    #[inline]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Elapsed time from `earlier` to `self`, clamped at zero.
    pub fn since(self, earlier: VirtualTime) -> VirtualTime {
        self - earlier
    }

    /// Number of whole `period`s that fit into `self`.
    pub fn cycles_of(self, period: VirtualTime) -> u64 {
        if period.is_zero() || period.is_never() {
            0
        } else {
            self.0 / period.0
        }
    }
}

impl Add for VirtualTime {
    type Output = VirtualTime;

    /// Saturates, so anything added to `NEVER` stays `NEVER`.
    fn add(self, rhs: VirtualTime) -> VirtualTime {
        VirtualTime(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for VirtualTime {
    fn add_assign(&mut self, rhs: VirtualTime) {
        *self = *self + rhs;
    }
}

impl Sub for VirtualTime {
    type Output = VirtualTime;

    fn sub(self, rhs: VirtualTime) -> VirtualTime {
        VirtualTime(self.0.saturating_sub(rhs.0))
    }
}

impl fmt::Display for VirtualTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_never() {
            write!(f, "never")
        } else {
            write!(f, "{}.{:09}s", self.0 / NANOS_PER_SEC, self.0 % NANOS_PER_SEC)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversions() {
        assert_eq!(VirtualTime::from_secs(2).as_nanos(), 2_000_000_000);
        assert_eq!(VirtualTime::from_millis(5), VirtualTime::from_micros(5_000));
        assert_eq!(VirtualTime::from_hz(1_000), VirtualTime::from_millis(1));
        assert!(VirtualTime::from_hz(0).is_never());
    }

    #[test]
    fn arithmetic_saturates() {
        assert_eq!(VirtualTime::NEVER + VirtualTime::from_secs(1), VirtualTime::NEVER);
        assert_eq!(VirtualTime::from_secs(1) - VirtualTime::from_secs(3), VirtualTime::ZERO);
        assert_eq!(
            VirtualTime::from_secs(3).since(VirtualTime::from_secs(1)),
            VirtualTime::from_secs(2)
        );
    }

    #[test]
    fn cycle_count() {
        let frame = VirtualTime::from_hz(60);
        assert_eq!(VirtualTime::from_secs(1).cycles_of(frame), 60);
        assert_eq!(VirtualTime::from_secs(1).cycles_of(VirtualTime::ZERO), 0);
    }

    #[test]
    fn display() {
        assert_eq!(VirtualTime::from_millis(1500).to_string(), "1.500000000s");
        assert_eq!(VirtualTime::NEVER.to_string(), "never");
    }
}
