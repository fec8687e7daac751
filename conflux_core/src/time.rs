use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Simulation time: signed fixed-point with a nanosecond base.
///
/// This is the `time` field of the wire control frame. Negative values are
/// reserved for sentinels; [`Time::MAXIMUM`] means "never / unbounded".
#[derive(Serialize, Deserialize)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Time(i64);

impl Time {
    pub const ZERO: Self = Self(0);
    /// The smallest representable time step.
    pub const EPSILON: Self = Self(1);
    /// Acts as "never"; all arithmetic saturates at this value.
    pub const MAXIMUM: Self = Self(i64::MAX);
    /// Sentinel for "before any valid time".
    pub const MIN_VALUE: Self = Self(i64::MIN);

    pub const fn from_ns(ns: i64) -> Self {
        Self(ns)
    }

    pub fn from_seconds(secs: f64) -> Self {
        if secs >= i64::MAX as f64 / 1e9 {
            Self::MAXIMUM
        } else {
            Self((secs * 1e9).round() as i64)
        }
    }

    pub const fn as_ns(self) -> i64 {
        self.0
    }

    pub fn as_seconds(self) -> f64 {
        self.0 as f64 / 1e9
    }

    /// Saturating addition; [`Time::MAXIMUM`] absorbs.
    pub const fn add(self, rhs: Self) -> Self {
        Self(self.0.saturating_add(rhs.0))
    }

    pub const fn saturating_sub(self, rhs: Self) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }

    pub fn min(self, rhs: Self) -> Self {
        if self.0 <= rhs.0 {
            self
        } else {
            rhs
        }
    }

    pub fn max(self, rhs: Self) -> Self {
        if self.0 >= rhs.0 {
            self
        } else {
            rhs
        }
    }
}

impl From<Duration> for Time {
    fn from(d: Duration) -> Self {
        Self(d.as_nanos().min(i64::MAX as u128) as i64)
    }
}

impl std::ops::Add for Time {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Time::add(self, rhs)
    }
}

impl std::ops::Sub for Time {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        self.saturating_sub(rhs)
    }
}

impl std::fmt::Display for Time {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if *self == Self::MAXIMUM {
            write!(f, "[max]")
        } else if *self == Self::MIN_VALUE {
            write!(f, "[min]")
        } else {
            write!(f, "{}s", self.as_seconds())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seconds_round_trip() {
        let t = Time::from_seconds(2.5);
        assert_eq!(t.as_ns(), 2_500_000_000);
        assert_eq!(t.as_seconds(), 2.5);
    }

    #[test]
    fn maximum_absorbs_addition() {
        assert_eq!(Time::MAXIMUM + Time::from_seconds(1.0), Time::MAXIMUM);
        assert_eq!(Time::MAXIMUM + Time::EPSILON, Time::MAXIMUM);
    }

    #[test]
    fn ordering_is_by_nanoseconds() {
        assert!(Time::from_seconds(1.25) < Time::from_seconds(2.5));
        assert!(Time::ZERO < Time::EPSILON);
        assert!(Time::MIN_VALUE < Time::ZERO);
    }
}
