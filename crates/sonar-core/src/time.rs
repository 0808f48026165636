//! Normalized time values.
//!
//! [`Timespec`] is a `(seconds, nanoseconds)` pair that is always kept in
//! normal form: the nanosecond part stays below one second and any excess is
//! carried into the seconds. [`Deadline`] is an absolute point on the
//! monotonic clock.

use core::fmt;

/// Nanoseconds in one second.
pub const NANOS_PER_SEC: u64 = 1_000_000_000;

/// A non-negative span of time in normal form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timespec {
    secs: u64,
    nanos: u32,
}

impl Timespec {
    /// The zero span.
    pub const ZERO: Timespec = Timespec { secs: 0, nanos: 0 };

    /// Builds a span from a possibly denormal pair, carrying whole seconds out
    /// of `nanos`.
    ///
    /// # Panics
    ///
    /// Panics if the carried seconds overflow `u64`. Use
    /// [`Timespec::checked_normalize`] where that can happen.
    pub const fn normalize(secs: u64, nanos: u64) -> Self {
        match Self::checked_normalize(secs, nanos) {
            Some(ts) => ts,
            None => panic!("timespec seconds overflow"),
        }
    }

    /// Same as [`Timespec::normalize`], returning `None` on overflow.
    pub const fn checked_normalize(secs: u64, nanos: u64) -> Option<Self> {
        let carry = nanos / NANOS_PER_SEC;
        let secs = match secs.checked_add(carry) {
            Some(s) => s,
            None => return None,
        };
        Some(Timespec { secs, nanos: (nanos % NANOS_PER_SEC) as u32 })
    }

    /// A span of `nanos` nanoseconds.
    pub const fn from_nanos(nanos: u64) -> Self {
        Self::normalize(0, nanos)
    }

    /// A span of `micros` microseconds.
    pub const fn from_micros(micros: u64) -> Self {
        Self::normalize(micros / 1_000_000, (micros % 1_000_000) * 1_000)
    }

    /// A span of `millis` milliseconds.
    pub const fn from_millis(millis: u64) -> Self {
        Self::normalize(millis / 1_000, (millis % 1_000) * 1_000_000)
    }

    /// Whole seconds.
    pub const fn secs(&self) -> u64 {
        self.secs
    }

    /// Sub-second nanoseconds, always below one second.
    pub const fn subsec_nanos(&self) -> u32 {
        self.nanos
    }

    /// Total length in nanoseconds.
    pub const fn as_nanos(&self) -> u128 {
        self.secs as u128 * NANOS_PER_SEC as u128 + self.nanos as u128
    }

    /// Sum of two spans, `None` on overflow.
    pub const fn checked_add(self, rhs: Timespec) -> Option<Timespec> {
        let secs = match self.secs.checked_add(rhs.secs) {
            Some(s) => s,
            None => return None,
        };
        Self::checked_normalize(secs, self.nanos as u64 + rhs.nanos as u64)
    }

    /// `self - rhs`, clamped at zero.
    pub const fn saturating_sub(self, rhs: Timespec) -> Timespec {
        if self.secs < rhs.secs || (self.secs == rhs.secs && self.nanos <= rhs.nanos) {
            return Timespec::ZERO;
        }
        if self.nanos >= rhs.nanos {
            Timespec { secs: self.secs - rhs.secs, nanos: self.nanos - rhs.nanos }
        } else {
            Timespec {
                secs: self.secs - rhs.secs - 1,
                nanos: (NANOS_PER_SEC as u32 + self.nanos) - rhs.nanos,
            }
        }
    }
}

impl fmt::Display for Timespec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}s", self.secs, self.nanos)
    }
}

impl From<core::time::Duration> for Timespec {
    fn from(d: core::time::Duration) -> Self {
        Timespec { secs: d.as_secs(), nanos: d.subsec_nanos() }
    }
}

impl From<Timespec> for core::time::Duration {
    fn from(ts: Timespec) -> Self {
        core::time::Duration::new(ts.secs, ts.nanos)
    }
}

/// An absolute point on the monotonic clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Deadline(Timespec);

impl Deadline {
    /// The instant `now + span`, `None` if the sum overflows.
    pub const fn after(now: Timespec, span: Timespec) -> Option<Self> {
        match now.checked_add(span) {
            Some(at) => Some(Deadline(at)),
            None => None,
        }
    }

    /// The deadline as a clock reading.
    pub const fn instant(&self) -> Timespec {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_carries_into_seconds() {
        let ts = Timespec::normalize(1, 2_500_000_000);
        assert_eq!(ts.secs(), 3);
        assert_eq!(ts.subsec_nanos(), 500_000_000);

        let exact = Timespec::normalize(0, NANOS_PER_SEC);
        assert_eq!(exact.secs(), 1);
        assert_eq!(exact.subsec_nanos(), 0);
    }

    #[test]
    fn test_normalize_preserves_total() {
        let pairs: [(u64, u64); 7] = [
            (0, 0),
            (0, 999_999_999),
            (0, 1_000_000_000),
            (5, 1_000_000_001),
            (7, 42),
            (123, 9_876_543_210),
            (0, u64::MAX),
        ];
        for (s, n) in pairs {
            let ts = Timespec::normalize(s, n);
            assert!(ts.subsec_nanos() < NANOS_PER_SEC as u32, "denormal result for ({s}, {n})");
            assert_eq!(ts.as_nanos(), s as u128 * NANOS_PER_SEC as u128 + n as u128);
        }
    }

    #[test]
    fn test_checked_normalize_overflow() {
        assert_eq!(Timespec::checked_normalize(u64::MAX, NANOS_PER_SEC), None);
        assert!(Timespec::checked_normalize(u64::MAX, NANOS_PER_SEC - 1).is_some());
    }

    #[test]
    fn test_unit_constructors() {
        assert_eq!(Timespec::from_micros(10).as_nanos(), 10_000);
        assert_eq!(Timespec::from_micros(2_500_000), Timespec::normalize(2, 500_000_000));
        assert_eq!(Timespec::from_millis(1_500), Timespec::normalize(1, 500_000_000));
        assert_eq!(Timespec::from_nanos(5_830_903).as_nanos(), 5_830_903);
    }

    #[test]
    fn test_add_and_sub() {
        let a = Timespec::normalize(1, 900_000_000);
        let b = Timespec::from_millis(200);
        let sum = a.checked_add(b).unwrap();
        assert_eq!(sum, Timespec::normalize(2, 100_000_000));
        assert_eq!(sum.saturating_sub(b), a);
        assert_eq!(b.saturating_sub(a), Timespec::ZERO);
        assert_eq!(Timespec::normalize(u64::MAX, 0).checked_add(Timespec::normalize(1, 0)), None);
    }

    #[test]
    fn test_deadline_after() {
        let now = Timespec::normalize(10, 999_999_000);
        let deadline = Deadline::after(now, Timespec::from_micros(10)).unwrap();
        assert_eq!(deadline.instant(), Timespec::normalize(11, 9_000));
        assert!(Deadline::after(Timespec::normalize(u64::MAX, 999_999_999), Timespec::from_nanos(1)).is_none());
    }

    #[test]
    fn test_duration_conversion() {
        let d = core::time::Duration::new(3, 7);
        let ts = Timespec::from(d);
        assert_eq!(core::time::Duration::from(ts), d);
    }
}
