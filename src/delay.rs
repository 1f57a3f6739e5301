use std::time::Duration;

use chrono::{DateTime, Utc};

/// How long a pushed or released job should wait before being delivered.
///
/// Plain numbers are seconds: an integer is whole seconds, a float keeps
/// sub-second precision (`0.5` is 500 ms). Durations keep millisecond
/// precision, points in time are resolved to whole seconds from now.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Delay {
    Seconds(i64),
    FractionalSeconds(f64),
    Duration(Duration),
    Until(DateTime<Utc>),
}

impl Delay {
    /// The delay in milliseconds, as written into the `x-delay` property.
    ///
    /// Negative, non finite and past values all mean "no delay".
    pub fn as_millis(&self) -> u64 {
        match *self {
            Delay::Seconds(seconds) => seconds_to_millis(seconds),
            Delay::FractionalSeconds(seconds) => fractional_seconds_to_millis(seconds),
            Delay::Duration(duration) => u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            Delay::Until(at) => seconds_to_millis((at - Utc::now()).num_seconds()),
        }
    }

    pub fn is_zero(&self) -> bool {
        self.as_millis() == 0
    }
}

fn seconds_to_millis(seconds: i64) -> u64 {
    u64::try_from(seconds).unwrap_or(0).saturating_mul(1000)
}

fn fractional_seconds_to_millis(seconds: f64) -> u64 {
    if !seconds.is_finite() || seconds <= 0.0 {
        return 0;
    }
    // float to int casts saturate
    (seconds * 1000.0).round() as u64
}

/// Shorthand for [`Delay::as_millis`].
pub fn delay_to_millis(delay: impl Into<Delay>) -> u64 {
    delay.into().as_millis()
}

impl From<i64> for Delay {
    fn from(value: i64) -> Self {
        Delay::Seconds(value)
    }
}

impl From<i32> for Delay {
    fn from(value: i32) -> Self {
        Delay::Seconds(value.into())
    }
}

impl From<u32> for Delay {
    fn from(value: u32) -> Self {
        Delay::Seconds(value.into())
    }
}

impl From<f64> for Delay {
    fn from(value: f64) -> Self {
        Delay::FractionalSeconds(value)
    }
}

impl From<Duration> for Delay {
    fn from(value: Duration) -> Self {
        Delay::Duration(value)
    }
}

impl From<DateTime<Utc>> for Delay {
    fn from(value: DateTime<Utc>) -> Self {
        Delay::Until(value)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn converts_each_kind() {
        assert_eq!(delay_to_millis(5), 5000);
        assert_eq!(delay_to_millis(0.5), 500);
        assert_eq!(delay_to_millis(0.1), 100);
        assert_eq!(delay_to_millis(Duration::from_millis(2500)), 2500);
        assert_eq!(delay_to_millis(Duration::from_micros(1500)), 1);
        assert_eq!(delay_to_millis(-3), 0);
        assert_eq!(delay_to_millis(f64::NAN), 0);
        assert_eq!(delay_to_millis(-0.5), 0);
        assert!(Delay::from(0).is_zero());
    }

    #[test]
    fn points_in_time_resolve_to_seconds_from_now() {
        let past = Utc::now() - chrono::Duration::seconds(30);
        assert_eq!(delay_to_millis(past), 0);

        let future = Utc::now() + chrono::Duration::seconds(60) + chrono::Duration::milliseconds(500);
        let millis = delay_to_millis(future);
        assert!((59_000..=60_000).contains(&millis), "{millis}");
        assert_eq!(millis % 1000, 0);
    }

    proptest! {
        #[test]
        fn integer_seconds_are_multiplied(n in 0i64..=1_000_000_000) {
            prop_assert_eq!(delay_to_millis(n), (n * 1000) as u64);
        }

        #[test]
        fn fractional_seconds_are_rounded(f in 0.0f64..1_000_000.0) {
            prop_assert_eq!(delay_to_millis(f), (f * 1000.0).round() as u64);
        }
    }
}
