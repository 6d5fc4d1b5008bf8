//! Human-readable duration display used by the text sink.
use std::time::Duration;

/// Time units, discriminants are nanoseconds per unit.
#[allow(clippy::enum_clike_unportable_variant)]
#[derive(Debug, Clone, Copy)]
pub enum TimeUnit {
    /// Nanoseconds (ns)
    Nano = 1,
    /// Microseconds (µs)
    Micro = 1_000,
    /// Milliseconds (ms)
    Milli = 1_000_000,
    /// Seconds (s)
    Sec = 1_000_000_000,
    /// Minutes (m)
    Min = 60 * 1_000_000_000,
}

impl std::fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let unit = match self {
            TimeUnit::Nano => "ns",
            TimeUnit::Micro => "µs",
            TimeUnit::Milli => "ms",
            TimeUnit::Sec => "s",
            TimeUnit::Min => "m",
        };
        write!(f, "{unit}")
    }
}

/// Duration display helpers.
pub trait DurationExt {
    /// The largest unit in which this duration is at least 1.0.
    fn appropriate_unit(&self) -> TimeUnit;

    /// This duration as a float in the given unit.
    fn as_f64(&self, unit: TimeUnit) -> f64;

    /// Renders with two decimals in the appropriate unit, e.g. `1.23ms`.
    fn display_adjusted(&self) -> String;
}

impl DurationExt for Duration {
    fn appropriate_unit(&self) -> TimeUnit {
        match self.as_nanos() {
            n if n < TimeUnit::Micro as u128 => TimeUnit::Nano,
            n if n < TimeUnit::Milli as u128 => TimeUnit::Micro,
            n if n < TimeUnit::Sec as u128 => TimeUnit::Milli,
            n if n < TimeUnit::Min as u128 => TimeUnit::Sec,
            _ => TimeUnit::Min,
        }
    }

    fn as_f64(&self, unit: TimeUnit) -> f64 {
        self.as_nanos() as f64 / unit as u64 as f64
    }

    fn display_adjusted(&self) -> String {
        let unit = self.appropriate_unit();
        format!("{:.2}{}", self.as_f64(unit), unit)
    }
}
