//! Running statistics over round-trip samples.
//!
//! All deviations are computed on f64 nanoseconds and collapsed back into
//! `Duration` (i.e. the square root of ns² is stored as ns). Consumers that
//! want a variance without the square root can recover it from
//! `squared_deviation`.

use std::time::Duration;

/// Difference between the slowest and fastest sample. Zero for n <= 1.
pub fn time_range(values: &[Duration]) -> Duration {
    if values.len() <= 1 {
        return Duration::ZERO;
    }
    let min = values.iter().min().copied().unwrap_or(Duration::ZERO);
    let max = values.iter().max().copied().unwrap_or(Duration::ZERO);
    max - min
}

/// Arithmetic mean in nanoseconds. Zero for an empty sample.
pub fn time_average(values: &[Duration]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let sum: f64 = values.iter().map(|v| v.as_nanos() as f64).sum();
    sum / values.len() as f64
}

/// Raw sum of squared deviations from the mean (ns²), not divided by n.
pub fn time_squared_deviation(values: &[Duration]) -> f64 {
    let avg = time_average(values);
    values
        .iter()
        .map(|v| {
            let d = v.as_nanos() as f64 - avg;
            d * d
        })
        .sum()
}

/// Population standard deviation (divides by n).
pub fn time_uncorrected_deviation(values: &[Duration]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    (time_squared_deviation(values) / values.len() as f64).sqrt()
}

/// Sample standard deviation with Bessel's correction (divides by n-1).
/// Requires n >= 2; smaller samples report zero.
pub fn time_corrected_deviation(values: &[Duration]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    (time_squared_deviation(values) / (values.len() as f64 - 1.0)).sqrt()
}

/// Loss fraction in [0, 1]. Zero attempts count as zero loss.
pub fn loss_rate(attempted: u64, succeeded: u64) -> f64 {
    if attempted == 0 {
        return 0.0;
    }
    (attempted.saturating_sub(succeeded)) as f64 / attempted as f64
}

/// Collapse a ns-valued float back into a Duration.
pub fn nanos_to_duration(nanos: f64) -> Duration {
    if nanos.is_finite() && nanos > 0.0 {
        Duration::from_nanos(nanos as u64)
    } else {
        Duration::ZERO
    }
}
