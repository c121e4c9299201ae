//! # Duration Parsing
//!
//! `spec.interval` uses Kubernetes/Go duration strings (`30s`, `5m`, `1h30m`,
//! `1m0s`, `1.5h`). Units are case-sensitive and `h` is the largest one; the
//! total must fit in an `i64` of nanoseconds (about 2562047h). Timeouts handed
//! to kubectl are rendered back in the same format (`5m0s`).

use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;
use thiserror::Error;

static DURATION_FORMAT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:\d+(?:\.\d+)?(?:ns|us|µs|μs|ms|s|m|h))+$")
        .expect("Failed to compile duration format regex - this should never happen")
});

static DURATION_COMPONENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?P<number>\d+(?:\.\d+)?)(?P<unit>ns|us|µs|μs|ms|s|m|h)")
        .expect("Failed to compile duration component regex - this should never happen")
});

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DurationError {
    #[error("duration string cannot be empty")]
    Empty,
    #[error("invalid duration format '{0}', expected e.g. '30s', '5m' or '1h30m'")]
    InvalidFormat(String),
    #[error("duration '{0}' is out of range")]
    OutOfRange(String),
    #[error("duration '{0}' must be greater than zero")]
    Zero(String),
}

/// Parse a positive Kubernetes duration string
pub fn parse_kubernetes_duration(input: &str) -> Result<Duration, DurationError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(DurationError::Empty);
    }
    if !DURATION_FORMAT.is_match(trimmed) {
        return Err(DurationError::InvalidFormat(trimmed.to_string()));
    }

    let mut total_nanos: f64 = 0.0;
    for captures in DURATION_COMPONENT.captures_iter(trimmed) {
        let (Some(number), Some(unit)) = (captures.name("number"), captures.name("unit")) else {
            return Err(DurationError::InvalidFormat(trimmed.to_string()));
        };
        let value: f64 = number
            .as_str()
            .parse()
            .map_err(|_| DurationError::InvalidFormat(trimmed.to_string()))?;
        total_nanos += value * unit_nanos(unit.as_str());
    }

    #[allow(clippy::cast_precision_loss, reason = "bound check only")]
    let max_nanos = i64::MAX as f64;
    if !total_nanos.is_finite() || total_nanos > max_nanos {
        return Err(DurationError::OutOfRange(trimmed.to_string()));
    }
    let duration = Duration::try_from_secs_f64(total_nanos / 1e9)
        .map_err(|_| DurationError::OutOfRange(trimmed.to_string()))?;
    if duration.is_zero() {
        return Err(DurationError::Zero(trimmed.to_string()));
    }
    Ok(duration)
}

fn unit_nanos(unit: &str) -> f64 {
    match unit {
        "ns" => 1.0,
        "us" | "µs" | "μs" => 1e3,
        "ms" => 1e6,
        "m" => 60e9,
        "h" => 3_600e9,
        _ => 1e9,
    }
}

/// Render a duration the way Go's `time.Duration.String()` does
#[must_use]
pub fn format_go_duration(duration: Duration) -> String {
    let total_nanos = duration.as_nanos();
    if total_nanos == 0 {
        return "0s".to_string();
    }
    if total_nanos < 1_000 {
        return format!("{total_nanos}ns");
    }
    if total_nanos < 1_000_000 {
        return format!("{}µs", decimal(total_nanos, 1_000));
    }
    if total_nanos < 1_000_000_000 {
        return format!("{}ms", decimal(total_nanos, 1_000_000));
    }

    let secs = duration.as_secs();
    let hours = secs / 3_600;
    let minutes = (secs % 3_600) / 60;
    let seconds = decimal(
        u128::from(secs % 60) * 1_000_000_000 + u128::from(duration.subsec_nanos()),
        1_000_000_000,
    );

    if hours > 0 {
        format!("{hours}h{minutes}m{seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m{seconds}s")
    } else {
        format!("{seconds}s")
    }
}

/// `value / unit` with the fractional part printed without trailing zeros
fn decimal(value: u128, unit: u128) -> String {
    let whole = value / unit;
    let fraction = value % unit;
    if fraction == 0 {
        return whole.to_string();
    }
    let width = unit.to_string().len() - 1;
    let digits = format!("{fraction:0width$}");
    format!("{whole}.{}", digits.trim_end_matches('0'))
}
