//! Parsing for the human-readable units used in policy records.
//!
//! Policies store their thresholds as strings ("64MB", "5m", "0 3 * * *")
//! so the configuration survives round-trips unchanged; these helpers parse
//! them on use and reject malformed input as `InvalidArgument`.

use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

/// Parse a duration string like "5m", "168h", "30s".
pub fn parse_duration(s: &str) -> Result<Duration> {
    humantime::parse_duration(s.trim())
        .map_err(|e| Error::InvalidArgument(format!("malformed duration {s:?}: {e}")))
}

/// Parse a byte-size string like "512", "64KB", "1MiB".
///
/// Decimal suffixes (KB/MB/GB/TB) are powers of 1000, binary suffixes
/// (KiB/MiB/GiB/TiB) powers of 1024. A bare number is bytes.
pub fn parse_bytes(s: &str) -> Result<u64> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::InvalidArgument("empty byte-size string".to_string()));
    }

    let split = s
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(s.len());
    let (num, suffix) = s.split_at(split);
    let value = f64::from_str(num)
        .map_err(|_| Error::InvalidArgument(format!("malformed byte size {s:?}")))?;

    let multiplier: u64 = match suffix.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "KB" => 1000,
        "MB" => 1000 * 1000,
        "GB" => 1000 * 1000 * 1000,
        "TB" => 1000u64.pow(4),
        "KIB" => 1024,
        "MIB" => 1024 * 1024,
        "GIB" => 1024 * 1024 * 1024,
        "TIB" => 1024u64.pow(4),
        other => {
            return Err(Error::InvalidArgument(format!(
                "unknown byte-size suffix {other:?} in {s:?}"
            )))
        }
    };

    if value < 0.0 || !value.is_finite() {
        return Err(Error::InvalidArgument(format!("malformed byte size {s:?}")));
    }

    Ok((value * multiplier as f64) as u64)
}

/// Validate a 5-field (minute-resolution) or 6-field (second-resolution)
/// cron expression.
///
/// The `cron` crate always expects a seconds field, so a 5-field
/// expression is normalised by prepending "0".
pub fn validate_cron(expr: &str) -> Result<()> {
    let fields = expr.split_whitespace().count();
    let normalised = match fields {
        5 => format!("0 {}", expr.trim()),
        6 => expr.trim().to_string(),
        n => {
            return Err(Error::InvalidArgument(format!(
                "malformed cron {expr:?}: expected 5 or 6 fields, got {n}"
            )))
        }
    };

    cron::Schedule::from_str(&normalised)
        .map(|_| ())
        .map_err(|e| Error::InvalidArgument(format!("malformed cron {expr:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations() {
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(
            parse_duration("168h").unwrap(),
            Duration::from_secs(168 * 3600)
        );
        assert!(parse_duration("five minutes later").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn byte_sizes() {
        assert_eq!(parse_bytes("512").unwrap(), 512);
        assert_eq!(parse_bytes("64KB").unwrap(), 64_000);
        assert_eq!(parse_bytes("1MiB").unwrap(), 1_048_576);
        assert_eq!(parse_bytes("1.5GB").unwrap(), 1_500_000_000);
        assert!(parse_bytes("12 parsecs").is_err());
        assert!(parse_bytes("").is_err());
    }

    #[test]
    fn cron_five_and_six_fields() {
        validate_cron("0 3 * * *").unwrap();
        validate_cron("*/5 * * * *").unwrap();
        validate_cron("30 0 3 * * *").unwrap();
        assert!(validate_cron("* * *").is_err());
        assert!(validate_cron("99 * * * *").is_err());
    }
}
