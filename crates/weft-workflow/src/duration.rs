//! Go-style duration strings (`"1h30m"`, `"1.5s"`, `"300ms"`).
//!
//! Backoff durations, suspend durations and configuration TTLs all use this
//! grammar, so parsing and the canonical rendering live in one place.

use std::time::Duration;

use crate::error::WorkflowError;

const NANOS_PER_SECOND: u128 = 1_000_000_000;
const NANOS_PER_MINUTE: u128 = 60 * NANOS_PER_SECOND;
const NANOS_PER_HOUR: u128 = 60 * NANOS_PER_MINUTE;

/// Parse a duration such as `"2h45m"`, `"10s"` or `"1.5h"`.
///
/// A bare `"0"` is accepted; every other number needs a unit.
pub fn parse_duration(value: &str) -> Result<Duration, WorkflowError> {
  let invalid = |message: &str| WorkflowError::InvalidDuration {
    value: value.to_string(),
    message: message.to_string(),
  };

  let mut rest = value.trim();
  if let Some(stripped) = rest.strip_prefix('+') {
    rest = stripped;
  }
  if rest.starts_with('-') {
    return Err(invalid("negative durations are not supported"));
  }
  if rest == "0" {
    return Ok(Duration::ZERO);
  }
  if rest.is_empty() {
    return Err(invalid("empty duration"));
  }

  let mut total: u128 = 0;
  while !rest.is_empty() {
    let int_len = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
    let int_part = &rest[..int_len];
    rest = &rest[int_len..];

    let mut frac_part = "";
    if let Some(stripped) = rest.strip_prefix('.') {
      let frac_len = stripped
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(stripped.len());
      frac_part = &stripped[..frac_len];
      rest = &stripped[frac_len..];
    }
    if int_part.is_empty() && frac_part.is_empty() {
      return Err(invalid("expected a number"));
    }

    let unit_len = rest
      .find(|c: char| c.is_ascii_digit() || c == '.')
      .unwrap_or(rest.len());
    let unit = &rest[..unit_len];
    rest = &rest[unit_len..];

    let scale: u128 = match unit {
      "ns" => 1,
      "us" | "µs" | "μs" => 1_000,
      "ms" => 1_000_000,
      "s" => NANOS_PER_SECOND,
      "m" => NANOS_PER_MINUTE,
      "h" => NANOS_PER_HOUR,
      "" => return Err(invalid("missing unit")),
      _ => return Err(invalid(&format!("unknown unit '{unit}'"))),
    };

    let whole: u128 = if int_part.is_empty() {
      0
    } else {
      int_part.parse().map_err(|_| invalid("number out of range"))?
    };
    total = whole
      .checked_mul(scale)
      .and_then(|v| total.checked_add(v))
      .ok_or_else(|| invalid("duration out of range"))?;

    if !frac_part.is_empty() {
      let digits = frac_part.len().min(18) as u32;
      let frac: u128 = frac_part[..digits as usize]
        .parse()
        .map_err(|_| invalid("fraction out of range"))?;
      total += frac * scale / 10u128.pow(digits);
    }
  }

  let secs = u64::try_from(total / NANOS_PER_SECOND).map_err(|_| invalid("duration out of range"))?;
  Ok(Duration::new(secs, (total % NANOS_PER_SECOND) as u32))
}

/// Render a duration in its canonical form: `"0s"`, `"1.5ms"`, `"2m0s"`,
/// `"720h0m0s"`.
pub fn format_duration(duration: Duration) -> String {
  let nanos = duration.as_nanos();
  if nanos == 0 {
    return "0s".to_string();
  }
  if nanos < NANOS_PER_SECOND {
    let (unit, divisor) = if nanos < 1_000 {
      ("ns", 1)
    } else if nanos < 1_000_000 {
      ("µs", 1_000)
    } else {
      ("ms", 1_000_000)
    };
    return format!("{}{unit}", decimal(nanos, divisor));
  }

  let hours = nanos / NANOS_PER_HOUR;
  let minutes = (nanos % NANOS_PER_HOUR) / NANOS_PER_MINUTE;
  let seconds = nanos % NANOS_PER_MINUTE;

  let mut out = String::new();
  if hours > 0 {
    out.push_str(&format!("{hours}h"));
  }
  if hours > 0 || minutes > 0 {
    out.push_str(&format!("{minutes}m"));
  }
  out.push_str(&decimal(seconds, NANOS_PER_SECOND));
  out.push('s');
  out
}

fn decimal(value: u128, divisor: u128) -> String {
  let whole = value / divisor;
  let frac = value % divisor;
  if frac == 0 {
    return whole.to_string();
  }
  let width = divisor.to_string().len() - 1;
  let digits = format!("{frac:0width$}");
  format!("{whole}.{}", digits.trim_end_matches('0'))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_simple_units() {
    assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
    assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
    assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
    assert_eq!(parse_duration("300ms").unwrap(), Duration::from_millis(300));
    assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
  }

  #[test]
  fn test_parse_compound_and_fraction() {
    assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
    assert_eq!(parse_duration("1.5h").unwrap(), Duration::from_secs(5400));
    assert_eq!(parse_duration("2.25s").unwrap(), Duration::from_millis(2250));
  }

  #[test]
  fn test_parse_rejects_garbage() {
    assert!(parse_duration("").is_err());
    assert!(parse_duration("10").is_err());
    assert!(parse_duration("10x").is_err());
    assert!(parse_duration("-5s").is_err());
  }

  #[test]
  fn test_format_canonical() {
    assert_eq!(format_duration(Duration::ZERO), "0s");
    assert_eq!(format_duration(Duration::from_secs(90)), "1m30s");
    assert_eq!(format_duration(Duration::from_secs(3600)), "1h0m0s");
    assert_eq!(format_duration(Duration::from_secs(30 * 86400)), "720h0m0s");
    assert_eq!(format_duration(Duration::from_millis(1500)), "1.5s");
    assert_eq!(format_duration(Duration::from_micros(1500)), "1.5ms");
  }

  #[test]
  fn test_format_then_parse_is_identity() {
    for d in [
      Duration::from_secs(1),
      Duration::from_millis(2750),
      Duration::from_secs(86400 * 7 + 13),
      Duration::from_nanos(42),
    ] {
      assert_eq!(parse_duration(&format_duration(d)).unwrap(), d);
    }
  }
}
