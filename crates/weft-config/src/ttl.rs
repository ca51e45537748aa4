use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use weft_workflow::{format_duration, parse_duration};

use crate::error::ConfigError;

/// A retention period such as `"7d"`, `"12h"` or `"1h30m"`.
///
/// A single `d`/`h`/`m`/`s` suffix on an integer is read as days, hours,
/// minutes or seconds. Anything else goes through the general duration
/// grammar. The empty string is zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Ttl(pub Duration);

impl Ttl {
  pub fn duration(self) -> Duration {
    self.0
  }

  pub fn is_zero(self) -> bool {
    self.0.is_zero()
  }
}

impl From<Duration> for Ttl {
  fn from(d: Duration) -> Self {
    Ttl(d)
  }
}

fn unit_seconds(suffix: char) -> Option<u64> {
  match suffix {
    'd' => Some(24 * 60 * 60),
    'h' => Some(60 * 60),
    'm' => Some(60),
    's' => Some(1),
    _ => None,
  }
}

impl FromStr for Ttl {
  type Err = ConfigError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let value = s.trim();
    if value.is_empty() {
      return Ok(Ttl::default());
    }

    if let Some(suffix) = value.chars().last()
      && let Some(unit) = unit_seconds(suffix)
      && let Ok(count) = value[..value.len() - 1].parse::<u64>()
    {
      return count
        .checked_mul(unit)
        .map(|secs| Ttl(Duration::from_secs(secs)))
        .ok_or_else(|| ConfigError::InvalidTtl {
          value: value.to_string(),
          message: "duration overflows".to_string(),
        });
    }

    parse_duration(value).map(Ttl).map_err(|e| ConfigError::InvalidTtl {
      value: value.to_string(),
      message: e.to_string(),
    })
  }
}

impl fmt::Display for Ttl {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&format_duration(self.0))
  }
}

impl Serialize for Ttl {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(self)
  }
}

impl<'de> Deserialize<'de> for Ttl {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let raw = String::deserialize(deserializer)?;
    raw.parse().map_err(serde::de::Error::custom)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_suffixes() {
    assert_eq!("7d".parse::<Ttl>().unwrap().duration(), Duration::from_secs(7 * 86_400));
    assert_eq!("12h".parse::<Ttl>().unwrap().duration(), Duration::from_secs(12 * 3_600));
    assert_eq!("30m".parse::<Ttl>().unwrap().duration(), Duration::from_secs(1_800));
    assert_eq!("45s".parse::<Ttl>().unwrap().duration(), Duration::from_secs(45));
    assert!("".parse::<Ttl>().unwrap().is_zero());
  }

  #[test]
  fn test_general_grammar_fallback() {
    assert_eq!(
      "1h30m".parse::<Ttl>().unwrap().duration(),
      Duration::from_secs(5_400)
    );
    assert!("soon".parse::<Ttl>().is_err());
  }

  #[test]
  fn test_overflowing_count_is_rejected() {
    let err = "9999999999999999999d".parse::<Ttl>().unwrap_err();
    assert!(matches!(err, ConfigError::InvalidTtl { .. }), "{err}");
  }

  #[test]
  fn test_format_then_parse() {
    for secs in [0, 1, 59, 3_600, 5_400, 7 * 86_400] {
      let ttl = Ttl(Duration::from_secs(secs));
      assert_eq!(ttl.to_string().parse::<Ttl>().unwrap(), ttl);
    }
  }
}
