use std::fmt;
use std::ops::Add;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::WorkflowError;

/// Completed-over-total leaf pod count, rendered as `N/M`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Progress {
  pub done: u64,
  pub total: u64,
}

impl Progress {
  pub fn new(done: u64, total: u64) -> Self {
    Self { done, total }
  }

  /// Contribution of a single leaf pod.
  pub fn for_leaf(fulfilled: bool) -> Self {
    Self::new(u64::from(fulfilled), 1)
  }

  /// `N <= M` and `M > 0`.
  pub fn is_valid(&self) -> bool {
    self.total > 0 && self.done <= self.total
  }

  pub fn is_complete(&self) -> bool {
    self.is_valid() && self.done == self.total
  }
}

impl Add for Progress {
  type Output = Progress;

  fn add(self, rhs: Progress) -> Progress {
    Progress::new(self.done + rhs.done, self.total + rhs.total)
  }
}

impl fmt::Display for Progress {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}", self.done, self.total)
  }
}

impl FromStr for Progress {
  type Err = WorkflowError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let (done, total) = s
      .split_once('/')
      .ok_or_else(|| WorkflowError::InvalidProgress(s.to_string()))?;
    let done = done
      .trim()
      .parse()
      .map_err(|_| WorkflowError::InvalidProgress(s.to_string()))?;
    let total = total
      .trim()
      .parse()
      .map_err(|_| WorkflowError::InvalidProgress(s.to_string()))?;
    let progress = Progress::new(done, total);
    if !progress.is_valid() {
      return Err(WorkflowError::InvalidProgress(s.to_string()));
    }
    Ok(progress)
  }
}

impl Serialize for Progress {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(self)
  }
}

impl<'de> Deserialize<'de> for Progress {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let raw = String::deserialize(deserializer)?;
    raw.parse().map_err(serde::de::Error::custom)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_and_display() {
    let p: Progress = "3/4".parse().unwrap();
    assert_eq!(p, Progress::new(3, 4));
    assert_eq!(p.to_string(), "3/4");
  }

  #[test]
  fn test_rejects_invalid() {
    assert!("5/4".parse::<Progress>().is_err());
    assert!("0/0".parse::<Progress>().is_err());
    assert!("a/b".parse::<Progress>().is_err());
    assert!("7".parse::<Progress>().is_err());
  }

  #[test]
  fn test_sum_is_additive() {
    let sum = Progress::for_leaf(true) + Progress::for_leaf(false) + Progress::for_leaf(true);
    assert_eq!(sum, Progress::new(2, 3));
    assert!(sum.is_valid());
    assert!(!sum.is_complete());
  }
}
