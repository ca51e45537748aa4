use std::collections::BTreeMap;
use std::fmt::Write as _;

use parking_lot::Mutex;

use crate::error::MetricsError;

/// Label set of one series. Ordered so rendering is stable.
pub type Labels = BTreeMap<String, String>;

pub fn labels<const N: usize>(pairs: [(&str, &str); N]) -> Labels {
  pairs.into_iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

/// Parse a metric value the way Prometheus writes them.
pub fn parse_value(raw: &str) -> Result<f64, MetricsError> {
  let raw = raw.trim();
  match raw {
    "+Inf" | "Inf" => Ok(f64::INFINITY),
    "-Inf" => Ok(f64::NEG_INFINITY),
    _ => raw
      .parse::<f64>()
      .ok()
      .filter(|v| !v.is_nan())
      .ok_or_else(|| MetricsError::NotANumber(raw.to_string())),
  }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MetricKind {
  Counter,
  Gauge,
  Histogram { buckets: Vec<f64> },
}

impl MetricKind {
  fn as_str(&self) -> &'static str {
    match self {
      MetricKind::Counter => "counter",
      MetricKind::Gauge => "gauge",
      MetricKind::Histogram { .. } => "histogram",
    }
  }

  fn same_kind(&self, other: &MetricKind) -> bool {
    std::mem::discriminant(self) == std::mem::discriminant(other)
  }
}

#[derive(Debug, Clone)]
enum Series {
  Value(f64),
  Histogram { counts: Vec<u64>, sum: f64, count: u64 },
}

#[derive(Debug)]
struct Family {
  help: String,
  kind: MetricKind,
  series: BTreeMap<Labels, Series>,
}

impl Family {
  fn series(&mut self, labels: &Labels) -> &mut Series {
    let kind = &self.kind;
    self.series.entry(labels.clone()).or_insert_with(|| match kind {
      MetricKind::Histogram { buckets } => Series::Histogram {
        counts: vec![0; buckets.len()],
        sum: 0.0,
        count: 0,
      },
      _ => Series::Value(0.0),
    })
  }
}

/// Metric families keyed by name. A name keeps the kind it was first
/// registered with; the help text of the first registration wins.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
  families: Mutex<BTreeMap<String, Family>>,
}

fn valid_name(name: &str) -> bool {
  let mut chars = name.chars();
  matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_' || c == ':')
    && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

fn valid_label(name: &str) -> bool {
  let mut chars = name.chars();
  matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
    && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    && !name.starts_with("__")
}

impl MetricsRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  fn with_series<T>(
    &self,
    name: &str,
    help: &str,
    kind: MetricKind,
    labels: &Labels,
    f: impl FnOnce(&mut Series, &MetricKind) -> T,
  ) -> Result<T, MetricsError> {
    if !valid_name(name) {
      return Err(MetricsError::InvalidName(name.to_string()));
    }
    if let Some(label) = labels.keys().find(|l| !valid_label(l) || l.as_str() == "le") {
      return Err(MetricsError::InvalidLabel {
        metric: name.to_string(),
        label: label.clone(),
      });
    }
    let mut families = self.families.lock();
    let family = families.entry(name.to_string()).or_insert_with(|| Family {
      help: help.to_string(),
      kind: kind.clone(),
      series: BTreeMap::new(),
    });
    if !family.kind.same_kind(&kind) {
      return Err(MetricsError::KindMismatch {
        name: name.to_string(),
        existing: family.kind.as_str(),
      });
    }
    let family_kind = family.kind.clone();
    Ok(f(family.series(labels), &family_kind))
  }

  pub fn inc_counter(&self, name: &str, help: &str, labels: &Labels, by: f64) -> Result<(), MetricsError> {
    if by < 0.0 || by.is_nan() {
      return Err(MetricsError::NegativeIncrement {
        name: name.to_string(),
        value: by,
      });
    }
    self.with_series(name, help, MetricKind::Counter, labels, |series, _| {
      if let Series::Value(v) = series {
        *v += by;
      }
    })
  }

  pub fn set_gauge(&self, name: &str, help: &str, labels: &Labels, value: f64) -> Result<(), MetricsError> {
    self.with_series(name, help, MetricKind::Gauge, labels, |series, _| {
      if let Series::Value(v) = series {
        *v = value;
      }
    })
  }

  pub fn add_gauge(&self, name: &str, help: &str, labels: &Labels, delta: f64) -> Result<(), MetricsError> {
    self.with_series(name, help, MetricKind::Gauge, labels, |series, _| {
      if let Series::Value(v) = series {
        *v += delta;
      }
    })
  }

  /// Record one observation. Buckets only matter the first time the
  /// histogram is seen.
  pub fn observe(
    &self,
    name: &str,
    help: &str,
    buckets: &[f64],
    labels: &Labels,
    value: f64,
  ) -> Result<(), MetricsError> {
    let kind = MetricKind::Histogram {
      buckets: buckets.to_vec(),
    };
    self.with_series(name, help, kind, labels, |series, kind| {
      if let (Series::Histogram { counts, sum, count }, MetricKind::Histogram { buckets }) = (series, kind) {
        if let Some(i) = buckets.iter().position(|b| value <= *b) {
          counts[i] += 1;
        }
        *sum += value;
        *count += 1;
      }
    })
  }

  /// Current value of a counter or gauge series.
  pub fn value(&self, name: &str, labels: &Labels) -> Option<f64> {
    match self.families.lock().get(name)?.series.get(labels)? {
      Series::Value(v) => Some(*v),
      Series::Histogram { .. } => None,
    }
  }

  /// Observation count of a histogram series.
  pub fn histogram_count(&self, name: &str, labels: &Labels) -> Option<u64> {
    match self.families.lock().get(name)?.series.get(labels)? {
      Series::Histogram { count, .. } => Some(*count),
      Series::Value(_) => None,
    }
  }

  pub fn contains(&self, name: &str) -> bool {
    self.families.lock().contains_key(name)
  }

  /// Text exposition format, version 0.0.4.
  pub fn render(&self) -> String {
    let families = self.families.lock();
    let mut out = String::new();
    for (name, family) in families.iter() {
      let _ = writeln!(out, "# HELP {name} {}", escape_help(&family.help));
      let _ = writeln!(out, "# TYPE {name} {}", family.kind.as_str());
      for (labels, series) in &family.series {
        match (series, &family.kind) {
          (Series::Value(v), _) => {
            let _ = writeln!(out, "{name}{} {}", render_labels(labels, None), format_value(*v));
          }
          (Series::Histogram { counts, sum, count }, MetricKind::Histogram { buckets }) => {
            let mut cumulative = 0;
            for (bound, n) in buckets.iter().zip(counts) {
              cumulative += n;
              let le = format_value(*bound);
              let _ = writeln!(out, "{name}_bucket{} {cumulative}", render_labels(labels, Some(&le)));
            }
            let _ = writeln!(out, "{name}_bucket{} {count}", render_labels(labels, Some("+Inf")));
            let _ = writeln!(out, "{name}_sum{} {}", render_labels(labels, None), format_value(*sum));
            let _ = writeln!(out, "{name}_count{} {count}", render_labels(labels, None));
          }
          (Series::Histogram { .. }, _) => {}
        }
      }
    }
    out
  }
}

fn format_value(v: f64) -> String {
  if v == f64::INFINITY {
    "+Inf".into()
  } else if v == f64::NEG_INFINITY {
    "-Inf".into()
  } else {
    v.to_string()
  }
}

fn escape_help(help: &str) -> String {
  help.replace('\\', "\\\\").replace('\n', "\\n")
}

fn escape_label(value: &str) -> String {
  value.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n")
}

fn render_labels(labels: &Labels, le: Option<&str>) -> String {
  if labels.is_empty() && le.is_none() {
    return String::new();
  }
  let mut parts: Vec<String> = labels
    .iter()
    .map(|(k, v)| format!("{k}=\"{}\"", escape_label(v)))
    .collect();
  if let Some(le) = le {
    parts.push(format!("le=\"{le}\""));
  }
  format!("{{{}}}", parts.join(","))
}
