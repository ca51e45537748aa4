use crate::error::MetricsError;

const OPERATORS: [&str; 6] = ["==", "!=", "<=", ">=", "<", ">"];

/// Evaluate a metric's `when` after placeholders were substituted, e.g.
/// `Failed == Failed && 12.5 > 10`. Supports comparisons joined by `&&`
/// and `||` (`&&` binds tighter) plus bare `true`/`false`. Operands may be
/// quoted; two numbers compare numerically, anything else as strings.
pub fn evaluate_condition(expr: &str) -> Result<bool, MetricsError> {
  let fail = |reason: &str| MetricsError::Condition {
    expr: expr.to_string(),
    reason: reason.to_string(),
  };
  if expr.trim().is_empty() {
    return Err(fail("empty condition"));
  }
  for any in expr.split("||") {
    let mut all = true;
    for term in any.split("&&") {
      if !comparison(term).map_err(|reason| fail(&reason))? {
        all = false;
        break;
      }
    }
    if all {
      return Ok(true);
    }
  }
  Ok(false)
}

fn comparison(term: &str) -> Result<bool, String> {
  let term = term.trim();
  let Some((at, op)) = find_operator(term) else {
    return match unquote(term) {
      "true" => Ok(true),
      "false" => Ok(false),
      other => Err(format!("'{other}' is not a comparison")),
    };
  };
  let left = unquote(&term[..at]);
  let right = unquote(&term[at + op.len()..]);
  if left.is_empty() || right.is_empty() {
    return Err(format!("'{term}' is missing an operand"));
  }

  if let (Ok(l), Ok(r)) = (left.parse::<f64>(), right.parse::<f64>()) {
    return Ok(match op {
      "==" => l == r,
      "!=" => l != r,
      "<=" => l <= r,
      ">=" => l >= r,
      "<" => l < r,
      _ => l > r,
    });
  }
  match op {
    "==" => Ok(left == right),
    "!=" => Ok(left != right),
    _ => Err(format!("'{op}' needs numbers, got '{left}' and '{right}'")),
  }
}

/// Leftmost operator outside quotes; two-character ones win ties.
fn find_operator(term: &str) -> Option<(usize, &'static str)> {
  let mut quote = None;
  for (i, c) in term.char_indices() {
    match quote {
      Some(q) if c == q => quote = None,
      Some(_) => {}
      None if c == '"' || c == '\'' => quote = Some(c),
      None => {
        if let Some(op) = OPERATORS.iter().find(|op| term[i..].starts_with(**op)) {
          return Some((i, *op));
        }
      }
    }
  }
  None
}

fn unquote(s: &str) -> &str {
  let s = s.trim();
  for q in ['"', '\''] {
    if let Some(inner) = s.strip_prefix(q).and_then(|rest| rest.strip_suffix(q)) {
      return inner;
    }
  }
  s
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_string_and_number_comparisons() {
    assert!(evaluate_condition("Failed == Failed").unwrap());
    assert!(evaluate_condition("'Succeeded' != \"Failed\"").unwrap());
    assert!(evaluate_condition("12.5 > 10").unwrap());
    assert!(!evaluate_condition("9 >= 10").unwrap());
    assert!(evaluate_condition("10 == 10.0").unwrap());
    assert!(evaluate_condition("true").unwrap());
  }

  #[test]
  fn test_and_binds_tighter_than_or() {
    assert!(evaluate_condition("a == b && 1 < 2 || Failed == Failed").unwrap());
    assert!(!evaluate_condition("a == a && 1 > 2 || x == y").unwrap());
  }

  #[test]
  fn test_operators_inside_quotes_are_text() {
    assert!(evaluate_condition("'a<b' == 'a<b'").unwrap());
  }

  #[test]
  fn test_malformed_conditions() {
    assert!(evaluate_condition("").is_err());
    assert!(evaluate_condition("Failed").is_err());
    assert!(evaluate_condition("== Failed").is_err());
    assert!(evaluate_condition("abc < 1").is_err());
  }
}
