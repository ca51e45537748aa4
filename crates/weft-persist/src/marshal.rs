//! JSON for storage with every string made plain ASCII.
//!
//! Control bytes become `\xNN`, other non-ASCII code points `\uXXXX` (or
//! `\UXXXXXXXX` above the basic plane) and a backslash is doubled, so no
//! driver or column collation can mangle the stored text. Decoding reverses
//! the escapes.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::PersistError;

pub fn escape_raw(s: &str) -> String {
  let mut out = String::with_capacity(s.len());
  for c in s.chars() {
    match c {
      '\\' => out.push_str("\\\\"),
      c if (c as u32) < 0x20 || c as u32 == 0x7f => out.push_str(&format!("\\x{:02x}", c as u32)),
      c if c.is_ascii() => out.push(c),
      c if (c as u32) <= 0xffff => out.push_str(&format!("\\u{:04x}", c as u32)),
      c => out.push_str(&format!("\\U{:08x}", c as u32)),
    }
  }
  out
}

/// Reverse [`escape_raw`]. Sequences it never produces are kept as they are.
pub fn unescape_raw(s: &str) -> String {
  let mut out = String::with_capacity(s.len());
  let mut rest = s;
  while let Some(idx) = rest.find('\\') {
    out.push_str(&rest[..idx]);
    let tail = &rest[idx + 1..];
    let (width, consumed) = match tail.chars().next() {
      Some('\\') => {
        out.push('\\');
        rest = &tail[1..];
        continue;
      }
      Some('x') => (2, 1),
      Some('u') => (4, 1),
      Some('U') => (8, 1),
      _ => {
        out.push('\\');
        rest = tail;
        continue;
      }
    };
    let decoded = tail
      .get(consumed..consumed + width)
      .and_then(|hex| u32::from_str_radix(hex, 16).ok())
      .and_then(char::from_u32);
    match decoded {
      Some(c) => {
        out.push(c);
        rest = &tail[consumed + width..];
      }
      None => {
        out.push('\\');
        rest = tail;
      }
    }
  }
  out.push_str(rest);
  out
}

fn map_strings(value: Value, f: &dyn Fn(&str) -> String) -> Value {
  match value {
    Value::String(s) => Value::String(f(&s)),
    Value::Array(items) => Value::Array(items.into_iter().map(|v| map_strings(v, f)).collect()),
    Value::Object(map) => Value::Object(map.into_iter().map(|(k, v)| (f(&k), map_strings(v, f))).collect()),
    other => other,
  }
}

/// Serialize `value` with all strings, keys included, escaped.
pub fn to_raw_json<T: Serialize>(value: &T) -> Result<String, PersistError> {
  let tree = serde_json::to_value(value)?;
  Ok(serde_json::to_string(&map_strings(tree, &escape_raw))?)
}

pub fn from_raw_json<T: DeserializeOwned>(raw: &str) -> Result<T, PersistError> {
  let tree: Value = serde_json::from_str(raw)?;
  Ok(serde_json::from_value(map_strings(tree, &unescape_raw))?)
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_escape_raw() {
    assert_eq!(escape_raw("plain"), "plain");
    assert_eq!(escape_raw("a\u{0}b\n"), "a\\x00b\\x0a");
    assert_eq!(escape_raw("café"), "caf\\u00e9");
    assert_eq!(escape_raw("🙂"), "\\U0001f642");
    assert_eq!(escape_raw("c:\\dir"), "c:\\\\dir");
  }

  #[test]
  fn test_unescape_reverses_escape() {
    for s in ["plain", "a\u{0}b\n", "café 🙂", "c:\\dir\\x", "\\u12"] {
      assert_eq!(unescape_raw(&escape_raw(s)), s);
    }
    assert_eq!(unescape_raw("bad \\q and \\u12"), "bad \\q and \\u12");
  }

  #[test]
  fn test_raw_json_recurses_and_keeps_non_strings() {
    let value = json!({"msg": "é", "nested": [{"k\u{1}": "v"}, 3, true, null]});
    let raw = to_raw_json(&value).unwrap();
    assert!(raw.is_ascii());
    assert!(raw.contains("\\\\u00e9"));
    let back: Value = from_raw_json(&raw).unwrap();
    assert_eq!(back, value);
  }
}
