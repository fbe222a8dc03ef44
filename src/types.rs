use serde::Serialize;

/// A decoded column value. Text-format wire values are parsed into these by
/// the per-column parser chosen at relation-discovery time; values that fail
/// to parse fall back to the raw string rather than failing the frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
  Null,
  Bool(bool),
  Int(i64),
  Float(f64),
  String(String),
  Bytes(Vec<u8>),
  Json(serde_json::Value),
}

/// Parses one text-format wire value.
pub type TextParser = fn(&str) -> Value;

/// Maps a type oid to the parser used for its columns.
pub type TypeParserFn = fn(u32) -> TextParser;

/// Built-in parser registry for common scalar oids. Unknown oids pass the
/// text through unchanged.
pub fn default_parser(oid: u32) -> TextParser {
  match oid {
    16 => parse_bool,
    20 | 21 | 23 | 26 => parse_int,
    700 | 701 | 1700 => parse_float,
    17 => parse_bytea,
    114 | 3802 => parse_json,
    _ => parse_text,
  }
}

fn parse_bool(text: &str) -> Value {
  Value::Bool(text == "t" || text == "true")
}

fn parse_int(text: &str) -> Value {
  text
    .parse()
    .map(Value::Int)
    .unwrap_or_else(|_| Value::String(text.to_string()))
}

fn parse_float(text: &str) -> Value {
  text
    .parse()
    .map(Value::Float)
    .unwrap_or_else(|_| Value::String(text.to_string()))
}

// bytea text format is hex with a \x prefix.
fn parse_bytea(text: &str) -> Value {
  text
    .strip_prefix("\\x")
    .and_then(|hex| hex::decode(hex).ok())
    .map(Value::Bytes)
    .unwrap_or_else(|| Value::String(text.to_string()))
}

fn parse_json(text: &str) -> Value {
  serde_json::from_str(text)
    .map(Value::Json)
    .unwrap_or_else(|_| Value::String(text.to_string()))
}

fn parse_text(text: &str) -> Value {
  Value::String(text.to_string())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn scalar_parsers() {
    assert_eq!(default_parser(16)("t"), Value::Bool(true));
    assert_eq!(default_parser(16)("f"), Value::Bool(false));
    assert_eq!(default_parser(23)("42"), Value::Int(42));
    assert_eq!(default_parser(20)("-7"), Value::Int(-7));
    assert_eq!(default_parser(701)("2.5"), Value::Float(2.5));
    assert_eq!(default_parser(17)("\\x0102ff"), Value::Bytes(vec![0x01, 0x02, 0xFF]));
    assert_eq!(
      default_parser(3802)(r#"{"a":1}"#),
      Value::Json(serde_json::json!({"a": 1}))
    );
  }

  #[test]
  fn unknown_oid_passes_text_through() {
    assert_eq!(default_parser(600)("(1,2)"), Value::String("(1,2)".to_string()));
  }

  #[test]
  fn unparsable_values_fall_back_to_text() {
    assert_eq!(default_parser(23)("not-a-number"), Value::String("not-a-number".to_string()));
    assert_eq!(default_parser(17)("\\xzz"), Value::String("\\xzz".to_string()));
  }
}
