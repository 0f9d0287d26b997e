//! Tagged scalar values for loosely-typed upstream fields

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// One scalar field value from the feed.
///
/// Integers and floats compare numerically (`Integer(5) == Float(5.0)`),
/// `Null` only equals `Null`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Integer(i) => Some(*i as f64),
            FieldValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Coerce a trimmed string: blank becomes `Null`, strict decimal numbers
    /// become `Integer`/`Float`, everything else stays `Text`.
    pub fn from_text(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return FieldValue::Null;
        }
        parse_number(trimmed).unwrap_or_else(|| FieldValue::Text(trimmed.to_string()))
    }

    /// Convert a JSON scalar. Returns `None` for objects and arrays.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Null => Some(FieldValue::Null),
            Value::Bool(b) => Some(FieldValue::Bool(*b)),
            Value::Number(n) => Some(from_json_number(n)),
            Value::String(s) => Some(FieldValue::from_text(s)),
            Value::Array(_) | Value::Object(_) => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            FieldValue::Null => Value::Null,
            FieldValue::Bool(b) => Value::Bool(*b),
            FieldValue::Integer(i) => Value::from(*i),
            FieldValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            FieldValue::Text(s) => Value::String(s.clone()),
        }
    }
}

fn from_json_number(n: &serde_json::Number) -> FieldValue {
    if let Some(i) = n.as_i64() {
        return FieldValue::Integer(i);
    }
    match n.as_f64() {
        Some(f) if f.fract() == 0.0 && f.abs() < 9.0e15 => FieldValue::Integer(f as i64),
        Some(f) => FieldValue::Float(f),
        None => FieldValue::Text(n.to_string()),
    }
}

fn parse_number(s: &str) -> Option<FieldValue> {
    // Rejects "inf", "NaN", "0x10" and friends that f64::from_str would accept or
    // that are not plain decimal notation.
    let body = s.strip_prefix(&['+', '-'][..]).unwrap_or(s);
    if body.is_empty() || !body.starts_with(|c: char| c.is_ascii_digit() || c == '.') {
        return None;
    }
    if !body
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E' | '+' | '-'))
    {
        return None;
    }
    if let Ok(i) = s.parse::<i64>() {
        return Some(FieldValue::Integer(i));
    }
    let f = s.parse::<f64>().ok().filter(|f| f.is_finite())?;
    if f.fract() == 0.0 && f.abs() < 9.0e15 {
        Some(FieldValue::Integer(f as i64))
    } else {
        Some(FieldValue::Float(f))
    }
}

impl PartialEq for FieldValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (FieldValue::Null, FieldValue::Null) => true,
            (FieldValue::Bool(a), FieldValue::Bool(b)) => a == b,
            (FieldValue::Text(a), FieldValue::Text(b)) => a == b,
            (FieldValue::Integer(a), FieldValue::Integer(b)) => a == b,
            (FieldValue::Float(a), FieldValue::Float(b)) => a == b,
            (FieldValue::Integer(i), FieldValue::Float(f)) | (FieldValue::Float(f), FieldValue::Integer(i)) => {
                integer_eq_float(*i, *f)
            }
            _ => false,
        }
    }
}

/// Exact comparison: no rounding of large integers through f64.
fn integer_eq_float(i: i64, f: f64) -> bool {
    // 2^63 is exactly representable; i64 covers [-2^63, 2^63).
    const LIMIT: f64 = 9_223_372_036_854_775_808.0;
    f.fract() == 0.0 && (-LIMIT..LIMIT).contains(&f) && f as i64 == i
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Null => write!(f, "null"),
            FieldValue::Bool(b) => write!(f, "{}", b),
            FieldValue::Integer(i) => write!(f, "{}", i),
            FieldValue::Float(x) => write!(f, "{}", x),
            FieldValue::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Integer(v)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Text(v.to_string())
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_numeric_strings_become_numbers() {
        assert_eq!(FieldValue::from_text("5"), FieldValue::Integer(5));
        assert_eq!(FieldValue::from_text(" 12.5 "), FieldValue::Float(12.5));
        assert_eq!(FieldValue::from_text("-3"), FieldValue::Integer(-3));
        assert_eq!(FieldValue::from_text("1e3"), FieldValue::Integer(1000));
    }

    #[test]
    fn test_non_numeric_strings_stay_text() {
        assert_eq!(FieldValue::from_text("x"), FieldValue::Text("x".to_string()));
        assert_eq!(FieldValue::from_text("NaN"), FieldValue::Text("NaN".to_string()));
        assert_eq!(FieldValue::from_text("inf"), FieldValue::Text("inf".to_string()));
        assert_eq!(
            FieldValue::from_text("01.03.2020"),
            FieldValue::Text("01.03.2020".to_string())
        );
    }

    #[test]
    fn test_blank_is_null() {
        assert!(FieldValue::from_text("").is_null());
        assert!(FieldValue::from_text("   ").is_null());
    }

    #[test]
    fn test_numeric_equality_across_representations() {
        assert_eq!(FieldValue::Integer(5), FieldValue::Float(5.0));
        assert_eq!(FieldValue::from_json(&json!("5")), FieldValue::from_json(&json!(5)));
        assert_ne!(FieldValue::Integer(5), FieldValue::Text("5".to_string()));
    }

    #[test]
    fn test_large_integers_compare_exactly() {
        let two_pow_53 = 9_007_199_254_740_992_i64;
        assert_ne!(FieldValue::Integer(two_pow_53 + 1), FieldValue::Float(two_pow_53 as f64));
        assert_eq!(FieldValue::Integer(two_pow_53), FieldValue::Float(two_pow_53 as f64));
        assert_ne!(FieldValue::Integer(i64::MAX), FieldValue::Float(i64::MAX as f64));
        assert_ne!(FieldValue::Integer(5), FieldValue::Float(5.5));
    }

    #[test]
    fn test_null_and_zero_are_distinct() {
        assert_ne!(FieldValue::Null, FieldValue::Integer(0));
        assert_ne!(FieldValue::Float(0.0), FieldValue::Null);
    }

    #[test]
    fn test_json_containers_are_rejected() {
        assert!(FieldValue::from_json(&json!([1, 2])).is_none());
        assert!(FieldValue::from_json(&json!({"a": 1})).is_none());
    }

    #[test]
    fn test_serde_keeps_scalar_shape() {
        let values = vec![
            FieldValue::Null,
            FieldValue::Bool(true),
            FieldValue::Integer(105),
            FieldValue::Float(43.7),
            FieldValue::Text("x".to_string()),
        ];
        let json = serde_json::to_string(&values).unwrap();
        assert_eq!(json, r#"[null,true,105,43.7,"x"]"#);
        let back: Vec<FieldValue> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, values);
    }
}
