use chrono::{DateTime, TimeZone, Utc};
use std::cmp::Ordering;
use std::fmt;

/// A VCL STRING: unlike a host string it distinguishes "never set" from "".
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VclString {
    NotSet,
    Empty,
    Value(String),
}

/// What unset operands become when a concatenation mixes set and unset parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fill {
    /// local variables: unset parts read as ""
    Empty,
    /// headers and everything else: unset parts read as "(null)"
    Null,
}

pub const NULL_DISPLAY: &str = "(null)";

impl VclString {
    pub fn is_set(&self) -> bool {
        !matches!(self, VclString::NotSet)
    }

    pub fn as_str(&self) -> &str {
        match self {
            VclString::NotSet | VclString::Empty => "",
            VclString::Value(s) => s,
        }
    }

    pub fn into_option(self) -> Option<String> {
        match self {
            VclString::NotSet => None,
            VclString::Empty => Some(String::new()),
            VclString::Value(s) => Some(s),
        }
    }

    fn filled(&self, fill: Fill) -> &str {
        match (self, fill) {
            (VclString::NotSet, Fill::Null) => NULL_DISPLAY,
            _ => self.as_str(),
        }
    }

    /// Joins two strings. The result is unset only when both sides are.
    pub fn concat(&self, other: &VclString, fill: Fill) -> VclString {
        VclString::join(&[self.clone(), other.clone()], fill)
    }

    /// Joins a run of parts, filling each unset part on its own. The result
    /// is unset only when every part is.
    pub fn join(parts: &[VclString], fill: Fill) -> VclString {
        if parts.iter().all(|part| !part.is_set()) {
            return VclString::NotSet;
        }
        VclString::from(parts.iter().map(|part| part.filled(fill)).collect::<String>())
    }
}

impl From<String> for VclString {
    fn from(s: String) -> Self {
        if s.is_empty() {
            VclString::Empty
        } else {
            VclString::Value(s)
        }
    }
}

impl From<&str> for VclString {
    fn from(s: &str) -> Self {
        VclString::from(s.to_string())
    }
}

impl From<Option<String>> for VclString {
    fn from(s: Option<String>) -> Self {
        match s {
            Some(s) => VclString::from(s),
            None => VclString::NotSet,
        }
    }
}

impl fmt::Display for VclString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VclString::NotSet => write!(f, "{}", NULL_DISPLAY),
            VclString::Empty => Ok(()),
            VclString::Value(s) => write!(f, "{}", s),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(VclString),
    Integer(i64),
    Float(f64),
    Bool(bool),
    Time(DateTime<Utc>),
}

impl Value {
    pub fn not_set() -> Value {
        Value::String(VclString::NotSet)
    }

    pub fn str(s: impl Into<String>) -> Value {
        Value::String(VclString::from(s.into()))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::String(_) => "STRING",
            Value::Integer(_) => "INTEGER",
            Value::Float(_) => "FLOAT",
            Value::Bool(_) => "BOOL",
            Value::Time(_) => "TIME",
        }
    }

    pub fn is_set(&self) -> bool {
        match self {
            Value::String(s) => s.is_set(),
            _ => true,
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Integer(n) => *n != 0,
            Value::Float(n) => *n != 0.0,
            Value::String(s) => s.is_set(),
            Value::Time(_) => true,
        }
    }

    pub fn to_vcl_string(&self) -> VclString {
        match self {
            Value::String(s) => s.clone(),
            other => VclString::Value(other.to_string()),
        }
    }

    /// The string form with unset values reading as "".
    pub fn to_plain_string(&self) -> String {
        match self {
            Value::String(s) => s.as_str().to_string(),
            other => other.to_string(),
        }
    }

    pub fn to_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(n) => Some(*n as f64),
            Value::Float(n) => Some(*n),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Time(t) => Some(t.timestamp_millis() as f64 / 1000.0),
            Value::String(s) => parse_number(s.as_str()),
        }
    }

    pub fn to_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            Value::String(s) => {
                let text = s.as_str().trim();
                match text.parse::<i64>() {
                    Ok(n) => Some(n),
                    Err(_) => parse_number(text).map(|n| n as i64),
                }
            }
            other => other.to_f64().map(|n| n as i64),
        }
    }

    pub fn to_time(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Time(t) => Some(*t),
            Value::String(s) => parse_time(s.as_str()),
            other => other.to_f64().and_then(time_from_secs),
        }
    }

    fn is_numeric(&self) -> bool {
        matches!(self, Value::Integer(_) | Value::Float(_) | Value::Time(_))
    }

    /// `==` with VCL's loose coercion. Unset strings only equal unset strings.
    pub fn loose_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::String(a), Value::String(b)) => match (a, b) {
                (VclString::NotSet, VclString::NotSet) => true,
                (VclString::NotSet, _) | (_, VclString::NotSet) => false,
                _ => a.as_str() == b.as_str(),
            },
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Bool(b), other) | (other, Value::Bool(b)) => *b == other.is_truthy(),
            (Value::String(VclString::NotSet), _) | (_, Value::String(VclString::NotSet)) => false,
            (a, b) if a.is_numeric() || b.is_numeric() => match (a.to_f64(), b.to_f64()) {
                (Some(x), Some(y)) => (x - y).abs() < f64::EPSILON,
                _ => a.to_plain_string() == b.to_plain_string(),
            },
            (a, b) => a.to_plain_string() == b.to_plain_string(),
        }
    }

    /// Ordering used by `<`, `<=`, `>` and `>=`: numeric when both sides
    /// coerce to numbers, otherwise lexicographic on the string forms.
    pub fn loose_cmp(&self, other: &Value) -> Option<Ordering> {
        match (self.to_f64(), other.to_f64()) {
            (Some(x), Some(y)) => x.partial_cmp(&y),
            _ => Some(self.to_plain_string().cmp(&other.to_plain_string())),
        }
    }
}

impl From<VclString> for Value {
    fn from(s: VclString) -> Self {
        Value::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Integer(n)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Float(n)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => write!(f, "{}", s),
            Value::Integer(n) => write!(f, "{}", n),
            Value::Float(n) => write!(f, "{:.3}", n),
            Value::Bool(b) => write!(f, "{}", if *b { "1" } else { "0" }),
            Value::Time(t) => write!(f, "{}", http_date(t)),
        }
    }
}

pub fn http_date(t: &DateTime<Utc>) -> String {
    t.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

pub fn time_from_secs(secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() {
        return None;
    }
    let millis = (secs * 1000.0).round() as i64;
    Utc.timestamp_millis_opt(millis).single()
}

fn parse_time(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(t) = DateTime::parse_from_rfc2822(text) {
        return Some(t.with_timezone(&Utc));
    }
    if let Ok(t) = DateTime::parse_from_rfc3339(text) {
        return Some(t.with_timezone(&Utc));
    }
    text.parse::<f64>().ok().and_then(time_from_secs)
}

/// Parses a plain number or a `<number><unit>` duration into seconds.
pub fn parse_number(text: &str) -> Option<f64> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(n) = text.parse::<f64>() {
        return Some(n);
    }
    parse_duration(text)
}

/// `"5m"` → 300, `"250ms"` → 0.25, `"30"` → 30. Unknown units do not parse.
pub fn parse_duration(text: &str) -> Option<f64> {
    let text = text.trim();
    let split = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-' || c == '+'))
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);
    let number = number.parse::<f64>().ok()?;
    let multiplier = match unit.trim() {
        "" | "s" => 1.0,
        "ms" => 0.001,
        "m" => 60.0,
        "h" => 3600.0,
        "d" => 86_400.0,
        "w" => 604_800.0,
        "y" => 31_536_000.0,
        _ => return None,
    };
    Some(number * multiplier)
}

/// Duration-typed targets such as `beresp.ttl` hold whole seconds.
pub fn duration_secs(value: &Value) -> i64 {
    match value {
        Value::String(s) => parse_duration(s.as_str()).map(|n| n as i64).unwrap_or(0),
        other => other.to_f64().map(|n| n as i64).unwrap_or(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_set_display_and_truthiness() {
        let unset = Value::not_set();
        assert_eq!(unset.to_string(), "(null)");
        assert!(!unset.is_truthy());
        assert!(Value::str("").is_truthy());
        assert!(!unset.loose_eq(&Value::str("")));
        assert!(Value::str("").loose_eq(&Value::str("")));
        assert!(unset.loose_eq(&Value::not_set()));
    }

    #[test]
    fn test_concat_tri_state() {
        let unset = VclString::NotSet;
        let a = VclString::from("a");
        assert_eq!(unset.concat(&unset, Fill::Null), VclString::NotSet);
        assert_eq!(unset.concat(&unset, Fill::Empty), VclString::NotSet);
        assert_eq!(a.concat(&unset, Fill::Null), VclString::from("a(null)"));
        assert_eq!(unset.concat(&a, Fill::Empty), VclString::from("a"));
        assert_eq!(VclString::Empty.concat(&VclString::Empty, Fill::Null), VclString::Empty);
    }

    #[test]
    fn test_join_fills_each_unset_part() {
        let unset = VclString::NotSet;
        let x = VclString::from("x");
        assert_eq!(
            VclString::join(&[unset.clone(), unset.clone(), x.clone()], Fill::Null),
            VclString::from("(null)(null)x")
        );
        assert_eq!(
            VclString::join(&[unset.clone(), unset.clone(), x], Fill::Empty),
            VclString::from("x")
        );
        assert_eq!(
            VclString::join(&[unset.clone(), unset.clone(), unset], Fill::Null),
            VclString::NotSet
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(Value::Bool(true).to_string(), "1");
        assert_eq!(Value::Float(1.5).to_string(), "1.500");
        assert_eq!(Value::Integer(-3).to_string(), "-3");
        let t = Utc.timestamp_opt(0, 0).single().unwrap();
        assert_eq!(Value::Time(t).to_string(), "Thu, 01 Jan 1970 00:00:00 GMT");
    }

    #[test]
    fn test_loose_equality() {
        assert!(Value::Integer(200).loose_eq(&Value::str("200")));
        assert!(Value::Float(1.0).loose_eq(&Value::Integer(1)));
        assert!(!Value::Integer(1).loose_eq(&Value::str("abc")));
        assert!(Value::Bool(true).loose_eq(&Value::Integer(5)));
        assert_eq!(
            Value::Integer(300).loose_cmp(&Value::str("5m")),
            Some(Ordering::Equal)
        );
        assert_eq!(
            Value::str("a").loose_cmp(&Value::str("b")),
            Some(Ordering::Less)
        );
    }

    #[test]
    fn test_durations() {
        assert_eq!(parse_duration("5m"), Some(300.0));
        assert_eq!(parse_duration("250ms"), Some(0.25));
        assert_eq!(parse_duration("1.5h"), Some(5400.0));
        assert_eq!(parse_duration("30"), Some(30.0));
        assert_eq!(parse_duration("2d"), Some(172_800.0));
        assert_eq!(parse_duration("10x"), None);
        assert_eq!(duration_secs(&Value::str("1h")), 3600);
        assert_eq!(duration_secs(&Value::Integer(42)), 42);
        assert_eq!(duration_secs(&Value::not_set()), 0);
    }
}
