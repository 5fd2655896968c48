/// Scalar values flowing through expressions, scopes and action parameters.
///
/// Strings that look like numbers are treated as numbers by arithmetic and
/// comparisons. Regex captures always arrive as strings, so `hp < 20` has to
/// compare numerically when `hp` was bound to `"15"`.
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Number(f64),
    Str(String),
}

impl Value {
    pub fn empty() -> Self {
        Value::Str(String::new())
    }

    /// Numeric reading of the value, if it has one.
    ///
    /// The empty string has no numeric reading, so `"" + "x"` concatenates
    /// instead of failing.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Bool(b)   => Some(if *b { 1.0 } else { 0.0 }),
            Value::Str(s)    => parse_numeric(s),
        }
    }

    /// Coerce for arithmetic: empty → 0, non-numeric text → NaN.
    pub fn to_number(&self) -> f64 {
        match self.as_number() {
            Some(n) => n,
            None if self.is_blank() => 0.0,
            None => f64::NAN,
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Bool(b)   => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::Str(s)    => {
                let t = s.trim();
                !(t.is_empty() || t == "0" || t.eq_ignore_ascii_case("false"))
            }
        }
    }

    /// Empty or whitespace-only string, i.e. an unset variable.
    pub fn is_blank(&self) -> bool {
        matches!(self, Value::Str(s) if s.trim().is_empty())
    }

    /// Equality used by `==` / `!=`: numeric when both sides are numeric,
    /// otherwise on the display form.
    pub fn loose_eq(&self, other: &Value) -> bool {
        match (self.as_number(), other.as_number()) {
            (Some(a), Some(b)) => a == b,
            _ => self.to_string() == other.to_string(),
        }
    }

    /// Ordering used by `< <= > >=`. `None` when a NaN is involved.
    pub fn loose_cmp(&self, other: &Value) -> Option<Ordering> {
        match (self.as_number(), other.as_number()) {
            (Some(a), Some(b)) => a.partial_cmp(&b),
            _ => Some(self.to_string().cmp(&other.to_string())),
        }
    }
}

fn parse_numeric(s: &str) -> Option<f64> {
    let t = s.trim();
    let first = t.chars().next()?;
    if !(first.is_ascii_digit() || matches!(first, '+' | '-' | '.')) {
        return None;
    }
    // "inf", "-NaN" and friends are text; only finite numbers read back
    t.parse::<f64>().ok().filter(|n| n.is_finite())
}

/// Fixed decimal rendering: integral values have no fraction, never an exponent.
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        return "NaN".to_owned();
    }
    if n.is_infinite() {
        return if n > 0.0 { "Infinity".to_owned() } else { "-Infinity".to_owned() };
    }
    if n == 0.0 {
        return "0".to_owned();
    }
    format!("{}", n)
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b)   => write!(f, "{}", b),
            Value::Number(n) => f.write_str(&format_number(*n)),
            Value::Str(s)    => f.write_str(s),
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::empty()
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_strings_read_as_numbers() {
        assert_eq!(Value::from("15").as_number(), Some(15.0));
        assert_eq!(Value::from(" 2.5 ").as_number(), Some(2.5));
        assert_eq!(Value::from("abc").as_number(), None);
        assert_eq!(Value::from("").as_number(), None);
        assert_eq!(Value::from("nan").as_number(), None);
    }

    #[test]
    fn formats_numbers_without_exponent() {
        assert_eq!(format_number(1.0), "1");
        assert_eq!(format_number(-0.0), "0");
        assert_eq!(format_number(0.25), "0.25");
        assert_eq!(format_number(1e21), "1000000000000000000000");
        assert_eq!(format_number(f64::NEG_INFINITY), "-Infinity");
    }

    #[test]
    fn truthiness() {
        assert!(Value::from("yes").is_truthy());
        assert!(!Value::from("").is_truthy());
        assert!(!Value::from("False").is_truthy());
        assert!(!Value::from("0").is_truthy());
        assert!(!Value::Number(f64::NAN).is_truthy());
        assert!(Value::Number(-1.0).is_truthy());
    }

    #[test]
    fn comparisons_fall_back_to_strings() {
        assert_eq!(Value::from("10").loose_cmp(&Value::from(9.0)), Some(Ordering::Greater));
        assert_eq!(Value::from("b").loose_cmp(&Value::from("a")), Some(Ordering::Greater));
        assert!(Value::from("1").loose_eq(&Value::Number(1.0)));
        assert!(Value::Bool(true).loose_eq(&Value::Number(1.0)));
    }

    #[test]
    fn non_finite_text_is_not_numeric() {
        for text in ["Infinity", "-Infinity", "inf", "-inf", "NaN", "-nan", "1e400"] {
            assert_eq!(Value::from(text).as_number(), None, "{}", text);
        }
        assert_eq!(Value::from("-1.5").as_number(), Some(-1.5));
        assert_eq!(Value::Number(f64::INFINITY).as_number(), Some(f64::INFINITY));
    }
}
