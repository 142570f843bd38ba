//! Runtime value type for script expressions.
//!
//! Every variable is text at heart; the expression engine coerces freely to
//! integers and floats when an operator needs a number.

use std::fmt;

/// A dynamically typed script value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Str(String),
}

impl Default for Value {
    fn default() -> Self {
        Value::Str(String::new())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(n) => write!(f, "{n}"),
            Value::Float(x) => f.write_str(&format_float(*x)),
            Value::Str(s) => f.write_str(s),
        }
    }
}

/// Format a float the way scripts expect to see it: integral values without
/// a fractional part, others with at most six decimals and no trailing zeros.
pub fn format_float(x: f64) -> String {
    if !x.is_finite() {
        return x.to_string();
    }
    if x.fract() == 0.0 && x.abs() < 1e15 {
        return format!("{}", x as i64);
    }
    if x.abs() < 1e-4 || x.abs() >= 1e15 {
        return format!("{x:e}");
    }
    let s = format!("{x:.6}");
    let s = s.trim_end_matches('0').trim_end_matches('.');
    if s == "-0" {
        "0".to_owned()
    } else {
        s.to_owned()
    }
}

impl Value {
    /// Interpret `s` as a number when it looks like one, otherwise keep it
    /// as a string.
    pub fn parse(s: &str) -> Value {
        let t = s.trim();
        if let Ok(n) = t.parse::<i64>() {
            Value::Int(n)
        } else if let Some(x) = parse_float(t) {
            Value::Float(x)
        } else {
            Value::Str(s.to_owned())
        }
    }

    pub fn is_numeric(&self) -> bool {
        match self {
            Value::Int(_) | Value::Float(_) => true,
            Value::Str(s) => parse_float(s.trim()).is_some(),
        }
    }

    /// Coerce to boolean: `0`, `""`, and `"0"` are falsy.
    pub fn as_bool(&self) -> bool {
        match self {
            Value::Int(n) => *n != 0,
            Value::Float(x) => *x != 0.0,
            Value::Str(s) => {
                let t = s.trim();
                match parse_float(t) {
                    Some(x) => x != 0.0,
                    None => !t.is_empty(),
                }
            }
        }
    }

    /// Coerce to `i64` by truncation (0 when not numeric).
    pub fn as_int(&self) -> i64 {
        match self {
            Value::Int(n) => *n,
            Value::Float(x) => *x as i64,
            Value::Str(s) => parse_float(s.trim()).map(|x| x as i64).unwrap_or(0),
        }
    }

    /// Coerce to `f64` (0.0 when not numeric).
    pub fn as_float(&self) -> f64 {
        match self {
            Value::Int(n) => *n as f64,
            Value::Float(x) => *x,
            Value::Str(s) => parse_float(s.trim()).unwrap_or(0.0),
        }
    }

    // ── Arithmetic helpers ────────────────────────────────────────────────────

    fn int_pair(a: &Value, b: &Value) -> Option<(i64, i64)> {
        match (a.promote(), b.promote()) {
            (Value::Int(x), Value::Int(y)) => Some((x, y)),
            _ => None,
        }
    }

    /// Numeric view of the value: strings that look like numbers become
    /// Int/Float, anything else becomes Int(0).
    fn promote(&self) -> Value {
        match self {
            Value::Str(s) => match Value::parse(s) {
                Value::Str(_) => Value::Int(0),
                v => v,
            },
            v => v.clone(),
        }
    }

    fn check_operands(&self, rhs: &Value, op: &str) -> Result<(), String> {
        for v in [self, rhs] {
            if let Value::Str(s) = v {
                if !v.is_numeric() {
                    return Err(format!("non-numeric operand '{s}' for {op}"));
                }
            }
        }
        Ok(())
    }

    pub fn arith_add(&self, rhs: &Value) -> Result<Value, String> {
        self.check_operands(rhs, "+")?;
        Ok(match Self::int_pair(self, rhs) {
            Some((a, b)) => a.checked_add(b).map(Value::Int).unwrap_or(Value::Float(a as f64 + b as f64)),
            None => Value::Float(self.as_float() + rhs.as_float()),
        })
    }

    pub fn arith_sub(&self, rhs: &Value) -> Result<Value, String> {
        self.check_operands(rhs, "-")?;
        Ok(match Self::int_pair(self, rhs) {
            Some((a, b)) => a.checked_sub(b).map(Value::Int).unwrap_or(Value::Float(a as f64 - b as f64)),
            None => Value::Float(self.as_float() - rhs.as_float()),
        })
    }

    pub fn arith_mul(&self, rhs: &Value) -> Result<Value, String> {
        self.check_operands(rhs, "*")?;
        Ok(match Self::int_pair(self, rhs) {
            Some((a, b)) => a.checked_mul(b).map(Value::Int).unwrap_or(Value::Float(a as f64 * b as f64)),
            None => Value::Float(self.as_float() * rhs.as_float()),
        })
    }

    /// Division is real-valued; an exact integer quotient stays an Int.
    pub fn arith_div(&self, rhs: &Value) -> Result<Value, String> {
        self.check_operands(rhs, "/")?;
        let b = rhs.as_float();
        if b == 0.0 {
            return Err("division by zero".into());
        }
        if let Some((x, y)) = Self::int_pair(self, rhs) {
            if y != 0 && x % y == 0 {
                return Ok(Value::Int(x / y));
            }
        }
        Ok(Value::Float(self.as_float() / b))
    }

    pub fn arith_rem(&self, rhs: &Value) -> Result<Value, String> {
        self.check_operands(rhs, "%")?;
        if rhs.as_float() == 0.0 {
            return Err("modulo by zero".into());
        }
        Ok(match Self::int_pair(self, rhs) {
            Some((a, b)) => Value::Int(a % b),
            None => Value::Float(self.as_float() % rhs.as_float()),
        })
    }

    pub fn arith_neg(&self) -> Result<Value, String> {
        match self.promote() {
            Value::Int(n) => Ok(Value::Int(-n)),
            Value::Float(x) => Ok(Value::Float(-x)),
            Value::Str(s) => Err(format!("cannot negate '{s}'")),
        }
    }

    /// Relational comparison: numeric when both sides are numbers, otherwise
    /// a case-sensitive string comparison.
    pub fn cmp_value(&self, rhs: &Value) -> std::cmp::Ordering {
        if self.is_numeric() && rhs.is_numeric() {
            self.as_float()
                .partial_cmp(&rhs.as_float())
                .unwrap_or(std::cmp::Ordering::Equal)
        } else {
            self.to_string().cmp(&rhs.to_string())
        }
    }
}

/// Parse a float, rejecting the `inf`/`nan` spellings `f64::from_str` accepts
/// so words such as "info" stay strings.
pub fn parse_float(s: &str) -> Option<f64> {
    let first = s.chars().next()?;
    if !(first.is_ascii_digit() || matches!(first, '-' | '+' | '.')) {
        return None;
    }
    if s.chars().any(|c| c.is_ascii_alphabetic() && c != 'e' && c != 'E') {
        return None;
    }
    s.parse::<f64>().ok()
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_owned())
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Int(if b { 1 } else { 0 })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_numbers() {
        assert_eq!(Value::Int(-7).to_string(), "-7");
        assert_eq!(Value::Float(1.0).to_string(), "1");
        assert_eq!(Value::Float(2.5).to_string(), "2.5");
        assert_eq!(Value::Float(1.0 / 3.0).to_string(), "0.333333");
    }

    #[test]
    fn parse_classifies() {
        assert_eq!(Value::parse("42"), Value::Int(42));
        assert_eq!(Value::parse("-1.5"), Value::Float(-1.5));
        assert_eq!(Value::parse("1e3"), Value::Float(1000.0));
        assert_eq!(Value::parse("info"), Value::Str("info".into()));
        assert_eq!(Value::parse("nan"), Value::Str("nan".into()));
    }

    #[test]
    fn as_bool() {
        assert!(Value::Int(1).as_bool());
        assert!(!Value::Int(0).as_bool());
        assert!(Value::Str("hello".into()).as_bool());
        assert!(!Value::Str("".into()).as_bool());
        assert!(!Value::Str("0".into()).as_bool());
        assert!(!Value::Str("0.0".into()).as_bool());
    }

    #[test]
    fn as_int_truncates() {
        assert_eq!(Value::Float(3.9).as_int(), 3);
        assert_eq!(Value::Float(-3.9).as_int(), -3);
        assert_eq!(Value::Str("7.8".into()).as_int(), 7);
        assert_eq!(Value::Str("abc".into()).as_int(), 0);
    }

    #[test]
    fn arithmetic() {
        let a = Value::Int(10);
        let b = Value::Int(4);
        assert_eq!(a.arith_add(&b), Ok(Value::Int(14)));
        assert_eq!(a.arith_sub(&b), Ok(Value::Int(6)));
        assert_eq!(a.arith_mul(&b), Ok(Value::Int(40)));
        assert_eq!(a.arith_div(&b), Ok(Value::Float(2.5)));
        assert_eq!(Value::Int(12).arith_div(&b), Ok(Value::Int(3)));
        assert_eq!(a.arith_rem(&b), Ok(Value::Int(2)));
    }

    #[test]
    fn numeric_strings_take_part_in_arithmetic() {
        assert_eq!(Value::Str("2".into()).arith_add(&Value::Str("0.5".into())), Ok(Value::Float(2.5)));
    }

    #[test]
    fn non_numeric_operands_are_rejected() {
        assert!(Value::Str("abc".into()).arith_add(&Value::Int(1)).is_err());
        assert!(Value::Str("abc".into()).arith_neg().is_err());
    }

    #[test]
    fn division_by_zero() {
        assert!(Value::Int(1).arith_div(&Value::Int(0)).is_err());
        assert!(Value::Int(1).arith_rem(&Value::Float(0.0)).is_err());
    }

    #[test]
    fn comparison_numeric_then_string() {
        use std::cmp::Ordering;
        assert_eq!(Value::Str("10".into()).cmp_value(&Value::Int(9)), Ordering::Greater);
        assert_eq!(Value::Str("abc".into()).cmp_value(&Value::Str("abd".into())), Ordering::Less);
    }
}
