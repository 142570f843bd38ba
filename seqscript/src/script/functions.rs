//! Built-in expression functions.
//!
//! Each function receives a `Vec<Value>` of already-evaluated arguments and
//! returns `Result<Value, String>`.  Names are case-insensitive.  Trig
//! functions work in degrees, matching how angles are written in scripts.

use super::value::Value;

/// Names of every built-in function, uppercased.
pub const FUNCTION_NAMES: &[&str] = &[
    "SQRT", "ABS", "ROUND", "NEARINT", "FLOOR", "CEIL", "FRACTIONAL", "POWER", "EXP", "LOG",
    "LOG10", "SIN", "COS", "TAN", "ASIN", "ACOS", "ATAN", "ATAN2", "MIN", "MAX", "MODULO",
    "STRLEN", "TOUPPER", "TOLOWER",
];

pub fn is_function(name: &str) -> bool {
    FUNCTION_NAMES.iter().any(|f| f.eq_ignore_ascii_case(name))
}

/// Dispatch a built-in function call.
///
/// Returns `None` if `name` is not a built-in.
pub fn call_function(name: &str, args: Vec<Value>) -> Option<Result<Value, String>> {
    // Inner function returns Result<Option<Value>, String>:
    //   Ok(None)    → not a built-in
    //   Ok(Some(v)) → success
    //   Err(e)      → call failed
    fn inner(name: &str, args: Vec<Value>) -> Result<Option<Value>, String> {
        let upper = name.to_ascii_uppercase();
        let name = upper.as_str();
        Ok(Some(match name {
            // ── Math ─────────────────────────────────────────────────────────
            "SQRT" => {
                let x = get_float(&args, 0, name)?;
                if x < 0.0 {
                    return Err(format!("SQRT of negative number {}", Value::Float(x)));
                }
                Value::Float(x.sqrt())
            }
            "ABS" => match args.first().ok_or_else(|| missing(name, 0))? {
                Value::Int(n) => Value::Int(n.abs()),
                v => Value::Float(numeric(v, name)?.abs()),
            },
            "ROUND" => {
                let x = get_float(&args, 0, name)?;
                let digits = args.get(1).map(|v| v.as_int()).unwrap_or(0);
                if digits <= 0 {
                    Value::Float(x.round())
                } else {
                    let scale = 10f64.powi(digits.min(15) as i32);
                    Value::Float((x * scale).round() / scale)
                }
            }
            "NEARINT" => Value::Int(get_float(&args, 0, name)?.round() as i64),
            "FLOOR" => Value::Float(get_float(&args, 0, name)?.floor()),
            "CEIL" => Value::Float(get_float(&args, 0, name)?.ceil()),
            "FRACTIONAL" => Value::Float(get_float(&args, 0, name)?.fract()),
            "POWER" => {
                let base = get_float(&args, 0, name)?;
                let exp = get_float(&args, 1, name)?;
                finite(base.powf(exp), name)?
            }
            "EXP" => finite(get_float(&args, 0, name)?.exp(), name)?,
            "LOG" | "LOG10" => {
                let x = get_float(&args, 0, name)?;
                if x <= 0.0 {
                    return Err(format!("{name} of non-positive number {}", Value::Float(x)));
                }
                Value::Float(if name == "LOG" { x.ln() } else { x.log10() })
            }
            "SIN" => Value::Float(get_float(&args, 0, name)?.to_radians().sin()),
            "COS" => Value::Float(get_float(&args, 0, name)?.to_radians().cos()),
            "TAN" => finite(get_float(&args, 0, name)?.to_radians().tan(), name)?,
            "ASIN" | "ACOS" => {
                let x = get_float(&args, 0, name)?;
                if !(-1.0..=1.0).contains(&x) {
                    return Err(format!("{name} argument {} out of range", Value::Float(x)));
                }
                let r = if name == "ASIN" { x.asin() } else { x.acos() };
                Value::Float(r.to_degrees())
            }
            "ATAN" => Value::Float(get_float(&args, 0, name)?.atan().to_degrees()),
            "ATAN2" => {
                let y = get_float(&args, 0, name)?;
                let x = get_float(&args, 1, name)?;
                Value::Float(y.atan2(x).to_degrees())
            }
            "MIN" | "MAX" => {
                if args.is_empty() {
                    return Err(missing(name, 0));
                }
                let mut best = numeric(&args[0], name)?;
                for v in &args[1..] {
                    let x = numeric(v, name)?;
                    best = if name == "MIN" { best.min(x) } else { best.max(x) };
                }
                Value::Float(best)
            }
            "MODULO" => {
                let a = args.first().ok_or_else(|| missing(name, 0))?;
                let b = args.get(1).ok_or_else(|| missing(name, 1))?;
                a.arith_rem(b)?
            }

            // ── String ───────────────────────────────────────────────────────
            "STRLEN" => Value::Int(get_str(&args, 0, name)?.chars().count() as i64),
            "TOUPPER" => Value::Str(get_str(&args, 0, name)?.to_uppercase()),
            "TOLOWER" => Value::Str(get_str(&args, 0, name)?.to_lowercase()),

            _ => return Ok(None),
        }))
    }
    inner(name, args).transpose()
}

// ── Argument accessors ────────────────────────────────────────────────────────

fn missing(name: &str, idx: usize) -> String {
    format!("{name}: argument {} missing", idx + 1)
}

fn numeric(v: &Value, name: &str) -> Result<f64, String> {
    if v.is_numeric() {
        Ok(v.as_float())
    } else {
        Err(format!("{name}: non-numeric argument '{v}'"))
    }
}

fn finite(x: f64, name: &str) -> Result<Value, String> {
    if x.is_finite() {
        Ok(Value::Float(x))
    } else {
        Err(format!("{name}: result out of range"))
    }
}

fn get_str(args: &[Value], idx: usize, name: &str) -> Result<String, String> {
    args.get(idx).map(|v| v.to_string()).ok_or_else(|| missing(name, idx))
}

fn get_float(args: &[Value], idx: usize, name: &str) -> Result<f64, String> {
    args.get(idx).ok_or_else(|| missing(name, idx)).and_then(|v| numeric(v, name))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str, args: Vec<Value>) -> Value {
        call_function(name, args).expect("not a built-in").expect("call failed")
    }

    fn approx(v: Value, want: f64) {
        assert!((v.as_float() - want).abs() < 1e-9, "{v} != {want}");
    }

    #[test]
    fn rounding_family() {
        assert_eq!(call("round", vec![Value::Float(2.5)]).to_string(), "3");
        assert_eq!(call("ROUND", vec![Value::Float(3.14159), Value::Int(2)]).to_string(), "3.14");
        assert_eq!(call("NEARINT", vec![Value::Float(-1.6)]), Value::Int(-2));
        assert_eq!(call("FLOOR", vec![Value::Float(-1.2)]).to_string(), "-2");
        assert_eq!(call("CEIL", vec![Value::Float(1.2)]).to_string(), "2");
        approx(call("FRACTIONAL", vec![Value::Float(2.75)]), 0.75);
    }

    #[test]
    fn trig_in_degrees() {
        approx(call("SIN", vec![Value::Int(90)]), 1.0);
        approx(call("COS", vec![Value::Int(180)]), -1.0);
        approx(call("ATAN2", vec![Value::Int(1), Value::Int(1)]), 45.0);
        approx(call("ASIN", vec![Value::Float(0.5)]), 30.0);
    }

    #[test]
    fn min_max_modulo() {
        assert_eq!(call("MIN", vec![Value::Int(3), Value::Float(-2.5), Value::Int(7)]).to_string(), "-2.5");
        assert_eq!(call("MAX", vec![Value::Int(3), Value::Int(7)]).to_string(), "7");
        assert_eq!(call("MODULO", vec![Value::Int(17), Value::Int(5)]), Value::Int(2));
    }

    #[test]
    fn string_functions() {
        assert_eq!(call("strlen", vec![Value::Str("hello".into())]), Value::Int(5));
        assert_eq!(call("TOUPPER", vec![Value::Str("abc".into())]), Value::Str("ABC".into()));
        assert_eq!(call("ToLower", vec![Value::Str("AbC".into())]), Value::Str("abc".into()));
    }

    #[test]
    fn domain_errors() {
        assert!(call_function("SQRT", vec![Value::Int(-1)]).unwrap().is_err());
        assert!(call_function("LOG", vec![Value::Int(0)]).unwrap().is_err());
        assert!(call_function("ACOS", vec![Value::Int(2)]).unwrap().is_err());
        assert!(call_function("SQRT", vec![Value::Str("abc".into())]).unwrap().is_err());
        assert!(call_function("SQRT", vec![]).unwrap().is_err());
    }

    #[test]
    fn unknown_is_none() {
        assert!(call_function("NOSUCH", vec![]).is_none());
        assert!(is_function("atan2"));
        assert!(!is_function("echo"));
    }
}
