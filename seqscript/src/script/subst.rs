//! Variable substitution and parenthesised-arithmetic expansion.
//!
//! Substitution runs once per line, before command lookup:
//!
//! | Sequence | Meaning |
//! |----------|---------|
//! | `$name` / `${name}` | whole value; array elements joined by spaces |
//! | `$name[i]` | element `i` (1-based); a whole row for a 2-D array |
//! | `$name[r][c]` | element `c` of row `r` of a 2-D array |
//! | `$#name` | element count (row count for a 2-D array) |
//! | `$#name[r]` | number of elements in row `r` |
//! | `$$` | literal `$` |
//!
//! Index text may itself contain references or arithmetic (`$a[$i + 1]`).
//! A reference to an undefined variable is an error.

use std::sync::LazyLock;

use regex::Regex;

use super::expr::{eval_str, EvalContext};
use super::functions::call_function;
use super::value::Value;
use super::vars::{Variable, VariableStore};

static REF_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\$(#?)(?:\{([A-Za-z_][A-Za-z0-9_]*)\}|([A-Za-z_][A-Za-z0-9_]*))")
        .unwrap_or_else(|e| panic!("reference regex: {e}"))
});

/// Evaluation context over a bare variable store, used for index expressions.
pub struct StoreContext<'a>(pub &'a VariableStore);

impl EvalContext for StoreContext<'_> {
    fn get_var(&self, name: &str) -> Option<Value> {
        self.0.lookup(name).map(Variable::as_value)
    }

    fn call_fn(&mut self, name: &str, args: Vec<Value>) -> Result<Value, String> {
        call_function(name, args).unwrap_or_else(|| Err(format!("unknown function {name}")))
    }
}

/// Replace every variable reference in `src`.
pub fn substitute(src: &str, vars: &VariableStore) -> Result<String, String> {
    if !src.contains('$') {
        return Ok(src.to_owned());
    }
    let mut out = String::with_capacity(src.len());
    let mut pos = 0;

    while let Some(off) = src[pos..].find('$') {
        let at = pos + off;
        out.push_str(&src[pos..at]);
        let rest = &src[at..];
        if rest.starts_with("$$") {
            out.push('$');
            pos = at + 2;
            continue;
        }
        let Some(caps) = REF_RE.captures(rest) else {
            out.push('$');
            pos = at + 1;
            continue;
        };
        let count_form = !caps[1].is_empty();
        let name = caps.get(2).or_else(|| caps.get(3)).map(|m| m.as_str()).unwrap_or("");
        let mut end = at + caps[0].len();

        // Up to two bracketed indices.
        let mut indices = Vec::new();
        while indices.len() < 2 && src[end..].starts_with('[') {
            let close = matching_bracket(&src[end..])
                .ok_or_else(|| format!("missing ']' after ${name}"))?;
            let inner = &src[end + 1..end + close];
            indices.push(eval_index(inner, vars)?);
            end += close + 1;
        }

        let var = vars
            .lookup(name)
            .ok_or_else(|| format!("undefined variable ${name}"))?;
        out.push_str(&resolve(var, count_form, &indices)?);
        pos = end;
    }
    out.push_str(&src[pos..]);
    Ok(out)
}

/// Byte offset of the `]` closing the `[` at the start of `s`.
fn matching_bracket(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

pub(crate) fn eval_index(text: &str, vars: &VariableStore) -> Result<usize, String> {
    let text = substitute(text, vars)?;
    let v = eval_str(&text, &mut StoreContext(vars))?;
    if !v.is_numeric() {
        return Err(format!("array index '{text}' is not a number"));
    }
    let i = v.as_int();
    if i < 1 {
        return Err(format!("array index {i} out of range; indices start at 1"));
    }
    Ok(i as usize)
}

fn resolve(var: &Variable, count_form: bool, indices: &[usize]) -> Result<String, String> {
    let name = var.name();
    let out_of_range = |i: usize| format!("index {i} out of range for {name}");
    match (count_form, indices) {
        (true, []) => Ok(if var.is_2d() { var.row_count() } else { var.element_count() }.to_string()),
        (true, [r]) => var
            .row(*r)
            .map(|row| row.len().to_string())
            .ok_or_else(|| out_of_range(*r)),
        (false, []) => Ok(var.as_text()),
        (false, [i]) => var.element(*i).ok_or_else(|| out_of_range(*i)),
        (false, [r, c]) if var.is_2d() => var
            .element_2d(*r, *c)
            .map(str::to_owned)
            .ok_or_else(|| format!("index [{r}][{c}] out of range for {name}")),
        (false, [_, _]) => Err(format!("{name} is not a 2-D array")),
        _ => Err(format!("too many indices for ${name}")),
    }
}

/// Evaluate every top-level parenthesised group outside quotes, replacing it
/// with its value.  Used for commands that allow arithmetic in arguments.
pub fn expand_arithmetic(src: &str, ctx: &mut dyn EvalContext) -> Result<String, String> {
    if !src.contains('(') {
        return Ok(src.to_owned());
    }
    let mut out = String::with_capacity(src.len());
    let mut group = String::new();
    let mut depth = 0usize;
    let mut in_quotes = false;

    for ch in src.chars() {
        match ch {
            '"' if depth == 0 => {
                in_quotes = !in_quotes;
                out.push(ch);
            }
            '(' if !in_quotes => {
                if depth > 0 {
                    group.push(ch);
                }
                depth += 1;
            }
            ')' if !in_quotes && depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    let v = eval_str(&group, ctx)?;
                    out.push_str(&v.to_string());
                    group.clear();
                } else {
                    group.push(ch);
                }
            }
            ')' if !in_quotes => return Err("unbalanced parentheses: unexpected ')'".into()),
            _ if depth > 0 => group.push(ch),
            _ => out.push(ch),
        }
    }
    if depth > 0 {
        return Err("unbalanced parentheses: missing ')'".into());
    }
    Ok(out)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::vars::Scope;

    fn store() -> VariableStore {
        let mut vars = VariableStore::new();
        vars.set("x", &Value::Int(5), Scope::Regular).unwrap();
        vars.set("name", &Value::Str("grid".into()), Scope::Regular).unwrap();
        vars.store(Variable::array("pos", Scope::Regular, vec!["1.5".into(), "-2".into(), "7".into()]))
            .unwrap();
        vars.store(Variable::array_2d("m", Scope::Regular)).unwrap();
        vars.append_row("m", vec!["a".into(), "b".into()]).unwrap();
        vars.append_row("m", vec!["c".into()]).unwrap();
        vars
    }

    #[test]
    fn scalars_and_braces() {
        let vars = store();
        assert_eq!(substitute("Echo $x and ${name}s", &vars).unwrap(), "Echo 5 and grids");
        assert_eq!(substitute("cost $$5", &vars).unwrap(), "cost $5");
        assert_eq!(substitute("no refs", &vars).unwrap(), "no refs");
        assert_eq!(substitute("lone $ sign", &vars).unwrap(), "lone $ sign");
    }

    #[test]
    fn arrays_and_counts() {
        let vars = store();
        assert_eq!(substitute("MoveStage $pos", &vars).unwrap(), "MoveStage 1.5 -2 7");
        assert_eq!(substitute("$pos[2]", &vars).unwrap(), "-2");
        assert_eq!(substitute("$#pos", &vars).unwrap(), "3");
        assert_eq!(substitute("$pos[$x - 3]", &vars).unwrap(), "-2");
        assert_eq!(substitute("$m[1][2] $#m $#m[2] $m[1]", &vars).unwrap(), "b 2 1 a b");
    }

    #[test]
    fn reference_errors() {
        let vars = store();
        assert!(substitute("$nosuch", &vars).unwrap_err().contains("undefined"));
        assert!(substitute("$pos[4]", &vars).is_err());
        assert!(substitute("$pos[0]", &vars).is_err());
        assert!(substitute("$pos[1", &vars).is_err());
        assert!(substitute("$pos[1][1]", &vars).is_err());
    }

    #[test]
    fn arithmetic_groups() {
        let vars = store();
        let mut ctx = StoreContext(&vars);
        assert_eq!(expand_arithmetic("MoveStage (1 + 2) (x * 2)", &mut ctx).unwrap(), "MoveStage 3 10");
        assert_eq!(expand_arithmetic("Echo \"(not this)\" ((2))", &mut ctx).unwrap(), "Echo \"(not this)\" 2");
        assert!(expand_arithmetic("Echo (1 + ", &mut ctx).is_err());
        assert!(expand_arithmetic("Echo 1)", &mut ctx).is_err());
    }
}
