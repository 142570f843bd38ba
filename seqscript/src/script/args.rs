//! Parsed argument vector handed to command handlers and external operations.
//!
//! Every token is kept as text plus a pre-parsed numeric form.  A missing or
//! empty slot is distinct from `0`: callers test [`Args::is_empty`] instead of
//! checking whether a number parsed.

use super::reader::{split_first, Token};
use super::value::parse_float;

/// Most tokens a single line may carry, the command name included.
pub const MAX_TOKENS: usize = 60;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args {
    command: String,
    items: Vec<String>,
    empty: Vec<bool>,
    ints: Vec<i64>,
    floats: Vec<f64>,
    /// Raw substituted text after the command name.
    tail: String,
}

impl Args {
    /// Build from the tokens of a substituted line; `tokens[0]` is the command.
    pub fn from_tokens(tokens: &[Token], tail: &str) -> Result<Args, String> {
        if tokens.len() > MAX_TOKENS {
            return Err(format!("too many items on line ({}, limit {MAX_TOKENS})", tokens.len()));
        }
        let mut iter = tokens.iter();
        let command = iter.next().map(|t| t.text.clone()).unwrap_or_default();
        let mut args = Args { command, tail: tail.trim().to_owned(), ..Args::default() };
        for t in iter {
            args.push(t.text.clone());
        }
        Ok(args)
    }

    /// Build from a command name and plain string arguments.
    pub fn new<S: AsRef<str>>(command: &str, items: &[S]) -> Args {
        let mut args = Args { command: command.to_owned(), ..Args::default() };
        for s in items {
            args.push(s.as_ref().to_owned());
        }
        args.tail = args.items.join(" ");
        args
    }

    fn push(&mut self, text: String) {
        let x = parse_float(text.trim()).unwrap_or(0.0);
        self.empty.push(text.is_empty());
        self.ints.push(x as i64);
        self.floats.push(x);
        self.items.push(text);
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Number of arguments, the command name excluded.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty_list(&self) -> bool {
        self.items.is_empty()
    }

    /// `true` when argument `i` (0-based) is absent or an empty string.
    pub fn is_empty(&self, i: usize) -> bool {
        self.empty.get(i).copied().unwrap_or(true)
    }

    pub fn str(&self, i: usize) -> &str {
        self.items.get(i).map(String::as_str).unwrap_or("")
    }

    /// Integer form (float truncated); 0 when empty or not a number.
    pub fn int(&self, i: usize) -> i64 {
        self.ints.get(i).copied().unwrap_or(0)
    }

    pub fn float(&self, i: usize) -> f64 {
        self.floats.get(i).copied().unwrap_or(0.0)
    }

    /// `true` when argument `i` is present and parses as a number.
    pub fn is_number(&self, i: usize) -> bool {
        self.items.get(i).is_some_and(|s| parse_float(s.trim()).is_some())
    }

    pub fn items(&self) -> &[String] {
        &self.items
    }

    /// Raw text after the command name.
    pub fn tail(&self) -> &str {
        &self.tail
    }

    /// Raw text starting at argument `i`, preserving the original spacing.
    pub fn rest_from(&self, i: usize) -> String {
        let mut rest = self.tail.as_str();
        for _ in 0..i {
            rest = split_first(rest).1;
            if rest.is_empty() {
                break;
            }
        }
        // A quoted first argument loses its quotes in `items`; prefer those.
        if i >= self.items.len() {
            String::new()
        } else if rest.is_empty() || i + 1 == self.items.len() {
            self.items[i..].join(" ")
        } else {
            rest.to_owned()
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::reader::tokenize;

    fn parse(line: &str) -> Args {
        let toks = tokenize(line).unwrap();
        let tail = split_first(line).1;
        Args::from_tokens(&toks, tail).unwrap()
    }

    #[test]
    fn numeric_forms_and_emptiness() {
        let a = parse(r#"MoveStage 1.9 -2.7 "" abc"#);
        assert_eq!(a.command(), "MoveStage");
        assert_eq!(a.len(), 4);
        assert_eq!(a.int(0), 1);
        assert_eq!(a.float(1), -2.7);
        assert_eq!(a.int(1), -2);
        assert!(a.is_empty(2));
        assert!(!a.is_empty(3));
        assert_eq!(a.int(3), 0);
        assert!(!a.is_number(3));
        assert!(a.is_empty(9));
        assert_eq!(a.str(9), "");
    }

    #[test]
    fn zero_is_not_empty() {
        let a = parse("Delay 0");
        assert!(!a.is_empty(0));
        assert!(a.is_number(0));
    }

    #[test]
    fn rest_from_keeps_spacing() {
        let a = parse("Echo one  two   three");
        assert_eq!(a.tail(), "one  two   three");
        assert_eq!(a.rest_from(1), "two   three");
        assert_eq!(a.rest_from(2), "three");
        assert_eq!(a.rest_from(3), "");
    }

    #[test]
    fn too_many_tokens_rejected() {
        let line = format!("Echo {}", vec!["x"; MAX_TOKENS].join(" "));
        let toks = tokenize(&line).unwrap();
        assert!(Args::from_tokens(&toks, "").is_err());
    }

    #[test]
    fn built_from_strings() {
        let a = Args::new("ReportStagePos", &["1", "2"]);
        assert_eq!(a.len(), 2);
        assert_eq!(a.tail(), "1 2");
    }
}
