//! Variable store.
//!
//! Variables are case-insensitive names holding either a scalar or an array.
//! Arrays are an ordered list of rows, each row an ordered list of elements;
//! a 1-D array is a single row.  The serialized form joins every element with
//! `\n`, and the element count always equals the number of elements in that
//! serialization.
//!
//! Lifetimes follow the [`Scope`] tag:
//!
//! | Scope | Lives until |
//! |-------|-------------|
//! | `Persistent` | explicitly cleared; survives script runs |
//! | `Regular` | the next script start (or an abort) |
//! | `CallLocal` | the owning call frame is popped |
//! | `LoopIndex` | the owning loop block is popped |
//! | `Report` | the next command that reports values |

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

use super::value::Value;

static NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap_or_else(|e| panic!("variable name regex: {e}"))
});

/// Report variable prefixes; both spellings are set for every report.
pub const REPORT_PREFIXES: [&str; 2] = ["repVal", "reportedValue"];

/// Returns `true` if `name` is a legal variable name.
pub fn valid_name(name: &str) -> bool {
    NAME_RE.is_match(name)
}

// ── Variable ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Persistent,
    Regular,
    CallLocal,
    LoopIndex,
    Report,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    name: String,
    scope: Scope,
    numeric: bool,
    rows: Vec<Vec<String>>,
    two_d: bool,
    count: usize,
}

impl Variable {
    pub fn scalar(name: &str, scope: Scope, value: &Value) -> Self {
        Variable {
            name: name.to_owned(),
            scope,
            numeric: !matches!(value, Value::Str(_)) || value.is_numeric(),
            rows: vec![vec![value.to_string()]],
            two_d: false,
            count: 1,
        }
    }

    pub fn array(name: &str, scope: Scope, elements: Vec<String>) -> Self {
        let mut v = Variable {
            name: name.to_owned(),
            scope,
            numeric: false,
            count: elements.len(),
            rows: vec![elements],
            two_d: false,
        };
        v.refresh_numeric();
        v
    }

    pub fn array_2d(name: &str, scope: Scope) -> Self {
        Variable { name: name.to_owned(), scope, numeric: false, rows: Vec::new(), two_d: true, count: 0 }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn is_numeric(&self) -> bool {
        self.numeric
    }

    pub fn is_2d(&self) -> bool {
        self.two_d
    }

    /// Number of elements (for a 2-D array, across all rows).
    pub fn element_count(&self) -> usize {
        self.count
    }

    /// Number of rows (1 for scalars and 1-D arrays).
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn row(&self, r: usize) -> Option<&[String]> {
        self.rows.get(r.checked_sub(1)?).map(Vec::as_slice)
    }

    /// Every element in order, rows concatenated.
    pub fn elements(&self) -> impl Iterator<Item = &str> {
        self.rows.iter().flatten().map(String::as_str)
    }

    /// The `\n`-joined serialized value.
    pub fn serialized(&self) -> String {
        self.elements().collect::<Vec<_>>().join("\n")
    }

    /// The value as it is substituted into a line: elements separated by
    /// spaces so each becomes its own token.
    pub fn as_text(&self) -> String {
        self.elements().collect::<Vec<_>>().join(" ")
    }

    /// The value as an expression operand.
    pub fn as_value(&self) -> Value {
        if self.count == 1 && !self.two_d {
            Value::parse(&self.rows[0][0])
        } else {
            Value::Str(self.as_text())
        }
    }

    /// 1-based element `i`.  For a 2-D array this is row `i`, space-joined.
    pub fn element(&self, i: usize) -> Option<String> {
        let idx = i.checked_sub(1)?;
        if self.two_d {
            self.rows.get(idx).map(|r| r.join(" "))
        } else {
            self.rows.first()?.get(idx).cloned()
        }
    }

    /// 1-based element `c` of row `r`.
    pub fn element_2d(&self, r: usize, c: usize) -> Option<&str> {
        self.row(r)?.get(c.checked_sub(1)?).map(String::as_str)
    }

    fn set_element(&mut self, r: usize, c: usize, value: String) -> Result<(), String> {
        let slot = r
            .checked_sub(1)
            .and_then(|r| self.rows.get_mut(r))
            .and_then(|row| row.get_mut(c.checked_sub(1)?))
            .ok_or_else(|| format!("index out of range for variable {}", self.name))?;
        *slot = value;
        self.refresh_numeric();
        Ok(())
    }

    fn append(&mut self, values: Vec<String>) -> Result<(), String> {
        if self.two_d {
            return Err(format!("{} is a 2-D array; append a whole row instead", self.name));
        }
        if self.rows.is_empty() {
            self.rows.push(Vec::new());
        }
        self.count += values.len();
        self.rows[0].extend(values);
        self.refresh_numeric();
        Ok(())
    }

    fn append_row(&mut self, values: Vec<String>) -> Result<(), String> {
        if !self.two_d {
            return Err(format!("{} is not a 2-D array", self.name));
        }
        self.count += values.len();
        self.rows.push(values);
        self.refresh_numeric();
        Ok(())
    }

    /// Keep only the first `n` elements (rows, for a 2-D array).
    fn truncate(&mut self, n: usize) -> Result<(), String> {
        if self.two_d {
            if n > self.rows.len() {
                return Err(format!("{} has only {} rows", self.name, self.rows.len()));
            }
            self.rows.truncate(n);
        } else {
            if n > self.count {
                return Err(format!("{} has only {} elements", self.name, self.count));
            }
            if let Some(row) = self.rows.first_mut() {
                row.truncate(n);
            }
        }
        self.count = self.rows.iter().map(Vec::len).sum();
        self.refresh_numeric();
        Ok(())
    }

    fn refresh_numeric(&mut self) {
        self.numeric = self.count > 0 && self.elements().all(|e| Value::parse(e).is_numeric());
    }

    /// Internal consistency: the stored count matches the serialized form.
    pub fn count_matches_serialized(&self) -> bool {
        let s = self.serialized();
        let n = if self.count == 0 { 0 } else { s.split('\n').count() };
        n == self.count || (self.count == 1 && self.rows.len() == 1 && self.rows[0].len() == 1)
    }
}

// ── VariableStore ─────────────────────────────────────────────────────────────

/// A variable bound to one call frame (and, for loop indices, one block).
#[derive(Debug)]
struct LocalEntry {
    key: String,
    var: Variable,
    call_depth: usize,
    block: Option<usize>,
}

/// All variables visible to one interpreter.
///
/// Locals are only visible at the call depth that created them; lookups try
/// the innermost matching local first, then the global table.
#[derive(Debug, Default)]
pub struct VariableStore {
    globals: HashMap<String, Variable>,
    locals: Vec<LocalEntry>,
    call_depth: usize,
}

fn key(name: &str) -> String {
    name.to_ascii_uppercase()
}

impl VariableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current call depth; new locals bind here and lookups see only these.
    pub fn call_depth(&self) -> usize {
        self.call_depth
    }

    pub fn set_call_depth(&mut self, depth: usize) {
        self.call_depth = depth;
    }

    fn local_index(&self, name: &str) -> Option<usize> {
        let k = key(name);
        self.locals
            .iter()
            .rposition(|e| e.call_depth == self.call_depth && e.key == k)
    }

    pub fn lookup(&self, name: &str) -> Option<&Variable> {
        match self.local_index(name) {
            Some(i) => Some(&self.locals[i].var),
            None => self.globals.get(&key(name)),
        }
    }

    fn lookup_mut(&mut self, name: &str) -> Option<&mut Variable> {
        match self.local_index(name) {
            Some(i) => Some(&mut self.locals[i].var),
            None => self.globals.get_mut(&key(name)),
        }
    }

    /// Serialized value of `name`.
    pub fn get(&self, name: &str) -> Option<String> {
        self.lookup(name).map(Variable::serialized)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lookup(name).is_some()
    }

    /// Store a fully built variable under its own name and scope.
    ///
    /// A name that is already local in the current frame is updated in
    /// place, unless persistence is requested, which locals cannot have.
    /// A `Regular` assignment to a `Persistent` variable keeps it persistent.
    pub fn store(&mut self, mut var: Variable) -> Result<(), String> {
        if !valid_name(&var.name) {
            return Err(format!("illegal variable name '{}'", var.name));
        }
        match var.scope {
            Scope::CallLocal => {
                let k = key(&var.name);
                let existing = self.locals.iter().rposition(|e| {
                    e.call_depth == self.call_depth && e.block.is_none() && e.key == k
                });
                match existing {
                    Some(i) => self.locals[i].var = var,
                    None => self.locals.push(LocalEntry {
                        key: k,
                        var,
                        call_depth: self.call_depth,
                        block: None,
                    }),
                }
                return Ok(());
            }
            Scope::LoopIndex => {
                return Err("loop index variables are bound with set_loop_index".into());
            }
            _ => {}
        }
        if let Some(i) = self.local_index(&var.name) {
            if var.scope == Scope::Persistent {
                return Err(format!("local variable {} cannot be made persistent", var.name));
            }
            var.scope = self.locals[i].var.scope;
            self.locals[i].var = var;
            return Ok(());
        }
        let k = key(&var.name);
        if var.scope == Scope::Regular {
            if let Some(prev) = self.globals.get(&k) {
                if prev.scope == Scope::Persistent {
                    var.scope = Scope::Persistent;
                }
            }
        }
        self.globals.insert(k, var);
        Ok(())
    }

    /// Set a scalar.
    pub fn set(&mut self, name: &str, value: &Value, scope: Scope) -> Result<(), String> {
        self.store(Variable::scalar(name, scope, value))
    }

    /// Bind (or rebind) the index variable of the loop block at `block`.
    pub fn set_loop_index(&mut self, name: &str, value: i64, block: usize) -> Result<(), String> {
        if !valid_name(name) {
            return Err(format!("illegal variable name '{name}'"));
        }
        let k = key(name);
        let var = Variable::scalar(name, Scope::LoopIndex, &Value::Int(value));
        let depth = self.call_depth;
        match self
            .locals
            .iter_mut()
            .find(|e| e.call_depth == depth && e.block == Some(block))
        {
            Some(e) => {
                e.key = k;
                e.var = var;
            }
            None => self.locals.push(LocalEntry { key: k, var, call_depth: depth, block: Some(block) }),
        }
        Ok(())
    }

    /// Set element `i` (1-based) of an existing 1-D array, or `[r][c]` of a 2-D one.
    pub fn set_element(&mut self, name: &str, r: usize, c: Option<usize>, value: String) -> Result<(), String> {
        let var = self
            .lookup_mut(name)
            .ok_or_else(|| format!("variable {name} is not defined"))?;
        match (var.two_d, c) {
            (true, Some(c)) => var.set_element(r, c, value),
            (false, None) => var.set_element(1, r, value),
            (true, None) => Err(format!("{name} is a 2-D array; give row and column")),
            (false, Some(_)) => Err(format!("{name} is not a 2-D array")),
        }
    }

    pub fn append(&mut self, name: &str, values: Vec<String>) -> Result<(), String> {
        self.lookup_mut(name)
            .ok_or_else(|| format!("variable {name} is not defined"))?
            .append(values)
    }

    pub fn append_row(&mut self, name: &str, values: Vec<String>) -> Result<(), String> {
        self.lookup_mut(name)
            .ok_or_else(|| format!("variable {name} is not defined"))?
            .append_row(values)
    }

    pub fn truncate(&mut self, name: &str, n: usize) -> Result<(), String> {
        self.lookup_mut(name)
            .ok_or_else(|| format!("variable {name} is not defined"))?
            .truncate(n)
    }

    /// Remove a variable visible from the current frame.  Returns `true` if it existed.
    pub fn remove(&mut self, name: &str) -> bool {
        match self.local_index(name) {
            Some(i) => {
                self.locals.remove(i);
                true
            }
            None => self.globals.remove(&key(name)).is_some(),
        }
    }

    /// Replace the current report values with `values`.
    pub fn set_reports(&mut self, values: &[Value]) {
        self.clear(Scope::Report);
        for (i, v) in values.iter().enumerate() {
            for prefix in REPORT_PREFIXES {
                let name = format!("{prefix}{}", i + 1);
                let k = key(&name);
                // A user variable of the same name keeps its own scope.
                match self.globals.get(&k) {
                    Some(prev) if prev.scope != Scope::Report => {}
                    _ => {
                        self.globals.insert(k, Variable::scalar(&name, Scope::Report, v));
                    }
                }
            }
        }
    }

    /// Remove every variable of `scope`.
    pub fn clear(&mut self, scope: Scope) {
        match scope {
            Scope::CallLocal | Scope::LoopIndex => self.locals.clear(),
            _ => self.globals.retain(|_, v| v.scope != scope),
        }
    }

    /// Drop every local bound at `depth` or deeper.
    pub fn clear_frame(&mut self, depth: usize) {
        self.locals.retain(|e| e.call_depth < depth);
    }

    /// Drop loop index variables of blocks at stack position `from` or above,
    /// bound at the current call depth.
    pub fn clear_loop_indices(&mut self, from: usize) {
        let depth = self.call_depth;
        self.locals
            .retain(|e| !(e.call_depth == depth && e.block.is_some_and(|b| b >= from)));
    }

    /// Number of locals currently bound (all depths).
    pub fn local_count(&self) -> usize {
        self.locals.len()
    }

    /// Iterate over global variables.
    pub fn globals(&self) -> impl Iterator<Item = &Variable> {
        self.globals.values()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
