//! Script library: named script buffers, their functions, and temporary
//! scripts synthesized at run time.
//!
//! A source file may hold several scripts, each introduced by a
//! `Script NAME` header line.  Functions are defined after a script's main
//! body:
//!
//! ```text
//! Script Acquire
//! CallFunction Focus 2 1
//! Exit
//!
//! Function Focus 2 0 offset tries
//!   Echo focusing $offset ($tries tries)
//! EndFunction
//! ```
//!
//! Block structure is checked when a script is added, so the forward scans
//! done at run time only ever see well-nested blocks.

use crate::error::{ScriptError, ScriptResult};

use super::flow::check_nesting;
use super::reader::{split_first, tokenize, Keyword, LineKind, ScriptBuffer};
use super::vars::valid_name;

/// A function defined inside a script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionDef {
    pub name: String,
    /// Index of the owning script.
    pub script: usize,
    /// Line of the `Function` header.
    pub start: usize,
    /// Line of the matching `EndFunction`.
    pub end: usize,
    /// Number of required arguments.
    pub nargs: usize,
    /// A final argument takes the rest of the call line as one string.
    pub has_string: bool,
    /// Names the arguments are bound to (`nargs`, plus one for the string).
    pub arg_names: Vec<String>,
}

#[derive(Debug, Default)]
pub struct ScriptLibrary {
    scripts: Vec<ScriptBuffer>,
    functions: Vec<FunctionDef>,
    /// Scripts at or after this index are temporary.
    permanent: usize,
    temp_counter: usize,
}

impl ScriptLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a source text that may contain several `Script NAME` sections.
    /// Text without any header becomes a single script called `default_name`.
    pub fn load_source(&mut self, default_name: &str, src: &str) -> ScriptResult<Vec<usize>> {
        let lines: Vec<&str> = src.lines().collect();
        let headers: Vec<(usize, String)> = lines
            .iter()
            .enumerate()
            .filter_map(|(i, l)| {
                let (first, rest) = split_first(l);
                (first.eq_ignore_ascii_case("Script") && !rest.is_empty() && split_first(rest).1.is_empty())
                    .then(|| (i, rest.to_owned()))
            })
            .collect();

        if headers.is_empty() {
            return Ok(vec![self.add_script(default_name, src)?]);
        }
        if let Some(i) = lines[..headers[0].0]
            .iter()
            .position(|l| !l.trim().is_empty() && !l.trim_start().starts_with('#'))
        {
            return Err(ScriptError::Load {
                script: default_name.to_owned(),
                number: i + 1,
                message: "text before the first Script header".into(),
            });
        }
        let mut added = Vec::with_capacity(headers.len());
        for (n, (at, name)) in headers.iter().enumerate() {
            let end = headers.get(n + 1).map_or(lines.len(), |h| h.0);
            let body = lines[at + 1..end].join("\n");
            added.push(self.add_script(name, &body)?);
        }
        Ok(added)
    }

    /// Add one script.  Fails on a duplicate name or malformed structure.
    pub fn add_script(&mut self, name: &str, src: &str) -> ScriptResult<usize> {
        if self.find_script(name).is_some() {
            return Err(load_err(name, 0, format!("a script named {name} is already loaded")));
        }
        let buffer = ScriptBuffer::new(name, src).map_err(|(line, msg)| load_err(name, line, msg))?;
        let index = self.permanent;
        let defs = scan_functions(&buffer, index)?;
        self.scripts.insert(index, buffer);
        // Temporary scripts (if any) shift up by one.
        for f in self.functions.iter_mut().filter(|f| f.script >= index) {
            f.script += 1;
        }
        self.functions.extend(defs);
        self.permanent += 1;
        Ok(index)
    }

    /// Add a temporary script built from `lines`; it may not define functions.
    pub fn add_temporary<S: AsRef<str>>(&mut self, lines: &[S]) -> ScriptResult<usize> {
        self.temp_counter += 1;
        let name = format!("temporary{}", self.temp_counter);
        let buffer = ScriptBuffer::from_lines(&name, lines).map_err(|(line, msg)| load_err(&name, line, msg))?;
        if let Some(line) = (0..buffer.len())
            .find(|&i| matches!(buffer.keyword(i), Some(Keyword::Function | Keyword::EndFunction)))
        {
            return Err(load_err(&name, line, "functions cannot be defined in a temporary script".into()));
        }
        check_nesting(&buffer, 0, buffer.len()).map_err(|(line, msg)| load_err(&name, line, msg))?;
        self.scripts.push(buffer);
        Ok(self.scripts.len() - 1)
    }

    /// Drop temporary script `index` if it is the newest one.  Temporary
    /// scripts are created and finished in call order, so the one whose
    /// frame just returned is always the newest.
    pub fn release_temporary(&mut self, index: usize) -> bool {
        if index >= self.permanent && index + 1 == self.scripts.len() {
            self.scripts.pop();
            true
        } else {
            false
        }
    }

    #[cfg(test)]
    pub(crate) fn function_mut(&mut self, index: usize) -> &mut FunctionDef {
        &mut self.functions[index]
    }

    /// Discard every temporary script.
    pub fn clear_temporary(&mut self) {
        self.scripts.truncate(self.permanent);
        let permanent = self.permanent;
        self.functions.retain(|f| f.script < permanent);
    }

    pub fn is_temporary(&self, script: usize) -> bool {
        script >= self.permanent
    }

    /// Script `index`, or `None` once a temporary script has been dropped.
    pub fn get(&self, index: usize) -> Option<&ScriptBuffer> {
        self.scripts.get(index)
    }

    pub fn script(&self, index: usize) -> &ScriptBuffer {
        &self.scripts[index]
    }

    pub fn script_count(&self) -> usize {
        self.scripts.len()
    }

    pub fn function(&self, index: usize) -> &FunctionDef {
        &self.functions[index]
    }

    /// Find a script by name (case-insensitive) or by 1-based number.
    pub fn find_script(&self, key: &str) -> Option<usize> {
        let key = key.trim();
        if let Some(i) = self.scripts.iter().position(|s| s.name().eq_ignore_ascii_case(key)) {
            return Some(i);
        }
        match key.parse::<usize>() {
            Ok(n) if n >= 1 && n <= self.permanent => Some(n - 1),
            _ => None,
        }
    }

    /// Find a function: `script::name` picks the script explicitly; a plain
    /// name is looked up in `current` first, then in every script.
    pub fn find_function(&self, key: &str, current: usize) -> Option<usize> {
        if let Some((script, name)) = key.split_once("::") {
            let s = self.find_script(script)?;
            return self
                .functions
                .iter()
                .position(|f| f.script == s && f.name.eq_ignore_ascii_case(name));
        }
        self.functions
            .iter()
            .position(|f| f.script == current && f.name.eq_ignore_ascii_case(key))
            .or_else(|| self.functions.iter().position(|f| f.name.eq_ignore_ascii_case(key)))
    }
}

fn load_err(script: &str, line: usize, message: String) -> ScriptError {
    ScriptError::Load { script: script.to_owned(), number: line + 1, message }
}

/// Validate the structure of `buffer` and collect its function definitions.
fn scan_functions(buffer: &ScriptBuffer, script: usize) -> ScriptResult<Vec<FunctionDef>> {
    let name = buffer.name();
    let err = |line: usize, msg: String| load_err(name, line, msg);
    let mut defs: Vec<FunctionDef> = Vec::new();
    let mut open: Option<FunctionDef> = None;
    let mut main_end = buffer.len();

    for line in 0..buffer.len() {
        match (buffer.keyword(line), open.is_some()) {
            (Some(Keyword::Function), true) => {
                return Err(err(line, "Function inside another function".into()));
            }
            (Some(Keyword::Function), false) => {
                if defs.is_empty() {
                    main_end = line;
                }
                let def = parse_header(buffer.text(line).unwrap_or(""), script, line).map_err(|m| err(line, m))?;
                if defs.iter().any(|d| d.name.eq_ignore_ascii_case(&def.name)) {
                    return Err(err(line, format!("function {} is defined twice", def.name)));
                }
                open = Some(def);
            }
            (Some(Keyword::EndFunction), false) => {
                return Err(err(line, "EndFunction without Function".into()));
            }
            (Some(Keyword::EndFunction), true) => {
                if let Some(mut def) = open.take() {
                    check_nesting(buffer, def.start + 1, line).map_err(|(l, m)| err(l, m))?;
                    def.end = line;
                    defs.push(def);
                }
            }
            (_, false) if !defs.is_empty() => {
                if !matches!(buffer.kind(line), Some(LineKind::Blank)) {
                    return Err(err(line, "code outside a function after the first Function".into()));
                }
            }
            _ => {}
        }
    }
    if let Some(def) = open {
        return Err(err(def.start, format!("function {} has no EndFunction", def.name)));
    }
    check_nesting(buffer, 0, main_end).map_err(|(l, m)| err(l, m))?;
    Ok(defs)
}

/// Parse `Function NAME [nargs] [has_string] [argnames…]`.
fn parse_header(text: &str, script: usize, line: usize) -> Result<FunctionDef, String> {
    let tokens = tokenize(text)?;
    let words: Vec<&str> = tokens.iter().skip(1).map(|t| t.text.as_str()).collect();
    let name = *words.first().ok_or("Function needs a name")?;
    if !valid_name(name) {
        return Err(format!("illegal function name '{name}'"));
    }
    let number = |i: usize, what: &str| -> Result<usize, String> {
        match words.get(i) {
            None => Ok(0),
            Some(w) => w.parse::<usize>().map_err(|_| format!("{what} '{w}' is not a whole number")),
        }
    };
    let nargs = number(1, "argument count")?;
    let has_string = number(2, "string flag")? != 0;
    let total = nargs + usize::from(has_string);

    let given: Vec<String> = words.iter().skip(3).map(|w| (*w).to_owned()).collect();
    if given.len() > total {
        return Err(format!("{} argument names given for {total} arguments", given.len()));
    }
    if let Some(bad) = given.iter().find(|n| !valid_name(n)) {
        return Err(format!("illegal argument name '{bad}'"));
    }
    let arg_names = (0..total)
        .map(|i| given.get(i).cloned().unwrap_or_else(|| format!("argVal{}", i + 1)))
        .collect();

    Ok(FunctionDef { name: name.to_owned(), script, start: line, end: line, nargs, has_string, arg_names })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
