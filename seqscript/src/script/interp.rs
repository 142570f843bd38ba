//! Script interpreter.
//!
//! The [`Interpreter`] owns the script library, the command table, the
//! variable store and both stacks.  [`Interpreter::step`] executes exactly
//! one line and tells the caller (the scheduler) what happened through a
//! [`Step`]; it never blocks and never waits for an external action itself.
//!
//! It implements [`EvalContext`] so the expression evaluator can call back
//! into it for variable lookups and built-in functions.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{LineRef, ScriptError, ScriptResult};

use super::{
    args::{Args, MAX_TOKENS},
    builtins,
    commands::{CommandFlags, CommandKind, CommandTable},
    expr::{eval_str, EvalContext},
    flow::{scan_forward, Block, BlockKind, ControlStack, LoopState},
    frames::{CallFrame, CallStack},
    functions::call_function,
    library::ScriptLibrary,
    ops::{OpOutcome, OpReport, Operations, TaskToken},
    reader::{classify, next_line, parse_line, split_first, tokenize, AssignOp, Keyword, Line, LineForm, LineKind, Token},
    subst::{eval_index, expand_arithmetic, substitute},
    value::Value,
    vars::{Scope, Variable, VariableStore},
};

// ── Step ──────────────────────────────────────────────────────────────────────

/// What happened when one line was executed.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// The line finished; `no_yield` allows running the next line at once.
    Continue { no_yield: bool },
    /// An external action was started; wait for its completion.
    Started(TaskToken),
    /// Wait for the given time, then continue with the next line.
    Wait(Duration),
    /// A resource was busy; the cursor is back on the same line.
    Busy,
    /// The script asked to pause with a message.
    Pause(String),
    /// The run ended normally.
    Finished,
}

/// The line currently executing.
#[derive(Debug, Clone)]
struct Current {
    /// `None` for a line dispatched from outside any script.
    script: Option<usize>,
    index: usize,
    text: String,
}

const BRIDGE_SCRIPT_NAME: &str = "(bridge)";

/// Words that form an expression and never a list element.
const OPERATORS: &[&str] = &[
    "+", "-", "*", "/", "%", "==", "!=", "<>", "<", "<=", ">", ">=", "AND", "OR", "NOT", "&&", "||", "!",
];

// ── Interpreter ───────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct Interpreter {
    library: ScriptLibrary,
    table: CommandTable,
    pub(crate) vars: VariableStore,
    blocks: ControlStack,
    calls: CallStack,
    /// Script and next line to read.
    script: usize,
    cursor: usize,
    current: Option<Current>,
    top_script: Option<usize>,
    /// Text produced by the script (`Echo`, operation logs, warnings).
    pub output: Vec<String>,
    pub(crate) verbose: bool,
    /// Errors caught by `Try` blocks since the counter was last reset.
    pub errors_caught: usize,
}

impl Interpreter {
    pub fn new(library: ScriptLibrary, table: CommandTable, config: &EngineConfig) -> Self {
        Interpreter {
            library,
            table,
            vars: VariableStore::new(),
            blocks: ControlStack::new(config.max_block_depth),
            calls: CallStack::new(config.max_call_depth),
            script: 0,
            cursor: 0,
            current: None,
            top_script: None,
            output: Vec::new(),
            verbose: config.verbose,
            errors_caught: 0,
        }
    }

    pub fn library(&self) -> &ScriptLibrary {
        &self.library
    }

    pub fn table(&self) -> &CommandTable {
        &self.table
    }

    pub fn variables(&self) -> &VariableStore {
        &self.vars
    }

    pub fn variables_mut(&mut self) -> &mut VariableStore {
        &mut self.vars
    }

    pub fn take_output(&mut self) -> Vec<String> {
        std::mem::take(&mut self.output)
    }

    /// `true` while a script has frames on the call stack.
    pub fn is_running(&self) -> bool {
        !self.calls.is_empty()
    }

    /// Number of active call frames.
    pub fn call_depth(&self) -> usize {
        self.calls.depth()
    }

    /// Number of open control blocks.
    pub fn block_depth(&self) -> usize {
        self.blocks.len()
    }

    /// Script and line index of the next line to read.
    pub fn position(&self) -> (usize, usize) {
        (self.script, self.cursor)
    }

    /// The line being executed, for error reports.
    pub fn current_line(&self) -> Option<LineRef> {
        let cur = self.current.as_ref()?;
        let script = match cur.script {
            Some(s) => self.library.get(s).map_or_else(|| format!("script {}", s + 1), |b| b.name().to_owned()),
            None => BRIDGE_SCRIPT_NAME.to_owned(),
        };
        Some(LineRef { script, number: cur.index + 1, text: cur.text.clone() })
    }

    pub(crate) fn warn(&mut self, message: String) {
        warn!(line = ?self.current_line().map(|l| l.number), "{message}");
        self.output.push(format!("WARNING: {message}"));
    }

    // ── Run lifecycle ─────────────────────────────────────────────────────────

    /// Begin running script `name` (or its 1-based number) from its first line.
    pub fn start(&mut self, name: &str) -> ScriptResult<()> {
        let script = self
            .library
            .find_script(name)
            .ok_or_else(|| ScriptError::abort(format!("no script named {name}")))?;
        self.unwind_all();
        self.vars.clear(Scope::Regular);
        self.vars.clear(Scope::Report);
        self.top_script = Some(script);
        self.enter_top(script)?;
        info!(script = self.library.script(script).name(), "script started");
        Ok(())
    }

    fn enter_top(&mut self, script: usize) -> ScriptResult<()> {
        self.calls.push(CallFrame::top_level(script)).map_err(ScriptError::fatal)?;
        self.vars.set_call_depth(self.calls.depth());
        self.script = script;
        self.cursor = 0;
        Ok(())
    }

    /// Pop every frame and block, dropping locals and temporary scripts.
    pub fn unwind_all(&mut self) {
        self.blocks.clear();
        self.calls.clear();
        self.vars.clear(Scope::CallLocal);
        self.vars.set_call_depth(0);
        self.library.clear_temporary();
    }

    /// End the run; an aborted run also clears script-regular variables.
    pub fn end_run(&mut self, aborted: bool) {
        self.unwind_all();
        if aborted {
            self.vars.clear(Scope::Regular);
        }
    }

    /// Move the cursor back onto the line being executed so it runs again.
    pub fn rewind(&mut self) {
        if let Some(Current { script: Some(s), index, .. }) = self.current {
            self.script = s;
            self.cursor = index;
        }
    }

    /// Store report values and the log line of a finished operation.
    pub fn apply_report(&mut self, report: OpReport) {
        if !report.values.is_empty() {
            self.vars.set_reports(&report.values);
        }
        if let Some(log) = report.log {
            self.output.push(log);
        }
    }

    // ── Stepping ──────────────────────────────────────────────────────────────

    /// Execute one line of the running script.
    pub fn step(&mut self, ops: &mut dyn Operations) -> ScriptResult<Step> {
        if self.calls.is_empty() {
            return Ok(Step::Finished);
        }
        let Some((line, next)) = next_line(self.library.script(self.script), self.cursor) else {
            // Falling off the end returns from the frame.
            self.current = None;
            return self.return_from_frame(Vec::new());
        };
        self.current = Some(Current { script: Some(self.script), index: line.index, text: line.text.clone() });
        self.cursor = next;
        if self.verbose {
            self.output.push(format!("> {}", line.text));
        }
        debug!(script = self.library.script(self.script).name(), line = line.index + 1, "{}", line.text);

        match self.execute(&line, ops) {
            Ok(step) => Ok(step),
            Err(e) => {
                self.raise(e)?;
                Ok(Step::Continue { no_yield: true })
            }
        }
    }

    /// Raise `err` at the current line: an enclosing `Try` catches it and
    /// execution resumes in its `Catch` section, otherwise it is returned.
    pub fn raise(&mut self, err: ScriptError) -> ScriptResult<()> {
        let err = match self.current_line() {
            Some(at) => err.at_line(at),
            None => err,
        };
        if self.catch(&err)? {
            Ok(())
        } else {
            Err(err)
        }
    }

    /// Run one line of text outside any script, as the foreign bridge does.
    pub fn dispatch_text(&mut self, text: &str, ops: &mut dyn Operations) -> ScriptResult<Step> {
        let line = parse_line(text);
        self.current = Some(Current { script: None, index: 0, text: line.text.clone() });
        let result = match (&line.form, classify(&line.text)) {
            (_, LineKind::Keyword(k)) => {
                Err(ScriptError::abort(format!("{} cannot be run outside a script", k.name())))
            }
            (LineForm::Label(_), _) => Ok(Step::Continue { no_yield: true }),
            _ => self.execute(&line, ops),
        };
        let result = result.map_err(|e| match self.current_line() {
            Some(at) => e.at_line(at),
            None => e,
        });
        self.current = None;
        result
    }

    fn execute(&mut self, line: &Line, ops: &mut dyn Operations) -> ScriptResult<Step> {
        match &line.form {
            LineForm::Label(_) => Ok(Step::Continue { no_yield: true }),
            LineForm::Assignment { target, op, rhs } => {
                self.assign(target, *op, rhs)?;
                Ok(Step::Continue { no_yield: true })
            }
            LineForm::Command { name, .. } => match classify(&line.text) {
                LineKind::Keyword(k) => self.control(k, line),
                _ => self.command(name, &line.text, ops),
            },
        }
    }

    // ── Command dispatch ──────────────────────────────────────────────────────

    fn command(&mut self, raw_name: &str, text: &str, ops: &mut dyn Operations) -> ScriptResult<Step> {
        let text = substitute(text, &self.vars).map_err(ScriptError::abort)?;
        let (name_part, tail) = split_first(&text);
        let name = tokenize(name_part)
            .map_err(ScriptError::abort)?
            .into_iter()
            .next()
            .map(|t| t.text)
            .unwrap_or_default();
        if name.is_empty() {
            return Ok(Step::Continue { no_yield: true });
        }
        if raw_name.contains('$') && Keyword::from_token(&name).is_some() {
            return Err(ScriptError::abort(format!(
                "substituted command name {name} is a reserved keyword"
            )));
        }
        let index = self
            .table
            .lookup(&name)
            .ok_or_else(|| ScriptError::abort(format!("unknown command {name}")))?;
        let spec = self.table.spec(index).clone();
        if let CommandKind::Control(k) = spec.kind {
            return Err(ScriptError::abort(format!("{} must be written literally at the start of a line", k.name())));
        }
        let args = self.build_args(&name, tail, spec.flags)?;
        if args.len() < usize::from(spec.min_args) {
            return Err(ScriptError::abort(format!(
                "{} needs at least {} argument{}",
                spec.name,
                spec.min_args,
                if spec.min_args == 1 { "" } else { "s" }
            )));
        }
        let no_yield = spec.flags.contains(CommandFlags::NO_YIELD);

        match spec.kind {
            CommandKind::Builtin(b) => Ok(builtins::run(self, b, &args)?.unwrap_or(Step::Continue { no_yield })),
            CommandKind::External => match ops.invoke(&spec.name, &args) {
                OpOutcome::Done(report) => {
                    self.apply_report(report);
                    Ok(Step::Continue { no_yield })
                }
                OpOutcome::Started(token) => Ok(Step::Started(token)),
                OpOutcome::Busy => {
                    self.rewind();
                    Ok(Step::Busy)
                }
                OpOutcome::Failed(msg) => Err(ScriptError::abort(msg)),
            },
            CommandKind::Control(_) => unreachable!("control commands are rejected above"),
        }
    }

    /// Tokenize the (substituted) text after a command name into [`Args`].
    fn build_args(&mut self, name: &str, tail: &str, flags: CommandFlags) -> ScriptResult<Args> {
        let tail = if flags.contains(CommandFlags::ARITH) {
            expand_arithmetic(tail, self).map_err(ScriptError::abort)?
        } else {
            tail.to_owned()
        };
        let mut tokens = vec![Token { text: name.to_owned(), quoted: false }];
        match tokenize(&tail) {
            Ok(t) => tokens.extend(t),
            // Free text may hold a stray quote; split it on whitespace instead.
            Err(_) if flags.contains(CommandFlags::RAW_TEXT) => tokens.extend(
                tail.split_whitespace().map(|w| Token { text: w.to_owned(), quoted: false }),
            ),
            Err(e) => return Err(ScriptError::abort(e)),
        }
        if flags.contains(CommandFlags::RAW_TEXT) {
            tokens.truncate(MAX_TOKENS);
        }
        Args::from_tokens(&tokens, &tail).map_err(ScriptError::abort)
    }

    fn eval(&mut self, text: &str) -> ScriptResult<Value> {
        eval_str(text, self).map_err(ScriptError::abort)
    }

    // ── Control flow ──────────────────────────────────────────────────────────

    fn control(&mut self, k: Keyword, line: &Line) -> ScriptResult<Step> {
        let flags = self
            .table
            .get(k.name())
            .map(|s| s.flags)
            .unwrap_or(CommandFlags::NO_YIELD);
        let continue_ = Ok(Step::Continue { no_yield: flags.contains(CommandFlags::NO_YIELD) });
        let (_, raw_tail) = split_first(&line.text);

        match k {
            Keyword::If => {
                let cond = self.condition(raw_tail)?;
                self.push_block(BlockKind::If { taken: cond }, line.index)?;
                if !cond {
                    self.skip_to(line.index + 1, &[Keyword::ElseIf, Keyword::Else, Keyword::EndIf])?;
                }
                continue_
            }
            Keyword::ElseIf | Keyword::Else => {
                let taken = match self.top_block(k)?.kind {
                    BlockKind::If { taken } => taken,
                    _ => return Err(self.mismatch(k)),
                };
                if taken {
                    self.skip_to(line.index + 1, &[Keyword::EndIf])?;
                } else if k == Keyword::Else || self.condition(raw_tail)? {
                    if let Some(Block { kind: BlockKind::If { taken }, .. }) = self.blocks.top_mut() {
                        *taken = true;
                    }
                } else {
                    self.skip_to(line.index + 1, &[Keyword::ElseIf, Keyword::Else, Keyword::EndIf])?;
                }
                continue_
            }
            Keyword::EndIf | Keyword::EndTry => {
                let matches = match self.top_block(k)?.kind {
                    BlockKind::If { .. } => k == Keyword::EndIf,
                    BlockKind::Try { .. } => k == Keyword::EndTry,
                    BlockKind::Loop(_) => false,
                };
                if !matches {
                    return Err(self.mismatch(k));
                }
                self.blocks.pop();
                continue_
            }
            Keyword::Loop | Keyword::DoLoop => {
                let args = self.control_args(k, raw_tail, flags)?;
                self.enter_loop(k, &args, line.index)?;
                continue_
            }
            Keyword::EndLoop => {
                self.end_loop()?;
                continue_
            }
            Keyword::Break | Keyword::Continue => {
                self.break_loop(k == Keyword::Break, line.index)?;
                continue_
            }
            Keyword::Try => {
                self.push_block(BlockKind::Try { catching: false }, line.index)?;
                continue_
            }
            Keyword::Catch => {
                // Reached without an error: skip the Catch section.
                if !matches!(self.top_block(k)?.kind, BlockKind::Try { .. }) {
                    return Err(self.mismatch(k));
                }
                self.skip_to(line.index + 1, &[Keyword::EndTry])?;
                continue_
            }
            Keyword::Throw => {
                let msg = substitute(raw_tail, &self.vars).map_err(ScriptError::abort)?;
                let msg = if msg.is_empty() { "Throw executed".to_owned() } else { msg };
                Err(ScriptError::abort(msg))
            }
            Keyword::SkipTo => {
                let args = self.control_args(k, raw_tail, flags)?;
                self.skip_to_label(args.str(0), line.index)?;
                continue_
            }
            Keyword::Call | Keyword::CallScript | Keyword::CallMacro | Keyword::DoScript | Keyword::DoMacro => {
                let args = self.control_args(k, raw_tail, flags)?;
                let target = self
                    .library
                    .find_script(args.str(0))
                    .ok_or_else(|| ScriptError::abort(format!("no script named {}", args.str(0))))?;
                self.push_frame(target, None, 0)?;
                continue_
            }
            Keyword::CallFunction => {
                let args = self.control_args(k, raw_tail, flags)?;
                self.call_function(&args)?;
                continue_
            }
            Keyword::CallStringArray => {
                let args = self.control_args(k, raw_tail, flags)?;
                let var = self
                    .vars
                    .lookup(args.str(0))
                    .ok_or_else(|| ScriptError::abort(format!("variable {} is not defined", args.str(0))))?;
                let lines: Vec<String> = var.elements().map(str::to_owned).collect();
                let target = self
                    .library
                    .add_temporary(&lines)
                    .map_err(|e| ScriptError::abort(format!("cannot run {} as a script: {e}", args.str(0))))?;
                self.push_frame(target, None, 0)?;
                continue_
            }
            Keyword::Function | Keyword::EndFunction => self.return_from_frame(Vec::new()),
            Keyword::Return => {
                let args = self.control_args(k, raw_tail, flags)?;
                let values = args.items().iter().map(|s| Value::parse(s)).collect();
                self.return_from_frame(values)
            }
            Keyword::Exit => {
                let msg = substitute(raw_tail, &self.vars).map_err(ScriptError::abort)?;
                if !msg.is_empty() {
                    self.output.push(msg);
                }
                self.unwind_all();
                Ok(Step::Finished)
            }
            Keyword::Repeat => {
                let top = self.top_script.ok_or_else(|| ScriptError::fatal("Repeat with no top-level script"))?;
                self.unwind_all();
                self.enter_top(top)?;
                Ok(Step::Continue { no_yield: false })
            }
        }
    }

    fn control_args(&mut self, k: Keyword, raw_tail: &str, flags: CommandFlags) -> ScriptResult<Args> {
        let tail = substitute(raw_tail, &self.vars).map_err(ScriptError::abort)?;
        let args = self.build_args(k.name(), &tail, flags)?;
        let min = self.table.get(k.name()).map_or(0, |s| usize::from(s.min_args));
        if args.len() < min {
            return Err(ScriptError::abort(format!("{} needs at least {min} argument{}", k.name(), if min == 1 { "" } else { "s" })));
        }
        Ok(args)
    }

    fn condition(&mut self, raw_tail: &str) -> ScriptResult<bool> {
        let text = substitute(raw_tail, &self.vars).map_err(ScriptError::abort)?;
        if text.trim().is_empty() {
            return Err(ScriptError::abort("missing condition"));
        }
        Ok(self.eval(&text)?.as_bool())
    }

    fn frame_mark(&self) -> usize {
        self.calls.top().map_or(0, |f| f.block_mark)
    }

    /// The innermost block of the current frame, which `k` must close or continue.
    fn top_block(&self, k: Keyword) -> ScriptResult<&Block> {
        match self.blocks.top() {
            Some(b) if self.blocks.len() > self.frame_mark() => Ok(b),
            _ => Err(ScriptError::fatal(format!("{} without an open block", k.name()))),
        }
    }

    fn mismatch(&self, k: Keyword) -> ScriptError {
        let open = self.blocks.top().map_or("nothing", |b| b.keyword_name());
        ScriptError::fatal(format!("{} does not match the open {open} block", k.name()))
    }

    fn push_block(&mut self, kind: BlockKind, line: usize) -> ScriptResult<usize> {
        self.blocks.push(Block { kind, line }).map_err(ScriptError::fatal)
    }

    /// Move the cursor onto the next matching `targets` line at this level.
    fn skip_to(&mut self, from: usize, targets: &[Keyword]) -> ScriptResult<usize> {
        let hit = scan_forward(self.library.script(self.script), from, 0, targets)
            .map_err(|e| ScriptError::fatal(e.message(targets)))?;
        self.cursor = hit.line;
        Ok(hit.line)
    }

    fn loop_bound(args: &Args, i: usize, what: &str) -> ScriptResult<i64> {
        if !args.is_number(i) {
            return Err(ScriptError::abort(format!("{what} '{}' is not a number", args.str(i))));
        }
        Ok(args.int(i))
    }

    fn enter_loop(&mut self, k: Keyword, args: &Args, line: usize) -> ScriptResult<()> {
        let (var, start, limit, increment) = if k == Keyword::Loop {
            let count = Self::loop_bound(args, 0, "loop count")?;
            let var = (!args.is_empty(1)).then(|| args.str(1).to_owned());
            (var, 1, count, 1)
        } else {
            let start = Self::loop_bound(args, 1, "loop start")?;
            let limit = Self::loop_bound(args, 2, "loop end")?;
            let increment = if args.is_empty(3) { 1 } else { Self::loop_bound(args, 3, "loop increment")? };
            (Some(args.str(0).to_owned()), start, limit, increment)
        };
        if increment == 0 {
            return Err(ScriptError::abort("loop increment cannot be 0"));
        }
        if let Some(v) = &var {
            if !crate::script::vars::valid_name(v) {
                return Err(ScriptError::abort(format!("illegal loop variable name '{v}'")));
            }
        }
        let state = LoopState { start_line: line, counter: start, limit, increment, index_var: var };
        if state.exhausted() {
            let hit = scan_forward(self.library.script(self.script), line + 1, 0, &[Keyword::EndLoop])
                .map_err(|e| ScriptError::fatal(e.message(&[Keyword::EndLoop])))?;
            self.cursor = hit.line + 1;
            return Ok(());
        }
        let index_var = state.index_var.clone();
        let pos = self.push_block(BlockKind::Loop(state), line)?;
        if let Some(v) = index_var {
            self.vars.set_loop_index(&v, start, pos).map_err(ScriptError::abort)?;
        }
        Ok(())
    }

    fn end_loop(&mut self) -> ScriptResult<()> {
        let pos = self.blocks.len().wrapping_sub(1);
        let (again, start_line, index) = match self.top_block(Keyword::EndLoop)?.kind.clone() {
            BlockKind::Loop(mut state) => {
                // A counter that would overflow has passed any limit.
                let again = match state.counter.checked_add(state.increment) {
                    Some(next) => {
                        state.counter = next;
                        !state.exhausted()
                    }
                    None => false,
                };
                let (start_line, counter, var) = (state.start_line, state.counter, state.index_var.clone());
                if let Some(Block { kind: BlockKind::Loop(s), .. }) = self.blocks.top_mut() {
                    *s = state;
                }
                (again, start_line, var.map(|v| (v, counter)))
            }
            _ => return Err(self.mismatch(Keyword::EndLoop)),
        };
        if again {
            if let Some((v, counter)) = index {
                self.vars.set_loop_index(&v, counter, pos).map_err(ScriptError::abort)?;
            }
            self.cursor = start_line + 1;
        } else {
            self.blocks.pop();
            self.vars.clear_loop_indices(pos);
        }
        Ok(())
    }

    fn break_loop(&mut self, is_break: bool, line: usize) -> ScriptResult<()> {
        let word = if is_break { Keyword::Break } else { Keyword::Continue };
        let pos = self
            .blocks
            .innermost_loop(self.frame_mark())
            .ok_or_else(|| ScriptError::abort(format!("{} outside a loop", word.name())))?;
        let inner = self.blocks.len() - 1 - pos;
        let hit = scan_forward(self.library.script(self.script), line + 1, inner, &[Keyword::EndLoop])
            .map_err(|e| ScriptError::fatal(e.message(&[Keyword::EndLoop])))?;
        if is_break {
            self.blocks.truncate(pos);
            self.vars.clear_loop_indices(pos);
            self.cursor = hit.line + 1;
        } else {
            self.blocks.truncate(pos + 1);
            self.vars.clear_loop_indices(pos + 1);
            self.cursor = hit.line;
        }
        Ok(())
    }

    /// Jump forward to `LABEL:`, leaving (never entering) blocks on the way.
    fn skip_to_label(&mut self, label: &str, line: usize) -> ScriptResult<()> {
        let buffer = self.library.script(self.script);
        let mut depth: i64 = 0;
        let mut lowest: i64 = 0;
        // Level at which a middle keyword (Else, Catch…) of an enclosing block was crossed.
        let mut branch_level: Option<i64> = None;
        let mut found = None;
        for i in line + 1..buffer.len() {
            match buffer.kind(i) {
                Some(LineKind::Label(l)) if l.eq_ignore_ascii_case(label) => {
                    found = Some(i);
                    break;
                }
                Some(LineKind::Keyword(k)) => match *k {
                    Keyword::Function | Keyword::EndFunction => break,
                    k if k.opens_block() => depth += 1,
                    k if k.closes_block() => {
                        depth -= 1;
                        lowest = lowest.min(depth);
                        if branch_level.is_some_and(|b| depth < b) {
                            branch_level = None;
                        }
                    }
                    Keyword::ElseIf | Keyword::Else | Keyword::Catch if depth == lowest => {
                        branch_level = Some(depth);
                    }
                    _ => {}
                },
                _ => {}
            }
        }
        let target = found.ok_or_else(|| {
            ScriptError::abort(format!("label {label} not found after this line (SkipTo only jumps forward)"))
        })?;
        if depth != lowest || branch_level == Some(depth) {
            return Err(ScriptError::abort(format!("SkipTo {label} would jump into a block")));
        }
        let leave = usize::try_from(-lowest).unwrap_or(0);
        let height = self.blocks.len();
        if height < self.frame_mark() + leave {
            return Err(ScriptError::fatal(format!("SkipTo {label} leaves more blocks than are open")));
        }
        self.blocks.truncate(height - leave);
        self.vars.clear_loop_indices(height - leave);
        self.cursor = target + 1;
        Ok(())
    }

    // ── Calls ─────────────────────────────────────────────────────────────────

    fn push_frame(&mut self, script: usize, function: Option<usize>, line: usize) -> ScriptResult<()> {
        let frame = CallFrame {
            script,
            function,
            return_to: Some((self.script, self.cursor)),
            block_mark: self.blocks.len(),
        };
        self.calls.push(frame).map_err(ScriptError::fatal)?;
        self.vars.set_call_depth(self.calls.depth());
        self.script = script;
        self.cursor = line;
        Ok(())
    }

    fn call_function(&mut self, args: &Args) -> ScriptResult<()> {
        let name = args.str(0);
        let f = self
            .library
            .find_function(name, self.script)
            .ok_or_else(|| ScriptError::abort(format!("no function named {name}")))?;
        if self.calls.is_active(f) {
            return Err(ScriptError::abort(format!("re-entrant call to function {name}, which is already running")));
        }
        let def = self.library.function(f).clone();
        let given = args.len() - 1;
        if given < def.nargs {
            return Err(ScriptError::abort(format!(
                "function {} needs {} argument{}, {given} given",
                def.name,
                def.nargs,
                if def.nargs == 1 { "" } else { "s" }
            )));
        }
        if given > def.nargs && !def.has_string {
            self.warn(format!("{} extra arguments to function {} ignored", given - def.nargs, def.name));
        }
        let values: Vec<Value> = (0..def.nargs).map(|i| Value::parse(args.str(i + 1))).collect();
        let text = def.has_string.then(|| args.rest_from(def.nargs + 1));

        // Arguments are bound at the callee's depth while the caller's line
        // is still current, so a binding error is raised at the call site.
        let depth = self.calls.depth() + 1;
        self.vars.set_call_depth(depth);
        let bound = Self::bind_arguments(&mut self.vars, &def.arg_names, values, text)
            .and_then(|()| self.push_frame(def.script, Some(f), def.start + 1));
        if bound.is_err() {
            self.vars.clear_frame(depth);
            self.vars.set_call_depth(self.calls.depth());
        }
        bound
    }

    fn bind_arguments(
        vars: &mut VariableStore,
        names: &[String],
        values: Vec<Value>,
        text: Option<String>,
    ) -> ScriptResult<()> {
        for (name, v) in names.iter().zip(values) {
            vars.set(name, &v, Scope::CallLocal).map_err(ScriptError::abort)?;
        }
        if let (Some(text), Some(name)) = (text, names.last()) {
            vars.set(name, &Value::Str(text), Scope::CallLocal).map_err(ScriptError::abort)?;
        }
        Ok(())
    }

    /// Discard a temporary script once no frame is running it.
    fn release_script(&mut self, script: usize) {
        if self.library.is_temporary(script) && !self.calls.runs_script(script) {
            self.library.release_temporary(script);
        }
    }

    /// Pop the current frame, dropping its blocks and locals.
    fn return_from_frame(&mut self, values: Vec<Value>) -> ScriptResult<Step> {
        let depth = self.calls.depth();
        let Some(frame) = self.calls.pop() else {
            return Ok(Step::Finished);
        };
        self.blocks.truncate(frame.block_mark);
        self.vars.clear_frame(depth);
        self.vars.set_call_depth(self.calls.depth());
        self.release_script(frame.script);
        match frame.return_to {
            Some((script, line)) if !self.calls.is_empty() => {
                self.script = script;
                self.cursor = line;
                if !values.is_empty() {
                    self.vars.set_reports(&values);
                }
                Ok(Step::Continue { no_yield: true })
            }
            _ => {
                self.unwind_all();
                Ok(Step::Finished)
            }
        }
    }

    // ── Try / Catch ───────────────────────────────────────────────────────────

    /// Transfer control to the `Catch` of the innermost open `Try`.
    /// Returns `false` when nothing catches `err`.
    fn catch(&mut self, err: &ScriptError) -> ScriptResult<bool> {
        if !err.is_catchable() || self.blocks.try_nesting() == 0 {
            return Ok(false);
        }
        let Some(from) = self.current.as_ref().filter(|c| c.script == Some(self.script)).map(|c| c.index)
        else {
            return Ok(false);
        };
        let Some(pos) = self.blocks.innermost_try(0) else {
            return Ok(false);
        };

        // Unwind frames entered after the Try, resuming the scan at the call line.
        let mut from = from;
        let mut height = self.blocks.len();
        while self.calls.top().is_some_and(|f| f.block_mark > pos) {
            let depth = self.calls.depth();
            let Some(frame) = self.calls.pop() else { break };
            self.vars.clear_frame(depth);
            self.release_script(frame.script);
            let (script, resume) = frame
                .return_to
                .ok_or_else(|| ScriptError::fatal("call stack corrupted while unwinding to Catch"))?;
            self.script = script;
            from = resume.saturating_sub(1);
            height = frame.block_mark;
        }
        self.vars.set_call_depth(self.calls.depth());
        let inner = height - pos - 1;
        self.blocks.truncate(pos + 1);
        self.vars.clear_loop_indices(pos + 1);

        let targets = [Keyword::Catch, Keyword::EndTry];
        let hit = scan_forward(self.library.script(self.script), from, inner, &targets)
            .map_err(|e| ScriptError::fatal(e.message(&targets)))?;
        let message = err.to_string();
        if hit.keyword == Keyword::Catch {
            self.blocks.enter_catch(pos);
        } else {
            self.blocks.truncate(pos);
        }
        self.cursor = hit.line + 1;
        self.vars.set_reports(&[Value::Str(message.clone())]);
        self.errors_caught += 1;
        info!(line = hit.line + 1, "caught: {message}");
        Ok(true)
    }

    // ── Assignment ────────────────────────────────────────────────────────────

    fn assign(&mut self, target: &str, op: AssignOp, rhs: &str) -> ScriptResult<()> {
        let rhs = substitute(rhs, &self.vars).map_err(ScriptError::abort)?;
        let scope = if op.is_persistent() { Scope::Persistent } else { Scope::Regular };

        if let Some(open) = target.find('[') {
            let name = &target[..open];
            let indices = parse_indices(&target[open..], &self.vars)?;
            if op.is_persistent() {
                return Err(ScriptError::abort("array elements cannot be assigned with :="));
            }
            let value = if op.is_text() { rhs } else { self.eval(&rhs)?.to_string() };
            return self
                .vars
                .set_element(name, indices[0], indices.get(1).copied(), value)
                .map_err(ScriptError::abort);
        }

        let var = if op.is_text() {
            Variable::scalar(target, scope, &Value::Str(rhs))
        } else {
            match eval_str(&rhs, self) {
                Ok(v) => Variable::scalar(target, scope, &v),
                Err(e) => Variable::array(target, scope, self.list_elements(&rhs, e)?),
            }
        };
        self.vars.store(var).map_err(ScriptError::abort)
    }

    /// Elements of a whitespace list, each parenthesised group evaluated.
    /// `expr_err` is reported when the text is a broken expression instead.
    fn list_elements(&mut self, rhs: &str, expr_err: String) -> ScriptResult<Vec<String>> {
        let expanded = expand_arithmetic(rhs, self).map_err(ScriptError::abort)?;
        let tokens = tokenize(&expanded).map_err(ScriptError::abort)?;
        let is_operator = |t: &Token| !t.quoted && OPERATORS.iter().any(|o| o.eq_ignore_ascii_case(&t.text));
        if tokens.len() < 2 || tokens.iter().any(is_operator) {
            return Err(ScriptError::abort(if rhs.trim().is_empty() {
                "nothing to assign".to_owned()
            } else {
                expr_err
            }));
        }
        Ok(tokens.into_iter().map(|t| t.text).collect())
    }
}

/// Parse `[i]` or `[r][c]` after an assignment target.
fn parse_indices(text: &str, vars: &VariableStore) -> ScriptResult<Vec<usize>> {
    let mut out = Vec::new();
    let mut rest = text;
    while let Some(inner) = rest.strip_prefix('[') {
        let close = inner.find(']').ok_or_else(|| ScriptError::abort("missing ']' in assignment target"))?;
        out.push(eval_index(&inner[..close], vars).map_err(ScriptError::abort)?);
        rest = &inner[close + 1..];
    }
    if !rest.is_empty() || out.is_empty() || out.len() > 2 {
        return Err(ScriptError::abort("malformed array element in assignment target"));
    }
    Ok(out)
}

// ── EvalContext impl ──────────────────────────────────────────────────────────

impl EvalContext for Interpreter {
    fn get_var(&self, name: &str) -> Option<Value> {
        self.vars.lookup(name).map(Variable::as_value)
    }

    fn call_fn(&mut self, name: &str, args: Vec<Value>) -> Result<Value, String> {
        call_function(name, args).unwrap_or_else(|| Err(format!("unknown function {name}")))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::ops::NoOperations;

    fn interp(src: &str) -> Interpreter {
        let mut lib = ScriptLibrary::new();
        lib.load_source("main", src).expect("load");
        let mut it = Interpreter::new(lib, CommandTable::builtin(), &EngineConfig::default());
        it.start("main").expect("start");
        it
    }

    /// Run to completion, returning the output or the abort message.
    fn run(src: &str) -> Result<Vec<String>, String> {
        let mut it = interp(src);
        for _ in 0..10_000 {
            match it.step(&mut NoOperations) {
                Ok(Step::Finished) => return Ok(it.take_output()),
                Ok(_) => {}
                Err(e) => return Err(e.to_string()),
            }
        }
        panic!("script did not finish");
    }

    fn out(src: &str) -> Vec<String> {
        run(src).unwrap_or_else(|e| panic!("script aborted: {e}"))
    }

    #[test]
    fn loop_echo() {
        assert_eq!(out("LOOP 3\n ECHO hi\nENDLOOP"), vec!["hi", "hi", "hi"]);
    }

    #[test]
    fn if_else() {
        assert_eq!(out("X = 5\nIF X > 3\n ECHO big\nELSE\n ECHO small\nENDIF"), vec!["big"]);
        assert_eq!(out("X = 1\nIF $X > 3\n ECHO big\nELSEIF $X == 1\n ECHO one\nELSE\n ECHO small\nENDIF"), vec!["one"]);
        assert_eq!(out("IF 0\nECHO a\nELSEIF 0\nECHO b\nENDIF\nECHO done"), vec!["done"]);
    }

    #[test]
    fn try_catch() {
        assert_eq!(out("TRY\n THROW oops\nCATCH\n ECHO caught $repVal1\nENDTRY\nECHO after"), vec![
            "caught oops",
            "after"
        ]);
        assert_eq!(out("TRY\n ECHO fine\nCATCH\n ECHO caught\nENDTRY"), vec!["fine"]);
    }

    #[test]
    fn uncaught_throw_aborts() {
        let e = run("ECHO a\nTHROW bad thing\nECHO b").unwrap_err();
        assert_eq!(e, "bad thing");
    }

    #[test]
    fn catch_unwinds_through_function() {
        let src = "\
Try
  Loop 2 i
    CallFunction F
  EndLoop
Catch
  Echo caught $repVal1
EndTry
Echo end
Function F
  If 1
    Throw from F
  EndIf
EndFunction";
        assert_eq!(out(src), vec!["caught from F", "end"]);
    }

    #[test]
    fn do_loop_counts_and_index() {
        assert_eq!(out("DoLoop i 3 1 -1\n Echo $i\nEndLoop"), vec!["3", "2", "1"]);
        assert_eq!(out("DoLoop i 5 1\n Echo never\nEndLoop\nEcho done"), vec!["done"]);
        assert_eq!(out("DoLoop i 1 10 4\n Echo $i\nEndLoop"), vec!["1", "5", "9"]);
        assert!(run("DoLoop i 1 3 0\nEndLoop").unwrap_err().contains("increment"));
    }

    #[test]
    fn do_loop_with_extreme_bounds_ends() {
        assert_eq!(out("DoLoop i 1 1e19 1e19\n Echo body $i\nEndLoop\nEcho done"), vec!["body 1", "done"]);
        assert_eq!(out("DoLoop i -1 -1e19 -1e19\n Echo body $i\nEndLoop\nEcho done"), vec!["body -1", "done"]);
        let max = i64::MAX;
        assert_eq!(out(&format!("DoLoop i {} {max}\n Echo $i\nEndLoop", max - 1)), vec![
            (max - 1).to_string(),
            max.to_string()
        ]);
    }

    #[test]
    fn loop_index_is_gone_after_loop() {
        let e = run("Loop 2 k\nEndLoop\nEcho $k").unwrap_err();
        assert!(e.contains("undefined"), "{e}");
    }

    #[test]
    fn break_and_continue() {
        let src = "Loop 5 i\n If $i == 2\n  Continue\n EndIf\n If $i == 4\n  Break\n EndIf\n Echo $i\nEndLoop\nEcho end";
        assert_eq!(out(src), vec!["1", "3", "end"]);
    }

    #[test]
    fn skip_to_label() {
        assert_eq!(out("Loop 3\n SkipTo out\n Echo no\nEndLoop\nout:\nEcho yes"), vec!["yes"]);
        assert!(run("SkipTo inner\nIf 1\ninner:\nEndIf").unwrap_err().contains("into a block"));
        assert!(run("back:\nSkipTo back").unwrap_err().contains("not found"));
    }

    #[test]
    fn functions_and_locals() {
        let src = "\
CallFunction Add 2 3
Echo $repVal1
Echo $a
Function Add 2 0 a b
  Return ($a + $b)
EndFunction";
        // Return values are reports; the argument `a` is invisible afterwards.
        let e = run(src).unwrap_err();
        assert!(e.contains("undefined variable $a"), "{e}");
        assert_eq!(out(&src.replace("Echo $a\n", "")), vec!["5"]);
    }

    #[test]
    fn recursion_rejected() {
        let e = run("CallFunction F\nFunction F\n CallFunction F\nEndFunction").unwrap_err();
        assert!(e.contains("re-entrant"), "{e}");
    }

    #[test]
    fn string_argument_function() {
        let src = "CallFunction Say 1 hello there world\nFunction Say 1 1 n text\n Echo $n: $text\nEndFunction";
        assert_eq!(out(src), vec!["1: hello there world"]);
    }

    #[test]
    fn call_script_and_return() {
        let mut lib = ScriptLibrary::new();
        lib.load_source("f", "Script A\nCallScript B\nEcho back $repVal2\nScript B\nEcho in B\nReturn 1 2").unwrap();
        let mut it = Interpreter::new(lib, CommandTable::builtin(), &EngineConfig::default());
        it.start("A").unwrap();
        while it.step(&mut NoOperations).unwrap() != Step::Finished {}
        assert_eq!(it.take_output(), vec!["in B", "back 2"]);
        assert_eq!(it.call_depth(), 0);
    }

    #[test]
    fn assignments() {
        let src = "\
a = 1 + 2 * 3
b @= some text here
c = 4 (2 * 3) x
c[2] = 9
d = $c[2] / 2
Echo $a $b $#c $c $d";
        assert_eq!(out(src), vec!["7 some text here 3 4 9 x 4.5"]);
        assert!(run("x = 3 +").is_err());
        assert!(run("x =").is_err());
    }

    #[test]
    fn persistent_vars_survive_restart() {
        let mut it = interp("p := 1\nr = 2");
        while it.step(&mut NoOperations).unwrap() != Step::Finished {}
        it.start("main").unwrap();
        assert!(it.variables().contains("p"));
        assert!(!it.variables().contains("r"));
    }

    #[test]
    fn keyword_guard() {
        let e = run("k @= EndLoop\n$k").unwrap_err();
        assert!(e.contains("reserved keyword"), "{e}");
        assert!(run("\"If\" 1").unwrap_err().contains("literally"));
    }

    #[test]
    fn call_string_array() {
        let src = "lines = \"Echo one\" \"Echo two\"\nCallStringArray lines\nEcho three";
        assert_eq!(out(src), vec!["one", "two", "three"]);
    }

    #[test]
    fn string_array_scripts_are_released_on_return() {
        let mut it = interp("lines = \"n = $$n + 1\"\nn = 0\nLoop 500\n CallStringArray lines\nEndLoop\nPause\nEcho $n");
        let paused = loop {
            match it.step(&mut NoOperations).unwrap() {
                Step::Pause(msg) => break msg,
                Step::Finished => panic!("should pause first"),
                _ => {}
            }
        };
        assert_eq!(paused, "Pause");
        assert_eq!(it.library().script_count(), 1);
        assert_eq!(it.variables().get("n").as_deref(), Some("500"));
    }

    #[test]
    fn error_in_string_array_script_is_caught_by_caller() {
        let src = "lines = \"Echo inner\" \"Throw deep\"\nTry\n CallStringArray lines\nCatch\n Echo caught $repVal1\nEndTry\nEcho end";
        let mut it = interp(src);
        let mut done = false;
        for _ in 0..100 {
            if it.step(&mut NoOperations).unwrap() == Step::Finished {
                done = true;
                break;
            }
            assert!(it.library().script_count() <= 2);
        }
        assert!(done);
        assert_eq!(it.take_output(), vec!["inner", "caught deep", "end"]);
    }

    #[test]
    fn argument_binding_error_is_caught_at_call_site() {
        let src = "\
Script Main
Try
  CallFunction Lib::Show 5
Catch
  Echo caught $repVal1
EndTry
Echo end
Script Lib
Function Show 1 0 n
  Echo $n
EndFunction";
        let mut lib = ScriptLibrary::new();
        lib.load_source("main", src).unwrap();
        let f = lib.find_function("Lib::Show", 0).unwrap();
        lib.function_mut(f).arg_names[0] = "9bad".into();
        let mut it = Interpreter::new(lib, CommandTable::builtin(), &EngineConfig::default());
        it.start("Main").unwrap();
        let mut seen = Vec::new();
        loop {
            match it.step(&mut NoOperations) {
                Ok(Step::Finished) => break,
                Ok(_) => assert!(it.call_depth() <= 1),
                Err(e) => panic!("escaped the Try: {e}"),
            }
            seen.extend(it.take_output());
        }
        seen.extend(it.take_output());
        assert_eq!(seen, vec!["caught illegal variable name '9bad'", "end"]);
    }

    #[test]
    fn exit_and_repeat() {
        assert_eq!(out("Echo a\nExit bye\nEcho b"), vec!["a", "bye"]);
        let src = "IsVariableDefined n\nIf $repVal1 == 0\n n = 0\nEndIf\nn = $n + 1\nIf $n < 3\n Repeat\nEndIf\nEcho $n";
        assert_eq!(out(src), vec!["3"]);
    }

    #[test]
    fn unknown_command_and_min_args() {
        assert!(run("Frobnicate").unwrap_err().contains("unknown command"));
        assert!(run("SetVariable x").unwrap_err().contains("at least 2"));
    }

    #[test]
    fn block_depth_limit_is_fatal() {
        let mut lib = ScriptLibrary::new();
        lib.load_source("m", "Loop 1\nLoop 1\nLoop 1\nEndLoop\nEndLoop\nEndLoop").unwrap();
        let config = EngineConfig { max_block_depth: 2, ..EngineConfig::default() };
        let mut it = Interpreter::new(lib, CommandTable::builtin(), &config);
        it.start("m").unwrap();
        let err = loop {
            match it.step(&mut NoOperations) {
                Ok(Step::Finished) => panic!("should fail"),
                Ok(_) => {}
                Err(e) => break e,
            }
        };
        assert!(matches!(err, ScriptError::FatalInternal { .. }));
        assert_eq!(err.line().map(|l| l.number), Some(3));
    }

    #[test]
    fn dispatch_text_rejects_control() {
        let mut it = interp("Echo x");
        assert!(it.dispatch_text("Loop 3", &mut NoOperations).is_err());
        assert_eq!(it.dispatch_text("Echo hi", &mut NoOperations).unwrap(), Step::Continue { no_yield: true });
        assert_eq!(it.take_output(), vec!["hi"]);
    }
}
