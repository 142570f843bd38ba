//! Script buffers, the line reader and the tokenizer.
//!
//! A [`ScriptBuffer`] is a line-addressable script body.  On construction
//! `/* … */` block comments (which may span lines) and `#` comment lines are
//! blanked out, so line indices always match the source, and every line is
//! classified once ([`LineKind`]) for the control-flow scans.
//!
//! Line forms:
//!
//! | Form | Example |
//! |------|---------|
//! | label | `retry:` |
//! | numeric assignment | `X = 3 * 4`, `X := 7` (persistent) |
//! | string assignment | `S @= some text`, `S :@= text` (persistent) |
//! | command | `MoveStage 10 -5` |

// ── Keywords ──────────────────────────────────────────────────────────────────

/// Control keywords.  These shape the block structure of a script, so a
/// command name produced by variable substitution may never be one of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Keyword {
    If,
    ElseIf,
    Else,
    EndIf,
    Loop,
    DoLoop,
    EndLoop,
    Break,
    Continue,
    Try,
    Catch,
    EndTry,
    Throw,
    SkipTo,
    Call,
    CallScript,
    CallMacro,
    DoScript,
    DoMacro,
    CallFunction,
    CallStringArray,
    Function,
    EndFunction,
    Return,
    Exit,
    Repeat,
}

impl Keyword {
    pub const ALL: [Keyword; 26] = [
        Keyword::If,
        Keyword::ElseIf,
        Keyword::Else,
        Keyword::EndIf,
        Keyword::Loop,
        Keyword::DoLoop,
        Keyword::EndLoop,
        Keyword::Break,
        Keyword::Continue,
        Keyword::Try,
        Keyword::Catch,
        Keyword::EndTry,
        Keyword::Throw,
        Keyword::SkipTo,
        Keyword::Call,
        Keyword::CallScript,
        Keyword::CallMacro,
        Keyword::DoScript,
        Keyword::DoMacro,
        Keyword::CallFunction,
        Keyword::CallStringArray,
        Keyword::Function,
        Keyword::EndFunction,
        Keyword::Return,
        Keyword::Exit,
        Keyword::Repeat,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Keyword::If => "If",
            Keyword::ElseIf => "ElseIf",
            Keyword::Else => "Else",
            Keyword::EndIf => "EndIf",
            Keyword::Loop => "Loop",
            Keyword::DoLoop => "DoLoop",
            Keyword::EndLoop => "EndLoop",
            Keyword::Break => "Break",
            Keyword::Continue => "Continue",
            Keyword::Try => "Try",
            Keyword::Catch => "Catch",
            Keyword::EndTry => "EndTry",
            Keyword::Throw => "Throw",
            Keyword::SkipTo => "SkipTo",
            Keyword::Call => "Call",
            Keyword::CallScript => "CallScript",
            Keyword::CallMacro => "CallMacro",
            Keyword::DoScript => "DoScript",
            Keyword::DoMacro => "DoMacro",
            Keyword::CallFunction => "CallFunction",
            Keyword::CallStringArray => "CallStringArray",
            Keyword::Function => "Function",
            Keyword::EndFunction => "EndFunction",
            Keyword::Return => "Return",
            Keyword::Exit => "Exit",
            Keyword::Repeat => "Repeat",
        }
    }

    /// Case-insensitive keyword lookup.
    pub fn from_token(token: &str) -> Option<Keyword> {
        Keyword::ALL
            .iter()
            .copied()
            .find(|k| k.name().eq_ignore_ascii_case(token))
    }

    /// Keywords that open a block closed by a matching terminator.
    pub fn opens_block(self) -> bool {
        matches!(self, Keyword::If | Keyword::Loop | Keyword::DoLoop | Keyword::Try)
    }

    pub fn closes_block(self) -> bool {
        matches!(self, Keyword::EndIf | Keyword::EndLoop | Keyword::EndTry)
    }
}

// ── Tokens ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub text: String,
    /// The token was written in double quotes; it is never a keyword or operator.
    pub quoted: bool,
}

impl Token {
    fn bare(text: &str) -> Self {
        Token { text: text.to_owned(), quoted: false }
    }
}

/// Split `s` into whitespace-delimited tokens, honouring double-quoted
/// substrings (quotes removed, `\"` escapes a quote inside them).
pub fn tokenize(s: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut cur = String::new();
    let mut in_quotes = false;
    let mut quoted = false;
    let mut chars = s.chars();

    while let Some(ch) = chars.next() {
        match ch {
            '"' if !in_quotes => {
                in_quotes = true;
                quoted = true;
            }
            '"' => in_quotes = false,
            '\\' if in_quotes => {
                if let Some(escaped) = chars.next() {
                    cur.push(escaped);
                }
            }
            c if c.is_whitespace() && !in_quotes => {
                if !cur.is_empty() || quoted {
                    tokens.push(Token { text: std::mem::take(&mut cur), quoted });
                    quoted = false;
                }
            }
            c => cur.push(c),
        }
    }
    if in_quotes {
        return Err("unterminated quoted string".into());
    }
    if !cur.is_empty() || quoted {
        tokens.push(Token { text: cur, quoted });
    }
    Ok(tokens)
}

/// Split off the first whitespace-delimited word of `s`, returning it and the
/// trimmed remainder.
pub fn split_first(s: &str) -> (&str, &str) {
    let s = s.trim();
    match s.find(char::is_whitespace) {
        Some(i) => (&s[..i], s[i..].trim()),
        None => (s, ""),
    }
}

// ── Assignment forms ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    /// `=`
    Numeric,
    /// `:=`
    NumericPersistent,
    /// `@=`
    Text,
    /// `:@=`
    TextPersistent,
}

impl AssignOp {
    pub fn from_token(tok: &str) -> Option<AssignOp> {
        match tok {
            "=" => Some(AssignOp::Numeric),
            ":=" => Some(AssignOp::NumericPersistent),
            "@=" => Some(AssignOp::Text),
            ":@=" => Some(AssignOp::TextPersistent),
            _ => None,
        }
    }

    pub fn is_persistent(self) -> bool {
        matches!(self, AssignOp::NumericPersistent | AssignOp::TextPersistent)
    }

    pub fn is_text(self) -> bool {
        matches!(self, AssignOp::Text | AssignOp::TextPersistent)
    }
}

// ── Line classification ───────────────────────────────────────────────────────

/// The syntactic form of one (comment-stripped) line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineKind {
    Blank,
    Label(String),
    Keyword(Keyword),
    Assignment,
    Command,
}

/// Classify a single line of text.
pub fn classify(text: &str) -> LineKind {
    let (first, rest) = split_first(text);
    if first.is_empty() {
        return LineKind::Blank;
    }
    let second = split_first(rest).0;
    if AssignOp::from_token(second).is_some() {
        return LineKind::Assignment;
    }
    if rest.is_empty() && first.len() > 1 {
        if let Some(label) = first.strip_suffix(':') {
            return LineKind::Label(label.to_owned());
        }
    }
    match Keyword::from_token(first) {
        Some(k) => LineKind::Keyword(k),
        None => LineKind::Command,
    }
}

/// One executable line handed out by [`next_line`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    /// 0-based index into the buffer.
    pub index: usize,
    pub text: String,
    pub form: LineForm,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineForm {
    Label(String),
    Assignment { target: String, op: AssignOp, rhs: String },
    Command { name: String, rest: String },
}

fn parse_form(text: &str) -> LineForm {
    let (first, rest) = split_first(text);
    let (second, tail) = split_first(rest);
    if let Some(op) = AssignOp::from_token(second) {
        return LineForm::Assignment { target: first.to_owned(), op, rhs: tail.to_owned() };
    }
    match classify(text) {
        LineKind::Label(l) => LineForm::Label(l),
        _ => LineForm::Command { name: first.to_owned(), rest: rest.to_owned() },
    }
}

// ── ScriptBuffer ──────────────────────────────────────────────────────────────

/// A named, line-addressable script body.
#[derive(Debug, Clone)]
pub struct ScriptBuffer {
    name: String,
    lines: Vec<String>,
    kinds: Vec<LineKind>,
}

impl ScriptBuffer {
    /// Build a buffer from source text, stripping comments.
    pub fn new(name: impl Into<String>, src: &str) -> Result<Self, (usize, String)> {
        let raw: Vec<&str> = src.lines().collect();
        Self::from_lines(name, &raw)
    }

    pub fn from_lines<S: AsRef<str>>(name: impl Into<String>, raw: &[S]) -> Result<Self, (usize, String)> {
        let lines = strip_comments(raw)?;
        let kinds = lines.iter().map(|l| classify(l)).collect();
        Ok(ScriptBuffer { name: name.into(), lines, kinds })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Comment-stripped, trimmed text of line `i`.
    pub fn text(&self, i: usize) -> Option<&str> {
        self.lines.get(i).map(String::as_str)
    }

    pub fn kind(&self, i: usize) -> Option<&LineKind> {
        self.kinds.get(i)
    }

    pub fn keyword(&self, i: usize) -> Option<Keyword> {
        match self.kinds.get(i) {
            Some(LineKind::Keyword(k)) => Some(*k),
            _ => None,
        }
    }
}

/// Blank out `/* … */` spans and `#` comment lines, keeping line numbering.
/// Quoted strings are respected within a line.
fn strip_comments<S: AsRef<str>>(raw: &[S]) -> Result<Vec<String>, (usize, String)> {
    let mut out = Vec::with_capacity(raw.len());
    let mut in_comment = false;
    let mut opened_at = 0;

    for (i, line) in raw.iter().enumerate() {
        let line = line.as_ref();
        if !in_comment && line.trim_start().starts_with('#') {
            out.push(String::new());
            continue;
        }
        let mut kept = String::with_capacity(line.len());
        let mut in_quotes = false;
        let mut chars = line.chars().peekable();
        while let Some(ch) = chars.next() {
            if in_comment {
                if ch == '*' && chars.peek() == Some(&'/') {
                    chars.next();
                    in_comment = false;
                    kept.push(' ');
                }
                continue;
            }
            match ch {
                '"' => {
                    in_quotes = !in_quotes;
                    kept.push(ch);
                }
                '/' if !in_quotes && chars.peek() == Some(&'*') => {
                    chars.next();
                    in_comment = true;
                    opened_at = i;
                }
                _ => kept.push(ch),
            }
        }
        out.push(kept.trim().to_owned());
    }
    if in_comment {
        return Err((opened_at, "unterminated /* comment".into()));
    }
    Ok(out)
}

/// Return the next non-blank line at or after `cursor`, with the cursor
/// positioned just past it.
pub fn next_line(buffer: &ScriptBuffer, cursor: usize) -> Option<(Line, usize)> {
    (cursor..buffer.len()).find_map(|i| {
        let text = buffer.text(i)?;
        if text.is_empty() {
            return None;
        }
        Some((Line { index: i, text: text.to_owned(), form: parse_form(text) }, i + 1))
    })
}

/// Parse a single free-standing line of text (not from a buffer).
pub fn parse_line(text: &str) -> Line {
    let text = text.trim();
    Line { index: 0, text: text.to_owned(), form: parse_form(text) }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
