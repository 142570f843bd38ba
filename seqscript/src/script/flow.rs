//! Control-flow stack and the bracket-aware forward scan.
//!
//! Each open `Loop`/`DoLoop`, `If` and `Try` is a [`Block`] on the
//! [`ControlStack`].  Blocks are popped by their terminator, by `Break`,
//! `SkipTo`, `Return`, an unwinding throw or an abort.  Call frames record
//! the stack height at entry so a return pops exactly the blocks opened
//! inside the call.

use super::reader::{Keyword, ScriptBuffer};

// ── Blocks ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct LoopState {
    /// Index of the `Loop`/`DoLoop` line; the body starts after it.
    pub start_line: usize,
    pub counter: i64,
    pub limit: i64,
    pub increment: i64,
    pub index_var: Option<String>,
}

impl LoopState {
    /// `true` once the counter has moved past the limit in the direction
    /// of the increment.
    pub fn exhausted(&self) -> bool {
        if self.increment > 0 {
            self.counter > self.limit
        } else {
            self.counter < self.limit
        }
    }

    /// Number of times a loop with these bounds runs its body.
    pub fn trip_count(start: i64, limit: i64, increment: i64) -> i64 {
        debug_assert!(increment != 0);
        let (a, b) = (i128::from(limit) - i128::from(start), i128::from(increment));
        let mut span = a / b;
        if a % b != 0 && (a < 0) != (b < 0) {
            span -= 1;
        }
        i64::try_from((span + 1).max(0)).unwrap_or(i64::MAX)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BlockKind {
    Loop(LoopState),
    /// `taken` is set once a branch of the If chain has executed.
    If { taken: bool },
    /// `catching` is set once control is inside the `Catch` section.
    Try { catching: bool },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub kind: BlockKind,
    /// Line that opened the block.
    pub line: usize,
}

impl Block {
    pub fn is_loop(&self) -> bool {
        matches!(self.kind, BlockKind::Loop(_))
    }

    pub fn keyword_name(&self) -> &'static str {
        match self.kind {
            BlockKind::Loop(_) => "Loop",
            BlockKind::If { .. } => "If",
            BlockKind::Try { .. } => "Try",
        }
    }
}

// ── ControlStack ──────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct ControlStack {
    blocks: Vec<Block>,
    max_depth: usize,
    try_nesting: usize,
}

impl ControlStack {
    pub fn new(max_depth: usize) -> Self {
        ControlStack { blocks: Vec::new(), max_depth, try_nesting: 0 }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Open `Try` blocks that are not yet in their `Catch` section.
    pub fn try_nesting(&self) -> usize {
        self.try_nesting
    }

    /// Push a block; fails when the depth limit would be exceeded.
    pub fn push(&mut self, block: Block) -> Result<usize, String> {
        if self.blocks.len() >= self.max_depth {
            return Err(format!("blocks nested more than {} deep", self.max_depth));
        }
        if matches!(block.kind, BlockKind::Try { catching: false }) {
            self.try_nesting += 1;
        }
        self.blocks.push(block);
        Ok(self.blocks.len() - 1)
    }

    pub fn pop(&mut self) -> Option<Block> {
        let b = self.blocks.pop()?;
        if matches!(b.kind, BlockKind::Try { catching: false }) {
            self.try_nesting -= 1;
        }
        Some(b)
    }

    /// Pop blocks until only `height` remain.
    pub fn truncate(&mut self, height: usize) {
        while self.blocks.len() > height {
            self.pop();
        }
    }

    pub fn top(&self) -> Option<&Block> {
        self.blocks.last()
    }

    pub fn top_mut(&mut self) -> Option<&mut Block> {
        self.blocks.last_mut()
    }

    pub fn get(&self, i: usize) -> Option<&Block> {
        self.blocks.get(i)
    }

    /// Switch the Try block at `i` into its Catch section.
    pub fn enter_catch(&mut self, i: usize) {
        if let Some(Block { kind: BlockKind::Try { catching }, .. }) = self.blocks.get_mut(i) {
            if !*catching {
                *catching = true;
                self.try_nesting -= 1;
            }
        }
    }

    /// Position of the innermost loop at or above `floor`.
    pub fn innermost_loop(&self, floor: usize) -> Option<usize> {
        (floor..self.blocks.len()).rev().find(|&i| self.blocks[i].is_loop())
    }

    /// Position of the innermost Try, not yet catching, at or above `floor`.
    pub fn innermost_try(&self, floor: usize) -> Option<usize> {
        (floor..self.blocks.len())
            .rev()
            .find(|&i| matches!(self.blocks[i].kind, BlockKind::Try { catching: false }))
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
        self.try_nesting = 0;
    }
}

// ── Forward scan ──────────────────────────────────────────────────────────────

/// Where a forward scan stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanHit {
    pub line: usize,
    pub keyword: Keyword,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanError {
    /// A terminator that does not belong to the block being skipped.
    Mismatch { line: usize, found: Keyword },
    /// Reached `Function`, `EndFunction` or the end of the script.
    Unterminated,
}

impl ScanError {
    pub fn message(&self, wanted: &[Keyword]) -> String {
        let names: Vec<&str> = wanted.iter().map(|k| k.name()).collect();
        match self {
            ScanError::Mismatch { found, .. } => {
                format!("found {} while looking for {}", found.name(), names.join("/"))
            }
            ScanError::Unterminated => format!("no matching {} found", names.join("/")),
        }
    }
}

/// Scan forward from line `from` for one of `targets`, skipping over nested
/// blocks.  `depth` counts blocks already entered beyond the one being
/// skipped (e.g. those popped by a `Break`).
///
/// Openers raise the depth; a terminator at depth 0 must be a target, while
/// deeper terminators lower the depth.  Middle keywords (`ElseIf`, `Else`,
/// `Catch`) only match at depth 0.
pub fn scan_forward(
    buffer: &ScriptBuffer,
    from: usize,
    mut depth: usize,
    targets: &[Keyword],
) -> Result<ScanHit, ScanError> {
    for line in from..buffer.len() {
        let Some(k) = buffer.keyword(line) else {
            continue;
        };
        match k {
            Keyword::Function | Keyword::EndFunction => return Err(ScanError::Unterminated),
            k if k.opens_block() => depth += 1,
            k if k.closes_block() => {
                if depth == 0 {
                    if targets.contains(&k) {
                        return Ok(ScanHit { line, keyword: k });
                    }
                    return Err(ScanError::Mismatch { line, found: k });
                }
                depth -= 1;
            }
            Keyword::ElseIf | Keyword::Else | Keyword::Catch if depth == 0 => {
                if targets.contains(&k) {
                    return Ok(ScanHit { line, keyword: k });
                }
            }
            _ => {}
        }
    }
    Err(ScanError::Unterminated)
}

/// Matching terminator for a block opened by `k`.
pub fn terminator(k: Keyword) -> Option<Keyword> {
    match k {
        Keyword::If => Some(Keyword::EndIf),
        Keyword::Loop | Keyword::DoLoop => Some(Keyword::EndLoop),
        Keyword::Try => Some(Keyword::EndTry),
        _ => None,
    }
}

/// Validate block nesting of lines `start..end` of `buffer` and report the
/// first problem as `(line, message)`.
pub fn check_nesting(buffer: &ScriptBuffer, start: usize, end: usize) -> Result<(), (usize, String)> {
    let mut open: Vec<(Keyword, usize)> = Vec::new();
    for line in start..end {
        let Some(k) = buffer.keyword(line) else {
            continue;
        };
        if k.opens_block() {
            open.push((k, line));
            continue;
        }
        let inside = |want: Keyword, open: &[(Keyword, usize)]| {
            open.last().is_some_and(|(o, _)| terminator(*o) == Some(want))
        };
        match k {
            Keyword::EndIf | Keyword::EndLoop | Keyword::EndTry => {
                if !inside(k, &open) {
                    return Err((line, format!("{} without a matching opener", k.name())));
                }
                open.pop();
            }
            Keyword::ElseIf | Keyword::Else if !inside(Keyword::EndIf, &open) => {
                return Err((line, format!("{} outside an If block", k.name())));
            }
            Keyword::Catch if !inside(Keyword::EndTry, &open) => {
                return Err((line, "Catch outside a Try block".into()));
            }
            _ => {}
        }
    }
    match open.last() {
        Some((k, line)) => Err((*line, format!("{} is never closed", k.name()))),
        None => Ok(()),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn buf(src: &str) -> ScriptBuffer {
        ScriptBuffer::new("t", src).unwrap()
    }

    #[test]
    fn scan_skips_nested_blocks() {
        let b = buf("If 0\n If 1\n  Echo a\n Else\n  Echo b\n EndIf\n Loop 2\n EndLoop\nElse\nEndIf");
        let hit = scan_forward(&b, 1, 0, &[Keyword::ElseIf, Keyword::Else, Keyword::EndIf]).unwrap();
        assert_eq!(hit, ScanHit { line: 8, keyword: Keyword::Else });
        let hit = scan_forward(&b, 9, 0, &[Keyword::EndIf]).unwrap();
        assert_eq!(hit.line, 9);
    }

    #[test]
    fn scan_with_initial_depth() {
        // From inside an If inside a loop, a Break skips the If's EndIf first.
        let b = buf("Loop 3\n If 1\n  Break\n EndIf\nEndLoop");
        let hit = scan_forward(&b, 3, 1, &[Keyword::EndLoop]).unwrap();
        assert_eq!(hit.line, 4);
    }

    #[test]
    fn scan_mismatch_and_unterminated() {
        let b = buf("If 0\n Echo x\nEndLoop");
        assert_eq!(
            scan_forward(&b, 1, 0, &[Keyword::EndIf]),
            Err(ScanError::Mismatch { line: 2, found: Keyword::EndLoop })
        );
        let b = buf("If 0\nEcho x\nFunction f\nEndIf");
        assert_eq!(scan_forward(&b, 1, 0, &[Keyword::EndIf]), Err(ScanError::Unterminated));
    }

    #[test]
    fn trip_counts() {
        assert_eq!(LoopState::trip_count(1, 3, 1), 3);
        assert_eq!(LoopState::trip_count(3, 1, -1), 3);
        assert_eq!(LoopState::trip_count(1, 10, 4), 3);
        assert_eq!(LoopState::trip_count(5, 1, 1), 0);
        assert_eq!(LoopState::trip_count(1, 1, -1), 1);
        assert_eq!(LoopState::trip_count(1, -2, -2), 2);
        assert_eq!(LoopState::trip_count(1, i64::MAX, i64::MAX), 1);
        assert_eq!(LoopState::trip_count(i64::MIN, i64::MAX, 1), i64::MAX);
        assert_eq!(LoopState::trip_count(i64::MAX, i64::MIN, -1), i64::MAX);
    }

    #[test]
    fn try_nesting_tracks_catch() {
        let mut s = ControlStack::new(4);
        s.push(Block { kind: BlockKind::Try { catching: false }, line: 0 }).unwrap();
        let i = s.push(Block { kind: BlockKind::Try { catching: false }, line: 1 }).unwrap();
        assert_eq!(s.try_nesting(), 2);
        s.enter_catch(i);
        assert_eq!(s.try_nesting(), 1);
        assert_eq!(s.innermost_try(0), Some(0));
        s.truncate(0);
        assert_eq!(s.try_nesting(), 0);
    }

    #[test]
    fn depth_limit() {
        let mut s = ControlStack::new(2);
        for line in 0..2 {
            s.push(Block { kind: BlockKind::If { taken: true }, line }).unwrap();
        }
        assert!(s.push(Block { kind: BlockKind::If { taken: true }, line: 2 }).is_err());
    }

    #[test]
    fn nesting_check() {
        assert!(check_nesting(&buf("If 1\nLoop 2\nEndLoop\nElse\nEndIf"), 0, 5).is_ok());
        assert_eq!(check_nesting(&buf("If 1\nLoop 2\nEndIf"), 0, 3).unwrap_err().0, 2);
        assert_eq!(check_nesting(&buf("Try\nEcho"), 0, 2).unwrap_err().0, 0);
        assert!(check_nesting(&buf("Loop 2\nCatch\nEndLoop"), 0, 3).is_err());
    }
}
