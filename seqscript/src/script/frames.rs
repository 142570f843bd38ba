//! Call stack: one frame per active script or function call.

/// One activation record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallFrame {
    /// Script being executed in this frame.
    pub script: usize,
    /// Index into the library's function table, for function calls.
    pub function: Option<usize>,
    /// Caller's script and the line to resume at after returning.
    pub return_to: Option<(usize, usize)>,
    /// Control-flow stack height at entry; blocks above it belong to this frame.
    pub block_mark: usize,
}

impl CallFrame {
    pub fn top_level(script: usize) -> Self {
        CallFrame { script, function: None, return_to: None, block_mark: 0 }
    }
}

#[derive(Debug)]
pub struct CallStack {
    frames: Vec<CallFrame>,
    max_depth: usize,
}

impl CallStack {
    pub fn new(max_depth: usize) -> Self {
        CallStack { frames: Vec::new(), max_depth }
    }

    /// Number of frames; the top-level script is depth 1.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn push(&mut self, frame: CallFrame) -> Result<(), String> {
        if self.frames.len() >= self.max_depth {
            return Err(format!("calls nested more than {} deep", self.max_depth));
        }
        self.frames.push(frame);
        Ok(())
    }

    pub fn pop(&mut self) -> Option<CallFrame> {
        self.frames.pop()
    }

    pub fn top(&self) -> Option<&CallFrame> {
        self.frames.last()
    }

    /// `true` if any frame is executing `script`.
    pub fn runs_script(&self, script: usize) -> bool {
        self.frames.iter().any(|fr| fr.script == script)
    }

    /// `true` if function `f` is already running somewhere on the stack.
    pub fn is_active(&self, f: usize) -> bool {
        self.frames.iter().any(|fr| fr.function == Some(f))
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &CallFrame> {
        self.frames.iter()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_active_function() {
        let mut stack = CallStack::new(4);
        stack.push(CallFrame::top_level(0)).unwrap();
        stack
            .push(CallFrame { script: 0, function: Some(2), return_to: Some((0, 5)), block_mark: 1 })
            .unwrap();
        assert!(stack.is_active(2));
        assert!(!stack.is_active(1));
        stack.pop();
        assert!(!stack.is_active(2));
        assert_eq!(stack.depth(), 1);
    }

    #[test]
    fn depth_limit() {
        let mut stack = CallStack::new(1);
        stack.push(CallFrame::top_level(0)).unwrap();
        assert!(stack.push(CallFrame::top_level(1)).is_err());
        assert_eq!(stack.depth(), 1);
    }
}
