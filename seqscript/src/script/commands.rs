//! The Command Table.
//!
//! Every command is a [`CommandSpec`]: name, minimum argument count, flag
//! bits and what kind of handler runs it.  Built-in commands come from a
//! static declarative list; the host adds its external operations through
//! [`CommandTableBuilder`] and then freezes the table.
//!
//! Lookup hashes the uppercased name.  A hash shared by two names maps to a
//! collision sentinel, and those names are resolved by a linear scan.

use std::collections::HashMap;
use std::fmt;

use super::reader::Keyword;

// ── Flags ─────────────────────────────────────────────────────────────────────

/// Behaviour flags of a command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CommandFlags(u8);

impl CommandFlags {
    pub const NONE: CommandFlags = CommandFlags(0);
    /// Parenthesised groups in the arguments are evaluated as arithmetic.
    pub const ARITH: CommandFlags = CommandFlags(1);
    /// The scheduler may run the next line without yielding to the host.
    pub const NO_YIELD: CommandFlags = CommandFlags(2);
    /// The handler takes the raw text after the command name.
    pub const RAW_TEXT: CommandFlags = CommandFlags(4);

    pub const fn union(self, other: CommandFlags) -> CommandFlags {
        CommandFlags(self.0 | other.0)
    }

    pub const fn contains(self, other: CommandFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for CommandFlags {
    type Output = CommandFlags;
    fn bitor(self, rhs: CommandFlags) -> CommandFlags {
        self.union(rhs)
    }
}

// ── Command kinds ─────────────────────────────────────────────────────────────

/// Built-in command handlers, implemented in [`super::builtins`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Builtin {
    Echo,
    EchoEval,
    SetVariable,
    SetPersistentVar,
    LocalVar,
    ClearPersistentVars,
    IsVariableDefined,
    NewArray,
    New2DArray,
    AppendToArray,
    AppendRowToArray,
    TruncateArray,
    ArrayStatistics,
    StringLength,
    Verbose,
    Delay,
    Pause,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Control(Keyword),
    Builtin(Builtin),
    /// Forwarded to the host's [`Operations`](super::ops::Operations).
    External,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub name: String,
    pub min_args: u8,
    pub flags: CommandFlags,
    pub kind: CommandKind,
}

/// Index of a command within a frozen table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandIndex(pub usize);

const F_NONE: CommandFlags = CommandFlags::NONE;
const F_FAST: CommandFlags = CommandFlags::NO_YIELD;
const F_ARITH_FAST: CommandFlags = CommandFlags::ARITH.union(CommandFlags::NO_YIELD);
const F_TEXT_FAST: CommandFlags = CommandFlags::RAW_TEXT.union(CommandFlags::NO_YIELD);

/// Minimum arguments for each control keyword.
fn control_min_args(k: Keyword) -> u8 {
    match k {
        Keyword::If | Keyword::ElseIf | Keyword::Loop | Keyword::SkipTo => 1,
        Keyword::Call
        | Keyword::CallScript
        | Keyword::CallMacro
        | Keyword::DoScript
        | Keyword::DoMacro
        | Keyword::CallFunction
        | Keyword::CallStringArray
        | Keyword::Function => 1,
        Keyword::DoLoop => 3,
        _ => 0,
    }
}

fn control_flags(k: Keyword) -> CommandFlags {
    match k {
        Keyword::DoLoop | Keyword::Loop | Keyword::Return | Keyword::CallFunction => F_ARITH_FAST,
        Keyword::Throw | Keyword::Exit => F_TEXT_FAST,
        Keyword::Repeat => F_NONE,
        _ => F_FAST,
    }
}

/// The built-in command list: (name, min args, flags, handler).
const BUILTINS: &[(&str, u8, CommandFlags, Builtin)] = &[
    ("Echo", 0, F_TEXT_FAST, Builtin::Echo),
    ("EchoEval", 0, F_ARITH_FAST, Builtin::EchoEval),
    ("SetVariable", 2, F_ARITH_FAST, Builtin::SetVariable),
    ("SetPersistentVar", 2, F_ARITH_FAST, Builtin::SetPersistentVar),
    ("LocalVar", 1, F_FAST, Builtin::LocalVar),
    ("ClearPersistentVars", 0, F_FAST, Builtin::ClearPersistentVars),
    ("IsVariableDefined", 1, F_FAST, Builtin::IsVariableDefined),
    ("NewArray", 1, F_ARITH_FAST, Builtin::NewArray),
    ("New2DArray", 1, F_FAST, Builtin::New2DArray),
    ("AppendToArray", 2, F_ARITH_FAST, Builtin::AppendToArray),
    ("AppendRowToArray", 2, F_ARITH_FAST, Builtin::AppendRowToArray),
    ("TruncateArray", 2, F_ARITH_FAST, Builtin::TruncateArray),
    ("ArrayStatistics", 1, F_FAST, Builtin::ArrayStatistics),
    ("StringLength", 0, F_TEXT_FAST, Builtin::StringLength),
    ("Verbose", 1, F_FAST, Builtin::Verbose),
    ("Delay", 1, F_ARITH_FAST, Builtin::Delay),
    ("Pause", 0, CommandFlags::RAW_TEXT, Builtin::Pause),
];

// ── Hashing ───────────────────────────────────────────────────────────────────

/// FNV-1a over the uppercased name.
pub fn name_hash(name: &str) -> u32 {
    let mut h: u32 = 0x811c_9dc5;
    for b in name.bytes() {
        h ^= u32::from(b.to_ascii_uppercase());
        h = h.wrapping_mul(0x0100_0193);
    }
    h
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    One(CommandIndex),
    /// Several names share this hash; scan for the right one.
    Collision,
}

// ── Table ─────────────────────────────────────────────────────────────────────

/// Immutable command registry.
pub struct CommandTable {
    specs: Vec<CommandSpec>,
    index: HashMap<u32, Slot>,
}

impl fmt::Debug for CommandTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandTable").field("commands", &self.specs.len()).finish()
    }
}

impl CommandTable {
    /// The table of control keywords and built-in commands only.
    pub fn builtin() -> CommandTable {
        CommandTableBuilder::new().build()
    }

    fn from_specs(specs: Vec<CommandSpec>, hash: fn(&str) -> u32) -> CommandTable {
        let mut index = HashMap::with_capacity(specs.len());
        for (i, spec) in specs.iter().enumerate() {
            index
                .entry(hash(&spec.name))
                .and_modify(|slot| *slot = Slot::Collision)
                .or_insert(Slot::One(CommandIndex(i)));
        }
        CommandTable { specs, index }
    }

    /// Case-insensitive lookup.
    pub fn lookup(&self, name: &str) -> Option<CommandIndex> {
        self.lookup_hashed(name, name_hash(name))
    }

    fn lookup_hashed(&self, name: &str, hash: u32) -> Option<CommandIndex> {
        match self.index.get(&hash)? {
            Slot::One(i) if self.specs[i.0].name.eq_ignore_ascii_case(name) => Some(*i),
            Slot::One(_) => None,
            Slot::Collision => self
                .specs
                .iter()
                .position(|s| s.name.eq_ignore_ascii_case(name))
                .map(CommandIndex),
        }
    }

    pub fn spec(&self, index: CommandIndex) -> &CommandSpec {
        &self.specs[index.0]
    }

    pub fn get(&self, name: &str) -> Option<&CommandSpec> {
        self.lookup(name).map(|i| self.spec(i))
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CommandSpec> {
        self.specs.iter()
    }
}

/// Collects external commands, then freezes the table.
#[derive(Debug)]
pub struct CommandTableBuilder {
    specs: Vec<CommandSpec>,
}

impl Default for CommandTableBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandTableBuilder {
    pub fn new() -> Self {
        let mut specs: Vec<CommandSpec> = Keyword::ALL
            .iter()
            .map(|&k| CommandSpec {
                name: k.name().to_owned(),
                min_args: control_min_args(k),
                flags: control_flags(k),
                kind: CommandKind::Control(k),
            })
            .collect();
        specs.extend(BUILTINS.iter().map(|&(name, min_args, flags, b)| CommandSpec {
            name: name.to_owned(),
            min_args,
            flags,
            kind: CommandKind::Builtin(b),
        }));
        CommandTableBuilder { specs }
    }

    /// Register an external operation.
    pub fn external(&mut self, name: &str, min_args: u8, flags: CommandFlags) -> Result<&mut Self, String> {
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(format!("illegal command name '{name}'"));
        }
        if self.specs.iter().any(|s| s.name.eq_ignore_ascii_case(name)) {
            return Err(format!("command {name} is already defined"));
        }
        self.specs.push(CommandSpec { name: name.to_owned(), min_args, flags, kind: CommandKind::External });
        Ok(self)
    }

    pub fn build(self) -> CommandTable {
        CommandTable::from_specs(self.specs, name_hash)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_case_insensitive() {
        let t = CommandTable::builtin();
        let i = t.lookup("echo").unwrap();
        assert_eq!(t.spec(i).kind, CommandKind::Builtin(Builtin::Echo));
        assert_eq!(t.lookup("ENDLOOP").map(|i| t.spec(i).kind), Some(CommandKind::Control(Keyword::EndLoop)));
        assert!(t.lookup("NoSuchCommand").is_none());
    }

    #[test]
    fn external_commands_registered() {
        let mut b = CommandTableBuilder::new();
        b.external("MoveStage", 2, CommandFlags::ARITH).unwrap();
        assert!(b.external("movestage", 0, CommandFlags::NONE).is_err());
        assert!(b.external("Echo", 0, CommandFlags::NONE).is_err());
        assert!(b.external("bad name", 0, CommandFlags::NONE).is_err());
        let t = b.build();
        let spec = t.get("MOVESTAGE").unwrap();
        assert_eq!(spec.min_args, 2);
        assert_eq!(spec.kind, CommandKind::External);
        assert!(spec.flags.contains(CommandFlags::ARITH));
        assert!(!spec.flags.contains(CommandFlags::NO_YIELD));
    }

    #[test]
    fn collisions_fall_back_to_scan() {
        // Force every name onto one hash bucket.
        let specs = CommandTableBuilder::new().specs;
        let n = specs.len();
        let t = CommandTable::from_specs(specs, |_| 7);
        assert_eq!(t.index.get(&7), Some(&Slot::Collision));
        assert_eq!(t.len(), n);
        let i = t.lookup_hashed("delay", 7).unwrap();
        assert_eq!(t.spec(i).name, "Delay");
        assert!(t.lookup_hashed("nothing", 7).is_none());
    }

    #[test]
    fn flags_compose() {
        let f = CommandFlags::ARITH | CommandFlags::RAW_TEXT;
        assert!(f.contains(CommandFlags::ARITH));
        assert!(f.contains(CommandFlags::RAW_TEXT));
        assert!(!f.contains(CommandFlags::NO_YIELD));
        assert!(CommandTable::builtin().get("Pause").is_some_and(|s| !s.flags.contains(CommandFlags::NO_YIELD)));
    }

    #[test]
    fn fnv_hash_is_case_folded() {
        assert_eq!(name_hash("Echo"), name_hash("ECHO"));
        assert_ne!(name_hash("Echo"), name_hash("Exit"));
    }
}
