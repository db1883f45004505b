//! The instruction set and label table shared by the compiler and the VM.

use std::collections::HashMap;
use std::fmt;

/// Closed opcode enumeration. `End` and `If` are only ever synthesized by
/// the compiler; the rest map 1:1 to surface instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Call,
    Click,
    DoubleClick,
    End,
    Find,
    If,
    Jump,
    Label,
    Pause,
    Pclick,
    Pfind,
    Return,
    Wait,
}

impl Opcode {
    /// FIND-family opcodes are the only valid conditional conditions.
    pub fn is_find(&self) -> bool {
        matches!(self, Opcode::Find | Opcode::Pfind)
    }

    /// Precise variants force an exact image match (color, step 1).
    pub fn is_precise(&self) -> bool {
        matches!(self, Opcode::Pclick | Opcode::Pfind)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Opcode::Call => "CALL",
            Opcode::Click => "CLICK",
            Opcode::DoubleClick => "DOUBLE_CLICK",
            Opcode::End => "END",
            Opcode::Find => "FIND",
            Opcode::If => "IF",
            Opcode::Jump => "JUMP",
            Opcode::Label => "LABEL",
            Opcode::Pause => "PAUSE",
            Opcode::Pclick => "PCLICK",
            Opcode::Pfind => "PFIND",
            Opcode::Return => "RETURN",
            Opcode::Wait => "WAIT",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    None,
    /// A label name: CALL/JUMP/LABEL targets.
    Name(String),
    /// A literal screen position.
    Coords(i32, i32),
    /// A wait duration, already normalized to seconds.
    Seconds(u64),
    /// An image search: path plus its timeout.
    Image { path: String, timeout_secs: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub opcode: Opcode,
    pub operand: Operand,
}

impl Command {
    pub fn new(opcode: Opcode, operand: Operand) -> Self {
        Self { opcode, operand }
    }

    pub fn bare(opcode: Opcode) -> Self {
        Self::new(opcode, Operand::None)
    }

    pub fn label(name: impl Into<String>) -> Self {
        Self::new(Opcode::Label, Operand::Name(name.into()))
    }
}

/// An `IF [NOT] <find> { … } [ELSE { … }]` lowered to branch targets.
/// The body follows immediately after this record in the instruction
/// array; `else_label`/`end_label` name where a failed condition lands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conditional {
    pub condition: Command,
    pub negate: bool,
    pub end_label: String,
    pub else_label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    Command(Command),
    Conditional(Conditional),
}

/// A compiled program: one flat instruction array shared by every macro
/// and procedure, plus the label table addressing into it. Immutable
/// once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Program {
    pub instructions: Vec<Instruction>,
    pub labels: HashMap<String, usize>,
}

impl Program {
    /// Start index for a macro name, if it is defined.
    pub fn entry(&self, name: &str) -> Option<usize> {
        self.labels.get(name).copied()
    }
}
