//! The generic parse tree handed from the parser to the compiler.
//!
//! The tree deliberately stays close to the surface grammar: rule nodes
//! tagged with a [`RuleKind`] and typed argument leaves. The compiler owns
//! the opcode dispatch and the argument-to-value conversion.

use crate::token::Span;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    Start,
    Macro,
    Procedure,
    Body,
    Instruction,
    Conditional,
    NegConditional,

    // One rule per instruction form, tagged by opcode name.
    Call,
    Click,
    DoubleClick,
    Find,
    Jump,
    Label,
    Pause,
    Pclick,
    Pfind,
    Return,
    Wait,
}

impl RuleKind {
    pub fn name(&self) -> &'static str {
        match self {
            RuleKind::Start => "start",
            RuleKind::Macro => "macro",
            RuleKind::Procedure => "procedure",
            RuleKind::Body => "body",
            RuleKind::Instruction => "instruction",
            RuleKind::Conditional => "conditional",
            RuleKind::NegConditional => "neg_conditional",
            RuleKind::Call => "call",
            RuleKind::Click => "click",
            RuleKind::DoubleClick => "double_click",
            RuleKind::Find => "find",
            RuleKind::Jump => "jump",
            RuleKind::Label => "label",
            RuleKind::Pause => "pause",
            RuleKind::Pclick => "pclick",
            RuleKind::Pfind => "pfind",
            RuleKind::Return => "return",
            RuleKind::Wait => "wait",
        }
    }
}

/// Argument token kinds as the grammar types them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    Name,
    File,
    Coords,
    Time,
}

/// A typed argument leaf carrying the raw lexeme, e.g. `("42m", Time)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Arg {
    pub kind: ArgKind,
    pub text: String,
    pub span: Span,
}

impl Arg {
    pub fn new(kind: ArgKind, text: impl Into<String>, span: Span) -> Self {
        Self {
            kind,
            text: text.into(),
            span,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Rule(Tree),
    Token(Arg),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tree {
    pub kind: RuleKind,
    pub children: Vec<Node>,
}

impl Tree {
    pub fn new(kind: RuleKind, children: Vec<Node>) -> Self {
        Self { kind, children }
    }
}
