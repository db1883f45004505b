#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub start: usize,
    pub end: usize,
    pub line: usize,
    pub column: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind<'a> {
    /// A bare name: keywords, opcodes and user labels all lex as idents.
    Ident(&'a str),
    /// An image file name with a `.png`/`.jpg`/`.jpeg` extension.
    File(&'a str),
    /// A run of digits, one half of a coordinate pair.
    Int(&'a str),
    /// Digits immediately followed by an `s`/`m`/`h` unit suffix.
    Duration(&'a str),

    Comma,
    LBrace,
    RBrace,

    Eof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token<'a> {
    pub kind: TokenKind<'a>,
    pub span: Span,
}

impl<'a> Token<'a> {
    pub fn new(kind: TokenKind<'a>, span: Span) -> Self {
        Self { kind, span }
    }

    pub fn kind(&self) -> &TokenKind<'a> {
        &self.kind
    }

    pub fn span(&self) -> Span {
        self.span
    }
}
