use thiserror::Error;

use crate::ast::{Arg, ArgKind, Node, RuleKind, Tree};
use crate::token::{Span, Token, TokenKind};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Invalid syntax on line {line}: expected {expected}, got {found}")]
    Syntax {
        line: usize,
        expected: String,
        found: String,
    },
}

pub fn parse_tokens(mut tokens: Vec<Token<'_>>) -> Result<Tree, ParseError> {
    // The parser indexes relative to a trailing Eof sentinel; supply one
    // if the caller's stream lacks it.
    if !matches!(tokens.last().map(|token| token.kind), Some(TokenKind::Eof)) {
        tokens.push(Token::new(TokenKind::Eof, Span::default()));
    }
    Parser::new(tokens).parse_start()
}

struct Parser<'a> {
    tokens: Vec<Token<'a>>,
    position: usize,
}

impl<'a> Parser<'a> {
    fn new(tokens: Vec<Token<'a>>) -> Self {
        Self {
            tokens,
            position: 0,
        }
    }

    /// `start := (macro | procedure)*`
    ///
    /// An input without a single macro is syntactically fine; the compiler
    /// rejects it so that "at least one macro" has one home.
    fn parse_start(mut self) -> Result<Tree, ParseError> {
        let mut units = Vec::new();
        while !matches!(self.current().kind, TokenKind::Eof) {
            units.push(Node::Rule(self.parse_unit()?));
        }
        Ok(Tree::new(RuleKind::Start, units))
    }

    fn parse_unit(&mut self) -> Result<Tree, ParseError> {
        let kind = match self.current().kind {
            TokenKind::Ident("MACRO") => RuleKind::Macro,
            TokenKind::Ident("PROC") => RuleKind::Procedure,
            _ => return Err(self.error("'MACRO' or 'PROC'")),
        };
        self.advance();

        let name = self.expect_name()?;
        let body = self.parse_body()?;
        Ok(Tree::new(kind, vec![Node::Token(name), Node::Rule(body)]))
    }

    fn parse_body(&mut self) -> Result<Tree, ParseError> {
        self.expect_lbrace()?;
        let mut items = Vec::new();
        loop {
            match self.current().kind {
                TokenKind::RBrace => {
                    self.advance();
                    return Ok(Tree::new(RuleKind::Body, items));
                }
                TokenKind::Eof => return Err(self.error("'}'")),
                _ => items.push(Node::Rule(self.parse_item()?)),
            }
        }
    }

    fn parse_item(&mut self) -> Result<Tree, ParseError> {
        if matches!(self.current().kind, TokenKind::Ident("IF")) {
            return self.parse_conditional();
        }
        let instruction = self.parse_instruction()?;
        Ok(Tree::new(
            RuleKind::Instruction,
            vec![Node::Rule(instruction)],
        ))
    }

    /// `conditional := "IF" ["NOT"] (find | pfind) body ("ELSE" body)?`
    fn parse_conditional(&mut self) -> Result<Tree, ParseError> {
        self.expect_keyword("IF")?;
        let negate = self.eat_keyword("NOT");

        let condition = match self.current().kind {
            TokenKind::Ident("FIND") => self.parse_find(RuleKind::Find)?,
            TokenKind::Ident("PFIND") => self.parse_find(RuleKind::Pfind)?,
            _ => return Err(self.error("'FIND' or 'PFIND'")),
        };

        let mut children = vec![Node::Rule(condition), Node::Rule(self.parse_body()?)];
        if self.eat_keyword("ELSE") {
            children.push(Node::Rule(self.parse_body()?));
        }

        let kind = if negate {
            RuleKind::NegConditional
        } else {
            RuleKind::Conditional
        };
        Ok(Tree::new(kind, children))
    }

    fn parse_instruction(&mut self) -> Result<Tree, ParseError> {
        let keyword = match self.current().kind {
            TokenKind::Ident(word) => word,
            _ => return Err(self.error("an instruction")),
        };

        match keyword {
            "CALL" => {
                self.advance();
                let target = self.expect_name()?;
                Ok(Tree::new(RuleKind::Call, vec![Node::Token(target)]))
            }
            "CLICK" => self.parse_click(RuleKind::Click),
            "DOUBLE_CLICK" => self.parse_click(RuleKind::DoubleClick),
            "PCLICK" => self.parse_click(RuleKind::Pclick),
            "FIND" => self.parse_find(RuleKind::Find),
            "PFIND" => self.parse_find(RuleKind::Pfind),
            "JUMP" => {
                self.advance();
                self.expect_keyword("TO")?;
                let target = self.expect_name()?;
                Ok(Tree::new(RuleKind::Jump, vec![Node::Token(target)]))
            }
            "LABEL" => {
                self.advance();
                let name = self.expect_name()?;
                Ok(Tree::new(RuleKind::Label, vec![Node::Token(name)]))
            }
            "PAUSE" => {
                self.advance();
                Ok(Tree::new(RuleKind::Pause, Vec::new()))
            }
            "RETURN" => {
                self.advance();
                Ok(Tree::new(RuleKind::Return, Vec::new()))
            }
            "WAIT" => {
                self.advance();
                let duration = self.expect_duration()?;
                Ok(Tree::new(RuleKind::Wait, vec![Node::Token(duration)]))
            }
            _ => Err(self.error("an instruction")),
        }
    }

    /// `click := OP coords | OP "ON" file "WITHIN" duration`
    fn parse_click(&mut self, kind: RuleKind) -> Result<Tree, ParseError> {
        self.advance();
        if matches!(self.current().kind, TokenKind::Int(_)) {
            let coords = self.parse_coords()?;
            return Ok(Tree::new(kind, vec![Node::Token(coords)]));
        }

        self.expect_keyword("ON")?;
        let file = self.expect_file()?;
        self.expect_keyword("WITHIN")?;
        let duration = self.expect_duration()?;
        Ok(Tree::new(
            kind,
            vec![Node::Token(file), Node::Token(duration)],
        ))
    }

    /// `find := OP file "WITHIN" duration`
    fn parse_find(&mut self, kind: RuleKind) -> Result<Tree, ParseError> {
        self.advance();
        let file = self.expect_file()?;
        self.expect_keyword("WITHIN")?;
        let duration = self.expect_duration()?;
        Ok(Tree::new(
            kind,
            vec![Node::Token(file), Node::Token(duration)],
        ))
    }

    fn parse_coords(&mut self) -> Result<Arg, ParseError> {
        let (x, span) = self.expect_int()?;
        self.expect_comma()?;
        let (y, _) = self.expect_int()?;
        Ok(Arg::new(ArgKind::Coords, format!("{x},{y}"), span))
    }

    fn current(&self) -> &Token<'a> {
        // The token stream always ends with Eof.
        &self.tokens[self.position.min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) {
        if self.position < self.tokens.len() - 1 {
            self.position += 1;
        }
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if matches!(self.current().kind, TokenKind::Ident(word) if word == keyword) {
            self.advance();
            return true;
        }
        false
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<(), ParseError> {
        if self.eat_keyword(keyword) {
            return Ok(());
        }
        Err(self.error(format!("'{keyword}'")))
    }

    fn expect_name(&mut self) -> Result<Arg, ParseError> {
        match self.current().kind {
            TokenKind::Ident(name) => {
                let span = self.current().span;
                self.advance();
                Ok(Arg::new(ArgKind::Name, name, span))
            }
            _ => Err(self.error("a name")),
        }
    }

    fn expect_file(&mut self) -> Result<Arg, ParseError> {
        match self.current().kind {
            TokenKind::File(file) => {
                let span = self.current().span;
                self.advance();
                Ok(Arg::new(ArgKind::File, file, span))
            }
            _ => Err(self.error("an image file")),
        }
    }

    fn expect_duration(&mut self) -> Result<Arg, ParseError> {
        match self.current().kind {
            TokenKind::Duration(duration) => {
                let span = self.current().span;
                self.advance();
                Ok(Arg::new(ArgKind::Time, duration, span))
            }
            _ => Err(self.error("a duration such as '5s'")),
        }
    }

    fn expect_int(&mut self) -> Result<(&'a str, Span), ParseError> {
        match self.current().kind {
            TokenKind::Int(digits) => {
                let span = self.current().span;
                self.advance();
                Ok((digits, span))
            }
            _ => Err(self.error("a number")),
        }
    }

    fn expect_comma(&mut self) -> Result<(), ParseError> {
        if matches!(self.current().kind, TokenKind::Comma) {
            self.advance();
            return Ok(());
        }
        Err(self.error("','"))
    }

    fn expect_lbrace(&mut self) -> Result<(), ParseError> {
        if matches!(self.current().kind, TokenKind::LBrace) {
            self.advance();
            return Ok(());
        }
        Err(self.error("'{'"))
    }

    fn error(&self, expected: impl Into<String>) -> ParseError {
        let token = self.current();
        let found = match token.kind {
            TokenKind::Ident(word) => format!("'{word}'"),
            TokenKind::File(file) => format!("file '{file}'"),
            TokenKind::Int(digits) => format!("'{digits}'"),
            TokenKind::Duration(duration) => format!("'{duration}'"),
            TokenKind::Comma => "','".to_string(),
            TokenKind::LBrace => "'{'".to_string(),
            TokenKind::RBrace => "'}'".to_string(),
            TokenKind::Eof => "end of input".to_string(),
        };
        ParseError::Syntax {
            line: token.span.line,
            expected: expected.into(),
            found,
        }
    }
}
