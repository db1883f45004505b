use std::{iter::Peekable, str::CharIndices};

use anyhow::{Result, bail};

use crate::token::{Span, Token, TokenKind};

/// Characters that may appear inside a word. Words are later classified
/// into idents, integers, durations and file names.
fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/')
}

fn is_name(text: &str) -> bool {
    text.chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn is_image_file(text: &str) -> bool {
    let Some((stem, extension)) = text.rsplit_once('.') else {
        return false;
    };
    !stem.is_empty() && matches!(extension, "png" | "jpg" | "jpeg")
}

/// `50s`, `42m`, `12h` — digits plus a single unit suffix.
fn is_duration(text: &str) -> bool {
    let Some(number) = text.strip_suffix(['s', 'm', 'h']) else {
        return false;
    };
    !number.is_empty() && number.bytes().all(|b| b.is_ascii_digit())
}

pub struct Lexer<'a> {
    chars: Peekable<CharIndices<'a>>,
    input: &'a str,
    line: usize,
    column: usize,
    eof_reached: bool,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Self {
            chars: input.char_indices().peekable(),
            input,
            line: 1,
            column: 1,
            eof_reached: false,
        }
    }

    pub fn next_token(&mut self) -> Result<Token<'a>> {
        self.skip_trivia();

        let (start, ch) = match self.chars.peek().copied() {
            Some(pair) => pair,
            None => {
                self.eof_reached = true;
                let span = self.span(self.input.len(), self.input.len());
                return Ok(Token::new(TokenKind::Eof, span));
            }
        };

        if !ch.is_ascii() {
            bail!(
                "Invalid character on line {}, column {}: macro sources must be ASCII",
                self.line,
                self.column
            );
        }

        let single = match ch {
            ',' => Some(TokenKind::Comma),
            '{' => Some(TokenKind::LBrace),
            '}' => Some(TokenKind::RBrace),
            _ => None,
        };
        if let Some(kind) = single {
            let span = self.span(start, start + 1);
            self.advance();
            return Ok(Token::new(kind, span));
        }

        if !is_word_char(ch) {
            bail!(
                "Unexpected character '{}' on line {}, column {}",
                ch,
                self.line,
                self.column
            );
        }

        let span_line = self.line;
        let span_column = self.column;
        let mut end = start;
        while let Some(&(idx, c)) = self.chars.peek() {
            if !is_word_char(c) {
                break;
            }
            end = idx + c.len_utf8();
            self.advance();
        }

        let text = &self.input[start..end];
        let span = Span {
            start,
            end,
            line: span_line,
            column: span_column,
        };

        let kind = if text.bytes().all(|b| b.is_ascii_digit()) {
            TokenKind::Int(text)
        } else if is_duration(text) {
            TokenKind::Duration(text)
        } else if is_image_file(text) {
            TokenKind::File(text)
        } else if is_name(text) {
            TokenKind::Ident(text)
        } else {
            bail!(
                "Invalid word '{}' on line {}: not a name, image file or duration",
                text,
                span_line
            );
        };

        Ok(Token::new(kind, span))
    }

    /// Skips whitespace and `#` comments, keeping line/column counters honest.
    fn skip_trivia(&mut self) {
        while let Some(&(_, c)) = self.chars.peek() {
            match c {
                ' ' | '\t' | '\r' | '\n' => {
                    self.advance();
                }
                '#' => {
                    while let Some(&(_, c)) = self.chars.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                _ => break,
            }
        }
    }

    fn advance(&mut self) -> Option<char> {
        let (_, c) = self.chars.next()?;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn span(&self, start: usize, end: usize) -> Span {
        Span {
            start,
            end,
            line: self.line,
            column: self.column,
        }
    }
}

pub fn tokenize(input: &str) -> Result<Vec<Token<'_>>> {
    let mut lexer = Lexer::new(input);
    let mut tokens = Vec::new();
    loop {
        let token = lexer.next_token()?;
        let done = matches!(token.kind, TokenKind::Eof);
        tokens.push(token);
        if done {
            return Ok(tokens);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::tokenize;
    use crate::token::TokenKind;

    fn kinds(input: &str) -> Vec<TokenKind<'_>> {
        tokenize(input)
            .expect("tokenize should succeed")
            .into_iter()
            .map(|token| token.kind)
            .collect()
    }

    #[test]
    fn tokenizes_a_macro_header() {
        assert_eq!(
            kinds("MACRO foobar {"),
            vec![
                TokenKind::Ident("MACRO"),
                TokenKind::Ident("foobar"),
                TokenKind::LBrace,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn classifies_words() {
        assert_eq!(
            kinds("CLICK 10 , 20 WAIT 5s FIND menu/ok.png"),
            vec![
                TokenKind::Ident("CLICK"),
                TokenKind::Int("10"),
                TokenKind::Comma,
                TokenKind::Int("20"),
                TokenKind::Ident("WAIT"),
                TokenKind::Duration("5s"),
                TokenKind::Ident("FIND"),
                TokenKind::File("menu/ok.png"),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn skips_comments_to_end_of_line() {
        assert_eq!(
            kinds("WAIT 1s # wait a bit\nPAUSE"),
            vec![
                TokenKind::Ident("WAIT"),
                TokenKind::Duration("1s"),
                TokenKind::Ident("PAUSE"),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn dashes_and_underscores_are_valid_names() {
        assert_eq!(
            kinds("my-label_2"),
            vec![TokenKind::Ident("my-label_2"), TokenKind::Eof]
        );
    }

    #[test]
    fn errors_on_unknown_extension() {
        let error = tokenize("FIND image.txt").expect_err("tokenize should fail");
        assert!(error.to_string().contains("image.txt"));
    }

    #[test]
    fn errors_on_non_ascii_input() {
        let error = tokenize("MACRO fübar {}").expect_err("tokenize should fail");
        assert!(error.to_string().contains("ASCII"));
    }

    #[test]
    fn errors_on_unexpected_character() {
        let error = tokenize("CLICK (1,1)").expect_err("tokenize should fail");
        assert!(error.to_string().contains("'('"));
    }

    #[test]
    fn reports_line_numbers() {
        let error = tokenize("WAIT 1s\nWAIT $").expect_err("tokenize should fail");
        assert!(error.to_string().contains("line 2"), "{error}");
    }
}
