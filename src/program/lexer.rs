//! Reference token source for EDL text.
//!
//! The program store only needs something implementing [`TokenSource`]; this
//! lexer is the implementation the crate ships. Function and variable names
//! are not carried on the emitted tokens but pushed onto a [`ValueStack`],
//! from which the store pops and copies them.

use std::borrow::Cow;

use super::{Location, TokenKind};
use crate::error::LexError;

/// Entry on the transient value stack shared with the program store.
#[derive(Debug, Clone, PartialEq)]
pub enum StackEntry {
    /// Name of a called function
    Function(String),
    /// Name of a referenced variable
    Variable(String),
}

/// Transient push/pop stack for names produced by the token source.
#[derive(Debug, Default)]
pub struct ValueStack {
    entries: Vec<StackEntry>,
}

impl ValueStack {
    /// Create an empty stack.
    pub fn new() -> Self {
        Self::default()
    }

    /// Push an entry.
    pub fn push(&mut self, entry: StackEntry) {
        self.entries.push(entry);
    }

    /// Pop the most recent entry.
    pub fn pop(&mut self) -> Option<StackEntry> {
        self.entries.pop()
    }

    /// Number of entries on the stack.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the stack is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop everything left on the stack.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Payload of a token as produced by the source. String contents may borrow
/// from the source buffer and must be copied by the consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum RawPayload<'src> {
    /// No payload
    None,
    /// Integer literal
    Int(i64),
    /// Float literal
    Float(f64),
    /// String literal
    Str(Cow<'src, str>),
}

/// Token as produced by a [`TokenSource`].
#[derive(Debug, Clone, PartialEq)]
pub struct RawToken<'src> {
    /// Classification tag
    pub kind: TokenKind,
    /// Literal payload
    pub payload: RawPayload<'src>,
    /// Source location
    pub location: Location,
}

/// Producer of classified tokens.
pub trait TokenSource<'src> {
    /// Return the next token, or `None` at end of input. Function and
    /// variable tokens push their name onto `stack`.
    fn next_token(&mut self, stack: &mut ValueStack) -> Result<Option<RawToken<'src>>, LexError>;
}

/// Tokenizer for EDL source text.
pub struct Lexer<'src> {
    file: String,
    src: &'src str,
    bytes: &'src [u8],
    index: usize,
    line: u32,
}

impl<'src> Lexer<'src> {
    /// Create a lexer over `src`, attributing tokens to `file`.
    pub fn new(file: impl Into<String>, src: &'src str) -> Self {
        Self {
            file: file.into(),
            src,
            bytes: src.as_bytes(),
            index: 0,
            line: 1,
        }
    }

    fn location(&self) -> Location {
        Location::new(self.file.clone(), self.line)
    }

    fn current(&self) -> Option<u8> {
        self.bytes.get(self.index).copied()
    }

    fn peek(&self, offset: usize) -> Option<u8> {
        self.bytes.get(self.index + offset).copied()
    }

    fn advance(&mut self) {
        if let Some(ch) = self.current() {
            if ch == b'\n' {
                self.line += 1;
            }
            self.index += 1;
        }
    }

    fn skip_trivia(&mut self) -> Result<(), LexError> {
        loop {
            match (self.current(), self.peek(1)) {
                (Some(ch), _) if ch.is_ascii_whitespace() => self.advance(),
                (Some(b'#'), _) | (Some(b'/'), Some(b'/')) => {
                    while let Some(ch) = self.current() {
                        if ch == b'\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                (Some(b'/'), Some(b'*')) => {
                    let location = self.location();
                    self.advance();
                    self.advance();
                    loop {
                        match (self.current(), self.peek(1)) {
                            (Some(b'*'), Some(b'/')) => {
                                self.advance();
                                self.advance();
                                break;
                            }
                            (Some(_), _) => self.advance(),
                            (None, _) => return Err(LexError::UnterminatedComment { location }),
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn lex_number(&mut self, location: Location) -> Result<RawToken<'src>, LexError> {
        let start = self.index;
        let mut is_float = false;
        while matches!(self.current(), Some(b'0'..=b'9')) {
            self.advance();
        }
        if self.current() == Some(b'.') && matches!(self.peek(1), Some(b'0'..=b'9')) {
            is_float = true;
            self.advance();
            while matches!(self.current(), Some(b'0'..=b'9')) {
                self.advance();
            }
        }
        if matches!(self.current(), Some(b'e' | b'E')) {
            let digits_at = match self.peek(1) {
                Some(b'+' | b'-') => 2,
                _ => 1,
            };
            if matches!(self.peek(digits_at), Some(b'0'..=b'9')) {
                is_float = true;
                for _ in 0..digits_at {
                    self.advance();
                }
                while matches!(self.current(), Some(b'0'..=b'9')) {
                    self.advance();
                }
            }
        }

        let text = &self.src[start..self.index];
        let invalid = || LexError::InvalidNumber {
            text: text.to_string(),
            location: location.clone(),
        };
        let (kind, payload) = if is_float {
            let value: f64 = text.parse().map_err(|_| invalid())?;
            if !value.is_finite() {
                return Err(invalid());
            }
            (TokenKind::Float, RawPayload::Float(value))
        } else {
            let value: i64 = text.parse().map_err(|_| invalid())?;
            (TokenKind::Int, RawPayload::Int(value))
        };
        Ok(RawToken {
            kind,
            payload,
            location,
        })
    }

    fn lex_string(&mut self, location: Location) -> Result<RawToken<'src>, LexError> {
        let src = self.src;
        // consume opening quote
        self.advance();
        let start = self.index;
        let mut owned: Option<String> = None;
        loop {
            let Some(ch) = self.current() else {
                return Err(LexError::UnterminatedString { location });
            };
            match ch {
                b'"' => {
                    let contents = match owned {
                        Some(buf) => Cow::Owned(buf),
                        None => Cow::Borrowed(&src[start..self.index]),
                    };
                    self.advance();
                    return Ok(RawToken {
                        kind: TokenKind::Str,
                        payload: RawPayload::Str(contents),
                        location,
                    });
                }
                b'\\' => {
                    let buf =
                        owned.get_or_insert_with(|| self.src[start..self.index].to_string());
                    self.advance();
                    let escaped = self
                        .current()
                        .ok_or_else(|| LexError::UnterminatedString {
                            location: location.clone(),
                        })?;
                    buf.push(match escaped {
                        b'n' => '\n',
                        b't' => '\t',
                        b'"' => '"',
                        b'\\' => '\\',
                        other => {
                            return Err(LexError::UnknownEscape {
                                ch: other as char,
                                location: self.location(),
                            });
                        }
                    });
                    self.advance();
                }
                _ => {
                    let char_start = self.index;
                    self.advance();
                    // continuation bytes of a multi-byte character
                    while matches!(self.current(), Some(b) if b & 0xC0 == 0x80) {
                        self.advance();
                    }
                    if let Some(buf) = owned.as_mut() {
                        buf.push_str(&self.src[char_start..self.index]);
                    }
                }
            }
        }
    }

    fn lex_word(
        &mut self,
        location: Location,
        stack: &mut ValueStack,
    ) -> Result<RawToken<'src>, LexError> {
        let src = self.src;
        let start = self.index;
        while matches!(self.current(), Some(b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'_')) {
            self.advance();
        }
        let word = &src[start..self.index];

        if word.eq_ignore_ascii_case("on_stop") && self.current() == Some(b':') {
            self.advance();
            return Ok(self.simple(TokenKind::OnStop, location));
        }

        if let Some(kind) = keyword(word) {
            return Ok(self.simple(kind, location));
        }

        let mut ahead = self.index;
        while matches!(self.bytes.get(ahead), Some(b' ' | b'\t')) {
            ahead += 1;
        }
        let kind = if self.bytes.get(ahead) == Some(&b'(') {
            stack.push(StackEntry::Function(word.to_string()));
            TokenKind::Function
        } else {
            stack.push(StackEntry::Variable(word.to_string()));
            TokenKind::Variable
        };
        Ok(self.simple(kind, location))
    }

    fn simple(&self, kind: TokenKind, location: Location) -> RawToken<'src> {
        RawToken {
            kind,
            payload: RawPayload::None,
            location,
        }
    }

    fn lex_punct(&mut self, location: Location) -> Result<RawToken<'src>, LexError> {
        let ch = self.current().unwrap_or(b'\0');
        let next = self.peek(1);
        let (kind, width) = match (ch, next) {
            (b'=', Some(b'=')) => (TokenKind::Eq, 2),
            (b'!', Some(b'=')) => (TokenKind::Ne, 2),
            (b'<', Some(b'=')) => (TokenKind::Le, 2),
            (b'>', Some(b'=')) => (TokenKind::Ge, 2),
            (b'+', Some(b'=')) => (TokenKind::AddAssign, 2),
            (b'-', Some(b'=')) => (TokenKind::SubAssign, 2),
            (b'*', Some(b'=')) => (TokenKind::MulAssign, 2),
            (b'/', Some(b'=')) => (TokenKind::DivAssign, 2),
            (b'&', Some(b'&')) => (TokenKind::And, 2),
            (b'|', Some(b'|')) => (TokenKind::Or, 2),
            (b'{', _) => (TokenKind::LBrace, 1),
            (b'}', _) => (TokenKind::RBrace, 1),
            (b'(', _) => (TokenKind::LParen, 1),
            (b')', _) => (TokenKind::RParen, 1),
            (b'[', _) => (TokenKind::LBracket, 1),
            (b']', _) => (TokenKind::RBracket, 1),
            (b',', _) => (TokenKind::Comma, 1),
            (b';', _) => (TokenKind::Semicolon, 1),
            (b':', _) => (TokenKind::Colon, 1),
            (b'=', _) => (TokenKind::Assign, 1),
            (b'+', _) => (TokenKind::Plus, 1),
            (b'-', _) => (TokenKind::Minus, 1),
            (b'*', _) => (TokenKind::Star, 1),
            (b'/', _) => (TokenKind::Slash, 1),
            (b'%', _) => (TokenKind::Percent, 1),
            (b'^', _) => (TokenKind::Caret, 1),
            (b'<', _) => (TokenKind::Lt, 1),
            (b'>', _) => (TokenKind::Gt, 1),
            (b'&', _) => (TokenKind::And, 1),
            (b'|', _) => (TokenKind::Or, 1),
            (b'!', _) => (TokenKind::Not, 1),
            _ => {
                let ch = self.src[self.index..].chars().next().unwrap_or('\0');
                return Err(LexError::UnexpectedChar { ch, location });
            }
        };
        for _ in 0..width {
            self.advance();
        }
        Ok(self.simple(kind, location))
    }
}

impl<'src> TokenSource<'src> for Lexer<'src> {
    fn next_token(&mut self, stack: &mut ValueStack) -> Result<Option<RawToken<'src>>, LexError> {
        self.skip_trivia()?;
        let Some(ch) = self.current() else {
            return Ok(None);
        };
        let location = self.location();
        let token = match ch {
            b'0'..=b'9' => self.lex_number(location)?,
            b'.' if matches!(self.peek(1), Some(b'0'..=b'9')) => self.lex_number(location)?,
            b'"' => self.lex_string(location)?,
            b'a'..=b'z' | b'A'..=b'Z' | b'_' => self.lex_word(location, stack)?,
            _ => self.lex_punct(location)?,
        };
        Ok(Some(token))
    }
}

fn keyword(word: &str) -> Option<TokenKind> {
    const KEYWORDS: [(&str, TokenKind); 10] = [
        ("while", TokenKind::While),
        ("until", TokenKind::Until),
        ("repeat", TokenKind::Repeat),
        ("for", TokenKind::For),
        ("forever", TokenKind::Forever),
        ("if", TokenKind::If),
        ("unless", TokenKind::Unless),
        ("else", TokenKind::Else),
        ("break", TokenKind::Break),
        ("next", TokenKind::Next),
    ];
    KEYWORDS
        .iter()
        .find(|(name, _)| word.eq_ignore_ascii_case(name))
        .map(|(_, kind)| *kind)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex_all(src: &str) -> (Vec<RawToken<'_>>, ValueStack) {
        let mut lexer = Lexer::new("test.edl", src);
        let mut stack = ValueStack::new();
        let mut tokens = Vec::new();
        while let Some(token) = lexer.next_token(&mut stack).unwrap() {
            tokens.push(token);
        }
        (tokens, stack)
    }

    #[test]
    fn test_keywords_are_case_insensitive() {
        let (tokens, _) = lex_all("WHILE Repeat forever ELSE");
        let kinds: Vec<_> = tokens.iter().map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TokenKind::While,
                TokenKind::Repeat,
                TokenKind::Forever,
                TokenKind::Else
            ]
        );
    }

    #[test]
    fn test_names_go_to_value_stack() {
        let (tokens, mut stack) = lex_all("x = print (y);");
        assert_eq!(tokens[0].kind, TokenKind::Variable);
        assert_eq!(tokens[2].kind, TokenKind::Function);
        assert_eq!(tokens[4].kind, TokenKind::Variable);
        assert_eq!(stack.pop(), Some(StackEntry::Variable("y".into())));
        assert_eq!(stack.pop(), Some(StackEntry::Function("print".into())));
        assert_eq!(stack.pop(), Some(StackEntry::Variable("x".into())));
    }

    #[test]
    fn test_numbers_and_strings() {
        let (tokens, _) = lex_all("42 2.5 1e3 \"a\\tb\" \"plain\"");
        assert_eq!(tokens[0].payload, RawPayload::Int(42));
        assert_eq!(tokens[1].payload, RawPayload::Float(2.5));
        assert_eq!(tokens[2].payload, RawPayload::Float(1000.0));
        assert_eq!(tokens[3].payload, RawPayload::Str(Cow::Owned("a\tb".into())));
        assert!(matches!(
            &tokens[4].payload,
            RawPayload::Str(Cow::Borrowed("plain"))
        ));
    }

    #[test]
    fn test_on_stop_marker_and_lines() {
        let (tokens, _) = lex_all("// comment\n/* multi\nline */ on_stop:\n# tail");
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].kind, TokenKind::OnStop);
        assert_eq!(tokens[0].location.line, 3);
    }

    #[test]
    fn test_lex_errors() {
        let mut stack = ValueStack::new();
        let err = Lexer::new("t", "\"open").next_token(&mut stack).unwrap_err();
        assert!(matches!(err, LexError::UnterminatedString { .. }));
        let err = Lexer::new("t", "@").next_token(&mut stack).unwrap_err();
        assert!(matches!(err, LexError::UnexpectedChar { ch: '@', .. }));
        let err = Lexer::new("t", "99999999999999999999")
            .next_token(&mut stack)
            .unwrap_err();
        assert!(matches!(err, LexError::InvalidNumber { .. }));
    }
}
