//! Program store: assembles the program buffer from a token stream.
//!
//! Bracket balance, `break`/`next` placement and `ON_STOP:` placement are
//! validated while the buffer is filled, so that structural errors are
//! reported at the token that causes them.

use super::lexer::{RawPayload, RawToken, StackEntry, TokenSource, ValueStack};
use super::{Location, Payload, ProgToken, Program, TokenKind};
use crate::error::{StoreError, StoreResult};

/// Open block recorded on the brace stack.
struct OpenBlock {
    location: Location,
    is_loop: bool,
}

#[derive(Default)]
struct Store {
    tokens: Vec<ProgToken>,
    parens: usize,
    brackets: usize,
    braces: Vec<OpenBlock>,
    loop_depth: usize,
    pending_loop: Option<bool>,
    on_stop: Option<usize>,
}

/// Drain `source` into a frozen [`Program`].
///
/// On error nothing of the partially built buffer survives and the value
/// stack is left empty. An empty token stream yields an empty program.
pub fn build<'src, S>(source: &mut S, stack: &mut ValueStack) -> StoreResult<Program>
where
    S: TokenSource<'src>,
{
    let built = fill(Store::default(), source, stack);
    if built.is_err() {
        stack.clear();
    }
    built
}

fn fill<'src, S>(mut store: Store, source: &mut S, stack: &mut ValueStack) -> StoreResult<Program>
where
    S: TokenSource<'src>,
{
    while let Some(raw) = source.next_token(stack)? {
        store.push(raw, stack)?;
    }
    store.finish()
}

impl Store {
    fn push(&mut self, raw: RawToken<'_>, stack: &mut ValueStack) -> StoreResult<()> {
        let RawToken {
            kind,
            payload,
            location,
        } = raw;

        match kind {
            TokenKind::LParen => self.parens += 1,
            TokenKind::RParen => {
                self.parens = self.parens.checked_sub(1).ok_or(StoreError::Unmatched {
                    found: TokenKind::RParen,
                    expected: TokenKind::LParen,
                    location: location.clone(),
                })?;
            }
            TokenKind::LBracket => self.brackets += 1,
            TokenKind::RBracket => {
                self.brackets = self.brackets.checked_sub(1).ok_or(StoreError::Unmatched {
                    found: TokenKind::RBracket,
                    expected: TokenKind::LBracket,
                    location: location.clone(),
                })?;
            }
            TokenKind::LBrace => {
                let is_loop = self.pending_loop.take().unwrap_or(false);
                if is_loop {
                    self.loop_depth += 1;
                }
                self.braces.push(OpenBlock {
                    location: location.clone(),
                    is_loop,
                });
            }
            TokenKind::RBrace => {
                let block = self.braces.pop().ok_or(StoreError::Unmatched {
                    found: TokenKind::RBrace,
                    expected: TokenKind::LBrace,
                    location: location.clone(),
                })?;
                if block.is_loop {
                    self.loop_depth -= 1;
                }
            }
            TokenKind::Break | TokenKind::Next if self.loop_depth == 0 => {
                return Err(StoreError::OutsideLoop { kind, location });
            }
            TokenKind::OnStop => {
                if self.parens != 0
                    || self.brackets != 0
                    || !self.braces.is_empty()
                    || self.pending_loop.is_some()
                {
                    return Err(StoreError::MisplacedOnStop { location });
                }
                if let Some(first) = self.on_stop {
                    return Err(StoreError::DuplicateOnStop {
                        location,
                        first: self.tokens[first].location.clone(),
                    });
                }
                self.on_stop = Some(self.tokens.len());
            }
            kind if kind.is_loop() => self.pending_loop = Some(true),
            kind if kind.is_conditional() => self.pending_loop = Some(false),
            _ => {}
        }

        let payload = match (kind, payload) {
            (TokenKind::Function | TokenKind::Variable, _) => {
                let name = match (kind, stack.pop()) {
                    (TokenKind::Function, Some(StackEntry::Function(name)))
                    | (TokenKind::Variable, Some(StackEntry::Variable(name))) => name,
                    _ => {
                        return Err(StoreError::StackUnderflow { kind, location });
                    }
                };
                Payload::Name(name)
            }
            (_, RawPayload::None) => Payload::None,
            (_, RawPayload::Int(value)) => Payload::Int(value),
            (_, RawPayload::Float(value)) => Payload::Float(value),
            (_, RawPayload::Str(text)) => Payload::Str(text.into_owned()),
        };

        self.tokens.push(ProgToken::new(kind, payload, location));
        Ok(())
    }

    fn finish(self) -> StoreResult<Program> {
        if let Some(block) = self.braces.last() {
            return Err(StoreError::UnclosedBrace {
                location: block.location.clone(),
            });
        }
        let last_location = || {
            self.tokens
                .last()
                .map(|t| t.location.clone())
                .unwrap_or_else(|| Location::new("<input>", 0))
        };
        if self.parens != 0 {
            return Err(StoreError::UnclosedGroup {
                expected: TokenKind::RParen,
                location: last_location(),
            });
        }
        if self.brackets != 0 {
            return Err(StoreError::UnclosedGroup {
                expected: TokenKind::RBracket,
                location: last_location(),
            });
        }

        let mut tokens = self.tokens;
        tokens.shrink_to_fit();
        tracing::debug!(tokens = tokens.len(), on_stop = ?self.on_stop, "program stored");
        Ok(Program::from_parts(tokens, self.on_stop))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::Lexer;

    fn store(src: &str) -> StoreResult<Program> {
        let mut lexer = Lexer::new("store.edl", src);
        let mut stack = ValueStack::new();
        build(&mut lexer, &mut stack)
    }

    #[test]
    fn test_failed_build_drains_value_stack() {
        let mut lexer = Lexer::new("store.edl", "x = f(y;\n");
        let mut stack = ValueStack::new();
        stack.push(StackEntry::Variable("left over".into()));
        assert!(build(&mut lexer, &mut stack).is_err());
        assert!(stack.is_empty());

        let mut lexer = Lexer::new("store.edl", "x = 1;");
        let mut stack = ValueStack::new();
        build(&mut lexer, &mut stack).unwrap();
        assert!(stack.is_empty());
    }

    #[test]
    fn test_empty_program_is_not_an_error() {
        let program = store("  // nothing here\n").unwrap();
        assert!(program.is_empty());
        assert_eq!(program.on_stop(), None);
    }

    #[test]
    fn test_names_are_copied_into_tokens() {
        let program = store("x = sqrt(y);").unwrap();
        assert_eq!(program.tokens()[0].payload, Payload::Name("x".into()));
        assert_eq!(program.tokens()[2].payload, Payload::Name("sqrt".into()));
        assert_eq!(program.tokens()[4].payload, Payload::Name("y".into()));
    }

    #[test]
    fn test_unmatched_closers() {
        assert!(matches!(
            store("x = 1);"),
            Err(StoreError::Unmatched {
                found: TokenKind::RParen,
                ..
            })
        ));
        assert!(matches!(
            store("}"),
            Err(StoreError::Unmatched {
                found: TokenKind::RBrace,
                ..
            })
        ));
        assert!(matches!(
            store("a = b];"),
            Err(StoreError::Unmatched {
                found: TokenKind::RBracket,
                ..
            })
        ));
    }

    #[test]
    fn test_unclosed_brace_names_its_line() {
        let err = store("x = 1;\nwhile x < 3 {\n  x += 1;\n").unwrap_err();
        match err {
            StoreError::UnclosedBrace { location } => {
                assert_eq!(location.file, "store.edl");
                assert_eq!(location.line, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unclosed_paren_at_end() {
        assert!(matches!(
            store("x = (1 + 2;"),
            Err(StoreError::UnclosedGroup {
                expected: TokenKind::RParen,
                ..
            })
        ));
    }

    #[test]
    fn test_break_requires_loop() {
        assert!(matches!(
            store("if x { break; }"),
            Err(StoreError::OutsideLoop {
                kind: TokenKind::Break,
                ..
            })
        ));
        assert!(store("forever { if x { break; } }").is_ok());
        assert!(matches!(
            store("while x { } next;"),
            Err(StoreError::OutsideLoop {
                kind: TokenKind::Next,
                ..
            })
        ));
    }

    #[test]
    fn test_on_stop_placement() {
        let program = store("x = 1;\nON_STOP:\nprint(\"bye\");").unwrap();
        assert_eq!(program.on_stop(), Some(4));

        assert!(matches!(
            store("while x { ON_STOP: }"),
            Err(StoreError::MisplacedOnStop { .. })
        ));
        assert!(matches!(
            store("x = (ON_STOP: 1);"),
            Err(StoreError::MisplacedOnStop { .. })
        ));
        assert!(matches!(
            store("ON_STOP: ON_STOP:"),
            Err(StoreError::DuplicateOnStop { .. })
        ));
    }

    #[test]
    fn test_mismatched_stack_entry() {
        struct Bogus(bool);
        impl<'src> TokenSource<'src> for Bogus {
            fn next_token(
                &mut self,
                _stack: &mut ValueStack,
            ) -> Result<Option<RawToken<'src>>, crate::error::LexError> {
                if std::mem::replace(&mut self.0, true) {
                    return Ok(None);
                }
                Ok(Some(RawToken {
                    kind: TokenKind::Variable,
                    payload: RawPayload::None,
                    location: Location::new("bogus", 1),
                }))
            }
        }
        let mut stack = ValueStack::new();
        assert!(matches!(
            build(&mut Bogus(false), &mut stack),
            Err(StoreError::StackUnderflow { .. })
        ));
    }
}
