//! Control-flow linker.
//!
//! Resolves, for every loop and conditional header, the index of the first
//! token of its block (`body_start`) and of the token after the construct
//! (`successor`), and points every `break`/`next` at its innermost enclosing
//! loop header.
//!
//! Link layout after a successful run:
//!
//! * loop header: `body_start` = first body token, `successor` = token after
//!   the closing `}`; the closing `}` links back to the header.
//! * `if`/`unless` without `else`: `successor` = token after the closing `}`,
//!   which also links there.
//! * with `else`: the header's `successor` is the token just past the `else`
//!   (the `{` of the else block or the chained `if`/`unless`); the closing `}`
//!   of every block in an `if`/`else if`/.../`else` chain links to the single
//!   exit point after the whole chain.

use super::{Location, Program, ProgToken, TokenKind};
use crate::error::{LinkError, LinkResult};

/// Link a frozen program in place.
///
/// On failure the program must be discarded; links set before the error was
/// found are not rolled back.
pub fn link(program: &mut Program) -> LinkResult<()> {
    let mut linker = Linker {
        tokens: program.tokens_mut(),
    };
    let mut index = 0;
    while index < linker.tokens.len() {
        index = linker.link_statement(index, None)?;
    }
    tracing::debug!(tokens = linker.tokens.len(), "program linked");
    Ok(())
}

struct Linker<'a> {
    tokens: &'a mut [ProgToken],
}

impl Linker<'_> {
    fn location(&self, index: usize) -> Location {
        self.tokens[index].location.clone()
    }

    /// Link the construct starting at `index` and return the index after it.
    fn link_statement(&mut self, index: usize, enclosing: Option<usize>) -> LinkResult<usize> {
        let kind = self.tokens[index].kind;
        match kind {
            kind if kind.is_loop() => self.link_loop(index),
            kind if kind.is_conditional() => self.link_conditional(index, enclosing),
            TokenKind::Break | TokenKind::Next => match enclosing {
                Some(header) => {
                    self.tokens[index].loop_header = Some(header);
                    Ok(index + 1)
                }
                None => Err(LinkError::OutsideLoop {
                    kind,
                    location: self.location(index),
                }),
            },
            TokenKind::Else => Err(LinkError::ElseWithoutConditional {
                location: self.location(index),
            }),
            TokenKind::LBrace => Err(LinkError::StrayBlock {
                location: self.location(index),
            }),
            // A stray '}' cannot survive the program store.
            _ => Ok(index + 1),
        }
    }

    /// Find the `{` that opens the block of the header at `header`.
    fn open_brace(&self, header: usize) -> LinkResult<usize> {
        let construct = self.tokens[header].kind;
        self.tokens[header + 1..]
            .iter()
            .position(|token| token.kind.is_control())
            .map(|offset| header + 1 + offset)
            .filter(|&index| self.tokens[index].kind == TokenKind::LBrace)
            .ok_or_else(|| LinkError::MissingOpeningBrace {
                construct,
                location: self.location(header),
            })
    }

    /// Link the statements of a block starting at `start` and return the
    /// index of its closing `}`.
    fn link_block(
        &mut self,
        start: usize,
        header: usize,
        enclosing: Option<usize>,
    ) -> LinkResult<usize> {
        let mut index = start;
        while index < self.tokens.len() {
            if self.tokens[index].kind == TokenKind::RBrace {
                return Ok(index);
            }
            index = self.link_statement(index, enclosing)?;
        }
        Err(LinkError::MissingClosingBrace {
            construct: self.tokens[header].kind,
            location: self.location(header),
        })
    }

    fn link_loop(&mut self, header: usize) -> LinkResult<usize> {
        let brace = self.open_brace(header)?;
        let close = self.link_block(brace + 1, header, Some(header))?;

        let token = &mut self.tokens[header];
        token.body_start = Some(brace + 1);
        token.successor = Some(close + 1);
        self.tokens[close].successor = Some(header);
        Ok(close + 1)
    }

    fn link_conditional(&mut self, header: usize, enclosing: Option<usize>) -> LinkResult<usize> {
        let brace = self.open_brace(header)?;
        let close = self.link_block(brace + 1, header, enclosing)?;
        self.tokens[header].body_start = Some(brace + 1);

        let else_index = close + 1;
        if self.tokens.get(else_index).map(|t| t.kind) != Some(TokenKind::Else) {
            self.tokens[header].successor = Some(close + 1);
            self.tokens[close].successor = Some(close + 1);
            return Ok(close + 1);
        }

        self.tokens[header].successor = Some(else_index + 1);
        let exit = match self.tokens.get(else_index + 1).map(|t| t.kind) {
            Some(TokenKind::LBrace) => {
                let else_close = self.link_block(else_index + 2, header, enclosing)?;
                self.tokens[else_close].successor = Some(else_close + 1);
                else_close + 1
            }
            // chained else if / else unless: its own links end at the chain exit
            Some(kind) if kind.is_conditional() => {
                self.link_conditional(else_index + 1, enclosing)?
            }
            _ => {
                return Err(LinkError::MisplacedElse {
                    location: self.location(else_index),
                });
            }
        };
        self.tokens[close].successor = Some(exit);
        Ok(exit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::{Lexer, Payload, ValueStack, build};

    fn linked(src: &str) -> LinkResult<Program> {
        let mut lexer = Lexer::new("link.edl", src);
        let mut stack = ValueStack::new();
        let mut program = build(&mut lexer, &mut stack).expect("store");
        link(&mut program)?;
        Ok(program)
    }

    fn index_of(program: &Program, kind: TokenKind, nth: usize) -> usize {
        program
            .tokens()
            .iter()
            .enumerate()
            .filter(|(_, t)| t.kind == kind)
            .nth(nth)
            .map(|(i, _)| i)
            .expect("token present")
    }

    #[test]
    fn test_while_links() {
        // 0:while 1:x 2:{ 3:x 4:= 5:1 6:; 7:} 8:y
        let program = linked("while x { x = 1; } y;").unwrap();
        let header = &program.tokens()[0];
        assert_eq!(header.body_start, Some(3));
        assert_eq!(header.successor, Some(8));
        assert_eq!(program.tokens()[7].successor, Some(0));
    }

    #[test]
    fn test_break_targets_innermost_loop() {
        let program = linked("forever { repeat 3 { if a { break; } } break; }").unwrap();
        let outer = index_of(&program, TokenKind::Forever, 0);
        let inner = index_of(&program, TokenKind::Repeat, 0);
        let first_break = index_of(&program, TokenKind::Break, 0);
        let second_break = index_of(&program, TokenKind::Break, 1);
        assert_eq!(program.tokens()[first_break].loop_header, Some(inner));
        assert_eq!(program.tokens()[second_break].loop_header, Some(outer));
    }

    #[test]
    fn test_if_else_chain_has_single_exit() {
        let src = "if a { x; } else if b { y; } else unless c { z; } else { w; } done;";
        let program = linked(src).unwrap();
        let exit = index_of(&program, TokenKind::Variable, 7);
        assert_eq!(program.tokens()[exit].payload.name(), Some("done"));
        for close in program
            .tokens()
            .iter()
            .filter(|t| t.kind == TokenKind::RBrace)
        {
            assert_eq!(close.successor, Some(exit));
        }
        let first_else = index_of(&program, TokenKind::Else, 0);
        assert_eq!(program.tokens()[0].successor, Some(first_else + 1));
    }

    #[test]
    fn test_successor_after_close() {
        let program = linked("if a { while b { c; } } else { d; } e;").unwrap();
        let tokens = program.tokens();
        let while_idx = index_of(&program, TokenKind::While, 0);
        let while_close = tokens[while_idx].successor.unwrap() - 1;
        assert_eq!(tokens[while_close].kind, TokenKind::RBrace);
        assert!(tokens[0].successor.unwrap() > index_of(&program, TokenKind::RBrace, 1));
    }

    #[test]
    fn test_malformed_constructs() {
        assert!(matches!(
            linked("else { x; }"),
            Err(LinkError::ElseWithoutConditional { .. })
        ));
        assert!(matches!(
            linked("if a { x; } else y;"),
            Err(LinkError::MisplacedElse { .. })
        ));
        assert!(matches!(
            linked("{ x; }"),
            Err(LinkError::StrayBlock { .. })
        ));
        assert!(matches!(
            linked("while a if b { x; }"),
            Err(LinkError::MissingOpeningBrace { .. })
        ));
    }

    #[test]
    fn test_missing_close_in_unbalanced_buffer() {
        let loc = Location::new("link.edl", 4);
        let mut program = Program::from_parts(
            vec![
                ProgToken::new(TokenKind::While, Payload::None, loc.clone()),
                ProgToken::new(TokenKind::Int, Payload::Int(1), loc.clone()),
                ProgToken::new(TokenKind::LBrace, Payload::None, loc),
            ],
            None,
        );
        match link(&mut program) {
            Err(LinkError::MissingClosingBrace {
                construct,
                location,
            }) => {
                assert_eq!(construct, TokenKind::While);
                assert_eq!(location.line, 4);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
