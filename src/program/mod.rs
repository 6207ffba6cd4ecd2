//! Program representation
//!
//! A loaded script is held as a flat, randomly indexable buffer of
//! [`ProgToken`]s. The buffer is assembled once by the [`store`], linked once
//! by [`link`], and afterwards only the per-token loop bookkeeping changes
//! while the interpreter runs. Every control-flow link is an index into the
//! same buffer, so the buffer can be cloned or shipped to the worker process
//! without fixing up pointers.

use serde::{Deserialize, Serialize};
use std::fmt;

pub mod lexer;
pub mod link;
pub mod store;

pub use lexer::{Lexer, RawPayload, RawToken, StackEntry, TokenSource, ValueStack};
pub use link::link;
pub use store::build;

/// Source position attached to every token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    /// Name of the script file the token came from.
    pub file: String,
    /// 1-based line number.
    pub line: u32,
}

impl Location {
    /// Create a new location.
    pub fn new(file: impl Into<String>, line: u32) -> Self {
        Self {
            file: file.into(),
            line,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// Classification tag of a token.
///
/// The control-flow tags and the literal/reference tags form the contract
/// between a [`TokenSource`] and the program store; the remaining tags are
/// punctuation consumed by the grammar pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TokenKind {
    /// `while` loop header
    While,
    /// `until` loop header
    Until,
    /// `repeat` loop header
    Repeat,
    /// `for` loop header
    For,
    /// `forever` loop header
    Forever,
    /// `if` conditional header
    If,
    /// `unless` conditional header
    Unless,
    /// `else`
    Else,
    /// `break`
    Break,
    /// `next`
    Next,
    /// `{`
    LBrace,
    /// `}`
    RBrace,
    /// `ON_STOP:` marker
    OnStop,
    /// Integer literal
    Int,
    /// Floating point literal
    Float,
    /// String literal
    Str,
    /// Function name (payload holds the name)
    Function,
    /// Variable reference (payload holds the name)
    Variable,
    /// `(`
    LParen,
    /// `)`
    RParen,
    /// `[`
    LBracket,
    /// `]`
    RBracket,
    /// `,`
    Comma,
    /// `;`
    Semicolon,
    /// `:`
    Colon,
    /// `=`
    Assign,
    /// `+=`
    AddAssign,
    /// `-=`
    SubAssign,
    /// `*=`
    MulAssign,
    /// `/=`
    DivAssign,
    /// `+`
    Plus,
    /// `-`
    Minus,
    /// `*`
    Star,
    /// `/`
    Slash,
    /// `%`
    Percent,
    /// `^`
    Caret,
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `&`
    And,
    /// `|`
    Or,
    /// `!`
    Not,
}

impl TokenKind {
    /// Loop headers (`while`, `until`, `repeat`, `for`, `forever`).
    pub fn is_loop(self) -> bool {
        matches!(
            self,
            TokenKind::While
                | TokenKind::Until
                | TokenKind::Repeat
                | TokenKind::For
                | TokenKind::Forever
        )
    }

    /// Conditional headers (`if`, `unless`).
    pub fn is_conditional(self) -> bool {
        matches!(self, TokenKind::If | TokenKind::Unless)
    }

    /// Tokens handled by the dispatcher itself rather than the grammar pass.
    pub fn is_control(self) -> bool {
        self.is_loop()
            || self.is_conditional()
            || matches!(
                self,
                TokenKind::Else
                    | TokenKind::Break
                    | TokenKind::Next
                    | TokenKind::LBrace
                    | TokenKind::RBrace
                    | TokenKind::OnStop
            )
    }

    /// Human-readable spelling used in diagnostics.
    pub fn describe(self) -> &'static str {
        match self {
            TokenKind::While => "while",
            TokenKind::Until => "until",
            TokenKind::Repeat => "repeat",
            TokenKind::For => "for",
            TokenKind::Forever => "forever",
            TokenKind::If => "if",
            TokenKind::Unless => "unless",
            TokenKind::Else => "else",
            TokenKind::Break => "break",
            TokenKind::Next => "next",
            TokenKind::LBrace => "'{'",
            TokenKind::RBrace => "'}'",
            TokenKind::OnStop => "ON_STOP:",
            TokenKind::Int => "integer",
            TokenKind::Float => "float",
            TokenKind::Str => "string",
            TokenKind::Function => "function name",
            TokenKind::Variable => "variable",
            TokenKind::LParen => "'('",
            TokenKind::RParen => "')'",
            TokenKind::LBracket => "'['",
            TokenKind::RBracket => "']'",
            TokenKind::Comma => "','",
            TokenKind::Semicolon => "';'",
            TokenKind::Colon => "':'",
            TokenKind::Assign => "'='",
            TokenKind::AddAssign => "'+='",
            TokenKind::SubAssign => "'-='",
            TokenKind::MulAssign => "'*='",
            TokenKind::DivAssign => "'/='",
            TokenKind::Plus => "'+'",
            TokenKind::Minus => "'-'",
            TokenKind::Star => "'*'",
            TokenKind::Slash => "'/'",
            TokenKind::Percent => "'%'",
            TokenKind::Caret => "'^'",
            TokenKind::Eq => "'=='",
            TokenKind::Ne => "'!='",
            TokenKind::Lt => "'<'",
            TokenKind::Le => "'<='",
            TokenKind::Gt => "'>'",
            TokenKind::Ge => "'>='",
            TokenKind::And => "'&'",
            TokenKind::Or => "'|'",
            TokenKind::Not => "'!'",
        }
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Semantic payload owned by a token.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum Payload {
    /// No payload (keywords, punctuation)
    #[default]
    None,
    /// Integer literal value
    Int(i64),
    /// Float literal value
    Float(f64),
    /// String literal contents
    Str(String),
    /// Function or variable name copied off the value stack
    Name(String),
}

impl Payload {
    /// Name carried by a function or variable token.
    pub fn name(&self) -> Option<&str> {
        match self {
            Payload::Name(name) => Some(name),
            _ => None,
        }
    }
}

/// Numeric bound cached on a `for` header.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Number {
    /// Integer bound
    Int(i64),
    /// Floating point bound
    Float(f64),
}

impl Number {
    /// Value as `f64`.
    pub fn as_f64(self) -> f64 {
        match self {
            Number::Int(v) => v as f64,
            Number::Float(v) => v,
        }
    }
}

/// Per-loop bookkeeping stored on `repeat` and `for` headers.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum LoopCounter {
    /// No counter (other constructs, or not yet computed)
    #[default]
    None,
    /// `repeat` counter pair
    Repeat {
        /// Iterations started so far
        count: i64,
        /// Number of iterations requested
        max: i64,
    },
    /// `for` loop triple
    For {
        /// Loop variable name
        variable: String,
        /// Inclusive end bound
        end: Number,
        /// Increment applied before every iteration but the first
        step: Number,
    },
}

/// One classified lexical unit of a loaded script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgToken {
    /// Classification tag.
    pub kind: TokenKind,
    /// Semantic payload.
    pub payload: Payload,
    /// Where the token was read from.
    pub location: Location,
    /// First token of the block controlled by this header.
    pub body_start: Option<usize>,
    /// Token to continue with once the construct is done.
    ///
    /// On a loop's closing `}` this points back at the loop header.
    pub successor: Option<usize>,
    /// Loop header targeted by a `break` or `next`.
    pub loop_header: Option<usize>,
    /// Loop counters (`repeat`/`for` only).
    pub counter: LoopCounter,
    /// Iteration state: `false` means the bounds of this loop have not been
    /// computed for the current entry.
    pub entered: bool,
}

impl ProgToken {
    /// Create an unlinked token.
    pub fn new(kind: TokenKind, payload: Payload, location: Location) -> Self {
        Self {
            kind,
            payload,
            location,
            body_start: None,
            successor: None,
            loop_header: None,
            counter: LoopCounter::None,
            entered: false,
        }
    }

    /// Forget any iteration state so the construct is entered afresh.
    pub fn reset_iteration(&mut self) {
        self.entered = false;
        self.counter = LoopCounter::None;
    }
}

/// Frozen program buffer for one loaded script.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Program {
    tokens: Vec<ProgToken>,
    on_stop: Option<usize>,
}

impl Program {
    pub(crate) fn from_parts(tokens: Vec<ProgToken>, on_stop: Option<usize>) -> Self {
        Self { tokens, on_stop }
    }

    /// Number of tokens in the buffer.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Whether the script has no executable section at all.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// All tokens in order.
    pub fn tokens(&self) -> &[ProgToken] {
        &self.tokens
    }

    /// Token at `index`.
    pub fn get(&self, index: usize) -> Option<&ProgToken> {
        self.tokens.get(index)
    }

    pub(crate) fn tokens_mut(&mut self) -> &mut [ProgToken] {
        &mut self.tokens
    }

    /// Index of the `ON_STOP:` marker, if the script declares one.
    pub fn on_stop(&self) -> Option<usize> {
        self.on_stop
    }

    /// Clear the iteration state of every loop, e.g. between the test run
    /// and the real run.
    pub fn reset_run_state(&mut self) {
        for token in &mut self.tokens {
            token.reset_iteration();
        }
    }

    /// BLAKE3 digest of the serialized buffer, used to confirm the worker
    /// runs exactly the program the supervisor checked.
    pub fn digest(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        blake3::hash(&bytes).to_hex().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_classification() {
        assert!(TokenKind::Forever.is_loop());
        assert!(TokenKind::Unless.is_conditional());
        assert!(TokenKind::OnStop.is_control());
        assert!(!TokenKind::Function.is_control());
        assert!(!TokenKind::Semicolon.is_control());
    }

    #[test]
    fn test_digest_tracks_contents() {
        let loc = Location::new("a.edl", 1);
        let a = Program::from_parts(
            vec![ProgToken::new(TokenKind::Int, Payload::Int(1), loc.clone())],
            None,
        );
        let b = Program::from_parts(
            vec![ProgToken::new(TokenKind::Int, Payload::Int(2), loc)],
            None,
        );
        assert_eq!(a.digest(), a.clone().digest());
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn test_reset_run_state() {
        let mut token = ProgToken::new(TokenKind::Repeat, Payload::None, Location::new("a", 1));
        token.entered = true;
        token.counter = LoopCounter::Repeat { count: 2, max: 3 };
        let mut program = Program::from_parts(vec![token], None);
        program.reset_run_state();
        assert!(!program.tokens()[0].entered);
        assert_eq!(program.tokens()[0].counter, LoopCounter::None);
    }
}
