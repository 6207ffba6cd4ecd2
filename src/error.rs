//! Error types for the EDL runtime
//!
//! Every layer has its own `thiserror` enum. Structural errors from the
//! lexer, program store and linker are always fatal for the script; the
//! interpreter's errors abort the current phase; device errors are collected
//! so that every required cleanup hook still gets its turn.

use std::io;
use thiserror::Error;

use crate::orchestrator::OrchestratorError;
use crate::program::{Location, TokenKind};

/// Top-level error
#[derive(Debug, Error)]
pub enum Error {
    /// Tokenizer errors
    #[error("Lexer error: {0}")]
    Lex(#[from] LexError),

    /// Program store (structural) errors
    #[error("Program error: {0}")]
    Store(#[from] StoreError),

    /// Control-flow linker errors
    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    /// Errors raised while interpreting the program
    #[error("Interpreter error: {0}")]
    Interpret(#[from] InterpretError),

    /// Device module errors
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    /// Worker process errors
    #[error("Worker error: {0}")]
    Orchestrator(#[from] OrchestratorError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Tokenizer errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LexError {
    /// Character that starts no token
    #[error("{location}: unexpected character '{ch}'")]
    UnexpectedChar {
        /// Offending character
        ch: char,
        /// Where it was found
        location: Location,
    },

    /// String literal not closed before end of input
    #[error("{location}: unterminated string literal")]
    UnterminatedString {
        /// Start of the literal
        location: Location,
    },

    /// Block comment not closed before end of input
    #[error("{location}: unterminated comment")]
    UnterminatedComment {
        /// Start of the comment
        location: Location,
    },

    /// Unsupported escape sequence in a string literal
    #[error("{location}: unknown escape sequence '\\{ch}'")]
    UnknownEscape {
        /// Character after the backslash
        ch: char,
        /// Where it was found
        location: Location,
    },

    /// Numeric literal that does not fit its type
    #[error("{location}: invalid number '{text}'")]
    InvalidNumber {
        /// Literal text
        text: String,
        /// Where it was found
        location: Location,
    },
}

/// Structural errors detected while assembling the program buffer
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    /// Lexer failure
    #[error(transparent)]
    Lex(#[from] LexError),

    /// Closing token without an open counterpart
    #[error("{location}: found {found} without matching {expected}")]
    Unmatched {
        /// Closing token encountered
        found: TokenKind,
        /// Opening token that was expected earlier
        expected: TokenKind,
        /// Where the closing token is
        location: Location,
    },

    /// Input ended while a block was still open
    #[error("{location}: missing closing '}}' for block opened here")]
    UnclosedBrace {
        /// Where the unmatched `{` is
        location: Location,
    },

    /// Input ended with unbalanced parentheses or brackets
    #[error("{location}: missing closing {expected} at end of program")]
    UnclosedGroup {
        /// Closing token that never appeared
        expected: TokenKind,
        /// Location of the last token read
        location: Location,
    },

    /// `break`/`next` outside of any loop
    #[error("{location}: {kind} outside of a loop")]
    OutsideLoop {
        /// `break` or `next`
        kind: TokenKind,
        /// Where it was found
        location: Location,
    },

    /// `ON_STOP:` inside a block or an open expression
    #[error("{location}: ON_STOP: label must not appear inside a block or expression")]
    MisplacedOnStop {
        /// Where the marker is
        location: Location,
    },

    /// More than one `ON_STOP:` marker
    #[error("{location}: ON_STOP: label already declared at {first}")]
    DuplicateOnStop {
        /// Where the second marker is
        location: Location,
        /// Where the first marker is
        first: Location,
    },

    /// The token source produced a name token without pushing its name
    #[error("{location}: no value on the value stack for {kind}")]
    StackUnderflow {
        /// Function or variable token
        kind: TokenKind,
        /// Where it was found
        location: Location,
    },
}

/// Malformed control-flow constructs found by the linker
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LinkError {
    /// Construct whose block never closes
    #[error("{location}: missing closing '}}' for {construct} starting here")]
    MissingClosingBrace {
        /// Loop or conditional header
        construct: TokenKind,
        /// Location of the header
        location: Location,
    },

    /// Header not followed by a block
    #[error("{location}: missing '{{' after {construct}")]
    MissingOpeningBrace {
        /// Loop or conditional header
        construct: TokenKind,
        /// Location of the header
        location: Location,
    },

    /// `break`/`next` with no enclosing loop
    #[error("{location}: {kind} outside of a loop")]
    OutsideLoop {
        /// `break` or `next`
        kind: TokenKind,
        /// Where it was found
        location: Location,
    },

    /// `else` not preceded by the block of an `if`/`unless`
    #[error("{location}: else without preceding if or unless")]
    ElseWithoutConditional {
        /// Where the `else` is
        location: Location,
    },

    /// `else` followed by something other than a block or a conditional
    #[error("{location}: else must be followed by '{{', if or unless")]
    MisplacedElse {
        /// Where the `else` is
        location: Location,
    },

    /// Block that belongs to no loop or conditional
    #[error("{location}: block without loop or condition")]
    StrayBlock {
        /// Where the `{` is
        location: Location,
    },
}

/// Errors that abort an interpreter phase
#[derive(Debug, Error)]
pub enum InterpretError {
    /// Statement or expression is malformed
    #[error("{location}: syntax error: {message}")]
    Syntax {
        /// Description
        message: String,
        /// Where the error was detected
        location: Location,
    },

    /// Semantic error (wrong value type, zero increment, division by zero, ...)
    #[error("{location}: {message}")]
    Fatal {
        /// Description
        message: String,
        /// Where the error was detected
        location: Location,
    },

    /// Device function or hook failure
    #[error("{location}: {source}")]
    Device {
        /// Underlying device error
        source: DeviceError,
        /// Where the call was made
        location: Location,
    },

    /// The program buffer is not linked or the cursor ran off its links
    #[error("corrupt program: {0}")]
    Corrupt(String),

    /// Writing to the data channel failed
    #[error("data channel error: {0}")]
    Output(#[from] io::Error),
}

/// Device module errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DeviceError {
    /// No factory registered under that name
    #[error("unknown device module '{0}'")]
    UnknownModule(String),

    /// A life-cycle hook failed
    #[error("{module}: {hook} failed: {message}")]
    Hook {
        /// Module name
        module: String,
        /// Hook name
        hook: &'static str,
        /// Description
        message: String,
    },

    /// A device function failed
    #[error("{module}: {message}")]
    Call {
        /// Module name
        module: String,
        /// Description
        message: String,
    },

    /// Several cleanup hooks failed
    #[error("{} cleanup hooks failed (first: {})", .0.len(), .0.first().map(ToString::to_string).unwrap_or_default())]
    Aggregate(Vec<DeviceError>),
}

/// Convenience result alias for program store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Convenience result alias for linker operations
pub type LinkResult<T> = std::result::Result<T, LinkError>;

/// Convenience result alias for interpreter operations
pub type InterpretResult<T> = std::result::Result<T, InterpretError>;

/// Convenience result alias for device operations
pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

/// Result type using the top-level [`Error`]
pub type Result<T> = std::result::Result<T, Error>;
