//! All errors that can be _generated_ by the compiler.
//!
//! Every error is typed (an enum variant per failure kind) so that callers
//! can branch on what went wrong instead of string-matching. Errors raised
//! against a source construct carry its line/column.

use std::fmt;

use thiserror::Error;

/// Line/column of a construct in the source text. Both are 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Location {
    pub line: u32,
    pub column: u32,
}

impl Location {
    pub fn new(line: u32, column: u32) -> Self {
        Location { line, column }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// Any error that occurs as a result of compiling a translation unit.
#[derive(Debug, Error)]
pub enum CompilationError {
    #[error("{0}")]
    Parse(#[from] ParseError),
    #[error("{0}")]
    Semantic(#[from] SemanticError),
    #[error("{0}")]
    Codegen(#[from] CodegenError),
}

/// A syntax error from the front end.
#[derive(Debug, Error)]
#[error("{location}: {message}")]
pub struct ParseError {
    pub message: String,
    pub location: Location,
}

impl ParseError {
    pub fn new(message: impl Into<String>, location: Location) -> Self {
        ParseError {
            message: message.into(),
            location,
        }
    }
}

/// A violation found by the semantic validator. Validation stops at the
/// first one; there is no recovery or accumulation.
#[derive(Debug, Error)]
#[error("{location}: {kind}")]
pub struct SemanticError {
    pub kind: SemanticErrorKind,
    pub location: Location,
}

impl SemanticError {
    pub fn new(kind: SemanticErrorKind, location: Location) -> Self {
        SemanticError { kind, location }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SemanticErrorKind {
    #[error("use of undeclared variable `{0}`")]
    UnresolvedVariable(String),
    #[error("`{0}` is already declared in this scope")]
    DuplicateDeclaration(String),
    #[error("`{keyword}` used outside of a loop")]
    InvalidLoopControl { keyword: &'static str },
    #[error("conflicting declarations of `{name}`: {expected} parameter(s) vs. {found}")]
    SignatureMismatch {
        name: String,
        expected: usize,
        found: usize,
    },
    #[error("too many arguments in call to `{name}`: expected {expected}, found {found}")]
    TooManyArguments {
        name: String,
        expected: usize,
        found: usize,
    },
    #[error("too few arguments in call to `{name}`: expected {expected}, found {found}")]
    TooFewArguments {
        name: String,
        expected: usize,
        found: usize,
    },
    #[error("call to undeclared function `{0}`")]
    UnresolvedFunction(String),
    #[error("parameter `{0}` is named more than once")]
    DuplicateParameter(String),
    #[error("initializer for global `{0}` is not a constant expression")]
    NonConstantGlobalInitializer(String),
    #[error("function `{0}` is defined more than once")]
    DuplicateFunctionDefinition(String),
    #[error("second `return` in the same block")]
    DuplicateReturn,
    #[error("`{0}` is used as both a function and a variable")]
    NameCollision(String),
}

/// A limitation hit while lowering a (semantically valid) program for a
/// particular target.
#[derive(Debug, Error)]
pub enum CodegenError {
    #[error(
        "call to `{name}` passes {found} argument(s), but the {target} \
         target supports at most {limit}"
    )]
    TooManyCallArguments {
        name: String,
        found: usize,
        limit: usize,
        target: &'static str,
    },
    #[error(
        "function `{name}` takes {found} parameter(s), but the {target} \
         target supports at most {limit}"
    )]
    TooManyParameters {
        name: String,
        found: usize,
        limit: usize,
        target: &'static str,
    },
}

/// A fault raised while interpreting a program directly. The generated
/// code for the same program would trap at run time on the same inputs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("division by zero")]
    DivisionByZero,
    #[error("integer overflow in division")]
    DivisionOverflow,
    #[error("`main` is not defined")]
    MissingMain,
    #[error("`main` must not take parameters")]
    MainHasParameters,
    #[error("variable `{0}` was read before the program was validated")]
    UnboundVariable(String),
    #[error("call to `{0}` does not name a defined function")]
    UnboundFunction(String),
}
