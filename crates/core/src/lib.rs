//! Compiler internals for a tiny, integer-only C subset.
//!
//! The whole language fits in one sentence — `int` variables, functions,
//! the usual control flow, short-circuit logic, ternaries — which keeps
//! the interesting part in the passes rather than the grammar:
//!
//!  - source text is tokenized and parsed into a [Program](ast::Program)
//!    syntax tree
//!  - the [validator](validate) resolves every name, assigns storage
//!    slots and loop ids in place, and rejects ill-formed programs
//!  - the optional [constant folder](optimize) rewrites constant subtrees
//!    to literals
//!  - the same validated tree then goes one of two ways: the
//!    [code generator](codegen) drives one of three backends (x86-64
//!    assembly, AArch64 assembly, or a stack bytecode), or the
//!    [interpreter](interpret) executes it directly and serves as the
//!    semantics oracle the generated code is checked against.
//!
//! Every pass allocates its own state, so compiling twice from one
//! process never needs a reset.

pub mod ast;
pub mod codegen;
pub mod errors;
pub mod eval;
pub mod interpret;
pub mod optimize;
pub mod parsing;
pub mod tokenizer;
pub mod validate;

mod asm;
mod bytecode;

pub use crate::codegen::Target;
pub use crate::errors::{CompilationError, RuntimeError};

/// Parse and validate one translation unit, folding constants unless told
/// otherwise. The returned tree is ready for [codegen::generate] or
/// [interpret::interpret].
pub fn frontend(
    source: &str,
    name: &str,
    fold: bool,
) -> Result<ast::Program, CompilationError> {
    let mut program = parsing::parse(source, name)?;
    validate::validate(&mut program)?;
    if fold {
        let folds = optimize::fold(&mut program);
        tracing::debug!(program = %program.name, folds, "constant folding complete");
    }
    Ok(program)
}

/// Compile source text straight to target code.
pub fn compile(
    source: &str,
    name: &str,
    target: Target,
    fold: bool,
) -> Result<String, CompilationError> {
    let program = frontend(source, name, fold)?;
    Ok(codegen::generate(&program, target)?)
}
