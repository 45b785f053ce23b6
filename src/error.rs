//! Compile-time and run-time error types (§7, SPEC_FULL.md §A).
//!
//! Mirrors `examples/FuelLabs-fuel-vm/src/error.rs`'s shape: one
//! `thiserror`-derived enum per failure family, with a stable projection
//! onto the fixed status codes the language-agnostic API (§6.1) promises.

use thiserror::Error;

/// Stable status codes for `compile`/`compile_nd` (§6.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileStatus {
    Success,
    ErrParse,
    ErrInvalidArgType,
    ErrUnknownName,
    ErrUnsupported,
    ErrInternal,
}

/// Stable status codes for `eval`/`eval_nd` (§6.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalStatus {
    Success,
    ErrInvalidArg,
    ErrShape,
    ErrRuntime,
}

/// A diagnostic position in the source text, for parse/type errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourcePos {
    pub offset: usize,
    pub line: u32,
    pub column: u32,
}

impl std::fmt::Display for SourcePos {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// Errors raised while compiling source into an [`crate::plan::Expr`].
#[derive(Debug, Error)]
pub enum CompileError {
    /// Lexing or parsing failure at a specific position.
    #[error("parse error at {pos}: {message}")]
    Parse { pos: SourcePos, message: String },

    /// A type error: unpromotable operands, bitwise on float/complex,
    /// string mixed with numeric, invalid cast, etc.
    #[error("type error at {pos}: {message}")]
    InvalidArgType { pos: SourcePos, message: String },

    /// Reference to a variable or function name that was not declared.
    #[error("unknown name '{0}'")]
    UnknownName(String),

    /// A construct that is syntactically valid but not supported: nested
    /// reductions, a DSL path that may fall through without `return`, an
    /// unrecognized `me:` pragma key, an invalid string `item_size`.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// An invariant the compiler itself is responsible for was violated;
    /// should never be reachable from well-formed input.
    #[error("internal compiler error: {0}")]
    Internal(String),
}

impl CompileError {
    pub const fn status(&self) -> CompileStatus {
        match self {
            CompileError::Parse { .. } => CompileStatus::ErrParse,
            CompileError::InvalidArgType { .. } => CompileStatus::ErrInvalidArgType,
            CompileError::UnknownName(_) => CompileStatus::ErrUnknownName,
            CompileError::Unsupported(_) => CompileStatus::ErrUnsupported,
            CompileError::Internal(_) => CompileStatus::ErrInternal,
        }
    }

    /// Best-effort source position for diagnostics; `None` for errors that
    /// are not anchored to a source span.
    pub const fn pos(&self) -> Option<SourcePos> {
        match self {
            CompileError::Parse { pos, .. } | CompileError::InvalidArgType { pos, .. } => Some(*pos),
            _ => None,
        }
    }
}

/// Errors raised while evaluating a compiled [`crate::plan::Expr`].
#[derive(Debug, Error)]
pub enum EvalError {
    /// A caller-supplied argument (pointer, count, dtype) was invalid.
    #[error("invalid argument: {0}")]
    InvalidArg(String),

    /// An output buffer or block/chunk index did not match the plan's
    /// expected shape.
    #[error("shape error: expected {expected}, got {got}")]
    Shape { expected: String, got: String },

    /// A run-time failure during evaluation (e.g. integer division by
    /// zero), never fatal to the process.
    #[error("runtime error: {0}")]
    Runtime(String),
}

impl EvalError {
    pub const fn status(&self) -> EvalStatus {
        match self {
            EvalError::InvalidArg(_) => EvalStatus::ErrInvalidArg,
            EvalError::Shape { .. } => EvalStatus::ErrShape,
            EvalError::Runtime(_) => EvalStatus::ErrRuntime,
        }
    }
}
