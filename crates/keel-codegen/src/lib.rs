// SPDX-License-Identifier: (MIT OR Apache-2.0)

//! Keel back-end: lowers checked ASTs to Cranelift IR and object code.
//!
//! The lowering layer walks procedure bodies statement by statement,
//! building a control-flow graph of regions (Cranelift blocks) and
//! translating the source type system's operations into the IR's much
//! smaller vocabulary. Instruction selection and object emission are
//! Cranelift's problem; everything upstream of the checked AST is the
//! front end's.

use std::error::Error;
use std::fmt;

mod arith;
mod convert;
mod expr;
mod memory;
mod module;
mod proc;
mod stmt;
mod value;

mod tests;

pub use module::{ModuleLowering, ModuleSymbol, SyncCache, TargetSpec};
pub use value::{Addr, AddrKind, Repr, Value};

/// Build mode for code generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildMode {
    /// Fast compilation, no optimizations.
    Debug,
    /// Optimized build.
    Release,
}

/// Errors during code generation.
///
/// `Internal` is the fatal class: the checker's contract was violated
/// and the module cannot be lowered. The others are environment
/// failures (unsupported host, object write).
#[derive(Debug, Clone)]
pub enum CodegenError {
    /// Checker handed us a construct the rule tables do not cover.
    Internal(String),
    /// Host/target machine cannot be configured.
    HostUnsupported(String),
    /// Cranelift rejected a function or data definition.
    Emit(String),
}

impl fmt::Display for CodegenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodegenError::Internal(msg) => write!(f, "internal consistency failure: {}", msg),
            CodegenError::HostUnsupported(msg) => write!(f, "host not supported: {}", msg),
            CodegenError::Emit(msg) => write!(f, "emission failed: {}", msg),
        }
    }
}

impl Error for CodegenError {}

impl From<keel_sem::SemError> for CodegenError {
    fn from(e: keel_sem::SemError) -> Self {
        CodegenError::Internal(e.to_string())
    }
}

pub type CodegenResult<T> = Result<T, CodegenError>;

/// Shorthand for the fatal class; call sites read as assertions.
pub(crate) fn internal_error<T>(msg: impl Into<String>) -> CodegenResult<T> {
    Err(CodegenError::Internal(msg.into()))
}
