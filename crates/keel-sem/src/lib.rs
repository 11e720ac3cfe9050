// SPDX-License-Identifier: (MIT OR Apache-2.0)

//! Checker contract for the Keel back-end.
//!
//! Everything the lowering layer consumes arrives through this crate:
//! resolved types with computed layout, folded constants, checked
//! expressions and statements with addressing modes and selector paths.
//! No inference happens here; the structures are the frozen output of
//! the front half of the compiler.

mod ast;
mod const_value;
mod entity;
mod types;

mod tests;

pub use ast::{
    AssignOp, BinOp, BranchKind, CaseValue, Expr, ExprId, ExprKind, IntrinsicOp, Label, Mode,
    RangeKind, SelStep, Selection, Span, StateFlags, Stmt, StmtId, StmtKind, SwitchCase, UnOp,
};
pub use const_value::ConstValue;
pub use entity::{CheckedModule, Entity, EntityId, EntityKind, Procedure, ProcedureId, Signature};
pub use types::{
    Endian, Field, Layout, SoaKind, Ty, TypeId, TypeKind, TypeTable, MAX_SWIZZLE_INLINE,
};

/// Contract violations observed while consuming checker output.
///
/// These are front-end bugs by definition; the back-end surfaces them
/// and aborts rather than attempting recovery.
#[derive(Debug, thiserror::Error)]
pub enum SemError {
    #[error("field index {index} out of range for type {ty:?}")]
    FieldOutOfRange { ty: TypeId, index: usize },
    #[error("entity {0:?} is not bound")]
    UnboundEntity(EntityId),
}
