// SPDX-License-Identifier: (MIT OR Apache-2.0)

//! Checked AST nodes.
//!
//! These are the post-checker shapes: every expression carries its
//! resolved type, addressing mode, folded constant (when constant) and
//! check-flag overrides. Identifiers are resolved to entities, field
//! accesses to selector paths, implicit conversions to explicit nodes.

use crate::const_value::ConstValue;
use crate::entity::EntityId;
use crate::types::TypeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExprId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StmtId(pub u32);

/// Source position, pre-resolved to line:column by the front end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub line: u32,
    pub col: u32,
}

/// Addressing-mode classification the checker assigns to every
/// expression. The back-end dispatches on it and asserts on the
/// combinations it must never receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Invalid,
    NoValue,
    /// Computed rvalue.
    Value,
    /// Addressable lvalue.
    Variable,
    Constant,
    /// Type-only expression (e.g. a type operand of an assertion).
    Type,
}

/// Lexically scoped check toggles. `None` inherits from the enclosing
/// statement; the procedure root starts with everything enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StateFlags {
    pub bounds_check: Option<bool>,
    pub type_assert: Option<bool>,
}

impl StateFlags {
    pub const INHERIT: StateFlags = StateFlags {
        bounds_check: None,
        type_assert: None,
    };

    /// Child overrides win where set; parent state fills the rest.
    pub fn merge(self, child: StateFlags) -> StateFlags {
        StateFlags {
            bounds_check: child.bounds_check.or(self.bounds_check),
            type_assert: child.type_assert.or(self.type_assert),
        }
    }

    pub fn bounds_enabled(self) -> bool {
        self.bounds_check.unwrap_or(true)
    }

    pub fn type_assert_enabled(self) -> bool {
        self.type_assert.unwrap_or(true)
    }
}

/// One hop of a checker-computed selector path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelStep {
    /// Struct/tuple field by declaration index. Pointer-typed
    /// intermediates are dereferenced implicitly during projection.
    Field(usize),
    /// The union's tag slot.
    UnionTag,
}

/// A resolved multi-hop field selection, including embedding chains.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Selection {
    pub steps: Vec<SelStep>,
}

impl Selection {
    pub fn field(index: usize) -> Self {
        Selection {
            steps: vec![SelStep::Field(index)],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Label(pub String);

/// An expression in the checked AST.
#[derive(Debug, Clone)]
pub struct Expr {
    pub id: ExprId,
    pub kind: ExprKind,
    pub ty: TypeId,
    pub mode: Mode,
    /// Folded literal; present exactly when `mode` is `Constant`.
    pub value: Option<ConstValue>,
    pub flags: StateFlags,
    pub span: Span,
}

/// The kind of checked expression.
#[derive(Debug, Clone)]
pub enum ExprKind {
    /// Literal; the folded value lives in `Expr::value`.
    Lit,
    /// Resolved identifier.
    Ident(EntityId),
    /// The implicit context record.
    ContextRef,
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Unary {
        op: UnOp,
        operand: Box<Expr>,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    /// Back-end intrinsic; arguments already converted.
    Intrinsic {
        op: IntrinsicOp,
        args: Vec<Expr>,
    },
    /// Container indexing. Maps included; those lower to keyed
    /// addresses, not pointer arithmetic.
    Index {
        base: Box<Expr>,
        index: Box<Expr>,
    },
    /// `base[lo:hi]`; either bound may be elided.
    SliceExpr {
        base: Box<Expr>,
        lo: Option<Box<Expr>>,
        hi: Option<Box<Expr>>,
    },
    /// Field access along a resolved path.
    Selector {
        base: Box<Expr>,
        sel: Selection,
    },
    /// Array-of-scalars component permutation, e.g. `v.zyx`.
    Swizzle {
        base: Box<Expr>,
        indices: Vec<u8>,
    },
    Deref {
        base: Box<Expr>,
    },
    /// `&x`; operand mode is `Variable`.
    AddressOf {
        base: Box<Expr>,
    },
    /// Checked conversion to `Expr::ty` (explicit cast or an implicit
    /// conversion made explicit by the checker).
    Convert {
        operand: Box<Expr>,
    },
    /// Same-size bit reinterpretation to `Expr::ty`.
    Transmute {
        operand: Box<Expr>,
    },
    /// Union/any narrowing to `Expr::ty`. `with_ok` makes it the
    /// two-value form yielding (value, ok) instead of trapping.
    TypeAssert {
        operand: Box<Expr>,
        with_ok: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    /// Truncated remainder.
    Mod,
    /// Floored remainder.
    ModFloor,
    BitAnd,
    BitOr,
    BitXor,
    /// `and-not`: lhs & !rhs; doubles as bit-set difference.
    AndNot,
    Shl,
    Shr,
    /// Short-circuit forms; lowered as control flow, not data flow.
    And,
    Or,
    Eq,
    NotEq,
    Lt,
    Gt,
    LtEq,
    GtEq,
}

impl BinOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::NotEq | BinOp::Lt | BinOp::Gt | BinOp::LtEq | BinOp::GtEq
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    /// Numeric negation.
    Neg,
    /// Boolean not.
    Not,
    /// Bitwise complement.
    BitNot,
}

/// Intrinsics the back-end lowers directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntrinsicOp {
    Len,
    CountOnes,
    LeadingZeros,
    TrailingZeros,
    /// Always a runtime call, even on constants; see DESIGN notes.
    ReverseBits,
}

/// A statement in the checked AST.
#[derive(Debug, Clone)]
pub struct Stmt {
    pub id: StmtId,
    pub kind: StmtKind,
    pub flags: StateFlags,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub enum StmtKind {
    Expr(Expr),
    /// Mutable declaration. Zero inits means zero-initialize; otherwise
    /// inits flatten (multi-results expand) to one value per entity.
    Decl {
        entities: Vec<EntityId>,
        inits: Vec<Expr>,
    },
    Assign {
        op: AssignOp,
        lhs: Vec<Expr>,
        rhs: Vec<Expr>,
    },
    Block {
        label: Option<Label>,
        body: Vec<Stmt>,
    },
    If {
        label: Option<Label>,
        init: Option<Box<Stmt>>,
        cond: Expr,
        then_body: Vec<Stmt>,
        else_stmt: Option<Box<Stmt>>,
    },
    For {
        label: Option<Label>,
        init: Option<Box<Stmt>>,
        cond: Option<Expr>,
        post: Option<Box<Stmt>>,
        body: Vec<Stmt>,
    },
    /// `for v, i in lo ..< hi` / `..= hi`.
    RangeInterval {
        label: Option<Label>,
        value: Option<EntityId>,
        index: Option<EntityId>,
        lo: Expr,
        hi: Expr,
        kind: RangeKind,
        body: Vec<Stmt>,
    },
    /// `for v, i in container`, forward or reverse.
    RangeContainer {
        label: Option<Label>,
        value: Option<EntityId>,
        index: Option<EntityId>,
        container: Expr,
        reverse: bool,
        body: Vec<Stmt>,
    },
    Switch {
        label: Option<Label>,
        init: Option<Box<Stmt>>,
        /// Absent tag switches on `true` (an if-else chain in disguise).
        tag: Option<Expr>,
        cases: Vec<SwitchCase>,
    },
    Return {
        results: Vec<Expr>,
    },
    Branch {
        kind: BranchKind,
        label: Option<Label>,
    },
    Defer {
        stmt: Box<Stmt>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    Plain,
    /// `lhs op= rhs`; `And`/`Or` are the short-circuit forms.
    Compound(BinOp),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchKind {
    Break,
    Continue,
    Fallthrough,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeKind {
    /// `lo ..< hi`
    HalfOpen,
    /// `lo ..= hi`; carries the wrap guard on the increment path.
    Closed,
}

/// One switch clause. Empty `values` marks the default clause.
#[derive(Debug, Clone)]
pub struct SwitchCase {
    pub values: Vec<CaseValue>,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone)]
pub enum CaseValue {
    Expr(Expr),
    Range {
        lo: Expr,
        hi: Expr,
        kind: RangeKind,
    },
}
