// SPDX-License-Identifier: (MIT OR Apache-2.0)

//! The two-sorted value model: register values and addressable storage.
//!
//! Every expression lowers to exactly one [`Value`]; every lvalue lowers
//! to exactly one [`Addr`]. The addressing-mode variants above `Addr`
//! carry the per-kind payloads their load/store protocols need; none of
//! them shares a field it does not use.

use cranelift_codegen::ir;
use keel_sem::{EntityId, Selection, TypeId};

use crate::{internal_error, CodegenResult};

/// How a lowered expression's result is represented.
#[derive(Debug, Clone, PartialEq)]
pub enum Repr {
    /// A computed value in an IR data-flow edge; not addressable.
    Register(ir::Value),
    /// A pointer-typed edge referencing storage of the carried type.
    Address(ir::Value),
    /// A module symbol not yet materialized into the data flow. The
    /// unresolved state of the two-state symbol protocol; resolving it
    /// (at first data-flow use) produces an `Address`.
    Symbol(EntityId),
    /// Ordered results of a multi-result operation. Only legal as the
    /// immediate source of a multi-assignment or result flattening.
    Multi(Vec<Value>),
}

/// The result of lowering one expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Value {
    pub repr: Repr,
    /// Static type; always the checked type of the source expression,
    /// except across an explicit same-size transmute.
    pub ty: TypeId,
}

impl Value {
    pub fn register(node: ir::Value, ty: TypeId) -> Value {
        Value {
            repr: Repr::Register(node),
            ty,
        }
    }

    pub fn address(ptr: ir::Value, ty: TypeId) -> Value {
        Value {
            repr: Repr::Address(ptr),
            ty,
        }
    }

    pub fn symbol(entity: EntityId, ty: TypeId) -> Value {
        Value {
            repr: Repr::Symbol(entity),
            ty,
        }
    }

    pub fn multi(parts: Vec<Value>, ty: TypeId) -> Value {
        Value {
            repr: Repr::Multi(parts),
            ty,
        }
    }

    pub fn is_multi(&self) -> bool {
        matches!(self.repr, Repr::Multi(_))
    }

    /// The raw IR edge of a register value.
    pub fn as_register(&self) -> CodegenResult<ir::Value> {
        match self.repr {
            Repr::Register(v) => Ok(v),
            _ => internal_error(format!("expected register value, found {:?}", self.repr)),
        }
    }

    /// The raw pointer edge of an address value.
    pub fn as_address(&self) -> CodegenResult<ir::Value> {
        match self.repr {
            Repr::Address(p) => Ok(p),
            _ => internal_error(format!("expected address value, found {:?}", self.repr)),
        }
    }

    /// Either sort's underlying edge; symbols and multis have none.
    pub fn ir_node(&self) -> CodegenResult<ir::Value> {
        match self.repr {
            Repr::Register(v) | Repr::Address(v) => Ok(v),
            _ => internal_error("symbol/multi value has no IR node yet"),
        }
    }
}

/// A handle to storage. The kind decides the load/store protocol; the
/// "addressable type" used to check stores is derived per kind, not by
/// blindly dereferencing the base pointer.
#[derive(Debug, Clone, PartialEq)]
pub enum Addr {
    /// A plain pointer; load/store are direct memory operations.
    Default { base: Value },
    /// Map + key; load compiles to a lookup, store to an insert.
    Map {
        base: Value,
        key: Box<Value>,
        value_ty: TypeId,
    },
    /// Field path into the implicit context record; stores go through
    /// the copy-on-write protocol.
    Context {
        base: Value,
        sel: Selection,
        field_ty: TypeId,
    },
    /// Logical element of a structure-of-arrays aggregate; load/store
    /// gather/scatter across the per-field backing arrays.
    Soa {
        base: Value,
        index: Box<Value>,
        elem_ty: TypeId,
    },
    /// Storage holding a self-relative offset instead of an absolute
    /// address. `deref` marks the pre-dereferenced form whose stores
    /// write through the computed pointer.
    RelativePointer { base: Value, deref: bool },
    RelativeSlice { base: Value },
    /// Component permutation over an array-of-scalars lvalue, inline
    /// index form (at most [`keel_sem::MAX_SWIZZLE_INLINE`] lanes).
    Swizzle {
        base: Value,
        result_ty: TypeId,
        count: u8,
        indices: [u8; 4],
    },
    /// Permutation too wide for the inline form.
    SwizzleLarge {
        base: Value,
        result_ty: TypeId,
        indices: Vec<u16>,
    },
}

impl Addr {
    pub fn plain(base: Value) -> Addr {
        Addr::Default { base }
    }

    pub fn base(&self) -> &Value {
        match self {
            Addr::Default { base }
            | Addr::Map { base, .. }
            | Addr::Context { base, .. }
            | Addr::Soa { base, .. }
            | Addr::RelativePointer { base, .. }
            | Addr::RelativeSlice { base }
            | Addr::Swizzle { base, .. }
            | Addr::SwizzleLarge { base, .. } => base,
        }
    }

    pub fn into_base(self) -> Value {
        match self {
            Addr::Default { base }
            | Addr::Map { base, .. }
            | Addr::Context { base, .. }
            | Addr::Soa { base, .. }
            | Addr::RelativePointer { base, .. }
            | Addr::RelativeSlice { base }
            | Addr::Swizzle { base, .. }
            | Addr::SwizzleLarge { base, .. } => base,
        }
    }

    /// The type a load yields and a store must provide.
    pub fn addressable_ty(&self, types: &keel_sem::TypeTable) -> CodegenResult<TypeId> {
        match self {
            Addr::Default { base } | Addr::RelativeSlice { base } => addressed_ty(types, base),
            Addr::Map { value_ty, .. } => Ok(*value_ty),
            Addr::Context { field_ty, .. } => Ok(*field_ty),
            Addr::Soa { elem_ty, .. } => Ok(*elem_ty),
            Addr::RelativePointer { base, deref } => {
                let rel = addressed_ty(types, base)?;
                if *deref {
                    match types.pointer_elem(rel) {
                        Some(elem) => Ok(elem),
                        None => internal_error("relative pointer does not point at a pointer"),
                    }
                } else {
                    Ok(rel)
                }
            }
            Addr::Swizzle { result_ty, .. } | Addr::SwizzleLarge { result_ty, .. } => {
                Ok(*result_ty)
            }
        }
    }
}

/// The stored type a base value addresses. `Address` and `Symbol`
/// values carry it directly; a register base is a pointer rvalue whose
/// type is dereferenced instead.
pub(crate) fn addressed_ty(types: &keel_sem::TypeTable, base: &Value) -> CodegenResult<TypeId> {
    match base.repr {
        Repr::Address(_) | Repr::Symbol(_) => Ok(base.ty),
        Repr::Register(_) => match types.pointer_elem(base.ty) {
            Some(elem) => Ok(elem),
            None => internal_error("address base register is not pointer-typed"),
        },
        Repr::Multi(_) => internal_error("multi value cannot base an address"),
    }
}

/// The IR register type a scalar lowers to, or `None` for types that
/// travel by address. This is the single authority the ABI and the
/// emitters consult when sorting values into the two representations.
pub(crate) fn register_ty(
    types: &keel_sem::TypeTable,
    ptr_ty: ir::Type,
    ty: TypeId,
) -> Option<ir::Type> {
    use keel_sem::TypeKind;
    match *types.kind(types.core(ty)) {
        TypeKind::Bool => Some(ir::types::I8),
        TypeKind::Int { bits, .. } => int_register_ty(u64::from(bits) / 8),
        TypeKind::Float { bits, .. } => match bits {
            32 => Some(ir::types::F32),
            64 => Some(ir::types::F64),
            _ => None,
        },
        TypeKind::Pointer { .. }
        | TypeKind::MultiPointer { .. }
        | TypeKind::FuncPointer { .. }
        | TypeKind::RawPointer
        | TypeKind::TypeIdent => Some(ptr_ty),
        TypeKind::BitSet { backing } => register_ty(types, ptr_ty, backing),
        // register form is the resolved absolute pointer, not the
        // stored offset
        TypeKind::RelativePointer { .. } => Some(ptr_ty),
        TypeKind::Simd { elem, lanes } => {
            let lane = register_ty(types, ptr_ty, elem)?;
            lane.by(lanes)
        }
        _ => None,
    }
}

/// Integer register type for a byte width, if the IR has one.
pub(crate) fn int_register_ty(bytes: u64) -> Option<ir::Type> {
    match bytes {
        1 => Some(ir::types::I8),
        2 => Some(ir::types::I16),
        4 => Some(ir::types::I32),
        8 => Some(ir::types::I64),
        16 => Some(ir::types::I128),
        _ => None,
    }
}

/// Discriminant-only view of [`Addr`], for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrKind {
    Default,
    Map,
    Context,
    Soa,
    RelativePointer,
    RelativeSlice,
    Swizzle,
    SwizzleLarge,
}

impl Addr {
    pub fn kind(&self) -> AddrKind {
        match self {
            Addr::Default { .. } => AddrKind::Default,
            Addr::Map { .. } => AddrKind::Map,
            Addr::Context { .. } => AddrKind::Context,
            Addr::Soa { .. } => AddrKind::Soa,
            Addr::RelativePointer { .. } => AddrKind::RelativePointer,
            Addr::RelativeSlice { .. } => AddrKind::RelativeSlice,
            Addr::Swizzle { .. } => AddrKind::Swizzle,
            Addr::SwizzleLarge { .. } => AddrKind::SwizzleLarge,
        }
    }
}
