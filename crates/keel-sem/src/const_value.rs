// SPDX-License-Identifier: (MIT OR Apache-2.0)

//! Folded constant values, produced by the checker's constant evaluator.

/// A fully folded literal. The back-end materializes these verbatim and
/// never re-evaluates; constant arithmetic happened upstream.
#[derive(Debug, Clone, PartialEq)]
pub enum ConstValue {
    /// Untyped `nil`: converts to the zero representation of any type.
    Nil,
    /// Untyped `---`: deliberately uninitialized, lowers to poison/zero.
    Uninit,
    Bool(bool),
    /// Sign-agnostic bit pattern; the expression's type decides how the
    /// low `bits` are read.
    Int(i128),
    Float(f64),
    Str(String),
    /// One element per field/lane/component, in declaration order.
    /// Missing trailing elements are zero.
    Aggregate(Vec<ConstValue>),
}

impl ConstValue {
    pub fn is_zero(&self) -> bool {
        match self {
            ConstValue::Nil => true,
            ConstValue::Uninit => false,
            ConstValue::Bool(b) => !b,
            ConstValue::Int(v) => *v == 0,
            ConstValue::Float(v) => *v == 0.0,
            ConstValue::Str(s) => s.is_empty(),
            ConstValue::Aggregate(elems) => elems.iter().all(ConstValue::is_zero),
        }
    }

    pub fn as_int(&self) -> Option<i128> {
        match self {
            ConstValue::Int(v) => Some(*v),
            ConstValue::Bool(b) => Some(*b as i128),
            _ => None,
        }
    }
}
