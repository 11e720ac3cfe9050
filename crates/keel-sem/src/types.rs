// SPDX-License-Identifier: (MIT OR Apache-2.0)

//! Resolved type table - every type the checker can hand to the back-end,
//! with byte layout computed once at interning time.

use std::collections::HashMap;

/// Swizzle component count that still fits the inline index form.
pub const MAX_SWIZZLE_INLINE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeId(pub u32);

/// Byte order of an integer or float type.
///
/// `Native` follows the target; `Little`/`Big` are the explicit-endian
/// types whose in-memory representation is fixed regardless of target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endian {
    Native,
    Little,
    Big,
}

/// Physical arrangement of a structure-of-arrays aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SoaKind {
    /// Ordinary field-contiguous struct.
    None,
    /// Each field is a fixed array of the given length.
    Fixed(u64),
    /// Each field is a multi-pointer; one shared length field trails.
    Slice,
    /// Slice form plus a capacity field.
    Dynamic,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Field {
    pub name: String,
    pub ty: TypeId,
}

/// Type constructor. Interned in a [`TypeTable`]; identity of `TypeId`s
/// is the identity the conversion engine's rule 1 tests.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeKind {
    Void,
    Bool,
    Int { bits: u16, signed: bool, endian: Endian },
    Float { bits: u16, endian: Endian },
    /// Two-component float pair; `bits` is the per-component width.
    Complex { bits: u16 },
    /// Four-component float pack, stored xyzw with w the real part.
    Quaternion { bits: u16 },
    Pointer { elem: TypeId },
    MultiPointer { elem: TypeId },
    FuncPointer { params: Vec<TypeId>, results: Vec<TypeId> },
    RawPointer,
    /// Pointer + length, bytes. Layout-identical to `Slice` of u8.
    String,
    Slice { elem: TypeId },
    Array { elem: TypeId, len: u64 },
    /// data / len / cap / allocator, one word each.
    DynamicArray { elem: TypeId },
    /// Opaque two-word header; the runtime owns the representation.
    Map { key: TypeId, value: TypeId },
    Struct { fields: Vec<Field>, soa: SoaKind },
    Tuple { elems: Vec<TypeId> },
    /// Tagged union: payload at offset 0, tag after the payload block.
    /// `maybe_pointer` unions hold exactly one pointer-like variant and
    /// use the null pattern instead of a tag.
    Union { variants: Vec<TypeId>, maybe_pointer: bool },
    Enum { backing: TypeId },
    BitSet { backing: TypeId },
    Simd { elem: TypeId, lanes: u32 },
    /// Column-major. `rows`/`cols` are the logical shape.
    Matrix { elem: TypeId, rows: u32, cols: u32 },
    /// Stored as `base` (a signed or unsigned integer); 0 is the nil
    /// sentinel, any other value is an offset from the field's own
    /// address.
    RelativePointer { base: TypeId, pointee: TypeId },
    /// Offset-relative data pointer plus a length, both `base`-sized.
    RelativeSlice { base: TypeId, elem: TypeId },
    TypeIdent,
    /// Dynamic box: raw data pointer + type identifier.
    Any,
}

/// Computed layout, cached per interned type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub size: u64,
    pub align: u64,
    /// Byte offset per field, aggregates only (struct/tuple order).
    pub offsets: Vec<u64>,
    /// Union tag placement; `None` for untagged (maybe-pointer or
    /// zero-variant) unions and for every non-union type.
    pub tag_offset: Option<u64>,
    /// Whole-object bytewise equality is meaningful: no padding, no
    /// floats, no pointers-to-varying-identity inside.
    pub simple_compare: bool,
}

/// A named entry in the table. Distinct names intern to distinct ids
/// even over the same constructor, which is what makes rule-1 identity
/// a nominal test.
#[derive(Debug, Clone)]
pub struct Ty {
    pub kind: TypeKind,
    pub name: Option<String>,
}

/// The interning table. Built by the checker, read-only during lowering.
#[derive(Debug)]
pub struct TypeTable {
    entries: Vec<Ty>,
    layouts: Vec<Layout>,
    dedup: HashMap<(TypeKind, Option<String>), TypeId>,
    ptr_bytes: u64,
    little_endian: bool,
}

impl TypeTable {
    pub fn new(ptr_bytes: u64, little_endian: bool) -> Self {
        TypeTable {
            entries: Vec::new(),
            layouts: Vec::new(),
            dedup: HashMap::new(),
            ptr_bytes,
            little_endian,
        }
    }

    pub fn ptr_bytes(&self) -> u64 {
        self.ptr_bytes
    }

    pub fn little_endian(&self) -> bool {
        self.little_endian
    }

    pub fn intern(&mut self, kind: TypeKind) -> TypeId {
        self.intern_named(kind, None)
    }

    pub fn intern_named(&mut self, kind: TypeKind, name: Option<String>) -> TypeId {
        let key = (kind.clone(), name.clone());
        if let Some(&id) = self.dedup.get(&key) {
            return id;
        }
        let layout = self.compute_layout(&kind);
        let id = TypeId(self.entries.len() as u32);
        self.entries.push(Ty { kind, name });
        self.layouts.push(layout);
        self.dedup.insert(key, id);
        id
    }

    pub fn kind(&self, id: TypeId) -> &TypeKind {
        &self.entries[id.0 as usize].kind
    }

    pub fn name(&self, id: TypeId) -> Option<&str> {
        self.entries[id.0 as usize].name.as_deref()
    }

    pub fn layout(&self, id: TypeId) -> &Layout {
        &self.layouts[id.0 as usize]
    }

    pub fn size_of(&self, id: TypeId) -> u64 {
        self.layout(id).size
    }

    pub fn align_of(&self, id: TypeId) -> u64 {
        self.layout(id).align
    }

    /// Field offset within a struct/tuple, from the cached layout.
    pub fn offset_of(&self, id: TypeId, field: usize) -> u64 {
        self.layout(id).offsets[field]
    }

    /// Fallible field offset. Selector lowering goes through this so a
    /// malformed path surfaces as an error instead of a panic.
    pub fn field_offset(&self, id: TypeId, field: usize) -> Result<u64, crate::SemError> {
        self.layout(id)
            .offsets
            .get(field)
            .copied()
            .ok_or(crate::SemError::FieldOutOfRange { ty: id, index: field })
    }

    /// Strips enum wrappers down to the arithmetic core.
    pub fn core(&self, id: TypeId) -> TypeId {
        match *self.kind(id) {
            TypeKind::Enum { backing } => self.core(backing),
            _ => id,
        }
    }

    pub fn is_void(&self, id: TypeId) -> bool {
        matches!(self.kind(self.core(id)), TypeKind::Void)
    }

    pub fn is_bool(&self, id: TypeId) -> bool {
        matches!(self.kind(self.core(id)), TypeKind::Bool)
    }

    pub fn is_integer(&self, id: TypeId) -> bool {
        matches!(self.kind(self.core(id)), TypeKind::Int { .. })
    }

    pub fn is_float(&self, id: TypeId) -> bool {
        matches!(self.kind(self.core(id)), TypeKind::Float { .. })
    }

    pub fn is_unsigned(&self, id: TypeId) -> bool {
        matches!(
            self.kind(self.core(id)),
            TypeKind::Int { signed: false, .. }
                | TypeKind::RawPointer
                | TypeKind::Pointer { .. }
                | TypeKind::MultiPointer { .. }
                | TypeKind::TypeIdent
        )
    }

    /// Any pointer-shaped scalar: typed, multi, raw, or function.
    pub fn is_pointer_like(&self, id: TypeId) -> bool {
        matches!(
            self.kind(self.core(id)),
            TypeKind::Pointer { .. }
                | TypeKind::MultiPointer { .. }
                | TypeKind::RawPointer
                | TypeKind::FuncPointer { .. }
        )
    }

    /// Explicit byte order differing from the target's.
    pub fn is_foreign_endian(&self, id: TypeId) -> bool {
        let endian = match *self.kind(self.core(id)) {
            TypeKind::Int { endian, .. } | TypeKind::Float { endian, .. } => endian,
            _ => return false,
        };
        match endian {
            Endian::Native => false,
            Endian::Little => !self.little_endian,
            Endian::Big => self.little_endian,
        }
    }

    /// The native-order sibling of an explicit-endian scalar.
    pub fn native_order_of(&mut self, id: TypeId) -> TypeId {
        match *self.kind(self.core(id)) {
            TypeKind::Int { bits, signed, .. } => self.intern(TypeKind::Int {
                bits,
                signed,
                endian: Endian::Native,
            }),
            TypeKind::Float { bits, .. } => self.intern(TypeKind::Float {
                bits,
                endian: Endian::Native,
            }),
            _ => id,
        }
    }

    /// Types passed around by address rather than in a register:
    /// anything that does not fit the IR's scalar vocabulary.
    pub fn is_aggregate(&self, id: TypeId) -> bool {
        matches!(
            self.kind(self.core(id)),
            TypeKind::String
                | TypeKind::Slice { .. }
                | TypeKind::Array { .. }
                | TypeKind::DynamicArray { .. }
                | TypeKind::Map { .. }
                | TypeKind::Struct { .. }
                | TypeKind::Tuple { .. }
                | TypeKind::Union { .. }
                | TypeKind::Complex { .. }
                | TypeKind::Quaternion { .. }
                | TypeKind::Matrix { .. }
                | TypeKind::RelativeSlice { .. }
                | TypeKind::Any
        )
    }

    /// Array-shaped operand for lane-wise arithmetic: fixed arrays and
    /// SIMD vectors.
    pub fn is_array_like(&self, id: TypeId) -> bool {
        matches!(
            self.kind(self.core(id)),
            TypeKind::Array { .. } | TypeKind::Simd { .. }
        )
    }

    pub fn array_elem(&self, id: TypeId) -> Option<TypeId> {
        match *self.kind(self.core(id)) {
            TypeKind::Array { elem, .. }
            | TypeKind::Simd { elem, .. }
            | TypeKind::Slice { elem }
            | TypeKind::DynamicArray { elem } => Some(elem),
            _ => None,
        }
    }

    pub fn array_len(&self, id: TypeId) -> Option<u64> {
        match *self.kind(self.core(id)) {
            TypeKind::Array { len, .. } => Some(len),
            TypeKind::Simd { lanes, .. } => Some(lanes as u64),
            _ => None,
        }
    }

    pub fn pointer_elem(&self, id: TypeId) -> Option<TypeId> {
        match *self.kind(self.core(id)) {
            TypeKind::Pointer { elem } | TypeKind::MultiPointer { elem } => Some(elem),
            TypeKind::RelativePointer { pointee, .. } => Some(pointee),
            _ => None,
        }
    }

    /// Integer type a bit-set's operations run over.
    pub fn bit_set_backing(&self, id: TypeId) -> Option<TypeId> {
        match *self.kind(self.core(id)) {
            TypeKind::BitSet { backing } => Some(backing),
            _ => None,
        }
    }

    /// Index of the union variant whose type is identical to `variant`,
    /// counted from 1 (tag value 0 is nil).
    pub fn union_variant_index(&self, union_ty: TypeId, variant: TypeId) -> Option<u64> {
        match self.kind(self.core(union_ty)) {
            TypeKind::Union { variants, .. } => variants
                .iter()
                .position(|&v| v == variant)
                .map(|i| i as u64 + 1),
            _ => None,
        }
    }

    fn scalar_layout(size: u64) -> Layout {
        Layout {
            size,
            align: size.clamp(1, 8),
            offsets: Vec::new(),
            tag_offset: None,
            simple_compare: true,
        }
    }

    fn compute_layout(&self, kind: &TypeKind) -> Layout {
        let word = self.ptr_bytes;
        match kind {
            TypeKind::Void => Layout {
                size: 0,
                align: 1,
                offsets: Vec::new(),
                tag_offset: None,
                simple_compare: true,
            },
            TypeKind::Bool => Self::scalar_layout(1),
            TypeKind::Int { bits, .. } => Self::scalar_layout(*bits as u64 / 8),
            TypeKind::Float { bits, .. } => {
                let mut l = Self::scalar_layout(*bits as u64 / 8);
                l.simple_compare = false;
                l
            }
            TypeKind::Complex { bits } => {
                let comp = *bits as u64 / 8;
                Layout {
                    size: comp * 2,
                    align: comp.clamp(1, 8),
                    offsets: vec![0, comp],
                    tag_offset: None,
                    simple_compare: false,
                }
            }
            TypeKind::Quaternion { bits } => {
                let comp = *bits as u64 / 8;
                Layout {
                    size: comp * 4,
                    align: comp.clamp(1, 8),
                    offsets: vec![0, comp, comp * 2, comp * 3],
                    tag_offset: None,
                    simple_compare: false,
                }
            }
            TypeKind::Pointer { .. }
            | TypeKind::MultiPointer { .. }
            | TypeKind::FuncPointer { .. }
            | TypeKind::RawPointer
            | TypeKind::TypeIdent => Self::scalar_layout(word),
            TypeKind::String | TypeKind::Slice { .. } => Layout {
                size: word * 2,
                align: word,
                offsets: vec![0, word],
                tag_offset: None,
                simple_compare: false,
            },
            TypeKind::Any => Layout {
                size: word * 2,
                align: word,
                offsets: vec![0, word],
                tag_offset: None,
                simple_compare: false,
            },
            TypeKind::DynamicArray { .. } => Layout {
                size: word * 4,
                align: word,
                offsets: vec![0, word, word * 2, word * 3],
                tag_offset: None,
                simple_compare: false,
            },
            TypeKind::Map { .. } => Layout {
                size: word * 2,
                align: word,
                offsets: vec![0, word],
                tag_offset: None,
                simple_compare: false,
            },
            TypeKind::Array { elem, len } => {
                let el = self.layout(*elem);
                Layout {
                    size: el.size * len,
                    align: el.align,
                    offsets: Vec::new(),
                    tag_offset: None,
                    simple_compare: el.simple_compare,
                }
            }
            TypeKind::Simd { elem, lanes } => {
                let el = self.layout(*elem);
                let size = el.size * *lanes as u64;
                Layout {
                    size,
                    align: size.min(16).max(el.align),
                    offsets: Vec::new(),
                    tag_offset: None,
                    simple_compare: el.simple_compare,
                }
            }
            TypeKind::Matrix { elem, rows, cols } => {
                let el = self.layout(*elem);
                Layout {
                    size: el.size * *rows as u64 * *cols as u64,
                    // doubled so column strides stay vector-load friendly
                    align: (el.align * 2).min(16),
                    offsets: Vec::new(),
                    tag_offset: None,
                    simple_compare: el.simple_compare,
                }
            }
            TypeKind::Struct { fields, soa } => {
                if *soa != SoaKind::None {
                    return self.soa_layout(fields, *soa);
                }
                self.record_layout(fields.iter().map(|f| f.ty))
            }
            TypeKind::Tuple { elems } => self.record_layout(elems.iter().copied()),
            TypeKind::Union {
                variants,
                maybe_pointer,
            } => {
                if *maybe_pointer {
                    return Layout {
                        size: word,
                        align: word,
                        offsets: Vec::new(),
                        tag_offset: None,
                        simple_compare: false,
                    };
                }
                let mut payload = 0u64;
                let mut align = 1u64;
                for &v in variants {
                    let vl = self.layout(v);
                    payload = payload.max(vl.size);
                    align = align.max(vl.align);
                }
                if variants.is_empty() {
                    return Layout {
                        size: 0,
                        align: 1,
                        offsets: Vec::new(),
                        tag_offset: None,
                        simple_compare: true,
                    };
                }
                let tag_size = if variants.len() >= 256 { 2 } else { 1 };
                let tag_offset = align_up(payload, tag_size);
                Layout {
                    size: align_up(tag_offset + tag_size, align),
                    align,
                    offsets: Vec::new(),
                    tag_offset: Some(tag_offset),
                    simple_compare: false,
                }
            }
            TypeKind::Enum { backing } | TypeKind::BitSet { backing } => {
                let bl = self.layout(*backing);
                Layout {
                    size: bl.size,
                    align: bl.align,
                    offsets: Vec::new(),
                    tag_offset: None,
                    simple_compare: true,
                }
            }
            TypeKind::RelativePointer { base, .. } => {
                let bl = self.layout(*base);
                Layout {
                    size: bl.size,
                    align: bl.align,
                    offsets: Vec::new(),
                    tag_offset: None,
                    simple_compare: false,
                }
            }
            TypeKind::RelativeSlice { base, .. } => {
                let bl = self.layout(*base);
                Layout {
                    size: bl.size * 2,
                    align: bl.align,
                    offsets: vec![0, bl.size],
                    tag_offset: None,
                    simple_compare: false,
                }
            }
        }
    }

    fn record_layout(&self, fields: impl Iterator<Item = TypeId>) -> Layout {
        let mut offsets = Vec::new();
        let mut offset = 0u64;
        let mut align = 1u64;
        let mut packed = 0u64;
        let mut simple = true;
        for ty in fields {
            let fl = self.layout(ty);
            align = align.max(fl.align);
            offset = align_up(offset, fl.align);
            offsets.push(offset);
            offset += fl.size;
            packed += fl.size;
            simple &= fl.simple_compare;
        }
        let size = align_up(offset, align);
        Layout {
            size,
            align,
            offsets,
            tag_offset: None,
            // padding bytes are unspecified, so bytewise equality needs
            // a padding-free layout
            simple_compare: simple && packed == size,
        }
    }

    /// SoA structs lay each logical field out as its own backing array
    /// (fixed form) or multi-pointer, with length/capacity words after
    /// the field block for the slice/dynamic forms.
    fn soa_layout(&self, fields: &[Field], soa: SoaKind) -> Layout {
        let word = self.ptr_bytes;
        let mut offsets = Vec::new();
        let mut offset = 0u64;
        let mut align = word;
        match soa {
            SoaKind::Fixed(len) => {
                for f in fields {
                    let fl = self.layout(f.ty);
                    align = align.max(fl.align);
                    offset = align_up(offset, fl.align);
                    offsets.push(offset);
                    offset += fl.size * len;
                }
            }
            SoaKind::Slice | SoaKind::Dynamic => {
                for _ in fields {
                    offsets.push(offset);
                    offset += word;
                }
                // shared length (and capacity) trail the pointer block
                offsets.push(offset);
                offset += word;
                if soa == SoaKind::Dynamic {
                    offsets.push(offset);
                    offset += word;
                }
            }
            SoaKind::None => unreachable!("plain structs use record_layout"),
        }
        Layout {
            size: align_up(offset, align),
            align,
            offsets,
            tag_offset: None,
            simple_compare: false,
        }
    }
}

fn align_up(v: u64, align: u64) -> u64 {
    (v + align - 1) & !(align - 1)
}
