// SPDX-License-Identifier: (MIT OR Apache-2.0)

//! Contract tests: layout computation and flag merging.

#[cfg(test)]
mod tests {
    use crate::types::{Endian, Field, SoaKind, TypeKind, TypeTable};
    use crate::StateFlags;

    fn table() -> TypeTable {
        TypeTable::new(8, true)
    }

    fn int(bits: u16, signed: bool) -> TypeKind {
        TypeKind::Int {
            bits,
            signed,
            endian: Endian::Native,
        }
    }

    // ═══════════════════════════════════════════════════════════
    // Layout
    // ═══════════════════════════════════════════════════════════

    #[test]
    fn scalar_sizes() {
        let mut t = table();
        let i8t = t.intern(int(8, true));
        let i32t = t.intern(int(32, true));
        let i128t = t.intern(int(128, true));
        let f64t = t.intern(TypeKind::Float {
            bits: 64,
            endian: Endian::Native,
        });
        assert_eq!(t.size_of(i8t), 1);
        assert_eq!(t.size_of(i32t), 4);
        assert_eq!(t.align_of(i32t), 4);
        assert_eq!(t.size_of(i128t), 16);
        assert_eq!(t.align_of(i128t), 8);
        assert_eq!(t.size_of(f64t), 8);
    }

    #[test]
    fn struct_offsets_respect_alignment() {
        let mut t = table();
        let u8t = t.intern(int(8, false));
        let i64t = t.intern(int(64, true));
        let s = t.intern(TypeKind::Struct {
            fields: vec![
                Field { name: "a".into(), ty: u8t },
                Field { name: "b".into(), ty: i64t },
            ],
            soa: SoaKind::None,
        });
        assert_eq!(t.offset_of(s, 0), 0);
        assert_eq!(t.offset_of(s, 1), 8);
        assert_eq!(t.size_of(s), 16);
        assert_eq!(t.align_of(s), 8);
        // 7 padding bytes between a and b
        assert!(!t.layout(s).simple_compare);
    }

    #[test]
    fn packed_struct_is_simple_compare() {
        let mut t = table();
        let i32t = t.intern(int(32, true));
        let s = t.intern(TypeKind::Struct {
            fields: vec![
                Field { name: "x".into(), ty: i32t },
                Field { name: "y".into(), ty: i32t },
            ],
            soa: SoaKind::None,
        });
        assert!(t.layout(s).simple_compare);
    }

    #[test]
    fn union_tag_after_payload() {
        let mut t = table();
        let i32t = t.intern(int(32, true));
        let i64t = t.intern(int(64, true));
        let u = t.intern(TypeKind::Union {
            variants: vec![i32t, i64t],
            maybe_pointer: false,
        });
        let l = t.layout(u);
        assert_eq!(l.tag_offset, Some(8));
        assert_eq!(l.size, 16);
        assert_eq!(t.union_variant_index(u, i32t), Some(1));
        assert_eq!(t.union_variant_index(u, i64t), Some(2));
    }

    #[test]
    fn maybe_pointer_union_is_one_word() {
        let mut t = table();
        let i32t = t.intern(int(32, true));
        let p = t.intern(TypeKind::Pointer { elem: i32t });
        let u = t.intern(TypeKind::Union {
            variants: vec![p],
            maybe_pointer: true,
        });
        let l = t.layout(u);
        assert_eq!(l.size, 8);
        assert_eq!(l.tag_offset, None);
    }

    #[test]
    fn soa_fixed_layout_has_per_field_arrays() {
        let mut t = table();
        let f32t = t.intern(TypeKind::Float {
            bits: 32,
            endian: Endian::Native,
        });
        let s = t.intern(TypeKind::Struct {
            fields: vec![
                Field { name: "x".into(), ty: f32t },
                Field { name: "y".into(), ty: f32t },
            ],
            soa: SoaKind::Fixed(8),
        });
        // x backing array: 8 * 4 bytes, then y's
        assert_eq!(t.offset_of(s, 0), 0);
        assert_eq!(t.offset_of(s, 1), 32);
        assert_eq!(t.size_of(s), 64);
    }

    #[test]
    fn soa_slice_layout_trails_length() {
        let mut t = table();
        let f32t = t.intern(TypeKind::Float {
            bits: 32,
            endian: Endian::Native,
        });
        let s = t.intern(TypeKind::Struct {
            fields: vec![
                Field { name: "x".into(), ty: f32t },
                Field { name: "y".into(), ty: f32t },
            ],
            soa: SoaKind::Slice,
        });
        // two pointer slots then the shared length
        assert_eq!(t.offset_of(s, 0), 0);
        assert_eq!(t.offset_of(s, 1), 8);
        assert_eq!(t.offset_of(s, 2), 16);
        assert_eq!(t.size_of(s), 24);
    }

    #[test]
    fn endianness_queries() {
        let mut t = table();
        let be = t.intern(TypeKind::Int {
            bits: 32,
            signed: false,
            endian: Endian::Big,
        });
        let le = t.intern(TypeKind::Int {
            bits: 32,
            signed: false,
            endian: Endian::Little,
        });
        let native = t.intern(int(32, false));
        assert!(t.is_foreign_endian(be));
        assert!(!t.is_foreign_endian(le));
        assert!(!t.is_foreign_endian(native));
        assert_eq!(t.native_order_of(be), native);
    }

    #[test]
    fn named_types_do_not_dedup_together() {
        let mut t = table();
        let a = t.intern_named(int(32, true), Some("celsius".into()));
        let b = t.intern_named(int(32, true), Some("fahrenheit".into()));
        let plain = t.intern(int(32, true));
        assert_ne!(a, b);
        assert_ne!(a, plain);
        // same name + kind does dedup
        assert_eq!(a, t.intern_named(int(32, true), Some("celsius".into())));
    }

    #[test]
    fn relative_pointer_layout_matches_base() {
        let mut t = table();
        let i16t = t.intern(int(16, true));
        let i32t = t.intern(int(32, true));
        let rp = t.intern(TypeKind::RelativePointer {
            base: i16t,
            pointee: i32t,
        });
        assert_eq!(t.size_of(rp), 2);
        assert_eq!(t.align_of(rp), 2);
    }

    // ═══════════════════════════════════════════════════════════
    // State flags
    // ═══════════════════════════════════════════════════════════

    #[test]
    fn flags_default_enabled() {
        let f = StateFlags::INHERIT;
        assert!(f.bounds_enabled());
        assert!(f.type_assert_enabled());
    }

    #[test]
    fn child_flag_overrides_parent() {
        let parent = StateFlags {
            bounds_check: Some(false),
            type_assert: None,
        };
        let child = StateFlags {
            bounds_check: Some(true),
            type_assert: None,
        };
        let merged = parent.merge(child);
        assert!(merged.bounds_enabled());
        // unset child field inherits
        let merged2 = parent.merge(StateFlags::INHERIT);
        assert!(!merged2.bounds_enabled());
        assert!(merged2.type_assert_enabled());
    }
}
