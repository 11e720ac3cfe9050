// SPDX-License-Identifier: (MIT OR Apache-2.0)

//! The conversion engine: one ordered rule table from any checked type
//! to any other.
//!
//! Rules are tried top to bottom; the first match wins and each rule
//! either completes the conversion or delegates to an earlier one on
//! narrower operands (per-lane, per-component). Falling off the end is
//! a checker contract violation and reports as an internal error.

use cranelift::prelude::*;

use keel_sem::{SoaKind, TypeId, TypeKind};

use crate::proc::ProcLowering;
use crate::value::{register_ty, Repr, Value as KValue};
use crate::{internal_error, CodegenResult};

impl<'a> ProcLowering<'a> {
    /// Convert `value` to `dst`, emitting whatever IR the pair needs.
    pub(crate) fn convert_value(&mut self, value: KValue, dst: TypeId) -> CodegenResult<KValue> {
        let sem = self.sem;
        let src = value.ty;

        // identity and enum-stripped identity are free
        if src == dst {
            return Ok(value);
        }
        let srcc = sem.types.core(src);
        let dstc = sem.types.core(dst);
        if srcc == dstc {
            return Ok(retype(value, dst));
        }

        let sk = sem.types.kind(srcc);
        let dk = sem.types.kind(dstc);

        // ─── bool and int scalars ───────────────────────────────
        if let (TypeKind::Bool, TypeKind::Int { .. }) = (sk, dk) {
            let reg = self.scalar_reg(&value)?;
            let bit = self.b.ins().icmp_imm(IntCC::NotEqual, reg, 0);
            let dcl = int_class(&sem.types, self.target.ptr_ty, dstc)?;
            let wide = self.cast_int_edge(bit, dcl, false);
            return self.finish_int(wide, dst);
        }
        if let (TypeKind::Int { .. }, TypeKind::Bool) = (sk, dk) {
            let mut reg = self.scalar_reg(&value)?;
            if sem.types.is_foreign_endian(src) {
                reg = self.byte_swap(reg);
            }
            let bit = self.b.ins().icmp_imm(IntCC::NotEqual, reg, 0);
            return Ok(KValue::register(bit, dst));
        }
        if let (TypeKind::Int { .. }, TypeKind::Int { .. }) = (sk, dk) {
            let mut reg = self.scalar_reg(&value)?;
            if sem.types.is_foreign_endian(src) {
                reg = self.byte_swap(reg);
            }
            let dcl = int_class(&sem.types, self.target.ptr_ty, dstc)?;
            let signed = !sem.types.is_unsigned(src);
            let cast = self.cast_int_edge(reg, dcl, signed);
            return self.finish_int(cast, dst);
        }

        // ─── float scalars ──────────────────────────────────────
        if let (TypeKind::Float { bits: sb, .. }, TypeKind::Float { bits: db, .. }) = (sk, dk) {
            let (sb, db) = (*sb, *db);
            let mut reg = self.scalar_reg(&value)?;
            if sem.types.is_foreign_endian(src) {
                reg = self.float_byte_swap(reg);
            }
            let reg = self.float_resize(reg, sb, db);
            return self.finish_float(reg, dst);
        }

        // ─── complex and quaternion packs ───────────────────────
        match (sk, dk) {
            (TypeKind::Complex { bits: sb }, TypeKind::Complex { bits: db }) => {
                let (sb, db) = (*sb, *db);
                return self.convert_components(&value, dst, &[(0, 0), (1, 1)], sb, db, 2);
            }
            (TypeKind::Quaternion { bits: sb }, TypeKind::Quaternion { bits: db }) => {
                let (sb, db) = (*sb, *db);
                return self.convert_components(
                    &value,
                    dst,
                    &[(0, 0), (1, 1), (2, 2), (3, 3)],
                    sb,
                    db,
                    4,
                );
            }
            (TypeKind::Complex { bits: sb }, TypeKind::Quaternion { bits: db }) => {
                // real lands in w (slot 3), imaginary in x (slot 0)
                let (sb, db) = (*sb, *db);
                return self.convert_components(&value, dst, &[(0, 3), (1, 0)], sb, db, 4);
            }
            (TypeKind::Int { .. }, TypeKind::Complex { bits })
            | (TypeKind::Float { .. }, TypeKind::Complex { bits }) => {
                let db = *bits;
                return self.scalar_to_pack(&value, src, dst, db, 2, 0);
            }
            (TypeKind::Int { .. }, TypeKind::Quaternion { bits })
            | (TypeKind::Float { .. }, TypeKind::Quaternion { bits }) => {
                let db = *bits;
                return self.scalar_to_pack(&value, src, dst, db, 4, 3);
            }
            _ => {}
        }

        // ─── float <-> int ──────────────────────────────────────
        if let (TypeKind::Float { bits: fb, .. }, TypeKind::Int { bits: ib, signed, .. }) =
            (sk, dk)
        {
            let (fb, ib, signed) = (*fb, *ib, *signed);
            let mut reg = self.scalar_reg(&value)?;
            if sem.types.is_foreign_endian(src) {
                reg = self.float_byte_swap(reg);
            }
            if ib == 128 {
                let f64v = self.float_resize(reg, fb, 64);
                let sflag = self.b.ins().iconst(types::I8, i64::from(signed));
                let fref = self.runtime_ref("keel_i128_from_float")?;
                let call = self.b.ins().call(fref, &[f64v, sflag]);
                let wide = self.b.inst_results(call)[0];
                return self.finish_int(wide, dst);
            }
            let dcl = int_class(&sem.types, self.target.ptr_ty, dstc)?;
            let wide_cl = if dcl.bits() < 32 { types::I32 } else { dcl };
            let raw = if signed {
                self.b.ins().fcvt_to_sint(wide_cl, reg)
            } else {
                self.b.ins().fcvt_to_uint(wide_cl, reg)
            };
            let cast = self.cast_int_edge(raw, dcl, signed);
            return self.finish_int(cast, dst);
        }
        if let (TypeKind::Int { bits: ib, signed, .. }, TypeKind::Float { bits: fb, .. }) =
            (sk, dk)
        {
            let (ib, signed, fb) = (*ib, *signed, *fb);
            let mut reg = self.scalar_reg(&value)?;
            if sem.types.is_foreign_endian(src) {
                reg = self.byte_swap(reg);
            }
            if ib == 128 {
                let sflag = self.b.ins().iconst(types::I8, i64::from(signed));
                let fref = self.runtime_ref("keel_float_from_i128")?;
                let call = self.b.ins().call(fref, &[reg, sflag]);
                let f64v = self.b.inst_results(call)[0];
                let out = self.float_resize(f64v, 64, fb);
                return self.finish_float(out, dst);
            }
            // small ints widen before the convert
            if ib < 32 {
                reg = self.cast_int_edge(reg, types::I32, signed);
            }
            let fcl = float_class(fb)?;
            let out = if signed {
                self.b.ins().fcvt_from_sint(fcl, reg)
            } else {
                self.b.ins().fcvt_from_uint(fcl, reg)
            };
            return self.finish_float(out, dst);
        }

        // ─── vectors ────────────────────────────────────────────
        if let (
            TypeKind::Simd {
                elem: se,
                lanes: sn,
            },
            TypeKind::Simd {
                elem: de,
                lanes: dn,
            },
        ) = (sk, dk)
        {
            let (se, de, n) = (*se, *de, (*sn).min(*dn));
            let sreg = self.scalar_reg(&value)?;
            let dcl = match register_ty(&sem.types, self.target.ptr_ty, dstc) {
                Some(c) => c,
                None => return internal_error("vector type without a register class"),
            };
            let lane_zero = self.zero_value(de)?;
            let lz = lane_zero.as_register()?;
            let mut acc = self.b.ins().splat(dcl, lz);
            for i in 0..n {
                let x = self.b.ins().extractlane(sreg, i as u8);
                let conv = self.convert_value(KValue::register(x, se), de)?;
                let c = conv.as_register()?;
                acc = self.b.ins().insertlane(acc, c, i as u8);
            }
            return Ok(KValue::register(acc, dst));
        }
        if let TypeKind::Simd { elem: de, .. } = dk {
            if matches!(
                sk,
                TypeKind::Bool | TypeKind::Int { .. } | TypeKind::Float { .. }
            ) {
                let de = *de;
                let dcl = match register_ty(&sem.types, self.target.ptr_ty, dstc) {
                    Some(c) => c,
                    None => return internal_error("vector type without a register class"),
                };
                let conv = self.convert_value(value, de)?;
                let lane = conv.as_register()?;
                let v = self.b.ins().splat(dcl, lane);
                return Ok(KValue::register(v, dst));
            }
        }

        // ─── pointer-shaped scalars ─────────────────────────────
        if sem.types.is_pointer_like(src) && matches!(dk, TypeKind::Int { .. }) {
            let reg = self.scalar_reg(&value)?;
            let dcl = int_class(&sem.types, self.target.ptr_ty, dstc)?;
            let cast = self.cast_int_edge(reg, dcl, false);
            return self.finish_int(cast, dst);
        }
        if matches!(sk, TypeKind::Int { .. }) && sem.types.is_pointer_like(dst) {
            let mut reg = self.scalar_reg(&value)?;
            if sem.types.is_foreign_endian(src) {
                reg = self.byte_swap(reg);
            }
            let cast = self.cast_int_edge(reg, self.target.ptr_ty, false);
            return Ok(KValue::register(cast, dst));
        }

        // ─── union variant injection ────────────────────────────
        if let TypeKind::Union { maybe_pointer, .. } = dk {
            let maybe_pointer = *maybe_pointer;
            let tag = sem
                .types
                .union_variant_index(dstc, src)
                .or_else(|| sem.types.union_variant_index(dstc, srcc));
            if let Some(tag) = tag {
                let out = self.alloc_local(dst, true)?;
                let out_ptr = self.addr_get_ptr(&out)?;
                self.emit_store(out_ptr, value)?;
                if !maybe_pointer {
                    self.union_tag_store(out_ptr, dst, tag)?;
                }
                return Ok(KValue::address(out_ptr, dst));
            }
        }

        // ─── embedded-field widening ────────────────────────────
        if let TypeKind::Struct { .. } = sk {
            if let Some(path) = embedded_path(&sem.types, srcc, dstc) {
                let off = embedded_offset(&sem.types, srcc, &path);
                let ptr = self.spill_to_ptr(&value)?;
                let fptr = if off == 0 {
                    ptr
                } else {
                    self.b.ins().iadd_imm(ptr, off as i64)
                };
                return self.emit_load(fptr, dst);
            }
        }
        if let (TypeKind::Pointer { elem: se }, TypeKind::Pointer { elem: de }) = (sk, dk) {
            let (se, de) = (*se, *de);
            let sec = sem.types.core(se);
            let dec = sem.types.core(de);
            if let Some(path) = embedded_path(&sem.types, sec, dec) {
                let off = embedded_offset(&sem.types, sec, &path);
                let reg = self.scalar_reg(&value)?;
                let out = if off == 0 {
                    reg
                } else {
                    self.b.ins().iadd_imm(reg, off as i64)
                };
                return Ok(KValue::register(out, dst));
            }
        }

        // ─── pointer family retypes ─────────────────────────────
        // relative pointers ride along: their register form is already
        // the absolute pointer, and stores re-encode per slot
        if (sem.types.is_pointer_like(src) || matches!(sk, TypeKind::RelativePointer { .. }))
            && (sem.types.is_pointer_like(dst) || matches!(dk, TypeKind::RelativePointer { .. }))
        {
            let reg = self.scalar_reg(&value)?;
            return Ok(KValue::register(reg, dst));
        }

        // ─── string <-> byte slice ──────────────────────────────
        match (sk, dk) {
            (TypeKind::String, TypeKind::Slice { .. })
            | (TypeKind::Slice { .. }, TypeKind::String) => {
                // layout-identical headers
                return Ok(retype(value, dst));
            }
            _ => {}
        }

        // ─── broadcasts and matrix shapes ───────────────────────
        if let TypeKind::Array { elem, len } = dk {
            if !sem.types.is_aggregate(src) && !sem.types.is_array_like(src) {
                let (elem, len) = (*elem, *len);
                return self.broadcast_array(value, dst, elem, len);
            }
        }
        if let TypeKind::Matrix { elem, rows, cols } = dk {
            let (elem, rows, cols) = (*elem, *rows, *cols);
            match sk {
                TypeKind::Matrix {
                    elem: se,
                    rows: sr,
                    cols: sc,
                } => {
                    let (se, sr, sc) = (*se, *sr, *sc);
                    return self.matrix_to_matrix(value, dst, se, sr, sc, elem, rows, cols);
                }
                _ if !sem.types.is_aggregate(src) => {
                    return self.scalar_to_matrix(value, dst, elem, rows, cols);
                }
                _ => {}
            }
        }

        // ─── boxing into any ────────────────────────────────────
        if let TypeKind::Any = dk {
            let word = self.target.ptr_bytes;
            let data = self.spill_to_ptr(&value)?;
            let out = self.alloc_local(dst, false)?;
            let out_ptr = self.addr_get_ptr(&out)?;
            self.b.ins().store(MemFlags::new(), data, out_ptr, 0);
            let tid = self.iconst_word(i64::from(src.0));
            self.b
                .ins()
                .store(MemFlags::new(), tid, out_ptr, word as i32);
            return Ok(KValue::address(out_ptr, dst));
        }

        // ─── same-size retypes ──────────────────────────────────
        match (sk, dk) {
            (TypeKind::BitSet { .. }, TypeKind::Int { .. })
            | (TypeKind::Int { .. }, TypeKind::BitSet { .. })
            | (TypeKind::TypeIdent, TypeKind::Int { .. })
            | (TypeKind::Int { .. }, TypeKind::TypeIdent) => {
                let reg = self.scalar_reg(&value)?;
                let dcl = match register_ty(&sem.types, self.target.ptr_ty, dstc) {
                    Some(c) => c,
                    None => return internal_error("retype target has no register class"),
                };
                let cast = self.cast_int_edge(reg, dcl, false);
                return Ok(KValue::register(cast, dst));
            }
            _ => {}
        }

        internal_error(format!(
            "no conversion rule from {:?} to {:?}",
            sem.types.kind(srcc),
            sem.types.kind(dstc)
        ))
    }

    /// A register edge for a scalar value, loading through its address
    /// form when needed.
    pub(crate) fn scalar_reg(&mut self, value: &KValue) -> CodegenResult<Value> {
        let v = self.resolve(value.clone())?;
        match v.repr {
            Repr::Register(r) => Ok(r),
            Repr::Address(p) => {
                let cl = match register_ty(&self.sem.types, self.target.ptr_ty, v.ty) {
                    Some(c) => c,
                    None => {
                        return internal_error("aggregate value used where a scalar is required")
                    }
                };
                Ok(self.b.ins().load(cl, MemFlags::new(), p, 0))
            }
            Repr::Symbol(_) | Repr::Multi(_) => {
                internal_error("unresolved value used where a scalar is required")
            }
        }
    }

    /// The zero of any type: scalar zeros in registers, aggregates as
    /// zero-filled locals.
    pub(crate) fn zero_value(&mut self, ty: TypeId) -> CodegenResult<KValue> {
        let sem = self.sem;
        match register_ty(&sem.types, self.target.ptr_ty, ty) {
            Some(cl) if cl == types::F32 => Ok(KValue::register(self.b.ins().f32const(0.0), ty)),
            Some(cl) if cl == types::F64 => Ok(KValue::register(self.b.ins().f64const(0.0), ty)),
            Some(cl) if cl.is_vector() => {
                let lane = match sem.types.array_elem(ty) {
                    Some(e) => e,
                    None => return internal_error("vector type without lanes"),
                };
                let z = self.zero_value(lane)?;
                let zr = z.as_register()?;
                Ok(KValue::register(self.b.ins().splat(cl, zr), ty))
            }
            Some(cl) => Ok(KValue::register(self.b.ins().iconst(cl, 0), ty)),
            None => Ok(self.alloc_local(ty, true)?.into_base()),
        }
    }

    /// The multiplicative identity of a numeric element type.
    fn one_value(&mut self, ty: TypeId) -> CodegenResult<Value> {
        let sem = self.sem;
        match sem.types.kind(sem.types.core(ty)) {
            TypeKind::Float { bits: 32, .. } => Ok(self.b.ins().f32const(1.0)),
            TypeKind::Float { .. } => Ok(self.b.ins().f64const(1.0)),
            TypeKind::Int { .. } | TypeKind::Bool => {
                let cl = match register_ty(&sem.types, self.target.ptr_ty, ty) {
                    Some(c) => c,
                    None => return internal_error("identity element has no register class"),
                };
                Ok(self.b.ins().iconst(cl, 1))
            }
            other => internal_error(format!("no identity element for {:?}", other)),
        }
    }

    // ─── scalar plumbing ────────────────────────────────────────

    /// Reverse the byte order of an integer register; single bytes are
    /// already both orders.
    pub(crate) fn byte_swap(&mut self, reg: Value) -> Value {
        let cl = self.b.func.dfg.value_type(reg);
        if cl == types::I8 {
            reg
        } else {
            self.b.ins().bswap(reg)
        }
    }

    /// Byte-swap a float by way of its bit pattern.
    pub(crate) fn float_byte_swap(&mut self, reg: Value) -> Value {
        let cl = self.b.func.dfg.value_type(reg);
        let icl = if cl == types::F32 { types::I32 } else { types::I64 };
        let bits = self.b.ins().bitcast(icl, MemFlags::new(), reg);
        let swapped = self.b.ins().bswap(bits);
        self.b.ins().bitcast(cl, MemFlags::new(), swapped)
    }

    fn float_resize(&mut self, reg: Value, have_bits: u16, want_bits: u16) -> Value {
        if have_bits == want_bits {
            reg
        } else if want_bits > have_bits {
            self.b.ins().fpromote(types::F64, reg)
        } else {
            self.b.ins().fdemote(types::F32, reg)
        }
    }

    /// Last step of every rule producing an integer: byte-swap into the
    /// destination's explicit order if it has one.
    fn finish_int(&mut self, reg: Value, dst: TypeId) -> CodegenResult<KValue> {
        let out = if self.sem.types.is_foreign_endian(dst) {
            self.byte_swap(reg)
        } else {
            reg
        };
        Ok(KValue::register(out, dst))
    }

    fn finish_float(&mut self, reg: Value, dst: TypeId) -> CodegenResult<KValue> {
        let out = if self.sem.types.is_foreign_endian(dst) {
            self.float_byte_swap(reg)
        } else {
            reg
        };
        Ok(KValue::register(out, dst))
    }

    // ─── pack conversions ───────────────────────────────────────

    /// Move float components between packs through a fresh local.
    /// `moves` maps source slot to destination slot; unmapped
    /// destination slots stay zero.
    fn convert_components(
        &mut self,
        value: &KValue,
        dst: TypeId,
        moves: &[(u8, u8)],
        src_bits: u16,
        dst_bits: u16,
        dst_slots: u8,
    ) -> CodegenResult<KValue> {
        let scl = float_class(src_bits)?;
        let ssize = i64::from(src_bits / 8);
        let dsize = i64::from(dst_bits / 8);
        let src_ptr = self.spill_to_ptr(value)?;
        let out = self.alloc_local(dst, moves.len() < dst_slots as usize)?;
        let out_ptr = self.addr_get_ptr(&out)?;
        for &(from, to) in moves {
            let c = self
                .b
                .ins()
                .load(scl, MemFlags::new(), src_ptr, (i64::from(from) * ssize) as i32);
            let c = self.float_resize(c, src_bits, dst_bits);
            self.b
                .ins()
                .store(MemFlags::new(), c, out_ptr, (i64::from(to) * dsize) as i32);
        }
        Ok(KValue::address(out_ptr, dst))
    }

    /// Scalar into a float pack: the converted value lands in
    /// `real_slot`, every other component is zero.
    fn scalar_to_pack(
        &mut self,
        value: &KValue,
        src: TypeId,
        dst: TypeId,
        comp_bits: u16,
        slots: u8,
        real_slot: u8,
    ) -> CodegenResult<KValue> {
        let comp = self.scalar_to_float(value, src, comp_bits)?;
        let csize = i64::from(comp_bits / 8);
        let out = self.alloc_local(dst, false)?;
        let out_ptr = self.addr_get_ptr(&out)?;
        let zero = if comp_bits == 32 {
            self.b.ins().f32const(0.0)
        } else {
            self.b.ins().f64const(0.0)
        };
        for slot in 0..slots {
            let v = if slot == real_slot { comp } else { zero };
            self.b
                .ins()
                .store(MemFlags::new(), v, out_ptr, (i64::from(slot) * csize) as i32);
        }
        Ok(KValue::address(out_ptr, dst))
    }

    /// Scalar int or float to a bare float register of `bits`.
    fn scalar_to_float(
        &mut self,
        value: &KValue,
        src: TypeId,
        bits: u16,
    ) -> CodegenResult<Value> {
        let sem = self.sem;
        let mut reg = self.scalar_reg(value)?;
        let fcl = float_class(bits)?;
        match sem.types.kind(sem.types.core(src)) {
            TypeKind::Float { bits: sb, .. } => {
                let sb = *sb;
                if sem.types.is_foreign_endian(src) {
                    reg = self.float_byte_swap(reg);
                }
                Ok(self.float_resize(reg, sb, bits))
            }
            TypeKind::Int { bits: ib, signed, .. } => {
                let (ib, signed) = (*ib, *signed);
                if sem.types.is_foreign_endian(src) {
                    reg = self.byte_swap(reg);
                }
                if ib < 32 {
                    reg = self.cast_int_edge(reg, types::I32, signed);
                }
                Ok(if signed {
                    self.b.ins().fcvt_from_sint(fcl, reg)
                } else {
                    self.b.ins().fcvt_from_uint(fcl, reg)
                })
            }
            other => internal_error(format!("no float image for {:?}", other)),
        }
    }

    // ─── array and matrix shapes ────────────────────────────────

    /// Fill every element of a fixed array with the converted scalar.
    /// Short arrays unroll; longer ones spend a loop.
    fn broadcast_array(
        &mut self,
        value: KValue,
        dst: TypeId,
        elem: TypeId,
        len: u64,
    ) -> CodegenResult<KValue> {
        let sem = self.sem;
        let esize = sem.types.size_of(elem);
        let conv = self.convert_value(value, elem)?;
        let out = self.alloc_local(dst, false)?;
        let out_ptr = self.addr_get_ptr(&out)?;
        if len <= 16 {
            for i in 0..len {
                let cell = if i == 0 {
                    out_ptr
                } else {
                    self.b.ins().iadd_imm(out_ptr, (i * esize) as i64)
                };
                self.emit_store(cell, conv.clone())?;
            }
        } else {
            let word = self.target.ptr_ty;
            let head = self.b.create_block();
            self.b.append_block_param(head, word);
            let body = self.b.create_block();
            let done = self.b.create_block();
            let zero = self.iconst_word(0);
            self.b.ins().jump(head, &[zero]);
            self.switch_region(head);
            let i = self.b.block_params(head)[0];
            let n = self.iconst_word(len as i64);
            let more = self.b.ins().icmp(IntCC::UnsignedLessThan, i, n);
            self.b.ins().brif(more, body, &[], done, &[]);
            self.switch_region(body);
            let off = self.b.ins().imul_imm(i, esize as i64);
            let p = self.b.ins().iadd(out_ptr, off);
            self.emit_store(p, conv.clone())?;
            let next = self.b.ins().iadd_imm(i, 1);
            self.b.ins().jump(head, &[next]);
            self.switch_region(done);
        }
        Ok(KValue::address(out_ptr, dst))
    }

    /// Scalar into a matrix: the value fills the diagonal, everything
    /// else is zero.
    fn scalar_to_matrix(
        &mut self,
        value: KValue,
        dst: TypeId,
        elem: TypeId,
        rows: u32,
        cols: u32,
    ) -> CodegenResult<KValue> {
        let sem = self.sem;
        let esize = sem.types.size_of(elem);
        let conv = self.convert_value(value, elem)?;
        let reg = conv.as_register()?;
        let out = self.alloc_local(dst, true)?;
        let out_ptr = self.addr_get_ptr(&out)?;
        for d in 0..rows.min(cols) {
            // column-major cell (d, d)
            let off = (u64::from(d) * u64::from(rows) + u64::from(d)) * esize;
            self.b.ins().store(MemFlags::new(), reg, out_ptr, off as i32);
        }
        Ok(KValue::address(out_ptr, dst))
    }

    /// Matrix shape change. Overlapping cells copy (converting elements
    /// when the scalar type changes), fresh diagonal cells get the
    /// identity, everything else is zero.
    #[allow(clippy::too_many_arguments)]
    fn matrix_to_matrix(
        &mut self,
        value: KValue,
        dst: TypeId,
        src_elem: TypeId,
        src_rows: u32,
        src_cols: u32,
        elem: TypeId,
        rows: u32,
        cols: u32,
    ) -> CodegenResult<KValue> {
        let sem = self.sem;
        let ssize = sem.types.size_of(src_elem);
        let dsize = sem.types.size_of(elem);
        let scl = match register_ty(&sem.types, self.target.ptr_ty, src_elem) {
            Some(c) => c,
            None => return internal_error("matrix elements must be register scalars"),
        };
        let src_ptr = self.spill_to_ptr(&value)?;
        let out = self.alloc_local(dst, true)?;
        let out_ptr = self.addr_get_ptr(&out)?;
        for c in 0..cols.min(src_cols) {
            for r in 0..rows.min(src_rows) {
                let soff = (u64::from(c) * u64::from(src_rows) + u64::from(r)) * ssize;
                let doff = (u64::from(c) * u64::from(rows) + u64::from(r)) * dsize;
                let cell = self.b.ins().load(scl, MemFlags::new(), src_ptr, soff as i32);
                let cell = if src_elem == elem {
                    cell
                } else {
                    let conv = self.convert_value(KValue::register(cell, src_elem), elem)?;
                    conv.as_register()?
                };
                self.b.ins().store(MemFlags::new(), cell, out_ptr, doff as i32);
            }
        }
        // identity on the part of the diagonal the source did not cover
        let covered = src_rows.min(src_cols);
        for d in covered..rows.min(cols) {
            let one = self.one_value(elem)?;
            let off = (u64::from(d) * u64::from(rows) + u64::from(d)) * dsize;
            self.b.ins().store(MemFlags::new(), one, out_ptr, off as i32);
        }
        Ok(KValue::address(out_ptr, dst))
    }
}

pub(crate) fn retype(value: KValue, dst: TypeId) -> KValue {
    KValue {
        repr: value.repr,
        ty: dst,
    }
}

/// Integer register class, required.
fn int_class(
    types_tbl: &keel_sem::TypeTable,
    ptr_ty: Type,
    ty: TypeId,
) -> CodegenResult<Type> {
    match register_ty(types_tbl, ptr_ty, ty) {
        Some(c) => Ok(c),
        None => internal_error("integer type without a register class"),
    }
}

pub(crate) fn float_class(bits: u16) -> CodegenResult<Type> {
    match bits {
        32 => Ok(types::F32),
        64 => Ok(types::F64),
        other => internal_error(format!("unsupported float width {}", other)),
    }
}

/// Field chain embedding `want` inside `outer`, shallowest first.
fn embedded_path(
    types_tbl: &keel_sem::TypeTable,
    outer: TypeId,
    want: TypeId,
) -> Option<Vec<usize>> {
    fn walk(
        types_tbl: &keel_sem::TypeTable,
        outer: TypeId,
        want: TypeId,
        path: &mut Vec<usize>,
    ) -> bool {
        let core = types_tbl.core(outer);
        if let TypeKind::Struct { fields, soa } = types_tbl.kind(core) {
            if *soa != SoaKind::None {
                return false;
            }
            for (i, f) in fields.iter().enumerate() {
                path.push(i);
                if types_tbl.core(f.ty) == types_tbl.core(want) {
                    return true;
                }
                if walk(types_tbl, f.ty, want, path) {
                    return true;
                }
                path.pop();
            }
        }
        false
    }
    let mut path = Vec::new();
    if walk(types_tbl, outer, want, &mut path) {
        Some(path)
    } else {
        None
    }
}

fn embedded_offset(types_tbl: &keel_sem::TypeTable, outer: TypeId, path: &[usize]) -> u64 {
    let mut ty = types_tbl.core(outer);
    let mut off = 0u64;
    for &step in path {
        off += types_tbl.offset_of(ty, step);
        ty = match types_tbl.kind(ty) {
            TypeKind::Struct { fields, .. } => types_tbl.core(fields[step].ty),
            _ => ty,
        };
    }
    off
}
