// SPDX-License-Identifier: (MIT OR Apache-2.0)

//! Arithmetic and comparison emitters.
//!
//! Scalars map to single instructions. Array shapes take one wide
//! vector instruction when the lane type and operator allow it and an
//! element walk otherwise. Matrix `*` dispatches on operand shape.
//! Deep equality over padded records goes through the generated
//! per-type routines; everything bytewise-meaningful goes through the
//! runtime block compare.

use cranelift::prelude::*;

use keel_sem::{BinOp, IntrinsicOp, TypeId, TypeKind, UnOp};

use crate::convert::float_class;
use crate::module::needs_equality_proc;
use crate::proc::ProcLowering;
use crate::value::{register_ty, Value as KValue};
use crate::{internal_error, CodegenResult};

impl<'a> ProcLowering<'a> {
    // ─── Arithmetic ─────────────────────────────────────────────

    /// Binary arithmetic over unified operand types. `result_ty` is
    /// the checked type of the whole expression; for matrix `*` the
    /// operand types decide the product shape instead.
    pub(crate) fn emit_arith(
        &mut self,
        op: BinOp,
        lhs: KValue,
        rhs: KValue,
        result_ty: TypeId,
    ) -> CodegenResult<KValue> {
        let sem = self.sem;
        if op == BinOp::Mul
            && (matrix_shape(&sem.types, lhs.ty).is_some()
                || matrix_shape(&sem.types, rhs.ty).is_some())
        {
            return self.matrix_mul(lhs, rhs, result_ty);
        }
        let core = sem.types.core(result_ty);
        match sem.types.kind(core) {
            &TypeKind::Array { elem, len } => {
                self.lanewise_arith(op, lhs, rhs, result_ty, elem, len)
            }
            &TypeKind::Simd { elem, lanes } => {
                let float = sem.types.is_float(elem);
                if vectorizable(op, float)
                    && register_ty(&sem.types, self.target.ptr_ty, core).is_some()
                {
                    return self.vector_arith(op, lhs, rhs, result_ty, float);
                }
                self.lanewise_arith(op, lhs, rhs, result_ty, elem, u64::from(lanes))
            }
            &TypeKind::Matrix { elem, rows, cols } => {
                // cell by cell; * took the shape dispatch above
                let cells = u64::from(rows) * u64::from(cols);
                self.lanewise_arith(op, lhs, rhs, result_ty, elem, cells)
            }
            &TypeKind::Complex { bits } => self.complex_arith(op, lhs, rhs, result_ty, bits),
            &TypeKind::Quaternion { bits } => self.quaternion_arith(op, lhs, rhs, result_ty, bits),
            TypeKind::BitSet { .. } => self.bit_set_arith(op, lhs, rhs, result_ty),
            &TypeKind::Int { bits, signed, .. } => {
                self.int_arith(op, lhs, rhs, result_ty, bits, signed)
            }
            TypeKind::Float { .. } => self.float_arith(op, lhs, rhs, result_ty),
            other => internal_error(format!("arithmetic over {:?}", other)),
        }
    }

    /// Native integer op, with explicit-endianness operands swapped
    /// into native order around it. Bitwise ops commute with the byte
    /// order and skip the swaps.
    fn int_arith(
        &mut self,
        op: BinOp,
        lhs: KValue,
        rhs: KValue,
        result_ty: TypeId,
        bits: u16,
        signed: bool,
    ) -> CodegenResult<KValue> {
        let sem = self.sem;
        let bitwise = matches!(
            op,
            BinOp::BitAnd | BinOp::BitOr | BinOp::BitXor | BinOp::AndNot
        );
        let swap = sem.types.is_foreign_endian(result_ty) && !bitwise;
        let mut l = self.scalar_reg(&lhs)?;
        let mut r = self.scalar_reg(&rhs)?;
        if swap {
            l = self.byte_swap(l);
            r = self.byte_swap(r);
        }
        let v = match op {
            BinOp::Add => self.b.ins().iadd(l, r),
            BinOp::Sub => self.b.ins().isub(l, r),
            BinOp::Mul => self.b.ins().imul(l, r),
            BinOp::Div if signed => self.b.ins().sdiv(l, r),
            BinOp::Div => self.b.ins().udiv(l, r),
            BinOp::Mod if signed => self.b.ins().srem(l, r),
            BinOp::Mod => self.b.ins().urem(l, r),
            BinOp::ModFloor if signed => {
                // ((a rem b) + b) rem b folds the divisor's sign back in
                let rem = self.b.ins().srem(l, r);
                let shifted = self.b.ins().iadd(rem, r);
                self.b.ins().srem(shifted, r)
            }
            BinOp::ModFloor => self.b.ins().urem(l, r),
            BinOp::BitAnd => self.b.ins().band(l, r),
            BinOp::BitOr => self.b.ins().bor(l, r),
            BinOp::BitXor => self.b.ins().bxor(l, r),
            BinOp::AndNot => self.b.ins().band_not(l, r),
            BinOp::Shl | BinOp::Shr => {
                let shifted = match op {
                    BinOp::Shl => self.b.ins().ishl(l, r),
                    _ if signed => self.b.ins().sshr(l, r),
                    _ => self.b.ins().ushr(l, r),
                };
                // counts at or past the width produce zero; the native
                // instruction would wrap the count instead
                let cnt_cl = self.b.func.dfg.value_type(r);
                let width = self.int_const(cnt_cl, i64::from(bits));
                let val_cl = self.b.func.dfg.value_type(l);
                let zero = self.int_const(val_cl, 0);
                let in_range = self.b.ins().icmp(IntCC::UnsignedLessThan, r, width);
                self.b.ins().select(in_range, shifted, zero)
            }
            _ => return internal_error("comparison routed to the arithmetic emitter"),
        };
        let v = if swap { self.byte_swap(v) } else { v };
        Ok(KValue::register(v, result_ty))
    }

    fn float_arith(
        &mut self,
        op: BinOp,
        lhs: KValue,
        rhs: KValue,
        result_ty: TypeId,
    ) -> CodegenResult<KValue> {
        let sem = self.sem;
        let swap = sem.types.is_foreign_endian(result_ty);
        let mut l = self.scalar_reg(&lhs)?;
        let mut r = self.scalar_reg(&rhs)?;
        if swap {
            l = self.float_byte_swap(l);
            r = self.float_byte_swap(r);
        }
        let v = match op {
            BinOp::Add => self.b.ins().fadd(l, r),
            BinOp::Sub => self.b.ins().fsub(l, r),
            BinOp::Mul => self.b.ins().fmul(l, r),
            BinOp::Div => self.b.ins().fdiv(l, r),
            _ => return internal_error("operator not defined over floats"),
        };
        let v = if swap { self.float_byte_swap(v) } else { v };
        Ok(KValue::register(v, result_ty))
    }

    /// Set algebra on the backing integer; `+`/`-` read as union and
    /// difference.
    fn bit_set_arith(
        &mut self,
        op: BinOp,
        lhs: KValue,
        rhs: KValue,
        result_ty: TypeId,
    ) -> CodegenResult<KValue> {
        let l = self.scalar_reg(&lhs)?;
        let r = self.scalar_reg(&rhs)?;
        let v = match op {
            BinOp::Add | BinOp::BitOr => self.b.ins().bor(l, r),
            BinOp::Sub | BinOp::AndNot => self.b.ins().band_not(l, r),
            BinOp::BitAnd => self.b.ins().band(l, r),
            BinOp::BitXor => self.b.ins().bxor(l, r),
            _ => return internal_error("operator not defined over bit sets"),
        };
        Ok(KValue::register(v, result_ty))
    }

    /// One instruction over whole vector registers.
    fn vector_arith(
        &mut self,
        op: BinOp,
        lhs: KValue,
        rhs: KValue,
        result_ty: TypeId,
        float: bool,
    ) -> CodegenResult<KValue> {
        let l = self.scalar_reg(&lhs)?;
        let r = self.scalar_reg(&rhs)?;
        let v = match op {
            BinOp::Add if float => self.b.ins().fadd(l, r),
            BinOp::Add => self.b.ins().iadd(l, r),
            BinOp::Sub if float => self.b.ins().fsub(l, r),
            BinOp::Sub => self.b.ins().isub(l, r),
            BinOp::Mul if float => self.b.ins().fmul(l, r),
            BinOp::Mul => self.b.ins().imul(l, r),
            BinOp::Div => self.b.ins().fdiv(l, r),
            BinOp::BitAnd => self.b.ins().band(l, r),
            BinOp::BitOr => self.b.ins().bor(l, r),
            BinOp::BitXor => self.b.ins().bxor(l, r),
            BinOp::AndNot => self.b.ins().band_not(l, r),
            _ => return internal_error("operator has no whole-vector form"),
        };
        Ok(KValue::register(v, result_ty))
    }

    /// Element-by-element fallback for array shapes. Short lengths
    /// unroll in lane order; longer ones spend a counted loop.
    fn lanewise_arith(
        &mut self,
        op: BinOp,
        lhs: KValue,
        rhs: KValue,
        result_ty: TypeId,
        elem: TypeId,
        len: u64,
    ) -> CodegenResult<KValue> {
        let sem = self.sem;
        let esize = sem.types.size_of(elem);
        let lp = self.spill_to_ptr(&lhs)?;
        let rp = self.spill_to_ptr(&rhs)?;
        let out = self.alloc_local(result_ty, false)?;
        let out_ptr = self.addr_get_ptr(&out)?;
        if len <= 16 {
            for i in 0..len {
                let la = self.at_off(lp, i * esize);
                let ra = self.at_off(rp, i * esize);
                let l = self.emit_load(la, elem)?;
                let r = self.emit_load(ra, elem)?;
                let v = self.emit_arith(op, l, r, elem)?;
                let oa = self.at_off(out_ptr, i * esize);
                self.emit_store(oa, v)?;
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
            let la = self.b.ins().iadd(lp, off);
            let ra = self.b.ins().iadd(rp, off);
            let oa = self.b.ins().iadd(out_ptr, off);
            let l = self.emit_load(la, elem)?;
            let r = self.emit_load(ra, elem)?;
            let v = self.emit_arith(op, l, r, elem)?;
            self.emit_store(oa, v)?;
            let next = self.b.ins().iadd_imm(i, 1);
            self.b.ins().jump(head, &[next]);
            self.switch_region(done);
        }
        Ok(KValue::address(out_ptr, result_ty))
    }

    /// Complex add/sub inline per component. Multiplication is the
    /// usual cross-term form; division goes through the runtime so
    /// every call site shares one rounding behavior.
    fn complex_arith(
        &mut self,
        op: BinOp,
        lhs: KValue,
        rhs: KValue,
        result_ty: TypeId,
        bits: u16,
    ) -> CodegenResult<KValue> {
        let cl = float_class(bits)?;
        let comp = u64::from(bits) / 8;
        match op {
            BinOp::Add | BinOp::Sub => self.pack_add_sub(op, &lhs, &rhs, result_ty, cl, comp, 2),
            BinOp::Mul => {
                let lp = self.spill_to_ptr(&lhs)?;
                let rp = self.spill_to_ptr(&rhs)?;
                let a = self.b.ins().load(cl, MemFlags::new(), lp, 0);
                let b = self.b.ins().load(cl, MemFlags::new(), lp, comp as i32);
                let c = self.b.ins().load(cl, MemFlags::new(), rp, 0);
                let d = self.b.ins().load(cl, MemFlags::new(), rp, comp as i32);
                let ac = self.b.ins().fmul(a, c);
                let bd = self.b.ins().fmul(b, d);
                let re = self.b.ins().fsub(ac, bd);
                let ad = self.b.ins().fmul(a, d);
                let bc = self.b.ins().fmul(b, c);
                let im = self.b.ins().fadd(ad, bc);
                let out = self.alloc_local(result_ty, false)?;
                let out_ptr = self.addr_get_ptr(&out)?;
                self.b.ins().store(MemFlags::new(), re, out_ptr, 0);
                self.b.ins().store(MemFlags::new(), im, out_ptr, comp as i32);
                Ok(KValue::address(out_ptr, result_ty))
            }
            BinOp::Div => {
                let helper = match bits {
                    32 => "keel_quo_complex64",
                    64 => "keel_quo_complex128",
                    _ => return internal_error(format!("complex width {} has no divide", bits)),
                };
                self.pack_runtime_call(helper, &lhs, &rhs, result_ty)
            }
            _ => internal_error("operator not defined over complex numbers"),
        }
    }

    fn quaternion_arith(
        &mut self,
        op: BinOp,
        lhs: KValue,
        rhs: KValue,
        result_ty: TypeId,
        bits: u16,
    ) -> CodegenResult<KValue> {
        let cl = float_class(bits)?;
        let comp = u64::from(bits) / 8;
        match op {
            BinOp::Add | BinOp::Sub => self.pack_add_sub(op, &lhs, &rhs, result_ty, cl, comp, 4),
            BinOp::Mul | BinOp::Div => {
                // the runtime carries only the 128-bit format
                if bits != 32 {
                    return internal_error(format!("quaternion width {} has no product", bits));
                }
                let helper = if op == BinOp::Mul {
                    "keel_mul_quaternion128"
                } else {
                    "keel_quo_quaternion128"
                };
                self.pack_runtime_call(helper, &lhs, &rhs, result_ty)
            }
            _ => internal_error("operator not defined over quaternions"),
        }
    }

    /// Componentwise float add/sub over a fixed pack.
    fn pack_add_sub(
        &mut self,
        op: BinOp,
        lhs: &KValue,
        rhs: &KValue,
        result_ty: TypeId,
        cl: Type,
        comp: u64,
        n: u64,
    ) -> CodegenResult<KValue> {
        let lp = self.spill_to_ptr(lhs)?;
        let rp = self.spill_to_ptr(rhs)?;
        let out = self.alloc_local(result_ty, false)?;
        let out_ptr = self.addr_get_ptr(&out)?;
        for i in 0..n {
            let off = (i * comp) as i32;
            let a = self.b.ins().load(cl, MemFlags::new(), lp, off);
            let b = self.b.ins().load(cl, MemFlags::new(), rp, off);
            let v = if op == BinOp::Add {
                self.b.ins().fadd(a, b)
            } else {
                self.b.ins().fsub(a, b)
            };
            self.b.ins().store(MemFlags::new(), v, out_ptr, off);
        }
        Ok(KValue::address(out_ptr, result_ty))
    }

    /// Out-parameter runtime routine over two packed operands.
    fn pack_runtime_call(
        &mut self,
        helper: &'static str,
        lhs: &KValue,
        rhs: &KValue,
        result_ty: TypeId,
    ) -> CodegenResult<KValue> {
        let lp = self.spill_to_ptr(lhs)?;
        let rp = self.spill_to_ptr(rhs)?;
        let out = self.alloc_local(result_ty, false)?;
        let out_ptr = self.addr_get_ptr(&out)?;
        let o = self.cast_int_edge(out_ptr, types::I64, false);
        let l = self.cast_int_edge(lp, types::I64, false);
        let r = self.cast_int_edge(rp, types::I64, false);
        let fref = self.runtime_ref(helper)?;
        self.b.ins().call(fref, &[o, l, r]);
        Ok(KValue::address(out_ptr, result_ty))
    }

    // ─── Matrix multiply ────────────────────────────────────────

    /// `*` with a matrix on either side picks its form from the
    /// operand shapes: matrix chain, matrix-vector, vector-matrix or
    /// a scalar rescale.
    fn matrix_mul(
        &mut self,
        lhs: KValue,
        rhs: KValue,
        result_ty: TypeId,
    ) -> CodegenResult<KValue> {
        let sem = self.sem;
        let lmat = matrix_shape(&sem.types, lhs.ty);
        let rmat = matrix_shape(&sem.types, rhs.ty);
        match (lmat, rmat) {
            (Some((elem, m, k)), Some((_, k2, n))) => {
                if k != k2 {
                    return internal_error("matrix shapes do not chain");
                }
                self.matmul(lhs, rhs, result_ty, elem, m, k, n)
            }
            (Some((elem, m, k)), None) => match vector_shape(&sem.types, rhs.ty) {
                Some((_, vl)) => {
                    if vl != u64::from(k) {
                        return internal_error("matrix and vector shapes do not chain");
                    }
                    self.mat_vec(lhs, rhs, result_ty, elem, m, k)
                }
                None => self.mat_scale(lhs, rhs, result_ty, elem, m, k),
            },
            (None, Some((elem, m, n))) => match vector_shape(&sem.types, lhs.ty) {
                Some((_, vl)) => {
                    if vl != u64::from(m) {
                        return internal_error("vector and matrix shapes do not chain");
                    }
                    self.vec_mat(lhs, rhs, result_ty, elem, m, n)
                }
                None => self.mat_scale(rhs, lhs, result_ty, elem, m, n),
            },
            (None, None) => internal_error("matrix product without a matrix operand"),
        }
    }

    /// Matrix chain product, column major. Columns that fill a whole
    /// float vector register take the scaled-column strategy; anything
    /// else runs the unrolled accumulation over the (row, column,
    /// inner) index space.
    fn matmul(
        &mut self,
        lhs: KValue,
        rhs: KValue,
        result_ty: TypeId,
        elem: TypeId,
        m: u32,
        k: u32,
        n: u32,
    ) -> CodegenResult<KValue> {
        let sem = self.sem;
        let float = sem.types.is_float(elem);
        let cl = match register_ty(&sem.types, self.target.ptr_ty, elem) {
            Some(c) => c,
            None => return internal_error("matrix over a non-register element"),
        };
        let esize = sem.types.size_of(elem);
        let lp = self.spill_to_ptr(&lhs)?;
        let rp = self.spill_to_ptr(&rhs)?;
        let out = self.alloc_local(result_ty, false)?;
        let out_ptr = self.addr_get_ptr(&out)?;

        let col_cl = if float && k > 0 {
            cl.by(m).filter(|v| v.bits() == 128)
        } else {
            None
        };
        if let Some(vcl) = col_cl {
            // out column c = sum over t of (lhs column t) * rhs(t, c)
            for c in 0..n {
                let mut acc: Option<Value> = None;
                for t in 0..k {
                    let a_off = u64::from(t) * u64::from(m) * esize;
                    let a_col = self.b.ins().load(vcl, MemFlags::new(), lp, a_off as i32);
                    let b_cell = self.mat_cell(rp, cl, t, c, k, esize);
                    let b_col = self.b.ins().splat(vcl, b_cell);
                    let prod = self.b.ins().fmul(a_col, b_col);
                    acc = Some(match acc {
                        Some(s) => self.b.ins().fadd(s, prod),
                        None => prod,
                    });
                }
                if let Some(v) = acc {
                    let off = u64::from(c) * u64::from(m) * esize;
                    self.b.ins().store(MemFlags::new(), v, out_ptr, off as i32);
                }
            }
            return Ok(KValue::address(out_ptr, result_ty));
        }

        for c in 0..n {
            for r in 0..m {
                let mut acc: Option<Value> = None;
                for t in 0..k {
                    let a = self.mat_cell(lp, cl, r, t, m, esize);
                    let b = self.mat_cell(rp, cl, t, c, k, esize);
                    let prod = self.num_mul(float, a, b);
                    acc = Some(match acc {
                        Some(s) => self.num_add(float, s, prod),
                        None => prod,
                    });
                }
                let v = match acc {
                    Some(v) => v,
                    None => self.num_zero(cl, float),
                };
                let off = (u64::from(c) * u64::from(m) + u64::from(r)) * esize;
                self.b.ins().store(MemFlags::new(), v, out_ptr, off as i32);
            }
        }
        Ok(KValue::address(out_ptr, result_ty))
    }

    /// Matrix times column vector.
    fn mat_vec(
        &mut self,
        mat: KValue,
        vec: KValue,
        result_ty: TypeId,
        elem: TypeId,
        m: u32,
        k: u32,
    ) -> CodegenResult<KValue> {
        let sem = self.sem;
        let float = sem.types.is_float(elem);
        let cl = match register_ty(&sem.types, self.target.ptr_ty, elem) {
            Some(c) => c,
            None => return internal_error("matrix over a non-register element"),
        };
        let esize = sem.types.size_of(elem);
        let mp = self.spill_to_ptr(&mat)?;
        let vp = self.spill_to_ptr(&vec)?;
        let out = self.alloc_local(result_ty, false)?;
        let out_ptr = self.addr_get_ptr(&out)?;
        for r in 0..m {
            let mut acc: Option<Value> = None;
            for t in 0..k {
                let a = self.mat_cell(mp, cl, r, t, m, esize);
                let off = u64::from(t) * esize;
                let v = self.b.ins().load(cl, MemFlags::new(), vp, off as i32);
                let prod = self.num_mul(float, a, v);
                acc = Some(match acc {
                    Some(s) => self.num_add(float, s, prod),
                    None => prod,
                });
            }
            let v = match acc {
                Some(v) => v,
                None => self.num_zero(cl, float),
            };
            let off = u64::from(r) * esize;
            self.b.ins().store(MemFlags::new(), v, out_ptr, off as i32);
        }
        Ok(KValue::address(out_ptr, result_ty))
    }

    /// Row vector times matrix.
    fn vec_mat(
        &mut self,
        vec: KValue,
        mat: KValue,
        result_ty: TypeId,
        elem: TypeId,
        m: u32,
        n: u32,
    ) -> CodegenResult<KValue> {
        let sem = self.sem;
        let float = sem.types.is_float(elem);
        let cl = match register_ty(&sem.types, self.target.ptr_ty, elem) {
            Some(c) => c,
            None => return internal_error("matrix over a non-register element"),
        };
        let esize = sem.types.size_of(elem);
        let vp = self.spill_to_ptr(&vec)?;
        let mp = self.spill_to_ptr(&mat)?;
        let out = self.alloc_local(result_ty, false)?;
        let out_ptr = self.addr_get_ptr(&out)?;
        for c in 0..n {
            let mut acc: Option<Value> = None;
            for r in 0..m {
                let off = u64::from(r) * esize;
                let v = self.b.ins().load(cl, MemFlags::new(), vp, off as i32);
                let b = self.mat_cell(mp, cl, r, c, m, esize);
                let prod = self.num_mul(float, v, b);
                acc = Some(match acc {
                    Some(s) => self.num_add(float, s, prod),
                    None => prod,
                });
            }
            let v = match acc {
                Some(v) => v,
                None => self.num_zero(cl, float),
            };
            let off = u64::from(c) * esize;
            self.b.ins().store(MemFlags::new(), v, out_ptr, off as i32);
        }
        Ok(KValue::address(out_ptr, result_ty))
    }

    /// Every cell rescaled by one converted scalar.
    fn mat_scale(
        &mut self,
        mat: KValue,
        scalar: KValue,
        result_ty: TypeId,
        elem: TypeId,
        rows: u32,
        cols: u32,
    ) -> CodegenResult<KValue> {
        let sem = self.sem;
        let float = sem.types.is_float(elem);
        let cl = match register_ty(&sem.types, self.target.ptr_ty, elem) {
            Some(c) => c,
            None => return internal_error("matrix over a non-register element"),
        };
        let esize = sem.types.size_of(elem);
        let conv = self.convert_value(scalar, elem)?;
        let s = self.scalar_reg(&conv)?;
        let mp = self.spill_to_ptr(&mat)?;
        let out = self.alloc_local(result_ty, false)?;
        let out_ptr = self.addr_get_ptr(&out)?;
        for c in 0..cols {
            for r in 0..rows {
                let a = self.mat_cell(mp, cl, r, c, rows, esize);
                let v = self.num_mul(float, a, s);
                let off = (u64::from(c) * u64::from(rows) + u64::from(r)) * esize;
                self.b.ins().store(MemFlags::new(), v, out_ptr, off as i32);
            }
        }
        Ok(KValue::address(out_ptr, result_ty))
    }

    fn mat_cell(&mut self, base: Value, cl: Type, r: u32, c: u32, rows: u32, esize: u64) -> Value {
        let off = (u64::from(c) * u64::from(rows) + u64::from(r)) * esize;
        self.b.ins().load(cl, MemFlags::new(), base, off as i32)
    }

    fn num_mul(&mut self, float: bool, a: Value, b: Value) -> Value {
        if float {
            self.b.ins().fmul(a, b)
        } else {
            self.b.ins().imul(a, b)
        }
    }

    fn num_add(&mut self, float: bool, a: Value, b: Value) -> Value {
        if float {
            self.b.ins().fadd(a, b)
        } else {
            self.b.ins().iadd(a, b)
        }
    }

    fn num_zero(&mut self, cl: Type, float: bool) -> Value {
        if float {
            if cl == types::F32 {
                self.b.ins().f32const(0.0)
            } else {
                self.b.ins().f64const(0.0)
            }
        } else {
            self.int_const(cl, 0)
        }
    }

    /// Integer constant of any class; 128-bit classes extend from the
    /// 64-bit immediate form.
    pub(crate) fn int_const(&mut self, cl: Type, v: i64) -> Value {
        if cl == types::I128 {
            let half = self.b.ins().iconst(types::I64, v);
            self.b.ins().sextend(types::I128, half)
        } else {
            self.b.ins().iconst(cl, v)
        }
    }

    /// `ptr + off`, skipping the add at offset zero.
    pub(crate) fn at_off(&mut self, ptr: Value, off: u64) -> Value {
        if off == 0 {
            ptr
        } else {
            self.b.ins().iadd_imm(ptr, off as i64)
        }
    }

    // ─── Comparison ─────────────────────────────────────────────

    /// Comparison over unified operands; always lands in a bool
    /// register. Deep forms fold element tests or call out to the
    /// generated equality routines.
    pub(crate) fn emit_comp(
        &mut self,
        op: BinOp,
        lhs: KValue,
        rhs: KValue,
        bool_ty: TypeId,
    ) -> CodegenResult<KValue> {
        let sem = self.sem;
        let (lhs, rhs) = self.comp_reconcile(lhs, rhs)?;
        let core = sem.types.core(lhs.ty);
        match sem.types.kind(core) {
            TypeKind::Bool => {
                let cc = match op {
                    BinOp::Eq => IntCC::Equal,
                    BinOp::NotEq => IntCC::NotEqual,
                    _ => return internal_error("booleans have no order"),
                };
                let l = self.scalar_reg(&lhs)?;
                let r = self.scalar_reg(&rhs)?;
                Ok(KValue::register(self.b.ins().icmp(cc, l, r), bool_ty))
            }
            TypeKind::Int { .. }
            | TypeKind::Pointer { .. }
            | TypeKind::MultiPointer { .. }
            | TypeKind::FuncPointer { .. }
            | TypeKind::RawPointer
            | TypeKind::TypeIdent => self.int_comp(op, &lhs, &rhs, bool_ty),
            TypeKind::Float { .. } => self.float_comp(op, &lhs, &rhs, bool_ty),
            TypeKind::BitSet { .. } => self.bit_set_comp(op, &lhs, &rhs, bool_ty),
            &TypeKind::Complex { bits } => self.pack_eq(op, &lhs, &rhs, bool_ty, bits, 2),
            &TypeKind::Quaternion { bits } => self.pack_eq(op, &lhs, &rhs, bool_ty, bits, 4),
            TypeKind::String => self.string_comp(op, &lhs, &rhs, bool_ty),
            &TypeKind::Simd { elem, lanes } => {
                if !matches!(op, BinOp::Eq | BinOp::NotEq) {
                    return internal_error("vectors compare only for equality");
                }
                if register_ty(&sem.types, self.target.ptr_ty, core).is_some() {
                    return self.simd_eq(op, &lhs, &rhs, bool_ty, elem);
                }
                self.array_comp(op, &lhs, &rhs, bool_ty, elem, u64::from(lanes))
            }
            &TypeKind::Array { elem, len } => self.array_comp(op, &lhs, &rhs, bool_ty, elem, len),
            &TypeKind::Matrix { elem, rows, cols } => {
                let cells = u64::from(rows) * u64::from(cols);
                self.array_comp(op, &lhs, &rhs, bool_ty, elem, cells)
            }
            TypeKind::Struct { .. } | TypeKind::Tuple { .. } | TypeKind::Union { .. } => {
                self.record_comp(op, &lhs, &rhs, bool_ty)
            }
            TypeKind::Slice { .. }
            | TypeKind::DynamicArray { .. }
            | TypeKind::Map { .. }
            | TypeKind::Any => self.shallow_comp(op, &lhs, &rhs, bool_ty),
            other => internal_error(format!("comparison over {:?}", other)),
        }
    }

    /// Operands share a core type by the time they get here, except
    /// for scalar width drift between folded constants; the narrower
    /// side widens.
    fn comp_reconcile(&mut self, lhs: KValue, rhs: KValue) -> CodegenResult<(KValue, KValue)> {
        let sem = self.sem;
        if sem.types.core(lhs.ty) == sem.types.core(rhs.ty) {
            return Ok((lhs, rhs));
        }
        let scalar = |ty| sem.types.is_integer(ty) || sem.types.is_float(ty);
        if !scalar(lhs.ty) || !scalar(rhs.ty) {
            return Ok((lhs, rhs));
        }
        if sem.types.size_of(lhs.ty) < sem.types.size_of(rhs.ty) {
            let l = self.convert_value(lhs, rhs.ty)?;
            Ok((l, rhs))
        } else {
            let ty = lhs.ty;
            let r = self.convert_value(rhs, ty)?;
            Ok((lhs, r))
        }
    }

    fn int_comp(
        &mut self,
        op: BinOp,
        lhs: &KValue,
        rhs: &KValue,
        bool_ty: TypeId,
    ) -> CodegenResult<KValue> {
        let sem = self.sem;
        let unsigned = sem.types.is_unsigned(lhs.ty);
        let mut l = self.scalar_reg(lhs)?;
        let mut r = self.scalar_reg(rhs)?;
        // equality is bytewise; order tests need native byte order
        let ordered = !matches!(op, BinOp::Eq | BinOp::NotEq);
        if ordered && sem.types.is_foreign_endian(lhs.ty) {
            l = self.byte_swap(l);
            r = self.byte_swap(r);
        }
        let cc = int_cc(op, unsigned)?;
        Ok(KValue::register(self.b.ins().icmp(cc, l, r), bool_ty))
    }

    fn float_comp(
        &mut self,
        op: BinOp,
        lhs: &KValue,
        rhs: &KValue,
        bool_ty: TypeId,
    ) -> CodegenResult<KValue> {
        let sem = self.sem;
        let mut l = self.scalar_reg(lhs)?;
        let mut r = self.scalar_reg(rhs)?;
        // the bits only mean a float in native order
        if sem.types.is_foreign_endian(lhs.ty) {
            l = self.float_byte_swap(l);
            r = self.float_byte_swap(r);
        }
        let cc = float_cc(op)?;
        Ok(KValue::register(self.b.ins().fcmp(cc, l, r), bool_ty))
    }

    /// Set relations: equality on the backing word, subset tests for
    /// the order forms.
    fn bit_set_comp(
        &mut self,
        op: BinOp,
        lhs: &KValue,
        rhs: &KValue,
        bool_ty: TypeId,
    ) -> CodegenResult<KValue> {
        let l = self.scalar_reg(lhs)?;
        let r = self.scalar_reg(rhs)?;
        let v = match op {
            BinOp::Eq => self.b.ins().icmp(IntCC::Equal, l, r),
            BinOp::NotEq => self.b.ins().icmp(IntCC::NotEqual, l, r),
            BinOp::LtEq => {
                let both = self.b.ins().band(l, r);
                self.b.ins().icmp(IntCC::Equal, both, l)
            }
            BinOp::GtEq => {
                let both = self.b.ins().band(l, r);
                self.b.ins().icmp(IntCC::Equal, both, r)
            }
            BinOp::Lt => {
                let both = self.b.ins().band(l, r);
                let sub = self.b.ins().icmp(IntCC::Equal, both, l);
                let ne = self.b.ins().icmp(IntCC::NotEqual, l, r);
                self.b.ins().band(sub, ne)
            }
            BinOp::Gt => {
                let both = self.b.ins().band(l, r);
                let sup = self.b.ins().icmp(IntCC::Equal, both, r);
                let ne = self.b.ins().icmp(IntCC::NotEqual, l, r);
                self.b.ins().band(sup, ne)
            }
            _ => return internal_error("operator not defined over bit sets"),
        };
        Ok(KValue::register(v, bool_ty))
    }

    /// Componentwise equality over a float pack.
    fn pack_eq(
        &mut self,
        op: BinOp,
        lhs: &KValue,
        rhs: &KValue,
        bool_ty: TypeId,
        bits: u16,
        n: u64,
    ) -> CodegenResult<KValue> {
        if !matches!(op, BinOp::Eq | BinOp::NotEq) {
            return internal_error("float packs are unordered");
        }
        let cl = float_class(bits)?;
        let comp = u64::from(bits) / 8;
        let lp = self.spill_to_ptr(lhs)?;
        let rp = self.spill_to_ptr(rhs)?;
        let mut all: Option<Value> = None;
        for i in 0..n {
            let off = (i * comp) as i32;
            let a = self.b.ins().load(cl, MemFlags::new(), lp, off);
            let b = self.b.ins().load(cl, MemFlags::new(), rp, off);
            let eq = self.b.ins().fcmp(FloatCC::Equal, a, b);
            all = Some(match all {
                Some(s) => self.b.ins().band(s, eq),
                None => eq,
            });
        }
        let mut v = match all {
            Some(v) => v,
            None => self.b.ins().iconst(types::I8, 1),
        };
        if op == BinOp::NotEq {
            v = self.b.ins().bxor_imm(v, 1);
        }
        Ok(KValue::register(v, bool_ty))
    }

    /// String relations via the runtime: pointer and length pairs in,
    /// one byte back.
    fn string_comp(
        &mut self,
        op: BinOp,
        lhs: &KValue,
        rhs: &KValue,
        bool_ty: TypeId,
    ) -> CodegenResult<KValue> {
        let word = self.target.ptr_ty;
        let wb = self.sem.types.ptr_bytes() as i32;
        let lp = self.spill_to_ptr(lhs)?;
        let rp = self.spill_to_ptr(rhs)?;
        let a_ptr = self.b.ins().load(word, MemFlags::new(), lp, 0);
        let a_len = self.b.ins().load(word, MemFlags::new(), lp, wb);
        let b_ptr = self.b.ins().load(word, MemFlags::new(), rp, 0);
        let b_len = self.b.ins().load(word, MemFlags::new(), rp, wb);
        let (helper, swapped, invert) = match op {
            BinOp::Eq => ("keel_string_eq", false, false),
            BinOp::NotEq => ("keel_string_eq", false, true),
            BinOp::Lt => ("keel_string_lt", false, false),
            BinOp::Gt => ("keel_string_lt", true, false),
            // a <= b reads as not (b < a), and mirrored for >=
            BinOp::LtEq => ("keel_string_lt", true, true),
            BinOp::GtEq => ("keel_string_lt", false, true),
            _ => return internal_error("arithmetic operator in a comparison"),
        };
        let args = if swapped {
            [b_ptr, b_len, a_ptr, a_len]
        } else {
            [a_ptr, a_len, b_ptr, b_len]
        };
        let mut call_args = Vec::with_capacity(args.len());
        for &a in &args {
            call_args.push(self.cast_int_edge(a, types::I64, false));
        }
        let fref = self.runtime_ref(helper)?;
        let call = self.b.ins().call(fref, &call_args);
        let mut v = self.b.inst_results(call)[0];
        if invert {
            v = self.b.ins().bxor_imm(v, 1);
        }
        Ok(KValue::register(v, bool_ty))
    }

    /// Vector equality: one wide compare and a mask reduction.
    fn simd_eq(
        &mut self,
        op: BinOp,
        lhs: &KValue,
        rhs: &KValue,
        bool_ty: TypeId,
        elem: TypeId,
    ) -> CodegenResult<KValue> {
        let sem = self.sem;
        let float = sem.types.is_float(elem);
        let l = self.scalar_reg(lhs)?;
        let r = self.scalar_reg(rhs)?;
        let v = if op == BinOp::Eq {
            let mask = if float {
                self.b.ins().fcmp(FloatCC::Equal, l, r)
            } else {
                self.b.ins().icmp(IntCC::Equal, l, r)
            };
            self.b.ins().vall_true(mask)
        } else {
            let mask = if float {
                self.b.ins().fcmp(FloatCC::NotEqual, l, r)
            } else {
                self.b.ins().icmp(IntCC::NotEqual, l, r)
            };
            self.b.ins().vany_true(mask)
        };
        Ok(KValue::register(v, bool_ty))
    }

    /// Deep array equality. Bytewise-meaningful layouts go through the
    /// runtime block compare; everything else folds element tests.
    /// Ordering exists only for byte-element arrays, memcmp style.
    fn array_comp(
        &mut self,
        op: BinOp,
        lhs: &KValue,
        rhs: &KValue,
        bool_ty: TypeId,
        elem: TypeId,
        len: u64,
    ) -> CodegenResult<KValue> {
        let sem = self.sem;
        let core = sem.types.core(lhs.ty);
        let simple = sem.types.layout(core).simple_compare;
        let esize = sem.types.size_of(elem);
        let lp = self.spill_to_ptr(lhs)?;
        let rp = self.spill_to_ptr(rhs)?;
        if !matches!(op, BinOp::Eq | BinOp::NotEq) {
            if !simple || esize != 1 {
                return internal_error("array ordering is bytewise only");
            }
            let res = self.memory_compare_call(lp, rp, len)?;
            let cc = int_cc(op, false)?;
            let v = self.b.ins().icmp_imm(cc, res, 0);
            return Ok(KValue::register(v, bool_ty));
        }
        let mut v = if simple {
            self.memory_equal_call(lp, rp, esize * len)?
        } else if len <= 16 {
            let mut all: Option<Value> = None;
            for i in 0..len {
                let la = self.at_off(lp, i * esize);
                let ra = self.at_off(rp, i * esize);
                let l = self.emit_load(la, elem)?;
                let r = self.emit_load(ra, elem)?;
                let eq = self.emit_comp(BinOp::Eq, l, r, bool_ty)?;
                let eq = eq.as_register()?;
                all = Some(match all {
                    Some(s) => self.b.ins().band(s, eq),
                    None => eq,
                });
            }
            match all {
                Some(v) => v,
                None => self.b.ins().iconst(types::I8, 1),
            }
        } else {
            // counted fold; the running truth rides a block parameter
            let word = self.target.ptr_ty;
            let head = self.b.create_block();
            self.b.append_block_param(head, word);
            self.b.append_block_param(head, types::I8);
            let body = self.b.create_block();
            let done = self.b.create_block();
            self.b.append_block_param(done, types::I8);
            let zero = self.iconst_word(0);
            let one = self.b.ins().iconst(types::I8, 1);
            self.b.ins().jump(head, &[zero, one]);
            self.switch_region(head);
            let i = self.b.block_params(head)[0];
            let acc = self.b.block_params(head)[1];
            let n = self.iconst_word(len as i64);
            let more = self.b.ins().icmp(IntCC::UnsignedLessThan, i, n);
            self.b.ins().brif(more, body, &[], done, &[acc]);
            self.switch_region(body);
            let off = self.b.ins().imul_imm(i, esize as i64);
            let la = self.b.ins().iadd(lp, off);
            let ra = self.b.ins().iadd(rp, off);
            let l = self.emit_load(la, elem)?;
            let r = self.emit_load(ra, elem)?;
            let eq = self.emit_comp(BinOp::Eq, l, r, bool_ty)?;
            let eq = eq.as_register()?;
            let folded = self.b.ins().band(acc, eq);
            let next = self.b.ins().iadd_imm(i, 1);
            self.b.ins().jump(head, &[next, folded]);
            self.switch_region(done);
            self.b.block_params(done)[0]
        };
        if op == BinOp::NotEq {
            v = self.b.ins().bxor_imm(v, 1);
        }
        Ok(KValue::register(v, bool_ty))
    }

    /// Record equality: the generated routine for padded shapes, a
    /// word test for maybe-pointer unions, a block compare when
    /// bytewise equality is meaningful.
    fn record_comp(
        &mut self,
        op: BinOp,
        lhs: &KValue,
        rhs: &KValue,
        bool_ty: TypeId,
    ) -> CodegenResult<KValue> {
        if !matches!(op, BinOp::Eq | BinOp::NotEq) {
            return internal_error("records compare only for equality");
        }
        let sem = self.sem;
        let core = sem.types.core(lhs.ty);
        let lp = self.spill_to_ptr(lhs)?;
        let rp = self.spill_to_ptr(rhs)?;
        if let TypeKind::Union {
            maybe_pointer: true,
            ..
        } = sem.types.kind(core)
        {
            let word = self.target.ptr_ty;
            let a = self.b.ins().load(word, MemFlags::new(), lp, 0);
            let b = self.b.ins().load(word, MemFlags::new(), rp, 0);
            let cc = if op == BinOp::Eq {
                IntCC::Equal
            } else {
                IntCC::NotEqual
            };
            return Ok(KValue::register(self.b.ins().icmp(cc, a, b), bool_ty));
        }
        let mut v = if needs_equality_proc(&sem.types, core) {
            let fref = match self.refs.equal.get(&core) {
                Some(&f) => f,
                None => return internal_error("equality routine was not prepared for this body"),
            };
            let call = self.b.ins().call(fref, &[lp, rp]);
            self.b.inst_results(call)[0]
        } else if sem.types.layout(core).simple_compare {
            self.memory_equal_call(lp, rp, sem.types.size_of(core))?
        } else {
            return internal_error("record shape has no equality form");
        };
        if op == BinOp::NotEq {
            v = self.b.ins().bxor_imm(v, 1);
        }
        Ok(KValue::register(v, bool_ty))
    }

    /// Reference headers compare by identity: same words, same object.
    fn shallow_comp(
        &mut self,
        op: BinOp,
        lhs: &KValue,
        rhs: &KValue,
        bool_ty: TypeId,
    ) -> CodegenResult<KValue> {
        if !matches!(op, BinOp::Eq | BinOp::NotEq) {
            return internal_error("reference headers compare only for equality");
        }
        let word = self.target.ptr_ty;
        let wb = self.sem.types.ptr_bytes();
        let lp = self.spill_to_ptr(lhs)?;
        let rp = self.spill_to_ptr(rhs)?;
        let mut all: Option<Value> = None;
        for i in 0..2u64 {
            let off = (i * wb) as i32;
            let a = self.b.ins().load(word, MemFlags::new(), lp, off);
            let b = self.b.ins().load(word, MemFlags::new(), rp, off);
            let eq = self.b.ins().icmp(IntCC::Equal, a, b);
            all = Some(match all {
                Some(s) => self.b.ins().band(s, eq),
                None => eq,
            });
        }
        let mut v = match all {
            Some(v) => v,
            None => self.b.ins().iconst(types::I8, 1),
        };
        if op == BinOp::NotEq {
            v = self.b.ins().bxor_imm(v, 1);
        }
        Ok(KValue::register(v, bool_ty))
    }

    fn memory_compare_call(&mut self, a: Value, b: Value, size: u64) -> CodegenResult<Value> {
        let a = self.cast_int_edge(a, types::I64, false);
        let b = self.cast_int_edge(b, types::I64, false);
        let n = self.b.ins().iconst(types::I64, size as i64);
        let fref = self.runtime_ref("keel_memory_compare")?;
        let call = self.b.ins().call(fref, &[a, b, n]);
        Ok(self.b.inst_results(call)[0])
    }

    fn memory_equal_call(&mut self, a: Value, b: Value, size: u64) -> CodegenResult<Value> {
        let a = self.cast_int_edge(a, types::I64, false);
        let b = self.cast_int_edge(b, types::I64, false);
        let n = self.b.ins().iconst(types::I64, size as i64);
        let fref = self.runtime_ref("keel_memory_equal")?;
        let call = self.b.ins().call(fref, &[a, b, n]);
        Ok(self.b.inst_results(call)[0])
    }

    // ─── Unary ──────────────────────────────────────────────────

    pub(crate) fn emit_unary(
        &mut self,
        op: UnOp,
        operand: KValue,
        result_ty: TypeId,
    ) -> CodegenResult<KValue> {
        let sem = self.sem;
        let core = sem.types.core(result_ty);
        match op {
            UnOp::Not => {
                let v = self.scalar_reg(&operand)?;
                let flipped = self.b.ins().icmp_imm(IntCC::Equal, v, 0);
                Ok(KValue::register(flipped, result_ty))
            }
            UnOp::BitNot => {
                // complement commutes with byte order, no swaps
                if register_ty(&sem.types, self.target.ptr_ty, core).is_some() {
                    let v = self.scalar_reg(&operand)?;
                    return Ok(KValue::register(self.b.ins().bnot(v), result_ty));
                }
                self.lanewise_unary(op, operand, result_ty)
            }
            UnOp::Neg => match sem.types.kind(core) {
                TypeKind::Int { .. } => {
                    let swap = sem.types.is_foreign_endian(result_ty);
                    let mut v = self.scalar_reg(&operand)?;
                    if swap {
                        v = self.byte_swap(v);
                    }
                    let mut v = self.b.ins().ineg(v);
                    if swap {
                        v = self.byte_swap(v);
                    }
                    Ok(KValue::register(v, result_ty))
                }
                TypeKind::Float { .. } => {
                    let swap = sem.types.is_foreign_endian(result_ty);
                    let mut v = self.scalar_reg(&operand)?;
                    if swap {
                        v = self.float_byte_swap(v);
                    }
                    let mut v = self.b.ins().fneg(v);
                    if swap {
                        v = self.float_byte_swap(v);
                    }
                    Ok(KValue::register(v, result_ty))
                }
                &TypeKind::Simd { elem, .. } => {
                    if register_ty(&sem.types, self.target.ptr_ty, core).is_some() {
                        let v = self.scalar_reg(&operand)?;
                        let neg = if sem.types.is_float(elem) {
                            self.b.ins().fneg(v)
                        } else {
                            self.b.ins().ineg(v)
                        };
                        return Ok(KValue::register(neg, result_ty));
                    }
                    self.lanewise_unary(op, operand, result_ty)
                }
                &TypeKind::Complex { bits } => self.pack_neg(&operand, result_ty, bits, 2),
                &TypeKind::Quaternion { bits } => self.pack_neg(&operand, result_ty, bits, 4),
                TypeKind::Array { .. } | TypeKind::Matrix { .. } => {
                    self.lanewise_unary(op, operand, result_ty)
                }
                other => internal_error(format!("negation over {:?}", other)),
            },
        }
    }

    /// Element walk for unary ops over array shapes.
    fn lanewise_unary(
        &mut self,
        op: UnOp,
        operand: KValue,
        result_ty: TypeId,
    ) -> CodegenResult<KValue> {
        let sem = self.sem;
        let (elem, len) = match sem.types.kind(sem.types.core(result_ty)) {
            &TypeKind::Array { elem, len } => (elem, len),
            &TypeKind::Simd { elem, lanes } => (elem, u64::from(lanes)),
            &TypeKind::Matrix { elem, rows, cols } => (elem, u64::from(rows) * u64::from(cols)),
            other => return internal_error(format!("unary walk over {:?}", other)),
        };
        let esize = sem.types.size_of(elem);
        let p = self.spill_to_ptr(&operand)?;
        let out = self.alloc_local(result_ty, false)?;
        let out_ptr = self.addr_get_ptr(&out)?;
        if len <= 16 {
            for i in 0..len {
                let ea = self.at_off(p, i * esize);
                let e = self.emit_load(ea, elem)?;
                let v = self.emit_unary(op, e, elem)?;
                let oa = self.at_off(out_ptr, i * esize);
                self.emit_store(oa, v)?;
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
            let ea = self.b.ins().iadd(p, off);
            let oa = self.b.ins().iadd(out_ptr, off);
            let e = self.emit_load(ea, elem)?;
            let v = self.emit_unary(op, e, elem)?;
            self.emit_store(oa, v)?;
            let next = self.b.ins().iadd_imm(i, 1);
            self.b.ins().jump(head, &[next]);
            self.switch_region(done);
        }
        Ok(KValue::address(out_ptr, result_ty))
    }

    /// Componentwise negation of a float pack.
    fn pack_neg(
        &mut self,
        operand: &KValue,
        result_ty: TypeId,
        bits: u16,
        n: u64,
    ) -> CodegenResult<KValue> {
        let cl = float_class(bits)?;
        let comp = u64::from(bits) / 8;
        let p = self.spill_to_ptr(operand)?;
        let out = self.alloc_local(result_ty, false)?;
        let out_ptr = self.addr_get_ptr(&out)?;
        for i in 0..n {
            let off = (i * comp) as i32;
            let a = self.b.ins().load(cl, MemFlags::new(), p, off);
            let v = self.b.ins().fneg(a);
            self.b.ins().store(MemFlags::new(), v, out_ptr, off);
        }
        Ok(KValue::address(out_ptr, result_ty))
    }

    // ─── Bit intrinsics ─────────────────────────────────────────

    /// Population and zero counts lower to native bit instructions;
    /// bit reversal always goes through the runtime.
    pub(crate) fn emit_bit_intrinsic(
        &mut self,
        op: IntrinsicOp,
        operand: KValue,
        result_ty: TypeId,
    ) -> CodegenResult<KValue> {
        let sem = self.sem;
        let mut v = self.scalar_reg(&operand)?;
        if sem.types.is_foreign_endian(operand.ty) {
            v = self.byte_swap(v);
        }
        let have = self.b.func.dfg.value_type(v);
        let res = match op {
            IntrinsicOp::CountOnes => self.b.ins().popcnt(v),
            IntrinsicOp::LeadingZeros => self.b.ins().clz(v),
            IntrinsicOp::TrailingZeros => self.b.ins().ctz(v),
            IntrinsicOp::ReverseBits => {
                if have.bits() > 64 {
                    return internal_error("bit reversal is capped at 64-bit operands");
                }
                let wide = self.cast_int_edge(v, types::I64, false);
                let width = self.b.ins().iconst(types::I64, i64::from(have.bits()));
                let fref = self.runtime_ref("keel_reverse_bits")?;
                let call = self.b.ins().call(fref, &[wide, width]);
                let raw = self.b.inst_results(call)[0];
                self.cast_int_edge(raw, have, false)
            }
            IntrinsicOp::Len => {
                return internal_error("length is resolved at the expression layer")
            }
        };
        let want = match register_ty(&sem.types, self.target.ptr_ty, result_ty) {
            Some(c) => c,
            None => return internal_error("bit intrinsic with a non-integer result"),
        };
        let res = self.cast_int_edge(res, want, false);
        Ok(KValue::register(res, result_ty))
    }
}

/// Operators with a single-instruction form over whole vectors. Shifts
/// stay lane-wise: the scalar rule zeroes on overlong counts, the
/// vector instruction would not.
fn vectorizable(op: BinOp, float: bool) -> bool {
    match op {
        BinOp::Add | BinOp::Sub | BinOp::Mul => true,
        BinOp::Div => float,
        BinOp::BitAnd | BinOp::BitOr | BinOp::BitXor | BinOp::AndNot => !float,
        _ => false,
    }
}

fn matrix_shape(types_tbl: &keel_sem::TypeTable, ty: TypeId) -> Option<(TypeId, u32, u32)> {
    match *types_tbl.kind(types_tbl.core(ty)) {
        TypeKind::Matrix { elem, rows, cols } => Some((elem, rows, cols)),
        _ => None,
    }
}

fn vector_shape(types_tbl: &keel_sem::TypeTable, ty: TypeId) -> Option<(TypeId, u64)> {
    match *types_tbl.kind(types_tbl.core(ty)) {
        TypeKind::Array { elem, len } => Some((elem, len)),
        TypeKind::Simd { elem, lanes } => Some((elem, u64::from(lanes))),
        _ => None,
    }
}

fn int_cc(op: BinOp, unsigned: bool) -> CodegenResult<IntCC> {
    Ok(match op {
        BinOp::Eq => IntCC::Equal,
        BinOp::NotEq => IntCC::NotEqual,
        BinOp::Lt if unsigned => IntCC::UnsignedLessThan,
        BinOp::Lt => IntCC::SignedLessThan,
        BinOp::Gt if unsigned => IntCC::UnsignedGreaterThan,
        BinOp::Gt => IntCC::SignedGreaterThan,
        BinOp::LtEq if unsigned => IntCC::UnsignedLessThanOrEqual,
        BinOp::LtEq => IntCC::SignedLessThanOrEqual,
        BinOp::GtEq if unsigned => IntCC::UnsignedGreaterThanOrEqual,
        BinOp::GtEq => IntCC::SignedGreaterThanOrEqual,
        _ => return internal_error("arithmetic operator in a comparison"),
    })
}

fn float_cc(op: BinOp) -> CodegenResult<FloatCC> {
    Ok(match op {
        BinOp::Eq => FloatCC::Equal,
        BinOp::NotEq => FloatCC::NotEqual,
        BinOp::Lt => FloatCC::LessThan,
        BinOp::Gt => FloatCC::GreaterThan,
        BinOp::LtEq => FloatCC::LessThanOrEqual,
        BinOp::GtEq => FloatCC::GreaterThanOrEqual,
        _ => return internal_error("arithmetic operator in a comparison"),
    })
}
