// SPDX-License-Identifier: (MIT OR Apache-2.0)

//! Expression lowering.
//!
//! `build_expr` turns a checked expression into a [`Value`]; `build_addr`
//! turns an addressable one into an [`Addr`]. Folded constants
//! short-circuit before any kind dispatch, so every other path can
//! assume a runtime operand. Short-circuit `&&`/`||` are control flow,
//! not data flow: they fold into regions through `build_cond_br` and
//! rejoin on a block parameter.

use cranelift::prelude::*;

use keel_sem::{
    BinOp, ConstValue, EntityKind, Expr, ExprKind, IntrinsicOp, Mode, SelStep, Selection, SemError,
    TypeId, TypeKind, UnOp, MAX_SWIZZLE_INLINE,
};

use crate::convert::retype;
use crate::proc::ProcLowering;
use crate::value::{register_ty, Addr, Value as KValue};
use crate::{internal_error, CodegenResult};

impl<'a> ProcLowering<'a> {
    // ─── Entry points ───────────────────────────────────────────

    /// Lower an expression to its value, with the expression's check
    /// flags merged over the enclosing statement's for its extent.
    pub(crate) fn build_expr(&mut self, expr: &Expr) -> CodegenResult<KValue> {
        let saved = self.flags;
        self.flags = saved.merge(expr.flags);
        let out = self.expr_value(expr);
        self.flags = saved;
        out
    }

    /// Lower an addressable expression to storage.
    pub(crate) fn build_addr(&mut self, expr: &Expr) -> CodegenResult<Addr> {
        let saved = self.flags;
        self.flags = saved.merge(expr.flags);
        let out = self.addr_of(expr);
        self.flags = saved;
        out
    }

    fn expr_value(&mut self, expr: &Expr) -> CodegenResult<KValue> {
        let sem = self.sem;
        if expr.mode == Mode::Constant {
            let folded = match &expr.value {
                Some(v) => v.clone(),
                None => return internal_error("constant expression without a folded value"),
            };
            return self.const_value(&folded, expr.ty);
        }
        match &expr.kind {
            ExprKind::Lit => internal_error("literal outside constant mode"),
            ExprKind::Ident(eid) => {
                let ent = sem.entity(*eid);
                match &ent.kind {
                    EntityKind::Constant(cv) => {
                        let cv = cv.clone();
                        self.const_value(&cv, expr.ty)
                    }
                    // resolved lazily, at first data-flow use
                    EntityKind::Proc(_) => Ok(KValue::symbol(*eid, expr.ty)),
                    _ => {
                        let addr = self.addr_of(expr)?;
                        self.addr_load(&addr)
                    }
                }
            }
            ExprKind::ContextRef => {
                let addr = self.context_addr(expr.ty)?;
                self.addr_load(&addr)
            }
            ExprKind::Binary { op, lhs, rhs } => match *op {
                BinOp::And | BinOp::Or => self.short_circuit(expr),
                op if op.is_comparison() => {
                    let l = self.build_expr(lhs)?;
                    let r = self.build_expr(rhs)?;
                    self.emit_comp(op, l, r, expr.ty)
                }
                op => {
                    let l = self.build_expr(lhs)?;
                    let r = self.build_expr(rhs)?;
                    self.emit_arith(op, l, r, expr.ty)
                }
            },
            ExprKind::Unary { op, operand } => {
                let v = self.build_expr(operand)?;
                self.emit_unary(*op, v, expr.ty)
            }
            ExprKind::Call { callee, args } => self.build_call(expr, callee, args),
            ExprKind::Intrinsic { op, args } => self.build_intrinsic(expr, *op, args),
            ExprKind::Selector { base, sel } => self.selector_value(expr, base, sel),
            ExprKind::Index { .. } | ExprKind::Swizzle { .. } | ExprKind::Deref { .. } => {
                let addr = self.addr_of(expr)?;
                self.addr_load(&addr)
            }
            ExprKind::SliceExpr { base, lo, hi } => {
                self.slice_expr(expr, base, lo.as_deref(), hi.as_deref())
            }
            ExprKind::AddressOf { base } => {
                let addr = self.build_addr(base)?;
                let p = self.addr_get_ptr(&addr)?;
                Ok(KValue::register(p, expr.ty))
            }
            ExprKind::Convert { operand } => {
                let v = self.build_expr(operand)?;
                self.convert_value(v, expr.ty)
            }
            ExprKind::Transmute { operand } => {
                let v = self.build_expr(operand)?;
                self.transmute_value(v, expr.ty)
            }
            ExprKind::TypeAssert { operand, with_ok } => {
                if *with_ok {
                    // the two-value form only makes sense feeding a
                    // multi-assignment, which routes around build_expr
                    return internal_error("two-value assertion outside a multi-value context");
                }
                self.type_assert(expr, operand)
            }
        }
    }

    fn expr_addr(&mut self, expr: &Expr) -> CodegenResult<Addr> {
        let sem = self.sem;
        match &expr.kind {
            ExprKind::Ident(eid) => {
                let ent = sem.entity(*eid);
                match &ent.kind {
                    EntityKind::Local | EntityKind::Param { .. } | EntityKind::Result { .. } => {
                        self.entity_slot(*eid)
                    }
                    EntityKind::Global { .. } | EntityKind::StaticLocal { .. } => {
                        Ok(Addr::plain(KValue::symbol(*eid, expr.ty)))
                    }
                    _ => internal_error("entity has no storage"),
                }
            }
            ExprKind::ContextRef => self.context_addr(expr.ty),
            ExprKind::Index { base, index } => {
                let base_addr = self.expr_storage(base)?;
                let idx = self.build_expr(index)?;
                self.element_addr(base_addr, base.ty, idx, expr.ty)
            }
            ExprKind::Selector { base, sel } => {
                // context fields keep their keyed mode so stores route
                // through the record's write protocol
                if let ExprKind::ContextRef = base.kind {
                    let record = self.context_addr(base.ty)?;
                    return Ok(Addr::Context {
                        base: record.into_base(),
                        sel: sel.clone(),
                        field_ty: expr.ty,
                    });
                }
                let base_addr = self.expr_storage(base)?;
                self.sel_addr(base_addr, sel, expr.ty)
            }
            ExprKind::Swizzle { base, indices } => {
                let base_addr = self.expr_storage(base)?;
                let p = self.addr_get_ptr(&base_addr)?;
                let bv = KValue::address(p, base.ty);
                if indices.len() <= MAX_SWIZZLE_INLINE {
                    let mut inline = [0u8; MAX_SWIZZLE_INLINE];
                    for (i, &lane) in indices.iter().enumerate() {
                        inline[i] = lane;
                    }
                    Ok(Addr::Swizzle {
                        base: bv,
                        result_ty: expr.ty,
                        count: indices.len() as u8,
                        indices: inline,
                    })
                } else {
                    Ok(Addr::SwizzleLarge {
                        base: bv,
                        result_ty: expr.ty,
                        indices: indices.iter().map(|&i| u16::from(i)).collect(),
                    })
                }
            }
            ExprKind::Deref { base } => {
                if let TypeKind::RelativePointer { .. } = sem.types.kind(sem.types.core(base.ty)) {
                    let storage = self.expr_storage(base)?;
                    let p = self.addr_get_ptr(&storage)?;
                    return Ok(Addr::RelativePointer {
                        base: KValue::address(p, base.ty),
                        deref: true,
                    });
                }
                let pv = self.build_expr(base)?;
                let pv = self.resolve(pv)?;
                Ok(Addr::plain(pv))
            }
            _ => internal_error("expression is not addressable"),
        }
    }

    /// `expr_addr` plus the storage-type refinement pass.
    fn addr_of(&mut self, expr: &Expr) -> CodegenResult<Addr> {
        let addr = self.expr_addr(expr)?;
        self.refine_addr(addr)
    }

    /// Re-sort a plain address by its stored type. Self-relative kinds
    /// must not be read with a raw load: their register value is the
    /// resolved absolute pointer, not the stored offset.
    fn refine_addr(&mut self, addr: Addr) -> CodegenResult<Addr> {
        let sem = self.sem;
        let ty = addr.addressable_ty(&sem.types)?;
        match sem.types.kind(sem.types.core(ty)) {
            TypeKind::RelativePointer { .. } => match addr {
                Addr::Default { base } => Ok(Addr::RelativePointer { base, deref: false }),
                other => Ok(other),
            },
            TypeKind::RelativeSlice { .. } => match addr {
                Addr::Default { base } => Ok(Addr::RelativeSlice { base }),
                other => Ok(other),
            },
            _ => Ok(addr),
        }
    }

    /// Storage holding the expression's value: its own when the checker
    /// says it is addressable, a fresh spill otherwise.
    pub(crate) fn expr_storage(&mut self, expr: &Expr) -> CodegenResult<Addr> {
        if expr.mode == Mode::Variable {
            return self.build_addr(expr);
        }
        let v = self.build_expr(expr)?;
        let p = self.spill_to_ptr(&v)?;
        Ok(Addr::plain(KValue::address(p, expr.ty)))
    }

    /// Storage of the implicit context record for this body.
    fn context_addr(&mut self, ty: TypeId) -> CodegenResult<Addr> {
        let gv = match self.refs.context {
            Some(g) => g,
            None => return internal_error("context record was not prepared for this body"),
        };
        let p = self.b.ins().global_value(self.target.ptr_ty, gv);
        Ok(Addr::plain(KValue::address(p, ty)))
    }

    // ─── Constants ──────────────────────────────────────────────

    /// Materialize a folded literal as a value of `ty`.
    fn const_value(&mut self, folded: &ConstValue, ty: TypeId) -> CodegenResult<KValue> {
        match folded {
            ConstValue::Nil => self.zero_value(ty),
            ConstValue::Uninit => {
                // deliberate garbage: fresh storage, nothing written
                let out = self.alloc_local(ty, false)?;
                self.addr_load(&out)
            }
            ConstValue::Bool(v) => {
                let reg = self.b.ins().iconst(types::I8, i64::from(*v));
                Ok(KValue::register(reg, ty))
            }
            ConstValue::Int(v) => self.int_const_value(*v, ty),
            ConstValue::Float(v) => {
                let bits = match self.sem.types.kind(self.sem.types.core(ty)) {
                    TypeKind::Float { bits, .. } => *bits,
                    other => {
                        return internal_error(format!("float literal of type {:?}", other))
                    }
                };
                self.float_const_value(*v, bits, ty)
            }
            ConstValue::Str(s) => self.string_value(s, ty),
            ConstValue::Aggregate(elems) => self.aggregate_const(elems, ty),
        }
    }

    fn int_const_value(&mut self, v: i128, ty: TypeId) -> CodegenResult<KValue> {
        let sem = self.sem;
        // folded integers can land in float context through constant
        // declarations; the type wins
        if let TypeKind::Float { bits, .. } = *sem.types.kind(sem.types.core(ty)) {
            return self.float_const_value(v as f64, bits, ty);
        }
        let cl = match register_ty(&sem.types, self.target.ptr_ty, ty) {
            Some(c) => c,
            None => return internal_error("integer literal for a non-register type"),
        };
        if cl.is_vector() {
            return internal_error("vector literal must arrive as an aggregate");
        }
        let mut reg = if cl == types::I128 {
            let lo = self.b.ins().iconst(types::I64, v as u64 as i64);
            let hi = self.b.ins().iconst(types::I64, (v >> 64) as i64);
            self.b.ins().iconcat(lo, hi)
        } else {
            self.b.ins().iconst(cl, narrow_imm(v, cl.bits()))
        };
        if sem.types.is_foreign_endian(ty) {
            // register values of explicit-endian types carry their
            // in-memory byte order
            reg = self.byte_swap(reg);
        }
        Ok(KValue::register(reg, ty))
    }

    fn float_const_value(&mut self, v: f64, bits: u16, ty: TypeId) -> CodegenResult<KValue> {
        let mut reg = match bits {
            32 => self.b.ins().f32const(v as f32),
            64 => self.b.ins().f64const(v),
            other => return internal_error(format!("{other}-bit float literal")),
        };
        if self.sem.types.is_foreign_endian(ty) {
            reg = self.float_byte_swap(reg);
        }
        Ok(KValue::register(reg, ty))
    }

    /// A string literal: header over the interned payload, or the raw
    /// payload pointer for the NUL-terminated pointer forms.
    fn string_value(&mut self, content: &str, ty: TypeId) -> CodegenResult<KValue> {
        let sem = self.sem;
        let gv = match self.refs.strings.get(content) {
            Some(&g) => g,
            None => return internal_error("string literal was not interned by the prepass"),
        };
        let data = self.b.ins().global_value(self.target.ptr_ty, gv);
        match sem.types.kind(sem.types.core(ty)) {
            TypeKind::String | TypeKind::Slice { .. } => {
                let out = self.alloc_local(ty, false)?;
                let out_ptr = self.addr_get_ptr(&out)?;
                self.b.ins().store(MemFlags::new(), data, out_ptr, 0);
                let len = self.iconst_word(content.len() as i64);
                self.b
                    .ins()
                    .store(MemFlags::new(), len, out_ptr, self.target.ptr_bytes as i32);
                Ok(KValue::address(out_ptr, ty))
            }
            TypeKind::MultiPointer { .. } | TypeKind::RawPointer => {
                Ok(KValue::register(data, ty))
            }
            other => internal_error(format!("string literal of type {:?}", other)),
        }
    }

    /// Composite literal. Storage starts zeroed, so absent trailing
    /// elements and explicit zeros cost nothing.
    fn aggregate_const(&mut self, elems: &[ConstValue], ty: TypeId) -> CodegenResult<KValue> {
        let sem = self.sem;
        let core = sem.types.core(ty);

        if let TypeKind::Complex { bits } | TypeKind::Quaternion { bits } = sem.types.kind(core) {
            let bits = *bits;
            let out = self.alloc_local(ty, true)?;
            let ptr = self.addr_get_ptr(&out)?;
            let step = u64::from(bits) / 8;
            for (i, el) in elems.iter().enumerate() {
                let x = match el {
                    ConstValue::Float(f) => *f,
                    ConstValue::Int(v) => *v as f64,
                    other => {
                        return internal_error(format!("{:?} component in a float pack", other))
                    }
                };
                if x == 0.0 {
                    continue;
                }
                let reg = match bits {
                    32 => self.b.ins().f32const(x as f32),
                    64 => self.b.ins().f64const(x),
                    other => return internal_error(format!("{other}-bit float literal")),
                };
                self.b
                    .ins()
                    .store(MemFlags::new(), reg, ptr, (i as u64 * step) as i32);
            }
            return self.addr_load(&out);
        }

        // (component type, byte offset) in declaration order
        let comps: Vec<(TypeId, u64)> = match sem.types.kind(core) {
            TypeKind::Array { elem, len } => {
                let esize = sem.types.size_of(*elem);
                (0..*len).map(|i| (*elem, i * esize)).collect()
            }
            TypeKind::Simd { elem, lanes } => {
                let esize = sem.types.size_of(*elem);
                (0..u64::from(*lanes)).map(|i| (*elem, i * esize)).collect()
            }
            TypeKind::Matrix { elem, rows, cols } => {
                let esize = sem.types.size_of(*elem);
                let cells = u64::from(*rows) * u64::from(*cols);
                (0..cells).map(|i| (*elem, i * esize)).collect()
            }
            TypeKind::Struct { fields, .. } => fields
                .iter()
                .enumerate()
                .map(|(i, f)| (f.ty, sem.types.offset_of(core, i)))
                .collect(),
            TypeKind::Tuple { elems: tys } => tys
                .iter()
                .enumerate()
                .map(|(i, &t)| (t, sem.types.offset_of(core, i)))
                .collect(),
            other => return internal_error(format!("aggregate literal of type {:?}", other)),
        };
        if elems.len() > comps.len() {
            return internal_error("aggregate literal longer than its type");
        }

        let out = self.alloc_local(ty, true)?;
        let ptr = self.addr_get_ptr(&out)?;
        for (el, &(cty, off)) in elems.iter().zip(comps.iter()) {
            if el.is_zero() {
                continue;
            }
            let v = self.const_value(el, cty)?;
            let dst = if off == 0 {
                ptr
            } else {
                self.b.ins().iadd_imm(ptr, off as i64)
            };
            self.emit_store(dst, v)?;
        }
        self.addr_load(&out)
    }

    // ─── Projections ────────────────────────────────────────────

    /// Selector in value position. A trailing tag step reads the
    /// union's discriminant; everything else loads through the
    /// projected address.
    fn selector_value(
        &mut self,
        expr: &Expr,
        base: &Expr,
        sel: &Selection,
    ) -> CodegenResult<KValue> {
        if let Some((&SelStep::UnionTag, prefix)) = sel.steps.split_last() {
            let sem = self.sem;
            let base_addr = self.expr_storage(base)?;
            let union_ty = path_ty(&sem.types, base.ty, prefix)?;
            let union_addr = if prefix.is_empty() {
                base_addr
            } else {
                let pre = Selection {
                    steps: prefix.to_vec(),
                };
                self.sel_addr(base_addr, &pre, union_ty)?
            };
            let p = self.addr_get_ptr(&union_addr)?;
            let tag = self.union_tag_value(p, union_ty)?;
            let cl = match register_ty(&sem.types, self.target.ptr_ty, expr.ty) {
                Some(c) => c,
                None => return internal_error("tag read with a non-register result"),
            };
            let tag = self.cast_int_edge(tag, cl, false);
            return Ok(KValue::register(tag, expr.ty));
        }
        let addr = self.addr_of(expr)?;
        self.addr_load(&addr)
    }

    // ─── Calls ──────────────────────────────────────────────────

    fn build_call(&mut self, expr: &Expr, callee: &Expr, args: &[Expr]) -> CodegenResult<KValue> {
        let sem = self.sem;

        // direct when the callee names a procedure, indirect otherwise
        let mut direct = None;
        if let ExprKind::Ident(eid) = &callee.kind {
            if let EntityKind::Proc(pid) = &sem.entity(*eid).kind {
                direct = Some(*pid);
            }
        }
        let result_tys: Vec<TypeId> = match direct {
            Some(pid) => sem
                .proc(pid)
                .sig
                .results
                .iter()
                .map(|&e| sem.entity(e).ty)
                .collect(),
            None => match sem.types.kind(sem.types.core(callee.ty)) {
                TypeKind::FuncPointer { results, .. } => results.clone(),
                other => {
                    return internal_error(format!("call through non-procedure type {:?}", other))
                }
            },
        };

        // callee first, then arguments left to right
        let callee_ptr = match direct {
            Some(_) => None,
            None => {
                let v = self.build_expr(callee)?;
                Some(self.scalar_reg(&v)?)
            }
        };
        let mut call_args = Vec::with_capacity(args.len() + result_tys.len());
        for arg in args {
            let v = self.build_expr(arg)?;
            match register_ty(&sem.types, self.target.ptr_ty, v.ty) {
                Some(_) => call_args.push(self.scalar_reg(&v)?),
                None => call_args.push(self.spill_to_ptr(&v)?),
            }
        }

        // aggregate results travel through caller-allocated out slots,
        // appended after the declared arguments in result order
        let mut outs: Vec<Option<Value>> = Vec::with_capacity(result_tys.len());
        for &rty in &result_tys {
            if sem.types.is_void(rty)
                || register_ty(&sem.types, self.target.ptr_ty, rty).is_some()
            {
                outs.push(None);
                continue;
            }
            let out = self.alloc_local(rty, false)?;
            let p = self.addr_get_ptr(&out)?;
            call_args.push(p);
            outs.push(Some(p));
        }

        let inst = match direct {
            Some(pid) => {
                let fref = match self.refs.funcs.get(&pid) {
                    Some(&f) => f,
                    None => return internal_error(format!("procedure {:?} not imported", pid)),
                };
                self.b.ins().call(fref, &call_args)
            }
            None => {
                let fp = match callee_ptr {
                    Some(p) => p,
                    None => return internal_error("indirect callee was not materialized"),
                };
                let sig = self.indirect_signature(callee.ty)?;
                let sigref = self.b.import_signature(sig);
                self.b.ins().call_indirect(sigref, fp, &call_args)
            }
        };

        let raw: Vec<Value> = self.b.inst_results(inst).to_vec();
        let mut regs = raw.into_iter();
        let mut parts: Vec<KValue> = Vec::with_capacity(result_tys.len());
        for (i, &rty) in result_tys.iter().enumerate() {
            if sem.types.is_void(rty) {
                continue;
            }
            match outs[i] {
                Some(p) => parts.push(KValue::address(p, rty)),
                None => {
                    let r = match regs.next() {
                        Some(r) => r,
                        None => {
                            return internal_error("call returned fewer results than declared")
                        }
                    };
                    parts.push(KValue::register(r, rty));
                }
            }
        }
        match parts.len() {
            0 => Ok(KValue::multi(Vec::new(), expr.ty)),
            1 => Ok(parts.remove(0)),
            _ => Ok(KValue::multi(parts, expr.ty)),
        }
    }

    /// IR signature for a call through a function pointer. Mirrors the
    /// declared-procedure rule: register scalars in line, aggregates by
    /// pointer, aggregate results as trailing out pointers.
    fn indirect_signature(&mut self, fp_ty: TypeId) -> CodegenResult<Signature> {
        let sem = self.sem;
        let (params, results) = match sem.types.kind(sem.types.core(fp_ty)) {
            TypeKind::FuncPointer { params, results } => (params, results),
            other => {
                return internal_error(format!("signature of non-procedure type {:?}", other))
            }
        };
        let mut sig = Signature::new(self.target.call_conv);
        for &p in params {
            let abi = register_ty(&sem.types, self.target.ptr_ty, p).unwrap_or(self.target.ptr_ty);
            sig.params.push(AbiParam::new(abi));
        }
        for &r in results {
            if sem.types.is_void(r) {
                continue;
            }
            match register_ty(&sem.types, self.target.ptr_ty, r) {
                Some(t) => sig.returns.push(AbiParam::new(t)),
                None => sig.params.push(AbiParam::new(self.target.ptr_ty)),
            }
        }
        Ok(sig)
    }

    fn build_intrinsic(
        &mut self,
        expr: &Expr,
        op: IntrinsicOp,
        args: &[Expr],
    ) -> CodegenResult<KValue> {
        let arg = match args.first() {
            Some(a) => a,
            None => return internal_error("intrinsic without an operand"),
        };
        match op {
            IntrinsicOp::Len => {
                let sem = self.sem;
                let addr = self.expr_storage(arg)?;
                let len = self.len_value(&addr, arg.ty)?;
                let cl = match register_ty(&sem.types, self.target.ptr_ty, expr.ty) {
                    Some(c) => c,
                    None => return internal_error("length result is not a register class"),
                };
                let len = self.cast_int_edge(len, cl, false);
                Ok(KValue::register(len, expr.ty))
            }
            _ => {
                let v = self.build_expr(arg)?;
                self.emit_bit_intrinsic(op, v, expr.ty)
            }
        }
    }

    // ─── Short-circuit booleans ─────────────────────────────────

    /// `&&`/`||` in value position: run the control-flow form and join
    /// the two constants on a block parameter.
    fn short_circuit(&mut self, expr: &Expr) -> CodegenResult<KValue> {
        let t = self.new_region();
        let f = self.new_region();
        let join = self.b.create_block();
        self.b.append_block_param(join, types::I8);
        self.cond_br_inner(expr, t, f)?;
        self.switch_region(t);
        let one = self.b.ins().iconst(types::I8, 1);
        self.b.ins().jump(join, &[one]);
        self.switch_region(f);
        let zero = self.b.ins().iconst(types::I8, 0);
        self.b.ins().jump(join, &[zero]);
        self.switch_region(join);
        let v = self.b.block_params(join)[0];
        Ok(KValue::register(v, expr.ty))
    }

    /// Lower a boolean expression as a two-way branch, folding `&&`,
    /// `||` and `!` into the region graph instead of the data flow.
    pub(crate) fn build_cond_br(&mut self, cond: &Expr, t: Block, f: Block) -> CodegenResult<()> {
        let saved = self.flags;
        self.flags = saved.merge(cond.flags);
        let out = self.cond_br_inner(cond, t, f);
        self.flags = saved;
        out
    }

    fn cond_br_inner(&mut self, cond: &Expr, t: Block, f: Block) -> CodegenResult<()> {
        if cond.mode != Mode::Constant {
            match &cond.kind {
                ExprKind::Unary {
                    op: UnOp::Not,
                    operand,
                } => return self.build_cond_br(operand, f, t),
                ExprKind::Binary {
                    op: BinOp::And,
                    lhs,
                    rhs,
                } => {
                    let mid = self.new_region();
                    self.build_cond_br(lhs, mid, f)?;
                    self.switch_region(mid);
                    return self.build_cond_br(rhs, t, f);
                }
                ExprKind::Binary {
                    op: BinOp::Or,
                    lhs,
                    rhs,
                } => {
                    let mid = self.new_region();
                    self.build_cond_br(lhs, t, mid)?;
                    self.switch_region(mid);
                    return self.build_cond_br(rhs, t, f);
                }
                _ => {}
            }
        }
        let v = self.expr_value(cond)?;
        let r = self.scalar_reg(&v)?;
        self.b.ins().brif(r, t, &[], f, &[]);
        Ok(())
    }

    // ─── Narrowing ──────────────────────────────────────────────

    /// Union/any narrowing, trap form. The tag test is gated by the
    /// statement's assert flags; a mismatch reports through the runtime
    /// and traps.
    fn type_assert(&mut self, expr: &Expr, operand: &Expr) -> CodegenResult<KValue> {
        let (payload, got, want) = self.assert_parts(operand, expr.ty)?;
        if self.flags.type_assert_enabled() {
            let bad = self.b.ins().icmp(IntCC::NotEqual, got, want);
            self.emit_check_fail(bad, "keel_type_assert_fail", &[got, want])?;
        }
        self.emit_load(payload, expr.ty)
    }

    /// Two-value narrowing: `(value, ok)`, the value zeroed on
    /// mismatch. Never traps, so the assert flags do not apply.
    pub(crate) fn assert_with_ok(&mut self, expr: &Expr, ok_ty: TypeId) -> CodegenResult<KValue> {
        let saved = self.flags;
        self.flags = saved.merge(expr.flags);
        let out = self.assert_with_ok_inner(expr, ok_ty);
        self.flags = saved;
        out
    }

    fn assert_with_ok_inner(&mut self, expr: &Expr, ok_ty: TypeId) -> CodegenResult<KValue> {
        let operand = match &expr.kind {
            ExprKind::TypeAssert { operand, .. } => operand,
            _ => return internal_error("two-value assertion over a non-assert expression"),
        };
        let (payload, got, want) = self.assert_parts(operand, expr.ty)?;
        let ok = self.b.ins().icmp(IntCC::Equal, got, want);
        let out = self.alloc_local(expr.ty, true)?;
        let out_ptr = self.addr_get_ptr(&out)?;
        // the payload is only meaningful behind a matching tag; copy it
        // out under the guard and read the zeroed slot otherwise
        let hit = self.new_region();
        let join = self.new_region();
        self.b.ins().brif(ok, hit, &[], join, &[]);
        self.switch_region(hit);
        let size = self.sem.types.size_of(expr.ty);
        self.copy_bytes(out_ptr, payload, size);
        self.goto_region(join);
        self.switch_region(join);
        let value = self.emit_load(out_ptr, expr.ty)?;
        let ty = value.ty;
        Ok(KValue::multi(
            vec![value, KValue::register(ok, ok_ty)],
            ty,
        ))
    }

    /// (payload pointer, current tag, wanted tag) for a narrowing
    /// operand, shared by both assertion forms.
    fn assert_parts(
        &mut self,
        operand: &Expr,
        want_ty: TypeId,
    ) -> CodegenResult<(Value, Value, Value)> {
        let sem = self.sem;
        let addr = self.expr_storage(operand)?;
        let p = self.addr_get_ptr(&addr)?;
        let core = sem.types.core(operand.ty);
        match sem.types.kind(core) {
            TypeKind::Union { .. } => {
                let got = self.union_tag_value(p, core)?;
                let idx = match sem.types.union_variant_index(core, want_ty) {
                    Some(i) => i,
                    None => return internal_error("asserted type is not a variant"),
                };
                let cl = self.b.func.dfg.value_type(got);
                let want = self.b.ins().iconst(cl, idx as i64);
                // the payload block sits at offset 0
                Ok((p, got, want))
            }
            TypeKind::Any => {
                let word = self.target.ptr_ty;
                let wb = self.target.ptr_bytes as i32;
                let data = self.b.ins().load(word, MemFlags::new(), p, 0);
                let got = self.b.ins().load(word, MemFlags::new(), p, wb);
                let want = self.iconst_word(i64::from(want_ty.0));
                Ok((data, got, want))
            }
            other => internal_error(format!("narrowing over {:?}", other)),
        }
    }

    // ─── Slicing ────────────────────────────────────────────────

    /// `base[lo:hi]` over every container shape. The result is a fresh
    /// header, or an advanced multi-pointer when no upper bound exists
    /// to measure a length with.
    fn slice_expr(
        &mut self,
        expr: &Expr,
        base: &Expr,
        lo: Option<&Expr>,
        hi: Option<&Expr>,
    ) -> CodegenResult<KValue> {
        let sem = self.sem;
        let mut addr = self.expr_storage(base)?;
        let mut cont_ty = base.ty;
        // slicing through a pointer-to-array hops once per level
        loop {
            match *sem.types.kind(sem.types.core(cont_ty)) {
                TypeKind::Pointer { elem } => {
                    let pv = self.addr_load(&addr)?;
                    addr = Addr::plain(pv);
                    cont_ty = elem;
                }
                _ => break,
            }
        }
        let core = sem.types.core(cont_ty);

        // stride comes from the operand's element: a string slice
        // yields a string again, so the result type cannot supply it
        let (data, len, esize) = match *sem.types.kind(core) {
            TypeKind::String => {
                let p = self.addr_get_ptr(&addr)?;
                let word = self.target.ptr_ty;
                let d = self.b.ins().load(word, MemFlags::new(), p, 0);
                let n = self
                    .b
                    .ins()
                    .load(word, MemFlags::new(), p, self.target.ptr_bytes as i32);
                (d, Some(n), 1)
            }
            TypeKind::Slice { elem } | TypeKind::DynamicArray { elem } => {
                let p = self.addr_get_ptr(&addr)?;
                let word = self.target.ptr_ty;
                let d = self.b.ins().load(word, MemFlags::new(), p, 0);
                let n = self
                    .b
                    .ins()
                    .load(word, MemFlags::new(), p, self.target.ptr_bytes as i32);
                (d, Some(n), sem.types.size_of(elem))
            }
            TypeKind::Array { elem, len } => {
                let p = self.addr_get_ptr(&addr)?;
                let n = self.iconst_word(len as i64);
                (p, Some(n), sem.types.size_of(elem))
            }
            TypeKind::MultiPointer { elem } => {
                let pv = self.addr_load(&addr)?;
                let d = self.scalar_reg(&pv)?;
                (d, None, sem.types.size_of(elem))
            }
            TypeKind::RelativeSlice { elem, .. } => {
                let storage = self.addr_get_ptr(&addr)?;
                let (d, n) = self.relative_slice_parts(storage, cont_ty)?;
                (d, Some(n), sem.types.size_of(elem))
            }
            ref other => {
                return internal_error(format!("slicing over non-container type {:?}", other))
            }
        };

        let lo_v = match lo {
            Some(e) => {
                let v = self.build_expr(e)?;
                self.index_word(&v)?
            }
            None => self.iconst_word(0),
        };
        let hi_v = match hi {
            Some(e) => {
                let v = self.build_expr(e)?;
                Some(self.index_word(&v)?)
            }
            // an absent upper bound runs to the length
            None => len,
        };

        let hi_v = match hi_v {
            Some(h) => h,
            None => {
                // multi-pointer with no upper bound: still a pointer
                let off = self.b.ins().imul_imm(lo_v, esize as i64);
                let d2 = self.b.ins().iadd(data, off);
                return Ok(KValue::register(d2, expr.ty));
            }
        };

        // with no length to test against, the bound only orders lo
        let limit = match len {
            Some(n) => n,
            None => hi_v,
        };
        self.slice_range_check(lo_v, hi_v, limit)?;

        let off = self.b.ins().imul_imm(lo_v, esize as i64);
        let d2 = self.b.ins().iadd(data, off);
        let count = self.b.ins().isub(hi_v, lo_v);
        let out = self.alloc_local(expr.ty, false)?;
        let out_ptr = self.addr_get_ptr(&out)?;
        self.b.ins().store(MemFlags::new(), d2, out_ptr, 0);
        self.b
            .ins()
            .store(MemFlags::new(), count, out_ptr, self.target.ptr_bytes as i32);
        Ok(KValue::address(out_ptr, expr.ty))
    }

    // ─── Transmute ──────────────────────────────────────────────

    /// Same-size bit reinterpretation.
    fn transmute_value(&mut self, value: KValue, dst: TypeId) -> CodegenResult<KValue> {
        let sem = self.sem;
        if sem.types.size_of(value.ty) != sem.types.size_of(dst) {
            return internal_error("transmute between differently sized types");
        }
        let src_cl = register_ty(&sem.types, self.target.ptr_ty, value.ty);
        let dst_cl = register_ty(&sem.types, self.target.ptr_ty, dst);
        match (src_cl, dst_cl) {
            (Some(a), Some(b)) if a == b => Ok(retype(value, dst)),
            (Some(a), Some(b)) if !a.is_vector() && !b.is_vector() => {
                let r = self.scalar_reg(&value)?;
                let v = self.b.ins().bitcast(b, MemFlags::new(), r);
                Ok(KValue::register(v, dst))
            }
            _ => {
                // reinterpret through memory
                let p = self.spill_to_ptr(&value)?;
                Ok(KValue::address(p, dst))
            }
        }
    }
}

/// Checked type after walking `steps` field hops from `ty`,
/// dereferencing pointer intermediates the way projection does.
fn path_ty(
    types_tbl: &keel_sem::TypeTable,
    mut ty: TypeId,
    steps: &[SelStep],
) -> CodegenResult<TypeId> {
    for step in steps {
        loop {
            match types_tbl.kind(types_tbl.core(ty)) {
                TypeKind::Pointer { elem } => ty = *elem,
                _ => break,
            }
        }
        let i = match *step {
            SelStep::Field(i) => i,
            SelStep::UnionTag => return internal_error("tag slot inside a selector prefix"),
        };
        let core = types_tbl.core(ty);
        ty = match types_tbl.kind(core) {
            TypeKind::Struct { fields, .. } => match fields.get(i) {
                Some(f) => f.ty,
                None => return Err(SemError::FieldOutOfRange { ty: core, index: i }.into()),
            },
            TypeKind::Tuple { elems } => match elems.get(i).copied() {
                Some(t) => t,
                None => return Err(SemError::FieldOutOfRange { ty: core, index: i }.into()),
            },
            other => return internal_error(format!("field selection over {:?}", other)),
        };
    }
    Ok(ty)
}

/// Sign-extend the low `bits` of a folded integer into the shape
/// `iconst` accepts for narrow classes.
fn narrow_imm(v: i128, bits: u32) -> i64 {
    if bits >= 64 {
        return v as i64;
    }
    let sign = 1i128 << (bits - 1);
    let mask = (1i128 << bits) - 1;
    (((v & mask) ^ sign) - sign) as i64
}
