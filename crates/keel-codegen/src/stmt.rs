// SPDX-License-Identifier: (MIT OR Apache-2.0)

//! Statement lowering: the control-flow builder.
//!
//! Structured statements become regions joined by explicit terminators;
//! no region is ever left open. Branch targets resolve through the
//! label table first and the innermost-first target list second, and
//! every exit path replays the pending defer chain in reverse before
//! its own terminator goes down.

use cranelift::codegen::ir::JumpTableData;
use cranelift::prelude::*;

use keel_sem::{
    AssignOp, BinOp, BranchKind, CaseValue, Endian, EntityId, EntityKind, Expr, ExprKind, Label,
    RangeKind, Stmt, StmtKind, SwitchCase, TypeId, TypeKind, TypeTable,
};

use crate::proc::{BranchRegion, DeferExit, ProcLowering, TargetEntry};
use crate::value::{register_ty, Repr, Value as KValue};
use crate::{internal_error, CodegenResult};

impl<'a> ProcLowering<'a> {
    pub(crate) fn build_stmt_list(&mut self, stmts: &'a [Stmt]) -> CodegenResult<()> {
        for stmt in stmts {
            if self.terminated {
                // statements after a terminator still lower; they get a
                // region of their own with no predecessor
                let cont = self.new_region();
                self.switch_region(cont);
            }
            self.build_stmt(stmt)?;
        }
        Ok(())
    }

    pub(crate) fn build_stmt(&mut self, stmt: &'a Stmt) -> CodegenResult<()> {
        let saved = self.flags;
        self.flags = saved.merge(stmt.flags);
        let out = self.stmt_inner(stmt);
        self.flags = saved;
        out
    }

    fn stmt_inner(&mut self, stmt: &'a Stmt) -> CodegenResult<()> {
        match &stmt.kind {
            StmtKind::Expr(e) => {
                self.build_expr(e)?;
                Ok(())
            }
            StmtKind::Decl { entities, inits } => self.build_decl(entities, inits),
            StmtKind::Assign { op, lhs, rhs } => match op {
                AssignOp::Plain => self.plain_assign(lhs, rhs),
                AssignOp::Compound(bin) => self.compound_assign(*bin, lhs, rhs),
            },
            StmtKind::Block { label, body } => self.build_block(label.as_ref(), body),
            StmtKind::If {
                label,
                init,
                cond,
                then_body,
                else_stmt,
            } => self.build_if(
                label.as_ref(),
                init.as_deref(),
                cond,
                then_body,
                else_stmt.as_deref(),
            ),
            StmtKind::For {
                label,
                init,
                cond,
                post,
                body,
            } => self.build_for(
                label.as_ref(),
                init.as_deref(),
                cond.as_ref(),
                post.as_deref(),
                body,
            ),
            StmtKind::RangeInterval {
                label,
                value,
                index,
                lo,
                hi,
                kind,
                body,
            } => self.build_range_interval(label.as_ref(), *value, *index, lo, hi, *kind, body),
            StmtKind::RangeContainer {
                label,
                value,
                index,
                container,
                reverse,
                body,
            } => self.build_range_container(
                label.as_ref(),
                *value,
                *index,
                container,
                *reverse,
                body,
            ),
            StmtKind::Switch {
                label,
                init,
                tag,
                cases,
            } => self.build_switch(label.as_ref(), init.as_deref(), tag.as_ref(), cases),
            StmtKind::Return { results } => self.build_return(results),
            StmtKind::Branch { kind, label } => self.build_branch(*kind, label.as_ref()),
            StmtKind::Defer { stmt } => {
                self.register_defer(stmt);
                Ok(())
            }
        }
    }

    // ─── Declarations and assignment ────────────────────────────

    fn build_decl(&mut self, entities: &[EntityId], inits: &[Expr]) -> CodegenResult<()> {
        let sem = self.sem;

        // static locals already live as module data; nothing to emit
        let runtime: Vec<EntityId> = entities
            .iter()
            .copied()
            .filter(|&eid| {
                !matches!(
                    sem.entity(eid).kind,
                    EntityKind::StaticLocal { .. }
                )
            })
            .collect();
        if runtime.is_empty() {
            return Ok(());
        }
        if runtime.len() != entities.len() {
            return internal_error("static and runtime declarations mixed in one statement");
        }

        if inits.is_empty() {
            for &eid in &runtime {
                let ty = sem.entity(eid).ty;
                let slot = self.alloc_local(ty, true)?;
                self.slots.insert(eid, slot);
            }
            return Ok(());
        }

        // all initializers run before any entity binds, so a shadowing
        // `x := x` still reads the outer binding
        let expect: Vec<TypeId> = runtime.iter().map(|&e| sem.entity(e).ty).collect();
        let values = self.flatten_values(inits, &expect)?;
        for (&eid, value) in runtime.iter().zip(values) {
            let ty = sem.entity(eid).ty;
            let slot = self.alloc_local(ty, false)?;
            let converted = self.convert_value(value, ty)?;
            self.addr_store(&slot, converted)?;
            self.slots.insert(eid, slot);
        }
        Ok(())
    }

    /// Lower `exprs` left to right, flattening multi-results into one
    /// value per expected slot. The expected types drive the two-value
    /// lookup and assertion forms, whose ok flag types the extra slot.
    fn flatten_values(&mut self, exprs: &[Expr], expect: &[TypeId]) -> CodegenResult<Vec<KValue>> {
        let sem = self.sem;
        let mut out: Vec<KValue> = Vec::with_capacity(expect.len());
        for expr in exprs {
            if let ExprKind::TypeAssert { with_ok: true, .. } = expr.kind {
                let ok_ty = match expect.get(out.len() + 1) {
                    Some(&t) => t,
                    None => return internal_error("two-value assertion without an ok target"),
                };
                let pair = self.assert_with_ok(expr, ok_ty)?;
                match pair.repr {
                    Repr::Multi(parts) => out.extend(parts),
                    _ => return internal_error("assertion pair lost its shape"),
                }
                continue;
            }
            if exprs.len() == 1 && expect.len() == 2 {
                if let ExprKind::Index { base, .. } = &expr.kind {
                    if matches!(
                        *sem.types.kind(sem.types.core(base.ty)),
                        TypeKind::Map { .. }
                    ) {
                        let addr = self.build_addr(expr)?;
                        let pair = self.map_load_ok(&addr, expect[1])?;
                        match pair.repr {
                            Repr::Multi(parts) => out.extend(parts),
                            _ => return internal_error("lookup pair lost its shape"),
                        }
                        continue;
                    }
                }
            }
            let v = self.build_expr(expr)?;
            match v.repr {
                Repr::Multi(parts) => out.extend(parts),
                _ => out.push(v),
            }
        }
        if out.len() != expect.len() {
            return internal_error(format!(
                "{} values flattened for {} targets",
                out.len(),
                expect.len()
            ));
        }
        Ok(out)
    }

    /// A copy the coming stores cannot alias.
    fn detach_value(&mut self, value: KValue) -> CodegenResult<KValue> {
        match value.repr {
            Repr::Address(src) => {
                let size = self.sem.types.size_of(value.ty);
                let out = self.alloc_local(value.ty, false)?;
                let p = self.addr_get_ptr(&out)?;
                self.copy_bytes(p, src, size);
                Ok(KValue::address(p, value.ty))
            }
            _ => Ok(value),
        }
    }

    /// Every right-hand side evaluates before any store; the flattened
    /// values then convert and store into each target in order.
    fn plain_assign(&mut self, lhs: &[Expr], rhs: &[Expr]) -> CodegenResult<()> {
        let expect: Vec<TypeId> = lhs.iter().map(|e| e.ty).collect();
        let values = self.flatten_values(rhs, &expect)?;

        // aggregate values detach to fresh storage when more than one
        // store follows, so `x, y = y, x` swaps instead of smearing
        let staged = if lhs.len() > 1 {
            let mut out = Vec::with_capacity(values.len());
            for v in values {
                let d = self.detach_value(v)?;
                out.push(d);
            }
            out
        } else {
            values
        };

        for (target, value) in lhs.iter().zip(staged) {
            let addr = self.build_addr(target)?;
            let converted = self.convert_value(value, target.ty)?;
            self.addr_store(&addr, converted)?;
        }
        Ok(())
    }

    /// `lhs op= rhs`: load, combine, store back through the same Addr.
    fn compound_assign(&mut self, op: BinOp, lhs: &[Expr], rhs: &[Expr]) -> CodegenResult<()> {
        let (target, source) = match (lhs.first(), rhs.first()) {
            (Some(t), Some(s)) if lhs.len() == 1 && rhs.len() == 1 => (t, s),
            _ => return internal_error("compound assignment must be single-target"),
        };
        if let BinOp::And | BinOp::Or = op {
            return self.logical_compound(op, target, source);
        }
        let addr = self.build_addr(target)?;
        let current = self.addr_load(&addr)?;
        let rv = self.build_expr(source)?;
        let combined = self.emit_arith(op, current, rv, target.ty)?;
        self.addr_store(&addr, combined)
    }

    /// `x &&= y` / `x ||= y`: the right side must not evaluate when the
    /// stored left side already decides.
    fn logical_compound(&mut self, op: BinOp, target: &Expr, source: &Expr) -> CodegenResult<()> {
        let addr = self.build_addr(target)?;
        let current = self.addr_load(&addr)?;
        let cur = self.scalar_reg(&current)?;
        let eval = self.new_region();
        let done = self.new_region();
        match op {
            BinOp::And => self.b.ins().brif(cur, eval, &[], done, &[]),
            _ => self.b.ins().brif(cur, done, &[], eval, &[]),
        };
        self.switch_region(eval);
        let rv = self.build_expr(source)?;
        let converted = self.convert_value(rv, target.ty)?;
        self.addr_store(&addr, converted)?;
        self.goto_region(done);
        self.switch_region(done);
        Ok(())
    }

    // ─── Structured constructs ──────────────────────────────────

    fn build_block(&mut self, label: Option<&Label>, body: &'a [Stmt]) -> CodegenResult<()> {
        let done = self.new_region();
        self.push_target(
            label,
            TargetEntry {
                break_region: Some(done),
                continue_region: None,
                fallthrough_region: None,
                is_block: true,
                scope_index: self.scope_depth(),
            },
            done,
            None,
        );
        self.scope_open();
        self.build_stmt_list(body)?;
        self.scope_close()?;
        self.pop_target(label);
        self.goto_region(done);
        self.switch_region(done);
        Ok(())
    }

    fn build_if(
        &mut self,
        label: Option<&Label>,
        init: Option<&'a Stmt>,
        cond: &'a Expr,
        then_body: &'a [Stmt],
        else_stmt: Option<&'a Stmt>,
    ) -> CodegenResult<()> {
        let depth = self.scope_depth();
        self.scope_open();
        if let Some(s) = init {
            self.build_stmt(s)?;
        }

        let then_b = self.new_region();
        let else_b = self.new_region();
        let done = self.new_region();
        self.build_cond_br(cond, then_b, else_b)?;

        self.push_target(
            label,
            TargetEntry {
                break_region: Some(done),
                continue_region: None,
                fallthrough_region: None,
                is_block: true,
                scope_index: depth,
            },
            done,
            None,
        );

        // each arm runs the init scope's defers on its own way out, so
        // the join region can simply discard
        self.switch_region(then_b);
        self.scope_open();
        self.build_stmt_list(then_body)?;
        self.scope_close()?;
        self.emit_defers(DeferExit::Default)?;
        self.goto_region(done);

        self.switch_region(else_b);
        if let Some(els) = else_stmt {
            self.scope_open();
            self.build_stmt(els)?;
            self.scope_close()?;
        }
        self.emit_defers(DeferExit::Default)?;
        self.goto_region(done);

        self.pop_target(label);
        self.switch_region(done);
        self.scope_discard();
        Ok(())
    }

    fn build_for(
        &mut self,
        label: Option<&Label>,
        init: Option<&'a Stmt>,
        cond: Option<&'a Expr>,
        post: Option<&'a Stmt>,
        body: &'a [Stmt],
    ) -> CodegenResult<()> {
        let depth = self.scope_depth();
        self.scope_open();
        if let Some(s) = init {
            self.build_stmt(s)?;
        }

        let head = self.new_region();
        let body_b = self.new_region();
        let exit_b = self.new_region();
        let done = self.new_region();
        let post_b = match post {
            Some(_) => self.new_region(),
            None => head,
        };

        self.goto_region(head);
        self.switch_region(head);
        match cond {
            Some(c) => self.build_cond_br(c, body_b, exit_b)?,
            None => self.goto_region(body_b),
        }

        self.push_target(
            label,
            TargetEntry {
                break_region: Some(done),
                continue_region: Some(post_b),
                fallthrough_region: None,
                is_block: false,
                scope_index: depth,
            },
            done,
            Some(post_b),
        );

        self.switch_region(body_b);
        self.scope_open();
        self.build_stmt_list(body)?;
        self.scope_close()?;
        self.goto_region(post_b);

        if let Some(p) = post {
            self.switch_region(post_b);
            self.build_stmt(p)?;
            self.goto_region(head);
        }

        self.pop_target(label);

        // the condition's false edge leaves the construct scope; break
        // edges already ran these defers before jumping to done
        self.switch_region(exit_b);
        self.emit_defers(DeferExit::Default)?;
        self.goto_region(done);

        self.switch_region(done);
        self.scope_discard();
        Ok(())
    }

    fn build_range_interval(
        &mut self,
        label: Option<&Label>,
        value: Option<EntityId>,
        index: Option<EntityId>,
        lo: &'a Expr,
        hi: &'a Expr,
        kind: RangeKind,
        body: &'a [Stmt],
    ) -> CodegenResult<()> {
        let sem = self.sem;
        let depth = self.scope_depth();
        self.scope_open();

        let vty = match value {
            Some(eid) => sem.entity(eid).ty,
            None => lo.ty,
        };

        // both bounds evaluate once, before the first test
        let lo_v = self.build_expr(lo)?;
        let lo_c = self.convert_value(lo_v, vty)?;
        let val_slot = self.alloc_local(vty, false)?;
        self.addr_store(&val_slot, lo_c)?;
        if let Some(eid) = value {
            self.slots.insert(eid, val_slot.clone());
        }
        let idx_slot = match index {
            Some(eid) => {
                let ity = sem.entity(eid).ty;
                let slot = self.alloc_local(ity, true)?;
                self.slots.insert(eid, slot.clone());
                Some(slot)
            }
            None => None,
        };
        let hi_v = self.build_expr(hi)?;
        let hi_c = self.convert_value(hi_v, vty)?;
        let hi_reg = self.scalar_reg(&hi_c)?;
        let unsigned = sem.types.is_unsigned(vty);

        let head = self.new_region();
        let body_b = self.new_region();
        let post_b = self.new_region();
        let done = self.new_region();

        self.goto_region(head);
        self.switch_region(head);
        let cur = self.addr_load(&val_slot)?;
        let cur_reg = self.scalar_reg(&cur)?;
        let cc = match (kind, unsigned) {
            (RangeKind::HalfOpen, true) => IntCC::UnsignedLessThan,
            (RangeKind::HalfOpen, false) => IntCC::SignedLessThan,
            (RangeKind::Closed, true) => IntCC::UnsignedLessThanOrEqual,
            (RangeKind::Closed, false) => IntCC::SignedLessThanOrEqual,
        };
        let in_range = self.b.ins().icmp(cc, cur_reg, hi_reg);
        self.b.ins().brif(in_range, body_b, &[], done, &[]);

        self.push_target(
            label,
            TargetEntry {
                break_region: Some(done),
                continue_region: Some(post_b),
                fallthrough_region: None,
                is_block: false,
                scope_index: depth,
            },
            done,
            Some(post_b),
        );

        self.switch_region(body_b);
        self.scope_open();
        self.build_stmt_list(body)?;
        self.scope_close()?;
        self.goto_region(post_b);

        self.pop_target(label);

        self.switch_region(post_b);
        if kind == RangeKind::Closed {
            // the value just ran at the bound; stepping again would
            // wrap before the head test could stop it
            let cur = self.addr_load(&val_slot)?;
            let cur_reg = self.scalar_reg(&cur)?;
            let at_end = self.b.ins().icmp(IntCC::Equal, cur_reg, hi_reg);
            let step = self.new_region();
            self.b.ins().brif(at_end, done, &[], step, &[]);
            self.switch_region(step);
        }
        let cur = self.addr_load(&val_slot)?;
        let cur_reg = self.scalar_reg(&cur)?;
        let cl = self.b.func.dfg.value_type(cur_reg);
        let one = self.int_const(cl, 1);
        let next = self.b.ins().iadd(cur_reg, one);
        self.addr_store(&val_slot, KValue::register(next, vty))?;
        if let Some(slot) = &idx_slot {
            let iv = self.addr_load(slot)?;
            let ity = iv.ty;
            let ir = self.scalar_reg(&iv)?;
            let icl = self.b.func.dfg.value_type(ir);
            let ione = self.int_const(icl, 1);
            let inext = self.b.ins().iadd(ir, ione);
            self.addr_store(slot, KValue::register(inext, ity))?;
        }
        self.goto_region(head);

        self.switch_region(done);
        self.scope_close()?;
        Ok(())
    }

    fn build_range_container(
        &mut self,
        label: Option<&Label>,
        value: Option<EntityId>,
        index: Option<EntityId>,
        container: &'a Expr,
        reverse: bool,
        body: &'a [Stmt],
    ) -> CodegenResult<()> {
        let sem = self.sem;
        if let TypeKind::Map { .. } = *sem.types.kind(sem.types.core(container.ty)) {
            return internal_error("map range iteration is not lowered here");
        }
        let depth = self.scope_depth();
        self.scope_open();

        let cont = self.expr_storage(container)?;
        let len = self.len_value(&cont, container.ty)?;
        let word = self.target.ptr_ty;
        let counter = self.alloc_slot_ptr(self.target.ptr_bytes, self.target.ptr_bytes);
        let zero = self.iconst_word(0);
        self.b.ins().store(MemFlags::new(), zero, counter, 0);

        let head = self.new_region();
        let body_b = self.new_region();
        let post_b = self.new_region();
        let done = self.new_region();

        self.goto_region(head);
        self.switch_region(head);
        let i = self.b.ins().load(word, MemFlags::new(), counter, 0);
        let in_range = self.b.ins().icmp(IntCC::UnsignedLessThan, i, len);
        self.b.ins().brif(in_range, body_b, &[], done, &[]);

        self.push_target(
            label,
            TargetEntry {
                break_region: Some(done),
                continue_region: Some(post_b),
                fallthrough_region: None,
                is_block: false,
                scope_index: depth,
            },
            done,
            Some(post_b),
        );

        self.switch_region(body_b);
        self.scope_open();
        let i = self.b.ins().load(word, MemFlags::new(), counter, 0);
        let pos = if reverse {
            let from_end = self.b.ins().isub(len, i);
            self.b.ins().iadd_imm(from_end, -1)
        } else {
            i
        };
        if let Some(eid) = index {
            let ity = sem.entity(eid).ty;
            let cl = match register_ty(&sem.types, word, ity) {
                Some(c) => c,
                None => return internal_error("range index entity is not scalar"),
            };
            let iv = self.cast_int_edge(pos, cl, false);
            let slot = self.alloc_local(ity, false)?;
            self.addr_store(&slot, KValue::register(iv, ity))?;
            self.slots.insert(eid, slot);
        }
        if let Some(eid) = value {
            let ety = sem.entity(eid).ty;
            // the head test already bounds the position
            let saved = self.flags;
            self.flags.bounds_check = Some(false);
            let elem = self.element_addr(
                cont.clone(),
                container.ty,
                KValue::register(pos, container.ty),
                ety,
            )?;
            let loaded = self.addr_load(&elem)?;
            self.flags = saved;
            let slot = self.alloc_local(ety, false)?;
            self.addr_store(&slot, loaded)?;
            self.slots.insert(eid, slot);
        }
        self.build_stmt_list(body)?;
        self.scope_close()?;
        self.goto_region(post_b);

        self.pop_target(label);

        self.switch_region(post_b);
        let i2 = self.b.ins().load(word, MemFlags::new(), counter, 0);
        let next = self.b.ins().iadd_imm(i2, 1);
        self.b.ins().store(MemFlags::new(), next, counter, 0);
        self.goto_region(head);

        self.switch_region(done);
        self.scope_close()?;
        Ok(())
    }

    fn build_switch(
        &mut self,
        label: Option<&Label>,
        init: Option<&'a Stmt>,
        tag: Option<&'a Expr>,
        cases: &'a [SwitchCase],
    ) -> CodegenResult<()> {
        let depth = self.scope_depth();
        self.scope_open();
        if let Some(s) = init {
            self.build_stmt(s)?;
        }
        // the tag evaluates once; an absent tag switches on true,
        // turning the clauses into a guarded if chain
        let tag_v = match tag {
            Some(e) => Some(self.build_expr(e)?),
            None => None,
        };

        let done = self.new_region();
        // clause bodies get their regions up front so fallthrough can
        // name its successor
        let body_regions: Vec<Block> = cases.iter().map(|_| self.new_region()).collect();

        let default_idx = cases.iter().position(|c| c.values.is_empty());

        // an all-constant integer clause set dispatches through one
        // jump table; everything else tests clause by clause
        match self.switch_table(tag_v.as_ref(), cases) {
            Some(plan) => {
                let t = match &tag_v {
                    Some(t) => t.clone(),
                    None => return internal_error("jump table without a switch tag"),
                };
                let tr = self.scalar_reg(&t)?;
                let biased = self.b.ins().iadd_imm(tr, plan.delta);
                // br_table takes its index as exactly i32; the bias
                // already wrapped in the tag's width, so the resize is
                // unsigned.
                let idx = self.cast_int_edge(biased, types::I32, false);
                let miss = match default_idx {
                    Some(ci) => body_regions[ci],
                    None => self.new_region(),
                };
                let def = self.b.func.dfg.block_call(miss, &[]);
                let calls: Vec<_> = plan
                    .slots
                    .iter()
                    .map(|slot| {
                        let region = match slot {
                            Some(ci) => body_regions[*ci],
                            None => miss,
                        };
                        self.b.func.dfg.block_call(region, &[])
                    })
                    .collect();
                let jt = self.b.create_jump_table(JumpTableData::new(def, &calls));
                self.b.ins().br_table(idx, jt);
                self.terminated = true;
                if default_idx.is_none() {
                    self.switch_region(miss);
                    self.emit_defers(DeferExit::Default)?;
                    self.goto_region(done);
                }
            }
            None => {
                for (ci, case) in cases.iter().enumerate() {
                    for cv in &case.values {
                        let miss = self.new_region();
                        let hit = match cv {
                            CaseValue::Expr(e) => self.case_eq(tag_v.as_ref(), e)?,
                            CaseValue::Range { lo, hi, kind } => {
                                self.case_range(tag_v.as_ref(), lo, hi, *kind)?
                            }
                        };
                        self.b.ins().brif(hit, body_regions[ci], &[], miss, &[]);
                        self.switch_region(miss);
                    }
                }
                // the default clause is tried only after every test
                // fails
                match default_idx {
                    Some(ci) => self.goto_region(body_regions[ci]),
                    None => {
                        self.emit_defers(DeferExit::Default)?;
                        self.goto_region(done);
                    }
                }
            }
        }

        self.push_target(
            label,
            TargetEntry {
                break_region: Some(done),
                continue_region: None,
                fallthrough_region: None,
                is_block: false,
                scope_index: depth,
            },
            done,
            None,
        );

        for (ci, case) in cases.iter().enumerate() {
            self.switch_region(body_regions[ci]);
            let next_body = body_regions.get(ci + 1).copied();
            if let Some(entry) = self.targets.last_mut() {
                entry.fallthrough_region = next_body;
            }
            self.scope_open();
            self.build_stmt_list(&case.body)?;
            self.scope_close()?;
            self.emit_defers(DeferExit::Default)?;
            self.goto_region(done);
        }

        self.pop_target(label);
        self.switch_region(done);
        self.scope_discard();
        Ok(())
    }

    /// Dense-table plan when every clause value is a folded integer
    /// constant. Sparse, ranged, and tiny clause sets keep the chain.
    fn switch_table(&self, tag: Option<&KValue>, cases: &[SwitchCase]) -> Option<SwitchTable> {
        let t = tag?;
        let (bits, unsigned) = switch_tag_width(&self.sem.types, t.ty)?;
        let mut hits: Vec<(i128, usize)> = Vec::new();
        for (ci, case) in cases.iter().enumerate() {
            for cv in &case.values {
                let e = match cv {
                    CaseValue::Expr(e) => e,
                    CaseValue::Range { .. } => return None,
                };
                let v = e.value.as_ref().and_then(|c| c.as_int())?;
                hits.push((norm_tag(v, bits, unsigned), ci));
            }
        }
        if hits.len() < 4 {
            return None;
        }
        let min = hits.iter().map(|h| h.0).min()?;
        let max = hits.iter().map(|h| h.0).max()?;
        let span = max - min + 1;
        if span > 512 {
            return None;
        }
        let mut slots = vec![None; span as usize];
        for (v, ci) in hits {
            let slot = &mut slots[(v - min) as usize];
            // on a duplicate value the first clause wins, as the chain
            // would
            if slot.is_none() {
                *slot = Some(ci);
            }
        }
        Some(SwitchTable {
            delta: norm_tag(min.wrapping_neg(), bits, false) as i64,
            slots,
        })
    }

    /// Raw match bit between the tag and one case value. Without a tag
    /// the case expression is itself the condition.
    fn case_eq(&mut self, tag: Option<&KValue>, case: &Expr) -> CodegenResult<Value> {
        let v = self.build_expr(case)?;
        match tag {
            Some(t) => {
                // the type label on the transient bool never escapes
                let hit = self.emit_comp(BinOp::Eq, t.clone(), v, case.ty)?;
                self.scalar_reg(&hit)
            }
            None => self.scalar_reg(&v),
        }
    }

    /// Conjunction of the two bound tests of a range clause.
    fn case_range(
        &mut self,
        tag: Option<&KValue>,
        lo: &Expr,
        hi: &Expr,
        kind: RangeKind,
    ) -> CodegenResult<Value> {
        let t = match tag {
            Some(t) => t.clone(),
            None => return internal_error("range case without a switch tag"),
        };
        let lo_v = self.build_expr(lo)?;
        let hi_v = self.build_expr(hi)?;
        let tr = self.scalar_reg(&t)?;
        let lr = self.scalar_reg(&lo_v)?;
        let hr = self.scalar_reg(&hi_v)?;
        let unsigned = self.sem.types.is_unsigned(t.ty);
        let above = if unsigned {
            self.b.ins().icmp(IntCC::UnsignedGreaterThanOrEqual, tr, lr)
        } else {
            self.b.ins().icmp(IntCC::SignedGreaterThanOrEqual, tr, lr)
        };
        let below_cc = match (kind, unsigned) {
            (RangeKind::Closed, true) => IntCC::UnsignedLessThanOrEqual,
            (RangeKind::Closed, false) => IntCC::SignedLessThanOrEqual,
            (RangeKind::HalfOpen, true) => IntCC::UnsignedLessThan,
            (RangeKind::HalfOpen, false) => IntCC::SignedLessThan,
        };
        let below = self.b.ins().icmp(below_cc, tr, hr);
        Ok(self.b.ins().band(above, below))
    }

    // ─── Returns and branches ───────────────────────────────────

    fn build_return(&mut self, results: &[Expr]) -> CodegenResult<()> {
        if results.is_empty() {
            return self.emit_return(Vec::new());
        }
        let sem = self.sem;
        let proc = self.proc;
        let expect: Vec<TypeId> = proc
            .sig
            .results
            .iter()
            .map(|&e| sem.entity(e).ty)
            .filter(|&t| !sem.types.is_void(t))
            .collect();
        let values = self.flatten_values(results, &expect)?;
        self.emit_return(values)
    }

    fn build_branch(&mut self, kind: BranchKind, label: Option<&Label>) -> CodegenResult<()> {
        let mut resolved = match label {
            Some(l) => self.labeled_target(kind, l),
            None => None,
        };
        if resolved.is_none() {
            resolved = self.unlabeled_target(kind);
        }
        let (region, to_scope) = match resolved {
            Some(r) => r,
            None => return internal_error("branch has no target in scope"),
        };
        self.emit_defers(DeferExit::Branch { to_scope })?;
        self.goto_region(region);
        Ok(())
    }

    fn labeled_target(&self, kind: BranchKind, label: &Label) -> Option<(Block, usize)> {
        let r = self.branch_regions.iter().rev().find(|r| &r.label == label)?;
        match kind {
            BranchKind::Break => Some((r.break_region, r.scope_index)),
            // continue ends the body scope but keeps the construct's
            BranchKind::Continue => r.continue_region.map(|c| (c, r.scope_index + 1)),
            BranchKind::Fallthrough => None,
        }
    }

    fn unlabeled_target(&self, kind: BranchKind) -> Option<(Block, usize)> {
        for entry in self.targets.iter().rev() {
            match kind {
                BranchKind::Break => {
                    if entry.is_block {
                        continue;
                    }
                    if let Some(b) = entry.break_region {
                        return Some((b, entry.scope_index));
                    }
                }
                BranchKind::Continue => {
                    if let Some(c) = entry.continue_region {
                        return Some((c, entry.scope_index + 1));
                    }
                }
                BranchKind::Fallthrough => {
                    // binds to the innermost switch; the last clause
                    // has no successor to fall into
                    if !entry.is_block && entry.continue_region.is_none() {
                        return entry.fallthrough_region.map(|f| (f, entry.scope_index + 1));
                    }
                }
            }
        }
        None
    }

    fn push_target(
        &mut self,
        label: Option<&Label>,
        entry: TargetEntry,
        brk: Block,
        cont: Option<Block>,
    ) {
        if let Some(l) = label {
            self.branch_regions.push(BranchRegion {
                label: l.clone(),
                break_region: brk,
                continue_region: cont,
                scope_index: entry.scope_index,
            });
        }
        self.targets.push(entry);
    }

    fn pop_target(&mut self, label: Option<&Label>) {
        self.targets.pop();
        if label.is_some() {
            self.branch_regions.pop();
        }
    }
}

/// Jump-table dispatch plan for an all-constant integer switch.
struct SwitchTable {
    /// Added to the tag so the smallest case value lands on slot zero.
    delta: i64,
    /// Clause index per table slot; open slots take the default edge.
    slots: Vec<Option<usize>>,
}

/// Tag types eligible for table dispatch: native-order integers, or
/// enums through their backing, at most 64 bits wide.
fn switch_tag_width(types: &TypeTable, ty: TypeId) -> Option<(u16, bool)> {
    match *types.kind(types.core(ty)) {
        TypeKind::Int {
            bits,
            signed,
            endian: Endian::Native,
        } if bits <= 64 => Some((bits, !signed)),
        _ => None,
    }
}

/// Truncate a folded constant to the tag's width, then re-read it with
/// the tag's signedness.
fn norm_tag(v: i128, bits: u16, unsigned: bool) -> i128 {
    let mask = (1i128 << bits) - 1;
    let raw = v & mask;
    if unsigned || raw & (1i128 << (bits - 1)) == 0 {
        raw
    } else {
        raw | !mask
    }
}
