// SPDX-License-Identifier: (MIT OR Apache-2.0)

//! Backend tests: checked ASTs lower to verifier-clean Cranelift IR
//! and object bytes.

#[cfg(test)]
mod tests {
    use keel_sem::{
        AssignOp, BinOp, BranchKind, CaseValue, CheckedModule, ConstValue, Endian, Entity,
        EntityId, EntityKind, Expr, ExprId, ExprKind, Field, IntrinsicOp, Label, Mode, Procedure,
        RangeKind, SelStep, Selection, Signature, SoaKind, Span, StateFlags, Stmt, StmtId,
        StmtKind, SwitchCase, TypeId, TypeKind, TypeTable, UnOp,
    };

    use crate::{BuildMode, CodegenError, ModuleLowering};

    // ── Checked-AST construction helpers ────────────────────────

    fn table() -> TypeTable {
        TypeTable::new(8, true)
    }

    fn int_ty(t: &mut TypeTable, bits: u16, signed: bool) -> TypeId {
        t.intern(TypeKind::Int {
            bits,
            signed,
            endian: Endian::Native,
        })
    }

    fn float_ty(t: &mut TypeTable, bits: u16) -> TypeId {
        t.intern(TypeKind::Float {
            bits,
            endian: Endian::Native,
        })
    }

    fn expr(kind: ExprKind, ty: TypeId, mode: Mode) -> Expr {
        Expr {
            id: ExprId(0),
            kind,
            ty,
            mode,
            value: None,
            flags: StateFlags::INHERIT,
            span: Span::default(),
        }
    }

    fn int_lit(v: i128, ty: TypeId) -> Expr {
        let mut e = expr(ExprKind::Lit, ty, Mode::Constant);
        e.value = Some(ConstValue::Int(v));
        e
    }

    fn float_lit(v: f64, ty: TypeId) -> Expr {
        let mut e = expr(ExprKind::Lit, ty, Mode::Constant);
        e.value = Some(ConstValue::Float(v));
        e
    }

    fn str_lit(s: &str, ty: TypeId) -> Expr {
        let mut e = expr(ExprKind::Lit, ty, Mode::Constant);
        e.value = Some(ConstValue::Str(s.to_string()));
        e
    }

    fn var(eid: EntityId, ty: TypeId) -> Expr {
        expr(ExprKind::Ident(eid), ty, Mode::Variable)
    }

    fn binary(op: BinOp, lhs: Expr, rhs: Expr, ty: TypeId) -> Expr {
        expr(
            ExprKind::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
            ty,
            Mode::Value,
        )
    }

    fn convert(operand: Expr, ty: TypeId) -> Expr {
        expr(
            ExprKind::Convert {
                operand: Box::new(operand),
            },
            ty,
            Mode::Value,
        )
    }

    fn call_expr(callee: Expr, args: Vec<Expr>, ty: TypeId) -> Expr {
        expr(
            ExprKind::Call {
                callee: Box::new(callee),
                args,
            },
            ty,
            Mode::Value,
        )
    }

    fn index(base: Expr, idx: Expr, ty: TypeId) -> Expr {
        expr(
            ExprKind::Index {
                base: Box::new(base),
                index: Box::new(idx),
            },
            ty,
            Mode::Variable,
        )
    }

    fn field_sel(base: Expr, field: usize, ty: TypeId) -> Expr {
        expr(
            ExprKind::Selector {
                base: Box::new(base),
                sel: Selection {
                    steps: vec![SelStep::Field(field)],
                },
            },
            ty,
            Mode::Variable,
        )
    }

    fn stmt(kind: StmtKind) -> Stmt {
        Stmt {
            id: StmtId(0),
            kind,
            flags: StateFlags::INHERIT,
            span: Span::default(),
        }
    }

    fn decl(entities: Vec<EntityId>, inits: Vec<Expr>) -> Stmt {
        stmt(StmtKind::Decl { entities, inits })
    }

    fn assign(lhs: Vec<Expr>, rhs: Vec<Expr>) -> Stmt {
        stmt(StmtKind::Assign {
            op: AssignOp::Plain,
            lhs,
            rhs,
        })
    }

    fn compound(op: BinOp, lhs: Expr, rhs: Expr) -> Stmt {
        stmt(StmtKind::Assign {
            op: AssignOp::Compound(op),
            lhs: vec![lhs],
            rhs: vec![rhs],
        })
    }

    fn ret(results: Vec<Expr>) -> Stmt {
        stmt(StmtKind::Return { results })
    }

    fn branch(kind: BranchKind, label: Option<&str>) -> Stmt {
        stmt(StmtKind::Branch {
            kind,
            label: label.map(|s| Label(s.to_string())),
        })
    }

    fn local(sem: &mut CheckedModule, name: &str, ty: TypeId) -> EntityId {
        sem.add_entity(Entity {
            name: name.to_string(),
            ty,
            kind: EntityKind::Local,
        })
    }

    fn param(sem: &mut CheckedModule, name: &str, ty: TypeId, idx: usize) -> EntityId {
        sem.add_entity(Entity {
            name: name.to_string(),
            ty,
            kind: EntityKind::Param { index: idx },
        })
    }

    fn result(sem: &mut CheckedModule, ty: TypeId, idx: usize) -> EntityId {
        sem.add_entity(Entity {
            name: format!("r{}", idx),
            ty,
            kind: EntityKind::Result { index: idx },
        })
    }

    fn proc_of(
        sem: &mut CheckedModule,
        name: &str,
        params: Vec<EntityId>,
        results: Vec<EntityId>,
        body: Vec<Stmt>,
    ) -> keel_sem::ProcedureId {
        sem.add_proc(Procedure {
            name: name.to_string(),
            sig: Signature {
                params,
                results,
                named_results: false,
            },
            body,
            link_name: None,
        })
    }

    fn lower(sem: &CheckedModule) -> ModuleLowering {
        let mut gen = ModuleLowering::new(BuildMode::Debug).unwrap();
        gen.lower_module(sem).unwrap();
        gen
    }

    // ═══════════════════════════════════════════════════════════
    // Values and returns
    // ═══════════════════════════════════════════════════════════

    #[test]
    fn return_constant() {
        // answer :: proc() -> i32 { return 42 }
        let mut t = table();
        let i32t = int_ty(&mut t, 32, true);
        let mut sem = CheckedModule::new(t);
        let r = result(&mut sem, i32t, 0);
        proc_of(&mut sem, "answer", vec![], vec![r], vec![ret(vec![int_lit(42, i32t)])]);
        lower(&sem);
    }

    #[test]
    fn void_return_and_fallthrough() {
        // noop :: proc() { return }  /  idle :: proc() { }
        let t = table();
        let mut sem = CheckedModule::new(t);
        proc_of(&mut sem, "noop", vec![], vec![], vec![ret(vec![])]);
        proc_of(&mut sem, "idle", vec![], vec![], vec![]);
        lower(&sem);
    }

    #[test]
    fn narrow_constant_immediates() {
        // high_bit :: proc() -> u8 { return 255 }
        let mut t = table();
        let u8t = int_ty(&mut t, 8, false);
        let mut sem = CheckedModule::new(t);
        let r = result(&mut sem, u8t, 0);
        proc_of(&mut sem, "high_bit", vec![], vec![r], vec![ret(vec![int_lit(255, u8t)])]);
        lower(&sem);
    }

    #[test]
    fn wide_integer_constant() {
        // big :: proc() -> i128 { return 1 << 100 }
        let mut t = table();
        let i128t = int_ty(&mut t, 128, true);
        let mut sem = CheckedModule::new(t);
        let r = result(&mut sem, i128t, 0);
        proc_of(
            &mut sem,
            "big",
            vec![],
            vec![r],
            vec![ret(vec![int_lit(1i128 << 100, i128t)])],
        );
        lower(&sem);
    }

    #[test]
    fn named_result_written_by_defer() {
        // late :: proc() -> (n: i32) { defer n = 3; return }
        let mut t = table();
        let i32t = int_ty(&mut t, 32, true);
        let mut sem = CheckedModule::new(t);
        let n = result(&mut sem, i32t, 0);
        sem.add_proc(Procedure {
            name: "late".to_string(),
            sig: Signature {
                params: vec![],
                results: vec![n],
                named_results: true,
            },
            body: vec![
                stmt(StmtKind::Defer {
                    stmt: Box::new(assign(vec![var(n, i32t)], vec![int_lit(3, i32t)])),
                }),
                ret(vec![]),
            ],
            link_name: None,
        });
        lower(&sem);
    }

    // ═══════════════════════════════════════════════════════════
    // Parameters and arithmetic
    // ═══════════════════════════════════════════════════════════

    #[test]
    fn params_add() {
        // add :: proc(a, b: i32) -> i32 { return a + b }
        let mut t = table();
        let i32t = int_ty(&mut t, 32, true);
        let mut sem = CheckedModule::new(t);
        let a = param(&mut sem, "a", i32t, 0);
        let b = param(&mut sem, "b", i32t, 1);
        let r = result(&mut sem, i32t, 0);
        proc_of(
            &mut sem,
            "add",
            vec![a, b],
            vec![r],
            vec![ret(vec![binary(BinOp::Add, var(a, i32t), var(b, i32t), i32t)])],
        );
        lower(&sem);
    }

    #[test]
    fn float_scale_and_negate() {
        // scale :: proc(x: f64) -> f64 { return -(x * 2.5) }
        let mut t = table();
        let f64t = float_ty(&mut t, 64);
        let mut sem = CheckedModule::new(t);
        let x = param(&mut sem, "x", f64t, 0);
        let r = result(&mut sem, f64t, 0);
        let product = binary(BinOp::Mul, var(x, f64t), float_lit(2.5, f64t), f64t);
        let neg = expr(
            ExprKind::Unary {
                op: UnOp::Neg,
                operand: Box::new(product),
            },
            f64t,
            Mode::Value,
        );
        proc_of(&mut sem, "scale", vec![x], vec![r], vec![ret(vec![neg])]);
        lower(&sem);
    }

    #[test]
    fn comparison_yields_bool() {
        // less :: proc(a, b: i64) -> bool { return a < b }
        let mut t = table();
        let i64t = int_ty(&mut t, 64, true);
        let boolt = t.intern(TypeKind::Bool);
        let mut sem = CheckedModule::new(t);
        let a = param(&mut sem, "a", i64t, 0);
        let b = param(&mut sem, "b", i64t, 1);
        let r = result(&mut sem, boolt, 0);
        proc_of(
            &mut sem,
            "less",
            vec![a, b],
            vec![r],
            vec![ret(vec![binary(BinOp::Lt, var(a, i64t), var(b, i64t), boolt)])],
        );
        lower(&sem);
    }

    #[test]
    fn fixed_array_add_is_lanewise() {
        // sum :: proc(a, b: [4]i32) -> [4]i32 { return a + b }
        // No wide path for plain arrays: one scalar add per lane.
        let mut t = table();
        let i32t = int_ty(&mut t, 32, true);
        let arr = t.intern(TypeKind::Array { elem: i32t, len: 4 });
        let mut sem = CheckedModule::new(t);
        let a = param(&mut sem, "a", arr, 0);
        let b = param(&mut sem, "b", arr, 1);
        let r = result(&mut sem, arr, 0);
        proc_of(
            &mut sem,
            "sum",
            vec![a, b],
            vec![r],
            vec![ret(vec![binary(BinOp::Add, var(a, arr), var(b, arr), arr)])],
        );
        lower(&sem);
    }

    #[test]
    fn simd_vector_add() {
        // vsum :: proc(a, b: #simd[4]f32) -> #simd[4]f32 { return a + b }
        let mut t = table();
        let f32t = float_ty(&mut t, 32);
        let v4 = t.intern(TypeKind::Simd { elem: f32t, lanes: 4 });
        let mut sem = CheckedModule::new(t);
        let a = param(&mut sem, "a", v4, 0);
        let b = param(&mut sem, "b", v4, 1);
        let r = result(&mut sem, v4, 0);
        proc_of(
            &mut sem,
            "vsum",
            vec![a, b],
            vec![r],
            vec![ret(vec![binary(BinOp::Add, var(a, v4), var(b, v4), v4)])],
        );
        lower(&sem);
    }

    #[test]
    fn matrix_add_elementwise() {
        // madd :: proc(a, b: matrix[2,2]f32) -> matrix[2,2]f32 { return a + b }
        let mut t = table();
        let f32t = float_ty(&mut t, 32);
        let m22 = t.intern(TypeKind::Matrix {
            elem: f32t,
            rows: 2,
            cols: 2,
        });
        let mut sem = CheckedModule::new(t);
        let a = param(&mut sem, "a", m22, 0);
        let b = param(&mut sem, "b", m22, 1);
        let r = result(&mut sem, m22, 0);
        proc_of(
            &mut sem,
            "madd",
            vec![a, b],
            vec![r],
            vec![ret(vec![binary(BinOp::Add, var(a, m22), var(b, m22), m22)])],
        );
        lower(&sem);
    }

    #[test]
    fn complex_divide_calls_runtime() {
        // cdiv :: proc(a, b: complex64) -> complex64 { return a / b }
        let mut t = table();
        let c64 = t.intern(TypeKind::Complex { bits: 32 });
        let mut sem = CheckedModule::new(t);
        let a = param(&mut sem, "a", c64, 0);
        let b = param(&mut sem, "b", c64, 1);
        let r = result(&mut sem, c64, 0);
        proc_of(
            &mut sem,
            "cdiv",
            vec![a, b],
            vec![r],
            vec![ret(vec![binary(BinOp::Div, var(a, c64), var(b, c64), c64)])],
        );
        lower(&sem);
    }

    #[test]
    fn remainder_both_styles() {
        // rem :: proc(a, b: i32) -> i32 { x := a % b; return x %% b }
        let mut t = table();
        let i32t = int_ty(&mut t, 32, true);
        let mut sem = CheckedModule::new(t);
        let a = param(&mut sem, "a", i32t, 0);
        let b = param(&mut sem, "b", i32t, 1);
        let r = result(&mut sem, i32t, 0);
        let x = local(&mut sem, "x", i32t);
        proc_of(
            &mut sem,
            "rem",
            vec![a, b],
            vec![r],
            vec![
                decl(
                    vec![x],
                    vec![binary(BinOp::Mod, var(a, i32t), var(b, i32t), i32t)],
                ),
                ret(vec![binary(
                    BinOp::ModFloor,
                    var(x, i32t),
                    var(b, i32t),
                    i32t,
                )]),
            ],
        );
        lower(&sem);
    }

    #[test]
    fn bit_ops_and_shifts() {
        // bits :: proc(a: u64, s: u8) -> u64 { return (a &~ 15) << s }
        let mut t = table();
        let u64t = int_ty(&mut t, 64, false);
        let u8t = int_ty(&mut t, 8, false);
        let mut sem = CheckedModule::new(t);
        let a = param(&mut sem, "a", u64t, 0);
        let s = param(&mut sem, "s", u8t, 1);
        let r = result(&mut sem, u64t, 0);
        let masked = binary(BinOp::AndNot, var(a, u64t), int_lit(15, u64t), u64t);
        proc_of(
            &mut sem,
            "bits",
            vec![a, s],
            vec![r],
            vec![ret(vec![binary(BinOp::Shl, masked, var(s, u8t), u64t)])],
        );
        lower(&sem);
    }

    #[test]
    fn compound_assign_scalar_and_array() {
        // bump :: proc() { x := 1; x += 2; a: [3]i64; a += a }
        let mut t = table();
        let i64t = int_ty(&mut t, 64, true);
        let arr = t.intern(TypeKind::Array { elem: i64t, len: 3 });
        let mut sem = CheckedModule::new(t);
        let x = local(&mut sem, "x", i64t);
        let a = local(&mut sem, "a", arr);
        proc_of(
            &mut sem,
            "bump",
            vec![],
            vec![],
            vec![
                decl(vec![x], vec![int_lit(1, i64t)]),
                compound(BinOp::Add, var(x, i64t), int_lit(2, i64t)),
                decl(vec![a], vec![]),
                compound(BinOp::Add, var(a, arr), var(a, arr)),
                ret(vec![]),
            ],
        );
        lower(&sem);
    }

    #[test]
    fn logical_compound_short_circuits() {
        // gate :: proc(p, q: bool) -> bool { x := p; x &&= q; x ||= p; return x }
        let mut t = table();
        let boolt = t.intern(TypeKind::Bool);
        let mut sem = CheckedModule::new(t);
        let p = param(&mut sem, "p", boolt, 0);
        let q = param(&mut sem, "q", boolt, 1);
        let r = result(&mut sem, boolt, 0);
        let x = local(&mut sem, "x", boolt);
        proc_of(
            &mut sem,
            "gate",
            vec![p, q],
            vec![r],
            vec![
                decl(vec![x], vec![var(p, boolt)]),
                compound(BinOp::And, var(x, boolt), var(q, boolt)),
                compound(BinOp::Or, var(x, boolt), var(p, boolt)),
                ret(vec![var(x, boolt)]),
            ],
        );
        lower(&sem);
    }

    // ═══════════════════════════════════════════════════════════
    // Conversions
    // ═══════════════════════════════════════════════════════════

    #[test]
    fn integer_width_round_trip() {
        // widen :: proc(x: i32) -> i32 { w := i64(x); return i32(w) }
        let mut t = table();
        let i32t = int_ty(&mut t, 32, true);
        let i64t = int_ty(&mut t, 64, true);
        let mut sem = CheckedModule::new(t);
        let x = param(&mut sem, "x", i32t, 0);
        let r = result(&mut sem, i32t, 0);
        let w = local(&mut sem, "w", i64t);
        proc_of(
            &mut sem,
            "widen",
            vec![x],
            vec![r],
            vec![
                decl(vec![w], vec![convert(var(x, i32t), i64t)]),
                ret(vec![convert(var(w, i64t), i32t)]),
            ],
        );
        lower(&sem);
    }

    #[test]
    fn int_float_bool_conversions() {
        // mixed :: proc(x: i32, f: f32) -> f64 { b := bool(x); n := i32(b); return f64(f) + f64(n) }
        let mut t = table();
        let i32t = int_ty(&mut t, 32, true);
        let f32t = float_ty(&mut t, 32);
        let f64t = float_ty(&mut t, 64);
        let boolt = t.intern(TypeKind::Bool);
        let mut sem = CheckedModule::new(t);
        let x = param(&mut sem, "x", i32t, 0);
        let f = param(&mut sem, "f", f32t, 1);
        let r = result(&mut sem, f64t, 0);
        let b = local(&mut sem, "b", boolt);
        let n = local(&mut sem, "n", i32t);
        proc_of(
            &mut sem,
            "mixed",
            vec![x, f],
            vec![r],
            vec![
                decl(vec![b], vec![convert(var(x, i32t), boolt)]),
                decl(vec![n], vec![convert(var(b, boolt), i32t)]),
                ret(vec![binary(
                    BinOp::Add,
                    convert(var(f, f32t), f64t),
                    convert(var(n, i32t), f64t),
                    f64t,
                )]),
            ],
        );
        lower(&sem);
    }

    #[test]
    fn i128_to_float_uses_helper_call() {
        // soften :: proc(x: i128) -> f64 { return f64(x) }
        // No native 128-bit convert: exactly one runtime call.
        let mut t = table();
        let i128t = int_ty(&mut t, 128, true);
        let f64t = float_ty(&mut t, 64);
        let mut sem = CheckedModule::new(t);
        let x = param(&mut sem, "x", i128t, 0);
        let r = result(&mut sem, f64t, 0);
        proc_of(
            &mut sem,
            "soften",
            vec![x],
            vec![r],
            vec![ret(vec![convert(var(x, i128t), f64t)])],
        );
        lower(&sem);
    }

    #[test]
    fn explicit_endian_round_trip() {
        // flip :: proc(x: u32) -> u32 { be := u32be(x); return u32(be) }
        let mut t = table();
        let u32t = int_ty(&mut t, 32, false);
        let u32be = t.intern(TypeKind::Int {
            bits: 32,
            signed: false,
            endian: Endian::Big,
        });
        let mut sem = CheckedModule::new(t);
        let x = param(&mut sem, "x", u32t, 0);
        let r = result(&mut sem, u32t, 0);
        let be = local(&mut sem, "be", u32be);
        proc_of(
            &mut sem,
            "flip",
            vec![x],
            vec![r],
            vec![
                decl(vec![be], vec![convert(var(x, u32t), u32be)]),
                ret(vec![convert(var(be, u32be), u32t)]),
            ],
        );
        lower(&sem);
    }

    #[test]
    fn union_injection_and_assert() {
        // pick :: proc(x: i32) -> f64 { u: union { i32, f64 } = x; u = 2.5; return u.(f64) }
        let mut t = table();
        let i32t = int_ty(&mut t, 32, true);
        let f64t = float_ty(&mut t, 64);
        let u = t.intern(TypeKind::Union {
            variants: vec![i32t, f64t],
            maybe_pointer: false,
        });
        let mut sem = CheckedModule::new(t);
        let x = param(&mut sem, "x", i32t, 0);
        let r = result(&mut sem, f64t, 0);
        let uv = local(&mut sem, "u", u);
        let assert = expr(
            ExprKind::TypeAssert {
                operand: Box::new(var(uv, u)),
                with_ok: false,
            },
            f64t,
            Mode::Value,
        );
        proc_of(
            &mut sem,
            "pick",
            vec![x],
            vec![r],
            vec![
                decl(vec![uv], vec![convert(var(x, i32t), u)]),
                assign(vec![var(uv, u)], vec![convert(float_lit(2.5, f64t), u)]),
                ret(vec![assert]),
            ],
        );
        lower(&sem);
    }

    #[test]
    fn any_boxing_and_assert() {
        // box :: proc(x: i64) -> i64 { a: any = x; return a.(i64) }
        let mut t = table();
        let i64t = int_ty(&mut t, 64, true);
        let anyt = t.intern(TypeKind::Any);
        let mut sem = CheckedModule::new(t);
        let x = param(&mut sem, "x", i64t, 0);
        let r = result(&mut sem, i64t, 0);
        let a = local(&mut sem, "a", anyt);
        let assert = expr(
            ExprKind::TypeAssert {
                operand: Box::new(var(a, anyt)),
                with_ok: false,
            },
            i64t,
            Mode::Value,
        );
        proc_of(
            &mut sem,
            "box",
            vec![x],
            vec![r],
            vec![
                decl(vec![a], vec![convert(var(x, i64t), anyt)]),
                ret(vec![assert]),
            ],
        );
        lower(&sem);
    }

    #[test]
    fn transmute_float_bits() {
        // bits_of :: proc(x: f32) -> u32 { return transmute(u32)x }
        let mut t = table();
        let f32t = float_ty(&mut t, 32);
        let u32t = int_ty(&mut t, 32, false);
        let mut sem = CheckedModule::new(t);
        let x = param(&mut sem, "x", f32t, 0);
        let r = result(&mut sem, u32t, 0);
        let tm = expr(
            ExprKind::Transmute {
                operand: Box::new(var(x, f32t)),
            },
            u32t,
            Mode::Value,
        );
        proc_of(&mut sem, "bits_of", vec![x], vec![r], vec![ret(vec![tm])]);
        lower(&sem);
    }

    // ═══════════════════════════════════════════════════════════
    // Memory access
    // ═══════════════════════════════════════════════════════════

    #[test]
    fn struct_field_store_load() {
        // fields :: proc() -> i64 { p: Pair; p.a = 1; p.b = 2; return p.b }
        let mut t = table();
        let i32t = int_ty(&mut t, 32, true);
        let i64t = int_ty(&mut t, 64, true);
        let pair = t.intern(TypeKind::Struct {
            fields: vec![
                Field {
                    name: "a".to_string(),
                    ty: i32t,
                },
                Field {
                    name: "b".to_string(),
                    ty: i64t,
                },
            ],
            soa: SoaKind::None,
        });
        let mut sem = CheckedModule::new(t);
        let r = result(&mut sem, i64t, 0);
        let p = local(&mut sem, "p", pair);
        proc_of(
            &mut sem,
            "fields",
            vec![],
            vec![r],
            vec![
                decl(vec![p], vec![]),
                assign(vec![field_sel(var(p, pair), 0, i32t)], vec![int_lit(1, i32t)]),
                assign(vec![field_sel(var(p, pair), 1, i64t)], vec![int_lit(2, i64t)]),
                ret(vec![field_sel(var(p, pair), 1, i64t)]),
            ],
        );
        lower(&sem);
    }

    #[test]
    fn selector_through_pointer_hop() {
        // through :: proc(p: ^Pair) -> i32 { return p.a }
        let mut t = table();
        let i32t = int_ty(&mut t, 32, true);
        let pair = t.intern(TypeKind::Struct {
            fields: vec![
                Field {
                    name: "a".to_string(),
                    ty: i32t,
                },
                Field {
                    name: "b".to_string(),
                    ty: i32t,
                },
            ],
            soa: SoaKind::None,
        });
        let ptr = t.intern(TypeKind::Pointer { elem: pair });
        let mut sem = CheckedModule::new(t);
        let p = param(&mut sem, "p", ptr, 0);
        let r = result(&mut sem, i32t, 0);
        proc_of(
            &mut sem,
            "through",
            vec![p],
            vec![r],
            vec![ret(vec![field_sel(var(p, ptr), 0, i32t)])],
        );
        lower(&sem);
    }

    #[test]
    fn index_array_constant_and_runtime() {
        // pluck :: proc(i: i64) -> i32 { a: [4]i32; a[2] = 7; return a[i] }
        // The folded in-range index takes no branch; the runtime one does.
        let mut t = table();
        let i32t = int_ty(&mut t, 32, true);
        let i64t = int_ty(&mut t, 64, true);
        let arr = t.intern(TypeKind::Array { elem: i32t, len: 4 });
        let mut sem = CheckedModule::new(t);
        let i = param(&mut sem, "i", i64t, 0);
        let r = result(&mut sem, i32t, 0);
        let a = local(&mut sem, "a", arr);
        proc_of(
            &mut sem,
            "pluck",
            vec![i],
            vec![r],
            vec![
                decl(vec![a], vec![]),
                assign(
                    vec![index(var(a, arr), int_lit(2, i64t), i32t)],
                    vec![int_lit(7, i32t)],
                ),
                ret(vec![index(var(a, arr), var(i, i64t), i32t)]),
            ],
        );
        lower(&sem);
    }

    #[test]
    fn slice_index_bounds_checked() {
        // nth :: proc(s: []i32, i: i64) -> i32 { return s[i] }
        let mut t = table();
        let i32t = int_ty(&mut t, 32, true);
        let i64t = int_ty(&mut t, 64, true);
        let sl = t.intern(TypeKind::Slice { elem: i32t });
        let mut sem = CheckedModule::new(t);
        let s = param(&mut sem, "s", sl, 0);
        let i = param(&mut sem, "i", i64t, 1);
        let r = result(&mut sem, i32t, 0);
        proc_of(
            &mut sem,
            "nth",
            vec![s, i],
            vec![r],
            vec![ret(vec![index(var(s, sl), var(i, i64t), i32t)])],
        );
        lower(&sem);
    }

    #[test]
    fn slice_expression_headers() {
        // cut :: proc(s: string) -> string { return s[1:3] }
        let mut t = table();
        let strt = t.intern(TypeKind::String);
        let i64t = int_ty(&mut t, 64, true);
        let mut sem = CheckedModule::new(t);
        let s = param(&mut sem, "s", strt, 0);
        let r = result(&mut sem, strt, 0);
        let sl = expr(
            ExprKind::SliceExpr {
                base: Box::new(var(s, strt)),
                lo: Some(Box::new(int_lit(1, i64t))),
                hi: Some(Box::new(int_lit(3, i64t))),
            },
            strt,
            Mode::Value,
        );
        proc_of(&mut sem, "cut", vec![s], vec![r], vec![ret(vec![sl])]);
        lower(&sem);
    }

    #[test]
    fn map_set_get_and_two_value_lookup() {
        // cache :: proc(k: i32) -> i64 {
        //     m: map[i32]i64
        //     m[k] = 9
        //     v, ok := m[k]
        //     if ok { return v }
        //     return 0
        // }
        let mut t = table();
        let i32t = int_ty(&mut t, 32, true);
        let i64t = int_ty(&mut t, 64, true);
        let boolt = t.intern(TypeKind::Bool);
        let mapt = t.intern(TypeKind::Map {
            key: i32t,
            value: i64t,
        });
        let mut sem = CheckedModule::new(t);
        let k = param(&mut sem, "k", i32t, 0);
        let r = result(&mut sem, i64t, 0);
        let m = local(&mut sem, "m", mapt);
        let v = local(&mut sem, "v", i64t);
        let ok = local(&mut sem, "ok", boolt);
        proc_of(
            &mut sem,
            "cache",
            vec![k],
            vec![r],
            vec![
                decl(vec![m], vec![]),
                assign(
                    vec![index(var(m, mapt), var(k, i32t), i64t)],
                    vec![int_lit(9, i64t)],
                ),
                decl(vec![v, ok], vec![index(var(m, mapt), var(k, i32t), i64t)]),
                stmt(StmtKind::If {
                    label: None,
                    init: None,
                    cond: var(ok, boolt),
                    then_body: vec![ret(vec![var(v, i64t)])],
                    else_stmt: None,
                }),
                ret(vec![int_lit(0, i64t)]),
            ],
        );
        lower(&sem);
    }

    #[test]
    fn swizzle_read() {
        // swz :: proc(v: [4]f32) -> [3]f32 { return v.zyx }
        let mut t = table();
        let f32t = float_ty(&mut t, 32);
        let v4 = t.intern(TypeKind::Array { elem: f32t, len: 4 });
        let v3 = t.intern(TypeKind::Array { elem: f32t, len: 3 });
        let mut sem = CheckedModule::new(t);
        let v = param(&mut sem, "v", v4, 0);
        let r = result(&mut sem, v3, 0);
        let swz = expr(
            ExprKind::Swizzle {
                base: Box::new(var(v, v4)),
                indices: vec![2, 1, 0],
            },
            v3,
            Mode::Variable,
        );
        proc_of(&mut sem, "swz", vec![v], vec![r], vec![ret(vec![swz])]);
        lower(&sem);
    }

    #[test]
    fn address_of_and_deref() {
        // indirect :: proc() -> i32 { x := 5; p := &x; return p^ }
        let mut t = table();
        let i32t = int_ty(&mut t, 32, true);
        let ptr = t.intern(TypeKind::Pointer { elem: i32t });
        let mut sem = CheckedModule::new(t);
        let r = result(&mut sem, i32t, 0);
        let x = local(&mut sem, "x", i32t);
        let p = local(&mut sem, "p", ptr);
        let take = expr(
            ExprKind::AddressOf {
                base: Box::new(var(x, i32t)),
            },
            ptr,
            Mode::Value,
        );
        let deref = expr(
            ExprKind::Deref {
                base: Box::new(var(p, ptr)),
            },
            i32t,
            Mode::Variable,
        );
        proc_of(
            &mut sem,
            "indirect",
            vec![],
            vec![r],
            vec![
                decl(vec![x], vec![int_lit(5, i32t)]),
                decl(vec![p], vec![take]),
                ret(vec![deref]),
            ],
        );
        lower(&sem);
    }

    #[test]
    fn relative_pointer_assign_and_deref() {
        // rel :: proc() -> i32 { x := 3; rp: #relative(i32) ^i32 = &x; return rp^ }
        let mut t = table();
        let i32t = int_ty(&mut t, 32, true);
        let ptr = t.intern(TypeKind::Pointer { elem: i32t });
        let rel = t.intern(TypeKind::RelativePointer {
            base: i32t,
            pointee: i32t,
        });
        let mut sem = CheckedModule::new(t);
        let r = result(&mut sem, i32t, 0);
        let x = local(&mut sem, "x", i32t);
        let rp = local(&mut sem, "rp", rel);
        let take = expr(
            ExprKind::AddressOf {
                base: Box::new(var(x, i32t)),
            },
            ptr,
            Mode::Value,
        );
        let deref = expr(
            ExprKind::Deref {
                base: Box::new(var(rp, rel)),
            },
            i32t,
            Mode::Variable,
        );
        proc_of(
            &mut sem,
            "rel",
            vec![],
            vec![r],
            vec![
                decl(vec![x], vec![int_lit(3, i32t)]),
                decl(vec![rp], vec![convert(take, rel)]),
                ret(vec![deref]),
            ],
        );
        lower(&sem);
    }

    #[test]
    fn string_literal_length() {
        // greet :: proc() -> i64 { s := "hello"; return len(s) }
        let mut t = table();
        let strt = t.intern(TypeKind::String);
        let i64t = int_ty(&mut t, 64, true);
        let mut sem = CheckedModule::new(t);
        let r = result(&mut sem, i64t, 0);
        let s = local(&mut sem, "s", strt);
        let len = expr(
            ExprKind::Intrinsic {
                op: IntrinsicOp::Len,
                args: vec![var(s, strt)],
            },
            i64t,
            Mode::Value,
        );
        proc_of(
            &mut sem,
            "greet",
            vec![],
            vec![r],
            vec![decl(vec![s], vec![str_lit("hello", strt)]), ret(vec![len])],
        );
        lower(&sem);
    }

    #[test]
    fn static_local_reads_module_data() {
        // counter :: proc() -> i64 { @(static) hits := 5; return hits }
        let mut t = table();
        let i64t = int_ty(&mut t, 64, true);
        let mut sem = CheckedModule::new(t);
        let r = result(&mut sem, i64t, 0);
        let hits = sem.add_entity(Entity {
            name: "hits".to_string(),
            ty: i64t,
            kind: EntityKind::StaticLocal {
                thread_local: false,
            },
        });
        proc_of(
            &mut sem,
            "counter",
            vec![],
            vec![r],
            vec![decl(vec![hits], vec![int_lit(5, i64t)]), ret(vec![var(hits, i64t)])],
        );
        lower(&sem);
    }

    #[test]
    fn globals_initialized_and_updated() {
        // total: i64 = 7
        // tick :: proc() -> i64 { total += 1; return total }
        let mut t = table();
        let i64t = int_ty(&mut t, 64, true);
        let mut sem = CheckedModule::new(t);
        let g = sem.add_entity(Entity {
            name: "total".to_string(),
            ty: i64t,
            kind: EntityKind::Global {
                mutable: true,
                thread_local: false,
            },
        });
        sem.globals.push((g, Some(ConstValue::Int(7))));
        let r = result(&mut sem, i64t, 0);
        proc_of(
            &mut sem,
            "tick",
            vec![],
            vec![r],
            vec![
                compound(BinOp::Add, var(g, i64t), int_lit(1, i64t)),
                ret(vec![var(g, i64t)]),
            ],
        );
        lower(&sem);
    }

    #[test]
    fn context_record_field_access() {
        // stamp :: proc() -> i64 { context.user_index = 9; return context.user_index }
        let mut t = table();
        let i64t = int_ty(&mut t, 64, true);
        let rawp = t.intern(TypeKind::RawPointer);
        let ctx = t.intern_named(
            TypeKind::Struct {
                fields: vec![
                    Field {
                        name: "user_index".to_string(),
                        ty: i64t,
                    },
                    Field {
                        name: "user_ptr".to_string(),
                        ty: rawp,
                    },
                ],
                soa: SoaKind::None,
            },
            Some("Context".to_string()),
        );
        let mut sem = CheckedModule::new(t);
        let r = result(&mut sem, i64t, 0);
        let ctx_ref = || expr(ExprKind::ContextRef, ctx, Mode::Variable);
        proc_of(
            &mut sem,
            "stamp",
            vec![],
            vec![r],
            vec![
                assign(
                    vec![field_sel(ctx_ref(), 0, i64t)],
                    vec![int_lit(9, i64t)],
                ),
                ret(vec![field_sel(ctx_ref(), 0, i64t)]),
            ],
        );
        lower(&sem);
    }

    #[test]
    fn union_tag_selector() {
        // which :: proc(u: union { i32, f64 }) -> u8 { return u.(tag) }
        let mut t = table();
        let i32t = int_ty(&mut t, 32, true);
        let f64t = float_ty(&mut t, 64);
        let u8t = int_ty(&mut t, 8, false);
        let u = t.intern(TypeKind::Union {
            variants: vec![i32t, f64t],
            maybe_pointer: false,
        });
        let mut sem = CheckedModule::new(t);
        let uv = param(&mut sem, "u", u, 0);
        let r = result(&mut sem, u8t, 0);
        let tag = expr(
            ExprKind::Selector {
                base: Box::new(var(uv, u)),
                sel: Selection {
                    steps: vec![SelStep::UnionTag],
                },
            },
            u8t,
            Mode::Value,
        );
        proc_of(&mut sem, "which", vec![uv], vec![r], vec![ret(vec![tag])]);
        lower(&sem);
    }

    #[test]
    fn two_value_type_assert() {
        // probe :: proc(u: union { i32, f64 }) -> i32 {
        //     v, ok := u.(i32)
        //     if ok { return v }
        //     return -1
        // }
        let mut t = table();
        let i32t = int_ty(&mut t, 32, true);
        let f64t = float_ty(&mut t, 64);
        let boolt = t.intern(TypeKind::Bool);
        let u = t.intern(TypeKind::Union {
            variants: vec![i32t, f64t],
            maybe_pointer: false,
        });
        let mut sem = CheckedModule::new(t);
        let uv = param(&mut sem, "u", u, 0);
        let r = result(&mut sem, i32t, 0);
        let v = local(&mut sem, "v", i32t);
        let ok = local(&mut sem, "ok", boolt);
        let assert = expr(
            ExprKind::TypeAssert {
                operand: Box::new(var(uv, u)),
                with_ok: true,
            },
            i32t,
            Mode::Value,
        );
        proc_of(
            &mut sem,
            "probe",
            vec![uv],
            vec![r],
            vec![
                decl(vec![v, ok], vec![assert]),
                stmt(StmtKind::If {
                    label: None,
                    init: None,
                    cond: var(ok, boolt),
                    then_body: vec![ret(vec![var(v, i32t)])],
                    else_stmt: None,
                }),
                ret(vec![int_lit(-1, i32t)]),
            ],
        );
        lower(&sem);
    }

    // ═══════════════════════════════════════════════════════════
    // Control flow
    // ═══════════════════════════════════════════════════════════

    #[test]
    fn if_else_with_init() {
        // sign :: proc(x: i32) -> i32 {
        //     if y := x; y < 0 { return -1 } else { return 1 }
        // }
        let mut t = table();
        let i32t = int_ty(&mut t, 32, true);
        let boolt = t.intern(TypeKind::Bool);
        let mut sem = CheckedModule::new(t);
        let x = param(&mut sem, "x", i32t, 0);
        let r = result(&mut sem, i32t, 0);
        let y = local(&mut sem, "y", i32t);
        proc_of(
            &mut sem,
            "sign",
            vec![x],
            vec![r],
            vec![
                stmt(StmtKind::If {
                    label: None,
                    init: Some(Box::new(decl(vec![y], vec![var(x, i32t)]))),
                    cond: binary(BinOp::Lt, var(y, i32t), int_lit(0, i32t), boolt),
                    then_body: vec![ret(vec![int_lit(-1, i32t)])],
                    else_stmt: Some(Box::new(stmt(StmtKind::Block {
                        label: None,
                        body: vec![ret(vec![int_lit(1, i32t)])],
                    }))),
                }),
                // both arms return; the join is unreachable but formed
                ret(vec![int_lit(0, i32t)]),
            ],
        );
        lower(&sem);
    }

    #[test]
    fn short_circuit_condition() {
        // both :: proc(p, q: bool) -> i32 { if p && !q { return 1 }; return 0 }
        let mut t = table();
        let boolt = t.intern(TypeKind::Bool);
        let i32t = int_ty(&mut t, 32, true);
        let mut sem = CheckedModule::new(t);
        let p = param(&mut sem, "p", boolt, 0);
        let q = param(&mut sem, "q", boolt, 1);
        let r = result(&mut sem, i32t, 0);
        let not_q = expr(
            ExprKind::Unary {
                op: UnOp::Not,
                operand: Box::new(var(q, boolt)),
            },
            boolt,
            Mode::Value,
        );
        proc_of(
            &mut sem,
            "both",
            vec![p, q],
            vec![r],
            vec![
                stmt(StmtKind::If {
                    label: None,
                    init: None,
                    cond: binary(BinOp::And, var(p, boolt), not_q, boolt),
                    then_body: vec![ret(vec![int_lit(1, i32t)])],
                    else_stmt: None,
                }),
                ret(vec![int_lit(0, i32t)]),
            ],
        );
        lower(&sem);
    }

    #[test]
    fn for_loop_with_continue() {
        // total :: proc(n: i64) -> i64 {
        //     s := 0
        //     for i := 0; i < n; i += 1 {
        //         if i == 5 { continue }   // back-edge straight to post
        //         s += i
        //     }
        //     return s
        // }
        let mut t = table();
        let i64t = int_ty(&mut t, 64, true);
        let boolt = t.intern(TypeKind::Bool);
        let mut sem = CheckedModule::new(t);
        let n = param(&mut sem, "n", i64t, 0);
        let r = result(&mut sem, i64t, 0);
        let s = local(&mut sem, "s", i64t);
        let i = local(&mut sem, "i", i64t);
        proc_of(
            &mut sem,
            "total",
            vec![n],
            vec![r],
            vec![
                decl(vec![s], vec![int_lit(0, i64t)]),
                stmt(StmtKind::For {
                    label: None,
                    init: Some(Box::new(decl(vec![i], vec![int_lit(0, i64t)]))),
                    cond: Some(binary(BinOp::Lt, var(i, i64t), var(n, i64t), boolt)),
                    post: Some(Box::new(compound(
                        BinOp::Add,
                        var(i, i64t),
                        int_lit(1, i64t),
                    ))),
                    body: vec![
                        stmt(StmtKind::If {
                            label: None,
                            init: None,
                            cond: binary(BinOp::Eq, var(i, i64t), int_lit(5, i64t), boolt),
                            then_body: vec![branch(BranchKind::Continue, None)],
                            else_stmt: None,
                        }),
                        compound(BinOp::Add, var(s, i64t), var(i, i64t)),
                    ],
                }),
                ret(vec![var(s, i64t)]),
            ],
        );
        lower(&sem);
    }

    #[test]
    fn bare_loop_breaks_out() {
        // spin :: proc() { for { break } }
        let t = table();
        let mut sem = CheckedModule::new(t);
        proc_of(
            &mut sem,
            "spin",
            vec![],
            vec![],
            vec![
                stmt(StmtKind::For {
                    label: None,
                    init: None,
                    cond: None,
                    post: None,
                    body: vec![branch(BranchKind::Break, None)],
                }),
                ret(vec![]),
            ],
        );
        lower(&sem);
    }

    #[test]
    fn closed_range_interval_has_wrap_guard() {
        // full :: proc() -> u8 { s: u8; for v in 0..=255 { s = v }; return s }
        let mut t = table();
        let u8t = int_ty(&mut t, 8, false);
        let mut sem = CheckedModule::new(t);
        let r = result(&mut sem, u8t, 0);
        let s = local(&mut sem, "s", u8t);
        let v = local(&mut sem, "v", u8t);
        proc_of(
            &mut sem,
            "full",
            vec![],
            vec![r],
            vec![
                decl(vec![s], vec![]),
                stmt(StmtKind::RangeInterval {
                    label: None,
                    value: Some(v),
                    index: None,
                    lo: int_lit(0, u8t),
                    hi: int_lit(255, u8t),
                    kind: RangeKind::Closed,
                    body: vec![assign(vec![var(s, u8t)], vec![var(v, u8t)])],
                }),
                ret(vec![var(s, u8t)]),
            ],
        );
        lower(&sem);
    }

    #[test]
    fn container_range_forward_and_reverse() {
        // walk :: proc() -> i32 {
        //     a: [4]i32
        //     s := 0
        //     for v, i in a { s += v }
        //     #reverse for v in a { s += v }
        //     return s
        // }
        let mut t = table();
        let i32t = int_ty(&mut t, 32, true);
        let i64t = int_ty(&mut t, 64, true);
        let arr = t.intern(TypeKind::Array { elem: i32t, len: 4 });
        let mut sem = CheckedModule::new(t);
        let r = result(&mut sem, i32t, 0);
        let a = local(&mut sem, "a", arr);
        let s = local(&mut sem, "s", i32t);
        let v1 = local(&mut sem, "v", i32t);
        let i1 = local(&mut sem, "i", i64t);
        let v2 = local(&mut sem, "v2", i32t);
        proc_of(
            &mut sem,
            "walk",
            vec![],
            vec![r],
            vec![
                decl(vec![a], vec![]),
                decl(vec![s], vec![int_lit(0, i32t)]),
                stmt(StmtKind::RangeContainer {
                    label: None,
                    value: Some(v1),
                    index: Some(i1),
                    container: var(a, arr),
                    reverse: false,
                    body: vec![compound(BinOp::Add, var(s, i32t), var(v1, i32t))],
                }),
                stmt(StmtKind::RangeContainer {
                    label: None,
                    value: Some(v2),
                    index: None,
                    container: var(a, arr),
                    reverse: true,
                    body: vec![compound(BinOp::Add, var(s, i32t), var(v2, i32t))],
                }),
                ret(vec![var(s, i32t)]),
            ],
        );
        lower(&sem);
    }

    #[test]
    fn switch_range_tests_before_default() {
        // rank :: proc(v: i32) -> i32 {
        //     switch v {
        //     case 1..=3: return 10
        //     case:       return 20
        //     }
        // }
        let mut t = table();
        let i32t = int_ty(&mut t, 32, true);
        let mut sem = CheckedModule::new(t);
        let v = param(&mut sem, "v", i32t, 0);
        let r = result(&mut sem, i32t, 0);
        proc_of(
            &mut sem,
            "rank",
            vec![v],
            vec![r],
            vec![
                stmt(StmtKind::Switch {
                    label: None,
                    init: None,
                    tag: Some(var(v, i32t)),
                    cases: vec![
                        SwitchCase {
                            values: vec![CaseValue::Range {
                                lo: int_lit(1, i32t),
                                hi: int_lit(3, i32t),
                                kind: RangeKind::Closed,
                            }],
                            body: vec![ret(vec![int_lit(10, i32t)])],
                        },
                        SwitchCase {
                            values: vec![],
                            body: vec![ret(vec![int_lit(20, i32t)])],
                        },
                    ],
                }),
                ret(vec![int_lit(0, i32t)]),
            ],
        );
        lower(&sem);
    }

    #[test]
    fn tagless_switch_is_guard_chain() {
        // order :: proc(a, b: i32) -> i32 {
        //     switch {
        //     case a < b: return -1
        //     case a > b: return 1
        //     case:       return 0
        //     }
        // }
        let mut t = table();
        let i32t = int_ty(&mut t, 32, true);
        let boolt = t.intern(TypeKind::Bool);
        let mut sem = CheckedModule::new(t);
        let a = param(&mut sem, "a", i32t, 0);
        let b = param(&mut sem, "b", i32t, 1);
        let r = result(&mut sem, i32t, 0);
        proc_of(
            &mut sem,
            "order",
            vec![a, b],
            vec![r],
            vec![
                stmt(StmtKind::Switch {
                    label: None,
                    init: None,
                    tag: None,
                    cases: vec![
                        SwitchCase {
                            values: vec![CaseValue::Expr(binary(
                                BinOp::Lt,
                                var(a, i32t),
                                var(b, i32t),
                                boolt,
                            ))],
                            body: vec![ret(vec![int_lit(-1, i32t)])],
                        },
                        SwitchCase {
                            values: vec![CaseValue::Expr(binary(
                                BinOp::Gt,
                                var(a, i32t),
                                var(b, i32t),
                                boolt,
                            ))],
                            body: vec![ret(vec![int_lit(1, i32t)])],
                        },
                        SwitchCase {
                            values: vec![],
                            body: vec![ret(vec![int_lit(0, i32t)])],
                        },
                    ],
                }),
                ret(vec![int_lit(0, i32t)]),
            ],
        );
        lower(&sem);
    }

    #[test]
    fn switch_fallthrough_chains_clauses() {
        // cascade :: proc(v: i32) -> i32 {
        //     x := 0
        //     switch v {
        //     case 1: fallthrough
        //     case 2: x = 2
        //     case:
        //     }
        //     return x
        // }
        let mut t = table();
        let i32t = int_ty(&mut t, 32, true);
        let mut sem = CheckedModule::new(t);
        let v = param(&mut sem, "v", i32t, 0);
        let r = result(&mut sem, i32t, 0);
        let x = local(&mut sem, "x", i32t);
        proc_of(
            &mut sem,
            "cascade",
            vec![v],
            vec![r],
            vec![
                decl(vec![x], vec![int_lit(0, i32t)]),
                stmt(StmtKind::Switch {
                    label: None,
                    init: None,
                    tag: Some(var(v, i32t)),
                    cases: vec![
                        SwitchCase {
                            values: vec![CaseValue::Expr(int_lit(1, i32t))],
                            body: vec![branch(BranchKind::Fallthrough, None)],
                        },
                        SwitchCase {
                            values: vec![CaseValue::Expr(int_lit(2, i32t))],
                            body: vec![assign(vec![var(x, i32t)], vec![int_lit(2, i32t)])],
                        },
                        SwitchCase {
                            values: vec![],
                            body: vec![],
                        },
                    ],
                }),
                ret(vec![var(x, i32t)]),
            ],
        );
        lower(&sem);
    }

    #[test]
    fn dense_constant_switch_builds_jump_table() {
        // bucket :: proc(v: i32) -> i32 {
        //     switch v {
        //     case 3: return 30
        //     case 4: fallthrough
        //     case 6: return 60
        //     case 7: return 70
        //     case:   return -1
        //     }
        // }
        // values 3,4,6,7 table densely; 5 falls to the default slot
        let mut t = table();
        let i32t = int_ty(&mut t, 32, true);
        let mut sem = CheckedModule::new(t);
        let v = param(&mut sem, "v", i32t, 0);
        let r = result(&mut sem, i32t, 0);
        proc_of(
            &mut sem,
            "bucket",
            vec![v],
            vec![r],
            vec![
                stmt(StmtKind::Switch {
                    label: None,
                    init: None,
                    tag: Some(var(v, i32t)),
                    cases: vec![
                        SwitchCase {
                            values: vec![CaseValue::Expr(int_lit(3, i32t))],
                            body: vec![ret(vec![int_lit(30, i32t)])],
                        },
                        SwitchCase {
                            values: vec![CaseValue::Expr(int_lit(4, i32t))],
                            body: vec![branch(BranchKind::Fallthrough, None)],
                        },
                        SwitchCase {
                            values: vec![CaseValue::Expr(int_lit(6, i32t))],
                            body: vec![ret(vec![int_lit(60, i32t)])],
                        },
                        SwitchCase {
                            values: vec![CaseValue::Expr(int_lit(7, i32t))],
                            body: vec![ret(vec![int_lit(70, i32t)])],
                        },
                        SwitchCase {
                            values: vec![],
                            body: vec![ret(vec![int_lit(-1, i32t)])],
                        },
                    ],
                }),
                ret(vec![int_lit(0, i32t)]),
            ],
        );
        lower(&sem);
    }

    #[test]
    fn jump_table_fits_negative_case_values() {
        // sign_step :: proc(v: i8) -> i8 {
        //     switch v {
        //     case -2: return 1
        //     case -1: return 2
        //     case  0: fallthrough
        //     case  1: return 4
        //     }
        //     return 0
        // }
        let mut t = table();
        let i8t = int_ty(&mut t, 8, true);
        let mut sem = CheckedModule::new(t);
        let v = param(&mut sem, "v", i8t, 0);
        let r = result(&mut sem, i8t, 0);
        proc_of(
            &mut sem,
            "sign_step",
            vec![v],
            vec![r],
            vec![
                stmt(StmtKind::Switch {
                    label: None,
                    init: None,
                    tag: Some(var(v, i8t)),
                    cases: vec![
                        SwitchCase {
                            values: vec![CaseValue::Expr(int_lit(-2, i8t))],
                            body: vec![ret(vec![int_lit(1, i8t)])],
                        },
                        SwitchCase {
                            values: vec![CaseValue::Expr(int_lit(-1, i8t))],
                            body: vec![ret(vec![int_lit(2, i8t)])],
                        },
                        SwitchCase {
                            values: vec![CaseValue::Expr(int_lit(0, i8t))],
                            body: vec![branch(BranchKind::Fallthrough, None)],
                        },
                        SwitchCase {
                            values: vec![CaseValue::Expr(int_lit(1, i8t))],
                            body: vec![ret(vec![int_lit(4, i8t)])],
                        },
                    ],
                }),
                ret(vec![int_lit(0, i8t)]),
            ],
        );
        lower(&sem);
    }

    #[test]
    fn branch_targets_resolve_by_depth_and_label() {
        // seek :: proc(n: i64) -> i64 {
        //     outer: for i := 0; i < n; i += 1 {
        //         switch i {
        //         case 5: break        // the switch, not the loop
        //         case:
        //         }
        //         if i == 7 { break outer }
        //     }
        //     return 0
        // }
        let mut t = table();
        let i64t = int_ty(&mut t, 64, true);
        let boolt = t.intern(TypeKind::Bool);
        let mut sem = CheckedModule::new(t);
        let n = param(&mut sem, "n", i64t, 0);
        let r = result(&mut sem, i64t, 0);
        let i = local(&mut sem, "i", i64t);
        proc_of(
            &mut sem,
            "seek",
            vec![n],
            vec![r],
            vec![
                stmt(StmtKind::For {
                    label: Some(Label("outer".to_string())),
                    init: Some(Box::new(decl(vec![i], vec![int_lit(0, i64t)]))),
                    cond: Some(binary(BinOp::Lt, var(i, i64t), var(n, i64t), boolt)),
                    post: Some(Box::new(compound(
                        BinOp::Add,
                        var(i, i64t),
                        int_lit(1, i64t),
                    ))),
                    body: vec![
                        stmt(StmtKind::Switch {
                            label: None,
                            init: None,
                            tag: Some(var(i, i64t)),
                            cases: vec![
                                SwitchCase {
                                    values: vec![CaseValue::Expr(int_lit(5, i64t))],
                                    body: vec![branch(BranchKind::Break, None)],
                                },
                                SwitchCase {
                                    values: vec![],
                                    body: vec![],
                                },
                            ],
                        }),
                        stmt(StmtKind::If {
                            label: None,
                            init: None,
                            cond: binary(BinOp::Eq, var(i, i64t), int_lit(7, i64t), boolt),
                            then_body: vec![branch(BranchKind::Break, Some("outer"))],
                            else_stmt: None,
                        }),
                    ],
                }),
                ret(vec![int_lit(0, i64t)]),
            ],
        );
        lower(&sem);
    }

    #[test]
    fn labeled_block_break() {
        // skip :: proc(p: bool) -> i32 {
        //     x := 0
        //     work: { if p { break work }; x = 1 }
        //     return x
        // }
        let mut t = table();
        let boolt = t.intern(TypeKind::Bool);
        let i32t = int_ty(&mut t, 32, true);
        let mut sem = CheckedModule::new(t);
        let p = param(&mut sem, "p", boolt, 0);
        let r = result(&mut sem, i32t, 0);
        let x = local(&mut sem, "x", i32t);
        proc_of(
            &mut sem,
            "skip",
            vec![p],
            vec![r],
            vec![
                decl(vec![x], vec![int_lit(0, i32t)]),
                stmt(StmtKind::Block {
                    label: Some(Label("work".to_string())),
                    body: vec![
                        stmt(StmtKind::If {
                            label: None,
                            init: None,
                            cond: var(p, boolt),
                            then_body: vec![branch(BranchKind::Break, Some("work"))],
                            else_stmt: None,
                        }),
                        assign(vec![var(x, i32t)], vec![int_lit(1, i32t)]),
                    ],
                }),
                ret(vec![var(x, i32t)]),
            ],
        );
        lower(&sem);
    }

    #[test]
    fn defers_replay_on_every_exit() {
        // wind :: proc(p: bool) -> i32 {
        //     x := 0
        //     defer x = 1
        //     {
        //         defer x = 2
        //         defer x = 3
        //         if p { return x }   // 3, 2, 1 before the return
        //     }
        //     return x                // block close ran 3 then 2
        // }
        let mut t = table();
        let boolt = t.intern(TypeKind::Bool);
        let i32t = int_ty(&mut t, 32, true);
        let mut sem = CheckedModule::new(t);
        let p = param(&mut sem, "p", boolt, 0);
        let r = result(&mut sem, i32t, 0);
        let x = local(&mut sem, "x", i32t);
        let defer_set = |x_id, v| {
            stmt(StmtKind::Defer {
                stmt: Box::new(assign(vec![var(x_id, i32t)], vec![int_lit(v, i32t)])),
            })
        };
        proc_of(
            &mut sem,
            "wind",
            vec![p],
            vec![r],
            vec![
                decl(vec![x], vec![int_lit(0, i32t)]),
                defer_set(x, 1),
                stmt(StmtKind::Block {
                    label: None,
                    body: vec![
                        defer_set(x, 2),
                        defer_set(x, 3),
                        stmt(StmtKind::If {
                            label: None,
                            init: None,
                            cond: var(p, boolt),
                            then_body: vec![ret(vec![var(x, i32t)])],
                            else_stmt: None,
                        }),
                    ],
                }),
                ret(vec![var(x, i32t)]),
            ],
        );
        lower(&sem);
    }

    #[test]
    fn multi_assignment_swaps_aggregates() {
        // trade :: proc() { a: [2]i64; b: [2]i64; a, b = b, a }
        let mut t = table();
        let i64t = int_ty(&mut t, 64, true);
        let arr = t.intern(TypeKind::Array { elem: i64t, len: 2 });
        let mut sem = CheckedModule::new(t);
        let a = local(&mut sem, "a", arr);
        let b = local(&mut sem, "b", arr);
        proc_of(
            &mut sem,
            "trade",
            vec![],
            vec![],
            vec![
                decl(vec![a], vec![]),
                decl(vec![b], vec![]),
                assign(
                    vec![var(a, arr), var(b, arr)],
                    vec![var(b, arr), var(a, arr)],
                ),
                ret(vec![]),
            ],
        );
        lower(&sem);
    }

    // ═══════════════════════════════════════════════════════════
    // Calls
    // ═══════════════════════════════════════════════════════════

    fn func_ptr_ty(t: &mut TypeTable, params: Vec<TypeId>, results: Vec<TypeId>) -> TypeId {
        t.intern(TypeKind::FuncPointer { params, results })
    }

    #[test]
    fn direct_call_and_recursion() {
        // dec :: proc(n: i32) -> i32 { if n <= 0 { return 0 }; return dec(n - 1) }
        let mut t = table();
        let i32t = int_ty(&mut t, 32, true);
        let boolt = t.intern(TypeKind::Bool);
        let fpt = func_ptr_ty(&mut t, vec![i32t], vec![i32t]);
        let mut sem = CheckedModule::new(t);
        let n = param(&mut sem, "n", i32t, 0);
        let r = result(&mut sem, i32t, 0);
        let pid = proc_of(&mut sem, "dec", vec![n], vec![r], vec![]);
        let dec_ent = sem.add_entity(Entity {
            name: "dec".to_string(),
            ty: fpt,
            kind: EntityKind::Proc(pid),
        });
        let callee = expr(ExprKind::Ident(dec_ent), fpt, Mode::Value);
        let next = binary(BinOp::Sub, var(n, i32t), int_lit(1, i32t), i32t);
        sem.procs[pid.0 as usize].body = vec![
            stmt(StmtKind::If {
                label: None,
                init: None,
                cond: binary(BinOp::LtEq, var(n, i32t), int_lit(0, i32t), boolt),
                then_body: vec![ret(vec![int_lit(0, i32t)])],
                else_stmt: None,
            }),
            ret(vec![call_expr(callee, vec![next], i32t)]),
        ];
        lower(&sem);
    }

    #[test]
    fn multi_result_call_flattens() {
        // two :: proc() -> (i32, i64) { return 1, 2 }
        // use :: proc() -> i64 { a, b := two(); return i64(a) + b }
        let mut t = table();
        let i32t = int_ty(&mut t, 32, true);
        let i64t = int_ty(&mut t, 64, true);
        let pair = t.intern(TypeKind::Tuple {
            elems: vec![i32t, i64t],
        });
        let fpt = func_ptr_ty(&mut t, vec![], vec![i32t, i64t]);
        let mut sem = CheckedModule::new(t);
        let r0 = result(&mut sem, i32t, 0);
        let r1 = result(&mut sem, i64t, 1);
        let two = proc_of(
            &mut sem,
            "two",
            vec![],
            vec![r0, r1],
            vec![ret(vec![int_lit(1, i32t), int_lit(2, i64t)])],
        );
        let two_ent = sem.add_entity(Entity {
            name: "two".to_string(),
            ty: fpt,
            kind: EntityKind::Proc(two),
        });
        let ru = result(&mut sem, i64t, 0);
        let a = local(&mut sem, "a", i32t);
        let b = local(&mut sem, "b", i64t);
        let callee = expr(ExprKind::Ident(two_ent), fpt, Mode::Value);
        proc_of(
            &mut sem,
            "use",
            vec![],
            vec![ru],
            vec![
                decl(vec![a, b], vec![call_expr(callee, vec![], pair)]),
                ret(vec![binary(
                    BinOp::Add,
                    convert(var(a, i32t), i64t),
                    var(b, i64t),
                    i64t,
                )]),
            ],
        );
        lower(&sem);
    }

    #[test]
    fn aggregate_result_travels_by_out_pointer() {
        // make :: proc() -> Big { return Big{1, 2, 3, 4} }
        // take :: proc() -> i64 { s := make(); return s.d }
        let mut t = table();
        let i64t = int_ty(&mut t, 64, true);
        let big = t.intern(TypeKind::Struct {
            fields: ["a", "b", "c", "d"]
                .iter()
                .map(|n| Field {
                    name: n.to_string(),
                    ty: i64t,
                })
                .collect(),
            soa: SoaKind::None,
        });
        let fpt = func_ptr_ty(&mut t, vec![], vec![big]);
        let mut sem = CheckedModule::new(t);
        let rm = result(&mut sem, big, 0);
        let mut lit = expr(ExprKind::Lit, big, Mode::Constant);
        lit.value = Some(ConstValue::Aggregate(vec![
            ConstValue::Int(1),
            ConstValue::Int(2),
            ConstValue::Int(3),
            ConstValue::Int(4),
        ]));
        let make = proc_of(&mut sem, "make", vec![], vec![rm], vec![ret(vec![lit])]);
        let make_ent = sem.add_entity(Entity {
            name: "make".to_string(),
            ty: fpt,
            kind: EntityKind::Proc(make),
        });
        let rt = result(&mut sem, i64t, 0);
        let s = local(&mut sem, "s", big);
        let callee = expr(ExprKind::Ident(make_ent), fpt, Mode::Value);
        proc_of(
            &mut sem,
            "take",
            vec![],
            vec![rt],
            vec![
                decl(vec![s], vec![call_expr(callee, vec![], big)]),
                ret(vec![field_sel(var(s, big), 3, i64t)]),
            ],
        );
        lower(&sem);
    }

    #[test]
    fn indirect_call_through_pointer() {
        // apply :: proc(f: proc(i32) -> i32) -> i32 { return f(41) }
        let mut t = table();
        let i32t = int_ty(&mut t, 32, true);
        let fpt = func_ptr_ty(&mut t, vec![i32t], vec![i32t]);
        let mut sem = CheckedModule::new(t);
        let f = param(&mut sem, "f", fpt, 0);
        let r = result(&mut sem, i32t, 0);
        proc_of(
            &mut sem,
            "apply",
            vec![f],
            vec![r],
            vec![ret(vec![call_expr(
                var(f, fpt),
                vec![int_lit(41, i32t)],
                i32t,
            )])],
        );
        lower(&sem);
    }

    #[test]
    fn foreign_procedure_imported_not_defined() {
        // foreign sqrt :: proc(x: f64) -> f64 ---
        // root :: proc(x: f64) -> f64 { return sqrt(x) }
        let mut t = table();
        let f64t = float_ty(&mut t, 64);
        let fpt = func_ptr_ty(&mut t, vec![f64t], vec![f64t]);
        let mut sem = CheckedModule::new(t);
        let xp = param(&mut sem, "x", f64t, 0);
        let rs = result(&mut sem, f64t, 0);
        let sqrt = sem.add_proc(Procedure {
            name: "sqrt_like".to_string(),
            sig: Signature {
                params: vec![xp],
                results: vec![rs],
                named_results: false,
            },
            body: vec![],
            link_name: Some("sqrt".to_string()),
        });
        let sqrt_ent = sem.add_entity(Entity {
            name: "sqrt_like".to_string(),
            ty: fpt,
            kind: EntityKind::Proc(sqrt),
        });
        let x = param(&mut sem, "x", f64t, 0);
        let r = result(&mut sem, f64t, 0);
        let callee = expr(ExprKind::Ident(sqrt_ent), fpt, Mode::Value);
        proc_of(
            &mut sem,
            "root",
            vec![x],
            vec![r],
            vec![ret(vec![call_expr(callee, vec![var(x, f64t)], f64t)])],
        );
        lower(&sem);
    }

    // ═══════════════════════════════════════════════════════════
    // Intrinsics
    // ═══════════════════════════════════════════════════════════

    #[test]
    fn len_over_array_and_slice() {
        // sizes :: proc(s: []i32) -> i64 { a: [7]i32; return len(a) + len(s) }
        let mut t = table();
        let i32t = int_ty(&mut t, 32, true);
        let i64t = int_ty(&mut t, 64, true);
        let arr = t.intern(TypeKind::Array { elem: i32t, len: 7 });
        let sl = t.intern(TypeKind::Slice { elem: i32t });
        let mut sem = CheckedModule::new(t);
        let s = param(&mut sem, "s", sl, 0);
        let r = result(&mut sem, i64t, 0);
        let a = local(&mut sem, "a", arr);
        let len_of = |operand: Expr| {
            expr(
                ExprKind::Intrinsic {
                    op: IntrinsicOp::Len,
                    args: vec![operand],
                },
                i64t,
                Mode::Value,
            )
        };
        proc_of(
            &mut sem,
            "sizes",
            vec![s],
            vec![r],
            vec![
                decl(vec![a], vec![]),
                ret(vec![binary(
                    BinOp::Add,
                    len_of(var(a, arr)),
                    len_of(var(s, sl)),
                    i64t,
                )]),
            ],
        );
        lower(&sem);
    }

    #[test]
    fn bit_count_intrinsics() {
        // pop :: proc(x: u64) -> u64 { return count_ones(x) + leading_zeros(x) }
        let mut t = table();
        let u64t = int_ty(&mut t, 64, false);
        let mut sem = CheckedModule::new(t);
        let x = param(&mut sem, "x", u64t, 0);
        let r = result(&mut sem, u64t, 0);
        let bit = |op, operand: Expr| {
            expr(
                ExprKind::Intrinsic {
                    op,
                    args: vec![operand],
                },
                u64t,
                Mode::Value,
            )
        };
        proc_of(
            &mut sem,
            "pop",
            vec![x],
            vec![r],
            vec![ret(vec![binary(
                BinOp::Add,
                bit(IntrinsicOp::CountOnes, var(x, u64t)),
                bit(IntrinsicOp::LeadingZeros, var(x, u64t)),
                u64t,
            )])],
        );
        lower(&sem);
    }

    #[test]
    fn reverse_bits_always_calls_runtime() {
        // mirror :: proc(x: u64) -> u64 { return reverse_bits(x) }
        // Stays a call even when the checker could fold the operand.
        let mut t = table();
        let u64t = int_ty(&mut t, 64, false);
        let mut sem = CheckedModule::new(t);
        let x = param(&mut sem, "x", u64t, 0);
        let r = result(&mut sem, u64t, 0);
        let rev = expr(
            ExprKind::Intrinsic {
                op: IntrinsicOp::ReverseBits,
                args: vec![var(x, u64t)],
            },
            u64t,
            Mode::Value,
        );
        proc_of(&mut sem, "mirror", vec![x], vec![r], vec![ret(vec![rev])]);
        lower(&sem);
    }

    // ═══════════════════════════════════════════════════════════
    // Equality
    // ═══════════════════════════════════════════════════════════

    #[test]
    fn padded_struct_equality_generates_routine() {
        // same :: proc(a, b: Pair) -> bool { return a == b }
        // Pair has interior padding, so bytewise compare is out.
        let mut t = table();
        let i8t = int_ty(&mut t, 8, true);
        let i64t = int_ty(&mut t, 64, true);
        let boolt = t.intern(TypeKind::Bool);
        let pair = t.intern(TypeKind::Struct {
            fields: vec![
                Field {
                    name: "tag".to_string(),
                    ty: i8t,
                },
                Field {
                    name: "val".to_string(),
                    ty: i64t,
                },
            ],
            soa: SoaKind::None,
        });
        let mut sem = CheckedModule::new(t);
        let a = param(&mut sem, "a", pair, 0);
        let b = param(&mut sem, "b", pair, 1);
        let r = result(&mut sem, boolt, 0);
        proc_of(
            &mut sem,
            "same",
            vec![a, b],
            vec![r],
            vec![ret(vec![binary(BinOp::Eq, var(a, pair), var(b, pair), boolt)])],
        );
        lower(&sem);
    }

    #[test]
    fn string_equality_calls_runtime() {
        // eq :: proc(a, b: string) -> bool { return a == b }
        let mut t = table();
        let strt = t.intern(TypeKind::String);
        let boolt = t.intern(TypeKind::Bool);
        let mut sem = CheckedModule::new(t);
        let a = param(&mut sem, "a", strt, 0);
        let b = param(&mut sem, "b", strt, 1);
        let r = result(&mut sem, boolt, 0);
        proc_of(
            &mut sem,
            "eq",
            vec![a, b],
            vec![r],
            vec![ret(vec![binary(BinOp::Eq, var(a, strt), var(b, strt), boolt)])],
        );
        lower(&sem);
    }

    // ═══════════════════════════════════════════════════════════
    // Object emission
    // ═══════════════════════════════════════════════════════════

    #[test]
    fn emit_object_writes_bytes() {
        // Full pipeline: lower a module and write the .o file.
        let mut t = table();
        let i32t = int_ty(&mut t, 32, true);
        let mut sem = CheckedModule::new(t);
        let r = result(&mut sem, i32t, 0);
        proc_of(
            &mut sem,
            "answer",
            vec![],
            vec![r],
            vec![ret(vec![int_lit(42, i32t)])],
        );
        let gen = lower(&sem);

        let path = "/tmp/keel_test_codegen.o";
        gen.emit_object(path).unwrap();
        let metadata = std::fs::metadata(path).unwrap();
        assert!(metadata.len() > 0);
        std::fs::remove_file(path).unwrap();
    }

    // ═══════════════════════════════════════════════════════════
    // Contract violations
    // ═══════════════════════════════════════════════════════════

    #[test]
    fn constant_without_value_is_internal_error() {
        // A Constant-mode expression must carry its folded value.
        let mut t = table();
        let i32t = int_ty(&mut t, 32, true);
        let mut sem = CheckedModule::new(t);
        let r = result(&mut sem, i32t, 0);
        let hollow = expr(ExprKind::Lit, i32t, Mode::Constant);
        proc_of(&mut sem, "bad", vec![], vec![r], vec![ret(vec![hollow])]);

        let mut gen = ModuleLowering::new(BuildMode::Debug).unwrap();
        let err = gen.lower_module(&sem).unwrap_err();
        assert!(matches!(err, CodegenError::Internal(_)));
    }

    #[test]
    fn compound_assign_rejects_multiple_targets() {
        let mut t = table();
        let i32t = int_ty(&mut t, 32, true);
        let mut sem = CheckedModule::new(t);
        let a = local(&mut sem, "a", i32t);
        let b = local(&mut sem, "b", i32t);
        proc_of(
            &mut sem,
            "bad",
            vec![],
            vec![],
            vec![
                decl(vec![a], vec![int_lit(1, i32t)]),
                decl(vec![b], vec![int_lit(2, i32t)]),
                stmt(StmtKind::Assign {
                    op: AssignOp::Compound(BinOp::Add),
                    lhs: vec![var(a, i32t), var(b, i32t)],
                    rhs: vec![int_lit(1, i32t), int_lit(2, i32t)],
                }),
            ],
        );

        let mut gen = ModuleLowering::new(BuildMode::Debug).unwrap();
        let err = gen.lower_module(&sem).unwrap_err();
        assert!(matches!(err, CodegenError::Internal(_)));
    }
}
