// SPDX-License-Identifier: (MIT OR Apache-2.0)

//! Memory access layer: loads, stores, locals and address projection.
//!
//! Every addressing mode of [`Addr`] gets its load/store protocol here.
//! Scalars travel in registers; aggregates travel as addresses and are
//! copied at store time. Bounds and slice-range checks are emitted at
//! address-formation time, gated by the statement's resolved flags.

use cranelift::codegen::ir::{FuncRef, InstructionData, Opcode, ValueDef};
use cranelift::prelude::*;

use keel_sem::{EntityKind, SelStep, Selection, SoaKind, TypeId, TypeKind};

use crate::proc::ProcLowering;
use crate::value::{addressed_ty, register_ty, Addr, Repr, Value as KValue};
use crate::{internal_error, CodegenResult};

impl<'a> ProcLowering<'a> {
    // ─── Loads and stores ───────────────────────────────────────

    /// Typed load through a raw pointer. Register-class types load into
    /// a register; aggregates yield the address itself, copies happen
    /// when the value is stored somewhere.
    pub(crate) fn emit_load(&mut self, ptr: Value, ty: TypeId) -> CodegenResult<KValue> {
        let sem = self.sem;
        match register_ty(&sem.types, self.target.ptr_ty, ty) {
            Some(cl) => {
                let v = self.b.ins().load(cl, MemFlags::new(), ptr, 0);
                Ok(KValue::register(v, ty))
            }
            None => Ok(KValue::address(ptr, ty)),
        }
    }

    /// Typed store through a raw pointer. The value's type decides the
    /// width; aggregate sources are block copies.
    pub(crate) fn emit_store(&mut self, ptr: Value, value: KValue) -> CodegenResult<()> {
        let size = self.sem.types.size_of(value.ty);
        let value = self.resolve(value)?;
        match value.repr {
            Repr::Register(v) => {
                self.b.ins().store(MemFlags::new(), v, ptr, 0);
                Ok(())
            }
            Repr::Address(src) => {
                self.copy_bytes(ptr, src, size);
                Ok(())
            }
            Repr::Symbol(_) | Repr::Multi(_) => {
                internal_error("store source must be resolved and single-valued")
            }
        }
    }

    /// Chunked block copy, widest chunks first.
    pub(crate) fn copy_bytes(&mut self, dst: Value, src: Value, size: u64) {
        if dst == src || size == 0 {
            return;
        }
        let size = size as i64;
        let mut offset = 0i64;
        while offset + 8 <= size {
            let w = self.b.ins().load(types::I64, MemFlags::new(), src, offset as i32);
            self.b.ins().store(MemFlags::new(), w, dst, offset as i32);
            offset += 8;
        }
        if size - offset >= 4 {
            let w = self.b.ins().load(types::I32, MemFlags::new(), src, offset as i32);
            self.b.ins().store(MemFlags::new(), w, dst, offset as i32);
            offset += 4;
        }
        if size - offset >= 2 {
            let w = self.b.ins().load(types::I16, MemFlags::new(), src, offset as i32);
            self.b.ins().store(MemFlags::new(), w, dst, offset as i32);
            offset += 2;
        }
        if size - offset >= 1 {
            let w = self.b.ins().load(types::I8, MemFlags::new(), src, offset as i32);
            self.b.ins().store(MemFlags::new(), w, dst, offset as i32);
        }
    }

    pub(crate) fn zero_bytes(&mut self, ptr: Value, size: u64) {
        if size == 0 {
            return;
        }
        let size = size as i64;
        let mut offset = 0i64;
        if size >= 8 {
            let z = self.b.ins().iconst(types::I64, 0);
            while offset + 8 <= size {
                self.b.ins().store(MemFlags::new(), z, ptr, offset as i32);
                offset += 8;
            }
        }
        if size - offset >= 4 {
            let z = self.b.ins().iconst(types::I32, 0);
            self.b.ins().store(MemFlags::new(), z, ptr, offset as i32);
            offset += 4;
        }
        if size - offset >= 2 {
            let z = self.b.ins().iconst(types::I16, 0);
            self.b.ins().store(MemFlags::new(), z, ptr, offset as i32);
            offset += 2;
        }
        if size - offset >= 1 {
            let z = self.b.ins().iconst(types::I8, 0);
            self.b.ins().store(MemFlags::new(), z, ptr, offset as i32);
        }
    }

    // ─── Symbols and locals ─────────────────────────────────────

    /// Second state of the symbol protocol: materialize a module symbol
    /// into the data flow. Procedures become code addresses, data
    /// symbols become addresses of their storage. Everything already
    /// materialized passes through.
    pub(crate) fn resolve(&mut self, value: KValue) -> CodegenResult<KValue> {
        let sem = self.sem;
        let eid = match value.repr {
            Repr::Symbol(e) => e,
            _ => return Ok(value),
        };
        let ent = sem.entity(eid);
        match &ent.kind {
            EntityKind::Proc(pid) => {
                let fref = match self.refs.funcs.get(pid) {
                    Some(&f) => f,
                    None => return internal_error(format!("procedure {:?} not imported", pid)),
                };
                let p = self.b.ins().func_addr(self.target.ptr_ty, fref);
                Ok(KValue::register(p, value.ty))
            }
            _ => {
                let gv = match self.refs.data.get(&eid) {
                    Some(&g) => g,
                    None => return internal_error(format!("data symbol {:?} not imported", eid)),
                };
                let p = self.b.ins().global_value(self.target.ptr_ty, gv);
                Ok(KValue::address(p, value.ty))
            }
        }
    }

    /// Resolve an address base and take its raw pointer edge.
    pub(crate) fn addr_base_ptr(&mut self, base: &KValue) -> CodegenResult<Value> {
        let v = self.resolve(base.clone())?;
        v.ir_node()
    }

    pub(crate) fn alloc_slot_ptr(&mut self, size: u64, align: u64) -> Value {
        let ss = self.b.create_sized_stack_slot(StackSlotData::new(
            StackSlotKind::ExplicitSlot,
            size as u32,
            align.trailing_zeros() as u8,
        ));
        self.b.ins().stack_addr(self.target.ptr_ty, ss, 0)
    }

    /// Fresh stack storage for one value of `ty`.
    pub(crate) fn alloc_local(&mut self, ty: TypeId, zeroed: bool) -> CodegenResult<Addr> {
        let size = self.sem.types.size_of(ty);
        let align = self.sem.types.align_of(ty);
        let ptr = self.alloc_slot_ptr(size, align.max(1));
        if zeroed {
            self.zero_bytes(ptr, size);
        }
        Ok(Addr::plain(KValue::address(ptr, ty)))
    }

    /// An address holding the value, spilling registers to a fresh slot.
    /// This is how by-address arguments and runtime-call operands are
    /// formed from rvalues.
    pub(crate) fn spill_to_ptr(&mut self, value: &KValue) -> CodegenResult<Value> {
        let value = self.resolve(value.clone())?;
        match value.repr {
            Repr::Address(p) => Ok(p),
            Repr::Register(v) => {
                let size = self.sem.types.size_of(value.ty);
                let align = self.sem.types.align_of(value.ty);
                let ptr = self.alloc_slot_ptr(size.max(1), align.max(1));
                self.b.ins().store(MemFlags::new(), v, ptr, 0);
                Ok(ptr)
            }
            Repr::Symbol(_) | Repr::Multi(_) => internal_error("value has no spillable form"),
        }
    }

    /// Normalize an index value to pointer width, honoring the source
    /// signedness so negative indices stay negative (and then trip the
    /// unsigned bounds compare).
    pub(crate) fn index_word(&mut self, index: &KValue) -> CodegenResult<Value> {
        let sem = self.sem;
        let reg = index.as_register()?;
        let have = self.b.func.dfg.value_type(reg);
        let want = self.target.ptr_ty;
        if have == want {
            Ok(reg)
        } else if have.bits() > want.bits() {
            Ok(self.b.ins().ireduce(want, reg))
        } else if sem.types.is_unsigned(index.ty) {
            Ok(self.b.ins().uextend(want, reg))
        } else {
            Ok(self.b.ins().sextend(want, reg))
        }
    }

    /// Widen/narrow a raw integer edge to an exact IR type.
    pub(crate) fn cast_int_edge(&mut self, v: Value, want: Type, signed: bool) -> Value {
        let have = self.b.func.dfg.value_type(v);
        if have == want {
            v
        } else if have.bits() > want.bits() {
            self.b.ins().ireduce(want, v)
        } else if signed {
            self.b.ins().sextend(want, v)
        } else {
            self.b.ins().uextend(want, v)
        }
    }

    // ─── Addressing-mode protocols ──────────────────────────────

    pub(crate) fn addr_load(&mut self, addr: &Addr) -> CodegenResult<KValue> {
        match addr {
            Addr::Default { base } => {
                let ty = addr.addressable_ty(&self.sem.types)?;
                // relative storage is never read raw; its register form
                // is the resolved pointer
                if let TypeKind::RelativePointer { .. } =
                    self.sem.types.kind(self.sem.types.core(ty))
                {
                    let rel = Addr::RelativePointer {
                        base: base.clone(),
                        deref: false,
                    };
                    return self.addr_load(&rel);
                }
                let ptr = self.addr_base_ptr(base)?;
                self.emit_load(ptr, ty)
            }
            Addr::RelativeSlice { base } => {
                let ty = addr.addressable_ty(&self.sem.types)?;
                let ptr = self.addr_base_ptr(base)?;
                self.emit_load(ptr, ty)
            }
            Addr::Map {
                base,
                key,
                value_ty,
            } => {
                let value_ty = *value_ty;
                let map_ptr = self.addr_base_ptr(base)?;
                let key_ptr = self.spill_to_ptr(key)?;
                // zeroed so a missing key reads as the zero value
                let out = self.alloc_local(value_ty, true)?;
                let out_ptr = self.addr_get_ptr(&out)?;
                let fref = self.runtime_ref("keel_map_get")?;
                self.b.ins().call(fref, &[map_ptr, key_ptr, out_ptr]);
                self.emit_load(out_ptr, value_ty)
            }
            Addr::Context {
                base,
                sel,
                field_ty,
            } => {
                let field_ty = *field_ty;
                let sel = sel.clone();
                let fptr = self.context_field_ptr(base, &sel, field_ty)?;
                self.emit_load(fptr, field_ty)
            }
            Addr::Soa {
                base,
                index,
                elem_ty,
            } => {
                let base = base.clone();
                let index = (**index).clone();
                let elem_ty = *elem_ty;
                self.soa_gather(&base, &index, elem_ty)
            }
            Addr::RelativePointer { base, deref } => {
                let deref = *deref;
                let sem = self.sem;
                let rel_ty = addressed_ty(&sem.types, base)?;
                let storage = self.addr_base_ptr(base)?;
                let abs = self.relative_resolve(storage, rel_ty)?;
                if deref {
                    let pointee = match sem.types.pointer_elem(rel_ty) {
                        Some(p) => p,
                        None => return internal_error("relative pointer has no pointee"),
                    };
                    self.emit_load(abs, pointee)
                } else {
                    Ok(KValue::register(abs, rel_ty))
                }
            }
            Addr::Swizzle {
                base,
                result_ty,
                count,
                indices,
            } => {
                let lanes: Vec<u16> = indices[..*count as usize]
                    .iter()
                    .map(|&i| u16::from(i))
                    .collect();
                let base = base.clone();
                let result_ty = *result_ty;
                self.swizzle_load(&base, result_ty, &lanes)
            }
            Addr::SwizzleLarge {
                base,
                result_ty,
                indices,
            } => {
                let lanes = indices.clone();
                let base = base.clone();
                let result_ty = *result_ty;
                self.swizzle_load(&base, result_ty, &lanes)
            }
        }
    }

    pub(crate) fn addr_store(&mut self, addr: &Addr, value: KValue) -> CodegenResult<()> {
        match addr {
            Addr::Default { base } => {
                let ty = addr.addressable_ty(&self.sem.types)?;
                // stores into relative storage re-encode against the
                // destination slot, whatever path produced the address
                if let TypeKind::RelativePointer { .. } =
                    self.sem.types.kind(self.sem.types.core(ty))
                {
                    let rel = Addr::RelativePointer {
                        base: base.clone(),
                        deref: false,
                    };
                    return self.addr_store(&rel, value);
                }
                let ptr = self.addr_base_ptr(base)?;
                self.emit_store(ptr, value)
            }
            Addr::RelativeSlice { base } => {
                let ptr = self.addr_base_ptr(base)?;
                self.emit_store(ptr, value)
            }
            Addr::Map { base, key, .. } => {
                let map_ptr = self.addr_base_ptr(base)?;
                let key = (**key).clone();
                let key_ptr = self.spill_to_ptr(&key)?;
                let val_ptr = self.spill_to_ptr(&value)?;
                let fref = self.runtime_ref("keel_map_set")?;
                self.b.ins().call(fref, &[map_ptr, key_ptr, val_ptr]);
                Ok(())
            }
            Addr::Context {
                base,
                sel,
                field_ty,
            } => {
                let field_ty = *field_ty;
                let sel = sel.clone();
                let fptr = self.context_field_ptr(base, &sel, field_ty)?;
                self.emit_store(fptr, value)
            }
            Addr::Soa {
                base,
                index,
                elem_ty,
            } => {
                let base = base.clone();
                let index = (**index).clone();
                let elem_ty = *elem_ty;
                self.soa_scatter(&base, &index, elem_ty, value)
            }
            Addr::RelativePointer { base, deref } => {
                let deref = *deref;
                let rel_ty = addressed_ty(&self.sem.types, base)?;
                let storage = self.addr_base_ptr(base)?;
                if deref {
                    let abs = self.relative_resolve(storage, rel_ty)?;
                    self.emit_store(abs, value)
                } else {
                    self.relative_assign(storage, rel_ty, value)
                }
            }
            Addr::Swizzle {
                base,
                count,
                indices,
                ..
            } => {
                let lanes: Vec<u16> = indices[..*count as usize]
                    .iter()
                    .map(|&i| u16::from(i))
                    .collect();
                let base = base.clone();
                self.swizzle_store(&base, &lanes, value)
            }
            Addr::SwizzleLarge { base, indices, .. } => {
                let lanes = indices.clone();
                let base = base.clone();
                self.swizzle_store(&base, &lanes, value)
            }
        }
    }

    /// Materialize the location as a raw pointer. Only modes with a
    /// single home in memory have one; the scattered and computed modes
    /// are not addressable.
    pub(crate) fn addr_get_ptr(&mut self, addr: &Addr) -> CodegenResult<Value> {
        match addr {
            Addr::Default { base } | Addr::RelativeSlice { base } => self.addr_base_ptr(base),
            Addr::Context {
                base,
                sel,
                field_ty,
            } => {
                let field_ty = *field_ty;
                let sel = sel.clone();
                let base = base.clone();
                self.context_field_ptr(&base, &sel, field_ty)
            }
            Addr::RelativePointer { base, deref } => {
                if *deref {
                    let rel_ty = addressed_ty(&self.sem.types, base)?;
                    let storage = self.addr_base_ptr(base)?;
                    self.relative_resolve(storage, rel_ty)
                } else {
                    self.addr_base_ptr(base)
                }
            }
            Addr::Map { .. } => internal_error("map elements are not addressable"),
            Addr::Soa { .. } => internal_error("soa elements are not addressable"),
            Addr::Swizzle { .. } | Addr::SwizzleLarge { .. } => {
                internal_error("swizzled storage is not addressable")
            }
        }
    }

    /// Two-result map lookup: the value and the found flag.
    pub(crate) fn map_load_ok(&mut self, addr: &Addr, ok_ty: TypeId) -> CodegenResult<KValue> {
        let (base, key, value_ty) = match addr {
            Addr::Map {
                base,
                key,
                value_ty,
            } => (base.clone(), (**key).clone(), *value_ty),
            _ => return internal_error("two-result lookup over a non-map address"),
        };
        let map_ptr = self.addr_base_ptr(&base)?;
        let key_ptr = self.spill_to_ptr(&key)?;
        let out = self.alloc_local(value_ty, true)?;
        let out_ptr = self.addr_get_ptr(&out)?;
        let fref = self.runtime_ref("keel_map_get")?;
        let call = self.b.ins().call(fref, &[map_ptr, key_ptr, out_ptr]);
        let found = self.b.inst_results(call)[0];
        let value = self.emit_load(out_ptr, value_ty)?;
        let ty = value.ty;
        Ok(KValue::multi(
            vec![value, KValue::register(found, ok_ty)],
            ty,
        ))
    }

    // ─── Projections ────────────────────────────────────────────

    /// Walk a selector path from an addressed base, dereferencing
    /// pointer hops implicitly. `final_ty` is the checked type of the
    /// full selection and takes over on the last step, which lets
    /// component projections (complex parts, header words) type
    /// themselves without fresh type table entries.
    pub(crate) fn sel_addr(
        &mut self,
        base: Addr,
        sel: &Selection,
        final_ty: TypeId,
    ) -> CodegenResult<Addr> {
        let sem = self.sem;
        let mut cur = base;
        let mut cur_ty = cur.addressable_ty(&sem.types)?;
        for (k, step) in sel.steps.iter().enumerate() {
            let last = k + 1 == sel.steps.len();
            loop {
                match sem.types.kind(sem.types.core(cur_ty)) {
                    TypeKind::Pointer { elem } => {
                        let elem = *elem;
                        let pv = self.addr_load(&cur)?;
                        cur = Addr::plain(pv);
                        cur_ty = elem;
                    }
                    _ => break,
                }
            }
            let index = match *step {
                SelStep::Field(i) => i,
                SelStep::UnionTag => {
                    return internal_error("union tag selection is not addressable")
                }
            };
            let core = sem.types.core(cur_ty);
            let (offset, mid_ty) = match sem.types.kind(core) {
                TypeKind::Struct { fields, soa } if *soa == SoaKind::None => {
                    let fty = fields.get(index).map(|f| f.ty);
                    (sem.types.field_offset(core, index)?, fty)
                }
                // soa columns select their backing storage; the checked
                // type of the selection describes it
                TypeKind::Struct { .. } => (sem.types.field_offset(core, index)?, None),
                TypeKind::Tuple { elems } => {
                    let ety = elems.get(index).copied();
                    (sem.types.field_offset(core, index)?, ety)
                }
                TypeKind::Union { variants, .. } => {
                    (0, variants.get(index).copied())
                }
                TypeKind::Complex { .. }
                | TypeKind::Quaternion { .. }
                | TypeKind::String
                | TypeKind::Slice { .. }
                | TypeKind::DynamicArray { .. }
                | TypeKind::Any => (sem.types.field_offset(core, index)?, None),
                _ => {
                    return internal_error(format!(
                        "selection step over unsupported type {:?}",
                        sem.types.kind(core)
                    ))
                }
            };
            let next_ty = if last {
                final_ty
            } else {
                match mid_ty {
                    Some(t) => t,
                    None => {
                        return internal_error(
                            "component projection must be the final selection step",
                        )
                    }
                }
            };
            let ptr = self.addr_get_ptr(&cur)?;
            let fptr = if offset == 0 {
                ptr
            } else {
                self.b.ins().iadd_imm(ptr, offset as i64)
            };
            cur = Addr::plain(KValue::address(fptr, next_ty));
            cur_ty = next_ty;
        }
        Ok(cur)
    }

    /// Element address over any indexable container. `cont_ty` is the
    /// checked type of the base expression, `elem_ty` the checked type
    /// of the element; both come from the front end so this layer never
    /// invents type identities.
    pub(crate) fn element_addr(
        &mut self,
        base: Addr,
        cont_ty: TypeId,
        index: KValue,
        elem_ty: TypeId,
    ) -> CodegenResult<Addr> {
        let sem = self.sem;
        let core = sem.types.core(cont_ty);
        let esize = sem.types.size_of(elem_ty);
        match sem.types.kind(core) {
            TypeKind::Pointer { elem } => {
                // indexing auto-derefs one pointer hop
                let elem = *elem;
                let pv = self.addr_load(&base)?;
                self.element_addr(Addr::plain(pv), elem, index, elem_ty)
            }
            TypeKind::Array { .. } | TypeKind::Simd { .. } => {
                let len = match sem.types.array_len(core) {
                    Some(n) => n,
                    None => return internal_error("array-like type without a length"),
                };
                let ptr = self.addr_get_ptr(&base)?;
                let idx = self.index_word(&index)?;
                let len_v = self.iconst_word(len as i64);
                self.bounds_check(idx, len_v)?;
                let off = self.b.ins().imul_imm(idx, esize as i64);
                let eptr = self.b.ins().iadd(ptr, off);
                Ok(Addr::plain(KValue::address(eptr, elem_ty)))
            }
            TypeKind::String | TypeKind::Slice { .. } | TypeKind::DynamicArray { .. } => {
                let word = self.target.ptr_ty;
                let ptr = self.addr_get_ptr(&base)?;
                let data = self.b.ins().load(word, MemFlags::new(), ptr, 0);
                let len = self
                    .b
                    .ins()
                    .load(word, MemFlags::new(), ptr, self.target.ptr_bytes as i32);
                let idx = self.index_word(&index)?;
                self.bounds_check(idx, len)?;
                let off = self.b.ins().imul_imm(idx, esize as i64);
                let eptr = self.b.ins().iadd(data, off);
                Ok(Addr::plain(KValue::address(eptr, elem_ty)))
            }
            TypeKind::MultiPointer { .. } => {
                // no length to check against
                let data = match base.base().repr {
                    Repr::Register(v) => v,
                    _ => {
                        let ptr = self.addr_get_ptr(&base)?;
                        self.b
                            .ins()
                            .load(self.target.ptr_ty, MemFlags::new(), ptr, 0)
                    }
                };
                let idx = self.index_word(&index)?;
                let off = self.b.ins().imul_imm(idx, esize as i64);
                let eptr = self.b.ins().iadd(data, off);
                Ok(Addr::plain(KValue::address(eptr, elem_ty)))
            }
            TypeKind::Map { .. } => {
                let ptr = self.addr_get_ptr(&base)?;
                Ok(Addr::Map {
                    base: KValue::address(ptr, cont_ty),
                    key: Box::new(index),
                    value_ty: elem_ty,
                })
            }
            TypeKind::Struct { fields, soa } if *soa != SoaKind::None => {
                let nf = fields.len();
                let soa_kind = *soa;
                let ptr = self.addr_get_ptr(&base)?;
                let idx = self.index_word(&index)?;
                let len = match soa_kind {
                    SoaKind::Fixed(n) => self.iconst_word(n as i64),
                    SoaKind::Slice | SoaKind::Dynamic => {
                        // length word sits after the column pointers
                        let off = sem.types.field_offset(core, nf)?;
                        self.b
                            .ins()
                            .load(self.target.ptr_ty, MemFlags::new(), ptr, off as i32)
                    }
                    SoaKind::None => return internal_error("soa kind vanished mid-dispatch"),
                };
                self.bounds_check(idx, len)?;
                Ok(Addr::Soa {
                    base: KValue::address(ptr, cont_ty),
                    index: Box::new(index),
                    elem_ty,
                })
            }
            TypeKind::RelativeSlice { .. } => {
                let storage = self.addr_get_ptr(&base)?;
                let (data, len) = self.relative_slice_parts(storage, cont_ty)?;
                let idx = self.index_word(&index)?;
                self.bounds_check(idx, len)?;
                let off = self.b.ins().imul_imm(idx, esize as i64);
                let eptr = self.b.ins().iadd(data, off);
                Ok(Addr::plain(KValue::address(eptr, elem_ty)))
            }
            other => internal_error(format!("indexing over non-container type {:?}", other)),
        }
    }

    /// Container length at pointer width.
    pub(crate) fn len_value(&mut self, base: &Addr, cont_ty: TypeId) -> CodegenResult<Value> {
        let sem = self.sem;
        let core = sem.types.core(cont_ty);
        match sem.types.kind(core) {
            TypeKind::Pointer { elem } => {
                let elem = *elem;
                let pv = self.addr_load(base)?;
                self.len_value(&Addr::plain(pv), elem)
            }
            TypeKind::Array { len, .. } => {
                let len = *len;
                Ok(self.iconst_word(len as i64))
            }
            TypeKind::Simd { lanes, .. } => {
                let lanes = *lanes;
                Ok(self.iconst_word(i64::from(lanes)))
            }
            TypeKind::String
            | TypeKind::Slice { .. }
            | TypeKind::DynamicArray { .. }
            | TypeKind::Map { .. } => {
                // length word sits one word in for all header forms
                let ptr = self.addr_get_ptr(base)?;
                Ok(self
                    .b
                    .ins()
                    .load(self.target.ptr_ty, MemFlags::new(), ptr, self.target.ptr_bytes as i32))
            }
            TypeKind::Struct { fields, soa } if *soa != SoaKind::None => {
                let nf = fields.len();
                match *soa {
                    SoaKind::Fixed(n) => Ok(self.iconst_word(n as i64)),
                    _ => {
                        let off = sem.types.field_offset(core, nf)?;
                        let ptr = self.addr_get_ptr(base)?;
                        Ok(self
                            .b
                            .ins()
                            .load(self.target.ptr_ty, MemFlags::new(), ptr, off as i32))
                    }
                }
            }
            TypeKind::RelativeSlice { .. } => {
                let storage = self.addr_get_ptr(base)?;
                let (_, len) = self.relative_slice_parts(storage, cont_ty)?;
                Ok(len)
            }
            other => internal_error(format!("length of non-container type {:?}", other)),
        }
    }

    // ─── Union tags ─────────────────────────────────────────────

    /// Tag class by variant count; mirrors the layout rule.
    pub(crate) fn union_tag_class(&self, union_ty: TypeId) -> CodegenResult<Type> {
        match self.sem.types.kind(self.sem.types.core(union_ty)) {
            TypeKind::Union { variants, .. } => {
                if variants.len() >= 256 {
                    Ok(types::I16)
                } else {
                    Ok(types::I8)
                }
            }
            _ => internal_error("tag class of a non-union type"),
        }
    }

    /// Current tag of a union at `ptr`. Maybe-pointer unions synthesize
    /// 0/1 from the null pattern.
    pub(crate) fn union_tag_value(&mut self, ptr: Value, union_ty: TypeId) -> CodegenResult<Value> {
        let sem = self.sem;
        let core = sem.types.core(union_ty);
        match sem.types.layout(core).tag_offset {
            Some(off) => {
                let cl = self.union_tag_class(union_ty)?;
                Ok(self.b.ins().load(cl, MemFlags::new(), ptr, off as i32))
            }
            None => {
                let w = self
                    .b
                    .ins()
                    .load(self.target.ptr_ty, MemFlags::new(), ptr, 0);
                Ok(self.b.ins().icmp_imm(IntCC::NotEqual, w, 0))
            }
        }
    }

    pub(crate) fn union_tag_store(
        &mut self,
        ptr: Value,
        union_ty: TypeId,
        tag: u64,
    ) -> CodegenResult<()> {
        let sem = self.sem;
        let core = sem.types.core(union_ty);
        let off = match sem.types.layout(core).tag_offset {
            Some(off) => off,
            // maybe-pointer unions carry no tag; the payload is the state
            None => return Ok(()),
        };
        let cl = self.union_tag_class(union_ty)?;
        let t = self.b.ins().iconst(cl, tag as i64);
        self.b.ins().store(MemFlags::new(), t, ptr, off as i32);
        Ok(())
    }

    // ─── Relative pointers and slices ───────────────────────────

    /// Absolute pointer from self-relative storage; offset 0 resolves
    /// to nil rather than to the storage's own address.
    pub(crate) fn relative_resolve(&mut self, storage: Value, rel_ty: TypeId) -> CodegenResult<Value> {
        let sem = self.sem;
        let base_ty = match sem.types.kind(sem.types.core(rel_ty)) {
            TypeKind::RelativePointer { base, .. } => *base,
            _ => return internal_error("relative resolve over a non-relative type"),
        };
        let cl = match register_ty(&sem.types, self.target.ptr_ty, base_ty) {
            Some(c) => c,
            None => return internal_error("relative base is not a register class"),
        };
        let off = self.b.ins().load(cl, MemFlags::new(), storage, 0);
        let is_nil = self.b.ins().icmp_imm(IntCC::Equal, off, 0);
        let signed = !sem.types.is_unsigned(base_ty);
        let wide = self.cast_int_edge(off, self.target.ptr_ty, signed);
        let raw = self.b.ins().iadd(storage, wide);
        let zero = self.iconst_word(0);
        Ok(self.b.ins().select(is_nil, zero, raw))
    }

    /// Store an absolute pointer into relative storage as an offset
    /// from the storage's own address; nil stores as offset 0.
    pub(crate) fn relative_assign(
        &mut self,
        storage: Value,
        rel_ty: TypeId,
        value: KValue,
    ) -> CodegenResult<()> {
        let sem = self.sem;
        let base_ty = match sem.types.kind(sem.types.core(rel_ty)) {
            TypeKind::RelativePointer { base, .. } => *base,
            _ => return internal_error("relative assign over a non-relative type"),
        };
        let cl = match register_ty(&sem.types, self.target.ptr_ty, base_ty) {
            Some(c) => c,
            None => return internal_error("relative base is not a register class"),
        };
        let abs = value.as_register()?;
        let diff = self.b.ins().isub(abs, storage);
        let is_nil = self.b.ins().icmp_imm(IntCC::Equal, abs, 0);
        let zero = self.iconst_word(0);
        let off_w = self.b.ins().select(is_nil, zero, diff);
        let off = self.cast_int_edge(off_w, cl, true);
        self.b.ins().store(MemFlags::new(), off, storage, 0);
        Ok(())
    }

    /// Resolved data pointer and word-width length of a relative slice.
    pub(crate) fn relative_slice_parts(
        &mut self,
        storage: Value,
        rel_ty: TypeId,
    ) -> CodegenResult<(Value, Value)> {
        let sem = self.sem;
        let base_ty = match sem.types.kind(sem.types.core(rel_ty)) {
            TypeKind::RelativeSlice { base, .. } => *base,
            _ => return internal_error("relative slice parts over a non-relative type"),
        };
        let cl = match register_ty(&sem.types, self.target.ptr_ty, base_ty) {
            Some(c) => c,
            None => return internal_error("relative base is not a register class"),
        };
        let bsize = sem.types.size_of(base_ty);
        let off = self.b.ins().load(cl, MemFlags::new(), storage, 0);
        let is_nil = self.b.ins().icmp_imm(IntCC::Equal, off, 0);
        let signed = !sem.types.is_unsigned(base_ty);
        let wide = self.cast_int_edge(off, self.target.ptr_ty, signed);
        let raw = self.b.ins().iadd(storage, wide);
        let zero = self.iconst_word(0);
        let data = self.b.ins().select(is_nil, zero, raw);
        let raw_len = self.b.ins().load(cl, MemFlags::new(), storage, bsize as i32);
        let len = self.cast_int_edge(raw_len, self.target.ptr_ty, false);
        Ok((data, len))
    }

    // ─── SoA gather/scatter ─────────────────────────────────────

    fn soa_column_ptr(
        &mut self,
        base_ptr: Value,
        field_offset: u64,
        soa: SoaKind,
    ) -> CodegenResult<Value> {
        match soa {
            SoaKind::Fixed(_) => Ok(if field_offset == 0 {
                base_ptr
            } else {
                self.b.ins().iadd_imm(base_ptr, field_offset as i64)
            }),
            SoaKind::Slice | SoaKind::Dynamic => Ok(self.b.ins().load(
                self.target.ptr_ty,
                MemFlags::new(),
                base_ptr,
                field_offset as i32,
            )),
            SoaKind::None => internal_error("column pointer of a non-soa struct"),
        }
    }

    /// Assemble one logical element from its scattered columns.
    fn soa_gather(
        &mut self,
        base: &KValue,
        index: &KValue,
        elem_ty: TypeId,
    ) -> CodegenResult<KValue> {
        let sem = self.sem;
        let soa_ty = addressed_ty(&sem.types, base)?;
        let core = sem.types.core(soa_ty);
        let (fields, soa) = match sem.types.kind(core) {
            TypeKind::Struct { fields, soa } => (fields, *soa),
            _ => return internal_error("soa gather over a non-struct aggregate"),
        };
        let col_offsets = &sem.types.layout(core).offsets;
        let elem_core = sem.types.core(elem_ty);
        let elem_offsets = &sem.types.layout(elem_core).offsets;

        let base_ptr = self.addr_base_ptr(base)?;
        let idx = self.index_word(index)?;
        let out = self.alloc_local(elem_ty, false)?;
        let out_ptr = self.addr_get_ptr(&out)?;

        for (i, f) in fields.iter().enumerate() {
            let fsize = sem.types.size_of(f.ty);
            let col = self.soa_column_ptr(base_ptr, col_offsets[i], soa)?;
            let lane_off = self.b.ins().imul_imm(idx, fsize as i64);
            let src = self.b.ins().iadd(col, lane_off);
            let dst_off = elem_offsets[i];
            match register_ty(&sem.types, self.target.ptr_ty, f.ty) {
                Some(cl) => {
                    let v = self.b.ins().load(cl, MemFlags::new(), src, 0);
                    self.b.ins().store(MemFlags::new(), v, out_ptr, dst_off as i32);
                }
                None => {
                    let dst = self.b.ins().iadd_imm(out_ptr, dst_off as i64);
                    self.copy_bytes(dst, src, fsize);
                }
            }
        }
        self.emit_load(out_ptr, elem_ty)
    }

    /// Scatter one logical element back across its columns.
    fn soa_scatter(
        &mut self,
        base: &KValue,
        index: &KValue,
        elem_ty: TypeId,
        value: KValue,
    ) -> CodegenResult<()> {
        let sem = self.sem;
        let soa_ty = addressed_ty(&sem.types, base)?;
        let core = sem.types.core(soa_ty);
        let (fields, soa) = match sem.types.kind(core) {
            TypeKind::Struct { fields, soa } => (fields, *soa),
            _ => return internal_error("soa scatter over a non-struct aggregate"),
        };
        let col_offsets = &sem.types.layout(core).offsets;
        let elem_core = sem.types.core(elem_ty);
        let elem_offsets = &sem.types.layout(elem_core).offsets;

        let base_ptr = self.addr_base_ptr(base)?;
        let idx = self.index_word(index)?;
        let src_ptr = self.spill_to_ptr(&value)?;

        for (i, f) in fields.iter().enumerate() {
            let fsize = sem.types.size_of(f.ty);
            let col = self.soa_column_ptr(base_ptr, col_offsets[i], soa)?;
            let lane_off = self.b.ins().imul_imm(idx, fsize as i64);
            let dst = self.b.ins().iadd(col, lane_off);
            let src_off = elem_offsets[i];
            match register_ty(&sem.types, self.target.ptr_ty, f.ty) {
                Some(cl) => {
                    let v = self.b.ins().load(cl, MemFlags::new(), src_ptr, src_off as i32);
                    self.b.ins().store(MemFlags::new(), v, dst, 0);
                }
                None => {
                    let src = self.b.ins().iadd_imm(src_ptr, src_off as i64);
                    self.copy_bytes(dst, src, fsize);
                }
            }
        }
        Ok(())
    }

    // ─── Swizzles ───────────────────────────────────────────────

    fn swizzle_load(
        &mut self,
        base: &KValue,
        result_ty: TypeId,
        lanes: &[u16],
    ) -> CodegenResult<KValue> {
        let sem = self.sem;
        let src_ty = addressed_ty(&sem.types, base)?;
        let elem = match sem.types.array_elem(src_ty) {
            Some(e) => e,
            None => return internal_error("swizzle over non-array storage"),
        };
        let esize = sem.types.size_of(elem) as i64;
        let cl = match register_ty(&sem.types, self.target.ptr_ty, elem) {
            Some(c) => c,
            None => return internal_error("swizzle lanes must be register scalars"),
        };
        let ptr = self.addr_base_ptr(base)?;
        let out = self.alloc_local(result_ty, false)?;
        let out_ptr = self.addr_get_ptr(&out)?;
        for (i, &lane) in lanes.iter().enumerate() {
            let v = self
                .b
                .ins()
                .load(cl, MemFlags::new(), ptr, (i64::from(lane) * esize) as i32);
            self.b
                .ins()
                .store(MemFlags::new(), v, out_ptr, (i as i64 * esize) as i32);
        }
        self.emit_load(out_ptr, result_ty)
    }

    fn swizzle_store(&mut self, base: &KValue, lanes: &[u16], value: KValue) -> CodegenResult<()> {
        let sem = self.sem;
        let dst_ty = addressed_ty(&sem.types, base)?;
        let elem = match sem.types.array_elem(dst_ty) {
            Some(e) => e,
            None => return internal_error("swizzle over non-array storage"),
        };
        let esize = sem.types.size_of(elem) as i64;
        let cl = match register_ty(&sem.types, self.target.ptr_ty, elem) {
            Some(c) => c,
            None => return internal_error("swizzle lanes must be register scalars"),
        };
        let ptr = self.addr_base_ptr(base)?;
        let src = self.spill_to_ptr(&value)?;
        for (i, &lane) in lanes.iter().enumerate() {
            let v = self
                .b
                .ins()
                .load(cl, MemFlags::new(), src, (i as i64 * esize) as i32);
            self.b
                .ins()
                .store(MemFlags::new(), v, ptr, (i64::from(lane) * esize) as i32);
        }
        Ok(())
    }

    // ─── Context fields ─────────────────────────────────────────

    fn context_field_ptr(
        &mut self,
        base: &KValue,
        sel: &Selection,
        field_ty: TypeId,
    ) -> CodegenResult<Value> {
        let addr = self.sel_addr(Addr::plain(base.clone()), sel, field_ty)?;
        self.addr_get_ptr(&addr)
    }

    // ─── Runtime checks ─────────────────────────────────────────

    pub(crate) fn runtime_ref(&self, name: &'static str) -> CodegenResult<FuncRef> {
        match self.refs.runtime.get(name) {
            Some(&f) => Ok(f),
            None => internal_error(format!("runtime helper {} not imported", name)),
        }
    }

    /// Branch to a fresh fail region when `cond` holds; the fail region
    /// reports through the named helper and traps.
    pub(crate) fn emit_check_fail(
        &mut self,
        cond: Value,
        helper: &'static str,
        args: &[Value],
    ) -> CodegenResult<()> {
        let fail = self.new_region();
        let cont = self.new_region();
        self.b.ins().brif(cond, fail, &[], cont, &[]);
        self.switch_region(fail);
        let mut call_args = Vec::with_capacity(args.len());
        for &a in args {
            call_args.push(self.cast_int_edge(a, types::I64, false));
        }
        let fref = self.runtime_ref(helper)?;
        self.b.ins().call(fref, &call_args);
        self.b.ins().trap(TrapCode::user(1).unwrap());
        self.switch_region(cont);
        Ok(())
    }

    /// `index < len` (unsigned) or trap. A no-op when bounds checks are
    /// disabled at this statement.
    pub(crate) fn bounds_check(&mut self, index: Value, len: Value) -> CodegenResult<()> {
        if !self.flags.bounds_enabled() {
            return Ok(());
        }
        // a folded in-range index against a known length needs no test
        if let (Some(i), Some(n)) = (self.const_word(index), self.const_word(len)) {
            if (i as u64) < (n as u64) {
                return Ok(());
            }
        }
        let cond = self
            .b
            .ins()
            .icmp(IntCC::UnsignedGreaterThanOrEqual, index, len);
        self.emit_check_fail(cond, "keel_bounds_check_fail", &[index, len])
    }

    /// The immediate behind `v` when it is an `iconst`, seen through
    /// width-adjustment hops.
    fn const_word(&self, v: Value) -> Option<i64> {
        let dfg = &self.b.func.dfg;
        let mut cur = v;
        loop {
            let inst = match dfg.value_def(cur) {
                ValueDef::Result(inst, 0) => inst,
                _ => return None,
            };
            match dfg.insts[inst] {
                InstructionData::UnaryImm {
                    opcode: Opcode::Iconst,
                    imm,
                } => return Some(imm.bits()),
                InstructionData::Unary {
                    opcode: Opcode::Uextend | Opcode::Sextend | Opcode::Ireduce,
                    arg,
                } => cur = arg,
                _ => return None,
            }
        }
    }

    /// `0 <= lo <= hi <= len` or trap, for slicing operations.
    pub(crate) fn slice_range_check(
        &mut self,
        lo: Value,
        hi: Value,
        len: Value,
    ) -> CodegenResult<()> {
        if !self.flags.bounds_enabled() {
            return Ok(());
        }
        let bad_order = self.b.ins().icmp(IntCC::UnsignedGreaterThan, lo, hi);
        let bad_hi = self.b.ins().icmp(IntCC::UnsignedGreaterThan, hi, len);
        let cond = self.b.ins().bor(bad_order, bad_hi);
        self.emit_check_fail(cond, "keel_slice_range_fail", &[lo, hi, len])
    }
}
