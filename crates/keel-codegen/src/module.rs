// SPDX-License-Identifier: (MIT OR Apache-2.0)

//! Object-module setup and lowering orchestration.
//!
//! One `ModuleLowering` owns the Cranelift object module for a whole
//! compilation unit: runtime helper imports, procedure and data
//! symbols, constant payload blobs, and the per-procedure driver.
//! Procedure bodies lower one at a time; the symbol and type-name
//! caches they consult sit behind reader-writer locks whose only
//! mutating operation is lookup-or-insert, so readers need nothing
//! beyond the lock and racing inserters converge on one entry.

use cranelift::prelude::*;
use cranelift_codegen::ir::{FuncRef, GlobalValue};
use cranelift_codegen::isa::{CallConv, TargetIsa};
use cranelift_frontend::{FunctionBuilder as ClifFunctionBuilder, FunctionBuilderContext};
use cranelift_module::{DataDescription, DataId, FuncId, Linkage, Module};
use cranelift_object::{ObjectBuilder, ObjectModule};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::RwLock;

use keel_sem::{
    CaseValue, CheckedModule, ConstValue, Endian, EntityId, EntityKind, Expr, ExprKind, Procedure,
    ProcedureId, Stmt, StmtKind, TypeId, TypeKind, TypeTable,
};

use crate::proc::ProcLowering;
use crate::value::{int_register_ty, register_ty};
use crate::{internal_error, BuildMode, CodegenError, CodegenResult};

/// Target facts the lowering layer consults constantly.
#[derive(Debug, Clone, Copy)]
pub struct TargetSpec {
    /// IR type of a pointer-sized word.
    pub ptr_ty: Type,
    pub ptr_bytes: u64,
    pub little_endian: bool,
    pub call_conv: CallConv,
}

impl TargetSpec {
    fn from_isa(isa: &dyn TargetIsa) -> TargetSpec {
        let ptr_ty = isa.pointer_type();
        TargetSpec {
            ptr_ty,
            ptr_bytes: u64::from(ptr_ty.bytes()),
            little_endian: isa.triple().endianness() == Ok(target_lexicon::Endianness::Little),
            call_conv: isa.default_call_conv(),
        }
    }
}

/// Lock-guarded lookup-or-insert cache.
///
/// `get_or_insert_with` is the only mutation callers get: two racing
/// lookups of the same key keep the first entry, and no caller ever
/// observes a removal.
#[derive(Debug, Default)]
pub struct SyncCache<K, V> {
    inner: RwLock<HashMap<K, V>>,
}

impl<K: Eq + Hash + Clone, V: Clone> SyncCache<K, V> {
    pub fn new() -> Self {
        SyncCache {
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.read().get(key).cloned()
    }

    pub fn get_or_insert_with(&self, key: K, make: impl FnOnce() -> V) -> V {
        if let Some(v) = self.read().get(&key) {
            return v.clone();
        }
        let mut map = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.entry(key).or_insert_with(make).clone()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<K, V>> {
        match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// What a checked entity became in the object module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleSymbol {
    Func(FuncId),
    Data(DataId),
}

/// A runtime helper: imported C symbol with a fixed signature.
///
/// Addresses are passed as `I64`; the native ISAs this backend is
/// configured for are 64-bit.
struct RuntimeEntry {
    name: &'static str,
    params: &'static [Type],
    ret: Option<Type>,
}

/// The complete helper registry. Lowering calls these by name; the
/// argument orders documented here are the contract with the runtime.
fn runtime_entries() -> Vec<RuntimeEntry> {
    vec![
        // ── Complex / quaternion arithmetic ───────────────────
        // keel_quo_complex64(out, lhs, rhs): pointers to 2xf32
        RuntimeEntry {
            name: "keel_quo_complex64",
            params: &[types::I64, types::I64, types::I64],
            ret: None,
        },
        // keel_quo_complex128(out, lhs, rhs): pointers to 2xf64
        RuntimeEntry {
            name: "keel_quo_complex128",
            params: &[types::I64, types::I64, types::I64],
            ret: None,
        },
        // keel_mul_quaternion128(out, lhs, rhs): pointers to 4xf32, xyzw
        RuntimeEntry {
            name: "keel_mul_quaternion128",
            params: &[types::I64, types::I64, types::I64],
            ret: None,
        },
        // keel_quo_quaternion128(out, lhs, rhs)
        RuntimeEntry {
            name: "keel_quo_quaternion128",
            params: &[types::I64, types::I64, types::I64],
            ret: None,
        },
        // ── Memory and string comparison ──────────────────────
        // keel_memory_compare(a, b, len) -> ordering sign, memcmp-style
        RuntimeEntry {
            name: "keel_memory_compare",
            params: &[types::I64, types::I64, types::I64],
            ret: Some(types::I32),
        },
        // keel_memory_equal(a, b, len) -> bool
        RuntimeEntry {
            name: "keel_memory_equal",
            params: &[types::I64, types::I64, types::I64],
            ret: Some(types::I8),
        },
        // keel_string_eq(a_ptr, a_len, b_ptr, b_len) -> bool
        RuntimeEntry {
            name: "keel_string_eq",
            params: &[types::I64, types::I64, types::I64, types::I64],
            ret: Some(types::I8),
        },
        // keel_string_lt(a_ptr, a_len, b_ptr, b_len) -> bool
        RuntimeEntry {
            name: "keel_string_lt",
            params: &[types::I64, types::I64, types::I64, types::I64],
            ret: Some(types::I8),
        },
        // ── Map access ────────────────────────────────────────
        // keel_map_get(map, key_ptr, value_out) -> found
        RuntimeEntry {
            name: "keel_map_get",
            params: &[types::I64, types::I64, types::I64],
            ret: Some(types::I8),
        },
        // keel_map_set(map, key_ptr, value_ptr)
        RuntimeEntry {
            name: "keel_map_set",
            params: &[types::I64, types::I64, types::I64],
            ret: None,
        },
        // ── Check failures (all diverge after reporting) ──────
        // keel_bounds_check_fail(index, len)
        RuntimeEntry {
            name: "keel_bounds_check_fail",
            params: &[types::I64, types::I64],
            ret: None,
        },
        // keel_slice_range_fail(lo, hi, len)
        RuntimeEntry {
            name: "keel_slice_range_fail",
            params: &[types::I64, types::I64, types::I64],
            ret: None,
        },
        // keel_type_assert_fail(got_typeid, want_typeid)
        RuntimeEntry {
            name: "keel_type_assert_fail",
            params: &[types::I64, types::I64],
            ret: None,
        },
        // ── 128-bit float conversions ─────────────────────────
        // keel_float_from_i128(val, signed) -> f64
        RuntimeEntry {
            name: "keel_float_from_i128",
            params: &[types::I128, types::I8],
            ret: Some(types::F64),
        },
        // keel_i128_from_float(val, signed) -> i128
        RuntimeEntry {
            name: "keel_i128_from_float",
            params: &[types::F64, types::I8],
            ret: Some(types::I128),
        },
        // ── Bit intrinsics without an IR instruction ──────────
        // keel_reverse_bits(val, bit_width) -> val reversed in width
        RuntimeEntry {
            name: "keel_reverse_bits",
            params: &[types::I64, types::I64],
            ret: Some(types::I64),
        },
    ]
}

/// Pre-imported, per-function handles for everything a body may
/// reference. Imports need the module, so they are resolved before the
/// function builder borrows the function.
#[derive(Default)]
pub(crate) struct ProcRefs {
    pub funcs: HashMap<ProcedureId, FuncRef>,
    pub runtime: HashMap<&'static str, FuncRef>,
    /// Generated per-type equality routines used by this body.
    pub equal: HashMap<TypeId, FuncRef>,
    /// Globals and static locals, by entity.
    pub data: HashMap<EntityId, GlobalValue>,
    /// String literal payloads, by content.
    pub strings: HashMap<String, GlobalValue>,
    /// The implicit context record, when the body touches it.
    pub context: Option<GlobalValue>,
}

/// What the body prepass found: module data that must exist before
/// lowering starts.
#[derive(Default)]
struct BodyData {
    strings: Vec<String>,
    statics: Vec<EntityId>,
    equal_types: Vec<TypeId>,
    /// Type of the implicit context record, when referenced.
    context_ty: Option<TypeId>,
}

/// Byte-comparison plan for one piece of a generated equality routine.
enum CmpPart {
    /// Register scalar compared directly.
    Scalar { offset: u64, cl: Type, float: bool },
    /// String field; pointer/length words handed to the runtime.
    Str { offset: u64 },
    /// Nested record with its own generated routine.
    Nested { offset: u64, func: FuncId },
    /// Element-by-element loop; `part` is relative to each element.
    Elems {
        offset: u64,
        len: u64,
        stride: u64,
        part: Box<CmpPart>,
    },
    /// Tagged union: tag words first, then the matching variant.
    Union {
        offset: u64,
        tag_offset: u64,
        tag_cl: Type,
        variants: Vec<CmpPart>,
    },
    /// Flat byte range via `keel_memory_equal`.
    Bytes { offset: u64, len: u64 },
}

/// Resolved callee handles inside a generated equality routine.
struct EqRefs {
    memory_equal: FuncRef,
    string_eq: FuncRef,
    nested: HashMap<FuncId, FuncRef>,
}

pub struct ModuleLowering {
    module: ObjectModule,
    ctx: codegen::Context,
    target: TargetSpec,
    mode: BuildMode,
    /// Entity -> object symbol. Filled by the declare phases, read
    /// while procedures lower.
    symbols: SyncCache<EntityId, ModuleSymbol>,
    /// Stable per-type labels for mangled routine names.
    type_names: SyncCache<TypeId, String>,
    /// Per-type generated equality routines.
    equal_procs: SyncCache<TypeId, FuncId>,
    /// Runtime helpers by fixed name.
    runtime: HashMap<&'static str, FuncId>,
    /// Procedure ids -> declared functions.
    proc_funcs: HashMap<ProcedureId, FuncId>,
    /// Interned constant payload blobs, deduplicated by content.
    string_data: HashMap<Vec<u8>, DataId>,
    /// Thread-local storage for the implicit context record.
    context_data: Option<DataId>,
    anon_data: u32,
}

impl ModuleLowering {
    pub fn new(mode: BuildMode) -> CodegenResult<Self> {
        let isa_builder = cranelift_native::builder()
            .map_err(|e| CodegenError::HostUnsupported(e.to_string()))?;

        let mut flags = settings::builder();
        let opt_level = match mode {
            BuildMode::Debug => "none",
            BuildMode::Release => "speed",
        };
        flags
            .set("opt_level", opt_level)
            .map_err(|e| CodegenError::HostUnsupported(e.to_string()))?;
        // The runtime contract passes 128-bit integers by value
        // (`keel_float_from_i128`/`keel_i128_from_float`); x64 only
        // accepts i128 args/returns with the LLVM ABI extensions on.
        flags
            .set("enable_llvm_abi_extensions", "true")
            .map_err(|e| CodegenError::HostUnsupported(e.to_string()))?;
        // Thread-local data (the context record, `thread_local` globals)
        // lowers `tls_value`, which needs a model matching the object
        // format; the default `none` has no lowering at all.
        let tls_model = match isa_builder.triple().binary_format {
            target_lexicon::BinaryFormat::Macho => "macho",
            target_lexicon::BinaryFormat::Coff => "coff",
            _ => "elf_gd",
        };
        flags
            .set("tls_model", tls_model)
            .map_err(|e| CodegenError::HostUnsupported(e.to_string()))?;

        let isa = isa_builder
            .finish(settings::Flags::new(flags))
            .map_err(|e| CodegenError::HostUnsupported(e.to_string()))?;
        let target = TargetSpec::from_isa(&*isa);

        let builder = ObjectBuilder::new(
            isa,
            "keel_module",
            cranelift_module::default_libcall_names(),
        )
        .map_err(|e| CodegenError::Emit(e.to_string()))?;

        Ok(ModuleLowering {
            module: ObjectModule::new(builder),
            ctx: codegen::Context::new(),
            target,
            mode,
            symbols: SyncCache::new(),
            type_names: SyncCache::new(),
            equal_procs: SyncCache::new(),
            runtime: HashMap::new(),
            proc_funcs: HashMap::new(),
            string_data: HashMap::new(),
            context_data: None,
            anon_data: 0,
        })
    }

    pub fn target(&self) -> TargetSpec {
        self.target
    }

    pub fn mode(&self) -> BuildMode {
        self.mode
    }

    /// Entity -> symbol cache, shared with concurrent readers.
    pub fn symbols(&self) -> &SyncCache<EntityId, ModuleSymbol> {
        &self.symbols
    }

    /// Declare the runtime helpers as external imports. These are
    /// provided by the keel runtime library at link time.
    pub fn declare_runtime_helpers(&mut self) -> CodegenResult<()> {
        for entry in runtime_entries() {
            let mut sig = self.module.make_signature();
            for &param_ty in entry.params {
                sig.params.push(AbiParam::new(param_ty));
            }
            if let Some(ret) = entry.ret {
                sig.returns.push(AbiParam::new(ret));
            }
            let id = self
                .module
                .declare_function(entry.name, Linkage::Import, &sig)
                .map_err(|e| CodegenError::Emit(e.to_string()))?;
            self.runtime.insert(entry.name, id);
        }
        Ok(())
    }

    /// Declare every procedure first so forward references and mutual
    /// recursion resolve. Bodiless procedures are foreign imports.
    pub fn declare_procedures(&mut self, sem: &CheckedModule) -> CodegenResult<()> {
        for (index, proc) in sem.procs.iter().enumerate() {
            let id = ProcedureId(index as u32);
            let sig = self.proc_signature(sem, &proc.sig);
            let name = proc.link_name.as_deref().unwrap_or(&proc.name);
            let linkage = if proc.body.is_empty() {
                Linkage::Import
            } else {
                Linkage::Export
            };
            let func_id = self
                .module
                .declare_function(name, linkage, &sig)
                .map_err(|e| CodegenError::Emit(e.to_string()))?;
            self.proc_funcs.insert(id, func_id);
        }
        for (index, ent) in sem.entities.iter().enumerate() {
            if let EntityKind::Proc(pid) = ent.kind {
                if let Some(&func_id) = self.proc_funcs.get(&pid) {
                    self.symbols
                        .get_or_insert_with(EntityId(index as u32), || ModuleSymbol::Func(func_id));
                }
            }
        }
        Ok(())
    }

    /// Emit every module-level variable as a data symbol with its
    /// folded initializer (or a zero-fill when there is none).
    pub fn declare_globals(&mut self, sem: &CheckedModule) -> CodegenResult<()> {
        for (eid, init) in &sem.globals {
            let ent = sem.entity(*eid);
            let (writable, tls) = match ent.kind {
                EntityKind::Global {
                    mutable,
                    thread_local,
                } => (mutable, thread_local),
                _ => return internal_error(format!("entity {:?} in global list is not a global", eid)),
            };
            let name = ent.name.clone();
            let ty = ent.ty;
            let data_id = self.define_data_symbol(
                &sem.types,
                &name,
                Linkage::Export,
                writable,
                tls,
                ty,
                init.as_ref(),
            )?;
            self.symbols
                .get_or_insert_with(*eid, || ModuleSymbol::Data(data_id));
        }
        Ok(())
    }

    /// Signature under the backend ABI: aggregate parameters arrive by
    /// address, scalar results return in registers, aggregate results
    /// become trailing out-pointer parameters.
    pub(crate) fn proc_signature(
        &self,
        sem: &CheckedModule,
        sig: &keel_sem::Signature,
    ) -> Signature {
        let mut clif = self.module.make_signature();
        for &param in &sig.params {
            let ty = sem.entity(param).ty;
            let abi = register_ty(&sem.types, self.target.ptr_ty, ty).unwrap_or(self.target.ptr_ty);
            clif.params.push(AbiParam::new(abi));
        }
        for &result in &sig.results {
            let ty = sem.entity(result).ty;
            if sem.types.is_void(ty) {
                continue;
            }
            match register_ty(&sem.types, self.target.ptr_ty, ty) {
                Some(t) => clif.returns.push(AbiParam::new(t)),
                None => clif.params.push(AbiParam::new(self.target.ptr_ty)),
            }
        }
        clif
    }

    /// Lower one procedure body and define it in the object module.
    pub fn lower_procedure(&mut self, sem: &CheckedModule, id: ProcedureId) -> CodegenResult<()> {
        let proc = sem.proc(id);
        if proc.body.is_empty() {
            // foreign declaration; nothing to define
            return Ok(());
        }
        let func_id = match self.proc_funcs.get(&id).copied() {
            Some(f) => f,
            None => return internal_error(format!("procedure {:?} was never declared", id)),
        };

        // Module data the body references must exist before the
        // function builder borrows ctx; collect and define it up front.
        let body = self.scan_body(sem, proc)?;

        self.ctx.clear();
        self.ctx.func.signature = self.proc_signature(sem, &proc.sig);

        // Pre-import every symbol into this function's namespace.
        let mut refs = ProcRefs::default();
        for (&pid, &fid) in &self.proc_funcs {
            refs.funcs
                .insert(pid, self.module.declare_func_in_func(fid, &mut self.ctx.func));
        }
        for (&name, &fid) in &self.runtime {
            refs.runtime
                .insert(name, self.module.declare_func_in_func(fid, &mut self.ctx.func));
        }
        for &ty in &body.equal_types {
            if let Some(fid) = self.equal_procs.get(&ty) {
                refs.equal
                    .insert(ty, self.module.declare_func_in_func(fid, &mut self.ctx.func));
            }
        }
        for (eid, _) in &sem.globals {
            if let Some(ModuleSymbol::Data(data_id)) = self.symbols.get(eid) {
                refs.data.insert(
                    *eid,
                    self.module.declare_data_in_func(data_id, &mut self.ctx.func),
                );
            }
        }
        for &eid in &body.statics {
            if let Some(ModuleSymbol::Data(data_id)) = self.symbols.get(&eid) {
                refs.data.insert(
                    eid,
                    self.module.declare_data_in_func(data_id, &mut self.ctx.func),
                );
            }
        }
        for content in &body.strings {
            if let Some(&data_id) = self.string_data.get(content.as_bytes()) {
                refs.strings.insert(
                    content.clone(),
                    self.module.declare_data_in_func(data_id, &mut self.ctx.func),
                );
            }
        }
        if let Some(ty) = body.context_ty {
            let data_id = match self.context_data {
                Some(d) => d,
                None => {
                    let d = self.define_data_symbol(
                        &sem.types,
                        "keel.context",
                        Linkage::Local,
                        true,
                        true,
                        ty,
                        None,
                    )?;
                    self.context_data = Some(d);
                    d
                }
            };
            refs.context = Some(self.module.declare_data_in_func(data_id, &mut self.ctx.func));
        }

        let mut fb_ctx = FunctionBuilderContext::new();
        let builder = ClifFunctionBuilder::new(&mut self.ctx.func, &mut fb_ctx);
        let lowering = ProcLowering::new(builder, sem, proc, self.target, &refs);
        lowering.run()?;

        self.module
            .define_function(func_id, &mut self.ctx)
            .map_err(|e| CodegenError::Emit(e.to_string()))?;
        Ok(())
    }

    /// Declare and lower the whole checked module.
    pub fn lower_module(&mut self, sem: &CheckedModule) -> CodegenResult<()> {
        self.declare_runtime_helpers()?;
        self.declare_procedures(sem)?;
        self.declare_globals(sem)?;
        for index in 0..sem.procs.len() {
            self.lower_procedure(sem, ProcedureId(index as u32))?;
        }
        Ok(())
    }

    /// Emit the final object file. Consumes self because finish() takes
    /// ownership of the module.
    pub fn emit_object(self, path: &str) -> CodegenResult<()> {
        let product = self.module.finish();
        let bytes = product
            .emit()
            .map_err(|e| CodegenError::Emit(e.to_string()))?;
        std::fs::write(path, bytes).map_err(|e| CodegenError::Emit(e.to_string()))?;
        Ok(())
    }

    // ─── Data symbols ───────────────────────────────────────────

    /// Declare and define one sized data symbol, with relocations for
    /// any string payloads inside the initializer.
    fn define_data_symbol(
        &mut self,
        types: &TypeTable,
        name: &str,
        linkage: Linkage,
        writable: bool,
        tls: bool,
        ty: TypeId,
        init: Option<&ConstValue>,
    ) -> CodegenResult<DataId> {
        let data_id = self
            .module
            .declare_data(name, linkage, writable, tls)
            .map_err(|e| CodegenError::Emit(e.to_string()))?;

        let size = (types.size_of(ty) as usize).max(1);
        let mut desc = DataDescription::new();
        desc.set_align(types.align_of(ty).max(1));
        match init {
            None => desc.define_zeroinit(size),
            Some(v) if v.is_zero() => desc.define_zeroinit(size),
            Some(v) => {
                let mut bytes = vec![0u8; size];
                self.encode_const(types, ty, v, 0, &mut bytes, &mut desc)?;
                desc.define(bytes.into_boxed_slice());
            }
        }

        self.module
            .define_data(data_id, &desc)
            .map_err(|e| CodegenError::Emit(e.to_string()))?;
        Ok(data_id)
    }

    /// Static locals become module data with a mangled per-procedure
    /// name; repeated lowering of the same entity reuses the symbol.
    fn define_static_local(
        &mut self,
        sem: &CheckedModule,
        proc: &Procedure,
        eid: EntityId,
        init: Option<&ConstValue>,
    ) -> CodegenResult<DataId> {
        if let Some(ModuleSymbol::Data(data_id)) = self.symbols.get(&eid) {
            return Ok(data_id);
        }
        let ent = sem.entity(eid);
        let tls = matches!(ent.kind, EntityKind::StaticLocal { thread_local: true });
        let name = format!("{}.{}.{}", proc.name, ent.name, eid.0);
        let ty = ent.ty;
        let data_id =
            self.define_data_symbol(&sem.types, &name, Linkage::Local, true, tls, ty, init)?;
        self.symbols
            .get_or_insert_with(eid, || ModuleSymbol::Data(data_id));
        Ok(data_id)
    }

    /// Intern one constant byte payload, NUL-terminated for foreign
    /// callees that expect it. Duplicate content shares a blob.
    fn intern_string(&mut self, content: &[u8]) -> CodegenResult<DataId> {
        if let Some(&data_id) = self.string_data.get(content) {
            return Ok(data_id);
        }
        let name = format!(".str.{}", self.anon_data);
        self.anon_data += 1;

        let data_id = self
            .module
            .declare_data(&name, Linkage::Local, false, false)
            .map_err(|e| CodegenError::Emit(e.to_string()))?;
        let mut bytes = content.to_vec();
        bytes.push(0);
        let mut desc = DataDescription::new();
        desc.define(bytes.into_boxed_slice());
        self.module
            .define_data(data_id, &desc)
            .map_err(|e| CodegenError::Emit(e.to_string()))?;

        self.string_data.insert(content.to_vec(), data_id);
        Ok(data_id)
    }

    /// Serialize one folded constant into `out` at `offset`, following
    /// the type's layout and byte order. String fields write a payload
    /// relocation plus a length word.
    fn encode_const(
        &mut self,
        types: &TypeTable,
        ty: TypeId,
        value: &ConstValue,
        offset: usize,
        out: &mut [u8],
        desc: &mut DataDescription,
    ) -> CodegenResult<()> {
        let core = types.core(ty);
        match value {
            ConstValue::Nil | ConstValue::Uninit => Ok(()),
            ConstValue::Bool(b) => {
                out[offset] = *b as u8;
                Ok(())
            }
            ConstValue::Int(v) => {
                let size = types.size_of(core) as usize;
                write_int(*v, size, store_little(types, core), &mut out[offset..offset + size]);
                Ok(())
            }
            ConstValue::Float(f) => {
                let little = store_little(types, core);
                match types.size_of(core) {
                    4 => write_int(
                        (*f as f32).to_bits() as i128,
                        4,
                        little,
                        &mut out[offset..offset + 4],
                    ),
                    8 => write_int(f.to_bits() as i128, 8, little, &mut out[offset..offset + 8]),
                    other => {
                        return internal_error(format!("float constant of size {}", other));
                    }
                }
                Ok(())
            }
            ConstValue::Str(s) => {
                let payload = self.intern_string(s.as_bytes())?;
                let gv = self.module.declare_data_in_data(payload, desc);
                desc.write_data_addr(offset as u32, gv, 0);
                let word = types.ptr_bytes() as usize;
                write_int(
                    s.len() as i128,
                    word,
                    types.little_endian(),
                    &mut out[offset + word..offset + word * 2],
                );
                Ok(())
            }
            ConstValue::Aggregate(elems) => {
                match types.kind(core).clone() {
                    TypeKind::Struct { fields, .. } => {
                        for (i, elem) in elems.iter().enumerate() {
                            let field_ty = match fields.get(i) {
                                Some(f) => f.ty,
                                None => {
                                    return internal_error("constant has more fields than its type")
                                }
                            };
                            let at = offset + types.offset_of(core, i) as usize;
                            self.encode_const(types, field_ty, elem, at, out, desc)?;
                        }
                    }
                    TypeKind::Tuple { elems: tys } => {
                        for (i, elem) in elems.iter().enumerate() {
                            let elem_ty = match tys.get(i) {
                                Some(&t) => t,
                                None => {
                                    return internal_error("constant has more fields than its type")
                                }
                            };
                            let at = offset + types.offset_of(core, i) as usize;
                            self.encode_const(types, elem_ty, elem, at, out, desc)?;
                        }
                    }
                    TypeKind::Array { elem: elem_ty, .. }
                    | TypeKind::Simd { elem: elem_ty, .. }
                    | TypeKind::Matrix { elem: elem_ty, .. } => {
                        let stride = types.size_of(elem_ty) as usize;
                        for (i, elem) in elems.iter().enumerate() {
                            self.encode_const(types, elem_ty, elem, offset + i * stride, out, desc)?;
                        }
                    }
                    TypeKind::Complex { bits } | TypeKind::Quaternion { bits } => {
                        let stride = bits as usize / 8;
                        let little = types.little_endian();
                        for (i, elem) in elems.iter().enumerate() {
                            let f = match elem {
                                ConstValue::Float(f) => *f,
                                ConstValue::Int(v) => *v as f64,
                                ConstValue::Nil | ConstValue::Uninit => 0.0,
                                _ => return internal_error("complex component is not numeric"),
                            };
                            let at = offset + i * stride;
                            match bits {
                                32 => write_int(
                                    (f as f32).to_bits() as i128,
                                    4,
                                    little,
                                    &mut out[at..at + 4],
                                ),
                                _ => write_int(
                                    f.to_bits() as i128,
                                    8,
                                    little,
                                    &mut out[at..at + 8],
                                ),
                            }
                        }
                    }
                    other => {
                        return internal_error(format!(
                            "aggregate constant for non-aggregate type {:?}",
                            other
                        ));
                    }
                }
                Ok(())
            }
        }
    }

    // ─── Generated equality routines ────────────────────────────

    /// Stable label for mangled per-type routine names.
    fn type_label(&self, types: &TypeTable, ty: TypeId) -> String {
        self.type_names.get_or_insert_with(ty, || match types.name(ty) {
            Some(n) => format!("{}.{}", n, ty.0),
            None => format!("ty.{}", ty.0),
        })
    }

    /// Get or generate the equality routine for a padded record type:
    /// `fn(a: ptr, b: ptr) -> bool` comparing field by field, with
    /// loops over array-shaped pieces and a tag dispatch for unions.
    pub(crate) fn equality_proc(
        &mut self,
        types: &TypeTable,
        ty: TypeId,
    ) -> CodegenResult<FuncId> {
        if let Some(func_id) = self.equal_procs.get(&ty) {
            return Ok(func_id);
        }

        let name = format!("keel.eq.{}", self.type_label(types, ty));
        let mut sig = Signature::new(self.target.call_conv);
        sig.params.push(AbiParam::new(self.target.ptr_ty));
        sig.params.push(AbiParam::new(self.target.ptr_ty));
        sig.returns.push(AbiParam::new(types::I8));
        let func_id = self
            .module
            .declare_function(&name, Linkage::Local, &sig)
            .map_err(|e| CodegenError::Emit(e.to_string()))?;
        // insert before generating so recursive types terminate
        self.equal_procs.get_or_insert_with(ty, || func_id);

        // classify first: nested routines must exist before this body
        // imports them
        let parts = self.record_parts(types, ty)?;

        let mut ctx = codegen::Context::new();
        ctx.func.signature = sig;

        let mut nested_ids = Vec::new();
        for part in &parts {
            collect_nested(part, &mut nested_ids);
        }
        let memory_equal = match self.runtime.get("keel_memory_equal") {
            Some(&f) => self.module.declare_func_in_func(f, &mut ctx.func),
            None => return internal_error("runtime helpers not declared"),
        };
        let string_eq = match self.runtime.get("keel_string_eq") {
            Some(&f) => self.module.declare_func_in_func(f, &mut ctx.func),
            None => return internal_error("runtime helpers not declared"),
        };
        let mut nested = HashMap::new();
        for id in nested_ids {
            nested.insert(id, self.module.declare_func_in_func(id, &mut ctx.func));
        }
        let eq_refs = EqRefs {
            memory_equal,
            string_eq,
            nested,
        };

        let mut fb_ctx = FunctionBuilderContext::new();
        let mut b = ClifFunctionBuilder::new(&mut ctx.func, &mut fb_ctx);
        let entry = b.create_block();
        b.append_block_params_for_function_params(entry);
        b.switch_to_block(entry);
        let lhs = b.block_params(entry)[0];
        let rhs = b.block_params(entry)[1];
        let fail = b.create_block();

        for part in &parts {
            emit_cmp_part(&mut b, self.target, part, lhs, rhs, fail, &eq_refs)?;
        }
        let one = b.ins().iconst(types::I8, 1);
        b.ins().return_(&[one]);

        b.switch_to_block(fail);
        let zero = b.ins().iconst(types::I8, 0);
        b.ins().return_(&[zero]);

        b.seal_all_blocks();
        b.finalize();

        self.module
            .define_function(func_id, &mut ctx)
            .map_err(|e| CodegenError::Emit(e.to_string()))?;
        Ok(func_id)
    }

    /// Top-level part list: records expand one part per field so the
    /// common case never recurses through a nested call.
    fn record_parts(&mut self, types: &TypeTable, ty: TypeId) -> CodegenResult<Vec<CmpPart>> {
        let core = types.core(ty);
        match types.kind(core).clone() {
            TypeKind::Struct { fields, soa } if soa == keel_sem::SoaKind::None => {
                let mut parts = Vec::with_capacity(fields.len());
                for (i, f) in fields.iter().enumerate() {
                    parts.push(self.cmp_part(types, f.ty, types.offset_of(core, i))?);
                }
                Ok(parts)
            }
            TypeKind::Tuple { elems } => {
                let mut parts = Vec::with_capacity(elems.len());
                for (i, &e) in elems.iter().enumerate() {
                    parts.push(self.cmp_part(types, e, types.offset_of(core, i))?);
                }
                Ok(parts)
            }
            _ => Ok(vec![self.cmp_part(types, ty, 0)?]),
        }
    }

    /// Comparison plan for one field at `offset`.
    fn cmp_part(&mut self, types: &TypeTable, ty: TypeId, offset: u64) -> CodegenResult<CmpPart> {
        let core = types.core(ty);
        let size = types.size_of(core);
        match types.kind(core).clone() {
            TypeKind::Bool
            | TypeKind::Int { .. }
            | TypeKind::BitSet { .. }
            | TypeKind::TypeIdent
            | TypeKind::Pointer { .. }
            | TypeKind::MultiPointer { .. }
            | TypeKind::FuncPointer { .. }
            | TypeKind::RawPointer
            | TypeKind::RelativePointer { .. } => match int_register_ty(size) {
                Some(cl) => Ok(CmpPart::Scalar {
                    offset,
                    cl,
                    float: false,
                }),
                None => internal_error(format!("integer field of size {}", size)),
            },
            TypeKind::Float { bits, .. } => Ok(CmpPart::Scalar {
                offset,
                cl: if bits == 32 { types::F32 } else { types::F64 },
                float: true,
            }),
            TypeKind::String => Ok(CmpPart::Str { offset }),
            TypeKind::Complex { bits } | TypeKind::Quaternion { bits } => {
                let lanes = if matches!(types.kind(core), TypeKind::Complex { .. }) {
                    2
                } else {
                    4
                };
                Ok(CmpPart::Elems {
                    offset,
                    len: lanes,
                    stride: u64::from(bits) / 8,
                    part: Box::new(CmpPart::Scalar {
                        offset: 0,
                        cl: if bits == 32 { types::F32 } else { types::F64 },
                        float: true,
                    }),
                })
            }
            TypeKind::Array { elem, len } => self.elems_part(types, elem, len, offset),
            TypeKind::Simd { elem, lanes } => {
                self.elems_part(types, elem, u64::from(lanes), offset)
            }
            TypeKind::Matrix { elem, rows, cols } => {
                self.elems_part(types, elem, u64::from(rows) * u64::from(cols), offset)
            }
            TypeKind::Struct { .. } | TypeKind::Tuple { .. } => {
                if types.layout(core).simple_compare {
                    Ok(CmpPart::Bytes { offset, len: size })
                } else {
                    let func = self.equality_proc(types, core)?;
                    Ok(CmpPart::Nested { offset, func })
                }
            }
            TypeKind::Union {
                maybe_pointer: true,
                ..
            } => Ok(CmpPart::Scalar {
                offset,
                cl: self.target.ptr_ty,
                float: false,
            }),
            TypeKind::Union { variants, .. } => {
                let layout = types.layout(core).clone();
                let tag_offset = match layout.tag_offset {
                    Some(o) => o,
                    None => return Ok(CmpPart::Bytes { offset, len: size }),
                };
                let tag_cl = if variants.len() >= 256 {
                    types::I16
                } else {
                    types::I8
                };
                let mut parts = Vec::with_capacity(variants.len());
                for &v in &variants {
                    // payload lives at the union's own offset
                    parts.push(self.cmp_part(types, v, offset)?);
                }
                Ok(CmpPart::Union {
                    offset,
                    tag_offset,
                    tag_cl,
                    variants: parts,
                })
            }
            // slices, dynamic arrays, maps, any: shallow word-for-word
            // identity, which flat bytes capture exactly
            _ => Ok(CmpPart::Bytes { offset, len: size }),
        }
    }

    fn elems_part(
        &mut self,
        types: &TypeTable,
        elem: TypeId,
        len: u64,
        offset: u64,
    ) -> CodegenResult<CmpPart> {
        let elem_layout = types.layout(types.core(elem));
        if elem_layout.simple_compare {
            return Ok(CmpPart::Bytes {
                offset,
                len: elem_layout.size * len,
            });
        }
        let stride = elem_layout.size;
        Ok(CmpPart::Elems {
            offset,
            len,
            stride,
            part: Box::new(self.cmp_part(types, elem, 0)?),
        })
    }

    // ─── Body prepass ───────────────────────────────────────────

    /// Walk a body for module data it references: string literals,
    /// static local declarations, and record comparisons that need a
    /// generated routine.
    fn scan_body(&mut self, sem: &CheckedModule, proc: &Procedure) -> CodegenResult<BodyData> {
        let mut data = BodyData::default();
        for stmt in &proc.body {
            self.scan_stmt(sem, proc, stmt, &mut data)?;
        }
        Ok(data)
    }

    fn scan_stmt(
        &mut self,
        sem: &CheckedModule,
        proc: &Procedure,
        stmt: &Stmt,
        data: &mut BodyData,
    ) -> CodegenResult<()> {
        match &stmt.kind {
            StmtKind::Expr(e) => self.scan_expr(sem, e, data)?,
            StmtKind::Decl { entities, inits } => {
                for (i, &eid) in entities.iter().enumerate() {
                    if matches!(sem.entity(eid).kind, EntityKind::StaticLocal { .. }) {
                        let init = if inits.len() == entities.len() {
                            inits[i].value.as_ref()
                        } else {
                            None
                        };
                        self.define_static_local(sem, proc, eid, init)?;
                        data.statics.push(eid);
                    }
                }
                for init in inits {
                    self.scan_expr(sem, init, data)?;
                }
            }
            StmtKind::Assign { lhs, rhs, .. } => {
                for e in lhs.iter().chain(rhs) {
                    self.scan_expr(sem, e, data)?;
                }
            }
            StmtKind::Block { body, .. } => {
                for s in body {
                    self.scan_stmt(sem, proc, s, data)?;
                }
            }
            StmtKind::If {
                init,
                cond,
                then_body,
                else_stmt,
                ..
            } => {
                if let Some(s) = init {
                    self.scan_stmt(sem, proc, s, data)?;
                }
                self.scan_expr(sem, cond, data)?;
                for s in then_body {
                    self.scan_stmt(sem, proc, s, data)?;
                }
                if let Some(s) = else_stmt {
                    self.scan_stmt(sem, proc, s, data)?;
                }
            }
            StmtKind::For {
                init,
                cond,
                post,
                body,
                ..
            } => {
                if let Some(s) = init {
                    self.scan_stmt(sem, proc, s, data)?;
                }
                if let Some(e) = cond {
                    self.scan_expr(sem, e, data)?;
                }
                if let Some(s) = post {
                    self.scan_stmt(sem, proc, s, data)?;
                }
                for s in body {
                    self.scan_stmt(sem, proc, s, data)?;
                }
            }
            StmtKind::RangeInterval { lo, hi, body, .. } => {
                self.scan_expr(sem, lo, data)?;
                self.scan_expr(sem, hi, data)?;
                for s in body {
                    self.scan_stmt(sem, proc, s, data)?;
                }
            }
            StmtKind::RangeContainer {
                container, body, ..
            } => {
                self.scan_expr(sem, container, data)?;
                for s in body {
                    self.scan_stmt(sem, proc, s, data)?;
                }
            }
            StmtKind::Switch {
                init, tag, cases, ..
            } => {
                if let Some(s) = init {
                    self.scan_stmt(sem, proc, s, data)?;
                }
                if let Some(e) = tag {
                    self.scan_expr(sem, e, data)?;
                }
                for case in cases {
                    for v in &case.values {
                        match v {
                            CaseValue::Expr(e) => self.scan_expr(sem, e, data)?,
                            CaseValue::Range { lo, hi, .. } => {
                                self.scan_expr(sem, lo, data)?;
                                self.scan_expr(sem, hi, data)?;
                            }
                        }
                    }
                    for s in &case.body {
                        self.scan_stmt(sem, proc, s, data)?;
                    }
                }
            }
            StmtKind::Return { results } => {
                for e in results {
                    self.scan_expr(sem, e, data)?;
                }
            }
            StmtKind::Branch { .. } => {}
            StmtKind::Defer { stmt } => self.scan_stmt(sem, proc, stmt, data)?,
        }
        Ok(())
    }

    fn scan_expr(
        &mut self,
        sem: &CheckedModule,
        expr: &Expr,
        data: &mut BodyData,
    ) -> CodegenResult<()> {
        if let Some(v) = &expr.value {
            self.scan_const(v, data)?;
        }
        match &expr.kind {
            ExprKind::Binary { op, lhs, rhs } => {
                if matches!(op, keel_sem::BinOp::Eq | keel_sem::BinOp::NotEq) {
                    for side in [lhs.ty, rhs.ty] {
                        // fixed-array equality folds elementwise, so the
                        // element's routine is the one the body calls
                        let mut record_ty = sem.types.core(side);
                        while let TypeKind::Array { elem, .. } = sem.types.kind(record_ty) {
                            record_ty = sem.types.core(*elem);
                        }
                        if needs_equality_proc(&sem.types, record_ty) {
                            self.equality_proc(&sem.types, record_ty)?;
                            if !data.equal_types.contains(&record_ty) {
                                data.equal_types.push(record_ty);
                            }
                        }
                    }
                }
                self.scan_expr(sem, lhs, data)?;
                self.scan_expr(sem, rhs, data)?;
            }
            ExprKind::Unary { operand, .. }
            | ExprKind::Deref { base: operand }
            | ExprKind::AddressOf { base: operand }
            | ExprKind::Convert { operand }
            | ExprKind::Transmute { operand }
            | ExprKind::TypeAssert { operand, .. } => self.scan_expr(sem, operand, data)?,
            ExprKind::Call { callee, args } => {
                self.scan_expr(sem, callee, data)?;
                for a in args {
                    self.scan_expr(sem, a, data)?;
                }
            }
            ExprKind::Intrinsic { args, .. } => {
                for a in args {
                    self.scan_expr(sem, a, data)?;
                }
            }
            ExprKind::Index { base, index } => {
                self.scan_expr(sem, base, data)?;
                self.scan_expr(sem, index, data)?;
            }
            ExprKind::SliceExpr { base, lo, hi } => {
                self.scan_expr(sem, base, data)?;
                if let Some(e) = lo {
                    self.scan_expr(sem, e, data)?;
                }
                if let Some(e) = hi {
                    self.scan_expr(sem, e, data)?;
                }
            }
            ExprKind::Selector { base, .. } | ExprKind::Swizzle { base, .. } => {
                self.scan_expr(sem, base, data)?
            }
            ExprKind::ContextRef => {
                if data.context_ty.is_none() {
                    data.context_ty = Some(expr.ty);
                }
            }
            ExprKind::Lit | ExprKind::Ident(_) => {}
        }
        Ok(())
    }

    /// String payloads can sit at any depth of a folded aggregate.
    fn scan_const(&mut self, v: &ConstValue, data: &mut BodyData) -> CodegenResult<()> {
        match v {
            ConstValue::Str(s) => {
                self.intern_string(s.as_bytes())?;
                if !data.strings.contains(s) {
                    data.strings.push(s.clone());
                }
            }
            ConstValue::Aggregate(elems) => {
                for e in elems {
                    self.scan_const(e, data)?;
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Record comparisons that cannot be flat byte compares route through a
/// generated routine.
pub(crate) fn needs_equality_proc(types: &TypeTable, ty: TypeId) -> bool {
    let core = types.core(ty);
    if types.layout(core).simple_compare {
        return false;
    }
    matches!(
        types.kind(core),
        TypeKind::Struct {
            soa: keel_sem::SoaKind::None,
            ..
        } | TypeKind::Tuple { .. }
            | TypeKind::Union {
                maybe_pointer: false,
                ..
            }
    )
}

fn collect_nested(part: &CmpPart, out: &mut Vec<FuncId>) {
    match part {
        CmpPart::Nested { func, .. } => {
            if !out.contains(func) {
                out.push(*func);
            }
        }
        CmpPart::Elems { part, .. } => collect_nested(part, out),
        CmpPart::Union { variants, .. } => {
            for v in variants {
                collect_nested(v, out);
            }
        }
        _ => {}
    }
}

/// Emit one comparison part. Leaves the builder in a fresh block where
/// equality so far holds; inequality branches to `fail`.
fn emit_cmp_part(
    b: &mut ClifFunctionBuilder,
    target: TargetSpec,
    part: &CmpPart,
    lhs: Value,
    rhs: Value,
    fail: Block,
    refs: &EqRefs,
) -> CodegenResult<()> {
    match part {
        CmpPart::Scalar { offset, cl, float } => {
            let la = b.ins().load(*cl, MemFlags::new(), lhs, *offset as i32);
            let lb = b.ins().load(*cl, MemFlags::new(), rhs, *offset as i32);
            let eq = if *float {
                b.ins().fcmp(FloatCC::Equal, la, lb)
            } else {
                b.ins().icmp(IntCC::Equal, la, lb)
            };
            branch_on(b, eq, fail);
        }
        CmpPart::Str { offset } => {
            let word = target.ptr_ty;
            let off = *offset as i32;
            let ap = b.ins().load(word, MemFlags::new(), lhs, off);
            let alen = b
                .ins()
                .load(word, MemFlags::new(), lhs, off + target.ptr_bytes as i32);
            let bp = b.ins().load(word, MemFlags::new(), rhs, off);
            let blen = b
                .ins()
                .load(word, MemFlags::new(), rhs, off + target.ptr_bytes as i32);
            let call = b.ins().call(refs.string_eq, &[ap, alen, bp, blen]);
            let res = b.inst_results(call)[0];
            branch_on(b, res, fail);
        }
        CmpPart::Nested { offset, func } => {
            let func_ref = match refs.nested.get(func) {
                Some(&r) => r,
                None => return internal_error("nested equality routine was not imported"),
            };
            let la = b.ins().iadd_imm(lhs, *offset as i64);
            let lb = b.ins().iadd_imm(rhs, *offset as i64);
            let call = b.ins().call(func_ref, &[la, lb]);
            let res = b.inst_results(call)[0];
            branch_on(b, res, fail);
        }
        CmpPart::Bytes { offset, len } => {
            if *len == 0 {
                return Ok(());
            }
            let la = b.ins().iadd_imm(lhs, *offset as i64);
            let lb = b.ins().iadd_imm(rhs, *offset as i64);
            let n = b.ins().iconst(types::I64, *len as i64);
            let call = b.ins().call(refs.memory_equal, &[la, lb, n]);
            let res = b.inst_results(call)[0];
            branch_on(b, res, fail);
        }
        CmpPart::Elems {
            offset,
            len,
            stride,
            part,
        } => {
            let word = target.ptr_ty;
            let head = b.create_block();
            b.append_block_param(head, word);
            let body = b.create_block();
            let cont = b.create_block();

            let zero = b.ins().iconst(word, 0);
            b.ins().jump(head, &[zero]);

            b.switch_to_block(head);
            let idx = b.block_params(head)[0];
            let n = b.ins().iconst(word, *len as i64);
            let done = b.ins().icmp(IntCC::Equal, idx, n);
            b.ins().brif(done, cont, &[], body, &[]);

            b.switch_to_block(body);
            let scaled = b.ins().imul_imm(idx, *stride as i64);
            let la = b.ins().iadd(lhs, scaled);
            let la = b.ins().iadd_imm(la, *offset as i64);
            let lb = b.ins().iadd(rhs, scaled);
            let lb = b.ins().iadd_imm(lb, *offset as i64);
            emit_cmp_part(b, target, part, la, lb, fail, refs)?;
            let next = b.ins().iadd_imm(idx, 1);
            b.ins().jump(head, &[next]);

            b.switch_to_block(cont);
        }
        CmpPart::Union {
            offset,
            tag_offset,
            tag_cl,
            variants,
        } => {
            let tag_at = (*offset + *tag_offset) as i32;
            let ta = b.ins().load(*tag_cl, MemFlags::new(), lhs, tag_at);
            let tb = b.ins().load(*tag_cl, MemFlags::new(), rhs, tag_at);
            let same = b.ins().icmp(IntCC::Equal, ta, tb);
            branch_on(b, same, fail);

            let cont = b.create_block();
            for (i, variant) in variants.iter().enumerate() {
                let case = b.create_block();
                let next = b.create_block();
                // tag 0 is nil; variants count from 1
                let hit = b.ins().icmp_imm(IntCC::Equal, ta, i as i64 + 1);
                b.ins().brif(hit, case, &[], next, &[]);
                b.switch_to_block(case);
                emit_cmp_part(b, target, variant, lhs, rhs, fail, refs)?;
                b.ins().jump(cont, &[]);
                b.switch_to_block(next);
            }
            // nil tag on both sides: equal
            b.ins().jump(cont, &[]);
            b.switch_to_block(cont);
        }
    }
    Ok(())
}

/// Continue in a fresh block while `cond` holds, else jump to `fail`.
fn branch_on(b: &mut ClifFunctionBuilder, cond: Value, fail: Block) {
    let cont = b.create_block();
    b.ins().brif(cond, cont, &[], fail, &[]);
    b.switch_to_block(cont);
}

/// Write the low `size` bytes of `v` in the given order.
fn write_int(v: i128, size: usize, little: bool, out: &mut [u8]) {
    let le = v.to_le_bytes();
    if little {
        out.copy_from_slice(&le[..size]);
    } else {
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = le[size - 1 - i];
        }
    }
}

/// Byte order a scalar of this type is stored with.
fn store_little(types: &TypeTable, ty: TypeId) -> bool {
    match *types.kind(types.core(ty)) {
        TypeKind::Int { endian, .. } | TypeKind::Float { endian, .. } => match endian {
            Endian::Native => types.little_endian(),
            Endian::Little => true,
            Endian::Big => false,
        },
        _ => types.little_endian(),
    }
}
