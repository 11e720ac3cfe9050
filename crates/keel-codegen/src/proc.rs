// SPDX-License-Identifier: (MIT OR Apache-2.0)

//! Per-procedure lowering state and driver.
//!
//! One `ProcLowering` exists per procedure body and is dropped when the
//! body is defined. It owns the function builder plus the four stacks
//! the statement walk maintains: lexical scopes, pending defers, the
//! innermost-first branch target list, and labeled construct regions.
//! Everything module-wide arrives read-only through [`ProcRefs`].

use cranelift::prelude::*;
use cranelift_frontend::FunctionBuilder as ClifFunctionBuilder;
use std::collections::HashMap;

use keel_sem::{CheckedModule, EntityId, Label, Procedure, SemError, StateFlags, Stmt};

use crate::module::{ProcRefs, TargetSpec};
use crate::value::{register_ty, Addr, Value as KValue};
use crate::{internal_error, CodegenResult};

/// Why a defer chain is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeferExit {
    /// Natural end of the current scope.
    Default,
    /// Return path: every live defer runs.
    Return,
    /// Branch out to a construct at the given scope depth; defers
    /// registered at or inside that depth run.
    Branch { to_scope: usize },
}

pub(crate) struct DeferEntry<'a> {
    pub scope_index: usize,
    pub stmt: &'a Stmt,
}

/// One entry of the branch target list. Innermost last.
pub(crate) struct TargetEntry {
    pub break_region: Option<Block>,
    pub continue_region: Option<Block>,
    pub fallthrough_region: Option<Block>,
    /// Labeled blocks park here; unlabeled branch resolution skips
    /// them, labeled resolution finds them through `branch_regions`.
    pub is_block: bool,
    /// Scope depth of the construct itself (not its body).
    pub scope_index: usize,
}

/// Regions of a labeled construct, for `break label`/`continue label`.
pub(crate) struct BranchRegion {
    pub label: Label,
    pub break_region: Block,
    pub continue_region: Option<Block>,
    pub scope_index: usize,
}

/// How one declared result leaves the procedure.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ResultBinding {
    pub entity: EntityId,
    /// Written through a trailing out-pointer parameter instead of
    /// returned in a register.
    pub by_out: bool,
}

pub(crate) struct ProcLowering<'a> {
    pub(crate) b: ClifFunctionBuilder<'a>,
    pub(crate) sem: &'a CheckedModule,
    pub(crate) proc: &'a Procedure,
    pub(crate) target: TargetSpec,
    pub(crate) refs: &'a ProcRefs,

    /// Entity -> storage for params, results and locals of this body.
    pub(crate) slots: HashMap<EntityId, Addr>,
    /// Defer-stack start mark per open scope.
    pub(crate) scopes: Vec<usize>,
    pub(crate) defers: Vec<DeferEntry<'a>>,
    pub(crate) targets: Vec<TargetEntry>,
    pub(crate) branch_regions: Vec<BranchRegion>,
    pub(crate) results: Vec<ResultBinding>,
    /// Check flags active at the current statement, post-merge.
    pub(crate) flags: StateFlags,
    /// The current region already ended in a terminator.
    pub(crate) terminated: bool,
}

impl<'a> ProcLowering<'a> {
    pub(crate) fn new(
        builder: ClifFunctionBuilder<'a>,
        sem: &'a CheckedModule,
        proc: &'a Procedure,
        target: TargetSpec,
        refs: &'a ProcRefs,
    ) -> ProcLowering<'a> {
        ProcLowering {
            b: builder,
            sem,
            proc,
            target,
            refs,
            slots: HashMap::new(),
            scopes: Vec::new(),
            defers: Vec::new(),
            targets: Vec::new(),
            branch_regions: Vec::new(),
            results: Vec::new(),
            flags: StateFlags::INHERIT,
            terminated: false,
        }
    }

    /// Lower the whole body and finalize the function.
    pub(crate) fn run(mut self) -> CodegenResult<()> {
        let entry = self.b.create_block();
        self.b.append_block_params_for_function_params(entry);
        self.b.switch_to_block(entry);

        self.scope_open();
        self.bind_params(entry)?;

        let proc = self.proc;
        self.build_stmt_list(&proc.body)?;

        if !self.terminated {
            if self.proc.sig.results.is_empty() || self.proc.sig.named_results {
                self.emit_return(Vec::new())?;
            } else {
                // the checker rejects value-returning bodies that can
                // fall off the end; a trap keeps the region well formed
                self.b.ins().trap(TrapCode::user(1).unwrap());
                self.terminated = true;
            }
        }
        self.scope_discard();

        self.b.seal_all_blocks();
        self.b.finalize();
        Ok(())
    }

    /// Bind parameter and result entities to storage. Scalars get stack
    /// homes so address-of works uniformly; aggregates already arrive
    /// by address. Aggregate results bind to the caller's out pointers.
    fn bind_params(&mut self, entry: Block) -> CodegenResult<()> {
        let sem = self.sem;
        let proc = self.proc;
        let edges: Vec<Value> = self.b.block_params(entry).to_vec();
        let mut next = 0usize;

        for &eid in &proc.sig.params {
            let ent = sem.entity(eid);
            let edge = match edges.get(next) {
                Some(&e) => e,
                None => return internal_error("parameter count disagrees with signature"),
            };
            next += 1;
            let addr = if register_ty(&sem.types, self.target.ptr_ty, ent.ty).is_some() {
                let slot = self.alloc_local(ent.ty, false)?;
                self.addr_store(&slot, KValue::register(edge, ent.ty))?;
                slot
            } else {
                Addr::plain(KValue::address(edge, ent.ty))
            };
            self.slots.insert(eid, addr);
        }

        for &rid in &proc.sig.results {
            let ent = sem.entity(rid);
            if sem.types.is_void(ent.ty) {
                continue;
            }
            let by_out = register_ty(&sem.types, self.target.ptr_ty, ent.ty).is_none();
            let addr = if by_out {
                let edge = match edges.get(next) {
                    Some(&e) => e,
                    None => return internal_error("missing out-pointer for aggregate result"),
                };
                next += 1;
                Addr::plain(KValue::address(edge, ent.ty))
            } else {
                // zeroed so named results read as their zero value
                // before the first assignment
                self.alloc_local(ent.ty, true)?
            };
            self.slots.insert(rid, addr);
            self.results.push(ResultBinding {
                entity: rid,
                by_out,
            });
        }
        Ok(())
    }

    /// Storage bound to an entity in this body.
    pub(crate) fn entity_slot(&self, eid: EntityId) -> CodegenResult<Addr> {
        match self.slots.get(&eid) {
            Some(a) => Ok(a.clone()),
            None => Err(SemError::UnboundEntity(eid).into()),
        }
    }

    // ─── Regions ────────────────────────────────────────────────

    pub(crate) fn new_region(&mut self) -> Block {
        self.b.create_block()
    }

    pub(crate) fn switch_region(&mut self, region: Block) {
        self.b.switch_to_block(region);
        self.terminated = false;
    }

    /// Jump unless the current region already ended.
    pub(crate) fn goto_region(&mut self, region: Block) {
        if !self.terminated {
            self.b.ins().jump(region, &[]);
            self.terminated = true;
        }
    }

    pub(crate) fn iconst_word(&mut self, v: i64) -> Value {
        self.b.ins().iconst(self.target.ptr_ty, v)
    }

    // ─── Scopes and defers ──────────────────────────────────────

    pub(crate) fn scope_open(&mut self) {
        self.scopes.push(self.defers.len());
    }

    /// Close the current scope, running its defers in reverse unless
    /// the region already ended (a branch or return ran them).
    pub(crate) fn scope_close(&mut self) -> CodegenResult<()> {
        self.emit_defers(DeferExit::Default)?;
        self.scope_discard();
        Ok(())
    }

    /// Pop scope state without emitting anything.
    pub(crate) fn scope_discard(&mut self) {
        if let Some(mark) = self.scopes.pop() {
            self.defers.truncate(mark);
        }
    }

    /// Scope depth for constructs pushed right now.
    pub(crate) fn scope_depth(&self) -> usize {
        self.scopes.len()
    }

    pub(crate) fn register_defer(&mut self, stmt: &'a Stmt) {
        let scope_index = self.scopes.len().saturating_sub(1);
        self.defers.push(DeferEntry { scope_index, stmt });
    }

    /// Run pending defer statements for one exit kind, innermost first.
    /// The stack itself is untouched; scope close truncates separately.
    pub(crate) fn emit_defers(&mut self, exit: DeferExit) -> CodegenResult<()> {
        if self.terminated {
            return Ok(());
        }
        let cut = match exit {
            DeferExit::Default => self.scopes.last().copied().unwrap_or(0),
            DeferExit::Return => 0,
            DeferExit::Branch { to_scope } => self
                .defers
                .iter()
                .position(|d| d.scope_index >= to_scope)
                .unwrap_or(self.defers.len()),
        };
        let pending: Vec<&'a Stmt> = self.defers[cut..].iter().map(|d| d.stmt).collect();
        for stmt in pending.into_iter().rev() {
            self.build_stmt(stmt)?;
        }
        Ok(())
    }

    // ─── Returns ────────────────────────────────────────────────

    /// Store results, run the full defer chain, and return. Results
    /// land in their slots before defers run, so a defer that writes a
    /// named result changes what the caller sees.
    pub(crate) fn emit_return(&mut self, results: Vec<KValue>) -> CodegenResult<()> {
        if !results.is_empty() {
            if results.len() != self.results.len() {
                return internal_error(format!(
                    "return provides {} values for {} results",
                    results.len(),
                    self.results.len()
                ));
            }
            let bindings = self.results.clone();
            for (binding, value) in bindings.iter().zip(results) {
                let result_ty = self.sem.entity(binding.entity).ty;
                let converted = self.convert_value(value, result_ty)?;
                let slot = self.entity_slot(binding.entity)?;
                self.addr_store(&slot, converted)?;
            }
        }

        self.emit_defers(DeferExit::Return)?;

        let bindings = self.results.clone();
        let mut ret_vals = Vec::new();
        for binding in &bindings {
            if binding.by_out {
                continue;
            }
            let slot = self.entity_slot(binding.entity)?;
            let loaded = self.addr_load(&slot)?;
            ret_vals.push(loaded.as_register()?);
        }
        self.b.ins().return_(&ret_vals);
        self.terminated = true;
        Ok(())
    }
}
