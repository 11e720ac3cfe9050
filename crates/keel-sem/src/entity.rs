// SPDX-License-Identifier: (MIT OR Apache-2.0)

//! Entities: the checker's resolved bindings for every identifier.

use crate::ast::Stmt;
use crate::types::TypeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcedureId(pub u32);

/// What an identifier resolved to.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityKind {
    /// Procedure-local variable slot.
    Local,
    /// Local with static storage duration; lowered to module data with
    /// a per-procedure mangled name. `thread_local` selects the TLS
    /// section.
    StaticLocal { thread_local: bool },
    Param { index: usize },
    /// Named result slot; zero-expression returns load these.
    Result { index: usize },
    /// Module-level variable, emitted as a data symbol.
    Global { mutable: bool, thread_local: bool },
    /// Another procedure, referenced by symbol.
    Proc(ProcedureId),
    /// Compile-time constant; never has storage.
    Constant(crate::ConstValue),
}

#[derive(Debug, Clone)]
pub struct Entity {
    pub name: String,
    pub ty: TypeId,
    pub kind: EntityKind,
}

/// Procedure signature in checker terms. Multiple results are the
/// source of `Multi` values downstream.
#[derive(Debug, Clone, Default)]
pub struct Signature {
    pub params: Vec<EntityId>,
    pub results: Vec<EntityId>,
    /// True when results are named and addressable inside the body.
    pub named_results: bool,
}

/// One fully checked procedure body, ready for lowering.
#[derive(Debug, Clone)]
pub struct Procedure {
    pub name: String,
    pub sig: Signature,
    pub body: Vec<Stmt>,
    /// Link-name override for foreign/exported procedures.
    pub link_name: Option<String>,
}

/// The checker's complete output for one compilation unit.
#[derive(Debug)]
pub struct CheckedModule {
    pub types: crate::TypeTable,
    pub entities: Vec<Entity>,
    pub procs: Vec<Procedure>,
    /// Module-level variables to emit as data symbols, with optional
    /// folded initializers.
    pub globals: Vec<(EntityId, Option<crate::ConstValue>)>,
}

impl CheckedModule {
    pub fn new(types: crate::TypeTable) -> Self {
        CheckedModule {
            types,
            entities: Vec::new(),
            procs: Vec::new(),
            globals: Vec::new(),
        }
    }

    pub fn add_entity(&mut self, entity: Entity) -> EntityId {
        let id = EntityId(self.entities.len() as u32);
        self.entities.push(entity);
        id
    }

    pub fn entity(&self, id: EntityId) -> &Entity {
        &self.entities[id.0 as usize]
    }

    pub fn add_proc(&mut self, proc: Procedure) -> ProcedureId {
        let id = ProcedureId(self.procs.len() as u32);
        self.procs.push(proc);
        id
    }

    pub fn proc(&self, id: ProcedureId) -> &Procedure {
        &self.procs[id.0 as usize]
    }
}
