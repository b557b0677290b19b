//! Scope stack and symbol table (§3 Scope, Symbol-table entry; §4.2 Scope
//! management; §9 two-pass address assignment).

use crate::common::{Id, Map};
use crate::front::ast::{NodeId, TypeSpec};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ScopeId(pub u32);

#[derive(Clone, Debug)]
pub struct ScopeVar {
    pub name: Id,
    pub decl: NodeId,
    pub stack_offset: i32,
    pub ty: TypeSpec,
}

/// A single lexical scope (§3). Scopes are strictly nested: a scope is
/// released (popped off the active stack) when its parser block/function
/// body ends, though the arena entry itself survives for later inspection.
#[derive(Clone, Debug)]
pub struct Scope {
    pub id: ScopeId,
    pub parent: Option<ScopeId>,
    pub vars: Vec<ScopeVar>,
    pub stack_cursor: i32,
    pub is_function_scope: bool,
    pub is_block_scope: bool,
}

impl Scope {
    fn find(&self, name: Id) -> Option<&ScopeVar> {
        self.vars.iter().find(|v| v.name == name)
    }
}

/// Outcome of declaring a variable in the current scope (§4.2, §7).
pub enum Declare {
    Ok(i32),
    /// Redeclaration in the same scope: a warning, the new declaration is
    /// dropped, and the *original* stack offset is returned.
    Redeclared(i32),
}

/// The nested stack of active scopes, from innermost to global (§3 Scope
/// chain, §4.2).
pub struct ScopeStack {
    arena: Vec<Scope>,
    active: Vec<ScopeId>,
}

impl ScopeStack {
    pub fn new() -> Self {
        let global = Scope {
            id: ScopeId(0),
            parent: None,
            vars: Vec::new(),
            stack_cursor: 0,
            is_function_scope: false,
            is_block_scope: false,
        };
        ScopeStack { arena: vec![global], active: vec![ScopeId(0)] }
    }

    pub fn depth(&self) -> usize {
        self.active.len()
    }

    fn top_id(&self) -> ScopeId {
        *self.active.last().expect("scope stack underflow: global scope popped")
    }

    pub fn top(&self) -> &Scope {
        &self.arena[self.top_id().0 as usize]
    }

    fn push(&mut self, is_function_scope: bool, is_block_scope: bool) -> ScopeId {
        let parent = self.top_id();
        let id = ScopeId(self.arena.len() as u32);
        self.arena.push(Scope {
            id,
            parent: Some(parent),
            vars: Vec::new(),
            stack_cursor: 0,
            is_function_scope,
            is_block_scope,
        });
        self.active.push(id);
        id
    }

    pub fn enter_function(&mut self) -> ScopeId {
        self.push(true, false)
    }

    pub fn enter_block(&mut self) -> ScopeId {
        self.push(false, true)
    }

    /// Pop the innermost active scope. Panics if called more times than
    /// scopes were entered (a parser bug, not a user-facing error): net-zero
    /// scope depth is a hard invariant (§3, §8).
    pub fn exit(&mut self) {
        if self.active.len() <= 1 {
            panic!("scope stack underflow: attempted to exit the global scope");
        }
        self.active.pop();
    }

    /// Declare a variable in the top scope, receiving a stack offset
    /// incremented by 8 per variable (function/block scopes only, §4.2).
    pub fn declare(&mut self, name: Id, decl: NodeId, ty: TypeSpec) -> Declare {
        let top = self.top_id();
        let scope = &mut self.arena[top.0 as usize];
        if let Some(existing) = scope.find(name) {
            return Declare::Redeclared(existing.stack_offset);
        }
        let offset = if scope.is_function_scope || scope.is_block_scope {
            let o = scope.stack_cursor;
            scope.stack_cursor += 8;
            o
        } else {
            0
        };
        scope.vars.push(ScopeVar { name, decl, stack_offset: offset, ty });
        Declare::Ok(offset)
    }

    /// Walk the scope chain from top to global looking for `name` (§4.2).
    pub fn lookup(&self, name: Id) -> Option<&ScopeVar> {
        let mut cur = Some(self.top_id());
        while let Some(id) = cur {
            let scope = &self.arena[id.0 as usize];
            if let Some(found) = scope.find(name) {
                return Some(found);
            }
            cur = scope.parent;
        }
        None
    }
}

impl Default for ScopeStack {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SymbolKind {
    Function,
    Variable,
    Identifier,
}

#[derive(Clone, Debug)]
pub struct Symbol {
    pub name: Id,
    pub kind: SymbolKind,
    pub decl: NodeId,
    pub address: Option<i64>,
    /// The symbol's declared type: a variable's declared type, or a
    /// function's return type (§4.3 return-type/identifier resolution).
    pub ty: TypeSpec,
}

/// The flat, append-only symbol table (§3). Addresses are *not* assigned at
/// insertion time (insertion-order synthesis is brittle, §9): they are
/// computed once, in a second pass, by [`SymbolTable::assign_addresses`].
#[derive(Clone, Debug, Default)]
pub struct SymbolTable {
    entries: Vec<Symbol>,
    by_name: Map<Id, Vec<usize>>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: Id, kind: SymbolKind, decl: NodeId, ty: TypeSpec) -> usize {
        let idx = self.entries.len();
        self.entries.push(Symbol { name, kind, decl, address: None, ty });
        self.by_name.entry(name).or_default().push(idx);
        idx
    }

    pub fn lookup(&self, name: Id) -> Option<&Symbol> {
        self.by_name.get(&name).and_then(|idxs| idxs.last()).map(|&i| &self.entries[i])
    }

    pub fn lookup_kind(&self, name: Id, kind: SymbolKind) -> Option<&Symbol> {
        self.by_name.get(&name).and_then(|idxs| {
            idxs.iter().rev().map(|&i| &self.entries[i]).find(|s| s.kind == kind)
        })
    }

    pub fn entries(&self) -> &[Symbol] {
        &self.entries
    }

    /// Two-pass address assignment (§3 invariants, §9): every symbol is
    /// declared first (during parsing); addresses are computed here, once,
    /// at the lowering boundary, as `offset + index * size` where `index` is
    /// the symbol's position among symbols of the same kind.
    pub fn assign_addresses(
        &mut self,
        function_offset: i64,
        function_size: i64,
        variable_offset: i64,
        variable_size: i64,
    ) {
        let mut next_fn = 0i64;
        let mut next_var = 0i64;
        for entry in &mut self.entries {
            match entry.kind {
                SymbolKind::Function => {
                    entry.address = Some(function_offset + next_fn * function_size);
                    next_fn += 1;
                }
                SymbolKind::Variable | SymbolKind::Identifier => {
                    entry.address = Some(variable_offset + next_var * variable_size);
                    next_var += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::intern;

    fn nid(n: u32) -> NodeId {
        NodeId(n)
    }

    fn i64_ty() -> TypeSpec {
        TypeSpec::Int(crate::front::ast::IntWidth::I64)
    }

    #[test]
    fn scope_depth_is_net_zero_after_balanced_enter_exit() {
        let mut scopes = ScopeStack::new();
        assert_eq!(scopes.depth(), 1); // global
        scopes.enter_function();
        scopes.enter_block();
        assert_eq!(scopes.depth(), 3);
        scopes.exit();
        scopes.exit();
        assert_eq!(scopes.depth(), 1);
    }

    #[test]
    fn declare_assigns_offsets_incrementing_by_8() {
        let mut scopes = ScopeStack::new();
        scopes.enter_function();
        let a = scopes.declare(intern("a"), nid(1), i64_ty());
        let b = scopes.declare(intern("b"), nid(2), i64_ty());
        assert!(matches!(a, Declare::Ok(0)));
        assert!(matches!(b, Declare::Ok(8)));
    }

    #[test]
    fn redeclaration_in_same_scope_is_reported_and_dropped() {
        let mut scopes = ScopeStack::new();
        scopes.enter_function();
        let a = scopes.declare(intern("a"), nid(1), i64_ty());
        let a2 = scopes.declare(intern("a"), nid(2), i64_ty());
        assert!(matches!(a, Declare::Ok(0)));
        match a2 {
            Declare::Redeclared(offset) => assert_eq!(offset, 0),
            Declare::Ok(_) => panic!("expected redeclaration to be detected"),
        }
        assert_eq!(scopes.top().vars.len(), 1);
    }

    #[test]
    fn lookup_walks_the_scope_chain_outward() {
        let mut scopes = ScopeStack::new();
        scopes.declare(intern("g"), nid(0), i64_ty());
        scopes.enter_function();
        scopes.declare(intern("a"), nid(1), i64_ty());
        scopes.enter_block();
        scopes.declare(intern("b"), nid(2), i64_ty());
        assert!(scopes.lookup(intern("b")).is_some());
        assert!(scopes.lookup(intern("a")).is_some());
        assert!(scopes.lookup(intern("g")).is_some());
        assert!(scopes.lookup(intern("nope")).is_none());
    }

    #[test]
    fn address_assignment_is_linear_in_insertion_order() {
        let mut table = SymbolTable::new();
        let f = intern("f");
        let g = intern("g");
        table.insert(f, SymbolKind::Function, nid(0), i64_ty());
        table.insert(g, SymbolKind::Function, nid(1), i64_ty());
        table.assign_addresses(0x1000, 16, 0x2000, 8);
        let addr_f = table.lookup(f).unwrap().address.unwrap();
        let addr_g = table.lookup(g).unwrap().address.unwrap();
        // address(F) - address(G) = (index(F) - index(G)) * function_size (§8)
        assert_eq!(addr_f - addr_g, -16);
    }
}
