//! AST to IR lowering (§4.4).
//!
//! Each function body lowers independently; local variable storage is
//! assigned stack offsets on first sight, incrementing by 8 bytes per
//! variable regardless of declared width (matching the parser's own scope
//! accounting, §4.2) so later phases share one convention.

use crate::common::{intern, Id, Map};
use crate::front::ast::{Ast, BOp, Case, CaseValue, NodeId, NodeKind, UOp};
use crate::front::parse::BUILTINS;
use crate::middle::ir::{IrFunction, IrId, IrOp, IrProgram, ValueId};
use crate::middle::types::{binary_result_type, Ty};

struct FnLowering<'a> {
    ast: &'a Ast,
    f: IrFunction,
    locals: Map<Id, (i32, Ty)>,
    globals: &'a Map<Id, Ty>,
    fn_rets: &'a Map<Id, Ty>,
    next_offset: i32,
    /// Per-enclosing-loop/switch list of `break`'s `Jump` instruction ids,
    /// patched to the end label once that construct finishes lowering.
    break_jumps: Vec<Vec<IrId>>,
    continue_targets: Vec<IrId>,
}

impl<'a> FnLowering<'a> {
    /// Record (or look up) a local's stack offset and real declared type, so
    /// `Ident` loads can be tagged with something other than a hardcoded
    /// `Ty::I64` (§4.3).
    fn declare_local(&mut self, name: Id, ty: Ty) -> i32 {
        if let Some(&(offset, _)) = self.locals.get(&name) {
            return offset;
        }
        let offset = self.next_offset;
        self.next_offset += 8;
        self.locals.insert(name, (offset, ty));
        offset
    }

    fn lower_stmt(&mut self, id: NodeId) {
        match self.ast.kind(id).clone() {
            NodeKind::Block { stmts } => {
                for s in stmts {
                    self.lower_stmt(s);
                }
            }
            NodeKind::Variable { name, ty, init } => {
                let offset = self.declare_local(name, Ty::from_spec(&ty));
                if let Some(init_id) = init {
                    let v = self.lower_expr(init_id);
                    self.f.push(IrOp::StoreLocal { offset, value: v }, Ty::U0);
                }
            }
            NodeKind::If { cond, then_branch, else_branch } => {
                let c = self.lower_expr(cond);
                let branch_at = self.f.push(
                    IrOp::Branch { cond: c, then_target: IrId(0), else_target: IrId(0) },
                    Ty::U0,
                );
                let then_label = self.f.label();
                self.lower_stmt(then_branch);
                let end_jump = self.f.push(IrOp::Jump(IrId(0)), Ty::U0);
                let else_label = self.f.label();
                if let Some(e) = else_branch {
                    self.lower_stmt(e);
                }
                let end_label = self.f.label();
                self.patch_branch(branch_at, then_label, else_label);
                self.patch_jump(end_jump, end_label);
            }
            NodeKind::While { cond, body } => {
                let head = self.f.label();
                let c = self.lower_expr(cond);
                let branch_at = self.f.push(
                    IrOp::Branch { cond: c, then_target: IrId(0), else_target: IrId(0) },
                    Ty::U0,
                );
                let body_label = self.f.label();
                self.break_jumps.push(Vec::new());
                self.continue_targets.push(head);
                self.lower_stmt(body);
                self.f.push(IrOp::Jump(head), Ty::U0);
                let end_label = self.f.label();
                self.patch_branch(branch_at, body_label, end_label);
                self.continue_targets.pop();
                self.patch_breaks(end_label);
            }
            NodeKind::DoWhile { body, cond } => {
                let head = self.f.label();
                self.break_jumps.push(Vec::new());
                self.continue_targets.push(head);
                self.lower_stmt(body);
                let c = self.lower_expr(cond);
                let end_label_slot = self.f.push(
                    IrOp::Branch { cond: c, then_target: head, else_target: IrId(0) },
                    Ty::U0,
                );
                let end_label = self.f.label();
                self.patch_branch_else(end_label_slot, end_label);
                self.continue_targets.pop();
                self.patch_breaks(end_label);
            }
            NodeKind::For { init, cond, step, body } => {
                if let Some(i) = init {
                    self.lower_stmt(i);
                }
                let head = self.f.label();
                let branch_at = cond.map(|c| {
                    let v = self.lower_expr(c);
                    self.f.push(IrOp::Branch { cond: v, then_target: IrId(0), else_target: IrId(0) }, Ty::U0)
                });
                let body_label = self.f.label();
                self.break_jumps.push(Vec::new());
                let continue_label_placeholder = IrId(0);
                self.continue_targets.push(continue_label_placeholder);
                self.lower_stmt(body);
                let step_label = self.f.label();
                if let Some(s) = step {
                    self.lower_expr(s);
                }
                self.f.push(IrOp::Jump(head), Ty::U0);
                let end_label = self.f.label();
                if let Some(b) = branch_at {
                    self.patch_branch(b, body_label, end_label);
                }
                *self.continue_targets.last_mut().unwrap() = step_label;
                self.continue_targets.pop();
                self.patch_breaks(end_label);
            }
            NodeKind::Switch { scrutinee, cases, default, nobounds, start_block, end_block } => {
                if let Some(sb) = start_block {
                    for s in sb {
                        self.lower_stmt(s);
                    }
                }
                let scrut = self.lower_expr(scrutinee);
                let switch_at = self.f.push(
                    IrOp::Switch { scrutinee: scrut, targets: Vec::new(), default: IrId(0), nobounds },
                    Ty::U0,
                );
                self.break_jumps.push(Vec::new());
                let mut targets = Vec::new();
                for Case { value, body } in cases {
                    let label = self.f.label();
                    match value {
                        CaseValue::Single(n) => {
                            if let NodeKind::IntLit { value, .. } = self.ast.kind(n) {
                                targets.push((*value, label));
                            }
                        }
                        CaseValue::Range(lo, hi) => {
                            if let (NodeKind::IntLit { value: lo_v, .. }, NodeKind::IntLit { value: hi_v, .. }) =
                                (self.ast.kind(lo), self.ast.kind(hi))
                            {
                                for v in *lo_v..=*hi_v {
                                    targets.push((v, label));
                                }
                            }
                        }
                        CaseValue::Null => {}
                    }
                    for s in body {
                        self.lower_stmt(s);
                    }
                }
                let default_label = self.f.label();
                if let Some(d) = default {
                    for s in d {
                        self.lower_stmt(s);
                    }
                }
                if let Some(eb) = end_block {
                    for s in eb {
                        self.lower_stmt(s);
                    }
                }
                let end_label = self.f.label();
                if let IrOp::Switch { targets: t, default: d, .. } = &mut self.f.instrs[switch_at.0 as usize].op {
                    *t = targets;
                    *d = default_label;
                }
                self.patch_breaks(end_label);
            }
            NodeKind::Break => {
                let jump = self.f.push(IrOp::Jump(IrId(0)), Ty::U0);
                if let Some(slot) = self.break_jumps.last_mut() {
                    slot.push(jump);
                }
            }
            NodeKind::Continue => {
                if let Some(target) = self.continue_targets.last() {
                    self.f.push(IrOp::Jump(*target), Ty::U0);
                }
            }
            NodeKind::Return { value } => {
                let v = value.map(|n| self.lower_expr(n));
                self.f.push(IrOp::Return(v), Ty::U0);
            }
            NodeKind::Label { .. } => {
                self.f.label();
            }
            NodeKind::Try { body, catch_body } => {
                self.lower_stmt(body);
                if let Some(c) = catch_body {
                    self.lower_stmt(c);
                }
            }
            NodeKind::Throw { value } => {
                self.lower_expr(value);
                self.f.push(IrOp::Unreachable, Ty::U0);
            }
            NodeKind::AsmBlock { .. } => {
                // Inline asm is opaque to the IR; codegen reads it directly
                // from the AST node at emission time (§4.5).
            }
            _ => {
                self.lower_expr(id);
            }
        }
    }

    /// Patch every `break` jump recorded for the innermost loop/switch to
    /// the construct's end label, now that it exists (§4.4).
    fn patch_breaks(&mut self, end_label: IrId) {
        let jumps = self.break_jumps.pop().unwrap_or_default();
        for id in jumps {
            self.patch_jump(id, end_label);
        }
    }

    fn patch_jump(&mut self, at: IrId, target: IrId) {
        if let IrOp::Jump(t) = &mut self.f.instrs[at.0 as usize].op {
            *t = target;
        }
    }

    fn patch_branch(&mut self, at: IrId, then_target: IrId, else_target: IrId) {
        if let IrOp::Branch { then_target: t, else_target: e, .. } = &mut self.f.instrs[at.0 as usize].op {
            *t = then_target;
            *e = else_target;
        }
    }

    fn patch_branch_else(&mut self, at: IrId, else_target: IrId) {
        if let IrOp::Branch { else_target: e, .. } = &mut self.f.instrs[at.0 as usize].op {
            *e = else_target;
        }
    }

    fn lower_expr(&mut self, id: NodeId) -> ValueId {
        match self.ast.kind(id).clone() {
            NodeKind::IntLit { value, .. } => self.f.push(IrOp::ConstInt(value), Ty::I64),
            NodeKind::FloatLit { value } => self.f.push(IrOp::ConstFloat(value.to_bits()), Ty::F64),
            NodeKind::StringLit { value } => self.f.push(IrOp::ConstString(value), Ty::String),
            NodeKind::CharLit { value, .. } => self.f.push(IrOp::ConstInt(value as i64), Ty::I64),
            NodeKind::Ident { name } => {
                if let Some(&(offset, ref ty)) = self.locals.get(&name) {
                    let ty = ty.clone();
                    self.f.push(IrOp::LoadLocal { offset }, ty)
                } else {
                    let ty = self.globals.get(&name).cloned().unwrap_or(Ty::I64);
                    self.f.push(IrOp::LoadGlobal { name }, ty)
                }
            }
            NodeKind::Binary { op, lhs, rhs } => {
                let l = self.lower_expr(lhs);
                let r = self.lower_expr(rhs);
                if matches!(op, BOp::Comma) {
                    // Sequencing, not arithmetic (§4.2): `l` is already
                    // pushed for its side effects and discarded here.
                    return r;
                }
                let is_cmp = matches!(op, BOp::Eq | BOp::Ne | BOp::Lt | BOp::Le | BOp::Gt | BOp::Ge);
                // Mirrors `TypeChecker`'s own result-type rule (§4.3): a
                // comparison always yields `Bool`; everything else promotes
                // by `binary_result_type` so codegen can tell a float result
                // from an integer one off this tag alone.
                let lty = self.f.get(l).ty.clone();
                let rty = self.f.get(r).ty.clone();
                let result_ty = if is_cmp { Ty::Bool } else { binary_result_type(&lty, &rty) };
                let op = match op {
                    BOp::Add => IrOp::Add(l, r),
                    BOp::Sub => IrOp::Sub(l, r),
                    BOp::Mul => IrOp::Mul(l, r),
                    BOp::Div => IrOp::Div(l, r),
                    BOp::Mod => IrOp::Mod(l, r),
                    BOp::Shl => IrOp::Shl(l, r),
                    BOp::Shr => IrOp::Shr(l, r),
                    BOp::BitAnd | BOp::LogAnd => IrOp::BitAnd(l, r),
                    BOp::BitOr | BOp::LogOr => IrOp::BitOr(l, r),
                    BOp::BitXor | BOp::LogXor => IrOp::BitXor(l, r),
                    BOp::Eq => IrOp::CmpEq(l, r),
                    BOp::Ne => IrOp::CmpNe(l, r),
                    BOp::Lt => IrOp::CmpLt(l, r),
                    BOp::Le => IrOp::CmpLe(l, r),
                    BOp::Gt => IrOp::CmpGt(l, r),
                    BOp::Ge => IrOp::CmpGe(l, r),
                    BOp::Comma => unreachable!("handled above"),
                };
                self.f.push(op, result_ty)
            }
            NodeKind::Unary { op, operand } => {
                let v = self.lower_expr(operand);
                // Negation preserves the operand's type (§4.3: unary minus
                // isn't a promotion point) so a float operand still tags its
                // `Neg` instruction as float for codegen.
                let vty = self.f.get(v).ty.clone();
                match op {
                    UOp::Negate => self.f.push(IrOp::Neg(v), vty),
                    UOp::Not => self.f.push(IrOp::Not(v), Ty::Bool),
                    UOp::BitNot => self.f.push(IrOp::BitNot(v), Ty::I64),
                    UOp::Deref => self.f.push(IrOp::Load { addr: v }, Ty::I64),
                    UOp::AddrOf => v,
                    UOp::PreInc | UOp::PostInc => {
                        let one = self.f.push(IrOp::ConstInt(1), Ty::I64);
                        self.f.push(IrOp::Add(v, one), vty)
                    }
                    UOp::PreDec | UOp::PostDec => {
                        let one = self.f.push(IrOp::ConstInt(1), Ty::I64);
                        self.f.push(IrOp::Sub(v, one), vty)
                    }
                }
            }
            NodeKind::Assign { target, compound, value } => {
                let mut v = self.lower_expr(value);
                if let Some(op) = compound {
                    let cur = self.lower_expr(target);
                    let combined = match op {
                        BOp::Add => IrOp::Add(cur, v),
                        BOp::Sub => IrOp::Sub(cur, v),
                        BOp::Mul => IrOp::Mul(cur, v),
                        BOp::Div => IrOp::Div(cur, v),
                        BOp::Mod => IrOp::Mod(cur, v),
                        BOp::Shl => IrOp::Shl(cur, v),
                        BOp::Shr => IrOp::Shr(cur, v),
                        BOp::BitAnd => IrOp::BitAnd(cur, v),
                        BOp::BitOr => IrOp::BitOr(cur, v),
                        BOp::BitXor => IrOp::BitXor(cur, v),
                        _ => IrOp::Add(cur, v),
                    };
                    let cty = binary_result_type(&self.f.get(cur).ty.clone(), &self.f.get(v).ty.clone());
                    v = self.f.push(combined, cty);
                }
                if let NodeKind::Ident { name } = self.ast.kind(target).clone() {
                    if let Some(&(offset, _)) = self.locals.get(&name) {
                        self.f.push(IrOp::StoreLocal { offset, value: v }, Ty::U0);
                    } else {
                        self.f.push(IrOp::StoreGlobal { name, value: v }, Ty::U0);
                    }
                } else if let NodeKind::ArrayAccess { base, index } = self.ast.kind(target).clone() {
                    let addr = self.lower_expr(base);
                    let _idx = self.lower_expr(index);
                    self.f.push(IrOp::Store { addr, value: v }, Ty::U0);
                } else if let NodeKind::SubIntAccess { base, member_width, index } = self.ast.kind(target).clone() {
                    let addr = self.lower_expr(base);
                    let idx = self.lower_expr(index);
                    self.f.push(
                        IrOp::StoreSubInt { addr, index: idx, width: member_width.size(), value: v },
                        Ty::U0,
                    );
                }
                v
            }
            NodeKind::Call { callee, args } => {
                let arg_vals: Vec<ValueId> = args.into_iter().map(|a| self.lower_expr(a)).collect();
                let ty = self.fn_rets.get(&callee).cloned().unwrap_or(Ty::I64);
                self.f.push(IrOp::Call { callee, args: arg_vals }, ty)
            }
            NodeKind::ArrayAccess { base, index } => {
                let addr = self.lower_expr(base);
                let _idx = self.lower_expr(index);
                self.f.push(IrOp::Load { addr }, Ty::I64)
            }
            NodeKind::SubIntAccess { base, member_width, index } => {
                let addr = self.lower_expr(base);
                let idx = self.lower_expr(index);
                self.f.push(
                    IrOp::LoadSubInt { addr, index: idx, width: member_width.size(), signed: member_width.is_signed() },
                    Ty::from_width(member_width),
                )
            }
            NodeKind::MemberAccess { base, .. } | NodeKind::UnionMemberAccess { base, .. } => {
                let addr = self.lower_expr(base);
                self.f.push(IrOp::Load { addr }, Ty::I64)
            }
            NodeKind::Cast { ty, value } => {
                let v = self.lower_expr(value);
                self.f.push(IrOp::Cast { value: v, to: Ty::from_spec(&ty) }, Ty::from_spec(&ty))
            }
            NodeKind::RangeComparison { operands, ops } => {
                // Short-circuit AND chain (§4.2, §8): `a<b<c` lowers to
                // `(a<b) & (b<c)`, each comparison against the shared
                // adjacent operand.
                let mut result: Option<ValueId> = None;
                for (i, op) in ops.iter().enumerate() {
                    let l = self.lower_expr(operands[i]);
                    let r = self.lower_expr(operands[i + 1]);
                    let cmp = match op {
                        BOp::Lt => IrOp::CmpLt(l, r),
                        BOp::Le => IrOp::CmpLe(l, r),
                        BOp::Gt => IrOp::CmpGt(l, r),
                        BOp::Ge => IrOp::CmpGe(l, r),
                        _ => IrOp::CmpEq(l, r),
                    };
                    let v = self.f.push(cmp, Ty::Bool);
                    result = Some(match result {
                        None => v,
                        Some(prev) => self.f.push(IrOp::BitAnd(prev, v), Ty::Bool),
                    });
                }
                result.unwrap_or_else(|| self.f.push(IrOp::ConstInt(1), Ty::Bool))
            }
            NodeKind::If { cond, then_branch, else_branch } => {
                // Conditional expression (`?:`): lowered the same way as an
                // `if` statement, yielding the last value produced rather
                // than a structural block.
                let c = self.lower_expr(cond);
                let branch_at = self.f.push(
                    IrOp::Branch { cond: c, then_target: IrId(0), else_target: IrId(0) },
                    Ty::U0,
                );
                let then_label = self.f.label();
                let then_val = self.lower_expr(then_branch);
                let jump = self.f.push(IrOp::Jump(IrId(0)), Ty::U0);
                let else_label = self.f.label();
                let else_val = else_branch.map(|e| self.lower_expr(e));
                let end_label = self.f.label();
                self.patch_branch(branch_at, then_label, else_label);
                self.patch_jump(jump, end_label);
                else_val.unwrap_or(then_val)
            }
            _ => self.f.push(IrOp::ConstInt(0), Ty::I64),
        }
    }
}

/// Lower a whole AST into an [`IrProgram`] (§4.4 entry point).
pub fn lower(ast: &Ast) -> IrProgram {
    let _span = tracing::debug_span!("lower").entered();
    let mut program = IrProgram::default();
    let Some(root) = ast.root else { return program };
    let NodeKind::Program { decls } = ast.kind(root).clone() else { return program };

    // Collected up front so every function body can resolve a global's or
    // another function's real type regardless of declaration order (§4.3):
    // an `Ident` load or a `Call`'s result would otherwise have to guess.
    let mut globals: Map<Id, Ty> = Map::new();
    let mut fn_rets: Map<Id, Ty> = Map::new();
    for decl in &decls {
        match ast.kind(*decl).clone() {
            NodeKind::Variable { name, ty, .. } => {
                globals.insert(name, Ty::from_spec(&ty));
            }
            NodeKind::Function { name, ret, .. } => {
                fn_rets.insert(name, Ty::from_spec(&ret));
            }
            _ => {}
        }
    }
    for (name, _params, ret) in BUILTINS {
        fn_rets.entry(intern(*name)).or_insert_with(|| Ty::from_spec(ret));
    }

    for decl in decls {
        match ast.kind(decl).clone() {
            NodeKind::Function { name, ret, params, body: Some(body), .. } => {
                let mut lowering = FnLowering {
                    ast,
                    f: IrFunction::new(name, Ty::from_spec(&ret)),
                    locals: Map::new(),
                    globals: &globals,
                    fn_rets: &fn_rets,
                    next_offset: 0,
                    break_jumps: Vec::new(),
                    continue_targets: Vec::new(),
                };
                for p in &params {
                    lowering.declare_local(p.name, Ty::from_spec(&p.ty));
                    lowering.f.params.push((p.name, Ty::from_spec(&p.ty)));
                }
                lowering.lower_stmt(body);
                program.functions.push(lowering.f);
            }
            NodeKind::Variable { name, ty, .. } => {
                program.globals.push((name, Ty::from_spec(&ty)));
            }
            _ => {}
        }
    }
    tracing::debug!(functions = program.functions.len(), "lowering complete");
    program
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompilerConfig;
    use crate::front::parse;
    use crate::middle::ir::IrOp;

    #[test]
    fn lowers_simple_function_to_return() {
        let (ast, _symbols, _diags) = parse("I64 main() { return 1; }", &CompilerConfig::default());
        let program = lower(&ast);
        assert_eq!(program.functions.len(), 1);
        let f = &program.functions[0];
        assert!(f.instrs.iter().any(|i| matches!(i.op, IrOp::Return(Some(_)))));
    }

    #[test]
    fn if_statement_produces_a_branch_and_two_labels() {
        let (ast, _symbols, _diags) =
            parse("I64 main() { I64 x = 0; if (x) { x = 1; } else { x = 2; } return x; }", &CompilerConfig::default());
        let program = lower(&ast);
        let f = &program.functions[0];
        let branches = f.instrs.iter().filter(|i| matches!(i.op, IrOp::Branch { .. })).count();
        let labels = f.instrs.iter().filter(|i| matches!(i.op, IrOp::Label)).count();
        assert_eq!(branches, 1);
        assert_eq!(labels, 3);
    }

    #[test]
    fn while_loop_jumps_back_to_its_head_label() {
        let (ast, _symbols, _diags) =
            parse("I64 main() { I64 i = 0; while (i) { i = i - 1; } return i; }", &CompilerConfig::default());
        let program = lower(&ast);
        let f = &program.functions[0];
        assert!(f.instrs.iter().any(|i| matches!(i.op, IrOp::Jump(_))));
    }
}
