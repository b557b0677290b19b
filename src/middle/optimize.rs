//! Optimizer passes (§4.4).
//!
//! Each pass is a pure `fn(IrProgram) -> IrProgram`: it never mutates in
//! place through a shared reference and, applied a second time to its own
//! output, returns an identical program (§8 idempotence property). Passes
//! run per-function in the numbered order selected by
//! [`crate::config::PassMask`].

use crate::common::Map;
use crate::middle::ir::{IrFunction, IrId, IrOp, IrProgram, ValueId};
use crate::config::PassMask;

/// Resolve a value through a chain of `Copy` aliases to its ultimate source.
fn resolve(f: &IrFunction, mut id: ValueId) -> ValueId {
    let mut steps = 0;
    while let IrOp::Copy(inner) = f.get(id).op {
        id = inner;
        steps += 1;
        if steps > f.instrs.len() {
            break; // defensive: a cycle should never occur, but never loop forever
        }
    }
    id
}

fn const_int(f: &IrFunction, id: ValueId) -> Option<i64> {
    match f.get(resolve(f, id)).op {
        IrOp::ConstInt(v) => Some(v),
        _ => None,
    }
}

/// Pass 0: fold binary/unary operations over two resolved integer constants.
fn constant_fold(mut f: IrFunction) -> IrFunction {
    for i in 0..f.instrs.len() {
        let id = IrId(i as u32);
        let folded = match f.get(id).op.clone() {
            IrOp::Add(a, b) => const_int(&f, a).zip(const_int(&f, b)).map(|(a, b)| a.wrapping_add(b)),
            IrOp::Sub(a, b) => const_int(&f, a).zip(const_int(&f, b)).map(|(a, b)| a.wrapping_sub(b)),
            IrOp::Mul(a, b) => const_int(&f, a).zip(const_int(&f, b)).map(|(a, b)| a.wrapping_mul(b)),
            IrOp::Div(a, b) => const_int(&f, a)
                .zip(const_int(&f, b))
                .filter(|(_, b)| *b != 0)
                .map(|(a, b)| a.wrapping_div(b)),
            IrOp::Mod(a, b) => const_int(&f, a)
                .zip(const_int(&f, b))
                .filter(|(_, b)| *b != 0)
                .map(|(a, b)| a.wrapping_rem(b)),
            IrOp::BitAnd(a, b) => const_int(&f, a).zip(const_int(&f, b)).map(|(a, b)| a & b),
            IrOp::BitOr(a, b) => const_int(&f, a).zip(const_int(&f, b)).map(|(a, b)| a | b),
            IrOp::BitXor(a, b) => const_int(&f, a).zip(const_int(&f, b)).map(|(a, b)| a ^ b),
            IrOp::Shl(a, b) => const_int(&f, a).zip(const_int(&f, b)).map(|(a, b)| a.wrapping_shl(b as u32)),
            IrOp::Shr(a, b) => const_int(&f, a).zip(const_int(&f, b)).map(|(a, b)| a.wrapping_shr(b as u32)),
            IrOp::CmpEq(a, b) => const_int(&f, a).zip(const_int(&f, b)).map(|(a, b)| (a == b) as i64),
            IrOp::CmpNe(a, b) => const_int(&f, a).zip(const_int(&f, b)).map(|(a, b)| (a != b) as i64),
            IrOp::CmpLt(a, b) => const_int(&f, a).zip(const_int(&f, b)).map(|(a, b)| (a < b) as i64),
            IrOp::CmpLe(a, b) => const_int(&f, a).zip(const_int(&f, b)).map(|(a, b)| (a <= b) as i64),
            IrOp::CmpGt(a, b) => const_int(&f, a).zip(const_int(&f, b)).map(|(a, b)| (a > b) as i64),
            IrOp::CmpGe(a, b) => const_int(&f, a).zip(const_int(&f, b)).map(|(a, b)| (a >= b) as i64),
            IrOp::Neg(a) => const_int(&f, a).map(|a| a.wrapping_neg()),
            IrOp::BitNot(a) => const_int(&f, a).map(|a| !a),
            IrOp::Not(a) => const_int(&f, a).map(|a| (a == 0) as i64),
            _ => None,
        };
        if let Some(v) = folded {
            f.instrs[i].op = IrOp::ConstInt(v);
        }
    }
    f
}

/// Pass 1: algebraic identities (`x+0`, `x*1`, `x*0`, `x-0`, `x<<0`, `x>>0`,
/// `x&x`, `x|x`) collapse to a `Copy` of the surviving operand.
fn algebraic_simplify(mut f: IrFunction) -> IrFunction {
    for i in 0..f.instrs.len() {
        let id = IrId(i as u32);
        let replacement = match f.get(id).op.clone() {
            IrOp::Add(a, b) if const_int(&f, a) == Some(0) => Some(b),
            IrOp::Add(a, b) if const_int(&f, b) == Some(0) => Some(a),
            IrOp::Sub(a, b) if const_int(&f, b) == Some(0) => Some(a),
            IrOp::Mul(a, b) if const_int(&f, a) == Some(1) => Some(b),
            IrOp::Mul(a, b) if const_int(&f, b) == Some(1) => Some(a),
            IrOp::Mul(a, _) if const_int(&f, a) == Some(0) => Some(a),
            IrOp::Mul(_, b) if const_int(&f, b) == Some(0) => Some(b),
            IrOp::Shl(a, b) if const_int(&f, b) == Some(0) => Some(a),
            IrOp::Shr(a, b) if const_int(&f, b) == Some(0) => Some(a),
            IrOp::BitAnd(a, b) if a == b => Some(a),
            IrOp::BitOr(a, b) if a == b => Some(a),
            _ => None,
        };
        if let Some(src) = replacement {
            f.instrs[i].op = IrOp::Copy(src);
        }
    }
    f
}

/// Pass 2: copy propagation. Every operand referencing a `Copy` is rewritten
/// to point directly at that copy's ultimate source.
fn copy_propagation(mut f: IrFunction) -> IrFunction {
    let resolved: Vec<ValueId> = (0..f.instrs.len()).map(|i| resolve(&f, IrId(i as u32))).collect();
    let r = |id: ValueId| resolved[id.0 as usize];
    for instr in &mut f.instrs {
        instr.op = map_operands(&instr.op, &r);
    }
    f
}

fn map_operands(op: &IrOp, r: &impl Fn(ValueId) -> ValueId) -> IrOp {
    match op.clone() {
        IrOp::Load { addr } => IrOp::Load { addr: r(addr) },
        IrOp::Store { addr, value } => IrOp::Store { addr: r(addr), value: r(value) },
        IrOp::StoreLocal { offset, value } => IrOp::StoreLocal { offset, value: r(value) },
        IrOp::StoreGlobal { name, value } => IrOp::StoreGlobal { name, value: r(value) },
        IrOp::Add(a, b) => IrOp::Add(r(a), r(b)),
        IrOp::Sub(a, b) => IrOp::Sub(r(a), r(b)),
        IrOp::Mul(a, b) => IrOp::Mul(r(a), r(b)),
        IrOp::Div(a, b) => IrOp::Div(r(a), r(b)),
        IrOp::Mod(a, b) => IrOp::Mod(r(a), r(b)),
        IrOp::Shl(a, b) => IrOp::Shl(r(a), r(b)),
        IrOp::Shr(a, b) => IrOp::Shr(r(a), r(b)),
        IrOp::BitAnd(a, b) => IrOp::BitAnd(r(a), r(b)),
        IrOp::BitOr(a, b) => IrOp::BitOr(r(a), r(b)),
        IrOp::BitXor(a, b) => IrOp::BitXor(r(a), r(b)),
        IrOp::CmpEq(a, b) => IrOp::CmpEq(r(a), r(b)),
        IrOp::CmpNe(a, b) => IrOp::CmpNe(r(a), r(b)),
        IrOp::CmpLt(a, b) => IrOp::CmpLt(r(a), r(b)),
        IrOp::CmpLe(a, b) => IrOp::CmpLe(r(a), r(b)),
        IrOp::CmpGt(a, b) => IrOp::CmpGt(r(a), r(b)),
        IrOp::CmpGe(a, b) => IrOp::CmpGe(r(a), r(b)),
        IrOp::Neg(a) => IrOp::Neg(r(a)),
        IrOp::Not(a) => IrOp::Not(r(a)),
        IrOp::BitNot(a) => IrOp::BitNot(r(a)),
        IrOp::LoadSubInt { addr, index, width, signed } => {
            IrOp::LoadSubInt { addr: r(addr), index: r(index), width, signed }
        }
        IrOp::StoreSubInt { addr, index, width, value } => {
            IrOp::StoreSubInt { addr: r(addr), index: r(index), width, value: r(value) }
        }
        IrOp::Cast { value, to } => IrOp::Cast { value: r(value), to },
        IrOp::Call { callee, args } => IrOp::Call { callee, args: args.into_iter().map(r).collect() },
        IrOp::Copy(a) => IrOp::Copy(r(a)),
        IrOp::Branch { cond, then_target, else_target } => {
            IrOp::Branch { cond: r(cond), then_target, else_target }
        }
        IrOp::Return(v) => IrOp::Return(v.map(r)),
        IrOp::Switch { scrutinee, targets, default, nobounds } => {
            IrOp::Switch { scrutinee: r(scrutinee), targets, default, nobounds }
        }
        IrOp::Phi(vs) => IrOp::Phi(vs.into_iter().map(r).collect()),
        other => other,
    }
}

#[derive(PartialEq, Eq, PartialOrd, Ord, Clone)]
enum Key {
    Add(ValueId, ValueId),
    Sub(ValueId, ValueId),
    Mul(ValueId, ValueId),
    BitAnd(ValueId, ValueId),
    BitOr(ValueId, ValueId),
    BitXor(ValueId, ValueId),
}

/// Pass 3: common subexpression elimination for pure commutative-operand
/// binary ops; a later identical computation becomes a `Copy` of the first.
fn common_subexpr_elim(mut f: IrFunction) -> IrFunction {
    let mut seen: Map<Key, ValueId> = Map::new();
    for i in 0..f.instrs.len() {
        let id = IrId(i as u32);
        let key = match f.get(id).op {
            IrOp::Add(a, b) => Some(Key::Add(a.min(b), a.max(b))),
            IrOp::Sub(a, b) => Some(Key::Sub(a, b)),
            IrOp::Mul(a, b) => Some(Key::Mul(a.min(b), a.max(b))),
            IrOp::BitAnd(a, b) => Some(Key::BitAnd(a.min(b), a.max(b))),
            IrOp::BitOr(a, b) => Some(Key::BitOr(a.min(b), a.max(b))),
            IrOp::BitXor(a, b) => Some(Key::BitXor(a.min(b), a.max(b))),
            _ => None,
        };
        if let Some(key) = key {
            if let Some(&earlier) = seen.get(&key) {
                f.instrs[i].op = IrOp::Copy(earlier);
            } else {
                seen.insert(key, id);
            }
        }
    }
    f
}

/// Pass 4: strength reduction. Multiplication/division by a power of two
/// becomes a shift.
fn strength_reduction(mut f: IrFunction) -> IrFunction {
    for i in 0..f.instrs.len() {
        let id = IrId(i as u32);
        let rewrite = match f.get(id).op.clone() {
            IrOp::Mul(a, b) => const_int(&f, b).filter(|v| v.is_power_of_two()).map(|v| (a, v.trailing_zeros())),
            IrOp::Div(a, b) => const_int(&f, b).filter(|v| v.is_power_of_two()).map(|v| (a, v.trailing_zeros())),
            _ => None,
        };
        if let Some((a, shift)) = rewrite {
            let is_mul = matches!(f.get(id).op, IrOp::Mul(..));
            let shift_const = f.push(IrOp::ConstInt(shift as i64), crate::middle::types::Ty::I64);
            f.instrs[id.0 as usize].op = if is_mul { IrOp::Shl(a, shift_const) } else { IrOp::Shr(a, shift_const) };
        }
    }
    f
}

/// Pass 5: dead store/compute elimination. An instruction with no side
/// effects whose `IrId` is never referenced by a later instruction is
/// neutralized to `Nop`.
fn dead_code_elim(mut f: IrFunction) -> IrFunction {
    let mut used = vec![false; f.instrs.len()];
    for instr in &f.instrs {
        for_each_operand(&instr.op, |id| used[id.0 as usize] = true);
    }
    for i in 0..f.instrs.len() {
        if !used[i] && is_pure(&f.instrs[i].op) {
            f.instrs[i].op = IrOp::Nop;
        }
    }
    f
}

fn is_pure(op: &IrOp) -> bool {
    !matches!(
        op,
        IrOp::Store { .. }
            | IrOp::StoreLocal { .. }
            | IrOp::StoreGlobal { .. }
            | IrOp::StoreSubInt { .. }
            | IrOp::Call { .. }
            | IrOp::Label
            | IrOp::Jump(_)
            | IrOp::Branch { .. }
            | IrOp::Return(_)
            | IrOp::Switch { .. }
            | IrOp::Unreachable
            | IrOp::Nop
    )
}

fn for_each_operand(op: &IrOp, mut visit: impl FnMut(ValueId)) {
    match op.clone() {
        IrOp::Load { addr } => visit(addr),
        IrOp::Store { addr, value } => {
            visit(addr);
            visit(value);
        }
        IrOp::StoreLocal { value, .. } => visit(value),
        IrOp::StoreGlobal { value, .. } => visit(value),
        IrOp::Add(a, b)
        | IrOp::Sub(a, b)
        | IrOp::Mul(a, b)
        | IrOp::Div(a, b)
        | IrOp::Mod(a, b)
        | IrOp::Shl(a, b)
        | IrOp::Shr(a, b)
        | IrOp::BitAnd(a, b)
        | IrOp::BitOr(a, b)
        | IrOp::BitXor(a, b)
        | IrOp::CmpEq(a, b)
        | IrOp::CmpNe(a, b)
        | IrOp::CmpLt(a, b)
        | IrOp::CmpLe(a, b)
        | IrOp::CmpGt(a, b)
        | IrOp::CmpGe(a, b) => {
            visit(a);
            visit(b);
        }
        IrOp::Neg(a) | IrOp::Not(a) | IrOp::BitNot(a) | IrOp::Copy(a) => visit(a),
        IrOp::LoadSubInt { addr, index, .. } => {
            visit(addr);
            visit(index);
        }
        IrOp::StoreSubInt { addr, index, value, .. } => {
            visit(addr);
            visit(index);
            visit(value);
        }
        IrOp::Cast { value, .. } => visit(value),
        IrOp::Call { args, .. } => {
            for a in args {
                visit(a);
            }
        }
        IrOp::Branch { cond, .. } => visit(cond),
        IrOp::Return(v) => {
            if let Some(v) = v {
                visit(v);
            }
        }
        IrOp::Switch { scrutinee, .. } => visit(scrutinee),
        IrOp::Phi(vs) => {
            for v in vs {
                visit(v);
            }
        }
        IrOp::ConstInt(_)
        | IrOp::ConstFloat(_)
        | IrOp::ConstString(_)
        | IrOp::LoadLocal { .. }
        | IrOp::LoadGlobal { .. }
        | IrOp::AddressOf { .. }
        | IrOp::Label
        | IrOp::Jump(_)
        | IrOp::Unreachable
        | IrOp::Nop => {}
    }
}

/// Pass 6: jump threading. A `Jump` whose target label is immediately
/// followed (after skipping further labels) by another unconditional `Jump`
/// is retargeted directly, collapsing jump chains.
fn jump_threading(mut f: IrFunction) -> IrFunction {
    let ultimate = |f: &IrFunction, mut target: IrId| -> IrId {
        let mut steps = 0;
        loop {
            let mut next = target.0 as usize + 1;
            while next < f.instrs.len() && matches!(f.instrs[next].op, IrOp::Label) {
                next += 1;
            }
            match f.instrs.get(next).map(|i| &i.op) {
                Some(IrOp::Jump(t)) => target = *t,
                _ => break,
            }
            steps += 1;
            if steps > f.instrs.len() {
                break;
            }
        }
        target
    };
    for i in 0..f.instrs.len() {
        if let IrOp::Jump(t) = f.instrs[i].op {
            let resolved = ultimate(&f, t);
            f.instrs[i].op = IrOp::Jump(resolved);
        }
    }
    f
}

/// Pass 7: branch simplification. A `Branch` whose condition resolves to a
/// known constant becomes an unconditional `Jump`.
fn branch_simplify(mut f: IrFunction) -> IrFunction {
    for i in 0..f.instrs.len() {
        if let IrOp::Branch { cond, then_target, else_target } = f.instrs[i].op {
            if let Some(v) = const_int(&f, cond) {
                f.instrs[i].op = IrOp::Jump(if v != 0 { then_target } else { else_target });
            }
        }
    }
    f
}

/// Pass 8: redundant-load elimination. A `LoadLocal` immediately preceded
/// (ignoring other pure reads) by a `StoreLocal` to the same offset, with no
/// intervening store, is replaced by a `Copy` of the stored value.
fn redundant_load_elim(mut f: IrFunction) -> IrFunction {
    let mut last_store: Map<i32, ValueId> = Map::new();
    for i in 0..f.instrs.len() {
        let id = IrId(i as u32);
        match f.get(id).op {
            IrOp::StoreLocal { offset, value } => {
                last_store.insert(offset, value);
            }
            IrOp::LoadLocal { offset } => {
                if let Some(&v) = last_store.get(&offset) {
                    f.instrs[i].op = IrOp::Copy(v);
                }
            }
            IrOp::Label | IrOp::Jump(_) | IrOp::Branch { .. } | IrOp::Switch { .. } | IrOp::Call { .. } => {
                // Control-flow merges and calls invalidate the local cache
                // of stored values conservatively.
                last_store.clear();
            }
            _ => {}
        }
    }
    f
}

/// Pass 9: unreachable-code elimination. Instructions after a terminator
/// and before the next `Label` are dead; neutralize them to `Nop`.
fn unreachable_elim(mut f: IrFunction) -> IrFunction {
    let mut dead = false;
    for instr in &mut f.instrs {
        if matches!(instr.op, IrOp::Label) {
            dead = false;
        }
        if dead {
            instr.op = IrOp::Nop;
            continue;
        }
        if instr.op.is_terminator() {
            dead = true;
        }
    }
    f
}

type Pass = fn(IrFunction) -> IrFunction;

const PASSES: [Pass; 10] = [
    constant_fold,
    algebraic_simplify,
    copy_propagation,
    common_subexpr_elim,
    strength_reduction,
    dead_code_elim,
    jump_threading,
    branch_simplify,
    redundant_load_elim,
    unreachable_elim,
];

/// Run the enabled optimizer passes, in numbered order, over every function
/// in `program` (§4.4 entry point). Pure: returns a new `IrProgram`.
pub fn optimize(program: IrProgram, mask: PassMask) -> IrProgram {
    let _span = tracing::debug_span!("optimize").entered();
    let functions = program
        .functions
        .into_iter()
        .map(|mut f| {
            for (i, pass) in PASSES.iter().enumerate() {
                if mask.is_enabled(i as u8) {
                    f = pass(f);
                }
            }
            f
        })
        .collect();
    IrProgram { functions, globals: program.globals }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::intern;
    use crate::middle::types::Ty;

    fn build(ops: Vec<IrOp>) -> IrFunction {
        let mut f = IrFunction::new(intern("f"), Ty::I64);
        for op in ops {
            f.push(op, Ty::I64);
        }
        f
    }

    #[test]
    fn constant_fold_reduces_arithmetic_to_a_single_constant() {
        let f = build(vec![IrOp::ConstInt(2), IrOp::ConstInt(3), IrOp::Add(IrId(0), IrId(1))]);
        let f = constant_fold(f);
        assert_eq!(f.instrs[2].op, IrOp::ConstInt(5));
    }

    #[test]
    fn algebraic_simplify_collapses_add_zero() {
        let f = build(vec![IrOp::LoadLocal { offset: 0 }, IrOp::ConstInt(0), IrOp::Add(IrId(0), IrId(1))]);
        let f = algebraic_simplify(f);
        assert_eq!(f.instrs[2].op, IrOp::Copy(IrId(0)));
    }

    #[test]
    fn copy_propagation_rewrites_downstream_operands() {
        let f = build(vec![
            IrOp::ConstInt(7),
            IrOp::Copy(IrId(0)),
            IrOp::Add(IrId(1), IrId(1)),
        ]);
        let f = copy_propagation(f);
        assert_eq!(f.instrs[2].op, IrOp::Add(IrId(0), IrId(0)));
    }

    #[test]
    fn common_subexpr_elim_dedupes_identical_adds() {
        let f = build(vec![
            IrOp::LoadLocal { offset: 0 },
            IrOp::LoadLocal { offset: 8 },
            IrOp::Add(IrId(0), IrId(1)),
            IrOp::Add(IrId(0), IrId(1)),
        ]);
        let f = common_subexpr_elim(f);
        assert_eq!(f.instrs[3].op, IrOp::Copy(IrId(2)));
    }

    #[test]
    fn strength_reduction_rewrites_multiply_by_power_of_two() {
        let f = build(vec![IrOp::LoadLocal { offset: 0 }, IrOp::ConstInt(8), IrOp::Mul(IrId(0), IrId(1))]);
        let f = strength_reduction(f);
        assert!(matches!(f.instrs[3].op, IrOp::Shl(IrId(0), _)) || matches!(f.instrs[2].op, IrOp::Shl(IrId(0), _)));
    }

    #[test]
    fn dead_code_elim_neutralizes_unreferenced_pure_instruction() {
        let f = build(vec![IrOp::ConstInt(1), IrOp::ConstInt(2), IrOp::Return(Some(IrId(0)))]);
        let f = dead_code_elim(f);
        assert_eq!(f.instrs[1].op, IrOp::Nop);
    }

    #[test]
    fn branch_simplify_collapses_constant_condition_to_jump() {
        let mut f = IrFunction::new(intern("f"), Ty::U0);
        let c = f.push(IrOp::ConstInt(1), Ty::Bool);
        let branch = f.push(IrOp::Branch { cond: c, then_target: IrId(9), else_target: IrId(10) }, Ty::U0);
        let f = branch_simplify(f);
        assert_eq!(f.instrs[branch.0 as usize].op, IrOp::Jump(IrId(9)));
    }

    #[test]
    fn unreachable_elim_kills_instructions_after_a_return() {
        let mut f = IrFunction::new(intern("f"), Ty::I64);
        f.push(IrOp::Return(None), Ty::U0);
        f.push(IrOp::ConstInt(99), Ty::I64);
        let f = unreachable_elim(f);
        assert_eq!(f.instrs[1].op, IrOp::Nop);
    }

    #[test]
    fn optimizer_pass_is_idempotent_on_already_folded_input() {
        let program = IrProgram {
            functions: vec![build(vec![
                IrOp::ConstInt(2),
                IrOp::ConstInt(3),
                IrOp::Add(IrId(0), IrId(1)),
                IrOp::Return(Some(IrId(2))),
            ])],
            globals: vec![],
        };
        let once = optimize(program, PassMask::ALL);
        let twice = optimize(once.clone(), PassMask::ALL);
        assert_eq!(
            once.functions[0].instrs.iter().map(|i| format!("{:?}", i.op)).collect::<Vec<_>>(),
            twice.functions[0].instrs.iter().map(|i| format!("{:?}", i.op)).collect::<Vec<_>>(),
        );
    }
}
