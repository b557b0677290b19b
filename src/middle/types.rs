//! The type lattice and type checker (§3 Type, §4.3).

use derive_more::Display;

use crate::common::{intern, Id};
use crate::diagnostics::{DiagnosticBag, Phase};
use crate::front::ast::{Ast, BOp, IntWidth, NodeId, NodeKind, TypeSpec};
use crate::front::parse::BUILTINS;
use crate::front::scope::{SymbolKind, SymbolTable};

/// A resolved type (§3). Widens `TypeSpec` with a `Pointer` depth and a
/// distinguished `Unknown` used only while a declaration's type is still
/// being inferred (`TypeInference` nodes, §4.2).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Display)]
pub enum Ty {
    #[display("U0")]
    U0,
    #[display("I8")]
    I8,
    #[display("U8")]
    U8,
    #[display("I16")]
    I16,
    #[display("U16")]
    U16,
    #[display("I32")]
    I32,
    #[display("U32")]
    U32,
    #[display("I64")]
    I64,
    #[display("U64")]
    U64,
    #[display("F32")]
    F32,
    #[display("F64")]
    F64,
    #[display("Bool")]
    Bool,
    #[display("String")]
    String,
    #[display("{_0}*")]
    Pointer(Box<Ty>),
    #[display("{_0}")]
    Named(Id),
    #[display("<unknown>")]
    Unknown,
}

impl Ty {
    pub fn from_spec(spec: &TypeSpec) -> Ty {
        match spec {
            TypeSpec::U0 => Ty::U0,
            TypeSpec::Int(w) => Ty::from_width(*w),
            TypeSpec::F32 => Ty::F32,
            TypeSpec::F64 => Ty::F64,
            TypeSpec::Bool => Ty::Bool,
            TypeSpec::String => Ty::String,
            TypeSpec::Pointer(inner) => Ty::Pointer(Box::new(Ty::from_spec(inner))),
            TypeSpec::Named(n) => Ty::Named(*n),
        }
    }

    pub fn from_width(w: IntWidth) -> Ty {
        match w {
            IntWidth::I8 => Ty::I8,
            IntWidth::U8 => Ty::U8,
            IntWidth::I16 => Ty::I16,
            IntWidth::U16 => Ty::U16,
            IntWidth::I32 => Ty::I32,
            IntWidth::U32 => Ty::U32,
            IntWidth::I64 => Ty::I64,
            IntWidth::U64 => Ty::U64,
        }
    }

    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            Ty::I8 | Ty::U8 | Ty::I16 | Ty::U16 | Ty::I32 | Ty::U32 | Ty::I64 | Ty::U64
        )
    }

    pub fn is_unsigned(&self) -> bool {
        matches!(self, Ty::U8 | Ty::U16 | Ty::U32 | Ty::U64)
    }

    pub fn is_float(&self) -> bool {
        matches!(self, Ty::F32 | Ty::F64)
    }

    /// Bit width of an integer type, widest-first ranking used for widening
    /// (§4.3); non-integers return 0.
    pub fn rank(&self) -> u32 {
        match self {
            Ty::I8 | Ty::U8 => 8,
            Ty::I16 | Ty::U16 => 16,
            Ty::I32 | Ty::U32 => 32,
            Ty::I64 | Ty::U64 => 64,
            _ => 0,
        }
    }
}

/// The result type of a binary operator over two operand types (§4.3, §8
/// testable property), implementing the spec's ordered rule literally: (i)
/// `F64` wins if either operand is `F64`; (ii) else `F32` wins if either
/// operand is `F32`; (iii) else the unsigned operand wins if either operand
/// is unsigned (no rank comparison — unsigned always wins mixed-signedness,
/// per the spec's unconditional wording); (iv) else the wider signed operand
/// wins.
pub fn binary_result_type(lhs: &Ty, rhs: &Ty) -> Ty {
    if *lhs == Ty::F64 || *rhs == Ty::F64 {
        return Ty::F64;
    }
    if *lhs == Ty::F32 || *rhs == Ty::F32 {
        return Ty::F32;
    }
    if !lhs.is_integer() || !rhs.is_integer() {
        return if lhs == rhs { lhs.clone() } else { Ty::I64 };
    }
    let lhs_unsigned = lhs.is_unsigned();
    let rhs_unsigned = rhs.is_unsigned();
    if lhs_unsigned != rhs_unsigned {
        // Mixed signedness: the unsigned operand wins unconditionally (§4.3
        // rule (ii)), not whichever side happens to be wider.
        return if lhs_unsigned { lhs.clone() } else { rhs.clone() };
    }
    if lhs.rank() >= rhs.rank() {
        lhs.clone()
    } else {
        rhs.clone()
    }
}

/// Walks the AST assigning/checking types, reporting (non-fatal, §7)
/// diagnostics for incompatible operations. Kept as a single pass per the
/// resolved "one lexer, one type checker" open question (§9).
pub struct TypeChecker<'a> {
    ast: &'a Ast,
    symbols: &'a SymbolTable,
    diags: DiagnosticBag,
}

impl<'a> TypeChecker<'a> {
    pub fn new(ast: &'a Ast, symbols: &'a SymbolTable) -> Self {
        TypeChecker { ast, symbols, diags: DiagnosticBag::new() }
    }

    pub fn check_program(mut self) -> DiagnosticBag {
        let _span = tracing::debug_span!("typeck").entered();
        if let Some(root) = self.ast.root {
            self.check_node(root);
        }
        self.diags
    }

    fn check_node(&mut self, id: NodeId) -> Ty {
        match self.ast.kind(id) {
            NodeKind::Program { decls } => {
                for d in decls.clone() {
                    self.check_node(d);
                }
                Ty::U0
            }
            NodeKind::Function { body, ret, .. } => {
                if let Some(b) = body {
                    self.check_node(*b);
                }
                Ty::from_spec(ret)
            }
            NodeKind::Variable { ty, init, .. } => {
                let declared = Ty::from_spec(ty);
                if let Some(init_id) = init {
                    let init_ty = self.check_node(*init_id);
                    self.require_assignable(id, &declared, &init_ty);
                }
                declared
            }
            NodeKind::Block { stmts } => {
                for s in stmts.clone() {
                    self.check_node(s);
                }
                Ty::U0
            }
            NodeKind::Binary { op, lhs, rhs } => {
                let lt = self.check_node(*lhs);
                let rt = self.check_node(*rhs);
                if matches!(op, BOp::Eq | BOp::Ne | BOp::Lt | BOp::Le | BOp::Gt | BOp::Ge) {
                    Ty::Bool
                } else if matches!(op, BOp::Comma) {
                    // lhs is evaluated only for its side effects (§4.2).
                    rt
                } else {
                    binary_result_type(&lt, &rt)
                }
            }
            NodeKind::Unary { operand, .. } => self.check_node(*operand),
            NodeKind::Assign { target, value, .. } => {
                let tt = self.check_node(*target);
                let vt = self.check_node(*value);
                self.require_assignable(id, &tt, &vt);
                tt
            }
            NodeKind::Call { callee, args } => {
                let arg_tys: Vec<Ty> = args.clone().into_iter().map(|a| self.check_node(a)).collect();
                let pos = self.ast.get(id).pos;
                if let Some((_, params, ret)) = BUILTINS.iter().find(|(n, ..)| intern(n) == *callee) {
                    // `Print`'s true signature is variadic; only its
                    // mandatory leading argument is arity-checked (§4.2).
                    if params.len() != arg_tys.len() && *callee != intern("Print") {
                        self.diags.error(
                            Phase::Type,
                            pos.line,
                            pos.column,
                            format!(
                                "'{callee}' expects {} argument(s), found {}",
                                params.len(),
                                arg_tys.len()
                            ),
                        );
                    }
                    Ty::from_spec(ret)
                } else if let Some(sym) = self.symbols.lookup_kind(*callee, SymbolKind::Function) {
                    Ty::from_spec(&sym.ty)
                } else {
                    self.diags.error(
                        Phase::Type,
                        pos.line,
                        pos.column,
                        format!("call to undeclared function '{callee}'"),
                    );
                    Ty::I64
                }
            }
            NodeKind::Ident { name } => match self.symbols.lookup(*name) {
                Some(sym) => Ty::from_spec(&sym.ty),
                None => Ty::I64,
            },
            NodeKind::IntLit { width, .. } => Ty::from_width(*width),
            NodeKind::FloatLit { .. } => Ty::F64,
            NodeKind::StringLit { .. } => Ty::String,
            NodeKind::CharLit { .. } => Ty::I64,
            NodeKind::If { cond, then_branch, else_branch } => {
                self.check_node(*cond);
                self.check_node(*then_branch);
                if let Some(e) = else_branch {
                    self.check_node(*e);
                }
                Ty::U0
            }
            NodeKind::While { cond, body } | NodeKind::DoWhile { body, cond } => {
                self.check_node(*cond);
                self.check_node(*body);
                Ty::U0
            }
            NodeKind::For { init, cond, step, body } => {
                if let Some(n) = init {
                    self.check_node(*n);
                }
                if let Some(n) = cond {
                    self.check_node(*n);
                }
                if let Some(n) = step {
                    self.check_node(*n);
                }
                self.check_node(*body);
                Ty::U0
            }
            NodeKind::Switch { scrutinee, cases, default, start_block, end_block, .. } => {
                self.check_node(*scrutinee);
                for case in cases.clone() {
                    for s in case.body {
                        self.check_node(s);
                    }
                }
                for block in [default, start_block, end_block].into_iter().flatten() {
                    for s in block.clone() {
                        self.check_node(s);
                    }
                }
                Ty::U0
            }
            NodeKind::Return { value } => {
                if let Some(v) = value {
                    self.check_node(*v);
                }
                Ty::U0
            }
            NodeKind::ArrayAccess { base, index } => {
                self.check_node(*base);
                self.check_node(*index);
                Ty::I64
            }
            NodeKind::MemberAccess { base, .. } | NodeKind::UnionMemberAccess { base, .. } => {
                self.check_node(*base);
                Ty::I64
            }
            NodeKind::SubIntAccess { base, member_width, index } => {
                self.check_node(*base);
                self.check_node(*index);
                Ty::from_width(*member_width)
            }
            NodeKind::RangeComparison { operands, .. } => {
                for o in operands.clone() {
                    self.check_node(o);
                }
                Ty::Bool
            }
            NodeKind::Cast { ty, value } => {
                self.check_node(*value);
                Ty::from_spec(ty)
            }
            NodeKind::Try { body, catch_body } => {
                self.check_node(*body);
                if let Some(c) = catch_body {
                    self.check_node(*c);
                }
                Ty::U0
            }
            NodeKind::Throw { value } => {
                self.check_node(*value);
                Ty::U0
            }
            NodeKind::TypeInference { init, .. } => self.check_node(*init),
            _ => Ty::U0,
        }
    }

    fn require_assignable(&mut self, id: NodeId, target: &Ty, value: &Ty) {
        if *target == Ty::Unknown || *value == Ty::Unknown {
            return;
        }
        if Self::compatible(value, target) {
            return;
        }
        let pos = self.ast.get(id).pos;
        self.diags.error(
            Phase::Type,
            pos.line,
            pos.column,
            format!("cannot assign value of type {value} to target of type {target}"),
        );
    }

    /// `compatible(right_type, left_type)` (§4.3): reflexive; integers widen
    /// or narrow freely within the same signedness; integer→float is a
    /// coerced conversion; `F32`→`F64` is a widening coercion; `Bool` and any
    /// integer convert into each other. Every other pairing (`String` with a
    /// non-`String`, a pointer with a non-pointer, a float narrowed into an
    /// integer, mismatched `Named` types) is an unconditional error.
    fn compatible(right: &Ty, left: &Ty) -> bool {
        if right == left {
            return true;
        }
        match (right, left) {
            (r, l) if r.is_integer() && l.is_integer() => r.is_unsigned() == l.is_unsigned(),
            (r, Ty::F32 | Ty::F64) if r.is_integer() => true,
            (Ty::F32, Ty::F64) => true,
            (Ty::Bool, l) if l.is_integer() => true,
            (r, Ty::Bool) if r.is_integer() => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_result_prefers_float_over_everything() {
        assert_eq!(binary_result_type(&Ty::F64, &Ty::I64), Ty::F64);
        assert_eq!(binary_result_type(&Ty::U8, &Ty::F64), Ty::F64);
    }

    #[test]
    fn binary_result_prefers_f64_over_f32() {
        assert_eq!(binary_result_type(&Ty::F32, &Ty::F64), Ty::F64);
        assert_eq!(binary_result_type(&Ty::F64, &Ty::F32), Ty::F64);
    }

    #[test]
    fn binary_result_prefers_f32_over_integers() {
        assert_eq!(binary_result_type(&Ty::F32, &Ty::I64), Ty::F32);
        assert_eq!(binary_result_type(&Ty::U8, &Ty::F32), Ty::F32);
    }

    #[test]
    fn binary_result_widens_same_signedness() {
        assert_eq!(binary_result_type(&Ty::I8, &Ty::I32), Ty::I32);
        assert_eq!(binary_result_type(&Ty::U64, &Ty::U8), Ty::U64);
    }

    #[test]
    fn binary_result_prefers_unsigned_when_equal_or_wider() {
        assert_eq!(binary_result_type(&Ty::U32, &Ty::I32), Ty::U32);
        assert_eq!(binary_result_type(&Ty::U64, &Ty::I8), Ty::U64);
    }

    #[test]
    fn binary_result_prefers_unsigned_unconditionally() {
        // §4.3 rule (ii) is unconditional: the unsigned operand wins even
        // when the signed operand is wider.
        assert_eq!(binary_result_type(&Ty::I64, &Ty::U8), Ty::U8);
        assert_eq!(binary_result_type(&Ty::U8, &Ty::I64), Ty::U8);
    }

    #[test]
    fn assignable_rejects_cross_kind_mismatches() {
        assert!(!TypeChecker::compatible(&Ty::F64, &Ty::I8));
        assert!(!TypeChecker::compatible(&Ty::Pointer(Box::new(Ty::I64)), &Ty::I64));
        assert!(!TypeChecker::compatible(&Ty::String, &Ty::I64));
    }

    #[test]
    fn assignable_allows_documented_coercions() {
        assert!(TypeChecker::compatible(&Ty::I8, &Ty::I64));
        assert!(TypeChecker::compatible(&Ty::I64, &Ty::I8));
        assert!(TypeChecker::compatible(&Ty::I64, &Ty::F64));
        assert!(TypeChecker::compatible(&Ty::F32, &Ty::F64));
        assert!(TypeChecker::compatible(&Ty::Bool, &Ty::I64));
        assert!(!TypeChecker::compatible(&Ty::U8, &Ty::I8));
    }
}
