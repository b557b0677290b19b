//! Full-pipeline scenarios exercising the lexer through the AOT assembler
//! together, rather than any one phase in isolation.

use holyc_core::back::{aot, codegen};
use holyc_core::config::CompilerConfig;
use holyc_core::front;
use holyc_core::middle::{self, optimize, ir::IrOp, types::TypeChecker};

fn compile(src: &str, optimize_on: bool) -> (middle::IrProgram, holyc_core::diagnostics::DiagnosticBag) {
    let config = CompilerConfig::default();
    let (ast, symbols, mut diags) = front::parse(src, &config);
    diags.merge(TypeChecker::new(&ast, &symbols).check_program());
    let mut program = middle::lower(&ast);
    if optimize_on {
        program = optimize::optimize(program, config.enabled_passes);
    }
    (program, diags)
}

#[test]
fn hi_program_calls_print_and_imports_it_as_an_unresolved_global() {
    let (program, diags) = compile(r#"U0 main() { Print("hi\n"); return; }"#, false);
    assert!(!diags.has_errors());
    let funcs = codegen::codegen(&program);
    let image = aot::assemble(&funcs, &program.globals, 0x1000, &CompilerConfig::default());
    assert_eq!(diags.exit_code(), 0);
    assert_eq!(image.unresolved_globals.len(), 1);
    assert_eq!(image.unresolved_globals[0].symbol.as_str(), "Print");
    assert!(image.blocks.iter().map(|b| b.len()).sum::<usize>() > 0);
}

#[test]
fn range_comparison_lowers_to_a_short_circuit_and_chain() {
    let (program, diags) = compile("I64 x = 5; U0 main() { if (5<x<10) Print(\"in\\n\"); }", false);
    assert!(!diags.has_errors());
    let main = program.functions.iter().find(|f| f.name.as_str() == "main").unwrap();
    let lt_count = main.instrs.iter().filter(|i| matches!(i.op, IrOp::CmpLt(_, _))).count();
    let and_count = main.instrs.iter().filter(|i| matches!(i.op, IrOp::BitAnd(_, _))).count();
    assert_eq!(lt_count, 2, "a range comparison with two operators lowers to two comparisons");
    assert!(and_count >= 1, "the two comparisons are combined by a short-circuit AND");
}

#[test]
fn constant_folding_reduces_arithmetic_to_the_literal_result() {
    let (program, diags) = compile("I64 f() { return 1+2*3; }", true);
    assert!(!diags.has_errors());
    let f = program.functions.iter().find(|f| f.name.as_str() == "f").unwrap();
    let has_mul_or_add = f.instrs.iter().any(|i| matches!(i.op, IrOp::Mul(_, _) | IrOp::Add(_, _)));
    assert!(!has_mul_or_add, "constant folding should leave no MUL or ADD behind");
    let returns_seven = f.instrs.iter().any(|i| match &i.op {
        IrOp::Return(Some(v)) => {
            matches!(f.get(*v).op, IrOp::ConstInt(7)) || matches!(f.get(*v).op, IrOp::Copy(c) if matches!(f.get(c).op, IrOp::ConstInt(7)))
        }
        _ => false,
    });
    assert!(returns_seven, "the function should return the folded literal 7");
}

#[test]
fn redeclaration_in_the_same_scope_warns_but_still_succeeds() {
    let (_program, diags) = compile("U0 main() { I64 a; I64 a; }", false);
    assert!(!diags.has_errors());
    assert!(diags.warning_count() >= 1);
    assert_eq!(diags.exit_code(), 0);
    let message = diags.records().iter().find(|r| r.message.contains("already defined")).unwrap();
    assert_eq!(message.message, "variable 'a' already defined in current scope");
}

#[test]
fn switch_case_fallthrough_groups_share_one_body() {
    let src = r#"U0 main() { I64 x = 1; switch (x) { case 1: case 2: Print("a"); break; default: Print("b"); } }"#;
    let (program, diags) = compile(src, false);
    assert!(!diags.has_errors());
    let main = program.functions.iter().find(|f| f.name.as_str() == "main").unwrap();
    let switch_targets = main.instrs.iter().find_map(|i| match &i.op {
        IrOp::Switch { targets, .. } => Some(targets.clone()),
        _ => None,
    }).expect("a switch statement lowers to exactly one IrOp::Switch");
    let target_for = |v: i64| switch_targets.iter().find(|(value, _)| *value == v).map(|(_, t)| *t);
    assert_eq!(target_for(1), target_for(2), "case 1 and case 2 fall through to the same body");
}

#[test]
fn aot_image_splits_across_the_configured_block_size() {
    let (program, diags) = compile(
        "I64 add(I64 a, I64 b) { return a + b; } I64 main() { return add(1, add(2, add(3, 4))); }",
        true,
    );
    assert!(!diags.has_errors());
    let funcs = codegen::codegen(&program);
    let mut config = CompilerConfig::default();
    config.aot_block_size = 16;
    let image = aot::assemble(&funcs, &program.globals, 0, &config);
    assert!(image.blocks.len() > 1, "a small block size must force the image across multiple blocks");
    assert!(image.blocks.iter().all(|b| b.len() <= 16));
}
