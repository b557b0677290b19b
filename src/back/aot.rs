//! AOT image assembly and symbol resolution (§3, §4.6, §6).
//!
//! The image is an append-only sequence of fixed-size blocks
//! (`CompilerConfig::aot_block_size`, default 65536 bytes) holding raw
//! machine code, plus four side tables that let the image be relocated to a
//! load origin other than the one it was assembled against:
//!
//! - unresolved local refs: calls between functions defined in this module,
//!   recorded even though the displacement is already known, so the image
//!   can be re-split across blocks without re-running codegen
//! - unresolved global refs: calls to symbols not defined locally (builtins,
//!   externs) — left as a zero `call rel32` for the loader to patch
//! - absolute fixups: places codegen emitted a placeholder address for a
//!   global or `&`-of-global and which need the real address once one exists
//! - heap-global descriptors: size/alignment of every global so the loader
//!   can reserve storage before patching the fixups above

use crate::back::codegen::{ArithOp, CallTarget, CmpOp, FArithOp, FloatWidth, FunctionAsm, Instruction};
use crate::back::x86::{displacement_mode, modrm_raw, Mode, ModRm, Reg, Rex};
use crate::common::{Id, Map};
use crate::config::CompilerConfig;
use crate::middle::ir::IrId;
use crate::middle::types::Ty;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnresolvedLocalRef {
    pub offset: u64,
    pub callee: Id,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnresolvedGlobalRef {
    pub offset: u64,
    pub symbol: Id,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AbsoluteFixup {
    pub offset: u64,
    pub symbol: Id,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeapGlobalDescriptor {
    pub name: Id,
    pub size: u32,
    pub align: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AotHeader {
    pub origin: u64,
    pub total_bytes: u64,
    pub max_alignment: u32,
    pub unresolved_local_count: u32,
    pub unresolved_global_count: u32,
    pub fixup_count: u32,
    pub heap_global_count: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AotImage {
    pub header: AotHeader,
    pub blocks: Vec<Vec<u8>>,
    pub function_addresses: Map<Id, u64>,
    pub unresolved_locals: Vec<UnresolvedLocalRef>,
    pub unresolved_globals: Vec<UnresolvedGlobalRef>,
    pub fixups: Vec<AbsoluteFixup>,
    pub heap_globals: Vec<HeapGlobalDescriptor>,
}

impl AotImage {
    /// Split the flat code stream into `block_size`-byte append-only blocks
    /// (§3: the last block is shorter, never padded).
    fn chunk(code: &[u8], block_size: usize) -> Vec<Vec<u8>> {
        if code.is_empty() {
            return vec![Vec::new()];
        }
        code.chunks(block_size.max(1)).map(|c| c.to_vec()).collect()
    }
}

fn rex(w: bool, r_ext: bool, x_ext: bool, b_ext: bool) -> Option<u8> {
    let rex = Rex { w, r: r_ext, x: x_ext, b: b_ext };
    if rex.is_needed() || w {
        Some(rex.byte())
    } else {
        None
    }
}

fn emit_modrm_mem(out: &mut Vec<u8>, reg: Reg, base: Reg, disp: i32) {
    emit_modrm_mem_raw(out, reg.encoding(), base, disp);
}

/// Same as [`emit_modrm_mem`] but takes the reg field's raw 3-bit encoding
/// directly, for instructions (movsd/movss/ucomisd/...) whose reg operand is
/// an XMM register rather than a [`Reg`] (§4.5).
fn emit_modrm_mem_raw(out: &mut Vec<u8>, reg_enc: u8, base: Reg, disp: i32) {
    let mode = displacement_mode(disp, base);
    out.push(modrm_raw(mode, reg_enc, base.encoding()));
    match mode {
        Mode::Indirect => {}
        Mode::Disp8 => out.push(disp as i8 as u8),
        Mode::Disp32 | Mode::Register => out.extend_from_slice(&disp.to_le_bytes()),
    }
}

/// SSE2 mandatory prefix selecting the scalar double/single opcode form
/// (§4.5): `F2` for `sd` (`F64`), `F3` for `ss` (`F32`).
fn sse_prefix(width: FloatWidth) -> u8 {
    match width {
        FloatWidth::F64 => 0xF2,
        FloatWidth::F32 => 0xF3,
    }
}

fn farith_opcode(op: FArithOp) -> u8 {
    match op {
        FArithOp::Add => 0x58,
        FArithOp::Mul => 0x59,
        FArithOp::Sub => 0x5C,
        FArithOp::Div => 0x5E,
    }
}

/// `ucomisd`/`ucomiss` set flags the same way an unsigned integer compare
/// does (§4.5), not the signed codes `cc_code` uses for `Cmp`: below/above
/// rather than less/greater.
fn cc_code_unsigned(op: CmpOp) -> u8 {
    match op {
        CmpOp::Eq => 0x4,
        CmpOp::Ne => 0x5,
        CmpOp::Lt => 0x2,
        CmpOp::Le => 0x6,
        CmpOp::Gt => 0x7,
        CmpOp::Ge => 0x3,
    }
}

/// A ModR/M byte whose reg field is an opcode-extension digit rather than a
/// register (the `/digit` notation in the ISA manual), used by single-operand
/// forms like `idiv`.
fn modrm_digit(digit: u8, rm: Reg) -> u8 {
    (0b11 << 6) | (digit << 3) | rm.encoding()
}

fn cc_code(op: CmpOp) -> u8 {
    match op {
        CmpOp::Eq => 0x4,
        CmpOp::Ne => 0x5,
        CmpOp::Lt => 0xC,
        CmpOp::Le => 0xE,
        CmpOp::Gt => 0xF,
        CmpOp::Ge => 0xD,
    }
}

/// Encode one function's body into the flat code stream (§4.5). Returns
/// `(call sites, absolute-address sites)` that need resolving once every
/// function's final address and every global's storage address are known:
/// call sites are `(byte offset of the rel32 field, callee name)`, absolute
/// sites are `(byte offset of the imm64 field, global name)`.
fn encode_function(f: &FunctionAsm, code: &mut Vec<u8>) -> (Vec<(u64, Id)>, Vec<(u64, Id)>) {
    let mut labels: Map<IrId, u64> = Map::new();
    let mut jump_fixups: Vec<(u64, IrId)> = Vec::new();
    let mut call_fixups: Vec<(u64, Id)> = Vec::new();
    let mut absolute_fixups: Vec<(u64, Id)> = Vec::new();

    for instr in &f.body {
        match instr {
            Instruction::Comment(_) => {}
            Instruction::Label(id) => {
                labels.insert(*id, code.len() as u64);
            }
            Instruction::MovRegImm64 { dst, imm } => {
                if let Some(b) = rex(true, false, false, dst.needs_rex_extension()) {
                    code.push(b);
                }
                code.push(0xB8 + dst.encoding());
                code.extend_from_slice(&imm.to_le_bytes());
            }
            Instruction::LoadGlobalAddr { dst, symbol } => {
                if let Some(b) = rex(true, false, false, dst.needs_rex_extension()) {
                    code.push(b);
                }
                code.push(0xB8 + dst.encoding());
                absolute_fixups.push((code.len() as u64, *symbol));
                code.extend_from_slice(&0i64.to_le_bytes());
            }
            Instruction::MovRegReg { dst, src } => {
                if let Some(b) = rex(true, src.needs_rex_extension(), false, dst.needs_rex_extension()) {
                    code.push(b);
                }
                code.push(0x89);
                code.push(ModRm { mode: Mode::Register, reg: *src, rm: *dst }.byte());
            }
            Instruction::LoadStack { dst, offset } => {
                if let Some(b) = rex(true, dst.needs_rex_extension(), false, Reg::Rbp.needs_rex_extension()) {
                    code.push(b);
                }
                code.push(0x8B);
                emit_modrm_mem(code, *dst, Reg::Rbp, *offset);
            }
            Instruction::StoreStack { offset, src } => {
                if let Some(b) = rex(true, src.needs_rex_extension(), false, Reg::Rbp.needs_rex_extension()) {
                    code.push(b);
                }
                code.push(0x89);
                emit_modrm_mem(code, *src, Reg::Rbp, *offset);
            }
            Instruction::Arith { op, dst, src } => encode_arith(code, *op, *dst, *src),
            Instruction::Cmp { a, b } => {
                if let Some(rb) = rex(true, b.needs_rex_extension(), false, a.needs_rex_extension()) {
                    code.push(rb);
                }
                code.push(0x39);
                code.push(ModRm { mode: Mode::Register, reg: *b, rm: *a }.byte());
            }
            Instruction::TestZero { reg } => {
                if let Some(b) = rex(true, reg.needs_rex_extension(), false, reg.needs_rex_extension()) {
                    code.push(b);
                }
                code.push(0x85);
                code.push(ModRm { mode: Mode::Register, reg: *reg, rm: *reg }.byte());
            }
            Instruction::SetCc { op, dst } => {
                if dst.needs_rex_extension() {
                    code.push(Rex { w: false, r: false, x: false, b: true }.byte());
                }
                code.push(0x0F);
                code.push(0x90 + cc_code(*op));
                code.push(ModRm { mode: Mode::Register, reg: Reg::Rax, rm: *dst }.byte());
                // movzx dst, dst(byte) so the full 64-bit slot holds 0/1.
                if let Some(b) = rex(true, dst.needs_rex_extension(), false, dst.needs_rex_extension()) {
                    code.push(b);
                }
                code.push(0x0F);
                code.push(0xB6);
                code.push(ModRm { mode: Mode::Register, reg: *dst, rm: *dst }.byte());
            }
            Instruction::MovGprToXmm { dst, src } => {
                // movq xmm, r64: 66 REX.W 0F 6E /r
                code.push(0x66);
                if let Some(b) = rex(true, dst.needs_rex_extension(), false, src.needs_rex_extension()) {
                    code.push(b);
                }
                code.push(0x0F);
                code.push(0x6E);
                code.push(modrm_raw(Mode::Register, dst.encoding(), src.encoding()));
            }
            Instruction::LoadStackXmm { dst, offset, width } => {
                code.push(sse_prefix(*width));
                if let Some(b) = rex(false, dst.needs_rex_extension(), false, Reg::Rbp.needs_rex_extension()) {
                    code.push(b);
                }
                code.push(0x0F);
                code.push(0x10);
                emit_modrm_mem_raw(code, dst.encoding(), Reg::Rbp, *offset);
            }
            Instruction::StoreStackXmm { offset, src, width } => {
                code.push(sse_prefix(*width));
                if let Some(b) = rex(false, src.needs_rex_extension(), false, Reg::Rbp.needs_rex_extension()) {
                    code.push(b);
                }
                code.push(0x0F);
                code.push(0x11);
                emit_modrm_mem_raw(code, src.encoding(), Reg::Rbp, *offset);
            }
            Instruction::FArith { op, dst, src, width } => {
                code.push(sse_prefix(*width));
                if let Some(b) = rex(false, dst.needs_rex_extension(), false, src.needs_rex_extension()) {
                    code.push(b);
                }
                code.push(0x0F);
                code.push(farith_opcode(*op));
                code.push(modrm_raw(Mode::Register, dst.encoding(), src.encoding()));
            }
            Instruction::FCmp { a, b, width } => {
                if *width == FloatWidth::F64 {
                    code.push(0x66);
                }
                if let Some(rb) = rex(false, a.needs_rex_extension(), false, b.needs_rex_extension()) {
                    code.push(rb);
                }
                code.push(0x0F);
                code.push(0x2E);
                code.push(modrm_raw(Mode::Register, a.encoding(), b.encoding()));
            }
            Instruction::FSetCc { op, dst } => {
                if dst.needs_rex_extension() {
                    code.push(Rex { w: false, r: false, x: false, b: true }.byte());
                }
                code.push(0x0F);
                code.push(0x90 + cc_code_unsigned(*op));
                code.push(ModRm { mode: Mode::Register, reg: Reg::Rax, rm: *dst }.byte());
                // movzx dst, dst(byte), same widening as the integer SetCc path.
                if let Some(b) = rex(true, dst.needs_rex_extension(), false, dst.needs_rex_extension()) {
                    code.push(b);
                }
                code.push(0x0F);
                code.push(0xB6);
                code.push(ModRm { mode: Mode::Register, reg: *dst, rm: *dst }.byte());
            }
            Instruction::Jmp(target) => {
                code.push(0xE9);
                jump_fixups.push((code.len() as u64, *target));
                code.extend_from_slice(&0i32.to_le_bytes());
            }
            Instruction::Jcc { op, target } => {
                code.push(0x0F);
                code.push(0x80 + cc_code(*op));
                jump_fixups.push((code.len() as u64, *target));
                code.extend_from_slice(&0i32.to_le_bytes());
            }
            Instruction::Call(CallTarget::Symbol(name)) => {
                code.push(0xE8);
                call_fixups.push((code.len() as u64, *name));
                code.extend_from_slice(&0i32.to_le_bytes());
            }
            Instruction::Push(reg) => {
                if reg.needs_rex_extension() {
                    code.push(Rex { w: false, r: false, x: false, b: true }.byte());
                }
                code.push(0x50 + reg.encoding());
            }
            Instruction::Pop(reg) => {
                if reg.needs_rex_extension() {
                    code.push(Rex { w: false, r: false, x: false, b: true }.byte());
                }
                code.push(0x58 + reg.encoding());
            }
            Instruction::Ret => code.push(0xC3),
        }
    }

    for (site, target) in jump_fixups {
        let target_off = *labels.get(&target).expect("jump target label must exist within its own function");
        patch_rel32(code, site, target_off as i64 - (site as i64 + 4));
    }

    (call_fixups, absolute_fixups)
}

fn encode_arith(code: &mut Vec<u8>, op: ArithOp, dst: Reg, src: Reg) {
    match op {
        ArithOp::Add | ArithOp::Sub | ArithOp::And | ArithOp::Or | ArithOp::Xor => {
            let opcode = match op {
                ArithOp::Add => 0x01,
                ArithOp::Sub => 0x29,
                ArithOp::And => 0x21,
                ArithOp::Or => 0x09,
                ArithOp::Xor => 0x31,
                _ => unreachable!(),
            };
            if let Some(b) = rex(true, src.needs_rex_extension(), false, dst.needs_rex_extension()) {
                code.push(b);
            }
            code.push(opcode);
            code.push(ModRm { mode: Mode::Register, reg: src, rm: dst }.byte());
        }
        ArithOp::Mul => {
            if let Some(b) = rex(true, dst.needs_rex_extension(), false, src.needs_rex_extension()) {
                code.push(b);
            }
            code.push(0x0F);
            code.push(0xAF);
            code.push(ModRm { mode: Mode::Register, reg: dst, rm: src }.byte());
        }
        ArithOp::Div | ArithOp::Mod => {
            debug_assert_eq!(dst, Reg::Rax, "division codegen assumes the dividend lives in rax");
            debug_assert_eq!(src, Reg::Rcx, "division codegen assumes the divisor lives in rcx");
            // cqo: sign-extend rax into rdx:rax.
            code.push(Rex { w: true, r: false, x: false, b: false }.byte());
            code.push(0x99);
            // idiv rcx (opcode extension /7 goes in ModRM.reg)
            code.push(Rex { w: true, r: false, x: false, b: false }.byte());
            code.push(0xF7);
            code.push(modrm_digit(7, Reg::Rcx));
            if op == ArithOp::Mod {
                // mov rax, rdx: the remainder codegen expects back in rax.
                if let Some(b) = rex(true, true, false, false) {
                    code.push(b);
                }
                code.push(0x89);
                code.push(ModRm { mode: Mode::Register, reg: Reg::Rdx, rm: Reg::Rax }.byte());
            }
        }
        ArithOp::Shl | ArithOp::Shr => {
            debug_assert_eq!(src, Reg::Rcx, "shift codegen assumes the count lives in cl");
            if let Some(b) = rex(true, false, false, dst.needs_rex_extension()) {
                code.push(b);
            }
            code.push(0xD3);
            let ext = if op == ArithOp::Shl { 4 } else { 5 };
            code.push(0b11_000_000 | (ext << 3) | dst.encoding());
        }
    }
}

fn patch_rel32(code: &mut [u8], site: u64, value: i64) {
    let bytes = (value as i32).to_le_bytes();
    let at = site as usize;
    code[at..at + 4].copy_from_slice(&bytes);
}

fn global_layout(ty: &Ty) -> (u32, u32) {
    match ty {
        Ty::U0 => (0, 1),
        Ty::I8 | Ty::U8 | Ty::Bool => (1, 1),
        Ty::I16 | Ty::U16 => (2, 2),
        Ty::I32 | Ty::U32 => (4, 4),
        Ty::F32 => (4, 4),
        Ty::F64 => (8, 8),
        Ty::Pointer(_) => (8, 8),
        _ => (8, 8),
    }
}

/// Assemble a whole program's functions into one [`AotImage`] (§3, §4.6):
/// concatenate every function body, resolve intra-module calls directly,
/// leave calls to undefined symbols as zeroed placeholders recorded in the
/// unresolved-globals side table for the loader, and lay out/patch every
/// global-address placeholder against a data region following the code.
pub fn assemble(
    functions: &[FunctionAsm],
    globals: &[(Id, Ty)],
    origin: u64,
    config: &CompilerConfig,
) -> AotImage {
    let _span = tracing::debug_span!("aot_assemble").entered();

    let mut code = Vec::new();
    let mut function_addresses = Map::new();
    let mut pending_calls: Vec<(u64, Id)> = Vec::new();
    let mut pending_absolutes: Vec<(u64, Id)> = Vec::new();

    for f in functions {
        function_addresses.insert(f.name, code.len() as u64);
        let (calls, absolutes) = encode_function(f, &mut code);
        pending_calls.extend(calls);
        pending_absolutes.extend(absolutes);
    }

    let mut unresolved_locals = Vec::new();
    let mut unresolved_globals = Vec::new();
    for (site, callee) in pending_calls {
        if let Some(&target) = function_addresses.get(&callee) {
            patch_rel32(&mut code, site, target as i64 - (site as i64 + 4));
            unresolved_locals.push(UnresolvedLocalRef { offset: site, callee });
        } else {
            unresolved_globals.push(UnresolvedGlobalRef { offset: site, symbol: callee });
        }
    }

    let heap_globals: Vec<HeapGlobalDescriptor> = globals
        .iter()
        .map(|(name, ty)| {
            let (size, align) = global_layout(ty);
            HeapGlobalDescriptor { name: *name, size, align }
        })
        .collect();

    // Globals live in a data region immediately after the code, laid out in
    // declaration order with each entry's own alignment (§4.6).
    let mut global_addresses: Map<Id, u64> = Map::new();
    let mut data_cursor = origin + code.len() as u64;
    for g in &heap_globals {
        let align = g.align.max(1) as u64;
        data_cursor = (data_cursor + align - 1) / align * align;
        global_addresses.insert(g.name, data_cursor);
        data_cursor += g.size as u64;
    }

    let mut fixups = Vec::new();
    for (site, symbol) in pending_absolutes {
        if let Some(&addr) = global_addresses.get(&symbol) {
            let at = site as usize;
            code[at..at + 8].copy_from_slice(&addr.to_le_bytes());
        }
        fixups.push(AbsoluteFixup { offset: site, symbol });
    }

    let max_alignment = heap_globals.iter().map(|g| g.align).max().unwrap_or(8);
    let total_bytes = code.len() as u64;
    let blocks = AotImage::chunk(&code, config.aot_block_size);

    let header = AotHeader {
        origin,
        total_bytes,
        max_alignment,
        unresolved_local_count: unresolved_locals.len() as u32,
        unresolved_global_count: unresolved_globals.len() as u32,
        fixup_count: fixups.len() as u32,
        heap_global_count: heap_globals.len() as u32,
    };

    AotImage {
        header,
        blocks,
        function_addresses,
        unresolved_locals,
        unresolved_globals,
        fixups,
        heap_globals,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompilerConfig;
    use crate::front::parse;
    use crate::middle::lower::lower;
    use crate::back::codegen::codegen;

    #[test]
    fn resolves_a_local_call_to_a_concrete_displacement() {
        let src = "I64 add(I64 a, I64 b) { return a + b; } I64 main() { return add(1, 2); }";
        let (ast, _symbols, _diags) = parse(src, &CompilerConfig::default());
        let program = lower(&ast);
        let funcs = codegen(&program);
        let image = assemble(&funcs, &program.globals, 0x1000, &CompilerConfig::default());
        assert_eq!(image.unresolved_globals.len(), 0);
        assert_eq!(image.unresolved_locals.len(), 1);
    }

    #[test]
    fn calls_to_undefined_symbols_become_unresolved_global_refs() {
        let src = "I64 main() { return Print(); }";
        let (ast, _symbols, _diags) = parse(src, &CompilerConfig::default());
        let program = lower(&ast);
        let funcs = codegen(&program);
        let image = assemble(&funcs, &program.globals, 0, &CompilerConfig::default());
        assert_eq!(image.unresolved_locals.len(), 0);
        assert_eq!(image.unresolved_globals.len(), 1);
        assert_eq!(image.unresolved_globals[0].symbol.as_str(), "Print");
    }

    #[test]
    fn loading_a_global_records_and_resolves_an_absolute_fixup() {
        let src = "I64 counter; I64 main() { return counter; }";
        let (ast, _symbols, _diags) = parse(src, &CompilerConfig::default());
        let program = lower(&ast);
        let funcs = codegen(&program);
        let image = assemble(&funcs, &program.globals, 0x1000, &CompilerConfig::default());
        assert_eq!(image.fixups.len(), 1);
        assert_eq!(image.fixups[0].symbol.as_str(), "counter");
        let total = image.blocks.iter().map(|b| b.len()).sum::<usize>();
        let at = image.fixups[0].offset as usize;
        assert!(at + 8 <= total, "the fixup site must fall within the encoded code");
        let code: Vec<u8> = image.blocks.iter().flatten().copied().collect();
        let patched = u64::from_le_bytes(code[at..at + 8].try_into().unwrap());
        assert_ne!(patched, 0, "the placeholder must have been patched to the global's real address");
    }

    #[test]
    fn image_is_chunked_into_configured_block_size() {
        let src = "I64 main() { return 1; }";
        let (ast, _symbols, _diags) = parse(src, &CompilerConfig::default());
        let program = lower(&ast);
        let funcs = codegen(&program);
        let mut config = CompilerConfig::default();
        config.aot_block_size = 8;
        let image = assemble(&funcs, &program.globals, 0, &config);
        assert!(image.blocks.iter().all(|b| b.len() <= 8));
        assert_eq!(image.header.total_bytes, image.blocks.iter().map(|b| b.len() as u64).sum::<u64>());
    }

    #[test]
    fn a_float_function_encodes_without_panicking_and_has_no_zero_length_code() {
        let src = "F64 main() { F64 x = 1.5; F64 y = 2.5; return x + y; }";
        let (ast, _symbols, _diags) = parse(src, &CompilerConfig::default());
        let program = lower(&ast);
        let funcs = codegen(&program);
        let image = assemble(&funcs, &program.globals, 0x1000, &CompilerConfig::default());
        assert!(image.header.total_bytes > 0);
    }

    #[test]
    fn f32_globals_are_laid_out_4_byte_aligned() {
        let src = "F32 ratio; I64 main() { return 0; }";
        let (ast, _symbols, _diags) = parse(src, &CompilerConfig::default());
        let program = lower(&ast);
        let funcs = codegen(&program);
        let image = assemble(&funcs, &program.globals, 0, &CompilerConfig::default());
        let ratio = image.heap_globals.iter().find(|g| g.name.as_str() == "ratio").unwrap();
        assert_eq!(ratio.size, 4);
        assert_eq!(ratio.align, 4);
    }
}
