//! Token kinds and the [`Token`] carrier type (§3 Token, §4.1).

use derive_more::Display;

use crate::common::Pos;

/// The fixed enumeration of token classes the lexer recognizes (§3).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display)]
#[display("{self:?}")]
pub enum TokenKind {
    // Literals
    Ident,
    IntLit,
    FloatLit,
    StringLit,
    CharLit,
    MultiCharConst,

    // Keywords
    If,
    Else,
    While,
    Do,
    For,
    Switch,
    Case,
    Default,
    Start,
    End,
    Break,
    Continue,
    Return,
    Class,
    Union,
    Public,
    Try,
    Catch,
    Throw,
    Asm,
    Extern,
    Import,
    NoBounds,

    // Built-in types
    U0,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    Bool,

    // Size specifiers (used inside `asm {}` blocks)
    Byte,
    Word,
    Dword,
    Qword,

    // x86 register names (subset sufficient for inline-asm blocks, §4.1/§4.5)
    Register,
    // x86 opcode mnemonics (subset, §4.5)
    Opcode,
    // Segment registers: fs, gs, cs, ds, es, ss
    SegmentRegister,

    // Punctuation
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Semi,
    Comma,
    Colon,
    ColonColon,
    Dot,
    Arrow,
    Question,
    DotDotDot,
    DotDot,

    // Operators
    Assign,
    PlusAssign,
    MinusAssign,
    StarAssign,
    SlashAssign,
    PercentAssign,
    AmpAssign,
    PipeAssign,
    CaretAssign,
    ShlAssign,
    ShrAssign,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    PlusPlus,
    MinusMinus,
    Amp,
    AmpAmp,
    Pipe,
    PipePipe,
    Caret,
    CaretCaret,
    Tilde,
    Bang,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Shl,
    Shr,

    Eof,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// A lexed token: its class, the exact source slice it came from, and its
/// source position (§3).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
#[display("kind: '{kind}', part of input: '{text}'")]
pub struct Token<'src> {
    pub kind: TokenKind,
    pub text: &'src str,
    pub pos: Pos,
}

impl<'src> Token<'src> {
    pub fn new(kind: TokenKind, text: &'src str, pos: Pos) -> Self {
        Token { kind, text, pos }
    }

    pub fn eof(pos: Pos) -> Self {
        Token { kind: TokenKind::Eof, text: "", pos }
    }
}

/// Keyword/type/register/opcode table consulted after an identifier is
/// recognized (§4.1): "if their text matches the keyword/type/register/opcode
/// table the corresponding token tag is emitted, otherwise IDENT."
pub fn keyword_lookup(text: &str) -> Option<TokenKind> {
    use TokenKind::*;
    Some(match text {
        "if" => If,
        "else" => Else,
        "while" => While,
        "do" => Do,
        "for" => For,
        "switch" => Switch,
        "case" => Case,
        "default" => Default,
        "start" => Start,
        "end" => End,
        "break" => Break,
        "continue" => Continue,
        "return" => Return,
        "class" => Class,
        "union" => Union,
        "public" => Public,
        "try" => Try,
        "catch" => Catch,
        "throw" => Throw,
        "asm" => Asm,
        "extern" => Extern,
        "import" => Import,
        "nobounds" => NoBounds,

        "U0" => U0,
        "I8" => I8,
        "U8" => U8,
        "I16" => I16,
        "U16" => U16,
        "I32" => I32,
        "U32" => U32,
        "I64" => I64,
        "U64" => U64,
        "F32" => F32,
        "F64" => F64,
        "Bool" => Bool,

        "byte" => Byte,
        "word" => Word,
        "dword" => Dword,
        "qword" => Qword,

        "fs" | "gs" | "cs" | "ds" | "es" | "ss" => SegmentRegister,

        "rax" | "rbx" | "rcx" | "rdx" | "rsi" | "rdi" | "rbp" | "rsp" | "r8" | "r9" | "r10"
        | "r11" | "r12" | "r13" | "r14" | "r15" | "eax" | "ebx" | "ecx" | "edx" | "al" | "bl"
        | "cl" | "dl" => Register,

        "mov" | "add" | "sub" | "mul" | "imul" | "div" | "idiv" | "and" | "or" | "xor"
        | "not" | "neg" | "shl" | "shr" | "sar" | "cmp" | "test" | "jmp" | "je" | "jne"
        | "jl" | "jle" | "jg" | "jge" | "jz" | "jnz" | "call" | "ret" | "push" | "pop"
        | "lea" | "nop" | "int" => Opcode,

        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyword_lookup_resolves_control_flow_keywords() {
        assert_eq!(keyword_lookup("switch"), Some(TokenKind::Switch));
        assert_eq!(keyword_lookup("start"), Some(TokenKind::Start));
        assert_eq!(keyword_lookup("end"), Some(TokenKind::End));
    }

    #[test]
    fn keyword_lookup_resolves_builtin_types() {
        assert_eq!(keyword_lookup("I64"), Some(TokenKind::I64));
        assert_eq!(keyword_lookup("U0"), Some(TokenKind::U0));
    }

    #[test]
    fn keyword_lookup_falls_through_to_none_for_plain_identifiers() {
        assert_eq!(keyword_lookup("foo"), None);
        assert_eq!(keyword_lookup("main"), None);
    }

    #[test]
    fn keyword_lookup_resolves_registers_and_opcodes() {
        assert_eq!(keyword_lookup("rax"), Some(TokenKind::Register));
        assert_eq!(keyword_lookup("mov"), Some(TokenKind::Opcode));
        assert_eq!(keyword_lookup("gs"), Some(TokenKind::SegmentRegister));
    }
}
