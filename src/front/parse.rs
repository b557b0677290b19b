//! The parser (§4.2).
//!
//! Recursive descent with a Pratt-style operator-precedence expression chain.
//! Every entry point returns `Result<_, ParseError>` (§9 design note: no
//! out-of-band control flow); [`Parser::recover`] decides whether a failure
//! is absorbed (a diagnostic is recorded and parsing resumes) or propagated
//! as genuinely fatal.

use derive_more::Display;

use crate::common::{intern, Id};
use crate::config::CompilerConfig;
use crate::diagnostics::{DiagnosticBag, Phase};
use crate::front::ast::*;
use crate::front::lex::{Lexer, LexerState};
use crate::front::scope::{Declare, ScopeStack, SymbolKind, SymbolTable};
use crate::front::token::{Token, TokenKind};

#[derive(Clone, Debug, Display)]
#[display("Parse error: {message}")]
pub struct ParseError {
    pub message: String,
    pub pos: crate::common::Pos,
}

/// Error-recovery strategies (§4.2, §7).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Recovery {
    SkipToSemi,
    SkipToMatchingBrace,
    SkipToMatchingParen,
    SkipToKeyword,
    SkipToNewline,
    InsertMissingToken,
    DeleteCurrentToken,
    ReplaceToken,
    RestartStatement,
    RestartFunction,
    RestartBlock,
}

/// Choose a recovery strategy from the error message's content (§7): this
/// mirrors the original compiler's ad hoc dispatch so the documented
/// strategy table is honored verbatim rather than reinvented.
fn strategy_for(message: &str) -> Recovery {
    let lower = message.to_ascii_lowercase();
    if lower.contains("missing") {
        Recovery::InsertMissingToken
    } else if lower.contains("unexpected") {
        Recovery::DeleteCurrentToken
    } else if lower.contains("expected") || lower.contains("syntax") {
        Recovery::SkipToSemi
    } else {
        Recovery::SkipToSemi
    }
}

/// Pre-registered builtin function signatures (§4.2, §6 builtin contract):
/// `Print`, `PutChars`, `PutChar`, `GetI64`, `GetF64`, `GetString`. `Print`'s
/// true signature is variadic (`fmt, ...`); only the mandatory `fmt` argument
/// is listed here and call sites are not arity-checked against it (§4.2).
pub(crate) const BUILTINS: &[(&str, &[TypeSpec], TypeSpec)] = &[
    ("Print", &[TypeSpec::String], TypeSpec::U0),
    ("PutChars", &[TypeSpec::String], TypeSpec::U0),
    ("PutChar", &[TypeSpec::Int(IntWidth::I64)], TypeSpec::U0),
    ("GetI64", &[], TypeSpec::Int(IntWidth::I64)),
    ("GetF64", &[], TypeSpec::F64),
    ("GetString", &[], TypeSpec::String),
];

pub struct Parser<'src> {
    lexer: Lexer<'src>,
    cur: Token<'src>,
    pub ast: Ast,
    pub scopes: ScopeStack,
    pub symbols: SymbolTable,
    pub diags: DiagnosticBag,
    config: CompilerConfig,
    recovery_depth: u32,
    recovery_attempts: u32,
}

/// A saved parser cursor (lexer state + current token), for speculative
/// lookahead (§4.2).
struct ParserState<'src> {
    lexer: LexerState,
    cur: Token<'src>,
}

impl<'src> Parser<'src> {
    pub fn new(input: &'src str, config: CompilerConfig) -> Self {
        let mut diags = DiagnosticBag::new();
        let mut lexer = Lexer::new(input);
        let cur = lexer.next(&mut diags);
        let mut symbols = SymbolTable::new();
        // Builtin signatures per §4.2/§6: Print, PutChars, PutChar, GetI64,
        // GetF64, GetString. Registered by name with their real return type;
        // their NodeId is a sentinel since they have no AST declaration of
        // their own.
        for (name, _params, ret) in BUILTINS {
            symbols.insert(intern(*name), SymbolKind::Function, NodeId(u32::MAX), ret.clone());
        }
        Parser {
            lexer,
            cur,
            ast: Ast::new(),
            scopes: ScopeStack::new(),
            symbols,
            diags,
            config,
            recovery_depth: 0,
            recovery_attempts: 0,
        }
    }

    fn save(&self) -> ParserState<'src> {
        ParserState { lexer: self.lexer.save(), cur: self.cur }
    }

    fn restore(&mut self, state: ParserState<'src>) {
        self.lexer.restore(state.lexer);
        self.cur = state.cur;
    }

    fn bump(&mut self) -> Token<'src> {
        let prev = self.cur;
        self.cur = self.lexer.next(&mut self.diags);
        prev
    }

    fn at(&self, kind: TokenKind) -> bool {
        self.cur.kind == kind
    }

    fn eat(&mut self, kind: TokenKind) -> bool {
        if self.at(kind) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> Result<Token<'src>, ParseError> {
        if self.cur.kind == kind {
            Ok(self.bump())
        } else {
            Err(self.err(format!("expected {what}, found '{}'", self.cur.text)))
        }
    }

    fn err(&self, message: impl Into<String>) -> ParseError {
        ParseError { message: message.into(), pos: self.cur.pos }
    }

    fn pos(&self) -> Pos {
        self.cur.pos.into()
    }

    /// Absorb a parse error: record it as a diagnostic, apply the recovery
    /// strategy chosen from its message, and report whether the caller may
    /// keep going. Rate-limited by `CompilerConfig` (§4.2): exceeding the
    /// depth or attempt budget makes the error fatal instead.
    fn recover(&mut self, error: ParseError) -> bool {
        self.diags.error(Phase::Parse, error.pos.line, error.pos.column, error.message.clone());
        if self.recovery_depth >= self.config.max_recovery_depth
            || self.recovery_attempts >= self.config.max_recovery_attempts
        {
            return false;
        }
        self.recovery_depth += 1;
        self.recovery_attempts += 1;
        match strategy_for(&error.message) {
            Recovery::SkipToSemi => {
                while !self.at(TokenKind::Semi) && !self.at(TokenKind::Eof) {
                    self.bump();
                }
                self.eat(TokenKind::Semi);
            }
            Recovery::SkipToMatchingBrace => self.skip_balanced(TokenKind::LBrace, TokenKind::RBrace),
            Recovery::SkipToMatchingParen => self.skip_balanced(TokenKind::LParen, TokenKind::RParen),
            Recovery::InsertMissingToken | Recovery::DeleteCurrentToken | Recovery::ReplaceToken => {
                if !self.at(TokenKind::Eof) {
                    self.bump();
                }
            }
            Recovery::SkipToKeyword => {
                while !self.at(TokenKind::Eof)
                    && !matches!(
                        self.cur.kind,
                        TokenKind::If
                            | TokenKind::While
                            | TokenKind::For
                            | TokenKind::Switch
                            | TokenKind::Return
                            | TokenKind::RBrace
                    )
                {
                    self.bump();
                }
            }
            Recovery::SkipToNewline | Recovery::RestartStatement | Recovery::RestartBlock | Recovery::RestartFunction => {
                while !self.at(TokenKind::Semi) && !self.at(TokenKind::RBrace) && !self.at(TokenKind::Eof) {
                    self.bump();
                }
            }
        }
        self.recovery_depth -= 1;
        true
    }

    fn skip_balanced(&mut self, open: TokenKind, close: TokenKind) {
        let mut depth = 0i32;
        if self.at(open) {
            depth = 1;
            self.bump();
        }
        while depth > 0 && !self.at(TokenKind::Eof) {
            if self.cur.kind == open {
                depth += 1;
            } else if self.cur.kind == close {
                depth -= 1;
            }
            self.bump();
        }
    }

    fn reset_recovery_budget(&mut self) {
        self.recovery_attempts = 0;
    }

    // ----- top level -----------------------------------------------------

    pub fn parse_program(&mut self) -> Program_ {
        let mut decls = Vec::new();
        while !self.at(TokenKind::Eof) {
            self.reset_recovery_budget();
            match self.parse_top_level() {
                Ok(id) => decls.push(id),
                Err(e) => {
                    if !self.recover(e) {
                        break;
                    }
                }
            }
        }
        let root = self.ast.alloc(NodeKind::Program { decls }, Pos::default(), None);
        self.ast.root = Some(root);
        Program_(root)
    }

    fn parse_top_level(&mut self) -> Result<NodeId, ParseError> {
        if self.at(TokenKind::Class) {
            return self.parse_class_def(false);
        }
        if self.at(TokenKind::Public) {
            return self.parse_public_decl();
        }
        if self.at(TokenKind::Union) {
            return self.parse_union_def(None, false);
        }
        self.parse_function_or_variable(false)
    }

    fn parse_public_decl(&mut self) -> Result<NodeId, ParseError> {
        // Disambiguation (c): `public?` + identifier + `union` => type-prefixed
        // union; otherwise a public class/function/variable declaration.
        let state = self.save();
        self.bump(); // `public`
        if self.at(TokenKind::Ident) {
            let prefix = intern(self.cur.text);
            self.bump();
            if self.at(TokenKind::Union) {
                return self.parse_union_def(Some(prefix), true);
            }
        }
        self.restore(state);
        self.bump(); // `public`
        if self.at(TokenKind::Class) {
            return self.parse_class_def(true);
        }
        if self.at(TokenKind::Union) {
            return self.parse_union_def(None, true);
        }
        self.parse_function_or_variable(true)
    }

    fn parse_union_def(&mut self, prefix: Option<Id>, is_public: bool) -> Result<NodeId, ParseError> {
        let pos = self.pos();
        let prefix_type = prefix.unwrap_or_else(|| intern("I64"));
        self.expect(TokenKind::Union, "'union'")?;
        let name = self.expect_ident("union name")?;
        self.expect(TokenKind::LBrace, "'{'")?;
        let mut members = Vec::new();
        while !self.at(TokenKind::RBrace) && !self.at(TokenKind::Eof) {
            let ty = self.parse_type_spec()?;
            let mname = self.expect_ident("member name")?;
            self.expect(TokenKind::Semi, "';'")?;
            members.push(Param { name: mname, ty, default: None, is_vararg: false });
        }
        self.expect(TokenKind::RBrace, "'}'")?;
        self.eat(TokenKind::Semi);
        Ok(self.ast.alloc(
            NodeKind::UnionDef { prefix_type, name, members, is_public },
            pos,
            None,
        ))
    }

    fn parse_class_def(&mut self, is_public: bool) -> Result<NodeId, ParseError> {
        let pos = self.pos();
        self.expect(TokenKind::Class, "'class'")?;
        let name = self.expect_ident("class name")?;
        self.expect(TokenKind::LBrace, "'{'")?;
        let mut fields = Vec::new();
        while !self.at(TokenKind::RBrace) && !self.at(TokenKind::Eof) {
            let ty = self.parse_type_spec()?;
            let fname = self.expect_ident("field name")?;
            self.expect(TokenKind::Semi, "';'")?;
            fields.push(Param { name: fname, ty, default: None, is_vararg: false });
        }
        self.expect(TokenKind::RBrace, "'}'")?;
        self.eat(TokenKind::Semi);
        Ok(self.ast.alloc(NodeKind::ClassDef { name, fields, is_public }, pos, None))
    }

    /// Disambiguation (b): type specifier followed by `IDENT (` is a function
    /// definition, otherwise a variable declaration.
    fn parse_function_or_variable(&mut self, is_public: bool) -> Result<NodeId, ParseError> {
        let pos = self.pos();
        let ty = self.parse_type_spec()?;
        let name = self.expect_ident("declaration name")?;
        if self.at(TokenKind::LParen) {
            self.parse_function_rest(pos, name, ty, is_public)
        } else {
            self.parse_variable_rest(pos, name, ty)
        }
    }

    fn parse_function_rest(
        &mut self,
        pos: Pos,
        name: Id,
        ret: TypeSpec,
        is_public: bool,
    ) -> Result<NodeId, ParseError> {
        self.expect(TokenKind::LParen, "'('")?;
        let mut params = Vec::new();
        let mut seen_vararg = false;
        while !self.at(TokenKind::RParen) {
            if self.at(TokenKind::DotDotDot) {
                self.bump();
                params.push(Param {
                    name: intern("..."),
                    ty: TypeSpec::U0,
                    default: None,
                    is_vararg: true,
                });
                seen_vararg = true;
                if !self.at(TokenKind::RParen) {
                    return Err(self.err("'...' not last parameter"));
                }
                break;
            }
            if seen_vararg {
                return Err(self.err("'...' not last parameter"));
            }
            let pty = self.parse_type_spec()?;
            let pname = self.expect_ident("parameter name")?;
            let default = if self.eat(TokenKind::Assign) { Some(self.parse_expr()?) } else { None };
            params.push(Param { name: pname, ty: pty, default, is_vararg: false });
            if !self.eat(TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RParen, "')'")?;

        self.symbols.insert(name, SymbolKind::Function, NodeId(0), ret.clone());

        let body = if self.at(TokenKind::LBrace) {
            self.scopes.enter_function();
            for p in &params {
                self.scopes.declare(p.name, NodeId(0), p.ty.clone());
                // Also recorded in the flat symbol table (not just the scope
                // stack) so the type checker, which only sees `SymbolTable`,
                // can resolve a parameter's declared type (§4.3).
                self.symbols.insert(p.name, SymbolKind::Variable, NodeId(0), p.ty.clone());
            }
            let b = self.parse_block()?;
            self.scopes.exit();
            Some(b)
        } else {
            self.expect(TokenKind::Semi, "';'")?;
            None
        };
        Ok(self.ast.alloc(NodeKind::Function { name, ret, params, body, is_public }, pos, None))
    }

    fn parse_variable_rest(&mut self, pos: Pos, name: Id, ty: TypeSpec) -> Result<NodeId, ParseError> {
        let init = if self.eat(TokenKind::Assign) { Some(self.parse_expr()?) } else { None };
        self.expect(TokenKind::Semi, "';'")?;
        let decl = self.ast.alloc(NodeKind::Variable { name, ty: ty.clone(), init }, pos, None);
        match self.scopes.declare(name, decl, ty.clone()) {
            Declare::Ok(_) => {
                // Recorded regardless of scope depth (global or local, §4.3):
                // the type checker and lowering only see the flat symbol
                // table, never the parser's own scope stack, so a
                // function-local variable's declared type would otherwise be
                // unrecoverable after parsing finishes.
                self.symbols.insert(name, SymbolKind::Variable, decl, ty);
            }
            Declare::Redeclared(_) => {
                self.diags.warning(
                    Phase::Parse,
                    pos.line,
                    pos.column,
                    format!("variable '{name}' already defined in current scope"),
                );
            }
        }
        Ok(decl)
    }

    fn expect_ident(&mut self, what: &str) -> Result<Id, ParseError> {
        if self.at(TokenKind::Ident) {
            let text = self.cur.text;
            self.bump();
            Ok(intern(text))
        } else {
            Err(self.err(format!("expected {what}, found '{}'", self.cur.text)))
        }
    }

    fn parse_type_spec(&mut self) -> Result<TypeSpec, ParseError> {
        let mut ty = match self.cur.kind {
            TokenKind::U0 => {
                self.bump();
                TypeSpec::U0
            }
            TokenKind::I8 => {
                self.bump();
                TypeSpec::Int(IntWidth::I8)
            }
            TokenKind::U8 => {
                self.bump();
                TypeSpec::Int(IntWidth::U8)
            }
            TokenKind::I16 => {
                self.bump();
                TypeSpec::Int(IntWidth::I16)
            }
            TokenKind::U16 => {
                self.bump();
                TypeSpec::Int(IntWidth::U16)
            }
            TokenKind::I32 => {
                self.bump();
                TypeSpec::Int(IntWidth::I32)
            }
            TokenKind::U32 => {
                self.bump();
                TypeSpec::Int(IntWidth::U32)
            }
            TokenKind::I64 => {
                self.bump();
                TypeSpec::Int(IntWidth::I64)
            }
            TokenKind::U64 => {
                self.bump();
                TypeSpec::Int(IntWidth::U64)
            }
            TokenKind::F32 => {
                self.bump();
                TypeSpec::F32
            }
            TokenKind::F64 => {
                self.bump();
                TypeSpec::F64
            }
            TokenKind::Bool => {
                self.bump();
                TypeSpec::Bool
            }
            TokenKind::Ident => {
                let name = intern(self.cur.text);
                self.bump();
                TypeSpec::Named(name)
            }
            _ => return Err(self.err(format!("expected type specifier, found '{}'", self.cur.text))),
        };
        while self.eat(TokenKind::Star) {
            ty = TypeSpec::Pointer(Box::new(ty));
        }
        Ok(ty)
    }

    // ----- statements ------------------------------------------------------

    fn parse_block(&mut self) -> Result<NodeId, ParseError> {
        let pos = self.pos();
        self.expect(TokenKind::LBrace, "'{'")?;
        self.scopes.enter_block();
        let mut stmts = Vec::new();
        while !self.at(TokenKind::RBrace) && !self.at(TokenKind::Eof) {
            if stmts.len() as u32 >= self.config.max_statements_per_block {
                self.diags.error(
                    Phase::Parse,
                    self.cur.pos.line,
                    self.cur.pos.column,
                    "too many statements in block",
                );
                self.skip_balanced(TokenKind::LBrace, TokenKind::RBrace);
                self.scopes.exit();
                return Ok(self.ast.alloc(NodeKind::Block { stmts }, pos, None));
            }
            self.reset_recovery_budget();
            match self.parse_stmt() {
                Ok(id) => stmts.push(id),
                Err(e) => {
                    if !self.recover(e) {
                        break;
                    }
                }
            }
        }
        self.expect(TokenKind::RBrace, "'}'")?;
        self.scopes.exit();
        Ok(self.ast.alloc(NodeKind::Block { stmts }, pos, None))
    }

    fn parse_stmt(&mut self) -> Result<NodeId, ParseError> {
        let pos = self.pos();
        match self.cur.kind {
            TokenKind::LBrace => self.parse_block(),
            TokenKind::If => self.parse_if(),
            TokenKind::While => self.parse_while(),
            TokenKind::Do => self.parse_do_while(),
            TokenKind::For => self.parse_for(),
            TokenKind::Switch => self.parse_switch(),
            TokenKind::Break => {
                self.bump();
                self.expect(TokenKind::Semi, "';'")?;
                Ok(self.ast.alloc(NodeKind::Break, pos, None))
            }
            TokenKind::Continue => {
                self.bump();
                self.expect(TokenKind::Semi, "';'")?;
                Ok(self.ast.alloc(NodeKind::Continue, pos, None))
            }
            TokenKind::Return => {
                self.bump();
                let value = if self.at(TokenKind::Semi) { None } else { Some(self.parse_expr()?) };
                self.expect(TokenKind::Semi, "';'")?;
                Ok(self.ast.alloc(NodeKind::Return { value }, pos, None))
            }
            TokenKind::Try => self.parse_try(),
            TokenKind::Throw => {
                self.bump();
                let value = self.parse_expr()?;
                self.expect(TokenKind::Semi, "';'")?;
                Ok(self.ast.alloc(NodeKind::Throw { value }, pos, None))
            }
            TokenKind::Asm => self.parse_asm_block(),
            TokenKind::Class => self.parse_class_def(false),
            TokenKind::Union => self.parse_union_def(None, false),
            TokenKind::Ident => self.parse_ident_led_stmt(),
            _ if self.is_type_specifier_start() => self.parse_function_or_variable(false),
            _ => {
                let expr = self.parse_expr()?;
                self.expect(TokenKind::Semi, "';'")?;
                Ok(expr)
            }
        }
    }

    fn is_type_specifier_start(&self) -> bool {
        matches!(
            self.cur.kind,
            TokenKind::U0
                | TokenKind::I8
                | TokenKind::U8
                | TokenKind::I16
                | TokenKind::U16
                | TokenKind::I32
                | TokenKind::U32
                | TokenKind::I64
                | TokenKind::U64
                | TokenKind::F64
                | TokenKind::Bool
        )
    }

    /// Disambiguation (a): `IDENT :` / `IDENT ::` is a label, not an
    /// expression statement.
    fn parse_ident_led_stmt(&mut self) -> Result<NodeId, ParseError> {
        let state = self.save();
        let pos = self.pos();
        let name = intern(self.cur.text);
        self.bump();
        if self.at(TokenKind::Colon) || self.at(TokenKind::ColonColon) {
            self.bump();
            return Ok(self.ast.alloc(NodeKind::Label { name }, pos, None));
        }
        self.restore(state);
        let expr = self.parse_expr()?;
        self.expect(TokenKind::Semi, "';'")?;
        Ok(expr)
    }

    fn parse_if(&mut self) -> Result<NodeId, ParseError> {
        let pos = self.pos();
        self.bump();
        self.expect(TokenKind::LParen, "'('")?;
        let cond = self.parse_expr()?;
        self.expect(TokenKind::RParen, "')'")?;
        let then_branch = self.parse_stmt()?;
        let else_branch = if self.eat(TokenKind::Else) { Some(self.parse_stmt()?) } else { None };
        Ok(self.ast.alloc(NodeKind::If { cond, then_branch, else_branch }, pos, None))
    }

    fn parse_while(&mut self) -> Result<NodeId, ParseError> {
        let pos = self.pos();
        self.bump();
        self.expect(TokenKind::LParen, "'('")?;
        let cond = self.parse_expr()?;
        self.expect(TokenKind::RParen, "')'")?;
        let body = self.parse_stmt()?;
        Ok(self.ast.alloc(NodeKind::While { cond, body }, pos, None))
    }

    fn parse_do_while(&mut self) -> Result<NodeId, ParseError> {
        let pos = self.pos();
        self.bump();
        let body = self.parse_stmt()?;
        self.expect(TokenKind::While, "'while'")?;
        self.expect(TokenKind::LParen, "'('")?;
        let cond = self.parse_expr()?;
        self.expect(TokenKind::RParen, "')'")?;
        self.expect(TokenKind::Semi, "';'")?;
        Ok(self.ast.alloc(NodeKind::DoWhile { body, cond }, pos, None))
    }

    fn parse_for(&mut self) -> Result<NodeId, ParseError> {
        let pos = self.pos();
        self.bump();
        self.expect(TokenKind::LParen, "'('")?;
        self.scopes.enter_block();
        let init = if self.at(TokenKind::Semi) {
            None
        } else if self.is_type_specifier_start() {
            Some(self.parse_function_or_variable(false)?)
        } else {
            let e = self.parse_expr()?;
            self.expect(TokenKind::Semi, "';'")?;
            Some(e)
        };
        let cond = if self.at(TokenKind::Semi) { None } else { Some(self.parse_expr()?) };
        self.expect(TokenKind::Semi, "';'")?;
        let step = if self.at(TokenKind::RParen) { None } else { Some(self.parse_expr()?) };
        self.expect(TokenKind::RParen, "')'")?;
        let body = self.parse_stmt()?;
        self.scopes.exit();
        Ok(self.ast.alloc(NodeKind::For { init, cond, step, body }, pos, None))
    }

    fn parse_try(&mut self) -> Result<NodeId, ParseError> {
        let pos = self.pos();
        self.bump();
        let body = self.parse_block()?;
        let catch_body = if self.eat(TokenKind::Catch) { Some(self.parse_block()?) } else { None };
        Ok(self.ast.alloc(NodeKind::Try { body, catch_body }, pos, None))
    }

    fn parse_switch(&mut self) -> Result<NodeId, ParseError> {
        let pos = self.pos();
        self.bump();
        let nobounds = self.eat(TokenKind::NoBounds);
        let (open, close) = if nobounds {
            (TokenKind::LBracket, TokenKind::RBracket)
        } else {
            (TokenKind::LParen, TokenKind::RParen)
        };
        self.expect(open, "'(' or '['")?;
        let scrutinee = self.parse_expr()?;
        self.expect(close, "')' or ']'")?;
        self.expect(TokenKind::LBrace, "'{'")?;

        let mut cases = Vec::new();
        let mut default = None;
        let mut start_block = None;
        let mut end_block = None;
        let mut seen_default = false;

        while !self.at(TokenKind::RBrace) && !self.at(TokenKind::Eof) {
            if self.eat(TokenKind::Start) {
                self.expect(TokenKind::Colon, "':'")?;
                start_block = Some(self.parse_case_body()?);
                continue;
            }
            if self.eat(TokenKind::End) {
                self.expect(TokenKind::Colon, "':'")?;
                end_block = Some(self.parse_case_body()?);
                continue;
            }
            if self.eat(TokenKind::Default) {
                if seen_default {
                    return Err(self.err("duplicate default case"));
                }
                seen_default = true;
                self.expect(TokenKind::Colon, "':'")?;
                default = Some(self.parse_case_body()?);
                continue;
            }
            self.expect(TokenKind::Case, "'case'")?;
            let value = self.parse_case_value()?;
            self.expect(TokenKind::Colon, "':'")?;
            let body = self.parse_case_body()?;
            cases.push(Case { value, body });
        }
        self.expect(TokenKind::RBrace, "'}'")?;
        Ok(self.ast.alloc(
            NodeKind::Switch { nobounds, scrutinee, cases, default, start_block, end_block },
            pos,
            None,
        ))
    }

    fn parse_case_value(&mut self) -> Result<CaseValue, ParseError> {
        if self.at(TokenKind::Colon) {
            return Ok(CaseValue::Null);
        }
        let lo = self.parse_ternary()?;
        if self.eat(TokenKind::DotDot) || self.eat(TokenKind::DotDotDot) {
            let hi = self.parse_ternary()?;
            if let (NodeKind::IntLit { value: lo_v, .. }, NodeKind::IntLit { value: hi_v, .. }) =
                (self.ast.kind(lo).clone(), self.ast.kind(hi).clone())
            {
                if lo_v > hi_v {
                    // §9 open question, resolved: reject crossed case ranges
                    // at parse time.
                    return Err(self.err("case range lower bound exceeds upper bound"));
                }
            }
            return Ok(CaseValue::Range(lo, hi));
        }
        Ok(CaseValue::Single(lo))
    }

    fn parse_case_body(&mut self) -> Result<Vec<NodeId>, ParseError> {
        let mut body = Vec::new();
        while !matches!(
            self.cur.kind,
            TokenKind::Case | TokenKind::Default | TokenKind::Start | TokenKind::End | TokenKind::RBrace
        ) && !self.at(TokenKind::Eof)
        {
            self.reset_recovery_budget();
            match self.parse_stmt() {
                Ok(id) => body.push(id),
                Err(e) => {
                    if !self.recover(e) {
                        break;
                    }
                }
            }
        }
        Ok(body)
    }

    fn parse_asm_block(&mut self) -> Result<NodeId, ParseError> {
        let pos = self.pos();
        self.bump();
        self.expect(TokenKind::LBrace, "'{'")?;
        let mut instrs = Vec::new();
        while !self.at(TokenKind::RBrace) && !self.at(TokenKind::Eof) {
            instrs.push(self.parse_asm_instr()?);
        }
        self.expect(TokenKind::RBrace, "'}'")?;
        Ok(self.ast.alloc(NodeKind::AsmBlock { instrs }, pos, None))
    }

    fn parse_asm_instr(&mut self) -> Result<AsmInstr, ParseError> {
        if !self.at(TokenKind::Opcode) {
            return Err(self.err(format!("expected an instruction mnemonic, found '{}'", self.cur.text)));
        }
        let mnemonic = intern(self.cur.text);
        self.bump();
        let mut operands = Vec::new();
        while !self.at(TokenKind::Semi) && !self.at(TokenKind::Eof) && !self.at(TokenKind::RBrace) {
            operands.push(self.parse_asm_operand()?);
            if !self.eat(TokenKind::Comma) {
                break;
            }
        }
        self.eat(TokenKind::Semi);
        Ok(AsmInstr { mnemonic, operands })
    }

    fn parse_asm_operand(&mut self) -> Result<AsmOperand, ParseError> {
        let mut segment = None;
        if self.at(TokenKind::SegmentRegister) {
            segment = Some(intern(self.cur.text));
            self.bump();
            self.expect(TokenKind::Colon, "':'")?;
        }
        if self.at(TokenKind::Register) {
            let register = Some(intern(self.cur.text));
            self.bump();
            return Ok(AsmOperand {
                register,
                secondary_register: None,
                segment,
                immediate: None,
                displacement: 0,
                scale: 1,
                mode: AddrMode::Direct,
            });
        }
        if self.at(TokenKind::LBracket) {
            self.bump();
            let mut register = None;
            let mut secondary_register = None;
            let mut displacement = 0i32;
            let mut scale = 1u8;
            let mut mode = AddrMode::Indirect;
            if self.at(TokenKind::Register) {
                register = Some(intern(self.cur.text));
                self.bump();
            }
            if self.eat(TokenKind::Plus) {
                if self.at(TokenKind::Register) {
                    secondary_register = Some(intern(self.cur.text));
                    self.bump();
                    mode = AddrMode::Index;
                    if self.eat(TokenKind::Star) {
                        scale = self.parse_scale()?;
                        mode = AddrMode::Scale;
                    }
                } else {
                    displacement = self.parse_signed_int()?;
                    mode = AddrMode::Disp;
                }
            } else if self.eat(TokenKind::Minus) {
                displacement = -self.parse_signed_int()?;
                mode = AddrMode::Disp;
            }
            self.expect(TokenKind::RBracket, "']'")?;
            return Ok(AsmOperand {
                register,
                secondary_register,
                segment,
                immediate: None,
                displacement,
                scale,
                mode,
            });
        }
        let immediate = self.parse_signed_int()?;
        Ok(AsmOperand {
            register: None,
            secondary_register: None,
            segment,
            immediate: Some(immediate as i64),
            displacement: 0,
            scale: 1,
            mode: AddrMode::Abs,
        })
    }

    fn parse_scale(&mut self) -> Result<u8, ParseError> {
        let v = self.parse_signed_int()?;
        match v {
            1 | 2 | 4 | 8 => Ok(v as u8),
            _ => Err(self.err("invalid scale (must be 1, 2, 4, or 8)")),
        }
    }

    fn parse_signed_int(&mut self) -> Result<i32, ParseError> {
        let neg = self.eat(TokenKind::Minus);
        if !self.at(TokenKind::IntLit) {
            return Err(self.err(format!("expected an integer, found '{}'", self.cur.text)));
        }
        let text = self.cur.text;
        self.bump();
        let v = parse_int_literal(text).0 as i32;
        Ok(if neg { -v } else { v })
    }

    // ----- expressions -------------------------------------------------

    pub fn parse_expr(&mut self) -> Result<NodeId, ParseError> {
        self.parse_comma()
    }

    fn parse_comma(&mut self) -> Result<NodeId, ParseError> {
        let mut lhs = self.parse_assignment()?;
        while self.eat(TokenKind::Comma) {
            let pos = self.pos();
            let rhs = self.parse_assignment()?;
            // Sequencing, not arithmetic: evaluate `lhs`, discard it, yield
            // `rhs` (§4.2). `BOp::Comma` keeps that distinct from `Add` all
            // the way through type-checking and lowering.
            lhs = self.ast.alloc(NodeKind::Binary { op: BOp::Comma, lhs, rhs }, pos, None);
        }
        Ok(lhs)
    }

    fn compound_op(kind: TokenKind) -> Option<BOp> {
        Some(match kind {
            TokenKind::PlusAssign => BOp::Add,
            TokenKind::MinusAssign => BOp::Sub,
            TokenKind::StarAssign => BOp::Mul,
            TokenKind::SlashAssign => BOp::Div,
            TokenKind::PercentAssign => BOp::Mod,
            TokenKind::AmpAssign => BOp::BitAnd,
            TokenKind::PipeAssign => BOp::BitOr,
            TokenKind::CaretAssign => BOp::BitXor,
            TokenKind::ShlAssign => BOp::Shl,
            TokenKind::ShrAssign => BOp::Shr,
            _ => return None,
        })
    }

    /// Assignment is right-associative, including the compound-assign forms
    /// (§4.2).
    fn parse_assignment(&mut self) -> Result<NodeId, ParseError> {
        let lhs = self.parse_conditional()?;
        if self.at(TokenKind::Assign) {
            let pos = self.pos();
            self.bump();
            let value = self.parse_assignment()?;
            return Ok(self.ast.alloc(NodeKind::Assign { target: lhs, compound: None, value }, pos, None));
        }
        if let Some(op) = Self::compound_op(self.cur.kind) {
            let pos = self.pos();
            self.bump();
            let value = self.parse_assignment()?;
            return Ok(self.ast.alloc(
                NodeKind::Assign { target: lhs, compound: Some(op), value },
                pos,
                None,
            ));
        }
        Ok(lhs)
    }

    fn parse_conditional(&mut self) -> Result<NodeId, ParseError> {
        let cond = self.parse_logical_or()?;
        if self.eat(TokenKind::Question) {
            let pos = self.pos();
            let then_branch = self.parse_assignment()?;
            self.expect(TokenKind::Colon, "':'")?;
            let else_branch = Some(self.parse_assignment()?);
            return Ok(self.ast.alloc(NodeKind::If { cond, then_branch, else_branch }, pos, None));
        }
        Ok(cond)
    }

    fn binary_level(
        &mut self,
        next: fn(&mut Self) -> Result<NodeId, ParseError>,
        ops: &[(TokenKind, BOp)],
    ) -> Result<NodeId, ParseError> {
        let mut lhs = next(self)?;
        loop {
            let mut matched = None;
            for (kind, op) in ops {
                if self.cur.kind == *kind {
                    matched = Some(*op);
                    break;
                }
            }
            let Some(op) = matched else { break };
            let pos = self.pos();
            self.bump();
            let rhs = next(self)?;
            lhs = self.ast.alloc(NodeKind::Binary { op, lhs, rhs }, pos, None);
        }
        Ok(lhs)
    }

    fn parse_logical_or(&mut self) -> Result<NodeId, ParseError> {
        self.binary_level(Self::parse_logical_xor, &[(TokenKind::PipePipe, BOp::LogOr)])
    }

    fn parse_logical_xor(&mut self) -> Result<NodeId, ParseError> {
        self.binary_level(Self::parse_logical_and, &[(TokenKind::CaretCaret, BOp::LogXor)])
    }

    fn parse_logical_and(&mut self) -> Result<NodeId, ParseError> {
        self.binary_level(Self::parse_bit_or, &[(TokenKind::AmpAmp, BOp::LogAnd)])
    }

    fn parse_bit_or(&mut self) -> Result<NodeId, ParseError> {
        self.binary_level(Self::parse_bit_xor, &[(TokenKind::Pipe, BOp::BitOr)])
    }

    fn parse_bit_xor(&mut self) -> Result<NodeId, ParseError> {
        self.binary_level(Self::parse_bit_and, &[(TokenKind::Caret, BOp::BitXor)])
    }

    fn parse_bit_and(&mut self) -> Result<NodeId, ParseError> {
        self.binary_level(Self::parse_equality, &[(TokenKind::Amp, BOp::BitAnd)])
    }

    fn parse_equality(&mut self) -> Result<NodeId, ParseError> {
        self.binary_level(
            Self::parse_relational_chain,
            &[(TokenKind::Eq, BOp::Eq), (TokenKind::Ne, BOp::Ne)],
        )
    }

    const RELATIONAL: &'static [(TokenKind, BOp)] = &[
        (TokenKind::Lt, BOp::Lt),
        (TokenKind::Le, BOp::Le),
        (TokenKind::Gt, BOp::Gt),
        (TokenKind::Ge, BOp::Ge),
    ];

    fn relational_op(kind: TokenKind) -> Option<BOp> {
        Self::RELATIONAL.iter().find(|(k, _)| *k == kind).map(|(_, op)| *op)
    }

    /// Disambiguation (d) and HolyC range comparisons: a relational chain of
    /// length >= 3 (`a op1 b op2 c ...`) becomes a single `RangeComparison`
    /// node; a chain of length 2 is an ordinary relational expression (§4.2).
    fn parse_relational_chain(&mut self) -> Result<NodeId, ParseError> {
        let pos = self.pos();
        let first = self.parse_shift()?;
        let Some(first_op) = Self::relational_op(self.cur.kind) else {
            return Ok(first);
        };
        self.bump();
        let second = self.parse_shift()?;

        let mut operands = vec![first, second];
        let mut ops = vec![first_op];
        while let Some(op) = Self::relational_op(self.cur.kind) {
            self.bump();
            let operand = self.parse_shift()?;
            ops.push(op);
            operands.push(operand);
        }

        if operands.len() == 2 {
            return Ok(self.ast.alloc(
                NodeKind::Binary { op: ops[0], lhs: operands[0], rhs: operands[1] },
                pos,
                None,
            ));
        }
        Ok(self.ast.alloc(NodeKind::RangeComparison { operands, ops }, pos, None))
    }

    fn parse_shift(&mut self) -> Result<NodeId, ParseError> {
        self.binary_level(
            Self::parse_additive,
            &[(TokenKind::Shl, BOp::Shl), (TokenKind::Shr, BOp::Shr)],
        )
    }

    fn parse_additive(&mut self) -> Result<NodeId, ParseError> {
        self.binary_level(
            Self::parse_multiplicative,
            &[(TokenKind::Plus, BOp::Add), (TokenKind::Minus, BOp::Sub)],
        )
    }

    fn parse_multiplicative(&mut self) -> Result<NodeId, ParseError> {
        self.binary_level(
            Self::parse_unary,
            &[(TokenKind::Star, BOp::Mul), (TokenKind::Slash, BOp::Div), (TokenKind::Percent, BOp::Mod)],
        )
    }

    fn parse_unary(&mut self) -> Result<NodeId, ParseError> {
        let pos = self.pos();
        let op = match self.cur.kind {
            TokenKind::Bang => Some(UOp::Not),
            TokenKind::Tilde => Some(UOp::BitNot),
            TokenKind::Plus => None, // unary plus is a no-op, parsed but discarded
            TokenKind::Minus => Some(UOp::Negate),
            TokenKind::PlusPlus => Some(UOp::PreInc),
            TokenKind::MinusMinus => Some(UOp::PreDec),
            TokenKind::Amp => Some(UOp::AddrOf),
            TokenKind::Star => Some(UOp::Deref),
            _ => return self.parse_postfix(),
        };
        self.bump();
        let operand = self.parse_unary()?;
        match op {
            Some(op) => Ok(self.ast.alloc(NodeKind::Unary { op, operand }, pos, None)),
            None => Ok(operand),
        }
    }

    fn parse_postfix(&mut self) -> Result<NodeId, ParseError> {
        let mut expr = self.parse_primary()?;
        loop {
            let pos = self.pos();
            if self.eat(TokenKind::LBracket) {
                let index = self.parse_expr()?;
                self.expect(TokenKind::RBracket, "']'")?;
                expr = self.ast.alloc(NodeKind::ArrayAccess { base: expr, index }, pos, None);
            } else if self.eat(TokenKind::Dot) {
                // Sub-int access (`obj.u16[idx]`) vs. member/union access.
                if self.at(TokenKind::Ident) {
                    if let Some(width) = IntWidth::from_subint_name(self.cur.text) {
                        let save = self.save();
                        let _ = self.cur.text;
                        self.bump();
                        if self.eat(TokenKind::LBracket) {
                            let index = self.parse_expr()?;
                            self.expect(TokenKind::RBracket, "']'")?;
                            expr = self.ast.alloc(
                                NodeKind::SubIntAccess { base: expr, member_width: width, index },
                                pos,
                                None,
                            );
                            continue;
                        }
                        self.restore(save);
                    }
                    let member = intern(self.cur.text);
                    self.bump();
                    expr = self.ast.alloc(NodeKind::MemberAccess { base: expr, member }, pos, None);
                } else {
                    return Err(self.err(format!("expected a member name, found '{}'", self.cur.text)));
                }
            } else if self.eat(TokenKind::Arrow) {
                let member = self.expect_ident("member name")?;
                expr = self.ast.alloc(NodeKind::UnionMemberAccess { base: expr, member }, pos, None);
            } else if self.at(TokenKind::PlusPlus) {
                self.bump();
                expr = self.ast.alloc(NodeKind::Unary { op: UOp::PostInc, operand: expr }, pos, None);
            } else if self.at(TokenKind::MinusMinus) {
                self.bump();
                expr = self.ast.alloc(NodeKind::Unary { op: UOp::PostDec, operand: expr }, pos, None);
            } else if self.at(TokenKind::LParen) {
                expr = self.parse_call_args(expr, pos)?;
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn parse_call_args(&mut self, callee_expr: NodeId, pos: Pos) -> Result<NodeId, ParseError> {
        let name = match self.ast.kind(callee_expr) {
            NodeKind::Ident { name } => *name,
            _ => return Err(self.err("call target must be an identifier")),
        };
        self.bump(); // '('
        let mut args = Vec::new();
        while !self.at(TokenKind::RParen) {
            args.push(self.parse_assignment()?);
            if !self.eat(TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RParen, "')'")?;
        Ok(self.ast.alloc(NodeKind::Call { callee: name, args }, pos, None))
    }

    fn parse_primary(&mut self) -> Result<NodeId, ParseError> {
        let pos = self.pos();
        match self.cur.kind {
            TokenKind::IntLit => {
                let (value, width) = parse_int_literal(self.cur.text);
                self.bump();
                Ok(self.ast.alloc(NodeKind::IntLit { value, width }, pos, None))
            }
            TokenKind::FloatLit => {
                let value: f64 = self.cur.text.parse().unwrap_or(0.0);
                self.bump();
                Ok(self.ast.alloc(NodeKind::FloatLit { value }, pos, None))
            }
            TokenKind::StringLit => {
                let value = decode_string_literal(self.cur.text);
                self.bump();
                Ok(self.ast.alloc(NodeKind::StringLit { value }, pos, None))
            }
            TokenKind::CharLit | TokenKind::MultiCharConst => {
                let text = self.cur.text;
                let value = Lexer::char_literal_value(text);
                let byte_len = (text.len().saturating_sub(2)).min(8) as u8;
                self.bump();
                Ok(self.ast.alloc(NodeKind::CharLit { value, byte_len }, pos, None))
            }
            TokenKind::Ident => {
                let name = intern(self.cur.text);
                self.bump();
                // Function calls without parentheses (§4.2): an identifier
                // resolving to a function symbol, not followed by `(`,
                // parses as a zero-argument call rather than a variable
                // reference.
                if !self.at(TokenKind::LParen)
                    && self.symbols.lookup_kind(name, SymbolKind::Function).is_some()
                    && self.scopes.lookup(name).is_none()
                {
                    return Ok(self.ast.alloc(NodeKind::Call { callee: name, args: vec![] }, pos, None));
                }
                Ok(self.ast.alloc(NodeKind::Ident { name }, pos, None))
            }
            TokenKind::LParen => {
                self.bump();
                let inner = self.parse_expr()?;
                self.expect(TokenKind::RParen, "')'")?;
                Ok(inner)
            }
            TokenKind::LBrace => {
                // Brace initializer: reuse block-of-expressions shape.
                self.bump();
                let mut items = Vec::new();
                while !self.at(TokenKind::RBrace) {
                    items.push(self.parse_assignment()?);
                    if !self.eat(TokenKind::Comma) {
                        break;
                    }
                }
                self.expect(TokenKind::RBrace, "'}'")?;
                Ok(self.ast.alloc(NodeKind::Block { stmts: items }, pos, None))
            }
            _ if self.is_type_specifier_start() => {
                let ty = self.parse_type_spec()?;
                self.expect(TokenKind::LParen, "'('")?;
                let value = self.parse_expr()?;
                self.expect(TokenKind::RParen, "')'")?;
                Ok(self.ast.alloc(NodeKind::Cast { ty, value }, pos, None))
            }
            _ => Err(self.err(format!("unexpected token '{}'", self.cur.text))),
        }
    }
}

/// Parsed integer literal and its narrowest natural width (decimal, `0x…`
/// hex, `0b…` binary, §4.1). `0xFFFFFFFFFFFFFFFF` parses as all-bits-set
/// U64 (§8 boundary).
pub fn parse_int_literal(text: &str) -> (i64, IntWidth) {
    let value: u64 = if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).unwrap_or(0)
    } else if let Some(bin) = text.strip_prefix("0b").or_else(|| text.strip_prefix("0B")) {
        u64::from_str_radix(bin, 2).unwrap_or(0)
    } else {
        text.parse().unwrap_or(0)
    };
    let width = if value > i64::MAX as u64 { IntWidth::U64 } else { IntWidth::I64 };
    (value as i64, width)
}

fn decode_string_literal(text: &str) -> String {
    let inner = &text[1..text.len().saturating_sub(1)];
    let mut out = String::new();
    let mut chars = inner.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            Some('"') => out.push('"'),
            Some('0') => out.push('\0'),
            Some('x') => {
                let hex: String = chars.by_ref().take(2).collect();
                if let Ok(v) = u8::from_str_radix(&hex, 16) {
                    out.push(v as char);
                }
            }
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

/// A parsed program: the root node plus everything it accumulated.
pub struct Program_(pub NodeId);

/// Parse `input` into an AST, symbol table, and diagnostics (§4.2 entry
/// point). Addresses are not yet assigned; see
/// [`crate::front::scope::SymbolTable::assign_addresses`].
pub fn parse(input: &str, config: &CompilerConfig) -> (Ast, SymbolTable, DiagnosticBag) {
    let _span = tracing::debug_span!("parse").entered();
    let mut parser = Parser::new(input, config.clone());
    let Program_(root) = parser.parse_program();
    tracing::debug!(nodes = parser.ast.len(), root = root.0, "parse complete");
    (parser.ast, parser.symbols, parser.diags)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(src: &str) -> (Ast, DiagnosticBag) {
        let (ast, _symbols, diags) = parse(src, &CompilerConfig::default());
        (ast, diags)
    }

    #[test]
    fn parses_simple_function() {
        let (ast, diags) = parse_ok("U0 main() { return; }");
        assert_eq!(diags.error_count(), 0);
        let root = ast.root.unwrap();
        match ast.kind(root) {
            NodeKind::Program { decls } => assert_eq!(decls.len(), 1),
            _ => panic!("expected program"),
        }
    }

    #[test]
    fn range_comparison_parses_as_single_node() {
        let (ast, diags) = parse_ok("U0 main() { I64 x = 5; I64 j = 1; if (5<x<j+1<20) x = 0; }");
        assert_eq!(diags.error_count(), 0);
        let found = (0..ast.len()).any(|i| {
            matches!(ast.kind(NodeId(i as u32)), NodeKind::RangeComparison { operands, ops }
                if operands.len() == 4 && ops.len() == 3)
        });
        assert!(found, "expected a 4-operand range comparison node");
    }

    #[test]
    fn two_term_relational_stays_a_plain_binary() {
        let (ast, _) = parse_ok("U0 main() { I64 x = 5; if (x<10) x = 0; }");
        let found = (0..ast.len()).any(|i| {
            matches!(ast.kind(NodeId(i as u32)), NodeKind::Binary { op: BOp::Lt, .. })
        });
        assert!(found);
        let range_found = (0..ast.len()).any(|i| matches!(ast.kind(NodeId(i as u32)), NodeKind::RangeComparison { .. }));
        assert!(!range_found);
    }

    #[test]
    fn sub_int_access_parses_base_width_and_index() {
        let (ast, diags) = parse_ok("U0 main() { union I64 u; u.u16[1] = 1; }");
        assert_eq!(diags.error_count(), 0);
        let found = (0..ast.len()).any(|i| {
            matches!(ast.kind(NodeId(i as u32)), NodeKind::SubIntAccess { member_width: IntWidth::U16, .. })
        });
        assert!(found);
    }

    #[test]
    fn type_prefixed_union_definition_parses() {
        let (ast, diags) = parse_ok("public I64i union I64 { I64 i64; I32 i32; };");
        assert_eq!(diags.error_count(), 0);
        let found = (0..ast.len()).any(|i| matches!(ast.kind(NodeId(i as u32)), NodeKind::UnionDef { .. }));
        assert!(found);
    }

    #[test]
    fn redeclaration_in_same_scope_warns_and_drops_second_decl() {
        let (_ast, diags) = parse_ok("U0 main() { I64 a; I64 a; }");
        assert_eq!(diags.error_count(), 0);
        assert_eq!(diags.warning_count(), 1);
    }

    #[test]
    fn function_call_without_parens_is_zero_arg_call() {
        let src = "U0 greet() { return; } U0 main() { greet; }";
        let (ast, diags) = parse_ok(src);
        assert_eq!(diags.error_count(), 0);
        let found = (0..ast.len()).any(|i| {
            matches!(ast.kind(NodeId(i as u32)), NodeKind::Call { args, .. } if args.is_empty())
        });
        assert!(found);
    }

    #[test]
    fn vararg_must_be_last_parameter() {
        let (_ast, diags) = parse_ok("U0 f(I64 x, ..., I64 y) { return; }");
        assert!(diags.error_count() > 0);
    }

    #[test]
    fn crossed_case_range_is_a_parse_error() {
        let src = "U0 main() { I64 x = 0; switch (x) { case 10...0: break; } }";
        let (_ast, diags) = parse_ok(src);
        assert!(diags.error_count() > 0);
    }

    #[test]
    fn switch_with_start_end_and_default_parses() {
        let src = "U0 main() { I64 x = 0; switch (x) { start: x = 1; case 1: break; default: break; end: x = 2; } }";
        let (_ast, diags) = parse_ok(src);
        assert_eq!(diags.error_count(), 0);
    }

    #[test]
    fn scope_depth_is_net_zero_after_parsing() {
        let mut parser = Parser::new("U0 main() { if (1) { I64 x; } }", CompilerConfig::default());
        parser.parse_program();
        assert_eq!(parser.scopes.depth(), 1);
    }

    #[test]
    fn label_is_distinguished_from_expression_statement() {
        let (ast, diags) = parse_ok("U0 main() { top: return; }");
        assert_eq!(diags.error_count(), 0);
        let found = (0..ast.len()).any(|i| matches!(ast.kind(NodeId(i as u32)), NodeKind::Label { .. }));
        assert!(found);
    }

    #[test]
    fn inline_asm_block_parses_registers_and_memory_operands() {
        let src = "U0 main() { asm { mov rax, rbx; mov rax, [rbx+8]; }; }";
        let (ast, diags) = parse_ok(src);
        assert_eq!(diags.error_count(), 0);
        let found = (0..ast.len()).any(|i| matches!(ast.kind(NodeId(i as u32)), NodeKind::AsmBlock { instrs } if instrs.len() == 2));
        assert!(found);
    }
}
