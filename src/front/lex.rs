//! The lexer (§4.1).
//!
//! Single-pass, one-token lookahead with save/restore; byte stream in,
//! token stream out. Lexer errors are recoverable (§7): they are pushed to
//! the shared [`DiagnosticBag`] and the lexer resynchronizes instead of
//! aborting.

use regex::Regex;
use std::sync::OnceLock;

use crate::common::Pos;
use crate::diagnostics::{DiagnosticBag, Phase};
use crate::front::token::{keyword_lookup, Token, TokenKind};

fn whitespace_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\A(?:[ \t\x0b\x0c]|\r\n|\r|\n|//[^\n]*)*").unwrap())
}

fn ident_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\A[A-Za-z_][A-Za-z0-9_]*").unwrap())
}

fn number_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\A(?:0x[0-9A-Fa-f]+|0b[01]+|[0-9]+(?:\.[0-9]*)?(?:[eE][+-]?[0-9]+)?)").unwrap()
    })
}

/// A saved lexer cursor, for the parser's speculative-lookahead disambiguation
/// (§4.2).
#[derive(Clone, Copy, Debug)]
pub struct LexerState {
    pos: usize,
    line: u32,
    column: u32,
}

pub struct Lexer<'input> {
    input: &'input str,
    pos: usize,
    line: u32,
    column: u32,
}

impl<'input> Lexer<'input> {
    pub fn new(input: &'input str) -> Self {
        Lexer { input, pos: 0, line: 1, column: 1 }
    }

    pub fn end_of_input(&self) -> bool {
        self.pos >= self.input.len()
    }

    pub fn save(&self) -> LexerState {
        LexerState { pos: self.pos, line: self.line, column: self.column }
    }

    pub fn restore(&mut self, state: LexerState) {
        self.pos = state.pos;
        self.line = state.line;
        self.column = state.column;
    }

    fn pos(&self) -> Pos {
        Pos::new(self.line, self.column)
    }

    /// Advance past `n` bytes of `self.input[self.pos..]`, updating line and
    /// column (newlines reset column, §6).
    fn advance_by(&mut self, n: usize) {
        let consumed = &self.input[self.pos..self.pos + n];
        for ch in consumed.chars() {
            if ch == '\n' {
                self.line += 1;
                self.column = 1;
            } else if ch != '\r' {
                self.column += 1;
            }
        }
        self.pos += n;
    }

    fn rest(&self) -> &'input str {
        &self.input[self.pos..]
    }

    fn skip_ws_and_comments(&mut self) {
        loop {
            let start = self.pos;
            if let Some(m) = whitespace_re().find(self.rest()) {
                if m.end() > 0 {
                    self.advance_by(m.end());
                }
            }
            if self.rest().starts_with("/*") {
                if let Some(end) = self.rest().find("*/") {
                    self.advance_by(end + 2);
                } else {
                    // Unterminated block comment: consume to end of input.
                    let len = self.rest().len();
                    self.advance_by(len);
                }
            }
            // Preprocessor lines beginning with `#` are skipped to EOL (§4.1).
            if self.rest().starts_with('#') {
                let len = self.rest().find('\n').unwrap_or(self.rest().len());
                self.advance_by(len);
            }
            if self.pos == start {
                break;
            }
        }
    }

    /// Longest-match operator/punctuation recognition (§4.1).
    fn match_operator(&self) -> Option<(TokenKind, usize)> {
        use TokenKind::*;
        const THREE: &[(&str, TokenKind)] = &[
            ("<<=", ShlAssign),
            (">>=", ShrAssign),
            ("...", DotDotDot),
        ];
        const TWO: &[(&str, TokenKind)] = &[
            ("<<", Shl),
            (">>", Shr),
            ("<=", Le),
            (">=", Ge),
            ("==", Eq),
            ("!=", Ne),
            ("&&", AmpAmp),
            ("||", PipePipe),
            ("^^", CaretCaret),
            ("++", PlusPlus),
            ("--", MinusMinus),
            ("->", Arrow),
            ("::", ColonColon),
            ("..", DotDot),
            ("+=", PlusAssign),
            ("-=", MinusAssign),
            ("*=", StarAssign),
            ("/=", SlashAssign),
            ("%=", PercentAssign),
            ("&=", AmpAssign),
            ("|=", PipeAssign),
            ("^=", CaretAssign),
        ];
        const ONE: &[(char, TokenKind)] = &[
            ('(', LParen),
            (')', RParen),
            ('{', LBrace),
            ('}', RBrace),
            ('[', LBracket),
            (']', RBracket),
            (';', Semi),
            (',', Comma),
            (':', Colon),
            ('.', Dot),
            ('?', Question),
            ('=', Assign),
            ('+', Plus),
            ('-', Minus),
            ('*', Star),
            ('/', Slash),
            ('%', Percent),
            ('&', Amp),
            ('|', Pipe),
            ('^', Caret),
            ('~', Tilde),
            ('!', Bang),
            ('<', Lt),
            ('>', Gt),
        ];
        let rest = self.rest();
        for (s, kind) in THREE {
            if rest.starts_with(s) {
                return Some((*kind, s.len()));
            }
        }
        for (s, kind) in TWO {
            if rest.starts_with(s) {
                return Some((*kind, s.len()));
            }
        }
        let mut chars = rest.chars();
        if let Some(c) = chars.next() {
            for (ch, kind) in ONE {
                if c == *ch {
                    return Some((*kind, c.len_utf8()));
                }
            }
        }
        None
    }

    fn decode_escape(rest: &str) -> Option<(char, usize)> {
        let mut chars = rest.char_indices();
        let (_, first) = chars.next()?;
        if first != '\\' {
            return None;
        }
        let (_, c) = chars.next()?;
        match c {
            'n' => Some(('\n', 2)),
            't' => Some(('\t', 2)),
            'r' => Some(('\r', 2)),
            '\\' => Some(('\\', 2)),
            '"' => Some(('"', 2)),
            '\'' => Some(('\'', 2)),
            '0' => Some(('\0', 2)),
            'x' => {
                let hex: String = rest[2..].chars().take(2).collect();
                if hex.len() == 2 {
                    if let Ok(v) = u8::from_str_radix(&hex, 16) {
                        return Some((v as char, 4));
                    }
                }
                None
            }
            other => Some((other, 1 + other.len_utf8())),
        }
    }

    fn lex_string(&mut self, diags: &mut DiagnosticBag) -> Token<'input> {
        let start_pos = self.pos();
        let start = self.pos;
        self.advance_by(1); // opening quote
        loop {
            if self.end_of_input() {
                diags.error(Phase::Lex, start_pos.line, start_pos.column, "unterminated string literal");
                return Token::eof(self.pos());
            }
            let rest = self.rest();
            if rest.starts_with('"') {
                self.advance_by(1);
                break;
            }
            if rest.starts_with('\\') {
                if let Some((_, len)) = Self::decode_escape(rest) {
                    self.advance_by(len);
                    continue;
                }
                diags.warning(Phase::Lex, self.line, self.column, "invalid escape sequence");
                self.advance_by(2.min(rest.len()));
                continue;
            }
            if rest.starts_with('\n') {
                diags.error(Phase::Lex, start_pos.line, start_pos.column, "unterminated string literal");
                return Token::eof(self.pos());
            }
            let ch_len = rest.chars().next().map(|c| c.len_utf8()).unwrap_or(1);
            self.advance_by(ch_len);
        }
        Token::new(TokenKind::StringLit, &self.input[start..self.pos], start_pos)
    }

    fn lex_char(&mut self, diags: &mut DiagnosticBag) -> Token<'input> {
        let start_pos = self.pos();
        let start = self.pos;
        self.advance_by(1); // opening quote
        let mut byte_len = 0usize;
        loop {
            if self.end_of_input() {
                diags.error(Phase::Lex, start_pos.line, start_pos.column, "unterminated character constant");
                return Token::eof(self.pos());
            }
            let rest = self.rest();
            if rest.starts_with('\'') {
                self.advance_by(1);
                break;
            }
            if byte_len > 8 {
                diags.error(
                    Phase::Lex,
                    start_pos.line,
                    start_pos.column,
                    "character constant too long (> 8 bytes)",
                );
            }
            if rest.starts_with('\\') {
                if let Some((_ch, len)) = Self::decode_escape(rest) {
                    self.advance_by(len);
                    byte_len += 1;
                    continue;
                }
                diags.warning(Phase::Lex, self.line, self.column, "invalid escape sequence");
                self.advance_by(2.min(rest.len()));
                byte_len += 1;
                continue;
            }
            let ch_len = rest.chars().next().map(|c| c.len_utf8()).unwrap_or(1);
            self.advance_by(ch_len);
            byte_len += 1;
        }
        let text = &self.input[start..self.pos];
        let kind = if byte_len > 1 { TokenKind::MultiCharConst } else { TokenKind::CharLit };
        Token::new(kind, text, start_pos)
    }

    /// Decode the little-endian-packed integer value of a character-literal
    /// token's text (§4.1, §8 boundary: `'ab'` = `('a') | ('b' << 8)`).
    pub fn char_literal_value(text: &str) -> u64 {
        let inner = &text[1..text.len().saturating_sub(1)];
        let mut bytes: Vec<u8> = Vec::new();
        let mut chars = inner.chars().peekable();
        while let Some(c) = chars.next() {
            if c == '\\' {
                let mut escape = String::from("\\");
                if let Some(&next) = chars.peek() {
                    escape.push(next);
                    chars.next();
                }
                if let Some((decoded, _)) = Self::decode_escape(&escape) {
                    bytes.push(decoded as u8);
                }
            } else {
                let mut buf = [0u8; 4];
                let s = c.encode_utf8(&mut buf);
                bytes.extend_from_slice(s.as_bytes());
            }
        }
        let mut value: u64 = 0;
        for (i, b) in bytes.iter().take(8).enumerate() {
            value |= (*b as u64) << (8 * i);
        }
        value
    }

    /// Get the next token, or an EOF token once the input is exhausted.
    /// Lex errors are recorded into `diags` and do not abort the run (§7).
    pub fn next(&mut self, diags: &mut DiagnosticBag) -> Token<'input> {
        self.skip_ws_and_comments();
        if self.end_of_input() {
            return Token::eof(self.pos());
        }
        let pos = self.pos();
        let rest = self.rest();

        if rest.starts_with('"') {
            return self.lex_string(diags);
        }
        if rest.starts_with('\'') {
            return self.lex_char(diags);
        }
        if let Some(m) = ident_re().find(rest) {
            let text = &rest[..m.end()];
            self.advance_by(m.end());
            let kind = keyword_lookup(text).unwrap_or(TokenKind::Ident);
            return Token::new(kind, text, pos);
        }
        if let Some(m) = number_re().find(rest) {
            let text = &rest[..m.end()];
            self.advance_by(m.end());
            let kind = if text.contains('.') || text.to_ascii_lowercase().contains('e') {
                TokenKind::FloatLit
            } else {
                TokenKind::IntLit
            };
            return Token::new(kind, text, pos);
        }
        if let Some((kind, len)) = self.match_operator() {
            let text = &rest[..len];
            self.advance_by(len);
            return Token::new(kind, text, pos);
        }

        // Unrecognized character: record and skip it, then retry (§7 lex
        // errors are recoverable).
        let ch = rest.chars().next().unwrap();
        diags.error(
            Phase::Lex,
            pos.line,
            pos.column,
            format!("unexpected character {ch:?}"),
        );
        self.advance_by(ch.len_utf8());
        self.next(diags)
    }
}

/// Convenience used by the driver's `--emit tokens` mode and by tests:
/// lex the whole input into a vector of tokens (excluding the trailing EOF).
pub fn tokenize<'a>(input: &'a str, diags: &mut DiagnosticBag) -> Vec<Token<'a>> {
    let mut lexer = Lexer::new(input);
    let mut tokens = Vec::new();
    loop {
        let tok = lexer.next(diags);
        if tok.kind == TokenKind::Eof {
            break;
        }
        tokens.push(tok);
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex_all(src: &str) -> (Vec<TokenKind>, DiagnosticBag) {
        let mut diags = DiagnosticBag::new();
        let tokens = tokenize(src, &mut diags);
        (tokens.into_iter().map(|t| t.kind).collect(), diags)
    }

    #[test]
    fn lexes_basic_declaration() {
        let (kinds, diags) = lex_all("I64 x = 5;");
        assert_eq!(
            kinds,
            vec![
                TokenKind::I64,
                TokenKind::Ident,
                TokenKind::Assign,
                TokenKind::IntLit,
                TokenKind::Semi,
            ]
        );
        assert_eq!(diags.error_count(), 0);
    }

    #[test]
    fn longest_match_operators() {
        let (kinds, _) = lex_all("<<= << <= < ... .. .");
        assert_eq!(
            kinds,
            vec![
                TokenKind::ShlAssign,
                TokenKind::Shl,
                TokenKind::Le,
                TokenKind::Lt,
                TokenKind::DotDotDot,
                TokenKind::DotDot,
                TokenKind::Dot,
            ]
        );
    }

    #[test]
    fn skips_line_and_block_comments() {
        let (kinds, _) = lex_all("I64 x; // trailing\n/* block \n comment */ I64 y;");
        assert_eq!(
            kinds,
            vec![
                TokenKind::I64,
                TokenKind::Ident,
                TokenKind::Semi,
                TokenKind::I64,
                TokenKind::Ident,
                TokenKind::Semi,
            ]
        );
    }

    #[test]
    fn hex_and_binary_literals() {
        let (kinds, _) = lex_all("0xFF 0b101 3.14 2e10");
        assert_eq!(
            kinds,
            vec![
                TokenKind::IntLit,
                TokenKind::IntLit,
                TokenKind::FloatLit,
                TokenKind::FloatLit,
            ]
        );
    }

    #[test]
    fn string_escapes_are_consumed() {
        let (kinds, diags) = lex_all(r#""hi\n\x41""#);
        assert_eq!(kinds, vec![TokenKind::StringLit]);
        assert_eq!(diags.error_count(), 0);
    }

    #[test]
    fn unterminated_string_is_recoverable() {
        let mut diags = DiagnosticBag::new();
        let mut lexer = Lexer::new("\"unterminated");
        let tok = lexer.next(&mut diags);
        assert_eq!(tok.kind, TokenKind::Eof);
        assert_eq!(diags.error_count(), 1);
    }

    #[test]
    fn multi_char_constant_packs_little_endian() {
        let (kinds, _) = lex_all("'ab'");
        assert_eq!(kinds, vec![TokenKind::MultiCharConst]);
        let value = Lexer::char_literal_value("'ab'");
        assert_eq!(value, ('a' as u64) | (('b' as u64) << 8));
    }

    #[test]
    fn char_constant_too_long_is_an_error_not_fatal() {
        let (kinds, diags) = lex_all("'123456789'");
        assert_eq!(kinds, vec![TokenKind::MultiCharConst]);
        assert!(diags.error_count() >= 1);
    }

    #[test]
    fn save_restore_roundtrips_cursor() {
        let mut diags = DiagnosticBag::new();
        let mut lexer = Lexer::new("I64 x;");
        let saved = lexer.save();
        let first = lexer.next(&mut diags);
        assert_eq!(first.kind, TokenKind::I64);
        lexer.restore(saved);
        let replayed = lexer.next(&mut diags);
        assert_eq!(replayed.kind, TokenKind::I64);
        assert_eq!(replayed.text, first.text);
    }

    #[test]
    fn unrecognized_character_is_skipped_and_recorded() {
        let (kinds, diags) = lex_all("I64 x `= 5;");
        assert!(diags.error_count() >= 1);
        assert!(kinds.contains(&TokenKind::IntLit));
    }

    #[test]
    fn windows_and_unix_newlines_both_advance_line() {
        let mut diags = DiagnosticBag::new();
        let mut lexer = Lexer::new("a\r\nb\nc");
        let t1 = lexer.next(&mut diags);
        let t2 = lexer.next(&mut diags);
        let t3 = lexer.next(&mut diags);
        assert_eq!(t1.pos.line, 1);
        assert_eq!(t2.pos.line, 2);
        assert_eq!(t3.pos.line, 3);
    }
}
