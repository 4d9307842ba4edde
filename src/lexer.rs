use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::{snippet, Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    Text,
    NumericLiteral,
    StringLiteral,
    Identifier,
    Equals,              // =
    OpenParen,           // (
    CloseParen,          // )
    OpenStatement,       // {%
    CloseStatement,      // %}
    OpenExpression,      // {{
    CloseExpression,     // }}
    OpenSquareBracket,   // [
    CloseSquareBracket,  // ]
    OpenCurlyBracket,    // {
    CloseCurlyBracket,   // }
    Comma,               // ,
    Dot,                 // .
    Colon,               // :
    Pipe,                // |
    AdditiveOperator,    // + - ~
    MultiplicativeOperator, // * / %
    ComparisonOperator,  // < > <= >= == !=
    UnaryOperator,       // + -
    Comment,             // {# ... #}
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub value: String,
    /// Byte offset into the preprocessed source.
    pub offset: usize,
}

/// Whitespace handling applied before tokenization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessOptions {
    /// Remove the first newline after a block or comment tag.
    pub trim_blocks: bool,
    /// Not supported; `true` is rejected.
    pub lstrip_blocks: bool,
}

/// Tokens plus the preprocessed source their offsets point into.
#[derive(Debug, Clone, PartialEq)]
pub struct Lexed {
    pub tokens: Vec<Token>,
    pub source: String,
}

// Longest sequences first within each group.
const MAPPING_TABLE: &[(&str, TokenKind)] = &[
    ("{%", TokenKind::OpenStatement),
    ("%}", TokenKind::CloseStatement),
    ("{{", TokenKind::OpenExpression),
    ("}}", TokenKind::CloseExpression),
    ("(", TokenKind::OpenParen),
    (")", TokenKind::CloseParen),
    ("{", TokenKind::OpenCurlyBracket),
    ("}", TokenKind::CloseCurlyBracket),
    ("[", TokenKind::OpenSquareBracket),
    ("]", TokenKind::CloseSquareBracket),
    (",", TokenKind::Comma),
    (".", TokenKind::Dot),
    (":", TokenKind::Colon),
    ("|", TokenKind::Pipe),
    ("<=", TokenKind::ComparisonOperator),
    (">=", TokenKind::ComparisonOperator),
    ("==", TokenKind::ComparisonOperator),
    ("!=", TokenKind::ComparisonOperator),
    ("<", TokenKind::ComparisonOperator),
    (">", TokenKind::ComparisonOperator),
    ("+", TokenKind::AdditiveOperator),
    ("-", TokenKind::AdditiveOperator),
    ("~", TokenKind::AdditiveOperator),
    ("*", TokenKind::MultiplicativeOperator),
    ("/", TokenKind::MultiplicativeOperator),
    ("%", TokenKind::MultiplicativeOperator),
    ("=", TokenKind::Equals),
];

fn unescape(c: char) -> Option<char> {
    Some(match c {
        'n' => '\n',
        't' => '\t',
        'r' => '\r',
        'b' => '\u{08}',
        'f' => '\u{0c}',
        'v' => '\u{0b}',
        '\\' => '\\',
        '\'' => '\'',
        '"' => '"',
        _ => return None,
    })
}

/// Apply the whitespace rules and strip `generation` pragma tags.
pub fn preprocess(source: &str, options: &PreprocessOptions) -> Result<String> {
    let mut result = source.strip_suffix('\n').unwrap_or(source).to_string();

    if options.lstrip_blocks {
        return Err(Error::UnsupportedOption("lstrip_blocks"));
    }

    if options.trim_blocks {
        for close in ["%}", "#}", "-}"] {
            result = result.replace(&format!("{close}\n"), close);
        }
    }

    trim_markers(&mut result);
    Ok(strip_generation_tags(&result))
}

/// Collapse `{%-`, `-%}` and the `{{`/`#` equivalents into plain delimiters,
/// trimming the whitespace on the marked side.
fn trim_markers(s: &mut String) {
    let src = std::mem::take(s);
    let bytes = src.as_bytes();
    let mut out = String::with_capacity(src.len());
    let mut i = 0;
    while i < bytes.len() {
        if i + 2 < bytes.len() {
            let (c1, c2, c3) = (bytes[i], bytes[i + 1], bytes[i + 2]);
            if c1 == b'-' && c3 == b'}' && matches!(c2, b'%' | b'}' | b'#') {
                out.push(c2 as char);
                out.push('}');
                i += 3;
                while i < bytes.len() && bytes[i].is_ascii_whitespace() {
                    i += 1;
                }
                continue;
            }
            if c1 == b'{' && c3 == b'-' && matches!(c2, b'%' | b'{' | b'#') {
                let kept = out.trim_end_matches(|c: char| c.is_ascii_whitespace()).len();
                out.truncate(kept);
                if out.ends_with('{') {
                    out.push(' ');
                }
                out.push('{');
                out.push(c2 as char);
                i += 3;
                continue;
            }
        }
        // Copy one whole character so multi-byte text survives.
        let ch = src[i..].chars().next().unwrap_or_default();
        out.push(ch);
        i += ch.len_utf8().max(1);
    }
    *s = out;
}

fn strip_generation_tags(src: &str) -> String {
    let mut out = String::with_capacity(src.len());
    let mut rest = src;
    while let Some(start) = rest.find("{%") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let inner = after.trim_start();
        let word = ["generation", "endgeneration"]
            .into_iter()
            .find(|w| inner.starts_with(w));
        if let Some(word) = word {
            let tail = inner[word.len()..].trim_start();
            if let Some(tail) = tail.strip_prefix("%}") {
                rest = tail;
                continue;
            }
        }
        out.push_str("{%");
        rest = after;
    }
    out.push_str(rest);
    out
}

struct Lexer<'a> {
    src: &'a str,
    pos: usize,
    curly_bracket_depth: usize,
    tokens: Vec<Token>,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            pos: 0,
            curly_bracket_depth: 0,
            tokens: Vec::new(),
        }
    }

    fn remaining(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.remaining().chars().next()
    }

    fn error(&self, offset: usize, message: impl Into<String>) -> Error {
        Error::Lex {
            offset,
            message: message.into(),
            snippet: snippet(self.src, offset),
        }
    }

    fn push(&mut self, kind: TokenKind, value: impl Into<String>, offset: usize) {
        self.tokens.push(Token {
            kind,
            value: value.into(),
            offset,
        });
    }

    fn last_kind(&self) -> Option<TokenKind> {
        self.tokens.last().map(|t| t.kind)
    }

    fn at_tag_open(&self) -> bool {
        let rest = self.remaining();
        rest.starts_with("{%") || rest.starts_with("{{") || rest.starts_with("{#")
    }

    fn consume_digits(&mut self) -> &'a str {
        let rest = self.remaining();
        let len = rest.bytes().take_while(u8::is_ascii_digit).count();
        self.pos += len;
        &rest[..len]
    }

    /// Digits plus an optional fraction; `.` only counts when a digit follows.
    fn consume_number(&mut self) -> String {
        let mut num = self.consume_digits().to_string();
        let rest = self.remaining().as_bytes();
        if rest.len() > 1 && rest[0] == b'.' && rest[1].is_ascii_digit() {
            self.pos += 1;
            num.push('.');
            num.push_str(self.consume_digits());
        }
        num
    }

    fn run(mut self) -> Result<Vec<Token>> {
        while self.pos < self.src.len() {
            let outside_tag = matches!(
                self.last_kind(),
                None | Some(TokenKind::CloseStatement)
                    | Some(TokenKind::CloseExpression)
                    | Some(TokenKind::Comment)
            );
            if outside_tag {
                let start = self.pos;
                while self.pos < self.src.len() && !self.at_tag_open() {
                    self.pos += self.peek().map_or(1, char::len_utf8);
                }
                if self.pos > start {
                    let text = &self.src[start..self.pos];
                    self.push(TokenKind::Text, text, start);
                    continue;
                }
            }

            if self.remaining().starts_with("{#") {
                let start = self.pos;
                let body_start = self.pos + 2;
                match self.src[body_start..].find("#}") {
                    Some(len) => {
                        let comment = &self.src[body_start..body_start + len];
                        self.push(TokenKind::Comment, comment, start);
                        self.pos = body_start + len + 2;
                        continue;
                    }
                    None => return Err(self.error(start, "missing end of comment tag")),
                }
            }

            let rest = self.remaining();
            self.pos += rest.len() - rest.trim_start().len();
            let Some(ch) = self.peek() else { break };
            let start = self.pos;

            if ch == '-' || ch == '+' {
                match self.last_kind() {
                    None | Some(TokenKind::Text) => {
                        return Err(self.error(start, format!("unexpected character: {ch}")));
                    }
                    Some(
                        TokenKind::Identifier
                        | TokenKind::NumericLiteral
                        | TokenKind::StringLiteral
                        | TokenKind::CloseParen
                        | TokenKind::CloseSquareBracket,
                    ) => {}
                    Some(_) => {
                        self.pos += 1;
                        let num = self.consume_number();
                        let kind = if num.is_empty() {
                            TokenKind::UnaryOperator
                        } else {
                            TokenKind::NumericLiteral
                        };
                        self.push(kind, format!("{ch}{num}"), start);
                        continue;
                    }
                }
            }

            let rest = self.remaining();
            let matched = MAPPING_TABLE.iter().find(|(seq, kind)| {
                !(*kind == TokenKind::CloseExpression && self.curly_bracket_depth > 0)
                    && rest.starts_with(seq)
            });
            if let Some(&(seq, kind)) = matched {
                match kind {
                    TokenKind::OpenExpression => self.curly_bracket_depth = 0,
                    TokenKind::OpenCurlyBracket => self.curly_bracket_depth += 1,
                    TokenKind::CloseCurlyBracket => {
                        self.curly_bracket_depth = self.curly_bracket_depth.saturating_sub(1)
                    }
                    _ => {}
                }
                self.push(kind, seq, start);
                self.pos += seq.len();
                continue;
            }

            if ch == '\'' || ch == '"' {
                let value = self.consume_string(ch)?;
                self.push(TokenKind::StringLiteral, value, start);
                continue;
            }

            if ch.is_ascii_digit() {
                let num = self.consume_number();
                self.push(TokenKind::NumericLiteral, num, start);
                continue;
            }

            if ch.is_ascii_alphabetic() || ch == '_' {
                let len = rest
                    .bytes()
                    .take_while(|b| b.is_ascii_alphanumeric() || *b == b'_')
                    .count();
                self.push(TokenKind::Identifier, &rest[..len], start);
                self.pos += len;
                continue;
            }

            return Err(self.error(start, format!("unexpected character: {ch}")));
        }
        Ok(self.tokens)
    }

    fn consume_string(&mut self, quote: char) -> Result<String> {
        let start = self.pos;
        self.pos += 1;
        let mut value = String::new();
        loop {
            let Some(c) = self.peek() else {
                return Err(self.error(start, "unterminated string literal"));
            };
            self.pos += c.len_utf8();
            if c == quote {
                return Ok(value);
            }
            if c != '\\' {
                value.push(c);
                continue;
            }
            let escape_at = self.pos;
            let Some(escaped) = self.peek() else {
                return Err(self.error(escape_at, "unexpected end of input after escape character"));
            };
            self.pos += escaped.len_utf8();
            match unescape(escaped) {
                Some(c) => value.push(c),
                None => {
                    return Err(self.error(escape_at, format!("unknown escape character \\{escaped}")))
                }
            }
        }
    }
}

/// Tokenize already-preprocessed source.
pub fn tokenize_preprocessed(source: &str) -> Result<Vec<Token>> {
    let tokens = Lexer::new(source).run()?;
    trace!(count = tokens.len(), "tokenized template");
    Ok(tokens)
}

/// Preprocess `source` and tokenize the result.
pub fn tokenize(source: &str, options: &PreprocessOptions) -> Result<Lexed> {
    let source = preprocess(source, options)?;
    debug!(len = source.len(), "preprocessed template source");
    let tokens = tokenize_preprocessed(&source)?;
    Ok(Lexed { tokens, source })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        tokenize(src, &PreprocessOptions::default())
            .unwrap()
            .tokens
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    fn preprocessed(src: &str) -> String {
        preprocess(src, &PreprocessOptions::default()).unwrap()
    }

    #[test]
    fn text_and_expression() {
        use TokenKind::*;
        assert_eq!(
            kinds("Hi {{ name }}!"),
            vec![Text, OpenExpression, Identifier, CloseExpression, Text]
        );
    }

    #[test]
    fn strips_single_trailing_newline() {
        assert_eq!(preprocessed("a\n"), "a");
        assert_eq!(preprocessed("a\n\n"), "a\n");
    }

    #[test]
    fn trim_markers_consume_whitespace() {
        assert_eq!(preprocessed("a  {%- if x -%}  b"), "a{% if x %}b");
        assert_eq!(preprocessed("x {{- y -}}\n z"), "x{{ y }}z");
        assert_eq!(preprocessed("{# c -#}\n  t"), "{# c #}t");
    }

    #[test]
    fn trim_marker_does_not_merge_braces() {
        assert_eq!(preprocessed("{ {%- if x %}"), "{ {% if x %}");
    }

    #[test]
    fn trim_blocks_removes_newline_after_block() {
        let opts = PreprocessOptions {
            trim_blocks: true,
            lstrip_blocks: false,
        };
        assert_eq!(
            preprocess("{% if x %}\nA{{ y }}\nB\n", &opts).unwrap(),
            "{% if x %}A{{ y }}\nB"
        );
        assert_eq!(
            preprocess("{# c #}\na-}\nb\n", &opts).unwrap(),
            "{# c #}a-}b"
        );
    }

    #[test]
    fn lstrip_blocks_is_rejected() {
        let opts = PreprocessOptions {
            trim_blocks: false,
            lstrip_blocks: true,
        };
        assert_eq!(
            preprocess("x", &opts),
            Err(Error::UnsupportedOption("lstrip_blocks"))
        );
    }

    #[test]
    fn generation_tags_are_removed() {
        assert_eq!(
            preprocessed("a{% generation %}b{%endgeneration%}c"),
            "abc"
        );
        assert_eq!(preprocessed("{% generations %}"), "{% generations %}");
    }

    #[test]
    fn unary_minus_fuses_with_digits() {
        let lexed = tokenize("{{ -1.5 + x - 2 }}", &PreprocessOptions::default()).unwrap();
        let values: Vec<_> = lexed.tokens.iter().map(|t| t.value.as_str()).collect();
        assert_eq!(values, vec!["{{", "-1.5", "+", "x", "-", "2", "}}"]);
        assert_eq!(lexed.tokens[1].kind, TokenKind::NumericLiteral);
        assert_eq!(lexed.tokens[4].kind, TokenKind::AdditiveOperator);
    }

    #[test]
    fn dot_after_integer_is_member_access() {
        use TokenKind::*;
        assert_eq!(
            kinds("{{ 1.x }}"),
            vec![OpenExpression, NumericLiteral, Dot, Identifier, CloseExpression]
        );
    }

    #[test]
    fn object_literal_closing_braces() {
        use TokenKind::*;
        assert_eq!(
            kinds("{{ {'a': {'b': 1}} }}"),
            vec![
                OpenExpression,
                OpenCurlyBracket,
                StringLiteral,
                Colon,
                OpenCurlyBracket,
                StringLiteral,
                Colon,
                NumericLiteral,
                CloseCurlyBracket,
                CloseCurlyBracket,
                CloseExpression
            ]
        );
    }

    #[test]
    fn string_escapes() {
        let lexed = tokenize(r#"{{ 'a\n\'b\'' }}"#, &PreprocessOptions::default()).unwrap();
        assert_eq!(lexed.tokens[1].value, "a\n'b'");
    }

    #[test]
    fn lex_errors() {
        let opts = PreprocessOptions::default();
        assert!(matches!(tokenize("{{ 'abc }}", &opts), Err(Error::Lex { .. })));
        assert!(matches!(tokenize(r"{{ '\q' }}", &opts), Err(Error::Lex { .. })));
        assert!(matches!(tokenize("{# open", &opts), Err(Error::Lex { .. })));
        assert!(matches!(tokenize("{{ a ? b }}", &opts), Err(Error::Lex { .. })));
    }

    #[test]
    fn comment_is_one_token() {
        let lexed = tokenize("a{# {{ x }} #}b", &PreprocessOptions::default()).unwrap();
        assert_eq!(lexed.tokens[1].kind, TokenKind::Comment);
        assert_eq!(lexed.tokens[1].value, " {{ x }} ");
        assert_eq!(lexed.tokens[2].offset, 14);
    }

    #[test]
    fn tokenizing_is_deterministic() {
        let src = preprocessed("{% for m in messages %}{{ m['role'] | upper }}{% endfor %}");
        assert_eq!(
            tokenize_preprocessed(&src).unwrap(),
            tokenize_preprocessed(&src).unwrap()
        );
    }

    #[test]
    fn preprocess_is_idempotent_without_markers() {
        let src = "  {% if a %}\n x {{ b }} {# c #}\n";
        let once = preprocessed(src);
        assert_eq!(preprocessed(&once), once);
    }
}
