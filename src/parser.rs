use std::sync::Arc;

use tracing::debug;

use crate::ast::*;
use crate::error::{Error, Result};
use crate::lexer::{Token, TokenKind};

const MAX_EXPRESSION_DEPTH: usize = 64;
/// Operator, filter and member chains grow the tree without recursing.
const MAX_TREE_HEIGHT: usize = 2 * MAX_EXPRESSION_DEPTH;
const MAX_BLOCK_DEPTH: usize = 64;

/// Parse a token stream into a [`Program`].
pub fn parse(tokens: &[Token]) -> Result<Program> {
    let mut parser = Parser::new(tokens);
    let body = parser.parse_block(&[])?;
    debug!(statements = body.len(), "parsed template");
    Ok(Program { body })
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    depth: usize,
    blocks: usize,
}

impl<'a> Parser<'a> {
    fn new(tokens: &'a [Token]) -> Self {
        Self {
            tokens,
            pos: 0,
            depth: 0,
            blocks: 0,
        }
    }

    fn peek(&self, n: usize) -> Option<&'a Token> {
        self.tokens.get(self.pos + n)
    }

    fn peek_kind(&self) -> Option<TokenKind> {
        self.peek(0).map(|t| t.kind)
    }

    fn is(&self, kind: TokenKind) -> bool {
        self.peek_kind() == Some(kind)
    }

    fn is_keyword(&self, n: usize, name: &str) -> bool {
        matches!(self.peek(n), Some(t) if t.kind == TokenKind::Identifier && t.value == name)
    }

    fn offset(&self) -> usize {
        match self.peek(0) {
            Some(t) => t.offset,
            None => self.tokens.last().map_or(0, |t| t.offset + t.value.len()),
        }
    }

    fn error(&self, message: impl Into<String>) -> Error {
        let mut snippet = String::new();
        for token in &self.tokens[self.pos.min(self.tokens.len())..] {
            if !snippet.is_empty() {
                snippet.push(' ');
            }
            snippet.push_str(&token.value);
            if snippet.chars().count() >= 20 {
                break;
            }
        }
        Error::Parse {
            offset: self.offset(),
            message: message.into(),
            snippet: snippet.chars().take(20).collect(),
        }
    }

    fn consume(&mut self) -> Result<&'a Token> {
        match self.peek(0) {
            Some(token) => {
                self.pos += 1;
                Ok(token)
            }
            None => Err(self.error("unexpected end of template")),
        }
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> Result<&'a Token> {
        match self.peek(0) {
            Some(token) if token.kind == kind => {
                self.pos += 1;
                Ok(token)
            }
            Some(token) => Err(self.error(format!("expected {what}, got `{}`", token.value))),
            None => Err(self.error(format!("expected {what}, got end of template"))),
        }
    }

    fn expect_keyword(&mut self, name: &str) -> Result<()> {
        if self.is_keyword(0, name) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(format!("expected `{name}`")))
        }
    }

    fn expect_identifier(&mut self) -> Result<String> {
        Ok(self.expect(TokenKind::Identifier, "identifier")?.value.clone())
    }

    fn expect_end(&mut self, name: &str) -> Result<()> {
        self.expect(TokenKind::OpenStatement, "`{%`")?;
        self.expect_keyword(name)?;
        self.expect(TokenKind::CloseStatement, "`%}`")?;
        Ok(())
    }

    /// `{%` followed by one of `names`.
    fn at_tag(&self, names: &[&str]) -> bool {
        self.is(TokenKind::OpenStatement) && names.iter().any(|name| self.is_keyword(1, name))
    }

    /// Statements up to (not including) a `{% name %}` tag from `terminators`.
    /// With no terminators, runs to the end of input.
    fn parse_block(&mut self, terminators: &[&str]) -> Result<Vec<Stmt>> {
        let mut body = Vec::new();
        loop {
            if self.peek(0).is_none() {
                if terminators.is_empty() {
                    return Ok(body);
                }
                return Err(self.error(format!(
                    "unexpected end of template, expected {}",
                    terminators
                        .iter()
                        .map(|t| format!("{{% {t} %}}"))
                        .collect::<Vec<_>>()
                        .join(" or ")
                )));
            }
            if self.at_tag(terminators) {
                return Ok(body);
            }
            body.push(self.parse_any()?);
        }
    }

    fn parse_any(&mut self) -> Result<Stmt> {
        let token = self.consume()?;
        let offset = token.offset;
        let kind = match token.kind {
            TokenKind::Text => StmtKind::Text(token.value.clone()),
            TokenKind::Comment => StmtKind::Comment(token.value.clone()),
            TokenKind::OpenExpression => {
                let expr = self.parse_expression()?;
                self.expect(TokenKind::CloseExpression, "`}}`")?;
                StmtKind::Output(expr)
            }
            TokenKind::OpenStatement => return self.parse_statement(offset),
            _ => {
                self.pos -= 1;
                return Err(self.error(format!("unexpected token `{}`", token.value)));
            }
        };
        Ok(Stmt::new(offset, kind))
    }

    fn parse_statement(&mut self, offset: usize) -> Result<Stmt> {
        let keyword = self.expect(TokenKind::Identifier, "statement keyword")?;
        let kind = match keyword.value.as_str() {
            "set" => self.nested_block(Self::parse_set)?,
            "if" => self.nested_block(Self::parse_if)?,
            "for" => self.nested_block(Self::parse_for)?,
            "macro" => self.nested_block(Self::parse_macro)?,
            "call" => self.nested_block(Self::parse_call_block)?,
            "filter" => self.nested_block(Self::parse_filter_block)?,
            "break" => {
                self.expect(TokenKind::CloseStatement, "`%}`")?;
                StmtKind::Break
            }
            "continue" => {
                self.expect(TokenKind::CloseStatement, "`%}`")?;
                StmtKind::Continue
            }
            other => {
                self.pos -= 1;
                return Err(self.error(format!("unknown statement `{other}`")));
            }
        };
        Ok(Stmt::new(offset, kind))
    }

    fn parse_set(&mut self) -> Result<StmtKind> {
        let target_offset = self.offset();
        let mut targets = vec![self.parse_call_member()?];
        while self.is(TokenKind::Comma) {
            self.pos += 1;
            targets.push(self.parse_call_member()?);
        }
        for target in &targets {
            let valid = match &target.kind {
                ExprKind::Ident(_) => true,
                ExprKind::Member { property, .. } => !matches!(property, Property::Slice { .. }),
                _ => false,
            };
            if !valid || (targets.len() > 1 && target.ident().is_none()) {
                return Err(self.error("invalid assignment target"));
            }
        }
        let target = if targets.len() == 1 {
            targets.remove(0)
        } else {
            Expr::new(target_offset, ExprKind::Tuple(targets))
        };

        if self.is(TokenKind::Equals) {
            self.pos += 1;
            let value = self.parse_expression_sequence()?;
            self.expect(TokenKind::CloseStatement, "`%}`")?;
            return Ok(StmtKind::Set {
                target,
                value: Some(value),
                body: Vec::new(),
            });
        }

        self.expect(TokenKind::CloseStatement, "`=` or `%}`")?;
        let body = self.parse_block(&["endset"])?;
        self.expect_end("endset")?;
        Ok(StmtKind::Set {
            target,
            value: None,
            body,
        })
    }

    fn parse_if(&mut self) -> Result<StmtKind> {
        let test = self.parse_expression()?;
        self.expect(TokenKind::CloseStatement, "`%}`")?;
        let body = self.parse_block(&["elif", "else", "endif"])?;

        let tag_offset = self.offset();
        self.expect(TokenKind::OpenStatement, "`{%`")?;
        let alternate = match self.expect_identifier()?.as_str() {
            "elif" => vec![Stmt::new(tag_offset, self.nested_block(Self::parse_if)?)],
            "else" => {
                self.expect(TokenKind::CloseStatement, "`%}`")?;
                let alternate = self.parse_block(&["endif"])?;
                self.expect_end("endif")?;
                alternate
            }
            _ => {
                self.expect(TokenKind::CloseStatement, "`%}`")?;
                Vec::new()
            }
        };
        Ok(StmtKind::If {
            test,
            body,
            alternate,
        })
    }

    fn parse_for(&mut self) -> Result<StmtKind> {
        let target_offset = self.offset();
        let mut names = vec![self.parse_target_name()?];
        while self.is(TokenKind::Comma) {
            self.pos += 1;
            names.push(self.parse_target_name()?);
        }
        let target = if names.len() == 1 {
            names.remove(0)
        } else {
            Expr::new(target_offset, ExprKind::Tuple(names))
        };

        self.expect_keyword("in")?;
        let mut iterable = self.nested(Self::parse_or)?;
        if self.is_keyword(0, "if") {
            self.pos += 1;
            let cond = self.parse_expression()?;
            iterable = Expr::new(
                iterable.offset,
                ExprKind::Select {
                    iterable: Box::new(iterable),
                    cond: Box::new(cond),
                },
            );
        }
        self.expect(TokenKind::CloseStatement, "`%}`")?;

        let body = self.parse_block(&["endfor", "else"])?;
        let mut default = Vec::new();
        if self.at_tag(&["else"]) {
            self.pos += 2;
            self.expect(TokenKind::CloseStatement, "`%}`")?;
            default = self.parse_block(&["endfor"])?;
        }
        self.expect_end("endfor")?;
        Ok(StmtKind::For {
            target,
            iterable,
            body,
            default,
        })
    }

    fn parse_target_name(&mut self) -> Result<Expr> {
        let offset = self.offset();
        let name = self.expect_identifier()?;
        Ok(Expr::new(offset, ExprKind::Ident(name)))
    }

    fn parse_params(&mut self) -> Result<Vec<Param>> {
        self.expect(TokenKind::OpenParen, "`(`")?;
        let mut params = Vec::new();
        while !self.is(TokenKind::CloseParen) {
            let name = self.expect_identifier()?;
            let default = if self.is(TokenKind::Equals) {
                self.pos += 1;
                Some(self.parse_expression()?)
            } else {
                None
            };
            params.push(Param { name, default });
            if !self.is(TokenKind::CloseParen) {
                self.expect(TokenKind::Comma, "`,` or `)`")?;
            }
        }
        self.pos += 1;
        Ok(params)
    }

    fn parse_macro(&mut self) -> Result<StmtKind> {
        let name = self.expect_identifier()?;
        let params = self.parse_params()?;
        self.expect(TokenKind::CloseStatement, "`%}`")?;
        let body = self.parse_block(&["endmacro"])?;
        self.expect_end("endmacro")?;
        Ok(StmtKind::Macro(Arc::new(MacroDef { name, params, body })))
    }

    fn parse_call_block(&mut self) -> Result<StmtKind> {
        let params = if self.is(TokenKind::OpenParen) {
            self.parse_params()?
        } else {
            Vec::new()
        };
        let call = self.parse_call_member()?;
        if !matches!(call.kind, ExprKind::Call { .. }) {
            return Err(self.error("call block requires a call expression"));
        }
        self.expect(TokenKind::CloseStatement, "`%}`")?;
        let body = self.parse_block(&["endcall"])?;
        self.expect_end("endcall")?;
        Ok(StmtKind::CallBlock {
            call,
            caller: Arc::new(MacroDef {
                name: "caller".to_string(),
                params,
                body,
            }),
        })
    }

    fn parse_filter_block(&mut self) -> Result<StmtKind> {
        let filter = self.parse_call_member()?;
        match &filter.kind {
            ExprKind::Ident(_) => {}
            ExprKind::Call { callee, .. } if callee.ident().is_some() => {}
            _ => return Err(self.error("expected filter name")),
        }
        self.expect(TokenKind::CloseStatement, "`%}`")?;
        let body = self.parse_block(&["endfilter"])?;
        self.expect_end("endfilter")?;
        Ok(StmtKind::FilterBlock { filter, body })
    }

    fn nested<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        if self.depth >= MAX_EXPRESSION_DEPTH {
            return Err(self.error(format!(
                "expression nesting exceeds {MAX_EXPRESSION_DEPTH} levels"
            )));
        }
        self.depth += 1;
        let result = f(self);
        self.depth -= 1;
        result
    }

    fn nested_block<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        if self.blocks >= MAX_BLOCK_DEPTH {
            return Err(self.error(format!("block nesting exceeds {MAX_BLOCK_DEPTH} levels")));
        }
        self.blocks += 1;
        let result = f(self);
        self.blocks -= 1;
        result
    }

    /// Reject a chain once the tree under construction gets too tall.
    fn check_height(&self, expr: &Expr) -> Result<()> {
        if self.depth + expr.height() > MAX_TREE_HEIGHT {
            return Err(self.error(format!(
                "expression nesting exceeds {MAX_TREE_HEIGHT} levels"
            )));
        }
        Ok(())
    }

    /// `a, b, c` becomes a tuple; a single expression is returned as is.
    fn parse_expression_sequence(&mut self) -> Result<Expr> {
        let offset = self.offset();
        let first = self.parse_expression()?;
        if !self.is(TokenKind::Comma) {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.is(TokenKind::Comma) {
            self.pos += 1;
            items.push(self.parse_expression()?);
        }
        Ok(Expr::new(offset, ExprKind::Tuple(items)))
    }

    fn parse_expression(&mut self) -> Result<Expr> {
        self.nested(Self::parse_ternary)
    }

    fn parse_ternary(&mut self) -> Result<Expr> {
        let then = self.parse_or()?;
        if !self.is_keyword(0, "if") {
            return Ok(then);
        }
        self.pos += 1;
        let cond = self.parse_or()?;
        let otherwise = if self.is_keyword(0, "else") {
            self.pos += 1;
            Some(Box::new(self.parse_expression()?))
        } else {
            None
        };
        Ok(Expr::new(
            then.offset,
            ExprKind::Ternary {
                cond: Box::new(cond),
                then: Box::new(then),
                otherwise,
            },
        ))
    }

    fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
        Expr::new(
            left.offset,
            ExprKind::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            },
        )
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_and()?;
        while self.is_keyword(0, "or") {
            self.pos += 1;
            let rhs = self.parse_and()?;
            lhs = Self::binary(BinaryOp::Or, lhs, rhs);
            self.check_height(&lhs)?;
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_not()?;
        while self.is_keyword(0, "and") {
            self.pos += 1;
            let rhs = self.parse_not()?;
            lhs = Self::binary(BinaryOp::And, lhs, rhs);
            self.check_height(&lhs)?;
        }
        Ok(lhs)
    }

    fn parse_not(&mut self) -> Result<Expr> {
        if !self.is_keyword(0, "not") {
            return self.parse_comparison();
        }
        let offset = self.offset();
        self.pos += 1;
        let operand = self.nested(Self::parse_not)?;
        Ok(Expr::new(
            offset,
            ExprKind::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand),
            },
        ))
    }

    fn parse_comparison(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_additive()?;
        loop {
            let op = match self.peek(0) {
                Some(t) if t.kind == TokenKind::ComparisonOperator => {
                    self.pos += 1;
                    BinaryOp::from_symbol(&t.value)
                        .ok_or_else(|| self.error(format!("unknown operator `{}`", t.value)))?
                }
                _ if self.is_keyword(0, "in") => {
                    self.pos += 1;
                    BinaryOp::In
                }
                _ if self.is_keyword(0, "not") && self.is_keyword(1, "in") => {
                    self.pos += 2;
                    BinaryOp::NotIn
                }
                _ => break,
            };
            let rhs = self.parse_additive()?;
            lhs = Self::binary(op, lhs, rhs);
            self.check_height(&lhs)?;
        }
        Ok(lhs)
    }

    fn parse_additive(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_multiplicative()?;
        while let Some(t) = self.peek(0).filter(|t| t.kind == TokenKind::AdditiveOperator) {
            self.pos += 1;
            let op = BinaryOp::from_symbol(&t.value)
                .ok_or_else(|| self.error(format!("unknown operator `{}`", t.value)))?;
            let rhs = self.parse_multiplicative()?;
            lhs = Self::binary(op, lhs, rhs);
            self.check_height(&lhs)?;
        }
        Ok(lhs)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_test()?;
        while let Some(t) = self
            .peek(0)
            .filter(|t| t.kind == TokenKind::MultiplicativeOperator)
        {
            self.pos += 1;
            let op = BinaryOp::from_symbol(&t.value)
                .ok_or_else(|| self.error(format!("unknown operator `{}`", t.value)))?;
            let rhs = self.parse_test()?;
            lhs = Self::binary(op, lhs, rhs);
            self.check_height(&lhs)?;
        }
        Ok(lhs)
    }

    fn parse_test(&mut self) -> Result<Expr> {
        let mut operand = self.parse_filter()?;
        while self.is_keyword(0, "is") {
            self.pos += 1;
            let negate = self.is_keyword(0, "not");
            if negate {
                self.pos += 1;
            }
            let name = self.expect_identifier()?;
            let args = if self.is(TokenKind::OpenParen) {
                self.parse_args()?
            } else if self.starts_bare_test_arg() {
                vec![Arg::Positional(self.parse_primary()?)]
            } else {
                Vec::new()
            };
            operand = Expr::new(
                operand.offset,
                ExprKind::Test {
                    operand: Box::new(operand),
                    negate,
                    name,
                    args,
                },
            );
            self.check_height(&operand)?;
        }
        Ok(operand)
    }

    /// `x is divisibleby 3`, `x is sameas none`
    fn starts_bare_test_arg(&self) -> bool {
        match self.peek(0) {
            Some(t) => match t.kind {
                TokenKind::NumericLiteral | TokenKind::StringLiteral => true,
                TokenKind::Identifier => matches!(
                    t.value.as_str(),
                    "none" | "None" | "true" | "True" | "false" | "False"
                ),
                _ => false,
            },
            None => false,
        }
    }

    fn parse_filter(&mut self) -> Result<Expr> {
        let mut operand = self.parse_call_member()?;
        while self.is(TokenKind::Pipe) {
            self.pos += 1;
            let name = self.expect_identifier()?;
            let args = if self.is(TokenKind::OpenParen) {
                self.parse_args()?
            } else {
                Vec::new()
            };
            operand = Expr::new(
                operand.offset,
                ExprKind::Filter {
                    operand: Box::new(operand),
                    name,
                    args,
                },
            );
            self.check_height(&operand)?;
        }
        Ok(operand)
    }

    fn parse_call_member(&mut self) -> Result<Expr> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek_kind() {
                Some(TokenKind::Dot) => {
                    self.pos += 1;
                    let name = self.expect_identifier()?;
                    expr = Expr::new(
                        expr.offset,
                        ExprKind::Member {
                            object: Box::new(expr),
                            property: Property::Name(name),
                        },
                    );
                }
                Some(TokenKind::OpenSquareBracket) => {
                    let property = self.parse_subscript()?;
                    expr = Expr::new(
                        expr.offset,
                        ExprKind::Member {
                            object: Box::new(expr),
                            property,
                        },
                    );
                }
                Some(TokenKind::OpenParen) => {
                    let args = self.parse_args()?;
                    expr = Expr::new(
                        expr.offset,
                        ExprKind::Call {
                            callee: Box::new(expr),
                            args,
                        },
                    );
                }
                _ => return Ok(expr),
            }
            self.check_height(&expr)?;
        }
    }

    fn parse_subscript(&mut self) -> Result<Property> {
        self.expect(TokenKind::OpenSquareBracket, "`[`")?;
        let mut parts: Vec<Option<Box<Expr>>> = Vec::new();
        let mut current = None;
        let mut is_slice = false;
        loop {
            match self.peek_kind() {
                Some(TokenKind::CloseSquareBracket) => break,
                Some(TokenKind::Colon) => {
                    self.pos += 1;
                    is_slice = true;
                    parts.push(current.take());
                }
                _ if current.is_some() => return Err(self.error("expected `]` or `:`")),
                _ => current = Some(Box::new(self.parse_expression()?)),
            }
        }
        self.pos += 1;
        parts.push(current);

        if !is_slice {
            return match parts.pop().flatten() {
                Some(index) => Ok(Property::Index(index)),
                None => Err(self.error("empty subscript")),
            };
        }
        if parts.len() > 3 {
            return Err(self.error("slice takes at most three parts"));
        }
        let mut parts = parts.into_iter();
        Ok(Property::Slice {
            start: parts.next().flatten(),
            stop: parts.next().flatten(),
            step: parts.next().flatten(),
        })
    }

    fn parse_args(&mut self) -> Result<Vec<Arg>> {
        self.expect(TokenKind::OpenParen, "`(`")?;
        let mut args = Vec::new();
        while !self.is(TokenKind::CloseParen) {
            let arg = match self.peek(0) {
                Some(t) if t.kind == TokenKind::MultiplicativeOperator && t.value == "*" => {
                    self.pos += 1;
                    Arg::Spread(self.parse_expression()?)
                }
                Some(t)
                    if t.kind == TokenKind::Identifier
                        && self.peek(1).map(|n| n.kind) == Some(TokenKind::Equals) =>
                {
                    self.pos += 2;
                    Arg::Keyword(t.value.clone(), self.parse_expression()?)
                }
                _ => Arg::Positional(self.parse_expression()?),
            };
            args.push(arg);
            if !self.is(TokenKind::CloseParen) {
                self.expect(TokenKind::Comma, "`,` or `)`")?;
            }
        }
        self.pos += 1;
        Ok(args)
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        let token = self.consume()?;
        let offset = token.offset;
        let kind = match token.kind {
            TokenKind::NumericLiteral => self.parse_number(&token.value)?,
            TokenKind::StringLiteral => {
                let mut text = token.value.clone();
                while let Some(next) = self.peek(0).filter(|t| t.kind == TokenKind::StringLiteral) {
                    self.pos += 1;
                    text.push_str(&next.value);
                }
                ExprKind::Str(text)
            }
            TokenKind::Identifier => ExprKind::Ident(token.value.clone()),
            TokenKind::UnaryOperator | TokenKind::AdditiveOperator
                if token.value == "-" || token.value == "+" =>
            {
                let op = if token.value == "-" {
                    UnaryOp::Neg
                } else {
                    UnaryOp::Pos
                };
                let operand = self.nested(Self::parse_call_member)?;
                ExprKind::Unary {
                    op,
                    operand: Box::new(operand),
                }
            }
            TokenKind::OpenParen => {
                if self.is(TokenKind::CloseParen) {
                    self.pos += 1;
                    ExprKind::Tuple(Vec::new())
                } else {
                    let first = self.parse_expression()?;
                    if self.is(TokenKind::Comma) {
                        let mut items = vec![first];
                        while self.is(TokenKind::Comma) {
                            self.pos += 1;
                            if self.is(TokenKind::CloseParen) {
                                break;
                            }
                            items.push(self.parse_expression()?);
                        }
                        self.expect(TokenKind::CloseParen, "`)`")?;
                        ExprKind::Tuple(items)
                    } else {
                        self.expect(TokenKind::CloseParen, "`)`")?;
                        return Ok(first);
                    }
                }
            }
            TokenKind::OpenSquareBracket => {
                let mut items = Vec::new();
                while !self.is(TokenKind::CloseSquareBracket) {
                    items.push(self.parse_expression()?);
                    if !self.is(TokenKind::CloseSquareBracket) {
                        self.expect(TokenKind::Comma, "`,` or `]`")?;
                    }
                }
                self.pos += 1;
                ExprKind::Array(items)
            }
            TokenKind::OpenCurlyBracket => {
                let mut entries = Vec::new();
                while !self.is(TokenKind::CloseCurlyBracket) {
                    let key = self.parse_expression()?;
                    self.expect(TokenKind::Colon, "`:`")?;
                    let value = self.parse_expression()?;
                    entries.push((key, value));
                    if !self.is(TokenKind::CloseCurlyBracket) {
                        self.expect(TokenKind::Comma, "`,` or `}`")?;
                    }
                }
                self.pos += 1;
                ExprKind::Object(entries)
            }
            _ => {
                self.pos -= 1;
                return Err(self.error(format!("unexpected token `{}`", token.value)));
            }
        };
        Ok(Expr::new(offset, kind))
    }

    fn parse_number(&self, literal: &str) -> Result<ExprKind> {
        if literal.contains('.') {
            literal
                .parse::<f64>()
                .map(ExprKind::Float)
                .map_err(|_| self.error(format!("invalid number `{literal}`")))
        } else {
            literal
                .parse::<i64>()
                .map(ExprKind::Int)
                .map_err(|_| self.error(format!("integer literal `{literal}` out of range")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::{tokenize, PreprocessOptions};

    fn parse_src(src: &str) -> Result<Program> {
        let lexed = tokenize(src, &PreprocessOptions::default())?;
        parse(&lexed.tokens)
    }

    fn output_expr(src: &str) -> ExprKind {
        let program = parse_src(src).unwrap();
        match program.body.into_iter().next().map(|s| s.kind) {
            Some(StmtKind::Output(expr)) => expr.kind,
            other => panic!("expected output statement, got {other:?}"),
        }
    }

    #[test]
    fn multiplication_binds_tighter_than_addition() {
        let ExprKind::Binary { op, right, .. } = output_expr("{{ 1 + 2 * 3 }}") else {
            panic!("expected binary");
        };
        assert_eq!(op, BinaryOp::Add);
        assert!(matches!(right.kind, ExprKind::Binary { op: BinaryOp::Mul, .. }));
    }

    #[test]
    fn filter_binds_tighter_than_test() {
        let ExprKind::Test { operand, name, negate, .. } =
            output_expr("{{ items | length is not odd }}")
        else {
            panic!("expected test");
        };
        assert_eq!(name, "odd");
        assert!(negate);
        assert!(matches!(operand.kind, ExprKind::Filter { .. }));
    }

    #[test]
    fn not_in_is_one_operator() {
        assert!(matches!(
            output_expr("{{ 'a' not in xs }}"),
            ExprKind::Binary { op: BinaryOp::NotIn, .. }
        ));
    }

    #[test]
    fn adjacent_strings_concatenate() {
        assert_eq!(output_expr("{{ 'a' \"b\" 'c' }}"), ExprKind::Str("abc".into()));
    }

    #[test]
    fn slice_parts_default() {
        let ExprKind::Member { property, .. } = output_expr("{{ xs[::-1] }}") else {
            panic!("expected member");
        };
        let Property::Slice { start, stop, step } = property else {
            panic!("expected slice");
        };
        assert!(start.is_none() && stop.is_none());
        assert_eq!(step.map(|s| s.kind), Some(ExprKind::Int(-1)));
    }

    #[test]
    fn ternary_without_else() {
        assert!(matches!(
            output_expr("{{ 'x' if flag }}"),
            ExprKind::Ternary { otherwise: None, .. }
        ));
    }

    #[test]
    fn for_with_filter_and_else() {
        let program =
            parse_src("{% for k, v in items if v %}{{ k }}{% else %}none{% endfor %}").unwrap();
        let StmtKind::For {
            target,
            iterable,
            default,
            ..
        } = &program.body[0].kind
        else {
            panic!("expected for");
        };
        assert!(matches!(&target.kind, ExprKind::Tuple(names) if names.len() == 2));
        assert!(matches!(iterable.kind, ExprKind::Select { .. }));
        assert_eq!(default.len(), 1);
    }

    #[test]
    fn elif_chains_nest() {
        let program =
            parse_src("{% if a %}1{% elif b %}2{% elif c %}3{% else %}4{% endif %}").unwrap();
        let StmtKind::If { alternate, .. } = &program.body[0].kind else {
            panic!("expected if");
        };
        let StmtKind::If { alternate, .. } = &alternate[0].kind else {
            panic!("expected nested if");
        };
        assert!(matches!(&alternate[0].kind, StmtKind::If { .. }));
    }

    #[test]
    fn keyword_and_spread_args() {
        let ExprKind::Call { args, .. } = output_expr("{{ f(1, x=2, *rest) }}") else {
            panic!("expected call");
        };
        assert!(matches!(args[0], Arg::Positional(_)));
        assert!(matches!(&args[1], Arg::Keyword(name, _) if name == "x"));
        assert!(matches!(args[2], Arg::Spread(_)));
    }

    #[test]
    fn call_block_with_caller_params() {
        let program =
            parse_src("{% call(item) render(xs) %}[{{ item }}]{% endcall %}").unwrap();
        let StmtKind::CallBlock { caller, .. } = &program.body[0].kind else {
            panic!("expected call block");
        };
        assert_eq!(caller.params.len(), 1);
        assert_eq!(caller.params[0].name, "item");
    }

    #[test]
    fn missing_end_tags_are_errors() {
        for src in [
            "{% if x %}a",
            "{% if x %}a{% else %}b",
            "{% for x in y %}a",
            "{% macro m() %}a",
            "{% set x %}a",
            "{% call m() %}a",
            "{% filter upper %}a",
        ] {
            assert!(
                matches!(parse_src(src), Err(Error::Parse { .. })),
                "{src} should fail"
            );
        }
    }

    #[test]
    fn unknown_statement_is_error() {
        let err = parse_src("{% include 'x' %}").unwrap_err();
        assert!(err.to_string().contains("unknown statement `include`"));
        assert!(parse_src("{% endif %}").is_err());
    }

    #[test]
    fn nesting_limit() {
        let deep = format!("{{{{ {}1{} }}}}", "(".repeat(100), ")".repeat(100));
        let err = parse_src(&deep).unwrap_err();
        assert!(err.to_string().contains("nesting"));
        let shallow = format!("{{{{ {}1{} }}}}", "(".repeat(20), ")".repeat(20));
        assert!(parse_src(&shallow).is_ok());
    }

    #[test]
    fn chains_count_toward_nesting() {
        let mixed = format!("{{{{ 2{}{} }}}}", "*2".repeat(80), "+1".repeat(80));
        assert!(parse_src(&mixed).unwrap_err().to_string().contains("nesting"));
        let member = format!("{{{{ a{} }}}}", "[0]".repeat(200));
        assert!(parse_src(&member).is_err());
        let elifs = format!("{{% if a %}}{}{{% endif %}}", "{% elif a %}".repeat(100));
        assert!(parse_src(&elifs).unwrap_err().to_string().contains("block nesting"));
        let ok = format!("{{% if a %}}{}{{% endif %}}", "{% elif a %}".repeat(10));
        assert!(parse_src(&ok).is_ok());
    }

    #[test]
    fn set_targets() {
        assert!(parse_src("{% set ns.count = ns.count + 1 %}").is_ok());
        assert!(parse_src("{% set a, b = 1, 2 %}").is_ok());
        assert!(parse_src("{% set 1 = 2 %}").is_err());
    }
}
