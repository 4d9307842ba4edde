//! Static feature analysis of a parsed template.
//!
//! The walk never executes anything: it looks at which names, attributes and
//! constructs the template uses and summarizes them as [`Capabilities`].

use serde::Serialize;
use tracing::debug;

use crate::ast::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub supports_tools: bool,
    pub supports_tool_calls: bool,
    pub supports_parallel_tool_calls: bool,
    pub branches_on_system_role: bool,
    pub supports_system_role: bool,
    pub requires_typed_content: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            supports_tools: false,
            supports_tool_calls: false,
            supports_parallel_tool_calls: false,
            branches_on_system_role: false,
            supports_system_role: true,
            requires_typed_content: false,
        }
    }
}

const CONTENT_FILTERS: &[&str] = &["selectattr", "rejectattr", "map", "first", "last"];

pub fn analyze(program: &Program) -> Capabilities {
    let mut analyzer = Analyzer::default();
    analyzer.visit_body(&program.body);
    debug!(caps = ?analyzer.caps, "capability pass finished");
    analyzer.caps
}

#[derive(Default)]
struct Analyzer {
    caps: Capabilities,
}

impl Analyzer {
    fn visit_body(&mut self, body: &[Stmt]) {
        for stmt in body {
            self.visit_stmt(stmt);
        }
    }

    fn visit_stmt(&mut self, stmt: &Stmt) {
        match &stmt.kind {
            StmtKind::Text(_) | StmtKind::Comment(_) | StmtKind::Break | StmtKind::Continue => {}
            StmtKind::Output(expr) => self.visit_expr(expr),
            StmtKind::If {
                test,
                body,
                alternate,
            } => {
                if let Some(equal) = system_role_test(test) {
                    self.caps.branches_on_system_role = true;
                    let system_branch = if equal { body } else { alternate };
                    if only_raises(system_branch) {
                        self.caps.supports_system_role = false;
                    }
                }
                self.visit_expr(test);
                self.visit_body(body);
                self.visit_body(alternate);
            }
            StmtKind::For {
                target,
                iterable,
                body,
                default,
            } => {
                let source = match &iterable.kind {
                    ExprKind::Select { iterable, .. } => iterable.as_ref(),
                    _ => iterable,
                };
                if names(source, "tool_calls") {
                    self.caps.supports_parallel_tool_calls = true;
                }
                if names(source, "content") {
                    self.caps.requires_typed_content = true;
                }
                self.visit_expr(target);
                self.visit_expr(iterable);
                self.visit_body(body);
                self.visit_body(default);
            }
            StmtKind::Set {
                target,
                value,
                body,
            } => {
                self.visit_expr(target);
                if let Some(value) = value {
                    self.visit_expr(value);
                }
                self.visit_body(body);
            }
            StmtKind::Macro(def) => self.visit_macro(def),
            StmtKind::CallBlock { call, caller } => {
                self.visit_expr(call);
                self.visit_macro(caller);
            }
            StmtKind::FilterBlock { filter, body } => {
                self.visit_expr(filter);
                self.visit_body(body);
            }
        }
    }

    fn visit_macro(&mut self, def: &MacroDef) {
        for param in &def.params {
            if let Some(default) = &param.default {
                self.visit_expr(default);
            }
        }
        self.visit_body(&def.body);
    }

    fn visit_args(&mut self, args: &[Arg]) {
        for arg in args {
            match arg {
                Arg::Positional(expr) | Arg::Keyword(_, expr) | Arg::Spread(expr) => {
                    self.visit_expr(expr)
                }
            }
        }
    }

    fn visit_expr(&mut self, expr: &Expr) {
        match &expr.kind {
            ExprKind::Int(_) | ExprKind::Float(_) | ExprKind::Str(_) => {}
            ExprKind::Ident(name) => self.note_name(name),
            ExprKind::Array(items) | ExprKind::Tuple(items) => {
                for item in items {
                    self.visit_expr(item);
                }
            }
            ExprKind::Object(entries) => {
                for (key, value) in entries {
                    self.visit_expr(key);
                    self.visit_expr(value);
                }
            }
            ExprKind::Member { object, property } => {
                match property {
                    Property::Name(name) => self.note_name(name),
                    Property::Index(index) => {
                        if let ExprKind::Str(key) = &index.kind {
                            self.note_name(key);
                        } else if names(object, "content") {
                            self.caps.requires_typed_content = true;
                        }
                        self.visit_expr(index);
                    }
                    Property::Slice { start, stop, step } => {
                        for bound in [start, stop, step].into_iter().flatten() {
                            self.visit_expr(bound);
                        }
                    }
                }
                self.visit_expr(object);
            }
            ExprKind::Call { callee, args } => {
                self.visit_expr(callee);
                self.visit_args(args);
            }
            ExprKind::Binary { left, right, .. } => {
                self.visit_expr(left);
                self.visit_expr(right);
            }
            ExprKind::Unary { operand, .. } => self.visit_expr(operand),
            ExprKind::Filter {
                operand,
                name,
                args,
            } => {
                if CONTENT_FILTERS.contains(&name.as_str()) && names(operand, "content") {
                    self.caps.requires_typed_content = true;
                }
                self.visit_expr(operand);
                self.visit_args(args);
            }
            ExprKind::Test { operand, args, .. } => {
                self.visit_expr(operand);
                self.visit_args(args);
            }
            ExprKind::Ternary {
                cond,
                then,
                otherwise,
            } => {
                self.visit_expr(cond);
                self.visit_expr(then);
                if let Some(otherwise) = otherwise {
                    self.visit_expr(otherwise);
                }
            }
            ExprKind::Select { iterable, cond } => {
                self.visit_expr(iterable);
                self.visit_expr(cond);
            }
        }
    }

    fn note_name(&mut self, name: &str) {
        match name {
            "tools" => self.caps.supports_tools = true,
            "tool_calls" => self.caps.supports_tool_calls = true,
            _ => {}
        }
    }
}

/// Whether `expr` reads `name` directly: `name`, `x.name` or `x['name']`.
fn names(expr: &Expr, name: &str) -> bool {
    match &expr.kind {
        ExprKind::Ident(ident) => ident == name,
        ExprKind::Member {
            property: Property::Name(attr),
            ..
        } => attr == name,
        ExprKind::Member {
            property: Property::Index(index),
            ..
        } => matches!(&index.kind, ExprKind::Str(key) if key == name),
        _ => false,
    }
}

fn is_system_literal(expr: &Expr) -> bool {
    matches!(&expr.kind, ExprKind::Str(s) if s == "system")
}

/// `Some(true)` for `role == "system"`, `Some(false)` for `role != "system"`.
fn system_role_test(test: &Expr) -> Option<bool> {
    match &test.kind {
        ExprKind::Binary {
            op: op @ (BinaryOp::Eq | BinaryOp::Ne),
            left,
            right,
        } => {
            let matched = (names(left, "role") && is_system_literal(right))
                || (is_system_literal(left) && names(right, "role"));
            matched.then_some(*op == BinaryOp::Eq)
        }
        ExprKind::Test {
            operand,
            negate,
            name,
            args,
        } if matches!(name.as_str(), "eq" | "equalto" | "==" | "sameas") => match args.as_slice() {
            [Arg::Positional(value)] if names(operand, "role") && is_system_literal(value) => {
                Some(!*negate)
            }
            _ => None,
        },
        ExprKind::Unary {
            op: UnaryOp::Not,
            operand,
        } => system_role_test(operand).map(|equal| !equal),
        _ => None,
    }
}

/// A branch whose only effect is a `raise_exception(...)` call.
fn only_raises(body: &[Stmt]) -> bool {
    let mut effects = body.iter().filter(|stmt| match &stmt.kind {
        StmtKind::Text(text) => !text.trim().is_empty(),
        StmtKind::Comment(_) => false,
        _ => true,
    });
    let Some(stmt) = effects.next() else {
        return false;
    };
    if effects.next().is_some() {
        return false;
    }
    matches!(
        &stmt.kind,
        StmtKind::Output(Expr {
            kind: ExprKind::Call { callee, .. },
            ..
        }) if callee.ident() == Some("raise_exception")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::{tokenize, PreprocessOptions};
    use crate::parser::parse;

    fn caps(src: &str) -> Capabilities {
        let lexed = tokenize(src, &PreprocessOptions::default()).unwrap();
        analyze(&parse(&lexed.tokens).unwrap())
    }

    #[test]
    fn plain_template_uses_nothing() {
        let c = caps("{% for m in messages %}{{ m.role }}: {{ m.content }}\n{% endfor %}");
        assert_eq!(c, Capabilities::default());
    }

    #[test]
    fn tools_and_tool_calls() {
        let c = caps("{% if tools %}{{ tools | tojson }}{% endif %}{{ message['tool_calls'] }}");
        assert!(c.supports_tools);
        assert!(c.supports_tool_calls);
        assert!(!c.supports_parallel_tool_calls);

        let c = caps("{% for call in message.tool_calls %}{{ call.function.name }}{% endfor %}");
        assert!(c.supports_tool_calls);
        assert!(c.supports_parallel_tool_calls);
        assert!(!c.supports_tools);
    }

    #[test]
    fn system_role_branch() {
        let c = caps("{% if message.role == 'system' %}<<SYS>>{% endif %}");
        assert!(c.branches_on_system_role);
        assert!(c.supports_system_role);
    }

    #[test]
    fn system_role_rejected() {
        let c = caps(
            "{% for m in messages %}{% if m['role'] == 'system' %}\n  {{ raise_exception('System role not supported') }}\n{% endif %}{% endfor %}",
        );
        assert!(c.branches_on_system_role);
        assert!(!c.supports_system_role);

        let c = caps("{% if 'system' != m.role %}ok{% else %}{{ raise_exception('no') }}{% endif %}");
        assert!(!c.supports_system_role);
    }

    #[test]
    fn typed_content_detection() {
        assert!(caps("{{ m.content[0].text }}").requires_typed_content);
        assert!(caps("{% for part in m.content %}{{ part.text }}{% endfor %}").requires_typed_content);
        assert!(caps("{{ m.content | selectattr('type', 'equalto', 'text') | list }}").requires_typed_content);
        assert!(!caps("{{ m.content | trim }}").requires_typed_content);
        assert!(!caps("{{ m['content'] }}").requires_typed_content);
    }

    #[test]
    fn walks_macro_bodies() {
        let c = caps("{% macro render(m) %}{{ m.tool_calls }}{% endmacro %}");
        assert!(c.supports_tool_calls);
    }
}
