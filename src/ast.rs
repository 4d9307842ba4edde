use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Concat, // ~
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    In,
    NotIn,
}

impl BinaryOp {
    pub fn from_symbol(symbol: &str) -> Option<Self> {
        Some(match symbol {
            "+" => BinaryOp::Add,
            "-" => BinaryOp::Sub,
            "~" => BinaryOp::Concat,
            "*" => BinaryOp::Mul,
            "/" => BinaryOp::Div,
            "%" => BinaryOp::Mod,
            "==" => BinaryOp::Eq,
            "!=" => BinaryOp::Ne,
            "<" => BinaryOp::Lt,
            "<=" => BinaryOp::Le,
            ">" => BinaryOp::Gt,
            ">=" => BinaryOp::Ge,
            "and" => BinaryOp::And,
            "or" => BinaryOp::Or,
            "in" => BinaryOp::In,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
    Pos,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    /// Byte offset of the first token in the preprocessed source.
    pub offset: usize,
    pub kind: ExprKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    Array(Vec<Expr>),
    Tuple(Vec<Expr>),
    Object(Vec<(Expr, Expr)>),
    Member {
        object: Box<Expr>,
        property: Property,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Arg>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    /// `operand | name(args)`
    Filter {
        operand: Box<Expr>,
        name: String,
        args: Vec<Arg>,
    },
    /// `operand is [not] name(args)`
    Test {
        operand: Box<Expr>,
        negate: bool,
        name: String,
        args: Vec<Arg>,
    },
    /// `then if cond else otherwise`; a missing else yields undefined.
    Ternary {
        cond: Box<Expr>,
        then: Box<Expr>,
        otherwise: Option<Box<Expr>>,
    },
    /// Inline loop filter: `for x in items if cond`.
    Select {
        iterable: Box<Expr>,
        cond: Box<Expr>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Property {
    Name(String),        // foo.bar
    Index(Box<Expr>),    // foo['bar'], foo[0]
    Slice {
        start: Option<Box<Expr>>,
        stop: Option<Box<Expr>>,
        step: Option<Box<Expr>>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Positional(Expr),
    Keyword(String, Expr),
    /// `*expr`
    Spread(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub default: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MacroDef {
    pub name: String,
    pub params: Vec<Param>,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub offset: usize,
    pub kind: StmtKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    Text(String),
    Comment(String),
    Output(Expr),
    If {
        test: Expr,
        body: Vec<Stmt>,
        /// `elif` chains nest as a single `If` in here.
        alternate: Vec<Stmt>,
    },
    For {
        target: Expr,
        iterable: Expr,
        body: Vec<Stmt>,
        /// Rendered when the loop runs zero times (`{% else %}`).
        default: Vec<Stmt>,
    },
    Break,
    Continue,
    /// `{% set x = v %}` or the block form `{% set x %}...{% endset %}`.
    Set {
        target: Expr,
        value: Option<Expr>,
        body: Vec<Stmt>,
    },
    Macro(Arc<MacroDef>),
    /// `{% call(params) m(args) %}body{% endcall %}`
    CallBlock {
        call: Expr,
        caller: Arc<MacroDef>,
    },
    /// `{% filter name(args) %}body{% endfilter %}`
    FilterBlock {
        filter: Expr,
        body: Vec<Stmt>,
    },
}

/// A parsed template. Immutable once built.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Program {
    pub body: Vec<Stmt>,
}

impl Expr {
    pub fn new(offset: usize, kind: ExprKind) -> Self {
        Self { offset, kind }
    }

    /// The identifier name, if this is a bare identifier.
    pub fn ident(&self) -> Option<&str> {
        match &self.kind {
            ExprKind::Ident(name) => Some(name),
            _ => None,
        }
    }

    /// Levels in the expression tree; a literal or name is 1.
    pub fn height(&self) -> usize {
        fn tallest<'e>(exprs: impl Iterator<Item = &'e Expr>) -> usize {
            exprs.map(Expr::height).max().unwrap_or(0)
        }
        fn args(args: &[Arg]) -> usize {
            tallest(args.iter().map(|arg| match arg {
                Arg::Positional(e) | Arg::Keyword(_, e) | Arg::Spread(e) => e,
            }))
        }

        let below = match &self.kind {
            ExprKind::Int(_) | ExprKind::Float(_) | ExprKind::Str(_) | ExprKind::Ident(_) => 0,
            ExprKind::Array(items) | ExprKind::Tuple(items) => tallest(items.iter()),
            ExprKind::Object(entries) => tallest(entries.iter().flat_map(|(k, v)| [k, v])),
            ExprKind::Member { object, property } => {
                let property = match property {
                    Property::Name(_) => 0,
                    Property::Index(index) => index.height(),
                    Property::Slice { start, stop, step } => {
                        tallest([start, stop, step].into_iter().flatten().map(|e| &**e))
                    }
                };
                object.height().max(property)
            }
            ExprKind::Call { callee, args: a } => callee.height().max(args(a)),
            ExprKind::Binary { left, right, .. } => left.height().max(right.height()),
            ExprKind::Unary { operand, .. } => operand.height(),
            ExprKind::Filter { operand, args: a, .. } | ExprKind::Test { operand, args: a, .. } => {
                operand.height().max(args(a))
            }
            ExprKind::Ternary {
                cond,
                then,
                otherwise,
            } => cond
                .height()
                .max(then.height())
                .max(otherwise.as_ref().map_or(0, |e| e.height())),
            ExprKind::Select { iterable, cond } => iterable.height().max(cond.height()),
        };
        below + 1
    }
}

impl Stmt {
    pub fn new(offset: usize, kind: StmtKind) -> Self {
        Self { offset, kind }
    }
}
