use std::rc::Rc;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::ast::*;
use crate::builtins::{self, Args};
use crate::error::{Error, Result};
use crate::string::JinjaString;
use crate::value::{Closure, Function, ObjectMap, Value};
use crate::Options;

/// Name to value bindings for one scope.
///
/// Nested scopes start as a shallow copy of their parent: rebinding a name
/// in a child never reaches the parent, while mutations through a shared
/// array or object handle do.
#[derive(Debug, Clone)]
pub struct Context {
    vars: ObjectMap,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    pub fn new() -> Self {
        let mut vars = ObjectMap::new();
        for (name, value) in [
            ("true", Value::Bool(true)),
            ("false", Value::Bool(false)),
            ("none", Value::Null),
            ("True", Value::Bool(true)),
            ("False", Value::Bool(false)),
            ("None", Value::Null),
        ] {
            vars.insert(name, value);
        }
        Self { vars }
    }

    /// Bind every top-level key of a JSON object.
    pub fn from_json(doc: &serde_json::Value, mark_input: bool) -> Result<Self> {
        let serde_json::Value::Object(map) = doc else {
            return Err(Error::Input(format!(
                "expected a JSON object at the top level, got {}",
                json_kind(doc)
            )));
        };
        let mut ctx = Context::new();
        for (key, value) in map {
            ctx.set(key.as_str(), Value::from_json(value, mark_input));
        }
        Ok(ctx)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.vars.insert(name, value);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.vars.keys()
    }

    /// Child scope sharing container storage with `self`.
    pub fn derive(&self) -> Context {
        self.clone()
    }

    /// Copy with fresh storage for every array and object.
    pub fn deep_copy(&self) -> Context {
        Context {
            vars: self
                .vars
                .iter()
                .map(|(k, v)| (k.clone(), v.deep_copy()))
                .collect(),
        }
    }
}

fn json_kind(doc: &serde_json::Value) -> &'static str {
    match doc {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

/// How a statement list finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Normal,
    Break,
    Continue,
}

fn escaped(flow: Flow) -> Result<()> {
    match flow {
        Flow::Normal => Ok(()),
        Flow::Break => Err(Error::LoopControl("break")),
        Flow::Continue => Err(Error::LoopControl("continue")),
    }
}

pub struct Evaluator<'o> {
    options: &'o Options,
    depth: usize,
}

impl<'o> Evaluator<'o> {
    pub fn new(options: &'o Options) -> Self {
        Self { options, depth: 0 }
    }

    /// One value per top-level statement: the value of an `{{ }}` output, or
    /// the rendered text of any other statement.
    pub fn execute(&mut self, program: &Program, ctx: &mut Context) -> Result<Vec<Value>> {
        debug!(statements = program.body.len(), "executing template");
        let mut results = Vec::with_capacity(program.body.len());
        for stmt in &program.body {
            if let StmtKind::Output(expr) = &stmt.kind {
                results.push(self.eval(expr, ctx)?);
                continue;
            }
            let mut out = JinjaString::default();
            escaped(self.exec_stmt(stmt, ctx, &mut out)?)?;
            results.push(Value::String(out));
        }
        Ok(results)
    }

    /// Execute and flatten the statement values; top-level arrays contribute
    /// their items in order.
    pub fn render(&mut self, program: &Program, ctx: &mut Context) -> Result<JinjaString> {
        let mut out = JinjaString::default();
        for value in self.execute(program, ctx)? {
            flatten_into(&value, &mut out);
        }
        debug!(len = out.len(), parts = out.parts().len(), "rendered template");
        Ok(out)
    }

    fn exec_block(
        &mut self,
        body: &[Stmt],
        ctx: &mut Context,
        out: &mut JinjaString,
    ) -> Result<Flow> {
        for stmt in body {
            let flow = self.exec_stmt(stmt, ctx, out)?;
            if flow != Flow::Normal {
                return Ok(flow);
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_stmt(&mut self, stmt: &Stmt, ctx: &mut Context, out: &mut JinjaString) -> Result<Flow> {
        self.exec_stmt_kind(stmt, ctx, out)
            .map_err(|e| e.at(stmt.offset))
    }

    fn exec_stmt_kind(
        &mut self,
        stmt: &Stmt,
        ctx: &mut Context,
        out: &mut JinjaString,
    ) -> Result<Flow> {
        match &stmt.kind {
            StmtKind::Text(text) => out.push_str(text, false),
            StmtKind::Comment(_) => {}
            StmtKind::Output(expr) => {
                let value = self.eval(expr, ctx)?;
                out.append(&value.to_jinja_string());
            }
            StmtKind::If {
                test,
                body,
                alternate,
            } => {
                let branch = if self.eval(test, ctx)?.is_truthy() {
                    body
                } else {
                    alternate
                };
                return self.exec_block(branch, ctx, out);
            }
            StmtKind::For {
                target,
                iterable,
                body,
                default,
            } => return self.exec_for(target, iterable, body, default, ctx, out),
            StmtKind::Break => return Ok(Flow::Break),
            StmtKind::Continue => return Ok(Flow::Continue),
            StmtKind::Set {
                target,
                value,
                body,
            } => {
                let value = match value {
                    Some(expr) => self.eval(expr, ctx)?,
                    None => {
                        let mut captured = JinjaString::default();
                        let mut scope = ctx.derive();
                        escaped(self.exec_block(body, &mut scope, &mut captured)?)?;
                        Value::String(captured)
                    }
                };
                self.assign(target, value, ctx)?;
            }
            StmtKind::Macro(def) => {
                let closure = Closure {
                    def: Arc::clone(def),
                    caller: ctx.get("caller").cloned(),
                    scope: ctx.derive(),
                };
                ctx.set(def.name.as_str(), Value::Function(Function::Macro(Rc::new(closure))));
            }
            StmtKind::CallBlock { call, caller } => {
                let closure = Closure {
                    def: Arc::clone(caller),
                    caller: ctx.get("caller").cloned(),
                    scope: ctx.derive(),
                };
                let caller = Value::Function(Function::Macro(Rc::new(closure)));
                let ExprKind::Call { callee, args } = &call.kind else {
                    return Err(Error::runtime("call block requires a call expression"));
                };
                let value = self
                    .eval_call(callee, args, ctx, Some(caller))
                    .map_err(|e| e.at(call.offset))?;
                out.append(&value.to_jinja_string());
            }
            StmtKind::FilterBlock { filter, body } => {
                let mut captured = JinjaString::default();
                let mut scope = ctx.derive();
                escaped(self.exec_block(body, &mut scope, &mut captured)?)?;
                let (name, mut args) = match &filter.kind {
                    ExprKind::Ident(name) => (name.as_str(), self.eval_args(&[], ctx)?),
                    ExprKind::Call { callee, args } => match callee.ident() {
                        Some(name) => (name, self.eval_args(args, ctx)?),
                        None => return Err(Error::runtime("expected filter name")),
                    },
                    _ => return Err(Error::runtime("expected filter name")),
                };
                args.positional.insert(0, Value::String(captured));
                let value = builtins::apply(name, &args)?;
                out.append(&value.to_jinja_string());
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_for(
        &mut self,
        target: &Expr,
        iterable: &Expr,
        body: &[Stmt],
        default: &[Stmt],
        ctx: &mut Context,
        out: &mut JinjaString,
    ) -> Result<Flow> {
        let (iterable, cond) = match &iterable.kind {
            ExprKind::Select { iterable, cond } => (iterable.as_ref(), Some(cond.as_ref())),
            _ => (iterable, None),
        };
        let value = self.eval(iterable, ctx)?;
        let mut items = iteration_items(value, target)?;

        if let Some(cond) = cond {
            let mut kept = Vec::with_capacity(items.len());
            for item in items {
                let mut scope = ctx.derive();
                bind(target, item.clone(), &mut scope)?;
                if self.eval(cond, &scope)?.is_truthy() {
                    kept.push(item);
                }
            }
            items = kept;
        }

        if items.is_empty() {
            return self.exec_block(default, ctx, out);
        }

        trace!(iterations = items.len(), "entering loop");
        for (index, item) in items.iter().enumerate() {
            let mut scope = ctx.derive();
            bind(target, item.clone(), &mut scope)?;
            scope.set("loop", loop_object(index, &items));
            if self.exec_block(body, &mut scope, out)? == Flow::Break {
                break;
            }
        }
        Ok(Flow::Normal)
    }

    fn assign(&mut self, target: &Expr, value: Value, ctx: &mut Context) -> Result<()> {
        match &target.kind {
            ExprKind::Member { object, property } => {
                let container = self.eval(object, ctx)?;
                match (property, &container) {
                    (Property::Name(name), Value::Object(map)) => {
                        map.borrow_mut().insert(name.as_str(), value);
                    }
                    (Property::Index(key), _) => {
                        let key = self.eval(key, ctx)?;
                        set_item(&container, &key, value)?;
                    }
                    _ => {
                        return Err(Error::runtime(format!(
                            "cannot assign an attribute on {}",
                            container.type_name()
                        )))
                    }
                }
                Ok(())
            }
            _ => bind(target, value, ctx),
        }
    }

    fn eval(&mut self, expr: &Expr, ctx: &Context) -> Result<Value> {
        self.eval_kind(expr, ctx).map_err(|e| e.at(expr.offset))
    }

    fn eval_opt_int(&mut self, expr: &Option<Box<Expr>>, ctx: &Context) -> Result<Option<i64>> {
        let Some(expr) = expr else {
            return Ok(None);
        };
        match self.eval(expr, ctx)? {
            Value::Int(i) => Ok(Some(i)),
            Value::Undefined | Value::Null => Ok(None),
            other => Err(Error::runtime(format!(
                "slice indices must be integers, got {}",
                other.type_name()
            ))),
        }
    }

    fn eval_kind(&mut self, expr: &Expr, ctx: &Context) -> Result<Value> {
        match &expr.kind {
            ExprKind::Int(i) => Ok(Value::Int(*i)),
            ExprKind::Float(f) => Ok(Value::Float(*f)),
            ExprKind::Str(s) => Ok(Value::from(s.as_str())),
            ExprKind::Ident(name) => Ok(match ctx.get(name) {
                Some(value) => value.clone(),
                None => builtins::global(name)
                    .map(Value::Function)
                    .unwrap_or_default(),
            }),
            ExprKind::Array(items) | ExprKind::Tuple(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.eval(item, ctx)?);
                }
                Ok(Value::from(values))
            }
            ExprKind::Object(entries) => {
                let mut map = ObjectMap::new();
                for (key, value) in entries {
                    let key = match self.eval(key, ctx)? {
                        Value::String(s) => s.to_string(),
                        other => {
                            return Err(Error::runtime(format!(
                                "object keys must be strings, got {}",
                                other.type_name()
                            )))
                        }
                    };
                    map.insert(key, self.eval(value, ctx)?);
                }
                Ok(Value::from(map))
            }
            ExprKind::Member { object, property } => {
                let container = self.eval(object, ctx)?;
                match property {
                    Property::Name(name) => Ok(match &container {
                        Value::Object(map) => map.borrow().get(name).cloned().unwrap_or_default(),
                        _ => Value::Undefined,
                    }),
                    Property::Index(key) => {
                        let key = self.eval(key, ctx)?;
                        get_item(&container, &key)
                    }
                    Property::Slice { start, stop, step } => {
                        let start = self.eval_opt_int(start, ctx)?;
                        let stop = self.eval_opt_int(stop, ctx)?;
                        let step = self.eval_opt_int(step, ctx)?;
                        match &container {
                            Value::String(s) => {
                                Ok(builtins::slice_string(s, start, stop, step)?.into())
                            }
                            Value::Array(items) => {
                                let items = items.borrow().clone();
                                builtins::slice_items(&items, start, stop, step)
                            }
                            Value::Undefined => Ok(Value::Undefined),
                            other => Err(Error::runtime(format!(
                                "cannot slice {}",
                                other.type_name()
                            ))),
                        }
                    }
                }
            }
            ExprKind::Call { callee, args } => self.eval_call(callee, args, ctx, None),
            ExprKind::Binary { op, left, right } => self.eval_binary(*op, left, right, ctx),
            ExprKind::Unary { op, operand } => {
                let value = self.eval(operand, ctx)?;
                match (op, value) {
                    (UnaryOp::Not, value) => Ok(Value::Bool(!value.is_truthy())),
                    (UnaryOp::Neg, Value::Int(i)) => i
                        .checked_neg()
                        .map(Value::Int)
                        .ok_or_else(|| Error::runtime("integer overflow")),
                    (UnaryOp::Neg, Value::Float(f)) => Ok(Value::Float(-f)),
                    (UnaryOp::Pos, value @ (Value::Int(_) | Value::Float(_))) => Ok(value),
                    (_, value) => Err(Error::runtime(format!(
                        "bad operand type for unary operator: {}",
                        value.type_name()
                    ))),
                }
            }
            ExprKind::Filter {
                operand,
                name,
                args,
            } => {
                let value = self.eval(operand, ctx)?;
                let mut args = self.eval_args(args, ctx)?;
                args.positional.insert(0, value);
                builtins::apply(name, &args)
            }
            ExprKind::Test {
                operand,
                negate,
                name,
                args,
            } => {
                let value = self.eval(operand, ctx)?;
                let mut args = self.eval_args(args, ctx)?;
                args.positional.insert(0, value);
                Ok(Value::Bool(builtins::run_test(name, &args)? != *negate))
            }
            ExprKind::Ternary {
                cond,
                then,
                otherwise,
            } => {
                if self.eval(cond, ctx)?.is_truthy() {
                    self.eval(then, ctx)
                } else {
                    match otherwise {
                        Some(otherwise) => self.eval(otherwise, ctx),
                        None => Ok(Value::Undefined),
                    }
                }
            }
            ExprKind::Select { iterable, cond } => {
                if self.eval(cond, ctx)?.is_truthy() {
                    self.eval(iterable, ctx)
                } else {
                    Ok(Value::Undefined)
                }
            }
        }
    }

    fn eval_args(&mut self, args: &[Arg], ctx: &Context) -> Result<Args> {
        let mut out = Args {
            now: self.options.now,
            ..Args::default()
        };
        for arg in args {
            match arg {
                Arg::Positional(expr) => out.positional.push(self.eval(expr, ctx)?),
                Arg::Keyword(name, expr) => {
                    let value = self.eval(expr, ctx)?;
                    out.keyword.push((name.clone(), value));
                }
                Arg::Spread(expr) => match self.eval(expr, ctx)? {
                    Value::Array(items) => out.positional.extend(items.borrow().iter().cloned()),
                    other => {
                        return Err(Error::runtime(format!(
                            "cannot unpack {} as arguments",
                            other.type_name()
                        )))
                    }
                },
            }
        }
        Ok(out)
    }

    fn eval_call(
        &mut self,
        callee: &Expr,
        args: &[Arg],
        ctx: &Context,
        caller: Option<Value>,
    ) -> Result<Value> {
        if let ExprKind::Member {
            object,
            property: Property::Name(name),
        } = &callee.kind
        {
            let receiver = self.eval(object, ctx)?;
            let stored = match &receiver {
                Value::Object(map) => map.borrow().get(name).cloned(),
                _ => None,
            };
            if let Some(Value::Function(func)) = stored {
                let args = self.eval_args(args, ctx)?;
                return self.invoke(&func, args, ctx, caller);
            }
            let mut args = self.eval_args(args, ctx)?;
            args.positional.insert(0, receiver);
            return builtins::apply(name, &args);
        }

        match self.eval(callee, ctx)? {
            Value::Function(func) => {
                let args = self.eval_args(args, ctx)?;
                self.invoke(&func, args, ctx, caller)
            }
            other => Err(Error::runtime(match callee.ident() {
                Some(name) if other.is_undefined() => format!("`{name}` is undefined"),
                Some(name) => format!("`{name}` is not callable"),
                None => format!("{} is not callable", other.type_name()),
            })),
        }
    }

    fn invoke(
        &mut self,
        func: &Function,
        args: Args,
        ctx: &Context,
        caller: Option<Value>,
    ) -> Result<Value> {
        match func {
            Function::Builtin { name, func } => {
                trace!(function = *name, "calling global");
                func(&args)
            }
            Function::Macro(closure) => self.call_macro(closure, args, ctx, caller),
        }
    }

    fn call_macro(
        &mut self,
        closure: &Closure,
        args: Args,
        ctx: &Context,
        caller: Option<Value>,
    ) -> Result<Value> {
        let limit = self.options.max_call_depth;
        if self.depth >= limit {
            return Err(Error::RecursionLimit(limit));
        }
        let def = &closure.def;
        if args.positional.len() > def.params.len() {
            return Err(Error::runtime(format!(
                "macro `{}` takes {} arguments, {} given",
                def.name,
                def.params.len(),
                args.positional.len()
            )));
        }

        // Names bound where the closure was made shadow the call site; the
        // call site only supplies names defined later, such as other macros.
        let mut scope = ctx.derive();
        for (name, value) in closure.scope.vars.iter() {
            scope.set(name.as_str(), value.clone());
        }
        if let Some(caller) = caller.or_else(|| closure.caller.clone()) {
            scope.set("caller", caller);
        }
        let mut bound = vec![false; def.params.len()];
        for (i, value) in args.positional.into_iter().enumerate() {
            scope.set(def.params[i].name.as_str(), value);
            bound[i] = true;
        }
        for (name, value) in args.keyword {
            let Some(i) = def.params.iter().position(|p| p.name == name) else {
                return Err(Error::runtime(format!(
                    "macro `{}` got an unexpected keyword argument `{name}`",
                    def.name
                )));
            };
            scope.set(name, value);
            bound[i] = true;
        }
        for (param, _) in def.params.iter().zip(&bound).filter(|(_, bound)| !**bound) {
            let value = match &param.default {
                Some(expr) => self.eval(expr, &scope)?,
                None => Value::Undefined,
            };
            scope.set(param.name.as_str(), value);
        }

        trace!(name = def.name.as_str(), depth = self.depth, "calling macro");
        self.depth += 1;
        let mut out = JinjaString::default();
        let result = self.exec_block(&def.body, &mut scope, &mut out);
        self.depth -= 1;
        escaped(result?)?;
        Ok(Value::String(out))
    }

    fn eval_binary(&mut self, op: BinaryOp, left: &Expr, right: &Expr, ctx: &Context) -> Result<Value> {
        let lhs = self.eval(left, ctx)?;
        match op {
            BinaryOp::And if !lhs.is_truthy() => return Ok(lhs),
            BinaryOp::Or if lhs.is_truthy() => return Ok(lhs),
            BinaryOp::And | BinaryOp::Or => return self.eval(right, ctx),
            _ => {}
        }
        let rhs = self.eval(right, ctx)?;
        binary(op, lhs, rhs)
    }
}

fn flatten_into(value: &Value, out: &mut JinjaString) {
    match value {
        Value::Array(items) => {
            for item in items.borrow().iter() {
                flatten_into(item, out);
            }
        }
        other => out.append(&other.to_jinja_string()),
    }
}

fn iteration_items(value: Value, target: &Expr) -> Result<Vec<Value>> {
    Ok(match value {
        Value::Array(items) => items.borrow().clone(),
        Value::Object(map) => {
            let pairs = matches!(target.kind, ExprKind::Tuple(_));
            map.borrow()
                .iter()
                .map(|(k, v)| {
                    if pairs {
                        Value::from(vec![Value::from(k.as_str()), v.clone()])
                    } else {
                        Value::from(k.as_str())
                    }
                })
                .collect()
        }
        Value::String(s) => {
            let flat = s.to_string();
            flat.char_indices()
                .map(|(i, c)| Value::from(s.fragment(&flat, i, i + c.len_utf8())))
                .collect()
        }
        Value::Undefined | Value::Null => Vec::new(),
        other => {
            return Err(Error::runtime(format!(
                "cannot iterate over {}",
                other.type_name()
            )))
        }
    })
}

fn bind(target: &Expr, value: Value, ctx: &mut Context) -> Result<()> {
    match &target.kind {
        ExprKind::Ident(name) => {
            ctx.set(name.as_str(), value);
            Ok(())
        }
        ExprKind::Tuple(names) => {
            let items = value.to_items().ok_or_else(|| {
                Error::runtime(format!("cannot unpack {}", value.type_name()))
            })?;
            if items.len() != names.len() {
                return Err(Error::runtime(format!(
                    "expected {} values to unpack, got {}",
                    names.len(),
                    items.len()
                )));
            }
            for (name, item) in names.iter().zip(items) {
                bind(name, item, ctx)?;
            }
            Ok(())
        }
        _ => Err(Error::runtime("invalid assignment target")),
    }
}

fn loop_object(index: usize, items: &[Value]) -> Value {
    let len = items.len();
    let mut map = ObjectMap::new();
    map.insert("index", Value::Int(index as i64 + 1));
    map.insert("index0", Value::Int(index as i64));
    map.insert("revindex", Value::Int((len - index) as i64));
    map.insert("revindex0", Value::Int((len - index - 1) as i64));
    map.insert("first", Value::Bool(index == 0));
    map.insert("last", Value::Bool(index + 1 == len));
    map.insert("length", Value::Int(len as i64));
    map.insert(
        "previtem",
        index
            .checked_sub(1)
            .and_then(|i| items.get(i))
            .cloned()
            .unwrap_or_default(),
    );
    map.insert("nextitem", items.get(index + 1).cloned().unwrap_or_default());
    Value::from(map)
}

fn normalize_index(index: i64, len: usize) -> Option<usize> {
    let len = len as i64;
    let index = if index < 0 { index + len } else { index };
    (0..len).contains(&index).then_some(index as usize)
}

fn get_item(container: &Value, key: &Value) -> Result<Value> {
    let item = match (container, key) {
        (Value::Object(map), Value::String(key)) => map.borrow().get(&key.to_string()).cloned(),
        (Value::Array(items), Value::Int(i)) => {
            let items = items.borrow();
            normalize_index(*i, items.len()).map(|i| items[i].clone())
        }
        (Value::String(s), Value::Int(i)) => {
            let flat = s.to_string();
            let offsets: Vec<(usize, char)> = flat.char_indices().collect();
            normalize_index(*i, offsets.len()).map(|i| {
                let (start, c) = offsets[i];
                Value::from(s.fragment(&flat, start, start + c.len_utf8()))
            })
        }
        (Value::Object(_) | Value::Array(_) | Value::String(_), _) => None,
        (Value::Undefined | Value::Null, _) => None,
        (other, _) => {
            return Err(Error::runtime(format!(
                "{} is not subscriptable",
                other.type_name()
            )))
        }
    };
    Ok(item.unwrap_or_default())
}

fn set_item(container: &Value, key: &Value, value: Value) -> Result<()> {
    match (container, key) {
        (Value::Object(map), Value::String(key)) => {
            map.borrow_mut().insert(key.to_string(), value);
            Ok(())
        }
        (Value::Array(items), Value::Int(i)) => {
            let mut items = items.borrow_mut();
            let index = normalize_index(*i, items.len())
                .ok_or_else(|| Error::runtime("list assignment index out of range"))?;
            items[index] = value;
            Ok(())
        }
        (container, key) => Err(Error::runtime(format!(
            "cannot assign to {} with a {} key",
            container.type_name(),
            key.type_name()
        ))),
    }
}

fn python_mod_int(a: i64, b: i64) -> Option<i64> {
    let r = a.checked_rem(b)?;
    Some(if r != 0 && ((r < 0) != (b < 0)) { r + b } else { r })
}

fn python_mod_float(a: f64, b: f64) -> f64 {
    let r = a % b;
    if r != 0.0 && ((r < 0.0) != (b < 0.0)) {
        r + b
    } else {
        r
    }
}

fn unsupported(op: &str, lhs: &Value, rhs: &Value) -> Error {
    Error::runtime(format!(
        "unsupported operand types for {op}: {} and {}",
        lhs.type_name(),
        rhs.type_name()
    ))
}

fn overflow() -> Error {
    Error::runtime("integer overflow")
}

fn binary(op: BinaryOp, lhs: Value, rhs: Value) -> Result<Value> {
    use Value::{Float, Int};
    match op {
        BinaryOp::Eq => Ok(Value::Bool(lhs == rhs)),
        BinaryOp::Ne => Ok(Value::Bool(lhs != rhs)),
        BinaryOp::Lt => Ok(Value::Bool(lhs.compare(&rhs)?.is_lt())),
        BinaryOp::Le => Ok(Value::Bool(lhs.compare(&rhs)?.is_le())),
        BinaryOp::Gt => Ok(Value::Bool(lhs.compare(&rhs)?.is_gt())),
        BinaryOp::Ge => Ok(Value::Bool(lhs.compare(&rhs)?.is_ge())),
        BinaryOp::In => Ok(Value::Bool(rhs.contains(&lhs)?)),
        BinaryOp::NotIn => Ok(Value::Bool(!rhs.contains(&lhs)?)),
        BinaryOp::Concat => Ok(lhs.to_jinja_string().concat(&rhs.to_jinja_string()).into()),
        BinaryOp::Add => match (&lhs, &rhs) {
            (Int(a), Int(b)) => a.checked_add(*b).map(Int).ok_or_else(overflow),
            (Int(_) | Float(_), Int(_) | Float(_)) => Ok(Float(
                lhs.as_f64().unwrap_or_default() + rhs.as_f64().unwrap_or_default(),
            )),
            (Value::Array(a), Value::Array(b)) => {
                let mut items = a.borrow().clone();
                items.extend(b.borrow().iter().cloned());
                Ok(Value::from(items))
            }
            (Value::String(_), Value::String(_) | Value::Undefined | Int(_) | Float(_))
            | (Value::Undefined | Int(_) | Float(_), Value::String(_)) => {
                Ok(lhs.to_jinja_string().concat(&rhs.to_jinja_string()).into())
            }
            _ => Err(unsupported("+", &lhs, &rhs)),
        },
        BinaryOp::Sub => match (&lhs, &rhs) {
            (Int(a), Int(b)) => a.checked_sub(*b).map(Int).ok_or_else(overflow),
            (Int(_) | Float(_), Int(_) | Float(_)) => Ok(Float(
                lhs.as_f64().unwrap_or_default() - rhs.as_f64().unwrap_or_default(),
            )),
            _ => Err(unsupported("-", &lhs, &rhs)),
        },
        BinaryOp::Mul => match (&lhs, &rhs) {
            (Int(a), Int(b)) => a.checked_mul(*b).map(Int).ok_or_else(overflow),
            (Int(_) | Float(_), Int(_) | Float(_)) => Ok(Float(
                lhs.as_f64().unwrap_or_default() * rhs.as_f64().unwrap_or_default(),
            )),
            (Value::String(s), Int(n)) | (Int(n), Value::String(s)) => {
                let mut out = JinjaString::default();
                for _ in 0..(*n).max(0) {
                    out.append(s);
                }
                Ok(out.into())
            }
            _ => Err(unsupported("*", &lhs, &rhs)),
        },
        BinaryOp::Div => match (lhs.as_f64(), rhs.as_f64()) {
            (Some(_), Some(b)) if b == 0.0 => Err(Error::runtime("division by zero")),
            (Some(a), Some(b)) => Ok(Float(a / b)),
            _ => Err(unsupported("/", &lhs, &rhs)),
        },
        BinaryOp::Mod => match (&lhs, &rhs) {
            (Int(_), Int(0)) => Err(Error::runtime("modulo by zero")),
            (Int(a), Int(b)) => python_mod_int(*a, *b).map(Int).ok_or_else(overflow),
            (Int(_) | Float(_), Int(_) | Float(_)) => {
                let (a, b) = (lhs.as_f64().unwrap_or_default(), rhs.as_f64().unwrap_or_default());
                if b == 0.0 {
                    Err(Error::runtime("modulo by zero"))
                } else {
                    Ok(Float(python_mod_float(a, b)))
                }
            }
            _ => Err(unsupported("%", &lhs, &rhs)),
        },
        BinaryOp::And | BinaryOp::Or => Err(Error::runtime("logical operators short-circuit")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::{tokenize, PreprocessOptions};
    use crate::parser::parse;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn run(src: &str, doc: serde_json::Value) -> Result<String> {
        let lexed = tokenize(src, &PreprocessOptions::default())?;
        let program = parse(&lexed.tokens)?;
        let options = Options::default();
        let mut ctx = Context::from_json(&doc, false)?;
        Ok(Evaluator::new(&options).render(&program, &mut ctx)?.to_string())
    }

    #[test]
    fn loop_variables() {
        let out = run(
            "{% for x in xs %}{{ loop.index }}/{{ loop.revindex0 }}{{ '|' if not loop.last }}{% endfor %}",
            json!({"xs": ["a", "b", "c"]}),
        )
        .unwrap();
        assert_eq!(out, "1/2|2/1|3/0");
    }

    #[test]
    fn previtem_and_nextitem() {
        let out = run(
            "{% for x in xs %}{{ loop.previtem }}<{{ x }}>{{ loop.nextitem }};{% endfor %}",
            json!({"xs": [1, 2]}),
        )
        .unwrap();
        assert_eq!(out, "<1>2;1<2>;");
    }

    #[test]
    fn break_and_continue() {
        let out = run(
            "{% for i in range(10) %}{% if i is even %}{% continue %}{% endif %}{% if i > 6 %}{% break %}{% endif %}{{ i }}{% endfor %}",
            json!({}),
        )
        .unwrap();
        assert_eq!(out, "135");
    }

    #[test]
    fn loop_control_outside_loop_is_error() {
        assert_eq!(
            run("{% break %}", json!({})),
            Err(Error::LoopControl("break"))
        );
        assert_eq!(
            run("{% macro m() %}{% continue %}{% endmacro %}{% for x in [1] %}{{ m() }}{% endfor %}", json!({})),
            Err(Error::LoopControl("continue"))
        );
    }

    #[test]
    fn loop_filter_and_else() {
        let out = run(
            "{% for x in xs if x > 1 %}{{ x }}{% else %}empty{% endfor %}|{% for x in [] %}{% else %}empty{% endfor %}",
            json!({"xs": [1, 2, 3]}),
        )
        .unwrap();
        assert_eq!(out, "23|empty");
    }

    #[test]
    fn object_iteration() {
        let out = run(
            "{% for k in obj %}{{ k }};{% endfor %}{% for k, v in obj %}{{ k }}={{ v }} {% endfor %}",
            json!({"obj": {"a": 1, "b": 2}}),
        )
        .unwrap();
        assert_eq!(out, "a;b;a=1 b=2 ");
    }

    #[test]
    fn macros_with_defaults_and_keywords() {
        let out = run(
            "{% macro greet(name, punct='!') %}Hi {{ name }}{{ punct }}{% endmacro %}{{ greet('A') }} {{ greet(punct='?', name='B') }}",
            json!({}),
        )
        .unwrap();
        assert_eq!(out, "Hi A! Hi B?");
    }

    #[test]
    fn macro_argument_errors() {
        let src = "{% macro m(a) %}{% endmacro %}";
        assert!(run(&format!("{src}{{{{ m(1, 2) }}}}"), json!({})).is_err());
        assert!(run(&format!("{src}{{{{ m(b=1) }}}}"), json!({})).is_err());
    }

    #[test]
    fn call_block_exposes_caller() {
        let out = run(
            "{% macro wrap(tag) %}<{{ tag }}>{{ caller('x') }}</{{ tag }}>{% endmacro %}{% set outer = 'o' %}{% call(v) wrap('b') %}{{ v }}{{ outer }}{% endcall %}",
            json!({}),
        )
        .unwrap();
        assert_eq!(out, "<b>xo</b>");
    }

    #[test]
    fn recursion_is_bounded() {
        let lexed = tokenize(
            "{% macro r(n) %}{{ r(n + 1) }}{% endmacro %}{{ r(0) }}",
            &PreprocessOptions::default(),
        )
        .unwrap();
        let program = parse(&lexed.tokens).unwrap();
        let options = Options {
            max_call_depth: 8,
            ..Options::default()
        };
        let err = Evaluator::new(&options)
            .render(&program, &mut Context::new())
            .unwrap_err();
        assert_eq!(err, Error::RecursionLimit(8));
    }

    #[test]
    fn filter_block() {
        let out = run("{% filter upper %}hi {{ name }}{% endfilter %}", json!({"name": "bo"})).unwrap();
        assert_eq!(out, "HI BO");
    }

    #[test]
    fn set_forms() {
        let out = run(
            "{% set a, b = 1, 2 %}{% set d = {} %}{% set d.x = a %}{% set d['y'] = b %}{% set xs = [0, 0] %}{% set xs[-1] = 9 %}{% set blk %}[{{ a }}]{% endset %}{{ d.x }}{{ d.y }}{{ xs | join(',') }}{{ blk }}",
            json!({}),
        )
        .unwrap();
        assert_eq!(out, "120,9[1]");
    }

    #[test]
    fn member_access_is_lenient() {
        let out = run(
            "[{{ missing }}][{{ missing.deeper }}][{{ obj.nope }}][{{ xs[5] }}][{{ xs[-1] }}]",
            json!({"obj": {}, "xs": [1, 2]}),
        )
        .unwrap();
        assert_eq!(out, "[][][][][2]");
    }

    #[test]
    fn methods_and_stored_callables() {
        let out = run(
            "{{ 'a,b'.split(',') | join('+') }} {{ obj.get('k', 'd') }} {{ ' x '.strip() }}",
            json!({"obj": {}}),
        )
        .unwrap();
        assert_eq!(out, "a+b d x");
    }

    #[test]
    fn arithmetic() {
        let out = run(
            "{{ 7 % 3 }} {{ -7 % 3 }} {{ 7 / 2 }} {{ 2 * 3 + 1 }} {{ 'ab' * 2 }} {{ 1 + 1.5 }} {{ ([1] + [2]) | length }} {{ 'n' ~ 1 }}",
            json!({}),
        )
        .unwrap();
        assert_eq!(out, "1 2 3.5 7 abab 2.5 2 n1");
        assert!(run("{{ 1 / 0 }}", json!({})).is_err());
        assert!(run("{{ 1 % 0 }}", json!({})).is_err());
    }

    #[test]
    fn logical_operators_return_operands() {
        let out = run("{{ x or 'fallback' }}|{{ 0 and 1 }}|{{ 'a' in 'cat' }}|{{ 3 not in [1] }}", json!({})).unwrap();
        assert_eq!(out, "fallback|0|True|True");
    }

    #[test]
    fn runtime_errors_carry_offsets() {
        let err = run("abc{{ 1 + 'x' }}", json!({})).unwrap_err();
        let Error::Runtime { offset, .. } = err else {
            panic!("expected runtime error, got {err:?}");
        };
        assert_eq!(offset, Some(6));
    }

    #[test]
    fn string_indexing_and_slicing() {
        let out = run("{{ s[0] }}{{ s[-1] }}{{ s[1:3] }}{{ s[::-1] }}", json!({"s": "abcd"})).unwrap();
        assert_eq!(out, "adbcdcba");
    }

    #[test]
    fn top_level_must_be_object() {
        assert!(matches!(
            Context::from_json(&json!([1]), false),
            Err(Error::Input(_))
        ));
    }

    #[test]
    fn top_level_arrays_flatten_nested_ones_display() {
        let out = run(
            "{{ [1, [2, 'a']] }}|{% if true %}{{ [1, 'a'] }}{% endif %}",
            json!({}),
        )
        .unwrap();
        assert_eq!(out, "12a|[1, 'a']");
    }

    #[test]
    fn execute_returns_one_value_per_statement() {
        let lexed = tokenize("a{{ 1 }}{% set x = 2 %}", &PreprocessOptions::default()).unwrap();
        let program = parse(&lexed.tokens).unwrap();
        let options = Options::default();
        let mut ctx = Context::new();
        let values = Evaluator::new(&options).execute(&program, &mut ctx).unwrap();
        assert_eq!(values.len(), 3);
        assert_eq!(values[1], Value::Int(1));
        assert_eq!(ctx.get("x"), Some(&Value::Int(2)));
    }
}
