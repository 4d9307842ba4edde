use std::cell::RefCell;
use std::cmp::Ordering;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use crate::ast::MacroDef;
use crate::builtins::BuiltinFn;
use crate::error::{Error, Result};
use crate::eval::Context;
use crate::string::JinjaString;

/// Key of the single-entry wrapper object that marks a string as input text
/// regardless of the document-wide flag: `{"__input__": "text"}`.
pub const INPUT_MARKER: &str = "__input__";

const MAX_NESTING: usize = 512;

/// Insertion-ordered string-keyed map.
#[derive(Debug, Clone, Default)]
pub struct ObjectMap {
    entries: Vec<(String, Value)>,
}

impl ObjectMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Insert or overwrite; an existing key keeps its position.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        let key = key.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => Some(std::mem::replace(slot, value)),
            None => {
                self.entries.push((key, value));
                None
            }
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let index = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(index).1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.entries.iter().map(|(k, v)| (k, v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.entries.iter().map(|(k, _)| k)
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.entries.iter().map(|(_, v)| v)
    }
}

// Python dict semantics: order does not matter for equality.
impl PartialEq for ObjectMap {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self
                .iter()
                .all(|(k, v)| other.get(k).is_some_and(|o| v.eq_at(o, 0)))
    }
}

impl FromIterator<(String, Value)> for ObjectMap {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        let mut map = ObjectMap::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

/// Macro or `caller` body bound as a value.
#[derive(Debug)]
pub struct Closure {
    pub def: Arc<MacroDef>,
    /// `caller` visible where the macro was defined.
    pub caller: Option<Value>,
    /// Scope at the point of definition. Its names take precedence over
    /// the scope the closure is called from.
    pub scope: Context,
}

#[derive(Clone)]
pub enum Function {
    Builtin { name: &'static str, func: BuiltinFn },
    Macro(Rc<Closure>),
}

impl Function {
    pub fn name(&self) -> &str {
        match self {
            Function::Builtin { name, .. } => name,
            Function::Macro(closure) => &closure.def.name,
        }
    }

    fn ptr_eq(&self, other: &Function) -> bool {
        match (self, other) {
            (Function::Builtin { name: a, .. }, Function::Builtin { name: b, .. }) => a == b,
            (Function::Macro(a), Function::Macro(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Function::Builtin { name, .. } => write!(f, "Builtin({name})"),
            Function::Macro(closure) => write!(f, "Macro({})", closure.def.name),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(JinjaString),
    Array(Rc<RefCell<Vec<Value>>>),
    Object(Rc<RefCell<ObjectMap>>),
    Function(Function),
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(JinjaString::template(s))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(JinjaString::template(s))
    }
}

impl From<JinjaString> for Value {
    fn from(s: JinjaString) -> Self {
        Value::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(Rc::new(RefCell::new(items)))
    }
}

impl From<ObjectMap> for Value {
    fn from(map: ObjectMap) -> Self {
        Value::Object(Rc::new(RefCell::new(map)))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.eq_at(other, 0)
    }
}

impl Value {
    /// Equality that gives up (unequal) past `MAX_NESTING` levels.
    fn eq_at(&self, other: &Value, level: usize) -> bool {
        if level > MAX_NESTING {
            return false;
        }
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
                self.as_f64() == other.as_f64()
            }
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                let (a, b) = (a.borrow(), b.borrow());
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.eq_at(y, level + 1))
            }
            (Value::Object(a), Value::Object(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                let (a, b) = (a.borrow(), b.borrow());
                a.len() == b.len()
                    && a.iter()
                        .all(|(k, v)| b.get(k).is_some_and(|o| v.eq_at(o, level + 1)))
            }
            (Value::Function(a), Value::Function(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_jinja_string())
    }
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "none",
            Value::Bool(_) => "boolean",
            Value::Int(_) => "integer",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Function(_) => "function",
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Undefined | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::String(s) => !s.is_empty(),
            Value::Array(a) => !a.borrow().is_empty(),
            Value::Object(o) => !o.borrow().is_empty(),
            Value::Function(_) => true,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_jinja_str(&self) -> Option<&JinjaString> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// A snapshot of an array's items, or `None` for other kinds.
    pub fn to_items(&self) -> Option<Vec<Value>> {
        match self {
            Value::Array(items) => Some(items.borrow().clone()),
            _ => None,
        }
    }

    /// Structural copy: nested arrays and objects get fresh storage.
    /// Below `MAX_NESTING` levels the handles are shared instead.
    pub fn deep_copy(&self) -> Value {
        self.deep_copy_at(0)
    }

    fn deep_copy_at(&self, level: usize) -> Value {
        if level > MAX_NESTING {
            return self.clone();
        }
        match self {
            Value::Array(items) => Value::from(
                items
                    .borrow()
                    .iter()
                    .map(|v| v.deep_copy_at(level + 1))
                    .collect::<Vec<_>>(),
            ),
            Value::Object(map) => Value::from(
                map.borrow()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.deep_copy_at(level + 1)))
                    .collect::<ObjectMap>(),
            ),
            other => other.clone(),
        }
    }

    /// Convert a JSON document. Strings are input text when `mark_input`
    /// is set or when wrapped as `{"__input__": "..."}`.
    pub fn from_json(json: &serde_json::Value, mark_input: bool) -> Value {
        use serde_json::Value as Json;
        match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(*b),
            Json::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => n.as_f64().map_or(Value::Null, Value::Float),
            },
            Json::String(s) => Value::String(JinjaString::new(s.as_str(), mark_input)),
            Json::Array(items) => Value::from(
                items
                    .iter()
                    .map(|item| Value::from_json(item, mark_input))
                    .collect::<Vec<_>>(),
            ),
            Json::Object(map) => {
                if map.len() == 1 {
                    if let Some(Json::String(s)) = map.get(INPUT_MARKER) {
                        return Value::String(JinjaString::input(s.as_str()));
                    }
                }
                Value::from(
                    map.iter()
                        .map(|(k, v)| (k.clone(), Value::from_json(v, mark_input)))
                        .collect::<ObjectMap>(),
                )
            }
        }
    }

    /// Rendered form used by `{{ }}` output, keeping string parts.
    pub fn to_jinja_string(&self) -> JinjaString {
        let mut out = JinjaString::default();
        match self {
            Value::Undefined => {}
            Value::String(s) => out.append(s),
            Value::Array(_) | Value::Object(_) => self.repr_into(&mut out, 0),
            other => out.push_str(&other.scalar_text(), false),
        }
        out
    }

    /// Python `repr`.
    pub fn repr(&self) -> String {
        let mut out = JinjaString::default();
        self.repr_into(&mut out, 0);
        out.to_string()
    }

    fn scalar_text(&self) -> String {
        match self {
            Value::Undefined => String::new(),
            Value::Null => "None".to_string(),
            Value::Bool(true) => "True".to_string(),
            Value::Bool(false) => "False".to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => float_repr(*f),
            Value::String(s) => s.to_string(),
            Value::Function(func) => format!("<function {}>", func.name()),
            Value::Array(_) | Value::Object(_) => self.repr(),
        }
    }

    fn repr_into(&self, out: &mut JinjaString, level: usize) {
        if level > MAX_NESTING {
            out.push_str("...", false);
            return;
        }
        match self {
            Value::Undefined => out.push_str("None", false),
            Value::String(s) => repr_string_into(s, out),
            Value::Array(items) => {
                out.push_str("[", false);
                for (i, item) in items.borrow().iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ", false);
                    }
                    item.repr_into(out, level + 1);
                }
                out.push_str("]", false);
            }
            Value::Object(map) => {
                out.push_str("{", false);
                for (i, (k, v)) in map.borrow().iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ", false);
                    }
                    repr_string_into(&JinjaString::template(k.as_str()), out);
                    out.push_str(": ", false);
                    v.repr_into(out, level + 1);
                }
                out.push_str("}", false);
            }
            other => out.push_str(&other.scalar_text(), false),
        }
    }

    /// Serialize like Python's `json.dumps`.
    pub fn to_json(&self, format: &JsonFormat) -> Result<String> {
        let mut out = String::new();
        self.write_json(&mut out, format, 0)?;
        Ok(out)
    }

    fn write_json(&self, out: &mut String, format: &JsonFormat, level: usize) -> Result<()> {
        if level > MAX_NESTING {
            return Err(Error::runtime("value nested too deeply to serialize"));
        }
        match self {
            Value::Undefined | Value::Null => out.push_str("null"),
            Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
            Value::Int(i) => out.push_str(&i.to_string()),
            Value::Float(f) => out.push_str(&json_float(*f)),
            Value::String(s) => write_json_string(out, &s.to_string(), format.ensure_ascii),
            Value::Array(items) => {
                let items = items.borrow();
                if items.is_empty() {
                    out.push_str("[]");
                    return Ok(());
                }
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push_str(&format.item_separator);
                    }
                    format.newline(out, level + 1);
                    item.write_json(out, format, level + 1)?;
                }
                format.newline(out, level);
                out.push(']');
            }
            Value::Object(map) => {
                let map = map.borrow();
                if map.is_empty() {
                    out.push_str("{}");
                    return Ok(());
                }
                let mut entries: Vec<_> = map.iter().collect();
                if format.sort_keys {
                    entries.sort_by(|a, b| a.0.cmp(b.0));
                }
                out.push('{');
                for (i, (k, v)) in entries.into_iter().enumerate() {
                    if i > 0 {
                        out.push_str(&format.item_separator);
                    }
                    format.newline(out, level + 1);
                    write_json_string(out, k, format.ensure_ascii);
                    out.push_str(&format.key_separator);
                    v.write_json(out, format, level + 1)?;
                }
                format.newline(out, level);
                out.push('}');
            }
            Value::Function(func) => {
                return Err(Error::runtime(format!(
                    "function `{}` is not JSON serializable",
                    func.name()
                )))
            }
        }
        Ok(())
    }

    /// Conjunction of the provenance of every string inside this value, or
    /// `None` when it holds no strings.
    pub(crate) fn input_flag(&self) -> Option<bool> {
        match self {
            Value::String(s) => Some(s.is_input()),
            Value::Array(items) => items
                .borrow()
                .iter()
                .filter_map(Value::input_flag)
                .reduce(|a, b| a && b),
            Value::Object(map) => map
                .borrow()
                .values()
                .filter_map(Value::input_flag)
                .reduce(|a, b| a && b),
            _ => None,
        }
    }

    pub fn compare(&self, other: &Value) -> Result<Ordering> {
        let ordering = match (self, other) {
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
                let (a, b) = (self.as_f64().unwrap_or_default(), other.as_f64().unwrap_or_default());
                a.partial_cmp(&b)
            }
            (Value::String(a), Value::String(b)) => Some(a.chars().cmp(b.chars())),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Array(a), Value::Array(b)) => {
                let (a, b) = (a.borrow(), b.borrow());
                for (x, y) in a.iter().zip(b.iter()) {
                    match x.compare(y)? {
                        Ordering::Equal => continue,
                        unequal => return Ok(unequal),
                    }
                }
                Some(a.len().cmp(&b.len()))
            }
            _ => None,
        };
        ordering.ok_or_else(|| {
            Error::runtime(format!(
                "cannot compare {} with {}",
                self.type_name(),
                other.type_name()
            ))
        })
    }

    /// `needle in self`
    pub fn contains(&self, needle: &Value) -> Result<bool> {
        match (self, needle) {
            (Value::String(haystack), Value::String(needle)) => {
                Ok(haystack.to_string().contains(&needle.to_string()))
            }
            (Value::Array(items), _) => Ok(items.borrow().iter().any(|item| item == needle)),
            (Value::Object(map), Value::String(key)) => Ok(map.borrow().contains_key(&key.to_string())),
            (Value::Object(_), _) | (Value::Undefined | Value::Null, _) => Ok(false),
            _ => Err(Error::runtime(format!(
                "`in` is not supported between {} and {}",
                needle.type_name(),
                self.type_name()
            ))),
        }
    }
}

/// Layout options for [`Value::to_json`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonFormat {
    pub indent: Option<String>,
    pub item_separator: String,
    pub key_separator: String,
    pub sort_keys: bool,
    pub ensure_ascii: bool,
}

impl Default for JsonFormat {
    fn default() -> Self {
        Self {
            indent: None,
            item_separator: ", ".to_string(),
            key_separator: ": ".to_string(),
            sort_keys: false,
            ensure_ascii: false,
        }
    }
}

impl JsonFormat {
    pub fn indented(indent: impl Into<String>) -> Self {
        Self {
            indent: Some(indent.into()),
            item_separator: ",".to_string(),
            ..Self::default()
        }
    }

    fn newline(&self, out: &mut String, level: usize) {
        if let Some(indent) = &self.indent {
            out.push('\n');
            for _ in 0..level {
                out.push_str(indent);
            }
        }
    }
}

/// Python float `repr`.
pub fn float_repr(f: f64) -> String {
    if f.is_nan() {
        return "nan".to_string();
    }
    if f.is_infinite() {
        return if f > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    let abs = f.abs();
    if abs != 0.0 && !(1e-4..1e16).contains(&abs) {
        let formatted = format!("{f:e}");
        return match formatted.split_once('e') {
            Some((mantissa, exp)) => {
                let (sign, digits) = match exp.strip_prefix('-') {
                    Some(digits) => ("-", digits),
                    None => ("+", exp),
                };
                format!("{mantissa}e{sign}{digits:0>2}")
            }
            None => formatted,
        };
    }
    if f.fract() == 0.0 {
        format!("{f:.1}")
    } else {
        format!("{f}")
    }
}

fn json_float(f: f64) -> String {
    if f.is_nan() {
        "NaN".to_string()
    } else if f.is_infinite() {
        if f > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else {
        float_repr(f)
    }
}

pub(crate) fn write_json_string(out: &mut String, s: &str, ensure_ascii: bool) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0c}' => out.push_str("\\f"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
            c if ensure_ascii && !c.is_ascii() => {
                let mut buf = [0u16; 2];
                for unit in c.encode_utf16(&mut buf) {
                    out.push_str(&format!("\\u{unit:04x}"));
                }
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

fn repr_string_into(s: &JinjaString, out: &mut JinjaString) {
    let text = s.to_string();
    let quote = if text.contains('\'') && !text.contains('"') {
        '"'
    } else {
        '\''
    };
    out.push_str(&quote.to_string(), false);
    for part in s.parts() {
        let mut escaped = String::with_capacity(part.text.len());
        for c in part.text.chars() {
            match c {
                '\\' => escaped.push_str("\\\\"),
                '\n' => escaped.push_str("\\n"),
                '\r' => escaped.push_str("\\r"),
                '\t' => escaped.push_str("\\t"),
                c if c == quote => {
                    escaped.push('\\');
                    escaped.push(c);
                }
                c if (c as u32) < 0x20 => escaped.push_str(&format!("\\x{:02x}", c as u32)),
                c => escaped.push(c),
            }
        }
        out.push_str(&escaped, part.is_input);
    }
    out.push_str(&quote.to_string(), false);
}
