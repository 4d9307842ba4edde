//! Builtin methods, filters, globals and tests.
//!
//! `value.name(args)` and `value | name(args)` resolve the same way: the
//! receiver's type table first, then the global table. The receiver is
//! always `positional[0]`; globals see their first argument there instead.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::rc::Rc;

use chrono::format::{Item, StrftimeItems};
use chrono::NaiveDateTime;
use tracing::trace;

use crate::error::{Error, Result};
use crate::string::{JinjaString, StringPart};
use crate::value::{Function, JsonFormat, ObjectMap, Value};

pub type BuiltinFn = fn(&Args) -> Result<Value>;
type TestFn = fn(&Args) -> Result<bool>;
type Table = &'static [(&'static str, BuiltinFn)];

/// Arguments of one builtin invocation.
#[derive(Debug, Clone, Default)]
pub struct Args {
    pub positional: Vec<Value>,
    pub keyword: Vec<(String, Value)>,
    /// Fixed clock for `strftime_now`; the local time is used when unset.
    pub now: Option<NaiveDateTime>,
}

fn type_error(what: &str, expected: &str, got: &Value) -> Error {
    Error::runtime(format!(
        "{what} must be {expected}, got {}",
        got.type_name()
    ))
}

impl Args {
    pub fn new(positional: Vec<Value>) -> Self {
        Self {
            positional,
            ..Self::default()
        }
    }

    pub fn with_keyword(mut self, name: impl Into<String>, value: Value) -> Self {
        self.keyword.push((name.into(), value));
        self
    }

    /// Positional argument `index`, else the keyword argument `name`.
    pub fn get(&self, index: usize, name: &str) -> Option<&Value> {
        self.positional
            .get(index)
            .or_else(|| self.keyword(name))
    }

    pub fn keyword(&self, name: &str) -> Option<&Value> {
        self.keyword
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v)
    }

    pub fn receiver(&self) -> Value {
        self.positional.first().cloned().unwrap_or_default()
    }

    fn check(&self, func: &str, max_positional: usize, keywords: &[&str]) -> Result<()> {
        if self.positional.len() > max_positional {
            return Err(Error::runtime(format!(
                "{func}: expected at most {max_positional} arguments, got {}",
                self.positional.len()
            )));
        }
        match self.keyword.iter().find(|(k, _)| !keywords.contains(&k.as_str())) {
            Some((k, _)) => Err(Error::runtime(format!(
                "{func}: unexpected keyword argument `{k}`"
            ))),
            None => Ok(()),
        }
    }

    fn receiver_str(&self, func: &str) -> Result<JinjaString> {
        match self.positional.first() {
            Some(Value::String(s)) => Ok(s.clone()),
            other => Err(type_error(
                &format!("{func} receiver"),
                "a string",
                other.unwrap_or(&Value::Undefined),
            )),
        }
    }

    fn receiver_items(&self, func: &str) -> Result<Vec<Value>> {
        let receiver = self.receiver();
        receiver
            .to_items()
            .ok_or_else(|| type_error(&format!("{func} receiver"), "an array", &receiver))
    }

    fn receiver_array(&self, func: &str) -> Result<Rc<RefCell<Vec<Value>>>> {
        match self.receiver() {
            Value::Array(items) => Ok(items),
            other => Err(type_error(&format!("{func} receiver"), "an array", &other)),
        }
    }

    fn receiver_object(&self, func: &str) -> Result<Rc<RefCell<ObjectMap>>> {
        match self.receiver() {
            Value::Object(map) => Ok(map),
            other => Err(type_error(&format!("{func} receiver"), "an object", &other)),
        }
    }

    fn opt_str(&self, index: usize, name: &str) -> Result<Option<JinjaString>> {
        match self.get(index, name) {
            None | Some(Value::Undefined | Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(other) => Err(type_error(&format!("argument `{name}`"), "a string", other)),
        }
    }

    fn req_str(&self, index: usize, name: &str) -> Result<JinjaString> {
        self.opt_str(index, name)?
            .ok_or_else(|| Error::runtime(format!("missing argument `{name}`")))
    }

    fn opt_int(&self, index: usize, name: &str) -> Result<Option<i64>> {
        match self.get(index, name) {
            None | Some(Value::Undefined | Value::Null) => Ok(None),
            Some(Value::Int(i)) => Ok(Some(*i)),
            Some(other) => Err(type_error(&format!("argument `{name}`"), "an integer", other)),
        }
    }

    fn flag(&self, index: usize, name: &str) -> bool {
        self.get(index, name).is_some_and(Value::is_truthy)
    }
}

/// Python slice semantics over a sequence of `len` items.
pub(crate) fn slice_indices(
    len: usize,
    start: Option<i64>,
    stop: Option<i64>,
    step: Option<i64>,
) -> Result<Vec<usize>> {
    let step = step.unwrap_or(1);
    if step == 0 {
        return Err(Error::runtime("slice step cannot be zero"));
    }
    let n = len as i64;
    let (lower, upper) = if step > 0 { (0, n) } else { (-1, n - 1) };
    let bound = |index: Option<i64>, default: i64| match index {
        None => default,
        Some(i) if i < 0 => i.saturating_add(n).max(lower),
        Some(i) => i.min(upper),
    };
    let start = bound(start, if step > 0 { lower } else { upper });
    let stop = bound(stop, if step > 0 { upper } else { lower });

    let mut indices = Vec::new();
    let mut i = start;
    while (step > 0 && i < stop) || (step < 0 && i > stop) {
        indices.push(i as usize);
        match i.checked_add(step) {
            Some(next) => i = next,
            None => break,
        }
    }
    Ok(indices)
}

pub(crate) fn slice_string(
    s: &JinjaString,
    start: Option<i64>,
    stop: Option<i64>,
    step: Option<i64>,
) -> Result<JinjaString> {
    let chars: Vec<char> = s.chars().collect();
    let indices = slice_indices(chars.len(), start, stop, step)?;
    Ok(s.derived(indices.into_iter().map(|i| chars[i]).collect::<String>()))
}

pub(crate) fn slice_items(
    items: &[Value],
    start: Option<i64>,
    stop: Option<i64>,
    step: Option<i64>,
) -> Result<Value> {
    let indices = slice_indices(items.len(), start, stop, step)?;
    Ok(Value::from(
        indices.into_iter().map(|i| items[i].clone()).collect::<Vec<_>>(),
    ))
}

/// `value.a.b` lookup for attribute-taking filters; missing keys are
/// undefined.
pub(crate) fn attribute(value: &Value, path: &str) -> Value {
    let mut current = value.clone();
    for key in path.split('.') {
        let next = match &current {
            Value::Object(map) => map.borrow().get(key).cloned().unwrap_or_default(),
            Value::Array(items) => key
                .parse::<usize>()
                .ok()
                .and_then(|i| items.borrow().get(i).cloned())
                .unwrap_or_default(),
            _ => Value::Undefined,
        };
        current = next;
    }
    current
}

fn find(table: Table, name: &str) -> Option<Function> {
    table
        .iter()
        .find(|(n, _)| *n == name)
        .map(|&(name, func)| Function::Builtin { name, func })
}

fn type_table(value: &Value) -> Table {
    match value {
        Value::String(_) => STRING_BUILTINS,
        Value::Array(_) => ARRAY_BUILTINS,
        Value::Object(_) => OBJECT_BUILTINS,
        Value::Int(_) | Value::Float(_) => NUMBER_BUILTINS,
        Value::Bool(_) => BOOL_BUILTINS,
        Value::Undefined | Value::Null => EMPTY_BUILTINS,
        Value::Function(_) => &[],
    }
}

/// Method or filter `name` for `receiver`: its type table, then globals.
pub fn lookup(receiver: &Value, name: &str) -> Option<Function> {
    find(type_table(receiver), name).or_else(|| global(name))
}

/// Global function `name`.
pub fn global(name: &str) -> Option<Function> {
    find(GLOBALS, name)
        .or_else(|| find(TEST_GLOBALS, name))
        .or_else(|| find(PLACEHOLDERS, name))
}

/// Apply the builtin `name` to `args.positional[0]`.
pub fn apply(name: &str, args: &Args) -> Result<Value> {
    let receiver = args.receiver();
    match lookup(&receiver, name) {
        Some(Function::Builtin { func, .. }) => {
            trace!(builtin = name, receiver = receiver.type_name(), "calling builtin");
            func(args)
        }
        _ => Err(Error::runtime(format!(
            "unknown filter or method `{name}` for {}",
            receiver.type_name()
        ))),
    }
}

/// Run test `name` on `args.positional[0]`.
pub fn run_test(name: &str, args: &Args) -> Result<bool> {
    let func = TESTS
        .iter()
        .find(|(n, _)| *n == name)
        .map(|&(_, func)| func)
        .ok_or_else(|| Error::runtime(format!("unknown test `{name}`")))?;
    func(args)
}

// ---- shared -----------------------------------------------------------

fn to_string_value(args: &Args) -> Result<Value> {
    args.check("string", 1, &[])?;
    Ok(Value::String(args.receiver().to_jinja_string()))
}

fn json_format(args: &Args) -> Result<JsonFormat> {
    let mut format = match args.get(1, "indent") {
        None | Some(Value::Undefined | Value::Null) => JsonFormat::default(),
        Some(Value::Int(n)) => JsonFormat::indented(" ".repeat((*n).max(0) as usize)),
        Some(Value::String(s)) => JsonFormat::indented(s.to_string()),
        Some(other) => return Err(type_error("argument `indent`", "an integer", other)),
    };
    match args.keyword("separators") {
        None | Some(Value::Undefined | Value::Null) => {}
        Some(seps) => match seps.to_items().as_deref() {
            Some([item, key]) => {
                format.item_separator = item.to_string();
                format.key_separator = key.to_string();
            }
            _ => {
                return Err(Error::runtime(
                    "argument `separators` must be a pair of strings",
                ))
            }
        },
    }
    format.sort_keys = args.keyword("sort_keys").is_some_and(Value::is_truthy);
    format.ensure_ascii = args.keyword("ensure_ascii").is_some_and(Value::is_truthy);
    Ok(format)
}

fn tojson(args: &Args) -> Result<Value> {
    args.check(
        "tojson",
        2,
        &["indent", "separators", "sort_keys", "ensure_ascii"],
    )?;
    let value = args.receiver();
    let text = value.to_json(&json_format(args)?)?;
    Ok(JinjaString::new(text, value.input_flag().unwrap_or(false)).into())
}

fn default_value(args: &Args) -> Result<Value> {
    args.check("default", 3, &["default_value", "boolean"])?;
    let value = args.receiver();
    let use_default = value.is_undefined() || (args.flag(2, "boolean") && !value.is_truthy());
    if !use_default {
        return Ok(value);
    }
    Ok(args
        .get(1, "default_value")
        .cloned()
        .unwrap_or_else(|| Value::from("")))
}

fn length(args: &Args) -> Result<Value> {
    args.check("length", 1, &[])?;
    let len = match args.receiver() {
        Value::String(s) => s.len(),
        Value::Array(items) => items.borrow().len(),
        Value::Object(map) => map.borrow().len(),
        Value::Undefined | Value::Null => 0,
        other => return Err(type_error("length receiver", "a sequence", &other)),
    };
    Ok(Value::Int(len as i64))
}

fn parse_int(text: &str) -> Option<i64> {
    let text = text.trim();
    text.parse::<i64>().ok().or_else(|| {
        text.parse::<f64>()
            .ok()
            .filter(|f| f.is_finite())
            .map(|f| f as i64)
    })
}

fn to_int(args: &Args) -> Result<Value> {
    args.check("int", 2, &["default"])?;
    let fallback = args.get(1, "default").and_then(Value::as_i64).unwrap_or(0);
    Ok(Value::Int(match args.receiver() {
        Value::Int(i) => i,
        Value::Float(f) if f.is_finite() => f as i64,
        Value::Bool(b) => b as i64,
        Value::String(s) => parse_int(&s.to_string()).unwrap_or(fallback),
        _ => fallback,
    }))
}

fn to_float(args: &Args) -> Result<Value> {
    args.check("float", 2, &["default"])?;
    let fallback = args.get(1, "default").and_then(Value::as_f64).unwrap_or(0.0);
    Ok(Value::Float(match args.receiver() {
        Value::Int(i) => i as f64,
        Value::Float(f) => f,
        Value::Bool(b) => f64::from(u8::from(b)),
        Value::String(s) => s.to_string().trim().parse::<f64>().unwrap_or(fallback),
        _ => fallback,
    }))
}

fn identity(args: &Args) -> Result<Value> {
    args.check("safe", 1, &[])?;
    Ok(args.receiver())
}

fn sort_key(value: Value, case_sensitive: bool) -> Value {
    match value {
        Value::String(s) if !case_sensitive => Value::from(s.lower()),
        other => other,
    }
}

fn sort_keyed(keyed: &mut [(Value, Value)], reverse: bool) -> Result<()> {
    let mut failure = None;
    keyed.sort_by(|a, b| match a.0.compare(&b.0) {
        Ok(ordering) if reverse => ordering.reverse(),
        Ok(ordering) => ordering,
        Err(err) => {
            failure.get_or_insert(err);
            Ordering::Equal
        }
    });
    match failure {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

// ---- strings ----------------------------------------------------------

fn string_upper(args: &Args) -> Result<Value> {
    args.check("upper", 1, &[])?;
    Ok(args.receiver_str("upper")?.upper().into())
}

fn string_lower(args: &Args) -> Result<Value> {
    args.check("lower", 1, &[])?;
    Ok(args.receiver_str("lower")?.lower().into())
}

fn string_title(args: &Args) -> Result<Value> {
    args.check("title", 1, &[])?;
    Ok(args.receiver_str("title")?.title().into())
}

fn string_capitalize(args: &Args) -> Result<Value> {
    args.check("capitalize", 1, &[])?;
    Ok(args.receiver_str("capitalize")?.capitalize().into())
}

fn strip_with(args: &Args, func: &str, left: bool, right: bool) -> Result<Value> {
    args.check(func, 2, &["chars"])?;
    let s = args.receiver_str(func)?;
    let stripped = match args.opt_str(1, "chars")? {
        Some(chars) => {
            let set: Vec<char> = chars.chars().collect();
            s.strip_by(left, right, |c| set.contains(&c))
        }
        None => s.strip(left, right),
    };
    Ok(stripped.into())
}

fn string_strip(args: &Args) -> Result<Value> {
    strip_with(args, "strip", true, true)
}

fn string_lstrip(args: &Args) -> Result<Value> {
    strip_with(args, "lstrip", true, false)
}

fn string_rstrip(args: &Args) -> Result<Value> {
    strip_with(args, "rstrip", false, true)
}

fn affix_matches(args: &Args, func: &str, test: fn(&str, &str) -> bool) -> Result<Value> {
    args.check(func, 2, &[])?;
    let s = args.receiver_str(func)?.to_string();
    let candidates = match args.positional.get(1) {
        Some(Value::String(affix)) => vec![affix.to_string()],
        Some(Value::Array(items)) => items.borrow().iter().map(Value::to_string).collect(),
        other => {
            return Err(type_error(
                &format!("{func} argument"),
                "a string or array of strings",
                other.unwrap_or(&Value::Undefined),
            ))
        }
    };
    Ok(Value::Bool(candidates.iter().any(|c| test(&s, c))))
}

fn string_startswith(args: &Args) -> Result<Value> {
    affix_matches(args, "startswith", |s, p| s.starts_with(p))
}

fn string_endswith(args: &Args) -> Result<Value> {
    affix_matches(args, "endswith", |s, p| s.ends_with(p))
}

fn split_on(flat: &str, sep: &str, maxsplit: Option<usize>, from_right: bool) -> Vec<(usize, usize)> {
    let limit = maxsplit.unwrap_or(usize::MAX);
    let cuts: Vec<usize> = if from_right {
        let mut cuts: Vec<usize> = flat.rmatch_indices(sep).map(|(i, _)| i).take(limit).collect();
        cuts.reverse();
        cuts
    } else {
        flat.match_indices(sep).map(|(i, _)| i).take(limit).collect()
    };
    let mut spans = Vec::with_capacity(cuts.len() + 1);
    let mut start = 0;
    for cut in cuts {
        spans.push((start, cut));
        start = cut + sep.len();
    }
    spans.push((start, flat.len()));
    spans
}

fn split_whitespace(flat: &str, maxsplit: Option<usize>, from_right: bool) -> Vec<(usize, usize)> {
    let mut words = Vec::new();
    let mut start = None;
    for (i, c) in flat.char_indices() {
        if c.is_whitespace() {
            if let Some(s) = start.take() {
                words.push((s, i));
            }
        } else if start.is_none() {
            start = Some(i);
        }
    }
    if let Some(s) = start {
        words.push((s, flat.len()));
    }
    let Some(limit) = maxsplit else {
        return words;
    };
    if words.len() <= limit + 1 {
        return words;
    }
    if from_right {
        let tail = words.split_off(words.len() - limit);
        let head_end = words.last().map_or(0, |w| w.1);
        let mut spans = vec![(0, head_end)];
        spans.extend(tail);
        spans
    } else {
        let rest_start = words[limit].0;
        words.truncate(limit);
        words.push((rest_start, flat.len()));
        words
    }
}

fn split_impl(args: &Args, func: &str, from_right: bool) -> Result<Value> {
    args.check(func, 3, &["sep", "maxsplit"])?;
    let s = args.receiver_str(func)?;
    let flat = s.to_string();
    let maxsplit = args
        .opt_int(2, "maxsplit")?
        .filter(|n| *n >= 0)
        .map(|n| n as usize);
    let spans = match args.opt_str(1, "sep")? {
        Some(sep) => {
            let sep = sep.to_string();
            if sep.is_empty() {
                return Err(Error::runtime(format!("{func}: empty separator")));
            }
            split_on(&flat, &sep, maxsplit, from_right)
        }
        None => split_whitespace(&flat, maxsplit, from_right),
    };
    Ok(Value::from(
        spans
            .into_iter()
            .map(|(start, end)| Value::from(s.fragment(&flat, start, end)))
            .collect::<Vec<_>>(),
    ))
}

fn string_split(args: &Args) -> Result<Value> {
    split_impl(args, "split", false)
}

fn string_rsplit(args: &Args) -> Result<Value> {
    split_impl(args, "rsplit", true)
}

fn string_replace(args: &Args) -> Result<Value> {
    args.check("replace", 4, &["old", "new", "count"])?;
    let s = args.receiver_str("replace")?;
    let old = args.req_str(1, "old")?.to_string();
    let new = args.req_str(2, "new")?;
    let flat = s.to_string();
    let text = match args.opt_int(3, "count")? {
        Some(count) if count >= 0 => flat.replacen(&old, &new.to_string(), count as usize),
        _ => flat.replace(&old, &new.to_string()),
    };
    let replaced = text != flat;
    let is_input = s.is_input() && (!replaced || new.is_empty() || new.is_input());
    Ok(JinjaString::new(text, is_input).into())
}

fn string_slice(args: &Args) -> Result<Value> {
    args.check("slice", 4, &["start", "stop", "step"])?;
    let s = args.receiver_str("slice")?;
    Ok(slice_string(
        &s,
        args.opt_int(1, "start")?,
        args.opt_int(2, "stop")?,
        args.opt_int(3, "step")?,
    )?
    .into())
}

fn string_indent(args: &Args) -> Result<Value> {
    args.check("indent", 4, &["width", "first", "blank"])?;
    let s = args.receiver_str("indent")?;
    let pad = match args.get(1, "width") {
        None | Some(Value::Undefined | Value::Null) => " ".repeat(4),
        Some(Value::Int(n)) => " ".repeat((*n).max(0) as usize),
        Some(Value::String(p)) => p.to_string(),
        Some(other) => return Err(type_error("argument `width`", "an integer", other)),
    };
    let first = args.flag(2, "first");
    let blank = args.flag(3, "blank");

    let mut out = String::new();
    for (i, line) in s.to_string().split('\n').enumerate() {
        if i > 0 {
            out.push('\n');
        }
        if (i > 0 || first) && (blank || !line.trim().is_empty()) {
            out.push_str(&pad);
        }
        out.push_str(line);
    }
    Ok(s.derived(out).into())
}

fn string_reverse(args: &Args) -> Result<Value> {
    args.check("reverse", 1, &[])?;
    let s = args.receiver_str("reverse")?;
    let parts = s
        .parts()
        .iter()
        .rev()
        .map(|p| StringPart::new(p.text.chars().rev().collect::<String>(), p.is_input))
        .collect();
    Ok(JinjaString::from_parts(parts).into())
}

fn string_list(args: &Args) -> Result<Value> {
    args.check("list", 1, &[])?;
    let s = args.receiver_str("list")?;
    let flat = s.to_string();
    Ok(Value::from(
        flat.char_indices()
            .map(|(i, c)| Value::from(s.fragment(&flat, i, i + c.len_utf8())))
            .collect::<Vec<_>>(),
    ))
}

static STRING_BUILTINS: Table = &[
    ("upper", string_upper),
    ("lower", string_lower),
    ("strip", string_strip),
    ("trim", string_strip),
    ("lstrip", string_lstrip),
    ("rstrip", string_rstrip),
    ("title", string_title),
    ("capitalize", string_capitalize),
    ("length", length),
    ("count", length),
    ("startswith", string_startswith),
    ("endswith", string_endswith),
    ("split", string_split),
    ("rsplit", string_rsplit),
    ("replace", string_replace),
    ("int", to_int),
    ("float", to_float),
    ("string", to_string_value),
    ("default", default_value),
    ("safe", identity),
    ("slice", string_slice),
    ("tojson", tojson),
    ("indent", string_indent),
    ("reverse", string_reverse),
    ("list", string_list),
];

// ---- arrays -----------------------------------------------------------

fn array_list(args: &Args) -> Result<Value> {
    args.check("list", 1, &[])?;
    Ok(Value::from(args.receiver_items("list")?))
}

fn array_first(args: &Args) -> Result<Value> {
    args.check("first", 1, &[])?;
    Ok(args
        .receiver_items("first")?
        .into_iter()
        .next()
        .unwrap_or_default())
}

fn array_last(args: &Args) -> Result<Value> {
    args.check("last", 1, &[])?;
    Ok(args.receiver_items("last")?.pop().unwrap_or_default())
}

fn array_slice(args: &Args) -> Result<Value> {
    args.check("slice", 4, &["start", "stop", "step"])?;
    let items = args.receiver_items("slice")?;
    slice_items(
        &items,
        args.opt_int(1, "start")?,
        args.opt_int(2, "stop")?,
        args.opt_int(3, "step")?,
    )
}

fn test_name(value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.to_string()),
        other => Err(type_error("test name", "a string", other)),
    }
}

/// Run the test named by `test[0]` (with `test[1..]` as arguments) on
/// `subject`, or plain truthiness when `test` is empty.
fn passes(subject: Value, test: &[Value]) -> Result<bool> {
    match test.split_first() {
        None => Ok(subject.is_truthy()),
        Some((name, rest)) => {
            let mut positional = vec![subject];
            positional.extend(rest.iter().cloned());
            run_test(&test_name(name)?, &Args::new(positional))
        }
    }
}

fn select_impl(args: &Args, func: &str, keep: bool) -> Result<Value> {
    let test = args.positional.get(1..).unwrap_or_default();
    let mut out = Vec::new();
    for item in args.receiver_items(func)? {
        if passes(item.clone(), test)? == keep {
            out.push(item);
        }
    }
    Ok(Value::from(out))
}

fn select_attr_impl(args: &Args, func: &str, keep: bool) -> Result<Value> {
    let attr = args.req_str(1, "attribute")?.to_string();
    let test = args.positional.get(2..).unwrap_or_default();
    let mut out = Vec::new();
    for item in args.receiver_items(func)? {
        if passes(attribute(&item, &attr), test)? == keep {
            out.push(item);
        }
    }
    Ok(Value::from(out))
}

fn array_select(args: &Args) -> Result<Value> {
    select_impl(args, "select", true)
}

fn array_reject(args: &Args) -> Result<Value> {
    select_impl(args, "reject", false)
}

fn array_selectattr(args: &Args) -> Result<Value> {
    select_attr_impl(args, "selectattr", true)
}

fn array_rejectattr(args: &Args) -> Result<Value> {
    select_attr_impl(args, "rejectattr", false)
}

fn array_join(args: &Args) -> Result<Value> {
    args.check("join", 3, &["d", "attribute"])?;
    let items = args.receiver_items("join")?;
    let sep = args.opt_str(1, "d")?.unwrap_or_default();
    let attr = args.opt_str(2, "attribute")?.map(|a| a.to_string());
    if items.is_empty() {
        return Ok(Value::from(""));
    }
    let mut out = JinjaString::default();
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.append(&sep);
        }
        let item = match &attr {
            Some(attr) => attribute(item, attr),
            None => item.clone(),
        };
        out.append(&item.to_jinja_string());
    }
    Ok(out.into())
}

fn array_map(args: &Args) -> Result<Value> {
    let items = args.receiver_items("map")?;
    if let Some(attr) = args.keyword("attribute") {
        let attr = attr.to_string();
        let fallback = args.keyword("default").cloned().unwrap_or_default();
        return Ok(Value::from(
            items
                .iter()
                .map(|item| match attribute(item, &attr) {
                    Value::Undefined => fallback.clone(),
                    value => value,
                })
                .collect::<Vec<_>>(),
        ));
    }
    let filter = args.req_str(1, "filter")?.to_string();
    let extra = args.positional.get(2..).unwrap_or_default();
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let mut call = Args::new(vec![item]);
        call.positional.extend(extra.iter().cloned());
        call.keyword = args.keyword.clone();
        call.now = args.now;
        out.push(apply(&filter, &call)?);
    }
    Ok(Value::from(out))
}

fn array_append(args: &Args) -> Result<Value> {
    args.check("append", 2, &[])?;
    let array = args.receiver_array("append")?;
    let item = args.get(1, "item").cloned().unwrap_or_default();
    array.borrow_mut().push(item);
    Ok(Value::Undefined)
}

fn array_pop(args: &Args) -> Result<Value> {
    args.check("pop", 2, &["index"])?;
    let array = args.receiver_array("pop")?;
    let index = args.opt_int(1, "index")?.unwrap_or(-1);
    let mut items = array.borrow_mut();
    let len = items.len() as i64;
    let index = if index < 0 { index + len } else { index };
    if !(0..len).contains(&index) {
        return Err(Error::runtime("pop index out of range"));
    }
    Ok(items.remove(index as usize))
}

fn array_sort(args: &Args) -> Result<Value> {
    args.check("sort", 4, &["reverse", "case_sensitive", "attribute"])?;
    let items = args.receiver_items("sort")?;
    let reverse = args.flag(1, "reverse");
    let case_sensitive = args.flag(2, "case_sensitive");
    let attr = args.opt_str(3, "attribute")?.map(|a| a.to_string());
    let mut keyed: Vec<(Value, Value)> = items
        .into_iter()
        .map(|item| {
            let key = match &attr {
                Some(attr) => attribute(&item, attr),
                None => item.clone(),
            };
            (sort_key(key, case_sensitive), item)
        })
        .collect();
    sort_keyed(&mut keyed, reverse)?;
    Ok(Value::from(
        keyed.into_iter().map(|(_, item)| item).collect::<Vec<_>>(),
    ))
}

fn array_reverse(args: &Args) -> Result<Value> {
    args.check("reverse", 1, &[])?;
    let mut items = args.receiver_items("reverse")?;
    items.reverse();
    Ok(Value::from(items))
}

fn array_unique(args: &Args) -> Result<Value> {
    args.check("unique", 1, &[])?;
    let mut out: Vec<Value> = Vec::new();
    for item in args.receiver_items("unique")? {
        if !out.contains(&item) {
            out.push(item);
        }
    }
    Ok(Value::from(out))
}

static ARRAY_BUILTINS: Table = &[
    ("list", array_list),
    ("first", array_first),
    ("last", array_last),
    ("length", length),
    ("count", length),
    ("slice", array_slice),
    ("select", array_select),
    ("selectattr", array_selectattr),
    ("reject", array_reject),
    ("rejectattr", array_rejectattr),
    ("join", array_join),
    ("map", array_map),
    ("append", array_append),
    ("pop", array_pop),
    ("sort", array_sort),
    ("reverse", array_reverse),
    ("unique", array_unique),
    ("string", to_string_value),
    ("tojson", tojson),
];

// ---- objects ----------------------------------------------------------

fn object_get(args: &Args) -> Result<Value> {
    args.check("get", 3, &["key", "default"])?;
    let map = args.receiver_object("get")?;
    let key = args.req_str(1, "key")?.to_string();
    let found = map.borrow().get(&key).cloned();
    Ok(found.unwrap_or_else(|| args.get(2, "default").cloned().unwrap_or(Value::Null)))
}

fn object_keys(args: &Args) -> Result<Value> {
    args.check("keys", 1, &[])?;
    let map = args.receiver_object("keys")?;
    let keys: Vec<Value> = map.borrow().keys().map(|k| Value::from(k.as_str())).collect();
    Ok(Value::from(keys))
}

fn object_values(args: &Args) -> Result<Value> {
    args.check("values", 1, &[])?;
    let map = args.receiver_object("values")?;
    let values: Vec<Value> = map.borrow().values().cloned().collect();
    Ok(Value::from(values))
}

fn pair(key: &str, value: Value) -> Value {
    Value::from(vec![Value::from(key), value])
}

fn object_items(args: &Args) -> Result<Value> {
    args.check("items", 1, &[])?;
    let map = args.receiver_object("items")?;
    let items: Vec<Value> = map.borrow().iter().map(|(k, v)| pair(k, v.clone())).collect();
    Ok(Value::from(items))
}

fn object_dictsort(args: &Args) -> Result<Value> {
    args.check("dictsort", 4, &["case_sensitive", "by", "reverse"])?;
    let map = args.receiver_object("dictsort")?;
    let case_sensitive = args.flag(1, "case_sensitive");
    let by_value = match args.opt_str(2, "by")?.map(|b| b.to_string()).as_deref() {
        None | Some("key") => false,
        Some("value") => true,
        Some(other) => {
            return Err(Error::runtime(format!(
                "dictsort: `by` must be 'key' or 'value', got '{other}'"
            )))
        }
    };
    let reverse = args.flag(3, "reverse");
    let entries: Vec<(String, Value)> = map
        .borrow()
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let mut keyed: Vec<(Value, Value)> = entries
        .into_iter()
        .map(|(k, v)| {
            let key = if by_value {
                v.clone()
            } else {
                Value::from(k.as_str())
            };
            (sort_key(key, case_sensitive), pair(&k, v))
        })
        .collect();
    sort_keyed(&mut keyed, reverse)?;
    Ok(Value::from(
        keyed.into_iter().map(|(_, pair)| pair).collect::<Vec<_>>(),
    ))
}

static OBJECT_BUILTINS: Table = &[
    ("get", object_get),
    ("keys", object_keys),
    ("values", object_values),
    ("items", object_items),
    ("length", length),
    ("count", length),
    ("dictsort", object_dictsort),
    ("string", to_string_value),
    ("tojson", tojson),
];

// ---- numbers and booleans ---------------------------------------------

fn number_abs(args: &Args) -> Result<Value> {
    args.check("abs", 1, &[])?;
    match args.receiver() {
        Value::Int(i) => i
            .checked_abs()
            .map(Value::Int)
            .ok_or_else(|| Error::runtime("integer overflow in abs")),
        Value::Float(f) => Ok(Value::Float(f.abs())),
        other => Err(type_error("abs receiver", "a number", &other)),
    }
}

fn number_round(args: &Args) -> Result<Value> {
    args.check("round", 3, &["precision", "method"])?;
    let receiver = args.receiver();
    let x = receiver
        .as_f64()
        .ok_or_else(|| type_error("round receiver", "a number", &receiver))?;
    let precision = args.opt_int(1, "precision")?.unwrap_or(0);
    let factor = 10f64.powi(precision.clamp(-308, 308) as i32);
    let scaled = x * factor;
    let rounded = match args.opt_str(2, "method")?.map(|m| m.to_string()).as_deref() {
        None | Some("common") => scaled.round_ties_even(),
        Some("ceil") => scaled.ceil(),
        Some("floor") => scaled.floor(),
        Some(other) => {
            return Err(Error::runtime(format!(
                "round: method must be 'common', 'ceil' or 'floor', got '{other}'"
            )))
        }
    };
    Ok(Value::Float(rounded / factor))
}

static NUMBER_BUILTINS: Table = &[
    ("abs", number_abs),
    ("int", to_int),
    ("float", to_float),
    ("round", number_round),
    ("string", to_string_value),
    ("tojson", tojson),
];

static BOOL_BUILTINS: Table = &[
    ("int", to_int),
    ("float", to_float),
    ("string", to_string_value),
    ("tojson", tojson),
];

static EMPTY_BUILTINS: Table = &[
    ("length", length),
    ("count", length),
    ("string", to_string_value),
];

// ---- globals ----------------------------------------------------------

fn range(args: &Args) -> Result<Value> {
    args.check("range", 3, &[])?;
    let bounds = args
        .positional
        .iter()
        .map(|v| v.as_i64().ok_or_else(|| type_error("range argument", "an integer", v)))
        .collect::<Result<Vec<i64>>>()?;
    let (start, stop, step) = match bounds.as_slice() {
        [stop] => (0, *stop, 1),
        [start, stop] => (*start, *stop, 1),
        [start, stop, step] => (*start, *stop, *step),
        _ => return Err(Error::runtime("range: expected 1 to 3 arguments")),
    };
    if step == 0 {
        return Err(Error::runtime("range: step cannot be zero"));
    }
    let mut out = Vec::new();
    let mut i = start;
    while (step > 0 && i < stop) || (step < 0 && i > stop) {
        out.push(Value::Int(i));
        match i.checked_add(step) {
            Some(next) => i = next,
            None => break,
        }
    }
    Ok(Value::from(out))
}

fn namespace(args: &Args) -> Result<Value> {
    let mut map = ObjectMap::new();
    if let Some(Value::Object(init)) = args.positional.first() {
        for (k, v) in init.borrow().iter() {
            map.insert(k.clone(), v.clone());
        }
    }
    for (k, v) in &args.keyword {
        map.insert(k.clone(), v.clone());
    }
    Ok(Value::from(map))
}

fn raise_exception(args: &Args) -> Result<Value> {
    Err(Error::Raised(args.receiver().to_string()))
}

fn strftime_now(args: &Args) -> Result<Value> {
    args.check("strftime_now", 1, &["format"])?;
    let format = args.req_str(0, "format")?.to_string();
    let items: Vec<Item<'_>> = StrftimeItems::new(&format).collect();
    if items.iter().any(|item| matches!(item, Item::Error)) {
        return Err(Error::runtime(format!(
            "strftime_now: invalid format `{format}`"
        )));
    }
    let now = args
        .now
        .unwrap_or_else(|| chrono::Local::now().naive_local());
    Ok(Value::from(now.format_with_items(items.into_iter()).to_string()))
}

static GLOBALS: Table = &[
    ("range", range),
    ("namespace", namespace),
    ("raise_exception", raise_exception),
    ("strftime_now", strftime_now),
    ("tojson", tojson),
    ("default", default_value),
    ("d", default_value),
];

macro_rules! not_implemented {
    ($($func:ident => $name:literal),* $(,)?) => {
        $(
            fn $func(_: &Args) -> Result<Value> {
                Err(Error::NotImplemented(format!("filter `{}`", $name)))
            }
        )*
        static PLACEHOLDERS: Table = &[$(($name, $func as BuiltinFn)),*];
    };
}

not_implemented! {
    format_filter => "format",
    truncate_filter => "truncate",
    wordwrap_filter => "wordwrap",
    urlencode_filter => "urlencode",
    xmlattr_filter => "xmlattr",
}

// ---- tests ------------------------------------------------------------

fn test_operand(args: &Args) -> Result<Value> {
    args.positional
        .get(1)
        .cloned()
        .ok_or_else(|| Error::runtime("test requires an argument"))
}

fn int_subject(args: &Args, test: &str) -> Result<i64> {
    let subject = args.receiver();
    subject
        .as_i64()
        .ok_or_else(|| type_error(&format!("`{test}` test subject"), "an integer", &subject))
}

fn test_boolean(args: &Args) -> Result<bool> {
    Ok(matches!(args.receiver(), Value::Bool(_)))
}

fn test_callable(args: &Args) -> Result<bool> {
    Ok(matches!(args.receiver(), Value::Function(_)))
}

fn test_odd(args: &Args) -> Result<bool> {
    Ok(int_subject(args, "odd")? % 2 != 0)
}

fn test_even(args: &Args) -> Result<bool> {
    Ok(int_subject(args, "even")? % 2 == 0)
}

fn test_false(args: &Args) -> Result<bool> {
    Ok(matches!(args.receiver(), Value::Bool(false)))
}

fn test_true(args: &Args) -> Result<bool> {
    Ok(matches!(args.receiver(), Value::Bool(true)))
}

fn test_string(args: &Args) -> Result<bool> {
    Ok(matches!(args.receiver(), Value::String(_)))
}

fn test_integer(args: &Args) -> Result<bool> {
    Ok(matches!(args.receiver(), Value::Int(_)))
}

fn test_float(args: &Args) -> Result<bool> {
    Ok(matches!(args.receiver(), Value::Float(_)))
}

fn test_number(args: &Args) -> Result<bool> {
    Ok(matches!(args.receiver(), Value::Int(_) | Value::Float(_)))
}

fn test_iterable(args: &Args) -> Result<bool> {
    Ok(matches!(
        args.receiver(),
        Value::String(_) | Value::Array(_) | Value::Object(_)
    ))
}

fn test_sequence(args: &Args) -> Result<bool> {
    Ok(matches!(args.receiver(), Value::String(_) | Value::Array(_)))
}

fn test_mapping(args: &Args) -> Result<bool> {
    Ok(matches!(args.receiver(), Value::Object(_)))
}

fn test_lower(args: &Args) -> Result<bool> {
    Ok(matches!(args.receiver(), Value::String(s) if s.is_lowercase()))
}

fn test_upper(args: &Args) -> Result<bool> {
    Ok(matches!(args.receiver(), Value::String(s) if s.is_uppercase()))
}

fn test_none(args: &Args) -> Result<bool> {
    Ok(args.receiver().is_none())
}

fn test_defined(args: &Args) -> Result<bool> {
    Ok(!args.receiver().is_undefined())
}

fn test_undefined(args: &Args) -> Result<bool> {
    Ok(args.receiver().is_undefined())
}

fn test_eq(args: &Args) -> Result<bool> {
    Ok(args.receiver() == test_operand(args)?)
}

fn test_ne(args: &Args) -> Result<bool> {
    Ok(args.receiver() != test_operand(args)?)
}

fn test_gt(args: &Args) -> Result<bool> {
    Ok(args.receiver().compare(&test_operand(args)?)? == Ordering::Greater)
}

fn test_ge(args: &Args) -> Result<bool> {
    Ok(args.receiver().compare(&test_operand(args)?)? != Ordering::Less)
}

fn test_lt(args: &Args) -> Result<bool> {
    Ok(args.receiver().compare(&test_operand(args)?)? == Ordering::Less)
}

fn test_le(args: &Args) -> Result<bool> {
    Ok(args.receiver().compare(&test_operand(args)?)? != Ordering::Greater)
}

fn test_in(args: &Args) -> Result<bool> {
    test_operand(args)?.contains(&args.receiver())
}

fn test_sameas(args: &Args) -> Result<bool> {
    let other = test_operand(args)?;
    Ok(match (args.receiver(), &other) {
        (Value::Array(a), Value::Array(b)) => Rc::ptr_eq(&a, b),
        (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(&a, b),
        (Value::Int(a), Value::Int(b)) => a == *b,
        (Value::Bool(a), Value::Bool(b)) => a == *b,
        (Value::Null, Value::Null) | (Value::Undefined, Value::Undefined) => true,
        _ => false,
    })
}

fn test_divisibleby(args: &Args) -> Result<bool> {
    let n = int_subject(args, "divisibleby")?;
    let divisor = test_operand(args)?;
    match divisor.as_i64() {
        Some(0) => Err(Error::runtime("divisibleby: division by zero")),
        Some(d) => Ok(n % d == 0),
        None => Err(type_error("divisibleby argument", "an integer", &divisor)),
    }
}

static TESTS: &[(&str, TestFn)] = &[
    ("boolean", test_boolean),
    ("callable", test_callable),
    ("odd", test_odd),
    ("even", test_even),
    ("false", test_false),
    ("true", test_true),
    ("string", test_string),
    ("integer", test_integer),
    ("float", test_float),
    ("number", test_number),
    ("iterable", test_iterable),
    ("sequence", test_sequence),
    ("mapping", test_mapping),
    ("lower", test_lower),
    ("upper", test_upper),
    ("none", test_none),
    ("defined", test_defined),
    ("undefined", test_undefined),
    ("equalto", test_eq),
    ("eq", test_eq),
    ("==", test_eq),
    ("ne", test_ne),
    ("!=", test_ne),
    ("gt", test_gt),
    (">", test_gt),
    ("greaterthan", test_gt),
    ("ge", test_ge),
    (">=", test_ge),
    ("lt", test_lt),
    ("<", test_lt),
    ("lessthan", test_lt),
    ("le", test_le),
    ("<=", test_le),
    ("in", test_in),
    ("sameas", test_sameas),
    ("divisibleby", test_divisibleby),
];

macro_rules! test_globals {
    ($($func:ident => $test:literal),* $(,)?) => {
        $(
            fn $func(args: &Args) -> Result<Value> {
                run_test($test, args).map(Value::Bool)
            }
        )*
        static TEST_GLOBALS: Table = &[$((concat!("is_", $test), $func as BuiltinFn)),*];
    };
}

test_globals! {
    is_boolean => "boolean",
    is_callable => "callable",
    is_odd => "odd",
    is_even => "even",
    is_false => "false",
    is_true => "true",
    is_string => "string",
    is_integer => "integer",
    is_float => "float",
    is_number => "number",
    is_iterable => "iterable",
    is_sequence => "sequence",
    is_mapping => "mapping",
    is_lower => "lower",
    is_upper => "upper",
    is_none => "none",
    is_defined => "defined",
    is_undefined => "undefined",
    is_equalto => "equalto",
}
