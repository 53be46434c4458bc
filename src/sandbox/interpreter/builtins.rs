//! Builtin functions and methods available to scripts

use super::ast::BinOp;
use super::eval::Machine;
use super::value::{Dict, Value, format_float, py_cmp, py_eq, range_len};
use super::{ScriptError, runtime};
use std::cmp::Ordering;

const BUILTINS: &[&str] = &[
    "abs", "all", "any", "bool", "dict", "enumerate", "float", "int", "len", "list", "max", "min",
    "print", "range", "reversed", "round", "sorted", "str", "sum", "tuple", "zip",
];

type Kwargs = Vec<(String, Value)>;

/// Resolve a global name to a builtin
pub fn lookup(name: &str) -> Option<&'static str> {
    if name == "_print" {
        return Some("print");
    }
    BUILTINS.iter().copied().find(|b| *b == name)
}

fn arity(name: &str, args: &[Value], min: usize, max: usize) -> Result<(), ScriptError> {
    if args.len() < min || args.len() > max {
        let expected = if min == max {
            format!("{}", min)
        } else {
            format!("{} to {}", min, max)
        };
        return Err(runtime(
            "TypeError",
            format!(
                "{}() takes {} argument(s) ({} given)",
                name,
                expected,
                args.len()
            ),
        ));
    }
    Ok(())
}

fn no_kwargs(name: &str, kwargs: &Kwargs) -> Result<(), ScriptError> {
    match kwargs.first() {
        Some((key, _)) => Err(runtime(
            "TypeError",
            format!("{}() got an unexpected keyword argument '{}'", name, key),
        )),
        None => Ok(()),
    }
}

fn take_kwarg(kwargs: &mut Kwargs, key: &str) -> Option<Value> {
    let pos = kwargs.iter().position(|(k, _)| k == key)?;
    Some(kwargs.remove(pos).1)
}

fn expect_int(value: &Value, what: &str) -> Result<i64, ScriptError> {
    value.as_int().ok_or_else(|| {
        runtime(
            "TypeError",
            format!("{} must be an integer, not {}", what, value.type_name()),
        )
    })
}

fn expect_str<'v>(value: &'v Value, what: &str) -> Result<&'v str, ScriptError> {
    match value {
        Value::Str(s) => Ok(s),
        other => Err(runtime(
            "TypeError",
            format!("{} must be str, not {}", what, other.type_name()),
        )),
    }
}

pub fn call(
    m: &mut Machine,
    name: &'static str,
    args: Vec<Value>,
    mut kwargs: Kwargs,
) -> Result<Value, ScriptError> {
    match name {
        "print" => {
            let sep = match take_kwarg(&mut kwargs, "sep") {
                Some(Value::None) | None => " ".to_string(),
                Some(v) => expect_str(&v, "sep")?.to_string(),
            };
            let end = match take_kwarg(&mut kwargs, "end") {
                Some(Value::None) | None => "\n".to_string(),
                Some(v) => expect_str(&v, "end")?.to_string(),
            };
            no_kwargs(name, &kwargs)?;
            let parts = args
                .iter()
                .map(Value::to_str)
                .collect::<Result<Vec<_>, _>>()?;
            let line = format!("{}{}", parts.join(&sep), end);
            m.write_stdout(&line)?;
            Ok(Value::None)
        }
        "sorted" => {
            let key = take_kwarg(&mut kwargs, "key");
            let reverse = take_kwarg(&mut kwargs, "reverse").is_some_and(|v| v.truthy());
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 1, 1)?;
            let mut items = m.iterate(&args[0])?;
            sort_values(m, &mut items, key, reverse)?;
            Ok(Value::list(items))
        }
        "min" | "max" => {
            let key = take_kwarg(&mut kwargs, "key");
            let default = take_kwarg(&mut kwargs, "default");
            no_kwargs(name, &kwargs)?;
            let items = if args.len() == 1 {
                m.iterate(&args[0])?
            } else {
                args
            };
            extreme(m, name, items, key, default)
        }
        _ => {
            no_kwargs(name, &kwargs)?;
            call_positional(m, name, &args)
        }
    }
}

fn call_positional(
    m: &mut Machine,
    name: &'static str,
    args: &[Value],
) -> Result<Value, ScriptError> {
    match name {
        "len" => {
            arity(name, args, 1, 1)?;
            let len = match &args[0] {
                Value::Str(s) => s.chars().count(),
                Value::List(items) => items.borrow().len(),
                Value::Tuple(items) => items.len(),
                Value::Dict(dict) => dict.borrow().len(),
                Value::Range { start, stop, step } => range_len(*start, *stop, *step),
                other => {
                    return Err(runtime(
                        "TypeError",
                        format!("object of type '{}' has no len()", other.type_name()),
                    ));
                }
            };
            Ok(Value::Int(len as i64))
        }
        "sum" => {
            arity(name, args, 1, 2)?;
            let mut total = args.get(1).cloned().unwrap_or(Value::Int(0));
            for item in m.iterate(&args[0])? {
                total = m.binary(&total, BinOp::Add, &item)?;
            }
            Ok(total)
        }
        "abs" => {
            arity(name, args, 1, 1)?;
            match &args[0] {
                Value::Float(f) => Ok(Value::Float(f.abs())),
                v => match v.as_int() {
                    Some(n) => n
                        .checked_abs()
                        .map(Value::Int)
                        .ok_or_else(|| runtime("OverflowError", "integer result out of range")),
                    None => Err(runtime(
                        "TypeError",
                        format!("bad operand type for abs(): '{}'", v.type_name()),
                    )),
                },
            }
        }
        "round" => {
            arity(name, args, 1, 2)?;
            let digits = match args.get(1) {
                None | Some(Value::None) => None,
                Some(v) => Some(expect_int(v, "ndigits")?),
            };
            round(&args[0], digits)
        }
        "str" => {
            arity(name, args, 0, 1)?;
            match args.first() {
                Some(v) => {
                    let text = v.to_str()?;
                    m.check_str(text.len())?;
                    Ok(Value::str(text))
                }
                None => Ok(Value::str("")),
            }
        }
        "int" => {
            arity(name, args, 0, 1)?;
            match args.first() {
                None => Ok(Value::Int(0)),
                Some(Value::Float(f)) => {
                    if !f.is_finite() || f.abs() >= 9.2e18 {
                        return Err(runtime(
                            "OverflowError",
                            "cannot convert float to integer",
                        ));
                    }
                    Ok(Value::Int(f.trunc() as i64))
                }
                Some(Value::Str(s)) => {
                    let cleaned = s.trim().replace('_', "");
                    cleaned.parse::<i64>().map(Value::Int).map_err(|_| {
                        runtime(
                            "ValueError",
                            format!("invalid literal for int() with base 10: '{}'", s),
                        )
                    })
                }
                Some(v) => v.as_int().map(Value::Int).ok_or_else(|| {
                    runtime(
                        "TypeError",
                        format!("int() argument must be a string or a number, not '{}'", v.type_name()),
                    )
                }),
            }
        }
        "float" => {
            arity(name, args, 0, 1)?;
            match args.first() {
                None => Ok(Value::Float(0.0)),
                Some(Value::Str(s)) => parse_float(s).map(Value::Float).ok_or_else(|| {
                    runtime(
                        "ValueError",
                        format!("could not convert string to float: '{}'", s),
                    )
                }),
                Some(v) => v.as_float().map(Value::Float).ok_or_else(|| {
                    runtime(
                        "TypeError",
                        format!("float() argument must be a string or a number, not '{}'", v.type_name()),
                    )
                }),
            }
        }
        "bool" => {
            arity(name, args, 0, 1)?;
            Ok(Value::Bool(args.first().is_some_and(Value::truthy)))
        }
        "list" => {
            arity(name, args, 0, 1)?;
            match args.first() {
                Some(v) => Ok(Value::list(m.iterate(v)?)),
                None => Ok(Value::list(Vec::new())),
            }
        }
        "tuple" => {
            arity(name, args, 0, 1)?;
            match args.first() {
                Some(v) => Ok(Value::tuple(m.iterate(v)?)),
                None => Ok(Value::tuple(Vec::new())),
            }
        }
        "dict" => {
            arity(name, args, 0, 1)?;
            let mut dict = Dict::default();
            if let Some(source) = args.first() {
                if let Value::Dict(existing) = source {
                    return Ok(Value::dict(existing.borrow().clone()));
                }
                for pair in m.iterate(source)? {
                    let items = m.iterate(&pair)?;
                    let [key, value]: [Value; 2] = items.try_into().map_err(|_| {
                        runtime(
                            "ValueError",
                            "dictionary update sequence element has wrong length",
                        )
                    })?;
                    dict.insert(key, value)?;
                }
            }
            Ok(Value::dict(dict))
        }
        "reversed" => {
            arity(name, args, 1, 1)?;
            let mut items = m.iterate(&args[0])?;
            items.reverse();
            Ok(Value::list(items))
        }
        "range" => {
            arity(name, args, 1, 3)?;
            let ints = args
                .iter()
                .map(|v| expect_int(v, "range() argument"))
                .collect::<Result<Vec<_>, _>>()?;
            let (start, stop, step) = match ints.as_slice() {
                [stop] => (0, *stop, 1),
                [start, stop] => (*start, *stop, 1),
                [start, stop, step] => (*start, *stop, *step),
                _ => return Err(runtime("TypeError", "range expected 1 to 3 arguments")),
            };
            if step == 0 {
                return Err(runtime("ValueError", "range() arg 3 must not be zero"));
            }
            Ok(Value::Range { start, stop, step })
        }
        "enumerate" => {
            arity(name, args, 1, 2)?;
            let start = match args.get(1) {
                Some(v) => expect_int(v, "start")?,
                None => 0,
            };
            let items = m.iterate(&args[0])?;
            Ok(Value::list(
                items
                    .into_iter()
                    .enumerate()
                    .map(|(i, v)| Value::tuple(vec![Value::Int(start + i as i64), v]))
                    .collect(),
            ))
        }
        "zip" => {
            let columns = args
                .iter()
                .map(|v| m.iterate(v))
                .collect::<Result<Vec<_>, _>>()?;
            let len = columns.iter().map(Vec::len).min().unwrap_or(0);
            let rows = (0..len)
                .map(|i| Value::tuple(columns.iter().map(|c| c[i].clone()).collect()))
                .collect();
            Ok(Value::list(rows))
        }
        "any" => {
            arity(name, args, 1, 1)?;
            Ok(Value::Bool(m.iterate(&args[0])?.iter().any(Value::truthy)))
        }
        "all" => {
            arity(name, args, 1, 1)?;
            Ok(Value::Bool(m.iterate(&args[0])?.iter().all(Value::truthy)))
        }
        other => Err(runtime(
            "NameError",
            format!("name '{}' is not defined", other),
        )),
    }
}

fn parse_float(text: &str) -> Option<f64> {
    let text = text.trim();
    match text.to_ascii_lowercase().as_str() {
        "nan" | "+nan" | "-nan" => Some(f64::NAN),
        "inf" | "+inf" | "infinity" | "+infinity" => Some(f64::INFINITY),
        "-inf" | "-infinity" => Some(f64::NEG_INFINITY),
        _ => text.replace('_', "").parse().ok(),
    }
}

/// `round()` with ties to even, as Python does
fn round(value: &Value, digits: Option<i64>) -> Result<Value, ScriptError> {
    match (value, digits) {
        (Value::Float(f), None) => {
            if !f.is_finite() {
                return Err(runtime("ValueError", "cannot convert float to integer"));
            }
            Ok(Value::Int(f.round_ties_even() as i64))
        }
        (Value::Float(f), Some(d)) => {
            let d = d.clamp(-308, 308) as i32;
            let scale = 10f64.powi(d);
            let scaled = f * scale;
            if !scaled.is_finite() {
                return Ok(Value::Float(*f));
            }
            Ok(Value::Float(scaled.round_ties_even() / scale))
        }
        (v, d) => {
            let Some(n) = v.as_int() else {
                return Err(runtime(
                    "TypeError",
                    format!("type {} doesn't define __round__ method", v.type_name()),
                ));
            };
            match d {
                Some(d) if d < 0 => {
                    let factor = 10i64.checked_pow((-d) as u32).unwrap_or(i64::MAX);
                    let rounded = ((n as f64) / (factor as f64)).round_ties_even() * factor as f64;
                    Ok(Value::Int(rounded as i64))
                }
                _ => Ok(Value::Int(n)),
            }
        }
    }
}

fn sort_values(
    m: &mut Machine,
    items: &mut Vec<Value>,
    key: Option<Value>,
    reverse: bool,
) -> Result<(), ScriptError> {
    let keys = match key {
        None | Some(Value::None) => items.clone(),
        Some(func) => items
            .iter()
            .map(|item| apply(m, &func, item.clone()))
            .collect::<Result<Vec<_>, _>>()?,
    };

    let mut order: Vec<usize> = (0..items.len()).collect();
    let mut failure = None;
    order.sort_by(|&a, &b| {
        let ordering = py_cmp(&keys[a], &keys[b]).unwrap_or_else(|e| {
            failure.get_or_insert(e);
            Ordering::Equal
        });
        if reverse { ordering.reverse() } else { ordering }
    });
    if let Some(e) = failure {
        return Err(e);
    }
    let sorted = order.into_iter().map(|i| items[i].clone()).collect();
    *items = sorted;
    Ok(())
}

/// Call a builtin used as a `key=` function
fn apply(m: &mut Machine, func: &Value, arg: Value) -> Result<Value, ScriptError> {
    match func {
        Value::Builtin(name) => call(m, *name, vec![arg], Vec::new()),
        other => Err(runtime(
            "TypeError",
            format!("'{}' object is not callable", other.type_name()),
        )),
    }
}

fn extreme(
    m: &mut Machine,
    name: &str,
    items: Vec<Value>,
    key: Option<Value>,
    default: Option<Value>,
) -> Result<Value, ScriptError> {
    let mut best: Option<(Value, Value)> = None;
    for item in items {
        let k = match &key {
            None | Some(Value::None) => item.clone(),
            Some(func) => apply(m, func, item.clone())?,
        };
        let replace = match &best {
            None => true,
            Some((best_key, _)) => {
                let ordering = py_cmp(&k, best_key)?;
                if name == "min" {
                    ordering == Ordering::Less
                } else {
                    ordering == Ordering::Greater
                }
            }
        };
        if replace {
            best = Some((k, item));
        }
    }
    match (best, default) {
        (Some((_, item)), _) => Ok(item),
        (None, Some(default)) => Ok(default),
        (None, None) => Err(runtime(
            "ValueError",
            format!("{}() arg is an empty sequence", name),
        )),
    }
}

pub fn call_method(
    m: &mut Machine,
    receiver: &Value,
    method: &str,
    args: Vec<Value>,
    kwargs: Kwargs,
) -> Result<Value, ScriptError> {
    match receiver {
        Value::Str(s) => {
            no_kwargs(method, &kwargs)?;
            str_method(m, s, method, &args)
        }
        Value::List(_) => list_method(m, receiver, method, args, kwargs),
        Value::Dict(_) => {
            no_kwargs(method, &kwargs)?;
            dict_method(m, receiver, method, args)
        }
        other => Err(no_attribute(other, method)),
    }
}

fn no_attribute(value: &Value, method: &str) -> ScriptError {
    runtime(
        "AttributeError",
        format!(
            "'{}' object has no attribute '{}'",
            value.type_name(),
            method
        ),
    )
}

fn str_method(m: &Machine, s: &str, method: &str, args: &[Value]) -> Result<Value, ScriptError> {
    let strip_chars = |args: &[Value]| -> Result<Option<Vec<char>>, ScriptError> {
        arity(method, args, 0, 1)?;
        match args.first() {
            None | Some(Value::None) => Ok(None),
            Some(v) => Ok(Some(expect_str(v, "chars")?.chars().collect())),
        }
    };

    match method {
        "upper" => Ok(Value::str(s.to_uppercase())),
        "lower" => Ok(Value::str(s.to_lowercase())),
        "strip" => Ok(Value::str(match strip_chars(args)? {
            None => s.trim(),
            Some(chars) => s.trim_matches(chars.as_slice()),
        })),
        "lstrip" => Ok(Value::str(match strip_chars(args)? {
            None => s.trim_start(),
            Some(chars) => s.trim_start_matches(chars.as_slice()),
        })),
        "rstrip" => Ok(Value::str(match strip_chars(args)? {
            None => s.trim_end(),
            Some(chars) => s.trim_end_matches(chars.as_slice()),
        })),
        "split" => {
            arity(method, args, 0, 2)?;
            let max = match args.get(1) {
                Some(v) => expect_int(v, "maxsplit")?,
                None => -1,
            };
            let parts: Vec<Value> = match args.first() {
                None | Some(Value::None) => {
                    if max < 0 {
                        s.split_whitespace().map(Value::str).collect()
                    } else {
                        split_whitespace_n(s, max as usize)
                    }
                }
                Some(v) => {
                    let sep = expect_str(v, "separator")?;
                    if sep.is_empty() {
                        return Err(runtime("ValueError", "empty separator"));
                    }
                    if max < 0 {
                        s.split(sep).map(Value::str).collect()
                    } else {
                        s.splitn(max as usize + 1, sep).map(Value::str).collect()
                    }
                }
            };
            m.check_items(parts.len())?;
            Ok(Value::list(parts))
        }
        "splitlines" => {
            arity(method, args, 0, 0)?;
            Ok(Value::list(s.lines().map(Value::str).collect()))
        }
        "join" => {
            arity(method, args, 1, 1)?;
            let items = m.iterate(&args[0])?;
            let mut parts = Vec::with_capacity(items.len());
            for item in &items {
                parts.push(expect_str(item, "sequence item")?.to_string());
            }
            let joined = parts.join(s);
            m.check_str(joined.len())?;
            Ok(Value::str(joined))
        }
        "replace" => {
            arity(method, args, 2, 3)?;
            let old = expect_str(&args[0], "old")?;
            let new = expect_str(&args[1], "new")?;
            let replaced = match args.get(2) {
                Some(count) => {
                    let count = expect_int(count, "count")?;
                    if count < 0 {
                        s.replace(old, new)
                    } else {
                        s.replacen(old, new, count as usize)
                    }
                }
                None => s.replace(old, new),
            };
            m.check_str(replaced.len())?;
            Ok(Value::str(replaced))
        }
        "startswith" | "endswith" => {
            arity(method, args, 1, 1)?;
            let candidates: Vec<Value> = match &args[0] {
                Value::Tuple(items) => items.to_vec(),
                other => vec![other.clone()],
            };
            for candidate in &candidates {
                let affix = expect_str(candidate, method)?;
                let hit = if method == "startswith" {
                    s.starts_with(affix)
                } else {
                    s.ends_with(affix)
                };
                if hit {
                    return Ok(Value::Bool(true));
                }
            }
            Ok(Value::Bool(false))
        }
        "find" => {
            arity(method, args, 1, 1)?;
            let needle = expect_str(&args[0], "substring")?;
            let index = s
                .find(needle)
                .map(|byte| s[..byte].chars().count() as i64)
                .unwrap_or(-1);
            Ok(Value::Int(index))
        }
        "count" => {
            arity(method, args, 1, 1)?;
            let needle = expect_str(&args[0], "substring")?;
            let count = if needle.is_empty() {
                s.chars().count() + 1
            } else {
                s.matches(needle).count()
            };
            Ok(Value::Int(count as i64))
        }
        "title" => {
            let mut out = String::with_capacity(s.len());
            let mut previous_cased = false;
            for c in s.chars() {
                if previous_cased {
                    out.extend(c.to_lowercase());
                } else {
                    out.extend(c.to_uppercase());
                }
                previous_cased = c.is_alphabetic();
            }
            Ok(Value::str(out))
        }
        "capitalize" => {
            let mut chars = s.chars();
            let out = match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            };
            Ok(Value::str(out))
        }
        "isdigit" => Ok(Value::Bool(
            !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()),
        )),
        "isalpha" => Ok(Value::Bool(
            !s.is_empty() && s.chars().all(char::is_alphabetic),
        )),
        _ => Err(no_attribute(&Value::str(""), method)),
    }
}

fn split_whitespace_n(s: &str, max: usize) -> Vec<Value> {
    let mut parts = Vec::new();
    let mut rest = s.trim_start();
    while !rest.is_empty() {
        if parts.len() == max {
            parts.push(Value::str(rest));
            break;
        }
        match rest.find(char::is_whitespace) {
            Some(end) => {
                parts.push(Value::str(&rest[..end]));
                rest = rest[end..].trim_start();
            }
            None => {
                parts.push(Value::str(rest));
                break;
            }
        }
    }
    parts
}

fn list_method(
    m: &mut Machine,
    receiver: &Value,
    method: &str,
    mut args: Vec<Value>,
    mut kwargs: Kwargs,
) -> Result<Value, ScriptError> {
    let Value::List(list) = receiver else {
        return Err(no_attribute(receiver, method));
    };

    if method == "sort" {
        let key = take_kwarg(&mut kwargs, "key");
        let reverse = take_kwarg(&mut kwargs, "reverse").is_some_and(|v| v.truthy());
        no_kwargs(method, &kwargs)?;
        arity(method, &args, 0, 0)?;
        let mut items = list.borrow().clone();
        sort_values(m, &mut items, key, reverse)?;
        *list.borrow_mut() = items;
        return Ok(Value::None);
    }
    no_kwargs(method, &kwargs)?;

    match method {
        "append" => {
            arity(method, &args, 1, 1)?;
            let item = args.remove(0);
            let mut items = list.borrow_mut();
            m.check_items(items.len() + 1)?;
            items.push(item);
            Ok(Value::None)
        }
        "extend" => {
            arity(method, &args, 1, 1)?;
            let extra = m.iterate(&args[0])?;
            let mut items = list.borrow_mut();
            m.check_items(items.len() + extra.len())?;
            items.extend(extra);
            Ok(Value::None)
        }
        "insert" => {
            arity(method, &args, 2, 2)?;
            let index = expect_int(&args[0], "index")?;
            let item = args.remove(1);
            let mut items = list.borrow_mut();
            m.check_items(items.len() + 1)?;
            let len = items.len() as i64;
            let at = if index < 0 { (index + len).max(0) } else { index.min(len) };
            items.insert(at as usize, item);
            Ok(Value::None)
        }
        "pop" => {
            arity(method, &args, 0, 1)?;
            let mut items = list.borrow_mut();
            if items.is_empty() {
                return Err(runtime("IndexError", "pop from empty list"));
            }
            let len = items.len() as i64;
            let index = match args.first() {
                Some(v) => expect_int(v, "index")?,
                None => -1,
            };
            let at = if index < 0 { index + len } else { index };
            if at < 0 || at >= len {
                return Err(runtime("IndexError", "pop index out of range"));
            }
            Ok(items.remove(at as usize))
        }
        "remove" => {
            arity(method, &args, 1, 1)?;
            let found = list.borrow().iter().position(|v| py_eq(v, &args[0]));
            match found {
                Some(pos) => {
                    list.borrow_mut().remove(pos);
                    Ok(Value::None)
                }
                None => Err(runtime("ValueError", "list.remove(x): x not in list")),
            }
        }
        "index" => {
            arity(method, &args, 1, 1)?;
            let items = list.borrow();
            items
                .iter()
                .position(|v| py_eq(v, &args[0]))
                .map(|pos| Value::Int(pos as i64))
                .ok_or_else(|| {
                    runtime(
                        "ValueError",
                        format!("{} is not in list", args[0].repr().unwrap_or_default()),
                    )
                })
        }
        "count" => {
            arity(method, &args, 1, 1)?;
            let count = list.borrow().iter().filter(|v| py_eq(v, &args[0])).count();
            Ok(Value::Int(count as i64))
        }
        "reverse" => {
            arity(method, &args, 0, 0)?;
            list.borrow_mut().reverse();
            Ok(Value::None)
        }
        "clear" => {
            arity(method, &args, 0, 0)?;
            list.borrow_mut().clear();
            Ok(Value::None)
        }
        "copy" => {
            arity(method, &args, 0, 0)?;
            Ok(Value::list(list.borrow().clone()))
        }
        _ => Err(no_attribute(receiver, method)),
    }
}

fn dict_method(
    m: &mut Machine,
    receiver: &Value,
    method: &str,
    args: Vec<Value>,
) -> Result<Value, ScriptError> {
    let Value::Dict(dict) = receiver else {
        return Err(no_attribute(receiver, method));
    };

    match method {
        "get" => {
            arity(method, &args, 1, 2)?;
            let found = dict.borrow().get(&args[0])?;
            Ok(found.unwrap_or_else(|| args.get(1).cloned().unwrap_or(Value::None)))
        }
        "keys" => {
            arity(method, &args, 0, 0)?;
            Ok(Value::list(dict.borrow().keys()))
        }
        "values" => {
            arity(method, &args, 0, 0)?;
            Ok(Value::list(dict.borrow().values()))
        }
        "items" => {
            arity(method, &args, 0, 0)?;
            let items = dict
                .borrow()
                .iter()
                .map(|(k, v)| Value::tuple(vec![k.clone(), v.clone()]))
                .collect();
            Ok(Value::list(items))
        }
        "pop" => {
            arity(method, &args, 1, 2)?;
            let removed = dict.borrow_mut().remove(&args[0])?;
            match (removed, args.get(1)) {
                (Some(value), _) => Ok(value),
                (None, Some(default)) => Ok(default.clone()),
                (None, None) => Err(runtime("KeyError", args[0].repr()?)),
            }
        }
        "update" => {
            arity(method, &args, 1, 1)?;
            let pairs: Vec<(Value, Value)> = match &args[0] {
                Value::Dict(other) => other.borrow().iter().cloned().collect(),
                other => {
                    let mut pairs = Vec::new();
                    for pair in m.iterate(other)? {
                        let items = m.iterate(&pair)?;
                        let [k, v]: [Value; 2] = items.try_into().map_err(|_| {
                            runtime(
                                "ValueError",
                                "dictionary update sequence element has wrong length",
                            )
                        })?;
                        pairs.push((k, v));
                    }
                    pairs
                }
            };
            let mut dict = dict.borrow_mut();
            for (k, v) in pairs {
                dict.insert(k, v)?;
            }
            m.check_items(dict.len())?;
            Ok(Value::None)
        }
        "setdefault" => {
            arity(method, &args, 1, 2)?;
            let mut dict = dict.borrow_mut();
            if let Some(existing) = dict.get(&args[0])? {
                return Ok(existing);
            }
            let default = args.get(1).cloned().unwrap_or(Value::None);
            dict.insert(args[0].clone(), default.clone())?;
            Ok(default)
        }
        "copy" => {
            arity(method, &args, 0, 0)?;
            Ok(Value::dict(dict.borrow().clone()))
        }
        "clear" => {
            arity(method, &args, 0, 0)?;
            dict.borrow_mut().clear();
            Ok(Value::None)
        }
        _ => Err(no_attribute(receiver, method)),
    }
}

/// Apply an f-string format spec: `[[fill]align][width][.precision][type]`
pub fn format_spec(value: &Value, spec: &str) -> Result<String, ScriptError> {
    let invalid = || runtime("ValueError", format!("invalid format specifier '{}'", spec));
    let mut chars: Vec<char> = spec.chars().collect();

    let mut fill = ' ';
    let mut align = None;
    if chars.len() >= 2 && matches!(chars[1], '<' | '>' | '^') {
        fill = chars[0];
        align = Some(chars[1]);
        chars = chars.split_off(2);
    } else if chars.first().is_some_and(|c| matches!(c, '<' | '>' | '^')) {
        align = Some(chars[0]);
        chars.remove(0);
    }

    let mut thousands = false;
    let mut width = String::new();
    let mut precision: Option<usize> = None;
    let mut kind = None;
    let mut i = 0;
    while i < chars.len() && chars[i].is_ascii_digit() {
        width.push(chars[i]);
        i += 1;
    }
    if i < chars.len() && chars[i] == ',' {
        thousands = true;
        i += 1;
    }
    if i < chars.len() && chars[i] == '.' {
        i += 1;
        let mut digits = String::new();
        while i < chars.len() && chars[i].is_ascii_digit() {
            digits.push(chars[i]);
            i += 1;
        }
        precision = Some(digits.parse().map_err(|_| invalid())?);
    }
    if i < chars.len() {
        kind = Some(chars[i]);
        i += 1;
    }
    if i != chars.len() {
        return Err(invalid());
    }

    let body = match (kind, value) {
        (Some('d'), v) => {
            let n = v.as_int().ok_or_else(invalid)?;
            group(n.to_string(), thousands)
        }
        (Some('f'), v) => {
            let f = v.as_float().ok_or_else(invalid)?;
            group(format!("{:.*}", precision.unwrap_or(6), f), thousands)
        }
        (Some('%'), v) => {
            let f = v.as_float().ok_or_else(invalid)?;
            format!("{:.*}%", precision.unwrap_or(6), f * 100.0)
        }
        (Some('s'), Value::Str(s)) => truncate(s, precision),
        (Some(_), _) => return Err(invalid()),
        (None, Value::Float(f)) => match precision {
            Some(p) => group(format!("{:.*}", p, f), thousands),
            None => format_float(*f),
        },
        (None, Value::Int(n)) => group(n.to_string(), thousands),
        (None, Value::Str(s)) => truncate(s, precision),
        (None, v) => v.to_str()?,
    };

    let width: usize = if width.is_empty() {
        0
    } else {
        width.parse().map_err(|_| invalid())?
    };
    let len = body.chars().count();
    if len >= width {
        return Ok(body);
    }
    let pad = width - len;
    let default_align = if value.is_number() { '>' } else { '<' };
    let padding = |n: usize| fill.to_string().repeat(n);
    Ok(match align.unwrap_or(default_align) {
        '<' => format!("{}{}", body, padding(pad)),
        '^' => format!("{}{}{}", padding(pad / 2), body, padding(pad - pad / 2)),
        _ => format!("{}{}", padding(pad), body),
    })
}

fn truncate(s: &str, precision: Option<usize>) -> String {
    match precision {
        Some(p) => s.chars().take(p).collect(),
        None => s.to_string(),
    }
}

/// Insert `,` thousands separators into the integer part of a number
fn group(text: String, enabled: bool) -> String {
    if !enabled {
        return text;
    }
    let (sign, rest) = match text.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", text.as_str()),
    };
    let (int_part, frac) = match rest.find('.') {
        Some(dot) => (&rest[..dot], &rest[dot..]),
        None => (rest, ""),
    };
    let mut grouped = String::new();
    for (i, c) in int_part.chars().enumerate() {
        if i > 0 && (int_part.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }
    format!("{}{}{}", sign, grouped, frac)
}
