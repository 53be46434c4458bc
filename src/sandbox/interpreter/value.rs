//! Runtime values of the script subset

use super::{ScriptError, runtime};
use serde_json::{Map, Number, Value as Json};
use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

/// Nesting depth past which repr and JSON conversion give up
const MAX_DEPTH: usize = 100;

#[derive(Debug, Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    List(Rc<RefCell<Vec<Value>>>),
    Tuple(Rc<[Value]>),
    Dict(Rc<RefCell<Dict>>),
    Range { start: i64, stop: i64, step: i64 },
    Builtin(&'static str),
}

impl Value {
    pub fn str(s: impl Into<Rc<str>>) -> Self {
        Value::Str(s.into())
    }

    pub fn list(items: Vec<Value>) -> Self {
        Value::List(Rc::new(RefCell::new(items)))
    }

    pub fn tuple(items: Vec<Value>) -> Self {
        Value::Tuple(items.into())
    }

    pub fn dict(dict: Dict) -> Self {
        Value::Dict(Rc::new(RefCell::new(dict)))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Tuple(_) => "tuple",
            Value::Dict(_) => "dict",
            Value::Range { .. } => "range",
            Value::Builtin(_) => "builtin_function_or_method",
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(n) => *n != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(items) => !items.borrow().is_empty(),
            Value::Tuple(items) => !items.is_empty(),
            Value::Dict(dict) => !dict.borrow().is_empty(),
            Value::Range { start, stop, step } => range_len(*start, *stop, *step) > 0,
            Value::Builtin(_) => true,
        }
    }

    /// Integer view; bools count as integers
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Bool(b) => Some(*b as i64),
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Bool(b) => Some(*b as i64 as f64),
            Value::Int(n) => Some(*n as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn is_number(&self) -> bool {
        matches!(self, Value::Bool(_) | Value::Int(_) | Value::Float(_))
    }

    /// `str(value)`
    pub fn to_str(&self) -> Result<String, ScriptError> {
        match self {
            Value::Str(s) => Ok(s.to_string()),
            other => other.repr(),
        }
    }

    /// `repr(value)`
    pub fn repr(&self) -> Result<String, ScriptError> {
        let mut out = String::new();
        self.write_repr(&mut out, 0)?;
        Ok(out)
    }

    fn write_repr(&self, out: &mut String, depth: usize) -> Result<(), ScriptError> {
        if depth > MAX_DEPTH {
            return Err(runtime("RecursionError", "maximum nesting depth exceeded"));
        }
        match self {
            Value::None => out.push_str("None"),
            Value::Bool(true) => out.push_str("True"),
            Value::Bool(false) => out.push_str("False"),
            Value::Int(n) => {
                let _ = write!(out, "{}", n);
            }
            Value::Float(f) => out.push_str(&format_float(*f)),
            Value::Str(s) => out.push_str(&quote(s)),
            Value::List(items) => {
                out.push('[');
                write_items(out, &items.borrow(), depth)?;
                out.push(']');
            }
            Value::Tuple(items) => {
                out.push('(');
                write_items(out, items, depth)?;
                if items.len() == 1 {
                    out.push(',');
                }
                out.push(')');
            }
            Value::Dict(dict) => {
                out.push('{');
                for (i, (key, value)) in dict.borrow().iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    key.write_repr(out, depth + 1)?;
                    out.push_str(": ");
                    value.write_repr(out, depth + 1)?;
                }
                out.push('}');
            }
            Value::Range { start, stop, step } => {
                if *step == 1 {
                    let _ = write!(out, "range({}, {})", start, stop);
                } else {
                    let _ = write!(out, "range({}, {}, {})", start, stop, step);
                }
            }
            Value::Builtin(name) => {
                let _ = write!(out, "<built-in function {}>", name);
            }
        }
        Ok(())
    }

    pub fn from_json(json: &Json) -> Value {
        match json {
            Json::Null => Value::None,
            Json::Bool(b) => Value::Bool(*b),
            Json::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Json::String(s) => Value::str(s.as_str()),
            Json::Array(items) => Value::list(items.iter().map(Value::from_json).collect()),
            Json::Object(map) => {
                let mut dict = Dict::default();
                for (key, value) in map {
                    dict.insert_str(key, Value::from_json(value));
                }
                Value::dict(dict)
            }
        }
    }

    pub fn to_json(&self) -> Result<Json, ScriptError> {
        self.to_json_at(0)
    }

    fn to_json_at(&self, depth: usize) -> Result<Json, ScriptError> {
        if depth > MAX_DEPTH {
            return Err(runtime("ValueError", "result nesting is too deep to serialize"));
        }
        Ok(match self {
            Value::None => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int(n) => Json::from(*n),
            Value::Float(f) => Number::from_f64(*f).map(Json::Number).ok_or_else(|| {
                runtime("ValueError", format!("float {} is not JSON serializable", f))
            })?,
            Value::Str(s) => Json::String(s.to_string()),
            Value::List(items) => Json::Array(
                items
                    .borrow()
                    .iter()
                    .map(|v| v.to_json_at(depth + 1))
                    .collect::<Result<_, _>>()?,
            ),
            Value::Tuple(items) => Json::Array(
                items
                    .iter()
                    .map(|v| v.to_json_at(depth + 1))
                    .collect::<Result<_, _>>()?,
            ),
            Value::Range { start, stop, step } => Json::Array(
                RangeIter::new(*start, *stop, *step)
                    .map(Json::from)
                    .collect(),
            ),
            Value::Dict(dict) => {
                let mut map = Map::new();
                for (key, value) in dict.borrow().iter() {
                    map.insert(json_key(key)?, value.to_json_at(depth + 1)?);
                }
                Json::Object(map)
            }
            Value::Builtin(name) => {
                return Err(runtime(
                    "TypeError",
                    format!("built-in function '{}' is not JSON serializable", name),
                ));
            }
        })
    }
}

fn write_items(out: &mut String, items: &[Value], depth: usize) -> Result<(), ScriptError> {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        item.write_repr(out, depth + 1)?;
    }
    Ok(())
}

/// Object keys follow `json.dumps`: scalars are stringified
fn json_key(key: &Value) -> Result<String, ScriptError> {
    match key {
        Value::Str(s) => Ok(s.to_string()),
        Value::Int(n) => Ok(n.to_string()),
        Value::Float(f) => Ok(format_float(*f)),
        Value::Bool(b) => Ok(b.to_string()),
        Value::None => Ok("null".to_string()),
        other => Err(runtime(
            "TypeError",
            format!("keys must be str, int, float, bool or None, not {}", other.type_name()),
        )),
    }
}

fn quote(s: &str) -> String {
    let delim = if s.contains('\'') && !s.contains('"') {
        '"'
    } else {
        '\''
    };
    let mut out = String::with_capacity(s.len() + 2);
    out.push(delim);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c if c == delim => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out.push(delim);
    out
}

/// Float formatting matching Python's `repr`
pub fn format_float(f: f64) -> String {
    if f.is_nan() {
        return "nan".to_string();
    }
    if f.is_infinite() {
        return if f > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    let abs = f.abs();
    if abs != 0.0 && !(1e-4..1e16).contains(&abs) {
        let formatted = format!("{:e}", f);
        let (mantissa, exponent) = formatted.split_once('e').unwrap_or((&formatted, "0"));
        let (sign, digits) = match exponent.strip_prefix('-') {
            Some(d) => ('-', d),
            None => ('+', exponent),
        };
        return format!("{}e{}{:0>2}", mantissa, sign, digits);
    }
    if f.fract() == 0.0 {
        format!("{:.1}", f)
    } else {
        format!("{}", f)
    }
}

/// Python equality: numbers compare across int/float/bool
pub fn py_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::None, Value::None) => true,
        (Value::Str(x), Value::Str(y)) => x == y,
        (x, y) if x.is_number() && y.is_number() => match (x.as_int(), y.as_int()) {
            (Some(i), Some(j)) => i == j,
            _ => x.as_float() == y.as_float(),
        },
        (Value::List(x), Value::List(y)) => {
            Rc::ptr_eq(x, y) || seq_eq(&x.borrow(), &y.borrow())
        }
        (Value::Tuple(x), Value::Tuple(y)) => seq_eq(x, y),
        (Value::Dict(x), Value::Dict(y)) => {
            if Rc::ptr_eq(x, y) {
                return true;
            }
            let (x, y) = (x.borrow(), y.borrow());
            x.len() == y.len()
                && x.iter().all(|(k, v)| {
                    y.get(k)
                        .ok()
                        .flatten()
                        .is_some_and(|other| py_eq(v, &other))
                })
        }
        (
            Value::Range { start, stop, step },
            Value::Range {
                start: s2,
                stop: e2,
                step: t2,
            },
        ) => start == s2 && stop == e2 && step == t2,
        (Value::Builtin(x), Value::Builtin(y)) => x == y,
        _ => false,
    }
}

fn seq_eq(a: &[Value], b: &[Value]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| py_eq(x, y))
}

/// Python ordering for `<`, `sorted`, `min` and `max`
pub fn py_cmp(a: &Value, b: &Value) -> Result<Ordering, ScriptError> {
    match (a, b) {
        (x, y) if x.is_number() && y.is_number() => {
            if let (Some(i), Some(j)) = (x.as_int(), y.as_int()) {
                return Ok(i.cmp(&j));
            }
            let (fx, fy) = (x.as_float().unwrap_or(f64::NAN), y.as_float().unwrap_or(f64::NAN));
            fx.partial_cmp(&fy)
                .ok_or_else(|| runtime("ValueError", "cannot order nan"))
        }
        (Value::Str(x), Value::Str(y)) => Ok(x.cmp(y)),
        (Value::List(x), Value::List(y)) => seq_cmp(&x.borrow(), &y.borrow()),
        (Value::Tuple(x), Value::Tuple(y)) => seq_cmp(x, y),
        _ => Err(runtime(
            "TypeError",
            format!(
                "'<' not supported between instances of '{}' and '{}'",
                a.type_name(),
                b.type_name()
            ),
        )),
    }
}

fn seq_cmp(a: &[Value], b: &[Value]) -> Result<Ordering, ScriptError> {
    for (x, y) in a.iter().zip(b) {
        if !py_eq(x, y) {
            return py_cmp(x, y);
        }
    }
    Ok(a.len().cmp(&b.len()))
}

pub fn range_len(start: i64, stop: i64, step: i64) -> usize {
    let span = if step > 0 {
        (stop as i128) - (start as i128)
    } else {
        (start as i128) - (stop as i128)
    };
    if span <= 0 {
        return 0;
    }
    let step = (step as i128).abs();
    ((span + step - 1) / step) as usize
}

/// Lazy iteration over a range
pub struct RangeIter {
    next: i64,
    remaining: usize,
    step: i64,
}

impl RangeIter {
    pub fn new(start: i64, stop: i64, step: i64) -> Self {
        Self {
            next: start,
            remaining: range_len(start, stop, step),
            step,
        }
    }
}

impl Iterator for RangeIter {
    type Item = i64;

    fn next(&mut self) -> Option<i64> {
        if self.remaining == 0 {
            return None;
        }
        let current = self.next;
        self.remaining -= 1;
        self.next = self.next.wrapping_add(self.step);
        Some(current)
    }
}

/// Hashable projection of a value; equal numbers share a key
#[derive(Debug, Clone)]
enum HashKey {
    None,
    Int(i64),
    Float(u64),
    Str(Rc<str>),
    Tuple(Vec<HashKey>),
}

impl PartialEq for HashKey {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (HashKey::None, HashKey::None) => true,
            (HashKey::Int(a), HashKey::Int(b)) => a == b,
            (HashKey::Float(a), HashKey::Float(b)) => a == b,
            (HashKey::Str(a), HashKey::Str(b)) => a == b,
            (HashKey::Tuple(a), HashKey::Tuple(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for HashKey {}

impl Hash for HashKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        core::mem::discriminant(self).hash(state);
        match self {
            HashKey::None => {}
            HashKey::Int(n) => n.hash(state),
            HashKey::Float(bits) => bits.hash(state),
            HashKey::Str(s) => s.hash(state),
            HashKey::Tuple(items) => items.hash(state),
        }
    }
}

impl HashKey {
    fn of(value: &Value) -> Result<Self, ScriptError> {
        Ok(match value {
            Value::None => HashKey::None,
            Value::Bool(b) => HashKey::Int(*b as i64),
            Value::Int(n) => HashKey::Int(*n),
            Value::Float(f) if f.fract() == 0.0 && f.abs() < 9.2e18 => HashKey::Int(*f as i64),
            Value::Float(f) => HashKey::Float(f.to_bits()),
            Value::Str(s) => HashKey::Str(s.clone()),
            Value::Tuple(items) => {
                HashKey::Tuple(items.iter().map(HashKey::of).collect::<Result<_, _>>()?)
            }
            other => {
                return Err(runtime(
                    "TypeError",
                    format!("unhashable type: '{}'", other.type_name()),
                ));
            }
        })
    }
}

/// Insertion-ordered dictionary
#[derive(Debug, Clone, Default)]
pub struct Dict {
    entries: Vec<(Value, Value)>,
    index: HashMap<HashKey, usize>,
}

impl Dict {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Value, Value)> {
        self.entries.iter()
    }

    pub fn keys(&self) -> Vec<Value> {
        self.entries.iter().map(|(k, _)| k.clone()).collect()
    }

    pub fn values(&self) -> Vec<Value> {
        self.entries.iter().map(|(_, v)| v.clone()).collect()
    }

    pub fn get(&self, key: &Value) -> Result<Option<Value>, ScriptError> {
        let hash = HashKey::of(key)?;
        Ok(self.index.get(&hash).map(|&i| self.entries[i].1.clone()))
    }

    pub fn contains(&self, key: &Value) -> Result<bool, ScriptError> {
        Ok(self.index.contains_key(&HashKey::of(key)?))
    }

    pub fn insert(&mut self, key: Value, value: Value) -> Result<(), ScriptError> {
        let hash = HashKey::of(&key)?;
        match self.index.get(&hash) {
            Some(&i) => self.entries[i].1 = value,
            None => {
                self.index.insert(hash, self.entries.len());
                self.entries.push((key, value));
            }
        }
        Ok(())
    }

    fn insert_str(&mut self, key: &str, value: Value) {
        let key: Rc<str> = key.into();
        let hash = HashKey::Str(key.clone());
        match self.index.get(&hash) {
            Some(&i) => self.entries[i].1 = value,
            None => {
                self.index.insert(hash, self.entries.len());
                self.entries.push((Value::Str(key), value));
            }
        }
    }

    pub fn remove(&mut self, key: &Value) -> Result<Option<Value>, ScriptError> {
        let hash = HashKey::of(key)?;
        let Some(pos) = self.index.remove(&hash) else {
            return Ok(None);
        };
        let (_, value) = self.entries.remove(pos);
        for slot in self.index.values_mut() {
            if *slot > pos {
                *slot -= 1;
            }
        }
        Ok(Some(value))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_float_repr() {
        assert_eq!(format_float(3.0), "3.0");
        assert_eq!(format_float(0.1), "0.1");
        assert_eq!(format_float(-2.5), "-2.5");
        assert_eq!(format_float(1e16), "1e+16");
        assert_eq!(format_float(1.5e-5), "1.5e-05");
    }

    #[test]
    fn test_repr() {
        let value = Value::from_json(&json!({"a": [1, 2.5, "x"], "b": null, "c": true}));
        assert_eq!(value.repr().unwrap(), "{'a': [1, 2.5, 'x'], 'b': None, 'c': True}");
        assert_eq!(Value::tuple(vec![Value::Int(1)]).repr().unwrap(), "(1,)");
        assert_eq!(Value::str("it's").repr().unwrap(), "\"it's\"");
    }

    #[test]
    fn test_numeric_keys_unify() {
        let mut dict = Dict::default();
        dict.insert(Value::Int(1), Value::str("int")).unwrap();
        dict.insert(Value::Float(1.0), Value::str("float")).unwrap();
        dict.insert(Value::Bool(true), Value::str("bool")).unwrap();
        assert_eq!(dict.len(), 1);
        assert!(py_eq(&dict.get(&Value::Int(1)).unwrap().unwrap(), &Value::str("bool")));
    }

    #[test]
    fn test_unhashable_key() {
        let mut dict = Dict::default();
        assert!(dict.insert(Value::list(vec![]), Value::None).is_err());
    }

    #[test]
    fn test_remove_keeps_order() {
        let mut dict = Dict::default();
        for key in ["a", "b", "c"] {
            dict.insert(Value::str(key), Value::None).unwrap();
        }
        dict.remove(&Value::str("a")).unwrap();
        dict.insert(Value::str("d"), Value::None).unwrap();
        let keys: Vec<String> = dict.keys().iter().map(|k| k.to_str().unwrap()).collect();
        assert_eq!(keys, vec!["b", "c", "d"]);
        assert!(dict.get(&Value::str("c")).unwrap().is_some());
    }

    #[test]
    fn test_json_round_trip_keys() {
        let mut dict = Dict::default();
        dict.insert(Value::Int(2), Value::Float(0.5)).unwrap();
        assert_eq!(Value::dict(dict).to_json().unwrap(), json!({"2": 0.5}));
        assert!(Value::Float(f64::NAN).to_json().is_err());
    }

    #[test]
    fn test_ordering() {
        assert_eq!(py_cmp(&Value::Int(1), &Value::Float(1.5)).unwrap(), Ordering::Less);
        assert_eq!(
            py_cmp(
                &Value::tuple(vec![Value::Int(1), Value::Int(2)]),
                &Value::tuple(vec![Value::Int(1)])
            )
            .unwrap(),
            Ordering::Greater
        );
        assert!(py_cmp(&Value::str("a"), &Value::Int(1)).is_err());
    }

    #[test]
    fn test_range_len() {
        assert_eq!(range_len(0, 10, 3), 4);
        assert_eq!(range_len(10, 0, -1), 10);
        assert_eq!(range_len(0, 0, 1), 0);
        assert_eq!(RangeIter::new(5, 0, -2).collect::<Vec<_>>(), vec![5, 3, 1]);
    }
}
