//! Tree-walking evaluator

use super::ast::{BinOp, CmpOp, CompFor, Const, Expr, FPart, Index, Stmt, StmtKind, Target, UnaryOp};
use super::builtins::{self, format_spec};
use super::value::{Dict, RangeIter, Value, py_cmp, py_eq, range_len};
use super::{Limits, ScriptError, runtime};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

enum Flow {
    Normal,
    Break,
    Continue,
}

/// Collector for comprehension results
enum CompOut<'e> {
    List(&'e Expr, Vec<Value>),
    Dict(&'e Expr, &'e Expr, Dict),
}

pub struct Machine<'a> {
    vars: HashMap<String, Value>,
    stdout: String,
    steps: u64,
    pub(super) limits: Limits,
    cancel: &'a AtomicBool,
}

impl<'a> Machine<'a> {
    pub fn new(limits: Limits, cancel: &'a AtomicBool) -> Self {
        Self {
            vars: HashMap::new(),
            stdout: String::new(),
            steps: 0,
            limits,
            cancel,
        }
    }

    pub fn set(&mut self, name: &str, value: Value) {
        self.vars.insert(name.to_string(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    pub fn stdout(&self) -> &str {
        &self.stdout
    }

    pub fn run(&mut self, body: &[Stmt]) -> Result<(), ScriptError> {
        self.exec_block(body).map(|_| ())
    }

    /// Called on every statement and loop iteration
    fn tick(&mut self) -> Result<(), ScriptError> {
        self.steps += 1;
        if self.steps > self.limits.max_steps {
            return Err(ScriptError::Limit("iteration"));
        }
        if self.cancel.load(AtomicOrdering::Relaxed) {
            return Err(ScriptError::Cancelled);
        }
        Ok(())
    }

    pub(super) fn write_stdout(&mut self, text: &str) -> Result<(), ScriptError> {
        if self.stdout.len() + text.len() > self.limits.max_output_bytes {
            return Err(ScriptError::Limit("output size"));
        }
        self.stdout.push_str(text);
        Ok(())
    }

    pub(super) fn check_items(&self, len: usize) -> Result<(), ScriptError> {
        if len > self.limits.max_items {
            Err(ScriptError::Limit("collection size"))
        } else {
            Ok(())
        }
    }

    pub(super) fn check_str(&self, len: usize) -> Result<(), ScriptError> {
        if len > self.limits.max_str_len {
            Err(ScriptError::Limit("string size"))
        } else {
            Ok(())
        }
    }

    fn exec_block(&mut self, body: &[Stmt]) -> Result<Flow, ScriptError> {
        for stmt in body {
            self.tick()?;
            let flow = self.exec(stmt).map_err(|e| e.at(stmt.line))?;
            if !matches!(flow, Flow::Normal) {
                return Ok(flow);
            }
        }
        Ok(Flow::Normal)
    }

    fn exec(&mut self, stmt: &Stmt) -> Result<Flow, ScriptError> {
        match &stmt.kind {
            StmtKind::Expr(expr) => {
                self.eval(expr)?;
            }
            StmtKind::Assign(targets, value) => {
                let value = self.eval(value)?;
                for target in targets {
                    self.assign(target, value.clone())?;
                }
            }
            StmtKind::AugAssign(target, op, value) => self.aug_assign(target, *op, value)?,
            StmtKind::If { branches, orelse } => {
                for (cond, body) in branches {
                    if self.eval(cond)?.truthy() {
                        return self.exec_block(body);
                    }
                }
                return self.exec_block(orelse);
            }
            StmtKind::For { target, iter, body } => {
                let iterable = self.eval(iter)?;
                if let Value::Range { start, stop, step } = iterable {
                    for n in RangeIter::new(start, stop, step) {
                        if self.loop_iteration(target, Value::Int(n), body)? {
                            break;
                        }
                    }
                } else {
                    for item in self.iterate(&iterable)? {
                        if self.loop_iteration(target, item, body)? {
                            break;
                        }
                    }
                }
            }
            StmtKind::While { cond, body } => loop {
                self.tick()?;
                if !self.eval(cond)?.truthy() {
                    break;
                }
                if let Flow::Break = self.exec_block(body)? {
                    break;
                }
            },
            StmtKind::Break => return Ok(Flow::Break),
            StmtKind::Continue => return Ok(Flow::Continue),
            StmtKind::Pass => {}
        }
        Ok(Flow::Normal)
    }

    /// Returns `true` when the loop should stop
    fn loop_iteration(
        &mut self,
        target: &Target,
        item: Value,
        body: &[Stmt],
    ) -> Result<bool, ScriptError> {
        self.tick()?;
        self.assign(target, item)?;
        Ok(matches!(self.exec_block(body)?, Flow::Break))
    }

    fn assign(&mut self, target: &Target, value: Value) -> Result<(), ScriptError> {
        match target {
            Target::Name(name) => {
                self.vars.insert(name.clone(), value);
            }
            Target::Tuple(targets) => {
                let items = self.iterate(&value)?;
                match items.len().cmp(&targets.len()) {
                    Ordering::Less => {
                        return Err(runtime(
                            "ValueError",
                            format!(
                                "not enough values to unpack (expected {}, got {})",
                                targets.len(),
                                items.len()
                            ),
                        ));
                    }
                    Ordering::Greater => {
                        return Err(runtime(
                            "ValueError",
                            format!("too many values to unpack (expected {})", targets.len()),
                        ));
                    }
                    Ordering::Equal => {}
                }
                for (target, item) in targets.iter().zip(items) {
                    self.assign(target, item)?;
                }
            }
            Target::Subscript(obj, index) => {
                let container = self.eval(obj)?;
                let Index::Single(key) = index else {
                    return Err(runtime("TypeError", "slice assignment is not supported"));
                };
                let key = self.eval(key)?;
                self.set_item(&container, key, value)?;
            }
        }
        Ok(())
    }

    fn aug_assign(&mut self, target: &Target, op: BinOp, value: &Expr) -> Result<(), ScriptError> {
        match target {
            Target::Name(name) => {
                let current = self.lookup(name)?;
                let rhs = self.eval(value)?;
                // list += extends in place, like Python
                if let (Value::List(items), BinOp::Add) = (&current, op) {
                    let extra = self.iterate(&rhs)?;
                    self.check_items(items.borrow().len() + extra.len())?;
                    items.borrow_mut().extend(extra);
                    return Ok(());
                }
                let result = self.binary(&current, op, &rhs)?;
                self.vars.insert(name.clone(), result);
            }
            Target::Subscript(obj, index) => {
                let container = self.eval(obj)?;
                let Index::Single(key) = index else {
                    return Err(runtime("TypeError", "slice assignment is not supported"));
                };
                let key = self.eval(key)?;
                let current = self.get_item(&container, &key)?;
                let rhs = self.eval(value)?;
                let result = self.binary(&current, op, &rhs)?;
                self.set_item(&container, key, result)?;
            }
            Target::Tuple(_) => {
                return Err(runtime("SyntaxError", "augmented assignment to a tuple"));
            }
        }
        Ok(())
    }

    fn lookup(&self, name: &str) -> Result<Value, ScriptError> {
        if let Some(value) = self.vars.get(name) {
            return Ok(value.clone());
        }
        builtins::lookup(name)
            .map(Value::Builtin)
            .ok_or_else(|| runtime("NameError", format!("name '{}' is not defined", name)))
    }

    pub(super) fn eval(&mut self, expr: &Expr) -> Result<Value, ScriptError> {
        match expr {
            Expr::Const(c) => Ok(match c {
                Const::None => Value::None,
                Const::Bool(b) => Value::Bool(*b),
                Const::Int(n) => Value::Int(*n),
                Const::Float(f) => Value::Float(*f),
                Const::Str(s) => Value::str(s.as_str()),
            }),
            Expr::Name(name) => self.lookup(name),
            Expr::List(items) => {
                let values = items
                    .iter()
                    .map(|e| self.eval(e))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Value::list(values))
            }
            Expr::Tuple(items) => {
                let values = items
                    .iter()
                    .map(|e| self.eval(e))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Value::tuple(values))
            }
            Expr::Dict(pairs) => {
                let mut dict = Dict::default();
                for (k, v) in pairs {
                    let key = self.eval(k)?;
                    let value = self.eval(v)?;
                    dict.insert(key, value)?;
                }
                Ok(Value::dict(dict))
            }
            Expr::FString(parts) => {
                let mut out = String::new();
                for part in parts {
                    match part {
                        FPart::Lit(text) => out.push_str(text),
                        FPart::Expr(expr, spec) => {
                            let value = self.eval(expr)?;
                            match spec {
                                Some(spec) => out.push_str(&format_spec(&value, spec)?),
                                None => out.push_str(&value.to_str()?),
                            }
                        }
                    }
                    self.check_str(out.len())?;
                }
                Ok(Value::str(out))
            }
            Expr::Unary(op, operand) => {
                let value = self.eval(operand)?;
                unary(*op, &value)
            }
            Expr::Binary(left, op, right) => {
                let l = self.eval(left)?;
                let r = self.eval(right)?;
                self.binary(&l, *op, &r)
            }
            Expr::And(left, right) => {
                let l = self.eval(left)?;
                if !l.truthy() {
                    return Ok(l);
                }
                self.eval(right)
            }
            Expr::Or(left, right) => {
                let l = self.eval(left)?;
                if l.truthy() {
                    return Ok(l);
                }
                self.eval(right)
            }
            Expr::Compare(first, rest) => {
                let mut left = self.eval(first)?;
                for (op, right) in rest {
                    let right = self.eval(right)?;
                    if !self.compare(*op, &left, &right)? {
                        return Ok(Value::Bool(false));
                    }
                    left = right;
                }
                Ok(Value::Bool(true))
            }
            Expr::IfExp {
                cond,
                then,
                otherwise,
            } => {
                if self.eval(cond)?.truthy() {
                    self.eval(then)
                } else {
                    self.eval(otherwise)
                }
            }
            Expr::Call { func, args, kwargs } => {
                let args = args
                    .iter()
                    .map(|e| self.eval(e))
                    .collect::<Result<Vec<_>, _>>()?;
                let kwargs = kwargs
                    .iter()
                    .map(|(k, e)| Ok((k.clone(), self.eval(e)?)))
                    .collect::<Result<Vec<_>, ScriptError>>()?;

                if let Expr::Attribute(obj, method) = func.as_ref() {
                    let receiver = self.eval(obj)?;
                    return builtins::call_method(self, &receiver, method, args, kwargs);
                }
                match self.eval(func)? {
                    Value::Builtin(name) => builtins::call(self, name, args, kwargs),
                    other => Err(runtime(
                        "TypeError",
                        format!("'{}' object is not callable", other.type_name()),
                    )),
                }
            }
            Expr::Attribute(obj, attr) => {
                let value = self.eval(obj)?;
                Err(runtime(
                    "AttributeError",
                    format!(
                        "'{}.{}' can only be used as a method call",
                        value.type_name(),
                        attr
                    ),
                ))
            }
            Expr::Subscript(obj, index) => {
                let container = self.eval(obj)?;
                match index.as_ref() {
                    Index::Single(key) => {
                        let key = self.eval(key)?;
                        self.get_item(&container, &key)
                    }
                    Index::Slice(start, stop, step) => {
                        let start = self.eval_opt(start.as_ref())?;
                        let stop = self.eval_opt(stop.as_ref())?;
                        let step = self.eval_opt(step.as_ref())?;
                        slice(&container, start, stop, step)
                    }
                }
            }
            Expr::ListComp { elt, clauses } => {
                let mut out = CompOut::List(elt.as_ref(), Vec::new());
                self.comprehension(clauses, &mut out)?;
                match out {
                    CompOut::List(_, items) => Ok(Value::list(items)),
                    CompOut::Dict(..) => Ok(Value::None),
                }
            }
            Expr::DictComp {
                key,
                value,
                clauses,
            } => {
                let mut out = CompOut::Dict(key.as_ref(), value.as_ref(), Dict::default());
                self.comprehension(clauses, &mut out)?;
                match out {
                    CompOut::Dict(_, _, dict) => Ok(Value::dict(dict)),
                    CompOut::List(..) => Ok(Value::None),
                }
            }
        }
    }

    fn eval_opt(&mut self, expr: Option<&Expr>) -> Result<Option<Value>, ScriptError> {
        expr.map(|e| self.eval(e)).transpose()
    }

    /// Comprehension variables do not leak into the enclosing scope
    fn comprehension(&mut self, clauses: &[CompFor], out: &mut CompOut) -> Result<(), ScriptError> {
        let mut names = Vec::new();
        for clause in clauses {
            collect_names(&clause.target, &mut names);
        }
        let saved: Vec<(String, Option<Value>)> = names
            .into_iter()
            .map(|name| {
                let old = self.vars.get(&name).cloned();
                (name, old)
            })
            .collect();

        let result = self.comprehension_level(clauses, out);

        for (name, old) in saved {
            match old {
                Some(value) => self.vars.insert(name, value),
                None => self.vars.remove(&name),
            };
        }
        result
    }

    fn comprehension_level(
        &mut self,
        clauses: &[CompFor],
        out: &mut CompOut,
    ) -> Result<(), ScriptError> {
        let Some((clause, rest)) = clauses.split_first() else {
            match out {
                CompOut::List(elt, items) => {
                    let value = self.eval(*elt)?;
                    items.push(value);
                    self.check_items(items.len())?;
                }
                CompOut::Dict(key, value, dict) => {
                    let k = self.eval(*key)?;
                    let v = self.eval(*value)?;
                    dict.insert(k, v)?;
                    self.check_items(dict.len())?;
                }
            }
            return Ok(());
        };

        let iterable = self.eval(&clause.iter)?;
        'items: for item in self.iterate(&iterable)? {
            self.tick()?;
            self.assign(&clause.target, item)?;
            for cond in &clause.conds {
                if !self.eval(cond)?.truthy() {
                    continue 'items;
                }
            }
            self.comprehension_level(rest, out)?;
        }
        Ok(())
    }

    /// Materialize the items of an iterable
    pub(super) fn iterate(&self, value: &Value) -> Result<Vec<Value>, ScriptError> {
        match value {
            Value::List(items) => Ok(items.borrow().clone()),
            Value::Tuple(items) => Ok(items.to_vec()),
            Value::Str(s) => Ok(s.chars().map(|c| Value::str(c.to_string())).collect()),
            Value::Dict(dict) => Ok(dict.borrow().keys()),
            Value::Range { start, stop, step } => {
                self.check_items(range_len(*start, *stop, *step))?;
                Ok(RangeIter::new(*start, *stop, *step).map(Value::Int).collect())
            }
            other => Err(runtime(
                "TypeError",
                format!("'{}' object is not iterable", other.type_name()),
            )),
        }
    }

    pub(super) fn get_item(&self, container: &Value, key: &Value) -> Result<Value, ScriptError> {
        match container {
            Value::List(items) => {
                let items = items.borrow();
                let i = seq_index(key, items.len(), "list")?;
                Ok(items[i].clone())
            }
            Value::Tuple(items) => {
                let i = seq_index(key, items.len(), "tuple")?;
                Ok(items[i].clone())
            }
            Value::Str(s) => {
                let chars: Vec<char> = s.chars().collect();
                let i = seq_index(key, chars.len(), "string")?;
                Ok(Value::str(chars[i].to_string()))
            }
            Value::Range { start, stop, step } => {
                let len = range_len(*start, *stop, *step);
                let i = seq_index(key, len, "range")?;
                Ok(Value::Int(start + (i as i64) * step))
            }
            Value::Dict(dict) => dict
                .borrow()
                .get(key)?
                .ok_or_else(|| runtime("KeyError", key.repr().unwrap_or_default())),
            other => Err(runtime(
                "TypeError",
                format!("'{}' object is not subscriptable", other.type_name()),
            )),
        }
    }

    fn set_item(&self, container: &Value, key: Value, value: Value) -> Result<(), ScriptError> {
        match container {
            Value::List(items) => {
                let mut items = items.borrow_mut();
                let len = items.len();
                let i = seq_index(&key, len, "list assignment")?;
                items[i] = value;
                Ok(())
            }
            Value::Dict(dict) => {
                let mut dict = dict.borrow_mut();
                dict.insert(key, value)?;
                self.check_items(dict.len())
            }
            other => Err(runtime(
                "TypeError",
                format!(
                    "'{}' object does not support item assignment",
                    other.type_name()
                ),
            )),
        }
    }

    fn compare(&self, op: CmpOp, left: &Value, right: &Value) -> Result<bool, ScriptError> {
        Ok(match op {
            CmpOp::Eq => py_eq(left, right),
            CmpOp::Ne => !py_eq(left, right),
            CmpOp::Lt => py_cmp(left, right)? == Ordering::Less,
            CmpOp::Le => py_cmp(left, right)? != Ordering::Greater,
            CmpOp::Gt => py_cmp(left, right)? == Ordering::Greater,
            CmpOp::Ge => py_cmp(left, right)? != Ordering::Less,
            CmpOp::In => contains(right, left)?,
            CmpOp::NotIn => !contains(right, left)?,
            CmpOp::Is => identical(left, right),
            CmpOp::IsNot => !identical(left, right),
        })
    }

    pub(super) fn binary(&self, left: &Value, op: BinOp, right: &Value) -> Result<Value, ScriptError> {
        if let (Some(a), Some(b)) = (left.as_int(), right.as_int()) {
            return int_binary(a, op, b);
        }
        if left.is_number() && right.is_number() {
            let a = left.as_float().unwrap_or(f64::NAN);
            let b = right.as_float().unwrap_or(f64::NAN);
            return float_binary(a, op, b);
        }

        match (left, op, right) {
            (Value::Str(a), BinOp::Add, Value::Str(b)) => {
                self.check_str(a.len() + b.len())?;
                Ok(Value::str(format!("{}{}", a, b)))
            }
            (Value::List(a), BinOp::Add, Value::List(b)) => {
                let mut items = a.borrow().clone();
                items.extend(b.borrow().iter().cloned());
                self.check_items(items.len())?;
                Ok(Value::list(items))
            }
            (Value::Tuple(a), BinOp::Add, Value::Tuple(b)) => {
                self.check_items(a.len() + b.len())?;
                Ok(Value::tuple(a.iter().chain(b.iter()).cloned().collect()))
            }
            (Value::Str(s), BinOp::Mul, n) | (n, BinOp::Mul, Value::Str(s)) if n.as_int().is_some() => {
                let count = n.as_int().unwrap_or(0).max(0) as usize;
                self.check_str(s.len().saturating_mul(count))?;
                Ok(Value::str(s.repeat(count)))
            }
            (Value::List(items), BinOp::Mul, n) | (n, BinOp::Mul, Value::List(items))
                if n.as_int().is_some() =>
            {
                let count = n.as_int().unwrap_or(0).max(0) as usize;
                let items = items.borrow();
                self.check_items(items.len().saturating_mul(count))?;
                let mut out = Vec::with_capacity(items.len() * count);
                for _ in 0..count {
                    out.extend(items.iter().cloned());
                }
                Ok(Value::list(out))
            }
            _ => Err(runtime(
                "TypeError",
                format!(
                    "unsupported operand type(s) for {}: '{}' and '{}'",
                    op.symbol(),
                    left.type_name(),
                    right.type_name()
                ),
            )),
        }
    }
}

fn collect_names(target: &Target, out: &mut Vec<String>) {
    match target {
        Target::Name(name) => out.push(name.clone()),
        Target::Tuple(items) => items.iter().for_each(|t| collect_names(t, out)),
        Target::Subscript(..) => {}
    }
}

fn unary(op: UnaryOp, value: &Value) -> Result<Value, ScriptError> {
    match (op, value) {
        (UnaryOp::Not, v) => Ok(Value::Bool(!v.truthy())),
        (UnaryOp::Neg, Value::Float(f)) => Ok(Value::Float(-f)),
        (UnaryOp::Neg, v) if v.as_int().is_some() => v
            .as_int()
            .and_then(i64::checked_neg)
            .map(Value::Int)
            .ok_or_else(overflow),
        (UnaryOp::Pos, Value::Float(f)) => Ok(Value::Float(*f)),
        (UnaryOp::Pos, v) if v.as_int().is_some() => Ok(Value::Int(v.as_int().unwrap_or(0))),
        (_, v) => Err(runtime(
            "TypeError",
            format!("bad operand type for unary operator: '{}'", v.type_name()),
        )),
    }
}

fn overflow() -> ScriptError {
    runtime("OverflowError", "integer result out of range")
}

fn zero_division(what: &str) -> ScriptError {
    runtime("ZeroDivisionError", what.to_string())
}

/// Floor division with Python's rounding toward negative infinity
pub(super) fn floor_div(a: i64, b: i64) -> Option<i64> {
    let q = a.checked_div(b)?;
    if (a % b != 0) && ((a < 0) != (b < 0)) {
        Some(q - 1)
    } else {
        Some(q)
    }
}

/// Modulo whose sign follows the divisor
pub(super) fn py_mod(a: i64, b: i64) -> Option<i64> {
    let r = a.checked_rem(b)?;
    if r != 0 && ((r < 0) != (b < 0)) {
        Some(r + b)
    } else {
        Some(r)
    }
}

fn int_binary(a: i64, op: BinOp, b: i64) -> Result<Value, ScriptError> {
    match op {
        BinOp::Add => a.checked_add(b).map(Value::Int).ok_or_else(overflow),
        BinOp::Sub => a.checked_sub(b).map(Value::Int).ok_or_else(overflow),
        BinOp::Mul => a.checked_mul(b).map(Value::Int).ok_or_else(overflow),
        BinOp::Div => {
            if b == 0 {
                return Err(zero_division("division by zero"));
            }
            Ok(Value::Float(a as f64 / b as f64))
        }
        BinOp::FloorDiv => {
            if b == 0 {
                return Err(zero_division("integer division or modulo by zero"));
            }
            floor_div(a, b).map(Value::Int).ok_or_else(overflow)
        }
        BinOp::Mod => {
            if b == 0 {
                return Err(zero_division("integer division or modulo by zero"));
            }
            py_mod(a, b).map(Value::Int).ok_or_else(overflow)
        }
        BinOp::Pow => {
            if b < 0 {
                if a == 0 {
                    return Err(zero_division("0.0 cannot be raised to a negative power"));
                }
                return Ok(Value::Float((a as f64).powf(b as f64)));
            }
            let exp = u32::try_from(b).map_err(|_| overflow())?;
            a.checked_pow(exp).map(Value::Int).ok_or_else(overflow)
        }
    }
}

fn float_binary(a: f64, op: BinOp, b: f64) -> Result<Value, ScriptError> {
    let value = match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => {
            if b == 0.0 {
                return Err(zero_division("float division by zero"));
            }
            a / b
        }
        BinOp::FloorDiv => {
            if b == 0.0 {
                return Err(zero_division("float floor division by zero"));
            }
            (a / b).floor()
        }
        BinOp::Mod => {
            if b == 0.0 {
                return Err(zero_division("float modulo"));
            }
            a - b * (a / b).floor()
        }
        BinOp::Pow => {
            if a == 0.0 && b < 0.0 {
                return Err(zero_division("0.0 cannot be raised to a negative power"));
            }
            a.powf(b)
        }
    };
    Ok(Value::Float(value))
}

fn contains(container: &Value, item: &Value) -> Result<bool, ScriptError> {
    match container {
        Value::Str(s) => match item {
            Value::Str(needle) => Ok(s.contains(needle.as_ref())),
            other => Err(runtime(
                "TypeError",
                format!(
                    "'in <string>' requires string as left operand, not {}",
                    other.type_name()
                ),
            )),
        },
        Value::List(items) => Ok(items.borrow().iter().any(|v| py_eq(v, item))),
        Value::Tuple(items) => Ok(items.iter().any(|v| py_eq(v, item))),
        Value::Dict(dict) => dict.borrow().contains(item),
        Value::Range { start, stop, step } => Ok(item.as_int().is_some_and(|n| {
            let len = range_len(*start, *stop, *step);
            let offset = (n as i128) - (*start as i128);
            offset % (*step as i128) == 0
                && (0..len as i128).contains(&(offset / (*step as i128)))
        })),
        other => Err(runtime(
            "TypeError",
            format!("argument of type '{}' is not iterable", other.type_name()),
        )),
    }
}

/// `is`: identity for containers, equality of singletons and scalars
fn identical(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::None, Value::None) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::List(x), Value::List(y)) => std::rc::Rc::ptr_eq(x, y),
        (Value::Dict(x), Value::Dict(y)) => std::rc::Rc::ptr_eq(x, y),
        (Value::Int(x), Value::Int(y)) => x == y,
        (Value::Str(x), Value::Str(y)) => std::rc::Rc::ptr_eq(x, y) || x == y,
        _ => false,
    }
}

/// Normalize a possibly negative index into `0..len`
fn seq_index(key: &Value, len: usize, what: &str) -> Result<usize, ScriptError> {
    let Some(i) = key.as_int() else {
        return Err(runtime(
            "TypeError",
            format!("{} indices must be integers, not {}", what, key.type_name()),
        ));
    };
    let adjusted = if i < 0 { i + len as i64 } else { i };
    if adjusted < 0 || adjusted >= len as i64 {
        return Err(runtime("IndexError", format!("{} index out of range", what)));
    }
    Ok(adjusted as usize)
}

/// Slice bounds per Python's `slice.indices`
fn slice_indices(
    len: usize,
    start: Option<Value>,
    stop: Option<Value>,
    step: Option<Value>,
) -> Result<Vec<usize>, ScriptError> {
    let as_bound = |v: Option<Value>| -> Result<Option<i64>, ScriptError> {
        match v {
            None | Some(Value::None) => Ok(None),
            Some(v) => v.as_int().map(Some).ok_or_else(|| {
                runtime("TypeError", "slice indices must be integers or None")
            }),
        }
    };
    let step = as_bound(step)?.unwrap_or(1);
    if step == 0 {
        return Err(runtime("ValueError", "slice step cannot be zero"));
    }
    let len = len as i64;
    let clamp = |bound: i64, low: i64, high: i64| {
        let bound = if bound < 0 { bound + len } else { bound };
        bound.clamp(low, high)
    };
    let (start, stop) = if step > 0 {
        (
            as_bound(start)?.map_or(0, |b| clamp(b, 0, len)),
            as_bound(stop)?.map_or(len, |b| clamp(b, 0, len)),
        )
    } else {
        (
            as_bound(start)?.map_or(len - 1, |b| clamp(b, -1, len - 1)),
            as_bound(stop)?.map_or(-1, |b| clamp(b, -1, len - 1)),
        )
    };

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

fn slice(
    container: &Value,
    start: Option<Value>,
    stop: Option<Value>,
    step: Option<Value>,
) -> Result<Value, ScriptError> {
    match container {
        Value::List(items) => {
            let items = items.borrow();
            let picked = slice_indices(items.len(), start, stop, step)?;
            Ok(Value::list(picked.into_iter().map(|i| items[i].clone()).collect()))
        }
        Value::Tuple(items) => {
            let picked = slice_indices(items.len(), start, stop, step)?;
            Ok(Value::tuple(picked.into_iter().map(|i| items[i].clone()).collect()))
        }
        Value::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            let picked = slice_indices(chars.len(), start, stop, step)?;
            Ok(Value::str(picked.into_iter().map(|i| chars[i]).collect::<String>()))
        }
        Value::Range { start: s, stop: e, step: t } => {
            let values: Vec<i64> = RangeIter::new(*s, *e, *t).collect();
            let picked = slice_indices(values.len(), start, stop, step)?;
            Ok(Value::list(picked.into_iter().map(|i| Value::Int(values[i])).collect()))
        }
        other => Err(runtime(
            "TypeError",
            format!("'{}' object is not subscriptable", other.type_name()),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_python_division_semantics() {
        assert_eq!(floor_div(7, 2), Some(3));
        assert_eq!(floor_div(-7, 2), Some(-4));
        assert_eq!(floor_div(7, -2), Some(-4));
        assert_eq!(py_mod(-7, 3), Some(2));
        assert_eq!(py_mod(7, -3), Some(-2));
        assert_eq!(floor_div(i64::MIN, -1), None);
    }

    #[test]
    fn test_slice_indices() {
        assert_eq!(
            slice_indices(5, Some(Value::Int(1)), Some(Value::Int(-1)), None).unwrap(),
            vec![1, 2, 3]
        );
        assert_eq!(
            slice_indices(4, None, None, Some(Value::Int(-1))).unwrap(),
            vec![3, 2, 1, 0]
        );
        assert_eq!(
            slice_indices(5, None, None, Some(Value::Int(2))).unwrap(),
            vec![0, 2, 4]
        );
        assert!(slice_indices(5, Some(Value::Int(10)), None, None).unwrap().is_empty());
        assert!(slice_indices(3, None, None, Some(Value::Int(0))).is_err());
    }

    #[test]
    fn test_slice_with_huge_step_stops() {
        assert_eq!(
            slice_indices(5, Some(Value::Int(1)), None, Some(Value::Int(i64::MAX))).unwrap(),
            vec![1]
        );
        assert_eq!(
            slice_indices(5, None, None, Some(Value::Int(i64::MIN))).unwrap(),
            vec![4]
        );
    }

    #[test]
    fn test_range_membership() {
        let range = Value::Range {
            start: 0,
            stop: 10,
            step: 3,
        };
        assert!(contains(&range, &Value::Int(9)).unwrap());
        assert!(!contains(&range, &Value::Int(10)).unwrap());
        assert!(!contains(&range, &Value::Int(4)).unwrap());
    }
}
