//! Recursive-descent parser for the script subset
//!
//! Rejects, at compile time, everything the sandbox does not allow: imports,
//! function and class definitions, lambdas, private names and attributes,
//! and references to dynamic-evaluation builtins.

use super::ScriptError;
use super::ast::{BinOp, CmpOp, CompFor, Const, Expr, FPart, Index, Stmt, StmtKind, Target, UnaryOp};
use super::lexer::{Tok, Token, tokenize};

const KEYWORDS: &[&str] = &[
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class",
    "continue", "def", "del", "elif", "else", "except", "finally", "for", "from", "global", "if",
    "import", "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise", "return", "try",
    "while", "with", "yield",
];

/// Statements refused for security reasons rather than as unsupported syntax
const FORBIDDEN_STATEMENTS: &[&str] = &[
    "import", "from", "def", "class", "lambda", "global", "nonlocal", "async", "await",
];

const FORBIDDEN_NAMES: &[&str] = &[
    "eval", "exec", "compile", "open", "getattr", "setattr", "delattr", "globals", "locals",
    "vars", "input", "breakpoint", "type", "object", "memoryview", "help", "exit", "quit",
];

/// Names allowed despite the private prefix
const ALLOWED_PRIVATE: &[&str] = &["_", "_print"];

pub fn parse_program(source: &str) -> Result<Vec<Stmt>, ScriptError> {
    let mut parser = Parser::new(tokenize(source)?);
    parser.program()
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    loop_depth: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            pos: 0,
            loop_depth: 0,
        }
    }

    fn peek(&self) -> &Tok {
        self.tokens
            .get(self.pos)
            .map(|t| &t.tok)
            .unwrap_or(&Tok::Eof)
    }

    fn peek_next(&self) -> &Tok {
        self.tokens
            .get(self.pos + 1)
            .map(|t| &t.tok)
            .unwrap_or(&Tok::Eof)
    }

    fn line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|t| t.line)
            .unwrap_or(1)
    }

    fn advance(&mut self) -> Tok {
        let tok = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn syntax(&self, message: impl Into<String>) -> ScriptError {
        ScriptError::Syntax {
            line: self.line(),
            message: message.into(),
        }
    }

    fn forbidden(&self, message: impl Into<String>) -> ScriptError {
        ScriptError::Forbidden {
            line: self.line(),
            message: message.into(),
        }
    }

    fn is_op(&self, op: &str) -> bool {
        matches!(self.peek(), Tok::Op(o) if *o == op)
    }

    fn is_keyword(&self, kw: &str) -> bool {
        matches!(self.peek(), Tok::Name(n) if n == kw)
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if self.is_op(op) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_keyword(&mut self, kw: &str) -> bool {
        if self.is_keyword(kw) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_op(&mut self, op: &str) -> Result<(), ScriptError> {
        if self.eat_op(op) {
            Ok(())
        } else {
            Err(self.syntax(format!("expected '{}', found {}", op, describe(self.peek()))))
        }
    }

    fn expect_keyword(&mut self, kw: &str) -> Result<(), ScriptError> {
        if self.eat_keyword(kw) {
            Ok(())
        } else {
            Err(self.syntax(format!("expected '{}', found {}", kw, describe(self.peek()))))
        }
    }

    fn expect_line_end(&mut self) -> Result<(), ScriptError> {
        match self.peek() {
            Tok::Newline => {
                self.pos += 1;
                Ok(())
            }
            Tok::Eof => Ok(()),
            other => Err(self.syntax(format!("expected end of line, found {}", describe(other)))),
        }
    }

    fn program(&mut self) -> Result<Vec<Stmt>, ScriptError> {
        let mut body = Vec::new();
        loop {
            match self.peek() {
                Tok::Eof => return Ok(body),
                Tok::Newline => self.pos += 1,
                Tok::Indent => return Err(self.syntax("unexpected indent")),
                _ => body.extend(self.statement()?),
            }
        }
    }

    fn statement(&mut self) -> Result<Vec<Stmt>, ScriptError> {
        let line = self.line();
        let compound = match self.peek() {
            Tok::Name(n) if n == "if" => Some(self.if_statement()?),
            Tok::Name(n) if n == "for" => Some(self.for_statement()?),
            Tok::Name(n) if n == "while" => Some(self.while_statement()?),
            _ => None,
        };
        if let Some(kind) = compound {
            return Ok(vec![Stmt { line, kind }]);
        }
        self.simple_statements()
    }

    /// `a = 1; b = 2` up to the end of the line
    fn simple_statements(&mut self) -> Result<Vec<Stmt>, ScriptError> {
        let mut stmts = vec![self.simple_statement()?];
        while self.eat_op(";") {
            if matches!(self.peek(), Tok::Newline | Tok::Eof) {
                break;
            }
            stmts.push(self.simple_statement()?);
        }
        self.expect_line_end()?;
        Ok(stmts)
    }

    fn simple_statement(&mut self) -> Result<Stmt, ScriptError> {
        let line = self.line();

        if let Tok::Name(name) = self.peek() {
            let name = name.clone();
            if FORBIDDEN_STATEMENTS.contains(&name.as_str()) {
                return Err(self.forbidden(format!("'{}'", name)));
            }
            match name.as_str() {
                "pass" => {
                    self.pos += 1;
                    return Ok(Stmt {
                        line,
                        kind: StmtKind::Pass,
                    });
                }
                "break" | "continue" => {
                    if self.loop_depth == 0 {
                        return Err(self.syntax(format!("'{}' outside loop", name)));
                    }
                    self.pos += 1;
                    let kind = if name == "break" {
                        StmtKind::Break
                    } else {
                        StmtKind::Continue
                    };
                    return Ok(Stmt { line, kind });
                }
                "return" | "yield" | "try" | "except" | "finally" | "raise" | "with"
                | "del" | "assert" | "elif" | "else" => {
                    return Err(self.syntax(format!("'{}' is not supported", name)));
                }
                _ => {}
            }
        }

        let first = self.expr_list()?;

        if let Some(op) = self.augmented_op() {
            let target = to_target(first).map_err(|m| self.syntax(m))?;
            if matches!(target, Target::Tuple(_)) {
                return Err(self.syntax("augmented assignment to a tuple"));
            }
            let value = self.expr_list()?;
            return Ok(Stmt {
                line,
                kind: StmtKind::AugAssign(target, op, value),
            });
        }

        if !self.is_op("=") {
            return Ok(Stmt {
                line,
                kind: StmtKind::Expr(first),
            });
        }

        let mut exprs = vec![first];
        while self.eat_op("=") {
            exprs.push(self.expr_list()?);
        }
        let value = exprs.pop().ok_or_else(|| self.syntax("missing assignment value"))?;
        let targets = exprs
            .into_iter()
            .map(to_target)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|m| self.syntax(m))?;
        Ok(Stmt {
            line,
            kind: StmtKind::Assign(targets, value),
        })
    }

    fn augmented_op(&mut self) -> Option<BinOp> {
        let op = match self.peek() {
            Tok::Op("+=") => BinOp::Add,
            Tok::Op("-=") => BinOp::Sub,
            Tok::Op("*=") => BinOp::Mul,
            Tok::Op("/=") => BinOp::Div,
            Tok::Op("//=") => BinOp::FloorDiv,
            Tok::Op("%=") => BinOp::Mod,
            Tok::Op("**=") => BinOp::Pow,
            _ => return None,
        };
        self.pos += 1;
        Some(op)
    }

    fn block(&mut self) -> Result<Vec<Stmt>, ScriptError> {
        self.expect_op(":")?;
        if !matches!(self.peek(), Tok::Newline) {
            return self.simple_statements();
        }
        self.pos += 1;
        if !matches!(self.peek(), Tok::Indent) {
            return Err(self.syntax("expected an indented block"));
        }
        self.pos += 1;

        let mut body = Vec::new();
        loop {
            match self.peek() {
                Tok::Dedent => {
                    self.pos += 1;
                    return Ok(body);
                }
                Tok::Eof => return Ok(body),
                Tok::Newline => self.pos += 1,
                _ => body.extend(self.statement()?),
            }
        }
    }

    fn if_statement(&mut self) -> Result<StmtKind, ScriptError> {
        self.expect_keyword("if")?;
        let mut branches = Vec::new();
        let cond = self.expr()?;
        branches.push((cond, self.block()?));

        let mut orelse = Vec::new();
        loop {
            if self.eat_keyword("elif") {
                let cond = self.expr()?;
                branches.push((cond, self.block()?));
            } else if self.eat_keyword("else") {
                orelse = self.block()?;
                break;
            } else {
                break;
            }
        }
        Ok(StmtKind::If { branches, orelse })
    }

    fn for_statement(&mut self) -> Result<StmtKind, ScriptError> {
        self.expect_keyword("for")?;
        let target = self.target_list()?;
        self.expect_keyword("in")?;
        let iter = self.expr_list()?;
        self.loop_depth += 1;
        let body = self.block();
        self.loop_depth -= 1;
        Ok(StmtKind::For {
            target,
            iter,
            body: body?,
        })
    }

    fn while_statement(&mut self) -> Result<StmtKind, ScriptError> {
        self.expect_keyword("while")?;
        let cond = self.expr()?;
        self.loop_depth += 1;
        let body = self.block();
        self.loop_depth -= 1;
        Ok(StmtKind::While { cond, body: body? })
    }

    /// Loop and comprehension variables: `x`, `i, x`, `(k, v)`
    fn target_list(&mut self) -> Result<Target, ScriptError> {
        let mut items = vec![self.bitwise_level()?];
        while self.eat_op(",") {
            if self.is_keyword("in") {
                break;
            }
            items.push(self.bitwise_level()?);
        }
        let expr = if items.len() == 1 {
            items.remove(0)
        } else {
            Expr::Tuple(items)
        };
        to_target(expr).map_err(|m| self.syntax(m))
    }

    /// Expression, or a bare tuple when commas follow
    fn expr_list(&mut self) -> Result<Expr, ScriptError> {
        let first = self.expr()?;
        if !self.is_op(",") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.starts_expr() {
                items.push(self.expr()?);
            } else {
                break;
            }
        }
        Ok(Expr::Tuple(items))
    }

    fn starts_expr(&self) -> bool {
        match self.peek() {
            Tok::Name(n) => {
                !KEYWORDS.contains(&n.as_str())
                    || matches!(n.as_str(), "True" | "False" | "None" | "not")
            }
            Tok::Int(_) | Tok::Float(_) | Tok::Str(_) | Tok::FStr(_) => true,
            Tok::Op(op) => matches!(*op, "(" | "[" | "{" | "-" | "+"),
            _ => false,
        }
    }

    fn expr(&mut self) -> Result<Expr, ScriptError> {
        if self.is_keyword("lambda") {
            return Err(self.forbidden("'lambda'"));
        }
        let value = self.or_expr()?;
        if !self.is_keyword("if") {
            return Ok(value);
        }
        // a trailing `if` without `else` belongs to an enclosing comprehension
        let save = self.pos;
        self.pos += 1;
        let cond = self.or_expr()?;
        if !self.eat_keyword("else") {
            self.pos = save;
            return Ok(value);
        }
        let otherwise = self.expr()?;
        Ok(Expr::IfExp {
            cond: Box::new(cond),
            then: Box::new(value),
            otherwise: Box::new(otherwise),
        })
    }

    fn or_expr(&mut self) -> Result<Expr, ScriptError> {
        let mut left = self.and_expr()?;
        while self.eat_keyword("or") {
            let right = self.and_expr()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr, ScriptError> {
        let mut left = self.not_expr()?;
        while self.eat_keyword("and") {
            let right = self.not_expr()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn not_expr(&mut self) -> Result<Expr, ScriptError> {
        if self.eat_keyword("not") {
            let operand = self.not_expr()?;
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(operand)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, ScriptError> {
        let left = self.bitwise_level()?;
        let mut ops = Vec::new();
        while let Some(op) = self.comparison_op() {
            ops.push((op, self.bitwise_level()?));
        }
        if ops.is_empty() {
            Ok(left)
        } else {
            Ok(Expr::Compare(Box::new(left), ops))
        }
    }

    fn comparison_op(&mut self) -> Option<CmpOp> {
        let op = match self.peek() {
            Tok::Op("==") => CmpOp::Eq,
            Tok::Op("!=") => CmpOp::Ne,
            Tok::Op("<") => CmpOp::Lt,
            Tok::Op("<=") => CmpOp::Le,
            Tok::Op(">") => CmpOp::Gt,
            Tok::Op(">=") => CmpOp::Ge,
            Tok::Name(n) if n == "in" => CmpOp::In,
            Tok::Name(n) if n == "not" && matches!(self.peek_next(), Tok::Name(m) if m == "in") => {
                self.pos += 2;
                return Some(CmpOp::NotIn);
            }
            Tok::Name(n) if n == "is" => {
                self.pos += 1;
                if self.eat_keyword("not") {
                    return Some(CmpOp::IsNot);
                }
                return Some(CmpOp::Is);
            }
            _ => return None,
        };
        self.pos += 1;
        Some(op)
    }

    /// Operand level of comparisons (no bitwise operators in the subset)
    fn bitwise_level(&mut self) -> Result<Expr, ScriptError> {
        self.arith()
    }

    fn arith(&mut self) -> Result<Expr, ScriptError> {
        let mut left = self.term()?;
        loop {
            let op = if self.eat_op("+") {
                BinOp::Add
            } else if self.eat_op("-") {
                BinOp::Sub
            } else {
                return Ok(left);
            };
            let right = self.term()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
    }

    fn term(&mut self) -> Result<Expr, ScriptError> {
        let mut left = self.factor()?;
        loop {
            let op = if self.eat_op("*") {
                BinOp::Mul
            } else if self.eat_op("/") {
                BinOp::Div
            } else if self.eat_op("//") {
                BinOp::FloorDiv
            } else if self.eat_op("%") {
                BinOp::Mod
            } else {
                return Ok(left);
            };
            let right = self.factor()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
    }

    fn factor(&mut self) -> Result<Expr, ScriptError> {
        if self.eat_op("-") {
            return Ok(Expr::Unary(UnaryOp::Neg, Box::new(self.factor()?)));
        }
        if self.eat_op("+") {
            return Ok(Expr::Unary(UnaryOp::Pos, Box::new(self.factor()?)));
        }
        self.power()
    }

    fn power(&mut self) -> Result<Expr, ScriptError> {
        let base = self.postfix()?;
        if self.eat_op("**") {
            // right-associative, binds tighter than unary minus on the left
            let exponent = self.factor()?;
            return Ok(Expr::Binary(Box::new(base), BinOp::Pow, Box::new(exponent)));
        }
        Ok(base)
    }

    fn postfix(&mut self) -> Result<Expr, ScriptError> {
        let mut expr = self.atom()?;
        loop {
            if self.eat_op("(") {
                let (args, kwargs) = self.call_args()?;
                expr = Expr::Call {
                    func: Box::new(expr),
                    args,
                    kwargs,
                };
            } else if self.eat_op("[") {
                let index = self.subscript()?;
                self.expect_op("]")?;
                expr = Expr::Subscript(Box::new(expr), Box::new(index));
            } else if self.eat_op(".") {
                let Tok::Name(attr) = self.advance() else {
                    return Err(self.syntax("expected attribute name after '.'"));
                };
                if attr.starts_with('_') {
                    return Err(self.forbidden(format!("private attribute '{}'", attr)));
                }
                expr = Expr::Attribute(Box::new(expr), attr);
            } else {
                return Ok(expr);
            }
        }
    }

    fn call_args(&mut self) -> Result<(Vec<Expr>, Vec<(String, Expr)>), ScriptError> {
        let mut args = Vec::new();
        let mut kwargs: Vec<(String, Expr)> = Vec::new();

        while !self.eat_op(")") {
            if self.is_op("*") || self.is_op("**") {
                return Err(self.syntax("argument unpacking is not supported"));
            }
            let keyword = match (self.peek(), self.peek_next()) {
                (Tok::Name(name), Tok::Op("=")) => Some(name.clone()),
                _ => None,
            };
            if let Some(name) = keyword {
                self.pos += 2;
                kwargs.push((name, self.expr()?));
            } else {
                if !kwargs.is_empty() {
                    return Err(self.syntax("positional argument follows keyword argument"));
                }
                let arg = self.expr()?;
                if self.is_keyword("for") {
                    // generator argument: sum(x for x in xs)
                    let clauses = self.comprehension_clauses()?;
                    args.push(Expr::ListComp {
                        elt: Box::new(arg),
                        clauses,
                    });
                } else {
                    args.push(arg);
                }
            }
            if !self.eat_op(",") {
                self.expect_op(")")?;
                break;
            }
        }
        Ok((args, kwargs))
    }

    fn subscript(&mut self) -> Result<Index, ScriptError> {
        let start = if self.is_op(":") {
            None
        } else {
            Some(self.expr()?)
        };
        if !self.eat_op(":") {
            return start
                .map(Index::Single)
                .ok_or_else(|| self.syntax("empty subscript"));
        }
        let stop = if self.is_op(":") || self.is_op("]") {
            None
        } else {
            Some(self.expr()?)
        };
        let step = if self.eat_op(":") && !self.is_op("]") {
            Some(self.expr()?)
        } else {
            None
        };
        Ok(Index::Slice(start, stop, step))
    }

    fn comprehension_clauses(&mut self) -> Result<Vec<CompFor>, ScriptError> {
        let mut clauses = Vec::new();
        while self.eat_keyword("for") {
            let target = self.target_list()?;
            self.expect_keyword("in")?;
            let iter = self.or_expr()?;
            let mut conds = Vec::new();
            while self.eat_keyword("if") {
                conds.push(self.or_expr()?);
            }
            clauses.push(CompFor {
                target,
                iter,
                conds,
            });
        }
        Ok(clauses)
    }

    fn atom(&mut self) -> Result<Expr, ScriptError> {
        match self.advance() {
            Tok::Int(n) => Ok(Expr::Const(Const::Int(n))),
            Tok::Float(f) => Ok(Expr::Const(Const::Float(f))),
            Tok::Str(s) => {
                // implicit concatenation of adjacent literals
                let mut text = s;
                while let Tok::Str(next) = self.peek() {
                    text.push_str(next);
                    self.pos += 1;
                }
                Ok(Expr::Const(Const::Str(text)))
            }
            Tok::FStr(body) => {
                let line = self.line();
                Ok(Expr::FString(parse_fstring(&body, line)?))
            }
            Tok::Name(name) => self.name_atom(name),
            Tok::Op("(") => self.paren(),
            Tok::Op("[") => self.list_display(),
            Tok::Op("{") => self.dict_display(),
            other => {
                self.pos = self.pos.saturating_sub(1);
                Err(self.syntax(format!("unexpected {}", describe(&other))))
            }
        }
    }

    fn name_atom(&mut self, name: String) -> Result<Expr, ScriptError> {
        match name.as_str() {
            "True" => return Ok(Expr::Const(Const::Bool(true))),
            "False" => return Ok(Expr::Const(Const::Bool(false))),
            "None" => return Ok(Expr::Const(Const::None)),
            _ => {}
        }
        self.pos -= 1;
        if FORBIDDEN_STATEMENTS.contains(&name.as_str()) {
            return Err(self.forbidden(format!("'{}'", name)));
        }
        if KEYWORDS.contains(&name.as_str()) {
            return Err(self.syntax(format!("unexpected keyword '{}'", name)));
        }
        if name.starts_with('_') && !ALLOWED_PRIVATE.contains(&name.as_str()) {
            return Err(self.forbidden(format!("private name '{}'", name)));
        }
        if FORBIDDEN_NAMES.contains(&name.as_str()) {
            return Err(self.forbidden(format!("'{}'", name)));
        }
        self.pos += 1;
        Ok(Expr::Name(name))
    }

    fn paren(&mut self) -> Result<Expr, ScriptError> {
        if self.eat_op(")") {
            return Ok(Expr::Tuple(Vec::new()));
        }
        let first = self.expr()?;
        if self.is_keyword("for") {
            let clauses = self.comprehension_clauses()?;
            self.expect_op(")")?;
            return Ok(Expr::ListComp {
                elt: Box::new(first),
                clauses,
            });
        }
        if self.eat_op(")") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.is_op(")") {
                break;
            }
            items.push(self.expr()?);
        }
        self.expect_op(")")?;
        Ok(Expr::Tuple(items))
    }

    fn list_display(&mut self) -> Result<Expr, ScriptError> {
        if self.eat_op("]") {
            return Ok(Expr::List(Vec::new()));
        }
        let first = self.expr()?;
        if self.is_keyword("for") {
            let clauses = self.comprehension_clauses()?;
            self.expect_op("]")?;
            return Ok(Expr::ListComp {
                elt: Box::new(first),
                clauses,
            });
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.is_op("]") {
                break;
            }
            items.push(self.expr()?);
        }
        self.expect_op("]")?;
        Ok(Expr::List(items))
    }

    fn dict_display(&mut self) -> Result<Expr, ScriptError> {
        if self.eat_op("}") {
            return Ok(Expr::Dict(Vec::new()));
        }
        let key = self.expr()?;
        if !self.eat_op(":") {
            return Err(self.syntax("set literals are not supported"));
        }
        let value = self.expr()?;
        if self.is_keyword("for") {
            let clauses = self.comprehension_clauses()?;
            self.expect_op("}")?;
            return Ok(Expr::DictComp {
                key: Box::new(key),
                value: Box::new(value),
                clauses,
            });
        }
        let mut pairs = vec![(key, value)];
        while self.eat_op(",") {
            if self.is_op("}") {
                break;
            }
            let key = self.expr()?;
            self.expect_op(":")?;
            pairs.push((key, self.expr()?));
        }
        self.expect_op("}")?;
        Ok(Expr::Dict(pairs))
    }
}

fn to_target(expr: Expr) -> Result<Target, String> {
    match expr {
        Expr::Name(name) => Ok(Target::Name(name)),
        Expr::Tuple(items) | Expr::List(items) => Ok(Target::Tuple(
            items.into_iter().map(to_target).collect::<Result<_, _>>()?,
        )),
        Expr::Subscript(obj, index) => Ok(Target::Subscript(*obj, *index)),
        Expr::Attribute(_, attr) => Err(format!("cannot assign to attribute '{}'", attr)),
        _ => Err("cannot assign to expression".to_string()),
    }
}

fn describe(tok: &Tok) -> String {
    match tok {
        Tok::Name(n) => format!("'{}'", n),
        Tok::Int(n) => format!("'{}'", n),
        Tok::Float(f) => format!("'{}'", f),
        Tok::Str(_) | Tok::FStr(_) => "string".to_string(),
        Tok::Op(op) => format!("'{}'", op),
        Tok::Newline => "end of line".to_string(),
        Tok::Indent => "indent".to_string(),
        Tok::Dedent => "dedent".to_string(),
        Tok::Eof => "end of input".to_string(),
    }
}

/// Split an f-string body into literal text and embedded expressions
fn parse_fstring(body: &str, line: usize) -> Result<Vec<FPart>, ScriptError> {
    let error = |message: &str| ScriptError::Syntax {
        line,
        message: format!("f-string: {}", message),
    };

    let chars: Vec<char> = body.chars().collect();
    let mut parts = Vec::new();
    let mut literal = String::new();
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '{' if chars.get(i + 1) == Some(&'{') => {
                literal.push('{');
                i += 2;
            }
            '}' if chars.get(i + 1) == Some(&'}') => {
                literal.push('}');
                i += 2;
            }
            '}' => return Err(error("single '}' is not allowed")),
            '{' => {
                let start = i + 1;
                let mut depth = 0usize;
                let mut quote: Option<char> = None;
                let mut spec_at = None;
                let mut end = None;
                for (j, &c) in chars.iter().enumerate().skip(start) {
                    match (quote, c) {
                        (Some(q), c) if c == q => quote = None,
                        (Some(_), _) => {}
                        (None, '\'' | '"') => quote = Some(c),
                        (None, '(' | '[' | '{') => depth += 1,
                        (None, ')' | ']') => depth = depth.saturating_sub(1),
                        (None, '}') if depth > 0 => depth -= 1,
                        (None, '}') => {
                            end = Some(j);
                            break;
                        }
                        (None, ':') if depth == 0 && spec_at.is_none() => spec_at = Some(j),
                        (None, '!') if depth == 0 && chars.get(j + 1) != Some(&'=') => {
                            return Err(error("conversions are not supported"));
                        }
                        _ => {}
                    }
                }
                let end = end.ok_or_else(|| error("expecting '}'"))?;
                let expr_end = spec_at.unwrap_or(end);
                let source: String = chars[start..expr_end].iter().collect();
                if source.trim().is_empty() {
                    return Err(error("empty expression"));
                }
                let spec = spec_at.map(|s| chars[s + 1..end].iter().collect::<String>());

                let mut parser = Parser::new(tokenize(source.trim()).map_err(|e| e.at(line))?);
                let expr = parser.expr().map_err(|e| e.at(line))?;
                if !matches!(parser.peek(), Tok::Newline | Tok::Eof) {
                    return Err(error("invalid expression"));
                }

                if !literal.is_empty() {
                    parts.push(FPart::Lit(std::mem::take(&mut literal)));
                }
                parts.push(FPart::Expr(expr, spec));
                i = end + 1;
            }
            c => {
                literal.push(c);
                i += 1;
            }
        }
    }

    if !literal.is_empty() {
        parts.push(FPart::Lit(literal));
    }
    Ok(parts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(source: &str) -> Vec<Stmt> {
        parse_program(source).unwrap()
    }

    #[test]
    fn test_assignment_and_precedence() {
        let body = parse("x = 1 + 2 * 3");
        let StmtKind::Assign(targets, value) = &body[0].kind else {
            panic!("expected assignment");
        };
        assert_eq!(targets, &vec![Target::Name("x".into())]);
        let Expr::Binary(_, BinOp::Add, right) = value else {
            panic!("expected addition at the top");
        };
        assert!(matches!(**right, Expr::Binary(_, BinOp::Mul, _)));
    }

    #[test]
    fn test_compound_statements() {
        let body = parse(
            "total = 0\nfor i, n in enumerate(nums):\n    if n > 2:\n        total += n\n    elif n == 0:\n        continue\n    else:\n        pass\nresult = total\n",
        );
        assert_eq!(body.len(), 3);
        assert!(matches!(body[1].kind, StmtKind::For { .. }));
        assert_eq!(body[2].line, 9);
    }

    #[test]
    fn test_comprehensions_and_generators() {
        parse("evens = [x * 2 for x in range(10) if x % 2 == 0]");
        parse("lookup = {k: v for k, v in pairs}");
        parse("total = sum(x for x in nums)");
        parse("label = 'big' if n > 10 else 'small'");
    }

    #[test]
    fn test_slices() {
        let body = parse("y = xs[1:-1:2]\nz = xs[::-1]\nw = xs[:3]");
        assert_eq!(body.len(), 3);
    }

    #[test]
    fn test_fstring_with_spec() {
        let body = parse("s = f'{name}: {score:.2f} {{literal}}'");
        let StmtKind::Assign(_, Expr::FString(parts)) = &body[0].kind else {
            panic!("expected f-string");
        };
        assert_eq!(parts.len(), 4);
        assert!(matches!(&parts[2], FPart::Expr(_, Some(spec)) if spec == ".2f"));
        assert_eq!(parts[3], FPart::Lit(" {literal}".into()));
    }

    #[test]
    fn test_forbidden_constructs() {
        for source in [
            "import os",
            "from os import path",
            "def f():\n    pass",
            "class A:\n    pass",
            "f = lambda x: x",
            "x = _secret",
            "x = y._private",
            "x = eval('1')",
            "x = open('f')",
            "x = getattr(y, 'z')",
        ] {
            assert!(
                matches!(parse_program(source), Err(ScriptError::Forbidden { .. })),
                "{} should be forbidden",
                source
            );
        }
    }

    #[test]
    fn test_print_alias_and_underscore_allowed() {
        parse("_print('hi')\nfor _ in range(3):\n    pass");
    }

    #[test]
    fn test_syntax_errors() {
        assert!(matches!(
            parse_program("break"),
            Err(ScriptError::Syntax { .. })
        ));
        assert!(matches!(
            parse_program("x = (1, 2"),
            Err(ScriptError::Syntax { .. })
        ));
        assert!(matches!(
            parse_program("1 = x"),
            Err(ScriptError::Syntax { .. })
        ));
        assert!(matches!(
            parse_program("return 5"),
            Err(ScriptError::Syntax { .. })
        ));
    }
}
