//! Tokenizer with indentation tracking

use super::ScriptError;

#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    Name(String),
    Int(i64),
    Float(f64),
    Str(String),
    /// f-string body with escapes already processed
    FStr(String),
    Op(&'static str),
    Newline,
    Indent,
    Dedent,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub tok: Tok,
    pub line: usize,
}

/// Longest operators first so `**=` wins over `**` and `*`
const OPERATORS: &[&str] = &[
    "**=", "//=", "**", "//", "==", "!=", "<=", ">=", "+=", "-=", "*=", "/=", "%=", "+", "-",
    "*", "/", "%", "<", ">", "=", "(", ")", "[", "]", "{", "}", ",", ":", ".", ";",
];

const TAB_WIDTH: usize = 8;

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    /// Open bracket depth; newlines inside brackets are ignored
    depth: usize,
    indents: Vec<usize>,
    tokens: Vec<Token>,
}

pub fn tokenize(source: &str) -> Result<Vec<Token>, ScriptError> {
    let mut lexer = Lexer {
        chars: source.chars().collect(),
        pos: 0,
        line: 1,
        depth: 0,
        indents: vec![0],
        tokens: Vec::new(),
    };
    lexer.run()?;
    Ok(lexer.tokens)
}

impl Lexer {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn push(&mut self, tok: Tok) {
        self.tokens.push(Token {
            tok,
            line: self.line,
        });
    }

    fn error(&self, message: impl Into<String>) -> ScriptError {
        ScriptError::Syntax {
            line: self.line,
            message: message.into(),
        }
    }

    fn run(&mut self) -> Result<(), ScriptError> {
        let mut at_line_start = true;

        while self.pos < self.chars.len() {
            if at_line_start && self.depth == 0 {
                if !self.indentation()? {
                    continue;
                }
                at_line_start = false;
            }

            let Some(c) = self.peek() else { break };
            match c {
                '\n' => {
                    self.pos += 1;
                    if self.depth == 0 {
                        self.end_line();
                        at_line_start = true;
                    }
                    self.line += 1;
                }
                ' ' | '\t' | '\r' => self.pos += 1,
                '#' => self.skip_comment(),
                '\\' if self.peek_at(1) == Some('\n') => {
                    self.pos += 2;
                    self.line += 1;
                }
                '"' | '\'' => {
                    let text = self.string(c, false)?;
                    self.push(Tok::Str(text));
                }
                c if c.is_ascii_digit() => self.number()?,
                '.' if self.peek_at(1).is_some_and(|d| d.is_ascii_digit()) => self.number()?,
                c if c.is_alphabetic() || c == '_' => self.name()?,
                _ => self.operator()?,
            }
        }

        self.end_line();
        while self.indents.len() > 1 {
            self.indents.pop();
            self.push(Tok::Dedent);
        }
        self.push(Tok::Eof);
        Ok(())
    }

    /// Measure leading whitespace and emit INDENT/DEDENT. Returns `false`
    /// when the line is blank or a comment and was consumed.
    fn indentation(&mut self) -> Result<bool, ScriptError> {
        let mut width = 0;
        while let Some(c) = self.peek() {
            match c {
                ' ' => width += 1,
                '\t' => width = (width / TAB_WIDTH + 1) * TAB_WIDTH,
                '\r' => {}
                _ => break,
            }
            self.pos += 1;
        }

        match self.peek() {
            None => return Ok(false),
            Some('\n') => {
                self.pos += 1;
                self.line += 1;
                return Ok(false);
            }
            Some('#') => {
                self.skip_comment();
                if self.peek() == Some('\n') {
                    self.pos += 1;
                    self.line += 1;
                }
                return Ok(false);
            }
            _ => {}
        }

        let current = self.indents.last().copied().unwrap_or(0);
        if width > current {
            self.indents.push(width);
            self.push(Tok::Indent);
        } else {
            while width < self.indents.last().copied().unwrap_or(0) {
                self.indents.pop();
                self.push(Tok::Dedent);
            }
            if width != self.indents.last().copied().unwrap_or(0) {
                return Err(self.error("unindent does not match any outer indentation level"));
            }
        }
        Ok(true)
    }

    fn end_line(&mut self) {
        let needs_newline = self
            .tokens
            .last()
            .is_some_and(|t| !matches!(t.tok, Tok::Newline | Tok::Indent | Tok::Dedent));
        if needs_newline {
            self.push(Tok::Newline);
        }
    }

    fn skip_comment(&mut self) {
        while self.peek().is_some_and(|c| c != '\n') {
            self.pos += 1;
        }
    }

    fn name(&mut self) -> Result<(), ScriptError> {
        let start = self.pos;
        while self.peek().is_some_and(|c| c.is_alphanumeric() || c == '_') {
            self.pos += 1;
        }
        let ident: String = self.chars[start..self.pos].iter().collect();

        if let Some(quote @ ('"' | '\'')) = self.peek() {
            let prefix = ident.to_ascii_lowercase();
            match prefix.as_str() {
                "f" => {
                    let text = self.string(quote, false)?;
                    self.push(Tok::FStr(text));
                    return Ok(());
                }
                "r" => {
                    let text = self.string(quote, true)?;
                    self.push(Tok::Str(text));
                    return Ok(());
                }
                "rf" | "fr" | "b" | "rb" | "br" | "u" => {
                    return Err(self.error(format!("unsupported string prefix '{}'", ident)));
                }
                _ => {}
            }
        }

        self.push(Tok::Name(ident));
        Ok(())
    }

    fn number(&mut self) -> Result<(), ScriptError> {
        let start = self.pos;
        let mut is_float = false;

        while let Some(c) = self.peek() {
            if c.is_ascii_digit() || c == '_' {
                self.pos += 1;
            } else if c == '.' && !is_float {
                is_float = true;
                self.pos += 1;
            } else if c == 'e' || c == 'E' {
                is_float = true;
                self.pos += 1;
                if let Some('+' | '-') = self.peek() {
                    self.pos += 1;
                }
            } else {
                break;
            }
        }

        let text: String = self.chars[start..self.pos]
            .iter()
            .filter(|&&c| c != '_')
            .collect();
        if is_float {
            let value = text
                .parse::<f64>()
                .map_err(|_| self.error(format!("invalid number '{}'", text)))?;
            self.push(Tok::Float(value));
        } else {
            let value = text
                .parse::<i64>()
                .map_err(|_| self.error(format!("integer literal '{}' is too large", text)))?;
            self.push(Tok::Int(value));
        }
        Ok(())
    }

    fn operator(&mut self) -> Result<(), ScriptError> {
        for op in OPERATORS {
            let matches = op
                .chars()
                .enumerate()
                .all(|(i, c)| self.peek_at(i) == Some(c));
            if matches {
                self.pos += op.chars().count();
                match *op {
                    "(" | "[" | "{" => self.depth += 1,
                    ")" | "]" | "}" => self.depth = self.depth.saturating_sub(1),
                    _ => {}
                }
                self.push(Tok::Op(op));
                return Ok(());
            }
        }
        let c = self.peek().unwrap_or(' ');
        Err(self.error(format!("unexpected character '{}'", c)))
    }

    /// Read a quoted string starting at the opening quote
    fn string(&mut self, quote: char, raw: bool) -> Result<String, ScriptError> {
        let triple = self.peek_at(1) == Some(quote) && self.peek_at(2) == Some(quote);
        self.pos += if triple { 3 } else { 1 };
        let mut out = String::new();

        loop {
            let Some(c) = self.peek() else {
                return Err(self.error("unterminated string literal"));
            };

            if c == quote {
                if !triple {
                    self.pos += 1;
                    return Ok(out);
                }
                if self.peek_at(1) == Some(quote) && self.peek_at(2) == Some(quote) {
                    self.pos += 3;
                    return Ok(out);
                }
            }

            match c {
                '\n' if !triple => return Err(self.error("unterminated string literal")),
                '\n' => {
                    self.line += 1;
                    out.push(c);
                    self.pos += 1;
                }
                '\\' if raw => {
                    out.push(c);
                    if let Some(next) = self.peek_at(1) {
                        out.push(next);
                        self.pos += 1;
                    }
                    self.pos += 1;
                }
                '\\' => {
                    let next = self
                        .peek_at(1)
                        .ok_or_else(|| self.error("unterminated string literal"))?;
                    self.pos += 2;
                    match next {
                        'n' => out.push('\n'),
                        't' => out.push('\t'),
                        'r' => out.push('\r'),
                        '0' => out.push('\0'),
                        '\\' => out.push('\\'),
                        '\'' => out.push('\''),
                        '"' => out.push('"'),
                        '\n' => self.line += 1,
                        other => {
                            out.push('\\');
                            out.push(other);
                        }
                    }
                }
                _ => {
                    out.push(c);
                    self.pos += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(source: &str) -> Vec<Tok> {
        tokenize(source).unwrap().into_iter().map(|t| t.tok).collect()
    }

    #[test]
    fn test_simple_assignment() {
        assert_eq!(
            toks("x = 1 + 2.5"),
            vec![
                Tok::Name("x".into()),
                Tok::Op("="),
                Tok::Int(1),
                Tok::Op("+"),
                Tok::Float(2.5),
                Tok::Newline,
                Tok::Eof
            ]
        );
    }

    #[test]
    fn test_indentation() {
        let tokens = toks("if x:\n    y = 1\n\n    # note\nz = 2\n");
        assert!(tokens.contains(&Tok::Indent));
        let dedent = tokens.iter().position(|t| *t == Tok::Dedent).unwrap();
        assert_eq!(tokens[dedent + 1], Tok::Name("z".into()));
    }

    #[test]
    fn test_brackets_join_lines() {
        let tokens = toks("x = [\n  1,\n  2,\n]\n");
        assert_eq!(tokens.iter().filter(|t| **t == Tok::Newline).count(), 1);
        assert!(!tokens.contains(&Tok::Indent));
    }

    #[test]
    fn test_strings() {
        assert_eq!(toks("'a\\nb'")[0], Tok::Str("a\nb".into()));
        assert_eq!(toks("r'a\\nb'")[0], Tok::Str("a\\nb".into()));
        assert_eq!(toks("f'{x}!'")[0], Tok::FStr("{x}!".into()));
        assert_eq!(toks("\"\"\"one\ntwo\"\"\"")[0], Tok::Str("one\ntwo".into()));
    }

    #[test]
    fn test_operators_longest_match() {
        let tokens = toks("a **= 2 // 3");
        assert!(tokens.contains(&Tok::Op("**=")));
        assert!(tokens.contains(&Tok::Op("//")));
    }

    #[test]
    fn test_bad_dedent() {
        assert!(matches!(
            tokenize("if x:\n    y = 1\n  z = 2\n"),
            Err(ScriptError::Syntax { line: 3, .. })
        ));
    }
}
