//! Pre-execution safety screen shared by every sandbox backend

use regex::Regex;
use std::sync::LazyLock;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SafetyError {
    #[error("code is {size} bytes, limit is {limit}")]
    TooLarge { size: usize, limit: usize },

    #[error("forbidden construct '{construct}' on line {line}")]
    Forbidden { construct: &'static str, line: usize },
}

struct Rule {
    construct: &'static str,
    pattern: Regex,
}

fn rule(construct: &'static str, pattern: &str) -> Rule {
    Rule {
        construct,
        pattern: Regex::new(pattern).expect("safety pattern is valid"),
    }
}

static RULES: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    vec![
        rule("import", r"\bimport\b"),
        rule("__import__", r"__import__"),
        rule("eval", r"\beval\s*\("),
        rule("exec", r"\bexec\s*\("),
        rule("compile", r"\bcompile\s*\("),
        rule("open", r"\bopen\s*\("),
        rule("os", r"\bos\s*\."),
        rule("sys", r"\bsys\s*\."),
        rule("subprocess", r"\bsubprocess\b"),
        rule("dunder attribute", r"__[A-Za-z0-9_]+__"),
        rule("globals", r"\bglobals\s*\("),
        rule("locals", r"\blocals\s*\("),
        rule("getattr", r"\bgetattr\s*\("),
        rule("setattr", r"\bsetattr\s*\("),
        rule("delattr", r"\bdelattr\s*\("),
    ]
});

/// Reject oversized code and known escape hatches before any resources are
/// allocated
pub fn check_code(code: &str, max_bytes: usize) -> Result<(), SafetyError> {
    if code.len() > max_bytes {
        return Err(SafetyError::TooLarge {
            size: code.len(),
            limit: max_bytes,
        });
    }

    for (index, line) in code.lines().enumerate() {
        if let Some(rule) = RULES.iter().find(|rule| rule.pattern.is_match(line)) {
            return Err(SafetyError::Forbidden {
                construct: rule.construct,
                line: index + 1,
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_code_passes() {
        let code = "total = sum(inputs['nums'])\nresult = {'total': total, 'position': 1}";
        assert!(check_code(code, 10_000).is_ok());
    }

    #[test]
    fn test_dangerous_constructs_rejected() {
        for (code, construct) in [
            ("import os", "import"),
            ("x = 1\nresult = eval('1+1')", "eval"),
            ("f = open('/etc/passwd')", "open"),
            ("x = ().__class__", "dunder attribute"),
            ("getattr(x, 'y')", "getattr"),
        ] {
            match check_code(code, 10_000) {
                Err(SafetyError::Forbidden { construct: c, .. }) => assert_eq!(c, construct),
                other => panic!("expected rejection of {:?}, got {:?}", code, other),
            }
        }
    }

    #[test]
    fn test_reports_line() {
        let err = check_code("a = 1\nb = 2\nexec('x')", 10_000).unwrap_err();
        assert_eq!(
            err,
            SafetyError::Forbidden {
                construct: "exec",
                line: 3
            }
        );
    }

    #[test]
    fn test_size_limit() {
        let err = check_code("x = 1", 3).unwrap_err();
        assert_eq!(err, SafetyError::TooLarge { size: 5, limit: 3 });
    }
}
