//! Type string parsing and value checking

use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Errors raised while parsing a type string
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TypeParseError {
    #[error("empty type string")]
    Empty,

    #[error("unknown type '{token}' in '{input}'")]
    UnknownType { token: String, input: String },

    #[error("malformed brackets in '{input}'")]
    MalformedBrackets { input: String },

    #[error("'{name}' expects {expected} type argument(s), got {actual} in '{input}'")]
    ArgumentCount {
        name: String,
        expected: usize,
        actual: usize,
        input: String,
    },

    #[error("dict key type must be str, int, float or bool, got '{key}' in '{input}'")]
    InvalidKeyType { key: String, input: String },

    #[error("'{name}' does not take type arguments in '{input}'")]
    UnexpectedArguments { name: String, input: String },
}

/// Parsed field type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeExpr {
    Str,
    Int,
    Float,
    Bool,
    /// `list` or `list[T]`
    List(Option<Box<TypeExpr>>),
    /// `dict` or `dict[K, V]`
    Dict(Option<(Box<TypeExpr>, Box<TypeExpr>)>),
    /// Nested record; the shape lives in the field's nested schema
    Object,
}

impl TypeExpr {
    pub fn is_object(&self) -> bool {
        matches!(self, TypeExpr::Object)
    }

    pub fn is_list(&self) -> bool {
        matches!(self, TypeExpr::List(_))
    }

    fn is_scalar(&self) -> bool {
        matches!(
            self,
            TypeExpr::Str | TypeExpr::Int | TypeExpr::Float | TypeExpr::Bool
        )
    }

    /// Check a JSON value against this type.
    ///
    /// `int` and `float` are distinct: `1` is not a float and `1.0` is not an
    /// int. `object` only checks that the value is a JSON object; the nested
    /// shape is checked by the state factory. Null is never accepted here,
    /// optionality is decided by the field, not the type.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            TypeExpr::Str => value.is_string(),
            TypeExpr::Int => value.is_i64() || value.is_u64(),
            TypeExpr::Float => value.is_f64(),
            TypeExpr::Bool => value.is_boolean(),
            TypeExpr::List(None) => value.is_array(),
            TypeExpr::List(Some(item)) => value
                .as_array()
                .is_some_and(|items| items.iter().all(|v| item.accepts(v))),
            TypeExpr::Dict(None) | TypeExpr::Object => value.is_object(),
            TypeExpr::Dict(Some((key, val))) => value.as_object().is_some_and(|map| {
                map.iter()
                    .all(|(k, v)| key.accepts_key(k) && val.accepts(v))
            }),
        }
    }

    /// JSON object keys are always strings; typed keys must parse as the type
    fn accepts_key(&self, key: &str) -> bool {
        match self {
            TypeExpr::Str => true,
            TypeExpr::Int => key.parse::<i64>().is_ok(),
            TypeExpr::Float => key.parse::<f64>().is_ok(),
            TypeExpr::Bool => key == "true" || key == "false",
            _ => false,
        }
    }

    /// Short name used in error messages
    pub fn describe_value(value: &Value) -> &'static str {
        match value {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(n) if n.is_f64() => "float",
            Value::Number(_) => "int",
            Value::String(_) => "str",
            Value::Array(_) => "list",
            Value::Object(_) => "object",
        }
    }
}

impl fmt::Display for TypeExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeExpr::Str => write!(f, "str"),
            TypeExpr::Int => write!(f, "int"),
            TypeExpr::Float => write!(f, "float"),
            TypeExpr::Bool => write!(f, "bool"),
            TypeExpr::List(None) => write!(f, "list"),
            TypeExpr::List(Some(item)) => write!(f, "list[{}]", item),
            TypeExpr::Dict(None) => write!(f, "dict"),
            TypeExpr::Dict(Some((k, v))) => write!(f, "dict[{}, {}]", k, v),
            TypeExpr::Object => write!(f, "object"),
        }
    }
}

/// Parse a type string into a [`TypeExpr`]
pub fn parse_type(input: &str) -> Result<TypeExpr, TypeParseError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(TypeParseError::Empty);
    }
    parse_expr(trimmed, input)
}

/// Whether a type string parses
pub fn validate(input: &str) -> bool {
    parse_type(input).is_ok()
}

/// Alias of [`parse_type`] for call sites that read better as "resolve"
pub fn resolve(input: &str) -> Result<TypeExpr, TypeParseError> {
    parse_type(input)
}

fn parse_expr(text: &str, input: &str) -> Result<TypeExpr, TypeParseError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(TypeParseError::MalformedBrackets {
            input: input.to_string(),
        });
    }

    let (name, args) = match text.find('[') {
        Some(open) => {
            if !text.ends_with(']') {
                return Err(TypeParseError::MalformedBrackets {
                    input: input.to_string(),
                });
            }
            let inner = &text[open + 1..text.len() - 1];
            (text[..open].trim(), Some(split_args(inner, input)?))
        }
        None => {
            if text.contains(']') || text.contains(',') {
                return Err(TypeParseError::MalformedBrackets {
                    input: input.to_string(),
                });
            }
            (text, None)
        }
    };

    let scalar = match name {
        "str" => Some(TypeExpr::Str),
        "int" => Some(TypeExpr::Int),
        "float" => Some(TypeExpr::Float),
        "bool" => Some(TypeExpr::Bool),
        "object" => Some(TypeExpr::Object),
        _ => None,
    };
    if let Some(ty) = scalar {
        if args.is_some() {
            return Err(TypeParseError::UnexpectedArguments {
                name: name.to_string(),
                input: input.to_string(),
            });
        }
        return Ok(ty);
    }

    match name {
        "list" => match args {
            None => Ok(TypeExpr::List(None)),
            Some(args) => {
                if args.len() != 1 {
                    return Err(TypeParseError::ArgumentCount {
                        name: "list".into(),
                        expected: 1,
                        actual: args.len(),
                        input: input.to_string(),
                    });
                }
                let item = parse_expr(args[0], input)?;
                Ok(TypeExpr::List(Some(Box::new(item))))
            }
        },
        "dict" => match args {
            None => Ok(TypeExpr::Dict(None)),
            Some(args) => {
                if args.len() != 2 {
                    return Err(TypeParseError::ArgumentCount {
                        name: "dict".into(),
                        expected: 2,
                        actual: args.len(),
                        input: input.to_string(),
                    });
                }
                let key = parse_expr(args[0], input)?;
                if !key.is_scalar() {
                    return Err(TypeParseError::InvalidKeyType {
                        key: args[0].trim().to_string(),
                        input: input.to_string(),
                    });
                }
                let value = parse_expr(args[1], input)?;
                Ok(TypeExpr::Dict(Some((Box::new(key), Box::new(value)))))
            }
        },
        _ => {
            if name.contains(']') || name.contains('[') || name.contains(',') {
                Err(TypeParseError::MalformedBrackets {
                    input: input.to_string(),
                })
            } else {
                Err(TypeParseError::UnknownType {
                    token: name.to_string(),
                    input: input.to_string(),
                })
            }
        }
    }
}

/// Split bracket contents on top-level commas
fn split_args<'a>(inner: &'a str, input: &str) -> Result<Vec<&'a str>, TypeParseError> {
    let mut args = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;

    for (i, c) in inner.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => {
                depth -= 1;
                if depth < 0 {
                    return Err(TypeParseError::MalformedBrackets {
                        input: input.to_string(),
                    });
                }
            }
            ',' if depth == 0 => {
                args.push(&inner[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }

    if depth != 0 {
        return Err(TypeParseError::MalformedBrackets {
            input: input.to_string(),
        });
    }
    args.push(&inner[start..]);

    if args.iter().any(|a| a.trim().is_empty()) {
        return Err(TypeParseError::MalformedBrackets {
            input: input.to_string(),
        });
    }
    Ok(args)
}
