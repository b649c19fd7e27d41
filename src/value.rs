//! Value converters, nargs cardinalities and choice sets.
//!
//! Everything an argument declares about the *shape* of its values lives here:
//! which converter turns raw strings into typed values, how many tokens it
//! consumes, and which values it accepts.

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use std::fmt;
use thiserror::Error;

/// Errors raised while reading converter, nargs or choice declarations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValueError {
    #[error("unknown type '{0}' (expected one of: str, int, float, bool, path)")]
    UnknownConverter(String),

    #[error("invalid nargs '{0}': expected a number, '?', '*' or '+'")]
    InvalidNargs(String),

    #[error("invalid choices '{0}': {1}")]
    InvalidChoices(String, String),
}

/// A raw value could not be converted.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid {converter} value: '{value}'")]
pub struct ConversionError {
    pub converter: Converter,
    pub value: String,
}

/// Named converters for argument values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Converter {
    /// Keep the raw string (default)
    #[default]
    Str,
    /// Signed 64-bit integer
    Int,
    /// 64-bit float (must be finite)
    Float,
    /// true/false, yes/no, on/off, 1/0 (case-insensitive)
    Bool,
    /// Non-empty filesystem path, kept as a string
    Path,
}

impl Converter {
    /// Look up a converter by the name used on the command line.
    pub fn from_name(name: &str) -> Result<Self, ValueError> {
        match name.trim() {
            "str" | "string" => Ok(Converter::Str),
            "int" | "integer" => Ok(Converter::Int),
            "float" => Ok(Converter::Float),
            "bool" | "boolean" => Ok(Converter::Bool),
            "path" => Ok(Converter::Path),
            other => Err(ValueError::UnknownConverter(other.to_string())),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Converter::Str => "str",
            Converter::Int => "int",
            Converter::Float => "float",
            Converter::Bool => "bool",
            Converter::Path => "path",
        }
    }

    /// Convert a raw string into a typed value.
    pub fn convert(self, raw: &str) -> Result<Value, ConversionError> {
        let fail = || ConversionError {
            converter: self,
            value: raw.to_string(),
        };
        match self {
            Converter::Str => Ok(Value::String(raw.to_string())),
            Converter::Path => {
                if raw.is_empty() {
                    Err(fail())
                } else {
                    Ok(Value::String(raw.to_string()))
                }
            }
            Converter::Int => raw
                .trim()
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| fail()),
            Converter::Float => raw
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .ok_or_else(fail),
            Converter::Bool => match raw.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "on" | "1" => Ok(Value::Bool(true)),
                "false" | "no" | "off" | "0" => Ok(Value::Bool(false)),
                _ => Err(fail()),
            },
        }
    }
}

impl fmt::Display for Converter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How many tokens an argument consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Nargs {
    /// Exactly N values, collected into a list
    Exactly(usize),
    /// `?`: zero or one value
    Optional,
    /// `*`: any number of values
    ZeroOrMore,
    /// `+`: at least one value
    OneOrMore,
}

impl Nargs {
    /// Parse the command-line spelling (`3`, `?`, `*`, `+`).
    pub fn parse(s: &str) -> Result<Self, ValueError> {
        match s.trim() {
            "?" => Ok(Nargs::Optional),
            "*" => Ok(Nargs::ZeroOrMore),
            "+" => Ok(Nargs::OneOrMore),
            other => other
                .parse::<usize>()
                .map(Nargs::Exactly)
                .map_err(|_| ValueError::InvalidNargs(s.to_string())),
        }
    }
}

/// Number of tokens an argument may claim: `min..=max` (`max == None` is unbounded).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arity {
    pub min: usize,
    pub max: Option<usize>,
}

impl Arity {
    pub const ZERO: Arity = Arity {
        min: 0,
        max: Some(0),
    };
    pub const ONE: Arity = Arity {
        min: 1,
        max: Some(1),
    };

    pub fn takes_values(self) -> bool {
        self.max != Some(0)
    }
}

impl From<Nargs> for Arity {
    fn from(nargs: Nargs) -> Self {
        match nargs {
            Nargs::Exactly(n) => Arity {
                min: n,
                max: Some(n),
            },
            Nargs::Optional => Arity {
                min: 0,
                max: Some(1),
            },
            Nargs::ZeroOrMore => Arity { min: 0, max: None },
            Nargs::OneOrMore => Arity { min: 1, max: None },
        }
    }
}

/// A declared set of allowed values, before conversion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChoiceSet {
    /// Literal values, converted with the argument's converter at replay time
    Values(Vec<String>),
    /// Half-open integer range `start..end`
    Range { start: i64, end: i64 },
}

impl ChoiceSet {
    /// Parse a choices literal.
    ///
    /// Accepted forms: `a,b,c`, `[a, 'b c', "d"]`, `(1, 2)`, `range(5)`,
    /// `range(1, 5)`, `1..5` and `1..=5`.
    pub fn parse(literal: &str) -> Result<Self, ValueError> {
        let text = literal.trim();
        let invalid = |why: &str| ValueError::InvalidChoices(literal.to_string(), why.to_string());

        if let Some(inner) = text
            .strip_prefix("range(")
            .and_then(|rest| rest.strip_suffix(')'))
        {
            let bounds = inner
                .split(',')
                .map(|part| part.trim().parse::<i64>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|_| invalid("range bounds must be integers"))?;
            return match bounds.as_slice() {
                [end] => Ok(ChoiceSet::Range {
                    start: 0,
                    end: *end,
                }),
                [start, end] => Ok(ChoiceSet::Range {
                    start: *start,
                    end: *end,
                }),
                _ => Err(invalid("range takes one or two bounds")),
            };
        }

        if let Some((start, end)) = text.split_once("..") {
            if let Ok(start) = start.trim().parse::<i64>() {
                let (end, inclusive) = match end.strip_prefix('=') {
                    Some(end) => (end, true),
                    None => (end, false),
                };
                let end = end
                    .trim()
                    .parse::<i64>()
                    .map_err(|_| invalid("range end must be an integer"))?;
                let end = if inclusive { end.saturating_add(1) } else { end };
                return Ok(ChoiceSet::Range { start, end });
            }
        }

        let inner = match (text.chars().next(), text.chars().last()) {
            (Some('['), Some(']')) | (Some('('), Some(')')) => &text[1..text.len() - 1],
            _ => text,
        };
        let items = split_literal_list(inner).map_err(invalid)?;
        if items.is_empty() {
            return Err(invalid("at least one choice is required"));
        }
        Ok(ChoiceSet::Values(items))
    }

    /// Combine two declarations (repeated `--choices` / `--choice`).
    pub fn extend(self, other: ChoiceSet) -> Result<ChoiceSet, ValueError> {
        match (self, other) {
            (ChoiceSet::Values(mut a), ChoiceSet::Values(b)) => {
                a.extend(b);
                Ok(ChoiceSet::Values(a))
            }
            (a, b) => Err(ValueError::InvalidChoices(
                format!("{a} + {b}"),
                "a range cannot be combined with other choices".to_string(),
            )),
        }
    }
}

impl fmt::Display for ChoiceSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChoiceSet::Values(values) => write!(f, "{}", values.join(",")),
            ChoiceSet::Range { start, end } => write!(f, "{start}..{end}"),
        }
    }
}

/// Split `a, 'b, c', "d"` into items, honouring single and double quotes.
///
/// Whitespace around a quoted item is dropped; its content is kept verbatim.
fn split_literal_list(inner: &str) -> Result<Vec<String>, &'static str> {
    let mut items = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut quoted = false;
    let mut closed = false;

    for c in inner.chars() {
        match quote {
            Some(q) if c == q => {
                quote = None;
                closed = true;
            }
            Some(_) => current.push(c),
            None => match c {
                ',' => {
                    push_item(&mut items, &mut current, quoted);
                    quoted = false;
                    closed = false;
                }
                _ if closed => {
                    if !c.is_whitespace() {
                        return Err("unexpected text after a quoted choice");
                    }
                }
                '\'' | '"' => {
                    if !current.trim().is_empty() {
                        return Err("unexpected text before a quoted choice");
                    }
                    current.clear();
                    quote = Some(c);
                    quoted = true;
                }
                _ => current.push(c),
            },
        }
    }
    if quote.is_some() {
        return Err("unterminated quote");
    }
    push_item(&mut items, &mut current, quoted);
    Ok(items)
}

fn push_item(items: &mut Vec<String>, current: &mut String, quoted: bool) {
    let item = std::mem::take(current);
    if quoted {
        items.push(item);
    } else {
        let trimmed = item.trim();
        if !trimmed.is_empty() {
            items.push(trimmed.to_string());
        }
    }
}

/// Allowed values after conversion; what the matching engine checks against.
#[derive(Debug, Clone, PartialEq)]
pub enum Choices {
    Values(Vec<Value>),
    Range { start: i64, end: i64 },
}

impl Choices {
    pub fn contains(&self, value: &Value) -> bool {
        match self {
            Choices::Values(values) => values.iter().any(|v| v == value),
            Choices::Range { start, end } => value
                .as_i64()
                .map(|n| (*start..*end).contains(&n))
                .unwrap_or(false),
        }
    }

    /// `{a,b,c}` as shown in usage and help.
    pub fn metavar(&self) -> String {
        match self {
            Choices::Values(values) => {
                let names: Vec<String> = values.iter().map(display_plain).collect();
                format!("{{{}}}", names.join(","))
            }
            Choices::Range { start, end } => format!("{{{start}..{end}}}"),
        }
    }

    /// `'a', 'b'` as shown in invalid-choice errors.
    pub fn listing(&self) -> String {
        match self {
            Choices::Values(values) => values
                .iter()
                .map(display_quoted)
                .collect::<Vec<_>>()
                .join(", "),
            Choices::Range { start, end } => format!("range({start}, {end})"),
        }
    }
}

/// Render a value without quotes (`foo`, `3`, `true`).
pub fn display_plain(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Render a value the way error messages quote it (`'foo'`, `3`).
pub fn display_quoted(value: &Value) -> String {
    match value {
        Value::String(s) => format!("'{s}'"),
        other => other.to_string(),
    }
}
