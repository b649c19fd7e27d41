//! Grammar-construction actions and the attribute lists they are built from.
//!
//! One shell invocation of a build verb produces exactly one [`Action`]. The
//! attribute list of `add_arg` and the key/value list of `set_defaults` are
//! validated here, at build time, so a malformed declaration fails in the
//! script line that wrote it rather than at parse time.

use crate::value::{ChoiceSet, Converter, Nargs, ValueError};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors in an attribute or key/value list.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AttrError {
    #[error("expected an attribute like '--help', found '{0}'")]
    ExpectedAttribute(String),

    #[error("attribute '--{0}' requires a value")]
    MissingValue(String),

    #[error("unknown attribute '--{0}'")]
    UnknownAttribute(String),

    #[error(
        "unknown action '{0}' (expected one of: store, store_true, store_false, append, \
         count, store_const, append_const, version, help)"
    )]
    UnknownAction(String),

    #[error("attribute '--{attr}' conflicts with action '{action}'")]
    ConflictingAction { attr: String, action: ArgKind },

    #[error("invalid boolean '{value}' for '--{attr}'")]
    InvalidBool { attr: String, value: String },

    #[error("invalid value '{value}' for '--{attr}': expected a non-negative integer")]
    InvalidCount { attr: String, value: String },

    #[error(transparent)]
    Value(#[from] ValueError),
}

/// What an argument does when it is matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgKind {
    Store,
    StoreTrue,
    StoreFalse,
    Append,
    Count,
    StoreConst,
    AppendConst,
    Version,
    Help,
}

impl ArgKind {
    pub fn from_name(name: &str) -> Result<Self, AttrError> {
        match name.trim() {
            "store" => Ok(ArgKind::Store),
            "store_true" | "store-true" => Ok(ArgKind::StoreTrue),
            "store_false" | "store-false" => Ok(ArgKind::StoreFalse),
            "append" => Ok(ArgKind::Append),
            "count" => Ok(ArgKind::Count),
            "store_const" | "store-const" => Ok(ArgKind::StoreConst),
            "append_const" | "append-const" => Ok(ArgKind::AppendConst),
            "version" => Ok(ArgKind::Version),
            "help" => Ok(ArgKind::Help),
            other => Err(AttrError::UnknownAction(other.to_string())),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ArgKind::Store => "store",
            ArgKind::StoreTrue => "store_true",
            ArgKind::StoreFalse => "store_false",
            ArgKind::Append => "append",
            ArgKind::Count => "count",
            ArgKind::StoreConst => "store_const",
            ArgKind::AppendConst => "append_const",
            ArgKind::Version => "version",
            ArgKind::Help => "help",
        }
    }

    /// Actions that never consume a value token.
    pub fn is_niladic(self) -> bool {
        !matches!(self, ArgKind::Store | ArgKind::Append)
    }
}

impl fmt::Display for ArgKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which node an action applies to: `(group id, subcommand name)`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subcommand: Option<String>,
}

impl Target {
    pub fn new(group: Option<String>, subcommand: Option<String>) -> Self {
        Self { group, subcommand }
    }

    pub fn is_root(&self) -> bool {
        self.group.is_none() && self.subcommand.is_none()
    }
}

/// Declared attributes of an argument, as written after `--` in `add_arg`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgAttrs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub help: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metavar: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub required: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deprecated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub converter: Option<Converter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub choices: Option<ChoiceSet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ArgKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constant: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nargs: Option<Nargs>,
}

impl ArgAttrs {
    /// Parse `--key value` pairs (`--key=value` is accepted too).
    ///
    /// `_` and `-` are interchangeable in keys. `--required` and `--deprecated`
    /// may stand alone or be followed by a boolean literal.
    pub fn from_args(args: &[String]) -> Result<Self, AttrError> {
        let mut attrs = ArgAttrs::default();
        let mut iter = args.iter().peekable();

        while let Some(arg) = iter.next() {
            let flag = arg
                .strip_prefix("--")
                .filter(|f| !f.is_empty())
                .ok_or_else(|| AttrError::ExpectedAttribute(arg.clone()))?;
            let (key, inline) = match flag.split_once('=') {
                Some((k, v)) => (k.replace('_', "-"), Some(v.to_string())),
                None => (flag.replace('_', "-"), None),
            };

            if key == "required" || key == "deprecated" {
                let value = match inline {
                    Some(v) => Some(v),
                    None => iter.next_if(|next| parse_bool(next).is_some()).cloned(),
                };
                let enabled = match value {
                    Some(v) => parse_bool(&v).ok_or(AttrError::InvalidBool {
                        attr: key.clone(),
                        value: v,
                    })?,
                    None => true,
                };
                if key == "required" {
                    attrs.required = enabled;
                } else {
                    attrs.deprecated = enabled;
                }
                continue;
            }

            let value = match inline {
                Some(v) => v,
                None => iter
                    .next()
                    .cloned()
                    .ok_or_else(|| AttrError::MissingValue(key.clone()))?,
            };
            attrs.apply(&key, value)?;
        }

        Ok(attrs)
    }

    fn apply(&mut self, key: &str, value: String) -> Result<(), AttrError> {
        match key {
            "dest" => self.dest = Some(value),
            "help" | "helptext" => self.help = Some(value),
            "metavar" => self.metavar = Some(value),
            "type" => self.converter = Some(Converter::from_name(&value)?),
            "choices" => self.add_choices(ChoiceSet::parse(&value)?)?,
            "choice" => self.add_choices(ChoiceSet::Values(vec![value]))?,
            "default" => self.default = Some(value),
            "action" => self.set_kind(key, ArgKind::from_name(&value)?)?,
            "const" => self.constant = Some(value),
            "store-const" => {
                self.set_kind(key, ArgKind::StoreConst)?;
                self.constant = Some(value);
            }
            "append-const" => {
                self.set_kind(key, ArgKind::AppendConst)?;
                self.constant = Some(value);
            }
            "version" => {
                self.set_kind(key, ArgKind::Version)?;
                self.version = Some(value);
            }
            "nargs" => self.nargs = Some(Nargs::parse(&value)?),
            "nargs-exact" => {
                let n = value.trim().parse::<usize>().map_err(|_| AttrError::InvalidCount {
                    attr: key.to_string(),
                    value: value.clone(),
                })?;
                self.nargs = Some(Nargs::Exactly(n));
            }
            other => return Err(AttrError::UnknownAttribute(other.to_string())),
        }
        Ok(())
    }

    fn set_kind(&mut self, attr: &str, kind: ArgKind) -> Result<(), AttrError> {
        match self.kind {
            Some(existing) if existing != kind => Err(AttrError::ConflictingAction {
                attr: attr.to_string(),
                action: existing,
            }),
            _ => {
                self.kind = Some(kind);
                Ok(())
            }
        }
    }

    fn add_choices(&mut self, choices: ChoiceSet) -> Result<(), AttrError> {
        self.choices = Some(match self.choices.take() {
            Some(existing) => existing.extend(choices)?,
            None => choices,
        });
        Ok(())
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

/// Parse the `--key value` list of `set_defaults`, preserving order.
///
/// Keys are kept verbatim: they are result-map keys, not attribute names.
pub fn parse_key_values(args: &[String]) -> Result<Vec<(String, String)>, AttrError> {
    let mut pairs = Vec::new();
    let mut iter = args.iter();

    while let Some(arg) = iter.next() {
        let key = arg
            .strip_prefix("--")
            .filter(|k| !k.is_empty())
            .ok_or_else(|| AttrError::ExpectedAttribute(arg.clone()))?;
        let (key, value) = match key.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => {
                let value = iter
                    .next()
                    .cloned()
                    .ok_or_else(|| AttrError::MissingValue(key.to_string()))?;
                (key.to_string(), value)
            }
        };
        pairs.push((key, value));
    }

    Ok(pairs)
}

/// `new`: name, description and epilog of the root parser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewParser {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epilog: Option<String>,
}

/// `add_arg`: one argument with its aliases and attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddArgument {
    #[serde(default)]
    pub target: Target,
    pub aliases: Vec<String>,
    #[serde(default)]
    pub attrs: ArgAttrs,
}

impl AddArgument {
    /// Build from the trailing command-line list `<aliases...> [-- <attrs...>]`.
    pub fn from_command_line(target: Target, rest: &[String]) -> Result<Self, AttrError> {
        let (aliases, attrs) = match rest.iter().position(|arg| arg == "--") {
            Some(sep) => (&rest[..sep], &rest[sep + 1..]),
            None => (rest, &[][..]),
        };
        Ok(Self {
            target,
            aliases: aliases.to_vec(),
            attrs: ArgAttrs::from_args(attrs)?,
        })
    }
}

/// `add_subparser`: a subcommand group attached to a node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddSubparserGroup {
    #[serde(default)]
    pub target: Target,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub help: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metavar: Option<String>,
}

/// `add_subcommand`: a named child parser inside a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddSubcommand {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub help: Option<String>,
}

/// `set_defaults`: key/value pairs merged into a node's default map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetDefaults {
    #[serde(default)]
    pub target: Target,
    pub values: Vec<(String, String)>,
}

/// One grammar-construction step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    NewParser(NewParser),
    AddArgument(AddArgument),
    AddSubparserGroup(AddSubparserGroup),
    AddSubcommand(AddSubcommand),
    SetDefaults(SetDefaults),
}

impl Action {
    /// The verb that produces this action.
    pub fn tag(&self) -> &'static str {
        match self {
            Action::NewParser(_) => "new",
            Action::AddArgument(_) => "add_arg",
            Action::AddSubparserGroup(_) => "add_subparser",
            Action::AddSubcommand(_) => "add_subcommand",
            Action::SetDefaults(_) => "set_defaults",
        }
    }
}
