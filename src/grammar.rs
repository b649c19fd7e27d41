//! The grammar tree and the replay engine that rebuilds it from actions.
//!
//! Nodes and groups live in two arenas indexed by [`NodeId`] and [`GroupId`].
//! Replay walks the decoded actions in order, keeping an explicit
//! `last_group` cursor so that unnamed references resolve to the same
//! targets they did when the script emitted them.

use crate::action::{
    Action, AddArgument, AddSubcommand, AddSubparserGroup, ArgKind, NewParser, SetDefaults, Target,
};
use crate::value::{Arity, ChoiceSet, Choices, Converter, Nargs};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, trace};

/// Name of the root parser when no `new` action is present.
pub const DEFAULT_PROG: &str = "argparsh";

const HELP_TEXT: &str = "show this help message and exit";
const VERSION_HELP_TEXT: &str = "show program's version number and exit";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BuildError {
    #[error("the root parser already exists: 'new' must come first and only once")]
    AlreadyInitialized,

    #[error("unknown subparser group '{0}'")]
    UnknownGroup(String),

    #[error("subparser group '{group}' has no subcommand '{name}'")]
    UnknownSubcommand { group: String, name: String },

    #[error("no subparser group has been created yet")]
    NoGroup,

    #[error("subparser group '{0}' has no subcommands yet")]
    EmptyGroup(String),

    #[error("subparser group '{0}' already exists")]
    DuplicateGroup(String),

    #[error("'{prog}' already has a subparser group ('{existing}')")]
    GroupAlreadyAttached { prog: String, existing: String },

    #[error("subcommand '{name}' already exists in group '{group}'")]
    DuplicateSubcommand { group: String, name: String },

    #[error("argument {name}: {reason}")]
    InvalidArgument { name: String, reason: String },

    #[error("argument {name}: conflicting option string: {option}")]
    ConflictingOption { name: String, option: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupId(usize);

/// A fully validated argument.
#[derive(Debug, Clone, PartialEq)]
pub struct Argument {
    /// Empty for positionals
    pub option_strings: Vec<String>,
    pub dest: String,
    pub kind: ArgKind,
    pub nargs: Option<Nargs>,
    pub arity: Arity,
    pub converter: Converter,
    pub choices: Option<Choices>,
    pub default: Option<Value>,
    pub constant: Value,
    pub required: bool,
    pub deprecated: bool,
    pub help: Option<String>,
    pub metavar: Option<String>,
    pub version: Option<String>,
}

impl Argument {
    fn help_flag() -> Self {
        Self {
            option_strings: vec!["-h".to_string(), "--help".to_string()],
            dest: "help".to_string(),
            kind: ArgKind::Help,
            nargs: None,
            arity: Arity::ZERO,
            converter: Converter::Str,
            choices: None,
            default: None,
            constant: Value::Null,
            required: false,
            deprecated: false,
            help: Some(HELP_TEXT.to_string()),
            metavar: None,
            version: None,
        }
    }

    pub fn is_positional(&self) -> bool {
        self.option_strings.is_empty()
    }

    /// Help text as listed in help output, marked when the argument is deprecated.
    pub fn help_text(&self) -> Option<String> {
        match (&self.help, self.deprecated) {
            (help, false) => help.clone(),
            (Some(help), true) if !help.is_empty() => Some(format!("{help} (deprecated)")),
            (_, true) => Some("(deprecated)".to_string()),
        }
    }

    /// How the argument is named in error messages: `-f/--foo` or `name`.
    pub fn display_name(&self) -> String {
        if self.is_positional() {
            self.metavar.clone().unwrap_or_else(|| self.dest.clone())
        } else {
            self.option_strings.join("/")
        }
    }

    /// Placeholder for one value in usage and help.
    pub fn value_metavar(&self) -> String {
        if let Some(metavar) = &self.metavar {
            return metavar.clone();
        }
        if let Some(choices) = &self.choices {
            return choices.metavar();
        }
        if self.is_positional() {
            self.dest.clone()
        } else {
            self.dest.to_uppercase()
        }
    }

    /// Value stored when the argument is never matched.
    pub fn implicit_default(&self) -> Value {
        if let Some(default) = &self.default {
            return default.clone();
        }
        match self.kind {
            ArgKind::StoreTrue => Value::Bool(false),
            ArgKind::StoreFalse => Value::Bool(true),
            _ if self.is_positional() && self.nargs == Some(Nargs::ZeroOrMore) => {
                Value::Array(Vec::new())
            }
            _ => Value::Null,
        }
    }

    /// Whether the argument ever writes to the result map.
    pub fn stores_value(&self) -> bool {
        !matches!(self.kind, ArgKind::Help | ArgKind::Version)
    }
}

/// One level of the command grammar: the root or a subcommand.
#[derive(Debug, Clone, PartialEq)]
pub struct ParserNode {
    pub name: String,
    pub prog: String,
    pub description: Option<String>,
    pub epilog: Option<String>,
    pub arguments: Vec<Argument>,
    pub group: Option<GroupId>,
    /// Number of positionals declared before the group
    pub group_position: usize,
    pub defaults: BTreeMap<String, String>,
}

impl ParserNode {
    fn new(name: &str, prog: String) -> Self {
        Self {
            name: name.to_string(),
            prog,
            description: None,
            epilog: None,
            arguments: vec![Argument::help_flag()],
            group: None,
            group_position: 0,
            defaults: BTreeMap::new(),
        }
    }

    pub fn positionals(&self) -> impl Iterator<Item = &Argument> {
        self.arguments.iter().filter(|a| a.is_positional())
    }

    pub fn optionals(&self) -> impl Iterator<Item = &Argument> {
        self.arguments.iter().filter(|a| !a.is_positional())
    }

    /// Positionals in matching order, with the group slot at its position.
    pub fn positional_slots(&self) -> Vec<Slot> {
        let mut slots: Vec<Slot> = self
            .arguments
            .iter()
            .enumerate()
            .filter(|(_, a)| a.is_positional())
            .map(|(i, _)| Slot::Argument(i))
            .collect();
        if self.group.is_some() {
            slots.insert(self.group_position.min(slots.len()), Slot::Group);
        }
        slots
    }
}

/// One positional position of a node: an argument (by index) or the group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Argument(usize),
    Group,
}

/// A subcommand slot owned by one node.
#[derive(Debug, Clone, PartialEq)]
pub struct SubparserGroup {
    pub id: String,
    pub owner: NodeId,
    pub dest: String,
    pub required: bool,
    pub help: Option<String>,
    pub metavar: Option<String>,
    /// Subcommand name, per-subcommand help, child node
    pub subcommands: Vec<(String, Option<String>, NodeId)>,
}

impl SubparserGroup {
    pub fn find(&self, name: &str) -> Option<NodeId> {
        self.subcommands
            .iter()
            .find(|(n, _, _)| n == name)
            .map(|(_, _, id)| *id)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.subcommands.iter().map(|(n, _, _)| n.as_str())
    }

    /// `{foo,bar}` or the declared metavar.
    pub fn display_metavar(&self) -> String {
        match &self.metavar {
            Some(m) => m.clone(),
            None => format!("{{{}}}", self.names().collect::<Vec<_>>().join(",")),
        }
    }

    /// How the group is named in "required" errors.
    pub fn display_name(&self) -> String {
        self.metavar.clone().unwrap_or_else(|| self.dest.clone())
    }
}

/// The replayed grammar tree.
#[derive(Debug, Clone, PartialEq)]
pub struct Grammar {
    nodes: Vec<ParserNode>,
    groups: Vec<SubparserGroup>,
}

impl Default for Grammar {
    fn default() -> Self {
        Self {
            nodes: vec![ParserNode::new(DEFAULT_PROG, DEFAULT_PROG.to_string())],
            groups: Vec::new(),
        }
    }
}

impl Grammar {
    pub const ROOT: NodeId = NodeId(0);

    /// Rebuild the grammar from a decoded action sequence.
    pub fn replay(actions: &[Action]) -> Result<Self, BuildError> {
        debug!(actions = actions.len(), "replaying grammar");
        let mut replay = Replay::default();
        for action in actions {
            trace!(tag = action.tag(), "applying action");
            replay.apply(action)?;
        }
        Ok(replay.grammar)
    }

    pub fn root(&self) -> &ParserNode {
        self.node(Self::ROOT)
    }

    pub fn node(&self, id: NodeId) -> &ParserNode {
        &self.nodes[id.0]
    }

    pub fn group(&self, id: GroupId) -> &SubparserGroup {
        &self.groups[id.0]
    }

    /// The group owned by `node`, if any.
    pub fn group_of(&self, node: NodeId) -> Option<&SubparserGroup> {
        self.node(node).group.map(|g| self.group(g))
    }

    fn node_mut(&mut self, id: NodeId) -> &mut ParserNode {
        &mut self.nodes[id.0]
    }

    fn find_group(&self, id: &str) -> Option<GroupId> {
        self.groups.iter().position(|g| g.id == id).map(GroupId)
    }
}

#[derive(Default)]
struct Replay {
    grammar: Grammar,
    initialized: bool,
    last_group: Option<GroupId>,
}

impl Replay {
    fn apply(&mut self, action: &Action) -> Result<(), BuildError> {
        match action {
            Action::NewParser(new) => self.new_parser(new)?,
            Action::AddArgument(add) => self.add_argument(add)?,
            Action::AddSubparserGroup(add) => self.add_group(add)?,
            Action::AddSubcommand(add) => self.add_subcommand(add)?,
            Action::SetDefaults(set) => self.set_defaults(set)?,
        }
        self.initialized = true;
        Ok(())
    }

    fn new_parser(&mut self, new: &NewParser) -> Result<(), BuildError> {
        if self.initialized {
            return Err(BuildError::AlreadyInitialized);
        }
        let root = self.grammar.node_mut(Grammar::ROOT);
        root.name = new.name.clone();
        root.prog = new.name.clone();
        root.description = new.description.clone();
        root.epilog = new.epilog.clone();
        Ok(())
    }

    fn add_argument(&mut self, add: &AddArgument) -> Result<(), BuildError> {
        let node = self.resolve(&add.target)?;
        let argument = build_argument(add, &self.grammar.node(node).arguments)?;
        trace!(dest = %argument.dest, prog = %self.grammar.node(node).prog, "added argument");
        self.grammar.node_mut(node).arguments.push(argument);
        Ok(())
    }

    fn add_group(&mut self, add: &AddSubparserGroup) -> Result<(), BuildError> {
        let owner = self.resolve(&add.target)?;

        if let Some(existing) = self.grammar.group_of(owner) {
            return Err(BuildError::GroupAlreadyAttached {
                prog: self.grammar.node(owner).prog.clone(),
                existing: existing.id.clone(),
            });
        }

        let id = match &add.id {
            Some(id) if self.grammar.find_group(id).is_some() => {
                return Err(BuildError::DuplicateGroup(id.clone()))
            }
            Some(id) => id.clone(),
            None => self.generate_group_id(),
        };

        let group_id = GroupId(self.grammar.groups.len());
        self.grammar.groups.push(SubparserGroup {
            dest: add.dest.clone().unwrap_or_else(|| id.clone()),
            id,
            owner,
            required: add.required,
            help: add.help.clone(),
            metavar: add.metavar.clone(),
            subcommands: Vec::new(),
        });

        let node = self.grammar.node_mut(owner);
        node.group_position = node.positionals().count();
        node.group = Some(group_id);
        self.last_group = Some(group_id);
        Ok(())
    }

    fn generate_group_id(&self) -> String {
        let mut n = self.grammar.groups.len();
        loop {
            let candidate = format!("subparsers{n}");
            if self.grammar.find_group(&candidate).is_none() {
                return candidate;
            }
            n += 1;
        }
    }

    fn add_subcommand(&mut self, add: &AddSubcommand) -> Result<(), BuildError> {
        let group_id = match &add.group {
            Some(id) => self.lookup_group(id)?,
            None => self.last_group.ok_or(BuildError::NoGroup)?,
        };

        let group = self.grammar.group(group_id);
        if group.find(&add.name).is_some() {
            return Err(BuildError::DuplicateSubcommand {
                group: group.id.clone(),
                name: add.name.clone(),
            });
        }

        let prog = format!("{} {}", self.grammar.node(group.owner).prog, add.name);
        let child = NodeId(self.grammar.nodes.len());
        self.grammar.nodes.push(ParserNode::new(&add.name, prog));
        self.grammar.groups[group_id.0]
            .subcommands
            .push((add.name.clone(), add.help.clone(), child));
        Ok(())
    }

    fn set_defaults(&mut self, set: &SetDefaults) -> Result<(), BuildError> {
        let node = self.resolve(&set.target)?;
        let defaults = &mut self.grammar.node_mut(node).defaults;
        for (key, value) in &set.values {
            defaults.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    fn lookup_group(&self, id: &str) -> Result<GroupId, BuildError> {
        self.grammar
            .find_group(id)
            .ok_or_else(|| BuildError::UnknownGroup(id.to_string()))
    }

    /// Resolve a `(group, subcommand)` target to a node.
    fn resolve(&self, target: &Target) -> Result<NodeId, BuildError> {
        let group_id = match (&target.group, &target.subcommand) {
            (None, None) => return Ok(Grammar::ROOT),
            (Some(id), _) => self.lookup_group(id)?,
            (None, Some(_)) => self.last_group.ok_or(BuildError::NoGroup)?,
        };
        let group = self.grammar.group(group_id);

        match &target.subcommand {
            Some(name) => group.find(name).ok_or_else(|| BuildError::UnknownSubcommand {
                group: group.id.clone(),
                name: name.clone(),
            }),
            None => group
                .subcommands
                .last()
                .map(|(_, _, id)| *id)
                .ok_or_else(|| BuildError::EmptyGroup(group.id.clone())),
        }
    }
}

/// Validate an `add_arg` declaration against the node's existing arguments.
fn build_argument(add: &AddArgument, existing: &[Argument]) -> Result<Argument, BuildError> {
    let aliases = &add.aliases;
    let attrs = &add.attrs;
    let name = aliases.join("/");
    let invalid = |reason: &str| BuildError::InvalidArgument {
        name: name.clone(),
        reason: reason.to_string(),
    };

    let first = aliases
        .first()
        .ok_or_else(|| invalid("at least one name is required"))?;
    let positional = !first.starts_with('-');
    let kind = attrs.kind.unwrap_or(ArgKind::Store);

    if positional {
        if aliases.len() > 1 {
            return Err(invalid("a positional argument takes exactly one name"));
        }
        if first.is_empty() {
            return Err(invalid("the name must not be empty"));
        }
        if attrs.required {
            return Err(invalid("'required' is not allowed for positionals"));
        }
        if attrs.dest.is_some() {
            return Err(invalid("'dest' is not allowed for positionals"));
        }
        if kind.is_niladic() {
            return Err(invalid(&format!(
                "action '{kind}' is not valid for positionals"
            )));
        }
    } else {
        for alias in aliases {
            if !alias.starts_with('-') {
                return Err(invalid(&format!(
                    "option string '{alias}' must start with '-'"
                )));
            }
            if alias == "-" || alias == "--" {
                return Err(invalid(&format!("invalid option string '{alias}'")));
            }
        }
    }

    if attrs.nargs.is_some() && kind.is_niladic() {
        return Err(invalid(&format!("nargs is not valid with action '{kind}'")));
    }
    if attrs.nargs == Some(Nargs::Exactly(0)) {
        return Err(invalid("nargs must be greater than 0"));
    }
    let takes_const = match kind {
        ArgKind::StoreConst | ArgKind::AppendConst => true,
        ArgKind::Store | ArgKind::Append => attrs.nargs == Some(Nargs::Optional),
        _ => false,
    };
    if attrs.constant.is_some() && !takes_const {
        return Err(invalid(
            "'const' requires action store_const, append_const or nargs '?'",
        ));
    }
    if attrs.choices.is_some() && kind.is_niladic() {
        return Err(invalid(&format!("choices are not valid with action '{kind}'")));
    }
    if attrs.converter.is_some()
        && kind.is_niladic()
        && !matches!(kind, ArgKind::StoreConst | ArgKind::AppendConst)
    {
        return Err(invalid(&format!("'type' is not valid with action '{kind}'")));
    }
    if kind == ArgKind::Version && attrs.version.is_none() {
        return Err(invalid("action 'version' requires '--version TEXT'"));
    }

    let converter = match (attrs.converter, &attrs.choices) {
        (Some(Converter::Int), _) | (None, Some(ChoiceSet::Range { .. })) => Converter::Int,
        (Some(converter), Some(ChoiceSet::Range { .. })) => {
            return Err(invalid(&format!(
                "range choices require type 'int', not '{}'",
                converter.name()
            )));
        }
        (Some(converter), _) => converter,
        (None, _) => Converter::Str,
    };

    let choices = match &attrs.choices {
        None => None,
        Some(ChoiceSet::Range { start, end }) => Some(Choices::Range {
            start: *start,
            end: *end,
        }),
        Some(ChoiceSet::Values(values)) => Some(Choices::Values(
            values
                .iter()
                .map(|v| converter.convert(v))
                .collect::<Result<_, _>>()
                .map_err(|e| invalid(&format!("invalid choice: {e}")))?,
        )),
    };

    let default_converter = match kind {
        ArgKind::Store | ArgKind::Append => converter,
        ArgKind::Count => Converter::Int,
        ArgKind::StoreTrue | ArgKind::StoreFalse => Converter::Bool,
        _ => Converter::Str,
    };
    let default = attrs
        .default
        .as_deref()
        .map(|raw| default_converter.convert(raw))
        .transpose()
        .map_err(|e| invalid(&format!("invalid default: {e}")))?;

    let constant = attrs
        .constant
        .as_deref()
        .map(|raw| converter.convert(raw))
        .transpose()
        .map_err(|e| invalid(&format!("invalid const: {e}")))?
        .unwrap_or(Value::Null);

    let arity = match (kind, attrs.nargs) {
        (ArgKind::Store | ArgKind::Append, Some(nargs)) => Arity::from(nargs),
        (ArgKind::Store | ArgKind::Append, None) => Arity::ONE,
        _ => Arity::ZERO,
    };

    let (option_strings, dest) = if positional {
        (Vec::new(), first.clone())
    } else {
        let dest = match &attrs.dest {
            Some(dest) => dest.clone(),
            None => {
                let long = aliases.iter().find(|a| a.starts_with("--"));
                let raw = long.unwrap_or(first).trim_start_matches('-');
                raw.replace('-', "_")
            }
        };
        if dest.is_empty() {
            return Err(invalid("could not derive a dest; pass '--dest'"));
        }
        (aliases.clone(), dest)
    };

    for (i, option) in option_strings.iter().enumerate() {
        let taken = existing
            .iter()
            .any(|arg| arg.option_strings.contains(option))
            || option_strings[..i].contains(option);
        if taken {
            return Err(BuildError::ConflictingOption {
                name: name.clone(),
                option: option.clone(),
            });
        }
    }

    let help = match (&attrs.help, kind) {
        (Some(help), _) => Some(help.clone()),
        (None, ArgKind::Version) => Some(VERSION_HELP_TEXT.to_string()),
        (None, ArgKind::Help) => Some(HELP_TEXT.to_string()),
        (None, _) => None,
    };

    Ok(Argument {
        required: if positional {
            arity.min > 0
        } else {
            attrs.required
        },
        deprecated: attrs.deprecated,
        option_strings,
        dest,
        kind,
        nargs: attrs.nargs,
        arity,
        converter,
        choices,
        default,
        constant,
        help,
        metavar: attrs.metavar.clone(),
        version: attrs.version.clone(),
    })
}
