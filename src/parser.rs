//! Matching invocation arguments against a replayed grammar.
//!
//! Each node classifies its tokens as optionals or positionals, consumes
//! optionals by arity, plans positional runs greedily and hands the tail of
//! the input to the selected subcommand. Help and version requests stop the
//! walk immediately.

use crate::action::ArgKind;
use crate::grammar::{Argument, Grammar, NodeId, Slot};
use crate::value::{display_quoted, Arity, ConversionError, Nargs};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, trace};

/// Flat, key-sorted `dest -> value` map.
pub type ResultMap = BTreeMap<String, Value>;

/// Errors that can occur while matching arguments.
#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("argument {arg}: {source}")]
    InvalidValue {
        arg: String,
        #[source]
        source: ConversionError,
    },

    #[error("argument {arg}: invalid choice: {value} (choose from {choices})")]
    InvalidChoice {
        arg: String,
        value: String,
        choices: String,
    },

    #[error("argument {arg}: {expected}")]
    MissingValue { arg: String, expected: String },

    #[error("the following arguments are required: {}", .0.join(", "))]
    MissingRequired(Vec<String>),

    #[error("argument {arg}: ignored explicit argument '{value}'")]
    IgnoredExplicit { arg: String, value: String },

    #[error("ambiguous option: {option} could match {candidates}")]
    AmbiguousOption { option: String, candidates: String },

    #[error("argument {arg}: invalid choice: '{name}' (choose from {choices})")]
    UnknownSubcommand {
        arg: String,
        name: String,
        choices: String,
    },

    #[error("unrecognized arguments: {}", .0.join(" "))]
    UnrecognizedArguments(Vec<String>),
}

/// Coarse classification of a [`ParseError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    TypeCoercion,
    ChoiceViolation,
    MissingRequired,
    UnrecognizedArguments,
}

impl ParseError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ParseError::InvalidValue { .. } => ErrorKind::TypeCoercion,
            ParseError::InvalidChoice { .. } => ErrorKind::ChoiceViolation,
            ParseError::MissingValue { .. } | ParseError::MissingRequired(_) => {
                ErrorKind::MissingRequired
            }
            ParseError::IgnoredExplicit { .. }
            | ParseError::AmbiguousOption { .. }
            | ParseError::UnknownSubcommand { .. }
            | ParseError::UnrecognizedArguments(_) => ErrorKind::UnrecognizedArguments,
        }
    }
}

/// A parse error together with the node whose usage should be shown.
#[derive(Debug, Error, PartialEq)]
#[error("{error}")]
pub struct ParseFailure {
    pub node: NodeId,
    pub error: ParseError,
}

/// Outcome of a successful walk.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome {
    Success(ResultMap),
    /// Help was requested while matching this node
    Help(NodeId),
    /// A version action fired; `text` has `%(prog)s` expanded
    Version { node: NodeId, text: String },
}

/// Match `args` against `grammar`.
pub fn parse_args(grammar: &Grammar, args: &[String]) -> Result<ParseOutcome, ParseFailure> {
    debug!(args = args.len(), "matching arguments");
    let tokens: Vec<Token> = args
        .iter()
        .map(|text| Token {
            text,
            literal: false,
        })
        .collect();

    let mut matcher = Matcher::new(grammar);
    match matcher.parse_node(Grammar::ROOT, &tokens) {
        Ok(()) => {}
        Err(Halt::Help(node)) => return Ok(ParseOutcome::Help(node)),
        Err(Halt::Version(node, text)) => return Ok(ParseOutcome::Version { node, text }),
        Err(Halt::Error(failure)) => return Err(failure),
    }

    if !matcher.extras.is_empty() {
        return Err(ParseFailure {
            node: Grammar::ROOT,
            error: ParseError::UnrecognizedArguments(matcher.extras),
        });
    }
    Ok(ParseOutcome::Success(matcher.into_result()))
}

/// Why the walk stopped before completing.
enum Halt {
    Help(NodeId),
    Version(NodeId, String),
    Error(ParseFailure),
}

impl Halt {
    fn at(node: NodeId) -> impl Fn(ParseError) -> Halt {
        move |error| Halt::Error(ParseFailure { node, error })
    }
}

#[derive(Debug, Clone, Copy)]
struct Token<'a> {
    text: &'a str,
    /// Appeared after a `--` separator in an enclosing node
    literal: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct OptMatch {
    index: usize,
    option: String,
    explicit: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Class {
    Positional,
    /// `None` for an option string the node does not know
    Optional(Option<OptMatch>),
}

/// A classified token; `token` indexes the node's input.
#[derive(Debug, Clone)]
struct Entry<'a> {
    token: usize,
    text: &'a str,
    class: Class,
}

enum Consumed {
    /// Positional entries consumed up to this index
    Upto(usize),
    /// A subcommand took the rest of the input
    Dispatched,
}

/// Per-node bookkeeping.
struct NodeState {
    id: NodeId,
    /// Index of the dropped `--` in the node's input
    separator: Option<usize>,
    slots: Vec<Slot>,
    next_slot: usize,
    seen: Vec<bool>,
    dispatched: bool,
}

struct Matcher<'g> {
    grammar: &'g Grammar,
    values: ResultMap,
    path: Vec<NodeId>,
    extras: Vec<String>,
}

impl<'g> Matcher<'g> {
    fn new(grammar: &'g Grammar) -> Self {
        Self {
            grammar,
            values: ResultMap::new(),
            path: Vec::new(),
            extras: Vec::new(),
        }
    }

    fn parse_node(&mut self, id: NodeId, tokens: &[Token<'_>]) -> Result<(), Halt> {
        let grammar = self.grammar;
        let node = grammar.node(id);
        trace!(prog = %node.prog, tokens = tokens.len(), "entering parser");
        self.path.push(id);

        let mut entries = Vec::with_capacity(tokens.len());
        let mut separator: Option<usize> = None;
        for (i, token) in tokens.iter().enumerate() {
            let class = if token.literal || separator.is_some() {
                Class::Positional
            } else if token.text == "--" {
                separator = Some(i);
                continue;
            } else {
                self.classify(id, token.text).map_err(Halt::at(id))?
            };
            entries.push(Entry {
                token: i,
                text: token.text,
                class,
            });
        }

        let mut state = NodeState {
            id,
            separator,
            slots: node.positional_slots(),
            next_slot: 0,
            seen: vec![false; node.arguments.len()],
            dispatched: false,
        };

        let mut cursor = 0;
        while cursor < entries.len() {
            match &entries[cursor].class {
                Class::Optional(None) => {
                    self.extras.push(entries[cursor].text.to_string());
                    cursor += 1;
                }
                Class::Optional(Some(m)) => {
                    let m = m.clone();
                    cursor = self.consume_optional(&mut state, &entries, cursor, m)?;
                }
                Class::Positional => {
                    let run_end = entries[cursor..]
                        .iter()
                        .position(|e| e.class != Class::Positional)
                        .map_or(entries.len(), |p| cursor + p);
                    let consumed =
                        self.consume_positionals(&mut state, tokens, &entries, cursor, run_end)?;
                    match consumed {
                        Consumed::Dispatched => break,
                        Consumed::Upto(next) if next == cursor => {
                            self.extras
                                .extend(entries[cursor..run_end].iter().map(|e| e.text.to_string()));
                            cursor = run_end;
                        }
                        Consumed::Upto(next) => cursor = next,
                    }
                }
            }
        }

        self.check_required(&state).map_err(Halt::at(id))
    }

    /// Decide whether a token is an optional, following argparse's rules.
    fn classify(&self, id: NodeId, text: &str) -> Result<Class, ParseError> {
        let node = self.grammar.node(id);
        if !text.starts_with('-') || text == "-" {
            return Ok(Class::Positional);
        }
        if let Some(index) = find_option(&node.arguments, text) {
            return Ok(Class::Optional(Some(OptMatch {
                index,
                option: text.to_string(),
                explicit: None,
            })));
        }
        if let Some((name, value)) = text.split_once('=') {
            if let Some(index) = find_option(&node.arguments, name) {
                return Ok(Class::Optional(Some(OptMatch {
                    index,
                    option: name.to_string(),
                    explicit: Some(value.to_string()),
                })));
            }
        }

        let mut candidates = prefix_matches(&node.arguments, text);
        if candidates.len() > 1 {
            let names: Vec<&str> = candidates.iter().map(|m| m.option.as_str()).collect();
            return Err(ParseError::AmbiguousOption {
                option: text.to_string(),
                candidates: names.join(", "),
            });
        }
        if let Some(m) = candidates.pop() {
            return Ok(Class::Optional(Some(m)));
        }

        let negative_options = node
            .optionals()
            .flat_map(|a| a.option_strings.iter())
            .any(|o| is_negative_number(o));
        if is_negative_number(text) && !negative_options {
            return Ok(Class::Positional);
        }
        if text.contains(' ') {
            return Ok(Class::Positional);
        }
        Ok(Class::Optional(None))
    }

    /// Consume one optional and its values; returns the next entry index.
    fn consume_optional(
        &mut self,
        state: &mut NodeState,
        entries: &[Entry<'_>],
        at: usize,
        mut m: OptMatch,
    ) -> Result<usize, Halt> {
        let grammar = self.grammar;
        let arguments = &grammar.node(state.id).arguments;
        let fail = Halt::at(state.id);
        let cursor = at + 1;

        loop {
            let arg = &arguments[m.index];
            let Some(explicit) = m.explicit.take() else {
                // values never cross a `--`
                let available = entries[cursor..]
                    .iter()
                    .take_while(|e| {
                        e.class == Class::Positional && state.separator.map_or(true, |s| e.token < s)
                    })
                    .count();
                let take = arg.arity.max.map_or(available, |max| max.min(available));
                if take < arg.arity.min {
                    return Err(fail(ParseError::MissingValue {
                        arg: arg.display_name(),
                        expected: expected_message(arg.arity),
                    }));
                }
                let values: Vec<&str> = entries[cursor..cursor + take].iter().map(|e| e.text).collect();
                self.take_action(state, m.index, &values)?;
                return Ok(cursor + take);
            };

            if arg.arity.takes_values() {
                if arg.arity.min > 1 {
                    return Err(fail(ParseError::MissingValue {
                        arg: arg.display_name(),
                        expected: expected_message(arg.arity),
                    }));
                }
                self.take_action(state, m.index, &[explicit.as_str()])?;
                return Ok(cursor);
            }

            // `-abc`: a flag followed by more short flags
            let single_dash = m.option.chars().nth(1).is_some_and(|c| c != '-');
            let mut rest = explicit.chars();
            let next = match (single_dash, rest.next()) {
                (true, Some(c)) => format!("-{c}"),
                _ => {
                    return Err(fail(ParseError::IgnoredExplicit {
                        arg: arg.display_name(),
                        value: explicit,
                    }))
                }
            };
            let Some(index) = find_option(arguments, &next) else {
                return Err(fail(ParseError::IgnoredExplicit {
                    arg: arg.display_name(),
                    value: explicit,
                }));
            };
            self.take_action(state, m.index, &[])?;
            let rest: String = rest.collect();
            m = OptMatch {
                index,
                option: next,
                explicit: (!rest.is_empty()).then_some(rest),
            };
        }
    }

    /// Match a run of positional entries against the remaining slots.
    fn consume_positionals(
        &mut self,
        state: &mut NodeState,
        tokens: &[Token<'_>],
        entries: &[Entry<'_>],
        start: usize,
        run_end: usize,
    ) -> Result<Consumed, Halt> {
        let grammar = self.grammar;
        let arguments = &grammar.node(state.id).arguments;
        let run = run_end - start;
        let remaining: Vec<Slot> = state.slots[state.next_slot..].to_vec();

        for k in (1..=remaining.len()).rev() {
            let prefix = &remaining[..k];

            if let Some(g) = prefix.iter().position(|s| *s == Slot::Group) {
                let before = arities(arguments, &prefix[..g]);
                let after = arities(arguments, &prefix[g + 1..]);
                let Some(alloc) = allocate(&before, run - 1) else {
                    continue;
                };
                let name_at = start + alloc.iter().sum::<usize>();
                let tail: usize = after.iter().map(|a| a.min).sum();
                let tail_start = match entries.len().checked_sub(tail) {
                    Some(t) if t > name_at => t,
                    _ => continue,
                };
                if entries[tail_start..]
                    .iter()
                    .any(|e| e.class != Class::Positional)
                {
                    continue;
                }

                let mut cursor = start;
                for (slot, count) in prefix[..g].iter().zip(&alloc) {
                    self.take_slot(state, *slot, entries, cursor, *count)?;
                    cursor += count;
                }

                let child_end = entries.get(tail_start).map_or(tokens.len(), |e| e.token);
                self.dispatch(state, tokens, &entries[name_at], child_end)?;

                let mut cursor = tail_start;
                for (slot, arity) in prefix[g + 1..].iter().zip(&after) {
                    self.take_slot(state, *slot, entries, cursor, arity.min)?;
                    cursor += arity.min;
                }
                state.next_slot += k;
                return Ok(Consumed::Dispatched);
            }

            let wanted = arities(arguments, prefix);
            let Some(alloc) = allocate(&wanted, run) else {
                continue;
            };
            let mut used = k;
            while used > 0 && alloc[used - 1] == 0 && wanted[used - 1].min == 0 {
                used -= 1;
            }

            let mut cursor = start;
            for (slot, count) in prefix[..used].iter().zip(&alloc) {
                self.take_slot(state, *slot, entries, cursor, *count)?;
                cursor += count;
            }
            state.next_slot += used;
            return Ok(Consumed::Upto(cursor));
        }

        Ok(Consumed::Upto(start))
    }

    fn take_slot(
        &mut self,
        state: &mut NodeState,
        slot: Slot,
        entries: &[Entry<'_>],
        at: usize,
        count: usize,
    ) -> Result<(), Halt> {
        if let Slot::Argument(index) = slot {
            let values: Vec<&str> = entries[at..at + count].iter().map(|e| e.text).collect();
            self.take_action(state, index, &values)?;
        }
        Ok(())
    }

    /// Select the subcommand named by `name` and match the rest of the input.
    fn dispatch(
        &mut self,
        state: &mut NodeState,
        tokens: &[Token<'_>],
        name: &Entry<'_>,
        end: usize,
    ) -> Result<(), Halt> {
        let grammar = self.grammar;
        let separator = state.separator;
        let Some(group) = grammar.group_of(state.id) else {
            return Ok(());
        };
        let Some(child) = group.find(name.text) else {
            let choices: Vec<String> = group.names().map(|n| format!("'{n}'")).collect();
            return Err(Halt::at(state.id)(ParseError::UnknownSubcommand {
                arg: group.display_name(),
                name: name.text.to_string(),
                choices: choices.join(", "),
            }));
        };

        trace!(group = %group.id, subcommand = name.text, "dispatching");
        self.values
            .insert(group.dest.clone(), Value::String(name.text.to_string()));
        state.dispatched = true;

        let start = name.token + 1;
        let child_tokens: Vec<Token> = tokens[start..end.max(start)]
            .iter()
            .enumerate()
            .map(|(offset, token)| Token {
                text: token.text,
                literal: token.literal || separator.is_some_and(|s| start + offset > s),
            })
            .collect();
        self.parse_node(child, &child_tokens)
    }

    fn take_action(
        &mut self,
        state: &mut NodeState,
        index: usize,
        values: &[&str],
    ) -> Result<(), Halt> {
        let grammar = self.grammar;
        let node = grammar.node(state.id);
        let arg = &node.arguments[index];
        state.seen[index] = true;

        let value = match arg.kind {
            ArgKind::Help => return Err(Halt::Help(state.id)),
            ArgKind::Version => {
                let text = arg.version.as_deref().unwrap_or_default();
                return Err(Halt::Version(state.id, text.replace("%(prog)s", &node.prog)));
            }
            ArgKind::StoreTrue => Value::Bool(true),
            ArgKind::StoreFalse => Value::Bool(false),
            ArgKind::StoreConst => arg.constant.clone(),
            ArgKind::Count => {
                let current = self
                    .values
                    .get(&arg.dest)
                    .or(arg.default.as_ref())
                    .and_then(Value::as_i64)
                    .unwrap_or(0);
                Value::from(current + 1)
            }
            ArgKind::AppendConst => self.appended(arg, arg.constant.clone()),
            ArgKind::Store => convert_values(arg, values).map_err(Halt::at(state.id))?,
            ArgKind::Append => {
                let value = convert_values(arg, values).map_err(Halt::at(state.id))?;
                self.appended(arg, value)
            }
        };

        trace!(dest = %arg.dest, %value, "stored value");
        self.values.insert(arg.dest.clone(), value);
        Ok(())
    }

    fn appended(&self, arg: &Argument, value: Value) -> Value {
        let mut list = match self.values.get(&arg.dest).or(arg.default.as_ref()) {
            Some(Value::Array(items)) => items.clone(),
            _ => Vec::new(),
        };
        list.push(value);
        Value::Array(list)
    }

    fn check_required(&self, state: &NodeState) -> Result<(), ParseError> {
        let node = self.grammar.node(state.id);
        let group = self.grammar.group_of(state.id);
        let mut missing = Vec::new();
        let mut positionals = 0;
        let mut group_checked = false;

        let check_group = |missing: &mut Vec<String>| {
            if let Some(group) = group {
                if group.required && !state.dispatched {
                    missing.push(group.display_name());
                }
            }
        };

        for (index, arg) in node.arguments.iter().enumerate() {
            if arg.is_positional() {
                if positionals == node.group_position && !group_checked {
                    check_group(&mut missing);
                    group_checked = true;
                }
                positionals += 1;
            }
            if arg.required && !state.seen[index] {
                missing.push(arg.display_name());
            }
        }
        if !group_checked {
            check_group(&mut missing);
        }

        if missing.is_empty() {
            Ok(())
        } else {
            Err(ParseError::MissingRequired(missing))
        }
    }

    /// Layer defaults along the matched path, then the matched values.
    fn into_result(self) -> ResultMap {
        let mut result = ResultMap::new();
        for id in &self.path {
            let node = self.grammar.node(*id);
            let mut defaults = ResultMap::new();
            for arg in node.arguments.iter().filter(|a| a.stores_value()) {
                defaults
                    .entry(arg.dest.clone())
                    .or_insert_with(|| arg.implicit_default());
            }
            if let Some(group) = self.grammar.group_of(*id) {
                defaults.entry(group.dest.clone()).or_insert(Value::Null);
            }
            for (key, value) in &node.defaults {
                defaults.insert(key.clone(), Value::String(value.clone()));
            }
            result.extend(defaults);
        }
        result.extend(self.values);
        result
    }
}

fn find_option(arguments: &[Argument], option: &str) -> Option<usize> {
    arguments
        .iter()
        .position(|a| a.option_strings.iter().any(|o| o == option))
}

/// Unique-prefix candidates for an unknown option token.
fn prefix_matches(arguments: &[Argument], text: &str) -> Vec<OptMatch> {
    let mut matches = Vec::new();

    if text.starts_with("--") {
        let (prefix, explicit) = match text.split_once('=') {
            Some((p, v)) => (p, Some(v.to_string())),
            None => (text, None),
        };
        for (index, arg) in arguments.iter().enumerate() {
            for option in arg.option_strings.iter().filter(|o| o.starts_with(prefix)) {
                matches.push(OptMatch {
                    index,
                    option: option.clone(),
                    explicit: explicit.clone(),
                });
            }
        }
        return matches;
    }

    let short: String = text.chars().take(2).collect();
    let short_rest: String = text.chars().skip(2).collect();
    for (index, arg) in arguments.iter().enumerate() {
        for option in &arg.option_strings {
            if *option == short {
                matches.push(OptMatch {
                    index,
                    option: option.clone(),
                    explicit: Some(short_rest.clone()),
                });
            } else if !option.starts_with("--") && option.starts_with(text) {
                matches.push(OptMatch {
                    index,
                    option: option.clone(),
                    explicit: None,
                });
            }
        }
    }
    matches
}

/// `-1`, `-2.5`, `-.5`
fn is_negative_number(text: &str) -> bool {
    let digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    let Some(rest) = text.strip_prefix('-') else {
        return false;
    };
    match rest.split_once('.') {
        None => digits(rest),
        Some((whole, frac)) => (whole.is_empty() || digits(whole)) && digits(frac),
    }
}

fn arities(arguments: &[Argument], slots: &[Slot]) -> Vec<Arity> {
    slots
        .iter()
        .map(|slot| match slot {
            Slot::Argument(index) => arguments[*index].arity,
            Slot::Group => Arity::ONE,
        })
        .collect()
}

/// Greedy left-to-right allocation that reserves each later slot's minimum.
fn allocate(arities: &[Arity], available: usize) -> Option<Vec<usize>> {
    let needed: usize = arities.iter().map(|a| a.min).sum();
    if needed > available {
        return None;
    }

    let mut left = available;
    let mut reserve = needed;
    let mut counts = Vec::with_capacity(arities.len());
    for arity in arities {
        reserve -= arity.min;
        let room = left - reserve;
        let count = arity.max.map_or(room, |max| max.min(room));
        counts.push(count);
        left -= count;
    }
    Some(counts)
}

fn expected_message(arity: Arity) -> String {
    match arity {
        Arity { min: 1, max: None } => "expected at least one argument".to_string(),
        Arity { min: 1, .. } => "expected one argument".to_string(),
        Arity { min, .. } => format!("expected {min} arguments"),
    }
}

fn convert_one(arg: &Argument, raw: &str) -> Result<Value, ParseError> {
    let value = arg
        .converter
        .convert(raw)
        .map_err(|source| ParseError::InvalidValue {
            arg: arg.display_name(),
            source,
        })?;
    if let Some(choices) = &arg.choices {
        if !choices.contains(&value) {
            return Err(ParseError::InvalidChoice {
                arg: arg.display_name(),
                value: display_quoted(&value),
                choices: choices.listing(),
            });
        }
    }
    Ok(value)
}

/// Shape matched strings into the stored value.
fn convert_values(arg: &Argument, values: &[&str]) -> Result<Value, ParseError> {
    match (arg.nargs, values) {
        (None, [raw, ..]) => convert_one(arg, raw),
        (None, []) => Ok(Value::Null),
        (Some(Nargs::Optional), [raw, ..]) => convert_one(arg, raw),
        (Some(Nargs::Optional), []) if arg.is_positional() => Ok(arg.implicit_default()),
        (Some(Nargs::Optional), []) => Ok(arg.constant.clone()),
        (Some(Nargs::ZeroOrMore), []) if arg.is_positional() => Ok(arg
            .default
            .clone()
            .unwrap_or_else(|| Value::Array(Vec::new()))),
        (Some(_), values) => values
            .iter()
            .map(|raw| convert_one(arg, raw))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{
        Action, AddArgument, AddSubcommand, AddSubparserGroup, NewParser, SetDefaults, Target,
    };
    use serde_json::json;

    fn args(s: &[&str]) -> Vec<String> {
        s.iter().map(|s| s.to_string()).collect()
    }

    fn new(name: &str) -> Action {
        Action::NewParser(NewParser {
            name: name.to_string(),
            description: None,
            epilog: None,
        })
    }

    /// `aliases` is space separated; attrs are `--key value` words.
    fn arg_in(target: Target, aliases: &str, attrs: &[&str]) -> Action {
        let mut rest: Vec<String> = aliases.split(' ').map(String::from).collect();
        rest.push("--".to_string());
        rest.extend(attrs.iter().map(|s| s.to_string()));
        Action::AddArgument(AddArgument::from_command_line(target, &rest).unwrap())
    }

    fn arg(aliases: &str, attrs: &[&str]) -> Action {
        arg_in(Target::default(), aliases, attrs)
    }

    fn group_in(target: Target, id: &str, required: bool) -> Action {
        Action::AddSubparserGroup(AddSubparserGroup {
            target,
            id: Some(id.to_string()),
            required,
            ..Default::default()
        })
    }

    fn subcommand(name: &str) -> Action {
        Action::AddSubcommand(AddSubcommand {
            group: None,
            name: name.to_string(),
            help: None,
        })
    }

    fn defaults_in(target: Target, key: &str, value: &str) -> Action {
        Action::SetDefaults(SetDefaults {
            target,
            values: vec![(key.to_string(), value.to_string())],
        })
    }

    fn on(group: Option<&str>, subcommand: Option<&str>) -> Target {
        Target::new(group.map(String::from), subcommand.map(String::from))
    }

    fn build(actions: Vec<Action>) -> Grammar {
        Grammar::replay(&actions).unwrap()
    }

    fn parse(grammar: &Grammar, input: &[&str]) -> Result<ParseOutcome, ParseFailure> {
        parse_args(grammar, &args(input))
    }

    fn unwrap_success(outcome: Result<ParseOutcome, ParseFailure>) -> ResultMap {
        match outcome {
            Ok(ParseOutcome::Success(map)) => map,
            other => panic!("Expected Success, got {:?}", other),
        }
    }

    fn unwrap_error(outcome: Result<ParseOutcome, ParseFailure>) -> ParseFailure {
        match outcome {
            Err(failure) => failure,
            other => panic!("Expected failure, got {:?}", other),
        }
    }

    fn foobar_feefie() -> Grammar {
        build(vec![
            new("myprog"),
            group_in(Target::default(), "foobar", true),
            subcommand("foo"),
            subcommand("bar"),
            group_in(on(None, Some("foo")), "feefie", true),
            subcommand("fee"),
            defaults_in(on(None, Some("fee")), "myfooarg", "fee"),
            subcommand("fie"),
            defaults_in(on(None, Some("fie")), "myfooarg", "fie"),
            arg_in(on(Some("foobar"), Some("foo")), "qux", &[]),
            defaults_in(on(Some("foobar"), Some("foo")), "myarg", "foo"),
            arg_in(on(Some("foobar"), Some("bar")), "baz", &[]),
            defaults_in(on(Some("foobar"), Some("bar")), "myarg", "bar"),
        ])
    }

    #[test]
    fn test_no_arguments_yields_empty_map() {
        let grammar = build(vec![new("myprog")]);
        assert!(unwrap_success(parse(&grammar, &[])).is_empty());
    }

    #[test]
    fn test_stray_positional_is_unrecognized() {
        let grammar = build(vec![new("myprog")]);
        let failure = unwrap_error(parse(&grammar, &["foobar"]));
        assert_eq!(failure.node, Grammar::ROOT);
        assert_eq!(failure.to_string(), "unrecognized arguments: foobar");
        assert_eq!(failure.error.kind(), ErrorKind::UnrecognizedArguments);
    }

    #[test]
    fn test_help_flag_short_and_long() {
        let grammar = build(vec![new("myprog")]);
        assert_eq!(
            parse(&grammar, &["-h"]),
            Ok(ParseOutcome::Help(Grammar::ROOT))
        );
        assert_eq!(
            parse(&grammar, &["--help"]),
            Ok(ParseOutcome::Help(Grammar::ROOT))
        );
        assert_eq!(
            parse(&grammar, &["--he"]),
            Ok(ParseOutcome::Help(Grammar::ROOT))
        );
    }

    #[test]
    fn test_help_stops_before_later_errors() {
        let grammar = build(vec![new("myprog"), arg("--n", &["--type", "int"])]);
        assert_eq!(
            parse(&grammar, &["-h", "--n", "abc", "stray"]),
            Ok(ParseOutcome::Help(Grammar::ROOT))
        );
    }

    #[test]
    fn test_positional_with_quote() {
        let grammar = build(vec![new("myprog"), arg("arg0", &["--help", "arg0 help test"])]);
        let result = unwrap_success(parse(&grammar, &["VALUE '0'"]));
        assert_eq!(result, ResultMap::from([("arg0".to_string(), json!("VALUE '0'"))]));
    }

    #[test]
    fn test_parse_flag_long_and_default() {
        let grammar = build(vec![arg("-v --verbose", &["--action", "store_true"])]);
        assert_eq!(unwrap_success(parse(&grammar, &["--verbose"]))["verbose"], json!(true));
        assert_eq!(unwrap_success(parse(&grammar, &[]))["verbose"], json!(false));
    }

    #[test]
    fn test_parse_combined_short_flags() {
        let grammar = build(vec![
            arg("-a", &["--action", "store_true"]),
            arg("-b", &["--action", "store_false"]),
            arg("-c", &["--action", "count"]),
        ]);
        let result = unwrap_success(parse(&grammar, &["-abcc"]));
        assert_eq!(result["a"], json!(true));
        assert_eq!(result["b"], json!(false));
        assert_eq!(result["c"], json!(2));
    }

    #[test]
    fn test_short_flag_then_option_value() {
        let grammar = build(vec![
            arg("-v", &["--action", "store_true"]),
            arg("-o", &[]),
        ]);
        let attached = unwrap_success(parse(&grammar, &["-vofile.txt"]));
        assert_eq!(attached["v"], json!(true));
        assert_eq!(attached["o"], json!("file.txt"));

        let separate = unwrap_success(parse(&grammar, &["-vo", "file.txt"]));
        assert_eq!(separate["o"], json!("file.txt"));
    }

    #[test]
    fn test_parse_option_forms() {
        let grammar = build(vec![arg("-o --output", &[])]);
        let inputs: [&[&str]; 5] = [
            &["--output", "out.txt"],
            &["--output=out.txt"],
            &["-o", "out.txt"],
            &["-oout.txt"],
            &["--out", "out.txt"],
        ];
        for input in inputs {
            let result = unwrap_success(parse(&grammar, input));
            assert_eq!(result["output"], json!("out.txt"), "{input:?}");
        }
        let empty = unwrap_success(parse(&grammar, &["--output="]));
        assert_eq!(empty["output"], json!(""));
    }

    #[test]
    fn test_ambiguous_prefix() {
        let grammar = build(vec![arg("--foo", &[]), arg("--far", &[])]);
        let failure = unwrap_error(parse(&grammar, &["--f", "x"]));
        assert_eq!(
            failure.to_string(),
            "ambiguous option: --f could match --foo, --far"
        );
    }

    #[test]
    fn test_missing_option_value() {
        let grammar = build(vec![arg("-o --output", &[])]);
        let failure = unwrap_error(parse(&grammar, &["--output"]));
        assert_eq!(failure.to_string(), "argument -o/--output: expected one argument");
        assert_eq!(failure.error.kind(), ErrorKind::MissingRequired);
    }

    #[test]
    fn test_explicit_value_on_flag() {
        let grammar = build(vec![arg("--quiet", &["--action", "store_true"])]);
        let failure = unwrap_error(parse(&grammar, &["--quiet=yes"]));
        assert_eq!(
            failure.to_string(),
            "argument --quiet: ignored explicit argument 'yes'"
        );
    }

    #[test]
    fn test_type_coercion_error() {
        let grammar = build(vec![arg("--count", &["--type", "int"])]);
        let failure = unwrap_error(parse(&grammar, &["--count", "many"]));
        assert_eq!(failure.to_string(), "argument --count: invalid int value: 'many'");
        assert_eq!(failure.error.kind(), ErrorKind::TypeCoercion);

        let ok = unwrap_success(parse(&grammar, &["--count", "3"]));
        assert_eq!(ok["count"], json!(3));
    }

    #[test]
    fn test_choice_violation() {
        let grammar = build(vec![arg("mode", &["--choices", "fast,slow"])]);
        let failure = unwrap_error(parse(&grammar, &["medium"]));
        assert_eq!(
            failure.to_string(),
            "argument mode: invalid choice: 'medium' (choose from 'fast', 'slow')"
        );
        assert_eq!(failure.error.kind(), ErrorKind::ChoiceViolation);
    }

    #[test]
    fn test_quoted_choice_with_space() {
        let grammar = build(vec![arg("mode", &["--choices", "[a, 'b c']"])]);
        assert_eq!(unwrap_success(parse(&grammar, &["b c"]))["mode"], json!("b c"));
        assert_eq!(unwrap_success(parse(&grammar, &["a"]))["mode"], json!("a"));
        let failure = unwrap_error(parse(&grammar, &[" b c"]));
        assert_eq!(
            failure.to_string(),
            "argument mode: invalid choice: ' b c' (choose from 'a', 'b c')"
        );
    }

    #[test]
    fn test_range_choices() {
        let grammar = build(vec![arg("--level", &["--choices", "1..=3"])]);
        assert_eq!(unwrap_success(parse(&grammar, &["--level", "2"]))["level"], json!(2));
        let failure = unwrap_error(parse(&grammar, &["--level", "7"]));
        assert_eq!(
            failure.to_string(),
            "argument --level: invalid choice: 7 (choose from range(1, 4))"
        );
    }

    #[test]
    fn test_missing_required_listed_together() {
        let grammar = build(vec![
            arg("a", &[]),
            arg("-f --foo", &["--required"]),
            arg("b", &[]),
        ]);
        let failure = unwrap_error(parse(&grammar, &[]));
        assert_eq!(
            failure.to_string(),
            "the following arguments are required: a, -f/--foo, b"
        );
        assert_eq!(failure.error.kind(), ErrorKind::MissingRequired);
    }

    #[test]
    fn test_nargs_shapes() {
        let grammar = build(vec![
            arg("--pair", &["--nargs", "2", "--type", "int"]),
            arg("--maybe", &["--nargs", "?", "--const", "c"]),
            arg("--many", &["--nargs", "*"]),
            arg("files", &["--nargs", "+"]),
        ]);
        let result = unwrap_success(parse(
            &grammar,
            &["--pair", "1", "2", "--maybe", "--many", "x", "y", "--", "a", "-b"],
        ));
        assert_eq!(result["pair"], json!([1, 2]));
        assert_eq!(result["maybe"], json!("c"));
        assert_eq!(result["many"], json!(["x", "y"]));
        assert_eq!(result["files"], json!(["a", "-b"]));

        let failure = unwrap_error(parse(&grammar, &["f", "--pair", "1"]));
        assert_eq!(failure.to_string(), "argument --pair: expected 2 arguments");
    }

    #[test]
    fn test_nargs_optional_const_fills_bare_option() {
        let grammar = build(vec![arg(
            "--level",
            &["--nargs", "?", "--type", "int", "--const", "1", "--default", "0"],
        )]);
        assert_eq!(unwrap_success(parse(&grammar, &[]))["level"], json!(0));
        assert_eq!(unwrap_success(parse(&grammar, &["--level"]))["level"], json!(1));
        assert_eq!(unwrap_success(parse(&grammar, &["--level", "5"]))["level"], json!(5));
    }

    #[test]
    fn test_nargs_optional_with_const_missing() {
        let grammar = build(vec![arg("--maybe", &["--nargs", "?"])]);
        assert_eq!(unwrap_success(parse(&grammar, &["--maybe"]))["maybe"], Value::Null);
        assert_eq!(unwrap_success(parse(&grammar, &["--maybe", "v"]))["maybe"], json!("v"));
    }

    #[test]
    fn test_append_and_append_const() {
        let grammar = build(vec![
            arg("-I", &["--action", "append"]),
            arg("--fast", &["--append-const", "fast", "--dest", "modes"]),
            arg("--slow", &["--append-const", "slow", "--dest", "modes"]),
        ]);
        let result = unwrap_success(parse(&grammar, &["-I", "a", "-Ib", "--slow", "--fast"]));
        assert_eq!(result["I"], json!(["a", "b"]));
        assert_eq!(result["modes"], json!(["slow", "fast"]));
    }

    #[test]
    fn test_store_const_and_default() {
        let grammar = build(vec![arg("--fast", &["--store-const", "yes", "--default", "no"])]);
        assert_eq!(unwrap_success(parse(&grammar, &[]))["fast"], json!("no"));
        assert_eq!(unwrap_success(parse(&grammar, &["--fast"]))["fast"], json!("yes"));
    }

    #[test]
    fn test_negative_numbers_are_positional() {
        let grammar = build(vec![arg("n", &["--type", "int"]), arg("-v", &["--action", "count"])]);
        let result = unwrap_success(parse(&grammar, &["-5", "-v"]));
        assert_eq!(result["n"], json!(-5));
        assert_eq!(result["v"], json!(1));
    }

    #[test]
    fn test_double_dash_separator() {
        let grammar = build(vec![arg("-v", &["--action", "store_true"]), arg("input", &[])]);
        let result = unwrap_success(parse(&grammar, &["--", "-v"]));
        assert_eq!(result["v"], json!(false));
        assert_eq!(result["input"], json!("-v"));
    }

    #[test]
    fn test_positionals_reserve_later_minimums() {
        let grammar = build(vec![arg("srcs", &["--nargs", "+"]), arg("dest", &[])]);
        let result = unwrap_success(parse(&grammar, &["a", "b", "c"]));
        assert_eq!(result["srcs"], json!(["a", "b"]));
        assert_eq!(result["dest"], json!("c"));
    }

    #[test]
    fn test_positionals_split_by_optionals() {
        let grammar = build(vec![arg("-o", &[]), arg("input", &[]), arg("extra", &["--nargs", "*"])]);
        let result = unwrap_success(parse(&grammar, &["in.txt", "-o", "out.txt", "x", "y"]));
        assert_eq!(result["input"], json!("in.txt"));
        assert_eq!(result["o"], json!("out.txt"));
        assert_eq!(result["extra"], json!(["x", "y"]));

        let empty = unwrap_success(parse(&grammar, &["in.txt"]));
        assert_eq!(empty["extra"], json!([]));
    }

    #[test]
    fn test_unknown_option_is_unrecognized() {
        let grammar = build(vec![arg("input", &[])]);
        let failure = unwrap_error(parse(&grammar, &["--unknown", "in.txt"]));
        assert_eq!(failure.to_string(), "unrecognized arguments: --unknown");
    }

    #[test]
    fn test_version_action() {
        let grammar = build(vec![new("tool"), arg("-V --version", &["--version", "%(prog)s 2.1"])]);
        assert_eq!(
            parse(&grammar, &["-V"]),
            Ok(ParseOutcome::Version {
                node: Grammar::ROOT,
                text: "tool 2.1".to_string()
            })
        );
    }

    #[test]
    fn test_two_level_subcommands() {
        let grammar = foobar_feefie();
        let expected = |feefie: &str, qux: &str| {
            ResultMap::from([
                ("feefie".to_string(), json!(feefie)),
                ("foobar".to_string(), json!("foo")),
                ("myarg".to_string(), json!("foo")),
                ("myfooarg".to_string(), json!(feefie)),
                ("qux".to_string(), json!(qux)),
            ])
        };
        assert_eq!(
            unwrap_success(parse(&grammar, &["foo", "fee", "qux0"])),
            expected("fee", "qux0")
        );
        assert_eq!(
            unwrap_success(parse(&grammar, &["foo", "fie", "qux1"])),
            expected("fie", "qux1")
        );
        assert_eq!(
            unwrap_success(parse(&grammar, &["bar", "baz0"])),
            ResultMap::from([
                ("baz".to_string(), json!("baz0")),
                ("foobar".to_string(), json!("bar")),
                ("myarg".to_string(), json!("bar")),
            ])
        );
    }

    #[test]
    fn test_required_group_missing() {
        let grammar = foobar_feefie();
        let failure = unwrap_error(parse(&grammar, &[]));
        assert_eq!(failure.to_string(), "the following arguments are required: foobar");

        let nested = unwrap_error(parse(&grammar, &["foo"]));
        assert_ne!(nested.node, Grammar::ROOT);
        assert_eq!(
            nested.to_string(),
            "the following arguments are required: feefie, qux"
        );
    }

    #[test]
    fn test_unknown_subcommand() {
        let grammar = foobar_feefie();
        let failure = unwrap_error(parse(&grammar, &["baz"]));
        assert_eq!(
            failure.to_string(),
            "argument foobar: invalid choice: 'baz' (choose from 'foo', 'bar')"
        );
        assert_eq!(failure.error.kind(), ErrorKind::UnrecognizedArguments);
    }

    #[test]
    fn test_subcommand_help_reports_child() {
        let grammar = foobar_feefie();
        match parse(&grammar, &["foo", "fee", "-h"]) {
            Ok(ParseOutcome::Help(node)) => {
                assert_eq!(grammar.node(node).prog, "myprog foo fee")
            }
            other => panic!("Expected Help, got {:?}", other),
        }
    }

    #[test]
    fn test_optional_group_defaults() {
        let grammar = build(vec![
            new("myprog"),
            defaults_in(Target::default(), "key0", "value0"),
            Action::AddSubparserGroup(AddSubparserGroup {
                id: Some("foobar".into()),
                ..Default::default()
            }),
            subcommand("foo"),
            defaults_in(on(None, Some("foo")), "cmd", "foo"),
            subcommand("bar"),
            defaults_in(on(None, Some("bar")), "cmd", "bar"),
        ]);
        assert_eq!(
            unwrap_success(parse(&grammar, &[])),
            ResultMap::from([
                ("foobar".to_string(), Value::Null),
                ("key0".to_string(), json!("value0")),
            ])
        );
        assert_eq!(unwrap_success(parse(&grammar, &["bar"]))["cmd"], json!("bar"));
    }

    #[test]
    fn test_child_options_after_subcommand() {
        let grammar = build(vec![
            arg("-v", &["--action", "store_true"]),
            group_in(Target::default(), "cmd", true),
            subcommand("run"),
            arg_in(on(Some("cmd"), Some("run")), "--jobs", &["--type", "int"]),
        ]);
        let result = unwrap_success(parse(&grammar, &["-v", "run", "--jobs", "4"]));
        assert_eq!(result["v"], json!(true));
        assert_eq!(result["cmd"], json!("run"));
        assert_eq!(result["jobs"], json!(4));

        // `-v` belongs to the root only
        let failure = unwrap_error(parse(&grammar, &["run", "-v"]));
        assert_eq!(failure.to_string(), "unrecognized arguments: -v");
    }

    #[test]
    fn test_positionals_around_group() {
        let grammar = build(vec![
            arg("first", &[]),
            group_in(Target::default(), "cmd", true),
            subcommand("go"),
            arg_in(on(Some("cmd"), Some("go")), "speed", &[]),
            arg("last", &[]),
        ]);
        let result = unwrap_success(parse(&grammar, &["a", "go", "fast", "z"]));
        assert_eq!(result["first"], json!("a"));
        assert_eq!(result["cmd"], json!("go"));
        assert_eq!(result["speed"], json!("fast"));
        assert_eq!(result["last"], json!("z"));
    }

    #[test]
    fn test_separator_before_subcommand_is_inherited() {
        let grammar = build(vec![
            group_in(Target::default(), "cmd", true),
            subcommand("echo"),
            arg_in(on(Some("cmd"), Some("echo")), "words", &["--nargs", "*"]),
        ]);
        let result = unwrap_success(parse(&grammar, &["--", "echo", "-n", "hi"]));
        assert_eq!(result["words"], json!(["-n", "hi"]));

        let inner = unwrap_success(parse(&grammar, &["echo", "--", "-n"]));
        assert_eq!(inner["words"], json!(["-n"]));
    }

    #[test]
    fn test_help_is_idempotent() {
        let grammar = foobar_feefie();
        let first = parse(&grammar, &["-h"]);
        let second = parse(&grammar, &["-h"]);
        assert_eq!(first, second);
    }

    #[test]
    fn test_allocate() {
        let one = Arity::ONE;
        let star = Arity { min: 0, max: None };
        let plus = Arity { min: 1, max: None };
        assert_eq!(allocate(&[plus, one], 3), Some(vec![2, 1]));
        assert_eq!(allocate(&[star, one], 1), Some(vec![0, 1]));
        assert_eq!(allocate(&[one, one], 1), None);
        assert_eq!(allocate(&[one, star], 1), Some(vec![1, 0]));
    }

    #[test]
    fn test_is_negative_number() {
        assert!(is_negative_number("-1"));
        assert!(is_negative_number("-2.5"));
        assert!(is_negative_number("-.5"));
        assert!(!is_negative_number("-x"));
        assert!(!is_negative_number("-"));
        assert!(!is_negative_number("-1."));
    }
}
