//! Usage, help and error text in argparse's layout.

use crate::grammar::{Argument, Grammar, NodeId, Slot};
use crate::value::Nargs;

/// Column at which help text starts at most.
const MAX_HELP_POSITION: usize = 24;
/// Indent of entries inside a section.
const SECTION_INDENT: usize = 2;

/// `prog [-h] [optionals...] positionals... {a,b} ...`, without the `usage: ` prefix.
pub fn usage_line(grammar: &Grammar, node: NodeId) -> String {
    let parser = grammar.node(node);
    let mut parts = vec![parser.prog.clone()];

    for arg in parser.optionals() {
        let Some(first) = arg.option_strings.first() else {
            continue;
        };
        let part = if arg.arity.takes_values() {
            format!("{first} {}", format_args(&arg.value_metavar(), arg.nargs))
        } else {
            first.clone()
        };
        parts.push(if arg.required {
            part
        } else {
            format!("[{part}]")
        });
    }

    for slot in parser.positional_slots() {
        match slot {
            Slot::Argument(index) => {
                let arg = &parser.arguments[index];
                let part = format_args(&arg.value_metavar(), arg.nargs);
                if !part.is_empty() {
                    parts.push(part);
                }
            }
            Slot::Group => {
                if let Some(group) = grammar.group_of(node) {
                    parts.push(format!("{} ...", group.display_metavar()));
                }
            }
        }
    }

    parts.join(" ")
}

/// `usage: <usage_line>\n`
pub fn format_usage(grammar: &Grammar, node: NodeId) -> String {
    format!("usage: {}\n", usage_line(grammar, node))
}

/// Usage followed by `<prog>: error: <message>`.
pub fn error_text(grammar: &Grammar, node: NodeId, message: &str) -> String {
    format!(
        "{}{}: error: {message}\n",
        format_usage(grammar, node),
        grammar.node(node).prog
    )
}

/// Complete help block for a node.
pub fn full_help(grammar: &Grammar, node: NodeId) -> String {
    let parser = grammar.node(node);

    let mut positionals = Vec::new();
    for slot in parser.positional_slots() {
        match slot {
            Slot::Argument(index) => {
                let arg = &parser.arguments[index];
                let help = arg.help_text();
                positionals.push(Row::new(SECTION_INDENT, arg.value_metavar(), &help));
            }
            Slot::Group => {
                let Some(group) = grammar.group_of(node) else {
                    continue;
                };
                positionals.push(Row::new(SECTION_INDENT, group.display_metavar(), &group.help));
                for (name, help, _) in &group.subcommands {
                    positionals.push(Row::new(SECTION_INDENT * 2, name.clone(), help));
                }
            }
        }
    }

    let options: Vec<Row> = parser
        .optionals()
        .map(|arg| Row::new(SECTION_INDENT, invocation(arg), &arg.help_text()))
        .collect();

    let widest = positionals
        .iter()
        .chain(&options)
        .map(|row| row.indent + row.invocation.chars().count())
        .max()
        .unwrap_or(0);
    let help_position = (widest + 2).min(MAX_HELP_POSITION);

    let mut blocks = vec![format_usage(grammar, node)];
    if let Some(description) = &parser.description {
        blocks.push(raw_block(description));
    }
    if !positionals.is_empty() {
        blocks.push(section("positional arguments:", &positionals, help_position));
    }
    if !options.is_empty() {
        blocks.push(section("options:", &options, help_position));
    }
    if let Some(epilog) = &parser.epilog {
        blocks.push(raw_block(epilog));
    }
    blocks.join("\n")
}

/// `M`, `[M]`, `[M ...]`, `M [M ...]` or `M M` for the given nargs.
fn format_args(metavar: &str, nargs: Option<Nargs>) -> String {
    match nargs {
        None => metavar.to_string(),
        Some(Nargs::Optional) => format!("[{metavar}]"),
        Some(Nargs::ZeroOrMore) => format!("[{metavar} ...]"),
        Some(Nargs::OneOrMore) => format!("{metavar} [{metavar} ...]"),
        Some(Nargs::Exactly(n)) => vec![metavar; n].join(" "),
    }
}

/// `-o OUT, --output OUT` or `-h, --help`.
fn invocation(arg: &Argument) -> String {
    if !arg.arity.takes_values() {
        return arg.option_strings.join(", ");
    }
    let args = format_args(&arg.value_metavar(), arg.nargs);
    arg.option_strings
        .iter()
        .map(|option| format!("{option} {args}"))
        .collect::<Vec<_>>()
        .join(", ")
}

struct Row {
    indent: usize,
    invocation: String,
    help: Option<String>,
}

impl Row {
    fn new(indent: usize, invocation: String, help: &Option<String>) -> Self {
        Self {
            indent,
            invocation,
            help: help.clone().filter(|h| !h.is_empty()),
        }
    }
}

fn section(title: &str, rows: &[Row], help_position: usize) -> String {
    let mut out = format!("{title}\n");
    for row in rows {
        let lead = " ".repeat(row.indent);
        let Some(help) = &row.help else {
            out.push_str(&format!("{lead}{}\n", row.invocation));
            continue;
        };

        let action_width = help_position.saturating_sub(row.indent + 2);
        let mut lines = help.lines();
        let first = lines.next().unwrap_or_default();
        if row.invocation.chars().count() <= action_width {
            out.push_str(&format!(
                "{lead}{:<action_width$}  {first}\n",
                row.invocation
            ));
        } else {
            out.push_str(&format!("{lead}{}\n", row.invocation));
            out.push_str(&format!("{}{first}\n", " ".repeat(help_position)));
        }
        for line in lines {
            out.push_str(&format!("{}{line}\n", " ".repeat(help_position)));
        }
    }
    out
}

fn raw_block(text: &str) -> String {
    if text.ends_with('\n') {
        text.to_string()
    } else {
        format!("{text}\n")
    }
}
