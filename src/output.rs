//! Serializing a result map for the calling shell.
//!
//! Every format is a plain function over the result map plus the format's own
//! flags. Output is rendered into a buffer and written in one piece, so the
//! sink receives either a complete result or nothing.

use crate::parser::ResultMap;
use clap::{Parser, ValueEnum};
use serde::Serialize;
use serde_json::ser::PrettyFormatter;
use serde_json::Value;
use std::io::Write;
use thiserror::Error;

/// Errors raised while formatting a result.
#[derive(Debug, Error)]
pub enum FormatError {
    /// The format's own flags were invalid (or `-h` was given)
    #[error(transparent)]
    Args(#[from] clap::Error),

    #[error("failed to serialize result: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to write result: {0}")]
    Io(#[from] std::io::Error),
}

/// Output formats understood by `parse --format`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum Format {
    /// One `KEY=VALUE` assignment per line
    #[default]
    Shell,
    /// A bash associative array
    #[value(name = "assoc_array")]
    AssocArray,
    /// A JSON object
    Json,
}

type Formatter = fn(&ResultMap, &[String], &mut dyn Write) -> Result<(), FormatError>;

impl Format {
    pub fn name(self) -> &'static str {
        match self {
            Format::Shell => "shell",
            Format::AssocArray => "assoc_array",
            Format::Json => "json",
        }
    }

    fn formatter(self) -> Formatter {
        match self {
            Format::Shell => write_shell,
            Format::AssocArray => write_assoc_array,
            Format::Json => write_json,
        }
    }

    /// Render `result` into `out` using this format and its `extra_args`.
    pub fn write(
        self,
        result: &ResultMap,
        extra_args: &[String],
        out: &mut dyn Write,
    ) -> Result<(), FormatError> {
        (self.formatter())(result, extra_args, out)
    }
}

/// Declare a variable for every parsed argument
#[derive(Parser, Debug)]
#[command(name = "argparsh parse --format shell", no_binary_name = true)]
struct ShellArgs {
    /// Prefix to add to every declared variable
    #[arg(short, long, default_value = "")]
    prefix: String,

    /// Export declarations to the environment
    #[arg(short, long, conflicts_with = "local")]
    export: bool,

    /// Declare variables as local
    #[arg(short, long)]
    local: bool,
}

/// Create an associative array from parsed arguments
#[derive(Parser, Debug)]
#[command(name = "argparsh parse --format assoc_array", no_binary_name = true)]
struct AssocArrayArgs {
    /// Name of the variable to output into
    #[arg(short, long)]
    name: String,
}

/// Print parsed arguments as a JSON object
#[derive(Parser, Debug)]
#[command(name = "argparsh parse --format json", no_binary_name = true)]
struct JsonArgs {}

fn write_shell(
    result: &ResultMap,
    extra_args: &[String],
    out: &mut dyn Write,
) -> Result<(), FormatError> {
    let args = ShellArgs::try_parse_from(extra_args)?;
    let scope = if args.export {
        "export "
    } else if args.local {
        "local "
    } else {
        ""
    };

    let mut buf = String::new();
    for (key, value) in result {
        buf.push_str(&format!(
            "{scope}{}{}={}\n",
            args.prefix,
            to_shell_var_name(key),
            shell_literal(value)
        ));
    }
    out.write_all(buf.as_bytes())?;
    Ok(())
}

fn write_assoc_array(
    result: &ResultMap,
    extra_args: &[String],
    out: &mut dyn Write,
) -> Result<(), FormatError> {
    let args = AssocArrayArgs::try_parse_from(extra_args)?;

    let mut buf = format!("declare -A {}\n", args.name);
    for (key, value) in result {
        buf.push_str(&format!(
            "{}[\"{}\"]={}\n",
            args.name,
            escape_shell_value(key),
            shell_literal(value)
        ));
    }
    out.write_all(buf.as_bytes())?;
    Ok(())
}

fn write_json(
    result: &ResultMap,
    extra_args: &[String],
    out: &mut dyn Write,
) -> Result<(), FormatError> {
    JsonArgs::try_parse_from(extra_args)?;

    let mut buf = Vec::new();
    let mut ser =
        serde_json::Serializer::with_formatter(&mut buf, PrettyFormatter::with_indent(b"    "));
    result.serialize(&mut ser)?;
    buf.push(b'\n');
    out.write_all(&buf)?;
    Ok(())
}

/// Escape a string for use inside shell double quotes.
///
/// Newlines stay literal so the value survives `eval` unchanged.
fn escape_shell_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '$' => escaped.push_str("\\$"),
            '`' => escaped.push_str("\\`"),
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            _ => escaped.push(c),
        }
    }
    escaped
}

fn to_shell_var_name(key: &str) -> String {
    key.replace('-', "_")
}

/// The right-hand side of an assignment for `value`.
fn shell_literal(value: &Value) -> String {
    match value {
        Value::String(s) => format!("\"{}\"", escape_shell_value(s)),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => "\"\"".to_string(),
        Value::Array(_) | Value::Object(_) => {
            format!("\"{}\"", escape_shell_value(&value.to_string()))
        }
    }
}
