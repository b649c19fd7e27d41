//! The `parse` verb: replay a state, match arguments and report on two sinks.
//!
//! `out` only ever receives a complete formatted result or a single
//! `exit <code>` line. Everything meant for a human goes to `diag`.

use crate::codec;
use crate::grammar::Grammar;
use crate::help::{error_text, full_help};
use crate::output::{Format, FormatError};
use crate::parser::{parse_args, ParseOutcome};
use std::io::{self, Write};
use tracing::debug;

/// Exit code for help, version and success.
pub const EXIT_OK: i32 = 0;
/// Exit code for a state that fails to decode or replay.
pub const EXIT_BUILD: i32 = 1;
/// Exit code for usage errors.
pub const EXIT_USAGE: i32 = 2;

/// Split the trailing arguments of `parse` at the first `--`.
///
/// Returns `(format_args, parse_args)`. Without a separator every argument is
/// matched against the grammar.
pub fn split_format_args(args: &[String]) -> (Vec<String>, Vec<String>) {
    match args.iter().position(|a| a == "--") {
        Some(sep) => (args[..sep].to_vec(), args[sep + 1..].to_vec()),
        None => (Vec::new(), args.to_vec()),
    }
}

/// Run a full parse and return the process exit code.
///
/// Only failures to write to the sinks are returned as errors.
pub fn run_parse(
    state: &str,
    format: Format,
    args: &[String],
    out: &mut dyn Write,
    diag: &mut dyn Write,
) -> io::Result<i32> {
    let (format_args, cli_args) = split_format_args(args);
    debug!(
        format = format.name(),
        format_args = format_args.len(),
        "running parse"
    );

    let grammar = match codec::decode(state)
        .map_err(|e| e.to_string())
        .and_then(|actions| Grammar::replay(&actions).map_err(|e| e.to_string()))
    {
        Ok(grammar) => grammar,
        Err(message) => {
            writeln!(diag, "argparsh: {message}")?;
            return sentinel(out, EXIT_BUILD);
        }
    };

    match parse_args(&grammar, &cli_args) {
        Ok(ParseOutcome::Success(result)) => match format.write(&result, &format_args, out) {
            Ok(()) => Ok(EXIT_OK),
            Err(FormatError::Args(err)) => {
                write!(diag, "{}", err.render())?;
                let code = if err.exit_code() == 0 {
                    EXIT_OK
                } else {
                    EXIT_USAGE
                };
                sentinel(out, code)
            }
            Err(FormatError::Json(err)) => {
                writeln!(diag, "argparsh: {err}")?;
                sentinel(out, EXIT_BUILD)
            }
            Err(FormatError::Io(err)) => Err(err),
        },
        Ok(ParseOutcome::Help(node)) => {
            write!(diag, "{}", full_help(&grammar, node))?;
            sentinel(out, EXIT_OK)
        }
        Ok(ParseOutcome::Version { text, .. }) => {
            writeln!(diag, "{text}")?;
            sentinel(out, EXIT_OK)
        }
        Err(failure) => {
            debug!(kind = ?failure.error.kind(), "matching failed");
            write!(
                diag,
                "{}",
                error_text(&grammar, failure.node, &failure.error.to_string())
            )?;
            sentinel(out, EXIT_USAGE)
        }
    }
}

fn sentinel(out: &mut dyn Write, code: i32) -> io::Result<i32> {
    writeln!(out, "exit {code}")?;
    Ok(code)
}
