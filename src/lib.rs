//! argparsh - argparse-style argument parsing for shell scripts.
//!
//! A script declares its grammar one invocation at a time. Each declaration
//! prints a state token; the script concatenates the tokens and finally hands
//! them to `parse` together with its own arguments, which replays the grammar,
//! matches the arguments and prints the result in a shell-consumable format.

pub mod action;
pub mod codec;
pub mod grammar;
pub mod help;
pub mod output;
pub mod parser;
pub mod run;
pub mod value;

pub use action::{
    Action, AddArgument, AddSubcommand, AddSubparserGroup, ArgAttrs, ArgKind, AttrError,
    NewParser, SetDefaults, Target,
};
pub use codec::{decode, encode, DecodeError, EncodeError};
pub use grammar::{BuildError, Grammar, NodeId};
pub use help::{error_text, format_usage, full_help, usage_line};
pub use output::{Format, FormatError};
pub use parser::{parse_args, ErrorKind, ParseError, ParseFailure, ParseOutcome, ResultMap};
pub use run::{run_parse, split_format_args};
