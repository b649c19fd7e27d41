//! argparsh - argparse-style argument parsing for shell scripts.

use anyhow::{ensure, Context, Result};
use argparsh::action::parse_key_values;
use argparsh::{
    encode, run_parse, Action, AddArgument, AddSubcommand, AddSubparserGroup, Format, NewParser,
    SetDefaults, Target,
};
use clap::{ArgAction, Parser, Subcommand};
use std::io::{self, Write};
use std::process;
use tracing::level_filters::LevelFilter;

/// Build an argument grammar one invocation at a time, then parse with it.
///
/// Every verb except `parse` prints a state token. Concatenate the tokens and
/// pass the result to `parse` along with the script's own arguments.
#[derive(Parser, Debug)]
#[command(name = "argparsh", version, about, disable_help_subcommand = true)]
struct Cli {
    /// Diagnostic log level written to stderr
    #[arg(long, env = "ARGPARSH_LOG", default_value_t = LevelFilter::OFF)]
    log: LevelFilter,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the root parser
    New {
        /// Program name shown in usage
        name: String,

        /// Text shown between usage and the argument sections
        #[arg(short, long)]
        description: Option<String>,

        /// Text shown after the argument sections
        #[arg(short, long)]
        epilog: Option<String>,
    },

    /// Add an argument: `add_arg <aliases...> -- --<attr> <value>...`
    #[command(name = "add_arg")]
    AddArg {
        /// Subparser group of the subcommand to add to
        #[arg(long)]
        subparserid: Option<String>,

        /// Subcommand to add to
        #[arg(long)]
        subcommand: Option<String>,

        /// Aliases, then `--` and the attribute list
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        rest: Vec<String>,
    },

    /// Attach a group of subcommands to a parser
    #[command(name = "add_subparser", disable_help_flag = true)]
    AddSubparser {
        /// Id used to refer to this group later
        name: Option<String>,

        /// Subparser group of the subcommand to attach to
        #[arg(long)]
        subparserid: Option<String>,

        /// Subcommand to attach to
        #[arg(long)]
        subcommand: Option<String>,

        /// A subcommand must be given
        #[arg(short, long)]
        required: bool,

        /// Result key for the chosen subcommand
        #[arg(short, long)]
        dest: Option<String>,

        /// Help text for the group
        #[arg(long, visible_alias = "helptext")]
        help: Option<String>,

        /// Replaces `{a,b}` in usage and help
        #[arg(short, long)]
        metavar: Option<String>,

        /// Print help
        #[arg(short = 'h', action = ArgAction::Help)]
        print_help: Option<bool>,
    },

    /// Add a subcommand to a subparser group
    #[command(name = "add_subcommand", disable_help_flag = true)]
    AddSubcommand {
        /// Group to add to, defaults to the most recent one
        #[arg(long)]
        subparserid: Option<String>,

        /// Subcommand name
        name: String,

        /// Help text listed under the group
        #[arg(long, visible_alias = "helptext")]
        help: Option<String>,

        /// Print help
        #[arg(short = 'h', action = ArgAction::Help)]
        print_help: Option<bool>,
    },

    /// Set default result values: `set_defaults --<key> <value>...`
    #[command(name = "set_defaults")]
    SetDefaults {
        /// Subparser group of the subcommand to set defaults on
        #[arg(long)]
        subparserid: Option<String>,

        /// Subcommand to set defaults on
        #[arg(long)]
        subcommand: Option<String>,

        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        pairs: Vec<String>,
    },

    /// Parse arguments against a state: `parse <state> [format flags] -- "$@"`
    Parse {
        /// Concatenated state tokens
        state: String,

        /// How the result is printed
        #[arg(short, long, value_enum, default_value_t = Format::Shell)]
        format: Format,

        /// Format flags, then `--` and the arguments to parse
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

impl Commands {
    /// The grammar action a build verb stands for.
    fn into_action(self) -> Result<Action> {
        let action = match self {
            Commands::New {
                name,
                description,
                epilog,
            } => Action::NewParser(NewParser {
                name,
                description,
                epilog,
            }),
            Commands::AddArg {
                subparserid,
                subcommand,
                rest,
            } => {
                let add = AddArgument::from_command_line(Target::new(subparserid, subcommand), &rest)
                    .context("invalid add_arg attributes")?;
                ensure!(!add.aliases.is_empty(), "add_arg needs at least one alias");
                Action::AddArgument(add)
            }
            Commands::AddSubparser {
                name,
                subparserid,
                subcommand,
                required,
                dest,
                help,
                metavar,
                print_help: _,
            } => Action::AddSubparserGroup(AddSubparserGroup {
                target: Target::new(subparserid, subcommand),
                id: name,
                required,
                dest,
                help,
                metavar,
            }),
            Commands::AddSubcommand {
                subparserid,
                name,
                help,
                print_help: _,
            } => Action::AddSubcommand(AddSubcommand {
                group: subparserid,
                name,
                help,
            }),
            Commands::SetDefaults {
                subparserid,
                subcommand,
                pairs,
            } => Action::SetDefaults(SetDefaults {
                target: Target::new(subparserid, subcommand),
                values: parse_key_values(&pairs).context("invalid set_defaults pairs")?,
            }),
            Commands::Parse { .. } => anyhow::bail!("parse does not produce a state token"),
        };
        Ok(action)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(cli.log)
        .with_writer(io::stderr)
        .init();

    match cli.command {
        Commands::Parse {
            state,
            format,
            args,
        } => {
            let code = run_parse(
                &state,
                format,
                &args,
                &mut io::stdout().lock(),
                &mut io::stderr().lock(),
            )
            .context("failed to write parse output")?;
            io::stdout().flush()?;
            process::exit(code);
        }
        command => {
            let action = command.into_action()?;
            let token = encode(&action).context("failed to encode state token")?;
            print!("{token}");
        }
    }

    Ok(())
}
