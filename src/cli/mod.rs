//! Command Line Interface
//!
//! Subcommands of the `kindlewise` binary. Each handler returns the process
//! exit code; errors bubble up to `main`, which logs them and exits with 1.
//!
//! # Usage
//!
//! ```text
//! kindlewise export --file "My Clippings.txt"
//! kindlewise export --dry-run
//! kindlewise export --interactive
//! kindlewise export --devices
//! kindlewise devices
//! kindlewise history --limit 5 --details
//! kindlewise history --format csv
//! kindlewise highlights list --title Dune --format json
//! kindlewise highlights delete --book Dune --force
//! kindlewise reset-db
//! kindlewise config show
//! kindlewise config token
//! kindlewise config set readwise.batch_size 50
//! ```

mod devices;
mod export;
pub mod format;
mod highlights;
mod history;
mod settings;

use anyhow::Result;
use clap::{Args, Subcommand, ValueEnum};
use dialoguer::{Confirm, Input};

use crate::config::{Cli, Config};

pub use export::{Selection, parse_selection};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
    Csv,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Export new highlights to Readwise
    Export(ExportArgs),
    /// Show past export sessions
    History(HistoryArgs),
    /// List connected Kindle devices
    Devices,
    /// Inspect and manage exported highlights
    Highlights {
        #[command(subcommand)]
        command: HighlightsCommand,
    },
    /// Delete the export ledger and start from an empty one
    ResetDb {
        #[arg(short, long)]
        force: bool,
    },
    /// Show or change configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Print the version
    Version,
}

#[derive(Args, Debug)]
pub struct ExportArgs {
    /// Path to "My Clippings.txt"
    #[arg(short, long)]
    pub file: Option<String>,

    /// Readwise API token (or READWISE_API_TOKEN)
    #[arg(short = 't', long)]
    pub api_token: Option<String>,

    /// Ledger location, overriding app.database
    #[arg(long)]
    pub db_path: Option<String>,

    /// Show what would be exported without sending or recording anything
    #[arg(short, long)]
    pub dry_run: bool,

    /// Pick the highlights to export
    #[arg(short, long)]
    pub interactive: bool,

    /// List connected Kindle devices and exit
    #[arg(long)]
    pub devices: bool,
}

#[derive(Args, Debug)]
pub struct HistoryArgs {
    #[arg(short, long, default_value_t = 10)]
    pub limit: u32,

    /// Show a single session in detail
    #[arg(short, long)]
    pub session: Option<i64>,

    /// Follow the table with the details of every listed session
    #[arg(long)]
    pub details: bool,

    #[arg(long, value_enum, default_value_t)]
    pub format: OutputFormat,
}

#[derive(Subcommand, Debug)]
pub enum HighlightsCommand {
    /// List and search exported highlights
    List(ListArgs),
    /// List books with exported highlights
    Books {
        #[arg(long, value_enum, default_value_t)]
        format: OutputFormat,
    },
    /// Forget highlights so they are exported again
    Delete(DeleteArgs),
}

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Partial title match
    #[arg(long)]
    pub title: Option<String>,

    /// Partial author match
    #[arg(long)]
    pub author: Option<String>,

    /// Partial text match
    #[arg(long)]
    pub text: Option<String>,

    #[arg(long, default_value_t = 20)]
    pub limit: u32,

    #[arg(long, default_value_t = 0)]
    pub offset: u32,

    #[arg(long, value_enum, default_value_t)]
    pub format: OutputFormat,
}

#[derive(Args, Debug)]
#[command(group(clap::ArgGroup::new("target").required(true).args(["id", "book"])))]
pub struct DeleteArgs {
    #[arg(long)]
    pub id: Option<i64>,

    /// Delete every highlight of this book (exact title)
    #[arg(long)]
    pub book: Option<String>,

    #[arg(long, requires = "book")]
    pub author: Option<String>,

    #[arg(short, long)]
    pub force: bool,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Show the effective configuration
    Show,
    /// Show configuration and data locations
    Paths,
    /// Store the Readwise API token in the config file (prompts when omitted)
    Token { token: Option<String> },
    /// Store one setting in the config file, e.g. `readwise.batch_size 50`
    Set { key: String, value: String },
}

pub async fn run(cli: &Cli, cfg: &Config) -> Result<i32> {
    match &cli.command {
        Command::Export(args) => export::handle_export(args, cfg).await,
        Command::History(args) => history::handle_history(args, cfg).await,
        Command::Devices => devices::handle_devices(),
        Command::Highlights { command } => highlights::handle_highlights(command, cfg).await,
        Command::ResetDb { force } => settings::handle_reset(*force, cfg).await,
        Command::Config { command } => settings::handle_config(command, cli, cfg),
        Command::Version => {
            println!("kindlewise {}", env!("CARGO_PKG_VERSION"));
            Ok(0)
        }
    }
}

/// Reads one trimmed line from the terminal. Empty input is allowed.
fn prompt(message: &str) -> Result<String> {
    let answer: String = Input::new()
        .with_prompt(message)
        .allow_empty(true)
        .interact()?;
    Ok(answer.trim().to_string())
}

fn confirm(message: &str) -> Result<bool> {
    Ok(Confirm::new().with_prompt(message).default(false).interact()?)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
