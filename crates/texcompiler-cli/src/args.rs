//! Command-line surface for `texcompiler-cli`.

#![deny(clippy::all, clippy::pedantic)]

use std::fmt;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use texcompiler_api_types::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "texcompiler-cli", version, about = "texcompiler compilation service CLI", long_about = None)]
pub struct Cli {
    /// Service base URL, e.g. <http://localhost:8000>
    #[arg(long, env = "TEXCOMPILER_URL")]
    pub server: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Request a compilation
    Submit(SubmitArgs),
    /// Show the status document of a task
    Status(TaskArgs),
    /// Poll until the task reaches a terminal status
    Wait(WaitArgs),
    /// Download the compiled artifact
    Content(ContentArgs),
    /// Print the converter log of the latest attempt
    Log(TaskArgs),
}

/// Identity of a task: source package, its checksum, and the output format.
#[derive(Args, Debug, Clone)]
pub struct TaskArgs {
    pub source_id: String,
    pub checksum: String,
    #[arg(long, short = 'f', default_value_t = FormatArg::Pdf)]
    pub format: FormatArg,
}

#[derive(Args, Debug)]
pub struct SubmitArgs {
    #[command(flatten)]
    pub task: TaskArgs,
    /// Recompile even if a finished result exists
    #[arg(long, default_value_t = false)]
    pub force: bool,
    #[arg(long)]
    pub owner: Option<String>,
    /// Label stamped onto the output pages
    #[arg(long)]
    pub stamp_label: Option<String>,
    /// Link attached to the stamp
    #[arg(long)]
    pub stamp_link: Option<String>,
}

#[derive(Args, Debug)]
pub struct WaitArgs {
    #[command(flatten)]
    pub task: TaskArgs,
    /// Give up after this many seconds
    #[arg(long, default_value_t = 600)]
    pub timeout: u64,
    /// Delay between polls, in milliseconds
    #[arg(long, default_value_t = 2000)]
    pub interval: u64,
}

#[derive(Args, Debug)]
pub struct ContentArgs {
    #[command(flatten)]
    pub task: TaskArgs,
    /// Destination file
    #[arg(long, short = 'o')]
    pub output: PathBuf,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum FormatArg {
    Pdf,
    Dvi,
    Ps,
}

impl FormatArg {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        self.format().as_str()
    }

    #[must_use]
    pub fn format(self) -> OutputFormat {
        match self {
            Self::Pdf => OutputFormat::Pdf,
            Self::Dvi => OutputFormat::Dvi,
            Self::Ps => OutputFormat::Ps,
        }
    }
}

impl fmt::Display for FormatArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
