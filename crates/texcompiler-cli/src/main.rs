//! texcompiler-cli: command-line client for the compilation service.
#![deny(clippy::all, clippy::pedantic)]

mod args;
mod client;
mod handlers;
mod print;

#[cfg(test)]
mod tests;

use clap::Parser;

use args::{Cli, Commands};
use client::{CliError, build_ctx_from_cli};

#[tokio::main]
async fn main() -> Result<(), CliError> {
    let cli = Cli::parse();
    let ctx = build_ctx_from_cli(&cli)?;

    match cli.command {
        Commands::Submit(args) => handlers::submit(&ctx, args).await?,
        Commands::Status(task) => handlers::status(&ctx, &task).await?,
        Commands::Wait(args) => handlers::wait(&ctx, &args).await?,
        Commands::Content(args) => handlers::content(&ctx, &args).await?,
        Commands::Log(task) => handlers::log(&ctx, &task).await?,
    }

    Ok(())
}
