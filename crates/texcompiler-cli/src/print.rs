#![deny(clippy::all, clippy::pedantic)]

use serde::Serialize;

use crate::client::CliError;

pub fn print_json<T: Serialize>(value: &T) -> Result<(), CliError> {
    let out = serde_json::to_string_pretty(value)
        .map_err(|e| CliError::Render(format!("failed to render output: {e}")))?;
    println!("{out}");
    Ok(())
}
