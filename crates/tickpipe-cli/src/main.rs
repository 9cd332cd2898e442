mod cli;
mod commands;
mod error;
mod logging;

use clap::Parser;
use std::process::ExitCode;

use crate::cli::Cli;
use crate::error::CliError;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(error) => {
            eprintln!("error: {error}");
            ExitCode::from(error.exit_code())
        }
    }
}

async fn run() -> Result<ExitCode, CliError> {
    let cli = Cli::parse();
    logging::init(cli.log_format)?;

    let output = commands::run(&cli).await?;
    let rendered = if cli.pretty {
        serde_json::to_string_pretty(&output.data)?
    } else {
        serde_json::to_string(&output.data)?
    };
    println!("{rendered}");

    if let Some(summary) = output.summary.filter(|summary| summary.has_failures()) {
        return Err(CliError::JobsFailed {
            failed: summary.failed,
        });
    }

    Ok(ExitCode::SUCCESS)
}
