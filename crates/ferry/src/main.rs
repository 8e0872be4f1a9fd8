mod cli;
mod commands;
mod error;

use clap::Parser;
use cli::{Cli, Command};
use error::CliError;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    setup_tracing(cli.verbose);

    let result = dispatch(cli).await;
    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn dispatch(cli: Cli) -> Result<(), CliError> {
    let cwd = std::env::current_dir()?;
    match cli.command {
        Command::Run(args) => commands::run::run(args, cwd).await,
        Command::Check => commands::check::check(cwd).await,
        Command::Config(args) => commands::config::config(args, cwd).await,
    }
}

fn setup_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    // The default filter covers only the ferry crates; FERRY_LOG replaces
    // it wholesale when set.
    let filter = std::env::var("FERRY_LOG").unwrap_or_else(|_| {
        format!("ferry={level},ferry_proxy={level},ferry_settings={level}")
    });

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();
}
