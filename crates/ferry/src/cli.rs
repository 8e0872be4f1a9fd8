use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(
    name = "ferry",
    about = "Authenticated local forwarding proxies for containerized messaging apps"
)]
pub struct Cli {
    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start a forwarder for each configured container
    Run(RunArgs),
    /// Check that forwarders can start on this system
    Check,
    /// Manage ferry configuration
    Config(ConfigArgs),
}

#[derive(Args)]
pub struct RunArgs {
    /// Add a container upstream (ID=scheme://[user:pass@]host:port; repeatable)
    #[arg(long = "container", value_name = "ID=URL")]
    pub containers: Vec<String>,

    /// Load an additional config file on top of defaults
    #[arg(long = "config", value_name = "PATH")]
    pub extra_config: Option<PathBuf>,

    /// Ignore all config files; use only CLI flags
    #[arg(long)]
    pub no_config: bool,
}

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub subcommand: ConfigSubcommand,
}

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Write a starter config file
    Init {
        #[arg(long)]
        global: bool,
    },
    /// Print the effective merged configuration
    Show {
        #[arg(long, value_enum, default_value = "toml")]
        format: OutputFormat,
    },
    /// Open config in $EDITOR
    Edit {
        #[arg(long)]
        global: bool,
    },
}

#[derive(ValueEnum, Clone, Copy)]
pub enum OutputFormat {
    Toml,
    Json,
}
