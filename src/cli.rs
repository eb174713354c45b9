use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Top-level CLI definition for the `cloudfleet` tool.
#[derive(Debug, Parser)]
#[command(
    name = "cloudfleet",
    author = "Cloudfleet Project",
    version,
    about = "Drives a fleet of virtual machines through a declarative plan.",
    long_about = "Cloudfleet reads a plan document grouping services into ordered levels and \
                  brings each level up in parallel on an IaaS cloud, waits for network \
                  reachability, contextualizes each VM, and verifies readiness before \
                  advancing to the next level. Reverse order drives tear-down."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Bring the fleet up: launch, contextualize, and verify readiness level by level.
    Up(UpArgs),
    /// Tear the fleet down in reverse level order.
    Down(DownArgs),
    /// Render persisted service state as a table or JSON.
    Status(StatusArgs),
    /// Validate a plan without starting anything.
    Doctor(DoctorArgs),
}

#[derive(Debug, Args)]
pub struct UpArgs {
    /// Path to the plan document.
    #[arg(long, value_name = "PATH", help = "Path to the plan TOML file")]
    pub plan: PathBuf,

    /// Restrict the run to these level names (may be repeated).
    #[arg(
        long = "level",
        value_name = "NAME",
        help = "Restrict the run to this level (repeatable); default is every level"
    )]
    pub level: Vec<String>,
}

#[derive(Debug, Args)]
pub struct DownArgs {
    /// Path to the plan document.
    #[arg(long, value_name = "PATH", help = "Path to the plan TOML file")]
    pub plan: PathBuf,

    /// Restrict the run to these level names (may be repeated).
    #[arg(
        long = "level",
        value_name = "NAME",
        help = "Restrict the run to this level (repeatable); default is every level"
    )]
    pub level: Vec<String>,
}

#[derive(Debug, Args)]
pub struct StatusArgs {
    /// Path to the plan document.
    #[arg(long, value_name = "PATH", help = "Path to the plan TOML file")]
    pub plan: PathBuf,

    /// Render as JSON instead of a table.
    #[arg(long, help = "Render status as JSON instead of a table")]
    pub json: bool,
}

#[derive(Debug, Args)]
pub struct DoctorArgs {
    /// Path to the plan document.
    #[arg(long, value_name = "PATH", help = "Path to the plan TOML file")]
    pub plan: PathBuf,
}
