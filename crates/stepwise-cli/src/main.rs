//! Stepwise CLI entry point.
//!
//! Binary name: `stepwise`
//!
//! Parses CLI arguments, wires the engine to its SQLite/reqwest
//! collaborators, and dispatches to a command handler.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

/// Run declarative workflows from the command line.
#[derive(Parser)]
#[command(name = "stepwise", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a workflow definition file until a terminal step.
    Run {
        /// Path to the workflow definition YAML.
        file: PathBuf,

        /// Start from this step id instead of the first step.
        #[arg(long)]
        step: Option<String>,

        /// Seed context as a JSON object.
        #[arg(long, value_name = "JSON")]
        context: Option<String>,

        /// SQLite database URL for poll_db/save_to_db steps.
        #[arg(long, env = "STEPWISE_DATABASE_URL")]
        database: Option<String>,

        /// Named route for the route() builtin, as name=url-template.
        /// Repeatable.
        #[arg(long = "route", value_name = "NAME=URL")]
        routes: Vec<String>,

        /// Directory of server-rendered templates for the "template"
        /// render backend.
        #[arg(long, value_name = "DIR")]
        templates: Option<PathBuf>,
    },

    /// Parse and validate a workflow definition file.
    Validate {
        /// Path to the workflow definition YAML.
        file: PathBuf,
    },

    /// List the workflow definitions in a directory.
    #[command(alias = "ls")]
    List {
        /// Directory of <id>.yaml definition files.
        dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Set up tracing based on verbosity
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info,stepwise=debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(false)
        .init();

    match cli.command {
        Commands::Run {
            file,
            step,
            context,
            database,
            routes,
            templates,
        } => {
            commands::run(
                &file,
                step.as_deref(),
                context.as_deref(),
                database,
                &routes,
                templates.as_deref(),
                cli.json,
            )
            .await?;
        }

        Commands::Validate { file } => {
            commands::validate(&file, cli.json)?;
        }

        Commands::List { dir } => {
            commands::list(&dir, cli.json)?;
        }
    }

    Ok(())
}
