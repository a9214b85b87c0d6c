mod cli;
mod commands;
mod config;
mod display;
mod paths;
mod progress;
mod ui;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use cli::{Cli, Command};
use std::io;
use std::path::PathBuf;

/// Global context for the application
pub struct Context {
    pub verbose: u8,
    pub quiet: bool,
    pub config: Option<PathBuf>,
    pub state_dir: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    env_logger::Builder::new()
        .filter_level(if cli.quiet {
            log::LevelFilter::Error
        } else {
            log_level
        })
        .format_timestamp(None)
        .init();

    let ctx = Context {
        verbose: cli.verbose,
        quiet: cli.quiet,
        config: cli.config.map(|p| paths::expand(&p.to_string_lossy())),
        state_dir: cli.state_dir.map(|p| paths::expand(&p.to_string_lossy())),
    };

    match cli.command {
        Command::Validate(args) => commands::validate::run(&ctx, &args.file),
        Command::Plan(args) => commands::plan::run(&ctx, &args.file),
        Command::Apply(args) => commands::apply::run(&ctx, args),
        Command::Import(args) => commands::import::run(&ctx, args),
        Command::State => commands::state::run(&ctx),
        Command::Schema { kind } => commands::schema::run(&ctx, kind.as_deref()),
        Command::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "panos-reconcile", &mut io::stdout());
            Ok(())
        }
    }
}
