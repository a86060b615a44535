use std::{io::Write, path::PathBuf};

use chrono::Local;
use clap::{Parser, Subcommand};
use env_logger::fmt::Color;
use eyre::Result;
use log::Level;

mod abi;
mod chain;
mod config;
mod dispatcher;
mod error;
mod guard;
mod keeper;
mod scheduler;
mod service;
mod util;

#[derive(Parser)]
#[command(name = "keeperd")]
#[command(about = "Vault harvest keeper", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Prints a default configuration file
    Genconf,
    /// Runs the keeper until interrupted
    Run {
        /// Optional YAML file overriding the built-in thresholds
        #[arg(long, value_name = "CONFIG_PATH")]
        config: Option<PathBuf>,
    },
}

fn init_logger() {
    env_logger::Builder::new()
        .format(|buf, record| {
            let mut level_style = buf.style();
            let color = match record.level() {
                Level::Info => Color::Green,
                Level::Warn => Color::Yellow,
                Level::Error => Color::Red,
                _ => Color::White,
            };
            level_style.set_color(color).set_bold(true);

            writeln!(
                buf,
                "{} {:5} {}",
                Local::now().format("%Y-%m-%d %H:%M:%S"),
                level_style.value(record.level()),
                record.args(),
            )
        })
        .filter(None, log::LevelFilter::Info)
        .parse_env(env_logger::Env::default())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Genconf => {
            println!("{}", config::DEFAULT_CONFIG_TEMPLATE);
        }
        Commands::Run { config } => {
            init_logger();
            if let Some(path) = &config {
                if !path.exists() {
                    eprintln!("Error: Config file not found at {}", path.display());
                    std::process::exit(1);
                }
            }
            service::run(config).await?;
        }
    }
    Ok(())
}
