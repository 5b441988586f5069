//! envctl binary entry point

use std::io;
use std::path::Path;

use anyhow::Context;
use clap::{CommandFactory, Parser};
use tracing::info;

use envctl::cli::{Cli, Command};
use envctl::class::ServiceClassManager;
use envctl::config::Config;
use envctl::server::ControlPlane;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    envctl::setup_tracing(&cli.log_level, cli.log_format.as_deref())
        .context("failed to initialize tracing")?;

    match cli.command {
        Command::Serve {
            config,
            host,
            port,
            yolo,
        } => {
            let mut loaded =
                Config::load(config.as_deref()).context("failed to load configuration")?;
            if let Some(host) = host {
                loaded.server.host = host;
            }
            if let Some(port) = port {
                loaded.server.port = port;
            }
            if yolo {
                loaded.aggregator.yolo = true;
            }

            info!(
                host = %loaded.server.host,
                port = loaded.server.port,
                yolo = loaded.aggregator.yolo,
                "Starting envctl"
            );
            ControlPlane::build(loaded, config).run().await?;
        }

        Command::Validate { config } => {
            let loaded =
                Config::load(config.as_deref()).context("failed to load configuration")?;
            println!(
                "configuration ok: listen {}:{}, {} declared service(s)",
                loaded.server.host,
                loaded.server.port,
                loaded.services.len()
            );

            let classes = ServiceClassManager::new();
            let mut failures = 0usize;
            for dir in &loaded.class_dirs {
                let report = classes.load_dir(Path::new(dir));
                for name in &report.loaded {
                    println!("class ok: {name}");
                }
                for (path, error) in &report.errors {
                    eprintln!("class error: {}: {error}", path.display());
                    failures += 1;
                }
            }
            if failures > 0 {
                anyhow::bail!("{failures} invalid class definition(s)");
            }
        }

        Command::Completions { shell } => {
            let mut command = Cli::command();
            let name = command.get_name().to_string();
            clap_complete::generate(shell, &mut command, name, &mut io::stdout());
        }
    }

    Ok(())
}
