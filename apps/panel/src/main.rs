use anyhow::{Context, Result};
use clap::Parser;
use client_core::{ClientSettings, DeploymentMode, Session};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::{wrappers::WatchStream, StreamExt};
use tracing::warn;
use tracing_subscriber::EnvFilter;

mod commands;

use commands::{parse_line, render_view, PanelCommand, HELP};

/// Terminal control panel for a lights controller.
#[derive(Parser, Debug)]
struct Args {
    /// Talk to the controller origin instead of the development address.
    #[arg(long)]
    production: bool,
    /// Overrides the controller address for the selected deployment mode.
    #[arg(long)]
    controller: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();

    let mut settings = ClientSettings::load()?;
    if args.production {
        settings.deployment_mode = DeploymentMode::Production;
    }
    if let Some(address) = args.controller {
        match settings.deployment_mode {
            DeploymentMode::Production => settings.controller_origin = address,
            DeploymentMode::Development => settings.dev_controller_url = address,
        }
    }

    let session = Session::from_settings(&settings)?;
    let mut views = WatchStream::new(session.subscribe());
    let mut connection = WatchStream::new(session.connection());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("{HELP}");

    loop {
        tokio::select! {
            Some(view) = views.next() => println!("{}", render_view(&view)),
            Some(state) = connection.next() => println!("[{state}]"),
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    break;
                };
                match parse_line(&line) {
                    Ok(Some(PanelCommand::Intent(field, value))) => {
                        if let Err(err) = session.submit_intent(field, value) {
                            warn!(%err, "intent rejected");
                            println!("rejected: {err}");
                        }
                    }
                    Ok(Some(PanelCommand::Help)) => println!("{HELP}"),
                    Ok(Some(PanelCommand::Quit)) => break,
                    Ok(None) => {}
                    Err(err) => println!("{err}"),
                }
            }
        }
    }

    session.shutdown().await;
    Ok(())
}
