use std::panic;
use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tracing_subscriber::EnvFilter;

use crate::cli::Cli;
use crate::constants::NOTIFY_CHANNEL_SIZE;
use crate::native::gate::PythonImportGate;
use crate::notifiers::ChannelNotifier;
use crate::service::ScriptService;
use crate::supervisor::Supervisor;

mod cli;
mod config;
mod console;
mod constants;
mod core;
mod native;
mod notifiers;
mod service;
mod supervisor;

#[cfg(test)]
mod stubs;

#[tokio::main]
#[tracing::instrument]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    set_panic_hook();

    let config = Cli::parse().into_config()?;
    let excerpt_chars = config.excerpt_chars;
    tracing::info!(
        interpreter = %config.interpreter.display(),
        work_root = %config.work_root.display(),
        "starting supervisor"
    );

    let gate = Arc::new(PythonImportGate::new(config.denylist.iter()));
    let (notifier, mut notifications) = ChannelNotifier::new(NOTIFY_CHANNEL_SIZE);
    let supervisor = Arc::new(Supervisor::new(config, gate, Arc::new(notifier)));
    let service = ScriptService::new(Arc::clone(&supervisor));

    let (lines_tx, lines_rx) = mpsc::channel(NOTIFY_CHANNEL_SIZE);
    let (reply_tx, mut reply_rx) = mpsc::channel::<String>(NOTIFY_CHANNEL_SIZE);

    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if lines_tx.send(line).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(error = %e, "failed to read stdin");
                    break;
                }
            }
        }
    });

    tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(reply) = reply_rx.recv() => println!("{}", reply),
                Some(notification) = notifications.next() => {
                    println!("{}", console::render_notification(&notification, excerpt_chars));
                }
                else => break,
            }
        }
    });

    let commands = console::handle_commands(service, lines_rx, reply_tx);

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            tracing::info!("interrupted");
        }
        result = commands => {
            result?;
            tracing::info!("input closed");
        }
    }

    let stopped = supervisor.stop_all().await;
    tracing::info!(stopped, "shut down");

    Ok(())
}

fn set_panic_hook() {
    panic::set_hook(Box::new(|panic_info| {
        tracing::error!(
            message = "panic occurred",
            panic = %panic_info
        );
    }));
}
