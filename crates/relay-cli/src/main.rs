//! Command-line relay over a `tr-transport` channel.
//!
//! Reads one JSON-RPC envelope per stdin line and sends it; prints every
//! inbound envelope as a JSON line on stdout.  Logs go to stderr.
//!
//! Usage:
//!   RELAY_AUTH_TOKEN=secret tr-relay socket ws://localhost:3210/rpc
//!   tr-relay polling http://localhost:3210 --interval-ms 250
//!   tr-relay --config relay.toml --json

mod cli;

use anyhow::Context;
use clap::Parser;
use tokio::io::AsyncBufReadExt;
use tr_protocol::Envelope;
use tr_transport::{create_transport, EventStream, TransportError, TransportEvent};
use tracing_subscriber::EnvFilter;

use crate::cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    let config = cli::resolve(&cli)?;
    let transport = create_transport(&config)?;
    let events = transport.subscribe();

    tracing::info!(kind = transport.kind(), url = %config.url(), "starting relay");
    transport
        .start()
        .await
        .with_context(|| format!("starting {} channel", transport.kind()))?;

    let mut printer = tokio::spawn(print_events(events));
    let mut printer_done = false;

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("reading stdin")? else {
                    tracing::info!("stdin closed");
                    break;
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let envelope = match Envelope::from_json(line) {
                    Ok(env) => env,
                    Err(e) => {
                        tracing::warn!(error = %e, "skipping malformed input line");
                        continue;
                    }
                };
                match transport.send(envelope).await {
                    Ok(()) => {}
                    Err(TransportError::Closed) => {
                        tracing::warn!("channel closed, no longer reading input");
                        break;
                    }
                    Err(e) => tracing::warn!(error = %e, "send failed"),
                }
            }
            _ = &mut printer, if !printer_done => {
                printer_done = true;
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                break;
            }
        }
    }

    transport.close().await.context("closing channel")?;
    if !printer_done {
        let _ = printer.await;
    }
    tracing::info!("relay exiting");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

async fn print_events(mut events: EventStream) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Message(env) => match env.to_json() {
                Ok(text) => println!("{text}"),
                Err(e) => tracing::warn!(error = %e, "unprintable envelope"),
            },
            TransportEvent::Error(e) => tracing::warn!(error = %e, "transport error"),
            TransportEvent::Closed(Some(reason)) => {
                tracing::error!(%reason, "channel closed");
                break;
            }
            TransportEvent::Closed(None) => {
                tracing::info!("channel closed");
                break;
            }
        }
    }
}
