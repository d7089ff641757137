//! Terminal chat front end
//!
//! Usage: `relay-chat [SERVER_URL] [CONFIG_PATH]`
//!
//! Plain lines are sent as chat. Commands: `/call`, `/hangup`, `/devices`,
//! `/who`, `/quit`.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use voice_relay::{
    audio::device::{list_direction, Direction},
    client::{ClientEvent, EventSink},
    config::ClientConfig,
    RelayClient,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut args = std::env::args().skip(1);
    let url_arg = args.next();
    let config = match args.next() {
        Some(path) => ClientConfig::load(Path::new(&path))
            .with_context(|| format!("loading config from {}", path))?,
        None => ClientConfig::load_or_default().context("loading default config")?,
    };
    let url = url_arg.unwrap_or_else(|| config.server.url.clone());

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<ClientEvent>();
    let events: Arc<dyn EventSink> = Arc::new(event_tx);
    let client = RelayClient::builder(config).event_sink(events).build();

    tracing::info!("Starting relay chat as {}", client.participant_id());
    client.start(&url).await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => print_event(&event),
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                if !handle_line(&client, line.trim()) {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down...");
                break;
            }
        }
    }

    client.stop().await;
    while let Ok(event) = event_rx.try_recv() {
        print_event(&event);
    }
    Ok(())
}

/// Run one input line. Returns false when the user asked to quit.
fn handle_line(client: &RelayClient, line: &str) -> bool {
    match line {
        "" => {}
        "/quit" => return false,
        "/call" => {
            if let Err(e) = client.start_call() {
                eprintln!("Cannot start call: {}", e);
            }
        }
        "/hangup" => client.stop_call(),
        "/who" => {
            let online = client.online();
            if online.is_empty() {
                println!("Nobody else is online");
            }
            for id in online {
                println!("  {}", id);
            }
        }
        "/devices" => print_devices(),
        text => {
            // Not being connected is reported through the log event
            let _ = client.send_chat(text);
        }
    }
    true
}

fn print_event(event: &ClientEvent) {
    match event {
        ClientEvent::Chat { sender, text } => println!("<{}> {}", sender, text),
        other => println!("{}", other),
    }
}

fn print_devices() {
    println!("\n=== Input Devices ===");
    for device in list_direction(Direction::Input) {
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        println!("  #{} {}{}", device.index, device.name, default_marker);
        println!("    Sample rates: {:?}", device.sample_rates);
        println!("    Channels: {:?}", device.channels);
    }
    println!("\n=== Output Devices ===");
    for device in list_direction(Direction::Output) {
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        println!("  #{} {}{}", device.index, device.name, default_marker);
    }
    println!();
}
