//! Interactive remote control for a satellite receiver.
//!
//! Configuration is loaded from `config.ron` and can be overridden via CLI flags.
//! Run with `cargo run -p satlink-app -- --host 192.168.1.20` and type `help`.

mod commands;
mod settings;

use clap::Parser;
use satlink_config::{CliArgs, Config, default_config_dir};
use satlink_net::{ConnectionSession, DecodedPayload, EventReceiver, SessionEvent};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use crate::commands::{HELP, Input, parse_line};

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();

    // Resolve config directory
    let config_dir = args.config.clone().unwrap_or_else(default_config_dir);

    // Load or create config, then apply CLI overrides
    let mut config = Config::load_or_create(&config_dir).unwrap_or_else(|e| {
        eprintln!("Failed to load config: {e}, using defaults");
        Config::default()
    });
    config.apply_cli_overrides(&args);

    let log_dir = config_dir.join("logs");
    satlink_log::init_logging(Some(&log_dir), cfg!(debug_assertions), Some(&config));

    let (mut session, events) = ConnectionSession::new(settings::session_config(&config));
    info!(addr = %session.config().address(), "satlink starting");

    let printer = tokio::spawn(print_events(events));
    session.start();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("failed to read stdin: {e}");
                break;
            }
        };

        match parse_line(&line) {
            Ok(Input::Send(cmd)) => {
                if let Err(e) = session.submit(cmd) {
                    println!("! {e}");
                }
            }
            Ok(Input::State) => println!("state: {}", session.state()),
            Ok(Input::Restart) => {
                session.stop().await;
                session.start();
            }
            Ok(Input::Help) => println!("{HELP}"),
            Ok(Input::Quit) => break,
            Ok(Input::Empty) => {}
            Err(e) => println!("! {e}"),
        }
    }

    session.stop().await;
    drop(session);
    let _ = printer.await;
    info!("satlink exiting");
}

/// Print every session event until the session is dropped.
async fn print_events(mut events: EventReceiver) {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::State { state, attempt } if attempt > 0 => {
                println!("* {state} (attempt {attempt})");
            }
            SessionEvent::State { state, .. } => println!("* {state}"),
            SessionEvent::Disconnected { reason } => println!("* disconnected: {reason}"),
            SessionEvent::Latency { sample, stats } => println!("~ latency {sample} ({stats})"),
            SessionEvent::Payload(DecodedPayload::ChannelList(records)) => {
                println!("< channel list ({} entries)", records.len());
                for record in &records {
                    println!("    {}", record.service_name().unwrap_or("<unnamed>"));
                }
            }
            SessionEvent::Payload(DecodedPayload::GenericJson(value)) => println!("< {value}"),
            SessionEvent::Payload(payload) => println!("< {payload}"),
        }
    }
}
