//! Command-line companion to the relay daemon.
//!
//! Queries devices directly and reads the daemon's best-difficulty file.
//! Nothing is posted to the chat channel.

use std::env;

use anyhow::{Context, Result};
use futures::future::join_all;
use time::OffsetDateTime;

use axe_relay::best_diff::BestDifficultyStore;
use axe_relay::config::{DeviceConfig, Settings};
use axe_relay::device::{HttpClient, StatusSource};
use axe_relay::summary::{DeviceSummary, StatusSummary};

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        usage();
        std::process::exit(1);
    }

    let command = &args[1];

    match command.as_str() {
        "status" => match args.get(2) {
            Some(address) => cmd_status(address).await?,
            None => {
                eprintln!("status: missing device address");
                std::process::exit(1);
            }
        },
        "best" => cmd_best().await?,
        "summary" => cmd_summary(args.iter().any(|a| a == "--json")).await?,
        _ => {
            eprintln!("Unknown command: {}", command);
            eprintln!("Run without arguments to see usage.");
            std::process::exit(1);
        }
    }

    Ok(())
}

fn usage() {
    eprintln!("Usage: axe-relay-cli <command>");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  status <address>   Fetch one device and print its normalized status");
    eprintln!("  best               Show recorded best difficulties");
    eprintln!("  summary [--json]   Poll all configured devices once");
    eprintln!();
    eprintln!("Environment:");
    eprintln!("  AXE_RELAY_CONFIG     Config file (default: config.toml)");
    eprintln!("  AXE_RELAY_DATA_DIR   Directory holding best_difficulty.json");
}

/// Print the normalized snapshot of one device as JSON.
async fn cmd_status(address: &str) -> Result<()> {
    let device = DeviceConfig::new(address, address);
    let snapshot = HttpClient::new()
        .fetch(&device)
        .await
        .with_context(|| format!("failed to fetch status from {address}"))?;

    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

/// Print the persisted best difficulty of every device.
async fn cmd_best() -> Result<()> {
    let settings = Settings::load()?;
    let store = BestDifficultyStore::load(settings.best_diff_path()).await;
    let records = store.records().await;

    if records.is_empty() {
        println!("No records in {}", store.path().display());
        return Ok(());
    }

    for (device, record) in &records {
        let when = record
            .timestamp
            .map(|t| t.date().to_string())
            .unwrap_or_else(|| "unknown date".into());
        println!(
            "{device:<20} {:>8}  {}  ({when})",
            record.best_difficulty.to_string(),
            record.best_difficulty.to_plain_string()
        );
    }

    Ok(())
}

/// Poll every configured device once and print the summary.
async fn cmd_summary(json: bool) -> Result<()> {
    let settings = Settings::load()?;
    let client = HttpClient::new();

    let devices = join_all(settings.devices.iter().map(|device| async {
        let result = client.fetch(device).await;
        DeviceSummary::new(device, &result)
    }))
    .await;

    let store = BestDifficultyStore::load(settings.best_diff_path()).await;
    let summary = StatusSummary::new(devices, &store.records().await, OffsetDateTime::now_utc());

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("{summary}");
    }

    Ok(())
}
