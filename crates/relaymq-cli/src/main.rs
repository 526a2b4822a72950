//! # RelayMQ CLI
//!
//! Operator utilities: topic checks, configuration and store inspection.

use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use relaymq_broker::BrokerConfig;
use relaymq_core::{PublishRecord, RetainedMessage};
use relaymq_proto::topics;
use relaymq_store::SqliteStore;
use serde_json::{json, Value};
use std::env;
use std::path::Path;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_help();
        return Ok(());
    }

    match args[1].as_str() {
        "match" => {
            if args.len() < 4 {
                eprintln!("Usage: relaymq match <filter> <topic>");
                std::process::exit(1);
            }
            let matched = match_topic(&args[2], &args[3])?;
            println!("{matched}");
        }
        "validate" => {
            if args.len() < 3 {
                eprintln!("Usage: relaymq validate <filter>");
                std::process::exit(1);
            }
            topics::validate_filter(&args[2]).context("Invalid topic filter")?;
            println!("valid");
        }
        "config" => {
            let config = BrokerConfig::from_env().context("Failed to load configuration")?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        "inspect" => {
            if args.len() < 3 {
                eprintln!("Usage: relaymq inspect <db-path>");
                std::process::exit(1);
            }
            let report = inspect(Path::new(&args[2]))?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        "help" | "--help" | "-h" => {
            print_help();
        }
        cmd => {
            eprintln!("Unknown command: {cmd}");
            print_help();
            std::process::exit(1);
        }
    }

    Ok(())
}

fn match_topic(filter: &str, topic: &str) -> Result<bool> {
    topics::validate_filter(filter).context("Invalid topic filter")?;
    topics::validate_topic(topic).context("Invalid topic name")?;
    Ok(topics::matches(filter, topic))
}

/// Dump every record of a SQLite store as JSON.
fn inspect(path: &Path) -> Result<Value> {
    if !path.exists() {
        bail!("No database at {}", path.display());
    }
    let store = SqliteStore::open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    tracing::debug!(path = %path.display(), "Inspecting store");

    let in_flight: Vec<Value> = store
        .list_in_flight()?
        .iter()
        .map(|(key, record)| json!({ "key": key.to_string(), "record": record_json(record) }))
        .collect();
    let pending_qos2: Vec<Value> = store
        .list_qos2()?
        .iter()
        .map(|(key, record)| json!({ "key": key.to_string(), "record": record_json(record) }))
        .collect();
    let retained: Vec<Value> = store.list_retained()?.iter().map(retained_json).collect();
    let queued: Vec<Value> = store.list_queued()?.iter().map(record_json).collect();

    Ok(json!({
        "retained": retained,
        "queued": queued,
        "in_flight": in_flight,
        "pending_qos2": pending_qos2,
    }))
}

fn record_json(record: &PublishRecord) -> Value {
    json!({
        "client_id": record.client_id,
        "topic": record.topic,
        "qos": u8::from(record.qos),
        "retain": record.retain,
        "message_id": record.message_id,
        "payload": STANDARD.encode(&record.payload),
    })
}

fn retained_json(message: &RetainedMessage) -> Value {
    json!({
        "topic": message.topic,
        "qos": u8::from(message.qos),
        "payload": STANDARD.encode(&message.payload),
    })
}

fn print_help() {
    println!(
        r#"RelayMQ CLI

USAGE:
    relaymq <COMMAND> [OPTIONS]

COMMANDS:
    match <filter> <topic>  Check whether a topic filter matches a topic name
    validate <filter>       Validate a topic filter
    config                  Print the configuration resolved from RELAYMQ_* variables
    inspect <db-path>       Dump a SQLite store as JSON (payloads base64)
    help                    Show this help message

EXAMPLES:
    relaymq match "sensors/+/temp" "sensors/kitchen/temp"
    relaymq validate "sensors/#"
    RELAYMQ_STORE=sqlite relaymq config
    relaymq inspect ./relaymq.db
"#
    );
}
