//! repobridge CLI - serve or query the embedded engine
//!
//! Usage:
//!   repobridge serve [--config <file>]
//!   repobridge query <collection> <operation> [descriptor-json]
//!   repobridge sql <text> [param-json...]
//!   repobridge entities
//!
//! Examples:
//!   repobridge query Session find '{"where":{"status":{"$operator":"in","value":["started","done"]}}}'
//!   repobridge sql 'SELECT COUNT(*) AS n FROM sessions WHERE status = ?' '"done"'

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use repobridge::config::Settings;
use repobridge::protocol::{Descriptor, Operation, Scalar};
use repobridge::{transport, Client, Dispatcher, Registry};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "repobridge")]
#[command(about = "repobridge - repository queries across a message channel")]
#[command(version)]
struct Cli {
    /// Settings file (defaults to REPOBRIDGE_CONFIG, ./repobridge.toml, then the user config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve requests as NDJSON over stdin/stdout
    Serve,

    /// Run one repository operation and print the result
    Query {
        /// Collection name, e.g. Session
        collection: String,

        /// find, findOne, count, save, update or delete
        operation: String,

        /// Descriptor as JSON
        descriptor: Option<String>,
    },

    /// Run SQL text and print rows or the affected count
    Sql {
        /// SQL text with `?` placeholders
        text: String,

        /// Positional parameters, each as JSON
        params: Vec<String>,
    },

    /// List the collections this build knows about
    Entities,
}

fn init_logging(settings: &Settings) {
    // stdout carries protocol frames in serve mode
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => Settings::from_file(path),
        None => Settings::load(),
    };
    let settings = match settings {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error loading settings: {}", e);
            return ExitCode::FAILURE;
        }
    };
    init_logging(&settings);

    match cli.command {
        Commands::Serve => cmd_serve(&settings).await,
        Commands::Query {
            collection,
            operation,
            descriptor,
        } => cmd_query(&settings, &collection, &operation, descriptor.as_deref()).await,
        Commands::Sql { text, params } => cmd_sql(&settings, &text, &params).await,
        Commands::Entities => cmd_entities(),
    }
}

async fn cmd_serve(settings: &Settings) -> ExitCode {
    let (endpoint, pumps) = transport::ndjson(
        tokio::io::stdin(),
        tokio::io::stdout(),
        settings.client.channel_capacity,
    );
    let dispatcher = Arc::new(Dispatcher::from_settings(settings));

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "serving on stdio");
    dispatcher.run(endpoint).await;

    // Let in-flight replies drain before exiting
    if let Err(e) = pumps.writer.await {
        tracing::warn!(error = %e, "output pump ended abnormally");
    }
    ExitCode::SUCCESS
}

fn parse_json(label: &str, text: &str) -> Result<Value, ExitCode> {
    serde_json::from_str(text).map_err(|e| {
        eprintln!("Invalid JSON for {}: {}", label, e);
        ExitCode::FAILURE
    })
}

fn print_result(result: repobridge::BridgeResult<Value>) -> ExitCode {
    match result {
        Ok(value) => {
            match serde_json::to_string_pretty(&value) {
                Ok(text) => println!("{}", text),
                Err(_) => println!("{}", value),
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error ({}): {}", e.kind().as_str(), e.message());
            ExitCode::FAILURE
        }
    }
}

async fn cmd_query(
    settings: &Settings,
    collection: &str,
    operation: &str,
    descriptor: Option<&str>,
) -> ExitCode {
    let Some(operation) = Operation::parse(operation) else {
        let names: Vec<_> = Operation::ALL.iter().map(|op| op.as_str()).collect();
        eprintln!("Unknown operation '{}'. Expected one of: {}", operation, names.join(", "));
        return ExitCode::FAILURE;
    };

    let descriptor = match descriptor {
        Some(text) => match parse_json("descriptor", text) {
            Ok(value) => value,
            Err(code) => return code,
        },
        None => Value::Null,
    };
    let descriptor = match Descriptor::deserialize(&descriptor) {
        Ok(d) => d,
        Err(e) => return print_result(Err(e)),
    };

    let client = Client::in_process(settings);
    if let Err(e) = client.init().await {
        return print_result(Err(e));
    }
    print_result(client.call(operation, collection, &descriptor).await)
}

async fn cmd_sql(settings: &Settings, text: &str, params: &[String]) -> ExitCode {
    let mut scalars = Vec::with_capacity(params.len());
    for (i, param) in params.iter().enumerate() {
        let value = match parse_json(&format!("parameter {}", i + 1), param) {
            Ok(v) => v,
            Err(code) => return code,
        };
        match value {
            Value::Null => scalars.push(None),
            other => match Scalar::from_json(&other) {
                Some(s) => scalars.push(Some(s)),
                None => {
                    eprintln!("Parameter {} must be a scalar or null", i + 1);
                    return ExitCode::FAILURE;
                }
            },
        }
    }

    let client = Client::in_process(settings);
    if let Err(e) = client.init().await {
        return print_result(Err(e));
    }
    print_result(client.raw_query(text, &scalars).await)
}

fn cmd_entities() -> ExitCode {
    for entity in Registry::default().iter() {
        println!("{} (table: {})", entity.name, entity.table);
        for column in entity.columns {
            let mut notes = Vec::new();
            if column.name == entity.primary_key {
                notes.push("primary key".to_string());
            }
            if column.nullable {
                notes.push("nullable".to_string());
            }
            if let Some(default) = column.default {
                notes.push(format!("default {}", default));
            }
            let notes = if notes.is_empty() {
                String::new()
            } else {
                format!(" ({})", notes.join(", "))
            };
            println!("  - {}: {:?}{}", column.name, column.ty, notes);
        }
        println!();
    }
    ExitCode::SUCCESS
}
