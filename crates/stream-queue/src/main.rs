//! stream-queue binary entry point.
//!
//! Usage:
//!   stream-queue send --stream orders --field sku=A-1 --field quantity=2
//!   stream-queue consume --stream orders --group billing --count 10 --ack
//!   stream-queue ack --stream orders --group billing 1700000000000-0

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use stream_queue::{
    BrokerConfig, ConnectionManager, ConnectionRegistry, Fixed, HostAndType, StreamConsumer,
    StreamProducer,
};
use tracing::{error, info};

type Record = BTreeMap<String, String>;

/// Send, consume and acknowledge stream entries.
#[derive(Parser, Debug)]
#[command(name = "stream-queue")]
#[command(about = "Typed producers and consumer groups over Redis Streams")]
struct Args {
    /// Connection string (native `host:port,password=...` or `redis://` URI).
    #[arg(long, env = "STREAM_QUEUE_CONNECTION")]
    connection: Option<String>,

    /// JSON configuration file.
    #[arg(long, env = "STREAM_QUEUE_CONFIG")]
    config: Option<PathBuf>,

    /// Registry name of the connection (part of the client name).
    #[arg(long, default_value = "cli")]
    name: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Append one entry to a stream.
    Send {
        /// Stream to append to.
        #[arg(long)]
        stream: String,

        /// Field as `name=value`; repeat for more fields.
        #[arg(long = "field", short = 'f', value_parser = parse_field, required = true)]
        fields: Vec<(String, String)>,
    },

    /// Read entries as a member of a consumer group.
    Consume {
        /// Stream to read from.
        #[arg(long)]
        stream: String,

        /// Consumer group to read as.
        #[arg(long)]
        group: String,

        /// Maximum number of entries to read.
        #[arg(long)]
        count: Option<usize>,

        /// Re-read this consumer's delivered but unacknowledged entries.
        #[arg(long)]
        history: bool,

        /// Acknowledge every entry after printing it.
        #[arg(long)]
        ack: bool,

        /// Consumer name to use instead of `{hostname}-BTreeMap`.
        #[arg(long)]
        consumer: Option<String>,
    },

    /// Acknowledge one entry.
    Ack {
        #[arg(long)]
        stream: String,

        #[arg(long)]
        group: String,

        /// Entry id to acknowledge.
        id: String,

        #[arg(long)]
        consumer: Option<String>,
    },
}

fn parse_field(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .filter(|(name, _)| !name.is_empty())
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .ok_or_else(|| format!("expected name=value, got '{}'", s))
}

fn load_config(args: &Args) -> anyhow::Result<BrokerConfig> {
    let mut config = match &args.config {
        Some(path) => BrokerConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => BrokerConfig::new(args.name.clone()),
    };

    config.name = args.name.clone();
    if let Some(connection) = &args.connection {
        config.connection_string = Some(connection.clone());
    }
    if let Some(level) = &args.log_level {
        config.log_level = level.clone();
    }

    Ok(config)
}

fn consumer(
    connection: Arc<ConnectionManager>,
    group: &str,
    name: Option<&str>,
) -> StreamConsumer<Record> {
    match name {
        Some(name) => StreamConsumer::with_naming(connection, group, &Fixed(name.to_string())),
        None => StreamConsumer::with_naming(connection, group, &HostAndType::new()),
    }
}

async fn subscribed(consumer: &StreamConsumer<Record>, stream: &str) -> anyhow::Result<()> {
    if !consumer.subscribe(stream).await? {
        bail!(
            "could not subscribe group '{}' to stream '{}'",
            consumer.group(),
            stream
        );
    }
    Ok(())
}

async fn run(command: Command, connection: Arc<ConnectionManager>) -> anyhow::Result<()> {
    match command {
        Command::Send { stream, fields } => {
            let record: Record = fields.into_iter().collect();
            let producer = StreamProducer::new(connection);
            if !producer.send(&stream, &record).await? {
                bail!("broker did not assign an entry id");
            }
            info!(stream = %stream, fields = record.len(), "Entry sent");
        }

        Command::Consume {
            stream,
            group,
            count,
            history,
            ack,
            consumer: name,
        } => {
            let consumer = consumer(connection, &group, name.as_deref());
            subscribed(&consumer, &stream).await?;

            let Some(messages) = consumer.consume(count, !history).await? else {
                info!(stream = %stream, group = %group, "No entries");
                return Ok(());
            };

            for message in messages {
                let line = serde_json::json!({ "id": message.id, "fields": message.message });
                println!("{}", line);

                if ack && !consumer.commit(&message.id).await? {
                    error!(id = %message.id, "Entry was not pending");
                }
            }
        }

        Command::Ack {
            stream,
            group,
            id,
            consumer: name,
        } => {
            let consumer = consumer(connection, &group, name.as_deref());
            subscribed(&consumer, &stream).await?;

            if consumer.commit(&id).await? {
                info!(id = %id, "Entry acknowledged");
            } else {
                bail!("entry '{}' is not pending in group '{}'", id, group);
            }
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    observability::init_with_config(observability::LogConfig {
        service_name: "stream-queue".into(),
        default_level: config.log_level.clone(),
        also_stderr: true,
        ..Default::default()
    });

    let registry = ConnectionRegistry::new();
    let connection = registry.get_or_create(&config)?;

    let result = tokio::select! {
        result = run(args.command, connection) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal, exiting...");
            Ok(())
        }
    };

    registry.close_all().await;
    result
}
