use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_derive::{Deserialize, Serialize};
use slog::o;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::mpsc;

use raft_journal::{
    metrics, JournalConfig, LogEntry, Node, NodeEvent, ReplicatedLog, SegmentedReplicatedLog,
    StateMachine,
};

const LOGGER_CHANNEL_SIZE: usize = 4096; // Size of logger channel buffer
const EVENT_CHANNEL_SIZE: usize = 1024;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Journal configuration file
    #[arg(short, long, default_value = "journal.toml")]
    config: String,

    /// Data directory, overrides the configuration file
    #[arg(short, long)]
    dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print segments and the compaction boundary as JSON
    Inspect,
    /// Print retained entries as JSON lines
    Dump {
        #[arg(long, default_value = "1")]
        from: u64,
    },
    /// Append payloads at the current term
    Append { payloads: Vec<String> },
    /// Compact the log up to an index, never past the newest snapshot
    Trim { index: i64 },
    /// Propose every stdin line until EOF or Ctrl+C
    Serve,
}

/// Counts applied entries and bytes.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Counter {
    entries: u64,
    bytes: u64,
}

impl StateMachine for Counter {
    fn apply(&mut self, _index: u64, data: &[u8]) {
        self.entries += 1;
        self.bytes += data.len() as u64;
    }

    fn snapshot(&self) -> Vec<u8> {
        match bincode::serialize(self) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::error!("Failed to encode counter state: {:?}", e);
                Vec::new()
            }
        }
    }

    fn on_snapshot(&mut self, last_index: u64, _last_term: u64, data: &[u8]) {
        match bincode::deserialize::<Counter>(data) {
            Ok(counter) => *self = counter,
            Err(e) => log::error!("Failed to decode snapshot at {}: {:?}", last_index, e),
        }
    }
}

#[cfg(feature = "slog-term")]
fn build_logger() -> slog::Logger {
    use slog::Drain;

    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain)
        .chan_size(LOGGER_CHANNEL_SIZE)
        .overflow_strategy(slog_async::OverflowStrategy::Block)
        .build()
        .fuse();
    slog::Logger::root(drain, o!())
}

#[cfg(not(feature = "slog-term"))]
fn build_logger() -> slog::Logger {
    use slog::Drain;

    let drain = slog_async::Async::new(slog::Discard)
        .chan_size(LOGGER_CHANNEL_SIZE)
        .build()
        .fuse();
    slog::Logger::root(drain, o!())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn inspect(config: &JournalConfig, logger: &slog::Logger) -> anyhow::Result<()> {
    let log = SegmentedReplicatedLog::open(config, logger)?;
    let journal = log.journal();
    let report = serde_json::json!({
        "dir": config.dir,
        "snapshot_index": log.snapshot_index(),
        "snapshot_term": log.snapshot_term(),
        "last_index": log.last_index(),
        "last_term": log.last_term(),
        "size": log.size(),
        "data_size": log.data_size(),
        "size_bytes": journal.size_bytes(),
        "segments": journal.segments(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn dump(config: &JournalConfig, logger: &slog::Logger, from: u64) -> anyhow::Result<()> {
    let log = SegmentedReplicatedLog::open(config, logger)?;
    let mut reader = log.open_reader(from.max(log.journal().first_index()));
    for entry in reader.iter() {
        println!("{}", serde_json::to_string(&entry?)?);
    }
    reader.close();
    Ok(())
}

fn append(config: &JournalConfig, logger: &slog::Logger, payloads: Vec<String>) -> anyhow::Result<()> {
    let mut log = SegmentedReplicatedLog::open(config, logger)?;
    let term = log.last_term().max(1) as u64;
    for payload in payloads {
        let index = (log.last_index() + 1).max(1) as u64;
        log.append(LogEntry::new(term, index, payload.into_bytes()))?;
        println!("{}", index);
    }
    log.flush()?;
    Ok(())
}

fn trim(config: &JournalConfig, logger: &slog::Logger, index: i64) -> anyhow::Result<()> {
    let (mut node, _) = Node::open("local", vec![], config, Counter::default(), logger)?;
    node.drain_captures()?;
    let trimmed = node.trim_log(index)?;
    println!("{}", trimmed);
    Ok(())
}

async fn serve(config: &JournalConfig, logger: &slog::Logger) -> anyhow::Result<()> {
    let (mut node, _install_rx) = Node::open("local", vec![], config, Counter::default(), logger)?;
    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_SIZE);

    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(NodeEvent::Propose(line.into_bytes())).await.is_err() {
                break;
            }
        }
    });

    tokio::select! {
        result = node.run(rx) => result?,
        _ = shutdown_signal() => {},
    }
    node.log().flush()?;
    log::info!(
        "Applied {} entries, {} bytes",
        node.state_machine().entries,
        node.state_machine().bytes
    );
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::try_init().unwrap_or_default();
    metrics::init_registry();

    let args = Args::parse();
    let mut config = JournalConfig::from_toml(&args.config);
    if let Some(dir) = args.dir {
        config.dir = dir;
    }
    let logger = build_logger();

    let result = match args.command {
        Command::Inspect => inspect(&config, &logger),
        Command::Dump { from } => dump(&config, &logger, from),
        Command::Append { payloads } => append(&config, &logger, payloads),
        Command::Trim { index } => trim(&config, &logger, index),
        Command::Serve => serve(&config, &logger).await,
    };
    result.with_context(|| format!("journal at {:?}", config.dir))
}
