//! Tandem CLI binary.
//!
//! Loopback demo of the session layer.
//!
//! # Commands
//!
//! - `transfer` - Move a generated payload between two in-process engines
//! - `config` - Print the effective configuration as TOML

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use clap::{Parser, Subcommand};
use tandem::{
    config::Config,
    transaction::{format_bytes, sized, TransactionEvent},
    transport::{memory::MemoryPeer, PeerConnection, RtcConfiguration},
    Engine, LocalSignaler, TandemError, VERSION,
};

/// Payload is written in pieces of this size
const WRITE_SIZE: usize = 1024 * 1024;

#[derive(Parser)]
#[command(name = "tandem")]
#[command(version = VERSION)]
#[command(about = "Tandem - peer-to-peer session layer", long_about = None)]
struct Cli {
    /// Config file (TOML); defaults to TANDEM_* environment variables
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Transfer a generated payload over an in-process connection
    Transfer {
        /// Payload size in bytes
        #[arg(short, long, default_value = "104857600")]
        size: u64,

        /// Writer chunk size in bytes (overrides config)
        #[arg(long)]
        chunk_size: Option<usize>,

        /// Pause the transfer halfway for this many milliseconds
        #[arg(long)]
        pause_ms: Option<u64>,
    },

    /// Print the effective configuration
    Config,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();

    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env(),
    };

    match cli.command {
        Commands::Transfer {
            size,
            chunk_size,
            pause_ms,
        } => {
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(cmd_transfer(config, size, chunk_size, pause_ms))
        },
        Commands::Config => cmd_config(&config),
    }
}

fn cmd_config(config: &Config) -> anyhow::Result<()> {
    print!("{}", config.to_toml()?);
    Ok(())
}

async fn cmd_transfer(
    mut config: Config,
    size: u64,
    chunk_size: Option<usize>,
    pause_ms: Option<u64>,
) -> anyhow::Result<()> {
    if let Some(chunk_size) = chunk_size {
        config.transfer.chunk_size = chunk_size;
    }
    // Both engines share one process; role assignment decides who is polite
    config.engine.role = None;

    let (sig_a, sig_b) = LocalSignaler::pair();
    let (pc_a, pc_b) = MemoryPeer::pair();

    let connect_a = move |rtc: &RtcConfiguration| {
        pc_a.configure(rtc);
        Ok::<_, TandemError>(Arc::clone(&pc_a) as Arc<dyn PeerConnection>)
    };
    let connect_b = move |rtc: &RtcConfiguration| {
        pc_b.configure(rtc);
        Ok::<_, TandemError>(Arc::clone(&pc_b) as Arc<dyn PeerConnection>)
    };

    let sender = Engine::with_config(sig_a, &connect_a, config.clone())?;
    let receiver = Engine::with_config(sig_b, &connect_b, config)?;

    tokio::try_join!(sender.connect(), receiver.connect())?;
    tracing::info!(
        sender = ?sender.role(),
        receiver = ?receiver.role(),
        "connected"
    );

    let (writer, reader) = tokio::try_join!(
        sender.writable(Some("transfer"), sized(size)),
        receiver.readable("transfer"),
    )?;

    let mut reports = reader.subscribe();
    let progress = tokio::spawn(async move {
        while let Some(event) = reports.recv().await {
            match event {
                TransactionEvent::Report(report) => {
                    println!(
                        "{:>6.1}%  {:>10}  eta {:>4}s  {}",
                        report.progress * 100.0,
                        format_bytes(report.processed as f64),
                        report.eta,
                        report.speed
                    );
                },
                TransactionEvent::State(state) => println!("state: {:?}", state),
            }
        }
    });

    let started = Instant::now();
    let consume = async {
        let mut received = 0u64;
        while let Some(chunk) = reader.read().await? {
            received += chunk.len() as u64;
        }
        Ok::<_, TandemError>(received)
    };

    let produce = async {
        let piece = Bytes::from(vec![0x5a; WRITE_SIZE]);
        let mut sent = 0u64;
        let mut paused = false;

        while sent < size {
            if let Some(pause_ms) = pause_ms {
                if !paused && sent >= size / 2 {
                    paused = true;
                    writer.pause().await?;
                    tracing::info!(pause_ms, "pausing transfer");
                    tokio::time::sleep(Duration::from_millis(pause_ms)).await;
                    writer.resume().await?;
                }
            }

            let len = (size - sent).min(WRITE_SIZE as u64) as usize;
            writer.write(piece.slice(..len)).await?;
            sent += len as u64;
        }
        writer.finish().await?;
        Ok::<_, TandemError>(sent)
    };

    let (sent, received) = tokio::try_join!(produce, consume)?;
    let elapsed = started.elapsed();
    progress.abort();

    let throughput = received as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
    println!();
    println!("Transfer complete:");
    println!("  Sent:       {} bytes", sent);
    println!("  Received:   {} bytes", received);
    println!("  Elapsed:    {:.2?}", elapsed);
    println!("  Throughput: {}/s", format_bytes(throughput));

    if let Some(stats) = sender.stats(writer.transaction().socket()).await? {
        println!(
            "  Channel:    {} messages, {} sent",
            stats.messages_sent,
            format_bytes(stats.bytes_sent as f64)
        );
    }

    sender.close().await;
    receiver.close().await;
    Ok(())
}
