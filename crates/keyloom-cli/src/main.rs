//! Keyloom demo driver.
//!
//! # Usage
//!
//! ```bash
//! # Two devices exchange a room key and ten messages
//! keyloom simulate --messages 10
//!
//! # Export five room keys, keep the blob, import it into a fresh device
//! keyloom export-roundtrip --rooms 5 --passphrase "correct horse" --rounds 3 --out keys.txt
//! ```

mod scenario;
mod system_env;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::system_env::SystemEnv;

/// Keyloom session orchestration demo
#[derive(Parser, Debug)]
#[command(name = "keyloom")]
#[command(about = "Drive simulated devices through key sharing and backup")]
#[command(version)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Share a room key from alice to bob and decrypt alice's messages
    Simulate {
        /// Messages alice sends
        #[arg(long, default_value = "5")]
        messages: usize,
    },

    /// Export room keys and import them into a fresh device
    ExportRoundtrip {
        /// Room sessions to create before exporting
        #[arg(long, default_value = "5")]
        rooms: usize,

        /// Export passphrase
        #[arg(long)]
        passphrase: String,

        /// Key derivation rounds
        #[arg(long, default_value = "3")]
        rounds: u32,

        /// Also write the export to this file
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    match args.command {
        Command::Simulate { messages } => {
            let report = scenario::simulate(&SystemEnv, messages).await?;
            tracing::info!(sent = report.sent, decrypted = report.decrypted, "simulation finished");
            if report.decrypted != report.sent {
                tracing::error!(
                    missing = report.sent - report.decrypted,
                    "some messages did not decrypt"
                );
            }
        },
        Command::ExportRoundtrip { rooms, passphrase, rounds, out } => {
            let counts =
                scenario::export_roundtrip(&SystemEnv, rooms, &passphrase, rounds, out.as_deref())
                    .await?;
            tracing::info!(total = counts.total, imported = counts.imported, "round trip finished");
        },
    }

    Ok(())
}
