// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Multicast downstream node CLI
//!
//! # Usage
//!
//! ```bash
//! # Receive every feed from an upstream server
//! mcast-downstream --server upstream.example.com:38800 --feed ANY
//!
//! # Use a configuration file
//! mcast-downstream --config downstream.toml
//!
//! # Inspect or reset the session memory
//! mcast-downstream --server upstream.example.com --feed 0x10 memory show
//! mcast-downstream --server upstream.example.com --feed 0x10 memory clear --confirm
//!
//! # Product store statistics
//! mcast-downstream --product-db products.sqlite stats
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use mcast_downstream::{
    Downstream, DownstreamConfig, FeedType, McastReceiverFactory, MockMcastFactory,
    ServiceAddr, SessionMemory, SqliteProductStore, UdpMcastFactory,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "mcast-downstream")]
#[command(author, version, about = "Multicast downstream node - gap and backlog recovery", long_about = None)]
struct Args {
    /// Configuration file (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Upstream server (host[:port])
    #[arg(short, long)]
    server: Option<ServiceAddr>,

    /// Feed to subscribe to (ANY, decimal or 0x-hex mask)
    #[arg(short, long)]
    feed: Option<FeedType>,

    /// Directory of the session memory files
    #[arg(long)]
    session_dir: Option<PathBuf>,

    /// Product store database (SQLite file)
    #[arg(long)]
    product_db: Option<PathBuf>,

    /// Seconds to wait between sessions
    #[arg(long)]
    retry_interval: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Use the in-process multicast transport (for testing without a network)
    #[arg(long)]
    mock: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Inspect or modify the session memory of (server, feed)
    Memory {
        #[command(subcommand)]
        action: MemoryAction,
    },
    /// Show product store statistics
    Stats {
        /// Number of recent products to list
        #[arg(long, default_value_t = 10)]
        recent: usize,
    },
}

#[derive(Subcommand, Debug)]
enum MemoryAction {
    /// Show queue lengths and the last multicast signature
    Show,
    /// Clear the missed-product queue
    Clear {
        /// Confirm deletion
        #[arg(long)]
        confirm: bool,
    },
    /// Delete the session memory file
    Delete {
        /// Confirm deletion
        #[arg(long)]
        confirm: bool,
    },
}

fn load_config(args: &Args) -> Result<DownstreamConfig> {
    let mut config = match &args.config {
        Some(path) => DownstreamConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => DownstreamConfig::default(),
    };

    if let Some(server) = &args.server {
        config.server = server.clone();
    }
    if let Some(feed) = args.feed {
        config.feed = feed;
    }
    if let Some(dir) = &args.session_dir {
        config.session_dir = dir.clone();
    }
    if let Some(db) = &args.product_db {
        config.product_db = db.clone();
    }
    if let Some(secs) = args.retry_interval {
        config.retry_interval_secs = secs;
    }
    if let Some(level) = &args.log_level {
        config.log_level = level.clone();
    }

    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    // RUST_LOG overrides the configured level
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .context("Invalid log level")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    if let Some(cmd) = args.command {
        return handle_command(cmd, &config);
    }

    info!("Multicast downstream v{}", env!("CARGO_PKG_VERSION"));
    info!("  Server:       {}", config.server);
    info!("  Feed:         {}", config.feed);
    info!("  Session dir:  {}", config.session_dir.display());
    info!("  Product db:   {}", config.product_db.display());

    let store = Arc::new(
        SqliteProductStore::new(&config.product_db, config.max_product_size)
            .context("Failed to open product store")?,
    );
    let mcast: Arc<dyn McastReceiverFactory> = if args.mock {
        Arc::new(MockMcastFactory::new())
    } else {
        Arc::new(UdpMcastFactory::new(config.mcast_interface))
    };

    let downstream = Downstream::new(config, store, mcast)?;

    let handle = downstream.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutdown signal received, stopping...");
        handle.shutdown();
    });

    downstream.run().await?;
    Ok(())
}

fn handle_command(cmd: Commands, config: &DownstreamConfig) -> Result<()> {
    match cmd {
        Commands::Memory { action } => handle_memory(action, config),
        Commands::Stats { recent } => {
            let store = SqliteProductStore::new(&config.product_db, config.max_product_size)?;
            let stats = store.stats()?;

            println!("Product store: {}", config.product_db.display());
            println!("  Products: {}", stats.products);
            println!("  Bytes:    {}", stats.bytes);
            if let (Some(oldest), Some(newest)) = (stats.oldest_ns, stats.newest_ns) {
                println!("  Span:     {} s", (newest.saturating_sub(oldest)) / 1_000_000_000);
            }
            for info in store.recent(recent)? {
                println!("  {} {:>10} {}", info.signature, info.size, info.ident);
            }
            Ok(())
        }
    }
}

fn handle_memory(action: MemoryAction, config: &DownstreamConfig) -> Result<()> {
    let dir = &config.session_dir;
    match action {
        MemoryAction::Show => {
            let memory = SessionMemory::open(dir, &config.server, config.feed)?;
            println!(
                "Session memory: {}",
                SessionMemory::path_for(dir, &config.server, config.feed).display()
            );
            println!("  Missed:    {}", memory.missed_len()?);
            println!("  Requested: {}", memory.requested_len()?);
            match memory.last_mcast_signature()? {
                Some(sig) => println!("  Last multicast product: {}", sig),
                None => println!("  Last multicast product: (none)"),
            }
            memory.close()?;
        }
        MemoryAction::Clear { confirm } => {
            if !confirm {
                bail!("Use --confirm to clear the missed-product queue");
            }
            let memory = SessionMemory::open(dir, &config.server, config.feed)?;
            memory.clear_all_missed()?;
            memory.close()?;
            println!("Cleared missed products for {} feed {}", config.server, config.feed);
        }
        MemoryAction::Delete { confirm } => {
            if !confirm {
                bail!("Use --confirm to delete the session memory");
            }
            if SessionMemory::delete(dir, &config.server, config.feed)? {
                println!("Deleted session memory for {} feed {}", config.server, config.feed);
            } else {
                println!("No session memory for {} feed {}", config.server, config.feed);
            }
        }
    }
    Ok(())
}
