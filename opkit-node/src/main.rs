//! opkit-node: hosts a resource kind's controller against an in-memory store.
//!
//! The process:
//! - Seeds the store from a JSON manifest
//! - Drives the controller from the store's watch events until it settles
//! - Requests the deletions given on the command line
//! - Prints the final store contents as JSON

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use opkit_core::{DEFAULT_FINALIZER, DispatcherConfig, EventLoopConfig, PatchScope, create_observer};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod controller;
mod host;
mod manifest;

use controller::StatusController;
use host::{ControllerHost, DeleteTarget, HostConfig};

/// What finalizer-only patches send to the store.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum PatchMode {
    /// Whole resource body
    Full,
    /// Finalizer list only
    Finalizers,
}

impl From<PatchMode> for PatchScope {
    fn from(mode: PatchMode) -> Self {
        match mode {
            PatchMode::Full => PatchScope::Full,
            PatchMode::Finalizers => PatchScope::Finalizers,
        }
    }
}

/// opkit controller host
#[derive(Parser, Debug)]
#[command(name = "opkit-node", version, about)]
struct Args {
    /// JSON manifest: an array of resources to seed the store with
    #[arg(long)]
    manifest: PathBuf,

    /// Resource kind handled by this host
    #[arg(long, default_value = "Widget")]
    kind: String,

    /// Finalizer owned by the controller
    #[arg(long, default_value = DEFAULT_FINALIZER)]
    finalizer: String,

    /// Patch body used for finalizer-only writes
    #[arg(long, value_enum, default_value = "full")]
    patch_scope: PatchMode,

    /// Retries per event before it is abandoned
    #[arg(long, default_value = "5")]
    max_retries: u32,

    /// Initial retry backoff in milliseconds
    #[arg(long, default_value = "100")]
    backoff_ms: u64,

    /// Upper bound for the retry backoff in milliseconds
    #[arg(long, default_value = "10000")]
    backoff_cap_ms: u64,

    /// Quiet period in milliseconds after which the store counts as settled
    #[arg(long, default_value = "500")]
    idle_timeout_ms: u64,

    /// Watch events buffered per subscriber
    #[arg(long, default_value = "1024", value_parser = clap::value_parser!(u32).range(1..))]
    watch_capacity: u32,

    /// Resource to delete after the initial sync (<namespace>/<name> or <name>), repeatable
    #[arg(long = "delete")]
    deletions: Vec<DeleteTarget>,
}

impl Args {
    fn host_config(&self) -> HostConfig {
        HostConfig {
            kind: self.kind.clone(),
            dispatcher: DispatcherConfig {
                finalizer: self.finalizer.clone(),
                patch_scope: self.patch_scope.into(),
            },
            event_loop: EventLoopConfig {
                max_retries: self.max_retries,
                backoff_base: Duration::from_millis(self.backoff_ms),
                backoff_cap: Duration::from_millis(self.backoff_cap_ms),
                ..Default::default()
            },
            watch_capacity: self.watch_capacity as usize,
            idle_timeout: Duration::from_millis(self.idle_timeout_ms),
            deletions: self.deletions.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout carries the final store dump.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "opkit_node=info,opkit_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    info!("Starting opkit-node for kind {}", args.kind);
    info!("Manifest: {}", args.manifest.display());

    let seed = manifest::load(&args.manifest, &args.kind).await?;

    let host = ControllerHost::new(
        Arc::new(StatusController::new()),
        create_observer("opkit-node"),
        args.host_config(),
    );
    let report = host.run(seed).await?;

    info!(
        received = report.stats.received(),
        handled = report.stats.handled(),
        requeued = report.stats.requeued(),
        abandoned = report.stats.abandoned(),
        remaining = report.resources.len(),
        "Run complete"
    );

    let dump = serde_json::to_string_pretty(&report.resources).context("Failed to encode store contents")?;
    println!("{dump}");
    Ok(())
}
