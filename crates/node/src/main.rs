//! Coedit node binary.
//!
//! Hosts one coordination engine and serves editor clients over a
//! newline-delimited JSON TCP transport.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use coedit_engine::{BackboneKind, ClusterFabric, Coordinator, MemoryStorage, TextCommandExecutor};
use coedit_proto::DesignId;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

mod config;
mod transport;

use config::{LogConfig, NodeConfig};

/// Node command line arguments.
#[derive(Parser, Debug)]
#[command(name = "coedit-node")]
#[command(about = "Collaborative design editing node")]
struct Args {
	/// Configuration file
	#[arg(short, long, value_name = "PATH")]
	config: Option<PathBuf>,

	/// Address to listen on, overrides the config file
	#[arg(short, long, value_name = "ADDR")]
	listen: Option<std::net::SocketAddr>,

	/// Backbone strategy (log or replicated), overrides the config file
	#[arg(short, long, value_name = "KIND")]
	backbone: Option<BackboneKind>,

	/// Node identifier, overrides the config file
	#[arg(long, value_name = "ID")]
	node_id: Option<String>,

	/// Verbose logging
	#[arg(short, long)]
	verbose: bool,
}

impl Args {
	fn apply(&self, config: &mut NodeConfig) {
		if let Some(listen) = self.listen {
			config.listen = listen;
		}
		if let Some(kind) = self.backbone {
			config.engine.backbone.kind = kind;
		}
		if let Some(node_id) = &self.node_id {
			config.engine.node_id = Some(node_id.clone());
		}
	}
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
	let args = Args::parse();

	let mut config = NodeConfig::load(args.config.as_deref())?;
	args.apply(&mut config);
	config.engine.validate()?;

	match setup_tracing(args.verbose, &config.log) {
		Some(path) => info!(path = %path.display(), "starting coedit-node"),
		None => info!("starting coedit-node"),
	}

	let storage = Arc::new(MemoryStorage::new());
	for seed in &config.designs {
		storage.insert_design(DesignId::new(seed.id.clone()), seed.content.clone());
	}
	info!(designs = config.designs.len(), "storage seeded");

	let fabric = ClusterFabric::new(&config.engine.backbone);
	let coordinator = Coordinator::new(&config.engine, &fabric, storage, Arc::new(TextCommandExecutor));
	coordinator.start().await?;

	let shutdown = CancellationToken::new();
	tokio::spawn({
		let shutdown = shutdown.clone();
		async move {
			match tokio::signal::ctrl_c().await {
				Ok(()) => {
					info!("interrupt received");
					shutdown.cancel();
				}
				Err(e) => tracing::error!(error = %e, "cannot listen for interrupt"),
			}
		}
	});

	let listener = TcpListener::bind(config.listen).await?;
	transport::serve(listener, coordinator.clone(), shutdown).await?;
	coordinator.shutdown().await;

	Ok(())
}

/// Filter used when `RUST_LOG` is unset: the configured directives, or the
/// node's own crates at a level picked by `--verbose`.
fn default_filter(verbose: bool, configured: Option<&str>) -> String {
	match configured {
		Some(directives) => directives.to_string(),
		None if verbose => "coedit_engine=trace,coedit_node=trace,info".to_string(),
		None => "coedit_engine=info,coedit_node=info,warn".to_string(),
	}
}

/// Installs the global subscriber. Logs go to a per-process file when a log
/// directory is configured and usable, to stderr otherwise. Returns the file.
fn setup_tracing(verbose: bool, log: &LogConfig) -> Option<PathBuf> {
	use std::fs::OpenOptions;

	use tracing_subscriber::EnvFilter;
	use tracing_subscriber::fmt::format::FmtSpan;

	let filter =
		EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter(verbose, log.filter.as_deref())));

	let dir = std::env::var_os("COEDIT_LOG_DIR").map(PathBuf::from).or_else(|| log.dir.clone());
	let file = dir.and_then(|dir| {
		std::fs::create_dir_all(&dir).ok()?;
		let path = dir.join(format!("coedit-node.{}.log", std::process::id()));
		let file = OpenOptions::new().create(true).append(true).open(&path).ok()?;
		Some((path, file))
	});

	let Some((path, file)) = file else {
		tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
		return None;
	};
	tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_writer(file)
		.with_ansi(false)
		.with_span_events(FmtSpan::CLOSE)
		.with_target(true)
		.init();
	Some(path)
}
