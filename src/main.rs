mod agent;
mod config;
mod control;
mod http;
mod interceptor;
mod invalidation;
mod legacy;
mod logging;
mod policy;
mod replay;
mod server;
mod store;
mod sync;
mod transport;

use clap::Parser;
use color_eyre::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::agent::{Agent, AgentEvent};
use crate::transport::HttpTransport;

#[derive(Parser, Debug)]
#[command(name = "outpost")]
#[command(about = "Offline-sync agent: read cache, write outbox and replay for a JSON API")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/outpost/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Upstream API base URL; enough to run without a config file
  #[arg(short, long)]
  upstream: Option<String>,

  /// Address to listen on for pages
  #[arg(short, long)]
  listen: Option<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration; a bare --upstream is enough
  let config = match (&args.config, &args.upstream) {
    (None, Some(upstream)) => config::Config::load(None)
      .map(|c| config::Config {
        upstream: upstream.clone(),
        ..c
      })
      .or_else(|_| config::Config::with_upstream(upstream))?,
    (path, upstream) => {
      let config = config::Config::load(path.as_deref())?;
      match upstream {
        Some(upstream) => config::Config {
          upstream: upstream.clone(),
          ..config
        },
        None => config,
      }
    }
  };

  // Override listen address if specified on command line
  let config = if let Some(listen) = args.listen {
    config::Config { listen, ..config }
  } else {
    config
  };

  let data_dir = config.data_dir()?;
  let _log_guard = logging::init(&config.log, &data_dir)?;
  info!(version = %config.version, upstream = %config.upstream, "Starting outpost");

  let transport = Arc::new(HttpTransport::new(&config.upstream)?);
  let listen = config.listen.clone();
  let probe = Duration::from_secs(config.sync.probe_interval_secs.max(1));
  let periodic = config.sync.periodic_interval_secs.map(Duration::from_secs);

  let agent = Arc::new(Agent::open(config, transport)?);
  agent.dispatch(AgentEvent::Install).await;
  agent.dispatch(AgentEvent::Activate).await;

  // Anything left over from the last run goes out on the first online probe
  if agent.pending_total() > 0 {
    agent.sync_registry().register(sync::OUTBOX_SYNC_TAG);
  }

  tokio::select! {
    result = server::serve(Arc::clone(&agent), &listen) => result?,
    _ = sync::watch_connectivity(Arc::clone(&agent), probe, periodic) => {}
    _ = tokio::signal::ctrl_c() => info!("Shutting down"),
  }

  Ok(())
}
