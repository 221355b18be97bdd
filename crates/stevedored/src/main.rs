//! stevedored - Stevedore daemon.
//!
//! Serves the control channel over HTTP and pushes install progress and
//! container events as Server-Sent Events.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use color_eyre::eyre::{Result, WrapErr};
use stevedore::{RuntimeKind, StevedoreConfig};
use stevedored::{App, http};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Runtime backend selectable on the command line.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum RuntimeArg {
    /// Drive the docker CLI.
    Docker,
    /// In-process simulation, for demos.
    Memory,
}

impl From<RuntimeArg> for RuntimeKind {
    fn from(arg: RuntimeArg) -> Self {
        match arg {
            RuntimeArg::Docker => Self::Docker,
            RuntimeArg::Memory => Self::Memory,
        }
    }
}

/// Stevedore daemon - local development infrastructure
#[derive(Parser, Debug)]
#[command(name = "stevedored")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(long, env = "STEVEDORE_CONFIG")]
    config: Option<PathBuf>,

    /// Root directory for stevedore data
    #[arg(long, env = "STEVEDORE_ROOT")]
    root: Option<PathBuf>,

    /// Container runtime backend
    #[arg(long, value_enum)]
    runtime: Option<RuntimeArg>,

    /// Address for the HTTP control channel
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Log as JSON lines
    #[arg(long)]
    log_json: bool,
}

fn init_tracing(args: &Args) -> Result<()> {
    let default = if args.debug {
        "stevedored=debug,stevedore=debug,stevedore_runtime=debug,tower_http=debug"
    } else {
        "stevedored=info,stevedore=info"
    };
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(args.log_json.then(|| fmt::layer().json()))
        .with((!args.log_json).then(|| fmt::layer().with_target(true)))
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling
    color_eyre::install()?;

    let args = Args::parse();
    init_tracing(&args)?;

    let mut config = StevedoreConfig::load(args.config.as_deref()).wrap_err("loading configuration")?;
    if let Some(root) = args.root {
        config = config.with_root(root);
    }
    if let Some(runtime) = args.runtime {
        config = config.with_runtime(runtime.into());
    }
    if let Some(bind) = args.bind {
        config.http.bind = bind;
    }

    let bind = config.http.bind;
    let app = App::build(config).wrap_err("building daemon")?;
    let follower = app.start().await;

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .wrap_err_with(|| format!("binding {bind}"))?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        root = %app.paths().root.display(),
        "stevedored started"
    );

    http::serve(listener, app.control().clone(), async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Could not listen for shutdown signal");
            std::future::pending::<()>().await;
        }
        tracing::info!("Shutting down");
    })
    .await
    .wrap_err("serving control channel")?;

    app.shutdown().await;
    if let Err(e) = follower.await {
        tracing::warn!(error = %e, "State view task ended abnormally");
    }
    Ok(())
}
