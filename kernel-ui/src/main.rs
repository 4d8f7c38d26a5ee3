//! Kernel UI server - HTTP façade and change feed over one open project.

mod routes;
mod sse;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use axum::Router;
use axum::routing::get;
use clap::Parser;
use kernel::commands::{Kernel, KernelCommand};
use kernel::io::config::{CONFIG_FILE, load_config};
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tracing::info;

use crate::state::AppState;

#[derive(Parser)]
#[command(name = "kernel-ui")]
#[command(about = "HTTP API and live change feed for a notebook kernel")]
struct Args {
    /// Address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// Port to listen on
    #[arg(long, default_value = "3002")]
    port: u16,

    /// Project directory (contains notebook.json)
    #[arg(long, default_value = ".")]
    project_dir: PathBuf,

    /// Config file; defaults to `<project>/kernel.toml`
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("kernel_ui=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let project_dir = args.project_dir.canonicalize().unwrap_or(args.project_dir);
    info!(project_dir = %project_dir.display(), "starting kernel-ui");

    let config_path = args
        .config
        .unwrap_or_else(|| project_dir.join(CONFIG_FILE));
    let config = load_config(&config_path)?;

    let kernel = Kernel::new(config);
    let opened = kernel.dispatch(KernelCommand::Open {
        path: project_dir.clone(),
    });
    if !opened.success {
        bail!("open {}: {}", project_dir.display(), opened.message);
    }
    let layout = kernel
        .session()
        .context("project session missing after open")?
        .layout();
    info!(results_dir = %layout.output_dir.display(), "project opened");

    let state = AppState::new(Arc::new(kernel), layout);

    sse::start_file_watcher(state.clone());

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .nest("/api", routes::api_router())
        .route("/events", get(sse::events_handler))
        .nest_service("/results", ServeDir::new(state.results_dir()))
        .layer(cors)
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;
    info!(addr = %addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
