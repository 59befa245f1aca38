mod config;

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use kubedesk_cluster::{
    AuthProxyConfig, BroadcastSink, ClusterRegistry, HandlerConfig, KubeVersionProbe,
    StaticPreferences, TokioLauncher,
};
use kubedesk_k8s::KubeconfigMaterializer;
use kubedesk_router::{AppApi, Router, RouterConfig, serve};
use kubedesk_sync::{SyncConfig, SyncEngine};

use crate::config::Config;

const CATALOG_CAPACITY: usize = 256;

/// Kubedesk - one local origin for all your Kubernetes clusters
#[derive(Parser, Debug)]
#[command(name = "kubedesk")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file
    #[arg(long, default_value = "kubedesk.toml")]
    config: PathBuf,

    /// Router port (overrides the config file)
    #[arg(long)]
    port: Option<u16>,

    /// Extra kubeconfig files or directories to sync
    #[arg(long, value_name = "PATH")]
    kubeconfig: Vec<PathBuf>,

    /// Default log level when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: tracing::Level,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(args.log_level.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let result = run(args).await;

    if let Err(e) = &result {
        eprintln!("Error: {:#}", e);
    }

    result
}

async fn run(args: Args) -> Result<()> {
    let mut config = Config::load(&args.config)?;
    if let Some(port) = args.port {
        config.server.port = port;
    }

    let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, config.server.port)))
        .await
        .with_context(|| format!("failed to bind port {}", config.server.port))?;
    let app_port = listener.local_addr()?.port();

    let materializer = match &config.auth_proxy.temp_dir {
        Some(dir) => KubeconfigMaterializer::new(dir),
        None => KubeconfigMaterializer::in_temp_dir(),
    };
    let handler_config = HandlerConfig {
        app_host: config.server.host.clone(),
        app_port,
        auth_proxy: AuthProxyConfig {
            binary: config.auth_proxy.binary.clone(),
            ready_timeout: config.auth_proxy.ready_timeout(),
            ..Default::default()
        },
        materializer,
    };

    let registry = ClusterRegistry::new(
        handler_config,
        Arc::new(TokioLauncher),
        Arc::new(KubeVersionProbe),
        Arc::new(BroadcastSink::new(CATALOG_CAPACITY)),
        Arc::new(StaticPreferences::new(config.preferences())),
    );
    let events = registry.spawn_event_listener();

    let router = Arc::new(Router::new(
        registry.clone(),
        Arc::new(AppApi::new(registry.clone(), &config.server.app_api_prefix)),
        RouterConfig {
            api_prefix: config.server.api_prefix.clone(),
            app_api_prefix: config.server.app_api_prefix.clone(),
            ..Default::default()
        },
    ));

    let mut roots = config.sync_roots();
    roots.extend(args.kubeconfig);
    let sync = SyncEngine::new(
        registry.clone(),
        SyncConfig {
            roots,
            max_depth: config.sync.max_depth,
            ignore: config.sync.ignore.clone(),
        },
    )
    .context("invalid sync settings")?;

    let shutdown = CancellationToken::new();
    let sync_task = sync.start(shutdown.clone());
    let server = tokio::spawn(serve(listener, router, shutdown.clone()));

    info!(
        port = app_port,
        host = %config.server.host,
        "Kubedesk listening on http://{}:{}/",
        config.server.host,
        app_port
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("Shutting down");

    shutdown.cancel();
    let _ = sync_task.await;
    let _ = server.await;
    registry.disconnect_all();
    events.abort();

    Ok(())
}
