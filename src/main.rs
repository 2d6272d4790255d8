// ABOUTME: CLI entry point for port-manager
// ABOUTME: Builds one reconciler per proxy class and runs them until shutdown

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinSet;

use port_manager::config::{
    plan_reconcilers, ManagerOptions, DEFAULT_OWNER_NAME, DEFAULT_READY_FILE,
};
use port_manager::reconcile::{Reconciler, Synchronizer};
use port_manager::store::{resolve_owner, KubeStore};
use port_manager::upstream::{ClientCredentials, ControllerClient};

#[derive(Parser)]
#[command(name = "port-manager")]
#[command(
    about = "Publishes ioFog microservice ports through shared proxy Deployments and Services",
    long_about = None
)]
#[command(version)]
struct Cli {
    /// Namespace holding the Controller and the proxy objects
    #[arg(long, env = "WATCH_NAMESPACE", default_value = "default")]
    namespace: String,
    /// Full Controller API base URL (defaults to the in-cluster service)
    #[arg(long = "controller-url", env = "CONTROLLER_URL")]
    controller_url: Option<String>,
    /// Scheme of the default Controller URL
    #[arg(long = "controller-scheme", env = "CONTROLLER_SCHEME", default_value = "http")]
    controller_scheme: String,
    /// Identity provider base URL
    #[arg(long = "auth-url", env = "KC_URL")]
    auth_url: String,
    #[arg(long, env = "KC_REALM")]
    realm: String,
    #[arg(long = "client-id", env = "KC_CLIENT")]
    client_id: String,
    #[arg(long = "client-secret", env = "KC_CLIENT_SECRET", hide_env_values = true)]
    client_secret: String,
    /// Container image of the proxy
    #[arg(long = "proxy-image", env = "PROXY_IMAGE")]
    proxy_image: String,
    #[arg(long = "image-pull-secret", env = "PULL_SECRET_NAME")]
    image_pull_secret: Option<String>,
    /// Router address handed to the proxy containers
    #[arg(long = "router-address", env = "ROUTER_ADDRESS")]
    router_address: String,
    /// With --tcp-proxy-address, run separate http and tcp proxies
    #[arg(long = "http-proxy-address", env = "HTTP_PROXY_ADDRESS")]
    http_proxy_address: Option<String>,
    #[arg(long = "tcp-proxy-address", env = "TCP_PROXY_ADDRESS")]
    tcp_proxy_address: Option<String>,
    /// JSON object of annotations for the proxy Services
    #[arg(long = "proxy-service-annotations", env = "PROXY_SERVICE_ANNOTATIONS")]
    proxy_service_annotations: Option<String>,
    /// Seconds between poll cycles
    #[arg(long = "poll-interval", env = "POLL_INTERVAL", default_value_t = 10)]
    poll_interval: u64,
    /// Deployment that owns the proxy objects
    #[arg(long = "owner-name", env = "OWNER_NAME", default_value = DEFAULT_OWNER_NAME)]
    owner_name: String,
    #[arg(long = "ready-file", env = "READY_FILE", default_value = DEFAULT_READY_FILE)]
    ready_file: PathBuf,
    /// Run a single cycle per reconciler and exit
    #[arg(long)]
    once: bool,
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log: String,
}

impl Cli {
    fn manager_options(&self) -> ManagerOptions {
        ManagerOptions {
            namespace: self.namespace.clone(),
            proxy_image: self.proxy_image.clone(),
            image_pull_secret: self.image_pull_secret.clone(),
            router_address: Some(self.router_address.clone()),
            http_proxy_address: self.http_proxy_address.clone(),
            tcp_proxy_address: self.tcp_proxy_address.clone(),
            proxy_service_annotations: self.proxy_service_annotations.clone(),
            poll_interval: Some(Duration::from_secs(self.poll_interval.max(1))),
        }
    }

    fn controller_url(&self) -> Result<String> {
        let raw = match &self.controller_url {
            Some(url) if !url.trim().is_empty() => url.clone(),
            _ => ControllerClient::default_base_url(&self.controller_scheme, &self.namespace),
        };
        url::Url::parse(&raw).with_context(|| format!("Invalid Controller URL: {}", raw))?;
        Ok(raw)
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    result = tokio::signal::ctrl_c() => {
                        if let Err(e) = result {
                            tracing::error!("Failed to listen for Ctrl+C: {}", e);
                        }
                    }
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => tracing::warn!("Failed to install SIGTERM handler: {}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG takes precedence over --log
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let plans = plan_reconcilers(&cli.manager_options())?;

    let kube_client = kube::Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;
    let owner = resolve_owner(kube_client.clone(), &cli.namespace, &cli.owner_name).await?;
    let store = Arc::new(KubeStore::new(kube_client));

    let credentials = ClientCredentials {
        auth_url: cli.auth_url.clone(),
        realm: cli.realm.clone(),
        client_id: cli.client_id.clone(),
        client_secret: cli.client_secret.clone(),
    };
    let controller_url = cli.controller_url()?;
    tracing::info!("Polling Controller API at {}", controller_url);

    // Each reconciler gets its own client and token.
    let mut reconcilers = Vec::with_capacity(plans.len());
    for config in plans {
        let poller = Arc::new(ControllerClient::new(
            controller_url.clone(),
            credentials.clone(),
        )?);
        let synchronizer =
            Synchronizer::new(store.clone(), config.target.clone(), Some(owner.clone()));
        reconcilers.push(Reconciler::new(config, poller, synchronizer));
    }

    if cli.once {
        let mut failed = false;
        for reconciler in &mut reconcilers {
            let stats = reconciler
                .run_cycle()
                .await
                .with_context(|| format!("Cycle for {} failed", reconciler.name()))?;

            println!("{}:", reconciler.name());
            println!("  Records seen: {}", stats.records_seen);
            println!("  New: {}", stats.created);
            println!("  Changed: {}", stats.changed);
            println!("  Removed: {}", stats.removed);
            println!("  Unchanged: {}", stats.unchanged);
            println!("  Applied: {}", stats.applied);
            println!("  Duration: {}ms", stats.duration_ms);
            if !stats.is_success() {
                failed = true;
                println!("  Errors: {}", stats.errors.len());
                for err in &stats.errors {
                    println!("    - {}", err);
                }
            }
        }
        if failed {
            anyhow::bail!("Some changes could not be applied");
        }
        return Ok(());
    }

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let mut tasks = JoinSet::new();
    for reconciler in reconcilers {
        let shutdown = shutdown_tx.subscribe();
        tasks.spawn(reconciler.run(shutdown));
    }

    if let Err(e) = port_manager::ready::mark_ready(&cli.ready_file) {
        tracing::warn!("Failed to write ready file: {}", e);
    }

    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("Received shutdown signal");
        let _ = signal_tx.send(());
    });

    let mut result = Ok(());
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!("Reconciler stopped with error: {:?}", e);
                result = Err(e);
                let _ = shutdown_tx.send(());
            }
            Err(e) => {
                tracing::error!("Reconciler task panicked: {}", e);
                result = Err(anyhow::anyhow!("Reconciler task failed: {}", e));
                let _ = shutdown_tx.send(());
            }
        }
    }

    if let Err(e) = port_manager::ready::clear_ready(&cli.ready_file) {
        tracing::warn!("Failed to remove ready file: {}", e);
    }

    result
}
