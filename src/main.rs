use clap::Parser;
use kubecatalog::k8s::cache::config::{DEFAULT_DOMAIN_SUFFIX, DEFAULT_RESYNC_SECONDS, RETRY_DELAY_SECONDS};
use kubecatalog::k8s::cache::ControllerOptions;
use kubecatalog::k8s::controller::Controller;
use kubecatalog::k8s::{client, USER_AGENT};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Namespace to watch (all namespaces when empty)
    #[arg(short, long, env = "KUBECATALOG_NAMESPACE", default_value = "")]
    namespace: String,

    /// Seconds between full relists of every mirror (0 disables)
    #[arg(long, env = "KUBECATALOG_RESYNC_SECONDS", default_value_t = DEFAULT_RESYNC_SECONDS)]
    resync_period_secs: u64,

    /// Cluster domain used in hostnames and workload identities
    #[arg(long, env = "KUBECATALOG_DOMAIN_SUFFIX", default_value = DEFAULT_DOMAIN_SUFFIX)]
    domain_suffix: String,

    /// Seconds before a failed event is retried
    #[arg(long, env = "KUBECATALOG_RETRY_SECONDS", default_value_t = RETRY_DELAY_SECONDS)]
    retry_delay_secs: u64,
}

impl From<Args> for ControllerOptions {
    fn from(args: Args) -> Self {
        Self {
            namespace: args.namespace,
            resync_period: Duration::from_secs(args.resync_period_secs),
            domain_suffix: args.domain_suffix,
            retry_delay: Duration::from_secs(args.retry_delay_secs),
        }
    }
}

fn init_tracing() {
    let env = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let options = ControllerOptions::from(Args::parse());

    // kube needs a process-wide rustls provider
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let client = client::new(Some(USER_AGENT)).await?;
    let controller = Arc::new(Controller::new(&client, &options)?);

    controller.on_service_change(|service, event| {
        info!("🔔 Service {} {}: ports {:?}", service.hostname, event, service.ports.names());
    })?;
    controller.on_instance_change(|set, event| {
        info!(
            "🔔 Instances of {} {}: {} endpoint(s)",
            set.service.hostname,
            event,
            set.instances.len()
        );
    })?;

    let cancel = CancellationToken::new();
    let handle = tokio::spawn({
        let controller = controller.clone();
        let cancel = cancel.clone();
        async move { controller.run(cancel).await }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    cancel.cancel();

    if let Err(e) = handle.await {
        error!("Controller task failed: {}", e);
    }
    Ok(())
}
