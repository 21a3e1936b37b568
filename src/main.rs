use anyhow::Result;
use clap::Parser;
use ldap_server::{run_metrics_server, Config, Metrics, Server, ServerContext};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "ldap-server")]
#[command(about = "LDAP v3 server backed by an in-memory directory")]
struct Args {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Listen URL (overrides config; e.g. ldap://:1389)
    #[arg(short = 'l', long, value_name = "URL")]
    listen: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("ldap_server={},info", log_level))
        .init();

    info!("Starting LDAP server");

    let mut config = match &args.config {
        Some(path) => {
            info!("Configuration source: file {:?}", path);
            Config::from_file(path)?
        }
        None => {
            info!("No --config given, using defaults");
            Config::default()
        }
    };
    if let Some(listen) = args.listen {
        config.listen.url = listen;
        config.validate()?;
    }

    info!("Configuration loaded:");
    info!("  Listen URL: {}", config.listen.url);
    info!("  Naming contexts: {:?}", config.naming_contexts);
    info!(
        "  Limits: size {:?}, time {}s, message {} bytes",
        config.limits.size_limit, config.limits.time_limit, config.limits.max_message_size
    );

    let metrics = Arc::new(Metrics::new());
    let ready = Arc::new(AtomicBool::new(false));

    if let Some(addr) = config.metrics_listen.clone() {
        let metrics_for_http = Arc::clone(&metrics);
        let ready_for_http = Arc::clone(&ready);
        let ready_fn = Arc::new(move || ready_for_http.load(Ordering::Relaxed));
        tokio::spawn(async move {
            if let Err(e) = run_metrics_server(&addr, metrics_for_http, ready_fn).await {
                error!("Metrics server error: {}", e);
            }
        });
    }

    let ctx = ServerContext::from_config(&config, metrics).await?;
    let server = Server::new(config.listen.url.clone(), Arc::new(ctx));
    let listener = server.bind().await?;
    ready.store(true, Ordering::Relaxed);
    server.serve(listener).await
}
