use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use nodeway_core::{logging, Config};
use nodeway_loadbalancer::{
    set_http_proxy, tcp_health_check, BalancerOptions, HealthProbeConfig, LocalBalancerFactory,
};
use nodeway_proxy::SupervisorProxy;

#[derive(Parser, Debug)]
#[command(name = "nodeway")]
#[command(about = "Node-local supervisor and API server connection steering", long_about = None)]
struct Args {
    /// Path to the YAML configuration file (skipped if missing)
    #[arg(long, env = "NODEWAY_CONFIG_PATH", default_value = "config.yaml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load and validate configuration
    let config = Config::load(Some(args.config.as_str()))?;
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!(
        server_url = %config.agent.server_url,
        lb_enabled = config.lb_enabled(),
        "Nodeway agent starting"
    );

    // 3. Process-wide HTTP proxy, before any load-balancer dials out
    if config.lb_enabled() {
        set_http_proxy(&config.agent.server_url)?;
    }

    // 4. Supervisor proxy
    let cancel = CancellationToken::new();
    let factory = Arc::new(LocalBalancerFactory::new(BalancerOptions::from(
        &config.load_balancer,
    )));
    let proxy = SupervisorProxy::new(
        cancel.clone(),
        factory,
        config.lb_enabled(),
        &config.agent.data_dir,
        &config.agent.server_url,
        config.agent.lb_server_port,
        config.agent.ipv6,
    )
    .await?;

    if let Some(address) = &config.agent.supervisor_default {
        proxy.set_supervisor_default(address);
    }
    if let Some(port) = config.agent.api_server_port {
        proxy.set_api_server_port(port, config.agent.ipv6).await?;
    }

    // 5. Seed membership and probe it
    if !config.agent.servers.is_empty() {
        proxy.update(&config.agent.servers);

        let probe = HealthProbeConfig::from(&config.load_balancer);
        for address in proxy.supervisor_addresses() {
            let check = tcp_health_check(address.clone(), probe.clone(), cancel.child_token());
            proxy.set_health_check(&address, check);
        }
    }

    info!(
        supervisor_url = %proxy.supervisor_url(),
        api_server_url = %proxy.api_server_url(),
        supervisor_addresses = ?proxy.supervisor_addresses(),
        supervisor_lb = proxy.is_supervisor_lb_enabled(),
        api_server_lb = proxy.is_api_server_lb_enabled(),
        "Nodeway agent ready"
    );

    shutdown_signal().await;
    cancel.cancel();
    info!("Nodeway agent stopped");
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}
