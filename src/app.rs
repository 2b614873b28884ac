//! Application lifecycle: initialization, task orchestration, and shutdown.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tokio::sync::watch;
use tracing::info;

use crate::config::Config;
use crate::error::AgentError;
use crate::keystore::KeyStore;
use crate::provisioning::executor::SystemExecutor;
use crate::provisioning::os_adaptor;
use crate::provisioning::ProvisioningEngine;
use crate::rpc::RpcEngine;
use crate::tunnel::TunnelClient;

/// Run the full application lifecycle after config has been parsed and
/// validated: load keys, wire the provisioning engine into a fresh tunnel
/// client's method registry, and block until shutdown.
pub async fn run(config: Config) -> Result<(), AgentError> {
    init_tracing(&config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        client_id = %config.client_id(),
        tunnel_host = %config.tunnel_host,
        dry_run = config.dry_run,
        "kd-agent starting"
    );

    let keystore = Arc::new(KeyStore::load(Path::new(&config.key_path))?);

    let engine = ProvisioningEngine::new(
        config.client_id(),
        config.dry_run,
        Arc::new(SystemExecutor),
        os_adaptor::detect(),
    );

    let register_methods: crate::tunnel::MethodRegistrar = Arc::new(move |rpc: &Arc<RpcEngine>| {
        let engine = Arc::clone(&engine);
        rpc.add_method("call", move |params, cancel| {
            let engine = Arc::clone(&engine);
            async move { engine.handle_call(params, cancel).await }
        });
    });

    let tunnel = TunnelClient::new(
        config.tunnel_host.clone(),
        config.client_id(),
        config.tunnel_id.clone(),
        Duration::from_secs(config.heartbeat_interval_seconds),
        keystore,
        register_methods,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let run_handle = {
        let tunnel = Arc::clone(&tunnel);
        tokio::spawn(async move { tunnel.run(shutdown_rx).await })
    };

    wait_for_shutdown().await;
    info!("shutdown signal received, closing tunnel");
    let _ = shutdown_tx.send(true);

    match run_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(AgentError::Tunnel(e)),
        Err(e) => return Err(AgentError::Other(anyhow::anyhow!("tunnel task panicked: {e}"))),
    }

    info!("kd-agent stopped");
    Ok(())
}

fn init_tracing(config: &Config) {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.log_json {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init();
    } else {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init();
    }
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
