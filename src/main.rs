use mandelgate::auth::TokenAuthority;
use mandelgate::config::{Config, LogConfig, LogFormat};
use mandelgate::docker::DockerRuntime;
use mandelgate::lifecycle::{BackendHandle, ContainerLifecycle};
use mandelgate::pool::ConnectionPool;
use mandelgate::proxy::{ProxyGateway, ProxyRoute};
use mandelgate::server::{GatewayServer, Pipeline};
use mandelgate::{PKG_NAME, VERSION};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Optional TOML config path; environment overrides apply either way
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let loaded = Config::load(config_path.as_deref());

    let log_config = loaded.as_ref().map(|c| c.log.clone()).unwrap_or_default();
    init_logging(&log_config);

    let config = loaded.map_err(|e| {
        error!(error = %e, "Failed to load configuration");
        e
    })?;

    info!(
        name = PKG_NAME,
        version = VERSION,
        listen = %config.server.listen,
        image = %config.backend.image,
        "Starting gateway"
    );

    if config.uses_dev_secret() {
        warn!("JWT_SECRET is not set; tokens are signed with the built-in development secret");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match wait_for_signal().await {
            Ok(()) => {
                let _ = shutdown_tx.send(true);
            }
            Err(e) => error!(error = %e, "Failed to listen for shutdown signals"),
        }
    });

    let docker = DockerRuntime::connect(config.backend.docker_host.as_deref())
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to connect to Docker");
            e
        })?;

    let pool = Arc::new(ConnectionPool::new(config.pool_config()));
    let mut lifecycle =
        ContainerLifecycle::new(docker, config.backend.lifecycle_config(), Arc::clone(&pool));

    // Nothing is served until the backend has started and answered a probe
    let handle = match lifecycle.start(&shutdown_rx).await {
        Ok(handle) => handle,
        Err(e) => {
            error!(error = %e, "Failed to start backend container");
            return Err(e.into());
        }
    };

    if let Err(e) = lifecycle
        .wait_ready(&handle, config.backend.ready_timeout(), &shutdown_rx)
        .await
    {
        error!(error = %e, container_id = handle.id(), "Backend did not become ready");
        teardown(&mut lifecycle, handle, &config).await;
        return Err(e.into());
    }

    let server = match build_server(&config, &handle, Arc::clone(&pool)).await {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "Failed to start listener");
            teardown(&mut lifecycle, handle, &config).await;
            return Err(e);
        }
    };

    let result = server.run(shutdown_rx).await;
    if let Err(e) = &result {
        error!(error = %e, "Gateway server error");
    }

    teardown(&mut lifecycle, handle, &config).await;

    let stats = pool.stats();
    info!(
        backend_requests = stats.get_total_requests(),
        readiness_probes = stats.get_probes(),
        "Shutdown complete"
    );
    result
}

fn init_logging(log: &LogConfig) {
    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log.level.as_directive()));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match log.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

async fn build_server(
    config: &Config,
    handle: &BackendHandle,
    pool: Arc<ConnectionPool>,
) -> anyhow::Result<GatewayServer> {
    let route = ProxyRoute::new(handle.origin(), config.external_origin()?);
    info!(
        backend = %route.backend(),
        external = %route.external(),
        "Proxy route configured"
    );

    let proxy = ProxyGateway::new(route, pool)
        .with_redirect_policy(config.proxy.redirect_policy())
        .with_request_timeout(config.proxy.request_timeout());
    let authority = TokenAuthority::new(&config.auth.secret);

    let server = GatewayServer::bind(config.bind_addr()?, Pipeline::new(authority, proxy))
        .await?
        .with_drain_timeout(config.drain_timeout())
        .with_header_read_timeout(config.header_read_timeout());

    Ok(server)
}

/// Stop and remove the backend; failures are logged, never fatal
async fn teardown(
    lifecycle: &mut ContainerLifecycle<DockerRuntime>,
    handle: BackendHandle,
    config: &Config,
) {
    info!(container_id = handle.id(), "Stopping backend container");
    if let Err(e) = lifecycle.stop(handle, config.backend.stop_deadline()).await {
        error!(error = %e, "Backend teardown failed");
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Received SIGINT (Ctrl+C), shutting down...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down...");
        }
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down...");
    Ok(())
}
