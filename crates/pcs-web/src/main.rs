use anyhow::{Context, Result};
use pcs_web::{
    config::{load_config, Config},
    logging::init_logging,
    router, Dispatcher, RelayState, StaticSite, Tool,
};
use std::{net::SocketAddr, path::Path, sync::Arc};
use tracing::{error, info, warn};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let config = load_config();
    let log_guard = init_logging(&config);
    if let Some(path) = log_guard.as_ref().and_then(|guard| guard.path.as_ref()) {
        info!(event = "log_file", path = %path.display());
    }
    if let Err(err) = run(config).await {
        error!(event = "server_error", error = %format!("{err:#}"));
        std::process::exit(1);
    }
}

/// Creates the download directory and any missing parents.
async fn ensure_download_dir(path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(path)
        .await
        .with_context(|| format!("failed to create download directory {}", path.display()))
}

async fn run(config: Config) -> Result<()> {
    let addr: SocketAddr = config
        .addr
        .parse()
        .with_context(|| format!("invalid listen address {}", config.addr))?;

    ensure_download_dir(&config.download_dir).await?;
    if !config.pcs_path.exists() {
        warn!(event = "pcs_missing", path = %config.pcs_path.display());
    }

    let dispatcher = Dispatcher::new(Tool::new(&config.pcs_path), &config.download_dir);
    let site = StaticSite::new(&config.static_dir, &config.index_file);
    let state = Arc::new(RelayState::new(
        dispatcher,
        site,
        config.write_timeout,
        config.debug,
    ));
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!(
        event = "server_start",
        http = %format!("http://{addr}"),
        ws = %format!("ws://{addr}"),
        pcs = %config.pcs_path.display(),
        download_dir = %config.download_dir.display()
    );

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!(event = "server_shutdown");
    };

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .context("server failed")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn download_dir_is_created_with_parents() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("pcs/downloads/today");
        ensure_download_dir(&nested).await.unwrap();
        assert!(nested.is_dir());

        // Already present is fine.
        ensure_download_dir(&nested).await.unwrap();
    }

    #[tokio::test]
    async fn download_dir_under_a_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();
        let err = ensure_download_dir(&blocker.join("downloads"))
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("failed to create download directory"));
    }
}
