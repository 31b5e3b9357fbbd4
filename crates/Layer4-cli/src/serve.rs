//! Long-running host process: bridge endpoint + container lifecycle

use crate::app::App;
use berth_core::{serve, BridgeService, SessionToolHandler};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Bind the bridge endpoint for `app`'s store
pub async fn bind_bridge(app: &App) -> std::io::Result<(TcpListener, Arc<BridgeService>)> {
    let bridge = &app.config.bridge;
    let listener = TcpListener::bind((bridge.bind.as_str(), bridge.port)).await?;
    let handler = Arc::new(SessionToolHandler::new(Arc::clone(&app.store)));
    let service = Arc::new(BridgeService::new(Arc::clone(&app.store), handler));
    Ok((listener, service))
}

/// Startup cleanup, then serve until Ctrl-C, then despawn everything
pub async fn run(app: App) -> anyhow::Result<()> {
    match app.containers.reconcile_orphans().await {
        Ok(0) => {}
        Ok(n) => info!(removed = n, "Removed orphaned containers"),
        Err(e) => warn!(error = %e, "Orphan reconciliation failed"),
    }
    match app.worktrees.sweep().await {
        Ok(report) if report.is_empty() => {}
        Ok(report) => info!(
            removed = report.removed.len(),
            cleared = report.cleared_stale.len(),
            orphans = report.orphan_dirs.len(),
            "Swept worktrees"
        ),
        Err(e) => warn!(error = %e, "Worktree sweep failed"),
    }

    let (listener, service) = bind_bridge(&app).await?;
    info!(endpoint = %app.config.bridge.endpoint_url(), "Containers reach the bridge here");

    serve(listener, service, shutdown_signal()).await?;

    info!("Shutting down, despawning containers");
    app.containers.despawn_all().await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Cannot listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}
