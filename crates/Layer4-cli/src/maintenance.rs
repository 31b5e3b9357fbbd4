//! Operator commands: health, despawn, reconcile, sweep

use crate::app::App;
use berth_foundation::FALLBACK_IMAGE;
use berth_task::health_check;

/// Print the health probe as JSON; fails when the sandbox cannot operate
pub async fn health(app: &App, image: Option<String>) -> anyhow::Result<()> {
    let image = image
        .or_else(|| app.config.sandbox.default_image.clone())
        .unwrap_or_else(|| FALLBACK_IMAGE.to_string());
    let status = health_check(app.socket.as_ref(), &image, &app.config.sandbox.network).await;

    println!("{}", serde_json::to_string_pretty(&status)?);
    if !status.is_healthy() {
        anyhow::bail!(
            "{}",
            status.error.as_deref().unwrap_or("sandbox is not healthy")
        );
    }
    Ok(())
}

pub async fn despawn(app: &App, session_id: &str) -> anyhow::Result<()> {
    app.containers.despawn(session_id).await?;
    println!("despawned {}", session_id);
    Ok(())
}

/// Remove managed containers left behind by a previous process
pub async fn reconcile(app: &App) -> anyhow::Result<()> {
    let removed = app.containers.reconcile_orphans().await?;
    println!("removed {} orphaned container(s)", removed);
    Ok(())
}

pub async fn sweep(app: &App) -> anyhow::Result<()> {
    let report = app.worktrees.sweep().await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
