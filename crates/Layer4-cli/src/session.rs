//! Session records (`berth session ...`)

use crate::app::App;
use berth_foundation::{require_project, IsolationStore, Session, SessionMode, SessionStatus};

pub struct CreateOptions {
    pub project_id: String,
    pub mode: String,
    pub id: Option<String>,
    pub agent_id: Option<String>,
    pub image: Option<String>,
}

pub fn create(store: &dyn IsolationStore, opts: CreateOptions) -> anyhow::Result<()> {
    let mode: SessionMode = opts.mode.parse()?;
    require_project(store, &opts.project_id)?;
    if let Some(agent_id) = &opts.agent_id {
        if store.get_agent(agent_id)?.is_none() {
            anyhow::bail!("agent not found: {}", agent_id);
        }
    }

    let id = opts.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let mut session = Session::new(&id, &opts.project_id, mode);
    if let Some(agent_id) = opts.agent_id {
        session = session.with_agent(agent_id);
    }
    if let Some(image) = opts.image {
        session = session.with_image(image);
    }
    store.insert_session(&session)?;

    println!("{}", id);
    Ok(())
}

pub fn show(store: &dyn IsolationStore, session_id: &str) -> anyhow::Result<()> {
    let session = berth_foundation::require_session(store, session_id)?;
    println!("{}", serde_json::to_string_pretty(&session)?);
    Ok(())
}

/// Move to a terminal status and release container + worktree
pub async fn complete(app: &App, session_id: &str, status: &str) -> anyhow::Result<()> {
    let status: SessionStatus = status.parse()?;
    app.runtime.complete_session(session_id, status).await?;
    println!("{} {}", session_id, status);
    Ok(())
}

pub async fn delete(app: &App, session_id: &str) -> anyhow::Result<()> {
    if !app.runtime.delete_session(session_id).await? {
        anyhow::bail!("session not found: {}", session_id);
    }
    println!("deleted {}", session_id);
    Ok(())
}
