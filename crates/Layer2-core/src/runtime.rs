//! Agent turn runtime
//!
//! One turn: resolve image → assign working directory → ensure container
//! → exec the agent command → stream its events → touch / store token.

use crate::bridge::companion_env;
use crate::git::WorktreeManager;
use berth_foundation::{
    require_project, require_session, BerthConfig, Error, IsolationStore, Result, SessionStatus,
    CONTAINER_WORKSPACE,
};
use berth_task::{ContainerManager, ExecChannel, ExecSpec, LineBuffer, WorkspaceBinding};
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Cap on collected stderr per turn (bytes)
const STDERR_LIMIT: usize = 64 * 1024;

// ============================================================================
// Events
// ============================================================================

/// One record printed by the agent on stdout
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AgentEvent {
    Json(Value),
    /// Non-JSON line, kept as text
    Raw(String),
}

impl AgentEvent {
    pub fn parse(line: &str) -> Self {
        match serde_json::from_str::<Value>(line) {
            Ok(value) => AgentEvent::Json(value),
            Err(_) => AgentEvent::Raw(line.to_string()),
        }
    }

    /// Resumable agent-session token, if this event carries one
    pub fn session_token(&self) -> Option<&str> {
        match self {
            AgentEvent::Json(value) => value
                .get("session_id")
                .and_then(Value::as_str)
                .filter(|t| !t.is_empty()),
            AgentEvent::Raw(_) => None,
        }
    }
}

// ============================================================================
// Turn request / outcome
// ============================================================================

/// Input for one agent turn
pub struct TurnRequest {
    pub session_id: String,
    pub prompt: String,
    pub image_override: Option<String>,
    pub user_id: Option<String>,
    /// Receives each event as it is parsed
    pub events: Option<mpsc::Sender<AgentEvent>>,
    /// Fire to SIGTERM the agent process (the container stays up)
    pub cancel: Option<oneshot::Receiver<()>>,
}

impl TurnRequest {
    pub fn new(session_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            prompt: prompt.into(),
            image_override: None,
            user_id: None,
            events: None,
            cancel: None,
        }
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image_override = Some(image.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_events(mut self, events: mpsc::Sender<AgentEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_cancel(mut self, cancel: oneshot::Receiver<()>) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Result of one agent turn
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnOutcome {
    pub image: String,
    pub working_dir: PathBuf,
    pub exit_code: Option<i64>,
    pub cancelled: bool,
    pub events: Vec<AgentEvent>,
    pub stderr: String,
    pub agent_session_token: Option<String>,
}

impl TurnOutcome {
    pub fn succeeded(&self) -> bool {
        !self.cancelled && self.exit_code == Some(0)
    }
}

// ============================================================================
// AgentRuntime
// ============================================================================

/// Drives agent turns for sessions
#[derive(Clone)]
pub struct AgentRuntime {
    store: Arc<dyn IsolationStore>,
    containers: ContainerManager,
    exec: ExecChannel,
    worktrees: WorktreeManager,
    config: Arc<BerthConfig>,
}

impl AgentRuntime {
    pub fn new(
        store: Arc<dyn IsolationStore>,
        containers: ContainerManager,
        worktrees: WorktreeManager,
        config: BerthConfig,
    ) -> Self {
        let exec = ExecChannel::new(containers.socket());
        Self {
            store,
            containers,
            exec,
            worktrees,
            config: Arc::new(config),
        }
    }

    pub fn containers(&self) -> &ContainerManager {
        &self.containers
    }

    pub fn worktrees(&self) -> &WorktreeManager {
        &self.worktrees
    }

    pub async fn run_turn(&self, request: TurnRequest) -> Result<TurnOutcome> {
        let TurnRequest {
            session_id,
            prompt,
            image_override,
            user_id,
            events: event_tx,
            cancel,
        } = request;

        let session = require_session(self.store.as_ref(), &session_id)?;
        if session.status.is_terminal() {
            return Err(Error::InvalidInput(format!(
                "session {} is {}",
                session_id, session.status
            )));
        }
        let project = require_project(self.store.as_ref(), &session.project_id)?;
        let agent = match &session.agent_id {
            Some(agent_id) => self.store.get_agent(agent_id)?,
            None => None,
        };

        if session.status != SessionStatus::InProgress {
            self.store
                .update_session_status(&session_id, SessionStatus::InProgress)?;
        }

        let image = self.containers.images().resolve(
            &session,
            agent.as_ref(),
            Some(&project),
            image_override.as_deref(),
        );
        let working_dir = self.worktrees.assign(&session_id).await?;
        let binding = WorkspaceBinding::new(&working_dir).read_only(session.mode.is_read_only());

        let container_env = companion_env(
            &self.config.bridge.endpoint_url(),
            &session_id,
            user_id.as_deref(),
        );
        let handle = self
            .containers
            .ensure_container(&session_id, &image, &binding, &container_env)
            .await?;

        let mut exec_env = vec![format!("BERTH_PROMPT={}", prompt)];
        if let Some(token) = &session.agent_session_token {
            exec_env.push(format!("BERTH_RESUME_TOKEN={}", token));
        }
        let spec = ExecSpec {
            cmd: vec![
                "sh".into(),
                "-c".into(),
                self.config.sandbox.agent_command.clone(),
            ],
            env: exec_env,
            working_dir: Some(CONTAINER_WORKSPACE.to_string()),
        };

        info!(session_id = %session_id, container = %handle.name, image = %image, "Starting agent turn");
        let activity = self.containers.begin_activity(&session_id).await;
        let mut exec = self.exec.execute(&handle, spec).await?;

        let mut stderr_rx = exec.stderr;
        let stderr_task = tokio::spawn(async move {
            let mut collected = Vec::new();
            while let Some(chunk) = stderr_rx.recv().await {
                let room = STDERR_LIMIT.saturating_sub(collected.len());
                collected.extend_from_slice(&chunk[..chunk.len().min(room)]);
            }
            String::from_utf8_lossy(&collected).into_owned()
        });

        let mut buffer = LineBuffer::new();
        let mut events = Vec::new();
        let mut cancelled = false;

        // Resolves to true only when the caller actually fired the signal
        let mut cancel_signal = Box::pin(async move {
            match cancel {
                Some(rx) => rx.await.is_ok(),
                None => std::future::pending().await,
            }
        });
        let mut cancel_armed = true;

        loop {
            tokio::select! {
                chunk = exec.stdout.recv() => {
                    let Some(chunk) = chunk else { break };
                    for line in buffer.push(&chunk) {
                        self.record_event(AgentEvent::parse(&line), &mut events, &event_tx)
                            .await;
                    }
                }
                fired = &mut cancel_signal, if cancel_armed => {
                    cancel_armed = false;
                    if fired {
                        info!(session_id = %session_id, "Cancelling agent turn");
                        cancelled = true;
                        exec.cancel.cancel().await;
                    }
                }
            }
        }
        if let Some(rest) = buffer.finish() {
            self.record_event(AgentEvent::parse(&rest), &mut events, &event_tx)
                .await;
        }

        let completed = exec.completion.wait().await;
        drop(activity);
        // Finished or cancelled, the command still counts as activity
        self.containers.touch(&session_id).await;
        let exit_code = completed?;
        let stderr = stderr_task.await.unwrap_or_default();

        let token = events
            .iter()
            .rev()
            .find_map(AgentEvent::session_token)
            .map(str::to_string);

        let outcome = TurnOutcome {
            image,
            working_dir,
            exit_code,
            cancelled,
            events,
            stderr,
            agent_session_token: token.clone(),
        };

        if !outcome.succeeded() {
            warn!(session_id = %session_id, exit_code = ?outcome.exit_code, cancelled, "Agent turn did not succeed");
        }
        if let Some(token) = &token {
            self.store
                .set_agent_session_token(&session_id, Some(token))?;
        }

        debug!(session_id = %session_id, events = outcome.events.len(), "Agent turn finished");
        Ok(outcome)
    }

    async fn record_event(
        &self,
        event: AgentEvent,
        events: &mut Vec<AgentEvent>,
        sink: &Option<mpsc::Sender<AgentEvent>>,
    ) {
        if let Some(tx) = sink {
            let _ = tx.send(event.clone()).await;
        }
        events.push(event);
    }

    /// Mark the session finished and release its container and worktree.
    ///
    /// Every step is attempted; the first failure is returned.
    pub async fn complete_session(&self, session_id: &str, status: SessionStatus) -> Result<()> {
        if !status.is_terminal() {
            return Err(Error::InvalidInput(format!(
                "{} is not a terminal status",
                status
            )));
        }

        let session = require_session(self.store.as_ref(), session_id)?;
        let mut first_error = None;

        if let Err(e) = self.store.update_session_status(session_id, status) {
            first_error.get_or_insert(e);
        }
        if let Err(e) = self.containers.despawn(session_id).await {
            warn!(session_id = %session_id, error = %e, "Despawn failed");
            first_error.get_or_insert(e);
        }
        if let Err(e) = self.worktrees.remove_worktree(&session).await {
            warn!(session_id = %session_id, error = %e, "Worktree removal failed");
            first_error.get_or_insert(e);
        }

        info!(session_id = %session_id, %status, "Session completed");
        first_error.map_or(Ok(()), Err)
    }

    /// Release everything the session holds and delete its record
    pub async fn delete_session(&self, session_id: &str) -> Result<bool> {
        let Some(session) = self.store.get_session(session_id)? else {
            return Ok(false);
        };
        self.containers.despawn(session_id).await?;
        self.worktrees.remove_worktree(&session).await?;
        self.store.delete_session(session_id)
    }
}
