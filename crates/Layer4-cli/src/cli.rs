//! Non-interactive agent turn (`berth run`)

use crate::app::App;
use crate::serve::bind_bridge;
use berth_core::{serve, AgentEvent, TurnRequest};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

pub struct RunOptions {
    pub session_id: String,
    pub prompt: String,
    pub image: Option<String>,
    pub user_id: Option<String>,
    /// Leave the container running after the turn
    pub keep: bool,
}

/// Run one turn, printing agent events to stdout as they arrive
pub async fn run_once(app: App, opts: RunOptions) -> anyhow::Result<()> {
    // In-process bridge unless a `berth serve` already holds the port
    let (bridge_stop, bridge_stopped) = oneshot::channel::<()>();
    let bridge = match bind_bridge(&app).await {
        Ok((listener, service)) => Some(tokio::spawn(serve(listener, service, async move {
            let _ = bridge_stopped.await;
        }))),
        Err(e) => {
            warn!(error = %e, "Bridge port busy; using the running endpoint");
            None
        }
    };

    let (cancel_tx, cancel_rx) = oneshot::channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = cancel_tx.send(());
        }
    });

    let (event_tx, mut event_rx) = mpsc::channel(100);
    let printer = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            match event {
                AgentEvent::Json(value) => println!("{}", value),
                AgentEvent::Raw(line) => println!("{}", line),
            }
        }
    });

    let mut request = TurnRequest::new(&opts.session_id, opts.prompt)
        .with_events(event_tx)
        .with_cancel(cancel_rx);
    if let Some(image) = opts.image {
        request = request.with_image(image);
    }
    if let Some(user) = opts.user_id {
        request = request.with_user(user);
    }

    let result = app.runtime.run_turn(request).await;
    let _ = printer.await;

    if !opts.keep {
        if let Err(e) = app.containers.despawn(&opts.session_id).await {
            warn!(session_id = %opts.session_id, error = %e, "Despawn after turn failed");
        }
    }
    let _ = bridge_stop.send(());
    if let Some(bridge) = bridge {
        let _ = bridge.await;
    }

    let outcome = result?;
    if !outcome.stderr.is_empty() {
        eprint!("{}", outcome.stderr);
    }
    info!(
        session_id = %opts.session_id,
        exit_code = ?outcome.exit_code,
        working_dir = %outcome.working_dir.display(),
        token = ?outcome.agent_session_token,
        "Turn finished"
    );

    if outcome.cancelled {
        anyhow::bail!("turn cancelled");
    }
    if !outcome.succeeded() {
        anyhow::bail!("agent exited with {:?}", outcome.exit_code);
    }
    Ok(())
}
