//! Berth CLI - Main entry point

mod app;
mod cli;
mod maintenance;
mod project;
mod serve;
mod session;

use app::App;
use berth_core::{run_relay, Relay};
use berth_foundation::BerthConfig;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::io::BufReader;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Berth - isolated containers and worktrees for coding agents
#[derive(Parser, Debug)]
#[command(name = "berth")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the tool bridge and manage containers until Ctrl-C
    Serve,
    /// Check the Docker socket, agent image and network
    Health {
        /// Image to check instead of the configured default
        #[arg(long)]
        image: Option<String>,
    },
    /// Run one agent turn for a session
    Run {
        session: String,
        prompt: String,
        /// Override the resolved image for this turn
        #[arg(long)]
        image: Option<String>,
        /// User id forwarded to the tool bridge
        #[arg(long)]
        user: Option<String>,
        /// Keep the container running after the turn
        #[arg(long)]
        keep: bool,
    },
    /// Stop and remove a session's container
    Despawn { session: String },
    /// Remove managed containers no process tracks
    Reconcile,
    /// Remove worktrees of finished or deleted sessions
    Sweep,
    /// stdio ↔ bridge relay (runs inside agent containers)
    Relay,
    /// Manage projects
    #[command(subcommand)]
    Project(ProjectCommand),
    /// Manage agents
    #[command(subcommand)]
    Agent(AgentCommand),
    /// Manage sessions
    #[command(subcommand)]
    Session(SessionCommand),
}

#[derive(Subcommand, Debug)]
enum ProjectCommand {
    /// Register a project directory
    Add {
        name: String,
        root: PathBuf,
        #[arg(long)]
        id: Option<String>,
        /// Project-level default image
        #[arg(long)]
        image: Option<String>,
    },
    /// List registered projects
    List,
}

#[derive(Subcommand, Debug)]
enum AgentCommand {
    /// Register an agent
    Add {
        name: String,
        #[arg(long)]
        id: Option<String>,
        /// Agent-level image preference
        #[arg(long)]
        image: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum SessionCommand {
    /// Create a session against a project
    Create {
        project: String,
        /// explore | write
        #[arg(long, default_value = "write")]
        mode: String,
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        agent: Option<String>,
        #[arg(long)]
        image: Option<String>,
    },
    /// Print a session record as JSON
    Show { session: String },
    /// Finish a session and release its container and worktree
    Complete {
        session: String,
        /// done | cancelled
        #[arg(long, default_value = "done")]
        status: String,
    },
    /// Release everything a session holds and delete it
    Delete { session: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Initialize logging (stderr; stdout carries command output and relay traffic)
    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    match dispatch(args.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            report(&e);
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(command: Command) -> anyhow::Result<()> {
    match command {
        Command::Serve => serve::run(App::open(config()?)?).await,
        Command::Health { image } => maintenance::health(&App::open(config()?)?, image).await,
        Command::Run {
            session,
            prompt,
            image,
            user,
            keep,
        } => {
            let opts = cli::RunOptions {
                session_id: session,
                prompt,
                image,
                user_id: user,
                keep,
            };
            cli::run_once(App::open(config()?)?, opts).await
        }
        Command::Despawn { session } => maintenance::despawn(&App::open(config()?)?, &session).await,
        Command::Reconcile => maintenance::reconcile(&App::open(config()?)?).await,
        Command::Sweep => maintenance::sweep(&App::open(config()?)?).await,
        Command::Relay => {
            let relay = Relay::from_env()?;
            run_relay(&relay, BufReader::new(tokio::io::stdin()), tokio::io::stdout()).await?;
            Ok(())
        }
        Command::Project(cmd) => {
            let store = App::open_store(&config()?)?;
            match cmd {
                ProjectCommand::Add {
                    name,
                    root,
                    id,
                    image,
                } => project::add_project(store.as_ref(), id, name, root, image),
                ProjectCommand::List => project::list_projects(store.as_ref()),
            }
        }
        Command::Agent(AgentCommand::Add { name, id, image }) => {
            let store = App::open_store(&config()?)?;
            project::add_agent(store.as_ref(), id, name, image)
        }
        Command::Session(cmd) => match cmd {
            SessionCommand::Create {
                project,
                mode,
                id,
                agent,
                image,
            } => {
                let store = App::open_store(&config()?)?;
                session::create(
                    store.as_ref(),
                    session::CreateOptions {
                        project_id: project,
                        mode,
                        id,
                        agent_id: agent,
                        image,
                    },
                )
            }
            SessionCommand::Show { session } => {
                let store = App::open_store(&config()?)?;
                session::show(store.as_ref(), &session)
            }
            SessionCommand::Complete { session, status } => {
                session::complete(&App::open(config()?)?, &session, &status).await
            }
            SessionCommand::Delete { session } => {
                session::delete(&App::open(config()?)?, &session).await
            }
        },
    }
}

/// Loaded per command; `relay` runs inside containers without it
fn config() -> anyhow::Result<BerthConfig> {
    Ok(BerthConfig::from_env()?)
}

/// What failed, then how to fix it
fn report(err: &anyhow::Error) {
    eprintln!("Error: {:#}", err);
    if let Some(hint) = err
        .downcast_ref::<berth_foundation::Error>()
        .and_then(berth_foundation::Error::remediation)
    {
        eprintln!("Fix: {}", hint);
    }
}
