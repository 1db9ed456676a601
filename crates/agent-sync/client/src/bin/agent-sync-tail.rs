//! Follow a running research backend and log the transcript as it syncs.

use std::path::PathBuf;

use agent_sync_client::{InitOutcome, SyncConfig, SyncOrchestrator, TransportKind};
use agent_sync_core::{Decision, ViewState};
use anyhow::{Context, Result, anyhow};
use clap::Parser;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(about = "Tail the research backend transcript")]
struct Args {
    /// Backend base URL. Overrides the config file and AGENT_SYNC_BASE_URL.
    #[arg(long)]
    base_url: Option<String>,

    /// Push transport: socket, event-stream or polling.
    #[arg(long)]
    transport: Option<String>,

    /// TOML config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Message to send once the initial state is loaded.
    #[arg(long)]
    message: Option<String>,

    /// Decision code to submit when the backend asks for one (1 or 2).
    #[arg(long)]
    decision: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;
    let decision = args
        .decision
        .as_deref()
        .map(|code| Decision::from_code(code).ok_or_else(|| anyhow!("unknown decision code: {code}")))
        .transpose()?;

    let orchestrator = SyncOrchestrator::new(config).context("build sync orchestrator")?;
    if orchestrator.initialize().await == InitOutcome::Offline {
        warn!(
            base_url = %orchestrator.config().base_url,
            "backend offline; retrying the push connection"
        );
        orchestrator.reconnect().await;
    }

    if let Some(message) = args.message.as_deref() {
        let limit = orchestrator.config().connect_timeout();
        if orchestrator.wait_until_connected(limit).await {
            if let Err(error) = orchestrator.send_message(message).await {
                warn!(error = %error, "initial message not sent");
            }
        } else {
            warn!(wait = ?limit, "push channel not connected; initial message not sent");
        }
    }

    let mut views = orchestrator.subscribe();
    let mut printed = log_new_entries(&views.borrow_and_update(), 0);
    loop {
        tokio::select! {
            changed = views.changed() => {
                if changed.is_err() {
                    break;
                }
                let view = views.borrow_and_update().clone();
                printed = log_new_entries(&view, printed);
                let pending = view.needs_decision && !view.is_processing_decision;
                if let Some(decision) = decision.filter(|_| pending) {
                    info!(decision = decision.label(), "submitting decision");
                    if let Err(error) = orchestrator.send_decision(decision).await {
                        warn!(error = %error, "decision not sent");
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
    }

    orchestrator.destroy().await;
    Ok(())
}

fn load_config(args: &Args) -> Result<SyncConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("read config {}", path.display()))?;
            SyncConfig::from_toml_str(&raw)?
        }
        None => SyncConfig::from_env()?,
    };
    if let Some(base_url) = &args.base_url {
        config.base_url.clone_from(base_url);
    }
    if let Some(raw) = &args.transport {
        config.transport =
            TransportKind::parse(raw).ok_or_else(|| anyhow!("unknown transport: {raw}"))?;
    }
    Ok(config.validated()?)
}

fn log_new_entries(view: &ViewState, printed: usize) -> usize {
    // A shorter transcript means the view was cleared or deduplicated.
    let start = if view.transcript.len() < printed { 0 } else { printed };
    for entry in &view.transcript[start..] {
        info!(
            role = entry.role.as_str(),
            sender = %entry.sender,
            at = %entry.timestamp,
            "{}",
            entry.content
        );
    }
    info!(
        connection = view.connection_state.as_str(),
        processing = view.is_processing,
        needs_decision = view.needs_decision,
        agent = view.current_agent.as_deref().unwrap_or("-"),
        "view updated"
    );
    view.transcript.len()
}
