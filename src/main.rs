use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use sable_core::events::EngineEvent;
use sable_core::ids::SessionId;
use sable_core::permissions::{
    ApprovalGate, AutoApprove, PermissionAction, PermissionRule, RuleSet,
};
use sable_core::provider::ModelClient;
use sable_core::store::ConversationStore;
use sable_engine::compaction::CompactionEngine;
use sable_engine::coordinator::{CoordinatorConfig, ToolCoordinator};
use sable_engine::registry::ToolRegistry;
use sable_engine::session::{SessionConfig, SessionRunner};
use sable_engine::tools::{BashTool, ReadTool};
use sable_llm::anthropic::{AnthropicClient, ApiKey};
use sable_store::MemoryStore;
use sable_telemetry::{init_telemetry, TelemetryConfig};

#[derive(Parser)]
#[command(name = "sable", about = "Coding agent session runner")]
struct Cli {
    /// The prompt to run.
    prompt: Vec<String>,

    /// Model name (defaults to the catalog default).
    #[arg(long)]
    model: Option<String>,

    /// Working directory for tool execution.
    #[arg(long, default_value = ".")]
    dir: PathBuf,

    /// Maximum model turns for this prompt.
    #[arg(long, default_value_t = 50)]
    max_turns: u32,

    /// Approve every permission prompt without asking.
    #[arg(long)]
    yes: bool,

    /// Emit JSON logs.
    #[arg(long)]
    json_logs: bool,
}

/// Interactive gate: asks on stdin when a rule resolves to `ask`.
struct StdinApproval;

#[async_trait::async_trait]
impl ApprovalGate for StdinApproval {
    async fn request(&self, _session_id: &SessionId, permission: &str, pattern: &str) -> bool {
        let prompt = format!("allow {permission} ({pattern})? [y/N] ");
        tokio::task::spawn_blocking(move || {
            print!("{prompt}");
            std::io::stdout().flush().ok();
            let mut answer = String::new();
            if std::io::stdin().read_line(&mut answer).is_err() {
                return false;
            }
            matches!(answer.trim(), "y" | "Y" | "yes")
        })
        .await
        .unwrap_or(false)
    }
}

fn load_rule_sets() -> Vec<RuleSet> {
    let path = std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".sable")
        .join("permissions.json");

    if let Ok(raw) = std::fs::read_to_string(&path) {
        match serde_json::from_str::<Vec<RuleSet>>(&raw) {
            Ok(sets) => return sets,
            Err(e) => eprintln!("sable: ignoring malformed {}: {e}", path.display()),
        }
    }

    // Defaults: reads are fine, everything else asks.
    vec![RuleSet::new(vec![
        PermissionRule::new("*", "*", PermissionAction::Ask),
        PermissionRule::new("read", "*", PermissionAction::Allow),
    ])]
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let _telemetry = init_telemetry(TelemetryConfig {
        json: cli.json_logs,
        ..Default::default()
    });

    let api_key = match std::env::var("ANTHROPIC_API_KEY") {
        Ok(key) => ApiKey::new(key),
        Err(_) => {
            eprintln!("sable: ANTHROPIC_API_KEY is not set");
            std::process::exit(1);
        }
    };

    let prompt = cli.prompt.join(" ");
    if prompt.trim().is_empty() {
        eprintln!("sable: no prompt given");
        std::process::exit(1);
    }

    let client: Arc<dyn ModelClient> =
        match AnthropicClient::new(api_key, cli.model.as_deref()) {
            Ok(client) => Arc::new(client),
            Err(e) => {
                eprintln!("sable: failed to build client: {e}");
                std::process::exit(1);
            }
        };

    let store = Arc::new(MemoryStore::new());
    let session_id = store.create_session();
    tracing::info!(session_id = %session_id, model = client.model(), "session created");

    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(BashTool::new()));
    registry.register(Arc::new(ReadTool));
    let registry = Arc::new(registry);

    let rule_sets = Arc::new(load_rule_sets());
    let approvals: Arc<dyn ApprovalGate> = if cli.yes {
        Arc::new(AutoApprove)
    } else {
        Arc::new(StdinApproval)
    };

    let (event_tx, event_rx) = broadcast::channel::<EngineEvent>(1024);
    let printer = tokio::spawn(print_events(event_rx));

    let coordinator = Arc::new(ToolCoordinator::new(
        session_id.clone(),
        Arc::clone(&registry),
        rule_sets,
        approvals,
        event_tx.clone(),
        CoordinatorConfig {
            working_directory: cli.dir.clone(),
            ..Default::default()
        },
    ));
    let compaction = CompactionEngine::new(
        Arc::clone(&store) as Arc<dyn ConversationStore>,
        Arc::clone(&client),
        event_tx.clone(),
    );
    let runner = SessionRunner::new(
        session_id,
        client,
        Arc::clone(&store) as Arc<dyn ConversationStore>,
        registry,
        Arc::clone(&coordinator),
        compaction,
        event_tx.clone(),
        SessionConfig {
            max_turns: cli.max_turns,
            ..Default::default()
        },
    );

    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    let ctrl_c_coordinator = Arc::clone(&coordinator);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nsable: interrupted");
            ctrl_c_coordinator.cleanup();
            ctrl_c_cancel.cancel();
        }
    });

    let result = runner.run(&prompt, &cancel).await;
    match result {
        Ok(()) => {
            // The printer exits on the session-complete event.
            printer.await.ok();
        }
        Err(e) => {
            printer.abort();
            eprintln!("sable: {e}");
            std::process::exit(1);
        }
    }
}

async fn print_events(mut rx: broadcast::Receiver<EngineEvent>) {
    while let Ok(event) = rx.recv().await {
        match event {
            EngineEvent::TextDelta { delta, .. } => {
                print!("{delta}");
                std::io::stdout().flush().ok();
            }
            EngineEvent::ToolStarted { tool_name, .. } => {
                eprintln!("\n[tool] {tool_name} ...");
            }
            EngineEvent::ToolCompleted { tool_name, duration_ms, .. } => {
                eprintln!("[tool] {tool_name} done in {duration_ms}ms");
            }
            EngineEvent::ToolError { tool_name, reason, .. } => {
                eprintln!("[tool] {tool_name} failed: {reason}");
            }
            EngineEvent::DoomLoop { tool_name, .. } => {
                eprintln!("[warn] repeated identical input to {tool_name}");
            }
            EngineEvent::CompactionComplete { tokens_before, tokens_after, .. } => {
                eprintln!("[compact] {tokens_before} -> {tokens_after} tokens");
            }
            EngineEvent::SessionComplete { .. } => {
                println!();
                break;
            }
            _ => {}
        }
    }
}
