//! `toolgate` — operator CLI driving the [`toolgate::gateway::Gateway`].
//!
//! A thin, out-of-scope-by-spec driver: it wires a [`ToolRegistry`] discovered
//! from an on-disk manifest root, a [`PolicyConfig`] loaded from YAML, and a
//! [`SqliteAuditStore`] selected via `DATABASE_URL`, then dispatches one of
//! the four operator commands (spec §6).

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use toolgate::audit::{ApprovalStatus, SqliteAuditStore};
use toolgate::config::load_policy_config;
use toolgate::gateway::{Gateway, Status};
use toolgate::observability::init_tracing;
use toolgate::registry::ToolRegistry;
use toolgate::tools::{CalendarGetAgenda, GithubPrCreate, NoopEcho, SonosPlay};

#[derive(Parser)]
#[command(name = "toolgate")]
#[command(about = "Auditable tool execution gateway for autonomous agents", long_about = None)]
struct Cli {
    /// Root directory to scan for `*/manifest.json` tool manifests.
    #[arg(long, global = true, default_value = "tools")]
    tools_root: PathBuf,

    /// Policy configuration YAML file.
    #[arg(long, global = true, default_value = "policy.yaml")]
    policy_config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a tool with a JSON payload. May return `approval_required`.
    Run {
        /// Tool name, e.g. calendar.google.get_agenda
        tool_name: String,
        /// JSON payload, e.g. '{"room":"Kitchen","volume":30}'
        json_payload: String,
    },
    /// Approve and execute a pending approval.
    Approve { approval_id: String },
    /// Deny a pending approval.
    Deny { approval_id: String },
    /// List approvals, optionally filtered by status.
    Approvals {
        #[arg(long, default_value = "pending")]
        status: String,
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
}

fn default_context() -> toolgate::gateway::Context {
    let mut ctx = toolgate::gateway::Context::new();
    ctx.insert("profile_id".to_string(), serde_json::json!("dev"));
    ctx.insert("session_id".to_string(), serde_json::json!("dev"));
    ctx.insert("channel".to_string(), serde_json::json!("cli"));
    ctx
}

async fn build_gateway(cli: &Cli) -> anyhow::Result<Gateway> {
    let mut registry = ToolRegistry::new(&cli.tools_root);
    registry.register_handler("calendar.google.get_agenda", Arc::new(CalendarGetAgenda));
    registry.register_handler("noop.echo", Arc::new(NoopEcho));
    registry.register_handler("github.pr.create", Arc::new(GithubPrCreate));
    registry.register_handler("sonos.play", Arc::new(SonosPlay));
    registry.discover()?;

    let policy_config = load_policy_config(&cli.policy_config)?;

    let database_url = std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://./toolgate_dev.db".to_string());
    let store = SqliteAuditStore::connect(&database_url).await?;

    Ok(Gateway::new(Arc::new(registry), policy_config, Arc::new(store)))
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let gateway = build_gateway(&cli).await?;
    let context = default_context();

    match cli.command {
        Commands::Run { tool_name, json_payload } => {
            let payload: serde_json::Value = serde_json::from_str(&json_payload)?;
            let res = gateway.run_tool(&tool_name, payload, &context, None, true).await?;
            print_result(&res);
            Ok(exit_code_for(res.status))
        }
        Commands::Approve { approval_id } => {
            let res = gateway.run_approved(&approval_id, &context, None, true).await?;
            print_result(&res);
            Ok(exit_code_for(res.status))
        }
        Commands::Deny { approval_id } => {
            gateway.deny_approval(&approval_id, &context).await?;
            println!("denied: {approval_id}");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Approvals { status, limit } => {
            let status = match status.as_str() {
                "pending" => Some(ApprovalStatus::Pending),
                "approved" => Some(ApprovalStatus::Approved),
                "denied" => Some(ApprovalStatus::Denied),
                other => anyhow::bail!("unknown status '{other}' (expected pending|approved|denied)"),
            };
            let approvals = gateway.list_approvals(status, limit).await?;
            if approvals.is_empty() {
                println!("No approvals with status='{}'.", status.map(|s| format!("{s:?}")).unwrap_or_default());
                return Ok(ExitCode::SUCCESS);
            }
            for approval in approvals {
                let tool_name = approval.approval_context_json.get("tool_name").and_then(|v| v.as_str()).unwrap_or("?");
                let reason = approval.approval_context_json.get("reason").and_then(|v| v.as_str()).unwrap_or("?");
                println!(
                    "- approval_id={} status={:?} requested={} tool={} reason={}",
                    approval.approval_id, approval.status, approval.ts_requested, tool_name, reason
                );
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn print_result(res: &toolgate::gateway::ToolResult) {
    println!("status: {:?}", res.status);
    if let Some(error) = &res.error {
        println!("error: {} ({})", error.message, error.code);
    }
    println!("data: {}", res.data);
    println!("meta: {}", res.meta);
    if res.status == Status::ApprovalRequired {
        if let Some(approval_id) = res.data.get("approval_id") {
            println!("\napproval_id: {approval_id}");
        }
    }
}

fn exit_code_for(status: Status) -> ExitCode {
    match status {
        Status::Ok | Status::ApprovalRequired => ExitCode::SUCCESS,
        Status::Error | Status::Timeout => ExitCode::FAILURE,
    }
}
