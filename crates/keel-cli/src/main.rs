mod config;
mod plan;

use clap::{Parser, Subcommand};
use config::KeelConfig;
use keel_builtins::{register_default_builtins, ContainerConfig};
use keel_core::{Role, ToolCall, ToolKind};
use keel_orchestrator::{Orchestrator, TaskStatus};
use keel_security::{AuditLog, Decision};
use keel_tools::ToolExecutor;
use plan::Plan;
use serde_json::json;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "keel", about = "Keel: policy-gated task orchestration")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "keel.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a plan file to completion and print the final task states
    Run {
        plan: PathBuf,
        /// Override the configured pool size
        #[arg(short, long)]
        workers: Option<usize>,
    },
    /// Inspect role policies
    Policy {
        #[command(subcommand)]
        action: PolicyAction,
    },
}

#[derive(Subcommand)]
enum PolicyAction {
    /// Print the effective policy of one role, or of all roles
    Show { role: Option<Role> },
    /// Evaluate one tool call against a role's policy without running it
    Check {
        #[arg(long)]
        role: Role,
        #[arg(long)]
        tool: ToolKind,
        #[arg(long)]
        operation: String,
        /// Call arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = KeelConfig::load(&cli.config)?;

    match cli.command {
        Commands::Run { plan, workers } => run_plan(config, plan, workers).await,
        Commands::Policy { action } => policy(&config, action),
    }
}

async fn run_plan(
    config: KeelConfig,
    plan_path: PathBuf,
    workers: Option<usize>,
) -> anyhow::Result<ExitCode> {
    let plan = Plan::load(&plan_path)?;
    let engine = Arc::new(config.policy_engine()?);
    let audit = Arc::new(AuditLog::new(config.data_dir.join("audit")));

    let mut executor = ToolExecutor::new(engine).with_audit(audit.clone());
    register_tools(&mut executor, config.container.clone()).await?;
    info!(tools = executor.tool_count(), "Built-in tools registered");

    let backend = plan.improvement_backend(config.improvement.clone());
    let (backend, store) = match backend {
        Some((backend, store)) => (Some(backend), Some(store)),
        None => (None, None),
    };
    let orchestrator = Orchestrator::start(
        workers.unwrap_or(config.pool.size),
        config.scheduler_config(),
        Arc::new(executor),
        backend,
    )?;

    info!(plan = %plan_path.display(), tasks = plan.tasks.len(), improvements = plan.improvements.len(), "Running plan");
    if !plan.tasks.is_empty() {
        orchestrator.scheduler().submit_batch(plan.tasks).await?;
    }
    let mut record_ids = Vec::new();
    if let Some(controller) = orchestrator.improvement() {
        for proposal in plan.improvements {
            record_ids.push(controller.propose(proposal).await?);
        }
    }

    let tasks = orchestrator.scheduler().wait_all().await?;
    let improvements: Vec<_> = orchestrator
        .improvement()
        .map(|controller| {
            record_ids
                .iter()
                .filter_map(|id| controller.record(*id))
                .collect()
        })
        .unwrap_or_default();
    let modules: serde_json::Map<String, serde_json::Value> = store
        .map(|store| {
            plan.modules
                .keys()
                .map(|module| (module.clone(), json!(store.current(module))))
                .collect()
        })
        .unwrap_or_default();

    let report = json!({
        "tasks": tasks,
        "improvements": improvements,
        "modules": modules,
        "pool": orchestrator.monitor().to_json().await,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    orchestrator.shutdown().await;
    audit.flush().await;

    let all_completed = tasks.iter().all(|t| t.status == TaskStatus::Completed);
    Ok(if all_completed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

#[cfg(feature = "docker")]
async fn register_tools(executor: &mut ToolExecutor, container: ContainerConfig) -> anyhow::Result<()> {
    if container.runtime == "bollard" {
        let runtime = Arc::new(keel_builtins::BollardRuntime::connect().await?);
        keel_builtins::register_builtins(executor, runtime, container)?;
    } else {
        register_default_builtins(executor, container)?;
    }
    Ok(())
}

#[cfg(not(feature = "docker"))]
async fn register_tools(executor: &mut ToolExecutor, container: ContainerConfig) -> anyhow::Result<()> {
    if container.runtime == "bollard" {
        anyhow::bail!("container runtime 'bollard' needs the `docker` feature");
    }
    register_default_builtins(executor, container)?;
    Ok(())
}

fn policy(config: &KeelConfig, action: PolicyAction) -> anyhow::Result<ExitCode> {
    let engine = config.policy_engine()?;
    match action {
        PolicyAction::Show { role } => {
            let roles = role.map(|r| vec![r]).unwrap_or_else(|| Role::ALL.to_vec());
            let shown: Vec<_> = roles
                .into_iter()
                .map(|role| {
                    json!({
                        "role": role,
                        "policy": engine.policy(role),
                        "denied_patterns": engine.denied_patterns(role),
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&shown)?);
            Ok(ExitCode::SUCCESS)
        }
        PolicyAction::Check {
            role,
            tool,
            operation,
            args,
        } => {
            let arguments: serde_json::Value = serde_json::from_str(&args)
                .map_err(|e| anyhow::anyhow!("--args is not valid JSON: {e}"))?;
            let call = ToolCall::new(role, tool, operation, arguments);
            let verdict = match engine.check(role, &call) {
                Decision::Allow => json!({ "allowed": true }),
                Decision::Deny(reason) => json!({
                    "allowed": false,
                    "code": reason.code,
                    "message": reason.message,
                }),
            };
            println!("{}", serde_json::to_string_pretty(&verdict)?);
            Ok(if verdict["allowed"] == true {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
    }
}
