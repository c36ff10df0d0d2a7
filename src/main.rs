use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use conductor::config::Config;
use conductor::core::{PlanStatus, TaskId, TaskPlan, TaskStatus};
use conductor::discovery::{
    AgentDiscovery, AgentRegistry, DiscoveryOptions, FallbackStrategy, InMemoryAgentRegistry,
};
use conductor::orchestration::{
    CommandDecomposer, EventType, ExecuteOptions, PlanOptions, TaskExecutor, TaskPlanner,
};
use conductor::Result;

/// Conductor - decompose goals into task graphs and run them on agents
#[derive(Parser, Debug)]
#[command(name = "conductor")]
#[command(version, about, long_about = None)]
#[command(
    after_help = "ENVIRONMENT:\n    CONDUCTOR_DEBUG=1     Enable debug logging (alternative to --debug)"
)]
pub struct Cli {
    /// Enable debug logging (writes to ~/.conductor/conductor.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Config file (defaults to ~/.conductor/conductor.toml)
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Decompose a goal and print the resulting plan
    Plan {
        /// The goal in natural language
        goal: String,

        /// Decomposition levels below the goal
        #[arg(long)]
        depth: Option<usize>,

        /// Maximum subtasks per decomposition
        #[arg(long)]
        subtasks: Option<usize>,

        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },

    /// Plan a goal and execute it with the configured agents
    Run {
        /// The goal in natural language
        goal: String,

        /// Maximum tasks in flight
        #[arg(long)]
        parallel: Option<usize>,

        /// Budget for the whole run, in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Extra attempts per task before it is failed
        #[arg(long)]
        retries: Option<u32>,

        /// Fallback strategy used when no agent has the exact capability
        #[arg(long, default_value = "similar")]
        strategy: FallbackStrategy,

        /// Print the execution report as JSON
        #[arg(long)]
        json: bool,
    },

    /// List configured agents and their capabilities
    Agents,

    /// Show which agent a capability would be routed to
    Discover {
        capability: String,

        #[arg(long, default_value = "similar")]
        strategy: FallbackStrategy,

        /// Additional required capability (repeatable)
        #[arg(long = "require")]
        require: Vec<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    conductor::log::init_with_debug(cli.debug);
    info!(debug = conductor::log::is_debug(), "conductor starting");

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        match cli.command {
            Command::Plan {
                goal,
                depth,
                subtasks,
                json,
            } => run_plan(&config, &goal, depth, subtasks, json).await,
            Command::Run {
                goal,
                parallel,
                timeout,
                retries,
                strategy,
                json,
            } => {
                let mut options = ExecuteOptions::from(&config.executor).with_strategy(strategy);
                if let Some(parallel) = parallel {
                    options = options.with_parallel_limit(parallel);
                }
                if let Some(secs) = timeout {
                    options = options.with_timeout(Duration::from_secs(secs));
                }
                if let Some(retries) = retries {
                    options = options.with_retries(retries);
                }
                run_goal(&config, &goal, options, json).await
            }
            Command::Agents => run_agents(&config),
            Command::Discover {
                capability,
                strategy,
                require,
            } => run_discover(&config, &capability, strategy, require).await,
        }
    })
}

fn build_planner(config: &Config) -> TaskPlanner {
    let decomposer = CommandDecomposer::from_config(&config.decomposer);
    if !decomposer.is_available() {
        warn!(binary = decomposer.binary(), "decomposer command not found");
        eprintln!(
            "warning: decomposer '{}' not found; goals will not be decomposed",
            decomposer.binary()
        );
    }
    TaskPlanner::new(Arc::new(decomposer), config.planner.clone())
}

fn plan_options(config: &Config, depth: Option<usize>, subtasks: Option<usize>) -> PlanOptions {
    let mut options = PlanOptions::from(&config.planner);
    if let Some(depth) = depth {
        options.max_depth = depth;
    }
    if let Some(subtasks) = subtasks {
        options.max_subtasks = subtasks;
    }
    options
}

/// Decompose a goal and print the plan tree.
async fn run_plan(
    config: &Config,
    goal: &str,
    depth: Option<usize>,
    subtasks: Option<usize>,
    json: bool,
) -> Result<()> {
    let planner = build_planner(config);
    let plan = planner
        .create_plan(&plan_name(goal), goal, plan_options(config, depth, subtasks))
        .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
    } else {
        print_plan(&plan);
    }
    Ok(())
}

/// Plan a goal, then execute it while streaming lifecycle events.
async fn run_goal(config: &Config, goal: &str, options: ExecuteOptions, json: bool) -> Result<()> {
    let registry: Arc<dyn AgentRegistry> = Arc::new(config.build_registry());
    if registry.list_agents().is_empty() {
        eprintln!("warning: no agents configured; add [[agents]] entries to conductor.toml");
    }
    let planner = Arc::new(build_planner(config));
    let discovery = Arc::new(AgentDiscovery::new(registry, config.discovery.clone()));
    let executor = TaskExecutor::new(planner.clone(), discovery.clone(), config.executor.clone());

    let plan = planner
        .create_plan(&plan_name(goal), goal, PlanOptions::from(&config.planner))
        .await?;
    if !json {
        print_plan(&plan);
        println!();
        executor.subscribe(
            |event| {
                let name = event.payload["name"].as_str().unwrap_or("?");
                match event.event_type {
                    EventType::TaskStarted => println!(
                        "  ▶ {} ({})",
                        name,
                        event.payload["agent_id"].as_str().unwrap_or("?")
                    ),
                    EventType::TaskCompleted => println!("  ✓ {}", name),
                    EventType::TaskFailed => println!(
                        "  ✗ {}: {}",
                        name,
                        event.payload["error"].as_str().unwrap_or("unknown error")
                    ),
                }
            },
            None,
        );
    }

    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    });

    let report = executor
        .execute_plan(&plan.id, options.with_cancel(cancel))
        .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!();
    println!("  Plan:      {}", plan.id.short());
    println!("  Status:    {}", format_plan_status(report.status));
    println!(
        "  Tasks:     {} completed, {} failed",
        report.completed_count(),
        report.failed_count()
    );
    println!("  Elapsed:   {:.1}s", report.elapsed_ms as f64 / 1000.0);
    if report.timed_out {
        println!("  Timed out; tasks still running were left in progress.");
    }
    if report.cancelled {
        println!("  Cancelled.");
    }

    let wanted = discovery.requested_capabilities().await;
    if !wanted.is_empty() {
        println!();
        println!("Capabilities with no agent:");
        for request in wanted {
            println!("  {} (requested {}x)", request.name, request.request_count);
        }
    }
    Ok(())
}

fn run_agents(config: &Config) -> Result<()> {
    if config.agents.is_empty() {
        println!("No agents configured.");
        return Ok(());
    }
    for agent in &config.agents {
        println!("{}  ({})", agent.id, truncate_string(&agent.command, 50));
        for capability in &agent.capabilities {
            if capability.description.is_empty() {
                println!("    - {}", capability.name);
            } else {
                println!("    - {}: {}", capability.name, capability.description);
            }
        }
    }
    Ok(())
}

async fn run_discover(
    config: &Config,
    capability: &str,
    strategy: FallbackStrategy,
    require: Vec<String>,
) -> Result<()> {
    let registry: Arc<dyn AgentRegistry> = Arc::new(config.build_registry());
    let discovery = AgentDiscovery::new(registry, config.discovery.clone());

    let mut required = vec![capability.to_string()];
    required.extend(require);
    let options = DiscoveryOptions::new(capability)
        .require(required)
        .with_strategy(strategy);

    match discovery.discover_agent(&options).await {
        Some(result) => {
            println!("Agent:       {}", result.agent_id);
            println!("Capability:  {}", result.capability);
            println!("Score:       {:.3}", result.score);
            if let Some(fallback) = &result.fallback {
                println!(
                    "Fallback:    {:?} from '{}' (score {:.2})",
                    fallback.fallback_type, fallback.original_capability, fallback.score
                );
            }
            for alternative in &result.alternatives {
                println!("  alt: {} ({:.3})", alternative.agent_id, alternative.score);
            }
        }
        None => {
            println!("No agent available for '{}' ({})", capability, strategy);
            let similar = discovery.similar_capabilities(capability).await;
            if !similar.is_empty() {
                println!("Similar capabilities:");
                for s in similar.iter().take(5) {
                    println!("  {} ({:.2})", s.name, s.score);
                }
            }
        }
    }
    Ok(())
}

// ========== Output helpers ==========

fn print_plan(plan: &TaskPlan) {
    println!(
        "Plan {} [{}]: {}",
        plan.id.short(),
        format_plan_status(plan.status),
        plan.name
    );
    for root in &plan.root_task_ids {
        print_task(plan, root, 1);
    }
}

fn print_task(plan: &TaskPlan, id: &TaskId, indent: usize) {
    let Some(task) = plan.task(id) else {
        return;
    };
    let mut line = format!(
        "{}{} {}",
        "  ".repeat(indent),
        status_marker(task.status),
        truncate_string(&task.name, 60)
    );
    if task.priority != 0 {
        line.push_str(&format!(" (priority {})", task.priority));
    }
    if !task.required_capabilities.is_empty() {
        line.push_str(&format!(" [{}]", task.required_capabilities.join(", ")));
    }
    let deps: Vec<&str> = task
        .dependencies
        .iter()
        .filter_map(|d| plan.task(d))
        .map(|d| d.name.as_str())
        .collect();
    if !deps.is_empty() {
        line.push_str(&format!(" after {}", deps.join(", ")));
    }
    println!("{}", line);
    for child in plan.children_of(id) {
        print_task(plan, &child.id, indent + 1);
    }
}

fn status_marker(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Pending => "○",
        TaskStatus::InProgress => "◐",
        TaskStatus::Completed => "●",
        TaskStatus::Failed => "✗",
    }
}

fn format_plan_status(status: PlanStatus) -> String {
    match status {
        PlanStatus::Completed => format!("\x1b[32m{}\x1b[0m", status), // Green
        PlanStatus::Failed => format!("\x1b[31m{}\x1b[0m", status),    // Red
        PlanStatus::InProgress => format!("\x1b[33m{}\x1b[0m", status), // Yellow
        PlanStatus::Pending => format!("\x1b[90m{}\x1b[0m", status),   // Gray
    }
}

/// Short display name for a plan, taken from the first line of the goal.
fn plan_name(goal: &str) -> String {
    truncate_string(goal.lines().next().unwrap_or(goal).trim(), 40)
}

fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}
