use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use rand::Rng;
use std::path::PathBuf;
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

use swarm::{
    AgentCapabilities, ExecutionContext, ObjectiveRequirements, SwarmConfig, SwarmCoordinator,
    SwarmEvent, SwarmResult, Task,
};

/// Swarm: coordination and distributed execution engine for agent task graphs.
///
/// The binary only exercises the library: it submits one objective to a
/// simulated agent pool and prints the lifecycle events.
#[derive(Parser, Debug)]
#[command(name = "swarm")]
#[command(about = "Swarm coordination and distributed execution engine", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one objective on a simulated agent pool
    Demo {
        /// Objective description
        #[arg(default_value = "build a small service")]
        description: String,

        /// Decomposition strategy (development, research, analysis, ...)
        #[arg(long, default_value = "development")]
        strategy: String,

        /// Path to a YAML config file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Agents registered per required agent type
        #[arg(long, default_value_t = 1)]
        agents_per_type: u32,

        /// Probability that a simulated attempt fails
        #[arg(long, default_value_t = 0.0)]
        fail_rate: f64,

        /// Give up waiting after this many seconds
        #[arg(long, default_value_t = 60)]
        wait_secs: u64,
    },
    /// Print the effective configuration as YAML
    PrintConfig {
        /// Path to a YAML config file
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn print_error_chain(err: &anyhow::Error) {
    eprintln!("Error: {err}");
    let mut n = 0;
    let mut cur = err.source();
    while let Some(cause) = cur {
        eprintln!("  {n}: {cause}");
        n += 1;
        cur = cause.source();
    }
}

fn main() {
    let cli = Cli::parse();

    let filter = if cli.debug {
        "debug".to_string()
    } else {
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string())
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .init();

    if let Err(err) = real_main(cli) {
        print_error_chain(&err);
        std::process::exit(1);
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<SwarmConfig> {
    match path {
        Some(path) => SwarmConfig::load_from_file(path),
        None => {
            let mut cfg = SwarmConfig::default();
            cfg.apply_env_overrides()?;
            cfg.validate().context("validate default swarm config")?;
            Ok(cfg)
        }
    }
}

fn real_main(cli: Cli) -> Result<()> {
    match cli.command {
        Command::PrintConfig { config } => {
            let cfg = load_config(config.as_ref())?;
            let yaml = serde_yaml::to_string(&cfg).context("serialize swarm config")?;
            print!("{yaml}");
            Ok(())
        }
        Command::Demo {
            description,
            strategy,
            config,
            agents_per_type,
            fail_rate,
            wait_secs,
        } => {
            if !(0.0..=1.0).contains(&fail_rate) {
                return Err(anyhow!("--fail-rate must be within [0, 1], got {fail_rate}"));
            }
            let cfg = load_config(config.as_ref())?;
            run_demo(cfg, &description, &strategy, agents_per_type, fail_rate, wait_secs)
        }
    }
}

/// Sleeps a little, emits a line of output and reports full quality.
fn simulated_handler(
    fail_rate: f64,
) -> impl Fn(&Task, &ExecutionContext) -> SwarmResult<String> + Send + Sync + 'static {
    move |task: &Task, ctx: &ExecutionContext| -> SwarmResult<String> {
        let (work_ms, fail) = {
            let mut rng = rand::thread_rng();
            (rng.gen_range(20..120u64), rng.gen_bool(fail_rate))
        };
        std::thread::sleep(Duration::from_millis(work_ms));
        ctx.emit(&format!("{} finished in {work_ms}ms\n", task.name))?;
        if fail {
            return Err(swarm::SwarmError::task_failed(format!(
                "simulated failure in '{}'",
                task.name
            )));
        }
        ctx.set_quality(1.0);
        Ok(format!("{} done", task.name))
    }
}

fn run_demo(
    cfg: SwarmConfig,
    description: &str,
    strategy: &str,
    agents_per_type: u32,
    fail_rate: f64,
    wait_secs: u64,
) -> Result<()> {
    let swarm = SwarmCoordinator::new(cfg);
    swarm.set_default_handler(Arc::new(simulated_handler(fail_rate)));
    let events = swarm.subscribe();

    let objective_id = swarm
        .create_objective(description, strategy, ObjectiveRequirements::default())
        .context("create objective")?;
    let objective = swarm.get_objective(&objective_id)?;
    for agent_type in &objective.required_agent_types {
        for i in 0..agents_per_type.max(1) {
            swarm.register_agent(
                &format!("{agent_type}-{i}"),
                agent_type,
                AgentCapabilities::default(),
            )?;
        }
    }
    swarm.execute(&objective_id).context("execute objective")?;

    let deadline = Instant::now() + Duration::from_secs(wait_secs);
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            info!(objective = %objective_id, "stopped waiting for objective");
            break;
        }
        match events.recv_timeout(left) {
            Ok(event) => {
                println!("{}", event.summarize());
                if let SwarmEvent::ObjectiveFinished { objective_id: id, .. } = &event {
                    if id == &objective_id {
                        break;
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    let status = swarm.get_status();
    let metrics = swarm.get_metrics();
    println!(
        "tasks: {} completed, {} failed, {} cancelled of {}",
        status.completed_tasks, status.failed_tasks, status.cancelled_tasks, status.total_tasks
    );
    println!(
        "dispatched {} | retried {} | steals {} | avg task {:.1}ms",
        metrics.tasks_dispatched,
        metrics.tasks_retried,
        metrics.work_steals,
        metrics.avg_task_duration_ms
    );
    swarm.shutdown()
}
