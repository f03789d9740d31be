use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use batch_dispatch::config::{DispatchMode, NodeConfig};
use batch_dispatch::coordinator::CollectingAnalyzer;
use batch_dispatch::error::Result as DispatchResult;
use batch_dispatch::model::{BatchStatus, JobExecution, Properties};
use batch_dispatch::node::Node;
use batch_dispatch::partition::StepDefinition;
use batch_dispatch::resolver::{JobDefinition, StaticDefinitions};
use batch_dispatch::shutdown::install_shutdown_handler;
use batch_dispatch::store::{ExecutionStore, InMemoryExecutionStore};
use batch_dispatch::transport::{InMemoryTransport, MessageTransport};
use batch_dispatch::worker::{JobContext, JobOutcome, JobRunner, PartitionContext};

#[derive(Parser, Debug)]
#[command(name = "batch-dispatch")]
#[command(version)]
#[command(about = "Batch job dispatch, partition coordination and restart")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run a partitioned demo job on an in-process cluster
    Demo(DemoArgs),
}

// =============================================================================
// Demo Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct DemoArgs {
    /// Number of nodes in the in-process cluster
    #[arg(long, default_value = "3")]
    nodes: u32,

    /// Number of partitions of the demo's partitioned step
    #[arg(long, default_value = "4")]
    partitions: u32,

    /// How jobs and partitions are routed
    #[arg(long, default_value = "queued")]
    mode: ModeArg,

    /// Fail this partition on the first execution, then restart the job
    #[arg(long)]
    fail_partition: Option<u32>,

    /// Wait per reply before partitions are considered missing (milliseconds)
    #[arg(long, default_value = "15000")]
    reply_timeout_ms: u64,

    /// Port for the read-only monitor on the first node (optional)
    #[arg(long)]
    dashboard_port: Option<u16>,

    /// Keep the cluster and monitor running until SIGINT/SIGTERM
    #[arg(long)]
    keep_running: bool,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum ModeArg {
    Local,
    Queued,
}

impl From<ModeArg> for DispatchMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Local => DispatchMode::Local,
            ModeArg::Queued => DispatchMode::Queued,
        }
    }
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct StepOutput {
    step_execution_id: u64,
    step_name: String,
    partition: Option<u32>,
    status: String,
    exit_status: Option<String>,
    server_id: Option<String>,
}

#[derive(Serialize)]
struct ExecutionOutput {
    execution_id: u64,
    execution_number: u32,
    status: String,
    exit_status: Option<String>,
    server_id: Option<String>,
    steps: Vec<StepOutput>,
}

#[derive(Serialize)]
struct DemoOutput {
    instance_id: u64,
    instance_state: String,
    executions: Vec<ExecutionOutput>,
}

// =============================================================================
// Demo Job
// =============================================================================

const DEMO_JOB: &str = "demo";
const DEMO_DEFINITION: &str = "demo.xml";

/// Three steps: `prepare`, a partitioned `process`, then `report`.
///
/// Job parameters: `partitions` (count) and, optionally, `fail_partition`.
struct DemoRunner;

impl DemoRunner {
    async fn plain_step(context: &JobContext, name: &str) -> DispatchResult<()> {
        if !context.should_run_step(name).await? {
            return Ok(());
        }
        let step = context.begin_step(name).await?;
        tokio::time::sleep(Duration::from_millis(20)).await;
        context
            .end_step(&step, BatchStatus::Completed, "COMPLETED")
            .await?;
        Ok(())
    }
}

#[async_trait]
impl JobRunner for DemoRunner {
    async fn run_job(&self, context: &JobContext) -> DispatchResult<JobOutcome> {
        Self::plain_step(context, "prepare").await?;
        if context.is_stop_requested() {
            return Ok(JobOutcome::stopped());
        }

        if context.should_run_step("process").await? {
            let count: u32 = context
                .parameters()
                .get("partitions")
                .and_then(|p| p.parse().ok())
                .unwrap_or(1);
            let partitions = (0..count)
                .map(|i| {
                    let mut props = Properties::new();
                    props.insert("first".to_string(), (i * 100).to_string());
                    props.insert("last".to_string(), (i * 100 + 99).to_string());
                    props
                })
                .collect();
            let mut analyzer = CollectingAnalyzer::default();
            let outcome = context
                .run_partitioned_step(StepDefinition::new("process"), partitions, &mut analyzer)
                .await?;
            for (partition, data) in &analyzer.data {
                tracing::info!(partition, data = %String::from_utf8_lossy(data), "Collected");
            }
            if outcome.status != BatchStatus::Completed {
                return Ok(JobOutcome::new(outcome.status, outcome.exit_status));
            }
        }

        Self::plain_step(context, "report").await?;
        Ok(JobOutcome::completed())
    }

    async fn run_partition(&self, context: &PartitionContext) -> DispatchResult<JobOutcome> {
        let plan = context.plan();
        let failing = plan
            .job_properties
            .get("fail_partition")
            .and_then(|p| p.parse::<u32>().ok());

        tokio::select! {
            _ = context.stop_token().cancelled() => return Ok(JobOutcome::stopped()),
            _ = tokio::time::sleep(Duration::from_millis(50)) => {}
        }

        if failing == Some(plan.partition_number) {
            return Ok(JobOutcome::failed("DEMO_FAILURE"));
        }
        let first = context.properties().get("first").cloned().unwrap_or_default();
        let last = context.properties().get("last").cloned().unwrap_or_default();
        context
            .send_collector_data(format!("records {}..={}", first, last).into_bytes())
            .await?;
        Ok(JobOutcome::completed())
    }
}

// =============================================================================
// Demo Implementation
// =============================================================================

async fn wait_for_final(
    store: &Arc<dyn ExecutionStore>,
    execution_id: u64,
    timeout: Duration,
) -> Result<JobExecution, Box<dyn std::error::Error>> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let execution = store.get_job_execution(execution_id).await?;
        if execution.status.is_final() {
            return Ok(execution);
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(format!(
                "Timed out waiting for execution {} (status {})",
                execution_id, execution.status
            )
            .into());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn run_demo(args: DemoArgs) -> Result<(), Box<dyn std::error::Error>> {
    if args.nodes == 0 {
        return Err("--nodes must be at least 1".into());
    }

    let shutdown = install_shutdown_handler();
    let store: Arc<dyn ExecutionStore> = Arc::new(InMemoryExecutionStore::new());
    let transport: Arc<dyn MessageTransport> = Arc::new(InMemoryTransport::new());
    let resolver = Arc::new(
        StaticDefinitions::new().with_definition(DEMO_DEFINITION, JobDefinition::default()),
    );
    let runner = Arc::new(DemoRunner);
    let mode: DispatchMode = args.mode.into();

    let mut nodes = Vec::new();
    for i in 1..=args.nodes {
        let rest_url = format!("http://127.0.0.1:{}", 9079 + i);
        let mut config = NodeConfig::new(format!("node-{}", i), rest_url)
            .with_mode(mode)
            .with_partition_timing(args.reply_timeout_ms, 3_000);
        if i == 1 {
            if let Some(port) = args.dashboard_port {
                let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;
                config = config.with_dashboard(addr);
            }
        }
        let node = Node::new(
            config,
            store.clone(),
            Some(transport.clone()),
            runner.clone(),
            resolver.clone(),
        )?;
        let tasks = node.start(shutdown.clone()).await?;
        nodes.push((node, tasks));
    }

    tracing::info!(nodes = nodes.len(), mode = %mode, "Cluster started");

    let entry = &nodes[0].0;
    let mut parameters = Properties::new();
    parameters.insert("partitions".to_string(), args.partitions.to_string());
    if let Some(partition) = args.fail_partition {
        parameters.insert("fail_partition".to_string(), partition.to_string());
    }

    let timeout = Duration::from_millis(args.reply_timeout_ms) + Duration::from_secs(30);
    let submitted = entry
        .operator
        .submit(DEMO_JOB, "demo-user", DEMO_DEFINITION, parameters.clone())
        .await?;
    let mut last = wait_for_final(&store, submitted.execution_id, timeout).await?;

    if args.fail_partition.is_some() && last.status != BatchStatus::Completed {
        parameters.remove("fail_partition");
        let restarted = entry
            .operator
            .restart(last.execution_id, parameters)
            .await?;
        last = wait_for_final(&store, restarted.execution_id, timeout).await?;
    }

    let instance = store.get_job_instance(last.instance_id).await?;
    let mut executions = Vec::new();
    let history = store.executions_for_instance(instance.instance_id).await?;
    for execution in history.into_iter().rev() {
        let steps = store
            .step_thread_executions(execution.execution_id)
            .await?
            .into_iter()
            .map(|s| StepOutput {
                step_execution_id: s.step_execution_id,
                partition: s.kind.partition_number(),
                step_name: s.step_name,
                status: s.status.to_string(),
                exit_status: s.exit_status,
                server_id: s.server_id,
            })
            .collect();
        executions.push(ExecutionOutput {
            execution_id: execution.execution_id,
            execution_number: execution.execution_number,
            status: execution.status.to_string(),
            exit_status: execution.exit_status,
            server_id: execution.server_id,
            steps,
        });
    }
    let output = DemoOutput {
        instance_id: instance.instance_id,
        instance_state: instance.state.to_string(),
        executions,
    };

    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&output)?),
        OutputFormat::Table => print_table(&output),
    }

    if args.keep_running {
        println!("Cluster running, press Ctrl-C to stop.");
        shutdown.cancelled().await;
    } else {
        shutdown.cancel();
    }
    for (node, tasks) in nodes {
        node.shutdown(tasks).await;
    }
    Ok(())
}

fn print_table(output: &DemoOutput) {
    println!("Instance:  {}", output.instance_id);
    println!("State:     {}", output.instance_state);
    for execution in &output.executions {
        println!();
        println!(
            "Execution {} (#{}) {} exit={} on {}",
            execution.execution_id,
            execution.execution_number,
            execution.status,
            execution.exit_status.as_deref().unwrap_or("-"),
            execution.server_id.as_deref().unwrap_or("-"),
        );
        println!(
            "  {:<8} {:<10} {:<10} {:<12} {:<22} SERVER",
            "STEP ID", "STEP", "PARTITION", "STATUS", "EXIT"
        );
        println!("  {}", "-".repeat(76));
        for step in &execution.steps {
            let partition = step
                .partition
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_string());
            println!(
                "  {:<8} {:<10} {:<10} {:<12} {:<22} {}",
                step.step_execution_id,
                step.step_name,
                partition,
                step.status,
                step.exit_status.as_deref().unwrap_or("-"),
                step.server_id.as_deref().unwrap_or("-"),
            );
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Demo(demo_args) => run_demo(demo_args).await,
    }
}
