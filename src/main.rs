use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use ssqe_orchestrator::api::{self, AppState};
use ssqe_orchestrator::config::{
    MountDriverKind, OrchestratorConfig, PoolConfig, RecoveryConfig, SandboxConfig, StoreConfig,
};
use ssqe_orchestrator::job::{Job, JobStatus, RuntimeKind};
use ssqe_orchestrator::orchestrator::Orchestrator;
use ssqe_orchestrator::shutdown::install_shutdown_handler;
use ssqe_orchestrator::store::{JobFilter, JobStore, SqliteJobStore};

#[derive(Parser, Debug)]
#[command(name = "ssqe-orchestrator")]
#[command(version)]
#[command(about = "Webhook-driven QE job orchestrator with sandboxed JVM/Node/Python execution")]
#[command(propagate_version = true)]
struct Args {
    /// Log output format
    #[arg(long, global = true, env = "LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the webhook service and orchestration workers
    Serve(ServeArgs),

    /// Inspect jobs in a durable store
    Job {
        #[command(flatten)]
        store: StoreArgs,

        #[command(subcommand)]
        command: JobCommands,
    },
}

#[derive(Debug, Clone, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DriverArg {
    Fuse,
    Local,
}

// =============================================================================
// Serve Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServeArgs {
    /// Address to listen on
    #[arg(long, env = "WEBHOOK_HOST", default_value = "0.0.0.0")]
    host: IpAddr,

    /// Port to listen on
    #[arg(long, env = "WEBHOOK_PORT", default_value = "8080")]
    port: u16,

    /// Orchestration workers
    #[arg(long, env = "WORKERS", default_value = "4")]
    workers: usize,

    /// Work queue capacity
    #[arg(long, env = "QUEUE_CAPACITY", default_value = "256")]
    queue_capacity: usize,

    /// Shared secret required in the X-Webhook-Secret header
    #[arg(long, env = "WEBHOOK_SECRET", hide_env_values = true)]
    webhook_secret: Option<String>,

    /// SQLite database for job records. Without it jobs are kept in memory
    /// and lost on restart.
    #[arg(long, env = "SSQE_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Maximum jobs held in the store
    #[arg(long, env = "SSQE_MAX_JOBS", default_value = "10000")]
    max_jobs: usize,

    // === Sandbox ===
    /// Directory under which job sandboxes are mounted
    #[arg(long, env = "SSQE_MOUNT_ROOT", default_value = "/tmp/ssqe/mounts")]
    mount_root: PathBuf,

    /// How sandboxes are backed
    #[arg(long, env = "SSQE_MOUNT_DRIVER", default_value = "fuse")]
    mount_driver: DriverArg,

    /// Bucket directory for the local mount driver
    #[arg(long, env = "SSQE_LOCAL_BUCKET_ROOT", default_value = "/tmp/ssqe/buckets")]
    local_bucket_root: PathBuf,

    #[arg(long, env = "SSQE_MOUNT_TIMEOUT_SECS", default_value = "30")]
    mount_timeout_secs: u64,

    #[arg(long, env = "SSQE_MOUNT_ATTEMPTS", default_value = "3")]
    mount_attempts: u32,

    // === Runtimes ===
    #[arg(long, env = "SSQE_JAVA_BIN", default_value = "java")]
    java_bin: String,

    #[arg(long, env = "SSQE_NODE_BIN", default_value = "node")]
    node_bin: String,

    #[arg(long, env = "SSQE_PYTHON_BIN", default_value = "python3")]
    python_bin: String,

    /// Concurrent executions per runtime kind
    #[arg(long, env = "SSQE_SLOTS_PER_RUNTIME", default_value = "2")]
    slots_per_runtime: usize,

    /// Default wall-clock limit per job
    #[arg(long, env = "SSQE_WALL_CLOCK_SECS", default_value = "900")]
    wall_clock_secs: u64,

    /// Default memory limit per job
    #[arg(long, env = "SSQE_MEMORY_MB", default_value = "2048")]
    memory_mb: u64,

    // === Recovery ===
    #[arg(long, env = "SSQE_STALENESS_SECS", default_value = "1800")]
    staleness_secs: u64,

    #[arg(long, env = "SSQE_RETRY_BUDGET", default_value = "2")]
    retry_budget: u32,

    #[arg(long, env = "SSQE_SWEEP_INTERVAL_SECS", default_value = "60")]
    sweep_interval_secs: u64,

    #[arg(long, env = "SSQE_RETENTION_DAYS", default_value = "7")]
    retention_days: u64,

    #[arg(long, env = "SSQE_HEALTH_TIMEOUT_SECS", default_value = "10")]
    health_timeout_secs: u64,

    #[arg(long, env = "SSQE_SHUTDOWN_GRACE_SECS", default_value = "30")]
    shutdown_grace_secs: u64,
}

impl ServeArgs {
    fn into_config(self) -> OrchestratorConfig {
        let defaults = OrchestratorConfig::default();

        let mut pool = PoolConfig::default()
            .with_program(RuntimeKind::Jvm, &self.java_bin)
            .with_program(RuntimeKind::Node, &self.node_bin)
            .with_program(RuntimeKind::Python, &self.python_bin);
        for spec in &mut pool.runtimes {
            spec.slots = self.slots_per_runtime.max(1);
        }
        pool.default_limits = pool
            .default_limits
            .clone()
            .with_wall_clock(std::time::Duration::from_secs(self.wall_clock_secs))
            .with_memory_bytes(Some(self.memory_mb.saturating_mul(1024 * 1024)));

        OrchestratorConfig {
            listen_addr: SocketAddr::new(self.host, self.port),
            workers: self.workers.max(1),
            queue_capacity: self.queue_capacity.max(1),
            webhook_secret: self.webhook_secret.filter(|s| !s.is_empty()),
            health_timeout_ms: self.health_timeout_secs.saturating_mul(1000),
            shutdown_grace_ms: self.shutdown_grace_secs.saturating_mul(1000),
            store: StoreConfig {
                db_path: self.db_path,
                max_jobs: self.max_jobs,
            },
            sandbox: SandboxConfig {
                mount_root: self.mount_root,
                driver: match self.mount_driver {
                    DriverArg::Fuse => MountDriverKind::Fuse,
                    DriverArg::Local => MountDriverKind::Local,
                },
                local_bucket_root: self.local_bucket_root,
                mount_timeout_ms: self.mount_timeout_secs.saturating_mul(1000),
                mount_attempts: self.mount_attempts.max(1),
                ..SandboxConfig::default()
            },
            pool,
            recovery: RecoveryConfig {
                staleness_threshold_ms: self.staleness_secs.saturating_mul(1000),
                retry_budget: self.retry_budget,
                sweep_interval_ms: self.sweep_interval_secs.max(1).saturating_mul(1000),
                retention_ms: self.retention_days.saturating_mul(24 * 60 * 60 * 1000),
            },
            ..defaults
        }
    }
}

// =============================================================================
// Job Inspection Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct StoreArgs {
    /// SQLite database written by `serve --db-path`
    #[arg(long, env = "SSQE_DB_PATH", global = true)]
    db: Option<PathBuf>,

    /// Output format
    #[arg(long, short = 'o', default_value = "table", global = true)]
    output: OutputFormat,
}

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Show one job
    Status {
        /// The job ID (UUID)
        job_id: String,
    },
    /// List jobs in creation order
    List {
        /// Only jobs in this status (received, mounting, running, succeeded, failed, timed_out)
        #[arg(long)]
        status: Option<String>,

        /// Maximum number of jobs to show
        #[arg(long)]
        limit: Option<usize>,
    },
}

#[derive(Serialize)]
struct JobListItem {
    job_id: String,
    status: String,
    runtime: String,
    source: String,
    created_at: String,
}

#[derive(Serialize)]
struct JobListOutput {
    jobs: Vec<JobListItem>,
    total_count: usize,
}

// =============================================================================
// Server Implementation
// =============================================================================

fn init_logging(format: &LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

async fn run_server(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = args.into_config();

    tracing::info!(
        listen_addr = %config.listen_addr,
        workers = config.workers,
        durable = config.store.is_durable(),
        mount_root = %config.sandbox.mount_root.display(),
        mount_driver = ?config.sandbox.driver,
        secret_required = config.webhook_secret.is_some(),
        "Starting ssqe-orchestrator"
    );

    let orchestrator = Orchestrator::from_config(config.clone())?;
    let listener = api::bind(config.listen_addr).await?;
    let shutdown = install_shutdown_handler()?;
    orchestrator.start().await?;

    let served = api::serve(listener, AppState::new(orchestrator.clone()), shutdown).await;
    orchestrator.shutdown().await;
    served?;
    Ok(())
}

// =============================================================================
// Job Inspection
// =============================================================================

fn open_store(args: &StoreArgs) -> Result<SqliteJobStore, Box<dyn std::error::Error>> {
    let db = args
        .db
        .as_ref()
        .ok_or("no job database given; pass --db or set SSQE_DB_PATH")?;
    if !db.exists() {
        return Err(format!("no job database at {}", db.display()).into());
    }
    Ok(SqliteJobStore::open(db, usize::MAX)?)
}

fn handle_job_status(
    store: &dyn JobStore,
    job_id: &str,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let id = uuid::Uuid::parse_str(job_id).map_err(|_| format!("'{}' is not a job ID", job_id))?;
    let Some(job) = store.get(id)? else {
        return Err(format!("job {} not found", id).into());
    };

    match output_format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&job)?),
        OutputFormat::Table => print_job(&job),
    }
    Ok(())
}

fn print_job(job: &Job) {
    println!("Job ID:          {}", job.id);
    println!("Status:          {}", job.status);
    println!("Runtime:         {}", job.runtime);
    println!("Source:          {}", job.source);
    println!("Input:           {}", job.input_ref);
    println!("Retries:         {}", job.retry_count);
    println!("Created:         {}", job.created_at.to_rfc3339());
    if let Some(completed) = job.completed_at {
        println!("Completed:       {}", completed.to_rfc3339());
    }
    if let Some(reason) = job.reason {
        println!("Reason:          {}", reason);
    }
    if let Some(error) = &job.error {
        println!("Error:           {}", error);
    }
    if let Some(result) = &job.result {
        if let Some(code) = result.exit_code {
            println!("Exit Code:       {}", code);
        }
        if !result.stdout.is_empty() {
            println!("Output:");
            for line in result.stdout.lines() {
                println!("  {}", line);
            }
        }
        if !result.stderr.is_empty() {
            println!("Stderr:");
            for line in result.stderr.lines() {
                println!("  {}", line);
            }
        }
        for artifact in &result.artifacts {
            println!("Artifact:        {}", artifact.display());
        }
    }
}

fn handle_job_list(
    store: &dyn JobStore,
    status: Option<String>,
    limit: Option<usize>,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let status = status.map(|s| s.parse::<JobStatus>()).transpose()?;
    let jobs = store.list(&JobFilter {
        status,
        limit,
        ..Default::default()
    })?;
    let items: Vec<JobListItem> = jobs
        .iter()
        .map(|job| JobListItem {
            job_id: job.id.to_string(),
            status: job.status.to_string(),
            runtime: job.runtime.to_string(),
            source: job.source.clone(),
            created_at: job.created_at.to_rfc3339(),
        })
        .collect();

    match output_format {
        OutputFormat::Json => {
            let output = JobListOutput {
                total_count: items.len(),
                jobs: items,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            if items.is_empty() {
                println!("No jobs found.");
            } else {
                println!("{:<38} {:<10} {:<8} {:<16} CREATED", "JOB ID", "STATUS", "RUNTIME", "SOURCE");
                println!("{}", "-".repeat(100));
                for item in &items {
                    println!(
                        "{:<38} {:<10} {:<8} {:<16} {}",
                        item.job_id, item.status, item.runtime, item.source, item.created_at
                    );
                }
                println!();
                println!("Showing {} jobs", items.len());
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args.log_format);

    let result = match args.command {
        Commands::Serve(serve_args) => run_server(serve_args).await,
        Commands::Job { store, command } => match open_store(&store) {
            Ok(db) => match command {
                JobCommands::Status { job_id } => handle_job_status(&db, &job_id, &store.output),
                JobCommands::List { status, limit } => {
                    handle_job_list(&db, status, limit, &store.output)
                }
            },
            Err(e) => Err(e),
        },
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Fatal error");
            eprintln!("Error: {}", e);
            ExitCode::from(1)
        }
    }
}
