use clap::{Parser, Subcommand};
use rand::Rng;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use taskcore::task::{ChannelListener, TaskEventKind, TaskEventRecord};
use taskcore::{Priority, RuntimeConfig, TaskError, TaskRef, TaskRuntime, TaskState};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "taskcore")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Drive the taskcore scheduler with synthetic jobs")]
#[command(long_about = None)]
#[command(arg_required_else_help = true)]
struct Args {
    /// Configuration file path
    #[arg(short = 'c', long = "config", global = true)]
    config: Option<PathBuf>,
    /// Log filter directive, overrides RUST_LOG and the configuration
    #[arg(long = "log-filter", global = true)]
    log_filter: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Queue synthetic jobs on a task manager
    Run {
        /// Number of jobs
        #[arg(short = 'n', long = "tasks", default_value_t = 8)]
        tasks: usize,
        /// Concurrently running jobs, 0 for unlimited
        #[arg(short = 'j', long = "max-jobs")]
        max_jobs: Option<usize>,
        /// Make every Nth job fail
        #[arg(long = "fail-every")]
        fail_every: Option<usize>,
        /// Upper bound of a job's duration in milliseconds
        #[arg(long = "max-ms", default_value_t = 400)]
        max_ms: u64,
        /// Finished jobs kept for inspection
        #[arg(long = "watch")]
        watch: Option<usize>,
        /// Print the summary as JSON
        #[arg(long = "json")]
        json: bool,
    },
    /// Run synthetic jobs as the children of one task group
    Group {
        /// Number of child jobs
        #[arg(short = 'n', long = "tasks", default_value_t = 5)]
        tasks: usize,
        /// Make every Nth job fail
        #[arg(long = "fail-every")]
        fail_every: Option<usize>,
        /// Upper bound of a job's duration in milliseconds
        #[arg(long = "max-ms", default_value_t = 400)]
        max_ms: u64,
        /// Cancel the remaining children on the first failure
        #[arg(long = "stop-on-exception")]
        stop_on_exception: bool,
        /// Print the summary as JSON
        #[arg(long = "json")]
        json: bool,
    },
    /// Print the effective configuration as TOML
    ShowConfig,
    /// Write the default configuration to a file
    InitConfig {
        /// Destination file
        #[arg(default_value = taskcore::env::CONFIG_FILE_NAME)]
        path: PathBuf,
    },
}

#[derive(Debug, Serialize)]
struct JobSummary {
    id: u64,
    name: String,
    priority: u8,
    state: TaskState,
    millis: Option<u64>,
    error: Option<String>,
}

impl JobSummary {
    fn of(task: &TaskRef) -> Self {
        Self {
            id: task.id(),
            name: task.unique_name().to_string(),
            priority: task.priority().value(),
            state: task.state(),
            millis: task.result_as::<u64>().map(|m| *m),
            error: task.error().map(|e| e.to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
struct RunSummary {
    jobs: Vec<JobSummary>,
    succeeded: usize,
    failed: usize,
    cancelled: usize,
    watched: usize,
    elapsed_ms: u128,
}

impl RunSummary {
    fn new(tasks: &[TaskRef], watched: usize, elapsed: Duration) -> Self {
        let jobs: Vec<JobSummary> = tasks.iter().map(JobSummary::of).collect();
        let cancelled = tasks.iter().filter(|t| t.is_cancel()).count();
        let failed = tasks
            .iter()
            .filter(|t| !t.is_cancel() && t.error().is_some())
            .count();
        Self {
            succeeded: jobs.len() - cancelled - failed,
            jobs,
            failed,
            cancelled,
            watched,
            elapsed_ms: elapsed.as_millis(),
        }
    }

    fn print(&self, json: bool) -> anyhow::Result<()> {
        if json {
            println!("{}", serde_json::to_string_pretty(self)?);
            return Ok(());
        }
        for job in &self.jobs {
            let outcome = match (&job.error, job.millis) {
                (Some(error), _) => error.clone(),
                (None, Some(millis)) => format!("ok after {millis}ms"),
                (None, None) => "no result".to_string(),
            };
            println!(
                "  {:<16} p{:<3} {:<20} {}",
                job.name,
                job.priority,
                format!("{:?}", job.state),
                outcome
            );
        }
        println!(
            "{} succeeded, {} failed, {} cancelled, {} watched in {}ms",
            self.succeeded, self.failed, self.cancelled, self.watched, self.elapsed_ms
        );
        Ok(())
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut config = load_config(args.config.as_deref())?;

    let filter = match &args.log_filter {
        Some(filter) => EnvFilter::new(filter),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_filter)),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match args.command {
        Commands::Run {
            tasks,
            max_jobs,
            fail_every,
            max_ms,
            watch,
            json,
        } => {
            if let Some(max_jobs) = max_jobs {
                config.manager.max_jobs = (max_jobs > 0).then_some(max_jobs);
            }
            if let Some(watch) = watch {
                config.manager.max_watched = watch;
            }
            run_manager(config, tasks, fail_every, max_ms)?.print(json)
        }
        Commands::Group {
            tasks,
            fail_every,
            max_ms,
            stop_on_exception,
            json,
        } => run_group(config, tasks, fail_every, max_ms, stop_on_exception)?.print(json),
        Commands::ShowConfig => {
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
        Commands::InitConfig { path } => {
            if path.exists() {
                anyhow::bail!("{} already exists", path.display());
            }
            RuntimeConfig::default().to_toml_file(&path)?;
            println!("Wrote default configuration to {}", path.display());
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<RuntimeConfig> {
    if let Some(path) = path {
        return Ok(RuntimeConfig::from_toml_file(path)?);
    }
    let local = Path::new(taskcore::env::CONFIG_FILE_NAME);
    if local.exists() {
        return Ok(RuntimeConfig::from_toml_file(local)?);
    }
    Ok(RuntimeConfig::default())
}

fn synthetic_job(
    runtime: &TaskRuntime,
    index: usize,
    fail_every: Option<usize>,
    max_ms: u64,
) -> anyhow::Result<TaskRef> {
    const STEPS: i64 = 10;

    let mut rng = rand::rng();
    let millis = rng.random_range(STEPS as u64..=max_ms.max(STEPS as u64));
    let priority = Priority::new(rng.random_range(Priority::MIN.value()..=Priority::MAX.value()))?;
    let fails = fail_every.is_some_and(|n| n > 0 && (index + 1) % n == 0);

    let task = runtime
        .task(format!("job-{index}"))
        .priority(priority)
        .work(move |ctx| {
            ctx.publish_progress_init(STEPS);
            for step in 1..=STEPS {
                ctx.sleep(Duration::from_millis(millis / STEPS as u64))?;
                ctx.publish_progress(step);
            }
            if fails {
                return Err(TaskError::failed(format!("job-{index} failed on purpose")));
            }
            Ok(millis)
        })
        .build()?;
    Ok(task)
}

/// Block until `expected` tasks reported a terminal event
fn wait_terminal(rx: &mut UnboundedReceiver<TaskEventRecord>, expected: usize) {
    let mut finished = 0;
    while finished < expected {
        let Some(record) = rx.blocking_recv() else {
            warn!("Event channel closed with {} task(s) outstanding", expected - finished);
            return;
        };
        match record.event.kind() {
            TaskEventKind::PostRun | TaskEventKind::Cancelled => finished += 1,
            TaskEventKind::Progress => {
                debug!(task = %record.task.unique_name(), "{:?}", record.event)
            }
            _ => info!(task = %record.task.unique_name(), "{:?}", record.event.kind()),
        }
    }
}

fn run_manager(
    config: RuntimeConfig,
    count: usize,
    fail_every: Option<usize>,
    max_ms: u64,
) -> anyhow::Result<RunSummary> {
    let runtime = TaskRuntime::new(config)?;
    let manager = runtime.manager().build()?;
    let (listener, mut rx) = ChannelListener::new();

    let started_at = Instant::now();
    let mut tasks = Vec::with_capacity(count);
    for index in 0..count {
        let task = synthetic_job(&runtime, index, fail_every, max_ms)?;
        task.add_listener_default(listener.clone());
        if !manager.add_task(&task) {
            warn!(task = %task.unique_name(), "Manager rejected job");
            continue;
        }
        tasks.push(task);
    }
    info!(
        "Queued {} job(s): {} running, {} ready",
        tasks.len(),
        manager.run_len(),
        manager.ready_len()
    );

    wait_terminal(&mut rx, tasks.len());
    runtime.dispatcher().flush_blocking();
    let summary = RunSummary::new(&tasks, manager.watched_tasks().len(), started_at.elapsed());
    runtime.shutdown();
    Ok(summary)
}

fn run_group(
    config: RuntimeConfig,
    count: usize,
    fail_every: Option<usize>,
    max_ms: u64,
    stop_on_exception: bool,
) -> anyhow::Result<RunSummary> {
    let runtime = TaskRuntime::new(config)?;
    let children = (0..count)
        .map(|index| synthetic_job(&runtime, index, fail_every, max_ms))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let group = runtime
        .group("demo-group")
        .children(children)
        .stop_on_exception(stop_on_exception)
        .build()?;

    let (listener, mut rx) = ChannelListener::new();
    group.task().add_listener_default(listener);

    let started_at = Instant::now();
    group.start();
    wait_terminal(&mut rx, 1);
    runtime.dispatcher().flush_blocking();

    if let Some(failed) = group.result_task() {
        warn!(task = %failed.unique_name(), "Group stopped on failure");
    }
    let summary = RunSummary::new(&group.children(), 0, started_at.elapsed());
    runtime.shutdown();
    Ok(summary)
}
