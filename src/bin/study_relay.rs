use std::io::{self, BufRead};
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use study_relay::config::{ConfigLoader, ResolvedConfig};
use study_relay::domain::{AccessionNumber, ServerName, StorageMode, StudyReference};
use study_relay::error::RelayError;
use study_relay::locator::{HttpWorklistTransport, Scenario, WorklistHttpLocator};
use study_relay::metadata::MetadataExtractor;
use study_relay::orchestrator::{OrchestrationLoop, Relay, StopHandle};
use study_relay::output::{JsonOutput, LogOutput, OutcomeSink};
use study_relay::pipeline::{HttpPipelineTransport, PipelineDispatcher};
use study_relay::registry::ExamRegistry;
use study_relay::report::{HttpReportTransport, ReportWriter};
use study_relay::retention::RetentionManager;
use study_relay::retrieval::{DownloadEngine, RetrievalJob, RetryPolicy};
use study_relay::router::StorageRouter;
use study_relay::session::{FileSessionProvider, SessionHandle};
use study_relay::store::Store;
use study_relay::viewer::{SystemLauncher, ViewerHandoff};
use study_relay::wado::WadoHttpClient;

const ARCHIVE_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Parser)]
#[command(name = "study-relay")]
#[command(about = "Retrieves imaging studies from WADO archives and relays them to a viewer or pipeline")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<String>,

    /// Print outcomes as JSON lines instead of log lines.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Poll the worklist and retrieve new studies until stopped")]
    Run(RunArgs),
    #[command(about = "Retrieve specific accession numbers")]
    Fetch(FetchArgs),
    #[command(about = "List exam records")]
    List,
    #[command(about = "Apply the retention limit once")]
    Prune,
    #[command(about = "Send a retained study to the pipeline again")]
    Dispatch(DispatchArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Single locate pass, then exit once every study has an outcome.
    #[arg(long)]
    once: bool,
}

#[derive(Args)]
struct FetchArgs {
    #[arg(required = true)]
    accessions: Vec<String>,

    /// Only this archive; no failover.
    #[arg(long)]
    server: Option<String>,

    #[arg(long)]
    force: bool,
}

#[derive(Args)]
struct DispatchArgs {
    accession: String,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<RelayError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &RelayError) -> u8 {
    match error {
        error if error.is_config() => 2,
        RelayError::AuthExpired { .. }
        | RelayError::Session(_)
        | RelayError::ServerUnavailable { .. }
        | RelayError::ArchiveStatus { .. }
        | RelayError::StudyNotFound { .. }
        | RelayError::IncompleteStudy { .. } => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let config = ConfigLoader::resolve(cli.config.as_deref())?;
    let sink: Arc<dyn OutcomeSink> = if cli.json {
        Arc::new(JsonOutput::default())
    } else {
        Arc::new(LogOutput)
    };

    match cli.command {
        Commands::Run(args) => run_loop(config, sink, args.once),
        Commands::Fetch(args) => run_fetch(config, sink, args),
        Commands::List => run_list(config),
        Commands::Prune => run_prune(config),
        Commands::Dispatch(args) => run_dispatch(config, args),
    }
}

struct Runtime {
    session: Arc<SessionHandle>,
    registry: Arc<ExamRegistry>,
    retention: Arc<RetentionManager>,
}

fn open_runtime(config: &ResolvedConfig) -> Result<Runtime, RelayError> {
    let store = Store::new(&config.paths);
    store.ensure_layout()?;
    let registry = Arc::new(ExamRegistry::open(store)?);
    let retention = Arc::new(RetentionManager::new(Arc::clone(&registry)));
    let session = Arc::new(SessionHandle::new(Box::new(FileSessionProvider::new(
        config.session.file.clone(),
        config.session.refresh_command.clone(),
    ))));
    Ok(Runtime {
        session,
        registry,
        retention,
    })
}

fn build_router(config: &ResolvedConfig, runtime: &Runtime) -> Result<StorageRouter, RelayError> {
    let mut router = StorageRouter::new(
        config.storage_mode,
        Arc::clone(&runtime.registry),
        MetadataExtractor::new(config.dump_series_tags),
        Arc::clone(&runtime.retention),
        config.max_retained,
    )
    .with_viewer(ViewerHandoff::new(
        config.viewer.clone(),
        Arc::new(SystemLauncher),
    ));
    if config.pipeline_active() {
        let reporter = if config.report.auto_write {
            Some(ReportWriter::new(
                config.report.clone(),
                Arc::new(HttpReportTransport::new()?),
                Arc::clone(&runtime.session),
            ))
        } else {
            None
        };
        router = router.with_dispatcher(PipelineDispatcher::new(
            config.pipeline.clone(),
            Arc::new(HttpPipelineTransport::new()?),
            reporter,
        ));
    }
    Ok(router)
}

fn build_relay(config: &ResolvedConfig, runtime: &Runtime) -> Result<Relay<WadoHttpClient>, RelayError> {
    let engine = DownloadEngine::new(
        WadoHttpClient::new(ARCHIVE_TIMEOUT)?,
        Arc::clone(&runtime.session),
        Arc::clone(&runtime.registry),
        RetryPolicy::from(&config.retrieval),
        config.retrieval.threads,
    );
    Ok(Relay::new(
        engine,
        build_router(config, runtime)?,
        config.servers.clone(),
    ))
}

fn run_loop(config: ResolvedConfig, sink: Arc<dyn OutcomeSink>, once: bool) -> miette::Result<()> {
    if config.scenarios.is_empty() {
        return Err(RelayError::InvalidConfig("`run` needs at least one scenario".to_string()).into());
    }
    let runtime = open_runtime(&config)?;
    let relay = build_relay(&config, &runtime)?;
    let locator = WorklistHttpLocator::new(
        HttpWorklistTransport::new()?,
        Arc::clone(&runtime.session),
        &config.worklist,
        Scenario::load_all(&config.scenarios)?,
    )?;
    let relay_loop = OrchestrationLoop::new(
        relay,
        locator,
        sink,
        config.loop_interval,
        config.retrieval.study_workers,
    );
    if !once {
        spawn_console(relay_loop.control());
    }
    let summary = if once {
        relay_loop.run_once()?
    } else {
        relay_loop.run()?
    };
    if summary.failed > 0 {
        warn!(failed = summary.failed, "some studies failed");
    }
    Ok(())
}

/// `stop`/`q`, `pause` and `resume` typed on stdin steer the loop.
fn spawn_console(control: StopHandle) {
    thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else {
                break;
            };
            match line.trim().to_lowercase().as_str() {
                "stop" | "q" | "quit" => {
                    info!("stop requested; waiting for in-flight studies");
                    control.stop();
                    break;
                }
                "pause" => {
                    info!("paused");
                    control.pause();
                }
                "resume" => {
                    info!("resumed");
                    control.resume();
                }
                "" => {}
                other => warn!(command = other, "unknown command (stop, pause, resume)"),
            }
        }
    });
}

fn run_fetch(config: ResolvedConfig, sink: Arc<dyn OutcomeSink>, args: FetchArgs) -> miette::Result<()> {
    let runtime = open_runtime(&config)?;
    let relay = build_relay(&config, &runtime)?;
    let manual_server = match &args.server {
        Some(name) => {
            let name = name.parse::<ServerName>()?;
            let server = config
                .server(&name)
                .cloned()
                .ok_or_else(|| RelayError::InvalidServer(format!("{name} is not configured")))?;
            Some(server)
        }
        None => None,
    };

    let mut failed = 0;
    for raw in &args.accessions {
        let accession = raw.parse::<AccessionNumber>()?;
        let reference = StudyReference::new(accession);
        let job = match &manual_server {
            Some(server) => RetrievalJob::manual(reference, server.clone()),
            None => relay.job_for(reference),
        };
        let job = if args.force { job.forced() } else { job };
        let outcome = relay.process(job);
        if outcome.is_failure() {
            failed += 1;
        }
        sink.report(&outcome);
    }
    if failed > 0 {
        return Err(miette::miette!("{failed} of {} studies failed", args.accessions.len()));
    }
    Ok(())
}

fn run_list(config: ResolvedConfig) -> miette::Result<()> {
    let runtime = open_runtime(&config)?;
    let records = runtime.registry.records()?;
    JsonOutput::print_json(&records).into_diagnostic()
}

fn run_prune(config: ResolvedConfig) -> miette::Result<()> {
    let runtime = open_runtime(&config)?;
    let orphans = runtime.retention.sweep_orphans()?;
    if config.storage_mode == StorageMode::Transient {
        let trimmed = runtime.retention.trim_history(config.max_retained)?;
        info!(trimmed, orphans = orphans.len(), "history trimmed");
        return Ok(());
    }
    let report = runtime.retention.enforce(config.max_retained)?;
    JsonOutput::print_json(&report).into_diagnostic()
}

fn run_dispatch(config: ResolvedConfig, args: DispatchArgs) -> miette::Result<()> {
    if !config.pipeline_active() {
        return Err(RelayError::InvalidConfig(
            "dispatch needs storage_mode pipeline with the pipeline enabled".to_string(),
        )
        .into());
    }
    let accession = args.accession.parse::<AccessionNumber>()?;
    let runtime = open_runtime(&config)?;
    let router = build_router(&config, &runtime)?;
    let outcome = router.redispatch(&accession)?;
    JsonOutput::print_json(&outcome).into_diagnostic()
}
