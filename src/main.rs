use std::path::Path;
use std::sync::Arc;

use genome_queue::artifacts::{ArtifactStore, LocalArtifactStore};
use genome_queue::config::QueueConfig;
use genome_queue::jobs::JobQueue;
use genome_queue::reaper::{Reaper, spawn_reaper_loop};
use genome_queue::store::{JobStore, LibSqlJobStore};
use genome_queue::worker::{CommandExecutor, JobWorker, WorkerSupervisor};
use tracing_appender::non_blocking::WorkerGuard;
use uuid::Uuid;

const USAGE: &str = "usage: genome-queue [serve | enqueue <file> [subject] | status <job-id> | cleanup]";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = QueueConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        std::process::exit(1);
    });

    let _log_guard = init_tracing(&config);

    let store: Arc<dyn JobStore> = Arc::new(
        LibSqlJobStore::new_local(&config.db_path)
            .await
            .unwrap_or_else(|e| {
                eprintln!(
                    "Error: Failed to open database at {}: {}",
                    config.db_path.display(),
                    e
                );
                std::process::exit(1);
            }),
    );
    let artifacts: Arc<dyn ArtifactStore> =
        Arc::new(LocalArtifactStore::new(config.artifacts_dir()).await?);

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        None | Some("serve") => serve(&config, store, artifacts).await,
        Some("enqueue") => {
            let Some(file) = args.get(1) else {
                eprintln!("{USAGE}");
                std::process::exit(2);
            };
            let queue = JobQueue::new(store, artifacts, config.uploads_dir());
            let bytes = tokio::fs::read(file).await?;
            let upload_name = Path::new(file)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| file.clone());
            let id = queue
                .enqueue(&upload_name, &bytes, args.get(2).map(String::as_str), None)
                .await?;
            println!("{id}");
            Ok(())
        }
        Some("status") => {
            let Some(id) = args.get(1).and_then(|s| Uuid::parse_str(s).ok()) else {
                eprintln!("{USAGE}");
                std::process::exit(2);
            };
            match store.get_job(id).await? {
                Some(job) => println!("{}", serde_json::to_string_pretty(&job)?),
                None => {
                    eprintln!("Job {id} not found");
                    std::process::exit(1);
                }
            }
            Ok(())
        }
        Some("cleanup") => {
            let report = Reaper::new(store, artifacts)
                .cleanup_expired_jobs(&config.ttls)
                .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Some(_) => {
            eprintln!("{USAGE}");
            std::process::exit(2);
        }
    }
}

/// Run workers and the reaper until interrupted.
async fn serve(
    config: &QueueConfig,
    store: Arc<dyn JobStore>,
    artifacts: Arc<dyn ArtifactStore>,
) -> Result<(), Box<dyn std::error::Error>> {
    let analyzer = config.require_analyzer()?;
    let executor = CommandExecutor::from_command_line(analyzer)
        .ok_or("analyzer command is empty")?;

    eprintln!("🧬 Genome Queue v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Runtime: {}", config.runtime_dir.display());
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   Analyzer: {}", analyzer.join(" "));
    eprintln!(
        "   Workers: {} (poll {}ms)",
        config.worker_count,
        config.poll_interval.as_millis()
    );

    let worker = Arc::new(JobWorker::new(
        Arc::clone(&store),
        Arc::clone(&artifacts),
        Arc::new(executor),
        config.reports_dir(),
    ));
    let supervisor = WorkerSupervisor::new(worker, config.worker_count, config.poll_interval);
    supervisor.start().await;

    let reaper = Arc::new(Reaper::new(store, artifacts));
    let reaper_handle = spawn_reaper_loop(reaper, config.ttls, config.reaper_interval);

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");

    reaper_handle.abort();
    supervisor.shutdown().await;
    Ok(())
}

/// Install the tracing subscriber. Logs go to stderr, or to a daily rolling
/// file when a log directory is configured.
fn init_tracing(config: &QueueConfig) -> Option<WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "genome-queue.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
            None
        }
    }
}
