//! Integration tests for the full job lifecycle.
//!
//! Each test builds a queue over a file-backed libSQL database and a local
//! artifact store in a temp dir, then drives jobs through real workers.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::time::timeout;

use genome_queue::artifacts::{ArtifactStore, LocalArtifactStore, archive_entries};
use genome_queue::config::{QueueConfig, Ttls};
use genome_queue::error::{Error, ErrorKind, JobError};
use genome_queue::jobs::{FailureKind, JobQueue, JobStatus};
use genome_queue::reaper::{CleanupReport, Reaper};
use genome_queue::store::{JobStore, LibSqlJobStore};
use genome_queue::worker::{AnalysisExecutor, JobWorker, WorkerSupervisor};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

const SAMPLE_REPORTS: &[&str] = &[
    "EXHAUSTIVE_GENETIC_REPORT.md",
    "EXHAUSTIVE_DISEASE_RISK_REPORT.md",
    "ACTIONABLE_HEALTH_PROTOCOL_V3.md",
];

/// Writes one markdown report per expected name.
struct SampleAnalyzer;

#[async_trait]
impl AnalysisExecutor for SampleAnalyzer {
    async fn run(
        &self,
        input: &Path,
        subject_name: Option<&str>,
        output_dir: &Path,
    ) -> anyhow::Result<()> {
        let genotypes = tokio::fs::read_to_string(input).await?;
        for name in SAMPLE_REPORTS {
            let body = format!(
                "# {name}\n\nSubject: {}\nVariants: {}\n",
                subject_name.unwrap_or("unknown"),
                genotypes.lines().count()
            );
            tokio::fs::write(output_dir.join(name), body).await?;
        }
        Ok(())
    }
}

/// Always fails, the way a parser rejecting the input would.
struct RejectingAnalyzer;

#[async_trait]
impl AnalysisExecutor for RejectingAnalyzer {
    async fn run(&self, _: &Path, _: Option<&str>, _: &Path) -> anyhow::Result<()> {
        Err(anyhow::anyhow!("no genotype rows found").context("parsing raw data"))
    }
}

struct Env {
    _tmp: TempDir,
    config: QueueConfig,
    store: Arc<dyn JobStore>,
    artifacts: Arc<dyn ArtifactStore>,
    queue: JobQueue,
}

async fn env() -> Env {
    let tmp = TempDir::new().unwrap();
    let config = QueueConfig::with_runtime_dir(tmp.path());
    let store: Arc<dyn JobStore> = Arc::new(LibSqlJobStore::new_local(&config.db_path).await.unwrap());
    let artifacts: Arc<dyn ArtifactStore> =
        Arc::new(LocalArtifactStore::new(config.artifacts_dir()).await.unwrap());
    let queue = JobQueue::new(store.clone(), artifacts.clone(), config.uploads_dir());
    Env {
        _tmp: tmp,
        config,
        store,
        artifacts,
        queue,
    }
}

impl Env {
    fn worker(&self, executor: impl AnalysisExecutor + 'static) -> JobWorker {
        JobWorker::new(
            self.store.clone(),
            self.artifacts.clone(),
            Arc::new(executor),
            self.config.reports_dir(),
        )
    }
}

fn sample_bytes() -> &'static [u8] {
    b"# rsid\tchromosome\tposition\tgenotype\nrs4477212\t1\t82154\tAA\nrs3094315\t1\t752566\tAG\n"
}

#[tokio::test]
async fn end_to_end_sample_produces_exactly_three_reports() {
    timeout(TEST_TIMEOUT, async {
        let env = env().await;
        let id = env
            .queue
            .enqueue("sample.txt", sample_bytes(), Some("Test Subject"), Some("req-1"))
            .await
            .unwrap();

        let job = env.worker(SampleAnalyzer).process_next_job().await.unwrap().unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.storage_key.is_some());
        assert!(job.started_at.is_some() && job.completed_at.is_some());

        let archive = env.queue.download(id).await.unwrap();
        let mut expected: Vec<String> = SAMPLE_REPORTS.iter().map(|s| s.to_string()).collect();
        expected.sort();
        assert_eq!(archive_entries(&archive).unwrap(), expected);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn failed_job_is_stable_across_reads() {
    timeout(TEST_TIMEOUT, async {
        let env = env().await;
        let id = env.queue.enqueue("sample.txt", sample_bytes(), None, None).await.unwrap();

        env.worker(RejectingAnalyzer).process_next_job().await.unwrap();

        let first = env.queue.get(id).await.unwrap().unwrap();
        let second = env.queue.get(id).await.unwrap().unwrap();
        assert_eq!(first, second);
        assert_eq!(first.status, JobStatus::Failed);
        assert_eq!(first.error_kind, Some(FailureKind::Analysis));
        assert!(first.storage_key.is_none());

        // Context chain is preserved.
        let error = first.error.unwrap();
        assert!(error.contains("parsing raw data"), "{error}");
        assert!(error.contains("no genotype rows found"), "{error}");

        let err = env.queue.download(id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotReady);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn jobs_are_processed_in_submission_order() {
    timeout(TEST_TIMEOUT, async {
        let env = env().await;
        let mut submitted = Vec::new();
        for i in 0..4 {
            let id = env
                .queue
                .enqueue(&format!("sample-{i}.txt"), sample_bytes(), None, None)
                .await
                .unwrap();
            submitted.push(id);
        }

        let worker = env.worker(SampleAnalyzer);
        let mut processed = Vec::new();
        while let Some(job) = worker.process_next_job().await.unwrap() {
            processed.push(job.id);
        }
        assert_eq!(processed, submitted);
    })
    .await
    .expect("test timed out");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_workers_never_share_a_job() {
    timeout(TEST_TIMEOUT, async {
        let env = env().await;
        let mut submitted = HashSet::new();
        for i in 0..8 {
            let id = env
                .queue
                .enqueue(&format!("sample-{i}.txt"), sample_bytes(), None, None)
                .await
                .unwrap();
            submitted.insert(id);
        }

        let workers: Vec<Arc<JobWorker>> = (0..4).map(|_| Arc::new(env.worker(SampleAnalyzer))).collect();
        let runs = workers.iter().map(|worker| {
            let worker = Arc::clone(worker);
            tokio::spawn(async move {
                let mut mine = Vec::new();
                while let Some(job) = worker.process_next_job().await.unwrap() {
                    mine.push(job.id);
                }
                mine
            })
        });

        let mut seen = Vec::new();
        for result in futures::future::join_all(runs).await {
            seen.extend(result.unwrap());
        }
        assert_eq!(seen.len(), submitted.len());
        assert_eq!(seen.into_iter().collect::<HashSet<_>>(), submitted);

        for id in &submitted {
            let job = env.queue.get(*id).await.unwrap().unwrap();
            assert_eq!(job.status, JobStatus::Completed);
        }
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn cleanup_with_zero_ttls_removes_everything_in_one_pass() {
    timeout(TEST_TIMEOUT, async {
        let env = env().await;
        env.queue.enqueue("a.txt", sample_bytes(), None, None).await.unwrap();
        env.queue.enqueue("b.txt", sample_bytes(), None, None).await.unwrap();
        env.worker(SampleAnalyzer).process_next_job().await.unwrap();
        env.worker(RejectingAnalyzer).process_next_job().await.unwrap();
        env.queue.enqueue("c.txt", sample_bytes(), None, None).await.unwrap();

        let reaper = Reaper::new(env.store.clone(), env.artifacts.clone());
        let report = reaper.cleanup_expired_jobs(&Ttls::zero()).await.unwrap();
        assert_eq!(
            report,
            CleanupReport {
                removed_uploads: 3,
                removed_artifacts: 1,
                removed_jobs: 3,
            }
        );

        assert!(env.queue.list_recent(10).await.unwrap().is_empty());
        let uploads_left = std::fs::read_dir(env.config.uploads_dir()).unwrap().count();
        assert_eq!(uploads_left, 0);
        let artifacts_left = std::fs::read_dir(env.config.artifacts_dir()).unwrap().count();
        assert_eq!(artifacts_left, 0);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn row_expiring_before_artifact_leaves_nothing_behind() {
    timeout(TEST_TIMEOUT, async {
        let env = env().await;
        env.queue.enqueue("a.txt", sample_bytes(), None, None).await.unwrap();
        env.worker(SampleAnalyzer).process_next_job().await.unwrap();

        let week = Duration::from_secs(7 * 24 * 3600);
        let reaper = Reaper::new(env.store.clone(), env.artifacts.clone());
        let first = reaper
            .cleanup_expired_jobs(&Ttls::new(week, week, Duration::ZERO))
            .await
            .unwrap();
        assert_eq!(
            first,
            CleanupReport {
                removed_uploads: 1,
                removed_artifacts: 1,
                removed_jobs: 1,
            }
        );

        let second = reaper.cleanup_expired_jobs(&Ttls::zero()).await.unwrap();
        assert_eq!(second, CleanupReport::default());

        assert!(env.queue.list_recent(10).await.unwrap().is_empty());
        let artifacts_left = std::fs::read_dir(env.config.artifacts_dir()).unwrap().count();
        assert_eq!(artifacts_left, 0);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn download_errors_are_distinguishable() {
    timeout(TEST_TIMEOUT, async {
        let env = env().await;

        let unknown = env.queue.download(uuid::Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(unknown, Error::Job(JobError::NotFound { .. })));

        let id = env.queue.enqueue("a.txt", sample_bytes(), None, None).await.unwrap();
        let queued = env.queue.download(id).await.unwrap_err();
        assert!(matches!(queued, Error::Job(JobError::NotReady { .. })));
        assert!(queued.kind().is_retryable());

        env.worker(SampleAnalyzer).process_next_job().await.unwrap();
        let path: PathBuf = env.queue.download(id).await.unwrap();
        assert!(path.exists());

        let artifact_only = Ttls::new(Duration::from_secs(3600), Duration::ZERO, Duration::from_secs(3600));
        Reaper::new(env.store.clone(), env.artifacts.clone())
            .cleanup_expired_jobs(&artifact_only)
            .await
            .unwrap();

        let gone = env.queue.download(id).await.unwrap_err();
        assert_eq!(gone.kind(), ErrorKind::StorageGone);
        assert!(!gone.kind().is_retryable());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn unsupported_upload_creates_nothing() {
    timeout(TEST_TIMEOUT, async {
        let env = env().await;
        let err = env.queue.enqueue("bad.zip", b"PK\x03\x04", None, None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(env.queue.list_recent(10).await.unwrap().is_empty());
        assert!(!env.config.uploads_dir().exists());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn queued_jobs_survive_a_restart() {
    timeout(TEST_TIMEOUT, async {
        let env = env().await;
        let id = env.queue.enqueue("sample.txt", sample_bytes(), None, None).await.unwrap();

        // A second process opening the same database sees the queued job.
        let reopened = LibSqlJobStore::new_local(&env.config.db_path).await.unwrap();
        let job = reopened.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.upload_path.exists());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn supervisor_drains_the_queue() {
    timeout(TEST_TIMEOUT, async {
        let env = env().await;
        let id = env.queue.enqueue("sample.txt", sample_bytes(), None, None).await.unwrap();

        let supervisor = WorkerSupervisor::new(
            Arc::new(env.worker(SampleAnalyzer)),
            2,
            Duration::from_millis(25),
        );
        assert!(supervisor.start().await);
        assert!(supervisor.is_running().await);

        loop {
            let job = env.queue.get(id).await.unwrap().unwrap();
            if job.status.is_terminal() {
                assert_eq!(job.status, JobStatus::Completed);
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        supervisor.shutdown().await;
        assert!(!supervisor.is_running().await);
    })
    .await
    .expect("test timed out");
}
