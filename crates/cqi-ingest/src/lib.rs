//! Ingestion pipeline: fetch a feed window, map issues to tasks, dedupe
//! against the document store, and commit new tasks in bounded batches.

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use cqi_core::Task;
use cqi_feeds::{
    build_task, FeedClient, FeedClientConfig, FeedConfig, FeedFetch, FeedRegistry, IssueTaxonomy,
    RawFeedRecord,
};
use cqi_store::{DocumentStore, FileStore, StoreError, HARD_BATCH_LIMIT};
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cqi-ingest";

/// Default intermediate-flush ceiling, kept with headroom below the store's
/// hard per-batch limit.
pub const DEFAULT_BATCH_CEILING: usize = 400;

/// Stable task identifier derived from the feed name and the record's
/// external key. Pure and total: identical inputs always produce the
/// identical id, and it doubles as the document's storage key, which makes
/// the existence check a single point read.
pub fn derived_task_id(feed_name: &str, external_key: &str) -> String {
    format!("{feed_name}-{external_key}")
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub feeds_path: PathBuf,
    pub store_dir: PathBuf,
    pub batch_ceiling: usize,
    pub scheduler_enabled: bool,
    pub ingest_cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl IngestConfig {
    pub fn from_env() -> Self {
        Self {
            feeds_path: std::env::var("CQI_FEEDS_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("feeds.yaml")),
            store_dir: std::env::var("CQI_STORE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./store")),
            batch_ceiling: std::env::var("CQI_BATCH_CEILING")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_BATCH_CEILING),
            scheduler_enabled: std::env::var("CQI_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            ingest_cron: std::env::var("CQI_INGEST_CRON")
                .unwrap_or_else(|_| "0 0 */6 * * *".to_string()),
            user_agent: std::env::var("CQI_USER_AGENT")
                .unwrap_or_else(|_| "cqi-bot/0.1".to_string()),
            http_timeout_secs: std::env::var("CQI_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Fetching,
    Processing,
    Flushing,
    Done,
    Failed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Idle => "idle",
            RunState::Fetching => "fetching",
            RunState::Processing => "processing",
            RunState::Flushing => "flushing",
            RunState::Done => "done",
            RunState::Failed => "failed",
        };
        f.write_str(s)
    }
}

fn advance(feed: &str, run_id: Uuid, state: &mut RunState, next: RunState) {
    debug!(feed, %run_id, from = %state, to = %next, "run state");
    *state = next;
}

/// Per-run summary. Invariant: `fetched` equals `created + skipped_unmapped
/// + skipped_duplicate`.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub run_id: Uuid,
    pub feed: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub fetched: usize,
    pub created: usize,
    pub skipped_unmapped: usize,
    pub skipped_duplicate: usize,
    pub batches_committed: usize,
}

impl RunResult {
    pub fn skipped(&self) -> usize {
        self.skipped_unmapped + self.skipped_duplicate
    }
}

/// Accumulates pending create-operations and commits them as bounded,
/// create-only batches. Every staged operation lands in exactly one batch;
/// the ceiling is clamped strictly below [`HARD_BATCH_LIMIT`].
pub struct BatchWriter<'a, S: DocumentStore> {
    store: &'a S,
    ceiling: usize,
    pending: Vec<(String, Task)>,
    committed: usize,
    batches: usize,
}

impl<'a, S: DocumentStore> BatchWriter<'a, S> {
    pub fn new(store: &'a S, ceiling: usize) -> Self {
        Self {
            store,
            ceiling: ceiling.clamp(1, HARD_BATCH_LIMIT - 1),
            pending: Vec::new(),
            committed: 0,
            batches: 0,
        }
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub async fn stage(&mut self, id: String, task: Task) -> Result<(), StoreError> {
        self.pending.push((id, task));
        if self.pending.len() >= self.ceiling {
            self.flush().await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), StoreError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.pending);
        let count = batch.len();
        self.store.create_tasks(batch).await?;
        self.committed += count;
        self.batches += 1;
        debug!(count, total = self.committed, "committed task batch");
        Ok(())
    }

    /// Commit whatever is still pending. Returns (committed, batches).
    pub async fn flush_remaining(mut self) -> Result<(usize, usize), StoreError> {
        self.flush().await?;
        Ok((self.committed, self.batches))
    }
}

struct ProcessTally {
    created: usize,
    skipped_unmapped: usize,
    skipped_duplicate: usize,
}

/// Orchestrates one feed's fetch → map → dedup → batched commit cycle.
///
/// The document store and feed fetcher are constructor-injected so tests can
/// run the pipeline against an in-memory store and a canned feed. Writes to
/// the task namespace are exclusive to this pipeline; the check-then-act
/// dedup pattern relies on that single-writer assumption plus serialized
/// runs.
pub struct IngestPipeline<F: FeedFetch, S: DocumentStore> {
    config: IngestConfig,
    fetcher: F,
    taxonomy: IssueTaxonomy,
    store: Arc<S>,
    run_lock: tokio::sync::Mutex<()>,
}

impl<F: FeedFetch, S: DocumentStore> IngestPipeline<F, S> {
    pub fn new(config: IngestConfig, fetcher: F, taxonomy: IssueTaxonomy, store: Arc<S>) -> Self {
        Self {
            config,
            fetcher,
            taxonomy,
            store,
            run_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Run every enabled feed once, sequentially. Triggers are serialized: if
    /// a previous invocation is still running, this one refuses to start
    /// rather than queue behind it. Each feed is an independent run, so one
    /// feed's failure does not stop the others; the invocation as a whole
    /// fails at the end if any run failed.
    pub async fn run_all(&self, registry: &FeedRegistry) -> Result<Vec<RunResult>> {
        let _guard = self
            .run_lock
            .try_lock()
            .map_err(|_| anyhow!("ingest run already in progress; trigger skipped"))?;

        let mut results = Vec::new();
        let mut failed = 0usize;
        for feed in registry.enabled() {
            match self.run_once(feed).await {
                Ok(result) => results.push(result),
                Err(err) => {
                    failed += 1;
                    warn!(feed = %feed.feed_name, error = %err, "feed run failed; continuing with remaining feeds");
                }
            }
        }
        if failed > 0 {
            return Err(anyhow!(
                "{failed} of {} feed runs failed",
                failed + results.len()
            ));
        }
        Ok(results)
    }

    /// One complete run for one feed. On fetch failure the run transitions
    /// straight to failed with no writes attempted; on a store failure the
    /// remaining flush is aborted and already-committed batches stay
    /// committed. Deterministic ids make the next run's overlapping window
    /// re-attempt safely.
    pub async fn run_once(&self, feed: &FeedConfig) -> Result<RunResult> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let mut state = RunState::Idle;

        advance(&feed.feed_name, run_id, &mut state, RunState::Fetching);
        let records = match self.fetcher.fetch_window(run_id, feed, started_at).await {
            Ok(records) => records,
            Err(err) => {
                advance(&feed.feed_name, run_id, &mut state, RunState::Failed);
                warn!(%run_id, feed = %feed.feed_name, error = %err, "feed fetch failed; no writes attempted");
                return Err(err)
                    .with_context(|| format!("fetching window for feed {}", feed.feed_name));
            }
        };
        let fetched = records.len();

        advance(&feed.feed_name, run_id, &mut state, RunState::Processing);
        let mut writer = BatchWriter::new(self.store.as_ref(), self.config.batch_ceiling);
        let tally = match self.process(feed, &records, &mut writer).await {
            Ok(tally) => tally,
            Err(err) => {
                advance(&feed.feed_name, run_id, &mut state, RunState::Failed);
                warn!(%run_id, feed = %feed.feed_name, error = %err, "run aborted mid-processing");
                return Err(err)
                    .with_context(|| format!("processing records for feed {}", feed.feed_name));
            }
        };

        advance(&feed.feed_name, run_id, &mut state, RunState::Flushing);
        let (committed, batches_committed) = match writer.flush_remaining().await {
            Ok(counts) => counts,
            Err(err) => {
                advance(&feed.feed_name, run_id, &mut state, RunState::Failed);
                warn!(%run_id, feed = %feed.feed_name, error = %err, "final flush failed");
                return Err(err)
                    .with_context(|| format!("flushing remainder for feed {}", feed.feed_name));
            }
        };
        debug_assert_eq!(committed, tally.created);

        advance(&feed.feed_name, run_id, &mut state, RunState::Done);
        let result = RunResult {
            run_id,
            feed: feed.feed_name.clone(),
            started_at,
            finished_at: Utc::now(),
            fetched,
            created: tally.created,
            skipped_unmapped: tally.skipped_unmapped,
            skipped_duplicate: tally.skipped_duplicate,
            batches_committed,
        };
        info!(
            %run_id,
            feed = %result.feed,
            fetched = result.fetched,
            created = result.created,
            skipped_unmapped = result.skipped_unmapped,
            skipped_duplicate = result.skipped_duplicate,
            batches = result.batches_committed,
            "ingest run complete"
        );
        Ok(result)
    }

    async fn process(
        &self,
        feed: &FeedConfig,
        records: &[RawFeedRecord],
        writer: &mut BatchWriter<'_, S>,
    ) -> Result<ProcessTally, StoreError> {
        let mut tally = ProcessTally {
            created: 0,
            skipped_unmapped: 0,
            skipped_duplicate: 0,
        };
        // The feed guarantees external-key uniqueness per window; the seen
        // set coalesces a same-id repeat within one run anyway.
        let mut seen: HashSet<String> = HashSet::new();

        for raw in records {
            let Some(mapping) = self.taxonomy.lookup(&raw.complaint_type) else {
                tally.skipped_unmapped += 1;
                continue;
            };
            let id = derived_task_id(&feed.feed_name, &raw.unique_key);
            if !seen.insert(id.clone()) {
                tally.skipped_duplicate += 1;
                continue;
            }
            if self.store.get_task(&id).await?.is_some() {
                tally.skipped_duplicate += 1;
                continue;
            }
            let task = build_task(id.clone(), feed, raw, mapping);
            writer.stage(id, task).await?;
            tally.created += 1;
        }
        Ok(tally)
    }
}

/// Build the cron scheduler when enabled. Each trigger runs all enabled
/// feeds; a trigger that lands while a run is active is skipped with a
/// warning instead of stacking up.
pub async fn maybe_build_scheduler<F, S>(
    pipeline: Arc<IngestPipeline<F, S>>,
    registry: Arc<FeedRegistry>,
) -> Result<Option<JobScheduler>>
where
    F: FeedFetch + 'static,
    S: DocumentStore + 'static,
{
    if !pipeline.config.scheduler_enabled {
        return Ok(None);
    }

    let cron = pipeline.config.ingest_cron.clone();
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let pipeline = pipeline.clone();
        let registry = registry.clone();
        Box::pin(async move {
            match pipeline.run_all(&registry).await {
                Ok(results) => {
                    let created: usize = results.iter().map(|r| r.created).sum();
                    info!(runs = results.len(), created, "scheduled ingest complete");
                }
                Err(err) => warn!(error = %err, "scheduled ingest did not complete"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

/// One-shot entry point used by the CLI: env config, YAML feed registry,
/// file-backed store, builtin taxonomy.
pub async fn run_ingest_once_from_env() -> Result<Vec<RunResult>> {
    let config = IngestConfig::from_env();
    let registry = FeedRegistry::load(&config.feeds_path)?;
    let fetcher = FeedClient::new(FeedClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
    })?;
    let store = Arc::new(FileStore::new(&config.store_dir));
    let pipeline = IngestPipeline::new(config, fetcher, IssueTaxonomy::builtin(), store);
    pipeline.run_all(&registry).await
}

/// Scheduler entry point used by the CLI `schedule` command. Parks until
/// ctrl-c.
pub async fn run_scheduler_from_env() -> Result<()> {
    let mut config = IngestConfig::from_env();
    config.scheduler_enabled = true;
    let registry = Arc::new(FeedRegistry::load(&config.feeds_path)?);
    let fetcher = FeedClient::new(FeedClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
    })?;
    let store = Arc::new(FileStore::new(&config.store_dir));
    let cron = config.ingest_cron.clone();
    let pipeline = Arc::new(IngestPipeline::new(
        config,
        fetcher,
        IssueTaxonomy::builtin(),
        store,
    ));

    let sched = maybe_build_scheduler(pipeline, registry)
        .await?
        .ok_or_else(|| anyhow!("scheduler construction returned none despite being enabled"))?;
    sched.start().await.context("starting scheduler")?;
    info!(%cron, "scheduler running; ctrl-c to stop");
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    Ok(())
}
