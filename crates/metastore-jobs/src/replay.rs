//! Replay: bulk re-publish of existing records with durable progress.
//!
//! A run scans the tenant's active records (optionally one kind) page by page
//! and re-publishes each page as `replay` notifications. Up to `parallelism`
//! pages are in flight at once. Page outcomes flow over a channel to a single
//! progress writer, which owns the run's [`ReplayMetaData`] and persists it
//! after every page, so `processed_records` only ever grows.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{broadcast, mpsc, Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use metastore_core::{
    defaults, new_v7, AuditEvent, AuditSink, Cursor, Error, OperationType, PubSubInfo,
    RecordStore, ReplayMetaData, ReplayOperation, ReplayRepository, ReplayRequest, ReplayState,
    RequestContext, Result,
};

use crate::notifier::ChangeNotifier;

/// Configuration for replay runs.
#[derive(Debug, Clone)]
pub struct ReplayConfig {
    /// Records per page.
    pub batch_size: usize,
    /// Pages in flight at once.
    pub parallelism: usize,
    /// Topic for `replay` runs.
    pub replay_topic: String,
    /// Topic for `reindex` runs.
    pub reindex_topic: String,
    /// Whether new runs are accepted.
    pub enabled: bool,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            batch_size: defaults::REPLAY_BATCH_SIZE,
            parallelism: defaults::REPLAY_PARALLELISM,
            replay_topic: defaults::RECORDS_CHANGED_TOPIC.to_string(),
            reindex_topic: defaults::REINDEX_TOPIC.to_string(),
            enabled: true,
        }
    }
}

impl ReplayConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `REPLAY_ENABLED` | `true` | Accept new replay runs |
    /// | `REPLAY_BATCH_SIZE` | `50` | Records per page |
    /// | `REPLAY_PARALLELISM` | `4` | Pages in flight |
    /// | `RECORDS_CHANGED_TOPIC` | `recordstopic` | Topic for `replay` |
    /// | `REINDEX_TOPIC` | `reindex` | Topic for `reindex` |
    pub fn from_env() -> Self {
        let enabled = std::env::var("REPLAY_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        let batch_size = std::env::var("REPLAY_BATCH_SIZE")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(defaults::REPLAY_BATCH_SIZE)
            .max(1);

        let parallelism = std::env::var("REPLAY_PARALLELISM")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(defaults::REPLAY_PARALLELISM)
            .max(1);

        Self {
            batch_size,
            parallelism,
            replay_topic: std::env::var("RECORDS_CHANGED_TOPIC")
                .unwrap_or_else(|_| defaults::RECORDS_CHANGED_TOPIC.to_string()),
            reindex_topic: std::env::var("REINDEX_TOPIC")
                .unwrap_or_else(|_| defaults::REINDEX_TOPIC.to_string()),
            enabled,
        }
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    pub fn with_parallelism(mut self, n: usize) -> Self {
        self.parallelism = n.max(1);
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Topic a run of `operation` publishes to.
    pub fn topic_for(&self, operation: ReplayOperation) -> &str {
        match operation {
            ReplayOperation::Replay => &self.replay_topic,
            ReplayOperation::Reindex => &self.reindex_topic,
        }
    }
}

/// Event emitted by the replay orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayEvent {
    /// A run moved to `IN_PROGRESS`.
    Started { replay_id: Uuid, total_records: i64 },
    /// A page was published and progress persisted.
    Progress {
        replay_id: Uuid,
        processed_records: i64,
        total_records: i64,
    },
    /// A run reached a terminal state.
    Finished { replay_id: Uuid, state: ReplayState },
}

enum PageOutcome {
    Published(usize),
    Failed(String),
}

/// Starts, tracks, and stops replay runs.
#[derive(Clone)]
pub struct ReplayOrchestrator {
    records: Arc<dyn RecordStore>,
    replays: Arc<dyn ReplayRepository>,
    notifier: ChangeNotifier,
    audit: Arc<dyn AuditSink>,
    config: ReplayConfig,
    stop_flags: Arc<Mutex<HashMap<Uuid, Arc<AtomicBool>>>>,
    event_tx: broadcast::Sender<ReplayEvent>,
}

impl ReplayOrchestrator {
    pub fn new(
        records: Arc<dyn RecordStore>,
        replays: Arc<dyn ReplayRepository>,
        notifier: ChangeNotifier,
        audit: Arc<dyn AuditSink>,
        config: ReplayConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(defaults::EVENT_BUS_CAPACITY);
        Self {
            records,
            replays,
            notifier,
            audit,
            config,
            stop_flags: Arc::new(Mutex::new(HashMap::new())),
            event_tx,
        }
    }

    /// Get a receiver for replay events.
    pub fn events(&self) -> broadcast::Receiver<ReplayEvent> {
        self.event_tx.subscribe()
    }

    /// Accept a replay request and start the run in the background.
    ///
    /// Returns the run as persisted in `QUEUED` state.
    pub async fn start(&self, ctx: &RequestContext, request: &ReplayRequest) -> Result<ReplayMetaData> {
        let (operation, kind) = match self.parse_request(request) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.audit.record(
                    ctx,
                    AuditEvent::ReplayRequestFailed {
                        operation: request.operation.clone(),
                        reason: e.to_string(),
                    },
                );
                return Err(e);
            }
        };

        let total = self
            .records
            .count_active(ctx.partition_id(), kind.as_deref())
            .await?;
        let meta = ReplayMetaData::queued(new_v7(), kind, operation, total);
        self.replays.save(ctx.partition_id(), &meta).await?;

        let stop = Arc::new(AtomicBool::new(false));
        self.stop_flags
            .lock()
            .await
            .insert(meta.replay_id, stop.clone());

        self.audit.record(
            ctx,
            AuditEvent::ReplayRequested {
                replay_id: meta.replay_id,
                operation,
                kind: meta.kind.clone(),
            },
        );
        info!(
            subsystem = "jobs",
            component = "replay",
            op = "start",
            partition_id = %ctx.partition_id(),
            correlation_id = %ctx.correlation_id(),
            replay_id = %meta.replay_id,
            operation = %operation,
            kind = meta.kind.as_deref().unwrap_or("*"),
            total_records = total,
            "Replay queued"
        );

        let this = self.clone();
        let run_ctx = ctx.clone();
        let queued = meta.clone();
        tokio::spawn(async move {
            let replay_id = queued.replay_id;
            this.run(run_ctx, queued, stop).await;
            this.stop_flags.lock().await.remove(&replay_id);
        });

        Ok(meta)
    }

    fn parse_request(&self, request: &ReplayRequest) -> Result<(ReplayOperation, Option<String>)> {
        if !self.config.enabled {
            return Err(Error::InvalidInput("Replay is disabled".into()));
        }
        let operation = request.operation.parse::<ReplayOperation>()?;
        let kind = request.kind()?;
        Ok((operation, kind))
    }

    /// Current persisted state of a run.
    pub async fn status(&self, partition_id: &str, replay_id: Uuid) -> Result<ReplayMetaData> {
        self.replays
            .get(partition_id, replay_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Replay {}", replay_id)))
    }

    /// Ask a run to stop after its in-flight pages drain.
    ///
    /// A run this process does not own (left over from a previous process)
    /// is marked `STOPPED` directly. Stopping a finished run is a no-op.
    pub async fn stop(&self, partition_id: &str, replay_id: Uuid) -> Result<ReplayMetaData> {
        let mut meta = self.status(partition_id, replay_id).await?;
        if meta.state.is_terminal() {
            return Ok(meta);
        }

        if let Some(flag) = self.stop_flags.lock().await.get(&replay_id) {
            flag.store(true, Ordering::SeqCst);
            info!(
                subsystem = "jobs",
                component = "replay",
                op = "stop",
                partition_id = %partition_id,
                replay_id = %replay_id,
                "Replay stop requested"
            );
            return Ok(meta);
        }

        meta.transition(ReplayState::Stopped)?;
        meta.touch_elapsed();
        self.replays.save(partition_id, &meta).await?;
        Ok(meta)
    }

    /// Fail runs a previous process left `QUEUED` or `IN_PROGRESS`.
    ///
    /// Returns how many runs were marked `FAILED`.
    pub async fn recover_interrupted(&self, partition_id: &str) -> Result<usize> {
        let owned: HashSet<Uuid> = self.stop_flags.lock().await.keys().copied().collect();
        let orphans: Vec<ReplayMetaData> = self
            .replays
            .list_unfinished(partition_id)
            .await?
            .into_iter()
            .filter(|m| !owned.contains(&m.replay_id))
            .collect();

        for mut meta in orphans.iter().cloned() {
            meta.transition(ReplayState::Failed)?;
            meta.touch_elapsed();
            self.replays.save(partition_id, &meta).await?;
            warn!(
                subsystem = "jobs",
                component = "replay",
                op = "recover",
                partition_id = %partition_id,
                replay_id = %meta.replay_id,
                processed_records = meta.processed_records,
                total_records = meta.total_records,
                "Marked interrupted replay as failed"
            );
        }
        Ok(orphans.len())
    }

    async fn run(&self, ctx: RequestContext, mut meta: ReplayMetaData, stop: Arc<AtomicBool>) {
        let partition_id = ctx.partition_id().to_string();
        let replay_id = meta.replay_id;
        let start = Instant::now();

        if let Err(e) = self.begin(&partition_id, &mut meta).await {
            error!(
                subsystem = "jobs",
                component = "replay",
                replay_id = %replay_id,
                error = %e,
                "Failed to start replay"
            );
            self.finish(&partition_id, meta, ReplayState::Failed).await;
            return;
        }

        let kind = meta.kind.clone();
        let topic = self.config.topic_for(meta.operation).to_string();
        let (progress_tx, progress_rx) = mpsc::channel(defaults::REPLAY_PROGRESS_CAPACITY);
        let writer = tokio::spawn(Self::progress_writer(
            self.replays.clone(),
            self.event_tx.clone(),
            partition_id.clone(),
            meta,
            progress_rx,
        ));

        let scan = self
            .submit_pages(&ctx, kind.as_deref(), &topic, &stop, progress_tx)
            .await;
        let (meta, page_error) = match writer.await {
            Ok(result) => result,
            Err(e) => {
                error!(
                    subsystem = "jobs",
                    component = "replay",
                    replay_id = %replay_id,
                    error = %e,
                    "Replay progress writer panicked"
                );
                return;
            }
        };

        let state = match (&scan, &page_error) {
            (Err(e), _) => {
                error!(
                    subsystem = "jobs",
                    component = "replay",
                    replay_id = %replay_id,
                    error = %e,
                    "Replay scan failed"
                );
                ReplayState::Failed
            }
            (_, Some(e)) => {
                error!(
                    subsystem = "jobs",
                    component = "replay",
                    replay_id = %replay_id,
                    error = %e,
                    "Replay page failed"
                );
                ReplayState::Failed
            }
            (Ok(true), None) => ReplayState::Stopped,
            (Ok(false), None) => ReplayState::Completed,
        };

        info!(
            subsystem = "jobs",
            component = "replay",
            op = "finish",
            partition_id = %partition_id,
            replay_id = %replay_id,
            state = %state,
            processed_records = meta.processed_records,
            total_records = meta.total_records,
            duration_ms = start.elapsed().as_millis() as u64,
            "Replay finished"
        );
        self.finish(&partition_id, meta, state).await;
    }

    async fn begin(&self, partition_id: &str, meta: &mut ReplayMetaData) -> Result<()> {
        meta.transition(ReplayState::InProgress)?;
        meta.touch_elapsed();
        self.replays.save(partition_id, meta).await?;
        let _ = self.event_tx.send(ReplayEvent::Started {
            replay_id: meta.replay_id,
            total_records: meta.total_records,
        });
        Ok(())
    }

    /// Scan and dispatch pages until exhausted, stopped, or failed.
    ///
    /// Returns `Ok(true)` when the stop flag ended the scan early. Waits for
    /// every dispatched page before returning.
    async fn submit_pages(
        &self,
        ctx: &RequestContext,
        kind: Option<&str>,
        topic: &str,
        stop: &AtomicBool,
        progress_tx: mpsc::Sender<PageOutcome>,
    ) -> Result<bool> {
        let semaphore = Arc::new(Semaphore::new(self.config.parallelism));
        let page_failed = Arc::new(AtomicBool::new(false));
        let mut tasks = JoinSet::new();
        let mut cursor: Option<Cursor> = None;
        let mut scan: Result<bool> = Ok(false);

        loop {
            if stop.load(Ordering::SeqCst) {
                scan = Ok(true);
                break;
            }
            if page_failed.load(Ordering::SeqCst) {
                break;
            }

            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    scan = Err(Error::Internal(format!("Replay semaphore closed: {}", e)));
                    break;
                }
            };

            let page = match self
                .records
                .query_ids_and_kinds(
                    ctx.partition_id(),
                    kind,
                    self.config.batch_size,
                    cursor.as_ref(),
                )
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    scan = Err(e);
                    break;
                }
            };

            if !page.items.is_empty() {
                let infos: Vec<PubSubInfo> = page
                    .items
                    .into_iter()
                    .map(|r| PubSubInfo::new(r.id, r.kind, OperationType::Replay))
                    .collect();
                let notifier = self.notifier.clone();
                let page_ctx = ctx.clone();
                let topic = topic.to_string();
                let tx = progress_tx.clone();
                let failed = page_failed.clone();
                tasks.spawn(async move {
                    let outcome = match notifier.publish(&page_ctx, &topic, &infos).await {
                        Ok(_) => PageOutcome::Published(infos.len()),
                        Err(e) => {
                            failed.store(true, Ordering::SeqCst);
                            PageOutcome::Failed(e.to_string())
                        }
                    };
                    // The writer outlives every page task.
                    let _ = tx.send(outcome).await;
                    drop(permit);
                });
            }

            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = joined {
                    page_failed.store(true, Ordering::SeqCst);
                    let _ = progress_tx.send(PageOutcome::Failed(e.to_string())).await;
                }
            }

            cursor = page.cursor;
            if cursor.is_none() {
                break;
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                let _ = progress_tx.send(PageOutcome::Failed(e.to_string())).await;
            }
        }
        drop(progress_tx);

        scan
    }

    /// Sole owner of a run's metadata while pages are in flight.
    ///
    /// Returns the final metadata and the first page error, if any.
    async fn progress_writer(
        replays: Arc<dyn ReplayRepository>,
        event_tx: broadcast::Sender<ReplayEvent>,
        partition_id: String,
        mut meta: ReplayMetaData,
        mut progress_rx: mpsc::Receiver<PageOutcome>,
    ) -> (ReplayMetaData, Option<String>) {
        let mut first_error = None;
        while let Some(outcome) = progress_rx.recv().await {
            match outcome {
                PageOutcome::Published(count) => {
                    meta.processed_records += count as i64;
                    meta.touch_elapsed();
                    if let Err(e) = replays.save(&partition_id, &meta).await {
                        error!(
                            subsystem = "jobs",
                            component = "replay",
                            partition_id = %partition_id,
                            replay_id = %meta.replay_id,
                            processed_records = meta.processed_records,
                            error = %e,
                            "Failed to persist replay progress, status readers see stale counts"
                        );
                    }
                    debug!(
                        subsystem = "jobs",
                        component = "replay",
                        replay_id = %meta.replay_id,
                        processed_records = meta.processed_records,
                        total_records = meta.total_records,
                        "Replay page published"
                    );
                    let _ = event_tx.send(ReplayEvent::Progress {
                        replay_id: meta.replay_id,
                        processed_records: meta.processed_records,
                        total_records: meta.total_records,
                    });
                }
                PageOutcome::Failed(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        (meta, first_error)
    }

    async fn finish(&self, partition_id: &str, mut meta: ReplayMetaData, state: ReplayState) {
        if let Err(e) = meta.transition(state) {
            error!(
                subsystem = "jobs",
                component = "replay",
                replay_id = %meta.replay_id,
                error = %e,
                "Invalid replay state transition"
            );
            return;
        }
        meta.touch_elapsed();
        if let Err(e) = self.replays.save(partition_id, &meta).await {
            error!(
                subsystem = "jobs",
                component = "replay",
                partition_id = %partition_id,
                replay_id = %meta.replay_id,
                error = %e,
                "Failed to persist final replay state"
            );
        }
        let _ = self.event_tx.send(ReplayEvent::Finished {
            replay_id: meta.replay_id,
            state,
        });
    }
}
