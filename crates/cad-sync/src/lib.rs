//! Sync engine: fetch advisory mail, dedup against the metadata index, cache
//! bodies and attachments, and keep the name registry current.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use cad_adapters::{
    AdapterError, CommandMailSource, CommandSummarizer, FixtureMailbox, MailSource, NoopSummarizer, Summarizer,
    DEFAULT_SENDER,
};
use cad_core::{
    extract, Attachment, DegradedField, Envelope, IndexEntry, LogicalKey, ReportTypeRules,
};
use cad_storage::{
    safe_component, ArtifactStore, AttachmentSummary, BackoffPolicy, DocumentBackend,
    FileBackend, IndexError, IndexLock, LockMode, MetadataIndex, NameRegistry, PutOutcome,
    PutRequest, StorageError, SummaryStatus, LOCK_FILE,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cad-sync";

/// Scratch directory under the cache root for attachment downloads.
pub const TMP_DIR: &str = "tmp";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub cache_root: PathBuf,
    pub sender: String,
    pub lookback_hours: u32,
    pub lock_mode: LockMode,
    pub fetch_timeout_secs: u64,
    pub mailbox_fixture: Option<PathBuf>,
    /// Command-backed mail source; wins over `mailbox_fixture`.
    pub mail_cmd: Option<String>,
    pub summarizer_cmd: Option<String>,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub rules_file: Option<PathBuf>,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let lock_timeout_secs = non_empty("CAD_LOCK_TIMEOUT_SECS")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(30);
        let lock_mode = match non_empty("CAD_LOCK_MODE").as_deref().map(str::trim) {
            Some("fail-fast" | "fail_fast" | "failfast") => LockMode::FailFast,
            _ => LockMode::Wait(Duration::from_secs(lock_timeout_secs)),
        };

        Self {
            cache_root: non_empty("CAD_CACHE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/cache")),
            sender: non_empty("CAD_SENDER").unwrap_or_else(|| DEFAULT_SENDER.to_string()),
            lookback_hours: non_empty("CAD_LOOKBACK_HOURS")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(24),
            lock_mode,
            fetch_timeout_secs: non_empty("CAD_FETCH_TIMEOUT_SECS")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(120),
            mailbox_fixture: non_empty("CAD_MAILBOX_FIXTURE").map(PathBuf::from),
            mail_cmd: non_empty("CAD_MAIL_CMD"),
            summarizer_cmd: non_empty("CAD_SUMMARIZER_CMD"),
            scheduler_enabled: non_empty("CAD_SCHEDULER_ENABLED")
                .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: non_empty("CAD_SYNC_CRON").unwrap_or_else(|| "0 0 8 * * *".to_string()),
            rules_file: non_empty("CAD_RULES_FILE").map(PathBuf::from),
        }
    }
}

/// Per-run knobs, usually from CLI flags.
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Overrides the configured lookback window.
    pub lookback_hours: Option<u32>,
    /// Absolute window start; takes precedence over any lookback.
    pub since: Option<DateTime<Utc>>,
    pub dry_run: bool,
    pub force_refresh: bool,
    pub account: Option<String>,
}

impl SyncOptions {
    pub fn window_start(&self, now: DateTime<Utc>, default_lookback_hours: u32) -> DateTime<Utc> {
        if let Some(since) = self.since {
            return since;
        }
        let hours = self.lookback_hours.unwrap_or(default_lookback_hours);
        now - chrono::Duration::hours(i64::from(hours))
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("{collaborator} unavailable: {reason}")]
    CollaboratorUnavailable {
        collaborator: String,
        reason: String,
    },
    #[error("another sync run holds {}", .path.display())]
    LockContention { path: PathBuf },
    #[error(transparent)]
    Storage(StorageError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<StorageError> for SyncError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::LockContention { path } => SyncError::LockContention { path },
            other => SyncError::Storage(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ItemOutcome {
    Stored,
    /// Re-ingested an already cached item (force refresh or degraded retry).
    Refreshed,
    Superseded { previous_item_id: String },
    Duplicate,
    /// Recorded without a storage pointer.
    Degraded,
    Conflict,
    FilteredOut,
    /// Dry run: would have been stored.
    WouldStore,
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemReport {
    pub item_id: String,
    pub subject: String,
    pub key: Option<LogicalKey>,
    pub outcome: ItemOutcome,
}

impl ItemReport {
    fn new(envelope: &Envelope, key: Option<LogicalKey>, outcome: ItemOutcome) -> Self {
        Self {
            item_id: envelope.id.clone(),
            subject: envelope.subject.clone(),
            key,
            outcome,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub window_start: DateTime<Utc>,
    pub dry_run: bool,
    pub candidates: usize,
    pub stored: usize,
    pub duplicates: usize,
    pub degraded: usize,
    pub conflicts: usize,
    pub filtered: usize,
    pub names_registered: usize,
    pub items: Vec<ItemReport>,
}

impl SyncRunSummary {
    fn new(run_id: Uuid, started_at: DateTime<Utc>, window_start: DateTime<Utc>, dry_run: bool) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: started_at,
            window_start,
            dry_run,
            candidates: 0,
            stored: 0,
            duplicates: 0,
            degraded: 0,
            conflicts: 0,
            filtered: 0,
            names_registered: 0,
            items: Vec::new(),
        }
    }

    fn record(&mut self, report: ItemReport) {
        match report.outcome {
            ItemOutcome::Stored
            | ItemOutcome::Refreshed
            | ItemOutcome::Superseded { .. }
            | ItemOutcome::WouldStore => self.stored += 1,
            ItemOutcome::Duplicate => self.duplicates += 1,
            ItemOutcome::Degraded => self.degraded += 1,
            ItemOutcome::Conflict => self.conflicts += 1,
            ItemOutcome::FilteredOut => self.filtered += 1,
        }
        self.items.push(report);
    }

    pub fn headline(&self) -> String {
        format!(
            "sync {}{}: {} candidates, {} stored, {} duplicates, {} degraded, {} conflicts, {} filtered, {} names registered",
            self.run_id,
            if self.dry_run { " (dry run)" } else { "" },
            self.candidates,
            self.stored,
            self.duplicates,
            self.degraded,
            self.conflicts,
            self.filtered,
            self.names_registered
        )
    }
}

/// The only writer of the artifact store, metadata index and name registry.
pub struct SyncEngine {
    config: SyncConfig,
    mail: Arc<dyn MailSource>,
    summarizer: Arc<dyn Summarizer>,
    rules: ReportTypeRules,
    store: ArtifactStore,
    documents: Arc<dyn DocumentBackend>,
    backoff: BackoffPolicy,
}

impl SyncEngine {
    pub fn new(
        config: SyncConfig,
        mail: Arc<dyn MailSource>,
        summarizer: Arc<dyn Summarizer>,
    ) -> Self {
        let store = ArtifactStore::under_cache_root(&config.cache_root);
        let documents: Arc<dyn DocumentBackend> =
            Arc::new(FileBackend::new(config.cache_root.clone()));
        Self {
            config,
            mail,
            summarizer,
            rules: ReportTypeRules::default(),
            store,
            documents,
            backoff: BackoffPolicy::default(),
        }
    }

    /// Wire collaborators from configuration: the mail command or mailbox
    /// fixture, the optional summarizer command and the optional rules file.
    pub fn from_config(config: SyncConfig) -> anyhow::Result<Self> {
        let timeout = Duration::from_secs(config.fetch_timeout_secs);
        let mail: Arc<dyn MailSource> = match (
            config
                .mail_cmd
                .as_deref()
                .and_then(|line| CommandMailSource::from_command_line(line, timeout)),
            &config.mailbox_fixture,
        ) {
            (Some(command), _) => {
                info!(program = command.name(), "using command mail source");
                Arc::new(command)
            }
            (None, Some(fixture)) => Arc::new(FixtureMailbox::load(fixture)?),
            (None, None) => anyhow::bail!(
                "no mail source configured; set CAD_MAIL_CMD to a mail command or CAD_MAILBOX_FIXTURE to a mailbox bundle"
            ),
        };

        let summarizer: Arc<dyn Summarizer> = match config
            .summarizer_cmd
            .as_deref()
            .and_then(|line| CommandSummarizer::from_command_line(line, timeout))
        {
            Some(command) => Arc::new(command),
            None => Arc::new(NoopSummarizer),
        };

        let rules = match &config.rules_file {
            Some(path) => ReportTypeRules::from_yaml_file(path)
                .with_context(|| format!("loading classification rules {}", path.display()))?,
            None => ReportTypeRules::default(),
        };

        Ok(Self::new(config, mail, summarizer).with_rules(rules))
    }

    pub fn with_rules(mut self, rules: ReportTypeRules) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_document_backend(mut self, documents: Arc<dyn DocumentBackend>) -> Self {
        self.documents = documents;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn documents(&self) -> Arc<dyn DocumentBackend> {
        Arc::clone(&self.documents)
    }

    pub async fn run_once(&self, options: &SyncOptions) -> Result<SyncRunSummary, SyncError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id, dry_run = options.dry_run, mail = self.mail.name());
        self.run_batch(run_id, options).instrument(span).await
    }

    async fn run_batch(
        &self,
        run_id: Uuid,
        options: &SyncOptions,
    ) -> Result<SyncRunSummary, SyncError> {
        let started_at = Utc::now();
        let _lock = if options.dry_run {
            None
        } else {
            Some(
                IndexLock::acquire(
                    self.config.cache_root.join(LOCK_FILE),
                    self.config.lock_mode,
                    self.backoff,
                )
                .await?,
            )
        };

        let mut index = MetadataIndex::load(Arc::clone(&self.documents)).await?;
        let mut registry = NameRegistry::load(Arc::clone(&self.documents)).await?;

        let window_start = options.window_start(started_at, self.config.lookback_hours);
        let envelopes = self.fetch_candidates(window_start).await?;
        info!(candidates = envelopes.len(), %window_start, "fetched candidates");

        let mut summary = SyncRunSummary::new(run_id, started_at, window_start, options.dry_run);
        summary.candidates = envelopes.len();
        let scratch = self
            .config
            .cache_root
            .join(TMP_DIR)
            .join(run_id.to_string());
        let mut names_registered = 0;

        for envelope in &envelopes {
            let report = self
                .process_envelope(
                    envelope,
                    options,
                    &mut index,
                    &mut registry,
                    &scratch,
                    &mut names_registered,
                )
                .await?;
            summary.record(report);
        }
        summary.names_registered = names_registered;

        if !options.dry_run {
            index.mark_synced(started_at);
            index.commit().await?;
            if let Err(err) = tokio::fs::remove_dir_all(&scratch).await {
                if err.kind() != std::io::ErrorKind::NotFound {
                    debug!(path = %scratch.display(), error = %err, "could not remove scratch dir");
                }
            }
        }

        summary.finished_at = Utc::now();
        info!(
            stored = summary.stored,
            duplicates = summary.duplicates,
            degraded = summary.degraded,
            conflicts = summary.conflicts,
            "sync run finished"
        );
        Ok(summary)
    }

    async fn fetch_candidates(&self, since: DateTime<Utc>) -> Result<Vec<Envelope>, SyncError> {
        let timeout = Duration::from_secs(self.config.fetch_timeout_secs);
        let listing = self.mail.list_envelopes(&self.config.sender, since);
        match tokio::time::timeout(timeout, listing).await {
            Ok(Ok(envelopes)) => Ok(envelopes),
            Ok(Err(err)) => Err(SyncError::CollaboratorUnavailable {
                collaborator: self.mail.name().to_string(),
                reason: err.to_string(),
            }),
            Err(_) => Err(SyncError::CollaboratorUnavailable {
                collaborator: self.mail.name().to_string(),
                reason: format!("listing timed out after {}s", timeout.as_secs()),
            }),
        }
    }

    async fn process_envelope(
        &self,
        envelope: &Envelope,
        options: &SyncOptions,
        index: &mut MetadataIndex,
        registry: &mut NameRegistry,
        scratch: &Path,
        names_registered: &mut usize,
    ) -> Result<ItemReport, SyncError> {
        let existing = index.get(&envelope.id).cloned();
        let retry = existing.as_ref().is_some_and(IndexEntry::is_degraded);
        if let Some(existing) = &existing {
            if !retry && !options.force_refresh {
                debug!(item_id = %envelope.id, key = %existing.key, "already cached; skipping");
                return Ok(ItemReport::new(
                    envelope,
                    Some(existing.key.clone()),
                    ItemOutcome::Duplicate,
                ));
            }
        }

        let body = match self.mail.read_body(&envelope.id).await {
            Ok(body) => Some(body),
            Err(err) => {
                warn!(item_id = %envelope.id, error = %err, "could not read body");
                None
            }
        };
        let extraction = extract(
            &self.rules,
            &envelope.subject,
            body.as_deref().unwrap_or_default(),
            envelope.date,
        );
        let key = extraction.key.clone();

        if let Some(account) = &options.account {
            if &key.account_id != account {
                return Ok(ItemReport::new(envelope, Some(key), ItemOutcome::FilteredOut));
            }
        }

        if let Some(existing) = &existing {
            if existing.item_id == envelope.id && !existing.is_degraded() && existing.key != key {
                warn!(
                    item_id = %envelope.id,
                    existing = %existing.key,
                    incoming = %key,
                    "logical key changed for a cached item; keeping original"
                );
                return Ok(ItemReport::new(envelope, Some(key), ItemOutcome::Conflict));
            }
        }

        if options.dry_run {
            return Ok(ItemReport::new(envelope, Some(key), ItemOutcome::WouldStore));
        }

        let mut degraded = extraction.degraded.clone();

        let storage = match &body {
            None => {
                degraded.push(DegradedField::Body);
                None
            }
            Some(body) => {
                let dest = scratch.join(safe_component(&envelope.id));
                let (attachments, summaries, attachments_failed) =
                    self.collect_attachments(envelope, &dest).await;
                if attachments_failed {
                    degraded.push(DegradedField::Attachments);
                }
                let request = PutRequest {
                    key: &key,
                    item_id: &envelope.id,
                    subject: &envelope.subject,
                    received_at: envelope.date,
                    raw_body: body,
                    attachments: &attachments,
                    summaries: &summaries,
                    stored_at: Utc::now(),
                };
                match self.store.put(request).await {
                    Ok(handle) => Some(handle),
                    Err(err) => {
                        warn!(item_id = %envelope.id, error = %err, "could not write storage unit");
                        degraded.push(DegradedField::Storage);
                        None
                    }
                }
            }
        };

        let stored = storage.is_some();
        let entry = IndexEntry {
            item_id: envelope.id.clone(),
            key: key.clone(),
            subject: envelope.subject.clone(),
            received_at: envelope.date,
            cached_at: Utc::now(),
            storage,
            degraded,
            aliases: Vec::new(),
        };

        let outcome = match index.put(entry) {
            Ok(_) if !stored => {
                warn!(item_id = %envelope.id, key = %key, "recorded degraded entry");
                ItemOutcome::Degraded
            }
            Ok(PutOutcome::Inserted) => {
                info!(item_id = %envelope.id, key = %key, "cached item");
                ItemOutcome::Stored
            }
            Ok(PutOutcome::Updated) => {
                info!(item_id = %envelope.id, key = %key, "refreshed cached item");
                ItemOutcome::Refreshed
            }
            Ok(PutOutcome::Superseded { previous_item_id }) => {
                info!(item_id = %envelope.id, %previous_item_id, key = %key, "superseded earlier copy");
                ItemOutcome::Superseded { previous_item_id }
            }
            Err(err @ IndexError::Conflict { .. }) => {
                warn!(item_id = %envelope.id, error = %err, "index conflict; keeping original");
                ItemOutcome::Conflict
            }
        };
        // The name goes in before the entry so an aborted run never leaves a
        // cached item whose account was not registered.
        if let Some(display_name) = &extraction.display_name {
            if registry.register_if_absent(&key.account_id, display_name) {
                registry.commit().await?;
                info!(account_id = %key.account_id, %display_name, "registered account name");
                *names_registered += 1;
            }
        }
        index.commit().await?;

        Ok(ItemReport::new(envelope, Some(key), outcome))
    }

    /// Download, read and summarize one message's attachments. The flag is set
    /// when any attachment could not be retrieved.
    async fn collect_attachments(
        &self,
        envelope: &Envelope,
        dest: &Path,
    ) -> (Vec<Attachment>, Vec<AttachmentSummary>, bool) {
        if !envelope.has_attachment {
            return (Vec::new(), Vec::new(), false);
        }
        let files = match self.mail.download_attachments(&envelope.id, dest).await {
            Ok(files) => files,
            Err(err) => {
                warn!(item_id = %envelope.id, error = %err, "could not download attachments");
                return (Vec::new(), Vec::new(), true);
            }
        };

        let mut attachments = Vec::with_capacity(files.len());
        let mut summaries = Vec::with_capacity(files.len());
        let mut failed = false;
        for path in files {
            let filename = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "attachment".to_string());
            match tokio::fs::read(&path).await {
                Ok(bytes) => attachments.push(Attachment {
                    filename: filename.clone(),
                    bytes,
                }),
                Err(err) => {
                    warn!(item_id = %envelope.id, path = %path.display(), error = %err, "could not read attachment");
                    failed = true;
                    continue;
                }
            }
            summaries.push(self.summarize(&path, filename).await);
        }
        let _ = tokio::fs::remove_dir_all(dest).await;
        (attachments, summaries, failed)
    }

    async fn summarize(&self, path: &Path, filename: String) -> AttachmentSummary {
        match self.summarizer.summarize(path).await {
            Ok(value) => AttachmentSummary {
                filename,
                status: SummaryStatus::Summarized,
                summary: Some(value),
                error: None,
            },
            Err(AdapterError::Unavailable(reason)) => {
                debug!(%filename, %reason, "attachment not summarized");
                AttachmentSummary::not_summarized(filename)
            }
            Err(err) => {
                warn!(%filename, error = %err, "summarizer failed");
                AttachmentSummary {
                    filename,
                    status: SummaryStatus::Failed,
                    summary: None,
                    error: Some(err.to_string()),
                }
            }
        }
    }

    /// Cron-driven sync loop, or `None` when the scheduler is disabled.
    pub async fn maybe_build_scheduler(
        self: &Arc<Self>,
        options: SyncOptions,
    ) -> anyhow::Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.sync_cron.clone();
        let engine = Arc::clone(self);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let engine = Arc::clone(&engine);
            let options = options.clone();
            Box::pin(async move {
                match engine.run_once(&options).await {
                    Ok(summary) => info!(run_id = %summary.run_id, stored = summary.stored, "scheduled sync finished"),
                    Err(err) => error!(error = %err, "scheduled sync failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

pub async fn run_sync_once_from_env(options: &SyncOptions) -> anyhow::Result<SyncRunSummary> {
    let engine = SyncEngine::from_config(SyncConfig::from_env())?;
    Ok(engine.run_once(options).await?)
}
