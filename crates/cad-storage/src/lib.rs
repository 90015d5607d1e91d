//! Cache storage for Cloud Advisor Digest: per-report storage units, the
//! metadata index, the account name registry and the index lock.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::Context;
use cad_core::{Attachment, LogicalKey, StorageHandle};
use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

pub mod document;
pub mod lock;

pub use document::{
    DocumentBackend, FileBackend, IndexError, MemoryBackend, MetadataIndex, NameRegistry,
    PutOutcome, INDEX_DOCUMENT, NAMES_DOCUMENT,
};
pub use lock::{BackoffPolicy, IndexLock, LockMode, LOCK_FILE};

pub const CRATE_NAME: &str = "cad-storage";

pub const UNITS_DIR: &str = "units";
const STAGING_DIR: &str = ".staging";
const META_FILE: &str = "meta.json";
const BODY_FILE: &str = "body.txt";
const ATTACHMENTS_DIR: &str = "attachments";
const SUMMARIES_DIR: &str = "summaries";
const ITEM_META_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("index lock {} is held by another sync run", .path.display())]
    LockContention { path: PathBuf },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummaryStatus {
    Summarized,
    NotSummarized,
    Failed,
}

impl SummaryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SummaryStatus::Summarized => "summarized",
            SummaryStatus::NotSummarized => "not summarized",
            SummaryStatus::Failed => "summary failed",
        }
    }
}

/// Summarizer output for one attachment, stored next to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentSummary {
    pub filename: String,
    pub status: SummaryStatus,
    #[serde(default)]
    pub summary: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl AttachmentSummary {
    pub fn not_summarized(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            status: SummaryStatus::NotSummarized,
            summary: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentMeta {
    pub filename: String,
    pub stored_name: String,
    pub size: u64,
    pub sha256: String,
}

/// Per-item metadata written into the storage unit beside the body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemMeta {
    pub version: u32,
    pub item_id: String,
    pub key: LogicalKey,
    pub subject: String,
    pub received_at: DateTime<FixedOffset>,
    pub stored_at: DateTime<Utc>,
    #[serde(default)]
    pub attachments: Vec<AttachmentMeta>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredItem {
    pub handle: StorageHandle,
    pub meta: ItemMeta,
    pub raw_body: String,
    pub attachments: Vec<Attachment>,
    pub summaries: Vec<AttachmentSummary>,
}

/// What one `put` call stores: the item plus its attachment summaries.
#[derive(Debug, Clone, Copy)]
pub struct PutRequest<'a> {
    pub key: &'a LogicalKey,
    pub item_id: &'a str,
    pub subject: &'a str,
    pub received_at: DateTime<FixedOffset>,
    pub raw_body: &'a str,
    pub attachments: &'a [Attachment],
    pub summaries: &'a [AttachmentSummary],
    pub stored_at: DateTime<Utc>,
}

/// Hierarchical storage keyed by `(account, date, group)`, one directory per item.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Store rooted at `<cache_root>/units`.
    pub fn under_cache_root(cache_root: impl AsRef<Path>) -> Self {
        Self::new(cache_root.as_ref().join(UNITS_DIR))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn handle_for(key: &LogicalKey, item_id: &str) -> StorageHandle {
        StorageHandle {
            account_id: safe_component(&key.account_id),
            date: key.date,
            group_label: safe_component(&key.group_label),
            item_dir: safe_component(item_id),
        }
    }

    fn unit_dir(&self, account_id: &str, date: NaiveDate, group_label: &str) -> PathBuf {
        self.root
            .join(safe_component(account_id))
            .join(date.format("%Y-%m-%d").to_string())
            .join(safe_component(group_label))
    }

    /// Write one item into its storage unit, replacing any earlier copy of the
    /// same item. The item directory is assembled in a staging area and renamed
    /// into place so readers never see a half-written item.
    pub async fn put(&self, req: PutRequest<'_>) -> anyhow::Result<StorageHandle> {
        let handle = Self::handle_for(req.key, req.item_id);
        let target = self.root.join(handle.relative_path());
        let staged_name = format!("{}.{}", handle.item_dir, Uuid::new_v4());
        let staging = self.root.join(STAGING_DIR).join(&staged_name);

        let result = self.write_staged_item(&staging, &req).await;
        if let Err(err) = result {
            let _ = fs::remove_dir_all(&staging).await;
            return Err(err);
        }

        let unit_dir = target
            .parent()
            .context("storage handle always has a unit directory")?;
        fs::create_dir_all(unit_dir)
            .await
            .with_context(|| format!("creating storage unit {}", unit_dir.display()))?;

        // The earlier copy is moved aside, not deleted, until the new one is in
        // place; a failed swap puts it back.
        let retired = self.root.join(STAGING_DIR).join(format!("{staged_name}.old"));
        let replacing = match fs::rename(&target, &retired).await {
            Ok(()) => {
                debug!(item_id = req.item_id, path = %target.display(), "replacing cached item");
                true
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => false,
            Err(err) => {
                let _ = fs::remove_dir_all(&staging).await;
                return Err(err)
                    .with_context(|| format!("moving aside cached item {}", target.display()));
            }
        };

        if let Err(err) = fs::rename(&staging, &target).await {
            let _ = fs::remove_dir_all(&staging).await;
            if replacing {
                if let Err(restore) = fs::rename(&retired, &target).await {
                    warn!(path = %target.display(), error = %restore, "could not restore earlier copy");
                }
            }
            return Err(err).with_context(|| {
                format!(
                    "moving staged item {} -> {}",
                    staging.display(),
                    target.display()
                )
            });
        }

        if replacing {
            if let Err(err) = fs::remove_dir_all(&retired).await {
                debug!(path = %retired.display(), error = %err, "earlier copy left for pruning");
            }
        }
        Ok(handle)
    }

    async fn write_staged_item(&self, staging: &Path, req: &PutRequest<'_>) -> anyhow::Result<()> {
        let attachments_dir = staging.join(ATTACHMENTS_DIR);
        let summaries_dir = staging.join(SUMMARIES_DIR);
        fs::create_dir_all(&attachments_dir)
            .await
            .with_context(|| format!("creating {}", attachments_dir.display()))?;
        fs::create_dir_all(&summaries_dir)
            .await
            .with_context(|| format!("creating {}", summaries_dir.display()))?;

        write_atomic(&staging.join(BODY_FILE), req.raw_body.as_bytes()).await?;

        let names = stored_attachment_names(req.attachments);
        let mut attachment_meta = Vec::with_capacity(req.attachments.len());
        for (attachment, stored_name) in req.attachments.iter().zip(&names) {
            write_atomic(&attachments_dir.join(stored_name), &attachment.bytes).await?;
            attachment_meta.push(AttachmentMeta {
                filename: attachment.filename.clone(),
                stored_name: stored_name.clone(),
                size: attachment.bytes.len() as u64,
                sha256: Self::sha256_hex(&attachment.bytes),
            });
        }

        for summary in req.summaries {
            let stored_name = attachment_meta
                .iter()
                .find(|m| m.filename == summary.filename)
                .map(|m| m.stored_name.clone())
                .unwrap_or_else(|| safe_component(&summary.filename));
            let bytes =
                serde_json::to_vec_pretty(summary).context("serializing attachment summary")?;
            write_atomic(&summaries_dir.join(format!("{stored_name}.json")), &bytes).await?;
        }

        let meta = ItemMeta {
            version: ITEM_META_VERSION,
            item_id: req.item_id.to_string(),
            key: req.key.clone(),
            subject: req.subject.to_string(),
            received_at: req.received_at,
            stored_at: req.stored_at,
            attachments: attachment_meta,
        };
        let bytes = serde_json::to_vec_pretty(&meta).context("serializing item metadata")?;
        write_atomic(&staging.join(META_FILE), &bytes).await?;
        Ok(())
    }

    pub async fn get(&self, handle: &StorageHandle) -> Result<StoredItem, StorageError> {
        let dir = self.root.join(handle.relative_path());
        if !fs::try_exists(&dir).await? {
            return Err(StorageError::NotFound(format!(
                "cached item {}",
                handle.relative_path().display()
            )));
        }

        let meta = read_meta(&dir).await?;
        let raw_body = fs::read_to_string(dir.join(BODY_FILE))
            .await
            .with_context(|| format!("reading body of {}", dir.display()))?;

        let mut attachments = Vec::with_capacity(meta.attachments.len());
        for attachment in &meta.attachments {
            let path = dir.join(ATTACHMENTS_DIR).join(&attachment.stored_name);
            let bytes = fs::read(&path)
                .await
                .with_context(|| format!("reading attachment {}", path.display()))?;
            attachments.push(Attachment {
                filename: attachment.filename.clone(),
                bytes,
            });
        }
        let summaries = read_summaries(&dir).await?;

        Ok(StoredItem {
            handle: handle.clone(),
            meta,
            raw_body,
            attachments,
            summaries,
        })
    }

    /// Attachment summaries of one cached item.
    pub async fn summaries(
        &self,
        handle: &StorageHandle,
    ) -> Result<Vec<AttachmentSummary>, StorageError> {
        let dir = self.root.join(handle.relative_path());
        if !fs::try_exists(&dir).await? {
            return Err(StorageError::NotFound(format!(
                "cached item {}",
                handle.relative_path().display()
            )));
        }
        Ok(read_summaries(&dir).await?)
    }

    pub async fn list_groups(
        &self,
        account_id: &str,
        date: NaiveDate,
    ) -> anyhow::Result<Vec<String>> {
        let date_dir = self
            .root
            .join(safe_component(account_id))
            .join(date.format("%Y-%m-%d").to_string());
        list_subdirs(&date_dir).await
    }

    /// Dates, ascending, that have a storage unit for `(account, group)`.
    pub async fn list_dates(
        &self,
        account_id: &str,
        group_label: &str,
    ) -> anyhow::Result<Vec<NaiveDate>> {
        let account_dir = self.root.join(safe_component(account_id));
        let group = safe_component(group_label);
        let mut dates = Vec::new();
        for name in list_subdirs(&account_dir).await? {
            let Ok(date) = NaiveDate::parse_from_str(&name, "%Y-%m-%d") else {
                continue;
            };
            if fs::try_exists(account_dir.join(&name).join(&group)).await? {
                dates.push(date);
            }
        }
        dates.sort();
        Ok(dates)
    }

    pub async fn list_accounts(&self) -> anyhow::Result<Vec<String>> {
        list_subdirs(&self.root).await
    }

    /// Metadata of every readable item in one storage unit, ordered by `stored_at`.
    pub async fn list_items(
        &self,
        account_id: &str,
        date: NaiveDate,
        group_label: &str,
    ) -> anyhow::Result<Vec<(StorageHandle, ItemMeta)>> {
        let unit_dir = self.unit_dir(account_id, date, group_label);
        let mut items = Vec::new();
        for item_dir in list_subdirs(&unit_dir).await? {
            let dir = unit_dir.join(&item_dir);
            match read_meta(&dir).await {
                Ok(meta) => items.push((
                    StorageHandle {
                        account_id: safe_component(account_id),
                        date,
                        group_label: safe_component(group_label),
                        item_dir,
                    },
                    meta,
                )),
                Err(err) => warn!(path = %dir.display(), error = %err, "skipping unreadable cached item"),
            }
        }
        items.sort_by(|a, b| a.1.stored_at.cmp(&b.1.stored_at));
        Ok(items)
    }

    /// Remove storage units not modified in the last `older_than_days` days.
    pub async fn prune(&self, older_than_days: u32) -> anyhow::Result<usize> {
        let age = Duration::from_secs(u64::from(older_than_days) * 24 * 60 * 60);
        let cutoff = SystemTime::now()
            .checked_sub(age)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        self.prune_modified_before(cutoff).await
    }

    /// Remove storage units whose modification time is before `cutoff`.
    /// Only directories under the store root are touched.
    pub async fn prune_modified_before(&self, cutoff: SystemTime) -> anyhow::Result<usize> {
        let mut removed = 0usize;
        for account in list_subdirs(&self.root).await? {
            let account_dir = self.root.join(&account);
            for date in list_subdirs(&account_dir).await? {
                let date_dir = account_dir.join(&date);
                for group in list_subdirs(&date_dir).await? {
                    let unit_dir = date_dir.join(&group);
                    let modified = fs::metadata(&unit_dir)
                        .await
                        .and_then(|m| m.modified())
                        .with_context(|| format!("reading mtime of {}", unit_dir.display()))?;
                    if modified < cutoff {
                        fs::remove_dir_all(&unit_dir)
                            .await
                            .with_context(|| format!("pruning {}", unit_dir.display()))?;
                        debug!(unit = %unit_dir.display(), "pruned storage unit");
                        removed += 1;
                    }
                }
                remove_if_empty(&date_dir).await?;
            }
            remove_if_empty(&account_dir).await?;
        }

        let staging = self.root.join(STAGING_DIR);
        for leftover in list_subdirs_including_hidden(&staging).await? {
            let path = staging.join(leftover);
            let stale = fs::metadata(&path)
                .await
                .and_then(|m| m.modified())
                .map(|m| m < cutoff)
                .unwrap_or(false);
            if stale {
                let _ = fs::remove_dir_all(&path).await;
            }
        }

        Ok(removed)
    }
}

/// Write bytes to `path` via a temp file in the same directory and an atomic rename.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    let written = async {
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await
    }
    .await;
    drop(file);
    if let Err(err) = written {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| format!("writing temp file {}", temp_path.display()));
    }

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

/// Map an arbitrary id onto a single safe path component. Values that needed
/// rewriting get a short hash suffix so distinct ids never collide.
pub fn safe_component(raw: &str) -> String {
    let is_safe = |c: char| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.');
    if !raw.is_empty() && raw.len() <= 120 && !raw.starts_with('.') && raw.chars().all(is_safe) {
        return raw.to_string();
    }
    let cleaned: String = raw
        .chars()
        .map(|c| if is_safe(c) { c } else { '_' })
        .take(64)
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    let digest = ArtifactStore::sha256_hex(raw.as_bytes());
    format!("{}-{}", cleaned, &digest[..12])
}

fn stored_attachment_names(attachments: &[Attachment]) -> Vec<String> {
    let mut names: Vec<String> = Vec::with_capacity(attachments.len());
    for (idx, attachment) in attachments.iter().enumerate() {
        let base = safe_component(&attachment.filename);
        let name = if names.contains(&base) {
            format!("{idx}-{base}")
        } else {
            base
        };
        names.push(name);
    }
    names
}

async fn read_meta(dir: &Path) -> anyhow::Result<ItemMeta> {
    let path = dir.join(META_FILE);
    let text = fs::read_to_string(&path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

async fn read_summaries(dir: &Path) -> anyhow::Result<Vec<AttachmentSummary>> {
    let summaries_dir = dir.join(SUMMARIES_DIR);
    let mut out = Vec::new();
    if !fs::try_exists(&summaries_dir).await? {
        return Ok(out);
    }
    let mut names = Vec::new();
    let mut entries = fs::read_dir(&summaries_dir)
        .await
        .with_context(|| format!("reading {}", summaries_dir.display()))?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.ends_with(".json") && !name.starts_with('.') {
            names.push(name);
        }
    }
    names.sort();
    for name in names {
        let path = summaries_dir.join(&name);
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        match serde_json::from_str::<AttachmentSummary>(&text) {
            Ok(summary) => out.push(summary),
            Err(err) => warn!(path = %path.display(), error = %err, "skipping unreadable summary"),
        }
    }
    Ok(out)
}

async fn list_subdirs(dir: &Path) -> anyhow::Result<Vec<String>> {
    let mut names = list_subdirs_including_hidden(dir).await?;
    names.retain(|name| !name.starts_with('.'));
    Ok(names)
}

async fn list_subdirs_including_hidden(dir: &Path) -> anyhow::Result<Vec<String>> {
    let mut names = Vec::new();
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(names),
        Err(err) => return Err(err).with_context(|| format!("reading {}", dir.display())),
    };
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("reading {}", dir.display()))?
    {
        if entry.file_type().await.map(|ft| ft.is_dir()).unwrap_or(false) {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
    }
    names.sort();
    Ok(names)
}

async fn remove_if_empty(dir: &Path) -> anyhow::Result<()> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err).with_context(|| format!("reading {}", dir.display())),
    };
    if entries.next_entry().await?.is_none() {
        let _ = fs::remove_dir(dir).await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cad_core::ReportType;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn key(date: &str, group: &str) -> LogicalKey {
        LogicalKey {
            account_id: "1250000000".into(),
            report_type: ReportType::Risk,
            group_label: group.into(),
            date: date.parse().unwrap(),
        }
    }

    fn received() -> DateTime<FixedOffset> {
        FixedOffset::east_opt(8 * 3600)
            .unwrap()
            .with_ymd_and_hms(2026, 2, 25, 9, 0, 0)
            .single()
            .unwrap()
    }

    fn request<'a>(
        key: &'a LogicalKey,
        item_id: &'a str,
        body: &'a str,
        attachments: &'a [Attachment],
        summaries: &'a [AttachmentSummary],
    ) -> PutRequest<'a> {
        PutRequest {
            key,
            item_id,
            subject: "架构风险治理报告-arch-a",
            received_at: received(),
            raw_body: body,
            attachments,
            summaries,
            stored_at: Utc.with_ymd_and_hms(2026, 2, 25, 1, 5, 0).single().unwrap(),
        }
    }

    #[test]
    fn artifact_hashing_is_stable() {
        let hash = ArtifactStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn unsafe_ids_are_rewritten_without_collisions() {
        assert_eq!(safe_component("4711"), "4711");
        let a = safe_component("<abc@mail.example.com>");
        let b = safe_component("<abc/mail.example.com>");
        assert!(a.starts_with("_abc_mail.example.com_-"));
        assert_ne!(a, b);
        assert!(!safe_component("..").starts_with('.'));
        assert!(!safe_component("").is_empty());
    }

    #[tokio::test]
    async fn put_then_get_round_trips_body_attachments_and_summaries() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::under_cache_root(dir.path());
        let key = key("2026-02-25", "arch-a");
        let attachments = vec![
            Attachment { filename: "risks.xlsx".into(), bytes: b"sheet".to_vec() },
            Attachment { filename: "risks.xlsx".into(), bytes: b"sheet-2".to_vec() },
        ];
        let summaries = vec![AttachmentSummary::not_summarized("risks.xlsx")];

        let handle = store
            .put(request(&key, "<id-1@advisor>", "APPID: 1250000000", &attachments, &summaries))
            .await
            .expect("put");
        let stored = store.get(&handle).await.expect("get");

        assert_eq!(stored.raw_body, "APPID: 1250000000");
        assert_eq!(stored.attachments, attachments);
        assert_eq!(stored.meta.key, key);
        assert_eq!(stored.meta.attachments.len(), 2);
        assert_ne!(
            stored.meta.attachments[0].stored_name,
            stored.meta.attachments[1].stored_name
        );
        assert_eq!(stored.summaries, summaries);
        assert_eq!(
            store.list_groups("1250000000", key.date).await.unwrap(),
            vec!["arch-a".to_string()]
        );
    }

    #[tokio::test]
    async fn put_overwrites_same_item() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::under_cache_root(dir.path());
        let key = key("2026-02-25", "default");

        let first = store.put(request(&key, "7", "old", &[], &[])).await.unwrap();
        let second = store.put(request(&key, "7", "new", &[], &[])).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(store.get(&second).await.unwrap().raw_body, "new");
        assert_eq!(
            store.list_items("1250000000", key.date, "default").await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn replacing_an_item_leaves_nothing_in_staging() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::under_cache_root(dir.path());
        let key = key("2026-02-25", "default");
        let attachment = Attachment {
            filename: "risk.csv".into(),
            bytes: b"old".to_vec(),
        };

        store
            .put(request(&key, "7", "old", &[attachment], &[]))
            .await
            .unwrap();
        let handle = store.put(request(&key, "7", "new", &[], &[])).await.unwrap();

        let item = store.get(&handle).await.unwrap();
        assert_eq!(item.raw_body, "new");
        assert!(item.meta.attachments.is_empty());
        let item_dir = dir.path().join(handle.relative_path());
        assert!(!item_dir.join(ATTACHMENTS_DIR).join("risk.csv").exists());
        let leftovers = list_subdirs_including_hidden(&dir.path().join(STAGING_DIR))
            .await
            .unwrap();
        assert!(leftovers.is_empty(), "staging still holds {leftovers:?}");
    }

    #[tokio::test]
    async fn get_missing_handle_is_not_found() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::under_cache_root(dir.path());
        let handle = ArtifactStore::handle_for(&key("2026-02-25", "default"), "gone");
        assert!(matches!(store.get(&handle).await, Err(StorageError::NotFound(_))));
    }

    #[tokio::test]
    async fn list_dates_is_sorted_and_group_scoped() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::under_cache_root(dir.path());
        for (date, group) in [
            ("2026-02-25", "arch-a"),
            ("2026-02-20", "arch-a"),
            ("2026-02-23", "arch-a"),
            ("2026-02-24", "arch-b"),
        ] {
            let key = key(date, group);
            store.put(request(&key, date, "b", &[], &[])).await.unwrap();
        }

        let dates = store.list_dates("1250000000", "arch-a").await.unwrap();
        let expected: Vec<NaiveDate> = ["2026-02-20", "2026-02-23", "2026-02-25"]
            .iter()
            .map(|d| d.parse().unwrap())
            .collect();
        assert_eq!(dates, expected);
    }

    #[tokio::test]
    async fn prune_only_removes_units_and_leaves_documents() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::under_cache_root(dir.path());
        write_atomic(&dir.path().join(INDEX_DOCUMENT), b"{\"version\":1}")
            .await
            .unwrap();
        write_atomic(&dir.path().join(NAMES_DOCUMENT), b"{\"version\":1}")
            .await
            .unwrap();
        let key = key("2026-02-25", "arch-a");
        store.put(request(&key, "1", "b", &[], &[])).await.unwrap();

        assert_eq!(store.prune(30).await.unwrap(), 0);
        assert_eq!(store.list_accounts().await.unwrap().len(), 1);

        let future = SystemTime::now() + Duration::from_secs(60);
        assert_eq!(store.prune_modified_before(future).await.unwrap(), 1);
        assert!(store.list_accounts().await.unwrap().is_empty());
        assert!(dir.path().join(INDEX_DOCUMENT).exists());
        assert!(dir.path().join(NAMES_DOCUMENT).exists());
    }

    #[tokio::test]
    async fn atomic_write_replaces_existing_file() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("doc.json");
        write_atomic(&path, b"one").await.unwrap();
        write_atomic(&path, b"two").await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"two");
        let leftovers = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .map(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
                    .unwrap_or(false)
            })
            .count();
        assert_eq!(leftovers, 0);
    }
}
