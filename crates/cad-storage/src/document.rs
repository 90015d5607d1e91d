//! Durable JSON documents: the metadata index and the account name registry.
//!
//! Both are loaded whole, mutated in memory and committed with a full atomic
//! replace through a [`DocumentBackend`]. Readers only ever observe committed
//! documents.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use cad_core::{IndexEntry, LogicalKey, UNKNOWN_ACCOUNT};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::write_atomic;

pub const INDEX_DOCUMENT: &str = "index.json";
pub const NAMES_DOCUMENT: &str = "account_names.json";
const SCHEMA_VERSION: u32 = 1;

/// Where whole documents live. Writes must replace the previous version atomically.
#[async_trait]
pub trait DocumentBackend: Send + Sync {
    async fn load(&self, name: &str) -> anyhow::Result<Option<Vec<u8>>>;
    async fn store(&self, name: &str, bytes: &[u8]) -> anyhow::Result<()>;
}

/// Documents as files directly under the cache root.
#[derive(Debug, Clone)]
pub struct FileBackend {
    root: PathBuf,
}

impl FileBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl DocumentBackend for FileBackend {
    async fn load(&self, name: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let path = self.root.join(name);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
        }
    }

    async fn store(&self, name: &str, bytes: &[u8]) -> anyhow::Result<()> {
        write_atomic(&self.root.join(name), bytes).await
    }
}

#[derive(Debug, Default)]
pub struct MemoryBackend {
    docs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentBackend for MemoryBackend {
    async fn load(&self, name: &str) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.docs.lock().await.get(name).cloned())
    }

    async fn store(&self, name: &str, bytes: &[u8]) -> anyhow::Result<()> {
        self.docs.lock().await.insert(name.to_string(), bytes.to_vec());
        Ok(())
    }
}

fn schema_version() -> u32 {
    SCHEMA_VERSION
}

async fn load_document<T>(backend: &dyn DocumentBackend, name: &str) -> anyhow::Result<Option<T>>
where
    T: for<'de> Deserialize<'de>,
{
    match backend.load(name).await? {
        Some(bytes) => {
            let doc = serde_json::from_slice(&bytes).with_context(|| format!("parsing {name}"))?;
            Ok(Some(doc))
        }
        None => Ok(None),
    }
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("item {item_id} is indexed as {existing}; refusing to re-key it as {incoming}")]
    Conflict {
        item_id: String,
        existing: Box<LogicalKey>,
        incoming: Box<LogicalKey>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutOutcome {
    Inserted,
    /// The same item id was written again with the same logical key.
    Updated,
    /// A differently-identified copy of the same report (same key and subject) was replaced.
    Superseded { previous_item_id: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexDocument {
    #[serde(default = "schema_version")]
    version: u32,
    #[serde(default)]
    last_sync: Option<DateTime<Utc>>,
    #[serde(default)]
    entries: BTreeMap<String, IndexEntry>,
    /// Fields written by other versions, carried through commits untouched.
    #[serde(flatten)]
    extra: BTreeMap<String, serde_json::Value>,
}

impl Default for IndexDocument {
    fn default() -> Self {
        Self {
            version: SCHEMA_VERSION,
            last_sync: None,
            entries: BTreeMap::new(),
            extra: BTreeMap::new(),
        }
    }
}

/// Item id -> extraction metadata, with at most one entry per item.
pub struct MetadataIndex {
    backend: Arc<dyn DocumentBackend>,
    doc: IndexDocument,
    dirty: bool,
}

impl MetadataIndex {
    pub async fn load(backend: Arc<dyn DocumentBackend>) -> anyhow::Result<Self> {
        let doc = load_document::<IndexDocument>(backend.as_ref(), INDEX_DOCUMENT)
            .await?
            .unwrap_or_default();
        Ok(Self {
            backend,
            doc,
            dirty: false,
        })
    }

    pub fn len(&self) -> usize {
        self.doc.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.doc.entries.is_empty()
    }

    /// True when `item_id` is indexed directly or as an alias of a superseding entry.
    pub fn has(&self, item_id: &str) -> bool {
        self.get(item_id).is_some()
    }

    pub fn get(&self, item_id: &str) -> Option<&IndexEntry> {
        self.doc.entries.get(item_id).or_else(|| {
            self.doc
                .entries
                .values()
                .find(|e| e.aliases.iter().any(|a| a == item_id))
        })
    }

    pub fn entries(&self) -> impl Iterator<Item = &IndexEntry> {
        self.doc.entries.values()
    }

    pub fn put(&mut self, entry: IndexEntry) -> Result<PutOutcome, IndexError> {
        if let Some(existing) = self.doc.entries.get(&entry.item_id) {
            // Degraded entries carry sentinel keys, so a retry may re-key them.
            if existing.key != entry.key && !existing.is_degraded() {
                return Err(IndexError::Conflict {
                    item_id: entry.item_id.clone(),
                    existing: Box::new(existing.key.clone()),
                    incoming: Box::new(entry.key.clone()),
                });
            }
            let mut entry = entry;
            for alias in &existing.aliases {
                if !entry.aliases.contains(alias) {
                    entry.aliases.push(alias.clone());
                }
            }
            self.doc.entries.insert(entry.item_id.clone(), entry);
            self.dirty = true;
            return Ok(PutOutcome::Updated);
        }

        let previous_id = self
            .doc
            .entries
            .values()
            .find(|e| e.key == entry.key && e.subject == entry.subject)
            .map(|e| e.item_id.clone());

        let outcome = match previous_id.and_then(|id| self.doc.entries.remove(&id)) {
            Some(previous) => {
                let mut entry = entry;
                for alias in previous.aliases.iter().chain(std::iter::once(&previous.item_id)) {
                    if alias != &entry.item_id && !entry.aliases.contains(alias) {
                        entry.aliases.push(alias.clone());
                    }
                }
                let previous_item_id = previous.item_id;
                self.doc.entries.insert(entry.item_id.clone(), entry);
                PutOutcome::Superseded { previous_item_id }
            }
            None => {
                self.doc.entries.insert(entry.item_id.clone(), entry);
                PutOutcome::Inserted
            }
        };
        self.dirty = true;
        Ok(outcome)
    }

    /// Entries for one logical key, oldest `cached_at` first.
    pub fn query_by_key(&self, key: &LogicalKey) -> Vec<&IndexEntry> {
        let mut found: Vec<&IndexEntry> =
            self.doc.entries.values().filter(|e| &e.key == key).collect();
        found.sort_by(|a, b| {
            a.cached_at
                .cmp(&b.cached_at)
                .then_with(|| a.item_id.cmp(&b.item_id))
        });
        found
    }

    /// Entries whose logical date is `date`, optionally for one account,
    /// ordered by account, report type, group and `cached_at`.
    pub fn query_by_date(&self, date: NaiveDate, account_id: Option<&str>) -> Vec<&IndexEntry> {
        let mut found: Vec<&IndexEntry> = self
            .doc
            .entries
            .values()
            .filter(|e| e.key.date == date)
            .filter(|e| account_id.is_none_or(|a| e.key.account_id == a))
            .collect();
        found.sort_by(|a, b| {
            a.key
                .cmp(&b.key)
                .then_with(|| a.cached_at.cmp(&b.cached_at))
                .then_with(|| a.item_id.cmp(&b.item_id))
        });
        found
    }

    /// Most recent logical date present in the index, if any.
    pub fn latest_date(&self) -> Option<NaiveDate> {
        self.doc.entries.values().map(|e| e.key.date).max()
    }

    pub fn last_sync_timestamp(&self) -> Option<DateTime<Utc>> {
        self.doc.last_sync
    }

    pub fn mark_synced(&mut self, at: DateTime<Utc>) {
        self.doc.last_sync = Some(at);
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Persist pending mutations as one atomic document replace.
    pub async fn commit(&mut self) -> anyhow::Result<()> {
        if !self.dirty {
            return Ok(());
        }
        self.doc.version = self.doc.version.max(SCHEMA_VERSION);
        let bytes = serde_json::to_vec_pretty(&self.doc).context("serializing metadata index")?;
        self.backend.store(INDEX_DOCUMENT, &bytes).await?;
        self.dirty = false;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RegistryDocument {
    #[serde(default = "schema_version")]
    version: u32,
    #[serde(default)]
    accounts: BTreeMap<String, String>,
    #[serde(flatten)]
    extra: BTreeMap<String, serde_json::Value>,
}

impl Default for RegistryDocument {
    fn default() -> Self {
        Self {
            version: SCHEMA_VERSION,
            accounts: BTreeMap::new(),
            extra: BTreeMap::new(),
        }
    }
}

/// Account id -> display name. Automatic registration never overwrites.
pub struct NameRegistry {
    backend: Arc<dyn DocumentBackend>,
    doc: RegistryDocument,
    dirty: bool,
}

impl NameRegistry {
    pub async fn load(backend: Arc<dyn DocumentBackend>) -> anyhow::Result<Self> {
        let doc = load_document::<RegistryDocument>(backend.as_ref(), NAMES_DOCUMENT)
            .await?
            .unwrap_or_default();
        Ok(Self {
            backend,
            doc,
            dirty: false,
        })
    }

    pub fn get(&self, account_id: &str) -> Option<&str> {
        self.doc.accounts.get(account_id).map(String::as_str)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.doc
            .accounts
            .iter()
            .map(|(id, name)| (id.as_str(), name.as_str()))
    }

    /// Display label for reports: the registered name, or the account id.
    pub fn label(&self, account_id: &str) -> String {
        match self.get(account_id) {
            Some(name) => format!("{name} ({account_id})"),
            None => account_id.to_string(),
        }
    }

    /// Record an extracted name unless a mapping already exists. Returns
    /// whether the registry changed.
    pub fn register_if_absent(&mut self, account_id: &str, display_name: &str) -> bool {
        let display_name = display_name.trim();
        if display_name.is_empty() || account_id == UNKNOWN_ACCOUNT {
            return false;
        }
        if self.doc.accounts.contains_key(account_id) {
            return false;
        }
        self.doc
            .accounts
            .insert(account_id.to_string(), display_name.to_string());
        self.dirty = true;
        true
    }

    /// Explicit operator edit; replaces any existing value.
    pub fn set_manual(&mut self, account_id: &str, display_name: &str) {
        self.doc
            .accounts
            .insert(account_id.to_string(), display_name.trim().to_string());
        self.dirty = true;
    }

    pub async fn commit(&mut self) -> anyhow::Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let bytes = serde_json::to_vec_pretty(&self.doc).context("serializing name registry")?;
        self.backend.store(NAMES_DOCUMENT, &bytes).await?;
        self.dirty = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cad_core::{DegradedField, ReportType, StorageHandle};
    use chrono::{FixedOffset, TimeZone};

    fn key(date: &str) -> LogicalKey {
        LogicalKey {
            account_id: "100".into(),
            report_type: ReportType::Risk,
            group_label: "arch-a".into(),
            date: date.parse().unwrap(),
        }
    }

    fn entry(item_id: &str, key: LogicalKey, subject: &str, minute: u32) -> IndexEntry {
        IndexEntry {
            item_id: item_id.into(),
            subject: subject.into(),
            received_at: FixedOffset::east_opt(8 * 3600)
                .unwrap()
                .with_ymd_and_hms(2026, 2, 25, 9, 0, 0)
                .single()
                .unwrap(),
            cached_at: Utc.with_ymd_and_hms(2026, 2, 25, 2, minute, 0).single().unwrap(),
            storage: Some(StorageHandle {
                account_id: key.account_id.clone(),
                date: key.date,
                group_label: key.group_label.clone(),
                item_dir: item_id.into(),
            }),
            key,
            degraded: Vec::new(),
            aliases: Vec::new(),
        }
    }

    #[tokio::test]
    async fn put_conflicting_key_keeps_original() {
        let backend: Arc<dyn DocumentBackend> = Arc::new(MemoryBackend::new());
        let mut index = MetadataIndex::load(backend).await.unwrap();

        let original = entry("1", key("2026-02-25"), "a", 0);
        assert_eq!(index.put(original.clone()).unwrap(), PutOutcome::Inserted);

        let err = index.put(entry("1", key("2026-02-26"), "a", 1)).unwrap_err();
        assert!(matches!(err, IndexError::Conflict { .. }));
        assert_eq!(index.get("1"), Some(&original));

        let mut refreshed = entry("1", key("2026-02-25"), "a", 5);
        refreshed.degraded = vec![DegradedField::Attachments];
        assert_eq!(index.put(refreshed.clone()).unwrap(), PutOutcome::Updated);
        assert_eq!(index.len(), 1);
    }

    #[tokio::test]
    async fn degraded_entry_can_be_rekeyed_by_retry() {
        let backend: Arc<dyn DocumentBackend> = Arc::new(MemoryBackend::new());
        let mut index = MetadataIndex::load(backend).await.unwrap();

        let mut degraded = entry("1", key("2026-02-25"), "a", 0);
        degraded.key.account_id = UNKNOWN_ACCOUNT.into();
        degraded.storage = None;
        degraded.degraded = vec![DegradedField::Body, DegradedField::AccountId];
        index.put(degraded).unwrap();

        let retried = entry("1", key("2026-02-25"), "a", 3);
        assert_eq!(index.put(retried.clone()).unwrap(), PutOutcome::Updated);
        assert_eq!(index.get("1"), Some(&retried));
    }

    #[tokio::test]
    async fn same_key_and_subject_supersedes_without_duplicating() {
        let backend: Arc<dyn DocumentBackend> = Arc::new(MemoryBackend::new());
        let mut index = MetadataIndex::load(backend).await.unwrap();

        index.put(entry("old", key("2026-02-25"), "risk report", 0)).unwrap();
        let outcome = index.put(entry("new", key("2026-02-25"), "risk report", 9)).unwrap();

        assert_eq!(
            outcome,
            PutOutcome::Superseded {
                previous_item_id: "old".into()
            }
        );
        assert_eq!(index.len(), 1);
        assert!(index.has("old"));
        assert_eq!(index.get("old").unwrap().item_id, "new");
        assert_eq!(index.query_by_key(&key("2026-02-25")).len(), 1);
    }

    #[tokio::test]
    async fn query_by_key_orders_by_cached_at() {
        let backend: Arc<dyn DocumentBackend> = Arc::new(MemoryBackend::new());
        let mut index = MetadataIndex::load(backend).await.unwrap();
        index.put(entry("b", key("2026-02-25"), "second", 30)).unwrap();
        index.put(entry("a", key("2026-02-25"), "first", 10)).unwrap();
        index.put(entry("c", key("2026-02-24"), "other day", 5)).unwrap();

        let ids: Vec<&str> = index
            .query_by_key(&key("2026-02-25"))
            .iter()
            .map(|e| e.item_id.as_str())
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(index.query_by_date(key("2026-02-24").date, Some("100")).len(), 1);
        assert!(index.query_by_date(key("2026-02-24").date, Some("999")).is_empty());
    }

    #[tokio::test]
    async fn commit_persists_and_reload_tolerates_unknown_fields() {
        let backend: Arc<dyn DocumentBackend> = Arc::new(MemoryBackend::new());
        let mut index = MetadataIndex::load(backend.clone()).await.unwrap();
        index.put(entry("1", key("2026-02-25"), "a", 0)).unwrap();
        let synced = Utc.with_ymd_and_hms(2026, 2, 25, 3, 0, 0).single().unwrap();
        index.mark_synced(synced);
        index.commit().await.unwrap();
        assert!(!index.is_dirty());

        let mut raw: serde_json::Value =
            serde_json::from_slice(&backend.load(INDEX_DOCUMENT).await.unwrap().unwrap()).unwrap();
        raw["written_by"] = serde_json::json!("cad 9.0");
        raw["version"] = serde_json::json!(2);
        backend
            .store(INDEX_DOCUMENT, &serde_json::to_vec(&raw).unwrap())
            .await
            .unwrap();

        let mut reloaded = MetadataIndex::load(backend.clone()).await.unwrap();
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.last_sync_timestamp(), Some(synced));

        reloaded.put(entry("2", key("2026-02-26"), "b", 0)).unwrap();
        reloaded.commit().await.unwrap();
        let rewritten: serde_json::Value =
            serde_json::from_slice(&backend.load(INDEX_DOCUMENT).await.unwrap().unwrap()).unwrap();
        assert_eq!(rewritten["written_by"], "cad 9.0");
        assert_eq!(rewritten["version"], 2);
        assert_eq!(rewritten["entries"].as_object().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn registry_commit_keeps_unknown_fields() {
        let backend: Arc<dyn DocumentBackend> = Arc::new(MemoryBackend::new());
        backend
            .store(
                NAMES_DOCUMENT,
                br#"{"version":1,"accounts":{"100":"Prod"},"notes":{"owner":"ops"}}"#,
            )
            .await
            .unwrap();

        let mut registry = NameRegistry::load(backend.clone()).await.unwrap();
        registry.set_manual("200", "Capacity Team");
        registry.commit().await.unwrap();

        let raw: serde_json::Value =
            serde_json::from_slice(&backend.load(NAMES_DOCUMENT).await.unwrap().unwrap()).unwrap();
        assert_eq!(raw["notes"]["owner"], "ops");
        assert_eq!(raw["accounts"]["100"], "Prod");
        assert_eq!(raw["accounts"]["200"], "Capacity Team");
    }

    #[tokio::test]
    async fn file_backend_round_trips_and_reports_missing() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path());
        assert!(backend.load(INDEX_DOCUMENT).await.unwrap().is_none());
        backend.store(INDEX_DOCUMENT, b"{}").await.unwrap();
        assert_eq!(backend.load(INDEX_DOCUMENT).await.unwrap().unwrap(), b"{}");
    }

    #[tokio::test]
    async fn registry_auto_registration_is_write_once() {
        let backend: Arc<dyn DocumentBackend> = Arc::new(MemoryBackend::new());
        let mut registry = NameRegistry::load(backend.clone()).await.unwrap();

        assert!(registry.register_if_absent("100", "Prod"));
        assert!(!registry.register_if_absent("100", "Renamed"));
        assert!(!registry.register_if_absent("200", "   "));
        assert!(!registry.register_if_absent(UNKNOWN_ACCOUNT, "Someone"));
        registry.set_manual("300", "Manual");
        assert!(!registry.register_if_absent("300", "Auto"));
        registry.commit().await.unwrap();

        let reloaded = NameRegistry::load(backend).await.unwrap();
        assert_eq!(reloaded.get("100"), Some("Prod"));
        assert_eq!(reloaded.get("300"), Some("Manual"));
        assert_eq!(reloaded.get("200"), None);
        assert_eq!(reloaded.label("100"), "Prod (100)");
        assert_eq!(reloaded.label("200"), "200");
    }
}
