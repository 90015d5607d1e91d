//! Collaborator contracts (mail retrieval, attachment summarization) plus
//! fixture-first and command-backed implementations.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use cad_core::Envelope;
use chrono::{DateTime, FixedOffset, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

pub const CRATE_NAME: &str = "cad-adapters";

/// Default advisory sender address.
pub const DEFAULT_SENDER: &str = "email@advisor.cloud.tencent.com";

#[derive(Debug, Error)]
pub enum AdapterError {
    /// The collaborator could not be reached at all.
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Mail retrieval boundary.
#[async_trait]
pub trait MailSource: Send + Sync {
    fn name(&self) -> &str;

    /// Envelopes from `sender` received at or after `since`, oldest first.
    async fn list_envelopes(
        &self,
        sender: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Envelope>, AdapterError>;

    async fn read_body(&self, id: &str) -> Result<String, AdapterError>;

    /// Write the message's attachments into `dest_dir`, returning the written files.
    async fn download_attachments(
        &self,
        id: &str,
        dest_dir: &Path,
    ) -> Result<Vec<PathBuf>, AdapterError>;
}

/// Document summarization boundary. Best-effort: callers degrade on any error.
#[async_trait]
pub trait Summarizer: Send + Sync {
    fn name(&self) -> &str;
    async fn summarize(&self, path: &Path) -> Result<JsonValue, AdapterError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailboxFixture {
    pub fixture_id: String,
    pub captured_at: DateTime<Utc>,
    #[serde(default)]
    pub notes: Option<String>,
    pub messages: Vec<FixtureMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureMessage {
    pub id: String,
    pub from: String,
    pub subject: String,
    pub date: DateTime<FixedOffset>,
    #[serde(default)]
    pub body: FixtureContent,
    #[serde(default)]
    pub attachments: Vec<FixtureAttachment>,
}

/// Text supplied inline or by a path relative to the bundle file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixtureContent {
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub inline_text: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureAttachment {
    pub filename: String,
    #[serde(flatten)]
    pub content: FixtureContent,
}

pub fn load_mailbox_fixture(path: impl AsRef<Path>) -> anyhow::Result<MailboxFixture> {
    let path = path.as_ref();
    let mut fixture: MailboxFixture = read_json_file(path)?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    for message in &mut fixture.messages {
        hydrate_content(base, &mut message.body)?;
        for attachment in &mut message.attachments {
            hydrate_content(base, &mut attachment.content)?;
        }
    }
    Ok(fixture)
}

fn read_json_file<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let data =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

fn hydrate_content(base: &Path, content: &mut FixtureContent) -> anyhow::Result<()> {
    if content.inline_text.is_some() {
        return Ok(());
    }
    let Some(rel_path) = &content.path else {
        return Ok(());
    };
    let raw_path = base.join(rel_path);
    if !raw_path.exists() {
        return Ok(());
    }
    let raw = std::fs::read_to_string(&raw_path)
        .with_context(|| format!("reading fixture content {}", raw_path.display()))?;
    content.inline_text = Some(raw);
    Ok(())
}

/// A mailbox replayed from a captured fixture bundle.
#[derive(Debug, Clone)]
pub struct FixtureMailbox {
    fixture: MailboxFixture,
}

impl FixtureMailbox {
    pub fn new(fixture: MailboxFixture) -> Self {
        Self { fixture }
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        Ok(Self::new(load_mailbox_fixture(path)?))
    }

    pub fn messages(&self) -> &[FixtureMessage] {
        &self.fixture.messages
    }

    fn message(&self, id: &str) -> Result<&FixtureMessage, AdapterError> {
        self.fixture
            .messages
            .iter()
            .find(|m| m.id == id)
            .ok_or_else(|| AdapterError::NotFound(format!("message {id}")))
    }
}

#[async_trait]
impl MailSource for FixtureMailbox {
    fn name(&self) -> &str {
        &self.fixture.fixture_id
    }

    async fn list_envelopes(
        &self,
        sender: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Envelope>, AdapterError> {
        let sender = sender.to_lowercase();
        let mut envelopes: Vec<Envelope> = self
            .fixture
            .messages
            .iter()
            .filter(|m| sender.is_empty() || m.from.to_lowercase().contains(&sender))
            .filter(|m| m.date.with_timezone(&Utc) >= since)
            .map(|m| Envelope {
                id: m.id.clone(),
                subject: m.subject.clone(),
                date: m.date,
                has_attachment: !m.attachments.is_empty(),
            })
            .collect();
        envelopes.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.id.cmp(&b.id)));
        Ok(envelopes)
    }

    async fn read_body(&self, id: &str) -> Result<String, AdapterError> {
        self.message(id)?
            .body
            .inline_text
            .clone()
            .ok_or_else(|| AdapterError::NotFound(format!("body of message {id}")))
    }

    async fn download_attachments(
        &self,
        id: &str,
        dest_dir: &Path,
    ) -> Result<Vec<PathBuf>, AdapterError> {
        let message = self.message(id)?;
        tokio::fs::create_dir_all(dest_dir)
            .await
            .with_context(|| format!("creating {}", dest_dir.display()))?;
        let mut written = Vec::with_capacity(message.attachments.len());
        for attachment in &message.attachments {
            let Some(text) = &attachment.content.inline_text else {
                return Err(AdapterError::NotFound(format!(
                    "attachment {} of message {id}",
                    attachment.filename
                )));
            };
            let file_name = Path::new(&attachment.filename)
                .file_name()
                .map(|n| n.to_os_string())
                .ok_or_else(|| {
                    AdapterError::Message(format!("bad attachment name {}", attachment.filename))
                })?;
            let path = dest_dir.join(file_name);
            tokio::fs::write(&path, text.as_bytes())
                .await
                .with_context(|| format!("writing {}", path.display()))?;
            written.push(path);
        }
        Ok(written)
    }
}

/// Summarizer used when none is configured: every attachment stays "not summarized".
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSummarizer;

#[async_trait]
impl Summarizer for NoopSummarizer {
    fn name(&self) -> &str {
        "none"
    }

    async fn summarize(&self, _path: &Path) -> Result<JsonValue, AdapterError> {
        Err(AdapterError::Unavailable("no summarizer configured".into()))
    }
}

/// Runs an external program with the attachment path as its last argument and
/// parses its stdout as JSON.
#[derive(Debug, Clone)]
pub struct CommandSummarizer {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandSummarizer {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }

    /// Split a whitespace-separated command line such as `summarize --json`.
    pub fn from_command_line(line: &str, timeout: Duration) -> Option<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect(), timeout))
    }
}

#[async_trait]
impl Summarizer for CommandSummarizer {
    fn name(&self) -> &str {
        &self.program
    }

    async fn summarize(&self, path: &Path) -> Result<JsonValue, AdapterError> {
        let mut args: Vec<OsString> = self.args.iter().map(OsString::from).collect();
        args.push(path.as_os_str().to_owned());
        let stdout = run_command(&self.program, &args, self.timeout).await?;
        debug!(program = %self.program, path = %path.display(), bytes = stdout.len(), "summarizer finished");
        serde_json::from_slice(&stdout)
            .with_context(|| format!("parsing {} output for {}", self.program, path.display()))
            .map_err(AdapterError::from)
    }
}

/// Mail source backed by an external command with three subcommands:
///
/// - `list <sender> <since>` prints a JSON array of envelopes; `since` is RFC 3339.
/// - `body <id>` prints the message body.
/// - `attachments <id> <dest>` writes attachments into `dest` and prints a
///   JSON array of their paths, relative to `dest` or absolute.
#[derive(Debug, Clone)]
pub struct CommandMailSource {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandMailSource {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }

    pub fn from_command_line(line: &str, timeout: Duration) -> Option<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect(), timeout))
    }

    async fn run(&self, subcommand: &[OsString]) -> Result<Vec<u8>, AdapterError> {
        let args: Vec<OsString> = self
            .args
            .iter()
            .map(OsString::from)
            .chain(subcommand.iter().cloned())
            .collect();
        run_command(&self.program, &args, self.timeout).await
    }
}

#[async_trait]
impl MailSource for CommandMailSource {
    fn name(&self) -> &str {
        &self.program
    }

    async fn list_envelopes(
        &self,
        sender: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Envelope>, AdapterError> {
        let stdout = self
            .run(&[
                OsString::from("list"),
                OsString::from(sender),
                OsString::from(since.to_rfc3339()),
            ])
            .await?;
        let mut envelopes: Vec<Envelope> = serde_json::from_slice(&stdout)
            .with_context(|| format!("parsing {} envelope listing", self.program))?;
        envelopes.retain(|e| e.date.with_timezone(&Utc) >= since);
        envelopes.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.id.cmp(&b.id)));
        Ok(envelopes)
    }

    async fn read_body(&self, id: &str) -> Result<String, AdapterError> {
        let stdout = self.run(&[OsString::from("body"), OsString::from(id)]).await?;
        Ok(String::from_utf8_lossy(&stdout).into_owned())
    }

    async fn download_attachments(
        &self,
        id: &str,
        dest_dir: &Path,
    ) -> Result<Vec<PathBuf>, AdapterError> {
        tokio::fs::create_dir_all(dest_dir)
            .await
            .with_context(|| format!("creating {}", dest_dir.display()))?;
        let stdout = self
            .run(&[
                OsString::from("attachments"),
                OsString::from(id),
                dest_dir.as_os_str().to_owned(),
            ])
            .await?;
        let paths: Vec<PathBuf> = serde_json::from_slice(&stdout)
            .with_context(|| format!("parsing {} attachment list for {id}", self.program))?;
        Ok(paths
            .into_iter()
            .map(|path| {
                if path.is_absolute() {
                    path
                } else {
                    dest_dir.join(path)
                }
            })
            .collect())
    }
}

/// Runs a collaborator command to completion and returns its stdout. Spawn
/// failures and timeouts are `Unavailable`; a non-zero exit is a `Message`.
async fn run_command(
    program: &str,
    args: &[OsString],
    timeout: Duration,
) -> Result<Vec<u8>, AdapterError> {
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = command
        .spawn()
        .map_err(|err| AdapterError::Unavailable(format!("spawning {program}: {err}")))?;
    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| {
            AdapterError::Unavailable(format!(
                "{program} timed out after {}s",
                timeout.as_secs()
            ))
        })?
        .with_context(|| format!("waiting for {program}"))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(AdapterError::Message(format!(
            "{program} exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }
    Ok(output.stdout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixture() -> MailboxFixture {
        let json = r#"{
            "fixture_id": "unit",
            "captured_at": "2026-02-25T02:00:00Z",
            "messages": [
                {"id": "2", "from": "Advisor <email@advisor.cloud.tencent.com>", "subject": "b",
                 "date": "2026-02-25T09:00:00+08:00", "body": {"inline_text": "APPID: 1"},
                 "attachments": [{"filename": "r.csv", "inline_text": "a,b"}]},
                {"id": "1", "from": "email@advisor.cloud.tencent.com", "subject": "a",
                 "date": "2026-02-24T09:00:00+08:00", "body": {"inline_text": "APPID: 1"}},
                {"id": "3", "from": "someone@else.example", "subject": "c",
                 "date": "2026-02-25T10:00:00+08:00"}
            ]
        }"#;
        serde_json::from_str(json).unwrap()
    }

    #[tokio::test]
    async fn list_filters_sender_and_window_oldest_first() {
        let mailbox = FixtureMailbox::new(fixture());
        let since = Utc.with_ymd_and_hms(2026, 2, 20, 0, 0, 0).single().unwrap();
        let ids: Vec<String> = mailbox
            .list_envelopes(DEFAULT_SENDER, since)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec!["1", "2"]);

        let later = Utc.with_ymd_and_hms(2026, 2, 24, 12, 0, 0).single().unwrap();
        let envelopes = mailbox.list_envelopes(DEFAULT_SENDER, later).await.unwrap();
        assert_eq!(envelopes.len(), 1);
        assert!(envelopes[0].has_attachment);
    }

    #[tokio::test]
    async fn missing_body_and_message_are_not_found() {
        let mailbox = FixtureMailbox::new(fixture());
        assert!(matches!(mailbox.read_body("3").await, Err(AdapterError::NotFound(_))));
        assert!(matches!(mailbox.read_body("9").await, Err(AdapterError::NotFound(_))));
    }

    #[tokio::test]
    async fn attachments_are_written_into_dest_dir() {
        let mailbox = FixtureMailbox::new(fixture());
        let dir = tempfile::tempdir().unwrap();
        let files = mailbox.download_attachments("2", dir.path()).await.unwrap();
        assert_eq!(files, vec![dir.path().join("r.csv")]);
        assert_eq!(std::fs::read_to_string(&files[0]).unwrap(), "a,b");
    }

    #[tokio::test]
    async fn noop_summarizer_is_unavailable() {
        let err = NoopSummarizer.summarize(Path::new("x.xlsx")).await.unwrap_err();
        assert!(matches!(err, AdapterError::Unavailable(_)));
    }

    #[tokio::test]
    async fn missing_summarizer_program_is_unavailable() {
        let summarizer = CommandSummarizer::new(
            "cad-summarizer-that-does-not-exist",
            Vec::new(),
            Duration::from_secs(5),
        );
        let err = summarizer.summarize(Path::new("x.xlsx")).await.unwrap_err();
        assert!(matches!(err, AdapterError::Unavailable(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_summarizer_parses_stdout_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("summary.json");
        std::fs::write(&path, r#"{"findings": []}"#).unwrap();
        let summarizer = CommandSummarizer::from_command_line("cat", Duration::from_secs(5)).unwrap();
        let value = summarizer.summarize(&path).await.unwrap();
        assert_eq!(value, serde_json::json!({"findings": []}));
        assert!(CommandSummarizer::from_command_line("   ", Duration::from_secs(1)).is_none());
    }

    #[cfg(unix)]
    const MAIL_SCRIPT: &str = r#"
case "$1" in
  list)
    printf '[{"id":"m2","subject":"%s","date":"2026-02-25T08:00:00+08:00","has_attachment":true},' "$2"
    printf '{"id":"m1","subject":"%s","date":"2026-02-24T08:00:00+08:00"},' "$2"
    printf '{"id":"m0","subject":"old","date":"2026-01-01T08:00:00+08:00"}]' ;;
  body) printf 'APPID: 100 for %s' "$2" ;;
  attachments) printf 'CVM,DiskHigh\n' > "$3/risk.csv"; printf '["risk.csv"]' ;;
  *) echo "unknown subcommand $1" >&2; exit 2 ;;
esac
"#;

    #[cfg(unix)]
    fn scripted_mail() -> CommandMailSource {
        CommandMailSource::new(
            "sh",
            vec!["-c".into(), MAIL_SCRIPT.into(), "mail".into()],
            Duration::from_secs(5),
        )
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_mail_source_lists_reads_and_downloads() {
        let mail = scripted_mail();
        let since = Utc.with_ymd_and_hms(2026, 2, 20, 0, 0, 0).single().unwrap();
        let envelopes = mail.list_envelopes(DEFAULT_SENDER, since).await.unwrap();
        let ids: Vec<&str> = envelopes.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m2"]);
        assert_eq!(envelopes[0].subject, DEFAULT_SENDER);
        assert!(envelopes[1].has_attachment);

        assert_eq!(mail.read_body("m2").await.unwrap(), "APPID: 100 for m2");

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("m2");
        let paths = mail.download_attachments("m2", &dest).await.unwrap();
        assert_eq!(paths, vec![dest.join("risk.csv")]);
        assert_eq!(std::fs::read_to_string(&paths[0]).unwrap(), "CVM,DiskHigh\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_mail_source_failures_are_classified() {
        let missing = CommandMailSource::from_command_line(
            "cad-mail-that-does-not-exist list",
            Duration::from_secs(5),
        )
        .unwrap();
        let since = Utc.with_ymd_and_hms(2026, 2, 20, 0, 0, 0).single().unwrap();
        assert!(matches!(
            missing.list_envelopes(DEFAULT_SENDER, since).await,
            Err(AdapterError::Unavailable(_))
        ));

        let failing = CommandMailSource::new(
            "sh",
            vec!["-c".into(), "echo broken >&2; exit 1".into(), "mail".into()],
            Duration::from_secs(5),
        );
        let err = failing.read_body("m1").await.unwrap_err();
        assert!(matches!(err, AdapterError::Message(ref msg) if msg.contains("broken")));
    }
}
