use std::path::PathBuf;

use cad_adapters::{FixtureMailbox, MailSource, DEFAULT_SENDER};
use chrono::{TimeZone, Utc};

fn bundle_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/mailbox/sample/bundle.json")
}

#[tokio::test]
async fn sample_bundle_hydrates_bodies_and_attachments_from_paths() {
    let mailbox = FixtureMailbox::load(bundle_path()).expect("load sample bundle");
    assert_eq!(mailbox.name(), "advisor-sample");

    let since = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).single().unwrap();
    let envelopes = mailbox.list_envelopes(DEFAULT_SENDER, since).await.unwrap();
    let ids: Vec<&str> = envelopes.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, vec!["1001", "1002", "1003"]);

    let body = mailbox.read_body("1001").await.unwrap();
    assert!(body.contains("APPID: 1250000000"));

    let dir = tempfile::tempdir().unwrap();
    let files = mailbox.download_attachments("1002", dir.path()).await.unwrap();
    assert_eq!(files.len(), 1);
    let csv = std::fs::read_to_string(&files[0]).unwrap();
    assert!(csv.contains("EdgeOne,DDoSUnconfigured,zone-1"));
}
