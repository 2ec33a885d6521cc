//! Append-only ingestion ledger.
//!
//! Every link that has been submitted as a job is recorded as one JSON line.
//! State is derived by replaying the whole file at startup, so a restart
//! never re-submits a link it already processed. Appends take an exclusive
//! file lock; two pollers sharing a ledger cannot interleave partial lines.

use std::collections::HashSet;
use std::io::Write;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("ledger task panicked: {0}")]
    TaskPanic(String),
}

/// One processed link
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Message the link arrived in
    pub message_id: String,

    /// Canonical link fingerprint; the dedupe key
    pub fingerprint: String,

    /// When the job was submitted
    pub processed_at: DateTime<Utc>,
}

/// Fingerprint of a canonical (post-unwrap, pre-rewrite) URL: the first 12
/// hex characters of its SHA-256. The same content link always maps to the
/// same fingerprint even when two emails wrap it differently.
pub fn link_fingerprint(canonical_url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_url.trim().as_bytes());
    hex::encode(hasher.finalize())[..12].to_string()
}

/// Fingerprint of an attached file's contents, same form as
/// [`link_fingerprint`]. The same recording forwarded in two emails dedupes
/// regardless of filename.
pub fn attachment_fingerprint(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())[..12].to_string()
}

/// JSONL-backed ledger of processed links
pub struct IngestLedger {
    path: PathBuf,
}

impl IngestLedger {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Replay the full ledger into the set of known fingerprints.
    ///
    /// Unparseable lines are skipped with a warning; a corrupt tail must not
    /// take the ingestor down.
    pub async fn replay(&self) -> Result<HashSet<String>, LedgerError> {
        let mut seen = HashSet::new();

        if !self.path.exists() {
            return Ok(seen);
        }

        let file = File::open(&self.path).await?;
        let reader = BufReader::new(file);
        let mut lines = reader.lines();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LedgerEntry>(&line) {
                Ok(entry) => {
                    seen.insert(entry.fingerprint);
                }
                Err(e) => {
                    warn!(error = %e, "Skipping corrupt ledger line");
                }
            }
        }

        Ok(seen)
    }

    /// Append one entry under an exclusive lock
    pub async fn record(&self, entry: LedgerEntry) -> Result<(), LedgerError> {
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || -> Result<(), LedgerError> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)?;

            file.lock_exclusive()?;
            let result = (|| -> Result<(), LedgerError> {
                let json = serde_json::to_string(&entry)?;
                file.write_all(format!("{}\n", json).as_bytes())?;
                file.flush()?;
                Ok(())
            })();
            let _ = fs2::FileExt::unlock(&file);
            result
        })
        .await
        .map_err(|e| LedgerError::TaskPanic(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(message_id: &str, fingerprint: &str) -> LedgerEntry {
        LedgerEntry {
            message_id: message_id.to_string(),
            fingerprint: fingerprint.to_string(),
            processed_at: Utc::now(),
        }
    }

    #[test]
    fn test_fingerprint_is_stable_and_short() {
        let a = link_fingerprint("https://example.com/call.mp3");
        let b = link_fingerprint("https://example.com/call.mp3");
        let c = link_fingerprint("https://example.com/other.mp3");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 12);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_attachment_fingerprint_keyed_on_content() {
        let a = attachment_fingerprint(b"fake audio");
        let b = attachment_fingerprint(b"fake audio");
        let c = attachment_fingerprint(b"other audio");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 12);
    }

    #[test]
    fn test_fingerprint_ignores_surrounding_whitespace() {
        assert_eq!(
            link_fingerprint(" https://example.com/a.mp3 "),
            link_fingerprint("https://example.com/a.mp3")
        );
    }

    #[tokio::test]
    async fn test_empty_ledger_replays_empty() {
        let temp = TempDir::new().unwrap();
        let ledger = IngestLedger::new(temp.path().join("ledger.jsonl"));
        assert!(ledger.replay().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_record_then_replay() {
        let temp = TempDir::new().unwrap();
        let ledger = IngestLedger::new(temp.path().join("ledger.jsonl"));

        ledger.record(entry("<m1>", "aaaa00000001")).await.unwrap();
        ledger.record(entry("<m2>", "bbbb00000002")).await.unwrap();

        let seen = ledger.replay().await.unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen.contains("aaaa00000001"));
        assert!(seen.contains("bbbb00000002"));
    }

    #[tokio::test]
    async fn test_replay_survives_restart() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("ledger.jsonl");

        {
            let ledger = IngestLedger::new(path.clone());
            ledger.record(entry("<m1>", "cafe00000001")).await.unwrap();
        }

        // New instance over the same file sees the old entries
        let ledger = IngestLedger::new(path);
        assert!(ledger.replay().await.unwrap().contains("cafe00000001"));
    }

    #[tokio::test]
    async fn test_corrupt_line_is_skipped() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("ledger.jsonl");
        let ledger = IngestLedger::new(path.clone());

        ledger.record(entry("<m1>", "dead00000001")).await.unwrap();
        std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap()
            .write_all(b"{not json\n")
            .unwrap();
        ledger.record(entry("<m2>", "beef00000002")).await.unwrap();

        let seen = ledger.replay().await.unwrap();
        assert_eq!(seen.len(), 2);
    }
}
