//! Email ingestion: link extraction, dedupe ledger and the mailbox watcher.

pub mod extract;
pub mod ingestor;
pub mod ledger;

pub use extract::{extract_links, is_media_candidate};
pub use ingestor::{EmailIngestor, PollOutcome};
pub use ledger::{attachment_fingerprint, link_fingerprint, IngestLedger, LedgerEntry, LedgerError};
