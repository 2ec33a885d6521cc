//! Configuration.
//!
//! Sources (highest priority first):
//! 1. Environment variables (FINSCRIBE_HOME, FINSCRIBE_API_KEY, ...)
//! 2. Config file ($FINSCRIBE_HOME/config.yaml, default ~/.finscribe)
//! 3. Defaults
//!
//! Secrets (API key, mailbox passwords) may live in either the environment
//! or the config file; the environment wins.

use std::path::PathBuf;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::core::retry::RetryPolicy;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<std::result::Result<Config, String>> = OnceLock::new();

pub const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";
pub const DEFAULT_WHISPER_MODEL: &str = "whisper-1";
pub const DEFAULT_CHAT_MODEL: &str = "gpt-4o";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub api: ApiSection,
    #[serde(default)]
    pub email: Option<EmailSection>,
    #[serde(default)]
    pub limits: LimitsSection,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiSection {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub whisper_model: Option<String>,
    pub chat_model: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmailSection {
    pub imap_host: String,
    #[serde(default = "default_imap_port")]
    pub imap_port: u16,
    pub imap_folder: Option<String>,
    pub smtp_host: String,
    pub username: String,
    pub password: Option<String>,
    /// From address for replies; defaults to username
    pub sender: Option<String>,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

fn default_imap_port() -> u16 {
    993
}
fn default_poll_interval() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitsSection {
    #[serde(default = "default_max_download_mb")]
    pub max_download_mb: u64,
    #[serde(default = "default_chunk_minutes")]
    pub max_chunk_minutes: u64,
    #[serde(default = "default_chunk_mb")]
    pub max_chunk_mb: u64,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_transcribe_parallelism")]
    pub transcribe_parallelism: usize,
}

fn default_max_download_mb() -> u64 {
    2048
}
fn default_chunk_minutes() -> u64 {
    20
}
fn default_chunk_mb() -> u64 {
    24
}
fn default_workers() -> usize {
    2
}
fn default_transcribe_parallelism() -> usize {
    4
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            max_download_mb: default_max_download_mb(),
            max_chunk_minutes: default_chunk_minutes(),
            max_chunk_mb: default_chunk_mb(),
            workers: default_workers(),
            transcribe_parallelism: default_transcribe_parallelism(),
        }
    }
}

/// Resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// State directory; the ingestion ledger lives here
    pub home: PathBuf,

    pub api_base_url: String,
    pub api_key: String,
    pub whisper_model: String,
    pub chat_model: String,

    /// Mailbox settings; absent when running CLI-only
    pub email: Option<EmailSection>,

    pub limits: LimitsSection,
    pub retry: RetryPolicy,
}

impl Config {
    pub fn ledger_path(&self) -> PathBuf {
        self.home.join("ingest_ledger.jsonl")
    }

    pub fn size_ceiling_bytes(&self) -> u64 {
        self.limits.max_download_mb * 1024 * 1024
    }
}

fn finscribe_home() -> Result<PathBuf> {
    if let Ok(home) = std::env::var("FINSCRIBE_HOME") {
        return Ok(PathBuf::from(home));
    }
    Ok(dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".finscribe"))
}

fn load_config_file(path: &std::path::Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Load configuration from all sources
fn load_config() -> Result<Config> {
    let home = finscribe_home()?;
    let config_path = home.join("config.yaml");

    let file = if config_path.exists() {
        load_config_file(&config_path)?
    } else {
        ConfigFile::default()
    };

    let api_key = std::env::var("FINSCRIBE_API_KEY")
        .ok()
        .or(file.api.api_key)
        .unwrap_or_default();

    let api_base_url = std::env::var("FINSCRIBE_API_BASE")
        .ok()
        .or(file.api.base_url)
        .unwrap_or_else(|| DEFAULT_API_BASE.to_string());

    let mut email = file.email;
    if let Some(email) = email.as_mut() {
        if let Ok(password) = std::env::var("FINSCRIBE_EMAIL_PASSWORD") {
            email.password = Some(password);
        }
    }

    Ok(Config {
        home,
        api_base_url,
        api_key,
        whisper_model: file
            .api
            .whisper_model
            .unwrap_or_else(|| DEFAULT_WHISPER_MODEL.to_string()),
        chat_model: file
            .api
            .chat_model
            .unwrap_or_else(|| DEFAULT_CHAT_MODEL.to_string()),
        email,
        limits: file.limits,
        retry: file.retry.unwrap_or_default(),
    })
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static Config> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<Config> {
    load_config()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_config_file_parsing() {
        let temp = TempDir::new().unwrap();
        let config_path = temp.path().join("config.yaml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(
            file,
            r#"
api:
  chat_model: gpt-4o-mini
email:
  imap_host: imap.example.com
  smtp_host: smtp.example.com
  username: pipeline@example.com
  poll_interval_secs: 30
limits:
  max_download_mb: 512
  workers: 4
retry:
  max_attempts: 5
"#
        )
        .unwrap();

        let parsed = load_config_file(&config_path).unwrap();
        assert_eq!(parsed.api.chat_model.as_deref(), Some("gpt-4o-mini"));
        assert!(parsed.api.base_url.is_none());

        let email = parsed.email.unwrap();
        assert_eq!(email.imap_host, "imap.example.com");
        assert_eq!(email.imap_port, 993);
        assert_eq!(email.poll_interval_secs, 30);

        assert_eq!(parsed.limits.max_download_mb, 512);
        assert_eq!(parsed.limits.workers, 4);
        // Unspecified limits keep their defaults
        assert_eq!(parsed.limits.max_chunk_minutes, 20);

        assert_eq!(parsed.retry.unwrap().max_attempts, 5);
    }

    #[test]
    fn test_minimal_config_file() {
        let temp = TempDir::new().unwrap();
        let config_path = temp.path().join("config.yaml");
        std::fs::write(&config_path, "api: {}\n").unwrap();

        let parsed = load_config_file(&config_path).unwrap();
        assert!(parsed.email.is_none());
        assert_eq!(parsed.limits.workers, 2);
    }

    #[test]
    fn test_ledger_and_ceiling_derivations() {
        let config = Config {
            home: PathBuf::from("/var/finscribe"),
            api_base_url: DEFAULT_API_BASE.to_string(),
            api_key: String::new(),
            whisper_model: DEFAULT_WHISPER_MODEL.to_string(),
            chat_model: DEFAULT_CHAT_MODEL.to_string(),
            email: None,
            limits: LimitsSection::default(),
            retry: RetryPolicy::default(),
        };

        assert_eq!(
            config.ledger_path(),
            PathBuf::from("/var/finscribe/ingest_ledger.jsonl")
        );
        assert_eq!(config.size_ceiling_bytes(), 2048 * 1024 * 1024);
    }
}
