//! Error types for regtail-core

use std::fmt::Write;
use thiserror::Error;

/// Remediation command for resolving an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RemediationCommand {
    /// Short label describing the command purpose
    pub label: String,
    /// Command to run
    pub command: String,
}

/// Actionable remediation guidance for an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    /// One-line summary of how to fix the issue
    pub summary: String,
    /// Suggested commands to resolve or diagnose the issue
    pub commands: Vec<RemediationCommand>,
    /// Additional alternative guidance
    pub alternatives: Vec<String>,
}

impl Remediation {
    /// Create a new remediation with a summary
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            commands: Vec::new(),
            alternatives: Vec::new(),
        }
    }

    /// Add a command
    #[must_use]
    pub fn command(mut self, label: impl Into<String>, command: impl Into<String>) -> Self {
        self.commands.push(RemediationCommand {
            label: label.into(),
            command: command.into(),
        });
        self
    }

    /// Add an alternative suggestion
    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    /// Render remediation text for human-readable output
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "To fix:");
        let _ = writeln!(output, "  {}", self.summary);

        if !self.commands.is_empty() {
            let _ = writeln!(output, "  Commands:");
            for cmd in &self.commands {
                let _ = writeln!(output, "    - {}: {}", cmd.label, cmd.command);
            }
        }

        if !self.alternatives.is_empty() {
            let _ = writeln!(output, "  Alternatives:");
            for alt in &self.alternatives {
                let _ = writeln!(output, "    - {alt}");
            }
        }

        output
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for regtail-core
#[derive(Error, Debug)]
pub enum Error {
    /// Remote registry errors
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    /// Progress store errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// A bounded retry budget ran out. Always fatal for the synchronizer.
    #[error("{operation} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        last_error: String,
    },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Runtime errors (task join failures, channel failures, etc.)
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// Operation was cancelled by shutdown
    #[error("Operation cancelled: {0}")]
    Cancelled(String),
}

impl Error {
    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Fetch(err) => Some(err.remediation()),
            Self::Storage(err) => Some(err.remediation()),
            Self::Config(err) => Some(err.remediation()),
            Self::RetriesExhausted { .. } => Some(
                Remediation::new(
                    "The registry kept failing. Check connectivity, then restart; progress resumes from the last checkpoint.",
                )
                .command("Checkpoint", "regtail status")
                .alternative("Raise registry.max_retries or lower registry.queries_per_second."),
            ),
            Self::Io(_) => Some(
                Remediation::new("Check filesystem permissions and paths, then retry.")
                    .alternative("Verify the data directory exists and is writable."),
            ),
            Self::Json(_) => Some(
                Remediation::new("A persisted value is not valid JSON.")
                    .command("Checkpoint", "regtail status --json")
                    .alternative("Delete the progress database to resynchronize from scratch."),
            ),
            Self::Runtime(_) => Some(
                Remediation::new("Restart the synchronizer.")
                    .alternative("If the issue persists, run with RUST_LOG=regtail_core=debug."),
            ),
            Self::Cancelled(_) => None,
        }
    }
}

/// Errors talking to the replication endpoint
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// HTTP 429; callers penalize the scheduler before retrying
    #[error("rate limited by registry (HTTP 429)")]
    RateLimited,

    /// HTTP 404
    #[error("not found (HTTP 404)")]
    NotFound,

    /// Any other non-success status
    #[error("unexpected HTTP status {0}")]
    Status(u16),

    /// Connection reset, truncated body, DNS failure, ...
    #[error("transport error: {0}")]
    Transport(String),

    /// Response body could not be decoded
    #[error("invalid response body: {0}")]
    Decode(String),

    /// Request did not complete in time
    #[error("request timed out")]
    Timeout,
}

impl FetchError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::RateLimited => Remediation::new("The registry is rate limiting requests.")
                .alternative("Lower registry.queries_per_second or registry.concurrency."),
            Self::NotFound => Remediation::new("The registry endpoint returned 404.")
                .alternative("Verify registry.endpoint points at a CouchDB replication root."),
            Self::Status(code) => Remediation::new(format!(
                "The registry answered with HTTP {code}. Retry later."
            ))
            .alternative("Check the registry status page."),
            Self::Transport(_) | Self::Timeout => {
                Remediation::new("Network failure talking to the registry.")
                    .alternative("Check connectivity and proxy settings.")
                    .alternative("Raise registry.request_timeout_secs on slow links.")
            }
            Self::Decode(_) => Remediation::new("The registry returned an unexpected body.")
                .alternative("Verify registry.endpoint points at a CouchDB replication root."),
        }
    }

    /// Map an HTTP status code to an error, or `None` for success codes.
    #[must_use]
    pub fn from_status(status: u16) -> Option<Self> {
        match status {
            200..=299 => None,
            404 => Some(Self::NotFound),
            429 => Some(Self::RateLimited),
            other => Some(Self::Status(other)),
        }
    }
}

/// Progress store errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("backend error: {0}")]
    Backend(String),

    #[error("failed to encode {key}: {details}")]
    Serialization { key: String, details: String },

    #[error("persisted value for {key} is corrupt: {details}")]
    Corrupt { key: String, details: String },

    #[error("unknown block id {0}")]
    UnknownBlock(u32),

    #[error("progress store writer has shut down")]
    Closed,
}

impl StorageError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Backend(_) => Remediation::new(
                "Writing the checkpoint failed. Check disk space and permissions, then restart.",
            )
            .command("Checkpoint", "regtail status"),
            Self::Serialization { .. } | Self::Corrupt { .. } => Remediation::new(
                "The persisted checkpoint could not be decoded.",
            )
            .command("Checkpoint", "regtail status --json")
            .alternative("Delete the progress database to resynchronize from scratch."),
            Self::UnknownBlock(_) => Remediation::new(
                "A catch-up worker referenced a block the store does not know.",
            )
            .alternative("Restart; the block plan is rebuilt from the low-water-mark."),
            Self::Closed => Remediation::new("The progress store stopped. Restart the synchronizer."),
        }
    }
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to read config {0}: {1}")]
    ReadFailed(String, String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::FileNotFound(path) => {
                Remediation::new(format!("Create the config file or drop --config: {path}"))
            }
            Self::ReadFailed(path, _) => {
                Remediation::new(format!("Check permissions on the config file: {path}"))
            }
            Self::ParseError(_) => Remediation::new("Fix the TOML syntax in regtail.toml.")
                .alternative("Compare with the defaults printed by `regtail sync --help`."),
            Self::Invalid(_) => Remediation::new("Fix the reported value in regtail.toml.")
                .alternative("concurrency, block_size and queries_per_second must be positive."),
        }
    }
}
