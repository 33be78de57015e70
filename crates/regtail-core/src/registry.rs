//! Registry client seam.
//!
//! [`RegistryClient`] abstracts the two requests the synchronizer makes
//! against a CouchDB-style replication endpoint so the engine can run
//! against an in-process mock in tests:
//!
//! - `GET {endpoint}/` for the remote `update_seq`
//! - `GET {endpoint}/_changes?since=..&limit=..` for a streamed change feed

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::changes::ByteStream;
use crate::error::FetchError;

/// Scheduler endpoint name for the database root.
pub const ENDPOINT_ROOT: &str = "root";
/// Scheduler endpoint name for the change feed.
pub const ENDPOINT_CHANGES: &str = "changes";

/// Header that opts a replication client into the npm follower feed.
pub const REPLICATION_HEADER: &str = "npm-replication-opt-in";

/// Answer to a change-feed request.
pub enum ChangesResponse {
    /// Records follow in the body.
    Stream(ByteStream),
    /// The feed has nothing at this offset (HTTP 404).
    Exhausted,
}

impl std::fmt::Debug for ChangesResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stream(_) => f.write_str("ChangesResponse::Stream(..)"),
            Self::Exhausted => f.write_str("ChangesResponse::Exhausted"),
        }
    }
}

/// Abstraction over the replication endpoint.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Current maximum sequence of the remote feed.
    async fn update_seq(&self) -> Result<u64, FetchError>;

    /// Change feed after `since`, at most `limit` records when given.
    async fn changes(&self, since: u64, limit: Option<u64>)
    -> Result<ChangesResponse, FetchError>;
}

/// Settings for [`HttpRegistryClient`].
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub endpoint: String,
    /// Connect and per-read timeout.
    pub timeout: Duration,
    pub user_agent: String,
}

impl HttpClientConfig {
    #[must_use]
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout: Duration::from_secs(60),
            user_agent: format!("regtail/{}", crate::VERSION),
        }
    }
}

/// [`RegistryClient`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpRegistryClient {
    http: reqwest::Client,
    endpoint: String,
}

#[derive(Deserialize)]
struct DatabaseInfo {
    update_seq: Value,
}

impl HttpRegistryClient {
    pub fn new(config: HttpClientConfig) -> Result<Self, FetchError> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.timeout)
            .read_timeout(config.timeout)
            .user_agent(config.user_agent)
            .build()
            .map_err(map_transport)?;
        Ok(Self {
            http,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
        })
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl RegistryClient for HttpRegistryClient {
    async fn update_seq(&self) -> Result<u64, FetchError> {
        let url = format!("{}/", self.endpoint);
        let resp = self.http.get(&url).send().await.map_err(map_transport)?;
        if let Some(err) = FetchError::from_status(resp.status().as_u16()) {
            return Err(err);
        }
        let info: DatabaseInfo = resp
            .json()
            .await
            .map_err(|e| FetchError::Decode(e.to_string()))?;
        parse_update_seq(&info.update_seq)
    }

    async fn changes(
        &self,
        since: u64,
        limit: Option<u64>,
    ) -> Result<ChangesResponse, FetchError> {
        let url = format!("{}/_changes", self.endpoint);
        let mut request = self
            .http
            .get(&url)
            .header(REPLICATION_HEADER, "true")
            .query(&[("since", since)]);
        if let Some(limit) = limit {
            request = request.query(&[("limit", limit)]);
        }
        let resp = request.send().await.map_err(map_transport)?;
        match resp.status() {
            StatusCode::NOT_FOUND => {
                debug!(since, "change feed exhausted at offset");
                Ok(ChangesResponse::Exhausted)
            }
            status => {
                if let Some(err) = FetchError::from_status(status.as_u16()) {
                    return Err(err);
                }
                let body = resp
                    .bytes_stream()
                    .map(|chunk| chunk.map_err(map_transport))
                    .boxed();
                Ok(ChangesResponse::Stream(body))
            }
        }
    }
}

fn map_transport(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout
    } else {
        FetchError::Transport(err.to_string())
    }
}

/// Accept `update_seq` as a number, a numeric string, or a CouchDB 2.x
/// `"<n>-<opaque>"` token.
pub fn parse_update_seq(value: &Value) -> Result<u64, FetchError> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| FetchError::Decode(format!("update_seq out of range: {n}"))),
        Value::String(s) => {
            let digits = s.split_once('-').map_or(s.as_str(), |(head, _)| head);
            digits
                .trim()
                .parse()
                .map_err(|_| FetchError::Decode(format!("update_seq not numeric: {s:?}")))
        }
        other => Err(FetchError::Decode(format!(
            "update_seq has unexpected type: {other}"
        ))),
    }
}
