//! HTTP implementation of the remote API.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

use parcelsync_codec::Delta;
use parcelsync_common::{Error, Result};

use super::{PushOutcome, PushRequest, RemoteApi, RemoteChange};

/// Characters left unescaped in a path segment.
const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PushBody<'a> {
    delta: &'a Delta,
    client_id: &'a str,
    sync_version: u64,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PushResponse {
    #[serde(default)]
    conflict: bool,
    #[serde(default)]
    server_delta: Option<Delta>,
    #[serde(default)]
    sync_version: Option<u64>,
    #[serde(default)]
    document: Option<Value>,
}

/// Remote API over HTTP.
///
/// - `POST {base}/{collection}/{documentId}/delta`
/// - `GET {base}/{collection}/changes?since=N`
pub struct HttpRemote {
    client: Client,
    base: String,
}

impl HttpRemote {
    /// Create a client for `base_url`.
    ///
    /// # Errors
    /// - `Error::Config` if the URL is invalid or the client cannot be built
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let parsed = Url::parse(base_url)
            .map_err(|e| Error::Config(format!("invalid server url '{}': {}", base_url, e)))?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build http client: {}", e)))?;

        Ok(Self {
            client,
            base: parsed.as_str().trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self, segments: &[&str]) -> String {
        let mut url = self.base.clone();
        for segment in segments {
            url.push('/');
            url.extend(utf8_percent_encode(segment, SEGMENT));
        }
        url
    }
}

fn transport_error(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(e.to_string())
    } else {
        Error::Network(e.to_string())
    }
}

/// Map a push response to an outcome.
fn interpret_push(status: StatusCode, body: &str, request_version: u64) -> Result<PushOutcome> {
    let is_conflict_status = status == StatusCode::CONFLICT;
    if !status.is_success() && !is_conflict_status {
        return Err(Error::Network(format!("push failed: {} - {}", status, body)));
    }

    let response: PushResponse = if body.trim().is_empty() {
        PushResponse::default()
    } else {
        serde_json::from_str(body)
            .map_err(|e| Error::Network(format!("failed to parse push response: {}", e)))?
    };

    if is_conflict_status || response.conflict {
        let server_delta = response.server_delta.ok_or_else(|| {
            Error::Network("conflict response without serverDelta".to_string())
        })?;
        let sync_version = response.sync_version.unwrap_or(server_delta.sync_version);
        return Ok(PushOutcome::Conflict {
            server_delta,
            sync_version,
        });
    }

    Ok(PushOutcome::Accepted {
        document: response.document,
        sync_version: response.sync_version.unwrap_or(request_version + 1),
    })
}

#[async_trait]
impl RemoteApi for HttpRemote {
    fn name(&self) -> &str {
        "http"
    }

    async fn push_delta(&self, request: PushRequest) -> Result<PushOutcome> {
        let url = self.endpoint(&[&request.collection, &request.document_id, "delta"]);
        let body = PushBody {
            delta: &request.delta,
            client_id: &request.client_id,
            sync_version: request.sync_version,
            timestamp: request.timestamp,
        };

        debug!(url = %url, "pushing delta");
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        let text = response.text().await.map_err(transport_error)?;
        interpret_push(status, &text, request.sync_version)
    }

    async fn fetch_changes(&self, collection: &str, since: u64) -> Result<Vec<RemoteChange>> {
        let url = self.endpoint(&[collection, "changes"]);
        let response = self
            .client
            .get(&url)
            .query(&[("since", since)])
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Network(format!(
                "fetch changes failed: {} - {}",
                status, body
            )));
        }

        response
            .json::<Vec<RemoteChange>>()
            .await
            .map_err(|e| Error::Network(format!("failed to parse changes: {}", e)))
    }
}
