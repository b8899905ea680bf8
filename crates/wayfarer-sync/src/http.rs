//! Remote document store over a small JSON REST API.
//!
//! PUT    {base}/conversations/{cid}/utterances/{uid}   {"base_version", "utterance"}
//! DELETE {base}/conversations/{cid}/utterances/{uid}?base_version=N
//! GET    {base}/conversations/{cid}/utterances?since=N
//!
//! Writes answer `{"version": N}`; 409 carries the current remote version.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use url::Url;
use wayfarer_db::Utterance;

use crate::error::RemoteError;
use crate::remote::{RemoteDelta, RemoteStore, UpsertOutcome};

#[derive(Debug, Serialize)]
struct UpsertBody<'a> {
    base_version: u64,
    utterance: &'a Utterance,
}

#[derive(Debug, Deserialize)]
struct VersionBody {
    version: u64,
}

pub struct HttpRemoteStore {
    client: reqwest::Client,
    base: Url,
}

impl HttpRemoteStore {
    pub fn new(base_url: &str) -> Result<Self, RemoteError> {
        let base = Url::parse(base_url)
            .map_err(|e| RemoteError::Rejected(format!("invalid remote url {base_url}: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(RemoteError::Rejected(format!("invalid remote url {base_url}")));
        }
        Ok(Self {
            client: reqwest::Client::new(),
            base,
        })
    }

    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn utterance_url(&self, conversation_id: &str, utterance_id: &str) -> Url {
        self.url(&["conversations", conversation_id, "utterances", utterance_id])
    }

    async fn write_outcome(response: reqwest::Response) -> Result<UpsertOutcome, RemoteError> {
        let status = response.status();
        let body = response.text().await.map_err(transport_error)?;
        if status.is_success() {
            let parsed = parse_version(&body)?;
            return Ok(UpsertOutcome::Ack {
                version: parsed.version,
            });
        }
        if status == StatusCode::CONFLICT {
            let parsed = parse_version(&body)?;
            return Ok(UpsertOutcome::Conflict {
                remote_version: parsed.version,
            });
        }
        Err(status_error(status, &body))
    }
}

fn parse_version(body: &str) -> Result<VersionBody, RemoteError> {
    serde_json::from_str(body).map_err(|e| RemoteError::InvalidResponse(e.to_string()))
}

fn transport_error(e: reqwest::Error) -> RemoteError {
    RemoteError::Unavailable(e.to_string())
}

/// 5xx, 408 and 429 are worth retrying; any other 4xx will fail the same way again.
fn status_error(status: StatusCode, body: &str) -> RemoteError {
    let snippet: String = body.chars().take(200).collect();
    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        RemoteError::Unavailable(format!("HTTP {status}: {snippet}"))
    } else {
        RemoteError::Rejected(format!("HTTP {status}: {snippet}"))
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn upsert(
        &self,
        conversation_id: &str,
        utterance_id: &str,
        payload: &Utterance,
        base_version: u64,
    ) -> Result<UpsertOutcome, RemoteError> {
        let response = self
            .client
            .put(self.utterance_url(conversation_id, utterance_id))
            .json(&UpsertBody {
                base_version,
                utterance: payload,
            })
            .send()
            .await
            .map_err(transport_error)?;
        Self::write_outcome(response).await
    }

    async fn delete(
        &self,
        conversation_id: &str,
        utterance_id: &str,
        base_version: u64,
    ) -> Result<UpsertOutcome, RemoteError> {
        let response = self
            .client
            .delete(self.utterance_url(conversation_id, utterance_id))
            .query(&[("base_version", base_version)])
            .send()
            .await
            .map_err(transport_error)?;
        // Already gone remotely.
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(UpsertOutcome::Ack {
                version: base_version,
            });
        }
        Self::write_outcome(response).await
    }

    async fn fetch(&self, conversation_id: &str, since_version: u64) -> Result<RemoteDelta, RemoteError> {
        let response = self
            .client
            .get(self.url(&["conversations", conversation_id, "utterances"]))
            .query(&[("since", since_version)])
            .send()
            .await
            .map_err(transport_error)?;
        let status = response.status();
        let body = response.text().await.map_err(transport_error)?;
        if status == StatusCode::NOT_FOUND {
            return Ok(RemoteDelta::default());
        }
        if !status.is_success() {
            return Err(status_error(status, &body));
        }
        serde_json::from_str(&body).map_err(|e| RemoteError::InvalidResponse(e.to_string()))
    }
}
