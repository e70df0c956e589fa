//! HTTP polling client for the execution API.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use super::StatusView;
use crate::execution::{ExecutionId, SubmitRequest};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server returned {status}: {code}: {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },

    #[error("execution {0} not found")]
    NotFound(ExecutionId),

    #[error("execution {id} still not terminal after {waited:?}")]
    WaitTimeout { id: ExecutionId, waited: Duration },
}

#[derive(Deserialize)]
struct DataEnvelope<T> {
    data: T,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    code: String,
    message: String,
}

#[derive(Deserialize)]
struct Accepted {
    execution_id: ExecutionId,
}

#[derive(Deserialize)]
struct CancelBody {
    cancelled: bool,
}

/// Submits executions and polls them until they finish.
#[derive(Debug, Clone)]
pub struct PollClient {
    http: reqwest::Client,
    base_url: String,
    interval: Duration,
    max_wait: Duration,
}

impl PollClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            interval: Duration::from_secs(2),
            max_wait: Duration::from_secs(300),
        }
    }

    pub fn with_polling(mut self, interval: Duration, max_wait: Duration) -> Self {
        self.interval = interval;
        self.max_wait = max_wait;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1{}", self.base_url, path)
    }

    pub async fn submit(&self, request: &SubmitRequest) -> Result<ExecutionId, ClientError> {
        let resp = self
            .http
            .post(self.url("/executions"))
            .json(request)
            .send()
            .await?;
        let accepted: Accepted = decode(resp).await?;
        Ok(accepted.execution_id)
    }

    /// Current status, or `None` if the server does not know the id.
    pub async fn status(&self, id: ExecutionId) -> Result<Option<StatusView>, ClientError> {
        let resp = self
            .http
            .get(self.url(&format!("/executions/{}", id)))
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        decode(resp).await.map(Some)
    }

    pub async fn cancel(&self, id: ExecutionId) -> Result<bool, ClientError> {
        let resp = self
            .http
            .post(self.url(&format!("/executions/{}/cancel", id)))
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ClientError::NotFound(id));
        }
        let body: CancelBody = decode(resp).await?;
        Ok(body.cancelled)
    }

    /// Poll every `interval` until the execution is terminal or `max_wait`
    /// has passed.
    pub async fn wait_for_terminal(&self, id: ExecutionId) -> Result<StatusView, ClientError> {
        let started = tokio::time::Instant::now();
        loop {
            match self.status(id).await? {
                Some(view) if view.is_terminal() => return Ok(view),
                Some(view) => {
                    debug!(execution_id = %id, status = %view.status, "still waiting");
                }
                None => return Err(ClientError::NotFound(id)),
            }
            let waited = started.elapsed();
            if waited + self.interval > self.max_wait {
                return Err(ClientError::WaitTimeout { id, waited });
            }
            tokio::time::sleep(self.interval).await;
        }
    }

    pub async fn submit_and_wait(&self, request: &SubmitRequest) -> Result<StatusView, ClientError> {
        let id = self.submit(request).await?;
        self.wait_for_terminal(id).await
    }
}

async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, ClientError> {
    let status = resp.status();
    if status.is_success() {
        let env: DataEnvelope<T> = resp.json().await?;
        return Ok(env.data);
    }
    let text = resp.text().await?;
    match serde_json::from_str::<ErrorEnvelope>(&text) {
        Ok(env) => Err(ClientError::Api {
            status: status.as_u16(),
            code: env.error.code,
            message: env.error.message,
        }),
        Err(_) => Err(ClientError::Api {
            status: status.as_u16(),
            code: "unexpected_response".into(),
            message: text,
        }),
    }
}
