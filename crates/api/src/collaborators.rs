//! HTTP clients for the external report and artifact services.
//!
//! Both run on worker threads, so they use reqwest's blocking client. Build
//! them outside any tokio runtime context.

use std::time::Duration;

use chrono::NaiveDate;
use reqwest::StatusCode;
use reqwest::blocking::{Client, Response};
use serde::{Deserialize, Serialize};
use tracing::debug;

use reportflow_core::{ArtifactRef, ReportPayload, Ticker};
use reportflow_infra::collaborators::{
    ArtifactRenderer, ArtifactRequest, CollaboratorError, ReportComputer,
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

fn client(timeout: Duration) -> Result<Client, reqwest::Error> {
    Client::builder().timeout(timeout).build()
}

/// Timeouts, connection failures, 429 and 5xx are worth retrying; any other
/// non-success status is permanent.
fn classify(err: reqwest::Error) -> CollaboratorError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        CollaboratorError::Transient(err.to_string())
    } else {
        CollaboratorError::Permanent(err.to_string())
    }
}

fn check_status(res: Response) -> Result<Response, CollaboratorError> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    let body = res.text().unwrap_or_default();
    let message = format!("{status}: {}", body.chars().take(200).collect::<String>());
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        Err(CollaboratorError::Transient(message))
    } else {
        Err(CollaboratorError::Permanent(message))
    }
}

#[derive(Debug, Serialize)]
struct ReportRequest<'a> {
    ticker: &'a str,
    date: NaiveDate,
}

/// `POST {base_url}/reports` with `{ ticker, date }`; the JSON response body
/// is the report payload.
#[derive(Debug, Clone)]
pub struct HttpReportComputer {
    client: Client,
    base_url: String,
}

impl HttpReportComputer {
    pub fn new(base_url: impl Into<String>) -> Result<Self, reqwest::Error> {
        Self::with_timeout(base_url, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: client(timeout)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

impl ReportComputer for HttpReportComputer {
    fn compute_report(&self, ticker: &Ticker, date: NaiveDate) -> Result<ReportPayload, CollaboratorError> {
        let url = format!("{}/reports", self.base_url);
        debug!(ticker = %ticker, date = %date, %url, "requesting report");
        let res = self
            .client
            .post(&url)
            .json(&ReportRequest {
                ticker: ticker.as_str(),
                date,
            })
            .send()
            .map_err(classify)?;
        let payload = check_status(res)?
            .json::<serde_json::Value>()
            .map_err(|e| CollaboratorError::Permanent(format!("malformed report: {e}")))?;
        Ok(ReportPayload(payload))
    }
}

#[derive(Debug, Deserialize)]
struct RenderResponse {
    artifact_ref: String,
}

/// `POST {base_url}/artifacts` with the cached result; expects
/// `{ "artifact_ref": "..." }` back.
#[derive(Debug, Clone)]
pub struct HttpArtifactRenderer {
    client: Client,
    base_url: String,
}

impl HttpArtifactRenderer {
    pub fn new(base_url: impl Into<String>) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: client(DEFAULT_TIMEOUT)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

impl ArtifactRenderer for HttpArtifactRenderer {
    fn render(&self, request: &ArtifactRequest) -> Result<ArtifactRef, CollaboratorError> {
        let url = format!("{}/artifacts", self.base_url);
        let res = self.client.post(&url).json(request).send().map_err(classify)?;
        let body = check_status(res)?
            .json::<RenderResponse>()
            .map_err(|e| CollaboratorError::Permanent(format!("malformed render response: {e}")))?;
        if body.artifact_ref.is_empty() {
            return Err(CollaboratorError::Permanent("empty artifact_ref".into()));
        }
        Ok(ArtifactRef(body.artifact_ref))
    }
}
