//! Asking the backend for a newer schedule.

use anyhow::{bail, Context, Result};
use reqwest::blocking::Client;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::config::Config;
use crate::fs::durable::{self, Record};
use crate::models::ScheduleDescriptor;

pub const NO_NEWER_SCHEDULE: &str = "no-newer-sched-available";

/// Body of a schedule request.
#[derive(Debug, Serialize)]
pub struct FetchRequest<'a> {
    pub sched: &'a ScheduleDescriptor,
    /// Local clock, Unix seconds
    pub ts: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FetchResponse {
    NoNewer,
    /// An unvalidated schedule document
    Candidate(Value),
}

pub trait ScheduleSource {
    fn fetch(&self, current: &ScheduleDescriptor, now_ts: i64) -> Result<FetchResponse>;
}

/// Strip the transport wrapping from a schedule document.
///
/// Accepts a bare document, `{"data": ...}`, or a full record envelope
/// with a digest (which is verified).
pub fn unwrap_document(body: Value) -> Result<Value> {
    if body.get("sha256").is_some() {
        return match durable::open_envelope(body)? {
            Record::Present(data) => Ok(data),
            Record::Corrupt(reason) => bail!("Schedule document failed verification: {reason}"),
            Record::Absent => bail!("Empty schedule document"),
        };
    }
    match body.get("data") {
        Some(data) => Ok(data.clone()),
        None => Ok(body),
    }
}

/// Make sense of a response body.
pub fn interpret_response(body: Value) -> Result<FetchResponse> {
    let document = unwrap_document(body)?;

    match document.get("whatami").and_then(Value::as_str) {
        Some(NO_NEWER_SCHEDULE) => Ok(FetchResponse::NoNewer),
        Some(_) => Ok(FetchResponse::Candidate(document)),
        None => bail!("Schedule response has no \"whatami\""),
    }
}

pub struct HttpScheduleSource {
    client: Client,
    endpoint: String,
    token: Option<String>,
}

impl HttpScheduleSource {
    /// `None` when no endpoint is configured.
    pub fn from_config(config: &Config) -> Result<Option<Self>> {
        let Some(endpoint) = config.schedule_endpoint.clone() else {
            return Ok(None);
        };
        let client = Client::builder()
            .connect_timeout(config.request_timeout())
            .timeout(config.request_timeout())
            .user_agent(concat!("vinectl/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Some(Self {
            client,
            endpoint,
            token: config.api_token.clone(),
        }))
    }
}

impl ScheduleSource for HttpScheduleSource {
    fn fetch(&self, current: &ScheduleDescriptor, now_ts: i64) -> Result<FetchResponse> {
        let mut request = self.client.post(&self.endpoint).json(&FetchRequest {
            sched: current,
            ts: now_ts,
        });
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        debug!(endpoint = %self.endpoint, id = current.id, "requesting schedule");
        let response = request
            .send()
            .with_context(|| format!("Failed to reach {}", self.endpoint))?;

        let status = response.status();
        if !status.is_success() {
            bail!(
                "Schedule endpoint returned HTTP {} - {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("Unknown error")
            );
        }

        let body: Value = response.json().context("Schedule response is not JSON")?;
        let interpreted = interpret_response(body)?;
        if let FetchResponse::Candidate(_) = &interpreted {
            info!("backend offered a new schedule");
        }
        Ok(interpreted)
    }
}
