use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use event_queue::LeasedItem;
use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderValue, USER_AGENT};
use serde::Serialize;

use crate::secret::ApiKey;
use crate::version;

const EVENTS_BATCH_PATH: &str = "/api/v1/events/batch";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const BODY_EXCERPT_MAX: usize = 512;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("intake returned HTTP {status}: {body_excerpt}")]
    Status {
        status: StatusCode,
        body_excerpt: String,
    },
    #[error("failed to reach intake")]
    Network(#[from] reqwest::Error),
    #[error("failed to encode events batch")]
    Encode(#[source] serde_json::Error),
    #[error("send was cancelled by shutdown")]
    Cancelled,
}

impl TransportError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransportError::Cancelled)
    }
}

/// Ships one leased batch to the remote intake.
///
/// The trait is the seam between the sender and the HTTP stack; tests
/// substitute scripted implementations.
#[async_trait]
pub trait BatchTransport: Send + Sync {
    async fn send_batch(&self, items: &[LeasedItem]) -> Result<(), TransportError>;
}

/// Wire element: the stored payload is re-embedded as JSON structure, not
/// as an escaped string.
#[derive(Serialize)]
struct EventRecord<'a> {
    id: i64,
    created_utc: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
    payload: serde_json::Value,
}

pub struct EventsClient {
    http: reqwest::Client,
    endpoint: String,
    auth_header: HeaderValue,
    user_agent: HeaderValue,
    first_batch_delivered: AtomicBool,
}

impl EventsClient {
    pub fn new(api_url: &str, api_key: &ApiKey) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;

        let endpoint = format!("{}{EVENTS_BATCH_PATH}", api_url.trim_end_matches('/'));

        let mut auth_header = HeaderValue::from_str(&format!("Bearer {}", api_key.expose()))
            .context("api key contains characters invalid in a header")?;
        // Keeps the key out of any header Debug output.
        auth_header.set_sensitive(true);

        let user_agent = HeaderValue::from_str(&format!("TRAPD-Agent/{}", version::agent_version()))
            .context("invalid user agent header (this is a bug)")?;

        Ok(Self {
            http,
            endpoint,
            auth_header,
            user_agent,
            first_batch_delivered: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl BatchTransport for EventsClient {
    async fn send_batch(&self, items: &[LeasedItem]) -> Result<(), TransportError> {
        let body = batch_body(items)?;

        debug!(count = items.len(), endpoint = %self.endpoint, "Posting events batch");

        let response = self
            .http
            .post(&self.endpoint)
            .header(AUTHORIZATION, self.auth_header.clone())
            .header(CONTENT_TYPE, "application/json; charset=utf-8")
            .header(USER_AGENT, self.user_agent.clone())
            .body(body.clone())
            .send()
            .await?;

        let status = response.status();
        let response_body = response.text().await.unwrap_or_default();
        let body_excerpt = excerpt(&response_body);

        info!(status = status.as_u16(), body = %body_excerpt, "Events batch response");

        if !status.is_success() {
            return Err(TransportError::Status { status, body_excerpt });
        }

        if !self.first_batch_delivered.swap(true, Ordering::Relaxed) {
            info!(%body, "First events batch delivered");
        } else {
            debug!(%body, "Events batch delivered");
        }

        Ok(())
    }
}

fn batch_body(items: &[LeasedItem]) -> Result<String, TransportError> {
    let records = items
        .iter()
        .map(|item| {
            let payload = serde_json::from_str(&item.payload_json).map_err(TransportError::Encode)?;

            Ok(EventRecord {
                id: item.id,
                created_utc: &item.created_utc,
                kind: &item.kind,
                payload,
            })
        })
        .collect::<Result<Vec<_>, TransportError>>()?;

    serde_json::to_string(&records).map_err(TransportError::Encode)
}

/// First `BODY_EXCERPT_MAX` bytes of `body`, cut on a char boundary.
fn excerpt(body: &str) -> String {
    if body.len() <= BODY_EXCERPT_MAX {
        return body.to_owned();
    }

    let mut end = BODY_EXCERPT_MAX;
    while !body.is_char_boundary(end) {
        end -= 1;
    }

    format!("{}…", &body[..end])
}
