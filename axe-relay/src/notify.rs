//! Outbound notifications.
//!
//! The monitor talks to the chat channel only through [`Notifier`]. Two
//! implementations ship: [`LogNotifier`], which writes everything to the
//! log, and [`WebhookNotifier`], which posts to a Discord-style webhook
//! and keeps the status messages up to date by editing them in place.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::RETRY_AFTER;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::summary::StatusSummary;
use crate::tracing::prelude::*;

/// Wait used when a 429 response says nothing about when to retry.
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(5);

/// Longest message body the webhook accepts, in characters.
pub const MAX_CONTENT_CHARS: usize = 2000;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NotifyError {
    /// The server asked us to slow down.
    #[error("rate limited, retry after {retry_after:?}")]
    Throttled { retry_after: Duration },

    #[error("rejected with HTTP status {status}")]
    Rejected { status: u16 },

    #[error("transport error: {0}")]
    Transport(String),
}

impl From<reqwest::Error> for NotifyError {
    fn from(err: reqwest::Error) -> Self {
        // The webhook URL embeds its token; keep it out of messages.
        NotifyError::Transport(err.without_url().to_string())
    }
}

/// Destination for alerts and the periodic summary.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Post one alert message.
    async fn send_alert(&self, text: &str) -> Result<(), NotifyError>;

    /// Publish the current summary, replacing the previous one where the
    /// channel supports it.
    async fn publish_summary(&self, summary: &StatusSummary) -> Result<(), NotifyError>;
}

/// Notifier that only logs. Used when no webhook is configured.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_alert(&self, text: &str) -> Result<(), NotifyError> {
        warn!(alert = text, "Alert");
        Ok(())
    }

    async fn publish_summary(&self, summary: &StatusSummary) -> Result<(), NotifyError> {
        info!(
            devices = summary.devices.len(),
            online = summary.online_count(),
            "Status summary"
        );
        debug!("\n{summary}");
        Ok(())
    }
}

#[derive(Deserialize)]
struct PostedMessage {
    id: String,
}

#[derive(Deserialize)]
struct RateLimitBody {
    retry_after: f64,
}

/// Posts to a chat webhook.
///
/// Alerts are posted as new messages. The summary is split at device
/// boundaries into as many messages as the length limit needs. Each is
/// posted once with `?wait=true` so the server returns its id, and later
/// summaries edit those messages in order. Messages the summary no longer
/// needs are deleted; if one has been deleted by someone else, it and
/// everything after it are posted again.
#[derive(Debug)]
pub struct WebhookNotifier {
    http: reqwest::Client,
    url: String,
    summary_messages: Mutex<Vec<String>>,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: url.into().trim_end_matches('/').to_string(),
            summary_messages: Mutex::new(Vec::new()),
        }
    }

    async fn post(&self, content: &str, wait: bool) -> Result<reqwest::Response, NotifyError> {
        let url = if wait {
            with_query(&self.url, "wait=true")
        } else {
            self.url.clone()
        };
        let response = self
            .http
            .post(url)
            .timeout(REQUEST_TIMEOUT)
            .json(&json!({ "content": content }))
            .send()
            .await?;
        check(response).await
    }

    async fn edit(&self, id: &str, content: &str) -> Result<reqwest::Response, NotifyError> {
        let url = message_url(&self.url, id);
        let response = self
            .http
            .patch(url)
            .timeout(REQUEST_TIMEOUT)
            .json(&json!({ "content": content }))
            .send()
            .await?;
        check(response).await
    }

    async fn delete(&self, id: &str) -> Result<(), NotifyError> {
        let url = message_url(&self.url, id);
        let response = self
            .http
            .delete(url)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send_alert(&self, text: &str) -> Result<(), NotifyError> {
        let content = truncate_chars(text, MAX_CONTENT_CHARS);
        if content.len() < text.len() {
            warn!(
                chars = text.chars().count(),
                limit = MAX_CONTENT_CHARS,
                "Alert too long, truncated"
            );
        }
        self.post(content, false).await?;
        Ok(())
    }

    async fn publish_summary(&self, summary: &StatusSummary) -> Result<(), NotifyError> {
        let chunks = pack_sections(&summary.sections(), MAX_CONTENT_CHARS);
        let mut ids = self.summary_messages.lock().await;

        let mut edited = 0;
        while edited < chunks.len().min(ids.len()) {
            let result = self.edit(&ids[edited], &chunks[edited]).await;
            match result {
                Ok(_) => edited += 1,
                Err(NotifyError::Rejected { status: 404 }) => {
                    let gone = ids.remove(edited);
                    warn!(message_id = %gone, "Status message gone, posting a new one");
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        // Messages after a gone one would end up above the re-posted
        // chunks, so they go too.
        for id in ids.split_off(edited) {
            match self.delete(&id).await {
                Ok(()) | Err(NotifyError::Rejected { status: 404 }) => {
                    debug!(message_id = %id, "Old status message deleted");
                }
                Err(e) => warn!(message_id = %id, error = %e, "Failed to delete old status message"),
            }
        }

        for chunk in &chunks[edited..] {
            let response = self.post(chunk, true).await?;
            let posted: PostedMessage = response.json().await?;
            info!(message_id = %posted.id, "Status message created");
            ids.push(posted.id);
        }
        debug!(messages = ids.len(), "Status messages updated");
        Ok(())
    }
}

/// Turn a non-success response into an error.
async fn check(response: reqwest::Response) -> Result<reqwest::Response, NotifyError> {
    let status = response.status();
    if status == StatusCode::TOO_MANY_REQUESTS {
        let header = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await.unwrap_or_default();
        return Err(NotifyError::Throttled {
            retry_after: retry_after(header.as_deref(), &body),
        });
    }
    if !status.is_success() {
        return Err(NotifyError::Rejected {
            status: status.as_u16(),
        });
    }
    Ok(response)
}

/// Server-requested wait: the JSON body's `retry_after` (seconds,
/// fractional) wins over the `Retry-After` header.
fn retry_after(header: Option<&str>, body: &[u8]) -> Duration {
    let from_body = serde_json::from_slice::<RateLimitBody>(body)
        .ok()
        .map(|b| b.retry_after);
    let from_header = header.and_then(|h| h.trim().parse::<f64>().ok());

    from_body
        .or(from_header)
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .filter(|d| !d.is_zero())
        .unwrap_or(DEFAULT_RETRY_AFTER)
}

fn with_query(url: &str, query: &str) -> String {
    let sep = if url.contains('?') { '&' } else { '?' };
    format!("{url}{sep}{query}")
}

/// `<webhook>/messages/<id>`, keeping any query string at the end.
fn message_url(url: &str, id: &str) -> String {
    match url.split_once('?') {
        Some((base, query)) => format!("{base}/messages/{id}?{query}"),
        None => format!("{url}/messages/{id}"),
    }
}

/// Joins sections with newlines into as few messages of at most `limit`
/// characters as possible, breaking only between sections. A section
/// that alone exceeds the limit is truncated.
fn pack_sections(sections: &[String], limit: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_chars = 0;

    for section in sections {
        let section = section.as_str();
        let mut chars = section.chars().count();
        let section = if chars > limit {
            warn!(chars, limit, "Summary section too long, truncated");
            chars = limit;
            truncate_chars(section, limit)
        } else {
            section
        };

        if !current.is_empty() && current_chars + 1 + chars > limit {
            chunks.push(std::mem::take(&mut current));
            current_chars = 0;
        }
        if !current.is_empty() {
            current.push('\n');
            current_chars += 1;
        }
        current.push_str(section);
        current_chars += chars;
    }

    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// The first `limit` characters of `text`.
fn truncate_chars(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((cut, _)) => &text[..cut],
        None => text,
    }
}
