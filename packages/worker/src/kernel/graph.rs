//! Microsoft Graph client: client-credentials token cache, paged GETs and
//! the transport/status retry loop.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use rand::Rng;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, warn};

use crate::config::Config;

const TOKEN_SKEW: Duration = Duration::from_secs(60);
const TOKEN_FALLBACK_LIFETIME: Duration = Duration::from_secs(55 * 60);
const TRANSPORT_BACKOFF_START: Duration = Duration::from_secs(2);
const TRANSPORT_BACKOFF_CAP: Duration = Duration::from_secs(60);
const TRANSPORT_BACKOFF_JITTER_MS: u64 = 250;

#[derive(Debug, Error)]
pub enum GraphError {
    /// Terminal HTTP status from Graph (non-retryable, or retries exhausted).
    #[error("graph error {status}: {message}")]
    Status {
        status: u16,
        message: String,
        url: String,
        body: String,
    },
    /// Transport-level failure or retry exhaustion without a usable status.
    #[error("graph transport error: {0}")]
    Transport(String),
}

impl GraphError {
    pub fn status_code(&self) -> Option<u16> {
        match self {
            GraphError::Status { status, .. } => Some(*status),
            GraphError::Transport(_) => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<u64>,
}

struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

pub struct GraphClient {
    http: reqwest::Client,
    graph_base: String,
    token_url: String,
    client_id: String,
    client_secret: String,
    max_retries: u32,
    token: Mutex<Option<CachedToken>>,
}

impl GraphClient {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.graph_connect_timeout_seconds))
            .timeout(Duration::from_secs(config.graph_read_timeout_seconds))
            .build()?;

        Ok(Self {
            http,
            graph_base: config.graph_base.clone(),
            token_url: format!(
                "https://login.microsoftonline.com/{}/oauth2/v2.0/token",
                config.entra_tenant_id
            ),
            client_id: config.entra_client_id.clone(),
            client_secret: config.entra_client_secret.clone(),
            max_retries: config.graph_max_retries,
            token: Mutex::new(None),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.graph_base
    }

    fn build_url(&self, path_or_url: &str) -> String {
        build_url(&self.graph_base, path_or_url)
    }

    async fn get_token(&self) -> Result<String, GraphError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() + TOKEN_SKEW < token.expires_at {
                return Ok(token.access_token.clone());
            }
        }

        let response = self
            .http
            .post(&self.token_url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("scope", "https://graph.microsoft.com/.default"),
            ])
            .send()
            .await
            .map_err(|e| GraphError::Transport(format!("token request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            error!(%status, "graph token acquisition failed");
            return Err(GraphError::Transport(format!(
                "token request failed with status {status}"
            )));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| GraphError::Transport(format!("token response invalid: {e}")))?;

        let lifetime = body
            .expires_in
            .map(Duration::from_secs)
            .unwrap_or(TOKEN_FALLBACK_LIFETIME);
        let access_token = body.access_token.clone();
        *cached = Some(CachedToken {
            access_token: body.access_token,
            expires_at: Instant::now() + lifetime,
        });
        Ok(access_token)
    }

    async fn clear_token(&self) {
        *self.token.lock().await = None;
    }

    /// GET a JSON document, retrying transport errors, 401 (once per
    /// attempt, after clearing the token) and retryable statuses with
    /// backoff, honoring a numeric Retry-After.
    pub async fn get_json(&self, path_or_url: &str) -> Result<Value, GraphError> {
        let url = self.build_url(path_or_url);
        let mut backoff = TRANSPORT_BACKOFF_START;

        for attempt in 0..=self.max_retries {
            let token = self.get_token().await?;
            let response = match self
                .http
                .get(&url)
                .bearer_auth(&token)
                .send()
                .await
            {
                Ok(resp) => resp,
                Err(err) => {
                    if attempt >= self.max_retries {
                        error!(url = url.as_str(), error = %err, "graph request failed");
                        return Err(GraphError::Transport(format!(
                            "graph request failed: {err}"
                        )));
                    }
                    warn!(
                        url = url.as_str(),
                        attempt = attempt + 1,
                        error = %err,
                        "graph request retrying after transport error"
                    );
                    sleep_with_jitter(backoff).await;
                    backoff = (backoff * 2).min(TRANSPORT_BACKOFF_CAP);
                    continue;
                }
            };

            let status = response.status();

            if status == StatusCode::UNAUTHORIZED && attempt < self.max_retries {
                self.clear_token().await;
                warn!(
                    url = url.as_str(),
                    attempt = attempt + 1,
                    "graph request retrying after 401"
                );
                tokio::time::sleep(Duration::from_millis(500)).await;
                continue;
            }

            if is_retryable_status(status.as_u16()) && attempt < self.max_retries {
                warn!(
                    url = url.as_str(),
                    status = status.as_u16(),
                    attempt = attempt + 1,
                    "graph request retrying after retryable status"
                );
                match retry_after_seconds(response.headers()) {
                    Some(seconds) => tokio::time::sleep(Duration::from_secs(seconds)).await,
                    None => {
                        sleep_with_jitter(backoff).await;
                        backoff = (backoff * 2).min(TRANSPORT_BACKOFF_CAP);
                    }
                }
                continue;
            }

            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                let message = if body.is_empty() {
                    "request_failed".to_string()
                } else {
                    truncate(&body, 400)
                };
                error!(
                    url = url.as_str(),
                    status = status.as_u16(),
                    "graph request failed with terminal status"
                );
                return Err(GraphError::Status {
                    status: status.as_u16(),
                    message,
                    url: url.clone(),
                    body,
                });
            }

            if status == StatusCode::NO_CONTENT {
                return Ok(Value::Object(Default::default()));
            }

            return response
                .json()
                .await
                .map_err(|e| GraphError::Transport(format!("graph response was not valid JSON: {e}")));
        }

        error!(url = url.as_str(), "graph request retries exhausted");
        Err(GraphError::Transport("graph request retries exhausted".to_string()))
    }

    /// Cursor over a paged collection, following `@odata.nextLink` until
    /// exhaustion.
    pub fn paged(&self, path_or_url: &str) -> Paged<'_> {
        Paged {
            client: self,
            next_url: Some(self.build_url(path_or_url)),
            buffered: VecDeque::new(),
        }
    }

    pub async fn collect_paged(&self, path_or_url: &str) -> Result<Vec<Value>, GraphError> {
        let mut pages = self.paged(path_or_url);
        let mut items = Vec::new();
        while let Some(item) = pages.next().await? {
            items.push(item);
        }
        Ok(items)
    }
}

pub struct Paged<'a> {
    client: &'a GraphClient,
    next_url: Option<String>,
    buffered: VecDeque<Value>,
}

impl Paged<'_> {
    pub async fn next(&mut self) -> Result<Option<Value>, GraphError> {
        loop {
            if let Some(item) = self.buffered.pop_front() {
                return Ok(Some(item));
            }
            let Some(url) = self.next_url.take() else {
                return Ok(None);
            };
            let data = self.client.get_json(&url).await?;
            if let Some(items) = data.get("value").and_then(Value::as_array) {
                self.buffered.extend(items.iter().cloned());
            }
            self.next_url = data
                .get("@odata.nextLink")
                .and_then(Value::as_str)
                .map(str::to_string);
        }
    }
}

fn build_url(graph_base: &str, path_or_url: &str) -> String {
    if path_or_url.starts_with("http://") || path_or_url.starts_with("https://") {
        return path_or_url.to_string();
    }
    if path_or_url.starts_with('/') {
        format!("{graph_base}{path_or_url}")
    } else {
        format!("{graph_base}/{path_or_url}")
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
}

fn retry_after_seconds(headers: &HeaderMap) -> Option<u64> {
    headers
        .get("Retry-After")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

async fn sleep_with_jitter(backoff: Duration) {
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=TRANSPORT_BACKOFF_JITTER_MS));
    tokio::time::sleep(backoff + jitter).await;
}

pub fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_url_joins_relative_paths() {
        let base = "https://graph.microsoft.com/v1.0";
        assert_eq!(
            build_url(base, "/users?$top=999"),
            "https://graph.microsoft.com/v1.0/users?$top=999"
        );
        assert_eq!(
            build_url(base, "groups"),
            "https://graph.microsoft.com/v1.0/groups"
        );
    }

    #[test]
    fn build_url_passes_absolute_urls_through() {
        let base = "https://graph.microsoft.com/v1.0";
        let absolute = "https://graph.microsoft.com/v1.0/users?$skiptoken=abc";
        assert_eq!(build_url(base, absolute), absolute);
    }

    #[test]
    fn retryable_statuses() {
        assert!(is_retryable_status(429));
        assert!(is_retryable_status(503));
        assert!(!is_retryable_status(404));
        assert!(!is_retryable_status(401));
    }

    #[test]
    fn retry_after_parses_numeric_seconds_only() {
        let mut headers = HeaderMap::new();
        headers.insert("Retry-After", "17".parse().unwrap());
        assert_eq!(retry_after_seconds(&headers), Some(17));

        headers.insert("Retry-After", "Wed, 21 Oct 2015 07:28:00 GMT".parse().unwrap());
        assert_eq!(retry_after_seconds(&headers), None);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("abcdef", 3), "abc");
        assert_eq!(truncate("ab", 10), "ab");
    }

    #[test]
    fn status_code_only_set_for_status_errors() {
        let err = GraphError::Status {
            status: 410,
            message: "gone".into(),
            url: "u".into(),
            body: String::new(),
        };
        assert_eq!(err.status_code(), Some(410));
        assert_eq!(GraphError::Transport("boom".into()).status_code(), None);
    }
}
