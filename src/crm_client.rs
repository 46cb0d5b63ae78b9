//! HTTP client for the CRM REST API.
//!
//! Implements [`RecordSource`] and [`AttachmentSource`] against a Zoho-style
//! v2 API:
//!
//! - `GET {api_base}/{module}?fields=..&page=..&per_page=..&sort_by=..&sort_order=..`
//! - `GET {api_base}/{module}/search?criteria=..` when a filter is present
//! - `GET {api_base}/{module}/{id}`
//! - `GET {api_base}/Contacts/{id}/Attachments[/{attachment_id}]`
//!
//! # Authentication
//!
//! Access tokens come from the OAuth refresh-token grant against
//! `token_url`. The token is cached and refreshed once when a request
//! returns HTTP 401.
//!
//! # Retry Strategy
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 401/429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::CrmConfig;
use crate::error::FetchError;
use crate::source::{AttachmentInfo, AttachmentSource, FetchRequest, RecordSource};

/// OAuth client credentials, read from the environment.
#[derive(Clone)]
pub struct Credentials {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
}

impl Credentials {
    /// Reads `CRM_CLIENT_ID`, `CRM_CLIENT_SECRET` and `CRM_REFRESH_TOKEN`.
    pub fn from_env() -> Result<Self> {
        let get = |name: &str| match std::env::var(name) {
            Ok(v) if !v.trim().is_empty() => Ok(v),
            _ => bail!("{} environment variable not set", name),
        };
        Ok(Self {
            client_id: get("CRM_CLIENT_ID")?,
            client_secret: get("CRM_CLIENT_SECRET")?,
            refresh_token: get("CRM_REFRESH_TOKEN")?,
        })
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

pub struct CrmClient {
    http: reqwest::Client,
    api_base: String,
    token_url: String,
    per_page: u32,
    max_retries: u32,
    retry_base: Duration,
    credentials: Credentials,
    token: Mutex<Option<String>>,
}

impl CrmClient {
    pub fn new(config: &CrmConfig, credentials: Credentials) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            token_url: config.token_url.clone(),
            per_page: config.per_page,
            max_retries: config.max_retries,
            retry_base: Duration::from_secs(1),
            credentials,
            token: Mutex::new(None),
        })
    }

    /// Override the first backoff delay (doubled on each further attempt).
    pub fn with_retry_base(mut self, base: Duration) -> Self {
        self.retry_base = base;
        self
    }

    fn url(&self, segments: &[&str]) -> Result<Url, FetchError> {
        let mut url = Url::parse(&self.api_base)
            .map_err(|e| FetchError::Other(format!("invalid api_base '{}': {}", self.api_base, e)))?;
        url.path_segments_mut()
            .map_err(|_| FetchError::Other(format!("api_base '{}' cannot be a base", self.api_base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn access_token(&self) -> Result<String, FetchError> {
        let mut guard = self.token.lock().await;
        if let Some(token) = guard.as_ref() {
            return Ok(token.clone());
        }
        let token = self.refresh_access_token().await?;
        *guard = Some(token.clone());
        Ok(token)
    }

    async fn invalidate_token(&self) {
        *self.token.lock().await = None;
    }

    async fn refresh_access_token(&self) -> Result<String, FetchError> {
        let body = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("refresh_token", &self.credentials.refresh_token)
            .append_pair("client_id", &self.credentials.client_id)
            .append_pair("client_secret", &self.credentials.client_secret)
            .append_pair("grant_type", "refresh_token")
            .finish();

        let response = self
            .http
            .post(&self.token_url)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(FetchError::Auth(format!("token endpoint returned {}: {}", status, text)));
        }

        let json: Value = serde_json::from_str(&text)
            .map_err(|e| FetchError::Auth(format!("invalid token response: {}", e)))?;
        match json.get("access_token").and_then(|t| t.as_str()) {
            Some(token) => {
                debug!("refreshed CRM access token");
                Ok(token.to_string())
            }
            None => {
                let reason = json
                    .get("error")
                    .and_then(|e| e.as_str())
                    .unwrap_or("missing access_token");
                Err(FetchError::Auth(reason.to_string()))
            }
        }
    }

    /// GET with auth, one token refresh on 401, and backoff on transient
    /// failures. Returns successful responses (including 204) only.
    async fn get(&self, url: Url) -> Result<reqwest::Response, FetchError> {
        let mut last_err = None;
        let mut refreshed = false;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, 8s, ...
                let delay = self.retry_base * (1u32 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let token = self.access_token().await?;
            let resp = self
                .http
                .get(url.clone())
                .header("Authorization", format!("Zoho-oauthtoken {}", token))
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        return Ok(response);
                    }

                    if status == StatusCode::UNAUTHORIZED && !refreshed {
                        info!("CRM rejected access token, refreshing");
                        self.invalidate_token().await;
                        refreshed = true;
                        last_err = Some(FetchError::Auth("access token rejected".to_string()));
                        continue;
                    }

                    let body = response.text().await.unwrap_or_default();

                    // Rate limited or server error: retry
                    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                        warn!(status = status.as_u16(), attempt, "transient CRM error");
                        last_err = Some(FetchError::Status {
                            status: status.as_u16(),
                            body,
                        });
                        continue;
                    }

                    if status == StatusCode::UNAUTHORIZED {
                        return Err(FetchError::Auth(body));
                    }

                    // Client error (not 429): don't retry
                    return Err(FetchError::Status {
                        status: status.as_u16(),
                        body,
                    });
                }
                Err(e) => {
                    warn!(error = %e, attempt, "CRM request failed");
                    last_err = Some(FetchError::Transport(e));
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| FetchError::Other("CRM request failed after retries".into())))
    }

    async fn get_json(&self, url: Url) -> Result<Option<Value>, FetchError> {
        let response = self.get(url).await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok(None);
        }
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| FetchError::Decode(e.to_string()))
    }
}

#[async_trait]
impl RecordSource for CrmClient {
    async fn fetch_all(&self, request: &FetchRequest) -> Result<Vec<Value>, FetchError> {
        let mut records = Vec::new();
        let mut page: u32 = 1;

        loop {
            let mut url = match &request.criteria {
                Some(_) => self.url(&[request.module.as_str(), "search"])?,
                None => self.url(&[request.module.as_str()])?,
            };
            {
                let mut query = url.query_pairs_mut();
                if let Some(criteria) = &request.criteria {
                    query.append_pair("criteria", criteria);
                }
                if !request.fields.is_empty() {
                    query.append_pair("fields", &request.fields.join(","));
                }
                query.append_pair("page", &page.to_string());
                query.append_pair("per_page", &self.per_page.to_string());
                if let Some(sort) = &request.sort {
                    query.append_pair("sort_by", &sort.field);
                    query.append_pair("sort_order", sort.order.as_str());
                }
            }

            let Some(body) = self.get_json(url).await? else {
                break;
            };

            let data = match body.get("data") {
                Some(Value::Array(items)) => items,
                None | Some(Value::Null) => break,
                Some(other) => {
                    return Err(FetchError::Decode(format!(
                        "expected `data` array, got {}",
                        type_name(other)
                    )))
                }
            };
            if data.is_empty() {
                break;
            }
            records.extend(data.iter().cloned());

            let more = body
                .pointer("/info/more_records")
                .and_then(|m| m.as_bool())
                .unwrap_or(false);
            debug!(
                module = %request.module,
                page,
                page_records = data.len(),
                more,
                "fetched page"
            );
            if !more {
                break;
            }
            page += 1;
        }

        Ok(records)
    }

    async fn fetch_record(&self, module: &str, id: &str) -> Result<Option<Value>, FetchError> {
        let url = self.url(&[module, id])?;
        let body = match self.get_json(url).await {
            Ok(body) => body,
            Err(FetchError::Status { status: 404, .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        Ok(body.and_then(|b| match b.get("data") {
            Some(Value::Array(items)) => items.first().cloned(),
            Some(obj @ Value::Object(_)) => Some(obj.clone()),
            _ => None,
        }))
    }
}

#[async_trait]
impl AttachmentSource for CrmClient {
    async fn list_attachments(&self, contact_id: &str) -> Result<Vec<AttachmentInfo>, FetchError> {
        let url = self.url(&["Contacts", contact_id, "Attachments"])?;
        let Some(body) = self.get_json(url).await? else {
            return Ok(Vec::new());
        };
        let items = body
            .get("data")
            .and_then(|d| d.as_array())
            .cloned()
            .unwrap_or_default();

        let mut attachments = Vec::with_capacity(items.len());
        for item in items {
            match serde_json::from_value::<AttachmentInfo>(item) {
                Ok(info) => attachments.push(info),
                Err(e) => warn!(contact_id, error = %e, "skipping malformed attachment entry"),
            }
        }
        Ok(attachments)
    }

    async fn download_attachment(
        &self,
        contact_id: &str,
        attachment_id: &str,
    ) -> Result<Vec<u8>, FetchError> {
        let url = self.url(&["Contacts", contact_id, "Attachments", attachment_id])?;
        let response = self.get(url).await?;
        let bytes = response.bytes().await?;
        Ok(bytes.to_vec())
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(api_base: &str) -> CrmClient {
        let config = CrmConfig {
            api_base: api_base.to_string(),
            ..CrmConfig::default()
        };
        CrmClient::new(
            &config,
            Credentials {
                client_id: "id".into(),
                client_secret: "secret".into(),
                refresh_token: "refresh".into(),
            },
        )
        .unwrap()
    }

    #[test]
    fn builds_urls_under_api_base() {
        let c = client("https://crm.example.com/crm/v2/");
        let url = c.url(&["Contacts", "search"]).unwrap();
        assert_eq!(url.as_str(), "https://crm.example.com/crm/v2/Contacts/search");
    }

    #[test]
    fn bare_host_api_base_has_no_double_slash() {
        let c = client("http://127.0.0.1:8080");
        let url = c.url(&["Accounts"]).unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:8080/Accounts");
    }

    #[test]
    fn path_segments_are_escaped() {
        let c = client("https://crm.example.com/crm/v2");
        let url = c.url(&["Contacts", "a/b"]).unwrap();
        assert_eq!(url.as_str(), "https://crm.example.com/crm/v2/Contacts/a%2Fb");
    }

    #[test]
    fn debug_output_hides_secrets() {
        let creds = Credentials {
            client_id: "id".into(),
            client_secret: "very-secret".into(),
            refresh_token: "refresh-me".into(),
        };
        let shown = format!("{:?}", creds);
        assert!(!shown.contains("very-secret"));
        assert!(!shown.contains("refresh-me"));
    }
}
