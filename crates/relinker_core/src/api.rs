use std::time::Duration;

use anyhow::{Context, Result, bail};
use reqwest::Url;
use reqwest::blocking::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};

use crate::config::RelinkerConfig;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Network failure: connect, DNS, timeout or body read.
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("failed to decode response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("no edit permission for [[{title}]]: {message}")]
    PermissionDenied { title: String, message: String },

    #[error("HTTP {status} from {url}{}", format_detail(.message))]
    HttpStatus {
        url: String,
        status: u16,
        message: String,
    },

    /// Well-formed response that lacks what the operation needs.
    #[error("unusable response from {url}: {message}")]
    Unexpected { url: String, message: String },

    #[error("base URL {base} cannot carry an API path")]
    InvalidEndpoint { base: String },

    /// URL paths normalize `.` and `..` away, so these titles have no address.
    #[error("title {title:?} cannot be addressed as a URL path segment")]
    UnaddressableTitle { title: String },
}

impl ApiError {
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Self::PermissionDenied { .. })
    }
}

fn format_detail(message: &str) -> String {
    if message.is_empty() {
        String::new()
    } else {
        format!(": {message}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BacklinkKind {
    Link,
    Other(String),
}

impl BacklinkKind {
    fn from_flags(flags: &str) -> Self {
        if flags == "link" {
            Self::Link
        } else {
            Self::Other(flags.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BacklinkEntry {
    pub document: String,
    pub kind: BacklinkKind,
}

/// Current body of a page plus the single-use token needed to replace it.
/// Submitting consumes the snapshot, so a token cannot be replayed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageSnapshot {
    pub title: String,
    pub body: String,
    pub edit_token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DiscussionThread {
    #[serde(default)]
    pub slug: String,
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub updated_date: i64,
    #[serde(default)]
    pub status: String,
}

impl DiscussionThread {
    pub fn is_open(&self) -> bool {
        self.status == "normal"
    }
}

pub trait WikiReadApi {
    fn fetch_backlinks(
        &mut self,
        title: &str,
        namespace: &str,
    ) -> Result<Vec<BacklinkEntry>, ApiError>;
    fn fetch_page(&mut self, title: &str) -> Result<PageSnapshot, ApiError>;
    fn has_open_discussion(&mut self, title: &str) -> Result<bool, ApiError>;
    fn request_count(&self) -> usize;
}

pub trait WikiWriteApi: WikiReadApi {
    fn submit_edit(
        &mut self,
        page: PageSnapshot,
        body: &str,
        log_message: &str,
    ) -> Result<(), ApiError>;
}

#[derive(Debug, Clone)]
pub struct WikiClientConfig {
    pub base_url: String,
    pub token: String,
    pub user_agent: String,
    pub timeout: Duration,
    pub permission_denied_phrase: Option<String>,
}

impl WikiClientConfig {
    pub fn from_config(config: &RelinkerConfig) -> Result<Self> {
        let base_url = config
            .base_url()
            .ok_or_else(|| anyhow::anyhow!("wiki.domain is not configured"))?;
        let token = config
            .token()
            .ok_or_else(|| anyhow::anyhow!("wiki.token is not configured"))?;
        Ok(Self {
            base_url,
            token,
            user_agent: config.user_agent(),
            timeout: config.timeout(),
            permission_denied_phrase: config.permission_denied_phrase(),
        })
    }
}

/// Blocking client for the wiki's `/api` endpoints. Never retries; callers
/// decide what a failure means. Cloning shares the connection pool but not
/// the request counter.
#[derive(Debug, Clone)]
pub struct WikiClient {
    client: Client,
    base: Url,
    config: WikiClientConfig,
    request_count: usize,
}

impl WikiClient {
    pub fn new(config: WikiClientConfig) -> Result<Self> {
        let base = Url::parse(&config.base_url)
            .with_context(|| format!("invalid wiki base URL: {}", config.base_url))?;
        if base.cannot_be_a_base() {
            bail!("wiki base URL cannot carry paths: {}", config.base_url);
        }
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .context("failed to build wiki HTTP client")?;

        Ok(Self {
            client,
            base,
            config,
            request_count: 0,
        })
    }

    pub fn from_config(config: &RelinkerConfig) -> Result<Self> {
        Self::new(WikiClientConfig::from_config(config)?)
    }

    /// `{base}/api/{endpoint}/{title}` with the title escaped as one path segment.
    fn endpoint(&self, endpoint: &str, title: &str) -> Result<Url, ApiError> {
        if matches!(title, "." | "..") {
            return Err(ApiError::UnaddressableTitle {
                title: title.to_string(),
            });
        }
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| ApiError::InvalidEndpoint {
                base: self.config.base_url.clone(),
            })?
            .pop_if_empty()
            .extend(["api", endpoint, title]);
        Ok(url)
    }

    fn send(&mut self, request: RequestBuilder, url: &Url) -> Result<Response, ApiError> {
        self.request_count += 1;
        request
            .bearer_auth(&self.config.token)
            .send()
            .map_err(|source| ApiError::Transport {
                url: url.to_string(),
                source,
            })
    }

    fn read_body(response: Response, url: &Url) -> Result<(u16, String), ApiError> {
        let status = response.status().as_u16();
        let body = response.text().map_err(|source| ApiError::Transport {
            url: url.to_string(),
            source,
        })?;
        Ok((status, body))
    }
}

impl WikiReadApi for WikiClient {
    fn fetch_backlinks(
        &mut self,
        title: &str,
        namespace: &str,
    ) -> Result<Vec<BacklinkEntry>, ApiError> {
        let url = self.endpoint("backlink", title)?;
        let request = self.client.get(url.clone()).query(&[("namespace", namespace)]);
        let response = self.send(request, &url)?;
        let (status, body) = Self::read_body(response, &url)?;
        if status >= 300 {
            return Err(http_status_error(&url, status, &body));
        }
        decode_backlinks(&body).map_err(|source| ApiError::Decode {
            url: url.to_string(),
            source,
        })
    }

    fn fetch_page(&mut self, title: &str) -> Result<PageSnapshot, ApiError> {
        let url = self.endpoint("edit", title)?;
        let request = self.client.get(url.clone());
        let response = self.send(request, &url)?;
        let (status, body) = Self::read_body(response, &url)?;
        decode_edit_page(
            title,
            status,
            &body,
            self.config.permission_denied_phrase.as_deref(),
        )
        .map_err(|error| match error {
            EditPageError::Denied(message) => ApiError::PermissionDenied {
                title: title.to_string(),
                message,
            },
            EditPageError::Status(message) => ApiError::HttpStatus {
                url: url.to_string(),
                status,
                message,
            },
            EditPageError::Decode(source) => ApiError::Decode {
                url: url.to_string(),
                source,
            },
            EditPageError::MissingToken(message) => ApiError::Unexpected {
                url: url.to_string(),
                message,
            },
        })
    }

    fn has_open_discussion(&mut self, title: &str) -> Result<bool, ApiError> {
        let url = self.endpoint("discuss", title)?;
        let request = self.client.get(url.clone());
        let response = self.send(request, &url)?;
        let (status, body) = Self::read_body(response, &url)?;
        if status >= 300 {
            return Err(http_status_error(&url, status, &body));
        }
        let threads: Vec<DiscussionThread> =
            serde_json::from_str(&body).map_err(|source| ApiError::Decode {
                url: url.to_string(),
                source,
            })?;
        Ok(threads.iter().any(DiscussionThread::is_open))
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

impl WikiWriteApi for WikiClient {
    fn submit_edit(
        &mut self,
        page: PageSnapshot,
        body: &str,
        log_message: &str,
    ) -> Result<(), ApiError> {
        let url = self.endpoint("edit", &page.title)?;
        let payload = EditSubmission {
            text: body,
            log: log_message,
            token: &page.edit_token,
        };
        let request = self.client.post(url.clone()).json(&payload);
        let response = self.send(request, &url)?;
        let status = response.status();
        if status.as_u16() >= 300 {
            let (code, body) = Self::read_body(response, &url)?;
            return Err(http_status_error(&url, code, &body));
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct EditSubmission<'a> {
    text: &'a str,
    log: &'a str,
    token: &'a str,
}

#[derive(Debug, Deserialize, Default)]
struct BacklinkResponse {
    #[serde(default)]
    backlinks: Vec<BacklinkItem>,
}

#[derive(Debug, Deserialize)]
struct BacklinkItem {
    document: String,
    #[serde(default)]
    flags: String,
}

#[derive(Debug, Deserialize, Default)]
struct EditPageResponse {
    #[serde(default)]
    text: String,
    token: Option<String>,
    #[serde(default)]
    status: String,
}

#[derive(Debug)]
enum EditPageError {
    Denied(String),
    Status(String),
    Decode(serde_json::Error),
    MissingToken(String),
}

fn decode_backlinks(body: &str) -> Result<Vec<BacklinkEntry>, serde_json::Error> {
    let parsed: BacklinkResponse = serde_json::from_str(body)?;
    Ok(parsed
        .backlinks
        .into_iter()
        .map(|item| BacklinkEntry {
            kind: BacklinkKind::from_flags(&item.flags),
            document: item.document,
        })
        .collect())
}

/// The edit endpoint reports refusals in its `status` field, sometimes with a
/// 2xx code, so the phrase check runs before the HTTP status check.
fn decode_edit_page(
    title: &str,
    status: u16,
    body: &str,
    denied_phrase: Option<&str>,
) -> Result<PageSnapshot, EditPageError> {
    let parsed = serde_json::from_str::<EditPageResponse>(body);
    if let Ok(response) = &parsed
        && let Some(phrase) = denied_phrase
        && response.status.contains(phrase)
    {
        return Err(EditPageError::Denied(response.status.clone()));
    }
    if status >= 300 {
        let message = match &parsed {
            Ok(response) if !response.status.is_empty() => response.status.clone(),
            _ => body.trim().to_string(),
        };
        return Err(EditPageError::Status(message));
    }

    let response = parsed.map_err(EditPageError::Decode)?;
    let edit_token = match response.token {
        Some(token) if !token.is_empty() => token,
        _ => {
            let message = if response.status.is_empty() {
                "edit token missing from response".to_string()
            } else {
                response.status
            };
            return Err(EditPageError::MissingToken(message));
        }
    };
    Ok(PageSnapshot {
        title: title.to_string(),
        body: response.text,
        edit_token,
    })
}

fn http_status_error(url: &Url, status: u16, body: &str) -> ApiError {
    let message = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|value| {
            value
                .get("status")
                .and_then(serde_json::Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.trim().chars().take(200).collect());
    ApiError::HttpStatus {
        url: url.to_string(),
        status,
        message,
    }
}
