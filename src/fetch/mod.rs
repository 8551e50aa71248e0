//! Two-strategy page fetching with a per-domain failover latch.
//!
//! Requests go through the cheap [`PrimaryFetcher`] until a domain answers
//! with an explicit block; from then on that domain is served by the shared
//! [`BrowserFetcher`] for the rest of the process.

mod browser;
mod primary;

use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use camino::Utf8Path;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::ReelError;
use crate::progress::ProgressSink;

pub use browser::{BrowserLauncher, BrowserOptions, BrowserSession, SharedBrowser};
pub use primary::{BypassClient, ClientOptions};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const PAGE_TIMEOUT: Duration = Duration::from_secs(60);

const CHALLENGE_MARKERS: [&str; 5] = [
    "cf-chl",
    "challenge-platform",
    "cf_chl_opt",
    "Just a moment...",
    "Attention Required!",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    None,
    Form(Vec<(String, String)>),
    Json(Value),
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: RequestBody,
    pub timeout: Duration,
}

impl HttpRequest {
    pub fn get(url: &str) -> Self {
        Self {
            method: HttpMethod::Get,
            url: url.to_string(),
            headers: Vec::new(),
            body: RequestBody::None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn post_form(url: &str, fields: &[(&str, &str)]) -> Self {
        Self {
            method: HttpMethod::Post,
            body: RequestBody::Form(
                fields
                    .iter()
                    .map(|(key, value)| (key.to_string(), value.to_string()))
                    .collect(),
            ),
            ..Self::get(url)
        }
    }

    pub fn post_json(url: &str, body: Value) -> Self {
        Self {
            method: HttpMethod::Post,
            body: RequestBody::Json(body),
            ..Self::get(url)
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_headers(mut self, headers: &[(String, String)]) -> Self {
        self.headers.extend(headers.iter().cloned());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedResponse {
    pub status: u16,
    pub url: String,
    pub body: String,
}

impl FetchedResponse {
    pub fn is_success(&self) -> bool {
        (200..400).contains(&self.status)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ReelError> {
        serde_json::from_str(&self.body)
            .map_err(|err| ReelError::Parse(format!("{}: {err}", self.url)))
    }
}

pub trait PrimaryFetcher: Send + Sync {
    fn send(&self, request: &HttpRequest) -> Result<FetchedResponse, ReelError>;

    fn download_to(
        &self,
        url: &str,
        headers: &[(String, String)],
        destination: &Utf8Path,
        progress: &dyn ProgressSink,
    ) -> Result<u64, ReelError>;
}

pub trait BrowserFetcher: Send + Sync {
    fn render(&self, url: &str, marker: &str, timeout: Duration) -> Result<FetchedResponse, ReelError>;
}

/// Domains whose primary strategy has been blocked. Entries are never removed.
#[derive(Debug, Default)]
pub struct FailureLatch {
    domains: RwLock<HashSet<String>>,
}

impl FailureLatch {
    pub fn is_set(&self, domain: &str) -> bool {
        self.domains
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(domain)
    }

    /// Returns true when this call flipped the latch.
    pub fn trip(&self, domain: &str) -> bool {
        self.domains
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(domain.to_string())
    }

    pub fn domains(&self) -> Vec<String> {
        let mut domains: Vec<String> = self
            .domains
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect();
        domains.sort();
        domains
    }
}

pub struct FetchLayer {
    primary: Arc<dyn PrimaryFetcher>,
    fallback: Arc<dyn BrowserFetcher>,
    latch: FailureLatch,
    page_timeout: Duration,
}

impl FetchLayer {
    pub fn new(primary: Arc<dyn PrimaryFetcher>, fallback: Arc<dyn BrowserFetcher>) -> Self {
        Self {
            primary,
            fallback,
            latch: FailureLatch::default(),
            page_timeout: PAGE_TIMEOUT,
        }
    }

    pub fn with_page_timeout(mut self, timeout: Duration) -> Self {
        self.page_timeout = timeout;
        self
    }

    /// Page markup; `marker` is the CSS selector the browser waits for.
    pub fn fetch_page(&self, url: &str, marker: &str) -> Result<String, ReelError> {
        self.with_failover(&HttpRequest::get(url), marker)
            .map(|response| response.body)
    }

    /// GET requests fail over like pages; other methods go to the primary only.
    pub fn fetch_response(&self, request: &HttpRequest) -> Result<FetchedResponse, ReelError> {
        match request.method {
            HttpMethod::Get => self.with_failover(request, "body"),
            HttpMethod::Post => self.send_direct(request),
        }
    }

    pub fn send_direct(&self, request: &HttpRequest) -> Result<FetchedResponse, ReelError> {
        let response = self.primary.send(request)?;
        if is_block_response(&response) {
            return Err(ReelError::Blocked {
                domain: domain_of(&request.url)?,
                status: response.status,
            });
        }
        if !response.is_success() {
            return Err(ReelError::Status {
                status: response.status,
                url: response.url,
            });
        }
        Ok(response)
    }

    pub fn download_to(
        &self,
        url: &str,
        headers: &[(String, String)],
        destination: &Utf8Path,
        progress: &dyn ProgressSink,
    ) -> Result<u64, ReelError> {
        self.primary.download_to(url, headers, destination, progress)
    }

    pub fn is_latched(&self, domain: &str) -> bool {
        self.latch.is_set(domain)
    }

    pub fn latched_domains(&self) -> Vec<String> {
        self.latch.domains()
    }

    fn with_failover(&self, request: &HttpRequest, marker: &str) -> Result<FetchedResponse, ReelError> {
        let domain = domain_of(&request.url)?;
        if self.latch.is_set(&domain) {
            debug!(domain = %domain, url = %request.url, "domain latched, using browser");
            return self.render(&request.url, marker);
        }

        let response = self.primary.send(request)?;
        if is_block_response(&response) {
            if self.latch.trip(&domain) {
                warn!(domain = %domain, status = response.status, "primary fetch blocked, switching domain to browser");
            }
            return self.render(&request.url, marker);
        }
        if !response.is_success() {
            return Err(ReelError::Status {
                status: response.status,
                url: response.url,
            });
        }
        Ok(response)
    }

    fn render(&self, url: &str, marker: &str) -> Result<FetchedResponse, ReelError> {
        self.fallback.render(url, marker, self.page_timeout)
    }
}

/// 403, or a 503 whose body is an anti-bot challenge.
pub fn is_block_response(response: &FetchedResponse) -> bool {
    match response.status {
        403 => true,
        503 => CHALLENGE_MARKERS
            .iter()
            .any(|marker| response.body.contains(marker)),
        _ => false,
    }
}

pub fn domain_of(url: &str) -> Result<String, ReelError> {
    let parsed = url::Url::parse(url).map_err(|err| ReelError::InvalidUrl(format!("{url}: {err}")))?;
    parsed
        .host_str()
        .map(|host| host.to_ascii_lowercase())
        .ok_or_else(|| ReelError::InvalidUrl(url.to_string()))
}

pub fn origin_of(url: &str) -> Result<String, ReelError> {
    let parsed = url::Url::parse(url).map_err(|err| ReelError::InvalidUrl(format!("{url}: {err}")))?;
    let origin = parsed.origin();
    if !origin.is_tuple() {
        return Err(ReelError::InvalidUrl(url.to_string()));
    }
    Ok(origin.ascii_serialization())
}
