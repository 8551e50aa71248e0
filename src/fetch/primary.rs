use std::collections::HashSet;
use std::fs;
use std::io::{Read, Write};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use camino::Utf8Path;
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, CONTENT_LENGTH, HeaderMap, HeaderValue, USER_AGENT};
use tempfile::Builder;
use tracing::debug;

use super::{FetchedResponse, HttpMethod, HttpRequest, PrimaryFetcher, RequestBody, origin_of};
use crate::config;
use crate::error::ReelError;
use crate::progress::{ProgressSink, TransferTracker};
use crate::settings::Settings;

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60 * 60);
const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub check_cert: bool,
    pub proxy: Option<String>,
    pub connect_timeout: Duration,
    pub timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            check_cert: true,
            proxy: None,
            connect_timeout: Duration::from_secs(15),
            timeout: Duration::from_secs(60),
        }
    }
}

impl ClientOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        let proxy = settings.proxy.trim();
        Self {
            check_cert: settings.check_cert,
            proxy: (!proxy.is_empty()).then(|| proxy.to_string()),
            ..Self::default()
        }
    }
}

/// HTTP client dressed as a desktop browser, with a cookie jar and a
/// one-time origin visit per host to pick up clearance cookies.
pub struct BypassClient {
    client: Client,
    visited: Mutex<HashSet<String>>,
}

impl BypassClient {
    pub fn new(options: &ClientOptions) -> Result<Self, ReelError> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(config::USER_AGENT));
        headers.insert(
            ACCEPT,
            HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8",
            ),
        );
        headers.insert(
            ACCEPT_LANGUAGE,
            HeaderValue::from_static("zh-CN,zh;q=0.9,en-US;q=0.8,en;q=0.7"),
        );
        headers.insert(
            "sec-ch-ua",
            HeaderValue::from_static(
                "\"Chromium\";v=\"142\", \"Google Chrome\";v=\"142\", \"Not_A Brand\";v=\"99\"",
            ),
        );
        headers.insert("sec-ch-ua-mobile", HeaderValue::from_static("?0"));
        headers.insert("sec-ch-ua-platform", HeaderValue::from_static("\"Windows\""));
        headers.insert("upgrade-insecure-requests", HeaderValue::from_static("1"));

        let mut builder = Client::builder()
            .default_headers(headers)
            .cookie_store(true)
            .connect_timeout(options.connect_timeout)
            .timeout(options.timeout)
            .danger_accept_invalid_certs(!options.check_cert);
        if let Some(proxy) = &options.proxy {
            let proxy =
                reqwest::Proxy::all(proxy).map_err(|err| ReelError::Transport(err.to_string()))?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|err| ReelError::Transport(err.to_string()))?;

        Ok(Self {
            client,
            visited: Mutex::new(HashSet::new()),
        })
    }

    fn visit_origin(&self, url: &str) {
        let Ok(origin) = origin_of(url) else {
            return;
        };
        let first_visit = self
            .visited
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(origin.clone());
        if !first_visit {
            return;
        }
        match self.client.get(&origin).send() {
            Ok(response) => {
                debug!(origin = %origin, status = response.status().as_u16(), "origin handshake")
            }
            Err(err) => debug!(origin = %origin, error = %err, "origin handshake failed"),
        }
    }

    fn build(&self, request: &HttpRequest) -> RequestBuilder {
        let mut builder = match request.method {
            HttpMethod::Get => self.client.get(&request.url),
            HttpMethod::Post => self.client.post(&request.url),
        };
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder = match &request.body {
            RequestBody::None => builder,
            RequestBody::Form(fields) => builder.form(fields),
            RequestBody::Json(value) => builder.json(value),
        };
        builder.timeout(request.timeout)
    }
}

impl PrimaryFetcher for BypassClient {
    fn send(&self, request: &HttpRequest) -> Result<FetchedResponse, ReelError> {
        self.visit_origin(&request.url);
        let response = self
            .build(request)
            .send()
            .map_err(|err| ReelError::Transport(err.to_string()))?;
        let status = response.status().as_u16();
        let url = response.url().to_string();
        let body = response
            .text()
            .map_err(|err| ReelError::Transport(err.to_string()))?;
        debug!(url = %url, status, bytes = body.len(), "fetched");
        Ok(FetchedResponse { status, url, body })
    }

    fn download_to(
        &self,
        url: &str,
        headers: &[(String, String)],
        destination: &Utf8Path,
        progress: &dyn ProgressSink,
    ) -> Result<u64, ReelError> {
        let request = HttpRequest::get(url)
            .with_headers(headers)
            .with_timeout(DOWNLOAD_TIMEOUT);
        let mut response = self
            .build(&request)
            .send()
            .map_err(|err| ReelError::Transport(err.to_string()))?;
        let status = response.status().as_u16();
        if !response.status().is_success() {
            return Err(ReelError::Status {
                status,
                url: url.to_string(),
            });
        }
        let total = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok());

        let parent = destination
            .parent()
            .ok_or_else(|| ReelError::Filesystem(format!("no parent for {destination}")))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| ReelError::Filesystem(err.to_string()))?;
        let mut temp = Builder::new()
            .prefix(".reelsync-part")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| ReelError::Filesystem(err.to_string()))?;

        let label = destination.file_name().unwrap_or(destination.as_str());
        let mut tracker = TransferTracker::new(label, total);
        let mut buffer = vec![0u8; CHUNK_SIZE];
        loop {
            let read = response
                .read(&mut buffer)
                .map_err(|err| ReelError::Transport(err.to_string()))?;
            if read == 0 {
                break;
            }
            temp.write_all(&buffer[..read])
                .map_err(|err| ReelError::Filesystem(err.to_string()))?;
            tracker.advance(read as u64, progress);
        }
        temp.flush()
            .map_err(|err| ReelError::Filesystem(err.to_string()))?;
        temp.persist(destination.as_std_path())
            .map_err(|err| ReelError::Filesystem(err.to_string()))?;
        tracker.finish(progress);
        Ok(tracker.received())
    }
}
