use std::collections::HashMap;
use std::fmt;
use std::io::Read;
use std::thread;
use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_TYPE, RANGE,
};
use tracing::{debug, warn};

use crate::config::TransferConfig;
use crate::error::{CoreError, CoreResult};

const MAX_BACKOFF_SECS: f64 = 120.0;

#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub url: String,
    pub headers: HashMap<String, String>,
    /// Inclusive byte range.
    pub range: Option<(u64, u64)>,
    /// Deadline for the whole exchange, body included. Requests without one
    /// are bounded only by the client's per-read idle timeout.
    pub timeout: Option<Duration>,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: HashMap::new(),
            range: None,
            timeout: None,
        }
    }

    pub fn with_headers(mut self, headers: &HashMap<String, String>) -> Self {
        self.headers = headers.clone();
        self
    }

    pub fn with_range(mut self, start: u64, end: u64) -> Self {
        self.range = Some((start, end));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone)]
pub struct ProbeResponse {
    pub status_code: u16,
    pub total_bytes: Option<u64>,
    pub accept_ranges: bool,
    pub content_type: Option<String>,
}

impl ProbeResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

pub struct NetResponse {
    pub status_code: u16,
    pub content_length: Option<u64>,
    pub body: Box<dyn Read + Send>,
}

impl NetResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

impl fmt::Debug for NetResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetResponse")
            .field("status_code", &self.status_code)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

pub trait NetClient: Send + Sync {
    fn head(&self, req: &DownloadRequest) -> CoreResult<ProbeResponse>;
    fn get_stream(&self, req: &DownloadRequest) -> CoreResult<NetResponse>;
}

/// Blocking HTTP client that re-sends idempotent requests on transient
/// failures before handing the response to the caller.
///
/// `stream_timeout` is applied per send and per body read, so a slow body
/// that keeps delivering bytes never times out while a silent one does.
#[derive(Clone)]
pub struct ReqwestNetClient {
    client: Client,
    retry_count: u32,
    backoff_factor: f64,
    retry_statuses: Vec<u16>,
}

impl ReqwestNetClient {
    pub fn new(config: &TransferConfig) -> CoreResult<Self> {
        let client = Client::builder()
            .user_agent(config.user_agent.as_str())
            .connect_timeout(config.probe_timeout)
            .timeout(config.stream_timeout)
            .build()
            .map_err(|err| CoreError::Network(err.to_string()))?;
        Ok(Self {
            client,
            retry_count: config.retry_count,
            backoff_factor: config.retry_backoff_factor,
            retry_statuses: config.retry_statuses.clone(),
        })
    }

    fn request_headers(&self, req: &DownloadRequest) -> CoreResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        for (key, value) in &req.headers {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|err| CoreError::Network(err.to_string()))?;
            let value = HeaderValue::from_str(value)
                .map_err(|err| CoreError::Network(err.to_string()))?;
            headers.insert(name, value);
        }
        if let Some((start, end)) = req.range {
            let value = format!("bytes={}-{}", start, end);
            headers.insert(
                RANGE,
                HeaderValue::from_str(&value).map_err(|err| CoreError::Network(err.to_string()))?,
            );
        }
        Ok(headers)
    }

    fn send_with_retry<F>(&self, req: &DownloadRequest, build: F) -> CoreResult<Response>
    where
        F: Fn() -> CoreResult<RequestBuilder>,
    {
        let mut retry = 0u32;
        loop {
            let mut request = build()?;
            if let Some(timeout) = req.timeout {
                request = request.timeout(timeout);
            }
            match request.send() {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if retry < self.retry_count && self.retry_statuses.contains(&status) {
                        retry += 1;
                        warn!(url = %req.url, status, retry, "retrying after server error");
                        thread::sleep(backoff_delay(self.backoff_factor, retry));
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) if retry < self.retry_count && (err.is_connect() || err.is_timeout()) => {
                    retry += 1;
                    warn!(url = %req.url, retry, error = %err, "retrying after transport error");
                    thread::sleep(backoff_delay(self.backoff_factor, retry));
                }
                Err(err) => return Err(CoreError::Network(err.to_string())),
            }
        }
    }
}

impl NetClient for ReqwestNetClient {
    fn head(&self, req: &DownloadRequest) -> CoreResult<ProbeResponse> {
        let headers = self.request_headers(req)?;
        let resp = self.send_with_retry(req, || {
            Ok(self.client.head(&req.url).headers(headers.clone()))
        })?;
        let headers = resp.headers();
        let accept_ranges = headers
            .get(ACCEPT_RANGES)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.eq_ignore_ascii_case("bytes"))
            .unwrap_or(false);
        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_string());
        debug!(url = %req.url, status = resp.status().as_u16(), "HEAD");

        Ok(ProbeResponse {
            status_code: resp.status().as_u16(),
            total_bytes: header_content_length(headers),
            accept_ranges,
            content_type,
        })
    }

    fn get_stream(&self, req: &DownloadRequest) -> CoreResult<NetResponse> {
        let headers = self.request_headers(req)?;
        let resp = self.send_with_retry(req, || {
            Ok(self.client.get(&req.url).headers(headers.clone()))
        })?;
        debug!(url = %req.url, range = ?req.range, status = resp.status().as_u16(), "GET");
        Ok(NetResponse {
            status_code: resp.status().as_u16(),
            content_length: header_content_length(resp.headers()),
            body: Box::new(resp),
        })
    }
}

fn header_content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
}

/// Delay before the `retry`-th re-send (1-based). The first retry is
/// immediate, later ones double from `2 * factor` seconds.
pub fn backoff_delay(factor: f64, retry: u32) -> Duration {
    if retry <= 1 || factor <= 0.0 {
        return Duration::from_secs(0);
    }
    let secs = factor * 2f64.powi(retry as i32 - 1);
    Duration::from_secs_f64(secs.min(MAX_BACKOFF_SECS))
}
