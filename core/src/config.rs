use std::time::Duration;

use url::Url;

#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub max_segments: u32,
    pub min_split_bytes: u64,
    pub chunk_bytes: usize,
    pub merge_block_bytes: usize,
    /// Deadline for a whole HEAD or size-discovery exchange, and for connecting.
    pub probe_timeout: Duration,
    /// Longest wait for a single body read before a stream is considered
    /// stalled. Applied by the net client built from this config.
    pub stream_timeout: Duration,
    pub retry_count: u32,
    pub retry_backoff_factor: f64,
    pub retry_statuses: Vec<u16>,
    pub user_agent: String,
    /// Hosts that do not reliably honor range requests. Matched against the
    /// URL host, subdomains included.
    pub single_stream_hosts: Vec<String>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_segments: 8,
            min_split_bytes: 1024 * 1024,
            chunk_bytes: 64 * 1024,
            merge_block_bytes: 1024 * 1024,
            probe_timeout: Duration::from_secs(10),
            stream_timeout: Duration::from_secs(60),
            retry_count: 5,
            retry_backoff_factor: 1.0,
            retry_statuses: vec![500, 502, 503, 504],
            user_agent: "VidFetch/0.1".to_string(),
            single_stream_hosts: vec!["googlevideo.com".to_string(), "youtube.com".to_string()],
        }
    }
}

impl TransferConfig {
    pub fn forces_single_stream(&self, url: &str) -> bool {
        let host = Url::parse(url)
            .ok()
            .and_then(|parsed| parsed.host_str().map(|host| host.to_ascii_lowercase()));
        match host {
            Some(host) => self.single_stream_hosts.iter().any(|entry| {
                let entry = entry.to_ascii_lowercase();
                host == entry || host.ends_with(&format!(".{}", entry))
            }),
            None => self
                .single_stream_hosts
                .iter()
                .any(|entry| url.contains(entry.as_str())),
        }
    }
}
