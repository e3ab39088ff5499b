use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use tracing::{debug, info, warn};

use crate::config::TransferConfig;
use crate::error::{CoreError, CoreResult};
use crate::net::{DownloadRequest, NetClient, NetResponse};
use crate::segment::{part_path, plan_segments, Segment};

const STOP_NONE: u8 = 0;
const STOP_REQUESTED: u8 = 1;
const STOP_FAILED: u8 = 2;
const STOP_FINISHED: u8 = 3;

/// `(percent, bytes_done, bytes_total)`, called from worker threads.
///
/// `percent` is `100 * done / total` and is not clamped: a wrong size
/// estimate can push it past 100. With an unknown total it is `0.0`.
pub type ProgressCallback = Arc<dyn Fn(f64, u64, u64) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    Completed { bytes: u64 },
    Stopped,
}

#[derive(Debug, Default)]
struct ByteCounter {
    total: u64,
    downloaded: u64,
}

#[derive(Debug, Default)]
struct TransferState {
    counter: Mutex<ByteCounter>,
    stop: AtomicU8,
}

impl TransferState {
    fn stop_code(&self) -> u8 {
        self.stop.load(Ordering::SeqCst)
    }

    fn is_stopped(&self) -> bool {
        self.stop_code() != STOP_NONE
    }

    fn mark(&self, code: u8) {
        let _ = self
            .stop
            .compare_exchange(STOP_NONE, code, Ordering::SeqCst, Ordering::SeqCst);
    }

    fn set_total(&self, total: u64) {
        if let Ok(mut counter) = self.counter.lock() {
            counter.total = total;
        }
    }

    fn counts(&self) -> (u64, u64) {
        self.counter
            .lock()
            .map(|counter| (counter.downloaded, counter.total))
            .unwrap_or((0, 0))
    }

    fn add(&self, bytes: u64) -> (u64, u64) {
        match self.counter.lock() {
            Ok(mut counter) => {
                counter.downloaded = counter.downloaded.saturating_add(bytes);
                (counter.downloaded, counter.total)
            }
            Err(_) => (0, 0),
        }
    }

    fn report(&self, progress: Option<&ProgressCallback>, bytes: u64) {
        let (downloaded, total) = self.add(bytes);
        if let Some(callback) = progress {
            callback(percent_of(downloaded, total), downloaded, total);
        }
    }
}

fn percent_of(downloaded: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        downloaded as f64 * 100.0 / total as f64
    }
}

/// Cross-thread control over a running [`SegmentedTransfer`].
#[derive(Debug, Clone)]
pub struct TransferHandle {
    state: Arc<TransferState>,
}

impl TransferHandle {
    /// Requests a cooperative stop. Safe to call repeatedly and after the
    /// transfer has finished.
    pub fn stop(&self) {
        self.state.mark(STOP_REQUESTED);
    }

    pub fn is_stopped(&self) -> bool {
        self.state.stop_code() == STOP_REQUESTED
    }

    pub fn downloaded_bytes(&self) -> u64 {
        self.state.counts().0
    }

    pub fn total_bytes(&self) -> u64 {
        self.state.counts().1
    }
}

pub struct SegmentedTransfer {
    url: String,
    dest: PathBuf,
    headers: HashMap<String, String>,
    config: TransferConfig,
    net: Arc<dyn NetClient>,
    state: Arc<TransferState>,
    progress: Option<ProgressCallback>,
}

impl SegmentedTransfer {
    pub fn new(url: impl Into<String>, dest: impl Into<PathBuf>, net: Arc<dyn NetClient>) -> Self {
        Self {
            url: url.into(),
            dest: dest.into(),
            headers: HashMap::new(),
            config: TransferConfig::default(),
            net,
            state: Arc::new(TransferState::default()),
            progress: None,
        }
    }

    pub fn with_config(mut self, config: TransferConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_max_segments(mut self, max_segments: u32) -> Self {
        self.config.max_segments = max_segments;
        self
    }

    pub fn on_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(f64, u64, u64) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(callback));
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn dest(&self) -> &Path {
        &self.dest
    }

    pub fn handle(&self) -> TransferHandle {
        TransferHandle {
            state: Arc::clone(&self.state),
        }
    }

    pub fn stop(&self) {
        self.state.mark(STOP_REQUESTED);
    }

    pub fn total_bytes(&self) -> u64 {
        self.state.counts().1
    }

    pub fn downloaded_bytes(&self) -> u64 {
        self.state.counts().0
    }

    /// Fetches the resource into the destination. Blocks until the transfer
    /// completes, fails, or observes a stop request.
    pub fn run(&self) -> CoreResult<TransferOutcome> {
        if self.state.is_stopped() {
            return Ok(TransferOutcome::Stopped);
        }

        if let Some(parent) = self.dest.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|err| CoreError::Io(err.to_string()))?;
            }
        }

        let total = self.probe_total();
        self.state.set_total(total);

        let single_stream = total < self.config.min_split_bytes.max(1)
            || self.config.forces_single_stream(&self.url);
        let result = if single_stream {
            info!(url = %self.url, total, "single-stream transfer");
            self.run_single_stream()
        } else {
            self.run_segmented(total)
        };

        match &result {
            Ok(TransferOutcome::Completed { .. }) => self.state.mark(STOP_FINISHED),
            Ok(TransferOutcome::Stopped) => {}
            Err(_) => self.state.mark(STOP_FAILED),
        }
        result
    }

    fn probe_total(&self) -> u64 {
        let head = DownloadRequest::new(self.url.clone())
            .with_headers(&self.headers)
            .with_timeout(self.config.probe_timeout);
        match self.net.head(&head) {
            Ok(resp) if resp.is_success() => {
                if let Some(total) = resp.total_bytes.filter(|total| *total > 0) {
                    return total;
                }
            }
            Ok(resp) => debug!(url = %self.url, status = resp.status_code, "HEAD rejected"),
            Err(err) => debug!(url = %self.url, error = %err, "HEAD failed"),
        }

        match self.net.get_stream(&head) {
            Ok(resp) if resp.is_success() => resp.content_length.unwrap_or(0),
            Ok(resp) => {
                debug!(url = %self.url, status = resp.status_code, "size probe rejected");
                0
            }
            Err(err) => {
                debug!(url = %self.url, error = %err, "size probe failed");
                0
            }
        }
    }

    fn run_segmented(&self, total: u64) -> CoreResult<TransferOutcome> {
        let segments = plan_segments(total, self.config.max_segments);
        info!(url = %self.url, total, segments = segments.len(), "segmented transfer");

        let errors: Arc<Mutex<Vec<CoreError>>> = Arc::new(Mutex::new(Vec::new()));
        let mut handles: Vec<JoinHandle<()>> = Vec::with_capacity(segments.len());
        let mut spawn_error = None;

        for segment in segments.iter().copied() {
            let worker = SegmentWorker {
                url: self.url.clone(),
                headers: self.headers.clone(),
                segment,
                part: part_path(&self.dest, segment.index),
                net: Arc::clone(&self.net),
                state: Arc::clone(&self.state),
                progress: self.progress.clone(),
                config: self.config.clone(),
            };
            let errors = Arc::clone(&errors);
            let state = Arc::clone(&self.state);
            let spawned = thread::Builder::new()
                .name(format!("segment-{}", segment.index))
                .spawn(move || {
                    if let Err(err) = worker.run() {
                        state.mark(STOP_FAILED);
                        if let Ok(mut errors) = errors.lock() {
                            errors.push(err);
                        }
                    }
                });
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    self.state.mark(STOP_FAILED);
                    spawn_error = Some(CoreError::Io(err.to_string()));
                    break;
                }
            }
        }

        for handle in handles {
            if handle.join().is_err() {
                self.state.mark(STOP_FAILED);
                if let Ok(mut errors) = errors.lock() {
                    errors.push(CoreError::Io("segment worker panicked".to_string()));
                }
            }
        }

        if let Some(err) = spawn_error {
            return Err(err);
        }
        if let Ok(mut errors) = errors.lock() {
            if !errors.is_empty() {
                return Err(errors.remove(0));
            }
        }
        if self.state.is_stopped() {
            return Ok(TransferOutcome::Stopped);
        }

        self.merge_parts(&segments)?;

        let actual = fs::metadata(&self.dest)
            .map(|meta| meta.len())
            .map_err(|err| CoreError::Io(err.to_string()))?;
        if actual < total {
            return Err(CoreError::Integrity(format!(
                "Download incomplete: expected {}, got {}",
                total, actual
            )));
        }

        if let Some(callback) = &self.progress {
            callback(100.0, total, total);
        }
        Ok(TransferOutcome::Completed { bytes: actual })
    }

    fn merge_parts(&self, segments: &[Segment]) -> CoreResult<()> {
        let mut out = File::create(&self.dest).map_err(|err| CoreError::Io(err.to_string()))?;
        let mut buffer = vec![0u8; self.config.merge_block_bytes.max(1)];
        for segment in segments {
            let part = part_path(&self.dest, segment.index);
            let mut input = File::open(&part).map_err(|err| CoreError::Io(err.to_string()))?;
            loop {
                let read = match input.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(read) => read,
                    Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                    Err(err) => return Err(CoreError::Io(err.to_string())),
                };
                out.write_all(&buffer[..read])
                    .map_err(|err| CoreError::Io(err.to_string()))?;
            }
            drop(input);
            fs::remove_file(&part).map_err(|err| CoreError::Io(err.to_string()))?;
        }
        out.flush().map_err(|err| CoreError::Io(err.to_string()))?;
        Ok(())
    }

    fn run_single_stream(&self) -> CoreResult<TransferOutcome> {
        if self.state.is_stopped() {
            return Ok(TransferOutcome::Stopped);
        }
        let req = DownloadRequest::new(self.url.clone()).with_headers(&self.headers);
        let mut resp = self.net.get_stream(&req)?;
        if !resp.is_success() {
            return Err(CoreError::HttpStatus {
                status: resp.status_code,
                url: self.url.clone(),
            });
        }
        if self.total_bytes() == 0 {
            if let Some(len) = resp.content_length.filter(|len| *len > 0) {
                self.state.set_total(len);
            }
        }

        let mut file = File::create(&self.dest).map_err(|err| CoreError::Io(err.to_string()))?;
        let mut buffer = vec![0u8; self.config.chunk_bytes.max(1)];
        loop {
            if self.state.is_stopped() {
                return Ok(TransferOutcome::Stopped);
            }
            let read = read_chunk(&mut resp, &mut buffer)?;
            if read == 0 {
                break;
            }
            file.write_all(&buffer[..read])
                .map_err(|err| CoreError::Io(err.to_string()))?;
            self.state.report(self.progress.as_ref(), read as u64);
            if self.state.is_stopped() {
                return Ok(TransferOutcome::Stopped);
            }
        }
        file.flush().map_err(|err| CoreError::Io(err.to_string()))?;
        drop(file);

        let actual = fs::metadata(&self.dest).map(|meta| meta.len()).unwrap_or(0);
        if actual == 0 {
            return Err(CoreError::Integrity("Downloaded file is empty".to_string()));
        }
        let total = self.total_bytes();
        if total > 0 && actual < total {
            return Err(CoreError::Integrity(format!(
                "Download incomplete: expected {}, got {}",
                total, actual
            )));
        }
        Ok(TransferOutcome::Completed { bytes: actual })
    }
}

struct SegmentWorker {
    url: String,
    headers: HashMap<String, String>,
    segment: Segment,
    part: PathBuf,
    net: Arc<dyn NetClient>,
    state: Arc<TransferState>,
    progress: Option<ProgressCallback>,
    config: TransferConfig,
}

impl SegmentWorker {
    /// Returns `Ok(false)` when a stop was observed before the segment finished.
    fn run(self) -> CoreResult<bool> {
        if self.state.is_stopped() {
            return Ok(false);
        }
        let expected = self.segment.size();
        let req = DownloadRequest::new(self.url.clone())
            .with_headers(&self.headers)
            .with_range(self.segment.range_start, self.segment.range_end);
        let mut resp = self.net.get_stream(&req)?;

        // A 200 means the range was ignored and the body starts at byte 0.
        let mut skip = match resp.status_code {
            206 => 0,
            200 => {
                warn!(
                    url = %self.url,
                    segment = self.segment.index,
                    "server ignored range request, slicing full body"
                );
                self.segment.range_start
            }
            status => {
                return Err(CoreError::HttpStatus {
                    status,
                    url: self.url.clone(),
                })
            }
        };
        let full_body = resp.status_code == 200;

        let mut file = File::create(&self.part).map_err(|err| CoreError::Io(err.to_string()))?;
        let mut buffer = vec![0u8; self.config.chunk_bytes.max(1)];
        let mut written = 0u64;
        loop {
            if self.state.is_stopped() {
                return Ok(false);
            }
            if full_body && written >= expected {
                break;
            }
            let read = read_chunk(&mut resp, &mut buffer)?;
            if read == 0 {
                break;
            }
            let mut chunk = &buffer[..read];
            if skip > 0 {
                let skipped = skip.min(chunk.len() as u64) as usize;
                skip -= skipped as u64;
                chunk = &chunk[skipped..];
            }
            if full_body {
                let room = (expected - written).min(chunk.len() as u64) as usize;
                chunk = &chunk[..room];
            }
            if chunk.is_empty() {
                continue;
            }
            file.write_all(chunk)
                .map_err(|err| CoreError::Io(err.to_string()))?;
            written += chunk.len() as u64;
            self.state.report(self.progress.as_ref(), chunk.len() as u64);
            if self.state.is_stopped() {
                return Ok(false);
            }
        }
        file.flush().map_err(|err| CoreError::Io(err.to_string()))?;

        if written != expected {
            return Err(CoreError::Integrity(format!(
                "Chunk incomplete: expected {}, got {}",
                expected, written
            )));
        }
        debug!(segment = self.segment.index, bytes = written, "segment complete");
        Ok(true)
    }
}

fn read_chunk(resp: &mut NetResponse, buffer: &mut [u8]) -> CoreResult<usize> {
    loop {
        match resp.body.read(buffer) {
            Ok(read) => return Ok(read),
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(CoreError::Network(err.to_string())),
        }
    }
}
