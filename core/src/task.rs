use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::TransferConfig;
use crate::error::{CoreError, CoreResult};
use crate::mux::{FfmpegMuxer, Muxer};
use crate::net::{NetClient, ReqwestNetClient};
use crate::observer::{ObserverId, ObserverRegistry, TaskObserver};
use crate::progress::{eta_secs, eta_text, speed_text, PhaseMeter};
use crate::transfer::{SegmentedTransfer, TransferHandle, TransferOutcome};

pub type TaskId = Uuid;

const STOP_NONE: u8 = 0;
const STOP_PAUSED: u8 = 1;
const STOP_CANCELED: u8 = 2;

/// A video-only result smaller than this is almost always an error page or
/// a redirect body rather than media.
pub const MIN_VIDEO_ONLY_BYTES: u64 = 100 * 1024;
pub const ERROR_MESSAGE_LIMIT: usize = 50;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum StreamKind {
    Video,
    Audio,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Video => "Video",
            StreamKind::Audio => "Audio",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TaskPhase {
    Waiting,
    Downloading,
    Processing,
    Paused,
    Cancelled,
    Completed,
    Error,
}

impl TaskPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPhase::Waiting => "waiting",
            TaskPhase::Downloading => "downloading",
            TaskPhase::Processing => "processing",
            TaskPhase::Paused => "paused",
            TaskPhase::Cancelled => "cancelled",
            TaskPhase::Completed => "completed",
            TaskPhase::Error => "error",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "waiting" => Some(TaskPhase::Waiting),
            "downloading" => Some(TaskPhase::Downloading),
            "processing" => Some(TaskPhase::Processing),
            "paused" => Some(TaskPhase::Paused),
            "cancelled" => Some(TaskPhase::Cancelled),
            "completed" => Some(TaskPhase::Completed),
            "error" => Some(TaskPhase::Error),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskPhase::Completed | TaskPhase::Cancelled | TaskPhase::Error
        )
    }

    fn can_start(&self) -> bool {
        matches!(self, TaskPhase::Waiting | TaskPhase::Paused | TaskPhase::Error)
    }
}

impl fmt::Display for TaskPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub phase: TaskPhase,
    /// Percent of the current phase; may exceed 100 when the probed size
    /// was too small.
    pub progress: f64,
    /// Which stream the progress belongs to ("Video", "Audio") or the
    /// post-processing step.
    pub label: String,
    pub bytes_done: u64,
    pub bytes_total: u64,
    pub speed_text: String,
    pub eta_text: String,
    /// At most [`ERROR_MESSAGE_LIMIT`] characters.
    pub error_message: Option<String>,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self {
            phase: TaskPhase::Waiting,
            progress: 0.0,
            label: String::new(),
            bytes_done: 0,
            bytes_total: 0,
            speed_text: String::new(),
            eta_text: String::new(),
            error_message: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub title: String,
    pub output_path: PathBuf,
    pub thumbnail_url: Option<String>,
    pub status: TaskStatus,
}

#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub title: String,
    pub video_url: Option<String>,
    pub audio_url: Option<String>,
    pub output_path: PathBuf,
    pub thumbnail_url: Option<String>,
    pub headers: HashMap<String, String>,
}

impl TaskSpec {
    pub fn new(title: impl Into<String>, output_path: impl Into<PathBuf>) -> Self {
        Self {
            title: title.into(),
            video_url: None,
            audio_url: None,
            output_path: output_path.into(),
            thumbnail_url: None,
            headers: HashMap::new(),
        }
    }

    pub fn with_video(mut self, url: impl Into<String>) -> Self {
        self.video_url = Some(url.into());
        self
    }

    pub fn with_audio(mut self, url: impl Into<String>) -> Self {
        self.audio_url = Some(url.into());
        self
    }

    pub fn with_thumbnail(mut self, url: impl Into<String>) -> Self {
        self.thumbnail_url = Some(url.into());
        self
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    pub fn temp_path(&self, kind: StreamKind) -> PathBuf {
        let (video, audio) = temp_paths(&self.output_path);
        match kind {
            StreamKind::Video => video,
            StreamKind::Audio => audio,
        }
    }
}

/// Temp files live next to the output: `temp_video_<stem><ext>` and
/// `temp_audio_<stem><ext>`, with `.webm` for both streams of a WebM target
/// and `.mp4`/`.m4a` otherwise.
pub fn temp_paths(output: &Path) -> (PathBuf, PathBuf) {
    let is_webm = output
        .extension()
        .map(|ext| ext.to_string_lossy().eq_ignore_ascii_case("webm"))
        .unwrap_or(false);
    let (video_ext, audio_ext) = if is_webm {
        (".webm", ".webm")
    } else {
        (".mp4", ".m4a")
    };
    let stem = output
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_default();
    let dir = output.parent().unwrap_or_else(|| Path::new(""));
    (
        dir.join(format!("temp_video_{}{}", stem, video_ext)),
        dir.join(format!("temp_audio_{}{}", stem, audio_ext)),
    )
}

pub fn truncate_message(message: &str, limit: usize) -> String {
    message.chars().take(limit).collect()
}

struct TaskShared {
    id: TaskId,
    spec: TaskSpec,
    video_temp: PathBuf,
    audio_temp: PathBuf,
    config: TransferConfig,
    net: Arc<dyn NetClient>,
    muxer: Arc<dyn Muxer>,
    status: Mutex<TaskStatus>,
    stop: AtomicU8,
    active: Mutex<Option<TransferHandle>>,
    worker_thread: Mutex<Option<ThreadId>>,
    observers: ObserverRegistry,
}

/// One logical download: up to two stream fetches followed by a mux or a
/// rename into the output path, driven by a single background worker.
///
/// Callers only request `start`, `toggle_pause` and `cancel`; every status
/// field is written by the worker (or by the request itself for the
/// paused/cancelled phases) and published to observers.
pub struct DownloadTask {
    shared: Arc<TaskShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DownloadTask {
    pub fn new(spec: TaskSpec) -> CoreResult<Self> {
        let config = TransferConfig::default();
        let net = ReqwestNetClient::new(&config)?;
        Self::with_collaborators(spec, config, Arc::new(net), Arc::new(FfmpegMuxer::default()))
    }

    pub fn with_collaborators(
        spec: TaskSpec,
        config: TransferConfig,
        net: Arc<dyn NetClient>,
        muxer: Arc<dyn Muxer>,
    ) -> CoreResult<Self> {
        if spec.video_url.is_none() && spec.audio_url.is_none() {
            return Err(CoreError::InvalidState(
                "task needs a video or an audio URL".to_string(),
            ));
        }
        let (video_temp, audio_temp) = temp_paths(&spec.output_path);
        let shared = TaskShared {
            id: Uuid::new_v4(),
            spec,
            video_temp,
            audio_temp,
            config,
            net,
            muxer,
            status: Mutex::new(TaskStatus::default()),
            stop: AtomicU8::new(STOP_NONE),
            active: Mutex::new(None),
            worker_thread: Mutex::new(None),
            observers: ObserverRegistry::default(),
        };
        Ok(Self {
            shared: Arc::new(shared),
            worker: Mutex::new(None),
        })
    }

    pub fn id(&self) -> TaskId {
        self.shared.id
    }

    pub fn spec(&self) -> &TaskSpec {
        &self.shared.spec
    }

    pub fn video_temp_path(&self) -> &Path {
        &self.shared.video_temp
    }

    pub fn audio_temp_path(&self) -> &Path {
        &self.shared.audio_temp
    }

    pub fn status(&self) -> TaskStatus {
        self.shared.status()
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        self.shared.snapshot_of(&self.shared.status())
    }

    /// Registers an observer and immediately calls it with the current state.
    pub fn subscribe(&self, observer: Arc<dyn TaskObserver>) -> ObserverId {
        let id = self.shared.observers.subscribe(Arc::clone(&observer));
        observer.on_task_update(&self.snapshot());
        id
    }

    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        self.shared.observers.unsubscribe(id)
    }

    /// Launches the worker. A no-op while downloading or processing and
    /// after completion or cancellation; from `paused` or `error` it starts
    /// over with fresh transfers.
    ///
    /// Restarting blocks the caller until the previous worker has exited.
    /// That worker is already interrupted, so the wait lasts at most one
    /// in-flight chunk read, which `stream_timeout` bounds. The old worker must be gone before the status and stop flag
    /// are reset, otherwise it could report into the new run.
    pub fn start(&self) -> CoreResult<()> {
        if self.shared.in_worker() {
            return Err(CoreError::InvalidState(
                "cannot restart a task from its own worker".to_string(),
            ));
        }
        let mut worker = self
            .worker
            .lock()
            .map_err(|_| CoreError::InvalidState("worker lock poisoned".to_string()))?;
        if !self.shared.status().phase.can_start() {
            return Ok(());
        }
        if let Some(previous) = worker.take() {
            let _ = previous.join();
        }

        let snapshot = {
            let mut status = self
                .shared
                .status
                .lock()
                .map_err(|_| CoreError::InvalidState("status lock poisoned".to_string()))?;
            if !status.phase.can_start() {
                return Ok(());
            }
            *status = TaskStatus {
                phase: TaskPhase::Downloading,
                ..TaskStatus::default()
            };
            self.shared.stop.store(STOP_NONE, Ordering::SeqCst);
            self.shared.snapshot_of(&status)
        };
        self.shared.observers.notify(&snapshot);

        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name(format!("task-{}", &self.shared.id.to_string()[..8]))
            .spawn(move || shared.run_worker());
        match spawned {
            Ok(handle) => {
                *worker = Some(handle);
                Ok(())
            }
            Err(err) => {
                let err = CoreError::InvalidState(format!("cannot spawn worker: {}", err));
                self.shared.fail(&err);
                Err(err)
            }
        }
    }

    /// Pauses a waiting or downloading task, or restarts a paused one.
    pub fn toggle_pause(&self) -> CoreResult<()> {
        if self.shared.status().phase == TaskPhase::Paused {
            return self.start();
        }
        self.shared.interrupt(STOP_PAUSED, TaskPhase::Paused, |phase| {
            matches!(phase, TaskPhase::Waiting | TaskPhase::Downloading)
        });
        Ok(())
    }

    /// Terminal. Repeated calls and calls on a finished task are no-ops.
    pub fn cancel(&self) {
        self.shared
            .interrupt(STOP_CANCELED, TaskPhase::Cancelled, |phase| !phase.is_terminal());
    }

    /// Blocks until the current worker, if any, has exited.
    pub fn wait(&self) {
        if self.shared.in_worker() {
            return;
        }
        if let Ok(mut worker) = self.worker.lock() {
            if let Some(handle) = worker.take() {
                let _ = handle.join();
            }
        }
    }
}

impl TaskShared {
    fn status(&self) -> TaskStatus {
        self.status
            .lock()
            .map(|status| status.clone())
            .unwrap_or_default()
    }

    fn snapshot_of(&self, status: &TaskStatus) -> TaskSnapshot {
        TaskSnapshot {
            id: self.id,
            title: self.spec.title.clone(),
            output_path: self.spec.output_path.clone(),
            thumbnail_url: self.spec.thumbnail_url.clone(),
            status: status.clone(),
        }
    }

    fn is_interrupted(&self) -> bool {
        self.stop.load(Ordering::SeqCst) != STOP_NONE
    }

    fn in_worker(&self) -> bool {
        self.worker_thread
            .lock()
            .map(|id| *id == Some(thread::current().id()))
            .unwrap_or(false)
    }

    fn set_active(&self, handle: Option<TransferHandle>) {
        if let Ok(mut active) = self.active.lock() {
            *active = handle;
        }
    }

    fn interrupt<F>(&self, code: u8, phase: TaskPhase, allowed: F)
    where
        F: Fn(TaskPhase) -> bool,
    {
        let snapshot = {
            let Ok(mut status) = self.status.lock() else {
                return;
            };
            if !allowed(status.phase) {
                return;
            }
            self.stop.store(code, Ordering::SeqCst);
            status.phase = phase;
            status.speed_text.clear();
            status.eta_text.clear();
            self.snapshot_of(&status)
        };
        if let Ok(active) = self.active.lock() {
            if let Some(handle) = active.as_ref() {
                handle.stop();
            }
        }
        info!(task = %self.id, phase = %phase, "task interrupted");
        self.observers.notify(&snapshot);
    }

    /// Applies `update` unless a pause or cancel has been requested, then
    /// notifies observers.
    fn update_if_running<F>(&self, update: F) -> bool
    where
        F: FnOnce(&mut TaskStatus) -> bool,
    {
        let snapshot = {
            let Ok(mut status) = self.status.lock() else {
                return false;
            };
            if self.is_interrupted() || !update(&mut status) {
                return false;
            }
            self.snapshot_of(&status)
        };
        self.observers.notify(&snapshot);
        true
    }

    fn fail(&self, err: &CoreError) {
        let message = truncate_message(&err.to_string(), ERROR_MESSAGE_LIMIT);
        let applied = self.update_if_running(|status| {
            status.phase = TaskPhase::Error;
            status.error_message = Some(message.clone());
            status.speed_text = "Failed".to_string();
            status.eta_text.clear();
            true
        });
        if applied {
            error!(task = %self.id, title = %self.spec.title, error = %err, "download failed");
        }
    }

    fn run_worker(self: Arc<Self>) {
        if let Ok(mut id) = self.worker_thread.lock() {
            *id = Some(thread::current().id());
        }
        if let Err(err) = self.execute() {
            self.fail(&err);
        }
        self.set_active(None);
        if let Ok(mut id) = self.worker_thread.lock() {
            *id = None;
        }
    }

    fn execute(self: &Arc<Self>) -> CoreResult<()> {
        let video_url = self.spec.video_url.clone();
        let audio_url = self.spec.audio_url.clone();

        if let Some(url) = &video_url {
            if !self.fetch_stream(StreamKind::Video, url, &self.video_temp)? {
                return Ok(());
            }
        }
        if let Some(url) = &audio_url {
            if !self.fetch_stream(StreamKind::Audio, url, &self.audio_temp)? {
                return Ok(());
            }
        }
        if self.is_interrupted() {
            return Ok(());
        }

        match (video_url.is_some(), audio_url.is_some()) {
            (true, true) => {
                if file_len(&self.video_temp) == 0 {
                    return Err(CoreError::Integrity(
                        "Video file download failed or is incomplete".to_string(),
                    ));
                }
                if file_len(&self.audio_temp) == 0 {
                    return Err(CoreError::Integrity(
                        "Audio file download failed or is incomplete".to_string(),
                    ));
                }
                let processing = self.update_if_running(|status| {
                    status.phase = TaskPhase::Processing;
                    status.progress = 50.0;
                    status.label = "Processing".to_string();
                    status.speed_text.clear();
                    status.eta_text.clear();
                    true
                });
                if !processing {
                    return Ok(());
                }
                info!(task = %self.id, output = %self.spec.output_path.display(), "muxing streams");
                self.muxer
                    .merge(&self.video_temp, &self.audio_temp, &self.spec.output_path)?;
                remove_temp(&self.video_temp);
                remove_temp(&self.audio_temp);
            }
            (true, false) => {
                let size = file_len(&self.video_temp);
                if size < MIN_VIDEO_ONLY_BYTES {
                    return Err(CoreError::Integrity(format!(
                        "Downloaded file is too small ({} bytes), download may have failed",
                        size
                    )));
                }
                self.promote(&self.video_temp)?;
            }
            (false, true) => self.promote(&self.audio_temp)?,
            (false, false) => {
                return Err(CoreError::InvalidState(
                    "task needs a video or an audio URL".to_string(),
                ))
            }
        }

        let completed = self.update_if_running(|status| {
            status.phase = TaskPhase::Completed;
            status.progress = 100.0;
            status.label.clear();
            status.speed_text.clear();
            status.eta_text.clear();
            true
        });
        if completed {
            info!(task = %self.id, output = %self.spec.output_path.display(), "download completed");
        }
        Ok(())
    }

    /// Returns `Ok(false)` when the phase was cut short by pause or cancel.
    fn fetch_stream(self: &Arc<Self>, kind: StreamKind, url: &str, dest: &Path) -> CoreResult<bool> {
        if self.is_interrupted() {
            return Ok(false);
        }
        let meter = PhaseMeter::start();
        let shared = Arc::clone(self);
        let transfer = SegmentedTransfer::new(url, dest, Arc::clone(&self.net))
            .with_config(self.config.clone())
            .with_headers(self.spec.headers.clone())
            .on_progress(move |percent, done, total| {
                shared.record_progress(kind, &meter, percent, done, total);
            });

        self.set_active(Some(transfer.handle()));
        if self.is_interrupted() {
            transfer.stop();
        }
        info!(task = %self.id, stream = %kind, dest = %dest.display(), "phase started");
        let outcome = transfer.run();
        self.set_active(None);

        let outcome = outcome.map_err(|err| err.in_phase(kind))?;
        if outcome == TransferOutcome::Stopped || self.is_interrupted() {
            return Ok(false);
        }
        if file_len(dest) == 0 {
            return Err(CoreError::Integrity("file is missing or empty".to_string()).in_phase(kind));
        }
        Ok(true)
    }

    fn record_progress(&self, kind: StreamKind, meter: &PhaseMeter, percent: f64, done: u64, total: u64) {
        self.update_if_running(|status| {
            if status.phase != TaskPhase::Downloading {
                return false;
            }
            // Segment callbacks can arrive out of order; keep the newest.
            if status.label == kind.as_str() && done < status.bytes_done {
                return false;
            }
            status.label = kind.as_str().to_string();
            status.progress = percent;
            status.bytes_done = done;
            status.bytes_total = total;
            if let Some(speed) = meter.speed_mbps(done) {
                status.speed_text = speed_text(speed);
                if let Some(eta) = eta_secs(done, total, speed) {
                    status.eta_text = eta_text(eta);
                }
            }
            true
        });
    }

    fn promote(&self, temp: &Path) -> CoreResult<()> {
        if self.is_interrupted() {
            return Ok(());
        }
        if let Some(parent) = self.spec.output_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|err| CoreError::Io(err.to_string()))?;
            }
        }
        fs::rename(temp, &self.spec.output_path).map_err(|err| CoreError::Io(err.to_string()))
    }
}

fn file_len(path: &Path) -> u64 {
    fs::metadata(path).map(|meta| meta.len()).unwrap_or(0)
}

fn remove_temp(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %err, "could not remove temp file");
        }
    }
}
