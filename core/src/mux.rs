use std::ffi::OsString;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::debug;

use crate::error::{CoreError, CoreResult};

const STDERR_TAIL_CHARS: usize = 400;

pub trait Muxer: Send + Sync {
    /// Combines a video-only and an audio-only file into `output`.
    fn merge(&self, video: &Path, audio: &Path, output: &Path) -> CoreResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxStrategy {
    /// WebM only carries VP8/VP9/AV1 with Opus/Vorbis, so both streams are copied.
    CopyBoth,
    /// Video copied, audio re-encoded to AAC 192k, moov atom moved to the front.
    CopyVideoAacAudio,
}

pub fn mux_strategy(video: &Path, output: &Path) -> MuxStrategy {
    if has_extension(output, "webm") || has_extension(video, "webm") {
        MuxStrategy::CopyBoth
    } else {
        MuxStrategy::CopyVideoAacAudio
    }
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension()
        .map(|value| value.to_string_lossy().eq_ignore_ascii_case(ext))
        .unwrap_or(false)
}

pub fn ffmpeg_args(video: &Path, audio: &Path, output: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "-y".into(),
        "-i".into(),
        video.as_os_str().to_os_string(),
        "-i".into(),
        audio.as_os_str().to_os_string(),
        "-c:v".into(),
        "copy".into(),
    ];
    match mux_strategy(video, output) {
        MuxStrategy::CopyBoth => {
            args.push("-c:a".into());
            args.push("copy".into());
        }
        MuxStrategy::CopyVideoAacAudio => {
            for arg in ["-c:a", "aac", "-b:a", "192k", "-movflags", "+faststart"] {
                args.push(arg.into());
            }
        }
    }
    args.push(output.as_os_str().to_os_string());
    args
}

#[derive(Debug, Clone)]
pub struct FfmpegMuxer {
    program: PathBuf,
}

impl Default for FfmpegMuxer {
    fn default() -> Self {
        Self {
            program: PathBuf::from("ffmpeg"),
        }
    }
}

impl FfmpegMuxer {
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Muxer for FfmpegMuxer {
    fn merge(&self, video: &Path, audio: &Path, output: &Path) -> CoreResult<()> {
        if let Some(parent) = output.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|err| CoreError::Io(err.to_string()))?;
            }
        }
        ensure_input("Video", video)?;
        ensure_input("Audio", audio)?;

        let args = ffmpeg_args(video, audio, output);
        debug!(program = %self.program.display(), ?args, "running muxer");
        let result = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .map_err(|err| {
                if err.kind() == ErrorKind::NotFound {
                    CoreError::Mux(
                        "FFmpeg not found. Please install FFmpeg and add it to your PATH."
                            .to_string(),
                    )
                } else {
                    CoreError::Mux(format!("failed to run ffmpeg: {}", err))
                }
            })?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(CoreError::Mux(format!("FFmpeg failed: {}", tail(&stderr))));
        }
        Ok(())
    }
}

fn ensure_input(kind: &str, path: &Path) -> CoreResult<()> {
    let len = fs::metadata(path).map(|meta| meta.len()).unwrap_or(0);
    if len == 0 {
        return Err(CoreError::Mux(format!(
            "{} file is missing or empty: {}",
            kind,
            path.display()
        )));
    }
    Ok(())
}

fn tail(text: &str) -> String {
    let trimmed = text.trim();
    let count = trimmed.chars().count();
    if count <= STDERR_TAIL_CHARS {
        return trimmed.to_string();
    }
    trimmed.chars().skip(count - STDERR_TAIL_CHARS).collect()
}
