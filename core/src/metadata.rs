//! Stream metadata: the records a download is planned from, and the client
//! that extracts them from a page URL.
//!
//! Extractor output is loosely typed. It is parsed into `Raw*` structs where
//! every field is optional and then normalized, so the rest of the crate
//! only ever sees complete [`StreamDescriptor`]s.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CoreError, CoreResult};

pub const NO_CODEC: &str = "none";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamDescriptor {
    pub format_id: String,
    pub ext: String,
    /// `"WxH"` or `"N/A"`.
    pub resolution: String,
    pub note: String,
    /// 0 when unknown.
    pub filesize: u64,
    pub url: String,
    pub vcodec: String,
    pub acodec: String,
    pub fps: f64,
    pub is_video_only: bool,
    pub http_headers: HashMap<String, String>,
    pub language: Option<String>,
}

impl StreamDescriptor {
    pub fn has_video(&self) -> bool {
        self.vcodec != NO_CODEC
    }

    pub fn has_audio(&self) -> bool {
        self.acodec != NO_CODEC
    }

    pub fn is_audio_only(&self) -> bool {
        self.has_audio() && !self.has_video()
    }

    /// `(width, height)` parsed from the resolution, `(0, 0)` for `"N/A"`.
    pub fn dimensions(&self) -> (u64, u64) {
        let mut parts = self.resolution.splitn(2, 'x');
        let width = parts.next().and_then(|w| w.parse().ok()).unwrap_or(0);
        let height = parts.next().and_then(|h| h.parse().ok()).unwrap_or(0);
        (width, height)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoResult {
    pub title: String,
    pub duration: u64,
    pub thumbnail_url: String,
    pub formats: Vec<StreamDescriptor>,
    pub original_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaylistEntry {
    pub title: String,
    pub url: String,
    pub duration: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaylistResult {
    pub title: String,
    pub entries: Vec<PlaylistEntry>,
    pub original_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MediaInfo {
    Video(VideoResult),
    Playlist(PlaylistResult),
}

pub trait MetadataClient: Send + Sync {
    fn fetch(&self, url: &str) -> CoreResult<MediaInfo>;
}

#[derive(Debug, Default, Deserialize)]
struct RawInfo {
    title: Option<String>,
    duration: Option<f64>,
    thumbnail: Option<String>,
    #[serde(default)]
    formats: Vec<RawFormat>,
    entries: Option<Vec<Option<RawEntry>>>,
}

#[derive(Debug, Default, Deserialize)]
struct RawFormat {
    format_id: Option<String>,
    ext: Option<String>,
    width: Option<f64>,
    height: Option<f64>,
    format_note: Option<String>,
    filesize: Option<f64>,
    filesize_approx: Option<f64>,
    url: Option<String>,
    vcodec: Option<String>,
    acodec: Option<String>,
    fps: Option<f64>,
    http_headers: Option<HashMap<String, String>>,
    language: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawEntry {
    title: Option<String>,
    url: Option<String>,
    webpage_url: Option<String>,
    duration: Option<f64>,
}

fn codec(value: Option<String>) -> String {
    match value {
        Some(codec) if !codec.trim().is_empty() => codec,
        _ => NO_CODEC.to_string(),
    }
}

fn whole(value: Option<f64>) -> u64 {
    value
        .filter(|v| v.is_finite() && *v > 0.0)
        .map(|v| v as u64)
        .unwrap_or(0)
}

impl RawFormat {
    fn normalize(self) -> Option<StreamDescriptor> {
        let vcodec = codec(self.vcodec);
        let acodec = codec(self.acodec);
        let is_video = vcodec != NO_CODEC;
        let is_audio = acodec != NO_CODEC;
        if !is_video && !is_audio {
            return None;
        }
        let resolution = match (whole(self.width), whole(self.height)) {
            (0, _) => "N/A".to_string(),
            (width, height) => format!("{}x{}", width, height),
        };
        let filesize = match whole(self.filesize) {
            0 => whole(self.filesize_approx),
            size => size,
        };
        Some(StreamDescriptor {
            format_id: self.format_id.unwrap_or_default(),
            ext: self.ext.unwrap_or_default(),
            resolution,
            note: self.format_note.unwrap_or_default(),
            filesize,
            url: self.url.unwrap_or_default(),
            vcodec,
            acodec,
            fps: self.fps.filter(|fps| fps.is_finite()).unwrap_or(0.0),
            is_video_only: is_video && !is_audio,
            http_headers: self.http_headers.unwrap_or_default(),
            language: self.language.filter(|lang| !lang.is_empty()),
        })
    }
}

/// Builds a [`MediaInfo`] from extractor JSON. A document with an `entries`
/// list is a playlist; anything else is a single video.
pub fn parse_media_info(json: &str, original_url: &str) -> CoreResult<MediaInfo> {
    let raw: RawInfo =
        serde_json::from_str(json).map_err(|err| CoreError::Metadata(err.to_string()))?;

    if let Some(entries) = raw.entries {
        let entries = entries
            .into_iter()
            .flatten()
            .filter_map(|entry| {
                let url = entry.url.or(entry.webpage_url)?;
                Some(PlaylistEntry {
                    title: entry.title.unwrap_or_else(|| "Unknown".to_string()),
                    url,
                    duration: whole(entry.duration),
                })
            })
            .collect();
        return Ok(MediaInfo::Playlist(PlaylistResult {
            title: raw.title.unwrap_or_else(|| "Unknown Playlist".to_string()),
            entries,
            original_url: original_url.to_string(),
        }));
    }

    Ok(MediaInfo::Video(VideoResult {
        title: raw.title.unwrap_or_else(|| "Unknown Title".to_string()),
        duration: whole(raw.duration),
        thumbnail_url: raw.thumbnail.unwrap_or_default(),
        formats: raw
            .formats
            .into_iter()
            .filter_map(RawFormat::normalize)
            .collect(),
        original_url: original_url.to_string(),
    }))
}

/// Runs `yt-dlp` as a subprocess and parses its single-JSON dump.
#[derive(Debug, Clone)]
pub struct YtDlpClient {
    program: PathBuf,
}

impl Default for YtDlpClient {
    fn default() -> Self {
        Self {
            program: PathBuf::from("yt-dlp"),
        }
    }
}

impl YtDlpClient {
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl MetadataClient for YtDlpClient {
    fn fetch(&self, url: &str) -> CoreResult<MediaInfo> {
        debug!(program = %self.program.display(), url, "extracting metadata");
        let output = Command::new(&self.program)
            .args([
                "--dump-single-json",
                "--flat-playlist",
                "--no-warnings",
                "--quiet",
                url,
            ])
            .stdin(Stdio::null())
            .output()
            .map_err(|err| {
                if err.kind() == ErrorKind::NotFound {
                    CoreError::Metadata("yt-dlp not found in PATH".to_string())
                } else {
                    CoreError::Metadata(err.to_string())
                }
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let line = stderr
                .lines()
                .rev()
                .find(|line| !line.trim().is_empty())
                .unwrap_or("extractor exited with an error");
            return Err(CoreError::Metadata(line.trim().to_string()));
        }

        parse_media_info(&String::from_utf8_lossy(&output.stdout), url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VIDEO_JSON: &str = r#"{
        "title": "Launch Day",
        "duration": 312.4,
        "thumbnail": "https://img.example/t.jpg",
        "formats": [
            {"format_id": "sb0", "ext": "mhtml", "vcodec": "none", "acodec": "none", "url": "u0"},
            {"format_id": "140", "ext": "m4a", "vcodec": "none", "acodec": "mp4a.40.2",
             "filesize": 5123456, "url": "https://cdn.example/140", "language": "en"},
            {"format_id": "137", "ext": "mp4", "width": 1920, "height": 1080, "format_note": "1080p",
             "vcodec": "avc1.640028", "acodec": "none", "fps": 30, "filesize": null,
             "filesize_approx": 81234567.0, "url": "https://cdn.example/137",
             "http_headers": {"User-Agent": "UA", "Accept": "*/*"}},
            {"format_id": "18", "ext": "mp4", "width": 640, "height": 360,
             "vcodec": "avc1.42001E", "acodec": "mp4a.40.2", "url": "https://cdn.example/18"},
            {"format_id": "x", "ext": "mp4", "acodec": "opus", "url": "https://cdn.example/x"}
        ]
    }"#;

    fn video() -> VideoResult {
        match parse_media_info(VIDEO_JSON, "https://site.example/v").unwrap() {
            MediaInfo::Video(video) => video,
            other => panic!("expected video, got {:?}", other),
        }
    }

    #[test]
    fn formats_without_any_codec_are_dropped() {
        let video = video();
        assert_eq!(video.title, "Launch Day");
        assert_eq!(video.duration, 312);
        assert_eq!(video.original_url, "https://site.example/v");
        let ids: Vec<&str> = video.formats.iter().map(|f| f.format_id.as_str()).collect();
        assert_eq!(ids, vec!["140", "137", "18", "x"]);
    }

    #[test]
    fn missing_fields_are_normalized() {
        let video = video();
        let dash = &video.formats[1];
        assert_eq!(dash.resolution, "1920x1080");
        assert_eq!(dash.filesize, 81_234_567);
        assert!(dash.is_video_only);
        assert_eq!(dash.fps, 30.0);
        assert_eq!(dash.http_headers.get("User-Agent").map(String::as_str), Some("UA"));
        assert_eq!(dash.dimensions(), (1920, 1080));

        let audio = &video.formats[0];
        assert_eq!(audio.resolution, "N/A");
        assert!(audio.is_audio_only());
        assert_eq!(audio.language.as_deref(), Some("en"));

        let absent_vcodec = &video.formats[3];
        assert_eq!(absent_vcodec.vcodec, NO_CODEC);
        assert_eq!(absent_vcodec.filesize, 0);
        assert!(!absent_vcodec.is_video_only);
    }

    #[test]
    fn playlists_skip_null_and_urlless_entries() {
        let json = r#"{
            "title": "Mix",
            "entries": [
                {"title": "One", "url": "https://site.example/1", "duration": 61},
                null,
                {"title": "No link"},
                {"webpage_url": "https://site.example/3"}
            ]
        }"#;
        let MediaInfo::Playlist(list) = parse_media_info(json, "https://site.example/list").unwrap()
        else {
            panic!("expected playlist");
        };
        assert_eq!(list.title, "Mix");
        assert_eq!(list.entries.len(), 2);
        assert_eq!(list.entries[0].duration, 61);
        assert_eq!(list.entries[1].title, "Unknown");
        assert_eq!(list.entries[1].url, "https://site.example/3");
    }

    #[test]
    fn bad_json_is_a_metadata_error() {
        let err = parse_media_info("not json", "u").unwrap_err();
        assert!(matches!(err, CoreError::Metadata(_)));
    }

    #[test]
    fn missing_extractor_is_reported() {
        let client = YtDlpClient::with_program("/nonexistent/yt-dlp-binary");
        let err = client.fetch("https://site.example/v").unwrap_err();
        assert_eq!(err.to_string(), "failed to fetch metadata: yt-dlp not found in PATH");
    }
}
