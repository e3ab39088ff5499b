//! Choosing which streams to download and where to put them.

use std::cmp::Reverse;
use std::path::Path;

use crate::metadata::{StreamDescriptor, VideoResult};
use crate::task::TaskSpec;

fn language_score(stream: &StreamDescriptor) -> u8 {
    let lang = stream
        .language
        .as_deref()
        .unwrap_or_default()
        .to_ascii_lowercase();
    if lang.is_empty() {
        1
    } else if lang.contains("en") || lang.contains("eng") {
        2
    } else {
        0
    }
}

/// Audio companion for a video-only stream. Audio-only streams are ranked
/// English first, then unlabeled, then everything else, larger files first
/// within a rank. The first one in the video's sibling container wins
/// (`m4a` next to `mp4`, `webm` otherwise); failing that, the top-ranked one.
///
/// Returns `None` for muxed streams, which already carry audio.
pub fn pick_audio_for<'a>(
    video: &StreamDescriptor,
    formats: &'a [StreamDescriptor],
) -> Option<&'a StreamDescriptor> {
    if !video.is_video_only {
        return None;
    }
    let target_ext = if video.ext == "mp4" { "m4a" } else { "webm" };

    let mut audios: Vec<&StreamDescriptor> = formats
        .iter()
        .filter(|f| f.is_audio_only() && !f.url.is_empty())
        .collect();
    audios.sort_by_key(|f| Reverse((language_score(f), f.filesize)));

    audios
        .iter()
        .find(|f| f.ext == target_ext)
        .or_else(|| audios.first())
        .copied()
}

/// Unattended pick: the first video-only MP4 stream.
pub fn best_video_only_mp4(formats: &[StreamDescriptor]) -> Option<&StreamDescriptor> {
    formats
        .iter()
        .find(|f| f.is_video_only && f.ext == "mp4" && !f.url.is_empty())
}

pub fn sanitize_title(title: &str) -> String {
    let safe: String = title
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_'))
        .collect();
    let safe = safe.trim();
    if safe.is_empty() {
        "video".to_string()
    } else {
        safe.to_string()
    }
}

fn path_token(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
        .collect()
}

/// `<title>_<quality>.<ext>`, where quality is the resolution for streams
/// with video and `audio` for audio-only ones. Never contains a separator.
pub fn output_file_name(title: &str, format: &StreamDescriptor) -> String {
    let quality = if format.is_audio_only() {
        "audio".to_string()
    } else {
        match path_token(&format.resolution).as_str() {
            "" | "NA" => "video".to_string(),
            tag => tag.to_string(),
        }
    };
    let ext = match path_token(&format.ext) {
        ext if ext.is_empty() => "bin".to_string(),
        ext => ext,
    };
    format!("{}_{}.{}", sanitize_title(title), quality, ext)
}

/// Builds the task for downloading `format` of `video` into `download_dir`.
/// Audio-only formats become audio-only tasks; video-only ones are paired
/// with an audio stream.
pub fn plan_task(video: &VideoResult, format: &StreamDescriptor, download_dir: &Path) -> TaskSpec {
    let output = download_dir.join(output_file_name(&video.title, format));
    let mut spec =
        TaskSpec::new(video.title.clone(), output).with_headers(format.http_headers.clone());
    if format.is_audio_only() {
        spec = spec.with_audio(format.url.clone());
    } else {
        spec = spec.with_video(format.url.clone());
        if let Some(audio) = pick_audio_for(format, &video.formats) {
            spec = spec.with_audio(audio.url.clone());
        }
    }
    if !video.thumbnail_url.is_empty() {
        spec = spec.with_thumbnail(video.thumbnail_url.clone());
    }
    spec
}

/// Highest resolution first; streams without one sort last.
pub fn sort_by_resolution(formats: &mut [StreamDescriptor]) {
    formats.sort_by_key(|f| {
        let (width, height) = f.dimensions();
        Reverse((height, width))
    });
}

/// Streams worth offering for download: with video, a resolution and a URL.
pub fn downloadable_video_formats(video: &VideoResult) -> Vec<StreamDescriptor> {
    let mut formats: Vec<StreamDescriptor> = video
        .formats
        .iter()
        .filter(|f| f.has_video() && f.resolution != "N/A" && !f.url.is_empty())
        .cloned()
        .collect();
    sort_by_resolution(&mut formats);
    formats
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::PathBuf;

    use super::*;
    use crate::metadata::NO_CODEC;

    fn stream(id: &str, ext: &str, vcodec: &str, acodec: &str) -> StreamDescriptor {
        StreamDescriptor {
            format_id: id.to_string(),
            ext: ext.to_string(),
            resolution: "N/A".to_string(),
            note: String::new(),
            filesize: 0,
            url: format!("https://cdn.example/{}", id),
            vcodec: vcodec.to_string(),
            acodec: acodec.to_string(),
            fps: 0.0,
            is_video_only: vcodec != NO_CODEC && acodec == NO_CODEC,
            http_headers: HashMap::new(),
            language: None,
        }
    }

    fn audio(id: &str, ext: &str, lang: Option<&str>, size: u64) -> StreamDescriptor {
        let mut s = stream(id, ext, NO_CODEC, "opus");
        s.language = lang.map(str::to_string);
        s.filesize = size;
        s
    }

    fn video(id: &str, ext: &str, resolution: &str) -> StreamDescriptor {
        let mut s = stream(id, ext, "avc1", NO_CODEC);
        s.resolution = resolution.to_string();
        s
    }

    #[test]
    fn english_matching_container_wins() {
        let formats = vec![
            audio("de", "m4a", Some("de"), 9_000),
            audio("none", "m4a", None, 8_000),
            audio("en-webm", "webm", Some("en-US"), 7_000),
            audio("en-m4a", "m4a", Some("en"), 1_000),
        ];
        let mp4 = video("137", "mp4", "1920x1080");
        assert_eq!(pick_audio_for(&mp4, &formats).unwrap().format_id, "en-m4a");

        let webm = video("248", "webm", "1920x1080");
        assert_eq!(pick_audio_for(&webm, &formats).unwrap().format_id, "en-webm");
    }

    #[test]
    fn falls_back_to_top_ranked_when_no_container_matches() {
        let formats = vec![
            audio("small", "opus", None, 10),
            audio("large", "opus", None, 20),
        ];
        let mp4 = video("137", "mp4", "1280x720");
        assert_eq!(pick_audio_for(&mp4, &formats).unwrap().format_id, "large");
    }

    #[test]
    fn muxed_streams_need_no_audio() {
        let formats = vec![audio("a", "m4a", None, 1)];
        let muxed = stream("18", "mp4", "avc1", "mp4a");
        assert!(pick_audio_for(&muxed, &formats).is_none());
    }

    #[test]
    fn titles_are_made_filesystem_safe() {
        assert_eq!(sanitize_title("  Hello: World / Part 2?  "), "Hello World  Part 2");
        assert_eq!(sanitize_title("???"), "video");
        let fmt = video("137", "mp4", "1920x1080");
        assert_eq!(output_file_name("Clip #1", &fmt), "Clip 1_1920x1080.mp4");
    }

    #[test]
    fn plan_pairs_video_with_audio_and_headers() {
        let mut fmt = video("137", "mp4", "1920x1080");
        fmt.http_headers
            .insert("Referer".to_string(), "https://site.example".to_string());
        let result = VideoResult {
            title: "Clip".to_string(),
            duration: 10,
            thumbnail_url: "https://img.example/t.jpg".to_string(),
            formats: vec![fmt.clone(), audio("140", "m4a", Some("en"), 5)],
            original_url: "https://site.example/v".to_string(),
        };
        let spec = plan_task(&result, &fmt, Path::new("/downloads"));
        assert_eq!(spec.output_path, PathBuf::from("/downloads/Clip_1920x1080.mp4"));
        assert_eq!(spec.video_url.as_deref(), Some("https://cdn.example/137"));
        assert_eq!(spec.audio_url.as_deref(), Some("https://cdn.example/140"));
        assert_eq!(spec.thumbnail_url.as_deref(), Some("https://img.example/t.jpg"));
        assert_eq!(
            spec.headers.get("Referer").map(String::as_str),
            Some("https://site.example")
        );
    }

    #[test]
    fn audio_only_format_becomes_an_audio_task_in_the_download_dir() {
        let m4a = audio("140", "m4a", Some("en"), 5);
        let result = VideoResult {
            title: "Clip".to_string(),
            duration: 10,
            thumbnail_url: String::new(),
            formats: vec![video("137", "mp4", "1920x1080"), m4a.clone()],
            original_url: "https://site.example/v".to_string(),
        };
        let spec = plan_task(&result, &m4a, Path::new("/dl"));
        assert_eq!(spec.output_path, PathBuf::from("/dl/Clip_audio.m4a"));
        assert_eq!(spec.output_path.parent(), Some(Path::new("/dl")));
        assert_eq!(spec.video_url, None);
        assert_eq!(spec.audio_url.as_deref(), Some("https://cdn.example/140"));
        assert_eq!(spec.thumbnail_url, None);
    }

    #[test]
    fn odd_resolutions_and_extensions_stay_in_one_path_component() {
        let unknown = video("x", "mp4", "N/A");
        assert_eq!(output_file_name("Clip", &unknown), "Clip_video.mp4");
        let slashed = video("y", "../webm", "1280/720");
        assert_eq!(output_file_name("Clip", &slashed), "Clip_1280720.webm");
        let muxed = stream("18", "", "avc1", "mp4a");
        assert_eq!(output_file_name("Clip", &muxed), "Clip_video.bin");
    }

    #[test]
    fn resolution_sort_is_numeric() {
        let mut formats = vec![
            video("a", "mp4", "640x360"),
            video("b", "mp4", "N/A"),
            video("c", "mp4", "1920x1080"),
            video("d", "mp4", "854x480"),
        ];
        sort_by_resolution(&mut formats);
        let ids: Vec<&str> = formats.iter().map(|f| f.format_id.as_str()).collect();
        assert_eq!(ids, vec!["c", "d", "a", "b"]);
    }

    #[test]
    fn batch_pick_wants_video_only_mp4() {
        let formats = vec![
            stream("18", "mp4", "avc1", "mp4a"),
            video("248", "webm", "1920x1080"),
            video("137", "mp4", "1920x1080"),
        ];
        assert_eq!(best_video_only_mp4(&formats).unwrap().format_id, "137");
    }
}
