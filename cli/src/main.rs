use std::env;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use tracing::debug;
use tracing_subscriber::EnvFilter;
use vidfetch_core::metadata::{MediaInfo, MetadataClient, VideoResult, YtDlpClient};
use vidfetch_core::net::ReqwestNetClient;
use vidfetch_core::progress::format_bytes;
use vidfetch_core::selection::{downloadable_video_formats, plan_task, sort_by_resolution};
use vidfetch_core::settings::SettingsStore;
use vidfetch_core::{
    ChannelObserver, CoreError, DownloadTask, SegmentedTransfer, StreamDescriptor, TaskPhase,
    TransferConfig, TransferOutcome,
};

fn main() {
    init_logging();

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        return;
    }

    let result = match args[1].as_str() {
        "info" => match args.get(2) {
            Some(url) => show_info(url),
            None => {
                print_usage();
                return;
            }
        },
        "get" => match args.get(2) {
            Some(url) => download(url, args.get(3).map(String::as_str)),
            None => {
                print_usage();
                return;
            }
        },
        "fetch" => match (args.get(2), args.get(3)) {
            (Some(url), Some(dest)) => {
                let segments = match args.get(4).map(|value| value.parse::<u32>()) {
                    Some(Ok(value)) if value > 0 => Some(value),
                    Some(_) => {
                        eprintln!("segments must be a positive number");
                        process::exit(2);
                    }
                    None => None,
                };
                fetch(url, dest, segments)
            }
            _ => {
                print_usage();
                return;
            }
        },
        "config" => match (args.get(2).map(String::as_str), args.get(3)) {
            (None, _) => show_config(),
            (Some("set-dir"), Some(path)) => set_download_dir(path),
            _ => {
                print_usage();
                return;
            }
        },
        _ => {
            print_usage();
            return;
        }
    };

    if let Err(err) = result {
        eprintln!("error: {}", err);
        process::exit(1);
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn show_info(url: &str) -> Result<(), CoreError> {
    match YtDlpClient::default().fetch(url)? {
        MediaInfo::Video(video) => {
            println!("{}", video.title);
            println!("duration: {}", format_duration(video.duration));
            let mut formats = video.formats.clone();
            sort_by_resolution(&mut formats);
            for fmt in formats {
                println!("{}", format_line(&fmt));
            }
        }
        MediaInfo::Playlist(list) => {
            println!("{} ({} entries)", list.title, list.entries.len());
            for (idx, entry) in list.entries.iter().enumerate() {
                println!(
                    "{:>3}. {} [{}]\t{}",
                    idx + 1,
                    entry.title,
                    format_duration(entry.duration),
                    entry.url
                );
            }
        }
    }
    Ok(())
}

fn format_line(fmt: &StreamDescriptor) -> String {
    let kind = if fmt.is_audio_only() {
        "audio"
    } else if fmt.is_video_only {
        "video"
    } else {
        "av"
    };
    let size = if fmt.filesize > 0 {
        format_bytes(fmt.filesize)
    } else {
        "?".to_string()
    };
    format!(
        "{:<10} {:<5} {:<10} {:<6} {:>10} {}",
        fmt.format_id, fmt.ext, fmt.resolution, kind, size, fmt.note
    )
}

fn choose_format<'a>(
    video: &'a VideoResult,
    formats: &'a [StreamDescriptor],
    format_id: Option<&str>,
) -> Result<&'a StreamDescriptor, CoreError> {
    match format_id {
        Some(id) => video
            .formats
            .iter()
            .find(|fmt| {
                fmt.format_id == id && !fmt.url.is_empty() && (fmt.has_video() || fmt.has_audio())
            })
            .ok_or_else(|| CoreError::Metadata(format!("no format with id {}", id))),
        None => formats
            .first()
            .ok_or_else(|| CoreError::Metadata("no downloadable video format".to_string())),
    }
}

fn download(url: &str, format_id: Option<&str>) -> Result<(), CoreError> {
    let video = match YtDlpClient::default().fetch(url)? {
        MediaInfo::Video(video) => video,
        MediaInfo::Playlist(list) => {
            println!(
                "{} is a playlist with {} entries, download them one by one:",
                list.title,
                list.entries.len()
            );
            for entry in list.entries {
                println!("  vidfetch get {}", entry.url);
            }
            return Ok(());
        }
    };

    let formats = downloadable_video_formats(&video);
    let fmt = choose_format(&video, &formats, format_id)?;
    let store = SettingsStore::open_default();
    debug!(settings = %store.path().display(), format = %fmt.format_id, "planning download");
    let spec = plan_task(&video, fmt, store.download_path());
    println!("saving to {}", spec.output_path.display());

    let task = DownloadTask::new(spec)?;
    let (observer, updates) = ChannelObserver::channel(64);
    task.subscribe(observer);
    task.start()?;

    let mut last_line = String::new();
    for snapshot in updates.iter() {
        let status = &snapshot.status;
        let line = match status.phase {
            TaskPhase::Downloading if !status.label.is_empty() => format!(
                "[{}] {:.1}% {}/{} {} {}",
                status.label,
                status.progress,
                format_bytes(status.bytes_done),
                if status.bytes_total > 0 {
                    format_bytes(status.bytes_total)
                } else {
                    "?".to_string()
                },
                status.speed_text,
                status.eta_text,
            ),
            phase => format!("[{}]", phase),
        };
        if line != last_line {
            println!("{}", line.trim_end());
            last_line = line;
        }
        if status.phase.is_terminal() {
            break;
        }
    }
    drop(updates);
    task.wait();

    let status = task.status();
    match status.phase {
        TaskPhase::Completed => {
            println!("done: {}", task.spec().output_path.display());
            Ok(())
        }
        TaskPhase::Error => {
            let message = status.error_message.unwrap_or_default();
            eprintln!("failed: {}", message);
            process::exit(1);
        }
        phase => {
            println!("stopped: {}", phase);
            Ok(())
        }
    }
}

fn fetch(url: &str, dest: &str, segments: Option<u32>) -> Result<(), CoreError> {
    let config = TransferConfig::default();
    let net = ReqwestNetClient::new(&config)?;
    let mut transfer = SegmentedTransfer::new(url, dest, Arc::new(net))
        .with_config(config)
        .on_progress(|percent, done, total| {
            if total > 0 {
                eprint!(
                    "\r{:.1}% {}/{}   ",
                    percent,
                    format_bytes(done),
                    format_bytes(total)
                );
            } else {
                eprint!("\r{}   ", format_bytes(done));
            }
        });
    if let Some(segments) = segments {
        transfer = transfer.with_max_segments(segments);
    }

    let outcome = transfer.run();
    eprintln!();
    match outcome? {
        TransferOutcome::Completed { bytes } => {
            println!("saved {} ({})", dest, format_bytes(bytes));
        }
        TransferOutcome::Stopped => println!("stopped"),
    }
    Ok(())
}

fn show_config() -> Result<(), CoreError> {
    let store = SettingsStore::open_default();
    println!("settings file: {}", store.path().display());
    println!("download path: {}", store.download_path().display());
    Ok(())
}

fn set_download_dir(path: &str) -> Result<(), CoreError> {
    let mut store = SettingsStore::open_default();
    store.set_download_path(PathBuf::from(path))?;
    println!("download path: {}", store.download_path().display());
    Ok(())
}

fn print_usage() {
    eprintln!(
        "Usage: vidfetch <command> [args]\n\
Commands:\n\
  info <url>                     Show title and available formats\n\
  get <url> [format_id]          Download a video (best resolution by default)\n\
  fetch <url> <dest> [segments]  Download a plain file with segmented transfer\n\
  config                         Show settings\n\
  config set-dir <path>          Change the download directory\n\
Environment:\n\
  VIDFETCH_SETTINGS=/path.json   Settings file location\n\
  RUST_LOG=debug                 Log verbosity (default warn)"
    );
}

fn format_duration(mut seconds: u64) -> String {
    let hours = seconds / 3600;
    seconds %= 3600;
    let minutes = seconds / 60;
    let secs = seconds % 60;
    if hours > 0 {
        format!("{:02}:{:02}:{:02}", hours, minutes, secs)
    } else {
        format!("{:02}:{:02}", minutes, secs)
    }
}
