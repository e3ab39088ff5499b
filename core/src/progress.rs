use std::time::{Duration, Instant};

const MIB: f64 = 1024.0 * 1024.0;

/// Speed and ETA for one phase, measured from the moment the phase's
/// transfer began. Values are instantaneous averages, not smoothed.
#[derive(Debug, Clone, Copy)]
pub struct PhaseMeter {
    started: Instant,
}

impl PhaseMeter {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn speed_mbps(&self, bytes_done: u64) -> Option<f64> {
        speed_mbps(bytes_done, self.elapsed())
    }
}

pub fn speed_mbps(bytes_done: u64, elapsed: Duration) -> Option<f64> {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 || bytes_done == 0 {
        return None;
    }
    Some(bytes_done as f64 / MIB / secs)
}

pub fn speed_text(speed_mbps: f64) -> String {
    format!("{:.1} MB/s", speed_mbps)
}

pub fn eta_secs(bytes_done: u64, bytes_total: u64, speed_mbps: f64) -> Option<f64> {
    if bytes_total == 0 || speed_mbps <= 0.0 {
        return None;
    }
    let remaining_mb = bytes_total.saturating_sub(bytes_done) as f64 / MIB;
    Some(remaining_mb / speed_mbps)
}

pub fn eta_text(eta_secs: f64) -> String {
    if eta_secs < 60.0 {
        format!("{}s remaining", eta_secs as u64)
    } else if eta_secs < 3600.0 {
        format!("{}m remaining", (eta_secs / 60.0) as u64)
    } else {
        format!("{}h remaining", (eta_secs / 3600.0) as u64)
    }
}

pub fn format_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    let b = bytes as f64;
    if b >= GB {
        format!("{:.2}GB", b / GB)
    } else if b >= MB {
        format!("{:.2}MB", b / MB)
    } else if b >= KB {
        format!("{:.2}KB", b / KB)
    } else {
        format!("{}B", bytes)
    }
}
