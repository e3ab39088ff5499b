use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub index: u32,
    pub range_start: u64,
    /// Inclusive.
    pub range_end: u64,
}

impl Segment {
    pub fn new(index: u32, range_start: u64, range_end: u64) -> Self {
        Self {
            index,
            range_start,
            range_end,
        }
    }

    pub fn size(&self) -> u64 {
        if self.range_end >= self.range_start {
            self.range_end - self.range_start + 1
        } else {
            0
        }
    }
}

/// Splits `[0, total_bytes)` into contiguous ranges. Every segment but the
/// last gets `total / n` bytes; the last one absorbs the remainder.
pub fn plan_segments(total_bytes: u64, max_segments: u32) -> Vec<Segment> {
    if total_bytes == 0 {
        return Vec::new();
    }

    let segment_count = (max_segments.max(1) as u64).min(total_bytes);
    let base = total_bytes / segment_count;

    let mut segments = Vec::with_capacity(segment_count as usize);
    for index in 0..segment_count {
        let start = index * base;
        let end = if index == segment_count - 1 {
            total_bytes - 1
        } else {
            start + base - 1
        };
        segments.push(Segment::new(index as u32, start, end));
    }

    segments
}

pub fn part_path(dest: &Path, index: u32) -> PathBuf {
    let name = dest
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "download".to_string());
    dest.with_file_name(format!("{}.part{}", name, index))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ten_mib_in_four_segments() {
        let total = 10 * 1024 * 1024;
        let segments = plan_segments(total, 4);
        assert_eq!(segments.len(), 4);
        for segment in &segments {
            assert_eq!(segment.size(), 2_621_440);
        }
        assert_eq!(segments[3].range_end, total - 1);
    }

    #[test]
    fn segments_cover_total_without_gaps() {
        for total in [1u64, 7, 1_048_576, 1_048_583, 10_485_761] {
            for n in 1..=9u32 {
                let segments = plan_segments(total, n);
                assert_eq!(segments.iter().map(Segment::size).sum::<u64>(), total);
                assert_eq!(segments[0].range_start, 0);
                for pair in segments.windows(2) {
                    assert_eq!(pair[0].range_end + 1, pair[1].range_start);
                }
            }
        }
    }

    #[test]
    fn last_segment_absorbs_remainder() {
        let segments = plan_segments(1003, 4);
        assert_eq!(segments[0].size(), 250);
        assert_eq!(segments[1].size(), 250);
        assert_eq!(segments[2].size(), 250);
        assert_eq!(segments[3].size(), 253);
    }

    #[test]
    fn zero_segments_means_one() {
        let segments = plan_segments(4096, 0);
        assert_eq!(segments, vec![Segment::new(0, 0, 4095)]);
    }

    #[test]
    fn part_files_sit_next_to_destination() {
        let path = part_path(Path::new("/tmp/out/temp_video_clip.mp4"), 3);
        assert_eq!(path, PathBuf::from("/tmp/out/temp_video_clip.mp4.part3"));
    }
}
