//! Downloader output interpretation
//!
//! Turns the line-oriented output of yt-dlp into progress reports, the list
//! of produced files, and a failure classification.

use grabx_core::{GrabFailure, Progress, ProgressPhase};
use std::collections::VecDeque;

/// Lines kept for error reporting
const TAIL_LINES: usize = 20;

/// Output fragments that mean retrying cannot help
const PERMANENT_MARKERS: &[&str] = &[
    "unsupported url",
    "is not a valid url",
    "invalid url",
    "http error 401",
    "http error 403",
    "http error 404",
    "private video",
    "video unavailable",
    "this video is unavailable",
    "video is not available",
    "not available in your country",
];

/// Follows the output of one download run
#[derive(Debug, Default)]
pub struct OutputTracker {
    files: Vec<String>,
    tail: VecDeque<String>,
    phase: ProgressPhase,
}

impl OutputTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one output line; returns progress worth reporting, if any
    pub fn observe(&mut self, line: &str) -> Option<Progress> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        if self.tail.len() == TAIL_LINES {
            self.tail.pop_front();
        }
        self.tail.push_back(line.to_string());

        // A new output stream; percentages restart from zero
        if let Some(path) = destination(line) {
            self.add_file(path);
            self.phase = ProgressPhase::Downloading;
            return Some(Progress::default().with_phase(ProgressPhase::Downloading));
        }

        if let Some(path) = already_downloaded(line) {
            self.add_file(path);
        }
        if let Some(path) = merged_into(line) {
            self.add_file(path);
        }
        if let Some(path) = deleted_original(line) {
            self.files.retain(|f| f != path);
        }

        if is_post_processing(line) {
            self.phase = ProgressPhase::PostProcessing;
            return Some(Progress::default().with_phase(ProgressPhase::PostProcessing));
        }

        if line.starts_with("[download]") && self.phase != ProgressPhase::PostProcessing {
            let progress = parse_progress_line(line)?;
            self.phase = ProgressPhase::Downloading;
            return Some(progress);
        }

        None
    }

    /// Files produced so far, in the order they appeared
    pub fn files(&self) -> &[String] {
        &self.files
    }

    /// Builds the failure for a run that exited unsuccessfully
    pub fn failure(&self, exit_code: Option<i32>) -> GrabFailure {
        let message = self
            .tail
            .iter()
            .rev()
            .find(|l| l.starts_with("ERROR:"))
            .cloned()
            .unwrap_or_else(|| match exit_code {
                Some(code) => format!("downloader exited with status {}", code),
                None => "downloader terminated by signal".to_string(),
            });

        let lowered = self
            .tail
            .iter()
            .map(|l| l.to_lowercase())
            .collect::<Vec<_>>();
        let permanent = lowered
            .iter()
            .any(|l| PERMANENT_MARKERS.iter().any(|m| l.contains(m)));

        if permanent {
            GrabFailure::permanent(message)
        } else {
            GrabFailure::transient(message)
        }
    }

    fn add_file(&mut self, path: &str) {
        if !self.files.iter().any(|f| f == path) {
            self.files.push(path.to_string());
        }
    }
}

/// Parses a `[download]` progress line
///
/// ```text
/// [download]  42.3% of ~ 10.52MiB at  1.21MiB/s ETA 00:05
/// ```
pub fn parse_progress_line(line: &str) -> Option<Progress> {
    let pct_idx = line.find('%')?;
    let head = &line[..pct_idx];
    let start = head
        .char_indices()
        .rev()
        .find(|(_, c)| !(c.is_ascii_digit() || *c == '.' || *c == ' '))
        .map(|(i, c)| i + c.len_utf8())
        .unwrap_or(0);
    let percent: f64 = head[start..].trim().parse().ok()?;

    let mut progress = Progress::fraction(percent / 100.0);

    let tail = &line[pct_idx + 1..];
    if let Some(total) = tail.split_once(" of ").and_then(|(_, rest)| parse_size(rest)) {
        progress.total_bytes = Some(total);
        progress.downloaded_bytes = progress
            .fraction
            .map(|f| (f * total as f64).round() as u64);
    }

    if let Some(at) = line.find(" at ") {
        let rest = &line[at + 4..];
        let (speed, eta) = match rest.find(" ETA ") {
            Some(eta_idx) => (&rest[..eta_idx], Some(&rest[eta_idx + 5..])),
            None => (rest, None),
        };
        progress.speed = non_empty(speed);
        progress.eta = eta.and_then(non_empty);
    }

    Some(progress)
}

/// Parses a size such as `10.52MiB` or `~ 3.1GB` at the start of `text`
fn parse_size(text: &str) -> Option<u64> {
    let text = text.trim_start().trim_start_matches('~').trim_start();
    let token = text.split_whitespace().next()?;
    let split = token
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(token.len());
    let (number, unit) = token.split_at(split);
    let value: f64 = number.parse().ok()?;

    let multiplier: f64 = match unit {
        "B" => 1.0,
        "KiB" => 1024.0,
        "MiB" => 1024.0 * 1024.0,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        "TiB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        "KB" | "kB" => 1e3,
        "MB" => 1e6,
        "GB" => 1e9,
        "TB" => 1e12,
        _ => return None,
    };
    Some((value * multiplier).round() as u64)
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}

/// Path announced by a `... Destination: <path>` line
fn destination(line: &str) -> Option<&str> {
    if !line.starts_with('[') {
        return None;
    }
    line.split_once("Destination:")
        .map(|(_, path)| path.trim())
        .filter(|path| !path.is_empty())
}

fn already_downloaded(line: &str) -> Option<&str> {
    line.strip_prefix("[download] ")?
        .strip_suffix(" has already been downloaded")
        .map(str::trim)
}

fn merged_into(line: &str) -> Option<&str> {
    let (_, rest) = line.split_once("Merging formats into ")?;
    Some(rest.trim().trim_matches('"'))
}

fn deleted_original(line: &str) -> Option<&str> {
    let (_, rest) = line.split_once("Deleting original file ")?;
    let path = rest
        .split_once(" (pass -k to keep)")
        .map(|(path, _)| path)
        .unwrap_or(rest);
    Some(path.trim())
}

fn is_post_processing(line: &str) -> bool {
    line.contains("Merging formats into")
        || line.starts_with("[Merger]")
        || line.contains("Post-process")
        || line.contains("Postprocessing")
        || line.contains("Fixing")
        || line.contains("Extracting")
        || line.contains("Deleting original file")
}

/// Normalises a requested audio format to one the downloader can convert to
pub fn normalize_audio_format(quality: Option<&str>) -> &'static str {
    let q = quality.unwrap_or("").trim().to_lowercase();
    match q.as_str() {
        "mp3" => "mp3",
        "opus" => "opus",
        "aac" => "aac",
        "wav" => "wav",
        "flac" => "flac",
        _ => "m4a",
    }
}

/// Format selector for a video quality such as `"720p"`
pub fn video_format_selector(quality: Option<&str>) -> String {
    const BEST: &str = "bv*+ba/b";

    let q = quality.unwrap_or("").trim();
    if q.is_empty() || q.to_lowercase().contains("best") {
        return BEST.to_string();
    }

    match extract_height(q) {
        Some(h) if h > 0 => format!("bv*[height<={h}]+ba/b[height<={h}]/bv*+ba/b"),
        _ => BEST.to_string(),
    }
}

/// First run of digits in `quality`
fn extract_height(quality: &str) -> Option<u32> {
    let digits: String = quality
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use grabx_core::FailureKind;

    #[test]
    fn test_parse_progress_line() {
        let p = parse_progress_line("[download]  42.5% of ~ 10.52MiB at  1.21MiB/s ETA 00:05")
            .unwrap();
        assert_eq!(p.fraction, Some(0.425));
        assert_eq!(p.speed.as_deref(), Some("1.21MiB/s"));
        assert_eq!(p.eta.as_deref(), Some("00:05"));
        assert_eq!(p.phase, ProgressPhase::Downloading);
    }

    #[test]
    fn test_parse_progress_line_sizes() {
        let p = parse_progress_line("[download]  50.0% of ~ 10.00MiB at 1MiB/s ETA 00:05").unwrap();
        assert_eq!(p.total_bytes, Some(10 * 1024 * 1024));
        assert_eq!(p.downloaded_bytes, Some(5 * 1024 * 1024));

        let p = parse_progress_line("[download]  25.0% of 2.00KiB").unwrap();
        assert_eq!(p.total_bytes, Some(2048));
        assert_eq!(p.downloaded_bytes, Some(512));

        let p = parse_progress_line("[download]  25.0% of Unknown total size").unwrap();
        assert_eq!(p.total_bytes, None);
        assert_eq!(p.downloaded_bytes, None);
    }

    #[test]
    fn test_parse_progress_line_with_multibyte_text() {
        let p = parse_progress_line("[download] é50%").unwrap();
        assert_eq!(p.fraction, Some(0.5));

        let p = parse_progress_line("[download] 特価50% of 1.00MiB").unwrap();
        assert_eq!(p.fraction, Some(0.5));
        assert_eq!(p.total_bytes, Some(1024 * 1024));

        assert!(parse_progress_line("[download] 特価%").is_none());
    }

    #[test]
    fn test_parse_progress_line_without_speed() {
        let p = parse_progress_line("[download] 100% of 3.00MiB").unwrap();
        assert_eq!(p.fraction, Some(1.0));
        assert_eq!(p.speed, None);
        assert_eq!(p.eta, None);

        assert!(parse_progress_line("[download] Downloading playlist").is_none());
    }

    #[test]
    fn test_tracker_phases_and_files() {
        let mut tracker = OutputTracker::new();

        let reset = tracker
            .observe("[download] Destination: out/clip [720p] (1).f136.mp4")
            .unwrap();
        assert_eq!(reset.phase, ProgressPhase::Downloading);
        assert_eq!(reset.fraction, None);

        let p = tracker.observe("[download]  50.0% of 4MiB at 1MiB/s ETA 00:02").unwrap();
        assert_eq!(p.fraction, Some(0.5));

        tracker.observe("[download] Destination: out/clip [720p] (1).f140.m4a");
        let post = tracker
            .observe("[Merger] Merging formats into \"out/clip [720p] (1).mp4\"")
            .unwrap();
        assert_eq!(post.phase, ProgressPhase::PostProcessing);

        tracker.observe("Deleting original file out/clip [720p] (1).f136.mp4 (pass -k to keep)");
        tracker.observe("Deleting original file out/clip [720p] (1).f140.m4a (pass -k to keep)");

        assert_eq!(tracker.files(), ["out/clip [720p] (1).mp4"]);
    }

    #[test]
    fn test_tracker_ignores_noise() {
        let mut tracker = OutputTracker::new();
        assert!(tracker.observe("").is_none());
        assert!(tracker.observe("[youtube] abc: Downloading webpage").is_none());
        assert!(tracker.files().is_empty());
    }

    #[test]
    fn test_failure_classification() {
        let mut tracker = OutputTracker::new();
        tracker.observe("ERROR: [youtube] abc: Private video. Sign in if you've been granted access");
        let failure = tracker.failure(Some(1));
        assert_eq!(failure.kind, FailureKind::Permanent);
        assert!(failure.message.starts_with("ERROR:"));

        let mut tracker = OutputTracker::new();
        tracker.observe("ERROR: Unable to download webpage: HTTP Error 404: Not Found");
        assert_eq!(tracker.failure(Some(1)).kind, FailureKind::Permanent);

        let mut tracker = OutputTracker::new();
        tracker.observe("ERROR: unable to download video data: HTTP Error 503");
        assert_eq!(tracker.failure(Some(1)).kind, FailureKind::Transient);

        let failure = OutputTracker::new().failure(Some(2));
        assert_eq!(failure.kind, FailureKind::Transient);
        assert_eq!(failure.message, "downloader exited with status 2");
    }

    #[test]
    fn test_normalize_audio_format() {
        assert_eq!(normalize_audio_format(Some("MP3")), "mp3");
        assert_eq!(normalize_audio_format(Some(" flac ")), "flac");
        assert_eq!(normalize_audio_format(Some("best")), "m4a");
        assert_eq!(normalize_audio_format(Some("ogg")), "m4a");
        assert_eq!(normalize_audio_format(None), "m4a");
    }

    #[test]
    fn test_video_format_selector() {
        assert_eq!(
            video_format_selector(Some("720p")),
            "bv*[height<=720]+ba/b[height<=720]/bv*+ba/b"
        );
        assert_eq!(
            video_format_selector(Some("1080p60")),
            "bv*[height<=1080]+ba/b[height<=1080]/bv*+ba/b"
        );
        assert_eq!(video_format_selector(Some("Best")), "bv*+ba/b");
        assert_eq!(video_format_selector(Some("")), "bv*+ba/b");
        assert_eq!(video_format_selector(Some("hd")), "bv*+ba/b");
        assert_eq!(video_format_selector(None), "bv*+ba/b");
    }
}
