//! Text exports: buffer-period tables, glitch lists and the summary report.

#![forbid(unsafe_code)]

use crate::buffer_period::{BufferPeriodHistogram, BufferPeriodStats};
use crate::capture::CaptureRecord;
use crate::config::{TestSettings, MILLIS_PER_SECOND};
use crate::performance::PerformanceSummary;
use crate::session::{BufferTestResult, LatencyTestResult};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Glitches in the first frames are start-up noise.
pub const GLITCH_DISCARD_FRAMES: u32 = 10;
const SECONDS_PER_HOUR: f64 = 3600.0;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("failed to write {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Writes `text` to `path`.
pub fn write_text(path: &Path, text: &str) -> Result<(), ReportError> {
    fs::write(path, text).map_err(|source| ReportError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// `bucket\tcount` lines up to the longest period seen.
pub fn buffer_period_text(histogram: &BufferPeriodHistogram) -> String {
    let counts = histogram.counts();
    let last = (histogram.max_ms() as usize).min(counts.len().saturating_sub(1));
    let mut out = String::new();
    for (bucket, count) in counts.iter().enumerate().take(last + 1) {
        let _ = writeln!(out, "{bucket}\t{count}");
    }
    out
}

/// Counts glitches, pairing up consecutive glitching frames.
///
/// Neighbouring frames overlap, so two consecutive frames are one glitch;
/// a run of three counts as two.
pub fn estimate_number_of_glitches(frames: &[u32]) -> u32 {
    let mut count = 0;
    let mut previous: Option<u32> = None;
    let mut paired_open = false;
    for &frame in frames.iter().filter(|&&f| f > GLITCH_DISCARD_FRAMES) {
        if paired_open && previous.map_or(false, |p| frame == p + 1) {
            paired_open = false;
        } else {
            paired_open = true;
            count += 1;
        }
        previous = Some(frame);
    }
    count
}

/// Start of each glitching frame in ms since the test began, rounded down.
pub fn glitch_milliseconds(
    frames: &[u32],
    fft_size: usize,
    overlap: usize,
    sampling_rate: u32,
) -> Vec<u32> {
    let new_samples_ms = (fft_size - overlap) as f64 / f64::from(sampling_rate.max(1))
        * f64::from(MILLIS_PER_SECOND);
    frames
        .iter()
        .map(|&frame| (f64::from(frame) * new_samples_ms) as u32)
        .collect()
}

/// Human-readable glitch list.
pub fn glitch_list_text(
    frames: &[u32],
    fft_size: usize,
    overlap: usize,
    sampling_rate: u32,
    interval_too_long: bool,
) -> String {
    let window_ms =
        (fft_size as f64 / f64::from(sampling_rate.max(1)) * f64::from(MILLIS_PER_SECOND)) as u32;
    let mut out = String::new();
    let _ = writeln!(out, "Total Glitching Interval too long: {interval_too_long}");
    let _ = writeln!(
        out,
        "Estimated number of glitches: {}",
        estimate_number_of_glitches(frames)
    );
    out.push_str("List of glitching intervals: \n");
    for start in glitch_milliseconds(frames, fft_size, overlap, sampling_rate) {
        let _ = writeln!(out, "{start}~{}ms", start + window_ms);
    }
    out
}

/// One glitch start time in ms per line.
pub fn glitch_file_text(frames: &[u32], fft_size: usize, overlap: usize, sampling_rate: u32) -> String {
    glitch_milliseconds(frames, fft_size, overlap, sampling_rate)
        .iter()
        .fold(String::new(), |mut out, ms| {
            let _ = writeln!(out, "{ms}");
            out
        })
}

/// Glitches per hour, reported only once the run lasted half an hour.
pub fn glitches_per_hour(glitches: u32, elapsed: Duration) -> Option<u32> {
    let hours = elapsed.as_secs_f64() / SECONDS_PER_HOUR;
    (hours >= 0.5).then(|| (f64::from(glitches) / hours).ceil() as u32)
}

fn header(out: &mut String, settings: &TestSettings, date_time: &str) {
    let _ = writeln!(out, "DateTime = {date_time}");
    let _ = writeln!(out, "SF = {}", settings.sampling_rate);
    let _ = writeln!(out, "RecorderBuffer = {}", settings.recorder_buffer_frames);
    let _ = writeln!(out, "PlayerBuffer = {}", settings.player_buffer_frames);
    let _ = writeln!(out, "AudioThread = {}", settings.thread_type.code());
    let _ = writeln!(out, "AudioThread_String = {}", settings.thread_type.label());
    let _ = writeln!(out, "AudioLevel = {}", settings.audio_level);
}

/// `key = value` report for a latency test.
pub fn latency_report(result: &LatencyTestResult, date_time: &str) -> String {
    let mut out = String::new();
    header(&mut out, &result.settings, date_time);
    let _ = writeln!(out, "IgnoreFirstFrames = {}", result.settings.ignore_first_frames);
    match result.latency_ms() {
        Some(ms) => {
            let _ = writeln!(out, "LatencyMs = {ms:.2}");
        }
        None => out.push_str("LatencyMs = unknown\n"),
    }
    let (confidence, average, rms) = result
        .estimate
        .map_or((0.0, 0.0, 0.0), |e| (e.confidence, e.average, e.rms));
    let _ = writeln!(out, "LatencyConfidence = {confidence:.2}");
    let _ = writeln!(out, "Average = {average:.4}");
    let _ = writeln!(out, "RMS = {rms:.4}");
    out
}

fn side(out: &mut String, name: &str, stats: &BufferPeriodStats, summary: &PerformanceSummary) {
    let _ = writeln!(
        out,
        "Expected {name} Buffer Period (ms) = {}",
        summary.expected_ms
    );
    let _ = writeln!(
        out,
        "{name} Buffer Periods At Expected = {:.5}%",
        summary.percent_at_expected * 100.0
    );
    let _ = writeln!(out, "{name} Buffer Period Std Dev = {:.5} ms", stats.std_dev_ms());
    let _ = writeln!(
        out,
        "kth% Late {name} Buffer Callbacks = {:.5}",
        summary.kth_percent_late()
    );
    let _ = writeln!(out, "{name} Benchmark = {}", summary.benchmark);
    let _ = writeln!(out, "{name} Number of Outliers = {}", summary.outliers);
}

/// `key = value` report for a buffer test.
pub fn buffer_test_report(result: &BufferTestResult, date_time: &str) -> String {
    let mut out = String::new();
    header(&mut out, &result.settings, date_time);
    let _ = writeln!(
        out,
        "Buffer Test Duration (s) = {}",
        result.settings.buffer_test_duration_s
    );
    side(&mut out, "Recorder", &result.recorder, &result.recorder_performance);
    side(&mut out, "Player", &result.player, &result.player_performance);

    let glitches = result.estimated_glitches();
    if let Some(per_hour) = glitches_per_hour(glitches, result.elapsed) {
        let _ = writeln!(out, "Glitches Per Hour = {per_hour}");
    }
    let _ = writeln!(out, "Total Number of Glitches = {glitches}");
    let _ = writeln!(
        out,
        "Total glitching interval too long = {}",
        result.interval_too_long
    );
    let late = [("Player", &result.player), ("Recorder", &result.recorder)];
    for (name, stats) in late {
        let _ = writeln!(out, "Late {name} Callbacks = {}", stats.late_callbacks.len());
        let _ = writeln!(
            out,
            "Late {name} Callbacks Exceeded Capacity = {}",
            stats.late_callbacks.capacity_exceeded()
        );
    }
    captures(&mut out, &result.captures);
    out
}

fn captures(out: &mut String, records: &[CaptureRecord]) {
    for record in records {
        let _ = writeln!(
            out,
            "Capture = {} (rank {})",
            record.prefix.display(),
            record.rank
        );
    }
}
