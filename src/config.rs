//! Test settings: the knobs of a loopback run and the values derived from them.
//!
//! Settings are plain data. `validate()` clamps every field into its legal
//! range and only rejects combinations that cannot be clamped into sense.

#![forbid(unsafe_code)]

use std::path::PathBuf;
use thiserror::Error;

/// Milliseconds per second.
pub const MILLIS_PER_SECOND: u32 = 1000;
/// Nanoseconds per millisecond.
pub const NANOS_PER_MILLI: u64 = 1_000_000;

/// Lowest supported sampling rate in Hz.
pub const SAMPLING_RATE_MIN: u32 = 8000;
/// Highest supported sampling rate in Hz.
pub const SAMPLING_RATE_MAX: u32 = 48000;

/// Shortest buffer test in seconds.
pub const BUFFER_TEST_DURATION_MIN: u32 = 1;
/// Longest buffer test in seconds (ten hours).
pub const BUFFER_TEST_DURATION_MAX: u32 = 36000;

/// Shortest wave plot window in seconds.
pub const WAVE_PLOT_DURATION_MIN: u32 = 1;
/// Longest wave plot window in seconds.
pub const WAVE_PLOT_DURATION_MAX: u32 = 120;

/// Correlation block size bounds and default.
pub const CORRELATION_BLOCK_SIZE_MIN: usize = 2048;
pub const CORRELATION_BLOCK_SIZE_MAX: usize = 8192;
pub const CORRELATION_BLOCK_SIZE_DEFAULT: usize = 4096;

/// Test tone frequencies. Both are primes so they never sit on an FFT bin center.
pub const PRIME_FREQUENCY_1: f64 = 703.0;
pub const PRIME_FREQUENCY_2: f64 = 719.0;

/// Latency probe tone.
pub const LOOPBACK_FREQUENCY: f64 = 4000.0;
pub const LOOPBACK_SAMPLE_FRAMES: usize = 300;
/// Sample offset in the recorded stream where the latency probe is injected.
pub const LOOPBACK_INJECT_OFFSET: usize = 100;
/// Seconds of audio recorded by a latency test.
pub const LATENCY_RECORD_SECONDS: u32 = 2;

/// Capacity (in samples) of the transport rings.
pub const MAX_SHORTS: usize = 65536;

/// Join budget for role threads.
pub const JOIN_WAIT_TIME_MS: u64 = 1000;

/// Default number of captures retained by the capture cache.
pub const DEFAULT_NUM_CAPTURES: usize = 5;
/// Default capacity of each late-callback log.
pub const DEFAULT_LATE_CALLBACK_CAPACITY: usize = 1000;

/// Which kind of audio thread drives the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadType {
    /// A managed thread that blocks in read/write calls.
    Java,
    /// A native driver callback.
    Native,
}

impl ThreadType {
    /// Numeric code used in the summary report.
    pub fn code(self) -> i32 {
        match self {
            ThreadType::Java => 0,
            ThreadType::Native => 1,
        }
    }

    /// Label used in the summary report.
    pub fn label(self) -> &'static str {
        match self {
            ThreadType::Java => "JAVA",
            ThreadType::Native => "NATIVE",
        }
    }
}

/// What a run measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestType {
    /// Round-trip latency from a single injected probe.
    Latency,
    /// Buffer period timing and glitch detection over a long run.
    BufferPeriod,
}

/// Errors for settings that cannot be clamped into a usable configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// Buffer sizes must hold at least one frame.
    #[error("{role} buffer must be at least one frame")]
    ZeroBufferFrames {
        /// `"player"` or `"recorder"`.
        role: &'static str,
    },
    /// Capture was requested without a usable file name prefix.
    #[error("capture enabled with an empty file name prefix")]
    EmptyCapturePrefix,
}

/// Settings for a single loopback run.
#[derive(Debug, Clone)]
pub struct TestSettings {
    pub sampling_rate: u32,
    pub player_buffer_frames: usize,
    pub recorder_buffer_frames: usize,
    pub thread_type: ThreadType,
    pub test_type: TestType,
    pub buffer_test_duration_s: u32,
    pub wave_plot_duration_s: u32,
    pub correlation_block_size: usize,
    pub tone_frequency: f64,
    /// Adds a phase skip once per second of generated tone.
    pub inject_glitches: bool,
    pub ignore_first_frames: usize,
    pub num_load_threads: usize,
    pub num_captures: usize,
    pub capture_wav: bool,
    pub capture_systrace: bool,
    pub capture_bugreport: bool,
    pub capture_dir: PathBuf,
    pub capture_prefix: String,
    pub signal_file: PathBuf,
    pub late_callback_capacity: usize,
    /// Output level reported as `AudioLevel`; not applied to the signal.
    pub audio_level: i32,
}

impl Default for TestSettings {
    fn default() -> Self {
        let capture_dir = std::env::temp_dir().join("loopback");
        Self {
            sampling_rate: 48000,
            player_buffer_frames: 480,
            recorder_buffer_frames: 480,
            thread_type: ThreadType::Java,
            test_type: TestType::BufferPeriod,
            buffer_test_duration_s: 5,
            wave_plot_duration_s: 10,
            correlation_block_size: CORRELATION_BLOCK_SIZE_DEFAULT,
            tone_frequency: PRIME_FREQUENCY_1,
            inject_glitches: false,
            ignore_first_frames: 0,
            num_load_threads: 0,
            num_captures: DEFAULT_NUM_CAPTURES,
            capture_wav: false,
            capture_systrace: false,
            capture_bugreport: false,
            signal_file: capture_dir.join("loopback_signal"),
            capture_dir,
            capture_prefix: "loopback".to_string(),
            late_callback_capacity: DEFAULT_LATE_CALLBACK_CAPACITY,
            audio_level: -1,
        }
    }
}

impl TestSettings {
    /// Clamps every field to its legal range.
    ///
    /// Returns an error only for combinations clamping cannot repair.
    pub fn validate(mut self) -> Result<Self, ConfigError> {
        if self.player_buffer_frames == 0 {
            return Err(ConfigError::ZeroBufferFrames { role: "player" });
        }
        if self.recorder_buffer_frames == 0 {
            return Err(ConfigError::ZeroBufferFrames { role: "recorder" });
        }
        if self.capture_enabled() && self.capture_prefix.trim().is_empty() {
            return Err(ConfigError::EmptyCapturePrefix);
        }
        self.sampling_rate = self.sampling_rate.clamp(SAMPLING_RATE_MIN, SAMPLING_RATE_MAX);
        self.buffer_test_duration_s = self
            .buffer_test_duration_s
            .clamp(BUFFER_TEST_DURATION_MIN, BUFFER_TEST_DURATION_MAX);
        self.wave_plot_duration_s = self
            .wave_plot_duration_s
            .clamp(WAVE_PLOT_DURATION_MIN, WAVE_PLOT_DURATION_MAX);
        self.correlation_block_size = clamp_block_size(self.correlation_block_size);
        let nyquist = f64::from(self.sampling_rate) / 2.0;
        if !(self.tone_frequency > 0.0 && self.tone_frequency < nyquist) {
            self.tone_frequency = PRIME_FREQUENCY_1;
        }
        self.num_captures = self.num_captures.max(1);
        self.late_callback_capacity = self.late_callback_capacity.max(1);
        Ok(self)
    }

    /// True when any capture artifact is requested.
    pub fn capture_enabled(&self) -> bool {
        self.capture_wav || self.capture_systrace || self.capture_bugreport
    }

    /// Expected recorder buffer period in whole milliseconds.
    pub fn expected_recorder_period_ms(&self) -> u32 {
        expected_buffer_period_ms(self.recorder_buffer_frames, self.sampling_rate)
    }

    /// Expected player buffer period in whole milliseconds.
    pub fn expected_player_period_ms(&self) -> u32 {
        expected_buffer_period_ms(self.player_buffer_frames, self.sampling_rate)
    }

    /// FFT window for glitch detection: 20 ms of audio, rounded to a power of two.
    pub fn fft_size(&self) -> usize {
        fft_size_for(self.sampling_rate)
    }

    /// New samples consumed per FFT frame.
    pub fn fft_overlap(&self) -> usize {
        self.fft_size() / 2
    }

    /// Analysis thread back-off when short of samples.
    pub fn analysis_sleep_ms(&self) -> u64 {
        let ms = self.fft_overlap() as u64 * u64::from(MILLIS_PER_SECOND)
            / u64::from(self.sampling_rate.max(1));
        ms.max(1)
    }

    /// Samples held by each wave snapshot deck.
    pub fn wave_deck_samples(&self) -> usize {
        let min = SAMPLING_RATE_MIN as usize * WAVE_PLOT_DURATION_MIN as usize;
        let max = SAMPLING_RATE_MAX as usize * BUFFER_TEST_DURATION_MAX as usize;
        (self.sampling_rate as usize * self.wave_plot_duration_s as usize).clamp(min, max)
    }

    /// Glitch log capacity: ten entries per second of test.
    pub fn glitch_log_capacity(&self) -> usize {
        self.buffer_test_duration_s as usize * 10
    }
}

/// `round(frames * 1000 / sampling_rate)` in whole milliseconds.
pub fn expected_buffer_period_ms(frames: usize, sampling_rate: u32) -> u32 {
    if sampling_rate == 0 {
        return 0;
    }
    (frames as f64 * f64::from(MILLIS_PER_SECOND) / f64::from(sampling_rate)).round() as u32
}

/// 20 ms of samples rounded to the nearest power of two, at least 2.
pub fn fft_size_for(sampling_rate: u32) -> usize {
    let samples = f64::from(sampling_rate) * 0.02;
    let exponent = samples.max(2.0).log2().round() as u32;
    (1usize << exponent).max(2)
}

/// Clamps a correlation block size to the supported range.
pub fn clamp_block_size(size: usize) -> usize {
    size.clamp(CORRELATION_BLOCK_SIZE_MIN, CORRELATION_BLOCK_SIZE_MAX)
}
