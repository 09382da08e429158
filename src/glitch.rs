//! Spectral glitch detection over overlapping FFT frames.
//!
//! Recorded samples fill a window of `fft_size` samples. Each full window is
//! Hann-windowed and transformed. Its spectral centroid is compared with the
//! centroid of a clean copy of the test tone. The window then slides by
//! `fft_size - overlap` samples.

#![forbid(unsafe_code)]

use crate::capture::{CaptureCache, CaptureStatus};
use crate::config::{TestSettings, MILLIS_PER_SECOND};
use crate::fft::{Fft, FftError};
use crate::invariant_ppt::{assert_invariant, GLITCH_LOG_BOUNDED, REFERENCE_CENTROID_VALID};
use crate::invariant_rt::{
    signal_invariant, INV_GLITCH_FLAGGED, INV_GLITCH_LOG_SATURATED, INV_OVERRUN_RECOVERED,
};
use crate::ring::SampleConsumer;
use crate::task::{join_with_timeout, spawn_named, JoinFailure, StopToken};
use crate::tone::ToneGenerator;
use crate::wave_deck::WaveDeckBuffer;
use log::{debug, warn};
use rtrb::Producer;
use std::io;
use std::thread::JoinHandle;
use std::time::Duration;

/// Relative centroid deviation above which a frame is a glitch.
pub const ACCEPTABLE_PERCENT_DIFFERENCE: f64 = 0.02;
/// Magnitudes below this are treated as noise.
pub const NOISE_THRESHOLD: f64 = 0.1;
/// Centroid of a frame with no energy above the noise threshold.
pub const SILENCE_CENTROID: f64 = -1.0;
/// Frames looked back over when ranking a glitch burst (about 30 s at 48 kHz).
pub const GLITCH_CONCENTRATION_WINDOW: u32 = 1500;
/// Frames between capture attempts (about 90 s at 48 kHz).
pub const CAPTURE_COOLDOWN_FRAMES: u32 = 4500;

/// Applies a Hann window in place.
pub fn hann_window(samples: &mut [f64]) {
    let len = samples.len();
    if len < 2 {
        return;
    }
    let denom = (len - 1) as f64;
    for (i, sample) in samples.iter_mut().enumerate() {
        let coefficient = std::f64::consts::TAU * i as f64 / denom;
        *sample *= 0.5 - 0.5 * coefficient.cos();
    }
}

/// Energy-weighted mean frequency of `magnitudes`, or [`SILENCE_CENTROID`].
pub fn spectral_centroid(magnitudes: &[f64], bin_width: f64) -> f64 {
    let (weighted, total) = magnitudes
        .iter()
        .enumerate()
        .fold((0.0, 0.0), |(w, t), (i, &m)| (w + m * i as f64, t + m));
    if total == 0.0 {
        SILENCE_CENTROID
    } else {
        weighted * bin_width / total
    }
}

/// Bounded list of glitching frame numbers.
#[derive(Debug, Clone)]
pub struct GlitchLog {
    frames: Vec<u32>,
    capacity: usize,
    interval_too_long: bool,
}

impl GlitchLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: Vec::with_capacity(capacity),
            capacity,
            interval_too_long: false,
        }
    }

    pub fn is_full(&self) -> bool {
        self.frames.len() >= self.capacity
    }

    pub fn push(&mut self, frame: u32) {
        assert_invariant(
            GLITCH_LOG_BOUNDED,
            self.frames.len() < self.capacity,
            "glitch log never grows past capacity",
            Some("GlitchLog::push"),
        );
        self.frames.push(frame);
    }

    /// Sets the sticky overflow flag. Returns `true` the first time only.
    pub fn mark_interval_too_long(&mut self) -> bool {
        !std::mem::replace(&mut self.interval_too_long, true)
    }

    pub fn frames(&self) -> &[u32] {
        &self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn interval_too_long(&self) -> bool {
        self.interval_too_long
    }
}

/// Plot buffer that restarts from a cleared array instead of wrapping.
#[derive(Debug, Clone)]
pub struct PlotSnapshot {
    samples: Vec<f64>,
    index: usize,
}

impl PlotSnapshot {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: vec![0.0; capacity.max(1)],
            index: 0,
        }
    }

    pub fn append(&mut self, data: &[f64]) {
        let capacity = self.samples.len();
        if self.index + data.len() > capacity {
            self.samples.fill(0.0);
            self.index = 0;
        }
        let data = &data[data.len().saturating_sub(capacity)..];
        self.samples[self.index..self.index + data.len()].copy_from_slice(data);
        self.index += data.len();
    }

    pub fn samples(&self) -> &[f64] {
        &self.samples
    }

    /// Next write position.
    pub fn index(&self) -> usize {
        self.index
    }
}

/// Detector parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorConfig {
    pub sampling_rate: u32,
    /// Frequency of the clean reference tone.
    pub frequency: f64,
    pub fft_size: usize,
    /// Samples shared by consecutive frames.
    pub overlap: usize,
    pub glitch_log_capacity: usize,
    pub plot_samples: usize,
}

impl DetectorConfig {
    pub fn from_settings(settings: &TestSettings) -> Self {
        Self {
            sampling_rate: settings.sampling_rate,
            frequency: settings.tone_frequency,
            fft_size: settings.fft_size(),
            overlap: settings.fft_overlap(),
            glitch_log_capacity: settings.glitch_log_capacity(),
            plot_samples: settings.wave_deck_samples(),
        }
    }

    pub fn new_samples_per_fft(&self) -> usize {
        self.fft_size - self.overlap
    }

    /// Back-off when a window is not yet full.
    pub fn sleep_duration(&self) -> Duration {
        let ms = self.overlap as u64 * u64::from(MILLIS_PER_SECOND)
            / u64::from(self.sampling_rate.max(1));
        Duration::from_millis(ms.max(1))
    }

    /// Length of one frame in whole milliseconds.
    pub fn window_ms(&self) -> u32 {
        (self.fft_size as u64 * u64::from(MILLIS_PER_SECOND) / u64::from(self.sampling_rate.max(1)))
            as u32
    }
}

/// Frame-by-frame glitch detector. Owned by the analysis thread.
pub struct GlitchDetector {
    config: DetectorConfig,
    fft: Fft,
    pcm: Vec<i16>,
    filled: usize,
    frame: Vec<f64>,
    re: Vec<f64>,
    im: Vec<f64>,
    magnitudes: Vec<f64>,
    reference_centroid: f64,
    glitches: GlitchLog,
    fft_count: u32,
    first_frame: bool,
    plot: PlotSnapshot,
    wave_deck: Option<WaveDeckBuffer>,
    capture: Option<CaptureCache>,
    last_capture_attempt: u32,
    signals: Option<Producer<u8>>,
    overruns: u64,
}

impl std::fmt::Debug for GlitchDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlitchDetector")
            .field("config", &self.config)
            .field("reference_centroid", &self.reference_centroid)
            .field("fft_count", &self.fft_count)
            .field("glitches", &self.glitches.len())
            .finish_non_exhaustive()
    }
}

impl GlitchDetector {
    /// Builds the detector and calibrates the reference centroid.
    pub fn new(mut config: DetectorConfig) -> Result<Self, FftError> {
        let fft = Fft::new(config.fft_size)?;
        let size = config.fft_size;
        config.overlap = config.overlap.min(size - 1);
        let mut detector = Self {
            fft,
            pcm: vec![0; size],
            filled: 0,
            frame: vec![0.0; size],
            re: vec![0.0; size],
            im: vec![0.0; size],
            magnitudes: vec![0.0; size / 2],
            reference_centroid: 0.0,
            glitches: GlitchLog::new(config.glitch_log_capacity),
            fft_count: 0,
            first_frame: true,
            plot: PlotSnapshot::new(config.plot_samples),
            wave_deck: None,
            capture: None,
            last_capture_attempt: 0,
            signals: None,
            overruns: 0,
            config,
        };

        let mut tone = vec![0.0; size];
        ToneGenerator::sine(detector.config.frequency, detector.config.sampling_rate)
            .generate(&mut tone);
        detector.reference_centroid = detector.centroid_of(&tone);
        assert_invariant(
            REFERENCE_CENTROID_VALID,
            detector.reference_centroid > 0.0,
            "reference tone has a positive centroid",
            Some("GlitchDetector::new"),
        );
        debug!("expected spectral centroid: {:.3} Hz", detector.reference_centroid);
        Ok(detector)
    }

    /// Mirrors analyzed audio into `decks` for capture export.
    pub fn with_wave_deck(mut self, decks: WaveDeckBuffer) -> Self {
        self.wave_deck = Some(decks);
        self
    }

    /// Submits glitch bursts to `capture`.
    pub fn with_capture(mut self, capture: CaptureCache) -> Self {
        self.capture = Some(capture);
        self
    }

    /// Reports flagged frames and overruns through an RT signal queue.
    pub fn with_signals(mut self, signals: Producer<u8>) -> Self {
        self.signals = Some(signals);
        self
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Centroid of one window run through the full frame pipeline.
    ///
    /// `samples` must hold exactly `fft_size` values.
    pub fn centroid_of(&mut self, samples: &[f64]) -> f64 {
        self.re.copy_from_slice(samples);
        hann_window(&mut self.re);
        self.fft
            .magnitude_spectrum(&mut self.re, &mut self.im, &mut self.magnitudes);
        for magnitude in self.magnitudes.iter_mut() {
            if *magnitude < NOISE_THRESHOLD {
                *magnitude = 0.0;
            }
        }
        let bin_width = f64::from(self.config.sampling_rate) / self.config.fft_size as f64;
        spectral_centroid(&self.magnitudes, bin_width)
    }

    /// Feeds samples directly. Returns the number of frames analyzed.
    pub fn push_samples(&mut self, mut samples: &[i16]) -> usize {
        let mut frames = 0;
        while !samples.is_empty() {
            let take = (self.pcm.len() - self.filled).min(samples.len());
            self.pcm[self.filled..self.filled + take].copy_from_slice(&samples[..take]);
            self.filled += take;
            samples = &samples[take..];
            if self.filled == self.pcm.len() {
                self.analyze_frame();
                frames += 1;
            }
        }
        frames
    }

    /// Reads what the ring holds and analyzes every window it completes.
    pub fn pump(&mut self, consumer: &mut SampleConsumer) -> usize {
        let mut frames = 0;
        loop {
            let start = self.filled;
            match consumer.read(&mut self.pcm[start..]) {
                Ok(read) => self.filled += read,
                Err(overrun) => {
                    self.overruns += 1;
                    self.signal(INV_OVERRUN_RECOVERED);
                    warn!("analysis ring overrun, {} samples discarded", overrun.discarded);
                    continue;
                }
            }
            if self.filled < self.pcm.len() {
                return frames;
            }
            self.analyze_frame();
            frames += 1;
        }
    }

    fn analyze_frame(&mut self) {
        let size = self.config.fft_size;
        let overlap = self.config.overlap;
        let fresh = self.config.new_samples_per_fft();
        for (dst, &src) in self.frame.iter_mut().zip(&self.pcm) {
            *dst = f64::from(src) / f64::from(i16::MAX);
        }

        let (offset, length) = if self.first_frame {
            self.first_frame = false;
            (0, size)
        } else {
            (overlap, fresh)
        };
        if let Some(decks) = &self.wave_deck {
            decks.write_wave_data(&self.frame, offset, length);
        }
        self.plot.append(&self.frame[offset..offset + length]);

        let frame = std::mem::take(&mut self.frame);
        let centroid = self.centroid_of(&frame);
        self.frame = frame;
        self.classify(centroid);
        self.fft_count += 1;

        self.pcm.copy_within(fresh.., 0);
        self.filled = overlap;
    }

    fn classify(&mut self, centroid: f64) {
        if self.glitches.is_full() {
            if self.glitches.mark_interval_too_long() {
                warn!(
                    "glitch log full after {} entries, further glitches are not recorded",
                    self.glitches.capacity()
                );
                self.signal(INV_GLITCH_LOG_SATURATED);
            }
            return;
        }
        let difference = (centroid - self.reference_centroid).abs() / self.reference_centroid;
        if difference > ACCEPTABLE_PERCENT_DIFFERENCE || centroid == SILENCE_CENTROID {
            self.glitches.push(self.fft_count);
            self.signal(INV_GLITCH_FLAGGED);
            if self.capture.as_ref().is_some_and(CaptureCache::is_capturing) {
                self.check_glitch_concentration();
            }
        }
    }

    fn check_glitch_concentration(&mut self) {
        let frames = self.glitches.frames();
        let Some(&recorded) = frames.last() else {
            return;
        };
        if recorded.saturating_sub(self.last_capture_attempt) <= CAPTURE_COOLDOWN_FRAMES {
            return;
        }
        let window_begin = recorded.saturating_sub(GLITCH_CONCENTRATION_WINDOW);
        let burst = frames.iter().rev().take_while(|&&f| f >= window_begin).count();
        let Some(capture) = &self.capture else {
            return;
        };
        let status = capture.capture_state(i32::try_from(burst).unwrap_or(i32::MAX));
        debug!("glitch burst of {burst} frames at frame {recorded}: {status:?}");
        if status != CaptureStatus::NewCaptureIsLeastInteresting {
            self.last_capture_attempt = recorded;
        }
    }

    fn signal(&mut self, id: u8) {
        if let Some(tx) = self.signals.as_mut() {
            signal_invariant(tx, id);
        }
    }

    /// Frames flagged so far, in order.
    pub fn glitches(&self) -> Vec<u32> {
        self.glitches.frames().to_vec()
    }

    pub fn glitch_log(&self) -> &GlitchLog {
        &self.glitches
    }

    pub fn interval_too_long(&self) -> bool {
        self.glitches.interval_too_long()
    }

    pub fn fft_count(&self) -> u32 {
        self.fft_count
    }

    pub fn reference_centroid(&self) -> f64 {
        self.reference_centroid
    }

    pub fn plot_snapshot(&self) -> &PlotSnapshot {
        &self.plot
    }

    pub fn overrun_count(&self) -> u64 {
        self.overruns
    }
}

/// The detector running on its own analysis thread.
#[derive(Debug)]
pub struct GlitchDetectionTask {
    handle: JoinHandle<GlitchDetector>,
    stop: StopToken,
}

impl GlitchDetectionTask {
    /// Moves `detector` onto a thread that drains `consumer` until `stop`.
    pub fn spawn(
        mut detector: GlitchDetector,
        mut consumer: SampleConsumer,
        stop: StopToken,
    ) -> io::Result<Self> {
        let token = stop.clone();
        let handle = spawn_named("loopback-glitch-detection", move || {
            let pause = detector.config().sleep_duration();
            while !token.is_stopped() {
                if detector.pump(&mut consumer) == 0 && token.sleep(pause) {
                    break;
                }
            }
            detector
        })?;
        Ok(Self { handle, stop })
    }

    pub fn request_stop(&self) {
        self.stop.stop();
    }

    /// Stops the thread and waits up to `timeout` for the detector.
    pub fn join(self, timeout: Duration) -> Result<GlitchDetector, JoinFailure> {
        self.stop.stop();
        join_with_timeout(self.handle, timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> DetectorConfig {
        DetectorConfig {
            sampling_rate: 8000,
            frequency: 703.0,
            fft_size: 256,
            overlap: 128,
            glitch_log_capacity: 64,
            plot_samples: 1024,
        }
    }

    #[test]
    fn hann_window_tapers_edges() {
        let mut samples = vec![1.0; 9];
        hann_window(&mut samples);
        assert!(samples[0].abs() < 1e-12);
        assert!(samples[8].abs() < 1e-12);
        assert!((samples[4] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn centroid_of_silence_is_sentinel() {
        assert_eq!(spectral_centroid(&[0.0; 16], 10.0), SILENCE_CENTROID);
        assert_eq!(spectral_centroid(&[0.0, 0.0, 2.0, 0.0], 10.0), 20.0);
    }

    #[test]
    fn reference_centroid_near_tone() {
        let detector = GlitchDetector::new(config()).unwrap();
        assert!((detector.reference_centroid() - 703.0).abs() < 40.0);
    }

    #[test]
    fn rejects_bad_fft_size() {
        let mut cfg = config();
        cfg.fft_size = 300;
        assert_eq!(GlitchDetector::new(cfg).unwrap_err(), FftError::NotPowerOfTwo(300));
    }

    #[test]
    fn plot_snapshot_clears_instead_of_wrapping() {
        let mut plot = PlotSnapshot::new(4);
        plot.append(&[1.0, 2.0, 3.0]);
        plot.append(&[4.0, 5.0]);
        assert_eq!(plot.samples(), &[4.0, 5.0, 0.0, 0.0]);
        assert_eq!(plot.index(), 2);
    }

    #[test]
    fn silence_flags_every_frame() {
        let mut detector = GlitchDetector::new(config()).unwrap();
        let frames = detector.push_samples(&vec![0i16; 256 + 128 * 4]);
        assert_eq!(frames, 5);
        assert_eq!(detector.glitches(), vec![0, 1, 2, 3, 4]);
        assert_eq!(detector.fft_count(), 5);
    }

    #[test]
    fn saturated_log_sets_flag_once() {
        let mut cfg = config();
        cfg.glitch_log_capacity = 2;
        let mut detector = GlitchDetector::new(cfg).unwrap();
        detector.push_samples(&vec![0i16; 256 + 128 * 5]);
        assert_eq!(detector.glitches(), vec![0, 1]);
        assert!(detector.interval_too_long());
        assert_eq!(detector.fft_count(), 6);
    }
}
