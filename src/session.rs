//! Test session orchestration.
//!
//! One named thread per role: player, recorder, analysis and optional CPU
//! load. The ring buffers are the only channels between them and a shared
//! [`StopToken`] ends them. The session thread itself polls late-callback
//! capture ranks and drains the RT signal queues until the run is over.

#![forbid(unsafe_code)]

use crate::buffer_period::{BufferPeriodStats, BufferPeriodTracker};
use crate::capture::{CaptureCache, CaptureOptions, CaptureRecord};
use crate::config::{
    ConfigError, TestSettings, JOIN_WAIT_TIME_MS, LATENCY_RECORD_SECONDS, LOOPBACK_FREQUENCY,
    LOOPBACK_INJECT_OFFSET, LOOPBACK_SAMPLE_FRAMES, MAX_SHORTS,
};
use crate::device::{AudioSink, AudioSource};
use crate::fft::FftError;
use crate::glitch::{DetectorConfig, GlitchDetectionTask, GlitchDetector};
use crate::invariant_ppt::{assert_invariant, LATE_LOG_BOUNDED, RING_CAPACITY_POW2};
use crate::invariant_rt::{
    count_invariant_signals, drain_invariant_signals, new_invariant_queue, signal_invariant,
    INV_LATE_CALLBACK_LOGGED, INV_LATE_LOG_SATURATED, INV_OVERRUN_RECOVERED,
    INV_RT_CALLBACK_CLEAN, INV_SAMPLES_FORWARDED,
};
use crate::latency::{LatencyEstimate, LatencyEstimator};
use crate::performance::{PerformanceMeasurement, PerformanceSummary};
use crate::report::{estimate_number_of_glitches, glitches_per_hour};
use crate::ring::{new_sample_ring, ring_capacity, SampleConsumer, SampleProducer};
use crate::task::{join_with_timeout, spawn_named, StopToken};
use crate::tone::ToneGenerator;
use crate::wave_deck::WaveDeckBuffer;
use log::{debug, info, warn};
use rtrb::{Consumer, Producer};
use std::io;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;

/// How often the session thread polls ranks and drains signals.
const MONITOR_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Fft(#[from] FftError),
    #[error("failed to spawn {role} thread: {source}")]
    Spawn {
        role: &'static str,
        #[source]
        source: io::Error,
    },
}

fn spawn_role<F, T>(role: &'static str, f: F) -> Result<JoinHandle<T>, SessionError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    spawn_named(&format!("loopback-{role}"), f)
        .map_err(|source| SessionError::Spawn { role, source })
}

/// Everything a buffer test measured.
#[derive(Debug, Clone)]
pub struct BufferTestResult {
    pub settings: TestSettings,
    pub elapsed: Duration,
    pub recorder: BufferPeriodStats,
    pub player: BufferPeriodStats,
    pub recorder_performance: PerformanceSummary,
    pub player_performance: PerformanceSummary,
    pub glitches: Vec<u32>,
    pub interval_too_long: bool,
    pub fft_count: u32,
    pub reference_centroid: f64,
    pub analysis_overruns: u64,
    /// Oldest-first copy of the wave snapshot at the end of the run.
    pub wave_record: Vec<f64>,
    pub captures: Vec<CaptureRecord>,
    /// Occurrences of each RT signal ID.
    pub signal_counts: Vec<usize>,
}

impl BufferTestResult {
    pub fn estimated_glitches(&self) -> u32 {
        estimate_number_of_glitches(&self.glitches)
    }

    pub fn glitches_per_hour(&self) -> Option<u32> {
        glitches_per_hour(self.estimated_glitches(), self.elapsed)
    }

    pub fn signal_count(&self, id: u8) -> usize {
        self.signal_counts.get(usize::from(id)).copied().unwrap_or(0)
    }
}

/// What a latency test measured.
#[derive(Debug, Clone)]
pub struct LatencyTestResult {
    pub settings: TestSettings,
    /// `None` when the recording held no energy.
    pub estimate: Option<LatencyEstimate>,
    pub waveform: Vec<f64>,
    pub recorder: BufferPeriodStats,
    pub player: BufferPeriodStats,
    /// Occurrences of each RT signal ID.
    pub signal_counts: Vec<usize>,
}

impl LatencyTestResult {
    pub fn signal_count(&self, id: u8) -> usize {
        self.signal_counts.get(usize::from(id)).copied().unwrap_or(0)
    }

    pub fn recorded_samples(&self) -> usize {
        self.waveform.len()
    }

    /// Latency in ms when the estimate is valid.
    pub fn latency_ms(&self) -> Option<f64> {
        self.estimate.filter(LatencyEstimate::is_valid).map(|e| e.latency_ms)
    }
}

/// Spawns `count` busy threads that run until `stop`.
pub fn spawn_load_threads(
    count: usize,
    stop: &StopToken,
) -> Result<Vec<JoinHandle<()>>, SessionError> {
    (0..count)
        .map(|i| {
            let stop = stop.clone();
            spawn_named(&format!("loopback-load-{i}"), move || {
                let mut x: u64 = 0x9E37_79B9_7F4A_7C15;
                while !stop.is_stopped() {
                    for _ in 0..10_000 {
                        x = std::hint::black_box(x.rotate_left(5) ^ x.wrapping_mul(31));
                    }
                }
            })
            .map_err(|source| SessionError::Spawn { role: "load", source })
        })
        .collect()
}

/// One configured test run.
#[derive(Debug)]
pub struct LoopbackSession {
    settings: TestSettings,
    capture: CaptureCache,
    stop: StopToken,
}

impl LoopbackSession {
    pub fn new(settings: TestSettings) -> Result<Self, SessionError> {
        let settings = settings.validate()?;
        let capture = CaptureCache::new(CaptureOptions::from_settings(&settings));
        Ok(Self {
            settings,
            capture,
            stop: StopToken::new(),
        })
    }

    /// Replaces the capture cache built from the settings.
    pub fn with_capture(mut self, capture: CaptureCache) -> Self {
        self.capture = capture;
        self
    }

    pub fn settings(&self) -> &TestSettings {
        &self.settings
    }

    pub fn capture(&self) -> &CaptureCache {
        &self.capture
    }

    /// Token that ends a running test early.
    ///
    /// A stop requested between runs ends the next run. Each run clears the
    /// request when it finishes, so the session stays usable afterwards.
    pub fn stop_token(&self) -> StopToken {
        self.stop.clone()
    }

    fn block_period(&self, frames: usize) -> Duration {
        Duration::from_secs_f64(frames as f64 / f64::from(self.settings.sampling_rate))
    }

    fn analysis_ring(&self) -> (SampleProducer, SampleConsumer) {
        let capacity = ring_capacity(MAX_SHORTS);
        assert_invariant(
            RING_CAPACITY_POW2,
            capacity.is_power_of_two(),
            "analysis ring capacity is a power of two",
            Some("analysis_ring"),
        );
        new_sample_ring(capacity)
    }

    fn trackers(&self) -> (BufferPeriodTracker, BufferPeriodTracker) {
        let capacity = self.settings.late_callback_capacity;
        let recorder =
            BufferPeriodTracker::new(self.settings.expected_recorder_period_ms(), capacity);
        let player = BufferPeriodTracker::new(self.settings.expected_player_period_ms(), capacity)
            .with_full_duplex_partner(recorder.call_counter());
        (recorder, player)
    }

    /// Plays a steady tone, records it back and looks for glitches.
    pub fn run_buffer_test<S, K>(&self, source: S, sink: K) -> Result<BufferTestResult, SessionError>
    where
        S: AudioSource + 'static,
        K: AudioSink + 'static,
    {
        let settings = &self.settings;
        let duration = Duration::from_secs(u64::from(settings.buffer_test_duration_s));
        let join_wait = Duration::from_millis(JOIN_WAIT_TIME_MS);
        info!(
            "buffer test: {} Hz, recorder {} / player {} frames, {} s",
            settings.sampling_rate,
            settings.recorder_buffer_frames,
            settings.player_buffer_frames,
            settings.buffer_test_duration_s
        );

        let decks = WaveDeckBuffer::new(settings.wave_deck_samples(), settings.sampling_rate);
        self.capture.set_wave_deck(decks.clone());

        let (analysis_tx, analysis_rx) = self.analysis_ring();
        let (player_signals, mut player_drain) = new_invariant_queue();
        let (recorder_signals, mut recorder_drain) = new_invariant_queue();
        let (detector_signals, mut detector_drain) = new_invariant_queue();

        let detector = GlitchDetector::new(DetectorConfig::from_settings(settings))?
            .with_wave_deck(decks.clone())
            .with_capture(self.capture.clone())
            .with_signals(detector_signals);

        let (recorder_tracker, player_tracker) = self.trackers();
        let recorder_rank = recorder_tracker.capture_rank();
        let player_rank = player_tracker.capture_rank();

        let run = StopToken::new();
        let load_stop = StopToken::new();
        let loads = spawn_load_threads(settings.num_load_threads, &load_stop)?;
        let started = Instant::now();

        let analysis = GlitchDetectionTask::spawn(detector, analysis_rx, run.clone())
            .map_err(|source| SessionError::Spawn { role: "analysis", source })?;

        let mut tone = ToneGenerator::sine(settings.tone_frequency, settings.sampling_rate);
        tone.set_glitch_enabled(settings.inject_glitches);
        let player = spawn_role(
            "player",
            play_tone(
                sink,
                tone,
                settings.player_buffer_frames,
                self.block_period(settings.player_buffer_frames),
                player_tracker,
                player_signals,
                run.clone(),
            ),
        )?;
        let recorder = spawn_role(
            "recorder",
            record_to_ring(
                source,
                settings.recorder_buffer_frames,
                self.block_period(settings.recorder_buffer_frames),
                recorder_tracker,
                analysis_tx,
                recorder_signals,
                run.clone(),
            ),
        )?;

        let mut signals = Vec::new();
        while started.elapsed() < duration && !self.stop.is_stopped() {
            run.sleep(MONITOR_INTERVAL.min(duration.saturating_sub(started.elapsed())));
            for rank in [recorder_rank.take(), player_rank.take()] {
                if rank > 0 {
                    let status = self.capture.capture_state(rank);
                    debug!("late callback rank {rank}: {status:?}");
                }
            }
            drain_signals(&mut signals, [&mut player_drain, &mut recorder_drain, &mut detector_drain]);
        }
        run.stop();
        load_stop.stop();
        self.stop.reset();
        let elapsed = started.elapsed();

        let recorder_stats = join_stats("recorder", recorder, join_wait, settings);
        let player_stats = join_stats("player", player, join_wait, settings);
        let detector = analysis.join(join_wait).ok();
        for load in loads {
            let _ = join_with_timeout(load, join_wait);
        }
        drain_signals(&mut signals, [&mut player_drain, &mut recorder_drain, &mut detector_drain]);

        if !self.capture.wait_idle(join_wait) {
            warn!("capture still running when the buffer test ended");
        }

        let recorder_performance = PerformanceMeasurement::from_histogram(
            settings.expected_recorder_period_ms(),
            &recorder_stats.histogram,
        )
        .measure();
        let player_performance = PerformanceMeasurement::from_histogram(
            settings.expected_player_period_ms(),
            &player_stats.histogram,
        )
        .measure();

        let (glitches, interval_too_long, fft_count, reference_centroid, analysis_overruns) =
            match &detector {
                Some(d) => (
                    d.glitches(),
                    d.interval_too_long(),
                    d.fft_count(),
                    d.reference_centroid(),
                    d.overrun_count(),
                ),
                None => {
                    warn!("analysis thread did not finish; glitch results are missing");
                    (Vec::new(), false, 0, 0.0, 0)
                }
            };
        info!(
            "buffer test done after {:.1} s: {} glitching frames of {}",
            elapsed.as_secs_f64(),
            glitches.len(),
            fft_count
        );

        Ok(BufferTestResult {
            settings: settings.clone(),
            elapsed,
            recorder: recorder_stats,
            player: player_stats,
            recorder_performance,
            player_performance,
            glitches,
            interval_too_long,
            fft_count,
            reference_centroid,
            analysis_overruns,
            wave_record: decks.get_wave_record(),
            captures: self.capture.records(),
            signal_counts: count_invariant_signals(&signals).to_vec(),
        })
    }

    /// Injects a short ramped tone, records its trip round the loop and
    /// estimates the round-trip latency.
    pub fn run_latency_test<S, K>(&self, source: S, sink: K) -> Result<LatencyTestResult, SessionError>
    where
        S: AudioSource + 'static,
        K: AudioSink + 'static,
    {
        let settings = &self.settings;
        let join_wait = Duration::from_millis(JOIN_WAIT_TIME_MS);
        let target = settings.sampling_rate as usize * LATENCY_RECORD_SECONDS as usize;
        // Recording stalls when the loop starves; give it room but not forever.
        let deadline = Duration::from_secs(u64::from(LATENCY_RECORD_SECONDS) * 3 + 1);
        info!(
            "latency test: {} Hz, recorder {} / player {} frames",
            settings.sampling_rate, settings.recorder_buffer_frames, settings.player_buffer_frames
        );

        let mut probe = vec![0i16; LOOPBACK_SAMPLE_FRAMES];
        ToneGenerator::ramped_sine(LOOPBACK_FREQUENCY, settings.sampling_rate)
            .generate_pcm(&mut probe);

        let (forward_tx, forward_rx) = self.analysis_ring();
        let (recorder_tracker, player_tracker) = self.trackers();
        let (player_signals, mut player_drain) = new_invariant_queue();
        let (recorder_signals, mut recorder_drain) = new_invariant_queue();
        let run = StopToken::new();

        let player = spawn_role(
            "player",
            play_forwarded(
                sink,
                forward_rx,
                settings.player_buffer_frames,
                self.block_period(settings.player_buffer_frames),
                player_tracker,
                player_signals,
                run.clone(),
            ),
        )?;
        let recorder = spawn_role(
            "recorder",
            record_with_probe(
                source,
                probe,
                settings.ignore_first_frames,
                target,
                settings.recorder_buffer_frames,
                self.block_period(settings.recorder_buffer_frames),
                recorder_tracker,
                forward_tx,
                recorder_signals,
                run.clone(),
            ),
        )?;

        let mut signals = Vec::new();
        let started = Instant::now();
        while !recorder.is_finished() && started.elapsed() < deadline && !self.stop.is_stopped() {
            let _ = run.sleep(MONITOR_INTERVAL);
            drain_signals(&mut signals, [&mut player_drain, &mut recorder_drain]);
        }
        run.stop();
        self.stop.reset();

        let (waveform, recorder_stats) = match join_with_timeout(recorder, join_wait) {
            Ok(done) => done,
            Err(failure) => {
                warn!("recorder thread: {failure:?}; no waveform to analyze");
                let stats = BufferPeriodTracker::new(
                    settings.expected_recorder_period_ms(),
                    settings.late_callback_capacity,
                )
                .stats();
                (Vec::new(), stats)
            }
        };
        let player_stats = join_stats("player", player, join_wait, settings);
        drain_signals(&mut signals, [&mut player_drain, &mut recorder_drain]);

        let estimate = LatencyEstimator::from_settings(settings).estimate(&waveform);
        match &estimate {
            Some(e) if e.is_valid() => info!(
                "latency {:.2} ms (confidence {:.2}) from {} samples",
                e.latency_ms,
                e.confidence,
                waveform.len()
            ),
            _ => warn!("latency unknown after recording {} samples", waveform.len()),
        }

        Ok(LatencyTestResult {
            settings: settings.clone(),
            estimate,
            waveform,
            recorder: recorder_stats,
            player: player_stats,
            signal_counts: count_invariant_signals(&signals).to_vec(),
        })
    }
}

/// Moves pending RT signals into `signals`, logging what audio threads could not.
fn drain_signals<const N: usize>(signals: &mut Vec<u8>, drains: [&mut Consumer<u8>; N]) {
    for drain in drains {
        let drained = drain_invariant_signals(drain);
        let overruns = drained.iter().filter(|&&id| id == INV_OVERRUN_RECOVERED).count();
        if overruns > 0 {
            debug!("player fell behind the forwarded samples {overruns} times");
        }
        signals.extend(drained);
    }
}

/// Joins a player or recorder. A thread that doesn't finish yields empty stats.
fn join_stats(
    role: &str,
    handle: JoinHandle<BufferPeriodStats>,
    timeout: Duration,
    settings: &TestSettings,
) -> BufferPeriodStats {
    match join_with_timeout(handle, timeout) {
        Ok(stats) => {
            assert_invariant(
                LATE_LOG_BOUNDED,
                stats.late_callbacks.len() <= stats.late_callbacks.capacity(),
                "late-callback log stays within capacity",
                Some(role),
            );
            stats
        }
        Err(failure) => {
            warn!("{role} thread: {failure:?}; its buffer periods are missing");
            let expected_ms = if role == "player" {
                settings.expected_player_period_ms()
            } else {
                settings.expected_recorder_period_ms()
            };
            BufferPeriodTracker::new(expected_ms, settings.late_callback_capacity).stats()
        }
    }
}

/// Records the call and reports what the late-callback log did with it.
fn collect_and_signal(tracker: &mut BufferPeriodTracker, signals: &mut Producer<u8>) {
    let logged = tracker.late_callbacks().len();
    let saturated = tracker.late_callbacks().capacity_exceeded();
    tracker.collect();
    if tracker.late_callbacks().len() > logged {
        signal_invariant(signals, INV_LATE_CALLBACK_LOGGED);
    }
    if !saturated && tracker.late_callbacks().capacity_exceeded() {
        signal_invariant(signals, INV_LATE_LOG_SATURATED);
    }
}

fn play_tone<K: AudioSink>(
    mut sink: K,
    mut tone: ToneGenerator,
    frames: usize,
    period: Duration,
    mut tracker: BufferPeriodTracker,
    mut signals: Producer<u8>,
    run: StopToken,
) -> impl FnOnce() -> BufferPeriodStats + Send
where
    K: 'static,
{
    move || {
        let mut block = vec![0i16; frames];
        while !run.is_stopped() {
            tone.generate_pcm(&mut block);
            if sink.write(&block) == block.len() {
                signal_invariant(&mut signals, INV_RT_CALLBACK_CLEAN);
            }
            collect_and_signal(&mut tracker, &mut signals);
            if run.sleep(period) {
                break;
            }
        }
        tracker.stats()
    }
}

fn record_to_ring<S: AudioSource>(
    mut source: S,
    frames: usize,
    period: Duration,
    mut tracker: BufferPeriodTracker,
    mut analysis: SampleProducer,
    mut signals: Producer<u8>,
    run: StopToken,
) -> impl FnOnce() -> BufferPeriodStats + Send
where
    S: 'static,
{
    move || {
        let mut block = vec![0i16; frames];
        while !run.is_stopped() {
            let read = source.read(&mut block);
            if read > 0 {
                analysis.write(&block[..read]);
                signal_invariant(&mut signals, INV_SAMPLES_FORWARDED);
            }
            if read == block.len() {
                signal_invariant(&mut signals, INV_RT_CALLBACK_CLEAN);
            }
            collect_and_signal(&mut tracker, &mut signals);
            if run.sleep(period) {
                break;
            }
        }
        tracker.stats()
    }
}

fn play_forwarded<K: AudioSink>(
    mut sink: K,
    mut forwarded: SampleConsumer,
    frames: usize,
    period: Duration,
    mut tracker: BufferPeriodTracker,
    mut signals: Producer<u8>,
    run: StopToken,
) -> impl FnOnce() -> BufferPeriodStats + Send
where
    K: 'static,
{
    move || {
        let mut block = vec![0i16; frames];
        while !run.is_stopped() {
            // Drain whatever the recorder forwarded so the loop never falls behind.
            loop {
                match forwarded.read(&mut block) {
                    Ok(0) => break,
                    Ok(read) => {
                        sink.write(&block[..read]);
                    }
                    Err(_) => signal_invariant(&mut signals, INV_OVERRUN_RECOVERED),
                }
            }
            collect_and_signal(&mut tracker, &mut signals);
            if run.sleep(period) {
                break;
            }
        }
        tracker.stats()
    }
}

#[allow(clippy::too_many_arguments)]
fn record_with_probe<S: AudioSource>(
    mut source: S,
    probe: Vec<i16>,
    ignore_first_frames: usize,
    target: usize,
    frames: usize,
    period: Duration,
    mut tracker: BufferPeriodTracker,
    mut forward: SampleProducer,
    mut signals: Producer<u8>,
    run: StopToken,
) -> impl FnOnce() -> (Vec<f64>, BufferPeriodStats) + Send
where
    S: 'static,
{
    move || {
        let mut block = vec![0i16; frames];
        let mut waveform = Vec::with_capacity(target);
        let mut seen = 0usize;
        let probe_start = ignore_first_frames + LOOPBACK_INJECT_OFFSET;
        while !run.is_stopped() && waveform.len() < target {
            let read = source.read(&mut block);
            let chunk = &mut block[..read];
            inject_at(chunk, seen, &probe, probe_start);
            seen += read;

            let room = target - waveform.len();
            waveform.extend(chunk.iter().take(room).map(|&s| f64::from(s) / f64::from(i16::MAX)));
            forward.write(chunk);
            if read > 0 {
                signal_invariant(&mut signals, INV_SAMPLES_FORWARDED);
            }
            collect_and_signal(&mut tracker, &mut signals);
            if run.sleep(period) {
                break;
            }
        }
        (waveform, tracker.stats())
    }
}

/// Overwrites the part of `chunk` that overlaps the probe.
///
/// `chunk` starts at stream sample `chunk_start`, the probe at `probe_start`.
fn inject_at(chunk: &mut [i16], chunk_start: usize, probe: &[i16], probe_start: usize) {
    let chunk_end = chunk_start + chunk.len();
    let probe_end = probe_start + probe.len();
    let from = chunk_start.max(probe_start);
    let to = chunk_end.min(probe_end);
    if from < to {
        chunk[from - chunk_start..to - chunk_start]
            .copy_from_slice(&probe[from - probe_start..to - probe_start]);
    }
}
