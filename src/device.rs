//! Audio driver boundary and an in-process loopback for tests and demos.

#![forbid(unsafe_code)]

use crate::buffer_period::{BufferPeriodHistogram, BufferPeriodStats};
use crate::callback_times::LateCallbackLog;
use crate::config::NANOS_PER_MILLI;
use crate::ring::{new_sample_ring, SampleConsumer, SampleProducer};

/// Capture side of an audio device.
pub trait AudioSource: Send {
    /// Fills up to `out.len()` samples and returns how many were written.
    fn read(&mut self, out: &mut [i16]) -> usize;
}

/// Playback side of an audio device.
pub trait AudioSink: Send {
    /// Queues `data` for playback and returns how many samples were accepted.
    fn write(&mut self, data: &[i16]) -> usize;
}

/// Timing results a native driver collected on its own callback thread.
pub type NativeBufferStats = BufferPeriodStats;

/// Packs driver-supplied arrays into the common stats shape.
pub fn native_buffer_stats(
    counts: &[u32],
    max_ms: u32,
    std_dev_ms: f64,
    late_callbacks: LateCallbackLog,
) -> NativeBufferStats {
    let std_dev_ns = std_dev_ms * NANOS_PER_MILLI as f64;
    BufferPeriodStats {
        histogram: BufferPeriodHistogram::from_counts(counts, max_ms),
        variance_ns2: std_dev_ns * std_dev_ns,
        late_callbacks,
    }
}

/// Loopback path behavior.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoopbackParams {
    /// Silent samples the source produces before played audio comes back.
    pub delay_samples: usize,
    pub gain: f64,
    /// Zero every n-th block the source returns.
    pub dropout_every: Option<u32>,
    /// Samples the path can hold before the oldest are lost.
    pub capacity: usize,
}

impl Default for LoopbackParams {
    fn default() -> Self {
        Self {
            delay_samples: 0,
            gain: 1.0,
            dropout_every: None,
            capacity: 1 << 16,
        }
    }
}

/// Sink and source joined by a sample ring.
pub struct SimulatedLoopback;

impl SimulatedLoopback {
    pub fn pair(params: LoopbackParams) -> (LoopbackSink, LoopbackSource) {
        let (tx, rx) = new_sample_ring(params.capacity);
        (
            LoopbackSink { tx },
            LoopbackSource {
                rx,
                delay_remaining: params.delay_samples,
                gain: params.gain,
                dropout_every: params.dropout_every.filter(|&n| n > 0),
                blocks: 0,
            },
        )
    }
}

pub struct LoopbackSink {
    tx: SampleProducer,
}

impl AudioSink for LoopbackSink {
    fn write(&mut self, data: &[i16]) -> usize {
        self.tx.write(data)
    }
}

pub struct LoopbackSource {
    rx: SampleConsumer,
    delay_remaining: usize,
    gain: f64,
    dropout_every: Option<u32>,
    blocks: u64,
}

impl LoopbackSource {
    /// Times the path dropped samples because nobody read them.
    pub fn overrun_count(&self) -> u64 {
        self.rx.overrun_count()
    }
}

impl AudioSource for LoopbackSource {
    fn read(&mut self, out: &mut [i16]) -> usize {
        let silent = self.delay_remaining.min(out.len());
        out[..silent].fill(0);
        self.delay_remaining -= silent;

        // An overrun already resynchronized the ring; the next read catches up.
        let played = self.rx.read(&mut out[silent..]).unwrap_or(0);
        let len = silent + played;
        if self.gain != 1.0 {
            for sample in &mut out[silent..len] {
                *sample = (f64::from(*sample) * self.gain)
                    .clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16;
            }
        }

        if len > 0 {
            self.blocks += 1;
            if let Some(every) = self.dropout_every {
                if self.blocks % u64::from(every) == 0 {
                    out[..len].fill(0);
                }
            }
        }
        len
    }
}
