//! Deterministic test tones.
//!
//! A closed set of generators behind one interface. Generation never
//! allocates, so it can run inside an audio callback.

#![forbid(unsafe_code)]

use std::f64::consts::TAU;

/// Amplitude of the plain sine tone.
pub const SINE_WAVE_AMPLITUDE: f64 = 0.8;
/// Amplitude of each component of the two-sine tone.
pub const TWO_SINE_WAVES_AMPLITUDE: f64 = 0.4;
/// Peak amplitude of the ramped latency probe.
pub const LOOPBACK_AMPLITUDE: f64 = 0.95;

/// Which waveform a [`ToneGenerator`] produces.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ToneKind {
    /// Continuous sine.
    Sine { frequency: f64 },
    /// Sine under a triangular envelope spanning each generated block.
    RampedSine { frequency: f64 },
    /// Two summed sines.
    TwoSine { frequency1: f64, frequency2: f64 },
}

/// Stateful tone generator with phase tracking across calls.
#[derive(Debug, Clone)]
pub struct ToneGenerator {
    kind: ToneKind,
    sampling_rate: u32,
    amplitude: f64,
    increments: [f64; 2],
    phases: [f64; 2],
    count: u64,
    glitch_enabled: bool,
}

impl ToneGenerator {
    /// Creates a generator with the default amplitude for `kind`.
    pub fn new(kind: ToneKind, sampling_rate: u32) -> Self {
        let rate = f64::from(sampling_rate.max(1));
        let (amplitude, increments) = match kind {
            ToneKind::Sine { frequency } => (SINE_WAVE_AMPLITUDE, [TAU * frequency / rate, 0.0]),
            ToneKind::RampedSine { frequency } => {
                (LOOPBACK_AMPLITUDE, [TAU * frequency / rate, 0.0])
            }
            ToneKind::TwoSine {
                frequency1,
                frequency2,
            } => (
                TWO_SINE_WAVES_AMPLITUDE,
                [TAU * frequency1 / rate, TAU * frequency2 / rate],
            ),
        };
        Self {
            kind,
            sampling_rate: sampling_rate.max(1),
            amplitude,
            increments,
            phases: [0.0; 2],
            count: 0,
            glitch_enabled: false,
        }
    }

    /// Plain sine at `frequency`.
    pub fn sine(frequency: f64, sampling_rate: u32) -> Self {
        Self::new(ToneKind::Sine { frequency }, sampling_rate)
    }

    /// Ramped sine at `frequency`, the latency probe shape.
    pub fn ramped_sine(frequency: f64, sampling_rate: u32) -> Self {
        Self::new(ToneKind::RampedSine { frequency }, sampling_rate)
    }

    pub fn kind(&self) -> ToneKind {
        self.kind
    }

    pub fn amplitude(&self) -> f64 {
        self.amplitude
    }

    /// Overrides the amplitude (0.0 to 1.0).
    pub fn set_amplitude(&mut self, amplitude: f64) {
        self.amplitude = amplitude.clamp(0.0, 1.0);
    }

    /// When enabled, the phase skips one extra increment once per second.
    pub fn set_glitch_enabled(&mut self, enabled: bool) {
        self.glitch_enabled = enabled;
    }

    pub fn reset_phases(&mut self) {
        self.phases = [0.0; 2];
    }

    /// Fills `out` with unit-scale samples.
    pub fn generate(&mut self, out: &mut [f64]) {
        for sample in out.iter_mut() {
            *sample = self.next_raw();
        }
        if matches!(self.kind, ToneKind::RampedSine { .. }) {
            apply_ramp(out);
        }
    }

    /// Fills `out` with 16-bit PCM samples.
    pub fn generate_pcm(&mut self, out: &mut [i16]) {
        let len = out.len();
        let ramped = matches!(self.kind, ToneKind::RampedSine { .. });
        for (i, sample) in out.iter_mut().enumerate() {
            let mut value = self.next_raw();
            if ramped {
                value *= ramp_factor(i, len);
            }
            *sample = (value * f64::from(i16::MAX)) as i16;
        }
    }

    fn next_raw(&mut self) -> f64 {
        let value = match self.kind {
            ToneKind::TwoSine { .. } => {
                self.amplitude * self.phases[0].sin() + self.amplitude * self.phases[1].sin()
            }
            _ => self.amplitude * self.phases[0].sin(),
        };
        let skip = self.glitch_enabled && self.count % u64::from(self.sampling_rate) == 0;
        for (phase, &inc) in self.phases.iter_mut().zip(&self.increments) {
            *phase += inc;
            if skip {
                *phase += inc;
            }
            if *phase >= TAU {
                *phase -= TAU;
            }
        }
        self.count += 1;
        value
    }
}

/// Triangular envelope: rises over the first half of the block, falls over the second.
fn ramp_factor(i: usize, len: usize) -> f64 {
    if len == 0 {
        return 0.0;
    }
    if i < len / 2 {
        2.0 * i as f64 / len as f64
    } else {
        2.0 * (len - i) as f64 / len as f64
    }
}

fn apply_ramp(out: &mut [f64]) {
    let len = out.len();
    for (i, sample) in out.iter_mut().enumerate() {
        *sample *= ramp_factor(i, len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sine_starts_at_zero_and_stays_in_amplitude() {
        let mut tone = ToneGenerator::sine(703.0, 48000);
        let mut out = vec![0.0; 4800];
        tone.generate(&mut out);
        assert_eq!(out[0], 0.0);
        assert!(out[1] > 0.0);
        assert!(out.iter().all(|x| x.abs() <= SINE_WAVE_AMPLITUDE + 1e-12));
    }

    #[test]
    fn phase_continues_across_blocks() {
        let mut whole = ToneGenerator::sine(440.0, 44100);
        let mut split = ToneGenerator::sine(440.0, 44100);
        let mut a = vec![0.0; 256];
        whole.generate(&mut a);
        let mut b = vec![0.0; 128];
        let mut c = vec![0.0; 128];
        split.generate(&mut b);
        split.generate(&mut c);
        b.extend_from_slice(&c);
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-12);
        }
    }

    #[test]
    fn pcm_matches_unit_scale() {
        let mut unit = ToneGenerator::sine(1000.0, 48000);
        let mut pcm = ToneGenerator::sine(1000.0, 48000);
        let mut a = vec![0.0; 64];
        let mut b = vec![0i16; 64];
        unit.generate(&mut a);
        pcm.generate_pcm(&mut b);
        for (x, &y) in a.iter().zip(&b) {
            assert_eq!((x * 32767.0) as i16, y);
        }
    }

    #[test]
    fn ramp_is_silent_at_edges_and_loud_in_middle() {
        let mut tone = ToneGenerator::ramped_sine(4000.0, 48000);
        let mut out = vec![0i16; 300];
        tone.generate_pcm(&mut out);
        assert_eq!(out[0], 0);
        let edge = out[..10].iter().map(|s| s.unsigned_abs()).max().unwrap();
        let middle = out[140..160].iter().map(|s| s.unsigned_abs()).max().unwrap();
        assert!(middle > 20000, "middle peak {middle}");
        assert!(edge < middle / 5);
    }

    #[test]
    fn two_sine_peak_bounded() {
        let mut tone = ToneGenerator::new(
            ToneKind::TwoSine {
                frequency1: 703.0,
                frequency2: 719.0,
            },
            48000,
        );
        let mut out = vec![0.0; 48000];
        tone.generate(&mut out);
        assert!(out.iter().all(|x| x.abs() <= 0.8 + 1e-12));
        assert!(out.iter().any(|x| x.abs() > 0.7));
    }

    #[test]
    fn glitch_injection_skips_phase_once_per_second() {
        let mut clean = ToneGenerator::sine(703.0, 8000);
        let mut glitchy = ToneGenerator::sine(703.0, 8000);
        glitchy.set_glitch_enabled(true);
        let mut a = vec![0.0; 8];
        let mut b = vec![0.0; 8];
        clean.generate(&mut a);
        glitchy.generate(&mut b);
        assert_eq!(a[0], b[0]);
        assert!((a[1] - b[1]).abs() > 1e-3);
    }

    #[test]
    fn reset_phases_restarts_waveform() {
        let mut tone = ToneGenerator::sine(703.0, 48000);
        let mut first = vec![0.0; 32];
        tone.generate(&mut first);
        tone.reset_phases();
        let mut again = vec![0.0; 32];
        tone.generate(&mut again);
        assert_eq!(first, again);
    }
}
