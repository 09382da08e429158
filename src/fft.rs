//! Fixed-size radix-2 decimation-in-time FFT with precomputed twiddle tables.

#![forbid(unsafe_code)]

use crate::invariant_ppt::{assert_invariant, FFT_SIZE_POW2};
use std::f64::consts::PI;
use thiserror::Error;

/// FFT construction errors.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum FftError {
    #[error("FFT size {0} is not a power of two")]
    NotPowerOfTwo(usize),
}

/// Transform direction. Neither direction scales its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Kernel `e^(-2πi·nk/N)`.
    Forward,
    /// Kernel `e^(+2πi·nk/N)`.
    Inverse,
}

impl Direction {
    fn sign(self) -> f64 {
        match self {
            Direction::Forward => 1.0,
            Direction::Inverse => -1.0,
        }
    }
}

/// Complex FFT over split real/imaginary buffers.
#[derive(Debug, Clone)]
pub struct Fft {
    size: usize,
    stages: u32,
    cos: Vec<f64>,
    sin: Vec<f64>,
}

impl Fft {
    /// Builds the twiddle tables for a transform of `size` points.
    pub fn new(size: usize) -> Result<Self, FftError> {
        if size < 2 || !size.is_power_of_two() {
            return Err(FftError::NotPowerOfTwo(size));
        }
        assert_invariant(FFT_SIZE_POW2, size.is_power_of_two(), "FFT size is a power of two", None);
        let half = size / 2;
        let (cos, sin) = (0..half)
            .map(|i| {
                let angle = -2.0 * PI * i as f64 / size as f64;
                (angle.cos(), angle.sin())
            })
            .unzip();
        Ok(Self {
            size,
            stages: size.trailing_zeros(),
            cos,
            sin,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Transforms in place. Both slices must hold exactly `size()` values.
    pub fn transform(&self, re: &mut [f64], im: &mut [f64], direction: Direction) {
        let n = self.size;
        assert!(re.len() == n && im.len() == n, "buffers must match FFT size");
        let sign = direction.sign();

        // Bit-reversal permutation.
        let mut j = 0usize;
        for i in 1..n - 1 {
            let mut bit = n / 2;
            while j >= bit {
                j -= bit;
                bit /= 2;
            }
            j += bit;
            if i < j {
                re.swap(i, j);
                im.swap(i, j);
            }
        }

        let mut span = 1usize;
        for stage in 0..self.stages {
            let step = span * 2;
            let stride = 1usize << (self.stages - stage - 1);
            for offset in 0..span {
                let c = self.cos[offset * stride];
                let s = sign * self.sin[offset * stride];
                let mut k = offset;
                while k < n {
                    let t1 = c * re[k + span] - s * im[k + span];
                    let t2 = s * re[k + span] + c * im[k + span];
                    re[k + span] = re[k] - t1;
                    im[k + span] = im[k] - t2;
                    re[k] += t1;
                    im[k] += t2;
                    k += step;
                }
            }
            span = step;
        }
    }

    /// Forward transform of `re` (imaginary part zeroed first), then
    /// magnitudes of the first half of the spectrum written to `magnitudes`.
    pub fn magnitude_spectrum(&self, re: &mut [f64], im: &mut [f64], magnitudes: &mut [f64]) {
        im.fill(0.0);
        self.transform(re, im, Direction::Forward);
        for (i, mag) in magnitudes.iter_mut().take(self.size / 2).enumerate() {
            *mag = re[i].hypot(im[i]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_power_of_two() {
        assert_eq!(Fft::new(1000).unwrap_err(), FftError::NotPowerOfTwo(1000));
        assert_eq!(Fft::new(0).unwrap_err(), FftError::NotPowerOfTwo(0));
        assert!(Fft::new(1024).is_ok());
    }

    #[test]
    fn impulse_is_flat() {
        let fft = Fft::new(8).unwrap();
        let mut re = vec![1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0];
        let mut im = vec![0.0; 8];
        fft.transform(&mut re, &mut im, Direction::Forward);
        for k in 0..8 {
            assert!((re[k] - 1.0).abs() < 1e-12);
            assert!(im[k].abs() < 1e-12);
        }
    }

    #[test]
    fn forward_uses_negative_exponent() {
        // e^{+2πi n/N} lands entirely in bin 1 under a forward transform.
        let n = 16;
        let fft = Fft::new(n).unwrap();
        let mut re: Vec<f64> = (0..n).map(|i| (2.0 * PI * i as f64 / n as f64).cos()).collect();
        let mut im: Vec<f64> = (0..n).map(|i| (2.0 * PI * i as f64 / n as f64).sin()).collect();
        fft.transform(&mut re, &mut im, Direction::Forward);
        assert!((re[1] - n as f64).abs() < 1e-9);
        for k in (0..n).filter(|&k| k != 1) {
            assert!(re[k].hypot(im[k]) < 1e-9, "leak at bin {k}");
        }
    }

    #[test]
    fn magnitude_spectrum_peaks_at_tone_bin() {
        let n = 256;
        let fft = Fft::new(n).unwrap();
        let mut re: Vec<f64> = (0..n).map(|i| (2.0 * PI * 10.0 * i as f64 / n as f64).sin()).collect();
        let mut im = vec![0.0; n];
        let mut mags = vec![0.0; n / 2];
        fft.magnitude_spectrum(&mut re, &mut im, &mut mags);
        let peak = mags
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(peak, 10);
        assert!((mags[10] - n as f64 / 2.0).abs() < 1e-6);
    }
}
