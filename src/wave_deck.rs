//! Double-buffered waveform snapshot for capture export.
//!
//! The analysis thread appends to the *loaded* deck. A capture swaps the decks,
//! takes the frozen one away for export and hands it back when done. While a
//! frozen deck is out, further swap requests get `None` instead of waiting.

#![forbid(unsafe_code)]

use crate::invariant_ppt::{assert_invariant, DECK_EXCLUSIVE};
use std::fs;
use std::mem;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// Fixed-length circular sample store.
#[derive(Debug, Clone)]
pub struct WaveDeck {
    samples: Vec<f64>,
    index: usize,
    full: bool,
}

impl WaveDeck {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: vec![0.0; capacity.max(1)],
            index: 0,
            full: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.samples.len()
    }

    /// True once the deck has wrapped. Stays set until `clear`.
    pub fn is_full(&self) -> bool {
        self.full
    }

    /// Samples held: the capacity once full, otherwise the write index.
    pub fn len(&self) -> usize {
        if self.full {
            self.samples.len()
        } else {
            self.index
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends `data`, overwriting the oldest samples once the deck wraps.
    pub fn write(&mut self, data: &[f64]) {
        let capacity = self.samples.len();
        let len = data.len();
        if len >= capacity {
            self.samples.copy_from_slice(&data[len - capacity..]);
            self.index = 0;
            self.full = true;
        } else if capacity - self.index > len {
            self.samples[self.index..self.index + len].copy_from_slice(data);
            self.index += len;
        } else {
            let head = capacity - self.index;
            self.samples[self.index..].copy_from_slice(&data[..head]);
            self.samples[..len - head].copy_from_slice(&data[head..]);
            self.index = len - head;
            self.full = true;
        }
    }

    /// Oldest-first copy at full capacity, zero-padded while not yet full.
    pub fn record(&self) -> Vec<f64> {
        let mut out = vec![0.0; self.samples.len()];
        if self.full {
            let tail = self.samples.len() - self.index;
            out[..tail].copy_from_slice(&self.samples[self.index..]);
            out[tail..].copy_from_slice(&self.samples[..self.index]);
        } else {
            out[..self.index].copy_from_slice(&self.samples[..self.index]);
        }
        out
    }

    /// Oldest-first samples actually written, no padding.
    pub fn filled(&self) -> Vec<f64> {
        let mut out = self.record();
        out.truncate(self.len());
        out
    }

    pub fn clear(&mut self) {
        self.samples.fill(0.0);
        self.index = 0;
        self.full = false;
    }
}

#[derive(Debug)]
struct DeckPair {
    loaded: WaveDeck,
    /// `None` while a reader holds the frozen deck.
    shelved: Option<WaveDeck>,
}

/// Loaded/shelved deck pair shared by the analysis thread and the capture worker.
#[derive(Debug, Clone)]
pub struct WaveDeckBuffer {
    decks: Arc<Mutex<DeckPair>>,
    sampling_rate: u32,
}

fn lock(decks: &Mutex<DeckPair>) -> MutexGuard<'_, DeckPair> {
    decks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl WaveDeckBuffer {
    /// Two decks of `capacity` samples each.
    pub fn new(capacity: usize, sampling_rate: u32) -> Self {
        Self {
            decks: Arc::new(Mutex::new(DeckPair {
                loaded: WaveDeck::new(capacity),
                shelved: Some(WaveDeck::new(capacity)),
            })),
            sampling_rate,
        }
    }

    pub fn sampling_rate(&self) -> u32 {
        self.sampling_rate
    }

    /// Appends `data[offset..offset + length]` to the loaded deck.
    ///
    /// A request reaching past the end of `data` is ignored and returns `false`.
    pub fn write_wave_data(&self, data: &[f64], offset: usize, length: usize) -> bool {
        if offset > data.len() || length > data.len() - offset {
            return false;
        }
        lock(&self.decks).loaded.write(&data[offset..offset + length]);
        true
    }

    /// Oldest-first copy of the loaded deck.
    pub fn get_wave_record(&self) -> Vec<f64> {
        lock(&self.decks).loaded.record()
    }

    /// Freezes the loaded deck and hands it out for export.
    ///
    /// Returns `None` if the previously frozen deck is still out.
    pub fn get_wave_deck(&self) -> Option<ReadableWaveDeck> {
        let mut pair = lock(&self.decks);
        let mut fresh = pair.shelved.take()?;
        fresh.clear();
        let frozen = mem::replace(&mut pair.loaded, fresh);
        assert_invariant(
            DECK_EXCLUSIVE,
            pair.shelved.is_none(),
            "frozen deck is out exactly once",
            Some("get_wave_deck"),
        );
        Some(ReadableWaveDeck {
            deck: Some(frozen),
            decks: Arc::clone(&self.decks),
            sampling_rate: self.sampling_rate,
        })
    }
}

/// Exclusive handle on a frozen deck. Returns the deck to the shelf on drop.
#[derive(Debug)]
pub struct ReadableWaveDeck {
    deck: Option<WaveDeck>,
    decks: Arc<Mutex<DeckPair>>,
    sampling_rate: u32,
}

impl ReadableWaveDeck {
    pub fn deck(&self) -> Option<&WaveDeck> {
        self.deck.as_ref()
    }

    /// Oldest-first samples the frozen deck holds.
    pub fn samples(&self) -> Vec<f64> {
        self.deck.as_ref().map(WaveDeck::filled).unwrap_or_default()
    }

    /// Writes the frozen samples as 16-bit mono PCM and releases the deck.
    ///
    /// A failed export leaves no partial file behind.
    pub fn write_to_file(self, path: &Path) -> Result<(), hound::Error> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: self.sampling_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec)?;
        let written = self
            .samples()
            .into_iter()
            .try_for_each(|sample| writer.write_sample(to_pcm(sample)))
            .and_then(|()| writer.finalize());
        remove_on_error(path, written)
    }
}

impl Drop for ReadableWaveDeck {
    fn drop(&mut self) {
        if let Some(deck) = self.deck.take() {
            lock(&self.decks).shelved = Some(deck);
        }
    }
}

/// Deletes `path` when `result` failed, so no truncated export survives.
fn remove_on_error<T, E>(path: &Path, result: Result<T, E>) -> Result<T, E> {
    if result.is_err() {
        let _ = fs::remove_file(path);
    }
    result
}

fn to_pcm(sample: f64) -> i16 {
    (sample * f64::from(i16::MAX))
        .round()
        .clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(range: std::ops::Range<i32>) -> Vec<f64> {
        range.map(f64::from).collect()
    }

    #[test]
    fn partial_deck_pads_with_zeros() {
        let mut deck = WaveDeck::new(8);
        deck.write(&ramp(1..4));
        assert_eq!(deck.record(), vec![1.0, 2.0, 3.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        assert_eq!(deck.filled(), vec![1.0, 2.0, 3.0]);
        assert!(!deck.is_full());
    }

    #[test]
    fn wrap_keeps_oldest_first_without_gaps() {
        let mut deck = WaveDeck::new(8);
        for chunk in ramp(0..21).chunks(3) {
            deck.write(chunk);
        }
        assert!(deck.is_full());
        assert_eq!(deck.record(), ramp(13..21));
    }

    #[test]
    fn exact_fit_marks_full() {
        let mut deck = WaveDeck::new(4);
        deck.write(&ramp(0..2));
        deck.write(&ramp(2..4));
        assert!(deck.is_full());
        assert_eq!(deck.record(), ramp(0..4));
    }

    #[test]
    fn oversized_write_keeps_tail_and_marks_full() {
        let mut deck = WaveDeck::new(4);
        deck.write(&ramp(0..10));
        assert!(deck.is_full());
        assert_eq!(deck.record(), ramp(6..10));
        deck.write(&[42.0]);
        assert_eq!(deck.record(), vec![7.0, 8.0, 9.0, 42.0]);
    }

    #[test]
    fn out_of_range_request_is_ignored() {
        let buffer = WaveDeckBuffer::new(8, 8000);
        let data = ramp(0..4);
        assert!(!buffer.write_wave_data(&data, 2, 3));
        assert!(!buffer.write_wave_data(&data, 5, 0));
        assert!(buffer.write_wave_data(&data, 1, 3));
        assert_eq!(&buffer.get_wave_record()[..3], &[1.0, 2.0, 3.0]);
    }

    #[test]
    fn swap_freezes_and_blocks_second_reader() {
        let buffer = WaveDeckBuffer::new(4, 8000);
        buffer.write_wave_data(&ramp(0..3), 0, 3);
        let frozen = buffer.get_wave_deck().unwrap();
        assert_eq!(frozen.samples(), ramp(0..3));
        assert!(buffer.get_wave_deck().is_none());

        // Writes go to the fresh deck meanwhile.
        buffer.write_wave_data(&[9.0], 0, 1);
        assert_eq!(buffer.get_wave_record(), vec![9.0, 0.0, 0.0, 0.0]);

        drop(frozen);
        let again = buffer.get_wave_deck().unwrap();
        assert_eq!(again.samples(), vec![9.0]);
        drop(again);
        assert!(buffer.get_wave_record().iter().all(|&x| x == 0.0));
    }

    #[test]
    fn exports_sixteen_bit_wav() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deck.wav");
        let buffer = WaveDeckBuffer::new(16, 8000);
        buffer.write_wave_data(&[0.0, 0.5, -1.0, 1.0], 0, 4);
        buffer.get_wave_deck().unwrap().write_to_file(&path).unwrap();

        let mut reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().sample_rate, 8000);
        assert_eq!(reader.spec().bits_per_sample, 16);
        let samples: Vec<i16> = reader.samples::<i16>().map(Result::unwrap).collect();
        assert_eq!(samples, vec![0, 16384, -32767, 32767]);
        // Released after export.
        assert!(buffer.get_wave_deck().is_some());
    }

    #[test]
    fn failed_export_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.wav");
        fs::write(&path, b"RIFF").unwrap();

        let failed: Result<(), hound::Error> = Err(hound::Error::Unsupported);
        assert!(remove_on_error(&path, failed).is_err());
        assert!(!path.exists());

        fs::write(&path, b"RIFF").unwrap();
        assert!(remove_on_error(&path, Ok::<(), hound::Error>(())).is_ok());
        assert!(path.exists());
    }
}
