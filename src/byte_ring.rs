//! Byte-addressable variant of the sample ring for sharing with native code.
//!
//! Samples are stored as little-endian `i16` pairs packed into 32-bit words.
//! The word after the data region holds the rear cursor, so a peer that only
//! sees the raw bytes can follow the producer. Every access to that word goes
//! through [`ByteRingShared::load_rear`] or [`ByteRingShared::store_rear`].
//!
//! Overrun recovery discards `capacity / 32` samples beyond the surplus.

#![forbid(unsafe_code)]

use crate::ring::{ring_capacity, Overrun};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Bytes taken by the rear-cursor metadata word.
pub const REAR_METADATA_BYTES: usize = 4;

/// Storage shared by both ends.
pub struct ByteRingShared {
    words: Box<[AtomicU32]>,
    capacity: u32,
}

impl ByteRingShared {
    #[inline]
    fn load_rear(&self) -> u32 {
        self.words[self.words.len() - 1].load(Ordering::Acquire)
    }

    #[inline]
    fn store_rear(&self, rear: u32) {
        self.words[self.words.len() - 1].store(rear, Ordering::Release);
    }

    #[inline]
    fn mask(&self) -> u32 {
        self.capacity - 1
    }

    fn sample(&self, index: u32) -> i16 {
        let index = (index & self.mask()) as usize;
        let word = self.words[index / 2].load(Ordering::Relaxed);
        let half = if index % 2 == 0 { word } else { word >> 16 };
        half as u16 as i16
    }

    /// Single writer: a plain load-modify-store cannot race another store.
    fn set_sample(&self, index: u32, value: i16) {
        let index = (index & self.mask()) as usize;
        let slot = &self.words[index / 2];
        let word = slot.load(Ordering::Relaxed);
        let bits = u32::from(value as u16);
        let word = if index % 2 == 0 {
            (word & 0xFFFF_0000) | bits
        } else {
            (word & 0x0000_FFFF) | (bits << 16)
        };
        slot.store(word, Ordering::Relaxed);
    }

    /// Raw image: sample data as little-endian `i16`, then the rear cursor as
    /// a little-endian `u32`.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.words.len() * 4);
        let (data, _) = self.words.split_at(self.words.len() - 1);
        for word in data {
            bytes.extend_from_slice(&word.load(Ordering::Relaxed).to_le_bytes());
        }
        bytes.extend_from_slice(&self.load_rear().to_le_bytes());
        bytes
    }

    /// Capacity in samples.
    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    /// Size of the raw image in bytes.
    pub fn byte_len(&self) -> usize {
        self.capacity() * 2 + REAR_METADATA_BYTES
    }
}

/// Creates a byte ring holding at least `capacity` samples.
pub fn new_byte_ring(capacity: usize) -> (ByteRingProducer, ByteRingConsumer) {
    let capacity = ring_capacity(capacity).min(1 << 30);
    let shared = Arc::new(ByteRingShared {
        words: (0..capacity / 2 + 1).map(|_| AtomicU32::new(0)).collect(),
        capacity: capacity as u32,
    });
    (
        ByteRingProducer {
            shared: Arc::clone(&shared),
            rear: 0,
        },
        ByteRingConsumer {
            shared,
            front: 0,
            overruns: 0,
        },
    )
}

/// Writing half of a byte ring.
pub struct ByteRingProducer {
    shared: Arc<ByteRingShared>,
    rear: u32,
}

impl ByteRingProducer {
    /// Appends samples and publishes the new rear cursor.
    #[inline]
    pub fn write(&mut self, data: &[i16]) -> usize {
        for (i, &sample) in data.iter().enumerate() {
            self.shared.set_sample(self.rear.wrapping_add(i as u32), sample);
        }
        self.rear = self.rear.wrapping_add(data.len() as u32);
        self.shared.store_rear(self.rear);
        data.len()
    }

    /// Appends raw little-endian 16-bit samples. A trailing odd byte is ignored.
    ///
    /// Returns the number of bytes consumed.
    pub fn write_le_bytes(&mut self, bytes: &[u8]) -> usize {
        let mut written = 0u32;
        for pair in bytes.chunks_exact(2) {
            let sample = i16::from_le_bytes([pair[0], pair[1]]);
            self.shared.set_sample(self.rear.wrapping_add(written), sample);
            written += 1;
        }
        self.rear = self.rear.wrapping_add(written);
        self.shared.store_rear(self.rear);
        written as usize * 2
    }

    pub fn shared(&self) -> &Arc<ByteRingShared> {
        &self.shared
    }
}

/// Reading half of a byte ring.
pub struct ByteRingConsumer {
    shared: Arc<ByteRingShared>,
    front: u32,
    overruns: u64,
}

impl ByteRingConsumer {
    pub fn available_to_read(&mut self) -> Result<usize, Overrun> {
        let rear = self.shared.load_rear();
        let available = rear.wrapping_sub(self.front);
        if available > self.shared.capacity {
            return Err(self.recover(rear));
        }
        Ok(available as usize)
    }

    pub fn read(&mut self, out: &mut [i16]) -> Result<usize, Overrun> {
        let available = self.available_to_read()?;
        let count = out.len().min(available);
        for (i, sample) in out[..count].iter_mut().enumerate() {
            *sample = self.shared.sample(self.front.wrapping_add(i as u32));
        }
        let rear = self.shared.load_rear();
        if rear.wrapping_sub(self.front) > self.shared.capacity {
            return Err(self.recover(rear));
        }
        self.front = self.front.wrapping_add(count as u32);
        Ok(count)
    }

    pub fn flush(&mut self) {
        self.front = self.shared.load_rear();
    }

    pub fn overrun_count(&self) -> u64 {
        self.overruns
    }

    pub fn shared(&self) -> &Arc<ByteRingShared> {
        &self.shared
    }

    fn recover(&mut self, rear: u32) -> Overrun {
        let capacity = self.shared.capacity;
        let front = rear.wrapping_sub(capacity).wrapping_add(capacity >> 5);
        let discarded = front.wrapping_sub(self.front) as usize;
        self.front = front;
        self.overruns += 1;
        Overrun { discarded }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packs_samples_little_endian_with_trailing_rear() {
        let (mut tx, _rx) = new_byte_ring(4);
        tx.write(&[0x0102, -2, 7]);
        let bytes = tx.shared().to_le_bytes();
        assert_eq!(bytes.len(), tx.shared().byte_len());
        assert_eq!(&bytes[0..2], &0x0102i16.to_le_bytes());
        assert_eq!(&bytes[2..4], &(-2i16).to_le_bytes());
        assert_eq!(&bytes[4..6], &7i16.to_le_bytes());
        assert_eq!(&bytes[8..12], &3u32.to_le_bytes());
    }

    #[test]
    fn byte_writes_read_back_as_samples() {
        let (mut tx, mut rx) = new_byte_ring(8);
        let raw: Vec<u8> = [100i16, -100, 32767]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .chain(std::iter::once(0xAA))
            .collect();
        assert_eq!(tx.write_le_bytes(&raw), 6);
        let mut out = [0i16; 8];
        assert_eq!(rx.read(&mut out), Ok(3));
        assert_eq!(&out[..3], &[100, -100, 32767]);
    }

    #[test]
    fn overrun_discards_a_thirty_second() {
        let (mut tx, mut rx) = new_byte_ring(64);
        let data: Vec<i16> = (0..100).collect();
        tx.write(&data);
        // new front = 100 - 64 + 2
        assert_eq!(rx.available_to_read(), Err(Overrun { discarded: 38 }));
        assert_eq!(rx.available_to_read(), Ok(62));
        let mut out = [0i16; 64];
        assert_eq!(rx.read(&mut out), Ok(62));
        assert_eq!(out[0], 38);
        assert_eq!(rx.overrun_count(), 1);
    }

    #[test]
    fn odd_and_even_halves_do_not_clobber_each_other() {
        let (mut tx, mut rx) = new_byte_ring(2);
        let mut out = [0i16; 2];
        for i in 0..50i16 {
            tx.write(&[i, -i]);
            assert_eq!(rx.read(&mut out), Ok(2));
            assert_eq!(out, [i, -i]);
        }
    }
}
