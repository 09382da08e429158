//! Lock-free single-producer/single-consumer sample ring.
//!
//! The producer never waits for the consumer. When it laps the reader, the
//! reader notices on its next call, drops the oldest surplus plus a margin of
//! `capacity / 16`, and reports [`Overrun`] once for that event.
//!
//! Cursors increase monotonically and wrap through a power-of-two mask. The
//! published rear cursor is the only state both threads touch besides the
//! sample slots themselves.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicI16, AtomicUsize, Ordering};
use std::sync::Arc;

/// Reported by a consumer when the producer outran it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Overrun {
    /// Samples dropped to resynchronize the reader.
    pub discarded: usize,
}

/// Smallest power of two that holds `requested` samples, at least 2.
pub fn ring_capacity(requested: usize) -> usize {
    requested.max(2).next_power_of_two()
}

struct Shared {
    slots: Box<[AtomicI16]>,
    mask: usize,
    rear: AtomicUsize,
}

/// Creates a ring holding at least `capacity` samples.
///
/// Returns (producer for the audio thread, consumer for the analysis thread).
pub fn new_sample_ring(capacity: usize) -> (SampleProducer, SampleConsumer) {
    let capacity = ring_capacity(capacity);
    let shared = Arc::new(Shared {
        slots: (0..capacity).map(|_| AtomicI16::new(0)).collect(),
        mask: capacity - 1,
        rear: AtomicUsize::new(0),
    });
    (
        SampleProducer {
            shared: Arc::clone(&shared),
            rear: 0,
        },
        SampleConsumer {
            shared,
            front: 0,
            overruns: 0,
            discarded: 0,
        },
    )
}

/// Writing half of a sample ring.
pub struct SampleProducer {
    shared: Arc<Shared>,
    rear: usize,
}

impl SampleProducer {
    /// Appends `data` and publishes it. Never blocks, never fails.
    ///
    /// Returns the number of samples written, always `data.len()`.
    #[inline]
    pub fn write(&mut self, data: &[i16]) -> usize {
        let mask = self.shared.mask;
        for (i, &sample) in data.iter().enumerate() {
            self.shared.slots[self.rear.wrapping_add(i) & mask].store(sample, Ordering::Relaxed);
        }
        self.rear = self.rear.wrapping_add(data.len());
        self.shared.rear.store(self.rear, Ordering::Release);
        data.len()
    }

    pub fn capacity(&self) -> usize {
        self.shared.mask + 1
    }
}

/// Reading half of a sample ring.
pub struct SampleConsumer {
    shared: Arc<Shared>,
    front: usize,
    overruns: u64,
    discarded: u64,
}

impl SampleConsumer {
    pub fn capacity(&self) -> usize {
        self.shared.mask + 1
    }

    /// Samples ready to read, or [`Overrun`] if the producer lapped us.
    ///
    /// After an overrun the cursor is already resynchronized, so the next
    /// call reports at most `capacity` samples.
    pub fn available_to_read(&mut self) -> Result<usize, Overrun> {
        let rear = self.shared.rear.load(Ordering::Acquire);
        let available = rear.wrapping_sub(self.front);
        if available > self.capacity() {
            return Err(self.recover(rear));
        }
        Ok(available)
    }

    /// Copies up to `out.len()` samples into `out`.
    pub fn read(&mut self, out: &mut [i16]) -> Result<usize, Overrun> {
        let available = self.available_to_read()?;
        let count = out.len().min(available);
        let front = self.front;
        let mask = self.shared.mask;
        for (i, sample) in out[..count].iter_mut().enumerate() {
            *sample = self.shared.slots[front.wrapping_add(i) & mask].load(Ordering::Relaxed);
        }
        // A lap that completed during the copy clobbered what we just read.
        let rear = self.shared.rear.load(Ordering::Acquire);
        if rear.wrapping_sub(front) > self.capacity() {
            return Err(self.recover(rear));
        }
        self.front = front.wrapping_add(count);
        Ok(count)
    }

    /// Drops everything currently buffered.
    pub fn flush(&mut self) {
        self.front = self.shared.rear.load(Ordering::Acquire);
    }

    /// Overrun events detected so far.
    pub fn overrun_count(&self) -> u64 {
        self.overruns
    }

    /// Samples dropped by overrun recovery so far.
    pub fn discarded_samples(&self) -> u64 {
        self.discarded
    }

    fn recover(&mut self, rear: usize) -> Overrun {
        let capacity = self.capacity();
        let front = rear.wrapping_sub(capacity).wrapping_add(capacity >> 4);
        let discarded = front.wrapping_sub(self.front);
        self.front = front;
        self.overruns += 1;
        self.discarded += discarded as u64;
        Overrun { discarded }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_rounds_up() {
        assert_eq!(ring_capacity(0), 2);
        assert_eq!(ring_capacity(2), 2);
        assert_eq!(ring_capacity(3), 4);
        assert_eq!(ring_capacity(1000), 1024);
        assert_eq!(ring_capacity(65536), 65536);
    }

    #[test]
    fn write_then_read_preserves_order() {
        let (mut tx, mut rx) = new_sample_ring(16);
        let data: Vec<i16> = (0..10).collect();
        assert_eq!(tx.write(&data), 10);
        assert_eq!(rx.available_to_read(), Ok(10));
        let mut out = [0i16; 4];
        assert_eq!(rx.read(&mut out), Ok(4));
        assert_eq!(out, [0, 1, 2, 3]);
        let mut rest = [0i16; 16];
        assert_eq!(rx.read(&mut rest), Ok(6));
        assert_eq!(&rest[..6], &[4, 5, 6, 7, 8, 9]);
        assert_eq!(rx.read(&mut rest), Ok(0));
    }

    #[test]
    fn wraps_across_the_end() {
        let (mut tx, mut rx) = new_sample_ring(8);
        let mut out = [0i16; 8];
        for round in 0..5i16 {
            let block: Vec<i16> = (0..6).map(|i| round * 10 + i).collect();
            tx.write(&block);
            assert_eq!(rx.read(&mut out), Ok(6));
            assert_eq!(&out[..6], block.as_slice());
        }
    }

    #[test]
    fn overrun_reported_once_and_resynchronizes() {
        let (mut tx, mut rx) = new_sample_ring(64);
        let data: Vec<i16> = (0..100).collect();
        tx.write(&data);
        let overrun = rx.available_to_read().unwrap_err();
        // rear 100, new front = 100 - 64 + 4
        assert_eq!(overrun.discarded, 40);
        let available = rx.available_to_read().unwrap();
        assert_eq!(available, 60);
        let mut out = vec![0i16; 64];
        assert_eq!(rx.read(&mut out), Ok(60));
        assert_eq!(out[0], 40);
        assert_eq!(out[59], 99);
        assert_eq!(rx.overrun_count(), 1);
        assert_eq!(rx.discarded_samples(), 40);
    }

    #[test]
    fn flush_drops_pending() {
        let (mut tx, mut rx) = new_sample_ring(32);
        tx.write(&[1, 2, 3]);
        rx.flush();
        assert_eq!(rx.available_to_read(), Ok(0));
        tx.write(&[4]);
        let mut out = [0i16; 2];
        assert_eq!(rx.read(&mut out), Ok(1));
        assert_eq!(out[0], 4);
    }

    #[test]
    fn threads_see_every_sample_in_order() {
        let (mut tx, mut rx) = new_sample_ring(1 << 16);
        let writer = std::thread::spawn(move || {
            for block in 0..100i16 {
                let data: Vec<i16> = (0..100).map(|i| block * 100 + i).collect();
                tx.write(&data);
            }
        });
        writer.join().unwrap();
        let mut out = vec![0i16; 10_000];
        assert_eq!(rx.read(&mut out), Ok(10_000));
        for (i, &s) in out.iter().enumerate() {
            assert_eq!(s, i as i16);
        }
    }
}
