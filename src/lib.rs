//! Audio loopback latency and buffer-glitch measurement.
//!
//! A known signal is played, the loopback is captured, and the capture is
//! analyzed for round-trip latency and buffer-timing glitches.
//!
//! - Audio I/O threads touch only [`ring`], [`byte_ring`], [`buffer_period`],
//!   [`callback_times`] and [`tone`]. None of those allocate, lock or log.
//! - The analysis thread runs [`glitch`] over frames pulled from a ring.
//! - [`latency`], [`performance`] and [`report`] run after a test ends.
//! - [`capture`] and [`wave_deck`] keep the most interesting diagnostic
//!   captures of a run.

pub mod buffer_period;
pub mod byte_ring;
pub mod callback_times;
pub mod capture;
pub mod config;
pub mod device;
pub mod fft;
pub mod glitch;
#[doc(hidden)]
pub mod invariant_ppt;
pub mod invariant_rt;
pub mod latency;
pub mod performance;
pub mod report;
pub mod ring;
pub mod session;
pub mod task;
pub mod tone;
pub mod wave_deck;

pub use config::TestSettings;
pub use session::{BufferTestResult, LatencyTestResult, LoopbackSession, SessionError};
