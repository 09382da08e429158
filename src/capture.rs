//! Capture retention cache.
//!
//! Keeps the `capacity` most interesting diagnostic captures. A capture is
//! admitted only if a slot is free or it outranks the least interesting stored
//! record. At most one capture is in flight; its worker thread signals the
//! external trace listener through a file, waits for the listener to delete
//! that file, exports the frozen waveform, removes the evicted record's
//! artifacts and finally publishes the new record.
//!
//! Admission takes a short lock. Call [`CaptureCache::capture_state`] from
//! analysis or monitoring threads, not from the audio callback.

#![forbid(unsafe_code)]

use crate::config::TestSettings;
use crate::invariant_ppt::{assert_invariant, CAPTURE_SINGLE_FLIGHT, CAPTURE_SLOT_ORDER};
use crate::task::{join_with_timeout, spawn_named, StopToken};
use crate::wave_deck::WaveDeckBuffer;
use log::{debug, info, warn};
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;

pub const SYSTRACE_SUFFIX: &str = ".trace";
pub const BUGREPORT_SUFFIX: &str = "_bugreport.txt.gz";
pub const WAV_SUFFIX: &str = ".wav";
/// Written to the signal file to make the listener exit.
pub const TERMINATE_SIGNAL: &str = "QUIT";
/// Sleep between checks for the listener's acknowledgement.
pub const ACK_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Default bound on waiting for the listener.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome of a capture request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureStatus {
    /// Every stored record is at least as interesting; nothing happens.
    NewCaptureIsLeastInteresting,
    /// Another capture is running; its rank was raised instead.
    CaptureAlreadyInProgress,
    /// A worker was started for this capture.
    StateCaptured,
    /// No capture artifact is enabled.
    CapturingDisabled,
}

impl CaptureStatus {
    /// Numeric status code used in logs and reports.
    pub fn code(self) -> i32 {
        match self {
            CaptureStatus::NewCaptureIsLeastInteresting => -1,
            CaptureStatus::CaptureAlreadyInProgress => 0,
            CaptureStatus::StateCaptured => 1,
            CaptureStatus::CapturingDisabled => 2,
        }
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to write signal file {path:?}: {source}")]
    Signal { path: PathBuf, source: io::Error },
    #[error("listener did not acknowledge within {0:?}")]
    AckTimeout(Duration),
    #[error("acknowledgement wait cancelled")]
    Cancelled,
    #[error("failed to write wav capture: {0}")]
    Wav(#[from] hound::Error),
    #[error("failed to spawn capture worker: {0}")]
    Spawn(io::Error),
}

/// A retained capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRecord {
    /// Path and base name shared by all artifacts of this capture.
    pub prefix: PathBuf,
    /// Time since the cache was created.
    pub elapsed_ms: u64,
    pub rank: i32,
}

impl CaptureRecord {
    /// `prefix` followed by `suffix`.
    pub fn artifact(&self, suffix: &str) -> PathBuf {
        let mut name: OsString = self.prefix.as_os_str().to_owned();
        name.push(suffix);
        PathBuf::from(name)
    }

    pub fn artifacts(&self) -> [PathBuf; 3] {
        [
            self.artifact(SYSTRACE_SUFFIX),
            self.artifact(BUGREPORT_SUFFIX),
            self.artifact(WAV_SUFFIX),
        ]
    }
}

/// Fixed slots filled in order, then replaced by rank.
#[derive(Debug, Clone)]
pub struct CaptureStore {
    slots: Vec<Option<CaptureRecord>>,
}

impl CaptureStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity.max(1)],
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn slots(&self) -> &[Option<CaptureRecord>] {
        &self.slots
    }

    pub fn records(&self) -> Vec<CaptureRecord> {
        self.slots.iter().flatten().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Slot a candidate of `rank` would take.
    ///
    /// The first empty slot wins outright. Otherwise the lowest-ranked record
    /// strictly below `rank`. `None` when the candidate is least interesting.
    pub fn least_interesting(&self, rank: i32) -> Option<usize> {
        let mut floor = rank;
        let mut index = None;
        for (i, slot) in self.slots.iter().enumerate() {
            match slot {
                None => return Some(i),
                Some(record) if record.rank < floor => {
                    floor = record.rank;
                    index = Some(i);
                }
                Some(_) => {}
            }
        }
        index
    }

    /// Stores `record` at `index` and returns the record it replaced.
    pub fn place(&mut self, index: usize, record: CaptureRecord) -> Option<CaptureRecord> {
        let filling_empty = self.slots[index].is_none();
        assert_invariant(
            CAPTURE_SLOT_ORDER,
            !filling_empty || self.slots[..index].iter().all(Option::is_some),
            "empty slots are filled in order",
            Some("CaptureStore::place"),
        );
        self.slots[index].replace(record)
    }

    /// Admits `record` if it qualifies, ignoring artifacts. Returns the evicted record.
    pub fn admit(&mut self, record: CaptureRecord) -> Result<Option<CaptureRecord>, CaptureRecord> {
        match self.least_interesting(record.rank) {
            Some(index) => Ok(self.place(index, record)),
            None => Err(record),
        }
    }
}

/// What a cache captures and where.
#[derive(Debug, Clone)]
pub struct CaptureOptions {
    pub capacity: usize,
    pub directory: PathBuf,
    pub file_prefix: String,
    pub signal_file: PathBuf,
    pub wav: bool,
    pub systrace: bool,
    pub bugreport: bool,
    pub ack_timeout: Duration,
}

impl CaptureOptions {
    pub fn from_settings(settings: &TestSettings) -> Self {
        Self {
            capacity: settings.num_captures,
            directory: settings.capture_dir.clone(),
            file_prefix: settings.capture_prefix.clone(),
            signal_file: settings.signal_file.clone(),
            wav: settings.capture_wav,
            systrace: settings.capture_systrace,
            bugreport: settings.capture_bugreport,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
        }
    }

    fn uses_listener(&self) -> bool {
        self.systrace || self.bugreport
    }

    fn enabled(&self) -> bool {
        self.wav || self.uses_listener()
    }
}

/// State of the capture currently being taken.
#[derive(Debug)]
struct InFlight {
    rank: AtomicI32,
    running: AtomicBool,
    quit_requested: AtomicBool,
}

#[derive(Debug)]
struct Admission {
    store: CaptureStore,
    in_flight: Option<Arc<InFlight>>,
    worker: Option<JoinHandle<()>>,
}

impl Admission {
    fn busy(&self) -> Option<&Arc<InFlight>> {
        self.in_flight
            .as_ref()
            .filter(|f| f.running.load(Ordering::Acquire))
    }
}

#[derive(Debug)]
struct Inner {
    options: CaptureOptions,
    started: Instant,
    admission: Mutex<Admission>,
    wave_deck: Mutex<Option<WaveDeckBuffer>>,
    stop: StopToken,
}

impl Inner {
    fn admission(&self) -> MutexGuard<'_, Admission> {
        self.admission.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn wave_deck(&self) -> Option<WaveDeckBuffer> {
        self.wave_deck
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

/// Shared handle on the capture retention cache.
#[derive(Debug, Clone)]
pub struct CaptureCache {
    inner: Arc<Inner>,
}

impl CaptureCache {
    pub fn new(options: CaptureOptions) -> Self {
        let store = CaptureStore::new(options.capacity);
        Self {
            inner: Arc::new(Inner {
                options,
                started: Instant::now(),
                admission: Mutex::new(Admission {
                    store,
                    in_flight: None,
                    worker: None,
                }),
                wave_deck: Mutex::new(None),
                stop: StopToken::new(),
            }),
        }
    }

    /// Source of waveform snapshots for `.wav` artifacts.
    pub fn set_wave_deck(&self, decks: WaveDeckBuffer) {
        *self
            .inner
            .wave_deck
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(decks);
    }

    pub fn is_capturing(&self) -> bool {
        self.inner.options.enabled()
    }

    pub fn options(&self) -> &CaptureOptions {
        &self.inner.options
    }

    /// Requests a capture of the current state with interestingness `rank`.
    pub fn capture_state(&self, rank: i32) -> CaptureStatus {
        if !self.is_capturing() {
            debug!("capture_state: capturing not enabled");
            return CaptureStatus::CapturingDisabled;
        }
        let mut admission = self.inner.admission();
        if let Some(in_flight) = admission.busy() {
            in_flight.rank.fetch_max(rank, Ordering::AcqRel);
            debug!("capture_state: capture already running, rank raised to at least {rank}");
            return CaptureStatus::CaptureAlreadyInProgress;
        }
        assert_invariant(
            CAPTURE_SINGLE_FLIGHT,
            admission.busy().is_none(),
            "one capture in flight at most",
            Some("capture_state"),
        );
        if let Some(finished) = admission.worker.take() {
            let _ = finished.join();
        }

        let elapsed = self.inner.started.elapsed();
        let record = CaptureRecord {
            prefix: self.inner.options.directory.join(format!(
                "{}_{}",
                self.inner.options.file_prefix,
                elapsed_stamp(elapsed)
            )),
            elapsed_ms: elapsed.as_millis() as u64,
            rank,
        };
        let Some(index) = admission.store.least_interesting(rank) else {
            debug!("capture_state: every stored capture is more interesting than rank {rank}");
            return CaptureStatus::NewCaptureIsLeastInteresting;
        };

        let in_flight = Arc::new(InFlight {
            rank: AtomicI32::new(rank),
            running: AtomicBool::new(true),
            quit_requested: AtomicBool::new(false),
        });
        let inner = Arc::clone(&self.inner);
        let worker_state = Arc::clone(&in_flight);
        match spawn_named("loopback-capture", move || {
            run_capture(&inner, &worker_state, record, index)
        }) {
            Ok(handle) => {
                admission.in_flight = Some(in_flight);
                admission.worker = Some(handle);
                CaptureStatus::StateCaptured
            }
            Err(err) => {
                warn!("{}", CaptureError::Spawn(err));
                CaptureStatus::NewCaptureIsLeastInteresting
            }
        }
    }

    /// True while a capture worker is running.
    pub fn in_flight(&self) -> bool {
        self.inner.admission().busy().is_some()
    }

    /// Snapshot of the retained captures in slot order.
    pub fn records(&self) -> Vec<CaptureRecord> {
        self.inner.admission().store.records()
    }

    /// Waits up to `timeout` for the running capture to finish.
    ///
    /// Returns `true` when no capture is running afterwards.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let worker = self.inner.admission().worker.take();
        if let Some(handle) = worker {
            if join_with_timeout(handle, timeout).is_err() {
                return false;
            }
        }
        !self.in_flight()
    }

    /// Tells the listener to exit. Deferred until a running capture publishes.
    pub fn stop_listener_script(&self) {
        let admission = self.inner.admission();
        if let Some(in_flight) = admission.busy() {
            in_flight.quit_requested.store(true, Ordering::Release);
            debug!("listener quit deferred until the running capture completes");
            return;
        }
        drop(admission);
        if let Err(err) = signal_listener_quit(&self.inner.options.signal_file) {
            warn!("{err}");
        }
    }

    /// Cancels acknowledgement waits; a running worker finishes promptly.
    pub fn shutdown(&self) {
        self.inner.stop.stop();
    }
}

/// Writes the terminate token to `signal_file`.
pub fn signal_listener_quit(signal_file: &Path) -> Result<(), CaptureError> {
    fs::write(signal_file, TERMINATE_SIGNAL).map_err(|source| CaptureError::Signal {
        path: signal_file.to_path_buf(),
        source,
    })?;
    info!("signaled capture listener to exit");
    Ok(())
}

/// `HHhMMmSSs` for an elapsed duration.
pub fn elapsed_stamp(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{:02}h{:02}m{:02}s", secs / 3600, (secs / 60) % 60, secs % 60)
}

fn request_listener_capture(options: &CaptureOptions, record: &CaptureRecord) -> Result<(), CaptureError> {
    let prefix = record.prefix.to_string_lossy();
    fs::write(&options.signal_file, prefix.as_bytes()).map_err(|source| CaptureError::Signal {
        path: options.signal_file.clone(),
        source,
    })
}

fn await_acknowledgement(options: &CaptureOptions, stop: &StopToken) -> Result<(), CaptureError> {
    let deadline = Instant::now() + options.ack_timeout;
    while options.signal_file.exists() {
        if Instant::now() >= deadline {
            return Err(CaptureError::AckTimeout(options.ack_timeout));
        }
        if stop.sleep(ACK_POLL_INTERVAL) {
            return Err(CaptureError::Cancelled);
        }
    }
    Ok(())
}

fn export_wav(inner: &Inner, record: &CaptureRecord) -> Result<bool, CaptureError> {
    let Some(decks) = inner.wave_deck() else {
        return Ok(false);
    };
    let Some(deck) = decks.get_wave_deck() else {
        debug!("wave deck still being drained, skipping wav for {:?}", record.prefix);
        return Ok(false);
    };
    deck.write_to_file(&record.artifact(WAV_SUFFIX))?;
    Ok(true)
}

fn delete_artifacts(record: &CaptureRecord) {
    debug!("deleting capture {:?} (rank {})", record.prefix, record.rank);
    for path in record.artifacts() {
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!("old capture artifact {path:?} was not present");
            }
            Err(err) => warn!("unable to delete old capture artifact {path:?}: {err}"),
        }
    }
}

fn run_capture(inner: &Inner, in_flight: &InFlight, mut record: CaptureRecord, index: usize) {
    let options = &inner.options;
    let mut materialized = false;

    if options.uses_listener() {
        debug!("signaling listener to write {:?}*", record.prefix);
        match request_listener_capture(options, &record)
            .and_then(|()| await_acknowledgement(options, &inner.stop))
        {
            Ok(()) => materialized = true,
            Err(err) => warn!("capture {:?}: {err}", record.prefix),
        }
    }

    if options.wav {
        match export_wav(inner, &record) {
            Ok(written) => materialized |= written,
            Err(err) => warn!("capture {:?}: {err}", record.prefix),
        }
    }

    if materialized {
        let replaced = inner.admission().store.slots()[index].clone();
        if let Some(old) = replaced.filter(|old| old.prefix != record.prefix) {
            delete_artifacts(&old);
        }
    } else {
        warn!("capture {:?} produced nothing; keeping previous captures", record.prefix);
    }

    let mut admission = inner.admission();
    if materialized {
        record.rank = in_flight.rank.load(Ordering::Acquire);
        info!("adding capture {:?} (rank {})", record.prefix, record.rank);
        admission.store.place(index, record);
    }
    if in_flight.quit_requested.swap(false, Ordering::AcqRel) {
        if let Err(err) = signal_listener_quit(&options.signal_file) {
            warn!("{err}");
        }
    }
    in_flight.running.store(false, Ordering::Release);
}
