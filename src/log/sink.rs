//! Ordered Log Sink
//!
//! Append-only event log with one serialized writer.
//!
//! ```text
//! producers ── write() ──► pending queue ──► log-writer thread ──► latest.log
//!                               │                (one batch in flight)
//!                               └── terminate(): release handle, append tail synchronously
//! ```
//!
//! Records reach the file in the order `write()` was called. A batch is
//! the whole pending queue joined into one string; anything enqueued while
//! it is being written goes out in the next batch. The terminal flush runs
//! exactly once and never loses a record enqueued before it.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use chrono::{DateTime, Local};
use tokio::sync::watch;

use crate::log::record::{LogLevel, LogRecord, Visibility, ARCHIVE_FORMAT};
use crate::supervisor::panic_message;

/// Name of the current log file.
pub const LATEST_LOG: &str = "latest.log";

/// Directory (inside the log directory) holding archived logs.
pub const OLD_LOG_DIR: &str = "old";

/// Text closing the FATAL record pair on the fault path.
pub const FAULT_NOTICE: &str = "uncaught fault - process is terminating";

#[cfg(windows)]
const LINE_ENDING: &str = "\r\n";
#[cfg(not(windows))]
const LINE_ENDING: &str = "\n";

/// Destination of formatted log batches.
pub trait LogTarget: Send {
    /// Write one batch. Called from the writer thread only, never concurrently.
    fn write_batch(&mut self, batch: &str) -> io::Result<()>;

    /// Release the handle, then append `tail` synchronously.
    fn finish(self: Box<Self>, tail: &str) -> io::Result<()>;
}

/// The `latest.log` file.
pub struct FileTarget {
    path: PathBuf,
    file: File,
}

impl FileTarget {
    /// Create (truncate) the file at `path`.
    pub fn create(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let file = File::create(&path)?;
        Ok(Self { path, file })
    }

    /// Location of the file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LogTarget for FileTarget {
    fn write_batch(&mut self, batch: &str) -> io::Result<()> {
        self.file.write_all(batch.as_bytes())?;
        self.file.flush()
    }

    fn finish(self: Box<Self>, tail: &str) -> io::Result<()> {
        let FileTarget { path, file } = *self;
        drop(file);

        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(tail.as_bytes())?;
        file.sync_all()
    }
}

/// In-memory target; clones share the same buffer.
#[derive(Clone, Default)]
pub struct MemoryTarget {
    buffer: Arc<Mutex<String>>,
}

impl MemoryTarget {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything written so far.
    pub fn contents(&self) -> String {
        lock(&self.buffer).clone()
    }
}

impl LogTarget for MemoryTarget {
    fn write_batch(&mut self, batch: &str) -> io::Result<()> {
        lock(&self.buffer).push_str(batch);
        Ok(())
    }

    fn finish(self: Box<Self>, tail: &str) -> io::Result<()> {
        lock(&self.buffer).push_str(tail);
        Ok(())
    }
}

/// Where and what the file sink records.
#[derive(Clone, Debug)]
pub struct LogSettings {
    /// Directory holding `latest.log` and `old/`.
    pub directory: PathBuf,
    /// Archive the previous run's log instead of deleting it.
    pub save_old: bool,
    /// Per-output level masks.
    pub visibility: Visibility,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    /// Asynchronous writes allowed.
    Running,
    /// Terminal records are being enqueued; no new async writes.
    Closing,
    /// Terminal flush done.
    Terminated,
}

struct SinkState {
    pending: Vec<String>,
    /// Batch handed to the writer and not yet confirmed written.
    consuming: Option<String>,
    in_flight: bool,
    /// Set after a failed write; everything waits for the terminal flush.
    parked: bool,
    phase: Phase,
    shutdown: bool,
}

struct Shared {
    visibility: Visibility,
    state: Mutex<SinkState>,
    // Lock order: target, then state.
    target: Mutex<Option<Box<dyn LogTarget>>>,
    wake: Condvar,
    idle: Condvar,
    faults: watch::Sender<Option<String>>,
}

/// Process-wide ordered event log.
pub struct LogSink {
    shared: Arc<Shared>,
    writer: Mutex<Option<JoinHandle<()>>>,
    path: Option<PathBuf>,
}

impl LogSink {
    /// Prepare the log directory and start writing `latest.log`.
    pub fn open(settings: &LogSettings) -> io::Result<Self> {
        let path = prepare_latest(&settings.directory, settings.save_old)?;
        let target = FileTarget::create(&path)?;
        let mut sink = Self::with_target(Box::new(target), settings.visibility)?;
        sink.path = Some(path);
        Ok(sink)
    }

    /// Start a sink over an arbitrary target.
    pub fn with_target(target: Box<dyn LogTarget>, visibility: Visibility) -> io::Result<Self> {
        let (faults, _) = watch::channel(None);
        let shared = Arc::new(Shared {
            visibility,
            state: Mutex::new(SinkState {
                pending: Vec::new(),
                consuming: None,
                in_flight: false,
                parked: false,
                phase: Phase::Running,
                shutdown: false,
            }),
            target: Mutex::new(Some(target)),
            wake: Condvar::new(),
            idle: Condvar::new(),
            faults,
        });

        let writer_shared = shared.clone();
        let writer = thread::Builder::new()
            .name("log-writer".into())
            .spawn(move || run_writer(writer_shared))?;

        Ok(Self {
            shared,
            writer: Mutex::new(Some(writer)),
            path: None,
        })
    }

    /// Path of `latest.log` when file-backed.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Record an event. Never blocks on file I/O.
    pub fn write(&self, timestamp: DateTime<Local>, level: LogLevel, message: &str) {
        self.record(&LogRecord::new(timestamp, level, message));
    }

    /// Record a prepared event. Never blocks on file I/O.
    pub fn record(&self, record: &LogRecord) {
        let visibility = self.shared.visibility;

        if visibility.console.contains(record.level()) {
            let _ = writeln!(io::stdout().lock(), "{}", record.console_line());
        }

        if !visibility.file.contains(record.level()) {
            return;
        }

        let mut line = record.file_line();
        line.push_str(LINE_ENDING);

        let mut state = lock(&self.shared.state);
        if state.phase == Phase::Terminated {
            return;
        }
        state.pending.push(line);
        if !state.in_flight && state.phase == Phase::Running && !state.parked {
            state.in_flight = true;
            self.shared.wake.notify_one();
        }
    }

    /// Block until nothing is pending or in flight.
    pub fn flush(&self) {
        let mut state = lock(&self.shared.state);
        while state.in_flight
            || (state.phase == Phase::Running && !state.parked && !state.pending.is_empty())
        {
            state = wait(&self.shared.idle, state);
        }
    }

    /// Receiver raised with a description when an asynchronous write fails
    /// or panics.
    pub fn faults(&self) -> watch::Receiver<Option<String>> {
        self.shared.faults.subscribe()
    }

    /// Has the terminal flush started.
    pub fn is_terminated(&self) -> bool {
        lock(&self.shared.state).phase != Phase::Running
    }

    /// Terminal synchronous flush. Returns `false` if the sink already
    /// entered its terminal state.
    pub fn terminate(&self) -> io::Result<bool> {
        if !self.begin_terminal() {
            return Ok(false);
        }
        self.flush_terminal().map(|()| true)
    }

    /// Normal exit: record the exit code, then flush synchronously.
    pub fn finish(&self, code: i32) -> io::Result<bool> {
        if !self.begin_terminal() {
            return Ok(false);
        }
        self.write(Local::now(), LogLevel::Info, &format!("ended with code {code}"));
        self.flush_terminal().map(|()| true)
    }

    /// Fault exit: record the fault, then flush synchronously.
    pub fn fail(&self, detail: &str) -> io::Result<bool> {
        if !self.begin_terminal() {
            return Ok(false);
        }
        self.write(Local::now(), LogLevel::Fatal, detail);
        self.write(Local::now(), LogLevel::Error, FAULT_NOTICE);
        self.flush_terminal().map(|()| true)
    }

    fn begin_terminal(&self) -> bool {
        let mut state = lock(&self.shared.state);
        if state.phase != Phase::Running {
            return false;
        }
        state.phase = Phase::Closing;
        true
    }

    fn flush_terminal(&self) -> io::Result<()> {
        // Waits for an in-flight write to settle.
        let target = lock(&self.shared.target).take();

        let tail = {
            let mut state = lock(&self.shared.state);
            state.phase = Phase::Terminated;
            state.in_flight = false;
            state.shutdown = true;

            let mut tail = state.consuming.take().unwrap_or_default();
            tail.push_str(&state.pending.concat());
            state.pending.clear();
            tail
        };
        self.shared.wake.notify_all();
        self.shared.idle.notify_all();
        self.join_writer();

        match target {
            Some(target) => target.finish(&tail),
            None => Ok(()),
        }
    }

    fn join_writer(&self) {
        let handle = lock(&self.writer).take();
        if let Some(handle) = handle {
            if let Err(payload) = handle.join() {
                eprintln!("log writer {}", panic_message(payload));
            }
        }
    }
}

impl Drop for LogSink {
    fn drop(&mut self) {
        let _ = self.terminate();
        lock(&self.shared.state).shutdown = true;
        self.shared.wake.notify_all();
        self.join_writer();
    }
}

fn run_writer(shared: Arc<Shared>) {
    loop {
        let batch = {
            let mut state = lock(&shared.state);
            loop {
                if state.shutdown {
                    return;
                }
                if state.in_flight {
                    if state.phase == Phase::Running && !state.parked && !state.pending.is_empty() {
                        break;
                    }
                    state.in_flight = false;
                    shared.idle.notify_all();
                }
                state = wait(&shared.wake, state);
            }

            let batch = state.pending.concat();
            state.pending.clear();
            state.consuming = Some(batch.clone());
            batch
        };

        let mut target = lock(&shared.target);
        // Released by the terminal flush, which now owns `consuming`.
        let Some(active) = target.as_mut() else {
            continue;
        };

        // A panicking target is treated like a failed write.
        let failure = match panic::catch_unwind(AssertUnwindSafe(|| active.write_batch(&batch))) {
            Ok(Ok(())) => None,
            Ok(Err(error)) => Some(format!("log write failed: {error}")),
            Err(payload) => Some(format!("log writer {}", panic_message(payload))),
        };
        let mut state = lock(&shared.state);
        match failure {
            None => state.consuming = None,
            Some(detail) => {
                state.parked = true;
                drop(state);
                drop(target);
                shared.faults.send_replace(Some(detail));
            }
        }
    }
}

/// Make sure `<directory>/latest.log` is a fresh target, archiving or
/// deleting the previous run's file.
pub fn prepare_latest(directory: &Path, save_old: bool) -> io::Result<PathBuf> {
    fs::create_dir_all(directory)?;
    let latest = directory.join(LATEST_LOG);

    let metadata = match fs::metadata(&latest) {
        Ok(metadata) => metadata,
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(latest),
        Err(error) => return Err(error),
    };

    if save_old {
        let old_dir = directory.join(OLD_LOG_DIR);
        fs::create_dir_all(&old_dir)?;
        let created = metadata
            .created()
            .or_else(|_| metadata.modified())
            .map(DateTime::<Local>::from)
            .unwrap_or_else(|_| Local::now());
        fs::rename(&latest, archive_path(&old_dir, &created))?;
    } else {
        fs::remove_file(&latest)?;
    }

    Ok(latest)
}

fn archive_path(old_dir: &Path, created: &DateTime<Local>) -> PathBuf {
    let stem = created.format(ARCHIVE_FORMAT).to_string();
    let mut candidate = old_dir.join(format!("{stem}.log"));
    let mut suffix = 1;
    while candidate.exists() {
        candidate = old_dir.join(format!("{stem}-{suffix}.log"));
        suffix += 1;
    }
    candidate
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn wait<'a, T>(condvar: &Condvar, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
    condvar.wait(guard).unwrap_or_else(PoisonError::into_inner)
}
