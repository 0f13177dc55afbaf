//! Asynchronous audit logger
//!
//! The persisted record of what the engine saw and did. Hot-path callers
//! push entries onto a non-blocking ring; a single writer thread drains it
//! to the log file (and optionally stdout). When the ring is full the entry
//! is dropped and counted, never waited on.
//!
//! Line format:
//! `YYYY-MM-DD HH:MM:SS [LEVEL] [source] message` with an appended
//! `| Attack: ... | Severity: ... | Source: ... | Confidence: NN.NN%`
//! block when a threat alert is attached.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use parking_lot::Mutex;

use crate::core::ThreatAlert;
use crate::lockfree::DropRing;

/// Ring capacity; overflow drops entries
const LOG_QUEUE_SIZE: usize = 8192;

/// Writer idle sleep when the ring is empty
const WRITER_IDLE_SLEEP: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warning = 3,
    Error = 4,
    Critical = 5,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
            LogLevel::Critical => "CRITICAL",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Trace,
            1 => LogLevel::Debug,
            2 => LogLevel::Info,
            3 => LogLevel::Warning,
            4 => LogLevel::Error,
            _ => LogLevel::Critical,
        }
    }
}

/// One log record
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub timestamp: DateTime<Local>,
    pub level: LogLevel,
    pub source: String,
    pub message: String,
    pub alert: Option<ThreatAlert>,
}

impl LogEntry {
    pub fn new(level: LogLevel, source: &str, message: String) -> Self {
        Self {
            timestamp: Local::now(),
            level,
            source: source.to_string(),
            message,
            alert: None,
        }
    }

    pub fn to_line(&self) -> String {
        let mut line = format!(
            "{} [{}] [{}] {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.level.as_str(),
            self.source,
            self.message
        );

        if let Some(alert) = &self.alert {
            line.push_str(&format!(
                " | Attack: {} | Severity: {} | Source: {} | Confidence: {:.2}%",
                alert.attack_type,
                alert.severity,
                alert.source,
                alert.confidence * 100.0
            ));
        }

        line
    }
}

/// Severity-filtered asynchronous logger
pub struct AuditLogger {
    queue: Arc<DropRing<LogEntry>>,
    running: Arc<AtomicBool>,
    min_level: AtomicU8,
    console: Arc<AtomicBool>,
    written: Arc<AtomicU64>,
    file: Mutex<Option<File>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl AuditLogger {
    /// Open the log file for appending; the writer thread starts separately
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open log file: {}", path.as_ref().display()))?;

        Ok(Self {
            queue: Arc::new(DropRing::new(LOG_QUEUE_SIZE)),
            running: Arc::new(AtomicBool::new(false)),
            min_level: AtomicU8::new(LogLevel::Info as u8),
            console: Arc::new(AtomicBool::new(false)),
            written: Arc::new(AtomicU64::new(0)),
            file: Mutex::new(Some(file)),
            writer: Mutex::new(None),
        })
    }

    pub fn set_min_level(&self, level: LogLevel) {
        self.min_level.store(level as u8, Ordering::Relaxed);
    }

    pub fn set_console_output(&self, enabled: bool) {
        self.console.store(enabled, Ordering::Relaxed);
    }

    /// Spawn the writer thread; no-op if already running
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(mut file) = self.file.lock().take() else {
            return;
        };

        let queue = Arc::clone(&self.queue);
        let running = Arc::clone(&self.running);
        let console = Arc::clone(&self.console);
        let written = Arc::clone(&self.written);

        let handle = std::thread::Builder::new()
            .name("gw-logwriter".to_string())
            .spawn(move || {
                loop {
                    match queue.pop() {
                        Some(entry) => {
                            write_entry(&mut file, &entry, &console, &written);
                        }
                        None if running.load(Ordering::Relaxed) => {
                            std::thread::sleep(WRITER_IDLE_SLEEP);
                        }
                        None => break,
                    }
                }
                // Residual entries pushed during shutdown
                while let Some(entry) = queue.pop() {
                    write_entry(&mut file, &entry, &console, &written);
                }
            })
            .expect("failed to spawn log writer thread");

        *self.writer.lock() = Some(handle);
    }

    /// Stop the writer, flushing everything still queued; idempotent
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.writer.lock().take() {
            let _ = handle.join();
        }
    }

    pub fn log(&self, level: LogLevel, source: &str, message: String, alert: Option<ThreatAlert>) {
        if (level as u8) < self.min_level.load(Ordering::Relaxed) {
            return;
        }
        let mut entry = LogEntry::new(level, source, message);
        entry.alert = alert;
        self.queue.push(entry);
    }

    pub fn debug(&self, source: &str, message: String) {
        self.log(LogLevel::Debug, source, message, None);
    }

    pub fn info(&self, source: &str, message: String) {
        self.log(LogLevel::Info, source, message, None);
    }

    pub fn warning(&self, source: &str, message: String) {
        self.log(LogLevel::Warning, source, message, None);
    }

    pub fn error(&self, source: &str, message: String) {
        self.log(LogLevel::Error, source, message, None);
    }

    pub fn critical(&self, source: &str, message: String, alert: ThreatAlert) {
        self.log(LogLevel::Critical, source, message, Some(alert));
    }

    pub fn logs_written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    pub fn logs_dropped(&self) -> u64 {
        self.queue.dropped()
    }
}

impl Drop for AuditLogger {
    fn drop(&mut self) {
        self.stop();
    }
}

fn write_entry(file: &mut File, entry: &LogEntry, console: &AtomicBool, written: &AtomicU64) {
    let line = entry.to_line();

    // A failing log file must never take the engine down
    if writeln!(file, "{}", line).is_ok() {
        let _ = file.flush();
        written.fetch_add(1, Ordering::Relaxed);
    } else {
        eprintln!("log write failed: {}", line);
    }

    if console.load(Ordering::Relaxed) {
        println!("{}", line);
    }
}
