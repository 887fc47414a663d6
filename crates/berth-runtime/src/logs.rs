//! Container log capture.
//!
//! A [`LogBuffer`] is written by exactly one [`LogCapture`] task and read by
//! any number of probes and diagnostics. Reads always see the buffer from
//! its first retained line, so a readiness message printed before the first
//! poll is still found. Patterns registered with [`LogBuffer::watch`] are
//! latched as each line arrives, so a bounded capture cannot evict a match
//! before it is polled.

use std::collections::VecDeque;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use berth_common::config::LogCaptureMode;
use berth_common::constants::LOG_CHANNEL_CAPACITY;
use berth_common::error::{BerthError, Result};
use berth_common::types::{LogLine, LogStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

#[derive(Debug, Default)]
struct Lines {
    /// `(sequence, text)`; sequence numbers order lines across streams.
    stdout: VecDeque<(u64, String)>,
    stderr: VecDeque<(u64, String)>,
    next_seq: u64,
    evicted: u64,
    watches: Vec<Watch>,
}

#[derive(Debug)]
struct Watch {
    stream: LogStream,
    pattern: String,
    seen: bool,
}

impl Lines {
    fn stream(&self, stream: LogStream) -> &VecDeque<(u64, String)> {
        match stream {
            LogStream::Stdout => &self.stdout,
            LogStream::Stderr => &self.stderr,
        }
    }

    fn stream_mut(&mut self, stream: LogStream) -> &mut VecDeque<(u64, String)> {
        match stream {
            LogStream::Stdout => &mut self.stdout,
            LogStream::Stderr => &mut self.stderr,
        }
    }
}

/// Append-only, per-stream record of a container's output.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    lines: Arc<RwLock<Lines>>,
    live: broadcast::Sender<LogLine>,
    mode: LogCaptureMode,
}

impl LogBuffer {
    /// Creates an empty buffer with the given retention policy.
    #[must_use]
    pub fn new(mode: LogCaptureMode) -> Self {
        let (live, _) = broadcast::channel(LOG_CHANNEL_CAPACITY);
        Self {
            lines: Arc::new(RwLock::new(Lines::default())),
            live,
            mode,
        }
    }

    /// Appends a line, evicting the oldest line of that stream when bounded.
    pub fn append(&self, line: LogLine) {
        {
            let mut lines = self.lines.write().unwrap_or_else(PoisonError::into_inner);
            let seq = lines.next_seq;
            lines.next_seq += 1;
            for watch in &mut lines.watches {
                if !watch.seen && watch.stream == line.stream && line.text.contains(watch.pattern.as_str()) {
                    watch.seen = true;
                }
            }
            let evict = {
                let stream = lines.stream_mut(line.stream);
                stream.push_back((seq, line.text.clone()));
                match self.mode {
                    LogCaptureMode::Bounded { max_lines } if stream.len() > max_lines => {
                        stream.pop_front().is_some()
                    }
                    _ => false,
                }
            };
            if evict {
                lines.evicted += 1;
            }
        }
        // No subscribers is the common case.
        let _ = self.live.send(line);
    }

    /// Retained lines of `stream`, oldest first.
    #[must_use]
    pub fn lines(&self, stream: LogStream) -> Vec<String> {
        let lines = self.lines.read().unwrap_or_else(PoisonError::into_inner);
        lines.stream(stream).iter().map(|(_, text)| text.clone()).collect()
    }

    /// Retained lines of both streams in the order they were captured.
    #[must_use]
    pub fn snapshot(&self) -> Vec<LogLine> {
        let lines = self.lines.read().unwrap_or_else(PoisonError::into_inner);
        let mut merged: Vec<(u64, LogLine)> = lines
            .stdout
            .iter()
            .map(|(seq, text)| (*seq, LogLine::new(LogStream::Stdout, text.clone())))
            .chain(
                lines
                    .stderr
                    .iter()
                    .map(|(seq, text)| (*seq, LogLine::new(LogStream::Stderr, text.clone()))),
            )
            .collect();
        merged.sort_by_key(|(seq, _)| *seq);
        merged.into_iter().map(|(_, line)| line).collect()
    }

    /// Latches `pattern` on `stream`: once any line containing it is
    /// captured, [`contains`](Self::contains) stays true even after the line
    /// is evicted. Retained lines are checked at registration.
    pub fn watch(&self, stream: LogStream, pattern: impl Into<String>) {
        let pattern = pattern.into();
        let mut lines = self.lines.write().unwrap_or_else(PoisonError::into_inner);
        if lines.watches.iter().any(|w| w.stream == stream && w.pattern == pattern) {
            return;
        }
        let seen = lines.stream(stream).iter().any(|(_, text)| text.contains(pattern.as_str()));
        lines.watches.push(Watch { stream, pattern, seen });
    }

    /// Whether a line of `stream` containing `pattern` is retained, or was
    /// latched by a watch on that pattern.
    #[must_use]
    pub fn contains(&self, stream: LogStream, pattern: &str) -> bool {
        let lines = self.lines.read().unwrap_or_else(PoisonError::into_inner);
        lines
            .watches
            .iter()
            .any(|w| w.seen && w.stream == stream && w.pattern == pattern)
            || lines.stream(stream).iter().any(|(_, text)| text.contains(pattern))
    }

    /// Number of retained lines of `stream`.
    #[must_use]
    pub fn len(&self, stream: LogStream) -> usize {
        let lines = self.lines.read().unwrap_or_else(PoisonError::into_inner);
        lines.stream(stream).len()
    }

    /// Whether nothing has been retained on either stream.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        let lines = self.lines.read().unwrap_or_else(PoisonError::into_inner);
        lines.stdout.is_empty() && lines.stderr.is_empty()
    }

    /// Number of lines dropped by a bounded capture.
    #[must_use]
    pub fn evicted(&self) -> u64 {
        self.lines.read().unwrap_or_else(PoisonError::into_inner).evicted
    }

    /// Live tail: lines appended after this call.
    #[must_use]
    pub fn follow(&self) -> broadcast::Receiver<LogLine> {
        self.live.subscribe()
    }
}

/// Task pumping a runtime log feed into a [`LogBuffer`].
///
/// Dropping the capture stops the pump.
#[derive(Debug)]
pub struct LogCapture {
    task: JoinHandle<()>,
}

impl LogCapture {
    /// Spawns the pump on the current tokio runtime.
    #[must_use]
    pub fn spawn(mut feed: mpsc::Receiver<LogLine>, buffer: LogBuffer) -> Self {
        let task = tokio::spawn(async move {
            while let Some(line) = feed.recv().await {
                buffer.append(line);
            }
        });
        Self { task }
    }

    /// Whether the feed has ended.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for LogCapture {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Returns the persisted log path for a container.
#[must_use]
pub fn log_path(log_dir: &Path, container: &str) -> PathBuf {
    log_dir.join("logs").join(format!("{container}.log"))
}

/// Appends every retained line to the container's log file, prefixed with
/// its stream, and returns the file path.
///
/// Creates the log directory and file if they do not exist.
///
/// # Errors
///
/// Returns an error if the directory or file cannot be created or written.
pub fn persist(log_dir: &Path, container: &str, buffer: &LogBuffer) -> Result<PathBuf> {
    let path = log_path(log_dir, container);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| BerthError::io(format!("creating {}", parent.display()), e))?;
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| BerthError::io(format!("opening {}", path.display()), e))?;
    let mut writer = std::io::BufWriter::new(file);
    for line in buffer.snapshot() {
        writeln!(writer, "[{}] {}", line.stream, line.text)
            .map_err(|e| BerthError::io(format!("writing {}", path.display()), e))?;
    }
    writer
        .flush()
        .map_err(|e| BerthError::io(format!("writing {}", path.display()), e))?;
    Ok(path)
}
