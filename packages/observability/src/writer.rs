//! Append-only JSONL file sink.
//!
//! Several processes may append to the same file; each line is written and
//! flushed under one lock so lines never interleave.

use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::fmt::MakeWriter;

/// `{data dir}/stream-queue/logs/{service}.jsonl`, or the temp dir when the
/// platform has no data directory.
pub fn default_log_path(service_name: &str) -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("stream-queue")
        .join("logs")
        .join(format!("{}.jsonl", service_name))
}

/// Shared handle on the log file.
#[derive(Clone)]
pub struct LogFileWriter {
    inner: Arc<Mutex<BufWriter<File>>>,
}

impl LogFileWriter {
    pub fn open(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self {
            inner: Arc::new(Mutex::new(BufWriter::with_capacity(8192, file))),
        })
    }

    /// Write one line and flush it.
    pub fn write_line(&self, line: &str) -> io::Result<()> {
        let mut guard = self.inner.lock();
        guard.write_all(line.as_bytes())?;
        guard.write_all(b"\n")?;
        guard.flush()
    }
}

impl io::Write for LogFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut guard = self.inner.lock();
        let written = guard.write(buf)?;
        guard.flush()?;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.lock().flush()
    }
}

impl<'a> MakeWriter<'a> for LogFileWriter {
    type Writer = LogFileWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_write_line_appends() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("logs").join("test.jsonl");

        let writer = LogFileWriter::open(&path).unwrap();
        writer.write_line("{\"n\":1}").unwrap();
        writer.clone().write_line("{\"n\":2}").unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "{\"n\":1}\n{\"n\":2}\n");
    }

    #[test]
    fn test_reopen_keeps_existing_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.jsonl");

        LogFileWriter::open(&path).unwrap().write_line("first").unwrap();
        LogFileWriter::open(&path).unwrap().write_line("second").unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().collect::<Vec<_>>(), vec!["first", "second"]);
    }

    #[test]
    fn test_default_log_path_uses_service_name() {
        let path = default_log_path("stream-queue");
        assert!(path.ends_with("stream-queue/logs/stream-queue.jsonl"));
    }
}
