//! Append side of the job log

use chrono::Utc;
use simrun_core::domain::log::{LogLine, LogSource};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

use super::read_lines;

/// Appends engine output to a job log
///
/// Sequence numbers continue from whatever the file already holds, so a job
/// retried after a worker fault keeps one contiguous log.
pub struct LogWriter {
    path: PathBuf,
    file: File,
    next_seq: u64,
    stderr_tail: VecDeque<String>,
    tail_capacity: usize,
}

impl LogWriter {
    pub async fn open(path: &Path, tail_capacity: usize) -> std::io::Result<Self> {
        let next_seq = read_lines(path).await?.last().map(|l| l.seq + 1).unwrap_or(0);
        let file = OpenOptions::new().create(true).append(true).open(path).await?;

        Ok(Self {
            path: path.to_path_buf(),
            file,
            next_seq,
            stderr_tail: VecDeque::with_capacity(tail_capacity),
            tail_capacity,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&mut self, source: LogSource, message: impl Into<String>) -> std::io::Result<()> {
        let line = LogLine {
            seq: self.next_seq,
            timestamp: Utc::now(),
            source,
            message: message.into(),
        };

        let mut encoded = serde_json::to_vec(&line)?;
        encoded.push(b'\n');
        self.file.write_all(&encoded).await?;
        self.file.flush().await?;
        self.next_seq += 1;

        if source == LogSource::Stderr && self.tail_capacity > 0 {
            if self.stderr_tail.len() == self.tail_capacity {
                self.stderr_tail.pop_front();
            }
            self.stderr_tail.push_back(line.message);
        }
        Ok(())
    }

    /// Last stderr lines written through this writer, oldest first
    pub fn stderr_tail(&self) -> Vec<String> {
        self.stderr_tail.iter().cloned().collect()
    }
}
