//! Read side of the job log

use simrun_core::domain::log::LogLine;
use std::collections::VecDeque;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::warn;
use uuid::Uuid;

use super::MAX_TAIL_LINES;
use crate::error::Result;
use crate::repository::JobStore;

/// All complete lines of a log file; a missing file is an empty log
pub async fn read_lines(path: &Path) -> std::io::Result<Vec<LogLine>> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let complete = bytes.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);
    Ok(parse_lines(&bytes[..complete]))
}

/// The last `n` lines of a log, with `n` clamped to `1..=10_000`
pub async fn tail(path: &Path, n: usize) -> std::io::Result<Vec<LogLine>> {
    let n = n.clamp(1, MAX_TAIL_LINES);
    let mut lines = read_lines(path).await?;
    let skip = lines.len().saturating_sub(n);
    Ok(lines.split_off(skip))
}

fn parse_lines(bytes: &[u8]) -> Vec<LogLine> {
    bytes
        .split(|b| *b == b'\n')
        .filter(|raw| !raw.is_empty())
        .filter_map(|raw| match serde_json::from_slice::<LogLine>(raw) {
            Ok(line) => Some(line),
            Err(e) => {
                warn!(error = %e, "Skipping malformed log line");
                None
            }
        })
        .collect()
}

/// Follows a job log from a starting sequence number
///
/// `next` yields lines as they are appended. Once the log is drained and the
/// job is terminal it returns `None`; until then it waits and polls again.
/// Dropping the stream and opening a new one restarts it.
pub struct LogStream {
    job_id: Uuid,
    path: PathBuf,
    store: Arc<dyn JobStore>,
    poll_interval: Duration,
    from_seq: u64,
    offset: u64,
    pending: VecDeque<LogLine>,
    finished: bool,
}

impl LogStream {
    pub(crate) fn new(
        job_id: Uuid,
        path: PathBuf,
        store: Arc<dyn JobStore>,
        poll_interval: Duration,
        from_seq: u64,
    ) -> Self {
        Self {
            job_id,
            path,
            store,
            poll_interval,
            from_seq,
            offset: 0,
            pending: VecDeque::new(),
            finished: false,
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub async fn next(&mut self) -> Result<Option<LogLine>> {
        loop {
            if let Some(line) = self.pending.pop_front() {
                return Ok(Some(line));
            }
            if self.finished {
                return Ok(None);
            }

            // Check terminal state before reading so no line written before
            // finalization can be missed
            let terminal = self
                .store
                .get(self.job_id)
                .await?
                .is_none_or(|job| job.is_terminal());

            self.read_more().await?;

            if self.pending.is_empty() {
                if terminal {
                    self.finished = true;
                } else {
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }

    /// Collects every remaining line, waiting for the job to finish
    pub async fn collect_all(mut self) -> Result<Vec<LogLine>> {
        let mut lines = Vec::new();
        while let Some(line) = self.next().await? {
            lines.push(line);
        }
        Ok(lines)
    }

    async fn read_more(&mut self) -> std::io::Result<()> {
        let mut file = match tokio::fs::File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        file.seek(SeekFrom::Start(self.offset)).await?;

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes).await?;

        let Some(last_newline) = bytes.iter().rposition(|b| *b == b'\n') else {
            return Ok(());
        };
        let complete = &bytes[..=last_newline];
        self.offset += complete.len() as u64;

        let from_seq = self.from_seq;
        self.pending
            .extend(parse_lines(complete).into_iter().filter(|l| l.seq >= from_seq));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logs::LogWriter;
    use crate::repository::InMemoryJobStore;
    use chrono::Utc;
    use simrun_core::domain::job::{JobOutcome, SimulationJob};
    use simrun_core::domain::log::LogSource;
    use simrun_core::dto::job::SubmitJob;
    use std::io::Write;

    async fn running_job(store: &InMemoryJobStore) -> SimulationJob {
        let mut job = SimulationJob::from_submission(SubmitJob::new("a", "run 1", 1), Utc::now());
        job.mark_queued(Utc::now()).unwrap();
        job.mark_running(Utc::now()).unwrap();
        store.insert(&job).await.unwrap();
        job
    }

    #[tokio::test]
    async fn test_partial_lines_are_not_visible() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.log");
        let mut writer = LogWriter::open(&path, 1).await.unwrap();
        writer.append(LogSource::Stdout, "complete").await.unwrap();

        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"seq\":1,\"timest").unwrap();

        let lines = read_lines(&path).await.unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].message, "complete");
    }

    #[tokio::test]
    async fn test_tail_clamps_request() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.log");
        let mut writer = LogWriter::open(&path, 1).await.unwrap();
        for i in 0..5 {
            writer.append(LogSource::Stdout, format!("line {}", i)).await.unwrap();
        }

        let last_two = tail(&path, 2).await.unwrap();
        assert_eq!(last_two.iter().map(|l| l.seq).collect::<Vec<_>>(), vec![3, 4]);

        assert_eq!(tail(&path, 0).await.unwrap().len(), 1);
        assert_eq!(tail(&path, usize::MAX).await.unwrap().len(), 5);
        assert!(tail(&dir.path().join("missing.log"), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stream_follows_until_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.log");
        let store = InMemoryJobStore::new();
        let mut job = running_job(&store).await;

        let mut stream = LogStream::new(
            job.id,
            path.clone(),
            Arc::new(store.clone()),
            Duration::from_millis(10),
            0,
        );

        let mut writer = LogWriter::open(&path, 1).await.unwrap();
        writer.append(LogSource::Stdout, "first").await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap().message, "first");

        let writer_task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            writer.append(LogSource::Stdout, "second").await.unwrap();
            job.finish(JobOutcome::completed(Vec::new()), Utc::now()).unwrap();
            store.update(&job).await.unwrap();
        });

        assert_eq!(stream.next().await.unwrap().unwrap().message, "second");
        writer_task.await.unwrap();
        assert!(stream.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stream_from_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.log");
        let store = InMemoryJobStore::new();
        let mut job = running_job(&store).await;

        let mut writer = LogWriter::open(&path, 1).await.unwrap();
        for i in 0..4 {
            writer.append(LogSource::Stdout, format!("line {}", i)).await.unwrap();
        }
        job.finish(JobOutcome::completed(Vec::new()), Utc::now()).unwrap();
        store.update(&job).await.unwrap();

        let stream = LogStream::new(job.id, path, Arc::new(store), Duration::from_millis(10), 2);
        let lines = stream.collect_all().await.unwrap();
        assert_eq!(lines.iter().map(|l| l.seq).collect::<Vec<_>>(), vec![2, 3]);
    }
}
