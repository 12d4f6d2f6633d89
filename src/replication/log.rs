//! The replication log (spec.md §3, §4.7, §6): an append-only, head-
//! truncated byte file holding length-prefixed encoded
//! `DownstreamMessage`s. A record is `<decimal-length>";"<bytes>`; a record
//! is either wholly present or wholly absent (crash-atomic
//! write-then-fsync); after a successful fan-out of a prefix, that prefix
//! is removed from the file head and the file truncated to the remainder.
//!
//! All read/write/truncate critical sections are serialized by a single
//! mutex (spec.md §5), so the broker's appends and the shipper's
//! read-then-truncate cycle never interleave unsafely.

use std::path::{Path, PathBuf};

use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::errors::{AppError, AppResult};

pub struct ReplicationLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl ReplicationLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Append one record (`<decimal-length>";"<bytes>`) and fsync before
    /// returning. The broker does not enqueue the next message until this
    /// resolves (spec.md §4.7 step 4).
    pub async fn append(&self, record: &[u8]) -> AppResult<()> {
        let _guard = self.lock.lock().await;
        let header = format!("{};", record.len());

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| AppError::StateFatal(format!("cannot open replication log: {e}")))?;
        file.write_all(header.as_bytes())
            .await
            .map_err(|e| AppError::StateFatal(format!("replication log write failed: {e}")))?;
        file.write_all(record)
            .await
            .map_err(|e| AppError::StateFatal(format!("replication log write failed: {e}")))?;
        file.sync_all()
            .await
            .map_err(|e| AppError::StateFatal(format!("replication log fsync failed: {e}")))?;
        Ok(())
    }

    /// Append already-framed bytes verbatim (no extra length header). Used
    /// to persist an inbound batch, which is itself the raw concatenation
    /// of length-prefixed records read off a peer's log (spec.md §4.7,
    /// §4.8) and would be double-framed by [`Self::append`].
    pub async fn append_raw(&self, framed_records: &[u8]) -> AppResult<()> {
        let _guard = self.lock.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| AppError::StateFatal(format!("cannot open replication log: {e}")))?;
        file.write_all(framed_records)
            .await
            .map_err(|e| AppError::StateFatal(format!("replication log write failed: {e}")))?;
        file.sync_all()
            .await
            .map_err(|e| AppError::StateFatal(format!("replication log fsync failed: {e}")))?;
        Ok(())
    }

    /// Read the entire current file (spec.md §4.7 shipper steps 1-2).
    /// Returns an empty buffer if the log doesn't exist yet.
    pub async fn read_snapshot(&self) -> AppResult<Vec<u8>> {
        let _guard = self.lock.lock().await;
        read_or_empty(&self.path).await
    }

    /// Remove the first `prefix_len` bytes (a shipped batch) from the file
    /// head, re-reading the current file first so records appended during
    /// shipping are preserved (spec.md §4.7 step 5).
    pub async fn truncate_prefix(&self, prefix_len: usize) -> AppResult<()> {
        let _guard = self.lock.lock().await;
        let data = read_or_empty(&self.path).await?;
        if prefix_len > data.len() {
            return Err(AppError::StateFatal(format!(
                "cannot truncate {prefix_len} bytes from a {}-byte log",
                data.len()
            )));
        }
        let suffix = &data[prefix_len..];

        let mut file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&self.path)
            .await
            .map_err(|e| AppError::StateFatal(format!("cannot reopen replication log: {e}")))?;
        file.write_all(suffix)
            .await
            .map_err(|e| AppError::StateFatal(format!("replication log truncate failed: {e}")))?;
        file.sync_all()
            .await
            .map_err(|e| AppError::StateFatal(format!("replication log fsync failed: {e}")))?;
        Ok(())
    }
}

async fn read_or_empty(path: &Path) -> AppResult<Vec<u8>> {
    match tokio::fs::read(path).await {
        Ok(data) => Ok(data),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(AppError::StateFatal(format!("cannot read replication log: {e}"))),
    }
}

/// Split a buffer of `<decimal-length>";"<bytes>` records into the
/// individual record payloads, for decoding or for locating batch
/// boundaries. Errors on a truncated trailing record (should never happen
/// given crash-atomic appends, but guards against a corrupted file).
pub fn parse_records(data: &[u8]) -> AppResult<Vec<&[u8]>> {
    let mut records = Vec::new();
    let mut offset = 0;
    while offset < data.len() {
        let sep = data[offset..]
            .iter()
            .position(|&b| b == b';')
            .ok_or_else(|| AppError::StateFatal("replication log: missing length separator".into()))?;
        let len_str = std::str::from_utf8(&data[offset..offset + sep])
            .map_err(|_| AppError::StateFatal("replication log: non-ascii record length".into()))?;
        let len: usize = len_str
            .parse()
            .map_err(|_| AppError::StateFatal(format!("replication log: invalid record length '{len_str}'")))?;
        let record_start = offset + sep + 1;
        let record_end = record_start + len;
        if record_end > data.len() {
            return Err(AppError::StateFatal(
                "replication log: truncated trailing record".into(),
            ));
        }
        records.push(&data[record_start..record_end]);
        offset = record_end;
    }
    Ok(records)
}

/// Encode one record (`<decimal-length>";"<bytes>`) for appending.
pub fn encode_record(payload: &[u8]) -> Vec<u8> {
    let mut out = format!("{};", payload.len()).into_bytes();
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_then_read_snapshot_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let log = ReplicationLog::new(dir.path().join("repl.log"));
        log.append(&encode_record(b"one")).await.unwrap();
        log.append(&encode_record(b"two")).await.unwrap();

        let snapshot = log.read_snapshot().await.unwrap();
        let records = parse_records(&snapshot).unwrap();
        assert_eq!(records, vec![b"one".as_slice(), b"two".as_slice()]);
    }

    #[tokio::test]
    async fn missing_file_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log = ReplicationLog::new(dir.path().join("nonexistent.log"));
        assert!(log.read_snapshot().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn truncate_prefix_removes_shipped_bytes_and_keeps_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let log = ReplicationLog::new(dir.path().join("repl.log"));
        log.append(&encode_record(b"one")).await.unwrap();
        log.append(&encode_record(b"two")).await.unwrap();
        let shipped_len = log.read_snapshot().await.unwrap().len();

        log.append(&encode_record(b"three")).await.unwrap();
        log.truncate_prefix(shipped_len).await.unwrap();

        let remaining = log.read_snapshot().await.unwrap();
        let records = parse_records(&remaining).unwrap();
        assert_eq!(records, vec![b"three".as_slice()]);
    }

    #[tokio::test]
    async fn truncating_the_full_log_yields_zero_size() {
        let dir = tempfile::tempdir().unwrap();
        let log = ReplicationLog::new(dir.path().join("repl.log"));
        log.append(&encode_record(b"one")).await.unwrap();
        log.append(&encode_record(b"two")).await.unwrap();
        log.append(&encode_record(b"three")).await.unwrap();
        let full_len = log.read_snapshot().await.unwrap().len();

        log.truncate_prefix(full_len).await.unwrap();
        assert!(log.read_snapshot().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn append_raw_preserves_multi_record_framing() {
        let dir = tempfile::tempdir().unwrap();
        let log = ReplicationLog::new(dir.path().join("repl.log"));
        let mut batch = encode_record(b"one");
        batch.extend_from_slice(&encode_record(b"two"));
        log.append_raw(&batch).await.unwrap();

        let snapshot = log.read_snapshot().await.unwrap();
        let records = parse_records(&snapshot).unwrap();
        assert_eq!(records, vec![b"one".as_slice(), b"two".as_slice()]);
    }

    #[test]
    fn parse_records_rejects_truncated_trailing_record() {
        let mut data = encode_record(b"ok");
        data.extend_from_slice(b"5;ab");
        assert!(parse_records(&data).is_err());
    }
}
