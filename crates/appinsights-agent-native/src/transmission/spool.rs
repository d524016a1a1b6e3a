//! On-disk spool for undeliverable batches.
//!
//! Each spooled batch is one append-only `.trn` file: a small text header
//! (`length`, `contentEncoding`, `retryCount`) followed by a blank line and
//! the already-serialized body bytes. Files are named
//! `<unix-ms>-<seq>.trn` so oldest-first order falls out of the numeric
//! name parts. Total size is capped; making room evicts the oldest files.
//! Writes serialize under a file-level mutex, the replay reader uses its
//! own handles, and a file is only deleted once its batch is acknowledged.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, warn};

const SPOOL_EXTENSION: &str = "trn";

#[derive(Debug, Error)]
pub enum SpoolError {
    #[error("spool I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("record of {needed} bytes exceeds spool capacity of {capacity} bytes")]
    Full { needed: u64, capacity: u64 },
}

/// One spooled batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpoolRecord {
    /// Serialized (and possibly compressed) batch body.
    pub body: Vec<u8>,
    /// `Content-Encoding` the body was serialized with; empty for identity.
    pub content_encoding: String,
    /// Delivery attempts already made when the batch was spooled.
    pub retry_count: u32,
}

impl SpoolRecord {
    fn encoded_len(&self) -> u64 {
        (header_bytes(self).len() + self.body.len()) as u64
    }
}

fn header_bytes(record: &SpoolRecord) -> Vec<u8> {
    format!(
        "length:{}\ncontentEncoding:{}\nretryCount:{}\n\n",
        record.body.len(),
        record.content_encoding,
        record.retry_count
    )
    .into_bytes()
}

fn parse_record(bytes: &[u8]) -> Option<SpoolRecord> {
    let separator = bytes.windows(2).position(|window| window == b"\n\n")?;
    let header = std::str::from_utf8(&bytes[..separator]).ok()?;
    let body = bytes[separator + 2..].to_vec();

    let mut length = None;
    let mut content_encoding = String::new();
    let mut retry_count = 0;
    for line in header.lines() {
        let (key, value) = line.split_once(':')?;
        match key {
            "length" => length = value.parse::<usize>().ok(),
            "contentEncoding" => content_encoding = value.to_string(),
            "retryCount" => retry_count = value.parse().ok()?,
            _ => {}
        }
    }
    if length? != body.len() {
        return None;
    }
    Some(SpoolRecord {
        body,
        content_encoding,
        retry_count,
    })
}

pub struct TransmissionSpool {
    dir: PathBuf,
    max_total_bytes: u64,
    seq: AtomicU64,
    write_lock: Mutex<()>,
}

impl TransmissionSpool {
    /// Creates a spool over `dir`.
    ///
    /// The directory is created lazily on the first write, so construction
    /// never touches the filesystem.
    ///
    /// # Arguments
    ///
    /// * `dir` - Directory the `.trn` files live in
    /// * `max_total_bytes` - Total size cap across all spool files
    #[must_use]
    pub fn new(dir: PathBuf, max_total_bytes: u64) -> Self {
        Self {
            dir,
            max_total_bytes,
            seq: AtomicU64::new(0),
            write_lock: Mutex::new(()),
        }
    }

    /// Persists one batch, evicting the oldest files if the cap would be
    /// exceeded.
    ///
    /// # Arguments
    ///
    /// * `record` - The serialized batch with its encoding and attempt
    ///   count
    ///
    /// # Returns
    ///
    /// * `Ok(path)` - Path of the written `.trn` file
    /// * `Err(Full)` - The record alone exceeds the spool capacity
    /// * `Err(Io)` - The directory or file could not be written
    pub fn store(&self, record: &SpoolRecord) -> Result<PathBuf, SpoolError> {
        let needed = record.encoded_len();
        if needed > self.max_total_bytes {
            return Err(SpoolError::Full {
                needed,
                capacity: self.max_total_bytes,
            });
        }

        let _guard = match self.write_lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        fs::create_dir_all(&self.dir)?;
        self.make_room(needed)?;

        let unix_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| elapsed.as_millis() as u64);
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let path = self.dir.join(format!("{unix_ms}-{seq}.{SPOOL_EXTENSION}"));

        let mut contents = header_bytes(record);
        contents.extend_from_slice(&record.body);
        fs::write(&path, contents)?;
        debug!("spooled batch to {}", path.display());
        Ok(path)
    }

    /// Returns the oldest spooled batch without removing it; the caller
    /// removes it after the batch is acknowledged. Corrupt files are
    /// deleted and skipped.
    ///
    /// # Returns
    ///
    /// * `Ok(Some((path, record)))` - The oldest readable batch and the
    ///   path to delete on acknowledgment
    /// * `Ok(None)` - The spool is empty
    /// * `Err` - Listing or reading the directory failed
    pub fn take_oldest(&self) -> Result<Option<(PathBuf, SpoolRecord)>, SpoolError> {
        loop {
            let Some(path) = self.files()?.into_iter().next() else {
                return Ok(None);
            };
            match fs::read(&path) {
                Ok(bytes) => match parse_record(&bytes) {
                    Some(record) => return Ok(Some((path, record))),
                    None => {
                        warn!("removing corrupt spool file {}", path.display());
                        let _ = fs::remove_file(&path);
                    }
                },
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Deletes an acknowledged batch file.
    ///
    /// # Arguments
    ///
    /// * `path` - Path returned by [`take_oldest`](Self::take_oldest); a
    ///   file already gone is not an error
    pub fn remove(&self, path: &Path) {
        if let Err(e) = fs::remove_file(path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("failed to remove spool file {}: {e}", path.display());
            }
        }
    }

    /// Number of spool files currently on disk.
    pub fn file_count(&self) -> usize {
        self.files().map(|files| files.len()).unwrap_or(0)
    }

    /// Total size of all spool files, in bytes.
    pub fn total_bytes(&self) -> u64 {
        self.files()
            .map(|files| {
                files
                    .iter()
                    .filter_map(|path| fs::metadata(path).ok())
                    .map(|metadata| metadata.len())
                    .sum()
            })
            .unwrap_or(0)
    }

    /// Spool files ordered oldest first by their numeric name parts.
    fn files(&self) -> Result<Vec<PathBuf>, SpoolError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut files: Vec<(u64, u64, PathBuf)> = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(SPOOL_EXTENSION) {
                continue;
            }
            if let Some((unix_ms, seq)) = parse_file_name(&path) {
                files.push((unix_ms, seq, path));
            }
        }
        files.sort();
        Ok(files.into_iter().map(|(_, _, path)| path).collect())
    }

    fn make_room(&self, needed: u64) -> Result<(), SpoolError> {
        let files = self.files()?;
        let mut total: u64 = files
            .iter()
            .filter_map(|path| fs::metadata(path).ok())
            .map(|metadata| metadata.len())
            .sum();
        for path in files {
            if total + needed <= self.max_total_bytes {
                break;
            }
            let size = fs::metadata(&path).map(|metadata| metadata.len()).unwrap_or(0);
            warn!("spool over capacity, evicting {}", path.display());
            let _ = fs::remove_file(&path);
            total = total.saturating_sub(size);
        }
        Ok(())
    }
}

fn parse_file_name(path: &Path) -> Option<(u64, u64)> {
    let stem = path.file_stem()?.to_str()?;
    let (unix_ms, seq) = stem.split_once('-')?;
    Some((unix_ms.parse().ok()?, seq.parse().ok()?))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn record(body: &[u8], retry_count: u32) -> SpoolRecord {
        SpoolRecord {
            body: body.to_vec(),
            content_encoding: "gzip".to_string(),
            retry_count,
        }
    }

    fn new_spool(max_total_bytes: u64) -> (tempfile::TempDir, TransmissionSpool) {
        let dir = tempfile::tempdir().unwrap();
        let spool = TransmissionSpool::new(dir.path().to_path_buf(), max_total_bytes);
        (dir, spool)
    }

    #[test]
    fn stores_and_reads_back_oldest() {
        let (_dir, spool) = new_spool(1024 * 1024);
        spool.store(&record(b"first", 2)).unwrap();
        spool.store(&record(b"second", 0)).unwrap();

        let (path, read) = spool.take_oldest().unwrap().unwrap();
        assert_eq!(read.body, b"first");
        assert_eq!(read.content_encoding, "gzip");
        assert_eq!(read.retry_count, 2);

        // not removed until acknowledged
        assert_eq!(spool.file_count(), 2);
        spool.remove(&path);
        assert_eq!(spool.file_count(), 1);

        let (_, read) = spool.take_oldest().unwrap().unwrap();
        assert_eq!(read.body, b"second");
    }

    #[test]
    fn empty_spool_yields_none() {
        let (_dir, spool) = new_spool(1024);
        assert!(spool.take_oldest().unwrap().is_none());
        assert_eq!(spool.file_count(), 0);
        assert_eq!(spool.total_bytes(), 0);
    }

    #[test]
    fn header_round_trips() {
        let original = record(b"payload bytes", 3);
        let mut encoded = header_bytes(&original);
        encoded.extend_from_slice(&original.body);
        assert_eq!(parse_record(&encoded).unwrap(), original);
    }

    #[test]
    fn corrupt_files_are_skipped_and_deleted() {
        let (dir, spool) = new_spool(1024 * 1024);
        fs::write(dir.path().join("1-0.trn"), b"not a spool record").unwrap();
        spool.store(&record(b"good", 0)).unwrap();

        let (_, read) = spool.take_oldest().unwrap().unwrap();
        assert_eq!(read.body, b"good");
        // the corrupt file is gone
        assert_eq!(spool.file_count(), 1);
    }

    #[test]
    fn length_mismatch_is_corrupt() {
        assert!(parse_record(b"length:99\ncontentEncoding:\nretryCount:0\n\nshort").is_none());
    }

    #[test]
    fn oversized_record_is_rejected() {
        let (_dir, spool) = new_spool(16);
        let err = spool.store(&record(&[0_u8; 64], 0)).unwrap_err();
        assert!(matches!(err, SpoolError::Full { .. }));
    }

    #[test]
    fn cap_evicts_oldest_first() {
        let (_dir, spool) = new_spool(400);
        // Each record is ~46 bytes of header + 100 bytes of body.
        spool.store(&record(&[b'a'; 100], 0)).unwrap();
        spool.store(&record(&[b'b'; 100], 0)).unwrap();
        assert_eq!(spool.file_count(), 2);

        spool.store(&record(&[b'c'; 100], 0)).unwrap();
        // the first record was evicted to stay under the cap
        assert_eq!(spool.file_count(), 2);
        let (_, read) = spool.take_oldest().unwrap().unwrap();
        assert_eq!(read.body, vec![b'b'; 100]);
        assert!(spool.total_bytes() <= 400);
    }

    #[test]
    fn non_spool_files_are_ignored() {
        let (dir, spool) = new_spool(1024);
        fs::write(dir.path().join("notes.txt"), b"ignore me").unwrap();
        fs::write(dir.path().join("unparsable.trn"), b"x").unwrap();
        spool.store(&record(b"ok", 0)).unwrap();
        let (_, read) = spool.take_oldest().unwrap().unwrap();
        assert_eq!(read.body, b"ok");
    }
}
