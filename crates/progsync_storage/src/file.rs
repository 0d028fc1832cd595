//! File-based store for persistent queues.

use crate::batch::WriteBatch;
use crate::error::{StorageError, StorageResult};
use crate::memory::Tables;
use crate::store::{KeyRange, KvStore};
use parking_lot::{Mutex, RwLock};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Magic bytes identifying a progsync log file.
pub const LOG_MAGIC: [u8; 4] = *b"PSLG";

/// Current log format version.
pub const LOG_VERSION: u16 = 1;

const HEADER_LEN: u64 = 6;
const FRAME_HEADER_LEN: usize = 8;

/// Configuration for a [`FileStore`].
#[derive(Debug, Clone)]
pub struct FileStoreConfig {
    /// Number of committed batches after which the log is compacted.
    /// `None` disables automatic compaction.
    pub compact_after_commits: Option<u64>,
}

impl FileStoreConfig {
    /// Sets the automatic compaction threshold.
    #[must_use]
    pub fn with_compact_after_commits(mut self, commits: u64) -> Self {
        self.compact_after_commits = Some(commits);
        self
    }

    /// Disables automatic compaction.
    #[must_use]
    pub fn without_auto_compaction(mut self) -> Self {
        self.compact_after_commits = None;
        self
    }
}

impl Default for FileStoreConfig {
    fn default() -> Self {
        Self {
            compact_after_commits: Some(1024),
        }
    }
}

#[derive(Debug)]
struct LogWriter {
    file: File,
    size: u64,
    commits_since_compaction: u64,
}

/// A file-based store.
///
/// Every [`WriteBatch`] is appended to a log file as one checksummed frame
/// and synced before the write returns. On open the log is replayed into
/// memory; a torn or corrupt tail (from a crash mid-append) is truncated
/// away, so a batch is either fully visible after restart or not at all.
///
/// # Format
///
/// ```text
/// | magic "PSLG" | version u16 LE | frame* |
/// frame = | len u32 LE | crc32 u32 LE | cbor(WriteBatch) |
/// ```
///
/// # Example
///
/// ```no_run
/// use progsync_storage::{FileStore, KvStore};
/// use std::path::Path;
///
/// let store = FileStore::open(Path::new("queue.log")).unwrap();
/// store.put("operations", b"id", b"record").unwrap();
/// ```
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    config: FileStoreConfig,
    writer: Mutex<LogWriter>,
    tables: RwLock<Tables>,
}

impl FileStore {
    /// Opens or creates a store at the given path with default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened, or if its header does
    /// not identify a progsync log.
    pub fn open(path: &Path) -> StorageResult<Self> {
        Self::open_with_config(path, FileStoreConfig::default())
    }

    /// Opens or creates a store, creating parent directories if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if directories cannot be created or the file cannot
    /// be opened.
    pub fn open_with_create_dirs(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::open(path)
    }

    /// Opens or creates a store with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened, or if its header does
    /// not identify a progsync log.
    pub fn open_with_config(path: &Path, config: FileStoreConfig) -> StorageResult<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;

        let (tables, valid_len, frames) = if bytes.is_empty() {
            file.write_all(&header_bytes())?;
            file.sync_all()?;
            (Tables::default(), HEADER_LEN, 0)
        } else {
            replay(&bytes)?
        };

        if valid_len < bytes.len() as u64 {
            warn!(
                path = %path.display(),
                discarded = bytes.len() as u64 - valid_len,
                "truncating torn tail of sync log"
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        file.seek(SeekFrom::End(0))?;

        debug!(path = %path.display(), frames, rows = tables.row_count(), "opened sync log");

        Ok(Self {
            path: path.to_path_buf(),
            config,
            writer: Mutex::new(LogWriter {
                file,
                size: valid_len,
                commits_since_compaction: frames,
            }),
            tables: RwLock::new(tables),
        })
    }

    /// Returns the path to the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the current size of the log file in bytes.
    #[must_use]
    pub fn log_size(&self) -> u64 {
        self.writer.lock().size
    }

    /// Rewrites the log as a single snapshot frame of the live rows.
    ///
    /// The snapshot is written to a sibling file, synced, and renamed over
    /// the log, so a crash during compaction leaves the old log intact.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be written or renamed.
    pub fn compact(&self) -> StorageResult<()> {
        let mut writer = self.writer.lock();
        self.compact_locked(&mut writer)
    }

    fn compact_locked(&self, writer: &mut LogWriter) -> StorageResult<()> {
        let snapshot = self.tables.read().snapshot();
        let tmp_path = self.path.with_extension("compacting");

        let mut bytes = header_bytes().to_vec();
        if !snapshot.is_empty() {
            bytes.extend_from_slice(&encode_frame(&snapshot)?);
        }

        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(&bytes)?;
            tmp.sync_all()?;
        }
        std::fs::rename(&tmp_path, &self.path)?;

        let mut file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        file.seek(SeekFrom::End(0))?;

        let before = writer.size;
        writer.file = file;
        writer.size = bytes.len() as u64;
        writer.commits_since_compaction = 0;

        debug!(before, after = writer.size, "compacted sync log");
        Ok(())
    }
}

impl KvStore for FileStore {
    fn get(&self, table: &str, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.tables.read().get(table, key))
    }

    fn scan(&self, table: &str, range: &KeyRange) -> StorageResult<Vec<(Vec<u8>, Vec<u8>)>> {
        Ok(self.tables.read().scan(table, range))
    }

    fn write_batch(&self, batch: WriteBatch) -> StorageResult<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let frame = encode_frame(&batch)?;
        let mut writer = self.writer.lock();

        if let Err(e) = append_durably(&mut writer.file, &frame) {
            // Drop whatever partial frame made it to disk.
            let size = writer.size;
            if let Err(truncate_err) = writer.file.set_len(size) {
                warn!(error = %truncate_err, "failed to roll back partial frame");
            }
            return Err(e);
        }

        writer.size += frame.len() as u64;
        writer.commits_since_compaction += 1;
        self.tables.write().apply(&batch);

        if let Some(threshold) = self.config.compact_after_commits {
            if writer.commits_since_compaction >= threshold {
                // The batch is already durable; a failed compaction only
                // leaves a longer log behind.
                if let Err(e) = self.compact_locked(&mut writer) {
                    warn!(error = %e, "automatic compaction failed");
                }
            }
        }

        Ok(())
    }

    fn clear(&self) -> StorageResult<()> {
        let mut writer = self.writer.lock();
        writer.file.set_len(HEADER_LEN)?;
        writer.file.sync_all()?;
        writer.file.seek(SeekFrom::End(0))?;
        writer.size = HEADER_LEN;
        writer.commits_since_compaction = 0;
        self.tables.write().clear();
        Ok(())
    }
}

fn header_bytes() -> [u8; HEADER_LEN as usize] {
    let version = LOG_VERSION.to_le_bytes();
    [
        LOG_MAGIC[0],
        LOG_MAGIC[1],
        LOG_MAGIC[2],
        LOG_MAGIC[3],
        version[0],
        version[1],
    ]
}

fn append_durably(file: &mut File, frame: &[u8]) -> StorageResult<()> {
    file.seek(SeekFrom::End(0))?;
    file.write_all(frame)?;
    file.sync_data()?;
    Ok(())
}

fn encode_frame(batch: &WriteBatch) -> StorageResult<Vec<u8>> {
    let mut payload = Vec::new();
    ciborium::into_writer(batch, &mut payload).map_err(|e| StorageError::Codec(e.to_string()))?;

    let len = u32::try_from(payload.len())
        .map_err(|_| StorageError::Codec(format!("batch too large: {} bytes", payload.len())))?;

    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&compute_crc32(&payload).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Replays a log image, returning the tables, the length of the valid
/// prefix, and the number of frames applied.
fn replay(bytes: &[u8]) -> StorageResult<(Tables, u64, u64)> {
    if bytes.len() < HEADER_LEN as usize || bytes[..4] != LOG_MAGIC {
        return Err(StorageError::Corrupted("missing log header".into()));
    }
    let version = u16::from_le_bytes([bytes[4], bytes[5]]);
    if version != LOG_VERSION {
        return Err(StorageError::Corrupted(format!(
            "unsupported log version {version}"
        )));
    }

    let mut tables = Tables::default();
    let mut offset = HEADER_LEN as usize;
    let mut frames = 0u64;

    while offset + FRAME_HEADER_LEN <= bytes.len() {
        let len = u32::from_le_bytes([
            bytes[offset],
            bytes[offset + 1],
            bytes[offset + 2],
            bytes[offset + 3],
        ]) as usize;
        let crc = u32::from_le_bytes([
            bytes[offset + 4],
            bytes[offset + 5],
            bytes[offset + 6],
            bytes[offset + 7],
        ]);

        let start = offset + FRAME_HEADER_LEN;
        let Some(end) = start.checked_add(len).filter(|end| *end <= bytes.len()) else {
            break;
        };

        let payload = &bytes[start..end];
        if compute_crc32(payload) != crc {
            break;
        }

        let batch: WriteBatch = match ciborium::from_reader(payload) {
            Ok(batch) => batch,
            Err(_) => break,
        };

        tables.apply(&batch);
        frames += 1;
        offset = end;
    }

    Ok((tables, offset as u64, frames))
}

/// Computes CRC32 checksum for data.
pub fn compute_crc32(data: &[u8]) -> u32 {
    // IEEE polynomial, table built at compile time
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn crc32_known_value() {
        assert_eq!(compute_crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(compute_crc32(b""), 0);
    }

    #[test]
    fn file_create_new() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.log");

        let store = FileStore::open(&path).unwrap();
        assert!(path.exists());
        assert_eq!(store.log_size(), HEADER_LEN);
        assert_eq!(store.path(), path);
    }

    #[test]
    fn file_persistence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.log");

        {
            let store = FileStore::open(&path).unwrap();
            store.put("ops", b"a", b"1").unwrap();
            store.put("ops", b"b", b"2").unwrap();
            store.delete("ops", b"a").unwrap();
        }

        let store = FileStore::open(&path).unwrap();
        assert_eq!(store.get("ops", b"a").unwrap(), None);
        assert_eq!(store.get("ops", b"b").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn file_torn_tail_is_truncated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.log");

        let good_size = {
            let store = FileStore::open(&path).unwrap();
            store.put("ops", b"a", b"1").unwrap();
            store.log_size()
        };

        // Simulate a crash halfway through appending a frame
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&[42, 0, 0, 0, 1, 2]).unwrap();
        }

        let store = FileStore::open(&path).unwrap();
        assert_eq!(store.log_size(), good_size);
        assert_eq!(store.get("ops", b"a").unwrap(), Some(b"1".to_vec()));

        // The log remains appendable after truncation
        store.put("ops", b"b", b"2").unwrap();
        drop(store);
        let store = FileStore::open(&path).unwrap();
        assert_eq!(store.get("ops", b"b").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn file_corrupt_frame_discards_rest() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.log");

        {
            let store = FileStore::open(&path).unwrap();
            store.put("ops", b"a", b"1").unwrap();
            store.put("ops", b"b", b"2").unwrap();
        }

        // Flip the last byte of the second frame's payload
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let store = FileStore::open(&path).unwrap();
        assert_eq!(store.get("ops", b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.get("ops", b"b").unwrap(), None);
    }

    #[test]
    fn file_rejects_foreign_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.log");
        std::fs::write(&path, b"not a log file").unwrap();

        let result = FileStore::open(&path);
        assert!(matches!(result, Err(StorageError::Corrupted(_))));
    }

    #[test]
    fn file_compaction_preserves_rows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.log");

        let store = FileStore::open_with_config(
            &path,
            FileStoreConfig::default().without_auto_compaction(),
        )
        .unwrap();
        for i in 0..20u8 {
            store.put("ops", &[i % 4], &[i]).unwrap();
        }
        let before = store.log_size();

        store.compact().unwrap();
        assert!(store.log_size() < before);
        assert_eq!(store.scan("ops", &KeyRange::All).unwrap().len(), 4);

        store.put("ops", &[9], b"after").unwrap();
        drop(store);

        let store = FileStore::open(&path).unwrap();
        assert_eq!(store.get("ops", &[3]).unwrap(), Some(vec![19]));
        assert_eq!(store.get("ops", &[9]).unwrap(), Some(b"after".to_vec()));
    }

    #[test]
    fn file_auto_compaction() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.log");

        let store = FileStore::open_with_config(
            &path,
            FileStoreConfig::default().with_compact_after_commits(5),
        )
        .unwrap();
        for _ in 0..5 {
            store.put("ops", b"same", b"value").unwrap();
        }

        // One snapshot frame holding a single row
        drop(store);
        let bytes = std::fs::read(&path).unwrap();
        let (tables, _, frames) = replay(&bytes).unwrap();
        assert_eq!(frames, 1);
        assert_eq!(tables.row_count(), 1);
    }

    #[test]
    fn file_clear() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.log");

        let store = FileStore::open(&path).unwrap();
        store.put("ops", b"a", b"1").unwrap();
        store.clear().unwrap();
        assert_eq!(store.get("ops", b"a").unwrap(), None);
        drop(store);

        let store = FileStore::open(&path).unwrap();
        assert_eq!(store.get("ops", b"a").unwrap(), None);
        assert_eq!(store.log_size(), HEADER_LEN);
    }

    #[test]
    fn file_create_with_dirs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("queue.log");

        let store = FileStore::open_with_create_dirs(&path).unwrap();
        assert!(path.exists());
        assert_eq!(store.log_size(), HEADER_LEN);
    }
}
