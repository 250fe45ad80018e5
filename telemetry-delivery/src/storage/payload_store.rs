//! Quota-bounded, gzip-compressed blob store.
//!
//! One file per stored unit, named by its [`StoredTelemetryMetadata`] key.
//! Writes go to a temp file in the same directory and are renamed into place,
//! so readers never observe a partially written blob.

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use parking_lot::Mutex;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::metadata::StoredTelemetryMetadata;
use crate::diagnostics::{DiagnosticKind, DiagnosticsSink, run_guarded};

/// Prefix of in-flight temp files; never decoded as entries.
const TEMP_PREFIX: &str = ".tmp-";

/// Message attached to every prune diagnostic.
pub const PRUNE_MESSAGE: &str = "Pruned payload storage";

/// Decompressing reader over a stored blob.
pub type PayloadReader = GzDecoder<BufReader<File>>;

/// Errors raised by the payload store.
#[derive(Debug)]
pub enum PayloadStoreError {
    /// File system operation failed
    Io { context: &'static str, source: io::Error },
    /// The caller's writer returned an error
    Writer(io::Error),
    /// The caller's writer panicked
    WriterPanicked(String),
}

impl PayloadStoreError {
    pub(crate) fn io(context: &'static str, source: io::Error) -> Self {
        PayloadStoreError::Io { context, source }
    }
}

impl std::fmt::Display for PayloadStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PayloadStoreError::Io { context, source } => write!(f, "{}: {}", context, source),
            PayloadStoreError::Writer(e) => write!(f, "payload writer failed: {}", e),
            PayloadStoreError::WriterPanicked(msg) => write!(f, "payload writer panicked: {}", msg),
        }
    }
}

impl std::error::Error for PayloadStoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PayloadStoreError::Io { source, .. } => Some(source),
            PayloadStoreError::Writer(e) => Some(e),
            PayloadStoreError::WriterPanicked(_) => None,
        }
    }
}

pub struct PayloadStore {
    dir: PathBuf,
    max_entries: usize,
    diagnostics: Arc<dyn DiagnosticsSink>,
    /// Serializes quota enforcement so two prunes never race on the same listing
    quota_lock: Mutex<()>,
}

impl PayloadStore {
    pub fn new(dir: impl Into<PathBuf>, max_entries: usize, diagnostics: Arc<dyn DiagnosticsSink>) -> Self {
        Self {
            dir: dir.into(),
            max_entries,
            diagnostics,
            quota_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Stream a payload into the store through `write`, replacing any blob
    /// stored under the same key, then enforce the quota.
    ///
    /// Returns the entries deleted by quota enforcement (possibly including
    /// the one just written). Failures are reported to diagnostics and leave
    /// no file behind.
    pub fn store<F>(
        &self,
        metadata: &StoredTelemetryMetadata,
        write: F,
    ) -> Result<Vec<StoredTelemetryMetadata>, PayloadStoreError>
    where
        F: FnOnce(&mut dyn Write) -> io::Result<()>,
    {
        if let Err(e) = self.write_atomically(metadata, write) {
            self.diagnostics.report(
                DiagnosticKind::PayloadStoreFail,
                &format!("Failed to store payload {}", metadata.filename()),
                Some(&e),
            );
            return Err(e);
        }
        log::debug!("[PAYLOAD_STORE] Stored {}", metadata.filename());
        Ok(self.enforce_quota(self.max_entries))
    }

    /// Convenience wrapper around [`store`](Self::store) for in-memory bytes.
    pub fn store_bytes(
        &self,
        metadata: &StoredTelemetryMetadata,
        bytes: &[u8],
    ) -> Result<Vec<StoredTelemetryMetadata>, PayloadStoreError> {
        self.store(metadata, |out| out.write_all(bytes))
    }

    fn write_atomically<F>(&self, metadata: &StoredTelemetryMetadata, write: F) -> Result<(), PayloadStoreError>
    where
        F: FnOnce(&mut dyn Write) -> io::Result<()>,
    {
        fs::create_dir_all(&self.dir).map_err(|e| PayloadStoreError::io("create storage directory", e))?;

        let tmp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(&self.dir)
            .map_err(|e| PayloadStoreError::io("create temp file", e))?;

        let mut encoder = GzEncoder::new(BufWriter::new(tmp), Compression::default());
        match run_guarded(|| write(&mut encoder)) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(PayloadStoreError::Writer(e)),
            Err(panic) => return Err(PayloadStoreError::WriterPanicked(panic.0)),
        }

        let buffered = encoder
            .finish()
            .map_err(|e| PayloadStoreError::io("finish compression", e))?;
        let tmp = buffered
            .into_inner()
            .map_err(|e| PayloadStoreError::io("flush payload", e.into_error()))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| PayloadStoreError::io("sync payload", e))?;
        tmp.persist(self.path_for(metadata))
            .map_err(|e| PayloadStoreError::io("rename payload into place", e.error))?;
        Ok(())
    }

    /// Open a decompressing stream over a stored payload.
    ///
    /// `Ok(None)` means nothing is stored under the key. Other failures are
    /// reported to diagnostics and returned.
    pub fn load(&self, metadata: &StoredTelemetryMetadata) -> Result<Option<PayloadReader>, PayloadStoreError> {
        match File::open(self.path_for(metadata)) {
            Ok(file) => Ok(Some(GzDecoder::new(BufReader::new(file)))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => {
                let err = PayloadStoreError::io("open payload", e);
                self.diagnostics.report(
                    DiagnosticKind::PayloadLoadFail,
                    &format!("Failed to load payload {}", metadata.filename()),
                    Some(&err),
                );
                Err(err)
            }
        }
    }

    /// Load and fully decompress a stored payload.
    pub fn load_bytes(&self, metadata: &StoredTelemetryMetadata) -> Result<Option<Vec<u8>>, PayloadStoreError> {
        let Some(mut reader) = self.load(metadata)? else {
            return Ok(None);
        };
        let mut bytes = Vec::new();
        match reader.read_to_end(&mut bytes) {
            Ok(_) => Ok(Some(bytes)),
            Err(e) => {
                let err = PayloadStoreError::io("decompress payload", e);
                self.diagnostics.report(
                    DiagnosticKind::PayloadLoadFail,
                    &format!("Failed to read payload {}", metadata.filename()),
                    Some(&err),
                );
                Err(err)
            }
        }
    }

    /// Delete a stored payload. Missing entries are ignored.
    pub fn delete(&self, metadata: &StoredTelemetryMetadata) {
        match fs::remove_file(self.path_for(metadata)) {
            Ok(()) => log::debug!("[PAYLOAD_STORE] Deleted {}", metadata.filename()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                let err = PayloadStoreError::io("delete payload", e);
                self.diagnostics.report(
                    DiagnosticKind::PayloadDeleteFail,
                    &format!("Failed to delete payload {}", metadata.filename()),
                    Some(&err),
                );
            }
        }
    }

    /// All decodable entries, sorted by kind priority then oldest first.
    /// Temp files and foreign files are skipped.
    pub fn stored(&self) -> Vec<StoredTelemetryMetadata> {
        let read_dir = match fs::read_dir(&self.dir) {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                let err = PayloadStoreError::io("list payloads", e);
                self.diagnostics
                    .report(DiagnosticKind::PayloadLoadFail, "Failed to list payload storage", Some(&err));
                return Vec::new();
            }
        };

        let mut entries: Vec<StoredTelemetryMetadata> = read_dir
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name().into_string().ok()?;
                if name.starts_with(TEMP_PREFIX) {
                    return None;
                }
                match StoredTelemetryMetadata::from_filename(&name) {
                    Ok(metadata) => Some(metadata),
                    Err(e) => {
                        log::debug!("[PAYLOAD_STORE] Skipping foreign file: {}", e);
                        None
                    }
                }
            })
            .collect();
        entries.sort();
        entries
    }

    /// Delete entries until at most `max_entries` remain, keeping higher
    /// priority kinds and, within a kind, the newest entries. Returns what
    /// was deleted.
    pub fn enforce_quota(&self, max_entries: usize) -> Vec<StoredTelemetryMetadata> {
        let _guard = self.quota_lock.lock();

        let mut entries = self.stored();
        if entries.len() <= max_entries {
            return Vec::new();
        }

        entries.sort_by(StoredTelemetryMetadata::retention_order);
        let pruned = entries.split_off(max_entries);
        for metadata in &pruned {
            self.delete(metadata);
        }

        log::info!(
            "[PAYLOAD_STORE] Pruned {} entries from {} (limit {})",
            pruned.len(),
            self.dir.display(),
            max_entries
        );
        self.diagnostics
            .report(DiagnosticKind::PayloadPruned, PRUNE_MESSAGE, None);
        pruned
    }

    /// Total bytes used by stored payloads.
    pub fn disk_usage_bytes(&self) -> u64 {
        self.stored()
            .iter()
            .filter_map(|metadata| fs::metadata(self.path_for(metadata)).ok())
            .map(|m| m.len())
            .sum()
    }

    fn path_for(&self, metadata: &StoredTelemetryMetadata) -> PathBuf {
        self.dir.join(metadata.filename())
    }
}
