//! Durable, append-only versioned store.
//!
//! Layout under the configured root:
//!
//! ```text
//! <root>/commits.log          one JSON line per commit (audit trail, advisory)
//! <root>/entries/<id>/v000001.json  one file per version of one logical entry
//! ```
//!
//! Every `append` is one commit: the record is serialized (large content
//! gzip-compressed), written to a temp sibling, fsynced, and atomically
//! renamed into place; the rename is the commit point. A crash before the
//! rename leaves the prior version observable, never a mix. All writers
//! serialize through a single mutex held for the duration of one commit;
//! reads never take it.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::domain::{EntryStatus, MemoryEntry, Operation};
use crate::error::{MemoryError, Result};

// =============================================================================
// Records
// =============================================================================

/// One version of one logical entry, as handed to and from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedRecord {
    pub entry: MemoryEntry,
    pub status: EntryStatus,
    pub op: Operation,
    pub committed_at: DateTime<Utc>,
    /// The deterministic fallback produced this entry's embedding.
    pub fallback_embedding: bool,
    /// Set when this entry was superseded by a consolidation merge.
    pub superseded_by: Option<Uuid>,
}

impl VersionedRecord {
    /// Wrap a fresh entry for its first commit.
    pub fn create(entry: MemoryEntry, fallback_embedding: bool) -> Self {
        Self {
            entry,
            status: EntryStatus::Active,
            op: Operation::Create,
            committed_at: Utc::now(),
            fallback_embedding,
            superseded_by: None,
        }
    }

    /// Wrap an updated entry (access tracking, decay) for commit.
    pub fn update(entry: MemoryEntry) -> Self {
        Self {
            entry,
            status: EntryStatus::Active,
            op: Operation::Update,
            committed_at: Utc::now(),
            fallback_embedding: false,
            superseded_by: None,
        }
    }

    /// Wrap a consolidation representative for its first commit.
    pub fn merge(entry: MemoryEntry, fallback_embedding: bool) -> Self {
        Self {
            entry,
            status: EntryStatus::Active,
            op: Operation::Merge,
            committed_at: Utc::now(),
            fallback_embedding,
            superseded_by: None,
        }
    }
}

/// On-disk form. Content may be gzip+base64 when it exceeds the threshold.
#[derive(Debug, Serialize, Deserialize)]
struct StoredRecord {
    id: Uuid,
    content: String,
    compressed: bool,
    embedding: Vec<f32>,
    importance: f64,
    tags: std::collections::BTreeSet<String>,
    source: String,
    created_at: DateTime<Utc>,
    last_accessed_at: DateTime<Utc>,
    access_count: u64,
    version: u64,
    status: EntryStatus,
    op: Operation,
    committed_at: DateTime<Utc>,
    fallback_embedding: bool,
    #[serde(default)]
    superseded_by: Option<Uuid>,
    #[serde(default)]
    decayed_at: Option<DateTime<Utc>>,
}

/// One line of `commits.log`.
#[derive(Debug, Serialize, Deserialize)]
struct CommitLine {
    seq: u64,
    entry_id: Uuid,
    version: u64,
    op: Operation,
    committed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
struct EntryMeta {
    version: u64,
    status: EntryStatus,
}

// =============================================================================
// Store
// =============================================================================

/// Append-only versioned repository on a filesystem path.
#[derive(Debug)]
pub struct VersionedStore {
    root: PathBuf,
    compression_threshold: usize,
    max_store_bytes: u64,
    /// Serializes all durable writes; held for the duration of one commit.
    commit_lock: tokio::sync::Mutex<()>,
    /// Latest version + status per logical entry. Maintained by the writer
    /// after each successful commit; readers only ever take the read side.
    versions: RwLock<HashMap<Uuid, EntryMeta>>,
    /// Latched on the first commit failure; writes then fail closed.
    faulted: AtomicBool,
    next_seq: AtomicU64,
    approx_bytes: AtomicU64,
}

impl VersionedStore {
    /// Open (creating if necessary) a store rooted at `root`.
    pub async fn open(
        root: impl Into<PathBuf>,
        compression_threshold: usize,
        max_store_bytes: u64,
    ) -> Result<Self> {
        let root = root.into();
        let entries_dir = root.join("entries");
        let dir = entries_dir.clone();
        tokio::task::spawn_blocking(move || std::fs::create_dir_all(&dir))
            .await
            .map_err(|e| MemoryError::Storage {
                path: entries_dir.clone(),
                source: std::io::Error::other(e),
            })?
            .map_err(|source| MemoryError::Storage {
                path: entries_dir,
                source,
            })?;

        Ok(Self {
            root,
            compression_threshold,
            max_store_bytes,
            commit_lock: tokio::sync::Mutex::new(()),
            versions: RwLock::new(HashMap::new()),
            faulted: AtomicBool::new(false),
            next_seq: AtomicU64::new(1),
            approx_bytes: AtomicU64::new(0),
        })
    }

    fn entry_dir(&self, id: Uuid) -> PathBuf {
        self.root.join("entries").join(id.to_string())
    }

    fn version_path(&self, id: Uuid, version: u64) -> PathBuf {
        self.entry_dir(id).join(format!("v{version:06}.json"))
    }

    fn log_path(&self) -> PathBuf {
        self.root.join("commits.log")
    }

    /// Whether the store refuses writes after an earlier fault.
    pub fn is_faulted(&self) -> bool {
        self.faulted.load(Ordering::Relaxed)
    }

    /// Re-admit writes after the underlying fault was resolved externally.
    pub fn clear_fault(&self) {
        self.faulted.store(false, Ordering::Relaxed);
        info!("storage fault cleared; writes re-enabled");
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Durably commit the next version of `record.entry`.
    ///
    /// Assigns the version number (1 for unseen ids, latest+1 otherwise),
    /// clamps importance, and returns the committed version. Writes to the
    /// same logical entry land in lock-acquisition order.
    pub async fn append(&self, mut record: VersionedRecord) -> Result<VersionedRecord> {
        if self.is_faulted() {
            return Err(MemoryError::FailClosed);
        }

        let guard = self.commit_lock.lock().await;

        let next_version = {
            let versions = self.versions.read().expect("versions lock poisoned");
            versions.get(&record.entry.id).map_or(1, |m| m.version + 1)
        };
        record.entry.version = next_version;
        record.entry.importance = MemoryEntry::clamp_importance(record.entry.importance);
        record.committed_at = Utc::now();

        let stored = self.to_stored(&record);
        let payload =
            serde_json::to_vec_pretty(&stored).map_err(|e| MemoryError::Storage {
                path: self.version_path(record.entry.id, next_version),
                source: std::io::Error::other(e),
            })?;

        let used = self.approx_bytes.load(Ordering::Relaxed);
        if used + payload.len() as u64 > self.max_store_bytes {
            return Err(MemoryError::StoreFull {
                used,
                limit: self.max_store_bytes,
            });
        }

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let line = CommitLine {
            seq,
            entry_id: record.entry.id,
            version: next_version,
            op: record.op,
            committed_at: record.committed_at,
        };

        let dir = self.entry_dir(record.entry.id);
        let final_path = self.version_path(record.entry.id, next_version);
        let log_path = self.log_path();
        let payload_len = payload.len() as u64;

        let io = tokio::task::spawn_blocking(move || {
            commit_blocking(&dir, &final_path, &payload, &log_path, &line)
        })
        .await;

        let outcome = match io {
            Ok(outcome) => outcome,
            Err(join_err) => {
                self.faulted.store(true, Ordering::Relaxed);
                error!(error = %join_err, "commit task failed; store is now fail-closed");
                return Err(MemoryError::Storage {
                    path: self.version_path(record.entry.id, next_version),
                    source: std::io::Error::other(join_err),
                });
            }
        };

        match outcome {
            Ok(()) => {
                self.versions
                    .write()
                    .expect("versions lock poisoned")
                    .insert(
                        record.entry.id,
                        EntryMeta {
                            version: next_version,
                            status: record.status,
                        },
                    );
                self.approx_bytes.fetch_add(payload_len, Ordering::Relaxed);
                drop(guard);
                debug!(
                    entry_id = %record.entry.id,
                    version = next_version,
                    op = %record.op,
                    "commit applied"
                );
                Ok(record)
            }
            Err((path, source)) => {
                self.faulted.store(true, Ordering::Relaxed);
                error!(
                    path = %path.display(),
                    error = %source,
                    "commit failed; store is now fail-closed"
                );
                Err(MemoryError::Storage { path, source })
            }
        }
    }

    /// Mark an entry deleted (pruned). History is retained.
    pub async fn mark_deleted(&self, id: Uuid) -> Result<VersionedRecord> {
        let latest = self.read_latest_any(id).await?;
        let record = VersionedRecord {
            status: EntryStatus::Deleted,
            op: Operation::Delete,
            committed_at: Utc::now(),
            ..latest
        };
        self.append(record).await
    }

    /// Mark an entry superseded by a consolidation representative.
    pub async fn mark_superseded(&self, id: Uuid, successor: Uuid) -> Result<VersionedRecord> {
        let latest = self.read_latest_any(id).await?;
        let record = VersionedRecord {
            status: EntryStatus::Superseded,
            op: Operation::Merge,
            committed_at: Utc::now(),
            superseded_by: Some(successor),
            ..latest
        };
        self.append(record).await
    }

    // =========================================================================
    // Reads (lock-free with respect to the commit lock)
    // =========================================================================

    /// Read the latest version of an active entry.
    pub async fn read(&self, id: Uuid) -> Result<VersionedRecord> {
        let meta = {
            let versions = self.versions.read().expect("versions lock poisoned");
            versions.get(&id).copied()
        };
        let meta = meta.ok_or(MemoryError::NotFound(id))?;
        if meta.status != EntryStatus::Active {
            return Err(MemoryError::NotFound(id));
        }
        self.read_version(id, meta.version).await
    }

    /// Latest version regardless of status; used by delete/supersede paths.
    async fn read_latest_any(&self, id: Uuid) -> Result<VersionedRecord> {
        let meta = {
            let versions = self.versions.read().expect("versions lock poisoned");
            versions.get(&id).copied()
        };
        let meta = meta.ok_or(MemoryError::NotFound(id))?;
        self.read_version(id, meta.version).await
    }

    async fn read_version(&self, id: Uuid, version: u64) -> Result<VersionedRecord> {
        let path = self.version_path(id, version);
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|source| match source.kind() {
                std::io::ErrorKind::NotFound => MemoryError::NotFound(id),
                _ => MemoryError::Storage {
                    path: path.clone(),
                    source,
                },
            })?;
        decode_record(&path, &bytes)
    }

    /// Full ordered version history of one logical entry, oldest first.
    ///
    /// Includes superseded and deleted versions; this is the audit view.
    pub async fn history(&self, id: Uuid) -> Result<Vec<VersionedRecord>> {
        let dir = self.entry_dir(id);
        let listing = tokio::task::spawn_blocking(move || scan_version_files(&dir))
            .await
            .map_err(|e| MemoryError::Storage {
                path: self.entry_dir(id),
                source: std::io::Error::other(e),
            })?;

        let paths = match listing {
            Ok(paths) if paths.is_empty() => return Err(MemoryError::NotFound(id)),
            Ok(paths) => paths,
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => {
                return Err(MemoryError::NotFound(id));
            }
            Err(source) => {
                return Err(MemoryError::Storage {
                    path: self.entry_dir(id),
                    source,
                });
            }
        };

        let mut records = Vec::with_capacity(paths.len());
        for path in paths {
            let bytes = tokio::fs::read(&path)
                .await
                .map_err(|source| MemoryError::Storage {
                    path: path.clone(),
                    source,
                })?;
            records.push(decode_record(&path, &bytes)?);
        }
        Ok(records)
    }

    /// Scan the repository and return the latest version of every logical
    /// entry (any status), rebuilding the in-memory version map and size
    /// accounting. The commit log is advisory and deliberately not consulted.
    pub async fn replay_latest(&self) -> Result<Vec<VersionedRecord>> {
        let entries_root = self.root.join("entries");
        let scan_root = entries_root.clone();
        let scanned = tokio::task::spawn_blocking(move || scan_repository(&scan_root))
            .await
            .map_err(|e| MemoryError::Storage {
                path: entries_root.clone(),
                source: std::io::Error::other(e),
            })?
            .map_err(|source| MemoryError::Storage {
                path: entries_root,
                source,
            })?;

        let mut map = HashMap::with_capacity(scanned.latest.len());
        let mut records = Vec::with_capacity(scanned.latest.len());
        for (path, bytes) in scanned.latest {
            let record = match decode_record(&path, &bytes) {
                Ok(record) => record,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable record during replay");
                    continue;
                }
            };
            map.insert(
                record.entry.id,
                EntryMeta {
                    version: record.entry.version,
                    status: record.status,
                },
            );
            records.push(record);
        }

        *self.versions.write().expect("versions lock poisoned") = map;
        self.approx_bytes.store(scanned.total_bytes, Ordering::Relaxed);
        self.next_seq
            .store(scanned.version_files + 1, Ordering::Relaxed);

        info!(
            entries = records.len(),
            bytes = scanned.total_bytes,
            "store replayed"
        );
        Ok(records)
    }

    // =========================================================================
    // Encoding
    // =========================================================================

    fn to_stored(&self, record: &VersionedRecord) -> StoredRecord {
        let (content, compressed) =
            encode_content(&record.entry.content, self.compression_threshold);
        StoredRecord {
            id: record.entry.id,
            content,
            compressed,
            embedding: record.entry.embedding.clone(),
            importance: record.entry.importance,
            tags: record.entry.tags.clone(),
            source: record.entry.source.clone(),
            created_at: record.entry.created_at,
            last_accessed_at: record.entry.last_accessed_at,
            access_count: record.entry.access_count,
            version: record.entry.version,
            status: record.status,
            op: record.op,
            committed_at: record.committed_at,
            fallback_embedding: record.fallback_embedding,
            superseded_by: record.superseded_by,
            decayed_at: record.entry.decayed_at,
        }
    }
}

// =============================================================================
// Blocking helpers
// =============================================================================

type CommitIoError = (PathBuf, std::io::Error);

/// Write-temp, fsync, rename, then append the commit-log line.
///
/// The rename is the commit point; the log append after it is advisory.
fn commit_blocking(
    dir: &Path,
    final_path: &Path,
    payload: &[u8],
    log_path: &Path,
    line: &CommitLine,
) -> std::result::Result<(), CommitIoError> {
    let io = |path: &Path| {
        let path = path.to_path_buf();
        move |source: std::io::Error| (path.clone(), source)
    };

    std::fs::create_dir_all(dir).map_err(io(dir))?;

    let tmp_path = final_path.with_extension("json.tmp");
    {
        let mut tmp = std::fs::File::create(&tmp_path).map_err(io(&tmp_path))?;
        tmp.write_all(payload).map_err(io(&tmp_path))?;
        tmp.sync_all().map_err(io(&tmp_path))?;
    }
    std::fs::rename(&tmp_path, final_path).map_err(io(final_path))?;

    // Committed. Log-append failures are logged but do not undo the commit.
    let mut log_line = serde_json::to_string(line).unwrap_or_default();
    log_line.push('\n');
    let append = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .and_then(|mut f| {
            f.write_all(log_line.as_bytes())?;
            f.sync_all()
        });
    if let Err(e) = append {
        warn!(path = %log_path.display(), error = %e, "commit log append failed");
    }

    Ok(())
}

/// Version files of one entry directory, sorted ascending by version.
fn scan_version_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut paths: Vec<(u64, PathBuf)> = Vec::new();
    for item in std::fs::read_dir(dir)? {
        let item = item?;
        let path = item.path();
        if let Some(version) = parse_version_file(&path) {
            paths.push((version, path));
        }
    }
    paths.sort_by_key(|(version, _)| *version);
    Ok(paths.into_iter().map(|(_, path)| path).collect())
}

fn parse_version_file(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    let number = name.strip_prefix('v')?.strip_suffix(".json")?;
    number.parse().ok()
}

struct RepositoryScan {
    /// Latest version file of each entry: (path, bytes).
    latest: Vec<(PathBuf, Vec<u8>)>,
    total_bytes: u64,
    version_files: u64,
}

fn scan_repository(entries_root: &Path) -> std::io::Result<RepositoryScan> {
    let mut latest = Vec::new();
    let mut total_bytes = 0_u64;
    let mut version_files = 0_u64;

    if !entries_root.exists() {
        return Ok(RepositoryScan {
            latest,
            total_bytes,
            version_files,
        });
    }

    for entry_dir in std::fs::read_dir(entries_root)? {
        let entry_dir = entry_dir?.path();
        if !entry_dir.is_dir() {
            continue;
        }
        let mut newest: Option<(u64, PathBuf)> = None;
        for item in std::fs::read_dir(&entry_dir)? {
            let path = item?.path();
            let Some(version) = parse_version_file(&path) else {
                continue;
            };
            version_files += 1;
            total_bytes += path.metadata().map(|m| m.len()).unwrap_or(0);
            if newest.as_ref().is_none_or(|(v, _)| version > *v) {
                newest = Some((version, path));
            }
        }
        if let Some((_, path)) = newest {
            latest.push((path.clone(), std::fs::read(&path)?));
        }
    }

    Ok(RepositoryScan {
        latest,
        total_bytes,
        version_files,
    })
}

// =============================================================================
// Content codec
// =============================================================================

fn encode_content(content: &str, threshold: usize) -> (String, bool) {
    if content.len() <= threshold {
        return (content.to_string(), false);
    }
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    if encoder.write_all(content.as_bytes()).is_err() {
        return (content.to_string(), false);
    }
    match encoder.finish() {
        Ok(bytes) => (BASE64.encode(bytes), true),
        Err(_) => (content.to_string(), false),
    }
}

fn decode_content(path: &Path, stored: &str, compressed: bool) -> Result<String> {
    if !compressed {
        return Ok(stored.to_string());
    }
    let corrupt = |reason: String| MemoryError::Corrupt {
        path: path.to_path_buf(),
        reason,
    };
    let bytes = BASE64
        .decode(stored)
        .map_err(|e| corrupt(format!("base64: {e}")))?;
    let mut decoder = GzDecoder::new(&bytes[..]);
    let mut content = String::new();
    decoder
        .read_to_string(&mut content)
        .map_err(|e| corrupt(format!("gzip: {e}")))?;
    Ok(content)
}

fn decode_record(path: &Path, bytes: &[u8]) -> Result<VersionedRecord> {
    let stored: StoredRecord =
        serde_json::from_slice(bytes).map_err(|e| MemoryError::Corrupt {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
    let content = decode_content(path, &stored.content, stored.compressed)?;
    Ok(VersionedRecord {
        entry: MemoryEntry {
            id: stored.id,
            content,
            embedding: stored.embedding,
            importance: stored.importance,
            tags: stored.tags,
            source: stored.source,
            created_at: stored.created_at,
            last_accessed_at: stored.last_accessed_at,
            access_count: stored.access_count,
            version: stored.version,
            decayed_at: stored.decayed_at,
        },
        status: stored.status,
        op: stored.op,
        committed_at: stored.committed_at,
        fallback_embedding: stored.fallback_embedding,
        superseded_by: stored.superseded_by,
    })
}

// =============================================================================
// Tests
// =============================================================================
