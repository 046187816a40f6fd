//! Storage collaborators used by the node.
//!
//! - [`Storage`] / [`ForgetfulStorage`]: the associative store for small values
//! - [`BlobStore`]: file-backed storage for large values, addressed by key
//!
//! The node only reads and writes through these interfaces; it never owns the
//! lifecycle of what they hold.

use std::io::ErrorKind;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use lru::LruCache;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::time::{Duration, Instant};

use crate::core::NodeId;
use crate::error::DhtError;

/// File extension of binary blobs under `<root>/files/`.
pub const BINARY_EXTENSION: &str = "kad";

/// File extension of legacy text blobs under `<root>/`.
pub const TEXT_EXTENSION: &str = "txt";

/// Sub-directory of the blob root holding binary blobs.
const FILES_DIR: &str = "files";

// ─────────────────────────────────────────────────────────────────────────────
// Key/Value Storage
// ─────────────────────────────────────────────────────────────────────────────

/// Associative store for small values.
///
/// Methods take `&mut self` so implementations may expire entries lazily
/// while being read.
pub trait Storage: Send + 'static {
    /// Insert or overwrite a value.
    fn set(&mut self, key: NodeId, value: Vec<u8>);

    fn get(&mut self, key: &NodeId) -> Option<Vec<u8>>;

    /// Snapshot of every live entry.
    fn entries(&mut self) -> Vec<(NodeId, Vec<u8>)>;

    fn len(&mut self) -> usize;

    fn is_empty(&mut self) -> bool {
        self.len() == 0
    }
}

/// In-memory store whose entries expire after a fixed time-to-live.
///
/// Entries are kept in insertion order inside an [`LruCache`]; reads use
/// `peek` so the order never changes on access, which lets expiry stop at the
/// first entry that is still fresh. When the capacity is reached the oldest
/// entry is dropped.
pub struct ForgetfulStorage {
    ttl: Duration,
    entries: LruCache<NodeId, (Instant, Vec<u8>)>,
}

impl ForgetfulStorage {
    pub fn new(ttl: Duration, capacity: NonZeroUsize) -> Self {
        Self {
            ttl,
            entries: LruCache::new(capacity),
        }
    }

    /// Drop every entry older than the time-to-live.
    fn cull(&mut self) {
        let now = Instant::now();
        while let Some((_, (stored_at, _))) = self.entries.peek_lru() {
            if now.duration_since(*stored_at) <= self.ttl {
                break;
            }
            self.entries.pop_lru();
        }
    }
}

impl Storage for ForgetfulStorage {
    fn set(&mut self, key: NodeId, value: Vec<u8>) {
        // Re-inserting moves the key to the young end with a fresh timestamp.
        self.entries.pop(&key);
        self.entries.put(key, (Instant::now(), value));
        self.cull();
    }

    fn get(&mut self, key: &NodeId) -> Option<Vec<u8>> {
        self.cull();
        self.entries.peek(key).map(|(_, value)| value.clone())
    }

    fn entries(&mut self) -> Vec<(NodeId, Vec<u8>)> {
        self.cull();
        // LruCache iterates most-recent first; report oldest first.
        let mut out: Vec<(NodeId, Vec<u8>)> = self
            .entries
            .iter()
            .map(|(key, (_, value))| (*key, value.clone()))
            .collect();
        out.reverse();
        out
    }

    fn len(&mut self) -> usize {
        self.cull();
        self.entries.len()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Blob Storage
// ─────────────────────────────────────────────────────────────────────────────

/// A bulk value carried by the blob RPCs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Blob {
    /// Raw bytes, persisted in binary form. Hex encoded on the wire.
    Binary(#[serde(with = "hex::serde")] Vec<u8>),
    /// Text that has no binary form; persisted through the legacy text path.
    Text(String),
}

impl Blob {
    /// The blob's content as bytes (UTF-8 for text).
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Blob::Binary(bytes) => bytes,
            Blob::Text(text) => text.as_bytes(),
        }
    }
}

/// Result of attempting a binary write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// The value has no binary representation and must go through the text path.
    FallbackRequired,
}

/// Result of a blob lookup. Absence is an expected outcome, not an error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BlobLookup {
    Found(Blob),
    Absent,
}

impl BlobLookup {
    pub fn into_option(self) -> Option<Blob> {
        match self {
            BlobLookup::Found(blob) => Some(blob),
            BlobLookup::Absent => None,
        }
    }
}

/// File-backed blob storage rooted at an explicit directory.
///
/// Layout, kept stable for compatibility with existing data directories:
///
/// - `<root>/files/<hex key>.kad`: binary blobs
/// - `<root>/<hex key>.txt`: legacy text blobs, read when no binary blob exists
#[derive(Clone, Debug)]
pub struct BlobStore {
    root: PathBuf,
    files: PathBuf,
}

impl BlobStore {
    /// Open (creating if needed) a blob store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, DhtError> {
        let root = root.into();
        let files = root.join(FILES_DIR);
        std::fs::create_dir_all(&files)?;
        Ok(Self { root, files })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn binary_path(&self, key: &NodeId) -> PathBuf {
        self.files
            .join(format!("{}.{}", key.to_hex(), BINARY_EXTENSION))
    }

    pub fn text_path(&self, key: &NodeId) -> PathBuf {
        self.root.join(format!("{}.{}", key.to_hex(), TEXT_EXTENSION))
    }

    /// Write `value` to the binary path.
    ///
    /// The target file is created before the value is inspected, so a
    /// [`WriteOutcome::FallbackRequired`] result leaves an empty artifact
    /// behind that the caller must discard.
    pub async fn write_binary(&self, key: &NodeId, value: &Blob) -> Result<WriteOutcome, DhtError> {
        let mut file = fs::File::create(self.binary_path(key)).await?;
        match value {
            Blob::Binary(bytes) => {
                file.write_all(bytes).await?;
                file.flush().await?;
                Ok(WriteOutcome::Written)
            }
            Blob::Text(_) => Ok(WriteOutcome::FallbackRequired),
        }
    }

    /// Persist a blob, falling back to the text path when needed.
    pub async fn store(&self, key: &NodeId, value: &Blob) -> Result<(), DhtError> {
        match self.write_binary(key, value).await? {
            WriteOutcome::Written => Ok(()),
            WriteOutcome::FallbackRequired => {
                remove_if_present(&self.binary_path(key)).await?;
                fs::write(self.text_path(key), value.as_bytes()).await?;
                Ok(())
            }
        }
    }

    /// Look a blob up: binary path first, then the legacy text path.
    pub async fn find(&self, key: &NodeId) -> Result<BlobLookup, DhtError> {
        match fs::read(self.binary_path(key)).await {
            Ok(bytes) => return Ok(BlobLookup::Found(Blob::Binary(bytes))),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        match fs::read_to_string(self.text_path(key)).await {
            Ok(text) => Ok(BlobLookup::Found(Blob::Text(text))),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(BlobLookup::Absent),
            Err(err) => Err(err.into()),
        }
    }
}

async fn remove_if_present(path: &Path) -> Result<(), DhtError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}
