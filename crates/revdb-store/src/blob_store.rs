//! Content-addressed blob store for attachment bytes.
//!
//! Each blob is one file named by the hex of its [`BlobKey`]. Writes go to a
//! temporary file in the same directory and are renamed into place, so a
//! key's file either does not exist or holds the complete content.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use revdb_core::BlobKey;

use crate::error::{Result, StoreError};

const BLOB_EXTENSION: &str = "blob";
const TEMP_EXTENSION: &str = "blobtmp";

/// A directory of immutable, content-addressed blobs.
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    /// Open (creating if needed) a blob store rooted at `root`.
    ///
    /// Leftover temporary files from an interrupted write are removed.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        let store = Self { root };
        for entry in fs::read_dir(&store.root)? {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e == TEMP_EXTENSION) {
                let _ = fs::remove_file(&path);
            }
        }
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &BlobKey) -> PathBuf {
        self.root.join(format!("{}.{BLOB_EXTENSION}", key.to_hex()))
    }

    fn temp_path(&self) -> PathBuf {
        self.root
            .join(format!("{:016x}.{TEMP_EXTENSION}", rand::random::<u64>()))
    }

    /// Store `bytes` and return their key. Storing existing content is a no-op.
    pub fn store_blob(&self, bytes: &[u8]) -> Result<BlobKey> {
        let mut writer = self.writer()?;
        writer.append(bytes)?;
        writer.finish()
    }

    /// Whether a blob with this key is stored.
    pub fn has(&self, key: &BlobKey) -> bool {
        self.path_for(key).is_file()
    }

    /// Open a reader over a stored blob, or `None` if absent.
    pub fn blob_for_key(&self, key: &BlobKey) -> Result<Option<BlobReader>> {
        match File::open(self.path_for(key)) {
            Ok(file) => {
                let length = file.metadata()?.len();
                Ok(Some(BlobReader {
                    key: *key,
                    length,
                    file,
                }))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Read a whole blob into memory.
    pub fn read_blob(&self, key: &BlobKey) -> Result<Option<Bytes>> {
        let Some(mut reader) = self.blob_for_key(key)? else {
            return Ok(None);
        };
        let mut buf = Vec::with_capacity(reader.length() as usize);
        reader.read_to_end(&mut buf)?;
        Ok(Some(Bytes::from(buf)))
    }

    /// Keys of every stored blob.
    pub fn all_keys(&self) -> Result<Vec<BlobKey>> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e == BLOB_EXTENSION) {
                if let Some(key) = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(|s| BlobKey::from_hex(s).ok())
                {
                    keys.push(key);
                }
            }
        }
        Ok(keys)
    }

    /// Number of stored blobs.
    pub fn blob_count(&self) -> Result<usize> {
        Ok(self.all_keys()?.len())
    }

    /// Total size of all stored blobs in bytes.
    pub fn total_size(&self) -> Result<u64> {
        let mut total = 0;
        for key in self.all_keys()? {
            total += fs::metadata(self.path_for(&key))?.len();
        }
        Ok(total)
    }

    /// Delete every blob whose key is not in `keep`. Returns how many were deleted.
    pub fn delete_blobs_except(&self, keep: &HashSet<BlobKey>) -> Result<usize> {
        let mut deleted = 0;
        for key in self.all_keys()? {
            if !keep.contains(&key) {
                fs::remove_file(self.path_for(&key))?;
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// Start a streaming write.
    pub fn writer(&self) -> Result<BlobWriter<'_>> {
        let temp_path = self.temp_path();
        let file = File::create(&temp_path)?;
        Ok(BlobWriter {
            store: self,
            temp_path,
            file: Some(BufWriter::new(file)),
            hasher: blake3::Hasher::new(),
            length: 0,
        })
    }
}

/// Sequential reader over one stored blob.
#[derive(Debug)]
pub struct BlobReader {
    key: BlobKey,
    length: u64,
    file: File,
}

impl BlobReader {
    pub fn key(&self) -> BlobKey {
        self.key
    }

    pub fn length(&self) -> u64 {
        self.length
    }
}

impl Read for BlobReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

/// Streaming blob writer. The blob becomes visible only on [`finish`];
/// dropping an unfinished writer discards the partial file.
///
/// [`finish`]: BlobWriter::finish
pub struct BlobWriter<'a> {
    store: &'a BlobStore,
    temp_path: PathBuf,
    file: Option<BufWriter<File>>,
    hasher: blake3::Hasher,
    length: u64,
}

impl BlobWriter<'_> {
    /// Append a chunk of content.
    pub fn append(&mut self, chunk: &[u8]) -> Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| StoreError::InvalidData("blob writer already finished".into()))?;
        file.write_all(chunk)?;
        self.hasher.update(chunk);
        self.length += chunk.len() as u64;
        Ok(())
    }

    /// Bytes appended so far.
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Flush, hash and move the blob into place.
    pub fn finish(mut self) -> Result<BlobKey> {
        let key = BlobKey::from_bytes(*self.hasher.finalize().as_bytes());
        self.install(&key)?;
        Ok(key)
    }

    /// Like [`finish`](Self::finish), but fail unless the content hashes to
    /// `expected`. On mismatch nothing is installed.
    pub fn finish_expecting(mut self, expected: &BlobKey) -> Result<BlobKey> {
        let actual = BlobKey::from_bytes(*self.hasher.finalize().as_bytes());
        if &actual != expected {
            return Err(StoreError::DigestMismatch {
                expected: *expected,
                actual,
            });
        }
        self.install(&actual)?;
        Ok(actual)
    }

    fn install(&mut self, key: &BlobKey) -> Result<()> {
        let Some(file) = self.file.take() else {
            return Err(StoreError::InvalidData("blob writer already finished".into()));
        };
        let file = file.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        drop(file);

        let final_path = self.store.path_for(key);
        if final_path.is_file() {
            fs::remove_file(&self.temp_path)?;
        } else {
            fs::rename(&self.temp_path, &final_path)?;
        }
        tracing::trace!(key = %key, length = self.length, "stored blob");
        Ok(())
    }
}

impl Drop for BlobWriter<'_> {
    fn drop(&mut self) {
        if self.file.take().is_some() {
            let _ = fs::remove_file(&self.temp_path);
        }
    }
}
