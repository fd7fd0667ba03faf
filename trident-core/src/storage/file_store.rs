//! File-backed key-value store.
//!
//! Each key maps to one file below the root directory (`rec/42` becomes
//! `<root>/rec/42.kv`). Writes go to a temporary file that is renamed into
//! place, so a crash leaves either the old or the new value.
//!
//! # Format
//!
//! ```text
//! [checksum:u32][length:u64][value:length]
//! ```

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::storage::{validate_key, KvStore};

const FILE_EXTENSION: &str = "kv";
const HEADER_LEN: usize = 12;

/// Key-value store keeping one checksummed file per key.
#[derive(Debug)]
pub struct FileKvStore {
    root: PathBuf,
}

impl FileKvStore {
    /// Opens (creating if needed) a store rooted at `root`.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .map_err(|e| Error::IoError(format!("create store dir failed: {}", e)))?;
        Ok(Self { root })
    }

    /// Returns the root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        let mut path = self.root.clone();
        let mut segments = key.split('/').peekable();
        while let Some(segment) = segments.next() {
            if segments.peek().is_some() {
                path.push(segment);
            } else {
                path.push(format!("{}.{}", segment, FILE_EXTENSION));
            }
        }
        Ok(path)
    }

    fn decode(key: &str, bytes: &[u8]) -> Result<Vec<u8>> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::IoError(format!("value for `{}` is truncated", key)));
        }
        let mut checksum = [0u8; 4];
        checksum.copy_from_slice(&bytes[..4]);
        let expected = u32::from_le_bytes(checksum);
        let mut header_length = [0u8; 8];
        header_length.copy_from_slice(&bytes[4..HEADER_LEN]);
        let length = u64::from_le_bytes(header_length);
        let body = &bytes[HEADER_LEN..];
        if body.len() as u64 != length {
            return Err(Error::IoError(format!(
                "value for `{}` has length {}, header says {}",
                key,
                body.len(),
                length
            )));
        }
        let actual = crc32fast::hash(body);
        if actual != expected {
            return Err(Error::IoError(format!(
                "checksum mismatch for `{}`: expected {}, got {}",
                key, expected, actual
            )));
        }
        Ok(body.to_vec())
    }

    fn collect_keys(&self, dir: &Path, prefix: &str, out: &mut Vec<String>) -> Result<()> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(Error::IoError(format!("read dir failed: {}", e))),
        };

        for entry in entries {
            let entry = entry.map_err(|e| Error::IoError(format!("read dir failed: {}", e)))?;
            let path = entry.path();
            let file_type = entry
                .file_type()
                .map_err(|e| Error::IoError(format!("file type failed: {}", e)))?;

            if file_type.is_dir() {
                self.collect_keys(&path, prefix, out)?;
            } else if path.extension().and_then(|e| e.to_str()) == Some(FILE_EXTENSION) {
                let stem = path.with_extension("");
                let Ok(relative) = stem.strip_prefix(&self.root) else {
                    continue;
                };
                let key = relative
                    .components()
                    .filter_map(|c| c.as_os_str().to_str())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.starts_with(prefix) {
                    out.push(key);
                }
            }
        }
        Ok(())
    }
}

impl KvStore for FileKvStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::IoError(format!("open `{}` failed: {}", key, e))),
        };

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)
            .map_err(|e| Error::IoError(format!("read `{}` failed: {}", key, e)))?;

        Self::decode(key, &bytes).map(Some)
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| Error::IoError(format!("create dir failed: {}", e)))?;
        }

        let tmp_path = path.with_extension("kv.tmp");
        {
            let mut file = File::create(&tmp_path)
                .map_err(|e| Error::IoError(format!("create `{}` failed: {}", key, e)))?;
            file.write_all(&crc32fast::hash(value).to_le_bytes())
                .map_err(|e| Error::IoError(format!("write checksum failed: {}", e)))?;
            file.write_all(&(value.len() as u64).to_le_bytes())
                .map_err(|e| Error::IoError(format!("write length failed: {}", e)))?;
            file.write_all(value)
                .map_err(|e| Error::IoError(format!("write value failed: {}", e)))?;
            file.sync_all()
                .map_err(|e| Error::IoError(format!("sync failed: {}", e)))?;
        }

        fs::rename(&tmp_path, &path)
            .map_err(|e| Error::IoError(format!("rename `{}` failed: {}", key, e)))?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::IoError(format!("delete `{}` failed: {}", key, e))),
        }
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        self.collect_keys(&self.root, prefix, &mut keys)?;
        keys.sort();
        Ok(keys)
    }

    fn is_persistent(&self) -> bool {
        true
    }
}
