//! Object storage collaborator. Completed downloads are delivered to a [Filestore] as whole
//! objects inside named buckets, together with a metadata map describing the transaction.
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use hashbrown::HashMap;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum FilestoreError {
    #[error("object {name} does not exist in bucket {bucket}")]
    ObjectDoesNotExist { bucket: String, name: String },
    #[error("invalid object name {0}")]
    InvalidObjectName(String),
    #[error("bucket {bucket} is full: {needed} bytes needed, {available} available")]
    BucketFull {
        bucket: String,
        needed: u64,
        available: u64,
    },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Bucket/object storage used to deliver received files and to read objects for upload.
pub trait Filestore: Send + Sync {
    /// Stores an object, creating the bucket if needed. When `overwrite` is false and the
    /// name is taken, a unique name with a numeric suffix is chosen instead. Returns the
    /// name the object was stored under.
    fn save_object(
        &self,
        bucket: &str,
        name: &str,
        data: &[u8],
        metadata: &HashMap<String, String>,
        overwrite: bool,
    ) -> Result<String, FilestoreError>;

    fn get_object(&self, bucket: &str, name: &str) -> Result<Vec<u8>, FilestoreError>;

    /// Remaining capacity of a bucket in bytes.
    fn available_space(&self, bucket: &str) -> Result<u64, FilestoreError>;
}

/// [Filestore] keeping each bucket as a directory under a common root. Object metadata is
/// stored next to the object in a `<name>.meta` sidecar file with one `key=value` line per
/// entry.
#[derive(Debug)]
pub struct NativeFilestore {
    root: PathBuf,
    bucket_capacity: u64,
}

const DEFAULT_BUCKET_CAPACITY: u64 = 100 * 1024 * 1024;
const METADATA_SUFFIX: &str = ".meta";

impl NativeFilestore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            bucket_capacity: DEFAULT_BUCKET_CAPACITY,
        }
    }

    pub fn with_bucket_capacity(mut self, bucket_capacity: u64) -> Self {
        self.bucket_capacity = bucket_capacity;
        self
    }

    /// Flattens a remote path into a plain object name. Directory separators are replaced so
    /// an object can never escape its bucket.
    fn sanitize(name: &str) -> Result<String, FilestoreError> {
        let flattened = name.trim_matches('/').replace('/', "_");
        if flattened.is_empty() || flattened.contains("..") {
            return Err(FilestoreError::InvalidObjectName(name.to_string()));
        }
        Ok(flattened)
    }

    fn bucket_dir(&self, bucket: &str) -> PathBuf {
        self.root.join(bucket)
    }

    fn used_space(dir: &Path) -> Result<u64, FilestoreError> {
        if !dir.is_dir() {
            return Ok(0);
        }
        let mut used = 0;
        for entry in fs::read_dir(dir)? {
            used += entry?.metadata()?.len();
        }
        Ok(used)
    }
}

impl Filestore for NativeFilestore {
    fn save_object(
        &self,
        bucket: &str,
        name: &str,
        data: &[u8],
        metadata: &HashMap<String, String>,
        overwrite: bool,
    ) -> Result<String, FilestoreError> {
        let dir = self.bucket_dir(bucket);
        fs::create_dir_all(&dir)?;
        let available = self.available_space(bucket)?;
        if data.len() as u64 > available {
            return Err(FilestoreError::BucketFull {
                bucket: bucket.to_string(),
                needed: data.len() as u64,
                available,
            });
        }
        let base = Self::sanitize(name)?;
        let mut effective = base.clone();
        if !overwrite {
            let mut counter = 1;
            while dir.join(&effective).exists() {
                effective = format!("{}({})", base, counter);
                counter += 1;
            }
        }
        fs::write(dir.join(&effective), data)?;
        if !metadata.is_empty() {
            let mut sidecar =
                fs::File::create(dir.join(format!("{}{}", effective, METADATA_SUFFIX)))?;
            let mut entries: Vec<_> = metadata.iter().collect();
            entries.sort();
            for (key, value) in entries {
                writeln!(sidecar, "{}={}", key, value)?;
            }
        }
        Ok(effective)
    }

    fn get_object(&self, bucket: &str, name: &str) -> Result<Vec<u8>, FilestoreError> {
        let path = self.bucket_dir(bucket).join(Self::sanitize(name)?);
        if !path.is_file() {
            return Err(FilestoreError::ObjectDoesNotExist {
                bucket: bucket.to_string(),
                name: name.to_string(),
            });
        }
        Ok(fs::read(path)?)
    }

    fn available_space(&self, bucket: &str) -> Result<u64, FilestoreError> {
        let used = Self::used_space(&self.bucket_dir(bucket))?;
        Ok(self.bucket_capacity.saturating_sub(used))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn meta(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn save_and_read_back() {
        let dir = tempdir().unwrap();
        let store = NativeFilestore::new(dir.path());
        let name = store
            .save_object("down", "img.raw", &[1, 2, 3], &HashMap::new(), true)
            .unwrap();
        assert_eq!(name, "img.raw");
        assert_eq!(store.get_object("down", "img.raw").unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn overwrite_replaces_content() {
        let dir = tempdir().unwrap();
        let store = NativeFilestore::new(dir.path());
        store
            .save_object("b", "f", &[1], &HashMap::new(), true)
            .unwrap();
        store
            .save_object("b", "f", &[2, 3], &HashMap::new(), true)
            .unwrap();
        assert_eq!(store.get_object("b", "f").unwrap(), vec![2, 3]);
    }

    #[test]
    fn unique_name_when_overwrite_disallowed() {
        let dir = tempdir().unwrap();
        let store = NativeFilestore::new(dir.path());
        store
            .save_object("b", "f", &[1], &HashMap::new(), false)
            .unwrap();
        let second = store
            .save_object("b", "f", &[2], &HashMap::new(), false)
            .unwrap();
        assert_eq!(second, "f(1)");
        let third = store
            .save_object("b", "f", &[3], &HashMap::new(), false)
            .unwrap();
        assert_eq!(third, "f(2)");
        assert_eq!(store.get_object("b", "f").unwrap(), vec![1]);
        assert_eq!(store.get_object("b", "f(2)").unwrap(), vec![3]);
    }

    #[test]
    fn metadata_sidecar_is_written() {
        let dir = tempdir().unwrap();
        let store = NativeFilestore::new(dir.path());
        store
            .save_object(
                "b",
                "f",
                &[0],
                &meta(&[("source", "23"), ("checksumError", "true")]),
                true,
            )
            .unwrap();
        let sidecar = fs::read_to_string(dir.path().join("b").join("f.meta")).unwrap();
        assert_eq!(sidecar, "checksumError=true\nsource=23\n");
    }

    #[test]
    fn path_separators_are_flattened() {
        let dir = tempdir().unwrap();
        let store = NativeFilestore::new(dir.path());
        let name = store
            .save_object("b", "/out/sub/f.bin", &[0], &HashMap::new(), true)
            .unwrap();
        assert_eq!(name, "out_sub_f.bin");
        assert!(store
            .save_object("b", "../f", &[0], &HashMap::new(), true)
            .is_err());
    }

    #[test]
    fn capacity_accounting() {
        let dir = tempdir().unwrap();
        let store = NativeFilestore::new(dir.path()).with_bucket_capacity(10);
        store
            .save_object("b", "f", &[0; 8], &HashMap::new(), true)
            .unwrap();
        assert_eq!(store.available_space("b").unwrap(), 2);
        assert!(matches!(
            store.save_object("b", "g", &[0; 4], &HashMap::new(), true),
            Err(FilestoreError::BucketFull { .. })
        ));
    }

    #[test]
    fn missing_object() {
        let dir = tempdir().unwrap();
        let store = NativeFilestore::new(dir.path());
        assert!(matches!(
            store.get_object("nope", "f"),
            Err(FilestoreError::ObjectDoesNotExist { .. })
        ));
    }
}
