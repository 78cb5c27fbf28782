// THEORY:
// Object store contract plus a filesystem and an in-memory implementation.
//
// Stores hand back a reader; `fetch_with_retry` drains it in fixed-size
// chunks and retries transient failures with a fixed backoff.

use std::collections::HashMap;
use std::fmt::Debug;
use std::fs::File;
use std::io::{self, Cursor, ErrorKind, Read};
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use tracing::{debug, warn};

use crate::config::{RetryConfig, StoreConfig};
use crate::error::StoreError;

pub trait ObjectStore: Send + Sync + Debug {
    fn open(&self, key: &str) -> Result<Box<dyn Read + Send>, StoreError>;
}

fn classify(error: io::Error, key: &str) -> StoreError {
    match error.kind() {
        ErrorKind::NotFound => StoreError::NotFound(key.to_string()),
        ErrorKind::TimedOut
        | ErrorKind::Interrupted
        | ErrorKind::WouldBlock
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted => StoreError::Transient(error),
        _ => StoreError::Io(error),
    }
}

/// Objects are files at `root/bucket/key`.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    base: PathBuf,
}

impl FsObjectStore {
    /// Fails if a credentials file is configured but cannot be read.
    pub fn new(config: &StoreConfig) -> Result<Self, StoreError> {
        if let Some(credentials) = &config.credentials {
            std::fs::metadata(credentials)
                .map_err(|error| classify(error, &credentials.display().to_string()))?;
            debug!(credentials = %credentials.display(), "store credentials present");
        }
        Ok(Self {
            base: config.root.join(&config.bucket),
        })
    }

    pub fn object_path(&self, key: &str) -> PathBuf {
        self.base.join(key)
    }
}

impl ObjectStore for FsObjectStore {
    fn open(&self, key: &str) -> Result<Box<dyn Read + Send>, StoreError> {
        let file = File::open(self.object_path(key)).map_err(|error| classify(error, key))?;
        Ok(Box::new(file))
    }
}

/// An in-memory store. Keys can be told to fail transiently a number of times
/// before they succeed.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    flaky: Mutex<HashMap<String, usize>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: impl Into<String>, bytes: Vec<u8>) {
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), bytes);
    }

    pub fn fail_transiently(&self, key: impl Into<String>, times: usize) {
        self.flaky
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), times);
    }
}

impl ObjectStore for MemoryObjectStore {
    fn open(&self, key: &str) -> Result<Box<dyn Read + Send>, StoreError> {
        {
            let mut flaky = self.flaky.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(remaining) = flaky.get_mut(key).filter(|remaining| **remaining > 0) {
                *remaining -= 1;
                return Err(StoreError::Transient(io::Error::new(
                    ErrorKind::TimedOut,
                    format!("injected failure for {key}"),
                )));
            }
        }
        let objects = self.objects.lock().unwrap_or_else(PoisonError::into_inner);
        let bytes = objects
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        Ok(Box::new(Cursor::new(bytes)))
    }
}

/// Reads `reader` in `chunk`-byte pieces into a growing buffer. A read that
/// returns fewer than `chunk` bytes ends the object.
pub fn read_chunked(reader: &mut dyn Read, chunk: usize) -> io::Result<Vec<u8>> {
    let chunk = chunk.max(1);
    let mut bytes = Vec::with_capacity(chunk);
    let mut buffer = vec![0u8; chunk];
    loop {
        let read = match reader.read(&mut buffer) {
            Ok(read) => read,
            Err(error) if error.kind() == ErrorKind::Interrupted => continue,
            Err(error) => return Err(error),
        };
        bytes.extend_from_slice(&buffer[..read]);
        if read < chunk {
            return Ok(bytes);
        }
    }
}

/// Fetches the whole object, retrying transient failures. Blocks the calling
/// thread during backoff.
pub fn fetch_with_retry(
    store: &dyn ObjectStore,
    key: &str,
    retry: &RetryConfig,
    chunk: usize,
) -> Result<Vec<u8>, StoreError> {
    let attempts = retry.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        let result = store
            .open(key)
            .and_then(|mut reader| read_chunked(reader.as_mut(), chunk).map_err(|e| classify(e, key)));
        match result {
            Err(error) if error.is_transient() && attempt < attempts => {
                warn!(key, attempt, %error, "transient store failure, retrying");
                std::thread::sleep(retry.backoff());
                attempt += 1;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn no_wait(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            backoff_ms: 0,
        }
    }

    #[test]
    fn chunked_reads_span_several_chunks() {
        let data: Vec<u8> = (0..=255).cycle().take(2500).collect();
        let bytes = read_chunked(&mut Cursor::new(data.clone()), 1024).unwrap();
        assert_eq!(bytes, data);
    }

    #[test]
    fn an_exact_multiple_ends_on_the_empty_read() {
        let data = vec![7u8; 2048];
        assert_eq!(read_chunked(&mut Cursor::new(data), 1024).unwrap().len(), 2048);
    }

    #[test]
    fn transient_failures_are_retried() {
        let store = MemoryObjectStore::new();
        store.insert("a", vec![1, 2, 3]);
        store.fail_transiently("a", 2);
        assert_eq!(fetch_with_retry(&store, "a", &no_wait(3), 1024).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn retries_give_up_after_the_last_attempt() {
        let store = MemoryObjectStore::new();
        store.insert("a", vec![1]);
        store.fail_transiently("a", 3);
        let err = fetch_with_retry(&store, "a", &no_wait(3), 1024).unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn missing_objects_are_not_retried() {
        let store = MemoryObjectStore::new();
        let retry = RetryConfig {
            max_attempts: 3,
            backoff_ms: 60_000,
        };
        assert_eq!(retry.backoff(), Duration::from_secs(60));
        let err = fetch_with_retry(&store, "missing", &retry, 1024).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(key) if key == "missing"));
    }

    #[test]
    fn filesystem_store_resolves_root_bucket_key() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("images")).unwrap();
        std::fs::write(dir.path().join("images/cat.raw"), b"meow").unwrap();

        let config = StoreConfig {
            root: dir.path().to_path_buf(),
            bucket: "images".into(),
            credentials: None,
        };
        let store = FsObjectStore::new(&config).unwrap();
        assert_eq!(fetch_with_retry(&store, "cat.raw", &no_wait(1), 2).unwrap(), b"meow");
        assert!(matches!(store.open("dog.raw"), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn unreadable_credentials_fail_construction() {
        let config = StoreConfig {
            credentials: Some(PathBuf::from("/no/such/credentials.json")),
            ..StoreConfig::default()
        };
        assert!(FsObjectStore::new(&config).is_err());
    }
}
