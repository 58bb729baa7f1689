//! Object-storage sinks for the prepared datasets.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid object key '{0}'")]
    InvalidKey(String),
    #[error("invalid bucket name '{0}'")]
    InvalidBucket(String),
    #[error("I/O error writing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("HTTP client build error: {0}")]
    HttpClientBuild(String),
    #[error("HTTP PUT failed for {url}: {message}")]
    HttpRequest { url: String, message: String },
}

/// Overwrite-put of a whole object.
pub trait ObjectSink {
    fn put_object(&self, bucket: &str, key: &str, body: &[u8]) -> Result<(), StorageError>;
}

/// Objects land at `<root>/<bucket>/<key>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf, StorageError> {
        validate_bucket(bucket)?;
        validate_key(key)?;
        Ok(self.root.join(bucket).join(key))
    }
}

impl ObjectSink for LocalObjectStore {
    fn put_object(&self, bucket: &str, key: &str, body: &[u8]) -> Result<(), StorageError> {
        let path = self.object_path(bucket, key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| StorageError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        write_atomic(&path, body)?;
        log_put("local", bucket, key, body);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpStoreConfig {
    pub endpoint: String,
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl HttpStoreConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout_ms: 15_000,
            max_retries: 2,
            retry_backoff_ms: 200,
        }
    }
}

/// Path-style PUT against an S3-compatible endpoint: `<endpoint>/<bucket>/<key>`.
pub struct HttpObjectStore {
    cfg: HttpStoreConfig,
    putter: Box<dyn HttpPutter>,
}

impl HttpObjectStore {
    pub fn new(cfg: HttpStoreConfig) -> Result<Self, StorageError> {
        let putter = ReqwestBlockingPutter::new(cfg.timeout_ms)?;
        Ok(Self {
            cfg,
            putter: Box::new(putter),
        })
    }

    fn object_url(&self, bucket: &str, key: &str) -> Result<String, StorageError> {
        validate_bucket(bucket)?;
        validate_key(key)?;
        Ok(format!(
            "{}/{bucket}/{key}",
            self.cfg.endpoint.trim_end_matches('/')
        ))
    }
}

impl ObjectSink for HttpObjectStore {
    fn put_object(&self, bucket: &str, key: &str, body: &[u8]) -> Result<(), StorageError> {
        let url = self.object_url(bucket, key)?;
        let digest = sha256_hex(body);
        retry(&self.cfg, &url, || self.putter.put(&url, body, &digest))?;
        log_put("http", bucket, key, body);
        debug!(
            component = "storage",
            event = "storage.put.http.url",
            url = %url
        );
        Ok(())
    }
}

/// Keeps objects in memory; later puts to the same location overwrite earlier ones.
#[derive(Debug, Default)]
pub struct InMemoryObjectStore {
    objects: Mutex<BTreeMap<(String, String), Vec<u8>>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.lock()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    pub fn keys(&self) -> Vec<(String, String)> {
        self.lock().keys().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<(String, String), Vec<u8>>> {
        // Inserts are whole-object, so a poisoned map is still consistent.
        self.objects
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ObjectSink for InMemoryObjectStore {
    fn put_object(&self, bucket: &str, key: &str, body: &[u8]) -> Result<(), StorageError> {
        validate_bucket(bucket)?;
        validate_key(key)?;
        self.lock()
            .insert((bucket.to_string(), key.to_string()), body.to_vec());
        log_put("memory", bucket, key, body);
        Ok(())
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn log_put(backend: &'static str, bucket: &str, key: &str, body: &[u8]) {
    info!(
        component = "storage",
        event = "storage.put.finish",
        backend,
        bucket,
        key,
        bytes = body.len(),
        sha256 = %sha256_hex(body)
    );
}

fn validate_bucket(bucket: &str) -> Result<(), StorageError> {
    let ok = !bucket.is_empty()
        && bucket != "."
        && bucket != ".."
        && bucket
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(())
    } else {
        Err(StorageError::InvalidBucket(bucket.to_string()))
    }
}

fn validate_key(key: &str) -> Result<(), StorageError> {
    let invalid = || StorageError::InvalidKey(key.to_string());
    if key.is_empty() || key.starts_with('/') || key.ends_with('/') || key.contains('\\') {
        return Err(invalid());
    }
    let all_normal = Path::new(key)
        .components()
        .all(|c| matches!(c, Component::Normal(_)));
    if !all_normal {
        return Err(invalid());
    }
    Ok(())
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let io_err = |source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    };
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or_else(|| StorageError::InvalidKey(path.display().to_string()))?;
    let tmp_path = path.with_file_name(format!("{file_name}.tmp"));

    let written = fs::File::create(&tmp_path).and_then(|mut file| {
        file.write_all(bytes)?;
        file.sync_all()
    });
    let result = written.and_then(|()| fs::rename(&tmp_path, path));
    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result.map_err(io_err)
}

trait HttpPutter {
    fn put(&self, url: &str, body: &[u8], sha256: &str) -> Result<(), StorageError>;
}

struct ReqwestBlockingPutter {
    client: reqwest::blocking::Client,
}

impl ReqwestBlockingPutter {
    fn new(timeout_ms: u64) -> Result<Self, StorageError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_millis(timeout_ms))
            .build()
            .map_err(|err| StorageError::HttpClientBuild(err.to_string()))?;
        Ok(Self { client })
    }
}

impl HttpPutter for ReqwestBlockingPutter {
    fn put(&self, url: &str, body: &[u8], sha256: &str) -> Result<(), StorageError> {
        let response = self
            .client
            .put(url)
            .header("x-amz-content-sha256", sha256)
            .header("content-type", "application/json")
            .body(body.to_vec())
            .send()
            .map_err(|err| StorageError::HttpRequest {
                url: url.to_string(),
                message: err.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(StorageError::HttpRequest {
                url: url.to_string(),
                message: format!("unexpected HTTP status {status}"),
            });
        }
        Ok(())
    }
}

fn retry(
    cfg: &HttpStoreConfig,
    url: &str,
    mut f: impl FnMut() -> Result<(), StorageError>,
) -> Result<(), StorageError> {
    let mut attempt: u32 = 0;
    loop {
        match f() {
            Ok(()) => return Ok(()),
            Err(err) if attempt >= cfg.max_retries => return Err(err),
            Err(err) => {
                attempt = attempt.saturating_add(1);
                let shift = attempt.saturating_sub(1).min(10);
                let sleep_ms = cfg.retry_backoff_ms.saturating_mul(1u64 << shift);
                warn!(
                    component = "storage",
                    event = "storage.put.retry",
                    url,
                    attempt,
                    sleep_ms,
                    error = %err
                );
                std::thread::sleep(std::time::Duration::from_millis(sleep_ms));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    type PutLog = Rc<RefCell<Vec<(String, usize, String)>>>;

    struct FlakyPutter {
        failures_left: RefCell<u32>,
        calls: PutLog,
    }

    impl HttpPutter for FlakyPutter {
        fn put(&self, url: &str, body: &[u8], sha256: &str) -> Result<(), StorageError> {
            self.calls
                .borrow_mut()
                .push((url.to_string(), body.len(), sha256.to_string()));
            let mut left = self.failures_left.borrow_mut();
            if *left > 0 {
                *left -= 1;
                return Err(StorageError::HttpRequest {
                    url: url.to_string(),
                    message: "simulated 503".to_string(),
                });
            }
            Ok(())
        }
    }

    fn flaky_store(failures: u32, max_retries: u32) -> (HttpObjectStore, PutLog) {
        let calls = PutLog::default();
        let store = HttpObjectStore {
            cfg: HttpStoreConfig {
                endpoint: "http://objects.local/".to_string(),
                timeout_ms: 1_000,
                max_retries,
                retry_backoff_ms: 0,
            },
            putter: Box::new(FlakyPutter {
                failures_left: RefCell::new(failures),
                calls: Rc::clone(&calls),
            }),
        };
        (store, calls)
    }

    #[test]
    fn local_store_writes_under_bucket_and_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());

        store
            .put_object("work", "meteranalytics/train/training.json", b"first\n")
            .unwrap();
        store
            .put_object("work", "meteranalytics/train/training.json", b"second\n")
            .unwrap();

        let path = dir.path().join("work/meteranalytics/train/training.json");
        assert_eq!(fs::read(&path).unwrap(), b"second\n");
        assert!(!path.with_file_name("training.json.tmp").exists());
    }

    #[test]
    fn failed_local_put_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        // A non-empty directory where the object should go makes the final rename fail.
        let target = dir.path().join("work/meteranalytics/test/testing.json");
        fs::create_dir_all(target.join("occupied")).unwrap();

        let err = store
            .put_object("work", "meteranalytics/test/testing.json", b"line\n")
            .unwrap_err();

        assert!(matches!(err, StorageError::Io { .. }));
        assert!(!target.with_file_name("testing.json.tmp").exists());
        assert!(target.is_dir());
    }

    #[test]
    fn keys_escaping_the_bucket_are_rejected() {
        let store = InMemoryObjectStore::new();
        for key in ["", "/abs", "a/../b", "dir/", "..", "a\\b"] {
            assert!(
                matches!(
                    store.put_object("work", key, b"x"),
                    Err(StorageError::InvalidKey(_))
                ),
                "{key:?} should be rejected"
            );
        }
        assert!(matches!(
            store.put_object("../up", "k", b"x"),
            Err(StorageError::InvalidBucket(_))
        ));
    }

    #[test]
    fn http_store_retries_then_succeeds_with_digest_header() {
        let (store, calls) = flaky_store(2, 2);
        store.put_object("work", "a/b.json", b"{}\n").unwrap();

        let putter_calls = calls.borrow();
        assert_eq!(putter_calls.len(), 3);
        assert_eq!(putter_calls[0].0, "http://objects.local/work/a/b.json");
        assert_eq!(putter_calls[0].2, sha256_hex(b"{}\n"));
    }

    #[test]
    fn http_store_gives_up_after_max_retries() {
        let (store, calls) = flaky_store(5, 1);
        let err = store.put_object("work", "a.json", b"x").unwrap_err();
        assert!(matches!(err, StorageError::HttpRequest { .. }));
        assert_eq!(calls.borrow().len(), 2);
    }

    #[test]
    fn sha256_matches_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
