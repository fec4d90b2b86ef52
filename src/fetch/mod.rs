//! Artifact fetcher: remote source to verified local cache entry.
//!
//! Downloads stream into a scratch file under `.bootstrap/tmp/` while being
//! hashed, are checked against the expected digest, then renamed onto the
//! cache path. A crash at any point leaves either no cache entry or a
//! complete one.
//!
//! ```text
//! fetch(uri, dest, sha256?)
//!   lock(dest) -> cache hit? -> return
//!              -> attempt 1..=max_attempts:
//!                   download -> tmp, hash
//!                   transient error / digest mismatch -> backoff, retry
//!                   permanent error                    -> Fetch error
//!                   ok -> rename(tmp, dest) [+ dest.sha256 sidecar]
//! ```

pub mod cache;
mod retry;
mod transport;

pub use cache::{gc, GcReport};
pub use retry::RetryPolicy;
pub use transport::{DefaultTransport, FileTransport, HttpTransport, Transport, TransportError};

use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::fsutil::{
    lock_exclusive, path_exists, rename_into_place, sha256_file, sha256_hex, tmp_name,
    write_atomic,
};
use crate::layout::WorkspaceLayout;

/// How a fetch was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    CacheHit,
    Downloaded { attempts: u32 },
}

/// Handle to a verified cache entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedArtifact {
    pub path: PathBuf,
    pub sha256: String,
    pub size_bytes: u64,
    pub outcome: FetchOutcome,
}

pub struct Fetcher {
    transport: Box<dyn Transport>,
    policy: RetryPolicy,
    tmp_dir: PathBuf,
    locks_dir: PathBuf,
    cancel: CancelToken,
}

impl Fetcher {
    pub fn new(
        layout: &WorkspaceLayout,
        transport: Box<dyn Transport>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            policy,
            tmp_dir: layout.tmp_dir(),
            locks_dir: layout.locks_dir().join("fetch"),
            cancel: CancelToken::new(),
        }
    }

    /// Stop retrying once `cancel` fires.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Fetch `uri` into `dest`, reusing a valid cache entry.
    pub fn fetch(&self, uri: &str, dest: &Path, expected: Option<&str>) -> Result<CachedArtifact> {
        self.fetch_inner(uri, dest, expected, false)
    }

    /// Like [`Fetcher::fetch`] but always downloads, replacing any cache entry.
    pub fn refetch(
        &self,
        uri: &str,
        dest: &Path,
        expected: Option<&str>,
    ) -> Result<CachedArtifact> {
        self.fetch_inner(uri, dest, expected, true)
    }

    fn fetch_inner(
        &self,
        uri: &str,
        dest: &Path,
        expected: Option<&str>,
        refresh: bool,
    ) -> Result<CachedArtifact> {
        let lock_path = self
            .locks_dir
            .join(format!("{}.lock", &sha256_hex(dest.to_string_lossy().as_bytes())[..16]));
        let _lock = lock_exclusive(&lock_path).map_err(|e| fetch_io(uri, e))?;

        if !refresh {
            if let Some(hit) = self.cache_hit(uri, dest, expected)? {
                log::debug!("[bootstrap:fetch] cache hit {}", dest.display());
                return Ok(hit);
            }
        }

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled {
                    stage: format!("fetch of {uri}"),
                });
            }

            let failure = match self.attempt(uri)? {
                Ok((tmp, sha256, size_bytes)) => match expected {
                    Some(want) if want != sha256 => {
                        let _ = fs::remove_file(&tmp);
                        Failure::Mismatch { actual: sha256 }
                    }
                    _ => {
                        rename_into_place(&tmp, dest).map_err(|e| {
                            let _ = fs::remove_file(&tmp);
                            fetch_io(uri, e)
                        })?;
                        if expected.is_none() {
                            write_atomic(&sidecar_path(dest), sha256.as_bytes(), &self.tmp_dir)
                                .map_err(|e| fetch_io(uri, e))?;
                        }
                        log::info!(
                            "[bootstrap:fetch] {uri} -> {} ({size_bytes} bytes, attempt {attempt})",
                            dest.display()
                        );
                        return Ok(CachedArtifact {
                            path: dest.to_path_buf(),
                            sha256,
                            size_bytes,
                            outcome: FetchOutcome::Downloaded { attempts: attempt },
                        });
                    }
                },
                Err(TransportError::Permanent(message)) => {
                    return Err(Error::Fetch {
                        uri: uri.to_string(),
                        attempts: attempt,
                        message,
                    });
                }
                Err(TransportError::Transient(message)) => Failure::Transport { message },
            };

            if attempt >= self.policy.max_attempts {
                return Err(match failure {
                    Failure::Mismatch { actual } => Error::Integrity {
                        uri: uri.to_string(),
                        expected: expected.unwrap_or_default().to_string(),
                        actual,
                        attempts: attempt,
                    },
                    Failure::Transport { message } => Error::Fetch {
                        uri: uri.to_string(),
                        attempts: attempt,
                        message,
                    },
                });
            }

            let delay = self.policy.backoff(attempt);
            match &failure {
                Failure::Mismatch { actual } => log::warn!(
                    "[bootstrap:fetch] {uri}: digest mismatch (got {actual}), retrying in {delay:?}"
                ),
                Failure::Transport { message } => {
                    log::warn!("[bootstrap:fetch] {message}, retrying in {delay:?}")
                }
            }
            self.cancel.sleep(delay);
        }
    }

    /// One download into a scratch file. Local I/O failures are errors;
    /// transport failures are returned for the retry loop to classify.
    fn attempt(
        &self,
        uri: &str,
    ) -> Result<std::result::Result<(PathBuf, String, u64), TransportError>> {
        fs::create_dir_all(&self.tmp_dir)
            .map_err(|e| Error::io(format!("creating {}", self.tmp_dir.display()), e))?;
        let tmp = self.tmp_dir.join(tmp_name("fetch"));
        let file = File::create(&tmp)
            .map_err(|e| Error::io(format!("creating {}", tmp.display()), e))?;

        let mut sink = HashingWriter::new(BufWriter::new(file));
        let result = self.transport.download(uri, &mut sink);
        let finished = result.and_then(|_| {
            sink.finish()
                .map_err(|e| TransportError::Transient(format!("writing {}: {e}", tmp.display())))
        });
        match finished {
            Ok((sha256, size_bytes)) => Ok(Ok((tmp, sha256, size_bytes))),
            Err(e) => {
                let _ = fs::remove_file(&tmp);
                Ok(Err(e))
            }
        }
    }

    fn cache_hit(
        &self,
        uri: &str,
        dest: &Path,
        expected: Option<&str>,
    ) -> Result<Option<CachedArtifact>> {
        if !dest.is_file() {
            return Ok(None);
        }
        let (actual, size_bytes) = sha256_file(dest).map_err(|e| fetch_io(uri, e))?;
        let recorded = match expected {
            Some(want) => Some(want.to_string()),
            None => fs::read_to_string(sidecar_path(dest))
                .ok()
                .map(|s| s.trim().to_string()),
        };
        if recorded.as_deref() == Some(actual.as_str()) {
            return Ok(Some(CachedArtifact {
                path: dest.to_path_buf(),
                sha256: actual,
                size_bytes,
                outcome: FetchOutcome::CacheHit,
            }));
        }

        log::warn!(
            "[bootstrap:fetch] discarding unverifiable cache entry {}",
            dest.display()
        );
        fs::remove_file(dest).map_err(|e| Error::io(format!("removing {}", dest.display()), e))?;
        let sidecar = sidecar_path(dest);
        if path_exists(&sidecar) {
            let _ = fs::remove_file(sidecar);
        }
        Ok(None)
    }
}

enum Failure {
    Mismatch { actual: String },
    Transport { message: String },
}

/// Digest record written next to cache entries that have no declared digest.
pub fn sidecar_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".sha256");
    PathBuf::from(name)
}

fn fetch_io(uri: &str, e: anyhow::Error) -> Error {
    Error::Fetch {
        uri: uri.to_string(),
        attempts: 0,
        message: format!("{e:#}"),
    }
}

struct HashingWriter<W: Write> {
    inner: W,
    hasher: Sha256,
    bytes: u64,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            bytes: 0,
        }
    }
}

impl HashingWriter<BufWriter<File>> {
    fn finish(self) -> io::Result<(String, u64)> {
        let file = self.inner.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        Ok((format!("{:x}", self.hasher.finalize()), self.bytes))
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
