//! Byte transports behind the fetcher.
//!
//! A transport only moves bytes. Digest checks, retries and cache placement
//! live in [`super::Fetcher`], so every transport gets them for free.

use std::fmt;
use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;

/// Failure of one download attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Worth retrying: connect failures, timeouts, 5xx, 429, interrupted reads.
    Transient(String),
    /// Retrying cannot help: 4xx, missing local file, unsupported scheme.
    Permanent(String),
}

impl TransportError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Transient(m) | Self::Permanent(m) => m,
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient(m) => write!(f, "{m} (transient)"),
            Self::Permanent(m) => write!(f, "{m}"),
        }
    }
}

pub trait Transport: Send + Sync {
    /// Stream the body of `uri` into `sink`, returning the byte count.
    fn download(&self, uri: &str, sink: &mut dyn Write) -> Result<u64, TransportError>;
}

/// `http://` and `https://` via a blocking ureq agent.
pub struct HttpTransport {
    agent: ureq::Agent,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout(timeout)
            .user_agent(concat!("tree-bootstrap/", env!("CARGO_PKG_VERSION")))
            .build();
        Self { agent }
    }
}

impl Transport for HttpTransport {
    fn download(&self, uri: &str, sink: &mut dyn Write) -> Result<u64, TransportError> {
        let response = match self.agent.get(uri).call() {
            Ok(resp) => resp,
            Err(ureq::Error::Status(code, _)) if code == 429 || code >= 500 => {
                return Err(TransportError::Transient(format!("HTTP {code} from {uri}")));
            }
            Err(ureq::Error::Status(code, _)) => {
                return Err(TransportError::Permanent(format!("HTTP {code} from {uri}")));
            }
            Err(ureq::Error::Transport(t)) => {
                return Err(TransportError::Transient(format!("{uri}: {t}")));
            }
        };
        let mut reader = response.into_reader();
        io::copy(&mut reader, sink)
            .map_err(|e| TransportError::Transient(format!("reading body of {uri}: {e}")))
    }
}

/// `file://` URIs and bare local paths.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileTransport;

impl FileTransport {
    fn path_of(uri: &str) -> PathBuf {
        PathBuf::from(uri.strip_prefix("file://").unwrap_or(uri))
    }
}

impl Transport for FileTransport {
    fn download(&self, uri: &str, sink: &mut dyn Write) -> Result<u64, TransportError> {
        let path = Self::path_of(uri);
        let mut file = File::open(&path).map_err(|e| classify_io(&path.display().to_string(), e))?;
        io::copy(&mut file, sink).map_err(|e| classify_io(&path.display().to_string(), e))
    }
}

fn classify_io(what: &str, e: io::Error) -> TransportError {
    match e.kind() {
        io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied | io::ErrorKind::InvalidInput => {
            TransportError::Permanent(format!("{what}: {e}"))
        }
        _ => TransportError::Transient(format!("{what}: {e}")),
    }
}

/// Dispatches on the URI scheme.
pub struct DefaultTransport {
    http: HttpTransport,
    file: FileTransport,
}

impl DefaultTransport {
    pub fn new(timeout: Duration) -> Self {
        Self {
            http: HttpTransport::new(timeout),
            file: FileTransport,
        }
    }
}

impl Transport for DefaultTransport {
    fn download(&self, uri: &str, sink: &mut dyn Write) -> Result<u64, TransportError> {
        match uri.split_once("://").map(|(scheme, _)| scheme) {
            Some("http") | Some("https") => self.http.download(uri, sink),
            Some("file") | None => self.file.download(uri, sink),
            Some(other) => Err(TransportError::Permanent(format!(
                "unsupported URI scheme '{other}' in {uri}; use https://, http:// or file://"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn file_transport_reads_file_uris_and_bare_paths() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("payload.bin");
        fs::write(&src, b"payload").unwrap();

        let mut out: Vec<u8> = Vec::new();
        let n = FileTransport
            .download(&format!("file://{}", src.display()), &mut out)
            .unwrap();
        assert_eq!(n, 7);
        assert_eq!(out, b"payload");

        let mut out: Vec<u8> = Vec::new();
        FileTransport
            .download(&src.display().to_string(), &mut out)
            .unwrap();
        assert_eq!(out, b"payload");
    }

    #[test]
    fn missing_file_is_permanent() {
        let err = FileTransport
            .download("file:///definitely/not/here", &mut Vec::<u8>::new())
            .unwrap_err();
        assert!(!err.is_transient());
    }

    #[test]
    fn unknown_scheme_is_permanent() {
        let transport = DefaultTransport::new(Duration::from_secs(1));
        let err = transport
            .download("gopher://example.org/x", &mut Vec::<u8>::new())
            .unwrap_err();
        assert!(!err.is_transient());
        assert!(err.message().contains("gopher"));
    }
}
