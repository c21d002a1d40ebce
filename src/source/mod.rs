//! The physical layer: byte-range fetching from local files, HTTP(S) servers,
//! and XRootD servers, behind one [`Source`] trait.
//!
//! A source knows nothing about what the bytes mean. It serves single ranges
//! ([`Source::chunk`]) and vector requests ([`Source::chunks`]), where every
//! returned chunk keeps exactly the requested `[start, stop)` identity — the
//! layers above rely on that and ranges are never coalesced.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::time::Duration;

use crate::chunk::Chunk;
use crate::error::Result;

pub mod file;
pub mod futures;
pub mod http;
pub mod xrootd;

pub use futures::{Executor, ResourcePool};

/// Which implementation serves plain paths and `file://` URLs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileHandler {
    /// Memory-mapped, falling back to [`FileHandler::Pread`] when mapping
    /// fails (character devices, some network mounts).
    Mmap,
    /// A pool of positioned-read workers, each with its own descriptor.
    Pread,
}

/// Which implementation serves `root://` URLs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XRootDHandler {
    /// Vector reads over a single session.
    Vectored,
    /// One session per worker, single-range requests.
    Multithreaded,
}

/// Which implementation serves `http://` and `https://` URLs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpHandler {
    /// One multipart `Range` request per vector read, falling back to the
    /// worker pool when the server does not cooperate.
    Multipart,
    /// One connection per worker, single-range requests.
    Multithreaded,
}

/// Options recognized by [`crate::open`] and every source constructor.
#[derive(Debug, Clone)]
pub struct Options {
    pub file_handler: FileHandler,
    pub xrootd_handler: XRootDHandler,
    pub http_handler: HttpHandler,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Cap on vector-read fan-out, on top of server-imposed limits.
    pub max_num_elements: Option<usize>,
    /// Source worker-pool size.
    pub num_workers: usize,
    /// Pool size for the pread fallback behind [`FileHandler::Mmap`].
    pub num_fallback_workers: usize,
    /// Prefetch length at file open; must hold at least the large-format
    /// TFile header (72 bytes).
    pub begin_chunk_size: u64,
    /// Skip the optional trailing TTree members nobody reads.
    pub minimal_ttree_metadata: bool,
    /// Object-cache capacity in entries.
    pub object_cache: usize,
    /// Array-cache budget in bytes.
    pub array_cache: u64,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            file_handler: FileHandler::Mmap,
            xrootd_handler: XRootDHandler::Vectored,
            http_handler: HttpHandler::Multipart,
            timeout: Duration::from_secs(30),
            max_num_elements: None,
            num_workers: 1,
            num_fallback_workers: 10,
            begin_chunk_size: 512,
            minimal_ttree_metadata: true,
            object_cache: 100,
            array_cache: 100 * 1024 * 1024,
        }
    }
}

impl Options {
    /// Apply a URL query string (`timeout=…&workers=…`). Unknown keys are
    /// ignored; the query is accepted but never required.
    pub fn apply_query(&mut self, query: &str) {
        for pair in query.split('&') {
            let mut kv = pair.splitn(2, '=');
            match (kv.next(), kv.next()) {
                (Some("timeout"), Some(value)) => {
                    if let Ok(seconds) = value.parse::<u64>() {
                        self.timeout = Duration::from_secs(seconds);
                    }
                }
                (Some("workers"), Some(value)) => {
                    if let Ok(n) = value.parse::<usize>() {
                        self.num_workers = n.max(1);
                    }
                }
                _ => {}
            }
        }
    }
}

/// Performance counters every source keeps.
#[derive(Default)]
pub struct Counters {
    requests: AtomicU64,
    requested_chunks: AtomicU64,
    requested_bytes: AtomicU64,
}

impl Counters {
    pub const fn new() -> Counters {
        Counters {
            requests: AtomicU64::new(0),
            requested_chunks: AtomicU64::new(0),
            requested_bytes: AtomicU64::new(0),
        }
    }

    pub(crate) fn record(&self, num_chunks: u64, num_bytes: u64) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.requested_chunks.fetch_add(num_chunks, Ordering::Relaxed);
        self.requested_bytes.fetch_add(num_bytes, Ordering::Relaxed);
    }

    pub fn num_requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn num_requested_chunks(&self) -> u64 {
        self.requested_chunks.load(Ordering::Relaxed)
    }

    pub fn num_requested_bytes(&self) -> u64 {
        self.requested_bytes.load(Ordering::Relaxed)
    }
}

/// Random-access byte fetching from one file, local or remote.
pub trait Source: Send + Sync {
    /// Fetch `[start, stop)`, blocking until the bytes are available.
    fn chunk(&self, start: u64, stop: u64) -> Result<Chunk>;

    /// Issue a vector request. Each chunk is delivered on `sink` as soon as
    /// it is filled and is also returned in request order; returned chunks
    /// carry exactly the requested ranges.
    fn chunks(&self, ranges: &[(u64, u64)], sink: &mpsc::Sender<Chunk>) -> Result<Vec<Chunk>>;

    /// Total size of the file in bytes.
    fn num_bytes(&self) -> u64;

    /// The original path or URL.
    fn file_path(&self) -> &str;

    /// Stop accepting requests and release OS resources.
    fn close(&self);

    fn closed(&self) -> bool;

    fn counters(&self) -> &Counters;
}

/// URL scheme of a path, after stripping any trailing object path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scheme {
    Local(String),
    Http(String),
    XRootD(String),
}

fn is_windows_drive(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 3
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && (bytes[2] == b'\\' || bytes[2] == b'/')
}

/// Split `"file.root:dir/tree"` into the file part and the in-file object
/// path. One colon only, and only after URL scheme parsing, so
/// `root://host:1094//x.root` and `C:\data\x.root` survive intact.
pub fn split_object_path(path: &str) -> (String, Option<String>) {
    let search_from = if let Some(idx) = path.find("://") {
        // Skip "scheme://authority" so host:port colons are not split points.
        let after = idx + 3;
        match path[after..].find('/') {
            Some(slash) => after + slash,
            None => path.len(),
        }
    } else if is_windows_drive(path) {
        2
    } else {
        0
    };

    match path[search_from..].rfind(':') {
        Some(colon) => {
            let at = search_from + colon;
            (path[..at].to_string(), Some(path[at + 1..].to_string()))
        }
        None => (path.to_string(), None),
    }
}

/// Classify a file path or URL, stripping any query string into `options`.
pub fn parse_scheme(file_path: &str, options: &mut Options) -> Scheme {
    let (without_query, query) = match file_path.split_once('?') {
        Some((head, query)) => (head, Some(query)),
        None => (file_path, None),
    };
    if let Some(query) = query {
        options.apply_query(query);
    }

    if let Some(rest) = without_query.strip_prefix("file://") {
        Scheme::Local(rest.to_string())
    } else if without_query.starts_with("http://") || without_query.starts_with("https://") {
        Scheme::Http(without_query.to_string())
    } else if without_query.starts_with("root://") {
        Scheme::XRootD(without_query.to_string())
    } else {
        Scheme::Local(without_query.to_string())
    }
}

/// Build the source a path calls for, honoring the handler overrides.
pub fn open_source(file_path: &str, options: &Options) -> Result<Box<dyn Source>> {
    let mut options = options.clone();
    match parse_scheme(file_path, &mut options) {
        Scheme::Local(path) => match options.file_handler {
            FileHandler::Mmap => file::MmapSource::open(&path, &options),
            FileHandler::Pread => Ok(Box::new(file::MultithreadedFileSource::open(
                &path,
                options.num_workers,
            )?)),
        },
        Scheme::Http(url) => match options.http_handler {
            HttpHandler::Multipart => Ok(Box::new(http::HttpSource::open(&url, &options)?)),
            HttpHandler::Multithreaded => Ok(Box::new(http::MultithreadedHttpSource::open(
                &url, &options,
            )?)),
        },
        Scheme::XRootD(url) => match options.xrootd_handler {
            XRootDHandler::Vectored => Ok(Box::new(xrootd::XRootDSource::open(&url, &options)?)),
            XRootDHandler::Multithreaded => Ok(Box::new(
                xrootd::MultithreadedXRootDSource::open(&url, &options)?,
            )),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_path_splitting() {
        assert_eq!(
            split_object_path("file.root:dir/tree"),
            ("file.root".into(), Some("dir/tree".into()))
        );
        assert_eq!(split_object_path("file.root"), ("file.root".into(), None));
        assert_eq!(
            split_object_path("root://host:1094//data/file.root:events"),
            (
                "root://host:1094//data/file.root".into(),
                Some("events".into())
            )
        );
        assert_eq!(
            split_object_path("root://host:1094//data/file.root"),
            ("root://host:1094//data/file.root".into(), None)
        );
        assert_eq!(
            split_object_path(r"C:\data\file.root"),
            (r"C:\data\file.root".into(), None)
        );
        assert_eq!(
            split_object_path(r"C:\data\file.root:tree"),
            (r"C:\data\file.root".into(), Some("tree".into()))
        );
    }

    #[test]
    fn scheme_parsing_and_query() {
        let mut options = Options::default();
        assert_eq!(
            parse_scheme("file:///tmp/x.root", &mut options),
            Scheme::Local("/tmp/x.root".into())
        );
        assert_eq!(
            parse_scheme("https://host/x.root", &mut options),
            Scheme::Http("https://host/x.root".into())
        );
        assert_eq!(
            parse_scheme("root://host//x.root?timeout=5&workers=3", &mut options),
            Scheme::XRootD("root://host//x.root".into())
        );
        assert_eq!(options.timeout, Duration::from_secs(5));
        assert_eq!(options.num_workers, 3);
    }
}
