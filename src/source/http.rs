//! HTTP(S) sources.
//!
//! [`HttpSource`] sends one `Range` header with many intervals per vector
//! read and parses the `multipart/byteranges` answer; servers that reply
//! without multipart demote the source to a [`MultithreadedHttpSource`]
//! worker pool of single-range requests for the rest of its life.

use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::OnceCell;
use tracing::debug;

use crate::chunk::{Chunk, ChunkWriter};
use crate::error::{Error, Result};
use crate::source::{Counters, Options, ResourcePool, Source};

fn http_error(url: &str, start: u64, stop: u64, message: String) -> Error {
    Error::Source {
        path: url.to_string(),
        range: start..stop,
        source: std::io::Error::new(std::io::ErrorKind::Other, message),
    }
}

fn make_agent(timeout: Duration) -> ureq::Agent {
    ureq::AgentBuilder::new().timeout(timeout).build()
}

/// One ranged GET. Servers answering 200 get their body sliced locally so a
/// range-blind server still works for small files.
fn fetch_range(agent: &ureq::Agent, url: &str, start: u64, stop: u64) -> Result<Vec<u8>> {
    let response = agent
        .get(url)
        .set("Range", &format!("bytes={}-{}", start, stop - 1))
        .call()
        .map_err(|err| http_error(url, start, stop, err.to_string()))?;

    let status = response.status();
    let mut body = Vec::with_capacity((stop - start) as usize);
    response
        .into_reader()
        .read_to_end(&mut body)
        .map_err(|err| http_error(url, start, stop, err.to_string()))?;

    match status {
        206 => Ok(body),
        200 => {
            if (stop as usize) <= body.len() {
                Ok(body[start as usize..stop as usize].to_vec())
            } else {
                Err(http_error(
                    url,
                    start,
                    stop,
                    format!("server ignored Range and sent only {} bytes", body.len()),
                ))
            }
        }
        other => Err(http_error(
            url,
            start,
            stop,
            format!("HTTP status {}", other),
        )),
    }
}

/// Discover the file size from a one-byte ranged request.
fn probe_num_bytes(agent: &ureq::Agent, url: &str) -> Result<u64> {
    let response = agent
        .get(url)
        .set("Range", "bytes=0-0")
        .call()
        .map_err(|err| http_error(url, 0, 1, err.to_string()))?;

    if response.status() == 206 {
        let content_range = response.header("Content-Range").unwrap_or("");
        if let Some(total) = content_range.rsplit('/').next() {
            if let Ok(total) = total.trim().parse::<u64>() {
                return Ok(total);
            }
        }
    }
    response
        .header("Content-Length")
        .and_then(|v| v.parse::<u64>().ok())
        .ok_or_else(|| {
            http_error(
                url,
                0,
                1,
                "server reported neither Content-Range nor Content-Length".into(),
            )
        })
}

/// One part of a `multipart/byteranges` body.
struct Part {
    start: u64,
    stop: u64,
    data: Vec<u8>,
}

/// Parse a multipart/byteranges payload into its ranged parts.
///
/// Grammar: `--boundary CRLF headers CRLF CRLF data CRLF` repeated, closed by
/// `--boundary--`. Each part's range comes from its `Content-Range` header.
fn parse_multipart(body: &[u8], boundary: &str) -> Option<Vec<Part>> {
    let marker = format!("--{}", boundary).into_bytes();
    let mut parts = Vec::new();
    let mut pos = find(body, &marker, 0)?;

    loop {
        pos += marker.len();
        if body[pos..].starts_with(b"--") {
            return Some(parts);
        }
        // skip the CRLF after the boundary line
        pos = find(body, b"\r\n", pos)? + 2;

        // headers until the blank line
        let headers_end = find(body, b"\r\n\r\n", pos)?;
        let headers = String::from_utf8_lossy(&body[pos..headers_end]);
        let mut range = None;
        for line in headers.lines() {
            let lower = line.to_ascii_lowercase();
            if let Some(rest) = lower.strip_prefix("content-range:") {
                let rest = rest.trim().strip_prefix("bytes")?.trim();
                let (span, _total) = rest.split_once('/')?;
                let (a, b) = span.split_once('-')?;
                range = Some((a.trim().parse::<u64>().ok()?, b.trim().parse::<u64>().ok()?));
            }
        }
        let (first, last) = range?;
        let data_start = headers_end + 4;
        let data_stop = data_start + (last - first + 1) as usize;
        if data_stop > body.len() {
            return None;
        }
        parts.push(Part {
            start: first,
            stop: last + 1,
            data: body[data_start..data_stop].to_vec(),
        });
        pos = find(body, &marker, data_stop)?;
    }
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|i| from + i)
}

/// HTTP(S) source using multipart range requests for vector reads.
pub struct HttpSource {
    url: Arc<str>,
    agent: ureq::Agent,
    num_bytes: u64,
    closed: AtomicBool,
    counters: Counters,
    num_fallback_workers: usize,
    timeout: Duration,
    fallback: Arc<OnceCell<MultithreadedHttpSource>>,
    /// One worker that issues the combined multipart request, so vector
    /// reads return pending chunks immediately.
    requester: ResourcePool<()>,
}

impl HttpSource {
    pub fn open(url: &str, options: &Options) -> Result<HttpSource> {
        let agent = make_agent(options.timeout);
        let num_bytes = probe_num_bytes(&agent, url)?;
        debug!(url, num_bytes, "opened HTTP source");
        Ok(HttpSource {
            url: url.into(),
            agent,
            num_bytes,
            closed: AtomicBool::new(false),
            counters: Counters::default(),
            num_fallback_workers: options.num_workers.max(1),
            timeout: options.timeout,
            fallback: Arc::new(OnceCell::new()),
            requester: ResourcePool::new(vec![()]),
        })
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(Error::Closed {
                path: self.url.to_string(),
            })
        } else {
            Ok(())
        }
    }

}

/// Issue the combined request and fill each pending chunk from its part.
fn multipart_request(
    agent: &ureq::Agent,
    url: &str,
    ranges: &[(u64, u64)],
    writers: Vec<ChunkWriter>,
) -> std::result::Result<(), Vec<ChunkWriter>> {
    let header = ranges
        .iter()
        .map(|&(a, b)| format!("{}-{}", a, b - 1))
        .collect::<Vec<_>>()
        .join(",");

    let response = match agent
        .get(url)
        .set("Range", &format!("bytes={}", header))
        .call()
    {
        Ok(response) => response,
        Err(_) => return Err(writers),
    };

    let content_type = response.header("Content-Type").unwrap_or("").to_string();
    let boundary = content_type
        .to_ascii_lowercase()
        .contains("multipart/byteranges")
        .then(|| {
            content_type
                .split("boundary=")
                .nth(1)
                .map(|b| b.trim_matches('"').trim().to_string())
        })
        .flatten();

    let boundary = match (response.status(), boundary) {
        (206, Some(boundary)) => boundary,
        _ => return Err(writers),
    };

    let mut body = Vec::new();
    if response.into_reader().read_to_end(&mut body).is_err() {
        return Err(writers);
    }
    let parts = match parse_multipart(&body, &boundary) {
        Some(parts) => parts,
        None => return Err(writers),
    };

    let mut writers: Vec<Option<ChunkWriter>> = writers.into_iter().map(Some).collect();
    for part in parts {
        if let Some(slot) = ranges
            .iter()
            .position(|&(a, b)| (a, b) == (part.start, part.stop))
        {
            if let Some(writer) = writers[slot].take() {
                writer.fulfill(part.data);
            }
        }
    }
    for writer in writers.into_iter().flatten() {
        writer.fail(format!(
            "multipart response from {} was missing a requested range",
            url
        ));
    }
    Ok(())
}

impl Source for HttpSource {
    fn chunk(&self, start: u64, stop: u64) -> Result<Chunk> {
        self.check_open()?;
        self.counters.record(1, stop - start);
        let data = fetch_range(&self.agent, &self.url, start, stop)?;
        if data.len() as u64 != stop - start {
            return Err(http_error(
                &self.url,
                start,
                stop,
                format!("expected {} bytes, received {}", stop - start, data.len()),
            ));
        }
        Ok(Chunk::ready(Arc::clone(&self.url), start, data))
    }

    fn chunks(&self, ranges: &[(u64, u64)], sink: &mpsc::Sender<Chunk>) -> Result<Vec<Chunk>> {
        self.check_open()?;
        self.counters.record(
            ranges.len() as u64,
            ranges.iter().map(|(a, b)| b - a).sum(),
        );

        if let Some(fallback) = self.fallback.get() {
            return fallback.chunks(ranges, sink);
        }

        let mut chunks = Vec::with_capacity(ranges.len());
        let mut writers = Vec::with_capacity(ranges.len());
        for &(start, stop) in ranges {
            let (chunk, writer) = Chunk::pending(Arc::clone(&self.url), start, stop);
            let _ = sink.send(chunk.clone());
            chunks.push(chunk);
            writers.push(writer);
        }

        let agent = self.agent.clone();
        let url = Arc::clone(&self.url);
        let owned_ranges: Vec<(u64, u64)> = ranges.to_vec();
        let fallback_cell = Arc::clone(&self.fallback);
        let timeout = self.timeout;
        let num_fallback_workers = self.num_fallback_workers;
        let num_bytes = self.num_bytes;

        self.requester.submit(&self.url, move |_| {
            if let Err(writers) = multipart_request(&agent, &url, &owned_ranges, writers) {
                // Replay the same ranges through the single-range pool; the
                // original pending chunks are filled from the pool's results.
                debug!(url = &*url, "server did not answer multipart; using single-range pool");
                let fallback = fallback_cell.get_or_try_init(|| {
                    MultithreadedHttpSource::open_sized(
                        &url,
                        timeout,
                        num_fallback_workers,
                        num_bytes,
                    )
                });
                match fallback {
                    Ok(fallback) => {
                        for (&(start, stop), writer) in owned_ranges.iter().zip(writers) {
                            let url = Arc::clone(&url);
                            let submitted =
                                fallback.submit_raw(start, stop, move |result| match result {
                                    Ok(data) => writer.fulfill(data),
                                    Err(err) => {
                                        writer.fail(format!("{} in file {}", err, url))
                                    }
                                });
                            // a refused submission drops the writer, which
                            // fails the chunk rather than hanging readers
                            let _ = submitted;
                        }
                    }
                    Err(err) => {
                        for writer in writers {
                            writer.fail(err.to_string());
                        }
                    }
                }
            }
        })?;
        Ok(chunks)
    }

    fn num_bytes(&self) -> u64 {
        self.num_bytes
    }

    fn file_path(&self) -> &str {
        &self.url
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.requester.close();
        if let Some(fallback) = self.fallback.get() {
            fallback.close();
        }
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn counters(&self) -> &Counters {
        &self.counters
    }
}

struct HttpResource {
    url: Arc<str>,
    agent: ureq::Agent,
}

/// A pool of connections issuing one single-range request at a time.
pub struct MultithreadedHttpSource {
    url: Arc<str>,
    pool: ResourcePool<HttpResource>,
    num_bytes: u64,
    counters: Counters,
}

impl MultithreadedHttpSource {
    pub fn open(url: &str, options: &Options) -> Result<MultithreadedHttpSource> {
        let agent = make_agent(options.timeout);
        let num_bytes = probe_num_bytes(&agent, url)?;
        Self::open_sized(url, options.timeout, options.num_workers, num_bytes)
    }

    fn open_sized(
        url: &str,
        timeout: Duration,
        num_workers: usize,
        num_bytes: u64,
    ) -> Result<MultithreadedHttpSource> {
        let shared: Arc<str> = url.into();
        let resources = (0..num_workers.max(1))
            .map(|_| HttpResource {
                url: Arc::clone(&shared),
                agent: make_agent(timeout),
            })
            .collect();
        Ok(MultithreadedHttpSource {
            url: shared,
            pool: ResourcePool::new(resources),
            num_bytes,
            counters: Counters::default(),
        })
    }

    fn submit_raw(
        &self,
        start: u64,
        stop: u64,
        complete: impl FnOnce(Result<Vec<u8>>) + Send + 'static,
    ) -> Result<()> {
        self.pool
            .submit(&self.url, move |resource: &mut HttpResource| {
                complete(fetch_range(&resource.agent, &resource.url, start, stop));
            })
    }

    fn submit(&self, start: u64, stop: u64, sink: Option<mpsc::Sender<Chunk>>) -> Result<Chunk> {
        let (chunk, writer) = Chunk::pending(Arc::clone(&self.url), start, stop);
        let notify = chunk.clone();
        self.submit_raw(start, stop, move |result| {
            match result {
                Ok(data) => writer.fulfill(data),
                Err(err) => writer.fail(err.to_string()),
            }
            if let Some(sink) = sink {
                let _ = sink.send(notify);
            }
        })?;
        Ok(chunk)
    }
}

impl Source for MultithreadedHttpSource {
    fn chunk(&self, start: u64, stop: u64) -> Result<Chunk> {
        self.counters.record(1, stop - start);
        self.submit(start, stop, None)
    }

    fn chunks(&self, ranges: &[(u64, u64)], sink: &mpsc::Sender<Chunk>) -> Result<Vec<Chunk>> {
        self.counters.record(
            ranges.len() as u64,
            ranges.iter().map(|(a, b)| b - a).sum(),
        );
        ranges
            .iter()
            .map(|&(start, stop)| self.submit(start, stop, Some(sink.clone())))
            .collect()
    }

    fn num_bytes(&self) -> u64 {
        self.num_bytes
    }

    fn file_path(&self) -> &str {
        &self.url
    }

    fn close(&self) {
        self.pool.close();
    }

    fn closed(&self) -> bool {
        self.pool.closed()
    }

    fn counters(&self) -> &Counters {
        &self.counters
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multipart_bodies_parse_into_ranged_parts() {
        let body = b"--SEP\r\n\
Content-Type: application/octet-stream\r\n\
Content-Range: bytes 0-4/100\r\n\
\r\n\
hello\r\n\
--SEP\r\n\
Content-Range: bytes 10-12/100\r\n\
\r\n\
abc\r\n\
--SEP--";
        let parts = parse_multipart(body, "SEP").unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!((parts[0].start, parts[0].stop), (0, 5));
        assert_eq!(parts[0].data, b"hello");
        assert_eq!((parts[1].start, parts[1].stop), (10, 13));
        assert_eq!(parts[1].data, b"abc");
    }

    #[test]
    fn truncated_multipart_is_rejected() {
        let body = b"--SEP\r\nContent-Range: bytes 0-99/100\r\n\r\nshort\r\n--SEP--";
        assert!(parse_multipart(body, "SEP").is_none());
    }
}
