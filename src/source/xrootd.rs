//! XRootD sources: a minimal blocking client for the xroot wire protocol,
//! enough to open a remote file, stat it, and issue single and vector reads.
//!
//! [`XRootDSource`] drives one session and packs many ranges into
//! `kXR_readv` requests, bounded by the server's `readv_iov_max` /
//! `readv_ior_max` configuration (queried once at open; local redirects use
//! the stock defaults to avoid the round trip). Ranges larger than the
//! per-element cap fall back to sequential single reads.
//! [`MultithreadedXRootDSource`] keeps one session per worker instead.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use binrw::{BinRead, BinReaderExt};
use tracing::{debug, warn};

use crate::chunk::{Chunk, ChunkWriter};
use crate::error::{Error, Result};
use crate::source::{Counters, Options, ResourcePool, Source};

const KXR_QUERY: u16 = 3001;
const KXR_CLOSE: u16 = 3003;
const KXR_PROTOCOL: u16 = 3006;
const KXR_LOGIN: u16 = 3007;
const KXR_OPEN: u16 = 3010;
const KXR_READ: u16 = 3013;
const KXR_STAT: u16 = 3017;
const KXR_READV: u16 = 3025;

const KXR_OK: u16 = 0;
const KXR_OKSOFAR: u16 = 4000;
const KXR_ERROR: u16 = 4003;
const KXR_REDIRECT: u16 = 4004;
const KXR_WAIT: u16 = 4005;

const KXR_OPEN_READ: u16 = 0x0010;
const KXR_QCONFIG: u16 = 2;

/// Defaults used when the server cannot be asked (matches stock servers).
const DEFAULT_READV_IOV_MAX: usize = 1024;
const DEFAULT_READV_IOR_MAX: u64 = 2_097_136;

const MAX_REDIRECTS: usize = 4;
const MAX_WAITS: usize = 3;

#[derive(BinRead)]
#[br(big)]
struct ResponseHeader {
    #[allow(dead_code)]
    streamid: u16,
    status: u16,
    dlen: i32,
}

/// One element of a `kXR_readv` response: the request echoed back, followed
/// by that many bytes of data.
#[derive(BinRead)]
#[br(big)]
struct ReadSegmentHeader {
    #[allow(dead_code)]
    fhandle: [u8; 4],
    rlen: i32,
    offset: i64,
}

fn net_error(url: &str, message: impl Into<String>) -> Error {
    Error::Source {
        path: url.to_string(),
        range: 0..0,
        source: std::io::Error::new(std::io::ErrorKind::Other, message.into()),
    }
}

/// `root://host[:port]//path` → (host, port, path-as-sent-to-the-server).
fn parse_url(url: &str) -> Result<(String, u16, String)> {
    let rest = url
        .strip_prefix("root://")
        .ok_or_else(|| net_error(url, "not a root:// URL"))?;
    let (authority, path) = match rest.find('/') {
        Some(slash) => (&rest[..slash], &rest[slash..]),
        None => return Err(net_error(url, "root:// URL has no path")),
    };
    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) => (
            host.to_string(),
            port.parse::<u16>()
                .map_err(|_| net_error(url, "bad port in root:// URL"))?,
        ),
        None => (authority.to_string(), 1094),
    };
    // "//path" addresses the absolute path "/path"
    let path = if let Some(doubled) = path.strip_prefix("//") {
        format!("/{}", doubled)
    } else {
        path.to_string()
    };
    Ok((host, port, path))
}

/// One logged-in session with an open file handle.
struct XrdSession {
    url: Arc<str>,
    stream: TcpStream,
    fhandle: [u8; 4],
    num_bytes: u64,
    path: String,
}

impl XrdSession {
    fn connect(url: &str, timeout: Duration) -> Result<XrdSession> {
        let (mut host, mut port, path) = parse_url(url)?;
        for _ in 0..=MAX_REDIRECTS {
            match XrdSession::connect_once(url, &host, port, &path, timeout)? {
                Connected::Session(session) => return Ok(session),
                Connected::Redirect(new_host, new_port) => {
                    debug!(url, new_host, new_port, "following xrootd redirect");
                    host = new_host;
                    port = new_port;
                }
            }
        }
        Err(net_error(url, "too many redirects"))
    }

    fn connect_once(
        url: &str,
        host: &str,
        port: u16,
        path: &str,
        timeout: Duration,
    ) -> Result<Connected> {
        let stream = TcpStream::connect((host, port))
            .map_err(|err| net_error(url, err.to_string()))?;
        stream
            .set_read_timeout(Some(timeout))
            .and_then(|_| stream.set_write_timeout(Some(timeout)))
            .map_err(|err| net_error(url, err.to_string()))?;

        let mut session = XrdSession {
            url: url.into(),
            stream,
            fhandle: [0; 4],
            num_bytes: 0,
            path: path.to_string(),
        };

        // 20-byte client handshake: 0 0 0 4 2012
        let mut hello = Vec::with_capacity(20);
        for word in [0i32, 0, 0, 4, 2012] {
            hello.extend_from_slice(&word.to_be_bytes());
        }
        session.write_all(&hello)?;
        let mut answer = [0u8; 16];
        session.read_all(&mut answer)?;

        // kXR_protocol: advertise our version, ignore the reply body
        let mut params = [0u8; 16];
        params[..4].copy_from_slice(&0x0310i32.to_be_bytes());
        session.request(KXR_PROTOCOL, params, &[])?;

        // kXR_login: pid + fixed username, no auth
        let mut params = [0u8; 16];
        params[..4].copy_from_slice(&(std::process::id() as i32).to_be_bytes());
        params[4..10].copy_from_slice(b"arbor\0");
        session.request(KXR_LOGIN, params, &[])?;

        // kXR_open read-only
        let mut params = [0u8; 16];
        params[2..4].copy_from_slice(&KXR_OPEN_READ.to_be_bytes());
        let payload = path.as_bytes().to_vec();
        match session.request_raw(KXR_OPEN, params, &payload)? {
            Raw::Data(body) => {
                if body.len() < 4 {
                    return Err(net_error(url, "short kXR_open response"));
                }
                session.fhandle.copy_from_slice(&body[..4]);
            }
            Raw::Redirect(host, port) => return Ok(Connected::Redirect(host, port)),
        }

        session.num_bytes = session.stat()?;
        Ok(Connected::Session(session))
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream
            .write_all(bytes)
            .map_err(|err| net_error(&self.url, err.to_string()))
    }

    fn read_all(&mut self, buf: &mut [u8]) -> Result<()> {
        self.stream
            .read_exact(buf)
            .map_err(|err| net_error(&self.url, err.to_string()))
    }

    fn send(&mut self, requestid: u16, params: [u8; 16], payload: &[u8]) -> Result<()> {
        let mut frame = Vec::with_capacity(24 + payload.len());
        frame.extend_from_slice(&[0, 0]); // streamid: one request in flight
        frame.extend_from_slice(&requestid.to_be_bytes());
        frame.extend_from_slice(&params);
        frame.extend_from_slice(&(payload.len() as i32).to_be_bytes());
        frame.extend_from_slice(payload);
        self.write_all(&frame)
    }

    /// Send a request and collect the complete (possibly `oksofar`-chunked)
    /// response body, handling waits and surfacing redirects.
    fn request_raw(
        &mut self,
        requestid: u16,
        params: [u8; 16],
        payload: &[u8],
    ) -> Result<Raw> {
        for _ in 0..=MAX_WAITS {
            self.send(requestid, params, payload)?;
            let mut body = Vec::new();
            loop {
                let mut head = [0u8; 8];
                self.read_all(&mut head)?;
                let header: ResponseHeader = std::io::Cursor::new(&head)
                    .read_be()
                    .expect("8-byte response header");
                let mut data = vec![0u8; header.dlen.max(0) as usize];
                self.read_all(&mut data)?;

                match header.status {
                    KXR_OKSOFAR => {
                        body.extend_from_slice(&data);
                        continue;
                    }
                    KXR_OK => {
                        body.extend_from_slice(&data);
                        return Ok(Raw::Data(body));
                    }
                    KXR_ERROR => {
                        let message = if data.len() > 4 {
                            String::from_utf8_lossy(&data[4..]).into_owned()
                        } else {
                            "unknown xrootd error".to_string()
                        };
                        return Err(net_error(&self.url, message));
                    }
                    KXR_REDIRECT => {
                        if data.len() < 4 {
                            return Err(net_error(&self.url, "short redirect response"));
                        }
                        let port = i32::from_be_bytes(data[..4].try_into().expect("4 bytes"));
                        let host = String::from_utf8_lossy(&data[4..])
                            .trim_end_matches('\0')
                            .split(&['?', '\n'][..])
                            .next()
                            .unwrap_or("")
                            .to_string();
                        return Ok(Raw::Redirect(host, port.max(0) as u16));
                    }
                    KXR_WAIT => {
                        let seconds = if data.len() >= 4 {
                            i32::from_be_bytes(data[..4].try_into().expect("4 bytes")).max(1)
                        } else {
                            1
                        };
                        std::thread::sleep(Duration::from_secs(seconds.min(5) as u64));
                        break; // resend the request
                    }
                    other => {
                        return Err(net_error(
                            &self.url,
                            format!("unexpected xrootd status {}", other),
                        ))
                    }
                }
            }
        }
        Err(net_error(&self.url, "server kept asking us to wait"))
    }

    fn request(&mut self, requestid: u16, params: [u8; 16], payload: &[u8]) -> Result<Vec<u8>> {
        match self.request_raw(requestid, params, payload)? {
            Raw::Data(body) => Ok(body),
            Raw::Redirect(..) => Err(net_error(
                &self.url,
                "unexpected redirect in established session",
            )),
        }
    }

    /// File size via `kXR_stat` ("id size flags modtime").
    fn stat(&mut self) -> Result<u64> {
        let payload = self.path.clone().into_bytes();
        let body = self.request(KXR_STAT, [0u8; 16], &payload)?;
        let text = String::from_utf8_lossy(&body);
        text.split_whitespace()
            .nth(1)
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| net_error(&self.url, format!("unparseable stat response {:?}", text)))
    }

    /// `readv_iov_max` and `readv_ior_max` from the server configuration.
    fn server_config(&mut self) -> (usize, u64) {
        let mut params = [0u8; 16];
        params[..2].copy_from_slice(&KXR_QCONFIG.to_be_bytes());
        match self.request(KXR_QUERY, params, b"readv_iov_max readv_ior_max") {
            Ok(body) => {
                let text = String::from_utf8_lossy(&body);
                let mut lines = text.split_whitespace();
                let iov = lines.next().and_then(|v| v.parse::<usize>().ok());
                let ior = lines.next().and_then(|v| v.parse::<u64>().ok());
                match (iov, ior) {
                    (Some(iov), Some(ior)) => (iov, ior),
                    _ => {
                        warn!(url = &*self.url, "unparseable readv config, using defaults");
                        (DEFAULT_READV_IOV_MAX, DEFAULT_READV_IOR_MAX)
                    }
                }
            }
            Err(err) => {
                warn!(url = &*self.url, %err, "readv config query failed, using defaults");
                (DEFAULT_READV_IOV_MAX, DEFAULT_READV_IOR_MAX)
            }
        }
    }

    fn read(&mut self, start: u64, stop: u64) -> Result<Vec<u8>> {
        let mut params = [0u8; 16];
        params[..4].copy_from_slice(&self.fhandle);
        params[4..12].copy_from_slice(&(start as i64).to_be_bytes());
        params[12..16].copy_from_slice(&((stop - start) as i32).to_be_bytes());
        let body = self.request(KXR_READ, params, &[])?;
        if body.len() as u64 != stop - start {
            return Err(Error::Source {
                path: self.url.to_string(),
                range: start..stop,
                source: std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("expected {} bytes, received {}", stop - start, body.len()),
                ),
            });
        }
        Ok(body)
    }

    /// One `kXR_readv` for at most `iov_max` ranges, each under `ior_max`.
    /// Returns `(offset, data)` pairs in response order.
    fn vector_read(&mut self, ranges: &[(u64, u64)]) -> Result<Vec<(u64, Vec<u8>)>> {
        let mut payload = Vec::with_capacity(16 * ranges.len());
        for &(start, stop) in ranges {
            payload.extend_from_slice(&self.fhandle);
            payload.extend_from_slice(&((stop - start) as i32).to_be_bytes());
            payload.extend_from_slice(&(start as i64).to_be_bytes());
        }
        let body = self.request(KXR_READV, [0u8; 16], &payload)?;

        let mut out = Vec::with_capacity(ranges.len());
        let mut reader = std::io::Cursor::new(&body[..]);
        while (reader.position() as usize) < body.len() {
            let segment: ReadSegmentHeader = reader
                .read_be()
                .map_err(|err| net_error(&self.url, format!("bad readv segment: {}", err)))?;
            let mut data = vec![0u8; segment.rlen.max(0) as usize];
            reader
                .read_exact(&mut data)
                .map_err(|err| net_error(&self.url, err.to_string()))?;
            out.push((segment.offset.max(0) as u64, data));
        }
        Ok(out)
    }

    fn close(&mut self) {
        let mut params = [0u8; 16];
        params[..4].copy_from_slice(&self.fhandle);
        let _ = self.send(KXR_CLOSE, params, &[]);
    }
}

enum Connected {
    Session(XrdSession),
    Redirect(String, u16),
}

enum Raw {
    Data(Vec<u8>),
    Redirect(String, u16),
}

/// Vector-read XRootD source over a single session.
pub struct XRootDSource {
    url: Arc<str>,
    pool: ResourcePool<XrdSession>,
    num_bytes: u64,
    readv_iov_max: usize,
    readv_ior_max: u64,
    counters: Counters,
}

impl XRootDSource {
    pub fn open(url: &str, options: &Options) -> Result<XRootDSource> {
        let mut session = XrdSession::connect(url, options.timeout)?;
        let num_bytes = session.num_bytes;

        let (host, _, _) = parse_url(url)?;
        let (mut iov_max, ior_max) = if host == "localhost" || host == "127.0.0.1" {
            // A local server splits vector reads into sequential reads
            // anyway; skip the query round trip.
            (DEFAULT_READV_IOV_MAX, DEFAULT_READV_IOR_MAX)
        } else {
            session.server_config()
        };
        if let Some(cap) = options.max_num_elements {
            iov_max = iov_max.min(cap.max(1));
        }
        debug!(url, num_bytes, iov_max, ior_max, "opened xrootd source");

        Ok(XRootDSource {
            url: url.into(),
            pool: ResourcePool::new(vec![session]),
            num_bytes,
            readv_iov_max: iov_max,
            readv_ior_max: ior_max,
            counters: Counters::default(),
        })
    }
}

impl Source for XRootDSource {
    fn chunk(&self, start: u64, stop: u64) -> Result<Chunk> {
        self.counters.record(1, stop - start);
        let (chunk, writer) = Chunk::pending(Arc::clone(&self.url), start, stop);
        self.pool.submit(&self.url, move |session: &mut XrdSession| {
            match session.read(start, stop) {
                Ok(data) => writer.fulfill(data),
                Err(err) => writer.fail(err.to_string()),
            }
        })?;
        chunk.wait()?;
        Ok(chunk)
    }

    fn chunks(&self, ranges: &[(u64, u64)], sink: &mpsc::Sender<Chunk>) -> Result<Vec<Chunk>> {
        self.counters.record(
            ranges.len() as u64,
            ranges.iter().map(|(a, b)| b - a).sum(),
        );

        let mut chunks = Vec::with_capacity(ranges.len());
        let mut oversize: Vec<((u64, u64), ChunkWriter)> = Vec::new();
        let mut batch: Vec<(u64, u64)> = Vec::new();
        let mut batch_writers: Vec<ChunkWriter> = Vec::new();
        let mut batches: Vec<(Vec<(u64, u64)>, Vec<ChunkWriter>)> = Vec::new();

        for &(start, stop) in ranges {
            let (chunk, writer) = Chunk::pending(Arc::clone(&self.url), start, stop);
            let _ = sink.send(chunk.clone());
            chunks.push(chunk);

            if stop - start > self.readv_ior_max {
                oversize.push(((start, stop), writer));
                continue;
            }
            batch.push((start, stop));
            batch_writers.push(writer);
            if batch.len() == self.readv_iov_max {
                batches.push((std::mem::take(&mut batch), std::mem::take(&mut batch_writers)));
            }
        }
        if !batch.is_empty() {
            batches.push((batch, batch_writers));
        }

        for (ranges, writers) in batches {
            self.pool.submit(&self.url, move |session: &mut XrdSession| {
                match session.vector_read(&ranges) {
                    Ok(segments) => {
                        let mut writers: Vec<Option<ChunkWriter>> =
                            writers.into_iter().map(Some).collect();
                        for (offset, data) in segments {
                            let stop = offset + data.len() as u64;
                            if let Some(slot) = ranges
                                .iter()
                                .position(|&(a, b)| (a, b) == (offset, stop))
                            {
                                if let Some(writer) = writers[slot].take() {
                                    writer.fulfill(data);
                                }
                            }
                        }
                        for writer in writers.into_iter().flatten() {
                            writer.fail("vector read response missed a range".into());
                        }
                    }
                    Err(err) => {
                        for writer in writers {
                            writer.fail(err.to_string());
                        }
                    }
                }
            })?;
        }

        // Over-size elements cannot ride in a readv; read them sequentially.
        for ((start, stop), writer) in oversize {
            self.pool.submit(&self.url, move |session: &mut XrdSession| {
                match session.read(start, stop) {
                    Ok(data) => writer.fulfill(data),
                    Err(err) => writer.fail(err.to_string()),
                }
            })?;
        }

        Ok(chunks)
    }

    fn num_bytes(&self) -> u64 {
        self.num_bytes
    }

    fn file_path(&self) -> &str {
        &self.url
    }

    fn close(&self) {
        let _ = self
            .pool
            .submit(&self.url, |session: &mut XrdSession| session.close());
        self.pool.close();
    }

    fn closed(&self) -> bool {
        self.pool.closed()
    }

    fn counters(&self) -> &Counters {
        &self.counters
    }
}

/// One session per worker, single-range requests only.
pub struct MultithreadedXRootDSource {
    url: Arc<str>,
    pool: ResourcePool<XrdSession>,
    num_bytes: u64,
    counters: Counters,
}

impl MultithreadedXRootDSource {
    pub fn open(url: &str, options: &Options) -> Result<MultithreadedXRootDSource> {
        let mut sessions = Vec::new();
        for _ in 0..options.num_workers.max(1) {
            sessions.push(XrdSession::connect(url, options.timeout)?);
        }
        let num_bytes = sessions[0].num_bytes;
        Ok(MultithreadedXRootDSource {
            url: url.into(),
            pool: ResourcePool::new(sessions),
            num_bytes,
            counters: Counters::default(),
        })
    }

    fn submit(&self, start: u64, stop: u64, sink: Option<mpsc::Sender<Chunk>>) -> Result<Chunk> {
        let (chunk, writer) = Chunk::pending(Arc::clone(&self.url), start, stop);
        let notify = chunk.clone();
        self.pool.submit(&self.url, move |session: &mut XrdSession| {
            match session.read(start, stop) {
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

impl Source for MultithreadedXRootDSource {
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
        let _ = self
            .pool
            .submit(&self.url, |session: &mut XrdSession| session.close());
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
    fn url_parsing() {
        assert_eq!(
            parse_url("root://eospublic.cern.ch//eos/file.root").unwrap(),
            ("eospublic.cern.ch".into(), 1094, "/eos/file.root".into())
        );
        assert_eq!(
            parse_url("root://host:2094//data/a.root").unwrap(),
            ("host".into(), 2094, "/data/a.root".into())
        );
        assert!(parse_url("http://nope").is_err());
        assert!(parse_url("root://hostonly").is_err());
    }
}
