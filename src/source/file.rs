//! Local-file sources: memory-mapped by default, a positioned-read worker
//! pool as the fallback and as the explicit `pread` handler.

use std::fs::File;
use std::io;
use std::sync::mpsc;
use std::sync::Arc;

use memmap2::Mmap;
use tracing::debug;

use crate::chunk::Chunk;
use crate::error::{Error, Result};
use crate::source::{Counters, Options, ResourcePool, Source};

#[cfg(unix)]
use std::os::unix::fs::FileExt;

fn source_error(path: &str, start: u64, stop: u64, err: io::Error) -> Error {
    Error::Source {
        path: path.to_string(),
        range: start..stop,
        source: err,
    }
}

/// A memory-mapped local file.
///
/// Chunks are copies of the mapped range, so they stay valid after the file
/// is closed. When mapping fails the source silently degrades to a
/// [`MultithreadedFileSource`] sized by `num_fallback_workers`.
pub struct MmapSource {
    path: Arc<str>,
    map: std::sync::Mutex<Option<Mmap>>,
    num_bytes: u64,
    counters: Counters,
}

impl MmapSource {
    pub fn open(path: &str, options: &Options) -> Result<Box<dyn Source>> {
        let file = File::open(path)
            .map_err(|err| source_error(path, 0, 0, err))?;
        let len = file
            .metadata()
            .map_err(|err| source_error(path, 0, 0, err))?
            .len();

        // SAFETY: the map is read-only and private to this source; chunks
        // copy out of it, so no reference outlives the mapping.
        match unsafe { Mmap::map(&file) } {
            Ok(map) => {
                debug!(path, len, "opened memory-mapped source");
                Ok(Box::new(MmapSource {
                    path: path.into(),
                    map: std::sync::Mutex::new(Some(map)),
                    num_bytes: len,
                    counters: Counters::default(),
                }))
            }
            Err(err) => {
                debug!(path, %err, "mmap failed, falling back to pread workers");
                Ok(Box::new(MultithreadedFileSource::open(
                    path,
                    options.num_fallback_workers,
                )?))
            }
        }
    }

    fn read(&self, start: u64, stop: u64) -> Result<Vec<u8>> {
        let guard = self.map.lock().expect("mmap lock poisoned");
        let map = guard.as_ref().ok_or_else(|| Error::Closed {
            path: self.path.to_string(),
        })?;
        if stop > map.len() as u64 || start > stop {
            return Err(source_error(
                &self.path,
                start,
                stop,
                io::Error::new(io::ErrorKind::UnexpectedEof, "range past end of file"),
            ));
        }
        Ok(map[start as usize..stop as usize].to_vec())
    }
}

impl Source for MmapSource {
    fn chunk(&self, start: u64, stop: u64) -> Result<Chunk> {
        self.counters.record(1, stop - start);
        let data = self.read(start, stop)?;
        Ok(Chunk::ready(Arc::clone(&self.path), start, data))
    }

    fn chunks(&self, ranges: &[(u64, u64)], sink: &mpsc::Sender<Chunk>) -> Result<Vec<Chunk>> {
        self.counters.record(
            ranges.len() as u64,
            ranges.iter().map(|(a, b)| b - a).sum(),
        );
        let mut out = Vec::with_capacity(ranges.len());
        for &(start, stop) in ranges {
            let data = self.read(start, stop)?;
            let chunk = Chunk::ready(Arc::clone(&self.path), start, data);
            let _ = sink.send(chunk.clone());
            out.push(chunk);
        }
        Ok(out)
    }

    fn num_bytes(&self) -> u64 {
        self.num_bytes
    }

    fn file_path(&self) -> &str {
        &self.path
    }

    fn close(&self) {
        self.map.lock().expect("mmap lock poisoned").take();
    }

    fn closed(&self) -> bool {
        self.map.lock().expect("mmap lock poisoned").is_none()
    }

    fn counters(&self) -> &Counters {
        &self.counters
    }
}

struct FileResource {
    path: Arc<str>,
    file: File,
}

impl FileResource {
    fn get(&mut self, start: u64, stop: u64) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; (stop - start) as usize];
        #[cfg(unix)]
        {
            self.file.read_exact_at(&mut buf, start)?;
        }
        #[cfg(not(unix))]
        {
            use std::io::{Read, Seek, SeekFrom};
            self.file.seek(SeekFrom::Start(start))?;
            self.file.read_exact(&mut buf)?;
        }
        Ok(buf)
    }
}

/// A pool of file handles, each owned by one worker thread.
pub struct MultithreadedFileSource {
    path: Arc<str>,
    pool: ResourcePool<FileResource>,
    num_bytes: u64,
    counters: Counters,
}

impl MultithreadedFileSource {
    pub fn open(path: &str, num_workers: usize) -> Result<MultithreadedFileSource> {
        let shared: Arc<str> = path.into();
        let num_bytes = std::fs::metadata(path)
            .map_err(|err| source_error(path, 0, 0, err))?
            .len();

        let mut resources = Vec::new();
        for _ in 0..num_workers.max(1) {
            resources.push(FileResource {
                path: Arc::clone(&shared),
                file: File::open(path).map_err(|err| source_error(path, 0, 0, err))?,
            });
        }
        debug!(path, num_workers, "opened pread source");

        Ok(MultithreadedFileSource {
            path: shared,
            pool: ResourcePool::new(resources),
            num_bytes,
            counters: Counters::default(),
        })
    }

    fn submit(&self, start: u64, stop: u64, sink: Option<mpsc::Sender<Chunk>>) -> Result<Chunk> {
        let (chunk, writer) = Chunk::pending(Arc::clone(&self.path), start, stop);
        let notify = chunk.clone();
        self.pool
            .submit(&self.path, move |resource: &mut FileResource| {
                match resource.get(start, stop) {
                    Ok(data) => writer.fulfill(data),
                    Err(err) => writer.fail(format!("{} in file {}", err, resource.path)),
                }
                if let Some(sink) = sink {
                    let _ = sink.send(notify);
                }
            })?;
        Ok(chunk)
    }
}

impl Source for MultithreadedFileSource {
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
        &self.path
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
    use std::io::Write;

    fn scratch_file(contents: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn mmap_source_round_trip() {
        let file = scratch_file(b"0123456789abcdef");
        let source = MmapSource::open(file.path().to_str().unwrap(), &Options::default()).unwrap();
        assert_eq!(source.num_bytes(), 16);

        let chunk = source.chunk(4, 10).unwrap();
        assert_eq!((chunk.start(), chunk.stop()), (4, 10));
        assert_eq!(&*chunk.raw_data().unwrap(), b"456789");

        source.close();
        assert!(source.closed());
        assert!(matches!(source.chunk(0, 1), Err(Error::Closed { .. })));
    }

    #[test]
    fn pread_vector_read_preserves_ranges() {
        let file = scratch_file(b"the quick brown fox jumps over");
        let source =
            MultithreadedFileSource::open(file.path().to_str().unwrap(), 3).unwrap();

        let ranges = [(0u64, 3u64), (4, 9), (10, 15)];
        let (sink, notifications) = mpsc::channel();
        let chunks = source.chunks(&ranges, &sink).unwrap();

        for (chunk, &(start, stop)) in chunks.iter().zip(&ranges) {
            assert_eq!((chunk.start(), chunk.stop()), (start, stop));
            assert_eq!(chunk.len(), stop - start);
        }
        assert_eq!(&*chunks[1].raw_data().unwrap(), b"quick");

        // every chunk also shows up on the notification channel
        let mut seen = 0;
        while seen < ranges.len() {
            let c = notifications.recv().unwrap();
            c.wait().unwrap();
            seen += 1;
        }
        assert_eq!(source.counters().num_requested_chunks(), 3);
    }

    #[test]
    fn pread_read_past_end_fails_the_chunk() {
        let file = scratch_file(b"tiny");
        let source = MultithreadedFileSource::open(file.path().to_str().unwrap(), 1).unwrap();
        let chunk = source.chunk(0, 100).unwrap();
        assert!(chunk.raw_data().is_err());
    }
}
