//! The byte window ([`Chunk`]) and read pointer ([`Cursor`]) that everything
//! above the physical layer is written against.
//!
//! A chunk is a range of bytes requested from a source. It may be filled
//! immediately (local reads) or later by a worker thread (remote and vector
//! reads); any attempt to read an unfilled chunk blocks the caller until the
//! bytes arrive or the fetch fails. A cursor is a cheap, copyable position in
//! *file* coordinates plus an origin used to translate object-local offsets
//! for back-references.

use std::io;
use std::sync::{Arc, Condvar, Mutex};

use binrw::{BinRead, BinReaderExt};

use crate::error::{Error, Result};
use crate::primitive::{NumKind, PrimitiveArray};

enum SlotState {
    Pending,
    Ready(Arc<[u8]>),
    Failed(String),
}

struct Slot {
    state: Mutex<SlotState>,
    cond: Condvar,
}

/// A `[start, stop)` window of bytes from one source.
///
/// Cloning a chunk is cheap; all clones share the same fill state, so a
/// vector read can hand out chunks before their bytes exist.
#[derive(Clone)]
pub struct Chunk {
    path: Arc<str>,
    start: u64,
    stop: u64,
    slot: Arc<Slot>,
}

/// The write side of a pending [`Chunk`], held by the worker that fetches it.
pub struct ChunkWriter {
    chunk: Chunk,
}

impl Chunk {
    /// A chunk whose bytes are already present.
    ///
    /// The byte length must equal `stop - start`; sources construct these
    /// only from exact-range reads.
    pub fn ready(path: Arc<str>, start: u64, data: Vec<u8>) -> Chunk {
        let stop = start + data.len() as u64;
        Chunk {
            path,
            start,
            stop,
            slot: Arc::new(Slot {
                state: Mutex::new(SlotState::Ready(data.into())),
                cond: Condvar::new(),
            }),
        }
    }

    /// A standalone chunk at `[0, len)`, for decompressed buffers.
    pub fn wrap(path: Arc<str>, data: Vec<u8>) -> Chunk {
        Chunk::ready(path, 0, data)
    }

    /// An unfilled chunk plus its writer.
    pub fn pending(path: Arc<str>, start: u64, stop: u64) -> (Chunk, ChunkWriter) {
        let chunk = Chunk {
            path,
            start,
            stop,
            slot: Arc::new(Slot {
                state: Mutex::new(SlotState::Pending),
                cond: Condvar::new(),
            }),
        };
        let writer = ChunkWriter {
            chunk: chunk.clone(),
        };
        (chunk, writer)
    }

    pub fn file_path(&self) -> &str {
        &self.path
    }

    pub(crate) fn path_arc(&self) -> Arc<str> {
        Arc::clone(&self.path)
    }

    /// Seek position of the first byte included.
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Seek position of the first byte excluded.
    pub fn stop(&self) -> u64 {
        self.stop
    }

    pub fn len(&self) -> u64 {
        self.stop - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.stop
    }

    /// Can this chunk satisfy `[start, stop)` without a new fetch?
    pub fn contains(&self, start: u64, stop: u64) -> bool {
        self.start <= start && stop <= self.stop
    }

    /// Block until the chunk is filled, returning its bytes.
    pub fn raw_data(&self) -> Result<Arc<[u8]>> {
        let mut state = self.slot.state.lock().expect("chunk slot poisoned");
        loop {
            match &*state {
                SlotState::Ready(data) => return Ok(Arc::clone(data)),
                SlotState::Failed(message) => {
                    return Err(Error::Source {
                        path: self.path.to_string(),
                        range: self.start..self.stop,
                        source: io::Error::new(io::ErrorKind::Other, message.clone()),
                    })
                }
                SlotState::Pending => {
                    state = self
                        .slot
                        .cond
                        .wait(state)
                        .expect("chunk slot poisoned");
                }
            }
        }
    }

    /// Block until the chunk is filled or failed.
    pub fn wait(&self) -> Result<()> {
        self.raw_data().map(|_| ())
    }

    /// Whether the fill already happened (successfully or not), without
    /// blocking.
    pub fn is_filled(&self) -> bool {
        !matches!(
            &*self.slot.state.lock().expect("chunk slot poisoned"),
            SlotState::Pending
        )
    }

    /// Copy out `[start, stop)` in file coordinates.
    pub fn get(&self, start: u64, stop: u64) -> Result<Vec<u8>> {
        let data = self.raw_data()?;
        if !self.contains(start, stop) {
            return Err(Error::deserialization(
                format!(
                    "attempting to get bytes {}..{} outside expected range {}..{} for this chunk",
                    start, stop, self.start, self.stop
                ),
                "chunk",
                start,
                self.path.to_string(),
            ));
        }
        let a = (start - self.start) as usize;
        let b = (stop - self.start) as usize;
        Ok(data[a..b].to_vec())
    }

    /// Copy out everything from `start` to the end of the chunk.
    pub fn remainder(&self, start: u64) -> Result<Vec<u8>> {
        self.get(start, self.stop)
    }
}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<Chunk {}-{}>", self.start, self.stop)
    }
}

impl Drop for ChunkWriter {
    /// A writer that disappears without delivering (a lost job, a panicked
    /// worker) fails its chunk instead of leaving readers blocked forever.
    fn drop(&mut self) {
        let mut state = self.chunk.slot.state.lock().expect("chunk slot poisoned");
        if matches!(&*state, SlotState::Pending) {
            *state = SlotState::Failed("chunk was dropped before its bytes arrived".into());
            self.chunk.slot.cond.notify_all();
        }
    }
}

impl ChunkWriter {
    pub fn chunk(&self) -> &Chunk {
        &self.chunk
    }

    /// Fill the chunk, waking every blocked reader. The byte length must
    /// equal the requested range.
    pub fn fulfill(self, data: Vec<u8>) {
        let expected = self.chunk.len();
        if data.len() as u64 != expected {
            self.fail(format!(
                "expected chunk of length {}, received chunk of length {}",
                expected,
                data.len()
            ));
            return;
        }
        let mut state = self.chunk.slot.state.lock().expect("chunk slot poisoned");
        *state = SlotState::Ready(data.into());
        self.chunk.slot.cond.notify_all();
    }

    /// Mark the fetch as failed; readers observe a source error.
    pub fn fail(self, message: String) {
        let mut state = self.chunk.slot.state.lock().expect("chunk slot poisoned");
        *state = SlotState::Failed(message);
        self.chunk.slot.cond.notify_all();
    }
}

/// A movable read position in file coordinates.
///
/// `origin` anchors the coordinate system for object-local offsets: the
/// back-reference machinery keys its arena on `displacement()`, the distance
/// from the origin. Decompressed chunks set a negative origin so that keys
/// computed inside them match the values ROOT wrote, which count from the
/// start of the enclosing key header.
#[derive(Debug, Clone, Copy)]
pub struct Cursor {
    index: u64,
    origin: i64,
}

impl Cursor {
    pub fn new(index: u64) -> Cursor {
        Cursor { index, origin: 0 }
    }

    pub fn with_origin(index: u64, origin: i64) -> Cursor {
        Cursor { index, origin }
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn origin(&self) -> i64 {
        self.origin
    }

    /// Distance from the origin.
    pub fn displacement(&self) -> i64 {
        self.index as i64 - self.origin
    }

    /// Distance from another cursor's position.
    pub fn displacement_from(&self, other: &Cursor) -> i64 {
        self.index as i64 - other.index as i64
    }

    pub fn skip(&mut self, num_bytes: u64) {
        self.index += num_bytes;
    }

    /// Signed skip, for the occasional rewind.
    pub fn skip_signed(&mut self, num_bytes: i64) {
        self.index = (self.index as i64 + num_bytes) as u64;
    }

    pub fn move_to(&mut self, index: u64) {
        self.index = index;
    }

    fn local(&self, chunk: &Chunk, wanted: u64) -> Result<usize> {
        if self.index < chunk.start() || self.index + wanted > chunk.stop() {
            return Err(Error::deserialization(
                format!(
                    "attempting to read {} bytes outside expected range {}..{} for this chunk",
                    wanted,
                    chunk.start(),
                    chunk.stop()
                ),
                "cursor",
                self.index,
                chunk.file_path().to_string(),
            ));
        }
        Ok((self.index - chunk.start()) as usize)
    }

    /// Read one fixed-layout value (a primitive or a `#[derive(BinRead)]`
    /// record), big-endian, advancing the cursor.
    pub fn field<T>(&mut self, chunk: &Chunk) -> Result<T>
    where
        T: BinRead,
        T::Args: Default,
    {
        let data = chunk.raw_data()?;
        let local = self.local(chunk, 0)?;
        let mut reader = io::Cursor::new(&data[..]);
        reader.set_position(local as u64);
        let value = reader.read_be::<T>().map_err(|err| {
            Error::deserialization(
                err.to_string(),
                std::any::type_name::<T>(),
                self.index,
                chunk.file_path().to_string(),
            )
        })?;
        self.index = chunk.start() + reader.position();
        if self.index > chunk.stop() {
            return Err(Error::deserialization(
                "record extends past the end of this chunk",
                std::any::type_name::<T>(),
                self.index,
                chunk.file_path().to_string(),
            ));
        }
        Ok(value)
    }

    /// Like [`Cursor::field`], but without moving the cursor.
    pub fn peek_field<T>(&self, chunk: &Chunk) -> Result<T>
    where
        T: BinRead,
        T::Args: Default,
    {
        let mut probe = *self;
        probe.field(chunk)
    }

    /// Raw bytes, advancing the cursor.
    pub fn bytes(&mut self, chunk: &Chunk, num_bytes: u64) -> Result<Vec<u8>> {
        let data = chunk.raw_data()?;
        let local = self.local(chunk, num_bytes)?;
        let out = data[local..local + num_bytes as usize].to_vec();
        self.index += num_bytes;
        Ok(out)
    }

    /// `n` big-endian elements of `kind` as a typed array.
    pub fn array(&mut self, chunk: &Chunk, n: usize, kind: NumKind) -> Result<PrimitiveArray> {
        let raw = self.bytes(chunk, (n * kind.byte_size()) as u64)?;
        PrimitiveArray::from_be_bytes(kind, &raw).map_err(|err| match err {
            Error::Format { reason, .. } => Error::deserialization(
                reason,
                "array",
                self.index,
                chunk.file_path().to_string(),
            ),
            other => other,
        })
    }

    /// The universal short-string codec: one length byte, or 255 followed by
    /// a four-byte big-endian length, then that many bytes.
    pub fn string(&mut self, chunk: &Chunk) -> Result<String> {
        let length = match self.field::<u8>(chunk)? {
            255 => self.field::<u32>(chunk)? as u64,
            n => n as u64,
        };
        self.string_with_length(chunk, length)
    }

    /// Unconditionally read `length` bytes as a string.
    pub fn string_with_length(&mut self, chunk: &Chunk, length: u64) -> Result<String> {
        let raw = self.bytes(chunk, length)?;
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }

    /// Null-terminated class name, as written before pointer-any payloads.
    pub fn classname(&mut self, chunk: &Chunk) -> Result<String> {
        let data = chunk.raw_data()?;
        let local = self.local(chunk, 0)?;
        let rest = &data[local..];
        match rest.iter().position(|&b| b == 0) {
            Some(end) => {
                let out = String::from_utf8_lossy(&rest[..end]).into_owned();
                self.index += end as u64 + 1;
                Ok(out)
            }
            None => Err(Error::deserialization(
                "unterminated class name",
                "classname",
                self.index,
                chunk.file_path().to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(data: &[u8]) -> Chunk {
        Chunk::wrap("test".into(), data.to_vec())
    }

    #[test]
    fn filled_chunk_length_matches_range() {
        let c = Chunk::ready("test".into(), 10, vec![0; 4]);
        assert_eq!((c.start(), c.stop(), c.len()), (10, 14, 4));
        assert!(c.contains(10, 14));
        assert!(c.contains(11, 12));
        assert!(!c.contains(9, 12));
        assert!(!c.contains(10, 15));
    }

    #[test]
    fn pending_chunk_rejects_short_fill() {
        let (c, writer) = Chunk::pending("test".into(), 0, 8);
        writer.fulfill(vec![1, 2, 3]);
        match c.raw_data() {
            Err(Error::Source { range, .. }) => assert_eq!(range, 0..8),
            other => panic!("expected source error, got {:?}", other.map(|d| d.len())),
        }
    }

    #[test]
    fn failed_chunk_reports_path_and_range() {
        let (c, writer) = Chunk::pending("remote.root".into(), 16, 32);
        writer.fail("connection reset".into());
        let err = c.raw_data().unwrap_err();
        let text = err.to_string();
        assert!(text.contains("remote.root"));
        assert!(text.contains("16..32"));
    }

    #[test]
    fn fields_and_arrays_are_big_endian() {
        let mut cursor = Cursor::new(0);
        let c = chunk(&[0x00, 0x00, 0x00, 0x07, 0x40, 0x49, 0x0f, 0xdb]);
        assert_eq!(cursor.field::<u32>(&c).unwrap(), 7);
        let tail = cursor.array(&c, 1, NumKind::F32).unwrap();
        match tail {
            PrimitiveArray::F32(v) => assert!((v[0] - std::f32::consts::PI).abs() < 1e-6),
            other => panic!("wrong kind {:?}", other.kind()),
        }
        assert_eq!(cursor.index(), 8);
    }

    #[test]
    fn string_one_byte_and_five_byte_lengths() {
        let mut data = vec![3u8];
        data.extend_from_slice(b"abc");
        data.push(255);
        data.extend_from_slice(&4u32.to_be_bytes());
        data.extend_from_slice(b"defg");
        let c = chunk(&data);
        let mut cursor = Cursor::new(0);
        assert_eq!(cursor.string(&c).unwrap(), "abc");
        assert_eq!(cursor.string(&c).unwrap(), "defg");
        assert_eq!(cursor.index(), data.len() as u64);
    }

    #[test]
    fn classname_consumes_terminator() {
        let c = chunk(b"TNamed\0rest");
        let mut cursor = Cursor::new(0);
        assert_eq!(cursor.classname(&c).unwrap(), "TNamed");
        assert_eq!(cursor.index(), 7);
    }

    #[test]
    fn out_of_range_reads_are_deserialization_errors() {
        let c = chunk(&[1, 2, 3]);
        let mut cursor = Cursor::new(2);
        assert!(cursor.bytes(&c, 2).is_err());
        let mut before = Cursor::new(0);
        assert!(before.field::<u64>(&c).is_err());
    }

    #[test]
    fn displacement_tracks_origin() {
        let cursor = Cursor::with_origin(10, -9);
        assert_eq!(cursor.displacement(), 19);
        let other = Cursor::new(4);
        assert_eq!(cursor.displacement_from(&other), 6);
    }
}
