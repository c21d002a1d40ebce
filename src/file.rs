//! The file layer: the TFile header, directories and keys, the lazily built
//! streamer table, per-file class registries, and the object/array caches.

use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use binrw::BinRead;
use lru::LruCache;
use once_cell::sync::OnceCell;
use tracing::debug;

use crate::chunk::{Chunk, Cursor};
use crate::compression::{decompress, Compression};
use crate::error::{Error, Result};
use crate::interpretation::Array;
use crate::model::{
    read_class, ClassDef, DispatchByVersion, ReadContext, Registry, Value, BOOTSTRAP_CLASSNAMES,
};
use crate::source::{open_source, Executor, Options, Source};
use crate::streamers::StreamerInfo;
use crate::tree::Tree;

/// Classes whose objects keep an open file handle after reading, because
/// they reach back into the file for more data.
pub const MUST_BE_ATTACHED: &[&str] = &[
    "TROOT",
    "TDirectory",
    "TDirectoryFile",
    "RooWorkspace::WSDir",
    "TTree",
    "TChain",
    "TProofChain",
    "THbookTree",
    "TNtuple",
    "TNtupleD",
    "TTreeSQL",
];

#[derive(BinRead)]
#[br(big, magic = b"root")]
struct RawHeaderSmall {
    version: i32,
    begin: i32,
    end: i32,
    seek_free: i32,
    nbytes_free: i32,
    nfree: i32,
    nbytes_name: i32,
    units: u8,
    compress: i32,
    seek_info: i32,
    nbytes_info: i32,
    uuid_version: u16,
    uuid: [u8; 16],
}

#[derive(BinRead)]
#[br(big, magic = b"root")]
struct RawHeaderBig {
    version: i32,
    begin: i32,
    end: i64,
    seek_free: i64,
    nbytes_free: i32,
    nfree: i32,
    nbytes_name: i32,
    units: u8,
    compress: i32,
    seek_info: i64,
    nbytes_info: i32,
    uuid_version: u16,
    uuid: [u8; 16],
}

/// Size of the large-format header; `begin_chunk_size` must cover it.
pub const HEADER_BIG_SIZE: u64 = 72;

/// The decoded TFile header, in one layout for both seek widths.
#[derive(Debug, Clone)]
pub struct FileHeader {
    pub version: i32,
    pub begin: u64,
    pub end: u64,
    pub seek_free: u64,
    pub nbytes_free: i32,
    pub nfree: i32,
    pub nbytes_name: i32,
    pub units: u8,
    pub compress: i32,
    pub seek_info: u64,
    pub nbytes_info: i32,
    pub uuid_version: u16,
    pub uuid: [u8; 16],
}

impl FileHeader {
    pub(crate) fn parse(chunk: &Chunk, path: &str) -> Result<FileHeader> {
        let mut cursor = Cursor::new(0);
        let magic = cursor.peek_field::<[u8; 4]>(chunk).map_err(|_| Error::Format {
            reason: "truncated TFile header".into(),
            path: path.to_string(),
        })?;
        if &magic != b"root" {
            return Err(Error::Format {
                reason: format!(
                    "not a ROOT file: first four bytes are {:?}",
                    String::from_utf8_lossy(&magic)
                ),
                path: path.to_string(),
            });
        }

        let small = cursor.field::<RawHeaderSmall>(chunk).map_err(|_| Error::Format {
            reason: "truncated TFile header".into(),
            path: path.to_string(),
        })?;

        if small.version >= 1_000_000 {
            let mut cursor = Cursor::new(0);
            let big = cursor.field::<RawHeaderBig>(chunk).map_err(|_| Error::Format {
                reason: "truncated 64-bit TFile header".into(),
                path: path.to_string(),
            })?;
            Ok(FileHeader {
                version: big.version,
                begin: big.begin as u64,
                end: big.end as u64,
                seek_free: big.seek_free as u64,
                nbytes_free: big.nbytes_free,
                nfree: big.nfree,
                nbytes_name: big.nbytes_name,
                units: big.units,
                compress: big.compress,
                seek_info: big.seek_info as u64,
                nbytes_info: big.nbytes_info,
                uuid_version: big.uuid_version,
                uuid: big.uuid,
            })
        } else {
            Ok(FileHeader {
                version: small.version,
                begin: small.begin as u64,
                end: small.end as u64,
                seek_free: small.seek_free as u64,
                nbytes_free: small.nbytes_free,
                nfree: small.nfree,
                nbytes_name: small.nbytes_name,
                units: small.units,
                compress: small.compress,
                seek_info: small.seek_info as u64,
                nbytes_info: small.nbytes_info,
                uuid_version: small.uuid_version,
                uuid: small.uuid,
            })
        }
    }

    pub fn is_64bit(&self) -> bool {
        self.version >= 1_000_000
    }

    /// `(major, minor, patch)` of the ROOT that wrote the file.
    pub fn root_version_tuple(&self) -> (i32, i32, i32) {
        let mut version = self.version;
        if version >= 1_000_000 {
            version -= 1_000_000;
        }
        (version / 10_000, version / 100 % 100, version % 100)
    }

    pub fn compression(&self) -> Compression {
        Compression::from_code(self.compress)
    }

    pub fn hex_uuid(&self) -> String {
        let hex: String = self.uuid.iter().map(|b| format!("{:02x}", b)).collect();
        format!(
            "{}-{}-{}-{}-{}",
            &hex[0..8],
            &hex[8..12],
            &hex[12..16],
            &hex[16..20],
            &hex[20..32]
        )
    }
}

/// An immutable stand-in for a closed or released file: everything error
/// messages and detached objects need, without the open source.
#[derive(Debug, Clone)]
pub struct DetachedFile {
    pub file_path: String,
    pub header: FileHeader,
}

/// The file handle carried by every deserialized object: live (can read
/// more) or detached (metadata only).
#[derive(Clone)]
pub enum FileRef {
    Live(Arc<RootFile>),
    Detached(Arc<DetachedFile>),
}

impl FileRef {
    pub fn file_path(&self) -> &str {
        match self {
            FileRef::Live(file) => file.file_path(),
            FileRef::Detached(file) => &file.file_path,
        }
    }

    pub fn live(&self) -> Option<&Arc<RootFile>> {
        match self {
            FileRef::Live(file) => Some(file),
            FileRef::Detached(_) => None,
        }
    }
}

impl std::fmt::Debug for FileRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileRef::Live(file) => write!(f, "Live({:?})", file.file_path()),
            FileRef::Detached(file) => write!(f, "Detached({:?})", file.file_path),
        }
    }
}

/// A deserialized object plus its file reference and location.
#[derive(Clone)]
pub struct ObjectRef {
    pub value: Value,
    pub classname: String,
    pub file: FileRef,
    pub object_path: String,
}

/// What a directory lookup can produce.
pub enum Object {
    Directory(Directory),
    Tree(Tree),
    Value(ObjectRef),
}

impl Object {
    pub fn into_tree(self) -> Result<Tree> {
        match self {
            Object::Tree(tree) => Ok(tree),
            Object::Directory(dir) => Err(Error::Unsupported {
                feature: format!("{:?} is a directory, not a TTree", dir.object_path()),
                path: dir.file.file_path().to_string(),
            }),
            Object::Value(obj) => Err(Error::Unsupported {
                feature: format!("object {} is a {}, not a TTree", obj.object_path, obj.classname),
                path: obj.file.file_path().to_string(),
            }),
        }
    }
}

struct StreamerTable {
    by_name: HashMap<String, BTreeMap<i32, StreamerInfo>>,
    rules: Vec<String>,
}

/// A bounded, byte-budgeted cache of materialized arrays.
pub struct ArrayCache {
    inner: Mutex<(LruCache<String, Arc<Array>>, u64)>,
    budget: u64,
}

impl ArrayCache {
    fn new(budget: u64) -> ArrayCache {
        ArrayCache {
            inner: Mutex::new((LruCache::unbounded(), 0)),
            budget,
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<Array>> {
        self.inner
            .lock()
            .expect("array cache poisoned")
            .0
            .get(key)
            .cloned()
    }

    pub fn put(&self, key: String, array: Arc<Array>) {
        let mut guard = self.inner.lock().expect("array cache poisoned");
        let (cache, used) = &mut *guard;
        *used += array.nbytes() as u64;
        cache.put(key, array);
        while *used > self.budget {
            match cache.pop_lru() {
                Some((_, evicted)) => *used -= evicted.nbytes() as u64,
                None => break,
            }
        }
    }
}

/// An open ROOT file: the source, the prefetched head of the file, the
/// decoded header, and the machinery to turn class names into readers.
pub struct RootFile {
    file_path: String,
    source: Box<dyn Source>,
    options: Options,
    begin_chunk: Chunk,
    header: FileHeader,
    streamers: OnceCell<StreamerTable>,
    streamers_building: std::sync::atomic::AtomicBool,
    custom_classes: Mutex<Option<HashMap<String, ClassDef>>>,
    object_cache: Mutex<LruCache<String, ObjectRef>>,
    array_cache: ArrayCache,
    /// Worker pool for basket decompression, separate from the source's
    /// I/O pool.
    decompression: Executor,
    /// Where per-basket interpretation runs; same-thread by default.
    interpretation: Executor,
}

impl std::fmt::Debug for RootFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootFile")
            .field("file_path", &self.file_path)
            .finish_non_exhaustive()
    }
}

impl RootFile {
    /// Open a file or URL and decode its header. The object path suffix
    /// (`file.root:events`) must already be split off.
    pub fn open(file_path: &str, options: Options) -> Result<Arc<RootFile>> {
        if options.begin_chunk_size < HEADER_BIG_SIZE {
            return Err(Error::Format {
                reason: format!(
                    "begin_chunk_size={} is not enough to read the TFile header ({})",
                    options.begin_chunk_size, HEADER_BIG_SIZE
                ),
                path: file_path.to_string(),
            });
        }

        let source = open_source(file_path, &options)?;
        let stop = options.begin_chunk_size.min(source.num_bytes().max(1));
        let begin_chunk = source.chunk(0, stop)?;
        let header = FileHeader::parse(&begin_chunk, file_path)?;
        debug!(
            file_path,
            version = header.version,
            end = header.end,
            "opened ROOT file"
        );

        Ok(Arc::new(RootFile {
            file_path: file_path.to_string(),
            source,
            options: options.clone(),
            begin_chunk,
            header,
            streamers: OnceCell::new(),
            streamers_building: std::sync::atomic::AtomicBool::new(false),
            custom_classes: Mutex::new(None),
            object_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(options.object_cache.max(1)).expect("nonzero"),
            )),
            array_cache: ArrayCache::new(options.array_cache),
            decompression: Executor::pool(
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1),
            ),
            interpretation: Executor::Trivial,
        }))
    }

    pub fn file_path(&self) -> &str {
        &self.file_path
    }

    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn array_cache(&self) -> &ArrayCache {
        &self.array_cache
    }

    /// The pool that basket decompression and decoding runs on.
    pub fn decompression_executor(&self) -> &Executor {
        &self.decompression
    }

    /// The executor per-basket interpretation is handed to (same-thread by
    /// default).
    pub fn interpretation_executor(&self) -> &Executor {
        &self.interpretation
    }

    pub fn detached(&self) -> Arc<DetachedFile> {
        Arc::new(DetachedFile {
            file_path: self.file_path.clone(),
            header: self.header.clone(),
        })
    }

    pub fn close(&self) {
        self.source.close();
        self.decompression.close();
    }

    pub fn closed(&self) -> bool {
        self.source.closed()
    }

    /// Fetch a chunk, satisfied from the prefetched begin chunk when the
    /// range already sits in it.
    pub fn chunk(&self, start: u64, stop: u64) -> Result<Chunk> {
        if self.closed() {
            return Err(Error::Closed {
                path: self.file_path.clone(),
            });
        }
        if self.begin_chunk.contains(start, stop) {
            return Ok(self.begin_chunk.clone());
        }
        self.source.chunk(start, stop)
    }

    /// Vector fetch, passed straight to the source.
    pub fn chunks(
        &self,
        ranges: &[(u64, u64)],
        sink: &std::sync::mpsc::Sender<Chunk>,
    ) -> Result<Vec<Chunk>> {
        if self.closed() {
            return Err(Error::Closed {
                path: self.file_path.clone(),
            });
        }
        self.source.chunks(ranges, sink)
    }

    /// The root directory, at `fBEGIN + fNbytesName`.
    pub fn root_directory(self: &Arc<Self>) -> Result<Directory> {
        Directory::read(
            Vec::new(),
            Cursor::new(self.header.begin + self.header.nbytes_name as u64),
            Arc::clone(self),
        )
    }

    fn streamer_table(&self) -> Result<&StreamerTable> {
        self.streamers.get_or_try_init(|| self.read_streamers())
    }

    /// Parse the TList of streamer infos (and streamer rules) behind the
    /// key at `fSeekInfo`. Built at most once per file.
    fn read_streamers(&self) -> Result<StreamerTable> {
        // Flag the build so class lookups made while parsing the streamer
        // records themselves cannot re-enter the initializer.
        self.streamers_building
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let out = self.read_streamers_inner();
        self.streamers_building
            .store(false, std::sync::atomic::Ordering::SeqCst);
        out
    }

    fn read_streamers_inner(&self) -> Result<StreamerTable> {
        let mut table = StreamerTable {
            by_name: HashMap::new(),
            rules: Vec::new(),
        };
        if self.header.seek_info == 0 {
            return Ok(table);
        }

        let key_start = self.header.seek_info;
        let key_stop = (key_start + Key::BIG_SIZE).min(self.header.end);
        let key_chunk = self.chunk(key_start, key_stop)?;
        let mut key_cursor = Cursor::new(key_start);
        let key = Key::read(&key_chunk, &mut key_cursor, false, &self.file_path)?;

        let (chunk, mut cursor) = key.uncompressed_chunk(self)?;
        let mut ctx = ReadContext::new(self);
        let tlist = read_class("TList", &chunk, &mut cursor, &mut ctx)?;

        let items = match tlist {
            Value::List(items) => items,
            other => {
                return Err(Error::Format {
                    reason: format!("streamer info is not a TList but {:?}", other),
                    path: self.file_path.clone(),
                })
            }
        };

        for item in items {
            if let Some(info) = StreamerInfo::from_value(&item) {
                table
                    .by_name
                    .entry(info.name.clone())
                    .or_default()
                    .insert(info.class_version, info);
            } else if let Value::List(strings) = &item {
                // a TList of TObjString: schema-evolution rules, preserved
                // verbatim and never executed
                if strings.iter().all(|s| s.as_str().is_some()) {
                    table.rules.extend(
                        strings
                            .iter()
                            .filter_map(|s| s.as_str().map(str::to_string)),
                    );
                } else {
                    return Err(Error::Format {
                        reason: "unexpected list in TList of streamers and streamer rules".into(),
                        path: self.file_path.clone(),
                    });
                }
            } else if !item.is_none() {
                return Err(Error::Format {
                    reason: "unexpected object in TList of streamers and streamer rules".into(),
                    path: self.file_path.clone(),
                });
            }
        }

        debug!(
            num_classes = table.by_name.len(),
            num_rules = table.rules.len(),
            "built streamer table"
        );
        Ok(table)
    }

    /// Streamer for `classname`: a specific version, or the maximum known
    /// one when `version` is None.
    pub fn streamer_named(&self, classname: &str, version: Option<i32>) -> Option<StreamerInfo> {
        let table = self.streamer_table().ok()?;
        let versions = table.by_name.get(classname)?;
        match version {
            Some(version) => versions.get(&version).cloned(),
            None => versions.values().next_back().cloned(),
        }
    }

    /// All streamer versions recorded for `classname`.
    pub fn streamers_named(&self, classname: &str) -> Vec<StreamerInfo> {
        self.streamer_table()
            .ok()
            .and_then(|table| table.by_name.get(classname))
            .map(|versions| versions.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Schema-evolution rules, as verbatim strings.
    pub fn streamer_rules(&self) -> Result<Vec<String>> {
        Ok(self.streamer_table()?.rules.clone())
    }

    /// Resolve a class name to its reader, synthesizing a dispatcher from
    /// the file's streamers when the registry has nothing.
    pub fn class_named(&self, classname: &str) -> Result<Option<ClassDef>> {
        {
            let custom = self.custom_classes.lock().expect("custom classes poisoned");
            if let Some(custom) = &*custom {
                if let Some(def) = custom.get(classname) {
                    return Ok(Some(def.clone()));
                }
            } else if let Some(def) = Registry::global().get(classname) {
                return Ok(Some(def.clone()));
            }
        }

        if self
            .streamers_building
            .load(std::sync::atomic::Ordering::SeqCst)
        {
            // mid-build, only registry classes exist; anything else is
            // unknown and gets skipped by byte count
            return Ok(None);
        }
        self.streamer_table()?;
        if self.streamer_named(classname, None).is_none() {
            return Ok(None);
        }

        let def = ClassDef::Dispatch(Arc::new(DispatchByVersion::new(classname)));
        let mut custom = self.custom_classes.lock().expect("custom classes poisoned");
        match &mut *custom {
            Some(custom) => {
                custom.insert(classname.to_string(), def.clone());
            }
            None => Registry::global().insert(classname, def.clone()),
        }
        Ok(Some(def))
    }

    /// Drop a class definition so it gets re-synthesized from this file's
    /// streamers. Operates on the per-file registry (created from the global
    /// pool on first use) so the global pool stays clean.
    pub fn remove_class_definition(&self, classname: &str) {
        let mut custom = self.custom_classes.lock().expect("custom classes poisoned");
        let custom = custom.get_or_insert_with(|| Registry::global().snapshot());
        custom.remove(classname);
    }

    fn object_cache_get(&self, cache_key: &str) -> Option<ObjectRef> {
        let mut cache = self.object_cache.lock().expect("object cache poisoned");
        let hit = cache.get(cache_key).cloned()?;
        if let Some(live) = hit.file.live() {
            if live.closed() {
                cache.pop(cache_key);
                return None;
            }
        }
        Some(hit)
    }

    fn object_cache_put(&self, cache_key: String, obj: ObjectRef) {
        self.object_cache
            .lock()
            .expect("object cache poisoned")
            .put(cache_key, obj);
    }

    /// A file object for unit tests in other modules; not connected to any
    /// bytes.
    #[cfg(test)]
    pub(crate) fn for_tests() -> RootFile {
        RootFile {
            file_path: "memory:test".into(),
            source: Box::new(test_support::NullSource),
            options: Options::default(),
            begin_chunk: Chunk::wrap("memory:test".into(), Vec::new()),
            header: FileHeader {
                version: 61804,
                begin: 100,
                end: 100,
                seek_free: 0,
                nbytes_free: 0,
                nfree: 0,
                nbytes_name: 0,
                units: 4,
                compress: 0,
                seek_info: 0,
                nbytes_info: 0,
                uuid_version: 1,
                uuid: [0; 16],
            },
            streamers: OnceCell::new(),
            streamers_building: std::sync::atomic::AtomicBool::new(false),
            custom_classes: Mutex::new(None),
            object_cache: Mutex::new(LruCache::new(NonZeroUsize::new(16).expect("nonzero"))),
            array_cache: ArrayCache::new(1 << 20),
            decompression: Executor::Trivial,
            interpretation: Executor::Trivial,
        }
    }
}

#[derive(BinRead)]
#[br(big)]
struct RawKeySmall {
    nbytes: i32,
    version: i16,
    objlen: i32,
    datime: u32,
    keylen: i16,
    cycle: i16,
    seek_key: i32,
    seek_pdir: i32,
}

#[derive(BinRead)]
#[br(big)]
struct RawKeyBig {
    nbytes: i32,
    version: i16,
    objlen: i32,
    datime: u32,
    keylen: i16,
    cycle: i16,
    seek_key: i64,
    seek_pdir: i64,
}

/// The record in front of every stored object.
#[derive(Debug, Clone)]
pub struct Key {
    pub nbytes: i32,
    pub version: i16,
    pub objlen: i32,
    pub datime: u32,
    pub keylen: i16,
    pub cycle: i16,
    pub seek_key: u64,
    pub seek_pdir: u64,
    pub classname: Option<String>,
    pub name: Option<String>,
    pub title: Option<String>,
}

impl Key {
    /// Byte size of the 64-bit fixed layout, for sizing key reads.
    pub const BIG_SIZE: u64 = 34;

    pub fn read(
        chunk: &Chunk,
        cursor: &mut Cursor,
        read_strings: bool,
        path: &str,
    ) -> Result<Key> {
        let start = *cursor;
        let small = cursor.field::<RawKeySmall>(chunk)?;

        let mut key = if small.version > 1000 {
            let mut cursor64 = start;
            let big = cursor64.field::<RawKeyBig>(chunk)?;
            *cursor = cursor64;
            Key {
                nbytes: big.nbytes,
                version: big.version,
                objlen: big.objlen,
                datime: big.datime,
                keylen: big.keylen,
                cycle: big.cycle,
                seek_key: big.seek_key as u64,
                seek_pdir: big.seek_pdir as u64,
                classname: None,
                name: None,
                title: None,
            }
        } else {
            Key {
                nbytes: small.nbytes,
                version: small.version,
                objlen: small.objlen,
                datime: small.datime,
                keylen: small.keylen,
                cycle: small.cycle,
                seek_key: small.seek_key as u64,
                seek_pdir: small.seek_pdir as u64,
                classname: None,
                name: None,
                title: None,
            }
        };

        if key.nbytes < key.keylen as i32 && key.nbytes >= 0 {
            return Err(Error::Format {
                reason: format!(
                    "key declares {} total bytes but a {}-byte header",
                    key.nbytes, key.keylen
                ),
                path: path.to_string(),
            });
        }

        if read_strings {
            key.classname = Some(cursor.string(chunk)?);
            key.name = Some(cursor.string(chunk)?);
            key.title = Some(cursor.string(chunk)?);
        }
        Ok(key)
    }

    pub fn is_64bit(&self) -> bool {
        self.version > 1000
    }

    pub fn data_compressed_bytes(&self) -> u64 {
        (self.nbytes - self.keylen as i32).max(0) as u64
    }

    pub fn data_uncompressed_bytes(&self) -> u64 {
        self.objlen.max(0) as u64
    }

    pub fn is_compressed(&self) -> bool {
        self.data_compressed_bytes() != self.data_uncompressed_bytes()
    }

    /// Seek position of the object payload, just past the key header.
    pub fn data_start(&self) -> u64 {
        self.seek_key + self.keylen as u64
    }

    pub fn name_with_cycle(&self) -> String {
        format!("{};{}", self.name.as_deref().unwrap_or(""), self.cycle)
    }

    fn cache_key(&self, file: &RootFile) -> String {
        format!("{}:{}", file.header.hex_uuid(), self.seek_key)
    }

    /// Fetch and (when needed) decompress the object payload. The returned
    /// cursor's origin is minus the key length, which makes back-reference
    /// displacements match what ROOT wrote.
    pub fn uncompressed_chunk(&self, file: &RootFile) -> Result<(Chunk, Cursor)> {
        let data_start = self.data_start();
        let data_stop = data_start + self.data_compressed_bytes();
        let chunk = file.chunk(data_start, data_stop)?;

        if self.is_compressed() {
            let cursor = Cursor::new(data_start);
            let inflated = decompress(
                &chunk,
                cursor,
                self.data_compressed_bytes(),
                self.data_uncompressed_bytes(),
            )?;
            Ok((inflated, Cursor::with_origin(0, -(self.keylen as i64))))
        } else {
            let data = chunk.get(data_start, data_stop)?;
            let wrapped = Chunk::wrap(chunk.path_arc(), data);
            Ok((wrapped, Cursor::with_origin(0, -(self.keylen as i64))))
        }
    }

    /// Materialize the object behind this key, consulting the object cache
    /// and retrying once through schema recovery on a deserialization
    /// failure.
    pub fn get(&self, file: &Arc<RootFile>, parent_path: &str) -> Result<Object> {
        let classname = self.classname.clone().unwrap_or_default();
        let object_path = if parent_path.is_empty() {
            format!("/{}", self.name.as_deref().unwrap_or(""))
        } else {
            format!("{}/{}", parent_path, self.name.as_deref().unwrap_or(""))
        };

        if classname == "TDirectory" || classname == "TDirectoryFile" {
            let mut path: Vec<String> = parent_path
                .split('/')
                .filter(|part| !part.is_empty())
                .map(str::to_string)
                .collect();
            path.push(self.name.clone().unwrap_or_default());
            return Ok(Object::Directory(Directory::read(
                path,
                Cursor::new(self.data_start()),
                Arc::clone(file),
            )?));
        }

        let cache_key = self.cache_key(file);
        if let Some(hit) = file.object_cache_get(&cache_key) {
            return Ok(promote(hit, file));
        }

        let (chunk, start_cursor) = self.uncompressed_chunk(file)?;
        let mut cursor = start_cursor;
        let mut ctx = ReadContext::new(file);

        let value = match read_class(&classname, &chunk, &mut cursor, &mut ctx) {
            Ok(value) => value,
            Err(err) if err.is_deserialization() => {
                recover_once(&classname, &chunk, start_cursor, file, &ctx, err)?
            }
            Err(err) => return Err(err),
        };

        let file_ref = if MUST_BE_ATTACHED.contains(&classname.as_str()) {
            FileRef::Live(Arc::clone(file))
        } else {
            FileRef::Detached(file.detached())
        };
        let obj = ObjectRef {
            value,
            classname: classname.clone(),
            file: file_ref,
            object_path,
        };
        file.object_cache_put(cache_key, obj.clone());
        Ok(promote(obj, file))
    }
}

/// Wrap TTree-like values in their navigator.
fn promote(obj: ObjectRef, file: &Arc<RootFile>) -> Object {
    if obj.classname == "TTree"
        || obj.classname == "TNtuple"
        || obj.classname == "TNtupleD"
    {
        if let Ok(tree) = Tree::new(obj.clone(), Arc::clone(file)) {
            return Object::Tree(tree);
        }
    }
    Object::Value(obj)
}

/// The streamer-bug recovery path: wipe every non-bootstrap class named on
/// the breadcrumb trail and retry the read once. If everything on the trail
/// is bootstrap or already synthesized from this file, the error stands.
fn recover_once(
    classname: &str,
    chunk: &Chunk,
    start_cursor: Cursor,
    file: &Arc<RootFile>,
    failed_ctx: &ReadContext,
    err: Error,
) -> Result<Value> {
    let crumbs = &failed_ctx.breadcrumbs;
    let all_specialized = crumbs.is_empty()
        || crumbs.iter().all(|crumb| {
            crumb.from_this_file || BOOTSTRAP_CLASSNAMES.contains(&crumb.classname.as_str())
        });
    if all_specialized {
        return Err(err);
    }

    debug!(
        classname,
        num_crumbs = crumbs.len(),
        "deserialization failed, retrying with file-specific class definitions"
    );
    for crumb in crumbs {
        if !BOOTSTRAP_CLASSNAMES.contains(&crumb.classname.as_str()) {
            file.remove_class_definition(&crumb.classname);
        }
    }

    let mut cursor = start_cursor;
    let mut ctx = ReadContext::new(file);
    read_class(classname, chunk, &mut cursor, &mut ctx)
}

#[derive(BinRead)]
#[br(big)]
struct RawDirectorySmall {
    version: i16,
    datime_c: u32,
    datime_m: u32,
    nbytes_keys: i32,
    nbytes_name: i32,
    seek_dir: i32,
    seek_parent: i32,
    seek_keys: i32,
}

#[derive(BinRead)]
#[br(big)]
struct RawDirectoryBig {
    version: i16,
    datime_c: u32,
    datime_m: u32,
    nbytes_keys: i32,
    nbytes_name: i32,
    seek_dir: i64,
    seek_parent: i64,
    seek_keys: i64,
}

const DIRECTORY_BIG_SIZE: u64 = 42;

/// A directory: its header fields and the list of keys under it.
pub struct Directory {
    path: Vec<String>,
    file: Arc<RootFile>,
    pub version: i16,
    pub nbytes_keys: i32,
    pub nbytes_name: i32,
    pub seek_dir: u64,
    pub seek_parent: u64,
    pub seek_keys: u64,
    header_key: Option<Key>,
    keys: Vec<Key>,
}

impl Directory {
    fn read(path: Vec<String>, cursor: Cursor, file: Arc<RootFile>) -> Result<Directory> {
        let mut cursor = cursor;
        let start = cursor.index();
        let stop = (start + DIRECTORY_BIG_SIZE).min(file.header.end.max(start + 1));
        let chunk = file.chunk(start, stop)?;

        let small = cursor.peek_field::<RawDirectorySmall>(&chunk)?;
        let (version, nbytes_keys, nbytes_name, seek_dir, seek_parent, seek_keys) =
            if small.version > 1000 {
                let big = cursor.field::<RawDirectoryBig>(&chunk)?;
                (
                    big.version,
                    big.nbytes_keys,
                    big.nbytes_name,
                    big.seek_dir as u64,
                    big.seek_parent as u64,
                    big.seek_keys as u64,
                )
            } else {
                let small = cursor.field::<RawDirectorySmall>(&chunk)?;
                (
                    small.version,
                    small.nbytes_keys,
                    small.nbytes_name,
                    small.seek_dir as u64,
                    small.seek_parent as u64,
                    small.seek_keys as u64,
                )
            };

        let mut directory = Directory {
            path,
            file,
            version,
            nbytes_keys,
            nbytes_name,
            seek_dir,
            seek_parent,
            seek_keys,
            header_key: None,
            keys: Vec::new(),
        };

        if seek_keys != 0 {
            let keys_start = seek_keys;
            let keys_stop = (keys_start + nbytes_keys.max(0) as u64 + 8)
                .min(directory.file.header.end.max(keys_start + 1));
            let keys_chunk = if chunk.contains(keys_start, keys_stop) {
                chunk
            } else {
                directory.file.chunk(keys_start, keys_stop)?
            };
            let mut keys_cursor = Cursor::new(seek_keys);

            directory.header_key = Some(Key::read(
                &keys_chunk,
                &mut keys_cursor,
                true,
                directory.file.file_path(),
            )?);
            let num_keys = keys_cursor.field::<u32>(&keys_chunk)?;
            for _ in 0..num_keys {
                directory.keys.push(Key::read(
                    &keys_chunk,
                    &mut keys_cursor,
                    true,
                    directory.file.file_path(),
                )?);
            }
        }
        Ok(directory)
    }

    pub fn file(&self) -> &Arc<RootFile> {
        &self.file
    }

    pub fn is_64bit(&self) -> bool {
        self.version > 1000
    }

    pub fn object_path(&self) -> String {
        format!("/{}", self.path.join("/"))
    }

    pub fn close(&self) {
        self.file.close();
    }

    pub fn closed(&self) -> bool {
        self.file.closed()
    }

    pub fn raw_keys(&self) -> &[Key] {
        &self.keys
    }

    /// Key names, with or without `;cycle` suffixes, optionally recursing
    /// into subdirectories.
    pub fn keys(&self, recursive: bool, cycle: bool) -> Vec<String> {
        self.keys_filtered(recursive, cycle, &crate::tree::Filter::All, &crate::tree::Filter::All)
    }

    /// Key names passing a name filter and a class-name filter (AND
    /// composition); for recursive entries the name filter sees the full
    /// `a/b/c` path without any cycle suffix.
    pub fn keys_filtered(
        &self,
        recursive: bool,
        cycle: bool,
        filter_name: &crate::tree::Filter,
        filter_classname: &crate::tree::Filter,
    ) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_names(
            "",
            recursive,
            cycle,
            filter_name,
            filter_classname,
            &mut out,
        );
        out
    }

    fn collect_names(
        &self,
        prefix: &str,
        recursive: bool,
        cycle: bool,
        filter_name: &crate::tree::Filter,
        filter_classname: &crate::tree::Filter,
        out: &mut Vec<String>,
    ) {
        for key in &self.keys {
            let name = key.name.as_deref().unwrap_or("");
            let full = format!("{}{}", prefix, name);
            if filter_name.matches(&full)
                && filter_classname.matches(key.classname.as_deref().unwrap_or(""))
            {
                let shown = if cycle {
                    format!("{}{}", prefix, key.name_with_cycle())
                } else {
                    full.clone()
                };
                out.push(shown);
            }

            if recursive
                && matches!(
                    key.classname.as_deref(),
                    Some("TDirectory") | Some("TDirectoryFile")
                )
            {
                if let Ok(Object::Directory(subdir)) = key.get(&self.file, &self.object_path()) {
                    subdir.collect_names(
                        &format!("{}/", full),
                        recursive,
                        cycle,
                        filter_name,
                        filter_classname,
                        out,
                    );
                }
            }
        }
    }

    /// Class names of every key, for browsing.
    pub fn classnames(&self) -> Vec<(String, String)> {
        self.keys
            .iter()
            .map(|key| {
                (
                    key.name.clone().unwrap_or_default(),
                    key.classname.clone().unwrap_or_default(),
                )
            })
            .collect()
    }

    /// Find one key by name, honoring an optional `;cycle` suffix; the
    /// highest cycle wins when no cycle is requested. A non-numeric suffix
    /// counts as part of the name.
    pub fn key(&self, where_: &str) -> Result<&Key> {
        let (item, cycle) = match where_.rfind(';') {
            Some(at) => match where_[at + 1..].parse::<i16>() {
                Ok(cycle) => (&where_[..at], Some(cycle)),
                Err(_) => (where_, None),
            },
            None => (where_, None),
        };

        let mut best: Option<&Key> = None;
        for key in &self.keys {
            if key.name.as_deref() != Some(item) {
                continue;
            }
            match cycle {
                Some(cycle) => {
                    if key.cycle == cycle {
                        return Ok(key);
                    }
                }
                None => {
                    if best.map_or(true, |b| b.cycle < key.cycle) {
                        best = Some(key);
                    }
                }
            }
        }

        best.ok_or_else(|| Error::KeyNotFound {
            key: item.to_string(),
            cycle: cycle.map_or_else(|| "any".to_string(), |c| c.to_string()),
            path: self.file.file_path().to_string(),
            object_path: self.object_path(),
        })
    }

    /// Look up an object by path: `/` recurses across directories and a
    /// single `:` hands the remainder to the TTree branch navigator.
    pub fn get(&self, where_: &str) -> Result<Object> {
        if let Some((head, tail)) = where_.split_once(':') {
            let object = self.get(head)?;
            let tree = object.into_tree()?;
            return Ok(Object::Value(tree.branch(tail)?.into_object_ref()));
        }

        let mut parts = where_.split('/').filter(|part| !part.is_empty());
        let first = match parts.next() {
            Some(first) => first,
            None => {
                return Err(Error::KeyNotFound {
                    key: where_.to_string(),
                    cycle: "any".to_string(),
                    path: self.file.file_path().to_string(),
                    object_path: self.object_path(),
                })
            }
        };

        let rest: Vec<&str> = parts.collect();
        let object = self.key(first)?.get(&self.file, &self.object_path())?;
        if rest.is_empty() {
            return Ok(object);
        }

        match object {
            Object::Directory(subdir) => subdir.get(&rest.join("/")),
            Object::Tree(tree) => Ok(Object::Value(tree.branch(&rest.join("/"))?.into_object_ref())),
            Object::Value(obj) => Err(Error::KeyNotFound {
                key: rest.join("/"),
                cycle: "any".to_string(),
                path: self.file.file_path().to_string(),
                object_path: obj.object_path,
            }),
        }
    }

    /// Like [`Directory::get`], but insists on a TTree.
    pub fn tree(&self, where_: &str) -> Result<Tree> {
        self.get(where_)?.into_tree()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::source::Counters;
    use std::sync::mpsc;

    /// A source with no bytes, for contexts that never read.
    pub struct NullSource;

    impl Source for NullSource {
        fn chunk(&self, start: u64, stop: u64) -> Result<Chunk> {
            Err(Error::Source {
                path: "memory:test".into(),
                range: start..stop,
                source: std::io::Error::new(std::io::ErrorKind::Other, "no bytes"),
            })
        }

        fn chunks(&self, _: &[(u64, u64)], _: &mpsc::Sender<Chunk>) -> Result<Vec<Chunk>> {
            Ok(Vec::new())
        }

        fn num_bytes(&self) -> u64 {
            0
        }

        fn file_path(&self) -> &str {
            "memory:test"
        }

        fn close(&self) {}

        fn closed(&self) -> bool {
            false
        }

        fn counters(&self) -> &Counters {
            static COUNTERS: Counters = Counters::new();
            &COUNTERS
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn push_string(out: &mut Vec<u8>, s: &str) {
        out.push(s.len() as u8);
        out.extend_from_slice(s.as_bytes());
    }

    /// A key record with strings, returning the bytes.
    fn key_bytes(
        nbytes: i32,
        objlen: i32,
        keylen: i16,
        cycle: i16,
        seek_key: u64,
        classname: &str,
        name: &str,
    ) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&nbytes.to_be_bytes());
        out.extend_from_slice(&4i16.to_be_bytes()); // key version
        out.extend_from_slice(&objlen.to_be_bytes());
        out.extend_from_slice(&0u32.to_be_bytes());
        out.extend_from_slice(&keylen.to_be_bytes());
        out.extend_from_slice(&cycle.to_be_bytes());
        out.extend_from_slice(&(seek_key as i32).to_be_bytes());
        out.extend_from_slice(&100i32.to_be_bytes()); // seek_pdir
        push_string(&mut out, classname);
        push_string(&mut out, name);
        push_string(&mut out, ""); // title
        out
    }

    /// A serialized TObjString payload (the object data behind a key).
    fn tobjstring_payload(s: &str) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&1u16.to_be_bytes()); // TObject version
        body.extend_from_slice(&0u32.to_be_bytes());
        body.extend_from_slice(&0u32.to_be_bytes());
        push_string(&mut body, s);

        let mut out = Vec::new();
        out.extend_from_slice(
            &(crate::deserialization::K_BYTE_COUNT_MASK | (body.len() as u32 + 2)).to_be_bytes(),
        );
        out.extend_from_slice(&1u16.to_be_bytes());
        out.extend_from_slice(&body);
        out
    }

    /// Assemble a minimal but genuine little file: header, name record,
    /// directory, key block, and two cycles of one TObjString.
    fn build_test_file() -> Vec<u8> {
        let begin: u64 = 100;
        let nbytes_name = 36u64;
        let dir_start = begin + nbytes_name; // 136
        let dir_len = 30u64; // small directory record

        // objects first (they sit after the directory header)
        let mut objects: Vec<(Vec<u8>, Vec<u8>, i16)> = Vec::new(); // (key, payload, cycle)
        let mut object_offsets = Vec::new();
        let mut at = dir_start + dir_len;
        for (text, cycle) in [("first pass", 1i16), ("second pass", 2i16)] {
            let payload = tobjstring_payload(text);
            let key = key_bytes(0, 0, 0, cycle, at, "TObjString", "message"); // sizes fixed below
            let keylen = key.len() as i16;
            let nbytes = keylen as i32 + payload.len() as i32;
            let key = key_bytes(
                nbytes,
                payload.len() as i32,
                keylen,
                cycle,
                at,
                "TObjString",
                "message",
            );
            object_offsets.push(at);
            at += key.len() as u64 + payload.len() as u64;
            objects.push((key, payload, cycle));
        }

        let seek_keys = at;

        // key block: header key, count, then the directory's key records
        let mut key_block = Vec::new();
        let probe = key_bytes(0, 0, 0, 1, seek_keys, "TFile", "test");
        let header_keylen = probe.len() as i16;
        let header_key = key_bytes(
            header_keylen as i32,
            0,
            header_keylen,
            1,
            seek_keys,
            "TFile",
            "test",
        );
        key_block.extend_from_slice(&header_key);
        key_block.extend_from_slice(&(objects.len() as u32).to_be_bytes());
        for ((key, _, _), _offset) in objects.iter().zip(&object_offsets) {
            key_block.extend_from_slice(key);
        }

        let end = seek_keys + key_block.len() as u64;

        let mut out = Vec::new();
        // TFile header (small layout)
        out.extend_from_slice(b"root");
        out.extend_from_slice(&61804i32.to_be_bytes()); // fVersion
        out.extend_from_slice(&(begin as i32).to_be_bytes());
        out.extend_from_slice(&(end as i32).to_be_bytes());
        out.extend_from_slice(&0i32.to_be_bytes()); // fSeekFree
        out.extend_from_slice(&0i32.to_be_bytes()); // fNbytesFree
        out.extend_from_slice(&1i32.to_be_bytes()); // nfree
        out.extend_from_slice(&(nbytes_name as i32).to_be_bytes());
        out.push(4); // fUnits
        out.extend_from_slice(&0i32.to_be_bytes()); // fCompress
        out.extend_from_slice(&0i32.to_be_bytes()); // fSeekInfo
        out.extend_from_slice(&0i32.to_be_bytes()); // fNbytesInfo
        out.extend_from_slice(&1u16.to_be_bytes()); // uuid version
        out.extend_from_slice(&[7u8; 16]); // uuid
        out.resize(begin as usize, 0);

        // the name record is opaque to the reader; fill it
        out.resize((begin + nbytes_name) as usize, 0);

        // directory header (small layout)
        out.extend_from_slice(&5i16.to_be_bytes()); // fVersion
        out.extend_from_slice(&0u32.to_be_bytes()); // fDatimeC
        out.extend_from_slice(&0u32.to_be_bytes()); // fDatimeM
        out.extend_from_slice(&(key_block.len() as i32).to_be_bytes()); // fNbytesKeys
        out.extend_from_slice(&(nbytes_name as i32).to_be_bytes());
        out.extend_from_slice(&(begin as i32).to_be_bytes()); // fSeekDir
        out.extend_from_slice(&0i32.to_be_bytes()); // fSeekParent
        out.extend_from_slice(&(seek_keys as i32).to_be_bytes());
        assert_eq!(out.len() as u64, dir_start + dir_len);

        for (key, payload, _) in &objects {
            out.extend_from_slice(key);
            out.extend_from_slice(payload);
        }
        out.extend_from_slice(&key_block);
        assert_eq!(out.len() as u64, end);
        out
    }

    fn open_bytes(bytes: &[u8]) -> Arc<RootFile> {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(bytes).unwrap();
        file.flush().unwrap();
        let (_, path) = file.keep().unwrap();
        RootFile::open(path.to_str().unwrap(), Options::default()).unwrap()
    }

    #[test]
    fn header_round_trip_and_uuid() {
        let bytes = build_test_file();
        let file = open_bytes(&bytes);
        let header = file.header();
        assert_eq!(header.begin, 100);
        assert!(!header.is_64bit());
        assert_eq!(header.root_version_tuple(), (6, 18, 4));
        assert_eq!(
            header.hex_uuid(),
            "07070707-0707-0707-0707-070707070707"
        );
    }

    #[test]
    fn bad_magic_is_rejected_immediately() {
        let mut bytes = build_test_file();
        bytes[0] = b'x';
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&bytes).unwrap();
        file.flush().unwrap();
        let err =
            RootFile::open(file.path().to_str().unwrap(), Options::default()).unwrap_err();
        match err {
            Error::Format { reason, .. } => assert!(reason.contains("not a ROOT file")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn sixty_four_bit_header_reads_large_end() {
        let mut out = Vec::new();
        out.extend_from_slice(b"root");
        out.extend_from_slice(&1_061_804i32.to_be_bytes()); // 64-bit marker
        out.extend_from_slice(&100i32.to_be_bytes());
        out.extend_from_slice(&(5_000_000_000i64).to_be_bytes()); // fEND > 2^32
        out.extend_from_slice(&0i64.to_be_bytes()); // fSeekFree
        out.extend_from_slice(&0i32.to_be_bytes());
        out.extend_from_slice(&0i32.to_be_bytes());
        out.extend_from_slice(&36i32.to_be_bytes());
        out.push(8);
        out.extend_from_slice(&101i32.to_be_bytes());
        out.extend_from_slice(&0i64.to_be_bytes()); // fSeekInfo
        out.extend_from_slice(&0i32.to_be_bytes());
        out.extend_from_slice(&1u16.to_be_bytes());
        out.extend_from_slice(&[0u8; 16]);

        let chunk = Chunk::wrap("test".into(), out);
        let header = FileHeader::parse(&chunk, "test").unwrap();
        assert!(header.is_64bit());
        assert_eq!(header.end, 5_000_000_000);
        assert_eq!(header.compression().algorithm, crate::compression::Algorithm::Zlib);
    }

    #[test]
    fn directory_lists_keys_and_resolves_cycles() {
        let file = open_bytes(&build_test_file());
        let dir = file.root_directory().unwrap();

        assert_eq!(dir.keys(false, true), vec!["message;1", "message;2"]);

        // highest cycle wins when none requested
        let newest = dir.key("message").unwrap();
        assert_eq!(newest.cycle, 2);
        let oldest = dir.key("message;1").unwrap();
        assert_eq!(oldest.cycle, 1);
        // dir[name] == dir[name;highest]
        assert_eq!(
            dir.key("message").unwrap().seek_key,
            dir.key("message;2").unwrap().seek_key
        );

        match dir.key("missing") {
            Err(Error::KeyNotFound { key, cycle, .. }) => {
                assert_eq!(key, "missing");
                assert_eq!(cycle, "any");
            }
            other => panic!("unexpected {:?}", other.map(|k| k.cycle)),
        }
    }

    #[test]
    fn objects_read_detached_and_cache() {
        let file = open_bytes(&build_test_file());
        let dir = file.root_directory().unwrap();

        let object = dir.get("message").unwrap();
        let obj = match object {
            Object::Value(obj) => obj,
            _ => panic!("expected a value"),
        };
        assert_eq!(obj.classname, "TObjString");
        assert_eq!(obj.value.as_str(), Some("second pass"));
        // TObjString is not in the attached set
        assert!(obj.file.live().is_none());

        let again = dir.get("message;1").unwrap();
        match again {
            Object::Value(obj) => assert_eq!(obj.value.as_str(), Some("first pass")),
            _ => panic!("expected a value"),
        }
    }

    #[test]
    fn closing_the_file_blocks_new_chunks() {
        let file = open_bytes(&build_test_file());
        file.close();
        assert!(file.closed());
        assert!(matches!(
            file.chunk(200, 300),
            Err(Error::Closed { .. })
        ));
    }

    #[test]
    fn array_cache_evicts_by_bytes() {
        let cache = ArrayCache::new(100);
        let small = Arc::new(Array::Numeric(crate::primitive::PrimitiveArray::I32(vec![
                0; 10
            ])));
        cache.put("a".into(), Arc::clone(&small)); // 40 bytes
        cache.put("b".into(), Arc::clone(&small)); // 80 bytes
        assert!(cache.get("a").is_some()); // refresh "a"; "b" is now oldest
        cache.put("c".into(), Arc::clone(&small)); // 120 bytes, over budget
        assert!(cache.get("a").is_some());
        assert!(cache.get("c").is_some());
        assert!(cache.get("b").is_none());
    }
}
