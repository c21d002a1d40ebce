//! Reader for ROOT files: the self-describing columnar format used in high
//! energy physics.
//!
//! A file is a directory tree of named, versioned objects. The interesting
//! ones are TTrees — columnar tables whose columns ("branches") are stored
//! as independently compressed chunks ("baskets"). This crate opens local
//! and remote files, discovers the schema of arbitrary classes from the
//! file's own streamer records, and materializes branch data as flat arrays:
//!
//! ```no_run
//! let events = arbor::open("data.root:events")?.into_tree()?;
//! let pt = events.branch("Muon_pt")?.array()?;
//! # Ok::<(), arbor::Error>(())
//! ```
//!
//! The layers, bottom to top:
//!
//! * [`source`] — byte ranges from mmap/pread files, HTTP(S) range requests,
//!   or XRootD vector reads, behind one trait with worker pools.
//! * [`chunk`] — the byte windows and cursors everything reads through.
//! * [`compression`] — ZLIB/LZMA/LZ4/ZSTD framed-block decompression.
//! * [`model`], [`models`], [`streamers`] — the class registry: hand-written
//!   readers for the bootstrap classes plus readers synthesized at runtime
//!   from the file's `TStreamerInfo` records.
//! * [`containers`], [`interpretation`] — how container and branch bytes
//!   become typed values and arrays.
//! * [`file`], [`tree`] — directories, keys, caches, and the TTree/TBranch
//!   navigator with its basket pipeline.

pub mod chunk;
pub mod compression;
pub mod containers;
pub mod deserialization;
pub mod error;
pub mod file;
pub mod interpretation;
pub mod model;
pub mod models;
pub mod primitive;
pub mod source;
pub mod streamers;
pub mod tree;

pub use crate::error::{Error, Result};
pub use crate::file::{Directory, FileRef, Object, ObjectRef, RootFile};
pub use crate::interpretation::{Array, Interpretation, UnknownInterpretation};
pub use crate::model::{AnyObject, Value};
pub use crate::primitive::{NumKind, PrimitiveArray};
pub use crate::source::Options;
pub use crate::tree::{Branch, Filter, Tree};

/// Open a file, URL, or `path:object` combination.
///
/// The path may carry one colon-separated object path
/// (`"file.root:dir/tree"`), resolved inside the file after URL scheme
/// parsing; without it the root directory is returned. Recognized schemes:
/// bare paths and `file://` (local), `http://` / `https://`, and `root://`.
pub fn open(path: &str) -> Result<Object> {
    open_with_options(path, Options::default())
}

/// [`open`] with explicit [`Options`].
pub fn open_with_options(path: &str, options: Options) -> Result<Object> {
    let (file_path, object_path) = source::split_object_path(path);
    let file = RootFile::open(&file_path, options)?;
    let directory = file.root_directory()?;
    match object_path {
        Some(object_path) => directory.get(&object_path),
        None => Ok(Object::Directory(directory)),
    }
}
