//! The runtime object model: every deserialized instance becomes a
//! [`Value`], generic class instances become [`AnyObject`]s, and the class
//! [`Registry`] maps C++ class names to either hand-written bootstrap
//! readers or schemas synthesized from the file's streamers.
//!
//! There is no runtime code generation: a synthesized class is a list of
//! typed read instructions interpreted by [`crate::streamers`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::chunk::{Chunk, Cursor};
use crate::deserialization;
use crate::error::{Error, Result};
use crate::file::RootFile;
use crate::primitive::PrimitiveArray;
use crate::streamers::VersionedSchema;

/// Class names that are needed to load any other class; schema recovery
/// never deletes these.
pub const BOOTSTRAP_CLASSNAMES: &[&str] = &[
    "TStreamerInfo",
    "TStreamerElement",
    "TStreamerArtificial",
    "TStreamerBase",
    "TStreamerBasicPointer",
    "TStreamerBasicType",
    "TStreamerLoop",
    "TStreamerObject",
    "TStreamerObjectAny",
    "TStreamerObjectAnyPointer",
    "TStreamerObjectPointer",
    "TStreamerSTL",
    "TStreamerSTLstring",
    "TStreamerString",
    "TList",
    "TObjArray",
    "TObjString",
];

/// A deserialized value of any streamed type.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    Str(String),
    /// Raw payload bytes (basket contents).
    Bytes(Vec<u8>),
    /// A typed primitive array (TArray payloads, counted arrays).
    Array(PrimitiveArray),
    /// Ordered contents of a collection (TList, TObjArray, std::vector…).
    List(Vec<Value>),
    /// Key/value pairs of a map, in serialization order.
    Map(Vec<(Value, Value)>),
    /// A generic class instance.
    Object(Box<AnyObject>),
}

impl Value {
    pub fn as_i64(&self) -> Option<i64> {
        Some(match self {
            Value::Bool(b) => *b as i64,
            Value::I8(v) => *v as i64,
            Value::U8(v) => *v as i64,
            Value::I16(v) => *v as i64,
            Value::U16(v) => *v as i64,
            Value::I32(v) => *v as i64,
            Value::U32(v) => *v as i64,
            Value::I64(v) => *v,
            Value::U64(v) => i64::try_from(*v).ok()?,
            _ => return None,
        })
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::F32(v) => Some(*v as f64),
            Value::F64(v) => Some(*v),
            other => other.as_i64().map(|v| v as f64),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            Value::Object(obj) if obj.classname == "TObjString" => {
                obj.member("fString").and_then(Value::as_str)
            }
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&AnyObject> {
        match self {
            Value::Object(obj) => Some(obj),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&PrimitiveArray> {
        match self {
            Value::Array(arr) => Some(arr),
            _ => None,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }
}

/// A generic class instance: named members in serialization order plus
/// superclass parts, mirroring the on-disk nesting.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AnyObject {
    pub classname: String,
    pub instance_version: i32,
    pub bases: Vec<AnyObject>,
    pub members: Vec<(String, Value)>,
}

impl AnyObject {
    pub fn new(classname: impl Into<String>, instance_version: i32) -> AnyObject {
        AnyObject {
            classname: classname.into(),
            instance_version,
            bases: Vec::new(),
            members: Vec::new(),
        }
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.members.push((name.into(), value));
    }

    /// Overwrite an existing member in this class or a superclass. Returns
    /// false if no member of that name exists anywhere.
    pub fn replace(&mut self, name: &str, value: Value) -> bool {
        if let Some((_, slot)) = self.members.iter_mut().find(|(n, _)| n == name) {
            *slot = value;
            return true;
        }
        for base in self.bases.iter_mut().rev() {
            if base.replace(name, value.clone()) {
                return true;
            }
        }
        false
    }

    /// Look up a member in this class, then in superclasses, innermost last.
    pub fn member(&self, name: &str) -> Option<&Value> {
        if let Some((_, value)) = self.members.iter().find(|(n, _)| n == name) {
            return Some(value);
        }
        self.bases.iter().rev().find_map(|base| base.member(name))
    }

    pub fn member_i64(&self, name: &str) -> Option<i64> {
        self.member(name).and_then(Value::as_i64)
    }

    pub fn member_str(&self, name: &str) -> Option<&str> {
        self.member(name).and_then(Value::as_str)
    }

    pub fn has_member(&self, name: &str) -> bool {
        self.member(name).is_some()
    }

    pub fn into_value(self) -> Value {
        Value::Object(Box::new(self))
    }

    /// The object's name, when it inherits from TNamed.
    pub fn name(&self) -> &str {
        self.member_str("fName").unwrap_or("")
    }

    pub fn title(&self) -> &str {
        self.member_str("fTitle").unwrap_or("")
    }
}

/// One frame of recursive descent, recorded for schema recovery.
#[derive(Debug, Clone)]
pub struct Breadcrumb {
    pub classname: String,
    /// True when the reader came from this file's own streamers, so
    /// recovery cannot do better by re-synthesizing it.
    pub from_this_file: bool,
}

/// An entry in the back-reference arena of one top-level read.
#[derive(Debug, Clone)]
pub enum RefItem {
    Class(String),
    Object(Value),
}

/// Mutable state threaded through one top-level object read.
pub struct ReadContext<'f> {
    pub file: &'f RootFile,
    /// Back-reference arena, keyed by displacement from the cursor origin.
    pub refs: HashMap<i64, RefItem>,
    pub breadcrumbs: Vec<Breadcrumb>,
    /// Inside a TBranch, objects may omit their byte-count headers.
    pub in_branch: bool,
    /// Whether counted arrays are preceded by their one-byte speedbump.
    pub speedbump: bool,
}

impl<'f> ReadContext<'f> {
    pub fn new(file: &'f RootFile) -> ReadContext<'f> {
        ReadContext {
            file,
            refs: HashMap::new(),
            breadcrumbs: Vec::new(),
            in_branch: false,
            speedbump: true,
        }
    }
}

/// A hand-written reader for one bootstrap class. The function reads the
/// whole object including its byte-count/version header.
pub struct BuiltinClass {
    pub classname: &'static str,
    pub read: fn(&Chunk, &mut Cursor, &mut ReadContext) -> Result<Value>,
}

/// What the registry knows about a class name.
#[derive(Clone)]
pub enum ClassDef {
    Builtin(&'static BuiltinClass),
    /// Synthesized from streamers, one schema per instance version.
    Dispatch(Arc<DispatchByVersion>),
}

/// Version-dispatch table for a synthesized class: peeks the instance
/// version and lazily creates the matching schema from the file's streamers.
pub struct DispatchByVersion {
    pub classname: String,
    pub versions: Mutex<HashMap<i32, Arc<VersionedSchema>>>,
}

impl DispatchByVersion {
    pub fn new(classname: impl Into<String>) -> DispatchByVersion {
        DispatchByVersion {
            classname: classname.into(),
            versions: Mutex::new(HashMap::new()),
        }
    }

    pub fn class_of_version(&self, version: i32) -> Option<Arc<VersionedSchema>> {
        self.versions
            .lock()
            .expect("dispatch table poisoned")
            .get(&version)
            .cloned()
    }

    pub fn known_version_bounds(&self) -> Option<(i32, i32)> {
        let guard = self.versions.lock().expect("dispatch table poisoned");
        let min = guard.keys().min()?;
        let max = guard.keys().max()?;
        Some((*min, *max))
    }

    pub fn insert(&self, version: i32, schema: Arc<VersionedSchema>) {
        self.versions
            .lock()
            .expect("dispatch table poisoned")
            .insert(version, schema);
    }
}

/// A name → class map. One global pool exists for the process; files get a
/// private copy-on-write pool the moment schema recovery has to delete
/// definitions, so the global pool stays clean.
pub struct Registry {
    classes: Mutex<HashMap<String, ClassDef>>,
}

impl Registry {
    pub fn new(seed: HashMap<String, ClassDef>) -> Registry {
        Registry {
            classes: Mutex::new(seed),
        }
    }

    pub fn global() -> &'static Registry {
        static GLOBAL: once_cell::sync::Lazy<Registry> =
            once_cell::sync::Lazy::new(|| Registry::new(crate::models::bootstrap_classes()));
        &GLOBAL
    }

    pub fn get(&self, classname: &str) -> Option<ClassDef> {
        self.classes
            .lock()
            .expect("registry poisoned")
            .get(classname)
            .cloned()
    }

    pub fn insert(&self, classname: impl Into<String>, def: ClassDef) {
        self.classes
            .lock()
            .expect("registry poisoned")
            .insert(classname.into(), def);
    }

    pub fn remove(&self, classname: &str) {
        self.classes
            .lock()
            .expect("registry poisoned")
            .remove(classname);
    }

    pub fn snapshot(&self) -> HashMap<String, ClassDef> {
        self.classes.lock().expect("registry poisoned").clone()
    }
}

/// The header state of an object being read: where it started, how long it
/// claims to be, and which version it carries.
#[derive(Debug, Clone, Copy)]
pub struct ObjectHeader {
    pub start: Cursor,
    pub num_bytes: Option<u32>,
    pub instance_version: i32,
    pub is_memberwise: bool,
}

/// Read the byte-count/version header, applying the in-branch quirks: a
/// missing byte count with a foreign version rewinds and trusts
/// `class_version`, and a recorded version of 0 skips four bytes.
pub fn begin_object(
    chunk: &Chunk,
    cursor: &mut Cursor,
    ctx: &mut ReadContext,
    class_version: Option<i32>,
) -> Result<ObjectHeader> {
    let start = *cursor;
    let (num_bytes, instance_version, is_memberwise) =
        deserialization::numbytes_version(chunk, cursor, ctx)?;
    let mut header = ObjectHeader {
        start,
        num_bytes,
        instance_version,
        is_memberwise,
    };

    if ctx.in_branch {
        if num_bytes.is_none() && Some(instance_version) != class_version {
            *cursor = start;
            header.instance_version = class_version.unwrap_or(instance_version);
            header.num_bytes = None;
        } else if instance_version == 0 {
            cursor.skip(4);
        }
    }
    Ok(header)
}

/// Check the declared byte count against actual cursor movement.
pub fn finish_object(
    chunk: &Chunk,
    cursor: &Cursor,
    ctx: &ReadContext,
    header: &ObjectHeader,
    classname: &str,
) -> Result<()> {
    deserialization::numbytes_check(chunk, &header.start, cursor, header.num_bytes, classname, ctx)
}

/// Read one instance of `classname` at the cursor, dispatching through the
/// registry: bootstrap reader, synthesized schema, or — when the class is
/// entirely unknown — a skip over its declared byte count.
pub fn read_class(
    classname: &str,
    chunk: &Chunk,
    cursor: &mut Cursor,
    ctx: &mut ReadContext,
) -> Result<Value> {
    let def = ctx.file.class_named(classname)?;
    let from_this_file = matches!(&def, Some(ClassDef::Dispatch(_)));
    ctx.breadcrumbs.push(Breadcrumb {
        classname: classname.to_string(),
        from_this_file,
    });
    let out = match def {
        Some(ClassDef::Builtin(builtin)) => (builtin.read)(chunk, cursor, ctx),
        Some(ClassDef::Dispatch(dispatch)) => {
            crate::streamers::read_dispatched(&dispatch, chunk, cursor, ctx)
        }
        None => read_unknown_class(classname, chunk, cursor, ctx),
    };
    // on failure the crumb stays: the recovery pass walks the whole trail
    if out.is_ok() {
        ctx.breadcrumbs.pop();
    }
    out
}

/// A class with no reader and no streamer: consume exactly the declared
/// byte count, or fail if there is none to trust.
fn read_unknown_class(
    classname: &str,
    chunk: &Chunk,
    cursor: &mut Cursor,
    ctx: &mut ReadContext,
) -> Result<Value> {
    let header = begin_object(chunk, cursor, ctx, None)?;
    match header.num_bytes {
        Some(num_bytes) => {
            let consumed = cursor.displacement_from(&header.start);
            cursor.skip((num_bytes as i64 - consumed).max(0) as u64);
            let mut obj = AnyObject::new(classname, header.instance_version);
            obj.set("@unread_bytes", Value::U32(num_bytes));
            Ok(obj.into_value())
        }
        None => Err(Error::deserialization(
            format!(
                "unknown class {} cannot be skipped because its number of bytes is unknown",
                classname
            ),
            classname,
            cursor.index(),
            ctx.file.file_path().to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn member_lookup_searches_bases_inner_last() {
        let mut tobject = AnyObject::new("TObject", 1);
        tobject.set("fBits", Value::U32(0));
        let mut tnamed = AnyObject::new("TNamed", 1);
        tnamed.bases.push(tobject);
        tnamed.set("fName", Value::Str("events".into()));
        let mut tree = AnyObject::new("TTree", 20);
        tree.bases.push(tnamed);
        tree.set("fEntries", Value::I64(100));

        assert_eq!(tree.member_i64("fEntries"), Some(100));
        assert_eq!(tree.member_str("fName"), Some("events"));
        assert_eq!(tree.member_i64("fBits"), Some(0));
        assert!(tree.member("fMissing").is_none());
        assert_eq!(tree.name(), "events");
    }

    #[test]
    fn value_coercions() {
        assert_eq!(Value::U16(7).as_i64(), Some(7));
        assert_eq!(Value::F32(1.5).as_f64(), Some(1.5));
        assert_eq!(Value::Str("x".into()).as_str(), Some("x"));
        assert!(Value::Str("x".into()).as_i64().is_none());
        assert!(Value::None.is_none());
    }

    #[test]
    fn unknown_class_with_byte_count_consumes_exactly_that_many_bytes() {
        use crate::chunk::{Chunk, Cursor};
        use crate::deserialization::K_BYTE_COUNT_MASK;

        let mut data = Vec::new();
        data.extend_from_slice(&(K_BYTE_COUNT_MASK | 12).to_be_bytes());
        data.extend_from_slice(&7u16.to_be_bytes());
        data.extend_from_slice(&[0xAB; 10]); // opaque payload
        data.extend_from_slice(&[0xCD; 4]); // bytes beyond the object
        let chunk = Chunk::wrap("test".into(), data);

        let file = crate::file::RootFile::for_tests();
        let mut ctx = ReadContext::new(&file);
        let mut cursor = Cursor::new(0);
        let value = read_class("TNotInThisBuild", &chunk, &mut cursor, &mut ctx).unwrap();
        // num_bytes (12) + the four count bytes themselves
        assert_eq!(cursor.index(), 16);
        let obj = value.as_object().unwrap();
        assert_eq!(obj.classname, "TNotInThisBuild");
        assert_eq!(obj.instance_version, 7);
    }

    #[test]
    fn unknown_class_without_byte_count_is_a_hard_error() {
        use crate::chunk::{Chunk, Cursor};

        let mut data = Vec::new();
        data.extend_from_slice(&3u16.to_be_bytes()); // version only, no count
        data.extend_from_slice(&[0; 16]);
        let chunk = Chunk::wrap("test".into(), data);

        let file = crate::file::RootFile::for_tests();
        let mut ctx = ReadContext::new(&file);
        let mut cursor = Cursor::new(0);
        let err = read_class("TNotInThisBuild", &chunk, &mut cursor, &mut ctx).unwrap_err();
        assert!(err.is_deserialization());
        assert!(err.to_string().contains("cannot be skipped"));
    }
}
