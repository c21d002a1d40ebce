//! The streamer engine: models for `TStreamerInfo` and its element
//! subclasses, C++ typename canonicalization, and the synthesis of readers
//! for classes this library has never heard of.
//!
//! A synthesized class is not generated code; it is a [`VersionedSchema`] — a
//! list of typed [`ReadInstr`]s interpreted at read time. Contiguous plain
//! primitives coalesce into a single [`ReadInstr::Fields`], matching the
//! struct-unpack batching the on-disk layout invites.

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::chunk::{Chunk, Cursor};
use crate::deserialization::{numbytes_version, read_object_any};
use crate::error::{Error, Result};
use crate::model::{
    begin_object, finish_object, read_class, AnyObject, BuiltinClass, DispatchByVersion,
    ReadContext, Value,
};
use crate::primitive::NumKind;

// fType tags of streamer elements.
pub const K_BASE: i32 = 0;
pub const K_CHAR: i32 = 1;
pub const K_SHORT: i32 = 2;
pub const K_INT: i32 = 3;
pub const K_LONG: i32 = 4;
pub const K_FLOAT: i32 = 5;
pub const K_COUNTER: i32 = 6;
pub const K_CHAR_STAR: i32 = 7;
pub const K_DOUBLE: i32 = 8;
pub const K_DOUBLE32: i32 = 9;
pub const K_LEGACY_CHAR: i32 = 10;
pub const K_UCHAR: i32 = 11;
pub const K_USHORT: i32 = 12;
pub const K_UINT: i32 = 13;
pub const K_ULONG: i32 = 14;
pub const K_BITS: i32 = 15;
pub const K_LONG64: i32 = 16;
pub const K_ULONG64: i32 = 17;
pub const K_BOOL: i32 = 18;
pub const K_FLOAT16: i32 = 19;
pub const K_OFFSET_L: i32 = 20;
pub const K_OFFSET_P: i32 = 40;
pub const K_OBJECT: i32 = 61;
pub const K_ANY: i32 = 62;
pub const K_OBJECTP_INLINE: i32 = 63;
pub const K_OBJECTP_REF: i32 = 64;
pub const K_TSTRING: i32 = 65;
pub const K_TOBJECT: i32 = 66;
pub const K_TNAMED: i32 = 67;
pub const K_ANYP_INLINE: i32 = 68;
pub const K_ANYP_REF: i32 = 69;
pub const K_STL: i32 = 300;
pub const K_STL_STRING: i32 = 365;

// STL container tags (fSTLtype).
pub const K_STL_VECTOR: i32 = 1;
pub const K_STL_LIST: i32 = 2;
pub const K_STL_DEQUE: i32 = 3;
pub const K_STL_MAP: i32 = 4;
pub const K_STL_MULTIMAP: i32 = 5;
pub const K_STL_SET: i32 = 6;
pub const K_STL_MULTISET: i32 = 7;
pub const K_STL_BITSET: i32 = 8;

static CANONICAL_TYPENAMES: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (r"\bChar_t\b", "char"),
        (r"\bUChar_t\b", "unsigned char"),
        (r"\bShort_t\b", "short"),
        (r"\bUShort_t\b", "unsigned short"),
        (r"\bInt_t\b", "int"),
        (r"\bUInt_t\b", "unsigned int"),
        (r"\bSeek_t\b", "int"),
        (r"\bLong_t\b", "long"),
        (r"\bULong_t\b", "unsigned long"),
        (r"\bFloat_t\b", "float"),
        (r"\bFloat16_t\b", "float"),
        (r"\bDouble_t\b", "double"),
        (r"\bDouble32_t\b", "double"),
        (r"\bLongDouble_t\b", "long double"),
        (r"\bText_t\b", "char"),
        (r"\bBool_t\b", "bool"),
        (r"\bByte_t\b", "unsigned char"),
        (r"\bVersion_t\b", "short"),
        (r"\bOption_t\b", "const char"),
        (r"\bSsiz_t\b", "int"),
        (r"\bReal_t\b", "float"),
        (r"\bLong64_t\b", "long long"),
        (r"\bULong64_t\b", "unsigned long long"),
        (r"\bAxis_t\b", "double"),
        (r"\bStat_t\b", "double"),
        (r"\bFont_t\b", "short"),
        (r"\bStyle_t\b", "short"),
        (r"\bMarker_t\b", "short"),
        (r"\bWidth_t\b", "short"),
        (r"\bColor_t\b", "short"),
        (r"\bSCoord_t\b", "short"),
        (r"\bCoord_t\b", "double"),
        (r"\bAngle_t\b", "float"),
        (r"\bSize_t\b", "float"),
    ]
    .iter()
    .map(|(pattern, replacement)| (Regex::new(pattern).expect("static regex"), *replacement))
    .collect()
});

/// Replace ROOT typedef spellings with plain C++ before any dispatch on
/// typenames.
pub fn canonical_typename(name: &str) -> String {
    let mut out = name.to_string();
    for (pattern, replacement) in CANONICAL_TYPENAMES.iter() {
        out = pattern.replace_all(&out, *replacement).into_owned();
    }
    out
}

/// The on-disk element kind of a numeric fType, offsets normalized away.
pub fn ftype_to_kind(ftype: i32) -> Option<NumKind> {
    let ftype = normalize_ftype(ftype);
    Some(match ftype {
        K_BOOL => NumKind::Bool,
        K_CHAR | K_LEGACY_CHAR => NumKind::I8,
        K_UCHAR | K_CHAR_STAR => NumKind::U8,
        K_SHORT => NumKind::I16,
        K_USHORT => NumKind::U16,
        K_INT => NumKind::I32,
        K_BITS | K_UINT | K_COUNTER => NumKind::U32,
        K_LONG | K_LONG64 => NumKind::I64,
        K_ULONG | K_ULONG64 => NumKind::U64,
        K_FLOAT | K_FLOAT16 => NumKind::F32,
        K_DOUBLE | K_DOUBLE32 => NumKind::F64,
        _ => return None,
    })
}

/// Strip the fixed-array offset from an fType (`kOffsetL < t < kOffsetP`).
pub fn normalize_ftype(ftype: i32) -> i32 {
    if ftype > K_OFFSET_L && ftype < K_OFFSET_P {
        ftype - K_OFFSET_L
    } else {
        ftype
    }
}

// ---------------------------------------------------------------------------
// bootstrap models

fn read_streamer_info(chunk: &Chunk, cursor: &mut Cursor, ctx: &mut ReadContext) -> Result<Value> {
    let header = begin_object(chunk, cursor, ctx, Some(9))?;
    let mut obj = AnyObject::new("TStreamerInfo", header.instance_version);

    if let Value::Object(mut base) = read_class("TNamed", chunk, cursor, ctx)? {
        // streamer names are typenames and get the same canonicalization
        let canonical = canonical_typename(base.name());
        base.replace("fName", Value::Str(canonical));
        obj.bases.push(*base);
    }
    obj.set("fCheckSum", Value::U32(cursor.field::<u32>(chunk)?));
    obj.set("fClassVersion", Value::I32(cursor.field::<i32>(chunk)?));
    obj.set("fElements", read_object_any(chunk, cursor, ctx)?);

    finish_object(chunk, cursor, ctx, &header, "TStreamerInfo")?;
    Ok(obj.into_value())
}

/// The TStreamerElement superclass part, including the fMaxIndex version
/// branch (v1 stores a count then that many values, later versions a fixed
/// five) and the bool/uchar fixup.
fn read_element_base(chunk: &Chunk, cursor: &mut Cursor, ctx: &mut ReadContext) -> Result<Value> {
    let header = begin_object(chunk, cursor, ctx, None)?;
    let mut obj = AnyObject::new("TStreamerElement", header.instance_version);

    if let Value::Object(base) = read_class("TNamed", chunk, cursor, ctx)? {
        obj.bases.push(*base);
    }

    let mut ftype = cursor.field::<i32>(chunk)?;
    let size = cursor.field::<i32>(chunk)?;
    let array_length = cursor.field::<i32>(chunk)?;
    let array_dim = cursor.field::<i32>(chunk)?;

    let max_index = if header.instance_version == 1 {
        let n = cursor.field::<i32>(chunk)?.max(0) as usize;
        cursor.array(chunk, n, NumKind::I32)?
    } else {
        cursor.array(chunk, 5, NumKind::I32)?
    };

    let typename = canonical_typename(&cursor.string(chunk)?);
    if ftype == K_UCHAR && typename == "bool" {
        ftype = K_BOOL;
    }

    obj.set("fType", Value::I32(ftype));
    obj.set("fSize", Value::I32(size));
    obj.set("fArrayLength", Value::I32(array_length));
    obj.set("fArrayDim", Value::I32(array_dim));
    obj.set("fMaxIndex", Value::Array(max_index));
    obj.set("fTypeName", Value::Str(typename));

    finish_object(chunk, cursor, ctx, &header, "TStreamerElement")?;
    Ok(obj.into_value())
}

fn element_subclass(
    classname: &'static str,
    chunk: &Chunk,
    cursor: &mut Cursor,
    ctx: &mut ReadContext,
    extra: impl FnOnce(&mut AnyObject, &Chunk, &mut Cursor, &mut ReadContext, i32) -> Result<()>,
) -> Result<Value> {
    let header = begin_object(chunk, cursor, ctx, None)?;
    let mut obj = AnyObject::new(classname, header.instance_version);
    if let Value::Object(base) = read_element_base(chunk, cursor, ctx)? {
        obj.bases.push(*base);
    }
    extra(&mut obj, chunk, cursor, ctx, header.instance_version)?;
    finish_object(chunk, cursor, ctx, &header, classname)?;
    Ok(obj.into_value())
}

fn read_streamer_base(chunk: &Chunk, cursor: &mut Cursor, ctx: &mut ReadContext) -> Result<Value> {
    element_subclass("TStreamerBase", chunk, cursor, ctx, |obj, chunk, cursor, _ctx, version| {
        if version >= 2 {
            obj.set("fBaseVersion", Value::I32(cursor.field::<i32>(chunk)?));
        }
        Ok(())
    })
}

fn read_counted_extra(
    obj: &mut AnyObject,
    chunk: &Chunk,
    cursor: &mut Cursor,
) -> Result<()> {
    obj.set("fCountVersion", Value::I32(cursor.field::<i32>(chunk)?));
    obj.set("fCountName", Value::Str(cursor.string(chunk)?));
    obj.set("fCountClass", Value::Str(cursor.string(chunk)?));
    Ok(())
}

fn read_streamer_basic_pointer(
    chunk: &Chunk,
    cursor: &mut Cursor,
    ctx: &mut ReadContext,
) -> Result<Value> {
    element_subclass(
        "TStreamerBasicPointer",
        chunk,
        cursor,
        ctx,
        |obj, chunk, cursor, _ctx, _v| read_counted_extra(obj, chunk, cursor),
    )
}

fn read_streamer_loop(chunk: &Chunk, cursor: &mut Cursor, ctx: &mut ReadContext) -> Result<Value> {
    element_subclass(
        "TStreamerLoop",
        chunk,
        cursor,
        ctx,
        |obj, chunk, cursor, _ctx, _v| read_counted_extra(obj, chunk, cursor),
    )
}

/// TStreamerBasicType folds fixed-array offsets out of fType and recomputes
/// the element byte size from the (possibly adjusted) type tag.
fn read_streamer_basic_type(
    chunk: &Chunk,
    cursor: &mut Cursor,
    ctx: &mut ReadContext,
) -> Result<Value> {
    element_subclass(
        "TStreamerBasicType",
        chunk,
        cursor,
        ctx,
        |obj, _chunk, _cursor, _ctx, _v| {
            let ftype = obj.member_i64("fType").unwrap_or(0) as i32;
            let adjusted = normalize_ftype(ftype);
            if adjusted != ftype {
                obj.replace("fType", Value::I32(adjusted));
            }
            if let Some(kind) = ftype_to_kind(adjusted) {
                let mut size = kind.byte_size() as i64;
                let array_length = obj.member_i64("fArrayLength").unwrap_or(0);
                if array_length > 0 {
                    size *= array_length;
                }
                obj.replace("fSize", Value::I32(size as i32));
            }
            Ok(())
        },
    )
}

fn read_streamer_stl(chunk: &Chunk, cursor: &mut Cursor, ctx: &mut ReadContext) -> Result<Value> {
    element_subclass(
        "TStreamerSTL",
        chunk,
        cursor,
        ctx,
        |obj, chunk, cursor, _ctx, _v| {
            let mut stl_type = cursor.field::<i32>(chunk)?;
            let ctype = cursor.field::<i32>(chunk)?;

            // multimap/set share a tag in old files; the typename decides
            if stl_type == K_STL_MULTIMAP || stl_type == K_STL_SET {
                let typename = obj.member_str("fTypeName").unwrap_or("").to_string();
                if typename.starts_with("std::set") || typename.starts_with("set") {
                    stl_type = K_STL_SET;
                } else if typename.starts_with("std::multimap")
                    || typename.starts_with("multimap")
                {
                    stl_type = K_STL_MULTIMAP;
                }
            }

            obj.set("fSTLtype", Value::I32(stl_type));
            obj.set("fCtype", Value::I32(ctype));
            Ok(())
        },
    )
}

macro_rules! plain_element_subclass {
    ($(($fn_name:ident, $classname:literal)),* $(,)?) => {
        $(
            fn $fn_name(chunk: &Chunk, cursor: &mut Cursor, ctx: &mut ReadContext) -> Result<Value> {
                element_subclass($classname, chunk, cursor, ctx, |_, _, _, _, _| Ok(()))
            }
        )*
    };
}

plain_element_subclass! {
    (read_streamer_artificial, "TStreamerArtificial"),
    (read_streamer_object, "TStreamerObject"),
    (read_streamer_object_any, "TStreamerObjectAny"),
    (read_streamer_object_any_pointer, "TStreamerObjectAnyPointer"),
    (read_streamer_object_pointer, "TStreamerObjectPointer"),
    (read_streamer_stl_string, "TStreamerSTLstring"),
    (read_streamer_string, "TStreamerString"),
}

pub static TSTREAMER_INFO: BuiltinClass = BuiltinClass {
    classname: "TStreamerInfo",
    read: read_streamer_info,
};
pub static TSTREAMER_ELEMENT: BuiltinClass = BuiltinClass {
    classname: "TStreamerElement",
    read: read_element_base,
};
pub static TSTREAMER_ARTIFICIAL: BuiltinClass = BuiltinClass {
    classname: "TStreamerArtificial",
    read: read_streamer_artificial,
};
pub static TSTREAMER_BASE: BuiltinClass = BuiltinClass {
    classname: "TStreamerBase",
    read: read_streamer_base,
};
pub static TSTREAMER_BASIC_POINTER: BuiltinClass = BuiltinClass {
    classname: "TStreamerBasicPointer",
    read: read_streamer_basic_pointer,
};
pub static TSTREAMER_BASIC_TYPE: BuiltinClass = BuiltinClass {
    classname: "TStreamerBasicType",
    read: read_streamer_basic_type,
};
pub static TSTREAMER_LOOP: BuiltinClass = BuiltinClass {
    classname: "TStreamerLoop",
    read: read_streamer_loop,
};
pub static TSTREAMER_OBJECT: BuiltinClass = BuiltinClass {
    classname: "TStreamerObject",
    read: read_streamer_object,
};
pub static TSTREAMER_OBJECT_ANY: BuiltinClass = BuiltinClass {
    classname: "TStreamerObjectAny",
    read: read_streamer_object_any,
};
pub static TSTREAMER_OBJECT_ANY_POINTER: BuiltinClass = BuiltinClass {
    classname: "TStreamerObjectAnyPointer",
    read: read_streamer_object_any_pointer,
};
pub static TSTREAMER_OBJECT_POINTER: BuiltinClass = BuiltinClass {
    classname: "TStreamerObjectPointer",
    read: read_streamer_object_pointer,
};
pub static TSTREAMER_STL: BuiltinClass = BuiltinClass {
    classname: "TStreamerSTL",
    read: read_streamer_stl,
};
pub static TSTREAMER_STL_STRING: BuiltinClass = BuiltinClass {
    classname: "TStreamerSTLstring",
    read: read_streamer_stl_string,
};
pub static TSTREAMER_STRING: BuiltinClass = BuiltinClass {
    classname: "TStreamerString",
    read: read_streamer_string,
};

// ---------------------------------------------------------------------------
// typed views over the raw streamer objects

/// One class description from the file's streamer records.
#[derive(Debug, Clone)]
pub struct StreamerInfo {
    pub name: String,
    pub class_version: i32,
    pub checksum: u32,
    pub elements: Vec<StreamerElement>,
}

/// The element subtypes the synthesizer distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    Base,
    BasicType,
    BasicPointer,
    Loop,
    Stl,
    StlString,
    Object,
    ObjectAny,
    ObjectPointer,
    ObjectAnyPointer,
    String,
    Artificial,
}

/// One field description, flattened out of the model objects.
#[derive(Debug, Clone)]
pub struct StreamerElement {
    pub kind: ElementKind,
    pub name: String,
    pub title: String,
    pub typename: String,
    pub ftype: i32,
    pub array_length: i32,
    pub count_name: Option<String>,
    pub base_version: Option<i32>,
    pub stl_type: Option<i32>,
    pub ctype: Option<i32>,
}

impl StreamerElement {
    fn from_object(obj: &AnyObject) -> Option<StreamerElement> {
        let kind = match obj.classname.as_str() {
            "TStreamerBase" => ElementKind::Base,
            "TStreamerBasicType" => ElementKind::BasicType,
            "TStreamerBasicPointer" => ElementKind::BasicPointer,
            "TStreamerLoop" => ElementKind::Loop,
            "TStreamerSTL" => ElementKind::Stl,
            "TStreamerSTLstring" => ElementKind::StlString,
            "TStreamerObject" => ElementKind::Object,
            "TStreamerObjectAny" => ElementKind::ObjectAny,
            "TStreamerObjectPointer" => ElementKind::ObjectPointer,
            "TStreamerObjectAnyPointer" => ElementKind::ObjectAnyPointer,
            "TStreamerString" => ElementKind::String,
            "TStreamerArtificial" => ElementKind::Artificial,
            _ => return None,
        };
        Some(StreamerElement {
            kind,
            name: obj.name().to_string(),
            title: obj.title().to_string(),
            typename: obj.member_str("fTypeName").unwrap_or("").to_string(),
            ftype: obj.member_i64("fType").unwrap_or(0) as i32,
            array_length: obj.member_i64("fArrayLength").unwrap_or(0) as i32,
            count_name: obj.member_str("fCountName").map(str::to_string),
            base_version: obj.member_i64("fBaseVersion").map(|v| v as i32),
            stl_type: obj.member_i64("fSTLtype").map(|v| v as i32),
            ctype: obj.member_i64("fCtype").map(|v| v as i32),
        })
    }

    fn pointee(&self) -> String {
        self.typename.trim_end_matches('*').to_string()
    }

    pub fn is_stl_string(&self) -> bool {
        self.stl_type == Some(K_STL_STRING) || self.typename == "string"
    }

    /// Element kind of a `vector<primitive>` STL member, if it is one.
    pub fn stl_vector_kind(&self) -> Option<NumKind> {
        if self.stl_type == Some(K_STL_VECTOR) {
            if let Some(kind) = self.ctype.and_then(ftype_to_kind) {
                return Some(kind);
            }
        }
        let inner = self
            .typename
            .strip_prefix("std::vector<")
            .or_else(|| self.typename.strip_prefix("vector<"))?
            .strip_suffix('>')?;
        match inner.trim() {
            "bool" => Some(NumKind::Bool),
            "char" => Some(NumKind::I8),
            "unsigned char" => Some(NumKind::U8),
            "short" => Some(NumKind::I16),
            "unsigned short" => Some(NumKind::U16),
            "int" => Some(NumKind::I32),
            "unsigned int" => Some(NumKind::U32),
            "long" | "long long" => Some(NumKind::I64),
            "unsigned long" | "unsigned long long" => Some(NumKind::U64),
            "float" => Some(NumKind::F32),
            "double" => Some(NumKind::F64),
            _ => None,
        }
    }
}

impl StreamerInfo {
    /// Lift a freshly read `TStreamerInfo` model into the typed view.
    pub fn from_value(value: &Value) -> Option<StreamerInfo> {
        let obj = value.as_object()?;
        if obj.classname != "TStreamerInfo" {
            return None;
        }
        let elements = obj
            .member("fElements")?
            .as_list()?
            .iter()
            .filter_map(|element| element.as_object().and_then(StreamerElement::from_object))
            .collect();
        Some(StreamerInfo {
            name: obj.name().to_string(),
            class_version: obj.member_i64("fClassVersion")? as i32,
            checksum: obj.member_i64("fCheckSum").unwrap_or(0) as u32,
            elements,
        })
    }
}

// ---------------------------------------------------------------------------
// synthesis

/// One step of a synthesized reader.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadInstr {
    /// Superclass data for the named class, appended to `bases`.
    Base { classname: String, version: i32 },
    /// A coalesced run of plain primitives.
    Fields(Vec<(String, NumKind)>),
    /// A fixed-length primitive array member.
    FixedArray {
        name: String,
        kind: NumKind,
        length: usize,
    },
    /// A speedbump-guarded array whose length lives in another member.
    /// `wide_seek_selector` marks `TBranch::fBasketSeek`, whose speedbump
    /// byte value 2 upgrades the elements to 64-bit.
    CountedArray {
        name: String,
        kind: NumKind,
        count_member: String,
        wide_seek_selector: bool,
    },
    /// Six bytes of nested header, then `count_member` nested objects.
    Loop {
        name: String,
        classname: String,
        count_member: String,
    },
    /// A string-like STL member: six-byte header, then a string.
    StlString { name: String },
    /// `std::vector` of a primitive: six-byte header, count, elements.
    StlVectorPrimitive { name: String, kind: NumKind },
    /// The dedicated `map<string,string>` reader.
    MapStringString { name: String },
    /// A nested object read inline through the registry.
    ObjectInline { name: String, classname: String },
    /// A pointer-any member.
    ObjectAny { name: String },
    /// A TString member.
    MemberString { name: String },
    /// An element that must not be silently skipped; reading it fails.
    Fail { name: String, reason: String },
}

/// The synthesized reader for one (class, version).
pub struct VersionedSchema {
    pub classname: String,
    pub version: i32,
    pub checksum: u32,
    pub instructions: Vec<ReadInstr>,
}

/// Compile a streamer description into a schema.
pub fn synthesize(streamer: &StreamerInfo) -> VersionedSchema {
    let mut instructions: Vec<ReadInstr> = Vec::new();
    let mut run: Vec<(String, NumKind)> = Vec::new();

    macro_rules! flush_run {
        () => {
            if !run.is_empty() {
                instructions.push(ReadInstr::Fields(std::mem::take(&mut run)));
            }
        };
    }

    for element in &streamer.elements {
        match element.kind {
            ElementKind::BasicType if element.array_length == 0 => {
                match ftype_to_kind(element.ftype) {
                    Some(kind) => run.push((element.name.clone(), kind)),
                    None => {
                        flush_run!();
                        instructions.push(ReadInstr::Fail {
                            name: element.name.clone(),
                            reason: format!("basic type with fType {}", element.ftype),
                        });
                    }
                }
                continue;
            }
            _ => flush_run!(),
        }

        match element.kind {
            ElementKind::BasicType => match ftype_to_kind(element.ftype) {
                Some(kind) => instructions.push(ReadInstr::FixedArray {
                    name: element.name.clone(),
                    kind,
                    length: element.array_length.max(0) as usize,
                }),
                None => instructions.push(ReadInstr::Fail {
                    name: element.name.clone(),
                    reason: format!("basic array with fType {}", element.ftype),
                }),
            },
            ElementKind::Base => instructions.push(ReadInstr::Base {
                classname: element.name.clone(),
                version: element.base_version.unwrap_or(-1),
            }),
            ElementKind::BasicPointer => {
                let kind = ftype_to_kind(element.ftype - K_OFFSET_P);
                match (kind, &element.count_name) {
                    (Some(kind), Some(count_member)) => {
                        instructions.push(ReadInstr::CountedArray {
                            name: element.name.clone(),
                            kind,
                            count_member: count_member.clone(),
                            wide_seek_selector: streamer.name == "TBranch"
                                && element.name == "fBasketSeek",
                        })
                    }
                    _ => instructions.push(ReadInstr::Fail {
                        name: element.name.clone(),
                        reason: format!("counted array with fType {}", element.ftype),
                    }),
                }
            }
            ElementKind::Loop => match &element.count_name {
                Some(count_member) => instructions.push(ReadInstr::Loop {
                    name: element.name.clone(),
                    classname: element.pointee(),
                    count_member: count_member.clone(),
                }),
                None => instructions.push(ReadInstr::Fail {
                    name: element.name.clone(),
                    reason: "loop without a count member".into(),
                }),
            },
            ElementKind::Stl => {
                if element.is_stl_string() {
                    instructions.push(ReadInstr::StlString {
                        name: element.name.clone(),
                    });
                } else if let Some(kind) = element.stl_vector_kind() {
                    instructions.push(ReadInstr::StlVectorPrimitive {
                        name: element.name.clone(),
                        kind,
                    });
                } else if element.typename == "map<string,string>"
                    || element.typename == "std::map<std::string,std::string>"
                {
                    instructions.push(ReadInstr::MapStringString {
                        name: element.name.clone(),
                    });
                } else {
                    instructions.push(ReadInstr::Fail {
                        name: element.name.clone(),
                        reason: format!("unsupported STL shape {}", element.typename),
                    });
                }
            }
            ElementKind::ObjectPointer | ElementKind::ObjectAnyPointer => {
                if element.ftype == K_OBJECTP_INLINE || element.ftype == K_ANYP_INLINE {
                    instructions.push(ReadInstr::ObjectInline {
                        name: element.name.clone(),
                        classname: element.pointee(),
                    });
                } else if element.ftype == K_OBJECTP_REF || element.ftype == K_ANYP_REF {
                    instructions.push(ReadInstr::ObjectAny {
                        name: element.name.clone(),
                    });
                } else {
                    instructions.push(ReadInstr::Fail {
                        name: element.name.clone(),
                        reason: format!("object pointer with fType {}", element.ftype),
                    });
                }
            }
            ElementKind::Object | ElementKind::ObjectAny => {
                instructions.push(ReadInstr::ObjectInline {
                    name: element.name.clone(),
                    classname: element.pointee(),
                });
            }
            ElementKind::String => instructions.push(ReadInstr::MemberString {
                name: element.name.clone(),
            }),
            ElementKind::StlString | ElementKind::Artificial => {
                instructions.push(ReadInstr::Fail {
                    name: element.name.clone(),
                    reason: format!("members defined by {:?} elements", element.kind),
                });
            }
        }
    }
    flush_run!();

    debug!(
        classname = %streamer.name,
        version = streamer.class_version,
        num_instructions = instructions.len(),
        "synthesized reader from streamer"
    );
    VersionedSchema {
        classname: streamer.name.clone(),
        version: streamer.class_version,
        checksum: streamer.checksum,
        instructions,
    }
}

impl VersionedSchema {
    /// Interpret the instruction list against the byte stream.
    pub fn read(&self, chunk: &Chunk, cursor: &mut Cursor, ctx: &mut ReadContext) -> Result<Value> {
        let header = begin_object(chunk, cursor, ctx, Some(self.version))?;
        let mut obj = AnyObject::new(self.classname.clone(), header.instance_version);

        for instr in &self.instructions {
            self.run_instruction(instr, &mut obj, chunk, cursor, ctx)?;
        }

        finish_object(chunk, cursor, ctx, &header, &self.classname)?;
        Ok(obj.into_value())
    }

    fn run_instruction(
        &self,
        instr: &ReadInstr,
        obj: &mut AnyObject,
        chunk: &Chunk,
        cursor: &mut Cursor,
        ctx: &mut ReadContext,
    ) -> Result<()> {
        match instr {
            ReadInstr::Base { classname, .. } => {
                if let Value::Object(base) = read_class(classname, chunk, cursor, ctx)? {
                    obj.bases.push(*base);
                }
            }
            ReadInstr::Fields(fields) => {
                for (name, kind) in fields {
                    obj.set(name.clone(), read_primitive(chunk, cursor, *kind)?);
                }
            }
            ReadInstr::FixedArray { name, kind, length } => {
                obj.set(name.clone(), Value::Array(cursor.array(chunk, *length, *kind)?));
            }
            ReadInstr::CountedArray {
                name,
                kind,
                count_member,
                wide_seek_selector,
            } => {
                let mut kind = *kind;
                if ctx.speedbump {
                    let bump = cursor.field::<u8>(chunk)?;
                    if *wide_seek_selector && bump == 2 {
                        kind = NumKind::I64;
                    }
                }
                let count = self.count_of(obj, count_member, chunk, cursor)?;
                obj.set(name.clone(), Value::Array(cursor.array(chunk, count, kind)?));
            }
            ReadInstr::Loop {
                name,
                classname,
                count_member,
            } => {
                cursor.skip(6);
                let count = self.count_of(obj, count_member, chunk, cursor)?;
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(read_class(classname, chunk, cursor, ctx)?);
                }
                obj.set(name.clone(), Value::List(items));
            }
            ReadInstr::StlString { name } => {
                cursor.skip(6);
                obj.set(name.clone(), Value::Str(cursor.string(chunk)?));
            }
            ReadInstr::StlVectorPrimitive { name, kind } => {
                cursor.skip(6);
                let n = cursor.field::<i32>(chunk)?.max(0) as usize;
                obj.set(name.clone(), Value::Array(cursor.array(chunk, n, *kind)?));
            }
            ReadInstr::MapStringString { name } => {
                cursor.skip(12);
                let n = cursor.field::<i32>(chunk)?.max(0) as usize;
                let mut keys = Vec::with_capacity(n);
                for _ in 0..n {
                    keys.push(cursor.string(chunk)?);
                }
                let mut pairs = Vec::with_capacity(n);
                for key in keys {
                    let value = cursor.string(chunk)?;
                    pairs.push((Value::Str(key), Value::Str(value)));
                }
                obj.set(name.clone(), Value::Map(pairs));
            }
            ReadInstr::ObjectInline { name, classname } => {
                obj.set(name.clone(), read_class(classname, chunk, cursor, ctx)?);
            }
            ReadInstr::ObjectAny { name } => {
                obj.set(name.clone(), read_object_any(chunk, cursor, ctx)?);
            }
            ReadInstr::MemberString { name } => {
                obj.set(name.clone(), Value::Str(cursor.string(chunk)?));
            }
            ReadInstr::Fail { name, reason } => {
                return Err(Error::deserialization(
                    format!("cannot read member {}: {}", name, reason),
                    self.classname.clone(),
                    cursor.index(),
                    ctx.file.file_path().to_string(),
                ));
            }
        }
        Ok(())
    }

    fn count_of(
        &self,
        obj: &AnyObject,
        count_member: &str,
        chunk: &Chunk,
        cursor: &Cursor,
    ) -> Result<usize> {
        obj.member_i64(count_member)
            .filter(|count| *count >= 0)
            .map(|count| count as usize)
            .ok_or_else(|| {
                Error::deserialization(
                    format!("count member {} is missing or negative", count_member),
                    self.classname.clone(),
                    cursor.index(),
                    chunk.file_path().to_string(),
                )
            })
    }
}

fn read_primitive(chunk: &Chunk, cursor: &mut Cursor, kind: NumKind) -> Result<Value> {
    Ok(match kind {
        NumKind::Bool => Value::Bool(cursor.field::<u8>(chunk)? != 0),
        NumKind::I8 => Value::I8(cursor.field::<i8>(chunk)?),
        NumKind::U8 => Value::U8(cursor.field::<u8>(chunk)?),
        NumKind::I16 => Value::I16(cursor.field::<i16>(chunk)?),
        NumKind::U16 => Value::U16(cursor.field::<u16>(chunk)?),
        NumKind::I32 => Value::I32(cursor.field::<i32>(chunk)?),
        NumKind::U32 => Value::U32(cursor.field::<u32>(chunk)?),
        NumKind::I64 => Value::I64(cursor.field::<i64>(chunk)?),
        NumKind::U64 => Value::U64(cursor.field::<u64>(chunk)?),
        NumKind::F32 => Value::F32(cursor.field::<f32>(chunk)?),
        NumKind::F64 => Value::F64(cursor.field::<f64>(chunk)?),
    })
}

// ---------------------------------------------------------------------------
// version dispatch

/// Read one instance of a streamer-synthesized class: peek the version,
/// select (or create) the matching schema, and delegate.
///
/// When the byte-count marker is absent inside a TBranch, the maximum known
/// streamer version is used and the cursor stays where it was; unknown
/// versions with a known byte count are skipped like unknown classes.
pub fn read_dispatched(
    dispatch: &DispatchByVersion,
    chunk: &Chunk,
    cursor: &mut Cursor,
    ctx: &mut ReadContext,
) -> Result<Value> {
    let mut probe = *cursor;
    let (num_bytes, version, _memberwise) = numbytes_version(chunk, &mut probe, ctx)?;

    let schema = if let Some(schema) = dispatch.class_of_version(version) {
        Some(schema)
    } else if num_bytes.is_some() {
        new_schema(dispatch, version, ctx)?
    } else if ctx.in_branch {
        new_schema_max(dispatch, ctx)?
    } else {
        return Err(Error::deserialization(
            format!(
                "unknown version {} for class {} that cannot be skipped because its number of bytes is unknown",
                version, dispatch.classname
            ),
            dispatch.classname.clone(),
            cursor.index(),
            ctx.file.file_path().to_string(),
        ));
    };

    match schema {
        Some(schema) => schema.read(chunk, cursor, ctx),
        None => {
            // No streamer for this version: consume the declared bytes.
            match num_bytes {
                Some(num_bytes) => {
                    let start = *cursor;
                    let _ = numbytes_version(chunk, cursor, ctx)?;
                    let consumed = cursor.displacement_from(&start);
                    cursor.skip((num_bytes as i64 - consumed).max(0) as u64);
                    let mut obj = AnyObject::new(dispatch.classname.clone(), version);
                    obj.set("@unread_bytes", Value::U32(num_bytes));
                    Ok(obj.into_value())
                }
                None => Err(Error::deserialization(
                    format!(
                        "class {} with unknown version {} cannot be skipped because its number of bytes is unknown",
                        dispatch.classname, version
                    ),
                    dispatch.classname.clone(),
                    cursor.index(),
                    ctx.file.file_path().to_string(),
                )),
            }
        }
    }
}

fn new_schema(
    dispatch: &DispatchByVersion,
    version: i32,
    ctx: &ReadContext,
) -> Result<Option<Arc<VersionedSchema>>> {
    let streamer = ctx
        .file
        .streamer_named(&dispatch.classname, Some(version))
        .or_else(|| ctx.file.streamer_named(&dispatch.classname, None));
    Ok(streamer.map(|streamer| {
        let schema = Arc::new(synthesize(&streamer));
        dispatch.insert(streamer.class_version, Arc::clone(&schema));
        schema
    }))
}

fn new_schema_max(
    dispatch: &DispatchByVersion,
    ctx: &ReadContext,
) -> Result<Option<Arc<VersionedSchema>>> {
    if let Some((_, max)) = dispatch.known_version_bounds() {
        return Ok(dispatch.class_of_version(max));
    }
    let streamer = ctx.file.streamer_named(&dispatch.classname, None);
    Ok(streamer.map(|streamer| {
        let schema = Arc::new(synthesize(&streamer));
        dispatch.insert(streamer.class_version, Arc::clone(&schema));
        schema
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typedef_spellings_canonicalize() {
        assert_eq!(canonical_typename("Int_t"), "int");
        assert_eq!(canonical_typename("Double32_t"), "double");
        assert_eq!(
            canonical_typename("map<Int_t,vector<Float_t> >"),
            "map<int,vector<float> >"
        );
        // word boundaries: no replacement mid-identifier
        assert_eq!(canonical_typename("MyInt_type"), "MyInt_type");
    }

    #[test]
    fn ftype_offsets_normalize() {
        assert_eq!(normalize_ftype(K_INT + K_OFFSET_L), K_INT);
        assert_eq!(normalize_ftype(K_INT), K_INT);
        assert_eq!(normalize_ftype(K_OBJECT), K_OBJECT);
        assert_eq!(ftype_to_kind(K_DOUBLE32), Some(NumKind::F64));
        assert_eq!(ftype_to_kind(K_FLOAT16), Some(NumKind::F32));
        assert_eq!(ftype_to_kind(K_STL), None);
    }

    fn basic(name: &str, ftype: i32) -> StreamerElement {
        StreamerElement {
            kind: ElementKind::BasicType,
            name: name.into(),
            title: String::new(),
            typename: String::new(),
            ftype,
            array_length: 0,
            count_name: None,
            base_version: None,
            stl_type: None,
            ctype: None,
        }
    }

    #[test]
    fn contiguous_primitives_coalesce_into_one_unpack() {
        let streamer = StreamerInfo {
            name: "Widget".into(),
            class_version: 1,
            checksum: 0,
            elements: vec![
                basic("fA", K_INT),
                basic("fB", K_DOUBLE),
                StreamerElement {
                    kind: ElementKind::String,
                    name: "fLabel".into(),
                    title: String::new(),
                    typename: "TString".into(),
                    ftype: K_TSTRING,
                    array_length: 0,
                    count_name: None,
                    base_version: None,
                    stl_type: None,
                    ctype: None,
                },
                basic("fC", K_SHORT),
            ],
        };
        let schema = synthesize(&streamer);
        assert_eq!(
            schema.instructions,
            vec![
                ReadInstr::Fields(vec![
                    ("fA".into(), NumKind::I32),
                    ("fB".into(), NumKind::F64)
                ]),
                ReadInstr::MemberString {
                    name: "fLabel".into()
                },
                ReadInstr::Fields(vec![("fC".into(), NumKind::I16)]),
            ]
        );
    }

    #[test]
    fn artificial_elements_fail_at_read_not_at_synthesis() {
        let streamer = StreamerInfo {
            name: "Widget".into(),
            class_version: 1,
            checksum: 0,
            elements: vec![StreamerElement {
                kind: ElementKind::Artificial,
                name: "fRule".into(),
                title: String::new(),
                typename: String::new(),
                ftype: 0,
                array_length: 0,
                count_name: None,
                base_version: None,
                stl_type: None,
                ctype: None,
            }],
        };
        let schema = synthesize(&streamer);
        assert!(matches!(schema.instructions[0], ReadInstr::Fail { .. }));
    }

    #[test]
    fn stl_shapes_route_to_the_right_instruction() {
        let mut vector_int = basic("fValues", K_STL);
        vector_int.kind = ElementKind::Stl;
        vector_int.typename = "vector<int>".into();
        vector_int.stl_type = Some(K_STL_VECTOR);
        vector_int.ctype = Some(K_INT);

        let mut map_ss = basic("fConfig", K_STL);
        map_ss.kind = ElementKind::Stl;
        map_ss.typename = "map<string,string>".into();
        map_ss.stl_type = Some(K_STL_MAP);

        let mut exotic = basic("fOther", K_STL);
        exotic.kind = ElementKind::Stl;
        exotic.typename = "map<int,vector<MyClass>>".into();
        exotic.stl_type = Some(K_STL_MAP);

        let streamer = StreamerInfo {
            name: "Head".into(),
            class_version: 2,
            checksum: 0,
            elements: vec![vector_int, map_ss, exotic],
        };
        let schema = synthesize(&streamer);
        assert_eq!(
            schema.instructions[0],
            ReadInstr::StlVectorPrimitive {
                name: "fValues".into(),
                kind: NumKind::I32
            }
        );
        assert_eq!(
            schema.instructions[1],
            ReadInstr::MapStringString {
                name: "fConfig".into()
            }
        );
        match &schema.instructions[2] {
            ReadInstr::Fail { reason, .. } => assert!(reason.contains("unsupported STL")),
            other => panic!("expected failure instruction, got {:?}", other),
        }
    }

    #[test]
    fn basket_seek_gets_the_wide_selector() {
        let mut seek = basic("fBasketSeek", K_OFFSET_P + K_INT);
        seek.kind = ElementKind::BasicPointer;
        seek.count_name = Some("fMaxBaskets".into());

        let streamer = StreamerInfo {
            name: "TBranch".into(),
            class_version: 13,
            checksum: 0,
            elements: vec![seek],
        };
        let schema = synthesize(&streamer);
        assert_eq!(
            schema.instructions[0],
            ReadInstr::CountedArray {
                name: "fBasketSeek".into(),
                kind: NumKind::I32,
                count_member: "fMaxBaskets".into(),
                wide_seek_selector: true,
            }
        );
    }
}
