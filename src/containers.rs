//! Composable descriptions of how container bytes become values:
//! strings with two length encodings, `std::vector`/`std::set`/`std::map`,
//! plain arrays, pointer-any references, and dynamically typed members —
//! plus the parser that turns C++ typenames into these descriptions.
//!
//! Descriptors compare structurally, so two identically shaped containers
//! share a cache key.

use crate::chunk::{Chunk, Cursor};
use crate::deserialization::{numbytes_check, numbytes_version, read_object_any};
use crate::error::{Error, Result};
use crate::model::{read_class, ReadContext, Value};
use crate::primitive::NumKind;
use crate::streamers::canonical_typename;

/// How a string's length is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthBytes {
    /// One byte, escaping to four big-endian bytes when it is 255.
    OneToFive,
    /// Always four big-endian bytes.
    Four,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AsString {
    pub header: bool,
    pub length_bytes: LengthBytes,
}

impl AsString {
    pub fn new(header: bool) -> AsString {
        AsString {
            header,
            length_bytes: LengthBytes::OneToFive,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AsVector {
    pub header: bool,
    pub values: Item,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AsSet {
    pub header: bool,
    pub keys: Item,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AsMap {
    pub header: bool,
    pub keys: Item,
    pub values: Item,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AsArray {
    pub header: bool,
    pub speedbump: bool,
    pub values: Item,
}

/// The element type inside a container.
#[derive(Debug, Clone, PartialEq)]
pub enum Item {
    /// A big-endian primitive.
    Dtype(NumKind),
    /// A nested container.
    Container(Box<AsContainer>),
    /// A class resolved through the registry at read time.
    Class(String),
}

/// Every container shape this library can read.
#[derive(Debug, Clone, PartialEq)]
pub enum AsContainer {
    String(AsString),
    Vector(AsVector),
    Set(AsSet),
    Map(AsMap),
    Array(AsArray),
    /// An object referred to by pointer; resolves through the
    /// back-reference arena.
    Pointer,
    /// A class name written into the stream ahead of the instance.
    Dynamic,
    /// A shape that is known to be unimplemented; reading it fails with
    /// this message.
    Fixme(String),
}

impl AsContainer {
    /// Whether this container wraps itself in a byte-count/version frame.
    pub fn header(&self) -> bool {
        match self {
            AsContainer::String(s) => s.header,
            AsContainer::Vector(v) => v.header,
            AsContainer::Set(s) => s.header,
            AsContainer::Map(m) => m.header,
            AsContainer::Array(a) => a.header,
            AsContainer::Pointer | AsContainer::Dynamic | AsContainer::Fixme(_) => false,
        }
    }

    /// A C++ spelling for messages and cache keys.
    pub fn typename(&self) -> String {
        match self {
            AsContainer::String(_) => "std::string".into(),
            AsContainer::Vector(v) => format!("std::vector<{}>", v.values.typename()),
            AsContainer::Set(s) => format!("std::set<{}>", s.keys.typename()),
            AsContainer::Map(m) => format!(
                "std::map<{}, {}>",
                m.keys.typename(),
                m.values.typename()
            ),
            AsContainer::Array(a) => format!("{}*", a.values.typename()),
            AsContainer::Pointer | AsContainer::Dynamic => "void*".into(),
            AsContainer::Fixme(_) => "unknown".into(),
        }
    }

    pub fn read(
        &self,
        chunk: &Chunk,
        cursor: &mut Cursor,
        ctx: &mut ReadContext,
        header: bool,
    ) -> Result<Value> {
        match self {
            AsContainer::String(desc) => desc.read(chunk, cursor, ctx, header),
            AsContainer::Vector(desc) => desc.read(chunk, cursor, ctx, header),
            AsContainer::Set(desc) => desc.read(chunk, cursor, ctx, header),
            AsContainer::Map(desc) => desc.read(chunk, cursor, ctx, header),
            AsContainer::Array(desc) => desc.read(chunk, cursor, ctx, header),
            AsContainer::Pointer => read_object_any(chunk, cursor, ctx),
            AsContainer::Dynamic => {
                let classname = cursor.string(chunk)?;
                cursor.skip(1);
                read_class(&classname, chunk, cursor, ctx)
            }
            AsContainer::Fixme(message) => Err(Error::deserialization(
                message.clone(),
                "AsFIXME",
                cursor.index(),
                ctx.file.file_path().to_string(),
            )),
        }
    }
}

impl Item {
    pub fn typename(&self) -> String {
        match self {
            Item::Dtype(kind) => kind.typename().to_string(),
            Item::Container(inner) => inner.typename(),
            Item::Class(name) => name.clone(),
        }
    }

    fn has_header(&self) -> bool {
        match self {
            Item::Container(inner) => inner.header(),
            _ => false,
        }
    }

    /// Read `n` elements of this item.
    fn read_many(
        &self,
        n: usize,
        chunk: &Chunk,
        cursor: &mut Cursor,
        ctx: &mut ReadContext,
        header: bool,
    ) -> Result<Value> {
        match self {
            Item::Dtype(kind) => Ok(Value::Array(cursor.array(chunk, n, *kind)?)),
            Item::Container(inner) => {
                let mut out = Vec::with_capacity(n);
                for _ in 0..n {
                    out.push(inner.read(chunk, cursor, ctx, header)?);
                }
                Ok(Value::List(out))
            }
            Item::Class(classname) => {
                let mut out = Vec::with_capacity(n);
                for _ in 0..n {
                    out.push(read_class(classname, chunk, cursor, ctx)?);
                }
                Ok(Value::List(out))
            }
        }
    }
}

/// Frame bookkeeping shared by the with-header read paths.
struct Frame {
    start: Cursor,
    num_bytes: Option<u32>,
    is_memberwise: bool,
}

fn open_frame(
    chunk: &Chunk,
    cursor: &mut Cursor,
    ctx: &mut ReadContext,
    enabled: bool,
) -> Result<Frame> {
    if enabled {
        let start = *cursor;
        let (num_bytes, _version, is_memberwise) = numbytes_version(chunk, cursor, ctx)?;
        Ok(Frame {
            start,
            num_bytes,
            is_memberwise,
        })
    } else {
        Ok(Frame {
            start: *cursor,
            num_bytes: None,
            is_memberwise: false,
        })
    }
}

fn close_frame(
    chunk: &Chunk,
    cursor: &Cursor,
    ctx: &ReadContext,
    frame: &Frame,
    typename: &str,
    enabled: bool,
) -> Result<()> {
    if enabled {
        numbytes_check(chunk, &frame.start, cursor, frame.num_bytes, typename, ctx)?;
    }
    Ok(())
}

impl AsString {
    pub fn read(
        &self,
        chunk: &Chunk,
        cursor: &mut Cursor,
        ctx: &mut ReadContext,
        header: bool,
    ) -> Result<Value> {
        let enabled = self.header && header;
        let frame = open_frame(chunk, cursor, ctx, enabled)?;
        let out = match self.length_bytes {
            LengthBytes::OneToFive => cursor.string(chunk)?,
            LengthBytes::Four => {
                let length = cursor.field::<u32>(chunk)?;
                cursor.string_with_length(chunk, length as u64)?
            }
        };
        close_frame(chunk, cursor, ctx, &frame, "std::string", enabled)?;
        Ok(Value::Str(out))
    }
}

impl AsVector {
    pub fn read(
        &self,
        chunk: &Chunk,
        cursor: &mut Cursor,
        ctx: &mut ReadContext,
        header: bool,
    ) -> Result<Value> {
        let enabled = self.header && header;
        let frame = open_frame(chunk, cursor, ctx, enabled)?;
        if frame.is_memberwise {
            return Err(Error::Unsupported {
                feature: "memberwise serialization of std::vector".into(),
                path: ctx.file.file_path().to_string(),
            });
        }
        let n = cursor.field::<u32>(chunk)? as usize;
        let out = self.values.read_many(n, chunk, cursor, ctx, true)?;
        close_frame(chunk, cursor, ctx, &frame, "std::vector", enabled)?;
        Ok(out)
    }
}

impl AsSet {
    pub fn read(
        &self,
        chunk: &Chunk,
        cursor: &mut Cursor,
        ctx: &mut ReadContext,
        header: bool,
    ) -> Result<Value> {
        let enabled = self.header && header;
        let frame = open_frame(chunk, cursor, ctx, enabled)?;
        if frame.is_memberwise {
            return Err(Error::Unsupported {
                feature: "memberwise serialization of std::set".into(),
                path: ctx.file.file_path().to_string(),
            });
        }
        let n = cursor.field::<u32>(chunk)? as usize;
        let out = self.keys.read_many(n, chunk, cursor, ctx, true)?;
        close_frame(chunk, cursor, ctx, &frame, "std::set", enabled)?;
        Ok(out)
    }
}

impl AsMap {
    /// Maps are only readable in their memberwise layout: a six-byte inner
    /// header, the count, then all keys (behind an optional six-byte
    /// sub-header), then all values likewise.
    pub fn read(
        &self,
        chunk: &Chunk,
        cursor: &mut Cursor,
        ctx: &mut ReadContext,
        header: bool,
    ) -> Result<Value> {
        let enabled = self.header && header;
        let frame = open_frame(chunk, cursor, ctx, enabled)?;
        if enabled {
            cursor.skip(6);
        }

        if !frame.is_memberwise {
            return Err(Error::Unsupported {
                feature: "objectwise serialization of std::map".into(),
                path: ctx.file.file_path().to_string(),
            });
        }

        let n = cursor.field::<u32>(chunk)? as usize;

        if self.keys.has_header() && header {
            cursor.skip(6);
        }
        let keys = self.keys.read_many(n, chunk, cursor, ctx, false)?;
        if self.values.has_header() && header {
            cursor.skip(6);
        }
        let values = self.values.read_many(n, chunk, cursor, ctx, false)?;

        let pairs = zip_map_entries(keys, values, n);
        close_frame(chunk, cursor, ctx, &frame, "std::map", enabled)?;
        Ok(Value::Map(pairs))
    }
}

fn zip_map_entries(keys: Value, values: Value, n: usize) -> Vec<(Value, Value)> {
    fn explode(value: Value, n: usize) -> Vec<Value> {
        match value {
            Value::List(items) => items,
            Value::Array(arr) => (0..n)
                .map(|i| match arr.index_value(i) {
                    Some(v) => Value::I64(v),
                    None => match &arr {
                        crate::primitive::PrimitiveArray::F32(v) => Value::F32(v[i]),
                        crate::primitive::PrimitiveArray::F64(v) => Value::F64(v[i]),
                        _ => Value::None,
                    },
                })
                .collect(),
            other => vec![other],
        }
    }
    explode(keys, n)
        .into_iter()
        .zip(explode(values, n))
        .collect()
}

impl AsArray {
    pub fn read(
        &self,
        chunk: &Chunk,
        cursor: &mut Cursor,
        ctx: &mut ReadContext,
        header: bool,
    ) -> Result<Value> {
        if self.header && header {
            let frame = open_frame(chunk, cursor, ctx, true)?;
            if frame.is_memberwise {
                return Err(Error::Unsupported {
                    feature: "memberwise serialization of arrays".into(),
                    path: ctx.file.file_path().to_string(),
                });
            }
            let num_bytes = frame.num_bytes.ok_or_else(|| {
                Error::deserialization(
                    "array with header but no byte count",
                    "AsArray",
                    cursor.index(),
                    ctx.file.file_path().to_string(),
                )
            })? as i64;

            let out = match &self.values {
                Item::Dtype(kind) => {
                    let consumed = cursor.displacement_from(&frame.start);
                    let remaining = (num_bytes - consumed).max(0) as usize;
                    let n = remaining / kind.byte_size();
                    Value::Array(cursor.array(chunk, n, *kind)?)
                }
                values => {
                    let mut out = Vec::new();
                    while cursor.displacement_from(&frame.start) < num_bytes {
                        match values {
                            Item::Container(inner) => {
                                out.push(inner.read(chunk, cursor, ctx, true)?)
                            }
                            Item::Class(classname) => {
                                out.push(read_class(classname, chunk, cursor, ctx)?)
                            }
                            Item::Dtype(_) => unreachable!(),
                        }
                    }
                    Value::List(out)
                }
            };
            close_frame(chunk, cursor, ctx, &frame, "array", true)?;
            Ok(out)
        } else {
            if self.speedbump {
                cursor.skip(1);
            }
            // without a header the array runs to the end of the chunk
            match &self.values {
                Item::Dtype(kind) => {
                    let remaining = (chunk.stop() - cursor.index()) as usize;
                    let n = remaining / kind.byte_size();
                    Ok(Value::Array(cursor.array(chunk, n, *kind)?))
                }
                values => {
                    let mut out = Vec::new();
                    while cursor.index() < chunk.stop() {
                        match values {
                            Item::Container(inner) => {
                                out.push(inner.read(chunk, cursor, ctx, true)?)
                            }
                            Item::Class(classname) => {
                                out.push(read_class(classname, chunk, cursor, ctx)?)
                            }
                            Item::Dtype(_) => unreachable!(),
                        }
                    }
                    Ok(Value::List(out))
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// typename parsing

fn primitive_named(name: &str) -> Option<NumKind> {
    Some(match name {
        "bool" => NumKind::Bool,
        "char" | "int8_t" => NumKind::I8,
        "unsigned char" | "uint8_t" => NumKind::U8,
        "short" | "int16_t" => NumKind::I16,
        "unsigned short" | "uint16_t" => NumKind::U16,
        "int" | "int32_t" => NumKind::I32,
        "unsigned int" | "uint32_t" => NumKind::U32,
        "long" | "long long" | "int64_t" => NumKind::I64,
        "unsigned long" | "unsigned long long" | "uint64_t" => NumKind::U64,
        "float" => NumKind::F32,
        "double" => NumKind::F64,
        _ => return None,
    })
}

struct TypenameParser<'a> {
    text: &'a str,
    pos: usize,
    path: &'a str,
}

impl<'a> TypenameParser<'a> {
    fn error(&self, reason: impl Into<String>) -> Error {
        Error::Format {
            reason: format!("cannot parse typename {:?}: {}", self.text, reason.into()),
            path: self.path.to_string(),
        }
    }

    fn skip_spaces(&mut self) {
        while self.text[self.pos..].starts_with(' ') {
            self.pos += 1;
        }
    }

    fn peek(&self) -> Option<char> {
        self.text[self.pos..].chars().next()
    }

    /// An identifier possibly containing `::` and internal spaces
    /// ("unsigned long long").
    fn identifier(&mut self) -> Result<String> {
        self.skip_spaces();
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' || c == ':' || c == ' ' {
                self.pos += 1;
            } else {
                break;
            }
        }
        let name = self.text[start..self.pos].trim();
        if name.is_empty() {
            return Err(self.error("expected a type name"));
        }
        Ok(name.split_whitespace().collect::<Vec<_>>().join(" "))
    }

    fn expect(&mut self, c: char) -> Result<()> {
        self.skip_spaces();
        if self.peek() == Some(c) {
            self.pos += c.len_utf8();
            Ok(())
        } else {
            Err(self.error(format!("expected {:?}", c)))
        }
    }

    fn parse_type(&mut self) -> Result<Item> {
        let mut name = self.identifier()?;
        if let Some(stripped) = name.strip_prefix("std::") {
            name = stripped.to_string();
        }

        self.skip_spaces();
        let has_args = self.peek() == Some('<');

        match name.as_str() {
            "vector" => {
                let values = self.template_args(Some(1))?.pop().expect("one argument");
                Ok(Item::Container(Box::new(AsContainer::Vector(AsVector {
                    header: true,
                    values,
                }))))
            }
            "set" => {
                let keys = self.template_args(Some(1))?.pop().expect("one argument");
                Ok(Item::Container(Box::new(AsContainer::Set(AsSet {
                    header: true,
                    keys,
                }))))
            }
            "map" => {
                let mut args = self.template_args(Some(2))?;
                let values = args.pop().expect("two arguments");
                let keys = args.pop().expect("two arguments");
                Ok(Item::Container(Box::new(AsContainer::Map(AsMap {
                    header: true,
                    keys,
                    values,
                }))))
            }
            // known STL shapes this reader declines to guess at; they parse
            // but fail conspicuously when read
            "list" | "deque" | "multimap" | "multiset" | "bitset" | "unordered_map"
            | "unordered_set" => {
                if has_args {
                    self.skip_template_args()?;
                }
                Ok(Item::Container(Box::new(AsContainer::Fixme(format!(
                    "std::{} is not implemented",
                    name
                )))))
            }
            "string" | "TString" => {
                if has_args {
                    return Err(self.error(format!("{} does not take template arguments", name)));
                }
                Ok(Item::Container(Box::new(AsContainer::String(
                    AsString::new(false),
                ))))
            }
            _ => {
                if let Some(kind) = primitive_named(&name) {
                    if has_args {
                        return Err(
                            self.error(format!("{} does not take template arguments", name))
                        );
                    }
                    return Ok(Item::Dtype(kind));
                }
                if has_args {
                    // an unrecognized template: keep the full spelling as a
                    // class name for the registry to resolve
                    let depth_start = self.pos;
                    let mut depth = 0;
                    for c in self.text[self.pos..].chars() {
                        self.pos += c.len_utf8();
                        match c {
                            '<' => depth += 1,
                            '>' => {
                                depth -= 1;
                                if depth == 0 {
                                    break;
                                }
                            }
                            _ => {}
                        }
                    }
                    if depth != 0 {
                        return Err(self.error("unbalanced angle brackets"));
                    }
                    name.push_str(&self.text[depth_start..self.pos]);
                }
                Ok(Item::Class(name))
            }
        }
    }

    fn template_args(&mut self, expected: Option<usize>) -> Result<Vec<Item>> {
        self.expect('<')?;
        let mut args = vec![self.parse_type()?];
        loop {
            self.skip_spaces();
            match self.peek() {
                Some(',') => {
                    self.pos += 1;
                    args.push(self.parse_type()?);
                }
                Some('>') => {
                    self.pos += 1;
                    break;
                }
                _ => return Err(self.error("expected ',' or '>'")),
            }
        }
        if let Some(expected) = expected {
            if args.len() != expected {
                return Err(self.error(format!(
                    "expected {} template arguments, found {}",
                    expected,
                    args.len()
                )));
            }
        }
        Ok(args)
    }

    /// Consume a balanced `<…>` group without interpreting it.
    fn skip_template_args(&mut self) -> Result<()> {
        self.expect('<')?;
        let mut depth = 1;
        for c in self.text[self.pos..].chars() {
            self.pos += c.len_utf8();
            match c {
                '<' => depth += 1,
                '>' => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(());
                    }
                }
                _ => {}
            }
        }
        Err(self.error("unbalanced angle brackets"))
    }
}

/// Parse a (possibly ROOT-typedef'ed) C++ typename into a container
/// description.
pub fn parse_typename(typename: &str, file_path: &str) -> Result<Item> {
    let canonical = canonical_typename(typename);
    let mut parser = TypenameParser {
        text: &canonical,
        pos: 0,
        path: file_path,
    };
    let item = parser.parse_type()?;
    parser.skip_spaces();
    if parser.pos != parser.text.len() {
        return Err(parser.error("trailing characters"));
    }
    Ok(item)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vector_of(values: Item) -> Item {
        Item::Container(Box::new(AsContainer::Vector(AsVector {
            header: true,
            values,
        })))
    }

    fn set_of(keys: Item) -> Item {
        Item::Container(Box::new(AsContainer::Set(AsSet { header: true, keys })))
    }

    #[test]
    fn nested_map_of_vector_and_set() {
        let parsed = parse_typename("map<vector<int>, set<set<float>>>", "test").unwrap();
        let expected = Item::Container(Box::new(AsContainer::Map(AsMap {
            header: true,
            keys: vector_of(Item::Dtype(NumKind::I32)),
            values: set_of(set_of(Item::Dtype(NumKind::F32))),
        })));
        assert_eq!(parsed, expected);
    }

    #[test]
    fn whitespace_is_insignificant() {
        let tight = parse_typename("vector<vector<string>>", "test").unwrap();
        let loose = parse_typename("vector<  vector< string > >", "test").unwrap();
        assert_eq!(tight, loose);
        assert_eq!(
            tight,
            vector_of(Item::Container(Box::new(AsContainer::Vector(AsVector {
                header: true,
                values: Item::Container(Box::new(AsContainer::String(AsString::new(false)))),
            }))))
        );
    }

    #[test]
    fn root_typedefs_canonicalize_before_parsing() {
        assert_eq!(
            parse_typename("vector<Int_t>", "test").unwrap(),
            vector_of(Item::Dtype(NumKind::I32))
        );
        assert_eq!(
            parse_typename("std::vector<Long64_t>", "test").unwrap(),
            vector_of(Item::Dtype(NumKind::I64))
        );
    }

    #[test]
    fn string_with_template_arguments_is_an_error() {
        assert!(parse_typename("map<string<int>>", "test").is_err());
        assert!(parse_typename("int<float>", "test").is_err());
        assert!(parse_typename("vector<int", "test").is_err());
        assert!(parse_typename("vector<int,float>", "test").is_err());
    }

    #[test]
    fn declined_stl_shapes_parse_but_fail_on_read() {
        let parsed = parse_typename("bitset<16>", "test").unwrap();
        let container = match &parsed {
            Item::Container(container) => container.as_ref().clone(),
            other => panic!("unexpected {:?}", other),
        };
        assert!(matches!(container, AsContainer::Fixme(_)));

        let file = crate::file::RootFile::for_tests();
        let mut ctx = ReadContext::new(&file);
        let chunk = Chunk::wrap("test".into(), vec![0; 8]);
        let mut cursor = Cursor::new(0);
        assert!(container
            .read(&chunk, &mut cursor, &mut ctx, true)
            .unwrap_err()
            .is_deserialization());
    }

    #[test]
    fn headerless_array_reads_past_its_speedbump() {
        let file = crate::file::RootFile::for_tests();
        let mut ctx = ReadContext::new(&file);
        let mut data = vec![0xAAu8]; // speedbump
        for v in [1.0f64, 2.0] {
            data.extend_from_slice(&v.to_be_bytes());
        }
        let chunk = Chunk::wrap("test".into(), data);
        let mut cursor = Cursor::new(0);

        let desc = AsArray {
            header: false,
            speedbump: true,
            values: Item::Dtype(NumKind::F64),
        };
        assert_eq!(
            desc.read(&chunk, &mut cursor, &mut ctx, true).unwrap(),
            Value::Array(crate::primitive::PrimitiveArray::F64(vec![1.0, 2.0]))
        );
    }

    #[test]
    fn null_pointer_container_reads_as_none() {
        let file = crate::file::RootFile::for_tests();
        let mut ctx = ReadContext::new(&file);
        let chunk = Chunk::wrap("test".into(), 0u32.to_be_bytes().to_vec());
        let mut cursor = Cursor::new(0);
        assert_eq!(
            AsContainer::Pointer
                .read(&chunk, &mut cursor, &mut ctx, true)
                .unwrap(),
            Value::None
        );
    }

    #[test]
    fn unknown_templates_stay_class_names() {
        assert_eq!(
            parse_typename("TVectorT<float>", "test").unwrap(),
            Item::Class("TVectorT<float>".into())
        );
        assert_eq!(
            parse_typename("TNamed", "test").unwrap(),
            Item::Class("TNamed".into())
        );
    }

    #[test]
    fn four_byte_string_reads_unconditionally() {
        let file = crate::file::RootFile::for_tests();
        let mut ctx = ReadContext::new(&file);
        let mut data = 3u32.to_be_bytes().to_vec();
        data.extend_from_slice(b"abc");
        let chunk = Chunk::wrap("test".into(), data);
        let mut cursor = Cursor::new(0);

        let desc = AsString {
            header: false,
            length_bytes: LengthBytes::Four,
        };
        assert_eq!(
            desc.read(&chunk, &mut cursor, &mut ctx, true).unwrap(),
            Value::Str("abc".into())
        );
    }

    #[test]
    fn headerless_vector_of_primitives() {
        let file = crate::file::RootFile::for_tests();
        let mut ctx = ReadContext::new(&file);
        let mut data = 3u32.to_be_bytes().to_vec();
        for v in [1i16, 2, 3] {
            data.extend_from_slice(&v.to_be_bytes());
        }
        let chunk = Chunk::wrap("test".into(), data);
        let mut cursor = Cursor::new(0);

        let desc = AsVector {
            header: false,
            values: Item::Dtype(NumKind::I16),
        };
        assert_eq!(
            desc.read(&chunk, &mut cursor, &mut ctx, true).unwrap(),
            Value::Array(crate::primitive::PrimitiveArray::I16(vec![1, 2, 3]))
        );
    }

    #[test]
    fn memberwise_vector_is_refused() {
        use crate::deserialization::{K_BYTE_COUNT_MASK, K_MEMBERWISE_MASK};
        let file = crate::file::RootFile::for_tests();
        let mut ctx = ReadContext::new(&file);
        let mut data = Vec::new();
        data.extend_from_slice(&(K_BYTE_COUNT_MASK | 6).to_be_bytes());
        data.extend_from_slice(&(1u16 | K_MEMBERWISE_MASK).to_be_bytes());
        data.extend_from_slice(&0u32.to_be_bytes());
        let chunk = Chunk::wrap("test".into(), data);
        let mut cursor = Cursor::new(0);

        let desc = AsVector {
            header: true,
            values: Item::Dtype(NumKind::I32),
        };
        let err = desc.read(&chunk, &mut cursor, &mut ctx, true).unwrap_err();
        assert!(matches!(err, Error::Unsupported { .. }));
    }
}
