//! Hand-written readers for the smallest bootstrap classes.

use binrw::BinRead;

use crate::chunk::{Chunk, Cursor};
use crate::deserialization::{skip_tobject, K_BYTE_COUNT_VMASK, ObjectBits};
use crate::error::Result;
use crate::model::{begin_object, finish_object, AnyObject, BuiltinClass, ReadContext, Value};

fn read_tobject(chunk: &Chunk, cursor: &mut Cursor, _ctx: &mut ReadContext) -> Result<Value> {
    let version = cursor.field::<u16>(chunk)?;
    if version & K_BYTE_COUNT_VMASK != 0 {
        cursor.skip(4);
    }
    let unique_id = cursor.field::<u32>(chunk)?;
    let raw_bits = cursor.field::<u32>(chunk)?;
    let bits = ObjectBits::from_bits_truncate(raw_bits) | ObjectBits::IS_ON_HEAP;
    if bits.contains(ObjectBits::IS_REFERENCED) {
        cursor.skip(2);
    }

    let mut obj = AnyObject::new("TObject", version as i32);
    obj.set("fUniqueID", Value::U32(unique_id));
    obj.set("fBits", Value::U32(bits.bits()));
    Ok(obj.into_value())
}

/// TString members are bare length-prefixed strings, no header.
fn read_tstring(chunk: &Chunk, cursor: &mut Cursor, _ctx: &mut ReadContext) -> Result<Value> {
    Ok(Value::Str(cursor.string(chunk)?))
}

fn read_tnamed(chunk: &Chunk, cursor: &mut Cursor, ctx: &mut ReadContext) -> Result<Value> {
    let header = begin_object(chunk, cursor, ctx, Some(1))?;
    let mut obj = AnyObject::new("TNamed", header.instance_version);

    let base = read_tobject(chunk, cursor, ctx)?;
    if let Value::Object(base) = base {
        obj.bases.push(*base);
    }
    obj.set("fName", Value::Str(cursor.string(chunk)?));
    obj.set("fTitle", Value::Str(cursor.string(chunk)?));

    finish_object(chunk, cursor, ctx, &header, "TNamed")?;
    Ok(obj.into_value())
}

fn read_tobjstring(chunk: &Chunk, cursor: &mut Cursor, ctx: &mut ReadContext) -> Result<Value> {
    let header = begin_object(chunk, cursor, ctx, Some(1))?;
    skip_tobject(chunk, cursor)?;
    let mut obj = AnyObject::new("TObjString", header.instance_version);
    obj.set("fString", Value::Str(cursor.string(chunk)?));
    finish_object(chunk, cursor, ctx, &header, "TObjString")?;
    Ok(obj.into_value())
}

#[derive(BinRead)]
#[br(big)]
struct AttLine {
    color: i16,
    style: i16,
    width: i16,
}

fn read_tattline(chunk: &Chunk, cursor: &mut Cursor, ctx: &mut ReadContext) -> Result<Value> {
    let header = begin_object(chunk, cursor, ctx, Some(2))?;
    let fields = cursor.field::<AttLine>(chunk)?;
    let mut obj = AnyObject::new("TAttLine", header.instance_version);
    obj.set("fLineColor", Value::I16(fields.color));
    obj.set("fLineStyle", Value::I16(fields.style));
    obj.set("fLineWidth", Value::I16(fields.width));
    finish_object(chunk, cursor, ctx, &header, "TAttLine")?;
    Ok(obj.into_value())
}

#[derive(BinRead)]
#[br(big)]
struct AttFill {
    color: i16,
    style: i16,
}

fn read_tattfill(chunk: &Chunk, cursor: &mut Cursor, ctx: &mut ReadContext) -> Result<Value> {
    let header = begin_object(chunk, cursor, ctx, Some(2))?;
    let fields = cursor.field::<AttFill>(chunk)?;
    let mut obj = AnyObject::new("TAttFill", header.instance_version);
    obj.set("fFillColor", Value::I16(fields.color));
    obj.set("fFillStyle", Value::I16(fields.style));
    finish_object(chunk, cursor, ctx, &header, "TAttFill")?;
    Ok(obj.into_value())
}

#[derive(BinRead)]
#[br(big)]
struct AttMarker {
    color: i16,
    style: i16,
    size: f32,
}

fn read_tattmarker(chunk: &Chunk, cursor: &mut Cursor, ctx: &mut ReadContext) -> Result<Value> {
    let header = begin_object(chunk, cursor, ctx, Some(2))?;
    let fields = cursor.field::<AttMarker>(chunk)?;
    let mut obj = AnyObject::new("TAttMarker", header.instance_version);
    obj.set("fMarkerColor", Value::I16(fields.color));
    obj.set("fMarkerStyle", Value::I16(fields.style));
    obj.set("fMarkerSize", Value::F32(fields.size));
    finish_object(chunk, cursor, ctx, &header, "TAttMarker")?;
    Ok(obj.into_value())
}

pub static TOBJECT: BuiltinClass = BuiltinClass {
    classname: "TObject",
    read: read_tobject,
};
pub static TSTRING: BuiltinClass = BuiltinClass {
    classname: "TString",
    read: read_tstring,
};
pub static TNAMED: BuiltinClass = BuiltinClass {
    classname: "TNamed",
    read: read_tnamed,
};
pub static TOBJSTRING: BuiltinClass = BuiltinClass {
    classname: "TObjString",
    read: read_tobjstring,
};
pub static TATTLINE: BuiltinClass = BuiltinClass {
    classname: "TAttLine",
    read: read_tattline,
};
pub static TATTFILL: BuiltinClass = BuiltinClass {
    classname: "TAttFill",
    read: read_tattfill,
};
pub static TATTMARKER: BuiltinClass = BuiltinClass {
    classname: "TAttMarker",
    read: read_tattmarker,
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deserialization::K_BYTE_COUNT_MASK;
    use crate::file::RootFile;

    fn push_string(out: &mut Vec<u8>, s: &str) {
        out.push(s.len() as u8);
        out.extend_from_slice(s.as_bytes());
    }

    /// A serialized TNamed: header, TObject preamble, name, title.
    pub(crate) fn tnamed_bytes(name: &str, title: &str) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&1u16.to_be_bytes()); // TObject version, no count
        body.extend_from_slice(&0u32.to_be_bytes()); // fUniqueID
        body.extend_from_slice(&0u32.to_be_bytes()); // fBits
        push_string(&mut body, name);
        push_string(&mut body, title);

        let mut out = Vec::new();
        out.extend_from_slice(&(K_BYTE_COUNT_MASK | (body.len() as u32 + 2)).to_be_bytes());
        out.extend_from_slice(&1u16.to_be_bytes()); // TNamed version
        out.extend_from_slice(&body);
        out
    }

    #[test]
    fn tnamed_reads_name_and_title() {
        let file = RootFile::for_tests();
        let mut ctx = ReadContext::new(&file);
        let chunk = Chunk::wrap("test".into(), tnamed_bytes("events", "physics"));
        let mut cursor = Cursor::new(0);

        let value = read_tnamed(&chunk, &mut cursor, &mut ctx).unwrap();
        let obj = value.as_object().unwrap();
        assert_eq!(obj.name(), "events");
        assert_eq!(obj.title(), "physics");
        assert_eq!(cursor.index(), chunk.stop());
    }

    #[test]
    fn short_tnamed_byte_count_fails_the_check() {
        let file = RootFile::for_tests();
        let mut ctx = ReadContext::new(&file);
        let mut bytes = tnamed_bytes("x", "y");
        // enlarge the declared byte count without adding data
        let declared = u32::from_be_bytes(bytes[..4].try_into().unwrap());
        bytes.extend_from_slice(&[0, 0, 0, 0]);
        bytes[..4].copy_from_slice(&(declared + 4).to_be_bytes());
        let chunk = Chunk::wrap("test".into(), bytes);
        let mut cursor = Cursor::new(0);

        assert!(read_tnamed(&chunk, &mut cursor, &mut ctx)
            .unwrap_err()
            .is_deserialization());
    }
}
