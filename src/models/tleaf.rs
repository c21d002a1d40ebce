//! Readers for the TLeaf family: the common TLeaf part plus one thin
//! subclass per primitive type and TLeafElement for streamer-typed leaves.

use binrw::BinRead;

use crate::chunk::{Chunk, Cursor};
use crate::deserialization::read_object_any;
use crate::error::Result;
use crate::model::{
    begin_object, finish_object, read_class, AnyObject, BuiltinClass, ReadContext, Value,
};

#[derive(BinRead)]
#[br(big)]
struct LeafFixed {
    len: i32,
    len_type: i32,
    offset: i32,
    #[br(map = |b: u8| b != 0)]
    is_range: bool,
    #[br(map = |b: u8| b != 0)]
    is_unsigned: bool,
}

/// The TLeaf superclass part: TNamed, counts and flags, and the optional
/// pointer to the leaf that counts this one.
fn read_tleaf_base(chunk: &Chunk, cursor: &mut Cursor, ctx: &mut ReadContext) -> Result<Value> {
    let header = begin_object(chunk, cursor, ctx, Some(2))?;
    let mut obj = AnyObject::new("TLeaf", header.instance_version);
    if let Value::Object(base) = read_class("TNamed", chunk, cursor, ctx)? {
        obj.bases.push(*base);
    }
    let fixed = cursor.field::<LeafFixed>(chunk)?;
    obj.set("fLen", Value::I32(fixed.len));
    obj.set("fLenType", Value::I32(fixed.len_type));
    obj.set("fOffset", Value::I32(fixed.offset));
    obj.set("fIsRange", Value::Bool(fixed.is_range));
    obj.set("fIsUnsigned", Value::Bool(fixed.is_unsigned));
    obj.set("fLeafCount", read_object_any(chunk, cursor, ctx)?);
    finish_object(chunk, cursor, ctx, &header, "TLeaf")?;
    Ok(obj.into_value())
}

macro_rules! leaf_models {
    ($(($name:ident, $classname:literal, $read_minmax:expr)),* $(,)?) => {
        $(
            fn $name(chunk: &Chunk, cursor: &mut Cursor, ctx: &mut ReadContext) -> Result<Value> {
                let header = begin_object(chunk, cursor, ctx, Some(1))?;
                let mut obj = AnyObject::new($classname, header.instance_version);
                if let Value::Object(base) = read_tleaf_base(chunk, cursor, ctx)? {
                    obj.bases.push(*base);
                }
                let read_minmax: fn(&Chunk, &mut Cursor) -> Result<(Value, Value)> = $read_minmax;
                let (minimum, maximum) = read_minmax(chunk, cursor)?;
                obj.set("fMinimum", minimum);
                obj.set("fMaximum", maximum);
                finish_object(chunk, cursor, ctx, &header, $classname)?;
                Ok(obj.into_value())
            }
        )*
    };
}

leaf_models! {
    (read_tleaf_o, "TLeafO", |chunk, cursor| {
        Ok((
            Value::Bool(cursor.field::<u8>(chunk)? != 0),
            Value::Bool(cursor.field::<u8>(chunk)? != 0),
        ))
    }),
    (read_tleaf_b, "TLeafB", |chunk, cursor| {
        Ok((
            Value::I8(cursor.field::<i8>(chunk)?),
            Value::I8(cursor.field::<i8>(chunk)?),
        ))
    }),
    (read_tleaf_s, "TLeafS", |chunk, cursor| {
        Ok((
            Value::I16(cursor.field::<i16>(chunk)?),
            Value::I16(cursor.field::<i16>(chunk)?),
        ))
    }),
    (read_tleaf_i, "TLeafI", |chunk, cursor| {
        Ok((
            Value::I32(cursor.field::<i32>(chunk)?),
            Value::I32(cursor.field::<i32>(chunk)?),
        ))
    }),
    (read_tleaf_l, "TLeafL", |chunk, cursor| {
        Ok((
            Value::I64(cursor.field::<i64>(chunk)?),
            Value::I64(cursor.field::<i64>(chunk)?),
        ))
    }),
    (read_tleaf_f, "TLeafF", |chunk, cursor| {
        Ok((
            Value::F32(cursor.field::<f32>(chunk)?),
            Value::F32(cursor.field::<f32>(chunk)?),
        ))
    }),
    (read_tleaf_d, "TLeafD", |chunk, cursor| {
        Ok((
            Value::F64(cursor.field::<f64>(chunk)?),
            Value::F64(cursor.field::<f64>(chunk)?),
        ))
    }),
    (read_tleaf_c, "TLeafC", |chunk, cursor| {
        Ok((
            Value::I32(cursor.field::<i32>(chunk)?),
            Value::I32(cursor.field::<i32>(chunk)?),
        ))
    }),
}

fn read_tleaf_element(chunk: &Chunk, cursor: &mut Cursor, ctx: &mut ReadContext) -> Result<Value> {
    let header = begin_object(chunk, cursor, ctx, Some(1))?;
    let mut obj = AnyObject::new("TLeafElement", header.instance_version);
    if let Value::Object(base) = read_tleaf_base(chunk, cursor, ctx)? {
        obj.bases.push(*base);
    }
    obj.set("fID", Value::I32(cursor.field::<i32>(chunk)?));
    obj.set("fType", Value::I32(cursor.field::<i32>(chunk)?));
    finish_object(chunk, cursor, ctx, &header, "TLeafElement")?;
    Ok(obj.into_value())
}

pub static TLEAF: BuiltinClass = BuiltinClass {
    classname: "TLeaf",
    read: read_tleaf_base,
};
pub static TLEAF_O: BuiltinClass = BuiltinClass {
    classname: "TLeafO",
    read: read_tleaf_o,
};
pub static TLEAF_B: BuiltinClass = BuiltinClass {
    classname: "TLeafB",
    read: read_tleaf_b,
};
pub static TLEAF_S: BuiltinClass = BuiltinClass {
    classname: "TLeafS",
    read: read_tleaf_s,
};
pub static TLEAF_I: BuiltinClass = BuiltinClass {
    classname: "TLeafI",
    read: read_tleaf_i,
};
pub static TLEAF_L: BuiltinClass = BuiltinClass {
    classname: "TLeafL",
    read: read_tleaf_l,
};
pub static TLEAF_F: BuiltinClass = BuiltinClass {
    classname: "TLeafF",
    read: read_tleaf_f,
};
pub static TLEAF_D: BuiltinClass = BuiltinClass {
    classname: "TLeafD",
    read: read_tleaf_d,
};
pub static TLEAF_C: BuiltinClass = BuiltinClass {
    classname: "TLeafC",
    read: read_tleaf_c,
};
pub static TLEAF_ELEMENT: BuiltinClass = BuiltinClass {
    classname: "TLeafElement",
    read: read_tleaf_element,
};
