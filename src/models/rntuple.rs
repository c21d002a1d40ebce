//! The ROOT::Experimental::RNTuple anchor. Reading the columnar payload it
//! points at is someone else's job; the anchor itself is a plain record.

use binrw::BinRead;

use crate::chunk::{Chunk, Cursor};
use crate::error::{Error, Result};
use crate::model::{begin_object, finish_object, AnyObject, BuiltinClass, ReadContext, Value};

#[derive(BinRead)]
#[br(big)]
struct Anchor {
    version: u32,
    size: u32,
    seek_header: u64,
    nbytes_header: u32,
    len_header: u32,
    seek_footer: u64,
    nbytes_footer: u32,
    len_footer: u32,
    reserved: u64,
}

fn read_rntuple(chunk: &Chunk, cursor: &mut Cursor, ctx: &mut ReadContext) -> Result<Value> {
    let header = begin_object(chunk, cursor, ctx, Some(1))?;
    if header.is_memberwise {
        return Err(Error::Unsupported {
            feature: "memberwise serialization of ROOT::Experimental::RNTuple".into(),
            path: ctx.file.file_path().to_string(),
        });
    }
    cursor.skip(4);
    let anchor = cursor.field::<Anchor>(chunk)?;

    let mut obj = AnyObject::new("ROOT::Experimental::RNTuple", header.instance_version);
    obj.set("fVersion", Value::U32(anchor.version));
    obj.set("fSize", Value::U32(anchor.size));
    obj.set("fSeekHeader", Value::U64(anchor.seek_header));
    obj.set("fNBytesHeader", Value::U32(anchor.nbytes_header));
    obj.set("fLenHeader", Value::U32(anchor.len_header));
    obj.set("fSeekFooter", Value::U64(anchor.seek_footer));
    obj.set("fNBytesFooter", Value::U32(anchor.nbytes_footer));
    obj.set("fLenFooter", Value::U32(anchor.len_footer));
    obj.set("fReserved", Value::U64(anchor.reserved));

    finish_object(chunk, cursor, ctx, &header, "ROOT::Experimental::RNTuple")?;
    Ok(obj.into_value())
}

pub static RNTUPLE: BuiltinClass = BuiltinClass {
    classname: "ROOT::Experimental::RNTuple",
    read: read_rntuple,
};
