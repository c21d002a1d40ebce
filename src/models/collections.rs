//! Readers for ROOT's own collection classes: TList (and THashList),
//! TObjArray, and the TArray family.

use paste::paste;

use crate::chunk::{Chunk, Cursor};
use crate::deserialization::{read_object_any, skip_tobject};
use crate::error::Result;
use crate::model::{begin_object, finish_object, BuiltinClass, ReadContext, Value};
use crate::primitive::NumKind;

/// TList: TObject preamble, a name, a count, then count pointer-any
/// elements, each trailed by an option string.
fn read_tlist(chunk: &Chunk, cursor: &mut Cursor, ctx: &mut ReadContext) -> Result<Value> {
    let header = begin_object(chunk, cursor, ctx, Some(5))?;
    skip_tobject(chunk, cursor)?;
    let _name = cursor.string(chunk)?;
    let size = cursor.field::<i32>(chunk)?;

    let mut items = Vec::with_capacity(size.max(0) as usize);
    for _ in 0..size.max(0) {
        items.push(read_object_any(chunk, cursor, ctx)?);
        let _option = cursor.string(chunk)?;
    }

    finish_object(chunk, cursor, ctx, &header, "TList")?;
    Ok(Value::List(items))
}

/// TObjArray adds a lower bound and drops the per-element option strings.
fn read_tobjarray(chunk: &Chunk, cursor: &mut Cursor, ctx: &mut ReadContext) -> Result<Value> {
    let header = begin_object(chunk, cursor, ctx, Some(3))?;
    skip_tobject(chunk, cursor)?;
    let _name = cursor.string(chunk)?;
    let size = cursor.field::<i32>(chunk)?;
    let _lower_bound = cursor.field::<i32>(chunk)?;

    let mut items = Vec::with_capacity(size.max(0) as usize);
    for _ in 0..size.max(0) {
        items.push(read_object_any(chunk, cursor, ctx)?);
    }

    finish_object(chunk, cursor, ctx, &header, "TObjArray")?;
    Ok(Value::List(items))
}

macro_rules! tarray_models {
    ($(($suffix:ident, $kind:ident)),* $(,)?) => {
        paste! {
            $(
                /// TArray subclasses have no header: a count then the data.
                fn [<read_tarray_ $suffix:lower>](
                    chunk: &Chunk,
                    cursor: &mut Cursor,
                    _ctx: &mut ReadContext,
                ) -> Result<Value> {
                    let n = cursor.field::<i32>(chunk)?.max(0) as usize;
                    Ok(Value::Array(cursor.array(chunk, n, NumKind::$kind)?))
                }

                pub static [<TARRAY $suffix:upper>]: BuiltinClass = BuiltinClass {
                    classname: concat!("TArray", stringify!($suffix)),
                    read: [<read_tarray_ $suffix:lower>],
                };
            )*
        }
    };
}

tarray_models! {
    (C, I8),
    (S, I16),
    (I, I32),
    (L, I64),
    (L64, I64),
    (F, F32),
    (D, F64),
}

pub static TLIST: BuiltinClass = BuiltinClass {
    classname: "TList",
    read: read_tlist,
};
pub static THASHLIST: BuiltinClass = BuiltinClass {
    classname: "THashList",
    read: read_tlist,
};
pub static TOBJARRAY: BuiltinClass = BuiltinClass {
    classname: "TObjArray",
    read: read_tobjarray,
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deserialization::K_BYTE_COUNT_MASK;
    use crate::file::RootFile;
    use crate::primitive::PrimitiveArray;

    #[test]
    fn tarray_is_count_prefixed() {
        let mut data = 3i32.to_be_bytes().to_vec();
        for v in [10i32, 20, 30] {
            data.extend_from_slice(&v.to_be_bytes());
        }
        let chunk = Chunk::wrap("test".into(), data);
        let file = RootFile::for_tests();
        let mut ctx = ReadContext::new(&file);
        let mut cursor = Cursor::new(0);

        let value = read_tarray_i(&chunk, &mut cursor, &mut ctx).unwrap();
        assert_eq!(
            value.as_array().unwrap(),
            &PrimitiveArray::I32(vec![10, 20, 30])
        );
    }

    #[test]
    fn empty_tobjarray_parses() {
        let mut body = Vec::new();
        body.extend_from_slice(&1u16.to_be_bytes()); // TObject version
        body.extend_from_slice(&0u32.to_be_bytes());
        body.extend_from_slice(&0u32.to_be_bytes());
        body.push(0); // name ""
        body.extend_from_slice(&0i32.to_be_bytes()); // size
        body.extend_from_slice(&0i32.to_be_bytes()); // lower bound

        let mut data = Vec::new();
        data.extend_from_slice(&(K_BYTE_COUNT_MASK | (body.len() as u32 + 2)).to_be_bytes());
        data.extend_from_slice(&3u16.to_be_bytes());
        data.extend_from_slice(&body);

        let chunk = Chunk::wrap("test".into(), data);
        let file = RootFile::for_tests();
        let mut ctx = ReadContext::new(&file);
        let mut cursor = Cursor::new(0);
        let value = read_tobjarray(&chunk, &mut cursor, &mut ctx).unwrap();
        assert_eq!(value, Value::List(vec![]));
        assert_eq!(cursor.index(), chunk.stop());
    }
}
