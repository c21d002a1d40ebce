//! Low-level serialization conventions shared by every object: byte-count
//! and version headers, the TObject preamble, and the pointer-any
//! back-reference mechanism.

use crate::chunk::{Chunk, Cursor};
use crate::error::{Error, Result};
use crate::model::{read_class, ReadContext, RefItem, Value};

/// Set in a byte count to mark it as a byte count rather than a tag.
pub const K_BYTE_COUNT_MASK: u32 = 0x4000_0000;
/// Version flag indicating the TObject preamble carries a byte count.
pub const K_BYTE_COUNT_VMASK: u16 = 0x4000;
/// Version bit marking memberwise serialization.
pub const K_MEMBERWISE_MASK: u16 = 0x4000;
/// Set in a pointer-any tag that refers to a class rather than an object.
pub const K_CLASS_MASK: u32 = 0x8000_0000;
/// Pointer-any tag announcing a class name not seen before in this buffer.
pub const K_NEW_CLASS_TAG: u32 = 0xFFFF_FFFF;
/// Offset between written back-reference keys and buffer displacements.
pub const K_MAP_OFFSET: i64 = 2;

bitflags::bitflags! {
    /// TObject status bits that matter on the read path.
    pub struct ObjectBits: u32 {
        const IS_REFERENCED = 1 << 4;
        const IS_ON_HEAP = 0x0100_0000;
    }
}

/// Read the `(num_bytes, version)` header in front of most objects.
///
/// When the first four bytes carry [`K_BYTE_COUNT_MASK`], they are a byte
/// count (exclusive of themselves, hence the +4) followed by a two-byte
/// version. Otherwise there is no byte count and the first two bytes are the
/// version. The memberwise bit is masked out of the version and returned
/// separately.
pub fn numbytes_version(
    chunk: &Chunk,
    cursor: &mut Cursor,
    _ctx: &ReadContext,
) -> Result<(Option<u32>, i32, bool)> {
    let start = *cursor;
    let first = cursor.field::<u32>(chunk)?;

    if first & K_BYTE_COUNT_MASK != 0 && first != K_NEW_CLASS_TAG {
        let num_bytes = (first & !K_BYTE_COUNT_MASK) + 4;
        let raw_version = cursor.field::<u16>(chunk)?;
        let is_memberwise = raw_version & K_MEMBERWISE_MASK != 0;
        let version = (raw_version & !K_MEMBERWISE_MASK) as i32;
        Ok((Some(num_bytes), version, is_memberwise))
    } else {
        *cursor = start;
        let raw_version = cursor.field::<u16>(chunk)?;
        let is_memberwise = raw_version & K_MEMBERWISE_MASK != 0;
        let version = (raw_version & !K_MEMBERWISE_MASK) as i32;
        Ok((None, version, is_memberwise))
    }
}

/// Verify that reading an object moved the cursor exactly `num_bytes` from
/// where its header began.
pub fn numbytes_check(
    chunk: &Chunk,
    start: &Cursor,
    stop: &Cursor,
    num_bytes: Option<u32>,
    classname: &str,
    ctx: &ReadContext,
) -> Result<()> {
    if let Some(num_bytes) = num_bytes {
        let observed = stop.displacement_from(start);
        if observed != num_bytes as i64 {
            return Err(Error::deserialization(
                format!(
                    "expected {} bytes but cursor moved by {} (through {})",
                    num_bytes, observed, classname
                ),
                classname,
                stop.index(),
                chunk.file_path().to_string(),
            ));
        }
    }
    let _ = ctx;
    Ok(())
}

/// Skip a TObject preamble: version (with optional byte count), unique id
/// and bits, plus the two-byte process id when the object is referenced.
pub fn skip_tobject(chunk: &Chunk, cursor: &mut Cursor) -> Result<()> {
    let version = cursor.field::<u16>(chunk)?;
    if version & K_BYTE_COUNT_VMASK != 0 {
        cursor.skip(4);
    }
    let _unique_id = cursor.field::<u32>(chunk)?;
    let bits = ObjectBits::from_bits_truncate(cursor.field::<u32>(chunk)?);
    if bits.contains(ObjectBits::IS_REFERENCED) {
        cursor.skip(2);
    }
    Ok(())
}

/// Read an object stored by pointer: either `nullptr`, a back-reference to
/// an already-read object, or a new instance (whose class may itself be new
/// or back-referenced).
///
/// Newly read classes and objects are registered in the arena under
/// `displacement + kMapOffset`, matching the keys ROOT wrote.
pub fn read_object_any(
    chunk: &Chunk,
    cursor: &mut Cursor,
    ctx: &mut ReadContext,
) -> Result<Value> {
    let beg = cursor.displacement();
    let first = cursor.field::<u32>(chunk)?;

    let (versioned, start, tag) = if first & K_BYTE_COUNT_MASK == 0 || first == K_NEW_CLASS_TAG {
        (false, 0, first)
    } else {
        let start = cursor.displacement();
        let tag = cursor.field::<u32>(chunk)?;
        (true, start, tag)
    };

    if tag & K_CLASS_MASK == 0 {
        // A reference to a previously read object (or nullptr).
        if tag == 0 {
            return Ok(Value::None);
        }
        match ctx.refs.get(&(tag as i64)) {
            Some(RefItem::Object(value)) => Ok(value.clone()),
            Some(RefItem::Class(_)) | None => {
                // An unresolvable reference: jump past the payload.
                let num_bytes = first & !K_BYTE_COUNT_MASK;
                cursor.move_to((cursor.origin() + beg + num_bytes as i64 + 4) as u64);
                Ok(Value::None)
            }
        }
    } else if tag == K_NEW_CLASS_TAG {
        let classname = cursor.classname(chunk)?;

        if versioned {
            ctx.refs
                .insert(start + K_MAP_OFFSET, RefItem::Class(classname.clone()));
        } else {
            let key = ctx.refs.len() as i64 + 1;
            ctx.refs.insert(key, RefItem::Class(classname.clone()));
        }

        let value = read_class(&classname, chunk, cursor, ctx)?;

        if versioned {
            ctx.refs
                .insert(beg + K_MAP_OFFSET, RefItem::Object(value.clone()));
        } else {
            let key = ctx.refs.len() as i64 + 1;
            ctx.refs.insert(key, RefItem::Object(value.clone()));
        }
        Ok(value)
    } else {
        // A new object of an already-seen class.
        let ref_key = (tag & !K_CLASS_MASK) as i64;
        let classname = match ctx.refs.get(&ref_key) {
            Some(RefItem::Class(name)) => name.clone(),
            _ => {
                return Err(Error::deserialization(
                    format!("invalid class reference tag {}", ref_key),
                    "read_object_any",
                    cursor.index(),
                    ctx.file.file_path().to_string(),
                ))
            }
        };

        let value = read_class(&classname, chunk, cursor, ctx)?;

        if versioned {
            ctx.refs
                .insert(beg + K_MAP_OFFSET, RefItem::Object(value.clone()));
        } else {
            let key = ctx.refs.len() as i64 + 1;
            ctx.refs.insert(key, RefItem::Object(value.clone()));
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Chunk;

    fn chunk(data: Vec<u8>) -> Chunk {
        Chunk::wrap("test".into(), data)
    }

    #[test]
    fn header_with_byte_count() {
        let mut data = Vec::new();
        data.extend_from_slice(&(K_BYTE_COUNT_MASK | 10).to_be_bytes());
        data.extend_from_slice(&3u16.to_be_bytes());
        data.extend_from_slice(&[0; 10]);
        let c = chunk(data);
        let mut cursor = Cursor::new(0);

        let file = crate::file::RootFile::for_tests();
        let ctx = ReadContext::new(&file);
        let (num_bytes, version, memberwise) =
            numbytes_version(&c, &mut cursor, &ctx).unwrap();
        assert_eq!(num_bytes, Some(14));
        assert_eq!(version, 3);
        assert!(!memberwise);
        assert_eq!(cursor.index(), 6);
    }

    #[test]
    fn header_without_byte_count_rewinds_to_version() {
        let mut data = Vec::new();
        data.extend_from_slice(&2u16.to_be_bytes());
        data.extend_from_slice(&[0; 8]);
        let c = chunk(data);
        let mut cursor = Cursor::new(0);

        let file = crate::file::RootFile::for_tests();
        let ctx = ReadContext::new(&file);
        let (num_bytes, version, _) = numbytes_version(&c, &mut cursor, &ctx).unwrap();
        assert_eq!(num_bytes, None);
        assert_eq!(version, 2);
        assert_eq!(cursor.index(), 2);
    }

    #[test]
    fn memberwise_bit_is_separated() {
        let mut data = Vec::new();
        data.extend_from_slice(&(K_BYTE_COUNT_MASK | 4).to_be_bytes());
        data.extend_from_slice(&(5u16 | K_MEMBERWISE_MASK).to_be_bytes());
        let c = chunk(data);
        let mut cursor = Cursor::new(0);

        let file = crate::file::RootFile::for_tests();
        let ctx = ReadContext::new(&file);
        let (_, version, memberwise) = numbytes_version(&c, &mut cursor, &ctx).unwrap();
        assert_eq!(version, 5);
        assert!(memberwise);
    }

    #[test]
    fn byte_count_mismatch_is_a_deserialization_error() {
        let c = chunk(vec![0; 32]);
        let start = Cursor::new(0);
        let mut stop = Cursor::new(0);
        stop.skip(7);

        let file = crate::file::RootFile::for_tests();
        let ctx = ReadContext::new(&file);
        let err =
            numbytes_check(&c, &start, &stop, Some(8), "Widget", &ctx).unwrap_err();
        assert!(err.is_deserialization());
        assert!(err.to_string().contains("Widget"));
    }

    #[test]
    fn tobject_preamble_with_reference_bit() {
        let mut data = Vec::new();
        data.extend_from_slice(&1u16.to_be_bytes()); // version without byte count
        data.extend_from_slice(&0u32.to_be_bytes()); // fUniqueID
        data.extend_from_slice(&ObjectBits::IS_REFERENCED.bits().to_be_bytes());
        data.extend_from_slice(&0u16.to_be_bytes()); // pid
        data.push(0xAA);
        let c = chunk(data);
        let mut cursor = Cursor::new(0);
        skip_tobject(&c, &mut cursor).unwrap();
        assert_eq!(cursor.index(), 12);
    }

    #[test]
    fn null_pointer_any_reads_as_none() {
        let c = chunk(0u32.to_be_bytes().to_vec());
        let mut cursor = Cursor::new(0);
        let file = crate::file::RootFile::for_tests();
        let mut ctx = ReadContext::new(&file);
        assert_eq!(
            read_object_any(&c, &mut cursor, &mut ctx).unwrap(),
            Value::None
        );
        assert_eq!(cursor.index(), 4);
    }

    #[test]
    fn pointer_any_reference_returns_registered_object() {
        let c = chunk(5u32.to_be_bytes().to_vec());
        let mut cursor = Cursor::new(0);
        let file = crate::file::RootFile::for_tests();
        let mut ctx = ReadContext::new(&file);
        ctx.refs
            .insert(5, RefItem::Object(Value::Str("cached".into())));
        assert_eq!(
            read_object_any(&c, &mut cursor, &mut ctx).unwrap(),
            Value::Str("cached".into())
        );
    }
}
