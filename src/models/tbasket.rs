//! TBasket, in both of its lives: embedded inside its TBranch's buffer
//! (freshly written baskets that were never flushed to their own key) and
//! free-standing behind a TKey at `fBasketSeek[i]`.
//!
//! The reader leaves the payload as raw bytes plus normalized entry offsets;
//! interpretations turn those into arrays.

use binrw::BinRead;

use crate::chunk::{Chunk, Cursor};
use crate::compression::decompress;
use crate::error::{Error, Result};
use crate::model::{AnyObject, BuiltinClass, ReadContext, Value};
use crate::primitive::PrimitiveArray;

#[derive(BinRead)]
#[br(big)]
struct BasketKeyFields {
    nbytes: i32,
    key_version: i16,
    objlen: i32,
    #[allow(dead_code)]
    datime: u32,
    keylen: i16,
    cycle: i16,
}

#[derive(BinRead)]
#[br(big)]
struct BasketTrailer {
    version: u16,
    buffer_size: i32,
    nev_buf_size: i32,
    nev_buf: i32,
    last: i32,
}

const TRAILER_LEN: u64 = 14;

/// Parse the tail of a raw basket buffer into zero-based entry offsets.
///
/// ROOT stores `fKeylen`-shifted offsets and a sentinel in the final slot;
/// normalization subtracts the key length and forces the final offset to the
/// border so that `offsets[0] == 0` and `offsets[last] == border`.
fn normalize_offsets(raw: &[i32], keylen: i32, border: i32) -> Vec<i32> {
    let mut out: Vec<i32> = raw.iter().map(|&v| v - keylen).collect();
    if let Some(last) = out.last_mut() {
        *last = border;
    }
    out
}

fn read_tbasket(chunk: &Chunk, cursor: &mut Cursor, ctx: &mut ReadContext) -> Result<Value> {
    let start = *cursor;
    let key = cursor.field::<BasketKeyFields>(chunk)?;

    // Skip the key's class/name/title strings; the trailer sits at the end
    // of the key header, before one fHeaderOnly byte.
    cursor.move_to(start.index() + key.keylen as u64 - TRAILER_LEN - 1);
    let trailer = cursor.field::<BasketTrailer>(chunk)?;
    cursor.skip(1);

    let border = trailer.last - key.keylen as i32;
    let is_embedded = key.nbytes <= key.keylen as i32;

    let mut obj = AnyObject::new("TBasket", trailer.version as i32);
    obj.set("fNbytes", Value::I32(key.nbytes));
    obj.set("fObjlen", Value::I32(key.objlen));
    obj.set("fKeylen", Value::I16(key.keylen));
    obj.set("fCycle", Value::I16(key.cycle));
    obj.set("fVersion", Value::U16(trailer.version));
    obj.set("fBufferSize", Value::I32(trailer.buffer_size));
    obj.set("fNevBufSize", Value::I32(trailer.nev_buf_size));
    obj.set("fNevBuf", Value::I32(trailer.nev_buf));
    obj.set("fLast", Value::I32(trailer.last));
    obj.set("fKeyVersion", Value::I16(key.key_version));

    if is_embedded {
        let byte_offsets = if trailer.nev_buf_size > 8 {
            let raw = cursor.array(chunk, 2 + trailer.nev_buf as usize, crate::primitive::NumKind::I32)?;
            cursor.skip_signed(-4);
            let raw = match raw {
                PrimitiveArray::I32(values) => values,
                _ => unreachable!(),
            };
            Some(normalize_offsets(&raw[1..], key.keylen as i32, border))
        } else {
            None
        };

        // a second copy of the key follows, with nothing new in it
        cursor.skip(key.keylen as u64);
        let data = cursor.bytes(chunk, border as u64)?;

        obj.set("@data", Value::Bytes(data));
        obj.set(
            "@byte_offsets",
            match byte_offsets {
                Some(offsets) => Value::Array(PrimitiveArray::I32(offsets)),
                None => Value::None,
            },
        );
    } else {
        let compressed = (key.nbytes - key.keylen as i32) as u64;
        let uncompressed = key.objlen as u64;

        let raw = if compressed != uncompressed {
            let inflated = decompress(chunk, *cursor, compressed, uncompressed)?;
            cursor.skip(compressed);
            inflated.get(0, uncompressed)?
        } else {
            cursor.bytes(chunk, uncompressed)?
        };

        if border as u64 != uncompressed {
            let offsets_raw = PrimitiveArray::from_be_bytes(
                crate::primitive::NumKind::I32,
                &raw[border as usize..],
            )
            .map_err(|_| {
                Error::deserialization(
                    "basket entry-offset block is not a whole number of int32",
                    "TBasket",
                    cursor.index(),
                    ctx.file.file_path().to_string(),
                )
            })?;
            let offsets_raw = match offsets_raw {
                PrimitiveArray::I32(values) => values,
                _ => unreachable!(),
            };
            obj.set("@data", Value::Bytes(raw[..border as usize].to_vec()));
            obj.set(
                "@byte_offsets",
                Value::Array(PrimitiveArray::I32(normalize_offsets(
                    &offsets_raw[1..],
                    key.keylen as i32,
                    border,
                ))),
            );
        } else {
            obj.set("@data", Value::Bytes(raw));
            obj.set("@byte_offsets", Value::None);
        }
    }

    Ok(obj.into_value())
}

pub static TBASKET: BuiltinClass = BuiltinClass {
    classname: "TBasket",
    read: read_tbasket,
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::RootFile;
    use crate::primitive::NumKind;

    /// Build a free (key-framed), uncompressed basket with entry offsets.
    /// The tail is a count word, one start offset per entry (shifted by the
    /// key length, as written), and the past-the-end sentinel.
    fn free_basket(keylen: i16, entries: &[&[u8]]) -> Vec<u8> {
        let mut data = Vec::new();
        let mut tail = vec![entries.len() as i32 + 1];
        for entry in entries {
            tail.push(keylen as i32 + data.len() as i32);
            data.extend_from_slice(entry);
        }
        tail.push(-1); // sentinel, normalized to the border on read
        let border = data.len() as i32;

        let objlen = border + 4 * tail.len() as i32;
        let nbytes = keylen as i32 + objlen;
        let last = keylen as i32 + border;

        let mut out = Vec::new();
        out.extend_from_slice(&nbytes.to_be_bytes());
        out.extend_from_slice(&4i16.to_be_bytes()); // key version
        out.extend_from_slice(&objlen.to_be_bytes());
        out.extend_from_slice(&0u32.to_be_bytes()); // datime
        out.extend_from_slice(&keylen.to_be_bytes());
        out.extend_from_slice(&1i16.to_be_bytes()); // cycle
        // pad the key strings up to keylen - trailer - 1
        while out.len() < keylen as usize - 15 {
            out.push(0);
        }
        out.extend_from_slice(&3u16.to_be_bytes()); // fVersion
        out.extend_from_slice(&32000i32.to_be_bytes()); // fBufferSize
        out.extend_from_slice(&32i32.to_be_bytes()); // fNevBufSize
        out.extend_from_slice(&(entries.len() as i32).to_be_bytes()); // fNevBuf
        out.extend_from_slice(&last.to_be_bytes());
        out.push(0); // fHeaderOnly
        assert_eq!(out.len(), keylen as usize);

        out.extend_from_slice(&data);
        for word in tail {
            out.extend_from_slice(&word.to_be_bytes());
        }
        out
    }

    #[test]
    fn free_basket_offsets_are_normalized() {
        let bytes = free_basket(70, &[b"aaaa", b"bb", b"cccccc"]);
        let chunk = Chunk::wrap("test".into(), bytes);
        let file = RootFile::for_tests();
        let mut ctx = ReadContext::new(&file);
        let mut cursor = Cursor::new(0);

        let value = read_tbasket(&chunk, &mut cursor, &mut ctx).unwrap();
        let obj = value.as_object().unwrap();

        assert_eq!(obj.member_i64("fNevBuf"), Some(3));
        let offsets = obj.member("@byte_offsets").unwrap().as_array().unwrap();
        assert_eq!(offsets, &PrimitiveArray::I32(vec![0, 4, 6, 12]));
        match obj.member("@data").unwrap() {
            Value::Bytes(data) => assert_eq!(data, b"aaaabbcccccc"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn offsets_start_at_zero_and_end_at_border() {
        let raw = [100i32, 104, 110, 9999];
        let normalized = normalize_offsets(&raw, 100, 14);
        assert_eq!(normalized, vec![0, 4, 10, 14]);
        assert!(normalized.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(NumKind::I32.byte_size(), 4);
    }
}
