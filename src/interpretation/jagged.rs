//! Variable-length numeric entries, delimited by the basket's entry offsets.

use crate::error::{Error, Result};
use crate::interpretation::numerical::{AsDtype, Truncated};
use crate::interpretation::{Array, BasketInfo};
use crate::primitive::NumKind;

/// The element decoder inside a jagged interpretation.
#[derive(Debug, Clone, PartialEq)]
pub enum JaggedContent {
    Dtype(AsDtype),
    Truncated(Truncated),
}

/// Per-entry variable-length data. Each entry's bytes start `header_bytes`
/// past its offset (10 for STL collections, 0 for counted leaves) and run to
/// the next offset.
#[derive(Debug, Clone, PartialEq)]
pub struct AsJagged {
    pub content: JaggedContent,
    pub header_bytes: u32,
}

impl AsJagged {
    pub fn new(content: AsDtype, header_bytes: u32) -> AsJagged {
        AsJagged {
            content: JaggedContent::Dtype(content),
            header_bytes,
        }
    }

    pub fn typename(&self) -> String {
        match &self.content {
            JaggedContent::Dtype(d) => format!("{}[]", d.typename()),
            JaggedContent::Truncated(t) => format!("{}[]", t.typename()),
        }
    }

    pub fn content_kind_out(&self) -> NumKind {
        match &self.content {
            JaggedContent::Dtype(d) => d.kind_out(),
            JaggedContent::Truncated(_) => NumKind::F64,
        }
    }

    pub(crate) fn basket_array(
        &self,
        data: &[u8],
        byte_offsets: Option<&[i32]>,
        info: &BasketInfo,
    ) -> Result<Array> {
        let byte_offsets = byte_offsets.ok_or_else(|| {
            Error::deserialization(
                "variable-length branch basket has no entry offsets",
                info.branch_path.clone(),
                0,
                info.file_path.clone(),
            )
        })?;

        let mut offsets: Vec<i64> = Vec::with_capacity(byte_offsets.len());
        offsets.push(0);
        let mut content_bytes: Vec<u8> = Vec::with_capacity(data.len());

        for pair in byte_offsets.windows(2) {
            let start = pair[0] as usize + self.header_bytes as usize;
            let stop = pair[1] as usize;
            if start > stop || stop > data.len() {
                return Err(info.size_mismatch(data.len(), &self.typename()));
            }
            content_bytes.extend_from_slice(&data[start..stop]);
            let itemsize = match &self.content {
                JaggedContent::Dtype(d) => d.kind.byte_size(),
                JaggedContent::Truncated(t) => match t.truncation {
                    crate::interpretation::Truncation::Mantissa { .. } => 3,
                    crate::interpretation::Truncation::Scaled { .. } => 4,
                },
            };
            if (stop - start) % itemsize != 0 {
                return Err(info.size_mismatch(stop - start, &self.typename()));
            }
            offsets.push(offsets.last().expect("nonempty") + ((stop - start) / itemsize) as i64);
        }

        let content = match &self.content {
            JaggedContent::Dtype(d) => match d.basket_array(&content_bytes, info)? {
                Array::Numeric(values) => values,
                _ => unreachable!("dtype decodes to numeric"),
            },
            JaggedContent::Truncated(t) => match t.basket_array(&content_bytes, info)? {
                Array::Numeric(values) => values,
                _ => unreachable!("truncated decodes to numeric"),
            },
        };
        Ok(Array::Jagged { offsets, content })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitive::PrimitiveArray;

    fn info() -> BasketInfo {
        BasketInfo {
            basket_num: 3,
            key_len: 0,
            branch_path: "tree/vec".into(),
            file_path: "test.root".into(),
        }
    }

    #[test]
    fn stl_entry_headers_are_skipped() {
        // two entries of vector<i32>: [7, 8] and [9], with 10-byte headers
        let mut data = Vec::new();
        let mut offsets = vec![0i32];
        for entry in [&[7i32, 8][..], &[9][..]] {
            data.extend_from_slice(&[0u8; 10]);
            for v in entry {
                data.extend_from_slice(&v.to_be_bytes());
            }
            offsets.push(data.len() as i32);
        }

        let interp = AsJagged::new(AsDtype::new(NumKind::I32), 10);
        let out = interp.basket_array(&data, Some(&offsets), &info()).unwrap();
        assert_eq!(
            out,
            Array::Jagged {
                offsets: vec![0, 2, 3],
                content: PrimitiveArray::I32(vec![7, 8, 9]),
            }
        );
    }

    #[test]
    fn missing_offsets_fail_loudly() {
        let interp = AsJagged::new(AsDtype::new(NumKind::I32), 0);
        assert!(interp.basket_array(&[0u8; 8], None, &info()).is_err());
    }

    #[test]
    fn empty_basket_yields_no_entries() {
        let interp = AsJagged::new(AsDtype::new(NumKind::F64), 0);
        let out = interp.basket_array(&[], Some(&[0]), &info()).unwrap();
        assert_eq!(
            out,
            Array::Jagged {
                offsets: vec![0],
                content: PrimitiveArray::F64(vec![]),
            }
        );
    }
}
