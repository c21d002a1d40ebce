//! Object-valued branches: one deserialized instance per entry, or — when
//! the class flattens to a fixed stride of primitives — a column per member.

use crate::chunk::{Chunk, Cursor};
use crate::containers::Item;
use crate::error::{Error, Result};
use crate::interpretation::{Array, BasketInfo};
use crate::model::{read_class, ReadContext, Value};
use crate::primitive::{NumKind, PrimitiveArray};

/// One full object read per entry, through the registry or a container
/// description.
#[derive(Debug, Clone, PartialEq)]
pub struct AsObjects {
    pub item: Item,
}

impl AsObjects {
    pub fn new(item: Item) -> AsObjects {
        AsObjects { item }
    }

    pub(crate) fn basket_array(
        &self,
        data: &[u8],
        byte_offsets: Option<&[i32]>,
        info: &BasketInfo,
        ctx: &mut ReadContext,
    ) -> Result<Array> {
        let byte_offsets = byte_offsets.ok_or_else(|| {
            Error::deserialization(
                "object branch basket has no entry offsets",
                info.branch_path.clone(),
                0,
                info.file_path.clone(),
            )
        })?;

        // Objects see basket-local coordinates; the origin reproduces the
        // key-relative displacements back-references were written with.
        let chunk = Chunk::wrap(info.file_path.clone().into(), data.to_vec());

        let mut out = Vec::with_capacity(byte_offsets.len().saturating_sub(1));
        for pair in byte_offsets.windows(2) {
            let mut cursor = Cursor::with_origin(pair[0] as u64, -(info.key_len as i64));
            ctx.refs.clear();
            let value = match &self.item {
                Item::Class(classname) => read_class(classname, &chunk, &mut cursor, ctx)?,
                Item::Container(container) => container.read(&chunk, &mut cursor, ctx, true)?,
                Item::Dtype(kind) => {
                    let n = (pair[1] - pair[0]).max(0) as usize / kind.byte_size();
                    Value::Array(cursor.array(&chunk, n, *kind)?)
                }
            };
            if cursor.index() > pair[1] as u64 {
                return Err(info.size_mismatch(data.len(), &self.item.typename()));
            }
            out.push(value);
        }
        Ok(Array::Objects(out))
    }
}

/// A fixed-stride record of primitives: leaf lists and simple objects whose
/// members are all plain numbers.
#[derive(Debug, Clone, PartialEq)]
pub struct AsStridedObjects {
    pub members: Vec<(String, NumKind)>,
}

impl AsStridedObjects {
    pub fn new(members: Vec<(String, NumKind)>) -> AsStridedObjects {
        AsStridedObjects { members }
    }

    pub fn stride(&self) -> usize {
        self.members.iter().map(|(_, kind)| kind.byte_size()).sum()
    }

    pub fn typename(&self) -> String {
        let fields: Vec<String> = self
            .members
            .iter()
            .map(|(name, kind)| format!("{} {};", kind.typename(), name))
            .collect();
        format!("struct {{{}}}", fields.join(" "))
    }

    pub(crate) fn basket_array(&self, data: &[u8], info: &BasketInfo) -> Result<Array> {
        let stride = self.stride();
        if stride == 0 || data.len() % stride != 0 {
            return Err(info.size_mismatch(data.len(), &self.typename()));
        }
        let n = data.len() / stride;

        let mut columns: Vec<PrimitiveArray> = self
            .members
            .iter()
            .map(|(_, kind)| PrimitiveArray::with_capacity(*kind, n))
            .collect();

        for entry in data.chunks_exact(stride) {
            let mut at = 0;
            for ((_, kind), column) in self.members.iter().zip(columns.iter_mut()) {
                let raw = &entry[at..at + kind.byte_size()];
                let one = PrimitiveArray::from_be_bytes(*kind, raw)
                    .map_err(|_| info.size_mismatch(data.len(), &self.typename()))?;
                column.extend_from(&one)?;
                at += kind.byte_size();
            }
        }

        Ok(Array::Records {
            names: self.members.iter().map(|(name, _)| name.clone()).collect(),
            columns,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> BasketInfo {
        BasketInfo {
            basket_num: 1,
            key_len: 0,
            branch_path: "tree/hits".into(),
            file_path: "test.root".into(),
        }
    }

    #[test]
    fn strided_records_split_into_columns() {
        let interp = AsStridedObjects::new(vec![
            ("fX".into(), NumKind::F32),
            ("fN".into(), NumKind::I16),
        ]);
        assert_eq!(interp.stride(), 6);

        let mut data = Vec::new();
        for (x, n) in [(1.0f32, 10i16), (2.0, 20)] {
            data.extend_from_slice(&x.to_be_bytes());
            data.extend_from_slice(&n.to_be_bytes());
        }

        match interp.basket_array(&data, &info()).unwrap() {
            Array::Records { names, columns } => {
                assert_eq!(names, vec!["fX", "fN"]);
                assert_eq!(columns[0], PrimitiveArray::F32(vec![1.0, 2.0]));
                assert_eq!(columns[1], PrimitiveArray::I16(vec![10, 20]));
            }
            other => panic!("wrong shape {:?}", other),
        }
    }

    #[test]
    fn partial_stride_is_a_size_mismatch() {
        let interp = AsStridedObjects::new(vec![("fX".into(), NumKind::F64)]);
        assert!(interp.basket_array(&[0u8; 12], &info()).is_err());
    }
}
