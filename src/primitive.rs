//! On-disk numeric element kinds and the typed flat arrays they decode into.

use crate::error::{Error, Result};

/// Element type of a primitive column, as stored (big-endian) on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NumKind {
    Bool,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
}

impl NumKind {
    pub fn byte_size(self) -> usize {
        match self {
            NumKind::Bool | NumKind::I8 | NumKind::U8 => 1,
            NumKind::I16 | NumKind::U16 => 2,
            NumKind::I32 | NumKind::U32 | NumKind::F32 => 4,
            NumKind::I64 | NumKind::U64 | NumKind::F64 => 8,
        }
    }

    /// C++ spelling, used to reconstruct typenames for display.
    pub fn typename(self) -> &'static str {
        match self {
            NumKind::Bool => "bool",
            NumKind::I8 => "int8_t",
            NumKind::U8 => "uint8_t",
            NumKind::I16 => "int16_t",
            NumKind::U16 => "uint16_t",
            NumKind::I32 => "int32_t",
            NumKind::U32 => "uint32_t",
            NumKind::I64 => "int64_t",
            NumKind::U64 => "uint64_t",
            NumKind::F32 => "float",
            NumKind::F64 => "double",
        }
    }
}

macro_rules! primitive_arrays {
    ($(($variant:ident, $ty:ty)),* $(,)?) => {
        /// A flat, native-endian array of one primitive kind.
        #[derive(Debug, Clone, PartialEq)]
        pub enum PrimitiveArray {
            $($variant(Vec<$ty>),)*
        }

        impl PrimitiveArray {
            pub fn len(&self) -> usize {
                match self {
                    $(PrimitiveArray::$variant(v) => v.len(),)*
                }
            }

            pub fn is_empty(&self) -> bool {
                self.len() == 0
            }

            pub fn kind(&self) -> NumKind {
                match self {
                    $(PrimitiveArray::$variant(_) => NumKind::$variant,)*
                }
            }

            pub fn nbytes(&self) -> usize {
                self.len() * self.kind().byte_size()
            }

            /// Append `other` (same kind) onto the end of `self`.
            pub fn extend_from(&mut self, other: &PrimitiveArray) -> Result<()> {
                match (self, other) {
                    $((PrimitiveArray::$variant(a), PrimitiveArray::$variant(b)) => {
                        a.extend_from_slice(b);
                        Ok(())
                    })*
                    (a, b) => Err(Error::Format {
                        reason: format!(
                            "cannot concatenate {:?} data onto {:?} data",
                            b.kind(),
                            a.kind()
                        ),
                        path: String::new(),
                    }),
                }
            }

            /// Copy out the half-open element range `[start, stop)`.
            pub fn slice(&self, start: usize, stop: usize) -> PrimitiveArray {
                match self {
                    $(PrimitiveArray::$variant(v) => {
                        PrimitiveArray::$variant(v[start..stop].to_vec())
                    })*
                }
            }
        }
    };
}

primitive_arrays! {
    (Bool, bool),
    (I8, i8),
    (U8, u8),
    (I16, i16),
    (U16, u16),
    (I32, i32),
    (U32, u32),
    (I64, i64),
    (U64, u64),
    (F32, f32),
    (F64, f64),
}

impl PrimitiveArray {
    pub fn empty(kind: NumKind) -> PrimitiveArray {
        PrimitiveArray::with_capacity(kind, 0)
    }

    pub fn with_capacity(kind: NumKind, n: usize) -> PrimitiveArray {
        match kind {
            NumKind::Bool => PrimitiveArray::Bool(Vec::with_capacity(n)),
            NumKind::I8 => PrimitiveArray::I8(Vec::with_capacity(n)),
            NumKind::U8 => PrimitiveArray::U8(Vec::with_capacity(n)),
            NumKind::I16 => PrimitiveArray::I16(Vec::with_capacity(n)),
            NumKind::U16 => PrimitiveArray::U16(Vec::with_capacity(n)),
            NumKind::I32 => PrimitiveArray::I32(Vec::with_capacity(n)),
            NumKind::U32 => PrimitiveArray::U32(Vec::with_capacity(n)),
            NumKind::I64 => PrimitiveArray::I64(Vec::with_capacity(n)),
            NumKind::U64 => PrimitiveArray::U64(Vec::with_capacity(n)),
            NumKind::F32 => PrimitiveArray::F32(Vec::with_capacity(n)),
            NumKind::F64 => PrimitiveArray::F64(Vec::with_capacity(n)),
        }
    }

    /// Decode `data` as a big-endian array of `kind`. The byte length must be
    /// an exact multiple of the element size.
    pub fn from_be_bytes(kind: NumKind, data: &[u8]) -> Result<PrimitiveArray> {
        let size = kind.byte_size();
        if data.len() % size != 0 {
            return Err(Error::Format {
                reason: format!(
                    "{} bytes is not a whole number of {} elements",
                    data.len(),
                    kind.typename()
                ),
                path: String::new(),
            });
        }

        macro_rules! decode {
            ($variant:ident, $ty:ty) => {
                PrimitiveArray::$variant(
                    data.chunks_exact(size)
                        .map(|c| <$ty>::from_be_bytes(c.try_into().expect("chunk size")))
                        .collect(),
                )
            };
        }

        Ok(match kind {
            NumKind::Bool => PrimitiveArray::Bool(data.iter().map(|&b| b != 0).collect()),
            NumKind::I8 => PrimitiveArray::I8(data.iter().map(|&b| b as i8).collect()),
            NumKind::U8 => PrimitiveArray::U8(data.to_vec()),
            NumKind::I16 => decode!(I16, i16),
            NumKind::U16 => decode!(U16, u16),
            NumKind::I32 => decode!(I32, i32),
            NumKind::U32 => decode!(U32, u32),
            NumKind::I64 => decode!(I64, i64),
            NumKind::U64 => decode!(U64, u64),
            NumKind::F32 => decode!(F32, f32),
            NumKind::F64 => decode!(F64, f64),
        })
    }

    /// Lossless view of an integer element, for members used as counts.
    pub fn index_value(&self, i: usize) -> Option<i64> {
        Some(match self {
            PrimitiveArray::Bool(v) => v[i] as i64,
            PrimitiveArray::I8(v) => v[i] as i64,
            PrimitiveArray::U8(v) => v[i] as i64,
            PrimitiveArray::I16(v) => v[i] as i64,
            PrimitiveArray::U16(v) => v[i] as i64,
            PrimitiveArray::I32(v) => v[i] as i64,
            PrimitiveArray::U32(v) => v[i] as i64,
            PrimitiveArray::I64(v) => v[i],
            PrimitiveArray::U64(v) => i64::try_from(v[i]).ok()?,
            PrimitiveArray::F32(_) | PrimitiveArray::F64(_) => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_big_endian() {
        let arr = PrimitiveArray::from_be_bytes(NumKind::I32, &[0, 0, 0, 5, 255, 255, 255, 251])
            .unwrap();
        assert_eq!(arr, PrimitiveArray::I32(vec![5, -5]));

        let arr = PrimitiveArray::from_be_bytes(NumKind::F64, &1.5f64.to_be_bytes()).unwrap();
        assert_eq!(arr, PrimitiveArray::F64(vec![1.5]));
    }

    #[test]
    fn ragged_byte_length_is_rejected() {
        assert!(PrimitiveArray::from_be_bytes(NumKind::I32, &[0, 0, 0]).is_err());
    }

    #[test]
    fn slice_and_extend() {
        let mut a = PrimitiveArray::I16(vec![1, 2, 3]);
        let b = PrimitiveArray::I16(vec![4, 5]);
        a.extend_from(&b).unwrap();
        assert_eq!(a.slice(1, 4), PrimitiveArray::I16(vec![2, 3, 4]));

        let c = PrimitiveArray::F32(vec![1.0]);
        assert!(a.extend_from(&c).is_err());
    }
}
