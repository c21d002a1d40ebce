//! Fixed-width numeric interpretations, including ROOT's two truncated
//! floating-point codecs.

use crate::error::Result;
use crate::interpretation::{Array, BasketInfo};
use crate::primitive::{NumKind, PrimitiveArray};

/// Big-endian numbers of one kind, possibly with fixed inner dimensions
/// (`branch[10][5]`), decoded by reinterpretation.
#[derive(Debug, Clone, PartialEq)]
pub struct AsDtype {
    pub kind: NumKind,
    /// Fixed per-entry dimensions; the output stays flat, entry-major.
    pub dims: Vec<usize>,
    /// Widen `f32` storage to `f64` output (`Double32_t` written as plain
    /// floats).
    pub to_f64: bool,
}

impl AsDtype {
    pub fn new(kind: NumKind) -> AsDtype {
        AsDtype {
            kind,
            dims: Vec::new(),
            to_f64: false,
        }
    }

    pub fn with_dims(kind: NumKind, dims: Vec<usize>) -> AsDtype {
        AsDtype {
            kind,
            dims,
            to_f64: false,
        }
    }

    /// Elements per entry (the product of the fixed dimensions).
    pub fn entry_width(&self) -> usize {
        self.dims.iter().product::<usize>().max(1)
    }

    pub fn kind_out(&self) -> NumKind {
        if self.to_f64 {
            NumKind::F64
        } else {
            self.kind
        }
    }

    pub fn typename(&self) -> String {
        let mut out = self.kind.typename().to_string();
        for dim in &self.dims {
            out.push_str(&format!("[{}]", dim));
        }
        out
    }

    pub(crate) fn basket_array(&self, data: &[u8], info: &BasketInfo) -> Result<Array> {
        let itemsize = self.kind.byte_size();
        if data.len() % (itemsize * self.entry_width()) != 0 {
            return Err(info.size_mismatch(data.len(), &self.typename()));
        }
        let values = PrimitiveArray::from_be_bytes(self.kind, data)
            .map_err(|_| info.size_mismatch(data.len(), &self.typename()))?;
        let values = if self.to_f64 {
            widen_to_f64(values)
        } else {
            values
        };
        Ok(Array::Numeric(values))
    }
}

fn widen_to_f64(values: PrimitiveArray) -> PrimitiveArray {
    match values {
        PrimitiveArray::F32(v) => PrimitiveArray::F64(v.into_iter().map(f64::from).collect()),
        other => other,
    }
}

/// The storage regimes of `Double32_t` / `Float16_t`.
#[derive(Debug, Clone, PartialEq)]
pub enum Truncation {
    /// An exponent byte plus a big-endian 16-bit mantissa word per element,
    /// reassembled into an IEEE-754 single. The two fields sit at
    /// independent positions and are never one 24-bit read.
    Mantissa { num_bits: u32 },
    /// A big-endian `u32` scaled into `[low, high]`.
    Scaled { low: f64, high: f64, num_bits: u32 },
}

/// A truncated-float interpretation; both flavors decode to `f64`.
#[derive(Debug, Clone, PartialEq)]
pub struct Truncated {
    pub truncation: Truncation,
    pub dims: Vec<usize>,
    pub is_float16: bool,
}

impl Truncated {
    pub fn entry_width(&self) -> usize {
        self.dims.iter().product::<usize>().max(1)
    }

    pub fn typename(&self) -> &'static str {
        if self.is_float16 {
            "float"
        } else {
            "double"
        }
    }

    fn itemsize(&self) -> usize {
        match self.truncation {
            Truncation::Mantissa { .. } => 3,
            Truncation::Scaled { .. } => 4,
        }
    }

    pub(crate) fn basket_array(&self, data: &[u8], info: &BasketInfo) -> Result<Array> {
        if data.len() % (self.itemsize() * self.entry_width()) != 0 {
            return Err(info.size_mismatch(data.len(), self.typename()));
        }

        let out: Vec<f64> = match &self.truncation {
            Truncation::Mantissa { num_bits } => data
                .chunks_exact(3)
                .map(|raw| {
                    let exponent = raw[0] as u32;
                    let mantissa = u16::from_be_bytes([raw[1], raw[2]]) as u32;
                    decode_mantissa(exponent, mantissa, *num_bits) as f64
                })
                .collect(),
            Truncation::Scaled {
                low,
                high,
                num_bits,
            } => {
                let scale = (high - low) / (1u64 << num_bits) as f64;
                data.chunks_exact(4)
                    .map(|raw| {
                        let v = u32::from_be_bytes(raw.try_into().expect("4 bytes"));
                        low + v as f64 * scale
                    })
                    .collect()
            }
        };
        Ok(Array::Numeric(PrimitiveArray::F64(out)))
    }
}

/// Rebuild a float from its exponent byte and truncated mantissa word. The
/// sign lives in the bit just above the kept mantissa bits.
fn decode_mantissa(exponent: u32, mantissa: u32, num_bits: u32) -> f32 {
    let mut word = exponent << 23;
    word |= (mantissa & ((1 << (num_bits + 1)) - 1)) << (23 - num_bits);
    let sign = if mantissa & (1 << (num_bits + 1)) != 0 {
        -1.0f32
    } else {
        1.0f32
    };
    f32::from_bits(word) * sign
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> BasketInfo {
        BasketInfo {
            basket_num: 0,
            key_len: 0,
            branch_path: "tree/branch".into(),
            file_path: "test.root".into(),
        }
    }

    #[test]
    fn dtype_reinterprets_big_endian() {
        let interp = AsDtype::new(NumKind::I16);
        let data: Vec<u8> = [1i16, -2, 3]
            .iter()
            .flat_map(|v| v.to_be_bytes())
            .collect();
        assert_eq!(
            interp.basket_array(&data, &info()).unwrap(),
            Array::Numeric(PrimitiveArray::I16(vec![1, -2, 3]))
        );
    }

    #[test]
    fn dtype_size_mismatch_names_the_basket_and_branch() {
        let interp = AsDtype::new(NumKind::F64);
        let err = interp.basket_array(&[0u8; 12], &info()).unwrap_err();
        let text = err.to_string();
        assert!(text.contains("basket 0"));
        assert!(text.contains("tree/branch"));
        assert!(text.contains("test.root"));
    }

    #[test]
    fn multidimensional_entries_must_divide() {
        let interp = AsDtype::with_dims(NumKind::I32, vec![2, 3]);
        assert_eq!(interp.entry_width(), 6);
        // 24 bytes = one whole [2][3] entry of i32
        assert!(interp.basket_array(&[0u8; 24], &info()).is_ok());
        // 16 bytes is four i32 but not a whole entry
        assert!(interp.basket_array(&[0u8; 16], &info()).is_err());
    }

    #[test]
    fn scaled_double32_decodes_linearly() {
        // streamer title "[-1.0, 1.0, 10]": value v -> -1.0 + v * (2.0 / 1024)
        let interp = Truncated {
            truncation: Truncation::Scaled {
                low: -1.0,
                high: 1.0,
                num_bits: 10,
            },
            dims: Vec::new(),
            is_float16: false,
        };
        let data: Vec<u8> = [0u32, 512, 1023]
            .iter()
            .flat_map(|v| v.to_be_bytes())
            .collect();
        match interp.basket_array(&data, &info()).unwrap() {
            Array::Numeric(PrimitiveArray::F64(values)) => {
                assert_eq!(values[0], -1.0);
                assert_eq!(values[1], -1.0 + 512.0 * (2.0 / 1024.0));
                assert_eq!(values[2], -1.0 + 1023.0 * (2.0 / 1024.0));
            }
            other => panic!("wrong shape {:?}", other),
        }
    }

    #[test]
    fn mantissa_codec_round_trips_simple_values() {
        // encode 1.5, 12 mantissa bits: exponent 127, mantissa 0x400
        let num_bits = 12u32;
        let bits = 1.5f32.to_bits();
        let exponent = (bits >> 23) as u8;
        let mantissa = ((bits & 0x007F_FFFF) >> (23 - num_bits)) as u16;
        let mut data = vec![exponent];
        data.extend_from_slice(&mantissa.to_be_bytes());

        let interp = Truncated {
            truncation: Truncation::Mantissa { num_bits },
            dims: Vec::new(),
            is_float16: true,
        };
        match interp.basket_array(&data, &info()).unwrap() {
            Array::Numeric(PrimitiveArray::F64(values)) => {
                assert!((values[0] - 1.5).abs() < 1e-3);
            }
            other => panic!("wrong shape {:?}", other),
        }
    }

    #[test]
    fn mantissa_sign_bit_sits_above_the_kept_bits() {
        let num_bits = 12u32;
        let bits = 2.0f32.to_bits();
        let exponent = (bits >> 23) as u8;
        let mantissa = ((bits & 0x007F_FFFF) >> (23 - num_bits)) as u16 | (1 << (num_bits + 1));
        let mut data = vec![exponent];
        data.extend_from_slice(&mantissa.to_be_bytes());

        let interp = Truncated {
            truncation: Truncation::Mantissa { num_bits },
            dims: Vec::new(),
            is_float16: true,
        };
        match interp.basket_array(&data, &info()).unwrap() {
            Array::Numeric(PrimitiveArray::F64(values)) => {
                assert!((values[0] + 2.0).abs() < 1e-3);
            }
            other => panic!("wrong shape {:?}", other),
        }
    }
}
