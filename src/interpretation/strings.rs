//! Branches of bare strings, one per entry.

use crate::error::{Error, Result};
use crate::interpretation::{Array, BasketInfo};

/// One length-prefixed string per entry: `header_bytes` of per-entry
/// framing, then one byte of length (escaping to four bytes at 255), then
/// the characters.
#[derive(Debug, Clone, PartialEq)]
pub struct AsStrings {
    pub header_bytes: u32,
}

impl AsStrings {
    pub fn new(header_bytes: u32) -> AsStrings {
        AsStrings { header_bytes }
    }

    pub(crate) fn basket_array(
        &self,
        data: &[u8],
        byte_offsets: Option<&[i32]>,
        info: &BasketInfo,
    ) -> Result<Array> {
        let byte_offsets = byte_offsets.ok_or_else(|| {
            Error::deserialization(
                "string branch basket has no entry offsets",
                info.branch_path.clone(),
                0,
                info.file_path.clone(),
            )
        })?;

        let mut out = Vec::with_capacity(byte_offsets.len().saturating_sub(1));
        for pair in byte_offsets.windows(2) {
            let start = pair[0] as usize + self.header_bytes as usize;
            let stop = pair[1] as usize;
            if start > stop || stop > data.len() {
                return Err(info.size_mismatch(data.len(), "char*"));
            }
            let entry = &data[start..stop];

            let (length, skip) = match entry.first() {
                Some(&255) => {
                    if entry.len() < 5 {
                        return Err(info.size_mismatch(entry.len(), "char*"));
                    }
                    (
                        u32::from_be_bytes(entry[1..5].try_into().expect("4 bytes")) as usize,
                        5,
                    )
                }
                Some(&n) => (n as usize, 1),
                None => (0, 0),
            };
            if skip + length > entry.len() {
                return Err(info.size_mismatch(entry.len(), "char*"));
            }
            out.push(String::from_utf8_lossy(&entry[skip..skip + length]).into_owned());
        }
        Ok(Array::Strings(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> BasketInfo {
        BasketInfo {
            basket_num: 0,
            key_len: 0,
            branch_path: "tree/Beg".into(),
            file_path: "test.root".into(),
        }
    }

    #[test]
    fn one_to_five_byte_lengths_decode_per_entry() {
        let mut data = Vec::new();
        let mut offsets = vec![0i32];
        for i in 0..100 {
            let s = format!("beg-{:03}", i);
            data.push(s.len() as u8);
            data.extend_from_slice(s.as_bytes());
            offsets.push(data.len() as i32);
        }

        let interp = AsStrings::new(0);
        match interp.basket_array(&data, Some(&offsets), &info()).unwrap() {
            Array::Strings(values) => {
                assert_eq!(values.len(), 100);
                assert_eq!(values[0], "beg-000");
                assert_eq!(values[1], "beg-001");
                assert_eq!(values[99], "beg-099");
            }
            other => panic!("wrong shape {:?}", other),
        }
    }

    #[test]
    fn long_strings_use_the_four_byte_escape() {
        let long = "x".repeat(300);
        let mut data = vec![255u8];
        data.extend_from_slice(&(300u32).to_be_bytes());
        data.extend_from_slice(long.as_bytes());
        let offsets = [0i32, data.len() as i32];

        let interp = AsStrings::new(0);
        match interp.basket_array(&data, Some(&offsets), &info()).unwrap() {
            Array::Strings(values) => assert_eq!(values[0], long),
            other => panic!("wrong shape {:?}", other),
        }
    }

    #[test]
    fn entry_headers_are_skipped() {
        let mut data = vec![0u8; 6];
        data.push(2);
        data.extend_from_slice(b"ok");
        let offsets = [0i32, data.len() as i32];

        let interp = AsStrings::new(6);
        match interp.basket_array(&data, Some(&offsets), &info()).unwrap() {
            Array::Strings(values) => assert_eq!(values[0], "ok"),
            other => panic!("wrong shape {:?}", other),
        }
    }
}
