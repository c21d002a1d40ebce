//! Interpretations: descriptions of how raw basket bytes become typed
//! arrays, and the pipeline that stitches per-basket pieces into one output
//! covering a requested entry range.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::model::{ReadContext, Value};
use crate::primitive::{NumKind, PrimitiveArray};

pub mod identify;
pub mod jagged;
pub mod numerical;
pub mod objects;
pub mod strings;

pub use identify::interpretation_of;
pub use jagged::AsJagged;
pub use numerical::{AsDtype, Truncated, Truncation};
pub use objects::{AsObjects, AsStridedObjects};
pub use strings::AsStrings;

/// A branch whose layout could be inferred but not decoded.
///
/// This is a value, not an error: it lives on the branch, and every other
/// branch of the tree stays readable.
#[derive(Debug, Clone)]
pub struct UnknownInterpretation {
    pub reason: String,
    pub file_path: String,
    pub object_path: String,
}

impl std::fmt::Display for UnknownInterpretation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} in file {} at {}",
            self.reason, self.file_path, self.object_path
        )
    }
}

/// Materialized branch data.
#[derive(Debug, Clone, PartialEq)]
pub enum Array {
    /// Flat numbers; multi-dimensional branches are flattened in entry-major
    /// order with the shape recorded on the interpretation.
    Numeric(PrimitiveArray),
    /// One column per named field, all the same length (leaf lists and
    /// strided objects).
    Records {
        names: Vec<String>,
        columns: Vec<PrimitiveArray>,
    },
    /// Variable-length numeric entries: `offsets` has one more element than
    /// there are entries and `content[offsets[i]..offsets[i+1]]` is entry i.
    Jagged {
        offsets: Vec<i64>,
        content: PrimitiveArray,
    },
    Strings(Vec<String>),
    Objects(Vec<Value>),
}

impl Array {
    pub fn num_entries(&self) -> usize {
        match self {
            Array::Numeric(values) => values.len(),
            Array::Records { columns, .. } => columns.first().map_or(0, PrimitiveArray::len),
            Array::Jagged { offsets, .. } => offsets.len().saturating_sub(1),
            Array::Strings(values) => values.len(),
            Array::Objects(values) => values.len(),
        }
    }

    /// Approximate memory footprint, used for the array-cache budget.
    pub fn nbytes(&self) -> usize {
        match self {
            Array::Numeric(values) => values.nbytes(),
            Array::Records { columns, .. } => columns.iter().map(PrimitiveArray::nbytes).sum(),
            Array::Jagged { offsets, content } => offsets.len() * 8 + content.nbytes(),
            Array::Strings(values) => values.iter().map(|s| s.len() + 24).sum(),
            Array::Objects(values) => values.len() * 64,
        }
    }
}

/// Identification of one basket within its branch, for error messages and
/// object decoding.
#[derive(Debug, Clone)]
pub struct BasketInfo {
    pub basket_num: usize,
    pub key_len: i32,
    pub branch_path: String,
    pub file_path: String,
}

impl BasketInfo {
    pub(crate) fn size_mismatch(&self, nbytes: usize, what: &str) -> Error {
        Error::deserialization(
            format!(
                "basket {} has the wrong number of bytes ({}) for interpretation {}",
                self.basket_num, nbytes, what
            ),
            self.branch_path.clone(),
            0,
            self.file_path.clone(),
        )
    }
}

/// How one branch's bytes become values.
#[derive(Debug, Clone, PartialEq)]
pub enum Interpretation {
    Dtype(AsDtype),
    Truncated(Truncated),
    Jagged(AsJagged),
    Strings(AsStrings),
    Objects(AsObjects),
    StridedObjects(AsStridedObjects),
}

impl Interpretation {
    /// A human-readable tag for errors and cache keys.
    pub fn cache_key(&self) -> String {
        format!("{:?}", self)
    }

    /// The C++ type this interpretation decodes.
    pub fn typename(&self) -> String {
        match self {
            Interpretation::Dtype(d) => d.typename(),
            Interpretation::Truncated(t) => t.typename().to_string(),
            Interpretation::Jagged(j) => j.typename(),
            Interpretation::Strings(_) => "char*".to_string(),
            Interpretation::Objects(o) => o.item.typename(),
            Interpretation::StridedObjects(s) => s.typename(),
        }
    }

    /// Decode one basket's payload into a temporary array.
    pub fn basket_array(
        &self,
        data: &[u8],
        byte_offsets: Option<&[i32]>,
        info: &BasketInfo,
        ctx: &mut ReadContext,
    ) -> Result<Array> {
        match self {
            Interpretation::Dtype(d) => d.basket_array(data, info),
            Interpretation::Truncated(t) => t.basket_array(data, info),
            Interpretation::Jagged(j) => j.basket_array(data, byte_offsets, info),
            Interpretation::Strings(s) => s.basket_array(data, byte_offsets, info),
            Interpretation::Objects(o) => o.basket_array(data, byte_offsets, info, ctx),
            Interpretation::StridedObjects(s) => s.basket_array(data, info),
        }
    }

    /// Stitch per-basket arrays into the `[entry_start, entry_stop)` output.
    ///
    /// `entry_offsets` is the branch's monotonically increasing entry count
    /// per basket boundary (one value per basket plus the final total);
    /// `basket_arrays` is keyed by basket number, so placement never depends
    /// on arrival order.
    pub fn final_array(
        &self,
        basket_arrays: HashMap<usize, Array>,
        entry_start: i64,
        entry_stop: i64,
        entry_offsets: &[i64],
    ) -> Result<Array> {
        let windows = basket_windows(entry_offsets, entry_start, entry_stop);

        match self {
            Interpretation::Dtype(d) => {
                let width = d.entry_width();
                concat_numeric(&basket_arrays, &windows, width, d.kind_out())
            }
            Interpretation::Truncated(t) => {
                concat_numeric(&basket_arrays, &windows, t.entry_width(), NumKind::F64)
            }
            Interpretation::Jagged(_) => {
                let mut offsets: Vec<i64> = Vec::new();
                offsets.push(0);
                let mut content: Option<PrimitiveArray> = None;
                for window in &windows {
                    let array = expect_basket(&basket_arrays, window.basket_num)?;
                    let (basket_offsets, basket_content) = match array {
                        Array::Jagged { offsets, content } => (offsets, content),
                        other => return Err(shape_error(other, "jagged")),
                    };
                    let first = basket_offsets[window.local_start];
                    for i in window.local_start..window.local_stop {
                        let length = basket_offsets[i + 1] - basket_offsets[i];
                        offsets.push(offsets.last().expect("nonempty") + length);
                    }
                    let last = basket_offsets[window.local_stop];
                    let piece = basket_content.slice(first as usize, last as usize);
                    match &mut content {
                        Some(content) => content.extend_from(&piece)?,
                        None => content = Some(piece),
                    }
                }
                let content = match content {
                    Some(content) => content,
                    None => self.empty_content(),
                };
                Ok(Array::Jagged { offsets, content })
            }
            Interpretation::Strings(_) => {
                let mut out = Vec::new();
                for window in &windows {
                    match expect_basket(&basket_arrays, window.basket_num)? {
                        Array::Strings(values) => {
                            out.extend_from_slice(&values[window.local_start..window.local_stop])
                        }
                        other => return Err(shape_error(other, "strings")),
                    }
                }
                Ok(Array::Strings(out))
            }
            Interpretation::Objects(_) => {
                let mut out = Vec::new();
                for window in &windows {
                    match expect_basket(&basket_arrays, window.basket_num)? {
                        Array::Objects(values) => {
                            out.extend_from_slice(&values[window.local_start..window.local_stop])
                        }
                        other => return Err(shape_error(other, "objects")),
                    }
                }
                Ok(Array::Objects(out))
            }
            Interpretation::StridedObjects(s) => {
                let mut columns: Vec<PrimitiveArray> = s
                    .members
                    .iter()
                    .map(|(_, kind)| PrimitiveArray::empty(*kind))
                    .collect();
                for window in &windows {
                    match expect_basket(&basket_arrays, window.basket_num)? {
                        Array::Records {
                            columns: basket_columns,
                            ..
                        } => {
                            for (column, basket_column) in
                                columns.iter_mut().zip(basket_columns)
                            {
                                column.extend_from(
                                    &basket_column
                                        .slice(window.local_start, window.local_stop),
                                )?;
                            }
                        }
                        other => return Err(shape_error(other, "records")),
                    }
                }
                Ok(Array::Records {
                    names: s.members.iter().map(|(name, _)| name.clone()).collect(),
                    columns,
                })
            }
        }
    }

    fn empty_content(&self) -> PrimitiveArray {
        match self {
            Interpretation::Jagged(j) => PrimitiveArray::empty(j.content_kind_out()),
            Interpretation::Dtype(d) => PrimitiveArray::empty(d.kind_out()),
            _ => PrimitiveArray::empty(NumKind::F64),
        }
    }
}

/// The part of one basket that intersects a requested entry range.
#[derive(Debug, PartialEq, Eq)]
struct Window {
    basket_num: usize,
    local_start: usize,
    local_stop: usize,
}

fn basket_windows(entry_offsets: &[i64], entry_start: i64, entry_stop: i64) -> Vec<Window> {
    let mut out = Vec::new();
    if entry_start >= entry_stop {
        return out;
    }
    for (basket_num, pair) in entry_offsets.windows(2).enumerate() {
        let (start, stop) = (pair[0], pair[1]);
        let lo = entry_start.max(start);
        let hi = entry_stop.min(stop);
        if lo < hi {
            out.push(Window {
                basket_num,
                local_start: (lo - start) as usize,
                local_stop: (hi - start) as usize,
            });
        }
    }
    out
}

fn expect_basket(basket_arrays: &HashMap<usize, Array>, basket_num: usize) -> Result<&Array> {
    basket_arrays.get(&basket_num).ok_or_else(|| Error::Format {
        reason: format!("basket {} was never decoded", basket_num),
        path: String::new(),
    })
}

fn shape_error(array: &Array, expected: &str) -> Error {
    Error::Format {
        reason: format!(
            "basket decoded to the wrong shape (expected {}, found {} entries of another kind)",
            expected,
            array.num_entries()
        ),
        path: String::new(),
    }
}

fn concat_numeric(
    basket_arrays: &HashMap<usize, Array>,
    windows: &[Window],
    entry_width: usize,
    kind_out: NumKind,
) -> Result<Array> {
    let mut out: Option<PrimitiveArray> = None;
    for window in windows {
        let piece = match expect_basket(basket_arrays, window.basket_num)? {
            Array::Numeric(values) => values.slice(
                window.local_start * entry_width,
                window.local_stop * entry_width,
            ),
            other => return Err(shape_error(other, "numeric")),
        };
        match &mut out {
            Some(out) => out.extend_from(&piece)?,
            None => out = Some(piece),
        }
    }
    Ok(Array::Numeric(
        out.unwrap_or_else(|| PrimitiveArray::empty(kind_out)),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dtype_i32() -> Interpretation {
        Interpretation::Dtype(AsDtype::new(NumKind::I32))
    }

    fn numeric(range: std::ops::Range<i32>) -> Array {
        Array::Numeric(PrimitiveArray::I32(range.collect()))
    }

    #[test]
    fn assembly_across_basket_boundaries_is_strictly_ordered() {
        // entry_offsets [0, 100, 250, 400], request [50, 300):
        // 50 entries from basket 0, 150 from basket 1, 50 from basket 2.
        let entry_offsets = [0i64, 100, 250, 400];
        let mut baskets = HashMap::new();
        baskets.insert(0, numeric(0..100));
        baskets.insert(1, numeric(100..250));
        baskets.insert(2, numeric(250..400));

        let out = dtype_i32()
            .final_array(baskets, 50, 300, &entry_offsets)
            .unwrap();
        match out {
            Array::Numeric(PrimitiveArray::I32(values)) => {
                assert_eq!(values.len(), 250);
                assert_eq!(values[0], 50);
                assert_eq!(values[249], 299);
                assert!(values.windows(2).all(|w| w[1] == w[0] + 1));
            }
            other => panic!("wrong shape {:?}", other),
        }
    }

    #[test]
    fn empty_request_reads_no_basket() {
        let entry_offsets = [0i64, 100];
        // no baskets provided at all: an empty request must not miss them
        let out = dtype_i32()
            .final_array(HashMap::new(), 30, 30, &entry_offsets)
            .unwrap();
        assert_eq!(out, Array::Numeric(PrimitiveArray::I32(vec![])));
    }

    #[test]
    fn windows_cover_exactly_the_intersections() {
        let windows = basket_windows(&[0, 100, 250, 400], 50, 300);
        assert_eq!(
            windows,
            vec![
                Window {
                    basket_num: 0,
                    local_start: 50,
                    local_stop: 100
                },
                Window {
                    basket_num: 1,
                    local_start: 0,
                    local_stop: 150
                },
                Window {
                    basket_num: 2,
                    local_start: 0,
                    local_stop: 50
                },
            ]
        );
        assert!(basket_windows(&[0, 10], 10, 10).is_empty());
    }

    #[test]
    fn jagged_assembly_rebases_offsets() {
        let jagged = Interpretation::Jagged(AsJagged::new(AsDtype::new(NumKind::I32), 0));
        let mut baskets = HashMap::new();
        baskets.insert(
            0,
            Array::Jagged {
                offsets: vec![0, 2, 5],
                content: PrimitiveArray::I32(vec![1, 2, 3, 4, 5]),
            },
        );
        baskets.insert(
            1,
            Array::Jagged {
                offsets: vec![0, 1],
                content: PrimitiveArray::I32(vec![6]),
            },
        );

        let out = jagged.final_array(baskets, 1, 3, &[0, 2, 3]).unwrap();
        assert_eq!(
            out,
            Array::Jagged {
                offsets: vec![0, 3, 4],
                content: PrimitiveArray::I32(vec![3, 4, 5, 6]),
            }
        );
    }
}
