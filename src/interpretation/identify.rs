//! Per-branch interpretation inference: inspect the leaf list, the branch's
//! streamer element, and any dimensions embedded in leaf titles, and decide
//! how the baskets decode.
//!
//! Failure to infer is not fatal — it produces an
//! [`UnknownInterpretation`] value that the branch carries around while the
//! rest of the tree stays usable.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::containers::{parse_typename, Item};
use crate::interpretation::jagged::{AsJagged, JaggedContent};
use crate::interpretation::numerical::{AsDtype, Truncated, Truncation};
use crate::interpretation::objects::{AsObjects, AsStridedObjects};
use crate::interpretation::strings::AsStrings;
use crate::interpretation::{Interpretation, UnknownInterpretation};
use crate::model::AnyObject;
use crate::primitive::NumKind;
use crate::streamers::{
    ftype_to_kind, normalize_ftype, StreamerElement, K_DOUBLE32, K_FLOAT16,
};
use crate::tree::Branch;

static TITLE_HAS_DIMS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([^\[\]]+)(\[[^\[\]]+\])+").expect("static regex"));
static ITEM_DIM: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[([1-9][0-9]*)\]").expect("static regex"));
static ITEM_ANY: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[([^\[\]]*)\]").expect("static regex"));

fn unknown(branch: &Branch, reason: impl Into<String>) -> UnknownInterpretation {
    UnknownInterpretation {
        reason: reason.into(),
        file_path: branch.file_path().to_string(),
        object_path: branch.object_path().to_string(),
    }
}

/// Numeric element kind of one leaf, or None for non-numeric leaves.
fn leaf_kind(leaf: &AnyObject) -> Option<NumKind> {
    let unsigned = leaf
        .member("fIsUnsigned")
        .and_then(crate::model::Value::as_i64)
        .unwrap_or(0)
        != 0;
    Some(match leaf.classname.as_str() {
        "TLeafO" => NumKind::Bool,
        "TLeafB" => {
            if unsigned {
                NumKind::U8
            } else {
                NumKind::I8
            }
        }
        "TLeafS" => {
            if unsigned {
                NumKind::U16
            } else {
                NumKind::I16
            }
        }
        "TLeafI" => {
            if unsigned {
                NumKind::U32
            } else {
                NumKind::I32
            }
        }
        "TLeafL" => {
            if unsigned {
                NumKind::U64
            } else {
                NumKind::I64
            }
        }
        "TLeafF" => NumKind::F32,
        "TLeafD" => NumKind::F64,
        "TLeafElement" => {
            let ftype = leaf.member_i64("fType")? as i32;
            return ftype_to_kind(ftype);
        }
        _ => return None,
    })
}

/// Fixed dimensions and jaggedness encoded in leaf titles
/// (`branch[10][5]`, `counts[nhits]`).
fn dims_from_leaves(branch: &Branch) -> Result<(Vec<usize>, bool), UnknownInterpretation> {
    let leaves = branch.leaves();
    let mut dims = Vec::new();
    let mut is_jagged = false;

    if leaves.len() == 1 {
        let leaf = leaves[0];
        let title = leaf.title();
        if TITLE_HAS_DIMS.is_match(title) {
            dims = ITEM_DIM
                .captures_iter(title)
                .filter_map(|c| c[1].parse::<usize>().ok())
                .collect();
            if dims.is_empty() {
                if let Some(len) = leaf.member_i64("fLen").filter(|len| *len > 1) {
                    dims = vec![len as usize];
                }
            }
            // a bracketed dimension that is not a plain integer names a
            // counter, making the branch jagged
            is_jagged = ITEM_ANY
                .captures_iter(title)
                .any(|c| !ITEM_DIM.is_match(&format!("[{}]", &c[1])));
        } else if let Some(len) = leaf.member_i64("fLen").filter(|len| *len > 1) {
            if leaf.classname != "TLeafC" {
                dims = vec![len as usize];
            }
        }
    } else {
        for &leaf in &leaves {
            if TITLE_HAS_DIMS.is_match(leaf.title()) {
                return Err(unknown(
                    branch,
                    "leaf-list with square brackets in the title",
                ));
            }
        }
    }

    Ok((dims, is_jagged))
}

/// Decide between the truncated-float regimes from the streamer title.
fn float16_or_double32(
    branch: &Branch,
    element: Option<&StreamerElement>,
    is_float16: bool,
    dims: Vec<usize>,
) -> Result<Interpretation, UnknownInterpretation> {
    let spec = match element.map(|element| element.title.as_str()) {
        Some(title) if title.contains('[') => {
            Some(parse_title_range(title).map_err(|reason| unknown(branch, reason))?)
        }
        _ => None,
    };

    let (low, high, num_bits) = match spec {
        None => (0.0, 0.0, Some(0)),
        Some(RangeSpec {
            low,
            high,
            num_bits,
        }) => (low, high, num_bits),
    };

    // a truncated mantissa cannot keep more bits than the format holds
    if let Some(bits) = num_bits.filter(|bits| *bits != 0) {
        let limit = if is_float16 { 16 } else { 23 };
        if low == 0.0 && high == 0.0 && bits > limit {
            return Err(unknown(
                branch,
                format!("truncated mantissa with {} bits", bits),
            ));
        }
    }

    let interpretation = if is_float16 {
        match num_bits {
            // no spec, or an explicit [0, 0, 0]: a truncated-mantissa float
            // with the stock twelve bits
            Some(0) => Truncated {
                truncation: Truncation::Mantissa { num_bits: 12 },
                dims,
                is_float16: true,
            },
            Some(bits) if low == 0.0 && high == 0.0 => Truncated {
                truncation: Truncation::Mantissa { num_bits: bits },
                dims,
                is_float16: true,
            },
            Some(bits) => Truncated {
                truncation: Truncation::Scaled {
                    low,
                    high,
                    num_bits: bits,
                },
                dims,
                is_float16: true,
            },
            None => Truncated {
                truncation: Truncation::Scaled {
                    low,
                    high,
                    num_bits: 12,
                },
                dims,
                is_float16: true,
            },
        }
    } else {
        match num_bits {
            // stored as a plain float, widened on output
            Some(0) => {
                return Ok(Interpretation::Dtype(AsDtype {
                    kind: NumKind::F32,
                    dims,
                    to_f64: true,
                }))
            }
            Some(bits) if low == 0.0 && high == 0.0 => Truncated {
                truncation: Truncation::Mantissa { num_bits: bits },
                dims,
                is_float16: false,
            },
            Some(bits) => Truncated {
                truncation: Truncation::Scaled {
                    low,
                    high,
                    num_bits: bits,
                },
                dims,
                is_float16: false,
            },
            None => Truncated {
                truncation: Truncation::Scaled {
                    low,
                    high,
                    num_bits: 32,
                },
                dims,
                is_float16: false,
            },
        }
    };
    Ok(Interpretation::Truncated(interpretation))
}

/// Infer the interpretation for one branch.
pub fn interpretation_of(branch: &Branch) -> Result<Interpretation, UnknownInterpretation> {
    let (dims, is_jagged) = dims_from_leaves(branch)?;
    let leaves = branch.leaves();
    let element = branch.streamer_element();

    // TBranchObject stores a class name ahead of every instance; the class
    // is not knowable before reading
    if branch.classname() == "TBranchObject" {
        return Ok(Interpretation::Objects(AsObjects::new(Item::Container(
            Box::new(crate::containers::AsContainer::Dynamic),
        ))));
    }

    // STL collections described by streamers come first: their baskets are
    // offset-framed regardless of what the leaf list says.
    if let Some(element) = element.as_ref() {
        if element.kind == crate::streamers::ElementKind::Stl {
            if let Some(kind) = element.stl_vector_kind() {
                return Ok(Interpretation::Jagged(AsJagged::new(
                    AsDtype::new(kind),
                    10,
                )));
            }
            if element.is_stl_string() {
                return Ok(Interpretation::Strings(AsStrings::new(6)));
            }
            let item = parse_typename(&element.typename, branch.file_path())
                .map_err(|err| unknown(branch, err.to_string()))?;
            return Ok(Interpretation::Objects(AsObjects::new(item)));
        }
    }

    match leaves.len() {
        0 => Err(unknown(branch, "branch has no leaves")),
        1 => {
            let leaf = leaves[0];

            if leaf.classname == "TLeafC" {
                return Ok(Interpretation::Strings(AsStrings::new(0)));
            }

            let leaftype = if leaf.classname == "TLeafElement" {
                normalize_ftype(leaf.member_i64("fType").unwrap_or(0) as i32)
            } else {
                -1
            };

            let out = if leaftype == K_FLOAT16 || leaftype == K_DOUBLE32 {
                float16_or_double32(branch, element.as_ref(), leaftype == K_FLOAT16, dims.clone())?
            } else {
                match leaf_kind(leaf) {
                    Some(kind) => Interpretation::Dtype(AsDtype::with_dims(kind, dims.clone())),
                    None => {
                        // an object-valued TLeafElement: read whole instances
                        if let Some(classname) =
                            branch.member_str("fClassName").filter(|s| !s.is_empty())
                        {
                            return Ok(Interpretation::Objects(AsObjects::new(Item::Class(
                                classname.to_string(),
                            ))));
                        }
                        return Err(unknown(branch, "leaf is not numerical"));
                    }
                }
            };

            let counted = !leaf
                .member("fLeafCount")
                .map(crate::model::Value::is_none)
                .unwrap_or(true);
            if counted || is_jagged {
                let content = match out {
                    Interpretation::Dtype(d) => JaggedContent::Dtype(d),
                    Interpretation::Truncated(t) => JaggedContent::Truncated(t),
                    other => return Ok(other),
                };
                Ok(Interpretation::Jagged(AsJagged {
                    content,
                    header_bytes: 0,
                }))
            } else {
                Ok(out)
            }
        }
        _ => {
            let any_counted = leaves.iter().any(|leaf| {
                !leaf
                    .member("fLeafCount")
                    .map(crate::model::Value::is_none)
                    .unwrap_or(true)
            });
            if any_counted {
                return Err(unknown(branch, "leaf-list with non-null fLeafCount"));
            }
            let mut members = Vec::with_capacity(leaves.len());
            for &leaf in &leaves {
                match leaf_kind(leaf) {
                    Some(kind) => members.push((leaf.name().to_string(), kind)),
                    None => return Err(unknown(branch, "leaf-list with non-numerical leaf")),
                }
            }
            Ok(Interpretation::StridedObjects(AsStridedObjects::new(
                members,
            )))
        }
    }
}

/// A `[low, high]` or `[low, high, num_bits]` range parsed from a streamer
/// title.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeSpec {
    pub low: f64,
    pub high: f64,
    /// None for the two-element form.
    pub num_bits: Option<u32>,
}

/// Parse the bracketed range expression of a truncated-float streamer title.
///
/// The grammar is a tiny arithmetic language: numbers, `pi`, unary minus,
/// the four binary operators, and parentheses. Anything else is an error so
/// an unrecognized spec never silently defaults.
pub fn parse_title_range(title: &str) -> Result<RangeSpec, String> {
    let open = title
        .find('[')
        .ok_or_else(|| format!("no range in title {:?}", title))?;
    let close = title[open..]
        .find(']')
        .map(|i| open + i)
        .ok_or_else(|| format!("unterminated range in title {:?}", title))?;
    let body = &title[open + 1..close];

    let parts: Vec<&str> = body.split(',').collect();
    if parts.len() != 2 && parts.len() != 3 {
        return Err(format!(
            "cannot interpret streamer title {:?} as (low, high) or (low, high, num_bits)",
            title
        ));
    }

    let low = eval_expression(parts[0])?;
    let high = eval_expression(parts[1])?;
    let num_bits = match parts.get(2) {
        Some(text) => {
            let value = eval_expression(text)?;
            if value < 0.0 || value.fract() != 0.0 || value > 32.0 {
                return Err(format!("num_bits {:?} is not an integer in 0..=32", text.trim()));
            }
            Some(value as u32)
        }
        None => None,
    };
    Ok(RangeSpec {
        low,
        high,
        num_bits,
    })
}

struct ExprParser<'a> {
    text: &'a [u8],
    pos: usize,
}

fn eval_expression(text: &str) -> Result<f64, String> {
    let mut parser = ExprParser {
        text: text.as_bytes(),
        pos: 0,
    };
    let value = parser.expression()?;
    parser.skip_spaces();
    if parser.pos != parser.text.len() {
        return Err(format!("cannot compute streamer title piece {:?}", text));
    }
    Ok(value)
}

impl<'a> ExprParser<'a> {
    fn skip_spaces(&mut self) {
        while self.pos < self.text.len() && self.text[self.pos] == b' ' {
            self.pos += 1;
        }
    }

    fn peek(&mut self) -> Option<u8> {
        self.skip_spaces();
        self.text.get(self.pos).copied()
    }

    fn expression(&mut self) -> Result<f64, String> {
        let mut value = self.term()?;
        loop {
            match self.peek() {
                Some(b'+') => {
                    self.pos += 1;
                    value += self.term()?;
                }
                Some(b'-') => {
                    self.pos += 1;
                    value -= self.term()?;
                }
                _ => return Ok(value),
            }
        }
    }

    fn term(&mut self) -> Result<f64, String> {
        let mut value = self.factor()?;
        loop {
            match self.peek() {
                Some(b'*') => {
                    self.pos += 1;
                    value *= self.factor()?;
                }
                Some(b'/') => {
                    self.pos += 1;
                    value /= self.factor()?;
                }
                _ => return Ok(value),
            }
        }
    }

    fn factor(&mut self) -> Result<f64, String> {
        match self.peek() {
            Some(b'-') => {
                self.pos += 1;
                Ok(-self.factor()?)
            }
            Some(b'(') => {
                self.pos += 1;
                let value = self.expression()?;
                if self.peek() == Some(b')') {
                    self.pos += 1;
                    Ok(value)
                } else {
                    Err("unbalanced parentheses".into())
                }
            }
            Some(b'p') if self.text[self.pos..].starts_with(b"pi") => {
                self.pos += 2;
                Ok(std::f64::consts::PI)
            }
            Some(c) if c.is_ascii_digit() || c == b'.' => {
                let start = self.pos;
                while self
                    .text
                    .get(self.pos)
                    .map(|c| c.is_ascii_digit() || *c == b'.' || *c == b'e' || *c == b'E')
                    .unwrap_or(false)
                {
                    self.pos += 1;
                }
                std::str::from_utf8(&self.text[start..self.pos])
                    .ok()
                    .and_then(|s| s.parse::<f64>().ok())
                    .ok_or_else(|| "malformed number".to_string())
            }
            other => Err(format!("unexpected token {:?}", other.map(char::from))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_ranges_parse() {
        assert_eq!(
            parse_title_range("pt [-1.0, 1.0, 10]").unwrap(),
            RangeSpec {
                low: -1.0,
                high: 1.0,
                num_bits: Some(10)
            }
        );
        assert_eq!(
            parse_title_range("[0, 0, 0]").unwrap(),
            RangeSpec {
                low: 0.0,
                high: 0.0,
                num_bits: Some(0)
            }
        );
        assert_eq!(
            parse_title_range("[3.14, 6.28]").unwrap(),
            RangeSpec {
                low: 3.14,
                high: 6.28,
                num_bits: None
            }
        );
    }

    #[test]
    fn expressions_with_pi_and_arithmetic() {
        let spec = parse_title_range("phi [-pi, 2*pi, 12]").unwrap();
        assert!((spec.low + std::f64::consts::PI).abs() < 1e-12);
        assert!((spec.high - 2.0 * std::f64::consts::PI).abs() < 1e-12);
        assert_eq!(spec.num_bits, Some(12));

        let spec = parse_title_range("[(1 + 2) / 4, 1 - -1]").unwrap();
        assert_eq!(spec.low, 0.75);
        assert_eq!(spec.high, 2.0);
    }

    #[test]
    fn unrecognized_forms_are_errors_not_defaults() {
        assert!(parse_title_range("[low, high]").is_err());
        assert!(parse_title_range("[1]").is_err());
        assert!(parse_title_range("[1, 2, 3, 4]").is_err());
        assert!(parse_title_range("[1, 2, 2.5]").is_err());
        assert!(parse_title_range("no brackets").is_err());
    }

    #[test]
    fn dimension_regexes_pick_numeric_dims() {
        assert!(TITLE_HAS_DIMS.is_match("hits[10][5]"));
        assert!(!TITLE_HAS_DIMS.is_match("plain"));
        let dims: Vec<usize> = ITEM_DIM
            .captures_iter("hits[10][5]")
            .filter_map(|c| c[1].parse().ok())
            .collect();
        assert_eq!(dims, vec![10, 5]);
        // a named dimension is jagged, not fixed
        let named: Vec<String> = ITEM_ANY
            .captures_iter("counts[nhits]")
            .map(|c| c[1].to_string())
            .collect();
        assert_eq!(named, vec!["nhits"]);
    }
}
