//! TTree and TBranch navigation, branch filters, and the basket pipeline
//! that turns a requested entry range into one contiguous array.

use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use regex::{Regex, RegexBuilder};
use tracing::{debug, warn};

use crate::chunk::Cursor;
use crate::error::{Error, Result};
use crate::file::{FileRef, ObjectRef, RootFile};
use crate::interpretation::{
    interpretation_of, Array, BasketInfo, Interpretation, UnknownInterpretation,
};
use crate::model::{read_class, AnyObject, ReadContext, Value};
use crate::primitive::PrimitiveArray;
use crate::streamers::StreamerElement;

/// Branch `fType` bits above this mask have been seen in the wild; they are
/// logged and ignored rather than rejected.
const BRANCH_TYPE_MASK: i64 = 0x3FFF;

/// A name/typename filter: always-true, exact match, `/regex/flags`, or a
/// glob.
#[derive(Debug, Clone)]
pub enum Filter {
    All,
    Exact(String),
    Regex(Regex),
    Glob(Regex),
}

impl Filter {
    /// Interpret a filter specification string: `/pattern/flags` compiles a
    /// regex (anchored at the start, like a match), a string containing
    /// `*?[` becomes a glob, and anything else matches exactly.
    pub fn parse(spec: &str) -> Result<Filter> {
        if let Some(rest) = spec.strip_prefix('/') {
            if let Some(at) = rest.rfind('/') {
                let (pattern, flags) = (&rest[..at], &rest[at + 1..]);
                if flags.chars().all(|c| "iLmsux".contains(c)) {
                    let mut builder = RegexBuilder::new(&format!("^(?:{})", pattern));
                    builder
                        .case_insensitive(flags.contains('i'))
                        .multi_line(flags.contains('m'))
                        .dot_matches_new_line(flags.contains('s'))
                        .ignore_whitespace(flags.contains('x'));
                    let regex = builder.build().map_err(|err| Error::Format {
                        reason: format!("bad filter regex {:?}: {}", spec, err),
                        path: String::new(),
                    })?;
                    return Ok(Filter::Regex(regex));
                }
            }
        }
        if spec.contains('*') || spec.contains('?') || spec.contains('[') {
            let regex = Regex::new(&glob_to_regex(spec)).map_err(|err| Error::Format {
                reason: format!("bad filter glob {:?}: {}", spec, err),
                path: String::new(),
            })?;
            return Ok(Filter::Glob(regex));
        }
        Ok(Filter::Exact(spec.to_string()))
    }

    pub fn matches(&self, text: &str) -> bool {
        match self {
            Filter::All => true,
            Filter::Exact(name) => name == text,
            Filter::Regex(regex) => regex.is_match(text),
            Filter::Glob(regex) => regex.is_match(text),
        }
    }
}

/// Translate a glob into an anchored regex (`*` any run, `?` one character,
/// `[…]` passed through).
fn glob_to_regex(glob: &str) -> String {
    let mut out = String::from("^");
    let mut chars = glob.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '[' => {
                out.push('[');
                if chars.peek() == Some(&'!') {
                    chars.next();
                    out.push('^');
                }
                for inner in chars.by_ref() {
                    out.push(inner);
                    if inner == ']' {
                        break;
                    }
                }
            }
            c if "\\.+()|^$E{}".contains(c) => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out.push('$');
    out
}

/// A columnar table: the primary payload of the format.
pub struct Tree {
    obj: Arc<AnyObject>,
    file: Arc<RootFile>,
    object_path: String,
    branches: Vec<Branch>,
}

impl Tree {
    pub(crate) fn new(source: ObjectRef, file: Arc<RootFile>) -> Result<Tree> {
        let obj = match source.value {
            Value::Object(obj) => Arc::new(*obj),
            other => {
                return Err(Error::Format {
                    reason: format!("a TTree cannot be built from {:?}", other),
                    path: file.file_path().to_string(),
                })
            }
        };
        let object_path = source.object_path;
        let branches = child_branches(&obj, &file, &object_path);
        Ok(Tree {
            obj,
            file,
            object_path,
            branches,
        })
    }

    pub fn name(&self) -> &str {
        self.obj.name()
    }

    pub fn title(&self) -> &str {
        self.obj.title()
    }

    pub fn object_path(&self) -> &str {
        &self.object_path
    }

    pub fn file(&self) -> &Arc<RootFile> {
        &self.file
    }

    pub fn num_entries(&self) -> i64 {
        self.obj.member_i64("fEntries").unwrap_or(0)
    }

    pub fn branches(&self) -> &[Branch] {
        &self.branches
    }

    /// Look up a branch by index, relative path, or leading-`/`
    /// non-recursive name.
    pub fn branch(&self, where_: &str) -> Result<Branch> {
        lookup_branch(&self.branches, where_).ok_or_else(|| self.not_found(where_))
    }

    pub fn branch_at(&self, index: usize) -> Option<&Branch> {
        self.branches.get(index)
    }

    fn not_found(&self, where_: &str) -> Error {
        Error::KeyNotFound {
            key: where_.to_string(),
            cycle: "any".to_string(),
            path: self.file.file_path().to_string(),
            object_path: self.object_path.clone(),
        }
    }

    /// Branch names, filtered by name and typename in AND composition.
    pub fn keys(&self, recursive: bool, filter_name: &Filter, filter_typename: &Filter) -> Vec<String> {
        self.items(recursive, filter_name, filter_typename, None)
            .into_iter()
            .map(|(name, _)| name)
            .collect()
    }

    /// `(path, branch)` pairs, with optional predicate on the branch itself.
    pub fn items(
        &self,
        recursive: bool,
        filter_name: &Filter,
        filter_typename: &Filter,
        filter_branch: Option<&dyn Fn(&Branch) -> bool>,
    ) -> Vec<(String, Branch)> {
        let mut out = Vec::new();
        collect_items(
            &self.branches,
            "",
            recursive,
            filter_name,
            filter_typename,
            filter_branch,
            &mut out,
        );
        out
    }
}

fn child_branches(obj: &AnyObject, file: &Arc<RootFile>, parent_path: &str) -> Vec<Branch> {
    let mut out = Vec::new();
    if let Some(Value::List(items)) = obj.member("fBranches") {
        for item in items {
            if let Value::Object(child) = item {
                if child.classname.starts_with("TBranch") {
                    out.push(Branch::from_object(
                        Arc::new((**child).clone()),
                        Arc::clone(file),
                        format!("{}/{}", parent_path, child.name()),
                    ));
                }
            }
        }
    }
    out
}

fn collect_items(
    branches: &[Branch],
    prefix: &str,
    recursive: bool,
    filter_name: &Filter,
    filter_typename: &Filter,
    filter_branch: Option<&dyn Fn(&Branch) -> bool>,
    out: &mut Vec<(String, Branch)>,
) {
    for branch in branches {
        let shown = format!("{}{}", prefix, branch.name());
        if filter_name.matches(&shown)
            && filter_typename.matches(&branch.typename())
            && filter_branch.map_or(true, |f| f(branch))
        {
            out.push((shown.clone(), branch.clone()));
        }
        if recursive {
            collect_items(
                &branch.branches,
                &format!("{}/", shown),
                recursive,
                filter_name,
                filter_typename,
                filter_branch,
                out,
            );
        }
    }
}

fn get_recursive(branches: &[Branch], name: &str) -> Option<Branch> {
    for branch in branches {
        if branch.name() == name {
            return Some(branch.clone());
        }
        if let Some(found) = get_recursive(&branch.branches, name) {
            return Some(found);
        }
    }
    None
}

fn lookup_branch(branches: &[Branch], where_: &str) -> Option<Branch> {
    let (recursive, where_) = match where_.strip_prefix('/') {
        Some(rest) => (false, rest),
        None => (true, where_),
    };

    if where_.contains('/') {
        let mut collapsed = where_.to_string();
        while collapsed.contains("//") {
            collapsed = collapsed.replace("//", "/");
        }
        let mut parts = collapsed.split('/').filter(|p| !p.is_empty());
        let first = parts.next()?;
        let mut current = branches.iter().find(|b| b.name() == first)?.clone();
        for part in parts {
            current = current
                .branches
                .iter()
                .find(|b| b.name() == part)?
                .clone();
        }
        Some(current)
    } else if recursive {
        get_recursive(branches, where_)
    } else {
        branches.iter().find(|b| b.name() == where_).cloned()
    }
}

/// One column of a tree, possibly with sub-branches.
#[derive(Clone)]
pub struct Branch {
    obj: Arc<AnyObject>,
    file: Arc<RootFile>,
    object_path: String,
    branches: Vec<Branch>,
    interpretation: OnceCell<std::result::Result<Interpretation, UnknownInterpretation>>,
}

/// Where one basket's bytes live.
enum BasketLocation {
    Free { seek: u64, nbytes: u64 },
    Embedded(AnyObject),
}

impl Branch {
    pub(crate) fn from_object(
        obj: Arc<AnyObject>,
        file: Arc<RootFile>,
        object_path: String,
    ) -> Branch {
        let branches = child_branches(&obj, &file, &object_path);
        Branch {
            obj,
            file,
            object_path,
            branches,
            interpretation: OnceCell::new(),
        }
    }

    pub fn name(&self) -> &str {
        self.obj.name()
    }

    pub fn title(&self) -> &str {
        self.obj.title()
    }

    pub fn classname(&self) -> &str {
        &self.obj.classname
    }

    pub fn object_path(&self) -> &str {
        &self.object_path
    }

    pub fn file_path(&self) -> &str {
        self.file.file_path()
    }

    pub fn file(&self) -> &Arc<RootFile> {
        &self.file
    }

    pub fn member_str(&self, name: &str) -> Option<&str> {
        self.obj.member_str(name)
    }

    pub fn branches(&self) -> &[Branch] {
        &self.branches
    }

    pub fn branch(&self, where_: &str) -> Result<Branch> {
        lookup_branch(&self.branches, where_).ok_or_else(|| Error::KeyNotFound {
            key: where_.to_string(),
            cycle: "any".to_string(),
            path: self.file.file_path().to_string(),
            object_path: self.object_path.clone(),
        })
    }

    pub fn num_entries(&self) -> i64 {
        self.obj.member_i64("fEntries").unwrap_or(0)
    }

    /// The TBranchElement type tag with tolerated unknown bits masked out.
    pub fn branch_type(&self) -> i64 {
        let raw = self.obj.member_i64("fType").unwrap_or(0);
        if raw & !BRANCH_TYPE_MASK != 0 {
            warn!(
                branch = self.name(),
                raw, "unexpected bits in branch fType; masking them out"
            );
        }
        raw & BRANCH_TYPE_MASK
    }

    /// The leaves attached to this branch.
    pub fn leaves(&self) -> Vec<&AnyObject> {
        match self.obj.member("fLeaves") {
            Some(Value::List(items)) => items
                .iter()
                .filter_map(|item| item.as_object())
                .collect(),
            _ => Vec::new(),
        }
    }

    /// The streamer element describing this branch's member, when the file
    /// carries one (TBranchElement only).
    pub fn streamer_element(&self) -> Option<StreamerElement> {
        let parent = self.obj.member_str("fParentName").filter(|s| !s.is_empty())?;
        let clean_name = self.name().rsplit('.').next().unwrap_or(self.name());
        let streamer = self.file.streamer_named(parent, None)?;
        streamer
            .elements
            .iter()
            .find(|element| element.name == clean_name)
            .cloned()
    }

    /// How this branch's baskets decode, inferred once and kept. An
    /// uninterpretable branch holds the reason; the rest of the tree is
    /// unaffected.
    pub fn interpretation(&self) -> std::result::Result<Interpretation, UnknownInterpretation> {
        self.interpretation
            .get_or_init(|| interpretation_of(self))
            .clone()
    }

    pub fn typename(&self) -> String {
        match self.interpretation() {
            Ok(interpretation) => interpretation.typename(),
            Err(_) => self
                .obj
                .member_str("fClassName")
                .filter(|s| !s.is_empty())
                .unwrap_or("unknown")
                .to_string(),
        }
    }

    /// Cumulative entry counts at each basket boundary: one value per
    /// basket plus the final total, strictly non-decreasing.
    pub fn entry_offsets(&self) -> Result<Vec<i64>> {
        let num_entries = self.num_entries();
        let write_basket = self.obj.member_i64("fWriteBasket").unwrap_or(0).max(0) as usize;

        let basket_entry = match self.obj.member("fBasketEntry") {
            Some(Value::Array(PrimitiveArray::I64(values))) => values.as_slice(),
            _ => &[],
        };
        let mut out: Vec<i64> = basket_entry
            .iter()
            .take(write_basket + 1)
            .copied()
            .collect();
        if out.is_empty() {
            out.push(0);
        }

        if !self.embedded_baskets().is_empty() && *out.last().expect("nonempty") != num_entries {
            out.push(num_entries);
        }

        if *out.last().expect("nonempty") != num_entries {
            return Err(Error::Format {
                reason: format!(
                    "branch {} entry offsets end at {} but the branch has {} entries",
                    self.name(),
                    out.last().expect("nonempty"),
                    num_entries
                ),
                path: self.file.file_path().to_string(),
            });
        }
        if out.windows(2).any(|w| w[0] > w[1]) {
            return Err(Error::Format {
                reason: format!("branch {} entry offsets are not monotonic", self.name()),
                path: self.file.file_path().to_string(),
            });
        }
        Ok(out)
    }

    fn embedded_baskets(&self) -> Vec<&AnyObject> {
        match self.obj.member("fBaskets") {
            Some(Value::List(items)) => items
                .iter()
                .filter_map(|item| item.as_object())
                .filter(|obj| obj.classname == "TBasket")
                .collect(),
            _ => Vec::new(),
        }
    }

    fn basket_location(&self, basket_num: usize) -> Result<BasketLocation> {
        let write_basket = self.obj.member_i64("fWriteBasket").unwrap_or(0).max(0) as usize;
        if basket_num < write_basket {
            let seek = match self.obj.member("fBasketSeek") {
                Some(Value::Array(PrimitiveArray::I64(values))) => {
                    values.get(basket_num).copied().unwrap_or(0)
                }
                _ => 0,
            };
            let nbytes = match self.obj.member("fBasketBytes") {
                Some(Value::Array(PrimitiveArray::I32(values))) => {
                    values.get(basket_num).copied().unwrap_or(0)
                }
                _ => 0,
            };
            if seek <= 0 || nbytes <= 0 {
                return Err(Error::Format {
                    reason: format!(
                        "basket {} of branch {} has no seek point",
                        basket_num,
                        self.name()
                    ),
                    path: self.file.file_path().to_string(),
                });
            }
            Ok(BasketLocation::Free {
                seek: seek as u64,
                nbytes: nbytes as u64,
            })
        } else {
            let embedded = self.embedded_baskets();
            embedded
                .get(basket_num - write_basket)
                .map(|obj| BasketLocation::Embedded((*obj).clone()))
                .ok_or_else(|| Error::Format {
                    reason: format!(
                        "basket {} of branch {} is neither free nor embedded",
                        basket_num,
                        self.name()
                    ),
                    path: self.file.file_path().to_string(),
                })
        }
    }

    /// Materialize every entry of the branch.
    pub fn array(&self) -> Result<Arc<Array>> {
        self.array_range(0, self.num_entries())
    }

    /// Materialize `[entry_start, entry_stop)` in file order. Baskets are
    /// fetched with one vector read and decompressed/interpreted in
    /// parallel; each piece lands in the output by its basket number, never
    /// by arrival order.
    pub fn array_range(&self, entry_start: i64, entry_stop: i64) -> Result<Arc<Array>> {
        let interpretation = self.interpretation().map_err(|unknown| Error::Unsupported {
            feature: format!("interpretation of this branch ({})", unknown.reason),
            path: self.file.file_path().to_string(),
        })?;

        let entry_offsets = self.entry_offsets()?;
        let num_entries = *entry_offsets.last().expect("nonempty");
        let entry_start = entry_start.max(0);
        let entry_stop = entry_stop.min(num_entries);

        let cache_key = format!(
            "{}:{}:{}:{}-{}",
            self.file.header().hex_uuid(),
            self.object_path,
            interpretation.cache_key(),
            entry_start,
            entry_stop
        );
        if let Some(hit) = self.file.array_cache().get(&cache_key) {
            debug!(branch = self.name(), "array cache hit");
            return Ok(hit);
        }

        let needed: Vec<usize> = entry_offsets
            .windows(2)
            .enumerate()
            .filter(|(_, pair)| {
                let lo = entry_start.max(pair[0]);
                let hi = entry_stop.min(pair[1]);
                lo < hi
            })
            .map(|(basket_num, _)| basket_num)
            .collect();

        let mut basket_arrays: HashMap<usize, Array> = HashMap::new();
        if !needed.is_empty() {
            let mut free: Vec<(usize, u64, u64)> = Vec::new();
            let mut embedded: Vec<(usize, AnyObject)> = Vec::new();
            for &basket_num in &needed {
                match self.basket_location(basket_num)? {
                    BasketLocation::Free { seek, nbytes } => {
                        free.push((basket_num, seek, seek + nbytes))
                    }
                    BasketLocation::Embedded(obj) => embedded.push((basket_num, obj)),
                }
            }

            for (basket_num, obj) in embedded {
                basket_arrays.insert(
                    basket_num,
                    self.decode_embedded(&interpretation, basket_num, &obj)?,
                );
            }

            if !free.is_empty() {
                for (basket_num, array) in self.decode_free(&interpretation, &free)? {
                    basket_arrays.insert(basket_num, array);
                }
            }
        }

        let out = Arc::new(interpretation.final_array(
            basket_arrays,
            entry_start,
            entry_stop,
            &entry_offsets,
        )?);
        self.file.array_cache().put(cache_key, Arc::clone(&out));
        Ok(out)
    }

    fn basket_info(&self, basket_num: usize, key_len: i32) -> BasketInfo {
        BasketInfo {
            basket_num,
            key_len,
            branch_path: self.object_path.clone(),
            file_path: self.file.file_path().to_string(),
        }
    }

    fn decode_embedded(
        &self,
        interpretation: &Interpretation,
        basket_num: usize,
        basket: &AnyObject,
    ) -> Result<Array> {
        let (data, byte_offsets, key_len) = basket_payload(basket).ok_or_else(|| {
            Error::Format {
                reason: format!("embedded basket {} carries no payload", basket_num),
                path: self.file.file_path().to_string(),
            }
        })?;
        let info = self.basket_info(basket_num, key_len);
        self.file.interpretation_executor().run(|| {
            let mut ctx = ReadContext::new(&self.file);
            interpretation.basket_array(data, byte_offsets, &info, &mut ctx)
        })
    }

    /// Fetch, decompress, and interpret free baskets. The vector read
    /// returns pending chunks; as each one is delivered it is handed to the
    /// file's decompression pool, so independent baskets overlap with I/O.
    fn decode_free(
        &self,
        interpretation: &Interpretation,
        free: &[(usize, u64, u64)],
    ) -> Result<Vec<(usize, Array)>> {
        let ranges: Vec<(u64, u64)> = free.iter().map(|&(_, a, b)| (a, b)).collect();
        let by_start: HashMap<u64, usize> =
            free.iter().map(|&(num, a, _)| (a, num)).collect();

        let (sink, arrivals) = mpsc::channel();
        let _chunks = self.file.chunks(&ranges, &sink)?;
        drop(sink);

        let (results_tx, results_rx) = mpsc::channel();
        for chunk in arrivals {
            let basket_num = by_start
                .get(&chunk.start())
                .copied()
                .expect("chunk matches a requested basket");
            let branch = self.clone();
            let interpretation = interpretation.clone();
            let results_tx = results_tx.clone();
            self.file.decompression_executor().submit(move || {
                let decoded = branch.decode_free_one(&interpretation, basket_num, &chunk);
                let _ = results_tx.send((basket_num, decoded));
            });
        }
        drop(results_tx);

        let mut out = Vec::with_capacity(free.len());
        for (basket_num, decoded) in results_rx {
            out.push((basket_num, decoded?));
        }
        if out.len() != free.len() {
            return Err(Error::Format {
                reason: format!("only {} of {} baskets arrived", out.len(), free.len()),
                path: self.file.file_path().to_string(),
            });
        }
        Ok(out)
    }

    fn decode_free_one(
        &self,
        interpretation: &Interpretation,
        basket_num: usize,
        chunk: &crate::chunk::Chunk,
    ) -> Result<Array> {
        let mut cursor = Cursor::new(chunk.start());
        let mut ctx = ReadContext::new(&self.file);
        let value = read_class("TBasket", chunk, &mut cursor, &mut ctx)?;
        let basket = match &value {
            Value::Object(obj) => obj,
            other => {
                return Err(Error::Format {
                    reason: format!("basket read produced {:?}", other),
                    path: self.file.file_path().to_string(),
                })
            }
        };
        let (data, byte_offsets, key_len) =
            basket_payload(basket).ok_or_else(|| Error::Format {
                reason: format!("basket {} carries no payload", basket_num),
                path: self.file.file_path().to_string(),
            })?;
        let info = self.basket_info(basket_num, key_len);
        self.file
            .interpretation_executor()
            .run(|| interpretation.basket_array(data, byte_offsets, &info, &mut ctx))
    }

    /// The object-model view of this branch, for generic consumers.
    pub fn into_object_ref(self) -> ObjectRef {
        ObjectRef {
            value: Value::Object(Box::new((*self.obj).clone())),
            classname: self.obj.classname.clone(),
            file: FileRef::Live(self.file),
            object_path: self.object_path,
        }
    }
}

fn basket_payload(basket: &AnyObject) -> Option<(&[u8], Option<&[i32]>, i32)> {
    let data = match basket.member("@data")? {
        Value::Bytes(data) => data.as_slice(),
        _ => return None,
    };
    let byte_offsets = match basket.member("@byte_offsets") {
        Some(Value::Array(PrimitiveArray::I32(values))) => Some(values.as_slice()),
        _ => None,
    };
    let key_len = basket.member_i64("fKeylen").unwrap_or(0) as i32;
    Some((data, byte_offsets, key_len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitive::NumKind;

    fn named(classname: &str, name: &str) -> AnyObject {
        let mut tnamed = AnyObject::new("TNamed", 1);
        tnamed.set("fName", Value::Str(name.into()));
        tnamed.set("fTitle", Value::Str(String::new()));
        let mut obj = AnyObject::new(classname, 13);
        obj.bases.push(tnamed);
        obj
    }

    fn leaf(classname: &str, name: &str) -> AnyObject {
        let mut obj = named(classname, name);
        obj.set("fLen", Value::I32(1));
        obj.set("fLeafCount", Value::None);
        obj.set("fIsUnsigned", Value::Bool(false));
        obj
    }

    /// A branch with one embedded, uncompressed basket of i32 values.
    fn branch_with_embedded_basket(values: &[i32]) -> Branch {
        let mut basket = AnyObject::new("TBasket", 3);
        basket.set("fKeylen", Value::I16(10));
        basket.set("fNevBuf", Value::I32(values.len() as i32));
        let data: Vec<u8> = values.iter().flat_map(|v| v.to_be_bytes()).collect();
        basket.set("@data", Value::Bytes(data));
        basket.set("@byte_offsets", Value::None);

        let mut obj = named("TBranch", "values");
        obj.set("fWriteBasket", Value::I32(0));
        obj.set("fEntries", Value::I64(values.len() as i64));
        obj.set("fBasketEntry", Value::Array(PrimitiveArray::I64(vec![0])));
        obj.set("fBasketBytes", Value::Array(PrimitiveArray::I32(vec![])));
        obj.set("fBasketSeek", Value::Array(PrimitiveArray::I64(vec![])));
        obj.set("fLeaves", Value::List(vec![leaf("TLeafI", "values").into_value()]));
        obj.set("fBaskets", Value::List(vec![basket.into_value()]));
        obj.set("fBranches", Value::List(vec![]));

        let file = Arc::new(crate::file::RootFile::for_tests());
        Branch::from_object(Arc::new(obj), file, "/tree/values".into())
    }

    fn branch_tree() -> Vec<Branch> {
        let file = Arc::new(crate::file::RootFile::for_tests());
        let mut leafy = named("TBranch", "pt");
        leafy.set("fBranches", Value::List(vec![]));
        let mut muon = named("TBranch", "muon");
        muon.set(
            "fBranches",
            Value::List(vec![leafy.into_value()]),
        );
        let mut event = named("TBranch", "event");
        event.set(
            "fBranches",
            Value::List(vec![muon.into_value()]),
        );
        vec![Branch::from_object(
            Arc::new(event),
            file,
            "/tree/event".into(),
        )]
    }

    #[test]
    fn filters_parse_into_the_three_shapes() {
        assert!(matches!(Filter::parse("exact").unwrap(), Filter::Exact(_)));
        assert!(matches!(Filter::parse("mu*_pt").unwrap(), Filter::Glob(_)));
        assert!(matches!(Filter::parse("/^mu.*/i").unwrap(), Filter::Regex(_)));

        assert!(Filter::parse("mu*").unwrap().matches("muon_pt"));
        assert!(!Filter::parse("mu*").unwrap().matches("electron"));
        assert!(Filter::parse("/^MU.*/i").unwrap().matches("muon"));
        assert!(!Filter::parse("/^mu.*/").unwrap().matches("admural"));
        assert!(Filter::parse("m?on").unwrap().matches("muon"));
        assert!(Filter::All.matches("anything"));
    }

    #[test]
    fn glob_translation_escapes_regex_metacharacters() {
        assert_eq!(glob_to_regex("a.b*"), "^a\\.b.*$");
        assert!(Regex::new(&glob_to_regex("x[ab]y")).unwrap().is_match("xay"));
        assert!(!Regex::new(&glob_to_regex("x[!ab]y")).unwrap().is_match("xay"));
    }

    #[test]
    fn branch_lookup_by_path_and_recursion() {
        let branches = branch_tree();
        assert_eq!(
            lookup_branch(&branches, "pt").unwrap().name(),
            "pt" // recursive first match
        );
        assert_eq!(
            lookup_branch(&branches, "event/muon/pt").unwrap().name(),
            "pt"
        );
        assert_eq!(
            lookup_branch(&branches, "event//muon///pt").unwrap().name(),
            "pt"
        );
        // leading slash means direct children only
        assert!(lookup_branch(&branches, "/pt").is_none());
        assert!(lookup_branch(&branches, "/event").is_some());
        assert!(lookup_branch(&branches, "nope").is_none());
    }

    #[test]
    fn embedded_basket_array_round_trip() {
        let branch = branch_with_embedded_basket(&[5, 6, 7, 8]);
        assert_eq!(branch.entry_offsets().unwrap(), vec![0, 4]);

        let array = branch.array().unwrap();
        assert_eq!(
            *array,
            Array::Numeric(PrimitiveArray::I32(vec![5, 6, 7, 8]))
        );

        let middle = branch.array_range(1, 3).unwrap();
        assert_eq!(*middle, Array::Numeric(PrimitiveArray::I32(vec![6, 7])));
    }

    #[test]
    fn empty_range_reads_no_basket_at_all() {
        let branch = branch_with_embedded_basket(&[1, 2, 3]);
        assert_eq!(branch.array_range(2, 2).unwrap().num_entries(), 0);
        // an inverted range is just as empty
        assert_eq!(branch.array_range(3, 1).unwrap().num_entries(), 0);
    }

    #[test]
    fn interpretation_is_inferred_from_the_leaf() {
        let branch = branch_with_embedded_basket(&[1]);
        match branch.interpretation().unwrap() {
            Interpretation::Dtype(d) => assert_eq!(d.kind, NumKind::I32),
            other => panic!("unexpected interpretation {:?}", other),
        }
        assert_eq!(branch.typename(), "int32_t");
    }
}
