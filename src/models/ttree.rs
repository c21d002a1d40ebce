//! Versioned readers for TTree (versions 16 through 20) and the
//! ROOT::TIOFeatures blob that v20 embeds.

use binrw::BinRead;

use crate::chunk::{Chunk, Cursor};
use crate::deserialization::read_object_any;
use crate::error::{Error, Result};
use crate::model::{
    begin_object, finish_object, read_class, AnyObject, BuiltinClass, ReadContext, Value,
};
use crate::primitive::NumKind;

#[derive(BinRead)]
#[br(big)]
struct Tree16Fixed {
    entries: i64,
    tot_bytes: i64,
    zip_bytes: i64,
    saved_bytes: i64,
    weight: f64,
    timer_interval: i32,
    scan_field: i32,
    update: i32,
    max_entries: i64,
    max_entry_loop: i64,
    max_virtual_size: i64,
    auto_save: i64,
    estimate: i64,
}

#[derive(BinRead)]
#[br(big)]
struct Tree17Fixed {
    entries: i64,
    tot_bytes: i64,
    zip_bytes: i64,
    saved_bytes: i64,
    weight: f64,
    timer_interval: i32,
    scan_field: i32,
    update: i32,
    default_entry_offset_len: i32,
    max_entries: i64,
    max_entry_loop: i64,
    max_virtual_size: i64,
    auto_save: i64,
    estimate: i64,
}

#[derive(BinRead)]
#[br(big)]
struct Tree18Fixed {
    entries: i64,
    tot_bytes: i64,
    zip_bytes: i64,
    saved_bytes: i64,
    flushed_bytes: i64,
    weight: f64,
    timer_interval: i32,
    scan_field: i32,
    update: i32,
    default_entry_offset_len: i32,
    max_entries: i64,
    max_entry_loop: i64,
    max_virtual_size: i64,
    auto_save: i64,
    auto_flush: i64,
    estimate: i64,
}

#[derive(BinRead)]
#[br(big)]
struct Tree19Fixed {
    entries: i64,
    tot_bytes: i64,
    zip_bytes: i64,
    saved_bytes: i64,
    flushed_bytes: i64,
    weight: f64,
    timer_interval: i32,
    scan_field: i32,
    update: i32,
    default_entry_offset_len: i32,
    n_cluster_range: u32,
    max_entries: i64,
    max_entry_loop: i64,
    max_virtual_size: i64,
    auto_save: i64,
    auto_flush: i64,
    estimate: i64,
}

fn memberwise_refused(ctx: &ReadContext, classname: &str) -> Error {
    Error::Unsupported {
        feature: format!("memberwise serialization of {}", classname),
        path: ctx.file.file_path().to_string(),
    }
}

fn read_base(
    obj: &mut AnyObject,
    classname: &str,
    chunk: &Chunk,
    cursor: &mut Cursor,
    ctx: &mut ReadContext,
) -> Result<()> {
    if let Value::Object(base) = read_class(classname, chunk, cursor, ctx)? {
        obj.bases.push(*base);
    }
    Ok(())
}

/// Everything nested under a TTree may omit its byte-count headers; the
/// in-branch flag makes the header reader tolerate that.
fn read_ttree(chunk: &Chunk, cursor: &mut Cursor, ctx: &mut ReadContext) -> Result<Value> {
    let outer = ctx.in_branch;
    ctx.in_branch = true;
    let out = read_ttree_members(chunk, cursor, ctx);
    ctx.in_branch = outer;
    out
}

fn read_ttree_members(chunk: &Chunk, cursor: &mut Cursor, ctx: &mut ReadContext) -> Result<Value> {
    let header = begin_object(chunk, cursor, ctx, None)?;
    if header.is_memberwise {
        return Err(memberwise_refused(ctx, "TTree"));
    }
    let version = header.instance_version;
    if !(16..=20).contains(&version) {
        return Err(Error::Unsupported {
            feature: format!("TTree version {}", version),
            path: ctx.file.file_path().to_string(),
        });
    }

    let mut obj = AnyObject::new("TTree", version);
    read_base(&mut obj, "TNamed", chunk, cursor, ctx)?;
    read_base(&mut obj, "TAttLine", chunk, cursor, ctx)?;
    read_base(&mut obj, "TAttFill", chunk, cursor, ctx)?;
    read_base(&mut obj, "TAttMarker", chunk, cursor, ctx)?;

    match version {
        16 => {
            let f = cursor.field::<Tree16Fixed>(chunk)?;
            obj.set("fEntries", Value::I64(f.entries));
            obj.set("fTotBytes", Value::I64(f.tot_bytes));
            obj.set("fZipBytes", Value::I64(f.zip_bytes));
            obj.set("fSavedBytes", Value::I64(f.saved_bytes));
            obj.set("fWeight", Value::F64(f.weight));
            obj.set("fTimerInterval", Value::I32(f.timer_interval));
            obj.set("fScanField", Value::I32(f.scan_field));
            obj.set("fUpdate", Value::I32(f.update));
            obj.set("fMaxEntries", Value::I64(f.max_entries));
            obj.set("fMaxEntryLoop", Value::I64(f.max_entry_loop));
            obj.set("fMaxVirtualSize", Value::I64(f.max_virtual_size));
            obj.set("fAutoSave", Value::I64(f.auto_save));
            obj.set("fEstimate", Value::I64(f.estimate));
        }
        17 => {
            let f = cursor.field::<Tree17Fixed>(chunk)?;
            obj.set("fEntries", Value::I64(f.entries));
            obj.set("fTotBytes", Value::I64(f.tot_bytes));
            obj.set("fZipBytes", Value::I64(f.zip_bytes));
            obj.set("fSavedBytes", Value::I64(f.saved_bytes));
            obj.set("fWeight", Value::F64(f.weight));
            obj.set("fTimerInterval", Value::I32(f.timer_interval));
            obj.set("fScanField", Value::I32(f.scan_field));
            obj.set("fUpdate", Value::I32(f.update));
            obj.set(
                "fDefaultEntryOffsetLen",
                Value::I32(f.default_entry_offset_len),
            );
            obj.set("fMaxEntries", Value::I64(f.max_entries));
            obj.set("fMaxEntryLoop", Value::I64(f.max_entry_loop));
            obj.set("fMaxVirtualSize", Value::I64(f.max_virtual_size));
            obj.set("fAutoSave", Value::I64(f.auto_save));
            obj.set("fEstimate", Value::I64(f.estimate));
        }
        18 => {
            let f = cursor.field::<Tree18Fixed>(chunk)?;
            obj.set("fEntries", Value::I64(f.entries));
            obj.set("fTotBytes", Value::I64(f.tot_bytes));
            obj.set("fZipBytes", Value::I64(f.zip_bytes));
            obj.set("fSavedBytes", Value::I64(f.saved_bytes));
            obj.set("fFlushedBytes", Value::I64(f.flushed_bytes));
            obj.set("fWeight", Value::F64(f.weight));
            obj.set("fTimerInterval", Value::I32(f.timer_interval));
            obj.set("fScanField", Value::I32(f.scan_field));
            obj.set("fUpdate", Value::I32(f.update));
            obj.set(
                "fDefaultEntryOffsetLen",
                Value::I32(f.default_entry_offset_len),
            );
            obj.set("fMaxEntries", Value::I64(f.max_entries));
            obj.set("fMaxEntryLoop", Value::I64(f.max_entry_loop));
            obj.set("fMaxVirtualSize", Value::I64(f.max_virtual_size));
            obj.set("fAutoSave", Value::I64(f.auto_save));
            obj.set("fAutoFlush", Value::I64(f.auto_flush));
            obj.set("fEstimate", Value::I64(f.estimate));
        }
        19 | 20 => {
            let f = cursor.field::<Tree19Fixed>(chunk)?;
            obj.set("fEntries", Value::I64(f.entries));
            obj.set("fTotBytes", Value::I64(f.tot_bytes));
            obj.set("fZipBytes", Value::I64(f.zip_bytes));
            obj.set("fSavedBytes", Value::I64(f.saved_bytes));
            obj.set("fFlushedBytes", Value::I64(f.flushed_bytes));
            obj.set("fWeight", Value::F64(f.weight));
            obj.set("fTimerInterval", Value::I32(f.timer_interval));
            obj.set("fScanField", Value::I32(f.scan_field));
            obj.set("fUpdate", Value::I32(f.update));
            obj.set(
                "fDefaultEntryOffsetLen",
                Value::I32(f.default_entry_offset_len),
            );
            obj.set("fNClusterRange", Value::U32(f.n_cluster_range));
            obj.set("fMaxEntries", Value::I64(f.max_entries));
            obj.set("fMaxEntryLoop", Value::I64(f.max_entry_loop));
            obj.set("fMaxVirtualSize", Value::I64(f.max_virtual_size));
            obj.set("fAutoSave", Value::I64(f.auto_save));
            obj.set("fAutoFlush", Value::I64(f.auto_flush));
            obj.set("fEstimate", Value::I64(f.estimate));

            let n = f.n_cluster_range as usize;
            if ctx.speedbump {
                cursor.skip(1);
            }
            obj.set(
                "fClusterRangeEnd",
                Value::Array(cursor.array(chunk, n, NumKind::I64)?),
            );
            if ctx.speedbump {
                cursor.skip(1);
            }
            obj.set(
                "fClusterSize",
                Value::Array(cursor.array(chunk, n, NumKind::I64)?),
            );
        }
        _ => unreachable!(),
    }

    if version == 20 {
        obj.set(
            "fIOFeatures",
            read_class("ROOT::TIOFeatures", chunk, cursor, ctx)?,
        );
    }

    obj.set("fBranches", read_class("TObjArray", chunk, cursor, ctx)?);
    obj.set("fLeaves", read_class("TObjArray", chunk, cursor, ctx)?);
    obj.set("fAliases", read_object_any(chunk, cursor, ctx)?);

    let minimal = ctx.file.options().minimal_ttree_metadata;
    match (minimal, header.num_bytes) {
        (true, Some(num_bytes)) => {
            // nobody reads the index/friend members; jump to the end
            cursor.move_to((header.start.index() as i64 + num_bytes as i64) as u64);
        }
        _ => {
            obj.set("fIndexValues", read_class("TArrayD", chunk, cursor, ctx)?);
            obj.set("fIndex", read_class("TArrayI", chunk, cursor, ctx)?);
            obj.set("fTreeIndex", read_object_any(chunk, cursor, ctx)?);
            obj.set("fFriends", read_object_any(chunk, cursor, ctx)?);
            obj.set("fUserInfo", read_object_any(chunk, cursor, ctx)?);
            obj.set("fBranchRef", read_object_any(chunk, cursor, ctx)?);
        }
    }

    finish_object(chunk, cursor, ctx, &header, "TTree")?;
    Ok(obj.into_value())
}

fn read_tiofeatures(chunk: &Chunk, cursor: &mut Cursor, ctx: &mut ReadContext) -> Result<Value> {
    let header = begin_object(chunk, cursor, ctx, Some(1))?;
    if header.is_memberwise {
        return Err(memberwise_refused(ctx, "ROOT::TIOFeatures"));
    }
    cursor.skip(4);
    let mut obj = AnyObject::new("ROOT::TIOFeatures", header.instance_version);
    obj.set("fIOBits", Value::U8(cursor.field::<u8>(chunk)?));
    finish_object(chunk, cursor, ctx, &header, "ROOT::TIOFeatures")?;
    Ok(obj.into_value())
}

pub static TTREE: BuiltinClass = BuiltinClass {
    classname: "TTree",
    read: read_ttree,
};
pub static TIOFEATURES: BuiltinClass = BuiltinClass {
    classname: "ROOT::TIOFeatures",
    read: read_tiofeatures,
};
