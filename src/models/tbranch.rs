//! Versioned readers for TBranch (versions 10 through 13).
//!
//! The basket bookkeeping arrays at the tail are speedbump-guarded counted
//! arrays; the `fBasketSeek` speedbump byte doubles as an element-width
//! selector (2 means 64-bit seeks).

use binrw::BinRead;

use crate::chunk::{Chunk, Cursor};
use crate::error::{Error, Result};
use crate::model::{
    begin_object, finish_object, read_class, AnyObject, BuiltinClass, ReadContext, Value,
};
use crate::primitive::NumKind;

#[derive(BinRead)]
#[br(big)]
struct Branch10Fixed {
    compress: i32,
    basket_size: i32,
    entry_offset_len: i32,
    write_basket: i32,
    entry_number: i64,
    offset: i32,
    max_baskets: i32,
    split_level: i32,
    entries: i64,
    tot_bytes: i64,
    zip_bytes: i64,
}

#[derive(BinRead)]
#[br(big)]
struct Branch11Fixed {
    compress: i32,
    basket_size: i32,
    entry_offset_len: i32,
    write_basket: i32,
    entry_number: i64,
    offset: i32,
    max_baskets: i32,
    split_level: i32,
    entries: i64,
    first_entry: i64,
    tot_bytes: i64,
    zip_bytes: i64,
}

#[derive(BinRead)]
#[br(big)]
struct Branch13Head {
    compress: i32,
    basket_size: i32,
    entry_offset_len: i32,
    write_basket: i32,
    entry_number: i64,
}

#[derive(BinRead)]
#[br(big)]
struct Branch13Tail {
    offset: i32,
    max_baskets: i32,
    split_level: i32,
    entries: i64,
    first_entry: i64,
    tot_bytes: i64,
    zip_bytes: i64,
}

fn read_tbranch(chunk: &Chunk, cursor: &mut Cursor, ctx: &mut ReadContext) -> Result<Value> {
    let outer = ctx.in_branch;
    ctx.in_branch = true;
    let out = read_tbranch_members(chunk, cursor, ctx);
    ctx.in_branch = outer;
    out
}

fn read_tbranch_members(chunk: &Chunk, cursor: &mut Cursor, ctx: &mut ReadContext) -> Result<Value> {
    let header = begin_object(chunk, cursor, ctx, None)?;
    let version = header.instance_version;
    if !(10..=13).contains(&version) {
        return Err(Error::Unsupported {
            feature: format!("TBranch version {}", version),
            path: ctx.file.file_path().to_string(),
        });
    }

    let mut obj = AnyObject::new("TBranch", version);
    if let Value::Object(base) = read_class("TNamed", chunk, cursor, ctx)? {
        obj.bases.push(*base);
    }
    if let Value::Object(base) = read_class("TAttFill", chunk, cursor, ctx)? {
        obj.bases.push(*base);
    }

    let max_baskets;
    match version {
        10 => {
            let f = cursor.field::<Branch10Fixed>(chunk)?;
            max_baskets = f.max_baskets.max(0) as usize;
            obj.set("fCompress", Value::I32(f.compress));
            obj.set("fBasketSize", Value::I32(f.basket_size));
            obj.set("fEntryOffsetLen", Value::I32(f.entry_offset_len));
            obj.set("fWriteBasket", Value::I32(f.write_basket));
            obj.set("fEntryNumber", Value::I64(f.entry_number));
            obj.set("fOffset", Value::I32(f.offset));
            obj.set("fMaxBaskets", Value::I32(f.max_baskets));
            obj.set("fSplitLevel", Value::I32(f.split_level));
            obj.set("fEntries", Value::I64(f.entries));
            obj.set("fTotBytes", Value::I64(f.tot_bytes));
            obj.set("fZipBytes", Value::I64(f.zip_bytes));
        }
        11 | 12 => {
            let f = cursor.field::<Branch11Fixed>(chunk)?;
            max_baskets = f.max_baskets.max(0) as usize;
            obj.set("fCompress", Value::I32(f.compress));
            obj.set("fBasketSize", Value::I32(f.basket_size));
            obj.set("fEntryOffsetLen", Value::I32(f.entry_offset_len));
            obj.set("fWriteBasket", Value::I32(f.write_basket));
            obj.set("fEntryNumber", Value::I64(f.entry_number));
            obj.set("fOffset", Value::I32(f.offset));
            obj.set("fMaxBaskets", Value::I32(f.max_baskets));
            obj.set("fSplitLevel", Value::I32(f.split_level));
            obj.set("fEntries", Value::I64(f.entries));
            obj.set("fFirstEntry", Value::I64(f.first_entry));
            obj.set("fTotBytes", Value::I64(f.tot_bytes));
            obj.set("fZipBytes", Value::I64(f.zip_bytes));
        }
        13 => {
            let f = cursor.field::<Branch13Head>(chunk)?;
            obj.set("fCompress", Value::I32(f.compress));
            obj.set("fBasketSize", Value::I32(f.basket_size));
            obj.set("fEntryOffsetLen", Value::I32(f.entry_offset_len));
            obj.set("fWriteBasket", Value::I32(f.write_basket));
            obj.set("fEntryNumber", Value::I64(f.entry_number));
            obj.set(
                "fIOFeatures",
                read_class("ROOT::TIOFeatures", chunk, cursor, ctx)?,
            );
            let f = cursor.field::<Branch13Tail>(chunk)?;
            max_baskets = f.max_baskets.max(0) as usize;
            obj.set("fOffset", Value::I32(f.offset));
            obj.set("fMaxBaskets", Value::I32(f.max_baskets));
            obj.set("fSplitLevel", Value::I32(f.split_level));
            obj.set("fEntries", Value::I64(f.entries));
            obj.set("fFirstEntry", Value::I64(f.first_entry));
            obj.set("fTotBytes", Value::I64(f.tot_bytes));
            obj.set("fZipBytes", Value::I64(f.zip_bytes));
        }
        _ => unreachable!(),
    }

    obj.set("fBranches", read_class("TObjArray", chunk, cursor, ctx)?);
    obj.set("fLeaves", read_class("TObjArray", chunk, cursor, ctx)?);

    // Embedded baskets were flushed without speedbumps.
    let outer_speedbump = ctx.speedbump;
    ctx.speedbump = false;
    let baskets = read_class("TObjArray", chunk, cursor, ctx);
    ctx.speedbump = outer_speedbump;
    obj.set("fBaskets", baskets?);

    if ctx.speedbump {
        cursor.skip(1);
    }
    obj.set(
        "fBasketBytes",
        Value::Array(cursor.array(chunk, max_baskets, NumKind::I32)?),
    );
    if ctx.speedbump {
        cursor.skip(1);
    }
    obj.set(
        "fBasketEntry",
        Value::Array(cursor.array(chunk, max_baskets, NumKind::I64)?),
    );

    if ctx.speedbump {
        // This byte selects 32- vs 64-bit seeks for streamer-described
        // branches; the built-in layouts are 64-bit in every version here.
        cursor.skip(1);
    }
    obj.set(
        "fBasketSeek",
        Value::Array(cursor.array(chunk, max_baskets, NumKind::I64)?),
    );

    obj.set("fFileName", read_class("TString", chunk, cursor, ctx)?);

    finish_object(chunk, cursor, ctx, &header, "TBranch")?;
    Ok(obj.into_value())
}

/// TBranchElement extends TBranch with streamer bookkeeping; only the
/// members the interpretation layer consults are kept.
fn read_tbranch_element(
    chunk: &Chunk,
    cursor: &mut Cursor,
    ctx: &mut ReadContext,
) -> Result<Value> {
    let header = begin_object(chunk, cursor, ctx, None)?;
    let version = header.instance_version;
    if !(8..=10).contains(&version) {
        return Err(Error::Unsupported {
            feature: format!("TBranchElement version {}", version),
            path: ctx.file.file_path().to_string(),
        });
    }

    let mut obj = AnyObject::new("TBranchElement", version);
    if let Value::Object(base) = read_tbranch_core(chunk, cursor, ctx)? {
        obj.bases.push(*base);
    }

    obj.set("fClassName", read_class("TString", chunk, cursor, ctx)?);
    obj.set("fParentName", read_class("TString", chunk, cursor, ctx)?);
    obj.set("fClonesName", read_class("TString", chunk, cursor, ctx)?);
    let fixed = cursor.field::<BranchElementFixed>(chunk)?;
    obj.set("fCheckSum", Value::U32(fixed.checksum));
    obj.set("fClassVersion", Value::I16(fixed.class_version));
    obj.set("fID", Value::I32(fixed.id));
    obj.set("fType", Value::I32(fixed.branch_type));
    obj.set("fStreamerType", Value::I32(fixed.streamer_type));
    if version >= 9 {
        obj.set("fMaximum", Value::I32(cursor.field::<i32>(chunk)?));
        obj.set("fBranchCount", crate::deserialization::read_object_any(chunk, cursor, ctx)?);
        obj.set("fBranchCount2", crate::deserialization::read_object_any(chunk, cursor, ctx)?);
    }

    finish_object(chunk, cursor, ctx, &header, "TBranchElement")?;
    Ok(obj.into_value())
}

#[derive(BinRead)]
#[br(big)]
struct BranchElementFixed {
    checksum: u32,
    class_version: i16,
    id: i32,
    branch_type: i32,
    streamer_type: i32,
}

/// The TBranch superclass part inside a TBranchElement, which carries its
/// own byte-count/version frame.
fn read_tbranch_core(chunk: &Chunk, cursor: &mut Cursor, ctx: &mut ReadContext) -> Result<Value> {
    read_class("TBranch", chunk, cursor, ctx)
}

pub static TBRANCH: BuiltinClass = BuiltinClass {
    classname: "TBranch",
    read: read_tbranch,
};
pub static TBRANCH_ELEMENT: BuiltinClass = BuiltinClass {
    classname: "TBranchElement",
    read: read_tbranch_element,
};
