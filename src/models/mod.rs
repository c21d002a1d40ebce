//! Hand-written readers for the classes the library must understand before
//! it can read anything else, plus the TTree machinery classes.

use std::collections::HashMap;

use crate::model::{BuiltinClass, ClassDef};

pub mod collections;
pub mod common;
pub mod rntuple;
pub mod tbasket;
pub mod tbranch;
pub mod tleaf;
pub mod ttree;

/// Seed map for the global class registry.
pub fn bootstrap_classes() -> HashMap<String, ClassDef> {
    let builtins: &[&'static BuiltinClass] = &[
        &common::TOBJECT,
        &common::TSTRING,
        &common::TNAMED,
        &common::TOBJSTRING,
        &common::TATTLINE,
        &common::TATTFILL,
        &common::TATTMARKER,
        &collections::TLIST,
        &collections::THASHLIST,
        &collections::TOBJARRAY,
        &collections::TARRAYC,
        &collections::TARRAYS,
        &collections::TARRAYI,
        &collections::TARRAYL,
        &collections::TARRAYL64,
        &collections::TARRAYF,
        &collections::TARRAYD,
        &ttree::TTREE,
        &ttree::TIOFEATURES,
        &tbranch::TBRANCH,
        &tbranch::TBRANCH_ELEMENT,
        &tleaf::TLEAF,
        &tleaf::TLEAF_O,
        &tleaf::TLEAF_B,
        &tleaf::TLEAF_S,
        &tleaf::TLEAF_I,
        &tleaf::TLEAF_L,
        &tleaf::TLEAF_F,
        &tleaf::TLEAF_D,
        &tleaf::TLEAF_C,
        &tleaf::TLEAF_ELEMENT,
        &tbasket::TBASKET,
        &rntuple::RNTUPLE,
        &crate::streamers::TSTREAMER_INFO,
        &crate::streamers::TSTREAMER_ELEMENT,
        &crate::streamers::TSTREAMER_ARTIFICIAL,
        &crate::streamers::TSTREAMER_BASE,
        &crate::streamers::TSTREAMER_BASIC_POINTER,
        &crate::streamers::TSTREAMER_BASIC_TYPE,
        &crate::streamers::TSTREAMER_LOOP,
        &crate::streamers::TSTREAMER_OBJECT,
        &crate::streamers::TSTREAMER_OBJECT_ANY,
        &crate::streamers::TSTREAMER_OBJECT_ANY_POINTER,
        &crate::streamers::TSTREAMER_OBJECT_POINTER,
        &crate::streamers::TSTREAMER_STL,
        &crate::streamers::TSTREAMER_STL_STRING,
        &crate::streamers::TSTREAMER_STRING,
    ];

    builtins
        .iter()
        .map(|builtin| (builtin.classname.to_string(), ClassDef::Builtin(*builtin)))
        .collect()
}
