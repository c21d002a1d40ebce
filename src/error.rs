use std::ops::Range;

use thiserror::Error;

/// Everything that can go wrong while opening a file or materializing data
/// from it.
///
/// `UnknownInterpretation` is deliberately *not* here: failing to infer an
/// interpretation for one branch leaves the branch holding the reason as a
/// value while the rest of the tree stays readable
/// ([`crate::interpretation::UnknownInterpretation`]).
#[derive(Debug, Error)]
pub enum Error {
    /// I/O or network failure while fetching a byte range.
    #[error("cannot read bytes {}..{} of {path}: {source}", range.start, range.end)]
    Source {
        path: String,
        range: Range<u64>,
        #[source]
        source: std::io::Error,
    },

    /// New requests against a source that has been closed.
    #[error("file {path} is closed")]
    Closed { path: String },

    /// The bytes do not look like the format at all: bad magic, truncated
    /// header, declared sizes that disagree with the actual byte ranges.
    #[error("{reason} in file {path}")]
    Format { reason: String, path: String },

    /// A structured read went off the rails: a declared byte count did not
    /// match cursor movement, a back-reference pointed nowhere, or a basket
    /// buffer had the wrong size for its interpretation.
    #[error("while reading {context} at seek position {position}: {reason} in file {path}")]
    Deserialization {
        reason: String,
        context: String,
        position: u64,
        path: String,
    },

    /// A named object is absent from a directory or branch listing.
    #[error("object {key:?} with cycle {cycle} not found in file {path} at {object_path:?}")]
    KeyNotFound {
        key: String,
        /// The requested cycle number, or `"any"`.
        cycle: String,
        path: String,
        object_path: String,
    },

    /// Data uses a corner of the format this reader refuses to guess at
    /// (memberwise collections, legacy compression, exotic STL shapes).
    #[error("{feature} is not supported in file {path}")]
    Unsupported { feature: String, path: String },
}

impl Error {
    pub(crate) fn deserialization(
        reason: impl Into<String>,
        context: impl Into<String>,
        position: u64,
        path: impl Into<String>,
    ) -> Self {
        Error::Deserialization {
            reason: reason.into(),
            context: context.into(),
            position,
            path: path.into(),
        }
    }

    /// True for errors the schema-recovery retry is allowed to catch.
    pub fn is_deserialization(&self) -> bool {
        matches!(self, Error::Deserialization { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
