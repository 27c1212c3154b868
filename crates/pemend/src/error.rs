//! Error type shared across the crate.
//!
//! Every failure is fatal to the operation that raised it and surfaces to
//! the caller unchanged; operations that rewrite container state stage
//! their changes and commit only on success.

use thiserror::Error;

pub type Result<T> = core::result::Result<T, PeError>;

/// Errors raised while parsing, editing, or emitting a PE image.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PeError {
    /// The input is not a PE image: bad signature or truncated header.
    #[error("not a PE image: {0}")]
    NotAPE(String),

    /// The image carries a COFF symbol table, which this crate refuses to
    /// rewrite.
    #[error("image carries a COFF symbol table")]
    SymbolTablePresent,

    /// SizeOfOptionalHeader is below the PE32 minimum of 0x78 bytes.
    #[error("optional header too small: {0:#x} bytes")]
    OptionalHeaderTooSmall(u16),

    /// The optional header is not PE32 (magic 0x010B).
    #[error("unsupported optional header magic {0:#06x}, only PE32 is handled")]
    UnsupportedOptionalMagic(u16),

    /// SizeOfHeaders disagrees with the early-header size the caller asked
    /// for.
    #[error("SizeOfHeaders is {found:#x}, expected {expected:#x}")]
    HeadersSizeMismatch { expected: u32, found: u32 },

    /// A section header declares COFF relocations.
    #[error("section {0} carries relocations")]
    RelocationsPresent(String),

    /// A section header declares COFF line numbers.
    #[error("section {0} carries line numbers")]
    LineNumbersPresent(String),

    /// Two sections overlap in virtual address space.
    #[error("section {0} overlaps the preceding section in virtual space")]
    SectionRvaOverlap(String),

    /// The resource tree or its byte form is not encodable/walkable.
    #[error("malformed resource tree: {0}")]
    ResourceShapeInvalid(String),

    /// A resource operation was requested on an image without a `.rsrc`
    /// section.
    #[error("image has no resource section")]
    ResourceMissing,

    /// No resource entry exists at the given path.
    #[error("no resource entry at {0:?}")]
    PathNotFound(String),

    /// A path descends through a data entry.
    #[error("resource path {0:?} descends through a data entry")]
    PathNotADirectory(String),

    /// A section tag exceeds the 8 bytes a section header can hold.
    #[error("section tag {0:?} exceeds 8 bytes")]
    TagTooLong(String),

    /// An optional-header accessor was given an offset outside the header.
    #[error("offset {0:#x} is outside the optional header")]
    HeaderOffsetOutOfRange(u32),

    /// The early header has no room left for the section table.
    #[error("section table needs {needed:#x} bytes of header space, {available:#x} available")]
    NotEnoughHeaderSpace { needed: u32, available: u32 },
}
