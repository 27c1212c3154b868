//! In-memory reading, editing, and rewriting of PE (Portable Executable)
//! images.
//!
//! The crate revolves around two pieces: [`PeFile`], which owns the early
//! headers and the section list and can re-lay the image out and emit a
//! loadable file, and the [`rsrc`] module, which decodes a `.rsrc` section
//! into an editable [`ResourceTree`] and encodes it back, recomputing every
//! internal pointer.
//!
//! Callers supply bytes and consume bytes; there is no file I/O here.
//!
//! ```no_run
//! use pemend::{PeFile, Section, SectionFlags};
//!
//! # fn main() -> pemend::Result<()> {
//! # let input: Vec<u8> = Vec::new();
//! let mut pe = PeFile::parse(&input)?;
//! let mut extra = Section::new(".extra", SectionFlags::CNT_INITIALIZED_DATA)?;
//! extra.raw_data = b"payload".to_vec();
//! extra.virtual_size = extra.raw_data.len() as u32;
//! pe.malloc(extra, true)?;
//! let output = pe.write()?;
//! # let _ = output;
//! # Ok(())
//! # }
//! ```
//!
//! Scope: PE32 images with `SizeOfHeaders`-sized early headers and no
//! symbol table, per-section relocations, or line numbers.  Anything else
//! is rejected with a [`PeError`] diagnostic rather than rewritten wrongly.

mod bytes;
mod error;
mod image;
pub mod rsrc;
mod section;
mod span;

pub use error::{PeError, Result};
pub use image::{
    PeFile, DEFAULT_HEADERS_SIZE, OH_FILE_ALIGNMENT, OH_RESOURCE_TABLE_RVA,
    OH_RESOURCE_TABLE_SIZE, OH_SECTION_ALIGNMENT, OH_SIZE_OF_HEADERS, OH_SIZE_OF_IMAGE,
};
pub use rsrc::{DirectoryMeta, EncodeOrder, EntryHandle, EntryIdent, ResourceTree};
pub use section::{Section, SectionFlags};
