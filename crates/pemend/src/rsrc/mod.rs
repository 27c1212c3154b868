//! Windows resource (`.rsrc`) subtree: the in-memory tree model and the
//! codec that moves it in and out of section bytes.

mod codec;
mod tree;

pub use codec::{decode, encode, shift, EncodeOrder};
pub use tree::{DirectoryMeta, EntryHandle, EntryIdent, ResourceTree};
