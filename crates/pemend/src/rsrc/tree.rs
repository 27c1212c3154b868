//! In-memory model of a `.rsrc` directory tree.
//!
//! Entries live in an arena owned by [`ResourceTree`]; handles are plain
//! indices and parents are back-handles, so the parent/child graph carries
//! no reference cycles.  An entry is either a directory (ordered children
//! plus directory metadata) or a data leaf (payload plus codepage) -- the
//! two cannot be mixed by construction.
//!
//! By convention the three levels below the root carry resource types,
//! names, and languages, but the tree itself only requires finiteness.

use core::fmt;

use crate::error::{PeError, Result};

/// Index of an entry inside its [`ResourceTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryHandle(pub(crate) usize);

/// The identity of a non-root entry: a UTF-16 name or a numeric ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryIdent {
    Name(String),
    Id(u32),
}

impl From<&str> for EntryIdent {
    fn from(name: &str) -> Self {
        Self::Name(name.to_owned())
    }
}

impl From<String> for EntryIdent {
    fn from(name: String) -> Self {
        Self::Name(name)
    }
}

impl From<u32> for EntryIdent {
    fn from(id: u32) -> Self {
        Self::Id(id)
    }
}

impl fmt::Display for EntryIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Name(name) => f.write_str(name),
            Self::Id(id) => write!(f, "{id}"),
        }
    }
}

/// Header fields of a resource directory table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirectoryMeta {
    pub characteristics: u32,
    pub timestamp: u32,
    pub version_major: u16,
    pub version_minor: u16,
}

#[derive(Debug, Clone)]
pub(crate) enum EntryBody {
    Directory {
        children: Vec<EntryHandle>,
        meta: DirectoryMeta,
    },
    Data {
        bytes: Vec<u8>,
        codepage: u32,
        reserved: u32,
    },
}

#[derive(Debug, Clone)]
pub(crate) struct Entry {
    pub(crate) parent: Option<EntryHandle>,
    /// `None` only for the synthetic root.
    pub(crate) ident: Option<EntryIdent>,
    pub(crate) body: EntryBody,
}

/// A decoded (or freshly built) resource tree.
///
/// Mutating operations mark the tree dirty; the container re-encodes a
/// dirty tree on emit and clears the flag.
#[derive(Debug, Clone)]
pub struct ResourceTree {
    pub(crate) entries: Vec<Entry>,
    pub(crate) dirty: bool,
}

impl Default for ResourceTree {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceTree {
    /// An empty tree: just the root directory.
    pub fn new() -> Self {
        Self {
            entries: vec![Entry {
                parent: None,
                ident: None,
                body: EntryBody::Directory {
                    children: Vec::new(),
                    meta: DirectoryMeta::default(),
                },
            }],
            dirty: false,
        }
    }

    pub fn root(&self) -> EntryHandle {
        EntryHandle(0)
    }

    /// True when a mutation has happened since decode (or the last emit).
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    // -- structure ----------------------------------------------------------

    /// Append a subdirectory to `parent`'s children.
    pub fn add_directory(
        &mut self,
        parent: EntryHandle,
        ident: impl Into<EntryIdent>,
    ) -> Result<EntryHandle> {
        let handle = self.push_entry(
            parent,
            ident.into(),
            EntryBody::Directory {
                children: Vec::new(),
                meta: DirectoryMeta::default(),
            },
        )?;
        self.dirty = true;
        Ok(handle)
    }

    /// Append a data leaf to `parent`'s children.
    pub fn add_data(
        &mut self,
        parent: EntryHandle,
        ident: impl Into<EntryIdent>,
        bytes: Vec<u8>,
        codepage: u32,
    ) -> Result<EntryHandle> {
        let handle = self.push_entry(
            parent,
            ident.into(),
            EntryBody::Data {
                bytes,
                codepage,
                reserved: 0,
            },
        )?;
        self.dirty = true;
        Ok(handle)
    }

    /// Unlink an entry from its parent directory.  The arena slot stays
    /// behind so existing handles keep resolving; the entry is simply no
    /// longer reachable or encoded.
    pub fn detach(&mut self, handle: EntryHandle) -> Result<()> {
        let parent = self.entries[handle.0].parent.ok_or_else(|| {
            PeError::ResourceShapeInvalid("the root entry cannot be detached".into())
        })?;
        if let EntryBody::Directory { children, .. } = &mut self.entries[parent.0].body {
            children.retain(|&c| c != handle);
        }
        self.entries[handle.0].parent = None;
        self.dirty = true;
        Ok(())
    }

    fn push_entry(
        &mut self,
        parent: EntryHandle,
        ident: EntryIdent,
        body: EntryBody,
    ) -> Result<EntryHandle> {
        if !self.is_directory(parent) {
            return Err(PeError::ResourceShapeInvalid(
                "cannot add children to a data entry".into(),
            ));
        }
        let handle = EntryHandle(self.entries.len());
        self.entries.push(Entry {
            parent: Some(parent),
            ident: Some(ident),
            body,
        });
        if let EntryBody::Directory { children, .. } = &mut self.entries[parent.0].body {
            children.push(handle);
        }
        Ok(handle)
    }

    /// Used by the decoder, which fills in metadata and reserved fields the
    /// public constructors default.
    pub(crate) fn push_raw(
        &mut self,
        parent: EntryHandle,
        ident: EntryIdent,
        body: EntryBody,
    ) -> Result<EntryHandle> {
        self.push_entry(parent, ident, body)
    }

    // -- queries ------------------------------------------------------------

    /// Children of a directory, in insertion order.  Empty for data leaves.
    pub fn children(&self, handle: EntryHandle) -> &[EntryHandle] {
        match &self.entries[handle.0].body {
            EntryBody::Directory { children, .. } => children,
            EntryBody::Data { .. } => &[],
        }
    }

    pub fn is_directory(&self, handle: EntryHandle) -> bool {
        matches!(self.entries[handle.0].body, EntryBody::Directory { .. })
    }

    /// The entry's identity; `None` for the root.
    pub fn ident(&self, handle: EntryHandle) -> Option<&EntryIdent> {
        self.entries[handle.0].ident.as_ref()
    }

    pub fn parent(&self, handle: EntryHandle) -> Option<EntryHandle> {
        self.entries[handle.0].parent
    }

    /// Data payload of a leaf; `None` for directories.
    pub fn data(&self, handle: EntryHandle) -> Option<&[u8]> {
        match &self.entries[handle.0].body {
            EntryBody::Data { bytes, .. } => Some(bytes),
            EntryBody::Directory { .. } => None,
        }
    }

    pub fn data_codepage(&self, handle: EntryHandle) -> Option<u32> {
        match &self.entries[handle.0].body {
            EntryBody::Data { codepage, .. } => Some(*codepage),
            EntryBody::Directory { .. } => None,
        }
    }

    pub fn data_reserved(&self, handle: EntryHandle) -> Option<u32> {
        match &self.entries[handle.0].body {
            EntryBody::Data { reserved, .. } => Some(*reserved),
            EntryBody::Directory { .. } => None,
        }
    }

    pub fn directory_meta(&self, handle: EntryHandle) -> Option<&DirectoryMeta> {
        match &self.entries[handle.0].body {
            EntryBody::Directory { meta, .. } => Some(meta),
            EntryBody::Data { .. } => None,
        }
    }

    /// Replace a leaf's payload.
    pub fn set_data(&mut self, handle: EntryHandle, bytes: Vec<u8>) -> Result<()> {
        match &mut self.entries[handle.0].body {
            EntryBody::Data { bytes: slot, .. } => {
                *slot = bytes;
                self.dirty = true;
                Ok(())
            }
            EntryBody::Directory { .. } => Err(PeError::ResourceShapeInvalid(
                "cannot set data on a directory entry".into(),
            )),
        }
    }

    /// Replace a directory's header metadata.
    pub fn set_directory_meta(&mut self, handle: EntryHandle, meta: DirectoryMeta) -> Result<()> {
        match &mut self.entries[handle.0].body {
            EntryBody::Directory { meta: slot, .. } => {
                *slot = meta;
                self.dirty = true;
                Ok(())
            }
            EntryBody::Data { .. } => Err(PeError::ResourceShapeInvalid(
                "cannot set directory metadata on a data entry".into(),
            )),
        }
    }

    pub(crate) fn set_meta_raw(&mut self, handle: EntryHandle, new: DirectoryMeta) {
        if let EntryBody::Directory { meta, .. } = &mut self.entries[handle.0].body {
            *meta = new;
        }
    }

    /// Linear scan of a directory's children for the given identity.
    pub fn get_child(
        &self,
        parent: EntryHandle,
        ident: impl Into<EntryIdent>,
    ) -> Option<EntryHandle> {
        let ident = ident.into();
        self.children(parent)
            .iter()
            .copied()
            .find(|&child| self.entries[child.0].ident.as_ref() == Some(&ident))
    }

    pub fn has_child(&self, parent: EntryHandle, ident: impl Into<EntryIdent>) -> bool {
        self.get_child(parent, ident).is_some()
    }

    // -- paths --------------------------------------------------------------

    /// Resolve `"a/b/c"` from the root.  At each segment a name match is
    /// tried first; if the segment parses as a `u32`, an ID match follows.
    pub fn get_entry_from_path(&self, path: &str) -> Result<EntryHandle> {
        let mut current = self.root();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            if !self.is_directory(current) {
                return Err(PeError::PathNotADirectory(path.to_owned()));
            }
            let mut next = self.get_child(current, segment);
            if next.is_none() {
                if let Ok(id) = segment.parse::<u32>() {
                    next = self.get_child(current, id);
                }
            }
            current = next.ok_or_else(|| PeError::PathNotFound(path.to_owned()))?;
        }
        Ok(current)
    }

    /// The `/`-joined identities from the root down to `handle`.  Empty for
    /// the root itself.
    pub fn entry_path(&self, handle: EntryHandle) -> String {
        let mut segments = Vec::new();
        let mut current = Some(handle);
        while let Some(h) = current {
            if let Some(ident) = &self.entries[h.0].ident {
                segments.push(ident.to_string());
            }
            current = self.entries[h.0].parent;
        }
        segments.reverse();
        segments.join("/")
    }

    /// Number of live entries, root included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.len() == 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ResourceTree {
        let mut tree = ResourceTree::new();
        let icons = tree.add_directory(tree.root(), 3u32).unwrap();
        let named = tree.add_directory(tree.root(), "BRAND").unwrap();
        let icon_one = tree.add_directory(icons, 1u32).unwrap();
        tree.add_data(icon_one, 1033u32, vec![1, 2, 3], 0).unwrap();
        tree.add_data(named, "LOGO", vec![9, 9], 1252).unwrap();
        tree
    }

    #[test]
    fn children_keep_insertion_order() {
        let mut tree = ResourceTree::new();
        let a = tree.add_directory(tree.root(), 10u32).unwrap();
        let b = tree.add_directory(tree.root(), "NAMED").unwrap();
        let c = tree.add_directory(tree.root(), 2u32).unwrap();
        assert_eq!(tree.children(tree.root()), &[a, b, c]);
    }

    #[test]
    fn get_child_matches_identity_kind() {
        let tree = sample();
        assert!(tree.get_child(tree.root(), 3u32).is_some());
        assert!(tree.get_child(tree.root(), "BRAND").is_some());
        assert!(tree.get_child(tree.root(), "3").is_none(), "name must not match an ID");
        assert!(tree.get_child(tree.root(), 99u32).is_none());
    }

    #[test]
    fn data_entries_reject_children() {
        let mut tree = sample();
        let leaf = tree.get_entry_from_path("BRAND/LOGO").unwrap();
        let err = tree.add_directory(leaf, 1u32).unwrap_err();
        assert!(matches!(err, PeError::ResourceShapeInvalid(_)));
        // the failed push must not leak an arena slot into the parent
        assert!(tree.children(leaf).is_empty());
    }

    #[test]
    fn path_lookup_tries_name_then_id() {
        let tree = sample();
        let leaf = tree.get_entry_from_path("3/1/1033").unwrap();
        assert_eq!(tree.data(leaf), Some(&[1u8, 2, 3][..]));
        assert_eq!(tree.entry_path(leaf), "3/1/1033");

        assert_eq!(
            tree.get_entry_from_path("3/1/9999"),
            Err(PeError::PathNotFound("3/1/9999".into()))
        );
        assert_eq!(
            tree.get_entry_from_path("BRAND/LOGO/1"),
            Err(PeError::PathNotADirectory("BRAND/LOGO/1".into()))
        );
    }

    #[test]
    fn empty_path_is_the_root() {
        let tree = sample();
        assert_eq!(tree.get_entry_from_path("").unwrap(), tree.root());
        assert_eq!(tree.entry_path(tree.root()), "");
    }

    #[test]
    fn mutation_marks_dirty() {
        let mut tree = ResourceTree::new();
        assert!(!tree.is_dirty());
        tree.add_directory(tree.root(), 1u32).unwrap();
        assert!(tree.is_dirty());
        tree.clear_dirty();

        let dir = tree.get_child(tree.root(), 1u32).unwrap();
        let leaf = tree.add_data(dir, 1033u32, vec![0], 0).unwrap();
        tree.clear_dirty();
        tree.set_data(leaf, vec![1, 2]).unwrap();
        assert!(tree.is_dirty());
    }

    #[test]
    fn detach_unlinks_but_keeps_handles_valid() {
        let mut tree = sample();
        let icons = tree.get_entry_from_path("3").unwrap();
        tree.detach(icons).unwrap();
        assert!(tree.get_child(tree.root(), 3u32).is_none());
        assert!(tree.is_directory(icons), "detached handle still resolves");
        assert!(tree.detach(tree.root()).is_err());
    }
}
