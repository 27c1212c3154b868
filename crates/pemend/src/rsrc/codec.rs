//! Codec between `.rsrc` section bytes and [`ResourceTree`].
//!
//! A resource section is four regions laid out back to back: directory
//! tables, 16-byte data entries, length-prefixed UTF-16 strings, and the
//! concatenated data payloads.  Directory child words and string words hold
//! offsets from the section start (high bit = subdirectory / string); the
//! pointer inside each data entry is an absolute image RVA, which is why
//! relocating the section means walking the tables and patching exactly
//! those fields ([`shift`]).

use std::collections::VecDeque;

use indexmap::IndexMap;
use log::{debug, trace};

use crate::bytes::{put_u16, put_u32, read_u16, read_u32, Reader};
use crate::error::{PeError, Result};
use crate::rsrc::tree::{DirectoryMeta, EntryBody, EntryHandle, EntryIdent, ResourceTree};

const DIR_HEADER_SIZE: usize = 16;
const DIR_ENTRY_SIZE: usize = 8;
const DATA_ENTRY_SIZE: usize = 16;

/// High bit of a child's name word: the low 31 bits point at a string.
const STRING_FLAG: u32 = 0x8000_0000;
/// High bit of a child's data word: the low 31 bits point at a directory.
const SUBDIR_FLAG: u32 = 0x8000_0000;
const OFFSET_MASK: u32 = 0x7FFF_FFFF;

/// Directory nesting bound; genuine resource trees are three levels deep,
/// anything past this is a cycle in malformed input.
const MAX_DEPTH: u32 = 32;

/// Order of a directory's children in the encoded table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncodeOrder {
    /// Named children first, then ID children, each in insertion order.
    /// Round-trips layouts produced by this crate.
    #[default]
    Insertion,
    /// The order the PE specification mandates: names ASCII-ascending,
    /// then IDs numerically ascending.
    Sorted,
}

fn shape(reason: impl Into<String>) -> PeError {
    PeError::ResourceShapeInvalid(reason.into())
}

// ---------------------------------------------------------------------------
// Shift
// ---------------------------------------------------------------------------

/// Add `delta` to every absolute pointer inside a resource section.
///
/// Only the image-RVA field of each data entry is absolute; directory,
/// string, and data-entry words are section-relative and stay untouched.
/// `shift(-n)` followed by `shift(+n)` restores the original bytes.
pub fn shift(data: &mut [u8], delta: i64) -> Result<()> {
    shift_directory(data, 0, delta as u32, 0)
}

fn shift_directory(data: &mut [u8], offset: u32, delta: u32, depth: u32) -> Result<()> {
    if depth > MAX_DEPTH {
        return Err(shape("directory nesting exceeds the sanity bound"));
    }
    let base = offset as usize;
    let num_named =
        read_u16(data, base + 12).ok_or_else(|| shape("directory table out of range"))?;
    let num_id = read_u16(data, base + 14).ok_or_else(|| shape("directory table out of range"))?;
    for index in 0..(num_named as usize + num_id as usize) {
        let slot = base + DIR_HEADER_SIZE + index * DIR_ENTRY_SIZE + 4;
        let word = read_u32(data, slot).ok_or_else(|| shape("directory entry out of range"))?;
        if word & SUBDIR_FLAG != 0 {
            shift_directory(data, word & OFFSET_MASK, delta, depth + 1)?;
        } else {
            let field = word as usize;
            let pointer =
                read_u32(data, field).ok_or_else(|| shape("data entry out of range"))?;
            put_u32(data, field, pointer.wrapping_add(delta));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Decode
// ---------------------------------------------------------------------------

/// Decode a resource section into a tree.
///
/// `section_va` is the RVA the section bytes are currently based at; the
/// decoder works on a scratch copy shifted down by it, so the caller's
/// bytes are left untouched.
pub fn decode(data: &[u8], section_va: u32) -> Result<ResourceTree> {
    let mut scratch = data.to_vec();
    shift(&mut scratch, -(section_va as i64))?;

    let mut tree = ResourceTree::new();
    let root = tree.root();
    decode_directory(&scratch, 0, &mut tree, root, 0)?;
    debug!("decoded resource tree with {} entries", tree.len());
    Ok(tree)
}

fn decode_directory(
    data: &[u8],
    offset: u32,
    tree: &mut ResourceTree,
    dir: EntryHandle,
    depth: u32,
) -> Result<()> {
    if depth > MAX_DEPTH {
        return Err(shape("directory nesting exceeds the sanity bound"));
    }
    let mut reader = Reader::new(data);
    reader.seek(offset as usize);
    let truncated = || shape("directory table out of range");

    let characteristics = reader.u32().ok_or_else(truncated)?;
    let timestamp = reader.u32().ok_or_else(truncated)?;
    let version_major = reader.u16().ok_or_else(truncated)?;
    let version_minor = reader.u16().ok_or_else(truncated)?;
    let num_named = reader.u16().ok_or_else(truncated)?;
    let num_id = reader.u16().ok_or_else(truncated)?;
    tree.set_meta_raw(
        dir,
        DirectoryMeta {
            characteristics,
            timestamp,
            version_major,
            version_minor,
        },
    );

    trace!("directory at {offset:#x}: {num_named} named, {num_id} id entries");
    for index in 0..(num_named as usize + num_id as usize) {
        let entry = offset as usize + DIR_HEADER_SIZE + index * DIR_ENTRY_SIZE;
        let name_word =
            read_u32(data, entry).ok_or_else(|| shape("directory entry out of range"))?;
        let data_word =
            read_u32(data, entry + 4).ok_or_else(|| shape("directory entry out of range"))?;

        let ident = if name_word & STRING_FLAG != 0 {
            EntryIdent::Name(read_string(data, name_word & OFFSET_MASK)?)
        } else {
            EntryIdent::Id(name_word)
        };

        if data_word & SUBDIR_FLAG != 0 {
            let child = tree.push_raw(
                dir,
                ident,
                EntryBody::Directory {
                    children: Vec::new(),
                    meta: DirectoryMeta::default(),
                },
            )?;
            decode_directory(data, data_word & OFFSET_MASK, tree, child, depth + 1)?;
        } else {
            let record = data_word as usize;
            let out_of_range = || shape("data entry out of range");
            let pointer = read_u32(data, record).ok_or_else(out_of_range)?;
            let size = read_u32(data, record + 4).ok_or_else(out_of_range)?;
            let codepage = read_u32(data, record + 8).ok_or_else(out_of_range)?;
            let reserved = read_u32(data, record + 12).ok_or_else(out_of_range)?;
            let start = pointer as usize;
            let bytes = data
                .get(start..start.saturating_add(size as usize))
                .ok_or_else(|| shape("data payload out of range"))?
                .to_vec();
            tree.push_raw(
                dir,
                ident,
                EntryBody::Data {
                    bytes,
                    codepage,
                    reserved,
                },
            )?;
        }
    }
    Ok(())
}

fn read_string(data: &[u8], offset: u32) -> Result<String> {
    let truncated = || shape("name string out of range");
    let base = offset as usize;
    let len = read_u16(data, base).ok_or_else(truncated)? as usize;
    let mut units = Vec::with_capacity(len);
    for index in 0..len {
        units.push(read_u16(data, base + 2 + index * 2).ok_or_else(truncated)?);
    }
    Ok(String::from_utf16_lossy(&units))
}

// ---------------------------------------------------------------------------
// Encode
// ---------------------------------------------------------------------------

/// Encode a tree into resource-section bytes.
///
/// The result expresses every pointer as an offset from the section start;
/// the container applies `shift(+VA)` once the section's final RVA is
/// known.
pub fn encode(tree: &ResourceTree, order: EncodeOrder) -> Result<Vec<u8>> {
    let sizes = measure(tree)?;
    let total = sizes.directories + sizes.data_entries + sizes.strings + sizes.blobs;
    debug!(
        "encoding resource tree: {:#x} directory, {:#x} data entry, {:#x} string, {:#x} blob bytes",
        sizes.directories, sizes.data_entries, sizes.strings, sizes.blobs
    );
    let mut out = vec![0u8; total];

    // Directory tables, written in queue order: a directory's subdirectory
    // children are encoded after the directory itself completes.
    let mut dir_offsets: Vec<Option<u32>> = vec![None; tree.len()];
    let mut dir_slots: Vec<(usize, EntryHandle)> = Vec::new();
    let mut data_slots: Vec<(usize, EntryHandle)> = Vec::new();
    let mut name_slots: IndexMap<String, Vec<usize>> = IndexMap::new();

    let mut cursor = 0usize;
    let mut queue = VecDeque::from([tree.root()]);
    while let Some(dir) = queue.pop_front() {
        dir_offsets[dir.0] = Some(cursor as u32);
        let meta = tree
            .directory_meta(dir)
            .copied()
            .ok_or_else(|| shape("queued entry is not a directory"))?;

        let mut named: Vec<EntryHandle> = Vec::new();
        let mut by_id: Vec<EntryHandle> = Vec::new();
        for &child in tree.children(dir) {
            match tree.ident(child) {
                Some(EntryIdent::Name(_)) => named.push(child),
                Some(EntryIdent::Id(_)) => by_id.push(child),
                None => return Err(shape("non-root entry without an identity")),
            }
        }
        if order == EncodeOrder::Sorted {
            named.sort_by(|&a, &b| entry_name(tree, a).cmp(entry_name(tree, b)));
            by_id.sort_by_key(|&h| entry_id(tree, h));
        }
        if named.len() > u16::MAX as usize || by_id.len() > u16::MAX as usize {
            return Err(shape("directory has more than 65535 children of one kind"));
        }

        put_u32(&mut out, cursor, meta.characteristics);
        put_u32(&mut out, cursor + 4, meta.timestamp);
        put_u16(&mut out, cursor + 8, meta.version_major);
        put_u16(&mut out, cursor + 10, meta.version_minor);
        put_u16(&mut out, cursor + 12, named.len() as u16);
        put_u16(&mut out, cursor + 14, by_id.len() as u16);
        cursor += DIR_HEADER_SIZE;

        for child in named.into_iter().chain(by_id) {
            match tree.ident(child) {
                Some(EntryIdent::Name(name)) => {
                    name_slots.entry(name.clone()).or_default().push(cursor);
                    put_u32(&mut out, cursor, STRING_FLAG);
                }
                Some(EntryIdent::Id(id)) => put_u32(&mut out, cursor, *id),
                None => unreachable!("filtered above"),
            }
            if tree.is_directory(child) {
                dir_slots.push((cursor + 4, child));
                put_u32(&mut out, cursor + 4, SUBDIR_FLAG);
                queue.push_back(child);
            } else {
                data_slots.push((cursor + 4, child));
            }
            cursor += DIR_ENTRY_SIZE;
        }
    }
    debug_assert_eq!(cursor, sizes.directories);

    // Subdirectory back-references.
    for (slot, handle) in dir_slots {
        let offset = dir_offsets[handle.0]
            .ok_or_else(|| shape("missing directory offset during patch"))?;
        put_u32(&mut out, slot, offset | SUBDIR_FLAG);
    }

    // Data payloads, concatenated after the string region.
    let mut blob_cursor = sizes.directories + sizes.data_entries + sizes.strings;
    let mut payload_offsets = Vec::with_capacity(data_slots.len());
    for &(_, handle) in &data_slots {
        let bytes = tree
            .data(handle)
            .ok_or_else(|| shape("data slot points at a directory"))?;
        out[blob_cursor..blob_cursor + bytes.len()].copy_from_slice(bytes);
        payload_offsets.push(blob_cursor as u32);
        blob_cursor += bytes.len();
    }

    // Data entries; each directory slot gets its record's offset.
    let mut record_cursor = sizes.directories;
    for (&(slot, handle), payload_offset) in data_slots.iter().zip(payload_offsets) {
        let EntryBody::Data {
            bytes,
            codepage,
            reserved,
        } = &tree.entries[handle.0].body
        else {
            return Err(shape("data slot points at a directory"));
        };
        put_u32(&mut out, slot, record_cursor as u32);
        put_u32(&mut out, record_cursor, payload_offset);
        put_u32(&mut out, record_cursor + 4, bytes.len() as u32);
        put_u32(&mut out, record_cursor + 8, *codepage);
        put_u32(&mut out, record_cursor + 12, *reserved);
        record_cursor += DATA_ENTRY_SIZE;
    }

    // Strings: one occurrence per unique name, every referencing slot
    // patched with its offset.
    let mut string_cursor = sizes.directories + sizes.data_entries;
    for (name, slots) in &name_slots {
        for &slot in slots {
            put_u32(&mut out, slot, string_cursor as u32 | STRING_FLAG);
        }
        let units: Vec<u16> = name.encode_utf16().collect();
        put_u16(&mut out, string_cursor, units.len() as u16);
        for (index, unit) in units.iter().enumerate() {
            put_u16(&mut out, string_cursor + 2 + index * 2, *unit);
        }
        string_cursor += 2 + units.len() * 2;
    }
    debug_assert_eq!(string_cursor, sizes.directories + sizes.data_entries + sizes.strings);

    Ok(out)
}

fn entry_name<'t>(tree: &'t ResourceTree, handle: EntryHandle) -> &'t str {
    match tree.ident(handle) {
        Some(EntryIdent::Name(name)) => name,
        _ => "",
    }
}

fn entry_id(tree: &ResourceTree, handle: EntryHandle) -> u32 {
    match tree.ident(handle) {
        Some(EntryIdent::Id(id)) => *id,
        _ => 0,
    }
}

struct RegionSizes {
    directories: usize,
    data_entries: usize,
    strings: usize,
    blobs: usize,
}

/// Walk the tree once, validating its shape and summing the four region
/// sizes.
fn measure(tree: &ResourceTree) -> Result<RegionSizes> {
    let mut directories = 0usize;
    let mut data_entries = 0usize;
    let mut blobs = 0usize;
    let mut names: IndexMap<&str, usize> = IndexMap::new();

    let mut stack = vec![tree.root()];
    while let Some(handle) = stack.pop() {
        if let Some(EntryIdent::Name(name)) = tree.ident(handle) {
            if !names.contains_key(name.as_str()) {
                let units = name.encode_utf16().count();
                if units > u16::MAX as usize {
                    return Err(shape(format!("name {name:?} exceeds 65535 UTF-16 units")));
                }
                names.insert(name, units);
            }
        }
        if tree.is_directory(handle) {
            let children = tree.children(handle);
            if children.is_empty() && handle != tree.root() {
                return Err(shape(format!(
                    "directory {:?} has neither children nor data",
                    tree.entry_path(handle)
                )));
            }
            directories += DIR_HEADER_SIZE + children.len() * DIR_ENTRY_SIZE;
            stack.extend_from_slice(children);
        } else {
            data_entries += DATA_ENTRY_SIZE;
            blobs += tree.data(handle).map_or(0, <[u8]>::len);
        }
    }

    let strings = names.values().map(|units| 2 + units * 2).sum();
    Ok(RegionSizes {
        directories,
        data_entries,
        strings,
        blobs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Compare two trees structurally (arena order is an implementation
    /// detail that decode does not preserve).
    fn assert_same(a: &ResourceTree, b: &ResourceTree) {
        fn walk(a: &ResourceTree, ha: EntryHandle, b: &ResourceTree, hb: EntryHandle) {
            assert_eq!(a.ident(ha), b.ident(hb), "identity mismatch");
            assert_eq!(a.is_directory(ha), b.is_directory(hb));
            if a.is_directory(ha) {
                assert_eq!(a.directory_meta(ha), b.directory_meta(hb));
                let ca = a.children(ha);
                let cb = b.children(hb);
                assert_eq!(ca.len(), cb.len(), "child count mismatch");
                for (&x, &y) in ca.iter().zip(cb) {
                    walk(a, x, b, y);
                }
            } else {
                assert_eq!(a.data(ha), b.data(hb));
                assert_eq!(a.data_codepage(ha), b.data_codepage(hb));
            }
        }
        walk(a, a.root(), b, b.root());
    }

    // named children lead their ID siblings so that insertion order already
    // matches the emitted order and round trips compare cleanly
    fn sample_tree() -> ResourceTree {
        let mut tree = ResourceTree::new();
        let brand = tree.add_directory(tree.root(), "BRAND").unwrap();
        let icons = tree.add_directory(tree.root(), 3u32).unwrap();
        let icon = tree.add_directory(icons, 1u32).unwrap();
        tree.add_data(icon, 1033u32, vec![0xAA; 24], 0).unwrap();
        let logo = tree.add_directory(brand, "LOGO").unwrap();
        tree.add_data(logo, 1033u32, b"logo-bytes".to_vec(), 1252)
            .unwrap();
        tree
    }

    #[test]
    fn empty_tree_is_a_bare_header() {
        let tree = ResourceTree::new();
        let bytes = encode(&tree, EncodeOrder::Insertion).unwrap();
        assert_eq!(bytes.len(), 16);
        let back = decode(&bytes, 0).unwrap();
        assert!(back.is_empty());
    }

    #[test]
    fn roundtrip_through_encode_shift_decode() {
        let tree = sample_tree();
        let mut bytes = encode(&tree, EncodeOrder::Insertion).unwrap();
        shift(&mut bytes, 0x5000).unwrap();
        let back = decode(&bytes, 0x5000).unwrap();
        assert_same(&tree, &back);
        assert!(!back.is_dirty());
    }

    #[test]
    fn reencode_is_byte_stable() {
        let tree = sample_tree();
        let bytes = encode(&tree, EncodeOrder::Insertion).unwrap();
        let back = decode(&bytes, 0).unwrap();
        let again = encode(&back, EncodeOrder::Insertion).unwrap();
        assert_eq!(bytes, again);
    }

    #[test]
    fn encoded_length_matches_region_arithmetic() {
        let tree = sample_tree();
        let bytes = encode(&tree, EncodeOrder::Insertion).unwrap();
        // 5 directories (root, 3, BRAND, 3/1, BRAND/LOGO) with 2+1+1+1+1
        // children; 2 data entries; unique names BRAND and LOGO; 34 payload
        // bytes.
        let directories = 5 * 16 + 6 * 8;
        let data_entries = 2 * 16;
        let strings = (2 + 2 * 5) + (2 + 2 * 4);
        let blobs = 24 + 10;
        assert_eq!(bytes.len(), directories + data_entries + strings + blobs);
    }

    #[test]
    fn shift_patches_only_data_entry_pointers() {
        let tree = sample_tree();
        let baseline = encode(&tree, EncodeOrder::Insertion).unwrap();
        let mut shifted = baseline.clone();
        shift(&mut shifted, 0x2000).unwrap();

        // the data-entry region starts after the 5 directory tables
        let records = 5 * 16 + 6 * 8;
        for record in [records, records + 16] {
            let before = read_u32(&baseline, record).unwrap();
            let after = read_u32(&shifted, record).unwrap();
            assert_eq!(after, before + 0x2000);
        }
        // nothing outside the two pointer fields moved
        for (index, (a, b)) in baseline.iter().zip(&shifted).enumerate() {
            let in_pointer = (records..records + 4).contains(&index)
                || (records + 16..records + 20).contains(&index);
            if !in_pointer {
                assert_eq!(a, b, "byte {index} changed");
            }
        }
    }

    #[test]
    fn shift_down_then_up_restores_bytes() {
        let tree = sample_tree();
        let mut bytes = encode(&tree, EncodeOrder::Insertion).unwrap();
        shift(&mut bytes, 0x0007_0000).unwrap();
        let original = bytes.clone();
        shift(&mut bytes, -0x4000).unwrap();
        assert_ne!(bytes, original);
        shift(&mut bytes, 0x4000).unwrap();
        assert_eq!(bytes, original);
    }

    #[test]
    fn shared_names_are_coalesced() {
        let mut tree = ResourceTree::new();
        let a = tree.add_directory(tree.root(), "SHARED").unwrap();
        let b = tree.add_directory(a, "SHARED").unwrap();
        tree.add_data(b, 1u32, vec![1], 0).unwrap();
        let bytes = encode(&tree, EncodeOrder::Insertion).unwrap();

        let pattern: Vec<u8> = {
            let mut p = vec![6, 0];
            for unit in "SHARED".encode_utf16() {
                p.extend_from_slice(&unit.to_le_bytes());
            }
            p
        };
        let occurrences = bytes
            .windows(pattern.len())
            .filter(|w| *w == pattern.as_slice())
            .count();
        assert_eq!(occurrences, 1, "one string table entry for both uses");
    }

    #[test]
    fn insertion_order_keeps_names_before_ids() {
        let mut tree = ResourceTree::new();
        let d1 = tree.add_directory(tree.root(), 9u32).unwrap();
        let d2 = tree.add_directory(tree.root(), "ZETA").unwrap();
        let d3 = tree.add_directory(tree.root(), 2u32).unwrap();
        let d4 = tree.add_directory(tree.root(), "ALPHA").unwrap();
        for d in [d1, d2, d3, d4] {
            tree.add_data(d, 0u32, vec![0], 0).unwrap();
        }
        let bytes = encode(&tree, EncodeOrder::Insertion).unwrap();
        assert_eq!(read_u16(&bytes, 12), Some(2));
        assert_eq!(read_u16(&bytes, 14), Some(2));
        // named children in insertion order: ZETA, ALPHA; then IDs 9, 2
        let back = decode(&bytes, 0).unwrap();
        let kids = back.children(back.root());
        let idents: Vec<String> = kids.iter().map(|&h| back.ident(h).unwrap().to_string()).collect();
        assert_eq!(idents, ["ZETA", "ALPHA", "9", "2"]);
    }

    #[test]
    fn sorted_order_follows_the_pe_rules() {
        let mut tree = ResourceTree::new();
        let d1 = tree.add_directory(tree.root(), 9u32).unwrap();
        let d2 = tree.add_directory(tree.root(), "ZETA").unwrap();
        let d3 = tree.add_directory(tree.root(), 2u32).unwrap();
        let d4 = tree.add_directory(tree.root(), "ALPHA").unwrap();
        for d in [d1, d2, d3, d4] {
            tree.add_data(d, 0u32, vec![0], 0).unwrap();
        }
        let bytes = encode(&tree, EncodeOrder::Sorted).unwrap();
        let back = decode(&bytes, 0).unwrap();
        let idents: Vec<String> = back
            .children(back.root())
            .iter()
            .map(|&h| back.ident(h).unwrap().to_string())
            .collect();
        assert_eq!(idents, ["ALPHA", "ZETA", "2", "9"]);
    }

    #[test]
    fn directory_metadata_survives_the_roundtrip() {
        let mut tree = ResourceTree::new();
        let meta = DirectoryMeta {
            characteristics: 0,
            timestamp: 0x5F00_0000,
            version_major: 4,
            version_minor: 2,
        };
        tree.set_directory_meta(tree.root(), meta).unwrap();
        let dir = tree.add_directory(tree.root(), 1u32).unwrap();
        tree.add_data(dir, 0u32, vec![7], 42).unwrap();

        let bytes = encode(&tree, EncodeOrder::Insertion).unwrap();
        let back = decode(&bytes, 0).unwrap();
        assert_eq!(back.directory_meta(back.root()), Some(&meta));
        let leaf = back.get_entry_from_path("1/0").unwrap();
        assert_eq!(back.data_codepage(leaf), Some(42));
    }

    #[test]
    fn empty_non_root_directory_fails_to_encode() {
        let mut tree = ResourceTree::new();
        tree.add_directory(tree.root(), 5u32).unwrap();
        let err = encode(&tree, EncodeOrder::Insertion).unwrap_err();
        assert!(matches!(err, PeError::ResourceShapeInvalid(_)));
    }

    #[test]
    fn truncated_input_fails_to_decode() {
        let tree = sample_tree();
        let bytes = encode(&tree, EncodeOrder::Insertion).unwrap();
        let err = decode(&bytes[..bytes.len() - 8], 0).unwrap_err();
        assert!(matches!(err, PeError::ResourceShapeInvalid(_)));
    }

    #[test]
    fn cyclic_directory_graph_is_rejected() {
        // root whose single child points back at the root
        let mut bytes = vec![0u8; 24];
        put_u16(&mut bytes, 14, 1); // one ID child
        put_u32(&mut bytes, 16, 7); // id
        put_u32(&mut bytes, 20, SUBDIR_FLAG); // subdirectory at offset 0
        let err = decode(&bytes, 0).unwrap_err();
        assert!(matches!(err, PeError::ResourceShapeInvalid(_)));
        let mut copy = bytes.clone();
        assert!(shift(&mut copy, 0x1000).is_err());
    }
}
