//! The PE container: early-header buffer, section list, and the emit
//! machinery that keeps them consistent.
//!
//! A [`PeFile`] owns the first `SizeOfHeaders` bytes of the file (DOS stub,
//! PE signature, file header, optional header, section table) and edits
//! them in place; section bodies live as owned byte vectors alongside.
//! Emitting re-runs the whole layout: virtual overlap check, two-phase file
//! allocation, header rewrite, output assembly.  All of it is staged on
//! copies and committed only on success.

use log::{debug, trace};

use crate::bytes::{put_u16, put_u32, read_u16, read_u32};
use crate::error::{PeError, Result};
use crate::rsrc::{self, EncodeOrder, ResourceTree};
use crate::section::{Section, SectionFlags};
use crate::span::Span;

/// Default early-header size; matches `SizeOfHeaders` of the files this
/// crate targets.
pub const DEFAULT_HEADERS_SIZE: u32 = 0x1000;

const DOS_MAGIC: u16 = 0x5A4D;
const PE_SIGNATURE: u32 = 0x0000_4550;
const PE32_MAGIC: u16 = 0x010B;
const NT_OFFSET_FIELD: usize = 0x3C;
const SECTION_HEADER_SIZE: usize = 40;
const MIN_OPTIONAL_SIZE: u16 = 0x78;

/// Optional-header field offsets, relative to the optional-header start.
pub const OH_SECTION_ALIGNMENT: u32 = 0x20;
pub const OH_FILE_ALIGNMENT: u32 = 0x24;
pub const OH_SIZE_OF_IMAGE: u32 = 0x38;
pub const OH_SIZE_OF_HEADERS: u32 = 0x3C;
pub const OH_RESOURCE_TABLE_RVA: u32 = 0x70;
pub const OH_RESOURCE_TABLE_SIZE: u32 = 0x74;

/// Round `value` up to the next multiple of `alignment`.
fn align_up(value: u32, alignment: u32) -> u32 {
    if alignment == 0 {
        return value;
    }
    match value % alignment {
        0 => value,
        rest => value + (alignment - rest),
    }
}

fn align_up64(value: u64, alignment: u64) -> u64 {
    if alignment == 0 {
        return value;
    }
    match value % alignment {
        0 => value,
        rest => value + (alignment - rest),
    }
}

/// A parsed PE image held entirely in memory.
#[derive(Debug)]
pub struct PeFile {
    early_header: Vec<u8>,
    /// Offset of the `PE\0\0` signature inside the early header.
    nt: usize,
    optional_size: usize,
    /// Ordered list of sections.  Free to edit; `write` re-derives every
    /// header field from it.
    pub sections: Vec<Section>,
    resources: Option<ResourceTree>,
    /// Child order used when a dirty resource tree is re-encoded on emit.
    pub resource_encode_order: EncodeOrder,
    file_size: u32,
}

impl PeFile {
    // -- parse --------------------------------------------------------------

    /// Parse an image whose `SizeOfHeaders` is the default 0x1000.
    pub fn parse(input: &[u8]) -> Result<Self> {
        Self::parse_with_headers_size(input, DEFAULT_HEADERS_SIZE)
    }

    /// Parse an image, copying the first `headers_size` bytes as the early
    /// header.  The file's `SizeOfHeaders` must agree.
    pub fn parse_with_headers_size(input: &[u8], headers_size: u32) -> Result<Self> {
        let header_len = headers_size as usize;
        if input.len() < header_len {
            return Err(PeError::NotAPE(format!(
                "{} bytes of input, the early header alone is {headers_size:#x}",
                input.len()
            )));
        }
        let early_header = input[..header_len].to_vec();

        if read_u16(&early_header, 0) != Some(DOS_MAGIC) {
            return Err(PeError::NotAPE("no MZ signature".into()));
        }
        let truncated = || PeError::NotAPE("truncated header".into());
        let nt = read_u32(&early_header, NT_OFFSET_FIELD).ok_or_else(truncated)? as usize;
        if read_u32(&early_header, nt) != Some(PE_SIGNATURE) {
            return Err(PeError::NotAPE("no PE signature".into()));
        }

        let section_count = read_u16(&early_header, nt + 6).ok_or_else(truncated)? as usize;
        if read_u32(&early_header, nt + 12).ok_or_else(truncated)? != 0 {
            return Err(PeError::SymbolTablePresent);
        }
        let optional_size = read_u16(&early_header, nt + 20).ok_or_else(truncated)?;
        if optional_size < MIN_OPTIONAL_SIZE {
            return Err(PeError::OptionalHeaderTooSmall(optional_size));
        }
        let optional_offset = nt + 24;
        if optional_offset + optional_size as usize > header_len {
            return Err(PeError::NotAPE(
                "optional header extends past the early header".into(),
            ));
        }
        let magic = read_u16(&early_header, optional_offset).ok_or_else(truncated)?;
        if magic != PE32_MAGIC {
            return Err(PeError::UnsupportedOptionalMagic(magic));
        }
        let size_of_headers = read_u32(&early_header, optional_offset + OH_SIZE_OF_HEADERS as usize)
            .ok_or_else(truncated)?;
        if size_of_headers != headers_size {
            return Err(PeError::HeadersSizeMismatch {
                expected: headers_size,
                found: size_of_headers,
            });
        }

        let table = optional_offset + optional_size as usize;
        let mut sections = Vec::with_capacity(section_count);
        for index in 0..section_count {
            let base = table + index * SECTION_HEADER_SIZE;
            if base + SECTION_HEADER_SIZE > header_len {
                return Err(PeError::NotAPE(
                    "section table extends past the early header".into(),
                ));
            }
            let mut tag = [0u8; 8];
            tag.copy_from_slice(&early_header[base..base + 8]);
            let virtual_size = read_u32(&early_header, base + 8).ok_or_else(truncated)?;
            let virtual_address = read_u32(&early_header, base + 12).ok_or_else(truncated)?;
            let raw_size = read_u32(&early_header, base + 16).ok_or_else(truncated)?;
            let raw_pointer = read_u32(&early_header, base + 20).ok_or_else(truncated)?;
            let relocation_count = read_u16(&early_header, base + 32).ok_or_else(truncated)?;
            let line_number_count = read_u16(&early_header, base + 34).ok_or_else(truncated)?;
            let flags = read_u32(&early_header, base + 36).ok_or_else(truncated)?;

            let mut section = Section {
                tag,
                virtual_address,
                virtual_size,
                raw_data: Vec::new(),
                file_address: raw_pointer,
                flags: SectionFlags::from_bits_retain(flags),
                linearized: raw_pointer == virtual_address,
            };
            if relocation_count != 0 {
                return Err(PeError::RelocationsPresent(section.tag_str()));
            }
            if line_number_count != 0 {
                return Err(PeError::LineNumbersPresent(section.tag_str()));
            }
            let start = raw_pointer as usize;
            let end = start.saturating_add(raw_size as usize);
            section.raw_data = input
                .get(start..end)
                .ok_or_else(|| {
                    PeError::NotAPE(format!(
                        "section {} data {start:#x}..{end:#x} is outside the input",
                        section.tag_str()
                    ))
                })?
                .to_vec();
            trace!(
                "section {}: rva {virtual_address:#x}+{virtual_size:#x}, file {raw_pointer:#x}+{raw_size:#x}",
                section.tag_str()
            );
            sections.push(section);
        }

        let mut ordered: Vec<&Section> = sections.iter().collect();
        ordered.sort_by_key(|s| s.virtual_address);
        verify_no_overlap(&ordered)?;

        let resource_rva =
            read_u32(&early_header, optional_offset + OH_RESOURCE_TABLE_RVA as usize)
                .ok_or_else(truncated)?;
        let resources = if resource_rva != 0 {
            sections
                .iter()
                .find(|s| s.virtual_address == resource_rva)
                .map(|s| rsrc::decode(&s.raw_data, resource_rva))
                .transpose()?
        } else {
            None
        };

        debug!(
            "parsed PE: {} sections, resource table rva {resource_rva:#x}",
            sections.len()
        );
        Ok(Self {
            early_header,
            nt,
            optional_size: optional_size as usize,
            sections,
            resources,
            resource_encode_order: EncodeOrder::default(),
            file_size: 0,
        })
    }

    // -- emit ---------------------------------------------------------------

    /// Lay the image out and serialize it.
    ///
    /// Sorts the section list by RVA, re-encodes a dirty resource tree,
    /// assigns every section a file offset (linearized sections first, at
    /// their RVA), rewrites the section table and the derived optional
    /// header fields, and returns the assembled file.  On error the
    /// container is left exactly as it was.
    pub fn write(&mut self) -> Result<Vec<u8>> {
        let section_align = self.optional_header_u32(OH_SECTION_ALIGNMENT)?;
        let file_align = self.optional_header_u32(OH_FILE_ALIGNMENT)?;
        if section_align == 0 || file_align == 0 {
            return Err(PeError::NotAPE("zero alignment in the optional header".into()));
        }

        self.sections.sort_by_key(|s| s.virtual_address);

        let mut header = self.early_header.clone();
        let mut work = self.sections.clone();

        if let Some(tree) = self.resources.as_ref().filter(|t| t.is_dirty()) {
            self.stage_resource_rebuild(tree, &mut header, &mut work, section_align)?;
            work.sort_by_key(|s| s.virtual_address);
        }

        {
            let ordered: Vec<&Section> = work.iter().collect();
            verify_no_overlap(&ordered)?;
        }

        let addresses = allocate_file_offsets(&work, header.len() as u32, file_align);
        self.rewrite_headers(&mut header, &work, &addresses, section_align)?;

        let extent = addresses
            .iter()
            .zip(&work)
            .map(|(address, section)| *address as u64 + section.raw_data.len() as u64)
            .fold(header.len() as u64, u64::max);
        let file_size = align_up64(extent, file_align as u64);
        let file_size = u32::try_from(file_size)
            .map_err(|_| PeError::NotAPE("image exceeds the 32-bit file space".into()))?;

        let mut output = vec![0u8; file_size as usize];
        output[..header.len()].copy_from_slice(&header);
        for (section, address) in work.iter().zip(&addresses) {
            let start = *address as usize;
            output[start..start + section.raw_data.len()].copy_from_slice(&section.raw_data);
        }

        // commit
        for (section, address) in work.iter_mut().zip(&addresses) {
            section.file_address = *address;
        }
        self.sections = work;
        self.early_header = header;
        self.file_size = file_size;
        if let Some(tree) = self.resources.as_mut() {
            tree.clear_dirty();
        }
        debug!("emitted {} bytes", output.len());
        Ok(output)
    }

    /// Re-encode a dirty resource tree into the staged section list: the
    /// section keeps its RVA while the new bytes still fit under its
    /// successor, otherwise it is re-placed after everything else.
    fn stage_resource_rebuild(
        &self,
        tree: &ResourceTree,
        header: &mut [u8],
        work: &mut [Section],
        section_align: u32,
    ) -> Result<()> {
        let rva = read_u32(header, self.optional_offset() + OH_RESOURCE_TABLE_RVA as usize)
            .ok_or(PeError::ResourceMissing)?;
        let index = work
            .iter()
            .position(|s| rva != 0 && s.virtual_address == rva)
            .ok_or(PeError::ResourceMissing)?;

        let mut encoded = rsrc::encode(tree, self.resource_encode_order)?;
        let new_len = encoded.len() as u32;
        let old_va = work[index].virtual_address;
        let successor = work
            .iter()
            .filter(|s| s.virtual_address > old_va)
            .map(|s| s.virtual_address as u64)
            .min()
            .unwrap_or(u64::MAX);
        let new_va = if old_va as u64 + new_len as u64 <= successor {
            old_va
        } else {
            let layout: Vec<(u32, u32)> = work
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != index)
                .map(|(_, s)| (s.virtual_address, s.virtual_size))
                .collect();
            let start = layout
                .iter()
                .map(|&(va, vs)| va as u64 + vs as u64)
                .fold(header.len() as u64, u64::max);
            let start = u32::try_from(start)
                .map_err(|_| PeError::NotAPE("image exceeds the 32-bit address space".into()))?;
            place_va(&layout, new_len, start, section_align)
        };
        debug!(
            "resource tree re-encoded: {new_len:#x} bytes, rva {old_va:#x} -> {new_va:#x}"
        );

        rsrc::shift(&mut encoded, new_va as i64)?;
        work[index].raw_data = encoded;
        work[index].virtual_size = new_len;
        work[index].virtual_address = new_va;
        put_u32(header, self.optional_offset() + OH_RESOURCE_TABLE_RVA as usize, new_va);
        put_u32(header, self.optional_offset() + OH_RESOURCE_TABLE_SIZE as usize, new_len);
        Ok(())
    }

    fn rewrite_headers(
        &self,
        header: &mut [u8],
        sections: &[Section],
        addresses: &[u32],
        section_align: u32,
    ) -> Result<()> {
        let table = self.nt + 24 + self.optional_size;
        let needed = sections.len() * SECTION_HEADER_SIZE;
        if table + needed > header.len() || sections.len() > u16::MAX as usize {
            return Err(PeError::NotEnoughHeaderSpace {
                needed: needed as u32,
                available: header.len().saturating_sub(table) as u32,
            });
        }

        put_u16(header, self.nt + 6, sections.len() as u16);
        let mut image_extent = 0u64;
        for (index, (section, address)) in sections.iter().zip(addresses).enumerate() {
            let base = table + index * SECTION_HEADER_SIZE;
            header[base..base + 8].copy_from_slice(section.tag_bytes());
            put_u32(header, base + 8, section.virtual_size);
            put_u32(header, base + 12, section.virtual_address);
            put_u32(header, base + 16, section.raw_data.len() as u32);
            put_u32(header, base + 20, *address);
            // relocation and line-number fields are always emitted as zero
            header[base + 24..base + 36].fill(0);
            put_u32(header, base + 36, section.flags.bits());
            image_extent = image_extent
                .max(section.virtual_address as u64 + section.virtual_size as u64);
        }
        let image_size = align_up64(image_extent, section_align as u64);
        let image_size = u32::try_from(image_size)
            .map_err(|_| PeError::NotAPE("image exceeds the 32-bit address space".into()))?;
        put_u32(header, self.optional_offset() + OH_SIZE_OF_IMAGE as usize, image_size);
        Ok(())
    }

    // -- section management -------------------------------------------------

    /// Insert a section, assigning it the first free RVA slot at or above
    /// the early header.  A `.rsrc` section is kept behind everything else:
    /// it is re-placed after the insertion, its internal pointers are
    /// shifted by the RVA delta, and the optional header's ResourceTable
    /// field follows it.
    pub fn malloc(&mut self, mut section: Section, resort: bool) -> Result<()> {
        let section_align = self.optional_header_u32(OH_SECTION_ALIGNMENT)?;
        if section_align == 0 {
            return Err(PeError::NotAPE("zero SectionAlignment".into()));
        }
        let header_len = self.early_header.len() as u32;
        let rsrc_index = self.resources_index();

        let others: Vec<(u32, u32)> = self
            .sections
            .iter()
            .enumerate()
            .filter(|(index, _)| Some(*index) != rsrc_index)
            .map(|(_, s)| (s.virtual_address, s.virtual_size))
            .collect();
        section.virtual_address =
            place_va(&others, section.virtual_size, header_len, section_align);
        trace!(
            "placed section {} at rva {:#x}",
            section.tag_str(),
            section.virtual_address
        );

        let staged_rsrc = match rsrc_index {
            Some(index) => {
                let old_va = self.sections[index].virtual_address;
                let mut layout = others;
                layout.push((section.virtual_address, section.virtual_size));
                let start = layout
                    .iter()
                    .map(|&(va, vs)| va as u64 + vs as u64)
                    .fold(header_len as u64, u64::max);
                let start = u32::try_from(start).map_err(|_| {
                    PeError::NotAPE("image exceeds the 32-bit address space".into())
                })?;
                let new_va = place_va(
                    &layout,
                    self.sections[index].virtual_size,
                    start,
                    section_align,
                );
                let delta = new_va as i64 - old_va as i64;
                let shifted = if delta != 0 && !self.sections[index].raw_data.is_empty() {
                    let mut bytes = self.sections[index].raw_data.clone();
                    rsrc::shift(&mut bytes, delta)?;
                    Some(bytes)
                } else {
                    None
                };
                debug!("resource section follows the insertion: rva {old_va:#x} -> {new_va:#x}");
                Some((index, new_va, shifted))
            }
            None => None,
        };

        // commit
        self.sections.push(section);
        if let Some((index, new_va, shifted)) = staged_rsrc {
            let mut rsrc_section = self.sections.remove(index);
            rsrc_section.virtual_address = new_va;
            if let Some(bytes) = shifted {
                rsrc_section.raw_data = bytes;
            }
            self.sections.push(rsrc_section);
            self.set_optional_header_u32(OH_RESOURCE_TABLE_RVA, new_va)?;
        }
        if resort {
            self.sections.sort_by_key(|s| s.virtual_address);
        }
        Ok(())
    }

    /// Plug every hole in the virtual layout with `.flrXXXX` filler
    /// sections (Windows 10 refuses images whose RVAs leave gaps).
    ///
    /// Existing fillers are dropped first, then gaps are filled lowest
    /// first until a scan finds none; the result is idempotent.
    pub fn fill_virtual_layout_gaps(&mut self) -> Result<()> {
        let section_align = self.optional_header_u32(OH_SECTION_ALIGNMENT)?;
        if section_align == 0 {
            return Err(PeError::NotAPE("zero SectionAlignment".into()));
        }
        self.sections.retain(|s| !s.is_filler());

        let mut counter: u16 = 0;
        loop {
            self.sections.sort_by_key(|s| s.virtual_address);
            let mut gap = None;
            let mut floor: Option<u64> = None;
            for section in &self.sections {
                if let Some(expected) = floor {
                    if (section.virtual_address as u64) > expected {
                        gap = Some((
                            expected as u32,
                            (section.virtual_address as u64 - expected) as u32,
                        ));
                        break;
                    }
                }
                floor = Some(align_up64(
                    section.virtual_address as u64 + section.virtual_size as u64,
                    section_align as u64,
                ));
            }
            let Some((at, size)) = gap else { break };
            debug!("virtual gap of {size:#x} bytes at {at:#x}, filling with filler {counter}");
            self.malloc(Section::filler(counter, size), true)?;
            counter = counter.wrapping_add(1);
        }
        Ok(())
    }

    // -- accessors ----------------------------------------------------------

    /// Index of the `.rsrc` section: the section whose RVA equals the
    /// optional header's ResourceTable field.
    pub fn resources_index(&self) -> Option<usize> {
        let rva = self.optional_header_u32(OH_RESOURCE_TABLE_RVA).ok()?;
        if rva == 0 {
            return None;
        }
        self.sections.iter().position(|s| s.virtual_address == rva)
    }

    /// Index of the first section whose display tag matches.
    pub fn section_index_by_tag(&self, tag: &str) -> Option<usize> {
        self.sections.iter().position(|s| s.tag_str() == tag)
    }

    /// The decoded resource tree, or `ResourceMissing` when the image has
    /// no `.rsrc` section.
    pub fn resources(&self) -> Result<&ResourceTree> {
        self.resources.as_ref().ok_or(PeError::ResourceMissing)
    }

    /// Mutable access to the resource tree; edits mark it dirty and the
    /// next `write` re-encodes the section.
    pub fn resources_mut(&mut self) -> Result<&mut ResourceTree> {
        self.resources.as_mut().ok_or(PeError::ResourceMissing)
    }

    /// Find the section containing an RVA; returns its index and the
    /// offset into its data.  The section extent is the larger of virtual
    /// size and raw length, so both uninitialized tails and zero-padded
    /// raw data resolve.
    pub fn locate_rva(&self, rva: u32) -> Option<(usize, u32)> {
        self.sections.iter().enumerate().find_map(|(index, s)| {
            let extent = s.virtual_size.max(s.raw_data.len() as u32);
            let start = s.virtual_address;
            if rva >= start && (rva as u64) < start as u64 + extent as u64 {
                Some((index, rva - start))
            } else {
                None
            }
        })
    }

    /// Read a `u32` field of the optional header.
    pub fn optional_header_u32(&self, offset: u32) -> Result<u32> {
        if offset as usize + 4 > self.optional_size {
            return Err(PeError::HeaderOffsetOutOfRange(offset));
        }
        read_u32(&self.early_header, self.optional_offset() + offset as usize)
            .ok_or(PeError::HeaderOffsetOutOfRange(offset))
    }

    /// Overwrite a `u32` field of the optional header.
    pub fn set_optional_header_u32(&mut self, offset: u32, value: u32) -> Result<()> {
        if offset as usize + 4 > self.optional_size {
            return Err(PeError::HeaderOffsetOutOfRange(offset));
        }
        let at = self.optional_offset() + offset as usize;
        put_u32(&mut self.early_header, at, value);
        Ok(())
    }

    /// The raw early-header bytes.
    pub fn early_header(&self) -> &[u8] {
        &self.early_header
    }

    /// Size of the early header (equals the file's `SizeOfHeaders`).
    pub fn headers_size(&self) -> u32 {
        self.early_header.len() as u32
    }

    /// File size computed by the last `write`; zero before the first one.
    pub fn file_size(&self) -> u32 {
        self.file_size
    }

    pub fn section_alignment(&self) -> Result<u32> {
        self.optional_header_u32(OH_SECTION_ALIGNMENT)
    }

    pub fn file_alignment(&self) -> Result<u32> {
        self.optional_header_u32(OH_FILE_ALIGNMENT)
    }

    fn optional_offset(&self) -> usize {
        self.nt + 24
    }
}

/// Walk sections already ordered by RVA and reject any `[VA, VA+VS)`
/// overlap.
fn verify_no_overlap(ordered: &[&Section]) -> Result<()> {
    let mut floor = 0u64;
    for section in ordered {
        if (section.virtual_address as u64) < floor {
            return Err(PeError::SectionRvaOverlap(section.tag_str()));
        }
        floor = section.virtual_address as u64 + section.virtual_size as u64;
    }
    Ok(())
}

/// Two-phase file allocation.  Linearized sections get first pick at a
/// file offset equal to their RVA (unaligned on purpose: the RVA already
/// satisfies alignment); everyone else, and any linearized section whose
/// preferred spot is taken, walks upward in `FileAlignment` steps from
/// zero.  The early header occupies `[0, header_len)`.
fn allocate_file_offsets(sections: &[Section], header_len: u32, file_align: u32) -> Vec<u32> {
    let mut reserved = vec![Span::new(0, header_len)];
    let mut addresses: Vec<Option<u32>> = vec![None; sections.len()];

    for (index, section) in sections.iter().enumerate() {
        if !section.linearized {
            continue;
        }
        let span = Span::new(section.virtual_address, section.raw_data.len() as u32);
        if !reserved.iter().any(|r| r.collides(&span)) {
            trace!(
                "linearized section {} keeps file offset {:#x}",
                section.tag_str(),
                span.start
            );
            addresses[index] = Some(span.start);
            reserved.push(span);
        }
    }

    for (index, section) in sections.iter().enumerate() {
        if addresses[index].is_some() {
            continue;
        }
        let len = section.raw_data.len() as u32;
        let mut position = 0u32;
        while reserved.iter().any(|r| r.collides(&Span::new(position, len))) {
            position += file_align;
        }
        addresses[index] = Some(position);
        reserved.push(Span::new(position, len));
    }

    addresses.into_iter().map(|a| a.unwrap_or(0)).collect()
}

/// First free RVA slot at or above `start`: step upward in `align`
/// increments until the aligned span fits between the existing sections.
fn place_va(existing: &[(u32, u32)], virtual_size: u32, start: u32, align: u32) -> u32 {
    let len = align_up(virtual_size, align);
    let mut candidate = align_up(start, align);
    loop {
        let span = Span::new(candidate, len);
        let collision = existing
            .iter()
            .any(|&(va, vs)| span.collides(&Span::new(va, align_up(vs, align))));
        if !collision {
            return candidate;
        }
        candidate += align;
    }
}
