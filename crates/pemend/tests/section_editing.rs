//! End-to-end section editing: parse, rewrite, relayout, reparse.

mod common;

use common::*;
use pemend::{PeError, PeFile, Section, SectionFlags, OH_SIZE_OF_IMAGE};

#[test]
fn edit_grow_and_reparse() {
    let input = build_pe(
        &[
            clean_text(),
            SectionSpec {
                tag: b".data",
                virtual_size: 0x80,
                virtual_address: 0x2000,
                raw: vec![0x11; 0x200],
                raw_pointer: 0x1200,
                flags: 0xC000_0040,
            },
        ],
        0,
    );
    let mut pe = PeFile::parse(&input).unwrap();

    // rewrite .text in place
    let text = pe.section_index_by_tag(".text").unwrap();
    pe.sections[text].raw_data = vec![0x90; 0x180];

    // and add a fresh section through the allocator
    let mut extra = Section::new(".extra", SectionFlags::CNT_INITIALIZED_DATA).unwrap();
    extra.raw_data = b"hello from the new section".to_vec();
    extra.virtual_size = extra.raw_data.len() as u32;
    pe.malloc(extra, true).unwrap();

    let output = pe.write().unwrap();
    let reparsed = PeFile::parse(&output).unwrap();

    assert_eq!(reparsed.sections.len(), 3);
    let text = reparsed.section_index_by_tag(".text").unwrap();
    assert!(reparsed.sections[text].raw_data.iter().all(|&b| b == 0x90));
    assert_eq!(reparsed.sections[text].raw_data.len(), 0x180);

    let extra = reparsed.section_index_by_tag(".extra").unwrap();
    assert_eq!(reparsed.sections[extra].virtual_address, 0x3000);
    assert!(reparsed.sections[extra]
        .raw_data
        .starts_with(b"hello from the new section"));

    // NumberOfSections and SizeOfImage were re-derived
    assert_eq!(read_u16(&output, COFF + 2), 3);
    assert_eq!(
        reparsed.optional_header_u32(OH_SIZE_OF_IMAGE).unwrap(),
        0x4000
    );
}

#[test]
fn unedited_image_round_trips_byte_for_byte() {
    let input = build_pe(&[clean_text()], 0);
    let mut pe = PeFile::parse(&input).unwrap();
    assert_eq!(pe.write().unwrap(), input);
}

#[test]
fn emitted_sections_stay_file_aligned_and_disjoint() {
    let input = build_pe(
        &[
            clean_text(),
            SectionSpec {
                tag: b".data",
                virtual_size: 0x300,
                virtual_address: 0x2000,
                raw: vec![0x22; 0x2C0],
                raw_pointer: 0x1200,
                flags: 0xC000_0040,
            },
            SectionSpec {
                tag: b".bss",
                virtual_size: 0x1000,
                virtual_address: 0x3000,
                raw: Vec::new(),
                raw_pointer: 0,
                flags: 0xC000_0080,
            },
        ],
        0,
    );
    let mut pe = PeFile::parse(&input).unwrap();
    let output = pe.write().unwrap();
    assert_eq!(output.len() % 0x200, 0);

    for section in &pe.sections {
        if !section.linearized {
            assert_eq!(section.file_address() % 0x200, 0);
        }
    }
    let mut spans: Vec<(u32, u32)> = pe
        .sections
        .iter()
        .map(|s| (s.file_address(), s.raw_data.len() as u32))
        .collect();
    spans.push((0, pe.headers_size()));
    for (i, &(a, al)) in spans.iter().enumerate() {
        for &(b, bl) in &spans[i + 1..] {
            assert!(a + al <= b || b + bl <= a, "file spans overlap");
        }
    }
}

#[test]
fn gap_fill_produces_a_loadable_contiguous_layout() {
    let input = build_pe(
        &[
            clean_text(),
            SectionSpec {
                tag: b".data",
                virtual_size: 0x100,
                virtual_address: 0x4000,
                raw: vec![0x33; 0x200],
                raw_pointer: 0x1200,
                flags: 0xC000_0040,
            },
        ],
        0,
    );
    let mut pe = PeFile::parse(&input).unwrap();
    pe.fill_virtual_layout_gaps().unwrap();
    let output = pe.write().unwrap();
    let reparsed = PeFile::parse(&output).unwrap();

    assert_eq!(reparsed.sections.len(), 3);
    let filler = &reparsed.sections[reparsed.section_index_by_tag(".flr0000").unwrap()];
    assert_eq!(filler.virtual_address, 0x2000);
    assert_eq!(filler.virtual_size, 0x2000);
    assert!(filler.is_filler());

    let mut sorted: Vec<(u32, u32)> = reparsed
        .sections
        .iter()
        .map(|s| (s.virtual_address, s.virtual_size))
        .collect();
    sorted.sort();
    for pair in sorted.windows(2) {
        assert_eq!(pair[1].0, align_up(pair[0].0 + pair[0].1, 0x1000));
    }
}

#[test]
fn resource_calls_fail_cleanly_without_a_rsrc_section() {
    let input = build_pe(&[clean_text()], 0);
    let mut pe = PeFile::parse(&input).unwrap();
    assert_eq!(pe.resources_index(), None);
    assert!(matches!(pe.resources(), Err(PeError::ResourceMissing)));
    assert!(matches!(pe.resources_mut(), Err(PeError::ResourceMissing)));
}

#[test]
fn rva_lookup_matches_the_section_map() {
    let input = build_pe(&[clean_text()], 0);
    let pe = PeFile::parse(&input).unwrap();
    assert_eq!(pe.locate_rva(0x1040), Some((0, 0x40)));
    assert_eq!(pe.locate_rva(0x4000), None);
    assert_eq!(pe.section_index_by_tag(".text"), Some(0));
    assert_eq!(pe.section_index_by_tag(".nope"), None);
}
