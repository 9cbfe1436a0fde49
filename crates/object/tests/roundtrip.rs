//! Read back what the writers produced: header fields, program headers,
//! and section contents parsed from the raw bytes, the way a loader would.

use flap_object::{Arch, Image, ImportSym, Os, Target, layout_for, write};
use std::collections::HashMap;

fn image(target: Target) -> Image {
    let mut symbols = HashMap::new();
    symbols.insert("flap_start".to_string(), 32u64);
    Image {
        target,
        text: (0..128u32).map(|i| i as u8).collect(),
        rodata: b"roundtrip rodata".to_vec(),
        data: vec![0xaa; 40],
        symbols,
        entry: "flap_start".to_string(),
        imports: vec![
            ImportSym { name: "malloc".into(), lib: lib_for(target.os) },
            ImportSym { name: "printf".into(), lib: lib_for(target.os) },
            ImportSym { name: "exit".into(), lib: lib_for(target.os) },
        ],
        needed: vec![lib_for(target.os)],
    }
}

fn lib_for(os: Os) -> String {
    match os {
        Os::Linux => "libc.so.6".to_string(),
        Os::Darwin => "/usr/lib/libSystem.B.dylib".to_string(),
        Os::Windows => "msvcrt.dll".to_string(),
    }
}

fn u16_at(b: &[u8], at: usize) -> u16 {
    u16::from_le_bytes(b[at..at + 2].try_into().unwrap())
}

fn u32_at(b: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(b[at..at + 4].try_into().unwrap())
}

fn u64_at(b: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(b[at..at + 8].try_into().unwrap())
}

#[test]
fn test_elf_program_headers_parse_back() {
    for arch in [Arch::Amd64, Arch::Arm64, Arch::Riscv64] {
        let img = image(Target::new(arch, Os::Linux));
        let layout = layout_for(&img).unwrap();
        let bytes = write(&img, &layout).unwrap();

        let phoff = u64_at(&bytes, 32) as usize;
        let phentsize = u16_at(&bytes, 54) as usize;
        let phnum = u16_at(&bytes, 56) as usize;
        assert_eq!(phentsize, 56);
        assert_eq!(phnum, 5);

        // Walk the program headers; collect types in order
        let types: Vec<u32> = (0..phnum)
            .map(|i| u32_at(&bytes, phoff + i * phentsize))
            .collect();
        assert_eq!(types, vec![6, 3, 1, 1, 2]); // PHDR INTERP LOAD LOAD DYNAMIC

        // Both LOAD segments: file offset == vaddr - base, page-aligned RW
        for i in [2usize, 3] {
            let at = phoff + i * phentsize;
            let off = u64_at(&bytes, at + 8);
            let vaddr = u64_at(&bytes, at + 16);
            assert_eq!(vaddr - off, 0x40_0000, "arch {:?}", arch);
        }

        // Entry points at the defined symbol inside text
        let entry = u64_at(&bytes, 24);
        assert_eq!(entry, layout.text_addr + 32);
        assert_eq!(bytes[(entry - 0x40_0000) as usize], 32);
    }
}

#[test]
fn test_elf_dynamic_names_every_import() {
    let img = image(Target::new(Arch::Amd64, Os::Linux));
    let layout = layout_for(&img).unwrap();
    let bytes = write(&img, &layout).unwrap();
    for name in ["malloc", "printf", "exit"] {
        let mut needle = name.as_bytes().to_vec();
        needle.push(0);
        assert!(
            bytes.windows(needle.len()).any(|w| w == needle),
            "{} missing from dynstr",
            name
        );
    }
}

#[test]
fn test_elf_rodata_and_data_bytes_land_at_layout_addresses() {
    let img = image(Target::new(Arch::Amd64, Os::Linux));
    let layout = layout_for(&img).unwrap();
    let bytes = write(&img, &layout).unwrap();
    let ro = (layout.rodata_addr - 0x40_0000) as usize;
    assert_eq!(&bytes[ro..ro + img.rodata.len()], img.rodata.as_slice());
    let da = (layout.data_addr - 0x40_0000) as usize;
    assert_eq!(&bytes[da..da + img.data.len()], img.data.as_slice());
}

#[test]
fn test_macho_load_command_walk() {
    let img = image(Target::new(Arch::Arm64, Os::Darwin));
    let layout = layout_for(&img).unwrap();
    let bytes = write(&img, &layout).unwrap();

    let ncmds = u32_at(&bytes, 16) as usize;
    let sizeofcmds = u32_at(&bytes, 20) as usize;
    let mut at = 32;
    let mut seen = Vec::new();
    for _ in 0..ncmds {
        let cmd = u32_at(&bytes, at);
        let cmdsize = u32_at(&bytes, at + 4) as usize;
        assert!(cmdsize >= 8 && cmdsize % 4 == 0);
        seen.push(cmd);
        at += cmdsize;
    }
    assert_eq!(at, 32 + sizeofcmds, "load commands must fill sizeofcmds");
    assert!(seen.contains(&0x19)); // LC_SEGMENT_64
    assert!(seen.contains(&0x8000_0028)); // LC_MAIN
    assert!(seen.contains(&0x32)); // LC_BUILD_VERSION
    assert!(seen.contains(&0x1d)); // LC_CODE_SIGNATURE
}

#[test]
fn test_macho_text_segment_covers_file_start() {
    let img = image(Target::new(Arch::Arm64, Os::Darwin));
    let layout = layout_for(&img).unwrap();
    let bytes = write(&img, &layout).unwrap();
    // First LC_SEGMENT_64 after __PAGEZERO is __TEXT with fileoff 0
    let mut at = 32;
    let mut found = false;
    for _ in 0..u32_at(&bytes, 16) {
        let cmd = u32_at(&bytes, at);
        let cmdsize = u32_at(&bytes, at + 4) as usize;
        if cmd == 0x19 && &bytes[at + 8..at + 14] == b"__TEXT" {
            let fileoff = u64_at(&bytes, at + 40);
            assert_eq!(fileoff, 0);
            found = true;
        }
        at += cmdsize;
    }
    assert!(found, "__TEXT segment missing");
}

#[test]
fn test_pe_sections_parse_back() {
    let img = image(Target::new(Arch::Amd64, Os::Windows));
    let layout = layout_for(&img).unwrap();
    let bytes = write(&img, &layout).unwrap();

    let pe_at = u32_at(&bytes, 0x3c) as usize;
    assert_eq!(&bytes[pe_at..pe_at + 4], b"PE\0\0");
    let nsections = u16_at(&bytes, pe_at + 6) as usize;
    assert_eq!(nsections, 4);
    let opt_size = u16_at(&bytes, pe_at + 20) as usize;
    let sect_at = pe_at + 24 + opt_size;

    let mut names = Vec::new();
    for i in 0..nsections {
        let at = sect_at + i * 40;
        let name: Vec<u8> = bytes[at..at + 8].iter().copied().take_while(|b| *b != 0).collect();
        names.push(String::from_utf8(name).unwrap());
        // Raw data must sit at or after the headers
        let raw_at = u32_at(&bytes, at + 20);
        assert!(raw_at as usize >= sect_at + nsections * 40);
    }
    assert_eq!(names, vec![".text", ".rdata", ".data", ".idata"]);
}

#[test]
fn test_stub_addresses_unique_across_formats() {
    for target in [
        Target::new(Arch::Amd64, Os::Linux),
        Target::new(Arch::Arm64, Os::Darwin),
        Target::new(Arch::Amd64, Os::Windows),
    ] {
        let img = image(target);
        let layout = layout_for(&img).unwrap();
        let mut addrs: Vec<u64> = layout.stubs.values().copied().collect();
        addrs.sort();
        addrs.dedup();
        assert_eq!(addrs.len(), img.imports.len(), "{:?}", target);
    }
}
