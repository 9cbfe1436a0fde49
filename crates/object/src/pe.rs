//! PE32+ (Windows x86-64) executable writer
//!
//! DOS stub, COFF and optional headers, and four sections: `.text` (compiler
//! output plus one IAT jump thunk per import), `.rdata`, `.data`, `.idata`
//! (import directory referencing kernel32.dll / msvcrt.dll and any
//! manifest-declared DLLs). The image is marked as a console subsystem
//! program.
//!
//! Calls in compiler output remain plain `call rel32` to a per-import thunk
//! (`jmp [rip+IAT_slot]`); the thunks live at the end of `.text` and their
//! addresses are handed back through [`Layout::stubs`].

use crate::{Buf, Image, Layout, ObjectError, align_up};
use std::collections::HashMap;

const IMAGE_BASE: u64 = 0x1_4000_0000;
const SECTION_ALIGN: u64 = 0x1000;
const FILE_ALIGN: u64 = 0x200;

const MACHINE_AMD64: u16 = 0x8664;
/// EXECUTABLE_IMAGE | LARGE_ADDRESS_AWARE
const CHARACTERISTICS: u16 = 0x0022;
const SUBSYSTEM_CONSOLE: u16 = 3;
/// NX_COMPAT | TERMINAL_SERVER_AWARE
const DLL_CHARACTERISTICS: u16 = 0x8100;

const TEXT_CHARS: u32 = 0x6000_0020; // code | execute | read
const RDATA_CHARS: u32 = 0x4000_0040; // initialized data | read
const DATA_CHARS: u32 = 0xc000_0040; // initialized data | read | write
const IDATA_CHARS: u32 = 0xc000_0040; // IAT is written by the loader

const THUNK_SIZE: u64 = 8; // ff 25 rel32 + 2 bytes pad

/// DOS header + PE signature + COFF + optional header + 4 section headers,
/// rounded to the file alignment.
const HEADERS_SIZE: u64 = {
    let raw = 0x80 + 4 + 20 + 0xf0 + 4 * 40;
    (raw + FILE_ALIGN - 1) & !(FILE_ALIGN - 1)
};

/// Imports grouped by providing DLL, preserving first-seen order so the
/// import directory is deterministic.
fn by_dll(image: &Image) -> Vec<(String, Vec<String>)> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<String>> = HashMap::new();
    for imp in &image.imports {
        if !groups.contains_key(&imp.lib) {
            order.push(imp.lib.clone());
        }
        groups.entry(imp.lib.clone()).or_default().push(imp.name.clone());
    }
    order
        .into_iter()
        .map(|dll| {
            let syms = groups.remove(&dll).unwrap();
            (dll, syms)
        })
        .collect()
}

struct Regions {
    text_rva: u64,
    thunks_rva: u64,
    text_size: u64,
    rdata_rva: u64,
    data_rva: u64,
    idata_rva: u64,
    idata_size: u64,
    /// IAT slot RVA per import name.
    iat_slots: HashMap<String, u64>,
    image_size: u64,
}

/// Size of the import directory pieces: directory table, one ILT + IAT pair
/// per DLL, then hint/name entries and DLL name strings.
fn idata_interior(image: &Image, idata_rva: u64) -> (u64, HashMap<String, u64>, Vec<u8>) {
    let groups = by_dll(image);
    let n_dlls = groups.len() as u64;
    let dir_size = 20 * (n_dlls + 1);

    // Thunk arrays: ILT then IAT per DLL, each with a null terminator.
    let mut thunk_total = 0u64;
    for (_, syms) in &groups {
        thunk_total += 2 * 8 * (syms.len() as u64 + 1);
    }

    let hint_name_base = idata_rva + dir_size + thunk_total;
    let mut hint_names = Vec::new();
    let mut hint_rvas: HashMap<String, u64> = HashMap::new();
    for (_, syms) in &groups {
        for sym in syms {
            hint_rvas.insert(sym.clone(), hint_name_base + hint_names.len() as u64);
            hint_names.extend_from_slice(&[0, 0]); // hint
            hint_names.extend_from_slice(sym.as_bytes());
            hint_names.push(0);
            if hint_names.len() % 2 != 0 {
                hint_names.push(0);
            }
        }
    }
    let mut dll_name_rvas: HashMap<String, u64> = HashMap::new();
    for (dll, _) in &groups {
        dll_name_rvas.insert(dll.clone(), hint_name_base + hint_names.len() as u64);
        hint_names.extend_from_slice(dll.as_bytes());
        hint_names.push(0);
        if hint_names.len() % 2 != 0 {
            hint_names.push(0);
        }
    }

    let total = dir_size + thunk_total + hint_names.len() as u64;

    // Assemble bytes and record IAT slot RVAs.
    let mut iat_slots = HashMap::new();
    let mut b = Buf::new();
    let mut thunk_rva = idata_rva + dir_size;
    let mut spans = Vec::new(); // (ilt_rva, iat_rva) per dll
    for (_, syms) in &groups {
        let ilt = thunk_rva;
        let iat = thunk_rva + 8 * (syms.len() as u64 + 1);
        spans.push((ilt, iat));
        thunk_rva = iat + 8 * (syms.len() as u64 + 1);
    }

    for (i, (dll, _)) in groups.iter().enumerate() {
        let (ilt, iat) = spans[i];
        b.u32(ilt as u32); // OriginalFirstThunk
        b.u32(0); // TimeDateStamp
        b.u32(0); // ForwarderChain
        b.u32(dll_name_rvas[dll] as u32);
        b.u32(iat as u32); // FirstThunk
    }
    b.raw(&[0u8; 20]); // terminator

    for (i, (_, syms)) in groups.iter().enumerate() {
        let (_, iat) = spans[i];
        // ILT
        for sym in syms {
            b.u64(hint_rvas[sym]);
        }
        b.u64(0);
        // IAT (same initial contents)
        for (j, sym) in syms.iter().enumerate() {
            iat_slots.insert(sym.clone(), iat + 8 * j as u64);
            b.u64(hint_rvas[sym]);
        }
        b.u64(0);
    }
    b.raw(&hint_names);

    debug_assert_eq!(b.len() as u64, total);
    (total, iat_slots, b.bytes)
}

fn regions(image: &Image) -> Regions {
    let n = image.imports.len() as u64;
    let text_rva = SECTION_ALIGN;
    let thunks_rva = text_rva + align_up(image.text.len() as u64, 16);
    let text_size = thunks_rva - text_rva + THUNK_SIZE * n;
    let rdata_rva = align_up(text_rva + text_size, SECTION_ALIGN);
    let data_rva = align_up(rdata_rva + image.rodata.len().max(1) as u64, SECTION_ALIGN);
    let idata_rva = align_up(data_rva + image.data.len().max(1) as u64, SECTION_ALIGN);
    let (idata_size, iat_slots, _) = idata_interior(image, idata_rva);
    let image_size = align_up(idata_rva + idata_size, SECTION_ALIGN);
    Regions {
        text_rva,
        thunks_rva,
        text_size,
        rdata_rva,
        data_rva,
        idata_rva,
        idata_size,
        iat_slots,
        image_size,
    }
}

pub fn layout(image: &Image) -> Result<Layout, ObjectError> {
    let r = regions(image);
    let mut stubs = HashMap::new();
    for (i, imp) in image.imports.iter().enumerate() {
        stubs.insert(imp.name.clone(), IMAGE_BASE + r.thunks_rva + THUNK_SIZE * i as u64);
    }
    Ok(Layout {
        text_addr: IMAGE_BASE + r.text_rva,
        rodata_addr: IMAGE_BASE + r.rdata_rva,
        data_addr: IMAGE_BASE + r.data_rva,
        stubs,
    })
}

pub fn write(image: &Image, _layout: &Layout) -> Result<Vec<u8>, ObjectError> {
    let r = regions(image);
    let entry_rva = image
        .symbols
        .get(&image.entry)
        .map(|s| r.text_rva + s)
        .ok_or_else(|| ObjectError::NoEntry(image.entry.clone()))?;

    let mut b = Buf::new();

    // ---- DOS header ----
    b.raw(b"MZ");
    b.pad_to(0x3c);
    b.u32(0x80); // e_lfanew
    b.pad_to(0x80);

    // ---- PE signature + COFF header ----
    b.raw(b"PE\0\0");
    b.u16(MACHINE_AMD64);
    b.u16(4); // NumberOfSections
    b.u32(0); // TimeDateStamp: zero for deterministic output
    b.u32(0); // PointerToSymbolTable
    b.u32(0); // NumberOfSymbols
    b.u16(0xf0); // SizeOfOptionalHeader
    b.u16(CHARACTERISTICS);

    // ---- optional header (PE32+) ----
    b.u16(0x20b);
    b.u8(14); // linker major
    b.u8(0); // linker minor
    b.u32(r.text_size as u32); // SizeOfCode
    b.u32(0); // SizeOfInitializedData (informational)
    b.u32(0); // SizeOfUninitializedData
    b.u32(entry_rva as u32);
    b.u32(r.text_rva as u32); // BaseOfCode
    b.u64(IMAGE_BASE);
    b.u32(SECTION_ALIGN as u32);
    b.u32(FILE_ALIGN as u32);
    b.u16(6); // OS major
    b.u16(0);
    b.u16(0); // image version
    b.u16(0);
    b.u16(6); // subsystem version major
    b.u16(0);
    b.u32(0); // Win32VersionValue
    b.u32(r.image_size as u32);
    b.u32(HEADERS_SIZE as u32); // SizeOfHeaders
    b.u32(0); // CheckSum
    b.u16(SUBSYSTEM_CONSOLE);
    b.u16(DLL_CHARACTERISTICS);
    b.u64(0x10_0000); // stack reserve 1 MB
    b.u64(0x1000); // stack commit
    b.u64(0x10_0000); // heap reserve
    b.u64(0x1000); // heap commit
    b.u32(0); // LoaderFlags
    b.u32(16); // NumberOfRvaAndSizes

    // Data directories: only [1] import table is populated.
    for i in 0..16u32 {
        if i == 1 {
            b.u32(r.idata_rva as u32);
            b.u32(r.idata_size as u32);
        } else {
            b.u32(0);
            b.u32(0);
        }
    }

    // ---- section table ----
    let file_offsets = {
        let text_fo = HEADERS_SIZE;
        let rdata_fo = text_fo + align_up(r.text_size, FILE_ALIGN);
        let data_fo = rdata_fo + align_up(image.rodata.len().max(1) as u64, FILE_ALIGN);
        let idata_fo = data_fo + align_up(image.data.len().max(1) as u64, FILE_ALIGN);
        (text_fo, rdata_fo, data_fo, idata_fo)
    };
    let section = |b: &mut Buf, name: &[u8], vsize: u64, rva: u64, fsize: u64, foff: u64, chars: u32| {
        let mut nm = [0u8; 8];
        nm[..name.len()].copy_from_slice(name);
        b.raw(&nm);
        b.u32(vsize as u32);
        b.u32(rva as u32);
        b.u32(fsize as u32);
        b.u32(foff as u32);
        b.u32(0); // relocs
        b.u32(0); // line numbers
        b.u16(0);
        b.u16(0);
        b.u32(chars);
    };
    section(
        &mut b,
        b".text",
        r.text_size,
        r.text_rva,
        align_up(r.text_size, FILE_ALIGN),
        file_offsets.0,
        TEXT_CHARS,
    );
    section(
        &mut b,
        b".rdata",
        image.rodata.len().max(1) as u64,
        r.rdata_rva,
        align_up(image.rodata.len().max(1) as u64, FILE_ALIGN),
        file_offsets.1,
        RDATA_CHARS,
    );
    section(
        &mut b,
        b".data",
        image.data.len().max(1) as u64,
        r.data_rva,
        align_up(image.data.len().max(1) as u64, FILE_ALIGN),
        file_offsets.2,
        DATA_CHARS,
    );
    section(
        &mut b,
        b".idata",
        r.idata_size,
        r.idata_rva,
        align_up(r.idata_size, FILE_ALIGN),
        file_offsets.3,
        IDATA_CHARS,
    );

    // ---- .text ----
    b.pad_to(file_offsets.0 as usize);
    b.raw(&image.text);
    b.pad_to((file_offsets.0 + (r.thunks_rva - r.text_rva)) as usize);
    for (i, imp) in image.imports.iter().enumerate() {
        let thunk_rva = r.thunks_rva + THUNK_SIZE * i as u64;
        let slot_rva = r.iat_slots[&imp.name];
        // jmp [rip + disp32] ; rel to end of the 6-byte instruction
        let disp = slot_rva as i64 - (thunk_rva + 6) as i64;
        b.raw(&[0xff, 0x25]);
        b.u32(disp as i32 as u32);
        b.raw(&[0xcc, 0xcc]); // pad
    }

    // ---- .rdata / .data / .idata ----
    b.pad_to(file_offsets.1 as usize);
    b.raw(&image.rodata);
    b.pad_to(file_offsets.2 as usize);
    b.raw(&image.data);
    b.pad_to(file_offsets.3 as usize);
    let (_, _, idata_bytes) = idata_interior(image, r.idata_rva);
    b.raw(&idata_bytes);
    b.align(FILE_ALIGN as usize);

    Ok(b.bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Arch, ImportSym, Os, Target};

    fn sample_image() -> Image {
        let mut symbols = HashMap::new();
        symbols.insert("flap_start".to_string(), 0u64);
        Image {
            target: Target::new(Arch::Amd64, Os::Windows),
            text: vec![0xc3; 32],
            rodata: b"hello win".to_vec(),
            data: vec![0; 24],
            symbols,
            entry: "flap_start".to_string(),
            imports: vec![
                ImportSym { name: "ExitProcess".into(), lib: "kernel32.dll".into() },
                ImportSym { name: "printf".into(), lib: "msvcrt.dll".into() },
                ImportSym { name: "malloc".into(), lib: "msvcrt.dll".into() },
            ],
            needed: vec![],
        }
    }

    #[test]
    fn test_dos_and_pe_signatures() {
        let image = sample_image();
        let l = layout(&image).unwrap();
        let bytes = write(&image, &l).unwrap();
        assert_eq!(&bytes[0..2], b"MZ");
        assert_eq!(&bytes[0x80..0x84], b"PE\0\0");
        assert_eq!(
            u16::from_le_bytes(bytes[0x84..0x86].try_into().unwrap()),
            MACHINE_AMD64
        );
    }

    #[test]
    fn test_console_subsystem() {
        let image = sample_image();
        let l = layout(&image).unwrap();
        let bytes = write(&image, &l).unwrap();
        // Optional header follows the 4-byte PE signature and 20-byte COFF
        // header; the subsystem field sits at its offset 68
        let opt = 0x80 + 4 + 20;
        let subsystem = u16::from_le_bytes(bytes[opt + 68..opt + 70].try_into().unwrap());
        assert_eq!(subsystem, SUBSYSTEM_CONSOLE);
    }

    #[test]
    fn test_text_does_not_overlap_headers() {
        let image = sample_image();
        let l = layout(&image).unwrap();
        let bytes = write(&image, &l).unwrap();
        // First section's PointerToRawData, from the section table
        let sect0 = 0x80 + 4 + 20 + 0xf0;
        let text_fo = u32::from_le_bytes(bytes[sect0 + 20..sect0 + 24].try_into().unwrap());
        assert!(text_fo as u64 >= HEADERS_SIZE);
        // And the compiler's text bytes actually live there
        assert_eq!(bytes[text_fo as usize], 0xc3);
    }

    #[test]
    fn test_dll_names_present() {
        let image = sample_image();
        let l = layout(&image).unwrap();
        let bytes = write(&image, &l).unwrap();
        assert!(bytes.windows(13).any(|w| w == b"kernel32.dll\0"));
        assert!(bytes.windows(11).any(|w| w == b"msvcrt.dll\0"));
        assert!(bytes.windows(12).any(|w| w == b"ExitProcess\0"));
    }

    #[test]
    fn test_thunks_follow_text() {
        let image = sample_image();
        let l = layout(&image).unwrap();
        let r = regions(&image);
        for stub in l.stubs.values() {
            let rva = stub - IMAGE_BASE;
            assert!(rva >= r.thunks_rva && rva < r.text_rva + r.text_size);
        }
    }

    #[test]
    fn test_groups_keep_first_seen_dll_order() {
        let image = sample_image();
        let groups = by_dll(&image);
        assert_eq!(groups[0].0, "kernel32.dll");
        assert_eq!(groups[1].0, "msvcrt.dll");
        assert_eq!(groups[1].1, vec!["printf".to_string(), "malloc".to_string()]);
    }

    #[test]
    fn test_deterministic_output() {
        let image = sample_image();
        let l = layout(&image).unwrap();
        assert_eq!(write(&image, &l).unwrap(), write(&image, &l).unwrap());
    }
}
