//! Mach-O (ARM64) executable writer
//!
//! Produces an `MH_EXECUTE` image for macOS on Apple Silicon:
//! `__PAGEZERO`, `__TEXT` (holding `__text`, `__stubs`, `__const`),
//! `__DATA_CONST` (the GOT), `__DATA`, and `__LINKEDIT` with classic
//! dyld bind opcodes for the imported symbols and an embedded ad-hoc
//! code signature (SuperBlob containing one SHA-256 CodeDirectory).
//!
//! Symbol names on this platform carry a leading underscore; the compiler
//! uses bare C names and the underscore is added here when bind info is
//! emitted.

use crate::{Buf, Image, Layout, ObjectError, align_up};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

const VM_BASE: u64 = 0x1_0000_0000;
const PAGE: u64 = 16384;

const MH_MAGIC_64: u32 = 0xfeed_facf;
const CPU_TYPE_ARM64: u32 = 0x0100_000c;
const CPU_SUBTYPE_ARM64_ALL: u32 = 0;
const MH_EXECUTE: u32 = 2;
/// MH_NOUNDEFS | MH_DYLDLINK | MH_TWOLEVEL | MH_PIE
const MH_FLAGS: u32 = 0x0020_0085;

const LC_SEGMENT_64: u32 = 0x19;
const LC_SYMTAB: u32 = 0x2;
const LC_DYSYMTAB: u32 = 0xb;
const LC_LOAD_DYLINKER: u32 = 0xe;
const LC_LOAD_DYLIB: u32 = 0xc;
const LC_DYLD_INFO_ONLY: u32 = 0x8000_0022;
const LC_MAIN: u32 = 0x8000_0028;
const LC_BUILD_VERSION: u32 = 0x32;
const LC_CODE_SIGNATURE: u32 = 0x1d;

const VM_PROT_RX: u32 = 0x5;
const VM_PROT_RW: u32 = 0x3;
const VM_PROT_R: u32 = 0x1;

const S_REGULAR: u32 = 0;
const S_ATTR_PURE_INSTRUCTIONS: u32 = 0x8000_0000;
const S_ATTR_SOME_INSTRUCTIONS: u32 = 0x0000_0400;
const S_NON_LAZY_SYMBOL_POINTERS: u32 = 0x6;

const BIND_OPCODE_DONE: u8 = 0x00;
const BIND_OPCODE_SET_DYLIB_ORDINAL_IMM: u8 = 0x10;
const BIND_OPCODE_SET_SYMBOL_FLAGS_IMM: u8 = 0x40;
const BIND_OPCODE_SET_TYPE_IMM: u8 = 0x50;
const BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB: u8 = 0x70;
const BIND_OPCODE_DO_BIND: u8 = 0x90;
const BIND_TYPE_POINTER: u8 = 1;

const CSMAGIC_EMBEDDED_SIGNATURE: u32 = 0xfade_0cc0;
const CSMAGIC_CODEDIRECTORY: u32 = 0xfade_0c02;
const CSSLOT_CODEDIRECTORY: u32 = 0;
const CS_ADHOC: u32 = 0x2;
const CS_EXECSEG_MAIN_BINARY: u64 = 0x1;
const CD_VERSION: u32 = 0x2_0400;
const CD_HEADER_SIZE: u32 = 88;
/// Signing page size: 16 KB pages, log2 encoded.
const CS_PAGE_LOG2: u8 = 14;
const CS_PAGE: usize = 1 << CS_PAGE_LOG2;

const DYLINKER_PATH: &str = "/usr/lib/dyld";
const LIBSYSTEM: &str = "/usr/lib/libSystem.B.dylib";

const STUB_SIZE: u64 = 12;

/// Identifier baked into the CodeDirectory. Fixed so output is
/// byte-for-byte deterministic regardless of output path.
const SIGN_IDENT: &str = "flap.out";

struct Regions {
    sizeofcmds: u32,
    ncmds: u32,
    text_off: u64,
    stubs_off: u64,
    const_off: u64,
    text_seg_size: u64,
    got_off: u64,
    got_seg_size: u64,
    data_off: u64,
    data_seg_size: u64,
    linkedit_off: u64,
    bind_size: u64,
    sig_off: u64,
    sig_size: u64,
}

fn uleb(b: &mut Vec<u8>, mut v: u64) {
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v != 0 {
            b.push(byte | 0x80);
        } else {
            b.push(byte);
            break;
        }
    }
}

/// One pointer bind per import, targeting its GOT slot in `__DATA_CONST`
/// (segment index 2: `__PAGEZERO`, `__TEXT`, `__DATA_CONST`, ...).
fn bind_opcodes(image: &Image) -> Vec<u8> {
    let mut b = Vec::new();
    for (i, imp) in image.imports.iter().enumerate() {
        b.push(BIND_OPCODE_SET_DYLIB_ORDINAL_IMM | 1);
        b.push(BIND_OPCODE_SET_SYMBOL_FLAGS_IMM);
        b.push(b'_');
        b.extend_from_slice(imp.name.as_bytes());
        b.push(0);
        b.push(BIND_OPCODE_SET_TYPE_IMM | BIND_TYPE_POINTER);
        b.push(BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | 2);
        uleb(&mut b, 8 * i as u64);
        b.push(BIND_OPCODE_DO_BIND);
    }
    b.push(BIND_OPCODE_DONE);
    b
}

fn padded_str_len(s: &str) -> u32 {
    align_up(s.len() as u64 + 1, 8) as u32
}

fn regions(image: &Image) -> Regions {
    let n = image.imports.len() as u64;

    // __PAGEZERO + __TEXT(3 sections) + __DATA_CONST(1) + __DATA(1) + __LINKEDIT
    let seg_cmds = 72 + (72 + 3 * 80) + (72 + 80) + (72 + 80) + 72;
    let dylinker_cmd = 12 + padded_str_len(DYLINKER_PATH);
    let dylib_cmd = 24 + padded_str_len(LIBSYSTEM);
    let sizeofcmds =
        seg_cmds + 48 + 24 + 80 + dylinker_cmd + dylib_cmd + 24 + 24 + 16;
    let ncmds = 13;

    let text_off = align_up(32 + sizeofcmds as u64, 16);
    let stubs_off = align_up(text_off + image.text.len() as u64, 4);
    let const_off = align_up(stubs_off + STUB_SIZE * n, 16);
    let text_seg_size = align_up(const_off + image.rodata.len() as u64, PAGE);

    let got_off = text_seg_size;
    let got_seg_size = align_up((8 * n).max(8), PAGE);
    let data_off = got_off + got_seg_size;
    let data_seg_size = align_up((image.data.len() as u64).max(8), PAGE);
    let linkedit_off = data_off + data_seg_size;

    let bind_size = bind_opcodes(image).len() as u64;
    let sig_off = align_up(linkedit_off + bind_size, 16);

    let n_pages = sig_off.div_ceil(CS_PAGE as u64);
    let cd_size = CD_HEADER_SIZE as u64 + SIGN_IDENT.len() as u64 + 1 + 32 * n_pages;
    let sig_size = 12 + 8 + cd_size; // SuperBlob header + one index entry + CD

    Regions {
        sizeofcmds,
        ncmds,
        text_off,
        stubs_off,
        const_off,
        text_seg_size,
        got_off,
        got_seg_size,
        data_off,
        data_seg_size,
        linkedit_off,
        bind_size,
        sig_off,
        sig_size,
    }
}

pub fn layout(image: &Image) -> Result<Layout, ObjectError> {
    let r = regions(image);
    let mut stubs = HashMap::new();
    for (i, imp) in image.imports.iter().enumerate() {
        stubs.insert(imp.name.clone(), VM_BASE + r.stubs_off + STUB_SIZE * i as u64);
    }
    Ok(Layout {
        text_addr: VM_BASE + r.text_off,
        rodata_addr: VM_BASE + r.const_off,
        data_addr: VM_BASE + r.data_off,
        stubs,
    })
}

fn adrp(rd: u32, pc: u64, target: u64) -> u32 {
    let delta = ((target >> 12) as i64 - (pc >> 12) as i64) as u32;
    let immlo = delta & 0x3;
    let immhi = (delta >> 2) & 0x7_ffff;
    0x9000_0000 | (immlo << 29) | (immhi << 5) | rd
}

pub fn write(image: &Image, layout: &Layout) -> Result<Vec<u8>, ObjectError> {
    let r = regions(image);
    let n = image.imports.len() as u64;
    let entry_off = image
        .symbols
        .get(&image.entry)
        .map(|s| r.text_off + s)
        .ok_or_else(|| ObjectError::NoEntry(image.entry.clone()))?;

    let mut b = Buf::new();

    // ---- header ----
    b.u32(MH_MAGIC_64);
    b.u32(CPU_TYPE_ARM64);
    b.u32(CPU_SUBTYPE_ARM64_ALL);
    b.u32(MH_EXECUTE);
    b.u32(r.ncmds);
    b.u32(r.sizeofcmds);
    b.u32(MH_FLAGS);
    b.u32(0); // reserved

    // ---- segments ----
    let segment = |b: &mut Buf,
                   name: &str,
                   vmaddr: u64,
                   vmsize: u64,
                   fileoff: u64,
                   filesize: u64,
                   maxprot: u32,
                   initprot: u32,
                   nsects: u32| {
        b.u32(LC_SEGMENT_64);
        b.u32(72 + nsects * 80);
        let mut nm = [0u8; 16];
        nm[..name.len()].copy_from_slice(name.as_bytes());
        b.raw(&nm);
        b.u64(vmaddr);
        b.u64(vmsize);
        b.u64(fileoff);
        b.u64(filesize);
        b.u32(maxprot);
        b.u32(initprot);
        b.u32(nsects);
        b.u32(0); // flags
    };
    let section = |b: &mut Buf,
                   sectname: &str,
                   segname: &str,
                   addr: u64,
                   size: u64,
                   offset: u64,
                   align: u32,
                   flags: u32,
                   reserved1: u32| {
        let mut nm = [0u8; 16];
        nm[..sectname.len()].copy_from_slice(sectname.as_bytes());
        b.raw(&nm);
        let mut sg = [0u8; 16];
        sg[..segname.len()].copy_from_slice(segname.as_bytes());
        b.raw(&sg);
        b.u64(addr);
        b.u64(size);
        b.u32(offset as u32);
        b.u32(align);
        b.u32(0); // reloff
        b.u32(0); // nreloc
        b.u32(flags);
        b.u32(reserved1);
        b.u32(0); // reserved2
        b.u32(0); // reserved3
    };

    segment(&mut b, "__PAGEZERO", 0, VM_BASE, 0, 0, 0, 0, 0);

    segment(
        &mut b,
        "__TEXT",
        VM_BASE,
        r.text_seg_size,
        0,
        r.text_seg_size,
        VM_PROT_RX,
        VM_PROT_RX,
        3,
    );
    section(
        &mut b,
        "__text",
        "__TEXT",
        VM_BASE + r.text_off,
        image.text.len() as u64,
        r.text_off,
        4,
        S_REGULAR | S_ATTR_PURE_INSTRUCTIONS | S_ATTR_SOME_INSTRUCTIONS,
        0,
    );
    section(
        &mut b,
        "__stubs",
        "__TEXT",
        VM_BASE + r.stubs_off,
        STUB_SIZE * n,
        r.stubs_off,
        2,
        S_REGULAR | S_ATTR_PURE_INSTRUCTIONS | S_ATTR_SOME_INSTRUCTIONS,
        0,
    );
    section(
        &mut b,
        "__const",
        "__TEXT",
        VM_BASE + r.const_off,
        image.rodata.len() as u64,
        r.const_off,
        4,
        S_REGULAR,
        0,
    );

    segment(
        &mut b,
        "__DATA_CONST",
        VM_BASE + r.got_off,
        r.got_seg_size,
        r.got_off,
        r.got_seg_size,
        VM_PROT_RW,
        VM_PROT_RW,
        1,
    );
    section(
        &mut b,
        "__got",
        "__DATA_CONST",
        VM_BASE + r.got_off,
        8 * n,
        r.got_off,
        3,
        S_NON_LAZY_SYMBOL_POINTERS,
        0,
    );

    segment(
        &mut b,
        "__DATA",
        VM_BASE + r.data_off,
        r.data_seg_size,
        r.data_off,
        r.data_seg_size,
        VM_PROT_RW,
        VM_PROT_RW,
        1,
    );
    section(
        &mut b,
        "__data",
        "__DATA",
        VM_BASE + r.data_off,
        image.data.len() as u64,
        r.data_off,
        4,
        S_REGULAR,
        0,
    );

    let linkedit_size = r.sig_off + r.sig_size - r.linkedit_off;
    segment(
        &mut b,
        "__LINKEDIT",
        VM_BASE + r.linkedit_off,
        align_up(linkedit_size, PAGE),
        r.linkedit_off,
        linkedit_size,
        VM_PROT_R,
        VM_PROT_R,
        0,
    );

    // ---- LC_DYLD_INFO_ONLY ----
    b.u32(LC_DYLD_INFO_ONLY);
    b.u32(48);
    b.u32(0); // rebase_off
    b.u32(0); // rebase_size
    b.u32(r.linkedit_off as u32);
    b.u32(r.bind_size as u32);
    b.u32(0); // weak bind
    b.u32(0);
    b.u32(0); // lazy bind
    b.u32(0);
    b.u32(0); // export
    b.u32(0);

    // ---- LC_SYMTAB (empty) / LC_DYSYMTAB (empty) ----
    b.u32(LC_SYMTAB);
    b.u32(24);
    b.u32(0);
    b.u32(0);
    b.u32(0);
    b.u32(0);

    b.u32(LC_DYSYMTAB);
    b.u32(80);
    for _ in 0..18 {
        b.u32(0);
    }

    // ---- LC_LOAD_DYLINKER ----
    b.u32(LC_LOAD_DYLINKER);
    b.u32(12 + padded_str_len(DYLINKER_PATH));
    b.u32(12); // name offset
    b.raw(DYLINKER_PATH.as_bytes());
    for _ in 0..(padded_str_len(DYLINKER_PATH) as usize - DYLINKER_PATH.len()) {
        b.u8(0);
    }

    // ---- LC_LOAD_DYLIB (libSystem) ----
    b.u32(LC_LOAD_DYLIB);
    b.u32(24 + padded_str_len(LIBSYSTEM));
    b.u32(24); // name offset
    b.u32(2); // timestamp
    b.u32(0x0001_0000); // current version 1.0.0
    b.u32(0x0001_0000); // compatibility version
    b.raw(LIBSYSTEM.as_bytes());
    for _ in 0..(padded_str_len(LIBSYSTEM) as usize - LIBSYSTEM.len()) {
        b.u8(0);
    }

    // ---- LC_MAIN ----
    b.u32(LC_MAIN);
    b.u32(24);
    b.u64(entry_off);
    b.u64(0); // stack size: default

    // ---- LC_BUILD_VERSION ----
    b.u32(LC_BUILD_VERSION);
    b.u32(24);
    b.u32(1); // PLATFORM_MACOS
    b.u32(0x000b_0000); // minos 11.0
    b.u32(0x000b_0000); // sdk 11.0
    b.u32(0); // ntools

    // ---- LC_CODE_SIGNATURE ----
    b.u32(LC_CODE_SIGNATURE);
    b.u32(16);
    b.u32(r.sig_off as u32);
    b.u32(r.sig_size as u32);

    // ---- section contents ----
    b.pad_to(r.text_off as usize);
    b.raw(&image.text);
    b.pad_to(r.stubs_off as usize);
    for (i, imp) in image.imports.iter().enumerate() {
        let stub_addr = layout.stubs[&imp.name];
        let slot = VM_BASE + r.got_off + 8 * i as u64;
        b.u32(adrp(16, stub_addr, slot));
        // ldr x16, [x16, #lo12(slot)]
        b.u32(0xf940_0000 | ((((slot & 0xfff) / 8) as u32) << 10) | (16 << 5) | 16);
        b.u32(0xd61f_0200); // br x16
    }
    b.pad_to(r.const_off as usize);
    b.raw(&image.rodata);

    // GOT slots start zeroed; dyld binds them at load.
    b.pad_to(r.got_off as usize);
    b.pad_to(r.data_off as usize);
    b.raw(&image.data);

    // ---- __LINKEDIT: bind info + signature ----
    b.pad_to(r.linkedit_off as usize);
    b.raw(&bind_opcodes(image));
    b.pad_to(r.sig_off as usize);
    let sig = build_signature(&b.bytes, r.sig_off);
    b.raw(&sig);

    Ok(b.bytes)
}

/// SuperBlob with a single SHA-256 CodeDirectory covering every 16 KB page
/// of the file up to the signature itself.
fn build_signature(file: &[u8], code_limit: u64) -> Vec<u8> {
    let n_pages = code_limit.div_ceil(CS_PAGE as u64);
    let ident_len = SIGN_IDENT.len() as u32 + 1;
    let cd_len = CD_HEADER_SIZE + ident_len + 32 * n_pages as u32;
    let total = 12 + 8 + cd_len;

    let mut b = Buf::new();
    b.u32_be(CSMAGIC_EMBEDDED_SIGNATURE);
    b.u32_be(total);
    b.u32_be(1); // blob count
    b.u32_be(CSSLOT_CODEDIRECTORY);
    b.u32_be(20); // CD offset within SuperBlob

    b.u32_be(CSMAGIC_CODEDIRECTORY);
    b.u32_be(cd_len);
    b.u32_be(CD_VERSION);
    b.u32_be(CS_ADHOC);
    b.u32_be(CD_HEADER_SIZE + ident_len); // hashOffset
    b.u32_be(CD_HEADER_SIZE); // identOffset
    b.u32_be(0); // nSpecialSlots
    b.u32_be(n_pages as u32);
    b.u32_be(code_limit as u32);
    b.u8(32); // hashSize
    b.u8(2); // hashType: SHA-256
    b.u8(0); // platform
    b.u8(CS_PAGE_LOG2);
    b.u32_be(0); // spare2
    b.u32_be(0); // scatterOffset
    b.u32_be(0); // teamOffset
    b.u32_be(0); // spare3
    b.bytes.extend_from_slice(&(code_limit).to_be_bytes()); // codeLimit64
    b.bytes.extend_from_slice(&0u64.to_be_bytes()); // execSegBase
    b.bytes.extend_from_slice(&code_limit.to_be_bytes()); // execSegLimit
    b.bytes.extend_from_slice(&CS_EXECSEG_MAIN_BINARY.to_be_bytes());

    b.raw(SIGN_IDENT.as_bytes());
    b.u8(0);

    for page in 0..n_pages {
        let start = (page as usize) * CS_PAGE;
        let end = ((start + CS_PAGE) as u64).min(code_limit) as usize;
        let digest = Sha256::digest(&file[start..end]);
        b.raw(&digest);
    }

    b.bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Arch, ImportSym, Os, Target};

    fn sample_image() -> Image {
        let mut symbols = HashMap::new();
        symbols.insert("flap_start".to_string(), 16u64);
        Image {
            target: Target::new(Arch::Arm64, Os::Darwin),
            text: vec![0x1f, 0x20, 0x03, 0xd5].repeat(8), // nops
            rodata: b"hello mac".to_vec(),
            data: vec![0; 16],
            symbols,
            entry: "flap_start".to_string(),
            imports: vec![
                ImportSym { name: "malloc".into(), lib: LIBSYSTEM.into() },
                ImportSym { name: "exit".into(), lib: LIBSYSTEM.into() },
            ],
            needed: vec![LIBSYSTEM.to_string()],
        }
    }

    #[test]
    fn test_header_magic() {
        let image = sample_image();
        let l = layout(&image).unwrap();
        let bytes = write(&image, &l).unwrap();
        assert_eq!(u32::from_le_bytes(bytes[0..4].try_into().unwrap()), MH_MAGIC_64);
        assert_eq!(
            u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            CPU_TYPE_ARM64
        );
        assert_eq!(u32::from_le_bytes(bytes[12..16].try_into().unwrap()), MH_EXECUTE);
    }

    #[test]
    fn test_bind_names_carry_underscore() {
        let image = sample_image();
        let ops = bind_opcodes(&image);
        let as_str = String::from_utf8_lossy(&ops);
        assert!(as_str.contains("_malloc"));
        assert!(as_str.contains("_exit"));
    }

    #[test]
    fn test_signature_present_and_last() {
        let image = sample_image();
        let l = layout(&image).unwrap();
        let bytes = write(&image, &l).unwrap();
        let r = regions(&image);
        let magic = u32::from_be_bytes(
            bytes[r.sig_off as usize..r.sig_off as usize + 4].try_into().unwrap(),
        );
        assert_eq!(magic, CSMAGIC_EMBEDDED_SIGNATURE);
        assert_eq!(bytes.len() as u64, r.sig_off + r.sig_size);
    }

    #[test]
    fn test_signature_hashes_verify() {
        let image = sample_image();
        let l = layout(&image).unwrap();
        let bytes = write(&image, &l).unwrap();
        let r = regions(&image);
        // First page hash stored in the CD must match a recomputation.
        let cd = r.sig_off as usize + 20;
        let ident_len = SIGN_IDENT.len() + 1;
        let hash0_at = cd + CD_HEADER_SIZE as usize + ident_len;
        let expect = Sha256::digest(&bytes[0..CS_PAGE.min(r.sig_off as usize)]);
        assert_eq!(&bytes[hash0_at..hash0_at + 32], expect.as_slice());
    }

    #[test]
    fn test_stubs_inside_text_segment() {
        let image = sample_image();
        let l = layout(&image).unwrap();
        let r = regions(&image);
        for stub in l.stubs.values() {
            let off = stub - VM_BASE;
            assert!(off >= r.stubs_off && off < r.const_off);
        }
    }

    #[test]
    fn test_deterministic_output() {
        let image = sample_image();
        let l = layout(&image).unwrap();
        let b1 = write(&image, &l).unwrap();
        let b2 = write(&image, &l).unwrap();
        assert_eq!(b1, b2);
    }
}
