//! ELF64 executable writer
//!
//! Emits a section-header-less `ET_EXEC` image: the dynamic loader only
//! consults program headers and `PT_DYNAMIC`, so the file carries exactly
//! what execution needs. Five program headers are written: `PT_PHDR`,
//! `PT_INTERP`, one `PT_LOAD` for headers+text+rodata (R+X), one `PT_LOAD`
//! for dynamic+GOT+data (R+W), and `PT_DYNAMIC`.
//!
//! Lazy binding uses the classic PLT/GOT scheme: PLT entry 0 is the resolver
//! trampoline, entry i pushes relocation index i-1 and jumps to entry 0, and
//! `.got.plt` slots initially point back into the PLT so the first call
//! lands in the dynamic linker.

use crate::{Buf, Image, ImportSym, Layout, ObjectError, align_up};
use crate::{Arch, Os};
use std::collections::HashMap;

/// Load base for the R+X segment. File offsets equal `vaddr - BASE`.
const BASE: u64 = 0x40_0000;

const PAGE: u64 = 4096;

const EHDR_SIZE: u64 = 64;
const PHDR_SIZE: u64 = 56;
const PHDR_COUNT: u64 = 5;

const PT_LOAD: u32 = 1;
const PT_DYNAMIC: u32 = 2;
const PT_INTERP: u32 = 3;
const PT_PHDR: u32 = 6;

const PF_X: u32 = 1;
const PF_W: u32 = 2;
const PF_R: u32 = 4;

const DT_NEEDED: u64 = 1;
const DT_PLTRELSZ: u64 = 2;
const DT_PLTGOT: u64 = 3;
const DT_HASH: u64 = 4;
const DT_STRTAB: u64 = 5;
const DT_SYMTAB: u64 = 6;
const DT_STRSZ: u64 = 10;
const DT_SYMENT: u64 = 11;
const DT_REL_A: u64 = 7; // DT_RELA
const DT_RELAENT: u64 = 9;
const DT_PLTREL: u64 = 20;
const DT_JMPREL: u64 = 23;

const SYM_SIZE: u64 = 24;
const RELA_SIZE: u64 = 24;

const R_X86_64_JUMP_SLOT: u64 = 7;
const R_AARCH64_JUMP_SLOT: u64 = 1026;
const R_RISCV_JUMP_SLOT: u64 = 5;

/// STB_GLOBAL << 4 | STT_FUNC
const GLOBAL_FUNC: u8 = 0x12;

fn interp_path(arch: Arch) -> &'static [u8] {
    match arch {
        Arch::Amd64 => b"/lib64/ld-linux-x86-64.so.2\0",
        Arch::Arm64 => b"/lib/ld-linux-aarch64.so.1\0",
        Arch::Riscv64 => b"/lib/ld-linux-riscv64-lp64d.so.1\0",
    }
}

fn e_machine(arch: Arch) -> u16 {
    match arch {
        Arch::Amd64 => 62,    // EM_X86_64
        Arch::Arm64 => 183,   // EM_AARCH64
        Arch::Riscv64 => 243, // EM_RISCV
    }
}

fn e_flags(arch: Arch) -> u32 {
    match arch {
        // EF_RISCV_FLOAT_ABI_DOUBLE; no compressed instructions are emitted
        Arch::Riscv64 => 0x4,
        _ => 0,
    }
}

fn jump_slot_reloc(arch: Arch) -> u64 {
    match arch {
        Arch::Amd64 => R_X86_64_JUMP_SLOT,
        Arch::Arm64 => R_AARCH64_JUMP_SLOT,
        Arch::Riscv64 => R_RISCV_JUMP_SLOT,
    }
}

fn plt0_size(arch: Arch) -> u64 {
    match arch {
        Arch::Amd64 => 16,
        Arch::Arm64 => 32,
        Arch::Riscv64 => 32,
    }
}

const PLT_ENTRY_SIZE: u64 = 16;

/// Reserved slots at the head of `.got.plt` before per-import entries.
fn got_reserved(arch: Arch) -> u64 {
    match arch {
        // &_DYNAMIC, link map, resolver
        Arch::Amd64 | Arch::Arm64 => 3,
        // resolver, link map
        Arch::Riscv64 => 2,
    }
}

/// Region offsets computed once and shared by `layout` and `write`.
struct Regions {
    interp: u64,
    hash: u64,
    hash_size: u64,
    dynsym: u64,
    dynstr: u64,
    dynstr_size: u64,
    rela: u64,
    plt: u64,
    text: u64,
    rodata: u64,
    dynamic: u64,
    dynamic_size: u64,
    got: u64,
    data: u64,
    end: u64,
    /// dynstr offsets for import names and needed sonames
    str_offsets: HashMap<String, u64>,
}

fn build_dynstr(imports: &[ImportSym], needed: &[String]) -> (Vec<u8>, HashMap<String, u64>) {
    let mut bytes = vec![0u8]; // index 0 is the empty string
    let mut offsets = HashMap::new();
    let mut intern = |s: &str, bytes: &mut Vec<u8>, offsets: &mut HashMap<String, u64>| {
        if !offsets.contains_key(s) {
            offsets.insert(s.to_string(), bytes.len() as u64);
            bytes.extend_from_slice(s.as_bytes());
            bytes.push(0);
        }
    };
    for imp in imports {
        intern(&imp.name, &mut bytes, &mut offsets);
    }
    for lib in needed {
        intern(lib, &mut bytes, &mut offsets);
    }
    (bytes, offsets)
}

fn regions(image: &Image) -> Regions {
    let arch = image.target.arch;
    let n = image.imports.len() as u64;
    let (dynstr_bytes, str_offsets) = build_dynstr(&image.imports, &image.needed);

    let interp = EHDR_SIZE + PHDR_COUNT * PHDR_SIZE;
    let hash = align_up(interp + interp_path(arch).len() as u64, 8);
    // nbucket, nchain, one bucket, chains for null symbol + imports
    let hash_size = 4 * (2 + 1 + 1 + n);
    let dynsym = align_up(hash + hash_size, 8);
    let dynstr = dynsym + SYM_SIZE * (1 + n);
    let dynstr_size = dynstr_bytes.len() as u64;
    let rela = align_up(dynstr + dynstr_size, 8);
    let plt = align_up(rela + RELA_SIZE * n, 16);
    let text = align_up(plt + plt0_size(arch) + PLT_ENTRY_SIZE * n, 16);
    let rodata = align_up(text + image.text.len() as u64, 16);

    let rw = align_up(rodata + image.rodata.len() as u64, PAGE);
    // needed + 10 fixed tags + DT_NULL
    let dynamic_size = 16 * (image.needed.len() as u64 + 11);
    let dynamic = rw;
    let got = align_up(dynamic + dynamic_size, 8);
    let data = align_up(got + 8 * (got_reserved(arch) + n), 16);
    let end = data + image.data.len() as u64;

    Regions {
        interp,
        hash,
        hash_size,
        dynsym,
        dynstr,
        dynstr_size,
        rela,
        plt,
        text,
        rodata,
        dynamic,
        dynamic_size,
        got,
        data,
        end,
        str_offsets,
    }
}

pub fn layout(image: &Image) -> Result<Layout, ObjectError> {
    let r = regions(image);
    let arch = image.target.arch;
    let mut stubs = HashMap::new();
    for (i, imp) in image.imports.iter().enumerate() {
        stubs.insert(
            imp.name.clone(),
            BASE + r.plt + plt0_size(arch) + PLT_ENTRY_SIZE * i as u64,
        );
    }
    Ok(Layout {
        text_addr: BASE + r.text,
        rodata_addr: BASE + r.rodata,
        data_addr: BASE + r.data,
        stubs,
    })
}

pub fn write(image: &Image, layout: &Layout) -> Result<Vec<u8>, ObjectError> {
    let arch = image.target.arch;
    let r = regions(image);
    let n = image.imports.len() as u64;
    let entry = layout
        .symbol_addr(image, &image.entry)
        .ok_or_else(|| ObjectError::NoEntry(image.entry.clone()))?;

    let mut b = Buf::new();

    // ---- ELF header ----
    b.raw(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0]); // 64-bit, little-endian, SYSV
    b.raw(&[0; 8]);
    b.u16(2); // ET_EXEC
    b.u16(e_machine(arch));
    b.u32(1); // EV_CURRENT
    b.u64(entry);
    b.u64(EHDR_SIZE); // e_phoff
    b.u64(0); // e_shoff: no section headers
    b.u32(e_flags(arch));
    b.u16(EHDR_SIZE as u16);
    b.u16(PHDR_SIZE as u16);
    b.u16(PHDR_COUNT as u16);
    b.u16(0); // e_shentsize
    b.u16(0); // e_shnum
    b.u16(0); // e_shstrndx

    // ---- Program headers ----
    let phdr = |b: &mut Buf, ty: u32, flags: u32, off: u64, vaddr: u64, filesz: u64, memsz: u64, align: u64| {
        b.u32(ty);
        b.u32(flags);
        b.u64(off);
        b.u64(vaddr);
        b.u64(vaddr); // paddr mirrors vaddr
        b.u64(filesz);
        b.u64(memsz);
        b.u64(align);
    };

    let rx_end = r.rodata + image.rodata.len() as u64;
    let rw_size = r.end - r.dynamic;
    phdr(
        &mut b,
        PT_PHDR,
        PF_R,
        EHDR_SIZE,
        BASE + EHDR_SIZE,
        PHDR_COUNT * PHDR_SIZE,
        PHDR_COUNT * PHDR_SIZE,
        8,
    );
    phdr(
        &mut b,
        PT_INTERP,
        PF_R,
        r.interp,
        BASE + r.interp,
        interp_path(arch).len() as u64,
        interp_path(arch).len() as u64,
        1,
    );
    phdr(&mut b, PT_LOAD, PF_R | PF_X, 0, BASE, rx_end, rx_end, PAGE);
    phdr(
        &mut b,
        PT_LOAD,
        PF_R | PF_W,
        r.dynamic,
        BASE + r.dynamic,
        rw_size,
        rw_size,
        PAGE,
    );
    phdr(
        &mut b,
        PT_DYNAMIC,
        PF_R | PF_W,
        r.dynamic,
        BASE + r.dynamic,
        r.dynamic_size,
        r.dynamic_size,
        8,
    );

    // ---- .interp ----
    b.pad_to(r.interp as usize);
    b.raw(interp_path(arch));

    // ---- .hash ----
    b.pad_to(r.hash as usize);
    b.u32(1); // nbucket
    b.u32(1 + n as u32); // nchain
    b.u32(if n > 0 { 1 } else { 0 }); // bucket 0 -> first import
    b.u32(0); // chain of null symbol
    for i in 1..=n as u32 {
        b.u32(if i < n as u32 { i + 1 } else { 0 });
    }

    // ---- .dynsym ----
    b.pad_to(r.dynsym as usize);
    b.raw(&[0; SYM_SIZE as usize]); // null symbol
    for imp in &image.imports {
        b.u32(r.str_offsets[&imp.name] as u32);
        b.u8(GLOBAL_FUNC);
        b.u8(0);
        b.u16(0); // SHN_UNDEF
        b.u64(0);
        b.u64(0);
    }

    // ---- .dynstr ----
    b.pad_to(r.dynstr as usize);
    let (dynstr_bytes, _) = build_dynstr(&image.imports, &image.needed);
    b.raw(&dynstr_bytes);

    // ---- .rela.plt ----
    b.pad_to(r.rela as usize);
    let got_entries = BASE + r.got + 8 * got_reserved(arch);
    for (i, _) in image.imports.iter().enumerate() {
        b.u64(got_entries + 8 * i as u64);
        b.u64(((i as u64 + 1) << 32) | jump_slot_reloc(arch));
        b.u64(0);
    }

    // ---- .plt ----
    b.pad_to(r.plt as usize);
    let plt_addr = BASE + r.plt;
    let got_addr = BASE + r.got;
    match arch {
        Arch::Amd64 => write_plt_amd64(&mut b, plt_addr, got_addr, n),
        Arch::Arm64 => write_plt_arm64(&mut b, plt_addr, got_addr, n),
        Arch::Riscv64 => write_plt_riscv64(&mut b, plt_addr, got_addr, n),
    }

    // ---- .text / .rodata ----
    b.pad_to(r.text as usize);
    b.raw(&image.text);
    b.pad_to(r.rodata as usize);
    b.raw(&image.rodata);

    // ---- .dynamic ----
    b.pad_to(r.dynamic as usize);
    let dyn_tag = |b: &mut Buf, tag: u64, val: u64| {
        b.u64(tag);
        b.u64(val);
    };
    for lib in &image.needed {
        dyn_tag(&mut b, DT_NEEDED, r.str_offsets[lib]);
    }
    dyn_tag(&mut b, DT_HASH, BASE + r.hash);
    dyn_tag(&mut b, DT_STRTAB, BASE + r.dynstr);
    dyn_tag(&mut b, DT_SYMTAB, BASE + r.dynsym);
    dyn_tag(&mut b, DT_STRSZ, r.dynstr_size);
    dyn_tag(&mut b, DT_SYMENT, SYM_SIZE);
    dyn_tag(&mut b, DT_PLTGOT, got_addr);
    dyn_tag(&mut b, DT_PLTRELSZ, RELA_SIZE * n);
    dyn_tag(&mut b, DT_PLTREL, DT_REL_A);
    dyn_tag(&mut b, DT_JMPREL, BASE + r.rela);
    dyn_tag(&mut b, DT_RELAENT, RELA_SIZE);
    dyn_tag(&mut b, 0, 0); // DT_NULL

    // ---- .got.plt ----
    b.pad_to(r.got as usize);
    match arch {
        Arch::Amd64 | Arch::Arm64 => {
            b.u64(BASE + r.dynamic); // &_DYNAMIC
            b.u64(0); // link map, filled by ld.so
            b.u64(0); // resolver, filled by ld.so
        }
        Arch::Riscv64 => {
            b.u64(0); // resolver, filled by ld.so
            b.u64(0); // link map
        }
    }
    for i in 0..n {
        // Initial slot value: where the lazy-resolution path starts.
        let initial = match arch {
            // x86-64: the push instruction of the owning PLT entry
            Arch::Amd64 => plt_addr + plt0_size(arch) + PLT_ENTRY_SIZE * i + 6,
            // ARM64 / RISC-V: PLT entry 0
            Arch::Arm64 | Arch::Riscv64 => plt_addr,
        };
        b.u64(initial);
    }

    // ---- .data ----
    b.pad_to(r.data as usize);
    b.raw(&image.data);

    debug_assert_eq!(b.len() as u64, r.end);
    Ok(b.bytes)
}

// ---------------------------------------------------------------------------
// PLT stub templates
// ---------------------------------------------------------------------------

fn write_plt_amd64(b: &mut Buf, plt: u64, got: u64, n: u64) {
    let rel32 = |from_end: u64, to: u64| (to as i64 - from_end as i64) as i32 as u32;

    // PLT0: push [got+8]; jmp [got+16]; 4-byte nop pad
    b.raw(&[0xff, 0x35]);
    b.u32(rel32(plt + 6, got + 8));
    b.raw(&[0xff, 0x25]);
    b.u32(rel32(plt + 12, got + 16));
    b.raw(&[0x0f, 0x1f, 0x40, 0x00]);

    for i in 0..n {
        let entry = plt + 16 + 16 * i;
        let slot = got + 24 + 8 * i;
        // jmp [rip -> got slot]
        b.raw(&[0xff, 0x25]);
        b.u32(rel32(entry + 6, slot));
        // push reloc index
        b.u8(0x68);
        b.u32(i as u32);
        // jmp PLT0
        b.u8(0xe9);
        b.u32(rel32(entry + 16, plt));
    }
}

/// ADRP with the page delta from `pc` to `target`.
fn adrp(rd: u32, pc: u64, target: u64) -> u32 {
    let delta = ((target >> 12) as i64 - (pc >> 12) as i64) as u32;
    let immlo = delta & 0x3;
    let immhi = (delta >> 2) & 0x7_ffff;
    0x9000_0000 | (immlo << 29) | (immhi << 5) | rd
}

fn write_plt_arm64(b: &mut Buf, plt: u64, got: u64, n: u64) {
    let ldr_x17 = |base: u32, off: u64| 0xf940_0000u32 | (((off / 8) as u32) << 10) | (base << 5) | 17;
    let add_x16 = |off: u64| 0x9100_0000u32 | (((off & 0xfff) as u32) << 10) | (16 << 5) | 16;
    const BR_X17: u32 = 0xd61f_0220;
    const NOP: u32 = 0xd503_201f;

    // PLT0
    let got2 = got + 16;
    b.u32(0xa9bf_7bf0); // stp x16, x30, [sp, #-16]!
    b.u32(adrp(16, plt + 4, got2));
    b.u32(ldr_x17(16, got2 & 0xfff));
    b.u32(add_x16(got2));
    b.u32(BR_X17);
    b.u32(NOP);
    b.u32(NOP);
    b.u32(NOP);

    for i in 0..n {
        let entry = plt + 32 + 16 * i;
        let slot = got + 24 + 8 * i;
        b.u32(adrp(16, entry, slot));
        b.u32(ldr_x17(16, slot & 0xfff));
        b.u32(add_x16(slot));
        b.u32(BR_X17);
    }
}

fn write_plt_riscv64(b: &mut Buf, plt: u64, got: u64, n: u64) {
    let auipc = |rd: u32, hi: u32| 0x17u32 | (rd << 7) | (hi << 12);
    let ld = |rd: u32, rs1: u32, imm: i32| {
        ((imm as u32 & 0xfff) << 20) | (rs1 << 15) | (3 << 12) | (rd << 7) | 0x03
    };
    let addi = |rd: u32, rs1: u32, imm: i32| {
        ((imm as u32 & 0xfff) << 20) | (rs1 << 15) | (rd << 7) | 0x13
    };
    let srli = |rd: u32, rs1: u32, sh: u32| (sh << 20) | (rs1 << 15) | (5 << 12) | (rd << 7) | 0x13;
    let sub = |rd: u32, rs1: u32, rs2: u32| 0x4000_0000 | (rs2 << 20) | (rs1 << 15) | (rd << 7) | 0x33;
    let jalr = |rd: u32, rs1: u32| (rs1 << 15) | (rd << 7) | 0x67;

    // Split a pc-relative delta into a (hi20, lo12) pair with sign carry.
    let hi_lo = |pc: u64, target: u64| {
        let delta = target.wrapping_sub(pc) as i64;
        let hi = ((delta + 0x800) >> 12) as u32 & 0xf_ffff;
        let lo = (delta & 0xfff) as i32 - if delta & 0x800 != 0 { 0x1000 } else { 0 };
        (hi, lo)
    };

    // t0=x5 t1=x6 t2=x7 t3=x28
    let (hi, lo) = hi_lo(plt, got);
    b.u32(auipc(7, hi)); //  auipc t2, hi(.got.plt)
    b.u32(sub(6, 6, 28)); //  t1 = pc of stub jump + knowns
    b.u32(ld(28, 7, lo)); //  t3 = resolver from got[0]
    b.u32(addi(6, 6, -(plt0_size(Arch::Riscv64) as i32 + 12))); // t1 -> plt entry offset
    b.u32(addi(5, 7, lo)); //  t0 = &.got.plt
    b.u32(srli(6, 6, 1)); //  t1 = reloc offset (entries are 16B, slots 8B)
    b.u32(ld(5, 5, 8)); //  t0 = link map from got[1]
    b.u32(jalr(0, 28)); //  jr t3

    for i in 0..n {
        let entry = plt + 32 + 16 * i;
        let slot = got + 8 * (got_reserved(Arch::Riscv64) + i);
        let (hi, lo) = hi_lo(entry, slot);
        b.u32(auipc(28, hi)); // auipc t3, hi(slot)
        b.u32(ld(28, 28, lo)); // ld t3, lo(t3)
        b.u32(jalr(6, 28)); // jalr t1, t3
        b.u32(0x13); // nop
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Target;

    fn sample_image(arch: Arch) -> Image {
        let mut symbols = HashMap::new();
        symbols.insert("flap_start".to_string(), 0u64);
        Image {
            target: Target::new(arch, Os::Linux),
            text: vec![0x90; 64],
            rodata: b"hello".to_vec(),
            data: vec![0; 32],
            symbols,
            entry: "flap_start".to_string(),
            imports: vec![
                ImportSym { name: "malloc".into(), lib: "libc.so.6".into() },
                ImportSym { name: "printf".into(), lib: "libc.so.6".into() },
            ],
            needed: vec!["libc.so.6".to_string()],
        }
    }

    #[test]
    fn test_header_magic_and_machine() {
        let image = sample_image(Arch::Amd64);
        let l = layout(&image).unwrap();
        let bytes = write(&image, &l).unwrap();
        assert_eq!(&bytes[..4], &[0x7f, b'E', b'L', b'F']);
        assert_eq!(bytes[4], 2); // ELFCLASS64
        assert_eq!(bytes[5], 1); // little-endian
        assert_eq!(u16::from_le_bytes([bytes[16], bytes[17]]), 2); // ET_EXEC
        assert_eq!(u16::from_le_bytes([bytes[18], bytes[19]]), 62); // EM_X86_64
        assert_eq!(u16::from_le_bytes([bytes[56], bytes[57]]), 5); // e_phnum
    }

    #[test]
    fn test_entry_points_into_text() {
        let image = sample_image(Arch::Amd64);
        let l = layout(&image).unwrap();
        let bytes = write(&image, &l).unwrap();
        let entry = u64::from_le_bytes(bytes[24..32].try_into().unwrap());
        assert_eq!(entry, l.text_addr);
        // File offset mirrors vaddr - BASE and holds the text bytes
        let off = (entry - BASE) as usize;
        assert_eq!(bytes[off], 0x90);
    }

    #[test]
    fn test_stub_addresses_are_distinct_and_ordered() {
        for arch in [Arch::Amd64, Arch::Arm64, Arch::Riscv64] {
            let image = sample_image(arch);
            let l = layout(&image).unwrap();
            let a = l.stubs["malloc"];
            let b = l.stubs["printf"];
            assert_eq!(b - a, PLT_ENTRY_SIZE, "arch {:?}", arch);
            assert!(a < l.text_addr);
        }
    }

    #[test]
    fn test_interp_embedded() {
        let image = sample_image(Arch::Arm64);
        let l = layout(&image).unwrap();
        let bytes = write(&image, &l).unwrap();
        let needle = b"/lib/ld-linux-aarch64.so.1\0";
        assert!(
            bytes.windows(needle.len()).any(|w| w == needle),
            "interp path missing"
        );
    }

    #[test]
    fn test_needed_soname_in_dynstr() {
        let image = sample_image(Arch::Amd64);
        let l = layout(&image).unwrap();
        let bytes = write(&image, &l).unwrap();
        assert!(bytes.windows(10).any(|w| w == b"libc.so.6\0"));
    }

    #[test]
    fn test_deterministic_output() {
        let image = sample_image(Arch::Riscv64);
        let l1 = layout(&image).unwrap();
        let b1 = write(&image, &l1).unwrap();
        let l2 = layout(&image).unwrap();
        let b2 = write(&image, &l2).unwrap();
        assert_eq!(b1, b2);
    }

    #[test]
    fn test_rw_segment_page_aligned() {
        let image = sample_image(Arch::Amd64);
        let r = regions(&image);
        assert_eq!(r.dynamic % PAGE, 0);
        assert!(r.dynamic > r.rodata);
    }
}
