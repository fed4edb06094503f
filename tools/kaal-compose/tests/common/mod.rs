//! Shared fixtures: minimal ELF images and composition contexts

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use kaal_compose::{Arch, BlobEncoder, CompositionContext, KernelConfig};

pub const PF_X: u32 = 1;
pub const PF_W: u32 = 2;
pub const PF_R: u32 = 4;

/// A `PT_LOAD` segment of a test image
#[derive(Debug, Clone, Copy)]
pub struct TestSegment {
    pub vaddr: u64,
    pub flags: u32,
    pub filesz: u64,
    pub memsz: u64,
}

/// Text at 0x40_0000, data + bss at 0x41_0000
pub const DEFAULT_SEGMENTS: [TestSegment; 2] = [
    TestSegment {
        vaddr: 0x40_0000,
        flags: PF_R | PF_X,
        filesz: 0x180,
        memsz: 0x180,
    },
    TestSegment {
        vaddr: 0x41_0000,
        flags: PF_R | PF_W,
        filesz: 0x40,
        memsz: 0x2000,
    },
];

pub const DEFAULT_ENTRY: u64 = 0x40_0000;

/// Bytes of a little-endian ELF64 aarch64 executable
pub fn build_elf(entry: u64, segments: &[TestSegment]) -> Vec<u8> {
    const EHDR_SIZE: u64 = 64;
    const PHDR_SIZE: u64 = 56;

    let mut out = Vec::new();
    out.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0]);
    out.extend_from_slice(&[0; 8]);
    out.extend_from_slice(&2u16.to_le_bytes()); // ET_EXEC
    out.extend_from_slice(&183u16.to_le_bytes()); // EM_AARCH64
    out.extend_from_slice(&1u32.to_le_bytes());
    out.extend_from_slice(&entry.to_le_bytes());
    out.extend_from_slice(&EHDR_SIZE.to_le_bytes()); // e_phoff
    out.extend_from_slice(&0u64.to_le_bytes()); // e_shoff
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&(EHDR_SIZE as u16).to_le_bytes());
    out.extend_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
    out.extend_from_slice(&(segments.len() as u16).to_le_bytes());
    out.extend_from_slice(&64u16.to_le_bytes()); // e_shentsize
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());

    // File offsets congruent to vaddr modulo the page size
    let mut offsets = Vec::with_capacity(segments.len());
    let mut next = 0x1000u64;
    for seg in segments {
        let offset = next + seg.vaddr % 0x1000;
        offsets.push(offset);
        next = (offset + seg.filesz + 0xfff) & !0xfff;
    }

    for (seg, &offset) in segments.iter().zip(&offsets) {
        out.extend_from_slice(&1u32.to_le_bytes()); // PT_LOAD
        out.extend_from_slice(&seg.flags.to_le_bytes());
        out.extend_from_slice(&offset.to_le_bytes());
        out.extend_from_slice(&seg.vaddr.to_le_bytes());
        out.extend_from_slice(&seg.vaddr.to_le_bytes());
        out.extend_from_slice(&seg.filesz.to_le_bytes());
        out.extend_from_slice(&seg.memsz.to_le_bytes());
        out.extend_from_slice(&0x1000u64.to_le_bytes());
    }

    for (i, (seg, &offset)) in segments.iter().zip(&offsets).enumerate() {
        out.resize(offset as usize, 0);
        out.extend((0..seg.filesz).map(|b| (b as u8) ^ (i as u8 + 1)));
    }
    out
}

/// Write the default test image to `dir/<name>.elf`
pub fn write_image(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(format!("{}.elf", name));
    fs::write(&path, build_elf(DEFAULT_ENTRY, &DEFAULT_SEGMENTS)).unwrap();
    path
}

/// aarch64 context writing to `out_dir`, encoding runtime configs in-process
pub fn context(out_dir: &Path, mcs: bool) -> CompositionContext {
    CompositionContext::new(KernelConfig::new(Arch::Aarch64, mcs), out_dir)
        .with_runtime_config_encoder(BlobEncoder::Postcard)
}
