//! ELF program images
//!
//! Parses the loadable segments of a component image and derives two things
//! from them: the first virtual address past the image (where the
//! component's layout cursor starts), and the image object spec, i.e. the
//! file-backed pages that hold the image itself.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use goblin::elf::program_header::{PF_R, PF_W, PF_X, PT_LOAD};
use goblin::elf::Elf;

use crate::align::{align_down, align_up};
use crate::error::{ComposeError, Result};
use crate::spec::{FillEntry, ObjectId, Rights};

/// One `PT_LOAD` segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub vaddr: u64,
    pub memsz: u64,
    pub filesz: u64,
    /// Offset of the segment's bytes in the file
    pub offset: u64,
    /// `p_flags` (`PF_R`, `PF_W`, `PF_X`)
    pub flags: u32,
}

impl Segment {
    fn rights(&self) -> Rights {
        let mut rights = Rights::empty();
        if self.flags & PF_R != 0 {
            rights |= Rights::READ;
        }
        if self.flags & PF_W != 0 {
            rights |= Rights::WRITE;
        }
        rights
    }

    fn executable(&self) -> bool {
        self.flags & PF_X != 0
    }
}

/// Loadable view of an ELF file
#[derive(Debug, Clone)]
pub struct ElfImage {
    path: PathBuf,
    entry: u64,
    segments: Vec<Segment>,
}

impl ElfImage {
    /// Read and parse an ELF file
    ///
    /// # Errors
    /// - `Io` if the file cannot be read
    /// - `Elf` if it is not a valid ELF file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read(path).map_err(|e| ComposeError::io(path, e))?;
        Self::parse(path, &data)
    }

    /// Parse ELF bytes read from `path`
    pub fn parse(path: impl AsRef<Path>, data: &[u8]) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let elf = Elf::parse(data).map_err(|source| ComposeError::Elf {
            path: path.clone(),
            source,
        })?;

        let segments: Vec<Segment> = elf
            .program_headers
            .iter()
            .filter(|ph| ph.p_type == PT_LOAD)
            .map(|ph| Segment {
                vaddr: ph.p_vaddr,
                memsz: ph.p_memsz,
                filesz: ph.p_filesz,
                offset: ph.p_offset,
                flags: ph.p_flags,
            })
            .collect();

        log::debug!(
            "{}: entry {:#x}, {} loadable segments",
            path.display(),
            elf.entry,
            segments.len()
        );

        Ok(Self::from_parts(path, elf.entry, segments))
    }

    pub fn from_parts(path: impl Into<PathBuf>, entry: u64, segments: Vec<Segment>) -> Self {
        Self {
            path: path.into(),
            entry,
            segments,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entry(&self) -> u64 {
        self.entry
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// First virtual address past every loadable segment
    pub fn end_vaddr(&self) -> u64 {
        self.segments
            .iter()
            .map(|s| s.vaddr + s.memsz)
            .max()
            .unwrap_or(0)
    }

    /// Pages backing the image, with fills referencing the file `fname`
    ///
    /// A page shared by several segments carries the union of their rights
    /// and all of their fills.
    pub fn object_spec(&self, page_size: u64, fname: &str, root: ObjectId) -> ImageSpec {
        let mut pages: BTreeMap<u64, ImagePage> = BTreeMap::new();

        for seg in self.segments.iter().filter(|s| s.memsz > 0) {
            let file_end = seg.vaddr + seg.filesz;
            let mut page = align_down(seg.vaddr, page_size);
            let end = align_up(seg.vaddr + seg.memsz, page_size);

            while page < end {
                let entry = pages.entry(page).or_insert_with(|| ImagePage {
                    vaddr: page,
                    rights: Rights::empty(),
                    executable: false,
                    fill: Vec::new(),
                });
                entry.rights |= seg.rights();
                entry.executable |= seg.executable();

                let lo = page.max(seg.vaddr);
                let hi = (page + page_size).min(file_end);
                if lo < hi {
                    entry.fill.push(FillEntry::new(
                        lo - page,
                        hi - lo,
                        fname,
                        seg.offset + (lo - seg.vaddr),
                    ));
                    entry.fill.sort_by_key(|f| f.offset);
                }

                page += page_size;
            }
        }

        ImageSpec {
            root,
            page_size,
            pages,
        }
    }
}

/// One page of a program image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePage {
    pub vaddr: u64,
    pub rights: Rights,
    pub executable: bool,
    pub fill: Vec<FillEntry>,
}

/// Pages a program image needs, bound to the address space they belong in
#[derive(Debug, Clone)]
pub struct ImageSpec {
    root: ObjectId,
    page_size: u64,
    pages: BTreeMap<u64, ImagePage>,
}

impl ImageSpec {
    /// Address-space root the pages are to be mapped into
    pub fn root(&self) -> ObjectId {
        self.root
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Pages in ascending virtual address order
    pub fn pages(&self) -> impl Iterator<Item = &ImagePage> {
        self.pages.values()
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}
