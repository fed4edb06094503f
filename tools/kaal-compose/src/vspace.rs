//! VSpace Layout - virtual address cursor and mapping records
//!
//! Each component lays out its virtual address space with a bump cursor that
//! starts just past its program image and only ever moves forward. Mappings
//! are recorded against the component's address-space root and turned into
//! concrete paging structures when the component is finalized.
//!
//! # Architecture
//! - [`Cursor`]: monotonic next-free virtual address
//! - [`AddressSpace`]: non-overlapping mapping descriptors keyed by vaddr
//! - [`tile_range`]: greedy largest-page-first tiling of a virtual range

use std::collections::BTreeMap;

use crate::align::{checked_align_up, is_aligned};
use crate::error::{ComposeError, Result};
use crate::kernel_config::KernelConfig;
use crate::spec::{Cap, CapEntry, Object, ObjectId, ObjectSpace};

/// Next free virtual address of a component
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cursor {
    addr: u64,
}

impl Cursor {
    pub fn new(addr: u64) -> Self {
        Self { addr }
    }

    pub fn get(&self) -> u64 {
        self.addr
    }

    /// Align the cursor up to `size`, returning the new cursor
    ///
    /// # Errors
    /// Returns `InvalidAlignment` if `size` is not a power of two
    pub fn align(&mut self, size: u64) -> Result<u64> {
        self.advance(0, Some(size))?;
        Ok(self.addr)
    }

    /// Optionally align, then move forward by exactly `n` bytes
    ///
    /// Returns the consumed range `(start, end)`.
    ///
    /// # Errors
    /// - `InvalidAlignment` if `align` is not a power of two
    /// - `AddressOverflow` if the address space is exhausted
    pub fn advance(&mut self, n: u64, align: Option<u64>) -> Result<(u64, u64)> {
        let overflow = || ComposeError::AddressOverflow {
            cursor: self.addr,
            requested: n,
        };

        let start = match align {
            Some(align) if !align.is_power_of_two() => {
                return Err(ComposeError::InvalidAlignment { align })
            }
            Some(align) => checked_align_up(self.addr, align).ok_or_else(overflow)?,
            None => self.addr,
        };
        let end = start.checked_add(n).ok_or_else(overflow)?;

        self.addr = end;
        Ok((start, end))
    }

    /// Move the cursor forward to `target`
    ///
    /// # Errors
    /// Returns `CursorRegression` if `target` lies behind the cursor
    pub fn seek(&mut self, target: u64) -> Result<()> {
        if target < self.addr {
            return Err(ComposeError::CursorRegression {
                cursor: self.addr,
                target,
            });
        }
        self.advance(target - self.addr, None).map(|_| ())
    }
}

/// Split `[start, end)` into pages, trying the largest size first
///
/// `page_sizes` must be ascending. Each page is the largest size that both
/// divides its address and fits in what remains of the range.
///
/// # Errors
/// Returns `UntileableRange` if some address cannot start any page that fits
pub fn tile_range(page_sizes: &[u64], start: u64, end: u64) -> Result<Vec<(u64, u64)>> {
    let mut pages = Vec::new();
    let mut vaddr = start;
    while vaddr < end {
        let size = page_sizes
            .iter()
            .rev()
            .copied()
            .find(|&size| is_aligned(vaddr, size) && end - vaddr >= size)
            .ok_or(ComposeError::UntileableRange { start, end })?;
        pages.push((vaddr, size));
        vaddr += size;
    }
    Ok(pages)
}

/// One page mapped into an address space
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    pub vaddr: u64,
    pub size_bits: u8,
    pub cap: Cap,
}

impl Mapping {
    /// First address past the page, `None` if it would wrap
    pub fn end(&self) -> Option<u64> {
        self.vaddr.checked_add(1 << self.size_bits)
    }
}

/// Mapping records of one component's address space
#[derive(Debug)]
pub struct AddressSpace {
    owner: String,
    root: ObjectId,
    mappings: BTreeMap<u64, Mapping>,
}

impl AddressSpace {
    pub fn new(owner: impl Into<String>, root: ObjectId) -> Self {
        Self {
            owner: owner.into(),
            root,
            mappings: BTreeMap::new(),
        }
    }

    /// Address-space root (top-level page table)
    pub fn root(&self) -> ObjectId {
        self.root
    }

    /// Mappings in ascending virtual address order
    pub fn mappings(&self) -> impl Iterator<Item = &Mapping> {
        self.mappings.values()
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    /// Record a mapping
    ///
    /// # Errors
    /// - `MappingOverlap` if the page intersects an existing mapping
    /// - `AddressOverflow` if the page runs past the end of the address space
    pub fn insert(&mut self, mapping: Mapping) -> Result<()> {
        let start = mapping.vaddr;
        let end = mapping.end().ok_or(ComposeError::AddressOverflow {
            cursor: start,
            requested: 1 << mapping.size_bits,
        })?;

        let below = self.mappings.range(..end).next_back().map(|(_, m)| m);
        if let Some(existing) = below.filter(|m| m.end().is_some_and(|e| e > start)) {
            return Err(ComposeError::MappingOverlap {
                component: self.owner.clone(),
                start,
                end,
                existing: existing.vaddr,
            });
        }

        self.mappings.insert(start, mapping);
        Ok(())
    }

    /// Build the paging structures for every mapping
    ///
    /// Intermediate tables are allocated on first use in ascending virtual
    /// address order and named `<owner>_pt_l<level>_0x<prefix>`.
    pub fn finalize(&self, config: &KernelConfig, objects: &mut ObjectSpace) -> Result<()> {
        let index_bits = config.arch().paging_index_bits();
        let slot_index = |level: usize, vaddr: u64| {
            (vaddr >> config.slot_span_bits(level)) & ((1u64 << index_bits[level]) - 1)
        };

        let mut tables: BTreeMap<(usize, u64), ObjectId> = BTreeMap::new();
        let mut slots: BTreeMap<ObjectId, Vec<CapEntry>> = BTreeMap::new();

        for mapping in self.mappings.values() {
            let leaf = config
                .level_for_page_bits(mapping.size_bits)
                .ok_or(ComposeError::UnsupportedPageSize {
                    size: 1 << mapping.size_bits,
                })?;

            let mut table = self.root;
            for level in 1..=leaf {
                let prefix = mapping.vaddr & !((1u64 << config.table_span_bits(level)) - 1);
                let child = match tables.get(&(level, prefix)) {
                    Some(&child) => child,
                    None => {
                        let child = objects.alloc(
                            format!("{}_pt_l{}_{:#x}", self.owner, level, prefix),
                            Some(&self.owner),
                            Object::PageTable {
                                level: level as u8,
                                is_root: false,
                                slots: Vec::new(),
                            },
                        )?;
                        tables.insert((level, prefix), child);
                        slots.entry(table).or_default().push(CapEntry {
                            slot: slot_index(level - 1, mapping.vaddr),
                            cap: Cap::new(child),
                        });
                        child
                    }
                };
                table = child;
            }

            slots.entry(table).or_default().push(CapEntry {
                slot: slot_index(leaf, mapping.vaddr),
                cap: mapping.cap.clone(),
            });
        }

        for (table, mut entries) in slots {
            entries.sort_by_key(|e| e.slot);
            if let Object::PageTable { slots, .. } = objects.object_mut(table) {
                slots.extend(entries);
            }
        }

        log::debug!(
            "{}: {} mappings, {} intermediate tables",
            self.owner,
            self.mappings.len(),
            tables.len()
        );
        Ok(())
    }
}
