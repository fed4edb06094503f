//! Untyped Covering Allocator
//!
//! Assigns every object of the composition a physical home inside an
//! untyped chunk of the platform's memory map.
//!
//! # Algorithm
//!
//! ```text
//! 1. regions  -> aligned_chunks(word_size)          candidate chunks
//! 2. objects with a fixed paddr, in object order:
//!        buddy-split the chunk containing paddr down to the object size
//! 3. remaining objects, largest first (ties in object order):
//!        best fit: smallest non-device candidate that is large enough
//!        (ties in candidate order), split, take the lower half
//! 4. one root untyped per chunk that received objects,
//!    leftover candidates optionally exposed as spare untypeds
//! ```
//!
//! Split-off upper halves are appended to the candidate list, so candidate
//! order is insertion order, not address order.

use std::collections::BTreeMap;

use crate::align::aligned_chunks;
use crate::error::{ComposeError, Result};
use crate::kernel_config::ObjectSizes;
use crate::spec::{Object, ObjectId, ObjectSpace, UntypedChild, UntypedCover};

/// A power-of-two region of physical memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UntypedChunk {
    pub paddr: u64,
    pub size_bits: u8,
    pub device: bool,
}

impl UntypedChunk {
    pub fn size(&self) -> u64 {
        1 << self.size_bits
    }

    /// First address past the chunk, `None` for a chunk ending at the top of memory
    pub fn end(&self) -> Option<u64> {
        self.paddr.checked_add(self.size())
    }

    fn contains(&self, paddr: u64, size_bits: u8) -> bool {
        size_bits <= self.size_bits
            && self.paddr <= paddr
            && paddr - self.paddr <= self.size() - (1 << size_bits)
    }

    fn halves(&self) -> (UntypedChunk, UntypedChunk) {
        let size_bits = self.size_bits - 1;
        let lo = UntypedChunk { size_bits, ..*self };
        let hi = UntypedChunk {
            paddr: self.paddr + (1 << size_bits),
            ..lo
        };
        (lo, hi)
    }
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    root: usize,
    chunk: UntypedChunk,
}

#[derive(Debug, Clone, Copy)]
struct Request {
    object: ObjectId,
    size_bits: u8,
    paddr: Option<u64>,
}

/// Outcome of a covering pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoverReport {
    /// Root untyped objects created
    pub roots: Vec<ObjectId>,
    /// Number of objects placed
    pub covered: usize,
    /// Chunks no object was placed in
    pub spares: Vec<UntypedChunk>,
}

/// Best-fit untyped allocator
#[derive(Debug, Clone)]
pub struct UntypedAllocator {
    max_size_bits: u32,
    roots: Vec<UntypedChunk>,
}

impl UntypedAllocator {
    /// `max_size_bits` bounds chunk sizes (the machine word size)
    pub fn new(max_size_bits: u32) -> Self {
        Self {
            max_size_bits,
            roots: Vec::new(),
        }
    }

    /// Add every aligned chunk of `[start, end)`
    pub fn add_region(&mut self, start: u64, end: u64, device: bool) {
        for (paddr, size_bits) in aligned_chunks(self.max_size_bits, start, end) {
            self.add_untyped(UntypedChunk {
                paddr,
                size_bits,
                device,
            });
        }
    }

    pub fn add_untyped(&mut self, chunk: UntypedChunk) {
        self.roots.push(chunk);
    }

    pub fn roots(&self) -> &[UntypedChunk] {
        &self.roots
    }

    /// Place every untyped-backed object of `objects`
    ///
    /// Creates `root_untyped_0x<paddr>` objects with their covers, and
    /// `spare_untyped_0x<paddr>` objects for leftovers if `expose_spares`.
    ///
    /// # Errors
    /// - `MisalignedPhysicalAddress` if a fixed address is not size aligned
    /// - `UncoveredPhysicalAddress` if no chunk contains a fixed address
    /// - `UntypedExhausted` if no chunk can hold an object
    /// - `UnsizedCNode` if a capability table was never sized
    pub fn allocate(
        &self,
        objects: &mut ObjectSpace,
        sizes: &ObjectSizes,
        expose_spares: bool,
    ) -> Result<CoverReport> {
        if let Some((_, named)) = objects
            .spec()
            .iter()
            .find(|(_, named)| matches!(named.object, Object::CNode { size_bits: None, .. }))
        {
            return Err(ComposeError::UnsizedCNode(named.name.clone()));
        }

        let requests: Vec<Request> = objects
            .spec()
            .iter()
            .filter_map(|(object, named)| {
                sizes.size_bits(&named.object).map(|size_bits| Request {
                    object,
                    size_bits,
                    paddr: named.object.paddr(),
                })
            })
            .collect();

        let mut candidates: Vec<Option<Candidate>> = self
            .roots
            .iter()
            .enumerate()
            .map(|(root, &chunk)| Some(Candidate { root, chunk }))
            .collect();
        let mut children: BTreeMap<usize, Vec<UntypedChild>> = BTreeMap::new();

        for req in requests.iter().filter(|r| r.paddr.is_some()) {
            let paddr = req.paddr.unwrap_or_default();
            let name = || objects.get(req.object).name.clone();

            if paddr % (1 << req.size_bits) != 0 {
                return Err(ComposeError::MisalignedPhysicalAddress {
                    object: name(),
                    paddr,
                    size_bits: req.size_bits,
                });
            }

            let (index, mut cur) = candidates
                .iter()
                .enumerate()
                .find_map(|(i, c)| c.filter(|c| c.chunk.contains(paddr, req.size_bits)).map(|c| (i, c)))
                .ok_or_else(|| ComposeError::UncoveredPhysicalAddress { object: name(), paddr })?;
            candidates[index] = None;

            while cur.chunk.size_bits > req.size_bits {
                let (lo, hi) = cur.chunk.halves();
                let (keep, spare) = if lo.contains(paddr, req.size_bits) { (lo, hi) } else { (hi, lo) };
                candidates.push(Some(Candidate {
                    root: cur.root,
                    chunk: spare,
                }));
                cur.chunk = keep;
            }

            children.entry(cur.root).or_default().push(UntypedChild {
                object: req.object,
                paddr,
            });
        }

        let mut free: Vec<&Request> = requests.iter().filter(|r| r.paddr.is_none()).collect();
        free.sort_by(|a, b| b.size_bits.cmp(&a.size_bits));

        for req in free {
            let best = candidates
                .iter()
                .enumerate()
                .filter_map(|(i, c)| c.map(|c| (i, c)))
                .filter(|(_, c)| !c.chunk.device && c.chunk.size_bits >= req.size_bits)
                .min_by_key(|(i, c)| (c.chunk.size_bits, *i));

            let Some((index, mut cur)) = best else {
                return Err(ComposeError::UntypedExhausted {
                    object: objects.get(req.object).name.clone(),
                    size_bits: req.size_bits,
                });
            };
            candidates[index] = None;

            while cur.chunk.size_bits > req.size_bits {
                let (lo, hi) = cur.chunk.halves();
                candidates.push(Some(Candidate {
                    root: cur.root,
                    chunk: hi,
                }));
                cur.chunk = lo;
            }

            children.entry(cur.root).or_default().push(UntypedChild {
                object: req.object,
                paddr: cur.chunk.paddr,
            });
        }

        let spares: Vec<Candidate> = candidates.into_iter().flatten().collect();
        let mut report = CoverReport {
            covered: children.values().map(Vec::len).sum(),
            spares: spares.iter().map(|c| c.chunk).collect(),
            ..Default::default()
        };

        let mut spare_roots = Vec::new();
        if expose_spares {
            for spare in &spares {
                let id = objects.alloc(
                    format!("spare_untyped_{:#x}", spare.chunk.paddr),
                    None,
                    untyped_object(&spare.chunk),
                )?;
                if children.contains_key(&spare.root) {
                    children.entry(spare.root).or_default().push(UntypedChild {
                        object: id,
                        paddr: spare.chunk.paddr,
                    });
                } else {
                    spare_roots.push(id);
                }
            }
        }

        for (root, mut kids) in children {
            let chunk = &self.roots[root];
            let parent = objects.alloc(
                format!("root_untyped_{:#x}", chunk.paddr),
                None,
                untyped_object(chunk),
            )?;
            kids.sort_by_key(|c| c.paddr);
            objects.spec_mut().untyped_covers.push(UntypedCover {
                parent,
                children: kids,
            });
            report.roots.push(parent);
        }

        log::info!(
            "Untyped covering: {} objects in {} root untypeds, {} spare chunks ({} exposed)",
            report.covered,
            report.roots.len(),
            report.spares.len(),
            if expose_spares { report.spares.len() } else { 0 }
        );
        log::debug!("{} spare untypeds outside any root", spare_roots.len());

        Ok(report)
    }
}

fn untyped_object(chunk: &UntypedChunk) -> Object {
    Object::Untyped {
        size_bits: chunk.size_bits,
        paddr: Some(chunk.paddr),
        device: chunk.device,
    }
}
