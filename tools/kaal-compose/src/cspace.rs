//! Capability Table Allocator
//!
//! Hands out slots of one component's CNode. Slot 0 is the null slot, so
//! allocation starts at 1 and grows monotonically; slots are never reused.
//!
//! The table size is unknown until every slot of the component has been
//! allocated, so it is frozen at finalize:
//!
//! ```text
//! size_bits  = max(MIN_SIZE_BITS, ceil(log2(next_slot)))
//! guard_size = word_bits - size_bits        (thread cspace caps that asked for it)
//! ```

use crate::align::ceil_log2;
use crate::error::{ComposeError, Result};
use crate::spec::{Cap, CapEntry, CapSlot, Object, ObjectId, ObjectSpace};

/// Smallest capability table (16 slots)
pub const MIN_SIZE_BITS: u8 = 4;

/// Slot allocator for one CNode
#[derive(Debug)]
pub struct CSpace {
    cnode: ObjectId,
    next_slot: CapSlot,
    entries: Vec<CapEntry>,
    /// Threads whose `cspace` cap guard size is resolved at finalize
    deferred: Vec<ObjectId>,
    size_bits: Option<u8>,
}

impl CSpace {
    pub fn new(cnode: ObjectId) -> Self {
        Self {
            cnode,
            next_slot: 1,
            entries: Vec::new(),
            deferred: Vec::new(),
            size_bits: None,
        }
    }

    pub fn cnode(&self) -> ObjectId {
        self.cnode
    }

    /// Next slot to be handed out
    pub fn next_slot(&self) -> CapSlot {
        self.next_slot
    }

    pub fn entries(&self) -> &[CapEntry] {
        &self.entries
    }

    /// Frozen table size, `None` before finalize
    pub fn size_bits(&self) -> Option<u8> {
        self.size_bits
    }

    /// Store `cap` in the next free slot
    pub fn alloc(&mut self, cap: Cap) -> CapSlot {
        let slot = self.next_slot;
        self.next_slot += 1;
        self.entries.push(CapEntry { slot, cap });
        slot
    }

    /// Resolve the guard size of thread `tcb`'s `cspace` cap once the table
    /// is frozen
    pub fn defer_guard_size(&mut self, tcb: ObjectId) {
        self.deferred.push(tcb);
    }

    /// Table size needed to hold slots `[0, next_slot)`
    pub fn required_size_bits(&self) -> u8 {
        (ceil_log2(self.next_slot) as u8).max(MIN_SIZE_BITS)
    }

    /// Freeze the table size and write slots into the CNode object
    ///
    /// # Errors
    /// - `ComponentFrozen` if the table was already frozen
    /// - `InvalidConfig` if a deferred thread target is not a TCB
    pub fn finalize(&mut self, word_bits: u32, objects: &mut ObjectSpace) -> Result<u8> {
        if self.size_bits.is_some() {
            return Err(ComposeError::ComponentFrozen(
                objects.get(self.cnode).name.clone(),
            ));
        }

        let size_bits = self.required_size_bits();
        let guard_size = (word_bits as u8).saturating_sub(size_bits);

        for &id in &self.deferred {
            let name = objects.get(id).name.clone();
            let tcb = objects.tcb_mut(id).ok_or_else(|| {
                ComposeError::InvalidConfig(format!("{} is not a thread control object", name))
            })?;
            if let Some(cap) = tcb.cspace.as_mut() {
                cap.guard_size = Some(guard_size);
            }
        }

        if let Object::CNode {
            size_bits: bits,
            slots,
        } = objects.object_mut(self.cnode)
        {
            *bits = Some(size_bits);
            *slots = self.entries.clone();
        }

        log::debug!(
            "froze {} at {} bits ({} slots used)",
            objects.get(self.cnode).name,
            size_bits,
            self.next_slot - 1
        );
        self.size_bits = Some(size_bits);
        Ok(size_bits)
    }
}
