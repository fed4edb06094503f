//! ASID pool assignment
//!
//! Every ASID pool object gets a slot in the kernel's ASID table. Slot 0
//! belongs to the initial thread's pool. Pools that already name a slot
//! keep it; the rest take the lowest free slots in object order.

use std::collections::BTreeSet;

use crate::error::{ComposeError, Result};
use crate::spec::{Object, ObjectId, ObjectSpace};

/// Assign ASID table slots, returning the number of pools
///
/// # Errors
/// - `InvalidConfig` if a preassigned slot is reserved, out of range or
///   taken twice
/// - `AsidPoolsExhausted` if there are more pools than free slots
pub fn assign_asid_slots(objects: &mut ObjectSpace, limit: usize) -> Result<usize> {
    let mut taken = BTreeSet::new();
    let mut fixed = Vec::new();
    let mut pending = Vec::new();

    for (id, named) in objects.spec().iter() {
        match named.object {
            Object::AsidPool { high: Some(high) } => {
                if high == 0 || high as usize >= limit || !taken.insert(high) {
                    return Err(ComposeError::InvalidConfig(format!(
                        "{}: ASID slot {} is reserved, out of range or taken",
                        named.name, high
                    )));
                }
                fixed.push((high, id));
            }
            Object::AsidPool { high: None } => pending.push(id),
            _ => {}
        }
    }

    let count = fixed.len() + pending.len();
    let mut free = (1..limit as u64).filter(|h| !taken.contains(h));
    let mut slots: Vec<(u64, ObjectId)> = fixed;
    for id in pending {
        let high = free
            .next()
            .ok_or(ComposeError::AsidPoolsExhausted { count, limit })?;
        if let Object::AsidPool { high: slot } = objects.object_mut(id) {
            *slot = Some(high);
        }
        slots.push((high, id));
    }

    slots.sort_unstable();
    objects.spec_mut().asid_slots = slots.into_iter().map(|(_, id)| id).collect();

    log::debug!("assigned {} ASID pools", count);
    Ok(count)
}
