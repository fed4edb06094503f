//! Object Space - the composed system's kernel objects and capabilities
//!
//! Every object the composer allocates lives in one [`ObjectSpace`], an arena
//! indexed by [`ObjectId`] in allocation order. Components refer to objects
//! only by id, so later passes (capability table freezing, page-table
//! materialization, untyped covering) can resolve references without holding
//! borrows across the composition.
//!
//! ## Object Kinds
//!
//! ```text
//! Untyped        raw physical memory, parent of retyped objects
//! CNode          capability table (size frozen at finalize)
//! Tcb            thread control object
//! Endpoint       synchronous IPC rendezvous
//! Notification   asynchronous signal word
//! Reply          reply authority (MCS kernels)
//! SchedContext   time budget (MCS kernels)
//! Frame          mappable memory, optionally file-backed or at a fixed paddr
//! PageTable      paging structure (the root is a component's address space)
//! Irq            interrupt handler bound to a notification
//! AsidPool       ASID pool
//! ```

mod render;

use std::collections::HashMap;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::{ComposeError, Result};
use crate::kernel_config::Arch;

/// Index of an object in the [`ObjectSpace`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub usize);

/// Index into a capability table
pub type CapSlot = u64;

bitflags! {
    /// Access rights carried by a capability
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Rights: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const GRANT = 1 << 2;
        const GRANT_REPLY = 1 << 3;

        const RW = Self::READ.bits() | Self::WRITE.bits();
    }
}

/// A capability to one object
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Cap {
    pub object: ObjectId,
    pub rights: Rights,
    pub badge: u64,
    /// Guard size of a capability-table cap, `None` until resolved
    pub guard_size: Option<u8>,
    pub cached: bool,
    pub executable: bool,
}

impl Cap {
    /// Cap with all rights, no badge, cached
    pub fn new(object: ObjectId) -> Self {
        Self {
            object,
            rights: Rights::all(),
            badge: 0,
            guard_size: None,
            cached: true,
            executable: false,
        }
    }

    pub fn with_rights(mut self, rights: Rights) -> Self {
        self.rights = rights;
        self
    }

    pub fn with_badge(mut self, badge: u64) -> Self {
        self.badge = badge;
        self
    }

    pub fn with_cached(mut self, cached: bool) -> Self {
        self.cached = cached;
        self
    }

    pub fn with_executable(mut self, executable: bool) -> Self {
        self.executable = executable;
        self
    }
}

/// One occupied slot of a table-like object
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CapEntry {
    pub slot: CapSlot,
    pub cap: Cap,
}

/// Initial content of part of a frame, taken from a named file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FillEntry {
    /// Offset within the frame
    pub offset: u64,
    /// Number of bytes to copy
    pub length: u64,
    /// File name as registered with the composition
    pub file: String,
    /// Offset within the file
    pub file_offset: u64,
}

impl FillEntry {
    pub fn new(offset: u64, length: u64, file: impl Into<String>, file_offset: u64) -> Self {
        Self {
            offset,
            length,
            file: file.into(),
            file_offset,
        }
    }
}

/// Thread control object
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Tcb {
    pub ip: u64,
    pub sp: u64,
    pub ipc_buffer_addr: u64,
    pub prio: u8,
    pub max_prio: u8,
    pub affinity: u64,
    pub resume: bool,
    /// Initial general purpose registers
    pub gprs: Vec<u64>,
    pub cspace: Option<Cap>,
    pub vspace: Option<Cap>,
    pub ipc_buffer: Option<Cap>,
    pub sched_context: Option<Cap>,
}

/// Frame object
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Frame {
    pub size_bits: u8,
    pub paddr: Option<u64>,
    pub device: bool,
    pub fill: Vec<FillEntry>,
}

/// A kernel object
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Object {
    Untyped {
        size_bits: u8,
        paddr: Option<u64>,
        device: bool,
    },
    Endpoint,
    Notification,
    Reply,
    CNode {
        /// `None` until the owning component is finalized
        size_bits: Option<u8>,
        slots: Vec<CapEntry>,
    },
    Tcb(Tcb),
    Irq {
        irq: u64,
        notification: Option<Cap>,
    },
    Frame(Frame),
    PageTable {
        level: u8,
        is_root: bool,
        slots: Vec<CapEntry>,
    },
    AsidPool {
        high: Option<u64>,
    },
    SchedContext {
        size_bits: u8,
        period: u64,
        budget: u64,
    },
}

impl Object {
    /// Short kind name used in logs and rendered specs
    pub fn kind(&self) -> &'static str {
        match self {
            Object::Untyped { .. } => "ut",
            Object::Endpoint => "ep",
            Object::Notification => "notification",
            Object::Reply => "rtreply",
            Object::CNode { .. } => "cnode",
            Object::Tcb(_) => "tcb",
            Object::Irq { .. } => "irq",
            Object::Frame(_) => "frame",
            Object::PageTable { .. } => "pt",
            Object::AsidPool { .. } => "asid_pool",
            Object::SchedContext { .. } => "sc",
        }
    }

    /// Fixed physical address, if any
    pub fn paddr(&self) -> Option<u64> {
        match self {
            Object::Untyped { paddr, .. } => *paddr,
            Object::Frame(frame) => frame.paddr,
            _ => None,
        }
    }

    pub fn frame(size_bits: u8) -> Self {
        Object::Frame(Frame {
            size_bits,
            paddr: None,
            device: false,
            fill: Vec::new(),
        })
    }
}

/// An object with its unique name and the label of the component owning it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NamedObject {
    pub name: String,
    pub label: Option<String>,
    pub object: Object,
}

/// IRQ number to handler object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IrqEntry {
    pub irq: u64,
    pub handler: ObjectId,
}

/// An object retyped out of a root untyped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UntypedChild {
    pub object: ObjectId,
    pub paddr: u64,
}

/// Objects retyped out of one root untyped, in physical address order
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UntypedCover {
    pub parent: ObjectId,
    pub children: Vec<UntypedChild>,
}

/// The complete capability distribution
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Spec {
    pub arch: Arch,
    pub objects: Vec<NamedObject>,
    pub irqs: Vec<IrqEntry>,
    pub asid_slots: Vec<ObjectId>,
    pub untyped_covers: Vec<UntypedCover>,
}

impl Spec {
    pub fn new(arch: Arch) -> Self {
        Self {
            arch,
            objects: Vec::new(),
            irqs: Vec::new(),
            asid_slots: Vec::new(),
            untyped_covers: Vec::new(),
        }
    }

    pub fn object(&self, id: ObjectId) -> &NamedObject {
        &self.objects[id.0]
    }

    pub fn name_of(&self, id: ObjectId) -> &str {
        &self.objects[id.0].name
    }

    /// Iterate over objects with their ids
    pub fn iter(&self) -> impl Iterator<Item = (ObjectId, &NamedObject)> {
        self.objects.iter().enumerate().map(|(i, o)| (ObjectId(i), o))
    }

    /// Serialize as pretty JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Arena owning every object of the composition
#[derive(Debug)]
pub struct ObjectSpace {
    spec: Spec,
    names: HashMap<String, ObjectId>,
}

impl ObjectSpace {
    pub fn new(arch: Arch) -> Self {
        Self {
            spec: Spec::new(arch),
            names: HashMap::new(),
        }
    }

    /// Allocate a named object
    ///
    /// # Errors
    /// Returns `DuplicateObject` if the name is taken
    pub fn alloc(
        &mut self,
        name: impl Into<String>,
        label: Option<&str>,
        object: Object,
    ) -> Result<ObjectId> {
        let name = name.into();
        if self.names.contains_key(&name) {
            return Err(ComposeError::DuplicateObject(name));
        }

        let id = ObjectId(self.spec.objects.len());
        log::debug!("alloc {} {} -> {:?}", object.kind(), name, id);
        self.names.insert(name.clone(), id);
        self.spec.objects.push(NamedObject {
            name,
            label: label.map(str::to_string),
            object,
        });
        Ok(id)
    }

    pub fn lookup(&self, name: &str) -> Option<ObjectId> {
        self.names.get(name).copied()
    }

    pub fn get(&self, id: ObjectId) -> &NamedObject {
        self.spec.object(id)
    }

    pub fn name_of(&self, id: ObjectId) -> &str {
        self.spec.name_of(id)
    }

    pub fn object(&self, id: ObjectId) -> &Object {
        &self.spec.objects[id.0].object
    }

    pub fn object_mut(&mut self, id: ObjectId) -> &mut Object {
        &mut self.spec.objects[id.0].object
    }

    /// Mutable access to a thread control object
    pub fn tcb_mut(&mut self, id: ObjectId) -> Option<&mut Tcb> {
        match self.object_mut(id) {
            Object::Tcb(tcb) => Some(tcb),
            _ => None,
        }
    }

    /// Handler object of an IRQ number, if one is recorded
    pub fn irq_handler(&self, irq: u64) -> Option<ObjectId> {
        self.spec
            .irqs
            .iter()
            .find(|entry| entry.irq == irq)
            .map(|entry| entry.handler)
    }

    /// Record an IRQ number as handled by `handler`
    ///
    /// # Errors
    /// Returns `InvalidConfig` if the IRQ already has a handler
    pub fn add_irq(&mut self, irq: u64, handler: ObjectId) -> Result<()> {
        if let Some(existing) = self.irq_handler(irq) {
            return Err(ComposeError::InvalidConfig(format!(
                "IRQ {} is already handled by {}",
                irq,
                self.name_of(existing)
            )));
        }
        self.spec.irqs.push(IrqEntry { irq, handler });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.spec.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spec.objects.is_empty()
    }

    pub fn spec(&self) -> &Spec {
        &self.spec
    }

    pub fn spec_mut(&mut self) -> &mut Spec {
        &mut self.spec
    }
}
