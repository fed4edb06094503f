//! Component Model - one capability table plus one address space
//!
//! A component owns a CNode (`<name>_cspace`), an address-space root
//! (`<name>_vspace`) and a layout cursor. Objects it allocates are named
//! `<name>_<object>` and labelled with the component name.
//!
//! # Layout
//! The [`Layoutable`] trait captures the four primitives every layout
//! operation is built from (allocate an object, map a frame, advance the
//! cursor, read the cursor). Page-size aware conveniences (`map_range`,
//! `map_file`, `pad_and_align_to_larger_page`, ...) are provided methods, so
//! wrappers such as [`ElfComponent`](crate::elf_component::ElfComponent) get
//! them by forwarding the primitives.
//!
//! # Lifecycle
//! ```text
//! Open --pre_finalize--> PreFinalized --finalize--> Frozen
//! ```
//! Any mutation of a frozen component is an error. `pre_finalize` only runs
//! in the composition's PreFinalize phase and `finalize` only in its
//! Finalize phase, on a component that has been pre-finalized.

use std::fs;
use std::path::Path;

use crate::align::align_up;
use crate::context::{CompositionContext, Phase};
use crate::cspace::CSpace;
use crate::elf::ImageSpec;
use crate::error::{ComposeError, Result};
use crate::spec::{Cap, CapSlot, FillEntry, Frame, Object, ObjectId, Rights};
use crate::vspace::{tile_range, AddressSpace, Cursor, Mapping};

/// How frames created by a mapping operation look
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapOptions {
    /// Frame names become `<label>_0x<vaddr>`
    pub label: Option<String>,
    pub paddr: Option<u64>,
    pub device: bool,
    pub rights: Rights,
    pub executable: bool,
    pub cached: bool,
}

impl Default for MapOptions {
    fn default() -> Self {
        Self {
            label: None,
            paddr: None,
            device: false,
            rights: Rights::RW,
            executable: false,
            cached: true,
        }
    }
}

impl MapOptions {
    /// Read/write cached memory
    pub fn labeled(label: impl Into<String>) -> Self {
        Self {
            label: Some(label.into()),
            ..Default::default()
        }
    }

    pub fn with_paddr(mut self, paddr: u64) -> Self {
        self.paddr = Some(paddr);
        self
    }

    pub fn with_rights(mut self, rights: Rights) -> Self {
        self.rights = rights;
        self
    }

    /// Uncached device memory
    pub fn device(mut self) -> Self {
        self.device = true;
        self.cached = false;
        self
    }

    fn frame_name(&self, vaddr: u64) -> String {
        match &self.label {
            Some(label) => format!("{}_{:#x}", label, vaddr),
            None => format!("{:#x}", vaddr),
        }
    }
}

/// Something with an address space that can be laid out
pub trait Layoutable {
    /// Allocate an object owned by this component
    fn alloc_object(&mut self, ctx: &mut CompositionContext, name: &str, object: Object) -> Result<ObjectId>;

    /// Map the frame `cap` refers to at `vaddr`
    fn map_frame(&mut self, ctx: &mut CompositionContext, vaddr: u64, size_bits: u8, cap: Cap) -> Result<()>;

    /// Optionally align the cursor, then move it forward by `n` bytes
    fn advance(&mut self, n: u64, align: Option<u64>) -> Result<(u64, u64)>;

    /// Current cursor
    fn cursor(&self) -> u64;

    /// Align the cursor up to `size`
    fn align(&mut self, size: u64) -> Result<u64> {
        self.advance(0, Some(size))?;
        Ok(self.cursor())
    }

    /// Allocate one frame of exactly `size` bytes and map it at `vaddr`
    ///
    /// # Errors
    /// - `UnsupportedPageSize` if `size` is not a page size of the kernel
    /// - `MisalignedMapping` if `vaddr` is not a multiple of `size`
    fn map_with_size(
        &mut self,
        ctx: &mut CompositionContext,
        size: u64,
        vaddr: u64,
        fill: Vec<FillEntry>,
        opts: &MapOptions,
    ) -> Result<ObjectId> {
        if !ctx.kernel_config().is_page_size(size) {
            return Err(ComposeError::UnsupportedPageSize { size });
        }
        if vaddr % size != 0 {
            return Err(ComposeError::MisalignedMapping { vaddr, size });
        }

        let size_bits = size.trailing_zeros() as u8;
        let frame = self.alloc_object(
            ctx,
            &opts.frame_name(vaddr),
            Object::Frame(Frame {
                size_bits,
                paddr: opts.paddr,
                device: opts.device,
                fill,
            }),
        )?;
        let cap = Cap::new(frame)
            .with_rights(opts.rights)
            .with_cached(opts.cached)
            .with_executable(opts.executable);
        self.map_frame(ctx, vaddr, size_bits, cap)?;
        Ok(frame)
    }

    fn map_page(&mut self, ctx: &mut CompositionContext, vaddr: u64, opts: &MapOptions) -> Result<ObjectId> {
        let size = ctx.kernel_config().page_size();
        self.map_with_size(ctx, size, vaddr, Vec::new(), opts)
    }

    fn map_larger_page(&mut self, ctx: &mut CompositionContext, vaddr: u64, opts: &MapOptions) -> Result<ObjectId> {
        let size = ctx.kernel_config().larger_page_size();
        self.map_with_size(ctx, size, vaddr, Vec::new(), opts)
    }

    /// Map `[start, end)` with the largest pages that fit
    ///
    /// Returns the frames in ascending address order.
    fn map_range(
        &mut self,
        ctx: &mut CompositionContext,
        start: u64,
        end: u64,
        opts: &MapOptions,
    ) -> Result<Vec<ObjectId>> {
        let sizes: Vec<u64> = ctx.kernel_config().page_sizes().collect();
        tile_range(&sizes, start, end)?
            .into_iter()
            .map(|(vaddr, size)| self.map_with_size(ctx, size, vaddr, Vec::new(), opts))
            .collect()
    }

    /// Map the contents of a file at `start`
    ///
    /// The file is registered as `fname`. Every page carries a fill for its
    /// share of the file, and the mapping is rounded up to a whole page.
    /// Returns the end of the mapping.
    fn map_file(
        &mut self,
        ctx: &mut CompositionContext,
        start: u64,
        fname: &str,
        path: &Path,
        opts: &MapOptions,
    ) -> Result<u64> {
        ctx.register_file(fname, path)?;
        let file_size = file_size(path)?;

        let end = start + align_up(file_size, ctx.kernel_config().page_size());
        let sizes: Vec<u64> = ctx.kernel_config().page_sizes().collect();
        for (vaddr, size) in tile_range(&sizes, start, end)? {
            let file_offset = vaddr - start;
            let fill = FillEntry::new(0, size.min(file_size.saturating_sub(file_offset)), fname, file_offset);
            self.map_with_size(ctx, size, vaddr, vec![fill], opts)?;
        }
        Ok(end)
    }

    fn align_to_page(&mut self, ctx: &CompositionContext) -> Result<u64> {
        self.align(ctx.kernel_config().page_size())
    }

    fn align_to_larger_page(&mut self, ctx: &CompositionContext) -> Result<u64> {
        self.align(ctx.kernel_config().larger_page_size())
    }

    fn align_to_page_and_advance(&mut self, ctx: &CompositionContext, n: u64) -> Result<(u64, u64)> {
        self.advance(n, Some(ctx.kernel_config().page_size()))
    }

    fn align_to_larger_page_and_advance(&mut self, ctx: &CompositionContext, n: u64) -> Result<(u64, u64)> {
        self.advance(n, Some(ctx.kernel_config().larger_page_size()))
    }

    /// Skip one page and align, so nothing placed next shares a page with
    /// what came before
    fn pad_and_align_to_page(&mut self, ctx: &CompositionContext) -> Result<(u64, u64)> {
        let n = ctx.kernel_config().page_size();
        self.advance(n, Some(n))
    }

    fn pad_and_align_to_larger_page(&mut self, ctx: &CompositionContext) -> Result<(u64, u64)> {
        let n = ctx.kernel_config().larger_page_size();
        self.advance(n, Some(n))
    }

    /// Map `size` bytes (rounded up to a page) at the page-aligned cursor
    fn map_range_at_cursor(
        &mut self,
        ctx: &mut CompositionContext,
        size: u64,
        opts: &MapOptions,
    ) -> Result<(u64, u64)> {
        let size = align_up(size, ctx.kernel_config().page_size());
        let (start, end) = self.align_to_page_and_advance(ctx, size)?;
        self.map_range(ctx, start, end, opts)?;
        Ok((start, end))
    }

    /// Map a file at the page-aligned cursor and move the cursor past it
    fn map_file_at_cursor(
        &mut self,
        ctx: &mut CompositionContext,
        fname: &str,
        path: &Path,
        opts: &MapOptions,
    ) -> Result<(u64, u64)> {
        let size = align_up(file_size(path)?, ctx.kernel_config().page_size());
        let (start, _) = self.align_to_page_and_advance(ctx, size)?;
        let end = self.map_file(ctx, start, fname, path, opts)?;
        Ok((start, end))
    }
}

fn file_size(path: &Path) -> Result<u64> {
    fs::metadata(path)
        .map(|m| m.len())
        .map_err(|e| ComposeError::io(path, e))
}

/// Lifecycle state of a component
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentState {
    Open,
    PreFinalized,
    Frozen,
}

/// A component registered with a composition
pub trait Composable {
    fn name(&self) -> &str;

    fn pre_finalize(&mut self, ctx: &mut CompositionContext) -> Result<()>;

    fn finalize(&mut self, ctx: &mut CompositionContext) -> Result<()>;
}

/// Concrete component: a capability table, an address space and a cursor
#[derive(Debug)]
pub struct Component {
    name: String,
    cspace: CSpace,
    vspace: AddressSpace,
    cursor: Cursor,
    state: ComponentState,
}

impl Component {
    /// Create a component and its two root objects
    ///
    /// # Errors
    /// - `LifecycleViolation` outside the construction phase
    /// - `DuplicateObject` if a component of this name exists
    pub fn new(ctx: &mut CompositionContext, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        ctx.ensure_phase(&name, "construct", Phase::Construction)?;

        let cnode = ctx.objects_mut().alloc(
            format!("{}_cspace", name),
            Some(&name),
            Object::CNode {
                size_bits: None,
                slots: Vec::new(),
            },
        )?;
        let root = ctx.objects_mut().alloc(
            format!("{}_vspace", name),
            Some(&name),
            Object::PageTable {
                level: 0,
                is_root: true,
                slots: Vec::new(),
            },
        )?;

        log::debug!("component {} created", name);
        Ok(Self {
            cspace: CSpace::new(cnode),
            vspace: AddressSpace::new(name.clone(), root),
            cursor: Cursor::default(),
            name,
            state: ComponentState::Open,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ComponentState {
        self.state
    }

    pub fn cspace(&self) -> &CSpace {
        &self.cspace
    }

    pub fn vspace(&self) -> &AddressSpace {
        &self.vspace
    }

    /// Address-space root object
    pub fn vspace_root(&self) -> ObjectId {
        self.vspace.root()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state == ComponentState::Frozen {
            return Err(ComposeError::ComponentFrozen(self.name.clone()));
        }
        Ok(())
    }

    /// Move the cursor forward to `vaddr`
    pub fn seek(&mut self, vaddr: u64) -> Result<()> {
        self.ensure_open()?;
        self.cursor.seek(vaddr)
    }

    /// Store a capability in the next free slot of the table
    pub fn alloc_cap(&mut self, cap: Cap) -> Result<CapSlot> {
        self.ensure_open()?;
        Ok(self.cspace.alloc(cap))
    }

    /// Capability to this component's own capability table
    pub fn cnode_cap(&self) -> Cap {
        Cap::new(self.cspace.cnode())
    }

    /// Have the guard size of thread `tcb`'s `cspace` cap resolved when the
    /// table is frozen
    pub fn defer_guard_size(&mut self, tcb: ObjectId) -> Result<()> {
        self.ensure_open()?;
        self.cspace.defer_guard_size(tcb);
        Ok(())
    }

    pub fn notification(&mut self, ctx: &mut CompositionContext, name: &str) -> Result<ObjectId> {
        self.alloc_object(ctx, name, Object::Notification)
    }

    pub fn endpoint(&mut self, ctx: &mut CompositionContext, name: &str) -> Result<ObjectId> {
        self.alloc_object(ctx, name, Object::Endpoint)
    }

    /// Allocate an IRQ handler delivering to `notification` with `badge`
    ///
    /// The IRQ is recorded in the spec's IRQ table.
    ///
    /// # Errors
    /// Returns `InvalidConfig` if another handler already owns `irq`
    pub fn irq_handler(
        &mut self,
        ctx: &mut CompositionContext,
        irq: u64,
        notification: ObjectId,
        badge: u64,
    ) -> Result<ObjectId> {
        if let Some(existing) = ctx.objects().irq_handler(irq) {
            return Err(ComposeError::InvalidConfig(format!(
                "{}: IRQ {} is already handled by {}",
                self.name,
                irq,
                ctx.objects().name_of(existing)
            )));
        }

        let handler = self.alloc_object(
            ctx,
            &format!("irq_{}_handler", irq),
            Object::Irq {
                irq,
                notification: Some(Cap::new(notification).with_badge(badge)),
            },
        )?;
        ctx.objects_mut().add_irq(irq, handler)?;
        Ok(handler)
    }

    /// Map `size` bytes of device memory at `paddr` at the cursor
    ///
    /// Device memory is mapped uncached, one base page at a time. Returns the
    /// virtual address of the first byte.
    ///
    /// # Errors
    /// Returns `MisalignedPhysicalAddress` if `paddr` is not page aligned
    pub fn map_device(
        &mut self,
        ctx: &mut CompositionContext,
        paddr: u64,
        size: u64,
        label: &str,
    ) -> Result<u64> {
        let page_size = ctx.kernel_config().page_size();
        if paddr % page_size != 0 {
            return Err(ComposeError::MisalignedPhysicalAddress {
                object: format!("{}_{}", self.name, label),
                paddr,
                size_bits: page_size.trailing_zeros() as u8,
            });
        }

        let (start, end) = self.align_to_page_and_advance(ctx, align_up(size, page_size))?;
        for vaddr in (start..end).step_by(page_size as usize) {
            let opts = MapOptions::labeled(label)
                .with_paddr(paddr + (vaddr - start))
                .device();
            self.map_page(ctx, vaddr, &opts)?;
        }
        log::debug!("{}: device {:#x} mapped at {:#x}", self.name, paddr, start);
        Ok(start)
    }

    /// Map the pages of a program image
    ///
    /// # Errors
    /// Returns `ForeignAddressSpace` if the image spec was derived for
    /// another address space
    pub fn merge_image_spec(&mut self, ctx: &mut CompositionContext, spec: ImageSpec) -> Result<()> {
        self.ensure_open()?;
        if spec.root() != self.vspace.root() {
            return Err(ComposeError::ForeignAddressSpace(self.name.clone()));
        }

        let size_bits = spec.page_size().trailing_zeros() as u8;
        for page in spec.pages() {
            let frame = self.alloc_object(
                ctx,
                &format!("image_{:#x}", page.vaddr),
                Object::Frame(Frame {
                    size_bits,
                    paddr: None,
                    device: false,
                    fill: page.fill.clone(),
                }),
            )?;
            let cap = Cap::new(frame)
                .with_rights(page.rights)
                .with_executable(page.executable);
            self.map_frame(ctx, page.vaddr, size_bits, cap)?;
        }

        log::debug!("{}: merged {} image pages", self.name, spec.len());
        Ok(())
    }

    /// Check that `finalize` may run now
    pub fn ensure_finalizable(&self, ctx: &CompositionContext) -> Result<()> {
        ctx.ensure_phase(&self.name, "finalize", Phase::Finalize)?;
        match self.state {
            ComponentState::PreFinalized => Ok(()),
            ComponentState::Frozen => Err(ComposeError::ComponentFrozen(self.name.clone())),
            ComponentState::Open => Err(ComposeError::LifecycleViolation {
                component: self.name.clone(),
                operation: "finalize before pre_finalize",
                phase: ctx.phase(),
            }),
        }
    }
}

impl Layoutable for Component {
    fn alloc_object(&mut self, ctx: &mut CompositionContext, name: &str, object: Object) -> Result<ObjectId> {
        self.ensure_open()?;
        ctx.objects_mut()
            .alloc(format!("{}_{}", self.name, name), Some(&self.name), object)
    }

    fn map_frame(&mut self, _ctx: &mut CompositionContext, vaddr: u64, size_bits: u8, cap: Cap) -> Result<()> {
        self.ensure_open()?;
        log::debug!("{}: map {:#x} ({} bits)", self.name, vaddr, size_bits);
        self.vspace.insert(Mapping {
            vaddr,
            size_bits,
            cap,
        })
    }

    fn advance(&mut self, n: u64, align: Option<u64>) -> Result<(u64, u64)> {
        self.ensure_open()?;
        self.cursor.advance(n, align)
    }

    fn cursor(&self) -> u64 {
        self.cursor.get()
    }
}

impl Composable for Component {
    fn name(&self) -> &str {
        &self.name
    }

    fn pre_finalize(&mut self, ctx: &mut CompositionContext) -> Result<()> {
        ctx.ensure_phase(&self.name, "pre_finalize", Phase::PreFinalize)?;
        match self.state {
            ComponentState::Open => {
                self.state = ComponentState::PreFinalized;
                Ok(())
            }
            ComponentState::PreFinalized => Err(ComposeError::LifecycleViolation {
                component: self.name.clone(),
                operation: "repeated pre_finalize",
                phase: ctx.phase(),
            }),
            ComponentState::Frozen => Err(ComposeError::ComponentFrozen(self.name.clone())),
        }
    }

    /// Freeze the capability table and build the page tables
    fn finalize(&mut self, ctx: &mut CompositionContext) -> Result<()> {
        self.ensure_finalizable(ctx)?;

        let word_bits = ctx.kernel_config().word_size();
        let size_bits = self.cspace.finalize(word_bits, ctx.objects_mut())?;
        let config = ctx.kernel_config().clone();
        self.vspace.finalize(&config, ctx.objects_mut())?;

        log::debug!(
            "{}: finalized (cspace {} bits, {} mappings)",
            self.name,
            size_bits,
            self.vspace.len()
        );
        self.state = ComponentState::Frozen;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel_config::{Arch, KernelConfig};
    use proptest::prelude::*;

    fn context() -> CompositionContext {
        CompositionContext::new(KernelConfig::new(Arch::Aarch64, false), "/tmp/unused")
    }

    fn frame_size(ctx: &CompositionContext, id: ObjectId) -> u64 {
        match ctx.objects().object(id) {
            Object::Frame(frame) => 1 << frame.size_bits,
            other => panic!("not a frame: {:?}", other),
        }
    }

    #[test]
    fn test_new_allocates_roots() {
        let mut ctx = context();
        let comp = Component::new(&mut ctx, "server").unwrap();
        assert!(ctx.objects().lookup("server_cspace").is_some());
        assert_eq!(ctx.objects().lookup("server_vspace"), Some(comp.vspace_root()));
        assert_eq!(comp.cursor(), 0);
    }

    #[test]
    fn test_map_range_four_small_pages() {
        let mut ctx = context();
        let mut comp = Component::new(&mut ctx, "c").unwrap();
        let frames = comp
            .map_range(&mut ctx, 0x1000, 0x5000, &MapOptions::default())
            .unwrap();
        assert_eq!(frames.len(), 4);
        assert!(frames.iter().all(|&f| frame_size(&ctx, f) == 0x1000));
        assert!(ctx.objects().lookup("c_0x4000").is_some());
    }

    #[test]
    fn test_map_with_size_checks() {
        let mut ctx = context();
        let mut comp = Component::new(&mut ctx, "c").unwrap();
        let opts = MapOptions::default();
        assert!(matches!(
            comp.map_with_size(&mut ctx, 0x20_0000, 0x1000, Vec::new(), &opts),
            Err(ComposeError::MisalignedMapping { .. })
        ));
        assert!(matches!(
            comp.map_with_size(&mut ctx, 0x2000, 0x2000, Vec::new(), &opts),
            Err(ComposeError::UnsupportedPageSize { size: 0x2000 })
        ));
    }

    #[test]
    fn test_overlapping_mapping_rejected() {
        let mut ctx = context();
        let mut comp = Component::new(&mut ctx, "c").unwrap();
        comp.map_larger_page(&mut ctx, 0x20_0000, &MapOptions::labeled("big"))
            .unwrap();
        assert!(matches!(
            comp.map_page(&mut ctx, 0x20_1000, &MapOptions::labeled("small")),
            Err(ComposeError::MappingOverlap { .. })
        ));
    }

    #[test]
    fn test_pad_and_align() {
        let ctx = context();
        let mut comp = Component::new(&mut context(), "c").unwrap();
        comp.seek(0x1234).unwrap();
        assert_eq!(comp.pad_and_align_to_page(&ctx).unwrap(), (0x2000, 0x3000));
        assert_eq!(
            comp.pad_and_align_to_larger_page(&ctx).unwrap(),
            (0x20_0000, 0x40_0000)
        );
        assert_eq!(comp.align_to_page_and_advance(&ctx, 0x10).unwrap(), (0x40_0000, 0x40_0010));
        assert_eq!(comp.align_to_page(&ctx).unwrap(), 0x40_1000);
        assert!(comp.seek(0x1000).is_err());
    }

    #[test]
    fn test_slots_and_irq() {
        let mut ctx = context();
        let mut comp = Component::new(&mut ctx, "drv").unwrap();
        let ntfn = comp.notification(&mut ctx, "irq_ntfn").unwrap();
        assert_eq!(comp.alloc_cap(Cap::new(ntfn).with_rights(Rights::READ)).unwrap(), 1);

        let handler = comp.irq_handler(&mut ctx, 33, ntfn, 1 << 2).unwrap();
        assert_eq!(comp.alloc_cap(Cap::new(handler)).unwrap(), 2);
        assert_eq!(ctx.objects().spec().irqs.len(), 1);
        assert_eq!(ctx.objects().name_of(handler), "drv_irq_33_handler");
    }

    #[test]
    fn test_irq_bound_twice_rejected() {
        let mut ctx = context();
        let mut first = Component::new(&mut ctx, "first").unwrap();
        let mut second = Component::new(&mut ctx, "second").unwrap();
        let a = first.notification(&mut ctx, "irq_ntfn").unwrap();
        let b = second.notification(&mut ctx, "irq_ntfn").unwrap();

        first.irq_handler(&mut ctx, 40, a, 1).unwrap();
        let err = second.irq_handler(&mut ctx, 40, b, 1).unwrap_err();
        assert!(matches!(err, ComposeError::InvalidConfig(ref m) if m.contains("first_irq_40_handler")));
        assert!(ctx.objects().lookup("second_irq_40_handler").is_none());
        assert_eq!(ctx.objects().spec().irqs.len(), 1);
    }

    #[test]
    fn test_map_device() {
        let mut ctx = context();
        let mut comp = Component::new(&mut ctx, "uart").unwrap();
        comp.seek(0x10_0000).unwrap();
        let vaddr = comp.map_device(&mut ctx, 0x900_0000, 0x1800, "mmio").unwrap();
        assert_eq!(vaddr, 0x10_0000);
        assert_eq!(comp.cursor(), 0x10_2000);

        let second = ctx.objects().lookup("uart_mmio_0x101000").unwrap();
        match ctx.objects().object(second) {
            Object::Frame(frame) => {
                assert_eq!(frame.paddr, Some(0x900_1000));
                assert!(frame.device);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(comp.vspace().mappings().all(|m| !m.cap.cached));

        assert!(comp.map_device(&mut ctx, 0x900_0800, 0x100, "bad").is_err());
    }

    #[test]
    fn test_lifecycle() {
        let mut ctx = context();
        let mut comp = Component::new(&mut ctx, "c").unwrap();
        comp.map_page(&mut ctx, 0x1000, &MapOptions::default()).unwrap();

        // wrong phase
        assert!(comp.pre_finalize(&mut ctx).is_err());

        ctx.enter_phase(Phase::PreFinalize).unwrap();
        assert!(Component::new(&mut ctx, "late").is_err());
        comp.pre_finalize(&mut ctx).unwrap();

        ctx.enter_phase(Phase::Finalize).unwrap();
        comp.finalize(&mut ctx).unwrap();
        assert_eq!(comp.state(), ComponentState::Frozen);

        assert!(matches!(
            comp.map_page(&mut ctx, 0x2000, &MapOptions::default()),
            Err(ComposeError::ComponentFrozen(_))
        ));
        assert!(comp.alloc_cap(comp.cnode_cap()).is_err());
        assert!(matches!(comp.finalize(&mut ctx), Err(ComposeError::ComponentFrozen(_))));
    }

    #[test]
    fn test_finalize_requires_pre_finalize() {
        let mut ctx = context();
        let mut comp = Component::new(&mut ctx, "c").unwrap();
        ctx.enter_phase(Phase::PreFinalize).unwrap();
        ctx.enter_phase(Phase::Finalize).unwrap();
        assert!(matches!(
            comp.finalize(&mut ctx),
            Err(ComposeError::LifecycleViolation { .. })
        ));
    }

    #[derive(Debug, Clone)]
    enum Step {
        Advance(u64),
        Align(u32),
        Map(u64),
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            (0u64..0x8000).prop_map(Step::Advance),
            (0u32..22).prop_map(Step::Align),
            (1u64..0x10_0000).prop_map(Step::Map),
        ]
    }

    proptest! {
        #[test]
        fn layout_steps_keep_mappings_disjoint(steps in prop::collection::vec(step(), 1..24)) {
            let mut ctx = context();
            let mut comp = Component::new(&mut ctx, "c").unwrap();
            let mut mapped_end = 0;

            for step in steps {
                let before = comp.cursor();
                match step {
                    Step::Advance(n) => {
                        comp.advance(n, None).unwrap();
                    }
                    Step::Align(k) => {
                        comp.align(1u64 << k).unwrap();
                    }
                    Step::Map(size) => {
                        let (start, end) = comp
                            .map_range_at_cursor(&mut ctx, size, &MapOptions::default())
                            .unwrap();
                        prop_assert!(start >= mapped_end);
                        prop_assert!(end >= start + size);
                        mapped_end = end;
                    }
                }
                prop_assert!(comp.cursor() >= before);
            }

            let ranges: Vec<(u64, u64)> = comp
                .vspace()
                .mappings()
                .map(|m| (m.vaddr, m.end().unwrap()))
                .collect();
            for pair in ranges.windows(2) {
                prop_assert!(pair[0].1 <= pair[1].0);
            }
        }
    }
}
