//! ELF components
//!
//! An [`ElfComponent`] runs one program image. Construction registers the
//! image as `<name>.elf`, starts the layout cursor just past its loadable
//! segments and creates the primary thread. Secondary threads, device
//! mappings and IRQ handlers follow from the component's configuration.
//!
//! `pre_finalize` lays out the static heap, writes the argument blob and the
//! runtime config, maps the encoded config into the component and points
//! every thread at it. `finalize` maps the image itself and freezes the
//! component.

use std::fs;
use std::iter;
use std::path::PathBuf;

use serde::Serialize;

use crate::component::{Component, Composable, Layoutable, MapOptions};
use crate::config::{ComponentConfig, SecondaryThreadConfig};
use crate::context::CompositionContext;
use crate::elf::{ElfImage, ImageSpec};
use crate::encoder::{write_json, BlobEncoder};
use crate::error::{ComposeError, Result};
use crate::runtime_config::{RuntimeConfig, StaticHeap};
use crate::spec::{Cap, CapSlot, Object, ObjectId, Rights};
use crate::thread::{Thread, ThreadHandle, ThreadParams, DEFAULT_AFFINITY, DEFAULT_MAX_PRIO, DEFAULT_PRIO, DEFAULT_STACK_SIZE};

/// 8MB
pub const DEFAULT_STATIC_HEAP_SIZE: u64 = 8 << 20;

/// A device region mapped into the component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeviceMapping {
    pub paddr: u64,
    pub vaddr: u64,
    pub size: u64,
}

/// An IRQ delivered to the component's IRQ notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IrqBinding {
    pub irq: u64,
    /// Slot of the IRQ handler cap
    pub handler: CapSlot,
    /// Badge bit set on the notification when the IRQ fires
    pub badge: u64,
}

/// Component running one ELF image
#[derive(Debug)]
pub struct ElfComponent {
    component: Component,
    config: ComponentConfig,
    image: ElfImage,
    image_spec: Option<ImageSpec>,
    primary: Thread,
    secondary: Vec<Thread>,
    devices: Vec<DeviceMapping>,
    irq_notification: Option<CapSlot>,
    irqs: Vec<IrqBinding>,
    runtime_config: Option<RuntimeConfig>,
}

impl ElfComponent {
    /// Create the component configured as `components.<name>`
    pub fn new(ctx: &mut CompositionContext, name: &str) -> Result<Self> {
        let config = ctx.component_config(name)?.clone();
        Self::with_config(ctx, name, config)
    }

    /// Create a component from an explicit configuration record
    pub fn with_config(ctx: &mut CompositionContext, name: &str, config: ComponentConfig) -> Result<Self> {
        let mut component = Component::new(ctx, name)?;

        let elf_fname = format!("{}.elf", name);
        ctx.register_file(&elf_fname, &config.image)?;
        let image = ElfImage::load(&config.image)?;
        component.seek(image.end_vaddr())?;

        let image_spec = image.object_spec(ctx.kernel_config().page_size(), &elf_fname, component.vspace_root());

        let primary = Thread::new(
            ctx,
            &mut component,
            "primary",
            0,
            image.entry(),
            ThreadParams {
                prio: config.prio.unwrap_or(DEFAULT_PRIO),
                max_prio: config.max_prio.unwrap_or(DEFAULT_MAX_PRIO),
                affinity: config.affinity.unwrap_or(DEFAULT_AFFINITY),
                stack_size: config.stack_size.unwrap_or(DEFAULT_STACK_SIZE),
                endpoint: false,
                update_guard_size: true,
            },
        )?;

        let mut this = Self {
            component,
            config,
            image,
            image_spec: Some(image_spec),
            primary,
            secondary: Vec::new(),
            devices: Vec::new(),
            irq_notification: None,
            irqs: Vec::new(),
            runtime_config: None,
        };

        for thread in this.config.secondary_threads.clone() {
            this.secondary_thread(ctx, &thread)?;
        }
        for mmio in this.config.mmio.clone() {
            this.map_mmio(ctx, mmio.paddr, mmio.size)?;
        }
        for irq in this.config.irqs.clone() {
            this.bind_irq(ctx, irq)?;
        }

        log::info!(
            "{}: image {} entry {:#x}, {} threads",
            name,
            this.image.path().display(),
            this.image.entry(),
            this.num_threads()
        );
        Ok(this)
    }

    pub fn name(&self) -> &str {
        self.component.name()
    }

    pub fn component(&self) -> &Component {
        &self.component
    }

    pub fn primary_thread(&self) -> &Thread {
        &self.primary
    }

    /// All threads, primary first
    pub fn threads(&self) -> impl Iterator<Item = &Thread> {
        iter::once(&self.primary).chain(&self.secondary)
    }

    pub fn num_threads(&self) -> usize {
        1 + self.secondary.len()
    }

    pub fn devices(&self) -> &[DeviceMapping] {
        &self.devices
    }

    pub fn irqs(&self) -> &[IrqBinding] {
        &self.irqs
    }

    /// The runtime config, once pre-finalized
    pub fn runtime_config(&self) -> Option<&RuntimeConfig> {
        self.runtime_config.as_ref()
    }

    /// Add a thread running the image's entry point
    ///
    /// Unset parameters default to the primary thread's, with priority one
    /// above it.
    pub fn secondary_thread(
        &mut self,
        ctx: &mut CompositionContext,
        thread: &SecondaryThreadConfig,
    ) -> Result<ThreadHandle> {
        let primary = self.primary.params();
        let params = ThreadParams {
            prio: thread.prio.unwrap_or(primary.prio.saturating_add(1)),
            max_prio: thread.max_prio.unwrap_or(primary.max_prio),
            affinity: thread.affinity.unwrap_or(primary.affinity),
            stack_size: thread.stack_size.unwrap_or(DEFAULT_STACK_SIZE),
            endpoint: thread.endpoint,
            update_guard_size: primary.update_guard_size,
        };

        let index = self.num_threads();
        let thread = Thread::new(ctx, &mut self.component, &thread.name, index, self.image.entry(), params)?;
        let handle = thread.handle();
        self.secondary.push(thread);
        Ok(handle)
    }

    /// Map a device region at the cursor
    pub fn map_mmio(&mut self, ctx: &mut CompositionContext, paddr: u64, size: u64) -> Result<u64> {
        let label = format!("mmio_{:#x}", paddr);
        let vaddr = self.component.map_device(ctx, paddr, size, &label)?;
        self.devices.push(DeviceMapping { paddr, vaddr, size });
        Ok(vaddr)
    }

    /// Deliver `irq` to the component's IRQ notification
    ///
    /// The n-th IRQ bound signals badge bit n.
    ///
    /// # Errors
    /// Returns `InvalidConfig` if the badge bits are exhausted
    pub fn bind_irq(&mut self, ctx: &mut CompositionContext, irq: u64) -> Result<CapSlot> {
        let bit = self.irqs.len() as u32;
        if bit >= ctx.kernel_config().word_size() {
            return Err(ComposeError::InvalidConfig(format!(
                "{}: too many IRQs for one notification",
                self.name()
            )));
        }

        let notification = self.irq_notification(ctx)?;
        let badge = 1u64 << bit;
        let handler = self.component.irq_handler(ctx, irq, notification, badge)?;
        let slot = self.component.alloc_cap(Cap::new(handler))?;
        self.irqs.push(IrqBinding {
            irq,
            handler: slot,
            badge,
        });
        Ok(slot)
    }

    fn irq_notification(&mut self, ctx: &mut CompositionContext) -> Result<ObjectId> {
        let name = format!("{}_irq_notification", self.name());
        if let Some(id) = ctx.objects().lookup(&name) {
            return Ok(id);
        }
        let id = self.component.notification(ctx, "irq_notification")?;
        self.irq_notification = Some(self.component.alloc_cap(Cap::new(id).with_rights(Rights::READ))?);
        Ok(id)
    }

    /// Argument record passed to the component
    ///
    /// Defaults to a description of the component's devices and IRQs, or
    /// `{}` if it has none.
    pub fn arg_json(&self) -> serde_json::Value {
        if let Some(arg) = &self.config.arg {
            return arg.clone();
        }
        if self.devices.is_empty() && self.irqs.is_empty() {
            return serde_json::json!({});
        }
        serde_json::json!({
            "mmio": self.devices,
            "irq_notification": self.irq_notification,
            "irqs": self.irqs,
        })
    }

    /// Write and encode `<name>_arg.bin`, returning its path
    fn write_arg(&mut self, ctx: &mut CompositionContext) -> Result<PathBuf> {
        let json_path = ctx.out_path(&format!("{}_arg.json", self.name()));
        let bin_fname = format!("{}_arg.bin", self.name());
        let bin_path = ctx.out_path(&bin_fname);

        if self.config.arg_encoder != BlobEncoder::Empty {
            write_json(&json_path, &self.arg_json())?;
        }
        self.config
            .arg_encoder
            .encode::<serde_json::Value>(&json_path, &bin_path)?;

        ctx.register_file(&bin_fname, &bin_path)?;
        Ok(bin_path)
    }

    /// Lay out the static heap, write the runtime config and map it
    fn write_runtime_config(&mut self, ctx: &mut CompositionContext) -> Result<()> {
        let heap_size = self.config.heap_size.unwrap_or(DEFAULT_STATIC_HEAP_SIZE);
        self.component.pad_and_align_to_larger_page(ctx)?;
        let (heap_start, heap_end) = self
            .component
            .map_range_at_cursor(ctx, heap_size, &MapOptions::labeled("heap"))?;
        let lock = self.component.notification(ctx, "heap_lock")?;
        let lock_slot = self
            .component
            .alloc_cap(Cap::new(lock).with_rights(Rights::RW).with_badge(1))?;

        let arg_path = self.write_arg(ctx)?;

        let idle = self.component.notification(ctx, "idle_notification")?;
        let idle_slot = self.component.alloc_cap(Cap::new(idle).with_rights(Rights::READ))?;

        let mut threads = Vec::with_capacity(self.num_threads());
        for thread in iter::once(&self.primary).chain(&self.secondary) {
            threads.push(thread.runtime_config(ctx, &mut self.component)?);
        }

        let config = RuntimeConfig {
            static_heap: Some(StaticHeap {
                start: heap_start,
                end: heap_end,
            }),
            static_heap_mutex_notification: Some(lock_slot),
            idle_notification: Some(idle_slot),
            threads,
            image_identifier: Some(self.image.path().display().to_string()),
            arg: Some(arg_path.display().to_string()),
        };

        let json_path = ctx.out_path(&format!("{}_config.json", self.name()));
        let bin_fname = format!("{}_config.bin", self.name());
        let bin_path = ctx.out_path(&bin_fname);
        write_json(&json_path, &config)?;
        ctx.runtime_config_encoder()
            .encode::<RuntimeConfig>(&json_path, &bin_path)?;
        let config_size = fs::metadata(&bin_path)
            .map_err(|e| ComposeError::io(&bin_path, e))?
            .len();

        self.component.pad_and_align_to_page(ctx)?;
        let (config_vaddr, _) =
            self.component
                .map_file_at_cursor(ctx, &bin_fname, &bin_path, &MapOptions::labeled("config"))?;

        let handles: Vec<ThreadHandle> = self.threads().map(Thread::handle).collect();
        for handle in handles {
            handle.resolve_runtime_config(ctx, config_vaddr, config_size)?;
        }

        log::info!(
            "{}: runtime config at {:#x} ({} bytes), heap [{:#x}, {:#x})",
            self.name(),
            config_vaddr,
            config_size,
            heap_start,
            heap_end
        );
        self.runtime_config = Some(config);
        Ok(())
    }

    /// Map the image's own pages
    ///
    /// # Errors
    /// Returns `ImageAlreadyMerged` on the second call
    pub fn merge_image(&mut self, ctx: &mut CompositionContext) -> Result<()> {
        let spec = self
            .image_spec
            .take()
            .ok_or_else(|| ComposeError::ImageAlreadyMerged(self.name().to_string()))?;
        self.component.merge_image_spec(ctx, spec)
    }
}

impl Layoutable for ElfComponent {
    fn alloc_object(&mut self, ctx: &mut CompositionContext, name: &str, object: Object) -> Result<ObjectId> {
        self.component.alloc_object(ctx, name, object)
    }

    fn map_frame(&mut self, ctx: &mut CompositionContext, vaddr: u64, size_bits: u8, cap: Cap) -> Result<()> {
        self.component.map_frame(ctx, vaddr, size_bits, cap)
    }

    fn advance(&mut self, n: u64, align: Option<u64>) -> Result<(u64, u64)> {
        self.component.advance(n, align)
    }

    fn cursor(&self) -> u64 {
        self.component.cursor()
    }
}

impl Composable for ElfComponent {
    fn name(&self) -> &str {
        self.component.name()
    }

    fn pre_finalize(&mut self, ctx: &mut CompositionContext) -> Result<()> {
        self.component.pre_finalize(ctx)?;
        self.write_runtime_config(ctx)
    }

    fn finalize(&mut self, ctx: &mut CompositionContext) -> Result<()> {
        self.component.ensure_finalizable(ctx)?;
        self.merge_image(ctx)?;
        self.component.finalize(ctx)
    }
}
