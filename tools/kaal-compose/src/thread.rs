//! Threads of an ELF component
//!
//! Allocating a thread lays out, at the component's cursor:
//!
//! ```text
//! | pad | stack (stack_size) | pad | IPC buffer (1 page) | pad |
//! ```
//!
//! and creates its TCB (`<thread>_tcb`), plus a scheduling context
//! (`<thread>_sc`) on MCS kernels and optionally an endpoint
//! (`<thread>_thread_ep`) in the component's capability table.
//!
//! The TCB's initial registers point at the component's runtime config,
//! which only exists once the component has been pre-finalized. Threads are
//! therefore built in two passes: [`Thread::new`] yields a [`ThreadHandle`],
//! and [`ThreadHandle::resolve_runtime_config`] fills in the registers later.

use crate::component::{Component, Layoutable, MapOptions};
use crate::context::CompositionContext;
use crate::error::{ComposeError, Result};
use crate::runtime_config::ThreadRuntimeConfig;
use crate::spec::{Cap, CapSlot, Object, ObjectId, Rights, Tcb};

pub const DEFAULT_PRIO: u8 = 128;
pub const DEFAULT_MAX_PRIO: u8 = 0;
pub const DEFAULT_AFFINITY: u64 = 0;
/// 2MB
pub const DEFAULT_STACK_SIZE: u64 = 2 << 20;
/// Scheduling context period and budget (microseconds)
pub const DEFAULT_SC_PERIOD: u64 = 1000;
pub const DEFAULT_SC_BUDGET: u64 = 1000;

/// Parameters of one thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadParams {
    pub prio: u8,
    pub max_prio: u8,
    pub affinity: u64,
    pub stack_size: u64,
    /// Allocate a rendezvous endpoint for the thread
    pub endpoint: bool,
    /// Defer the guard size of the TCB's cspace cap to finalize
    pub update_guard_size: bool,
}

impl Default for ThreadParams {
    fn default() -> Self {
        Self {
            prio: DEFAULT_PRIO,
            max_prio: DEFAULT_MAX_PRIO,
            affinity: DEFAULT_AFFINITY,
            stack_size: DEFAULT_STACK_SIZE,
            endpoint: true,
            update_guard_size: true,
        }
    }
}

/// Forward reference to a thread whose registers are not known yet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadHandle {
    index: usize,
    tcb: ObjectId,
}

impl ThreadHandle {
    /// Position of the thread in its component (primary is 0)
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn tcb(&self) -> ObjectId {
        self.tcb
    }

    /// Point the thread at its component's runtime config
    ///
    /// Sets the initial registers to `[config_vaddr, config_size, index]`.
    ///
    /// # Errors
    /// Returns `InvalidConfig` if the handle does not name a TCB
    pub fn resolve_runtime_config(
        &self,
        ctx: &mut CompositionContext,
        config_vaddr: u64,
        config_size: u64,
    ) -> Result<()> {
        let name = ctx.objects().get(self.tcb).name.clone();
        let tcb = ctx
            .objects_mut()
            .tcb_mut(self.tcb)
            .ok_or_else(|| ComposeError::InvalidConfig(format!("{} is not a thread control object", name)))?;
        tcb.gprs = vec![config_vaddr, config_size, self.index as u64];
        Ok(())
    }
}

/// A thread of an ELF component
#[derive(Debug, Clone)]
pub struct Thread {
    name: String,
    handle: ThreadHandle,
    stack: (u64, u64),
    ipc_buffer_addr: u64,
    endpoint: Option<CapSlot>,
    params: ThreadParams,
}

impl Thread {
    /// Lay out and allocate a thread starting at `entry`
    pub fn new(
        ctx: &mut CompositionContext,
        component: &mut Component,
        name: &str,
        index: usize,
        entry: u64,
        params: ThreadParams,
    ) -> Result<Self> {
        let page_size = ctx.kernel_config().page_size();

        component.pad_and_align_to_larger_page(ctx)?;
        let stack = component.map_range_at_cursor(
            ctx,
            params.stack_size,
            &MapOptions::labeled(format!("{}_stack", name)),
        )?;
        component.pad_and_align_to_larger_page(ctx)?;

        let (ipc_buffer_addr, _) = component.advance(page_size, None)?;
        let ipc_buffer = component.alloc_object(
            ctx,
            &format!("{}_ipc_buffer", name),
            Object::frame(page_size.trailing_zeros() as u8),
        )?;
        let ipc_buffer_cap = Cap::new(ipc_buffer).with_rights(Rights::RW);
        component.map_frame(
            ctx,
            ipc_buffer_addr,
            page_size.trailing_zeros() as u8,
            ipc_buffer_cap.clone(),
        )?;
        component.pad_and_align_to_larger_page(ctx)?;

        let sched_context = if ctx.kernel_config().is_mcs() {
            let size_bits = ctx.object_sizes().sched_context;
            let sc = component.alloc_object(
                ctx,
                &format!("{}_sc", name),
                Object::SchedContext {
                    size_bits,
                    period: DEFAULT_SC_PERIOD,
                    budget: DEFAULT_SC_BUDGET,
                },
            )?;
            Some(Cap::new(sc))
        } else {
            None
        };

        let tcb = component.alloc_object(
            ctx,
            &format!("{}_tcb", name),
            Object::Tcb(Tcb {
                ip: entry,
                sp: stack.1,
                ipc_buffer_addr,
                prio: params.prio,
                max_prio: params.max_prio,
                affinity: params.affinity,
                resume: true,
                gprs: Vec::new(),
                cspace: Some(component.cnode_cap()),
                vspace: Some(Cap::new(component.vspace_root())),
                ipc_buffer: Some(ipc_buffer_cap),
                sched_context,
            }),
        )?;
        if params.update_guard_size {
            component.defer_guard_size(tcb)?;
        }

        let endpoint = if params.endpoint {
            let ep = component.endpoint(ctx, &format!("{}_thread_ep", name))?;
            Some(component.alloc_cap(Cap::new(ep).with_rights(Rights::RW))?)
        } else {
            None
        };

        log::debug!(
            "{}: thread {} stack [{:#x}, {:#x}) ipc buffer {:#x}",
            component.name(),
            name,
            stack.0,
            stack.1,
            ipc_buffer_addr
        );

        Ok(Self {
            name: name.to_string(),
            handle: ThreadHandle { index, tcb },
            stack,
            ipc_buffer_addr,
            endpoint,
            params,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> ThreadHandle {
        self.handle
    }

    pub fn stack(&self) -> (u64, u64) {
        self.stack
    }

    pub fn ipc_buffer_addr(&self) -> u64 {
        self.ipc_buffer_addr
    }

    /// Slot of the thread's endpoint, if it has one
    pub fn endpoint(&self) -> Option<CapSlot> {
        self.endpoint
    }

    pub fn params(&self) -> &ThreadParams {
        &self.params
    }

    /// Per-thread runtime config record
    ///
    /// On MCS kernels this allocates the thread's reply object.
    pub fn runtime_config(
        &self,
        ctx: &mut CompositionContext,
        component: &mut Component,
    ) -> Result<ThreadRuntimeConfig> {
        let reply_authority = if ctx.kernel_config().is_mcs() {
            let reply = component.alloc_object(ctx, &format!("{}_reply", self.name), Object::Reply)?;
            Some(component.alloc_cap(Cap::new(reply))?)
        } else {
            None
        };

        Ok(ThreadRuntimeConfig {
            ipc_buffer_addr: self.ipc_buffer_addr,
            endpoint: self.endpoint,
            reply_authority,
        })
    }
}
