//! Runtime configuration of an ELF component
//!
//! A component finds its runtime config through the initial registers of
//! each of its threads (`[config_vaddr, config_size, thread_index]`). The
//! record is written as JSON and encoded into the binary blob that is mapped
//! into the component's address space.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::spec::CapSlot;

/// Virtual range of the static heap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticHeap {
    pub start: u64,
    pub end: u64,
}

/// Per-thread part of the runtime config
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadRuntimeConfig {
    pub ipc_buffer_addr: u64,
    pub endpoint: Option<CapSlot>,
    pub reply_authority: Option<CapSlot>,
}

/// Runtime config of one component
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub static_heap: Option<StaticHeap>,
    pub static_heap_mutex_notification: Option<CapSlot>,
    pub idle_notification: Option<CapSlot>,
    /// Primary thread first
    pub threads: Vec<ThreadRuntimeConfig>,
    pub image_identifier: Option<String>,
    /// Path of the encoded argument blob
    pub arg: Option<String>,
}

impl RuntimeConfig {
    pub fn to_postcard(&self) -> Result<Vec<u8>> {
        Ok(postcard::to_allocvec(self)?)
    }

    pub fn from_postcard(bytes: &[u8]) -> Result<Self> {
        Ok(postcard::from_bytes(bytes)?)
    }
}
