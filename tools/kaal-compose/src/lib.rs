//! KaaL Compose - Static capability distribution composer
//!
//! # Purpose
//! Builds, at build time, the complete set of kernel objects and capabilities
//! a KaaL system starts with: one capability table, address space and set of
//! threads per component, every page of every program image, device mappings
//! and IRQ handlers. The result is written as a capDL-style spec that a
//! loader instantiates at boot.
//!
//! # Architecture
//! - [`context::CompositionContext`]: kernel configuration, the shared
//!   [`spec::ObjectSpace`], the file registry and the composition phase
//! - [`component::Component`]: a capability table ([`cspace::CSpace`]), an
//!   address space ([`vspace::AddressSpace`]) and a layout cursor, with the
//!   layout primitives of [`component::Layoutable`]
//! - [`elf_component::ElfComponent`]: a component running an ELF image, with
//!   its [`thread::Thread`]s and [`runtime_config::RuntimeConfig`]
//! - [`composition::Composition`]: drives registered components through the
//!   phases, then runs [`asid`] assignment and [`untyped`] covering
//!
//! # Testing Strategy
//! - Unit tests: per module
//! - Integration tests: `tests/` composes real ELF images end to end
//! - Benchmarks: untyped covering

pub mod align;
pub mod asid;
pub mod component;
pub mod composition;
pub mod config;
pub mod context;
pub mod cspace;
pub mod elf;
pub mod elf_component;
pub mod encoder;
pub mod error;
pub mod kernel_config;
pub mod runtime_config;
pub mod spec;
pub mod thread;
pub mod untyped;
pub mod vspace;

pub use component::{Component, ComponentState, Composable, Layoutable, MapOptions};
pub use composition::{Composition, Summary};
pub use config::{ComponentConfig, ComposeConfig, PlatformInfo};
pub use context::{CompositionContext, Phase};
pub use elf_component::ElfComponent;
pub use encoder::BlobEncoder;
pub use error::{ComposeError, ErrorKind, Result};
pub use kernel_config::{Arch, KernelConfig, ObjectSizes};
pub use runtime_config::RuntimeConfig;
pub use spec::{Cap, CapSlot, Object, ObjectId, ObjectSpace, Rights, Spec};
pub use thread::{Thread, ThreadHandle, ThreadParams};
