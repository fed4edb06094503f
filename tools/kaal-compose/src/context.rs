//! Composition context
//!
//! Everything a component needs while it is being composed: the target
//! kernel configuration, the shared object space, the registry of files
//! that frame fills refer to, the output directory and the per-component
//! configuration records. Components receive it by `&mut` instead of
//! reaching for shared global state.
//!
//! The context also carries the composition phase. Operations that are only
//! legal in one phase check it on every call.
//!
//! ```text
//! Construction -> PreFinalize -> Finalize -> Allocation -> Complete
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::config::ComponentConfig;
use crate::encoder::BlobEncoder;
use crate::error::{ComposeError, Result};
use crate::kernel_config::{KernelConfig, ObjectSizes};
use crate::spec::ObjectSpace;

/// Composition phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    /// Components are created and lay out their static state
    Construction,
    /// Every component runs `pre_finalize`
    PreFinalize,
    /// Every component runs `finalize`
    Finalize,
    /// ASID and untyped assignment
    Allocation,
    /// Outputs written
    Complete,
}

impl Phase {
    /// The phase that follows this one
    pub fn next(self) -> Option<Phase> {
        match self {
            Phase::Construction => Some(Phase::PreFinalize),
            Phase::PreFinalize => Some(Phase::Finalize),
            Phase::Finalize => Some(Phase::Allocation),
            Phase::Allocation => Some(Phase::Complete),
            Phase::Complete => None,
        }
    }
}

/// State shared by all components of one composition
#[derive(Debug)]
pub struct CompositionContext {
    kernel_config: KernelConfig,
    object_sizes: ObjectSizes,
    objects: ObjectSpace,
    files: BTreeMap<String, PathBuf>,
    out_dir: PathBuf,
    components: BTreeMap<String, ComponentConfig>,
    runtime_config_encoder: BlobEncoder,
    phase: Phase,
}

impl CompositionContext {
    /// Create a context in the construction phase
    ///
    /// Object sizes default to the architecture's, and runtime configs are
    /// encoded by the external serializer.
    pub fn new(kernel_config: KernelConfig, out_dir: impl Into<PathBuf>) -> Self {
        let arch = kernel_config.arch();
        Self {
            object_sizes: ObjectSizes::for_arch(arch),
            objects: ObjectSpace::new(arch),
            kernel_config,
            files: BTreeMap::new(),
            out_dir: out_dir.into(),
            components: BTreeMap::new(),
            runtime_config_encoder: BlobEncoder::runtime_config_default(),
            phase: Phase::Construction,
        }
    }

    pub fn with_object_sizes(mut self, object_sizes: ObjectSizes) -> Self {
        self.object_sizes = object_sizes;
        self
    }

    pub fn with_component_configs(mut self, components: BTreeMap<String, ComponentConfig>) -> Self {
        self.components = components;
        self
    }

    pub fn with_runtime_config_encoder(mut self, encoder: BlobEncoder) -> Self {
        self.runtime_config_encoder = encoder;
        self
    }

    pub fn kernel_config(&self) -> &KernelConfig {
        &self.kernel_config
    }

    pub fn object_sizes(&self) -> &ObjectSizes {
        &self.object_sizes
    }

    pub fn objects(&self) -> &ObjectSpace {
        &self.objects
    }

    pub fn objects_mut(&mut self) -> &mut ObjectSpace {
        &mut self.objects
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    /// Path of an output file
    pub fn out_path(&self, fname: &str) -> PathBuf {
        self.out_dir.join(fname)
    }

    pub fn runtime_config_encoder(&self) -> &BlobEncoder {
        &self.runtime_config_encoder
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Move to the next phase
    ///
    /// # Errors
    /// Returns `LifecycleViolation` if `next` does not directly follow the
    /// current phase
    pub fn enter_phase(&mut self, next: Phase) -> Result<()> {
        if self.phase.next() != Some(next) {
            return Err(ComposeError::LifecycleViolation {
                component: "composition".into(),
                operation: "phase change",
                phase: self.phase,
            });
        }
        log::info!("Entering phase {:?}", next);
        self.phase = next;
        Ok(())
    }

    /// Check that `operation` on `component` runs in the `expected` phase
    pub fn ensure_phase(&self, component: &str, operation: &'static str, expected: Phase) -> Result<()> {
        if self.phase != expected {
            return Err(ComposeError::LifecycleViolation {
                component: component.to_string(),
                operation,
                phase: self.phase,
            });
        }
        Ok(())
    }

    /// Register a file that frame fills refer to by `fname`
    ///
    /// Registering the same name for the same path again is a no-op.
    ///
    /// # Errors
    /// Returns `FileConflict` if `fname` is bound to another path
    pub fn register_file(&mut self, fname: &str, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        match self.files.get(fname) {
            Some(existing) if existing != path => Err(ComposeError::FileConflict {
                fname: fname.to_string(),
                existing: existing.clone(),
            }),
            Some(_) => Ok(()),
            None => {
                log::debug!("register file {} -> {}", fname, path.display());
                self.files.insert(fname.to_string(), path.to_path_buf());
                Ok(())
            }
        }
    }

    /// Path a registered file name refers to
    pub fn file(&self, fname: &str) -> Option<&Path> {
        self.files.get(fname).map(PathBuf::as_path)
    }

    /// All registered files, by name
    pub fn files(&self) -> &BTreeMap<String, PathBuf> {
        &self.files
    }

    /// Configuration record of a component
    ///
    /// # Errors
    /// Returns `MissingKey` if the component is not configured
    pub fn component_config(&self, name: &str) -> Result<&ComponentConfig> {
        self.components
            .get(name)
            .ok_or_else(|| ComposeError::MissingKey(format!("components.{}", name)))
    }

    pub fn component_configs(&self) -> &BTreeMap<String, ComponentConfig> {
        &self.components
    }
}
