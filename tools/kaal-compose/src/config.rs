//! Composition configuration
//!
//! Loaded from TOML (or JSON, by file extension):
//!
//! ```toml
//! compute_ut_covers = true
//!
//! [kernel_config]
//! arch = "aarch64"
//! mcs = false
//!
//! [platform_info]
//! memory = [{ start = 0x4000_0000, end = 0x8000_0000 }]
//! devices = [{ start = 0x0900_0000, end = 0x0900_1000 }]
//!
//! [components.server]
//! image = "build/server.elf"
//! heap_size = 0x10_0000
//! irqs = [33]
//! mmio = [{ paddr = 0x0900_0000, size = 0x1000 }]
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::context::CompositionContext;
use crate::encoder::BlobEncoder;
use crate::error::{ComposeError, Result};
use crate::kernel_config::{KernelConfig, ObjectSizes, RawKernelConfig};

/// Environment variable naming the configuration file
pub const CONFIG_ENV: &str = "CONFIG";
/// Environment variable naming the output directory
pub const OUT_DIR_ENV: &str = "OUT_DIR";

/// A physical address range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Region {
    pub start: u64,
    pub end: u64,
}

/// Physical memory map of the platform
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PlatformInfo {
    #[serde(default)]
    pub memory: Vec<Region>,
    #[serde(default)]
    pub devices: Vec<Region>,
}

/// A device region mapped into a component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct MmioConfig {
    pub paddr: u64,
    pub size: u64,
}

/// A secondary thread of a component
///
/// Unset values default to the primary thread's (priority + 1 for `prio`).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SecondaryThreadConfig {
    pub name: String,
    pub prio: Option<u8>,
    pub max_prio: Option<u8>,
    pub affinity: Option<u64>,
    pub stack_size: Option<u64>,
    #[serde(default = "default_true")]
    pub endpoint: bool,
}

fn default_true() -> bool {
    true
}

/// Configuration record of one component
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ComponentConfig {
    /// Program image
    pub image: PathBuf,
    pub heap_size: Option<u64>,
    pub prio: Option<u8>,
    pub max_prio: Option<u8>,
    pub affinity: Option<u64>,
    pub stack_size: Option<u64>,
    #[serde(default)]
    pub secondary_threads: Vec<SecondaryThreadConfig>,
    #[serde(default)]
    pub mmio: Vec<MmioConfig>,
    #[serde(default)]
    pub irqs: Vec<u64>,
    /// Argument record, passed to the component as JSON
    pub arg: Option<serde_json::Value>,
    #[serde(default)]
    pub arg_encoder: BlobEncoder,
}

impl ComponentConfig {
    /// Configuration of a component with nothing but an image
    pub fn new(image: impl Into<PathBuf>) -> Self {
        Self {
            image: image.into(),
            heap_size: None,
            prio: None,
            max_prio: None,
            affinity: None,
            stack_size: None,
            secondary_threads: Vec::new(),
            mmio: Vec::new(),
            irqs: Vec::new(),
            arg: None,
            arg_encoder: BlobEncoder::Identity,
        }
    }
}

/// Top-level composition configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ComposeConfig {
    pub kernel_config: RawKernelConfig,
    #[serde(default)]
    pub object_sizes: BTreeMap<String, u8>,
    pub platform_info: Option<PlatformInfo>,
    #[serde(default)]
    pub compute_ut_covers: bool,
    #[serde(default)]
    pub expose_spare_untypeds: bool,
    pub runtime_config_encoder: Option<BlobEncoder>,
    #[serde(default)]
    pub components: BTreeMap<String, ComponentConfig>,
}

impl ComposeConfig {
    /// Load a configuration file (`.json` as JSON, anything else as TOML)
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| ComposeError::io(path, e))?;
        log::info!("Loading configuration from {}", path.display());

        if path.extension().is_some_and(|ext| ext == "json") {
            Self::from_json(&text)
        } else {
            Self::from_toml(&text)
        }
    }

    /// Load the configuration file named by `CONFIG`
    pub fn from_env() -> Result<Self> {
        let path = std::env::var_os(CONFIG_ENV).ok_or_else(|| ComposeError::MissingKey(CONFIG_ENV.into()))?;
        Self::load(PathBuf::from(path))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Validate everything that does not need the filesystem
    ///
    /// # Errors
    /// - configuration errors from the kernel configuration and object sizes
    /// - `MissingKey` if untyped covering is requested without `platform_info`
    /// - `InvalidConfig` for empty or inverted regions
    pub fn validate(&self) -> Result<(KernelConfig, ObjectSizes)> {
        let kernel_config = KernelConfig::from_raw(&self.kernel_config)?;
        let object_sizes = ObjectSizes::for_arch(kernel_config.arch()).with_overrides(&self.object_sizes)?;

        if self.compute_ut_covers {
            let info = self
                .platform_info
                .as_ref()
                .ok_or_else(|| ComposeError::MissingKey("platform_info".into()))?;
            for region in info.memory.iter().chain(&info.devices) {
                if region.start >= region.end {
                    return Err(ComposeError::InvalidConfig(format!(
                        "empty region [{:#x}, {:#x})",
                        region.start, region.end
                    )));
                }
            }
        }

        for (name, component) in &self.components {
            for mmio in &component.mmio {
                if mmio.size == 0 {
                    return Err(ComposeError::InvalidConfig(format!(
                        "components.{}: empty mmio region at {:#x}",
                        name, mmio.paddr
                    )));
                }
            }
        }

        Ok((kernel_config, object_sizes))
    }

    /// Build a composition context writing to `out_dir`
    pub fn context(&self, out_dir: impl Into<PathBuf>) -> Result<CompositionContext> {
        let (kernel_config, object_sizes) = self.validate()?;
        let mut ctx = CompositionContext::new(kernel_config, out_dir)
            .with_object_sizes(object_sizes)
            .with_component_configs(self.components.clone());
        if let Some(encoder) = &self.runtime_config_encoder {
            ctx = ctx.with_runtime_config_encoder(encoder.clone());
        }
        Ok(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel_config::Arch;

    const TOML: &str = r#"
compute_ut_covers = true
expose_spare_untypeds = true

[kernel_config]
arch = "riscv64"
mcs = true
platform = "qemu-riscv-virt"

[object_sizes]
tcb = 10

[platform_info]
memory = [{ start = 0x8000_0000, end = 0x9000_0000 }]

[runtime_config_encoder]
kind = "postcard"

[components.server]
image = "server.elf"
prio = 200
irqs = [10, 11]
mmio = [{ paddr = 0x1000_0000, size = 0x1000 }]
secondary_threads = [{ name = "worker" }]

[components.server.arg]
greeting = "hello"
"#;

    #[test]
    fn test_parse_toml() {
        let config = ComposeConfig::from_toml(TOML).unwrap();
        assert!(config.compute_ut_covers);
        assert_eq!(config.runtime_config_encoder, Some(BlobEncoder::Postcard));

        let server = &config.components["server"];
        assert_eq!(server.prio, Some(200));
        assert_eq!(server.irqs, vec![10, 11]);
        assert_eq!(server.secondary_threads[0].name, "worker");
        assert!(server.secondary_threads[0].endpoint);
        assert_eq!(server.arg_encoder, BlobEncoder::Identity);
        assert_eq!(server.arg.as_ref().unwrap()["greeting"], "hello");

        let (kernel_config, sizes) = config.validate().unwrap();
        assert_eq!(kernel_config.arch(), Arch::Riscv64);
        assert!(kernel_config.is_mcs());
        assert_eq!(kernel_config.platform(), Some("qemu-riscv-virt"));
        assert_eq!(sizes.tcb, 10);
    }

    #[test]
    fn test_parse_json() {
        let config = ComposeConfig::from_json(
            r#"{"kernel_config": {"arch": "aarch64"}, "components": {"a": {"image": "a.elf"}}}"#,
        )
        .unwrap();
        assert!(!config.compute_ut_covers);
        assert_eq!(config.components["a"], ComponentConfig::new("a.elf"));
    }

    #[test]
    fn test_covers_need_platform_info() {
        let config = ComposeConfig::from_toml(
            "compute_ut_covers = true\n[kernel_config]\narch = \"aarch64\"\n",
        )
        .unwrap();
        assert!(matches!(
            config.validate(),
            Err(ComposeError::MissingKey(ref k)) if k == "platform_info"
        ));
    }

    #[test]
    fn test_unsupported_arch_fails_validation() {
        let config = ComposeConfig::from_toml("[kernel_config]\narch = \"sparc\"\n").unwrap();
        assert!(matches!(
            config.context("/tmp/out"),
            Err(ComposeError::UnsupportedArch(_))
        ));
    }

    #[test]
    fn test_load_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("compose.json");
        fs::write(&path, r#"{"kernel_config": {"arch": "x86_64"}}"#).unwrap();
        let config = ComposeConfig::load(&path).unwrap();
        assert_eq!(config.kernel_config.arch.as_deref(), Some("x86_64"));
    }
}
