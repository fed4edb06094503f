//! Kernel/target configuration
//!
//! Describes the properties of the target kernel build that the composer
//! depends on: word size, supported page sizes, paging structure, whether
//! scheduling contexts are explicit (MCS), and the size of every kernel
//! object kind. Validation happens here, before any allocation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{ComposeError, Result};
use crate::spec::Object;

/// Smallest page size on every supported architecture (4KB)
pub const BASE_PAGE_BITS: u8 = 12;

/// Target architecture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Arch {
    Aarch64,
    Aarch32,
    Riscv64,
    Riscv32,
    X86_64,
    Ia32,
}

impl Arch {
    /// Parse an architecture name
    ///
    /// # Errors
    /// Returns [`ComposeError::UnsupportedArch`] for unknown names
    pub fn from_name(name: &str) -> Result<Self> {
        Ok(match name {
            "aarch64" | "arm64" => Arch::Aarch64,
            "aarch32" | "arm" => Arch::Aarch32,
            "riscv64" => Arch::Riscv64,
            "riscv32" => Arch::Riscv32,
            "x86_64" => Arch::X86_64,
            "ia32" | "x86" => Arch::Ia32,
            other => return Err(ComposeError::UnsupportedArch(other.to_string())),
        })
    }

    /// Name used in rendered specs
    pub fn name(self) -> &'static str {
        match self {
            Arch::Aarch64 => "aarch64",
            Arch::Aarch32 => "aarch32",
            Arch::Riscv64 => "riscv64",
            Arch::Riscv32 => "riscv32",
            Arch::X86_64 => "x86_64",
            Arch::Ia32 => "ia32",
        }
    }

    /// Machine word size in bits
    pub fn word_size(self) -> u32 {
        match self {
            Arch::Aarch64 | Arch::Riscv64 | Arch::X86_64 => 64,
            Arch::Aarch32 | Arch::Riscv32 | Arch::Ia32 => 32,
        }
    }

    /// Index bits of each paging level, root first
    pub fn paging_index_bits(self) -> &'static [u8] {
        match self {
            Arch::Aarch64 | Arch::X86_64 => &[9, 9, 9, 9],
            Arch::Riscv64 => &[9, 9, 9],
            Arch::Riscv32 | Arch::Ia32 => &[10, 10],
            Arch::Aarch32 => &[12, 8],
        }
    }

    /// Default supported page sizes (as bits, ascending)
    pub fn default_page_size_bits(self) -> &'static [u8] {
        match self {
            Arch::Aarch64 | Arch::Riscv64 | Arch::X86_64 => &[12, 21],
            Arch::Riscv32 | Arch::Ia32 => &[12, 22],
            Arch::Aarch32 => &[12, 20],
        }
    }

    /// Number of ASID pools the kernel can address
    pub fn asid_pool_limit(self) -> usize {
        match self {
            Arch::Aarch64 | Arch::Aarch32 => 1 << 7,
            Arch::Riscv64 | Arch::Riscv32 | Arch::X86_64 | Arch::Ia32 => 1 << 3,
        }
    }
}

/// Kernel configuration as written in the composition config
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawKernelConfig {
    pub arch: Option<String>,
    pub word_size: Option<u32>,
    pub page_size_bits: Option<Vec<u8>>,
    #[serde(default)]
    pub mcs: bool,
    pub platform: Option<String>,
}

/// Validated kernel configuration
#[derive(Debug, Clone)]
pub struct KernelConfig {
    arch: Arch,
    page_size_bits: Vec<u8>,
    mcs: bool,
    platform: Option<String>,
}

impl KernelConfig {
    /// Create a configuration with the architecture's default page sizes
    pub fn new(arch: Arch, mcs: bool) -> Self {
        Self {
            arch,
            page_size_bits: arch.default_page_size_bits().to_vec(),
            mcs,
            platform: None,
        }
    }

    /// Validate a raw configuration
    ///
    /// # Errors
    /// - `MissingKey` if `arch` is absent
    /// - `UnsupportedArch` for unknown architectures
    /// - `InvalidConfig` if the word size disagrees with the architecture, or
    ///   a page size cannot be expressed by the architecture's paging levels
    pub fn from_raw(raw: &RawKernelConfig) -> Result<Self> {
        let arch_name = raw
            .arch
            .as_deref()
            .ok_or_else(|| ComposeError::MissingKey("kernel_config.arch".into()))?;
        let arch = Arch::from_name(arch_name)?;

        if let Some(word_size) = raw.word_size {
            if word_size != arch.word_size() {
                return Err(ComposeError::InvalidConfig(format!(
                    "word size {} does not match {} ({} bits)",
                    word_size,
                    arch.name(),
                    arch.word_size()
                )));
            }
        }

        let mut config = Self::new(arch, raw.mcs);
        config.platform = raw.platform.clone();

        if let Some(bits) = &raw.page_size_bits {
            let mut bits = bits.clone();
            bits.sort_unstable();
            bits.dedup();
            if bits.first() != Some(&BASE_PAGE_BITS) {
                return Err(ComposeError::InvalidConfig(format!(
                    "page sizes must include the base page size (2^{})",
                    BASE_PAGE_BITS
                )));
            }
            for &b in &bits {
                if config.level_for_page_bits(b).is_none() {
                    return Err(ComposeError::InvalidConfig(format!(
                        "2^{} is not a page size of {}",
                        b,
                        arch.name()
                    )));
                }
            }
            config.page_size_bits = bits;
        }

        Ok(config)
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    pub fn word_size(&self) -> u32 {
        self.arch.word_size()
    }

    pub fn is_mcs(&self) -> bool {
        self.mcs
    }

    pub fn platform(&self) -> Option<&str> {
        self.platform.as_deref()
    }

    /// Smallest page size
    pub fn page_size(&self) -> u64 {
        1 << self.page_size_bits[0]
    }

    /// Second smallest page size (falls back to the page size)
    pub fn larger_page_size(&self) -> u64 {
        1 << self.page_size_bits.get(1).copied().unwrap_or(self.page_size_bits[0])
    }

    /// Supported page sizes, ascending
    pub fn page_sizes(&self) -> impl DoubleEndedIterator<Item = u64> + '_ {
        self.page_size_bits.iter().map(|&b| 1u64 << b)
    }

    /// Check whether `size` is a supported page size
    pub fn is_page_size(&self, size: u64) -> bool {
        self.page_sizes().any(|s| s == size)
    }

    /// Number of paging levels, root included
    pub fn paging_levels(&self) -> usize {
        self.arch.paging_index_bits().len()
    }

    /// Size of the region translated by one slot of a table at `level`
    pub fn slot_span_bits(&self, level: usize) -> u8 {
        let deeper: u8 = self.arch.paging_index_bits()[level + 1..].iter().sum();
        BASE_PAGE_BITS + deeper
    }

    /// Size of the region translated by a whole table at `level`
    pub fn table_span_bits(&self, level: usize) -> u8 {
        self.slot_span_bits(level) + self.arch.paging_index_bits()[level]
    }

    /// Paging level whose slots map pages of `2^bits` bytes
    pub fn level_for_page_bits(&self, bits: u8) -> Option<usize> {
        (0..self.paging_levels()).find(|&l| self.slot_span_bits(l) == bits)
    }
}

/// Size (log2 bytes) of every kernel object kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectSizes {
    pub tcb: u8,
    pub endpoint: u8,
    pub notification: u8,
    pub cnode_slot: u8,
    pub reply: u8,
    pub vspace: u8,
    pub page_table: u8,
    pub asid_pool: u8,
    pub sched_context: u8,
}

impl ObjectSizes {
    /// Default sizes for an architecture
    pub fn for_arch(arch: Arch) -> Self {
        match arch.word_size() {
            64 => Self {
                tcb: 11,
                endpoint: 4,
                notification: 5,
                cnode_slot: 5,
                reply: 5,
                vspace: 12,
                page_table: 12,
                asid_pool: 12,
                sched_context: 8,
            },
            _ => Self {
                tcb: 10,
                endpoint: 4,
                notification: 4,
                cnode_slot: 4,
                reply: 4,
                vspace: if arch == Arch::Aarch32 { 14 } else { 12 },
                page_table: if arch == Arch::Aarch32 { 10 } else { 12 },
                asid_pool: 12,
                sched_context: 8,
            },
        }
    }

    /// Apply overrides from the configuration
    ///
    /// # Errors
    /// Returns `InvalidConfig` for unknown object kinds
    pub fn with_overrides(mut self, overrides: &BTreeMap<String, u8>) -> Result<Self> {
        for (key, &bits) in overrides {
            let field = match key.as_str() {
                "tcb" => &mut self.tcb,
                "endpoint" => &mut self.endpoint,
                "notification" => &mut self.notification,
                "cnode_slot" => &mut self.cnode_slot,
                "reply" => &mut self.reply,
                "vspace" => &mut self.vspace,
                "page_table" => &mut self.page_table,
                "asid_pool" => &mut self.asid_pool,
                "sched_context" => &mut self.sched_context,
                other => {
                    return Err(ComposeError::InvalidConfig(format!(
                        "unknown object kind `{}` in object_sizes",
                        other
                    )))
                }
            };
            *field = bits;
        }
        Ok(self)
    }

    /// Size of an object when retyped from untyped memory
    ///
    /// Returns `None` for objects that are not backed by untyped memory, and
    /// for capability tables whose size has not been frozen yet.
    pub fn size_bits(&self, object: &Object) -> Option<u8> {
        Some(match object {
            Object::Untyped { .. } | Object::Irq { .. } => return None,
            Object::Endpoint => self.endpoint,
            Object::Notification => self.notification,
            Object::Reply => self.reply,
            Object::CNode { size_bits, .. } => self.cnode_slot + (*size_bits)?,
            Object::Tcb(_) => self.tcb,
            Object::Frame(frame) => frame.size_bits,
            Object::PageTable { is_root: true, .. } => self.vspace,
            Object::PageTable { .. } => self.page_table,
            Object::AsidPool { .. } => self.asid_pool,
            Object::SchedContext { size_bits, .. } => *size_bits,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(arch: &str) -> RawKernelConfig {
        RawKernelConfig {
            arch: Some(arch.into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_page_sizes() {
        let config = KernelConfig::from_raw(&raw("aarch64")).unwrap();
        assert_eq!(config.page_size(), 0x1000);
        assert_eq!(config.larger_page_size(), 0x20_0000);
        assert_eq!(config.word_size(), 64);
        assert!(!config.is_mcs());
    }

    #[test]
    fn test_paging_levels() {
        let config = KernelConfig::new(Arch::Aarch64, false);
        assert_eq!(config.level_for_page_bits(12), Some(3));
        assert_eq!(config.level_for_page_bits(21), Some(2));
        assert_eq!(config.level_for_page_bits(30), Some(1));
        assert_eq!(config.level_for_page_bits(13), None);
        assert_eq!(config.table_span_bits(0), 48);

        let config = KernelConfig::new(Arch::Aarch32, false);
        assert_eq!(config.level_for_page_bits(20), Some(0));
        assert_eq!(config.level_for_page_bits(12), Some(1));
    }

    #[test]
    fn test_unsupported_arch() {
        let err = KernelConfig::from_raw(&raw("mips")).unwrap_err();
        assert!(matches!(err, ComposeError::UnsupportedArch(ref a) if a == "mips"));
    }

    #[test]
    fn test_missing_arch() {
        let err = KernelConfig::from_raw(&RawKernelConfig::default()).unwrap_err();
        assert!(matches!(err, ComposeError::MissingKey(_)));
    }

    #[test]
    fn test_word_size_mismatch() {
        let mut r = raw("riscv32");
        r.word_size = Some(64);
        assert!(matches!(
            KernelConfig::from_raw(&r),
            Err(ComposeError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_page_size_override() {
        let mut r = raw("aarch64");
        r.page_size_bits = Some(vec![30, 12, 21]);
        let config = KernelConfig::from_raw(&r).unwrap();
        assert_eq!(
            config.page_sizes().collect::<Vec<_>>(),
            vec![0x1000, 0x20_0000, 0x4000_0000]
        );

        r.page_size_bits = Some(vec![12, 16]);
        assert!(KernelConfig::from_raw(&r).is_err());
    }

    #[test]
    fn test_object_size_overrides() {
        let mut overrides = BTreeMap::new();
        overrides.insert("tcb".to_string(), 10);
        let sizes = ObjectSizes::for_arch(Arch::Aarch64)
            .with_overrides(&overrides)
            .unwrap();
        assert_eq!(sizes.tcb, 10);

        overrides.insert("vcpu".to_string(), 12);
        assert!(ObjectSizes::for_arch(Arch::Aarch64)
            .with_overrides(&overrides)
            .is_err());
    }
}
