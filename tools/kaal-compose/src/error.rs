//! Error types for composition
//!
//! Every failure aborts the whole composition. A partially correct capability
//! distribution is a boot-time hazard for the target system, so nothing here
//! is ever recovered from; errors only carry enough context to diagnose the
//! offending component, object, or file.

use std::path::{Path, PathBuf};
use std::process::ExitStatus;

use thiserror::Error;

use crate::context::Phase;

/// Broad classification of a [`ComposeError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Misaligned or overlapping virtual layout, cursor misuse
    Layout,
    /// Physical memory or ASID space cannot satisfy a request
    Capacity,
    /// An external encoder failed
    Tool,
    /// Invalid or incomplete configuration
    Config,
    /// Two-phase protocol or freeze violation
    Lifecycle,
    /// Input/output and parsing failures
    Io,
}

/// Error types for composition
#[derive(Debug, Error)]
pub enum ComposeError {
    #[error("Misaligned mapping: vaddr {vaddr:#x} is not aligned to page size {size:#x}")]
    MisalignedMapping { vaddr: u64, size: u64 },

    #[error("Unsupported page size {size:#x}")]
    UnsupportedPageSize { size: u64 },

    #[error("Alignment {align:#x} is not a power of two")]
    InvalidAlignment { align: u64 },

    #[error("{component}: mapping [{start:#x}, {end:#x}) overlaps mapping at {existing:#x}")]
    MappingOverlap {
        component: String,
        start: u64,
        end: u64,
        existing: u64,
    },

    #[error("Cursor cannot move backward from {cursor:#x} to {target:#x}")]
    CursorRegression { cursor: u64, target: u64 },

    #[error("Virtual address space exhausted at {cursor:#x} (requested {requested:#x} bytes)")]
    AddressOverflow { cursor: u64, requested: u64 },

    #[error("Range [{start:#x}, {end:#x}) cannot be tiled with the supported page sizes")]
    UntileableRange { start: u64, end: u64 },

    #[error("No untyped chunk can hold {object} ({size_bits} bits)")]
    UntypedExhausted { object: String, size_bits: u8 },

    #[error("No region covers {object} at physical address {paddr:#x}")]
    UncoveredPhysicalAddress { object: String, paddr: u64 },

    #[error("Physical address {paddr:#x} of {object} is not aligned to its size ({size_bits} bits)")]
    MisalignedPhysicalAddress {
        object: String,
        paddr: u64,
        size_bits: u8,
    },

    #[error("Too many ASID pools ({count}, limit {limit})")]
    AsidPoolsExhausted { count: usize, limit: usize },

    #[error("Failed to spawn encoder `{program}` for {}", .json_path.display())]
    EncoderSpawn {
        program: String,
        json_path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Encoder `{program}` failed ({status}) on {}", .json_path.display())]
    EncoderFailed {
        program: String,
        json_path: PathBuf,
        status: ExitStatus,
    },

    #[error("Missing configuration key `{0}`")]
    MissingKey(String),

    #[error("Unsupported architecture `{0}`")]
    UnsupportedArch(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("File `{fname}` already registered for {}", .existing.display())]
    FileConflict { fname: String, existing: PathBuf },

    #[error("Component {0} is finalized and can no longer be modified")]
    ComponentFrozen(String),

    #[error("{component}: {operation} is not allowed during {phase:?}")]
    LifecycleViolation {
        component: String,
        operation: &'static str,
        phase: Phase,
    },

    #[error("Capability table {0} was never sized, its component is not registered")]
    UnsizedCNode(String),

    #[error("Image object spec of {0} was already merged")]
    ImageAlreadyMerged(String),

    #[error("Image object spec of {0} targets a foreign address space")]
    ForeignAddressSpace(String),

    #[error("Duplicate object name `{0}`")]
    DuplicateObject(String),

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse ELF {}: {source}", .path.display())]
    Elf {
        path: PathBuf,
        #[source]
        source: goblin::error::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Postcard error: {0}")]
    Postcard(#[from] postcard::Error),
}

impl ComposeError {
    /// Wrap an I/O error with the path it occurred on
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MisalignedMapping { .. }
            | Self::UnsupportedPageSize { .. }
            | Self::InvalidAlignment { .. }
            | Self::MappingOverlap { .. }
            | Self::CursorRegression { .. }
            | Self::AddressOverflow { .. }
            | Self::UntileableRange { .. }
            | Self::MisalignedPhysicalAddress { .. } => ErrorKind::Layout,
            Self::UntypedExhausted { .. }
            | Self::UncoveredPhysicalAddress { .. }
            | Self::AsidPoolsExhausted { .. } => ErrorKind::Capacity,
            Self::EncoderSpawn { .. } | Self::EncoderFailed { .. } => ErrorKind::Tool,
            Self::MissingKey(_)
            | Self::UnsupportedArch(_)
            | Self::InvalidConfig(_)
            | Self::FileConflict { .. } => ErrorKind::Config,
            Self::ComponentFrozen(_)
            | Self::LifecycleViolation { .. }
            | Self::UnsizedCNode(_)
            | Self::ImageAlreadyMerged(_)
            | Self::ForeignAddressSpace(_)
            | Self::DuplicateObject(_) => ErrorKind::Lifecycle,
            Self::Io { .. }
            | Self::Elf { .. }
            | Self::Json(_)
            | Self::Toml(_)
            | Self::Postcard(_) => ErrorKind::Io,
        }
    }
}

pub type Result<T> = core::result::Result<T, ComposeError>;
