//! Blob encoders
//!
//! Runtime configs and component arguments are first written as JSON, then
//! encoded into the binary blob a component maps. Encoding must be
//! deterministic: identical JSON gives byte-identical output.
//!
//! ```text
//! identity   copy the JSON bytes
//! postcard   decode the JSON into the typed record, encode with postcard
//! command    external program, JSON on stdin, blob on stdout
//! empty      an empty blob, no JSON is read
//! ```

use std::fs::{self, File};
use std::path::Path;
use std::process::{Command, Stdio};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{ComposeError, Result};

/// External runtime-config serializer of the simple task runtime
pub const DEFAULT_RUNTIME_CONFIG_ENCODER: &str = "sel4-simple-task-serialize-runtime-config";

/// How a JSON intermediate becomes a binary blob
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlobEncoder {
    #[default]
    Identity,
    Postcard,
    Command {
        argv: Vec<String>,
    },
    Empty,
}

impl BlobEncoder {
    /// Encoder used for runtime configs unless configured otherwise
    pub fn runtime_config_default() -> Self {
        BlobEncoder::Command {
            argv: vec![DEFAULT_RUNTIME_CONFIG_ENCODER.to_string()],
        }
    }

    /// Encode the JSON at `json_path` into `bin_path`
    ///
    /// `T` is the record the JSON holds; only the postcard encoder uses it.
    ///
    /// # Errors
    /// - `EncoderSpawn` / `EncoderFailed` if the external program cannot run
    ///   or exits unsuccessfully
    /// - `Json` / `Postcard` if the record does not decode or encode
    pub fn encode<T>(&self, json_path: &Path, bin_path: &Path) -> Result<()>
    where
        T: Serialize + DeserializeOwned,
    {
        match self {
            BlobEncoder::Identity => {
                fs::copy(json_path, bin_path).map_err(|e| ComposeError::io(json_path, e))?;
            }
            BlobEncoder::Postcard => {
                let json = fs::read(json_path).map_err(|e| ComposeError::io(json_path, e))?;
                let record: T = serde_json::from_slice(&json)?;
                let bytes = postcard::to_allocvec(&record)?;
                fs::write(bin_path, bytes).map_err(|e| ComposeError::io(bin_path, e))?;
            }
            BlobEncoder::Command { argv } => run_command(argv, json_path, bin_path)?,
            BlobEncoder::Empty => {
                File::create(bin_path).map_err(|e| ComposeError::io(bin_path, e))?;
            }
        }
        log::debug!("encoded {} -> {}", json_path.display(), bin_path.display());
        Ok(())
    }
}

fn run_command(argv: &[String], json_path: &Path, bin_path: &Path) -> Result<()> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| ComposeError::InvalidConfig("encoder command is empty".into()))?;

    let stdin = File::open(json_path).map_err(|e| ComposeError::io(json_path, e))?;
    let stdout = File::create(bin_path).map_err(|e| ComposeError::io(bin_path, e))?;

    let status = Command::new(program)
        .args(args)
        .stdin(Stdio::from(stdin))
        .stdout(Stdio::from(stdout))
        .status()
        .map_err(|source| {
            log::error!("Failed to run {} on {}", program, json_path.display());
            ComposeError::EncoderSpawn {
                program: program.clone(),
                json_path: json_path.to_path_buf(),
                source,
            }
        })?;

    if !status.success() {
        log::error!("{} failed ({}) on {}", program, status, json_path.display());
        return Err(ComposeError::EncoderFailed {
            program: program.clone(),
            json_path: json_path.to_path_buf(),
            status,
        });
    }
    Ok(())
}

/// Write `value` as pretty JSON
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    fs::write(path, json).map_err(|e| ComposeError::io(path, e))
}
