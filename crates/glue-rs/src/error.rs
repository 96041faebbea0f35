use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::abi::GlueCodeReturn;
use crate::device::DeviceClass;
use crate::shape::ShapeFunctionKey;

/// Buffer class reported as too small by an instantiate call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferKind {
    Auxiliary,
    Instruction,
}

impl fmt::Display for BufferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferKind::Auxiliary => f.write_str("auxiliary"),
            BufferKind::Instruction => f.write_str("instruction"),
        }
    }
}

/// Outcomes the graph compiler observes from this crate. Raw plug-in return codes are translated
/// into these variants by [`GlueError::from_code`] and never surface on their own.
#[derive(Debug, Error)]
pub enum GlueError {
    #[error("identifier {identifier} is not registered for device {device}")]
    NotFound {
        identifier: String,
        device: DeviceClass,
    },
    #[error("{kind} buffer too small for {identifier}")]
    InsufficientBuffer {
        identifier: String,
        kind: BufferKind,
    },
    #[error("{identifier} is unsupported: {code}")]
    Unsupported {
        identifier: String,
        code: GlueCodeReturn,
    },
    #[error("shape function {key} version mismatch: artifact recorded {recorded}, registry has {live}")]
    VersionMismatch {
        key: ShapeFunctionKey,
        recorded: u64,
        live: u64,
    },
    #[error("failed to load plug-in {}: {reason}", path.display())]
    PluginLoadFailure { path: PathBuf, reason: String },
    #[error("shape function {key} is not registered")]
    MissingShapeFunction { key: ShapeFunctionKey },
    #[error("kernel {identifier} was already registered by another plug-in")]
    DuplicateRegistration { identifier: String },
    #[error("failed to extract kernel binary for node {node_id}: {reason}")]
    BinaryExtraction { node_id: u64, reason: String },
    #[error("internal contract violation: {message}")]
    Contract { message: String },
    #[error("artifact error: {0}")]
    Artifact(#[from] ArtifactError),
}

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unsupported artifact format version {found} (expected {expected})")]
    FormatVersion { found: u32, expected: u32 },
}

impl GlueError {
    pub fn contract(message: impl Into<String>) -> Self {
        GlueError::Contract {
            message: message.into(),
        }
    }

    pub fn load_failure(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        GlueError::PluginLoadFailure {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Translates a plug-in status into the error taxonomy. `SUCCESS` maps to `Ok(())`.
    pub fn from_code(
        code: GlueCodeReturn,
        identifier: &str,
        device: DeviceClass,
    ) -> Result<(), GlueError> {
        let identifier = identifier.to_string();
        match code {
            GlueCodeReturn::SUCCESS => Ok(()),
            GlueCodeReturn::NODE_NOT_FOUND => Err(GlueError::NotFound { identifier, device }),
            GlueCodeReturn::INSUFFICIENT_AUX_BUFFER_SIZE => Err(GlueError::InsufficientBuffer {
                identifier,
                kind: BufferKind::Auxiliary,
            }),
            GlueCodeReturn::INSUFFICIENT_ELF_BUFFER | GlueCodeReturn::INSUFFICIENT_ISA_BUFFER => {
                Err(GlueError::InsufficientBuffer {
                    identifier,
                    kind: BufferKind::Instruction,
                })
            }
            code => Err(GlueError::Unsupported { identifier, code }),
        }
    }

    /// Raw status carried by an `Unsupported` outcome, for diagnostics.
    pub fn raw_code(&self) -> Option<GlueCodeReturn> {
        match self {
            GlueError::Unsupported { code, .. } => Some(*code),
            GlueError::NotFound { .. } => Some(GlueCodeReturn::NODE_NOT_FOUND),
            GlueError::InsufficientBuffer { kind, .. } => Some(match kind {
                BufferKind::Auxiliary => GlueCodeReturn::INSUFFICIENT_AUX_BUFFER_SIZE,
                BufferKind::Instruction => GlueCodeReturn::INSUFFICIENT_ELF_BUFFER,
            }),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, GlueError::NotFound { .. })
    }
}

pub type GlueResult<T> = Result<T, GlueError>;
