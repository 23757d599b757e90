use std::fmt;

use miette::Diagnostic;
use thiserror::Error;

/// Stable classification of control-plane failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlPlaneErrorKind {
    AccessDenied,
    NotFound,
    InvalidResponse,
    HypervisorUnavailable,
    ExecutionFailed,
}

impl ControlPlaneErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ControlPlaneErrorKind::AccessDenied => "access denied",
            ControlPlaneErrorKind::NotFound => "not found",
            ControlPlaneErrorKind::InvalidResponse => "invalid response",
            ControlPlaneErrorKind::HypervisorUnavailable => "hypervisor unavailable",
            ControlPlaneErrorKind::ExecutionFailed => "execution failed",
        }
    }

    fn hint(self) -> &'static str {
        match self {
            ControlPlaneErrorKind::AccessDenied => {
                "run from an elevated shell or add your user to the Hyper-V Administrators group"
            }
            ControlPlaneErrorKind::NotFound => "the resource may have been removed outside ragnatramp",
            ControlPlaneErrorKind::InvalidResponse => "re-run with --verbose to see the exact command",
            ControlPlaneErrorKind::HypervisorUnavailable => {
                "enable the Hyper-V feature and ensure the vmms service is running"
            }
            ControlPlaneErrorKind::ExecutionFailed => "re-run with --verbose to see the exact command",
        }
    }
}

impl fmt::Display for ControlPlaneErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum RagnatrampError {
    #[error("failed to load config from {path}")]
    ConfigLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config from {path}: {message}")]
    ConfigParse { path: String, message: String },

    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("state file {path} is corrupt: {message}")]
    StateCorrupt {
        path: String,
        message: String,
        #[help]
        hint: String,
    },

    #[error("failed to {context}")]
    StateIo {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("refusing to touch '{name}': {reason}")]
    OwnershipVerificationFailed { name: String, reason: String },

    #[error("control plane error ({kind}): {message}")]
    ControlPlane {
        kind: ControlPlaneErrorKind,
        message: String,
        #[help]
        hint: String,
    },

    #[error("checkpoint '{checkpoint}' not found for machine '{machine}'")]
    CheckpointNotFound { machine: String, checkpoint: String },

    #[error("checkpoint '{checkpoint}' already exists for machine '{machine}'")]
    CheckpointExists { machine: String, checkpoint: String },

    #[error("no machine named '{name}' in config (available: {available})")]
    NoSuchMachine { name: String, available: String },

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl RagnatrampError {
    pub fn control_plane(kind: ControlPlaneErrorKind, message: impl Into<String>) -> Self {
        RagnatrampError::ControlPlane {
            kind,
            message: message.into(),
            hint: kind.hint().into(),
        }
    }

    pub fn state_corrupt(path: impl fmt::Display, message: impl Into<String>) -> Self {
        RagnatrampError::StateCorrupt {
            path: path.to_string(),
            message: message.into(),
            hint: "inspect or move the file aside; ragnatramp will not guess which VMs it owns".into(),
        }
    }

    /// Control-plane kind, if this is a control-plane failure.
    pub fn control_plane_kind(&self) -> Option<ControlPlaneErrorKind> {
        match self {
            RagnatrampError::ControlPlane { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Process exit code: 2 for control-plane failures, 1 for everything else.
    pub fn exit_code(&self) -> i32 {
        match self {
            RagnatrampError::ControlPlane { .. } => 2,
            _ => 1,
        }
    }
}
