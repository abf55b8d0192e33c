//! Typed error hierarchy shared by every tilewise crate.
//!
//! Uses `thiserror` for library-grade errors. Each variant maps to a stable
//! integer code via [`EngineError::error_code`] so foreign callers can branch
//! on the kind without parsing messages.

use crate::config::SessionState;

/// Which side of a `process` call a buffer sits on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferRole {
    Input,
    Output,
}

impl std::fmt::Display for BufferRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Input => f.write_str("input"),
            Self::Output => f.write_str("output"),
        }
    }
}

/// All errors originating from tilewise.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    // ── Device ───────────────────────────────────────────────────────
    #[error("GPU {gpu_id} unavailable: {reason}")]
    DeviceUnavailable { gpu_id: i32, reason: String },

    // ── Model ────────────────────────────────────────────────────────
    #[error("Path is not valid UTF-8 at byte {valid_up_to}")]
    InvalidPathEncoding { valid_up_to: usize },

    #[error("Model load failed: {0}")]
    ModelLoad(String),

    // ── Buffers ──────────────────────────────────────────────────────
    #[error(
        "Invalid {role} buffer shape: {width}x{height}x{channels} needs {expected} bytes, have {actual}"
    )]
    InvalidBufferShape {
        role: BufferRole,
        width: u32,
        height: u32,
        channels: u32,
        expected: usize,
        actual: usize,
    },

    #[error("Buffer geometry mismatch: {0}")]
    GeometryMismatch(String),

    // ── Inference ────────────────────────────────────────────────────
    #[error("Inference engine returned status {status}")]
    Inference { status: i32 },

    // ── Caller contract ──────────────────────────────────────────────
    #[error("`{operation}` is not valid while the session is {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl EngineError {
    /// Stable integer error code.
    ///
    /// Codes are grouped by category:
    /// - 1xx: device
    /// - 2xx: model / paths
    /// - 3xx: buffers
    /// - 4xx: inference
    /// - 5xx: caller contract / configuration
    pub fn error_code(&self) -> u32 {
        match self {
            Self::DeviceUnavailable { .. } => 100,
            Self::InvalidPathEncoding { .. } => 200,
            Self::ModelLoad(_) => 201,
            Self::InvalidBufferShape { .. } => 300,
            Self::GeometryMismatch(_) => 301,
            Self::Inference { .. } => 400,
            Self::InvalidState { .. } => 500,
            Self::InvalidConfig(_) => 501,
        }
    }

    /// Whether the session that raised this error can still be used.
    ///
    /// `ModelLoad` poisons the session and device failures need a new pool.
    /// A malformed path is rejected before anything reaches the engine, so
    /// `load` can be retried with a corrected path.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::InvalidPathEncoding { .. }
                | Self::Inference { .. }
                | Self::InvalidBufferShape { .. }
                | Self::GeometryMismatch(_)
                | Self::InvalidState { .. }
                | Self::InvalidConfig(_)
        )
    }

    /// `true` for every buffer-shape kind (length or geometry).
    pub fn is_buffer_shape(&self) -> bool {
        matches!(
            self,
            Self::InvalidBufferShape { .. } | Self::GeometryMismatch(_)
        )
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, EngineError>;
