//! Session configuration and lifecycle states.

use serde::{Deserialize, Serialize};

/// Border, in pixels, added on every side of a tile before inference.
///
/// Reset to this value by every `configure`; not caller-tunable.
pub const PREPADDING: u32 = 10;

/// Smallest explicit tile size a caller may request (0 still means auto).
pub const MIN_TILE_SIZE: u32 = 32;

const _: () = assert!(PREPADDING > 0);

/// Lifecycle of an engine session.
///
/// `Ready` is `Loaded` plus at least one successful `process`; the two
/// accept the same operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Uninitialized,
    Configured,
    Loaded,
    Ready,
}

impl SessionState {
    /// Whether `process` may be called in this state.
    #[inline]
    pub fn accepts_process(self) -> bool {
        matches!(self, Self::Loaded | Self::Ready)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::Configured => "configured",
            Self::Loaded => "loaded",
            Self::Ready => "ready",
        };
        f.write_str(name)
    }
}

/// Effective parameters of one session, fixed at `configure` time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSessionConfig {
    /// GPU ordinal; negative runs on the CPU.
    pub gpu_id: i32,
    /// Test-time augmentation.
    pub tta_mode: bool,
    /// Resolved tile edge length in pixels. Never 0 once configured.
    pub tile_size: u32,
    /// Integer upscale factor.
    pub scale: u32,
    /// Always [`PREPADDING`].
    pub prepadding: u32,
}

impl EngineSessionConfig {
    /// `true` when the session runs without a GPU.
    #[inline]
    pub fn is_cpu(&self) -> bool {
        self.gpu_id < 0
    }

    /// Edge length of one tile as handed to the engine, border included.
    #[inline]
    pub fn padded_tile_size(&self) -> u32 {
        self.tile_size + 2 * self.prepadding
    }
}
