#![doc = include_str!("../README.md")]

pub mod config;
pub mod engine;
pub mod error;
pub mod image;
pub mod path;
pub mod probe;
pub mod tiling;

pub use config::{EngineSessionConfig, MIN_TILE_SIZE, PREPADDING, SessionState};
pub use engine::{InferenceEngine, ModelFiles};
pub use error::{BufferRole, EngineError, Result};
pub use image::{ImageBuffer, MatView, MatViewMut};
pub use path::{ModelPath, PathEncoding};
pub use probe::{DeviceBudgetProbe, HeapBudget};
pub use tiling::{TilePolicy, TileTier, decide_tile_size};
