#![doc = include_str!("../README.md")]

#[cfg(not(feature = "ort-runtime"))]
#[path = "engine_stub.rs"]
pub mod engine;
#[cfg(feature = "ort-runtime")]
pub mod engine;

pub mod external_data;
pub mod tiles;

pub use engine::{OrtEngine, STATUS_FAILED};
