//! Inference engine trait: the contract the session drives.
//!
//! Engines keep the native status-code convention: `0` is success, anything
//! else is a failure the session wraps into a typed error. Engines never see
//! an invalid buffer; the session checks shapes and geometry first.

use std::path::PathBuf;

use crate::config::EngineSessionConfig;
use crate::image::{MatView, MatViewMut};

/// Resolved model file pair handed to [`InferenceEngine::load`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelFiles {
    /// Network description.
    pub param: PathBuf,
    /// Weights.
    pub model: PathBuf,
}

/// Super-resolution engine bound to one device.
///
/// One instance serves one session. Calls are strictly sequential: the
/// session holds the engine by value and every method takes `&mut self`.
pub trait InferenceEngine: Send {
    /// Apply `config` before any model is loaded. Called on every
    /// `configure`.
    fn configure(&mut self, config: &EngineSessionConfig);

    /// Load the model pair. Returns the engine status.
    fn load(&mut self, files: &ModelFiles) -> i32;

    /// Upscale `input` into `output`. Returns the engine status.
    ///
    /// `output` is exactly `scale ×` the input's width and height with the
    /// same channel count.
    fn process(&mut self, input: MatView<'_>, output: MatViewMut<'_>) -> i32;

    /// File names `(param, model)` this engine expects for a model `stem`.
    fn model_file_names(stem: &str) -> (String, String)
    where
        Self: Sized;
}
