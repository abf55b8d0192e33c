#![allow(missing_docs)]
//! Stub ORT engine for builds without the `ort-runtime` feature.
//!
//! Same public surface as the real engine; `load` and `process` always fail.

use tracing::warn;

use tilewise_core::config::EngineSessionConfig;
use tilewise_core::engine::{InferenceEngine, ModelFiles};
use tilewise_core::image::{MatView, MatViewMut};

pub const STATUS_FAILED: i32 = -1;

pub struct OrtEngine {
    gpu_id: i32,
}

impl OrtEngine {
    pub fn new(gpu_id: i32) -> Self {
        Self { gpu_id }
    }

    pub fn gpu_id(&self) -> i32 {
        self.gpu_id
    }

    pub fn is_loaded(&self) -> bool {
        false
    }
}

impl InferenceEngine for OrtEngine {
    fn configure(&mut self, _config: &EngineSessionConfig) {}

    fn load(&mut self, files: &ModelFiles) -> i32 {
        warn!(
            graph = %files.param.display(),
            "tilewise-ort built without the `ort-runtime` feature; cannot load models"
        );
        STATUS_FAILED
    }

    fn process(&mut self, _input: MatView<'_>, _output: MatViewMut<'_>) -> i32 {
        STATUS_FAILED
    }

    fn model_file_names(stem: &str) -> (String, String) {
        (format!("{stem}.onnx"), format!("{stem}.onnx.data"))
    }
}
