//! ONNX Runtime inference engine.
//!
//! # Model files
//!
//! `param` is the ONNX graph. `model` is the weights file the graph
//! references as external data; ORT resolves it relative to the graph's
//! directory, so both must sit side by side. A self-contained graph may pass
//! the same path twice. `load` fails when the graph would read its weights
//! from any other file.
//!
//! # Execution provider policy
//!
//! `gpu_id >= 0` registers the CUDA EP on that device with
//! `error_on_failure`, so a broken CUDA install fails `load` instead of
//! silently running on the CPU. Negative ids use the default CPU EP.
//!
//! # Status codes
//!
//! `0` on success. Every failure is logged and reported as `-1`.

use std::path::Path;
use std::sync::OnceLock;

use ndarray::{Array4, Ix4};
use ort::environment::Environment;
use ort::ep::CUDA;
use ort::session::Session;
use ort::value::Tensor;
use tracing::{debug, error, info};

use tilewise_core::config::EngineSessionConfig;
use tilewise_core::engine::{InferenceEngine, ModelFiles};
use tilewise_core::image::{MatView, MatViewMut};

use crate::external_data::{self, WeightsMismatch};
use crate::tiles::{self, TileError};

/// Status reported for any engine-side failure.
pub const STATUS_FAILED: i32 = -1;

#[derive(Debug, thiserror::Error)]
enum LoadError {
    #[error("{path}: {source}")]
    Unreadable {
        path: String,
        source: std::io::Error,
    },
    #[error("{0} is not a regular file")]
    NotAFile(String),
    #[error(transparent)]
    Weights(#[from] WeightsMismatch),
    #[error("ONNX Runtime: {0}")]
    Runtime(String),
    #[error("model has no inputs or outputs")]
    NoIo,
}

fn runtime_err(e: impl std::fmt::Display) -> LoadError {
    LoadError::Runtime(e.to_string())
}

fn model_err(e: impl std::fmt::Display) -> TileError {
    TileError::Model(e.to_string())
}

/// The process-wide ORT environment. ORT allows one per process.
fn environment() -> Result<&'static Environment, LoadError> {
    static ENV: OnceLock<Result<Environment, String>> = OnceLock::new();
    ENV.get_or_init(|| {
        ort::init()
            .with_name("tilewise")
            .build()
            .map_err(|e| e.to_string())
    })
    .as_ref()
    .map_err(|e| LoadError::Runtime(e.clone()))
}

struct LoadedModel {
    session: Session,
    input_name: String,
    output_name: String,
}

/// [`InferenceEngine`] running an ONNX super-resolution graph through ORT.
pub struct OrtEngine {
    gpu_id: i32,
    config: Option<EngineSessionConfig>,
    model: Option<LoadedModel>,
}

impl OrtEngine {
    pub fn new(gpu_id: i32) -> Self {
        Self {
            gpu_id,
            config: None,
            model: None,
        }
    }

    pub fn gpu_id(&self) -> i32 {
        self.gpu_id
    }

    pub fn is_loaded(&self) -> bool {
        self.model.is_some()
    }

    fn check_file(path: &Path) -> Result<(), LoadError> {
        let meta = std::fs::metadata(path).map_err(|source| LoadError::Unreadable {
            path: path.display().to_string(),
            source,
        })?;
        if !meta.is_file() {
            return Err(LoadError::NotAFile(path.display().to_string()));
        }
        std::fs::File::open(path).map_err(|source| LoadError::Unreadable {
            path: path.display().to_string(),
            source,
        })?;
        Ok(())
    }

    fn build_session(&self, graph: &Path) -> Result<Session, LoadError> {
        let builder = Session::builder(environment()?).map_err(runtime_err)?;
        let mut builder = if self.gpu_id >= 0 {
            let cuda_ep = CUDA::default().with_device_id(self.gpu_id);
            builder
                .with_execution_providers([cuda_ep.build().error_on_failure()])
                .map_err(runtime_err)?
        } else {
            builder
        };
        builder
            .commit_from_file(graph)
            .map_err(runtime_err)
    }

    fn try_load(&self, files: &ModelFiles) -> Result<LoadedModel, LoadError> {
        Self::check_file(&files.param)?;
        Self::check_file(&files.model)?;
        external_data::check_weights_file(&files.param, &files.model)?;

        let session = self.build_session(&files.param)?;
        let input_name = session
            .inputs()
            .first()
            .map(|i| i.name().to_string())
            .ok_or(LoadError::NoIo)?;
        let output_name = session
            .outputs()
            .first()
            .map(|o| o.name().to_string())
            .ok_or(LoadError::NoIo)?;
        Ok(LoadedModel {
            session,
            input_name,
            output_name,
        })
    }
}

fn run_model(model: &mut LoadedModel, tile: Array4<f32>) -> Result<Array4<f32>, TileError> {
    let input = Tensor::from_array(tile).map_err(model_err)?;
    let outputs = model
        .session
        .run(ort::inputs![model.input_name.as_str() => &input])
        .map_err(model_err)?;
    let view = outputs[model.output_name.as_str()]
        .try_extract_array::<f32>()
        .map_err(model_err)?;
    view.to_owned()
        .into_dimensionality::<Ix4>()
        .map_err(|e| TileError::Model(format!("model output is not 4-D: {e}")))
}

impl InferenceEngine for OrtEngine {
    fn configure(&mut self, config: &EngineSessionConfig) {
        self.config = Some(config.clone());
    }

    fn load(&mut self, files: &ModelFiles) -> i32 {
        match self.try_load(files) {
            Ok(model) => {
                info!(
                    gpu_id = self.gpu_id,
                    graph = %files.param.display(),
                    input = %model.input_name,
                    output = %model.output_name,
                    provider = if self.gpu_id >= 0 { "CUDAExecutionProvider" } else { "CPUExecutionProvider" },
                    "Model loaded"
                );
                self.model = Some(model);
                0
            }
            Err(e) => {
                error!(gpu_id = self.gpu_id, error = %e, "Model load failed");
                STATUS_FAILED
            }
        }
    }

    fn process(&mut self, input: MatView<'_>, output: MatViewMut<'_>) -> i32 {
        let (Some(config), Some(model)) = (self.config.as_ref(), self.model.as_mut()) else {
            error!("process called before configure/load");
            return STATUS_FAILED;
        };
        debug!(
            width = input.width(),
            height = input.height(),
            channels = input.elem_size(),
            tile_size = config.tile_size,
            "Processing image"
        );
        let result = tiles::upscale_tiled(
            input,
            output,
            config.tile_size as usize,
            config.prepadding as usize,
            config.scale as usize,
            config.tta_mode,
            |tile| run_model(model, tile),
        );
        match result {
            Ok(()) => 0,
            Err(e) => {
                error!(gpu_id = self.gpu_id, error = %e, "Inference failed");
                STATUS_FAILED
            }
        }
    }

    fn model_file_names(stem: &str) -> (String, String) {
        (format!("{stem}.onnx"), format!("{stem}.onnx.data"))
    }
}
