//! Python bindings for tilewise.
//!
//! # Example (Python)
//! ```python
//! import tilewise
//!
//! session = tilewise.Session(gpuid=0, tta_mode=False)
//! session.set_parameters(0, 4)
//! session.load("models/realesrgan-x4plus.onnx", "models/realesrgan-x4plus.onnx.data")
//!
//! src = tilewise.Image(rgb_bytes, width, height, 3)
//! dst = tilewise.Image(bytes(16 * len(rgb_bytes)), 4 * width, 4 * height, 3)
//! session.process(src, dst)
//! out = dst.get_data()
//!
//! tilewise.destroy_gpu_instance()
//! ```

use std::io::IsTerminal;
use std::path::PathBuf;

use pyo3::exceptions::PyException;
use pyo3::prelude::*;
use pyo3::types::PyBytes;

use tilewise_core::error::EngineError;
use tilewise_core::image::ImageBuffer;
use tilewise_session::{
    ModelSource, OrtSession, OrtUpscaler, UpscalerOptions, new_session, new_upscaler,
};

pyo3::create_exception!(tilewise, TilewiseError, PyException);

/// `TilewiseError(code, message)`.
fn to_py_err(err: EngineError) -> PyErr {
    TilewiseError::new_err((err.error_code(), err.to_string()))
}

// ============================================================================
// Image
// ============================================================================

/// Interleaved 8-bit pixels plus geometry.
#[pyclass(name = "Image")]
pub struct PyImage {
    inner: ImageBuffer,
}

#[pymethods]
impl PyImage {
    #[new]
    fn new(data: &[u8], width: u32, height: u32, channels: u32) -> Self {
        Self {
            inner: ImageBuffer::new(data.to_vec(), width, height, channels),
        }
    }

    fn get_data<'py>(&self, py: Python<'py>) -> Bound<'py, PyBytes> {
        PyBytes::new_bound(py, self.inner.data())
    }

    fn set_data(&mut self, data: &[u8]) {
        self.inner.set_data(data.to_vec());
    }

    #[getter]
    fn width(&self) -> u32 {
        self.inner.width()
    }

    #[getter]
    fn height(&self) -> u32 {
        self.inner.height()
    }

    #[getter]
    fn channels(&self) -> u32 {
        self.inner.channels()
    }

    fn __len__(&self) -> usize {
        self.inner.data().len()
    }

    fn __repr__(&self) -> String {
        format!(
            "Image(width={}, height={}, channels={}, bytes={})",
            self.inner.width(),
            self.inner.height(),
            self.inner.channels(),
            self.inner.data().len()
        )
    }
}

// ============================================================================
// Session
// ============================================================================

/// A path given as `str` or as raw UTF-8 `bytes`.
#[derive(FromPyObject)]
enum PathArg {
    Str(String),
    Bytes(Vec<u8>),
}

impl AsRef<[u8]> for PathArg {
    fn as_ref(&self) -> &[u8] {
        match self {
            Self::Str(s) => s.as_bytes(),
            Self::Bytes(b) => b,
        }
    }
}

/// Engine session bound to one GPU (`gpuid=-1` for the CPU).
#[pyclass(name = "Session")]
pub struct PySession {
    inner: OrtSession,
}

#[pymethods]
impl PySession {
    #[new]
    #[pyo3(signature = (gpuid=0, tta_mode=false))]
    fn new(gpuid: i32, tta_mode: bool) -> Self {
        Self {
            inner: new_session(gpuid, tta_mode),
        }
    }

    /// Fix tile size (0 = auto) and scale.
    fn set_parameters(&mut self, tilesize: u32, scale: u32) -> PyResult<()> {
        self.inner
            .configure(tilesize, scale)
            .map(|_| ())
            .map_err(to_py_err)
    }

    /// Load a model pair. Returns 0; raises `TilewiseError` on failure.
    fn load(&mut self, py: Python<'_>, param_path: PathArg, model_path: PathArg) -> PyResult<i32> {
        let session = &mut self.inner;
        py.allow_threads(|| session.load(&param_path, &model_path))
            .map(|()| 0)
            .map_err(to_py_err)
    }

    /// Upscale `input` into `output`. Returns 0; raises `TilewiseError` on
    /// failure. The GIL is released while the engine runs.
    fn process(
        &mut self,
        py: Python<'_>,
        input: PyRef<'_, PyImage>,
        mut output: PyRefMut<'_, PyImage>,
    ) -> PyResult<i32> {
        let session = &mut self.inner;
        let src = &input.inner;
        let dst = &mut output.inner;
        py.allow_threads(|| session.process(src, dst))
            .map(|()| 0)
            .map_err(to_py_err)
    }

    #[getter]
    fn state(&self) -> String {
        self.inner.state().to_string()
    }

    #[getter]
    fn tile_size(&self) -> Option<u32> {
        self.inner.config().map(|c| c.tile_size)
    }

    #[getter]
    fn scale(&self) -> Option<u32> {
        self.inner.config().map(|c| c.scale)
    }

    fn __repr__(&self) -> String {
        format!(
            "Session(gpuid={}, tta_mode={}, state={})",
            self.inner.gpu_id(),
            self.inner.tta_mode(),
            self.inner.state()
        )
    }
}

// ============================================================================
// Upscaler
// ============================================================================

/// Configured and loaded model with reusable byte buffers.
///
/// `model` picks a bundled preset (`0..=4`) inside `model_dir`, or `-1` for
/// an explicit `param_path`/`model_path` pair trained for `scale`.
#[pyclass(name = "Upscaler")]
pub struct PyUpscaler {
    inner: OrtUpscaler,
}

#[pymethods]
impl PyUpscaler {
    #[new]
    #[pyo3(signature = (
        gpuid=0,
        tta_mode=false,
        tilesize=0,
        model=0,
        model_dir=PathBuf::from("models"),
        param_path=None,
        model_path=None,
        scale=0
    ))]
    #[allow(clippy::too_many_arguments)]
    fn new(
        py: Python<'_>,
        gpuid: i32,
        tta_mode: bool,
        tilesize: u32,
        model: i32,
        model_dir: PathBuf,
        param_path: Option<PathBuf>,
        model_path: Option<PathBuf>,
        scale: u32,
    ) -> PyResult<Self> {
        let options = UpscalerOptions {
            gpu_id: gpuid,
            tta_mode,
            tile_size: tilesize,
            model: ModelSource::from_model_id(model, model_dir, param_path, model_path, scale)
                .map_err(to_py_err)?,
        };
        let inner = py
            .allow_threads(|| new_upscaler(options))
            .map_err(to_py_err)?;
        Ok(Self { inner })
    }

    /// Upscale interleaved 8-bit pixels, for example raw frames from ffmpeg.
    fn process_bytes<'py>(
        &mut self,
        py: Python<'py>,
        data: &[u8],
        width: u32,
        height: u32,
        channels: u32,
    ) -> PyResult<Bound<'py, PyBytes>> {
        let upscaler = &mut self.inner;
        let out = py
            .allow_threads(|| upscaler.process_bytes(data, width, height, channels))
            .map_err(to_py_err)?;
        Ok(PyBytes::new_bound(py, &out))
    }

    #[getter]
    fn scale(&self) -> u32 {
        self.inner.scale()
    }

    fn __repr__(&self) -> String {
        let session = self.inner.session();
        format!(
            "Upscaler(gpuid={}, tta_mode={}, scale={})",
            session.gpu_id(),
            session.tta_mode(),
            self.inner.scale()
        )
    }
}

// ============================================================================
// Functions
// ============================================================================

/// Number of usable GPUs (0 without a CUDA driver).
#[pyfunction]
fn get_gpu_count() -> i32 {
    tilewise_gpu::get_gpu_count()
}

/// Release the shared GPU pool. Call once, after every session is done.
#[pyfunction]
fn destroy_gpu_instance() {
    tilewise_gpu::destroy_gpu_instance()
}

fn init_tracing() {
    let ansi_enabled = std::env::var_os("NO_COLOR").is_none() && std::io::stderr().is_terminal();
    // A host application may already own the global subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_ansi(ansi_enabled)
        .try_init();
}

// ============================================================================
// Python Module
// ============================================================================

#[pymodule]
fn tilewise(m: &Bound<'_, PyModule>) -> PyResult<()> {
    init_tracing();

    m.add_class::<PyImage>()?;
    m.add_class::<PySession>()?;
    m.add_class::<PyUpscaler>()?;

    m.add_function(wrap_pyfunction!(get_gpu_count, m)?)?;
    m.add_function(wrap_pyfunction!(destroy_gpu_instance, m)?)?;

    m.add("TilewiseError", m.py().get_type_bound::<TilewiseError>())?;
    m.add("__version__", env!("CARGO_PKG_VERSION"))?;
    Ok(())
}
