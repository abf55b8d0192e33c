//! High-level upscaler: built-in model presets, option validation and
//! buffer management on top of [`EngineSession`].

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use tilewise_core::config::MIN_TILE_SIZE;
use tilewise_core::engine::InferenceEngine;
use tilewise_core::error::{EngineError, Result};
use tilewise_core::image::ImageBuffer;
use tilewise_core::probe::DeviceBudgetProbe;

use crate::session::EngineSession;

/// Bundled Real-ESRGAN models. Numeric ids `0..=4` are stable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelPreset {
    #[serde(rename = "realesr-animevideov3-x2")]
    AnimeVideoV3X2,
    #[serde(rename = "realesr-animevideov3-x3")]
    AnimeVideoV3X3,
    #[serde(rename = "realesr-animevideov3-x4")]
    AnimeVideoV3X4,
    #[serde(rename = "realesrgan-x4plus-anime")]
    X4PlusAnime,
    #[serde(rename = "realesrgan-x4plus")]
    X4Plus,
}

impl ModelPreset {
    pub const ALL: [Self; 5] = [
        Self::AnimeVideoV3X2,
        Self::AnimeVideoV3X3,
        Self::AnimeVideoV3X4,
        Self::X4PlusAnime,
        Self::X4Plus,
    ];

    /// Preset for a numeric model id (`0..=4`).
    pub fn from_id(id: i32) -> Option<Self> {
        usize::try_from(id).ok().and_then(|i| Self::ALL.get(i).copied())
    }

    pub fn id(self) -> i32 {
        self as i32
    }

    /// File stem shared by the model's files.
    pub fn stem(self) -> &'static str {
        match self {
            Self::AnimeVideoV3X2 => "realesr-animevideov3-x2",
            Self::AnimeVideoV3X3 => "realesr-animevideov3-x3",
            Self::AnimeVideoV3X4 => "realesr-animevideov3-x4",
            Self::X4PlusAnime => "realesrgan-x4plus-anime",
            Self::X4Plus => "realesrgan-x4plus",
        }
    }

    pub fn scale(self) -> u32 {
        match self {
            Self::AnimeVideoV3X2 => 2,
            Self::AnimeVideoV3X3 => 3,
            Self::AnimeVideoV3X4 | Self::X4PlusAnime | Self::X4Plus => 4,
        }
    }
}

/// Where the model comes from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelSource {
    /// A bundled model, resolved inside `dir` with the engine's naming.
    Preset { preset: ModelPreset, dir: PathBuf },
    /// Explicit files and the scale the model was trained for.
    Custom {
        param: PathBuf,
        model: PathBuf,
        scale: u32,
    },
}

impl ModelSource {
    /// Source for a numeric model id: `0..=4` picks a preset inside `dir`,
    /// `-1` takes the explicit pair and its scale.
    pub fn from_model_id(
        id: i32,
        dir: PathBuf,
        param: Option<PathBuf>,
        model: Option<PathBuf>,
        scale: u32,
    ) -> Result<Self> {
        if id == -1 {
            return match (param, model) {
                (Some(param), Some(model)) if scale != 0 => Ok(Self::Custom {
                    param,
                    model,
                    scale,
                }),
                _ => Err(EngineError::InvalidConfig(
                    "model -1 needs a param path, a model path and a scale".into(),
                )),
            };
        }
        let preset = ModelPreset::from_id(id).ok_or_else(|| {
            EngineError::InvalidConfig(format!("model id must be -1 or 0..=4, got {id}"))
        })?;
        Ok(Self::Preset { preset, dir })
    }

    pub fn scale(&self) -> u32 {
        match self {
            Self::Preset { preset, .. } => preset.scale(),
            Self::Custom { scale, .. } => *scale,
        }
    }

    /// `(param, model)` paths for engine `E`.
    pub fn resolve<E: InferenceEngine>(&self) -> (PathBuf, PathBuf) {
        match self {
            Self::Preset { preset, dir } => {
                let (param, model) = E::model_file_names(preset.stem());
                (dir.join(param), dir.join(model))
            }
            Self::Custom { param, model, .. } => (param.clone(), model.clone()),
        }
    }
}

/// Construction options for [`Upscaler`]. Omitted numeric fields default
/// to GPU 0, no TTA and auto tile size.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpscalerOptions {
    /// GPU ordinal, `-1` for the CPU.
    #[serde(default)]
    pub gpu_id: i32,
    #[serde(default)]
    pub tta_mode: bool,
    /// 0 for auto.
    #[serde(default)]
    pub tile_size: u32,
    pub model: ModelSource,
}

impl UpscalerOptions {
    pub fn preset(preset: ModelPreset, dir: impl AsRef<Path>) -> Self {
        Self {
            gpu_id: 0,
            tta_mode: false,
            tile_size: 0,
            model: ModelSource::Preset {
                preset,
                dir: dir.as_ref().to_path_buf(),
            },
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.gpu_id < -1 {
            return Err(EngineError::InvalidConfig(format!(
                "gpu_id must be >= -1, got {}",
                self.gpu_id
            )));
        }
        if self.tile_size != 0 && self.tile_size < MIN_TILE_SIZE {
            return Err(EngineError::InvalidConfig(format!(
                "tile_size must be 0 or >= {MIN_TILE_SIZE}, got {}",
                self.tile_size
            )));
        }
        if self.model.scale() == 0 {
            return Err(EngineError::InvalidConfig(
                "custom model scale must be >= 1".into(),
            ));
        }
        Ok(())
    }
}

/// A loaded session plus reusable byte buffers.
pub struct Upscaler<E, P> {
    session: EngineSession<E, P>,
    scale: u32,
    cached: Option<(ImageBuffer, ImageBuffer)>,
}

impl<E: InferenceEngine, P: DeviceBudgetProbe> Upscaler<E, P> {
    /// Validate `options`, then configure and load a session.
    pub fn new(options: UpscalerOptions, engine: E, probe: P) -> Result<Self> {
        options.validate()?;
        let scale = options.model.scale();
        let (param, model) = options.model.resolve::<E>();
        let mut session = EngineSession::with_parts(options.gpu_id, options.tta_mode, engine, probe);
        session.configure(options.tile_size, scale)?;
        session.load(path_bytes(&param)?, path_bytes(&model)?)?;
        Ok(Self {
            session,
            scale,
            cached: None,
        })
    }

    pub fn scale(&self) -> u32 {
        self.scale
    }

    pub fn session(&self) -> &EngineSession<E, P> {
        &self.session
    }

    /// Upscale into a freshly allocated image.
    pub fn process_image(&mut self, input: &ImageBuffer) -> Result<ImageBuffer> {
        let mut output = input.zeroed_scaled(self.scale)?;
        self.session.process(input, &mut output)?;
        Ok(output)
    }

    /// Upscale raw interleaved bytes, reusing the buffers of the previous
    /// call when the geometry is unchanged.
    pub fn process_bytes(
        &mut self,
        bytes: &[u8],
        width: u32,
        height: u32,
        channels: u32,
    ) -> Result<Vec<u8>> {
        let reuse = matches!(
            &self.cached,
            Some((input, _)) if (input.width(), input.height(), input.channels()) == (width, height, channels)
        );
        if !reuse {
            debug!(width, height, channels, "Allocating byte buffers");
            let input = ImageBuffer::zeroed(width, height, channels)?;
            let output = input.zeroed_scaled(self.scale)?;
            self.cached = Some((input, output));
        }
        let Some((input, output)) = self.cached.as_mut() else {
            return Err(EngineError::InvalidState {
                operation: "process_bytes",
                state: self.session.state(),
            });
        };
        input.copy_from(bytes)?;
        self.session.process(input, output)?;
        Ok(output.data().to_vec())
    }
}

fn path_bytes(path: &Path) -> Result<&[u8]> {
    path.to_str()
        .map(str::as_bytes)
        .ok_or(EngineError::InvalidPathEncoding { valid_up_to: 0 })
}
