#![doc = include_str!("../README.md")]

pub mod session;
pub mod upscaler;

pub use session::EngineSession;
pub use upscaler::{ModelPreset, ModelSource, Upscaler, UpscalerOptions};

use tilewise_core::image::ImageBuffer;
use tilewise_gpu::SharedPoolProbe;
use tilewise_ort::OrtEngine;

/// Session over the ONNX Runtime engine and the shared GPU pool.
pub type OrtSession = EngineSession<OrtEngine, SharedPoolProbe>;

/// New, unconfigured session on `gpu_id` (negative for the CPU).
pub fn new_session(gpu_id: i32, tta_mode: bool) -> OrtSession {
    EngineSession::with_parts(gpu_id, tta_mode, OrtEngine::new(gpu_id), SharedPoolProbe)
}

/// Upscaler over the ONNX Runtime engine and the shared GPU pool.
pub type OrtUpscaler = Upscaler<OrtEngine, SharedPoolProbe>;

/// Validate `options`, then configure and load an [`OrtUpscaler`].
pub fn new_upscaler(options: UpscalerOptions) -> tilewise_core::Result<OrtUpscaler> {
    let engine = OrtEngine::new(options.gpu_id);
    Upscaler::new(options, engine, SharedPoolProbe)
}

/// Wrap caller bytes as an image. Shape is checked when the image is used.
pub fn new_image(data: Vec<u8>, width: u32, height: u32, channels: u32) -> ImageBuffer {
    ImageBuffer::new(data, width, height, channels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tilewise_core::config::SessionState;

    #[test]
    fn new_session_starts_uninitialized() {
        let s = new_session(-1, true);
        assert_eq!(s.state(), SessionState::Uninitialized);
        assert_eq!(s.gpu_id(), -1);
        assert!(s.tta_mode());
        assert!(s.config().is_none());
    }

    #[test]
    fn cpu_session_configures_without_touching_the_pool() {
        let mut s = new_session(-1, false);
        let cfg = s.configure(0, 4).expect("configure");
        assert_eq!(cfg.tile_size, 400);
        assert_eq!(cfg.prepadding, 10);
    }
}
