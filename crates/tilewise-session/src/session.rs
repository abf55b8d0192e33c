//! Engine session: one configured engine bound to one device.
//!
//! # State machine
//!
//! ```text
//!                 configure               load                process
//! Uninitialized ───────────▶ Configured ──────▶ Loaded ───────────▶ Ready
//!        ▲                      ▲  ▲                │                 │
//!        └── any state ─────────┘  └── configure ───┴─────────────────┘
//! ```
//!
//! `configure` moves any state to `Configured`; a reconfigured session
//! needs a fresh `load` before it processes again.
//!
//! # Load failure
//!
//! A failed `load` (unreadable file or non-zero engine status) poisons the
//! session: it stays `Configured`, every later `load` and `process` fails
//! with [`EngineError::ModelLoad`], and the only way forward is a new
//! session. Path-encoding errors do not poison.
//!
//! # Buffers
//!
//! `process` checks both buffers' shape and the output geometry before the
//! engine runs. A rejected call leaves the output untouched.

use std::path::PathBuf;

use tracing::{debug, info};

use tilewise_core::config::{EngineSessionConfig, MIN_TILE_SIZE, PREPADDING, SessionState};
use tilewise_core::engine::{InferenceEngine, ModelFiles};
use tilewise_core::error::{BufferRole, EngineError, Result};
use tilewise_core::image::ImageBuffer;
use tilewise_core::path::{ModelPath, PathEncoding};
use tilewise_core::probe::DeviceBudgetProbe;
use tilewise_core::tiling::TilePolicy;

/// A super-resolution engine configured for one device.
pub struct EngineSession<E, P> {
    gpu_id: i32,
    tta_mode: bool,
    engine: E,
    probe: P,
    policy: TilePolicy,
    path_encoding: PathEncoding,
    config: Option<EngineSessionConfig>,
    state: SessionState,
    load_failure: Option<String>,
}

impl<E: InferenceEngine, P: DeviceBudgetProbe> EngineSession<E, P> {
    /// Session over an arbitrary engine and probe. Starts `Uninitialized`
    /// with the default tile policy and the platform's path encoding.
    pub fn with_parts(gpu_id: i32, tta_mode: bool, engine: E, probe: P) -> Self {
        Self {
            gpu_id,
            tta_mode,
            engine,
            probe,
            policy: TilePolicy::default(),
            path_encoding: PathEncoding::native(),
            config: None,
            state: SessionState::Uninitialized,
            load_failure: None,
        }
    }

    /// Replace the tile policy used by auto tile sizing.
    pub fn with_policy(mut self, policy: TilePolicy) -> Result<Self> {
        policy.validate()?;
        self.policy = policy;
        Ok(self)
    }

    /// Override the path encoding capability flag.
    pub fn with_path_encoding(mut self, encoding: PathEncoding) -> Self {
        self.path_encoding = encoding;
        self
    }

    pub fn gpu_id(&self) -> i32 {
        self.gpu_id
    }

    pub fn tta_mode(&self) -> bool {
        self.tta_mode
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Effective configuration, once configured.
    pub fn config(&self) -> Option<&EngineSessionConfig> {
        self.config.as_ref()
    }

    pub fn policy(&self) -> &TilePolicy {
        &self.policy
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Whether a failed `load` has made this session unusable.
    pub fn is_poisoned(&self) -> bool {
        self.load_failure.is_some()
    }

    fn poisoned_error(&self) -> Option<EngineError> {
        self.load_failure
            .as_ref()
            .map(|reason| EngineError::ModelLoad(format!("session unusable after failed load: {reason}")))
    }

    fn check_device(&self) -> Result<()> {
        if self.gpu_id >= 0 {
            self.probe.check_device(self.gpu_id)?;
        }
        Ok(())
    }

    /// Fix tile size and scale. `tile_size_hint == 0` picks the tile from
    /// the device's current heap budget (or the CPU tile for `gpu_id < 0`,
    /// without probing).
    ///
    /// On error the session is unchanged.
    pub fn configure(&mut self, tile_size_hint: u32, scale: u32) -> Result<&EngineSessionConfig> {
        if scale == 0 {
            return Err(EngineError::InvalidConfig("scale must be >= 1".into()));
        }
        if tile_size_hint != 0 && tile_size_hint < MIN_TILE_SIZE {
            return Err(EngineError::InvalidConfig(format!(
                "tile size must be 0 (auto) or >= {MIN_TILE_SIZE}, got {tile_size_hint}"
            )));
        }

        let tile_size = if tile_size_hint != 0 {
            tile_size_hint
        } else if self.gpu_id < 0 {
            self.policy.cpu_tile_size
        } else {
            let budget = self.probe.probe(self.gpu_id)?;
            let tile = self.policy.decide(self.gpu_id, budget);
            debug!(gpu_id = self.gpu_id, budget = %budget, tile, "Auto tile size");
            tile
        };

        let config = EngineSessionConfig {
            gpu_id: self.gpu_id,
            tta_mode: self.tta_mode,
            tile_size,
            scale,
            prepadding: PREPADDING,
        };
        info!(
            gpu_id = config.gpu_id,
            tta = config.tta_mode,
            tile_size = config.tile_size,
            scale = config.scale,
            prepadding = config.prepadding,
            "Session configured"
        );
        self.engine.configure(&config);
        self.state = SessionState::Configured;
        Ok(self.config.insert(config))
    }

    /// Alias of [`configure`](Self::configure).
    pub fn set_parameters(&mut self, tile_size: u32, scale: u32) -> Result<&EngineSessionConfig> {
        self.configure(tile_size, scale)
    }

    fn resolve_path(&self, bytes: &[u8]) -> Result<PathBuf> {
        ModelPath::from_utf8(bytes, self.path_encoding)?.to_path_buf()
    }

    fn fail_load(&mut self, reason: String) -> EngineError {
        tracing::error!(gpu_id = self.gpu_id, %reason, "Model load failed");
        self.load_failure = Some(reason.clone());
        EngineError::ModelLoad(reason)
    }

    /// Load the model pair. Paths are UTF-8 bytes (any `&str` works);
    /// they are transcoded to the native encoding first.
    pub fn load(&mut self, param_path: impl AsRef<[u8]>, model_path: impl AsRef<[u8]>) -> Result<()> {
        if let Some(err) = self.poisoned_error() {
            return Err(err);
        }
        if self.state != SessionState::Configured {
            return Err(EngineError::InvalidState {
                operation: "load",
                state: self.state,
            });
        }
        let param = self.resolve_path(param_path.as_ref())?;
        let model = self.resolve_path(model_path.as_ref())?;
        self.check_device()?;

        for path in [&param, &model] {
            if let Err(e) = std::fs::File::open(path) {
                return Err(self.fail_load(format!("{}: {e}", path.display())));
            }
        }

        let files = ModelFiles { param, model };
        let status = self.engine.load(&files);
        if status != 0 {
            return Err(self.fail_load(format!(
                "engine returned status {status} for {}",
                files.param.display()
            )));
        }
        info!(
            gpu_id = self.gpu_id,
            param = %files.param.display(),
            model = %files.model.display(),
            "Model loaded"
        );
        self.state = SessionState::Loaded;
        Ok(())
    }

    fn check_geometry(&self, input: &ImageBuffer, output: &ImageBuffer, scale: u32) -> Result<()> {
        let want_w = input.width().checked_mul(scale);
        let want_h = input.height().checked_mul(scale);
        if want_w != Some(output.width())
            || want_h != Some(output.height())
            || input.channels() != output.channels()
        {
            return Err(EngineError::GeometryMismatch(format!(
                "input {}x{}x{} at scale {scale} needs output {}x{}x{}, got {}x{}x{}",
                input.width(),
                input.height(),
                input.channels(),
                input.width() as u64 * scale as u64,
                input.height() as u64 * scale as u64,
                input.channels(),
                output.width(),
                output.height(),
                output.channels(),
            )));
        }
        Ok(())
    }

    /// Upscale `input` into the caller's pre-allocated `output`.
    pub fn process(&mut self, input: &ImageBuffer, output: &mut ImageBuffer) -> Result<()> {
        if let Some(err) = self.poisoned_error() {
            return Err(err);
        }
        let scale = match (&self.config, self.state.accepts_process()) {
            (Some(config), true) => config.scale,
            _ => {
                return Err(EngineError::InvalidState {
                    operation: "process",
                    state: self.state,
                });
            }
        };
        input.validate(BufferRole::Input)?;
        output.validate(BufferRole::Output)?;
        self.check_geometry(input, output, scale)?;
        self.check_device()?;

        debug!(
            width = input.width(),
            height = input.height(),
            channels = input.channels(),
            scale,
            "Processing"
        );
        let status = self.engine.process(input.as_mat()?, output.as_mat_mut()?);
        if status != 0 {
            return Err(EngineError::Inference { status });
        }
        self.state = SessionState::Ready;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tilewise_core::image::{MatView, MatViewMut};
    use tilewise_core::probe::HeapBudget;

    struct NullEngine;

    impl InferenceEngine for NullEngine {
        fn configure(&mut self, _: &EngineSessionConfig) {}
        fn load(&mut self, _: &ModelFiles) -> i32 {
            0
        }
        fn process(&mut self, _: MatView<'_>, _: MatViewMut<'_>) -> i32 {
            0
        }
        fn model_file_names(stem: &str) -> (String, String) {
            (stem.into(), stem.into())
        }
    }

    #[derive(Clone, Default)]
    struct CountingProbe {
        mib: u32,
        calls: Arc<AtomicUsize>,
    }

    impl DeviceBudgetProbe for CountingProbe {
        fn probe(&self, _: i32) -> Result<HeapBudget> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(HeapBudget(self.mib))
        }
        fn check_device(&self, _: i32) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn invalid_parameters_leave_state_untouched() {
        let mut s = EngineSession::with_parts(0, false, NullEngine, CountingProbe::default());
        assert!(matches!(s.configure(0, 0), Err(EngineError::InvalidConfig(_))));
        assert!(matches!(s.configure(16, 2), Err(EngineError::InvalidConfig(_))));
        assert_eq!(s.state(), SessionState::Uninitialized);
        assert!(s.config().is_none());
    }

    #[test]
    fn explicit_tile_skips_probe() {
        let probe = CountingProbe::default();
        let calls = Arc::clone(&probe.calls);
        let mut s = EngineSession::with_parts(0, false, NullEngine, probe);
        assert_eq!(s.set_parameters(128, 2).expect("configure").tile_size, 128);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn replacement_policy_drives_auto_tile() {
        let policy = TilePolicy::from_json_str(
            r#"{ "tiers": [{ "min_budget_mib": 4000, "tile_size": 512 }], "floor_tile_size": 96 }"#,
        )
        .expect("policy");
        let probe = CountingProbe {
            mib: 5000,
            ..Default::default()
        };
        let mut s = EngineSession::with_parts(1, true, NullEngine, probe)
            .with_policy(policy)
            .expect("valid");
        let cfg = s.configure(0, 4).expect("configure");
        assert_eq!(cfg.tile_size, 512);
        assert!(cfg.tta_mode);
    }

    #[test]
    fn load_outside_configured_is_invalid_state() {
        let mut s = EngineSession::with_parts(-1, false, NullEngine, CountingProbe::default());
        let err = s.load("a.onnx", "a.onnx").expect_err("not configured");
        assert!(matches!(
            err,
            EngineError::InvalidState {
                operation: "load",
                state: SessionState::Uninitialized
            }
        ));
    }

    #[test]
    fn malformed_path_does_not_poison() {
        let mut s = EngineSession::with_parts(-1, false, NullEngine, CountingProbe::default());
        s.configure(0, 2).expect("configure");
        let err = s.load(b"bad\xc3(".as_slice(), "m").expect_err("bad utf-8");
        assert_eq!(err.error_code(), 200);
        assert!(err.is_recoverable());
        assert!(!s.is_poisoned());
        assert_eq!(s.state(), SessionState::Configured);

        let dir = tempfile::tempdir().expect("tempdir");
        let model = dir.path().join("m.onnx");
        std::fs::write(&model, b"graph").expect("write");
        let path = model.to_str().expect("utf-8 temp path");
        s.load(path, path).expect("retry with a valid path");
        assert_eq!(s.state(), SessionState::Loaded);
    }
}
