use tilewise_core::config::{EngineSessionConfig, PREPADDING};
use tilewise_core::engine::{InferenceEngine, ModelFiles};
use tilewise_core::image::ImageBuffer;
use tilewise_ort::{OrtEngine, STATUS_FAILED};

fn config(gpu_id: i32, scale: u32) -> EngineSessionConfig {
    EngineSessionConfig {
        gpu_id,
        tta_mode: false,
        tile_size: 32,
        scale,
        prepadding: PREPADDING,
    }
}

#[test]
fn missing_files_fail_load() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut engine = OrtEngine::new(-1);
    engine.configure(&config(-1, 4));
    let files = ModelFiles {
        param: dir.path().join("absent.onnx"),
        model: dir.path().join("absent.onnx.data"),
    };
    assert_eq!(engine.load(&files), STATUS_FAILED);
    assert!(!engine.is_loaded());
}

#[test]
fn directory_is_not_a_model() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut engine = OrtEngine::new(-1);
    let files = ModelFiles {
        param: dir.path().to_path_buf(),
        model: dir.path().to_path_buf(),
    };
    assert_eq!(engine.load(&files), STATUS_FAILED);
}

#[test]
fn weights_the_graph_does_not_reference_fail_load() {
    let dir = tempfile::tempdir().expect("tempdir");
    let graph = dir.path().join("net.onnx");
    let weights = dir.path().join("finetuned.bin");
    let mut bytes = b"\x0a\x08location\x12\x0dnet.onnx.data".to_vec();
    bytes.extend_from_slice(b"\x1a\x00");
    std::fs::write(&graph, bytes).expect("write graph");
    std::fs::write(dir.path().join("net.onnx.data"), [0u8; 8]).expect("write");
    std::fs::write(&weights, [1u8; 8]).expect("write");

    let mut engine = OrtEngine::new(-1);
    engine.configure(&config(-1, 4));
    let files = ModelFiles {
        param: graph,
        model: weights,
    };
    assert_eq!(engine.load(&files), STATUS_FAILED);
    assert!(!engine.is_loaded());
}

#[test]
fn process_before_load_fails() {
    let mut engine = OrtEngine::new(-1);
    engine.configure(&config(-1, 2));
    let input = ImageBuffer::zeroed(4, 4, 3).expect("alloc");
    let mut output = input.zeroed_scaled(2).expect("alloc");
    let status = engine.process(
        input.as_mat().expect("in"),
        output.as_mat_mut().expect("out"),
    );
    assert_eq!(status, STATUS_FAILED);
    assert!(output.data().iter().all(|&b| b == 0));
}

#[test]
fn file_names_follow_onnx_convention() {
    let (param, model) = OrtEngine::model_file_names("realesrgan-x4plus");
    assert_eq!(param, "realesrgan-x4plus.onnx");
    assert_eq!(model, "realesrgan-x4plus.onnx.data");
}

#[cfg(feature = "ort-runtime")]
#[test]
#[ignore = "requires an ONNX super-resolution model on disk"]
fn cpu_upscale_smoke() {
    use std::env;
    use std::path::PathBuf;

    let graph = PathBuf::from(
        env::var("TILEWISE_TEST_ONNX_MODEL").expect("set TILEWISE_TEST_ONNX_MODEL"),
    );
    let weights = env::var("TILEWISE_TEST_ONNX_WEIGHTS")
        .map(PathBuf::from)
        .unwrap_or_else(|_| graph.clone());
    let scale: u32 = env::var("TILEWISE_TEST_SCALE")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(4);

    let mut engine = OrtEngine::new(-1);
    engine.configure(&config(-1, scale));
    let files = ModelFiles {
        param: graph,
        model: weights,
    };
    assert_eq!(engine.load(&files), 0);

    let data = (0..48 * 40 * 3).map(|i| (i % 256) as u8).collect();
    let input = ImageBuffer::new(data, 48, 40, 3);
    let mut output = input.zeroed_scaled(scale).expect("alloc");
    let status = engine.process(
        input.as_mat().expect("in"),
        output.as_mat_mut().expect("out"),
    );
    assert_eq!(status, 0);
    assert!(output.data().iter().any(|&b| b != 0));
}
