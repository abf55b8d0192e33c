//! Runs against the real process-wide pool. Each file under `tests/` is its
//! own process, so tearing the pool down here affects nothing else.

use tilewise_core::error::EngineError;
use tilewise_core::probe::DeviceBudgetProbe;
use tilewise_gpu::{GpuInstanceRegistry, SharedPoolProbe, destroy_gpu_instance, get_gpu_count};

#[test]
fn shared_pool_count_then_teardown_is_terminal() {
    let count = get_gpu_count();
    assert!(count >= 0);
    assert!(!GpuInstanceRegistry::shared().is_destroyed());

    destroy_gpu_instance();
    destroy_gpu_instance();

    assert!(GpuInstanceRegistry::shared().is_destroyed());
    assert_eq!(get_gpu_count(), 0);
    let err = SharedPoolProbe.probe(0).expect_err("pool destroyed");
    assert!(matches!(err, EngineError::DeviceUnavailable { gpu_id: 0, .. }));
    assert!(SharedPoolProbe.check_device(0).is_err());
}
