//! Process-wide GPU instance pool.
//!
//! # Lifecycle
//!
//! ```text
//! Uninit ──(count / probe / check)──▶ Live ──destroy_shared_instance──▶ Destroyed
//! ```
//!
//! The pool initializes on first use. Each device's primary context is
//! retained the first time it is touched and released at teardown.
//! `Destroyed` is terminal: the count reads 0, device access fails with
//! `DeviceUnavailable`, and a second teardown only logs a warning.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, OnceLock};

use tracing::{debug, info, warn};

use tilewise_core::error::{EngineError, Result};
use tilewise_core::probe::{DeviceBudgetProbe, HeapBudget};

use crate::sys::{self, CUcontext, CUdevice, DriverError};

/// A device bound by the pool: ordinal plus its retained primary context.
#[derive(Debug)]
pub struct DeviceHandle {
    pub device: CUdevice,
    pub context: CUcontext,
}

// SAFETY: a primary context is a process-wide driver object usable from any
// thread; the handle is only dereferenced by the driver under the pool lock.
unsafe impl Send for DeviceHandle {}

/// Driver operations the pool needs. Implemented by the CUDA driver and by
/// test fakes.
pub trait DeviceDriver: Send + Sync {
    fn device_count(&self) -> std::result::Result<i32, DriverError>;
    fn retain(&self, ordinal: i32) -> std::result::Result<DeviceHandle, DriverError>;
    /// Free bytes on the device.
    fn free_memory(&self, handle: &DeviceHandle) -> std::result::Result<u64, DriverError>;
    fn release(&self, handle: DeviceHandle) -> std::result::Result<(), DriverError>;
}

/// [`DeviceDriver`] over the dynamically loaded CUDA driver API.
#[derive(Debug, Default)]
pub struct CudaDriver;

impl DeviceDriver for CudaDriver {
    fn device_count(&self) -> std::result::Result<i32, DriverError> {
        sys::driver_api()?.device_count()
    }

    fn retain(&self, ordinal: i32) -> std::result::Result<DeviceHandle, DriverError> {
        let api = sys::driver_api()?;
        let device = api.device(ordinal)?;
        let context = api.retain_primary_context(device)?;
        Ok(DeviceHandle { device, context })
    }

    fn free_memory(&self, handle: &DeviceHandle) -> std::result::Result<u64, DriverError> {
        let (free, _total) = sys::driver_api()?.mem_get_info(handle.context)?;
        Ok(free as u64)
    }

    fn release(&self, handle: DeviceHandle) -> std::result::Result<(), DriverError> {
        sys::driver_api()?.release_primary_context(handle.device)
    }
}

struct LivePool {
    count: i32,
    devices: HashMap<i32, DeviceHandle>,
}

enum PoolState {
    Uninit,
    Live(LivePool),
    Destroyed,
}

/// Enumeration and teardown of the GPUs this process uses.
pub struct GpuInstanceRegistry {
    driver: Box<dyn DeviceDriver>,
    state: Mutex<PoolState>,
}

static SHARED: OnceLock<GpuInstanceRegistry> = OnceLock::new();

impl GpuInstanceRegistry {
    /// Pool over an arbitrary driver. Nothing is touched until first use.
    pub fn with_driver(driver: Box<dyn DeviceDriver>) -> Self {
        Self {
            driver,
            state: Mutex::new(PoolState::Uninit),
        }
    }

    /// The process-wide pool over the CUDA driver.
    pub fn shared() -> &'static Self {
        SHARED.get_or_init(|| Self::with_driver(Box::new(CudaDriver)))
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ensure_live<'a>(&self, state: &'a mut PoolState) -> Option<&'a mut LivePool> {
        if matches!(state, PoolState::Uninit) {
            let count = match self.driver.device_count() {
                Ok(n) => n,
                Err(e) => {
                    debug!(error = %e, "No CUDA devices available");
                    0
                }
            };
            info!(devices = count, "GPU instance pool initialized");
            *state = PoolState::Live(LivePool {
                count,
                devices: HashMap::new(),
            });
        }
        match state {
            PoolState::Live(pool) => Some(pool),
            _ => None,
        }
    }

    /// Number of usable GPUs. 0 without a driver, without devices, or after
    /// teardown.
    pub fn count(&self) -> i32 {
        let mut state = self.lock();
        self.ensure_live(&mut state).map_or(0, |pool| pool.count)
    }

    /// Whether [`destroy_shared_instance`](Self::destroy_shared_instance)
    /// has run.
    pub fn is_destroyed(&self) -> bool {
        matches!(*self.lock(), PoolState::Destroyed)
    }

    /// Release every retained device. Later calls are logged no-ops.
    pub fn destroy_shared_instance(&self) {
        let mut state = self.lock();
        match std::mem::replace(&mut *state, PoolState::Destroyed) {
            PoolState::Destroyed => {
                warn!("GPU instance pool already destroyed; ignoring repeated teardown");
            }
            PoolState::Uninit => info!("GPU instance pool destroyed before first use"),
            PoolState::Live(pool) => {
                let released = pool.devices.len();
                for (gpu_id, handle) in pool.devices {
                    if let Err(e) = self.driver.release(handle) {
                        warn!(gpu_id, error = %e, "Failed to release primary context");
                    }
                }
                info!(released, "GPU instance pool destroyed");
            }
        }
    }

    fn with_device<R>(
        &self,
        gpu_id: i32,
        f: impl FnOnce(&dyn DeviceDriver, &DeviceHandle) -> Result<R>,
    ) -> Result<R> {
        let unavailable = |reason: String| EngineError::DeviceUnavailable { gpu_id, reason };
        if gpu_id < 0 {
            return Err(unavailable("negative ids select the CPU".into()));
        }
        let mut state = self.lock();
        let pool = self
            .ensure_live(&mut state)
            .ok_or_else(|| unavailable("GPU instance pool has been destroyed".into()))?;
        if gpu_id >= pool.count {
            return Err(unavailable(format!(
                "only {} device(s) present",
                pool.count
            )));
        }
        if !pool.devices.contains_key(&gpu_id) {
            let handle = self
                .driver
                .retain(gpu_id)
                .map_err(|e| unavailable(e.to_string()))?;
            debug!(gpu_id, "Retained primary context");
            pool.devices.insert(gpu_id, handle);
        }
        match pool.devices.get(&gpu_id) {
            Some(handle) => f(self.driver.as_ref(), handle),
            None => Err(unavailable("device handle missing".into())),
        }
    }

    /// Fresh heap budget of `gpu_id`. Never cached.
    pub fn heap_budget(&self, gpu_id: i32) -> Result<HeapBudget> {
        self.with_device(gpu_id, |driver, handle| {
            let free = driver
                .free_memory(handle)
                .map_err(|e| EngineError::DeviceUnavailable {
                    gpu_id,
                    reason: e.to_string(),
                })?;
            let budget = HeapBudget::from_bytes(free);
            debug!(gpu_id, budget_mib = budget.mib(), "Probed heap budget");
            Ok(budget)
        })
    }

    /// Bind `gpu_id` without reading memory.
    pub fn check_device(&self, gpu_id: i32) -> Result<()> {
        self.with_device(gpu_id, |_, _| Ok(()))
    }
}

impl DeviceBudgetProbe for GpuInstanceRegistry {
    fn probe(&self, gpu_id: i32) -> Result<HeapBudget> {
        self.heap_budget(gpu_id)
    }

    fn check_device(&self, gpu_id: i32) -> Result<()> {
        GpuInstanceRegistry::check_device(self, gpu_id)
    }
}

/// [`DeviceBudgetProbe`] backed by [`GpuInstanceRegistry::shared`].
#[derive(Clone, Copy, Debug, Default)]
pub struct SharedPoolProbe;

impl DeviceBudgetProbe for SharedPoolProbe {
    fn probe(&self, gpu_id: i32) -> Result<HeapBudget> {
        GpuInstanceRegistry::shared().heap_budget(gpu_id)
    }

    fn check_device(&self, gpu_id: i32) -> Result<()> {
        GpuInstanceRegistry::shared().check_device(gpu_id)
    }
}

/// Number of GPUs visible to the shared pool.
pub fn get_gpu_count() -> i32 {
    GpuInstanceRegistry::shared().count()
}

/// Tear down the shared pool. Call once, after every session is done.
pub fn destroy_gpu_instance() {
    GpuInstanceRegistry::shared().destroy_shared_instance()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const MIB: u64 = 1024 * 1024;

    #[derive(Default)]
    struct Calls {
        count: AtomicUsize,
        retain: AtomicUsize,
        free: AtomicUsize,
        release: AtomicUsize,
    }

    struct FakeDriver {
        devices: std::result::Result<i32, ()>,
        free_mib: u64,
        calls: Arc<Calls>,
    }

    impl DeviceDriver for FakeDriver {
        fn device_count(&self) -> std::result::Result<i32, DriverError> {
            self.calls.count.fetch_add(1, Ordering::SeqCst);
            self.devices
                .map_err(|()| DriverError::Load("libcuda.so.1: not found".into()))
        }

        fn retain(&self, ordinal: i32) -> std::result::Result<DeviceHandle, DriverError> {
            self.calls.retain.fetch_add(1, Ordering::SeqCst);
            Ok(DeviceHandle {
                device: ordinal,
                context: std::ptr::null_mut(),
            })
        }

        fn free_memory(&self, _: &DeviceHandle) -> std::result::Result<u64, DriverError> {
            self.calls.free.fetch_add(1, Ordering::SeqCst);
            Ok(self.free_mib * MIB)
        }

        fn release(&self, _: DeviceHandle) -> std::result::Result<(), DriverError> {
            self.calls.release.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn registry(devices: std::result::Result<i32, ()>, free_mib: u64) -> (GpuInstanceRegistry, Arc<Calls>) {
        let calls = Arc::new(Calls::default());
        let driver = FakeDriver {
            devices,
            free_mib,
            calls: Arc::clone(&calls),
        };
        (GpuInstanceRegistry::with_driver(Box::new(driver)), calls)
    }

    #[test]
    fn missing_driver_reports_zero_and_tears_down_cleanly() {
        let (reg, _) = registry(Err(()), 0);
        assert_eq!(reg.count(), 0);
        reg.destroy_shared_instance();
        assert!(reg.is_destroyed());
        assert_eq!(reg.count(), 0);
    }

    #[test]
    fn init_is_lazy_and_runs_once() {
        let (reg, calls) = registry(Ok(2), 4096);
        assert_eq!(calls.count.load(Ordering::SeqCst), 0);
        assert_eq!(reg.count(), 2);
        assert_eq!(reg.count(), 2);
        assert_eq!(calls.count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn probe_is_fresh_but_context_retained_once() {
        let (reg, calls) = registry(Ok(1), 2000);
        assert_eq!(reg.probe(0).expect("probe").mib(), 2000);
        assert_eq!(reg.probe(0).expect("probe").mib(), 2000);
        assert_eq!(calls.free.load(Ordering::SeqCst), 2);
        assert_eq!(calls.retain.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn out_of_range_and_negative_ids_are_unavailable() {
        let (reg, _) = registry(Ok(1), 2000);
        for gpu_id in [1, 7, -1] {
            let err = reg.probe(gpu_id).expect_err("no such device");
            assert!(matches!(err, EngineError::DeviceUnavailable { gpu_id: id, .. } if id == gpu_id));
        }
    }

    #[test]
    fn destroyed_pool_rejects_device_access() {
        let (reg, calls) = registry(Ok(2), 2000);
        reg.check_device(0).expect("bind");
        reg.check_device(1).expect("bind");
        reg.destroy_shared_instance();
        assert_eq!(calls.release.load(Ordering::SeqCst), 2);

        assert_eq!(reg.count(), 0);
        assert_eq!(reg.probe(0).expect_err("destroyed").error_code(), 100);
        assert!(reg.check_device(0).is_err());

        reg.destroy_shared_instance();
        assert_eq!(calls.release.load(Ordering::SeqCst), 2);
    }
}
