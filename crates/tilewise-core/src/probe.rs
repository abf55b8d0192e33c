//! Device memory probing.

use crate::error::Result;

const MIB: u64 = 1024 * 1024;

/// Usable device heap, in MiB.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HeapBudget(pub u32);

impl HeapBudget {
    /// Convert a byte count, rounding down. Saturates at `u32::MAX` MiB.
    pub fn from_bytes(bytes: u64) -> Self {
        Self(u32::try_from(bytes / MIB).unwrap_or(u32::MAX))
    }

    #[inline]
    pub fn mib(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for HeapBudget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} MiB", self.0)
    }
}

/// Reads a GPU's current heap budget.
///
/// Implementations must query the device on every call; a budget is never
/// cached. Both methods are only meaningful for `gpu_id >= 0`.
pub trait DeviceBudgetProbe: Send + Sync {
    /// Current usable heap of `gpu_id`.
    ///
    /// # Errors
    /// [`EngineError::DeviceUnavailable`](crate::EngineError::DeviceUnavailable)
    /// if no handle for the device can be obtained.
    fn probe(&self, gpu_id: i32) -> Result<HeapBudget>;

    /// Confirm `gpu_id` can still be bound, without reading memory.
    fn check_device(&self, gpu_id: i32) -> Result<()>;
}

impl<P: DeviceBudgetProbe + ?Sized> DeviceBudgetProbe for std::sync::Arc<P> {
    fn probe(&self, gpu_id: i32) -> Result<HeapBudget> {
        (**self).probe(gpu_id)
    }

    fn check_device(&self, gpu_id: i32) -> Result<()> {
        (**self).check_device(gpu_id)
    }
}
