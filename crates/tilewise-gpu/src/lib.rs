#![doc = include_str!("../README.md")]

pub mod registry;
pub mod sys;

pub use registry::{
    CudaDriver, DeviceDriver, DeviceHandle, GpuInstanceRegistry, SharedPoolProbe,
    destroy_gpu_instance, get_gpu_count,
};
