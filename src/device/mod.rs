/*
    The device abstraction.

    The estimator is written against an accelerator that has kernels, buffers,
    an out-of-order command queue and events. This module provides exactly that
    contract and nothing more. The only backend we ship is a vector CPU backend:
    buffers live in host memory, kernels are plain Rust closures run by a pool of
    device workers. Kernels still only see device buffers and declare their
    dependencies through wait lists, so the scheduling code above this module
    would look the same for a real GPU.
*/
pub mod buffer;
pub mod kernel;
pub mod queue;
pub mod reduction;

use std::sync::Arc;

use crate::config::DeviceClass;
use crate::error::{KdeError, Result};

pub use buffer::DeviceBuffer;
pub use kernel::{BuildOptions, Kernel, KernelCache};
pub use queue::{CommandQueue, Event};

/// Models are limited by the width of the column bitmap.
pub const MAX_DIMENSIONS: usize = 32;

#[derive(Clone, Debug)]
pub struct DeviceInfo {
    pub is_gpu: bool,
    /// Largest single allocation, in bytes.
    pub max_alloc_size: usize,
    pub global_mem_size: usize,
    pub local_mem_size: usize,
    pub max_workgroup_size: usize,
    pub max_compute_units: usize,
    /// Alignment of sub-buffer origins, in bits.
    pub required_mem_alignment: usize,
}

impl DeviceInfo {
    pub fn vector_cpu(compute_units: usize) -> DeviceInfo {
        DeviceInfo {
            is_gpu: false,
            max_alloc_size: 256 * 1024 * 1024,
            global_mem_size: 1024 * 1024 * 1024,
            local_mem_size: 32 * 1024,
            max_workgroup_size: 1024,
            max_compute_units: compute_units.max(1),
            required_mem_alignment: 1024,
        }
    }

    /// Size of a stride of `elements` values, padded to the required alignment.
    pub fn aligned_stride(&self, elements: usize) -> usize {
        let bits = elements * std::mem::size_of::<f64>() * 8;
        if bits % self.required_mem_alignment == 0 {
            return elements;
        }
        let padded_bits = (1 + bits / self.required_mem_alignment) * self.required_mem_alignment;
        padded_bits / (std::mem::size_of::<f64>() * 8)
    }
}

pub struct DeviceContext {
    info: DeviceInfo,
    queue: CommandQueue,
    kernels: KernelCache,
}

impl DeviceContext {
    pub fn new(class: DeviceClass, worker_threads: usize) -> Result<DeviceContext> {
        match class {
            DeviceClass::Gpu => Err(KdeError::DeviceUnavailable("no GPU backend is available in this build".into())),
            DeviceClass::Cpu => {
                let compute_units = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
                DeviceContext::with_info(DeviceInfo::vector_cpu(compute_units), worker_threads)
            }
        }
    }

    pub fn with_info(mut info: DeviceInfo, worker_threads: usize) -> Result<DeviceContext> {
        // Larger work groups than this never paid off
        info.max_workgroup_size = info.max_workgroup_size.min(1024);
        let queue = CommandQueue::new(worker_threads)?;
        let kernels = KernelCache::new(info.max_workgroup_size, MAX_DIMENSIONS);
        tracing::info!(
            is_gpu = info.is_gpu,
            compute_units = info.max_compute_units,
            max_alloc = info.max_alloc_size,
            workers = worker_threads,
            "initialized device context"
        );
        Ok(DeviceContext { info, queue, kernels })
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    pub fn kernel(&self, name: &str, options: BuildOptions) -> Result<Arc<Kernel>> {
        self.kernels.get(name, options)
    }

    pub fn kernel_builds(&self) -> usize {
        self.kernels.builds()
    }

    fn check_allocation<T>(&self, len: usize) -> Result<()> {
        let requested = len * std::mem::size_of::<T>();
        if requested > self.info.max_alloc_size {
            return Err(KdeError::AllocationFailure { requested, limit: self.info.max_alloc_size });
        }
        Ok(())
    }

    pub fn create_buffer<T: Copy + Default>(&self, len: usize) -> Result<DeviceBuffer<T>> {
        self.check_allocation::<T>(len)?;
        Ok(DeviceBuffer::zeroed(len))
    }

    /// Allocates a buffer and initializes it from host memory.
    pub fn create_buffer_from<T: Copy + Default>(&self, data: Vec<T>) -> Result<DeviceBuffer<T>> {
        self.check_allocation::<T>(data.len())?;
        Ok(DeviceBuffer::from_vec(data))
    }

    /// Sets every element of `buffer` to `value` once `wait_list` is done.
    pub fn fill(&self, buffer: &DeviceBuffer<f64>, value: f64, wait_list: &[Event]) -> Result<Event> {
        let name = if value == 0.0 {
            "init_zero"
        } else if value == 1.0 {
            "init_one"
        } else {
            "init_value"
        };
        let kernel = self.kernel(name, BuildOptions::generic())?;
        let target = buffer.clone();
        self.queue.enqueue(kernel.name(), wait_list, move || target.fill(value))
    }
}
