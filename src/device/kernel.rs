use std::fmt::Display;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::Mutex;

use crate::config::{BandwidthRepresentation, KernelType};
use crate::error::{KdeError, Result};

/// Every kernel program the device knows how to build.
pub const KERNEL_PROGRAMS: &[&str] = &[
    "init_zero",
    "init_one",
    "init_value",
    "kde",
    "sum_pre_aggregate",
    "sum_finish",
    "min_fast_pass",
    "min_slow_pass",
    "min_finish",
    "finalize_estimate",
    "compute_partial_gradient",
    "batch_gradient",
    "shift_bandwidth",
    "accumulate_vsgd",
    "initialize_vsgd",
    "update_vsgd",
    "accumulate_rmsprop",
    "initialize_rmsprop",
    "update_rmsprop",
    "extract_dimension",
    "precompute_variance",
    "set_scotts_bandwidth",
    "point_deletion_bitmap",
    "update_sample_karma",
    "karma_threshold_bitmap",
];

/// Compile time parameters of a kernel. Kernels that do not depend on the
/// dimensionality use `BuildOptions::generic()`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BuildOptions {
    pub dimensions: usize,
    pub kernel_type: KernelType,
    pub representation: BandwidthRepresentation,
}

impl BuildOptions {
    pub fn generic() -> BuildOptions {
        BuildOptions { dimensions: 0, kernel_type: KernelType::Gaussian, representation: BandwidthRepresentation::Plain }
    }

    pub fn for_model(dimensions: usize, kernel_type: KernelType, representation: BandwidthRepresentation) -> BuildOptions {
        BuildOptions { dimensions, kernel_type, representation }
    }

    pub fn log_bandwidth(&self) -> bool {
        self.representation == BandwidthRepresentation::Log
    }
}

impl Display for BuildOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "-DD={}", self.dimensions)?;
        if self.log_bandwidth() {
            write!(f, " -DLOG_BANDWIDTH")?;
        }
        if self.kernel_type == KernelType::Epanechnikov {
            write!(f, " -DEPANECHNIKOV")?;
        }
        Ok(())
    }
}

/// A built kernel program.
#[derive(Debug)]
pub struct Kernel {
    name: &'static str,
    options: BuildOptions,
    workgroup_size: usize,
    preferred_multiple: usize,
}

impl Kernel {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn options(&self) -> &BuildOptions {
        &self.options
    }

    pub fn dimensions(&self) -> usize {
        self.options.dimensions
    }

    pub fn workgroup_size(&self) -> usize {
        self.workgroup_size
    }

    /// Rounds the work group size down to the preferred multiple.
    pub fn local_size(&self, local_memory_per_item: usize, local_memory: usize) -> usize {
        let mut local = self.workgroup_size;
        if local_memory_per_item > 0 {
            local = local.min(local_memory / local_memory_per_item);
        }
        let rounded = self.preferred_multiple * (local / self.preferred_multiple);
        rounded.max(1)
    }
}

/// Built kernels, keyed by program name and build options. Every key gets built
/// exactly once and is shared afterwards.
pub struct KernelCache {
    kernels: Mutex<AHashMap<(&'static str, BuildOptions), Arc<Kernel>>>,
    builds: AtomicUsize,
    max_workgroup_size: usize,
    max_dimensions: usize,
}

impl KernelCache {
    pub fn new(max_workgroup_size: usize, max_dimensions: usize) -> KernelCache {
        KernelCache {
            kernels: Mutex::new(AHashMap::new()),
            builds: AtomicUsize::new(0),
            max_workgroup_size,
            max_dimensions,
        }
    }

    pub fn get(&self, name: &str, options: BuildOptions) -> Result<Arc<Kernel>> {
        let Some(program) = KERNEL_PROGRAMS.iter().find(|p| **p == name) else {
            return Err(KdeError::KernelBuildFailure { kernel: name.to_string(), reason: "unknown program".into() });
        };
        if options.dimensions > self.max_dimensions {
            return Err(KdeError::KernelBuildFailure {
                kernel: name.to_string(),
                reason: format!("{} is not a supported dimensionality ({})", options.dimensions, options),
            });
        }
        let mut kernels = self.kernels.lock();
        if let Some(kernel) = kernels.get(&(*program, options)) {
            return Ok(kernel.clone());
        }
        let kernel = Arc::new(Kernel {
            name: program,
            options,
            workgroup_size: self.max_workgroup_size,
            preferred_multiple: 8.min(self.max_workgroup_size).max(1),
        });
        self.builds.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(kernel = *program, options = %options, "built kernel");
        kernels.insert((*program, options), kernel.clone());
        Ok(kernel)
    }

    /// How many distinct kernels were built so far.
    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn builds_each_key_once() {
        let cache = KernelCache::new(256, 32);
        let options = BuildOptions::for_model(3, KernelType::Gaussian, BandwidthRepresentation::Log);
        let a = cache.get("kde", options).unwrap();
        let b = cache.get("kde", options).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.builds(), 1);
        let c = cache.get("kde", BuildOptions::for_model(2, KernelType::Gaussian, BandwidthRepresentation::Log)).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(cache.builds(), 2);
    }

    #[test]
    fn unknown_programs_fail_to_build() {
        let cache = KernelCache::new(256, 32);
        let err = cache.get("stholes", BuildOptions::generic()).unwrap_err();
        assert!(matches!(err, KdeError::KernelBuildFailure { .. }));
        assert!(cache.get("kde", BuildOptions::for_model(33, KernelType::Gaussian, BandwidthRepresentation::Plain)).is_err());
    }

    #[test]
    fn renders_build_flags() {
        let options = BuildOptions::for_model(4, KernelType::Epanechnikov, BandwidthRepresentation::Log);
        assert_eq!(options.to_string(), "-DD=4 -DLOG_BANDWIDTH -DEPANECHNIKOV");
        assert_eq!(BuildOptions::generic().to_string(), "-DD=0");
    }

    #[test]
    fn local_size_respects_local_memory() {
        let cache = KernelCache::new(256, 32);
        let kernel = cache.get("compute_partial_gradient", BuildOptions::generic()).unwrap();
        assert_eq!(kernel.local_size(0, 0), 256);
        // 100 bytes per item in 3000 bytes of local memory gives 30, rounded down to 24
        assert_eq!(kernel.local_size(100, 3000), 24);
        assert_eq!(kernel.local_size(100, 10), 1);
    }
}
