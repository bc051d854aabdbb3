use std::path::PathBuf;
use std::str::FromStr;

use crate::metrics::ErrorMetric;

/// Which class of compute device the estimator should run on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceClass {
    Cpu,
    Gpu,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum KernelType {
    Gaussian,
    Epanechnikov,
}

/// How the bandwidth vector is stored on the device. In log space every real
/// value maps to a positive bandwidth, so the optimizers never have to clamp.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BandwidthRepresentation {
    Plain,
    Log,
}

impl BandwidthRepresentation {
    /// Plain bandwidth to the value stored on the device.
    pub fn encode(&self, bandwidth: f64) -> f64 {
        match self {
            BandwidthRepresentation::Plain => bandwidth,
            BandwidthRepresentation::Log => bandwidth.ln(),
        }
    }

    pub fn decode(&self, stored: f64) -> f64 {
        match self {
            BandwidthRepresentation::Plain => stored,
            BandwidthRepresentation::Log => stored.exp(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OnlineAlgorithm {
    VsgdFd,
    RmsProp,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MaintenancePolicy {
    None,
    /// Correlated acceptance/rejection on inserts and deletes.
    Car,
    /// Periodic random replacement.
    Prr,
    /// Triggered karma replacement.
    Tkr,
    /// Periodic karma replacement.
    Pkr,
}

pub struct KdeConfig {
    pub enabled: bool,
    pub device: DeviceClass,
    pub worker_threads: usize,
    pub sample_size: usize,
    pub kernel_type: KernelType,
    pub error_metric: ErrorMetric,
    pub bandwidth_representation: BandwidthRepresentation,
    pub enable_adaptive_bandwidth: bool,
    pub online_algorithm: OnlineAlgorithm,
    pub minibatch_size: usize,
    pub rmsprop_learning_rate: f64,
    pub enable_bandwidth_optimization: bool,
    /// `None` means every feedback record that is available.
    pub feedback_window: Option<usize>,
    pub maintenance_policy: MaintenancePolicy,
    pub maintenance_period: u64,
    pub maintenance_threshold: f64,
    pub karma_limit: f64,
    pub error_logfile: Option<PathBuf>,
    pub seed: Option<u64>,
}

impl Default for KdeConfig {
    fn default() -> Self {
        KdeConfig {
            enabled: true,
            device: DeviceClass::Cpu,
            worker_threads: 4,
            sample_size: 1024,
            kernel_type: KernelType::Gaussian,
            error_metric: ErrorMetric::Quadratic,
            bandwidth_representation: BandwidthRepresentation::Log,
            enable_adaptive_bandwidth: true,
            online_algorithm: OnlineAlgorithm::VsgdFd,
            minibatch_size: 10,
            rmsprop_learning_rate: 0.01,
            enable_bandwidth_optimization: true,
            feedback_window: Some(200),
            maintenance_policy: MaintenancePolicy::None,
            maintenance_period: 50,
            maintenance_threshold: -5.0,
            karma_limit: -1e10,
            error_logfile: None,
            seed: None,
        }
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(val) => val.trim().parse::<T>().unwrap_or(default),
        Err(_) => default,
    }
}

impl KdeConfig {
    /// Reads the configuration from `OXIDKDE_*` environment variables. Anything
    /// that is missing or does not parse keeps its default.
    pub fn new() -> KdeConfig {
        let defaults = KdeConfig::default();
        // -1 means "all feedback"
        let feedback_window = match env_or::<i64>("OXIDKDE_FEEDBACK_WINDOW", 200) {
            w if w < 0 => None,
            w => Some(w as usize),
        };
        let error_logfile = std::env::var("OXIDKDE_ERROR_LOGFILE")
            .ok()
            .filter(|p| !p.is_empty())
            .map(PathBuf::from);
        let seed = std::env::var("OXIDKDE_SEED").ok().and_then(|s| s.parse::<u64>().ok());
        KdeConfig {
            enabled: env_or("OXIDKDE_ENABLE", defaults.enabled),
            device: env_or("OXIDKDE_DEVICE", defaults.device),
            worker_threads: env_or("OXIDKDE_WORKER_THREADS", defaults.worker_threads).max(1),
            sample_size: env_or("OXIDKDE_SAMPLE_SIZE", defaults.sample_size),
            kernel_type: env_or("OXIDKDE_KERNEL", defaults.kernel_type),
            error_metric: env_or("OXIDKDE_ERROR_METRIC", defaults.error_metric),
            bandwidth_representation: env_or(
                "OXIDKDE_BANDWIDTH_REPRESENTATION",
                defaults.bandwidth_representation,
            ),
            enable_adaptive_bandwidth: env_or("OXIDKDE_ADAPTIVE_BANDWIDTH", defaults.enable_adaptive_bandwidth),
            online_algorithm: env_or("OXIDKDE_ONLINE_ALGORITHM", defaults.online_algorithm),
            minibatch_size: env_or("OXIDKDE_MINIBATCH_SIZE", defaults.minibatch_size).max(1),
            rmsprop_learning_rate: env_or("OXIDKDE_RMSPROP_LEARNING_RATE", defaults.rmsprop_learning_rate),
            enable_bandwidth_optimization: env_or(
                "OXIDKDE_BANDWIDTH_OPTIMIZATION",
                defaults.enable_bandwidth_optimization,
            ),
            feedback_window,
            maintenance_policy: env_or("OXIDKDE_SAMPLE_MAINTENANCE", defaults.maintenance_policy),
            maintenance_period: env_or("OXIDKDE_MAINTENANCE_PERIOD", defaults.maintenance_period).max(1),
            maintenance_threshold: env_or("OXIDKDE_MAINTENANCE_THRESHOLD", defaults.maintenance_threshold),
            karma_limit: env_or("OXIDKDE_KARMA_LIMIT", defaults.karma_limit),
            error_logfile,
            seed,
        }
    }

    pub fn with_sample_size(mut self, sample_size: usize) -> Self {
        self.sample_size = sample_size;
        self
    }

    pub fn with_kernel_type(mut self, kernel_type: KernelType) -> Self {
        self.kernel_type = kernel_type;
        self
    }

    pub fn with_error_metric(mut self, metric: ErrorMetric) -> Self {
        self.error_metric = metric;
        self
    }

    pub fn with_bandwidth_representation(mut self, representation: BandwidthRepresentation) -> Self {
        self.bandwidth_representation = representation;
        self
    }

    pub fn with_online_algorithm(mut self, algorithm: OnlineAlgorithm, minibatch_size: usize) -> Self {
        self.enable_adaptive_bandwidth = true;
        self.online_algorithm = algorithm;
        self.minibatch_size = minibatch_size.max(1);
        self
    }

    pub fn without_adaptive_bandwidth(mut self) -> Self {
        self.enable_adaptive_bandwidth = false;
        self
    }

    pub fn with_bandwidth_optimization(mut self, enabled: bool, feedback_window: Option<usize>) -> Self {
        self.enable_bandwidth_optimization = enabled;
        self.feedback_window = feedback_window;
        self
    }

    pub fn with_maintenance(mut self, policy: MaintenancePolicy, period: u64, threshold: f64) -> Self {
        self.maintenance_policy = policy;
        self.maintenance_period = period.max(1);
        self.maintenance_threshold = threshold;
        self
    }

    pub fn with_error_logfile(mut self, path: impl Into<PathBuf>) -> Self {
        self.error_logfile = Some(path.into());
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_worker_threads(mut self, worker_threads: usize) -> Self {
        self.worker_threads = worker_threads.max(1);
        self
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct UnknownOption(pub String);

impl FromStr for DeviceClass {
    type Err = UnknownOption;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(DeviceClass::Cpu),
            "gpu" => Ok(DeviceClass::Gpu),
            other => Err(UnknownOption(other.to_string())),
        }
    }
}

impl FromStr for KernelType {
    type Err = UnknownOption;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gaussian" | "gauss" => Ok(KernelType::Gaussian),
            "epanechnikov" => Ok(KernelType::Epanechnikov),
            other => Err(UnknownOption(other.to_string())),
        }
    }
}

impl FromStr for BandwidthRepresentation {
    type Err = UnknownOption;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "plain" => Ok(BandwidthRepresentation::Plain),
            "log" => Ok(BandwidthRepresentation::Log),
            other => Err(UnknownOption(other.to_string())),
        }
    }
}

impl FromStr for OnlineAlgorithm {
    type Err = UnknownOption;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "vsgdfd" | "vsgd" | "0" => Ok(OnlineAlgorithm::VsgdFd),
            "rmsprop" | "1" => Ok(OnlineAlgorithm::RmsProp),
            other => Err(UnknownOption(other.to_string())),
        }
    }
}

impl FromStr for MaintenancePolicy {
    type Err = UnknownOption;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "0" => Ok(MaintenancePolicy::None),
            "car" | "1" => Ok(MaintenancePolicy::Car),
            "prr" | "2" => Ok(MaintenancePolicy::Prr),
            "tkr" | "3" => Ok(MaintenancePolicy::Tkr),
            "pkr" | "4" => Ok(MaintenancePolicy::Pkr),
            other => Err(UnknownOption(other.to_string())),
        }
    }
}
