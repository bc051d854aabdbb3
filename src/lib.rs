//! OxidKDE - adaptive kernel density selectivity estimation for range scans.

pub mod config;
pub mod device;
pub mod error;
pub mod estimator;
pub mod evaluation;
pub mod maintenance;
pub mod metrics;
pub mod optimizer;
pub mod registry;

pub use config::KdeConfig;
pub use error::{KdeError, Result};
pub use estimator::request::{ColumnRange, RangeRequest};
pub use estimator::stats::EstimatorStats;
pub use estimator::TableId;
pub use registry::store::{DirectoryModelStore, FeedbackRecord, FeedbackStore, InMemoryFeedbackStore, InMemoryModelStore, ModelStore};
pub use registry::EstimatorContext;
