use crate::config::{KdeConfig, OnlineAlgorithm};
use crate::device::{DeviceContext, Event};
use crate::error::Result;
use crate::estimator::KdeModel;
use crate::optimizer::rmsprop::RmsProp;
use crate::optimizer::vsgd::VsgdFd;

/// An online bandwidth learner.
///
/// `prepare_step` runs at estimation time and schedules whatever gradient work
/// the algorithm needs, `apply_step` consumes the true selectivity once it is
/// known. The event returned by `apply_step` is the last write to the
/// bandwidth, the next estimation has to wait for it.
pub trait OnlineOptimizer {
    fn name(&self) -> &'static str;

    fn prepare_step(&mut self, ctx: &DeviceContext, model: &KdeModel, wait_list: &[Event]) -> Result<Vec<Event>>;

    fn apply_step(&mut self, ctx: &DeviceContext, estimate: f64, truth: f64, rows: f64) -> Result<Option<Event>>;

    /// The last command that reads the optimizer's scratch buffers.
    fn last_event(&self) -> Option<Event>;

    /// Observations in the current mini-batch.
    fn pending_observations(&self) -> usize;
}

pub fn create(ctx: &DeviceContext, config: &KdeConfig, model: &KdeModel) -> Result<Box<dyn OnlineOptimizer>> {
    Ok(match config.online_algorithm {
        OnlineAlgorithm::VsgdFd => Box::new(VsgdFd::new(ctx, config, model)?),
        OnlineAlgorithm::RmsProp => Box::new(RmsProp::new(ctx, config, model)?),
    })
}
