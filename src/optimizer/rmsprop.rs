use std::sync::Arc;

use crate::config::{BandwidthRepresentation, KdeConfig};
use crate::device::{DeviceBuffer, DeviceContext, Event, Kernel};
use crate::error::Result;
use crate::estimator::KdeModel;
use crate::metrics::ErrorMetric;
use crate::optimizer::gradient::GradientProgram;
use crate::optimizer::online::OnlineOptimizer;
use crate::optimizer::MIN_BANDWIDTH;

// Slots of the state buffer, D values each
const GRADIENT_ACC: usize = 0;
const LAST_GRADIENT: usize = 1;
const RUNNING_SQUARED_GRADIENT: usize = 2;
const LEARNING_RATE: usize = 3;
const SLOTS: usize = 4;

const DECAY: f64 = 0.9;
const RATE_INCREASE: f64 = 1.2;
const RATE_DECREASE: f64 = 0.5;
const MIN_RATE: f64 = 1e-6;
const MAX_RATE: f64 = 1.0;
const EPSILON: f64 = 1e-10;

/// RMSProp with a per dimension learning rate that grows while the gradient
/// keeps its sign and shrinks when it flips.
pub struct RmsProp {
    metric: ErrorMetric,
    minibatch_size: usize,
    initial_learning_rate: f64,
    observations: usize,
    initialized: bool,
    dimensions: usize,
    representation: BandwidthRepresentation,
    scale: f64,
    bandwidth: DeviceBuffer<f64>,
    state: DeviceBuffer<f64>,
    gradient: GradientProgram,
    accumulate_kernel: Arc<Kernel>,
    initialize_kernel: Arc<Kernel>,
    update_kernel: Arc<Kernel>,
    prepared: Vec<Event>,
    last_event: Option<Event>,
}

impl RmsProp {
    pub fn new(ctx: &DeviceContext, config: &KdeConfig, model: &KdeModel) -> Result<RmsProp> {
        let d = model.dimensions;
        let options = model.build_options();
        Ok(RmsProp {
            metric: config.error_metric,
            minibatch_size: config.minibatch_size.max(1),
            initial_learning_rate: config.rmsprop_learning_rate,
            observations: 0,
            initialized: false,
            dimensions: d,
            representation: model.representation,
            scale: model.normalization() / model.points as f64,
            bandwidth: model.bandwidth.clone(),
            state: ctx.create_buffer::<f64>(SLOTS * d)?,
            gradient: GradientProgram::prepare(ctx, model, &model.bandwidth)?,
            accumulate_kernel: ctx.kernel("accumulate_rmsprop", options)?,
            initialize_kernel: ctx.kernel("initialize_rmsprop", options)?,
            update_kernel: ctx.kernel("update_rmsprop", options)?,
            prepared: Vec::new(),
            last_event: None,
        })
    }

    pub fn learning_rates(&self, ctx: &DeviceContext) -> Result<Vec<f64>> {
        let wait: Vec<Event> = self.last_event.iter().cloned().collect();
        ctx.queue().read_buffer(&self.state, LEARNING_RATE * self.dimensions, self.dimensions, &wait)
    }

    fn schedule_initialize(&self, ctx: &DeviceContext, wait_list: &[Event]) -> Result<Event> {
        let (d, batch, rate) = (self.dimensions, self.minibatch_size as f64, self.initial_learning_rate);
        let state = self.state.clone();
        ctx.queue().enqueue_kernel(&self.initialize_kernel, d, wait_list, move |k| {
            let mut s = state.write();
            let gradient = s[GRADIENT_ACC * d + k] / batch;
            s[LAST_GRADIENT * d + k] = gradient;
            s[RUNNING_SQUARED_GRADIENT * d + k] = gradient * gradient;
            s[LEARNING_RATE * d + k] = rate;
            s[GRADIENT_ACC * d + k] = 0.0;
        })
    }

    fn schedule_update(&self, ctx: &DeviceContext, wait_list: &[Event]) -> Result<Event> {
        let (d, batch) = (self.dimensions, self.minibatch_size as f64);
        let representation = self.representation;
        let (state, bandwidth) = (self.state.clone(), self.bandwidth.clone());
        ctx.queue().enqueue_kernel(&self.update_kernel, d, wait_list, move |k| {
            let mut s = state.write();
            let gradient = s[GRADIENT_ACC * d + k] / batch;
            let running = DECAY * s[RUNNING_SQUARED_GRADIENT * d + k] + (1.0 - DECAY) * gradient * gradient;
            let agreement = gradient * s[LAST_GRADIENT * d + k];
            let mut rate = s[LEARNING_RATE * d + k];
            if agreement > 0.0 {
                rate *= RATE_INCREASE;
            } else if agreement < 0.0 {
                rate *= RATE_DECREASE;
            }
            rate = rate.clamp(MIN_RATE, MAX_RATE);
            s[RUNNING_SQUARED_GRADIENT * d + k] = running;
            s[LEARNING_RATE * d + k] = rate;
            s[LAST_GRADIENT * d + k] = gradient;
            s[GRADIENT_ACC * d + k] = 0.0;

            let mut bandwidth = bandwidth.write();
            let mut updated = bandwidth[k] - rate * gradient / (running.sqrt() + EPSILON);
            if representation == BandwidthRepresentation::Plain {
                updated = updated.max(MIN_BANDWIDTH);
            }
            if updated.is_finite() {
                bandwidth[k] = updated;
            }
        })
    }
}

impl OnlineOptimizer for RmsProp {
    fn name(&self) -> &'static str {
        "rmsprop"
    }

    fn prepare_step(&mut self, ctx: &DeviceContext, _model: &KdeModel, wait_list: &[Event]) -> Result<Vec<Event>> {
        let mut wait: Vec<Event> = wait_list.to_vec();
        wait.extend(self.last_event.take());
        let events = self.gradient.run(ctx.queue(), &wait)?;
        self.prepared = events.clone();
        Ok(events)
    }

    fn apply_step(&mut self, ctx: &DeviceContext, estimate: f64, truth: f64, rows: f64) -> Result<Option<Event>> {
        if self.prepared.is_empty() {
            return Ok(None);
        }
        let prepared = std::mem::take(&mut self.prepared);
        let d = self.dimensions;
        let step = self.metric.gradient_factor(estimate, truth, rows) * self.scale;
        let (state, sums) = (self.state.clone(), self.gradient.sums().clone());
        let accumulate = ctx.queue().enqueue_kernel(&self.accumulate_kernel, d, &prepared, move |k| {
            let gradient = step * sums.read()[k];
            state.write()[GRADIENT_ACC * d + k] += gradient;
        })?;
        self.observations += 1;
        self.last_event = Some(accumulate.clone());
        if self.observations < self.minibatch_size {
            return Ok(None);
        }

        self.observations = 0;
        let update = if self.initialized {
            self.schedule_update(ctx, &[accumulate])?
        } else {
            self.initialized = true;
            self.schedule_initialize(ctx, &[accumulate])?
        };
        tracing::debug!(optimizer = self.name(), "scheduled mini-batch update");
        self.last_event = Some(update.clone());
        Ok(Some(update))
    }

    fn last_event(&self) -> Option<Event> {
        self.last_event.clone()
    }

    fn pending_observations(&self) -> usize {
        self.observations
    }
}
