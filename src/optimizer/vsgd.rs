/*
    Variance-adapted SGD with finite difference curvature estimates.

    Per dimension we keep running averages of the gradient g, the squared
    gradient v, a curvature estimate h and its square vh, plus a time
    constant tau controlling how fast those averages forget. The learning rate
    is

        lr = (h / vh) * (g^2 / v)

    The first factor is an inverse curvature, the second one shrinks steps
    while the gradient is noisy. The curvature is probed at estimation time by a
    second gradient at the bandwidth shifted by the running average gradient.

    State buffer layout: nine slots of D values each, see the constants below.
*/
use std::sync::Arc;

use crate::config::{BandwidthRepresentation, KdeConfig};
use crate::device::{DeviceBuffer, DeviceContext, Event, Kernel};
use crate::error::Result;
use crate::estimator::KdeModel;
use crate::metrics::ErrorMetric;
use crate::optimizer::gradient::GradientProgram;
use crate::optimizer::online::OnlineOptimizer;
use crate::optimizer::MIN_BANDWIDTH;

const GRADIENT_ACC: usize = 0;
const SQUARED_GRADIENT_ACC: usize = 1;
const HESSIAN_ACC: usize = 2;
const SQUARED_HESSIAN_ACC: usize = 3;
const RUNNING_GRADIENT: usize = 4;
const RUNNING_SQUARED_GRADIENT: usize = 5;
const RUNNING_HESSIAN: usize = 6;
const RUNNING_SQUARED_HESSIAN: usize = 7;
const TIME_CONSTANT: usize = 8;
const SLOTS: usize = 9;

/// Scales the initial squared averages and the time constant, which keeps the
/// first steps small.
const LEARNING_BOOST_RATE: f64 = 10.0;

/// Finite difference steps smaller than this give no curvature information.
const MIN_STEP: f64 = 1e-12;

pub struct VsgdFd {
    metric: ErrorMetric,
    minibatch_size: usize,
    observations: usize,
    initialized: bool,
    dimensions: usize,
    representation: BandwidthRepresentation,
    // normalization constant over sample size
    scale: f64,
    bandwidth: DeviceBuffer<f64>,
    shifted_bandwidth: DeviceBuffer<f64>,
    state: DeviceBuffer<f64>,
    current: GradientProgram,
    shifted: GradientProgram,
    shift_kernel: Arc<Kernel>,
    accumulate_kernel: Arc<Kernel>,
    initialize_kernel: Arc<Kernel>,
    update_kernel: Arc<Kernel>,
    prepared: Vec<Event>,
    last_event: Option<Event>,
}

impl VsgdFd {
    pub fn new(ctx: &DeviceContext, config: &KdeConfig, model: &KdeModel) -> Result<VsgdFd> {
        let d = model.dimensions;
        let mut state = vec![0.0; SLOTS * d];
        state[RUNNING_GRADIENT * d..(RUNNING_GRADIENT + 1) * d].fill(1.0);
        state[TIME_CONSTANT * d..(TIME_CONSTANT + 1) * d].fill(1.0);
        let shifted_bandwidth = ctx.create_buffer::<f64>(d)?;
        let options = model.build_options();
        Ok(VsgdFd {
            metric: config.error_metric,
            minibatch_size: config.minibatch_size.max(1),
            observations: 0,
            initialized: false,
            dimensions: d,
            representation: model.representation,
            scale: model.normalization() / model.points as f64,
            bandwidth: model.bandwidth.clone(),
            current: GradientProgram::prepare(ctx, model, &model.bandwidth)?,
            shifted: GradientProgram::prepare(ctx, model, &shifted_bandwidth)?,
            shifted_bandwidth,
            state: ctx.create_buffer_from(state)?,
            shift_kernel: ctx.kernel("shift_bandwidth", options)?,
            accumulate_kernel: ctx.kernel("accumulate_vsgd", options)?,
            initialize_kernel: ctx.kernel("initialize_vsgd", options)?,
            update_kernel: ctx.kernel("update_vsgd", options)?,
            prepared: Vec::new(),
            last_event: None,
        })
    }

    /// Running averages per slot, for inspection.
    pub fn running_averages(&self, ctx: &DeviceContext) -> Result<Vec<f64>> {
        let wait: Vec<Event> = self.last_event.iter().cloned().collect();
        ctx.queue().read_buffer(&self.state, 0, SLOTS * self.dimensions, &wait)
    }

    fn schedule_initialize(&self, ctx: &DeviceContext, wait_list: &[Event]) -> Result<Event> {
        let (d, batch) = (self.dimensions, self.minibatch_size as f64);
        let state = self.state.clone();
        ctx.queue().enqueue_kernel(&self.initialize_kernel, d, wait_list, move |k| {
            let mut s = state.write();
            s[RUNNING_GRADIENT * d + k] = s[GRADIENT_ACC * d + k] / batch;
            s[RUNNING_SQUARED_GRADIENT * d + k] = LEARNING_BOOST_RATE * s[SQUARED_GRADIENT_ACC * d + k] / batch;
            s[RUNNING_HESSIAN * d + k] = s[HESSIAN_ACC * d + k] / batch;
            s[RUNNING_SQUARED_HESSIAN * d + k] = LEARNING_BOOST_RATE * s[SQUARED_HESSIAN_ACC * d + k] / batch;
            s[TIME_CONSTANT * d + k] = LEARNING_BOOST_RATE;
            for slot in [GRADIENT_ACC, SQUARED_GRADIENT_ACC, HESSIAN_ACC, SQUARED_HESSIAN_ACC] {
                s[slot * d + k] = 0.0;
            }
        })
    }

    fn schedule_update(&self, ctx: &DeviceContext, wait_list: &[Event]) -> Result<Event> {
        let (d, batch) = (self.dimensions, self.minibatch_size as f64);
        let representation = self.representation;
        let (state, bandwidth) = (self.state.clone(), self.bandwidth.clone());
        ctx.queue().enqueue_kernel(&self.update_kernel, d, wait_list, move |k| {
            let mut s = state.write();
            let tau = s[TIME_CONSTANT * d + k];
            let decay = 1.0 - 1.0 / tau;
            let gradient = s[GRADIENT_ACC * d + k] / batch;
            let mut averages = [0.0; 4];
            for (i, (running, acc)) in [
                (RUNNING_GRADIENT, GRADIENT_ACC),
                (RUNNING_SQUARED_GRADIENT, SQUARED_GRADIENT_ACC),
                (RUNNING_HESSIAN, HESSIAN_ACC),
                (RUNNING_SQUARED_HESSIAN, SQUARED_HESSIAN_ACC),
            ]
            .into_iter()
            .enumerate()
            {
                let value = decay * s[running * d + k] + s[acc * d + k] / (batch * tau);
                s[running * d + k] = value;
                averages[i] = value;
                s[acc * d + k] = 0.0;
            }
            let [g, v, h, vh] = averages;
            let learning_rate = if v > 0.0 && vh > 0.0 { (h * g * g) / (vh * v) } else { 0.0 };
            let new_tau = if v > 0.0 { (1.0 - g * g / v) * tau + 1.0 } else { tau + 1.0 };
            s[TIME_CONSTANT * d + k] = new_tau.max(1.0);

            let mut bandwidth = bandwidth.write();
            let mut updated = bandwidth[k] - learning_rate * gradient;
            if representation == BandwidthRepresentation::Plain {
                updated = updated.max(MIN_BANDWIDTH);
            }
            // Non-finite steps are dropped
            if updated.is_finite() {
                bandwidth[k] = updated;
            }
        })
    }
}

impl OnlineOptimizer for VsgdFd {
    fn name(&self) -> &'static str {
        "vsgd-fd"
    }

    fn prepare_step(&mut self, ctx: &DeviceContext, _model: &KdeModel, wait_list: &[Event]) -> Result<Vec<Event>> {
        let queue = ctx.queue();
        let mut wait: Vec<Event> = wait_list.to_vec();
        wait.extend(self.last_event.take());

        let d = self.dimensions;
        let representation = self.representation;
        let (state, bandwidth, shifted) = (self.state.clone(), self.bandwidth.clone(), self.shifted_bandwidth.clone());
        let shift = queue.enqueue_kernel(&self.shift_kernel, d, &wait, move |k| {
            let step = state.read()[RUNNING_GRADIENT * d + k];
            let mut value = bandwidth.read()[k] + step;
            if representation == BandwidthRepresentation::Plain {
                value = value.max(MIN_BANDWIDTH);
            }
            shifted.write()[k] = value;
        })?;

        let mut events = self.current.run(queue, &wait)?;
        events.extend(self.shifted.run(queue, &[shift])?);
        self.prepared = events.clone();
        Ok(events)
    }

    fn apply_step(&mut self, ctx: &DeviceContext, estimate: f64, truth: f64, rows: f64) -> Result<Option<Event>> {
        if self.prepared.is_empty() {
            return Ok(None);
        }
        let prepared = std::mem::take(&mut self.prepared);
        let (d, scale, metric) = (self.dimensions, self.scale, self.metric);
        let (state, bandwidth, shifted_bandwidth) =
            (self.state.clone(), self.bandwidth.clone(), self.shifted_bandwidth.clone());
        let (sums, shifted_sums) = (self.current.sums().clone(), self.shifted.sums().clone());
        let factor = metric.gradient_factor(estimate, truth, rows);
        let accumulate = ctx.queue().enqueue_kernel(&self.accumulate_kernel, d, &prepared, move |k| {
            let (sums, shifted_sums) = (sums.read(), shifted_sums.read());
            let shifted_estimate = scale * shifted_sums[d];
            let shifted_factor = metric.gradient_factor(shifted_estimate, truth, rows);
            let gradient = factor * scale * sums[k];
            let shifted_gradient = shifted_factor * scale * shifted_sums[k];
            let step = shifted_bandwidth.read()[k] - bandwidth.read()[k];
            let hessian = if step.abs() > MIN_STEP { (gradient - shifted_gradient).abs() / step.abs() } else { 0.0 };
            let mut s = state.write();
            s[GRADIENT_ACC * d + k] += gradient;
            s[SQUARED_GRADIENT_ACC * d + k] += gradient * gradient;
            s[HESSIAN_ACC * d + k] += hessian;
            s[SQUARED_HESSIAN_ACC * d + k] += hessian * hessian;
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

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{KdeConfig, OnlineAlgorithm};
    use crate::device::test::test_context;
    use crate::estimator::request::RangeRequest;
    use crate::estimator::test::test_estimator;
    use crate::evaluation::evaluate;

    fn config() -> KdeConfig {
        KdeConfig::default()
            .with_bandwidth_representation(BandwidthRepresentation::Log)
            .with_online_algorithm(OnlineAlgorithm::VsgdFd, 3)
    }

    #[test]
    fn first_minibatch_only_initializes() {
        let ctx = test_context();
        let mut estimator = test_estimator(&ctx, &config(), 64);
        let before = estimator.bandwidth(&ctx).unwrap();
        let request = RangeRequest::new(1).between(0, -1.0, 1.0);
        for _ in 0..3 {
            evaluate(&ctx, &mut estimator, &request).unwrap();
            estimator.apply_online_step(&ctx, 0.9).unwrap();
        }
        assert_eq!(estimator.bandwidth(&ctx).unwrap(), before);
        assert_eq!(estimator.online.as_ref().unwrap().pending_observations(), 0);
    }

    #[test]
    fn state_starts_with_unit_step() {
        let ctx = test_context();
        let estimator = test_estimator(&ctx, &config(), 16);
        let vsgd = VsgdFd::new(&ctx, &config(), estimator.model()).unwrap();
        let state = vsgd.running_averages(&ctx).unwrap();
        assert_eq!(state.len(), SLOTS * 2);
        assert_eq!(&state[RUNNING_GRADIENT * 2..RUNNING_GRADIENT * 2 + 2], &[1.0, 1.0]);
        assert_eq!(&state[TIME_CONSTANT * 2..TIME_CONSTANT * 2 + 2], &[1.0, 1.0]);
        assert!(state[..4 * 2].iter().all(|v| *v == 0.0));
    }

    #[test]
    fn moves_bandwidth_towards_truth() {
        // A narrow box around the sample center. The truth is much larger than
        // the estimate, so the bandwidth of dimension 0 has to shrink.
        let ctx = test_context();
        let mut estimator = test_estimator(&ctx, &config(), 128);
        estimator.set_bandwidth(&ctx, &[4.0, 4.0]).unwrap();
        let request = RangeRequest::new(1).between(0, -1.0, 1.0);
        let first = evaluate(&ctx, &mut estimator, &request).unwrap();
        estimator.apply_online_step(&ctx, 0.33).unwrap();
        for _ in 0..29 {
            evaluate(&ctx, &mut estimator, &request).unwrap();
            estimator.apply_online_step(&ctx, 0.33).unwrap();
        }
        let bandwidth = estimator.bandwidth(&ctx).unwrap();
        assert!(bandwidth[0] < 4.0, "{:?}", bandwidth);
        let last = evaluate(&ctx, &mut estimator, &request).unwrap();
        assert!((last - 0.33).abs() < (first - 0.33).abs(), "{} -> {}", first, last);
    }

    #[test]
    fn feedback_without_estimation_is_ignored() {
        let ctx = test_context();
        let estimator = test_estimator(&ctx, &config(), 16);
        let mut vsgd = VsgdFd::new(&ctx, &config(), estimator.model()).unwrap();
        assert!(vsgd.apply_step(&ctx, 0.1, 0.2, 100.0).unwrap().is_none());
        assert_eq!(vsgd.pending_observations(), 0);
    }
}
