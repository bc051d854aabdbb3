/*
    Offline bandwidth optimization.

    Starts from Scott's rule and minimizes the mean error of the model over a
    window of recorded feedback. The objective is evaluated on the device: one
    work item per feedback record sums the record's estimate and its gradient
    over the whole sample, then 1 + D reductions turn the per record values
    into the mean loss and the mean gradient.

    The search works on the bandwidth as it is stored and inside a box of
    [MIN_BANDWIDTH, 4 * scott] per dimension:

    1. Multi-start: projected gradient descent with a small budget from the
       rule-of-thumb bandwidth and from a handful of random points in the box.
    2. Local refinement: more descent from the best point found so far.

    Descent steps are relative to the box width. A step that lowers the loss
    is taken and the step length doubles, otherwise it halves.
*/
use std::sync::Arc;
use std::time::Instant;

use rand::Rng;

use crate::config::{BandwidthRepresentation, KdeConfig};
use crate::device::reduction::SumDescriptor;
use crate::device::{DeviceBuffer, DeviceContext, Event, Kernel, MAX_DIMENSIONS};
use crate::error::{KdeError, Result};
use crate::estimator::{Estimator, KdeModel};
use crate::metrics::ErrorMetric;
use crate::optimizer::gradient::partial_gradient;
use crate::optimizer::MIN_BANDWIDTH;
use crate::registry::store::{FeedbackRecord, FeedbackStore};

const RANDOM_STARTS: usize = 7;
const EVALUATIONS_PER_START: usize = 15;
const LOCAL_EVALUATIONS: usize = 100;
const UPPER_BOUND_FACTOR: f64 = 4.0;
const MIN_STEP: f64 = 1e-8;

/// Schedules computing Scott's rule for the current sample and writing it to
/// the bandwidth buffer, in the model's representation.
///
/// h_k = sdev_k * N^(-1 / (D + 4)), with the deviation of the normalized sample.
pub fn scotts_bandwidth(ctx: &DeviceContext, model: &KdeModel, wait_list: &[Event]) -> Result<Event> {
    let options = model.build_options();
    let (d, n) = (model.dimensions, model.points);
    // Dimension major copy of the normalized sample, so every dimension can be
    // reduced on its own
    let scratch = ctx.create_buffer::<f64>(d * n)?;
    // Sums in [0, D), sums of squared deviations in [D, 2D)
    let moments = ctx.create_buffer::<f64>(2 * d)?;
    let queue = ctx.queue();

    let (sample, mean, sdev) = (model.sample.clone(), model.mean.clone(), model.sdev.clone());
    let target = scratch.clone();
    let extract = queue.enqueue_kernel(&*ctx.kernel("extract_dimension", options)?, n, wait_list, move |i| {
        let mut point = [0.0; MAX_DIMENSIONS];
        {
            let (sample, mean, sdev) = (sample.read(), mean.read(), sdev.read());
            for k in 0..d {
                point[k] = (sample[i * d + k] - mean[k]) / sdev[k];
            }
        }
        let mut target = target.write();
        for k in 0..d {
            target[k * n + i] = point[k];
        }
    })?;
    let sums = (0..d)
        .map(|k| SumDescriptor::prepare(ctx, &scratch, k * n, n, &moments, k)?.run(queue, &[extract.clone()]))
        .collect::<Result<Vec<Event>>>()?;

    let (target, sums_buffer) = (scratch.clone(), moments.clone());
    let deviations = queue.enqueue_kernel(&*ctx.kernel("precompute_variance", options)?, d * n, &sums, move |j| {
        let mean = sums_buffer.read()[j / n] / n as f64;
        let mut target = target.write();
        target[j] = (target[j] - mean).powi(2);
    })?;
    let variances = (0..d)
        .map(|k| SumDescriptor::prepare(ctx, &scratch, k * n, n, &moments, d + k)?.run(queue, &[deviations.clone()]))
        .collect::<Result<Vec<Event>>>()?;

    let (bandwidth, representation) = (model.bandwidth.clone(), model.representation);
    let scale = (n as f64).powf(-1.0 / (d as f64 + 4.0));
    let denominator = (n.max(2) - 1) as f64;
    queue.enqueue_kernel(&*ctx.kernel("set_scotts_bandwidth", options)?, d, &variances, move |k| {
        let variance = moments.read()[d + k] / denominator;
        let sdev = if variance > 0.0 { variance.sqrt() } else { 1.0 };
        bandwidth.write()[k] = representation.encode(sdev * scale);
    })
}

/// A feedback record laid out for a model: normalized bounds in dimension
/// order and the observed selectivity.
#[derive(Clone, Debug, PartialEq)]
pub struct TrainingRecord {
    pub bounds: Vec<f64>,
    pub selectivity: f64,
}

/// Drops records the model can't answer and records of empty scans.
pub fn training_set(model: &KdeModel, records: &[FeedbackRecord]) -> Vec<TrainingRecord> {
    records
        .iter()
        .filter(|record| record.columns.is_subset_of(&model.columns))
        .filter_map(|record| {
            let selectivity = record.selectivity()?;
            let mut bounds = record.request().bounds(&model.columns).ok()?;
            model.normalize_bounds(&mut bounds);
            Some(TrainingRecord { bounds, selectivity })
        })
        .collect()
}

/// A differentiable function of the stored bandwidth. Returns the loss and its
/// gradient.
#[cfg_attr(test, mockall::automock)]
pub trait Objective {
    fn evaluate(&mut self, bandwidth: &[f64]) -> Result<(f64, Vec<f64>)>;
}

/// Mean error of the model over a set of training records.
pub struct BatchObjective<'a> {
    ctx: &'a DeviceContext,
    kernel: Arc<Kernel>,
    model: &'a KdeModel,
    records: usize,
    bandwidth: DeviceBuffer<f64>,
    bounds: DeviceBuffer<f64>,
    truths: DeviceBuffer<f64>,
    // R losses, then R gradient values per dimension
    errors: DeviceBuffer<f64>,
    sums: DeviceBuffer<f64>,
    reductions: Vec<SumDescriptor>,
    metric: ErrorMetric,
    rows: f64,
    transfers_to_device: u64,
    transfers_to_host: u64,
}

impl<'a> BatchObjective<'a> {
    pub fn prepare(
        ctx: &'a DeviceContext,
        model: &'a KdeModel,
        training: &[TrainingRecord],
        metric: ErrorMetric,
        rows: f64,
    ) -> Result<BatchObjective<'a>> {
        if training.is_empty() {
            return Err(KdeError::InvalidArgument("objective without training records".into()));
        }
        let (d, r) = (model.dimensions, training.len());
        let kernel = ctx.kernel("batch_gradient", model.build_options())?;
        let bounds = ctx.create_buffer_from(training.iter().flat_map(|t| t.bounds.iter().copied()).collect())?;
        let truths = ctx.create_buffer_from(training.iter().map(|t| t.selectivity).collect())?;
        let errors = ctx.create_buffer::<f64>((1 + d) * r)?;
        let sums = ctx.create_buffer::<f64>(1 + d)?;
        let reductions =
            (0..=d).map(|slot| SumDescriptor::prepare(ctx, &errors, slot * r, r, &sums, slot)).collect::<Result<_>>()?;
        Ok(BatchObjective {
            ctx,
            kernel,
            model,
            records: r,
            bandwidth: ctx.create_buffer::<f64>(d)?,
            bounds,
            truths,
            errors,
            sums,
            reductions,
            metric,
            rows,
            transfers_to_device: 1,
            transfers_to_host: 0,
        })
    }

    pub fn transfers(&self) -> (u64, u64) {
        (self.transfers_to_device, self.transfers_to_host)
    }
}

impl<'a> Objective for BatchObjective<'a> {
    fn evaluate(&mut self, bandwidth: &[f64]) -> Result<(f64, Vec<f64>)> {
        let queue = self.ctx.queue();
        let model = self.model;
        let (d, n, r) = (model.dimensions, model.points, self.records);
        let write = queue.write_buffer(&self.bandwidth, 0, bandwidth.to_vec(), &[])?;
        self.transfers_to_device += 1;

        let (kernel_type, representation) = (model.kernel_type, model.representation);
        let (metric, rows) = (self.metric, self.rows);
        let scale = model.normalization() / n as f64;
        let (sample, mean, sdev) = (model.sample.clone(), model.mean.clone(), model.sdev.clone());
        let (bandwidth, bounds, truths) = (self.bandwidth.clone(), self.bounds.clone(), self.truths.clone());
        let errors = self.errors.clone();
        let gradient = queue.enqueue_kernel(&self.kernel, r, &[write], move |record| {
            let mut point = [0.0; MAX_DIMENSIONS];
            let mut partial = [0.0; MAX_DIMENSIONS];
            let mut gradient = [0.0; MAX_DIMENSIONS];
            let mut estimate = 0.0;
            {
                let (sample, mean, sdev) = (sample.read(), mean.read(), sdev.read());
                let (bandwidth, bounds) = (bandwidth.read(), bounds.read());
                let bounds = &bounds[record * 2 * d..(record + 1) * 2 * d];
                for i in 0..n {
                    for k in 0..d {
                        point[k] = (sample[i * d + k] - mean[k]) / sdev[k];
                    }
                    estimate +=
                        partial_gradient(kernel_type, representation, &point[..d], bounds, &bandwidth, &mut partial[..d]);
                    for k in 0..d {
                        gradient[k] += partial[k];
                    }
                }
            }
            let estimate = estimate * scale;
            let truth = truths.read()[record];
            let factor = metric.gradient_factor(estimate, truth, rows) * scale / r as f64;
            let mut errors = errors.write();
            errors[record] = metric.loss(estimate, truth, rows) / r as f64;
            for k in 0..d {
                errors[(1 + k) * r + record] = factor * gradient[k];
            }
        })?;
        let reduced = self.reductions.iter().map(|s| s.run(queue, &[gradient.clone()])).collect::<Result<Vec<_>>>()?;
        let sums = queue.read_buffer(&self.sums, 0, 1 + d, &reduced)?;
        self.transfers_to_host += 1;
        Ok((sums[0], sums[1..].to_vec()))
    }
}

/// The box the search stays in, per dimension, in the stored representation.
#[derive(Clone, Debug, PartialEq)]
pub struct SearchBox {
    pub lower: Vec<f64>,
    pub upper: Vec<f64>,
}

impl SearchBox {
    /// `[MIN_BANDWIDTH, 4 * h]` around a plain bandwidth `h`.
    pub fn around(representation: BandwidthRepresentation, bandwidth: &[f64]) -> SearchBox {
        SearchBox {
            lower: bandwidth.iter().map(|_| representation.encode(MIN_BANDWIDTH)).collect(),
            upper: bandwidth.iter().map(|h| representation.encode(UPPER_BOUND_FACTOR * h.max(MIN_BANDWIDTH))).collect(),
        }
    }

    fn width(&self, k: usize) -> f64 {
        self.upper[k] - self.lower[k]
    }

    fn project(&self, point: &mut [f64]) {
        for (k, value) in point.iter_mut().enumerate() {
            *value = value.clamp(self.lower[k], self.upper[k]);
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SearchResult {
    pub bandwidth: Vec<f64>,
    pub loss: f64,
    pub evaluations: usize,
}

fn checked(bandwidth: &[f64], (loss, gradient): (f64, Vec<f64>)) -> Result<(f64, Vec<f64>)> {
    if !loss.is_finite() || gradient.iter().any(|g| !g.is_finite()) {
        return Err(KdeError::OptimizationDivergence(format!("objective is not finite at {:?}", bandwidth)));
    }
    Ok((loss, gradient))
}

/// Projected gradient descent with step length adaption.
pub fn descend(
    objective: &mut dyn Objective,
    search_box: &SearchBox,
    start: &[f64],
    initial_step: f64,
    budget: usize,
) -> Result<SearchResult> {
    let mut current = start.to_vec();
    search_box.project(&mut current);
    let (mut loss, mut gradient) = checked(&current, objective.evaluate(&current)?)?;
    let mut evaluations = 1;
    let mut step = initial_step;
    while evaluations < budget && step > MIN_STEP {
        let largest = gradient.iter().fold(0.0f64, |m, g| m.max(g.abs()));
        if largest == 0.0 {
            break;
        }
        let mut candidate: Vec<f64> = current
            .iter()
            .zip(&gradient)
            .enumerate()
            .map(|(k, (value, g))| value - step * search_box.width(k) * g / largest)
            .collect();
        search_box.project(&mut candidate);
        if candidate == current {
            break;
        }
        let (candidate_loss, candidate_gradient) = checked(&candidate, objective.evaluate(&candidate)?)?;
        evaluations += 1;
        if candidate_loss < loss {
            current = candidate;
            loss = candidate_loss;
            gradient = candidate_gradient;
            step = (2.0 * step).min(1.0);
        } else {
            step *= 0.5;
        }
    }
    Ok(SearchResult { bandwidth: current, loss, evaluations })
}

/// Multi-start search followed by a local refinement of the best start.
pub fn search(
    objective: &mut dyn Objective,
    search_box: &SearchBox,
    representation: BandwidthRepresentation,
    start: &[f64],
    rng: &mut impl Rng,
) -> Result<SearchResult> {
    let mut best = descend(objective, search_box, start, 0.1, EVALUATIONS_PER_START)?;
    let mut evaluations = best.evaluations;
    for _ in 0..RANDOM_STARTS {
        // Uniform in plain bandwidths, the log box would favour tiny values
        let random: Vec<f64> = (0..start.len())
            .map(|k| {
                let lower = representation.decode(search_box.lower[k]);
                let upper = representation.decode(search_box.upper[k]);
                representation.encode(rng.gen_range(lower..=upper))
            })
            .collect();
        let result = descend(objective, search_box, &random, 0.1, EVALUATIONS_PER_START)?;
        evaluations += result.evaluations;
        if result.loss < best.loss {
            best = result;
        }
    }
    let refined = descend(objective, search_box, &best.bandwidth, 0.01, LOCAL_EVALUATIONS)?;
    evaluations += refined.evaluations;
    let best = if refined.loss <= best.loss { refined } else { best };
    Ok(SearchResult { evaluations, ..best })
}

/// Minimizes the error over `training`, starting from the current bandwidth
/// which is expected to be Scott's rule. Writes the result to the device.
pub fn optimize_bandwidth(
    ctx: &DeviceContext,
    config: &KdeConfig,
    estimator: &mut Estimator,
    training: &[TrainingRecord],
    rng: &mut impl Rng,
) -> Result<SearchResult> {
    let model = &estimator.model;
    let representation = model.representation;
    let start = ctx.queue().read_buffer(&model.bandwidth, 0, model.dimensions, &[])?;
    let plain: Vec<f64> = start.iter().map(|v| representation.decode(*v)).collect();
    let search_box = SearchBox::around(representation, &plain);
    let mut objective =
        BatchObjective::prepare(ctx, model, training, config.error_metric, estimator.rows_in_table as f64)?;
    let result = search(&mut objective, &search_box, representation, &start, rng)?;
    let (to_device, to_host) = objective.transfers();

    if result.bandwidth.iter().any(|v| !(representation.decode(*v) > 0.0 && v.is_finite())) {
        return Err(KdeError::OptimizationDivergence(format!("search ended at {:?}", result.bandwidth)));
    }
    ctx.queue().write_buffer(&model.bandwidth, 0, result.bandwidth.clone(), &[])?.wait()?;
    estimator.stats.optimization_transfers_to_device += to_device + 1;
    estimator.stats.optimization_transfers_to_host += to_host + 1;
    Ok(result)
}

/// Installs Scott's rule and, if enabled, optimizes the bandwidth over the
/// latest feedback of the estimator's table.
///
/// Missing feedback and a diverging search are not errors. The bandwidth then
/// stays at Scott's rule.
pub fn reoptimize(
    ctx: &DeviceContext,
    config: &KdeConfig,
    estimator: &mut Estimator,
    feedback: &dyn FeedbackStore,
    rng: &mut impl Rng,
) -> Result<()> {
    let start = Instant::now();
    estimator.sync()?;
    scotts_bandwidth(ctx, &estimator.model, &[])?.wait()?;
    if !config.enable_bandwidth_optimization {
        return Ok(());
    }

    let table = estimator.table;
    let records = feedback.latest(table, config.feedback_window)?;
    let training = training_set(&estimator.model, &records);
    if training.is_empty() {
        tracing::info!(table, records = records.len(), "{}, keeping Scott's rule", KdeError::FeedbackUnavailable { table });
        return Ok(());
    }

    let scott = ctx.queue().read_buffer(&estimator.model.bandwidth, 0, estimator.model.dimensions, &[])?;
    match optimize_bandwidth(ctx, config, estimator, &training, rng) {
        Ok(result) => {
            tracing::info!(
                table,
                records = training.len(),
                loss = result.loss,
                evaluations = result.evaluations,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "optimized bandwidth"
            );
            Ok(())
        }
        Err(err @ KdeError::OptimizationDivergence(_)) => {
            tracing::warn!(table, "{}, keeping Scott's rule", err);
            ctx.queue().write_buffer(&estimator.model.bandwidth, 0, scott, &[])?.wait()
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod test {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;
    use crate::config::KdeConfig;
    use crate::device::test::test_context;
    use crate::estimator::request::RangeRequest;
    use crate::estimator::test::{gaussian_points, test_estimator};
    use crate::registry::store::MockFeedbackStore;

    // Test estimators are built from gaussian_points(n, 2, 3) over columns 0 and 2
    fn feedback(count: usize, seed: u64) -> Vec<FeedbackRecord> {
        let data = gaussian_points(4000, 2, 17);
        let mut rng = StdRng::seed_from_u64(seed);
        (0..count)
            .map(|_| {
                let lower = rng.gen_range(-3.0..2.0);
                let upper = lower + rng.gen_range(0.2..1.0);
                let qualified = data.iter().filter(|p| p[0] >= lower && p[0] <= upper).count() as u64;
                let request = RangeRequest::new(1).between(0, lower, upper);
                FeedbackRecord::new(&request, qualified, data.len() as u64).unwrap()
            })
            .collect()
    }

    fn store_with(records: Vec<FeedbackRecord>) -> MockFeedbackStore {
        let mut store = MockFeedbackStore::new();
        store.expect_latest().returning(move |_, _| Ok(records.clone()));
        store
    }

    #[test]
    fn scotts_rule_follows_sample_variance() {
        let ctx = test_context();
        let config = KdeConfig::default();
        let mut estimator = test_estimator(&ctx, &config, 100);
        // Spread out the first dimension without touching the normalization
        for i in 0..50 {
            estimator.push_sample_point(&ctx, i, &[if i % 2 == 0 { 9.0 } else { -9.0 }, 15.0]).unwrap();
        }
        scotts_bandwidth(&ctx, estimator.model(), &[]).unwrap().wait().unwrap();
        let bandwidth = estimator.bandwidth(&ctx).unwrap();
        let sample = estimator.denormalized_sample(&ctx).unwrap();
        let model = estimator.model();
        for k in 0..2 {
            let values: Vec<f64> = sample.iter().map(|p| (p[k] - model.host_mean()[k]) / model.host_sdev()[k]).collect();
            let mean = values.iter().sum::<f64>() / 100.0;
            let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / 99.0;
            let expected = variance.sqrt() * 100f64.powf(-1.0 / 6.0);
            assert!((bandwidth[k] - expected).abs() < 1e-9, "dimension {}: {} vs {}", k, bandwidth[k], expected);
        }
        assert!(bandwidth[0] > bandwidth[1]);
    }

    #[test]
    fn disabled_optimization_only_installs_scotts_rule() {
        let ctx = test_context();
        let config = KdeConfig::default().with_bandwidth_optimization(false, None);
        let mut estimator = test_estimator(&ctx, &config, 64);
        let scott = estimator.bandwidth(&ctx).unwrap();
        estimator.set_bandwidth(&ctx, &[5.0, 5.0]).unwrap();

        let mut store = MockFeedbackStore::new();
        store.expect_latest().never();
        reoptimize(&ctx, &config, &mut estimator, &store, &mut StdRng::seed_from_u64(1)).unwrap();
        assert_eq!(estimator.bandwidth(&ctx).unwrap(), scott);
    }

    #[test]
    fn empty_feedback_keeps_scotts_rule() {
        let ctx = test_context();
        let config = KdeConfig::default().with_bandwidth_optimization(true, Some(50));
        let mut estimator = test_estimator(&ctx, &config, 64);
        let scott = estimator.bandwidth(&ctx).unwrap();
        estimator.set_bandwidth(&ctx, &[0.01, 3.0]).unwrap();

        let mut store = MockFeedbackStore::new();
        store
            .expect_latest()
            .withf(|table, limit| *table == 1 && *limit == Some(50))
            .times(1)
            .returning(|_, _| Ok(Vec::new()));
        reoptimize(&ctx, &config, &mut estimator, &store, &mut StdRng::seed_from_u64(1)).unwrap();
        let bandwidth = estimator.bandwidth(&ctx).unwrap();
        assert_eq!(bandwidth, scott);
        assert!(bandwidth.iter().all(|h| *h > 0.0));
        assert_eq!(estimator.stats().optimization_transfers_to_device, 0);
    }

    #[test]
    fn unusable_feedback_is_skipped() {
        let ctx = test_context();
        let config = KdeConfig::default();
        let estimator = test_estimator(&ctx, &config, 32);
        let foreign = FeedbackRecord::new(&RangeRequest::new(1).less_than(1, 0.0), 3, 10).unwrap();
        let empty_scan = FeedbackRecord::new(&RangeRequest::new(1).less_than(0, 0.0), 0, 0).unwrap();
        let good = FeedbackRecord::new(&RangeRequest::new(1).between(2, 9.0, 11.0), 2, 8).unwrap();
        let training = training_set(estimator.model(), &[foreign, empty_scan, good]);
        assert_eq!(training.len(), 1);
        assert_eq!(training[0].selectivity, 0.25);
        // Dimension 0 unconstrained, dimension 1 normalized
        assert_eq!(training[0].bounds[0], f64::NEG_INFINITY);
        let model = estimator.model();
        let expected = (9.0 - 0.001 - model.host_mean()[1]) / model.host_sdev()[1];
        assert!((training[0].bounds[2] - expected).abs() < 1e-12);
    }

    #[test]
    fn objective_gradient_matches_finite_differences() {
        let ctx = test_context();
        let config = KdeConfig::default();
        let estimator = test_estimator(&ctx, &config, 64);
        let model = estimator.model();
        let training = training_set(model, &feedback(20, 5));
        let mut objective = BatchObjective::prepare(&ctx, model, &training, ErrorMetric::Quadratic, 4000.0).unwrap();
        let at = [-0.7, 0.1];
        let (_, gradient) = objective.evaluate(&at).unwrap();
        let eps = 1e-5;
        for k in 0..2 {
            let (mut up, mut down) = (at, at);
            up[k] += eps;
            down[k] -= eps;
            let numeric = (objective.evaluate(&up).unwrap().0 - objective.evaluate(&down).unwrap().0) / (2.0 * eps);
            assert!((gradient[k] - numeric).abs() < 1e-6, "dimension {}: {} vs {}", k, gradient[k], numeric);
        }
        // Records once, then the bandwidth of each of the five evaluations
        assert_eq!(objective.transfers(), (6, 5));
    }

    #[test]
    fn optimization_lowers_the_loss() {
        let ctx = test_context();
        let config = KdeConfig::default()
            .with_bandwidth_representation(BandwidthRepresentation::Log)
            .with_bandwidth_optimization(true, None);
        let mut estimator = test_estimator(&ctx, &config, 128);
        let records = feedback(60, 9);
        let training = training_set(estimator.model(), &records);
        let scott = estimator.bandwidth(&ctx).unwrap();
        let stored: Vec<f64> = scott.iter().map(|h| h.ln()).collect();
        let before = BatchObjective::prepare(&ctx, estimator.model(), &training, config.error_metric, 1280.0)
            .unwrap()
            .evaluate(&stored)
            .unwrap()
            .0;

        let store = store_with(records);
        reoptimize(&ctx, &config, &mut estimator, &store, &mut StdRng::seed_from_u64(3)).unwrap();
        let bandwidth = estimator.bandwidth(&ctx).unwrap();
        let stored: Vec<f64> = bandwidth.iter().map(|h| h.ln()).collect();
        let after = BatchObjective::prepare(&ctx, estimator.model(), &training, config.error_metric, 1280.0)
            .unwrap()
            .evaluate(&stored)
            .unwrap()
            .0;
        assert!(after < before, "before {} after {}", before, after);
        assert!(bandwidth.iter().all(|h| *h > 0.0 && *h <= 4.0 * scott[0].max(scott[1]) + 1e-9), "{:?}", bandwidth);
        assert!(estimator.stats().optimization_transfers_to_host > 0);
    }

    #[test]
    fn descent_finds_minimum_in_box() {
        struct Bowl;
        impl Objective for Bowl {
            fn evaluate(&mut self, x: &[f64]) -> Result<(f64, Vec<f64>)> {
                let loss = (x[0] - 0.3).powi(2) + (x[1] - 2.0).powi(2);
                Ok((loss, vec![2.0 * (x[0] - 0.3), 2.0 * (x[1] - 2.0)]))
            }
        }
        let search_box = SearchBox { lower: vec![0.0, 0.0], upper: vec![1.0, 1.0] };
        let result = descend(&mut Bowl, &search_box, &[0.9, 0.1], 0.1, 200).unwrap();
        // The second coordinate ends up on the boundary
        assert!((result.bandwidth[0] - 0.3).abs() < 1e-3, "{:?}", result);
        assert_eq!(result.bandwidth[1], 1.0);
        assert!(result.evaluations <= 200);
    }

    #[test]
    fn diverging_objective_is_reported() {
        let mut objective = MockObjective::new();
        objective.expect_evaluate().returning(|x| Ok((f64::NAN, vec![0.0; x.len()])));
        let search_box = SearchBox::around(BandwidthRepresentation::Plain, &[1.0]);
        let result = search(
            &mut objective,
            &search_box,
            BandwidthRepresentation::Plain,
            &[1.0],
            &mut StdRng::seed_from_u64(0),
        );
        assert!(matches!(result, Err(KdeError::OptimizationDivergence(_))));
    }

    #[test]
    fn random_starts_stay_in_box() {
        let mut objective = MockObjective::new();
        objective.expect_evaluate().returning(|x| {
            assert!(x.iter().all(|v| (MIN_BANDWIDTH.ln()..=(8.0f64).ln() + 1e-12).contains(v)), "{:?}", x);
            Ok((1.0, vec![0.0; x.len()]))
        });
        let search_box = SearchBox::around(BandwidthRepresentation::Log, &[2.0, 0.5]);
        let result = search(
            &mut objective,
            &search_box,
            BandwidthRepresentation::Log,
            &[2f64.ln(), 0.5f64.ln()],
            &mut StdRng::seed_from_u64(0),
        )
        .unwrap();
        // Flat objective, every start stops after its first evaluation
        assert_eq!(result.evaluations, 1 + RANDOM_STARTS + 1);
        assert_eq!(result.bandwidth, vec![2f64.ln(), 0.5f64.ln()]);
    }
}
