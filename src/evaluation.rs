/*
    Range query evaluation.

    For every sample point the kde kernel integrates the point's kernel over
    the query box. The box is the product of per dimension intervals, so is the
    integral. Summing the per point results and scaling by the kernel's
    normalization over the sample size gives the selectivity.

    Gaussian:      F = erf(b / sqrt(2)) - erf(a / sqrt(2))           scale 2^-D
    Epanechnikov:  F = G(b) - G(a), G(t) = c - c^3 / 3, c = clamp(t)  scale 0.75^D

    with a = (lower - x) / h and b = (upper - x) / h in normalized units.
*/
use std::f64::consts::{PI, SQRT_2};
use std::time::Instant;

use statrs::function::erf::erf;

use crate::config::KernelType;
use crate::device::{DeviceContext, Event};
use crate::error::Result;
use crate::estimator::request::RangeRequest;
use crate::estimator::{Estimator, KdeModel};

pub fn normalization_constant(kernel_type: KernelType, dimensions: usize) -> f64 {
    match kernel_type {
        KernelType::Gaussian => 0.5f64.powi(dimensions as i32),
        KernelType::Epanechnikov => 0.75f64.powi(dimensions as i32),
    }
}

fn gaussian_cdf_term(t: f64) -> f64 {
    if t == f64::INFINITY {
        1.0
    } else if t == f64::NEG_INFINITY {
        -1.0
    } else {
        erf(t / SQRT_2)
    }
}

fn epanechnikov_term(t: f64) -> f64 {
    let c = t.clamp(-1.0, 1.0);
    c - c * c * c / 3.0
}

/// The unscaled mass of one kernel centered at `x` inside `[lower, upper]`.
pub fn contribution(kernel_type: KernelType, lower: f64, upper: f64, x: f64, h: f64) -> f64 {
    let a = (lower - x) / h;
    let b = (upper - x) / h;
    match kernel_type {
        KernelType::Gaussian => gaussian_cdf_term(b) - gaussian_cdf_term(a),
        KernelType::Epanechnikov => epanechnikov_term(b) - epanechnikov_term(a),
    }
}

/// Derivative of `contribution` with respect to the plain bandwidth `h`.
pub fn contribution_gradient(kernel_type: KernelType, lower: f64, upper: f64, x: f64, h: f64) -> f64 {
    let a = (lower - x) / h;
    let b = (upper - x) / h;
    match kernel_type {
        KernelType::Gaussian => {
            // t * exp(-t^2 / 2) vanishes for infinite bounds
            let term = |t: f64| if t.is_finite() { t * (-0.5 * t * t).exp() } else { 0.0 };
            SQRT_2 / (PI.sqrt() * h) * (term(a) - term(b))
        }
        KernelType::Epanechnikov => {
            let term = |t: f64| if t.abs() < 1.0 { (1.0 - t * t) * t } else { 0.0 };
            (term(a) - term(b)) / h
        }
    }
}

/// Schedules the kde kernel, writing one contribution per sample point into
/// `local_results`. Expects normalized bounds in `input`.
pub fn local_contributions(ctx: &DeviceContext, model: &KdeModel, wait_list: &[Event]) -> Result<Event> {
    let kernel = ctx.kernel("kde", model.build_options())?;
    let d = model.dimensions;
    let kernel_type = model.kernel_type;
    let representation = model.representation;
    let (sample, mean, sdev) = (model.sample.clone(), model.mean.clone(), model.sdev.clone());
    let (bandwidth, input, local_results) = (model.bandwidth.clone(), model.input.clone(), model.local_results.clone());
    ctx.queue().enqueue_kernel(&kernel, model.points, wait_list, move |i| {
        let value = {
            let (sample, mean, sdev) = (sample.read(), mean.read(), sdev.read());
            let (bandwidth, input) = (bandwidth.read(), input.read());
            let mut value = 1.0;
            for k in 0..d {
                let x = (sample[i * d + k] - mean[k]) / sdev[k];
                let h = representation.decode(bandwidth[k]);
                value *= contribution(kernel_type, input[2 * k], input[2 * k + 1], x, h);
            }
            value
        };
        local_results.write()[i] = value;
    })
}

/// Estimates the selectivity of `request`.
///
/// This opens an estimation: the estimator remembers the result and the request
/// until the true selectivity is reported. It also schedules the gradient work
/// of the online optimizer, which runs while the caller goes on with planning.
pub fn evaluate(ctx: &DeviceContext, estimator: &mut Estimator, request: &RangeRequest) -> Result<f64> {
    let start = Instant::now();
    let model = &estimator.model;
    let mut bounds = request.bounds(&model.columns)?;
    model.normalize_bounds(&mut bounds);

    let queue = ctx.queue();
    // The bandwidth may still be written by the last online update, and the
    // previous estimation may still read the bounds
    let mut wait_list: Vec<Event> = estimator.pending_optimization.take().into_iter().collect();
    wait_list.extend(std::mem::take(&mut estimator.in_flight));
    wait_list.extend(estimator.online.as_ref().and_then(|o| o.last_event()));
    let transfer = queue.write_buffer(&model.input, 0, bounds, &wait_list)?;
    estimator.stats.estimation_transfers_to_device += 1;

    let kde = local_contributions(ctx, model, &[transfer.clone()])?;
    let sum = estimator.estimate_sum.run(queue, &[kde.clone()])?;
    let finalize = ctx.kernel("finalize_estimate", model.build_options())?;
    let scale = model.normalization() / model.points as f64;
    let result = model.result.clone();
    let finalized = queue.enqueue_kernel(&finalize, 1, &[sum], move |_| {
        let mut result = result.write();
        result[0] = (result[0] * scale).clamp(0.0, 1.0);
    })?;
    let selectivity = queue.read_buffer(&model.result, 0, 1, &[finalized])?[0];
    estimator.stats.estimation_transfers_to_host += 1;

    estimator.open_estimation = true;
    estimator.last_selectivity = selectivity;
    estimator.last_request = Some(request.clone());
    estimator.in_flight = vec![kde];

    if let Some(online) = estimator.online.as_mut() {
        let events = online.prepare_step(ctx, &estimator.model, &[transfer])?;
        estimator.in_flight.extend(events);
    }
    tracing::debug!(
        table = estimator.table,
        selectivity,
        elapsed_us = start.elapsed().as_micros() as u64,
        "estimated selectivity"
    );
    Ok(selectivity)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{BandwidthRepresentation, KdeConfig};
    use crate::device::test::test_context;
    use crate::error::KdeError;
    use crate::estimator::test::test_estimator;

    #[test]
    fn gaussian_contribution_limits() {
        let inf = f64::INFINITY;
        assert_eq!(contribution(KernelType::Gaussian, -inf, inf, 0.3, 0.5), 2.0);
        assert!(contribution(KernelType::Gaussian, 10.0, inf, 0.0, 0.5).abs() < 1e-12);
        // Half of the mass is right of the center
        let half = contribution(KernelType::Gaussian, 1.0, inf, 1.0, 0.2);
        assert!((half - 1.0).abs() < 1e-12, "{}", half);
    }

    #[test]
    fn epanechnikov_contribution_limits() {
        let inf = f64::INFINITY;
        let full = contribution(KernelType::Epanechnikov, -inf, inf, 0.0, 1.0);
        assert!((full - 4.0 / 3.0).abs() < 1e-12);
        // Scaled by 0.75 the full kernel integrates to one
        assert!((0.75 * full - 1.0).abs() < 1e-12);
        assert_eq!(contribution(KernelType::Epanechnikov, 2.0, 3.0, 0.0, 1.0), 0.0);
    }

    #[test]
    fn gradients_match_finite_differences() {
        let eps = 1e-6;
        for kernel_type in [KernelType::Gaussian, KernelType::Epanechnikov] {
            for (lower, upper, x, h) in [(-0.5, 0.7, 0.1, 0.4), (0.2, f64::INFINITY, -0.3, 0.9), (-1.0, 0.0, 0.5, 1.3)] {
                let analytic = contribution_gradient(kernel_type, lower, upper, x, h);
                let numeric = (contribution(kernel_type, lower, upper, x, h + eps)
                    - contribution(kernel_type, lower, upper, x, h - eps))
                    / (2.0 * eps);
                assert!((analytic - numeric).abs() < 1e-5, "{:?}: {} vs {}", kernel_type, analytic, numeric);
            }
        }
    }

    #[test]
    fn unconstrained_request_selects_everything() {
        let ctx = test_context();
        for kernel_type in [KernelType::Gaussian, KernelType::Epanechnikov] {
            let config = KdeConfig::default().with_kernel_type(kernel_type);
            let mut estimator = test_estimator(&ctx, &config, 128);
            let selectivity = evaluate(&ctx, &mut estimator, &RangeRequest::new(1)).unwrap();
            assert!((selectivity - 1.0).abs() < 1e-9, "{:?}: {}", kernel_type, selectivity);
            assert!(estimator.has_open_estimation());
            assert_eq!(estimator.last_selectivity(), selectivity);
        }
    }

    #[test]
    fn request_outside_sample_selects_nothing() {
        let ctx = test_context();
        let config = KdeConfig::default();
        let mut estimator = test_estimator(&ctx, &config, 128);
        // Dimension 0 of the test sample lies in [-3, 3]
        let request = RangeRequest::new(1).greater_than(0, 1000.0);
        let selectivity = evaluate(&ctx, &mut estimator, &request).unwrap();
        assert!(selectivity < 1e-9, "{}", selectivity);
    }

    #[test]
    fn narrow_bandwidth_counts_points() {
        let ctx = test_context();
        let config = KdeConfig::default()
            .with_bandwidth_representation(BandwidthRepresentation::Plain)
            .without_adaptive_bandwidth();
        let mut estimator = test_estimator(&ctx, &config, 200);
        estimator.set_bandwidth(&ctx, &[1e-6, 1e-6]).unwrap();
        let sample = estimator.denormalized_sample(&ctx).unwrap();
        let expected = sample.iter().filter(|p| p[0] > 0.0 && p[1] < 11.0).count() as f64 / 200.0;
        let request = RangeRequest::new(1).greater_than(0, 0.0).less_than(2, 11.0);
        let selectivity = evaluate(&ctx, &mut estimator, &request).unwrap();
        assert!((selectivity - expected).abs() < 1e-6, "{} vs {}", selectivity, expected);
    }

    #[test]
    fn rejects_unmonitored_columns() {
        let ctx = test_context();
        let mut estimator = test_estimator(&ctx, &KdeConfig::default(), 16);
        let request = RangeRequest::new(1).less_than(1, 0.0);
        assert!(matches!(evaluate(&ctx, &mut estimator, &request), Err(KdeError::UnanswerableRequest(_))));
        assert!(!estimator.has_open_estimation());
    }

    #[test]
    fn counts_transfers() {
        let ctx = test_context();
        let mut estimator = test_estimator(&ctx, &KdeConfig::default(), 16);
        for _ in 0..3 {
            evaluate(&ctx, &mut estimator, &RangeRequest::new(1).between(0, -1.0, 1.0)).unwrap();
        }
        let stats = estimator.stats();
        assert_eq!(stats.estimation_transfers_to_device, 3);
        assert_eq!(stats.estimation_transfers_to_host, 3);
    }
}
