use std::sync::Arc;

use crate::config::{BandwidthRepresentation, KernelType};
use crate::device::reduction::SumDescriptor;
use crate::device::{CommandQueue, DeviceBuffer, DeviceContext, Event, Kernel, MAX_DIMENSIONS};
use crate::error::Result;
use crate::estimator::KdeModel;
use crate::evaluation::{contribution, contribution_gradient};

/// Computes the contribution of one normalized point to the query box and the
/// derivative of that contribution with respect to each bandwidth value as it
/// is stored (so times `h` for log bandwidths).
///
/// Returns the contribution, the derivatives go to `partials`.
pub fn partial_gradient(
    kernel_type: KernelType,
    representation: BandwidthRepresentation,
    point: &[f64],
    bounds: &[f64],
    bandwidth: &[f64],
    partials: &mut [f64],
) -> f64 {
    let d = point.len();
    let mut factors = [0.0; MAX_DIMENSIONS];
    let mut derivatives = [0.0; MAX_DIMENSIONS];
    for k in 0..d {
        let h = representation.decode(bandwidth[k]);
        factors[k] = contribution(kernel_type, bounds[2 * k], bounds[2 * k + 1], point[k], h);
        derivatives[k] = contribution_gradient(kernel_type, bounds[2 * k], bounds[2 * k + 1], point[k], h);
        if representation == BandwidthRepresentation::Log {
            derivatives[k] *= h;
        }
    }
    // Product of all other factors. Dividing the full product would break on
    // zero factors.
    for k in 0..d {
        let mut partial = derivatives[k];
        for (j, factor) in factors[..d].iter().enumerate() {
            if j != k {
                partial *= factor;
            }
        }
        partials[k] = partial;
    }
    factors[..d].iter().product()
}

/// Per point gradients of the current estimate for some bandwidth buffer,
/// reduced to one sum per dimension plus the sum of the contributions.
///
/// After `run`, `sums()[k]` holds the sum of the derivatives for dimension `k`
/// and `sums()[D]` the sum of the contributions at that bandwidth.
pub struct GradientProgram {
    kernel: Arc<Kernel>,
    dimensions: usize,
    points: usize,
    kernel_type: KernelType,
    representation: BandwidthRepresentation,
    sample: DeviceBuffer<f64>,
    mean: DeviceBuffer<f64>,
    sdev: DeviceBuffer<f64>,
    input: DeviceBuffer<f64>,
    bandwidth: DeviceBuffer<f64>,
    contributions: DeviceBuffer<f64>,
    // dimension major, D * N
    partials: DeviceBuffer<f64>,
    sums: DeviceBuffer<f64>,
    reductions: Vec<SumDescriptor>,
}

impl GradientProgram {
    pub fn prepare(ctx: &DeviceContext, model: &KdeModel, bandwidth: &DeviceBuffer<f64>) -> Result<GradientProgram> {
        let kernel = ctx.kernel("compute_partial_gradient", model.build_options())?;
        let (d, n) = (model.dimensions, model.points);
        let contributions = ctx.create_buffer::<f64>(n)?;
        let partials = ctx.create_buffer::<f64>(d * n)?;
        let sums = ctx.create_buffer::<f64>(d + 1)?;
        let mut reductions = Vec::with_capacity(d + 1);
        for k in 0..d {
            reductions.push(SumDescriptor::prepare(ctx, &partials, k * n, n, &sums, k)?);
        }
        reductions.push(SumDescriptor::prepare(ctx, &contributions, 0, n, &sums, d)?);
        Ok(GradientProgram {
            kernel,
            dimensions: d,
            points: n,
            kernel_type: model.kernel_type,
            representation: model.representation,
            sample: model.sample.clone(),
            mean: model.mean.clone(),
            sdev: model.sdev.clone(),
            input: model.input.clone(),
            bandwidth: bandwidth.clone(),
            contributions,
            partials,
            sums,
            reductions,
        })
    }

    pub fn sums(&self) -> &DeviceBuffer<f64> {
        &self.sums
    }

    /// Returns the events of all reductions, the sums are ready once they are.
    pub fn run(&self, queue: &CommandQueue, wait_list: &[Event]) -> Result<Vec<Event>> {
        let (d, n) = (self.dimensions, self.points);
        let (kernel_type, representation) = (self.kernel_type, self.representation);
        let (sample, mean, sdev) = (self.sample.clone(), self.mean.clone(), self.sdev.clone());
        let (input, bandwidth) = (self.input.clone(), self.bandwidth.clone());
        let (contributions, partials) = (self.contributions.clone(), self.partials.clone());
        let gradient = queue.enqueue_kernel(&self.kernel, n, wait_list, move |i| {
            let mut point = [0.0; MAX_DIMENSIONS];
            let mut partial = [0.0; MAX_DIMENSIONS];
            let value = {
                let (sample, mean, sdev) = (sample.read(), mean.read(), sdev.read());
                for k in 0..d {
                    point[k] = (sample[i * d + k] - mean[k]) / sdev[k];
                }
                partial_gradient(
                    kernel_type,
                    representation,
                    &point[..d],
                    &input.read(),
                    &bandwidth.read(),
                    &mut partial[..d],
                )
            };
            contributions.write()[i] = value;
            let mut partials = partials.write();
            for k in 0..d {
                partials[k * n + i] = partial[k];
            }
        })?;
        self.reductions.iter().map(|r| r.run(queue, &[gradient.clone()])).collect()
    }
}
