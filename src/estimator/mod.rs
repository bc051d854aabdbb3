/*
    The per-table kernel density model.

    The sample lives on the device as N rows of D raw coordinates. Each
    dimension gets zero-centered and unit-scaled with the mean and standard
    deviation computed when the sample was drawn. The kernels apply that
    normalization whenever they read a point, and query bounds get the same
    treatment on the host before they are transferred. Storing the raw values
    means a saved model comes back without any rounding, so evaluating the same
    request before and after a save/load cycle gives the identical result.

    The bandwidth vector is kept in the configured representation, either the
    plain value or its natural logarithm.
*/
pub mod columns;
pub mod request;
pub mod snapshot;
pub mod stats;

use std::io::{BufRead, Write};
use std::time::Instant;

use itertools::Itertools;

use crate::config::{BandwidthRepresentation, KdeConfig, KernelType};
use crate::device::reduction::SumDescriptor;
use crate::device::{BuildOptions, DeviceBuffer, DeviceContext, DeviceInfo, Event};
use crate::error::{KdeError, Result};
use crate::optimizer::{self, OnlineOptimizer};

use columns::ColumnSet;
use request::RangeRequest;
use snapshot::ModelSnapshot;
use stats::EstimatorStats;

pub type TableId = u32;

/// A table row, indexed by column number.
pub type Row = Vec<f64>;

/// Standard deviations at or below this are treated as 1.
const MIN_SDEV: f64 = 10e-10;

/// Computes the per dimension mean and standard deviation of a row major sample.
pub fn normalize_sample(sample: &[f64], dimensions: usize) -> (Vec<f64>, Vec<f64>) {
    let n = sample.len() / dimensions.max(1);
    let mut mean = vec![0.0; dimensions];
    let mut sdev = vec![0.0; dimensions];
    if n == 0 {
        return (mean, vec![1.0; dimensions]);
    }
    for point in sample.chunks_exact(dimensions) {
        for (d, value) in point.iter().enumerate() {
            mean[d] += value;
        }
    }
    mean.iter_mut().for_each(|m| *m /= n as f64);
    for point in sample.chunks_exact(dimensions) {
        for (d, value) in point.iter().enumerate() {
            sdev[d] += (value - mean[d]).powi(2);
        }
    }
    let denominator = (n.max(2) - 1) as f64;
    for s in sdev.iter_mut() {
        *s = (*s / denominator).sqrt();
        if *s <= MIN_SDEV {
            *s = 1.0;
        }
    }
    (mean, sdev)
}

/// How many points of the given dimensionality the device can hold, capped at
/// the configured sample size.
pub fn max_sample_size(info: &DeviceInfo, dimensions: usize, configured: usize) -> usize {
    let bytes_per_point = (dimensions + 1) * std::mem::size_of::<f64>();
    configured.min(info.max_alloc_size / bytes_per_point)
}

/// The device buffers of a model, shared by evaluation, the optimizers and
/// sample maintenance.
pub struct KdeModel {
    pub columns: ColumnSet,
    pub dimensions: usize,
    pub points: usize,
    pub kernel_type: KernelType,
    pub representation: BandwidthRepresentation,
    /// `points * dimensions` raw coordinates, row major
    pub sample: DeviceBuffer<f64>,
    pub karma: DeviceBuffer<f64>,
    pub mean: DeviceBuffer<f64>,
    pub sdev: DeviceBuffer<f64>,
    pub bandwidth: DeviceBuffer<f64>,
    /// Normalized query bounds, `[lower_0, upper_0, lower_1, ...]`
    pub input: DeviceBuffer<f64>,
    pub local_results: DeviceBuffer<f64>,
    pub result: DeviceBuffer<f64>,
    host_mean: Vec<f64>,
    host_sdev: Vec<f64>,
}

impl KdeModel {
    fn allocate(
        ctx: &DeviceContext,
        config: &KdeConfig,
        columns: ColumnSet,
        sample: Vec<f64>,
        karma: Vec<f64>,
        mean: Vec<f64>,
        sdev: Vec<f64>,
        bandwidth: Vec<f64>,
    ) -> Result<KdeModel> {
        let dimensions = columns.len();
        let points = karma.len();
        Ok(KdeModel {
            columns,
            dimensions,
            points,
            kernel_type: config.kernel_type,
            representation: config.bandwidth_representation,
            sample: ctx.create_buffer_from(sample)?,
            karma: ctx.create_buffer_from(karma)?,
            mean: ctx.create_buffer_from(mean.clone())?,
            sdev: ctx.create_buffer_from(sdev.clone())?,
            bandwidth: ctx.create_buffer_from(bandwidth)?,
            input: ctx.create_buffer::<f64>(2 * dimensions)?,
            local_results: ctx.create_buffer::<f64>(points)?,
            result: ctx.create_buffer::<f64>(1)?,
            host_mean: mean,
            host_sdev: sdev,
        })
    }

    pub fn build_options(&self) -> BuildOptions {
        BuildOptions::for_model(self.dimensions, self.kernel_type, self.representation)
    }

    /// 2^-D for the Gaussian kernel, 0.75^D for Epanechnikov.
    pub fn normalization(&self) -> f64 {
        crate::evaluation::normalization_constant(self.kernel_type, self.dimensions)
    }

    /// Applies the sample normalization to a bound vector laid out like `input`.
    pub fn normalize_bounds(&self, bounds: &mut [f64]) {
        for (i, bound) in bounds.iter_mut().enumerate() {
            let d = i / 2;
            *bound = (*bound - self.host_mean[d]) / self.host_sdev[d];
        }
    }

    pub fn host_mean(&self) -> &[f64] {
        &self.host_mean
    }

    pub fn host_sdev(&self) -> &[f64] {
        &self.host_sdev
    }
}

pub struct Estimator {
    pub(crate) table: TableId,
    pub(crate) model: KdeModel,
    pub(crate) rows_in_table: u64,
    pub(crate) estimate_sum: SumDescriptor,
    pub(crate) online: Option<Box<dyn OnlineOptimizer>>,
    /// Last bandwidth write of an online update, evaluation has to wait for it.
    pub(crate) pending_optimization: Option<Event>,
    /// Commands that still read the sample.
    pub(crate) in_flight: Vec<Event>,
    pub(crate) open_estimation: bool,
    pub(crate) last_selectivity: f64,
    pub(crate) last_request: Option<RangeRequest>,
    pub(crate) stats: EstimatorStats,
}

impl Estimator {
    /// Builds a fresh model from already projected sample points and installs
    /// the rule-of-thumb bandwidth.
    pub fn build(
        ctx: &DeviceContext,
        config: &KdeConfig,
        table: TableId,
        columns: ColumnSet,
        points: &[Vec<f64>],
        rows_in_table: u64,
    ) -> Result<Estimator> {
        let dimensions = columns.len();
        if dimensions == 0 {
            return Err(KdeError::InvalidArgument("a model needs at least one column".into()));
        }
        if points.is_empty() {
            return Err(KdeError::InvalidArgument(format!("no sample points for table {}", table)));
        }
        if let Some(bad) = points.iter().find(|p| p.len() != dimensions) {
            return Err(KdeError::InvalidArgument(format!(
                "sample point with {} values for a model over {} columns",
                bad.len(),
                dimensions
            )));
        }
        let sample: Vec<f64> = points.iter().flatten().copied().collect();
        let (mean, sdev) = normalize_sample(&sample, dimensions);
        let karma = vec![0.0; points.len()];
        let model = KdeModel::allocate(ctx, config, columns, sample, karma, mean, sdev, vec![0.0; dimensions])?;
        let mut estimator = Estimator::assemble(ctx, config, table, model, rows_in_table)?;
        optimizer::batch::scotts_bandwidth(ctx, &estimator.model, &[])?.wait()?;
        tracing::info!(
            table,
            columns = %columns,
            points = estimator.model.points,
            "built estimator"
        );
        estimator.stats.maintenance_transfers_to_device += 1;
        Ok(estimator)
    }

    pub fn from_snapshot(ctx: &DeviceContext, config: &KdeConfig, snapshot: ModelSnapshot) -> Result<Estimator> {
        snapshot.validate()?;
        let mut bandwidth = snapshot.bandwidth;
        if snapshot.representation != config.bandwidth_representation {
            for value in bandwidth.iter_mut() {
                *value = config.bandwidth_representation.encode(snapshot.representation.decode(*value));
            }
        }
        let model = KdeModel::allocate(
            ctx,
            config,
            snapshot.columns,
            snapshot.sample,
            snapshot.karma,
            snapshot.mean,
            snapshot.sdev,
            bandwidth,
        )?;
        tracing::debug!(table = snapshot.table, points = model.points, "restored estimator");
        Estimator::assemble(ctx, config, snapshot.table, model, snapshot.rows_in_table)
    }

    fn assemble(
        ctx: &DeviceContext,
        config: &KdeConfig,
        table: TableId,
        model: KdeModel,
        rows_in_table: u64,
    ) -> Result<Estimator> {
        let estimate_sum = SumDescriptor::prepare(ctx, &model.local_results, 0, model.points, &model.result, 0)?;
        let online = if config.enable_adaptive_bandwidth {
            Some(optimizer::online::create(ctx, config, &model)?)
        } else {
            None
        };
        Ok(Estimator {
            table,
            model,
            rows_in_table,
            estimate_sum,
            online,
            pending_optimization: None,
            in_flight: Vec::new(),
            open_estimation: false,
            last_selectivity: 0.0,
            last_request: None,
            stats: EstimatorStats::default(),
        })
    }

    pub fn to_snapshot(&mut self, ctx: &DeviceContext) -> Result<ModelSnapshot> {
        self.sync()?;
        let queue = ctx.queue();
        let model = &self.model;
        Ok(ModelSnapshot {
            table: self.table,
            columns: model.columns,
            rows_in_table: self.rows_in_table,
            rows_in_sample: model.points as u64,
            representation: model.representation,
            bandwidth: queue.read_buffer(&model.bandwidth, 0, model.dimensions, &[])?,
            sample: queue.read_buffer(&model.sample, 0, model.points * model.dimensions, &[])?,
            karma: queue.read_buffer(&model.karma, 0, model.points, &[])?,
            mean: queue.read_buffer(&model.mean, 0, model.dimensions, &[])?,
            sdev: queue.read_buffer(&model.sdev, 0, model.dimensions, &[])?,
        })
    }

    /// Waits for everything this estimator has scheduled so far.
    pub fn sync(&mut self) -> Result<()> {
        if let Some(pending) = self.pending_optimization.take() {
            pending.wait()?;
        }
        let in_flight = std::mem::take(&mut self.in_flight);
        Event::wait_all(&in_flight)
    }

    pub fn table(&self) -> TableId {
        self.table
    }

    pub fn column_set(&self) -> ColumnSet {
        self.model.columns
    }

    pub fn dimensions(&self) -> usize {
        self.model.dimensions
    }

    pub fn sample_size(&self) -> usize {
        self.model.points
    }

    pub fn rows_in_table(&self) -> u64 {
        self.rows_in_table
    }

    pub fn stats(&self) -> EstimatorStats {
        self.stats
    }

    pub fn model(&self) -> &KdeModel {
        &self.model
    }

    pub fn has_open_estimation(&self) -> bool {
        self.open_estimation
    }

    pub fn last_selectivity(&self) -> f64 {
        self.last_selectivity
    }

    pub fn last_request(&self) -> Option<&RangeRequest> {
        self.last_request.as_ref()
    }

    /// The bandwidth in plain form, whatever the device representation is.
    pub fn bandwidth(&mut self, ctx: &DeviceContext) -> Result<Vec<f64>> {
        self.sync()?;
        let stored = ctx.queue().read_buffer(&self.model.bandwidth, 0, self.model.dimensions, &[])?;
        Ok(stored.into_iter().map(|v| self.model.representation.decode(v)).collect())
    }

    pub fn set_bandwidth(&mut self, ctx: &DeviceContext, bandwidth: &[f64]) -> Result<()> {
        if bandwidth.len() != self.model.dimensions {
            return Err(KdeError::InvalidArgument(format!(
                "got {} bandwidth values for {} dimensions",
                bandwidth.len(),
                self.model.dimensions
            )));
        }
        if let Some(bad) = bandwidth.iter().find(|h| !(**h > 0.0 && h.is_finite())) {
            return Err(KdeError::InvalidArgument(format!("bandwidth {} is not positive", bad)));
        }
        self.sync()?;
        let stored = bandwidth.iter().map(|h| self.model.representation.encode(*h)).collect();
        ctx.queue().write_buffer(&self.model.bandwidth, 0, stored, &[])?.wait()
    }

    /// Picks the monitored columns out of a full table row, in dimension order.
    pub fn project_row(&self, row: &[f64]) -> Result<Vec<f64>> {
        self.model
            .columns
            .iter()
            .map(|column| {
                row.get(column as usize).copied().ok_or_else(|| {
                    KdeError::InvalidArgument(format!("row has {} values, column {} is missing", row.len(), column))
                })
            })
            .collect()
    }

    /// Overwrites one sample slot and resets its karma. Blocks until the point
    /// is on the device.
    pub fn push_sample_point(&mut self, ctx: &DeviceContext, position: usize, point: &[f64]) -> Result<()> {
        if position >= self.model.points {
            return Err(KdeError::InvalidArgument(format!(
                "sample position {} out of range for {} points",
                position, self.model.points
            )));
        }
        if point.len() != self.model.dimensions {
            return Err(KdeError::InvalidArgument(format!(
                "point with {} values for a model over {} columns",
                point.len(),
                self.model.dimensions
            )));
        }
        let start = Instant::now();
        let queue = ctx.queue();
        let d = self.model.dimensions;
        let write_point = queue.write_buffer(&self.model.sample, position * d, point.to_vec(), &self.in_flight)?;
        let write_karma = queue.write_buffer(&self.model.karma, position, vec![0.0], &self.in_flight)?;
        Event::wait_all(&[write_point, write_karma])?;
        self.stats.maintenance_transfers_to_device += 1;
        self.stats.maintenance_transfer_time_us += start.elapsed().as_micros() as u64;
        Ok(())
    }

    /// The sample as it was inserted, one point per entry.
    pub fn denormalized_sample(&mut self, ctx: &DeviceContext) -> Result<Vec<Vec<f64>>> {
        self.sync()?;
        let d = self.model.dimensions;
        let sample = ctx.queue().read_buffer(&self.model.sample, 0, self.model.points * d, &[])?;
        Ok(sample.chunks_exact(d).map(|p| p.to_vec()).collect())
    }

    pub fn karma(&mut self, ctx: &DeviceContext) -> Result<Vec<f64>> {
        self.sync()?;
        ctx.queue().read_buffer(&self.model.karma, 0, self.model.points, &[])
    }

    /// Writes the sample as `;` separated text, one point per line.
    pub fn export_sample(&mut self, ctx: &DeviceContext, mut writer: impl Write) -> Result<()> {
        for point in self.denormalized_sample(ctx)? {
            writeln!(writer, "{}", point.iter().join(";"))?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Replaces the whole sample with points read in the format of
    /// `export_sample`. The normalization stays as it is, karma starts over.
    pub fn import_sample(&mut self, ctx: &DeviceContext, reader: impl BufRead) -> Result<()> {
        let d = self.model.dimensions;
        let mut sample = Vec::with_capacity(self.model.points * d);
        let mut rows = 0;
        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let values: Vec<f64> = line
                .split(';')
                .map(|v| v.trim().parse::<f64>())
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| KdeError::InvalidArgument(format!("line {}: {}", line_no + 1, e)))?;
            if values.len() != d {
                return Err(KdeError::InvalidArgument(format!(
                    "line {} has {} values, expected {}",
                    line_no + 1,
                    values.len(),
                    d
                )));
            }
            sample.extend(values);
            rows += 1;
        }
        if rows != self.model.points {
            return Err(KdeError::InvalidArgument(format!(
                "sample file has {} points, the model holds {}",
                rows, self.model.points
            )));
        }
        self.sync()?;
        let queue = ctx.queue();
        let write_sample = queue.write_buffer(&self.model.sample, 0, sample, &[])?;
        let reset_karma = ctx.fill(&self.model.karma, 0.0, &[])?;
        Event::wait_all(&[write_sample, reset_karma])?;
        self.stats.maintenance_transfers_to_device += 1;
        Ok(())
    }

    /// Feeds an observed selectivity to the online optimizer, if there is one.
    pub fn apply_online_step(&mut self, ctx: &DeviceContext, truth: f64) -> Result<()> {
        let Some(online) = self.online.as_mut() else {
            return Ok(());
        };
        let update = online.apply_step(ctx, self.last_selectivity, truth, self.rows_in_table as f64)?;
        if let Some(update) = update {
            self.pending_optimization = Some(update);
        }
        Ok(())
    }
}
