/*
    Sample maintenance.

    Keeps the sample representative while the table changes underneath it. The
    sample size never changes, points are only ever overwritten in place:

    CAR  Inserts take over Binomial(N, 1 / rows) random slots. Deletes look
         for slots holding the deleted row and refill them with random rows.
    PRR  Every period-th estimation replaces one random slot.
    TKR  Every estimation updates the karma of all points, points whose karma
         fell below the threshold get replaced.
    PKR  Like TKR, but only the point with the lowest karma gets replaced and
         only every period-th estimation.

    Karma measures what a point did to the last estimate. With e the estimate,
    t the truth and e_-i the estimate without point i,

        karma_i += N * (|e_-i - t| - |e - t|)

    so points that made the estimate worse lose karma. Karma never drops below
    the configured limit.
*/
pub mod rows;
pub mod sampling;

use std::sync::Arc;

use bitvec::{order::Lsb0, vec::BitVec};
use rand::Rng;

use crate::config::{KdeConfig, MaintenancePolicy};
use crate::device::reduction::MinDescriptor;
use crate::device::{DeviceBuffer, DeviceContext, Event, Kernel};
use crate::error::Result;
use crate::estimator::{Estimator, Row, TableId};

pub type RowKey = u64;

/// A row picked uniformly at random from the live rows of a table.
#[derive(Clone, Debug, PartialEq)]
pub struct DrawnRow {
    pub values: Row,
    /// What the sampler learned about the table size on the way, if anything.
    pub estimated_rows: Option<u64>,
}

/// Access to the rows of the monitored tables.
#[cfg_attr(test, mockall::automock)]
pub trait RowSource {
    fn draw_uniform_row(&mut self, table: TableId) -> Result<DrawnRow>;

    fn fetch_row(&mut self, table: TableId, key: RowKey) -> Result<Row>;
}

/// Maintenance state of one estimator.
pub struct SampleMaintenance {
    policy: MaintenancePolicy,
    period: u64,
    threshold: f64,
    karma_limit: f64,
    points: usize,
    /// One bit per sample point, padded to whole bytes
    bitmap: DeviceBuffer<u8>,
    deleted_point: DeviceBuffer<f64>,
    min_index: DeviceBuffer<usize>,
    lowest_karma: Option<MinDescriptor>,
    deletion_kernel: Option<Arc<Kernel>>,
    karma_kernel: Option<Arc<Kernel>>,
    threshold_kernel: Option<Arc<Kernel>>,
}

impl SampleMaintenance {
    pub fn new(ctx: &DeviceContext, config: &KdeConfig, estimator: &Estimator) -> Result<SampleMaintenance> {
        let policy = config.maintenance_policy;
        let model = estimator.model();
        let options = model.build_options();
        let kernel = |name: &str, used: bool| if used { ctx.kernel(name, options).map(Some) } else { Ok(None) };
        let karma_based = matches!(policy, MaintenancePolicy::Tkr | MaintenancePolicy::Pkr);
        let min_value = ctx.create_buffer::<f64>(1)?;
        let min_index = ctx.create_buffer::<usize>(1)?;
        let lowest_karma = if policy == MaintenancePolicy::Pkr {
            Some(MinDescriptor::prepare(ctx, &model.karma, model.points, &min_value, &min_index, 0)?)
        } else {
            None
        };
        Ok(SampleMaintenance {
            policy,
            period: config.maintenance_period.max(1),
            threshold: config.maintenance_threshold,
            karma_limit: config.karma_limit,
            points: model.points,
            bitmap: ctx.create_buffer::<u8>((model.points + 7) / 8)?,
            deleted_point: ctx.create_buffer::<f64>(model.dimensions)?,
            min_index,
            lowest_karma,
            deletion_kernel: kernel("point_deletion_bitmap", policy == MaintenancePolicy::Car)?,
            karma_kernel: kernel("update_sample_karma", karma_based)?,
            threshold_kernel: kernel("karma_threshold_bitmap", policy == MaintenancePolicy::Tkr)?,
        })
    }

    pub fn policy(&self) -> MaintenancePolicy {
        self.policy
    }

    pub fn on_insert(
        &mut self,
        ctx: &DeviceContext,
        estimator: &mut Estimator,
        row: &[f64],
        rng: &mut impl Rng,
    ) -> Result<()> {
        estimator.rows_in_table += 1;
        estimator.stats.nr_of_insertions += 1;
        if self.policy != MaintenancePolicy::Car {
            return Ok(());
        }
        let point = estimator.project_row(row)?;
        let count = sampling::replacement_count(rng, self.points, estimator.rows_in_table)?;
        if count == 0 {
            return Ok(());
        }
        let slots = sampling::floyd_sample(rng, self.points, count);
        for slot in slots.iter_ones() {
            estimator.push_sample_point(ctx, slot, &point)?;
        }
        tracing::trace!(table = estimator.table, slots = count, "inserted row into sample");
        Ok(())
    }

    /// Called before the row goes away, `rows` still has to know it.
    pub fn on_delete(
        &mut self,
        ctx: &DeviceContext,
        estimator: &mut Estimator,
        key: RowKey,
        rows: &mut dyn RowSource,
    ) -> Result<()> {
        estimator.rows_in_table = estimator.rows_in_table.saturating_sub(1);
        estimator.stats.nr_of_deletions += 1;
        let Some(kernel) = self.deletion_kernel.as_ref() else {
            return Ok(());
        };
        let point = estimator.project_row(&rows.fetch_row(estimator.table, key)?)?;

        let queue = ctx.queue();
        let write = queue.write_buffer(&self.deleted_point, 0, point, &[])?;
        estimator.stats.maintenance_transfers_to_device += 1;
        let (d, n) = (estimator.dimensions(), self.points);
        let (sample, deleted, bitmap) = (estimator.model.sample.clone(), self.deleted_point.clone(), self.bitmap.clone());
        // One work item per bitmap byte, so no two items write the same byte
        let mut wait_list = estimator.in_flight.clone();
        wait_list.push(write);
        let hits = queue.enqueue_kernel(kernel, self.bitmap.len(), &wait_list, move |byte| {
            let mut bits = 0u8;
            {
                let (sample, deleted) = (sample.read(), deleted.read());
                for bit in 0..8 {
                    let i = byte * 8 + bit;
                    if i < n && sample[i * d..(i + 1) * d] == deleted[..] {
                        bits |= 1 << bit;
                    }
                }
            }
            bitmap.write()[byte] = bits;
        })?;
        let hits = self.read_bitmap(ctx, estimator, hits)?;
        for slot in hits.iter_ones().filter(|i| *i < n) {
            self.replace_slot(ctx, estimator, rows, slot)?;
        }
        Ok(())
    }

    /// Consumes the truth for the estimator's open estimation.
    pub fn on_feedback(
        &mut self,
        ctx: &DeviceContext,
        estimator: &mut Estimator,
        truth: f64,
        rows: &mut dyn RowSource,
        rng: &mut impl Rng,
    ) -> Result<()> {
        estimator.stats.nr_of_estimations += 1;
        let due = estimator.stats.nr_of_estimations % self.period == 0;
        match self.policy {
            MaintenancePolicy::None | MaintenancePolicy::Car => Ok(()),
            MaintenancePolicy::Prr => {
                if due {
                    let slot = rng.gen_range(0..self.points);
                    self.replace_slot(ctx, estimator, rows, slot)?;
                }
                Ok(())
            }
            MaintenancePolicy::Tkr => {
                let karma = self.update_karma(ctx, estimator, truth)?;
                let hits = self.karma_below_threshold(ctx, estimator, karma)?;
                for slot in hits.iter_ones().filter(|i| *i < self.points) {
                    self.replace_slot(ctx, estimator, rows, slot)?;
                }
                Ok(())
            }
            MaintenancePolicy::Pkr => {
                let karma = self.update_karma(ctx, estimator, truth)?;
                if !due {
                    estimator.in_flight.push(karma);
                    return Ok(());
                }
                let slot = self.lowest_karma_slot(ctx, estimator, karma)?;
                self.replace_slot(ctx, estimator, rows, slot)
            }
        }
    }

    fn replace_slot(
        &self,
        ctx: &DeviceContext,
        estimator: &mut Estimator,
        rows: &mut dyn RowSource,
        slot: usize,
    ) -> Result<()> {
        let drawn = rows.draw_uniform_row(estimator.table)?;
        if let Some(estimated) = drawn.estimated_rows {
            estimator.rows_in_table = estimated;
        }
        let point = estimator.project_row(&drawn.values)?;
        estimator.push_sample_point(ctx, slot, &point)
    }

    fn read_bitmap(&self, ctx: &DeviceContext, estimator: &mut Estimator, ready: Event) -> Result<BitVec<u8, Lsb0>> {
        let bytes = ctx.queue().read_buffer(&self.bitmap, 0, self.bitmap.len(), &[ready])?;
        estimator.stats.maintenance_transfers_to_host += 1;
        Ok(BitVec::from_vec(bytes))
    }

    /// Schedules the karma update for the estimator's last estimation. Reads
    /// the per point contributions the estimation left behind.
    fn update_karma(&self, ctx: &DeviceContext, estimator: &mut Estimator, truth: f64) -> Result<Event> {
        let Some(kernel) = self.karma_kernel.as_ref() else {
            return Ok(Event::completed());
        };
        let model = &estimator.model;
        let n = model.points as f64;
        let normalization = model.normalization();
        let estimate = estimator.last_selectivity;
        let limit = self.karma_limit;
        let (local_results, karma) = (model.local_results.clone(), model.karma.clone());
        let wait_list = std::mem::take(&mut estimator.in_flight);
        ctx.queue().enqueue_kernel(kernel, model.points, &wait_list, move |i| {
            // The estimate of point i alone
            let alone = normalization * local_results.read()[i];
            let without = if n > 1.0 { (n * estimate - alone) / (n - 1.0) } else { estimate };
            let change = n * ((without - truth).abs() - (estimate - truth).abs());
            let mut karma = karma.write();
            karma[i] = (karma[i] + change).max(limit);
        })
    }

    fn karma_below_threshold(&self, ctx: &DeviceContext, estimator: &mut Estimator, karma: Event) -> Result<BitVec<u8, Lsb0>> {
        let Some(kernel) = self.threshold_kernel.as_ref() else {
            return Ok(BitVec::new());
        };
        let n = self.points;
        let threshold = self.threshold;
        let (karma_buffer, bitmap) = (estimator.model.karma.clone(), self.bitmap.clone());
        let marked = ctx.queue().enqueue_kernel(kernel, self.bitmap.len(), &[karma], move |byte| {
            let mut bits = 0u8;
            {
                let karma = karma_buffer.read();
                for bit in 0..8 {
                    let i = byte * 8 + bit;
                    if i < n && karma[i] < threshold {
                        bits |= 1 << bit;
                    }
                }
            }
            bitmap.write()[byte] = bits;
        })?;
        self.read_bitmap(ctx, estimator, marked)
    }

    fn lowest_karma_slot(&self, ctx: &DeviceContext, estimator: &mut Estimator, karma: Event) -> Result<usize> {
        let Some(lowest) = self.lowest_karma.as_ref() else {
            return Ok(0);
        };
        let found = lowest.run(ctx.queue(), &[karma])?;
        let slot = ctx.queue().read_buffer(&self.min_index, 0, 1, &[found])?[0];
        estimator.stats.maintenance_transfers_to_host += 1;
        Ok(slot)
    }
}
