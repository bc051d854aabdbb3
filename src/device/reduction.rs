/*
    Parallel reductions over device arrays.

    Reducing a few thousand values on a device with many cores is dominated by
    launch and synchronization overhead if every step of a tree reduction is its
    own launch. So both reductions work in two passes:

    1. A pre-aggregation pass over P = max_compute_units work groups. Each work
       item of a group owns a contiguous stripe of `tuples_per_item` elements, and
       each group writes one partial result.
    2. A finishing pass with a single work item that combines the P partial
       results and writes the final value to the caller's buffer at the caller's
       offset.

    For sums the stripe length is rounded up so the stripes cover every element.
    For min it is rounded down, and a second "slow" pass picks up the elements
    beyond P * local_size * tuples_per_item sequentially into an extra slot. The
    fast and the slow pass don't depend on each other.

    Descriptors are prepared once and can be run over and over again, which is
    what the estimator does for every single estimation.
*/
use std::sync::Arc;

use crate::device::{BuildOptions, CommandQueue, DeviceBuffer, DeviceContext, Event, Kernel};
use crate::error::{KdeError, Result};

fn check_range(what: &str, n: usize, offset: usize, len: usize) -> Result<()> {
    if n == 0 {
        return Err(KdeError::InvalidArgument(format!("cannot {} over an empty array", what)));
    }
    if offset + n > len {
        return Err(KdeError::InvalidArgument(format!(
            "cannot {} over {} elements at offset {} of a buffer with {}",
            what, n, offset, len
        )));
    }
    Ok(())
}

pub struct SumDescriptor {
    source: DeviceBuffer<f64>,
    source_offset: usize,
    n: usize,
    result: DeviceBuffer<f64>,
    result_offset: usize,
    partial: DeviceBuffer<f64>,
    workers: usize,
    local_size: usize,
    tuples_per_item: usize,
    pre_aggregate: Arc<Kernel>,
    finish: Arc<Kernel>,
}

impl SumDescriptor {
    /// Prepares summing up `n` elements of `source` starting at `source_offset`
    /// into `result[result_offset]`.
    pub fn prepare(
        ctx: &DeviceContext,
        source: &DeviceBuffer<f64>,
        source_offset: usize,
        n: usize,
        result: &DeviceBuffer<f64>,
        result_offset: usize,
    ) -> Result<SumDescriptor> {
        check_range("sum", n, source_offset, source.len())?;
        check_range("store a sum", 1, result_offset, result.len())?;
        let pre_aggregate = ctx.kernel("sum_pre_aggregate", BuildOptions::generic())?;
        let finish = ctx.kernel("sum_finish", BuildOptions::generic())?;
        let info = ctx.info();
        let workers = info.max_compute_units;
        let local_size = pre_aggregate.local_size(std::mem::size_of::<f64>(), info.local_mem_size);
        let tuples_per_item = (n + workers * local_size - 1) / (workers * local_size);
        let partial = ctx.create_buffer::<f64>(workers)?;
        Ok(SumDescriptor {
            source: source.clone(),
            source_offset,
            n,
            result: result.clone(),
            result_offset,
            partial,
            workers,
            local_size,
            tuples_per_item,
            pre_aggregate,
            finish,
        })
    }

    pub fn len(&self) -> usize {
        self.n
    }

    pub fn run(&self, queue: &CommandQueue, wait_list: &[Event]) -> Result<Event> {
        let (source, partial) = (self.source.clone(), self.partial.clone());
        let (offset, n, local_size, tpt) = (self.source_offset, self.n, self.local_size, self.tuples_per_item);
        let pre = queue.enqueue_kernel(&self.pre_aggregate, self.workers, wait_list, move |group| {
            let acc = {
                let src = source.read();
                let mut acc = 0.0;
                for lane in 0..local_size {
                    let start = (group * local_size + lane) * tpt;
                    for i in start..(start + tpt).min(n) {
                        acc += src[offset + i];
                    }
                }
                acc
            };
            partial.write()[group] = acc;
        })?;
        let (partial, result) = (self.partial.clone(), self.result.clone());
        let result_offset = self.result_offset;
        queue.enqueue_kernel(&self.finish, 1, &[pre], move |_| {
            let total: f64 = partial.read().iter().sum();
            result.write()[result_offset] = total;
        })
    }
}

/// One-shot sum, for callers that only reduce a buffer once.
pub fn sum_of_array(
    ctx: &DeviceContext,
    source: &DeviceBuffer<f64>,
    n: usize,
    result: &DeviceBuffer<f64>,
    result_offset: usize,
    wait_list: &[Event],
) -> Result<Event> {
    SumDescriptor::prepare(ctx, source, 0, n, result, result_offset)?.run(ctx.queue(), wait_list)
}

pub struct MinDescriptor {
    source: DeviceBuffer<f64>,
    n: usize,
    values: DeviceBuffer<f64>,
    indices: DeviceBuffer<usize>,
    result_offset: usize,
    partial_values: DeviceBuffer<f64>,
    partial_indices: DeviceBuffer<usize>,
    workers: usize,
    local_size: usize,
    tuples_per_item: usize,
    fast_pass: Arc<Kernel>,
    slow_pass: Arc<Kernel>,
    finish: Arc<Kernel>,
}

fn min_of(src: &[f64], range: std::ops::Range<usize>, best: &mut (f64, usize)) {
    for i in range {
        if src[i] < best.0 {
            *best = (src[i], i);
        }
    }
}

impl MinDescriptor {
    /// Prepares finding the smallest of the first `n` elements of `source`. The
    /// value lands in `values[result_offset]`, its index in `indices[result_offset]`.
    pub fn prepare(
        ctx: &DeviceContext,
        source: &DeviceBuffer<f64>,
        n: usize,
        values: &DeviceBuffer<f64>,
        indices: &DeviceBuffer<usize>,
        result_offset: usize,
    ) -> Result<MinDescriptor> {
        check_range("find a minimum", n, 0, source.len())?;
        check_range("store a minimum", 1, result_offset, values.len().min(indices.len()))?;
        let options = BuildOptions::generic();
        let fast_pass = ctx.kernel("min_fast_pass", options)?;
        let slow_pass = ctx.kernel("min_slow_pass", options)?;
        let finish = ctx.kernel("min_finish", options)?;
        let info = ctx.info();
        let workers = info.max_compute_units;
        let local_size = fast_pass.local_size(
            std::mem::size_of::<f64>() + std::mem::size_of::<usize>(),
            info.local_mem_size,
        );
        let tuples_per_item = n / (workers * local_size);
        // One extra slot for the slow pass
        let partial_values = ctx.create_buffer_from(vec![f64::INFINITY; workers + 1])?;
        let partial_indices = ctx.create_buffer_from(vec![0usize; workers + 1])?;
        Ok(MinDescriptor {
            source: source.clone(),
            n,
            values: values.clone(),
            indices: indices.clone(),
            result_offset,
            partial_values,
            partial_indices,
            workers,
            local_size,
            tuples_per_item,
            fast_pass,
            slow_pass,
            finish,
        })
    }

    pub fn run(&self, queue: &CommandQueue, wait_list: &[Event]) -> Result<Event> {
        let workers = self.workers;
        let local_size = self.local_size;
        let tpt = self.tuples_per_item;
        let fast_end = workers * local_size * tpt;

        let (source, values, indices) = (self.source.clone(), self.partial_values.clone(), self.partial_indices.clone());
        let fast = queue.enqueue_kernel(&self.fast_pass, workers, wait_list, move |group| {
            let mut best = (f64::INFINITY, 0);
            {
                let src = source.read();
                for lane in 0..local_size {
                    let start = (group * local_size + lane) * tpt;
                    min_of(&src, start..start + tpt, &mut best);
                }
            }
            values.write()[group] = best.0;
            indices.write()[group] = best.1;
        })?;

        let (source, values, indices) = (self.source.clone(), self.partial_values.clone(), self.partial_indices.clone());
        let n = self.n;
        let slow = queue.enqueue_kernel(&self.slow_pass, 1, wait_list, move |_| {
            let mut best = (f64::INFINITY, 0);
            min_of(&source.read(), fast_end..n, &mut best);
            values.write()[workers] = best.0;
            indices.write()[workers] = best.1;
        })?;

        let (partial_values, partial_indices) = (self.partial_values.clone(), self.partial_indices.clone());
        let (values, indices, offset) = (self.values.clone(), self.indices.clone(), self.result_offset);
        queue.enqueue_kernel(&self.finish, 1, &[fast, slow], move |_| {
            // Slots cover increasing index ranges, so the first minimum we see has
            // the smallest index.
            let mut best = (f64::INFINITY, 0);
            {
                let slot_values = partial_values.read();
                let slot_indices = partial_indices.read();
                for slot in 0..=workers {
                    if slot_values[slot] < best.0 {
                        best = (slot_values[slot], slot_indices[slot]);
                    }
                }
            }
            values.write()[offset] = best.0;
            indices.write()[offset] = best.1;
        })
    }
}

/// One-shot argmin.
pub fn min_of_array(
    ctx: &DeviceContext,
    source: &DeviceBuffer<f64>,
    n: usize,
    values: &DeviceBuffer<f64>,
    indices: &DeviceBuffer<usize>,
    result_offset: usize,
    wait_list: &[Event],
) -> Result<Event> {
    MinDescriptor::prepare(ctx, source, n, values, indices, result_offset)?.run(ctx.queue(), wait_list)
}
