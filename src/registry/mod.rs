/*
    The estimator context is the entry point for the rest of the database.

    It owns the device, one estimator per monitored table and the collaborators
    the estimators need: the model store models are loaded from and flushed to,
    the feedback store that keeps observed scans for offline optimization, and
    the row source sample maintenance draws from.

    Planner facing calls never fail. If there is no model, or the model can't
    answer, the planner gets None and uses its default statistics. Device
    failures disable the model of that table. Persistence failures are the only
    errors that must reach the caller.
*/
pub mod store;

use std::io::{BufRead, Write};

use ahash::AHashMap;
use bitvec::{bitvec, vec::BitVec};
use rand::{rngs::StdRng, SeedableRng};

use crate::device::DeviceContext;
use crate::error::{KdeError, Result};
use crate::estimator::columns::ColumnSet;
use crate::estimator::request::RangeRequest;
use crate::estimator::stats::EstimatorStats;
use crate::estimator::{max_sample_size, Estimator, TableId};
use crate::evaluation::evaluate;
use crate::maintenance::{RowKey, RowSource, SampleMaintenance};
use crate::metrics::ErrorReporter;
use crate::optimizer::batch;
use crate::config::KdeConfig;

use store::{FeedbackRecord, FeedbackStore, ModelStore};

/// Table ids below this get a bit in the presence bitmap, larger ones are
/// looked up in the map.
const PRESENCE_BITS: usize = 1 << 20;

struct TableModel {
    estimator: Estimator,
    maintenance: SampleMaintenance,
}

pub struct EstimatorContext {
    config: KdeConfig,
    device: Option<DeviceContext>,
    tables: AHashMap<TableId, TableModel>,
    present: BitVec,
    models: Box<dyn ModelStore>,
    feedback: Box<dyn FeedbackStore>,
    rows: Box<dyn RowSource>,
    reporter: Option<ErrorReporter>,
    rng: StdRng,
    flushed: bool,
}

impl EstimatorContext {
    /// Sets up the device and loads every stored model.
    ///
    /// A missing device is not an error, the context then has no models and
    /// every estimation falls back to the planner's statistics.
    pub fn new(
        config: KdeConfig,
        models: Box<dyn ModelStore>,
        feedback: Box<dyn FeedbackStore>,
        rows: Box<dyn RowSource>,
    ) -> Result<EstimatorContext> {
        let device = if config.enabled {
            match DeviceContext::new(config.device, config.worker_threads) {
                Ok(device) => Some(device),
                Err(err) if err.is_infrastructure() => {
                    tracing::warn!("{}, estimator disabled", err);
                    None
                }
                Err(err) => return Err(err),
            }
        } else {
            None
        };
        EstimatorContext::with_device(config, device, models, feedback, rows)
    }

    pub fn with_device(
        config: KdeConfig,
        device: Option<DeviceContext>,
        models: Box<dyn ModelStore>,
        feedback: Box<dyn FeedbackStore>,
        rows: Box<dyn RowSource>,
    ) -> Result<EstimatorContext> {
        let reporter = match &config.error_logfile {
            Some(path) => Some(ErrorReporter::create(path)?),
            None => None,
        };
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let mut context = EstimatorContext {
            config,
            device,
            tables: AHashMap::new(),
            present: bitvec![0; PRESENCE_BITS],
            models,
            feedback,
            rows,
            reporter,
            rng,
            flushed: false,
        };
        context.load_models()?;
        Ok(context)
    }

    fn load_models(&mut self) -> Result<()> {
        let Some(device) = self.device.as_ref() else {
            return Ok(());
        };
        for snapshot in self.models.load_all()? {
            let table = snapshot.table;
            let loaded = Estimator::from_snapshot(device, &self.config, snapshot).and_then(|estimator| {
                let maintenance = SampleMaintenance::new(device, &self.config, &estimator)?;
                Ok(TableModel { estimator, maintenance })
            });
            match loaded {
                Ok(model) => {
                    self.tables.insert(table, model);
                    set_present(&mut self.present, table, true);
                }
                Err(err) if err.is_infrastructure() => tracing::warn!(table, "{}, not loading model", err),
                Err(err) => return Err(err),
            }
        }
        tracing::info!(models = self.tables.len(), "loaded estimators");
        Ok(())
    }

    pub fn config(&self) -> &KdeConfig {
        &self.config
    }

    pub fn has_device(&self) -> bool {
        self.device.is_some()
    }

    pub fn is_monitored(&self, table: TableId) -> bool {
        match self.present.get(table as usize) {
            Some(bit) => *bit,
            None => self.tables.contains_key(&table),
        }
    }

    pub fn monitored_tables(&self) -> Vec<TableId> {
        let mut tables: Vec<TableId> = self.tables.keys().copied().collect();
        tables.sort_unstable();
        tables
    }

    fn no_model(table: TableId) -> KdeError {
        KdeError::InvalidArgument(format!("no model for table {}", table))
    }

    /// Drops the model of a table after an infrastructure failure.
    fn disable(&mut self, table: TableId, err: &KdeError) {
        tracing::warn!(table, "{}, disabling model", err);
        self.tables.remove(&table);
        set_present(&mut self.present, table, false);
    }

    /// Infrastructure errors disable the table's model and are swallowed,
    /// everything else goes to the caller.
    fn contain<T: Default>(&mut self, table: TableId, result: Result<T>) -> Result<T> {
        match result {
            Err(err) if err.is_infrastructure() => {
                self.disable(table, &err);
                Ok(T::default())
            }
            other => other,
        }
    }

    /// Estimated selectivity of `request` on `table`, or None if there is no
    /// model that can answer it.
    pub fn estimate_selectivity(&mut self, table: TableId, request: &RangeRequest) -> Option<f64> {
        if !self.is_monitored(table) {
            return None;
        }
        let device = self.device.as_ref()?;
        let model = self.tables.get_mut(&table)?;
        match evaluate(device, &mut model.estimator, request) {
            Ok(selectivity) => Some(selectivity),
            Err(KdeError::UnanswerableRequest(reason)) => {
                tracing::debug!(table, "{}", reason);
                None
            }
            Err(err) if err.is_infrastructure() => {
                self.disable(table, &err);
                None
            }
            Err(err) => {
                tracing::warn!(table, "estimation failed: {}", err);
                None
            }
        }
    }

    /// Feeds the true outcome of the last estimated scan on `table` back into
    /// its model. Does nothing if there is no open estimation or the scanned
    /// table was empty.
    ///
    /// Only scans that were estimated end up in the feedback store, so a table
    /// has no history for `reoptimize` until it has a model.
    pub fn report_outcome(&mut self, table: TableId, qualified_rows: u64, total_rows: u64) -> Result<()> {
        let result = self.apply_outcome(table, qualified_rows, total_rows);
        self.contain(table, result)
    }

    fn apply_outcome(&mut self, table: TableId, qualified_rows: u64, total_rows: u64) -> Result<()> {
        let EstimatorContext { device, tables, rows, rng, feedback, reporter, .. } = self;
        let (Some(device), Some(model)) = (device.as_ref(), tables.get_mut(&table)) else {
            tracing::debug!(table, "feedback for a table without estimator");
            return Ok(());
        };
        let estimator = &mut model.estimator;
        if !estimator.has_open_estimation() {
            tracing::debug!(table, "feedback without open estimation");
            return Ok(());
        }
        // The feedback is consumed even if one of the steps below fails
        estimator.open_estimation = false;
        let request = estimator.last_request.take();
        if total_rows == 0 {
            tracing::debug!(table, "feedback for an empty table");
            return Ok(());
        }
        let truth = qualified_rows as f64 / total_rows as f64;
        estimator.rows_in_table = total_rows;

        let maintained = model.maintenance.on_feedback(device, estimator, truth, &mut **rows, rng);
        let learned = estimator.apply_online_step(device, truth);
        if let Some(reporter) = reporter {
            reporter.report(table, estimator.last_selectivity(), truth, total_rows as f64)?;
        }
        if let Some(request) = request {
            feedback.append(FeedbackRecord::new(&request, qualified_rows, total_rows)?)?;
        }
        maintained.and(learned)
    }

    pub fn notify_insert(&mut self, table: TableId, row: &[f64]) -> Result<()> {
        let EstimatorContext { device, tables, rng, .. } = self;
        let (Some(device), Some(model)) = (device.as_ref(), tables.get_mut(&table)) else {
            return Ok(());
        };
        let result = model.maintenance.on_insert(device, &mut model.estimator, row, rng);
        self.contain(table, result)
    }

    /// Has to be called while `key` can still be fetched from the row source.
    pub fn notify_delete(&mut self, table: TableId, key: RowKey) -> Result<()> {
        let EstimatorContext { device, tables, rows, .. } = self;
        let (Some(device), Some(model)) = (device.as_ref(), tables.get_mut(&table)) else {
            return Ok(());
        };
        let result = model.maintenance.on_delete(device, &mut model.estimator, key, &mut **rows);
        self.contain(table, result)
    }

    /// Draws a fresh sample for `table` over `columns` and replaces whatever
    /// model the table had. The old model is not saved.
    pub fn build_or_rebuild_model(&mut self, table: TableId, columns: &[u32], sample_size: Option<usize>) -> Result<()> {
        let columns = ColumnSet::from_columns(columns)?;
        if columns.is_empty() {
            return Err(KdeError::InvalidArgument("a model needs at least one column".into()));
        }
        let EstimatorContext { config, device, rows, .. } = self;
        let device = require_device(device)?;
        let size = max_sample_size(device.info(), columns.len(), sample_size.unwrap_or(config.sample_size));
        let mut points = Vec::with_capacity(size);
        let mut rows_in_table = 0;
        for _ in 0..size {
            let drawn = rows.draw_uniform_row(table)?;
            if let Some(estimated) = drawn.estimated_rows {
                rows_in_table = estimated;
            }
            let point = columns
                .iter()
                .map(|column| {
                    drawn.values.get(column as usize).copied().ok_or_else(|| {
                        KdeError::InvalidArgument(format!("table {} has no column {}", table, column))
                    })
                })
                .collect::<Result<Vec<f64>>>()?;
            points.push(point);
        }
        let rows_in_table = rows_in_table.max(points.len() as u64);
        let estimator = Estimator::build(device, config, table, columns, &points, rows_in_table)?;
        let maintenance = SampleMaintenance::new(device, config, &estimator)?;
        if self.tables.insert(table, TableModel { estimator, maintenance }).is_some() {
            tracing::info!(table, "replaced existing model");
        }
        set_present(&mut self.present, table, true);
        Ok(())
    }

    /// Reinstalls Scott's rule and optimizes the bandwidth over the recorded
    /// feedback, if that is enabled.
    pub fn reoptimize(&mut self, table: TableId) -> Result<()> {
        let EstimatorContext { config, device, tables, feedback, rng, .. } = self;
        let device = require_device(device)?;
        let model = tables.get_mut(&table).ok_or_else(|| EstimatorContext::no_model(table))?;
        let result = batch::reoptimize(device, config, &mut model.estimator, &**feedback, rng);
        self.contain(table, result)
    }

    pub fn get_bandwidth(&mut self, table: TableId) -> Result<Vec<f64>> {
        let EstimatorContext { device, tables, .. } = self;
        let device = require_device(device)?;
        let model = tables.get_mut(&table).ok_or_else(|| EstimatorContext::no_model(table))?;
        model.estimator.bandwidth(device)
    }

    pub fn set_bandwidth(&mut self, table: TableId, bandwidth: &[f64]) -> Result<()> {
        let EstimatorContext { device, tables, .. } = self;
        let device = require_device(device)?;
        let model = tables.get_mut(&table).ok_or_else(|| EstimatorContext::no_model(table))?;
        model.estimator.set_bandwidth(device, bandwidth)
    }

    pub fn get_stats(&self, table: TableId) -> Option<EstimatorStats> {
        self.tables.get(&table).map(|m| m.estimator.stats())
    }

    pub fn export_sample(&mut self, table: TableId, writer: impl Write) -> Result<()> {
        let EstimatorContext { device, tables, .. } = self;
        let device = require_device(device)?;
        let model = tables.get_mut(&table).ok_or_else(|| EstimatorContext::no_model(table))?;
        model.estimator.export_sample(device, writer)
    }

    pub fn import_sample(&mut self, table: TableId, reader: impl BufRead) -> Result<()> {
        let EstimatorContext { device, tables, .. } = self;
        let device = require_device(device)?;
        let model = tables.get_mut(&table).ok_or_else(|| EstimatorContext::no_model(table))?;
        model.estimator.import_sample(device, reader)
    }

    /// Saves one model to the model store.
    pub fn save(&mut self, table: TableId) -> Result<()> {
        let EstimatorContext { device, tables, models, .. } = self;
        let device = require_device(device)?;
        let model = tables.get_mut(&table).ok_or_else(|| EstimatorContext::no_model(table))?;
        let snapshot = model.estimator.to_snapshot(device)?;
        models.save(&snapshot)
    }

    /// Flushes every model to the model store and waits for the device. Runs on
    /// drop if it wasn't called before.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.flushed {
            return Ok(());
        }
        self.flushed = true;
        let Some(device) = self.device.as_ref() else {
            return Ok(());
        };
        for table in self.monitored_tables() {
            let Some(model) = self.tables.get_mut(&table) else {
                continue;
            };
            let snapshot = model.estimator.to_snapshot(device)?;
            self.models.save(&snapshot)?;
        }
        device.queue().finish()?;
        tracing::info!(models = self.tables.len(), "flushed estimators");
        Ok(())
    }
}

impl Drop for EstimatorContext {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            tracing::error!("failed to flush estimators: {}", err);
        }
    }
}

fn require_device(device: &Option<DeviceContext>) -> Result<&DeviceContext> {
    device.as_ref().ok_or_else(|| KdeError::DeviceUnavailable("estimator has no device".into()))
}

fn set_present(present: &mut BitVec, table: TableId, value: bool) {
    if (table as usize) < present.len() {
        present.set(table as usize, value);
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use parking_lot::Mutex;
    use rand::Rng;

    use super::*;
    use crate::config::{DeviceClass, MaintenancePolicy};
    use crate::device::test::test_context;
    use crate::device::DeviceInfo;
    use crate::estimator::snapshot::ModelSnapshot;
    use crate::maintenance::rows::InMemoryRows;
    use crate::maintenance::{DrawnRow, MockRowSource};
    use store::{InMemoryFeedbackStore, InMemoryModelStore, MockFeedbackStore, MockModelStore};

    /// Shares its snapshots with the test, so they survive the context.
    #[derive(Clone, Default)]
    struct SharedModels(Arc<Mutex<InMemoryModelStore>>);

    impl ModelStore for SharedModels {
        fn load_all(&self) -> Result<Vec<ModelSnapshot>> {
            self.0.lock().load_all()
        }

        fn load(&self, table: TableId) -> Result<Option<ModelSnapshot>> {
            self.0.lock().load(table)
        }

        fn save(&mut self, snapshot: &ModelSnapshot) -> Result<()> {
            self.0.lock().save(snapshot)
        }
    }

    // Table 5 has columns 0..3, column 1 is uniform on [0, 100), column 2 is
    // column 1 plus noise
    fn table_rows(seed: u64, count: u64) -> InMemoryRows {
        let rows = InMemoryRows::new(seed);
        let mut rng = StdRng::seed_from_u64(seed);
        for key in 0..count {
            let x: f64 = rng.gen_range(0.0..100.0);
            rows.insert(5, key, vec![key as f64, x, x + rng.gen_range(-5.0..5.0)]);
        }
        rows
    }

    fn config() -> KdeConfig {
        KdeConfig::default().with_sample_size(128).with_seed(21)
    }

    fn context(config: KdeConfig, models: SharedModels, rows: InMemoryRows) -> EstimatorContext {
        EstimatorContext::with_device(
            config,
            Some(test_context()),
            Box::new(models),
            Box::new(InMemoryFeedbackStore::new()),
            Box::new(rows),
        )
        .unwrap()
    }

    #[test]
    fn unknown_tables_fall_back() {
        let mut ctx = context(config(), SharedModels::default(), InMemoryRows::new(1));
        assert!(!ctx.is_monitored(5));
        assert!(!ctx.is_monitored(u32::MAX));
        assert_eq!(ctx.estimate_selectivity(5, &RangeRequest::new(5).less_than(1, 3.0)), None);
        // Feedback without a model or estimation is ignored
        ctx.report_outcome(5, 1, 2).unwrap();
        ctx.notify_insert(5, &[1.0]).unwrap();
        assert!(matches!(ctx.get_bandwidth(5), Err(KdeError::InvalidArgument(_))));
    }

    #[test]
    fn estimates_after_build() {
        let rows = table_rows(2, 5000);
        let mut ctx = context(config(), SharedModels::default(), rows);
        ctx.build_or_rebuild_model(5, &[1, 2], None).unwrap();
        assert!(ctx.is_monitored(5));

        let request = RangeRequest::new(5).between(1, 0.0, 50.0);
        let selectivity = ctx.estimate_selectivity(5, &request).unwrap();
        assert!((selectivity - 0.5).abs() < 0.12, "{}", selectivity);
        assert_eq!(ctx.estimate_selectivity(5, &RangeRequest::new(5)).map(|s| (s - 1.0).abs() < 1e-9), Some(true));
        // Column 0 is not monitored
        assert_eq!(ctx.estimate_selectivity(5, &RangeRequest::new(5).less_than(0, 10.0)), None);
        assert!(ctx.is_monitored(5));
    }

    #[test]
    fn feedback_closes_estimation_and_is_recorded() {
        let rows = table_rows(3, 2000);
        let mut feedback = MockFeedbackStore::new();
        feedback
            .expect_append()
            .withf(|record| record.table == 5 && record.qualified_rows == 700 && record.ranges.len() == 1)
            .times(1)
            .returning(|_| Ok(()));
        let mut ctx = EstimatorContext::with_device(
            config(),
            Some(test_context()),
            Box::new(SharedModels::default()),
            Box::new(feedback),
            Box::new(rows),
        )
        .unwrap();
        ctx.build_or_rebuild_model(5, &[1, 2], Some(64)).unwrap();
        ctx.estimate_selectivity(5, &RangeRequest::new(5).less_than(2, 40.0)).unwrap();
        ctx.report_outcome(5, 700, 2100).unwrap();
        // No open estimation any more, this one is dropped
        ctx.report_outcome(5, 1, 2100).unwrap();

        let stats = ctx.get_stats(5).unwrap();
        assert_eq!(stats.nr_of_estimations, 1);
        assert_eq!(stats.estimation_transfers_to_device, 1);
    }

    #[test]
    fn feedback_for_empty_table_is_skipped() {
        let rows = table_rows(14, 200);
        let config = config().with_maintenance(MaintenancePolicy::Prr, 1, 0.0);
        let mut ctx = context(config, SharedModels::default(), rows.clone());
        ctx.build_or_rebuild_model(5, &[1, 2], Some(32)).unwrap();
        for key in 0..200 {
            rows.remove(5, key);
        }
        let request = RangeRequest::new(5).less_than(1, 50.0);
        ctx.estimate_selectivity(5, &request).unwrap();
        ctx.report_outcome(5, 0, 0).unwrap();
        ctx.report_outcome(5, 0, 0).unwrap();
        assert_eq!(ctx.get_stats(5).unwrap().nr_of_estimations, 0);
        assert!(!ctx.tables[&5].estimator.has_open_estimation());

        // Replacement fails without rows, the estimation is closed anyway
        ctx.estimate_selectivity(5, &request).unwrap();
        assert!(matches!(ctx.report_outcome(5, 0, 10), Err(KdeError::InvalidArgument(_))));
        assert!(!ctx.tables[&5].estimator.has_open_estimation());
        assert_eq!(ctx.tables[&5].estimator.rows_in_table(), 10);
        ctx.report_outcome(5, 0, 10).unwrap();
        assert_eq!(ctx.get_stats(5).unwrap().nr_of_estimations, 1);
    }

    #[test]
    fn scan_total_is_known_to_maintenance() {
        let mut rows = MockRowSource::new();
        let mut drawn = 0u64;
        rows.expect_draw_uniform_row().returning(move |_| {
            drawn += 1;
            let estimated_rows = if drawn <= 16 { 100 } else { 777 };
            Ok(DrawnRow { values: vec![0.0, drawn as f64, (drawn % 5) as f64], estimated_rows: Some(estimated_rows) })
        });
        let config = config().with_maintenance(MaintenancePolicy::Prr, 1, 0.0);
        let mut ctx = EstimatorContext::with_device(
            config,
            Some(test_context()),
            Box::new(SharedModels::default()),
            Box::new(InMemoryFeedbackStore::new()),
            Box::new(rows),
        )
        .unwrap();
        ctx.build_or_rebuild_model(5, &[1, 2], Some(16)).unwrap();
        assert_eq!(ctx.tables[&5].estimator.rows_in_table(), 100);

        ctx.estimate_selectivity(5, &RangeRequest::new(5).less_than(1, 8.0)).unwrap();
        ctx.report_outcome(5, 8, 50).unwrap();
        // The scan total is in place first, the replacement draw refines it
        assert_eq!(ctx.tables[&5].estimator.rows_in_table(), 777);
    }

    #[test]
    fn scan_total_replaces_row_count() {
        let mut ctx = context(config(), SharedModels::default(), table_rows(15, 300));
        ctx.build_or_rebuild_model(5, &[1, 2], Some(32)).unwrap();
        assert_eq!(ctx.tables[&5].estimator.rows_in_table(), 300);
        ctx.estimate_selectivity(5, &RangeRequest::new(5).less_than(1, 50.0)).unwrap();
        ctx.report_outcome(5, 200, 450).unwrap();
        assert_eq!(ctx.tables[&5].estimator.rows_in_table(), 450);
    }

    #[test]
    fn persistence_round_trip_gives_identical_estimates() {
        let models = SharedModels::default();
        let request = RangeRequest::new(5).between(1, 20.0, 35.0).greater_than(2, 25.0);
        let (before, bandwidth) = {
            let mut ctx = context(config(), models.clone(), table_rows(4, 3000));
            ctx.build_or_rebuild_model(5, &[1, 2], None).unwrap();
            ctx.set_bandwidth(5, &[0.3, 0.45]).unwrap();
            let before = ctx.estimate_selectivity(5, &request).unwrap();
            (before, ctx.get_bandwidth(5).unwrap())
            // Dropping the context saves the model
        };
        assert_eq!(models.0.lock().len(), 1);

        let mut ctx = context(config(), models.clone(), InMemoryRows::new(9));
        assert!(ctx.is_monitored(5));
        assert_eq!(ctx.get_bandwidth(5).unwrap(), bandwidth);
        let after = ctx.estimate_selectivity(5, &request).unwrap();
        assert_eq!(before.to_bits(), after.to_bits());
    }

    #[test]
    fn rebuilding_replaces_without_saving() {
        let mut models = MockModelStore::new();
        models.expect_load_all().returning(|| Ok(Vec::new()));
        // Only the final flush saves, and only the second model
        models.expect_save().withf(|snapshot| snapshot.columns.len() == 1).times(1).returning(|_| Ok(()));
        let mut ctx = EstimatorContext::with_device(
            config(),
            Some(test_context()),
            Box::new(models),
            Box::new(InMemoryFeedbackStore::new()),
            Box::new(table_rows(5, 500)),
        )
        .unwrap();
        ctx.build_or_rebuild_model(5, &[1, 2], Some(32)).unwrap();
        ctx.build_or_rebuild_model(5, &[2], Some(16)).unwrap();
        assert_eq!(ctx.monitored_tables(), vec![5]);
        ctx.shutdown().unwrap();
        // Drop must not flush a second time
    }

    #[test]
    fn persistence_failures_reach_the_caller() {
        let mut models = MockModelStore::new();
        models.expect_load_all().returning(|| Ok(Vec::new()));
        models.expect_save().returning(|_| Err(KdeError::PersistenceFailure("disk full".into())));
        let mut ctx = EstimatorContext::with_device(
            config(),
            Some(test_context()),
            Box::new(models),
            Box::new(InMemoryFeedbackStore::new()),
            Box::new(table_rows(6, 100)),
        )
        .unwrap();
        ctx.build_or_rebuild_model(5, &[1], Some(16)).unwrap();
        assert!(matches!(ctx.save(5), Err(KdeError::PersistenceFailure(_))));
        assert!(ctx.shutdown().unwrap_err().is_fatal());
    }

    #[test]
    fn without_device_nothing_is_estimated() {
        let config = KdeConfig { device: DeviceClass::Gpu, ..config() };
        let mut ctx = EstimatorContext::new(
            config,
            Box::new(SharedModels::default()),
            Box::new(InMemoryFeedbackStore::new()),
            Box::new(table_rows(7, 10)),
        )
        .unwrap();
        assert!(!ctx.has_device());
        assert!(matches!(ctx.build_or_rebuild_model(5, &[1], None), Err(KdeError::DeviceUnavailable(_))));
        assert_eq!(ctx.estimate_selectivity(5, &RangeRequest::new(5)), None);
    }

    fn small_device(max_alloc_size: usize) -> DeviceContext {
        let mut info = DeviceInfo::vector_cpu(2);
        info.max_alloc_size = max_alloc_size;
        DeviceContext::with_info(info, 2).unwrap()
    }

    #[test]
    fn sample_size_is_capped_by_device() {
        // 64 points of two columns plus their karma
        let device = small_device(64 * 3 * 8);
        let mut ctx = EstimatorContext::with_device(
            config(),
            Some(device),
            Box::new(SharedModels::default()),
            Box::new(InMemoryFeedbackStore::new()),
            Box::new(table_rows(8, 1000)),
        )
        .unwrap();
        ctx.build_or_rebuild_model(5, &[1, 2], Some(1000)).unwrap();
        let mut exported = Vec::new();
        ctx.export_sample(5, &mut exported).unwrap();
        assert_eq!(String::from_utf8(exported).unwrap().lines().count(), 64);
    }

    #[test]
    fn models_that_do_not_fit_are_not_loaded() {
        let models = SharedModels::default();
        {
            let mut ctx = context(config(), models.clone(), table_rows(12, 1000));
            ctx.build_or_rebuild_model(5, &[1, 2], Some(128)).unwrap();
        }
        let ctx = EstimatorContext::with_device(
            config(),
            Some(small_device(64 * 3 * 8)),
            Box::new(models.clone()),
            Box::new(InMemoryFeedbackStore::new()),
            Box::new(InMemoryRows::new(13)),
        )
        .unwrap();
        assert!(!ctx.is_monitored(5));
        assert!(ctx.get_stats(5).is_none());
    }

    #[test]
    fn maintenance_runs_through_the_context() {
        let rows = table_rows(9, 400);
        let config = config().with_maintenance(MaintenancePolicy::Car, 1, 0.0);
        let mut ctx = context(config, SharedModels::default(), rows.clone());
        ctx.build_or_rebuild_model(5, &[1, 2], Some(32)).unwrap();
        let before = ctx.get_stats(5).unwrap();

        for key in 400..410 {
            let row = vec![key as f64, 1.0, 2.0];
            rows.insert(5, key, row.clone());
            ctx.notify_insert(5, &row).unwrap();
        }
        for key in 0..5 {
            ctx.notify_delete(5, key).unwrap();
            rows.remove(5, key);
        }
        let stats = ctx.get_stats(5).unwrap();
        assert_eq!(stats.nr_of_insertions, 10);
        assert_eq!(stats.nr_of_deletions, 5);
        assert!(stats.maintenance_transfers_to_host >= before.maintenance_transfers_to_host + 5);

        let mut exported = Vec::new();
        ctx.export_sample(5, &mut exported).unwrap();
        assert_eq!(String::from_utf8(exported.clone()).unwrap().lines().count(), 32);
        ctx.import_sample(5, exported.as_slice()).unwrap();
    }

    #[test]
    fn reoptimize_uses_recorded_feedback() {
        let rows = table_rows(10, 3000);
        let config = config().without_adaptive_bandwidth().with_bandwidth_optimization(true, None);
        let mut ctx = context(config, SharedModels::default(), rows.clone());
        ctx.build_or_rebuild_model(5, &[1, 2], Some(64)).unwrap();
        // Feed true selectivities computed from the table
        let mut rng = StdRng::seed_from_u64(11);
        let mut source = rows.clone();
        let all: Vec<Vec<f64>> = (0..3000).map(|key| source.fetch_row(5, key).unwrap()).collect();
        for _ in 0..30 {
            let lower = rng.gen_range(0.0..80.0);
            let upper = lower + rng.gen_range(5.0..20.0);
            let request = RangeRequest::new(5).between(1, lower, upper);
            ctx.estimate_selectivity(5, &request).unwrap();
            let qualified = all.iter().filter(|r| r[1] >= lower && r[1] <= upper).count() as u64;
            ctx.report_outcome(5, qualified, 3000).unwrap();
        }
        ctx.reoptimize(5).unwrap();
        let bandwidth = ctx.get_bandwidth(5).unwrap();
        assert!(bandwidth.iter().all(|h| *h > 0.0 && h.is_finite()), "{:?}", bandwidth);
        assert!(ctx.get_stats(5).unwrap().optimization_transfers_to_host > 0);
    }
}
