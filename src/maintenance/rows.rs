use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::error::{KdeError, Result};
use crate::estimator::{Row, TableId};
use crate::maintenance::{DrawnRow, RowKey, RowSource};

#[derive(Default)]
struct Table {
    keys: Vec<RowKey>,
    rows: Vec<Row>,
    positions: AHashMap<RowKey, usize>,
}

/// Tables held in memory. Clones share the same tables, so whoever owns the
/// rows can keep modifying them while an estimator context reads them.
#[derive(Clone)]
pub struct InMemoryRows {
    tables: Arc<Mutex<AHashMap<TableId, Table>>>,
    rng: Arc<Mutex<StdRng>>,
}

impl InMemoryRows {
    pub fn new(seed: u64) -> InMemoryRows {
        InMemoryRows { tables: Arc::new(Mutex::new(AHashMap::new())), rng: Arc::new(Mutex::new(StdRng::seed_from_u64(seed))) }
    }

    pub fn insert(&self, table: TableId, key: RowKey, row: Row) {
        let mut tables = self.tables.lock();
        let table = tables.entry(table).or_default();
        if let Some(position) = table.positions.get(&key) {
            table.rows[*position] = row;
            return;
        }
        table.positions.insert(key, table.rows.len());
        table.keys.push(key);
        table.rows.push(row);
    }

    pub fn remove(&self, table: TableId, key: RowKey) -> Option<Row> {
        let mut tables = self.tables.lock();
        let table = tables.get_mut(&table)?;
        let position = table.positions.remove(&key)?;
        table.keys.swap_remove(position);
        let row = table.rows.swap_remove(position);
        if position < table.keys.len() {
            table.positions.insert(table.keys[position], position);
        }
        Some(row)
    }

    pub fn len(&self, table: TableId) -> usize {
        self.tables.lock().get(&table).map_or(0, |t| t.rows.len())
    }
}

impl RowSource for InMemoryRows {
    fn draw_uniform_row(&mut self, table: TableId) -> Result<DrawnRow> {
        let tables = self.tables.lock();
        let rows = match tables.get(&table) {
            Some(t) if !t.rows.is_empty() => &t.rows,
            _ => return Err(KdeError::InvalidArgument(format!("table {} has no rows to sample", table))),
        };
        let position = self.rng.lock().gen_range(0..rows.len());
        Ok(DrawnRow { values: rows[position].clone(), estimated_rows: Some(rows.len() as u64) })
    }

    fn fetch_row(&mut self, table: TableId, key: RowKey) -> Result<Row> {
        let tables = self.tables.lock();
        tables
            .get(&table)
            .and_then(|t| t.positions.get(&key).map(|p| t.rows[*p].clone()))
            .ok_or_else(|| KdeError::InvalidArgument(format!("no row {} in table {}", key, table)))
    }
}
