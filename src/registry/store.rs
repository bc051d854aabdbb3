use std::fs;
use std::path::{Path, PathBuf};

use ahash::AHashMap;

use crate::error::{KdeError, Result};
use crate::estimator::columns::ColumnSet;
use crate::estimator::request::{ColumnRange, RangeRequest};
use crate::estimator::snapshot::ModelSnapshot;
use crate::estimator::TableId;

/// Where estimators go when the context shuts down, and where they come from
/// when it starts.
#[cfg_attr(test, mockall::automock)]
pub trait ModelStore {
    fn load_all(&self) -> Result<Vec<ModelSnapshot>>;

    fn load(&self, table: TableId) -> Result<Option<ModelSnapshot>>;

    fn save(&mut self, snapshot: &ModelSnapshot) -> Result<()>;
}

/// One observed scan: the request that was estimated and how many rows really
/// qualified.
#[derive(Clone, Debug, PartialEq)]
pub struct FeedbackRecord {
    pub table: TableId,
    pub columns: ColumnSet,
    pub ranges: Vec<ColumnRange>,
    pub qualified_rows: u64,
    pub total_rows: u64,
}

impl FeedbackRecord {
    pub fn new(request: &RangeRequest, qualified_rows: u64, total_rows: u64) -> Result<FeedbackRecord> {
        Ok(FeedbackRecord {
            table: request.table,
            columns: request.columns()?,
            ranges: request.ranges().to_vec(),
            qualified_rows,
            total_rows,
        })
    }

    pub fn request(&self) -> RangeRequest {
        RangeRequest::from_ranges(self.table, &self.ranges)
    }

    /// `None` for scans over an empty table.
    pub fn selectivity(&self) -> Option<f64> {
        if self.total_rows == 0 {
            None
        } else {
            Some(self.qualified_rows as f64 / self.total_rows as f64)
        }
    }
}

#[cfg_attr(test, mockall::automock)]
pub trait FeedbackStore {
    fn append(&mut self, record: FeedbackRecord) -> Result<()>;

    /// The newest records of a table first, at most `limit` of them.
    fn latest(&self, table: TableId, limit: Option<usize>) -> Result<Vec<FeedbackRecord>>;
}

/// Keeps serialized snapshots in memory. Going through the byte format means
/// a loaded model is exactly what a persistent store would give back.
#[derive(Default)]
pub struct InMemoryModelStore {
    snapshots: AHashMap<TableId, Vec<u8>>,
}

impl InMemoryModelStore {
    pub fn new() -> InMemoryModelStore {
        InMemoryModelStore::default()
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

impl ModelStore for InMemoryModelStore {
    fn load_all(&self) -> Result<Vec<ModelSnapshot>> {
        let mut tables: Vec<TableId> = self.snapshots.keys().copied().collect();
        tables.sort_unstable();
        tables.into_iter().map(|t| Ok(ModelSnapshot::from_bytes(&self.snapshots[&t])?)).collect()
    }

    fn load(&self, table: TableId) -> Result<Option<ModelSnapshot>> {
        match self.snapshots.get(&table) {
            Some(bytes) => Ok(Some(ModelSnapshot::from_bytes(bytes)?)),
            None => Ok(None),
        }
    }

    fn save(&mut self, snapshot: &ModelSnapshot) -> Result<()> {
        self.snapshots.insert(snapshot.table, snapshot.to_bytes());
        Ok(())
    }
}

/// One `<table>.kde` file per model in a directory.
pub struct DirectoryModelStore {
    dir: PathBuf,
}

impl DirectoryModelStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<DirectoryModelStore> {
        fs::create_dir_all(dir.as_ref()).map_err(persistence)?;
        Ok(DirectoryModelStore { dir: dir.as_ref().to_path_buf() })
    }

    fn path(&self, table: TableId) -> PathBuf {
        self.dir.join(format!("{}.kde", table))
    }
}

fn persistence(err: std::io::Error) -> KdeError {
    KdeError::PersistenceFailure(err.to_string())
}

impl ModelStore for DirectoryModelStore {
    fn load_all(&self) -> Result<Vec<ModelSnapshot>> {
        let mut snapshots = Vec::new();
        for entry in fs::read_dir(&self.dir).map_err(persistence)? {
            let path = entry.map_err(persistence)?.path();
            if path.extension().map_or(false, |ext| ext == "kde") {
                snapshots.push(ModelSnapshot::from_bytes(&fs::read(&path).map_err(persistence)?)?);
            }
        }
        snapshots.sort_by_key(|s| s.table);
        Ok(snapshots)
    }

    fn load(&self, table: TableId) -> Result<Option<ModelSnapshot>> {
        let path = self.path(table);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(ModelSnapshot::from_bytes(&fs::read(path).map_err(persistence)?)?))
    }

    fn save(&mut self, snapshot: &ModelSnapshot) -> Result<()> {
        // Write then rename, a crash must not leave half a model behind
        let path = self.path(snapshot.table);
        let tmp = path.with_extension("kde.tmp");
        fs::write(&tmp, snapshot.to_bytes()).map_err(persistence)?;
        fs::rename(&tmp, &path).map_err(persistence)
    }
}

#[derive(Default)]
pub struct InMemoryFeedbackStore {
    records: AHashMap<TableId, Vec<FeedbackRecord>>,
}

impl InMemoryFeedbackStore {
    pub fn new() -> InMemoryFeedbackStore {
        InMemoryFeedbackStore::default()
    }
}

impl FeedbackStore for InMemoryFeedbackStore {
    fn append(&mut self, record: FeedbackRecord) -> Result<()> {
        self.records.entry(record.table).or_default().push(record);
        Ok(())
    }

    fn latest(&self, table: TableId, limit: Option<usize>) -> Result<Vec<FeedbackRecord>> {
        let Some(records) = self.records.get(&table) else {
            return Ok(Vec::new());
        };
        let limit = limit.unwrap_or(records.len());
        Ok(records.iter().rev().take(limit).cloned().collect())
    }
}
