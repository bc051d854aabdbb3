use std::error::Error;
use std::fmt::{Display, Formatter};
use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::config::BandwidthRepresentation;
use crate::error::KdeError;
use crate::estimator::columns::ColumnSet;
use crate::estimator::TableId;

const MAGIC: &[u8; 4] = b"OXKD";
const VERSION: u16 = 1;

#[derive(Debug, PartialEq)]
pub enum SnapshotError {
    BadMagic,
    UnsupportedVersion(u16),
    UnknownRepresentation(u8),
    Truncated { need: usize, has: usize },
    TrailingBytes(usize),
    Inconsistent(String),
}

impl Display for SnapshotError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        match self {
            SnapshotError::BadMagic => f.write_str("not a model snapshot"),
            SnapshotError::UnsupportedVersion(v) => f.write_fmt(format_args!("unsupported snapshot version {}", v)),
            SnapshotError::UnknownRepresentation(r) => f.write_fmt(format_args!("unknown bandwidth representation {}", r)),
            SnapshotError::Truncated { need, has } => {
                f.write_fmt(format_args!("snapshot truncated, need {} bytes, has {}", need, has))
            }
            SnapshotError::TrailingBytes(n) => f.write_fmt(format_args!("{} unexpected bytes after snapshot", n)),
            SnapshotError::Inconsistent(reason) => f.write_fmt(format_args!("inconsistent snapshot: {}", reason)),
        }
    }
}

impl Error for SnapshotError {}

impl From<SnapshotError> for KdeError {
    fn from(err: SnapshotError) -> Self {
        KdeError::PersistenceFailure(err.to_string())
    }
}

/// Everything needed to bring an estimator back to exactly the state it was
/// saved in. The bandwidth is kept in the representation it had on the device.
#[derive(Clone, Debug, PartialEq)]
pub struct ModelSnapshot {
    pub table: TableId,
    pub columns: ColumnSet,
    pub rows_in_table: u64,
    pub rows_in_sample: u64,
    pub representation: BandwidthRepresentation,
    pub bandwidth: Vec<f64>,
    /// Row major, `rows_in_sample * dimensions` values.
    pub sample: Vec<f64>,
    pub karma: Vec<f64>,
    pub mean: Vec<f64>,
    pub sdev: Vec<f64>,
}

fn write_values(target: &mut Vec<u8>, values: &[f64]) {
    for value in values {
        // Writing into a Vec can't fail
        let _ = target.write_f64::<LittleEndian>(*value);
    }
}

fn read_values(cursor: &mut Cursor<&[u8]>, n: usize) -> Result<Vec<f64>, SnapshotError> {
    let has = cursor.get_ref().len().saturating_sub(cursor.position() as usize);
    // n comes from the file header and can be anything
    let need = n.checked_mul(8).ok_or(SnapshotError::Truncated { need: usize::MAX, has })?;
    if has < need {
        return Err(SnapshotError::Truncated { need, has });
    }
    let mut values = Vec::with_capacity(n);
    for _ in 0..n {
        values.push(cursor.read_f64::<LittleEndian>().map_err(|_| SnapshotError::Truncated { need: 8, has: 0 })?);
    }
    Ok(values)
}

fn representation_tag(representation: BandwidthRepresentation) -> u8 {
    match representation {
        BandwidthRepresentation::Plain => 0,
        BandwidthRepresentation::Log => 1,
    }
}

impl ModelSnapshot {
    pub fn dimensions(&self) -> usize {
        self.columns.len()
    }

    pub fn validate(&self) -> Result<(), SnapshotError> {
        let d = self.dimensions();
        let n = usize::try_from(self.rows_in_sample)
            .map_err(|_| SnapshotError::Inconsistent(format!("{} sample points", self.rows_in_sample)))?;
        if d == 0 {
            return Err(SnapshotError::Inconsistent("model without columns".into()));
        }
        if self.bandwidth.len() != d || self.mean.len() != d || self.sdev.len() != d {
            return Err(SnapshotError::Inconsistent(format!(
                "{} dimensions but {} bandwidths, {} means and {} deviations",
                d,
                self.bandwidth.len(),
                self.mean.len(),
                self.sdev.len()
            )));
        }
        if n.checked_mul(d) != Some(self.sample.len()) || self.karma.len() != n {
            return Err(SnapshotError::Inconsistent(format!(
                "{} sample values and {} karma values for {} points",
                self.sample.len(),
                self.karma.len(),
                n
            )));
        }
        Ok(())
    }

    /// The sample blob: sample coordinates row by row, then karma, then the
    /// mean vector, then the standard deviations.
    pub fn blob(&self) -> Vec<u8> {
        let mut blob = Vec::with_capacity(8 * (self.sample.len() + self.karma.len() + 2 * self.mean.len()));
        write_values(&mut blob, &self.sample);
        write_values(&mut blob, &self.karma);
        write_values(&mut blob, &self.mean);
        write_values(&mut blob, &self.sdev);
        blob
    }

    /// Splits a blob written by `blob` back up. Returns sample, karma, mean and sdev.
    pub fn split_blob(
        blob: &[u8],
        points: usize,
        dimensions: usize,
    ) -> Result<(Vec<f64>, Vec<f64>, Vec<f64>, Vec<f64>), SnapshotError> {
        let mut cursor = Cursor::new(blob);
        let values = points
            .checked_mul(dimensions)
            .ok_or(SnapshotError::Truncated { need: usize::MAX, has: blob.len() })?;
        let sample = read_values(&mut cursor, values)?;
        let karma = read_values(&mut cursor, points)?;
        let mean = read_values(&mut cursor, dimensions)?;
        let sdev = read_values(&mut cursor, dimensions)?;
        let rest = blob.len() - cursor.position() as usize;
        if rest != 0 {
            return Err(SnapshotError::TrailingBytes(rest));
        }
        Ok((sample, karma, mean, sdev))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(MAGIC);
        let _ = bytes.write_u16::<LittleEndian>(VERSION);
        let _ = bytes.write_u32::<LittleEndian>(self.table);
        let _ = bytes.write_u32::<LittleEndian>(self.columns.bits());
        let _ = bytes.write_u64::<LittleEndian>(self.rows_in_table);
        let _ = bytes.write_u64::<LittleEndian>(self.rows_in_sample);
        bytes.push(representation_tag(self.representation));
        write_values(&mut bytes, &self.bandwidth);
        bytes.extend_from_slice(&self.blob());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<ModelSnapshot, SnapshotError> {
        const HEADER: usize = 4 + 2 + 4 + 4 + 8 + 8 + 1;
        if bytes.len() < HEADER {
            return Err(SnapshotError::Truncated { need: HEADER, has: bytes.len() });
        }
        let mut cursor = Cursor::new(bytes);
        let mut magic = [0u8; 4];
        let truncated = |_| SnapshotError::Truncated { need: HEADER, has: bytes.len() };
        cursor.read_exact(&mut magic).map_err(truncated)?;
        if &magic != MAGIC {
            return Err(SnapshotError::BadMagic);
        }
        let version = cursor.read_u16::<LittleEndian>().map_err(truncated)?;
        if version != VERSION {
            return Err(SnapshotError::UnsupportedVersion(version));
        }
        let table = cursor.read_u32::<LittleEndian>().map_err(truncated)?;
        let columns = ColumnSet::from_bits(cursor.read_u32::<LittleEndian>().map_err(truncated)?);
        let rows_in_table = cursor.read_u64::<LittleEndian>().map_err(truncated)?;
        let rows_in_sample = cursor.read_u64::<LittleEndian>().map_err(truncated)?;
        let representation = match cursor.read_u8().map_err(truncated)? {
            0 => BandwidthRepresentation::Plain,
            1 => BandwidthRepresentation::Log,
            other => return Err(SnapshotError::UnknownRepresentation(other)),
        };
        let dimensions = columns.len();
        let bandwidth = read_values(&mut cursor, dimensions)?;
        let position = cursor.position() as usize;
        let points = usize::try_from(rows_in_sample)
            .map_err(|_| SnapshotError::Truncated { need: usize::MAX, has: bytes.len() })?;
        let (sample, karma, mean, sdev) = ModelSnapshot::split_blob(&bytes[position..], points, dimensions)?;
        let snapshot = ModelSnapshot {
            table,
            columns,
            rows_in_table,
            rows_in_sample,
            representation,
            bandwidth,
            sample,
            karma,
            mean,
            sdev,
        };
        snapshot.validate()?;
        Ok(snapshot)
    }
}
