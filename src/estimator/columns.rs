use std::fmt::Display;

use bitvec::prelude::*;
use itertools::Itertools;

use crate::error::{KdeError, Result};

/// Column numbers must be smaller than this.
pub const MAX_COLUMNS: usize = 32;

/// The set of columns an estimator monitors.
///
/// This is a single 32 bit word, so only the first 32 columns of a table can be
/// part of a model. The dense index of a column (its dimension in the model)
/// is its rank in the set, i.e. columns are ordered by column number.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ColumnSet {
    bits: BitArr!(for MAX_COLUMNS, in u32, Lsb0),
}

impl ColumnSet {
    pub fn new() -> ColumnSet {
        ColumnSet::default()
    }

    pub fn from_columns(columns: &[u32]) -> Result<ColumnSet> {
        let mut set = ColumnSet::new();
        for column in columns {
            set.insert(*column)?;
        }
        Ok(set)
    }

    pub fn from_bits(bits: u32) -> ColumnSet {
        ColumnSet { bits: BitArray::new([bits]) }
    }

    pub fn bits(&self) -> u32 {
        self.bits.into_inner()[0]
    }

    pub fn insert(&mut self, column: u32) -> Result<()> {
        if column as usize >= MAX_COLUMNS {
            return Err(KdeError::InvalidArgument(format!(
                "column {} exceeds the limit of {} monitored columns",
                column, MAX_COLUMNS
            )));
        }
        self.bits.set(column as usize, true);
        Ok(())
    }

    pub fn contains(&self, column: u32) -> bool {
        (column as usize) < MAX_COLUMNS && self.bits[column as usize]
    }

    pub fn len(&self) -> usize {
        self.bits.count_ones()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.not_any()
    }

    /// Columns in ascending order, which is also the dimension order.
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.bits.iter_ones().map(|i| i as u32)
    }

    pub fn dense_index(&self, column: u32) -> Option<usize> {
        if !self.contains(column) {
            return None;
        }
        Some(self.bits[..column as usize].count_ones())
    }

    pub fn is_subset_of(&self, other: &ColumnSet) -> bool {
        (self.bits() | other.bits()) == other.bits()
    }
}

impl Display for ColumnSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{{}}}", self.iter().join(", "))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn dense_indices_follow_column_order() {
        let set = ColumnSet::from_columns(&[7, 2, 19]).unwrap();
        assert_eq!(set.len(), 3);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![2, 7, 19]);
        assert_eq!(set.dense_index(2), Some(0));
        assert_eq!(set.dense_index(7), Some(1));
        assert_eq!(set.dense_index(19), Some(2));
        assert_eq!(set.dense_index(3), None);
        assert_eq!(set.to_string(), "{2, 7, 19}");
    }

    #[test]
    fn bits_round_trip() {
        let set = ColumnSet::from_columns(&[0, 31]).unwrap();
        assert_eq!(set.bits(), 0x8000_0001);
        assert_eq!(ColumnSet::from_bits(set.bits()), set);
    }

    #[test]
    fn capacity_is_bounded() {
        assert!(ColumnSet::from_columns(&[32]).is_err());
        assert!(!ColumnSet::new().contains(40));
        assert!(ColumnSet::new().is_empty());
    }

    #[test]
    fn subsets() {
        let model = ColumnSet::from_columns(&[1, 2, 3]).unwrap();
        assert!(ColumnSet::from_columns(&[1, 3]).unwrap().is_subset_of(&model));
        assert!(ColumnSet::new().is_subset_of(&model));
        assert!(!ColumnSet::from_columns(&[1, 4]).unwrap().is_subset_of(&model));
    }
}
