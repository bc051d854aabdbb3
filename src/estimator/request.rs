use crate::error::{KdeError, Result};
use crate::estimator::columns::ColumnSet;
use crate::estimator::{Estimator, TableId};

/// The kernels integrate over half open intervals. Inclusive bounds get widened
/// by this much so a point sitting exactly on the bound is counted.
pub const INCLUSIVE_PADDING: f64 = 0.001;

#[derive(Clone, Debug, PartialEq)]
pub struct ColumnRange {
    pub column: u32,
    pub lower: f64,
    pub lower_included: bool,
    pub upper: f64,
    pub upper_included: bool,
}

impl ColumnRange {
    pub fn unbounded(column: u32) -> ColumnRange {
        ColumnRange { column, lower: f64::NEG_INFINITY, lower_included: false, upper: f64::INFINITY, upper_included: false }
    }

    /// Bounds with the padding for inclusive ends applied.
    pub fn padded_bounds(&self) -> (f64, f64) {
        let mut lower = self.lower;
        let mut upper = self.upper;
        if self.lower_included {
            lower -= INCLUSIVE_PADDING;
        }
        if self.upper_included {
            upper += INCLUSIVE_PADDING;
        }
        (lower, upper)
    }
}

/// A selectivity request: a sparse list of column ranges, kept sorted by
/// column. Columns without a range are unconstrained.
#[derive(Clone, Debug, PartialEq)]
pub struct RangeRequest {
    pub table: TableId,
    ranges: Vec<ColumnRange>,
}

impl RangeRequest {
    pub fn new(table: TableId) -> RangeRequest {
        RangeRequest { table, ranges: Vec::new() }
    }

    /// Rebuilds a request from stored ranges, merging ranges on the same column.
    pub fn from_ranges(table: TableId, ranges: &[ColumnRange]) -> RangeRequest {
        let mut request = RangeRequest::new(table);
        for range in ranges {
            request.update(range.column, Some(range.lower), range.lower_included, Some(range.upper), range.upper_included);
        }
        request
    }

    pub fn ranges(&self) -> &[ColumnRange] {
        &self.ranges
    }

    pub fn range_count(&self) -> usize {
        self.ranges.len()
    }

    fn range_mut(&mut self, column: u32) -> &mut ColumnRange {
        let position = match self.ranges.binary_search_by_key(&column, |r| r.column) {
            Ok(position) => position,
            Err(position) => {
                self.ranges.insert(position, ColumnRange::unbounded(column));
                position
            }
        };
        &mut self.ranges[position]
    }

    /// Merges a predicate on `column` into the request.
    ///
    /// The tighter bound wins. If a new bound equals the current one, the bound
    /// stays inclusive only if both are inclusive. Inclusiveness of a side is
    /// only touched when a bound for that side is given.
    pub fn update(
        &mut self,
        column: u32,
        lower: Option<f64>,
        lower_included: bool,
        upper: Option<f64>,
        upper_included: bool,
    ) {
        let range = self.range_mut(column);
        if let Some(lower) = lower {
            if lower > range.lower {
                range.lower = lower;
                range.lower_included = lower_included;
            } else if lower == range.lower {
                range.lower_included &= lower_included;
            }
        }
        if let Some(upper) = upper {
            if upper < range.upper {
                range.upper = upper;
                range.upper_included = upper_included;
            } else if upper == range.upper {
                range.upper_included &= upper_included;
            }
        }
    }

    /// `lower <= column <= upper`
    pub fn between(mut self, column: u32, lower: f64, upper: f64) -> RangeRequest {
        self.update(column, Some(lower), true, Some(upper), true);
        self
    }

    /// `column = value`, which narrows the column to a single point.
    pub fn equals(mut self, column: u32, value: f64) -> RangeRequest {
        self.update(column, Some(value), true, Some(value), true);
        self
    }

    pub fn greater_than(mut self, column: u32, value: f64) -> RangeRequest {
        self.update(column, Some(value), false, None, false);
        self
    }

    pub fn less_than(mut self, column: u32, value: f64) -> RangeRequest {
        self.update(column, None, false, Some(value), false);
        self
    }

    pub fn columns(&self) -> Result<ColumnSet> {
        let mut columns = ColumnSet::new();
        for range in &self.ranges {
            columns.insert(range.column)?;
        }
        Ok(columns)
    }

    /// Lays the request out as `[lower_0, upper_0, lower_1, upper_1, ...]` in the
    /// dimension order of a model over `columns`.
    pub fn bounds(&self, columns: &ColumnSet) -> Result<Vec<f64>> {
        if self.ranges.len() > columns.len() {
            return Err(KdeError::UnanswerableRequest(format!(
                "request constrains {} columns, model only has {} dimensions",
                self.ranges.len(),
                columns.len()
            )));
        }
        let mut bounds = Vec::with_capacity(2 * columns.len());
        for _ in 0..columns.len() {
            bounds.push(f64::NEG_INFINITY);
            bounds.push(f64::INFINITY);
        }
        for range in &self.ranges {
            let dimension = columns.dense_index(range.column).ok_or_else(|| {
                KdeError::UnanswerableRequest(format!("column {} is not monitored by the model", range.column))
            })?;
            let (lower, upper) = range.padded_bounds();
            bounds[2 * dimension] = lower;
            bounds[2 * dimension + 1] = upper;
        }
        Ok(bounds)
    }

    pub fn bounds_for(&self, estimator: &Estimator) -> Result<Vec<f64>> {
        self.bounds(&estimator.column_set())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn keeps_ranges_sorted() {
        let request = RangeRequest::new(1).less_than(5, 1.0).greater_than(2, 0.0).less_than(9, 3.0);
        let columns: Vec<u32> = request.ranges().iter().map(|r| r.column).collect();
        assert_eq!(columns, vec![2, 5, 9]);
        assert_eq!(request.ranges()[0].upper, f64::INFINITY);
        assert_eq!(request.ranges()[1].lower, f64::NEG_INFINITY);
    }

    #[test]
    fn tightest_bound_wins() {
        let mut request = RangeRequest::new(1);
        request.update(3, Some(1.0), true, Some(10.0), true);
        request.update(3, Some(4.0), false, None, false);
        request.update(3, Some(2.0), true, Some(7.0), false);
        let range = &request.ranges()[0];
        assert_eq!((range.lower, range.lower_included), (4.0, false));
        assert_eq!((range.upper, range.upper_included), (7.0, false));
    }

    #[test]
    fn looser_bound_keeps_inclusiveness() {
        // A looser bound must not flip the inclusiveness of the tighter one
        let mut request = RangeRequest::new(1).between(0, 5.0, 6.0);
        request.update(0, Some(1.0), false, Some(9.0), false);
        let range = &request.ranges()[0];
        assert!(range.lower_included);
        assert!(range.upper_included);
        assert_eq!((range.lower, range.upper), (5.0, 6.0));
    }

    #[test]
    fn equal_bounds_prefer_exclusive() {
        let mut request = RangeRequest::new(1).between(0, 5.0, 6.0);
        request.update(0, Some(5.0), false, Some(6.0), true);
        let range = &request.ranges()[0];
        assert!(!range.lower_included);
        assert!(range.upper_included);
        // Exclusive never becomes inclusive again
        request.update(0, Some(5.0), true, None, false);
        assert!(!request.ranges()[0].lower_included);
    }

    #[test]
    fn equality_narrows_to_point() {
        let request = RangeRequest::new(1).between(4, 0.0, 100.0).equals(4, 42.0);
        let range = &request.ranges()[0];
        assert_eq!((range.lower, range.upper), (42.0, 42.0));
        assert!(range.lower_included && range.upper_included);
        assert_eq!(range.padded_bounds(), (42.0 - INCLUSIVE_PADDING, 42.0 + INCLUSIVE_PADDING));
    }

    #[test]
    fn bounds_in_dimension_order() {
        let columns = ColumnSet::from_columns(&[1, 4, 6]).unwrap();
        let request = RangeRequest::new(1).greater_than(6, 2.0).between(1, -1.0, 1.0);
        let bounds = request.bounds(&columns).unwrap();
        assert_eq!(bounds.len(), 6);
        assert_eq!(bounds[0], -1.0 - INCLUSIVE_PADDING);
        assert_eq!(bounds[1], 1.0 + INCLUSIVE_PADDING);
        assert_eq!(bounds[2], f64::NEG_INFINITY);
        assert_eq!(bounds[3], f64::INFINITY);
        assert_eq!(bounds[4], 2.0);
        assert_eq!(bounds[5], f64::INFINITY);
    }

    #[test]
    fn unanswerable_requests() {
        let columns = ColumnSet::from_columns(&[1, 2]).unwrap();
        let foreign = RangeRequest::new(1).less_than(3, 0.0);
        assert!(matches!(foreign.bounds(&columns), Err(KdeError::UnanswerableRequest(_))));
        let too_wide = RangeRequest::new(1).less_than(1, 0.0).less_than(2, 0.0).less_than(3, 0.0);
        assert!(matches!(too_wide.bounds(&columns), Err(KdeError::UnanswerableRequest(_))));
    }

    #[test]
    fn rebuilds_from_stored_ranges() {
        let request = RangeRequest::new(7).between(3, 1.0, 2.0).greater_than(0, -4.0);
        let rebuilt = RangeRequest::from_ranges(7, request.ranges());
        assert_eq!(rebuilt, request);
    }
}
