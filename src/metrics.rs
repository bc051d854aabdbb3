use std::fmt::Display;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::str::FromStr;

use itertools::Itertools;
use parking_lot::Mutex;

use crate::config::UnknownOption;
use crate::error::Result;
use crate::estimator::TableId;

/// Keeps logarithms and divisions defined when estimate or truth are zero.
const EPSILON: f64 = 1e-10;

/// The error metrics the bandwidth optimizers can minimize.
///
/// `gradient_factor` is the derivative of `loss` with respect to the estimate.
/// Both optimizers multiply it with the derivative of the estimate with respect
/// to the bandwidth. The row count `n` is accepted so metrics that weigh by
/// table size can be added, none of the current ones use it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorMetric {
    Absolute,
    Relative,
    Quadratic,
    SquaredQError,
    SquaredRelative,
}

impl ErrorMetric {
    pub fn all() -> [ErrorMetric; 5] {
        [
            ErrorMetric::Absolute,
            ErrorMetric::Relative,
            ErrorMetric::Quadratic,
            ErrorMetric::SquaredQError,
            ErrorMetric::SquaredRelative,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            ErrorMetric::Absolute => "Absolute",
            ErrorMetric::Relative => "Relative",
            ErrorMetric::Quadratic => "Quadratic",
            ErrorMetric::SquaredQError => "SquaredQError",
            ErrorMetric::SquaredRelative => "SquaredRelative",
        }
    }

    pub fn loss(&self, estimate: f64, truth: f64, _n: f64) -> f64 {
        match self {
            ErrorMetric::Absolute => (truth - estimate).abs(),
            ErrorMetric::Relative => (truth - estimate).abs() / (EPSILON + truth),
            ErrorMetric::Quadratic => (truth - estimate).powi(2),
            ErrorMetric::SquaredQError => ((EPSILON + truth).ln() - (EPSILON + estimate).ln()).powi(2),
            ErrorMetric::SquaredRelative => ((truth - estimate) / (EPSILON + truth)).powi(2),
        }
    }

    pub fn gradient_factor(&self, estimate: f64, truth: f64, _n: f64) -> f64 {
        match self {
            ErrorMetric::Absolute => sign(estimate - truth),
            ErrorMetric::Relative => sign(estimate - truth) / (EPSILON + truth),
            ErrorMetric::Quadratic => 2.0 * (estimate - truth),
            ErrorMetric::SquaredQError => {
                2.0 * ((EPSILON + estimate).ln() - (EPSILON + truth).ln()) / (EPSILON + estimate)
            }
            ErrorMetric::SquaredRelative => 2.0 * (estimate - truth) / (EPSILON + truth).powi(2),
        }
    }
}

// f64::signum maps 0 to 1, we want 0 there
fn sign(x: f64) -> f64 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    }
}

impl Display for ErrorMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ErrorMetric {
    type Err = UnknownOption;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let normalized = s.to_ascii_lowercase().replace(['_', '-'], "");
        if let Ok(index) = normalized.parse::<usize>() {
            return ErrorMetric::all().get(index).copied().ok_or(UnknownOption(s.to_string()));
        }
        ErrorMetric::all()
            .into_iter()
            .find(|m| m.name().to_ascii_lowercase() == normalized || (normalized == "squaredq" && *m == ErrorMetric::SquaredQError))
            .ok_or(UnknownOption(s.to_string()))
    }
}

/// Appends one line per observed feedback to an error log, scoring the estimate
/// with every metric.
pub struct ErrorReporter {
    file: Mutex<BufWriter<File>>,
}

impl ErrorReporter {
    pub fn create(path: impl AsRef<Path>) -> Result<ErrorReporter> {
        let file = OpenOptions::new().create(true).write(true).truncate(true).open(path)?;
        let mut writer = BufWriter::new(file);
        writeln!(
            writer,
            "Relation ID ; {} ; Estimate ; Truth ; Tuples",
            ErrorMetric::all().iter().map(|m| m.name()).join(" ; ")
        )?;
        writer.flush()?;
        Ok(ErrorReporter { file: Mutex::new(writer) })
    }

    pub fn report(&self, table: TableId, estimate: f64, truth: f64, rows: f64) -> Result<()> {
        let errors = ErrorMetric::all().iter().map(|m| format!("{:e}", m.loss(estimate, truth, rows))).join(" ; ");
        let mut file = self.file.lock();
        writeln!(file, "{} ; {} ; {:e} ; {:e} ; {:.0}", table, errors, estimate, truth, rows)?;
        file.flush()?;
        Ok(())
    }
}
