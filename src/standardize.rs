//! Per-column transformation of raw features before distances are computed.
//!
//! Statistics are computed over the non-missing cells of each column only, so
//! a masked cell never shifts the centre or spread of its column. Columns with
//! zero spread are centred (where the method centres) but not rescaled.

use ndarray::parallel::prelude::{IndexedParallelIterator, IntoParallelIterator, ParallelIterator};
use ndarray::{Array2, ArrayView1, ArrayView2, ArrayViewMut1, Axis};

/// Column transformation applied to the feature matrix.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[non_exhaustive]
pub enum Standardization {
    /// Use values as given
    #[default]
    Raw,

    /// Subtract the column mean
    Demean,

    /// Subtract the mean and divide by the sample standard deviation
    ZScore,

    /// Subtract the mean and divide by the mean absolute deviation
    MeanAbsoluteDeviation,

    /// Divide by the column range
    RangeAdjust,

    /// Map the column onto `[0, 1]`
    RangeStandardize,
}

impl Standardization {
    /// Returns a transformed copy of `x`.
    ///
    /// # Arguments
    /// * `x` - Feature matrix, one observation per row
    /// * `mask` - Optional missing-value mask with the same shape as `x`;
    ///   callers validate the shape beforehand
    #[must_use]
    pub fn apply(self, x: ArrayView2<f64>, mask: Option<ArrayView2<bool>>) -> Array2<f64> {
        let mut out = x.to_owned();
        if self == Standardization::Raw {
            return out;
        }

        out.axis_iter_mut(Axis(1))
            .into_par_iter()
            .enumerate()
            .for_each(|(k, column)| {
                self.apply_column(column, mask.as_ref().map(|mask| mask.column(k)));
            });

        out
    }

    fn apply_column(self, mut column: ArrayViewMut1<f64>, missing: Option<ArrayView1<bool>>) {
        let present = |i: usize| missing.map_or(true, |missing| !missing[i]);
        let values: Vec<f64> = column
            .iter()
            .enumerate()
            .filter(|&(i, _)| present(i))
            .map(|(_, &v)| v)
            .collect();

        if values.is_empty() {
            return;
        }

        #[allow(clippy::cast_precision_loss)]
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);

        let (shift, scale) = match self {
            Standardization::Raw => return,
            Standardization::Demean => (mean, 1.0),
            Standardization::ZScore => {
                let ss: f64 = values.iter().map(|v| (v - mean).powi(2)).sum();
                let sd = if values.len() > 1 {
                    (ss / (n - 1.0)).sqrt()
                } else {
                    0.0
                };
                (mean, sd)
            }
            Standardization::MeanAbsoluteDeviation => {
                let mad = values.iter().map(|v| (v - mean).abs()).sum::<f64>() / n;
                (mean, mad)
            }
            Standardization::RangeAdjust => (0.0, max - min),
            Standardization::RangeStandardize => (min, max - min),
        };

        let scale = if scale > 0.0 { scale } else { 1.0 };
        for (i, v) in column.iter_mut().enumerate() {
            if present(i) {
                *v = (*v - shift) / scale;
            }
        }
    }
}
