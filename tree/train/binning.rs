use crate::{error::TrainError, extra_columns::ExtraColumns, tree::upper_bound};
use grove_dataframe::{is_missing, reduce_rows, DataFrame, RowMask, WorkerPool};
use grove_metrics::{QuantileSketch, Quantiles, StreamingMetric};
use itertools::Itertools;
use tracing::trace;

/*
Each feature is split only at its candidate split values. Given the candidates `[0.5, 1.5, 2]`, a row's bin for the feature is the number of candidates less than or equal to its value:
0. (-infinity, 0.5)
1. [0.5, 1.5)
2. [1.5, 2)
3. [2, infinity)
4. missing values
*/

/// Compute the candidate split values of each feature column from the rows in `mask`. Each block of rows is sketched separately and the sketches are merged in block order, so the candidates do not depend on the number of threads.
pub fn compute_candidate_splits(
	frame: &DataFrame,
	pool: &WorkerPool,
	feature_columns: &[usize],
	mask: &RowMask,
	max_candidate_splits: usize,
) -> Result<Vec<Vec<f64>>, TrainError> {
	let capacity = (4 * max_candidate_splits).max(100);
	let sketches = reduce_rows(
		frame,
		pool,
		mask,
		vec![QuantileSketch::new(capacity); feature_columns.len()],
		|sketches, _, row| {
			for (sketch, column) in sketches.iter_mut().zip(feature_columns) {
				sketch.update(row[*column] as f64);
			}
		},
		|sketches, other| {
			for (sketch, other) in sketches.iter_mut().zip(other) {
				sketch.merge(other);
			}
		},
	)?;
	let candidate_splits: Vec<Vec<f64>> = sketches
		.into_iter()
		.map(|sketch| candidate_splits_from_quantiles(&sketch.finalize(), max_candidate_splits))
		.collect();
	trace!(
		n_candidate_splits = ?candidate_splits.iter().map(|candidates| candidates.len()).collect::<Vec<_>>(),
		"candidate splits"
	);
	Ok(candidate_splits)
}

/// If there are few enough distinct values, split halfway between each pair of neighbouring values. Otherwise, split at equally spaced quantiles.
fn candidate_splits_from_quantiles(quantiles: &Quantiles, max_candidate_splits: usize) -> Vec<f64> {
	if max_candidate_splits == 0 {
		return Vec::new();
	}
	let knots = quantiles.knots();
	if knots.len() <= max_candidate_splits + 1 {
		return knots
			.iter()
			.tuple_windows()
			.map(|(a, b)| 0.5 * (a.0 + b.0))
			.collect();
	}
	let n_buckets = (max_candidate_splits + 1) as f64;
	let mut candidates: Vec<f64> = (1..=max_candidate_splits)
		.filter_map(|k| quantiles.quantile(100.0 * k as f64 / n_buckets))
		.collect();
	candidates.dedup();
	candidates
}

/// Write every row's bin for each feature into the extra columns.
pub fn write_bins(
	frame: &mut DataFrame,
	pool: &WorkerPool,
	extra_columns: &ExtraColumns,
	feature_columns: &[usize],
	candidate_splits: &[Vec<f64>],
) -> Result<(), TrainError> {
	let n_rows = frame.n_rows();
	frame.write_columns(
		pool,
		0..n_rows,
		None,
		|| (),
		|_, _, row| {
			for (feature, (column, candidates)) in
				feature_columns.iter().zip(candidate_splits).enumerate()
			{
				let value = row[*column];
				let bin = if is_missing(value) {
					candidates.len() + 1
				} else {
					upper_bound(candidates, value as f64)
				};
				extra_columns.write_split(row, feature, bin);
			}
		},
	)?;
	Ok(())
}
