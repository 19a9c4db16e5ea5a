/*!
This module builds row masks whose target distribution matches that of a population of candidate rows. A categorical target is stratified by category. A numeric target is cut into equal probability buckets at quantiles of the candidate rows, and the buckets are treated as categories. The number of rows drawn from each stratum is the stratum's share of the requested count, and the rows of each stratum are chosen by reservoir sampling.
*/

use crate::tree::upper_bound;
use grove_dataframe::{reduce_rows, DataFrame, ReadError, RowMask, WorkerPool};
use grove_metrics::{QuantileSketch, StreamingMetric};
use rand::Rng;
use rand_xoshiro::Xoshiro128Plus;
use thiserror::Error;
use tracing::{error, trace};

/// The number of knots kept by the sketch used to bucket a numeric target.
const QUANTILE_SKETCH_CAPACITY: usize = 75;

/// Fractional sample sizes are scaled by this before rounding down so that sizes which are integers up to floating point error are not lost.
const ROUNDING_TOLERANCE: f64 = 1e-8;

#[derive(Debug, Error)]
pub enum SamplingError {
	#[error("input error: insufficient training data, {n_rows} rows are available but at least {required} are needed")]
	InsufficientTrainingData { n_rows: usize, required: usize },
	#[error("invalid option: at least two folds are needed for cross validation, got {n_folds}")]
	InvalidFolds { n_folds: usize },
	#[error("invalid option: the train fraction per fold must be in (0, 1), got {train_fraction}")]
	InvalidTrainFraction { train_fraction: f64 },
	#[error("internal error: failed to compute the {0} that are needed to create train and test splits")]
	Statistics(&'static str),
}

/// The train and test masks of each fold.
#[derive(Clone, Debug)]
pub struct CrossValidationRowMasks {
	pub train: Vec<RowMask>,
	pub test: Vec<RowMask>,
	/// The frequency of each category of a categorical target over the candidate rows. This is empty for a numeric target.
	pub category_frequencies: Vec<f64>,
}

/// The strata that rows are sampled from.
#[derive(Clone, Debug, PartialEq)]
enum Strata {
	Categories { n_categories: usize },
	Buckets { boundaries: Vec<f64> },
}

impl Strata {
	fn new(
		frame: &DataFrame,
		pool: &WorkerPool,
		target: usize,
		n_buckets: usize,
		mask: &RowMask,
	) -> Result<Self, SamplingError> {
		if let Some(n_categories) = frame.n_categories(target) {
			return Ok(Strata::Categories { n_categories });
		}
		let quantiles = reduce_rows(
			frame,
			pool,
			mask,
			QuantileSketch::new(QUANTILE_SKETCH_CAPACITY),
			|sketch, _, row| sketch.update(row[target] as f64),
			|sketch, other| sketch.merge(other),
		)
		.map_err(|error| log_read_error(error, "target quantiles"))?
		.finalize();
		let n_buckets = n_buckets.max(1);
		let mut boundaries: Vec<f64> = (1..n_buckets)
			.filter_map(|bucket| quantiles.quantile(100.0 * bucket as f64 / n_buckets as f64))
			.collect();
		boundaries.dedup();
		trace!(?boundaries, "target buckets");
		Ok(Strata::Buckets { boundaries })
	}

	fn len(&self) -> usize {
		match self {
			Strata::Categories { n_categories } => *n_categories,
			Strata::Buckets { boundaries } => boundaries.len() + 1,
		}
	}

	/// The stratum of a target value. Rows with a missing target are in no stratum.
	fn of(&self, value: f32) -> Option<usize> {
		if value.is_nan() {
			return None;
		}
		match self {
			Strata::Categories { n_categories } => {
				let category = value as usize;
				if value >= 0.0 && category < *n_categories {
					Some(category)
				} else {
					None
				}
			}
			Strata::Buckets { boundaries } => Some(upper_bound(boundaries, value as f64)),
		}
	}

	fn counts(
		&self,
		frame: &DataFrame,
		pool: &WorkerPool,
		target: usize,
		mask: &RowMask,
	) -> Result<Vec<f64>, ReadError> {
		reduce_rows(
			frame,
			pool,
			mask,
			vec![0.0; self.len()],
			|counts, _, row| {
				if let Some(stratum) = self.of(row[target]) {
					counts[stratum] += 1.0;
				}
			},
			|counts, other| {
				counts
					.iter_mut()
					.zip(other)
					.for_each(|(count, other)| *count += other)
			},
		)
	}
}

fn log_read_error(error: ReadError, what: &'static str) -> SamplingError {
	error!(%error, "failed to compute the {}", what);
	SamplingError::Statistics(what)
}

/// The number of rows in each category of the categorical column `column`, restricted to `mask`. The result is empty if the column is not categorical or the rows could not be read.
pub fn category_counts(
	frame: &DataFrame,
	pool: &WorkerPool,
	mask: &RowMask,
	column: usize,
) -> Vec<f64> {
	let n_categories = match frame.n_categories(column) {
		Some(n_categories) => n_categories,
		None => {
			error!(column, "category counts were requested for a column that is not categorical");
			return Vec::new();
		}
	};
	match (Strata::Categories { n_categories }).counts(frame, pool, column, mask) {
		Ok(counts) => counts,
		Err(error) => {
			log_read_error(error, "category counts");
			Vec::new()
		}
	}
}

/// The fraction of the rows in `mask` that are in each category of `column`.
pub fn category_frequencies(
	frame: &DataFrame,
	pool: &WorkerPool,
	mask: &RowMask,
	column: usize,
) -> Vec<f64> {
	let mut frequencies = category_counts(frame, pool, mask, column);
	let total = (mask.count_ones() as f64).max(1.0);
	frequencies
		.iter_mut()
		.for_each(|frequency| *frequency /= total);
	frequencies
}

/**
Split `desired_count` rows among strata with `counts` rows in proportion to their size. Each share is rounded to the nearest integer, and the total is then corrected by moving rows into or out of the strata with the largest rounding errors. No stratum is given more rows than it has, and the result sums to `desired_count` unless there are fewer rows than that in total.
*/
pub fn allocate_counts(counts: &[f64], desired_count: usize) -> Vec<usize> {
	let total: f64 = counts.iter().sum();
	if total <= 0.0 {
		return vec![0; counts.len()];
	}
	let desired_count = desired_count.min(total as usize);
	let shares: Vec<f64> = counts
		.iter()
		.map(|count| desired_count as f64 * count / total)
		.collect();
	let mut allocation: Vec<usize> = shares
		.iter()
		.zip(counts)
		.map(|(share, count)| (share.round() as usize).min(*count as usize))
		.collect();
	let mut allocated: usize = allocation.iter().sum();
	while allocated < desired_count {
		let stratum = (0..counts.len())
			.filter(|stratum| allocation[*stratum] < counts[*stratum] as usize)
			.max_by(|a, b| {
				let a = shares[*a] - allocation[*a] as f64;
				let b = shares[*b] - allocation[*b] as f64;
				a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Equal)
			});
		match stratum {
			Some(stratum) => allocation[stratum] += 1,
			None => break,
		}
		allocated += 1;
	}
	while allocated > desired_count {
		let stratum = (0..counts.len())
			.filter(|stratum| allocation[*stratum] > 0)
			.max_by(|a, b| {
				let a = allocation[*a] as f64 - shares[*a];
				let b = allocation[*b] as f64 - shares[*b];
				a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Equal)
			});
		match stratum {
			Some(stratum) => allocation[stratum] -= 1,
			None => break,
		}
		allocated -= 1;
	}
	allocation
}

/// One reservoir of row indices per stratum.
#[derive(Clone)]
struct Reservoirs {
	rng: Xoshiro128Plus,
	capacities: Vec<usize>,
	seen: Vec<usize>,
	rows: Vec<Vec<usize>>,
}

impl Reservoirs {
	fn new(rng: Xoshiro128Plus, capacities: Vec<usize>) -> Self {
		let n = capacities.len();
		Self {
			rng,
			rows: capacities.iter().map(|capacity| Vec::with_capacity(*capacity)).collect(),
			capacities,
			seen: vec![0; n],
		}
	}

	fn sample(&mut self, stratum: usize, row_index: usize) {
		let capacity = self.capacities[stratum];
		if capacity == 0 {
			return;
		}
		self.seen[stratum] += 1;
		let rows = &mut self.rows[stratum];
		if rows.len() < capacity {
			rows.push(row_index);
		} else {
			let slot = self.rng.gen_range(0, self.seen[stratum]);
			if slot < capacity {
				rows[slot] = row_index;
			}
		}
	}
}

/// Draw `desired_counts[stratum]` rows uniformly at random from each stratum of the rows in `candidate_mask`.
fn sample_strata(
	frame: &DataFrame,
	strata: &Strata,
	target: usize,
	rng: &mut Xoshiro128Plus,
	desired_counts: Vec<usize>,
	candidate_mask: &RowMask,
) -> Result<RowMask, SamplingError> {
	trace!(?desired_counts, "desired counts per stratum");
	if candidate_mask.len() != frame.n_rows() {
		let error = ReadError::MaskLength {
			mask_len: candidate_mask.len(),
			n_rows: frame.n_rows(),
		};
		return Err(log_read_error(error, "row sample"));
	}
	// Reservoir sampling consumes the random number generator row by row, so it runs on the calling thread.
	let mut reservoirs = Reservoirs::new(rng.clone(), desired_counts);
	for row_index in candidate_mask.ones() {
		if let Some(stratum) = strata.of(frame.value(row_index, target)) {
			reservoirs.sample(stratum, row_index);
		}
	}
	*rng = reservoirs.rng;
	let mut row_indices: Vec<usize> = reservoirs.rows.into_iter().flatten().collect();
	row_indices.sort_unstable();
	trace!(n_rows = row_indices.len(), "sampled rows");
	Ok(RowMask::from_sorted_indices(frame.n_rows(), &row_indices))
}

fn check_training_rows(n_rows: usize, required: usize) -> Result<(), SamplingError> {
	if n_rows < required {
		error!(n_rows, required, "insufficient training data");
		return Err(SamplingError::InsufficientTrainingData { n_rows, required });
	}
	Ok(())
}

/**
Create the train and test masks for `n_folds` fold cross validation over the rows in `candidate_mask`.

Let `s` be the smaller of `train_fraction_per_fold` and its complement. Each fold's smaller side has `s * n` rows, where `n` is the number of candidate rows. The smaller sides are sampled one after the other without replacement from the rows that earlier folds have not taken. If `n_folds` smaller sides cover all the rows, the rows are partitioned into near equal parts, with the last fold taking whatever remains, and any part that falls short of `s * n` is topped up with rows from other parts. A fold whose share is at least the number of remaining rows takes them all.

The smaller sides are the test masks and each train mask is its complement in `candidate_mask`. If `train_fraction_per_fold` is less than one half, the roles are swapped.
*/
#[allow(clippy::too_many_arguments)]
pub fn stratified_cross_validation_row_masks(
	frame: &DataFrame,
	pool: &WorkerPool,
	target: usize,
	rng: &mut Xoshiro128Plus,
	n_folds: usize,
	train_fraction_per_fold: f64,
	n_buckets: usize,
	candidate_mask: &RowMask,
) -> Result<CrossValidationRowMasks, SamplingError> {
	if n_folds < 2 {
		return Err(SamplingError::InvalidFolds { n_folds });
	}
	if !(train_fraction_per_fold > 0.0 && train_fraction_per_fold < 1.0) {
		return Err(SamplingError::InvalidTrainFraction {
			train_fraction: train_fraction_per_fold,
		});
	}
	let n_rows = candidate_mask.count_ones();
	check_training_rows(n_rows, n_folds.max(2))?;

	let strata = Strata::new(frame, pool, target, n_buckets, candidate_mask)?;
	let category_frequencies = match strata {
		Strata::Categories { .. } => {
			category_frequencies(frame, pool, candidate_mask, target)
		}
		Strata::Buckets { .. } => Vec::new(),
	};

	let small_fraction = train_fraction_per_fold.min(1.0 - train_fraction_per_fold);
	let sample_size =
		(((1.0 + ROUNDING_TOLERANCE) * small_fraction * n_rows as f64).floor() as usize).max(1);
	let partition = small_fraction * n_folds as f64 >= 1.0 - ROUNDING_TOLERANCE;
	trace!(sample_size, partition, "fold sizes");

	let mut remaining = candidate_mask.clone();
	let mut small_masks = Vec::with_capacity(n_folds);
	for fold in 0..n_folds {
		let n_remaining = remaining.count_ones();
		let part_size = if !partition {
			sample_size
		} else if fold + 1 == n_folds {
			n_remaining
		} else {
			let share = (1.0 + ROUNDING_TOLERANCE) * n_remaining as f64 / (n_folds - fold) as f64;
			(share.floor() as usize).max(1)
		};
		let mut part = if n_remaining <= part_size {
			std::mem::replace(&mut remaining, RowMask::new(candidate_mask.len(), false))
		} else {
			// Frequencies come from the shrinking pool so that small categories are spread over the folds.
			let counts = strata
				.counts(frame, pool, target, &remaining)
				.map_err(|error| log_read_error(error, "stratum counts"))?;
			let part = sample_strata(
				frame,
				&strata,
				target,
				rng,
				allocate_counts(&counts, part_size),
				&remaining,
			)?;
			remaining ^= &part;
			part
		};
		let part_len = part.count_ones();
		if part_len < sample_size {
			let others = candidate_mask ^ &part;
			let counts = strata
				.counts(frame, pool, target, &others)
				.map_err(|error| log_read_error(error, "stratum counts"))?;
			let extra = sample_strata(
				frame,
				&strata,
				target,
				rng,
				allocate_counts(&counts, sample_size - part_len),
				&others,
			)?;
			part |= &extra;
		}
		trace!(fold, n_rows = part.count_ones(), "fold sample");
		small_masks.push(part);
	}

	let complements: Vec<RowMask> = small_masks
		.iter()
		.map(|small| candidate_mask ^ small)
		.collect();
	let (train, test) = if train_fraction_per_fold < 0.5 {
		(small_masks, complements)
	} else {
		(complements, small_masks)
	};
	Ok(CrossValidationRowMasks {
		train,
		test,
		category_frequencies,
	})
}

/// Sample `desired_count` rows from `candidate_mask` so that the distribution of the target matches that of all the candidate rows.
pub fn stratified_sampling_row_mask(
	frame: &DataFrame,
	pool: &WorkerPool,
	target: usize,
	rng: &mut Xoshiro128Plus,
	desired_count: usize,
	n_buckets: usize,
	candidate_mask: &RowMask,
) -> Result<RowMask, SamplingError> {
	check_training_rows(candidate_mask.count_ones(), 2)?;
	let strata = Strata::new(frame, pool, target, n_buckets, candidate_mask)?;
	let counts = strata
		.counts(frame, pool, target, candidate_mask)
		.map_err(|error| log_read_error(error, "stratum counts"))?;
	sample_strata(
		frame,
		&strata,
		target,
		rng,
		allocate_counts(&counts, desired_count),
		candidate_mask,
	)
}

/**
Sample rows from `candidate_mask` whose target distribution matches that of the rows in `distribution_source_mask`.

For a categorical target, each category gets exactly as many rows as it has in the source rows, or all of its candidate rows if there are fewer, and `desired_count` is not used. For a numeric target, `desired_count` rows are drawn from buckets computed over the source rows.
*/
#[allow(clippy::too_many_arguments)]
pub fn distribution_preserving_sampling_row_mask(
	frame: &DataFrame,
	pool: &WorkerPool,
	target: usize,
	rng: &mut Xoshiro128Plus,
	desired_count: usize,
	n_buckets: usize,
	distribution_source_mask: &RowMask,
	candidate_mask: &RowMask,
) -> Result<RowMask, SamplingError> {
	check_training_rows(candidate_mask.count_ones(), 2)?;
	let strata = Strata::new(frame, pool, target, n_buckets, distribution_source_mask)?;
	let source_counts = strata
		.counts(frame, pool, target, distribution_source_mask)
		.map_err(|error| log_read_error(error, "stratum counts"))?;
	let desired_counts = match strata {
		Strata::Categories { .. } => source_counts.iter().map(|count| *count as usize).collect(),
		Strata::Buckets { .. } => allocate_counts(&source_counts, desired_count),
	};
	sample_strata(frame, &strata, target, rng, desired_counts, candidate_mask)
}

#[cfg(test)]
mod test {
	use super::*;
	use grove_dataframe::ColumnType;
	use proptest::prelude::*;
	use rand::SeedableRng;

	fn pool(n_threads: usize) -> WorkerPool {
		WorkerPool::new(n_threads).unwrap().with_rows_per_block(128)
	}

	/// A frame with a categorical target whose categories have the given counts, interleaved.
	fn categorical_frame(counts: &[usize]) -> DataFrame {
		let options = (0..counts.len()).map(|i| i.to_string()).collect();
		let mut frame = DataFrame::new(
			vec!["target".to_owned()],
			vec![ColumnType::Categorical { options }],
		);
		let mut left = counts.to_vec();
		while left.iter().any(|count| *count > 0) {
			for (category, count) in left.iter_mut().enumerate() {
				if *count > 0 {
					frame.push_row(&[category as f32]);
					*count -= 1;
				}
			}
		}
		frame
	}

	fn numeric_frame(n_rows: usize) -> DataFrame {
		let mut frame = DataFrame::new(vec!["target".to_owned()], vec![ColumnType::Number]);
		for i in 0..n_rows {
			frame.push_row(&[((i * 7919) % n_rows) as f32 / 10.0]);
		}
		frame
	}

	fn assert_folds_are_consistent(masks: &CrossValidationRowMasks, candidate: &RowMask) {
		for (train, test) in masks.train.iter().zip(masks.test.iter()) {
			assert_eq!(train.inner(test), 0);
			assert_eq!(&(train | test), candidate);
		}
	}

	#[test]
	fn test_rare_category_folds_cover_the_rows() {
		let frame = categorical_frame(&[3, 5, 1, 5]);
		let candidate = RowMask::new(frame.n_rows(), true);
		let mut rng = Xoshiro128Plus::seed_from_u64(0);
		let masks = stratified_cross_validation_row_masks(
			&frame, &pool(1), 0, &mut rng, 5, 0.8, 10, &candidate,
		)
		.unwrap();
		assert_folds_are_consistent(&masks, &candidate);
		let mut union = RowMask::new(frame.n_rows(), false);
		for (i, test) in masks.test.iter().enumerate() {
			for other in masks.test.iter().skip(i + 1) {
				assert_eq!(test.inner(other), 0);
			}
			union |= test;
		}
		assert_eq!(union, candidate);
		let sizes: Vec<usize> = masks.test.iter().map(|test| test.count_ones()).collect();
		assert_eq!(sizes, vec![2, 3, 3, 3, 3]);
		assert_eq!(masks.category_frequencies.len(), 4);
	}

	#[test]
	fn test_equal_folds() {
		let frame = categorical_frame(&[10, 10, 5]);
		let candidate = RowMask::new(frame.n_rows(), true);
		let mut rng = Xoshiro128Plus::seed_from_u64(1);
		let masks = stratified_cross_validation_row_masks(
			&frame, &pool(2), 0, &mut rng, 5, 0.8, 10, &candidate,
		)
		.unwrap();
		assert_folds_are_consistent(&masks, &candidate);
		for test in masks.test.iter() {
			assert_eq!(test.count_ones(), 5);
		}
	}

	#[test]
	fn test_small_train_fraction_swaps_roles() {
		let frame = numeric_frame(2000);
		let mut candidate = RowMask::new(1000, true);
		candidate.extend(false, 10);
		candidate.extend(true, 990);
		for &(train_fraction, train_size) in &[(0.1, 199), (0.4, 796)] {
			let mut rng = Xoshiro128Plus::seed_from_u64(2);
			let masks = stratified_cross_validation_row_masks(
				&frame,
				&pool(3),
				0,
				&mut rng,
				3,
				train_fraction,
				10,
				&candidate,
			)
			.unwrap();
			assert_folds_are_consistent(&masks, &candidate);
			for train in masks.train.iter() {
				assert_eq!(train.count_ones(), train_size);
			}
			assert!(masks.category_frequencies.is_empty());
		}
	}

	#[test]
	fn test_insufficient_rows() {
		let frame = categorical_frame(&[1, 2]);
		let candidate = RowMask::new(frame.n_rows(), true);
		let mut rng = Xoshiro128Plus::seed_from_u64(0);
		let result =
			stratified_cross_validation_row_masks(&frame, &pool(1), 0, &mut rng, 4, 0.75, 10, &candidate);
		assert!(matches!(
			result,
			Err(SamplingError::InsufficientTrainingData {
				n_rows: 3,
				required: 4
			})
		));
	}

	#[test]
	fn test_stratified_sample_matches_frequencies() {
		let frame = categorical_frame(&[600, 300, 100]);
		let candidate = RowMask::new(frame.n_rows(), true);
		let mut rng = Xoshiro128Plus::seed_from_u64(3);
		let sample =
			stratified_sampling_row_mask(&frame, &pool(2), 0, &mut rng, 100, 10, &candidate).unwrap();
		assert_eq!(category_counts(&frame, &pool(1), &sample, 0), vec![60.0, 30.0, 10.0]);
		let frequencies = category_frequencies(&frame, &pool(3), &candidate, 0);
		assert_eq!(frequencies, vec![0.6, 0.3, 0.1]);
	}

	#[test]
	fn test_numeric_stratified_sample_size() {
		let frame = numeric_frame(1000);
		let candidate = RowMask::new(frame.n_rows(), true);
		let mut rng = Xoshiro128Plus::seed_from_u64(4);
		let sample =
			stratified_sampling_row_mask(&frame, &pool(2), 0, &mut rng, 150, 5, &candidate).unwrap();
		assert!((sample.count_ones() as f64 - 150.0).abs() <= 7.5);
	}

	#[test]
	fn test_distribution_preserving_sample() {
		let frame = categorical_frame(&[50, 50, 50]);
		let mut source = RowMask::new(0, false);
		for row in 0..frame.n_rows() {
			// All rows of category 0 and a third of the rows of category 1.
			source.push(row % 3 == 0 || row % 9 == 1);
		}
		let candidate = !&source;
		let source_counts = category_counts(&frame, &pool(1), &source, 0);
		let mut rng = Xoshiro128Plus::seed_from_u64(5);
		let sample = distribution_preserving_sampling_row_mask(
			&frame, &pool(1), 0, &mut rng, 0, 10, &source, &candidate,
		)
		.unwrap();
		assert_eq!(sample.inner(&source), 0);
		let candidate_counts = category_counts(&frame, &pool(1), &candidate, 0);
		let expected: Vec<f64> = source_counts
			.iter()
			.zip(candidate_counts.iter())
			.map(|(source, candidate)| source.min(*candidate))
			.collect();
		assert_eq!(category_counts(&frame, &pool(1), &sample, 0), expected);
	}

	#[test]
	fn test_category_counts_of_a_numeric_column() {
		let frame = numeric_frame(10);
		assert!(category_counts(&frame, &pool(1), &RowMask::new(10, true), 0).is_empty());
	}

	#[test]
	fn test_numeric_folds_do_not_depend_on_n_threads() {
		let frame = numeric_frame(3000);
		let candidate = RowMask::new(frame.n_rows(), true);
		let folds = |n_threads| {
			let mut rng = Xoshiro128Plus::seed_from_u64(6);
			let masks = stratified_cross_validation_row_masks(
				&frame,
				&pool(n_threads),
				0,
				&mut rng,
				3,
				0.75,
				10,
				&candidate,
			)
			.unwrap();
			(masks.train, masks.test)
		};
		let single = folds(1);
		assert_eq!(folds(4), single);
		assert_eq!(folds(2), single);
		let sample = |n_threads| {
			let mut rng = Xoshiro128Plus::seed_from_u64(7);
			stratified_sampling_row_mask(&frame, &pool(n_threads), 0, &mut rng, 500, 10, &candidate)
				.unwrap()
		};
		assert_eq!(sample(4), sample(1));
	}

	proptest! {
		#[test]
		fn test_allocation(counts in proptest::collection::vec(0usize..50, 1..8), desired in 0usize..200) {
			let counts: Vec<f64> = counts.into_iter().map(|count| count as f64).collect();
			let total = counts.iter().sum::<f64>() as usize;
			let allocation = allocate_counts(&counts, desired);
			prop_assert_eq!(allocation.iter().sum::<usize>(), desired.min(total));
			for (allocated, count) in allocation.iter().zip(counts.iter()) {
				prop_assert!(*allocated as f64 <= *count);
			}
		}
	}
}
