use self::{early_stopping::EarlyStoppingMonitor, grow::Trainer};
use crate::{
	encoder::CategoryEncoder,
	error::TrainError,
	extra_columns::{ExtraColumns, WeightColumn},
	loss::{Loss, LossKind},
	sampling::{stratified_cross_validation_row_masks, stratified_sampling_row_mask},
	tree::Forest,
	TrainOptions, TrainProgress,
};
use grove_dataframe::{is_missing, DataFrame, RowMask, WorkerPool};
use grove_metrics::{MeanVariance, StreamingMetric};
use grove_util::{finite::Finite, progress_counter::ProgressCounter};
use rand::SeedableRng;
use rand_xoshiro::Xoshiro128Plus;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

mod binning;
mod early_stopping;
mod grow;
mod incremental;
mod newton;

pub use self::incremental::IncrementalTrainReport;

/// A trained gradient boosted tree model, together with everything needed to keep training it on the frame it was trained on.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BoostedTree {
	loss: LossKind,
	target_column: usize,
	encoder: CategoryEncoder,
	extra_columns: ExtraColumns,
	candidate_splits: Vec<Vec<f64>>,
	forest: Forest,
	options: TrainOptions,
	/// The mean training loss after each tree of the final forest.
	losses: Vec<f64>,
	cross_validation: Option<CrossValidationReport>,
}

/// The test losses of the cross validation forests, used to choose the number of trees.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CrossValidationReport {
	/// The number of trees, including the first, at which the mean test loss is smallest.
	pub n_trees: usize,
	/// The mean over the folds of the test loss after each round. A fold that stopped early contributes its last loss to the later rounds.
	pub mean_test_losses: Vec<f64>,
	pub test_loss_variances: Vec<f64>,
}

impl CrossValidationReport {
	fn from_fold_losses(fold_losses: &[Vec<f64>], max_trees: usize) -> Self {
		let n_rounds = fold_losses.iter().map(|losses| losses.len()).max().unwrap_or(0);
		let mut mean_test_losses = Vec::with_capacity(n_rounds);
		let mut test_loss_variances = Vec::with_capacity(n_rounds);
		for round in 0..n_rounds {
			let mut metric = MeanVariance::default();
			for losses in fold_losses.iter().filter(|losses| !losses.is_empty()) {
				metric.update(losses[round.min(losses.len() - 1)]);
			}
			let (mean, variance) = metric
				.finalize()
				.map(|output| (output.mean, output.variance))
				.unwrap_or((f64::NAN, f64::NAN));
			mean_test_losses.push(mean);
			test_loss_variances.push(variance);
		}
		// Ties go to the smaller forest.
		let n_trees = mean_test_losses
			.iter()
			.enumerate()
			.filter_map(|(round, loss)| Finite::new(*loss).ok().map(|loss| (loss, round)))
			.min()
			.map(|(_, round)| round + 1)
			.unwrap_or(max_trees);
		Self {
			n_trees,
			mean_test_losses,
			test_loss_variances,
		}
	}
}

impl BoostedTree {
	/**
	Train a forest to predict column `target_column` of `frame` using `loss`.

	Rows with a missing target are not trained on. Every other column that was loaded, other than the weight column, is a feature. The model's extra columns are appended to `frame`, and when training finishes their prediction region holds the forest's prediction for every row.
	*/
	pub fn train(
		frame: &mut DataFrame,
		target_column: usize,
		loss: LossKind,
		options: TrainOptions,
		update_progress: &mut dyn FnMut(TrainProgress),
	) -> Result<Self, TrainError> {
		let result = Self::train_forest(frame, target_column, loss, options, update_progress);
		if let Err(error) = &result {
			error!(%error, "training failed");
		}
		result
	}

	fn train_forest(
		frame: &mut DataFrame,
		target_column: usize,
		loss_kind: LossKind,
		options: TrainOptions,
		update_progress: &mut dyn FnMut(TrainProgress),
	) -> Result<Self, TrainError> {
		let loss = loss_kind.into_loss();
		validate(frame, target_column, loss.as_ref(), &options)?;
		let pool = WorkerPool::new(options.n_threads)?;

		let progress_counter = ProgressCounter::new(3);
		update_progress(TrainProgress::Initializing(progress_counter.clone()));

		// Train on the rows with a target.
		let train_mask = rows_with_target(frame, &pool, target_column)?;
		let n_train = train_mask.count_ones();
		let required = if options.n_folds >= 2 {
			options.n_folds.max(2)
		} else {
			2
		};
		if n_train < required {
			return Err(TrainError::InsufficientTrainingData {
				n_rows: n_train,
				required,
			});
		}
		progress_counter.inc(1);

		// Every loaded column other than the target and the weight is a feature.
		let feature_columns: Vec<usize> = (0..frame.n_columns())
			.filter(|column| {
				*column != target_column
					&& Some(*column) != options.weight_column
					&& !frame.is_extra(*column)
			})
			.collect();
		let weight = options
			.weight_column
			.map(WeightColumn::Column)
			.unwrap_or(WeightColumn::Unit);
		let n_parameters = loss.n_parameters();
		let first_extra_column =
			frame.add_columns(ExtraColumns::n_extra_columns(n_parameters, feature_columns.len()));
		let extra_columns = ExtraColumns::new(
			first_extra_column,
			n_parameters,
			feature_columns.len(),
			weight,
		)?;
		progress_counter.inc(1);

		// Compute the candidate splits and write every row's bins.
		let candidate_splits = binning::compute_candidate_splits(
			frame,
			&pool,
			&feature_columns,
			&train_mask,
			options.max_candidate_splits,
		)?;
		binning::write_bins(
			frame,
			&pool,
			&extra_columns,
			&feature_columns,
			&candidate_splits,
		)?;
		progress_counter.inc(1);

		let encoder = CategoryEncoder::new(feature_columns);
		let trainer = Trainer {
			pool: &pool,
			target: target_column,
			loss: loss.as_ref(),
			encoder: &encoder,
			extra_columns: &extra_columns,
			candidate_splits: &candidate_splits,
			options: &options,
		};
		let mut rng = Xoshiro128Plus::seed_from_u64(options.seed);

		// Choose the number of trees with cross validation.
		let cross_validation = if options.n_folds >= 2 {
			let masks = stratified_cross_validation_row_masks(
				frame,
				&pool,
				target_column,
				&mut rng,
				options.n_folds,
				options.train_fraction_per_fold,
				options.n_buckets,
				&train_mask,
			)?;
			let early_stopping_options = options.early_stopping_options.clone().unwrap_or_default();
			let progress_counter = ProgressCounter::new((options.n_folds * options.max_trees) as u64);
			update_progress(TrainProgress::CrossValidating(progress_counter.clone()));
			let mut fold_losses = Vec::with_capacity(options.n_folds);
			for (fold, (train, test)) in masks.train.iter().zip(masks.test.iter()).enumerate() {
				let grown = trainer.grow_forest(
					frame,
					train,
					Some(test),
					options.max_trees,
					Some(EarlyStoppingMonitor::from_options(&early_stopping_options)),
					&mut rng,
					Some(&progress_counter),
				)?;
				debug!(
					fold,
					n_trees = grown.forest.len(),
					test_loss = ?grown.test_losses.last(),
					"grew cross validation forest"
				);
				fold_losses.push(grown.test_losses);
			}
			let report = CrossValidationReport::from_fold_losses(&fold_losses, options.max_trees);
			debug!(n_trees = report.n_trees, "chose the number of trees");
			Some(report)
		} else {
			None
		};

		// Without cross validation, early stopping holds out a sample of the training rows.
		let (final_train_mask, early_stopping_mask, early_stopping_monitor) = match (
			&cross_validation,
			&options.early_stopping_options,
		) {
			(None, Some(early_stopping_options)) => {
				let desired_count = ((early_stopping_options.early_stopping_fraction
					* n_train as f64)
					.round() as usize)
					.max(1)
					.min(n_train - 1);
				let test_mask = stratified_sampling_row_mask(
					frame,
					&pool,
					target_column,
					&mut rng,
					desired_count,
					options.n_buckets,
					&train_mask,
				)?;
				let train = &train_mask ^ &test_mask;
				(
					train,
					Some(test_mask),
					Some(EarlyStoppingMonitor::from_options(early_stopping_options)),
				)
			}
			_ => (train_mask.clone(), None, None),
		};

		// Grow the final forest.
		let max_trees = cross_validation
			.as_ref()
			.map(|report| report.n_trees)
			.unwrap_or(options.max_trees);
		let progress_counter = ProgressCounter::new(max_trees as u64);
		update_progress(TrainProgress::Training(progress_counter.clone()));
		let grown = trainer.grow_forest(
			frame,
			&final_train_mask,
			early_stopping_mask.as_ref(),
			max_trees,
			early_stopping_monitor,
			&mut rng,
			Some(&progress_counter),
		)?;
		debug!(
			n_trees = grown.forest.len(),
			n_nodes = grown.forest.n_nodes(),
			train_loss = ?grown.train_losses.last(),
			"trained forest"
		);

		Ok(Self {
			loss: loss_kind,
			target_column,
			encoder,
			extra_columns,
			candidate_splits,
			forest: grown.forest,
			options,
			losses: grown.train_losses,
			cross_validation,
		})
	}

	/**
	Append `n_parameters` columns to `frame` and write the forest's raw prediction for every row into them. Returns the index of the first new column.

	The rows are traversed by re-evaluating each split on the row's feature values, so `frame` need only have the columns the model was trained on.
	*/
	pub fn predict(&self, frame: &mut DataFrame, n_threads: usize) -> Result<usize, TrainError> {
		self.check_columns(frame)?;
		let pool = WorkerPool::new(n_threads)?;
		let n_parameters = self.n_parameters();
		let first = frame.add_columns(n_parameters);
		let n_rows = frame.n_rows();
		frame.write_columns(
			&pool,
			0..n_rows,
			None,
			|| vec![0.0; n_parameters],
			|prediction, _, row| {
				self.forest.predict(&self.encoder.encode(row), prediction);
				for (cell, value) in row[first..first + n_parameters].iter_mut().zip(prediction.iter()) {
					*cell = *value as f32;
				}
			},
		)?;
		Ok(first)
	}

	/// Write the model's output for a single row, for example class probabilities for a classification loss, to `out`, which must have `n_parameters` entries.
	pub fn predict_row(&self, row: &[f32], out: &mut [f64]) {
		let mut raw = vec![0.0; self.n_parameters()];
		self.forest.predict(&self.encoder.encode(row), &mut raw);
		let raw: Vec<f32> = raw.iter().map(|value| *value as f32).collect();
		self.loss.into_loss().transform(&raw, out);
	}

	fn check_columns(&self, frame: &DataFrame) -> Result<(), TrainError> {
		if let Some(expected) = self.encoder.feature_columns().iter().max() {
			if *expected >= frame.n_columns() {
				return Err(TrainError::ColumnCount {
					expected: *expected,
					n_columns: frame.n_columns(),
				});
			}
		}
		Ok(())
	}

	pub fn loss(&self) -> LossKind {
		self.loss
	}

	pub fn n_parameters(&self) -> usize {
		self.extra_columns.n_parameters()
	}

	pub fn target_column(&self) -> usize {
		self.target_column
	}

	pub fn forest(&self) -> &Forest {
		&self.forest
	}

	pub fn encoder(&self) -> &CategoryEncoder {
		&self.encoder
	}

	/// The layout of the extra columns that were last appended to the training frame.
	pub fn extra_columns(&self) -> &ExtraColumns {
		&self.extra_columns
	}

	pub fn candidate_splits(&self) -> &[Vec<f64>] {
		&self.candidate_splits
	}

	pub fn options(&self) -> &TrainOptions {
		&self.options
	}

	pub fn losses(&self) -> &[f64] {
		&self.losses
	}

	pub fn cross_validation(&self) -> Option<&CrossValidationReport> {
		self.cross_validation.as_ref()
	}

	pub fn to_json(&self) -> Result<String, TrainError> {
		Ok(serde_json::to_string(self)?)
	}

	pub fn from_json(json: &str) -> Result<Self, TrainError> {
		Ok(serde_json::from_str(json)?)
	}
}

fn validate(
	frame: &DataFrame,
	target_column: usize,
	loss: &dyn Loss,
	options: &TrainOptions,
) -> Result<(), TrainError> {
	if target_column >= frame.n_columns() || frame.is_extra(target_column) {
		return Err(TrainError::InvalidTargetColumn {
			column: target_column,
		});
	}
	if let Some(column) = options.weight_column {
		if column >= frame.n_columns() || column == target_column || frame.is_extra(column) {
			return Err(TrainError::InvalidWeightColumn { column });
		}
	}
	if loss.is_classification() {
		let n_categories = match frame.n_categories(target_column) {
			Some(n_categories) => n_categories,
			None => {
				return Err(TrainError::TargetTypeMismatch {
					loss: loss.name(),
					column: target_column,
				})
			}
		};
		// The binomial loss has a single parameter for two classes.
		let n_classes = match loss.n_parameters() {
			1 => 2,
			n_parameters => n_parameters,
		};
		if n_categories != n_classes {
			return Err(TrainError::CategoryCountMismatch {
				loss: loss.name(),
				n_categories,
				n_classes,
			});
		}
	}
	let invalid = |message: &str| Err(TrainError::InvalidOptions(message.to_owned()));
	if options.n_threads == 0 {
		return invalid("n_threads must be at least one");
	}
	if options.max_trees == 0 {
		return invalid("max_trees must be at least one");
	}
	if options.max_leaves < 1 {
		return invalid("max_leaves must be at least one");
	}
	if !(options.eta > 0.0 && options.eta.is_finite()) {
		return invalid("eta must be positive");
	}
	if !(options.eta_growth_rate_per_tree > 0.0 && options.eta_growth_rate_per_tree.is_finite()) {
		return invalid("eta_growth_rate_per_tree must be positive");
	}
	if options.lambda.is_nan() || options.lambda < 0.0 || options.gamma.is_nan() || options.gamma < 0.0 {
		return invalid("lambda and gamma must not be negative");
	}
	if !(options.feature_bag_fraction > 0.0 && options.feature_bag_fraction <= 1.0) {
		return invalid("feature_bag_fraction must be in (0, 1]");
	}
	if !(options.downsample_factor > 0.0 && options.downsample_factor <= 1.0) {
		return invalid("downsample_factor must be in (0, 1]");
	}
	if let Some(early_stopping_options) = &options.early_stopping_options {
		let fraction = early_stopping_options.early_stopping_fraction;
		if !(fraction > 0.0 && fraction < 1.0) {
			return invalid("early_stopping_fraction must be in (0, 1)");
		}
	}
	Ok(())
}

/// The rows whose target is not missing.
fn rows_with_target(
	frame: &DataFrame,
	pool: &WorkerPool,
	target_column: usize,
) -> Result<RowMask, TrainError> {
	let row_indices: Vec<usize> = frame
		.read_rows(
			pool,
			0..frame.n_rows(),
			None,
			Vec::new(),
			|row_indices, row_index, row| {
				if !is_missing(row[target_column]) {
					row_indices.push(row_index);
				}
			},
		)?
		.into_iter()
		.flatten()
		.collect();
	Ok(RowMask::from_sorted_indices(frame.n_rows(), &row_indices))
}

#[cfg(test)]
mod test {
	use super::*;
	use approx::assert_abs_diff_eq;

	#[test]
	fn test_cross_validation_report() {
		let fold_losses = vec![vec![4.0, 2.0, 1.0, 1.5], vec![4.0, 3.0], vec![]];
		let report = CrossValidationReport::from_fold_losses(&fold_losses, 10);
		assert_eq!(report.mean_test_losses.len(), 4);
		assert_abs_diff_eq!(report.mean_test_losses[1], 2.5);
		// The second fold stopped after two rounds and keeps its last loss.
		assert_abs_diff_eq!(report.mean_test_losses[2], 2.0);
		assert_abs_diff_eq!(report.test_loss_variances[0], 0.0);
		assert_eq!(report.n_trees, 3);
	}

	#[test]
	fn test_cross_validation_report_ties_choose_fewer_trees() {
		let report = CrossValidationReport::from_fold_losses(&[vec![2.0, 1.0, 1.0]], 10);
		assert_eq!(report.n_trees, 2);
		let report = CrossValidationReport::from_fold_losses(&[], 10);
		assert_eq!(report.n_trees, 10);
	}
}
