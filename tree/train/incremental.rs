use super::{binning, grow::Trainer, rows_with_target, BoostedTree};
use crate::{
	error::TrainError,
	extra_columns::ExtraColumns,
	retrain::retrain_tree_selection_probabilities,
	TrainOptions,
};
use grove_dataframe::{DataFrame, RowMask, WorkerPool};
use rand::{distributions::WeightedIndex, prelude::*};
use rand_xoshiro::Xoshiro128Plus;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace};

/// What `BoostedTree::train_incremental` changed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IncrementalTrainReport {
	/// The indices of the regrown trees, in the order they were regrown.
	pub retrained_trees: Vec<usize>,
	/// The number of trees appended to the forest.
	pub new_trees: usize,
}

impl BoostedTree {
	/**
	Update the forest after the rows in `new_rows_mask` were added to `frame`.

	The trees chosen by [`retrain_tree_selection_probabilities`](fn.retrain_tree_selection_probabilities.html) are regrown one at a time on all rows with a target, followed by up to `max_new_trees` new trees. Rows that are not new pay `prediction_change_cost` per unit of squared change from their prediction before the update, so the forest moves towards the new rows without forgetting the old ones. The candidate splits are the ones computed when the model was trained.

	Fresh extra columns are appended to `frame`, which must have the columns the model was trained on.
	*/
	pub fn train_incremental(
		&mut self,
		frame: &mut DataFrame,
		new_rows_mask: &RowMask,
		options: &TrainOptions,
	) -> Result<IncrementalTrainReport, TrainError> {
		let result = self.update_forest(frame, new_rows_mask, options);
		if let Err(error) = &result {
			error!(%error, "incremental training failed");
		}
		result
	}

	fn update_forest(
		&mut self,
		frame: &mut DataFrame,
		new_rows_mask: &RowMask,
		options: &TrainOptions,
	) -> Result<IncrementalTrainReport, TrainError> {
		if new_rows_mask.len() != frame.n_rows() {
			return Err(TrainError::MaskLength {
				mask_len: new_rows_mask.len(),
				n_rows: frame.n_rows(),
			});
		}
		self.check_columns(frame)?;
		if self.target_column >= frame.n_columns() {
			return Err(TrainError::InvalidTargetColumn {
				column: self.target_column,
			});
		}
		let pool = WorkerPool::new(options.n_threads)?;
		let incremental_options = &options.incremental;
		let loss = self.loss.into_loss();

		// Lay out fresh extra columns and write the bins from the stored candidate splits.
		let n_parameters = self.n_parameters();
		let n_features = self.encoder.n_encoded_columns();
		let first_extra_column =
			frame.add_columns(ExtraColumns::n_extra_columns(n_parameters, n_features));
		let extra_columns = ExtraColumns::new(
			first_extra_column,
			n_parameters,
			n_features,
			self.extra_columns.weight_column(),
		)?;
		binning::write_bins(
			frame,
			&pool,
			&extra_columns,
			self.encoder.feature_columns(),
			&self.candidate_splits,
		)?;

		// Write the current forest's predictions and remember them.
		let forest = &self.forest;
		let n_rows = frame.n_rows();
		frame.write_columns(&pool, 0..n_rows, None, || (), |_, _, row| {
			for tree in forest.trees() {
				let leaf = tree.leaf_index_cached(row, &extra_columns);
				extra_columns.add_to_prediction(row, &tree.node(leaf).value, 1.0);
			}
			extra_columns.store_previous_prediction(row);
		})?;

		let train_mask = rows_with_target(frame, &pool, self.target_column)?;
		let new_train_mask = &train_mask & new_rows_mask;
		let mut forest = std::mem::take(&mut self.forest);
		let trainer = Trainer {
			pool: &pool,
			target: self.target_column,
			loss: loss.as_ref(),
			encoder: &self.encoder,
			extra_columns: &extra_columns,
			candidate_splits: &self.candidate_splits,
			options,
		};
		let mut rng = Xoshiro128Plus::seed_from_u64(options.seed);
		let all_features: Vec<usize> = (0..n_features).collect();

		// Choose the trees to regrow.
		let probabilities = retrain_tree_selection_probabilities(
			frame,
			&pool,
			&extra_columns,
			self.target_column,
			&self.encoder,
			&new_train_mask,
			loss.as_ref(),
			&forest,
		);
		if probabilities.is_empty() && forest.len() >= 2 {
			self.forest = forest;
			return Err(TrainError::Statistics("retrain tree selection probabilities"));
		}
		let n_to_retrain = incremental_options
			.max_trees_to_retrain
			.min(forest.len().saturating_sub(1));
		let retrained_trees = choose_trees(probabilities, n_to_retrain, &mut rng);
		trace!(?retrained_trees, "chose trees to retrain");

		let result = (|| -> Result<usize, TrainError> {
			for index in retrained_trees.iter() {
				let old_tree = &forest.trees()[*index];
				trainer.add_to_predictions(frame, old_tree, None, -1.0)?;
				trainer.write_loss_derivatives(
					frame,
					&train_mask,
					Some(new_rows_mask),
					incremental_options.prediction_change_cost,
				)?;
				let tree = trainer.grow_tree(
					frame,
					&train_mask,
					&all_features,
					incremental_options.retrained_tree_eta,
				)?;
				trainer.add_to_predictions(frame, &tree, None, 1.0)?;
				debug!(
					tree = *index,
					old_n_nodes = old_tree.len(),
					n_nodes = tree.len(),
					"retrained tree"
				);
				forest.replace(*index, tree);
			}
			for _ in 0..incremental_options.max_new_trees {
				trainer.write_loss_derivatives(
					frame,
					&train_mask,
					Some(new_rows_mask),
					incremental_options.prediction_change_cost,
				)?;
				let rows = trainer.downsample(&train_mask, &mut rng);
				let features = trainer.bag_features(&mut rng);
				let tree = trainer.grow_tree(frame, &rows, &features, options.eta.min(1.0))?;
				trainer.add_to_predictions(frame, &tree, None, 1.0)?;
				forest.push(tree);
			}
			Ok(incremental_options.max_new_trees)
		})();
		self.forest = forest;
		let new_trees = result?;
		self.extra_columns = extra_columns;
		debug!(
			n_retrained = retrained_trees.len(),
			new_trees,
			n_trees = self.forest.len(),
			"updated forest"
		);
		Ok(IncrementalTrainReport {
			retrained_trees,
			new_trees,
		})
	}
}

/// Choose up to `amount` distinct trees, each with probability proportional to its weight among the trees not yet chosen.
fn choose_trees(mut weights: Vec<f64>, amount: usize, rng: &mut Xoshiro128Plus) -> Vec<usize> {
	let mut chosen = Vec::with_capacity(amount);
	while chosen.len() < amount {
		let distribution = match WeightedIndex::new(&weights) {
			Ok(distribution) => distribution,
			// Every remaining tree has weight zero.
			Err(_) => break,
		};
		let index = distribution.sample(rng);
		weights[index] = 0.0;
		chosen.push(index);
	}
	chosen
}
