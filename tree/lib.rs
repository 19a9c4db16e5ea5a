/*!
This crate trains gradient boosted decision trees directly over a [`grove_dataframe::DataFrame`]. Per row training state, the current prediction, the loss gradient and curvature, and the split bin of every feature, is kept in extra columns appended to the frame, addressed through [`ExtraColumns`](struct.ExtraColumns.html). Trees are grown leaf by leaf using histograms of the loss derivatives, with leaf values given by a Newton step, so any twice differentiable [`Loss`](trait.Loss.html), including losses with several parameters per row, can be trained.

The number of trees is chosen by stratified k-fold cross validation, see [`sampling`](sampling/index.html). A trained model can later be updated with new rows by [`BoostedTree::train_incremental`](struct.BoostedTree.html#method.train_incremental), which regrows the trees chosen by [`retrain_tree_selection_probabilities`](fn.retrain_tree_selection_probabilities.html).
*/

#![allow(clippy::tabs_in_doc_comments)]

mod encoder;
mod error;
mod extra_columns;
mod loss;
mod retrain;
pub mod sampling;
mod train;
mod tree;

pub use self::encoder::{CategoryEncoder, EncodedRow};
pub use self::error::TrainError;
pub use self::extra_columns::{packed_index, ExtraColumnTag, ExtraColumns, WeightColumn};
pub use self::loss::{
	BinomialLogistic, Loss, LossKind, Mse, Msle, MultinomialLogistic, PseudoHuber,
};
pub use self::retrain::retrain_tree_selection_probabilities;
pub use self::train::{BoostedTree, CrossValidationReport, IncrementalTrainReport};
pub use self::tree::{Forest, Node, NodeIndex, Tree};

use grove_util::progress_counter::ProgressCounter;
use serde::{Deserialize, Serialize};

/// These are the options passed to `BoostedTree::train` and `BoostedTree::train_incremental`. Every field has a default, so a configuration file only needs to name the options it changes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainOptions {
	/// The number of worker threads used to read and write rows. With one thread, all work happens on the calling thread. The trained model does not depend on it.
	pub n_threads: usize,
	/// The seed for the random number generator used for sampling folds, rows, and features.
	pub seed: u64,
	/// The number of cross validation folds used to choose the number of trees. Cross validation is disabled if this is less than two.
	pub n_folds: usize,
	/// The fraction of the training rows used to train each fold. The rest of the rows are the fold's test rows.
	pub train_fraction_per_fold: f64,
	/// A numeric target is split into this many equal probability buckets, which are treated as categories when sampling rows.
	pub n_buckets: usize,
	/// The maximum number of thresholds considered when splitting on a single feature.
	pub max_candidate_splits: usize,
	/// The maximum number of trees in the forest, including the first tree, which only centres the predictions.
	pub max_trees: usize,
	/// The number of leaf nodes in a single tree will never exceed this value.
	pub max_leaves: usize,
	/// The depth of a single tree will never exceed this value.
	pub max_depth: usize,
	/// A split will only be considered valid if the number of training examples sent to each of the resulting children is at least this value.
	pub min_examples_per_child: usize,
	/// This option sets the L2 regularization of the leaf values, which helps avoid overfitting.
	pub lambda: f64,
	/// This is the penalty for adding a leaf, subtracted from the gain of every split.
	pub gamma: f64,
	/// The learning rate scales the leaf values to control the effect each tree has on the output.
	pub eta: f64,
	/// The learning rate of tree `t` is `eta * eta_growth_rate_per_tree ^ (t - 1)`, capped at one.
	pub eta_growth_rate_per_tree: f64,
	/// The fraction of the features that each tree may split on.
	pub feature_bag_fraction: f64,
	/// The fraction of the training rows that each tree is grown on.
	pub downsample_factor: f64,
	/// If set, the column holding each row's weight. Otherwise every row has weight one.
	pub weight_column: Option<usize>,
	/// This option controls early stopping. If it is `Some`, then early stopping will be enabled. If it is `None`, then early stopping will be disabled.
	pub early_stopping_options: Option<EarlyStoppingOptions>,
	/// These options control `BoostedTree::train_incremental`.
	pub incremental: IncrementalTrainOptions,
}

impl Default for TrainOptions {
	fn default() -> Self {
		Self {
			n_threads: 1,
			seed: 0,
			n_folds: 4,
			train_fraction_per_fold: 0.75,
			n_buckets: 10,
			max_candidate_splits: 32,
			max_trees: 100,
			max_leaves: 31,
			max_depth: 6,
			min_examples_per_child: 1,
			lambda: 1e-3,
			gamma: 0.0,
			eta: 0.1,
			eta_growth_rate_per_tree: 1.0,
			feature_bag_fraction: 1.0,
			downsample_factor: 1.0,
			weight_column: None,
			early_stopping_options: None,
			incremental: IncrementalTrainOptions::default(),
		}
	}
}

impl TrainOptions {
	/// Read options from JSON. Fields that are not present take their default values.
	pub fn from_json(json: &str) -> Result<Self, TrainError> {
		Ok(serde_json::from_str(json)?)
	}
}

/// The parameters in this struct control how to determine whether training should stop early after each round. If `early_stopping_rounds` rounds pass by without an improvement of at least `early_stopping_threshold` in the test loss over the previous round, training will be stopped early. When cross validation is disabled, `early_stopping_fraction` of the training rows are held out to compute the test loss.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EarlyStoppingOptions {
	pub early_stopping_fraction: f64,
	pub early_stopping_rounds: usize,
	pub early_stopping_threshold: f64,
}

impl Default for EarlyStoppingOptions {
	fn default() -> Self {
		Self {
			early_stopping_fraction: 0.1,
			early_stopping_rounds: 5,
			early_stopping_threshold: 1e-5,
		}
	}
}

/// Options for updating a trained forest with new rows.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IncrementalTrainOptions {
	/// At most this many existing trees are regrown.
	pub max_trees_to_retrain: usize,
	/// At most this many trees are added after the retrained trees.
	pub max_new_trees: usize,
	/// The learning rate of regrown trees.
	pub retrained_tree_eta: f64,
	/// Rows that the forest was trained on pay this cost per unit of squared change in their prediction, which keeps the updated forest close to the old one on old data.
	pub prediction_change_cost: f64,
}

impl Default for IncrementalTrainOptions {
	fn default() -> Self {
		Self {
			max_trees_to_retrain: 10,
			max_new_trees: 0,
			retrained_tree_eta: 0.1,
			prediction_change_cost: 0.5,
		}
	}
}

/// This struct reports the training progress.
#[derive(Debug)]
pub enum TrainProgress {
	Initializing(ProgressCounter),
	CrossValidating(ProgressCounter),
	Training(ProgressCounter),
}
