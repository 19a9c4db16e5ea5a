use super::{
	early_stopping::EarlyStoppingMonitor,
	newton::{gain_score, leaf_value},
};
use crate::{
	encoder::CategoryEncoder,
	error::TrainError,
	extra_columns::{n_packed_entries, packed_index, ExtraColumns},
	loss::Loss,
	tree::{Forest, Node, NodeIndex, Tree},
	TrainOptions,
};
use grove_dataframe::{reduce_rows, DataFrame, RowMask, WorkerPool};
use grove_metrics::{Mean, MeanVariance, StreamingMetric};
use grove_util::{finite::Finite, progress_counter::ProgressCounter};
use itertools::izip;
use rand::Rng;
use rand_xoshiro::Xoshiro128Plus;
use std::{cmp::Ordering, collections::BinaryHeap};
use tracing::{debug, warn};

/// Everything that stays fixed while the trees of one training run are grown.
pub struct Trainer<'a> {
	pub pool: &'a WorkerPool,
	pub target: usize,
	pub loss: &'a dyn Loss,
	pub encoder: &'a CategoryEncoder,
	pub extra_columns: &'a ExtraColumns,
	pub candidate_splits: &'a [Vec<f64>],
	pub options: &'a TrainOptions,
}

/// The forest grown by `Trainer::grow_forest` and its loss after each tree.
#[derive(Debug)]
pub struct GrownForest {
	pub forest: Forest,
	pub train_losses: Vec<f64>,
	/// This is empty if no test rows were given.
	pub test_losses: Vec<f64>,
}

/// Scratch space for computing the loss derivatives of a row.
struct DerivativeScratch {
	prediction: Vec<f32>,
	gradient: Vec<f64>,
	curvature: Vec<f64>,
	n_skipped: usize,
}

/**
The histogram of a node holds, for each bin of each feature that may be split on, the sums of the gradient, curvature, and count of the node's rows in that bin. The node's totals follow the bins.
*/
#[derive(Clone, Debug)]
struct Histogram {
	values: Vec<f64>,
}

struct HistogramLayout {
	/// The encoded features that may be split on.
	features: Vec<usize>,
	/// Where each feature's bins start.
	offsets: Vec<usize>,
	n_parameters: usize,
	/// The gradient, then the packed curvature, then the count.
	stride: usize,
	totals: usize,
}

impl HistogramLayout {
	fn new(n_parameters: usize, features: &[usize], candidate_splits: &[Vec<f64>]) -> Self {
		let stride = n_parameters + n_packed_entries(n_parameters) + 1;
		let mut offsets = Vec::with_capacity(features.len());
		let mut offset = 0;
		for feature in features {
			offsets.push(offset);
			// The bins below and between the candidates, then the missing values bin.
			offset += (candidate_splits[*feature].len() + 2) * stride;
		}
		Self {
			features: features.to_vec(),
			offsets,
			n_parameters,
			stride,
			totals: offset,
		}
	}

	fn len(&self) -> usize {
		self.totals + self.stride
	}

	fn count(&self, stats: &[f64]) -> f64 {
		stats[self.stride - 1]
	}

	fn gradient<'a>(&self, stats: &'a [f64]) -> &'a [f64] {
		&stats[..self.n_parameters]
	}

	fn curvature<'a>(&self, stats: &'a [f64]) -> &'a [f64] {
		&stats[self.n_parameters..self.stride - 1]
	}

	/// The sum of the diagonal of the curvature.
	fn curvature_trace(&self, stats: &[f64]) -> f64 {
		let curvature = self.curvature(stats);
		(0..self.n_parameters)
			.map(|i| curvature[packed_index(i, i)])
			.sum()
	}
}

impl Histogram {
	fn zeros(layout: &HistogramLayout) -> Self {
		Self {
			values: vec![0.0; layout.len()],
		}
	}

	fn add_row(&mut self, layout: &HistogramLayout, extra_columns: &ExtraColumns, row: &[f32]) {
		let derivatives = extra_columns.read_loss_derivatives(row);
		let mut add = |start: usize| {
			for (value, derivative) in self.values[start..start + layout.stride - 1]
				.iter_mut()
				.zip(derivatives)
			{
				*value += *derivative as f64;
			}
			self.values[start + layout.stride - 1] += 1.0;
		};
		for (feature, offset) in layout.features.iter().zip(layout.offsets.iter()) {
			add(offset + extra_columns.read_split(row, *feature) * layout.stride);
		}
		add(layout.totals);
	}

	fn add(&mut self, other: &Histogram) {
		for (value, other) in self.values.iter_mut().zip(other.values.iter()) {
			*value += other;
		}
	}

	fn subtract(&mut self, other: &Histogram) {
		for (value, other) in self.values.iter_mut().zip(other.values.iter()) {
			*value -= other;
		}
	}

	fn totals(&self, layout: &HistogramLayout) -> &[f64] {
		&self.values[layout.totals..]
	}

	fn bin(&self, layout: &HistogramLayout, feature_index: usize, bin: usize) -> &[f64] {
		let start = layout.offsets[feature_index] + bin * layout.stride;
		&self.values[start..start + layout.stride]
	}
}

#[derive(Clone, Debug)]
struct Split {
	feature: usize,
	split_value: f64,
	assign_missing_to_left: bool,
	gain: f64,
	gain_variance: f64,
	/// The histogram totals of the rows that go to the left child.
	left: Vec<f64>,
	right: Vec<f64>,
}

struct QueueItem {
	/// Items in the priority queue are sorted by the gain of their split.
	gain: Finite<f64>,
	/// The leaf that will be split.
	node: NodeIndex,
	/// This is the depth of the item in the tree.
	depth: usize,
	/// The rows that reach the leaf.
	mask: RowMask,
	histogram: Histogram,
	split: Split,
}

impl PartialEq for QueueItem {
	fn eq(&self, other: &Self) -> bool {
		self.gain == other.gain
	}
}

impl Eq for QueueItem {}

impl PartialOrd for QueueItem {
	fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
		Some(self.cmp(other))
	}
}

impl Ord for QueueItem {
	fn cmp(&self, other: &Self) -> Ordering {
		self.gain.cmp(&other.gain)
	}
}

impl<'a> Trainer<'a> {
	fn n_parameters(&self) -> usize {
		self.extra_columns.n_parameters()
	}

	/**
	Write the gradient and curvature of the loss at each row's current prediction into the extra columns of the rows in `mask`.

	If `new_rows` is given, the rows that are not in it are rows the forest was trained on before, and they pay `prediction_change_cost` per unit of squared change from their previous prediction.
	*/
	pub fn write_loss_derivatives(
		&self,
		frame: &mut DataFrame,
		mask: &RowMask,
		new_rows: Option<&RowMask>,
		prediction_change_cost: f64,
	) -> Result<(), TrainError> {
		let n_parameters = self.n_parameters();
		let n_rows = frame.n_rows();
		let extra_columns = self.extra_columns;
		let scratches = frame.write_columns(
			self.pool,
			0..n_rows,
			Some(mask),
			|| DerivativeScratch {
				prediction: vec![0.0; n_parameters],
				gradient: vec![0.0; n_parameters],
				curvature: vec![0.0; n_packed_entries(n_parameters)],
				n_skipped: 0,
			},
			|scratch, row_index, row| {
				scratch
					.prediction
					.copy_from_slice(extra_columns.read_prediction(row));
				if !scratch.prediction.iter().all(|value| value.is_finite()) {
					extra_columns.zero_loss_derivatives(row);
					scratch.n_skipped += 1;
					return;
				}
				let actual = row[self.target] as f64;
				let weight = extra_columns.read_example_weight(row);
				let is_new_example = new_rows
					.map(|new_rows| new_rows.get(row_index))
					.unwrap_or(true);
				{
					let encoded_row = self.encoder.encode(row);
					self.loss.gradient(
						&encoded_row,
						is_new_example,
						&scratch.prediction,
						actual,
						weight,
						&mut scratch.gradient,
					);
					self.loss.curvature(
						&encoded_row,
						is_new_example,
						&scratch.prediction,
						actual,
						weight,
						&mut scratch.curvature,
					);
				}
				if !is_new_example && prediction_change_cost > 0.0 {
					let previous = extra_columns.read_previous_prediction(row);
					for (gradient, prediction, previous) in
						izip!(scratch.gradient.iter_mut(), scratch.prediction.iter(), previous)
					{
						*gradient += prediction_change_cost * (*prediction as f64 - *previous as f64);
					}
					for i in 0..n_parameters {
						scratch.curvature[packed_index(i, i)] += prediction_change_cost;
					}
				}
				extra_columns.write_loss_gradient(row, &scratch.gradient);
				extra_columns.write_loss_curvature(row, &scratch.curvature);
			},
		)?;
		let n_skipped: usize = scratches.iter().map(|scratch| scratch.n_skipped).sum();
		if n_skipped > 0 {
			warn!(n_skipped, "skipped rows with a prediction that is not finite");
		}
		Ok(())
	}

	/// Add `scale` times the value of the leaf that each row in `mask` reaches to the row's prediction.
	pub fn add_to_predictions(
		&self,
		frame: &mut DataFrame,
		tree: &Tree,
		mask: Option<&RowMask>,
		scale: f64,
	) -> Result<(), TrainError> {
		let n_rows = frame.n_rows();
		let extra_columns = self.extra_columns;
		frame.write_columns(
			self.pool,
			0..n_rows,
			mask,
			|| (),
			|_, _, row| {
				let leaf = tree.leaf_index_cached(row, extra_columns);
				extra_columns.add_to_prediction(row, &tree.node(leaf).value, scale);
			},
		)?;
		Ok(())
	}

	pub fn zero_predictions(&self, frame: &mut DataFrame) -> Result<(), TrainError> {
		let n_rows = frame.n_rows();
		let extra_columns = self.extra_columns;
		frame.write_columns(self.pool, 0..n_rows, None, || (), |_, _, row| {
			extra_columns.zero_prediction(row)
		})?;
		Ok(())
	}

	/// The weighted mean loss of the rows in `mask` at their current predictions.
	pub fn mean_loss(&self, frame: &DataFrame, mask: &RowMask) -> Result<f64, TrainError> {
		let mean = reduce_rows(
			frame,
			self.pool,
			mask,
			Mean::default(),
			|mean, _, row| {
				let prediction = self.extra_columns.read_prediction(row);
				let value = self.loss.value(prediction, row[self.target] as f64);
				mean.update((value, self.extra_columns.read_example_weight(row)));
			},
			|mean, other| mean.merge(other),
		)?;
		mean.finalize().ok_or(TrainError::Statistics("mean loss"))
	}

	/// Choose each row of `mask` with probability `downsample_factor`.
	pub fn downsample(&self, mask: &RowMask, rng: &mut Xoshiro128Plus) -> RowMask {
		let factor = self.options.downsample_factor;
		if factor >= 1.0 {
			return mask.clone();
		}
		let row_indices: Vec<usize> = mask.ones().filter(|_| rng.gen::<f64>() < factor).collect();
		if row_indices.is_empty() {
			return mask.clone();
		}
		RowMask::from_sorted_indices(mask.len(), &row_indices)
	}

	/// Choose `feature_bag_fraction` of the features for the next tree.
	pub fn bag_features(&self, rng: &mut Xoshiro128Plus) -> Vec<usize> {
		let n_features = self.extra_columns.n_features();
		let fraction = self.options.feature_bag_fraction;
		if fraction >= 1.0 || n_features == 0 {
			return (0..n_features).collect();
		}
		let amount = ((fraction * n_features as f64).round() as usize)
			.max(1)
			.min(n_features);
		let mut features = rand::seq::index::sample(rng, n_features, amount).into_vec();
		features.sort_unstable();
		features
	}

	/**
	Grow `max_trees` trees, or fewer if early stopping on `test_mask` says to stop, on the rows in `train_mask`.

	The first tree is a single leaf holding a full Newton step from a prediction of zero. Each following tree is fit to the loss derivatives at the predictions of the trees before it, with the learning rate `eta * eta_growth_rate_per_tree ^ (t - 1)` capped at one.
	*/
	#[allow(clippy::too_many_arguments)]
	pub fn grow_forest(
		&self,
		frame: &mut DataFrame,
		train_mask: &RowMask,
		test_mask: Option<&RowMask>,
		max_trees: usize,
		mut early_stopping_monitor: Option<EarlyStoppingMonitor>,
		rng: &mut Xoshiro128Plus,
		progress_counter: Option<&ProgressCounter>,
	) -> Result<GrownForest, TrainError> {
		let options = self.options;
		let mut forest = Forest::new();
		let mut train_losses = Vec::new();
		let mut test_losses = Vec::new();

		self.zero_predictions(frame)?;

		// Train trees until we hit max_trees or the early stopping monitor indicates we should stop early.
		for index in 0..max_trees.max(1) {
			self.write_loss_derivatives(frame, train_mask, None, 0.0)?;
			let tree = if index == 0 {
				// The bias centres the predictions.
				self.grow_tree(frame, train_mask, &[], 1.0)?
			} else {
				let rows = self.downsample(train_mask, rng);
				let features = self.bag_features(rng);
				let eta = (options.eta
					* options
						.eta_growth_rate_per_tree
						.powi(index as i32 - 1))
				.min(1.0);
				self.grow_tree(frame, &rows, &features, eta)?
			};

			// Update the predictions with the most recently trained tree.
			self.add_to_predictions(frame, &tree, None, 1.0)?;
			let n_nodes = tree.len();
			forest.push(tree);
			if let Some(progress_counter) = progress_counter {
				progress_counter.inc(1);
			}

			// Compute the losses for this round and check whether we should stop.
			let train_loss = self.mean_loss(frame, train_mask)?;
			train_losses.push(train_loss);
			let should_stop = if let Some(test_mask) = test_mask {
				let test_loss = self.mean_loss(frame, test_mask)?;
				test_losses.push(test_loss);
				debug!(tree = index, train_loss, test_loss, n_nodes, "grew tree");
				early_stopping_monitor
					.as_mut()
					.map(|monitor| monitor.update(test_loss))
					.unwrap_or(false)
			} else {
				debug!(tree = index, train_loss, n_nodes, "grew tree");
				false
			};
			if should_stop {
				break;
			}
		}

		Ok(GrownForest {
			forest,
			train_losses,
			test_losses,
		})
	}

	/**
	Grow a tree on the rows in `mask` using the loss derivatives in their extra columns, splitting only on `features`.

	Leaves are split best first, in order of the gain of their best split, until `max_leaves` is reached or no leaf has a split with positive gain. Each leaf's value is `eta` times a Newton step for its rows.
	*/
	pub fn grow_tree(
		&self,
		frame: &DataFrame,
		mask: &RowMask,
		features: &[usize],
		eta: f64,
	) -> Result<Tree, TrainError> {
		let layout = HistogramLayout::new(self.n_parameters(), features, self.candidate_splits);
		let mut tree = Tree::new(self.n_parameters());
		// This priority queue stores the leaves to split ordered by the gain of their best split.
		let mut queue: BinaryHeap<QueueItem> = BinaryHeap::new();

		// Compute the histogram for the root node.
		let root_histogram = self.histogram(frame, &layout, mask)?;
		self.set_leaf(&mut tree, 0, &layout, root_histogram.totals(&layout), eta);
		self.enqueue(&mut queue, &layout, 0, 0, mask.clone(), root_histogram);

		let mut n_leaves = 1;
		while let Some(item) = queue.pop() {
			if n_leaves >= self.options.max_leaves {
				break;
			}
			let QueueItem {
				node,
				depth,
				mask,
				histogram,
				split,
				..
			} = item;
			let curvature = tree.node(node).curvature;
			let (left, right) = tree.split(
				node,
				&self.candidate_splits[split.feature],
				split.feature,
				split.split_value,
				split.assign_missing_to_left,
				split.gain,
				split.gain_variance,
				curvature,
			);
			n_leaves += 1;
			self.set_leaf(&mut tree, left, &layout, &split.left, eta);
			self.set_leaf(&mut tree, right, &layout, &split.right, eta);

			let depth = depth + 1;
			if depth >= self.options.max_depth {
				continue;
			}

			// Partition the node's rows, then compute the histogram of the smaller child and get the larger child's by subtracting it from the parent's.
			let left_mask = self.left_rows(frame, tree.node(node), &mask)?;
			let right_mask = &mask ^ &left_mask;
			let left_is_smaller = left_mask.count_ones() <= right_mask.count_ones();
			let smaller_histogram = self.histogram(
				frame,
				&layout,
				if left_is_smaller { &left_mask } else { &right_mask },
			)?;
			let mut larger_histogram = histogram;
			larger_histogram.subtract(&smaller_histogram);
			let (left_histogram, right_histogram) = if left_is_smaller {
				(smaller_histogram, larger_histogram)
			} else {
				(larger_histogram, smaller_histogram)
			};
			self.enqueue(&mut queue, &layout, left, depth, left_mask, left_histogram);
			self.enqueue(&mut queue, &layout, right, depth, right_mask, right_histogram);
		}
		Ok(tree)
	}

	fn histogram(
		&self,
		frame: &DataFrame,
		layout: &HistogramLayout,
		mask: &RowMask,
	) -> Result<Histogram, TrainError> {
		let extra_columns = self.extra_columns;
		Ok(reduce_rows(
			frame,
			self.pool,
			mask,
			Histogram::zeros(layout),
			|histogram, _, row| histogram.add_row(layout, extra_columns, row),
			|histogram, other| histogram.add(&other),
		)?)
	}

	/// The rows of `mask` that `node` sends to its left child.
	fn left_rows(&self, frame: &DataFrame, node: &Node, mask: &RowMask) -> Result<RowMask, TrainError> {
		let extra_columns = self.extra_columns;
		let row_indices: Vec<usize> = frame
			.read_rows(
				self.pool,
				0..frame.n_rows(),
				Some(mask),
				Vec::new(),
				|row_indices, row_index, row| {
					if node.assign_to_left_cached(row, extra_columns) {
						row_indices.push(row_index);
					}
				},
			)?
			.into_iter()
			.flatten()
			.collect();
		Ok(RowMask::from_sorted_indices(frame.n_rows(), &row_indices))
	}

	fn set_leaf(&self, tree: &mut Tree, node: NodeIndex, layout: &HistogramLayout, stats: &[f64], eta: f64) {
		let value = leaf_value(
			layout.gradient(stats),
			layout.curvature(stats),
			self.options.lambda,
			eta,
		);
		tree.set_value(node, &value);
		tree.set_statistics(
			node,
			layout.count(stats) as usize,
			layout.curvature_trace(stats),
		);
	}

	/// Push the leaf onto the queue if it may be split and has a split with positive gain.
	fn enqueue(
		&self,
		queue: &mut BinaryHeap<QueueItem>,
		layout: &HistogramLayout,
		node: NodeIndex,
		depth: usize,
		mask: RowMask,
		histogram: Histogram,
	) {
		let min_examples_per_child = self.options.min_examples_per_child.max(1) as f64;
		if depth >= self.options.max_depth
			|| layout.count(histogram.totals(layout)) < 2.0 * min_examples_per_child
		{
			return;
		}
		if let Some(split) = self.best_split(layout, &histogram) {
			if let Ok(gain) = Finite::new(split.gain) {
				queue.push(QueueItem {
					gain,
					node,
					depth,
					mask,
					histogram,
					split,
				});
			}
		}
	}

	/// Find the split with the largest gain over all features, bins, and directions for missing values.
	fn best_split(&self, layout: &HistogramLayout, histogram: &Histogram) -> Option<Split> {
		let lambda = self.options.lambda;
		let min_examples_per_child = self.options.min_examples_per_child.max(1) as f64;
		let totals = histogram.totals(layout);
		let score = |stats: &[f64]| gain_score(layout.gradient(stats), layout.curvature(stats), lambda);
		let parent_score = score(totals);
		let mut best: Option<Split> = None;
		let mut left = vec![0.0; layout.stride];
		let mut right = vec![0.0; layout.stride];
		for (feature_index, feature) in layout.features.iter().enumerate() {
			let candidates = &self.candidate_splits[*feature];
			let missing = histogram.bin(layout, feature_index, candidates.len() + 1);
			let directions: &[bool] = if layout.count(missing) > 0.0 {
				&[false, true]
			} else {
				&[false]
			};
			let mut gains = MeanVariance::default();
			let mut feature_best: Option<Split> = None;
			let mut below = vec![0.0; layout.stride];
			for (bin, split_value) in candidates.iter().enumerate() {
				for (below, value) in below.iter_mut().zip(histogram.bin(layout, feature_index, bin)) {
					*below += value;
				}
				for &assign_missing_to_left in directions {
					for (left, right, below, missing, total) in
						izip!(left.iter_mut(), right.iter_mut(), below.iter(), missing, totals)
					{
						*left = below + if assign_missing_to_left { *missing } else { 0.0 };
						*right = total - *left;
					}
					if layout.count(&left) < min_examples_per_child
						|| layout.count(&right) < min_examples_per_child
					{
						continue;
					}
					let gain =
						0.5 * (score(&left) + score(&right) - parent_score) - self.options.gamma;
					if !gain.is_finite() {
						continue;
					}
					gains.update(gain);
					if feature_best.as_ref().map(|best| gain > best.gain).unwrap_or(true) {
						feature_best = Some(Split {
							feature: *feature,
							split_value: *split_value,
							assign_missing_to_left,
							gain,
							gain_variance: 0.0,
							left: left.clone(),
							right: right.clone(),
						});
					}
				}
			}
			if let Some(mut feature_best) = feature_best {
				if best.as_ref().map(|best| feature_best.gain > best.gain).unwrap_or(true) {
					feature_best.gain_variance = gains
						.finalize()
						.map(|output| output.variance)
						.unwrap_or(0.0);
					best = Some(feature_best);
				}
			}
		}
		best.filter(|split| split.gain > 0.0)
	}
}
