use crate::{
	encoder::CategoryEncoder,
	extra_columns::ExtraColumns,
	loss::Loss,
	tree::{Forest, Tree},
};
use grove_dataframe::{reduce_rows, DataFrame, RowMask, WorkerPool};
use tracing::{error, trace};

#[derive(Clone)]
struct LeafGradients {
	/// The summed gradient of each node of each tree, `n_parameters` values per node.
	trees: Vec<Vec<f64>>,
	gradient: Vec<f64>,
}

/**
Compute the probability with which each tree of `forest` should be chosen for retraining when the rows in `mask` are added.

The gradient of the loss at each row's current prediction, which is read from the extra columns, is summed over the rows that reach each leaf. The sum for a branch is the sum over the leaves below it. A tree's score is the total L1 norm of the sums of all of its nodes other than the root, so trees whose nodes could most reduce the loss by being adjusted score highly. The probabilities are the normalized scores. The first tree only centers the predictions and is never chosen, so its probability is zero.

The result is empty if the forest has fewer than two trees or if the rows could not be read.
*/
#[allow(clippy::too_many_arguments)]
pub fn retrain_tree_selection_probabilities(
	frame: &DataFrame,
	pool: &WorkerPool,
	extra_columns: &ExtraColumns,
	target: usize,
	encoder: &CategoryEncoder,
	mask: &RowMask,
	loss: &dyn Loss,
	forest: &Forest,
) -> Vec<f64> {
	if forest.len() < 2 {
		return Vec::new();
	}
	let n_parameters = loss.n_parameters();
	let zero = LeafGradients {
		trees: forest
			.trees()
			.iter()
			.map(|tree| vec![0.0; tree.len() * n_parameters])
			.collect(),
		gradient: vec![0.0; n_parameters],
	};
	let result = reduce_rows(
		frame,
		pool,
		mask,
		zero,
		|state, _, row| {
			let encoded_row = encoder.encode(row);
			let prediction = extra_columns.read_prediction(row);
			let actual = row[target] as f64;
			let weight = extra_columns.read_example_weight(row);
			loss.gradient(
				&encoded_row,
				true,
				prediction,
				actual,
				weight,
				&mut state.gradient,
			);
			for (tree, sums) in forest.trees().iter().zip(state.trees.iter_mut()).skip(1) {
				let leaf = tree.leaf_index(&encoded_row) as usize * n_parameters;
				for (sum, gradient) in sums[leaf..leaf + n_parameters]
					.iter_mut()
					.zip(state.gradient.iter())
				{
					*sum += gradient;
				}
			}
		},
		|state, other| {
			for (sums, other) in state.trees.iter_mut().zip(other.trees) {
				sums.iter_mut().zip(other).for_each(|(sum, other)| *sum += other);
			}
		},
	);
	let mut gradients = match result {
		Ok(result) => result.trees,
		Err(error) => {
			error!(%error, "failed to compute the leaf loss gradients");
			return Vec::new();
		}
	};

	let mut probabilities = vec![0.0; forest.len()];
	let trees = forest.trees().iter().zip(gradients.iter_mut());
	for (index, (tree, sums)) in trees.enumerate().skip(1) {
		propagate_gradients(tree, sums, n_parameters);
		probabilities[index] = sums[n_parameters..].iter().map(|sum| sum.abs()).sum();
	}
	let total: f64 = probabilities.iter().sum();
	if total > 0.0 && total.is_finite() {
		probabilities.iter_mut().for_each(|p| *p /= total);
	} else {
		// Every tree is equally good if no node has a gradient.
		let uniform = 1.0 / (forest.len() - 1) as f64;
		probabilities.iter_mut().skip(1).for_each(|p| *p = uniform);
	}
	trace!(?probabilities, "retrain tree selection probabilities");
	probabilities
}

/// Add the sums of each node's children to the node, visiting the children first.
fn propagate_gradients(tree: &Tree, sums: &mut [f64], n_parameters: usize) {
	let mut stack = vec![(0, false)];
	while let Some((index, children_done)) = stack.pop() {
		let node = tree.node(index);
		if node.is_leaf() {
			continue;
		}
		let (left, right) = (node.left_child_index(), node.right_child_index());
		if !children_done {
			stack.push((index, true));
			stack.push((left, false));
			stack.push((right, false));
			continue;
		}
		let node_offset = index as usize * n_parameters;
		for parameter in 0..n_parameters {
			sums[node_offset + parameter] = sums[left as usize * n_parameters + parameter]
				+ sums[right as usize * n_parameters + parameter];
		}
	}
}
