use crate::{encoder::EncodedRow, extra_columns::ExtraColumns};
use grove_dataframe::is_missing;
use serde::{Deserialize, Serialize};

/// Nodes are addressed by their index in `Tree::nodes`.
pub type NodeIndex = u32;

/// The number of candidate split values that are less than or equal to `value`. This is the bin of `value`, and `candidates.len() + 1` is the bin of missing values.
pub fn upper_bound(candidates: &[f64], value: f64) -> usize {
	candidates.partition_point(|candidate| *candidate <= value)
}

/**
A `Node` is a leaf if it has no children. Otherwise rows with a value of `split_feature` less than `split_value` go to the left child, and rows with a missing value go left only if `assign_missing_to_left` is set.

`split_bin` and `missing_bin` are the same split expressed in the bins that are cached in a row's extra columns while training.
*/
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Node {
	pub split_feature: usize,
	pub split_value: f64,
	pub split_bin: usize,
	pub missing_bin: usize,
	pub assign_missing_to_left: bool,
	pub left_child: Option<NodeIndex>,
	pub right_child: Option<NodeIndex>,
	/// The prediction of a leaf, one value per loss parameter. This is stale once the node is split.
	pub value: Vec<f64>,
	pub gain: f64,
	/// The variance of the gains of the candidate splits on `split_feature`.
	pub gain_variance: f64,
	/// The total curvature of the rows that reached the node while training.
	pub curvature: f64,
	pub number_samples: usize,
}

impl Default for Node {
	fn default() -> Self {
		Self::new(1)
	}
}

impl Node {
	pub fn new(n_parameters: usize) -> Self {
		Self {
			split_feature: 0,
			split_value: 0.0,
			split_bin: 0,
			missing_bin: 0,
			assign_missing_to_left: false,
			left_child: None,
			right_child: None,
			value: vec![0.0; n_parameters],
			gain: 0.0,
			gain_variance: 0.0,
			curvature: 0.0,
			number_samples: 0,
		}
	}

	pub fn is_leaf(&self) -> bool {
		self.left_child.is_none()
	}

	pub fn left_child_index(&self) -> NodeIndex {
		self.left_child.expect("a leaf has no left child")
	}

	pub fn right_child_index(&self) -> NodeIndex {
		self.right_child.expect("a leaf has no right child")
	}

	/// Does the row go to the left child? This evaluates the split against the encoded features.
	pub fn assign_to_left(&self, row: &EncodedRow) -> bool {
		let value = row[self.split_feature];
		if is_missing(value) {
			self.assign_missing_to_left
		} else {
			(value as f64) < self.split_value
		}
	}

	/// Does the row go to the left child? This reads the row's bin for the split feature from the extra columns.
	pub fn assign_to_left_cached(&self, row: &[f32], extra_columns: &ExtraColumns) -> bool {
		let bin = extra_columns.read_split(row, self.split_feature);
		if bin == self.missing_bin {
			self.assign_missing_to_left
		} else {
			bin < self.split_bin
		}
	}
}

/// A binary tree stored as a flat list of nodes with the root at index zero.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tree {
	n_parameters: usize,
	nodes: Vec<Node>,
}

impl Tree {
	/// A tree with a single leaf that predicts zero.
	pub fn new(n_parameters: usize) -> Self {
		Self {
			n_parameters,
			nodes: vec![Node::new(n_parameters)],
		}
	}

	pub fn n_parameters(&self) -> usize {
		self.n_parameters
	}

	pub fn nodes(&self) -> &[Node] {
		&self.nodes
	}

	pub fn node(&self, index: NodeIndex) -> &Node {
		&self.nodes[index as usize]
	}

	pub fn root(&self) -> &Node {
		&self.nodes[0]
	}

	pub fn len(&self) -> usize {
		self.nodes.len()
	}

	pub fn is_empty(&self) -> bool {
		self.nodes.is_empty()
	}

	/**
	Split the leaf `node` on `feature` at `split_value`, appending two new leaves and returning their indices. `candidates` are the candidate split values of the feature, from which the cached bins of the rows were computed.
	*/
	#[allow(clippy::too_many_arguments)]
	pub fn split(
		&mut self,
		node: NodeIndex,
		candidates: &[f64],
		feature: usize,
		split_value: f64,
		assign_missing_to_left: bool,
		gain: f64,
		gain_variance: f64,
		curvature: f64,
	) -> (NodeIndex, NodeIndex) {
		assert!(self.node(node).is_leaf(), "only a leaf can be split");
		let left = self.nodes.len() as NodeIndex;
		let right = left + 1;
		let split = &mut self.nodes[node as usize];
		split.split_feature = feature;
		split.split_value = split_value;
		split.split_bin = upper_bound(candidates, split_value);
		split.missing_bin = candidates.len() + 1;
		split.assign_missing_to_left = assign_missing_to_left;
		split.left_child = Some(left);
		split.right_child = Some(right);
		split.gain = gain;
		split.gain_variance = gain_variance;
		split.curvature = curvature;
		self.nodes.push(Node::new(self.n_parameters));
		self.nodes.push(Node::new(self.n_parameters));
		(left, right)
	}

	pub fn set_value(&mut self, node: NodeIndex, value: &[f64]) {
		let node = &mut self.nodes[node as usize];
		assert!(node.is_leaf(), "only a leaf holds a value");
		node.value.copy_from_slice(value);
	}

	/// Record the number of rows and the total curvature seen by `node` while training.
	pub fn set_statistics(&mut self, node: NodeIndex, number_samples: usize, curvature: f64) {
		let node = &mut self.nodes[node as usize];
		node.number_samples = number_samples;
		node.curvature = curvature;
	}

	/// The leaf that the encoded row reaches.
	pub fn leaf_index(&self, row: &EncodedRow) -> NodeIndex {
		let mut index = 0;
		loop {
			let node = self.node(index);
			if node.is_leaf() {
				return index;
			}
			index = if node.assign_to_left(row) {
				node.left_child_index()
			} else {
				node.right_child_index()
			};
		}
	}

	/// The leaf that the row reaches, using the bins cached in its extra columns.
	pub fn leaf_index_cached(&self, row: &[f32], extra_columns: &ExtraColumns) -> NodeIndex {
		let mut index = 0;
		loop {
			let node = self.node(index);
			if node.is_leaf() {
				return index;
			}
			index = if node.assign_to_left_cached(row, extra_columns) {
				node.left_child_index()
			} else {
				node.right_child_index()
			};
		}
	}

	pub fn value(&self, row: &EncodedRow) -> &[f64] {
		&self.node(self.leaf_index(row)).value
	}

	/// The number of splits on the longest path from the root to a leaf.
	pub fn depth(&self) -> usize {
		let mut depth = 0;
		let mut stack = vec![(0, 0)];
		while let Some((index, node_depth)) = stack.pop() {
			depth = depth.max(node_depth);
			let node = self.node(index);
			if !node.is_leaf() {
				stack.push((node.left_child_index(), node_depth + 1));
				stack.push((node.right_child_index(), node_depth + 1));
			}
		}
		depth
	}

	pub fn leaves(&self) -> impl Iterator<Item = NodeIndex> + '_ {
		self.nodes
			.iter()
			.enumerate()
			.filter(|(_, node)| node.is_leaf())
			.map(|(index, _)| index as NodeIndex)
	}
}

/// The trees of a boosted model. The prediction is the sum of the values of the leaves that a row reaches. Tree zero holds the initial prediction.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Forest {
	trees: Vec<Tree>,
}

impl Forest {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn push(&mut self, tree: Tree) {
		self.trees.push(tree);
	}

	pub fn trees(&self) -> &[Tree] {
		&self.trees
	}

	pub fn len(&self) -> usize {
		self.trees.len()
	}

	pub fn is_empty(&self) -> bool {
		self.trees.is_empty()
	}

	/// Replace tree `index`, returning the old tree.
	pub fn replace(&mut self, index: usize, tree: Tree) -> Tree {
		std::mem::replace(&mut self.trees[index], tree)
	}

	/// Remove the trees after the first `len`.
	pub fn truncate(&mut self, len: usize) {
		self.trees.truncate(len);
	}

	/// Write the sum of the values of the leaves that the row reaches to `out`.
	pub fn predict(&self, row: &EncodedRow, out: &mut [f64]) {
		out.iter_mut().for_each(|value| *value = 0.0);
		for tree in self.trees.iter() {
			for (value, leaf_value) in out.iter_mut().zip(tree.value(row)) {
				*value += leaf_value;
			}
		}
	}

	pub fn n_nodes(&self) -> usize {
		self.trees.iter().map(|tree| tree.len()).sum()
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::{encoder::CategoryEncoder, extra_columns::WeightColumn};

	/// Split the root on feature 0 at 1.5 and its right child on feature 1 at 0.5.
	fn two_split_tree(candidates: &[Vec<f64>]) -> Tree {
		let mut tree = Tree::new(1);
		let (left, right) = tree.split(0, &candidates[0], 0, 1.5, true, 1.0, 0.0, 4.0);
		tree.set_value(left, &[-1.0]);
		let (right_left, right_right) =
			tree.split(right, &candidates[1], 1, 0.5, false, 0.5, 0.0, 2.0);
		tree.set_value(right_left, &[2.0]);
		tree.set_value(right_right, &[3.0]);
		tree
	}

	#[test]
	fn test_split_appends_reachable_nodes() {
		let candidates = vec![vec![0.5, 1.5, 2.5], vec![0.5]];
		let tree = two_split_tree(&candidates);
		assert_eq!(tree.len(), 5);
		assert!(!tree.root().is_leaf());
		assert_eq!(tree.root().left_child, Some(1));
		assert_eq!(tree.node(2).left_child, Some(3));
		assert_eq!(tree.node(2).right_child, Some(4));
		assert_eq!(tree.leaves().collect::<Vec<_>>(), vec![1, 3, 4]);
		assert_eq!(tree.depth(), 2);
		// Every node other than the root is the child of exactly one node.
		let mut parents = vec![0; tree.len()];
		for node in tree.nodes().iter().filter(|node| !node.is_leaf()) {
			parents[node.left_child_index() as usize] += 1;
			parents[node.right_child_index() as usize] += 1;
		}
		assert_eq!(parents, vec![0, 1, 1, 1, 1]);
	}

	#[test]
	#[should_panic]
	fn test_leaf_has_no_children() {
		Tree::new(1).root().left_child_index();
	}

	#[test]
	fn test_cached_traversal_agrees() {
		let candidates = vec![vec![0.5, 1.5, 2.5], vec![0.5]];
		let tree = two_split_tree(&candidates);
		let encoder = CategoryEncoder::new(vec![0, 1]);
		let layout = ExtraColumns::new(2, 1, 2, WeightColumn::Unit).unwrap();
		let values = [-1.0, 0.5, 1.0, 1.5, 2.0, 3.0, f32::NAN];
		for &x in values.iter() {
			for &y in values.iter() {
				let mut row = vec![0.0; 2 + ExtraColumns::n_extra_columns(1, 2)];
				row[0] = x;
				row[1] = y;
				for feature in 0..2 {
					let bin = if row[feature].is_nan() {
						candidates[feature].len() + 1
					} else {
						upper_bound(&candidates[feature], row[feature] as f64)
					};
					layout.write_split(&mut row, feature, bin);
				}
				let general = tree.leaf_index(&encoder.encode(&row));
				assert_eq!(tree.leaf_index_cached(&row, &layout), general);
			}
		}
		let low = [1.0, f32::NAN];
		assert_eq!(tree.value(&encoder.encode(&low)), &[-1.0]);
		let missing = [f32::NAN, 0.0];
		assert_eq!(tree.value(&encoder.encode(&missing)), &[-1.0]);
	}

	#[test]
	fn test_forest_sums_leaf_values() {
		let candidates = vec![vec![0.5, 1.5, 2.5], vec![0.5]];
		let mut forest = Forest::new();
		let mut bias = Tree::new(1);
		bias.set_value(0, &[10.0]);
		forest.push(bias);
		forest.push(two_split_tree(&candidates));
		let encoder = CategoryEncoder::new(vec![0, 1]);
		let mut out = [0.0];
		forest.predict(&encoder.encode(&[2.0, 1.0]), &mut out);
		assert_eq!(out, [13.0]);
		assert_eq!(forest.n_nodes(), 6);
		let old = forest.replace(1, Tree::new(1));
		assert_eq!(old.len(), 5);
		forest.predict(&encoder.encode(&[2.0, 1.0]), &mut out);
		assert_eq!(out, [10.0]);
	}
}
