use serde::{Deserialize, Serialize};
use std::ops::Index;

/// A `CategoryEncoder` maps a frame row to the features that trees split on. Numeric features are passed through, and categorical features are encoded by the index of their category, which the frame already stores, so encoding never copies the row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CategoryEncoder {
	feature_columns: Vec<usize>,
}

/// The encoded features of a single row. Missing values are `NaN`.
#[derive(Clone, Copy, Debug)]
pub struct EncodedRow<'a> {
	row: &'a [f32],
	columns: &'a [usize],
}

impl CategoryEncoder {
	pub fn new(feature_columns: Vec<usize>) -> Self {
		Self { feature_columns }
	}

	/// The frame column that encoded feature `i` is read from.
	pub fn feature_columns(&self) -> &[usize] {
		&self.feature_columns
	}

	pub fn n_encoded_columns(&self) -> usize {
		self.feature_columns.len()
	}

	pub fn encode<'a>(&'a self, row: &'a [f32]) -> EncodedRow<'a> {
		EncodedRow {
			row,
			columns: &self.feature_columns,
		}
	}
}

impl<'a> EncodedRow<'a> {
	pub fn n_encoded_columns(&self) -> usize {
		self.columns.len()
	}

	pub fn iter(&self) -> impl Iterator<Item = f32> + 'a {
		let row = self.row;
		self.columns.iter().map(move |column| row[*column])
	}
}

impl<'a> Index<usize> for EncodedRow<'a> {
	type Output = f32;
	fn index(&self, feature: usize) -> &f32 {
		&self.row[self.columns[feature]]
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn test_encode() {
		let encoder = CategoryEncoder::new(vec![2, 0]);
		let row = [1.0, 5.0, f32::NAN];
		let encoded = encoder.encode(&row);
		assert_eq!(encoded.n_encoded_columns(), 2);
		assert!(encoded[0].is_nan());
		assert_eq!(encoded[1], 1.0);
		assert_eq!(encoded.iter().skip(1).collect::<Vec<_>>(), vec![1.0]);
	}
}
