use crate::error::TrainError;
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// The kinds of per row training state kept in a frame's extra columns.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExtraColumnTag {
	/// The forest's current prediction, one value per loss parameter.
	Prediction,
	/// The loss gradient followed by the packed upper triangle of the loss curvature.
	Gradient,
	/// The packed upper triangle of the loss curvature. This lies inside the `Gradient` region.
	Curvature,
	/// The example weight.
	Weight,
	/// The prediction of the forest before an incremental update.
	PreviousPrediction,
	/// The split bin of each encoded feature.
	BeginSplits,
}

/// Where each row's weight comes from. `Unit` means no weight column was provided and every row has weight one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WeightColumn {
	Unit,
	Column(usize),
}

/// The index of entry `(i, j)`, `i <= j`, of a symmetric matrix stored as its packed upper triangle in column major order.
pub fn packed_index(i: usize, j: usize) -> usize {
	debug_assert!(i <= j);
	j * (j + 1) / 2 + i
}

/// The number of entries in the packed upper triangle of an `n` by `n` symmetric matrix.
pub fn n_packed_entries(n: usize) -> usize {
	n * (n + 1) / 2
}

/**
`ExtraColumns` is the layout of the training state that is appended to every row of a frame. For a loss with `P` parameters and `T = P (P + 1) / 2`, the extra columns hold, in order:

| region | width |
|---|---|
| Prediction | P |
| Gradient | P + T, the gradient followed by the curvature |
| PreviousPrediction | P |
| BeginSplits | one per encoded feature |

The weight is not an extra column. It is either a column of the loaded data or the unit weight.
*/
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExtraColumns {
	n_parameters: usize,
	n_features: usize,
	prediction: usize,
	gradient: usize,
	previous_prediction: usize,
	begin_splits: usize,
	end: usize,
	weight: WeightColumn,
}

impl ExtraColumns {
	/// The number of extra columns needed for a loss with `n_parameters` parameters and `n_features` encoded features.
	pub fn n_extra_columns(n_parameters: usize, n_features: usize) -> usize {
		3 * n_parameters + n_packed_entries(n_parameters) + n_features
	}

	/// Lay out the extra columns starting at `first_extra_column`. A weight column must be one of the columns before `first_extra_column`.
	pub fn new(
		first_extra_column: usize,
		n_parameters: usize,
		n_features: usize,
		weight: WeightColumn,
	) -> Result<Self, TrainError> {
		if n_parameters == 0 {
			return Err(TrainError::InvalidOptions(
				"a loss must have at least one parameter".to_owned(),
			));
		}
		if let WeightColumn::Column(column) = weight {
			if column >= first_extra_column {
				return Err(TrainError::InvalidWeightColumn { column });
			}
		}
		let prediction = first_extra_column;
		let gradient = prediction + n_parameters;
		let previous_prediction = gradient + n_parameters + n_packed_entries(n_parameters);
		let begin_splits = previous_prediction + n_parameters;
		let end = begin_splits + n_features;
		Ok(Self {
			n_parameters,
			n_features,
			prediction,
			gradient,
			previous_prediction,
			begin_splits,
			end,
			weight,
		})
	}

	pub fn n_parameters(&self) -> usize {
		self.n_parameters
	}

	pub fn n_features(&self) -> usize {
		self.n_features
	}

	pub fn first_extra_column(&self) -> usize {
		self.prediction
	}

	pub fn weight_column(&self) -> WeightColumn {
		self.weight
	}

	/// The columns reserved for `tag`. The range is empty for the unit weight.
	pub fn range(&self, tag: ExtraColumnTag) -> Range<usize> {
		let p = self.n_parameters;
		let t = n_packed_entries(p);
		match tag {
			ExtraColumnTag::Prediction => self.prediction..self.prediction + p,
			ExtraColumnTag::Gradient => self.gradient..self.gradient + p + t,
			ExtraColumnTag::Curvature => self.gradient + p..self.gradient + p + t,
			ExtraColumnTag::Weight => match self.weight {
				WeightColumn::Unit => self.end..self.end,
				WeightColumn::Column(column) => column..column + 1,
			},
			ExtraColumnTag::PreviousPrediction => {
				self.previous_prediction..self.previous_prediction + p
			}
			ExtraColumnTag::BeginSplits => self.begin_splits..self.end,
		}
	}

	/// The first column reserved for `tag`, or `None` for the unit weight, which has no column.
	pub fn offset(&self, tag: ExtraColumnTag) -> Option<usize> {
		match (tag, self.weight) {
			(ExtraColumnTag::Weight, WeightColumn::Unit) => None,
			_ => Some(self.range(tag).start),
		}
	}

	pub fn width(&self, tag: ExtraColumnTag) -> usize {
		self.range(tag).len()
	}

	pub fn read_prediction<'a>(&self, row: &'a [f32]) -> &'a [f32] {
		&row[self.range(ExtraColumnTag::Prediction)]
	}

	pub fn write_prediction(&self, row: &mut [f32], prediction: &[f64]) {
		assert_eq!(prediction.len(), self.n_parameters);
		for (cell, value) in row[self.range(ExtraColumnTag::Prediction)]
			.iter_mut()
			.zip(prediction)
		{
			*cell = *value as f32;
		}
	}

	/// Add `scale * value` to the prediction.
	pub fn add_to_prediction(&self, row: &mut [f32], value: &[f64], scale: f64) {
		assert_eq!(value.len(), self.n_parameters);
		for (cell, value) in row[self.range(ExtraColumnTag::Prediction)]
			.iter_mut()
			.zip(value)
		{
			*cell = (*cell as f64 + scale * value) as f32;
		}
	}

	pub fn zero_prediction(&self, row: &mut [f32]) {
		row[self.range(ExtraColumnTag::Prediction)]
			.iter_mut()
			.for_each(|cell| *cell = 0.0);
	}

	pub fn read_previous_prediction<'a>(&self, row: &'a [f32]) -> &'a [f32] {
		&row[self.range(ExtraColumnTag::PreviousPrediction)]
	}

	/// Copy the current prediction into the previous prediction columns.
	pub fn store_previous_prediction(&self, row: &mut [f32]) {
		row.copy_within(
			self.range(ExtraColumnTag::Prediction),
			self.previous_prediction,
		);
	}

	/// The gradient and the curvature, which are stored next to each other.
	pub fn read_loss_derivatives<'a>(&self, row: &'a [f32]) -> &'a [f32] {
		&row[self.range(ExtraColumnTag::Gradient)]
	}

	pub fn read_loss_gradient<'a>(&self, row: &'a [f32]) -> &'a [f32] {
		&row[self.gradient..self.gradient + self.n_parameters]
	}

	pub fn read_loss_curvature<'a>(&self, row: &'a [f32]) -> &'a [f32] {
		&row[self.range(ExtraColumnTag::Curvature)]
	}

	pub fn write_loss_gradient(&self, row: &mut [f32], gradient: &[f64]) {
		assert_eq!(gradient.len(), self.n_parameters);
		for (cell, value) in row[self.gradient..self.gradient + self.n_parameters]
			.iter_mut()
			.zip(gradient)
		{
			*cell = *value as f32;
		}
	}

	pub fn write_loss_curvature(&self, row: &mut [f32], curvature: &[f64]) {
		assert_eq!(curvature.len(), n_packed_entries(self.n_parameters));
		for (cell, value) in row[self.range(ExtraColumnTag::Curvature)]
			.iter_mut()
			.zip(curvature)
		{
			*cell = *value as f32;
		}
	}

	pub fn zero_loss_derivatives(&self, row: &mut [f32]) {
		row[self.range(ExtraColumnTag::Gradient)]
			.iter_mut()
			.for_each(|cell| *cell = 0.0);
	}

	pub fn read_example_weight(&self, row: &[f32]) -> f64 {
		match self.weight {
			WeightColumn::Unit => 1.0,
			WeightColumn::Column(column) => row[column] as f64,
		}
	}

	/// The split bin of encoded feature `feature`.
	pub fn read_split(&self, row: &[f32], feature: usize) -> usize {
		assert!(feature < self.n_features);
		row[self.begin_splits + feature] as usize
	}

	pub fn write_split(&self, row: &mut [f32], feature: usize, bin: usize) {
		assert!(feature < self.n_features);
		row[self.begin_splits + feature] = bin as f32;
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use proptest::prelude::*;

	#[test]
	fn test_packed_index_covers_the_upper_triangle() {
		for n in 1..6 {
			let mut indices: Vec<usize> = (0..n)
				.flat_map(|j| (0..=j).map(move |i| packed_index(i, j)))
				.collect();
			indices.sort_unstable();
			assert_eq!(indices, (0..n_packed_entries(n)).collect::<Vec<_>>());
		}
	}

	#[test]
	fn test_weights() {
		let row = [1.0, 2.5, 3.0];
		let unit = ExtraColumns::new(3, 1, 0, WeightColumn::Unit).unwrap();
		assert_eq!(unit.read_example_weight(&row), 1.0);
		assert_eq!(unit.offset(ExtraColumnTag::Weight), None);
		assert_eq!(unit.width(ExtraColumnTag::Weight), 0);
		let column = ExtraColumns::new(3, 1, 0, WeightColumn::Column(1)).unwrap();
		assert_eq!(column.read_example_weight(&row), 2.5);
		assert!(matches!(
			ExtraColumns::new(3, 1, 0, WeightColumn::Column(3)),
			Err(TrainError::InvalidWeightColumn { column: 3 })
		));
	}

	#[test]
	fn test_writes_stay_in_their_region() {
		let layout = ExtraColumns::new(2, 2, 3, WeightColumn::Unit).unwrap();
		let mut row = vec![7.0; 2 + ExtraColumns::n_extra_columns(2, 3)];
		layout.zero_prediction(&mut row);
		layout.zero_loss_derivatives(&mut row);
		layout.write_loss_gradient(&mut row, &[1.0, 2.0]);
		layout.write_loss_curvature(&mut row, &[3.0, 4.0, 5.0]);
		layout.write_prediction(&mut row, &[0.5, -0.5]);
		layout.add_to_prediction(&mut row, &[1.0, 1.0], 2.0);
		layout.store_previous_prediction(&mut row);
		layout.write_split(&mut row, 2, 9);
		assert_eq!(&row[..2], &[7.0, 7.0]);
		assert_eq!(layout.read_prediction(&row), &[2.5, 1.5]);
		assert_eq!(layout.read_previous_prediction(&row), &[2.5, 1.5]);
		assert_eq!(layout.read_loss_gradient(&row), &[1.0, 2.0]);
		assert_eq!(layout.read_loss_curvature(&row), &[3.0, 4.0, 5.0]);
		assert_eq!(
			layout.read_loss_derivatives(&row),
			&[1.0, 2.0, 3.0, 4.0, 5.0]
		);
		assert_eq!(layout.read_split(&row, 2), 9);
		assert_eq!(layout.read_split(&row, 0), 7);
	}

	proptest! {
		#[test]
		fn test_region_widths(n_parameters in 1usize..10, n_features in 0usize..20, first in 1usize..50) {
			let layout = ExtraColumns::new(first, n_parameters, n_features, WeightColumn::Column(0)).unwrap();
			let t = n_parameters * (n_parameters + 1) / 2;
			prop_assert_eq!(layout.width(ExtraColumnTag::Prediction), n_parameters);
			prop_assert_eq!(layout.width(ExtraColumnTag::Gradient), n_parameters + t);
			prop_assert_eq!(layout.width(ExtraColumnTag::Curvature), t);
			prop_assert_eq!(layout.width(ExtraColumnTag::PreviousPrediction), n_parameters);
			prop_assert_eq!(layout.width(ExtraColumnTag::BeginSplits), n_features);
			prop_assert_eq!(layout.width(ExtraColumnTag::Weight), 1);
			let gradient = layout.range(ExtraColumnTag::Gradient);
			let curvature = layout.range(ExtraColumnTag::Curvature);
			prop_assert_eq!(curvature.start, gradient.start + n_parameters);
			prop_assert_eq!(curvature.end, gradient.end);
			// The regions tile the extra columns without gaps or overlaps.
			let tiles = [
				layout.range(ExtraColumnTag::Prediction),
				gradient,
				layout.range(ExtraColumnTag::PreviousPrediction),
				layout.range(ExtraColumnTag::BeginSplits),
			];
			let mut next = first;
			for tile in tiles.iter() {
				prop_assert_eq!(tile.start, next);
				next = tile.end;
			}
			prop_assert_eq!(next - first, ExtraColumns::n_extra_columns(n_parameters, n_features));
		}
	}
}
