/*!
This crate provides the data frame that grove trains on. Values are stored row-major as `f32`s so that a row, including the extra bookkeeping columns that training appends, is a single contiguous slice that can be read and written in place. Categorical columns hold the index of the category as a float and missing values are `NaN`.

Rows are read and written in parallel by a [`WorkerPool`](struct.WorkerPool.html), which splits a row range into fixed size blocks of contiguous rows, see [`DataFrame::read_rows`](struct.DataFrame.html#method.read_rows) and [`reduce_rows`](fn.reduce_rows.html). A [`RowMask`](struct.RowMask.html) restricts which rows are visited.
*/

#![allow(clippy::tabs_in_doc_comments)]

mod load;
mod reduce;
mod row_mask;

pub use self::load::*;
pub use self::reduce::*;
pub use self::row_mask::*;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ColumnType {
	Number,
	/// The cells of a categorical column hold the index into `options`.
	Categorical {
		options: Vec<String>,
	},
	/// A column appended by `DataFrame::add_columns` to hold per row training state.
	Extra,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DataFrame {
	column_names: Vec<String>,
	column_types: Vec<ColumnType>,
	n_rows: usize,
	values: Vec<f32>,
}

/// Missing cells are stored as `NaN`.
pub fn is_missing(value: f32) -> bool {
	value.is_nan()
}

impl DataFrame {
	pub fn new(column_names: Vec<String>, column_types: Vec<ColumnType>) -> Self {
		assert!(
			!column_names.is_empty(),
			"a data frame needs at least one column"
		);
		assert_eq!(column_names.len(), column_types.len());
		Self {
			column_names,
			column_types,
			n_rows: 0,
			values: Vec::new(),
		}
	}

	pub fn reserve(&mut self, n_rows: usize) {
		self.values.reserve_exact(n_rows * self.n_columns());
	}

	pub fn push_row(&mut self, row: &[f32]) {
		assert_eq!(
			row.len(),
			self.n_columns(),
			"a row must have one value per column"
		);
		self.values.extend_from_slice(row);
		self.n_rows += 1;
	}

	pub fn n_rows(&self) -> usize {
		self.n_rows
	}

	pub fn n_columns(&self) -> usize {
		self.column_names.len()
	}

	pub fn column_names(&self) -> &[String] {
		&self.column_names
	}

	pub fn column_types(&self) -> &[ColumnType] {
		&self.column_types
	}

	pub fn column_index(&self, name: &str) -> Option<usize> {
		self.column_names
			.iter()
			.position(|column_name| column_name == name)
	}

	pub fn is_categorical(&self, column: usize) -> bool {
		matches!(self.column_types[column], ColumnType::Categorical { .. })
	}

	pub fn is_extra(&self, column: usize) -> bool {
		matches!(self.column_types[column], ColumnType::Extra)
	}

	/// The number of categories of a categorical column, or `None` for any other column.
	pub fn n_categories(&self, column: usize) -> Option<usize> {
		match &self.column_types[column] {
			ColumnType::Categorical { options } => Some(options.len()),
			_ => None,
		}
	}

	pub fn row(&self, index: usize) -> &[f32] {
		let n_columns = self.n_columns();
		&self.values[index * n_columns..(index + 1) * n_columns]
	}

	pub fn row_mut(&mut self, index: usize) -> &mut [f32] {
		let n_columns = self.n_columns();
		&mut self.values[index * n_columns..(index + 1) * n_columns]
	}

	pub fn rows(&self) -> std::slice::ChunksExact<'_, f32> {
		self.values.chunks_exact(self.n_columns())
	}

	pub fn value(&self, row: usize, column: usize) -> f32 {
		self.values[row * self.n_columns() + column]
	}

	/// Append `n` extra columns, initialized to zero, to every row. Returns the index of the first new column. Extra columns always follow the columns that were loaded, so every column index below the returned index refers to user data.
	pub fn add_columns(&mut self, n: usize) -> usize {
		let first = self.n_columns();
		if n == 0 {
			return first;
		}
		let n_columns = first + n;
		let mut values = Vec::with_capacity(self.n_rows * n_columns);
		for row in self.values.chunks_exact(first) {
			values.extend_from_slice(row);
			values.extend(std::iter::repeat(0.0).take(n));
		}
		self.values = values;
		for _ in 0..n {
			self.column_names.push(String::new());
			self.column_types.push(ColumnType::Extra);
		}
		first
	}
}

#[test]
fn test_add_columns() {
	let mut frame = DataFrame::new(
		vec!["x".to_owned(), "y".to_owned()],
		vec![ColumnType::Number, ColumnType::Number],
	);
	frame.push_row(&[1.0, 2.0]);
	frame.push_row(&[3.0, f32::NAN]);
	let first = frame.add_columns(2);
	assert_eq!(first, 2);
	assert_eq!(frame.n_columns(), 4);
	assert_eq!(frame.row(0), &[1.0, 2.0, 0.0, 0.0]);
	assert_eq!(frame.row(1)[0], 3.0);
	assert!(is_missing(frame.value(1, 1)));
	assert!(frame.is_extra(3));
	assert!(!frame.is_extra(1));
}
