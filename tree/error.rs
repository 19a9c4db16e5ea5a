use crate::sampling::SamplingError;
use grove_dataframe::ReadError;
use thiserror::Error;

/// The errors that abort a training run. Each describes a problem with the input or the options, so retrying with the same input fails the same way.
#[derive(Debug, Error)]
pub enum TrainError {
	#[error("input error: insufficient training data, {n_rows} rows are available but at least {required} are needed")]
	InsufficientTrainingData { n_rows: usize, required: usize },
	#[error("input error: target column {column} is not a column of the loaded data")]
	InvalidTargetColumn { column: usize },
	#[error("input error: the {loss} loss needs a categorical target but column {column} is numeric")]
	TargetTypeMismatch { loss: &'static str, column: usize },
	#[error("input error: the target has {n_categories} categories but the {loss} loss predicts {n_classes}")]
	CategoryCountMismatch {
		loss: &'static str,
		n_categories: usize,
		n_classes: usize,
	},
	#[error("input error: weight column {column} is not a column of the loaded data")]
	InvalidWeightColumn { column: usize },
	#[error("input error: the row mask has {mask_len} rows but the frame has {n_rows}")]
	MaskLength { mask_len: usize, n_rows: usize },
	#[error("input error: the model reads column {expected} but the frame has {n_columns} columns")]
	ColumnCount { expected: usize, n_columns: usize },
	#[error("invalid option: {0}")]
	InvalidOptions(String),
	#[error(transparent)]
	Sampling(#[from] SamplingError),
	#[error("failed to read rows")]
	Read(#[from] ReadError),
	#[error("failed to compute the {0}")]
	Statistics(&'static str),
	#[error(transparent)]
	Json(#[from] serde_json::Error),
}
