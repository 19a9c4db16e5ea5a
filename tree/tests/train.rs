use approx::assert_abs_diff_eq;
use grove_dataframe::{ColumnType, DataFrame, FromCsvOptions, RowMask};
use grove_metrics::{Mean, StreamingMetric};
use grove_tree::{BoostedTree, LossKind, TrainError, TrainOptions};

/// `y = 2x` with a noise feature `z`. Every seventh `x` is missing, and then `y` is zero.
fn linear_frame(n_rows: usize) -> DataFrame {
	let mut frame = DataFrame::new(
		vec!["x".to_owned(), "z".to_owned(), "y".to_owned()],
		vec![ColumnType::Number, ColumnType::Number, ColumnType::Number],
	);
	for i in 0..n_rows {
		let x = i as f32 / 10.0;
		let (x, y) = if i % 7 == 3 { (f32::NAN, 0.0) } else { (x, 2.0 * x) };
		frame.push_row(&[x, ((i * 7) % 13) as f32, y]);
	}
	frame
}

fn options() -> TrainOptions {
	TrainOptions {
		n_folds: 0,
		max_trees: 50,
		eta: 0.3,
		..TrainOptions::default()
	}
}

fn mean_absolute_error(model: &BoostedTree, frame: &DataFrame, rows: impl Iterator<Item = usize>) -> f64 {
	let mut output = [0.0];
	let mut total = 0.0;
	let mut count = 0;
	for index in rows {
		let row = frame.row(index);
		model.predict_row(row, &mut output);
		total += (output[0] - row[2] as f64).abs();
		count += 1;
	}
	total / count as f64
}

#[test]
fn test_regression() {
	let mut frame = linear_frame(200);
	let model = BoostedTree::train(&mut frame, 2, LossKind::Mse, options(), &mut |_| {}).unwrap();
	assert_eq!(model.forest().len(), 50);
	assert_eq!(model.losses().len(), 50);
	assert!(model.forest().trees()[0].root().is_leaf());
	assert!(!model.forest().trees()[1].root().is_leaf());
	assert!(model.losses()[49] < model.losses()[1]);
	assert!(mean_absolute_error(&model, &frame, 0..200) < 1.0);

	// The prediction columns written while training agree with a fresh prediction.
	let column = model.predict(&mut frame, 2).unwrap();
	let extra_columns = model.extra_columns().clone();
	for row in frame.rows() {
		let trained = extra_columns.read_prediction(row)[0];
		assert_abs_diff_eq!(trained, row[column], epsilon = 1e-3);
	}
}

#[test]
fn test_noise_free_regression_is_accurate_pointwise() {
	let mut frame = DataFrame::new(
		vec!["x".to_owned(), "y".to_owned()],
		vec![ColumnType::Number, ColumnType::Number],
	);
	for i in 0..80 {
		let x = i as f32 / 4.0;
		frame.push_row(&[x, 2.0 * x]);
	}
	let options = TrainOptions {
		max_trees: 100,
		max_candidate_splits: 100,
		..options()
	};
	let model = BoostedTree::train(&mut frame, 1, LossKind::Mse, options, &mut |_| {}).unwrap();
	let mut output = [0.0];
	for i in (0..80).step_by(7) {
		let x = i as f32 / 4.0;
		model.predict_row(&[x, f32::NAN], &mut output);
		assert!(
			(output[0] - 2.0 * x as f64).abs() < 0.3,
			"predicted {} at x = {}",
			output[0],
			x
		);
	}
}

#[test]
fn test_cached_and_evaluated_traversals_agree() {
	let mut frame = linear_frame(300);
	let model = BoostedTree::train(&mut frame, 2, LossKind::Mse, options(), &mut |_| {}).unwrap();
	let encoder = model.encoder();
	for row in frame.rows() {
		for tree in model.forest().trees() {
			assert_eq!(
				tree.leaf_index_cached(row, model.extra_columns()),
				tree.leaf_index(&encoder.encode(row))
			);
		}
	}
}

#[test]
fn test_cross_validation_chooses_the_number_of_trees() {
	let mut frame = linear_frame(200);
	let options = TrainOptions {
		n_folds: 3,
		max_trees: 20,
		train_fraction_per_fold: 0.7,
		..options()
	};
	let mut n_updates = 0;
	let model =
		BoostedTree::train(&mut frame, 2, LossKind::Mse, options, &mut |_| n_updates += 1).unwrap();
	assert_eq!(n_updates, 3);
	let report = model.cross_validation().unwrap();
	assert!(report.n_trees >= 1 && report.n_trees <= 20);
	assert_eq!(model.forest().len(), report.n_trees);
	assert_eq!(report.mean_test_losses.len(), report.test_loss_variances.len());
	let mut metric = Mean::default();
	let mut output = [0.0];
	for row in frame.rows() {
		model.predict_row(row, &mut output);
		metric.update(((output[0] - row[2] as f64).powi(2), 1.0));
	}
	// The chosen forest fits better than the bias alone.
	let mse = metric.finalize().unwrap();
	assert!(mse <= report.mean_test_losses[0]);
}

#[test]
fn test_binary_classification() {
	let mut frame = DataFrame::new(
		vec!["x".to_owned(), "label".to_owned()],
		vec![
			ColumnType::Number,
			ColumnType::Categorical {
				options: vec!["no".to_owned(), "yes".to_owned()],
			},
		],
	);
	for i in 0..100 {
		let x = i as f32;
		frame.push_row(&[x, if x < 50.0 { 0.0 } else { 1.0 }]);
	}
	let model =
		BoostedTree::train(&mut frame, 1, LossKind::BinomialLogistic, options(), &mut |_| {}).unwrap();
	let mut probability = [0.0];
	model.predict_row(&[10.0, 0.0], &mut probability);
	assert!(probability[0] < 0.1);
	model.predict_row(&[90.0, 1.0], &mut probability);
	assert!(probability[0] > 0.9);
}

#[test]
fn test_multiclass_classification() {
	let mut frame = DataFrame::new(
		vec!["x".to_owned(), "label".to_owned()],
		vec![
			ColumnType::Number,
			ColumnType::Categorical {
				options: vec!["a".to_owned(), "b".to_owned(), "c".to_owned()],
			},
		],
	);
	for i in 0..90 {
		frame.push_row(&[i as f32, (i / 30) as f32]);
	}
	let loss = LossKind::MultinomialLogistic { n_classes: 3 };
	let model = BoostedTree::train(&mut frame, 1, loss, options(), &mut |_| {}).unwrap();
	let mut probabilities = [0.0; 3];
	model.predict_row(&[45.0, 1.0], &mut probabilities);
	assert_abs_diff_eq!(probabilities.iter().sum::<f64>(), 1.0, epsilon = 1e-6);
	assert!(probabilities[1] > probabilities[0] && probabilities[1] > probabilities[2]);
}

#[test]
fn test_invalid_input() {
	let mut frame = linear_frame(20);
	let error =
		BoostedTree::train(&mut frame, 5, LossKind::Mse, options(), &mut |_| {}).unwrap_err();
	assert!(matches!(error, TrainError::InvalidTargetColumn { column: 5 }));
	let error = BoostedTree::train(&mut frame, 2, LossKind::BinomialLogistic, options(), &mut |_| {})
		.unwrap_err();
	assert!(matches!(error, TrainError::TargetTypeMismatch { column: 2, .. }));
	let mut tiny = linear_frame(1);
	let error = BoostedTree::train(&mut tiny, 2, LossKind::Mse, options(), &mut |_| {}).unwrap_err();
	assert!(matches!(
		error,
		TrainError::InsufficientTrainingData {
			n_rows: 1,
			required: 2
		}
	));
}

#[test]
fn test_training_does_not_depend_on_n_threads() {
	// Enough rows for the row driver to cut every pass into several blocks.
	let train = |n_threads| {
		let mut frame = linear_frame(5000);
		let options = TrainOptions {
			n_threads,
			n_folds: 3,
			max_trees: 15,
			..options()
		};
		let model = BoostedTree::train(&mut frame, 2, LossKind::Mse, options, &mut |_| {}).unwrap();
		let column = model.predict(&mut frame, n_threads).unwrap();
		let predictions: Vec<f32> = frame.rows().map(|row| row[column]).collect();
		(model, predictions)
	};
	let (single, single_predictions) = train(1);
	for &n_threads in &[2, 4] {
		let (parallel, parallel_predictions) = train(n_threads);
		assert_eq!(parallel.candidate_splits(), single.candidate_splits());
		assert_eq!(parallel.cross_validation(), single.cross_validation());
		assert_eq!(parallel.forest(), single.forest());
		assert_eq!(parallel.losses(), single.losses());
		assert_eq!(parallel_predictions, single_predictions);
	}
}

/// The first 150 rows are trained on, then the last 50 rows get a target that is 5 higher than the old relationship predicts.
fn incremental_fixture() -> (DataFrame, BoostedTree, RowMask) {
	let mut frame = linear_frame(200);
	for index in 150..200 {
		frame.row_mut(index)[2] = f32::NAN;
	}
	let model = BoostedTree::train(&mut frame, 2, LossKind::Mse, options(), &mut |_| {}).unwrap();
	for index in 150..200 {
		let row = frame.row_mut(index);
		row[2] = if row[0].is_nan() { 5.0 } else { 2.0 * row[0] + 5.0 };
	}
	let new_rows: Vec<usize> = (150..200).collect();
	let new_rows_mask = RowMask::from_sorted_indices(200, &new_rows);
	(frame, model, new_rows_mask)
}

#[test]
fn test_incremental_training_changes_only_selected_trees() {
	let (mut frame, mut model, new_rows_mask) = incremental_fixture();
	let old_forest = model.forest().clone();
	let mut options = options();
	options.incremental.max_trees_to_retrain = 5;
	options.incremental.max_new_trees = 0;
	let report = model
		.train_incremental(&mut frame, &new_rows_mask, &options)
		.unwrap();
	assert_eq!(report.new_trees, 0);
	assert_eq!(model.forest().len(), old_forest.len());
	assert!(!report.retrained_trees.is_empty() && report.retrained_trees.len() <= 5);
	assert!(!report.retrained_trees.contains(&0));
	let mut retrained = report.retrained_trees.clone();
	retrained.sort_unstable();
	retrained.dedup();
	assert_eq!(retrained.len(), report.retrained_trees.len());
	for (index, (old, new)) in old_forest.trees().iter().zip(model.forest().trees()).enumerate() {
		if !report.retrained_trees.contains(&index) {
			assert_eq!(old, new);
		}
	}
}

#[test]
fn test_incremental_training_fits_new_rows() {
	let (mut frame, mut model, new_rows_mask) = incremental_fixture();
	let before = mean_absolute_error(&model, &frame, 150..200);
	let mut options = options();
	options.incremental.max_trees_to_retrain = 0;
	options.incremental.max_new_trees = 10;
	let report = model
		.train_incremental(&mut frame, &new_rows_mask, &options)
		.unwrap();
	assert!(report.retrained_trees.is_empty());
	assert_eq!(report.new_trees, 10);
	assert_eq!(model.forest().len(), 60);
	let after = mean_absolute_error(&model, &frame, 150..200);
	assert!(after < before - 0.2);
}

#[test]
fn test_json_round_trip() {
	let mut frame = linear_frame(100);
	let model = BoostedTree::train(&mut frame, 2, LossKind::Mse, options(), &mut |_| {}).unwrap();
	let restored = BoostedTree::from_json(&model.to_json().unwrap()).unwrap();
	assert_eq!(restored.forest().len(), model.forest().len());
	let (mut a, mut b) = ([0.0], [0.0]);
	for row in frame.rows() {
		model.predict_row(row, &mut a);
		restored.predict_row(row, &mut b);
		assert_abs_diff_eq!(a[0], b[0], epsilon = 1e-4);
	}
}

#[test]
fn test_options_from_partial_json() {
	let options = TrainOptions::from_json(r#"{"max_trees": 7, "incremental": {"max_new_trees": 3}}"#).unwrap();
	assert_eq!(options.max_trees, 7);
	assert_eq!(options.incremental.max_new_trees, 3);
	assert_eq!(options.eta, TrainOptions::default().eta);
	assert_eq!(
		options.incremental.prediction_change_cost,
		TrainOptions::default().incremental.prediction_change_cost
	);
}

#[test]
fn test_train_from_csv() {
	let csv = "size,color,price\n1,red,2\n2,blue,4\n3,red,6\n4,blue,8\n5,red,10\n6,blue,12\n7,red,14\n8,blue,16\n";
	let mut reader = csv::Reader::from_reader(std::io::Cursor::new(csv));
	let mut frame = DataFrame::from_csv(&mut reader, FromCsvOptions::default(), |_| {}).unwrap();
	let target = frame.column_index("price").unwrap();
	assert!(frame.is_categorical(frame.column_index("color").unwrap()));
	let options = TrainOptions {
		lambda: 0.0,
		max_trees: 30,
		eta: 0.5,
		..options()
	};
	let model = BoostedTree::train(&mut frame, target, LossKind::Mse, options, &mut |_| {}).unwrap();
	let row = frame.row(7).to_vec();
	let mut price = [0.0];
	model.predict_row(&row, &mut price);
	assert_abs_diff_eq!(price[0], 16.0, epsilon = 0.5);
}
