use crate::{encoder::EncodedRow, extra_columns::packed_index};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/**
A `Loss` computes the derivatives that tree growing needs for a single row. The prediction of a row is a vector of `n_parameters()` values. `gradient` writes the `n_parameters()` entries of the gradient into `out` and `curvature` writes the packed upper triangle of the second derivatives, see [`packed_index`](fn.packed_index.html). Both are multiplied by the row's weight.

`encoded_row` and `is_new_example` are passed so that losses can depend on the features or treat rows added in an incremental update differently. None of the losses in this crate do.
*/
pub trait Loss: Send + Sync + Debug {
	fn name(&self) -> &'static str;

	fn kind(&self) -> LossKind;

	fn n_parameters(&self) -> usize;

	/// Classification losses need a categorical target.
	fn is_classification(&self) -> bool {
		false
	}

	fn gradient(
		&self,
		encoded_row: &EncodedRow,
		is_new_example: bool,
		prediction: &[f32],
		actual: f64,
		weight: f64,
		out: &mut [f64],
	);

	fn curvature(
		&self,
		encoded_row: &EncodedRow,
		is_new_example: bool,
		prediction: &[f32],
		actual: f64,
		weight: f64,
		out: &mut [f64],
	);

	/// The unweighted loss of a single row.
	fn value(&self, prediction: &[f32], actual: f64) -> f64;

	/// Transform the raw prediction into the output of the model, for example from log odds to probabilities.
	fn transform(&self, prediction: &[f32], out: &mut [f64]);
}

/// The serializable name of a loss, used to restore it with a trained model.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum LossKind {
	Mse,
	Msle,
	PseudoHuber { delta: f64 },
	BinomialLogistic,
	MultinomialLogistic { n_classes: usize },
}

impl LossKind {
	pub fn into_loss(self) -> Box<dyn Loss> {
		match self {
			LossKind::Mse => Box::new(Mse),
			LossKind::Msle => Box::new(Msle),
			LossKind::PseudoHuber { delta } => Box::new(PseudoHuber { delta }),
			LossKind::BinomialLogistic => Box::new(BinomialLogistic),
			LossKind::MultinomialLogistic { n_classes } => {
				Box::new(MultinomialLogistic { n_classes })
			}
		}
	}
}

/// The mean squared error.
#[derive(Clone, Copy, Debug, Default)]
pub struct Mse;

impl Loss for Mse {
	fn name(&self) -> &'static str {
		"mse"
	}

	fn kind(&self) -> LossKind {
		LossKind::Mse
	}

	fn n_parameters(&self) -> usize {
		1
	}

	fn gradient(
		&self,
		_: &EncodedRow,
		_: bool,
		prediction: &[f32],
		actual: f64,
		weight: f64,
		out: &mut [f64],
	) {
		out[0] = weight * (prediction[0] as f64 - actual);
	}

	fn curvature(&self, _: &EncodedRow, _: bool, _: &[f32], _: f64, weight: f64, out: &mut [f64]) {
		out[0] = weight;
	}

	fn value(&self, prediction: &[f32], actual: f64) -> f64 {
		(prediction[0] as f64 - actual).powi(2)
	}

	fn transform(&self, prediction: &[f32], out: &mut [f64]) {
		out[0] = prediction[0] as f64;
	}
}

/// The mean squared logarithmic error. The prediction is in log space, so the model outputs `exp(prediction) - 1`. Targets must be greater than -1; smaller targets are clamped.
#[derive(Clone, Copy, Debug, Default)]
pub struct Msle;

impl Msle {
	fn log_actual(actual: f64) -> f64 {
		actual.max(-1.0 + f64::EPSILON).ln_1p()
	}
}

impl Loss for Msle {
	fn name(&self) -> &'static str {
		"msle"
	}

	fn kind(&self) -> LossKind {
		LossKind::Msle
	}

	fn n_parameters(&self) -> usize {
		1
	}

	fn gradient(
		&self,
		_: &EncodedRow,
		_: bool,
		prediction: &[f32],
		actual: f64,
		weight: f64,
		out: &mut [f64],
	) {
		out[0] = weight * (prediction[0] as f64 - Self::log_actual(actual));
	}

	fn curvature(&self, _: &EncodedRow, _: bool, _: &[f32], _: f64, weight: f64, out: &mut [f64]) {
		out[0] = weight;
	}

	fn value(&self, prediction: &[f32], actual: f64) -> f64 {
		(prediction[0] as f64 - Self::log_actual(actual)).powi(2)
	}

	fn transform(&self, prediction: &[f32], out: &mut [f64]) {
		out[0] = (prediction[0] as f64).exp_m1();
	}
}

/// The pseudo Huber loss `delta^2 (sqrt(1 + (r / delta)^2) - 1)` of the residual `r`. It is quadratic for small residuals and linear for large ones.
#[derive(Clone, Copy, Debug)]
pub struct PseudoHuber {
	pub delta: f64,
}

impl PseudoHuber {
	fn scaled(&self, prediction: &[f32], actual: f64) -> (f64, f64) {
		let residual = prediction[0] as f64 - actual;
		let delta = self.delta.max(f64::EPSILON);
		(residual, (1.0 + (residual / delta).powi(2)).sqrt())
	}
}

impl Loss for PseudoHuber {
	fn name(&self) -> &'static str {
		"pseudo_huber"
	}

	fn kind(&self) -> LossKind {
		LossKind::PseudoHuber { delta: self.delta }
	}

	fn n_parameters(&self) -> usize {
		1
	}

	fn gradient(
		&self,
		_: &EncodedRow,
		_: bool,
		prediction: &[f32],
		actual: f64,
		weight: f64,
		out: &mut [f64],
	) {
		let (residual, scale) = self.scaled(prediction, actual);
		out[0] = weight * residual / scale;
	}

	fn curvature(
		&self,
		_: &EncodedRow,
		_: bool,
		prediction: &[f32],
		actual: f64,
		weight: f64,
		out: &mut [f64],
	) {
		let (_, scale) = self.scaled(prediction, actual);
		out[0] = weight / scale.powi(3);
	}

	fn value(&self, prediction: &[f32], actual: f64) -> f64 {
		let (_, scale) = self.scaled(prediction, actual);
		self.delta.powi(2) * (scale - 1.0)
	}

	fn transform(&self, prediction: &[f32], out: &mut [f64]) {
		out[0] = prediction[0] as f64;
	}
}

/// Probabilities are clamped away from zero and one before taking logarithms.
const PROBABILITY_EPSILON: f64 = 1e-7;

fn sigmoid(logit: f64) -> f64 {
	1.0 / (1.0 + (-logit).exp())
}

/// The cross entropy of a binary target, `0` or `1`, with the prediction holding the log odds of `1`.
#[derive(Clone, Copy, Debug, Default)]
pub struct BinomialLogistic;

impl Loss for BinomialLogistic {
	fn name(&self) -> &'static str {
		"binomial_logistic"
	}

	fn kind(&self) -> LossKind {
		LossKind::BinomialLogistic
	}

	fn n_parameters(&self) -> usize {
		1
	}

	fn is_classification(&self) -> bool {
		true
	}

	fn gradient(
		&self,
		_: &EncodedRow,
		_: bool,
		prediction: &[f32],
		actual: f64,
		weight: f64,
		out: &mut [f64],
	) {
		out[0] = weight * (sigmoid(prediction[0] as f64) - actual);
	}

	fn curvature(
		&self,
		_: &EncodedRow,
		_: bool,
		prediction: &[f32],
		_: f64,
		weight: f64,
		out: &mut [f64],
	) {
		let probability = sigmoid(prediction[0] as f64);
		out[0] = weight * probability * (1.0 - probability);
	}

	fn value(&self, prediction: &[f32], actual: f64) -> f64 {
		let probability = sigmoid(prediction[0] as f64)
			.max(PROBABILITY_EPSILON)
			.min(1.0 - PROBABILITY_EPSILON);
		-(actual * probability.ln() + (1.0 - actual) * (1.0 - probability).ln())
	}

	fn transform(&self, prediction: &[f32], out: &mut [f64]) {
		out[0] = sigmoid(prediction[0] as f64);
	}
}

/// The cross entropy of a target with `n_classes` categories. The prediction holds one logit per class.
#[derive(Clone, Copy, Debug)]
pub struct MultinomialLogistic {
	pub n_classes: usize,
}

impl MultinomialLogistic {
	fn softmax(prediction: &[f32], out: &mut [f64]) {
		let max = prediction
			.iter()
			.fold(f64::NEG_INFINITY, |max, logit| max.max(*logit as f64));
		let mut sum = 0.0;
		for (probability, logit) in out.iter_mut().zip(prediction) {
			*probability = (*logit as f64 - max).exp();
			sum += *probability;
		}
		out.iter_mut().for_each(|probability| *probability /= sum);
	}
}

impl Loss for MultinomialLogistic {
	fn name(&self) -> &'static str {
		"multinomial_logistic"
	}

	fn kind(&self) -> LossKind {
		LossKind::MultinomialLogistic {
			n_classes: self.n_classes,
		}
	}

	fn n_parameters(&self) -> usize {
		self.n_classes
	}

	fn is_classification(&self) -> bool {
		true
	}

	fn gradient(
		&self,
		_: &EncodedRow,
		_: bool,
		prediction: &[f32],
		actual: f64,
		weight: f64,
		out: &mut [f64],
	) {
		Self::softmax(prediction, out);
		let actual = actual as usize;
		for (class, gradient) in out.iter_mut().enumerate() {
			let indicator = if class == actual { 1.0 } else { 0.0 };
			*gradient = weight * (*gradient - indicator);
		}
	}

	fn curvature(
		&self,
		_: &EncodedRow,
		_: bool,
		prediction: &[f32],
		_: f64,
		weight: f64,
		out: &mut [f64],
	) {
		// Compute the probabilities into the tail of the packed triangle. Every column but the last lies before the tail, and entry i of the last column is tail entry i.
		let n = self.n_classes;
		let tail = out.len() - n;
		Self::softmax(prediction, &mut out[tail..]);
		for j in 0..n - 1 {
			let pj = out[tail + j];
			for i in 0..=j {
				let pi = out[tail + i];
				out[packed_index(i, j)] = weight * if i == j { pi * (1.0 - pi) } else { -pi * pj };
			}
		}
		let last = out[tail + n - 1];
		for i in 0..n {
			let pi = out[tail + i];
			out[tail + i] = weight * if i == n - 1 { pi * (1.0 - pi) } else { -pi * last };
		}
	}

	fn value(&self, prediction: &[f32], actual: f64) -> f64 {
		let max = prediction
			.iter()
			.fold(f64::NEG_INFINITY, |max, logit| max.max(*logit as f64));
		let log_sum = prediction
			.iter()
			.map(|logit| (*logit as f64 - max).exp())
			.sum::<f64>()
			.ln() + max;
		let actual = (actual as usize).min(self.n_classes - 1);
		log_sum - prediction[actual] as f64
	}

	fn transform(&self, prediction: &[f32], out: &mut [f64]) {
		Self::softmax(prediction, out);
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::encoder::CategoryEncoder;
	use approx::assert_abs_diff_eq;

	/// Compare the analytic derivatives with central differences of `value`.
	fn check_derivatives(loss: &dyn Loss, prediction: &[f32], actual: f64) {
		let encoder = CategoryEncoder::new(vec![0]);
		let row = [0.0f32];
		let encoded = encoder.encode(&row);
		let n = loss.n_parameters();
		let mut gradient = vec![0.0; n];
		let mut curvature = vec![0.0; n * (n + 1) / 2];
		loss.gradient(&encoded, true, prediction, actual, 1.0, &mut gradient);
		loss.curvature(&encoded, true, prediction, actual, 1.0, &mut curvature);
		let step = 1e-2f32;
		let shifted = |i: usize, by: f32| {
			let mut prediction = prediction.to_vec();
			prediction[i] += by;
			prediction
		};
		for i in 0..n {
			let up = loss.value(&shifted(i, step), actual);
			let down = loss.value(&shifted(i, -step), actual);
			// The mean squared losses are half the squared error in their derivatives.
			let scale = match loss.kind() {
				LossKind::Mse | LossKind::Msle => 0.5,
				_ => 1.0,
			};
			let numeric = scale * (up - down) / (2.0 * step as f64);
			assert_abs_diff_eq!(gradient[i], numeric, epsilon = 1e-3);
			let mut up_gradient = vec![0.0; n];
			let mut down_gradient = vec![0.0; n];
			loss.gradient(&encoded, true, &shifted(i, step), actual, 1.0, &mut up_gradient);
			loss.gradient(&encoded, true, &shifted(i, -step), actual, 1.0, &mut down_gradient);
			for j in i..n {
				let numeric = (up_gradient[j] - down_gradient[j]) / (2.0 * step as f64);
				assert_abs_diff_eq!(curvature[packed_index(i, j)], numeric, epsilon = 1e-3);
			}
		}
	}

	#[test]
	fn test_derivatives() {
		check_derivatives(&Mse, &[0.3], 1.5);
		check_derivatives(&Msle, &[0.3], 2.0);
		check_derivatives(&PseudoHuber { delta: 1.5 }, &[0.3], 2.0);
		check_derivatives(&BinomialLogistic, &[0.3], 1.0);
		check_derivatives(&MultinomialLogistic { n_classes: 3 }, &[0.3, -0.2, 0.8], 1.0);
	}

	#[test]
	fn test_weight_scales_derivatives() {
		let encoder = CategoryEncoder::new(vec![0]);
		let row = [0.0f32];
		let encoded = encoder.encode(&row);
		let mut gradient = [0.0];
		let mut curvature = [0.0];
		Mse.gradient(&encoded, true, &[2.0], 1.0, 3.0, &mut gradient);
		Mse.curvature(&encoded, true, &[2.0], 1.0, 3.0, &mut curvature);
		assert_eq!(gradient, [3.0]);
		assert_eq!(curvature, [3.0]);
	}

	#[test]
	fn test_multinomial_transform_is_a_distribution() {
		let mut probabilities = [0.0; 3];
		MultinomialLogistic { n_classes: 3 }.transform(&[1.0, 2.0, -40.0], &mut probabilities);
		assert_abs_diff_eq!(probabilities.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
		assert!(probabilities[1] > probabilities[0]);
	}

	#[test]
	fn test_multinomial_curvature() {
		let encoder = CategoryEncoder::new(vec![0]);
		let row = [0.0f32];
		let encoded = encoder.encode(&row);
		for &n_classes in &[2, 4, 5] {
			let loss = MultinomialLogistic { n_classes };
			let prediction: Vec<f32> = (0..n_classes).map(|class| 0.4 * class as f32 - 0.7).collect();
			let mut probabilities = vec![0.0; n_classes];
			loss.transform(&prediction, &mut probabilities);
			let mut curvature = vec![0.0; n_classes * (n_classes + 1) / 2];
			loss.curvature(&encoded, true, &prediction, 0.0, 2.0, &mut curvature);
			for j in 0..n_classes {
				for i in 0..=j {
					let expected = if i == j {
						probabilities[i] * (1.0 - probabilities[i])
					} else {
						-probabilities[i] * probabilities[j]
					};
					assert_abs_diff_eq!(curvature[packed_index(i, j)], 2.0 * expected, epsilon = 1e-12);
				}
			}
		}
		check_derivatives(
			&MultinomialLogistic { n_classes: 4 },
			&[0.3, -0.2, 0.8, 0.1],
			2.0,
		);
	}
}
