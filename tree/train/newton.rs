use crate::extra_columns::packed_index;
use ndarray::{prelude::*, s};

/// Pivots of the regularized curvature are floored at this value so that a curvature that is not positive definite still yields a finite step.
const MIN_PIVOT: f64 = 1e-12;

/// Unpack the packed upper triangle of a symmetric `n` by `n` curvature and add `lambda` to its diagonal.
fn regularized_curvature(curvature: &[f64], n: usize, lambda: f64) -> Array2<f64> {
	let mut matrix = Array2::zeros((n, n));
	for j in 0..n {
		for i in 0..=j {
			let value = curvature[packed_index(i, j)];
			matrix[[i, j]] = value;
			matrix[[j, i]] = value;
		}
		matrix[[j, j]] += lambda;
	}
	matrix
}

/// The lower triangular `L` with `L L^T = matrix`.
fn cholesky(matrix: &Array2<f64>) -> Array2<f64> {
	let n = matrix.nrows();
	let mut lower = Array2::<f64>::zeros((n, n));
	for j in 0..n {
		let mut pivot = matrix[[j, j]];
		for k in 0..j {
			pivot -= lower[[j, k]] * lower[[j, k]];
		}
		let pivot = pivot.max(MIN_PIVOT).sqrt();
		lower[[j, j]] = pivot;
		for i in j + 1..n {
			let mut value = matrix[[i, j]];
			for k in 0..j {
				value -= lower[[i, k]] * lower[[j, k]];
			}
			lower[[i, j]] = value / pivot;
		}
	}
	lower
}

/// Solve `L L^T x = b` by forward and then back substitution.
fn solve(lower: &Array2<f64>, b: ArrayView1<f64>) -> Array1<f64> {
	let n = b.len();
	let mut y = Array1::<f64>::zeros(n);
	for i in 0..n {
		let sum = lower.row(i).slice(s![..i]).dot(&y.slice(s![..i]));
		y[i] = (b[i] - sum) / lower[[i, i]];
	}
	let mut x = Array1::<f64>::zeros(n);
	for i in (0..n).rev() {
		let sum = lower.column(i).slice(s![i + 1..]).dot(&x.slice(s![i + 1..]));
		x[i] = (y[i] - sum) / lower[[i, i]];
	}
	x
}

/// `(H + lambda I)^-1 g` for gradient `g` and curvature `H`.
fn newton_direction(gradient: &[f64], curvature: &[f64], lambda: f64) -> Array1<f64> {
	let n = gradient.len();
	let gradient = ArrayView1::from(gradient);
	if n == 1 {
		return gradient.mapv(|g| g / (curvature[0] + lambda).max(MIN_PIVOT));
	}
	let lower = cholesky(&regularized_curvature(curvature, n, lambda));
	solve(&lower, gradient)
}

/// The reduction in the second order approximation of the loss, doubled, from moving the prediction of a node by its Newton step, `g^T (H + lambda I)^-1 g`.
pub fn gain_score(gradient: &[f64], curvature: &[f64], lambda: f64) -> f64 {
	let direction = newton_direction(gradient, curvature, lambda);
	ArrayView1::from(gradient).dot(&direction)
}

/// The leaf value `-eta (H + lambda I)^-1 g`.
pub fn leaf_value(gradient: &[f64], curvature: &[f64], lambda: f64, eta: f64) -> Vec<f64> {
	newton_direction(gradient, curvature, lambda)
		.iter()
		.map(|step| -eta * step)
		.collect()
}

#[cfg(test)]
mod test {
	use super::*;
	use approx::assert_abs_diff_eq;

	#[test]
	fn test_single_parameter() {
		assert_abs_diff_eq!(gain_score(&[3.0], &[2.0], 1.0), 3.0, epsilon = 1e-12);
		assert_eq!(leaf_value(&[3.0], &[2.0], 1.0, 0.5), vec![-0.5]);
	}

	#[test]
	fn test_several_parameters() {
		// H = [[2, 1], [1, 2]] has inverse [[2, -1], [-1, 2]] / 3.
		let curvature = [2.0, 1.0, 2.0];
		assert_abs_diff_eq!(gain_score(&[1.0, 1.0], &curvature, 0.0), 2.0 / 3.0, epsilon = 1e-12);
		let value = leaf_value(&[1.0, 0.0], &curvature, 0.0, 1.0);
		assert_abs_diff_eq!(value[0], -2.0 / 3.0, epsilon = 1e-12);
		assert_abs_diff_eq!(value[1], 1.0 / 3.0, epsilon = 1e-12);
	}

	#[test]
	fn test_singular_curvature_is_finite() {
		// The multinomial curvature is singular along the all ones direction.
		let curvature = [0.25, -0.25, 0.25];
		let value = leaf_value(&[0.5, -0.5], &curvature, 0.0, 1.0);
		assert!(value.iter().all(|value| value.is_finite()));
	}
}
