//! https://en.wikipedia.org/wiki/Algorithms_for_calculating_variance#Parallel_algorithm

use super::StreamingMetric;
use num_traits::ToPrimitive;

/// Combine two separately computed means and sums of squared deviations into a single mean and sum of squared deviations.
pub fn merge_mean_m2(
	n_a: u64,
	mean_a: f64,
	m2_a: f64,
	n_b: u64,
	mean_b: f64,
	m2_b: f64,
) -> (f64, f64) {
	let n_a = n_a.to_f64().unwrap_or(0.0);
	let n_b = n_b.to_f64().unwrap_or(0.0);
	if n_a + n_b == 0.0 {
		return (0.0, 0.0);
	}
	(
		(((n_a * mean_a) + (n_b * mean_b)) / (n_a + n_b)),
		m2_a + m2_b + (mean_b - mean_a) * (mean_b - mean_a) * (n_a * n_b / (n_a + n_b)),
	)
}

pub fn m2_to_variance(m2: f64, n: u64) -> f64 {
	m2 / n.to_f64().unwrap_or(0.0)
}

/// The mean and population variance of a stream of values.
#[derive(Clone, Debug, Default)]
pub struct MeanVariance {
	n: u64,
	mean: f64,
	m2: f64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MeanVarianceOutput {
	pub n: u64,
	pub mean: f64,
	pub variance: f64,
}

impl StreamingMetric<'_> for MeanVariance {
	type Input = f64;
	type Output = Option<MeanVarianceOutput>;

	fn update(&mut self, value: Self::Input) {
		let (mean, m2) = merge_mean_m2(self.n, self.mean, self.m2, 1, value, 0.0);
		self.n += 1;
		self.mean = mean;
		self.m2 = m2;
	}

	fn merge(&mut self, other: Self) {
		let (mean, m2) = merge_mean_m2(self.n, self.mean, self.m2, other.n, other.mean, other.m2);
		self.n += other.n;
		self.mean = mean;
		self.m2 = m2;
	}

	fn finalize(self) -> Self::Output {
		if self.n == 0 {
			None
		} else {
			Some(MeanVarianceOutput {
				n: self.n,
				mean: self.mean,
				variance: m2_to_variance(self.m2, self.n),
			})
		}
	}
}

#[test]
fn test_merged_mean_variance_matches_one_pass() {
	let values = [1.0, 2.0, 4.0, 7.0, 11.0];
	let mut all = MeanVariance::default();
	values.iter().for_each(|value| all.update(*value));
	let mut left = MeanVariance::default();
	let mut right = MeanVariance::default();
	values[..2].iter().for_each(|value| left.update(*value));
	values[2..].iter().for_each(|value| right.update(*value));
	left.merge(right);
	let all = all.finalize().unwrap();
	let merged = left.finalize().unwrap();
	assert_eq!(all.n, 5);
	assert!((all.mean - 5.0).abs() < 1e-12);
	assert!((all.variance - 13.2).abs() < 1e-12);
	assert!((merged.mean - all.mean).abs() < 1e-12);
	assert!((merged.variance - all.variance).abs() < 1e-12);
}
