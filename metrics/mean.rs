use super::StreamingMetric;

/// The weighted mean of a stream of `(value, weight)` pairs. Pairs with a weight that is not positive are ignored.
#[derive(Clone, Debug, Default)]
pub struct Mean {
	sum_weights: f64,
	sum_weighted_values: f64,
}

impl StreamingMetric<'_> for Mean {
	type Input = (f64, f64);
	type Output = Option<f64>;

	fn update(&mut self, (value, weight): Self::Input) {
		if weight > 0.0 {
			self.sum_weights += weight;
			self.sum_weighted_values += weight * value;
		}
	}

	fn merge(&mut self, other: Self) {
		self.sum_weights += other.sum_weights;
		self.sum_weighted_values += other.sum_weighted_values;
	}

	fn finalize(self) -> Self::Output {
		if self.sum_weights > 0.0 {
			Some(self.sum_weighted_values / self.sum_weights)
		} else {
			None
		}
	}
}

#[test]
fn test_mean() {
	let mut a = Mean::default();
	a.update((1.0, 1.0));
	a.update((4.0, 2.0));
	let mut b = Mean::default();
	b.update((3.0, 1.0));
	b.update((100.0, 0.0));
	a.merge(b);
	assert_eq!(a.finalize(), Some(3.0));
	assert_eq!(Mean::default().finalize(), None);
}
