use super::StreamingMetric;
use grove_util::finite::ToFinite;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/**
A `QuantileSketch` summarizes a stream of values with a bounded number of knots, each a value and the number of inputs it stands for. While there are no more distinct values than `capacity`, the knots are exact. Past that, the pair of neighboring knots that is cheapest to merge, judged by the gap between them times their combined count, is repeatedly replaced by its weighted centroid.

Values that are not finite, which includes missing values, are ignored.
*/
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QuantileSketch {
	capacity: usize,
	knots: Vec<(f64, f64)>,
}

/// The result of `QuantileSketch::finalize`. The knots are sorted by value.
#[derive(Clone, Debug, PartialEq)]
pub struct Quantiles {
	knots: Vec<(f64, f64)>,
	count: f64,
}

impl QuantileSketch {
	pub fn new(capacity: usize) -> Self {
		let capacity = capacity.max(2);
		Self {
			capacity,
			knots: Vec::with_capacity(3 * capacity),
		}
	}

	pub fn capacity(&self) -> usize {
		self.capacity
	}

	fn reduce(&mut self) {
		self.knots
			.sort_unstable_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal));
		// Combine knots with equal values.
		let mut combined: Vec<(f64, f64)> = Vec::with_capacity(self.knots.len());
		for &(value, count) in self.knots.iter() {
			match combined.last_mut() {
				Some(last) if last.0 == value => last.1 += count,
				_ => combined.push((value, count)),
			}
		}
		// Merge the cheapest neighbors until the sketch fits its capacity.
		while combined.len() > self.capacity {
			let mut cheapest = 0;
			let mut cheapest_cost = f64::INFINITY;
			for (index, pair) in combined.windows(2).enumerate() {
				let cost = (pair[1].0 - pair[0].0) * (pair[0].1 + pair[1].1);
				if cost < cheapest_cost {
					cheapest = index;
					cheapest_cost = cost;
				}
			}
			let (a, b) = (combined[cheapest], combined[cheapest + 1]);
			let count = a.1 + b.1;
			combined[cheapest] = ((a.0 * a.1 + b.0 * b.1) / count, count);
			combined.remove(cheapest + 1);
		}
		self.knots = combined;
	}
}

impl StreamingMetric<'_> for QuantileSketch {
	type Input = f64;
	type Output = Quantiles;

	fn update(&mut self, value: Self::Input) {
		if let Ok(value) = value.to_finite() {
			self.knots.push((value.get(), 1.0));
			if self.knots.len() >= 3 * self.capacity {
				self.reduce();
			}
		}
	}

	fn merge(&mut self, other: Self) {
		self.knots.extend(other.knots);
		if self.knots.len() >= 3 * self.capacity {
			self.reduce();
		}
	}

	fn finalize(mut self) -> Self::Output {
		self.reduce();
		let count = self.knots.iter().map(|knot| knot.1).sum();
		Quantiles {
			knots: self.knots,
			count,
		}
	}
}

impl Quantiles {
	/// The number of values that were summarized.
	pub fn count(&self) -> f64 {
		self.count
	}

	pub fn is_empty(&self) -> bool {
		self.knots.is_empty()
	}

	/// The knots as `(value, count)` pairs sorted by value.
	pub fn knots(&self) -> &[(f64, f64)] {
		&self.knots
	}

	/**
	Estimate the value below which `percentage` percent of the inputs fall, for `percentage` in [0, 100].

	Each knot is placed at the midpoint of the range of ranks it covers, and ranks between two knots are linearly interpolated. Ranks before the first knot or after the last get the minimum or maximum value.
	*/
	pub fn quantile(&self, percentage: f64) -> Option<f64> {
		let first = self.knots.first()?;
		let rank = percentage.max(0.0).min(100.0) / 100.0 * self.count;
		let mut previous = (first.0, 0.5 * first.1);
		if rank <= previous.1 {
			return Some(first.0);
		}
		let mut cumulative = first.1;
		for &(value, count) in self.knots.iter().skip(1) {
			let position = cumulative + 0.5 * count;
			if rank <= position {
				let fraction = (rank - previous.1) / (position - previous.1);
				return Some(previous.0 + fraction * (value - previous.0));
			}
			previous = (value, position);
			cumulative += count;
		}
		Some(previous.0)
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn test_exact_quantiles() {
		let mut sketch = QuantileSketch::new(100);
		for value in (1..=9).rev() {
			sketch.update(value as f64);
		}
		sketch.update(f64::NAN);
		let quantiles = sketch.finalize();
		assert_eq!(quantiles.count(), 9.0);
		assert_eq!(quantiles.quantile(0.0), Some(1.0));
		assert_eq!(quantiles.quantile(50.0), Some(5.0));
		assert_eq!(quantiles.quantile(100.0), Some(9.0));
		assert!(QuantileSketch::new(10).finalize().quantile(50.0).is_none());
	}

	#[test]
	fn test_merge_matches_single_stream() {
		let values: Vec<f64> = (0..40).map(|i| ((i * 17) % 40) as f64).collect();
		let mut single = QuantileSketch::new(100);
		values.iter().for_each(|value| single.update(*value));
		let mut left = QuantileSketch::new(100);
		let mut right = QuantileSketch::new(100);
		values[..15].iter().for_each(|value| left.update(*value));
		values[15..].iter().for_each(|value| right.update(*value));
		left.merge(right);
		assert_eq!(left.finalize(), single.finalize());
	}

	#[test]
	fn test_compressed_quantiles_are_close() {
		let mut sketch = QuantileSketch::new(50);
		for i in 0..10_000 {
			sketch.update(((i * 7919) % 10_000) as f64 / 10_000.0);
		}
		let quantiles = sketch.finalize();
		assert_eq!(quantiles.knots().len(), 50);
		assert_eq!(quantiles.count(), 10_000.0);
		for &percentage in &[10.0, 25.0, 50.0, 90.0] {
			let estimate = quantiles.quantile(percentage).unwrap();
			assert!(
				(estimate - percentage / 100.0).abs() < 0.04,
				"{} percentile estimate was {}",
				percentage,
				estimate
			);
		}
	}
}
