/*!
This crate defines the [`StreamingMetric`](trait.StreamingMetric.html) trait and the statistics grove accumulates over the rows of a data frame with it: [`Mean`](struct.Mean.html), [`MeanVariance`](struct.MeanVariance.html), and the approximate quantiles of a [`QuantileSketch`](struct.QuantileSketch.html).
*/

#![allow(clippy::tabs_in_doc_comments)]

mod mean;
mod mean_variance;
mod quantile_sketch;

pub use self::mean::Mean;
pub use self::mean_variance::{m2_to_variance, merge_mean_m2, MeanVariance, MeanVarianceOutput};
pub use self::quantile_sketch::{QuantileSketch, Quantiles};

/**
The `StreamingMetric` trait defines a common interface to statistics that can be computed in a streaming manner, where the input is available one row at a time, such as the mean of a column or its quantiles.

After being initialized, a value of type `T` implementing the `StreamingMetric` trait can have `update()` called on it with values of the associated type `Input`. Multiple values of `T` can be merged together by calling `merge()`. This is how a statistic is computed by a row reduction: each block of rows updates its own copy, and the copies are merged in block order. When finished aggregating, you can call `finalize()` on the metric to produce the associated type `Output`.

# Examples

Here is a basic example implementation of a `Min` metric, which takes `f32`s as input and produces an `f32` as output that is the minimum of all the inputs.

```
use grove_metrics::StreamingMetric;

struct Min(f32);

impl StreamingMetric<'_> for Min {
	type Input = f32;
	type Output = f32;
	fn update(&mut self, input: Self::Input) {
		self.0 = self.0.min(input)
	}
	fn merge(&mut self, other: Self) { self.0 = self.0.min(other.0) }
	fn finalize(self) -> Self::Output { self.0 }
}
```

The seemingly unused generic lifetime `'a` exists here to allow `Input`s and `Output`s to borrow from their enclosing scope.
*/
pub trait StreamingMetric<'a> {
	/// `Input` is the type to aggregate in calls to `update()`.
	type Input;
	/// `Output` is the return type of `finalize()`.
	type Output;
	/// Update this streaming metric with the `Input` `input`.
	fn update(&mut self, input: Self::Input);
	/// Merge multiple independently computed streaming metrics.
	fn merge(&mut self, other: Self);
	/// When you are done aggregating `Input`s, call `finalize()` to produce an `Output`.
	fn finalize(self) -> Self::Output;
}
