use num_traits::Float;
use std::{
	cmp::Ordering,
	fmt::{self, Debug, Display},
	hash::{Hash, Hasher},
};
use thiserror::Error;

/// A float that is neither NaN nor infinite. Because NaN is excluded, `Finite` implements `Ord` and `Hash`, which lets it be sorted without a fallible comparator and used as an ordering key in heaps.
#[derive(Clone, Copy, Debug)]
pub struct Finite<T>(T)
where
	T: Float;

#[derive(Debug, Error)]
#[error("value {value} is not finite")]
pub struct NotFiniteError {
	pub value: f64,
}

impl<T> Finite<T>
where
	T: Float,
{
	pub fn new(value: T) -> Result<Self, NotFiniteError> {
		if value.is_finite() {
			Ok(Self(value))
		} else {
			Err(NotFiniteError {
				value: value.to_f64().unwrap_or(f64::NAN),
			})
		}
	}

	pub fn get(self) -> T {
		self.0
	}
}

impl<T> std::ops::Deref for Finite<T>
where
	T: Float,
{
	type Target = T;
	fn deref(&self) -> &Self::Target {
		&self.0
	}
}

impl<T> Display for Finite<T>
where
	T: Float + Display,
{
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl<T> PartialEq for Finite<T>
where
	T: Float,
{
	fn eq(&self, other: &Self) -> bool {
		self.0 == other.0
	}
}

impl<T> Eq for Finite<T> where T: Float {}

impl<T> PartialOrd for Finite<T>
where
	T: Float,
{
	fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
		Some(self.cmp(other))
	}
}

impl<T> Ord for Finite<T>
where
	T: Float,
{
	fn cmp(&self, other: &Self) -> Ordering {
		// Neither value is NaN, so the partial comparison always succeeds.
		self.0.partial_cmp(&other.0).unwrap_or(Ordering::Equal)
	}
}

impl Hash for Finite<f32> {
	fn hash<H: Hasher>(&self, state: &mut H) {
		// 0.0 and -0.0 compare equal so they must hash equal.
		(self.0 + 0.0).to_bits().hash(state);
	}
}

impl Hash for Finite<f64> {
	fn hash<H: Hasher>(&self, state: &mut H) {
		(self.0 + 0.0).to_bits().hash(state);
	}
}

pub trait ToFinite<T>
where
	T: Float,
{
	/// If the value is finite, return `Ok(Finite(self))`, otherwise return an error naming the value.
	fn to_finite(self) -> Result<Finite<T>, NotFiniteError>;
}

impl<T> ToFinite<T> for T
where
	T: Float,
{
	fn to_finite(self) -> Result<Finite<T>, NotFiniteError> {
		Finite::new(self)
	}
}

#[test]
fn test_finite_ordering() {
	let mut values: Vec<Finite<f64>> = [3.0, -1.0, 2.5, 0.0]
		.iter()
		.map(|value| value.to_finite().unwrap())
		.collect();
	values.sort();
	let values: Vec<f64> = values.into_iter().map(Finite::get).collect();
	assert_eq!(values, vec![-1.0, 0.0, 2.5, 3.0]);
	assert!(f64::NAN.to_finite().is_err());
	assert!(f32::INFINITY.to_finite().is_err());
}
