use std::sync::{
	atomic::{AtomicU64, Ordering},
	Arc,
};

/// A shared counter that long running work increments as it goes, so another thread can report how far along it is. Clones share the same count.
#[derive(Clone, Debug)]
pub struct ProgressCounter {
	current: Arc<AtomicU64>,
	total: u64,
}

impl ProgressCounter {
	pub fn new(total: u64) -> Self {
		Self {
			current: Arc::new(AtomicU64::new(0)),
			total,
		}
	}

	pub fn total(&self) -> u64 {
		self.total
	}

	pub fn get(&self) -> u64 {
		self.current.load(Ordering::Relaxed)
	}

	pub fn inc(&self, amount: u64) {
		self.current.fetch_add(amount, Ordering::Relaxed);
	}

	/// The completed fraction in [0, 1]. A counter with a total of zero is complete.
	pub fn fraction(&self) -> f64 {
		if self.total == 0 {
			1.0
		} else {
			(self.get() as f64 / self.total as f64).min(1.0)
		}
	}
}

#[test]
fn test_progress_counter_is_shared_between_clones() {
	let counter = ProgressCounter::new(4);
	let clone = counter.clone();
	clone.inc(1);
	counter.inc(2);
	assert_eq!(counter.get(), 3);
	assert!((clone.fraction() - 0.75).abs() < 1e-12);
	assert!((ProgressCounter::new(0).fraction() - 1.0).abs() < 1e-12);
}
