use crate::EarlyStoppingOptions;

/// Tracks the test loss after each round and decides when to stop adding trees.
#[derive(Clone, Debug)]
pub struct EarlyStoppingMonitor {
	threshold: f64,
	max_rounds_no_improve: usize,
	previous_loss: Option<f64>,
	n_rounds_no_improve: usize,
}

impl EarlyStoppingMonitor {
	pub fn new(threshold: f64, max_rounds_no_improve: usize) -> Self {
		EarlyStoppingMonitor {
			threshold,
			max_rounds_no_improve,
			previous_loss: None,
			n_rounds_no_improve: 0,
		}
	}

	pub fn from_options(options: &EarlyStoppingOptions) -> Self {
		Self::new(
			options.early_stopping_threshold,
			options.early_stopping_rounds.max(1),
		)
	}

	/// Update with the test loss of the latest round. Returns true if training should stop.
	pub fn update(&mut self, loss: f64) -> bool {
		let result = if let Some(previous_loss) = self.previous_loss {
			if loss > previous_loss || (loss - previous_loss).abs() < self.threshold {
				self.n_rounds_no_improve += 1;
				self.n_rounds_no_improve >= self.max_rounds_no_improve
			} else {
				self.n_rounds_no_improve = 0;
				false
			}
		} else {
			false
		};
		self.previous_loss = Some(loss);
		result
	}
}
