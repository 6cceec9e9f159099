use crate::predictor::RowError;

/**
An `EarlyStopPolicy` decides whether the remaining trees can be skipped for an example, given the raw scores accumulated so far. It is checked after every `round_period()` iterations of the ensemble. Policies hold no state besides their parameters, so one policy is shared by every thread scoring a batch.
*/
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum EarlyStopPolicy {
	/// Never stop early.
	None,
	/// Stop once the highest score leads the second highest by more than `margin_threshold`.
	Margin {
		round_period: usize,
		margin_threshold: f64,
	},
}

impl EarlyStopPolicy {
	/// The number of iterations between checks. For `None`, this is so large that no ensemble reaches it.
	pub fn round_period(&self) -> usize {
		match self {
			EarlyStopPolicy::None => usize::MAX,
			EarlyStopPolicy::Margin { round_period, .. } => *round_period,
		}
	}

	/// Returns true if evaluation of the remaining trees should be skipped.
	pub fn should_stop(&self, scores: &[f64]) -> Result<bool, RowError> {
		match self {
			EarlyStopPolicy::None => Ok(false),
			EarlyStopPolicy::Margin {
				margin_threshold, ..
			} => {
				if scores.len() < 2 {
					return Err(RowError::TooFewScores(scores.len()));
				}
				let (first, second) = top_two(scores);
				let margin = first - second;
				Ok(margin > *margin_threshold)
			}
		}
	}
}

/// Find the largest and second largest scores. NaN scores are skipped.
fn top_two(scores: &[f64]) -> (f64, f64) {
	let mut first = f64::NEG_INFINITY;
	let mut second = f64::NEG_INFINITY;
	for &score in scores {
		if score > first {
			second = first;
			first = score;
		} else if score > second {
			second = score;
		}
	}
	(first, second)
}

#[test]
fn test_none_never_stops() {
	let policy = EarlyStopPolicy::None;
	assert_eq!(policy.round_period(), usize::MAX);
	assert!(!policy.should_stop(&[1000.0, -1000.0]).unwrap());
	assert!(!policy.should_stop(&[]).unwrap());
}

#[test]
fn test_margin_stops_on_decisive_scores() {
	let policy = EarlyStopPolicy::Margin {
		round_period: 1,
		margin_threshold: 19.5,
	};
	assert!(policy.should_stop(&[10.0, -10.0]).unwrap());
	assert!(policy.should_stop(&[-10.0, 10.0]).unwrap());
}

#[test]
fn test_margin_never_stops_on_ties() {
	for &margin_threshold in &[1e-12, 0.5, 1.0, 1e12, f64::INFINITY] {
		let policy = EarlyStopPolicy::Margin {
			round_period: 1,
			margin_threshold,
		};
		assert!(!policy.should_stop(&[1.0, 1.0]).unwrap());
	}
}

#[test]
fn test_margin_uses_the_two_largest_scores() {
	let policy = EarlyStopPolicy::Margin {
		round_period: 3,
		margin_threshold: 1.0,
	};
	assert!(!policy.should_stop(&[-5.0, 3.0, 2.5, 0.0]).unwrap());
	assert!(policy.should_stop(&[-5.0, 3.0, 1.5, 0.0]).unwrap());
}

#[test]
fn test_margin_needs_two_scores() {
	let policy = EarlyStopPolicy::Margin {
		round_period: 1,
		margin_threshold: 0.0,
	};
	insta::assert_snapshot!(
		policy.should_stop(&[1.0]).unwrap_err().to_string(),
		@"margin early stopping needs at least two scores per row, got 1"
	);
}
