use crate::model_text::ParseError;

/**
An `ObjectiveTransform` maps the raw scores a model accumulates for an example to the output the caller sees. It is reconstructed from the `objective` line of the model text.
*/
#[derive(Clone, Debug, PartialEq)]
pub enum ObjectiveTransform {
	/// Multiclass classification. The raw scores are logits and the output is the class probabilities.
	Softmax,
	/// Binary classification. The output is `1 / (1 + exp(-sigmoid * score))`.
	Sigmoid { sigmoid: f64 },
	/// Regression. The output is the raw score.
	Identity,
	/// Regression with a log link, such as poisson, gamma, and tweedie. The output is `exp(score)`.
	Exponential,
}

impl ObjectiveTransform {
	/**
	Parse the value of an `objective` line, such as `multiclass num_class:3` or `binary sigmoid:1`. Returns `None` for objectives that apply no transform. `n_classes` is the number of classes declared by the model, which a multiclass objective must agree with.
	*/
	pub fn from_text(text: &str, n_classes: usize) -> Result<Option<ObjectiveTransform>, ParseError> {
		let mut tokens = text.split(' ').filter(|token| !token.is_empty());
		let name = tokens.next().unwrap_or("");
		let parameter = |key: &str| {
			text.split(' ')
				.find_map(|token| token.strip_prefix(key)?.strip_prefix(':'))
		};
		let objective = match name {
			"multiclass" | "softmax" => {
				if let Some(value) = parameter("num_class") {
					let declared: usize = value.parse().map_err(|_| ParseError::InvalidValue {
						key: "objective",
						value: text.to_owned(),
					})?;
					if declared != n_classes {
						return Err(ParseError::ObjectiveClassMismatch {
							declared,
							n_classes,
						});
					}
				}
				ObjectiveTransform::Softmax
			}
			"binary" => {
				let sigmoid = match parameter("sigmoid") {
					Some(value) => value.parse().map_err(|_| ParseError::InvalidValue {
						key: "objective",
						value: text.to_owned(),
					})?,
					None => 1.0,
				};
				ObjectiveTransform::Sigmoid { sigmoid }
			}
			"regression" | "regression_l2" | "l2" | "mean_squared_error" | "mse" | "l2_root"
			| "root_mean_squared_error" | "rmse" | "regression_l1" | "l1" | "mean_absolute_error"
			| "mae" | "huber" | "fair" | "quantile" | "mape" | "mean_absolute_percentage_error" => {
				ObjectiveTransform::Identity
			}
			"poisson" | "gamma" | "tweedie" => ObjectiveTransform::Exponential,
			"none" | "null" | "custom" | "na" => return Ok(None),
			_ => return Err(ParseError::UnknownObjective(text.to_owned())),
		};
		Ok(Some(objective))
	}

	/// Transform the raw scores for a single example in place.
	pub fn transform(&self, scores: &mut [f64]) {
		match self {
			ObjectiveTransform::Softmax => softmax(scores),
			ObjectiveTransform::Sigmoid { sigmoid } => {
				for score in scores.iter_mut() {
					*score = 1.0 / (1.0 + (-sigmoid * *score).exp());
				}
			}
			ObjectiveTransform::Identity => {}
			ObjectiveTransform::Exponential => {
				for score in scores.iter_mut() {
					*score = score.exp();
				}
			}
		}
	}

	/// Write the raw score of each output before any tree contributes. Training bakes the initial score into the first trees, so this is zero for every objective.
	pub fn bias_init(&self, scores: &mut [f64]) {
		for score in scores.iter_mut() {
			*score = 0.0;
		}
	}

	/// Early stopping during prediction compares raw score margins, which is only meaningful for classification. Regression outputs are sensitive to every tree, so they always need the full ensemble.
	pub fn allows_early_stop(&self) -> bool {
		match self {
			ObjectiveTransform::Softmax | ObjectiveTransform::Sigmoid { .. } => true,
			ObjectiveTransform::Identity | ObjectiveTransform::Exponential => false,
		}
	}
}

fn softmax(scores: &mut [f64]) {
	let max = scores.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));
	for score in scores.iter_mut() {
		*score = (*score - max).exp();
	}
	let sum = scores.iter().sum::<f64>();
	for score in scores.iter_mut() {
		*score /= sum;
	}
}

#[test]
fn test_parse_objective() {
	assert_eq!(
		ObjectiveTransform::from_text("multiclass num_class:3", 3).unwrap(),
		Some(ObjectiveTransform::Softmax)
	);
	assert_eq!(
		ObjectiveTransform::from_text("binary sigmoid:2", 1).unwrap(),
		Some(ObjectiveTransform::Sigmoid { sigmoid: 2.0 })
	);
	assert_eq!(
		ObjectiveTransform::from_text("regression", 1).unwrap(),
		Some(ObjectiveTransform::Identity)
	);
	assert_eq!(ObjectiveTransform::from_text("none", 1).unwrap(), None);
	assert!(matches!(
		ObjectiveTransform::from_text("multiclass num_class:4", 3),
		Err(ParseError::ObjectiveClassMismatch {
			declared: 4,
			n_classes: 3
		})
	));
	assert!(matches!(
		ObjectiveTransform::from_text("lambdarank", 1),
		Err(ParseError::UnknownObjective(_))
	));
}

#[test]
fn test_softmax() {
	let mut scores = [1.0, 2.0, 3.0];
	ObjectiveTransform::Softmax.transform(&mut scores);
	let sum: f64 = scores.iter().sum();
	assert!((sum - 1.0).abs() < 1e-12);
	assert!(scores[0] < scores[1] && scores[1] < scores[2]);
	// Subtracting the max keeps huge logits finite.
	let mut scores = [1000.0, 1000.0];
	ObjectiveTransform::Softmax.transform(&mut scores);
	assert_eq!(scores, [0.5, 0.5]);
}

#[test]
fn test_sigmoid() {
	let mut scores = [0.0];
	ObjectiveTransform::Sigmoid { sigmoid: 1.0 }.transform(&mut scores);
	assert_eq!(scores, [0.5]);
}
