use crate::PredictError;
use std::str::FromStr;

/// Options that control how a batch of predictions is made.
#[derive(Clone, Debug, PartialEq)]
pub struct PredictOptions {
	/// The number of threads to score rows on. Zero means one thread per core.
	pub num_threads: usize,
	/// If true, stop evaluating trees for a row once its prediction is decided.
	pub early_stopping: bool,
	/// Check whether to stop after every this many iterations. Must be positive.
	pub early_stopping_frequency: i64,
	/// Stop when the two highest raw scores are further apart than this. Must not be negative.
	pub early_stopping_margin: f64,
}

impl Default for PredictOptions {
	fn default() -> PredictOptions {
		PredictOptions {
			num_threads: 0,
			early_stopping: false,
			early_stopping_frequency: 10,
			early_stopping_margin: 10.0,
		}
	}
}

impl PredictOptions {
	/**
	Parse options from a string of `key=value` pairs separated by whitespace or commas, such as `num_threads=4 pred_early_stop=true`. Keys that are not recognized are ignored with a warning.
	*/
	pub fn from_parameters(parameters: &str) -> Result<PredictOptions, PredictError> {
		let mut options = PredictOptions::default();
		let pairs = parameters
			.split(|c: char| c.is_whitespace() || c == ',')
			.filter(|token| !token.is_empty());
		for pair in pairs {
			let (key, value) = match pair.split_once('=') {
				Some((key, value)) => (key.trim(), value.trim()),
				None => {
					tracing::warn!(parameter = pair, "ignoring prediction parameter without a value");
					continue;
				}
			};
			match key {
				"num_threads" | "num_thread" | "nthread" | "nthreads" | "n_jobs" => {
					// Negative values mean the default, as in other GBDT libraries.
					let num_threads: i64 = parse_value("num_threads", value)?;
					options.num_threads = if num_threads > 0 { num_threads as usize } else { 0 };
				}
				"pred_early_stop" => options.early_stopping = parse_bool("pred_early_stop", value)?,
				"pred_early_stop_freq" => {
					options.early_stopping_frequency = parse_value("pred_early_stop_freq", value)?
				}
				"pred_early_stop_margin" => {
					options.early_stopping_margin = parse_value("pred_early_stop_margin", value)?
				}
				_ => {
					tracing::warn!(key, "ignoring unknown prediction parameter");
				}
			}
		}
		Ok(options)
	}
}

impl FromStr for PredictOptions {
	type Err = PredictError;
	fn from_str(parameters: &str) -> Result<PredictOptions, PredictError> {
		PredictOptions::from_parameters(parameters)
	}
}

fn parse_value<T: FromStr>(key: &'static str, value: &str) -> Result<T, PredictError> {
	value.parse().map_err(|_| PredictError::InvalidOption {
		key,
		value: value.to_owned(),
	})
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, PredictError> {
	match value.to_ascii_lowercase().as_str() {
		"true" | "1" | "+" => Ok(true),
		"false" | "0" | "-" => Ok(false),
		_ => Err(PredictError::InvalidOption {
			key,
			value: value.to_owned(),
		}),
	}
}

#[test]
fn test_defaults() {
	let options = PredictOptions::from_parameters("").unwrap();
	assert_eq!(options, PredictOptions::default());
	assert_eq!(options.early_stopping_frequency, 10);
	assert!(!options.early_stopping);
}

#[test]
fn test_parse_parameters() {
	let options: PredictOptions =
		"nthreads=4, pred_early_stop=true\tpred_early_stop_freq=5 pred_early_stop_margin=1.5 some_other_key=1"
			.parse()
			.unwrap();
	assert_eq!(
		options,
		PredictOptions {
			num_threads: 4,
			early_stopping: true,
			early_stopping_frequency: 5,
			early_stopping_margin: 1.5,
		}
	);
	let options = PredictOptions::from_parameters("num_threads=-1 pred_early_stop=-").unwrap();
	assert_eq!(options.num_threads, 0);
	assert!(!options.early_stopping);
}

#[test]
fn test_invalid_parameters() {
	insta::assert_snapshot!(
		PredictOptions::from_parameters("pred_early_stop=maybe").unwrap_err().to_string(),
		@"invalid value for prediction option pred_early_stop: maybe"
	);
	assert!(PredictOptions::from_parameters("pred_early_stop_freq=often").is_err());
	// Range checks happen when the predictor is created, so these parse.
	let options = PredictOptions::from_parameters("pred_early_stop_freq=0 pred_early_stop_margin=-1").unwrap();
	assert_eq!(options.early_stopping_frequency, 0);
	assert_eq!(options.early_stopping_margin, -1.0);
}
