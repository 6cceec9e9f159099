use crate::{EarlyStopPolicy, EnsembleModel, Features, PredictOptions, ZERO_THRESHOLD};
use fnv::FnvHashMap;
use grove_util::thread_pool::{thread_pool_with_size, ThreadPool, GLOBAL_THREAD_POOL};
use ndarray::prelude::*;
use std::panic::{catch_unwind, AssertUnwindSafe};
use thiserror::Error;

/// Rows of models with more features than this may be scored through a sparse map.
const SPARSE_FEATURE_THRESHOLD: usize = 100_000;

/// A row is scored through a sparse map if it has fewer nonzero features than this fraction of `max_feature_index`.
const SPARSE_ROW_FRACTION: f64 = 0.01;

/// The kind of output to produce for each row.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PredictKind {
	/// The raw scores with the objective's transform applied.
	Normal,
	/// The raw scores.
	RawScore,
	/// The index of the leaf each tree sends the row to. Not supported.
	LeafIndex,
	/// The contribution of each feature to the raw score. Not supported.
	Contrib,
}

#[derive(Debug, Error)]
pub enum PredictError {
	#[error("prediction kind {0:?} is not supported")]
	UnsupportedMode(PredictKind),
	#[error("invalid value for prediction option {key}: {value}")]
	InvalidOption { key: &'static str, value: String },
	#[error("pred_early_stop_freq must be positive, got {0}")]
	InvalidEarlyStopFrequency(i64),
	#[error("pred_early_stop_margin must not be negative, got {0}")]
	InvalidEarlyStopMargin(f64),
	#[error("margin early stopping needs at least two outputs per row, but the model has {0}")]
	EarlyStopNeedsMultipleOutputs(usize),
	#[error("the output has {actual} entries, expected {expected}")]
	ShapeMismatch { expected: usize, actual: usize },
	#[error("failed to predict row {row_index}: {source}")]
	Row { row_index: usize, source: RowError },
}

/// An error raised while scoring a single row.
#[derive(Debug, Error, PartialEq)]
pub enum RowError {
	#[error("margin early stopping needs at least two scores per row, got {0}")]
	TooFewScores(usize),
	#[error("panicked: {0}")]
	Panicked(String),
}

/**
A `Predictor` scores rows with an `EnsembleModel`. It is created once for a kind of output, an iteration cap, and a set of options, all of which are validated up front, and then used for any number of batches.
*/
#[derive(Debug)]
pub struct Predictor<'m> {
	model: &'m EnsembleModel,
	kind: PredictKind,
	n_iterations: usize,
	early_stop_policy: EarlyStopPolicy,
	num_threads: usize,
}

/**
A `PredictContext` holds the scratch space for scoring rows on one thread. Create one per thread and reuse it for every row that thread scores, so rows do not allocate.
*/
#[derive(Debug)]
pub struct PredictContext {
	/// One entry per feature. Every entry is zero between rows.
	dense: Vec<f64>,
	sparse: FnvHashMap<usize, f64>,
	pairs: Vec<(usize, f64)>,
}

impl PredictContext {
	pub fn new(n_features: usize) -> PredictContext {
		PredictContext {
			dense: vec![0.0; n_features],
			sparse: FnvHashMap::default(),
			pairs: Vec::new(),
		}
	}

	fn reset(&mut self) {
		self.dense.iter_mut().for_each(|value| *value = 0.0);
		self.sparse.clear();
		self.pairs.clear();
	}
}

impl<'m> Predictor<'m> {
	/**
	Create a predictor. An `iteration_cap` of zero uses every iteration in the model. Otherwise at most `iteration_cap` iterations are used.

	Early stopping is only enabled if `options` asks for it and the model's objective allows it. The early stopping options are validated either way. Margin early stopping compares the two largest scores of a row, so it is an error to enable it for a model with a single output per row.
	*/
	pub fn new(
		model: &'m EnsembleModel,
		kind: PredictKind,
		iteration_cap: usize,
		options: &PredictOptions,
	) -> Result<Predictor<'m>, PredictError> {
		match kind {
			PredictKind::Normal | PredictKind::RawScore => {}
			PredictKind::LeafIndex | PredictKind::Contrib => {
				return Err(PredictError::UnsupportedMode(kind))
			}
		}
		if options.early_stopping_frequency <= 0 {
			return Err(PredictError::InvalidEarlyStopFrequency(
				options.early_stopping_frequency,
			));
		}
		// This also rejects NaN.
		if !(options.early_stopping_margin >= 0.0) {
			return Err(PredictError::InvalidEarlyStopMargin(
				options.early_stopping_margin,
			));
		}
		let n_iterations_available = model.n_iterations();
		let n_iterations = if iteration_cap > 0 {
			iteration_cap.min(n_iterations_available)
		} else {
			n_iterations_available
		};
		let early_stop_policy = if options.early_stopping && model.allows_early_stop() {
			let n_outputs = model.n_trees_per_iteration();
			if n_outputs < 2 {
				return Err(PredictError::EarlyStopNeedsMultipleOutputs(n_outputs));
			}
			EarlyStopPolicy::Margin {
				round_period: options.early_stopping_frequency as usize,
				margin_threshold: options.early_stopping_margin,
			}
		} else {
			if options.early_stopping {
				tracing::debug!("the model's objective does not allow early stopping, so it is disabled");
			}
			EarlyStopPolicy::None
		};
		tracing::debug!(
			?kind,
			n_iterations,
			n_iterations_available,
			?early_stop_policy,
			"created predictor"
		);
		Ok(Predictor {
			model,
			kind,
			n_iterations,
			early_stop_policy,
			num_threads: options.num_threads,
		})
	}

	pub fn model(&self) -> &'m EnsembleModel {
		self.model
	}

	/// The number of values written for each row.
	pub fn n_predictions_per_row(&self) -> usize {
		self.model.n_trees_per_iteration()
	}

	/// The number of iterations evaluated for a row that does not stop early.
	pub fn n_iterations(&self) -> usize {
		self.n_iterations
	}

	pub fn early_stop_policy(&self) -> EarlyStopPolicy {
		self.early_stop_policy
	}

	/**
	Score a single row. `output` must have `n_predictions_per_row()` entries.

	The scores start at the objective's bias. Each iteration adds the output of its trees, and every `round_period` iterations the early stopping policy may end the loop. The objective's transform is applied last, unless raw scores were requested.
	*/
	pub fn predict_features<F>(&self, features: &F, output: &mut [f64]) -> Result<(), RowError>
	where
		F: Features + ?Sized,
	{
		let model = self.model;
		let n_trees_per_iteration = model.n_trees_per_iteration();
		match model.objective() {
			Some(objective) => objective.bias_init(output),
			None => output.iter_mut().for_each(|score| *score = 0.0),
		}
		let round_period = self.early_stop_policy.round_period();
		let mut n_iterations_evaluated = 0;
		for trees in model
			.trees()
			.chunks_exact(n_trees_per_iteration)
			.take(self.n_iterations)
		{
			for (score, tree) in output.iter_mut().zip(trees.iter()) {
				*score += tree.predict(features);
			}
			n_iterations_evaluated += 1;
			if n_iterations_evaluated % round_period == 0
				&& self.early_stop_policy.should_stop(output)?
			{
				break;
			}
		}
		if model.average_output() && n_iterations_evaluated > 0 {
			let n = n_iterations_evaluated as f64;
			output.iter_mut().for_each(|score| *score /= n);
		}
		if self.kind == PredictKind::Normal {
			if let Some(objective) = model.objective() {
				objective.transform(output);
			}
		}
		Ok(())
	}

	/**
	Score a row given as `(feature_index, value)` pairs. Features without a pair are zero, and pairs for features the model does not have are ignored.

	Rows with few nonzero features in very wide models are scored through a map of the pairs. All other rows are written into the context's dense buffer, which is cleared again afterward. Both ways give the same scores.
	*/
	pub fn predict_sparse_row(
		&self,
		pairs: &[(usize, f64)],
		context: &mut PredictContext,
		output: &mut [f64],
	) -> Result<(), RowError> {
		self.predict_pairs(pairs, &mut context.dense, &mut context.sparse, output)
	}

	fn predict_pairs(
		&self,
		pairs: &[(usize, f64)],
		dense: &mut Vec<f64>,
		sparse: &mut FnvHashMap<usize, f64>,
		output: &mut [f64],
	) -> Result<(), RowError> {
		let max_feature_index = self.model.max_feature_index();
		if max_feature_index > SPARSE_FEATURE_THRESHOLD
			&& (pairs.len() as f64) < max_feature_index as f64 * SPARSE_ROW_FRACTION
		{
			sparse.clear();
			sparse.extend(
				pairs
					.iter()
					.filter(|(feature_index, _)| *feature_index <= max_feature_index)
					.copied(),
			);
			return self.predict_features(&*sparse, output);
		}
		let n_features = self.model.n_features();
		if dense.len() != n_features {
			*dense = vec![0.0; n_features];
		}
		for (feature_index, value) in pairs.iter() {
			if let Some(entry) = dense.get_mut(*feature_index) {
				*entry = *value;
			}
		}
		let result = self.predict_features(dense.as_slice(), output);
		if pairs.len() < dense.len() / 2 {
			for (feature_index, _) in pairs.iter() {
				if let Some(entry) = dense.get_mut(*feature_index) {
					*entry = 0.0;
				}
			}
		} else {
			dense.iter_mut().for_each(|value| *value = 0.0);
		}
		result
	}

	/**
	Score every row of `features`, writing the predictions for row `i` to `output[i * n_predictions_per_row()..(i + 1) * n_predictions_per_row()]`.

	Rows are split into contiguous chunks, one per thread, and each chunk is scored with its own `PredictContext`. If scoring a row fails, the other rows are still scored, and the error for the lowest failing row index is returned once all threads have finished.
	*/
	pub fn predict<T>(&self, features: ArrayView2<T>, output: &mut [f64]) -> Result<(), PredictError>
	where
		T: Copy + Into<f64> + Sync,
	{
		let n_rows = features.nrows();
		let n_outputs = self.n_predictions_per_row();
		if output.len() != n_rows * n_outputs {
			return Err(PredictError::ShapeMismatch {
				expected: n_rows * n_outputs,
				actual: output.len(),
			});
		}
		if n_rows == 0 {
			return Ok(());
		}
		let sized_thread_pool;
		let thread_pool: &ThreadPool = if self.num_threads > 0 {
			sized_thread_pool = thread_pool_with_size(self.num_threads);
			&sized_thread_pool
		} else {
			&GLOBAL_THREAD_POOL
		};
		let n_tasks = thread_pool.size().min(n_rows);
		let rows_per_task = (n_rows + n_tasks - 1) / n_tasks;
		let tasks = output
			.chunks_mut(rows_per_task * n_outputs)
			.enumerate()
			.map(|(task_index, output)| {
				let start = task_index * rows_per_task;
				let end = start + output.len() / n_outputs;
				let features = features.slice(s![start..end, ..]);
				move || self.predict_chunk(start, features, output)
			})
			.collect::<Vec<_>>();
		tracing::debug!(n_rows, n_tasks = tasks.len(), "predicting");
		for (task_index, result) in thread_pool.execute(tasks).into_iter().enumerate() {
			match result {
				Ok(result) => result?,
				// Rows catch their own panics, so this only happens if a chunk panics outside of a row. The chunk's first row is reported.
				Err(message) => {
					return Err(PredictError::Row {
						row_index: task_index * rows_per_task,
						source: RowError::Panicked(message),
					})
				}
			}
		}
		Ok(())
	}

	fn predict_chunk<T>(
		&self,
		first_row_index: usize,
		features: ArrayView2<T>,
		output: &mut [f64],
	) -> Result<(), PredictError>
	where
		T: Copy + Into<f64>,
	{
		let n_features = self.model.n_features();
		let n_outputs = self.n_predictions_per_row();
		let mut context = PredictContext::new(n_features);
		let mut first_error = None;
		for (row_offset, (row, output)) in features
			.axis_iter(Axis(0))
			.zip(output.chunks_exact_mut(n_outputs))
			.enumerate()
		{
			let result = catch_unwind(AssertUnwindSafe(|| {
				let PredictContext {
					dense,
					sparse,
					pairs,
				} = &mut context;
				nonzero_pairs(row, n_features, pairs);
				self.predict_pairs(pairs, dense, sparse, output)
			}));
			let error = match result {
				Ok(Ok(())) => continue,
				Ok(Err(error)) => error,
				Err(payload) => {
					context.reset();
					RowError::Panicked(grove_util::thread_pool::panic_message(payload))
				}
			};
			if first_error.is_none() {
				first_error = Some(PredictError::Row {
					row_index: first_row_index + row_offset,
					source: error,
				});
			}
		}
		match first_error {
			Some(error) => Err(error),
			None => Ok(()),
		}
	}
}

/// Collect the features of a dense row that are nonzero or NaN. Columns past the model's last feature are dropped.
fn nonzero_pairs<T>(row: ArrayView1<T>, n_features: usize, pairs: &mut Vec<(usize, f64)>)
where
	T: Copy + Into<f64>,
{
	pairs.clear();
	for (feature_index, value) in row.iter().take(n_features).enumerate() {
		let value: f64 = (*value).into();
		if value.abs() > ZERO_THRESHOLD || value.is_nan() {
			pairs.push((feature_index, value));
		}
	}
}

#[cfg(test)]
use crate::test_models;

#[cfg(test)]
fn load(text: &str) -> EnsembleModel {
	EnsembleModel::from_bytes(text.as_bytes()).unwrap()
}

#[test]
fn test_three_class_softmax() {
	let model = load(&test_models::three_class(true));
	let predictor = Predictor::new(&model, PredictKind::Normal, 0, &PredictOptions::default()).unwrap();
	assert_eq!(predictor.n_predictions_per_row(), 3);
	let features = Array2::<f64>::zeros((1, 180));
	let mut probabilities = vec![0.0; 3];
	predictor.predict(features.view(), &mut probabilities).unwrap();
	let sum: f64 = probabilities.iter().sum();
	assert!((sum - 1.0).abs() < 1e-12);
	assert!(probabilities.iter().all(|p| (0.0..=1.0).contains(p)));
	// Every tree sends an all zero row to its first leaf.
	let raw = Predictor::new(&model, PredictKind::RawScore, 0, &PredictOptions::default()).unwrap();
	let mut scores = vec![0.0; 3];
	raw.predict(features.view(), &mut scores).unwrap();
	assert_eq!(scores, vec![0.1, 0.2, 0.1 * 3.0]);
	assert!(probabilities[0] < probabilities[1] && probabilities[1] < probabilities[2]);
}

#[test]
fn test_f32_and_column_major_input() {
	let model = load(&test_models::three_class(false));
	let predictor = Predictor::new(&model, PredictKind::RawScore, 0, &PredictOptions::default()).unwrap();
	let mut row_major = Array2::<f32>::zeros((4, 180));
	row_major[[1, 0]] = 1.0;
	row_major[[2, 61]] = 2.0;
	row_major[[2, 60]] = 1.0;
	row_major[[3, 120]] = f32::NAN;
	let mut column_major = Array2::<f32>::zeros((4, 180).f());
	column_major.assign(&row_major);
	let mut a = vec![0.0; 12];
	let mut b = vec![0.0; 12];
	predictor.predict(row_major.view(), &mut a).unwrap();
	predictor.predict(column_major.view(), &mut b).unwrap();
	assert_eq!(a, b);
	assert_eq!(&a[3..6], &[-0.2, 0.2, 0.1 * 3.0]);
	assert_eq!(&a[6..9], &[0.1, 0.3 * 2.0, 0.1 * 3.0]);
	// Without a missing type, NaN is treated as zero.
	assert_eq!(&a[9..12], &a[0..3]);
}

#[test]
fn test_iteration_cap() {
	let model = load(&test_models::decisive(5, Some("multiclass num_class:2")).write(false));
	let options = PredictOptions::default();
	let features = Array2::<f64>::zeros((3, 2));
	let predict = |iteration_cap| {
		let predictor = Predictor::new(&model, PredictKind::RawScore, iteration_cap, &options).unwrap();
		let mut output = vec![0.0; 6];
		predictor.predict(features.view(), &mut output).unwrap();
		(predictor.n_iterations(), output)
	};
	let all = predict(0);
	assert_eq!(all.0, 5);
	assert_eq!(&all.1[..2], &[5.0, -5.0]);
	assert_eq!(predict(5), all);
	assert_eq!(predict(100), all);
	let (n_iterations, output) = predict(2);
	assert_eq!(n_iterations, 2);
	assert_eq!(&output[..2], &[2.0, -2.0]);
}

#[test]
fn test_zero_iterations_yield_the_bias() {
	let model = load(&test_models::zero_trees(5));
	let predictor = Predictor::new(&model, PredictKind::RawScore, 0, &PredictOptions::default()).unwrap();
	assert_eq!(predictor.n_iterations(), 0);
	let mut features = Array2::<f64>::zeros((2, 5));
	features.row_mut(1).fill(3.0);
	let mut output = vec![1.0; 6];
	predictor.predict(features.view(), &mut output).unwrap();
	assert_eq!(output, vec![0.0; 6]);
	let predictor = Predictor::new(&model, PredictKind::Normal, 0, &PredictOptions::default()).unwrap();
	predictor.predict(features.view(), &mut output).unwrap();
	assert!(output.iter().all(|p| (p - 1.0 / 3.0).abs() < 1e-12));
}

#[test]
fn test_average_output() {
	let mut model_text = test_models::decisive(4, Some("multiclass num_class:2"));
	model_text.average_output = true;
	let model = load(&model_text.write(false));
	assert!(model.average_output());
	let features = array![[0.0, 0.0]];
	let mut output = vec![0.0; 2];
	let predictor = Predictor::new(&model, PredictKind::RawScore, 0, &PredictOptions::default()).unwrap();
	predictor.predict(features.view(), &mut output).unwrap();
	assert_eq!(output, vec![1.0, -1.0]);
	// With early stopping after the first iteration, the mean is over one iteration.
	let options = PredictOptions {
		early_stopping: true,
		early_stopping_frequency: 1,
		early_stopping_margin: 1.0,
		..Default::default()
	};
	let predictor = Predictor::new(&model, PredictKind::RawScore, 0, &options).unwrap();
	predictor.predict(features.view(), &mut output).unwrap();
	assert_eq!(output, vec![1.0, -1.0]);
}

#[test]
fn test_early_stopping_skips_decided_rows() {
	let model = load(&test_models::decisive(20, Some("multiclass num_class:2")).write(true));
	let features = array![[0.0, 0.0], [1.0, 0.0]];
	let options = PredictOptions {
		early_stopping: true,
		early_stopping_frequency: 1,
		early_stopping_margin: 19.5,
		..Default::default()
	};
	let predictor = Predictor::new(&model, PredictKind::RawScore, 0, &options).unwrap();
	assert_eq!(
		predictor.early_stop_policy(),
		EarlyStopPolicy::Margin {
			round_period: 1,
			margin_threshold: 19.5
		}
	);
	let mut output = vec![0.0; 4];
	predictor.predict(features.view(), &mut output).unwrap();
	// The margin is 2 per iteration, so the first check after it exceeds 19.5 is at iteration 10.
	assert_eq!(output, vec![10.0, -10.0, -10.0, 10.0]);
	let options = PredictOptions {
		early_stopping_frequency: 4,
		..options
	};
	let predictor = Predictor::new(&model, PredictKind::RawScore, 0, &options).unwrap();
	predictor.predict(features.view(), &mut output).unwrap();
	assert_eq!(output, vec![12.0, -12.0, -12.0, 12.0]);
}

#[test]
fn test_disabled_early_stopping_matches_infinite_margin() {
	let model = load(&test_models::decisive(20, Some("multiclass num_class:2")).write(false));
	let features = array![[0.0, 0.0], [1.0, 0.0], [0.3, 7.0]];
	let disabled = Predictor::new(&model, PredictKind::Normal, 0, &PredictOptions::default()).unwrap();
	let infinite = Predictor::new(
		&model,
		PredictKind::Normal,
		0,
		&PredictOptions {
			early_stopping: true,
			early_stopping_frequency: 1,
			early_stopping_margin: f64::INFINITY,
			..Default::default()
		},
	)
	.unwrap();
	let mut a = vec![0.0; 6];
	let mut b = vec![0.0; 6];
	disabled.predict(features.view(), &mut a).unwrap();
	infinite.predict(features.view(), &mut b).unwrap();
	assert_eq!(
		a.iter().map(|p| p.to_bits()).collect::<Vec<_>>(),
		b.iter().map(|p| p.to_bits()).collect::<Vec<_>>()
	);
}

#[test]
fn test_early_stopping_needs_an_objective_that_allows_it() {
	let model = load(&test_models::narrow());
	let options = PredictOptions {
		early_stopping: true,
		..Default::default()
	};
	let predictor = Predictor::new(&model, PredictKind::Normal, 0, &options).unwrap();
	assert_eq!(predictor.early_stop_policy(), EarlyStopPolicy::None);
}

#[test]
fn test_invalid_predictors() {
	let model = load(&test_models::three_class(false));
	let options = PredictOptions::default();
	for &kind in &[PredictKind::LeafIndex, PredictKind::Contrib] {
		assert!(matches!(
			Predictor::new(&model, kind, 0, &options),
			Err(PredictError::UnsupportedMode(k)) if k == kind
		));
	}
	let zero_frequency = PredictOptions {
		early_stopping_frequency: 0,
		..Default::default()
	};
	insta::assert_snapshot!(
		Predictor::new(&model, PredictKind::Normal, 0, &zero_frequency).unwrap_err().to_string(),
		@"pred_early_stop_freq must be positive, got 0"
	);
	let negative_margin = PredictOptions {
		early_stopping_margin: -0.5,
		..Default::default()
	};
	assert!(matches!(
		Predictor::new(&model, PredictKind::Normal, 0, &negative_margin),
		Err(PredictError::InvalidEarlyStopMargin(_))
	));
	let predictor = Predictor::new(&model, PredictKind::Normal, 0, &options).unwrap();
	let mut output = vec![0.0; 5];
	assert!(matches!(
		predictor.predict(Array2::<f64>::zeros((2, 180)).view(), &mut output),
		Err(PredictError::ShapeMismatch {
			expected: 6,
			actual: 5
		})
	));
}

#[test]
fn test_sparse_and_dense_rows_agree() {
	let model = load(&test_models::wide(true));
	let predictor = Predictor::new(&model, PredictKind::RawScore, 0, &PredictOptions::default()).unwrap();
	let mut features = Array2::<f64>::zeros((2, 200_000));
	// 50 nonzero features, well under 1% of the features, so this row goes through the sparse map.
	for i in 0..50 {
		features[[0, i * 4_000 + 3]] = 1.0 + i as f64;
	}
	features[[0, 7]] = 0.7;
	features[[0, 199_999]] = -1.0;
	features[[0, 99_999]] = f64::NAN;
	// This row has 60% nonzero features, so it goes through the dense buffer.
	for i in 0..120_000 {
		features[[1, i]] = 2.0;
	}
	let mut batch = vec![0.0; 2];
	predictor.predict(features.view(), &mut batch).unwrap();
	for (row_index, row) in features.axis_iter(Axis(0)).enumerate() {
		let dense = row.to_vec();
		let mut expected = vec![0.0];
		predictor.predict_features(dense.as_slice(), &mut expected).unwrap();
		assert_eq!(batch[row_index], expected[0]);
		let sparse: FnvHashMap<usize, f64> = dense
			.iter()
			.enumerate()
			.filter(|(_, v)| **v != 0.0)
			.map(|(i, v)| (i, *v))
			.collect();
		predictor.predict_features(&sparse, &mut expected).unwrap();
		assert_eq!(batch[row_index], expected[0]);
	}
	// Tree 0 sends x7 = 0.7 right and x150_000 = 0 left, tree 1 sends x199_999 = -1 left, tree 2 sends x123_456 = 0 left, and tree 3 treats NaN as zero and sends it right.
	assert_eq!(batch[0], 2.0 + 8.0 + 32.0 + 512.0);
}

#[test]
fn test_context_is_clean_between_rows() {
	let model = load(&test_models::narrow());
	let predictor = Predictor::new(&model, PredictKind::RawScore, 0, &PredictOptions::default()).unwrap();
	let mut context = PredictContext::new(model.n_features());
	let mut first = vec![0.0];
	let mut second = vec![0.0];
	predictor.predict_sparse_row(&[(0, 1.0), (9, 2.0), (5, 1.0)], &mut context, &mut first).unwrap();
	assert_eq!(first, vec![4.0 + 16.0]);
	predictor.predict_sparse_row(&[], &mut context, &mut second).unwrap();
	assert_eq!(second, vec![1.0 + 8.0]);
	// Features the model does not have are ignored.
	predictor.predict_sparse_row(&[(10, 5.0), (1_000, 5.0)], &mut context, &mut second).unwrap();
	assert_eq!(second, vec![1.0 + 8.0]);
	// A row with every feature set uses the bulk clear.
	let all: Vec<_> = (0..10).map(|i| (i, 3.0)).collect();
	predictor.predict_sparse_row(&all, &mut context, &mut first).unwrap();
	assert_eq!(first, vec![4.0 + 16.0]);
	predictor.predict_sparse_row(&[], &mut context, &mut second).unwrap();
	assert_eq!(second, vec![1.0 + 8.0]);
}

#[test]
fn test_row_order_does_not_change_placement() {
	let model = load(&test_models::three_class(false));
	let n_rows = 97;
	let features = Array2::from_shape_fn((n_rows, 180), |(i, j)| ((i * 7 + j * 13) % 5) as f64 * 0.5);
	let options = PredictOptions {
		num_threads: 4,
		..Default::default()
	};
	let predictor = Predictor::new(&model, PredictKind::Normal, 0, &options).unwrap();
	let mut output = vec![0.0; n_rows * 3];
	predictor.predict(features.view(), &mut output).unwrap();
	// Reverse the rows and score them on a different number of threads.
	let reversed = features.slice(s![..;-1, ..]);
	let options = PredictOptions {
		num_threads: 3,
		..Default::default()
	};
	let predictor = Predictor::new(&model, PredictKind::Normal, 0, &options).unwrap();
	let mut reversed_output = vec![0.0; n_rows * 3];
	predictor.predict(reversed, &mut reversed_output).unwrap();
	for row_index in 0..n_rows {
		let reversed_index = n_rows - 1 - row_index;
		assert_eq!(
			&output[row_index * 3..(row_index + 1) * 3],
			&reversed_output[reversed_index * 3..(reversed_index + 1) * 3]
		);
	}
}

#[test]
fn test_margin_early_stopping_needs_multiple_outputs() {
	let model = load(&test_models::categorical());
	assert!(model.allows_early_stop());
	let options = PredictOptions {
		early_stopping: true,
		early_stopping_frequency: 1,
		..Default::default()
	};
	insta::assert_snapshot!(
		Predictor::new(&model, PredictKind::Normal, 0, &options).unwrap_err().to_string(),
		@"margin early stopping needs at least two outputs per row, but the model has 1"
	);
	// The frequency does not matter, even if it is larger than the number of iterations.
	let options = PredictOptions {
		early_stopping_frequency: 100,
		..options
	};
	assert!(matches!(
		Predictor::new(&model, PredictKind::Normal, 0, &options),
		Err(PredictError::EarlyStopNeedsMultipleOutputs(1))
	));
	let options = PredictOptions {
		early_stopping: false,
		..options
	};
	assert!(Predictor::new(&model, PredictKind::Normal, 0, &options).is_ok());
}

#[test]
fn test_row_errors_are_reported_after_every_row_is_scored() {
	// `new` rejects this policy for a single output model, so build the predictor directly to make every row fail at its first check.
	let model = load(&test_models::categorical());
	let predictor = Predictor {
		model: &model,
		kind: PredictKind::Normal,
		n_iterations: model.n_iterations(),
		early_stop_policy: EarlyStopPolicy::Margin {
			round_period: 2,
			margin_threshold: 0.0,
		},
		num_threads: 3,
	};
	let features = Array2::<f64>::zeros((10, 3));
	let mut output = vec![f64::NAN; 10];
	let error = predictor.predict(features.view(), &mut output).unwrap_err();
	match error {
		PredictError::Row { row_index, source } => {
			assert_eq!(row_index, 0);
			assert_eq!(source, RowError::TooFewScores(1));
		}
		error => panic!("unexpected error {}", error),
	}
	// Every row was scored up to its failing check, including the rows of the other threads.
	assert!(output.iter().all(|value| value.is_finite()));
	// Stopping is only checked every two iterations, and this model has two, so capping it at one iteration avoids the check.
	let predictor = Predictor {
		n_iterations: 1,
		..predictor
	};
	predictor.predict(features.view(), &mut output).unwrap();
}

#[test]
fn test_categorical_and_missing_values() {
	let model = load(&test_models::categorical());
	let predictor = Predictor::new(&model, PredictKind::RawScore, 0, &PredictOptions::default()).unwrap();
	let features = array![
		// Category 1 goes left in tree 0. Tree 1 sends NaN left.
		[1.0, 0.0, f64::NAN],
		// Category 32 is in the second word of the bitset.
		[32.0, 0.0, 200.0],
		// Category 3 goes right, then x1 = NaN is missing and goes right by default.
		[3.0, f64::NAN, 0.0],
		// Negative categories go right.
		[-1.0, 1.0, 0.0],
	];
	let mut output = vec![0.0; 4];
	predictor.predict(features.view(), &mut output).unwrap();
	assert_eq!(output, vec![1.5, 0.5, 3.5, 2.5]);
}
