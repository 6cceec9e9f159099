use grove_tree::{
	EnsembleModel, LeafError, ParseError, PredictError, PredictKind, PredictOptions, Predictor,
};
use ndarray::prelude::*;
use std::sync::RwLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
	#[error(transparent)]
	Parse(#[from] ParseError),
	#[error(transparent)]
	Predict(#[from] PredictError),
	#[error(transparent)]
	Leaf(#[from] LeafError),
	#[error(transparent)]
	Shape(#[from] ndarray::ShapeError),
	#[error("there is no booster with handle {0}")]
	InvalidHandle(u64),
	#[error("{0} must not be null")]
	NullPointer(&'static str),
	#[error("{0} is not valid utf-8")]
	NotUtf8(&'static str),
	#[error("unknown data type {0}")]
	UnknownDataType(i32),
	#[error("unknown prediction type {0}")]
	UnknownPredictType(i32),
	#[error("{name} must not be negative, got {value}")]
	Negative { name: &'static str, value: i64 },
	#[error("a prediction with this booster panicked while holding its lock")]
	Poisoned,
}

/**
A `Booster` is a loaded model behind a lock. Predictions share the lock, and leaf updates take it exclusively, so a leaf is never changed while a batch is being scored.
*/
#[derive(Debug)]
pub struct Booster {
	model: RwLock<EnsembleModel>,
}

/// A dense matrix of feature values in caller memory.
pub struct DenseMatrix<'a, T> {
	pub data: &'a [T],
	pub n_rows: usize,
	pub n_cols: usize,
	pub row_major: bool,
}

impl Booster {
	pub fn from_bytes(bytes: &[u8]) -> Result<Booster, Error> {
		let model = EnsembleModel::from_bytes(bytes)?;
		tracing::debug!(
			n_trees = model.trees().len(),
			n_iterations = model.n_iterations(),
			"loaded booster"
		);
		Ok(Booster {
			model: RwLock::new(model),
		})
	}

	fn read(&self) -> Result<std::sync::RwLockReadGuard<EnsembleModel>, Error> {
		self.model.read().map_err(|_| Error::Poisoned)
	}

	pub fn n_classes(&self) -> Result<usize, Error> {
		Ok(self.read()?.n_classes())
	}

	pub fn n_features(&self) -> Result<usize, Error> {
		Ok(self.read()?.n_features())
	}

	pub fn n_iterations(&self) -> Result<usize, Error> {
		Ok(self.read()?.n_iterations())
	}

	pub fn leaf_value(&self, tree_index: usize, leaf_index: usize) -> Result<f64, Error> {
		Ok(self.read()?.leaf_value(tree_index, leaf_index)?)
	}

	pub fn set_leaf_value(&self, tree_index: usize, leaf_index: usize, value: f64) -> Result<(), Error> {
		let mut model = self.model.write().map_err(|_| Error::Poisoned)?;
		model.set_leaf_value(tree_index, leaf_index, value)?;
		Ok(())
	}

	pub fn to_model_string(&self) -> Result<String, Error> {
		Ok(self.read()?.to_model_string())
	}

	/// The number of values a prediction writes for `n_rows` rows.
	pub fn n_predictions(&self, n_rows: usize, kind: PredictKind) -> Result<usize, Error> {
		let model = self.read()?;
		match kind {
			PredictKind::Normal | PredictKind::RawScore => Ok(n_rows * model.n_trees_per_iteration()),
			PredictKind::LeafIndex | PredictKind::Contrib => {
				Err(PredictError::UnsupportedMode(kind).into())
			}
		}
	}

	/**
	Score every row of `matrix` and write the predictions to `output`, returning the number of values written. `parameters` is a string of `key=value` prediction options. An `iteration_cap` of zero or less uses every iteration.
	*/
	pub fn predict<T>(
		&self,
		matrix: DenseMatrix<T>,
		kind: PredictKind,
		iteration_cap: i64,
		parameters: &str,
		output: &mut [f64],
	) -> Result<usize, Error>
	where
		T: Copy + Into<f64> + Sync,
	{
		let options = PredictOptions::from_parameters(parameters)?;
		let model = self.read()?;
		let iteration_cap = if iteration_cap > 0 { iteration_cap as usize } else { 0 };
		let predictor = Predictor::new(&model, kind, iteration_cap, &options)?;
		let shape = (matrix.n_rows, matrix.n_cols);
		let features = if matrix.row_major {
			ArrayView2::from_shape(shape, matrix.data)?
		} else {
			ArrayView2::from_shape(shape.f(), matrix.data)?
		};
		let n_predictions = matrix.n_rows * predictor.n_predictions_per_row();
		let actual = output.len();
		let output = output
			.get_mut(..n_predictions)
			.ok_or(PredictError::ShapeMismatch {
				expected: n_predictions,
				actual,
			})?;
		predictor.predict(features, output)?;
		Ok(n_predictions)
	}
}

#[cfg(test)]
fn three_class_model() -> String {
	let names = (0..180).map(|i| format!("f{}", i)).collect::<Vec<_>>().join(" ");
	let infos = vec!["none"; 180].join(" ");
	let mut text = format!(
		"tree\nversion=v3\nnum_class=3\nnum_tree_per_iteration=3\nlabel_index=0\nmax_feature_idx=179\nobjective=multiclass num_class:3\nfeature_names={}\nfeature_infos={}\n\n",
		names, infos
	);
	for k in 0..3 {
		text.push_str(&format!(
			"Tree={}\nnum_leaves=2\nnum_cat=0\nsplit_feature={}\nsplit_gain=1\nthreshold=0.5\ndecision_type=2\nleft_child=-1\nright_child=-2\nleaf_value={} -1\nleaf_count=1 1\ninternal_value=0\ninternal_count=2\nshrinkage=1\n\n",
			k,
			k * 60,
			k + 1
		));
	}
	text.push_str("end of trees\n");
	text
}

#[test]
fn test_predict_row_and_column_major() {
	let booster = Booster::from_bytes(three_class_model().as_bytes()).unwrap();
	assert_eq!(booster.n_classes().unwrap(), 3);
	assert_eq!(booster.n_features().unwrap(), 180);
	// Two rows: all zeros, and x0 = 1.
	let mut row_major = vec![0.0f32; 2 * 180];
	row_major[180] = 1.0;
	let mut column_major = vec![0.0f32; 2 * 180];
	column_major[1] = 1.0;
	let mut a = vec![0.0; 6];
	let mut b = vec![0.0; 6];
	let n = booster
		.predict(
			DenseMatrix {
				data: &row_major,
				n_rows: 2,
				n_cols: 180,
				row_major: true,
			},
			PredictKind::RawScore,
			-1,
			"",
			&mut a,
		)
		.unwrap();
	booster
		.predict(
			DenseMatrix {
				data: &column_major,
				n_rows: 2,
				n_cols: 180,
				row_major: false,
			},
			PredictKind::RawScore,
			0,
			"num_threads=2",
			&mut b,
		)
		.unwrap();
	assert_eq!(n, 6);
	assert_eq!(a, vec![1.0, 2.0, 3.0, -1.0, 2.0, 3.0]);
	assert_eq!(a, b);
}

#[test]
fn test_leaf_values_are_patched_under_the_lock() {
	let booster = Booster::from_bytes(three_class_model().as_bytes()).unwrap();
	booster.set_leaf_value(2, 0, 10.0).unwrap();
	assert_eq!(booster.leaf_value(2, 0).unwrap(), 10.0);
	let mut output = vec![0.0; 3];
	booster
		.predict(
			DenseMatrix {
				data: &[0.0f64; 180],
				n_rows: 1,
				n_cols: 180,
				row_major: true,
			},
			PredictKind::RawScore,
			0,
			"",
			&mut output,
		)
		.unwrap();
	assert_eq!(output, vec![1.0, 2.0, 10.0]);
	assert!(matches!(
		booster.set_leaf_value(0, 2, 1.0),
		Err(Error::Leaf(LeafError::LeafOutOfRange { .. }))
	));
}

#[test]
fn test_predict_errors() {
	let booster = Booster::from_bytes(three_class_model().as_bytes()).unwrap();
	let data = [0.0f64; 180];
	let matrix = || DenseMatrix {
		data: &data,
		n_rows: 1,
		n_cols: 180,
		row_major: true,
	};
	let mut output = vec![0.0; 3];
	insta::assert_snapshot!(
		booster
			.predict(matrix(), PredictKind::LeafIndex, 0, "", &mut output)
			.unwrap_err()
			.to_string(),
		@"prediction kind LeafIndex is not supported"
	);
	insta::assert_snapshot!(
		booster
			.predict(matrix(), PredictKind::Normal, 0, "pred_early_stop_margin=-2", &mut output)
			.unwrap_err()
			.to_string(),
		@"pred_early_stop_margin must not be negative, got -2"
	);
	let mut short_output = vec![0.0; 2];
	assert!(booster
		.predict(matrix(), PredictKind::Normal, 0, "", &mut short_output)
		.is_err());
	let too_few_values = DenseMatrix {
		data: &data[..100],
		n_rows: 1,
		n_cols: 180,
		row_major: true,
	};
	assert!(matches!(
		booster.predict(too_few_values, PredictKind::Normal, 0, "", &mut output),
		Err(Error::Shape(_))
	));
}
