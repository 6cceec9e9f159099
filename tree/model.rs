use crate::{model_text, ObjectiveTransform, ParseError, Tree};
use serde::Serialize;
use std::str::FromStr;
use thiserror::Error;

/**
An `EnsembleModel` is a gradient boosted ensemble of trees. Trees are stored in iteration order, with `n_trees_per_iteration()` trees per iteration, and tree `i` contributes to output `i % n_trees_per_iteration()`.

A model is read only once loaded, except for `set_leaf_value`, which callers must not run while a prediction with the same model is in flight.
*/
#[derive(Clone, Debug, PartialEq)]
pub struct EnsembleModel {
	pub(crate) trees: Vec<Tree>,
	pub(crate) n_classes: usize,
	pub(crate) n_trees_per_iteration: usize,
	pub(crate) label_index: usize,
	pub(crate) max_feature_index: usize,
	pub(crate) feature_names: Vec<String>,
	pub(crate) feature_infos: Vec<String>,
	/// If true, the raw scores are the mean of the trees' outputs rather than their sum.
	pub(crate) average_output: bool,
	pub(crate) objective: Option<ObjectiveTransform>,
	/// The `objective` line as it appeared in the model text.
	pub(crate) objective_text: Option<String>,
	pub(crate) version: Option<String>,
	/// The `parameters:` block, kept verbatim so it can be written back out.
	pub(crate) parameters: Option<String>,
}

#[derive(Debug, Error, PartialEq)]
pub enum LeafError {
	#[error("tree {tree_index} does not exist, the model has {n_trees} trees")]
	TreeOutOfRange { tree_index: usize, n_trees: usize },
	#[error("leaf {leaf_index} does not exist, tree {tree_index} has {n_leaves} leaves")]
	LeafOutOfRange {
		tree_index: usize,
		leaf_index: usize,
		n_leaves: usize,
	},
}

/// A summary of a model's metadata, for display.
#[derive(Debug, Serialize)]
pub struct ModelSummary {
	pub version: Option<String>,
	pub n_classes: usize,
	pub n_trees_per_iteration: usize,
	pub n_trees: usize,
	pub n_iterations: usize,
	pub n_features: usize,
	pub label_index: usize,
	pub objective: Option<String>,
	pub average_output: bool,
	pub max_depth: usize,
	pub feature_names: Vec<String>,
}

impl EnsembleModel {
	/// Load a model from its text. See the `model_text` module for the format.
	pub fn from_bytes(bytes: &[u8]) -> Result<EnsembleModel, ParseError> {
		model_text::parse(bytes)
	}

	/// Write the model in the text format, such that `from_bytes` gives back an equal model.
	pub fn to_model_string(&self) -> String {
		model_text::write(self)
	}

	pub fn trees(&self) -> &[Tree] {
		&self.trees
	}

	pub fn n_classes(&self) -> usize {
		self.n_classes
	}

	pub fn n_trees_per_iteration(&self) -> usize {
		self.n_trees_per_iteration
	}

	/// The number of complete iterations in the model.
	pub fn n_iterations(&self) -> usize {
		self.trees.len() / self.n_trees_per_iteration
	}

	pub fn label_index(&self) -> usize {
		self.label_index
	}

	pub fn max_feature_index(&self) -> usize {
		self.max_feature_index
	}

	/// The number of features each example has, which is `max_feature_index() + 1`.
	pub fn n_features(&self) -> usize {
		self.max_feature_index + 1
	}

	pub fn feature_names(&self) -> &[String] {
		&self.feature_names
	}

	pub fn feature_infos(&self) -> &[String] {
		&self.feature_infos
	}

	pub fn average_output(&self) -> bool {
		self.average_output
	}

	pub fn objective(&self) -> Option<&ObjectiveTransform> {
		self.objective.as_ref()
	}

	pub fn parameters(&self) -> Option<&str> {
		self.parameters.as_deref()
	}

	/// Early stopping is only allowed if the model has an objective whose transform tolerates it.
	pub fn allows_early_stop(&self) -> bool {
		self.objective
			.as_ref()
			.map(|objective| objective.allows_early_stop())
			.unwrap_or(false)
	}

	pub fn leaf_value(&self, tree_index: usize, leaf_index: usize) -> Result<f64, LeafError> {
		let tree = self.tree(tree_index)?;
		tree.leaf_value(leaf_index)
			.ok_or(LeafError::LeafOutOfRange {
				tree_index,
				leaf_index,
				n_leaves: tree.n_leaves(),
			})
	}

	/// Overwrite the output of a single leaf, for example to calibrate a model after training.
	pub fn set_leaf_value(
		&mut self,
		tree_index: usize,
		leaf_index: usize,
		value: f64,
	) -> Result<(), LeafError> {
		let n_trees = self.trees.len();
		let tree = self
			.trees
			.get_mut(tree_index)
			.ok_or(LeafError::TreeOutOfRange {
				tree_index,
				n_trees,
			})?;
		let n_leaves = tree.n_leaves();
		tree.set_leaf_value(leaf_index, value)
			.ok_or(LeafError::LeafOutOfRange {
				tree_index,
				leaf_index,
				n_leaves,
			})
	}

	fn tree(&self, tree_index: usize) -> Result<&Tree, LeafError> {
		self.trees.get(tree_index).ok_or(LeafError::TreeOutOfRange {
			tree_index,
			n_trees: self.trees.len(),
		})
	}

	pub fn summary(&self) -> ModelSummary {
		ModelSummary {
			version: self.version.clone(),
			n_classes: self.n_classes,
			n_trees_per_iteration: self.n_trees_per_iteration,
			n_trees: self.trees.len(),
			n_iterations: self.n_iterations(),
			n_features: self.n_features(),
			label_index: self.label_index,
			objective: self.objective_text.clone(),
			average_output: self.average_output,
			max_depth: self.trees.iter().map(|tree| tree.max_depth()).max().unwrap_or(0),
			feature_names: self.feature_names.clone(),
		}
	}
}

impl FromStr for EnsembleModel {
	type Err = ParseError;
	fn from_str(text: &str) -> Result<EnsembleModel, ParseError> {
		EnsembleModel::from_bytes(text.as_bytes())
	}
}

#[cfg(test)]
use crate::test_models;

#[test]
fn test_accessors() {
	let model: EnsembleModel = test_models::three_class(false).parse().unwrap();
	assert_eq!(model.n_classes(), 3);
	assert_eq!(model.n_iterations(), 1);
	assert_eq!(model.n_features(), 180);
	assert_eq!(model.feature_names()[179], "Column_179");
	assert!(model.allows_early_stop());
	let summary = model.summary();
	assert_eq!(summary.n_trees, 3);
	assert_eq!(summary.max_depth, 2);
	assert_eq!(summary.objective.as_deref(), Some("multiclass num_class:3"));
}

#[test]
fn test_leaf_values() {
	let mut model: EnsembleModel = test_models::three_class(true).parse().unwrap();
	assert_eq!(model.leaf_value(1, 0), Ok(0.2));
	model.set_leaf_value(1, 0, 5.0).unwrap();
	assert_eq!(model.leaf_value(1, 0), Ok(5.0));
	// The patched value survives a round trip through the text format.
	let reloaded = EnsembleModel::from_bytes(model.to_model_string().as_bytes()).unwrap();
	assert_eq!(reloaded.leaf_value(1, 0), Ok(5.0));
	assert_eq!(
		model.set_leaf_value(3, 0, 1.0),
		Err(LeafError::TreeOutOfRange {
			tree_index: 3,
			n_trees: 3
		})
	);
	insta::assert_snapshot!(
		model.leaf_value(0, 3).unwrap_err().to_string(),
		@"leaf 3 does not exist, tree 0 has 3 leaves"
	);
}

#[test]
fn test_models_without_objectives_never_stop_early() {
	let model: EnsembleModel = test_models::decisive(2, None).write(false).parse().unwrap();
	assert_eq!(model.objective(), None);
	assert!(!model.allows_early_stop());
}
