/*!
This crate makes predictions with gradient boosted decision tree ensembles saved in the [LightGBM](github.com/microsoft/lightgbm) text model format.

Load a model with `EnsembleModel::from_bytes`, create a `Predictor` for the kind of output you want, and call `Predictor::predict` with a matrix of feature values. Rows are scored in parallel on a fixed size thread pool.
*/

#![allow(clippy::tabs_in_doc_comments)]

mod config;
mod early_stopping;
mod features;
mod model;
mod model_text;
mod objective;
mod predictor;
#[cfg(test)]
mod test_models;

pub use self::config::PredictOptions;
pub use self::early_stopping::EarlyStopPolicy;
pub use self::features::Features;
pub use self::model::{EnsembleModel, LeafError, ModelSummary};
pub use self::model_text::{ParseError, TreeParseError};
pub use self::objective::ObjectiveTransform;
pub use self::predictor::{PredictContext, PredictError, PredictKind, Predictor, RowError};

/// Values whose magnitude is at most this are treated as zero, both when deciding whether a feature value is missing and when extracting the nonzero features of a row.
pub const ZERO_THRESHOLD: f64 = 1e-35;

/// Trees are stored as a `Vec` of `BranchNode`s and a `Vec` of `LeafNode`s. Each branch refers to its two children by `NodeIndex`. The root is the first branch, or the only leaf if the tree has no branches. Leaf indexes are dense: every index in `0..n_leaves()` is reached by exactly one path from the root.
#[derive(Clone, Debug, PartialEq)]
pub struct Tree {
	pub branches: Vec<BranchNode>,
	pub leaves: Vec<LeafNode>,
	/// The learning rate that was applied to this tree's leaf values during training. The leaf values are already scaled, so this is never applied when predicting.
	pub shrinkage: f64,
	max_depth: usize,
}

impl Tree {
	/// Create a tree from its branches and leaves. The caller is responsible for the branches forming a tree over the leaves.
	pub fn new(branches: Vec<BranchNode>, leaves: Vec<LeafNode>, shrinkage: f64) -> Tree {
		let mut tree = Tree {
			branches,
			leaves,
			shrinkage,
			max_depth: 0,
		};
		tree.recompute_max_depth();
		tree
	}

	/// Make a prediction for a given example.
	pub fn predict<F>(&self, features: &F) -> f64
	where
		F: Features + ?Sized,
	{
		self.leaves[self.leaf_index(features)].value
	}

	/// Find the index of the leaf that the example is sent to.
	pub fn leaf_index<F>(&self, features: &F) -> usize
	where
		F: Features + ?Sized,
	{
		if self.branches.is_empty() {
			return 0;
		}
		// Start at the root node.
		let mut node_index = NodeIndex::Branch(0);
		// Traverse the tree until we get to a leaf.
		loop {
			match node_index {
				NodeIndex::Branch(branch_index) => {
					let branch = &self.branches[branch_index];
					let feature_value = features.value(branch.split.feature_index());
					node_index = match branch.split.direction(feature_value) {
						SplitDirection::Left => branch.left_child_index,
						SplitDirection::Right => branch.right_child_index,
					};
				}
				// We made it to a leaf!
				NodeIndex::Leaf(leaf_index) => return leaf_index,
			}
		}
	}

	pub fn n_leaves(&self) -> usize {
		self.leaves.len()
	}

	pub fn leaf_value(&self, leaf_index: usize) -> Option<f64> {
		self.leaves.get(leaf_index).map(|leaf| leaf.value)
	}

	/// Overwrite the output of a single leaf. Returns `None` if the leaf does not exist.
	pub fn set_leaf_value(&mut self, leaf_index: usize, value: f64) -> Option<()> {
		let leaf = self.leaves.get_mut(leaf_index)?;
		leaf.value = value;
		Some(())
	}

	/// The number of branches on the longest path from the root to a leaf, as of the last call to `recompute_max_depth`.
	pub fn max_depth(&self) -> usize {
		self.max_depth
	}

	pub fn recompute_max_depth(&mut self) {
		if self.branches.is_empty() {
			self.max_depth = 0;
			return;
		}
		let mut max_depth = 0;
		let mut stack = vec![(NodeIndex::Branch(0), 0)];
		while let Some((node_index, depth)) = stack.pop() {
			match node_index {
				NodeIndex::Branch(branch_index) => {
					let branch = &self.branches[branch_index];
					stack.push((branch.left_child_index, depth + 1));
					stack.push((branch.right_child_index, depth + 1));
				}
				NodeIndex::Leaf(_) => max_depth = max_depth.max(depth),
			}
		}
		self.max_depth = max_depth;
	}

	/// Iterate over the indexes of the features used by this tree's branches.
	pub fn split_feature_indexes(&self) -> impl Iterator<Item = usize> + '_ {
		self.branches
			.iter()
			.map(|branch| branch.split.feature_index())
	}
}

/// A reference from a branch to one of its children.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeIndex {
	Branch(usize),
	Leaf(usize),
}

/// A `BranchNode` is a branch in a tree.
#[derive(Clone, Debug, PartialEq)]
pub struct BranchNode {
	/// This is the node an example is sent to when the split says left.
	pub left_child_index: NodeIndex,
	/// This is the node an example is sent to when the split says right.
	pub right_child_index: NodeIndex,
	/// When making predictions, an example will be sent either to the right or left child. The `split` contains the information necessary to determine which way it will go.
	pub split: BranchSplit,
	/// The gain of this split during training.
	pub gain: f64,
	/// The output this node would have had as a leaf.
	pub value: f64,
	/// The number of training examples that passed through this node.
	pub count: u64,
}

/// A `BranchSplit` describes how examples are sent to the left or right child given their feature values. A `Continuous` split is used for numerical features, and `Discrete` is used for categorical features.
#[derive(Clone, Debug, PartialEq)]
pub enum BranchSplit {
	Continuous(BranchSplitContinuous),
	Discrete(BranchSplitDiscrete),
}

/// A continuous branch split takes the value of a single number feature, compares it with a `split_value`, and if the value is <= `split_value`, the example is sent left, and if it is > `split_value`, it is sent right. Missing values are sent in the `missing_values_direction`.
#[derive(Clone, Debug, PartialEq)]
pub struct BranchSplitContinuous {
	/// This is the index of the feature to get the value for.
	pub feature_index: usize,
	/// This is the threshold value of the split.
	pub split_value: f64,
	/// This determines which values count as missing.
	pub missing_type: MissingType,
	/// This is the direction missing values should be sent.
	pub missing_values_direction: SplitDirection,
}

/// A discrete branch split takes the value of a single categorical feature and looks up in a bitset which way the example should be sent. Categories in the bitset are sent left, all others are sent right.
#[derive(Clone, Debug, PartialEq)]
pub struct BranchSplitDiscrete {
	/// This is the index of the feature to get the value for.
	pub feature_index: usize,
	/// Bit `c % 32` of word `c / 32` is set if category `c` is sent left.
	pub left_categories: Vec<u32>,
	/// This determines which values count as missing.
	pub missing_type: MissingType,
	/// This direction is stored for the model text but has no effect on categorical splits.
	pub missing_values_direction: SplitDirection,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SplitDirection {
	Left,
	Right,
}

/// This determines which feature values a split treats as missing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MissingType {
	/// No value is missing. NaN is treated as zero.
	None,
	/// Zero and NaN are missing.
	Zero,
	/// NaN is missing.
	NaN,
}

/// The leaves in a tree hold the values to output for examples that get sent to them.
#[derive(Clone, Debug, PartialEq)]
pub struct LeafNode {
	/// This is the value to output.
	pub value: f64,
	/// The number of training examples that were sent to this leaf.
	pub count: u64,
}

impl BranchSplit {
	pub fn feature_index(&self) -> usize {
		match self {
			Self::Continuous(s) => s.feature_index,
			Self::Discrete(s) => s.feature_index,
		}
	}

	/// Determine which child an example with the given feature value is sent to.
	pub fn direction(&self, feature_value: f64) -> SplitDirection {
		match self {
			Self::Continuous(split) => split.direction(feature_value),
			Self::Discrete(split) => split.direction(feature_value),
		}
	}
}

impl BranchSplitContinuous {
	pub fn direction(&self, feature_value: f64) -> SplitDirection {
		let feature_value = if feature_value.is_nan() && self.missing_type != MissingType::NaN {
			0.0
		} else {
			feature_value
		};
		let is_missing = match self.missing_type {
			MissingType::None => false,
			MissingType::Zero => is_zero(feature_value),
			MissingType::NaN => feature_value.is_nan(),
		};
		if is_missing {
			self.missing_values_direction
		} else if feature_value <= self.split_value {
			SplitDirection::Left
		} else {
			SplitDirection::Right
		}
	}
}

impl BranchSplitDiscrete {
	pub fn direction(&self, feature_value: f64) -> SplitDirection {
		let feature_value = if feature_value.is_nan() {
			if self.missing_type == MissingType::NaN {
				return SplitDirection::Right;
			}
			0.0
		} else {
			feature_value
		};
		// Categories are integers, so the fractional part is discarded before the sign is checked.
		let category = feature_value as i64;
		if category < 0 {
			return SplitDirection::Right;
		}
		let category = category as usize;
		let word = self.left_categories.get(category / 32).copied().unwrap_or(0);
		if (word >> (category % 32)) & 1 == 1 {
			SplitDirection::Left
		} else {
			SplitDirection::Right
		}
	}
}

fn is_zero(value: f64) -> bool {
	value.abs() <= ZERO_THRESHOLD
}

#[cfg(test)]
fn continuous(
	feature_index: usize,
	split_value: f64,
	missing_type: MissingType,
	missing_values_direction: SplitDirection,
) -> BranchSplit {
	BranchSplit::Continuous(BranchSplitContinuous {
		feature_index,
		split_value,
		missing_type,
		missing_values_direction,
	})
}

#[cfg(test)]
fn branch(left: NodeIndex, right: NodeIndex, split: BranchSplit) -> BranchNode {
	BranchNode {
		left_child_index: left,
		right_child_index: right,
		split,
		gain: 0.0,
		value: 0.0,
		count: 0,
	}
}

#[cfg(test)]
fn leaves(values: &[f64]) -> Vec<LeafNode> {
	values
		.iter()
		.map(|&value| LeafNode { value, count: 0 })
		.collect()
}

#[test]
fn test_continuous_split() {
	// x0 <= 1.5 ? (x1 <= 0.5 ? 10 : 20) : 30
	let tree = Tree::new(
		vec![
			branch(
				NodeIndex::Branch(1),
				NodeIndex::Leaf(2),
				continuous(0, 1.5, MissingType::None, SplitDirection::Right),
			),
			branch(
				NodeIndex::Leaf(0),
				NodeIndex::Leaf(1),
				continuous(1, 0.5, MissingType::None, SplitDirection::Right),
			),
		],
		leaves(&[10.0, 20.0, 30.0]),
		1.0,
	);
	assert_eq!(tree.predict(&[0.0, 0.0][..]), 10.0);
	assert_eq!(tree.predict(&[1.5, 0.7][..]), 20.0);
	assert_eq!(tree.predict(&[1.6, 0.0][..]), 30.0);
	// With no missing type, NaN is treated as zero.
	assert_eq!(tree.predict(&[f64::NAN, f64::NAN][..]), 10.0);
	assert_eq!(tree.max_depth(), 2);
	assert_eq!(tree.n_leaves(), 3);
}

#[test]
fn test_missing_values_follow_default_direction() {
	let nan_split = continuous(0, -1.0, MissingType::NaN, SplitDirection::Left);
	assert_eq!(nan_split.direction(f64::NAN), SplitDirection::Left);
	assert_eq!(nan_split.direction(0.0), SplitDirection::Right);
	let zero_split = continuous(0, 5.0, MissingType::Zero, SplitDirection::Right);
	assert_eq!(zero_split.direction(0.0), SplitDirection::Right);
	assert_eq!(zero_split.direction(1e-40), SplitDirection::Right);
	assert_eq!(zero_split.direction(f64::NAN), SplitDirection::Right);
	assert_eq!(zero_split.direction(1.0), SplitDirection::Left);
}

#[test]
fn test_discrete_split() {
	// Categories 1 and 33 go left.
	let split = BranchSplit::Discrete(BranchSplitDiscrete {
		feature_index: 0,
		left_categories: vec![0b10, 0b10],
		missing_type: MissingType::NaN,
		missing_values_direction: SplitDirection::Left,
	});
	assert_eq!(split.direction(1.0), SplitDirection::Left);
	assert_eq!(split.direction(33.0), SplitDirection::Left);
	assert_eq!(split.direction(2.0), SplitDirection::Right);
	assert_eq!(split.direction(-1.0), SplitDirection::Right);
	assert_eq!(split.direction(1000.0), SplitDirection::Right);
	assert_eq!(split.direction(f64::NAN), SplitDirection::Right);
	// Values in (-1, 0) truncate to category 0.
	let split = BranchSplit::Discrete(BranchSplitDiscrete {
		feature_index: 0,
		left_categories: vec![0b1],
		missing_type: MissingType::None,
		missing_values_direction: SplitDirection::Left,
	});
	assert_eq!(split.direction(-0.5), SplitDirection::Left);
	assert_eq!(split.direction(0.0), SplitDirection::Left);
	assert_eq!(split.direction(f64::NAN), SplitDirection::Left);
	assert_eq!(split.direction(-1.0), SplitDirection::Right);
}

#[test]
fn test_leaf_values_can_be_patched() {
	let mut tree = Tree::new(Vec::new(), leaves(&[0.25]), 0.1);
	let empty: &[f64] = &[];
	assert_eq!(tree.predict(empty), 0.25);
	assert_eq!(tree.set_leaf_value(0, -1.0), Some(()));
	assert_eq!(tree.leaf_value(0), Some(-1.0));
	assert_eq!(tree.predict(empty), -1.0);
	assert_eq!(tree.set_leaf_value(1, 0.0), None);
	assert_eq!(tree.max_depth(), 0);
}
