use super::cursor::Cursor;
use crate::{
	BranchNode, BranchSplit, BranchSplitContinuous, BranchSplitDiscrete, LeafNode, MissingType,
	NodeIndex, SplitDirection, Tree,
};
use fnv::FnvHashMap;
use itertools::Itertools;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum TreeParseError {
	#[error("tree text is not valid utf-8")]
	NotUtf8,
	#[error("tree does not contain {0}")]
	MissingKey(&'static str),
	#[error("invalid value in {key}: {value}")]
	InvalidValue { key: &'static str, value: String },
	#[error("wrong size of {key}: expected {expected}, got {actual}")]
	SizeMismatch {
		key: &'static str,
		expected: usize,
		actual: usize,
	},
	#[error("branch {branch_index} refers to child {child}, which does not exist")]
	ChildOutOfRange { branch_index: usize, child: i64 },
	#[error("branch {branch_index} refers to categorical split {category_index}, which does not exist")]
	CategoryOutOfRange {
		branch_index: usize,
		category_index: f64,
	},
	#[error("the branches do not form a tree over the leaves")]
	InvalidStructure,
	#[error("linear trees are not supported")]
	LinearTree,
}

const CATEGORICAL_MASK: u8 = 1;
const DEFAULT_LEFT_MASK: u8 = 2;

impl Tree {
	/**
	Parse a tree from the beginning of `bytes`, which should start just after a `Tree=` line. The body ends at the first empty line, at a line without a `=`, or at the end of `bytes`. Returns the tree and the number of bytes its body occupies, not counting the line that ended it.
	*/
	pub fn from_text(bytes: &[u8]) -> Result<(Tree, usize), TreeParseError> {
		let mut cursor = Cursor::new(bytes);
		let mut values: FnvHashMap<&str, &str> = FnvHashMap::default();
		let mut consumed = 0;
		while let Some(line) = cursor.peek_line() {
			let line = std::str::from_utf8(line).map_err(|_| TreeParseError::NotUtf8)?;
			let (key, value) = match line.split_once('=') {
				Some((key, value)) if !line.starts_with("Tree=") => (key, value),
				_ => break,
			};
			values.insert(key, value);
			cursor.next_line();
			consumed = cursor.offset();
		}
		let tree = tree_from_values(&values)?;
		Ok((tree, consumed))
	}

	/// Write this tree's body in the model text format. The output ends with a newline but does not include the `Tree=` line or the empty line that separates trees.
	pub fn write_text(&self, output: &mut String) {
		let n_leaves = self.leaves.len();
		let mut categorical_boundaries = vec![0usize];
		let mut categorical_bitsets: Vec<u32> = Vec::new();
		let mut thresholds = Vec::with_capacity(self.branches.len());
		let mut decision_types = Vec::with_capacity(self.branches.len());
		for branch in self.branches.iter() {
			match &branch.split {
				BranchSplit::Continuous(split) => {
					thresholds.push(format_f64(split.split_value));
					decision_types.push(decision_type(
						false,
						split.missing_values_direction,
						split.missing_type,
					));
				}
				BranchSplit::Discrete(split) => {
					thresholds.push((categorical_boundaries.len() - 1).to_string());
					categorical_bitsets.extend_from_slice(&split.left_categories);
					categorical_boundaries.push(categorical_bitsets.len());
					decision_types.push(decision_type(
						true,
						split.missing_values_direction,
						split.missing_type,
					));
				}
			}
		}
		let n_categorical = categorical_boundaries.len() - 1;
		write_line(output, "num_leaves", n_leaves);
		write_line(output, "num_cat", n_categorical);
		if !self.branches.is_empty() {
			write_line(output, "split_feature", self.split_feature_indexes().join(" "));
			write_line(
				output,
				"split_gain",
				self.branches.iter().map(|b| format_f64(b.gain)).join(" "),
			);
			write_line(output, "threshold", thresholds.join(" "));
			write_line(output, "decision_type", decision_types.iter().join(" "));
			write_line(
				output,
				"left_child",
				self.branches
					.iter()
					.map(|b| child_to_text(b.left_child_index))
					.join(" "),
			);
			write_line(
				output,
				"right_child",
				self.branches
					.iter()
					.map(|b| child_to_text(b.right_child_index))
					.join(" "),
			);
		}
		write_line(
			output,
			"leaf_value",
			self.leaves.iter().map(|l| format_f64(l.value)).join(" "),
		);
		if !self.branches.is_empty() {
			write_line(
				output,
				"leaf_count",
				self.leaves.iter().map(|l| l.count).join(" "),
			);
			write_line(
				output,
				"internal_value",
				self.branches.iter().map(|b| format_f64(b.value)).join(" "),
			);
			write_line(
				output,
				"internal_count",
				self.branches.iter().map(|b| b.count).join(" "),
			);
		}
		if n_categorical > 0 {
			write_line(output, "cat_boundaries", categorical_boundaries.iter().join(" "));
			write_line(output, "cat_threshold", categorical_bitsets.iter().join(" "));
		}
		write_line(output, "shrinkage", format_f64(self.shrinkage));
	}
}

fn tree_from_values(values: &FnvHashMap<&str, &str>) -> Result<Tree, TreeParseError> {
	if let Some(is_linear) = values.get("is_linear") {
		if is_linear.trim() != "0" {
			return Err(TreeParseError::LinearTree);
		}
	}
	let n_leaves: usize = parse_value(values, "num_leaves")?;
	if n_leaves == 0 {
		return Err(TreeParseError::InvalidValue {
			key: "num_leaves",
			value: "0".to_owned(),
		});
	}
	let n_branches = n_leaves - 1;
	let shrinkage = match values.get("shrinkage") {
		Some(value) => parse_number("shrinkage", value)?,
		None => 1.0,
	};
	let leaf_values: Vec<f64> = parse_array(values, "leaf_value", n_leaves)?;
	let leaf_counts: Vec<u64> =
		parse_optional_array(values, "leaf_count", n_leaves, 0, n_branches == 0)?;
	let leaves = leaf_values
		.into_iter()
		.zip(leaf_counts)
		.map(|(value, count)| LeafNode { value, count })
		.collect();
	if n_branches == 0 {
		return Ok(Tree::new(Vec::new(), leaves, shrinkage));
	}

	let split_features: Vec<usize> = parse_array(values, "split_feature", n_branches)?;
	let thresholds: Vec<f64> = parse_array(values, "threshold", n_branches)?;
	let left_children: Vec<i64> = parse_array(values, "left_child", n_branches)?;
	let right_children: Vec<i64> = parse_array(values, "right_child", n_branches)?;
	let decision_types: Vec<u8> =
		parse_optional_array(values, "decision_type", n_branches, 0, false)?;
	let gains: Vec<f64> = parse_optional_array(values, "split_gain", n_branches, 0.0, false)?;
	let internal_values: Vec<f64> =
		parse_optional_array(values, "internal_value", n_branches, 0.0, false)?;
	let internal_counts: Vec<u64> =
		parse_optional_array(values, "internal_count", n_branches, 0, false)?;
	let n_categorical: usize = match values.get("num_cat") {
		Some(value) => parse_number("num_cat", value)?,
		None => 0,
	};
	let (categorical_boundaries, categorical_bitsets): (Vec<usize>, Vec<u32>) =
		if n_categorical > 0 {
			let boundaries = parse_array(values, "cat_boundaries", n_categorical + 1)?;
			let bitsets = parse_array_any_len(values, "cat_threshold")?;
			(boundaries, bitsets)
		} else {
			(Vec::new(), Vec::new())
		};

	let mut branches = Vec::with_capacity(n_branches);
	for branch_index in 0..n_branches {
		let decision_type = decision_types[branch_index];
		let missing_type = match (decision_type >> 2) & 3 {
			1 => MissingType::Zero,
			2 => MissingType::NaN,
			_ => MissingType::None,
		};
		let missing_values_direction = if decision_type & DEFAULT_LEFT_MASK != 0 {
			SplitDirection::Left
		} else {
			SplitDirection::Right
		};
		let feature_index = split_features[branch_index];
		let split = if decision_type & CATEGORICAL_MASK != 0 {
			let category_index = thresholds[branch_index];
			let out_of_range = TreeParseError::CategoryOutOfRange {
				branch_index,
				category_index,
			};
			if category_index < 0.0 || category_index.fract() != 0.0 {
				return Err(out_of_range);
			}
			let category_index = category_index as usize;
			let bitset = match (
				categorical_boundaries.get(category_index),
				categorical_boundaries.get(category_index + 1),
			) {
				(Some(&start), Some(&end)) if start <= end => categorical_bitsets.get(start..end),
				_ => None,
			};
			let bitset = bitset.ok_or(out_of_range)?;
			BranchSplit::Discrete(BranchSplitDiscrete {
				feature_index,
				left_categories: bitset.to_vec(),
				missing_type,
				missing_values_direction,
			})
		} else {
			BranchSplit::Continuous(BranchSplitContinuous {
				feature_index,
				split_value: thresholds[branch_index],
				missing_type,
				missing_values_direction,
			})
		};
		branches.push(BranchNode {
			left_child_index: child_from_text(left_children[branch_index], branch_index, n_branches, n_leaves)?,
			right_child_index: child_from_text(right_children[branch_index], branch_index, n_branches, n_leaves)?,
			split,
			gain: gains[branch_index],
			value: internal_values[branch_index],
			count: internal_counts[branch_index],
		});
	}
	validate_structure(&branches, n_leaves)?;
	Ok(Tree::new(branches, leaves, shrinkage))
}

/// Non-negative children are branches. A negative child `c` is leaf `!c`, that is `-(c + 1)`.
fn child_from_text(
	child: i64,
	branch_index: usize,
	n_branches: usize,
	n_leaves: usize,
) -> Result<NodeIndex, TreeParseError> {
	let node_index = if child >= 0 {
		NodeIndex::Branch(child as usize)
	} else {
		NodeIndex::Leaf(!child as usize)
	};
	let in_range = match node_index {
		NodeIndex::Branch(index) => index < n_branches,
		NodeIndex::Leaf(index) => index < n_leaves,
	};
	if in_range {
		Ok(node_index)
	} else {
		Err(TreeParseError::ChildOutOfRange {
			branch_index,
			child,
		})
	}
}

fn child_to_text(node_index: NodeIndex) -> i64 {
	match node_index {
		NodeIndex::Branch(index) => index as i64,
		NodeIndex::Leaf(index) => !(index as i64),
	}
}

/// Every branch and every leaf must be reached exactly once from the root, so traversal always terminates and leaf indexes are dense.
fn validate_structure(branches: &[BranchNode], n_leaves: usize) -> Result<(), TreeParseError> {
	let mut branch_visited = vec![false; branches.len()];
	let mut leaf_visited = vec![false; n_leaves];
	let mut stack = vec![NodeIndex::Branch(0)];
	while let Some(node_index) = stack.pop() {
		let visited = match node_index {
			NodeIndex::Branch(index) => &mut branch_visited[index],
			NodeIndex::Leaf(index) => &mut leaf_visited[index],
		};
		if std::mem::replace(visited, true) {
			return Err(TreeParseError::InvalidStructure);
		}
		if let NodeIndex::Branch(index) = node_index {
			stack.push(branches[index].right_child_index);
			stack.push(branches[index].left_child_index);
		}
	}
	if branch_visited.iter().chain(leaf_visited.iter()).all(|v| *v) {
		Ok(())
	} else {
		Err(TreeParseError::InvalidStructure)
	}
}

fn decision_type(
	categorical: bool,
	missing_values_direction: SplitDirection,
	missing_type: MissingType,
) -> u8 {
	let mut decision_type = 0;
	if categorical {
		decision_type |= CATEGORICAL_MASK;
	}
	if missing_values_direction == SplitDirection::Left {
		decision_type |= DEFAULT_LEFT_MASK;
	}
	let missing_type = match missing_type {
		MissingType::None => 0,
		MissingType::Zero => 1,
		MissingType::NaN => 2,
	};
	decision_type | (missing_type << 2)
}

fn parse_number<T: FromStr>(key: &'static str, value: &str) -> Result<T, TreeParseError> {
	value.trim().parse().map_err(|_| TreeParseError::InvalidValue {
		key,
		value: value.to_owned(),
	})
}

fn parse_value<T: FromStr>(
	values: &FnvHashMap<&str, &str>,
	key: &'static str,
) -> Result<T, TreeParseError> {
	let value = values.get(key).ok_or(TreeParseError::MissingKey(key))?;
	parse_number(key, value)
}

fn parse_array_any_len<T: FromStr>(
	values: &FnvHashMap<&str, &str>,
	key: &'static str,
) -> Result<Vec<T>, TreeParseError> {
	let value = values.get(key).ok_or(TreeParseError::MissingKey(key))?;
	value
		.split(' ')
		.filter(|token| !token.is_empty())
		.map(|token| parse_number(key, token))
		.collect()
}

fn parse_array<T: FromStr>(
	values: &FnvHashMap<&str, &str>,
	key: &'static str,
	expected: usize,
) -> Result<Vec<T>, TreeParseError> {
	let array = parse_array_any_len(values, key)?;
	if array.len() != expected {
		return Err(TreeParseError::SizeMismatch {
			key,
			expected,
			actual: array.len(),
		});
	}
	Ok(array)
}

/// Parse an array that older writers may leave out, or that a single leaf tree may leave empty. A missing array is filled with `default`.
fn parse_optional_array<T: FromStr + Clone>(
	values: &FnvHashMap<&str, &str>,
	key: &'static str,
	expected: usize,
	default: T,
	allow_empty: bool,
) -> Result<Vec<T>, TreeParseError> {
	match values.get(key) {
		None => Ok(vec![default; expected]),
		Some(value) if allow_empty && value.trim().is_empty() => Ok(vec![default; expected]),
		Some(_) => parse_array(values, key, expected),
	}
}

fn write_line<T: std::fmt::Display>(output: &mut String, key: &str, value: T) {
	output.push_str(key);
	output.push('=');
	output.push_str(&value.to_string());
	output.push('\n');
}

/// Format a float so that parsing it gives back exactly the same value.
pub fn format_f64(value: f64) -> String {
	format!("{:?}", value)
}

#[cfg(test)]
const STUMP: &str = "num_leaves=2
num_cat=0
split_feature=3
split_gain=12.5
threshold=0.25
decision_type=10
left_child=-1
right_child=-2
leaf_value=-0.5 0.75
leaf_count=40 60
internal_value=0
internal_count=100
shrinkage=0.1

Tree=1
";

#[test]
fn test_parse_stump() {
	let (tree, consumed) = Tree::from_text(STUMP.as_bytes()).unwrap();
	// The body ends just before the empty line.
	assert_eq!(&STUMP[consumed..consumed + 1], "\n");
	assert_eq!(tree.n_leaves(), 2);
	assert_eq!(tree.max_depth(), 1);
	assert_eq!(tree.shrinkage, 0.1);
	assert_eq!(
		tree.branches[0].split,
		BranchSplit::Continuous(BranchSplitContinuous {
			feature_index: 3,
			split_value: 0.25,
			missing_type: MissingType::NaN,
			missing_values_direction: SplitDirection::Left,
		})
	);
	assert_eq!(tree.predict(&[0.0, 0.0, 0.0, 0.1][..]), -0.5);
	assert_eq!(tree.predict(&[0.0, 0.0, 0.0, 0.3][..]), 0.75);
	assert_eq!(tree.predict(&[0.0, 0.0, 0.0, f64::NAN][..]), -0.5);
}

#[test]
fn test_single_leaf_tree() {
	let text = "num_leaves=1\nnum_cat=0\nsplit_feature=\nsplit_gain=\nthreshold=\ndecision_type=\nleft_child=\nright_child=\nleaf_value=0.3\nleaf_count=\ninternal_value=\ninternal_count=\nshrinkage=1\n";
	let (tree, consumed) = Tree::from_text(text.as_bytes()).unwrap();
	assert_eq!(consumed, text.len());
	assert!(tree.branches.is_empty());
	assert_eq!(tree.leaf_value(0), Some(0.3));
}

#[test]
fn test_categorical_tree_round_trip() {
	let text = "num_leaves=3
num_cat=1
split_feature=0 1
split_gain=1 2
threshold=0 1.5
decision_type=1 0
left_child=-1 -2
right_child=1 -3
leaf_value=1 2 3
leaf_count=1 1 1
internal_value=0 0
internal_count=3 2
cat_boundaries=0 1
cat_threshold=6
shrinkage=1
";
	let (tree, _) = Tree::from_text(text.as_bytes()).unwrap();
	// Categories 1 and 2 go left to leaf 0.
	assert_eq!(tree.predict(&[1.0, 0.0][..]), 1.0);
	assert_eq!(tree.predict(&[2.0, 0.0][..]), 1.0);
	assert_eq!(tree.predict(&[3.0, 1.0][..]), 2.0);
	assert_eq!(tree.predict(&[0.0, 2.0][..]), 3.0);
	let mut written = String::new();
	tree.write_text(&mut written);
	let (reparsed, consumed) = Tree::from_text(written.as_bytes()).unwrap();
	assert_eq!(consumed, written.len());
	assert_eq!(reparsed, tree);
}

#[test]
fn test_invalid_trees() {
	let wrong_size = "num_leaves=2\nsplit_feature=0\nthreshold=1\nleft_child=-1\nright_child=-2\nleaf_value=1\n";
	insta::assert_snapshot!(
		Tree::from_text(wrong_size.as_bytes()).unwrap_err().to_string(),
		@"wrong size of leaf_value: expected 2, got 1"
	);
	let dangling = "num_leaves=2\nsplit_feature=0\nthreshold=1\nleft_child=-1\nright_child=-3\nleaf_value=1 2\n";
	assert_eq!(
		Tree::from_text(dangling.as_bytes()).unwrap_err(),
		TreeParseError::ChildOutOfRange {
			branch_index: 0,
			child: -3
		}
	);
	let cycle = "num_leaves=3\nsplit_feature=0 0\nthreshold=1 2\nleft_child=1 0\nright_child=-1 -2\nleaf_value=1 2 3\n";
	assert_eq!(
		Tree::from_text(cycle.as_bytes()).unwrap_err(),
		TreeParseError::InvalidStructure
	);
	let missing = "num_leaves=2\nthreshold=1\nleft_child=-1\nright_child=-2\nleaf_value=1 2\n";
	assert_eq!(
		Tree::from_text(missing.as_bytes()).unwrap_err(),
		TreeParseError::MissingKey("split_feature")
	);
}
