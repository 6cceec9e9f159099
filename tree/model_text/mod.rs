/*!
This module reads and writes ensembles in the LightGBM text model format. A model is a header of `key=value` lines, followed by one `Tree=` block per tree, followed by an optional `parameters:` block that is kept verbatim.

If the header contains `tree_sizes`, the byte length of every tree block is known up front, so the trees are parsed in parallel. Otherwise the blocks are walked one after another.
*/

mod cursor;
mod tree;

use self::cursor::Cursor;
pub use self::tree::TreeParseError;
use crate::{EnsembleModel, ObjectiveTransform, Tree};
use fnv::FnvHashMap;
use grove_util::pzip;
use itertools::Itertools;
use rayon::prelude::*;
use std::str::FromStr;
use thiserror::Error;

/// Lines quoted in error messages are cut to this many characters.
const MAX_QUOTED_LINE_LEN: usize = 128;

#[derive(Debug, Error)]
pub enum ParseError {
	#[error("model text is not valid utf-8 at byte {offset}")]
	NotUtf8 { offset: usize },
	#[error("malformed line in model text: {0}")]
	MalformedLine(String),
	#[error("model text does not contain {0}")]
	MissingKey(&'static str),
	#[error("invalid value for {key}: {value}")]
	InvalidValue { key: &'static str, value: String },
	#[error("wrong size of {key}: expected {expected}, got {actual}")]
	SizeMismatch {
		key: &'static str,
		expected: usize,
		actual: usize,
	},
	#[error("unknown objective: {0}")]
	UnknownObjective(String),
	#[error("the objective declares {declared} classes but the model has {n_classes}")]
	ObjectiveClassMismatch { declared: usize, n_classes: usize },
	#[error("expected a tree at byte {offset}, found: {found}")]
	ExpectedTree { offset: usize, found: String },
	#[error("tree_sizes needs {required} bytes but the model text has {available}")]
	TreeSizes { required: usize, available: usize },
	#[error("failed to parse tree {index}: {source}")]
	Tree {
		index: usize,
		source: TreeParseError,
	},
	#[error("{n_trees} trees is not a multiple of {n_trees_per_iteration} trees per iteration")]
	TreeCount {
		n_trees: usize,
		n_trees_per_iteration: usize,
	},
	#[error("tree {tree_index} splits on feature {feature_index}, but max_feature_idx is {max_feature_index}")]
	FeatureIndexOutOfRange {
		tree_index: usize,
		feature_index: usize,
		max_feature_index: usize,
	},
}

type Header<'a> = FnvHashMap<&'a str, &'a str>;

/// Parse a model from its text. Any problem is fatal, so either the whole model is returned or an error is.
pub fn parse(bytes: &[u8]) -> Result<EnsembleModel, ParseError> {
	let mut cursor = Cursor::new(bytes);
	let header = parse_header(&mut cursor)?;

	let n_classes: usize = required(&header, "num_class")?;
	if n_classes == 0 {
		return Err(invalid_value("num_class", "0"));
	}
	let n_trees_per_iteration: usize = optional(&header, "num_tree_per_iteration")?.unwrap_or(n_classes);
	if n_trees_per_iteration == 0 {
		return Err(invalid_value("num_tree_per_iteration", "0"));
	}
	let label_index: usize = required(&header, "label_index")?;
	let max_feature_index: usize = required(&header, "max_feature_idx")?;
	let n_features = max_feature_index + 1;
	let feature_names = required_list(&header, "feature_names", n_features)?;
	let feature_infos = required_list(&header, "feature_infos", n_features)?;
	let average_output = header.contains_key("average_output");
	let objective_text = header.get("objective").map(|text| text.to_string());
	let objective = match &objective_text {
		Some(text) => ObjectiveTransform::from_text(text, n_classes)?,
		None => None,
	};
	let version = header.get("version").map(|version| version.to_string());

	let trees = match header.get("tree_sizes") {
		Some(tree_sizes) => {
			let tree_sizes = tree_sizes
				.split(' ')
				.filter(|token| !token.is_empty())
				.map(|token| token.parse().map_err(|_| invalid_value("tree_sizes", token)))
				.collect::<Result<Vec<usize>, _>>()?;
			tracing::debug!(n_trees = tree_sizes.len(), "parsing trees in parallel");
			parse_trees_parallel(&mut cursor, &tree_sizes)?
		}
		None => {
			tracing::debug!("parsing trees sequentially");
			parse_trees_sequential(&mut cursor)?
		}
	};
	let parameters = parse_parameters(&mut cursor)?;

	if trees.len() % n_trees_per_iteration != 0 {
		return Err(ParseError::TreeCount {
			n_trees: trees.len(),
			n_trees_per_iteration,
		});
	}
	for (tree_index, tree) in trees.iter().enumerate() {
		if let Some(feature_index) = tree
			.split_feature_indexes()
			.find(|feature_index| *feature_index > max_feature_index)
		{
			return Err(ParseError::FeatureIndexOutOfRange {
				tree_index,
				feature_index,
				max_feature_index,
			});
		}
	}
	tracing::debug!(
		n_trees = trees.len(),
		n_classes,
		n_trees_per_iteration,
		n_features,
		"parsed model"
	);

	Ok(EnsembleModel {
		trees,
		n_classes,
		n_trees_per_iteration,
		label_index,
		max_feature_index,
		feature_names,
		feature_infos,
		average_output,
		objective,
		objective_text,
		version,
		parameters,
	})
}

/// Read `key=value` lines up to the first tree. A line without `=` is a key with an empty value. Only `feature_names` may contain `=` in its value.
fn parse_header<'a>(cursor: &mut Cursor<'a>) -> Result<Header<'a>, ParseError> {
	let mut header = Header::default();
	while let Some(line) = cursor.peek_line() {
		if line.starts_with(b"Tree=") || line == b"end of trees" || line == b"parameters:" {
			break;
		}
		let offset = cursor.offset();
		cursor.next_line();
		let line = std::str::from_utf8(line).map_err(|_| ParseError::NotUtf8 { offset })?;
		let line = line.trim();
		if line.is_empty() {
			continue;
		}
		let parts = line.split('=').filter(|part| !part.is_empty()).collect::<Vec<_>>();
		match parts.as_slice() {
			[key] => {
				header.insert(*key, "");
			}
			[key, value] => {
				header.insert(*key, *value);
			}
			["feature_names", ..] => {
				header.insert("feature_names", &line["feature_names=".len()..]);
			}
			_ => {
				return Err(ParseError::MalformedLine(
					line.chars().take(MAX_QUOTED_LINE_LEN).collect(),
				))
			}
		}
	}
	Ok(header)
}

fn parse_trees_sequential(cursor: &mut Cursor) -> Result<Vec<Tree>, ParseError> {
	let mut trees = Vec::new();
	loop {
		cursor.skip_empty_lines();
		match cursor.peek_line() {
			Some(line) if line.starts_with(b"Tree=") => {}
			_ => break,
		}
		cursor.next_line();
		let (tree, consumed) = Tree::from_text(cursor.rest()).map_err(|source| ParseError::Tree {
			index: trees.len(),
			source,
		})?;
		let advanced = cursor.advance(consumed);
		debug_assert!(advanced.is_some());
		trees.push(tree);
	}
	Ok(trees)
}

/// Each size in `tree_sizes` is the byte length of one tree block, counted from the first `Tree=` line. Every block is parsed independently.
fn parse_trees_parallel(cursor: &mut Cursor, tree_sizes: &[usize]) -> Result<Vec<Tree>, ParseError> {
	let base = cursor.offset();
	let available = base + cursor.rest().len();
	let mut offsets = Vec::with_capacity(tree_sizes.len() + 1);
	offsets.push(0usize);
	for tree_size in tree_sizes.iter() {
		let end = offsets
			.last()
			.and_then(|offset: &usize| offset.checked_add(*tree_size))
			.filter(|end| base.saturating_add(*end) <= available)
			.ok_or(ParseError::TreeSizes {
				required: tree_sizes.iter().fold(base, |a, b| a.saturating_add(*b)),
				available,
			})?;
		offsets.push(end);
	}
	let rest = cursor.rest();
	let trees = pzip!(&offsets[..tree_sizes.len()], &offsets[1..])
		.enumerate()
		.map(|(index, (start, end))| parse_tree_block(&rest[*start..*end], base + start, index))
		.collect::<Vec<_>>();
	// Report the lowest failing tree, whichever thread finished first.
	let trees = trees.into_iter().collect::<Result<Vec<_>, _>>()?;
	let advanced = offsets.last().and_then(|end| cursor.advance(*end));
	debug_assert!(advanced.is_some());
	Ok(trees)
}

fn parse_tree_block(block: &[u8], offset: usize, index: usize) -> Result<Tree, ParseError> {
	let mut cursor = Cursor::new(block);
	match cursor.next_line() {
		Some(line) if line.starts_with(b"Tree=") => {}
		line => {
			return Err(ParseError::ExpectedTree {
				offset,
				found: String::from_utf8_lossy(line.unwrap_or(b""))
					.chars()
					.take(MAX_QUOTED_LINE_LEN)
					.collect(),
			})
		}
	}
	let (tree, _) =
		Tree::from_text(cursor.rest()).map_err(|source| ParseError::Tree { index, source })?;
	Ok(tree)
}

/// Find the `parameters:` block after the trees and return its lines, each ending with a newline. Empty lines are dropped.
fn parse_parameters(cursor: &mut Cursor) -> Result<Option<String>, ParseError> {
	while let Some(line) = cursor.next_line() {
		if line != b"parameters:" {
			continue;
		}
		let mut parameters = String::new();
		loop {
			let offset = cursor.offset();
			let line = match cursor.next_line() {
				Some(line) => line,
				None => break,
			};
			if line == b"end of parameters" {
				break;
			}
			if line.is_empty() {
				continue;
			}
			let line = std::str::from_utf8(line).map_err(|_| ParseError::NotUtf8 { offset })?;
			parameters.push_str(line);
			parameters.push('\n');
		}
		return Ok(Some(parameters));
	}
	Ok(None)
}

fn invalid_value(key: &'static str, value: &str) -> ParseError {
	ParseError::InvalidValue {
		key,
		value: value.chars().take(MAX_QUOTED_LINE_LEN).collect(),
	}
}

fn optional<T: FromStr>(header: &Header, key: &'static str) -> Result<Option<T>, ParseError> {
	header
		.get(key)
		.map(|value| value.parse().map_err(|_| invalid_value(key, value)))
		.transpose()
}

fn required<T: FromStr>(header: &Header, key: &'static str) -> Result<T, ParseError> {
	optional(header, key)?.ok_or(ParseError::MissingKey(key))
}

fn required_list(header: &Header, key: &'static str, expected: usize) -> Result<Vec<String>, ParseError> {
	let value = header.get(key).ok_or(ParseError::MissingKey(key))?;
	let list = value
		.split(' ')
		.filter(|token| !token.is_empty())
		.map(|token| token.to_owned())
		.collect::<Vec<_>>();
	if list.len() != expected {
		return Err(ParseError::SizeMismatch {
			key,
			expected,
			actual: list.len(),
		});
	}
	Ok(list)
}

/// Write a model in the text format. The header includes `tree_sizes`, so reading the output back uses the parallel parser.
pub fn write(model: &EnsembleModel) -> String {
	let tree_blocks = model
		.trees
		.iter()
		.enumerate()
		.map(|(index, tree)| {
			let mut block = format!("Tree={}\n", index);
			tree.write_text(&mut block);
			block.push('\n');
			block
		})
		.collect::<Vec<_>>();
	let mut output = String::new();
	output.push_str("tree\n");
	if let Some(version) = &model.version {
		output.push_str(&format!("version={}\n", version));
	}
	output.push_str(&format!("num_class={}\n", model.n_classes));
	output.push_str(&format!(
		"num_tree_per_iteration={}\n",
		model.n_trees_per_iteration
	));
	output.push_str(&format!("label_index={}\n", model.label_index));
	output.push_str(&format!("max_feature_idx={}\n", model.max_feature_index));
	if let Some(objective) = &model.objective_text {
		output.push_str(&format!("objective={}\n", objective));
	}
	if model.average_output {
		output.push_str("average_output\n");
	}
	output.push_str(&format!("feature_names={}\n", model.feature_names.join(" ")));
	output.push_str(&format!("feature_infos={}\n", model.feature_infos.join(" ")));
	output.push_str(&format!(
		"tree_sizes={}\n",
		tree_blocks.iter().map(|block| block.len()).join(" ")
	));
	output.push('\n');
	for block in tree_blocks.iter() {
		output.push_str(block);
	}
	output.push_str("end of trees\n");
	if let Some(parameters) = &model.parameters {
		output.push('\n');
		output.push_str("parameters:\n");
		output.push_str(parameters);
		output.push_str("end of parameters\n");
	}
	output
}

#[cfg(test)]
use crate::test_models;

#[test]
fn test_sequential_and_parallel_parse_agree() {
	let sequential = parse(test_models::three_class(false).as_bytes()).unwrap();
	let parallel = parse(test_models::three_class(true).as_bytes()).unwrap();
	assert_eq!(sequential.trees.len(), 3);
	assert_eq!(sequential, parallel);
	for (a, b) in sequential.trees.iter().zip(parallel.trees.iter()) {
		assert_eq!(a.n_leaves(), b.n_leaves());
		assert_eq!(a.max_depth(), b.max_depth());
		for leaf_index in 0..a.n_leaves() {
			assert_eq!(a.leaf_value(leaf_index), b.leaf_value(leaf_index));
		}
	}
}

#[test]
fn test_header() {
	let model = parse(test_models::three_class(false).as_bytes()).unwrap();
	assert_eq!(model.n_classes, 3);
	assert_eq!(model.n_trees_per_iteration, 3);
	assert_eq!(model.max_feature_index, 179);
	assert_eq!(model.feature_names.len(), 180);
	assert_eq!(model.feature_infos.len(), 180);
	assert_eq!(model.objective, Some(ObjectiveTransform::Softmax));
	assert!(!model.average_output);
	assert_eq!(
		model.parameters.as_deref(),
		Some("[boosting: gbdt]\n[objective: multiclass]\n")
	);
}

#[test]
fn test_feature_names_may_contain_equals_signs() {
	let text = test_models::with_header_line(
		&test_models::zero_trees(2),
		"feature_names=",
		"feature_names=a=1 b==2",
	);
	let model = parse(text.as_bytes()).unwrap();
	assert_eq!(model.feature_names, vec!["a=1", "b==2"]);
}

#[test]
fn test_malformed_header_line() {
	let long_key = "x".repeat(200);
	let text = format!("tree\n{}=1=2\n{}", long_key, test_models::zero_trees(1));
	let error = parse(text.as_bytes()).unwrap_err();
	match &error {
		ParseError::MalformedLine(line) => assert_eq!(line.len(), 128),
		error => panic!("unexpected error {}", error),
	}
}

#[test]
fn test_missing_required_keys() {
	for key in &[
		"num_class",
		"label_index",
		"max_feature_idx",
		"feature_names",
		"feature_infos",
	] {
		let text = test_models::without_header_line(&test_models::three_class(false), key);
		match parse(text.as_bytes()) {
			Err(ParseError::MissingKey(missing)) => assert_eq!(missing, *key),
			result => panic!("expected {} to be missing, got {:?}", key, result),
		}
	}
	let text = test_models::without_header_line(&test_models::three_class(false), "feature_names");
	insta::assert_snapshot!(
		parse(text.as_bytes()).unwrap_err().to_string(),
		@"model text does not contain feature_names"
	);
}

#[test]
fn test_feature_list_sizes_are_checked() {
	let text = test_models::with_header_line(
		&test_models::zero_trees(3),
		"feature_infos=",
		"feature_infos=none none",
	);
	insta::assert_snapshot!(
		parse(text.as_bytes()).unwrap_err().to_string(),
		@"wrong size of feature_infos: expected 3, got 2"
	);
}

#[test]
fn test_tree_sizes_must_point_at_trees() {
	let text = test_models::three_class(true);
	let sizes_line = text
		.lines()
		.find(|line| line.starts_with("tree_sizes="))
		.unwrap()
		.to_owned();
	let sizes = sizes_line["tree_sizes=".len()..]
		.split(' ')
		.map(|size| size.parse::<usize>().unwrap())
		.collect::<Vec<_>>();
	// Shift the boundary between the first two trees.
	let shifted = format!(
		"tree_sizes={} {} {}",
		sizes[0] - 1,
		sizes[1] + 1,
		sizes[2]
	);
	let error = parse(text.replace(&sizes_line, &shifted).as_bytes()).unwrap_err();
	assert!(matches!(error, ParseError::ExpectedTree { .. }));
	let too_long = format!("tree_sizes={} {} {}", sizes[0], sizes[1], sizes[2] + text.len());
	let error = parse(text.replace(&sizes_line, &too_long).as_bytes()).unwrap_err();
	assert!(matches!(error, ParseError::TreeSizes { .. }));
}

#[test]
fn test_parallel_parse_reports_the_first_invalid_tree() {
	// Every tree is invalid, and the replacement keeps the tree sizes correct.
	let text = test_models::three_class(true).replace("num_leaves=3", "num_leaves=x");
	for _ in 0..20 {
		let error = parse(text.as_bytes()).unwrap_err();
		assert!(matches!(error, ParseError::Tree { index: 0, .. }));
	}
}

#[test]
fn test_tree_count_must_fill_iterations() {
	let text = test_models::with_header_line(
		&test_models::three_class(false),
		"num_tree_per_iteration=",
		"num_tree_per_iteration=2",
	);
	insta::assert_snapshot!(
		parse(text.as_bytes()).unwrap_err().to_string(),
		@"3 trees is not a multiple of 2 trees per iteration"
	);
}

#[test]
fn test_split_features_must_exist() {
	let text = test_models::with_header_line(
		&test_models::three_class(false),
		"max_feature_idx=",
		"max_feature_idx=99",
	);
	let text = text
		.lines()
		.map(|line| {
			if line.starts_with("feature_names=") {
				format!("feature_names={}", (0..100).map(|i| format!("f{}", i)).join(" "))
			} else if line.starts_with("feature_infos=") {
				format!("feature_infos={}", vec!["none"; 100].join(" "))
			} else {
				line.to_owned()
			}
		})
		.join("\n");
	assert!(matches!(
		parse(text.as_bytes()),
		Err(ParseError::FeatureIndexOutOfRange {
			tree_index: 2,
			feature_index: 120,
			max_feature_index: 99,
		})
	));
}

#[test]
fn test_write_then_parse_reproduces_the_model() {
	for text in &[
		test_models::three_class(false),
		test_models::categorical(),
		test_models::zero_trees(4),
	] {
		let model = parse(text.as_bytes()).unwrap();
		let written = write(&model);
		let reparsed = parse(written.as_bytes()).unwrap();
		assert_eq!(reparsed, model);
		assert_eq!(write(&reparsed), written);
	}
}
