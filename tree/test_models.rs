//! Model text fixtures shared by the tests. Each fixture can be written with or without `tree_sizes`, so the sequential and parallel parsers can be compared on the same logical model.

use itertools::Itertools;

/// A model with one tree per class per iteration.
pub struct ModelText<'a> {
	pub n_classes: usize,
	pub n_features: usize,
	pub objective: Option<&'a str>,
	pub average_output: bool,
	pub trees: Vec<String>,
}

impl<'a> ModelText<'a> {
	pub fn write(&self, with_tree_sizes: bool) -> String {
		let blocks = self
			.trees
			.iter()
			.enumerate()
			.map(|(index, body)| format!("Tree={}\n{}\n", index, body))
			.collect::<Vec<_>>();
		let mut text = String::new();
		text.push_str("tree\nversion=v3\n");
		text.push_str(&format!("num_class={}\n", self.n_classes));
		text.push_str(&format!("num_tree_per_iteration={}\n", self.n_classes));
		text.push_str("label_index=0\n");
		text.push_str(&format!("max_feature_idx={}\n", self.n_features - 1));
		if let Some(objective) = self.objective {
			text.push_str(&format!("objective={}\n", objective));
		}
		if self.average_output {
			text.push_str("average_output\n");
		}
		text.push_str(&format!(
			"feature_names={}\n",
			(0..self.n_features).map(|i| format!("Column_{}", i)).join(" ")
		));
		text.push_str(&format!(
			"feature_infos={}\n",
			vec!["[-10:10]"; self.n_features].join(" ")
		));
		if with_tree_sizes {
			text.push_str(&format!(
				"tree_sizes={}\n",
				blocks.iter().map(|block| block.len()).join(" ")
			));
		}
		text.push('\n');
		for block in blocks.iter() {
			text.push_str(block);
		}
		text.push_str("end of trees\n\nfeature_importances:\nColumn_0=1\n\n");
		text.push_str("parameters:\n[boosting: gbdt]\n\n[objective: multiclass]\nend of parameters\n\npandas_categorical:null\n");
		text
	}
}

/// `x[a] <= 0.5 ? leaf 0 : (x[b] <= 1.5 ? leaf 1 : leaf 2)`.
pub fn two_split_tree(a: usize, b: usize, leaf_values: [f64; 3]) -> String {
	format!(
		"num_leaves=3
num_cat=0
split_feature={} {}
split_gain=10 5
threshold=0.5 1.5
decision_type=2 2
left_child=-1 -2
right_child=1 -3
leaf_value={:?} {:?} {:?}
leaf_count=50 30 20
internal_value=0 0.1
internal_count=100 50
is_linear=0
shrinkage=0.1
",
		a, b, leaf_values[0], leaf_values[1], leaf_values[2]
	)
}

/// `x[feature] <= threshold ? left : right`.
pub fn stump(feature: usize, threshold: f64, left: f64, right: f64) -> String {
	format!(
		"num_leaves=2
num_cat=0
split_feature={}
split_gain=1
threshold={:?}
decision_type=2
left_child=-1
right_child=-2
leaf_value={:?} {:?}
leaf_count=1 1
internal_value=0
internal_count=2
shrinkage=1
",
		feature, threshold, left, right
	)
}

/// Three classes, 180 features, and one iteration. Tree `k` splits on features `60k` and `60k + 1`.
pub fn three_class_model() -> ModelText<'static> {
	ModelText {
		n_classes: 3,
		n_features: 180,
		objective: Some("multiclass num_class:3"),
		average_output: false,
		trees: (0..3)
			.map(|k| {
				let k_f = k as f64;
				two_split_tree(k * 60, k * 60 + 1, [0.1 * (k_f + 1.0), -0.2, 0.3 * (k_f + 1.0)])
			})
			.collect(),
	}
}

pub fn three_class(with_tree_sizes: bool) -> String {
	three_class_model().write(with_tree_sizes)
}

/// A single output regression model over 200,000 features whose trees split on features spread across the whole range.
pub fn wide(with_tree_sizes: bool) -> String {
	ModelText {
		n_classes: 1,
		n_features: 200_000,
		objective: Some("regression"),
		average_output: false,
		trees: vec![
			two_split_tree(7, 150_000, [1.0, 2.0, 4.0]),
			stump(199_999, 0.0, 8.0, 16.0),
			two_split_tree(123_456, 3, [32.0, 64.0, 128.0]),
			stump(99_999, -0.5, 256.0, 512.0),
		],
	}
	.write(with_tree_sizes)
}

/// A single output regression model over 10 features.
pub fn narrow() -> String {
	ModelText {
		n_classes: 1,
		n_features: 10,
		objective: Some("regression"),
		average_output: false,
		trees: vec![
			two_split_tree(0, 9, [1.0, 2.0, 4.0]),
			stump(5, 0.0, 8.0, 16.0),
		],
	}
	.write(false)
}

/**
Two classes and `n_iterations` iterations. Every iteration adds 1 to class 0 and -1 to class 1 when feature 0 is at most 0.5, and the opposite otherwise, so the margin grows by 2 per iteration.
*/
pub fn decisive(n_iterations: usize, objective: Option<&'static str>) -> ModelText<'static> {
	ModelText {
		n_classes: 2,
		n_features: 2,
		objective,
		average_output: false,
		trees: (0..n_iterations)
			.flat_map(|_| vec![stump(0, 0.5, 1.0, -1.0), stump(0, 0.5, -1.0, 1.0)])
			.collect(),
	}
}

/// A model with no trees.
pub fn zero_trees(n_features: usize) -> String {
	ModelText {
		n_classes: 3,
		n_features,
		objective: Some("multiclass num_class:3"),
		average_output: false,
		trees: Vec::new(),
	}
	.write(false)
}

/// A binary model whose first tree has a categorical split and whose second tree sends NaN to the left.
pub fn categorical() -> String {
	ModelText {
		n_classes: 1,
		n_features: 3,
		objective: Some("binary sigmoid:1"),
		average_output: false,
		trees: vec![
			"num_leaves=3
num_cat=1
split_feature=0 1
split_gain=1 2
threshold=0 1.5
decision_type=1 8
left_child=-1 -2
right_child=1 -3
leaf_value=1 2 3
leaf_count=1 1 1
internal_value=0 0
internal_count=3 2
cat_boundaries=0 2
cat_threshold=6 1
shrinkage=1
"
			.to_owned(),
			"num_leaves=2
num_cat=0
split_feature=2
split_gain=1
threshold=100
decision_type=10
left_child=-1
right_child=-2
leaf_value=0.5 -0.5
leaf_count=1 1
internal_value=0
internal_count=2
shrinkage=1
"
			.to_owned(),
		],
	}
	.write(true)
}

/// Replace the header line that starts with `prefix`.
pub fn with_header_line(text: &str, prefix: &str, replacement: &str) -> String {
	text.lines()
		.map(|line| if line.starts_with(prefix) { replacement } else { line })
		.map(|line| format!("{}\n", line))
		.collect()
}

/// Remove the header line for `key`.
pub fn without_header_line(text: &str, key: &str) -> String {
	let prefix = format!("{}=", key);
	text.lines()
		.filter(|line| !line.starts_with(&prefix))
		.map(|line| format!("{}\n", line))
		.collect()
}
