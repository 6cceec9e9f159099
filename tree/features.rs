use fnv::FnvHashMap;

/**
A `Features` is the feature vector for a single example. Trees only ever ask for the value of one feature at a time, so an example can be stored densely, with one entry per feature, or sparsely, with entries for only its nonzero features. Features without an entry have the value zero.
*/
pub trait Features {
	fn value(&self, feature_index: usize) -> f64;
}

impl Features for [f64] {
	fn value(&self, feature_index: usize) -> f64 {
		self.get(feature_index).copied().unwrap_or(0.0)
	}
}

impl Features for FnvHashMap<usize, f64> {
	fn value(&self, feature_index: usize) -> f64 {
		self.get(&feature_index).copied().unwrap_or(0.0)
	}
}

#[test]
fn test_dense_and_sparse_agree() {
	let dense = [0.0, 2.5, 0.0, -1.0];
	let sparse: FnvHashMap<usize, f64> = vec![(1, 2.5), (3, -1.0)].into_iter().collect();
	for feature_index in 0..6 {
		assert_eq!(
			dense[..].value(feature_index),
			sparse.value(feature_index)
		);
	}
}
