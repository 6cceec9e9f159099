/*!
This crate contains utilities shared by the grove crates.
*/

pub mod thread_pool;

#[doc(hidden)]
pub use rayon;

/// Zip any number of parallel iterators together, like `itertools::izip!` does for serial iterators.
#[macro_export]
macro_rules! pzip {
	($($e:expr),* $(,)*) => {
		$crate::rayon::iter::IntoParallelIterator::into_par_iter(($($e,)*))
	};
}
