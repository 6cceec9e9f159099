/*!
This crate implements the C API for grove. Models are referred to by opaque `u64` handles, which index a table of loaded boosters. Every function returns `0` on success and `-1` on failure, in which case `grove_get_last_error` returns a message describing what went wrong. Errors and panics never cross the boundary.
*/

#![allow(clippy::missing_safety_doc)]

mod booster;

pub use self::booster::{Booster, DenseMatrix, Error};
use fnv::FnvHashMap;
use grove_tree::PredictKind;
use grove_util::thread_pool::panic_message;
use once_cell::sync::Lazy;
use std::{
	cell::RefCell,
	ffi::{CStr, CString},
	os::raw::{c_char, c_int, c_void},
	panic::{catch_unwind, AssertUnwindSafe},
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc, Mutex,
	},
};

pub const GROVE_DTYPE_FLOAT32: c_int = 0;
pub const GROVE_DTYPE_FLOAT64: c_int = 1;

pub const GROVE_PREDICT_NORMAL: c_int = 0;
pub const GROVE_PREDICT_RAW_SCORE: c_int = 1;
pub const GROVE_PREDICT_LEAF_INDEX: c_int = 2;
pub const GROVE_PREDICT_CONTRIB: c_int = 3;

static BOOSTERS: Lazy<Mutex<FnvHashMap<u64, Arc<Booster>>>> =
	Lazy::new(|| Mutex::new(FnvHashMap::default()));

/// Handles start at 1, so 0 is never a valid handle.
static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

thread_local! {
	static LAST_ERROR: RefCell<CString> = RefCell::new(CString::default());
}

/// Run `f`, converting its error or panic into a status code and the thread's last error.
fn api<F>(f: F) -> c_int
where
	F: FnOnce() -> Result<(), Error>,
{
	let message = match catch_unwind(AssertUnwindSafe(f)) {
		Ok(Ok(())) => return 0,
		Ok(Err(error)) => error.to_string(),
		Err(payload) => format!("panicked: {}", panic_message(payload)),
	};
	set_last_error(message);
	-1
}

fn set_last_error(message: String) {
	// Interior nul bytes cannot be represented in a C string.
	let message = CString::new(message.replace('\0', " ")).unwrap_or_default();
	LAST_ERROR.with(|last_error| *last_error.borrow_mut() = message);
}

fn insert_booster(booster: Booster) -> Result<u64, Error> {
	let handle = NEXT_HANDLE.fetch_add(1, Ordering::Relaxed);
	BOOSTERS
		.lock()
		.map_err(|_| Error::Poisoned)?
		.insert(handle, Arc::new(booster));
	Ok(handle)
}

/// Look up a booster. The table lock is only held for the lookup, so a long prediction does not block other handles.
fn get_booster(handle: u64) -> Result<Arc<Booster>, Error> {
	BOOSTERS
		.lock()
		.map_err(|_| Error::Poisoned)?
		.get(&handle)
		.cloned()
		.ok_or(Error::InvalidHandle(handle))
}

unsafe fn write_out<T>(out: *mut T, name: &'static str, value: T) -> Result<(), Error> {
	if out.is_null() {
		return Err(Error::NullPointer(name));
	}
	*out = value;
	Ok(())
}

fn to_index(name: &'static str, value: c_int) -> Result<usize, Error> {
	if value < 0 {
		return Err(Error::Negative {
			name,
			value: value.into(),
		});
	}
	Ok(value as usize)
}

/// Retrieve the message for the last error on this thread. The string is owned by grove and is valid until the next call that fails on this thread.
#[no_mangle]
pub extern "C" fn grove_get_last_error() -> *const c_char {
	LAST_ERROR.with(|last_error| last_error.borrow().as_ptr())
}

/// Load a model from `len` bytes of model text at `data`. On success, the number of iterations in the model is written to `out_num_iterations` and a handle for the model is written to `out_handle`. Call `grove_booster_free` when you are done with it.
#[no_mangle]
pub unsafe extern "C" fn grove_booster_load_model_from_bytes(
	data: *const u8,
	len: usize,
	out_num_iterations: *mut c_int,
	out_handle: *mut u64,
) -> c_int {
	api(|| {
		if data.is_null() {
			return Err(Error::NullPointer("data"));
		}
		let bytes = std::slice::from_raw_parts(data, len);
		load(bytes, out_num_iterations, out_handle)
	})
}

/// Load a model from the nul terminated model text at `model_str`. See `grove_booster_load_model_from_bytes`.
#[no_mangle]
pub unsafe extern "C" fn grove_booster_load_model_from_string(
	model_str: *const c_char,
	out_num_iterations: *mut c_int,
	out_handle: *mut u64,
) -> c_int {
	api(|| {
		if model_str.is_null() {
			return Err(Error::NullPointer("model_str"));
		}
		let bytes = CStr::from_ptr(model_str).to_bytes();
		load(bytes, out_num_iterations, out_handle)
	})
}

unsafe fn load(bytes: &[u8], out_num_iterations: *mut c_int, out_handle: *mut u64) -> Result<(), Error> {
	if out_handle.is_null() {
		return Err(Error::NullPointer("out_handle"));
	}
	// Write the null handle first so a failed load never leaves a stale handle behind.
	*out_handle = 0;
	let booster = Booster::from_bytes(bytes)?;
	let n_iterations = booster.n_iterations()?;
	if !out_num_iterations.is_null() {
		*out_num_iterations = n_iterations as c_int;
	}
	*out_handle = insert_booster(booster)?;
	Ok(())
}

/// Free the booster for `handle`. Predictions already running with it finish first. Using the handle afterward is an error.
#[no_mangle]
pub extern "C" fn grove_booster_free(handle: u64) -> c_int {
	api(|| {
		BOOSTERS
			.lock()
			.map_err(|_| Error::Poisoned)?
			.remove(&handle)
			.ok_or(Error::InvalidHandle(handle))?;
		Ok(())
	})
}

/// Write the number of classes of the model to `out`.
#[no_mangle]
pub unsafe extern "C" fn grove_booster_get_num_classes(handle: u64, out: *mut c_int) -> c_int {
	api(|| {
		let n_classes = get_booster(handle)?.n_classes()?;
		write_out(out, "out", n_classes as c_int)
	})
}

/// Write the number of features the model expects to `out`.
#[no_mangle]
pub unsafe extern "C" fn grove_booster_get_num_feature(handle: u64, out: *mut c_int) -> c_int {
	api(|| {
		let n_features = get_booster(handle)?.n_features()?;
		write_out(out, "out", n_features as c_int)
	})
}

/// Write the output of leaf `leaf_index` of tree `tree_index` to `out`.
#[no_mangle]
pub unsafe extern "C" fn grove_booster_get_leaf_value(
	handle: u64,
	tree_index: c_int,
	leaf_index: c_int,
	out: *mut f64,
) -> c_int {
	api(|| {
		let tree_index = to_index("tree_index", tree_index)?;
		let leaf_index = to_index("leaf_index", leaf_index)?;
		let value = get_booster(handle)?.leaf_value(tree_index, leaf_index)?;
		write_out(out, "out", value)
	})
}

/// Set the output of leaf `leaf_index` of tree `tree_index` to `value`. This waits for predictions running with the same handle to finish.
#[no_mangle]
pub extern "C" fn grove_booster_set_leaf_value(
	handle: u64,
	tree_index: c_int,
	leaf_index: c_int,
	value: f64,
) -> c_int {
	api(|| {
		let tree_index = to_index("tree_index", tree_index)?;
		let leaf_index = to_index("leaf_index", leaf_index)?;
		get_booster(handle)?.set_leaf_value(tree_index, leaf_index, value)
	})
}

/**
Write the model text, followed by a nul byte, to `out_str`. The number of bytes needed, including the nul byte, is written to `out_len`. If `buffer_len` is less than that, nothing is written to `out_str`, so call once to find the length and again with a large enough buffer.
*/
#[no_mangle]
pub unsafe extern "C" fn grove_booster_save_model_to_string(
	handle: u64,
	buffer_len: i64,
	out_len: *mut i64,
	out_str: *mut c_char,
) -> c_int {
	api(|| {
		let text = get_booster(handle)?.to_model_string()?;
		let needed = text.len() + 1;
		write_out(out_len, "out_len", needed as i64)?;
		if buffer_len >= 0 && buffer_len as usize >= needed {
			if out_str.is_null() {
				return Err(Error::NullPointer("out_str"));
			}
			let out = std::slice::from_raw_parts_mut(out_str as *mut u8, needed);
			out[..text.len()].copy_from_slice(text.as_bytes());
			out[text.len()] = 0;
		}
		Ok(())
	})
}

/// Write the number of values `grove_booster_predict_for_mat` produces for `num_row` rows to `out_len`.
#[no_mangle]
pub unsafe extern "C" fn grove_booster_calc_num_predict(
	handle: u64,
	num_row: c_int,
	predict_type: c_int,
	out_len: *mut i64,
) -> c_int {
	api(|| {
		let n_rows = to_index("num_row", num_row)?;
		let kind = predict_kind(predict_type)?;
		let n_predictions = get_booster(handle)?.n_predictions(n_rows, kind)?;
		write_out(out_len, "out_len", n_predictions as i64)
	})
}

/**
Make predictions for a dense matrix of `nrow` rows and `ncol` columns at `data`, whose elements are `float` or `double` as given by `data_type`. If `is_row_major` is zero, the matrix is stored column by column.

`predict_type` is one of the `GROVE_PREDICT_*` constants. If `num_iteration` is positive, at most that many iterations are used. `parameter` is a nul terminated string of `key=value` options, or null. The predictions are written to `out_result`, which must have room for the number given by `grove_booster_calc_num_predict`, and the number written is written to `out_len`.
*/
#[no_mangle]
pub unsafe extern "C" fn grove_booster_predict_for_mat(
	handle: u64,
	data: *const c_void,
	data_type: c_int,
	nrow: i32,
	ncol: i32,
	is_row_major: c_int,
	predict_type: c_int,
	num_iteration: c_int,
	parameter: *const c_char,
	out_len: *mut i64,
	out_result: *mut f64,
) -> c_int {
	api(|| {
		let n_rows = to_index("nrow", nrow)?;
		let n_cols = to_index("ncol", ncol)?;
		let kind = predict_kind(predict_type)?;
		let parameters = if parameter.is_null() {
			""
		} else {
			CStr::from_ptr(parameter)
				.to_str()
				.map_err(|_| Error::NotUtf8("parameter"))?
		};
		let booster = get_booster(handle)?;
		let n_predictions = booster.n_predictions(n_rows, kind)?;
		if n_rows > 0 && n_cols > 0 && data.is_null() {
			return Err(Error::NullPointer("data"));
		}
		if n_predictions > 0 && out_result.is_null() {
			return Err(Error::NullPointer("out_result"));
		}
		let output: &mut [f64] = if n_predictions > 0 {
			std::slice::from_raw_parts_mut(out_result, n_predictions)
		} else {
			&mut []
		};
		let n_values = n_rows * n_cols;
		let row_major = is_row_major != 0;
		let iteration_cap = num_iteration.into();
		let n_written = match data_type {
			GROVE_DTYPE_FLOAT32 => {
				let data = slice_or_empty(data as *const f32, n_values);
				let matrix = DenseMatrix {
					data,
					n_rows,
					n_cols,
					row_major,
				};
				booster.predict(matrix, kind, iteration_cap, parameters, output)?
			}
			GROVE_DTYPE_FLOAT64 => {
				let data = slice_or_empty(data as *const f64, n_values);
				let matrix = DenseMatrix {
					data,
					n_rows,
					n_cols,
					row_major,
				};
				booster.predict(matrix, kind, iteration_cap, parameters, output)?
			}
			_ => return Err(Error::UnknownDataType(data_type)),
		};
		write_out(out_len, "out_len", n_written as i64)
	})
}

unsafe fn slice_or_empty<'a, T>(data: *const T, len: usize) -> &'a [T] {
	if len == 0 || data.is_null() {
		&[]
	} else {
		std::slice::from_raw_parts(data, len)
	}
}

fn predict_kind(predict_type: c_int) -> Result<PredictKind, Error> {
	match predict_type {
		GROVE_PREDICT_NORMAL => Ok(PredictKind::Normal),
		GROVE_PREDICT_RAW_SCORE => Ok(PredictKind::RawScore),
		GROVE_PREDICT_LEAF_INDEX => Ok(PredictKind::LeafIndex),
		GROVE_PREDICT_CONTRIB => Ok(PredictKind::Contrib),
		_ => Err(Error::UnknownPredictType(predict_type)),
	}
}

#[cfg(test)]
fn last_error() -> String {
	unsafe { CStr::from_ptr(grove_get_last_error()) }
		.to_str()
		.unwrap()
		.to_owned()
}

#[cfg(test)]
const MODEL: &str = "tree
version=v3
num_class=2
num_tree_per_iteration=2
label_index=0
max_feature_idx=1
objective=multiclass num_class:2
feature_names=a b
feature_infos=none none

Tree=0
num_leaves=2
num_cat=0
split_feature=0
split_gain=1
threshold=0.5
decision_type=2
left_child=-1
right_child=-2
leaf_value=1 -1
leaf_count=1 1
internal_value=0
internal_count=2
shrinkage=1

Tree=1
num_leaves=2
num_cat=0
split_feature=1
split_gain=1
threshold=0.5
decision_type=2
left_child=-1
right_child=-2
leaf_value=-1 1
leaf_count=1 1
internal_value=0
internal_count=2
shrinkage=1

end of trees
";

#[cfg(test)]
fn load_test_model() -> u64 {
	let model = CString::new(MODEL).unwrap();
	let mut n_iterations = 0;
	let mut handle = 0;
	let status = unsafe {
		grove_booster_load_model_from_string(model.as_ptr(), &mut n_iterations, &mut handle)
	};
	assert_eq!(status, 0);
	assert_eq!(n_iterations, 1);
	assert_ne!(handle, 0);
	handle
}

#[test]
fn test_load_predict_free() {
	let handle = load_test_model();
	let mut n_classes = 0;
	let mut n_features = 0;
	unsafe {
		assert_eq!(grove_booster_get_num_classes(handle, &mut n_classes), 0);
		assert_eq!(grove_booster_get_num_feature(handle, &mut n_features), 0);
	}
	assert_eq!((n_classes, n_features), (2, 2));
	let data: [f64; 4] = [0.0, 0.0, 1.0, 1.0];
	let parameter = CString::new("num_threads=1").unwrap();
	let mut n_predictions = 0;
	let mut output = [0.0; 4];
	let status = unsafe {
		grove_booster_predict_for_mat(
			handle,
			data.as_ptr() as *const c_void,
			GROVE_DTYPE_FLOAT64,
			2,
			2,
			1,
			GROVE_PREDICT_RAW_SCORE,
			0,
			parameter.as_ptr(),
			&mut n_predictions,
			output.as_mut_ptr(),
		)
	};
	assert_eq!(status, 0);
	assert_eq!(n_predictions, 4);
	assert_eq!(output, [1.0, -1.0, -1.0, 1.0]);
	assert_eq!(grove_booster_free(handle), 0);
	// The handle is gone.
	assert_eq!(grove_booster_free(handle), -1);
	assert_eq!(last_error(), format!("there is no booster with handle {}", handle));
}

#[test]
fn test_failed_load_yields_no_handle() {
	let model = MODEL.replace("feature_names=a b\n", "");
	let mut handle = 12345;
	let status = unsafe {
		grove_booster_load_model_from_bytes(
			model.as_ptr(),
			model.len(),
			std::ptr::null_mut(),
			&mut handle,
		)
	};
	assert_eq!(status, -1);
	assert_eq!(handle, 0);
	assert_eq!(last_error(), "model text does not contain feature_names");
}

#[test]
fn test_leaf_values_and_save() {
	let handle = load_test_model();
	let mut value = 0.0;
	unsafe {
		assert_eq!(grove_booster_get_leaf_value(handle, 1, 1, &mut value), 0);
		assert_eq!(value, 1.0);
		assert_eq!(grove_booster_set_leaf_value(handle, 1, 1, 4.5), 0);
		assert_eq!(grove_booster_get_leaf_value(handle, 1, 1, &mut value), 0);
		assert_eq!(value, 4.5);
		assert_eq!(grove_booster_get_leaf_value(handle, -1, 0, &mut value), -1);
		assert_eq!(last_error(), "tree_index must not be negative, got -1");
	}
	let mut len = 0;
	let status = unsafe { grove_booster_save_model_to_string(handle, 0, &mut len, std::ptr::null_mut()) };
	assert_eq!(status, 0);
	let mut buffer = vec![0u8; len as usize];
	let status = unsafe {
		grove_booster_save_model_to_string(handle, len, &mut len, buffer.as_mut_ptr() as *mut c_char)
	};
	assert_eq!(status, 0);
	let saved = CStr::from_bytes_with_nul(&buffer).unwrap().to_str().unwrap();
	assert!(saved.contains("leaf_value=-1.0 4.5\n"));
	grove_booster_free(handle);
}

#[test]
fn test_unsupported_prediction_types() {
	let handle = load_test_model();
	let mut len = 0;
	unsafe {
		assert_eq!(grove_booster_calc_num_predict(handle, 3, GROVE_PREDICT_NORMAL, &mut len), 0);
		assert_eq!(len, 6);
		assert_eq!(grove_booster_calc_num_predict(handle, 3, GROVE_PREDICT_CONTRIB, &mut len), -1);
		assert_eq!(last_error(), "prediction kind Contrib is not supported");
		assert_eq!(grove_booster_calc_num_predict(handle, 3, 7, &mut len), -1);
		assert_eq!(last_error(), "unknown prediction type 7");
	}
	grove_booster_free(handle);
}
