use crossbeam::channel::{bounded, unbounded, Receiver, Sender};
use fnv::FnvHashMap;
use once_cell::sync::Lazy;
use std::{
	any::Any,
	panic::{catch_unwind, AssertUnwindSafe},
	sync::{Arc, Mutex},
};

/// The pool used by callers that do not ask for a specific number of threads. It has one thread per available core.
pub static GLOBAL_THREAD_POOL: Lazy<ThreadPool> = Lazy::new(|| ThreadPool::new(default_num_threads()));

static SIZED_THREAD_POOLS: Lazy<Mutex<FnvHashMap<usize, Arc<ThreadPool>>>> =
	Lazy::new(|| Mutex::new(FnvHashMap::default()));

/// Get the shared pool with `size` threads, creating it the first time a pool of that size is requested.
pub fn thread_pool_with_size(size: usize) -> Arc<ThreadPool> {
	let size = size.max(1);
	let mut pools = SIZED_THREAD_POOLS
		.lock()
		.unwrap_or_else(|error| error.into_inner());
	pools
		.entry(size)
		.or_insert_with(|| Arc::new(ThreadPool::new(size)))
		.clone()
}

/// The number of threads to use when the caller does not specify one.
pub fn default_num_threads() -> usize {
	std::thread::available_parallelism()
		.map(|n| n.get())
		.unwrap_or(1)
}

/// A fixed size pool of worker threads. Work is submitted in batches with `execute`, which blocks until every task in the batch has finished.
pub struct ThreadPool {
	threads: Vec<Thread>,
}

impl ThreadPool {
	pub fn new(size: usize) -> ThreadPool {
		let size = size.max(1);
		ThreadPool {
			threads: (0..size).map(|_| Thread::new()).collect(),
		}
	}

	/// The number of worker threads in the pool.
	pub fn size(&self) -> usize {
		self.threads.len()
	}

	/**
	Run each task on the pool and block until all of them have finished. Task `i` runs on thread `i % size`. The result of task `i` is at index `i` of the returned `Vec`, regardless of the order in which the tasks completed.

	A task that panics yields `Err` with the panic message. The panic does not affect the other tasks, and this function still waits for all of them before returning.
	*/
	pub fn execute<'s, F, T>(&self, tasks: Vec<F>) -> Vec<Result<T, String>>
	where
		F: FnOnce() -> T + Send + 's,
		T: Send + 's,
	{
		let n_threads = self.threads.len();
		let mut receivers = Vec::with_capacity(tasks.len());
		for (i, f) in tasks.into_iter().enumerate() {
			let (result_sender, result_receiver) = bounded::<Result<T, String>>(1);
			let task: Box<dyn FnOnce() + Send + 's> = Box::new(move || {
				let result = catch_unwind(AssertUnwindSafe(f)).map_err(panic_message);
				result_sender.send(result).ok();
			});
			// This is safe because this function blocks until every task has been run and dropped, so nothing borrowed for 's is used after this function returns.
			let task = unsafe {
				std::mem::transmute::<
					Box<dyn FnOnce() + Send + 's>,
					Box<dyn FnOnce() + Send + 'static>,
				>(task)
			};
			let done_receiver = self.threads[i % n_threads].spawn(task);
			receivers.push((result_receiver, done_receiver));
		}
		// Wait for every task to be dropped before reading any result.
		let receivers: Vec<_> = receivers
			.into_iter()
			.map(|(result_receiver, done_receiver)| {
				done_receiver.recv().ok();
				result_receiver
			})
			.collect();
		receivers
			.into_iter()
			.map(|result_receiver| {
				result_receiver
					.try_recv()
					.unwrap_or_else(|_| Err("the worker thread exited".to_owned()))
			})
			.collect()
	}
}

#[derive(Debug)]
struct Thread {
	task_sender: Option<Sender<Task>>,
	join_handle: Option<std::thread::JoinHandle<()>>,
}

impl Thread {
	fn new() -> Thread {
		let (task_sender, task_receiver) = unbounded::<Task>();
		let join_handle = std::thread::spawn(move || {
			while let Ok(task) = task_receiver.recv() {
				let Task { f, done_sender } = task;
				f();
				done_sender.send(()).ok();
			}
		});
		Thread {
			join_handle: Some(join_handle),
			task_sender: Some(task_sender),
		}
	}

	fn spawn(&self, f: Box<dyn FnOnce() + Send + 'static>) -> Receiver<()> {
		let (done_sender, done_receiver) = bounded::<()>(1);
		let task = Task { f, done_sender };
		// If the thread is gone, the task and its done sender are dropped here, so the caller's receive returns immediately.
		if let Some(task_sender) = self.task_sender.as_ref() {
			task_sender.send(task).ok();
		}
		done_receiver
	}
}

impl Drop for Thread {
	fn drop(&mut self) {
		self.task_sender.take();
		if let Some(join_handle) = self.join_handle.take() {
			join_handle.join().ok();
		}
	}
}

struct Task {
	f: Box<dyn FnOnce() + Send + 'static>,
	done_sender: Sender<()>,
}

/// Extract the message from a panic payload.
pub fn panic_message(payload: Box<dyn Any + Send>) -> String {
	if let Some(message) = payload.downcast_ref::<&str>() {
		(*message).to_owned()
	} else if let Some(message) = payload.downcast_ref::<String>() {
		message.clone()
	} else {
		"unknown error".to_owned()
	}
}

#[test]
fn test_results_are_in_task_order() {
	let pool = ThreadPool::new(3);
	let tasks: Vec<_> = (0..10usize).map(|i| move || i * i).collect();
	let results: Vec<usize> = pool
		.execute(tasks)
		.into_iter()
		.map(|result| result.unwrap())
		.collect();
	assert_eq!(results, (0..10).map(|i| i * i).collect::<Vec<_>>());
}

#[test]
fn test_tasks_can_borrow_disjoint_slices() {
	let pool = ThreadPool::new(4);
	let mut output = vec![0usize; 16];
	let tasks: Vec<_> = output
		.chunks_mut(4)
		.enumerate()
		.map(|(chunk_index, chunk)| {
			move || {
				for (i, value) in chunk.iter_mut().enumerate() {
					*value = chunk_index * 4 + i;
				}
			}
		})
		.collect();
	pool.execute(tasks);
	assert_eq!(output, (0..16).collect::<Vec<_>>());
}

#[test]
fn test_panic_does_not_stop_siblings() {
	let pool = ThreadPool::new(2);
	let tasks: Vec<Box<dyn FnOnce() -> u32 + Send>> = vec![
		Box::new(|| 1),
		Box::new(|| -> u32 { panic!("row exploded") }),
		Box::new(|| 3),
	];
	let results = pool.execute(tasks);
	assert_eq!(results[0], Ok(1));
	assert_eq!(results[1], Err("row exploded".to_owned()));
	assert_eq!(results[2], Ok(3));
	// The pool is still usable after a task panicked.
	let tasks: Vec<Box<dyn FnOnce() -> u32 + Send>> = vec![Box::new(|| 4), Box::new(|| 5)];
	let results = pool.execute(tasks);
	assert_eq!(results, vec![Ok(4), Ok(5)]);
}

#[test]
fn test_pools_of_the_same_size_are_shared() {
	let a = thread_pool_with_size(3);
	let b = thread_pool_with_size(3);
	assert!(Arc::ptr_eq(&a, &b));
	assert_eq!(a.size(), 3);
	let c = thread_pool_with_size(2);
	assert!(!Arc::ptr_eq(&a, &c));
	assert_eq!(thread_pool_with_size(0).size(), 1);
}
