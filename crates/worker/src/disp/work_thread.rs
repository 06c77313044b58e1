use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

use super::queue::{BlockingQueue, Lanes, PopStatus};
use super::EventQueue;
use crate::TaskClass;
use crate::demand::ExecutionDemand;
use crate::error::StartError;
use crate::spawn::{join_thread, spawn_named_thread};

impl<L> EventQueue for BlockingQueue<L>
where
	L: Lanes<Item = ExecutionDemand>,
{
	fn push(&self, demand: ExecutionDemand) {
		if !BlockingQueue::push(self, demand) {
			tracing::trace!("disp.queue.push_after_shutdown");
		}
	}
}

/// Thread name for worker `index` of `dispatcher`.
pub(super) fn thread_name(dispatcher: &str, index: impl std::fmt::Display) -> String {
	format!("troupe.{dispatcher}.{index}")
}

/// Worker loop: executes demands in pop order until the queue is shut down
/// and drained.
pub(super) fn drain<L>(dispatcher: &str, queue: &BlockingQueue<L>, batch: usize)
where
	L: Lanes<Item = ExecutionDemand>,
{
	tracing::debug!(dispatcher, "disp.worker.start");
	let mut demands = Vec::with_capacity(batch);
	let mut executed = 0u64;
	while let PopStatus::Extracted(_) = queue.pop_batch(batch, &mut demands) {
		for demand in demands.drain(..) {
			demand.execute();
			executed += 1;
		}
	}
	tracing::debug!(dispatcher, executed, "disp.worker.exit");
}

/// Join coordination for a set of worker threads.
///
/// Concurrent `wait` callers are safe: the first becomes the leader and
/// joins, the others block until it is done.
enum JoinState {
	Handles(Vec<JoinHandle<()>>),
	Joining,
	Done,
}

/// Worker threads of one dispatcher plus its start/stop flags.
pub(super) struct WorkerGroup {
	dispatcher: String,
	started: AtomicBool,
	stopping: AtomicBool,
	join: Mutex<JoinState>,
	done: Condvar,
}

impl WorkerGroup {
	pub(super) fn new(dispatcher: &str) -> Self {
		Self {
			dispatcher: dispatcher.to_string(),
			started: AtomicBool::new(false),
			stopping: AtomicBool::new(false),
			join: Mutex::new(JoinState::Handles(Vec::new())),
			done: Condvar::new(),
		}
	}

	pub(super) fn dispatcher(&self) -> &str {
		&self.dispatcher
	}

	/// Marks the group started; fails on a second call or after shutdown.
	pub(super) fn begin_start(&self) -> Result<(), StartError> {
		if self.is_stopping() {
			return Err(StartError::ShuttingDown(self.dispatcher.clone()));
		}
		if self.started.swap(true, Ordering::AcqRel) {
			return Err(StartError::AlreadyStarted(self.dispatcher.clone()));
		}
		Ok(())
	}

	/// Spawns one worker thread named after the dispatcher and `index`.
	pub(super) fn spawn(&self, index: impl std::fmt::Display, f: impl FnOnce() + Send + 'static) -> std::io::Result<()> {
		let handle = spawn_named_thread(TaskClass::Dispatcher, thread_name(&self.dispatcher, index), f)?;
		self.adopt(handle);
		Ok(())
	}

	/// Takes ownership of a handle spawned elsewhere.
	pub(super) fn adopt(&self, handle: JoinHandle<()>) {
		match &mut *self.join.lock() {
			JoinState::Handles(handles) => handles.push(handle),
			JoinState::Joining | JoinState::Done => join_thread(handle),
		}
	}

	/// Flags shutdown; returns `true` for the first caller.
	pub(super) fn mark_stopping(&self) -> bool {
		!self.stopping.swap(true, Ordering::AcqRel)
	}

	pub(super) fn is_stopping(&self) -> bool {
		self.stopping.load(Ordering::Acquire)
	}

	/// Joins every adopted thread.
	pub(super) fn join_all(&self) {
		let mut state = self.join.lock();
		loop {
			match *state {
				JoinState::Done => return,
				JoinState::Joining => {
					self.done.wait(&mut state);
					continue;
				}
				JoinState::Handles(_) => {}
			}
			let JoinState::Handles(handles) = std::mem::replace(&mut *state, JoinState::Joining) else {
				continue;
			};
			drop(state);
			let count = handles.len();
			for handle in handles {
				join_thread(handle);
			}
			tracing::debug!(dispatcher = %self.dispatcher, threads = count, "disp.workers.joined");
			*self.join.lock() = JoinState::Done;
			self.done.notify_all();
			return;
		}
	}
}
