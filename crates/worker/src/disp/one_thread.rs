use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use super::prio::PriorityQueue;
use super::queue::{BlockingQueue, Lanes};
use super::work_thread::{WorkerGroup, drain};
use super::{Dispatcher, EventQueue};
use crate::agent::AgentRef;
use crate::demand::ExecutionDemand;
use crate::error::{BindError, StartError};

/// One worker thread over one shared queue.
struct SingleWorker<L> {
	group: WorkerGroup,
	queue: Arc<BlockingQueue<L>>,
	batch: usize,
}

impl<L> SingleWorker<L>
where
	L: Lanes<Item = ExecutionDemand> + 'static,
{
	fn new(name: &str, lanes: L, spin: Duration, batch: usize) -> Self {
		Self {
			group: WorkerGroup::new(name),
			queue: Arc::new(BlockingQueue::new(lanes, spin)),
			batch,
		}
	}

	fn start(&self) -> Result<(), StartError> {
		self.group.begin_start()?;
		let queue = Arc::clone(&self.queue);
		let name = self.group.dispatcher().to_string();
		let batch = self.batch;
		self.group.spawn(0, move || drain(&name, &queue, batch)).map_err(|source| StartError::ThreadSpawn {
			name: super::work_thread::thread_name(self.group.dispatcher(), 0),
			source,
		})
	}

	fn shutdown(&self) {
		if self.group.mark_stopping() {
			tracing::debug!(dispatcher = self.group.dispatcher(), pending = self.queue.len(), "disp.shutdown");
			self.queue.shutdown();
		}
	}

	fn bind(&self, agent: &AgentRef) -> Result<Arc<dyn EventQueue>, BindError> {
		if self.group.is_stopping() {
			return Err(BindError::ShuttingDown(self.group.dispatcher().to_string()));
		}
		tracing::trace!(dispatcher = self.group.dispatcher(), agent = %agent.id(), "disp.bind");
		let queue: Arc<dyn EventQueue> = self.queue.clone();
		Ok(queue)
	}
}

/// Every bound agent shares one thread and one FIFO.
pub struct OneThreadDispatcher {
	worker: SingleWorker<VecDeque<ExecutionDemand>>,
}

impl OneThreadDispatcher {
	/// Demands popped per queue lock acquisition.
	const BATCH: usize = 16;

	/// Creates an unstarted dispatcher.
	pub fn new(name: &str, spin: Duration) -> Self {
		Self {
			worker: SingleWorker::new(name, VecDeque::new(), spin, Self::BATCH),
		}
	}
}

impl Dispatcher for OneThreadDispatcher {
	fn name(&self) -> &str {
		self.worker.group.dispatcher()
	}

	fn kind(&self) -> &'static str {
		"one_thread"
	}

	fn start(&self) -> Result<(), StartError> {
		self.worker.start()
	}

	fn shutdown(&self) {
		self.worker.shutdown();
	}

	fn wait(&self) {
		self.worker.group.join_all();
	}

	fn bind(&self, agent: &AgentRef) -> Result<Arc<dyn EventQueue>, BindError> {
		self.worker.bind(agent)
	}

	fn unbind(&self, agent: &AgentRef) {
		tracing::trace!(dispatcher = self.name(), agent = %agent.id(), "disp.unbind");
	}
}

/// One thread draining per-priority FIFOs, highest priority first.
///
/// Strict: a lower lane runs only while every higher lane is empty.
pub struct PrioOneThreadDispatcher {
	worker: SingleWorker<PriorityQueue<ExecutionDemand>>,
}

impl PrioOneThreadDispatcher {
	/// Creates an unstarted dispatcher.
	pub fn new(name: &str, spin: Duration) -> Self {
		// One demand per pop so a newly queued higher priority demand runs next.
		Self {
			worker: SingleWorker::new(name, PriorityQueue::default(), spin, 1),
		}
	}
}

impl Dispatcher for PrioOneThreadDispatcher {
	fn name(&self) -> &str {
		self.worker.group.dispatcher()
	}

	fn kind(&self) -> &'static str {
		"prio_one_thread"
	}

	fn start(&self) -> Result<(), StartError> {
		self.worker.start()
	}

	fn shutdown(&self) {
		self.worker.shutdown();
	}

	fn wait(&self) {
		self.worker.group.join_all();
	}

	fn bind(&self, agent: &AgentRef) -> Result<Arc<dyn EventQueue>, BindError> {
		self.worker.bind(agent)
	}

	fn unbind(&self, agent: &AgentRef) {
		tracing::trace!(dispatcher = self.name(), agent = %agent.id(), priority = ?agent.priority(), "disp.unbind");
	}
}
