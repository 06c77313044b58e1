use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use super::queue::DemandQueue;
use super::work_thread::{WorkerGroup, drain, thread_name};
use super::{Dispatcher, EventQueue};
use crate::TaskClass;
use crate::agent::AgentRef;
use crate::error::{BindError, StartError};
use crate::ids::AgentId;
use crate::spawn::{join_thread, spawn_named_thread};

struct ActiveAgent {
	queue: Arc<DemandQueue>,
	thread: JoinHandle<()>,
}

/// A dedicated thread and FIFO for every bound agent.
///
/// The thread is spawned at bind and joined at unbind.
pub struct ActiveObjDispatcher {
	group: WorkerGroup,
	spin: Duration,
	agents: Mutex<FxHashMap<AgentId, ActiveAgent>>,
}

impl ActiveObjDispatcher {
	/// Demands popped per queue lock acquisition.
	const BATCH: usize = 16;

	/// Creates an unstarted dispatcher.
	pub fn new(name: &str, spin: Duration) -> Self {
		Self {
			group: WorkerGroup::new(name),
			spin,
			agents: Mutex::new(FxHashMap::default()),
		}
	}

	/// Number of agents currently owning a thread.
	pub fn agent_count(&self) -> usize {
		self.agents.lock().len()
	}
}

impl Dispatcher for ActiveObjDispatcher {
	fn name(&self) -> &str {
		self.group.dispatcher()
	}

	fn kind(&self) -> &'static str {
		"active_obj"
	}

	fn start(&self) -> Result<(), StartError> {
		self.group.begin_start()
	}

	fn shutdown(&self) {
		if !self.group.mark_stopping() {
			return;
		}
		let agents = self.agents.lock();
		tracing::debug!(dispatcher = self.name(), agents = agents.len(), "disp.shutdown");
		for agent in agents.values() {
			agent.queue.shutdown();
		}
	}

	fn wait(&self) {
		let agents: Vec<ActiveAgent> = self.agents.lock().drain().map(|(_, agent)| agent).collect();
		for agent in agents {
			join_thread(agent.thread);
		}
		self.group.join_all();
	}

	fn bind(&self, agent: &AgentRef) -> Result<Arc<dyn EventQueue>, BindError> {
		let mut agents = self.agents.lock();
		if self.group.is_stopping() {
			return Err(BindError::ShuttingDown(self.name().to_string()));
		}
		let queue = Arc::new(DemandQueue::new(Default::default(), self.spin));
		let name = thread_name(self.name(), agent.id());
		let thread = {
			let queue = Arc::clone(&queue);
			let dispatcher = self.name().to_string();
			spawn_named_thread(TaskClass::Dispatcher, name.clone(), move || drain(&dispatcher, &queue, Self::BATCH))
		}
		.map_err(|source| BindError::ThreadSpawn { name, source })?;
		tracing::trace!(dispatcher = self.name(), agent = %agent.id(), "disp.bind");
		agents.insert(
			agent.id(),
			ActiveAgent {
				queue: Arc::clone(&queue),
				thread,
			},
		);
		Ok(queue)
	}

	fn unbind(&self, agent: &AgentRef) {
		let Some(active) = self.agents.lock().remove(&agent.id()) else {
			return;
		};
		active.queue.shutdown();
		join_thread(active.thread);
		tracing::trace!(dispatcher = self.name(), agent = %agent.id(), "disp.unbind");
	}
}
