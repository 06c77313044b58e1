use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use troupe_sync::Spinlock;

use super::queue::{BlockingQueue, PopStatus};
use super::work_thread::{WorkerGroup, thread_name};
use super::{Dispatcher, EventQueue};
use crate::agent::AgentRef;
use crate::demand::ExecutionDemand;
use crate::error::{BindError, StartError};
use crate::ids::{AgentId, CoopId};

/// Which agents of a thread pool share one FIFO.
///
/// Demands of one FIFO never run concurrently and run in push order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Fifo {
	/// Each agent has its own FIFO; agents of one cooperation run in
	/// parallel.
	#[default]
	Individual,
	/// All agents of a cooperation share a FIFO.
	Cooperation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum QueueKey {
	Agent(AgentId),
	Coop(CoopId),
}

struct AgentQueueState {
	demands: VecDeque<ExecutionDemand>,
	/// Set while the queue sits in the ready queue or is being processed.
	scheduled: bool,
}

/// FIFO of one agent (or cooperation) inside a pool.
struct AgentQueue {
	me: Weak<AgentQueue>,
	state: Spinlock<AgentQueueState>,
	ready: Arc<ReadyQueue>,
}

type ReadyQueue = BlockingQueue<VecDeque<Arc<AgentQueue>>>;

impl EventQueue for AgentQueue {
	fn push(&self, demand: ExecutionDemand) {
		let schedule = {
			let mut state = self.state.lock();
			state.demands.push_back(demand);
			!std::mem::replace(&mut state.scheduled, true)
		};
		if schedule && let Some(me) = self.me.upgrade() && !self.ready.push(me) {
			self.discard();
		}
	}
}

impl AgentQueue {
	/// Runs up to `max` demands, then requeues itself if more are pending.
	///
	/// Once the pool is shut down the ready queue refuses the requeue, so the
	/// current worker keeps going until this FIFO is empty.
	fn run_turn(self: Arc<Self>, max: usize) {
		loop {
			let turn: Vec<ExecutionDemand> = {
				let mut state = self.state.lock();
				let take = max.min(state.demands.len());
				state.demands.drain(..take).collect()
			};
			for demand in turn {
				demand.execute();
			}
			let more = {
				let mut state = self.state.lock();
				let more = !state.demands.is_empty();
				state.scheduled = more;
				more
			};
			if !more || self.ready.push(Arc::clone(&self)) {
				return;
			}
		}
	}

	/// Drops demands pushed after shutdown to an idle FIFO.
	fn discard(&self) {
		let discarded: Vec<ExecutionDemand> = {
			let mut state = self.state.lock();
			state.scheduled = false;
			state.demands.drain(..).collect()
		};
		tracing::trace!(discarded = discarded.len(), "disp.pool.push_after_shutdown");
	}
}

/// Fixed set of workers pulling agent FIFOs from a shared ready queue.
pub struct ThreadPoolDispatcher {
	group: WorkerGroup,
	threads: usize,
	fifo: Fifo,
	max_demands_at_once: usize,
	ready: Arc<ReadyQueue>,
	queues: Mutex<FxHashMap<QueueKey, (Arc<AgentQueue>, usize)>>,
}

impl ThreadPoolDispatcher {
	/// Creates an unstarted pool.
	pub fn new(name: &str, threads: usize, fifo: Fifo, max_demands_at_once: usize, spin: Duration) -> Self {
		Self {
			group: WorkerGroup::new(name),
			threads: threads.max(1),
			fifo,
			max_demands_at_once: max_demands_at_once.max(1),
			ready: Arc::new(BlockingQueue::new(VecDeque::new(), spin)),
			queues: Mutex::new(FxHashMap::default()),
		}
	}

	/// FIFO sharing mode.
	pub fn fifo(&self) -> Fifo {
		self.fifo
	}

	fn key_of(&self, agent: &AgentRef) -> QueueKey {
		match (self.fifo, agent.coop_id()) {
			(Fifo::Cooperation, Some(coop)) => QueueKey::Coop(coop),
			_ => QueueKey::Agent(agent.id()),
		}
	}
}

fn pool_worker(dispatcher: &str, ready: &ReadyQueue, max_demands_at_once: usize) {
	tracing::debug!(dispatcher, "disp.worker.start");
	let mut turns = 0u64;
	while let PopStatus::Extracted(queue) = ready.pop() {
		queue.run_turn(max_demands_at_once);
		turns += 1;
	}
	tracing::debug!(dispatcher, turns, "disp.worker.exit");
}

impl Dispatcher for ThreadPoolDispatcher {
	fn name(&self) -> &str {
		self.group.dispatcher()
	}

	fn kind(&self) -> &'static str {
		"thread_pool"
	}

	fn start(&self) -> Result<(), StartError> {
		self.group.begin_start()?;
		for index in 0..self.threads {
			let ready = Arc::clone(&self.ready);
			let dispatcher = self.name().to_string();
			let max = self.max_demands_at_once;
			self.group
				.spawn(index, move || pool_worker(&dispatcher, &ready, max))
				.map_err(|source| StartError::ThreadSpawn {
					name: thread_name(self.name(), index),
					source,
				})?;
		}
		tracing::debug!(dispatcher = self.name(), threads = self.threads, fifo = ?self.fifo, "disp.pool.started");
		Ok(())
	}

	fn shutdown(&self) {
		if self.group.mark_stopping() {
			tracing::debug!(dispatcher = self.name(), ready = self.ready.len(), "disp.shutdown");
			self.ready.shutdown();
		}
	}

	fn wait(&self) {
		self.group.join_all();
	}

	fn bind(&self, agent: &AgentRef) -> Result<Arc<dyn EventQueue>, BindError> {
		if self.group.is_stopping() {
			return Err(BindError::ShuttingDown(self.name().to_string()));
		}
		let key = self.key_of(agent);
		let mut queues = self.queues.lock();
		let (queue, users) = queues.entry(key).or_insert_with(|| {
			let queue = Arc::new_cyclic(|me| AgentQueue {
				me: me.clone(),
				state: Spinlock::new(AgentQueueState {
					demands: VecDeque::new(),
					scheduled: false,
				}),
				ready: Arc::clone(&self.ready),
			});
			(queue, 0)
		});
		*users += 1;
		tracing::trace!(dispatcher = self.name(), agent = %agent.id(), queue = ?key, "disp.bind");
		let queue: Arc<dyn EventQueue> = queue.clone();
		Ok(queue)
	}

	fn unbind(&self, agent: &AgentRef) {
		let key = self.key_of(agent);
		let mut queues = self.queues.lock();
		if let Some((_, users)) = queues.get_mut(&key) {
			*users -= 1;
			if *users == 0 {
				queues.remove(&key);
			}
		}
		tracing::trace!(dispatcher = self.name(), agent = %agent.id(), "disp.unbind");
	}
}
