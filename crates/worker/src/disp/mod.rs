//! Dispatchers: the threads agents execute on.
//!
//! A dispatcher owns worker threads and hands each bound agent an
//! [`EventQueue`]. Demands pushed into that queue run on the dispatcher's
//! threads, never more than one at a time per agent.
//!
//! Variants:
//! * `one_thread`: one worker, one FIFO shared by all bound agents.
//! * `active_obj`: one worker and FIFO per agent, created at bind.
//! * `thread_pool`: fixed workers pulling per-agent or per-cooperation FIFOs.
//! * `prio_one_thread`: one worker draining lanes strictly by priority.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::agent::AgentRef;
use crate::demand::ExecutionDemand;
use crate::error::{BindError, ConfigError, StartError};

mod active_obj;
mod one_thread;
mod prio;
mod queue;
mod thread_pool;
mod work_thread;

pub use active_obj::ActiveObjDispatcher;
pub use one_thread::{OneThreadDispatcher, PrioOneThreadDispatcher};
pub use prio::Priority;
pub(crate) use queue::{BlockingQueue, PopStatus};
pub use thread_pool::{Fifo, ThreadPoolDispatcher};

/// Destination for one agent's demands.
pub trait EventQueue: Send + Sync {
	/// Enqueues `demand`. A queue that no longer runs demands drops it.
	fn push(&self, demand: ExecutionDemand);
}

/// A scheduler owning worker threads.
pub trait Dispatcher: Send + Sync {
	/// Registered name.
	fn name(&self) -> &str;

	/// Variant label, as used in configuration.
	fn kind(&self) -> &'static str;

	/// Spawns the worker threads.
	fn start(&self) -> Result<(), StartError>;

	/// Asks every worker to exit once its queue is empty. Non-blocking.
	fn shutdown(&self);

	/// Blocks until every worker has exited. Call after
	/// [`shutdown`](Self::shutdown).
	fn wait(&self);

	/// Prepares to run `agent`, returning the queue its demands go to.
	fn bind(&self, agent: &AgentRef) -> Result<Arc<dyn EventQueue>, BindError>;

	/// Releases what [`bind`](Self::bind) set up for `agent`.
	fn unbind(&self, agent: &AgentRef);
}

/// Construction parameters for the built-in dispatchers.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DispatcherParams {
	/// One thread for all bound agents.
	#[default]
	OneThread,
	/// One thread per bound agent.
	ActiveObj,
	/// Fixed pool of threads.
	ThreadPool {
		/// Worker count.
		#[serde(default = "default_pool_threads")]
		threads: usize,
		/// Which agents share a FIFO.
		#[serde(default)]
		fifo: Fifo,
		/// Demands taken from one FIFO before moving to the next.
		#[serde(default = "default_max_demands_at_once")]
		max_demands_at_once: usize,
	},
	/// One thread, strict priority order.
	PrioOneThread,
}

fn default_pool_threads() -> usize {
	std::thread::available_parallelism().map_or(4, |n| n.get())
}

fn default_max_demands_at_once() -> usize {
	4
}

impl DispatcherParams {
	/// Thread pool with defaults for everything but the thread count.
	pub fn thread_pool(threads: usize) -> Self {
		Self::ThreadPool {
			threads,
			fifo: Fifo::default(),
			max_demands_at_once: default_max_demands_at_once(),
		}
	}

	/// Variant label.
	pub fn kind(&self) -> &'static str {
		match self {
			Self::OneThread => "one_thread",
			Self::ActiveObj => "active_obj",
			Self::ThreadPool { .. } => "thread_pool",
			Self::PrioOneThread => "prio_one_thread",
		}
	}

	pub(crate) fn validate(&self) -> Result<(), ConfigError> {
		if let Self::ThreadPool {
			threads, max_demands_at_once, ..
		} = self
		{
			if *threads == 0 {
				return Err(ConfigError::InvalidValue {
					field: "threads",
					reason: "thread pool needs at least one thread".to_string(),
				});
			}
			if *max_demands_at_once == 0 {
				return Err(ConfigError::InvalidValue {
					field: "max_demands_at_once",
					reason: "must be at least 1".to_string(),
				});
			}
		}
		Ok(())
	}

	/// Creates an unstarted dispatcher. `spin` is the queue spin budget.
	pub fn build(&self, name: &str, spin: Duration) -> Arc<dyn Dispatcher> {
		match self {
			Self::OneThread => Arc::new(OneThreadDispatcher::new(name, spin)),
			Self::ActiveObj => Arc::new(ActiveObjDispatcher::new(name, spin)),
			Self::ThreadPool {
				threads,
				fifo,
				max_demands_at_once,
			} => Arc::new(ThreadPoolDispatcher::new(name, *threads, *fifo, *max_demands_at_once, spin)),
			Self::PrioOneThread => Arc::new(PrioOneThreadDispatcher::new(name, spin)),
		}
	}
}

/// Which dispatcher an agent is bound to.
#[derive(Clone, Default)]
pub enum DispatcherBinder {
	/// Inherit: the cooperation's binder, else the environment default.
	#[default]
	Default,
	/// A dispatcher registered in the environment under this name.
	Named(String),
	/// A dispatcher instance held by the caller.
	Instance(Arc<dyn Dispatcher>),
}

impl DispatcherBinder {
	/// Binder for a named dispatcher.
	pub fn named(name: impl Into<String>) -> Self {
		Self::Named(name.into())
	}
}

impl fmt::Debug for DispatcherBinder {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Default => f.write_str("Default"),
			Self::Named(name) => write!(f, "Named({name})"),
			Self::Instance(disp) => write!(f, "Instance({})", disp.name()),
		}
	}
}
