use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use super::{CoopInner, CoopStatus, DeregReason};
use crate::TaskClass;
use crate::disp::{BlockingQueue, PopStatus};
use crate::environment::{EnvShared, Environment};
use crate::error::StartError;
use crate::spawn::{join_thread, panic_message, spawn_named_thread};

const THREAD_NAME: &str = "troupe.finalizer";

/// Dedicated thread tearing down drained cooperations.
///
/// Teardown never runs on a dispatcher thread, so unbinding may join
/// agent threads.
pub(crate) struct Finalizer {
	queue: Arc<BlockingQueue<VecDeque<Arc<CoopInner>>>>,
	thread: Mutex<Option<JoinHandle<()>>>,
}

impl Finalizer {
	pub(crate) fn new(spin: Duration) -> Self {
		Self {
			queue: Arc::new(BlockingQueue::new(VecDeque::new(), spin)),
			thread: Mutex::new(None),
		}
	}

	pub(crate) fn start(&self, env: Weak<EnvShared>) -> Result<(), StartError> {
		let queue = Arc::clone(&self.queue);
		let handle = spawn_named_thread(TaskClass::Finalizer, THREAD_NAME, move || run(&queue, &env)).map_err(|source| {
			StartError::ThreadSpawn {
				name: THREAD_NAME.to_string(),
				source,
			}
		})?;
		*self.thread.lock() = Some(handle);
		Ok(())
	}

	pub(crate) fn push(&self, coop: Arc<CoopInner>) {
		let name = coop.name().to_string();
		if !self.queue.push(coop) {
			tracing::error!(coop = %name, "coop.finalizer.stopped");
		}
	}

	/// Lets the thread exit once the queue drains, without waiting for it.
	pub(crate) fn close(&self) {
		self.queue.shutdown();
	}

	/// Stops the thread after the queued cooperations are finalized.
	pub(crate) fn shutdown(&self) {
		self.close();
		if let Some(handle) = self.thread.lock().take() {
			join_thread(handle);
		}
	}
}

fn run(queue: &BlockingQueue<VecDeque<Arc<CoopInner>>>, env: &Weak<EnvShared>) {
	tracing::debug!("coop.finalizer.start");
	let mut finalized = 0u64;
	while let PopStatus::Extracted(coop) = queue.pop() {
		match env.upgrade() {
			Some(shared) => finalize(&coop, &Environment::from_shared(shared)),
			None => release_agents(&coop),
		}
		finalized += 1;
	}
	tracing::debug!(finalized, "coop.finalizer.exit");
}

/// Unbinds agents from their dispatchers and removes their subscriptions.
fn release_agents(coop: &CoopInner) {
	let bindings = std::mem::take(&mut *coop.bindings.lock());
	for (idx, (agent, _)) in coop.agents.iter().enumerate() {
		agent.core().detach_queue();
		if let Some(dispatcher) = bindings.get(idx) {
			dispatcher.unbind(agent);
		}
	}
	for (agent, _) in &coop.agents {
		agent.core().drop_all_subscriptions();
	}
}

fn finalize(coop: &Arc<CoopInner>, env: &Environment) {
	release_agents(coop);
	env.shared().coops.remove(coop);

	let reason = coop.reason().unwrap_or(DeregReason::Normal);
	for notify in &coop.on_deregistered {
		if let Err(payload) = catch_unwind(AssertUnwindSafe(|| notify(env, coop.name(), reason))) {
			tracing::error!(coop = coop.name(), panic = %panic_message(payload.as_ref()), "coop.notificator.panicked");
		}
	}
	for listener in env.shared().listeners.iter() {
		if let Err(payload) = catch_unwind(AssertUnwindSafe(|| listener.on_deregistered(env, coop.name(), reason))) {
			tracing::error!(coop = coop.name(), panic = %panic_message(payload.as_ref()), "coop.listener.panicked");
		}
	}

	coop.set_status(CoopStatus::Destroyed);
	tracing::debug!(coop = coop.name(), reason = %reason, "coop.destroyed");

	if let Some(parent) = coop.parent() {
		parent.remove_child(coop);
		parent.release_usage(env);
	}
}
