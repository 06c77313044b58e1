use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;

use super::{Coop, CoopHandle, CoopInner, CoopStatus, DeregReason, DeregStart};
use crate::disp::{Dispatcher, DispatcherBinder, EventQueue};
use crate::environment::Environment;
use crate::error::{DeregisterError, RegisterError};
use crate::spawn::panic_message;

#[derive(Default)]
struct RepoState {
	coops: FxHashMap<String, Arc<CoopInner>>,
	stopping: bool,
}

/// Cooperations of one environment by name, from reservation until the
/// finalizer removes them.
#[derive(Default)]
pub(crate) struct CoopRepository {
	state: Mutex<RepoState>,
	emptied: Condvar,
}

impl CoopRepository {
	pub(crate) fn new() -> Self {
		Self::default()
	}

	pub(crate) fn get(&self, name: &str) -> Option<Arc<CoopInner>> {
		self.state.lock().coops.get(name).cloned()
	}

	pub(crate) fn len(&self) -> usize {
		self.state.lock().coops.len()
	}

	pub(crate) fn is_stopping(&self) -> bool {
		self.state.lock().stopping
	}

	/// Refuses further registrations and returns the root cooperations.
	pub(crate) fn begin_stop(&self) -> Vec<Arc<CoopInner>> {
		let mut state = self.state.lock();
		state.stopping = true;
		state.coops.values().filter(|coop| coop.parent().is_none()).cloned().collect()
	}

	/// Blocks until no cooperation remains, or until `deadline`. Returns
	/// whether the repository is empty.
	pub(crate) fn wait_empty(&self, deadline: Option<Instant>) -> bool {
		let mut state = self.state.lock();
		while !state.coops.is_empty() {
			match deadline {
				Some(deadline) => {
					if self.emptied.wait_until(&mut state, deadline).timed_out() {
						return state.coops.is_empty();
					}
				}
				None => self.emptied.wait(&mut state),
			}
		}
		true
	}

	/// Claims the name and, for a child, one usage of the parent.
	fn reserve(&self, coop: Coop, env: &Environment) -> Result<Arc<CoopInner>, RegisterError> {
		let name = coop.name();
		let mut state = self.state.lock();
		if state.stopping {
			return Err(RegisterError::EnvironmentStopping);
		}
		if state.coops.contains_key(&name) {
			return Err(RegisterError::DuplicateCoopName(name));
		}
		let parent = match &coop.parent {
			Some(parent_name) => {
				let parent = state
					.coops
					.get(parent_name)
					.cloned()
					.ok_or_else(|| RegisterError::ParentNotFound(parent_name.clone()))?;
				if !parent.acquire_for_child() {
					return Err(RegisterError::ParentNotActive(parent_name.clone()));
				}
				Some(parent)
			}
			None => None,
		};
		let inner = CoopInner::new(coop, parent, env.downgrade());
		state.coops.insert(name, Arc::clone(&inner));
		Ok(inner)
	}

	/// Removes `coop` if it is still the entry under its name.
	pub(crate) fn remove(&self, coop: &Arc<CoopInner>) {
		let mut state = self.state.lock();
		if state.coops.get(coop.name()).is_some_and(|entry| Arc::ptr_eq(entry, coop)) {
			state.coops.remove(coop.name());
		}
		if state.coops.is_empty() {
			self.emptied.notify_all();
		}
	}
}

/// Registers `coop`: define every agent, bind every agent, then activate.
///
/// On failure every completed step is undone and nothing of the cooperation
/// remains.
pub(crate) fn register(env: &Environment, coop: Coop) -> Result<CoopHandle, RegisterError> {
	let inner = env.shared().coops.reserve(coop, env)?;
	tracing::debug!(
		coop = inner.name(),
		agents = inner.agents().len(),
		parent = inner.parent().map(|p| p.name()),
		"coop.registering"
	);

	let queues = match bring_up(env, &inner) {
		Ok(queues) => queues,
		Err(err) => {
			tracing::warn!(coop = inner.name(), error = %err, "coop.register.failed");
			roll_back(env, &inner);
			return Err(err);
		}
	};
	activate(env, &inner, queues);
	Ok(CoopHandle::new(inner))
}

fn bring_up(env: &Environment, inner: &Arc<CoopInner>) -> Result<Vec<Arc<dyn EventQueue>>, RegisterError> {
	for (agent, _) in inner.agents() {
		agent.core().attach(env.downgrade(), Arc::downgrade(inner));
	}

	for (agent, _) in inner.agents() {
		match catch_unwind(AssertUnwindSafe(|| agent.core().define(env))) {
			Ok(Ok(())) => {}
			Ok(Err(source)) => {
				return Err(RegisterError::Define {
					coop: inner.name().to_string(),
					source,
				});
			}
			Err(payload) => {
				return Err(RegisterError::DefinePanicked {
					coop: inner.name().to_string(),
					message: panic_message(payload.as_ref()),
				});
			}
		}
	}

	let mut queues = Vec::with_capacity(inner.agents().len());
	for (agent, binder) in inner.agents() {
		let dispatcher = resolve_binder(env, binder, inner.binder())?;
		let queue = dispatcher.bind(agent).map_err(|source| RegisterError::Bind {
			coop: inner.name().to_string(),
			source,
		})?;
		inner.bindings.lock().push(dispatcher);
		queues.push(queue);
	}
	Ok(queues)
}

fn resolve_binder(env: &Environment, agent: &DispatcherBinder, coop: &DispatcherBinder) -> Result<Arc<dyn Dispatcher>, RegisterError> {
	let binder = match agent {
		DispatcherBinder::Default => coop,
		binder => binder,
	};
	match binder {
		DispatcherBinder::Default => Ok(env.default_dispatcher()),
		DispatcherBinder::Named(name) => env.dispatcher(name).ok_or_else(|| RegisterError::UnknownDispatcher(name.clone())),
		DispatcherBinder::Instance(dispatcher) => Ok(Arc::clone(dispatcher)),
	}
}

fn roll_back(env: &Environment, inner: &Arc<CoopInner>) {
	let bindings = std::mem::take(&mut *inner.bindings.lock());
	for ((agent, _), dispatcher) in inner.agents().iter().zip(&bindings) {
		dispatcher.unbind(agent);
	}
	for (agent, _) in inner.agents() {
		agent.core().drop_all_subscriptions();
		agent.core().detach_queue();
	}
	env.shared().coops.remove(inner);
	inner.set_status(CoopStatus::Destroyed);
	if let Some(parent) = inner.parent() {
		parent.release_usage(env);
	}
}

fn activate(env: &Environment, inner: &Arc<CoopInner>, queues: Vec<Arc<dyn EventQueue>>) {
	// Active before the queues go in, so a fault in `on_start` can already
	// deregister the cooperation.
	inner.set_status(CoopStatus::Active);
	if let Some(parent) = inner.parent() {
		parent.add_child(inner);
	}
	for ((agent, _), queue) in inner.agents().iter().zip(queues) {
		agent.core().install_queue(queue);
	}
	tracing::debug!(coop = inner.name(), "coop.registered");

	for notify in &inner.on_registered {
		if let Err(payload) = catch_unwind(AssertUnwindSafe(|| notify(env, inner.name()))) {
			tracing::error!(coop = inner.name(), panic = %panic_message(payload.as_ref()), "coop.notificator.panicked");
		}
	}
	for listener in env.shared().listeners.iter() {
		if let Err(payload) = catch_unwind(AssertUnwindSafe(|| listener.on_registered(env, inner.name()))) {
			tracing::error!(coop = inner.name(), panic = %panic_message(payload.as_ref()), "coop.listener.panicked");
		}
	}

	// A parent that began deregistering, or an environment that began
	// stopping, while this cooperation was registering did not see it.
	let parent_leaving = inner.parent().is_some_and(|parent| parent.status() != CoopStatus::Active);
	let reason = if parent_leaving {
		Some(DeregReason::ParentDeregistered)
	} else if env.shared().coops.is_stopping() {
		Some(DeregReason::Shutdown)
	} else {
		None
	};
	if let Some(reason) = reason {
		let _ = deregister(env, inner, reason);
	}
}

/// Starts deregistration of `inner` and, recursively, its children.
///
/// Repeating it while deregistration is under way is a no-op.
pub(crate) fn deregister(env: &Environment, inner: &Arc<CoopInner>, reason: DeregReason) -> Result<(), DeregisterError> {
	match inner.begin_deregistration(reason) {
		DeregStart::NotActive => Err(DeregisterError::NotActive(inner.name().to_string())),
		DeregStart::UnderWay => Ok(()),
		DeregStart::Started => {
			tracing::debug!(coop = inner.name(), reason = %reason, "coop.deregistering");
			for child in inner.live_children() {
				let _ = deregister(env, &child, DeregReason::ParentDeregistered);
			}
			for (agent, _) in inner.agents() {
				agent.core().begin_deregistration();
			}
			inner.release_usage(env);
			Ok(())
		}
	}
}
