//! Cooperations: groups of agents registered and deregistered as a unit.
//!
//! Lifecycle: `Registering -> Active -> Deregistering -> Draining ->
//! Destroyed`. A cooperation stays alive while any of its agents is working
//! or any child cooperation exists; the last release hands it to the
//! finalizer thread, which tears it down and releases the parent.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::agent::{Agent, AgentCore, AgentRef};
use crate::disp::{Dispatcher, DispatcherBinder};
use crate::environment::{EnvShared, Environment};
use crate::exception::ExceptionReaction;
use crate::ids::CoopId;

mod finalizer;
mod listener;
mod repository;

pub(crate) use finalizer::Finalizer;
pub use listener::CoopListener;
pub(crate) use repository::{CoopRepository, deregister, register};

/// Why a cooperation is deregistered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeregReason {
	/// Requested by the application.
	Normal,
	/// The environment is stopping.
	Shutdown,
	/// An agent's handler faulted and the reaction was to deregister.
	UnhandledException,
	/// The parent cooperation was deregistered.
	ParentDeregistered,
	/// Application-defined code.
	User(u32),
}

impl fmt::Display for DeregReason {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Normal => f.write_str("normal"),
			Self::Shutdown => f.write_str("shutdown"),
			Self::UnhandledException => f.write_str("unhandled_exception"),
			Self::ParentDeregistered => f.write_str("parent_deregistered"),
			Self::User(code) => write!(f, "user({code})"),
		}
	}
}

/// Lifecycle stage of a cooperation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CoopStatus {
	/// Agents are being defined and bound.
	Registering,
	/// Agents are running.
	Active,
	/// Agents are draining their backlog.
	Deregistering,
	/// Every agent finished; queued for the finalizer.
	Draining,
	/// Torn down.
	Destroyed,
}

/// Callback fired after a cooperation becomes active.
pub type RegisteredFn = dyn Fn(&Environment, &str) + Send + Sync;
/// Callback fired after a cooperation is destroyed.
pub type DeregisteredFn = dyn Fn(&Environment, &str, DeregReason) + Send + Sync;

/// Cooperation under construction.
///
/// Add agents, then hand it to [`Environment::register_coop`].
pub struct Coop {
	id: CoopId,
	name: Option<String>,
	parent: Option<String>,
	binder: DispatcherBinder,
	reaction: ExceptionReaction,
	agents: Vec<(AgentRef, DispatcherBinder)>,
	on_registered: Vec<Arc<RegisteredFn>>,
	on_deregistered: Vec<Arc<DeregisteredFn>>,
}

impl Coop {
	/// Cooperation registered under `name`.
	pub fn new(name: impl Into<String>) -> Self {
		let mut coop = Self::anonymous();
		coop.name = Some(name.into());
		coop
	}

	/// Cooperation named after its id.
	pub fn anonymous() -> Self {
		Self {
			id: CoopId::next(),
			name: None,
			parent: None,
			binder: DispatcherBinder::Default,
			reaction: ExceptionReaction::Inherit,
			agents: Vec::new(),
			on_registered: Vec::new(),
			on_deregistered: Vec::new(),
		}
	}

	/// Registration name.
	pub fn name(&self) -> String {
		self.name.clone().unwrap_or_else(|| self.id.to_string())
	}

	/// Makes this a child of the active cooperation `parent`.
	pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
		self.parent = Some(parent.into());
		self
	}

	/// Binder for agents added without one.
	pub fn with_binder(mut self, binder: DispatcherBinder) -> Self {
		self.binder = binder;
		self
	}

	/// Reaction for agent faults that do not pick their own.
	pub fn with_exception_reaction(mut self, reaction: ExceptionReaction) -> Self {
		self.reaction = reaction;
		self
	}

	/// Adds an agent using the cooperation's binder.
	pub fn add_agent<A: Agent>(&mut self, agent: A) -> AgentRef {
		self.add_agent_with_binder(agent, DispatcherBinder::Default)
	}

	/// Adds an agent bound through `binder`.
	pub fn add_agent_with_binder<A: Agent>(&mut self, agent: A, binder: DispatcherBinder) -> AgentRef {
		let agent = AgentRef::new(AgentCore::new(agent));
		self.agents.push((agent.clone(), binder));
		agent
	}

	/// Number of agents added so far.
	pub fn agent_count(&self) -> usize {
		self.agents.len()
	}

	/// Adds a callback fired once the cooperation is active.
	pub fn on_registered(mut self, f: impl Fn(&Environment, &str) + Send + Sync + 'static) -> Self {
		self.on_registered.push(Arc::new(f));
		self
	}

	/// Adds a callback fired once the cooperation is destroyed.
	pub fn on_deregistered(mut self, f: impl Fn(&Environment, &str, DeregReason) + Send + Sync + 'static) -> Self {
		self.on_deregistered.push(Arc::new(f));
		self
	}
}

impl fmt::Debug for Coop {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Coop")
			.field("name", &self.name())
			.field("parent", &self.parent)
			.field("agents", &self.agents.len())
			.finish()
	}
}

enum DeregStart {
	Started,
	UnderWay,
	NotActive,
}

struct CoopState {
	status: CoopStatus,
	reason: Option<DeregReason>,
}

/// Registered cooperation.
pub(crate) struct CoopInner {
	id: CoopId,
	name: String,
	parent: Option<Arc<CoopInner>>,
	reaction: ExceptionReaction,
	binder: DispatcherBinder,
	agents: Vec<(AgentRef, DispatcherBinder)>,
	/// Dispatchers agents were bound to, index-aligned with `agents`.
	bindings: Mutex<Vec<Arc<dyn Dispatcher>>>,
	state: Mutex<CoopState>,
	state_changed: Condvar,
	/// Working agents + live children + one self reference dropped when
	/// deregistration begins.
	usage: AtomicUsize,
	children: Mutex<Vec<Weak<CoopInner>>>,
	on_registered: Vec<Arc<RegisteredFn>>,
	on_deregistered: Vec<Arc<DeregisteredFn>>,
	env: Weak<EnvShared>,
}

impl CoopInner {
	pub(crate) fn new(coop: Coop, parent: Option<Arc<CoopInner>>, env: Weak<EnvShared>) -> Arc<Self> {
		let name = coop.name();
		Arc::new(Self {
			id: coop.id,
			name,
			parent,
			reaction: coop.reaction,
			binder: coop.binder,
			usage: AtomicUsize::new(coop.agents.len() + 1),
			agents: coop.agents,
			bindings: Mutex::new(Vec::new()),
			state: Mutex::new(CoopState {
				status: CoopStatus::Registering,
				reason: None,
			}),
			state_changed: Condvar::new(),
			children: Mutex::new(Vec::new()),
			on_registered: coop.on_registered,
			on_deregistered: coop.on_deregistered,
			env,
		})
	}

	pub(crate) fn id(&self) -> CoopId {
		self.id
	}

	pub(crate) fn name(&self) -> &str {
		&self.name
	}

	pub(crate) fn parent(&self) -> Option<&Arc<CoopInner>> {
		self.parent.as_ref()
	}

	pub(crate) fn agents(&self) -> &[(AgentRef, DispatcherBinder)] {
		&self.agents
	}

	pub(crate) fn binder(&self) -> &DispatcherBinder {
		&self.binder
	}

	pub(crate) fn status(&self) -> CoopStatus {
		self.state.lock().status
	}

	pub(crate) fn reason(&self) -> Option<DeregReason> {
		self.state.lock().reason
	}

	/// First non-`Inherit` reaction up the parent chain.
	pub(crate) fn resolved_exception_reaction(&self) -> Option<ExceptionReaction> {
		let mut coop = Some(self);
		while let Some(c) = coop {
			if c.reaction != ExceptionReaction::Inherit {
				return Some(c.reaction);
			}
			coop = c.parent.as_deref();
		}
		None
	}

	fn set_status(&self, status: CoopStatus) {
		let mut state = self.state.lock();
		state.status = status;
		self.state_changed.notify_all();
	}

	/// Moves `Active -> Deregistering`.
	fn begin_deregistration(&self, reason: DeregReason) -> DeregStart {
		let mut state = self.state.lock();
		match state.status {
			CoopStatus::Registering => DeregStart::NotActive,
			CoopStatus::Active => {
				state.status = CoopStatus::Deregistering;
				state.reason = Some(reason);
				self.state_changed.notify_all();
				DeregStart::Started
			}
			CoopStatus::Deregistering | CoopStatus::Draining | CoopStatus::Destroyed => DeregStart::UnderWay,
		}
	}

	/// Takes one usage on behalf of a registering child, if still active.
	///
	/// Checked under the state lock: while `Active` the self reference is
	/// held, so the count cannot have reached zero.
	fn acquire_for_child(&self) -> bool {
		let state = self.state.lock();
		if state.status != CoopStatus::Active {
			return false;
		}
		self.usage.fetch_add(1, Ordering::AcqRel);
		true
	}

	fn add_child(&self, child: &Arc<CoopInner>) {
		self.children.lock().push(Arc::downgrade(child));
	}

	fn remove_child(&self, child: &CoopInner) {
		self.children.lock().retain(|weak| !std::ptr::eq(weak.as_ptr(), child));
	}

	fn live_children(&self) -> Vec<Arc<CoopInner>> {
		self.children.lock().iter().filter_map(Weak::upgrade).collect()
	}

	/// Called by each agent after its finish hook.
	pub(crate) fn agent_finished(self: &Arc<Self>, env: &Environment) {
		self.release_usage(env);
	}

	/// Drops one usage; the last one hands the cooperation to the finalizer.
	pub(crate) fn release_usage(self: &Arc<Self>, env: &Environment) {
		let previous = self.usage.fetch_sub(1, Ordering::AcqRel);
		tracing::trace!(coop = %self.name, remaining = previous - 1, "coop.usage.released");
		if previous == 1 {
			self.set_status(CoopStatus::Draining);
			tracing::debug!(coop = %self.name, "coop.draining");
			env.shared().finalizer.push(Arc::clone(self));
		}
	}

	/// Blocks until `Destroyed`, or until `deadline`. Returns whether it was
	/// reached.
	pub(crate) fn wait_destroyed(&self, deadline: Option<Instant>) -> bool {
		let mut state = self.state.lock();
		while state.status != CoopStatus::Destroyed {
			match deadline {
				Some(deadline) => {
					if self.state_changed.wait_until(&mut state, deadline).timed_out() {
						return state.status == CoopStatus::Destroyed;
					}
				}
				None => self.state_changed.wait(&mut state),
			}
		}
		true
	}

	pub(crate) fn environment(&self) -> Option<Environment> {
		self.env.upgrade().map(Environment::from_shared)
	}
}

/// Handle to a registered cooperation.
#[derive(Clone)]
pub struct CoopHandle {
	inner: Arc<CoopInner>,
}

impl CoopHandle {
	pub(crate) fn new(inner: Arc<CoopInner>) -> Self {
		Self { inner }
	}

	/// Cooperation identity.
	pub fn id(&self) -> CoopId {
		self.inner.id
	}

	/// Registered name.
	pub fn name(&self) -> &str {
		&self.inner.name
	}

	/// Current lifecycle stage.
	pub fn status(&self) -> CoopStatus {
		self.inner.status()
	}

	/// Why deregistration started, once it has.
	pub fn dereg_reason(&self) -> Option<DeregReason> {
		self.inner.reason()
	}

	/// Agents of the cooperation, in the order they were added.
	pub fn agents(&self) -> Vec<AgentRef> {
		self.inner.agents.iter().map(|(agent, _)| agent.clone()).collect()
	}

	/// Blocks until the cooperation is destroyed.
	pub fn wait_destroyed(&self) {
		self.inner.wait_destroyed(None);
	}

	/// Blocks until the cooperation is destroyed or `timeout` elapses.
	/// Returns whether it was destroyed.
	pub fn wait_destroyed_timeout(&self, timeout: Duration) -> bool {
		self.inner.wait_destroyed(Some(Instant::now() + timeout))
	}
}

impl fmt::Debug for CoopHandle {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("CoopHandle")
			.field("id", &self.inner.id)
			.field("name", &self.inner.name)
			.field("status", &self.inner.status())
			.finish()
	}
}

#[cfg(test)]
mod tests;
