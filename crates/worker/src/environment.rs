//! The environment: owner of every runtime service.
//!
//! An [`Environment`] holds the named mailbox dictionary, the dispatchers,
//! the cooperation repository, the finalizer thread and the timer thread.
//! Handles are cheap clones of one shared state.
//!
//! Shutdown happens in two steps. [`Environment::stop`] refuses new
//! cooperations and deregisters every root cooperation; it never blocks and
//! may be called from handlers. [`Environment::join`] waits for every
//! cooperation to be destroyed, then stops the finalizer, the timer and the
//! dispatchers.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::agent::Agent;
use crate::config::{DEFAULT_DISPATCHER_NAME, EnvironmentParams};
use crate::coop::{self, Coop, CoopHandle, CoopInner, CoopListener, CoopRepository, DeregReason, Finalizer};
use crate::disp::{Dispatcher, DispatcherParams};
use crate::error::{DeregisterError, RegisterError, StartError};
use crate::exception::ExceptionReaction;
use crate::mailbox::{Mailbox, NamedMailboxes};
use crate::message::{Envelope, Message};
use crate::registry::{DispatcherRecord, DispatcherRegistry};
use crate::spawn;
use crate::timer::{TimerHandle, TimerThread};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
	Running,
	Stopping,
	TearingDown,
	Stopped,
}

/// State shared by every [`Environment`] handle.
pub(crate) struct EnvShared {
	pub(crate) params: EnvironmentParams,
	pub(crate) named: Arc<NamedMailboxes>,
	pub(crate) dispatchers: DispatcherRegistry,
	default_dispatcher: Arc<dyn Dispatcher>,
	pub(crate) coops: CoopRepository,
	pub(crate) finalizer: Finalizer,
	pub(crate) timer: TimerThread,
	pub(crate) listeners: Vec<Arc<dyn CoopListener>>,
	stopping: AtomicBool,
	phase: Mutex<Phase>,
	phase_changed: Condvar,
}

impl Drop for EnvShared {
	fn drop(&mut self) {
		// Only signals: the last handle may be dropped on a runtime thread.
		self.finalizer.close();
		self.timer.close();
		for dispatcher in self.dispatchers.drain() {
			dispatcher.shutdown();
		}
		self.default_dispatcher.shutdown();
	}
}

/// Configures an environment before it starts.
#[derive(Default)]
pub struct EnvironmentBuilder {
	params: EnvironmentParams,
	listeners: Vec<Arc<dyn CoopListener>>,
}

impl EnvironmentBuilder {
	/// Replaces the parameters.
	pub fn params(mut self, params: EnvironmentParams) -> Self {
		self.params = params;
		self
	}

	/// Adds a listener notified of every cooperation registration and
	/// destruction.
	pub fn listener(mut self, listener: Arc<dyn CoopListener>) -> Self {
		self.listeners.push(listener);
		self
	}

	/// Validates the parameters, creates the dispatchers and starts every
	/// runtime thread.
	pub fn start(self) -> Result<Environment, StartError> {
		let Self { params, listeners } = self;
		params.validate()?;
		let spin = params.spin();

		let dispatchers = DispatcherRegistry::new();
		let default_dispatcher = params.default_dispatcher.build(DEFAULT_DISPATCHER_NAME, spin);
		dispatchers.insert(Arc::clone(&default_dispatcher))?;
		for named in &params.dispatchers {
			dispatchers.insert(named.params.build(&named.name, spin))?;
		}

		let shared = Arc::new(EnvShared {
			named: NamedMailboxes::new(params.named_mailbox_shards),
			dispatchers,
			default_dispatcher,
			coops: CoopRepository::new(),
			finalizer: Finalizer::new(spin),
			timer: TimerThread::new(),
			listeners,
			stopping: AtomicBool::new(false),
			phase: Mutex::new(Phase::Running),
			phase_changed: Condvar::new(),
			params,
		});
		let env = Environment { shared };
		if let Err(err) = env.start_threads() {
			tracing::error!(error = %err, "env.start.failed");
			env.stop();
			env.join();
			return Err(err);
		}
		tracing::info!(
			dispatchers = env.shared.dispatchers.snapshots().len(),
			default_dispatcher = env.shared.params.default_dispatcher.kind(),
			"env.started"
		);
		Ok(env)
	}
}

impl fmt::Debug for EnvironmentBuilder {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("EnvironmentBuilder")
			.field("params", &self.params)
			.field("listeners", &self.listeners.len())
			.finish()
	}
}

/// Handle to a running actor environment.
#[derive(Clone)]
pub struct Environment {
	shared: Arc<EnvShared>,
}

impl Environment {
	/// Starts building an environment.
	pub fn builder() -> EnvironmentBuilder {
		EnvironmentBuilder::default()
	}

	/// Starts an environment with `params` and no listeners.
	pub fn start(params: EnvironmentParams) -> Result<Self, StartError> {
		Self::builder().params(params).start()
	}

	/// Starts an environment, runs `init` on the calling thread and blocks
	/// until the environment has stopped.
	///
	/// Something must eventually call [`stop`](Self::stop): `init`, an agent,
	/// or an exception reaction.
	pub fn launch<F>(params: EnvironmentParams, init: F) -> Result<(), StartError>
	where
		F: FnOnce(&Environment),
	{
		let env = Self::start(params)?;
		init(&env);
		env.join();
		Ok(())
	}

	pub(crate) fn from_shared(shared: Arc<EnvShared>) -> Self {
		Self { shared }
	}

	pub(crate) fn shared(&self) -> &EnvShared {
		&self.shared
	}

	pub(crate) fn downgrade(&self) -> Weak<EnvShared> {
		Arc::downgrade(&self.shared)
	}

	fn start_threads(&self) -> Result<(), StartError> {
		self.shared.finalizer.start(self.downgrade())?;
		self.shared.timer.start()?;
		for record in self.shared.dispatchers.snapshots() {
			if let Some(dispatcher) = self.shared.dispatchers.get(&record.name) {
				dispatcher.start()?;
			}
		}
		Ok(())
	}

	/// The parameters the environment was started with.
	pub fn params(&self) -> &EnvironmentParams {
		&self.shared.params
	}

	/// Reaction applied when neither the agent nor any cooperation up the
	/// chain picks one.
	pub fn default_exception_reaction(&self) -> ExceptionReaction {
		self.shared.params.exception_reaction
	}

	// Mailboxes.

	/// Creates an anonymous multi-consumer mailbox.
	pub fn create_mailbox(&self) -> Mailbox {
		Mailbox::anonymous()
	}

	/// Returns the mailbox registered under `name`, creating it on first use.
	///
	/// The name stays bound to one mailbox while any handle to it exists.
	pub fn named_mailbox(&self, name: &str) -> Mailbox {
		self.shared.named.get_or_create(name)
	}

	// Dispatchers.

	/// The dispatcher agents bind to when nothing else is chosen.
	pub fn default_dispatcher(&self) -> Arc<dyn Dispatcher> {
		Arc::clone(&self.shared.default_dispatcher)
	}

	/// Looks up a registered dispatcher.
	pub fn dispatcher(&self, name: &str) -> Option<Arc<dyn Dispatcher>> {
		self.shared.dispatchers.get(name)
	}

	/// Registered dispatchers, sorted by name.
	pub fn dispatchers(&self) -> Vec<DispatcherRecord> {
		self.shared.dispatchers.snapshots()
	}

	/// Creates, starts and registers a dispatcher under `name`.
	pub fn add_dispatcher(&self, name: &str, params: &DispatcherParams) -> Result<Arc<dyn Dispatcher>, StartError> {
		params.validate()?;
		let dispatcher = params.build(name, self.shared.params.spin());
		self.add_dispatcher_instance(Arc::clone(&dispatcher))?;
		Ok(dispatcher)
	}

	/// Starts and registers a dispatcher created by the caller. It is shut
	/// down and joined by [`join`](Self::join).
	pub fn add_dispatcher_instance(&self, dispatcher: Arc<dyn Dispatcher>) -> Result<(), StartError> {
		let name = dispatcher.name().to_string();
		if self.is_stopping() {
			return Err(StartError::ShuttingDown(name));
		}
		if self.shared.dispatchers.get(&name).is_some() {
			return Err(StartError::DuplicateDispatcher(name));
		}
		dispatcher.start()?;
		if let Err(err) = self.shared.dispatchers.insert(Arc::clone(&dispatcher)) {
			dispatcher.shutdown();
			dispatcher.wait();
			return Err(err);
		}
		tracing::debug!(dispatcher = %name, kind = dispatcher.kind(), "env.dispatcher.added");
		Ok(())
	}

	// Cooperations.

	/// Registers a cooperation. On error nothing of it remains.
	pub fn register_coop(&self, coop: Coop) -> Result<CoopHandle, RegisterError> {
		coop::register(self, coop)
	}

	/// Registers a cooperation holding only `agent`.
	pub fn register_agent_as_coop<A: Agent>(&self, name: impl Into<String>, agent: A) -> Result<CoopHandle, RegisterError> {
		let mut coop = Coop::new(name);
		coop.add_agent(agent);
		self.register_coop(coop)
	}

	/// Starts deregistration of the cooperation `name` and its children.
	///
	/// Repeating it while deregistration is under way is a no-op.
	pub fn deregister_coop(&self, name: &str, reason: DeregReason) -> Result<(), DeregisterError> {
		let coop = self.shared.coops.get(name).ok_or_else(|| DeregisterError::NotFound(name.to_string()))?;
		self.deregister_coop_inner(&coop, reason)
	}

	pub(crate) fn deregister_coop_inner(&self, coop: &Arc<CoopInner>, reason: DeregReason) -> Result<(), DeregisterError> {
		coop::deregister(self, coop, reason)
	}

	/// Handle to the cooperation `name`, from reservation until it is
	/// destroyed.
	pub fn coop(&self, name: &str) -> Option<CoopHandle> {
		self.shared.coops.get(name).map(CoopHandle::new)
	}

	/// Blocks until the cooperation `name` is destroyed or its name has been
	/// released. Returns immediately if no such cooperation exists.
	pub fn wait_coop_destroyed(&self, name: &str) {
		if let Some(coop) = self.shared.coops.get(name) {
			coop.wait_destroyed(None);
		}
	}

	/// Number of cooperations not yet destroyed.
	pub fn coop_count(&self) -> usize {
		self.shared.coops.len()
	}

	// Timers.

	/// Delivers `message` to `mailbox` once, after `delay`.
	pub fn send_delayed<M: Message>(&self, mailbox: &Mailbox, message: M, delay: Duration) {
		self.shared.timer.schedule(mailbox, Envelope::new(message), delay, None).detach();
	}

	/// Delivers `message` to `mailbox` after `delay`, then every `period`
	/// until the handle is cancelled or dropped. A zero period fires once.
	pub fn send_periodic<M: Message>(&self, mailbox: &Mailbox, message: M, delay: Duration, period: Duration) -> TimerHandle {
		self.shared.timer.schedule(mailbox, Envelope::new(message), delay, Some(period))
	}

	// Lifecycle.

	/// Whether [`stop`](Self::stop) was called.
	pub fn is_stopping(&self) -> bool {
		self.shared.stopping.load(Ordering::Acquire)
	}

	/// Refuses new cooperations and deregisters every root cooperation with
	/// [`DeregReason::Shutdown`]. Never blocks; repeated calls are no-ops.
	pub fn stop(&self) {
		if self.shared.stopping.swap(true, Ordering::AcqRel) {
			return;
		}
		{
			let mut phase = self.shared.phase.lock();
			if *phase == Phase::Running {
				*phase = Phase::Stopping;
			}
			self.shared.phase_changed.notify_all();
		}
		let roots = self.shared.coops.begin_stop();
		tracing::info!(coops = roots.len(), "env.stopping");
		for coop in roots {
			if let Err(err) = coop::deregister(self, &coop, DeregReason::Shutdown) {
				// Still registering: its activation sees the stop and
				// deregisters itself.
				tracing::debug!(coop = coop.name(), error = %err, "env.stop.deregister_deferred");
			}
		}
	}

	/// Blocks until the environment is stopped and torn down.
	///
	/// Does not initiate stopping. Calling it from a runtime thread would
	/// deadlock, so it returns immediately there.
	pub fn join(&self) {
		if let Some(class) = spawn::current_class() {
			tracing::warn!(worker_class = class.as_str(), "env.join.on_runtime_thread");
			return;
		}
		let mut phase = self.shared.phase.lock();
		loop {
			let current = *phase;
			match current {
				Phase::Running | Phase::TearingDown => self.shared.phase_changed.wait(&mut phase),
				Phase::Stopped => return,
				Phase::Stopping => break,
			}
		}
		// This caller leads the teardown; later callers wait for it.
		*phase = Phase::TearingDown;
		drop(phase);
		self.tear_down();
		*self.shared.phase.lock() = Phase::Stopped;
		self.shared.phase_changed.notify_all();
	}

	/// Stops and joins.
	pub fn stop_and_join(&self) {
		self.stop();
		self.join();
	}

	fn tear_down(&self) {
		self.shared.coops.wait_empty(None);
		self.shared.finalizer.shutdown();
		self.shared.timer.shutdown();
		let dispatchers = self.shared.dispatchers.drain();
		for dispatcher in &dispatchers {
			dispatcher.shutdown();
		}
		for dispatcher in &dispatchers {
			dispatcher.wait();
		}
		tracing::info!(dispatchers = dispatchers.len(), "env.stopped");
	}
}

impl fmt::Debug for Environment {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Environment")
			.field("coops", &self.shared.coops.len())
			.field("stopping", &self.is_stopping())
			.finish()
	}
}
