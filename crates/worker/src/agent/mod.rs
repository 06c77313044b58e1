//! Agents: user state machines wrapped in a shared runtime core.
//!
//! The user type implements [`Agent`]. On [`Coop::add_agent`] it is boxed
//! into an [`AgentCore`], which owns the agent's direct mailbox, its states,
//! its subscription table, its message limits and the slot through which
//! demands reach the dispatcher queue it is bound to.
//!
//! Only one handler of an agent runs at a time: the body sits behind a mutex
//! held for the duration of each hook or event handler.
//!
//! [`Coop::add_agent`]: crate::Coop::add_agent

use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use troupe_sync::Spinlock;

use crate::coop::CoopInner;
use crate::demand::ExecutionDemand;
use crate::disp::{EventQueue, Priority};
use crate::environment::{EnvShared, Environment};
use crate::error::{HandlerError, HandlerResult, StateError, SubscribeError, UnsubscribeError};
use crate::exception::{self, ExceptionReaction};
use crate::ids::{AgentId, CoopId, MailboxId, SubscriptionId};
use crate::limits::{LimitCell, OverflowAction};
use crate::mailbox::Mailbox;
use crate::message::{Envelope, Message, MessageType};
use crate::spawn::panic_message;
use crate::state::{AWAITING_STATE_NAME, DEFAULT_STATE_NAME, State, StateId};

mod context;
mod subscriptions;

pub use context::{Context, SubscriptionBuilder};
pub(crate) use subscriptions::{ErasedHandler, HandlerEntry};
use subscriptions::SubscriptionTable;

/// A user-defined agent.
///
/// Every hook runs on the thread of the dispatcher the agent is bound to,
/// except [`define`](Agent::define), which runs on the thread registering the
/// cooperation.
pub trait Agent: Send + Sized + 'static {
	/// Declares states, message limits and subscriptions.
	///
	/// Called once during cooperation registration; an error rolls the whole
	/// registration back.
	fn define(&mut self, ctx: &mut Context<'_, Self>) -> Result<(), SubscribeError>;

	/// First demand executed after the cooperation becomes active.
	fn on_start(&mut self, _ctx: &mut Context<'_, Self>) -> HandlerResult {
		Ok(())
	}

	/// Last demand executed, once the backlog queued before deregistration
	/// has drained.
	fn on_finish(&mut self, _ctx: &mut Context<'_, Self>) {}

	/// Reaction to faults raised by this agent's handlers.
	fn exception_reaction(&self) -> ExceptionReaction {
		ExceptionReaction::Inherit
	}

	/// Priority used by priority-aware dispatchers.
	fn priority(&self) -> Priority {
		Priority::P0
	}
}

/// Object-safe view of an [`Agent`].
pub(crate) trait ErasedAgent: Send {
	fn define(&mut self, core: &Arc<AgentCore>, env: &Environment) -> Result<(), SubscribeError>;
	fn on_start(&mut self, core: &Arc<AgentCore>, env: &Environment) -> HandlerResult;
	fn on_finish(&mut self, core: &Arc<AgentCore>, env: &Environment);
	fn exception_reaction(&self) -> ExceptionReaction;
	fn as_any_mut(&mut self) -> &mut dyn Any;
}

struct AgentBody<A>(A);

impl<A: Agent> ErasedAgent for AgentBody<A> {
	fn define(&mut self, core: &Arc<AgentCore>, env: &Environment) -> Result<(), SubscribeError> {
		self.0.define(&mut Context::new(core, env))
	}

	fn on_start(&mut self, core: &Arc<AgentCore>, env: &Environment) -> HandlerResult {
		self.0.on_start(&mut Context::new(core, env))
	}

	fn on_finish(&mut self, core: &Arc<AgentCore>, env: &Environment) {
		self.0.on_finish(&mut Context::new(core, env));
	}

	fn exception_reaction(&self) -> ExceptionReaction {
		self.0.exception_reaction()
	}

	fn as_any_mut(&mut self) -> &mut dyn Any {
		&mut self.0
	}
}

/// Where an agent's demands go.
enum SlotQueue {
	/// Not bound yet; demands are buffered and flushed behind the start
	/// demand when the queue is installed.
	Pending(Vec<ExecutionDemand>),
	Bound(Arc<dyn EventQueue>),
	/// Unbound by the finalizer.
	Detached,
}

struct QueueSlot {
	queue: SlotQueue,
	/// Cleared when deregistration begins; no demand is accepted afterwards
	/// except the final `Finish`.
	accepting: bool,
}

/// Runtime side of an agent.
pub(crate) struct AgentCore {
	id: AgentId,
	type_name: &'static str,
	priority: Priority,
	direct: Mailbox,
	env: OnceLock<Weak<EnvShared>>,
	coop: OnceLock<Weak<CoopInner>>,
	current: AtomicU32,
	states: Mutex<Vec<Arc<str>>>,
	subscriptions: Mutex<SubscriptionTable>,
	limits: Mutex<FxHashMap<std::any::TypeId, Arc<LimitCell>>>,
	slot: Spinlock<QueueSlot>,
	finished: AtomicBool,
	body: Mutex<Box<dyn ErasedAgent>>,
}

impl AgentCore {
	pub(crate) fn new<A: Agent>(agent: A) -> Arc<Self> {
		let id = AgentId::next();
		let core = Arc::new(Self {
			id,
			type_name: std::any::type_name::<A>(),
			priority: agent.priority(),
			direct: Mailbox::direct(id),
			env: OnceLock::new(),
			coop: OnceLock::new(),
			current: AtomicU32::new(StateId::DEFAULT.0),
			states: Mutex::new(vec![Arc::from(DEFAULT_STATE_NAME), Arc::from(AWAITING_STATE_NAME)]),
			subscriptions: Mutex::new(SubscriptionTable::default()),
			limits: Mutex::new(FxHashMap::default()),
			slot: Spinlock::new(QueueSlot {
				queue: SlotQueue::Pending(Vec::new()),
				accepting: true,
			}),
			finished: AtomicBool::new(false),
			body: Mutex::new(Box::new(AgentBody(agent))),
		});
		tracing::trace!(agent = %id, agent_type = core.type_name, "agent.created");
		core
	}

	pub(crate) fn id(&self) -> AgentId {
		self.id
	}

	pub(crate) fn priority(&self) -> Priority {
		self.priority
	}

	pub(crate) fn direct_mailbox(&self) -> &Mailbox {
		&self.direct
	}

	/// Links the agent to its environment and cooperation.
	pub(crate) fn attach(&self, env: Weak<EnvShared>, coop: Weak<CoopInner>) {
		let _ = self.env.set(env);
		let _ = self.coop.set(coop);
	}

	pub(crate) fn environment(&self) -> Option<Environment> {
		self.env.get().and_then(Weak::upgrade).map(Environment::from_shared)
	}

	pub(crate) fn coop(&self) -> Option<Arc<CoopInner>> {
		self.coop.get().and_then(Weak::upgrade)
	}

	pub(crate) fn is_finished(&self) -> bool {
		self.finished.load(Ordering::Acquire)
	}

	// States.

	pub(crate) fn state(&self, name: &str) -> State {
		let mut states = self.states.lock();
		let idx = match states.iter().position(|s| &**s == name) {
			Some(idx) => idx,
			None => {
				states.push(Arc::from(name));
				states.len() - 1
			}
		};
		State::new(self.id, StateId(idx as u32), Arc::clone(&states[idx]))
	}

	pub(crate) fn state_name(&self, id: StateId) -> String {
		self.states
			.lock()
			.get(id.0 as usize)
			.map_or_else(|| format!("#{}", id.0), |name| name.to_string())
	}

	pub(crate) fn current_state(&self) -> StateId {
		StateId(self.current.load(Ordering::Acquire))
	}

	pub(crate) fn change_state(&self, target: &State) -> Result<(), StateError> {
		if target.owner() != self.id {
			return Err(StateError::ForeignState(target.name().to_string()));
		}
		let previous = self
			.current
			.fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
				(cur != StateId::AWAITING_DEREGISTRATION.0).then_some(target.id().0)
			})
			.map_err(|_| StateError::AwaitingDeregistration)?;
		if previous != target.id().0 {
			tracing::trace!(agent = %self.id, state = target.name(), "agent.state.changed");
		}
		Ok(())
	}

	/// Enters the terminal state. Irreversible.
	pub(crate) fn switch_to_awaiting_deregistration(&self) {
		self.current.store(StateId::AWAITING_DEREGISTRATION.0, Ordering::Release);
		tracing::debug!(agent = %self.id, "agent.state.awaiting_deregistration");
	}

	// Subscriptions and limits.

	pub(crate) fn subscribe(self: &Arc<Self>, mailbox: &Mailbox, ty: MessageType, states: &[StateId], handler: ErasedHandler) -> Result<(), SubscribeError> {
		let mut table = self.subscriptions.lock();
		for (i, &state) in states.iter().enumerate() {
			if states[..i].contains(&state) || table.contains(mailbox.id(), ty.id(), state) {
				return Err(SubscribeError::AlreadySubscribed {
					message_type: ty.name(),
					state: self.state_name(state),
				});
			}
		}
		let entries: Vec<HandlerEntry> = states
			.iter()
			.map(|&state| HandlerEntry {
				state,
				id: SubscriptionId::next(),
				handler: Arc::clone(&handler),
			})
			.collect();
		let limit = self.limits.lock().get(&ty.id()).cloned();
		mailbox.subscribe(ty, self, &entries, limit)?;
		for entry in &entries {
			table.insert(mailbox, ty.id(), entry.state, entry.id);
		}
		tracing::trace!(agent = %self.id, mailbox = %mailbox.id(), message_type = ty.name(), states = states.len(), "agent.subscribed");
		Ok(())
	}

	pub(crate) fn unsubscribe(&self, mailbox: &Mailbox, ty: MessageType, state: StateId) -> Result<(), UnsubscribeError> {
		let mut table = self.subscriptions.lock();
		if table.remove(mailbox.id(), ty.id(), state).is_none() {
			return Err(UnsubscribeError::NotSubscribed {
				message_type: ty.name(),
				state: self.state_name(state),
			});
		}
		mailbox.unsubscribe(ty, self, state)?;
		tracing::trace!(agent = %self.id, mailbox = %mailbox.id(), message_type = ty.name(), "agent.unsubscribed");
		Ok(())
	}

	pub(crate) fn drop_subscriptions(&self, mailbox: &Mailbox) {
		let mut table = self.subscriptions.lock();
		if let Some(mailbox) = table.remove_mailbox(mailbox.id()) {
			mailbox.drop_agent(self.id);
		}
	}

	/// Removes the agent from every mailbox it subscribed to.
	pub(crate) fn drop_all_subscriptions(&self) {
		let mut table = self.subscriptions.lock();
		let mailboxes = table.take_mailboxes();
		for mailbox in &mailboxes {
			mailbox.drop_agent(self.id);
		}
		tracing::trace!(agent = %self.id, mailboxes = mailboxes.len(), "agent.subscriptions.dropped");
	}

	pub(crate) fn subscription_count(&self) -> usize {
		self.subscriptions.lock().len()
	}

	pub(crate) fn define_limit(&self, ty: MessageType, limit: usize, action: OverflowAction) -> Result<(), SubscribeError> {
		let table = self.subscriptions.lock();
		if table.has_type(ty.id()) {
			return Err(SubscribeError::LimitAfterSubscribe(ty.name()));
		}
		let mut limits = self.limits.lock();
		if limits.contains_key(&ty.id()) {
			return Err(SubscribeError::LimitAlreadyDefined(ty.name()));
		}
		let cell = LimitCell::new(self.id, ty, limit, action);
		tracing::trace!(agent = %self.id, message_type = ty.name(), limit = cell.limit(), "agent.limit.defined");
		limits.insert(ty.id(), Arc::new(cell));
		Ok(())
	}

	pub(crate) fn in_flight(&self, ty: MessageType) -> Option<usize> {
		self.limits.lock().get(&ty.id()).map(|cell| cell.in_flight())
	}

	// Queue slot.

	/// Routes a demand to the agent's queue.
	///
	/// Rejected demands (deregistration begun, or already unbound) are
	/// dropped, which releases their limit slot.
	pub(crate) fn push_demand(&self, demand: ExecutionDemand) {
		let rejected = {
			let mut slot = self.slot.lock();
			if slot.accepting {
				match &mut slot.queue {
					SlotQueue::Pending(buffer) => {
						buffer.push(demand);
						None
					}
					SlotQueue::Bound(queue) => {
						queue.push(demand);
						None
					}
					SlotQueue::Detached => Some(demand),
				}
			} else {
				Some(demand)
			}
		};
		if rejected.is_some() {
			tracing::trace!(agent = %self.id, "agent.demand.rejected");
		}
	}

	/// Installs the dispatcher queue: the start demand goes first, then
	/// whatever was buffered before binding.
	pub(crate) fn install_queue(self: &Arc<Self>, queue: Arc<dyn EventQueue>) {
		let mut slot = self.slot.lock();
		let previous = std::mem::replace(&mut slot.queue, SlotQueue::Bound(Arc::clone(&queue)));
		queue.push(ExecutionDemand::start(Arc::clone(self)));
		if let SlotQueue::Pending(buffer) = previous {
			for demand in buffer {
				queue.push(demand);
			}
		}
	}

	/// Stops accepting demands and queues the final `Finish` behind the
	/// backlog. Returns `false` if this already happened.
	pub(crate) fn begin_deregistration(self: &Arc<Self>) -> bool {
		let mut slot = self.slot.lock();
		if !slot.accepting {
			return false;
		}
		slot.accepting = false;
		let finish = ExecutionDemand::finish(Arc::clone(self));
		match &mut slot.queue {
			SlotQueue::Pending(buffer) => buffer.push(finish),
			SlotQueue::Bound(queue) => queue.push(finish),
			SlotQueue::Detached => {
				tracing::warn!(agent = %self.id, "agent.finish.detached");
				return false;
			}
		}
		true
	}

	/// Disconnects the agent from its queue, discarding anything still
	/// buffered.
	pub(crate) fn detach_queue(&self) {
		let discarded = {
			let mut slot = self.slot.lock();
			slot.accepting = false;
			std::mem::replace(&mut slot.queue, SlotQueue::Detached)
		};
		if let SlotQueue::Pending(buffer) = &discarded
			&& !buffer.is_empty()
		{
			tracing::debug!(agent = %self.id, discarded = buffer.len(), "agent.queue.detached");
		}
	}

	// Execution.

	pub(crate) fn define(self: &Arc<Self>, env: &Environment) -> Result<(), SubscribeError> {
		self.body.lock().define(self, env)
	}

	pub(crate) fn run_start(self: &Arc<Self>, env: &Environment) {
		if self.is_finished() {
			return;
		}
		let mut body = self.body.lock();
		let result = guarded(|| body.on_start(self, env));
		if let Err(error) = result {
			let own = body.exception_reaction();
			drop(body);
			exception::react(self, env, own, &error, "on_start");
		}
	}

	pub(crate) fn run_message(self: &Arc<Self>, env: &Environment, mailbox: MailboxId, handlers: &[HandlerEntry], envelope: &Envelope) {
		if self.is_finished() {
			return;
		}
		let current = self.current_state();
		let Some(entry) = handlers.iter().find(|h| h.state == current) else {
			tracing::trace!(agent = %self.id, message_type = envelope.message_type().name(), "agent.demand.state_skipped");
			return;
		};
		if !self.subscriptions.lock().is_live(mailbox, envelope.message_type().id(), current, entry.id) {
			tracing::trace!(agent = %self.id, message_type = envelope.message_type().name(), "agent.demand.unsubscribed");
			return;
		}

		let mut body = self.body.lock();
		let result = guarded(|| (entry.handler)(body.as_any_mut(), self, env, envelope));
		if let Err(error) = result {
			let own = body.exception_reaction();
			drop(body);
			exception::react(self, env, own, &error, envelope.message_type().name());
		}
	}

	pub(crate) fn run_finish(self: &Arc<Self>, env: &Environment) {
		if self.finished.swap(true, Ordering::AcqRel) {
			return;
		}
		{
			let mut body = self.body.lock();
			if let Err(payload) = catch_unwind(AssertUnwindSafe(|| body.on_finish(self, env))) {
				tracing::error!(agent = %self.id, panic = %panic_message(payload.as_ref()), "agent.on_finish.panicked");
			}
		}
		tracing::trace!(agent = %self.id, "agent.finished");
		if let Some(coop) = self.coop() {
			coop.agent_finished(env);
		}
	}
}

fn guarded(f: impl FnOnce() -> HandlerResult) -> HandlerResult {
	catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| Err(HandlerError::Panicked(panic_message(payload.as_ref()))))
}

/// Shared handle to a registered (or registering) agent.
#[derive(Clone)]
pub struct AgentRef {
	core: Arc<AgentCore>,
}

impl AgentRef {
	pub(crate) fn new(core: Arc<AgentCore>) -> Self {
		Self { core }
	}

	pub(crate) fn core(&self) -> &Arc<AgentCore> {
		&self.core
	}

	/// Agent identity.
	pub fn id(&self) -> AgentId {
		self.core.id
	}

	/// Rust type name of the agent.
	pub fn type_name(&self) -> &'static str {
		self.core.type_name
	}

	/// The agent's direct mailbox.
	pub fn direct_mailbox(&self) -> &Mailbox {
		&self.core.direct
	}

	/// Priority the agent declared.
	pub fn priority(&self) -> Priority {
		self.core.priority
	}

	/// Owning cooperation, once the agent is part of a registration.
	pub fn coop_id(&self) -> Option<CoopId> {
		self.core.coop().map(|coop| coop.id())
	}

	/// Name of the current state.
	pub fn current_state_name(&self) -> String {
		self.core.state_name(self.core.current_state())
	}

	/// Whether the agent awaits deregistration after a fault.
	pub fn is_awaiting_deregistration(&self) -> bool {
		self.core.current_state() == StateId::AWAITING_DEREGISTRATION
	}

	/// Whether `on_finish` has run.
	pub fn is_finished(&self) -> bool {
		self.core.is_finished()
	}

	/// Number of live subscriptions.
	pub fn subscription_count(&self) -> usize {
		self.core.subscription_count()
	}

	/// Queued-but-unfinished demands of type `M`, if `M` is limited.
	pub fn in_flight<M: Message>(&self) -> Option<usize> {
		self.core.in_flight(MessageType::of::<M>())
	}
}

impl PartialEq for AgentRef {
	fn eq(&self, other: &Self) -> bool {
		Arc::ptr_eq(&self.core, &other.core)
	}
}

impl Eq for AgentRef {}

impl fmt::Debug for AgentRef {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("AgentRef")
			.field("id", &self.core.id)
			.field("type", &self.core.type_name)
			.finish()
	}
}
