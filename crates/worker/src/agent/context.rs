use std::any::Any;
use std::marker::PhantomData;
use std::sync::Arc;

use super::{Agent, AgentCore, AgentRef, ErasedHandler};
use crate::coop::DeregReason;
use crate::environment::Environment;
use crate::error::{DeregisterError, HandlerResult, StateError, SubscribeError, UnsubscribeError};
use crate::ids::AgentId;
use crate::limits::OverflowAction;
use crate::mailbox::Mailbox;
use crate::message::{Envelope, Message, MessageType};
use crate::state::{State, StateId};

/// Agent's view of the runtime, passed to every hook and handler.
pub struct Context<'a, A: Agent> {
	core: &'a Arc<AgentCore>,
	env: &'a Environment,
	_agent: PhantomData<fn(&mut A)>,
}

impl<'a, A: Agent> Context<'a, A> {
	pub(crate) fn new(core: &'a Arc<AgentCore>, env: &'a Environment) -> Self {
		Self {
			core,
			env,
			_agent: PhantomData,
		}
	}

	/// This agent's identity.
	pub fn agent_id(&self) -> AgentId {
		self.core.id()
	}

	/// Shared handle to this agent.
	pub fn agent_ref(&self) -> AgentRef {
		AgentRef::new(Arc::clone(self.core))
	}

	/// The environment the agent runs in.
	pub fn environment(&self) -> &Environment {
		self.env
	}

	/// This agent's direct mailbox.
	pub fn direct_mailbox(&self) -> &Mailbox {
		self.core.direct_mailbox()
	}

	/// Returns the state named `name`, creating it on first use.
	pub fn state(&self, name: &str) -> State {
		self.core.state(name)
	}

	/// The state every agent starts in.
	pub fn default_state(&self) -> State {
		self.core.state(crate::state::DEFAULT_STATE_NAME)
	}

	/// The state the agent is currently in.
	pub fn current_state(&self) -> State {
		let id = self.core.current_state();
		self.core.state(&self.core.state_name(id))
	}

	/// Whether the agent is currently in `state`.
	pub fn is_in(&self, state: &State) -> bool {
		state.owner() == self.core.id() && self.core.current_state() == state.id()
	}

	/// Switches the current state. Takes effect for demands executed after
	/// this handler returns.
	pub fn change_state(&mut self, state: &State) -> Result<(), StateError> {
		self.core.change_state(state)
	}

	/// Starts a subscription to `mailbox`. Without
	/// [`in_state`](SubscriptionBuilder::in_state) the handler is bound to the
	/// default state.
	pub fn subscribe(&self, mailbox: &Mailbox) -> SubscriptionBuilder<'_, 'a, A> {
		SubscriptionBuilder {
			ctx: self,
			mailbox: mailbox.clone(),
			states: Vec::new(),
		}
	}

	/// Starts a subscription to this agent's direct mailbox.
	pub fn subscribe_self(&self) -> SubscriptionBuilder<'_, 'a, A> {
		let mailbox = self.core.direct_mailbox().clone();
		SubscriptionBuilder {
			ctx: self,
			mailbox,
			states: Vec::new(),
		}
	}

	/// Removes the handler for `M` on `mailbox` in `state`.
	///
	/// Demands already queued for it are skipped when they execute.
	pub fn unsubscribe<M: Message>(&self, mailbox: &Mailbox, state: &State) -> Result<(), UnsubscribeError> {
		let ty = MessageType::of::<M>();
		if state.owner() != self.core.id() {
			return Err(UnsubscribeError::NotSubscribed {
				message_type: ty.name(),
				state: state.name().to_string(),
			});
		}
		self.core.unsubscribe(mailbox, ty, state.id())
	}

	/// Removes every handler this agent has on `mailbox`.
	pub fn drop_subscriptions(&self, mailbox: &Mailbox) {
		self.core.drop_subscriptions(mailbox);
	}

	/// Limits queued `M` demands to `limit`; extra messages are dropped.
	pub fn limit_then_drop<M: Message>(&self, limit: usize) -> Result<(), SubscribeError> {
		self.core.define_limit(MessageType::of::<M>(), limit, OverflowAction::Drop)
	}

	/// Limits queued `M` demands to `limit`; an extra message aborts the
	/// process.
	pub fn limit_then_abort<M: Message>(&self, limit: usize) -> Result<(), SubscribeError> {
		self.core.define_limit(MessageType::of::<M>(), limit, OverflowAction::AbortProcess)
	}

	/// Limits queued `M` demands to `limit`; extra messages go to `target`.
	pub fn limit_then_redirect<M: Message>(&self, limit: usize, target: &Mailbox) -> Result<(), SubscribeError> {
		self.core.define_limit(MessageType::of::<M>(), limit, OverflowAction::RedirectToMailbox(target.clone()))
	}

	/// Limits queued `M` demands to `limit`; extra messages go to `target`'s
	/// direct mailbox.
	pub fn limit_then_redirect_to_agent<M: Message>(&self, limit: usize, target: &AgentRef) -> Result<(), SubscribeError> {
		self.core.define_limit(
			MessageType::of::<M>(),
			limit,
			OverflowAction::RedirectToAgent {
				agent: target.id(),
				mailbox: target.direct_mailbox().clone(),
			},
		)
	}

	/// Limits queued `M` demands to `limit`; extra messages are mapped by
	/// `transform` to a new destination and payload, or dropped on `None`.
	pub fn limit_then_transform<M, F>(&self, limit: usize, transform: F) -> Result<(), SubscribeError>
	where
		M: Message,
		F: Fn(&M) -> Option<(Mailbox, Envelope)> + Send + Sync + 'static,
	{
		let action = OverflowAction::Transform(Arc::new(move |envelope: &Envelope| envelope.downcast_ref::<M>().and_then(&transform)));
		self.core.define_limit(MessageType::of::<M>(), limit, action)
	}

	/// Name of the owning cooperation.
	pub fn coop_name(&self) -> Option<String> {
		self.core.coop().map(|coop| coop.name().to_string())
	}

	/// Deregisters the owning cooperation.
	pub fn deregister_coop(&self, reason: DeregReason) -> Result<(), DeregisterError> {
		match self.core.coop() {
			Some(coop) => self.env.deregister_coop_inner(&coop, reason),
			None => Err(DeregisterError::NotFound(format!("<coop of {}>", self.core.id()))),
		}
	}
}

/// Pending subscription started by [`Context::subscribe`].
pub struct SubscriptionBuilder<'c, 'a, A: Agent> {
	ctx: &'c Context<'a, A>,
	mailbox: Mailbox,
	states: Vec<StateId>,
}

impl<A: Agent> SubscriptionBuilder<'_, '_, A> {
	/// Binds the handler to `state` as well. May be repeated.
	pub fn in_state(mut self, state: &State) -> Result<Self, SubscribeError> {
		if state.owner() != self.ctx.core.id() {
			return Err(SubscribeError::ForeignState(state.name().to_string()));
		}
		self.states.push(state.id());
		Ok(self)
	}

	/// Registers `handler` for messages of type `M`.
	pub fn event<M, F>(self, handler: F) -> Result<(), SubscribeError>
	where
		M: Message,
		F: Fn(&mut A, &mut Context<'_, A>, &M) -> HandlerResult + Send + Sync + 'static,
	{
		let states = if self.states.is_empty() { vec![StateId::DEFAULT] } else { self.states };
		let erased: ErasedHandler = Arc::new(move |agent: &mut dyn Any, core: &Arc<AgentCore>, env: &Environment, envelope: &Envelope| {
			let (Some(agent), Some(message)) = (agent.downcast_mut::<A>(), envelope.downcast_ref::<M>()) else {
				return Ok(());
			};
			handler(agent, &mut Context::new(core, env), message)
		});
		self.ctx.core.subscribe(&self.mailbox, MessageType::of::<M>(), &states, erased)
	}
}
