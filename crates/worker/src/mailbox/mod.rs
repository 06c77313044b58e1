//! Mailboxes: type-indexed subscriber chains and the delivery path.
//!
//! A mailbox maps each message type to an ordered chain of subscribers, one
//! link per agent carrying that agent's handlers for the type (one per
//! state). Delivery snapshots the chain under the read lock and pushes one
//! execution demand per accepting agent into the agent's own queue. Which
//! handler runs is decided when the demand executes, against the agent's
//! state at that moment.
//!
//! Chain mutation takes the write lock; deliveries of any types proceed in
//! parallel under the read lock.

use std::any::TypeId;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::agent::{AgentCore, HandlerEntry};
use crate::demand::ExecutionDemand;
use crate::error::{SubscribeError, UnsubscribeError};
use crate::ids::{AgentId, MailboxId};
use crate::limits::LimitCell;
use crate::message::{Envelope, Message, MessageType};
use crate::state::StateId;

mod named;

pub(crate) use named::NamedMailboxes;

/// Who may subscribe to a mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxKind {
	/// Multi-producer, multi-consumer: any agent may subscribe.
	Multi,
	/// Multi-producer, single-consumer: only the owning agent may subscribe.
	Direct {
		/// The owning agent.
		owner: AgentId,
	},
}

/// One (agent, state) pair subscribed to a message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberInfo {
	/// Subscribed agent.
	pub agent: AgentId,
	/// State the handler is bound to.
	pub state: StateId,
}

/// Chain link for one agent.
struct Subscriber {
	agent: Arc<AgentCore>,
	handlers: Arc<[HandlerEntry]>,
	limit: Option<Arc<LimitCell>>,
}

type Chains = FxHashMap<TypeId, Vec<Subscriber>>;

pub(crate) struct MailboxInner {
	id: MailboxId,
	name: Option<Arc<str>>,
	kind: MailboxKind,
	chains: RwLock<Chains>,
	registry: Option<Weak<NamedMailboxes>>,
}

impl Drop for MailboxInner {
	fn drop(&mut self) {
		if let (Some(name), Some(registry)) = (&self.name, self.registry.as_ref().and_then(Weak::upgrade)) {
			registry.release(name);
		}
	}
}

/// Shared handle to a mailbox.
///
/// Cloning shares the mailbox. A named mailbox stays interned while any
/// handle to it exists.
#[derive(Clone)]
pub struct Mailbox {
	inner: Arc<MailboxInner>,
}

impl Mailbox {
	fn from_parts(name: Option<Arc<str>>, kind: MailboxKind, registry: Option<Weak<NamedMailboxes>>) -> Self {
		let mailbox = Self {
			inner: Arc::new(MailboxInner {
				id: MailboxId::next(),
				name,
				kind,
				chains: RwLock::new(Chains::default()),
				registry,
			}),
		};
		tracing::trace!(mailbox = %mailbox.id(), kind = ?kind, name = ?mailbox.name(), "mailbox.created");
		mailbox
	}

	/// Creates an anonymous multi-consumer mailbox.
	pub fn anonymous() -> Self {
		Self::from_parts(None, MailboxKind::Multi, None)
	}

	pub(crate) fn direct(owner: AgentId) -> Self {
		Self::from_parts(None, MailboxKind::Direct { owner }, None)
	}

	pub(crate) fn named(name: Arc<str>, registry: Weak<NamedMailboxes>) -> Self {
		Self::from_parts(Some(name), MailboxKind::Multi, Some(registry))
	}

	pub(crate) fn downgrade(&self) -> Weak<MailboxInner> {
		Arc::downgrade(&self.inner)
	}

	pub(crate) fn upgrade(weak: &Weak<MailboxInner>) -> Option<Self> {
		weak.upgrade().map(|inner| Self { inner })
	}

	/// Mailbox identity.
	pub fn id(&self) -> MailboxId {
		self.inner.id
	}

	/// Interned name, `None` for anonymous and direct mailboxes.
	pub fn name(&self) -> Option<&str> {
		self.inner.name.as_deref()
	}

	/// Subscription policy.
	pub fn kind(&self) -> MailboxKind {
		self.inner.kind
	}

	/// Whether this is an agent's direct mailbox.
	pub fn is_direct(&self) -> bool {
		matches!(self.inner.kind, MailboxKind::Direct { .. })
	}

	/// Sends a message to every current subscriber of its type.
	pub fn send<M: Message>(&self, message: M) {
		self.deliver(Envelope::new(message));
	}

	/// Delivers an envelope to every current subscriber of its type.
	///
	/// Best effort: subscribers whose cooperation is deregistering are
	/// skipped, and limit overflows run their configured action.
	pub fn deliver(&self, envelope: Envelope) {
		self.deliver_at_depth(envelope, 0);
	}

	/// Delivery that is the `depth`-th redirection of some original message.
	pub(crate) fn deliver_at_depth(&self, envelope: Envelope, depth: u32) {
		let ty = envelope.message_type();
		let mut overflowed: Vec<Arc<LimitCell>> = Vec::new();
		{
			let chains = self.inner.chains.read();
			let Some(chain) = chains.get(&ty.id()) else {
				tracing::trace!(mailbox = %self.id(), message_type = ty.name(), "mailbox.deliver.no_subscribers");
				return;
			};
			for sub in chain {
				let slot = match &sub.limit {
					Some(limit) => match limit.try_acquire() {
						Some(slot) => Some(slot),
						None => {
							overflowed.push(Arc::clone(limit));
							continue;
						}
					},
					None => None,
				};
				let demand = ExecutionDemand::message(Arc::clone(&sub.agent), self.id(), Arc::clone(&sub.handlers), envelope.clone(), slot);
				sub.agent.push_demand(demand);
			}
		}
		// Overflow actions may redirect into mailboxes, including this one, so
		// they run after the read lock is released.
		for limit in overflowed {
			limit.overflow(&envelope, depth);
		}
	}

	/// Ordered (agent, state) pairs subscribed to `ty`.
	pub fn subscribers(&self, ty: MessageType) -> Vec<SubscriberInfo> {
		let chains = self.inner.chains.read();
		chains
			.get(&ty.id())
			.map(|chain| {
				chain
					.iter()
					.flat_map(|sub| {
						let agent = sub.agent.id();
						sub.handlers.iter().map(move |h| SubscriberInfo { agent, state: h.state })
					})
					.collect()
			})
			.unwrap_or_default()
	}

	/// Number of agents subscribed to `ty`.
	pub fn subscriber_count(&self, ty: MessageType) -> usize {
		self.inner.chains.read().get(&ty.id()).map_or(0, Vec::len)
	}

	/// Whether any agent is subscribed to any type.
	pub fn has_subscribers(&self) -> bool {
		!self.inner.chains.read().is_empty()
	}

	/// Appends handler entries for `agent` to the chain of `ty`.
	///
	/// Caller holds the agent's subscription table lock.
	pub(crate) fn subscribe(
		&self,
		ty: MessageType,
		agent: &Arc<AgentCore>,
		entries: &[HandlerEntry],
		limit: Option<Arc<LimitCell>>,
	) -> Result<(), SubscribeError> {
		if let MailboxKind::Direct { owner } = self.inner.kind
			&& owner != agent.id()
		{
			return Err(SubscribeError::IllegalSubscriber(self.id()));
		}

		let mut chains = self.inner.chains.write();
		let chain = chains.entry(ty.id()).or_default();
		match chain.iter_mut().find(|sub| sub.agent.id() == agent.id()) {
			Some(sub) => {
				if let Some(dup) = entries.iter().find(|e| sub.handlers.iter().any(|h| h.state == e.state)) {
					return Err(SubscribeError::AlreadySubscribed {
						message_type: ty.name(),
						state: agent.state_name(dup.state),
					});
				}
				let mut handlers = sub.handlers.to_vec();
				handlers.extend(entries.iter().cloned());
				sub.handlers = handlers.into();
			}
			None => chain.push(Subscriber {
				agent: Arc::clone(agent),
				handlers: entries.to_vec().into(),
				limit,
			}),
		}
		Ok(())
	}

	/// Removes the handler of `agent` for (`ty`, `state`).
	pub(crate) fn unsubscribe(&self, ty: MessageType, agent: &AgentCore, state: StateId) -> Result<(), UnsubscribeError> {
		let not_subscribed = || UnsubscribeError::NotSubscribed {
			message_type: ty.name(),
			state: agent.state_name(state),
		};

		let mut chains = self.inner.chains.write();
		let chain = chains.get_mut(&ty.id()).ok_or_else(not_subscribed)?;
		let pos = chain.iter().position(|sub| sub.agent.id() == agent.id()).ok_or_else(not_subscribed)?;
		let sub = &mut chain[pos];
		if !sub.handlers.iter().any(|h| h.state == state) {
			return Err(not_subscribed());
		}
		let remaining: Vec<_> = sub.handlers.iter().filter(|h| h.state != state).cloned().collect();
		if remaining.is_empty() {
			chain.remove(pos);
			if chain.is_empty() {
				chains.remove(&ty.id());
			}
		} else {
			sub.handlers = remaining.into();
		}
		Ok(())
	}

	/// Removes every chain link of `agent`.
	pub(crate) fn drop_agent(&self, agent: AgentId) {
		let mut chains = self.inner.chains.write();
		chains.retain(|_, chain| {
			chain.retain(|sub| sub.agent.id() != agent);
			!chain.is_empty()
		});
	}
}

impl PartialEq for Mailbox {
	fn eq(&self, other: &Self) -> bool {
		Arc::ptr_eq(&self.inner, &other.inner)
	}
}

impl Eq for Mailbox {}

impl fmt::Debug for Mailbox {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Mailbox")
			.field("id", &self.inner.id)
			.field("name", &self.inner.name)
			.field("kind", &self.inner.kind)
			.finish()
	}
}
