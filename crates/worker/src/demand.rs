//! Units of work pushed into dispatcher queues.

use std::fmt;
use std::sync::Arc;

use crate::agent::{AgentCore, HandlerEntry};
use crate::disp::Priority;
use crate::ids::{AgentId, MailboxId};
use crate::limits::LimitSlot;
use crate::message::Envelope;

enum DemandKind {
	Start,
	Message {
		mailbox: MailboxId,
		handlers: Arc<[HandlerEntry]>,
		envelope: Envelope,
		/// Released when the demand is dropped, after execution or discard.
		_slot: Option<LimitSlot>,
	},
	Finish,
}

/// One pending execution for one agent: its start hook, a message handler
/// or its finish hook.
///
/// Dispatchers own demands until a worker calls [`execute`](Self::execute).
/// A dropped demand never runs.
pub struct ExecutionDemand {
	agent: Arc<AgentCore>,
	kind: DemandKind,
}

impl ExecutionDemand {
	pub(crate) fn start(agent: Arc<AgentCore>) -> Self {
		Self { agent, kind: DemandKind::Start }
	}

	pub(crate) fn finish(agent: Arc<AgentCore>) -> Self {
		Self { agent, kind: DemandKind::Finish }
	}

	pub(crate) fn message(agent: Arc<AgentCore>, mailbox: MailboxId, handlers: Arc<[HandlerEntry]>, envelope: Envelope, slot: Option<LimitSlot>) -> Self {
		Self {
			agent,
			kind: DemandKind::Message {
				mailbox,
				handlers,
				envelope,
				_slot: slot,
			},
		}
	}

	/// Agent the demand is for.
	pub fn agent_id(&self) -> AgentId {
		self.agent.id()
	}

	/// Priority of the agent the demand is for.
	pub fn priority(&self) -> Priority {
		self.agent.priority()
	}

	/// Short label for tracing.
	pub fn kind_name(&self) -> &'static str {
		match &self.kind {
			DemandKind::Start => "start",
			DemandKind::Message { envelope, .. } => envelope.message_type().name(),
			DemandKind::Finish => "finish",
		}
	}

	/// Runs the demand on the calling thread.
	///
	/// Faults are routed to the agent's exception reaction; this never
	/// panics unless the reaction aborts the process.
	pub fn execute(self) {
		let Some(env) = self.agent.environment() else {
			tracing::trace!(agent = %self.agent.id(), demand = self.kind_name(), "demand.dropped.no_environment");
			return;
		};
		match &self.kind {
			DemandKind::Start => self.agent.run_start(&env),
			DemandKind::Message {
				mailbox, handlers, envelope, ..
			} => self.agent.run_message(&env, *mailbox, handlers, envelope),
			DemandKind::Finish => self.agent.run_finish(&env),
		}
	}
}

impl fmt::Debug for ExecutionDemand {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ExecutionDemand")
			.field("agent", &self.agent.id())
			.field("kind", &self.kind_name())
			.finish()
	}
}
