//! Per-agent, per-type bounds on outstanding demands.
//!
//! A limit counts demands that were queued for an agent but have not finished
//! executing. A delivery that would push the count past the limit runs the
//! overflow action instead of queueing. The slot is released when the demand
//! is dropped, which covers normal completion, handler faults, skipped
//! demands and demands discarded by a stopped queue alike.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::ids::AgentId;
use crate::mailbox::Mailbox;
use crate::message::{Envelope, MessageType};

/// Maximum chain of overflow redirections for one delivery.
///
/// Exceeding it means limits redirect into each other; this is treated as a
/// fatal configuration error.
pub const MAX_REDIRECT_DEPTH: u32 = 32;

/// Maps an overflowing message to a new destination and payload.
pub type TransformFn = dyn Fn(&Envelope) -> Option<(Mailbox, Envelope)> + Send + Sync;

/// Reaction to a delivery that would exceed a limit.
#[derive(Clone)]
pub enum OverflowAction {
	/// Discard the message.
	Drop,
	/// Terminate the process.
	AbortProcess,
	/// Deliver the same message to another mailbox.
	RedirectToMailbox(Mailbox),
	/// Deliver the same message to another agent's direct mailbox.
	RedirectToAgent {
		/// Target agent.
		agent: AgentId,
		/// Its direct mailbox.
		mailbox: Mailbox,
	},
	/// Deliver a transformed message; `None` discards it.
	Transform(Arc<TransformFn>),
}

impl fmt::Debug for OverflowAction {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Drop => f.write_str("Drop"),
			Self::AbortProcess => f.write_str("AbortProcess"),
			Self::RedirectToMailbox(m) => write!(f, "RedirectToMailbox({})", m.id()),
			Self::RedirectToAgent { agent, .. } => write!(f, "RedirectToAgent({agent})"),
			Self::Transform(_) => f.write_str("Transform"),
		}
	}
}

/// Limit state for one (agent, message type) pair.
pub(crate) struct LimitCell {
	owner: AgentId,
	ty: MessageType,
	limit: usize,
	in_flight: AtomicUsize,
	overflows: AtomicU64,
	action: OverflowAction,
}

impl LimitCell {
	pub(crate) fn new(owner: AgentId, ty: MessageType, limit: usize, action: OverflowAction) -> Self {
		Self {
			owner,
			ty,
			limit,
			in_flight: AtomicUsize::new(0),
			overflows: AtomicU64::new(0),
			action,
		}
	}

	/// Reserves one slot, or `None` if the limit is reached.
	///
	/// The count never observably exceeds the limit.
	pub(crate) fn try_acquire(self: &Arc<Self>) -> Option<LimitSlot> {
		self.in_flight
			.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < self.limit).then_some(n + 1))
			.ok()
			.map(|_| LimitSlot { cell: Arc::clone(self) })
	}

	pub(crate) fn in_flight(&self) -> usize {
		self.in_flight.load(Ordering::Acquire)
	}

	pub(crate) fn limit(&self) -> usize {
		self.limit
	}

	/// Runs the overflow action for a delivery made at redirect `depth`.
	pub(crate) fn overflow(&self, envelope: &Envelope, depth: u32) {
		let count = self.overflows.fetch_add(1, Ordering::Relaxed);
		match &self.action {
			OverflowAction::Drop => {
				if count % 1024 == 0 {
					tracing::warn!(
						agent = %self.owner,
						message_type = self.ty.name(),
						limit = self.limit,
						drops = count + 1,
						"limit.overflow.drop"
					);
				}
			}
			OverflowAction::AbortProcess => {
				tracing::error!(
					agent = %self.owner,
					message_type = self.ty.name(),
					limit = self.limit,
					"limit.overflow.abort"
				);
				std::process::abort();
			}
			OverflowAction::RedirectToMailbox(target) | OverflowAction::RedirectToAgent { mailbox: target, .. } => {
				tracing::trace!(agent = %self.owner, target = %target.id(), depth, "limit.overflow.redirect");
				redirect(target, envelope.clone(), depth);
			}
			OverflowAction::Transform(transform) => match transform(envelope) {
				Some((target, transformed)) => {
					tracing::trace!(agent = %self.owner, target = %target.id(), depth, "limit.overflow.transform");
					redirect(&target, transformed, depth);
				}
				None => tracing::trace!(agent = %self.owner, "limit.overflow.transform_dropped"),
			},
		}
	}
}

fn redirect(target: &Mailbox, envelope: Envelope, depth: u32) {
	let next = depth + 1;
	if next > MAX_REDIRECT_DEPTH {
		tracing::error!(
			mailbox = %target.id(),
			message_type = envelope.message_type().name(),
			depth = next,
			"limit.redirect.too_deep"
		);
		std::process::abort();
	}
	target.deliver_at_depth(envelope, next);
}

/// One reserved slot of a [`LimitCell`], released on drop.
pub(crate) struct LimitSlot {
	cell: Arc<LimitCell>,
}

impl Drop for LimitSlot {
	fn drop(&mut self) {
		self.cell.in_flight.fetch_sub(1, Ordering::AcqRel);
	}
}
