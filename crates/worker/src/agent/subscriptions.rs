use std::any::{Any, TypeId};
use std::sync::Arc;

use rustc_hash::FxHashMap;

use super::AgentCore;
use crate::environment::Environment;
use crate::error::HandlerResult;
use crate::ids::{MailboxId, SubscriptionId};
use crate::mailbox::Mailbox;
use crate::message::Envelope;
use crate::state::StateId;

/// Type-erased event handler: downcasts the agent and the payload, then
/// calls the typed closure.
pub(crate) type ErasedHandler = Arc<dyn Fn(&mut dyn Any, &Arc<AgentCore>, &Environment, &Envelope) -> HandlerResult + Send + Sync>;

/// Handler for one state, as stored in a mailbox chain link.
#[derive(Clone)]
pub(crate) struct HandlerEntry {
	pub(crate) state: StateId,
	pub(crate) id: SubscriptionId,
	pub(crate) handler: ErasedHandler,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Key {
	mailbox: MailboxId,
	ty: TypeId,
	state: StateId,
}

/// Agent-side record of live subscriptions.
///
/// Authoritative for "is this subscription still live": a demand carries the
/// subscription id it was created for and executes only if the table still
/// maps its (mailbox, type, state) to that id.
#[derive(Default)]
pub(crate) struct SubscriptionTable {
	entries: FxHashMap<Key, SubscriptionId>,
	mailboxes: FxHashMap<MailboxId, (Mailbox, usize)>,
}

impl SubscriptionTable {
	pub(crate) fn contains(&self, mailbox: MailboxId, ty: TypeId, state: StateId) -> bool {
		self.entries.contains_key(&Key { mailbox, ty, state })
	}

	pub(crate) fn insert(&mut self, mailbox: &Mailbox, ty: TypeId, state: StateId, id: SubscriptionId) {
		let key = Key {
			mailbox: mailbox.id(),
			ty,
			state,
		};
		if self.entries.insert(key, id).is_none() {
			self.mailboxes.entry(mailbox.id()).or_insert_with(|| (mailbox.clone(), 0)).1 += 1;
		}
	}

	pub(crate) fn remove(&mut self, mailbox: MailboxId, ty: TypeId, state: StateId) -> Option<SubscriptionId> {
		let id = self.entries.remove(&Key { mailbox, ty, state })?;
		if let Some((_, count)) = self.mailboxes.get_mut(&mailbox) {
			*count -= 1;
			if *count == 0 {
				self.mailboxes.remove(&mailbox);
			}
		}
		Some(id)
	}

	pub(crate) fn is_live(&self, mailbox: MailboxId, ty: TypeId, state: StateId, id: SubscriptionId) -> bool {
		self.entries.get(&Key { mailbox, ty, state }) == Some(&id)
	}

	/// Whether any subscription to `ty` exists, on any mailbox.
	pub(crate) fn has_type(&self, ty: TypeId) -> bool {
		self.entries.keys().any(|k| k.ty == ty)
	}

	/// Forgets every subscription on `mailbox`, returning the handle if any
	/// existed.
	pub(crate) fn remove_mailbox(&mut self, mailbox: MailboxId) -> Option<Mailbox> {
		self.entries.retain(|k, _| k.mailbox != mailbox);
		self.mailboxes.remove(&mailbox).map(|(m, _)| m)
	}

	/// Forgets everything, returning the mailboxes that had subscriptions.
	pub(crate) fn take_mailboxes(&mut self) -> Vec<Mailbox> {
		self.entries.clear();
		self.mailboxes.drain().map(|(_, (m, _))| m).collect()
	}

	pub(crate) fn len(&self) -> usize {
		self.entries.len()
	}
}
