use std::sync::{Arc, Weak};

use rustc_hash::FxHashMap;
use troupe_sync::MutexPool;

use super::{Mailbox, MailboxInner};

/// Interning dictionary for named mailboxes, owned by one environment.
///
/// Entries are weak: a named mailbox lives exactly as long as some handle to
/// it, and its entry is removed when the last handle goes away. Lookups of
/// one name always observe one logical mailbox at a time.
pub(crate) struct NamedMailboxes {
	shards: MutexPool<FxHashMap<Arc<str>, Weak<MailboxInner>>>,
}

impl NamedMailboxes {
	pub(crate) fn new(shards: usize) -> Arc<Self> {
		Arc::new(Self {
			shards: MutexPool::with_default(shards.max(1)),
		})
	}

	/// Returns the live mailbox for `name`, creating it if needed.
	pub(crate) fn get_or_create(self: &Arc<Self>, name: &str) -> Mailbox {
		let mut shard = self.shards.lock(name);
		if let Some(existing) = shard.get(name).and_then(Mailbox::upgrade) {
			return existing;
		}
		let name: Arc<str> = Arc::from(name);
		let mailbox = Mailbox::named(Arc::clone(&name), Arc::downgrade(self));
		shard.insert(name, mailbox.downgrade());
		tracing::debug!(mailbox = %mailbox.id(), name = %mailbox.name().unwrap_or_default(), "mailbox.named.created");
		mailbox
	}

	/// Drops the entry for `name` if no live mailbox backs it any more.
	///
	/// Called from the mailbox destructor. A concurrent `get_or_create` may
	/// already have replaced the entry with a fresh mailbox, which is kept.
	pub(super) fn release(&self, name: &str) {
		let mut shard = self.shards.lock(name);
		if shard.get(name).is_some_and(|weak| weak.strong_count() == 0) {
			shard.remove(name);
			tracing::debug!(name, "mailbox.named.released");
		}
	}

	/// Number of interned names.
	#[cfg(test)]
	pub(crate) fn len(&self) -> usize {
		self.shards.iter().map(|shard| shard.lock().len()).sum()
	}
}
