use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic id clock.
#[derive(Debug)]
pub(crate) struct IdClock {
	next: AtomicU64,
}

impl IdClock {
	/// Creates a clock whose first id is 1.
	pub const fn new() -> Self {
		Self { next: AtomicU64::new(0) }
	}

	/// Returns the next id.
	pub fn next(&self) -> u64 {
		self.next.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
	}
}

macro_rules! define_id {
	($(#[$meta:meta])* $name:ident, $prefix:literal) => {
		$(#[$meta])*
		#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
		pub struct $name(u64);

		impl $name {
			pub(crate) fn next() -> Self {
				static CLOCK: IdClock = IdClock::new();
				Self(CLOCK.next())
			}

			/// Raw numeric value.
			pub const fn get(self) -> u64 {
				self.0
			}
		}

		impl fmt::Display for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				write!(f, concat!($prefix, "#{}"), self.0)
			}
		}
	};
}

define_id!(
	/// Unique mailbox identity.
	MailboxId,
	"mbox"
);
define_id!(
	/// Unique agent identity.
	AgentId,
	"agent"
);
define_id!(
	/// Unique cooperation identity (names may be reused after destruction).
	CoopId,
	"coop"
);
define_id!(
	/// Identity of one (mailbox, type, state) subscription of an agent.
	SubscriptionId,
	"sub"
);
define_id!(
	/// Identity of a scheduled timer.
	TimerId,
	"timer"
);
