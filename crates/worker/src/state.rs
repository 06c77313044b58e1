use std::fmt;
use std::sync::Arc;

use crate::ids::AgentId;

/// Index of a state within its agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateId(pub(crate) u32);

impl StateId {
	/// Every agent starts here.
	pub const DEFAULT: Self = Self(0);
	/// Terminal state entered after an unhandled fault; no handler runs in it.
	pub const AWAITING_DEREGISTRATION: Self = Self(1);

	/// Raw index.
	pub const fn get(self) -> u32 {
		self.0
	}
}

pub(crate) const DEFAULT_STATE_NAME: &str = "<default>";
pub(crate) const AWAITING_STATE_NAME: &str = "<awaiting_deregistration>";

/// Named state of one agent.
///
/// States are interned per agent by name (see
/// [`Context::state`](crate::Context::state)); two lookups of the same name
/// yield equal values.
#[derive(Clone)]
pub struct State {
	owner: AgentId,
	id: StateId,
	name: Arc<str>,
}

impl State {
	pub(crate) fn new(owner: AgentId, id: StateId, name: Arc<str>) -> Self {
		Self { owner, id, name }
	}

	/// Agent owning this state.
	pub fn owner(&self) -> AgentId {
		self.owner
	}

	/// Index within the owner.
	pub fn id(&self) -> StateId {
		self.id
	}

	/// State name.
	pub fn name(&self) -> &str {
		&self.name
	}
}

impl PartialEq for State {
	fn eq(&self, other: &Self) -> bool {
		self.owner == other.owner && self.id == other.id
	}
}

impl Eq for State {}

impl fmt::Debug for State {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "State({}:{})", self.owner, self.name)
	}
}
