//! Message identity and the immutable envelope shared by every demand of a
//! publish.

use std::any::{Any, TypeId};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Anything that can be sent through a mailbox.
///
/// Messages are immutable once sent and shared between all receivers, hence
/// `Sync`. Unit structs serve as signals.
pub trait Message: Any + Send + Sync {}

impl<T: Any + Send + Sync> Message for T {}

/// Runtime identity of a message type.
#[derive(Clone, Copy)]
pub struct MessageType {
	id: TypeId,
	name: &'static str,
}

impl MessageType {
	/// Identity of `M`.
	pub fn of<M: Message>() -> Self {
		Self {
			id: TypeId::of::<M>(),
			name: std::any::type_name::<M>(),
		}
	}

	/// Type id used for subscription lookup.
	pub fn id(&self) -> TypeId {
		self.id
	}

	/// Fully-qualified type name, for diagnostics.
	pub fn name(&self) -> &'static str {
		self.name
	}
}

impl PartialEq for MessageType {
	fn eq(&self, other: &Self) -> bool {
		self.id == other.id
	}
}

impl Eq for MessageType {}

impl Hash for MessageType {
	fn hash<H: Hasher>(&self, state: &mut H) {
		self.id.hash(state);
	}
}

impl fmt::Debug for MessageType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.name)
	}
}

/// Immutable payload plus its type identity.
///
/// Cloning is cheap and shares the payload.
#[derive(Clone)]
pub struct Envelope {
	ty: MessageType,
	payload: Arc<dyn Any + Send + Sync>,
}

impl Envelope {
	/// Wraps a message.
	pub fn new<M: Message>(message: M) -> Self {
		Self {
			ty: MessageType::of::<M>(),
			payload: Arc::new(message),
		}
	}

	/// Type of the payload.
	pub fn message_type(&self) -> MessageType {
		self.ty
	}

	/// Borrows the payload as `M`, if it is one.
	pub fn downcast_ref<M: Message>(&self) -> Option<&M> {
		self.payload.downcast_ref::<M>()
	}

	/// Whether both envelopes share one payload allocation.
	pub fn ptr_eq(&self, other: &Self) -> bool {
		Arc::ptr_eq(&self.payload, &other.payload)
	}
}

impl fmt::Debug for Envelope {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Envelope").field("type", &self.ty).finish_non_exhaustive()
	}
}
