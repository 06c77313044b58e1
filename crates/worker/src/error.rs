//! Error types for the runtime's fallible operations.

use std::path::PathBuf;

use thiserror::Error;

use crate::ids::MailboxId;

/// Failure to add a subscription or a message limit.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubscribeError {
	/// The (mailbox, type, state) triple already has a handler.
	#[error("already subscribed to {message_type} in state '{state}'")]
	AlreadySubscribed {
		/// Message type name.
		message_type: &'static str,
		/// State name.
		state: String,
	},
	/// Only the owner may subscribe to a direct mailbox.
	#[error("agent is not the owner of direct mailbox {0}")]
	IllegalSubscriber(MailboxId),
	/// The state belongs to another agent.
	#[error("state '{0}' belongs to another agent")]
	ForeignState(String),
	/// A limit for this type has already been declared.
	#[error("message limit for {0} already defined")]
	LimitAlreadyDefined(&'static str),
	/// Limits must be declared before the first subscription to the type.
	#[error("message limit for {0} declared after subscribing to it")]
	LimitAfterSubscribe(&'static str),
}

/// Failure to remove a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UnsubscribeError {
	/// No handler exists for the (mailbox, type, state) triple.
	#[error("not subscribed to {message_type} in state '{state}'")]
	NotSubscribed {
		/// Message type name.
		message_type: &'static str,
		/// State name.
		state: String,
	},
}

/// Failure to switch an agent's state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
	/// The state belongs to another agent.
	#[error("state '{0}' belongs to another agent")]
	ForeignState(String),
	/// The agent is in its terminal state and awaits deregistration.
	#[error("agent awaits deregistration; state changes are refused")]
	AwaitingDeregistration,
}

/// Failure to start a dispatcher or an environment.
#[derive(Debug, Error)]
pub enum StartError {
	/// `start` was called twice.
	#[error("dispatcher '{0}' already started")]
	AlreadyStarted(String),
	/// A dispatcher with this name is already registered.
	#[error("dispatcher '{0}' already registered")]
	DuplicateDispatcher(String),
	/// The dispatcher or environment is shutting down.
	#[error("'{0}' is shutting down")]
	ShuttingDown(String),
	/// An OS thread could not be spawned.
	#[error("failed to spawn thread '{name}': {source}")]
	ThreadSpawn {
		/// Thread name.
		name: String,
		/// The underlying I/O error.
		#[source]
		source: std::io::Error,
	},
	/// Invalid environment configuration.
	#[error(transparent)]
	Config(#[from] ConfigError),
}

/// Failure to bind an agent to a dispatcher.
#[derive(Debug, Error)]
pub enum BindError {
	/// The dispatcher no longer accepts agents.
	#[error("dispatcher '{0}' is shutting down")]
	ShuttingDown(String),
	/// An OS thread for the agent could not be spawned.
	#[error("failed to spawn thread '{name}': {source}")]
	ThreadSpawn {
		/// Thread name.
		name: String,
		/// The underlying I/O error.
		#[source]
		source: std::io::Error,
	},
}

/// Failure to register a cooperation. Nothing of the cooperation remains
/// registered when this is returned.
#[derive(Debug, Error)]
pub enum RegisterError {
	/// A cooperation with this name is registering, active or deregistering.
	#[error("cooperation '{0}' already exists")]
	DuplicateCoopName(String),
	/// No dispatcher with this name is registered.
	#[error("unknown dispatcher '{0}'")]
	UnknownDispatcher(String),
	/// The named parent does not exist.
	#[error("parent cooperation '{0}' not found")]
	ParentNotFound(String),
	/// The named parent is not active.
	#[error("parent cooperation '{0}' is not active")]
	ParentNotActive(String),
	/// The environment is stopping and accepts no new cooperations.
	#[error("environment is stopping")]
	EnvironmentStopping,
	/// An agent's subscription-setup hook failed.
	#[error("agent setup failed in cooperation '{coop}': {source}")]
	Define {
		/// Cooperation name.
		coop: String,
		/// The subscription failure.
		#[source]
		source: SubscribeError,
	},
	/// An agent's subscription-setup hook panicked.
	#[error("agent setup panicked in cooperation '{coop}': {message}")]
	DefinePanicked {
		/// Cooperation name.
		coop: String,
		/// Panic payload.
		message: String,
	},
	/// Binding an agent to its dispatcher failed.
	#[error("binding agents of cooperation '{coop}' failed: {source}")]
	Bind {
		/// Cooperation name.
		coop: String,
		/// The binding failure.
		#[source]
		source: BindError,
	},
}

/// Failure to initiate deregistration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeregisterError {
	/// No cooperation with this name exists.
	#[error("cooperation '{0}' not found")]
	NotFound(String),
	/// The cooperation is still registering.
	#[error("cooperation '{0}' is not active yet")]
	NotActive(String),
}

/// Fault raised by an event handler or lifecycle hook.
#[derive(Debug, Error)]
pub enum HandlerError {
	/// Handler reported a failure.
	#[error("{0}")]
	Failed(String),
	/// Handler panicked; the payload message is preserved.
	#[error("handler panicked: {0}")]
	Panicked(String),
	/// Handler propagated an arbitrary error.
	#[error(transparent)]
	Source(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl HandlerError {
	/// Creates a [`HandlerError::Failed`] from a message.
	pub fn failed(message: impl Into<String>) -> Self {
		Self::Failed(message.into())
	}
}

/// Result of an event handler.
pub type HandlerResult = Result<(), HandlerError>;

/// Errors that can occur when loading environment configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
	/// Error parsing TOML syntax or shape.
	#[error("TOML parse error: {0}")]
	Toml(#[from] toml::de::Error),

	/// Error reading a configuration file.
	#[error("I/O error reading {path}: {error}")]
	Io {
		/// Path to the file that failed to read.
		path: PathBuf,
		/// The underlying I/O error.
		error: std::io::Error,
	},

	/// A value is out of range or not allowed where it appears.
	#[error("invalid value for {field}: {reason}")]
	InvalidValue {
		/// Offending field.
		field: &'static str,
		/// Why it was rejected.
		reason: String,
	},

	/// Two dispatchers share a name.
	#[error("duplicate dispatcher name: {0}")]
	DuplicateDispatcher(String),
}
