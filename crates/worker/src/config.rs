//! Environment configuration, loadable from TOML.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::disp::DispatcherParams;
use crate::error::ConfigError;
use crate::exception::ExceptionReaction;

/// Name under which the default dispatcher is registered.
pub const DEFAULT_DISPATCHER_NAME: &str = "default";

/// A dispatcher to create at start-up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedDispatcher {
	/// Registration name.
	pub name: String,
	/// Variant and its parameters.
	#[serde(flatten)]
	pub params: DispatcherParams,
}

/// Runtime parameters of an [`Environment`](crate::Environment).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentParams {
	/// Reaction to handler faults when neither agent nor cooperation picks
	/// one. `inherit` is not allowed here.
	pub exception_reaction: ExceptionReaction,
	/// How long queue waiters spin before parking, in microseconds.
	pub queue_spin_micros: u64,
	/// Number of shards of the named mailbox dictionary.
	#[serde(default = "default_named_mailbox_shards")]
	pub named_mailbox_shards: usize,
	/// The dispatcher agents bind to by default.
	pub default_dispatcher: DispatcherParams,
	/// Additional dispatchers, created at start.
	pub dispatchers: Vec<NamedDispatcher>,
}

/// Returns the default shard count of the named mailbox dictionary.
fn default_named_mailbox_shards() -> usize {
	16
}

impl Default for EnvironmentParams {
	fn default() -> Self {
		Self {
			exception_reaction: ExceptionReaction::Abort,
			queue_spin_micros: 0,
			named_mailbox_shards: default_named_mailbox_shards(),
			default_dispatcher: DispatcherParams::OneThread,
			dispatchers: Vec::new(),
		}
	}
}

impl EnvironmentParams {
	/// Parses parameters from TOML text.
	pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
		let params: Self = toml::from_str(text)?;
		params.validate()?;
		Ok(params)
	}

	/// Reads and parses a TOML file.
	pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
		let text = std::fs::read_to_string(path).map_err(|error| ConfigError::Io {
			path: path.to_path_buf(),
			error,
		})?;
		Self::from_toml_str(&text)
	}

	/// Sets the environment-wide exception reaction.
	pub fn exception_reaction(mut self, reaction: ExceptionReaction) -> Self {
		self.exception_reaction = reaction;
		self
	}

	/// Sets the queue spin budget.
	pub fn queue_spin(mut self, spin: Duration) -> Self {
		self.queue_spin_micros = u64::try_from(spin.as_micros()).unwrap_or(u64::MAX);
		self
	}

	/// Sets the default dispatcher's parameters.
	pub fn default_dispatcher(mut self, params: DispatcherParams) -> Self {
		self.default_dispatcher = params;
		self
	}

	/// Adds a named dispatcher created at start.
	pub fn dispatcher(mut self, name: impl Into<String>, params: DispatcherParams) -> Self {
		self.dispatchers.push(NamedDispatcher { name: name.into(), params });
		self
	}

	/// Queue spin budget.
	pub fn spin(&self) -> Duration {
		Duration::from_micros(self.queue_spin_micros)
	}

	/// Checks values serde cannot: reaction, counts and name uniqueness.
	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.exception_reaction == ExceptionReaction::Inherit {
			return Err(ConfigError::InvalidValue {
				field: "exception_reaction",
				reason: "the environment has nothing to inherit from".to_string(),
			});
		}
		if self.named_mailbox_shards == 0 {
			return Err(ConfigError::InvalidValue {
				field: "named_mailbox_shards",
				reason: "must be at least 1".to_string(),
			});
		}
		self.default_dispatcher.validate()?;

		let mut names = HashSet::new();
		names.insert(DEFAULT_DISPATCHER_NAME);
		for dispatcher in &self.dispatchers {
			if dispatcher.name.is_empty() {
				return Err(ConfigError::InvalidValue {
					field: "name",
					reason: "dispatcher name is empty".to_string(),
				});
			}
			if !names.insert(dispatcher.name.as_str()) {
				return Err(ConfigError::DuplicateDispatcher(dispatcher.name.clone()));
			}
			dispatcher.params.validate()?;
		}
		Ok(())
	}
}
