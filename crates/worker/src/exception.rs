//! Reactions to faults raised by agent handlers.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::agent::AgentCore;
use crate::coop::DeregReason;
use crate::environment::Environment;
use crate::error::HandlerError;

/// What the runtime does after a handler returns an error or panics.
///
/// Resolved from the agent, then its cooperation, then each parent
/// cooperation, then the environment, skipping [`Inherit`](Self::Inherit).
/// Every reaction except [`Ignore`](Self::Ignore) first moves the agent to
/// its terminal awaiting-deregistration state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExceptionReaction {
	/// Terminate the process.
	#[default]
	Abort,
	/// Stop the whole environment.
	ShutdownEnvironment,
	/// Deregister the agent's cooperation.
	DeregisterCoop,
	/// Log and carry on in the current state.
	Ignore,
	/// Defer to the enclosing level.
	Inherit,
}

/// Resolves and carries out the reaction to `error` raised by `agent`.
pub(crate) fn react(agent: &Arc<AgentCore>, env: &Environment, own: ExceptionReaction, error: &HandlerError, origin: &str) {
	let coop = agent.coop();
	let reaction = match own {
		ExceptionReaction::Inherit => coop
			.as_ref()
			.and_then(|coop| coop.resolved_exception_reaction())
			.unwrap_or_else(|| env.default_exception_reaction()),
		reaction => reaction,
	};
	tracing::error!(
		agent = %agent.id(),
		coop = coop.as_ref().map(|c| c.name()),
		origin,
		reaction = ?reaction,
		error = %error,
		"agent.exception"
	);

	if reaction == ExceptionReaction::Ignore {
		tracing::warn!(agent = %agent.id(), origin, "agent.exception.ignored");
		return;
	}
	agent.switch_to_awaiting_deregistration();

	match reaction {
		ExceptionReaction::ShutdownEnvironment => env.stop(),
		ExceptionReaction::DeregisterCoop => {
			let Some(coop) = coop else {
				tracing::error!(agent = %agent.id(), "agent.exception.no_coop");
				std::process::abort();
			};
			if let Err(err) = env.deregister_coop_inner(&coop, DeregReason::UnhandledException) {
				tracing::error!(agent = %agent.id(), coop = coop.name(), error = %err, "agent.exception.reaction_failed");
				std::process::abort();
			}
		}
		ExceptionReaction::Abort | ExceptionReaction::Inherit | ExceptionReaction::Ignore => {
			tracing::error!(agent = %agent.id(), "agent.exception.abort");
			std::process::abort();
		}
	}
}
