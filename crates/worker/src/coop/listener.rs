use super::DeregReason;
use crate::environment::Environment;

/// Environment-wide observer of cooperation lifecycle events.
///
/// Called on the registering thread for registrations and on the finalizer
/// thread for deregistrations. Must not block on the environment.
pub trait CoopListener: Send + Sync {
	/// A cooperation became active.
	fn on_registered(&self, _env: &Environment, _coop: &str) {}

	/// A cooperation was destroyed.
	fn on_deregistered(&self, _env: &Environment, _coop: &str, _reason: DeregReason) {}
}
