//! Common utilities for runtime integration tests.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use troupe_worker::{Environment, EnvironmentParams, ExceptionReaction};

/// Upper bound for any wait in these tests.
pub const WAIT: Duration = Duration::from_secs(10);

/// Shared, ordered event log.
pub type Log = Arc<Mutex<Vec<String>>>;

pub fn log() -> Log {
	Arc::new(Mutex::new(Vec::new()))
}

/// Installs a test subscriber once; later calls are no-ops.
pub fn init_test_tracing() {
	let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Starts an environment whose unhandled faults deregister the cooperation
/// instead of aborting the test process.
pub fn start_env() -> Environment {
	init_test_tracing();
	Environment::start(EnvironmentParams::default().exception_reaction(ExceptionReaction::DeregisterCoop)).expect("environment starts")
}

/// One-shot latch a handler can park on.
#[derive(Default)]
pub struct Gate {
	open: Mutex<bool>,
	opened: Condvar,
}

impl Gate {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub fn wait(&self) {
		let mut open = self.open.lock();
		while !*open {
			self.opened.wait(&mut open);
		}
	}

	pub fn open(&self) {
		*self.open.lock() = true;
		self.opened.notify_all();
	}
}
