/// Execution classes for runtime-owned threads, used for thread naming and
/// tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskClass {
	/// Dispatcher worker executing agent demands.
	Dispatcher,
	/// Cooperation finalizer performing final teardown.
	Finalizer,
	/// Timer thread delivering delayed and periodic messages.
	Timer,
}

impl TaskClass {
	pub(crate) const fn as_str(self) -> &'static str {
		match self {
			Self::Dispatcher => "dispatcher",
			Self::Finalizer => "finalizer",
			Self::Timer => "timer",
		}
	}
}
