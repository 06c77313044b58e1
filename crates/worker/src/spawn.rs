use std::any::Any;
use std::cell::Cell;
use std::thread::JoinHandle;

use crate::TaskClass;

thread_local! {
	static RUNTIME_CLASS: Cell<Option<TaskClass>> = const { Cell::new(None) };
}

/// Spawns a dedicated named OS thread owned by the runtime.
///
/// The thread remembers its [`TaskClass`] so blocking calls that would wait on
/// runtime threads can detect being invoked from one of them.
pub(crate) fn spawn_named_thread<F>(class: TaskClass, name: impl Into<String>, f: F) -> std::io::Result<JoinHandle<()>>
where
	F: FnOnce() + Send + 'static,
{
	let name = name.into();
	tracing::trace!(worker_class = class.as_str(), thread = %name, "worker.spawn_named_thread");
	std::thread::Builder::new().name(name).spawn(move || {
		RUNTIME_CLASS.with(|c| c.set(Some(class)));
		f();
	})
}

/// Class of the current thread if it is runtime-owned.
pub(crate) fn current_class() -> Option<TaskClass> {
	RUNTIME_CLASS.with(Cell::get)
}

/// Joins a runtime thread, logging a panic payload instead of propagating it.
///
/// Joining the calling thread itself is skipped.
pub(crate) fn join_thread(handle: JoinHandle<()>) {
	let name = handle.thread().name().unwrap_or("<unnamed>").to_string();
	if handle.thread().id() == std::thread::current().id() {
		tracing::warn!(thread = %name, "worker.join.self_skipped");
		return;
	}
	if let Err(payload) = handle.join() {
		tracing::error!(thread = %name, panic = %panic_message(payload.as_ref()), "worker.thread.panicked");
	}
}

/// Extracts a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
	if let Some(s) = payload.downcast_ref::<&'static str>() {
		(*s).to_string()
	} else if let Some(s) = payload.downcast_ref::<String>() {
		s.clone()
	} else {
		"<non-string panic payload>".to_string()
	}
}

#[cfg(test)]
#[path = "panic_tests.rs"]
mod panic_tests;
