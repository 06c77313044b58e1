use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::disp::Dispatcher;
use crate::error::StartError;

/// Snapshot for one registered dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherRecord {
	/// Registered name.
	pub name: String,
	/// Variant label.
	pub kind: &'static str,
}

/// Dispatchers of one environment, by name.
#[derive(Default, Clone)]
pub(crate) struct DispatcherRegistry {
	inner: Arc<RwLock<FxHashMap<String, Arc<dyn Dispatcher>>>>,
}

impl DispatcherRegistry {
	/// Creates an empty registry.
	pub(crate) fn new() -> Self {
		Self::default()
	}

	/// Inserts one dispatcher; names are unique.
	pub(crate) fn insert(&self, dispatcher: Arc<dyn Dispatcher>) -> Result<(), StartError> {
		let mut guard = self.inner.write();
		let name = dispatcher.name().to_string();
		if guard.contains_key(&name) {
			return Err(StartError::DuplicateDispatcher(name));
		}
		guard.insert(name, dispatcher);
		Ok(())
	}

	/// Looks up one dispatcher.
	pub(crate) fn get(&self, name: &str) -> Option<Arc<dyn Dispatcher>> {
		self.inner.read().get(name).cloned()
	}

	/// Removes every dispatcher, sorted by name.
	pub(crate) fn drain(&self) -> Vec<Arc<dyn Dispatcher>> {
		let mut dispatchers: Vec<_> = self.inner.write().drain().collect();
		dispatchers.sort_by(|a, b| a.0.cmp(&b.0));
		dispatchers.into_iter().map(|(_, d)| d).collect()
	}

	/// Returns snapshots sorted by name.
	pub(crate) fn snapshots(&self) -> Vec<DispatcherRecord> {
		let guard = self.inner.read();
		let mut records: Vec<_> = guard
			.values()
			.map(|d| DispatcherRecord {
				name: d.name().to_string(),
				kind: d.kind(),
			})
			.collect();
		records.sort_by(|a, b| a.name.cmp(&b.name));
		records
	}
}
