use std::hash::{Hash, Hasher};

use parking_lot::{Mutex, MutexGuard};
use rustc_hash::FxHasher;

/// Fixed set of mutexes selected by key hash.
///
/// Two keys that hash to the same slot share a lock; keys in different slots
/// never contend. The slot for a key is stable for the pool's lifetime.
pub struct MutexPool<T> {
	slots: Box<[Mutex<T>]>,
}

impl<T> MutexPool<T> {
	/// Creates a pool of `size` slots initialised by `init`.
	///
	/// # Panics
	///
	/// Panics if `size` is zero.
	pub fn new(size: usize, mut init: impl FnMut() -> T) -> Self {
		assert!(size > 0, "mutex pool size must be > 0");
		Self {
			slots: (0..size).map(|_| Mutex::new(init())).collect(),
		}
	}

	/// Number of slots.
	pub fn len(&self) -> usize {
		self.slots.len()
	}

	/// Always `false`; a pool has at least one slot.
	pub fn is_empty(&self) -> bool {
		self.slots.is_empty()
	}

	/// Index of the slot guarding `key`.
	pub fn slot_of<K: Hash + ?Sized>(&self, key: &K) -> usize {
		let mut hasher = FxHasher::default();
		key.hash(&mut hasher);
		(hasher.finish() % self.slots.len() as u64) as usize
	}

	/// Locks the slot guarding `key`.
	pub fn lock<K: Hash + ?Sized>(&self, key: &K) -> MutexGuard<'_, T> {
		self.slots[self.slot_of(key)].lock()
	}

	/// Iterates over every slot, for whole-pool scans.
	pub fn iter(&self) -> impl Iterator<Item = &Mutex<T>> {
		self.slots.iter()
	}
}

impl<T: Default> MutexPool<T> {
	/// Creates a pool of `size` default-initialised slots.
	pub fn with_default(size: usize) -> Self {
		Self::new(size, T::default)
	}
}
