use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

/// Mutex with a spin-then-block wait.
///
/// A waiter first releases the lock and busy-waits for up to `spin` for a
/// notification; only if none arrives does it park on the condition
/// variable. Under steady load this keeps hand-offs between producers and
/// worker threads off the futex path.
///
/// Notifications must be issued while holding the lock (the guard is taken
/// by reference to make that explicit). Together with the epoch counter this
/// rules out lost wakeups between the spin phase and parking.
pub struct CombinedLock<T> {
	data: Mutex<T>,
	cond: Condvar,
	epoch: AtomicU64,
	spin: Duration,
}

impl<T> CombinedLock<T> {
	/// Creates a lock whose waiters spin for `spin` before parking.
	///
	/// A zero duration makes the lock a plain mutex/condvar pair.
	pub fn new(value: T, spin: Duration) -> Self {
		Self {
			data: Mutex::new(value),
			cond: Condvar::new(),
			epoch: AtomicU64::new(0),
			spin,
		}
	}

	/// Acquires the lock.
	pub fn lock(&self) -> MutexGuard<'_, T> {
		self.data.lock()
	}

	/// Returns the configured spin budget.
	pub fn spin(&self) -> Duration {
		self.spin
	}

	/// Waits for a notification.
	///
	/// May return spuriously; callers re-check their predicate in a loop.
	pub fn wait(&self, guard: &mut MutexGuard<'_, T>) {
		let seen = self.epoch.load(Ordering::Acquire);
		if self.spin_for_notify(guard, seen) {
			return;
		}
		if self.epoch.load(Ordering::Acquire) != seen {
			return;
		}
		self.cond.wait(guard);
	}

	/// Waits for a notification or until `deadline`.
	///
	/// Returns `true` if the deadline passed without a notification.
	pub fn wait_until(&self, guard: &mut MutexGuard<'_, T>, deadline: Instant) -> bool {
		let seen = self.epoch.load(Ordering::Acquire);
		if self.spin_for_notify(guard, seen) {
			return false;
		}
		if self.epoch.load(Ordering::Acquire) != seen {
			return false;
		}
		self.cond.wait_until(guard, deadline).timed_out()
	}

	/// Wakes one waiter.
	pub fn notify_one(&self, _guard: &MutexGuard<'_, T>) {
		self.epoch.fetch_add(1, Ordering::Release);
		self.cond.notify_one();
	}

	/// Wakes every waiter.
	pub fn notify_all(&self, _guard: &MutexGuard<'_, T>) {
		self.epoch.fetch_add(1, Ordering::Release);
		self.cond.notify_all();
	}

	fn spin_for_notify(&self, guard: &mut MutexGuard<'_, T>, seen: u64) -> bool {
		if self.spin.is_zero() {
			return false;
		}
		let deadline = Instant::now() + self.spin;
		MutexGuard::unlocked(guard, || {
			loop {
				if self.epoch.load(Ordering::Acquire) != seen {
					return true;
				}
				if Instant::now() >= deadline {
					return false;
				}
				std::hint::spin_loop();
			}
		})
	}
}

impl<T: Default> Default for CombinedLock<T> {
	fn default() -> Self {
		Self::new(T::default(), Duration::ZERO)
	}
}
