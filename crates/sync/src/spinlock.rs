use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::lock_api::{self, GuardSend};

/// Spin iterations (as a power of two) before the waiter starts yielding.
const SPIN_LIMIT: u32 = 6;

/// Raw test-and-test-and-set lock with exponential backoff.
///
/// Never parks the thread. Only suitable for critical sections that are a
/// handful of instructions long; anything that may block belongs under a
/// [`CombinedLock`](crate::CombinedLock) or a plain mutex.
pub struct RawSpinlock {
	locked: AtomicBool,
}

unsafe impl lock_api::RawMutex for RawSpinlock {
	#[allow(clippy::declare_interior_mutable_const)]
	const INIT: Self = Self {
		locked: AtomicBool::new(false),
	};

	type GuardMarker = GuardSend;

	fn lock(&self) {
		let mut step = 0u32;
		loop {
			if !self.locked.load(Ordering::Relaxed)
				&& self
					.locked
					.compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
					.is_ok()
			{
				return;
			}
			if step <= SPIN_LIMIT {
				for _ in 0..(1u32 << step) {
					std::hint::spin_loop();
				}
				step += 1;
			} else {
				std::thread::yield_now();
			}
		}
	}

	fn try_lock(&self) -> bool {
		self.locked
			.compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
			.is_ok()
	}

	unsafe fn unlock(&self) {
		self.locked.store(false, Ordering::Release);
	}

	fn is_locked(&self) -> bool {
		self.locked.load(Ordering::Relaxed)
	}
}

/// Busy-waiting mutex.
pub type Spinlock<T> = lock_api::Mutex<RawSpinlock, T>;

/// RAII guard for [`Spinlock`].
pub type SpinlockGuard<'a, T> = lock_api::MutexGuard<'a, RawSpinlock, T>;
