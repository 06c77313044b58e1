//! Delayed and periodic message delivery.
//!
//! One thread keeps a deadline heap (monotonic clock) and delivers into
//! mailboxes when entries come due. Deliveries go through the ordinary
//! [`Mailbox::deliver`] path, limits included.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use troupe_sync::{CombinedLock, MutexGuard};

use crate::TaskClass;
use crate::error::StartError;
use crate::ids::TimerId;
use crate::mailbox::Mailbox;
use crate::message::Envelope;
use crate::spawn::{join_thread, spawn_named_thread};

const THREAD_NAME: &str = "troupe.timer";

struct Timer {
	mailbox: Mailbox,
	envelope: Envelope,
	period: Option<Duration>,
}

#[derive(Default)]
struct TimerState {
	/// (deadline, sequence, id); the sequence keeps equal deadlines FIFO.
	heap: BinaryHeap<Reverse<(Instant, u64, TimerId)>>,
	timers: FxHashMap<TimerId, Timer>,
	sequence: u64,
	shut_down: bool,
}

impl TimerState {
	fn enqueue(&mut self, deadline: Instant, id: TimerId) {
		self.sequence += 1;
		self.heap.push(Reverse((deadline, self.sequence, id)));
	}
}

struct TimerShared {
	state: CombinedLock<TimerState>,
}

impl TimerShared {
	fn cancel(&self, id: TimerId) -> bool {
		// Heap entries of cancelled timers are skipped when they come due.
		let removed = self.state.lock().timers.remove(&id).is_some();
		if removed {
			tracing::trace!(timer = %id, "timer.cancelled");
		}
		removed
	}
}

/// The environment's timer thread.
pub(crate) struct TimerThread {
	shared: Arc<TimerShared>,
	thread: Mutex<Option<JoinHandle<()>>>,
}

impl TimerThread {
	pub(crate) fn new() -> Self {
		Self {
			shared: Arc::new(TimerShared {
				state: CombinedLock::default(),
			}),
			thread: Mutex::new(None),
		}
	}

	pub(crate) fn start(&self) -> Result<(), StartError> {
		let shared = Arc::clone(&self.shared);
		let handle = spawn_named_thread(TaskClass::Timer, THREAD_NAME, move || run(&shared)).map_err(|source| StartError::ThreadSpawn {
			name: THREAD_NAME.to_string(),
			source,
		})?;
		*self.thread.lock() = Some(handle);
		Ok(())
	}

	/// Schedules `envelope` for `mailbox` after `delay`, then every
	/// `period` if given.
	pub(crate) fn schedule(&self, mailbox: &Mailbox, envelope: Envelope, delay: Duration, period: Option<Duration>) -> TimerHandle {
		let id = TimerId::next();
		let mut state = self.shared.state.lock();
		if state.shut_down {
			tracing::debug!(timer = %id, "timer.rejected.shut_down");
		} else {
			state.timers.insert(
				id,
				Timer {
					mailbox: mailbox.clone(),
					envelope,
					period: period.filter(|p| !p.is_zero()),
				},
			);
			state.enqueue(Instant::now() + delay, id);
			self.shared.state.notify_one(&state);
			tracing::trace!(timer = %id, mailbox = %mailbox.id(), ?delay, ?period, "timer.scheduled");
		}
		TimerHandle {
			id,
			shared: Arc::downgrade(&self.shared),
		}
	}

	/// Number of pending timers.
	#[cfg(test)]
	pub(crate) fn pending(&self) -> usize {
		self.shared.state.lock().timers.len()
	}

	/// Discards pending timers and lets the thread exit, without waiting
	/// for it.
	pub(crate) fn close(&self) {
		let mut state = self.shared.state.lock();
		if state.shut_down {
			return;
		}
		state.shut_down = true;
		let discarded = state.timers.len();
		state.timers.clear();
		state.heap.clear();
		self.shared.state.notify_all(&state);
		if discarded > 0 {
			tracing::debug!(discarded, "timer.shutdown.discarded");
		}
	}

	/// Stops the thread; pending timers are discarded.
	pub(crate) fn shutdown(&self) {
		self.close();
		if let Some(handle) = self.thread.lock().take() {
			join_thread(handle);
		}
	}
}

fn run(shared: &TimerShared) {
	tracing::debug!("timer.start");
	let mut state = shared.state.lock();
	loop {
		if state.shut_down {
			break;
		}
		let now = Instant::now();
		let Some(&Reverse((deadline, _, id))) = state.heap.peek() else {
			shared.state.wait(&mut state);
			continue;
		};
		if deadline > now {
			shared.state.wait_until(&mut state, deadline);
			continue;
		}
		state.heap.pop();
		let Some(timer) = state.timers.get(&id) else {
			continue;
		};
		let (mailbox, envelope, period) = (timer.mailbox.clone(), timer.envelope.clone(), timer.period);
		match period {
			Some(period) => state.enqueue((deadline + period).max(now), id),
			None => {
				state.timers.remove(&id);
			}
		}
		MutexGuard::unlocked(&mut state, || {
			tracing::trace!(timer = %id, mailbox = %mailbox.id(), "timer.fired");
			mailbox.deliver(envelope);
		});
	}
	tracing::debug!("timer.exit");
}

/// Handle to a scheduled timer. Dropping it cancels the timer.
#[must_use = "dropping a TimerHandle cancels the timer"]
pub struct TimerHandle {
	id: TimerId,
	shared: Weak<TimerShared>,
}

impl TimerHandle {
	/// Timer identity.
	pub fn id(&self) -> TimerId {
		self.id
	}

	/// Whether the timer is still scheduled. A one-shot timer stops being
	/// active once it fired.
	pub fn is_active(&self) -> bool {
		self.shared.upgrade().is_some_and(|shared| shared.state.lock().timers.contains_key(&self.id))
	}

	/// Cancels the timer. Returns whether it was still scheduled.
	pub fn cancel(self) -> bool {
		self.shared.upgrade().is_some_and(|shared| shared.cancel(self.id))
	}

	/// Lets the timer run until the environment stops.
	pub fn detach(mut self) {
		self.shared = Weak::new();
	}
}

impl Drop for TimerHandle {
	fn drop(&mut self) {
		if let Some(shared) = self.shared.upgrade() {
			shared.cancel(self.id);
		}
	}
}

impl fmt::Debug for TimerHandle {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("TimerHandle").field("id", &self.id).finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn cancelled_timers_never_fire_and_handles_report_state() {
		let timers = TimerThread::new();
		timers.start().unwrap();
		let mailbox = Mailbox::anonymous();

		let handle = timers.schedule(&mailbox, Envelope::new(1u32), Duration::from_secs(60), None);
		assert!(handle.is_active());
		assert_eq!(timers.pending(), 1);
		assert!(handle.cancel());
		assert_eq!(timers.pending(), 0);

		let dropped = timers.schedule(&mailbox, Envelope::new(2u32), Duration::from_secs(60), Some(Duration::from_secs(1)));
		drop(dropped);
		assert_eq!(timers.pending(), 0);

		let kept = timers.schedule(&mailbox, Envelope::new(3u32), Duration::from_secs(60), None);
		kept.detach();
		assert_eq!(timers.pending(), 1);
		timers.shutdown();
		assert_eq!(timers.pending(), 0);
	}

	#[test]
	fn one_shot_fires_once() {
		let timers = TimerThread::new();
		timers.start().unwrap();
		let mailbox = Mailbox::anonymous();
		let handle = timers.schedule(&mailbox, Envelope::new(4u32), Duration::from_millis(5), None);
		let deadline = Instant::now() + Duration::from_secs(5);
		while handle.is_active() && Instant::now() < deadline {
			std::thread::sleep(Duration::from_millis(2));
		}
		assert!(!handle.is_active());
		assert!(!handle.cancel());
		timers.shutdown();
	}
}
