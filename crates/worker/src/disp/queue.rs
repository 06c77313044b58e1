//! Blocking demand queue on the combined spin-then-park lock.

use std::collections::VecDeque;
use std::time::Duration;

use troupe_sync::CombinedLock;

use super::prio::PriorityQueue;
use crate::demand::ExecutionDemand;

/// Result of a blocking pop.
#[derive(Debug)]
pub(crate) enum PopStatus<T> {
	Extracted(T),
	/// The queue was shut down and is empty.
	ShuttingDown,
}

/// Storage behind a [`BlockingQueue`].
pub(crate) trait Lanes: Send {
	type Item: Send;

	fn push_item(&mut self, item: Self::Item);
	fn pop_item(&mut self) -> Option<Self::Item>;
	fn item_count(&self) -> usize;
}

impl<T: Send> Lanes for VecDeque<T> {
	type Item = T;

	fn push_item(&mut self, item: T) {
		self.push_back(item);
	}

	fn pop_item(&mut self) -> Option<T> {
		self.pop_front()
	}

	fn item_count(&self) -> usize {
		self.len()
	}
}

/// Demands ordered by the priority of the agent they are for.
impl Lanes for PriorityQueue<ExecutionDemand> {
	type Item = ExecutionDemand;

	fn push_item(&mut self, demand: ExecutionDemand) {
		let priority = demand.priority();
		self.push(priority, demand);
	}

	fn pop_item(&mut self) -> Option<ExecutionDemand> {
		self.pop()
	}

	fn item_count(&self) -> usize {
		self.len()
	}
}

struct QueueState<L> {
	lanes: L,
	shut_down: bool,
	waiting: usize,
}

/// Multi-producer queue whose consumers block until an item arrives or the
/// queue is shut down.
///
/// A shut-down queue still hands out what it holds; consumers see
/// [`PopStatus::ShuttingDown`] only once it is empty. Pushes after shutdown
/// are dropped.
pub(crate) struct BlockingQueue<L> {
	state: CombinedLock<QueueState<L>>,
}

/// FIFO queue of demands.
pub(crate) type DemandQueue = BlockingQueue<VecDeque<ExecutionDemand>>;

impl<L: Lanes> BlockingQueue<L> {
	pub(crate) fn new(lanes: L, spin: Duration) -> Self {
		Self {
			state: CombinedLock::new(
				QueueState {
					lanes,
					shut_down: false,
					waiting: 0,
				},
				spin,
			),
		}
	}

	/// Appends `item`, waking one waiting consumer. Returns `false` and drops
	/// the item if the queue is shut down.
	pub(crate) fn push(&self, item: L::Item) -> bool {
		let mut state = self.state.lock();
		if state.shut_down {
			drop(state);
			drop(item);
			return false;
		}
		state.lanes.push_item(item);
		if state.waiting > 0 {
			self.state.notify_one(&state);
		}
		true
	}

	/// Blocks until an item is available or the queue is shut down and empty.
	pub(crate) fn pop(&self) -> PopStatus<L::Item> {
		let mut state = self.state.lock();
		loop {
			if let Some(item) = state.lanes.pop_item() {
				return PopStatus::Extracted(item);
			}
			if state.shut_down {
				return PopStatus::ShuttingDown;
			}
			state.waiting += 1;
			self.state.wait(&mut state);
			state.waiting -= 1;
		}
	}

	/// Like [`pop`](Self::pop), but moves up to `max` items into `out`
	/// (at least one when extracted).
	pub(crate) fn pop_batch(&self, max: usize, out: &mut Vec<L::Item>) -> PopStatus<usize> {
		let mut state = self.state.lock();
		loop {
			let mut taken = 0;
			while taken < max.max(1) {
				let Some(item) = state.lanes.pop_item() else {
					break;
				};
				out.push(item);
				taken += 1;
			}
			if taken > 0 {
				return PopStatus::Extracted(taken);
			}
			if state.shut_down {
				return PopStatus::ShuttingDown;
			}
			state.waiting += 1;
			self.state.wait(&mut state);
			state.waiting -= 1;
		}
	}

	/// Marks the queue shut down and wakes every consumer.
	pub(crate) fn shutdown(&self) {
		let mut state = self.state.lock();
		state.shut_down = true;
		self.state.notify_all(&state);
	}

	pub(crate) fn len(&self) -> usize {
		self.state.lock().lanes.item_count()
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;
	use std::sync::atomic::{AtomicBool, Ordering};

	use super::*;

	fn fifo() -> BlockingQueue<VecDeque<u32>> {
		BlockingQueue::new(VecDeque::new(), Duration::ZERO)
	}

	#[test]
	fn shutdown_drains_before_reporting() {
		let queue = fifo();
		assert!(queue.push(1));
		assert!(queue.push(2));
		queue.shutdown();
		assert!(!queue.push(3));
		assert!(matches!(queue.pop(), PopStatus::Extracted(1)));
		assert!(matches!(queue.pop(), PopStatus::Extracted(2)));
		assert!(matches!(queue.pop(), PopStatus::ShuttingDown));
	}

	#[test]
	fn pop_blocks_until_push() {
		let queue = Arc::new(fifo());
		let popped = Arc::new(AtomicBool::new(false));
		let consumer = {
			let queue = Arc::clone(&queue);
			let popped = Arc::clone(&popped);
			std::thread::spawn(move || {
				let status = queue.pop();
				popped.store(true, Ordering::Release);
				status
			})
		};
		std::thread::sleep(Duration::from_millis(20));
		assert!(!popped.load(Ordering::Acquire));
		queue.push(7);
		assert!(matches!(consumer.join().unwrap(), PopStatus::Extracted(7)));
	}

	#[test]
	fn shutdown_wakes_blocked_consumers() {
		let queue = Arc::new(fifo());
		let consumers: Vec<_> = (0..3)
			.map(|_| {
				let queue = Arc::clone(&queue);
				std::thread::spawn(move || matches!(queue.pop(), PopStatus::ShuttingDown))
			})
			.collect();
		std::thread::sleep(Duration::from_millis(20));
		queue.shutdown();
		for consumer in consumers {
			assert!(consumer.join().unwrap());
		}
	}

	#[test]
	fn batch_respects_max() {
		let queue = fifo();
		for i in 0..5 {
			queue.push(i);
		}
		let mut out = Vec::new();
		assert!(matches!(queue.pop_batch(3, &mut out), PopStatus::Extracted(3)));
		assert_eq!(out, vec![0, 1, 2]);
		assert_eq!(queue.len(), 2);
	}
}
