//! Priorities and the strict priority queue used by `prio_one_thread`.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Agent priority, `P0` lowest to `P7` highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
	/// Lowest.
	#[default]
	P0,
	P1,
	P2,
	P3,
	P4,
	P5,
	P6,
	/// Highest.
	P7,
}

impl Priority {
	/// Number of distinct priorities.
	pub const COUNT: usize = 8;

	/// All priorities, lowest first.
	pub const ALL: [Self; Self::COUNT] = [Self::P0, Self::P1, Self::P2, Self::P3, Self::P4, Self::P5, Self::P6, Self::P7];

	/// Lane index, 0 for `P0`.
	pub const fn index(self) -> usize {
		self as usize
	}
}

/// One FIFO lane per priority with a cursor on the highest non-empty lane.
///
/// Pops always drain the highest non-empty lane first; lower lanes may
/// starve under sustained high-priority load.
pub(crate) struct PriorityQueue<T> {
	lanes: [VecDeque<T>; Priority::COUNT],
	/// Highest lane that may be non-empty; `None` when every lane is empty.
	cursor: Option<usize>,
	len: usize,
}

impl<T> Default for PriorityQueue<T> {
	fn default() -> Self {
		Self {
			lanes: std::array::from_fn(|_| VecDeque::new()),
			cursor: None,
			len: 0,
		}
	}
}

impl<T> PriorityQueue<T> {
	pub(crate) fn push(&mut self, priority: Priority, item: T) {
		let lane = priority.index();
		self.lanes[lane].push_back(item);
		self.len += 1;
		if self.cursor.is_none_or(|cursor| cursor < lane) {
			self.cursor = Some(lane);
		}
	}

	pub(crate) fn pop(&mut self) -> Option<T> {
		let mut lane = self.cursor?;
		loop {
			if let Some(item) = self.lanes[lane].pop_front() {
				self.len -= 1;
				self.cursor = if self.len == 0 { None } else { Some(lane) };
				return Some(item);
			}
			if lane == 0 {
				self.cursor = None;
				return None;
			}
			lane -= 1;
		}
	}

	pub(crate) fn len(&self) -> usize {
		self.len
	}

	#[cfg(test)]
	pub(crate) fn lane_len(&self, priority: Priority) -> usize {
		self.lanes[priority.index()].len()
	}
}
