//! Notification accounting over randomly shaped cooperation trees.

use std::sync::Arc;

use parking_lot::Mutex;
use proptest::prelude::*;
use troupe_worker::{Agent, Context, Coop, CoopListener, DeregReason, Environment, EnvironmentParams, ExceptionReaction, SubscribeError};

use crate::common::{WAIT, init_test_tracing};

struct Member;

impl Agent for Member {
	fn define(&mut self, _ctx: &mut Context<'_, Self>) -> Result<(), SubscribeError> {
		Ok(())
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
	Registered(String),
	Deregistered(String),
}

#[derive(Default)]
struct Journal {
	events: Mutex<Vec<Event>>,
}

impl CoopListener for Journal {
	fn on_registered(&self, _env: &Environment, coop: &str) {
		self.events.lock().push(Event::Registered(coop.to_string()));
	}

	fn on_deregistered(&self, _env: &Environment, coop: &str, _reason: DeregReason) {
		self.events.lock().push(Event::Deregistered(coop.to_string()));
	}
}

/// Parent index for every node after the first; `None` makes a root.
fn tree() -> impl Strategy<Value = Vec<Option<usize>>> {
	(1..12usize).prop_flat_map(|n| {
		(0..n)
			.map(|i| if i == 0 { Just(None::<usize>).boxed() } else { prop::option::weighted(0.8, 0..i).boxed() })
			.collect::<Vec<_>>()
	})
}

fn position(events: &[Event], wanted: &Event) -> usize {
	events.iter().position(|e| e == wanted).unwrap_or(usize::MAX)
}

proptest! {
	#![proptest_config(ProptestConfig::with_cases(24))]

	/// Each cooperation is announced once in each direction, and a parent's
	/// destruction is announced only after all of its children's.
	#[test]
	fn prop_children_are_destroyed_before_parents(parents in tree()) {
		init_test_tracing();
		let journal = Arc::new(Journal::default());
		let env = Environment::builder()
			.params(EnvironmentParams::default().exception_reaction(ExceptionReaction::DeregisterCoop))
			.listener(journal.clone())
			.start()
			.unwrap();

		let names: Vec<String> = (0..parents.len()).map(|i| format!("node-{i}")).collect();
		let mut handles = Vec::new();
		for (i, parent) in parents.iter().enumerate() {
			let mut coop = Coop::new(names[i].clone());
			if let Some(parent) = parent {
				coop = coop.with_parent(names[*parent].clone());
			}
			coop.add_agent(Member);
			handles.push(env.register_coop(coop).unwrap());
		}
		prop_assert_eq!(env.coop_count(), parents.len());

		for (i, parent) in parents.iter().enumerate() {
			if parent.is_none() {
				env.deregister_coop(&names[i], DeregReason::Normal).unwrap();
			}
		}
		for handle in &handles {
			prop_assert!(handle.wait_destroyed_timeout(WAIT));
		}
		env.stop_and_join();

		let events = journal.events.lock().clone();
		let registered = events.iter().filter(|e| matches!(e, Event::Registered(_))).count();
		let deregistered = events.iter().filter(|e| matches!(e, Event::Deregistered(_))).count();
		prop_assert_eq!(registered, parents.len());
		prop_assert_eq!(deregistered, parents.len());

		for (i, parent) in parents.iter().enumerate() {
			let Some(parent) = parent else { continue };
			let child_gone = position(&events, &Event::Deregistered(names[i].clone()));
			let parent_gone = position(&events, &Event::Deregistered(names[*parent].clone()));
			prop_assert!(child_gone < parent_gone, "{} outlived {}", names[i], names[*parent]);
		}
	}
}
