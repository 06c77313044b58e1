//! End-to-end behaviour of state filtering, unsubscription, cooperation
//! teardown, message limits and priority scheduling.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use troupe_worker::{
	Agent, Context, Coop, CoopStatus, DeregReason, DispatcherBinder, DispatcherParams, HandlerError, HandlerResult,
	Priority, SubscribeError, State,
};

use crate::common::{Gate, Log, WAIT, log, start_env};

struct Msg(&'static str);
struct Switch;
struct Hold(Arc<Gate>);

/// Handles `Msg` only in state "s1"; `Switch` moves it to "s2".
struct Stateful {
	log: Log,
	s1: Option<State>,
	s2: Option<State>,
}

impl Agent for Stateful {
	fn define(&mut self, ctx: &mut Context<'_, Self>) -> Result<(), SubscribeError> {
		let s1 = ctx.state("s1");
		let s2 = ctx.state("s2");
		let inbox = ctx.environment().named_mailbox("scenario.a");
		ctx.subscribe(&inbox).in_state(&s1)?.event(|agent, _ctx, msg: &Msg| {
			agent.log.lock().push(msg.0.to_string());
			Ok(())
		})?;
		ctx.subscribe(&inbox).in_state(&s1)?.event(|agent, ctx, _: &Switch| {
			if let Some(s2) = &agent.s2 {
				ctx.change_state(s2).map_err(|e| HandlerError::failed(e.to_string()))?;
			}
			Ok(())
		})?;
		self.s1 = Some(s1);
		self.s2 = Some(s2);
		Ok(())
	}

	fn on_start(&mut self, ctx: &mut Context<'_, Self>) -> HandlerResult {
		if let Some(s1) = &self.s1 {
			ctx.change_state(s1).map_err(|e| HandlerError::failed(e.to_string()))?;
		}
		Ok(())
	}
}

#[test]
fn state_filters_handlers() {
	let env = start_env();
	let log = log();
	let handle = env
		.register_agent_as_coop(
			"scenario-a",
			Stateful {
				log: log.clone(),
				s1: None,
				s2: None,
			},
		)
		.unwrap();
	let inbox = env.named_mailbox("scenario.a");
	inbox.send(Msg("msg"));
	inbox.send(Switch);
	inbox.send(Msg("msg2"));

	env.deregister_coop("scenario-a", DeregReason::Normal).unwrap();
	assert!(handle.wait_destroyed_timeout(WAIT));
	assert_eq!(*log.lock(), vec!["msg"]);
	assert_eq!(handle.agents()[0].current_state_name(), "s2");
	env.stop_and_join();
}

/// Drops its `Msg` subscription from inside a `Hold` handler, while a `Msg`
/// demand already waits behind it; optionally subscribes again.
struct Fickle {
	handled: Arc<AtomicUsize>,
	resubscribe: bool,
	entered: mpsc::Sender<()>,
	done: mpsc::Sender<()>,
}

fn count_msg(agent: &mut Fickle, _ctx: &mut Context<'_, Fickle>, _: &Msg) -> HandlerResult {
	agent.handled.fetch_add(1, Ordering::AcqRel);
	Ok(())
}

impl Agent for Fickle {
	fn define(&mut self, ctx: &mut Context<'_, Self>) -> Result<(), SubscribeError> {
		ctx.subscribe_self().event(|agent, ctx, hold: &Hold| {
			let _ = agent.entered.send(());
			hold.0.wait();
			ctx.unsubscribe::<Msg>(ctx.direct_mailbox(), &ctx.default_state())
				.map_err(|e| HandlerError::failed(e.to_string()))?;
			if agent.resubscribe {
				ctx.subscribe_self().event(count_msg).map_err(|e| HandlerError::failed(e.to_string()))?;
			}
			let _ = agent.done.send(());
			Ok(())
		})?;
		ctx.subscribe_self().event(count_msg)
	}
}

/// Queues one `Msg` behind a parked `Hold`, lets the handler unsubscribe,
/// then sends one more `Msg`. Returns how many `Msg` handlers ran.
fn unsubscribe_with_demand_queued(coop: &str, resubscribe: bool) -> usize {
	let env = start_env();
	let handled = Arc::new(AtomicUsize::new(0));
	let (entered, entered_rx) = mpsc::channel();
	let (done, done_rx) = mpsc::channel();
	let handle = env
		.register_agent_as_coop(
			coop,
			Fickle {
				handled: Arc::clone(&handled),
				resubscribe,
				entered,
				done,
			},
		)
		.unwrap();
	let agent = handle.agents()[0].clone();
	let gate = Gate::new();
	agent.direct_mailbox().send(Hold(Arc::clone(&gate)));
	entered_rx.recv_timeout(WAIT).unwrap();
	agent.direct_mailbox().send(Msg("queued"));
	gate.open();
	done_rx.recv_timeout(WAIT).unwrap();
	agent.direct_mailbox().send(Msg("after"));

	env.deregister_coop(coop, DeregReason::Normal).unwrap();
	assert!(handle.wait_destroyed_timeout(WAIT));
	env.stop_and_join();
	handled.load(Ordering::Acquire)
}

#[test]
fn unsubscribed_demand_never_runs() {
	assert_eq!(unsubscribe_with_demand_queued("unsubscribed", false), 0);
}

#[test]
fn resubscribing_does_not_revive_a_queued_demand() {
	assert_eq!(unsubscribe_with_demand_queued("resubscribed", true), 1);
}

/// Reports its finish hook.
struct Finisher {
	name: &'static str,
	log: Log,
}

impl Agent for Finisher {
	fn define(&mut self, _ctx: &mut Context<'_, Self>) -> Result<(), SubscribeError> {
		Ok(())
	}

	fn on_finish(&mut self, _ctx: &mut Context<'_, Self>) {
		std::thread::sleep(Duration::from_millis(5));
		self.log.lock().push(format!("finish:{}", self.name));
	}
}

#[test]
fn deregistration_waits_for_every_agent() {
	let env = start_env();
	let log = log();
	let dispatcher = DispatcherParams::ActiveObj.build("scenario-b", Duration::ZERO);
	dispatcher.start().unwrap();

	let dereg_log = log.clone();
	let mut coop = Coop::new("c1")
		.with_binder(DispatcherBinder::Instance(Arc::clone(&dispatcher)))
		.on_deregistered(move |_, name, _| dereg_log.lock().push(format!("deregistered:{name}")));
	for name in ["a", "b"] {
		coop.add_agent(Finisher { name, log: log.clone() });
	}
	let handle = env.register_coop(coop).unwrap();

	env.deregister_coop("c1", DeregReason::Normal).unwrap();
	assert!(handle.wait_destroyed_timeout(WAIT));
	dispatcher.shutdown();
	dispatcher.wait();
	log.lock().push("waited".to_string());

	let log = log.lock().clone();
	assert_eq!(log.len(), 4);
	assert!(log[..2].contains(&"finish:a".to_string()));
	assert!(log[..2].contains(&"finish:b".to_string()));
	assert_eq!(&log[2..], ["deregistered:c1", "waited"]);
	env.stop_and_join();
}

/// Limits `Msg` to one queued demand; `Hold` parks it so demands pile up.
struct Limited {
	log: Log,
	entered: mpsc::Sender<()>,
}

impl Agent for Limited {
	fn define(&mut self, ctx: &mut Context<'_, Self>) -> Result<(), SubscribeError> {
		ctx.limit_then_drop::<Msg>(1)?;
		ctx.subscribe_self().event(|agent, _ctx, hold: &Hold| {
			let _ = agent.entered.send(());
			hold.0.wait();
			Ok(())
		})?;
		ctx.subscribe_self().event(|agent, _ctx, msg: &Msg| {
			agent.log.lock().push(msg.0.to_string());
			Ok(())
		})
	}
}

#[test]
fn limit_drops_the_second_delivery() {
	let env = start_env();
	let log = log();
	let (entered, entered_rx) = mpsc::channel();
	let handle = env
		.register_agent_as_coop(
			"scenario-c",
			Limited {
				log: log.clone(),
				entered,
			},
		)
		.unwrap();
	let agent = handle.agents()[0].clone();
	let gate = Gate::new();
	agent.direct_mailbox().send(Hold(Arc::clone(&gate)));
	entered_rx.recv_timeout(WAIT).unwrap();

	agent.direct_mailbox().send(Msg("first"));
	agent.direct_mailbox().send(Msg("second"));
	assert_eq!(agent.in_flight::<Msg>(), Some(1));
	gate.open();

	env.deregister_coop("scenario-c", DeregReason::Normal).unwrap();
	assert!(handle.wait_destroyed_timeout(WAIT));
	assert_eq!(*log.lock(), vec!["first"]);
	assert_eq!(agent.in_flight::<Msg>(), Some(0));
	env.stop_and_join();
}

/// Logs `Msg` under its own tag; parks on `Hold`.
struct Prioritized {
	tag: &'static str,
	priority: Priority,
	log: Log,
	entered: Option<mpsc::Sender<()>>,
}

impl Agent for Prioritized {
	fn define(&mut self, ctx: &mut Context<'_, Self>) -> Result<(), SubscribeError> {
		ctx.subscribe_self().event(|agent, _ctx, hold: &Hold| {
			if let Some(entered) = &agent.entered {
				let _ = entered.send(());
			}
			hold.0.wait();
			Ok(())
		})?;
		ctx.subscribe_self().event(|agent, _ctx, _: &Msg| {
			agent.log.lock().push(agent.tag.to_string());
			Ok(())
		})
	}

	fn priority(&self) -> Priority {
		self.priority
	}
}

#[test]
fn priority_dispatcher_runs_high_lanes_first() {
	let env = start_env();
	env.add_dispatcher("prio", &DispatcherParams::PrioOneThread).unwrap();
	let log = log();
	let (entered, entered_rx) = mpsc::channel();

	let mut coop = Coop::new("scenario-d").with_binder(DispatcherBinder::named("prio"));
	let blocker = coop.add_agent(Prioritized {
		tag: "blocker",
		priority: Priority::P0,
		log: log.clone(),
		entered: Some(entered),
	});
	let low = coop.add_agent(Prioritized {
		tag: "low",
		priority: Priority::P1,
		log: log.clone(),
		entered: None,
	});
	let high = coop.add_agent(Prioritized {
		tag: "high",
		priority: Priority::P6,
		log: log.clone(),
		entered: None,
	});
	let handle = env.register_coop(coop).unwrap();

	let gate = Gate::new();
	blocker.direct_mailbox().send(Hold(Arc::clone(&gate)));
	entered_rx.recv_timeout(WAIT).unwrap();
	low.direct_mailbox().send(Msg("x"));
	high.direct_mailbox().send(Msg("x"));
	high.direct_mailbox().send(Msg("x"));
	gate.open();

	env.deregister_coop("scenario-d", DeregReason::Normal).unwrap();
	assert!(handle.wait_destroyed_timeout(WAIT));
	assert_eq!(*log.lock(), vec!["high", "high", "low"]);
	env.stop_and_join();
}

#[test]
fn handler_panic_is_contained_by_the_reaction() {
	struct Fragile {
		finished: Arc<AtomicBool>,
	}

	impl Agent for Fragile {
		fn define(&mut self, ctx: &mut Context<'_, Self>) -> Result<(), SubscribeError> {
			ctx.subscribe_self().event(|_, _, _: &Msg| panic!("handler blew up"))
		}

		fn on_finish(&mut self, _ctx: &mut Context<'_, Self>) {
			self.finished.store(true, Ordering::Release);
		}
	}

	let env = start_env();
	let finished = Arc::new(AtomicBool::new(false));
	let handle = env
		.register_agent_as_coop(
			"fragile",
			Fragile {
				finished: Arc::clone(&finished),
			},
		)
		.unwrap();
	handle.agents()[0].direct_mailbox().send(Msg("boom"));
	assert!(handle.wait_destroyed_timeout(WAIT));
	assert_eq!(handle.status(), CoopStatus::Destroyed);
	assert_eq!(handle.dereg_reason(), Some(DeregReason::UnhandledException));
	assert!(handle.agents()[0].is_awaiting_deregistration());
	assert!(finished.load(Ordering::Acquire));
	env.stop_and_join();
}
