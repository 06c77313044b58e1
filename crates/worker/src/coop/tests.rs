use std::sync::mpsc;

use pretty_assertions::assert_eq;

use super::*;
use crate::agent::Context;
use crate::config::EnvironmentParams;
use crate::error::{DeregisterError, HandlerError, HandlerResult, RegisterError, SubscribeError};

const WAIT: Duration = Duration::from_secs(10);

type Log = Arc<Mutex<Vec<String>>>;

struct Ping(u32);

/// Logs pings and its finish hook; fails on one chosen ping.
struct Worker {
	name: &'static str,
	log: Log,
	fail_on: Option<u32>,
	reaction: ExceptionReaction,
}

impl Worker {
	fn new(name: &'static str, log: &Log) -> Self {
		Self {
			name,
			log: Arc::clone(log),
			fail_on: None,
			reaction: ExceptionReaction::Inherit,
		}
	}

	fn failing(mut self, on: u32, reaction: ExceptionReaction) -> Self {
		self.fail_on = Some(on);
		self.reaction = reaction;
		self
	}

	fn on_ping(&mut self, ping: &Ping) -> HandlerResult {
		if self.fail_on == Some(ping.0) {
			return Err(HandlerError::failed(format!("{} rejects {}", self.name, ping.0)));
		}
		self.log.lock().push(format!("{}:{}", self.name, ping.0));
		Ok(())
	}
}

impl Agent for Worker {
	fn define(&mut self, ctx: &mut Context<'_, Self>) -> Result<(), SubscribeError> {
		ctx.subscribe_self().event(|agent, _ctx, ping: &Ping| agent.on_ping(ping))
	}

	fn on_start(&mut self, _ctx: &mut Context<'_, Self>) -> HandlerResult {
		self.log.lock().push(format!("{}:start", self.name));
		Ok(())
	}

	fn on_finish(&mut self, _ctx: &mut Context<'_, Self>) {
		self.log.lock().push(format!("{}:finish", self.name));
	}

	fn exception_reaction(&self) -> ExceptionReaction {
		self.reaction
	}
}

/// Subscribes twice to the same triple.
struct Clumsy;

impl Agent for Clumsy {
	fn define(&mut self, ctx: &mut Context<'_, Self>) -> Result<(), SubscribeError> {
		ctx.subscribe_self().event(|_, _, _: &Ping| Ok(()))?;
		ctx.subscribe_self().event(|_, _, _: &Ping| Ok(()))
	}
}

struct Panicky;

impl Agent for Panicky {
	fn define(&mut self, _ctx: &mut Context<'_, Self>) -> Result<(), SubscribeError> {
		panic!("define exploded");
	}
}

struct Gate {
	open: Mutex<bool>,
	opened: Condvar,
}

impl Gate {
	fn new() -> Arc<Self> {
		Arc::new(Self {
			open: Mutex::new(false),
			opened: Condvar::new(),
		})
	}

	fn wait(&self) {
		let mut open = self.open.lock();
		while !*open {
			self.opened.wait(&mut open);
		}
	}

	fn open(&self) {
		*self.open.lock() = true;
		self.opened.notify_all();
	}
}

struct Hold(Arc<Gate>);

/// Parks its dispatcher thread on a [`Gate`] until it opens.
struct Blocker {
	entered: mpsc::Sender<()>,
}

impl Agent for Blocker {
	fn define(&mut self, ctx: &mut Context<'_, Self>) -> Result<(), SubscribeError> {
		ctx.subscribe_self().event(|agent, _ctx, hold: &Hold| {
			let _ = agent.entered.send(());
			hold.0.wait();
			Ok(())
		})
	}
}

#[derive(Default)]
struct Recording {
	events: Mutex<Vec<String>>,
}

impl CoopListener for Recording {
	fn on_registered(&self, _env: &Environment, coop: &str) {
		self.events.lock().push(format!("+{coop}"));
	}

	fn on_deregistered(&self, _env: &Environment, coop: &str, reason: DeregReason) {
		self.events.lock().push(format!("-{coop}:{reason}"));
	}
}

fn start() -> Environment {
	Environment::start(EnvironmentParams::default().exception_reaction(ExceptionReaction::DeregisterCoop)).unwrap()
}

fn log() -> Log {
	Arc::new(Mutex::new(Vec::new()))
}

#[test]
fn backlog_drains_before_finish() {
	let env = start();
	let log = log();
	let handle = env.register_agent_as_coop("drain", Worker::new("w", &log)).unwrap();
	assert_eq!(handle.status(), CoopStatus::Active);

	let agent = &handle.agents()[0];
	for n in 0..5 {
		agent.direct_mailbox().send(Ping(n));
	}
	env.deregister_coop("drain", DeregReason::Normal).unwrap();
	agent.direct_mailbox().send(Ping(99));
	assert!(handle.wait_destroyed_timeout(WAIT));

	assert_eq!(*log.lock(), vec!["w:start", "w:0", "w:1", "w:2", "w:3", "w:4", "w:finish"]);
	assert_eq!(handle.status(), CoopStatus::Destroyed);
	assert_eq!(handle.dereg_reason(), Some(DeregReason::Normal));
	assert!(agent.is_finished());
	assert_eq!(agent.subscription_count(), 0);
	assert!(env.coop("drain").is_none());
	env.stop_and_join();
}

#[test]
fn notifications_pair_up_and_parents_go_last() {
	let listener = Arc::new(Recording::default());
	let env = Environment::builder().listener(listener.clone()).start().unwrap();
	let log = log();

	let order = log.clone();
	let mut parent = Coop::new("parent").on_deregistered(move |_, name, _| order.lock().push(format!("gone:{name}")));
	parent.add_agent(Worker::new("p", &log));
	let parent = env.register_coop(parent).unwrap();

	for child in ["a", "b"] {
		let order = log.clone();
		let mut coop = Coop::new(child)
			.with_parent("parent")
			.on_deregistered(move |_, name, _| order.lock().push(format!("gone:{name}")));
		coop.add_agent(Worker::new(child, &log));
		env.register_coop(coop).unwrap();
	}
	let mut grandchild = Coop::new("a.1").with_parent("a");
	grandchild.add_agent(Worker::new("a.1", &log));
	env.register_coop(grandchild).unwrap();
	assert_eq!(env.coop_count(), 4);

	env.deregister_coop("parent", DeregReason::User(7)).unwrap();
	assert!(parent.wait_destroyed_timeout(WAIT));
	assert_eq!(env.coop_count(), 0);

	let gone: Vec<String> = log.lock().iter().filter(|l| l.starts_with("gone:")).cloned().collect();
	assert_eq!(gone.last().map(String::as_str), Some("gone:parent"));
	assert_eq!(gone.len(), 3);

	let events = listener.events.lock().clone();
	let registered = events.iter().filter(|e| e.starts_with('+')).count();
	let deregistered = events.iter().filter(|e| e.starts_with('-')).count();
	assert_eq!((registered, deregistered), (4, 4));
	assert_eq!(events.last().map(String::as_str), Some("-parent:user(7)"));
	let a = events.iter().position(|e| e.starts_with("-a:")).unwrap();
	let a1 = events.iter().position(|e| e.starts_with("-a.1:")).unwrap();
	assert!(a1 < a);
	assert!(events.contains(&"-a:parent_deregistered".to_string()));
	env.stop_and_join();
}

#[test]
fn failed_registrations_leave_nothing_behind() {
	let env = start();
	let log = log();

	env.register_agent_as_coop("taken", Worker::new("t", &log)).unwrap();
	let dup = env.register_agent_as_coop("taken", Worker::new("t2", &log));
	assert!(matches!(dup, Err(RegisterError::DuplicateCoopName(name)) if name == "taken"));

	let orphan = env.register_coop(Coop::new("orphan").with_parent("nobody"));
	assert!(matches!(orphan, Err(RegisterError::ParentNotFound(_))));

	let mut clumsy = Coop::new("clumsy");
	clumsy.add_agent(Worker::new("fine", &log));
	clumsy.add_agent(Clumsy);
	assert!(matches!(
		env.register_coop(clumsy),
		Err(RegisterError::Define {
			source: SubscribeError::AlreadySubscribed { .. },
			..
		})
	));

	let panicky = env.register_agent_as_coop("panicky", Panicky);
	assert!(matches!(panicky, Err(RegisterError::DefinePanicked { message, .. }) if message.contains("define exploded")));

	let mut unknown = Coop::new("unknown").with_binder(DispatcherBinder::named("missing"));
	unknown.add_agent(Worker::new("u", &log));
	assert!(matches!(env.register_coop(unknown), Err(RegisterError::UnknownDispatcher(name)) if name == "missing"));

	assert_eq!(env.coop_count(), 1);
	assert!(env.coop("clumsy").is_none());
	assert!(!log.lock().iter().any(|l| l.starts_with("fine")));

	// Names of rolled-back cooperations are free again.
	let handle = env.register_agent_as_coop("clumsy", Worker::new("again", &log)).unwrap();
	assert_eq!(handle.status(), CoopStatus::Active);
	env.stop_and_join();
}

#[test]
fn deregistration_errors_and_repeats() {
	let env = start();
	let log = log();
	assert_eq!(
		env.deregister_coop("ghost", DeregReason::Normal),
		Err(DeregisterError::NotFound("ghost".into()))
	);

	let (entered_tx, entered_rx) = mpsc::channel();
	let gate = Gate::new();
	let handle = env.register_agent_as_coop("busy", Blocker { entered: entered_tx }).unwrap();
	handle.agents()[0].direct_mailbox().send(Hold(Arc::clone(&gate)));
	entered_rx.recv_timeout(WAIT).unwrap();

	env.deregister_coop("busy", DeregReason::Normal).unwrap();
	assert_eq!(handle.status(), CoopStatus::Deregistering);
	env.deregister_coop("busy", DeregReason::Shutdown).unwrap();
	assert_eq!(handle.dereg_reason(), Some(DeregReason::Normal));

	let mut child = Coop::new("late-child").with_parent("busy");
	child.add_agent(Worker::new("c", &log));
	assert!(matches!(env.register_coop(child), Err(RegisterError::ParentNotActive(_))));

	gate.open();
	assert!(handle.wait_destroyed_timeout(WAIT));
	env.stop_and_join();
}

#[test]
fn deregister_coop_reaction_deregisters_the_faulty_coop() {
	let env = start();
	let log = log();
	let mut coop = Coop::new("faulty");
	coop.add_agent(Worker::new("bad", &log).failing(1, ExceptionReaction::DeregisterCoop));
	coop.add_agent(Worker::new("good", &log));
	let handle = env.register_coop(coop).unwrap();
	let agents = handle.agents();

	for n in 0..3 {
		agents[0].direct_mailbox().send(Ping(n));
	}
	assert!(handle.wait_destroyed_timeout(WAIT));
	assert_eq!(handle.dereg_reason(), Some(DeregReason::UnhandledException));
	assert!(agents[0].is_awaiting_deregistration());
	assert!(!agents[1].is_awaiting_deregistration());

	let log = log.lock();
	assert!(log.contains(&"bad:0".to_string()));
	assert!(!log.contains(&"bad:2".to_string()));
	assert!(log.contains(&"bad:finish".to_string()));
	assert!(log.contains(&"good:finish".to_string()));
	drop(log);
	env.stop_and_join();
}

#[test]
fn ignore_reaction_keeps_processing() {
	let env = start();
	let log = log();
	let handle = env
		.register_agent_as_coop("tolerant", Worker::new("w", &log).failing(1, ExceptionReaction::Ignore))
		.unwrap();
	let agent = &handle.agents()[0];
	for n in 0..3 {
		agent.direct_mailbox().send(Ping(n));
	}
	env.deregister_coop("tolerant", DeregReason::Normal).unwrap();
	assert!(handle.wait_destroyed_timeout(WAIT));
	assert_eq!(*log.lock(), vec!["w:start", "w:0", "w:2", "w:finish"]);
	assert!(!agent.is_awaiting_deregistration());
	env.stop_and_join();
}

#[test]
fn inherited_reaction_comes_from_parent_coop() {
	let env = start();
	let log = log();
	let mut parent = Coop::new("strict").with_exception_reaction(ExceptionReaction::ShutdownEnvironment);
	parent.add_agent(Worker::new("p", &log));
	env.register_coop(parent).unwrap();

	let mut child = Coop::new("inheriting").with_parent("strict");
	child.add_agent(Worker::new("c", &log).failing(0, ExceptionReaction::Inherit));
	let handle = env.register_coop(child).unwrap();
	handle.agents()[0].direct_mailbox().send(Ping(0));

	env.join();
	assert!(env.is_stopping());
	assert_eq!(env.coop_count(), 0);
	assert_eq!(handle.status(), CoopStatus::Destroyed);
}

#[test]
fn stop_deregisters_roots_and_refuses_new_coops() {
	let env = start();
	let log = log();
	let root = env.register_agent_as_coop("root", Worker::new("r", &log)).unwrap();
	let mut child = Coop::new("leaf").with_parent("root");
	child.add_agent(Worker::new("l", &log));
	let leaf = env.register_coop(child).unwrap();

	env.stop();
	env.stop();
	assert!(matches!(
		env.register_agent_as_coop("late", Worker::new("x", &log)),
		Err(RegisterError::EnvironmentStopping)
	));
	env.join();
	env.join();

	assert_eq!(root.dereg_reason(), Some(DeregReason::Shutdown));
	assert_eq!(leaf.dereg_reason(), Some(DeregReason::ParentDeregistered));
	assert_eq!(root.status(), CoopStatus::Destroyed);
	assert!(log.lock().contains(&"l:finish".to_string()));
}

#[test]
fn registered_callback_sees_active_coop() {
	let env = start();
	let (tx, rx) = mpsc::channel();
	let tx = Mutex::new(tx);
	let coop = Coop::anonymous().on_registered(move |env, name| {
		let status = env.coop(name).map(|c| c.status());
		let _ = tx.lock().send((name.to_string(), status));
	});
	let name = coop.name();
	assert!(name.starts_with("coop#"));
	let handle = env.register_coop(coop).unwrap();

	let (seen, status) = rx.recv_timeout(WAIT).unwrap();
	assert_eq!(seen, name);
	assert_eq!(handle.name(), name);
	assert_eq!(status, Some(CoopStatus::Active));
	env.stop_and_join();
}
