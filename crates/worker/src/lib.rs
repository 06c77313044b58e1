//! Actor runtime core.
//!
//! Agents are state machines grouped into cooperations. They receive
//! messages through mailboxes: every message published to a mailbox becomes
//! one execution demand per subscribed agent, and dispatchers run those
//! demands on their worker threads, one at a time per agent. Cooperations
//! are registered and deregistered as a unit; a cooperation is destroyed only
//! once every agent has drained the demands it was sent before
//! deregistration began and every child cooperation is gone.
//!
//! Start with [`Environment::start`], build a [`Coop`] of [`Agent`]s and hand
//! it to [`Environment::register_coop`].

mod agent;
mod class;
mod config;
mod coop;
mod demand;
mod disp;
mod environment;
mod error;
mod exception;
mod ids;
mod limits;
mod mailbox;
mod message;
mod registry;
mod spawn;
mod state;
mod timer;

pub use agent::{Agent, AgentRef, Context, SubscriptionBuilder};
pub use class::TaskClass;
pub use config::{DEFAULT_DISPATCHER_NAME, EnvironmentParams, NamedDispatcher};
pub use coop::{Coop, CoopHandle, CoopListener, CoopStatus, DeregReason, DeregisteredFn, RegisteredFn};
pub use demand::ExecutionDemand;
pub use disp::{
	ActiveObjDispatcher, Dispatcher, DispatcherBinder, DispatcherParams, EventQueue, Fifo, OneThreadDispatcher, PrioOneThreadDispatcher,
	Priority, ThreadPoolDispatcher,
};
pub use environment::{Environment, EnvironmentBuilder};
pub use error::{BindError, ConfigError, DeregisterError, HandlerError, HandlerResult, RegisterError, StartError, StateError, SubscribeError, UnsubscribeError};
pub use exception::ExceptionReaction;
pub use ids::{AgentId, CoopId, MailboxId, SubscriptionId, TimerId};
pub use limits::{MAX_REDIRECT_DEPTH, OverflowAction, TransformFn};
pub use mailbox::{Mailbox, MailboxKind, SubscriberInfo};
pub use message::{Envelope, Message, MessageType};
pub use registry::DispatcherRecord;
pub use state::{State, StateId};
pub use timer::TimerHandle;
