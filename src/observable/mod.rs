//! Observable state and event plumbing.
//!
//! [`Observable`] is a single-writer cell that readers wait on or watch for
//! transitions. [`Emitter`] is the publish/subscribe side, exposed through
//! [`EventSource`].

mod emitter;
mod entry;
mod join;

pub use emitter::{Emitter, EventSource, Subscription};
pub use entry::{Changed, Observable, Transitions, Wait};
pub use join::{wait_all, Condition};
