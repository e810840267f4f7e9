//! Pure raft transitions.
//!
//! The [`Engine`] consumes inputs (ticks, messages, proposals, advance
//! acknowledgements), mutates the node state and log view, and emits
//! [`Ready`] batches for the group-commit loop. It performs no IO and
//! sends nothing itself.

mod engine_impl;
mod ready;

#[cfg(test)]
mod transitions_test;

pub use engine_impl::Engine;
pub use ready::Ready;
