#![forbid(unsafe_code)]

//! Realtime conversation core.
//!
//! Reconciles a streaming voice transcript and typed messages into one
//! ordered, duplicate-free turn log while a realtime transport is connected,
//! retried, paused and torn down, and relays finalized turns to a backend.

pub mod adapters;
pub mod app;
pub mod domain;
pub mod engine;
pub mod infrastructure;
pub mod ports;

#[cfg(test)]
mod testing;

pub use app::{assemble, AppController, Core, CoreDeps};
pub use domain::{ConnectionStatus, CoreConfig, CoreError, CoreEvent, Fragment, Selection, Turn};
