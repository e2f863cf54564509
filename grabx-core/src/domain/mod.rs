//! Core domain types
//!
//! These types represent the grab jobs tracked by the engine and the events
//! it publishes about them. They are shared between the engine (which owns
//! the mutable state) and observers (which only ever see snapshots).

pub mod event;
pub mod failure;
pub mod job;
pub mod progress;
