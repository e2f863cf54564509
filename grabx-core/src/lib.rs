//! GrabX Core
//!
//! Core types and abstractions for the GrabX download engine.
//!
//! This crate contains the domain types shared between the engine (which
//! schedules and tracks grabs) and front ends (which submit grabs and render
//! their state). It performs no I/O.

pub mod domain;

pub use domain::event::{ProgressUpdate, StateChange};
pub use domain::failure::{FailureKind, GrabFailure};
pub use domain::job::{InvalidTransition, Job, JobId, JobState, Payload, Target, Transition};
pub use domain::progress::{Progress, ProgressPhase};
