//! GrabX Engine
//!
//! Concurrent orchestration of grab jobs: bounded parallelism, retry with
//! exponential backoff, cooperative cancellation, and ordered state-change
//! events for any number of observers.
//!
//! Architecture:
//! - Registry: the single authoritative, lock-protected store of job state
//! - Scheduler: pending queue plus a fixed pool of workers
//! - Retry policy: decides between another attempt and giving up
//! - Orchestrator: the facade front ends talk to
//!
//! What a grab actually does is supplied by the caller as a [`Fetcher`].
//!
//! # Example
//!
//! ```no_run
//! use grabx_core::{GrabFailure, Target};
//! use grabx_engine::{EngineConfig, Orchestrator, fetcher_fn};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let fetcher = fetcher_fn(|target: Target, _ctx| async move {
//!         if target.locator.is_empty() {
//!             return Err(GrabFailure::permanent("empty target"));
//!         }
//!         Ok(serde_json::json!({ "target": target.locator }))
//!     });
//!
//!     let orchestrator = Orchestrator::with_fetcher(EngineConfig::default(), fetcher)?;
//!     let id = orchestrator.submit(Target::new("https://example.com/video")).await?;
//!     orchestrator.shutdown(true).await?;
//!
//!     println!("{:?}", orchestrator.snapshot(id)?.state);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod fetcher;
mod orchestrator;
pub mod registry;
pub mod retry;
pub mod scheduler;

pub use config::{EngineConfig, QueueFullPolicy};
pub use error::{EngineError, RegistryError, Result};
pub use events::{EventBus, EventStream};
pub use fetcher::{FetchContext, Fetcher, FnFetcher, ProgressReporter, fetcher_fn};
pub use orchestrator::Orchestrator;
pub use registry::{CancelOutcome, JobRegistry, StateCounts};
pub use retry::{RetryDecision, RetryPolicy};
