//! Keel runtime: the controller loop.
//!
//! Per controller, one [`watch::Multiplexer`] task per watched kind feeds a
//! shared [`queue::WorkQueue`], and a fixed pool of workers drains it into a
//! [`Reconciler`]. The queue guarantees one worker per key at a time.

#![forbid(unsafe_code)]

pub mod backoff;
pub mod config;
pub mod controller;
pub mod owner;
pub mod queue;
pub mod watch;
pub mod worker;

use keel_core::{Action, ReconcileError, Request};

pub use config::ControllerConfig;
pub use controller::{Controller, Manager};
pub use queue::WorkQueue;
pub use watch::{Keys, Mapper, Source};

/// Domain convergence logic for one primary kind.
///
/// Receives only a key and must re-read current state. Must be idempotent:
/// the same key is delivered again after retries, resyncs and overlapping events.
#[async_trait::async_trait]
pub trait Reconciler: Send + Sync + 'static {
    async fn reconcile(&self, req: &Request) -> Result<Action, ReconcileError>;
}
